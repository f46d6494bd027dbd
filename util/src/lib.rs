//! Utilities shared by the kernel's resource managers that don't depend on kernel state.

#![no_std]

pub mod sync;
