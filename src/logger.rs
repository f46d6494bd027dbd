//! A logging implementation

use core::fmt;

use util::sync::SpinLock;

static LOGGER: Logger = Logger;

/// Where formatted log lines go.
///
/// The kernel points this at its console; anything that can take a line of text works.
pub type LogSink = fn(fmt::Arguments<'_>);

static SINK: SpinLock<Option<LogSink>> = SpinLock::new(None);

/// Initialize the logger.
///
/// This function should only be called once. Later calls only change the sink and level.
pub fn init_logger(level: log::LevelFilter, sink: LogSink) {
    *SINK.lock() = Some(sink);
    match log::set_logger(&LOGGER) {
        Ok(()) => (),
        Err(e) => {
            log::error!("Error initializing logger: {e}");
        }
    }
    log::set_max_level(level);
}

/// The logger to use.
struct Logger;

impl log::Log for Logger {
    fn log(&self, record: &log::Record) {
        // Copy the sink out so we don't hold the lock while writing.
        let Some(sink) = *SINK.lock() else {
            return;
        };
        sink(format_args!(
            "{level:>8 } - {source} - {args}",
            level = record.level(),
            source = SourceLogWriter {
                file: record.file(),
                line: record.line()
            },
            args = record.args(),
        ));
    }

    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn flush(&self) {
        // We write everything out immediately.
    }
}

struct SourceLogWriter<'a> {
    file: Option<&'a str>,
    line: Option<u32>,
}
impl fmt::Display for SourceLogWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self {
                file,
                line: Some(line),
            } => write!(f, "{}:{line}", file.unwrap_or("<unknown>")),
            Self {
                file: Some(file),
                line: None,
            } => f.write_str(file),
            Self {
                file: None,
                line: None,
            } => f.write_str("<unknown loc>"),
        }
    }
}
