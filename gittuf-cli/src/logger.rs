//! Plain stderr logger. Verbosity comes from `GITTUF_LOG`
//! (`error|warn|info|debug|trace`), defaulting to `warn`.

use log::{Level, Log, Metadata, Record, SetLoggerError};

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!("gittuf: {}: {}", record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

pub fn init() {
    let level = std::env::var("GITTUF_LOG")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(Level::Warn);

    // A second call means the logger is already installed.
    let _ = try_init(level);
}

fn try_init(level: Level) -> Result<(), SetLoggerError> {
    let logger = Box::new(Logger { level });

    log::set_boxed_logger(logger)?;
    log::set_max_level(level.to_level_filter());
    Ok(())
}
