// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use crate::platform::LogSinkImpl;
use core::fmt::{Arguments, Write};
#[cfg(not(test))]
use core::{option_env, panic::PanicInfo};
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::{Once, mutex::SpinMutex};

/// Whether this is a debug build.
const DEBUG: bool = cfg!(debug_assertions);

static LOGGER: Once<Logger> = Once::new();

struct Logger {
    sink: LogSinkImpl,
}

impl Log for Logger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        writeln!(self.sink, "{}: {}", record.level(), record.args());
    }

    fn flush(&self) {
        self.sink.flush();
    }
}

/// Initialises logger.
pub fn init(sink: LogSinkImpl) -> Result<(), SetLoggerError> {
    let logger = LOGGER.call_once(|| Logger { sink });
    log::set_logger(logger)?;
    log::set_max_level(build_time_log_level());
    Ok(())
}

/// Gets a reference to the log sink, if it has been set.
#[allow(unused)]
pub fn get_log_sink() -> Option<&'static LogSinkImpl> {
    LOGGER.get().map(|logger| &logger.sink)
}

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    if let Some(sink) = get_log_sink() {
        writeln!(sink, "{}", info);
        sink.flush();
    }
    loop {
        crate::aarch64::wfe();
    }
}

/// Returns the logging [`LevelFilter`] set by the build-time environment variable `LOG_LEVEL`.
/// `LOG_LEVEL` can have the lower-case string values "off", "error", "warn", "info", "debug", or
/// "trace", corresponding to the named values of [`LevelFilter`]. If `LOG_LEVEL` is absent or has
/// some other value, this function returns `LevelFilter::Debug` for debug builds, otherwise
/// `LevelFilter::Info`.
pub const fn build_time_log_level() -> LevelFilter {
    let level = match option_env!("LOG_LEVEL") {
        Some(level) => level,
        None => "",
    };
    match level.as_bytes() {
        b"off" => LevelFilter::Off,
        b"error" => LevelFilter::Error,
        b"warn" => LevelFilter::Warn,
        b"info" => LevelFilter::Info,
        b"debug" => LevelFilter::Debug,
        b"trace" => LevelFilter::Trace,
        _ => {
            if DEBUG {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            }
        }
    }
}

/// Something to which logs can be sent.
///
/// Note that unlike `core::fmt::Write`, the `write_fmt` method on this trait takes `&self` rather
/// than `&mut self`. This means that the implementation is responsible for handling locking if
/// necessary, or can be made lock-free.
pub trait LogSink {
    /// Writes the given format arguments to the log sink.
    fn write_fmt(&self, args: Arguments);

    /// Waits until everything written so far has left the sink.
    fn flush(&self) {}
}

/// Something which can wait for its buffered output to drain.
pub trait Flush {
    /// Blocks until all pending output has been sent.
    fn flush(&mut self);
}

/// An implementation of `LogSink` that wraps around any implementation of `core::fmt::Write`.
///
/// This wraps the given writer in a spin mutex, so that a complete log line is written at once even
/// if the interrupt handler logs while the boot path holds the console.
pub struct LockedWriter<W: Write + Flush> {
    writer: SpinMutex<W>,
}

impl<W: Write + Flush> LockedWriter<W> {
    /// Creates a new `LockedWriter` wrapping the given [`Write`] implementation.
    #[allow(unused)]
    pub const fn new(writer: W) -> Self {
        Self {
            writer: SpinMutex::new(writer),
        }
    }
}

impl<W: Write + Flush> LogSink for LockedWriter<W> {
    fn write_fmt(&self, args: Arguments) {
        // Ignore errors.
        let _ = self.writer.lock().write_fmt(args);
    }

    fn flush(&self) {
        self.writer.lock().flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::String;

    #[derive(Default)]
    struct RecordingWriter {
        text: String,
        flushes: usize,
    }

    impl Write for RecordingWriter {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            self.text.push_str(s);
            Ok(())
        }
    }

    impl Flush for RecordingWriter {
        fn flush(&mut self) {
            self.flushes += 1;
        }
    }

    #[test]
    fn locked_writer_forwards_lines_and_flushes() {
        let sink = LockedWriter::new(RecordingWriter::default());
        writeln!(sink, "board rev {:x}", 0xc0_3111);
        sink.flush();

        let writer = sink.writer.lock();
        assert_eq!(writer.text, "board rev c03111\n");
        assert_eq!(writer.flushes, 1);
    }

    #[test]
    fn default_level_matches_build() {
        if option_env!("LOG_LEVEL").is_none() {
            let expected = if DEBUG {
                LevelFilter::Debug
            } else {
                LevelFilter::Info
            };
            assert_eq!(build_time_log_level(), expected);
        }
    }
}
