// Copyright 2019 CoreOS, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Structured logging sink for PID 1.  Every line that leaves this process
//! goes through `log`'s facade and lands on `/dev/kmsg`, prefixed
//! `booster: ` per spec (§4.A, §6).  Never write a passphrase or key
//! through this sink (I3): callers are responsible for keeping secrets out
//! of the message they pass to `log::*!`.

use anyhow::{Context, Result};
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Mutex;

const KMSG_PATH: &str = "/dev/kmsg";

/// kmsg priority = facility << 3 | level.  We always use facility 0
/// (kern), so the priority is just the syslog level.
fn kmsg_level(level: Level) -> u8 {
    match level {
        Level::Error => 3,
        Level::Warn => 4,
        Level::Info => 6,
        Level::Debug | Level::Trace => 7,
    }
}

pub struct KmsgLogger {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl KmsgLogger {
    fn new(sink: Box<dyn Write + Send>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Open `/dev/kmsg` for writing.  Must be called after `/dev` is
    /// populated by the kernel interface bootstrap (§4.A).
    fn open_kmsg() -> Result<Box<dyn Write + Send>> {
        let f = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(KMSG_PATH)
            .with_context(|| format!("opening {}", KMSG_PATH))?;
        Ok(Box::new(f))
    }
}

impl Log for KmsgLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = format!("<{}>booster: {}\n", kmsg_level(record.level()), record.args());
        if let Ok(mut sink) = self.sink.lock() {
            // kmsg truncates writes larger than its record size; callers
            // are expected to keep messages reasonably short.
            let _ = sink.write_all(line.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut sink) = self.sink.lock() {
            let _ = sink.flush();
        }
    }
}

/// Install the kmsg-backed global logger.  `debug` corresponds to the
/// `booster.debug` cmdline flag (§6): it raises the max log level from
/// `Info` to `Debug`.
pub fn init(debug: bool) -> Result<()> {
    let logger = KmsgLogger::new(KmsgLogger::open_kmsg()?);
    log::set_max_level(if debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
    log::set_boxed_logger(Box::new(logger)).context("installing kmsg logger")?;
    Ok(())
}

/// Used by early-failure paths (§7 fatal-init) where `/dev/kmsg` may not
/// be reachable yet; falls back to stderr so the kernel's console still
/// shows something.
pub fn init_fallback_stderr(debug: bool) {
    let _ = env_logger_lite::install(debug);
}

// A tiny stderr logger, used only when /dev/kmsg can't be opened (i.e.
// before devtmpfs is even mounted).  Kept separate from KmsgLogger so the
// "every line prefixed booster: " invariant still holds on this path.
mod env_logger_lite {
    use log::{LevelFilter, Log, Metadata, Record};

    struct StderrLogger;

    impl Log for StderrLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level() <= log::max_level()
        }
        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                eprintln!("booster: {}", record.args());
            }
        }
        fn flush(&self) {}
    }

    pub fn install(debug: bool) -> Result<(), log::SetLoggerError> {
        log::set_max_level(if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        });
        log::set_boxed_logger(Box::new(StderrLogger))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        assert_eq!(kmsg_level(Level::Error), 3);
        assert_eq!(kmsg_level(Level::Warn), 4);
        assert_eq!(kmsg_level(Level::Info), 6);
        assert_eq!(kmsg_level(Level::Debug), 7);
        assert_eq!(kmsg_level(Level::Trace), 7);
    }
}
