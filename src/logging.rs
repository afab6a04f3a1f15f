//! Logging configuration for the wallet core
//!
//! Uses log4rs with appenders:
//! 1. ConsoleAppender - stdout output
//! 2. RollingFileAppender - log files with rotation
//! 3. EventLogAppender - forwards node daemon diagnostics to the event sink

use crate::events::{SharedEventSink, WalletEvent};
use crate::node::manager::DAEMON_LOG_TARGET;
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::rolling_file::policy::compound::roll::fixed_window::FixedWindowRoller;
use log4rs::append::rolling_file::policy::compound::trigger::size::SizeTrigger;
use log4rs::append::rolling_file::policy::compound::CompoundPolicy;
use log4rs::append::rolling_file::RollingFileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use std::path::PathBuf;
use std::sync::OnceLock;

const LOG_FILE_SIZE: u64 = 20 * 1024 * 1024;
const LOG_FILE_COUNT: u32 = 10;

static EVENT_SINK: OnceLock<SharedEventSink> = OnceLock::new();

/// Register where forwarded log records go. Only the first call wins.
pub fn set_event_sink(sink: SharedEventSink) {
    match EVENT_SINK.set(sink) {
        Ok(_) => log::debug!("Event sink set for EventLogAppender"),
        Err(_) => log::warn!("Event sink already set"),
    }
}

/// Level name forwarded for a record, `None` for records the UI skips
fn forwarded_level(record: &log::Record) -> Option<&'static str> {
    if !record.target().starts_with(DAEMON_LOG_TARGET) {
        return None;
    }
    match record.level() {
        log::Level::Error => Some("error"),
        log::Level::Warn => Some("warn"),
        _ => None,
    }
}

/// Custom log4rs appender that emits daemon warnings and errors as events
#[derive(Debug)]
pub struct EventLogAppender;

impl log4rs::append::Append for EventLogAppender {
    fn append(&self, record: &log::Record) -> anyhow::Result<()> {
        let Some(level) = forwarded_level(record) else {
            return Ok(());
        };

        if let Some(sink) = EVENT_SINK.get() {
            sink.emit(WalletEvent::Log {
                level: level.to_string(),
                message: format!("{}", record.args()),
            });
        }
        Ok(())
    }

    fn flush(&self) {}
}

/// Initialize log4rs with console, rolling file and event appenders
///
/// # Log File Configuration
/// - File: `{log_dir}/wallet.1.log`
/// - Max size: 20 MB per file
/// - Max count: 10 files (rotation)
/// - Pattern: `{timestamp} [{level}] {target} - {message}`
pub fn init_logger(log_dir: PathBuf) -> anyhow::Result<log4rs::Handle> {
    let console = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new("{d(%H:%M:%S)} [{l}] {t} - {m}{n}")))
        .build();

    std::fs::create_dir_all(&log_dir)?;

    let log_file = log_dir.join("wallet.1.log");
    let log_pattern = log_dir.join("wallet.{}.log");
    let log_pattern = log_pattern
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("log directory {} is not valid UTF-8", log_dir.display()))?;

    let roller = FixedWindowRoller::builder()
        .base(1)
        .build(log_pattern, LOG_FILE_COUNT)?;
    let trigger = SizeTrigger::new(LOG_FILE_SIZE);
    let policy = CompoundPolicy::new(Box::new(trigger), Box::new(roller));

    let logfile = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(
            "{d(%Y-%m-%d %H:%M:%S)} [{l}] {t} - {m}{n}",
        )))
        .build(log_file, Box::new(policy))?;

    let config = Config::builder()
        .appender(Appender::builder().build("console", Box::new(console)))
        .appender(Appender::builder().build("logfile", Box::new(logfile)))
        .appender(Appender::builder().build("events", Box::new(EventLogAppender)))
        .build(
            Root::builder()
                .appender("console")
                .appender("logfile")
                .appender("events")
                .build(LevelFilter::Info),
        )?;

    Ok(log4rs::init_config(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn level_for(target: &str, level: log::Level) -> Option<&'static str> {
        forwarded_level(
            &log::Record::builder()
                .target(target)
                .level(level)
                .args(format_args!("line"))
                .build(),
        )
    }

    #[test]
    fn test_only_daemon_warnings_are_forwarded() {
        assert_eq!(level_for(DAEMON_LOG_TARGET, log::Level::Warn), Some("warn"));
        assert_eq!(level_for(DAEMON_LOG_TARGET, log::Level::Error), Some("error"));
        assert_eq!(level_for(DAEMON_LOG_TARGET, log::Level::Info), None);
        assert_eq!(level_for("hushwallet_core::node::session", log::Level::Error), None);
    }
}
