//! Logging Module
//!
//! Sets up application logging (a non-ANSI file layer plus a console layer) and defines the
//! one-line-per-request log record emitted by the request router.

use crate::config::LoggingConfig;
use crate::{ProxyError, Result};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global tracing subscriber
pub struct LoggerManager {
    config: LoggingConfig,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Full path of the application log file
    pub fn log_file_path(&self) -> PathBuf {
        self.config.log_dir.join(&self.config.log_file)
    }

    /// Initialize application logging.
    ///
    /// An already-installed global subscriber is left in place.
    pub fn initialize(&self) -> Result<()> {
        std::fs::create_dir_all(&self.config.log_dir).map_err(|e| {
            ProxyError::IoError(format!(
                "Failed to create log directory {}: {}",
                self.config.log_dir.display(),
                e
            ))
        })?;

        let file_appender = RollingFileAppender::builder()
            .rotation(Rotation::NEVER)
            .filename_prefix(&self.config.log_file)
            .build(&self.config.log_dir)
            .map_err(|e| {
                ProxyError::IoError(format!(
                    "Failed to open log file {}: {}",
                    self.log_file_path().display(),
                    e
                ))
            })?;

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG takes precedence over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        match tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init()
        {
            Ok(()) => info!("Application logs will be written to: {:?}", self.log_file_path()),
            Err(_) => debug!("Tracing subscriber already initialized, skipping"),
        }

        Ok(())
    }
}

/// One handled request, as written to the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLogLine {
    pub method: String,
    pub path: String,
    pub status: u16,
    /// Bytes of payload the response stood for
    pub length: u64,
    pub elapsed: Duration,
    pub from_cache: bool,
    pub store_paused: bool,
    pub blocked_depfile: bool,
}

impl RequestLogLine {
    /// Write the line together with its values as structured fields
    pub fn emit(&self) {
        info!(
            method = %self.method,
            path = %self.path,
            status = self.status,
            length = self.length,
            elapsed_ms = self.elapsed.as_millis() as u64,
            from_cache = self.from_cache,
            store_paused = self.store_paused,
            blocked_depfile = self.blocked_depfile,
            "{}",
            self
        );
    }
}

impl fmt::Display for RequestLogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {}ms",
            self.method,
            self.path,
            self.status,
            self.length,
            self.elapsed.as_millis()
        )?;
        if self.from_cache {
            f.write_str(" (from cache)")?;
        }
        if self.store_paused {
            f.write_str(" (store paused)")?;
        }
        if self.blocked_depfile {
            f.write_str(" (blocked gcc depfile)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn line() -> RequestLogLine {
        RequestLogLine {
            method: "GET".to_string(),
            path: "/cas/abc".to_string(),
            status: 200,
            length: 1234,
            elapsed: Duration::from_millis(17),
            from_cache: false,
            store_paused: false,
            blocked_depfile: false,
        }
    }

    #[test]
    fn test_plain_line() {
        assert_eq!(line().to_string(), "GET /cas/abc 200 1234 17ms");
    }

    #[test]
    fn test_flags_are_appended_in_order() {
        let mut line = line();
        line.status = 404;
        line.length = 0;
        line.from_cache = true;
        line.store_paused = true;
        line.blocked_depfile = true;
        assert_eq!(
            line.to_string(),
            "GET /cas/abc 404 0 17ms (from cache) (store paused) (blocked gcc depfile)"
        );
    }

    #[test]
    fn test_initialize_creates_log_dir_and_tolerates_reinit() {
        let temp_dir = TempDir::new().unwrap();
        let config = LoggingConfig {
            log_dir: temp_dir.path().join("logs"),
            log_file: "test.log".to_string(),
            log_level: "debug".to_string(),
        };
        let manager = LoggerManager::new(config);
        manager.initialize().unwrap();
        manager.initialize().unwrap();
        assert!(temp_dir.path().join("logs").is_dir());
        assert_eq!(manager.log_file_path(), temp_dir.path().join("logs/test.log"));
    }
}
