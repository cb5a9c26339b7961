// Session-based logging with automatic rotation, mirrored into `tracing`
use anyhow::Result;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    fn prefix(self) -> &'static str {
        match self {
            Level::Debug => "DEBUG: ",
            Level::Info => "",
            Level::Warn => "WARN: ",
            Level::Error => "ERROR: ",
        }
    }
}

pub struct SessionLogger {
    log_buffer: Arc<Mutex<Vec<String>>>,
    log_path: PathBuf,
    log_dir: PathBuf,
    retention_count: usize,
    app_name: String,
    stream_to_disk: bool,
}

impl SessionLogger {
    pub fn new(log_dir: PathBuf, app_name: &str, retention_count: usize, stream_to_disk: bool) -> Result<Self> {
        fs::create_dir_all(&log_dir)?;

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let log_filename = format!("{}_{}.log", app_name, timestamp);
        let log_path = log_dir.join(&log_filename);

        let logger = Self {
            log_buffer: Arc::new(Mutex::new(Vec::new())),
            log_path,
            log_dir,
            retention_count,
            app_name: app_name.to_string(),
            stream_to_disk,
        };

        logger.clean_old_logs()?;
        logger.write(Level::Info, &format!("=== {} Session Started ===", app_name));

        Ok(logger)
    }

    pub fn write(&self, level: Level, message: &str) {
        mirror(level, message);

        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let log_line = format!("[{}] {}{}", timestamp, level.prefix(), message);

        if self.stream_to_disk {
            let _ = self.write_line_to_file(&log_line);
        } else {
            self.log_buffer.lock().push(log_line);
        }
    }

    fn write_line_to_file(&self, line: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        writeln!(file, "{}", line)?;
        file.flush()?;
        Ok(())
    }

    fn clean_old_logs(&self) -> Result<()> {
        let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
        let prefix = format!("{}_", self.app_name);

        if let Ok(entries) = fs::read_dir(&self.log_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|s| s.to_str()) != Some("log") {
                    continue;
                }
                let matches_app = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&prefix))
                    .unwrap_or(false);
                if !matches_app {
                    continue;
                }
                if let Ok(modified) = entry.metadata().and_then(|m| m.modified()) {
                    log_files.push((path, modified));
                }
            }
        }

        // Newest first; the session being opened counts against the retention
        log_files.sort_by(|a, b| b.1.cmp(&a.1));

        for (path, _) in log_files.iter().skip(self.retention_count.saturating_sub(1)) {
            let _ = fs::remove_file(path);
        }

        Ok(())
    }

    pub fn flush_to_disk(&self) -> Result<()> {
        let mut buffer = self.log_buffer.lock();
        if buffer.is_empty() {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;

        for line in buffer.iter() {
            writeln!(file, "{}", line)?;
        }

        file.flush()?;
        buffer.clear();

        Ok(())
    }

    pub fn finalize(&self) -> Result<()> {
        self.write(Level::Info, &format!("=== {} Session Ended ===", self.app_name));
        self.flush_to_disk()
    }

    pub fn log_path(&self) -> &PathBuf {
        &self.log_path
    }
}

impl Drop for SessionLogger {
    fn drop(&mut self) {
        let _ = self.finalize();
    }
}

fn mirror(level: Level, message: &str) {
    match level {
        Level::Debug => tracing::debug!(target: "display_commander", "{}", message),
        Level::Info => tracing::info!(target: "display_commander", "{}", message),
        Level::Warn => tracing::warn!(target: "display_commander", "{}", message),
        Level::Error => tracing::error!(target: "display_commander", "{}", message),
    }
}

static LOGGER: once_cell::sync::OnceCell<SessionLogger> = once_cell::sync::OnceCell::new();

pub fn init_logger(log_dir: PathBuf, app_name: &str, retention_count: usize, stream_to_disk: bool) -> Result<()> {
    let logger = SessionLogger::new(log_dir, app_name, retention_count, stream_to_disk)?;
    LOGGER.set(logger).map_err(|_| anyhow::anyhow!("Logger already initialized"))?;
    Ok(())
}

pub fn log(level: Level, message: impl AsRef<str>) {
    match LOGGER.get() {
        Some(logger) => logger.write(level, message.as_ref()),
        None => mirror(level, message.as_ref()),
    }
}

pub fn log_debug(message: impl AsRef<str>) {
    log(Level::Debug, message);
}

pub fn log_info(message: impl AsRef<str>) {
    log(Level::Info, message);
}

pub fn log_warn(message: impl AsRef<str>) {
    log(Level::Warn, message);
}

pub fn log_error(message: impl AsRef<str>) {
    log(Level::Error, message);
}

/// Flush buffered lines without closing the session.
pub fn flush_logs() -> Result<()> {
    if let Some(logger) = LOGGER.get() {
        logger.flush_to_disk()?;
    }
    Ok(())
}

pub fn finalize_logs() -> Result<()> {
    if let Some(logger) = LOGGER.get() {
        logger.finalize()?;
    }
    Ok(())
}

pub fn get_log_path() -> Option<PathBuf> {
    LOGGER.get().map(|logger| logger.log_path().clone())
}

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        $crate::logger::log_debug(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        $crate::logger::log_info(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        $crate::logger::log_warn(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        $crate::logger::log_error(format!($($arg)*))
    };
}
