use anyhow::{Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

const SCHEMA_VERSION: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScreensaverMode {
    /// Leave the system execution state alone.
    #[default]
    Default,
    /// Keep the display awake while the game window has focus.
    DisableWhenFocused,
    /// Keep the display awake for the whole session.
    Disable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Let the Reflex marker hook drive the FPS limiter when it is firing.
    pub reflex_fps_limiter: bool,
    /// Number of cores the process is restricted to; 0 leaves affinity alone.
    pub cpu_cores: u32,
    pub screensaver_mode: ScreensaverMode,
    pub auto_restore_on_close: bool,
    pub auto_apply_on_start: bool,
    pub auto_apply_delay_secs: u32,
    pub reflex_auto_configure: bool,
    pub vrr_polling: bool,
    pub discord_overlay_auto_hide: bool,
    pub hotkeys_enabled: bool,
    pub adhd_multi_monitor: bool,
    pub etw_enabled: bool,
    pub log_retention_count: usize,
    pub stream_logs: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reflex_fps_limiter: false,
            cpu_cores: 0,
            screensaver_mode: ScreensaverMode::Default,
            auto_restore_on_close: true,
            auto_apply_on_start: false,
            auto_apply_delay_secs: 10,
            reflex_auto_configure: false,
            vrr_polling: true,
            discord_overlay_auto_hide: false,
            hotkeys_enabled: true,
            adhd_multi_monitor: false,
            etw_enabled: true,
            log_retention_count: 10,
            stream_logs: false,
        }
    }
}

enum WriteCommand {
    Update(Settings),
    Shutdown,
}

pub struct StateManager {
    app_data_dir: Option<PathBuf>,
    state: Arc<RwLock<Settings>>,
    write_sender: Option<Sender<WriteCommand>>,
    write_thread: Option<thread::JoinHandle<()>>,
}

impl StateManager {
    /// Opens the store under `%APPDATA%\DisplayCommander`.
    pub fn new() -> Result<Self> {
        let app_data = std::env::var("APPDATA")
            .context("Failed to get APPDATA environment variable")?;
        Self::open(PathBuf::from(app_data).join("DisplayCommander"))
    }

    pub fn open(app_data_dir: impl Into<PathBuf>) -> Result<Self> {
        let app_data_dir = app_data_dir.into();
        let db_path = app_data_dir.join("state.db");

        std::fs::create_dir_all(&app_data_dir)
            .context("Failed to create app data directory")?;

        let conn = Connection::open(&db_path).context("Failed to open database")?;
        Self::init_database(&conn)?;

        let initial_state = Self::load_state(&conn)?;
        drop(conn);

        let (write_sender, write_receiver): (Sender<WriteCommand>, Receiver<WriteCommand>) = unbounded();

        let write_thread = thread::Builder::new()
            .name("dc-state-writer".to_string())
            .spawn(move || Self::write_worker(db_path, write_receiver))
            .context("Failed to spawn state writer thread")?;

        Ok(Self {
            app_data_dir: Some(app_data_dir),
            state: Arc::new(RwLock::new(initial_state)),
            write_sender: Some(write_sender),
            write_thread: Some(write_thread),
        })
    }

    /// Settings that live only for this process.
    pub fn in_memory(settings: Settings) -> Self {
        Self {
            app_data_dir: None,
            state: Arc::new(RwLock::new(settings)),
            write_sender: None,
            write_thread: None,
        }
    }

    fn init_database(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS state (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
            [],
        )?;

        let current_version: Option<i32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .ok();

        if current_version.is_none() {
            conn.execute("INSERT INTO schema_version (version) VALUES (?1)", params![SCHEMA_VERSION])?;
        }

        Ok(())
    }

    fn load_state(conn: &Connection) -> Result<Settings> {
        let json_str: Option<String> = conn
            .query_row("SELECT value FROM state WHERE key = 'settings'", [], |row| row.get(0))
            .ok();

        match json_str {
            Some(json) => serde_json::from_str(&json).context("Failed to parse settings JSON"),
            None => Ok(Settings::default()),
        }
    }

    fn write_worker(db_path: PathBuf, receiver: Receiver<WriteCommand>) {
        let conn = match Connection::open(&db_path) {
            Ok(c) => c,
            Err(e) => {
                crate::log_error!("Failed to open database in write worker: {}", e);
                return;
            }
        };

        let _ = conn.pragma_update(None, "journal_mode", "WAL");
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");

        while let Ok(cmd) = receiver.recv() {
            match cmd {
                WriteCommand::Update(state) => {
                    if let Ok(json) = serde_json::to_string(&state) {
                        if let Err(e) = conn.execute(
                            "INSERT OR REPLACE INTO state (key, value) VALUES ('settings', ?1)",
                            params![json],
                        ) {
                            crate::log_error!("Failed to write settings: {}", e);
                        }
                    }
                }
                WriteCommand::Shutdown => break,
            }
        }

        let _ = conn.pragma_update(None, "wal_checkpoint", "TRUNCATE");
    }

    pub fn app_data_dir(&self) -> Option<&Path> {
        self.app_data_dir.as_deref()
    }

    pub fn logs_dir(&self) -> Option<PathBuf> {
        self.app_data_dir.as_ref().map(|dir| dir.join("logs"))
    }

    pub fn read<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&Settings) -> R,
    {
        f(&self.state.read())
    }

    pub fn snapshot(&self) -> Settings {
        self.state.read().clone()
    }

    pub fn update<F>(&self, f: F)
    where
        F: FnOnce(&mut Settings),
    {
        let mut state = self.state.write();
        f(&mut state);
        if let Some(sender) = &self.write_sender {
            let _ = sender.send(WriteCommand::Update(state.clone()));
        }
    }
}

impl Drop for StateManager {
    fn drop(&mut self) {
        if let Some(sender) = self.write_sender.take() {
            let _ = sender.send(WriteCommand::Shutdown);
        }
        if let Some(handle) = self.write_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_survive_reopen() {
        let dir = std::env::temp_dir().join(format!("dc_state_test_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        {
            let state = StateManager::open(&dir).unwrap();
            assert_eq!(state.read(|s| s.cpu_cores), 0);
            state.update(|s| {
                s.cpu_cores = 4;
                s.screensaver_mode = ScreensaverMode::DisableWhenFocused;
            });
        }

        let state = StateManager::open(&dir).unwrap();
        assert_eq!(state.read(|s| s.cpu_cores), 4);
        assert_eq!(state.read(|s| s.screensaver_mode), ScreensaverMode::DisableWhenFocused);
        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"cpu_cores": 2}"#).unwrap();
        assert_eq!(settings.cpu_cores, 2);
        assert!(settings.auto_restore_on_close);
        assert_eq!(settings.auto_apply_delay_secs, 10);
    }
}
