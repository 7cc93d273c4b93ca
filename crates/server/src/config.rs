//! Runtime configuration.
//!
//! Resolved once at startup from CLI flags and `CHATDOCK_*` env vars, then
//! threaded explicitly into every component, with no ambient process-wide state.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// ChatDock server configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "chatdock", about = "ChatDock — real-time visitor chat relay")]
pub struct Config {
    /// Address to listen on
    #[arg(long, env = "CHATDOCK_BIND", default_value = "127.0.0.1:4000")]
    pub bind: SocketAddr,

    /// Data directory for the database and logs. Defaults to `~/.chatdock`.
    #[arg(long, env = "CHATDOCK_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// External responder endpoint that turns a visitor turn into reply text
    #[arg(
        long,
        env = "CHATDOCK_RESPONDER_URL",
        default_value = "http://127.0.0.1:5005/reply"
    )]
    pub responder_url: String,

    /// Responder call timeout in seconds
    #[arg(long, env = "CHATDOCK_RESPONDER_TIMEOUT_SECS", default_value_t = 60)]
    pub responder_timeout_secs: u64,

    /// Sweep cadence in seconds
    #[arg(long, env = "CHATDOCK_SWEEP_INTERVAL_SECS", default_value_t = 60)]
    pub sweep_interval_secs: u64,

    /// Idle seconds before an active session is marked inactive
    #[arg(
        long,
        env = "CHATDOCK_INACTIVITY_TIMEOUT_SECS",
        default_value_t = 120,
        allow_hyphen_values = true
    )]
    pub inactivity_timeout_secs: i64,

    /// Idle seconds before an active or inactive session is closed
    #[arg(
        long,
        env = "CHATDOCK_CLOSE_AFTER_SECS",
        default_value_t = 900,
        allow_hyphen_values = true
    )]
    pub close_after_secs: i64,

    /// Maximum messages replayed to a client on connect
    #[arg(long, env = "CHATDOCK_HISTORY_PAGE_SIZE", default_value_t = 100)]
    pub history_page_size: usize,

    /// Trailing messages handed to the responder as context
    #[arg(long, env = "CHATDOCK_CONTEXT_WINDOW", default_value_t = 50)]
    pub context_window: usize,
}

impl Config {
    /// Resolved data directory: `--data-dir` / `CHATDOCK_DATA_DIR` > `~/.chatdock`.
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".chatdock")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir().join("chatdock.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }

    /// Create the data dir and its subdirectories.
    pub fn ensure_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(self.data_dir())?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }
}
