use std::env;
use std::path::PathBuf;

use crate::session::manager::DEFAULT_OUTBOUND_QUEUE_DEPTH;
use cellsync_engine::DEFAULT_UNDO_LIMIT;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// HTTP port (REST API and WebSocket sessions)
    pub port: u16,
    /// Port of the raw TCP session listener
    pub session_port: u16,
    /// Directory spreadsheets are saved to; memory only when unset
    pub data_dir: Option<PathBuf>,
    /// Messages a session may have queued before it is disconnected
    pub outbound_queue_depth: usize,
    /// Undo levels kept per spreadsheet
    pub undo_limit: usize,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()?;
        let session_port = env::var("SESSION_PORT")
            .unwrap_or_else(|_| "3001".to_string())
            .parse()?;
        let data_dir = env::var("DATA_DIR")
            .ok()
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from);
        let outbound_queue_depth = match env::var("OUTBOUND_QUEUE_DEPTH") {
            Ok(depth) => depth.parse()?,
            Err(_) => DEFAULT_OUTBOUND_QUEUE_DEPTH,
        };
        let undo_limit = match env::var("UNDO_LIMIT") {
            Ok(limit) => limit.parse()?,
            Err(_) => DEFAULT_UNDO_LIMIT,
        };

        if outbound_queue_depth == 0 {
            anyhow::bail!("OUTBOUND_QUEUE_DEPTH must be at least 1");
        }

        Ok(Self {
            host,
            port,
            session_port,
            data_dir,
            outbound_queue_depth,
            undo_limit,
        })
    }
}
