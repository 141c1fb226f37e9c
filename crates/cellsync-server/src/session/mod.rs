//! Sessions and the documents they are bound to.
//!
//! Each open spreadsheet is owned by a single worker task ([`document`]); the
//! [`SessionManager`] routes logins to the right worker and hands out sessions.

pub mod document;
pub mod manager;

use cellsync_engine::EditError;
use thiserror::Error;
use uuid::Uuid;

pub use document::{CellEntry, DocumentHandle, DocumentInfo};
pub use manager::{Session, SessionManager, SessionSettings};

/// Unique id of one logged-in connection
pub type SessionId = Uuid;

/// Longest accepted username or spreadsheet name
pub const MAX_NAME_LEN: usize = 64;

/// Why a login was refused
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid username '{0}'")]
    InvalidUsername(String),

    #[error("invalid spreadsheet name '{0}'")]
    InvalidSpreadsheetName(String),

    #[error("spreadsheet '{name}' cannot be opened: {reason}")]
    Unavailable { name: String, reason: String },
}

/// Failure of a request made on behalf of a logged-in session
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Edit(#[from] EditError),

    #[error("spreadsheet '{0}' is no longer open")]
    DocumentClosed(String),
}

/// Names are 1 to 64 characters from `[A-Za-z0-9_.-]` and do not start with `.`
///
/// Spreadsheet names double as file names, so this also keeps them inside the
/// data directory.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.starts_with('.')
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

pub(crate) fn validate_login(username: &str, spreadsheet: &str) -> Result<(), AuthError> {
    if !is_valid_name(username) {
        return Err(AuthError::InvalidUsername(username.to_string()));
    }
    if !is_valid_name(spreadsheet) {
        return Err(AuthError::InvalidSpreadsheetName(spreadsheet.to_string()));
    }
    Ok(())
}
