use std::collections::HashMap;
use std::path::PathBuf;

use cellsync_core::{CellChange, CellCoord};
use cellsync_engine::{persistence, Spreadsheet, DEFAULT_UNDO_LIMIT};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{error, info};
use uuid::Uuid;

use super::document::{CellEntry, DocumentHandle, DocumentInfo};
use super::{validate_login, AuthError, SessionError, SessionId};
use crate::config::Config;
use crate::protocol::ServerMessage;

/// Default depth of each session's outbound queue
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Knobs for documents opened by a [`SessionManager`]
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Where documents are loaded from and saved to; memory only when unset
    pub data_dir: Option<PathBuf>,
    /// Messages a session may have queued before it is disconnected
    pub outbound_queue_depth: usize,
    pub undo_limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            outbound_queue_depth: DEFAULT_OUTBOUND_QUEUE_DEPTH,
            undo_limit: DEFAULT_UNDO_LIMIT,
        }
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        Self {
            data_dir: config.data_dir.clone(),
            outbound_queue_depth: config.outbound_queue_depth,
            undo_limit: config.undo_limit,
        }
    }
}

/// A logged-in user bound to one spreadsheet
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub username: String,
    pub spreadsheet: String,
    pub connected_at: DateTime<Utc>,
    document: DocumentHandle,
}

/// Owns every open document and binds sessions to them
///
/// There is at most one open instance per spreadsheet name. The first login
/// for a name opens it (from disk when a saved copy exists) and the last
/// session to leave closes it.
pub struct SessionManager {
    documents: RwLock<HashMap<String, DocumentHandle>>,
    settings: SessionSettings,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            settings,
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Bind a new session to `spreadsheet`, opening it if needed
    ///
    /// Returns the session and the receiving end of its outbound queue. The
    /// first message on the queue is a snapshot of the spreadsheet.
    pub async fn login(
        &self,
        username: &str,
        spreadsheet: &str,
    ) -> Result<(Session, mpsc::Receiver<ServerMessage>), AuthError> {
        validate_login(username, spreadsheet)?;

        let id = Uuid::new_v4();
        let (outbound, outbound_rx) = mpsc::channel(self.settings.outbound_queue_depth.max(1));

        // First try to join an open instance
        let joined = {
            let documents = self.documents.read().await;
            match documents.get(spreadsheet) {
                Some(handle) => match handle.join(id, username, outbound.clone()).await {
                    Ok(()) => Some(handle.clone()),
                    Err(_) => None,
                },
                None => None,
            }
        };

        let document = match joined {
            Some(handle) => handle,
            None => {
                let mut documents = self.documents.write().await;
                // Double-check after acquiring write lock
                let handle = match documents.get(spreadsheet) {
                    Some(handle) if !handle.is_closed() => handle.clone(),
                    _ => {
                        let handle = self.open(spreadsheet).await?;
                        documents.insert(spreadsheet.to_string(), handle.clone());
                        handle
                    }
                };

                handle
                    .join(id, username, outbound)
                    .await
                    .map_err(|e| AuthError::Unavailable {
                        name: spreadsheet.to_string(),
                        reason: e.to_string(),
                    })?;
                handle
            }
        };

        info!(user = %username, sheet = %spreadsheet, session = %id, "login");

        let session = Session {
            id,
            username: username.to_string(),
            spreadsheet: spreadsheet.to_string(),
            connected_at: Utc::now(),
            document,
        };
        Ok((session, outbound_rx))
    }

    async fn open(&self, name: &str) -> Result<DocumentHandle, AuthError> {
        let undo_limit = self.settings.undo_limit;

        let sheet = match &self.settings.data_dir {
            Some(dir) => {
                let dir = dir.clone();
                let owned = name.to_string();
                let loaded = tokio::task::spawn_blocking(move || persistence::load(&dir, &owned, undo_limit)).await;

                match loaded {
                    Ok(Ok(Some(sheet))) => sheet,
                    Ok(Ok(None)) => Spreadsheet::with_undo_limit(name, undo_limit),
                    Ok(Err(e)) => {
                        error!(sheet = %name, error = %e, "failed to load spreadsheet");
                        return Err(AuthError::Unavailable {
                            name: name.to_string(),
                            reason: e.to_string(),
                        });
                    }
                    Err(e) => {
                        return Err(AuthError::Unavailable {
                            name: name.to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
            None => Spreadsheet::with_undo_limit(name, undo_limit),
        };

        Ok(DocumentHandle::spawn(sheet, self.settings.data_dir.clone()))
    }

    pub async fn submit_edit(
        &self,
        session: &Session,
        cell: CellCoord,
        contents: impl Into<String>,
    ) -> Result<Vec<CellChange>, SessionError> {
        session.document.edit(session.id, cell, contents.into()).await
    }

    pub async fn undo(&self, session: &Session) -> Result<Vec<CellChange>, SessionError> {
        session.document.undo(session.id).await
    }

    pub async fn clear(&self, session: &Session) -> Result<(), SessionError> {
        session.document.clear(session.id).await
    }

    /// Detach a session; the last one out closes (and saves) its document
    pub async fn disconnect(&self, session: &Session) {
        match session.document.leave(session.id).await {
            Ok(0) => self.close_if_idle(&session.document).await,
            Ok(_) => {}
            Err(_) => self.forget(&session.document).await,
        }

        info!(user = %session.username, sheet = %session.spreadsheet, session = %session.id, "logout");
    }

    async fn close_if_idle(&self, handle: &DocumentHandle) {
        let mut documents = self.documents.write().await;
        if !is_current(&documents, handle) {
            return;
        }

        // Logins wait on the write lock, so a refusal here means a session
        // joined between our leave and this close
        match handle.close().await {
            Ok(false) => {}
            Ok(true) | Err(_) => {
                documents.remove(handle.name());
            }
        }
    }

    /// Drop a document whose worker has already stopped
    async fn forget(&self, handle: &DocumentHandle) {
        let mut documents = self.documents.write().await;
        if is_current(&documents, handle) && handle.is_closed() {
            documents.remove(handle.name());
        }
    }

    /// Every open document, sorted by name
    pub async fn open_documents(&self) -> Vec<DocumentInfo> {
        let handles: Vec<DocumentHandle> = self.documents.read().await.values().cloned().collect();

        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(info) = handle.info().await {
                infos.push(info);
            }
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Non-empty cells of an open document, or `None` if it is not open
    pub async fn document_cells(&self, name: &str) -> Option<Vec<CellEntry>> {
        let handle = self.documents.read().await.get(name).cloned()?;
        handle.cells().await.ok()
    }

    /// Save every open document, used on shutdown
    pub async fn save_all(&self) {
        let handles: Vec<DocumentHandle> = self.documents.read().await.values().cloned().collect();
        for handle in handles {
            let _ = handle.save().await;
        }
    }
}

fn is_current(documents: &HashMap<String, DocumentHandle>, handle: &DocumentHandle) -> bool {
    documents
        .get(handle.name())
        .is_some_and(|current| current.same_document(handle))
}
