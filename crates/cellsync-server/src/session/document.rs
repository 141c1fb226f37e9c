//! Per-document worker task.
//!
//! The worker owns the [`Spreadsheet`] and is the only code that touches it.
//! Everything else talks to it through a [`DocumentHandle`], so requests for one
//! document are applied strictly in arrival order.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;

use cellsync_core::{CellChange, CellCoord, CellValue};
use cellsync_engine::{EditError, Spreadsheet, SpreadsheetFile};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::{SessionError, SessionId};
use crate::protocol::ServerMessage;

/// Requests waiting for a document worker before senders have to wait
pub const COMMAND_QUEUE_DEPTH: usize = 1024;

/// Summary of an open document
#[derive(Debug, Clone, Serialize)]
pub struct DocumentInfo {
    pub name: String,
    pub sessions: usize,
    pub cells: usize,
    pub undo_depth: usize,
    pub opened_at: DateTime<Utc>,
}

/// One non-empty cell as reported by the REST API
#[derive(Debug, Clone, Serialize)]
pub struct CellEntry {
    pub cell: CellCoord,
    pub contents: String,
    pub value: CellValue,
    pub display: String,
}

type Reply<T> = oneshot::Sender<T>;

pub(crate) enum DocumentCommand {
    Request(Request),
    /// Write the document to the data directory, if configured
    Save { reply: Reply<()> },
    /// Save and stop, unless sessions joined in the meantime; replies whether
    /// the worker stopped
    Close { reply: Reply<bool> },
}

pub(crate) enum Request {
    Join {
        session: SessionId,
        username: String,
        outbound: mpsc::Sender<ServerMessage>,
        reply: Reply<()>,
    },
    Leave {
        session: SessionId,
        reply: Reply<usize>,
    },
    Edit {
        session: SessionId,
        cell: CellCoord,
        contents: String,
        reply: Reply<Result<Vec<CellChange>, EditError>>,
    },
    Undo {
        session: SessionId,
        reply: Reply<Result<Vec<CellChange>, EditError>>,
    },
    Clear {
        session: SessionId,
        reply: Reply<()>,
    },
    Info {
        reply: Reply<DocumentInfo>,
    },
    Cells {
        reply: Reply<Vec<CellEntry>>,
    },
    #[cfg(test)]
    Crash,
}

/// Cheap, cloneable address of a running document worker
#[derive(Debug, Clone)]
pub struct DocumentHandle {
    name: Arc<str>,
    tx: mpsc::Sender<DocumentCommand>,
}

impl DocumentHandle {
    /// Start a worker owning `sheet`
    pub(crate) fn spawn(sheet: Spreadsheet, data_dir: Option<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let name: Arc<str> = Arc::from(sheet.name());

        let worker = DocumentWorker {
            sheet,
            sessions: HashMap::new(),
            data_dir,
            opened_at: Utc::now(),
        };
        tokio::spawn(worker.run(rx));

        Self { name, tx }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The worker has stopped, after a close or a fault
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Both handles address the same worker
    pub fn same_document(&self, other: &DocumentHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }

    async fn send<T>(&self, command: DocumentCommand, rx: oneshot::Receiver<T>) -> Result<T, SessionError> {
        self.tx.send(command).await.map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Request) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(DocumentCommand::Request(make(reply)), rx).await
    }

    fn closed(&self) -> SessionError {
        SessionError::DocumentClosed(self.name.to_string())
    }

    /// Attach a session; it is sent a snapshot of every non-empty cell
    pub async fn join(
        &self,
        session: SessionId,
        username: &str,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<(), SessionError> {
        let username = username.to_string();
        self.request(|reply| Request::Join {
            session,
            username,
            outbound,
            reply,
        })
        .await
    }

    /// Detach a session, returning how many remain
    pub async fn leave(&self, session: SessionId) -> Result<usize, SessionError> {
        self.request(|reply| Request::Leave { session, reply }).await
    }

    pub async fn edit(
        &self,
        session: SessionId,
        cell: CellCoord,
        contents: String,
    ) -> Result<Vec<CellChange>, SessionError> {
        let result = self
            .request(|reply| Request::Edit {
                session,
                cell,
                contents,
                reply,
            })
            .await?;
        Ok(result?)
    }

    pub async fn undo(&self, session: SessionId) -> Result<Vec<CellChange>, SessionError> {
        let result = self.request(|reply| Request::Undo { session, reply }).await?;
        Ok(result?)
    }

    pub async fn clear(&self, session: SessionId) -> Result<(), SessionError> {
        self.request(|reply| Request::Clear { session, reply }).await
    }

    pub async fn info(&self) -> Result<DocumentInfo, SessionError> {
        self.request(|reply| Request::Info { reply }).await
    }

    pub async fn cells(&self) -> Result<Vec<CellEntry>, SessionError> {
        self.request(|reply| Request::Cells { reply }).await
    }

    pub async fn save(&self) -> Result<(), SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(DocumentCommand::Save { reply }, rx).await
    }

    pub async fn close(&self) -> Result<bool, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.send(DocumentCommand::Close { reply }, rx).await
    }

    #[cfg(test)]
    pub(crate) async fn crash(&self) {
        let _ = self.tx.send(DocumentCommand::Request(Request::Crash)).await;
    }
}

struct Member {
    username: String,
    outbound: mpsc::Sender<ServerMessage>,
}

struct DocumentWorker {
    sheet: Spreadsheet,
    sessions: HashMap<SessionId, Member>,
    data_dir: Option<PathBuf>,
    opened_at: DateTime<Utc>,
}

impl DocumentWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<DocumentCommand>) {
        info!(sheet = %self.sheet.name(), cells = self.sheet.len(), "document opened");

        while let Some(command) = commands.recv().await {
            match command {
                DocumentCommand::Save { reply } => {
                    self.save().await;
                    let _ = reply.send(());
                }
                DocumentCommand::Close { reply } => {
                    if !self.sessions.is_empty() {
                        let _ = reply.send(false);
                        continue;
                    }
                    self.save().await;
                    let _ = reply.send(true);
                    info!(sheet = %self.sheet.name(), "document closed");
                    return;
                }
                DocumentCommand::Request(request) => {
                    let fault = match panic::catch_unwind(AssertUnwindSafe(|| self.handle(request))) {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => e.to_string(),
                        Err(payload) => panic_message(payload.as_ref()),
                    };
                    self.fail(&fault);
                    return;
                }
            }
        }

        // Every handle is gone
        self.save().await;
    }

    /// Apply one request; an error means the document can no longer be trusted
    fn handle(&mut self, request: Request) -> Result<(), EditError> {
        match request {
            Request::Join {
                session,
                username,
                outbound,
                reply,
            } => {
                info!(sheet = %self.sheet.name(), user = %username, %session, "session joined");
                self.sessions.insert(session, Member { username, outbound });
                self.send_to(session, ServerMessage::cells(self.sheet.snapshot()));
                let _ = reply.send(());
            }
            Request::Leave { session, reply } => {
                if let Some(member) = self.sessions.remove(&session) {
                    info!(sheet = %self.sheet.name(), user = %member.username, %session, "session left");
                }
                let _ = reply.send(self.sessions.len());
            }
            Request::Edit {
                session,
                cell,
                contents,
                reply,
            } => {
                let result = self.sheet.apply_edit(cell, &contents);
                self.publish(session, &result)?;
                let _ = reply.send(result);
            }
            Request::Undo { session, reply } => {
                let result = self.sheet.undo();
                self.publish(session, &result)?;
                let _ = reply.send(result);
            }
            Request::Clear { session, reply } => {
                self.sheet.clear();
                info!(sheet = %self.sheet.name(), %session, "spreadsheet cleared");
                self.broadcast(ServerMessage::Reset);
                let _ = reply.send(());
            }
            Request::Info { reply } => {
                let _ = reply.send(DocumentInfo {
                    name: self.sheet.name().to_string(),
                    sessions: self.sessions.len(),
                    cells: self.sheet.len(),
                    undo_depth: self.sheet.undo_count(),
                    opened_at: self.opened_at,
                });
            }
            Request::Cells { reply } => {
                let cells = self
                    .sheet
                    .cells()
                    .map(|(cell, c)| CellEntry {
                        cell,
                        contents: c.contents.clone(),
                        value: c.value.clone(),
                        display: c.display_value(),
                    })
                    .collect();
                let _ = reply.send(cells);
            }
            #[cfg(test)]
            Request::Crash => panic!("injected fault"),
        }
        Ok(())
    }

    /// Report the outcome of an edit or undo
    ///
    /// Changes go to every session. An edit that changed no value is still
    /// acknowledged to its submitter. Rejections go to the submitter only.
    fn publish(&mut self, session: SessionId, result: &Result<Vec<CellChange>, EditError>) -> Result<(), EditError> {
        match result {
            Ok(changes) if changes.is_empty() => {
                self.send_to(session, ServerMessage::Cells(Vec::new()));
            }
            Ok(changes) => {
                debug!(sheet = %self.sheet.name(), %session, changed = changes.len(), "broadcasting changes");
                self.broadcast(ServerMessage::cells(changes.iter().cloned()));
            }
            Err(e) if e.is_rejection() => {
                debug!(sheet = %self.sheet.name(), %session, error = %e, "request rejected");
                self.send_to(session, ServerMessage::error(e));
            }
            Err(e) => return Err(e.clone()),
        }
        Ok(())
    }

    fn broadcast(&mut self, message: ServerMessage) {
        let sheet = self.sheet.name();
        self.sessions
            .retain(|session, member| deliver(sheet, *session, member, message.clone()));
    }

    fn send_to(&mut self, session: SessionId, message: ServerMessage) {
        let keep = match self.sessions.get(&session) {
            Some(member) => deliver(self.sheet.name(), session, member, message),
            None => return,
        };
        if !keep {
            self.sessions.remove(&session);
        }
    }

    /// Tell every session the document is gone and drop them
    fn fail(&mut self, reason: &str) {
        error!(sheet = %self.sheet.name(), reason, "document worker failed, closing document");

        let notice = ServerMessage::error(format!(
            "internal error, spreadsheet '{}' was closed",
            self.sheet.name()
        ));
        for (_, member) in self.sessions.drain() {
            let _ = member.outbound.try_send(notice.clone());
        }
    }

    async fn save(&self) {
        let Some(dir) = self.data_dir.clone() else {
            return;
        };

        let file = SpreadsheetFile::from_spreadsheet(&self.sheet);
        match tokio::task::spawn_blocking(move || file.save(&dir)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!(sheet = %self.sheet.name(), error = %e, "failed to save spreadsheet"),
            Err(e) => error!(sheet = %self.sheet.name(), error = %e, "save task failed"),
        }
    }
}

/// Queue a message for one session; false if the session must be dropped
fn deliver(sheet: &str, session: SessionId, member: &Member, message: ServerMessage) -> bool {
    match member.outbound.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(sheet, user = %member.username, %session, "outbound queue full, disconnecting session");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(sheet, user = %member.username, %session, "session already gone");
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::CellUpdate;
    use uuid::Uuid;

    fn c(a1: &str) -> CellCoord {
        CellCoord::from_a1(a1).unwrap()
    }

    async fn joined(handle: &DocumentHandle, username: &str, depth: usize) -> (SessionId, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(depth);
        handle.join(id, username, tx).await.unwrap();
        // Login snapshot
        assert!(matches!(rx.recv().await, Some(ServerMessage::Cells(_))));
        (id, rx)
    }

    #[tokio::test]
    async fn test_join_receives_snapshot() {
        let mut sheet = Spreadsheet::new("snap");
        sheet.apply_edit(c("A1"), "2").unwrap();
        sheet.apply_edit(c("B1"), "=A1*3").unwrap();
        let handle = DocumentHandle::spawn(sheet, None);

        let (tx, mut rx) = mpsc::channel(8);
        handle.join(Uuid::new_v4(), "alice", tx).await.unwrap();
        assert_eq!(
            rx.recv().await,
            Some(ServerMessage::Cells(vec![
                CellUpdate::new(c("A1"), "2"),
                CellUpdate::new(c("B1"), "6"),
            ]))
        );
    }

    #[tokio::test]
    async fn test_edit_broadcast_and_rejection() {
        let handle = DocumentHandle::spawn(Spreadsheet::new("doc"), None);
        let (alice, mut alice_rx) = joined(&handle, "alice", 8).await;
        let (bob, mut bob_rx) = joined(&handle, "bob", 8).await;

        handle.edit(alice, c("A1"), "=B1".to_string()).await.unwrap();
        let expected = ServerMessage::Cells(vec![CellUpdate::new(c("A1"), "0")]);
        assert_eq!(alice_rx.recv().await, Some(expected.clone()));
        assert_eq!(bob_rx.recv().await, Some(expected));

        let err = handle.edit(bob, c("B1"), "=A1".to_string()).await.unwrap_err();
        assert_eq!(err, SessionError::Edit(EditError::CircularReference { cell: c("B1") }));
        assert!(matches!(bob_rx.recv().await, Some(ServerMessage::Error(_))));
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_session_is_dropped() {
        let handle = DocumentHandle::spawn(Spreadsheet::new("slow"), None);
        let (alice, _alice_rx) = joined(&handle, "alice", 1).await;
        let (_bob, mut bob_rx) = joined(&handle, "bob", 64).await;

        // Alice never reads; her queue holds one message
        for i in 0..3 {
            handle.edit(alice, c("A1"), i.to_string()).await.unwrap();
        }
        assert_eq!(handle.info().await.unwrap().sessions, 1);

        for _ in 0..3 {
            assert!(matches!(bob_rx.recv().await, Some(ServerMessage::Cells(_))));
        }
    }

    #[tokio::test]
    async fn test_close_refused_while_sessions_remain() {
        let handle = DocumentHandle::spawn(Spreadsheet::new("busy"), None);
        let (alice, _rx) = joined(&handle, "alice", 8).await;

        assert_eq!(handle.close().await, Ok(false));
        assert_eq!(handle.leave(alice).await, Ok(0));
        assert_eq!(handle.close().await, Ok(true));
        assert!(matches!(handle.info().await, Err(SessionError::DocumentClosed(_))));
    }

    #[tokio::test]
    async fn test_fault_disconnects_every_session() {
        let handle = DocumentHandle::spawn(Spreadsheet::new("faulty"), None);
        let (_alice, mut alice_rx) = joined(&handle, "alice", 8).await;
        let (_bob, mut bob_rx) = joined(&handle, "bob", 8).await;

        handle.crash().await;

        for rx in [&mut alice_rx, &mut bob_rx] {
            assert!(matches!(rx.recv().await, Some(ServerMessage::Error(_))));
            assert_eq!(rx.recv().await, None);
        }
        assert!(handle.info().await.is_err());
        assert!(handle.is_closed());
    }
}
