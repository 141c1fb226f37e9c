//! Client connections, independent of how bytes reach the server.
//!
//! A transport turns its connection into a stream of decoded
//! [`ClientMessage`]s and a sink of [`ServerMessage`]s and hands both to
//! [`serve_connection`].

pub mod tcp;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::session::{Session, SessionError, SessionManager};

/// Longest a single write to a client may take before it is dropped
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Drive one client connection from login to disconnect
pub async fn serve_connection<I, O>(manager: Arc<SessionManager>, mut incoming: I, mut outgoing: O, peer: String)
where
    I: Stream<Item = Result<ClientMessage, ProtocolError>> + Unpin + Send + 'static,
    O: Sink<ServerMessage> + Unpin + Send + 'static,
{
    let (session, outbound) = match login(&manager, &mut incoming).await {
        Ok(bound) => bound,
        Err(None) => {
            debug!(peer = %peer, "connection closed before login");
            return;
        }
        Err(Some(reason)) => {
            warn!(peer = %peer, reason = %reason, "login refused");
            let _ = timeout(WRITE_TIMEOUT, outgoing.send(ServerMessage::Error(reason))).await;
            let _ = timeout(WRITE_TIMEOUT, outgoing.close()).await;
            return;
        }
    };

    let (farewell_tx, farewell_rx) = oneshot::channel();

    // Spawn task to forward queued messages to this client
    let mut send_task = tokio::spawn(write_messages(outgoing, outbound, farewell_rx));

    // Handle incoming messages from this client
    let recv_manager = manager.clone();
    let recv_session = session.clone();
    let mut recv_task =
        tokio::spawn(async move { read_messages(&recv_manager, &recv_session, incoming, farewell_tx).await });

    // Wait for either task to complete
    let writer_done = tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
            true
        }
        _ = &mut recv_task => false,
    };

    manager.disconnect(&session).await;

    // Leaving closes the outbound queue; let the writer flush what is left
    if !writer_done {
        let _ = send_task.await;
    }

    debug!(peer = %peer, user = %session.username, "connection closed");
}

/// Wait for the opening `LOGIN`
///
/// `Err(None)` means the peer went away; `Err(Some(reason))` should be sent
/// back before closing.
async fn login<I>(
    manager: &SessionManager,
    incoming: &mut I,
) -> Result<(Session, mpsc::Receiver<ServerMessage>), Option<String>>
where
    I: Stream<Item = Result<ClientMessage, ProtocolError>> + Unpin,
{
    match incoming.next().await {
        None => Err(None),
        Some(Ok(ClientMessage::Login { username, spreadsheet })) => manager
            .login(&username, &spreadsheet)
            .await
            .map_err(|e| Some(e.to_string())),
        Some(Ok(_)) => Err(Some(ProtocolError::NotLoggedIn.to_string())),
        Some(Err(e)) => Err(Some(e.to_string())),
    }
}

/// Apply requests until the client logs out, misbehaves or goes away
///
/// A protocol violation is reported through `farewell` as the last message.
async fn read_messages<I>(
    manager: &SessionManager,
    session: &Session,
    mut incoming: I,
    farewell: oneshot::Sender<ServerMessage>,
) where
    I: Stream<Item = Result<ClientMessage, ProtocolError>> + Unpin,
{
    while let Some(message) = incoming.next().await {
        let result = match message {
            Ok(ClientMessage::Edit { cell, contents }) => manager.submit_edit(session, cell, contents).await.map(drop),
            Ok(ClientMessage::Undo) => manager.undo(session).await.map(drop),
            Ok(ClientMessage::Clear) => manager.clear(session).await,
            Ok(ClientMessage::Logout) => return,
            Ok(ClientMessage::Login { .. }) => {
                let _ = farewell.send(ServerMessage::error(ProtocolError::AlreadyLoggedIn));
                return;
            }
            Err(e) => {
                warn!(user = %session.username, error = %e, "protocol error, closing connection");
                let _ = farewell.send(ServerMessage::error(e));
                return;
            }
        };

        match result {
            // Rejections were already sent to this session by the document
            Ok(()) | Err(SessionError::Edit(_)) => {}
            Err(SessionError::DocumentClosed(_)) => return,
        }
    }
}

/// Forward queued messages to the client until the queue closes
async fn write_messages<O>(
    mut outgoing: O,
    mut outbound: mpsc::Receiver<ServerMessage>,
    mut farewell: oneshot::Receiver<ServerMessage>,
) where
    O: Sink<ServerMessage> + Unpin,
{
    let mut farewell_pending = true;

    loop {
        let (message, last) = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => (message, false),
                // Queue closed: pass on a farewell if one is waiting, then stop
                None if farewell_pending => match farewell.try_recv() {
                    Ok(message) => (message, true),
                    Err(_) => break,
                },
                None => break,
            },
            result = &mut farewell, if farewell_pending => {
                farewell_pending = false;
                match result {
                    Ok(message) => (message, true),
                    Err(_) => continue,
                }
            }
        };

        if !matches!(timeout(WRITE_TIMEOUT, outgoing.send(message)).await, Ok(Ok(()))) {
            break;
        }
        if last {
            break;
        }
    }

    let _ = timeout(WRITE_TIMEOUT, outgoing.close()).await;
}
