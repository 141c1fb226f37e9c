//! Raw TCP session listener using `\n`-terminated messages.

use std::io;
use std::sync::Arc;

use futures::{sink, stream, Sink, Stream};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::serve_connection;
use crate::protocol::{ClientMessage, MessageBuffer, ProtocolError, ServerMessage, WireMessage};
use crate::session::SessionManager;

const READ_CHUNK: usize = 4096;

/// Accept session connections forever, one task per connection
pub async fn serve(listener: TcpListener, manager: Arc<SessionManager>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "failed to accept session connection");
                continue;
            }
        };

        debug!(peer = %addr, "session connection accepted");
        tokio::spawn(handle_stream(stream, manager.clone(), addr.to_string()));
    }
}

pub async fn handle_stream(stream: TcpStream, manager: Arc<SessionManager>, peer: String) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
    }

    let (reader, writer) = stream.into_split();
    serve_connection(manager, Box::pin(incoming(reader)), Box::pin(outgoing(writer)), peer).await;
}

/// Decoded messages read off the socket
///
/// Ends after the first protocol error, or when the peer closes between
/// messages. Closing mid-message is reported as [`ProtocolError::Truncated`].
fn incoming(reader: OwnedReadHalf) -> impl Stream<Item = Result<ClientMessage, ProtocolError>> {
    stream::unfold(Some((reader, MessageBuffer::new())), |state| async move {
        let (mut reader, mut buffer) = match state {
            Some(state) => state,
            None => return None,
        };

        loop {
            match buffer.next_message::<ClientMessage>() {
                Ok(Some(message)) => return Some((Ok(message), Some((reader, buffer)))),
                Ok(None) => {}
                Err(e) => return Some((Err(e), None)),
            }

            let mut chunk = [0u8; READ_CHUNK];
            match reader.read(&mut chunk).await {
                Ok(0) if buffer.is_empty() => return None,
                Ok(0) => return Some((Err(ProtocolError::Truncated), None)),
                Ok(n) => buffer.extend(&chunk[..n]),
                Err(e) => {
                    debug!(error = %e, "session read failed");
                    return None;
                }
            }
        }
    })
}

fn outgoing(writer: OwnedWriteHalf) -> impl Sink<ServerMessage, Error = io::Error> {
    sink::unfold(writer, |mut writer, message: ServerMessage| async move {
        let mut line = message.encode();
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        Ok::<_, io::Error>(writer)
    })
}
