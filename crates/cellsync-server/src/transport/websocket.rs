use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures::{future, SinkExt, StreamExt};

use super::serve_connection;
use crate::protocol::{ClientMessage, ServerMessage, WireMessage};
use crate::AppState;

/// WebSocket handler for sessions, one protocol message per frame
async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();

    let incoming = receiver
        .take_while(|frame| future::ready(matches!(frame, Ok(message) if !matches!(message, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(ClientMessage::decode_frame(text.as_bytes())),
                Ok(Message::Binary(data)) => Some(ClientMessage::decode_frame(&data)),
                // Ping and pong are answered by axum
                _ => None,
            })
        });

    let outgoing = sender.with(|message: ServerMessage| future::ready(Ok::<_, axum::Error>(Message::Text(message.encode()))));

    serve_connection(
        state.sessions.clone(),
        Box::pin(incoming),
        Box::pin(outgoing),
        "websocket".to_string(),
    )
    .await;
}

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}
