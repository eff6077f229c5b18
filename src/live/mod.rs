//! Live run protocol over WebSocket.
//!
//! A client authenticates with service account credentials, then asks for
//! runs by endpoint. Each run streams `run_started`, trace events, Home
//! Assistant activity and finally `run_complete`. One run at a time per
//! connection.

pub mod connection;
pub mod protocol;

use axum::{
    extract::{
        Extension, State,
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

pub use connection::{Control, LiveConnection, LiveServices};
pub use protocol::{ClientMessage, Outbound, RATE_LIMIT_CLOSE_CODE, ServerMessage};

use crate::auth::ClientIp;
use crate::server::AppState;

pub async fn live_socket(
    ws: WebSocketUpgrade,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    State(state): State<AppState>,
) -> Response {
    let services = state.live_services();
    ws.on_upgrade(move |socket| handle_live_connection(socket, services, client_ip))
}

pub async fn handle_live_connection(socket: WebSocket, services: LiveServices, client_ip: String) {
    info!(client_ip = %client_ip, "New live WebSocket connection");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<Outbound>();

    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Message(message) => {
                    if let Ok(json) = serde_json::to_string(&message)
                        && ws_sender.send(Message::Text(json.into())).await.is_err()
                    {
                        break;
                    }
                }
                Outbound::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut connection = LiveConnection::new(services, client_ip, tx);
    let mut control = connection.open();

    while control == Control::Continue {
        let Some(result) = ws_receiver.next().await else {
            break;
        };
        match result {
            Ok(Message::Text(text)) => {
                control = connection.handle_text(text.as_str()).await;
            }
            Ok(Message::Close(_)) => {
                debug!("Live WebSocket close received");
                break;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Binary(_)) => {
                warn!("Received binary message on live socket, ignoring");
            }
            Err(e) => {
                error!("Live WebSocket error: {}", e);
                break;
            }
        }
    }

    // Runs in flight keep their own sender and finish on their own.
    if connection.is_busy() {
        debug!("Live connection closing with a run in flight");
    }
    drop(connection);
    if control == Control::Close {
        let _ = send_task.await;
    }
    info!("Live WebSocket connection closed");
}
