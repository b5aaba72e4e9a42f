use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use drawbridge_core::{ClientMessage, Engine, ServerMessage};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(engine): State<Engine>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, engine))
}

async fn handle_socket(socket: WebSocket, session_id: String, engine: Engine) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    let subscriber_id = match engine.subscribe(&session_id, tx).await {
        Ok(subscriber_id) => subscriber_id,
        Err(err) => {
            warn!(session = %session_id, %err, "rejecting subscriber");
            let _ = sink.close().await;
            return;
        }
    };
    debug!(session = %session_id, subscriber = %subscriber_id, "subscriber connected");

    // Drain the engine's queue into the socket, one text frame per message.
    let forwarder = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(frame) => {
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                Err(err) => warn!(%err, "failed to encode outgoing frame"),
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(session = %session_id, subscriber = %subscriber_id, %err, "socket error");
                break;
            }
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Update { elements, base_version }) => {
                    if let Err(err) = engine
                        .handle_update(&session_id, subscriber_id, elements, base_version)
                        .await
                    {
                        warn!(session = %session_id, %err, "update failed");
                    }
                }
                Err(err) => {
                    debug!(session = %session_id, %err, "ignoring unparseable frame");
                }
            },
            Message::Close(_) => break,
            // Pings are answered by the protocol layer; everything else is
            // noise on this endpoint.
            _ => {}
        }
    }

    engine.unsubscribe(&session_id, subscriber_id).await;
    forwarder.abort();
    debug!(session = %session_id, subscriber = %subscriber_id, "subscriber disconnected");
}
