use std::sync::Arc;
use axum::{
    extract::{Path, State, ws::{Message, WebSocket, WebSocketUpgrade}},
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::AppState;
use crate::colab::{Session, SessionEvent};

/// WebSocket handler. The room id is taken from the path as is.
pub async fn websocket_handler(
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
) -> Response {
    info!("New WebSocket connection attempt for room {}", room_id);
    ws.on_upgrade(move |socket| handle_socket(socket, room_id, app_state))
}

/// Bind one socket to one collaboration session
async fn handle_socket(socket: WebSocket, room_id: String, app_state: Arc<AppState>) {

    // Frames produced by the session for this socket
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let session = Session::start(&app_state.relay, &room_id, app_state.session_options, out_tx);
    info!("WebSocket connection established for room {} as {} ({})", session.room_id(), session.participant(), session.color());

    // Split the socket into sender and receiver
    let (mut sender, mut receiver) = socket.split();

    // Forward everything the socket receives into the session
    let events = session.events();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if events.send(SessionEvent::Inbound(text)).is_err() {
                        break;
                    }
                }
                Message::Close(_) => break,
                _ => debug!("Ignoring non-text frame"),
            }
        }
    });

    // Forward the session's outbound frames to the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut recv_task) => send_task.abort(),
        _ = (&mut send_task) => recv_task.abort(),
    };

    session.stop().await;
    info!("WebSocket connection terminated for room {}", room_id);
}

#[cfg(test)]
mod tests {
    use crate::{config::Config, routes::create_app, AppState};
    use futures_util::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn spawn_server() -> String {
        let config = Config::default();
        let state = Arc::new(AppState::new(&config));
        let app = create_app(state, &config);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{}", addr)
    }

    async fn send(client: &mut Client, value: Value) {
        client.send(Message::Text(value.to_string().into())).await.unwrap();
    }

    /// Read frames until one of the given type arrives.
    async fn next_of_type(client: &mut Client, kind: &str) -> Value {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let msg = client.next().await.unwrap().unwrap();
                if !msg.is_text() {
                    continue;
                }
                let text = msg.to_text().unwrap();
                let value: Value = serde_json::from_str(text).unwrap();
                if value["type"] == kind {
                    return value;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_edit_reaches_other_participant_over_sockets() {
        let base = spawn_server().await;
        let (mut a, _) = connect_async(format!("{}/rooms/abc123/ws", base)).await.unwrap();
        let (mut b, _) = connect_async(format!("{}/rooms/abc123/ws", base)).await.unwrap();

        let welcome = next_of_type(&mut a, "welcome").await;
        let a_id = welcome["participantId"].as_str().unwrap().to_string();
        next_of_type(&mut a, "status").await;
        next_of_type(&mut b, "status").await;

        send(&mut a, json!({"type": "ready"})).await;
        send(&mut b, json!({"type": "ready"})).await;
        send(&mut a, json!({"type": "change", "data": "{\"shapes\":[1]}", "event": {"element": "shape", "recordUndo": true}})).await;

        let load = next_of_type(&mut b, "load").await;
        assert_eq!(load["data"], json!({"shapes": [1]}));

        send(&mut a, json!({"type": "pointer-move", "x": 10, "y": 20})).await;
        let entry = loop {
            let presence = next_of_type(&mut b, "presence").await;
            if let Some(entry) = presence["participants"].get(&a_id) {
                break entry.clone();
            }
        };
        assert_eq!(entry["x"], json!(10.0));
        assert_eq!(entry["y"], json!(20.0));
    }

    #[tokio::test]
    async fn test_closing_socket_clears_presence() {
        let base = spawn_server().await;
        let (mut a, _) = connect_async(format!("{}/rooms/leave-room/ws", base)).await.unwrap();
        let (mut b, _) = connect_async(format!("{}/rooms/leave-room/ws", base)).await.unwrap();
        let a_id = next_of_type(&mut a, "welcome").await["participantId"].as_str().unwrap().to_string();
        next_of_type(&mut a, "status").await;
        next_of_type(&mut b, "status").await;

        send(&mut a, json!({"type": "pointer-move", "x": 1, "y": 1})).await;
        loop {
            let presence = next_of_type(&mut b, "presence").await;
            if presence["participants"].get(&a_id).is_some() {
                break;
            }
        }

        a.close(None).await.unwrap();
        loop {
            let presence = next_of_type(&mut b, "presence").await;
            if presence["participants"].get(&a_id).is_none() {
                break;
            }
        }
    }
}
