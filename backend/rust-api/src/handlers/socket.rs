//! WebSocket transport for the notification hub.
//!
//! A connection starts with no rooms. `join:student`, `join:teacher` and
//! `join:admin` are answered with `room:joined` or `room:rejected`;
//! `leave:room` with `room:left`. Hub events for joined rooms are forwarded
//! as JSON text frames until either side closes.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    Extension,
};
use futures::{Sink, SinkExt, StreamExt};

use crate::models::events::{ClientCommand, HubEvent};
use crate::models::user::Identity;
use crate::services::notification_hub::{ConnectionId, NotificationHub, Room};
use crate::services::AppState;

const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(identity): Extension<Identity>,
) -> Response {
    tracing::info!(user_id = %identity.user_id, role = identity.role.as_str(), "WebSocket connection request");
    let hub = state.hub.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, hub, identity))
}

async fn handle_socket(socket: WebSocket, hub: Arc<NotificationHub>, identity: Identity) {
    let (mut sender, mut receiver) = socket.split();

    let Some((id, mut events)) = hub.connect(identity).await else {
        tracing::debug!("Hub is shut down, refusing connection");
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientCommand>(text.as_str()) {
                            Ok(command) => apply_command(&hub, id, command).await,
                            Err(e) => {
                                tracing::debug!(connection = id, error = %e, "Ignoring malformed client message");
                                continue;
                            }
                        };
                        if send_event(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        tracing::debug!(connection = id, "Client closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection = id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut sender, &event).await.is_err() {
                            tracing::debug!(connection = id, "Failed to send event, client disconnected");
                            break;
                        }
                    }
                    // Hub dropped us: shutdown or pruned.
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    hub.disconnect(id).await;
}

async fn send_event<S>(sender: &mut S, event: &HubEvent) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
{
    let json = serde_json::to_string(event).map_err(|e| {
        tracing::error!(error = %e, "Failed to serialize hub event");
    })?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Applies one client command and returns the reply to send back.
pub async fn apply_command(
    hub: &NotificationHub,
    id: ConnectionId,
    command: ClientCommand,
) -> HubEvent {
    let room = match command {
        ClientCommand::JoinStudent { user_id } => Room::Student(user_id),
        ClientCommand::JoinTeacher => Room::Teachers,
        ClientCommand::JoinAdmin => Room::Admins,
        ClientCommand::LeaveRoom { room } => {
            if let Ok(parsed) = Room::from_str(&room) {
                hub.leave(id, &parsed).await;
            }
            return HubEvent::RoomLeft { room };
        }
    };

    let name = room.name();
    match hub.join(id, room).await {
        Ok(()) => HubEvent::RoomJoined { room: name },
        Err(e) => {
            tracing::warn!(connection = id, room = %name, error = %e, "Room join rejected");
            HubEvent::RoomRejected {
                room: name,
                reason: e.to_string(),
            }
        }
    }
}
