use std::{
    collections::{HashMap, HashSet},
    sync::{atomic::Ordering, Arc},
};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::{
    messages, queue,
    types::{AppState, EventEnvelopeIn},
};

/// Live-connection bookkeeping. Holds no business state; everything here
/// dies with the process.
#[derive(Default)]
pub struct RealtimeState {
    pub clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    pub admin_clients: HashMap<usize, String>,
    pub user_clients: HashMap<usize, String>,
    pub conversation_watchers: HashMap<String, HashSet<usize>>,
    pub watched_conversation: HashMap<usize, String>,
    /// Browser-notification permission is a per-session fact, not a
    /// per-account one.
    pub browser_permission: HashMap<usize, bool>,
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

pub fn client_ids_for_user(rt: &RealtimeState, user_id: &str) -> Vec<usize> {
    let mut ids = Vec::new();
    for (client_id, id) in &rt.user_clients {
        if id == user_id {
            ids.push(*client_id);
        }
    }
    for (client_id, id) in &rt.admin_clients {
        if id == user_id {
            ids.push(*client_id);
        }
    }
    ids
}

pub async fn clients_for_user(state: &Arc<AppState>, user_id: &str) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    client_ids_for_user(&rt, user_id)
}

pub async fn admin_client_entries(state: &Arc<AppState>) -> Vec<(usize, String)> {
    let rt = state.realtime.lock().await;
    rt.admin_clients
        .iter()
        .map(|(client_id, admin_id)| (*client_id, admin_id.clone()))
        .collect()
}

pub async fn watchers(state: &Arc<AppState>, conversation_id: &str) -> Vec<usize> {
    let rt = state.realtime.lock().await;
    rt.conversation_watchers
        .get(conversation_id)
        .map(|ids| ids.iter().copied().collect())
        .unwrap_or_default()
}

pub async fn emit_to_client<T: Serialize>(
    state: &Arc<AppState>,
    client_id: usize,
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let tx = {
        let rt = state.realtime.lock().await;
        rt.clients.get(&client_id).cloned()
    };
    if let Some(sender) = tx {
        // Dropped sends mean the client is gone; counters self-heal on
        // its next read.
        let _ = sender.send(payload);
    }
}

pub async fn emit_to_clients<T: Serialize + Clone>(
    state: &Arc<AppState>,
    client_ids: &[usize],
    event: &str,
    data: T,
) {
    let Some(payload) = event_payload(event, data) else {
        return;
    };
    let senders = {
        let rt = state.realtime.lock().await;
        client_ids
            .iter()
            .filter_map(|id| rt.clients.get(id).cloned())
            .collect::<Vec<_>>()
    };
    for sender in senders {
        let _ = sender.send(payload.clone());
    }
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn watch_conversation(state: &Arc<AppState>, client_id: usize, conversation_id: &str) {
    let mut rt = state.realtime.lock().await;
    if let Some(previous) = rt
        .watched_conversation
        .insert(client_id, conversation_id.to_string())
    {
        if let Some(set) = rt.conversation_watchers.get_mut(&previous) {
            set.remove(&client_id);
        }
    }
    rt.conversation_watchers
        .entry(conversation_id.to_string())
        .or_default()
        .insert(client_id);
}

async fn send_history(state: &Arc<AppState>, client_id: usize, conversation_id: &str) {
    if let Ok(log) = messages::list_messages(state, conversation_id).await {
        emit_to_client(
            state,
            client_id,
            "history",
            json!({ "conversationId": conversation_id, "messages": log }),
        )
        .await;
    }
}

async fn send_admin_snapshot(state: &Arc<AppState>, client_id: usize) {
    let (summaries, total) = match queue::list_for_queue(state, &queue::QueueQuery::default()).await
    {
        Ok(result) => result,
        Err(_) => return,
    };
    emit_to_client(
        state,
        client_id,
        "conversation.list",
        json!({ "conversations": summaries, "total": total }),
    )
    .await;
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let client_id = state.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        match envelope.event.as_str() {
            "admin:join" => {
                let Some(user_id) = envelope.data.get("userId").and_then(Value::as_str) else {
                    emit_to_client(
                        &state,
                        client_id,
                        "error",
                        json!({ "message": "userId is required" }),
                    )
                    .await;
                    continue;
                };
                {
                    let mut rt = state.realtime.lock().await;
                    rt.admin_clients.insert(client_id, user_id.to_string());
                }
                send_admin_snapshot(&state, client_id).await;
            }
            "user:join" => {
                let Some(user_id) = envelope.data.get("userId").and_then(Value::as_str) else {
                    emit_to_client(
                        &state,
                        client_id,
                        "error",
                        json!({ "message": "userId is required" }),
                    )
                    .await;
                    continue;
                };
                {
                    let mut rt = state.realtime.lock().await;
                    rt.user_clients.insert(client_id, user_id.to_string());
                }
                if let Some(conversation_id) =
                    envelope.data.get("conversationId").and_then(Value::as_str)
                {
                    watch_conversation(&state, client_id, conversation_id).await;
                    send_history(&state, client_id, conversation_id).await;
                }
            }
            "watch:conversation" => {
                if let Some(conversation_id) =
                    envelope.data.get("conversationId").and_then(Value::as_str)
                {
                    watch_conversation(&state, client_id, conversation_id).await;
                    send_history(&state, client_id, conversation_id).await;
                }
            }
            "browser:permission" => {
                // A denial only disables the channel for this session.
                let granted = envelope
                    .data
                    .get("granted")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let mut rt = state.realtime.lock().await;
                rt.browser_permission.insert(client_id, granted);
            }
            _ => {}
        }
    }

    {
        let mut rt = state.realtime.lock().await;
        rt.clients.remove(&client_id);
        rt.admin_clients.remove(&client_id);
        rt.user_clients.remove(&client_id);
        rt.browser_permission.remove(&client_id);
        if let Some(previous) = rt.watched_conversation.remove(&client_id) {
            if let Some(set) = rt.conversation_watchers.get_mut(&previous) {
                set.remove(&client_id);
            }
        }
        for watchers in rt.conversation_watchers.values_mut() {
            watchers.remove(&client_id);
        }
    }

    send_task.abort();
}
