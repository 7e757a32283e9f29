use std::{collections::HashSet, sync::Arc};

use serde_json::json;
use uuid::Uuid;

use crate::{
    error::ApiError,
    messages, persist, queue, realtime,
    types::{
        now_iso, AppState, ChatMessage, Conversation, ConversationStatus, NotificationPrefs,
        NotificationRecord, NotificationPrefsBody, Priority, SenderType,
    },
};

const NOTIFICATION_PAGE: usize = 200;

/// Fan-out for a stored message. The sender's own clients are flushed
/// first so a writer always sees its append before anyone else does.
pub async fn message_created(state: &Arc<AppState>, conversation: &Conversation, message: &ChatMessage) {
    let sender_clients = match &message.sender_id {
        Some(sender_id) => realtime::clients_for_user(state, sender_id).await,
        None => Vec::new(),
    };
    realtime::emit_to_clients(state, &sender_clients, "message.created", message).await;

    let mut others = HashSet::new();
    others.extend(realtime::watchers(state, &conversation.id).await);
    others.extend(realtime::clients_for_user(state, &conversation.owner_user_id).await);
    if let Some(admin_id) = &conversation.assigned_admin_id {
        others.extend(realtime::clients_for_user(state, admin_id).await);
    }
    others.extend(
        realtime::admin_client_entries(state)
            .await
            .into_iter()
            .map(|(client_id, _)| client_id),
    );
    for client_id in &sender_clients {
        others.remove(client_id);
    }
    let others = others.into_iter().collect::<Vec<_>>();
    realtime::emit_to_clients(state, &others, "message.created", message).await;

    unread_changed(state, conversation).await;

    if message.sender_type == SenderType::User {
        if let Some(admin_id) = &conversation.assigned_admin_id {
            if message.sender_id.as_deref() != Some(admin_id.as_str()) {
                create_notification(
                    state,
                    admin_id,
                    &conversation.id,
                    Some(&message.id),
                    "message",
                    "New message",
                    &message.content,
                )
                .await;
            }
        } else if conversation.priority == Priority::Urgent {
            // Unassigned urgent traffic pages every connected admin.
            for admin_id in connected_admin_ids(state).await {
                create_notification(
                    state,
                    &admin_id,
                    &conversation.id,
                    Some(&message.id),
                    "urgent",
                    "Urgent conversation waiting",
                    &message.content,
                )
                .await;
            }
        }
    }
}

pub async fn message_updated(state: &Arc<AppState>, conversation: &Conversation, message: &ChatMessage) {
    let mut recipients = HashSet::new();
    recipients.extend(realtime::watchers(state, &conversation.id).await);
    recipients.extend(realtime::clients_for_user(state, &conversation.owner_user_id).await);
    recipients.extend(
        realtime::admin_client_entries(state)
            .await
            .into_iter()
            .map(|(client_id, _)| client_id),
    );
    let recipients = recipients.into_iter().collect::<Vec<_>>();
    realtime::emit_to_clients(state, &recipients, "message.updated", message).await;
}

pub async fn conversation_updated(state: &Arc<AppState>, conversation: &Conversation) {
    let summary = queue::summarize(state, conversation.clone()).await;
    let mut recipients = HashSet::new();
    recipients.extend(realtime::clients_for_user(state, &conversation.owner_user_id).await);
    recipients.extend(realtime::watchers(state, &conversation.id).await);
    recipients.extend(
        realtime::admin_client_entries(state)
            .await
            .into_iter()
            .map(|(client_id, _)| client_id),
    );
    let recipients = recipients.into_iter().collect::<Vec<_>>();
    realtime::emit_to_clients(state, &recipients, "conversation.updated", &summary).await;
}

pub async fn assignment_changed(state: &Arc<AppState>, conversation: &Conversation) {
    if let Some(admin_id) = &conversation.assigned_admin_id {
        create_notification(
            state,
            admin_id,
            &conversation.id,
            None,
            "assignment",
            "Conversation assigned to you",
            &conversation.subject,
        )
        .await;
    }
}

pub async fn handoff_created(state: &Arc<AppState>, conversation: &Conversation) {
    let admin_clients = realtime::admin_client_entries(state).await;
    let client_ids = admin_clients
        .iter()
        .map(|(client_id, _)| *client_id)
        .collect::<Vec<_>>();
    let summary = queue::summarize(state, conversation.clone()).await;
    realtime::emit_to_clients(state, &client_ids, "handoff.created", &summary).await;
    for admin_id in connected_admin_ids(state).await {
        create_notification(
            state,
            &admin_id,
            &conversation.id,
            None,
            "handoff",
            "AI chat escalated to the queue",
            &conversation.subject,
        )
        .await;
    }
}

/// Derived queue counters for the triage header; pushed to admins on
/// every queue-affecting mutation.
pub async fn queue_changed(state: &Arc<AppState>) {
    let conversations = state.conversations.read().await;
    let total = conversations.len();
    let mut unassigned_open = 0usize;
    let mut urgent_open = 0usize;
    for conversation in conversations.values() {
        if conversation.status == ConversationStatus::Open {
            if conversation.assigned_admin_id.is_none() {
                unassigned_open += 1;
            }
            if conversation.priority == Priority::Urgent {
                urgent_open += 1;
            }
        }
    }
    drop(conversations);

    let client_ids = realtime::admin_client_entries(state)
        .await
        .into_iter()
        .map(|(client_id, _)| client_id)
        .collect::<Vec<_>>();
    realtime::emit_to_clients(
        state,
        &client_ids,
        "queue.changed",
        json!({
            "total": total,
            "unassignedOpenCount": unassigned_open,
            "urgentOpenCount": urgent_open
        }),
    )
    .await;
}

/// Recomputed, never stored; pushed so clients can update badges without
/// refetching.
pub async fn unread_changed(state: &Arc<AppState>, conversation: &Conversation) {
    let mut targets = vec![conversation.owner_user_id.clone()];
    if let Some(admin_id) = &conversation.assigned_admin_id {
        targets.push(admin_id.clone());
    }
    for user_id in targets {
        let clients = realtime::clients_for_user(state, &user_id).await;
        if clients.is_empty() {
            continue;
        }
        let unread = messages::unread_count(state, &conversation.id, &user_id).await;
        realtime::emit_to_clients(
            state,
            &clients,
            "conversation.unread",
            json!({ "conversationId": conversation.id, "unreadCount": unread }),
        )
        .await;
    }
}

async fn connected_admin_ids(state: &Arc<AppState>) -> Vec<String> {
    let mut seen = HashSet::new();
    realtime::admin_client_entries(state)
        .await
        .into_iter()
        .filter_map(|(_, admin_id)| seen.insert(admin_id.clone()).then_some(admin_id))
        .collect()
}

/// Stores an in-app record and pushes it per enabled channel. A client
/// session without browser permission simply never gets the browser
/// channel; that is not an error.
pub async fn create_notification(
    state: &Arc<AppState>,
    user_id: &str,
    conversation_id: &str,
    message_id: Option<&str>,
    kind: &str,
    title: &str,
    body: &str,
) -> NotificationRecord {
    let record = NotificationRecord {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        conversation_id: conversation_id.to_string(),
        message_id: message_id.map(str::to_string),
        kind: kind.to_string(),
        title: title.to_string(),
        body: body.to_string(),
        read_at: None,
        created_at: now_iso(),
    };
    {
        let mut notifications = state.notifications.write().await;
        notifications.push(record.clone());
    }
    persist::save_notification(state, &record).await;

    let prefs = prefs_for(state, user_id).await;
    let unread = unread_notification_count(state, user_id).await;
    let clients = {
        let rt = state.realtime.lock().await;
        realtime::client_ids_for_user(&rt, user_id)
            .into_iter()
            .map(|client_id| {
                let granted = rt.browser_permission.get(&client_id).copied().unwrap_or(false);
                (client_id, granted)
            })
            .collect::<Vec<_>>()
    };
    for (client_id, browser_granted) in clients {
        let payload = json!({
            "notification": record,
            "unreadCount": unread,
            "channels": {
                "toast": prefs.toast_enabled,
                "sound": prefs.sound_enabled,
                "browser": prefs.browser_enabled && browser_granted
            }
        });
        realtime::emit_to_client(state, client_id, "notification:new", payload).await;
    }
    record
}

pub async fn unread_notification_count(state: &Arc<AppState>, user_id: &str) -> usize {
    let notifications = state.notifications.read().await;
    notifications
        .iter()
        .filter(|n| n.user_id == user_id && n.read_at.is_none())
        .count()
}

pub async fn list_notifications(
    state: &Arc<AppState>,
    user_id: &str,
    unread_only: bool,
) -> (Vec<NotificationRecord>, usize) {
    let notifications = state.notifications.read().await;
    let mut list = notifications
        .iter()
        .filter(|n| n.user_id == user_id && (!unread_only || n.read_at.is_none()))
        .cloned()
        .collect::<Vec<_>>();
    let unread = notifications
        .iter()
        .filter(|n| n.user_id == user_id && n.read_at.is_none())
        .count();
    drop(notifications);
    list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    list.truncate(NOTIFICATION_PAGE);
    (list, unread)
}

pub async fn mark_notification_read(
    state: &Arc<AppState>,
    notification_id: &str,
    user_id: &str,
) -> Result<usize, ApiError> {
    let updated = {
        let mut notifications = state.notifications.write().await;
        let record = notifications
            .iter_mut()
            .find(|n| n.id == notification_id && n.user_id == user_id)
            .ok_or(ApiError::NotFound("notification"))?;
        if record.read_at.is_none() {
            record.read_at = Some(now_iso());
            Some(record.clone())
        } else {
            None
        }
    };
    if let Some(record) = updated {
        persist::save_notification(state, &record).await;
    }
    Ok(unread_notification_count(state, user_id).await)
}

pub async fn mark_all_notifications_read(state: &Arc<AppState>, user_id: &str) -> usize {
    let updated = {
        let mut notifications = state.notifications.write().await;
        let now = now_iso();
        notifications
            .iter_mut()
            .filter(|n| n.user_id == user_id && n.read_at.is_none())
            .map(|record| {
                record.read_at = Some(now.clone());
                record.clone()
            })
            .collect::<Vec<_>>()
    };
    for record in &updated {
        persist::save_notification(state, record).await;
    }
    updated.len()
}

pub async fn prefs_for(state: &Arc<AppState>, user_id: &str) -> NotificationPrefs {
    let prefs = state.prefs.read().await;
    prefs.get(user_id).copied().unwrap_or_default()
}

pub async fn update_prefs(
    state: &Arc<AppState>,
    user_id: &str,
    body: &NotificationPrefsBody,
) -> NotificationPrefs {
    let updated = {
        let mut prefs = state.prefs.write().await;
        let entry = prefs.entry(user_id.to_string()).or_default();
        if let Some(browser) = body.browser_enabled {
            entry.browser_enabled = browser;
        }
        if let Some(sound) = body.sound_enabled {
            entry.sound_enabled = sound;
        }
        if let Some(toast) = body.toast_enabled {
            entry.toast_enabled = toast;
        }
        *entry
    };
    persist::save_prefs(state, user_id, &updated).await;
    updated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handoff::NoopClassifier;
    use crate::registry;
    use crate::types::{ConversationKind, MessageType, Principal, PrincipalRole};
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn test_state() -> Arc<AppState> {
        Arc::new(AppState::new(
            Config::default(),
            None,
            Arc::new(NoopClassifier),
        ))
    }

    fn admin() -> Principal {
        Principal {
            id: "admin-1".to_string(),
            role: PrincipalRole::Admin,
        }
    }

    async fn connect_user(
        state: &Arc<AppState>,
        client_id: usize,
        user_id: &str,
        is_admin: bool,
    ) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rt = state.realtime.lock().await;
        rt.clients.insert(client_id, tx);
        if is_admin {
            rt.admin_clients.insert(client_id, user_id.to_string());
        } else {
            rt.user_clients.insert(client_id, user_id.to_string());
        }
        rx
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            if let Ok(value) = serde_json::from_str::<Value>(&raw) {
                events.push(value);
            }
        }
        events
    }

    fn events_named<'a>(events: &'a [Value], name: &str) -> Vec<&'a Value> {
        events
            .iter()
            .filter(|e| e.get("event").and_then(Value::as_str) == Some(name))
            .collect()
    }

    async fn open_conversation(state: &Arc<AppState>) -> Conversation {
        registry::create_conversation(
            state,
            "user-1",
            "Billing issue",
            Priority::Normal,
            ConversationKind::Support,
            None,
            None,
        )
        .await
        .expect("create")
    }

    #[tokio::test]
    async fn sender_gets_local_echo_and_admin_gets_the_push() {
        let state = test_state();
        let mut user_rx = connect_user(&state, 1, "user-1", false).await;
        let mut admin_rx = connect_user(&state, 2, "admin-1", true).await;
        let conversation = open_conversation(&state).await;
        drain(&mut user_rx);
        drain(&mut admin_rx);

        messages::add_message(
            &state,
            &conversation.id,
            SenderType::User,
            Some("user-1"),
            "hello there",
            MessageType::Text,
        )
        .await
        .expect("append");

        let user_events = drain(&mut user_rx);
        let admin_events = drain(&mut admin_rx);
        assert_eq!(events_named(&user_events, "message.created").len(), 1);
        assert_eq!(events_named(&admin_events, "message.created").len(), 1);
        // The local echo arrives exactly once even though the sender also
        // owns the conversation.
    }

    #[tokio::test]
    async fn assigned_admin_gets_notification_record_with_channel_gating() {
        let state = test_state();
        let mut admin_rx = connect_user(&state, 1, "admin-1", true).await;
        let conversation = open_conversation(&state).await;
        registry::assign_conversation(&state, &conversation.id, "admin-1", &admin())
            .await
            .expect("assign");
        update_prefs(
            &state,
            "admin-1",
            &NotificationPrefsBody {
                browser_enabled: Some(true),
                sound_enabled: Some(false),
                toast_enabled: None,
            },
        )
        .await;
        drain(&mut admin_rx);

        messages::add_message(
            &state,
            &conversation.id,
            SenderType::User,
            Some("user-1"),
            "are you there?",
            MessageType::Text,
        )
        .await
        .expect("append");

        let events = drain(&mut admin_rx);
        let pushes = events_named(&events, "notification:new");
        assert_eq!(pushes.len(), 1);
        let channels = &pushes[0]["data"]["channels"];
        assert_eq!(channels["toast"], Value::Bool(true));
        assert_eq!(channels["sound"], Value::Bool(false));
        // Browser pref is on but this session never granted permission.
        assert_eq!(channels["browser"], Value::Bool(false));

        let (records, unread) = list_notifications(&state, "admin-1", false).await;
        assert!(unread >= 1);
        assert!(records.iter().any(|r| r.kind == "message"));
    }

    #[tokio::test]
    async fn browser_channel_requires_granted_session_permission() {
        let state = test_state();
        let mut admin_rx = connect_user(&state, 1, "admin-1", true).await;
        {
            let mut rt = state.realtime.lock().await;
            rt.browser_permission.insert(1, true);
        }
        update_prefs(
            &state,
            "admin-1",
            &NotificationPrefsBody {
                browser_enabled: Some(true),
                sound_enabled: None,
                toast_enabled: None,
            },
        )
        .await;

        let conversation = open_conversation(&state).await;
        drain(&mut admin_rx);
        create_notification(&state, "admin-1", &conversation.id, None, "test", "t", "b").await;
        let events = drain(&mut admin_rx);
        let pushes = events_named(&events, "notification:new");
        assert_eq!(pushes[0]["data"]["channels"]["browser"], Value::Bool(true));
    }

    #[tokio::test]
    async fn urgent_unassigned_message_pages_every_connected_admin() {
        let state = test_state();
        let mut first_rx = connect_user(&state, 1, "admin-1", true).await;
        let mut second_rx = connect_user(&state, 2, "admin-2", true).await;
        let conversation = registry::create_conversation(
            &state,
            "user-1",
            "Everything is down",
            Priority::Urgent,
            ConversationKind::Support,
            None,
            None,
        )
        .await
        .expect("create");
        drain(&mut first_rx);
        drain(&mut second_rx);

        messages::add_message(
            &state,
            &conversation.id,
            SenderType::User,
            Some("user-1"),
            "production is on fire",
            MessageType::Text,
        )
        .await
        .expect("append");

        for rx in [&mut first_rx, &mut second_rx] {
            let events = drain(rx);
            let pushes = events_named(&events, "notification:new");
            assert_eq!(pushes.len(), 1);
            assert_eq!(
                pushes[0]["data"]["notification"]["kind"],
                Value::String("urgent".to_string())
            );
        }
    }

    #[tokio::test]
    async fn notification_read_is_idempotent_and_scoped_to_owner() {
        let state = test_state();
        let conversation = open_conversation(&state).await;
        let record =
            create_notification(&state, "admin-1", &conversation.id, None, "test", "t", "b").await;

        let unread = mark_notification_read(&state, &record.id, "admin-1")
            .await
            .expect("read");
        assert_eq!(unread, 0);
        let again = mark_notification_read(&state, &record.id, "admin-1")
            .await
            .expect("read again");
        assert_eq!(again, 0);

        let err = mark_notification_read(&state, &record.id, "admin-2")
            .await
            .expect_err("someone else's record");
        assert!(matches!(err, ApiError::NotFound(_)));
    }

    #[tokio::test]
    async fn queue_changed_reaches_admins_with_derived_counts() {
        let state = test_state();
        let mut admin_rx = connect_user(&state, 1, "admin-1", true).await;
        registry::create_conversation(
            &state,
            "user-1",
            "Urgent outage",
            Priority::Urgent,
            ConversationKind::Support,
            None,
            None,
        )
        .await
        .expect("create");

        let events = drain(&mut admin_rx);
        let queue_events = events_named(&events, "queue.changed");
        assert!(!queue_events.is_empty());
        let last = queue_events.last().expect("event");
        assert_eq!(last["data"]["total"], Value::Number(1.into()));
        assert_eq!(last["data"]["urgentOpenCount"], Value::Number(1.into()));
    }
}
