use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::{
    error::ApiError,
    notify, persist,
    types::{
        now_iso, AppState, ChatMessage, ConversationStatus, MessageType, Participant,
        ParticipantRole, Principal, SenderType,
    },
};

/// Sliding-window append counters, keyed by (conversation, sender).
pub type RateWindows = HashMap<(String, String), VecDeque<DateTime<Utc>>>;

const REDACTED_CONTENT: &str = "[message removed]";

pub async fn add_message(
    state: &Arc<AppState>,
    conversation_id: &str,
    sender_type: SenderType,
    sender_id: Option<&str>,
    content: &str,
    message_type: MessageType,
) -> Result<ChatMessage, ApiError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ApiError::Validation("content is required".to_string()));
    }
    let sender_id = sender_id.map(str::trim).filter(|value| !value.is_empty());
    if sender_type != SenderType::System && sender_id.is_none() {
        return Err(ApiError::Validation("sender id is required".to_string()));
    }

    let lock = state.locks.entry(conversation_id).await;
    let guard = lock.lock().await;

    let conversation = {
        let conversations = state.conversations.read().await;
        conversations
            .get(conversation_id)
            .cloned()
            .ok_or(ApiError::NotFound("conversation"))?
    };
    let terminal = matches!(
        conversation.status,
        ConversationStatus::Closed | ConversationStatus::Transferred
    );
    if terminal && message_type != MessageType::System {
        return Err(ApiError::ClosedConversation);
    }
    if let Some(sender) = sender_id {
        // System audit entries are exempt from the quota.
        if sender_type != SenderType::System {
            check_rate_limit(state, conversation_id, sender).await?;
        }
    }

    let message = {
        let mut messages = state.messages.write().await;
        let log = messages.entry(conversation_id.to_string()).or_default();
        let seq = log.last().map(|m| m.seq + 1).unwrap_or(0);
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            sender_type,
            sender_id: sender_id.map(str::to_string),
            content: trimmed.to_string(),
            message_type,
            read_at: None,
            deleted: false,
            seq,
            created_at: now_iso(),
        };
        log.push(message.clone());
        message
    };
    {
        let mut index = state.message_index.write().await;
        index.insert(message.id.clone(), conversation_id.to_string());
    }
    drop(guard);

    persist::save_message(state, &message).await;
    notify::message_created(state, &conversation, &message).await;
    Ok(message)
}

async fn check_rate_limit(
    state: &Arc<AppState>,
    conversation_id: &str,
    sender_id: &str,
) -> Result<(), ApiError> {
    let now = Utc::now();
    let window = Duration::seconds(state.config.rate_limit_window_secs);
    let mut windows = state.rate_windows.lock().await;
    let entry = windows
        .entry((conversation_id.to_string(), sender_id.to_string()))
        .or_default();
    while entry
        .front()
        .map(|ts| *ts + window <= now)
        .unwrap_or(false)
    {
        entry.pop_front();
    }
    if entry.len() >= state.config.rate_limit_max {
        return Err(ApiError::RateLimit);
    }
    entry.push_back(now);
    Ok(())
}

/// Stable chronological snapshot; ties on `created_at` break on the
/// per-conversation sequence number.
pub async fn list_messages(
    state: &Arc<AppState>,
    conversation_id: &str,
) -> Result<Vec<ChatMessage>, ApiError> {
    {
        let conversations = state.conversations.read().await;
        if !conversations.contains_key(conversation_id) {
            return Err(ApiError::NotFound("conversation"));
        }
    }
    let mut list = {
        let messages = state.messages.read().await;
        messages.get(conversation_id).cloned().unwrap_or_default()
    };
    list.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.seq.cmp(&b.seq))
    });
    Ok(list)
}

pub async fn find_message(
    state: &Arc<AppState>,
    message_id: &str,
) -> Result<(String, ChatMessage), ApiError> {
    let conversation_id = {
        let index = state.message_index.read().await;
        index
            .get(message_id)
            .cloned()
            .ok_or(ApiError::NotFound("message"))?
    };
    let messages = state.messages.read().await;
    let message = messages
        .get(&conversation_id)
        .and_then(|log| log.iter().find(|m| m.id == message_id))
        .cloned()
        .ok_or(ApiError::NotFound("message"))?;
    Ok((conversation_id, message))
}

/// Sets `read_at` at most once; repeated calls return the original
/// timestamp.
pub async fn mark_read(
    state: &Arc<AppState>,
    message_id: &str,
    reader: &Principal,
) -> Result<ChatMessage, ApiError> {
    let (conversation_id, _) = find_message(state, message_id).await?;
    let conversation = {
        let conversations = state.conversations.read().await;
        conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(ApiError::NotFound("conversation"))?
    };
    if !reader.is_admin() && conversation.owner_user_id != reader.id {
        return Err(ApiError::Permission(
            "not a participant of this conversation".to_string(),
        ));
    }

    let lock = state.locks.entry(&conversation_id).await;
    let guard = lock.lock().await;
    let (message, changed) = {
        let mut messages = state.messages.write().await;
        let message = messages
            .get_mut(&conversation_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .ok_or(ApiError::NotFound("message"))?;
        if message.read_at.is_none() {
            message.read_at = Some(now_iso());
            (message.clone(), true)
        } else {
            (message.clone(), false)
        }
    };
    drop(guard);

    if changed {
        persist::save_message(state, &message).await;
        notify::unread_changed(state, &conversation).await;
    }
    Ok(message)
}

/// Advances the participant cursor and receipts every unread message not
/// authored by the reader. Returns how many receipts were written.
pub async fn mark_all_read(
    state: &Arc<AppState>,
    conversation_id: &str,
    user_id: &str,
) -> Result<usize, ApiError> {
    let conversation = {
        let conversations = state.conversations.read().await;
        conversations
            .get(conversation_id)
            .cloned()
            .ok_or(ApiError::NotFound("conversation"))?
    };

    let now = now_iso();
    let lock = state.locks.entry(conversation_id).await;
    let guard = lock.lock().await;
    let updated = {
        let mut messages = state.messages.write().await;
        let mut updated = Vec::new();
        if let Some(log) = messages.get_mut(conversation_id) {
            for message in log.iter_mut() {
                let own = message.sender_id.as_deref() == Some(user_id);
                if !own && message.read_at.is_none() {
                    message.read_at = Some(now.clone());
                    updated.push(message.clone());
                }
            }
        }
        updated
    };
    {
        let mut participants = state.participants.write().await;
        let list = participants
            .entry(conversation_id.to_string())
            .or_default();
        match list.iter_mut().find(|p| p.user_id == user_id) {
            Some(participant) => participant.last_read_at = Some(now.clone()),
            None => list.push(Participant {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                role: ParticipantRole::Observer,
                last_read_at: Some(now.clone()),
            }),
        }
    }
    drop(guard);

    for message in &updated {
        persist::save_message(state, message).await;
    }
    persist::save_participants(state, conversation_id).await;
    notify::unread_changed(state, &conversation).await;
    Ok(updated.len())
}

/// Admin-only soft removal: the record stays so ordering and receipts
/// survive, only the content is redacted.
pub async fn delete_message(
    state: &Arc<AppState>,
    message_id: &str,
    actor: &Principal,
) -> Result<ChatMessage, ApiError> {
    if !actor.is_admin() {
        return Err(ApiError::Permission(
            "message removal requires an admin".to_string(),
        ));
    }
    let (conversation_id, _) = find_message(state, message_id).await?;
    let conversation = {
        let conversations = state.conversations.read().await;
        conversations
            .get(&conversation_id)
            .cloned()
            .ok_or(ApiError::NotFound("conversation"))?
    };

    let lock = state.locks.entry(&conversation_id).await;
    let guard = lock.lock().await;
    let message = {
        let mut messages = state.messages.write().await;
        let message = messages
            .get_mut(&conversation_id)
            .and_then(|log| log.iter_mut().find(|m| m.id == message_id))
            .ok_or(ApiError::NotFound("message"))?;
        message.deleted = true;
        message.content = REDACTED_CONTENT.to_string();
        message.clone()
    };
    drop(guard);

    persist::save_message(state, &message).await;
    notify::message_updated(state, &conversation, &message).await;
    Ok(message)
}

/// Derived, never stored: messages not authored by the viewer with no
/// receipt.
pub async fn unread_count(state: &Arc<AppState>, conversation_id: &str, user_id: &str) -> usize {
    let messages = state.messages.read().await;
    messages
        .get(conversation_id)
        .map(|log| {
            log.iter()
                .filter(|m| m.sender_id.as_deref() != Some(user_id) && m.read_at.is_none())
                .count()
        })
        .unwrap_or(0)
}

pub async fn upsert_participant(
    state: &Arc<AppState>,
    conversation_id: &str,
    user_id: &str,
    role: ParticipantRole,
) {
    {
        let mut participants = state.participants.write().await;
        let list = participants
            .entry(conversation_id.to_string())
            .or_default();
        if let Some(existing) = list.iter_mut().find(|p| p.user_id == user_id) {
            if role == ParticipantRole::Admin {
                existing.role = ParticipantRole::Admin;
            }
        } else {
            list.push(Participant {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                role,
                last_read_at: None,
            });
        }
    }
    persist::save_participants(state, conversation_id).await;
}

pub async fn last_message(state: &Arc<AppState>, conversation_id: &str) -> Option<ChatMessage> {
    let messages = state.messages.read().await;
    messages
        .get(conversation_id)
        .and_then(|log| log.last().cloned())
}

pub async fn message_count(state: &Arc<AppState>, conversation_id: &str) -> usize {
    let messages = state.messages.read().await;
    messages.get(conversation_id).map(Vec::len).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::handoff::NoopClassifier;
    use crate::registry;
    use crate::types::{ConversationKind, PrincipalRole, Priority};

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

    fn user() -> Principal {
        Principal {
            id: "user-1".to_string(),
            role: PrincipalRole::User,
        }
    }

    async fn conversation(state: &Arc<AppState>) -> String {
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
        .id
    }

    #[tokio::test]
    async fn append_rejects_blank_content() {
        let state = test_state();
        let id = conversation(&state).await;
        let err = add_message(&state, &id, SenderType::User, Some("user-1"), "  ", MessageType::Text)
            .await
            .expect_err("blank content");
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn append_requires_sender_for_non_system() {
        let state = test_state();
        let id = conversation(&state).await;
        let err = add_message(&state, &id, SenderType::User, None, "hi", MessageType::Text)
            .await
            .expect_err("missing sender");
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[tokio::test]
    async fn closed_conversation_rejects_non_system_but_accepts_system() {
        let state = test_state();
        let id = conversation(&state).await;
        registry::close_conversation(&state, &id, &admin())
            .await
            .expect("close");

        let err = add_message(&state, &id, SenderType::User, Some("user-1"), "hello?", MessageType::Text)
            .await
            .expect_err("write to closed");
        assert!(matches!(err, ApiError::ClosedConversation));

        add_message(&state, &id, SenderType::System, None, "audit entry", MessageType::System)
            .await
            .expect("system append still works");
    }

    #[tokio::test]
    async fn rate_limit_rejects_message_31_and_keeps_the_first_30() {
        let state = test_state();
        let id = conversation(&state).await;
        for i in 0..30 {
            add_message(
                &state,
                &id,
                SenderType::User,
                Some("user-1"),
                &format!("message {i}"),
                MessageType::Text,
            )
            .await
            .expect("within quota");
        }
        let err = add_message(&state, &id, SenderType::User, Some("user-1"), "one too many", MessageType::Text)
            .await
            .expect_err("31st message");
        assert!(matches!(err, ApiError::RateLimit));

        let user_messages = list_messages(&state, &id)
            .await
            .expect("list")
            .into_iter()
            .filter(|m| m.sender_type == SenderType::User)
            .collect::<Vec<_>>();
        assert_eq!(user_messages.len(), 30);
        for window in user_messages.windows(2) {
            assert!(window[0].seq < window[1].seq);
        }
    }

    #[tokio::test]
    async fn rate_limit_is_scoped_per_conversation_and_sender() {
        let state = test_state();
        let first = conversation(&state).await;
        let second = conversation(&state).await;
        for i in 0..30 {
            add_message(&state, &first, SenderType::User, Some("user-1"), &format!("m{i}"), MessageType::Text)
                .await
                .expect("within quota");
        }
        // Other conversation and other sender are unaffected.
        add_message(&state, &second, SenderType::User, Some("user-1"), "fresh window", MessageType::Text)
            .await
            .expect("different conversation");
        add_message(&state, &first, SenderType::Admin, Some("admin-1"), "agent reply", MessageType::Text)
            .await
            .expect("different sender");
    }

    #[tokio::test]
    async fn list_is_chronological_under_concurrent_appends() {
        let state = test_state();
        let id = conversation(&state).await;
        let mut tasks = Vec::new();
        for worker in 0..4 {
            let state = state.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                for i in 0..5 {
                    add_message(
                        &state,
                        &id,
                        SenderType::User,
                        Some(&format!("user-{worker}")),
                        &format!("w{worker} m{i}"),
                        MessageType::Text,
                    )
                    .await
                    .expect("append");
                }
            }));
        }
        for task in tasks {
            task.await.expect("task");
        }

        let list = list_messages(&state, &id).await.expect("list");
        assert_eq!(list.len(), 20);
        for window in list.windows(2) {
            assert!(window[0].created_at <= window[1].created_at);
            assert!(window[0].seq < window[1].seq);
        }
    }

    #[tokio::test]
    async fn mark_read_is_idempotent() {
        let state = test_state();
        let id = conversation(&state).await;
        let message = add_message(&state, &id, SenderType::Admin, Some("admin-1"), "hello", MessageType::Text)
            .await
            .expect("append");

        let first = mark_read(&state, &message.id, &user()).await.expect("mark");
        let stamp = first.read_at.clone().expect("read_at set");
        let second = mark_read(&state, &message.id, &user()).await.expect("mark again");
        assert_eq!(second.read_at.as_deref(), Some(stamp.as_str()));
    }

    #[tokio::test]
    async fn mark_all_read_skips_own_messages_and_advances_cursor() {
        let state = test_state();
        let id = conversation(&state).await;
        add_message(&state, &id, SenderType::Admin, Some("admin-1"), "from admin", MessageType::Text)
            .await
            .expect("append");
        add_message(&state, &id, SenderType::User, Some("user-1"), "from user", MessageType::Text)
            .await
            .expect("append");

        let updated = mark_all_read(&state, &id, "user-1").await.expect("read all");
        // The admin message gets a receipt; the user's own never does.
        assert_eq!(updated, 1);
        assert_eq!(unread_count(&state, &id, "user-1").await, 0);
        assert!(unread_count(&state, &id, "admin-1").await >= 1);

        let participants = state.participants.read().await;
        let cursor = participants
            .get(&id)
            .and_then(|list| list.iter().find(|p| p.user_id == "user-1"))
            .and_then(|p| p.last_read_at.clone());
        assert!(cursor.is_some());
    }

    #[tokio::test]
    async fn delete_requires_admin_and_redacts_in_place() {
        let state = test_state();
        let id = conversation(&state).await;
        let message = add_message(&state, &id, SenderType::User, Some("user-1"), "my card number is 1234", MessageType::Text)
            .await
            .expect("append");

        let err = delete_message(&state, &message.id, &user())
            .await
            .expect_err("non-admin delete");
        assert!(matches!(err, ApiError::Permission(_)));

        let removed = delete_message(&state, &message.id, &admin())
            .await
            .expect("admin delete");
        assert!(removed.deleted);
        assert_eq!(removed.content, REDACTED_CONTENT);

        // Record retained: ordering and ids survive.
        let list = list_messages(&state, &id).await.expect("list");
        assert!(list.iter().any(|m| m.id == message.id));
    }
}
