use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    error::ApiError,
    messages, notify, persist,
    types::{
        now_iso, AppState, Conversation, ConversationKind, ConversationStatus, HandoffContext,
        MessageType, ParticipantRole, Principal, Priority, SenderType,
    },
};

/// Keyed lock manager. Every mutation of a single conversation serializes
/// on its entry; different conversations never contend.
#[derive(Default)]
pub struct LockTable {
    entries: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    pub async fn entry(&self, id: &str) -> Arc<Mutex<()>> {
        let mut entries = self.entries.lock().await;
        entries.entry(id.to_string()).or_default().clone()
    }
}

fn transition_allowed(from: ConversationStatus, to: ConversationStatus) -> bool {
    use ConversationStatus::*;
    matches!(
        (from, to),
        (Open, InProgress) | (Open, Closed) | (InProgress, Closed) | (InProgress, Open)
            | (Closed, Transferred)
    )
}

pub async fn create_conversation(
    state: &Arc<AppState>,
    owner_user_id: &str,
    subject: &str,
    priority: Priority,
    kind: ConversationKind,
    context: Option<HandoffContext>,
    transferred_from: Option<String>,
) -> Result<Conversation, ApiError> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err(ApiError::Validation("subject is required".to_string()));
    }
    let owner_user_id = owner_user_id.trim();
    if owner_user_id.is_empty() {
        return Err(ApiError::Validation("owner user id is required".to_string()));
    }

    let now = now_iso();
    let conversation = Conversation {
        id: Uuid::new_v4().to_string(),
        owner_user_id: owner_user_id.to_string(),
        assigned_admin_id: None,
        status: ConversationStatus::Open,
        kind,
        priority,
        subject: subject.to_string(),
        context,
        transferred_from_conversation_id: transferred_from,
        created_at: now.clone(),
        updated_at: now,
    };

    {
        let mut conversations = state.conversations.write().await;
        conversations.insert(conversation.id.clone(), conversation.clone());
    }
    {
        let mut messages = state.messages.write().await;
        messages.entry(conversation.id.clone()).or_default();
    }
    messages::upsert_participant(
        state,
        &conversation.id,
        owner_user_id,
        ParticipantRole::Participant,
    )
    .await;

    persist::save_conversation(state, &conversation).await;
    notify::conversation_updated(state, &conversation).await;
    notify::queue_changed(state).await;

    Ok(conversation)
}

pub async fn get_conversation(
    state: &Arc<AppState>,
    conversation_id: &str,
) -> Result<Conversation, ApiError> {
    let conversations = state.conversations.read().await;
    conversations
        .get(conversation_id)
        .cloned()
        .ok_or(ApiError::NotFound("conversation"))
}

pub async fn list_for_user(state: &Arc<AppState>, user_id: &str) -> Vec<Conversation> {
    let mut list = {
        let conversations = state.conversations.read().await;
        conversations
            .values()
            .filter(|conversation| conversation.owner_user_id == user_id)
            .cloned()
            .collect::<Vec<_>>()
    };
    list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    list
}

pub async fn assign_conversation(
    state: &Arc<AppState>,
    conversation_id: &str,
    admin_id: &str,
    actor: &Principal,
) -> Result<Conversation, ApiError> {
    if !actor.is_admin() {
        return Err(ApiError::Permission(
            "assignment requires an admin".to_string(),
        ));
    }
    let admin_id = admin_id.trim();
    if admin_id.is_empty() {
        return Err(ApiError::Validation("admin id is required".to_string()));
    }

    let lock = state.locks.entry(conversation_id).await;
    let guard = lock.lock().await;

    let (updated, changed) = {
        let mut conversations = state.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or(ApiError::NotFound("conversation"))?;
        match conversation.status {
            ConversationStatus::Closed | ConversationStatus::Transferred => {
                return Err(ApiError::Conflict("conversation is closed".to_string()))
            }
            ConversationStatus::Open | ConversationStatus::InProgress => {}
        }
        if conversation.assigned_admin_id.as_deref() == Some(admin_id) {
            (conversation.clone(), false)
        } else {
            conversation.assigned_admin_id = Some(admin_id.to_string());
            conversation.status = ConversationStatus::InProgress;
            conversation.updated_at = now_iso();
            (conversation.clone(), true)
        }
    };
    drop(guard);

    if !changed {
        return Ok(updated);
    }

    messages::upsert_participant(state, conversation_id, admin_id, ParticipantRole::Admin).await;
    persist::save_conversation(state, &updated).await;
    let _ = messages::add_message(
        state,
        conversation_id,
        SenderType::System,
        None,
        &format!("Conversation assigned to admin {admin_id}"),
        MessageType::System,
    )
    .await;
    notify::assignment_changed(state, &updated).await;
    notify::conversation_updated(state, &updated).await;
    notify::queue_changed(state).await;

    Ok(updated)
}

/// Applies a status edge under the conversation lock. No audit message,
/// no events; callers layer those on.
async fn apply_status(
    state: &Arc<AppState>,
    conversation_id: &str,
    to: ConversationStatus,
) -> Result<(ConversationStatus, Conversation), ApiError> {
    let lock = state.locks.entry(conversation_id).await;
    let _guard = lock.lock().await;

    let mut conversations = state.conversations.write().await;
    let conversation = conversations
        .get_mut(conversation_id)
        .ok_or(ApiError::NotFound("conversation"))?;
    let from = conversation.status;
    if !transition_allowed(from, to) {
        return Err(ApiError::InvalidTransition { from, to });
    }
    if to == ConversationStatus::Open {
        // in_progress -> open is the unassign edge.
        conversation.assigned_admin_id = None;
    }
    conversation.status = to;
    conversation.updated_at = now_iso();
    Ok((from, conversation.clone()))
}

pub async fn change_status(
    state: &Arc<AppState>,
    conversation_id: &str,
    to: ConversationStatus,
) -> Result<Conversation, ApiError> {
    if to == ConversationStatus::Transferred {
        return Err(ApiError::Conflict(
            "transferred is only set when a successor conversation is created".to_string(),
        ));
    }
    let (from, updated) = apply_status(state, conversation_id, to).await?;
    persist::save_conversation(state, &updated).await;
    let _ = messages::add_message(
        state,
        conversation_id,
        SenderType::System,
        None,
        &format!("Status changed: {from} -> {to}"),
        MessageType::System,
    )
    .await;
    notify::conversation_updated(state, &updated).await;
    notify::queue_changed(state).await;
    Ok(updated)
}

pub async fn change_priority(
    state: &Arc<AppState>,
    conversation_id: &str,
    priority: Priority,
) -> Result<Conversation, ApiError> {
    let lock = state.locks.entry(conversation_id).await;
    let guard = lock.lock().await;

    let (updated, previous) = {
        let mut conversations = state.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or(ApiError::NotFound("conversation"))?;
        match conversation.status {
            ConversationStatus::Closed | ConversationStatus::Transferred => {
                return Err(ApiError::Conflict("conversation is closed".to_string()))
            }
            ConversationStatus::Open | ConversationStatus::InProgress => {}
        }
        let previous = conversation.priority;
        if previous != priority {
            conversation.priority = priority;
            conversation.updated_at = now_iso();
        }
        (conversation.clone(), previous)
    };
    drop(guard);

    if previous == priority {
        // Explicit no-op is permitted.
        return Ok(updated);
    }

    persist::save_conversation(state, &updated).await;
    let _ = messages::add_message(
        state,
        conversation_id,
        SenderType::System,
        None,
        &format!("Priority changed: {previous} -> {priority}"),
        MessageType::System,
    )
    .await;
    notify::conversation_updated(state, &updated).await;
    notify::queue_changed(state).await;
    Ok(updated)
}

pub async fn rename_subject(
    state: &Arc<AppState>,
    conversation_id: &str,
    subject: &str,
) -> Result<Conversation, ApiError> {
    let subject = subject.trim();
    if subject.is_empty() {
        return Err(ApiError::Validation("subject is required".to_string()));
    }

    let lock = state.locks.entry(conversation_id).await;
    let guard = lock.lock().await;

    let updated = {
        let mut conversations = state.conversations.write().await;
        let conversation = conversations
            .get_mut(conversation_id)
            .ok_or(ApiError::NotFound("conversation"))?;
        match conversation.status {
            ConversationStatus::Closed | ConversationStatus::Transferred => {
                return Err(ApiError::Conflict("conversation is closed".to_string()))
            }
            ConversationStatus::Open | ConversationStatus::InProgress => {}
        }
        conversation.subject = subject.to_string();
        conversation.updated_at = now_iso();
        conversation.clone()
    };
    drop(guard);

    persist::save_conversation(state, &updated).await;
    notify::conversation_updated(state, &updated).await;
    Ok(updated)
}

pub async fn close_conversation(
    state: &Arc<AppState>,
    conversation_id: &str,
    actor: &Principal,
) -> Result<Conversation, ApiError> {
    let (_, updated) = apply_status(state, conversation_id, ConversationStatus::Closed).await?;
    persist::save_conversation(state, &updated).await;
    let _ = messages::add_message(
        state,
        conversation_id,
        SenderType::System,
        None,
        &format!("Conversation closed by {}", actor.id),
        MessageType::System,
    )
    .await;
    notify::conversation_updated(state, &updated).await;
    notify::queue_changed(state).await;
    Ok(updated)
}

/// Re-opens a closed conversation into a fresh one. The predecessor flips
/// to `transferred`; that edge exists only here.
pub async fn create_successor(
    state: &Arc<AppState>,
    closed_id: &str,
) -> Result<Conversation, ApiError> {
    let lock = state.locks.entry(closed_id).await;
    let guard = lock.lock().await;

    let predecessor = {
        let conversations = state.conversations.read().await;
        conversations
            .get(closed_id)
            .cloned()
            .ok_or(ApiError::NotFound("conversation"))?
    };
    if predecessor.status != ConversationStatus::Closed {
        return Err(ApiError::Conflict(
            "only a closed conversation can be transferred".to_string(),
        ));
    }

    let successor = create_conversation(
        state,
        &predecessor.owner_user_id,
        &predecessor.subject,
        predecessor.priority,
        ConversationKind::Support,
        None,
        Some(closed_id.to_string()),
    )
    .await?;

    let flipped = {
        let mut conversations = state.conversations.write().await;
        let conversation = conversations
            .get_mut(closed_id)
            .ok_or(ApiError::NotFound("conversation"))?;
        conversation.status = ConversationStatus::Transferred;
        // An assignee is only legal while in_progress or closed.
        conversation.assigned_admin_id = None;
        conversation.updated_at = now_iso();
        conversation.clone()
    };
    drop(guard);

    persist::save_conversation(state, &flipped).await;
    let _ = messages::add_message(
        state,
        closed_id,
        SenderType::System,
        None,
        &format!("Conversation continued in {}", successor.id),
        MessageType::System,
    )
    .await;
    let _ = messages::add_message(
        state,
        &successor.id,
        SenderType::System,
        None,
        &format!("Conversation continued from {closed_id}"),
        MessageType::System,
    )
    .await;
    notify::conversation_updated(state, &flipped).await;
    notify::queue_changed(state).await;
    Ok(successor)
}
