use std::sync::Arc;

use sqlx::{PgPool, Row};

use crate::types::{
    AppState, ChatMessage, Conversation, ConversationKind, ConversationStatus, HandoffContext,
    MessageType, NotificationPrefs, NotificationRecord, Participant, ParticipantRole, Priority,
    SenderType,
};

/// The in-memory maps are the source of truth; Postgres is a write-through
/// replica. A replica write that fails is logged and swallowed so chat
/// traffic never stalls on storage.
pub async fn save_conversation(state: &Arc<AppState>, conversation: &Conversation) {
    let Some(pool) = &state.db else { return };
    let context = conversation
        .context
        .as_ref()
        .and_then(|context| serde_json::to_string(context).ok());
    let result = sqlx::query(
        r#"
        INSERT INTO conversations (
            id, owner_user_id, assigned_admin_id, status, kind, priority, subject,
            context, transferred_from_conversation_id, created_at, updated_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11)
        ON CONFLICT (id) DO UPDATE SET
            assigned_admin_id = EXCLUDED.assigned_admin_id,
            status = EXCLUDED.status,
            priority = EXCLUDED.priority,
            subject = EXCLUDED.subject,
            updated_at = EXCLUDED.updated_at
        "#,
    )
    .bind(&conversation.id)
    .bind(&conversation.owner_user_id)
    .bind(&conversation.assigned_admin_id)
    .bind(conversation.status.as_str())
    .bind(conversation.kind.as_str())
    .bind(conversation.priority.as_str())
    .bind(&conversation.subject)
    .bind(context)
    .bind(&conversation.transferred_from_conversation_id)
    .bind(&conversation.created_at)
    .bind(&conversation.updated_at)
    .execute(pool)
    .await;
    if let Err(err) = result {
        tracing::warn!(error = %err, conversation = %conversation.id, "conversation write-through failed");
    }
}

pub async fn save_message(state: &Arc<AppState>, message: &ChatMessage) {
    let Some(pool) = &state.db else { return };
    let result = sqlx::query(
        r#"
        INSERT INTO messages (
            id, conversation_id, sender_type, sender_id, content, message_type,
            read_at, deleted, seq, created_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)
        ON CONFLICT (id) DO UPDATE SET
            content = EXCLUDED.content,
            read_at = EXCLUDED.read_at,
            deleted = EXCLUDED.deleted
        "#,
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(message.sender_type.as_str())
    .bind(&message.sender_id)
    .bind(&message.content)
    .bind(message.message_type.as_str())
    .bind(&message.read_at)
    .bind(message.deleted)
    .bind(message.seq as i64)
    .bind(&message.created_at)
    .execute(pool)
    .await;
    if let Err(err) = result {
        tracing::warn!(error = %err, message = %message.id, "message write-through failed");
    }
}

pub async fn save_participants(state: &Arc<AppState>, conversation_id: &str) {
    let Some(pool) = &state.db else { return };
    let list = {
        let participants = state.participants.read().await;
        participants.get(conversation_id).cloned().unwrap_or_default()
    };
    for participant in list {
        let result = sqlx::query(
            r#"
            INSERT INTO participants (conversation_id, user_id, role, last_read_at)
            VALUES ($1,$2,$3,$4)
            ON CONFLICT (conversation_id, user_id) DO UPDATE SET
                role = EXCLUDED.role,
                last_read_at = EXCLUDED.last_read_at
            "#,
        )
        .bind(&participant.conversation_id)
        .bind(&participant.user_id)
        .bind(participant.role.as_str())
        .bind(&participant.last_read_at)
        .execute(pool)
        .await;
        if let Err(err) = result {
            tracing::warn!(error = %err, conversation = %conversation_id, "participant write-through failed");
        }
    }
}

pub async fn save_notification(state: &Arc<AppState>, record: &NotificationRecord) {
    let Some(pool) = &state.db else { return };
    let result = sqlx::query(
        r#"
        INSERT INTO notifications (
            id, user_id, conversation_id, message_id, kind, title, body, read_at, created_at
        ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)
        ON CONFLICT (id) DO UPDATE SET read_at = EXCLUDED.read_at
        "#,
    )
    .bind(&record.id)
    .bind(&record.user_id)
    .bind(&record.conversation_id)
    .bind(&record.message_id)
    .bind(&record.kind)
    .bind(&record.title)
    .bind(&record.body)
    .bind(&record.read_at)
    .bind(&record.created_at)
    .execute(pool)
    .await;
    if let Err(err) = result {
        tracing::warn!(error = %err, notification = %record.id, "notification write-through failed");
    }
}

pub async fn save_prefs(state: &Arc<AppState>, user_id: &str, prefs: &NotificationPrefs) {
    let Some(pool) = &state.db else { return };
    let result = sqlx::query(
        r#"
        INSERT INTO notification_prefs (user_id, browser_enabled, sound_enabled, toast_enabled)
        VALUES ($1,$2,$3,$4)
        ON CONFLICT (user_id) DO UPDATE SET
            browser_enabled = EXCLUDED.browser_enabled,
            sound_enabled = EXCLUDED.sound_enabled,
            toast_enabled = EXCLUDED.toast_enabled
        "#,
    )
    .bind(user_id)
    .bind(prefs.browser_enabled)
    .bind(prefs.sound_enabled)
    .bind(prefs.toast_enabled)
    .execute(pool)
    .await;
    if let Err(err) = result {
        tracing::warn!(error = %err, user = %user_id, "prefs write-through failed");
    }
}

/// Rehydrates the in-memory state from the replica at boot. Rows with
/// values the current build does not know are skipped, not fatal.
pub async fn restore(state: &Arc<AppState>, pool: &PgPool) {
    let conversation_rows = sqlx::query(
        "SELECT id, owner_user_id, assigned_admin_id, status, kind, priority, subject, \
                context, transferred_from_conversation_id, created_at, updated_at \
         FROM conversations",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    {
        let mut conversations = state.conversations.write().await;
        for row in conversation_rows {
            let (Some(status), Some(kind), Some(priority)) = (
                ConversationStatus::parse(&row.get::<String, _>("status")),
                ConversationKind::parse(&row.get::<String, _>("kind")),
                Priority::parse(&row.get::<String, _>("priority")),
            ) else {
                tracing::warn!("skipping conversation row with unknown enum value");
                continue;
            };
            let context = row
                .get::<Option<String>, _>("context")
                .and_then(|raw| serde_json::from_str::<HandoffContext>(&raw).ok());
            let conversation = Conversation {
                id: row.get("id"),
                owner_user_id: row.get("owner_user_id"),
                assigned_admin_id: row.get("assigned_admin_id"),
                status,
                kind,
                priority,
                subject: row.get("subject"),
                context,
                transferred_from_conversation_id: row.get("transferred_from_conversation_id"),
                created_at: row.get("created_at"),
                updated_at: row.get("updated_at"),
            };
            conversations.insert(conversation.id.clone(), conversation);
        }
    }

    let message_rows = sqlx::query(
        "SELECT id, conversation_id, sender_type, sender_id, content, message_type, \
                read_at, deleted, seq, created_at \
         FROM messages ORDER BY conversation_id, created_at ASC, seq ASC",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    {
        let mut messages = state.messages.write().await;
        let mut index = state.message_index.write().await;
        for row in message_rows {
            let (Some(sender_type), Some(message_type)) = (
                SenderType::parse(&row.get::<String, _>("sender_type")),
                MessageType::parse(&row.get::<String, _>("message_type")),
            ) else {
                tracing::warn!("skipping message row with unknown enum value");
                continue;
            };
            let message = ChatMessage {
                id: row.get("id"),
                conversation_id: row.get("conversation_id"),
                sender_type,
                sender_id: row.get("sender_id"),
                content: row.get("content"),
                message_type,
                read_at: row.get("read_at"),
                deleted: row.get("deleted"),
                seq: row.get::<i64, _>("seq").max(0) as u64,
                created_at: row.get("created_at"),
            };
            index.insert(message.id.clone(), message.conversation_id.clone());
            messages
                .entry(message.conversation_id.clone())
                .or_default()
                .push(message);
        }
    }

    let participant_rows = sqlx::query(
        "SELECT conversation_id, user_id, role, last_read_at FROM participants",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    {
        let mut participants = state.participants.write().await;
        for row in participant_rows {
            let Some(role) = ParticipantRole::parse(&row.get::<String, _>("role")) else {
                continue;
            };
            let participant = Participant {
                conversation_id: row.get("conversation_id"),
                user_id: row.get("user_id"),
                role,
                last_read_at: row.get("last_read_at"),
            };
            participants
                .entry(participant.conversation_id.clone())
                .or_default()
                .push(participant);
        }
    }

    let notification_rows = sqlx::query(
        "SELECT id, user_id, conversation_id, message_id, kind, title, body, read_at, created_at \
         FROM notifications ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    {
        let mut notifications = state.notifications.write().await;
        for row in notification_rows {
            notifications.push(NotificationRecord {
                id: row.get("id"),
                user_id: row.get("user_id"),
                conversation_id: row.get("conversation_id"),
                message_id: row.get("message_id"),
                kind: row.get("kind"),
                title: row.get("title"),
                body: row.get("body"),
                read_at: row.get("read_at"),
                created_at: row.get("created_at"),
            });
        }
    }

    let prefs_rows = sqlx::query(
        "SELECT user_id, browser_enabled, sound_enabled, toast_enabled FROM notification_prefs",
    )
    .fetch_all(pool)
    .await
    .unwrap_or_default();
    {
        let mut prefs = state.prefs.write().await;
        for row in prefs_rows {
            prefs.insert(
                row.get("user_id"),
                NotificationPrefs {
                    browser_enabled: row.get("browser_enabled"),
                    sound_enabled: row.get("sound_enabled"),
                    toast_enabled: row.get("toast_enabled"),
                },
            );
        }
    }

    let restored = state.conversations.read().await.len();
    tracing::info!(conversations = restored, "state restored from postgres");
}
