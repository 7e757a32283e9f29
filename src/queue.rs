use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::ApiError,
    messages, registry,
    types::{
        AppState, Conversation, ConversationStatus, ConversationSummary, Principal, Priority,
    },
};

const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;
const BULK_CONCURRENCY: usize = 8;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub assigned_admin_id: Option<String>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub page: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Conjunctive filters over the registry, with free-text search spanning
/// subject and message content.
pub async fn list_for_queue(
    state: &Arc<AppState>,
    query: &QueueQuery,
) -> Result<(Vec<ConversationSummary>, usize), ApiError> {
    let status = match &query.status {
        Some(raw) if !raw.trim().is_empty() => Some(
            ConversationStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("invalid status: {raw}")))?,
        ),
        _ => None,
    };
    let priority = match &query.priority {
        Some(raw) if !raw.trim().is_empty() => Some(
            Priority::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("invalid priority: {raw}")))?,
        ),
        _ => None,
    };
    let assigned = query
        .assigned_admin_id
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let search = query
        .search
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_ascii_lowercase);

    let mut matched = {
        let conversations = state.conversations.read().await;
        conversations.values().cloned().collect::<Vec<_>>()
    };
    if let Some(status) = status {
        matched.retain(|c| c.status == status);
    }
    if let Some(priority) = priority {
        matched.retain(|c| c.priority == priority);
    }
    if let Some(admin_id) = assigned {
        matched.retain(|c| c.assigned_admin_id.as_deref() == Some(admin_id));
    }
    if let Some(needle) = &search {
        let mut narrowed = Vec::new();
        for conversation in matched {
            if conversation.subject.to_ascii_lowercase().contains(needle) {
                narrowed.push(conversation);
                continue;
            }
            let hit = {
                let messages = state.messages.read().await;
                messages
                    .get(&conversation.id)
                    .map(|log| {
                        log.iter()
                            .any(|m| !m.deleted && m.content.to_ascii_lowercase().contains(needle))
                    })
                    .unwrap_or(false)
            };
            if hit {
                narrowed.push(conversation);
            }
        }
        matched = narrowed;
    }

    matched.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
    let total = matched.len();

    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let page = query.page.unwrap_or(1).max(1);
    let offset = (page - 1) * limit;
    let page_items = matched.into_iter().skip(offset).take(limit);

    let mut summaries = Vec::new();
    for conversation in page_items {
        summaries.push(summarize(state, conversation).await);
    }
    Ok((summaries, total))
}

pub async fn summarize(state: &Arc<AppState>, conversation: Conversation) -> ConversationSummary {
    let last_message = messages::last_message(state, &conversation.id).await;
    let message_count = messages::message_count(state, &conversation.id).await;
    ConversationSummary {
        conversation,
        last_message,
        message_count,
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
    pub unassigned_open_count: usize,
    pub urgent_open_count: usize,
    /// Average seconds from conversation creation to the first admin
    /// message, per admin, over the requested period.
    pub avg_response_time_by_admin: HashMap<String, f64>,
}

/// Accepts `7d` / `24h` style period strings.
pub fn parse_period(raw: &str) -> Result<Duration, ApiError> {
    let trimmed = raw.trim().to_ascii_lowercase();
    if trimmed.is_empty() {
        return Ok(Duration::days(7));
    }
    let (digits, unit) = trimmed.split_at(trimmed.len().saturating_sub(1));
    let amount = digits
        .parse::<i64>()
        .map_err(|_| ApiError::Validation(format!("invalid period: {raw}")))?;
    if amount <= 0 {
        return Err(ApiError::Validation(format!("invalid period: {raw}")));
    }
    match unit {
        "d" => Ok(Duration::days(amount)),
        "h" => Ok(Duration::hours(amount)),
        _ => Err(ApiError::Validation(format!("invalid period: {raw}"))),
    }
}

fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Pure read over registry + message store timestamps.
pub async fn queue_stats(state: &Arc<AppState>, period: Duration) -> QueueStats {
    let conversations = {
        let conversations = state.conversations.read().await;
        conversations.values().cloned().collect::<Vec<_>>()
    };

    let mut by_status = HashMap::new();
    let mut unassigned_open = 0usize;
    let mut urgent_open = 0usize;
    for conversation in &conversations {
        *by_status
            .entry(conversation.status.as_str().to_string())
            .or_insert(0) += 1;
        if conversation.status == ConversationStatus::Open {
            if conversation.assigned_admin_id.is_none() {
                unassigned_open += 1;
            }
            if conversation.priority == Priority::Urgent {
                urgent_open += 1;
            }
        }
    }

    let cutoff = Utc::now() - period;
    let mut sums = HashMap::<String, (f64, usize)>::new();
    for conversation in &conversations {
        let log = match messages::list_messages(state, &conversation.id).await {
            Ok(log) => log,
            Err(_) => continue,
        };
        let first_admin = log.iter().find(|m| {
            m.sender_type == crate::types::SenderType::Admin && m.sender_id.is_some()
        });
        let Some(first_admin) = first_admin else { continue };
        let (Some(first_ts), Some(created_ts)) =
            (parse_ts(&first_admin.created_at), parse_ts(&conversation.created_at))
        else {
            continue;
        };
        if first_ts < cutoff {
            continue;
        }
        let response_secs = (first_ts - created_ts).num_milliseconds().max(0) as f64 / 1000.0;
        if let Some(admin_id) = first_admin.sender_id.clone() {
            let entry = sums.entry(admin_id).or_insert((0.0, 0));
            entry.0 += response_secs;
            entry.1 += 1;
        }
    }
    let avg_response_time_by_admin = sums
        .into_iter()
        .map(|(admin, (sum, count))| (admin, sum / count as f64))
        .collect();

    QueueStats {
        total: conversations.len(),
        by_status,
        unassigned_open_count: unassigned_open,
        urgent_open_count: urgent_open,
        avg_response_time_by_admin,
    }
}

#[derive(Debug, Clone)]
enum BulkAction {
    Assign { admin_id: String },
    Status { status: ConversationStatus },
    Close,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkItemResult {
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOutcome {
    pub successful: usize,
    pub failed: usize,
    pub total: usize,
    pub results: Vec<BulkItemResult>,
}

async fn apply_bulk_action(
    state: Arc<AppState>,
    conversation_id: String,
    action: BulkAction,
    actor: Principal,
) -> BulkItemResult {
    let outcome = match action {
        BulkAction::Assign { admin_id } => {
            registry::assign_conversation(&state, &conversation_id, &admin_id, &actor)
                .await
                .map(|_| ())
        }
        BulkAction::Status { status } => {
            registry::change_status(&state, &conversation_id, status)
                .await
                .map(|_| ())
        }
        BulkAction::Close => registry::close_conversation(&state, &conversation_id, &actor)
            .await
            .map(|_| ()),
    };
    match outcome {
        Ok(()) => BulkItemResult {
            id: conversation_id,
            ok: true,
            error: None,
        },
        Err(err) => BulkItemResult {
            id: conversation_id,
            ok: false,
            error: Some(err.code().to_string()),
        },
    }
}

/// Every id runs through the registry's normal single-item rules,
/// independently and with bounded parallelism. A failing id never aborts
/// the rest; partial success is surfaced in the summary.
pub async fn bulk_update(
    state: &Arc<AppState>,
    conversation_ids: Vec<String>,
    action: &str,
    data: &Value,
    actor: &Principal,
) -> Result<BulkOutcome, ApiError> {
    if !actor.is_admin() {
        return Err(ApiError::Permission(
            "bulk operations require an admin".to_string(),
        ));
    }
    if conversation_ids.is_empty() {
        return Err(ApiError::Validation(
            "conversationIds must not be empty".to_string(),
        ));
    }
    let action = match action.trim() {
        "bulk_assign" => {
            let admin_id = data
                .get("adminId")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .ok_or_else(|| {
                    ApiError::Validation("data.adminId is required for bulk_assign".to_string())
                })?;
            BulkAction::Assign {
                admin_id: admin_id.to_string(),
            }
        }
        "bulk_status_change" => {
            let status = data
                .get("status")
                .and_then(Value::as_str)
                .and_then(ConversationStatus::parse)
                .ok_or_else(|| {
                    ApiError::Validation(
                        "data.status is required for bulk_status_change".to_string(),
                    )
                })?;
            BulkAction::Status { status }
        }
        "bulk_close" => BulkAction::Close,
        other => {
            return Err(ApiError::Validation(format!("unknown bulk action: {other}")))
        }
    };

    let tasks = conversation_ids
        .into_iter()
        .map(|id| apply_bulk_action(state.clone(), id, action.clone(), actor.clone()))
        .collect::<Vec<_>>();
    let results = stream::iter(tasks)
        .buffered(BULK_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    let successful = results.iter().filter(|r| r.ok).count();
    let total = results.len();
    Ok(BulkOutcome {
        successful,
        failed: total - successful,
        total,
        results,
    })
}
