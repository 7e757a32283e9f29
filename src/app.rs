use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

use crate::{
    config::Config,
    error::ApiError,
    handoff::{self, HandoffClassifier, NoopClassifier, OpenAiClassifier},
    messages, notify, persist, queue, realtime, registry,
    types::{
        AcceptHandoffBody, AppState, AssigneeBody, BulkUpdateBody, Conversation,
        ConversationKind, ConversationMetaBody, ConversationStatus, CreateConversationBody,
        DeclineHandoffBody, EvaluateTurnBody, MessageType, NotificationPrefsBody, Principal,
        PrincipalRole, Priority, SendMessageBody, SenderType,
    },
};

fn principal_from_headers(headers: &HeaderMap) -> Result<Principal, ApiError> {
    let id = headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::Permission("missing authenticated principal".to_string()))?;
    let role_raw = headers
        .get("x-user-role")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .unwrap_or("user")
        .to_ascii_lowercase();
    let role = match role_raw.as_str() {
        "admin" => PrincipalRole::Admin,
        "user" | "" => PrincipalRole::User,
        other => return Err(ApiError::Permission(format!("unknown role: {other}"))),
    };
    Ok(Principal {
        id: id.to_string(),
        role,
    })
}

fn require_admin(principal: &Principal) -> Result<(), ApiError> {
    if principal.is_admin() {
        Ok(())
    } else {
        Err(ApiError::Permission("admin role required".to_string()))
    }
}

async fn authorize_view(
    state: &Arc<AppState>,
    conversation_id: &str,
    principal: &Principal,
) -> Result<Conversation, ApiError> {
    let conversation = registry::get_conversation(state, conversation_id).await?;
    if !principal.is_admin() && conversation.owner_user_id != principal.id {
        return Err(ApiError::Permission(
            "not a participant of this conversation".to_string(),
        ));
    }
    Ok(conversation)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": crate::types::now_iso() }))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let priority = match &body.priority {
        Some(raw) if !raw.trim().is_empty() => Priority::parse(raw)
            .ok_or_else(|| ApiError::Validation(format!("invalid priority: {raw}")))?,
        _ => Priority::Normal,
    };
    let conversation = registry::create_conversation(
        &state,
        &principal.id,
        &body.subject,
        priority,
        ConversationKind::Support,
        None,
        None,
    )
    .await?;

    let first_message = match body.initial_message.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Some(
            messages::add_message(
                &state,
                &conversation.id,
                if principal.is_admin() {
                    SenderType::Admin
                } else {
                    SenderType::User
                },
                Some(&principal.id),
                text,
                MessageType::Text,
            )
            .await?,
        ),
        _ => None,
    };

    Ok((
        StatusCode::CREATED,
        Json(json!({ "conversation": conversation, "message": first_message })),
    ))
}

async fn get_own_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let mut summaries = Vec::new();
    for conversation in registry::list_for_user(&state, &principal.id).await {
        summaries.push(queue::summarize(&state, conversation).await);
    }
    Ok(Json(json!({ "conversations": summaries })))
}

async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let conversation = authorize_view(&state, &conversation_id, &principal).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn get_conversation_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_view(&state, &conversation_id, &principal).await?;
    let log = messages::list_messages(&state, &conversation_id).await?;
    Ok(Json(json!({ "messages": log })))
}

async fn read_all(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_view(&state, &conversation_id, &principal).await?;
    let updated = messages::mark_all_read(&state, &conversation_id, &principal.id).await?;
    Ok(Json(json!({ "updated": updated, "unreadCount": 0 })))
}

async fn patch_meta(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ConversationMetaBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    require_admin(&principal)?;
    if body.status.is_none() && body.priority.is_none() && body.subject.is_none() {
        return Err(ApiError::Validation("nothing to update".to_string()));
    }

    if let Some(raw) = &body.status {
        let status = ConversationStatus::parse(raw)
            .ok_or_else(|| ApiError::Validation(format!("invalid status: {raw}")))?;
        registry::change_status(&state, &conversation_id, status).await?;
    }
    if let Some(raw) = &body.priority {
        let priority = Priority::parse(raw)
            .ok_or_else(|| ApiError::Validation(format!("invalid priority: {raw}")))?;
        registry::change_priority(&state, &conversation_id, priority).await?;
    }
    if let Some(subject) = &body.subject {
        registry::rename_subject(&state, &conversation_id, subject).await?;
    }

    let conversation = registry::get_conversation(&state, &conversation_id).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn patch_assignee(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AssigneeBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let conversation =
        registry::assign_conversation(&state, &conversation_id, &body.admin_id, &principal).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn close_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_view(&state, &conversation_id, &principal).await?;
    let conversation = registry::close_conversation(&state, &conversation_id, &principal).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn transfer_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_view(&state, &conversation_id, &principal).await?;
    let successor = registry::create_successor(&state, &conversation_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "conversation": successor })),
    ))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    authorize_view(&state, &body.conversation_id, &principal).await?;
    let message_type = match &body.message_type {
        Some(raw) if !raw.trim().is_empty() => MessageType::parse(raw)
            .ok_or_else(|| ApiError::Validation(format!("invalid message type: {raw}")))?,
        _ => MessageType::Text,
    };
    if message_type == MessageType::System && !principal.is_admin() {
        return Err(ApiError::Permission(
            "system messages require an admin".to_string(),
        ));
    }
    let sender_type = if principal.is_admin() {
        SenderType::Admin
    } else {
        SenderType::User
    };
    let message = messages::add_message(
        &state,
        &body.conversation_id,
        sender_type,
        Some(&principal.id),
        &body.content,
        message_type,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(json!({ "message": message }))))
}

async fn mark_message_read(
    Path(message_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let message = messages::mark_read(&state, &message_id, &principal).await?;
    Ok(Json(json!({ "message": message })))
}

async fn delete_message(
    Path(message_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let message = messages::delete_message(&state, &message_id, &principal).await?;
    Ok(Json(json!({ "message": message })))
}

async fn admin_list_conversations(
    Query(query): Query<queue::QueueQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    require_admin(&principal)?;
    let (conversations, total) = queue::list_for_queue(&state, &query).await?;
    Ok(Json(json!({ "conversations": conversations, "total": total })))
}

async fn admin_bulk_update(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<BulkUpdateBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let outcome = queue::bulk_update(
        &state,
        body.conversation_ids,
        &body.action,
        &body.data,
        &principal,
    )
    .await?;
    Ok(Json(json!(outcome)))
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    period: Option<String>,
}

async fn admin_stats(
    Query(query): Query<StatsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    require_admin(&principal)?;
    let period = queue::parse_period(query.period.as_deref().unwrap_or("7d"))?;
    let stats = queue::queue_stats(&state, period).await;
    Ok(Json(json!(stats)))
}

async fn evaluate_handoff(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<EvaluateTurnBody>,
) -> Result<impl IntoResponse, ApiError> {
    principal_from_headers(&headers)?;
    if body.chat_session_id.trim().is_empty() {
        return Err(ApiError::Validation("chatSessionId is required".to_string()));
    }
    let offer =
        handoff::evaluate_turn(&state, &body.chat_session_id, &body.transcript, &body.text).await;
    Ok(Json(json!({ "offer": offer })))
}

async fn accept_handoff(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AcceptHandoffBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (conversation, created) = handoff::accept_offer(
        &state,
        &body.chat_session_id,
        &body.offer,
        body.transcript,
        &principal,
    )
    .await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({ "conversation": conversation, "created": created })),
    ))
}

async fn decline_handoff(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<DeclineHandoffBody>,
) -> Result<impl IntoResponse, ApiError> {
    principal_from_headers(&headers)?;
    handoff::decline_offer(&state, &body.chat_session_id).await;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NotificationsQuery {
    #[serde(default)]
    unread_only: bool,
}

async fn get_notifications(
    Query(query): Query<NotificationsQuery>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let (notifications, unread) =
        notify::list_notifications(&state, &principal.id, query.unread_only).await;
    Ok(Json(json!({ "notifications": notifications, "unreadCount": unread })))
}

async fn mark_notification_read(
    Path(notification_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let unread = notify::mark_notification_read(&state, &notification_id, &principal.id).await?;
    Ok(Json(json!({ "ok": true, "unreadCount": unread })))
}

async fn read_all_notifications(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    notify::mark_all_notifications_read(&state, &principal.id).await;
    Ok(Json(json!({ "ok": true, "unreadCount": 0 })))
}

async fn get_prefs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let preferences = notify::prefs_for(&state, &principal.id).await;
    Ok(Json(json!({ "preferences": preferences })))
}

async fn patch_prefs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<NotificationPrefsBody>,
) -> Result<impl IntoResponse, ApiError> {
    let principal = principal_from_headers(&headers)?;
    let preferences = notify::update_prefs(&state, &principal.id, &body).await;
    Ok(Json(json!({ "preferences": preferences })))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/conversations",
            get(get_own_conversations).post(create_conversation),
        )
        .route("/api/conversations/{conversation_id}", get(get_conversation))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_conversation_messages),
        )
        .route("/api/conversations/{conversation_id}/read-all", post(read_all))
        .route("/api/conversations/{conversation_id}/meta", patch(patch_meta))
        .route(
            "/api/conversations/{conversation_id}/assignee",
            patch(patch_assignee),
        )
        .route(
            "/api/conversations/{conversation_id}/close",
            post(close_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/transfer",
            post(transfer_conversation),
        )
        .route("/api/messages", post(post_message))
        .route("/api/messages/{message_id}/read", put(mark_message_read))
        .route(
            "/api/messages/{message_id}",
            axum::routing::delete(delete_message),
        )
        .route(
            "/api/admin/conversations",
            get(admin_list_conversations).post(admin_bulk_update),
        )
        .route("/api/admin/stats", get(admin_stats))
        .route("/api/handoff/evaluate", post(evaluate_handoff))
        .route("/api/handoff/accept", post(accept_handoff))
        .route("/api/handoff/decline", post(decline_handoff))
        .route("/api/notifications", get(get_notifications))
        .route("/api/notifications/read-all", post(read_all_notifications))
        .route(
            "/api/notifications/{notification_id}/read",
            patch(mark_notification_read),
        )
        .route(
            "/api/notifications/preferences",
            get(get_prefs).patch(patch_prefs),
        )
        .route("/ws", get(realtime::ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("support_chat_server=info,tower_http=warn")),
        )
        .init();

    let config = Config::from_env();
    let classifier: Arc<dyn HandoffClassifier> = if config.ai_api_key.trim().is_empty() {
        tracing::info!("no classifier api key configured; keyword heuristics only");
        Arc::new(NoopClassifier)
    } else {
        Arc::new(OpenAiClassifier::new(&config))
    };

    let db = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .expect("failed to run sqlx migrations");
            Some(pool)
        }
        None => {
            tracing::warn!("DATABASE_URL not configured; running without a durable replica");
            None
        }
    };

    let port = config.port;
    let state = Arc::new(AppState::new(config, db, classifier));
    if let Some(pool) = state.db.clone() {
        persist::restore(&state, &pool).await;
    }

    let app = router(state);
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");
    tracing::info!(%addr, "support chat server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
