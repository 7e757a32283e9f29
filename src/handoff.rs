use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    config::Config,
    error::ApiError,
    messages, notify, prompting, registry,
    types::{
        AppState, Conversation, ConversationKind, ConversationStatus, HandoffContext,
        HandoffOffer, HandoffReason, MessageType, Principal, Priority, SenderType, TranscriptTurn,
    },
};

/// What the external completion endpoint reports about a transcript. The
/// model itself is a black box; this is the whole contract.
#[derive(Debug, Clone)]
pub struct AiVerdict {
    pub intent: String,
    pub category: String,
    pub summary: String,
    pub escalate: bool,
    pub reason: Option<String>,
}

#[async_trait]
pub trait HandoffClassifier: Send + Sync {
    async fn classify(&self, transcript: &[TranscriptTurn]) -> Result<AiVerdict, String>;
}

/// Used when no API key is configured and in tests: never escalates.
pub struct NoopClassifier;

#[async_trait]
impl HandoffClassifier for NoopClassifier {
    async fn classify(&self, _transcript: &[TranscriptTurn]) -> Result<AiVerdict, String> {
        Ok(AiVerdict {
            intent: String::new(),
            category: String::new(),
            summary: String::new(),
            escalate: false,
            reason: None,
        })
    }
}

pub struct OpenAiClassifier {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClassifier {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.ai_api_url.clone(),
            api_key: config.ai_api_key.clone(),
            model: config.ai_model.clone(),
        }
    }
}

#[async_trait]
impl HandoffClassifier for OpenAiClassifier {
    async fn classify(&self, transcript: &[TranscriptTurn]) -> Result<AiVerdict, String> {
        if self.api_key.trim().is_empty() {
            return Err("classifier api key not configured".to_string());
        }
        let system = prompting::render_classifier_prompt();
        let user = prompting::render_transcript(transcript);
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "model": self.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": 0.1
            }))
            .send()
            .await
            .map_err(|err| format!("classifier request failed: {err}"))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(format!("classifier returned {status}: {body}"));
        }
        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| format!("classifier parse failed: {err}"))?;
        let text = payload
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or("")
            .to_string();
        parse_verdict_from_text(&text)
            .ok_or_else(|| "classifier response was not parseable".to_string())
    }
}

/// Models rarely return bare JSON; try the raw text, a stripped code
/// fence, and the outermost brace slice.
pub fn parse_verdict_from_text(raw: &str) -> Option<AiVerdict> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut candidates = Vec::<String>::new();
    candidates.push(trimmed.to_string());
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string();
        if !stripped.is_empty() {
            candidates.push(stripped);
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        if !parsed.is_object() {
            continue;
        }
        let text_field = |key: &str| {
            parsed
                .get(key)
                .and_then(Value::as_str)
                .map(|text| text.trim().to_string())
                .unwrap_or_default()
        };
        return Some(AiVerdict {
            intent: text_field("intent"),
            category: text_field("category"),
            summary: text_field("summary"),
            escalate: parsed
                .get("escalate")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            reason: parsed
                .get("reason")
                .and_then(Value::as_str)
                .map(|text| text.trim().to_string())
                .filter(|text| !text.is_empty()),
        });
    }

    None
}

/// Per-chat-session bookkeeping for offers, declines and idempotent
/// accepts.
#[derive(Default)]
pub struct DetectorState {
    pub turns: HashMap<String, usize>,
    pub negative_turns: HashMap<String, usize>,
    pub declined: HashSet<String>,
    pub last_offer_turn: HashMap<String, usize>,
    pub accepted: HashMap<String, String>,
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let head = text.chars().take(max).collect::<String>();
        format!("{head}...")
    }
}

fn summarize(transcript: &[TranscriptTurn], latest_text: &str) -> String {
    let tail = transcript
        .iter()
        .rev()
        .find(|turn| turn.role == "user")
        .map(|turn| turn.text.as_str())
        .unwrap_or(latest_text);
    let summary = if tail.trim().is_empty() { latest_text } else { tail };
    let normalized = summary.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&normalized, 240)
}

/// Runs the per-turn heuristics in priority order; the first match wins.
/// Returns `None` when no escalation should be offered this turn.
pub async fn evaluate_turn(
    state: &Arc<AppState>,
    chat_session_id: &str,
    transcript: &[TranscriptTurn],
    latest_text: &str,
) -> Option<HandoffOffer> {
    let settings = &state.config.handoff;
    let lower = latest_text.to_ascii_lowercase();

    let (turn, negatives, suppressed) = {
        let mut detector = state.detector.lock().await;
        let turn = {
            let counter = detector.turns.entry(chat_session_id.to_string()).or_insert(0);
            *counter += 1;
            *counter
        };
        if contains_any(&lower, &settings.negative_keywords) {
            *detector
                .negative_turns
                .entry(chat_session_id.to_string())
                .or_insert(0) += 1;
        }
        let negatives = detector
            .negative_turns
            .get(chat_session_id)
            .copied()
            .unwrap_or(0);
        let declined = detector.declined.contains(chat_session_id);
        let cooling = detector
            .last_offer_turn
            .get(chat_session_id)
            .map(|last| turn <= last + settings.offer_cooldown_turns)
            .unwrap_or(false);
        (turn, negatives, declined || cooling)
    };
    if suppressed {
        return None;
    }

    let wants_human = contains_any(&lower, &settings.human_keywords);
    let is_urgent = contains_any(&lower, &settings.urgent_keywords);

    let offer = if wants_human || is_urgent {
        Some(HandoffOffer {
            id: Uuid::new_v4().to_string(),
            reason: HandoffReason::ExplicitRequest,
            intent: "human_support".to_string(),
            category: "support".to_string(),
            summary: summarize(transcript, latest_text),
            priority: if is_urgent { Priority::Urgent } else { Priority::High },
        })
    } else if negatives >= settings.frustration_threshold {
        Some(HandoffOffer {
            id: Uuid::new_v4().to_string(),
            reason: HandoffReason::Frustration,
            intent: "frustrated_user".to_string(),
            category: "support".to_string(),
            summary: summarize(transcript, latest_text),
            priority: Priority::High,
        })
    } else {
        match state.classifier.classify(transcript).await {
            Ok(verdict) if verdict.escalate => Some(HandoffOffer {
                id: Uuid::new_v4().to_string(),
                reason: HandoffReason::AiEscalation,
                intent: if verdict.intent.is_empty() {
                    "unresolved".to_string()
                } else {
                    verdict.intent
                },
                category: if verdict.category.is_empty() {
                    "general".to_string()
                } else {
                    verdict.category
                },
                summary: if verdict.summary.is_empty() {
                    summarize(transcript, latest_text)
                } else {
                    verdict.summary
                },
                priority: Priority::Normal,
            }),
            Ok(_) => None,
            Err(err) => {
                // Degrades to "no handoff"; the chat turn itself is never
                // blocked.
                tracing::warn!(error = %err, "handoff classifier failed");
                None
            }
        }
    };

    if offer.is_some() {
        let mut detector = state.detector.lock().await;
        detector
            .last_offer_turn
            .insert(chat_session_id.to_string(), turn);
    }
    offer
}

/// Accepting the same offer twice resolves to the one conversation the
/// first accept created. One active handoff conversation per user: while
/// the user still has an open `ai_handoff` conversation, further accepts
/// append a handoff entry there instead of creating a duplicate.
pub async fn accept_offer(
    state: &Arc<AppState>,
    chat_session_id: &str,
    offer: &HandoffOffer,
    transcript: Vec<TranscriptTurn>,
    user: &Principal,
) -> Result<(Conversation, bool), ApiError> {
    let key = format!("{chat_session_id}:{}", offer.id);
    let mut detector = state.detector.lock().await;

    if let Some(existing_id) = detector.accepted.get(&key).cloned() {
        drop(detector);
        let conversation = registry::get_conversation(state, &existing_id).await?;
        return Ok((conversation, false));
    }

    let existing_open = {
        let conversations = state.conversations.read().await;
        conversations
            .values()
            .find(|c| {
                c.owner_user_id == user.id
                    && c.kind == ConversationKind::AiHandoff
                    && matches!(
                        c.status,
                        ConversationStatus::Open | ConversationStatus::InProgress
                    )
            })
            .cloned()
    };

    if let Some(conversation) = existing_open {
        detector.accepted.insert(key, conversation.id.clone());
        drop(detector);
        let _ = messages::add_message(
            state,
            &conversation.id,
            SenderType::System,
            None,
            &format!(
                "User requested a human again ({})",
                offer.reason.as_str()
            ),
            MessageType::Handoff,
        )
        .await;
        return Ok((conversation, false));
    }

    let context = HandoffContext {
        reason: offer.reason.as_str().to_string(),
        intent: offer.intent.clone(),
        category: offer.category.clone(),
        summary: offer.summary.clone(),
        ai_transcript: transcript,
    };
    let subject = if offer.summary.trim().is_empty() {
        "Escalated chat".to_string()
    } else {
        format!("Escalated chat: {}", truncate_chars(offer.summary.trim(), 80))
    };
    let conversation = registry::create_conversation(
        state,
        &user.id,
        &subject,
        offer.priority,
        ConversationKind::AiHandoff,
        Some(context),
        None,
    )
    .await?;
    detector.accepted.insert(key, conversation.id.clone());
    drop(detector);

    let _ = messages::add_message(
        state,
        &conversation.id,
        SenderType::System,
        None,
        &format!(
            "Escalated from AI chat ({}): {}",
            offer.reason.as_str(),
            offer.summary
        ),
        MessageType::Handoff,
    )
    .await;
    notify::handoff_created(state, &conversation).await;
    Ok((conversation, true))
}

/// A decline suppresses every further offer for the rest of the session.
pub async fn decline_offer(state: &Arc<AppState>, chat_session_id: &str) {
    let mut detector = state.detector.lock().await;
    detector.declined.insert(chat_session_id.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrincipalRole;

    struct EscalatingClassifier;

    #[async_trait]
    impl HandoffClassifier for EscalatingClassifier {
        async fn classify(&self, _transcript: &[TranscriptTurn]) -> Result<AiVerdict, String> {
            Ok(AiVerdict {
                intent: "billing_question".to_string(),
                category: "billing".to_string(),
                summary: "User cannot resolve a billing problem".to_string(),
                escalate: true,
                reason: Some("ai_escalation".to_string()),
            })
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl HandoffClassifier for FailingClassifier {
        async fn classify(&self, _transcript: &[TranscriptTurn]) -> Result<AiVerdict, String> {
            Err("upstream timeout".to_string())
        }
    }

    fn state_with(classifier: Arc<dyn HandoffClassifier>) -> Arc<AppState> {
        Arc::new(AppState::new(Config::default(), None, classifier))
    }

    fn user() -> Principal {
        Principal {
            id: "user-1".to_string(),
            role: PrincipalRole::User,
        }
    }

    fn turn(role: &str, text: &str) -> TranscriptTurn {
        TranscriptTurn {
            role: role.to_string(),
            text: text.to_string(),
            timestamp: crate::types::now_iso(),
        }
    }

    #[tokio::test]
    async fn urgent_human_request_yields_explicit_offer() {
        let state = state_with(Arc::new(NoopClassifier));
        let transcript = vec![turn("user", "I need urgent human support now")];
        let offer = evaluate_turn(&state, "session-1", &transcript, "I need urgent human support now")
            .await
            .expect("offer");
        assert_eq!(offer.reason, HandoffReason::ExplicitRequest);
        assert!(matches!(offer.priority, Priority::High | Priority::Urgent));
        assert_eq!(offer.priority, Priority::Urgent);
    }

    #[tokio::test]
    async fn plain_human_request_is_high_priority() {
        let state = state_with(Arc::new(NoopClassifier));
        let offer = evaluate_turn(&state, "session-1", &[], "can I talk to agent please")
            .await
            .expect("offer");
        assert_eq!(offer.reason, HandoffReason::ExplicitRequest);
        assert_eq!(offer.priority, Priority::High);
    }

    #[tokio::test]
    async fn decline_suppresses_further_offers_for_the_session() {
        let state = state_with(Arc::new(NoopClassifier));
        evaluate_turn(&state, "session-1", &[], "talk to agent now, this is urgent")
            .await
            .expect("offer");
        decline_offer(&state, "session-1").await;
        let next = evaluate_turn(&state, "session-1", &[], "talk to agent now, this is urgent").await;
        assert!(next.is_none());
        // Other sessions are unaffected.
        let other = evaluate_turn(&state, "session-2", &[], "talk to agent now").await;
        assert!(other.is_some());
    }

    #[tokio::test]
    async fn at_most_one_offer_per_turn_window() {
        let state = state_with(Arc::new(NoopClassifier));
        let first = evaluate_turn(&state, "session-1", &[], "I want a real person").await;
        assert!(first.is_some());
        let second = evaluate_turn(&state, "session-1", &[], "I want a real person").await;
        assert!(second.is_none());
        let third = evaluate_turn(&state, "session-1", &[], "I want a real person").await;
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn repeated_negative_turns_trigger_frustration() {
        let state = state_with(Arc::new(NoopClassifier));
        assert!(evaluate_turn(&state, "session-1", &[], "the export is not working").await.is_none());
        assert!(evaluate_turn(&state, "session-1", &[], "still broken after retrying").await.is_none());
        let offer = evaluate_turn(&state, "session-1", &[], "this is ridiculous")
            .await
            .expect("frustration offer");
        assert_eq!(offer.reason, HandoffReason::Frustration);
        assert_eq!(offer.priority, Priority::High);
    }

    #[tokio::test]
    async fn classifier_escalation_is_third_in_priority() {
        let state = state_with(Arc::new(EscalatingClassifier));
        let transcript = vec![turn("user", "my invoice looks wrong")];
        let offer = evaluate_turn(&state, "session-1", &transcript, "my invoice looks wrong")
            .await
            .expect("ai offer");
        assert_eq!(offer.reason, HandoffReason::AiEscalation);
        assert_eq!(offer.category, "billing");
        assert_eq!(offer.priority, Priority::Normal);
    }

    #[tokio::test]
    async fn classifier_failure_degrades_to_no_offer() {
        let state = state_with(Arc::new(FailingClassifier));
        let result = evaluate_turn(&state, "session-1", &[], "my invoice looks wrong").await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn duplicate_accept_creates_exactly_one_conversation() {
        let state = state_with(Arc::new(NoopClassifier));
        let transcript = vec![turn("user", "I need urgent human support now")];
        let offer = evaluate_turn(&state, "session-1", &transcript, "I need urgent human support now")
            .await
            .expect("offer");

        let (first, created) = accept_offer(&state, "session-1", &offer, transcript.clone(), &user())
            .await
            .expect("accept");
        assert!(created);
        let (second, created_again) =
            accept_offer(&state, "session-1", &offer, transcript.clone(), &user())
                .await
                .expect("accept again");
        assert!(!created_again);
        assert_eq!(first.id, second.id);

        let conversations = state.conversations.read().await;
        assert_eq!(conversations.len(), 1);
    }

    #[tokio::test]
    async fn accept_carries_full_transcript_into_immutable_context() {
        let state = state_with(Arc::new(NoopClassifier));
        let transcript = vec![
            turn("user", "hello"),
            turn("assistant", "hi, how can I help?"),
            turn("user", "I need urgent human support now"),
        ];
        let offer = evaluate_turn(&state, "session-1", &transcript, "I need urgent human support now")
            .await
            .expect("offer");
        let (conversation, _) = accept_offer(&state, "session-1", &offer, transcript.clone(), &user())
            .await
            .expect("accept");
        assert_eq!(conversation.kind, ConversationKind::AiHandoff);
        let context = conversation.context.expect("context snapshot");
        assert_eq!(context.reason, "explicit_request");
        assert_eq!(context.ai_transcript.len(), 3);
        assert_eq!(context.ai_transcript[1].role, "assistant");
    }

    #[tokio::test]
    async fn second_offer_appends_to_existing_open_handoff() {
        let state = state_with(Arc::new(NoopClassifier));
        let transcript = vec![turn("user", "I need urgent human support now")];
        let offer = evaluate_turn(&state, "session-1", &transcript, "I need urgent human support now")
            .await
            .expect("offer");
        accept_offer(&state, "session-1", &offer, transcript.clone(), &user())
            .await
            .expect("accept");

        // A fresh offer from a later AI session of the same user.
        let second_offer = evaluate_turn(&state, "session-2", &transcript, "talk to agent")
            .await
            .expect("second offer");
        let (conversation, created) =
            accept_offer(&state, "session-2", &second_offer, transcript, &user())
                .await
                .expect("second accept");
        assert!(!created);
        let conversations = state.conversations.read().await;
        assert_eq!(conversations.len(), 1);
        drop(conversations);

        let log = messages::list_messages(&state, &conversation.id)
            .await
            .expect("messages");
        assert!(log
            .iter()
            .any(|m| m.message_type == MessageType::Handoff
                && m.content.contains("requested a human again")));
    }

    #[test]
    fn verdict_parses_from_fenced_output() {
        let raw = "```json\n{\"intent\":\"billing\",\"category\":\"billing\",\"summary\":\"s\",\"escalate\":true}\n```";
        let verdict = parse_verdict_from_text(raw).expect("parse");
        assert!(verdict.escalate);
        assert_eq!(verdict.intent, "billing");
    }

    #[test]
    fn verdict_defaults_escalate_false() {
        let verdict = parse_verdict_from_text("{\"summary\":\"fine\"}").expect("parse");
        assert!(!verdict.escalate);
        assert!(parse_verdict_from_text("not json at all").is_none());
    }
}
