use std::env;

/// Runtime configuration, resolved once at startup. Everything tunable by
/// operators lives here so request handlers never read the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// When `None` the service runs memory-only (no write-through replica).
    pub database_url: Option<String>,
    pub ai_api_url: String,
    pub ai_api_key: String,
    pub ai_model: String,
    /// Messages a single sender may append to one conversation per window.
    pub rate_limit_max: usize,
    pub rate_limit_window_secs: i64,
    pub handoff: HandoffConfig,
}

/// Handoff-detector tuning. The keyword lists and thresholds are
/// deliberately configuration, not constants, so they can be adjusted
/// without a deploy.
#[derive(Debug, Clone)]
pub struct HandoffConfig {
    /// Phrases that request a human outright (`HANDOFF_HUMAN_KEYWORDS`, csv).
    pub human_keywords: Vec<String>,
    /// Phrases that additionally mark the request urgent
    /// (`HANDOFF_URGENT_KEYWORDS`, csv).
    pub urgent_keywords: Vec<String>,
    /// Phrases counted as a negative-sentiment turn
    /// (`HANDOFF_NEGATIVE_KEYWORDS`, csv).
    pub negative_keywords: Vec<String>,
    /// Negative turns in one chat session before a frustration offer
    /// (`HANDOFF_FRUSTRATION_THRESHOLD`, default 3).
    pub frustration_threshold: usize,
    /// Minimum turns between two offers in the same session
    /// (`HANDOFF_OFFER_COOLDOWN_TURNS`, default 1).
    pub offer_cooldown_turns: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            human_keywords: csv_list(
                "human, real person, representative, live agent, human support, \
                 talk to agent, speak to agent, speak with agent, talk to a person",
            ),
            urgent_keywords: csv_list("urgent, emergency, immediately, right now, asap"),
            negative_keywords: csv_list(
                "not working, doesn't work, useless, frustrated, frustrating, angry, \
                 terrible, ridiculous, waste of time, still broken",
            ),
            frustration_threshold: 3,
            offer_cooldown_turns: 1,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4000,
            database_url: None,
            ai_api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            ai_api_key: String::new(),
            ai_model: "gpt-4o-mini".to_string(),
            rate_limit_max: 30,
            rate_limit_window_secs: 60,
            handoff: HandoffConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            port: env_parse("PORT", defaults.port),
            database_url: resolve_database_url(),
            ai_api_url: env_string("AI_API_URL", &defaults.ai_api_url),
            ai_api_key: env_string("OPENAI_API_KEY", ""),
            ai_model: env_string("AI_MODEL", &defaults.ai_model),
            rate_limit_max: env_parse("MESSAGE_RATE_LIMIT", defaults.rate_limit_max),
            rate_limit_window_secs: env_parse(
                "MESSAGE_RATE_WINDOW_SECS",
                defaults.rate_limit_window_secs,
            ),
            handoff: HandoffConfig {
                human_keywords: env_csv("HANDOFF_HUMAN_KEYWORDS")
                    .unwrap_or(defaults.handoff.human_keywords),
                urgent_keywords: env_csv("HANDOFF_URGENT_KEYWORDS")
                    .unwrap_or(defaults.handoff.urgent_keywords),
                negative_keywords: env_csv("HANDOFF_NEGATIVE_KEYWORDS")
                    .unwrap_or(defaults.handoff.negative_keywords),
                frustration_threshold: env_parse(
                    "HANDOFF_FRUSTRATION_THRESHOLD",
                    defaults.handoff.frustration_threshold,
                ),
                offer_cooldown_turns: env_parse(
                    "HANDOFF_OFFER_COOLDOWN_TURNS",
                    defaults.handoff.offer_cooldown_turns,
                ),
            },
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn env_csv(key: &str) -> Option<Vec<String>> {
    let raw = env::var(key).ok()?;
    let list = csv_list(&raw);
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

fn csv_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|item| item.trim().to_ascii_lowercase())
        .filter(|item| !item.is_empty())
        .collect()
}

fn resolve_database_url() -> Option<String> {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return Some(url);
        }
    }
    let host = env::var("POSTGRES_HOST").or_else(|_| env::var("PGHOST")).ok()?;
    if host.trim().is_empty() {
        return None;
    }
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "support_chat".to_string());
    Some(format!("postgres://{user}:{password}@{host}:{port}/{db}"))
}
