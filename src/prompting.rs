use minijinja::{context, Environment};

use crate::types::TranscriptTurn;

const CLASSIFIER_PROMPT_TEMPLATE: &str = include_str!("prompts/classifier_prompt.j2");
const CATEGORIES: &str = "billing, technical, account, general";

pub fn render_classifier_prompt() -> String {
    let mut env = Environment::new();
    if env
        .add_template("classifier_prompt", CLASSIFIER_PROMPT_TEMPLATE)
        .is_err()
    {
        return fallback_classifier_prompt();
    }
    let Ok(template) = env.get_template("classifier_prompt") else {
        return fallback_classifier_prompt();
    };
    template
        .render(context! { categories => CATEGORIES })
        .unwrap_or_else(|_| fallback_classifier_prompt())
}

fn fallback_classifier_prompt() -> String {
    format!(
        "You triage support-chat transcripts between an end user and an AI assistant.\n\
         Reply with strict JSON: {{\"intent\", \"category\" (one of: {CATEGORIES}), \
         \"summary\", \"escalate\" (boolean), \"reason\"}}.\n\
         Set escalate to false unless the assistant clearly cannot resolve the request."
    )
}

pub fn render_transcript(transcript: &[TranscriptTurn]) -> String {
    if transcript.is_empty() {
        return "(empty transcript)".to_string();
    }
    transcript
        .iter()
        .map(|turn| format!("{}: {}", turn.role, turn.text))
        .collect::<Vec<_>>()
        .join("\n")
}
