//! Configuration: environment variables for credentials/endpoints, plus an optional TOML
//! file (TUTOR_CONFIG_PATH) for prompts, speech and limits.
//!
//! Every TOML field has a default, so a partial file is fine. A broken file is logged and
//! ignored rather than aborting startup.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use crate::inject::DEFAULT_INJECTION_HEADER;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct TutorFileConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub speech: SpeechSettings,
  #[serde(default)]
  pub limits: Limits,
}

/// User-facing and model-facing texts.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  /// Inline system prompt. Ignored when `system_prompt_path` points to a readable file.
  pub system_prompt: String,
  pub system_prompt_path: Option<PathBuf>,
  /// Directive carrying the reply schema; `{schema}` is replaced by the JSON Schema text.
  pub schema_instruction: String,
  /// Header above injected teacher notes; `{stamp}` is the UTC time.
  pub injection_header: String,
  /// Heading above a deferred dialogue transcript.
  pub disclosure_heading: String,
  /// Shown when a reply ends up empty.
  pub empty_reply: String,
  /// Shown when a turn fails; `{reason}` is the error.
  pub error_template: String,
  pub audio_title: String,
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      system_prompt: DEFAULT_SYSTEM_PROMPT.trim().into(),
      system_prompt_path: None,
      schema_instruction: "You MUST return a single JSON object that VALIDATES against the following JSON Schema. \
        Return ONLY the raw JSON (no code fences, no extra text, no markdown):\n{schema}"
        .into(),
      injection_header: DEFAULT_INJECTION_HEADER.into(),
      disclosure_heading: "📜 Transcript of the last listening exercise:".into(),
      empty_reply: "(The tutor sent an empty reply.)".into(),
      error_template: "Error: {reason}".into(),
      audio_title: "Listening".into(),
    }
  }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"
You are a patient Japanese teacher preparing the learner for the JLPT.
Explain briefly, give exercises, and correct the learner's answers with short notes
and a mini list of new words. Keep track of the learner's level (N5..N1) and a progress
score from 0 to 1000.

Put everything the learner should read into "Student". Put machine data into "Bot":
- "audio_script": a short listening dialogue, one line per turn, formatted "A: ...".
  Leave it empty when there is no listening task.
- "tech_stats": short notes for yourself about progress and plans.
- "stats": one entry per exercise item the learner attempted in this turn.
Use the attached files (catalog and the learner's own stats) when choosing material.
"#;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpeechMode {
  /// One synthesis call for the whole script, one voice.
  #[default]
  Single,
  /// One call per utterance with a voice per speaker, joined with silence.
  PerSpeaker,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SpeechSettings {
  pub mode: SpeechMode,
  /// Voice pool for per-speaker mode, assigned in order of first appearance.
  pub voices: Vec<String>,
  pub gap_ms: u64,
}

impl Default for SpeechSettings {
  fn default() -> Self {
    Self {
      mode: SpeechMode::Single,
      voices: vec!["alloy".into(), "nova".into(), "onyx".into(), "shimmer".into()],
      gap_ms: 400,
    }
  }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Limits {
  /// Longest outbound text message, in chars.
  pub chunk_chars: usize,
  pub chat_timeout_secs: u64,
  pub speech_timeout_secs: u64,
  pub sync_timeout_secs: u64,
}

impl Default for Limits {
  fn default() -> Self {
    Self { chunk_chars: 4000, chat_timeout_secs: 120, speech_timeout_secs: 60, sync_timeout_secs: 60 }
  }
}

impl Limits {
  pub fn chat_timeout(&self) -> Duration { Duration::from_secs(self.chat_timeout_secs) }
  pub fn speech_timeout(&self) -> Duration { Duration::from_secs(self.speech_timeout_secs) }
  pub fn sync_timeout(&self) -> Duration { Duration::from_secs(self.sync_timeout_secs) }
}

/// OpenAI endpoint settings; present only when an API key is configured.
#[derive(Clone, Debug)]
pub struct OpenAiSettings {
  pub api_key: String,
  pub base_url: String,
  pub text_model: String,
  pub tts_model: String,
  pub tts_voice: String,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
  pub openai: Option<OpenAiSettings>,
  pub global_vector_store_id: Option<String>,
  pub data_dir: PathBuf,
  pub port: u16,
  pub prompts: Prompts,
  pub speech: SpeechSettings,
  pub limits: Limits,
}

impl AppConfig {
  /// Load from the process environment and TUTOR_CONFIG_PATH.
  pub fn from_env() -> Self {
    let file = load_file_config_from_env().unwrap_or_default();
    Self::from_lookup(file, |k| std::env::var(k).ok())
  }

  /// Build from a parsed file config and an environment lookup.
  pub fn from_lookup(file: TutorFileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
    let var = |k: &str, default: &str| env(k).filter(|v| !v.is_empty()).unwrap_or_else(|| default.to_string());

    let openai = env("OPENAI_API_KEY").filter(|k| !k.is_empty()).map(|api_key| OpenAiSettings {
      api_key,
      base_url: var("OPENAI_BASE_URL", "https://api.openai.com/v1"),
      text_model: var("OPENAI_TEXT_MODEL", "gpt-4.1-mini"),
      tts_model: var("OPENAI_TTS_MODEL", "gpt-4o-mini-tts"),
      tts_voice: var("OPENAI_TTS_VOICE", "alloy"),
    });

    let mut prompts = file.prompts;
    if let Some(path) = &prompts.system_prompt_path {
      match std::fs::read_to_string(path) {
        Ok(text) => prompts.system_prompt = text.trim().to_string(),
        Err(e) => error!(target: "sensei_backend", path = %path.display(), error = %e, "Failed to read system prompt file; using inline prompt"),
      }
    }

    Self {
      openai,
      global_vector_store_id: env("VECTOR_STORE_ID").filter(|v| !v.is_empty()),
      data_dir: PathBuf::from(var("DATA_DIR", "./data")),
      port: env("PORT").and_then(|p| p.parse().ok()).unwrap_or(3000),
      prompts,
      speech: file.speech,
      limits: file.limits,
    }
  }
}

/// Attempt to load the TOML file named by TUTOR_CONFIG_PATH. On any IO/parse error, returns None.
pub fn load_file_config_from_env() -> Option<TutorFileConfig> {
  let path = std::env::var("TUTOR_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<TutorFileConfig>(&s) {
      Ok(cfg) => {
        info!(target: "sensei_backend", %path, "Loaded tutor config (TOML)");
        Some(cfg)
      }
      Err(e) => {
        error!(target: "sensei_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "sensei_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

/// The structured reply contract, in the `json_schema` response-format shape.
pub fn response_format() -> Value {
  let text = |d: &str| json!({ "type": "string", "description": d });
  json!({
    "type": "json_schema",
    "json_schema": {
      "name": "jp_teacher_bot_response",
      "strict": true,
      "schema": {
        "type": "object",
        "properties": {
          "Student": text("Shown to the learner verbatim: explanations, exercises, corrections, new words."),
          "Bot": {
            "type": "object",
            "description": "Service data for the bot, never shown to the learner. Keep it short and strict.",
            "properties": {
              "level": { "type": "string", "enum": ["N5", "N4", "N3", "N2", "N1"] },
              "score": { "type": "integer", "minimum": 0, "maximum": 1000 },
              "audio_script": text("Listening dialogue, one turn per line: 'A: ...\\nB: ...'. Empty if none."),
              "tech_stats": text("Optional teacher notes on progress, plans, lesson history."),
              "stats": {
                "type": "array",
                "items": {
                  "type": "object",
                  "properties": {
                    "level": { "type": "string", "enum": ["N5", "N4", "N3", "N2", "N1"] },
                    "type": {
                      "type": "string",
                      "enum": ["kanji", "vocabulary", "grammar", "reading", "listening", "reinforcement"]
                    },
                    "title": { "type": "string" },
                    "tries": { "type": "integer", "minimum": 0 },
                    "successes": { "type": "integer", "minimum": 0 },
                    "comments": { "type": "string" },
                    "kanji": { "type": "string" },
                    "word": { "type": "string" },
                    "kana": { "type": "string" },
                    "romaji": { "type": "string" },
                    "translation": { "type": "string" },
                    "source": { "type": "string", "enum": ["catalog", "generated"] }
                  },
                  "required": ["level", "type", "title", "tries", "successes", "comments"]
                }
              }
            },
            "additionalProperties": false
          }
        },
        "required": ["Student", "Bot"],
        "additionalProperties": false
      }
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn no_api_key_disables_backend() {
    let cfg = AppConfig::from_lookup(TutorFileConfig::default(), |_| None);
    assert!(cfg.openai.is_none());
    assert_eq!(cfg.port, 3000);
    assert_eq!(cfg.limits.chunk_chars, 4000);
  }

  #[test]
  fn env_overrides_defaults() {
    let env: HashMap<&str, &str> = HashMap::from([
      ("OPENAI_API_KEY", "sk-test"),
      ("OPENAI_TEXT_MODEL", "gpt-5"),
      ("VECTOR_STORE_ID", "vs_global"),
      ("PORT", "8081"),
    ]);
    let cfg = AppConfig::from_lookup(TutorFileConfig::default(), |k| env.get(k).map(|v| v.to_string()));
    let oa = cfg.openai.unwrap();
    assert_eq!(oa.text_model, "gpt-5");
    assert_eq!(oa.tts_voice, "alloy");
    assert_eq!(cfg.global_vector_store_id.as_deref(), Some("vs_global"));
    assert_eq!(cfg.port, 8081);
  }

  #[test]
  fn partial_toml_keeps_other_defaults() {
    let file: TutorFileConfig = toml::from_str(
      r#"
      [speech]
      mode = "per_speaker"
      [limits]
      chunk_chars = 1000
      "#,
    )
    .unwrap();
    assert_eq!(file.speech.mode, SpeechMode::PerSpeaker);
    assert_eq!(file.speech.gap_ms, 400);
    assert_eq!(file.limits.chunk_chars, 1000);
    assert_eq!(file.limits.chat_timeout_secs, 120);
    assert_eq!(file.prompts.audio_title, "Listening");
  }

  #[test]
  fn schema_directive_template_has_placeholder() {
    let p = Prompts::default();
    assert!(p.schema_instruction.starts_with("You MUST return a single JSON object"));
    assert!(p.schema_instruction.contains("{schema}"));
    assert_eq!(response_format()["json_schema"]["name"], "jp_teacher_bot_response");
  }
}
