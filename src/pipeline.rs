//! One tutoring turn, end to end.
//!
//! inbound text → daily notes injection → backend call with the learner's session and stores →
//! record extraction → routing per record → chunked text (and audio) out.
//!
//! Turns for the same learner run one at a time; different learners run concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{ChatBackend, KnowledgeBase, SpeechBackend};
use crate::config::{response_format, AppConfig, Limits, Prompts};
use crate::domain::{StructuredReply, UserId};
use crate::error::{with_timeout, Result};
use crate::extract::extract_records;
use crate::inject::inject_daily_notes;
use crate::outbox::{send_chunked, Outbox};
use crate::render::DialogueRenderer;
use crate::route::{RecordRouter, RouterTexts};
use crate::session::SessionStore;
use crate::store::ProgressStore;
use crate::util::{fill_template, trunc_for_log};

/// External collaborators of the tutor, handed in by whoever wires the process.
#[derive(Clone)]
pub struct Collaborators {
  pub store: Arc<dyn ProgressStore>,
  pub sessions: Arc<SessionStore>,
  pub chat: Arc<dyn ChatBackend>,
  pub kb: Arc<dyn KnowledgeBase>,
  pub speech: Arc<dyn SpeechBackend>,
}

pub struct TutorService {
  store: Arc<dyn ProgressStore>,
  sessions: Arc<SessionStore>,
  chat: Arc<dyn ChatBackend>,
  router: RecordRouter,
  prompts: Prompts,
  limits: Limits,
  response_format: Value,
  global_store_id: Option<String>,
  turn_locks: RwLock<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl TutorService {
  pub fn new(config: &AppConfig, c: Collaborators) -> Self {
    let default_voice = config.openai.as_ref().map(|o| o.tts_voice.clone()).unwrap_or_else(|| "alloy".into());
    let renderer = DialogueRenderer::new(
      c.speech,
      config.speech.clone(),
      default_voice,
      config.data_dir.join("out_audio"),
      config.limits.speech_timeout(),
    );
    let texts = RouterTexts {
      disclosure_heading: config.prompts.disclosure_heading.clone(),
      empty_reply: config.prompts.empty_reply.clone(),
      audio_title: config.prompts.audio_title.clone(),
    };
    let router = RecordRouter::new(
      c.store.clone(),
      c.sessions.clone(),
      c.kb,
      renderer,
      texts,
      config.limits.sync_timeout(),
    );
    Self {
      store: c.store,
      sessions: c.sessions,
      chat: c.chat,
      router,
      prompts: config.prompts.clone(),
      limits: config.limits.clone(),
      response_format: response_format(),
      global_store_id: config.global_vector_store_id.clone(),
      turn_locks: RwLock::new(HashMap::new()),
    }
  }

  pub fn sessions(&self) -> &SessionStore {
    &self.sessions
  }

  async fn lock_for(&self, user: &UserId) -> Arc<Mutex<()>> {
    if let Some(l) = self.turn_locks.read().await.get(user) {
      return l.clone();
    }
    self.turn_locks.write().await.entry(user.clone()).or_default().clone()
  }

  /// Handle one inbound message. Failures reach the learner as one error message.
  #[instrument(level = "info", skip(self, text, outbox), fields(%user, text_len = text.len()))]
  pub async fn handle_message(&self, user: &UserId, text: &str, outbox: &mut dyn Outbox) {
    if text.trim().is_empty() {
      debug!(target: "turn", %user, "Ignoring empty message");
      return;
    }
    let lock = self.lock_for(user).await;
    let _turn = lock.lock().await;

    let started = Instant::now();
    match self.run_turn(user, text, outbox).await {
      Ok(records) => {
        info!(target: "turn", %user, records, elapsed_ms = started.elapsed().as_millis() as u64, "Turn complete")
      }
      Err(e) => {
        error!(target: "turn", %user, error = %e, elapsed_ms = started.elapsed().as_millis() as u64, "Turn failed");
        let reason = e.to_string();
        let message = fill_template(&self.prompts.error_template, &[("reason", &reason)]);
        if let Err(e) = outbox.send_text(&message).await {
          warn!(target: "turn", %user, error = %e, "Could not deliver error message");
        }
      }
    }
  }

  /// Returns the number of records routed.
  async fn run_turn(&self, user: &UserId, text: &str, outbox: &mut dyn Outbox) -> Result<usize> {
    let outgoing = inject_daily_notes(self.store.as_ref(), user, text, &self.prompts.injection_header, Utc::now()).await?;

    let session = self
      .sessions
      .ensure_session(user, &self.prompts.system_prompt, Some(self.response_format.clone()))
      .await?;
    let messages = session.request_messages(&self.prompts.schema_instruction, &outgoing);

    let store_ids: Vec<String> =
      self.sessions.vector_store_id(user).await.into_iter().chain(self.global_store_id.clone()).collect();

    let raw = with_timeout(self.limits.chat_timeout(), self.chat.complete(&messages, &store_ids)).await?;
    debug!(target: "turn", %user, reply = %trunc_for_log(&raw, 400), "Backend reply");
    self.sessions.record_exchange(user, &outgoing, &raw).await?;

    let candidates = extract_records(&raw);
    if candidates.is_empty() {
      warn!(target: "turn", %user, "No structured record in reply; showing raw text");
      let shown = if raw.trim().is_empty() { self.prompts.empty_reply.clone() } else { raw };
      send_chunked(outbox, &shown, self.limits.chunk_chars).await?;
      return Ok(0);
    }

    // Parse everything first: whether this turn speaks decides disclosure for all records.
    let parsed: Vec<(String, serde_json::Result<StructuredReply>)> = candidates
      .into_iter()
      .map(|c| {
        let reply = serde_json::from_str::<StructuredReply>(&c);
        (c, reply)
      })
      .collect();
    let replies: Vec<&StructuredReply> = parsed.iter().filter_map(|(_, r)| r.as_ref().ok()).collect();
    let mut disclosure = self.router.turn_disclosure(user, &replies).await?;

    let mut routed = 0;
    for (candidate, reply) in &parsed {
      match reply {
        Ok(reply) => {
          let shown = self.router.route(user, reply, disclosure.take().as_deref(), outbox).await?;
          send_chunked(outbox, &shown, self.limits.chunk_chars).await?;
          routed += 1;
        }
        Err(e) => {
          warn!(target: "turn", %user, error = %e, "Record failed strict parsing; showing as text");
          send_chunked(outbox, candidate, self.limits.chunk_chars).await?;
        }
      }
    }
    Ok(routed)
  }
}
