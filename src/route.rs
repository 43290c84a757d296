//! Record router: applies one parsed reply to the learner's state and decides what they see.
//!
//! Per record, in order: score, teacher notes, practice batch, knowledge-base sync, dialogue
//! audio, visible text. Missing fields only skip their own step.
//!
//! Disclosure is a two-state flag. A turn that speaks a dialogue withholds its script and
//! arms the flag; the next turn without audio shows the script once and disarms it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::backend::KnowledgeBase;
use crate::dialogue::{parse_script, strip_dialogue};
use crate::domain::{DialogueTurn, StructuredReply, UserId};
use crate::error::{with_timeout, Result};
use crate::outbox::Outbox;
use crate::render::DialogueRenderer;
use crate::session::SessionStore;
use crate::store::{ProgressStore, UserProgress};

/// Name of the per-learner knowledge-base store.
pub fn store_name(user: &UserId) -> String {
  format!("jp_teacher_student_{user}")
}

/// File name of the practice log inside the learner's store.
pub const PRACTICE_FILE_NAME: &str = "stats.json";

/// Texts the router puts in front of the learner.
#[derive(Clone, Debug)]
pub struct RouterTexts {
  pub disclosure_heading: String,
  pub empty_reply: String,
  pub audio_title: String,
}

pub struct RecordRouter {
  store: Arc<dyn ProgressStore>,
  sessions: Arc<SessionStore>,
  kb: Arc<dyn KnowledgeBase>,
  renderer: DialogueRenderer,
  texts: RouterTexts,
  sync_timeout: Duration,
}

impl RecordRouter {
  pub fn new(
    store: Arc<dyn ProgressStore>,
    sessions: Arc<SessionStore>,
    kb: Arc<dyn KnowledgeBase>,
    renderer: DialogueRenderer,
    texts: RouterTexts,
    sync_timeout: Duration,
  ) -> Self {
    Self { store, sessions, kb, renderer, texts, sync_timeout }
  }

  /// The withheld script to show in this turn, if any. Decided once per turn: only a
  /// script already pending when the turn starts, and only if none of `replies` speaks.
  pub async fn turn_disclosure(&self, user: &UserId, replies: &[&StructuredReply]) -> Result<Option<String>> {
    if replies.iter().any(|r| speakable_dialogue(r).is_some()) {
      return Ok(None);
    }
    Ok(self.store.load(user).await?.pending_disclosure().map(str::to_string))
  }

  /// Apply `reply` for `user`, delivering audio through `outbox`. Returns the text to show.
  ///
  /// `disclosure` is the script from [`Self::turn_disclosure`]; when given, it is appended
  /// and the pending flag is cleared. Fails only when speech rendering or audio delivery
  /// fails; earlier writes are kept.
  #[instrument(level = "info", skip(self, reply, disclosure, outbox), fields(%user, disclose = disclosure.is_some()))]
  pub async fn route(
    &self,
    user: &UserId,
    reply: &StructuredReply,
    disclosure: Option<&str>,
    outbox: &mut dyn Outbox,
  ) -> Result<String> {
    let progress = self.apply_progress(user, reply).await?;

    self.sync_knowledge_base(user, &progress).await;

    if let Some((script, turns)) = speakable_dialogue(reply) {
      let audio = self.renderer.render(&turns).await?;
      let delivered = outbox.send_audio(&audio, &self.texts.audio_title).await;
      if let Err(e) = tokio::fs::remove_file(&audio.path).await {
        warn!(target: "turn", path = %audio.path.display(), error = %e, "Failed to delete rendered audio");
      }
      delivered?;

      let script_owned = script.to_string();
      self
        .store
        .update(user, Box::new(move |p: &mut UserProgress| p.record_spoken_dialogue(&script_owned)))
        .await?;
      info!(target: "turn", %user, turns = turns.len(), "Dialogue spoken; transcript withheld");
      return Ok(self.or_placeholder(strip_dialogue(&reply.student_text, &turns)));
    }

    if let Some(script) = disclosure {
      let shown = disclose(&reply.student_text, &self.texts.disclosure_heading, script);
      self
        .store
        .update(user, Box::new(|p: &mut UserProgress| p.clear_disclosure()))
        .await?;
      debug!(target: "turn", %user, "Disclosed previous dialogue transcript");
      return Ok(self.or_placeholder(shown));
    }

    Ok(self.or_placeholder(reply.student_text.trim().to_string()))
  }

  /// Steps 1-3: score, notes and practice batch, as one atomic update.
  async fn apply_progress(&self, user: &UserId, reply: &StructuredReply) -> Result<UserProgress> {
    let now = Utc::now();
    let score = reply.bot.score();
    let notes = reply.bot.tech_stats().map(str::to_string);
    let batch = reply.bot.stats();
    debug!(
      target: "progress",
      %user,
      score = ?score,
      notes = notes.is_some(),
      practice = batch.len(),
      level = ?reply.bot.level(),
      "Applying record"
    );

    self
      .store
      .update(
        user,
        Box::new(move |p: &mut UserProgress| {
          if let Some(score) = score {
            p.set_score(score, now);
          }
          if let Some(notes) = notes {
            p.append_notes(&notes, now);
          }
          if !batch.is_empty() {
            p.append_practice(batch, now);
          }
        }),
      )
      .await
  }

  /// Step 4: push the practice log to the learner's store. Never fails the turn.
  async fn sync_knowledge_base(&self, user: &UserId, progress: &UserProgress) {
    if progress.practice_log.is_empty() {
      debug!(target: "progress", %user, "Practice log empty; skipping knowledge-base sync");
      return;
    }
    let res = with_timeout(self.sync_timeout, async {
      let bytes = progress.practice_log_json()?;
      let store_id = self.user_store_id(user).await?;
      self.kb.replace_contents(&store_id, PRACTICE_FILE_NAME, bytes).await
    })
    .await;
    match res {
      Ok(()) => debug!(target: "progress", %user, entries = progress.practice_log.len(), "Knowledge base synced"),
      Err(e) => warn!(target: "progress", %user, error = %e, "Knowledge-base sync failed; continuing"),
    }
  }

  /// The learner's store id, creating the store on first use.
  async fn user_store_id(&self, user: &UserId) -> Result<String> {
    if let Some(id) = self.sessions.vector_store_id(user).await {
      return Ok(id);
    }
    let id = self.kb.create_store(&store_name(user)).await?;
    self.sessions.set_vector_store_id(user, &id).await?;
    info!(target: "progress", %user, store_id = %id, "Created learner knowledge-base store");
    Ok(id)
  }

  fn or_placeholder(&self, text: String) -> String {
    if text.trim().is_empty() { self.texts.empty_reply.clone() } else { text }
  }
}

/// The reply's dialogue script and its turns, if at least one line has something to say.
/// A script like `"A:"` parses but is silent, and counts as no audio.
pub fn speakable_dialogue(reply: &StructuredReply) -> Option<(&str, Vec<DialogueTurn>)> {
  let script = reply.bot.audio_script()?;
  let turns = parse_script(script);
  if turns.iter().all(|t| t.utterance.trim().is_empty()) {
    debug!(target: "turn", "Dialogue script has no speakable lines; no audio this turn");
    return None;
  }
  Some((script, turns))
}

/// Reply text followed by the withheld script, line breaks kept.
fn disclose(text: &str, heading: &str, script: &str) -> String {
  let text = text.trim();
  if text.is_empty() {
    format!("{heading}\n{script}")
  } else {
    format!("{text}\n\n{heading}\n{script}")
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use crate::config::SpeechSettings;
  use crate::outbox::{CollectingOutbox, OutboundEvent};
  use crate::render::tests::FakeSpeech;
  use crate::store::MemoryStore;
  use async_trait::async_trait;
  use serde_json::json;
  use tokio::sync::Mutex;

  /// Knowledge base that records uploads, or fails every call.
  #[derive(Default)]
  pub(crate) struct FakeKb {
    pub fail: bool,
    pub created: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<(String, String, Vec<u8>)>>,
  }

  #[async_trait]
  impl KnowledgeBase for FakeKb {
    async fn create_store(&self, name: &str) -> Result<String> {
      if self.fail {
        return Err(crate::error::TutorError::KnowledgeBase("kb down".into()));
      }
      self.created.lock().await.push(name.to_string());
      Ok(format!("vs_{name}"))
    }

    async fn replace_contents(&self, store_id: &str, file_name: &str, bytes: Vec<u8>) -> Result<()> {
      if self.fail {
        return Err(crate::error::TutorError::KnowledgeBase("kb down".into()));
      }
      self.uploads.lock().await.push((store_id.into(), file_name.into(), bytes));
      Ok(())
    }
  }

  pub(crate) fn texts() -> RouterTexts {
    RouterTexts {
      disclosure_heading: "Transcript:".into(),
      empty_reply: "(empty)".into(),
      audio_title: "Listening".into(),
    }
  }

  struct Fixture {
    _dir: tempfile::TempDir,
    out_dir: std::path::PathBuf,
    store: Arc<MemoryStore>,
    kb: Arc<FakeKb>,
    router: RecordRouter,
  }

  fn fixture(speech: FakeSpeech, kb: FakeKb) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let out_dir = dir.path().join("out_audio");
    let store = Arc::new(MemoryStore::new());
    let kb = Arc::new(kb);
    let renderer = DialogueRenderer::new(
      Arc::new(speech),
      SpeechSettings::default(),
      "alloy",
      &out_dir,
      Duration::from_secs(5),
    );
    let router = RecordRouter::new(
      store.clone(),
      Arc::new(SessionStore::in_memory()),
      kb.clone(),
      renderer,
      texts(),
      Duration::from_secs(5),
    );
    Fixture { _dir: dir, out_dir, store, kb, router }
  }

  /// One single-record turn, deciding disclosure the way the pipeline does.
  async fn turn(f: &Fixture, user: &UserId, r: &StructuredReply, out: &mut CollectingOutbox) -> Result<String> {
    let disclosure = f.router.turn_disclosure(user, &[r]).await?;
    f.router.route(user, r, disclosure.as_deref(), out).await
  }

  fn reply(v: serde_json::Value) -> StructuredReply {
    serde_json::from_value(v).unwrap()
  }

  #[tokio::test]
  async fn disclosure_runs_quiet_pending_quiet() {
    let f = fixture(FakeSpeech::default(), FakeKb::default());
    let user = UserId::from(1_i64);
    let mut out = CollectingOutbox::default();

    let t1 = reply(json!({
      "Student": "Listen:\nA: hello\nB: hi\nWhat did B say?",
      "Bot": { "audio_script": "A: hello\nB: hi" }
    }));
    let shown = turn(&f, &user, &t1, &mut out).await.unwrap();
    assert_eq!(shown, "Listen:\nWhat did B say?");
    assert!(matches!(out.events[0], OutboundEvent::Audio { .. }));
    let p = f.store.load(&user).await.unwrap();
    assert!(p.disclosure_pending);
    assert_eq!(p.last_audio_script.as_deref(), Some("A: hello\nB: hi"));

    let t2 = reply(json!({ "Student": "Correct!", "Bot": { "audio_script": "" } }));
    let shown = turn(&f, &user, &t2, &mut out).await.unwrap();
    assert_eq!(shown, "Correct!\n\nTranscript:\nA: hello\nB: hi");
    assert!(!f.store.load(&user).await.unwrap().disclosure_pending);

    let t3 = reply(json!({ "Student": "Next topic.", "Bot": {} }));
    assert_eq!(turn(&f, &user, &t3, &mut out).await.unwrap(), "Next topic.");
  }

  #[tokio::test]
  async fn rendered_audio_is_deleted_after_delivery() {
    let f = fixture(FakeSpeech::default(), FakeKb::default());
    let mut out = CollectingOutbox::default();
    let r = reply(json!({ "Student": "x", "Bot": { "audio_script": "A: はい" } }));
    turn(&f, &UserId::from("u"), &r, &mut out).await.unwrap();

    let mut entries = tokio::fs::read_dir(&f.out_dir).await.unwrap();
    assert!(entries.next_entry().await.unwrap().is_none());
  }

  #[tokio::test]
  async fn new_dialogue_replaces_pending_one() {
    let f = fixture(FakeSpeech::default(), FakeKb::default());
    let user = UserId::from("u");
    let mut out = CollectingOutbox::default();
    for script in ["A: one", "B: two"] {
      let r = reply(json!({ "Student": "", "Bot": { "audio_script": script } }));
      assert_eq!(turn(&f, &user, &r, &mut out).await.unwrap(), "(empty)");
    }
    let p = f.store.load(&user).await.unwrap();
    assert_eq!(p.pending_disclosure(), Some("B: two"));
  }

  #[tokio::test]
  async fn speech_failure_keeps_flag_and_earlier_writes() {
    let f = fixture(FakeSpeech { fail: true, ..Default::default() }, FakeKb::default());
    let user = UserId::from("u");
    let mut out = CollectingOutbox::default();
    let r = reply(json!({ "Student": "x", "Bot": { "score": 10, "audio_script": "A: hi" } }));
    assert!(turn(&f, &user, &r, &mut out).await.is_err());

    let p = f.store.load(&user).await.unwrap();
    assert_eq!(p.score.map(|s| s.score), Some(10));
    assert!(!p.disclosure_pending);
    assert!(out.events.is_empty());
  }

  #[tokio::test]
  async fn score_survives_a_record_without_score() {
    let f = fixture(FakeSpeech::default(), FakeKb::default());
    let user = UserId::from("u");
    let mut out = CollectingOutbox::default();
    turn(&f, &user, &reply(json!({ "Student": "a", "Bot": { "score": 742 } })), &mut out).await.unwrap();
    turn(&f, &user, &reply(json!({ "Student": "b", "Bot": { "level": "N4" } })), &mut out).await.unwrap();
    assert_eq!(f.store.load(&user).await.unwrap().score.map(|s| s.score), Some(742));
  }

  #[tokio::test]
  async fn practice_log_is_synced_to_learner_store() {
    let f = fixture(FakeSpeech::default(), FakeKb::default());
    let user = UserId::from(7_i64);
    let mut out = CollectingOutbox::default();

    // Nothing logged yet: no store is created.
    turn(&f, &user, &reply(json!({ "Student": "a", "Bot": {} })), &mut out).await.unwrap();
    assert!(f.kb.created.lock().await.is_empty());

    let stats = json!([{ "level": "N5", "type": "kanji", "title": "日", "tries": 1, "successes": 1, "comments": "" }]);
    for _ in 0..2 {
      let r = reply(json!({ "Student": "b", "Bot": { "stats": stats } }));
      turn(&f, &user, &r, &mut out).await.unwrap();
    }

    assert_eq!(*f.kb.created.lock().await, vec!["jp_teacher_student_7".to_string()]);
    let uploads = f.kb.uploads.lock().await;
    assert_eq!(uploads.len(), 2);
    assert_eq!(uploads[1].0, "vs_jp_teacher_student_7");
    assert_eq!(uploads[1].1, PRACTICE_FILE_NAME);
    let logged: Vec<serde_json::Value> = serde_json::from_slice(&uploads[1].2).unwrap();
    assert_eq!(logged.len(), 2);
  }

  #[tokio::test]
  async fn knowledge_base_failure_is_swallowed() {
    let f = fixture(FakeSpeech::default(), FakeKb { fail: true, ..Default::default() });
    let user = UserId::from("u");
    let mut out = CollectingOutbox::default();
    let r = reply(json!({
      "Student": "ok",
      "Bot": { "stats": [{ "level": "N5", "type": "grammar", "title": "は", "tries": 1, "successes": 0, "comments": "" }] }
    }));
    assert_eq!(turn(&f, &user, &r, &mut out).await.unwrap(), "ok");
    assert_eq!(f.store.load(&user).await.unwrap().practice_log.len(), 1);
  }

  #[tokio::test]
  async fn notes_are_appended_not_replaced() {
    let f = fixture(FakeSpeech::default(), FakeKb::default());
    let user = UserId::from("u");
    let mut out = CollectingOutbox::default();
    for notes in ["first", "second"] {
      let r = reply(json!({ "Student": "s", "Bot": { "tech_stats": notes } }));
      turn(&f, &user, &r, &mut out).await.unwrap();
    }
    let p = f.store.load(&user).await.unwrap();
    assert_eq!(p.notes_log.len(), 2);
    assert_eq!(p.latest_notes(), Some("second"));
  }

  #[tokio::test]
  async fn silent_script_is_no_audio() {
    let f = fixture(FakeSpeech { fail: true, ..Default::default() }, FakeKb::default());
    let user = UserId::from("u");
    let mut out = CollectingOutbox::default();
    f.store
      .update(&user, Box::new(|p: &mut UserProgress| p.record_spoken_dialogue("A: earlier")))
      .await
      .unwrap();

    for script in ["A:", "A:\nB：  "] {
      let r = reply(json!({ "Student": "Some lesson text", "Bot": { "score": 5, "audio_script": script } }));
      assert!(speakable_dialogue(&r).is_none());
      assert_eq!(f.router.route(&user, &r, None, &mut out).await.unwrap(), "Some lesson text");
    }

    assert!(out.events.is_empty());
    let p = f.store.load(&user).await.unwrap();
    assert_eq!(p.score.as_ref().map(|s| s.score), Some(5));
    assert_eq!(p.pending_disclosure(), Some("A: earlier"));
  }

  #[tokio::test]
  async fn disclosure_is_skipped_when_the_turn_speaks() {
    let f = fixture(FakeSpeech::default(), FakeKb::default());
    let user = UserId::from("u");
    f.store
      .update(&user, Box::new(|p: &mut UserProgress| p.record_spoken_dialogue("A: earlier")))
      .await
      .unwrap();
    let spoken = reply(json!({ "Student": "x", "Bot": { "audio_script": "A: new" } }));
    let plain = reply(json!({ "Student": "y", "Bot": {} }));
    assert_eq!(f.router.turn_disclosure(&user, &[&plain, &spoken]).await.unwrap(), None);
    assert_eq!(f.router.turn_disclosure(&user, &[&plain]).await.unwrap().as_deref(), Some("A: earlier"));
  }
}
