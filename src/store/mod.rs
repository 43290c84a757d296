//! Per-user learner progress: score, teacher notes, practice log, injection date and
//! dialogue disclosure state.
//!
//! Storage is behind [`ProgressStore`], whose `update` is an atomic read-modify-write for
//! one user key. Logs are append-only: an update that shrinks a log is rejected.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{LoggedPractice, PracticeRecord, UserId};
use crate::error::{Result, TutorError};

pub mod file;
pub mod memory;

pub use file::FileStore;
#[allow(unused_imports)]
pub use memory::MemoryStore;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScoreRecord {
  pub score: u32,
  pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct NoteEntry {
  pub recorded_at: DateTime<Utc>,
  pub text: String,
}

/// Everything we keep about one learner. Created lazily, never deleted.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserProgress {
  pub score: Option<ScoreRecord>,
  pub notes_log: Vec<NoteEntry>,
  pub latest_notes: Option<String>,
  pub practice_log: Vec<LoggedPractice>,
  pub last_injected_at: Option<DateTime<Utc>>,
  pub last_audio_script: Option<String>,
  pub disclosure_pending: bool,
}

impl UserProgress {
  pub fn set_score(&mut self, score: u32, now: DateTime<Utc>) {
    self.score = Some(ScoreRecord { score, updated_at: now });
  }

  /// Append to the notes log and replace the "latest" snapshot. Blank notes are ignored.
  pub fn append_notes(&mut self, notes: &str, now: DateTime<Utc>) {
    let text = notes.trim();
    if text.is_empty() {
      return;
    }
    self.notes_log.push(NoteEntry { recorded_at: now, text: text.to_string() });
    self.latest_notes = Some(text.to_string());
  }

  /// Latest notes snapshot, if present and non-blank.
  pub fn latest_notes(&self) -> Option<&str> {
    self.latest_notes.as_deref().map(str::trim).filter(|s| !s.is_empty())
  }

  /// Append a batch of practice records; every entry gets the same batch timestamp.
  pub fn append_practice(&mut self, batch: Vec<PracticeRecord>, now: DateTime<Utc>) {
    self
      .practice_log
      .extend(batch.into_iter().map(|record| LoggedPractice { recorded_at: now, record }));
  }

  /// A dialogue was spoken: remember its script and arm the one-time disclosure.
  /// A pending older script is replaced.
  pub fn record_spoken_dialogue(&mut self, script: &str) {
    self.last_audio_script = Some(script.to_string());
    self.disclosure_pending = true;
  }

  /// The withheld script, if a disclosure is pending.
  pub fn pending_disclosure(&self) -> Option<&str> {
    if self.disclosure_pending { self.last_audio_script.as_deref() } else { None }
  }

  pub fn clear_disclosure(&mut self) {
    self.disclosure_pending = false;
  }

  /// The practice log as a pretty JSON array, for knowledge-base upload.
  pub fn practice_log_json(&self) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(&self.practice_log)?)
  }
}

/// Closure applied to one user's progress under that user's lock.
pub type Mutation = Box<dyn FnOnce(&mut UserProgress) + Send>;

/// Reject updates that rewrote or dropped already-logged entries.
pub(crate) fn check_append_only(before: &UserProgress, after: &UserProgress) -> Result<()> {
  if after.notes_log.starts_with(&before.notes_log) && after.practice_log.starts_with(&before.practice_log) {
    Ok(())
  } else {
    Err(TutorError::Storage("append-only log was rewritten".into()))
  }
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
  /// Current progress; a user never seen before reads as the default.
  async fn load(&self, user: &UserId) -> Result<UserProgress>;

  /// Atomically apply `f` to the user's progress and persist the result.
  async fn update(&self, user: &UserId, f: Mutation) -> Result<UserProgress>;
}
