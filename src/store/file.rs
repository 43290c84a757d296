//! File-backed progress store: one directory per learner under `<data_dir>/students/`.
//!
//! ```text
//! students/<user>/state.json      score, latest notes, injection stamp, dialogue state
//! students/<user>/notes.jsonl     append-only teacher notes
//! students/<user>/practice.jsonl  append-only practice records
//! ```
//!
//! `state.json` is replaced atomically; the logs are only ever appended to.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, instrument, warn};

use super::{check_append_only, Mutation, NoteEntry, ProgressStore, ScoreRecord, UserProgress};
use crate::domain::{LoggedPractice, UserId};
use crate::error::{Result, TutorError};
use crate::util::{append_file, atomic_write, path_component};

const STATE_FILE: &str = "state.json";
const NOTES_FILE: &str = "notes.jsonl";
const PRACTICE_FILE: &str = "practice.jsonl";

/// The non-log part of [`UserProgress`], as persisted in `state.json`.
#[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
struct Snapshot {
  #[serde(default)] score: Option<ScoreRecord>,
  #[serde(default)] latest_notes: Option<String>,
  #[serde(default)] last_injected_at: Option<DateTime<Utc>>,
  #[serde(default)] last_audio_script: Option<String>,
  #[serde(default)] disclosure_pending: bool,
}

impl Snapshot {
  fn of(p: &UserProgress) -> Self {
    Self {
      score: p.score.clone(),
      latest_notes: p.latest_notes.clone(),
      last_injected_at: p.last_injected_at,
      last_audio_script: p.last_audio_script.clone(),
      disclosure_pending: p.disclosure_pending,
    }
  }
}

pub struct FileStore {
  root: PathBuf,
  locks: RwLock<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl FileStore {
  pub fn new(data_dir: impl AsRef<Path>) -> Self {
    Self { root: data_dir.as_ref().join("students"), locks: RwLock::new(HashMap::new()) }
  }

  fn user_dir(&self, user: &UserId) -> PathBuf {
    self.root.join(path_component(user.as_str()))
  }

  async fn lock_for(&self, user: &UserId) -> Arc<Mutex<()>> {
    if let Some(l) = self.locks.read().await.get(user) {
      return l.clone();
    }
    self.locks.write().await.entry(user.clone()).or_default().clone()
  }

  async fn read_state(&self, dir: &Path) -> Result<UserProgress> {
    let snap: Snapshot = match tokio::fs::read(dir.join(STATE_FILE)).await {
      Ok(bytes) => serde_json::from_slice(&bytes)?,
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
      Err(e) => return Err(storage(dir, e)),
    };
    Ok(UserProgress {
      score: snap.score,
      notes_log: read_jsonl::<NoteEntry>(&dir.join(NOTES_FILE)).await?,
      latest_notes: snap.latest_notes,
      practice_log: read_jsonl::<LoggedPractice>(&dir.join(PRACTICE_FILE)).await?,
      last_injected_at: snap.last_injected_at,
      last_audio_script: snap.last_audio_script,
      disclosure_pending: snap.disclosure_pending,
    })
  }
}

fn storage(path: &Path, e: std::io::Error) -> TutorError {
  TutorError::Storage(format!("{}: {}", path.display(), e))
}

/// Read a JSON-lines log. A torn or corrupt line is skipped with a warning.
async fn read_jsonl<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
  let text = match tokio::fs::read_to_string(path).await {
    Ok(t) => t,
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
    Err(e) => return Err(storage(path, e)),
  };
  Ok(
    text
      .lines()
      .enumerate()
      .filter(|(_, l)| !l.trim().is_empty())
      .filter_map(|(n, l)| match serde_json::from_str(l) {
        Ok(v) => Some(v),
        Err(e) => {
          warn!(target: "progress", path = %path.display(), line = n + 1, error = %e, "Skipping corrupt log line");
          None
        }
      })
      .collect(),
  )
}

async fn append_jsonl<T: Serialize>(path: &Path, entries: &[T]) -> Result<()> {
  if entries.is_empty() {
    return Ok(());
  }
  let mut buf = Vec::new();
  for e in entries {
    serde_json::to_writer(&mut buf, e)?;
    buf.push(b'\n');
  }
  append_file(path, &buf).await.map_err(|e| storage(path, e))
}

#[async_trait]
impl ProgressStore for FileStore {
  #[instrument(level = "debug", skip(self), fields(%user))]
  async fn load(&self, user: &UserId) -> Result<UserProgress> {
    let lock = self.lock_for(user).await;
    let _guard = lock.lock().await;
    self.read_state(&self.user_dir(user)).await
  }

  #[instrument(level = "debug", skip(self, f), fields(%user))]
  async fn update(&self, user: &UserId, f: Mutation) -> Result<UserProgress> {
    let lock = self.lock_for(user).await;
    let _guard = lock.lock().await;

    let dir = self.user_dir(user);
    let before = self.read_state(&dir).await?;
    let mut after = before.clone();
    f(&mut after);
    check_append_only(&before, &after)?;

    append_jsonl(&dir.join(NOTES_FILE), &after.notes_log[before.notes_log.len()..]).await?;
    append_jsonl(&dir.join(PRACTICE_FILE), &after.practice_log[before.practice_log.len()..]).await?;

    let snap = Snapshot::of(&after);
    if snap != Snapshot::of(&before) {
      let bytes = serde_json::to_vec_pretty(&snap)?;
      let path = dir.join(STATE_FILE);
      atomic_write(&path, &bytes).await.map_err(|e| storage(&path, e))?;
    }
    debug!(
      target: "progress",
      notes = after.notes_log.len(),
      practice = after.practice_log.len(),
      disclosure_pending = after.disclosure_pending,
      "Progress updated"
    );
    Ok(after)
  }
}
