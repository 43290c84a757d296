//! Chat session registry: per-learner system prompt, reply contract and message history,
//! plus the learner's knowledge-base id. Persisted as one JSON file (`chats.json`).
//!
//! A session is created on first contact and then replayed on every call. Only an
//! operator reset removes it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{error, info, instrument};

use crate::domain::UserId;
use crate::error::{Result, TutorError};
use crate::util::{atomic_write, fill_template};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role { System, User, Assistant }

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
  pub role: Role,
  pub content: String,
}

impl ChatMessage {
  pub fn new(role: Role, content: impl Into<String>) -> Self {
    Self { role, content: content.into() }
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatSession {
  pub title: String,
  #[serde(default)]
  pub description: String,
  pub system_prompt: String,
  #[serde(default)]
  pub response_format: Option<Value>,
  #[serde(default)]
  pub history: Vec<ChatMessage>,
  pub created_at: DateTime<Utc>,
}

impl ChatSession {
  /// Messages for one backend call: schema directive, system prompt, history, new message.
  /// `directive_template` gets the session's schema text in place of `{schema}`.
  pub fn request_messages(&self, directive_template: &str, user_text: &str) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(self.history.len() + 3);
    if let Some(schema) = self.response_format.as_ref().and_then(|rf| rf.get("json_schema")) {
      let schema_text = serde_json::to_string(schema).unwrap_or_else(|_| schema.to_string());
      out.push(ChatMessage::new(Role::System, fill_template(directive_template, &[("schema", &schema_text)])));
    }
    if !self.system_prompt.is_empty() {
      out.push(ChatMessage::new(Role::System, &self.system_prompt));
    }
    out.extend(self.history.iter().cloned());
    out.push(ChatMessage::new(Role::User, user_text));
    out
  }
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct SessionSummary {
  pub chat_id: String,
  pub title: String,
  pub description: String,
  pub messages: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct UserMeta {
  #[serde(default)]
  vector_store_id: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Registry {
  #[serde(default)]
  chats: BTreeMap<String, ChatSession>,
  #[serde(default)]
  users: BTreeMap<String, UserMeta>,
}

pub struct SessionStore {
  path: Option<PathBuf>,
  inner: RwLock<Registry>,
}

impl SessionStore {
  /// Open (or start) the registry file. A missing file starts empty. A corrupt one is moved
  /// aside to `<name>.corrupt-<stamp>` and the registry starts empty; other read errors fail.
  pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
    let path = path.into();
    let registry = match tokio::fs::read(&path).await {
      Ok(bytes) => match serde_json::from_slice(&bytes) {
        Ok(reg) => reg,
        Err(e) => {
          let aside = quarantine_path(&path, Utc::now());
          tokio::fs::rename(&path, &aside)
            .await
            .map_err(|re| TutorError::Storage(format!("{}: {}", path.display(), re)))?;
          error!(
            target: "sensei_backend",
            path = %path.display(),
            moved_to = %aside.display(),
            error = %e,
            "Corrupt session registry moved aside; starting empty"
          );
          Registry::default()
        }
      },
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Registry::default(),
      Err(e) => return Err(TutorError::Storage(format!("{}: {}", path.display(), e))),
    };
    info!(target: "sensei_backend", path = %path.display(), sessions = registry.chats.len(), "Session registry loaded");
    Ok(Self { path: Some(path), inner: RwLock::new(registry) })
  }

  /// Registry without a backing file.
  #[allow(dead_code)]
  pub fn in_memory() -> Self {
    Self { path: None, inner: RwLock::new(Registry::default()) }
  }

  async fn persist(&self, reg: &Registry) -> Result<()> {
    let Some(path) = &self.path else { return Ok(()) };
    let bytes = serde_json::to_vec_pretty(reg)?;
    atomic_write(path, &bytes)
      .await
      .map_err(|e| TutorError::Storage(format!("{}: {}", path.display(), e)))
  }

  /// Return the user's session, creating it with the given prompt and contract if missing.
  #[instrument(level = "debug", skip(self, system_prompt, response_format), fields(%user))]
  pub async fn ensure_session(
    &self,
    user: &UserId,
    system_prompt: &str,
    response_format: Option<Value>,
  ) -> Result<ChatSession> {
    let key = user.to_string();
    if let Some(s) = self.inner.read().await.chats.get(&key) {
      return Ok(s.clone());
    }
    let mut reg = self.inner.write().await;
    if let Some(s) = reg.chats.get(&key) {
      return Ok(s.clone());
    }
    let session = ChatSession {
      title: format!("user:{key}"),
      description: String::new(),
      system_prompt: system_prompt.to_string(),
      response_format,
      history: Vec::new(),
      created_at: Utc::now(),
    };
    reg.chats.insert(key.clone(), session.clone());
    self.persist(&reg).await?;
    info!(target: "sensei_backend", chat_id = %key, "Created chat session");
    Ok(session)
  }

  /// Append one request/response pair to the user's history.
  #[instrument(level = "debug", skip(self, user_text, assistant_text), fields(%user))]
  pub async fn record_exchange(&self, user: &UserId, user_text: &str, assistant_text: &str) -> Result<()> {
    let mut reg = self.inner.write().await;
    let session = reg
      .chats
      .get_mut(user.as_str())
      .ok_or_else(|| TutorError::Storage(format!("no chat session for {user}")))?;
    session.history.push(ChatMessage::new(Role::User, user_text));
    session.history.push(ChatMessage::new(Role::Assistant, assistant_text));
    self.persist(&reg).await
  }

  /// Operator reset: drop the session entirely. Returns whether one existed.
  pub async fn reset(&self, user: &UserId) -> Result<bool> {
    let mut reg = self.inner.write().await;
    let existed = reg.chats.remove(user.as_str()).is_some();
    if existed {
      self.persist(&reg).await?;
      info!(target: "sensei_backend", chat_id = %user, "Chat session reset");
    }
    Ok(existed)
  }

  /// Keep the session but forget its history. Returns whether the session exists.
  pub async fn clear_history(&self, user: &UserId) -> Result<bool> {
    let mut reg = self.inner.write().await;
    let Some(session) = reg.chats.get_mut(user.as_str()) else { return Ok(false) };
    session.history.clear();
    self.persist(&reg).await?;
    Ok(true)
  }

  pub async fn list(&self) -> Vec<SessionSummary> {
    self.inner.read().await.chats.iter().map(|(id, s)| summary(id, s)).collect()
  }

  /// Case-insensitive search over chat id, title and description.
  pub async fn search(&self, query: &str) -> Vec<SessionSummary> {
    let q = query.to_lowercase();
    self
      .inner
      .read()
      .await
      .chats
      .iter()
      .filter(|(id, s)| {
        id.to_lowercase().contains(&q) || s.title.to_lowercase().contains(&q) || s.description.to_lowercase().contains(&q)
      })
      .map(|(id, s)| summary(id, s))
      .collect()
  }

  /// Plain-text transcript of a session, or None when it does not exist.
  pub async fn export_text(&self, user: &UserId) -> Option<String> {
    let reg = self.inner.read().await;
    let s = reg.chats.get(user.as_str())?;
    let mut out = format!("Chat ID: {}\nTitle: {}\nDescription: {}\n\n", user, s.title, s.description);
    if !s.system_prompt.is_empty() {
      out.push_str(&format!("=== SYSTEM PROMPT ===\n{}\n\n", s.system_prompt));
    }
    if let Some(rf) = &s.response_format {
      let pretty = serde_json::to_string_pretty(rf).unwrap_or_default();
      out.push_str(&format!("=== RESPONSE FORMAT ===\n{}\n\n", pretty));
    }
    for m in &s.history {
      let role = match m.role {
        Role::System => "SYSTEM",
        Role::User => "USER",
        Role::Assistant => "ASSISTANT",
      };
      out.push_str(&format!("{}: {}\n\n", role, m.content));
    }
    Some(out)
  }

  pub async fn vector_store_id(&self, user: &UserId) -> Option<String> {
    self.inner.read().await.users.get(user.as_str()).and_then(|m| m.vector_store_id.clone())
  }

  pub async fn set_vector_store_id(&self, user: &UserId, id: &str) -> Result<()> {
    let mut reg = self.inner.write().await;
    reg.users.entry(user.to_string()).or_default().vector_store_id = Some(id.to_string());
    self.persist(&reg).await
  }
}

fn quarantine_path(path: &Path, now: DateTime<Utc>) -> PathBuf {
  let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "chats.json".into());
  path.with_file_name(format!("{}.corrupt-{}", name, now.format("%Y%m%dT%H%M%SZ")))
}

fn summary(id: &str, s: &ChatSession) -> SessionSummary {
  SessionSummary {
    chat_id: id.to_string(),
    title: s.title.clone(),
    description: s.description.clone(),
    messages: s.history.len(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::response_format;

  const DIRECTIVE: &str = "Schema: {schema}";

  #[tokio::test]
  async fn session_is_created_once_and_replayed() {
    let store = SessionStore::in_memory();
    let user = UserId::from(5_i64);
    let s = store.ensure_session(&user, "be kind", Some(response_format())).await.unwrap();
    assert_eq!(s.title, "user:5");

    store.record_exchange(&user, "hi", "{\"Student\":\"yo\",\"Bot\":{}}").await.unwrap();
    let again = store.ensure_session(&user, "ignored", None).await.unwrap();
    assert_eq!(again.system_prompt, "be kind");

    let msgs = again.request_messages(DIRECTIVE, "next");
    let roles: Vec<Role> = msgs.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::System, Role::User, Role::Assistant, Role::User]);
    assert!(msgs[0].content.starts_with("Schema: {"));
    assert_eq!(msgs[1].content, "be kind");
    assert_eq!(msgs[4].content, "next");
  }

  #[tokio::test]
  async fn registry_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chats.json");
    let user = UserId::from("abc");
    {
      let store = SessionStore::open(&path).await.unwrap();
      store.ensure_session(&user, "p", None).await.unwrap();
      store.record_exchange(&user, "q", "a").await.unwrap();
      store.set_vector_store_id(&user, "vs_123").await.unwrap();
    }
    let store = SessionStore::open(&path).await.unwrap();
    assert_eq!(store.vector_store_id(&user).await.as_deref(), Some("vs_123"));
    assert_eq!(store.list().await[0].messages, 2);
  }

  #[tokio::test]
  async fn reset_clear_search_and_export() {
    let store = SessionStore::in_memory();
    let a = UserId::from("alice");
    let b = UserId::from("bob");
    store.ensure_session(&a, "sys", None).await.unwrap();
    store.ensure_session(&b, "sys", None).await.unwrap();
    store.record_exchange(&a, "q", "a").await.unwrap();

    let found = store.search("ALI").await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].chat_id, "alice");

    let text = store.export_text(&a).await.unwrap();
    assert!(text.contains("=== SYSTEM PROMPT ===\nsys"));
    assert!(text.contains("USER: q\n\nASSISTANT: a"));

    assert!(store.clear_history(&a).await.unwrap());
    assert_eq!(store.search("alice").await[0].messages, 0);

    assert!(store.reset(&b).await.unwrap());
    assert!(!store.reset(&b).await.unwrap());
    assert!(store.export_text(&b).await.is_none());
  }

  #[tokio::test]
  async fn corrupt_registry_is_moved_aside() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chats.json");
    tokio::fs::write(&path, b"{\"chats\": {\"1\": ").await.unwrap();

    let store = SessionStore::open(&path).await.unwrap();
    assert!(store.list().await.is_empty());
    assert!(!path.exists());

    let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
    let moved = entries.next_entry().await.unwrap().unwrap();
    let name = moved.file_name().to_string_lossy().into_owned();
    assert!(name.starts_with("chats.json.corrupt-"));
    assert_eq!(tokio::fs::read(moved.path()).await.unwrap(), b"{\"chats\": {\"1\": ");

    // The next write does not touch the quarantined copy.
    store.ensure_session(&UserId::from("a"), "p", None).await.unwrap();
    assert!(path.exists());
  }

  #[tokio::test]
  async fn unreadable_registry_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    // A directory where the file should be cannot be read as bytes.
    let path = dir.path().join("chats.json");
    tokio::fs::create_dir(&path).await.unwrap();
    assert!(matches!(SessionStore::open(&path).await, Err(TutorError::Storage(_))));
  }
}
