//! Minimal OpenAI client for our use-cases.
//!
//! - Responses API with `file_search` over the learner's and the global vector stores
//! - vector store management (create, replace contents with a single file)
//! - text-to-speech
//!
//! Calls are instrumented and log model names, latencies, and response sizes (not contents).
//! NOTE: We never log the API key.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, instrument, warn};

use crate::backend::{AudioEncoding, ChatBackend, KnowledgeBase, SpeechBackend};
use crate::config::OpenAiSettings;
use crate::error::{Result, TutorError};
use crate::session::{ChatMessage, Role};

const UA: &str = "sensei-backend/0.1";

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub text_model: String,
  pub tts_model: String,
  timeout: Duration,
}

impl OpenAI {
  /// Build the client; `timeout` bounds every HTTP call.
  pub fn new(settings: &OpenAiSettings, timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| TutorError::Config(format!("HTTP client: {e}")))?;
    Ok(Self {
      client,
      api_key: settings.api_key.clone(),
      base_url: settings.base_url.trim_end_matches('/').to_string(),
      text_model: settings.text_model.clone(),
      tts_model: settings.tts_model.clone(),
      timeout,
    })
  }

  fn request(&self, method: Method, path: &str) -> RequestBuilder {
    self
      .client
      .request(method, format!("{}{}", self.base_url, path))
      .header(USER_AGENT, UA)
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .header("OpenAI-Beta", "assistants=v2")
  }

  /// Send and turn transport failures and non-2xx statuses into `kind` errors.
  async fn send(&self, rb: RequestBuilder, kind: fn(String) -> TutorError) -> Result<Response> {
    let res = rb.send().await.map_err(|e| {
      if e.is_timeout() { TutorError::Timeout { duration: self.timeout } } else { kind(e.to_string()) }
    })?;
    if !res.status().is_success() {
      let status = res.status();
      let body = res.text().await.unwrap_or_default();
      let msg = extract_openai_error(&body).unwrap_or(body);
      return Err(kind(format!("OpenAI HTTP {}: {}", status, msg)));
    }
    Ok(res)
  }

  async fn json<T: for<'a> Deserialize<'a>>(res: Response, kind: fn(String) -> TutorError) -> Result<T> {
    res.json::<T>().await.map_err(|e| kind(format!("invalid response body: {e}")))
  }

  /// One Responses API call. `tools` is omitted when None.
  #[instrument(level = "info", skip(self, input, tools), fields(model = %self.text_model, messages = input.len()))]
  async fn responses_call(&self, input: &[InputMessage<'_>], tools: Option<Value>) -> Result<String> {
    let req = ResponsesRequest { model: &self.text_model, input, tools };
    let start = Instant::now();
    let res = self
      .send(self.request(Method::POST, "/responses").header(CONTENT_TYPE, "application/json").json(&req), TutorError::Backend)
      .await?;
    let body: ResponsesResponse = Self::json(res, TutorError::Backend).await?;
    if let Some(usage) = &body.usage {
      info!(target: "openai", input_tokens = ?usage.input_tokens, output_tokens = ?usage.output_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    let text = body.text();
    info!(target: "openai", elapsed = ?start.elapsed(), reply_len = text.len(), "Model response received");
    Ok(text)
  }
}

#[async_trait]
impl ChatBackend for OpenAI {
  /// Modern attachment first (`vector_store_ids` on the tool); on failure, retry once with
  /// the legacy per-message `attachments`. If both fail, the first error is returned.
  async fn complete(&self, messages: &[ChatMessage], store_ids: &[String]) -> Result<String> {
    let input: Vec<InputMessage> = messages.iter().map(InputMessage::from).collect();
    if store_ids.is_empty() {
      return self.responses_call(&input, None).await;
    }

    let modern = json!([{ "type": "file_search", "vector_store_ids": store_ids }]);
    let modern_err = match self.responses_call(&input, Some(modern)).await {
      Ok(text) => return Ok(text),
      Err(e) => e,
    };
    warn!(target: "openai", error = %modern_err, "file_search with vector_store_ids failed; retrying with attachments");

    let mut legacy_input = input.clone();
    if let Some(last_user) = legacy_input.iter_mut().rev().find(|m| m.role == Role::User) {
      last_user.attachments = Some(store_ids.iter().map(|id| Attachment { vector_store_id: id }).collect());
    }
    match self.responses_call(&legacy_input, Some(json!([{ "type": "file_search" }]))).await {
      Ok(text) => {
        warn!(target: "openai", error = %modern_err, "Legacy attachments succeeded after modern call failed");
        Ok(text)
      }
      Err(legacy_err) => {
        error!(target: "openai", modern = %modern_err, legacy = %legacy_err, "Both knowledge-base call styles failed");
        Err(modern_err)
      }
    }
  }
}

#[async_trait]
impl KnowledgeBase for OpenAI {
  #[instrument(level = "info", skip(self))]
  async fn create_store(&self, name: &str) -> Result<String> {
    let res = self
      .send(self.request(Method::POST, "/vector_stores").json(&json!({ "name": name })), TutorError::KnowledgeBase)
      .await?;
    let obj: IdObject = Self::json(res, TutorError::KnowledgeBase).await?;
    info!(target: "openai", store_id = %obj.id, "Vector store created");
    Ok(obj.id)
  }

  #[instrument(level = "info", skip(self, bytes), fields(size = bytes.len()))]
  async fn replace_contents(&self, store_id: &str, file_name: &str, bytes: Vec<u8>) -> Result<()> {
    // Old files first. A failed listing is not fatal: we still upload the fresh file.
    let listed = self
      .send(self.request(Method::GET, &format!("/vector_stores/{store_id}/files")), TutorError::KnowledgeBase)
      .await;
    match listed {
      Ok(res) => {
        let list: ListObject = Self::json(res, TutorError::KnowledgeBase).await?;
        for f in list.data {
          self
            .send(
              self.request(Method::DELETE, &format!("/vector_stores/{store_id}/files/{}", f.id)),
              TutorError::KnowledgeBase,
            )
            .await?;
        }
      }
      Err(e) => warn!(target: "openai", %store_id, error = %e, "Listing vector store files failed; uploading anyway"),
    }

    let part = reqwest::multipart::Part::bytes(bytes)
      .file_name(file_name.to_string())
      .mime_str("application/json")
      .map_err(|e| TutorError::KnowledgeBase(e.to_string()))?;
    let form = reqwest::multipart::Form::new().text("purpose", "assistants").part("file", part);
    let res = self.send(self.request(Method::POST, "/files").multipart(form), TutorError::KnowledgeBase).await?;
    let uploaded: IdObject = Self::json(res, TutorError::KnowledgeBase).await?;

    self
      .send(
        self
          .request(Method::POST, &format!("/vector_stores/{store_id}/files"))
          .json(&json!({ "file_id": uploaded.id })),
        TutorError::KnowledgeBase,
      )
      .await?;
    info!(target: "openai", %store_id, file_id = %uploaded.id, %file_name, "Uploaded file to vector store");
    Ok(())
  }
}

#[async_trait]
impl SpeechBackend for OpenAI {
  #[instrument(level = "info", skip(self, text), fields(model = %self.tts_model, text_len = text.len()))]
  async fn synthesize(&self, text: &str, voice: &str, encoding: AudioEncoding) -> Result<Vec<u8>> {
    let format = match encoding {
      AudioEncoding::Mp3 => "mp3",
      AudioEncoding::Pcm => "pcm",
    };
    let body = json!({ "model": self.tts_model, "voice": voice, "input": text, "response_format": format });
    let res = self.send(self.request(Method::POST, "/audio/speech").json(&body), TutorError::Speech).await?;
    let bytes = res.bytes().await.map_err(|e| TutorError::Speech(e.to_string()))?;
    info!(target: "openai", audio_bytes = bytes.len(), "Speech synthesized");
    Ok(bytes.to_vec())
  }
}

// --- Responses DTOs ---

#[derive(Serialize)]
struct ResponsesRequest<'a> {
  model: &'a str,
  input: &'a [InputMessage<'a>],
  #[serde(skip_serializing_if = "Option::is_none")]
  tools: Option<Value>,
}

#[derive(Clone, Serialize)]
struct InputMessage<'a> {
  role: Role,
  content: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  attachments: Option<Vec<Attachment<'a>>>,
}

impl<'a> From<&'a ChatMessage> for InputMessage<'a> {
  fn from(m: &'a ChatMessage) -> Self {
    Self { role: m.role, content: &m.content, attachments: None }
  }
}

#[derive(Clone, Serialize)]
struct Attachment<'a> {
  vector_store_id: &'a str,
}

#[derive(Deserialize)]
struct ResponsesResponse {
  #[serde(default)]
  output_text: Option<String>,
  #[serde(default)]
  output: Vec<OutputItem>,
  #[serde(default)]
  usage: Option<Usage>,
}

impl ResponsesResponse {
  /// Convenience `output_text` if present, else every `output_text` content part joined.
  fn text(&self) -> String {
    if let Some(t) = self.output_text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
      return t.to_string();
    }
    self
      .output
      .iter()
      .filter(|o| o.kind == "message")
      .flat_map(|o| o.content.iter())
      .filter(|c| c.kind == "output_text")
      .filter_map(|c| c.text.as_deref())
      .collect::<Vec<_>>()
      .join("\n")
      .trim()
      .to_string()
  }
}

#[derive(Deserialize)]
struct OutputItem {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  content: Vec<ContentPart>,
}

#[derive(Deserialize)]
struct ContentPart {
  #[serde(rename = "type")]
  kind: String,
  #[serde(default)]
  text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
  #[serde(default)] input_tokens: Option<u32>,
  #[serde(default)] output_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct IdObject { id: String }

#[derive(Deserialize)]
struct ListObject {
  #[serde(default)]
  data: Vec<IdObject>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  match serde_json::from_str::<EWrap>(body) {
    Ok(w) => Some(w.error.message),
    Err(_) => None,
  }
}
