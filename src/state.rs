//! Application state: the tutor service and the session registry behind the routes.
//!
//! Built once at startup from [`AppConfig`]. Without an API key the tutor still runs, but
//! every backend call fails with a configuration error that the learner sees.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::backend::{ChatBackend, Disabled, KnowledgeBase, SpeechBackend};
use crate::config::AppConfig;
use crate::error::Result;
use crate::openai::OpenAI;
use crate::pipeline::{Collaborators, TutorService};
use crate::session::SessionStore;
use crate::store::FileStore;

pub struct AppState {
  pub tutor: TutorService,
}

impl AppState {
  pub fn new(tutor: TutorService) -> Self {
    Self { tutor }
  }

  /// Wire file-backed stores under DATA_DIR and the OpenAI client (or [`Disabled`]).
  #[instrument(level = "info", skip_all, fields(data_dir = %config.data_dir.display()))]
  pub async fn from_config(config: &AppConfig) -> Result<Self> {
    tokio::fs::create_dir_all(&config.data_dir).await?;
    let sessions = Arc::new(SessionStore::open(config.data_dir.join("chats.json")).await?);
    let store = Arc::new(FileStore::new(&config.data_dir));

    let (chat, kb, speech): (Arc<dyn ChatBackend>, Arc<dyn KnowledgeBase>, Arc<dyn SpeechBackend>) =
      match &config.openai {
        Some(settings) => {
          let oa = Arc::new(OpenAI::new(settings, config.limits.chat_timeout())?);
          info!(
            target: "sensei_backend",
            base_url = %settings.base_url,
            text_model = %settings.text_model,
            tts_model = %settings.tts_model,
            global_store = ?config.global_vector_store_id,
            "OpenAI enabled."
          );
          (oa.clone() as Arc<dyn ChatBackend>, oa.clone() as Arc<dyn KnowledgeBase>, oa as Arc<dyn SpeechBackend>)
        }
        None => {
          warn!(target: "sensei_backend", "OpenAI disabled (no OPENAI_API_KEY). Turns will report a configuration error.");
          let d = Arc::new(Disabled);
          (d.clone() as Arc<dyn ChatBackend>, d.clone() as Arc<dyn KnowledgeBase>, d as Arc<dyn SpeechBackend>)
        }
      };

    let tutor = TutorService::new(config, Collaborators { store, sessions, chat, kb, speech });
    Ok(Self::new(tutor))
  }
}
