//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.

use serde::{Deserialize, Serialize};

use crate::domain::UserId;
use crate::outbox::{AudioOut, OutboundEvent};
use crate::session::SessionSummary;

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    Message {
        #[serde(rename = "userId")]
        user_id: UserId,
        text: String,
    },
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Text {
        text: String,
    },
    Audio {
        #[serde(flatten)]
        audio: AudioOut,
    },
    Error {
        message: String,
    },
}

impl From<OutboundEvent> for ServerWsMessage {
    fn from(e: OutboundEvent) -> Self {
        match e {
            OutboundEvent::Text(text) => ServerWsMessage::Text { text },
            OutboundEvent::Audio { title, mime, bytes } => ServerWsMessage::Audio {
                audio: AudioOut::encode(&title, &mime, &bytes),
            },
        }
    }
}

//
// HTTP request/response DTOs
//

#[derive(Debug, Deserialize)]
pub struct MessageIn {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub text: String,
}

/// Everything one turn produced, in order of text; audio (if any) attached separately.
#[derive(Debug, Serialize, Default)]
pub struct MessageOut {
    pub messages: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioOut>,
}

impl MessageOut {
    pub fn from_events(events: Vec<OutboundEvent>) -> Self {
        let mut out = MessageOut::default();
        for e in events {
            match e {
                OutboundEvent::Text(t) => out.messages.push(t),
                OutboundEvent::Audio { title, mime, bytes } => {
                    out.audio = Some(AudioOut::encode(&title, &mime, &bytes));
                }
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub q: Option<String>,
}

#[derive(Serialize)]
pub struct SessionsOut {
    pub sessions: Vec<SessionSummary>,
}

#[derive(Serialize)]
pub struct SessionActionOut {
    pub ok: bool,
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
}
