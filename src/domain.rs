//! Domain models: learner identity, the structured reply contract, practice records and dialogue turns.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Opaque, stable end-user identifier. Transports may hand us integers or strings;
/// both normalize to the same textual key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
  pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
  pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for UserId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<i64> for UserId {
  fn from(v: i64) -> Self { Self(v.to_string()) }
}

impl From<&str> for UserId {
  fn from(v: &str) -> Self { Self(v.to_string()) }
}

impl<'de> Deserialize<'de> for UserId {
  fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw { Int(i64), Str(String) }
    Ok(match Raw::deserialize(d)? {
      Raw::Int(i) => UserId::from(i),
      Raw::Str(s) => UserId(s),
    })
  }
}

/// JLPT-style proficiency estimate.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum Level { N5, N4, N3, N2, N1 }

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PracticeKind {
  Kanji,
  Vocabulary,
  Grammar,
  Reading,
  Listening,
  Reinforcement,
}

/// Whether a practice item came from the reference catalog or was made up by the model.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PracticeSource { Catalog, Generated }

/// One logged unit of learner exercise activity. Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PracticeRecord {
  pub level: Level,
  #[serde(rename = "type")]
  pub kind: PracticeKind,
  pub title: String,
  pub tries: u32,
  pub successes: u32,
  #[serde(default)]
  pub comments: String,
  #[serde(default, skip_serializing_if = "Option::is_none")] pub kanji: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")] pub word: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")] pub kana: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")] pub romaji: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")] pub translation: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")] pub source: Option<PracticeSource>,
}

/// A practice record as stored in the append-only log.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LoggedPractice {
  pub recorded_at: DateTime<Utc>,
  #[serde(flatten)]
  pub record: PracticeRecord,
}

/// The two-part reply contract: text for the learner plus a machine side channel.
///
/// Only the presence of both parts is enforced at parse time. Every field inside `Bot`
/// is read leniently so that one bad field never blocks the others.
#[derive(Clone, Debug, Deserialize)]
pub struct StructuredReply {
  #[serde(rename = "Student", alias = "student_text")]
  pub student_text: String,
  #[serde(rename = "Bot", alias = "bot")]
  pub bot: BotSection,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(transparent)]
pub struct BotSection(pub Map<String, Value>);

pub const MAX_SCORE: i64 = 1000;

impl BotSection {
  pub fn level(&self) -> Option<Level> {
    self.0.get("level").and_then(|v| serde_json::from_value(v.clone()).ok())
  }

  /// Integer score within 0..=1000. Non-integers and out-of-range values read as absent.
  pub fn score(&self) -> Option<u32> {
    let raw = self.0.get("score")?.as_i64()?;
    if (0..=MAX_SCORE).contains(&raw) {
      Some(raw as u32)
    } else {
      warn!(target: "progress", score = raw, "Ignoring out-of-range score");
      None
    }
  }

  /// Trimmed audio script, or None when absent or blank.
  pub fn audio_script(&self) -> Option<&str> {
    non_blank(self.0.get("audio_script"))
  }

  pub fn tech_stats(&self) -> Option<&str> {
    non_blank(self.0.get("tech_stats"))
  }

  /// Well-formed practice records, in order. Malformed entries are skipped one by one.
  pub fn stats(&self) -> Vec<PracticeRecord> {
    let Some(Value::Array(items)) = self.0.get("stats") else { return Vec::new() };
    items
      .iter()
      .enumerate()
      .filter_map(|(idx, item)| match serde_json::from_value::<PracticeRecord>(item.clone()) {
        Ok(r) => Some(r),
        Err(e) => {
          warn!(target: "progress", idx, error = %e, "Skipping malformed practice record");
          None
        }
      })
      .collect()
  }
}

fn non_blank(v: Option<&Value>) -> Option<&str> {
  v.and_then(Value::as_str).map(str::trim).filter(|s| !s.is_empty())
}

/// One spoken line of a dialogue script, in playback order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueTurn {
  pub speaker: String,
  pub utterance: String,
}

impl DialogueTurn {
  pub fn new(speaker: impl Into<String>, utterance: impl Into<String>) -> Self {
    Self { speaker: speaker.into(), utterance: utterance.into() }
  }
}
