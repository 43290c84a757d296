//! Dialogue renderer: turns parsed dialogue into one playable audio file.
//!
//! `single` mode sends the whole script to one voice (mp3). `per_speaker` mode gives each
//! speaker its own voice, synthesizes every utterance as raw PCM and joins them with a fixed
//! silence gap into a WAV file. Either way the file holds the full script in order.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument};

use crate::backend::{AudioEncoding, SpeechBackend};
use crate::config::{SpeechMode, SpeechSettings};
use crate::domain::DialogueTurn;
use crate::error::{with_timeout, Result, TutorError};

/// Sample rate of the provider's raw PCM output.
const PCM_SAMPLE_RATE: u32 = 24_000;

/// One normalized utterance with its assigned voice.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Utterance {
  pub speaker: String,
  pub text: String,
  pub voice: String,
}

/// A rendered, transient audio file. The caller deletes it after delivery.
#[derive(Clone, Debug)]
pub struct RenderedAudio {
  pub path: PathBuf,
  pub mime: &'static str,
}

fn normalize(text: &str) -> String {
  text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Normalize turns and assign voices. Speakers get pool voices in order of first appearance
/// (wrapping around); untagged lines use `narrator`. Empty utterances are dropped.
pub fn assign_voices(turns: &[DialogueTurn], pool: &[String], narrator: &str) -> Vec<Utterance> {
  let mut by_speaker: HashMap<&str, String> = HashMap::new();
  let mut out = Vec::with_capacity(turns.len());
  for t in turns {
    let text = normalize(&t.utterance);
    if text.is_empty() {
      continue;
    }
    let voice = if t.speaker.is_empty() || pool.is_empty() {
      narrator.to_string()
    } else {
      let next = pool[by_speaker.len() % pool.len()].clone();
      by_speaker.entry(t.speaker.as_str()).or_insert(next).clone()
    };
    out.push(Utterance { speaker: t.speaker.clone(), text, voice });
  }
  out
}

/// Wrap 16-bit mono PCM in a minimal RIFF/WAVE header.
pub fn wav_from_pcm(pcm: &[u8], sample_rate: u32) -> Vec<u8> {
  let data_len = pcm.len() as u32;
  let mut out = Vec::with_capacity(44 + pcm.len());
  out.extend_from_slice(b"RIFF");
  out.extend_from_slice(&(36 + data_len).to_le_bytes());
  out.extend_from_slice(b"WAVEfmt ");
  out.extend_from_slice(&16u32.to_le_bytes()); // fmt chunk size
  out.extend_from_slice(&1u16.to_le_bytes()); // PCM
  out.extend_from_slice(&1u16.to_le_bytes()); // mono
  out.extend_from_slice(&sample_rate.to_le_bytes());
  out.extend_from_slice(&(sample_rate * 2).to_le_bytes()); // byte rate
  out.extend_from_slice(&2u16.to_le_bytes()); // block align
  out.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
  out.extend_from_slice(b"data");
  out.extend_from_slice(&data_len.to_le_bytes());
  out.extend_from_slice(pcm);
  out
}

fn silence(gap_ms: u64) -> Vec<u8> {
  let samples = PCM_SAMPLE_RATE as u64 * gap_ms / 1000;
  vec![0u8; (samples * 2) as usize]
}

pub struct DialogueRenderer {
  speech: Arc<dyn SpeechBackend>,
  settings: SpeechSettings,
  default_voice: String,
  out_dir: PathBuf,
  call_timeout: Duration,
}

impl DialogueRenderer {
  pub fn new(
    speech: Arc<dyn SpeechBackend>,
    settings: SpeechSettings,
    default_voice: impl Into<String>,
    out_dir: impl Into<PathBuf>,
    call_timeout: Duration,
  ) -> Self {
    Self { speech, settings, default_voice: default_voice.into(), out_dir: out_dir.into(), call_timeout }
  }

  /// Synthesize `turns` into a new file under the output directory.
  #[instrument(level = "info", skip(self, turns), fields(turns = turns.len(), mode = ?self.settings.mode))]
  pub async fn render(&self, turns: &[DialogueTurn]) -> Result<RenderedAudio> {
    let utterances = assign_voices(turns, &self.settings.voices, &self.default_voice);
    if utterances.is_empty() {
      return Err(TutorError::Speech("dialogue has no speakable lines".into()));
    }

    let (bytes, ext, mime) = match self.settings.mode {
      SpeechMode::Single => {
        let script = utterances
          .iter()
          .map(|u| if u.speaker.is_empty() { u.text.clone() } else { format!("{}: {}", u.speaker, u.text) })
          .collect::<Vec<_>>()
          .join("\n");
        let audio = with_timeout(
          self.call_timeout,
          self.speech.synthesize(&script, &self.default_voice, AudioEncoding::Mp3),
        )
        .await?;
        (audio, "mp3", "audio/mpeg")
      }
      SpeechMode::PerSpeaker => {
        let gap = silence(self.settings.gap_ms);
        let mut pcm = Vec::new();
        for (i, u) in utterances.iter().enumerate() {
          if i > 0 {
            pcm.extend_from_slice(&gap);
          }
          let chunk =
            with_timeout(self.call_timeout, self.speech.synthesize(&u.text, &u.voice, AudioEncoding::Pcm)).await?;
          pcm.extend_from_slice(&chunk);
        }
        (wav_from_pcm(&pcm, PCM_SAMPLE_RATE), "wav", "audio/wav")
      }
    };

    tokio::fs::create_dir_all(&self.out_dir).await?;
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let short = uuid::Uuid::new_v4().simple().to_string();
    let path = self.out_dir.join(format!("jlpt_dialog_{}_{}.{}", stamp, &short[..8], ext));
    tokio::fs::write(&path, &bytes).await?;
    info!(target: "turn", path = %path.display(), audio_bytes = bytes.len(), "Dialogue rendered");
    Ok(RenderedAudio { path, mime })
  }
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use async_trait::async_trait;
  use tokio::sync::Mutex;

  /// Records every synthesis request; returns `[n; 4]` for the n-th call.
  #[derive(Default)]
  pub(crate) struct FakeSpeech {
    pub calls: Mutex<Vec<(String, String, AudioEncoding)>>,
    pub fail: bool,
  }

  #[async_trait]
  impl SpeechBackend for FakeSpeech {
    async fn synthesize(&self, text: &str, voice: &str, encoding: AudioEncoding) -> Result<Vec<u8>> {
      if self.fail {
        return Err(TutorError::Speech("tts down".into()));
      }
      let mut calls = self.calls.lock().await;
      calls.push((text.to_string(), voice.to_string(), encoding));
      Ok(vec![calls.len() as u8; 4])
    }
  }

  fn turns() -> Vec<DialogueTurn> {
    vec![
      DialogueTurn::new("A", "こんにちは"),
      DialogueTurn::new("B", "元気  です"),
      DialogueTurn::new("", "ナレーション"),
      DialogueTurn::new("A", "  "),
      DialogueTurn::new("A", "また"),
    ]
  }

  #[test]
  fn voices_follow_first_appearance() {
    let pool = vec!["v1".to_string(), "v2".to_string()];
    let u = assign_voices(&turns(), &pool, "narr");
    let voices: Vec<&str> = u.iter().map(|x| x.voice.as_str()).collect();
    assert_eq!(voices, vec!["v1", "v2", "narr", "v1"]);
    assert_eq!(u[1].text, "元気 です");
  }

  #[tokio::test]
  async fn single_mode_makes_one_mp3_call() {
    let dir = tempfile::tempdir().unwrap();
    let speech = Arc::new(FakeSpeech::default());
    let r = DialogueRenderer::new(speech.clone(), SpeechSettings::default(), "alloy", dir.path(), Duration::from_secs(5));
    let audio = r.render(&turns()).await.unwrap();

    let calls = speech.calls.lock().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "A: こんにちは\nB: 元気 です\nナレーション\nA: また");
    assert_eq!(calls[0].1, "alloy");
    assert_eq!(audio.mime, "audio/mpeg");
    assert!(audio.path.extension().is_some_and(|e| e == "mp3"));
    assert_eq!(tokio::fs::read(&audio.path).await.unwrap(), vec![1u8; 4]);
  }

  #[tokio::test]
  async fn per_speaker_mode_joins_pcm_with_silence() {
    let dir = tempfile::tempdir().unwrap();
    let speech = Arc::new(FakeSpeech::default());
    let settings = SpeechSettings { mode: SpeechMode::PerSpeaker, voices: vec!["v1".into(), "v2".into()], gap_ms: 10 };
    let r = DialogueRenderer::new(speech.clone(), settings, "narr", dir.path(), Duration::from_secs(5));
    let audio = r.render(&turns()).await.unwrap();

    assert_eq!(speech.calls.lock().await.len(), 4);
    let wav = tokio::fs::read(&audio.path).await.unwrap();
    let gap = silence(10).len();
    assert_eq!(gap, 480);
    assert_eq!(wav.len(), 44 + 4 * 4 + 3 * gap);
    assert_eq!(&wav[..4], b"RIFF");
    // First utterance, then silence, then the second one.
    assert_eq!(&wav[44..48], &[1u8; 4]);
    assert!(wav[48..48 + gap].iter().all(|b| *b == 0));
    assert_eq!(&wav[48 + gap..52 + gap], &[2u8; 4]);
  }

  #[tokio::test]
  async fn empty_dialogue_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let r = DialogueRenderer::new(
      Arc::new(FakeSpeech::default()),
      SpeechSettings::default(),
      "alloy",
      dir.path(),
      Duration::from_secs(5),
    );
    assert!(r.render(&[DialogueTurn::new("A", " ")]).await.is_err());
  }
}
