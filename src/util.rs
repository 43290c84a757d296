//! Small utility helpers used across modules.

use std::path::Path;

use tokio::io::AsyncWriteExt;

/// Very small and safe string templating.
/// Replaces occurrences of `{key}` in the template with provided values.
pub fn fill_template(tpl: &str, pairs: &[(&str, &str)]) -> String {
  let mut out = tpl.to_string();
  for (k, v) in pairs {
    let needle = format!("{{{}}}", k);
    out = out.replace(&needle, v);
  }
  out
}

/// Log-safe truncation for large strings (cut on a char boundary).
pub fn trunc_for_log(s: &str, max: usize) -> String {
  if s.len() <= max {
    return s.to_string();
  }
  let mut cut = max;
  while !s.is_char_boundary(cut) {
    cut -= 1;
  }
  format!("{}… ({} bytes total)", &s[..cut], s.len())
}

/// Split text into pieces of at most `max_chars` characters, preferring to break after a
/// newline in the second half of a piece. Never splits inside a char.
pub fn chunk_text(text: &str, max_chars: usize) -> Vec<String> {
  let max_chars = max_chars.max(1);
  let chars: Vec<char> = text.chars().collect();
  let mut out = Vec::new();
  let mut start = 0;
  while start < chars.len() {
    let hard_end = (start + max_chars).min(chars.len());
    let end = if hard_end == chars.len() {
      hard_end
    } else {
      chars[start + max_chars / 2..hard_end]
        .iter()
        .rposition(|&c| c == '\n')
        .map(|i| start + max_chars / 2 + i + 1)
        .unwrap_or(hard_end)
    };
    out.push(chars[start..end].iter().collect());
    start = end;
  }
  out
}

/// A user key turned into a single safe path component.
/// Plain ids map to themselves; anything else is hex-encoded behind an `x` prefix.
pub fn path_component(key: &str) -> String {
  let plain = !key.is_empty()
    && key.len() <= 64
    && !key.starts_with('x')
    && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
  if plain {
    key.to_string()
  } else {
    let hex: String = key.bytes().map(|b| format!("{:02x}", b)).collect();
    format!("x{hex}")
  }
}

/// Write a file atomically: temp file in the same directory, fsync, rename into place.
pub async fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
  let parent = path.parent().unwrap_or_else(|| Path::new("."));
  tokio::fs::create_dir_all(parent).await?;
  let file_name = path
    .file_name()
    .and_then(|n| n.to_str())
    .filter(|n| !n.is_empty())
    .unwrap_or("state.json");
  let tmp = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

  let mut f = tokio::fs::File::create(&tmp).await?;
  f.write_all(content).await?;
  f.sync_all().await?;
  drop(f);
  tokio::fs::rename(&tmp, path).await
}

/// Append bytes to a file, creating it (and its directory) if needed.
pub async fn append_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent).await?;
  }
  let mut f = tokio::fs::OpenOptions::new().create(true).append(true).open(path).await?;
  f.write_all(content).await?;
  f.flush().await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn template_fills_known_keys() {
    assert_eq!(fill_template("[{tag} {stamp}]", &[("tag", "T"), ("stamp", "now")]), "[T now]");
  }

  #[test]
  fn truncation_respects_char_boundaries() {
    let s = "日本語のテキスト";
    let t = trunc_for_log(s, 4);
    assert!(t.starts_with("日…"));
  }

  #[test]
  fn chunks_cover_input_without_loss() {
    let text = "あ".repeat(9001);
    let chunks = chunk_text(&text, 4000);
    assert_eq!(chunks.len(), 3);
    assert!(chunks.iter().all(|c| c.chars().count() <= 4000));
    assert_eq!(chunks.concat(), text);
  }

  #[test]
  fn chunks_prefer_line_breaks() {
    let text = format!("{}\n{}", "a".repeat(7), "b".repeat(5));
    let chunks = chunk_text(&text, 10);
    assert_eq!(chunks, vec![format!("{}\n", "a".repeat(7)), "b".repeat(5)]);
  }

  #[test]
  fn short_text_is_one_chunk() {
    assert_eq!(chunk_text("hi", 4000), vec!["hi".to_string()]);
    assert!(chunk_text("", 4000).is_empty());
  }

  #[test]
  fn path_components_are_safe_and_distinct() {
    assert_eq!(path_component("91738308"), "91738308");
    assert_eq!(path_component("../etc"), "x2e2e2f657463");
    assert_ne!(path_component("x1"), "x1");
  }

  #[tokio::test]
  async fn atomic_write_replaces_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.json");
    atomic_write(&path, b"one").await.unwrap();
    atomic_write(&path, b"two").await.unwrap();
    assert_eq!(tokio::fs::read(&path).await.unwrap(), b"two");
  }
}
