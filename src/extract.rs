//! Recovering structured records from loosely formatted model output.
//!
//! The model is told to return exactly one JSON object, but in practice we also see
//! code fences, prose around the object, several objects back to back and a couple of
//! recurring syntax glitches. `extract_records` never fails: it returns zero or more
//! candidate texts, in order of appearance, and leaves strict parsing to the caller.

use serde_json::Value;
use tracing::{debug, instrument};

/// Scanner state. Depth counts `{` nesting; strings are only tracked inside objects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanState {
  Outside,
  InObject(usize),
  InString(usize),
  Escaped(usize),
}

/// Explicit state machine that yields the byte spans of top-level `{...}` objects.
#[derive(Debug)]
struct ObjectScanner {
  state: ScanState,
  start: usize,
}

impl ObjectScanner {
  fn new() -> Self { Self { state: ScanState::Outside, start: 0 } }

  /// Advance by one char at byte offset `pos`. Returns a completed span, if any.
  fn step(&mut self, pos: usize, ch: char) -> Option<(usize, usize)> {
    use ScanState::*;
    let (next, done) = match (self.state, ch) {
      (Outside, '{') => {
        self.start = pos;
        (InObject(1), None)
      }
      (Outside, _) => (Outside, None),

      (InObject(d), '"') => (InString(d), None),
      (InObject(d), '{') => (InObject(d + 1), None),
      (InObject(1), '}') => (Outside, Some((self.start, pos + ch.len_utf8()))),
      (InObject(d), '}') => (InObject(d - 1), None),
      (InObject(d), _) => (InObject(d), None),

      (InString(d), '\\') => (Escaped(d), None),
      (InString(d), '"') => (InObject(d), None),
      (InString(d), _) => (InString(d), None),

      (Escaped(d), _) => (InString(d), None),
    };
    self.state = next;
    done
  }
}

/// All top-level object spans in `text`, in order. Unterminated trailing objects are dropped.
fn scan_objects(text: &str) -> Vec<&str> {
  let mut scanner = ObjectScanner::new();
  text
    .char_indices()
    .filter_map(|(pos, ch)| scanner.step(pos, ch))
    .map(|(a, b)| &text[a..b])
    .collect()
}

fn parses_as_object(text: &str) -> bool {
  matches!(serde_json::from_str::<Value>(text), Ok(Value::Object(_)))
}

/// Deterministic fixes for glitches we have seen the backend produce:
///
/// - a stray `]` right after a string value, followed by `,` or `}`,
///   where no array is open (`"text"], "Bot": ...`);
/// - a trailing `,` right before a closing `}` or `]`.
///
/// String contents are never touched.
pub fn repair(text: &str) -> String {
  let chars: Vec<char> = text.chars().collect();
  let mut out = String::with_capacity(text.len());
  // Open brackets outside strings, so we can tell a stray `]` from a real one.
  let mut stack: Vec<char> = Vec::new();
  let mut in_string = false;
  let mut escaped = false;
  // Last non-whitespace char emitted outside a string, and whether it closed a string.
  let mut last_closed_string = false;

  let next_significant = |from: usize| chars[from..].iter().copied().find(|c| !c.is_whitespace());

  for (i, &ch) in chars.iter().enumerate() {
    if in_string {
      out.push(ch);
      if escaped {
        escaped = false;
      } else if ch == '\\' {
        escaped = true;
      } else if ch == '"' {
        in_string = false;
        last_closed_string = true;
      }
      continue;
    }

    match ch {
      '"' => {
        in_string = true;
        last_closed_string = false;
        out.push(ch);
      }
      '{' | '[' => {
        stack.push(ch);
        last_closed_string = false;
        out.push(ch);
      }
      ']' if stack.last() != Some(&'[')
        && last_closed_string
        && matches!(next_significant(i + 1), Some(',') | Some('}')) =>
      {
        debug!(target: "turn", offset = i, "Dropping stray ']' after string value");
      }
      ',' if matches!(next_significant(i + 1), Some('}') | Some(']')) => {
        debug!(target: "turn", offset = i, "Dropping trailing ',' before closer");
      }
      '}' | ']' => {
        stack.pop();
        last_closed_string = false;
        out.push(ch);
      }
      c if c.is_whitespace() => out.push(c),
      c => {
        last_closed_string = false;
        out.push(c);
      }
    }
  }
  out
}

/// Recover candidate record texts from raw backend output, in order of appearance.
///
/// 1. The whole input, if it is one JSON object.
/// 2. The repaired input, if that is one JSON object.
/// 3. Every top-level `{...}` span of the repaired input.
///
/// An empty result means nothing object-like was found.
#[instrument(level = "debug", skip(raw), fields(raw_len = raw.len()))]
pub fn extract_records(raw: &str) -> Vec<String> {
  let trimmed = raw.trim();
  if parses_as_object(trimmed) {
    return vec![trimmed.to_string()];
  }

  let repaired = repair(trimmed);
  if repaired != trimmed && parses_as_object(&repaired) {
    debug!(target: "turn", "Whole reply parsed after repair");
    return vec![repaired];
  }

  let spans: Vec<String> = scan_objects(&repaired).into_iter().map(str::to_string).collect();
  debug!(target: "turn", candidates = spans.len(), "Scanned reply for embedded records");
  spans
}
