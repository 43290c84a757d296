//! Speaker-tagged dialogue scripts: parsing into turns and removing spoken lines from text.

use std::collections::HashSet;

use crate::domain::DialogueTurn;

const COLONS: [char; 2] = [':', '：'];

/// Split one line on its first ASCII or full-width colon.
/// Returns `(speaker, utterance)` only when the speaker part is non-empty.
fn split_speaker(line: &str) -> Option<(&str, &str)> {
  let idx = line.find(COLONS)?;
  let speaker = line[..idx].trim();
  if speaker.is_empty() {
    return None;
  }
  let colon_len = line[idx..].chars().next().map(char::len_utf8).unwrap_or(1);
  Some((speaker, line[idx + colon_len..].trim()))
}

/// Parse an `audio_script` into turns, in playback order. Blank lines are skipped;
/// a line without a usable speaker becomes a turn with an empty speaker.
pub fn parse_script(script: &str) -> Vec<DialogueTurn> {
  script
    .lines()
    .map(str::trim)
    .filter(|l| !l.is_empty())
    .map(|line| match split_speaker(line) {
      Some((speaker, utterance)) => DialogueTurn::new(speaker, utterance),
      None => DialogueTurn::new("", line),
    })
    .collect()
}

/// Speaker tag of a visible text line, ignoring list markers, quotes and bold/italic wrappers.
fn visible_speaker(line: &str) -> Option<String> {
  let body = line.trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '-' | '*' | '>' | '•'));
  let (speaker, _) = split_speaker(body)?;
  Some(speaker.trim_matches(|c| matches!(c, '*' | '_')).trim().to_string())
}

fn is_fence(line: &str) -> bool {
  line.trim_start().starts_with("```")
}

/// Remove lines spoken in `turns` from `text`: any line tagged with one of the script's
/// speakers, and any fenced block containing such a line.
pub fn strip_dialogue(text: &str, turns: &[DialogueTurn]) -> String {
  let speakers: HashSet<&str> = turns
    .iter()
    .map(|t| t.speaker.as_str())
    .filter(|s| !s.is_empty())
    .collect();
  let is_dialogue = |line: &str| visible_speaker(line).is_some_and(|s| speakers.contains(s.as_str()));

  let mut kept: Vec<&str> = Vec::new();
  let mut fenced: Option<Vec<&str>> = None;

  for line in text.lines() {
    if let Some(block) = fenced.as_mut() {
      block.push(line);
      if is_fence(line) {
        let block = fenced.take().unwrap_or_default();
        if !block.iter().any(|l| is_dialogue(l)) {
          kept.extend(block);
        }
      }
    } else if is_fence(line) {
      fenced = Some(vec![line]);
    } else if !is_dialogue(line) {
      kept.push(line);
    }
  }
  if let Some(block) = fenced {
    if !block.iter().any(|l| is_dialogue(l)) {
      kept.extend(block);
    }
  }

  collapse_blank_runs(&kept).trim().to_string()
}

/// Join lines, allowing at most one empty line in a row.
fn collapse_blank_runs(lines: &[&str]) -> String {
  let mut out: Vec<&str> = Vec::with_capacity(lines.len());
  for line in lines {
    let blank = line.trim().is_empty();
    if blank && out.last().is_some_and(|l| l.trim().is_empty()) {
      continue;
    }
    out.push(line);
  }
  out.join("\n")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_ascii_and_fullwidth_colons() {
    let turns = parse_script("A: こんにちは\nB：元気です\nplain line");
    assert_eq!(
      turns,
      vec![
        DialogueTurn::new("A", "こんにちは"),
        DialogueTurn::new("B", "元気です"),
        DialogueTurn::new("", "plain line"),
      ]
    );
  }

  #[test]
  fn splits_on_first_colon_only_and_skips_blanks() {
    let turns = parse_script("\n  田中: 時間は 10:30 です  \n\n: no speaker\n");
    assert_eq!(
      turns,
      vec![
        DialogueTurn::new("田中", "時間は 10:30 です"),
        DialogueTurn::new("", ": no speaker"),
      ]
    );
  }

  #[test]
  fn strips_tagged_lines_and_keeps_the_rest() {
    let turns = parse_script("A: hello\nB: hi");
    let text = "Listen carefully.\n\nA: hello\n**B**: hi\n\nQuestion: who greets first?";
    assert_eq!(strip_dialogue(text, &turns), "Listen carefully.\n\nQuestion: who greets first?");
  }

  #[test]
  fn strips_fenced_dialogue_block_but_not_other_fences() {
    let turns = parse_script("A: hello\nB: hi");
    let text = "Intro\n```\nA: hello\nB: hi\n```\n```\n食べる\n```\nEnd";
    assert_eq!(strip_dialogue(text, &turns), "Intro\n```\n食べる\n```\nEnd");
  }

  #[test]
  fn unknown_speakers_are_left_alone() {
    let turns = parse_script("A: hello");
    assert_eq!(strip_dialogue("Note: review kanji", &turns), "Note: review kanji");
  }
}
