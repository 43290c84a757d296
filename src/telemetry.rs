//! Tracing setup.
//!
//! LOG_LEVEL is an EnvFilter directive string; LOG_FORMAT is "pretty" (default) or "json".
//! Targets in use: `sensei_backend` (startup, transport), `turn` (one learner turn),
//! `progress` (store writes and knowledge-base sync), `openai` (provider calls).
//! The HTTP TraceLayer adds per-request spans on top.

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info,turn=debug,sensei_backend=debug,progress=info,openai=info,tower_http=info,axum=info";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LogFormat {
  Pretty,
  Json,
}

impl LogFormat {
  fn parse(raw: Option<&str>) -> Self {
    match raw.map(|s| s.trim().to_ascii_lowercase()) {
      Some(s) if s == "json" => LogFormat::Json,
      _ => LogFormat::Pretty,
    }
  }
}

pub fn init_tracing() {
  let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(true)
    .with_file(true)
    .with_line_number(true);

  // The two builders have different types; init each branch separately.
  match LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref()) {
    LogFormat::Json => builder.json().init(),
    LogFormat::Pretty => builder.init(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn format_defaults_to_pretty() {
    assert_eq!(LogFormat::parse(None), LogFormat::Pretty);
    assert_eq!(LogFormat::parse(Some("yaml")), LogFormat::Pretty);
    assert_eq!(LogFormat::parse(Some(" JSON ")), LogFormat::Json);
  }

  #[test]
  fn default_filter_parses() {
    assert!(DEFAULT_FILTER.parse::<EnvFilter>().is_ok());
  }
}
