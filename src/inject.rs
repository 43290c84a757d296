//! Daily injection of saved teacher notes into the outgoing learner message.
//!
//! At most once per UTC calendar day per learner, the latest notes snapshot is appended
//! to the text we send to the backend, so the model keeps long-term context even when
//! history is reset.

use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, instrument};

use crate::domain::UserId;
use crate::error::Result;
use crate::store::{ProgressStore, UserProgress};
use crate::util::fill_template;

/// Header placed above injected notes. `{stamp}` is the current UTC time.
pub const DEFAULT_INJECTION_HEADER: &str = "[BOT_TECH_STATS_UTC {stamp}]";

/// True when nothing has been injected yet on `now`'s UTC date.
pub fn due_today(last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
  last.map_or(true, |at| at.date_naive() != now.date_naive())
}

/// Return `text`, augmented with the latest notes if an injection is due.
/// Records `now` as the last injection time only when something was appended.
#[instrument(level = "debug", skip(store, text, header), fields(%user, text_len = text.len()))]
pub async fn inject_daily_notes(
  store: &dyn ProgressStore,
  user: &UserId,
  text: &str,
  header: &str,
  now: DateTime<Utc>,
) -> Result<String> {
  let progress = store.load(user).await?;
  if !due_today(progress.last_injected_at, now) {
    return Ok(text.to_string());
  }
  let Some(notes) = progress.latest_notes() else {
    return Ok(text.to_string());
  };

  let stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
  let injected = format!("{}\n\n{}\n{}", text, fill_template(header, &[("stamp", &stamp)]), notes);
  store
    .update(user, Box::new(move |p: &mut UserProgress| p.last_injected_at = Some(now)))
    .await?;
  debug!(target: "turn", %user, notes_len = notes.len(), "Injected daily teacher notes");
  Ok(injected)
}
