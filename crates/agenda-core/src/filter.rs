use std::cmp::Ordering;

use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::{
  Deserialize,
  Serialize
};
use tracing::{
  debug,
  trace,
  warn
};

use crate::datetime::local_date;
use crate::schedule::{
  Priority,
  Schedule,
  Status
};

/// The four independent list filters.
/// `None` on any field means the
/// dimension is unconstrained.
#[derive(
  Debug,
  Clone,
  Default,
  PartialEq,
  Eq,
  Serialize,
  Deserialize,
)]
pub struct FilterSet {
  #[serde(default)]
  pub title:    Option<String>,
  #[serde(default)]
  pub priority: Option<Priority>,
  #[serde(default)]
  pub status:   Option<Status>,
  #[serde(default)]
  pub date:     Option<NaiveDate>
}

#[derive(Debug, Clone)]
enum Pred {
  TitleContains(String),
  PriorityEq(Priority),
  StatusEq(Status),
  OnDate(NaiveDate)
}

impl FilterSet {
  pub fn is_empty(&self) -> bool {
    self.predicates().is_empty()
  }

  pub fn matches(
    &self,
    schedule: &Schedule,
    tz: &Tz
  ) -> bool {
    self.predicates().iter().all(
      |pred| {
        eval_pred(pred, schedule, tz)
      }
    )
  }

  /// One-line summary of the active
  /// filters, e.g. `title: gym,
  /// status: pending`.
  pub fn describe(&self) -> String {
    let mut parts = Vec::new();
    if let Some(title) =
      self.active_title()
    {
      parts
        .push(format!("title: {title}"));
    }
    if let Some(priority) = self.priority
    {
      parts.push(format!(
        "priority: {priority}"
      ));
    }
    if let Some(status) = self.status {
      parts.push(format!(
        "status: {status}"
      ));
    }
    if let Some(date) = self.date {
      parts.push(format!(
        "date: {}",
        date.format("%Y-%m-%d")
      ));
    }
    parts.join(", ")
  }

  fn active_title(
    &self
  ) -> Option<&str> {
    self
      .title
      .as_deref()
      .filter(|t| !t.is_empty())
  }

  // Fixed stage order keeps the
  // per-stage trace counts comparable.
  fn predicates(&self) -> Vec<Pred> {
    let mut preds = Vec::new();
    if let Some(title) =
      self.active_title()
    {
      preds.push(Pred::TitleContains(
        title.to_lowercase()
      ));
    }
    if let Some(priority) = self.priority
    {
      preds
        .push(Pred::PriorityEq(priority));
    }
    if let Some(status) = self.status {
      preds.push(Pred::StatusEq(status));
    }
    if let Some(date) = self.date {
      preds.push(Pred::OnDate(date));
    }
    preds
  }
}

/// Filters then sorts a copy of
/// `schedules` for display. The input is
/// never modified.
#[tracing::instrument(skip(
  schedules, tz
))]
pub fn project(
  schedules: &[Schedule],
  filters: &FilterSet,
  tz: &Tz
) -> Vec<Schedule> {
  let mut result = schedules.to_vec();
  debug!(
    count = result.len(),
    "projecting schedules"
  );

  for pred in filters.predicates() {
    result.retain(|schedule| {
      eval_pred(&pred, schedule, tz)
    });
    debug!(pred = ?pred, remaining = result.len(), "filter stage applied");
  }

  result.sort_by(display_order);
  debug!(
    count = result.len(),
    "projection complete"
  );
  result
}

/// Pending first, then earliest start.
/// Only `Pending` is special-cased, so
/// completed and cancelled records tie
/// on the first key.
pub fn display_order(
  a: &Schedule,
  b: &Schedule
) -> Ordering {
  status_rank(a.status)
    .cmp(&status_rank(b.status))
    .then_with(|| {
      a.start_time.cmp(&b.start_time)
    })
}

fn status_rank(status: Status) -> u8 {
  match status {
    | Status::Pending => 0,
    | Status::Completed
    | Status::Cancelled => 1
  }
}

fn eval_pred(
  pred: &Pred,
  schedule: &Schedule,
  tz: &Tz
) -> bool {
  let ok = match pred {
    | Pred::TitleContains(needle) => {
      schedule
        .title
        .to_lowercase()
        .contains(needle.as_str())
    }
    | Pred::PriorityEq(priority) => {
      schedule.priority == *priority
    }
    | Pred::StatusEq(status) => {
      schedule.status == *status
    }
    | Pred::OnDate(date) => {
      local_date(schedule.start_time, tz)
        == *date
    }
  };

  trace!(pred = ?pred, id = %schedule.id, ok, "filter predicate evaluation");
  ok
}

fn is_unset(raw: &str) -> bool {
  matches!(
    raw
      .trim()
      .to_ascii_lowercase()
      .as_str(),
    "" | "0" | "null" | "none" | "all"
  )
}

pub fn parse_title_filter(
  raw: &str
) -> Option<String> {
  if raw.trim().is_empty() {
    None
  } else {
    Some(raw.to_string())
  }
}

/// Accepts priority names and the
/// picker indices `1..=3`
/// (low, medium, high).
pub fn parse_priority_filter(
  raw: &str
) -> Option<Priority> {
  if is_unset(raw) {
    return None;
  }
  match raw.trim() {
    | "1" => Some(Priority::Low),
    | "2" => Some(Priority::Medium),
    | "3" => Some(Priority::High),
    | other => {
      match other.parse::<Priority>() {
        | Ok(priority) => Some(priority),
        | Err(err) => {
          warn!(input = %other, error = %err, "dropping malformed priority filter");
          None
        }
      }
    }
  }
}

/// Accepts status names and the picker
/// indices `1` (pending) and `2`
/// (completed).
pub fn parse_status_filter(
  raw: &str
) -> Option<Status> {
  if is_unset(raw) {
    return None;
  }
  match raw.trim() {
    | "1" => Some(Status::Pending),
    | "2" => Some(Status::Completed),
    | other => {
      match other.parse::<Status>() {
        | Ok(status) => Some(status),
        | Err(err) => {
          warn!(input = %other, error = %err, "dropping malformed status filter");
          None
        }
      }
    }
  }
}

pub fn parse_date_filter(
  raw: &str
) -> Option<NaiveDate> {
  if is_unset(raw) {
    return None;
  }
  match NaiveDate::parse_from_str(
    raw.trim(),
    "%Y-%m-%d"
  ) {
    | Ok(date) => Some(date),
    | Err(err) => {
      warn!(input = %raw, error = %err, "dropping malformed date filter");
      None
    }
  }
}
