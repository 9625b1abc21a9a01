use std::collections::BTreeMap;

use anyhow::anyhow;
use chrono::{
  DateTime,
  Datelike,
  Duration,
  NaiveDate,
  Utc
};
use chrono_tz::Tz;
use serde::Serialize;

use crate::datetime::local_date;
use crate::schedule::{
  Priority,
  Schedule,
  Status
};

pub const UPCOMING_WINDOW_DAYS: i64 = 7;

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Serialize,
)]
pub struct Summary {
  pub total:            usize,
  pub completed:        usize,
  pub pending:          usize,
  pub high:             usize,
  pub medium:           usize,
  pub low:              usize,
  /// Whole percent, `0` for an empty
  /// collection.
  pub completion_rate:  u32,
  pub today_pending:    usize,
  pub upcoming_pending: usize
}

impl Summary {
  pub fn priority_count(
    &self,
    priority: Priority
  ) -> usize {
    match priority {
      | Priority::High => self.high,
      | Priority::Medium => self.medium,
      | Priority::Low => self.low
    }
  }
}

/// Aggregates over the whole, unfiltered
/// collection.
///
/// "Today" compares local calendar days;
/// "upcoming" compares raw instants over
/// `(now, now + 7d]`.
#[tracing::instrument(skip(
  schedules, tz
))]
pub fn summarize(
  schedules: &[Schedule],
  now: DateTime<Utc>,
  tz: &Tz
) -> Summary {
  let today = local_date(now, tz);
  let horizon = now
    + Duration::days(
      UPCOMING_WINDOW_DAYS
    );

  let mut summary = Summary {
    total: schedules.len(),
    ..Summary::default()
  };

  for schedule in schedules {
    match schedule.status {
      | Status::Completed => {
        summary.completed += 1
      }
      | Status::Pending => {
        summary.pending += 1
      }
      | Status::Cancelled => {}
    }
    match schedule.priority {
      | Priority::High => {
        summary.high += 1
      }
      | Priority::Medium => {
        summary.medium += 1
      }
      | Priority::Low => summary.low += 1
    }

    if schedule.status != Status::Pending
    {
      continue;
    }
    if local_date(schedule.start_time, tz)
      == today
    {
      summary.today_pending += 1;
    }
    if schedule.start_time > now
      && schedule.start_time <= horizon
    {
      summary.upcoming_pending += 1;
    }
  }

  summary.completion_rate =
    completion_rate(
      summary.completed,
      summary.total
    );
  tracing::debug!(?summary, "computed summary");
  summary
}

#[must_use]
pub fn completion_rate(
  completed: usize,
  total: usize
) -> u32 {
  if total == 0 {
    return 0;
  }
  ((completed as f64 / total as f64)
    * 100.0)
    .round() as u32
}

/// Number of schedules starting on each
/// local day of the month. Days without
/// schedules are omitted.
pub fn day_counts(
  schedules: &[Schedule],
  year: i32,
  month: u32,
  tz: &Tz
) -> anyhow::Result<BTreeMap<NaiveDate, usize>>
{
  let first =
    NaiveDate::from_ymd_opt(
      year, month, 1
    )
    .ok_or_else(|| {
      anyhow!(
        "invalid month: \
         {year}-{month:02}"
      )
    })?;

  let mut counts = BTreeMap::new();
  for schedule in schedules {
    let day =
      local_date(schedule.start_time, tz);
    if day.year() == first.year()
      && day.month() == first.month()
    {
      *counts.entry(day).or_insert(0) +=
        1;
    }
  }
  Ok(counts)
}

/// Every day of the given month, in
/// order.
pub fn month_days(
  year: i32,
  month: u32
) -> anyhow::Result<Vec<NaiveDate>> {
  let first =
    NaiveDate::from_ymd_opt(
      year, month, 1
    )
    .ok_or_else(|| {
      anyhow!(
        "invalid month: \
         {year}-{month:02}"
      )
    })?;
  Ok(
    first
      .iter_days()
      .take_while(|d| {
        d.month() == first.month()
      })
      .collect()
  )
}

#[cfg(test)]
mod tests {
  use chrono::{
    DateTime,
    Duration,
    NaiveDate,
    TimeZone,
    Utc
  };
  use chrono_tz::Asia::Shanghai;

  use super::{
    completion_rate,
    day_counts,
    month_days,
    summarize
  };
  use crate::schedule::{
    Priority,
    Schedule,
    Status
  };

  fn now() -> DateTime<Utc> {
    // 2026-03-10 12:00 in Shanghai
    Utc
      .with_ymd_and_hms(
        2026, 3, 10, 4, 0, 0
      )
      .unwrap()
  }

  fn at(
    start: DateTime<Utc>,
    status: Status,
    priority: Priority
  ) -> Schedule {
    let mut s = Schedule::new_pending(
      "x".to_string(),
      start,
      start + Duration::hours(1),
      now()
    );
    s.status = status;
    s.priority = priority;
    s
  }

  #[test]
  fn completion_rate_rounds_and_handles_empty()
   {
    assert_eq!(completion_rate(1, 4), 25);
    assert_eq!(completion_rate(0, 0), 0);
    assert_eq!(completion_rate(2, 3), 67);
    assert_eq!(completion_rate(1, 8), 13);
  }

  #[test]
  fn counts_status_and_priority() {
    let t = now();
    let list = vec![
      at(t, Status::Completed, Priority::High),
      at(t, Status::Pending, Priority::High),
      at(t, Status::Pending, Priority::Low),
      at(t, Status::Cancelled, Priority::Medium),
    ];
    let summary =
      summarize(&list, t, &Shanghai);
    assert_eq!(summary.total, 4);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.pending, 2);
    assert_eq!(summary.high, 2);
    assert_eq!(summary.medium, 1);
    assert_eq!(summary.low, 1);
    assert_eq!(summary.completion_rate, 25);

    let empty = summarize(&[], t, &Shanghai);
    assert_eq!(empty.completion_rate, 0);
    assert_eq!(empty.total, 0);
  }

  #[test]
  fn today_uses_local_day_and_upcoming_uses_instants()
   {
    let t = now();
    let list = vec![
      // earlier today, local: counts as
      // today but not upcoming
      at(
        t - Duration::hours(3),
        Status::Pending,
        Priority::Low
      ),
      // later today: both
      at(
        t + Duration::hours(2),
        Status::Pending,
        Priority::Low
      ),
      // exactly at the 7 day edge
      at(
        t + Duration::days(7),
        Status::Pending,
        Priority::Low
      ),
      // just past the window
      at(
        t + Duration::days(7)
          + Duration::seconds(1),
        Status::Pending,
        Priority::Low
      ),
      // completed work is ignored
      at(
        t + Duration::hours(1),
        Status::Completed,
        Priority::Low
      ),
    ];
    let summary =
      summarize(&list, t, &Shanghai);
    assert_eq!(summary.today_pending, 2);
    assert_eq!(
      summary.upcoming_pending,
      2
    );
  }

  #[test]
  fn day_counts_bucket_by_local_day() {
    let list = vec![
      // 2026-03-31 23:30 local
      at(
        Utc
          .with_ymd_and_hms(
            2026, 3, 31, 15, 30, 0
          )
          .unwrap(),
        Status::Pending,
        Priority::Low
      ),
      // 2026-04-01 00:30 local
      at(
        Utc
          .with_ymd_and_hms(
            2026, 3, 31, 16, 30, 0
          )
          .unwrap(),
        Status::Completed,
        Priority::Low
      ),
      at(
        Utc
          .with_ymd_and_hms(
            2026, 3, 31, 1, 0, 0
          )
          .unwrap(),
        Status::Pending,
        Priority::Low
      ),
    ];
    let march = day_counts(
      &list, 2026, 3, &Shanghai
    )
    .expect("valid month");
    assert_eq!(march.len(), 1);
    assert_eq!(
      march.get(
        &NaiveDate::from_ymd_opt(
          2026, 3, 31
        )
        .unwrap()
      ),
      Some(&2)
    );

    let april = day_counts(
      &list, 2026, 4, &Shanghai
    )
    .expect("valid month");
    assert_eq!(
      april.values().sum::<usize>(),
      1
    );
    assert!(
      day_counts(&list, 2026, 13, &Shanghai)
        .is_err()
    );
  }

  #[test]
  fn month_days_cover_whole_month() {
    assert_eq!(
      month_days(2024, 2).unwrap().len(),
      29
    );
    assert_eq!(
      month_days(2026, 4).unwrap().len(),
      30
    );
  }
}
