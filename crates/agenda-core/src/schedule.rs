use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::datetime::iso_serde;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "l" | "low" => Ok(Priority::Low),
            "m" | "medium" => Ok(Priority::Medium),
            "h" | "high" => Ok(Priority::High),
            other => Err(anyhow!("invalid priority: {other} (expected low, medium or high)")),
        }
    }
}

/// `Cancelled` is accepted on the wire and as a filter value, but no
/// built-in transition enters or leaves it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Completed,
    Cancelled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }

    /// Flips pending and completed. Cancelled is left as it is.
    pub fn toggled(self) -> Status {
        match self {
            Status::Pending => Status::Completed,
            Status::Completed => Status::Pending,
            Status::Cancelled => Status::Cancelled,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Status::Pending),
            "completed" | "done" => Ok(Status::Completed),
            "cancelled" | "canceled" => Ok(Status::Cancelled),
            other => Err(anyhow!(
                "invalid status: {other} (expected pending, completed or cancelled)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,

    pub title: String,

    #[serde(default)]
    pub description: String,

    #[serde(with = "iso_serde")]
    pub start_time: DateTime<Utc>,

    #[serde(with = "iso_serde")]
    pub end_time: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    pub priority: Priority,

    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder: Option<bool>,

    /// Minutes before `start_time`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reminder_time: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(with = "iso_serde")]
    pub created_at: DateTime<Utc>,

    #[serde(with = "iso_serde")]
    pub updated_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new_pending(
        title: String,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            title,
            description: String::new(),
            start_time,
            end_time,
            location: None,
            priority: Priority::Medium,
            status: Status::Pending,
            reminder: None,
            reminder_time: None,
            tags: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    /// Shallow field-by-field merge; `updated_at` is always refreshed.
    pub fn merged(&self, patch: &SchedulePatch, now: DateTime<Utc>) -> Schedule {
        let mut next = self.clone();
        if let Some(title) = &patch.title {
            next.title = title.clone();
        }
        if let Some(description) = &patch.description {
            next.description = description.clone();
        }
        if let Some(start) = patch.start_time {
            next.start_time = start;
        }
        if let Some(end) = patch.end_time {
            next.end_time = end;
        }
        if let Some(location) = &patch.location {
            next.location = location.clone();
        }
        if let Some(priority) = patch.priority {
            next.priority = priority;
        }
        if let Some(status) = patch.status {
            next.status = status;
        }
        if let Some(reminder) = patch.reminder {
            next.reminder = reminder;
        }
        if let Some(reminder_time) = patch.reminder_time {
            next.reminder_time = reminder_time;
        }
        if let Some(tags) = &patch.tags {
            next.tags = tags.clone();
        }
        next.updated_at = now;
        next
    }

    pub fn has_valid_span(&self) -> bool {
        self.start_time < self.end_time
    }
}

/// Partial update. Outer `None` leaves a field untouched; for optional
/// fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulePatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub location: Option<Option<String>>,
    pub priority: Option<Priority>,
    pub status: Option<Status>,
    pub reminder: Option<Option<bool>>,
    pub reminder_time: Option<Option<u32>>,
    pub tags: Option<Vec<String>>,
}

impl SchedulePatch {
    pub fn is_empty(&self) -> bool {
        *self == SchedulePatch::default()
    }
}
