use std::collections::BTreeMap;
use std::io::{self, IsTerminal, Write};

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use unicode_width::UnicodeWidthStr;

use crate::config::Config;
use crate::datetime::{format_local, iso_serde, local_date};
use crate::filter::FilterSet;
use crate::schedule::{Priority, Schedule, Status};
use crate::summary::Summary;

const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct Renderer {
    color: bool,
}

impl Renderer {
    pub fn new(cfg: &Config) -> Self {
        Self {
            color: cfg.get_bool("color").unwrap_or(true),
        }
    }

    #[tracing::instrument(skip(self, schedules, filters, now, tz))]
    pub fn print_schedule_table(
        &mut self,
        schedules: &[Schedule],
        filters: &FilterSet,
        now: DateTime<Utc>,
        tz: &Tz,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        if !filters.is_empty() {
            writeln!(out, "Filters: {}", filters.describe())?;
        }
        if schedules.is_empty() {
            writeln!(out, "No schedules.")?;
            return Ok(());
        }

        let headers = vec![
            "ID".to_string(),
            "Done".to_string(),
            "Pri".to_string(),
            "When".to_string(),
            "Title".to_string(),
            "Location".to_string(),
        ];

        let mut rows = Vec::with_capacity(schedules.len());
        for schedule in schedules {
            let id = self.paint(short_id(&schedule.id), "33");
            let done = match schedule.status {
                Status::Pending => "[ ]".to_string(),
                Status::Completed => "[x]".to_string(),
                Status::Cancelled => "[-]".to_string(),
            };
            let priority = self.paint(priority_label(schedule.priority), priority_color(schedule.priority));

            let when = format_span(schedule, tz);
            let when = if schedule.status == Status::Pending && schedule.end_time < now {
                self.paint(&when, "31")
            } else {
                when
            };

            let title = if schedule.status == Status::Pending {
                schedule.title.clone()
            } else {
                self.paint(&schedule.title, "2")
            };

            rows.push(vec![
                id,
                done,
                priority,
                when,
                title,
                schedule.location.clone().unwrap_or_default(),
            ]);
        }

        write_table(&mut out, headers, rows)?;
        writeln!(out)?;
        writeln!(out, "{} schedule(s)", schedules.len())?;
        Ok(())
    }

    #[tracing::instrument(skip(self, schedule, tz))]
    pub fn print_schedule_info(&mut self, schedule: &Schedule, tz: &Tz) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "id           {}", schedule.id)?;
        writeln!(out, "title        {}", schedule.title)?;
        writeln!(out, "status       {}", schedule.status)?;
        writeln!(out, "priority     {}", schedule.priority)?;
        writeln!(
            out,
            "start        {}",
            format_local(schedule.start_time, tz, "%Y-%m-%d %H:%M")
        )?;
        writeln!(
            out,
            "end          {}",
            format_local(schedule.end_time, tz, "%Y-%m-%d %H:%M")
        )?;
        if !schedule.description.is_empty() {
            writeln!(out, "description  {}", schedule.description)?;
        }
        if let Some(location) = schedule.location.as_deref().filter(|l| !l.is_empty()) {
            writeln!(out, "location     {location}")?;
        }
        match (schedule.reminder, schedule.reminder_time) {
            (Some(true), Some(minutes)) => {
                writeln!(out, "reminder     {minutes} min before")?
            }
            (Some(true), None) => writeln!(out, "reminder     on")?,
            _ => {}
        }
        if !schedule.tags.is_empty() {
            writeln!(out, "tags         {}", schedule.tags.join(", "))?;
        }
        writeln!(out, "created      {}", iso_serde::format(&schedule.created_at))?;
        writeln!(out, "updated      {}", iso_serde::format(&schedule.updated_at))?;

        Ok(())
    }

    #[tracing::instrument(skip(self, summary))]
    pub fn print_summary(&mut self, summary: &Summary) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        writeln!(out, "Completion   {}%", summary.completion_rate)?;
        writeln!(out, "Total        {}", summary.total)?;
        writeln!(out, "Completed    {}", summary.completed)?;
        writeln!(out, "Pending      {}", summary.pending)?;
        writeln!(out, "Today        {}", summary.today_pending)?;
        writeln!(out, "Next 7 days  {}", summary.upcoming_pending)?;
        writeln!(out)?;

        let headers = vec!["Priority".to_string(), "Count".to_string(), "Share".to_string()];
        let rows = Priority::ALL
            .iter()
            .map(|&priority| {
                let count = summary.priority_count(priority);
                let share = if summary.total > 0 {
                    count * 100 / summary.total
                } else {
                    0
                };
                vec![
                    self.paint(priority.as_str(), priority_color(priority)),
                    count.to_string(),
                    format!("{share}%"),
                ]
            })
            .collect();
        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, days, counts, today))]
    pub fn print_day_counts(
        &mut self,
        days: &[NaiveDate],
        counts: &BTreeMap<NaiveDate, usize>,
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        let mut out = io::stdout().lock();

        let headers = vec!["Date".to_string(), "Day".to_string(), "Schedules".to_string()];
        let rows = days
            .iter()
            .map(|day| {
                let label = day.format("%Y-%m-%d").to_string();
                let label = if *day == today {
                    self.paint(&label, "1")
                } else {
                    label
                };
                let count = counts.get(day).copied().unwrap_or(0);
                let count = if count > 0 {
                    self.paint(&count.to_string(), "36")
                } else {
                    String::new()
                };
                vec![label, day.format("%a").to_string(), count]
            })
            .collect();
        write_table(&mut out, headers, rows)?;
        Ok(())
    }

    fn paint(&self, text: &str, code: &str) -> String {
        if !self.color || !io::stdout().is_terminal() {
            return text.to_string();
        }
        format!("\x1b[{code}m{text}\x1b[0m")
    }
}

pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(SHORT_ID_LEN) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "H",
        Priority::Medium => "M",
        Priority::Low => "L",
    }
}

fn priority_color(priority: Priority) -> &'static str {
    match priority {
        Priority::High => "31",
        Priority::Medium => "33",
        Priority::Low => "32",
    }
}

/// `2023-12-01 10:30-11:30`, or both full timestamps when the span crosses
/// midnight.
fn format_span(schedule: &Schedule, tz: &Tz) -> String {
    let start = format_local(schedule.start_time, tz, "%Y-%m-%d %H:%M");
    if local_date(schedule.start_time, tz) == local_date(schedule.end_time, tz) {
        format!("{start}-{}", format_local(schedule.end_time, tz, "%H:%M"))
    } else {
        format!(
            "{start} - {}",
            format_local(schedule.end_time, tz, "%Y-%m-%d %H:%M")
        )
    }
}

fn write_table<W: Write>(
    mut writer: W,
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
) -> anyhow::Result<()> {
    let column_count = headers.len();
    let mut widths = vec![0usize; column_count];

    for (idx, header) in headers.iter().enumerate() {
        widths[idx] = widths[idx].max(UnicodeWidthStr::width(header.as_str()));
    }

    for row in &rows {
        for (idx, cell) in row.iter().enumerate() {
            widths[idx] = widths[idx].max(UnicodeWidthStr::width(strip_ansi(cell).as_str()));
        }
    }

    for idx in 0..column_count {
        write!(writer, "{:width$} ", headers[idx], width = widths[idx])?;
    }
    writeln!(writer)?;

    for idx in 0..column_count {
        write!(writer, "{:-<width$} ", "", width = widths[idx])?;
    }
    writeln!(writer)?;

    for row in rows {
        for idx in 0..column_count {
            let cell = &row[idx];
            let visible_width = UnicodeWidthStr::width(strip_ansi(cell).as_str());
            let padding = widths[idx].saturating_sub(visible_width);
            write!(writer, "{}{} ", cell, " ".repeat(padding))?;
        }
        writeln!(writer)?;
    }

    Ok(())
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut escaped = false;

    for ch in s.chars() {
        if escaped {
            if ch == 'm' {
                escaped = false;
            }
            continue;
        }

        if ch == '\x1b' {
            escaped = true;
            continue;
        }

        out.push(ch);
    }

    out
}
