use std::fmt;
use std::fs;
use std::path::{
  Path,
  PathBuf
};

use anyhow::{
  Context,
  anyhow
};
use chrono::{
  DateTime,
  Datelike,
  Days,
  Duration,
  LocalResult,
  NaiveDate,
  NaiveDateTime,
  NaiveTime,
  TimeZone,
  Utc,
  Weekday
};
use chrono_tz::Tz;
use regex::Regex;
use serde::Deserialize;

const TIMEZONE_CONFIG_FILE: &str =
  "agenda-time.toml";
const TIMEZONE_ENV_VAR: &str =
  "AGENDA_TIMEZONE";
const TIMEZONE_CONFIG_ENV_VAR: &str =
  "AGENDA_TIME_CONFIG";

#[derive(Debug, Deserialize)]
struct TimezoneConfig {
  timezone: Option<String>,
  time:     Option<TimezoneSection>
}

#[derive(Debug, Deserialize)]
struct TimezoneSection {
  timezone: Option<String>
}

/// The three shapes a persisted start/end
/// time has been observed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampEncoding {
  /// `2023-12-01T10:30:00.000Z`, or
  /// any text with a `T` separator.
  Qualified,
  /// `2023-12-01 10:30`, already local.
  SpaceSeparated,
  /// `2023-12-01`, local midnight.
  BareDate
}

impl TimestampEncoding {
  #[must_use]
  pub fn detect(raw: &str) -> Self {
    if raw.contains('T') {
      TimestampEncoding::Qualified
    } else if raw.contains(' ') {
      TimestampEncoding::SpaceSeparated
    } else {
      TimestampEncoding::BareDate
    }
  }
}

/// Resolution order: `AGENDA_TIMEZONE`,
/// the rc `timezone` key, the
/// `agenda-time.toml` file, then UTC.
#[tracing::instrument]
pub fn resolve_timezone(
  configured: Option<&str>
) -> Tz {
  let settings = [
    (
      TimezoneSource::Env,
      std::env::var(TIMEZONE_ENV_VAR).ok()
    ),
    (
      TimezoneSource::Rc,
      configured.map(str::to_string)
    )
  ];
  for (source, raw) in settings {
    if let Some(raw) = raw
      && let Some(tz) =
        parse_timezone(&raw, &source)
    {
      return tz;
    }
  }

  if let Some(path) =
    timezone_config_path()
  {
    match read_timezone_file(&path) {
      | Ok(Some(raw)) => {
        if let Some(tz) = parse_timezone(
          &raw,
          &TimezoneSource::File(path)
        ) {
          return tz;
        }
      }
      | Ok(None) => {
        tracing::debug!(
          file = %path.display(),
          "no timezone in time config"
        );
      }
      | Err(err) => {
        tracing::error!(
          error = %format!("{err:#}"),
          "ignoring time config"
        );
      }
    }
  }

  tracing::debug!(
    source = %TimezoneSource::Fallback,
    "using UTC"
  );
  chrono_tz::UTC
}

#[must_use]
pub fn local_date(
  dt: DateTime<Utc>,
  tz: &Tz
) -> NaiveDate {
  dt.with_timezone(tz).date_naive()
}

#[must_use]
pub fn format_local(
  dt: DateTime<Utc>,
  tz: &Tz,
  fmt: &str
) -> String {
  dt.with_timezone(tz)
    .format(fmt)
    .to_string()
}

#[derive(Debug, Clone)]
enum TimezoneSource {
  Env,
  Rc,
  File(PathBuf),
  Fallback
}

impl fmt::Display for TimezoneSource {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>
  ) -> fmt::Result {
    match self {
      | TimezoneSource::Env => {
        write!(f, "env:{TIMEZONE_ENV_VAR}")
      }
      | TimezoneSource::Rc => {
        f.write_str("rc:timezone")
      }
      | TimezoneSource::File(path) => {
        write!(f, "file:{}", path.display())
      }
      | TimezoneSource::Fallback => {
        f.write_str("default")
      }
    }
  }
}

fn timezone_config_path()
-> Option<PathBuf> {
  match std::env::var(
    TIMEZONE_CONFIG_ENV_VAR
  ) {
    | Ok(raw) if !raw.trim().is_empty() => {
      Some(PathBuf::from(raw.trim()))
    }
    | _ => {
      std::env::current_dir()
        .ok()
        .map(|dir| {
          dir.join(TIMEZONE_CONFIG_FILE)
        })
    }
  }
}

/// Either `timezone = ".."` at the top
/// level or under a `[time]` table.
fn read_timezone_file(
  path: &Path
) -> anyhow::Result<Option<String>> {
  if !path.exists() {
    return Ok(None);
  }
  let raw = fs::read_to_string(path)
    .with_context(|| {
      format!(
        "failed reading {}",
        path.display()
      )
    })?;
  let parsed: TimezoneConfig =
    toml::from_str(&raw).with_context(
      || {
        format!(
          "failed parsing {}",
          path.display()
        )
      }
    )?;
  Ok(parsed.timezone.or_else(|| {
    parsed
      .time
      .and_then(|section| section.timezone)
  }))
}

fn parse_timezone(
  raw: &str,
  source: &TimezoneSource
) -> Option<Tz> {
  let id = raw.trim();
  if id.is_empty() {
    tracing::warn!(
      %source,
      "empty timezone setting ignored"
    );
    return None;
  }

  id.parse::<Tz>()
    .inspect(|tz| {
      tracing::debug!(%source, timezone = %tz, "using timezone");
    })
    .inspect_err(|err| {
      tracing::warn!(%source, timezone = %id, error = %err, "unknown timezone id ignored");
    })
    .ok()
}

fn to_utc_from_local(
  local_naive: NaiveDateTime,
  tz: &Tz,
  context: &str
) -> anyhow::Result<DateTime<Utc>> {
  let resolved =
    tz.from_local_datetime(&local_naive);
  if let LocalResult::Ambiguous(
    first,
    second
  ) = &resolved
  {
    tracing::warn!(
      context,
      first = %first,
      second = %second,
      "ambiguous local time; taking the earlier instant"
    );
  }
  resolved
    .earliest()
    .map(|dt| dt.with_timezone(&Utc))
    .ok_or_else(|| {
      anyhow!(
        "{context}: {local_naive} does \
         not exist in {tz}"
      )
    })
}

fn local_midnight(
  date: NaiveDate,
  tz: &Tz,
  context: &str
) -> anyhow::Result<DateTime<Utc>> {
  to_utc_from_local(
    date.and_time(NaiveTime::MIN),
    tz,
    context
  )
}

/// Parses a stored start/end time in any
/// of the three legacy encodings. Only
/// the qualified form carries its own
/// offset; the other two are local to
/// `tz`.
#[tracing::instrument(skip(tz), fields(input = raw))]
pub fn normalize_timestamp(
  raw: &str,
  tz: &Tz
) -> anyhow::Result<DateTime<Utc>> {
  let token = raw.trim();
  match TimestampEncoding::detect(token)
  {
    | TimestampEncoding::Qualified => {
      if let Ok(dt) =
        DateTime::parse_from_rfc3339(
          token
        )
      {
        return Ok(
          dt.with_timezone(&Utc)
        );
      }
      for fmt in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M"
      ] {
        if let Ok(ndt) =
          NaiveDateTime::parse_from_str(
            token, fmt
          )
        {
          return to_utc_from_local(
            ndt, tz, fmt
          );
        }
      }
      Err(anyhow!(
        "unrecognized timestamp: \
         {token}"
      ))
    }
    | TimestampEncoding::SpaceSeparated => {
      for fmt in [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M"
      ] {
        if let Ok(ndt) =
          NaiveDateTime::parse_from_str(
            token, fmt
          )
        {
          return to_utc_from_local(
            ndt, tz, fmt
          );
        }
      }
      let date_part = token
        .split(' ')
        .next()
        .unwrap_or_default();
      let date =
        NaiveDate::parse_from_str(
          date_part, "%Y-%m-%d"
        )
        .with_context(|| {
          format!(
            "unrecognized timestamp: \
             {token}"
          )
        })?;
      local_midnight(
        date,
        tz,
        "space-separated"
      )
    }
    | TimestampEncoding::BareDate => {
      let date =
        NaiveDate::parse_from_str(
          token, "%Y-%m-%d"
        )
        .with_context(|| {
          format!(
            "unrecognized timestamp: \
             {token}"
          )
        })?;
      local_midnight(
        date, tz, "bare-date"
      )
    }
  }
}

/// Resolves a user-supplied date
/// expression to an instant.
/// `DAY@CLOCK` pins a clock time on a
/// day expression, e.g. `tomorrow@9am`.
#[tracing::instrument(skip(now, tz), fields(input = input))]
pub fn parse_date_expr(
  input: &str,
  now: DateTime<Utc>,
  tz: &Tz
) -> anyhow::Result<DateTime<Utc>> {
  let token = input.trim();
  let lower =
    token.to_ascii_lowercase();
  let today =
    now.with_timezone(tz).date_naive();

  if let Some((day_part, clock_part)) =
    lower.split_once('@')
  {
    let day = local_date(
      parse_date_expr(
        day_part, now, tz
      )?,
      tz
    );
    let (hour, minute) =
      parse_clock_time(clock_part)
        .ok_or_else(|| {
          anyhow!(
            "invalid clock time: \
             {clock_part}"
          )
        })?;
    let local = day
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct \
           {day} {hour}:{minute}"
        )
      })?;
    return to_utc_from_local(
      local, tz, "day-at-clock"
    );
  }

  match lower.as_str() {
    | "now" => return Ok(now),
    | "today" => {
      return local_midnight(
        today, tz, "today"
      );
    }
    | "tomorrow" => {
      let date = today
        .succ_opt()
        .ok_or_else(|| {
          anyhow!(
            "date out of range"
          )
        })?;
      return local_midnight(
        date, tz, "tomorrow"
      );
    }
    | "yesterday" => {
      let date = today
        .pred_opt()
        .ok_or_else(|| {
          anyhow!(
            "date out of range"
          )
        })?;
      return local_midnight(
        date, tz, "yesterday"
      );
    }
    | _ => {}
  }

  if let Some(target_weekday) =
    parse_weekday_name(&lower)
  {
    let target_date = next_weekday_date(
      today,
      target_weekday
    );
    return local_midnight(
      target_date,
      tz,
      "weekday-name"
    );
  }

  if let Some((hour, minute)) =
    parse_clock_time(token)
  {
    let local = today
      .and_hms_opt(hour, minute, 0)
      .ok_or_else(|| {
        anyhow!(
          "failed to construct clock \
           time for today"
        )
      })?;
    return to_utc_from_local(
      local,
      tz,
      "clock-time"
    );
  }

  if let Some(shifted) =
    parse_relative(token, now)?
  {
    return Ok(shifted);
  }

  normalize_timestamp(token, tz)
    .with_context(|| {
      "supported formats: \
       now/today/tomorrow/yesterday, \
       weekday names (e.g. monday), \
       clock times (e.g. 3:23pm or \
       15:23), DAY@CLOCK, \
       +Nd/+Nh/+Nm, RFC3339, \
       YYYY-MM-DD, YYYY-MM-DDTHH:MM, \
       YYYY-MM-DD HH:MM"
    })
}

/// `+3d`, `-2h`, `+90m`, `+1w` from now.
fn parse_relative(
  token: &str,
  now: DateTime<Utc>
) -> anyhow::Result<Option<DateTime<Utc>>>
{
  let relative =
    Regex::new(r"^([+-])(\d+)([wdhm])$")
      .context("relative offset pattern")?;
  let Some(caps) = relative.captures(token)
  else {
    return Ok(None);
  };

  let amount: i64 = caps[2]
    .parse()
    .with_context(|| {
      format!(
        "relative amount out of range: \
         {token}"
      )
    })?;
  let step = match &caps[3] {
    | "w" => Duration::weeks(1),
    | "d" => Duration::days(1),
    | "h" => Duration::hours(1),
    | _ => Duration::minutes(1)
  };
  let offset = amount
    .try_into()
    .ok()
    .and_then(|n: i32| step.checked_mul(n))
    .ok_or_else(|| {
      anyhow!(
        "relative offset too large: \
         {token}"
      )
    })?;

  let shifted = if &caps[1] == "-" {
    now.checked_sub_signed(offset)
  } else {
    now.checked_add_signed(offset)
  };
  shifted.map(Some).ok_or_else(|| {
    anyhow!("date out of range: {token}")
  })
}

/// Full or three-letter English day
/// names, plus `tues`, `thur` and
/// `thurs`.
fn parse_weekday_name(
  token: &str
) -> Option<Weekday> {
  match token.trim() {
    | "tues" => Some(Weekday::Tue),
    | "thur" | "thurs" => {
      Some(Weekday::Thu)
    }
    | other => other.parse().ok()
  }
}

/// The next `target` strictly after
/// `from`; naming today's weekday means
/// one week out.
fn next_weekday_date(
  from: NaiveDate,
  target: Weekday
) -> NaiveDate {
  let ahead = (7
    + target.num_days_from_monday()
    - from.weekday().num_days_from_monday())
    % 7;
  let ahead = if ahead == 0 { 7 } else { ahead };
  from
    .checked_add_days(Days::new(
      u64::from(ahead)
    ))
    .unwrap_or(from)
}

/// `15:30`, `9am`, `12:15pm`. A bare
/// number without a colon or meridiem is
/// not a clock time.
fn parse_clock_time(
  token: &str
) -> Option<(u32, u32)> {
  let clock = Regex::new(
    r"(?i)^(\d{1,2})(?::(\d{2}))?\s*([ap]m)?$"
  )
  .ok()?;
  let caps = clock.captures(token.trim())?;

  let hour: u32 = caps[1].parse().ok()?;
  let minute: u32 = match caps.get(2) {
    | Some(m) => m.as_str().parse().ok()?,
    | None => 0
  };
  if minute > 59 {
    return None;
  }

  let meridiem = caps
    .get(3)
    .map(|m| m.as_str().to_ascii_lowercase());
  let hour = match (meridiem.as_deref(), hour)
  {
    | (Some(_), 0) | (Some(_), 13..) => {
      return None;
    }
    | (Some("am"), 12) => 0,
    | (Some("pm"), 12) => 12,
    | (Some("pm"), h) => h + 12,
    | (Some(_), h) => h,
    | (None, _) if caps.get(2).is_none() => {
      return None;
    }
    | (None, h) if h > 23 => return None,
    | (None, h) => h
  };

  Some((hour, minute))
}


/// ISO-8601 (RFC 3339) text with a `Z`
/// suffix; sub-second precision is kept
/// so values survive a save/load cycle.
pub mod iso_serde {
  use chrono::{
    DateTime,
    SecondsFormat,
    Utc
  };
  use serde::{
    Deserialize,
    Deserializer,
    Serializer
  };

  #[must_use]
  pub fn format(
    dt: &DateTime<Utc>
  ) -> String {
    dt.to_rfc3339_opts(
      SecondsFormat::AutoSi,
      true
    )
  }

  pub fn serialize<S>(
    dt: &DateTime<Utc>,
    serializer: S
  ) -> Result<S::Ok, S::Error>
  where
    S: Serializer
  {
    serializer
      .serialize_str(&format(dt))
  }

  pub fn deserialize<'de, D>(
    deserializer: D
  ) -> Result<DateTime<Utc>, D::Error>
  where
    D: Deserializer<'de>
  {
    let raw = String::deserialize(
      deserializer
    )?;
    DateTime::parse_from_rfc3339(&raw)
      .map(|dt| dt.with_timezone(&Utc))
      .map_err(serde::de::Error::custom)
  }
}
