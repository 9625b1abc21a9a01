use anyhow::{Context, anyhow};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, instrument, warn};

use crate::cli::Invocation;
use crate::datetime::{local_date, parse_date_expr};
use crate::filter::{
    FilterSet, parse_date_filter, parse_priority_filter, parse_status_filter, parse_title_filter,
};
use crate::render::{Renderer, short_id};
use crate::schedule::{Priority, Schedule, SchedulePatch, Status};
use crate::store::{Action, ScheduleStore};
use crate::summary::{day_counts, month_days};

const DEFAULT_DURATION_MINUTES: i64 = 60;

pub fn known_command_names() -> Vec<&'static str> {
    vec![
        "add", "list", "info", "modify", "done", "toggle", "delete", "filter", "summary",
        "calendar", "help", "version",
    ]
}

pub fn expand_command_abbrev<'a>(token: &'a str, known: &[&'a str]) -> Option<&'a str> {
    if known.contains(&token) {
        return Some(token);
    }

    let mut matches = known.iter().copied().filter(|name| name.starts_with(token));
    let first = matches.next()?;
    if matches.next().is_some() {
        None
    } else {
        Some(first)
    }
}

#[instrument(skip(store, renderer, inv, now))]
pub fn dispatch(
    store: &mut ScheduleStore,
    renderer: &mut Renderer,
    inv: Invocation,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    let command = inv.command.as_str();
    debug!(command, args = ?inv.args, "dispatching command");

    match command {
        "add" => cmd_add(store, &inv.args, now),
        "list" => cmd_list(store, renderer, now),
        "info" => cmd_info(store, renderer, &inv.args),
        "modify" => cmd_modify(store, &inv.args, now),
        "done" | "toggle" => cmd_toggle(store, &inv.args, now),
        "delete" => cmd_delete(store, &inv.args, now),
        "filter" => cmd_filter(store, &inv.args, now),
        "summary" => renderer.print_summary(&store.summary(now)),
        "calendar" => cmd_calendar(store, renderer, &inv.args, now),
        "help" => cmd_help(),
        "version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        other => Err(anyhow!("unknown command: {other}")),
    }
}

#[instrument(skip(store, args, now))]
fn cmd_add(store: &mut ScheduleStore, args: &[String], now: DateTime<Utc>) -> anyhow::Result<()> {
    info!("command add");

    let tz = *store.timezone();
    let (title, mods) = parse_title_and_mods(args, now, &tz)?;
    let patch = patch_from_mods(&[], &mods);

    let start = patch.start_time.unwrap_or(now);
    let end = patch
        .end_time
        .unwrap_or(start + Duration::minutes(DEFAULT_DURATION_MINUTES));
    let schedule = Schedule::new_pending(title, start, end, now).merged(&patch, now);
    validate(&schedule)?;

    let id = schedule.id.clone();
    store.dispatch(Action::Add(schedule), now);
    debug!(count = store.schedules().len(), "schedule added");
    println!("Created schedule {}.", short_id(&id));
    Ok(())
}

#[instrument(skip(store, renderer, now))]
fn cmd_list(
    store: &ScheduleStore,
    renderer: &mut Renderer,
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command list");
    let visible = store.visible();
    renderer.print_schedule_table(&visible, store.filters(), now, store.timezone())
}

#[instrument(skip(store, renderer, args))]
fn cmd_info(
    store: &ScheduleStore,
    renderer: &mut Renderer,
    args: &[String],
) -> anyhow::Result<()> {
    info!("command info");
    let id = resolve_id(store, args, "info")?;
    let schedule = store
        .find(&id)
        .ok_or_else(|| anyhow!("no schedule matches '{id}'"))?;
    renderer.print_schedule_info(schedule, store.timezone())
}

#[instrument(skip(store, args, now))]
fn cmd_modify(
    store: &mut ScheduleStore,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command modify");

    let id = resolve_id(store, args, "modify")?;
    let tz = *store.timezone();
    let mods = parse_mods(&args[1..], now, &tz)?;
    if mods.is_empty() {
        return Err(anyhow!("modify: no modifications given"));
    }

    let current = store
        .find(&id)
        .ok_or_else(|| anyhow!("no schedule matches '{id}'"))?;
    let patch = patch_from_mods(&current.tags, &mods);
    validate(&current.merged(&patch, now))?;

    store.dispatch(Action::Update { id: id.clone(), patch }, now);
    println!("Modified schedule {}.", short_id(&id));
    Ok(())
}

#[instrument(skip(store, args, now))]
fn cmd_toggle(
    store: &mut ScheduleStore,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command toggle");

    let id = resolve_id(store, args, "done")?;
    if store.find(&id).is_some_and(|s| s.status == Status::Cancelled) {
        println!("Schedule {} is cancelled; status unchanged.", short_id(&id));
        return Ok(());
    }
    store.dispatch(Action::ToggleStatus(id.clone()), now);
    if let Some(schedule) = store.find(&id) {
        println!("Schedule {} is now {}.", short_id(&id), schedule.status);
    }
    Ok(())
}

#[instrument(skip(store, args, now))]
fn cmd_delete(
    store: &mut ScheduleStore,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command delete");

    let id = resolve_id(store, args, "delete")?;
    store.dispatch(Action::Delete(id.clone()), now);
    println!("Deleted schedule {}.", short_id(&id));
    Ok(())
}

#[instrument(skip(store, args, now))]
fn cmd_filter(
    store: &mut ScheduleStore,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command filter");

    if args.is_empty() {
        print_filters(store.filters());
        return Ok(());
    }

    let action = if args.len() == 1 && args[0].eq_ignore_ascii_case("clear") {
        Action::ClearFilters
    } else {
        let tz = *store.timezone();
        Action::SetFilters(apply_filter_terms(store.filters(), args, now, &tz)?)
    };

    store.dispatch(action, now);
    print_filters(store.filters());
    Ok(())
}

#[instrument(skip(store, renderer, args, now))]
fn cmd_calendar(
    store: &ScheduleStore,
    renderer: &mut Renderer,
    args: &[String],
    now: DateTime<Utc>,
) -> anyhow::Result<()> {
    info!("command calendar");

    let tz = *store.timezone();
    let today = local_date(now, &tz);
    let (year, month) = match args.first() {
        Some(raw) => {
            let first = NaiveDate::parse_from_str(&format!("{}-01", raw.trim()), "%Y-%m-%d")
                .with_context(|| format!("calendar: expected YYYY-MM, got '{raw}'"))?;
            (first.year(), first.month())
        }
        None => (today.year(), today.month()),
    };

    let days = month_days(year, month)?;
    let counts = day_counts(store.schedules(), year, month, &tz)?;
    renderer.print_day_counts(&days, &counts, today)
}

fn cmd_help() -> anyhow::Result<()> {
    println!(
        "usage: agenda [-v|-q] [--rc key=value] [--agendarc PATH] [--data DIR] <command> [args]

commands:
  add <title> [desc:..] [start:..] [end:..] [at:..] [pri:..] [remind:yes|no] [remind.before:N] [+tag]
  list                     schedules under the active filters
  info <id>                show one schedule
  modify <id> <mods>       change fields (title: desc: start: end: at: pri: status: +tag -tag)
  done <id>, toggle <id>   flip pending/completed
  delete <id>              remove a schedule
  filter [title:..] [pri:..] [status:..] [date:..]
  filter clear             drop every filter
  summary                  completion and priority breakdown
  calendar [YYYY-MM]       schedules per day
  help, version

dates: now, today, tomorrow, yesterday, monday..sunday, 14:30, 9am, +2d, +3h,
       tomorrow@9am, 2023-12-01, 2023-12-01 10:00, 2023-12-01T10:00:00Z"
    );
    Ok(())
}

fn print_filters(filters: &FilterSet) {
    if filters.is_empty() {
        println!("No active filters.");
    } else {
        println!("Filters: {}", filters.describe());
    }
}

/// Resolves the first argument to a full schedule id. Prefixes must be
/// unambiguous.
fn resolve_id(store: &ScheduleStore, args: &[String], command: &str) -> anyhow::Result<String> {
    let prefix = args
        .first()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("{command}: schedule id is required"))?;

    let matches = store.match_id(prefix);
    match matches.as_slice() {
        [] => Err(anyhow!("no schedule matches '{prefix}'")),
        [one] => Ok(one.id.clone()),
        many => Err(anyhow!(
            "ambiguous id '{prefix}' matches {} schedules",
            many.len()
        )),
    }
}

fn validate(schedule: &Schedule) -> anyhow::Result<()> {
    if schedule.title.trim().is_empty() {
        return Err(anyhow!("title is required"));
    }
    if !schedule.has_valid_span() {
        return Err(anyhow!("start time must be before end time"));
    }
    Ok(())
}

fn apply_filter_terms(
    current: &FilterSet,
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<FilterSet> {
    let mut next = current.clone();
    let mut title_words: Option<Vec<&str>> = None;

    for arg in args {
        let Some((key, value)) = arg.split_once(':').or_else(|| arg.split_once('=')) else {
            title_words.get_or_insert_with(Vec::new).push(arg.as_str());
            continue;
        };

        match key.to_ascii_lowercase().as_str() {
            "title" => title_words.get_or_insert_with(Vec::new).push(value),
            "pri" | "priority" => next.priority = parse_priority_filter(value),
            "status" => next.status = parse_status_filter(value),
            "date" => next.date = parse_filter_date(value, now, tz),
            other => return Err(anyhow!("filter: unknown key '{other}'")),
        }
    }

    // Bare words continue the title, so `title:Team sync` filters on "Team sync".
    if let Some(words) = title_words {
        next.title = parse_title_filter(words.join(" ").trim());
    }

    Ok(next)
}

/// Date filters accept the date expressions `add` does and fall back to the
/// strict `YYYY-MM-DD` parser, which maps sentinels and junk to `None`.
fn parse_filter_date(raw: &str, now: DateTime<Utc>, tz: &Tz) -> Option<NaiveDate> {
    match parse_date_expr(raw, now, tz) {
        Ok(dt) => Some(local_date(dt, tz)),
        Err(_) => parse_date_filter(raw),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Mod {
    Title(String),
    Description(String),
    Start(DateTime<Utc>),
    End(DateTime<Utc>),
    Location(Option<String>),
    Priority(Priority),
    Status(Status),
    Reminder(bool),
    RemindBefore(u32),
    TagAdd(String),
    TagRemove(String),
}

#[instrument(skip(args, now, tz))]
fn parse_title_and_mods(
    args: &[String],
    now: DateTime<Utc>,
    tz: &Tz,
) -> anyhow::Result<(String, Vec<Mod>)> {
    let mut title_parts = Vec::new();
    let mut mods = Vec::new();

    let mut literal = false;
    for arg in args {
        if arg == "--" {
            literal = true;
            continue;
        }

        if !literal && let Some(one_mod) = parse_one_mod(arg, now, tz)? {
            mods.push(one_mod);
            continue;
        }

        title_parts.push(arg.clone());
    }

    let title = title_parts.join(" ");
    let has_title_mod = mods.iter().any(|m| matches!(m, Mod::Title(_)));
    if title.trim().is_empty() && !has_title_mod {
        return Err(anyhow!("add: title is required"));
    }

    Ok((title, mods))
}

#[instrument(skip(args, now, tz))]
fn parse_mods(args: &[String], now: DateTime<Utc>, tz: &Tz) -> anyhow::Result<Vec<Mod>> {
    let mut mods = Vec::new();
    for arg in args {
        if let Some(one_mod) = parse_one_mod(arg, now, tz)? {
            mods.push(one_mod);
        } else {
            warn!(arg = %arg, "unrecognized modifier token ignored");
        }
    }
    Ok(mods)
}

fn parse_one_mod(tok: &str, now: DateTime<Utc>, tz: &Tz) -> anyhow::Result<Option<Mod>> {
    if let Some(tag) = tok.strip_prefix('+').filter(|t| is_tag(t)) {
        return Ok(Some(Mod::TagAdd(tag.to_string())));
    }
    if let Some(tag) = tok.strip_prefix('-').filter(|t| is_tag(t)) {
        return Ok(Some(Mod::TagRemove(tag.to_string())));
    }

    let Some((key, value)) = tok.split_once(':').or_else(|| tok.split_once('=')) else {
        return Ok(None);
    };

    let key = key.to_ascii_lowercase();
    let one_mod = match key.as_str() {
        "title" => Mod::Title(value.to_string()),
        "desc" | "description" => Mod::Description(value.to_string()),
        "start" => Mod::Start(
            parse_date_expr(value, now, tz).with_context(|| format!("invalid start: {value}"))?,
        ),
        "end" => Mod::End(
            parse_date_expr(value, now, tz).with_context(|| format!("invalid end: {value}"))?,
        ),
        "at" | "location" => {
            let location = value.trim();
            Mod::Location((!location.is_empty()).then(|| location.to_string()))
        }
        "pri" | "priority" => Mod::Priority(value.parse()?),
        "status" => Mod::Status(value.parse()?),
        "remind" | "reminder" => Mod::Reminder(parse_switch(value)?),
        "remind.before" | "reminder.before" => Mod::RemindBefore(
            value
                .trim()
                .parse()
                .with_context(|| format!("invalid reminder minutes: {value}"))?,
        ),
        _ => return Ok(None),
    };
    Ok(Some(one_mod))
}

fn is_tag(tag: &str) -> bool {
    tag.chars()
        .next()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
        && !tag.contains(char::is_whitespace)
}

fn parse_switch(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "y" | "yes" | "on" | "true" => Ok(true),
        "0" | "n" | "no" | "off" | "false" => Ok(false),
        other => Err(anyhow!("expected yes or no, got '{other}'")),
    }
}

/// Folds modifiers into a patch. Tags are edited relative to `current_tags`
/// and only written when they actually change.
fn patch_from_mods(current_tags: &[String], mods: &[Mod]) -> SchedulePatch {
    let mut patch = SchedulePatch::default();
    let mut tags = current_tags.to_vec();

    for one_mod in mods {
        match one_mod {
            Mod::Title(title) => patch.title = Some(title.clone()),
            Mod::Description(desc) => patch.description = Some(desc.clone()),
            Mod::Start(dt) => patch.start_time = Some(*dt),
            Mod::End(dt) => patch.end_time = Some(*dt),
            Mod::Location(location) => patch.location = Some(location.clone()),
            Mod::Priority(priority) => patch.priority = Some(*priority),
            Mod::Status(status) => patch.status = Some(*status),
            Mod::Reminder(enabled) => {
                patch.reminder = Some(Some(*enabled));
                if !enabled {
                    patch.reminder_time = Some(None);
                }
            }
            Mod::RemindBefore(minutes) => {
                patch.reminder = Some(Some(true));
                patch.reminder_time = Some(Some(*minutes));
            }
            Mod::TagAdd(tag) => {
                if tags.iter().all(|existing| existing != tag) {
                    tags.push(tag.clone());
                }
            }
            Mod::TagRemove(tag) => tags.retain(|existing| existing != tag),
        }
    }

    if tags != current_tags {
        patch.tags = Some(tags);
    }
    patch
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
    use chrono_tz::Asia::Shanghai;

    use super::{
        Mod, apply_filter_terms, cmd_add, cmd_filter, cmd_modify, cmd_toggle, expand_command_abbrev,
        known_command_names, parse_mods, parse_title_and_mods, patch_from_mods,
    };
    use crate::datastore::{MemoryKv, StorageGateway};
    use crate::filter::FilterSet;
    use crate::schedule::{Priority, Status};
    use crate::store::ScheduleStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 12, 1, 1, 0, 0).unwrap()
    }

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    fn memory_store() -> ScheduleStore {
        let gateway = StorageGateway::new(MemoryKv::new(), Shanghai);
        ScheduleStore::open(Box::new(gateway), Shanghai)
    }

    #[test]
    fn command_abbreviations() {
        let known = known_command_names();
        assert_eq!(expand_command_abbrev("cal", &known), Some("calendar"));
        assert_eq!(expand_command_abbrev("mod", &known), Some("modify"));
        assert_eq!(expand_command_abbrev("d", &known), None);
        assert_eq!(expand_command_abbrev("do", &known), Some("done"));
    }

    #[test]
    fn title_words_and_modifiers_split() {
        let (title, mods) = parse_title_and_mods(
            &args(&["Team", "sync", "pri:high", "at:Room 4", "+work", "remind.before:15"]),
            now(),
            &Shanghai,
        )
        .expect("parse");
        assert_eq!(title, "Team sync");
        assert_eq!(
            mods,
            vec![
                Mod::Priority(Priority::High),
                Mod::Location(Some("Room 4".to_string())),
                Mod::TagAdd("work".to_string()),
                Mod::RemindBefore(15),
            ]
        );

        let (title, mods) =
            parse_title_and_mods(&args(&["--", "pri:high"]), now(), &Shanghai).expect("parse");
        assert_eq!(title, "pri:high");
        assert!(mods.is_empty());

        assert!(parse_title_and_mods(&args(&["pri:low"]), now(), &Shanghai).is_err());
    }

    #[test]
    fn start_modifier_uses_local_time() {
        let mods = parse_mods(&args(&["start:2023-12-01 10:00"]), now(), &Shanghai)
            .expect("parse");
        assert_eq!(
            mods,
            vec![Mod::Start(Utc.with_ymd_and_hms(2023, 12, 1, 2, 0, 0).unwrap())]
        );
        assert!(parse_mods(&args(&["pri:urgent"]), now(), &Shanghai).is_err());
    }

    #[test]
    fn tag_edits_only_patch_on_change() {
        let current = vec!["work".to_string()];
        let patch = patch_from_mods(&current, &[Mod::TagAdd("work".to_string())]);
        assert_eq!(patch.tags, None);

        let patch = patch_from_mods(
            &current,
            &[
                Mod::TagRemove("work".to_string()),
                Mod::TagAdd("gym".to_string()),
                Mod::Reminder(false),
            ],
        );
        assert_eq!(patch.tags, Some(vec!["gym".to_string()]));
        assert_eq!(patch.reminder, Some(Some(false)));
        assert_eq!(patch.reminder_time, Some(None));
    }

    #[test]
    fn filter_terms_normalize_sentinels() {
        let current = FilterSet {
            title: Some("gym".to_string()),
            priority: Some(Priority::High),
            ..FilterSet::default()
        };
        let next = apply_filter_terms(
            &current,
            &args(&["pri:all", "status:1", "date:2023-12-02"]),
            now(),
            &Shanghai,
        )
        .expect("filter terms");
        assert_eq!(
            next,
            FilterSet {
                title: Some("gym".to_string()),
                priority: None,
                status: Some(Status::Pending),
                date: NaiveDate::from_ymd_opt(2023, 12, 2),
            }
        );

        let next =
            apply_filter_terms(&next, &args(&["date:", "title:"]), now(), &Shanghai).expect("terms");
        assert_eq!(next.date, None);
        assert_eq!(next.title, None);

        assert!(apply_filter_terms(&next, &args(&["colour:red"]), now(), &Shanghai).is_err());
    }

    #[test]
    fn bare_words_extend_the_title_filter() {
        let current = FilterSet::default();
        let terms = args(&["title:Team", "sync", "pri:high"]);
        let next = apply_filter_terms(&current, &terms, now(), &Shanghai).expect("filter terms");
        assert_eq!(next.title.as_deref(), Some("Team sync"));
        assert_eq!(next.priority, Some(Priority::High));

        let terms = args(&["weekly", "title:review"]);
        let next = apply_filter_terms(&current, &terms, now(), &Shanghai).expect("filter terms");
        assert_eq!(next.title.as_deref(), Some("weekly review"));
    }

    #[test]
    fn add_modify_toggle_through_store() {
        let mut store = memory_store();
        cmd_add(&mut store, &args(&["Dentist", "start:today@15:00", "pri:h"]), now())
            .expect("add");
        assert_eq!(store.schedules().len(), 1);

        let added = store.schedules()[0].clone();
        assert_eq!(added.title, "Dentist");
        assert_eq!(added.priority, Priority::High);
        assert_eq!(added.start_time, Utc.with_ymd_and_hms(2023, 12, 1, 7, 0, 0).unwrap());
        assert_eq!(added.end_time, added.start_time + Duration::hours(1));

        let prefix = added.id[..6].to_string();
        let later = now() + Duration::minutes(10);
        cmd_modify(&mut store, &[prefix.clone(), "status:cancelled".to_string()], later)
            .expect("modify");
        assert_eq!(store.schedules()[0].status, Status::Cancelled);
        assert_eq!(store.schedules()[0].updated_at, later);

        cmd_toggle(&mut store, &[prefix.clone()], later + Duration::minutes(1)).expect("toggle");
        assert_eq!(store.schedules()[0].status, Status::Cancelled);
        assert_eq!(store.schedules()[0].updated_at, later);

        cmd_modify(&mut store, &[prefix.clone(), "status:pending".to_string()], later)
            .expect("reopen");
        cmd_toggle(&mut store, &[prefix], later).expect("toggle");
        assert_eq!(store.schedules()[0].status, Status::Completed);
    }

    #[test]
    fn invalid_spans_and_unknown_ids_are_rejected() {
        let mut store = memory_store();
        let err = cmd_add(
            &mut store,
            &args(&["Backwards", "start:2023-12-01 10:00", "end:2023-12-01 09:00"]),
            now(),
        )
        .expect_err("end before start");
        assert!(err.to_string().contains("before end"));
        assert!(store.schedules().is_empty());

        assert!(cmd_toggle(&mut store, &args(&["nope"]), now()).is_err());
    }

    #[test]
    fn filter_command_sets_and_clears() {
        let mut store = memory_store();
        cmd_filter(&mut store, &args(&["status:pending", "pri:2"]), now()).expect("filter");
        assert_eq!(store.filters().status, Some(Status::Pending));
        assert_eq!(store.filters().priority, Some(Priority::Medium));

        cmd_filter(&mut store, &args(&["clear"]), now()).expect("clear");
        assert!(store.filters().is_empty());
    }
}
