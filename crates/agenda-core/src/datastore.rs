use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow};
use chrono_tz::Tz;
use serde::Deserialize;
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::datetime::normalize_timestamp;
use crate::filter::FilterSet;
use crate::schedule::{Priority, Schedule, Status};

pub const DEFAULT_SCHEDULE_KEY: &str = "schedules";
pub const DEFAULT_FILTER_KEY: &str = "schedule_filter";

/// Flat string key-value storage, one value per key.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
    fn remove(&self, key: &str) -> anyhow::Result<()>;
}

/// What the store needs from durable storage. Implementations log failures
/// instead of returning them: a failed load is an empty collection and a
/// failed save is reported as `false`.
pub trait Gateway {
    fn load(&self) -> Vec<Schedule>;
    fn save(&self, schedules: &[Schedule]) -> bool;
    fn load_filters(&self) -> FilterSet;
    fn save_filters(&self, filters: &FilterSet) -> bool;
    fn clear(&self) -> bool;
}

/// Each key is a `<key>.json` file inside `data_dir`.
#[derive(Debug)]
pub struct FileKv {
    pub data_dir: PathBuf,
}

impl FileKv {
    #[tracing::instrument(skip(data_dir))]
    pub fn open(data_dir: &Path) -> anyhow::Result<Self> {
        let data_dir = data_dir.to_path_buf();
        fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;

        info!(data_dir = %data_dir.display(), "opened key-value directory");
        Ok(Self { data_dir })
    }

    pub fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty()
            || key.contains(['/', '\\'])
            || key.starts_with('.')
        {
            return Err(anyhow!("invalid storage key: {key:?}"));
        }
        Ok(self.data_dir.join(format!("{key}.json")))
    }
}

impl KeyValueStore for FileKv {
    #[tracing::instrument(skip(self))]
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(key)?;
        if !path.exists() {
            debug!(file = %path.display(), "key not present");
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        Ok(Some(raw))
    }

    #[tracing::instrument(skip(self, value))]
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        debug!(file = %path.display(), bytes = value.len(), "writing key atomically");

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = NamedTempFile::new_in(dir)?;
        temp.write_all(value.as_bytes())?;
        temp.flush()?;
        temp.persist(&path)
            .map_err(|err| anyhow!("failed to persist {}: {}", path.display(), err))?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("failed removing {}", path.display()))?;
        }
        Ok(())
    }
}

/// In-memory storage for tests. Not durable.
#[derive(Debug, Default)]
pub struct MemoryKv {
    entries: RefCell<HashMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: &str, value: &str) -> Self {
        let kv = Self::default();
        kv.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        kv
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.entries.borrow_mut().remove(key);
        Ok(())
    }
}

/// Serializes the collection under one key and the active filters under
/// another. Stored records that cannot be decoded are carried through saves
/// unchanged, and a collection that failed to load is never overwritten.
#[derive(Debug)]
pub struct StorageGateway<K> {
    kv: K,
    schedule_key: String,
    filter_key: String,
    tz: Tz,
    rejected: RefCell<Vec<Value>>,
    load_failed: Cell<bool>,
}

impl<K: KeyValueStore> StorageGateway<K> {
    pub fn new(kv: K, tz: Tz) -> Self {
        Self {
            kv,
            schedule_key: DEFAULT_SCHEDULE_KEY.to_string(),
            filter_key: DEFAULT_FILTER_KEY.to_string(),
            tz,
            rejected: RefCell::new(vec![]),
            load_failed: Cell::new(false),
        }
    }

    pub fn with_keys(mut self, schedule_key: &str, filter_key: &str) -> Self {
        self.schedule_key = schedule_key.to_string();
        self.filter_key = filter_key.to_string();
        self
    }

    pub fn backend(&self) -> &K {
        &self.kv
    }

    #[tracing::instrument(skip(self), fields(key = %self.schedule_key))]
    pub fn try_load(&self) -> anyhow::Result<Vec<Schedule>> {
        let decoded = match self.kv.get(&self.schedule_key)? {
            Some(raw) => decode_schedules(&raw, &self.tz)
                .with_context(|| format!("failed decoding key {}", self.schedule_key))?,
            None => DecodedSchedules::default(),
        };
        self.load_failed.set(false);
        *self.rejected.borrow_mut() = decoded.rejected;
        Ok(decoded.schedules)
    }

    /// Records kept from the last load that could not be decoded.
    pub fn rejected_count(&self) -> usize {
        self.rejected.borrow().len()
    }

    #[tracing::instrument(skip(self, schedules), fields(key = %self.schedule_key))]
    pub fn try_save(&self, schedules: &[Schedule]) -> anyhow::Result<()> {
        if self.load_failed.get() {
            return Err(anyhow!(
                "refusing to overwrite key {}: it could not be read at load time",
                self.schedule_key
            ));
        }
        let payload = encode_with_rejected(schedules, &self.rejected.borrow())?;
        self.kv
            .set(&self.schedule_key, &payload)
            .with_context(|| format!("failed writing key {}", self.schedule_key))
    }

    fn try_load_filters(&self) -> anyhow::Result<FilterSet> {
        match self.kv.get(&self.filter_key)? {
            Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .with_context(|| format!("failed decoding key {}", self.filter_key)),
            _ => Ok(FilterSet::default()),
        }
    }

    fn try_save_filters(&self, filters: &FilterSet) -> anyhow::Result<()> {
        let payload = serde_json::to_string(filters)?;
        self.kv
            .set(&self.filter_key, &payload)
            .with_context(|| format!("failed writing key {}", self.filter_key))
    }
}

impl<K: KeyValueStore> Gateway for StorageGateway<K> {
    fn load(&self) -> Vec<Schedule> {
        match self.try_load() {
            Ok(schedules) => {
                debug!(count = schedules.len(), "loaded schedules");
                schedules
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to load schedules; starting empty");
                self.load_failed.set(true);
                vec![]
            }
        }
    }

    fn save(&self, schedules: &[Schedule]) -> bool {
        match self.try_save(schedules) {
            Ok(()) => {
                debug!(count = schedules.len(), "saved schedules");
                true
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to save schedules");
                false
            }
        }
    }

    fn load_filters(&self) -> FilterSet {
        self.try_load_filters().unwrap_or_else(|err| {
            warn!(error = %format!("{err:#}"), "failed to load filters; using none");
            FilterSet::default()
        })
    }

    fn save_filters(&self, filters: &FilterSet) -> bool {
        match self.try_save_filters(filters) {
            Ok(()) => true,
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to save filters");
                false
            }
        }
    }

    fn clear(&self) -> bool {
        match self.kv.remove(&self.schedule_key) {
            Ok(()) => {
                self.load_failed.set(false);
                self.rejected.borrow_mut().clear();
                info!(key = %self.schedule_key, "cleared schedules");
                true
            }
            Err(err) => {
                error!(error = %format!("{err:#}"), "failed to clear schedules");
                false
            }
        }
    }
}

pub fn encode_schedules(schedules: &[Schedule]) -> anyhow::Result<String> {
    serde_json::to_string(schedules).context("failed to serialize schedules")
}

fn encode_with_rejected(schedules: &[Schedule], rejected: &[Value]) -> anyhow::Result<String> {
    if rejected.is_empty() {
        return encode_schedules(schedules);
    }
    let mut records = Vec::with_capacity(schedules.len() + rejected.len());
    for schedule in schedules {
        records.push(serde_json::to_value(schedule).context("failed to serialize schedule")?);
    }
    records.extend(rejected.iter().cloned());
    serde_json::to_string(&records).context("failed to serialize schedules")
}

#[derive(Debug, Default)]
pub struct DecodedSchedules {
    pub schedules: Vec<Schedule>,
    /// Raw records that could not be decoded, in stored order.
    pub rejected: Vec<Value>,
}

/// Decodes a stored collection. Start/end/created/updated times may use any
/// of the legacy timestamp encodings; they are normalized here once. Records
/// repeating an id already seen are dropped; records that fail to decode are
/// set aside in `rejected`. Only a payload that is not a JSON array fails.
#[tracing::instrument(skip(raw, tz))]
pub fn decode_schedules(raw: &str, tz: &Tz) -> anyhow::Result<DecodedSchedules> {
    let mut decoded = DecodedSchedules::default();
    if raw.trim().is_empty() {
        return Ok(decoded);
    }

    let stored: Vec<Value> =
        serde_json::from_str(raw).context("stored schedules are not a valid JSON array")?;

    let mut seen = HashSet::with_capacity(stored.len());
    for (idx, value) in stored.into_iter().enumerate() {
        let schedule = serde_json::from_value::<StoredSchedule>(value.clone())
            .map_err(anyhow::Error::from)
            .and_then(|record| record.into_schedule(tz));
        let schedule = match schedule {
            Ok(schedule) => schedule,
            Err(err) => {
                warn!(index = idx, error = %format!("{err:#}"), "undecodable schedule set aside");
                decoded.rejected.push(value);
                continue;
            }
        };
        if !seen.insert(schedule.id.clone()) {
            warn!(id = %schedule.id, index = idx, "duplicate schedule id; keeping first");
            continue;
        }
        decoded.schedules.push(schedule);
    }

    debug!(
        count = decoded.schedules.len(),
        rejected = decoded.rejected.len(),
        "decoded schedules"
    );
    Ok(decoded)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredSchedule {
    id: String,
    title: String,
    #[serde(default)]
    description: String,
    start_time: String,
    end_time: String,
    #[serde(default)]
    location: Option<String>,
    priority: Priority,
    status: Status,
    #[serde(default)]
    reminder: Option<bool>,
    #[serde(default)]
    reminder_time: Option<ReminderTime>,
    #[serde(default)]
    tags: Vec<String>,
    created_at: String,
    updated_at: String,
}

/// Reminder lead time was historically stored as text.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ReminderTime {
    Minutes(u32),
    Text(String),
}

impl ReminderTime {
    /// Blank or non-numeric text means no lead time.
    fn minutes(self) -> Option<u32> {
        match self {
            ReminderTime::Minutes(minutes) => Some(minutes),
            ReminderTime::Text(text) if text.trim().is_empty() => None,
            ReminderTime::Text(text) => text
                .trim()
                .parse::<u32>()
                .inspect_err(|err| {
                    warn!(reminder_time = %text, error = %err, "ignoring unreadable reminderTime");
                })
                .ok(),
        }
    }
}

impl StoredSchedule {
    fn into_schedule(self, tz: &Tz) -> anyhow::Result<Schedule> {
        let reminder_time = self.reminder_time.and_then(ReminderTime::minutes);
        Ok(Schedule {
            start_time: normalize_timestamp(&self.start_time, tz).context("startTime")?,
            end_time: normalize_timestamp(&self.end_time, tz).context("endTime")?,
            created_at: normalize_timestamp(&self.created_at, tz).context("createdAt")?,
            updated_at: normalize_timestamp(&self.updated_at, tz).context("updatedAt")?,
            id: self.id,
            title: self.title,
            description: self.description,
            location: self.location,
            priority: self.priority,
            status: self.status,
            reminder: self.reminder,
            reminder_time,
            tags: self.tags,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};
    use chrono_tz::Asia::Shanghai;
    use tempfile::tempdir;

    use super::{
        DEFAULT_FILTER_KEY, DEFAULT_SCHEDULE_KEY, FileKv, Gateway, KeyValueStore, MemoryKv,
        StorageGateway, decode_schedules,
    };
    use crate::filter::FilterSet;
    use crate::schedule::{Priority, Schedule, Status};

    fn sample() -> Vec<Schedule> {
        let now = Utc.with_ymd_and_hms(2023, 12, 1, 2, 30, 0).unwrap()
            + Duration::milliseconds(125);
        let mut first = Schedule::new_pending(
            "Dentist".to_string(),
            now,
            now + Duration::minutes(45),
            now,
        );
        first.location = Some("Main St".to_string());
        first.reminder = Some(true);
        first.reminder_time = Some(30);
        first.tags = vec!["health".to_string()];

        let mut second = Schedule::new_pending(
            "Ship release".to_string(),
            now + Duration::days(1),
            now + Duration::days(1) + Duration::hours(2),
            now,
        );
        second.priority = Priority::High;
        second.status = Status::Completed;
        vec![first, second]
    }

    #[test]
    fn file_gateway_round_trips_collection() {
        let temp = tempdir().expect("tempdir");
        let kv = FileKv::open(temp.path()).expect("open kv");
        let gateway = StorageGateway::new(kv, Shanghai);

        let schedules = sample();
        assert!(gateway.save(&schedules));
        assert_eq!(gateway.load(), schedules);
        assert!(temp.path().join("schedules.json").exists());

        assert!(gateway.clear());
        assert!(gateway.load().is_empty());
    }

    #[test]
    fn wire_format_uses_camel_case_and_lowercase_enums() {
        let gateway = StorageGateway::new(MemoryKv::new(), Shanghai);
        assert!(gateway.save(&sample()));

        let raw = gateway
            .backend()
            .get(DEFAULT_SCHEDULE_KEY)
            .expect("get")
            .expect("present");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        let first = &value[0];
        assert_eq!(first["startTime"], "2023-12-01T02:30:00.125Z");
        assert_eq!(first["priority"], "medium");
        assert_eq!(first["status"], "pending");
        assert_eq!(first["reminderTime"], 30);
        assert_eq!(value[1]["status"], "completed");
        assert!(value[1].get("location").is_none());
    }

    #[test]
    fn missing_or_corrupt_data_loads_empty() {
        let missing = StorageGateway::new(MemoryKv::new(), Shanghai);
        assert!(missing.load().is_empty());

        let corrupt = StorageGateway::new(
            MemoryKv::with_entry(DEFAULT_SCHEDULE_KEY, "{not json"),
            Shanghai,
        );
        assert!(corrupt.load().is_empty());

        let bad_enum = StorageGateway::new(
            MemoryKv::with_entry(
                DEFAULT_SCHEDULE_KEY,
                r#"[{"id":"1","title":"x","startTime":"2023-12-01","endTime":"2023-12-02",
                    "priority":"urgent","status":"pending",
                    "createdAt":"2023-12-01","updatedAt":"2023-12-01"}]"#,
            ),
            Shanghai,
        );
        assert!(bad_enum.load().is_empty());
        assert_eq!(bad_enum.rejected_count(), 1);
    }

    #[test]
    fn one_bad_record_does_not_sink_the_rest() {
        let gateway = StorageGateway::new(
            MemoryKv::with_entry(
                DEFAULT_SCHEDULE_KEY,
                r#"[{"id":"1","title":"Keep me","startTime":"2023-12-01 09:00",
                     "endTime":"2023-12-01 10:00","priority":"low","status":"pending",
                     "reminderTime":"","createdAt":"2023-12-01","updatedAt":"2023-12-01"},
                    {"id":"2","title":"Broken","startTime":"not a date",
                     "endTime":"2023-12-01 10:00","priority":"low","status":"pending",
                     "createdAt":"2023-12-01","updatedAt":"2023-12-01"}]"#,
            ),
            Shanghai,
        );

        let loaded = gateway.load();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].title, "Keep me");
        assert_eq!(loaded[0].reminder_time, None);
        assert_eq!(gateway.rejected_count(), 1);

        let mut next = loaded.clone();
        next.extend(sample());
        assert!(gateway.save(&next));
        let raw = gateway
            .backend()
            .get(DEFAULT_SCHEDULE_KEY)
            .expect("get")
            .expect("present");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("json");
        let records = value.as_array().expect("array");
        assert_eq!(records.len(), 4);
        assert_eq!(records[3]["title"], "Broken");
        assert_eq!(records[3]["startTime"], "not a date");
    }

    #[test]
    fn unreadable_collection_is_not_overwritten() {
        let gateway = StorageGateway::new(
            MemoryKv::with_entry(DEFAULT_SCHEDULE_KEY, "{not json"),
            Shanghai,
        );
        assert!(gateway.load().is_empty());
        assert!(!gateway.save(&sample()));
        assert_eq!(
            gateway.backend().get(DEFAULT_SCHEDULE_KEY).expect("get").as_deref(),
            Some("{not json")
        );

        assert!(gateway.clear());
        assert!(gateway.save(&sample()));
        assert_eq!(gateway.load().len(), 2);
    }

    #[test]
    fn legacy_records_are_normalized_on_load() {
        let raw = r#"[
            {"id":"1700000000000","title":"Call mom","description":"",
             "startTime":"2023-12-01 09:00","endTime":"2023-12-01 10:00",
             "location":"","priority":"low","status":"pending","reminder":false,
             "reminderTime":"15",
             "createdAt":"2023-11-30T08:00:00.000Z","updatedAt":"2023-11-30T08:00:00.000Z"},
            {"id":"1700000000000","title":"dup","startTime":"2023-12-01","endTime":"2023-12-02",
             "priority":"low","status":"pending",
             "createdAt":"2023-12-01","updatedAt":"2023-12-01"}
        ]"#;
        let decoded = decode_schedules(raw, &Shanghai).expect("decode");
        assert!(decoded.rejected.is_empty());
        assert_eq!(decoded.schedules.len(), 1);
        let record = &decoded.schedules[0];
        assert_eq!(record.title, "Call mom");
        assert_eq!(record.reminder_time, Some(15));
        assert_eq!(record.location.as_deref(), Some(""));
        assert_eq!(
            record.start_time,
            Utc.with_ymd_and_hms(2023, 12, 1, 1, 0, 0).unwrap()
        );
    }

    #[test]
    fn filters_persist_under_their_own_key() {
        let gateway = StorageGateway::new(MemoryKv::new(), Shanghai).with_keys("s", "f");
        assert_eq!(gateway.load_filters(), FilterSet::default());

        let filters = FilterSet {
            status: Some(Status::Pending),
            date: chrono::NaiveDate::from_ymd_opt(2023, 12, 1),
            ..FilterSet::default()
        };
        assert!(gateway.save_filters(&filters));
        assert_eq!(gateway.load_filters(), filters);
        assert!(gateway.backend().get(DEFAULT_FILTER_KEY).expect("get").is_none());
        assert!(gateway.backend().get("f").expect("get").is_some());
    }

    #[test]
    fn file_keys_cannot_escape_data_dir() {
        let temp = tempdir().expect("tempdir");
        let kv = FileKv::open(temp.path()).expect("open kv");
        assert!(kv.path_for("../outside").is_err());
        assert!(kv.path_for("").is_err());
        assert!(kv.set("nested/key", "x").is_err());
    }
}
