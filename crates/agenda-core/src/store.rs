use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use tracing::{debug, info, warn};

use crate::datastore::Gateway;
use crate::filter::{FilterSet, project};
use crate::schedule::{Priority, Schedule, SchedulePatch, Status};
use crate::summary::{Summary, summarize};

/// Canonical application state. The collection is shared between successive
/// states until an action actually changes it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct State {
    pub schedules: Arc<Vec<Schedule>>,
    pub filters: FilterSet,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Load(Vec<Schedule>),
    Add(Schedule),
    Update { id: String, patch: SchedulePatch },
    Delete(String),
    ToggleStatus(String),
    SetTitleFilter(Option<String>),
    SetPriorityFilter(Option<Priority>),
    SetStatusFilter(Option<Status>),
    SetDateFilter(Option<NaiveDate>),
    SetFilters(FilterSet),
    ClearFilters,
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::Load(_) => "load",
            Action::Add(_) => "add",
            Action::Update { .. } => "update",
            Action::Delete(_) => "delete",
            Action::ToggleStatus(_) => "toggle_status",
            Action::SetTitleFilter(_) => "set_title_filter",
            Action::SetPriorityFilter(_) => "set_priority_filter",
            Action::SetStatusFilter(_) => "set_status_filter",
            Action::SetDateFilter(_) => "set_date_filter",
            Action::SetFilters(_) => "set_filters",
            Action::ClearFilters => "clear_filters",
        }
    }
}

/// Pure transition. `state` is left untouched; unknown ids are no-ops that
/// hand back the same collection.
pub fn reduce(state: &State, action: Action, now: DateTime<Utc>) -> State {
    match action {
        Action::Load(schedules) => State {
            schedules: Arc::new(schedules),
            filters: state.filters.clone(),
        },
        Action::Add(schedule) => {
            let mut next = Vec::with_capacity(state.schedules.len() + 1);
            next.extend(state.schedules.iter().cloned());
            next.push(schedule);
            State {
                schedules: Arc::new(next),
                filters: state.filters.clone(),
            }
        }
        Action::Update { id, patch } => {
            map_matching(state, &id, |schedule| schedule.merged(&patch, now))
        }
        Action::Delete(id) => {
            if !state.schedules.iter().any(|s| s.id == id) {
                return state.clone();
            }
            let next = state
                .schedules
                .iter()
                .filter(|s| s.id != id)
                .cloned()
                .collect();
            State {
                schedules: Arc::new(next),
                filters: state.filters.clone(),
            }
        }
        Action::ToggleStatus(id) => {
            let toggles = state
                .schedules
                .iter()
                .any(|s| s.id == id && s.status != Status::Cancelled);
            if !toggles {
                return state.clone();
            }
            map_matching(state, &id, |schedule| Schedule {
                status: schedule.status.toggled(),
                updated_at: now,
                ..schedule.clone()
            })
        }
        Action::SetTitleFilter(title) => with_filters(state, FilterSet {
            title,
            ..state.filters.clone()
        }),
        Action::SetPriorityFilter(priority) => with_filters(state, FilterSet {
            priority,
            ..state.filters.clone()
        }),
        Action::SetStatusFilter(status) => with_filters(state, FilterSet {
            status,
            ..state.filters.clone()
        }),
        Action::SetDateFilter(date) => with_filters(state, FilterSet {
            date,
            ..state.filters.clone()
        }),
        Action::SetFilters(filters) => with_filters(state, filters),
        Action::ClearFilters => with_filters(state, FilterSet::default()),
    }
}

fn with_filters(state: &State, filters: FilterSet) -> State {
    State {
        schedules: Arc::clone(&state.schedules),
        filters,
    }
}

fn map_matching<F>(state: &State, id: &str, f: F) -> State
where
    F: Fn(&Schedule) -> Schedule,
{
    if !state.schedules.iter().any(|s| s.id == id) {
        return state.clone();
    }
    let next = state
        .schedules
        .iter()
        .map(|s| if s.id == id { f(s) } else { s.clone() })
        .collect();
    State {
        schedules: Arc::new(next),
        filters: state.filters.clone(),
    }
}

/// Single owner of the canonical state. Every dispatch commits the new state
/// first and then mirrors it to the gateway, in dispatch order.
pub struct ScheduleStore {
    state: State,
    gateway: Box<dyn Gateway>,
    tz: Tz,
}

impl ScheduleStore {
    #[tracing::instrument(skip(gateway))]
    pub fn open(gateway: Box<dyn Gateway>, tz: Tz) -> Self {
        let schedules = gateway.load();
        let filters = gateway.load_filters();
        let now = Utc::now();

        let state = reduce(&State::default(), Action::Load(schedules), now);
        let state = reduce(&state, Action::SetFilters(filters), now);
        info!(
            schedules = state.schedules.len(),
            filters = %state.filters.describe(),
            "opened schedule store"
        );

        Self { state, gateway, tz }
    }

    #[tracing::instrument(skip(self, action), fields(action = action.name()))]
    pub fn dispatch(&mut self, action: Action, now: DateTime<Utc>) -> &State {
        let next = reduce(&self.state, action, now);
        let collection_changed = !Arc::ptr_eq(&next.schedules, &self.state.schedules);
        let filters_changed = next.filters != self.state.filters;
        self.state = next;

        debug!(
            collection_changed,
            filters_changed,
            count = self.state.schedules.len(),
            "committed state"
        );

        if collection_changed && !self.gateway.save(&self.state.schedules) {
            warn!("schedule collection not persisted; in-memory state is ahead of storage");
        }
        if filters_changed && !self.gateway.save_filters(&self.state.filters) {
            warn!("filters not persisted");
        }

        &self.state
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn schedules(&self) -> &[Schedule] {
        &self.state.schedules
    }

    pub fn filters(&self) -> &FilterSet {
        &self.state.filters
    }

    pub fn timezone(&self) -> &Tz {
        &self.tz
    }

    pub fn find(&self, id: &str) -> Option<&Schedule> {
        self.state.schedules.iter().find(|s| s.id == id)
    }

    /// Schedules whose id starts with `prefix`; an exact match wins outright.
    pub fn match_id(&self, prefix: &str) -> Vec<&Schedule> {
        if let Some(exact) = self.find(prefix) {
            return vec![exact];
        }
        self.state
            .schedules
            .iter()
            .filter(|s| s.id.starts_with(prefix))
            .collect()
    }

    /// The filtered, sorted view under the current filters.
    pub fn visible(&self) -> Vec<Schedule> {
        project(&self.state.schedules, &self.state.filters, &self.tz)
    }

    pub fn summary(&self, now: DateTime<Utc>) -> Summary {
        summarize(&self.state.schedules, now, &self.tz)
    }
}
