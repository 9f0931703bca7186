//! Service entity and per-process runtime state.
use std::collections::{BTreeMap, BTreeSet};

use strum_macros::{AsRefStr, Display, EnumString};

use crate::options::ServiceOptions;

/// The sortable priority assigned by supervisor when no priority is set.
pub const DEFAULT_PRIORITY_SORT: i32 = 999;

/// Process states reported by supervisor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, AsRefStr, Display, EnumString,
)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    /// True for the states supervisor counts as running (RUNNING, STARTING, BACKOFF).
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            ProcessState::Running | ProcessState::Starting | ProcessState::Backoff
        )
    }

    /// True when the state is a valid dependency target. STOPPED and UNKNOWN
    /// are never meaningful targets to wait for.
    pub fn is_valid_wait_target(&self) -> bool {
        !matches!(self, ProcessState::Stopped | ProcessState::Unknown)
    }
}

/// A named, possibly multi-process unit managed by the sequencer.
///
/// Created once during graph construction; mutated only by the event loop
/// appending newly observed states and by group reassignment from supervisor
/// config info.
#[derive(Debug)]
pub struct Service {
    /// Unique service name, from the config section.
    pub name: String,
    /// Supervisor process group. Equals `name` unless the service belongs to
    /// a declared group.
    pub group: String,
    /// Parsed declarative options.
    pub options: ServiceOptions,
    /// Append-only history of every state each constituent process has
    /// reported. Never cleared during a run.
    procs_state: BTreeMap<String, BTreeSet<ProcessState>>,
    /// Effective priority resolved during graph construction.
    priority_sort: i32,
}

impl Service {
    /// Creates a service with an empty reached-state history for each of its
    /// constituent processes.
    pub fn new(name: String, group: String, options: ServiceOptions) -> Self {
        let procs_state = options
            .process_names
            .iter()
            .map(|procname| (procname.clone(), BTreeSet::new()))
            .collect();

        Self {
            name,
            group,
            options,
            procs_state,
            priority_sort: DEFAULT_PRIORITY_SORT,
        }
    }

    /// Whether `procname` is one of this service's constituent processes.
    pub fn has_process(&self, procname: &str) -> bool {
        self.procs_state.contains_key(procname)
    }

    /// The constituent process names.
    pub fn proc_names(&self) -> impl Iterator<Item = &str> {
        self.procs_state.keys().map(String::as_str)
    }

    /// Appends `state` to the reached-state history of `procname`. Repeats
    /// are absorbed; the history is a set per process, not a sequence.
    pub fn record_state_reached(&mut self, procname: &str, state: ProcessState) {
        if let Some(reached) = self.procs_state.get_mut(procname) {
            reached.insert(state);
        }
    }

    /// Returns true iff for at least one candidate state, every constituent
    /// process has that state in its own history. A multi-process service
    /// qualifies only once all its instances individually reached a candidate
    /// state, not necessarily simultaneously.
    pub fn has_reached_states(&self, states: &[ProcessState]) -> bool {
        states.iter().any(|state| {
            self.procs_state
                .values()
                .all(|reached| reached.contains(state))
        })
    }

    /// The process name for a single-process service. Not meaningful when the
    /// service expands to multiple instances.
    pub fn procname(&self) -> &str {
        self.procs_state
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or(&self.name)
    }

    /// The identifier passed to supervisor to start this process or process
    /// group.
    pub fn group_and_procname(&self) -> String {
        if self.procs_state.len() > 1 {
            if self.name == self.group {
                // Multi-instance service not wrapped in a [group:x] section:
                // the service name is itself the group name.
                self.name.clone()
            } else {
                format!("{}:{}", self.group, self.name)
            }
        } else {
            let procname = self.procname();
            if self.name != self.group || procname != self.name {
                // Part of a declared group, or carries a custom process_name.
                format!("{}:{}", self.group, procname)
            } else {
                self.name.clone()
            }
        }
    }

    /// Whether this service is managed by the sequencer.
    pub fn dependent_startup(&self) -> bool {
        self.options.dependent_startup
    }

    /// The cached sortable priority. [`DEFAULT_PRIORITY_SORT`] when no
    /// explicit or inherited priority applies.
    pub fn priority_sort(&self) -> i32 {
        self.priority_sort
    }

    pub(crate) fn set_priority_sort(&mut self, priority: i32) {
        self.priority_sort = priority;
    }

    /// The resolved priority as reported to operators. `None` when the value
    /// equals the unset sentinel.
    pub fn priority_effective(&self) -> Option<i32> {
        if self.priority_sort == DEFAULT_PRIORITY_SORT {
            None
        } else {
            Some(self.priority_sort)
        }
    }
}
