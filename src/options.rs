//! Option model: turns a service's raw option bag into typed startup options.
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::warn;

use crate::service::ProcessState;

/// Option key declaring the dependency list.
pub const WAIT_FOR_OPT: &str = "dependent_startup_wait_for";
/// Option key enabling transitive priority inheritance.
pub const INHERIT_PRIORITY_OPT: &str = "dependent_startup_inherit_priority";

/// A raw key/value option bag for one service section. Produced by the
/// configuration source; all include-file and environment expansion has
/// already happened by the time the bag reaches the option model.
pub type OptionBag = BTreeMap<String, String>;

/// A dependency on another service together with the states that satisfy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    /// Name of the service depended upon.
    pub service: String,
    /// States of the dependency that satisfy this edge. Declared without an
    /// explicit state list, this defaults to `{RUNNING}`.
    pub required_states: BTreeSet<ProcessState>,
}

/// Typed, validated options for a single service.
///
/// Parsing never fails: a malformed value for any single field logs a warning
/// and reverts that field to its default.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Explicit start priority, if declared.
    pub priority: Option<i32>,
    /// Declared autostart value. Effective default is true when unset.
    pub autostart: Option<bool>,
    /// Whether this service's startup is managed by the sequencer.
    pub dependent_startup: bool,
    /// Whether an unset priority is inherited from dependencies.
    pub inherit_priority: bool,
    /// Declared number of process instances.
    pub numprocs: Option<u32>,
    /// Dependencies in declaration order.
    pub wait_for: Vec<Dependency>,
    /// One entry per process instance. Length 1 unless `numprocs` expands the
    /// service through its `process_name` template.
    pub process_names: Vec<String>,
}

impl ServiceOptions {
    /// Parses the option bag for service `name` in process group `group`.
    pub fn parse(name: &str, group: &str, bag: &OptionBag) -> Self {
        let priority = bag
            .get("priority")
            .and_then(|raw| parse_int(name, "priority", raw));
        let autostart = bag
            .get("autostart")
            .and_then(|raw| parse_bool(name, "autostart", raw));
        let dependent_startup = bag
            .get("dependent_startup")
            .and_then(|raw| parse_bool(name, "dependent_startup", raw))
            .unwrap_or(false);
        let inherit_priority = bag
            .get(INHERIT_PRIORITY_OPT)
            .and_then(|raw| parse_bool(name, INHERIT_PRIORITY_OPT, raw))
            .unwrap_or(false);
        let numprocs = bag
            .get("numprocs")
            .and_then(|raw| parse_uint(name, "numprocs", raw));
        let numprocs_start = bag
            .get("numprocs_start")
            .and_then(|raw| parse_uint(name, "numprocs_start", raw))
            .unwrap_or(0);

        let wait_for = bag
            .get(WAIT_FOR_OPT)
            .map(|raw| parse_wait_for(name, raw))
            .unwrap_or_default();

        let process_names = match bag.get("process_name") {
            Some(template) => {
                expand_process_names(name, group, template, numprocs, numprocs_start)
            }
            None => vec![name.to_string()],
        };

        Self {
            priority,
            autostart,
            dependent_startup,
            inherit_priority,
            numprocs,
            wait_for,
            process_names,
        }
    }

    /// Effective autostart value. Supervisor defaults to true.
    pub fn is_autostart(&self) -> bool {
        self.autostart.unwrap_or(true)
    }

    /// Whether this service expands to more than one process instance.
    pub fn is_process_group(&self) -> bool {
        self.numprocs.is_some_and(|n| n > 1)
    }

    /// The required-state set for a given dependency, if declared.
    pub fn required_states(&self, dep: &str) -> Option<&BTreeSet<ProcessState>> {
        self.wait_for
            .iter()
            .find(|d| d.service == dep)
            .map(|d| &d.required_states)
    }

    /// Dependency list rendered as the `service:STATE,STATE` token form, for
    /// operator-facing logs.
    pub fn wait_for_summary(&self) -> Option<String> {
        if self.wait_for.is_empty() {
            return None;
        }
        let tokens: Vec<String> = self
            .wait_for
            .iter()
            .map(|dep| {
                let states: Vec<&str> =
                    dep.required_states.iter().map(|s| s.as_ref()).collect();
                format!("{}:{}", dep.service, states.join(","))
            })
            .collect();
        Some(tokens.join(" "))
    }
}

/// Parses a supervisor-style boolean (`true/false`, `yes/no`, `on/off`, `1/0`).
fn parse_bool(service: &str, option: &str, raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        other => {
            warn!(
                "Error when parsing section '{service}' field: {option}: \
                 invalid boolean value '{other}'"
            );
            None
        }
    }
}

fn parse_int(service: &str, option: &str, raw: &str) -> Option<i32> {
    match raw.trim().parse::<i32>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Error when parsing section '{service}' field: {option}: {err}");
            None
        }
    }
}

fn parse_uint(service: &str, option: &str, raw: &str) -> Option<u32> {
    match raw.trim().parse::<u32>() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Error when parsing section '{service}' field: {option}: {err}");
            None
        }
    }
}

/// Parses the space-separated dependency token list
/// `service[:STATE[,STATE...]]`. Unknown state names are dropped from that
/// dependency's required set with a warning; the edge itself survives.
fn parse_wait_for(service: &str, raw: &str) -> Vec<Dependency> {
    let mut deps: Vec<Dependency> = Vec::new();

    for token in raw.split_whitespace() {
        let (dep_service, states_part) = match token.split_once(':') {
            Some((dep, states)) => (dep, Some(states)),
            None => (token, None),
        };

        let required_states = match states_part {
            None => BTreeSet::from([ProcessState::Running]),
            Some(states) => states
                .split(',')
                .filter_map(|state| {
                    let upper = state.trim().to_ascii_uppercase();
                    match upper.parse::<ProcessState>() {
                        Ok(parsed) if parsed.is_valid_wait_target() => Some(parsed),
                        _ => {
                            warn!(
                                "Ignoring invalid state '{state}' in \
                                 '{WAIT_FOR_OPT}' for '{service}'"
                            );
                            None
                        }
                    }
                })
                .collect(),
        };

        // A dependency declared twice keeps the last declaration.
        if let Some(existing) = deps.iter_mut().find(|d| d.service == dep_service) {
            existing.required_states = required_states;
        } else {
            deps.push(Dependency {
                service: dep_service.to_string(),
                required_states,
            });
        }
    }

    deps
}

fn template_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"%\((program_name|group_name|process_num)\)(0?\d*)[sd]")
            .expect("valid template regex")
    })
}

/// Expands a supervisor `process_name` template. Supports the
/// `%(program_name)s`, `%(group_name)s` and `%(process_num)d` expansions,
/// the latter with an optional zero-padding width (e.g. `%(process_num)02d`).
fn expand_template(
    service: &str,
    template: &str,
    program: &str,
    group: &str,
    process_num: Option<u32>,
) -> String {
    template_regex()
        .replace_all(template, |caps: &Captures| {
            let width: usize = caps[2].parse().unwrap_or(0);
            match &caps[1] {
                "program_name" => program.to_string(),
                "group_name" => group.to_string(),
                "process_num" => match process_num {
                    Some(num) => format!("{num:0width$}"),
                    None => {
                        warn!(
                            "process_name for '{service}' uses %(process_num) \
                             but numprocs is not set"
                        );
                        caps[0].to_string()
                    }
                },
                _ => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Generates the per-instance process names for a service. With `numprocs`
/// set, one name per instance index starting at `numprocs_start`; otherwise a
/// single expansion without an instance index.
fn expand_process_names(
    service: &str,
    group: &str,
    template: &str,
    numprocs: Option<u32>,
    numprocs_start: u32,
) -> Vec<String> {
    match numprocs {
        Some(numprocs) if numprocs > 0 => (numprocs_start..numprocs_start + numprocs)
            .map(|num| expand_template(service, template, service, group, Some(num)))
            .collect(),
        _ => vec![expand_template(service, template, service, group, None)],
    }
}
