//! Dependency graph builder and canonical start order.
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::{
    cli::ErrorAction,
    config::Config,
    error::DependentStartupError,
    options::ServiceOptions,
    service::{DEFAULT_PRIORITY_SORT, ProcessState, Service},
};

/// All managed and unmanaged services, indexed by name and held in canonical
/// start order once construction succeeds.
///
/// Invariants after [`ServiceTable::build`] returns `Ok`: the dependency
/// relation is acyclic, and every surviving dependency name resolves to a
/// table entry.
#[derive(Debug)]
pub struct ServiceTable {
    order: Vec<String>,
    services: BTreeMap<String, Service>,
}

impl ServiceTable {
    /// Builds the table from parsed configuration: validates every service,
    /// resolves or repairs unknown dependencies per `policy`, rejects cycles
    /// and computes the canonical start order with cached priorities.
    pub fn build(
        config: &Config,
        policy: ErrorAction,
    ) -> Result<Self, DependentStartupError> {
        let membership = config.group_membership();
        let mut services = BTreeMap::new();

        for name in config.services.keys() {
            let group = membership.get(name).cloned().unwrap_or_else(|| name.clone());
            let bag = config.option_bag(name);
            let mut options = ServiceOptions::parse(name, &group, &bag);
            check_autostart_conflict(name, &mut options, policy)?;
            services.insert(name.clone(), Service::new(name.clone(), group, options));
        }

        let mut table = Self {
            order: Vec::new(),
            services,
        };
        table.verify_dependencies(policy)?;
        table.order = table.sorted_service_order()?;
        Ok(table)
    }

    /// Validation pass: every declared dependency must name a known service.
    /// Under the `exit` policy an unknown reference is fatal; otherwise the
    /// offending edge is removed and treated as always-satisfied.
    fn verify_dependencies(
        &mut self,
        policy: ErrorAction,
    ) -> Result<(), DependentStartupError> {
        let known: BTreeSet<String> = self.services.keys().cloned().collect();

        for (name, service) in &mut self.services {
            let unknown: Vec<String> = service
                .options
                .wait_for
                .iter()
                .map(|dep| dep.service.clone())
                .filter(|dep| !known.contains(dep))
                .collect();

            for dep in unknown {
                warn!("Service '{name}' depends on unknown service '{dep}'");
                if policy.is_fatal() {
                    return Err(DependentStartupError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep,
                    });
                }
                warn!("Removing dependency '{dep}' from service {name}");
                service.options.wait_for.retain(|d| d.service != dep);
            }
        }
        Ok(())
    }

    /// Computes the canonical start order by topological layering. Each layer
    /// is sorted by `(priority, name)` ascending with unset priority sorting
    /// last; priorities are resolved and cached while layering, so inherited
    /// lookups always see fully resolved dependencies.
    fn sorted_service_order(&mut self) -> Result<Vec<String>, DependentStartupError> {
        let mut remaining: BTreeMap<String, BTreeSet<String>> = self
            .services
            .iter()
            .map(|(name, service)| {
                let deps = service
                    .options
                    .wait_for
                    .iter()
                    .map(|dep| dep.service.clone())
                    .collect();
                (name.clone(), deps)
            })
            .collect();

        let mut order = Vec::with_capacity(remaining.len());
        while !remaining.is_empty() {
            let mut layer: Vec<String> = remaining
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| name.clone())
                .collect();

            if layer.is_empty() {
                return Err(DependentStartupError::DependencyCycle {
                    cycle: describe_cycles(&remaining),
                });
            }

            for name in &layer {
                let priority = self.resolve_priority(name);
                if let Some(service) = self.services.get_mut(name) {
                    service.set_priority_sort(priority);
                }
            }

            layer.sort_by(|a, b| {
                let pa = self.services[a].priority_sort();
                let pb = self.services[b].priority_sort();
                pa.cmp(&pb).then_with(|| a.cmp(b))
            });
            debug!("Resolved startup layer: {layer:?}");

            for name in &layer {
                remaining.remove(name);
            }
            for deps in remaining.values_mut() {
                for name in &layer {
                    deps.remove(name);
                }
            }
            order.extend(layer);
        }

        Ok(order)
    }

    /// Resolves the sortable priority for one service. An explicit priority
    /// wins; otherwise inheritance takes the minimum over the dependencies'
    /// already-cached values; otherwise the unset sentinel.
    fn resolve_priority(&self, name: &str) -> i32 {
        let service = &self.services[name];
        if let Some(priority) = service.options.priority {
            return priority;
        }

        let mut priority = DEFAULT_PRIORITY_SORT;
        if service.options.inherit_priority {
            for dep in &service.options.wait_for {
                if let Some(dep_service) = self.services.get(&dep.service) {
                    priority = priority.min(dep_service.priority_sort());
                }
            }
        }
        priority
    }

    /// Services in canonical start order.
    pub fn services(&self) -> impl Iterator<Item = &Service> {
        self.order.iter().filter_map(|name| self.services.get(name))
    }

    /// Service names in canonical start order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn get(&self, name: &str) -> Option<&Service> {
        self.services.get(name)
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Reassigns the process group of `name`, as reported by the process
    /// manager's config info.
    pub fn set_group(&mut self, name: &str, group: &str) {
        if let Some(service) = self.services.get_mut(name) {
            if service.group != group {
                debug!("Updating process group of '{name}' to '{group}'");
                service.group = group.to_string();
            }
        }
    }

    /// Appends `state` to the reached-state history of every service owning
    /// the process `procname`.
    pub fn record_state_reached(&mut self, procname: &str, state: ProcessState) {
        for service in self.services.values_mut() {
            if service.has_process(procname) {
                service.record_state_reached(procname, state);
            }
        }
    }

    /// Whether every dependency of `service` is satisfied: for each edge, the
    /// dependency must have reached at least one of the edge's required
    /// states.
    pub fn wait_for_satisfied(&self, service: &Service) -> bool {
        for dep in &service.options.wait_for {
            let Some(dep_service) = self.services.get(&dep.service) else {
                continue;
            };
            let satisfied = dep
                .required_states
                .iter()
                .any(|state| dep_service.has_reached_states(&[*state]));
            if !satisfied {
                debug!(
                    "Service '{}' depends on '{}' to reach one of {:?}",
                    service.name, dep.service, dep.required_states
                );
                return false;
            }
        }
        true
    }
}

/// Enforces the invariant that `dependent_startup` requires autostart to be
/// explicitly false. Under `exit` the conflict is fatal; otherwise handling
/// for the service is disabled and the run continues.
fn check_autostart_conflict(
    name: &str,
    options: &mut ServiceOptions,
    policy: ErrorAction,
) -> Result<(), DependentStartupError> {
    if !options.dependent_startup || !options.is_autostart() {
        return Ok(());
    }

    let declared = options
        .autostart
        .map(|v| v.to_string())
        .unwrap_or_else(|| "not set".to_string());
    warn!(
        "Service '{name}' has dependent_startup set to true, which requires \
         autostart to be set explicitly to false. autostart is currently {declared}"
    );

    if policy.is_fatal() {
        return Err(DependentStartupError::ConfigConflict {
            service: name.to_string(),
            autostart: declared,
        });
    }

    warn!("Disable handling service '{name}'");
    options.dependent_startup = false;
    Ok(())
}

/// Renders a deterministic description of the cycles in the unresolved
/// subgraph. Only services that can reach themselves are cycle members;
/// dependents stranded downstream of a cycle are excluded. For each member
/// the unresolved dependencies that keep the cycle closed are listed.
fn describe_cycles(remaining: &BTreeMap<String, BTreeSet<String>>) -> String {
    let members: BTreeSet<&String> = remaining
        .keys()
        .filter(|name| reaches(remaining, name, name, &mut BTreeSet::new()))
        .collect();

    let mut parts = Vec::new();
    for name in &members {
        let closing: Vec<&str> = remaining[*name]
            .iter()
            .filter(|dep| members.contains(dep))
            .map(String::as_str)
            .collect();
        parts.push(format!("{name} (unresolved: {})", closing.join(", ")));
    }
    parts.join("; ")
}

/// Whether `target` is reachable from `from` along unresolved dependency
/// edges. Termination is guaranteed by the visited set.
fn reaches<'a>(
    graph: &'a BTreeMap<String, BTreeSet<String>>,
    from: &'a str,
    target: &str,
    visited: &mut BTreeSet<&'a str>,
) -> bool {
    let Some(deps) = graph.get(from) else {
        return false;
    };
    for dep in deps {
        if dep == target {
            return true;
        }
        if visited.insert(dep.as_str()) && reaches(graph, dep, target, visited) {
            return true;
        }
    }
    false
}
