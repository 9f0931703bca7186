//! Process controller adapter over the supervisor RPC surface.
//!
//! Owns the mutable snapshot of process states queried from supervisor. The
//! snapshot is state of this adapter, refreshed explicitly by the scheduler;
//! it is never shared or global.
use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::{
    rpc::{RpcError, SupervisorRpc},
    service::{ProcessState, Service},
};

/// Thin wrapper around start/query calls to the process manager. Owns no
/// scheduling policy.
pub struct ProcessController<R> {
    rpc: R,
    /// Last observed state per process name.
    proc_info: BTreeMap<String, ProcessState>,
    /// Declared group membership, from `getAllConfigInfo`.
    proc_by_group: BTreeMap<String, Vec<String>>,
}

impl<R: SupervisorRpc> ProcessController<R> {
    pub fn new(rpc: R) -> Self {
        Self {
            rpc,
            proc_info: BTreeMap::new(),
            proc_by_group: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn rpc(&self) -> &R {
        &self.rpc
    }

    /// Queries the supervisor API version, confirming the connection works.
    pub fn api_version(&self) -> Result<String, RpcError> {
        self.rpc.api_version()
    }

    /// Refreshes the snapshot for every known process.
    pub fn refresh_all(&mut self) -> Result<(), RpcError> {
        for info in self.rpc.get_all_process_info()? {
            self.proc_info.insert(info.name.clone(), parse_state(&info.statename));
        }
        Ok(())
    }

    /// Refreshes the snapshot for the constituent processes of one service.
    pub fn refresh_service(&mut self, service: &Service) -> Result<(), RpcError> {
        let targets: Vec<String> = service
            .proc_names()
            .map(|procname| format!("{}:{procname}", service.group))
            .collect();
        for target in targets {
            let info = self.rpc.get_process_info(&target)?;
            self.proc_info.insert(info.name.clone(), parse_state(&info.statename));
        }
        Ok(())
    }

    /// Refreshes the declared group membership map.
    pub fn refresh_group_map(&mut self) -> Result<(), RpcError> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for info in self.rpc.get_all_config_info()? {
            groups.entry(info.group).or_default().push(info.name);
        }
        self.proc_by_group = groups;
        Ok(())
    }

    /// Group membership as last refreshed: group name to member processes.
    pub fn group_map(&self) -> &BTreeMap<String, Vec<String>> {
        &self.proc_by_group
    }

    /// The snapshot states of a service's constituent processes. Processes
    /// the snapshot has never seen report as UNKNOWN.
    pub fn service_states(&self, service: &Service) -> Vec<(String, ProcessState)> {
        service
            .proc_names()
            .map(|procname| {
                let state = self
                    .proc_info
                    .get(procname)
                    .copied()
                    .unwrap_or(ProcessState::Unknown);
                (procname.to_string(), state)
            })
            .collect()
    }

    /// A compact state description for operator logs.
    pub fn state_summary(&self, service: &Service) -> String {
        let states = self.service_states(service);
        if states.len() > 1 {
            let parts: Vec<String> = states
                .iter()
                .map(|(name, state)| format!("{name}: {state:<8}"))
                .collect();
            parts.join(", ").trim().to_string()
        } else {
            states
                .first()
                .map(|(_, state)| state.to_string())
                .unwrap_or_else(|| ProcessState::Unknown.to_string())
        }
    }

    /// True iff no constituent process is currently running (RUNNING,
    /// STARTING, BACKOFF) and none has failed permanently (FATAL).
    pub fn is_startable(&self, service: &Service) -> bool {
        !self
            .service_states(service)
            .iter()
            .any(|(_, state)| state.is_running() || *state == ProcessState::Fatal)
    }

    /// True iff the service has reached a terminal outcome for the startup
    /// phase: every instance RUNNING, or every instance FATAL.
    pub fn is_done(&self, service: &Service) -> bool {
        service.has_reached_states(&[ProcessState::Running, ProcessState::Fatal])
    }

    /// Issues a start for the service, or its whole process group when it
    /// expands to multiple instances. Returns false without raising when the
    /// service is not startable or the supervisor rejects the call; the
    /// caller re-evaluates on a later event.
    pub fn start(&mut self, service: &Service, wait: bool) -> bool {
        let state_str = self.state_summary(service);
        info!("Starting service: {} (State: {state_str})", service.name);

        if !self.is_startable(service) {
            info!(
                "Service: {} has state: {state_str}. Will not attempt to start service",
                service.name
            );
            return false;
        }

        let target = service.group_and_procname();
        let result = if service.options.is_process_group() {
            self.rpc.start_process_group(&target, wait)
        } else {
            self.rpc.start_process(&target, wait)
        };

        match result {
            Ok(accepted) => {
                debug!("Start request for '{target}' accepted: {accepted}");
                // Record the submission so a repeat pass within the same
                // event cannot double-start before the next refresh.
                for procname in service.proc_names() {
                    self.proc_info
                        .insert(procname.to_string(), ProcessState::Starting);
                }
                accepted
            }
            Err(err) => {
                warn!(
                    "Error when starting service '{}' (group: {}): {err}",
                    service.name, service.group
                );
                false
            }
        }
    }
}

fn parse_state(statename: &str) -> ProcessState {
    statename.parse().unwrap_or_else(|_| {
        warn!("Unrecognised process state '{statename}' reported by supervisor");
        ProcessState::Unknown
    })
}
