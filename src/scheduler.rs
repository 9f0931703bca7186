//! Event-driven startup scheduler.
//!
//! The scheduler holds the service table and process controller, consumes
//! state-change events from the channel and decides, on each event, which
//! managed services are now eligible to start.
use std::collections::BTreeMap;
use std::io::{BufRead, Write};

use tracing::{debug, info, warn};

use crate::{
    controller::ProcessController,
    error::DependentStartupError,
    events::{EventChannel, EventChannelError, EventKind},
    graph::ServiceTable,
    rpc::SupervisorRpc,
};

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Before the first snapshot refresh.
    Initializing,
    /// Consuming events and issuing starts.
    Listening,
    /// All managed services reached a terminal startup outcome. Events are
    /// still acknowledged but otherwise ignored.
    Done,
}

pub struct Scheduler<R> {
    table: ServiceTable,
    controller: ProcessController<R>,
    phase: Phase,
    /// A managed, startable service with satisfied dependencies found during
    /// initialization. Its start is deferred to the first received event so
    /// the supervisor has finished spawning the listener itself.
    pending_bootstrap: Option<String>,
}

impl<R: SupervisorRpc> Scheduler<R> {
    pub fn new(table: ServiceTable, controller: ProcessController<R>) -> Self {
        Self {
            table,
            controller,
            phase: Phase::Initializing,
            pending_bootstrap: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Initializes the scheduler: refreshes the process snapshot and group
    /// map, then selects the bootstrap candidate. Without a candidate there
    /// is nothing to sequence and the scheduler goes straight to done.
    /// Snapshot failures here are fatal since nothing sensible can be
    /// scheduled without one.
    pub fn run(&mut self) -> Result<(), DependentStartupError> {
        self.controller.refresh_all()?;
        self.controller.refresh_group_map()?;

        let group_updates: Vec<(String, String)> = self
            .controller
            .group_map()
            .iter()
            .flat_map(|(group, members)| {
                members
                    .iter()
                    .map(|member| (member.clone(), group.clone()))
            })
            .collect();
        for (name, group) in group_updates {
            self.table.set_group(&name, &group);
        }

        self.log_services();

        self.pending_bootstrap = self
            .table
            .names()
            .map(str::to_string)
            .find(|name| {
                let Some(service) = self.table.get(name) else {
                    return false;
                };
                service.dependent_startup()
                    && !service.options.is_autostart()
                    && self.controller.is_startable(service)
                    && self.table.wait_for_satisfied(service)
            });

        match &self.pending_bootstrap {
            Some(name) => {
                debug!("Deferring start of '{name}' until the first event");
                self.phase = Phase::Listening;
            }
            None => {
                info!("Found no services to start");
                self.phase = Phase::Done;
            }
        }
        Ok(())
    }

    /// Main loop: handshakes, consumes events and acknowledges each one,
    /// including the event that completes the startup sequence. Returns when
    /// the supervisor closes the channel or the sequence is done.
    pub fn listen<In: BufRead, Out: Write>(
        &mut self,
        channel: &mut EventChannel<In, Out>,
    ) -> Result<(), DependentStartupError> {
        while self.phase == Phase::Listening {
            channel.ready()?;
            let event = match channel.next_event() {
                Ok(event) => event,
                Err(EventChannelError::Closed) => {
                    info!("Event channel closed, shutting down");
                    return Ok(());
                }
                Err(err) => return Err(err.into()),
            };
            self.handle_event(&event.name, &event.kind);
            channel.ack()?;
        }
        Ok(())
    }

    /// Processes one decoded event.
    pub fn handle_event(&mut self, name: &str, kind: &EventKind) {
        if self.phase == Phase::Done {
            debug!("Startup already complete, ignoring event {name}");
            return;
        }

        let (process, from_state, state) = match kind {
            EventKind::ProcessState {
                process,
                from_state,
                state,
            } => (process, from_state, state),
            EventKind::Other(event) => {
                debug!("Ignoring event {event}");
                return;
            }
        };

        let from = from_state
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        info!("New event: Service {process} went from {from} to {state}");

        self.table.record_state_reached(process, *state);
        if let Err(err) = self.controller.refresh_all() {
            warn!("Failed to refresh process states: {err}");
        }

        if let Some(name) = self.pending_bootstrap.take() {
            info!("Starting immediately: {name}");
            if let Some(service) = self.table.get(&name) {
                self.controller.start(service, false);
                if let Err(err) = self.controller.refresh_service(service) {
                    warn!("Failed to refresh service '{name}': {err}");
                }
            }
            info!("Starting ordered services");
        }

        self.start_pass();
    }

    /// One scheduling pass: starts every managed service that is eligible
    /// now, tier by tier in priority order. Transitions to done once every
    /// managed service has reached a terminal startup outcome.
    fn start_pass(&mut self) {
        self.log_services();

        let pending: Vec<String> = self
            .table
            .services()
            .filter(|service| {
                service.dependent_startup() && !self.controller.is_done(service)
            })
            .map(|service| service.name.clone())
            .collect();

        if pending.is_empty() {
            info!(
                "No more processes to start for initial startup, \
                 ignoring all future events."
            );
            self.phase = Phase::Done;
            return;
        }
        info!(
            "Services not yet running ({}): {}",
            pending.len(),
            pending.join(", ")
        );

        // Group eligible services into priority tiers; services without an
        // effective priority form the last tier.
        let mut tiers: BTreeMap<(u8, i32), Vec<String>> = BTreeMap::new();
        for name in pending {
            let Some(service) = self.table.get(&name) else {
                continue;
            };
            if !self.controller.is_startable(service)
                || !self.table.wait_for_satisfied(service)
            {
                continue;
            }
            let key = match service.priority_effective() {
                Some(priority) => (0, priority),
                None => (1, 0),
            };
            tiers.entry(key).or_default().push(name);
        }

        for (tier, names) in tiers {
            debug!("Starting tier {tier:?}: {names:?}");
            for name in names {
                if let Some(service) = self.table.get(&name) {
                    self.controller.start(service, false);
                }
            }
        }
    }

    /// Logs a status line per service, aligned on the service name.
    fn log_services(&self) {
        let width = self
            .table
            .names()
            .map(str::len)
            .max()
            .unwrap_or(0);

        for service in self.table.services() {
            let mut line = format!(
                "Service: {:width$} (State: {:<8} dependent_startup: {}",
                service.name,
                self.controller.state_summary(service),
                service.dependent_startup(),
            );
            if let Some(summary) = service.options.wait_for_summary() {
                line.push_str(&format!(" wait_for: '{summary}'"));
            }
            if let Some(priority) = service.priority_effective() {
                let marker = if service.options.priority.is_none() {
                    " (inherited)"
                } else {
                    ""
                };
                line.push_str(&format!(" priority: {priority}{marker}"));
            }
            line.push(')');
            info!("{line}");
        }
    }
}
