//! depstart is a dependency-aware startup sequencer for services managed by
//! a process supervisor. It runs as an event listener, consumes process
//! state-change notifications over stdin/stdout and starts each service once
//! the services it depends on have reached their required states, ordered by
//! priority within each dependency layer.

/// CLI interface.
pub mod cli;

/// Configuration manifest loading.
pub mod config;

/// Process controller over the supervisor RPC surface.
pub mod controller;

/// Crate error types.
pub mod error;

/// Event-listener protocol channel.
pub mod events;

/// Dependency graph and canonical start order.
pub mod graph;

/// Typed service option model.
pub mod options;

/// XML-RPC client for the supervisor control API.
pub mod rpc;

/// Event-driven startup scheduler.
pub mod scheduler;

/// Service entity and process state model.
pub mod service;

#[cfg(test)]
pub(crate) mod test_utils;
