//! Error handling for depstart.
use thiserror::Error;

use crate::{events::EventChannelError, rpc::RpcError};

/// Defines all possible errors that can occur in the startup sequencer.
#[derive(Debug, Error)]
pub enum DependentStartupError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// No configuration manifest found in the default search locations.
    #[error("No config file found (searched: {searched})")]
    ConfigNotFound {
        /// The probed locations, comma separated.
        searched: String,
    },

    /// Error when a service combines `dependent_startup` with `autostart`.
    #[error(
        "Service '{service}' has dependent_startup set to true, which requires \
         autostart to be set explicitly to false. autostart is currently {autostart}"
    )]
    ConfigConflict {
        /// The misconfigured service.
        service: String,
        /// The offending autostart value as declared.
        autostart: String,
    },

    /// Error when a dependency reference is undefined in the configuration.
    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency name.
        dependency: String,
    },

    /// Error when the dependency graph contains a cycle.
    #[error("Circular dependencies detected: {cycle}")]
    DependencyCycle {
        /// Deterministic description of every cycle member and its
        /// unresolved dependency set.
        cycle: String,
    },

    /// Error talking to the supervisor RPC endpoint during setup.
    #[error("Supervisor RPC failed: {0}")]
    Rpc(#[from] RpcError),

    /// Error on the event notification channel.
    #[error("Event channel failed: {0}")]
    Event(#[from] EventChannelError),
}
