//! Configuration source for depstart.
//!
//! Supplies, per service, the flat key/value option bag consumed by the
//! option model, plus process-group membership. The manifest is YAML:
//!
//! ```yaml
//! services:
//!   db:
//!     autostart: false
//!     dependent_startup: true
//! groups:
//!   backend:
//!     programs: [db, cache]
//! ```
use std::sync::OnceLock;
use std::{collections::BTreeMap, env, fs, path::PathBuf};

use regex::{Captures, Regex};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{error::DependentStartupError, options::OptionBag};

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Map of service names to their raw option bags.
    pub services: BTreeMap<String, RawOptions>,
    /// Declared process groups.
    #[serde(default)]
    pub groups: BTreeMap<String, GroupConfig>,
}

/// Raw options for one service section, prior to typing.
pub type RawOptions = BTreeMap<String, serde_yaml::Value>;

/// A declared process group.
#[derive(Debug, Deserialize, Clone)]
pub struct GroupConfig {
    /// Names of the member services.
    pub programs: Vec<String>,
}

impl Config {
    /// Maps each grouped service name to its group name.
    pub fn group_membership(&self) -> BTreeMap<String, String> {
        let mut membership = BTreeMap::new();
        for (group, config) in &self.groups {
            for program in &config.programs {
                membership.insert(program.clone(), group.clone());
            }
        }
        membership
    }

    /// Flattens the raw options of `service` into a string option bag.
    /// Non-scalar values are dropped with a warning.
    pub fn option_bag(&self, service: &str) -> OptionBag {
        let mut bag = OptionBag::new();
        let Some(raw) = self.services.get(service) else {
            return bag;
        };

        for (key, value) in raw {
            match scalar_to_string(value) {
                Some(value) => {
                    bag.insert(key.clone(), value);
                }
                None => {
                    warn!(
                        "Ignoring non-scalar value for option '{key}' \
                         of service '{service}'"
                    );
                }
            }
        }
        bag
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn env_var_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("valid env var regex")
    })
}

/// Expands environment variables within the raw manifest text. Unset
/// variables leave the token intact and log a warning.
fn expand_env_vars(input: &str) -> String {
    env_var_regex()
        .replace_all(input, |caps: &Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    warn!("Missing environment variable: {var_name}");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

/// Manifest locations probed, in order, when no path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 2] = ["depstart.yaml", "supervisord.yaml"];

fn default_config_path() -> Option<PathBuf> {
    DEFAULT_CONFIG_PATHS
        .into_iter()
        .map(PathBuf::from)
        .find(|path| path.exists())
}

/// Loads and parses the configuration file, expanding environment variables.
/// Without an explicit path the default locations are searched; finding none
/// is its own error class, distinct from a path that fails to read.
pub fn load_config(config_path: Option<&str>) -> Result<Config, DependentStartupError> {
    let config_path = match config_path {
        Some(path) => PathBuf::from(path),
        None => default_config_path().ok_or_else(|| {
            DependentStartupError::ConfigNotFound {
                searched: DEFAULT_CONFIG_PATHS.join(", "),
            }
        })?,
    };

    let content = fs::read_to_string(&config_path).map_err(|e| {
        DependentStartupError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded = expand_env_vars(&content);
    let config: Config = serde_yaml::from_str(&expanded)?;
    debug!(
        "Loaded {} service sections from {}",
        config.services.len(),
        config_path.display()
    );
    Ok(config)
}
