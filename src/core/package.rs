use crate::env::{Environment, ResolvedEnv};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of one package inside a pipeline.
///
/// `Removed` is terminal and only ever observed transiently during destroy;
/// records on disk never carry it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageState {
    Unconfigured,
    Configured,
    Running,
    Removed,
}

impl PackageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageState::Unconfigured => "unconfigured",
            PackageState::Configured => "configured",
            PackageState::Running => "running",
            PackageState::Removed => "removed",
        }
    }
}

/// One package entry in a pipeline record. The config map is opaque to the
/// engine; only the implementation interprets it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub state: PackageState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
}

impl Package {
    pub fn new(name: impl Into<String>, config: BTreeMap<String, String>) -> Self {
        Package {
            name: name.into(),
            config,
            state: PackageState::Unconfigured,
            environment: None,
        }
    }
}

/// Behavior contract a package implementation fulfils. The engine owns
/// ordering and fan-out; hooks taking a `host` are invoked once per target
/// host, possibly concurrently across hosts, never concurrently across
/// packages.
pub trait PackageImpl: Send + Sync {
    /// Prepare the package from its config map. Called once per package,
    /// not per host.
    fn configure(&self, config: &BTreeMap<String, String>) -> Result<()>;

    /// Launch on one host under the resolved environment.
    fn start(&self, env: &ResolvedEnv, host: &str) -> Result<()>;

    /// Graceful shutdown on one host.
    fn stop(&self, host: &str) -> Result<()>;

    /// Forceful termination on one host.
    fn kill(&self, host: &str) -> Result<()>;

    /// Liveness probe on one host. Never mutates anything.
    fn status(&self, host: &str) -> Result<bool>;

    /// Remove configured artifacts. Called once per package, only from
    /// Configured.
    fn clean(&self) -> Result<()>;

    /// Whether `update` may reconfigure in place while Running.
    fn supports_hot_reconfigure(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for dyn PackageImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn PackageImpl")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serializes_snake_case() {
        let yaml = serde_yml::to_string(&PackageState::Unconfigured).unwrap();
        assert_eq!(yaml.trim(), "unconfigured");
        let back: PackageState = serde_yml::from_str("running").unwrap();
        assert_eq!(back, PackageState::Running);
    }

    #[test]
    fn new_package_starts_unconfigured_without_env() {
        let pkg = Package::new("cache", BTreeMap::new());
        assert_eq!(pkg.state, PackageState::Unconfigured);
        assert!(pkg.environment.is_none());
    }
}
