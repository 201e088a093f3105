use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;

/// Base convoy config directory. `CONVOY_HOME` overrides the default
/// `~/.config/convoy` (tests point it at a tempdir).
pub fn convoy() -> Result<PathBuf> {
    if let Ok(root) = env::var("CONVOY_HOME") {
        if !root.is_empty() {
            return Ok(PathBuf::from(root));
        }
    }

    let home = env::var("HOME").map_err(|_| {
        Error::internal_unexpected("HOME environment variable not set".to_string())
    })?;
    Ok(PathBuf::from(home).join(".config").join("convoy"))
}

/// Pipelines directory
pub fn pipelines() -> Result<PathBuf> {
    Ok(convoy()?.join("pipelines"))
}

/// Named environments directory
pub fn envs() -> Result<PathBuf> {
    Ok(convoy()?.join("envs"))
}

/// Module declaration files directory
pub fn modules() -> Result<PathBuf> {
    Ok(convoy()?.join("modules"))
}

/// Hostfiles directory
pub fn hostfiles() -> Result<PathBuf> {
    Ok(convoy()?.join("hostfiles"))
}

/// Named hostfile path
pub fn hostfile(name: &str) -> Result<PathBuf> {
    Ok(hostfiles()?.join(name))
}

/// Canonical persisted resource graph location for the active installation.
pub fn resource_graph() -> Result<PathBuf> {
    Ok(convoy()?.join("resource_graph.yaml"))
}

/// Pipeline record path
pub fn pipeline(name: &str) -> Result<PathBuf> {
    Ok(pipelines()?.join(format!("{}.yaml", name)))
}

/// Named environment record path
pub fn env_record(name: &str) -> Result<PathBuf> {
    Ok(envs()?.join(format!("{}.yaml", name)))
}

/// Module declaration file path
pub fn module(name: &str) -> Result<PathBuf> {
    Ok(modules()?.join(format!("{}.yaml", name)))
}
