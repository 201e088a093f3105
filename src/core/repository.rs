use crate::env::ResolvedEnv;
use crate::error::{Error, Result};
use crate::package::PackageImpl;
use crate::ssh::{is_unreachable_output, CommandOutput, SshClient};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

/// Resolves a package name to a runnable implementation.
pub trait Repository: Send + Sync {
    fn resolve(&self, pkg_name: &str) -> Result<Arc<dyn PackageImpl>>;
}

/// The implementations that ship with the binary. Tests substitute their own
/// `Repository` with in-memory fakes.
#[derive(Default)]
pub struct BuiltinRepository;

impl BuiltinRepository {
    pub fn new() -> Self {
        BuiltinRepository
    }
}

impl Repository for BuiltinRepository {
    fn resolve(&self, pkg_name: &str) -> Result<Arc<dyn PackageImpl>> {
        match pkg_name {
            "service" => Ok(Arc::new(ServicePackage::new())),
            _ => Err(Error::package_not_found(pkg_name)),
        }
    }
}

/// A generic long-running service driven entirely by its config map:
///
/// - `start`   shell command that launches the service (required)
/// - `process` pattern for pkill/pgrep fallbacks (required unless all of
///             `stop`, `kill` and `status` are given)
/// - `stop`    graceful shutdown command (default `pkill -f <process>`)
/// - `kill`    forced termination (default `pkill -9 -f <process>`)
/// - `status`  liveness command, exit 0 means alive (default `pgrep -f`)
/// - `clean`   artifact removal command, run locally (optional)
/// - `upload_src` / `upload_dst`  local file shipped to every host before
///             the start command runs (optional, both or neither)
///
/// Every remote hook goes through `SshClient`, so localhost targets
/// short-circuit to a local shell.
pub struct ServicePackage {
    config: RwLock<BTreeMap<String, String>>,
}

impl ServicePackage {
    pub fn new() -> Self {
        ServicePackage {
            config: RwLock::new(BTreeMap::new()),
        }
    }

    fn config_value(&self, key: &str) -> Option<String> {
        self.config
            .read()
            .ok()
            .and_then(|c| c.get(key).cloned())
    }

    fn command_for(&self, key: &str, fallback: impl FnOnce(&str) -> String) -> Result<String> {
        if let Some(cmd) = self.config_value(key) {
            return Ok(cmd);
        }
        match self.config_value("process") {
            Some(process) => Ok(fallback(&process)),
            None => Err(Error::validation_invalid_argument(
                key,
                "No command configured and no 'process' pattern to fall back on",
                None,
                None,
            )),
        }
    }

    fn run_remote(host: &str, command: &str, env: Option<&ResolvedEnv>) -> Result<CommandOutput> {
        let client = SshClient::new(host);
        let output = match env {
            Some(env) => client.execute_with_env(command, &env.as_pairs()),
            None => client.execute(command),
        };
        if is_unreachable_output(&output) {
            return Err(Error::unreachable(host, Some(output.stderr)));
        }
        Ok(output)
    }

    fn run_remote_checked(host: &str, command: &str, env: Option<&ResolvedEnv>) -> Result<()> {
        let output = Self::run_remote(host, command, env)?;
        if !output.success {
            return Err(Error::internal_unexpected(format!(
                "Command failed on '{}' (exit {}): {}",
                host,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }
}

impl Default for ServicePackage {
    fn default() -> Self {
        Self::new()
    }
}

impl PackageImpl for ServicePackage {
    fn configure(&self, config: &BTreeMap<String, String>) -> Result<()> {
        if !config.contains_key("start") {
            return Err(Error::validation_invalid_argument(
                "start",
                "Service packages require a 'start' command",
                None,
                None,
            ));
        }
        let fully_explicit = ["stop", "kill", "status"]
            .iter()
            .all(|k| config.contains_key(*k));
        if !fully_explicit && !config.contains_key("process") {
            return Err(Error::validation_invalid_argument(
                "process",
                "Provide a 'process' pattern or explicit stop/kill/status commands",
                None,
                None,
            ));
        }
        let mut guard = self
            .config
            .write()
            .map_err(|_| Error::internal_unexpected("service config lock poisoned".to_string()))?;
        *guard = config.clone();
        Ok(())
    }

    fn start(&self, env: &ResolvedEnv, host: &str) -> Result<()> {
        let cmd = self.config_value("start").ok_or_else(|| {
            Error::invalid_state("service", "unconfigured", "start")
        })?;
        if let (Some(src), Some(dst)) =
            (self.config_value("upload_src"), self.config_value("upload_dst"))
        {
            let output = SshClient::new(host).upload_file(&src, &dst);
            if is_unreachable_output(&output) {
                return Err(Error::unreachable(host, Some(output.stderr)));
            }
            if !output.success {
                return Err(Error::internal_unexpected(format!(
                    "Upload of '{}' to '{}:{}' failed: {}",
                    src,
                    host,
                    dst,
                    output.stderr.trim()
                )));
            }
        }
        Self::run_remote_checked(host, &cmd, Some(env))
    }

    fn stop(&self, host: &str) -> Result<()> {
        let cmd = self.command_for("stop", |p| format!("pkill -f {}", crate::shell::quote_arg(p)))?;
        // pkill exits 1 when nothing matched; an already-dead service is a
        // successful stop.
        let output = Self::run_remote(host, &cmd, None)?;
        if !output.success && output.exit_code != 1 {
            return Err(Error::internal_unexpected(format!(
                "Stop failed on '{}' (exit {}): {}",
                host,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    fn kill(&self, host: &str) -> Result<()> {
        let cmd =
            self.command_for("kill", |p| format!("pkill -9 -f {}", crate::shell::quote_arg(p)))?;
        let output = Self::run_remote(host, &cmd, None)?;
        if !output.success && output.exit_code != 1 {
            return Err(Error::internal_unexpected(format!(
                "Kill failed on '{}' (exit {}): {}",
                host,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    fn status(&self, host: &str) -> Result<bool> {
        let cmd = self
            .command_for("status", |p| format!("pgrep -f {}", crate::shell::quote_arg(p)))?;
        let output = Self::run_remote(host, &cmd, None)?;
        Ok(output.success)
    }

    fn clean(&self) -> Result<()> {
        if let Some(cmd) = self.config_value("clean") {
            let output = crate::ssh::execute_local_command(&cmd);
            if !output.success {
                return Err(Error::internal_unexpected(format!(
                    "Clean failed (exit {}): {}",
                    output.exit_code,
                    output.stderr.trim()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn builtin_resolves_service_and_rejects_unknown() {
        let repo = BuiltinRepository::new();
        assert!(repo.resolve("service").is_ok());
        let err = repo.resolve("no-such-pkg").unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::PackageNotFound);
    }

    #[test]
    fn configure_requires_start_command() {
        let pkg = ServicePackage::new();
        let err = pkg.configure(&config(&[("process", "redis")])).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ValidationInvalidArgument);
    }

    #[test]
    fn configure_requires_process_or_full_explicit_commands() {
        let pkg = ServicePackage::new();
        assert!(pkg
            .configure(&config(&[("start", "redis-server")]))
            .is_err());
        assert!(pkg
            .configure(&config(&[("start", "redis-server"), ("process", "redis")]))
            .is_ok());
        assert!(pkg
            .configure(&config(&[
                ("start", "s"),
                ("stop", "t"),
                ("kill", "k"),
                ("status", "q"),
            ]))
            .is_ok());
    }

    #[test]
    fn fallback_commands_quote_the_process_pattern() {
        let pkg = ServicePackage::new();
        pkg.configure(&config(&[("start", "run me"), ("process", "my daemon")]))
            .unwrap();
        let cmd = pkg
            .command_for("stop", |p| format!("pkill -f {}", crate::shell::quote_arg(p)))
            .unwrap();
        assert_eq!(cmd, "pkill -f 'my daemon'");
    }

    #[test]
    fn start_uploads_configured_file_before_launch() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("service.conf");
        let dst = dir.path().join("deployed.conf");
        std::fs::write(&src, "port: 7000\n").unwrap();

        let pkg = ServicePackage::new();
        pkg.configure(&config(&[
            ("start", "true"),
            ("stop", "true"),
            ("kill", "true"),
            ("status", "true"),
            ("upload_src", src.to_str().unwrap()),
            ("upload_dst", dst.to_str().unwrap()),
        ]))
        .unwrap();

        pkg.start(&ResolvedEnv::default(), "localhost").unwrap();
        assert_eq!(std::fs::read_to_string(&dst).unwrap(), "port: 7000\n");
    }

    #[test]
    fn start_before_configure_is_invalid_state() {
        let pkg = ServicePackage::new();
        let err = pkg
            .start(&ResolvedEnv::default(), "localhost")
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::StateInvalid);
    }
}
