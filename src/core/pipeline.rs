use crate::env::{self, Environment, ResolvedEnv};
use crate::error::{Error, Result};
use crate::hostfile::Hostfile;
use crate::package::{Package, PackageImpl, PackageState};
use crate::paths;
use crate::repository::Repository;
use crate::resource_graph::{DiscoveryProbe, ResourceGraph};
use crate::store::{self, ConfigEntity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

/// Upper bound on concurrent per-host hook invocations for one package.
pub const MAX_PARALLEL_HOSTS: usize = 8;

/// An ordered sequence of packages deployed and torn down as a unit.
///
/// Package order is the dependency contract: startup walks it forward,
/// shutdown walks it in reverse, and the engine never reorders it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub name: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub packages: Vec<Package>,
    /// Pipeline-scoped environment, created fresh with the pipeline.
    #[serde(default)]
    pub environment: Environment,
    /// Named global environment layered below the pipeline scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_ref: Option<String>,
    /// Named hostfile that places this pipeline on the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostfile_ref: Option<String>,
}

impl ConfigEntity for Pipeline {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn record_path(name: &str) -> Result<PathBuf> {
        paths::pipeline(name)
    }
    fn record_dir() -> Result<PathBuf> {
        paths::pipelines()
    }
    fn not_found_error(name: String) -> Error {
        Error::pipeline_not_found(name)
    }
    fn entity_type() -> &'static str {
        "pipeline"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Success,
    PartialFailure,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResult {
    pub host: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageReport {
    pub name: String,
    pub ordinal: usize,
    pub action: String,
    pub state: PackageState,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<HostResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-package, per-host result table for one lifecycle command.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub run_id: String,
    pub pipeline: String,
    pub action: String,
    pub packages: Vec<PackageReport>,
    pub outcome: PipelineOutcome,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub host: String,
    /// None when the liveness probe itself failed.
    pub live: Option<bool>,
    pub drift: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageStatus {
    pub name: String,
    pub ordinal: usize,
    pub state: PackageState,
    pub hosts: Vec<HostStatus>,
    pub drift: bool,
}

/// Pure drift query result. Producing one never mutates recorded state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub pipeline: String,
    pub packages: Vec<PackageStatus>,
    pub drift: bool,
}

/// Cooperative cancellation flag shared with a whole-pipeline operation.
/// In-flight host ops finish naturally; not-yet-started packages are skipped.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Everything a lifecycle command needs besides the pipeline record itself.
/// Implementations resolved from the repository are held for the lifetime of
/// the context so one command works against one instance per package.
pub struct ExecContext<'a> {
    pub repository: &'a dyn Repository,
    pub hosts: Vec<String>,
    pub cancel: CancelToken,
    resolved: Mutex<HashMap<usize, Arc<dyn PackageImpl>>>,
}

impl<'a> ExecContext<'a> {
    pub fn new(repository: &'a dyn Repository, hosts: Vec<String>) -> Self {
        ExecContext {
            repository,
            hosts,
            cancel: CancelToken::new(),
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, ordinal: usize) -> Option<Arc<dyn PackageImpl>> {
        self.resolved.lock().ok()?.get(&ordinal).cloned()
    }

    fn cache(&self, ordinal: usize, implementation: Arc<dyn PackageImpl>) {
        if let Ok(mut guard) = self.resolved.lock() {
            guard.insert(ordinal, implementation);
        }
    }
}

/// Shared topology snapshot. Lifecycle commands hold the read guard for the
/// whole command, graph rebuild takes the write guard, so a rebuild can never
/// race an in-flight lifecycle command.
#[derive(Default)]
pub struct OrchestratorStore {
    graph: RwLock<Option<ResourceGraph>>,
}

impl OrchestratorStore {
    pub fn new() -> Self {
        OrchestratorStore::default()
    }

    /// Populate from the persisted graph if one exists.
    pub fn open() -> Result<Self> {
        let store = OrchestratorStore::new();
        let path = ResourceGraph::path()?;
        if path.exists() {
            let graph = ResourceGraph::load(&path)?;
            if let Ok(mut guard) = store.graph.write() {
                *guard = Some(graph);
            }
        }
        Ok(store)
    }

    /// Probe the cluster, persist the result and replace the snapshot.
    pub fn rebuild_graph(
        &self,
        targets: &[String],
        probe: Arc<dyn DiscoveryProbe>,
    ) -> Result<ResourceGraph> {
        let mut guard = self
            .graph
            .write()
            .map_err(|_| Error::internal_unexpected("graph lock poisoned".to_string()))?;
        let graph = ResourceGraph::build(targets, probe)?;
        graph.save(&ResourceGraph::path()?)?;
        *guard = Some(graph.clone());
        Ok(graph)
    }

    /// Read guard over the current snapshot. Hold it across a lifecycle
    /// command to serialize against rebuilds.
    pub fn graph(&self) -> Result<RwLockReadGuard<'_, Option<ResourceGraph>>> {
        self.graph
            .read()
            .map_err(|_| Error::internal_unexpected("graph lock poisoned".to_string()))
    }
}

impl Pipeline {
    /// Create and persist an empty pipeline with a fresh environment scope.
    pub fn create(name: &str) -> Result<Pipeline> {
        if store::exists::<Pipeline>(name) {
            return Err(Error::pipeline_already_exists(name));
        }
        let pipeline = Pipeline {
            name: name.to_string(),
            created_at: Utc::now(),
            packages: Vec::new(),
            environment: Environment::new(format!("{}-env", name)),
            environment_ref: None,
            hostfile_ref: None,
        };
        pipeline.save()?;
        log_status!("ppl", "Created pipeline '{}'", name);
        Ok(pipeline)
    }

    pub fn load(name: &str) -> Result<Pipeline> {
        store::load(name)
    }

    pub fn save(&self) -> Result<()> {
        store::save(self)
    }

    pub fn list() -> Result<Vec<String>> {
        store::list_names::<Pipeline>()
    }

    /// Resolve the target hosts: the named hostfile if one is set, else every
    /// node of the resource graph, else localhost.
    pub fn placement(&self, graph: Option<&ResourceGraph>) -> Result<Vec<String>> {
        if let Some(ref name) = self.hostfile_ref {
            let hostfile = Hostfile::load(&paths::hostfile(name)?)?;
            return Ok(hostfile.hosts);
        }
        if let Some(graph) = graph {
            if !graph.is_empty() {
                return Ok(graph.hostnames());
            }
        }
        Ok(Hostfile::localhost().hosts)
    }

    /// Append a package at the tail of the sequence. The repository lookup
    /// validates the name before anything is persisted.
    pub fn append(
        &mut self,
        repository: &dyn Repository,
        pkg_name: &str,
        config: BTreeMap<String, String>,
    ) -> Result<()> {
        repository.resolve(pkg_name)?;
        self.packages.push(Package::new(pkg_name, config));
        self.save()?;
        log_status!("ppl", "Appended '{}' to '{}'", pkg_name, self.name);
        Ok(())
    }

    /// Remove the first package matching the selector (ordinal or name).
    /// Relative order of the remaining packages is untouched.
    pub fn rm(&mut self, selector: &str) -> Result<Package> {
        let index = match_selector(&self.packages, selector)
            .ok_or_else(|| Error::package_not_found(selector))?;
        let removed = self.packages.remove(index);
        self.save()?;
        Ok(removed)
    }

    fn resolved_env(&self, pkg: &Package) -> Result<ResolvedEnv> {
        let global = match &self.environment_ref {
            Some(name) => Some(Environment::load(name)?),
            None => None,
        };
        Ok(env::resolve(
            global.as_ref(),
            Some(&self.environment),
            pkg.environment.as_ref(),
        ))
    }

    /// Apply configuration to every package in declared order. Legal from
    /// Unconfigured and Configured; a Running package must go through
    /// `update` instead.
    pub fn configure(&mut self, ctx: &ExecContext) -> Result<PipelineReport> {
        for pkg in &self.packages {
            if pkg.state == PackageState::Running {
                return Err(Error::invalid_state(
                    pkg.name.clone(),
                    PackageState::Running.as_str(),
                    "configure",
                ));
            }
        }
        let mut report = self.report("configure");
        for ordinal in 0..self.packages.len() {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let entry = self.configure_one(ctx, ordinal);
            let failed = entry.error.is_some();
            report.packages.push(entry);
            if failed {
                break;
            }
        }
        self.save()?;
        Ok(report.finish())
    }

    /// Start every package in declared order, fanning each one out across
    /// the target hosts. Stops advancing at the first package failure and
    /// never rolls back what already started.
    pub fn start(&mut self, ctx: &ExecContext) -> Result<PipelineReport> {
        for pkg in &self.packages {
            if pkg.state == PackageState::Unconfigured {
                return Err(Error::invalid_state(
                    pkg.name.clone(),
                    PackageState::Unconfigured.as_str(),
                    "start",
                ));
            }
        }
        let mut report = self.report("start");
        self.start_packages(ctx, &mut report)?;
        self.save()?;
        Ok(report.finish())
    }

    /// `configure` where needed, then `start`, package by package.
    pub fn run(&mut self, ctx: &ExecContext) -> Result<PipelineReport> {
        let mut report = self.report("run");
        for ordinal in 0..self.packages.len() {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if self.packages[ordinal].state == PackageState::Unconfigured {
                let entry = self.configure_one(ctx, ordinal);
                // A successful configure is only a means to the start below;
                // the table records the transition the caller asked for.
                if entry.error.is_some() {
                    report.packages.push(entry);
                    break;
                }
            }
            let entry = self.start_one(ctx, ordinal)?;
            let failed = entry.hosts.iter().any(|h| !h.success) || entry.error.is_some();
            report.packages.push(entry);
            if failed {
                break;
            }
        }
        self.save()?;
        Ok(report.finish())
    }

    /// Graceful shutdown in reverse declared order. Failures do not abort
    /// the sweep; every package is attempted.
    pub fn stop(&mut self, ctx: &ExecContext) -> Result<PipelineReport> {
        self.teardown(ctx, "stop")
    }

    /// Forced termination in reverse declared order, skipping graceful
    /// shutdown hooks.
    pub fn kill(&mut self, ctx: &ExecContext) -> Result<PipelineReport> {
        self.teardown(ctx, "kill")
    }

    /// Wipe runtime artifacts, keeping config. Only legal once nothing is
    /// Running.
    pub fn clean(&mut self, ctx: &ExecContext) -> Result<PipelineReport> {
        for pkg in &self.packages {
            if pkg.state == PackageState::Running {
                return Err(Error::invalid_state(
                    pkg.name.clone(),
                    PackageState::Running.as_str(),
                    "clean",
                ));
            }
        }
        let mut report = self.report("clean");
        for ordinal in 0..self.packages.len() {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if self.packages[ordinal].state != PackageState::Configured {
                continue;
            }
            let entry = match self.implementation_for(ctx, ordinal).and_then(|p| p.clean()) {
                Ok(()) => {
                    self.packages[ordinal].state = PackageState::Unconfigured;
                    self.package_entry(ordinal, "clean", None)
                }
                Err(err) => self.package_entry(ordinal, "clean", Some(err)),
            };
            report.packages.push(entry);
        }
        self.save()?;
        Ok(report.finish())
    }

    /// Re-apply current configuration. Hot-reconfigurable packages stay
    /// Running; anything else cycles stop/configure/start. A Configured
    /// package is re-configured only and never re-enters Running here.
    pub fn update(&mut self, ctx: &ExecContext) -> Result<PipelineReport> {
        let mut report = self.report("update");
        for ordinal in 0..self.packages.len() {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.packages[ordinal].state {
                PackageState::Unconfigured | PackageState::Removed => continue,
                PackageState::Configured => {
                    let entry = self.configure_one(ctx, ordinal);
                    report.packages.push(entry);
                }
                PackageState::Running => {
                    let implementation = self.implementation_for(ctx, ordinal)?;
                    if implementation.supports_hot_reconfigure() {
                        let config = self.packages[ordinal].config.clone();
                        let entry = match implementation.configure(&config) {
                            Ok(()) => self.package_entry(ordinal, "update", None),
                            Err(err) => self.package_entry(ordinal, "update", Some(err)),
                        };
                        report.packages.push(entry);
                    } else {
                        let stop_entry = self.teardown_one(ctx, ordinal, "stop")?;
                        let stop_failed = stop_entry.hosts.iter().any(|h| !h.success);
                        report.packages.push(stop_entry);
                        if stop_failed {
                            continue;
                        }
                        let configure_entry = self.configure_one(ctx, ordinal);
                        let configure_failed = configure_entry.error.is_some();
                        report.packages.push(configure_entry);
                        if configure_failed {
                            continue;
                        }
                        let start_entry = self.start_one(ctx, ordinal)?;
                        report.packages.push(start_entry);
                    }
                }
            }
        }
        self.save()?;
        Ok(report.finish())
    }

    /// Probe liveness on every host and compare against recorded state.
    /// Reports drift in both directions and mutates nothing.
    pub fn status(&self, ctx: &ExecContext) -> Result<StatusReport> {
        let mut packages = Vec::with_capacity(self.packages.len());
        for (ordinal, pkg) in self.packages.iter().enumerate() {
            let implementation = self.implementation_for(ctx, ordinal)?;
            let expected_live = pkg.state == PackageState::Running;

            let hosts = fan_out(&ctx.hosts, |host| {
                implementation.status(host).map(|live| HostStatus {
                    host: host.to_string(),
                    live: Some(live),
                    drift: live != expected_live,
                    error: None,
                })
            })
            .into_iter()
            .enumerate()
            .map(|(i, outcome)| match outcome {
                Ok(status) => status,
                Err(err) => HostStatus {
                    host: ctx.hosts[i].clone(),
                    live: None,
                    drift: true,
                    error: Some(err.to_string()),
                },
            })
            .collect::<Vec<_>>();

            let drift = hosts.iter().any(|h| h.drift);
            packages.push(PackageStatus {
                name: pkg.name.clone(),
                ordinal,
                state: pkg.state,
                hosts,
                drift,
            });
        }
        let drift = packages.iter().any(|p| p.drift);
        Ok(StatusReport {
            pipeline: self.name.clone(),
            packages,
            drift,
        })
    }

    /// Cascade teardown, release package and environment state, delete the
    /// record. Irreversible; `load` afterwards is NotFound.
    pub fn destroy(mut self, ctx: &ExecContext) -> Result<PipelineReport> {
        let mut report = self.report("destroy");

        if self.packages.iter().any(|p| p.state == PackageState::Running) {
            let stop_report = self.teardown(ctx, "stop")?;
            let still_running: Vec<usize> = self
                .packages
                .iter()
                .enumerate()
                .filter(|(_, p)| p.state == PackageState::Running)
                .map(|(i, _)| i)
                .collect();
            report.packages.extend(stop_report.packages);
            for ordinal in still_running.into_iter().rev() {
                let entry = self.teardown_one(ctx, ordinal, "kill")?;
                report.packages.push(entry);
            }
        }

        // Best-effort artifact release; a failing clean never blocks the
        // record deletion.
        for ordinal in 0..self.packages.len() {
            if self.packages[ordinal].state != PackageState::Configured {
                continue;
            }
            let entry = match self.implementation_for(ctx, ordinal).and_then(|p| p.clean()) {
                Ok(()) => self.package_entry(ordinal, "destroy", None),
                Err(err) => self.package_entry(ordinal, "destroy", Some(err)),
            };
            report.packages.push(entry);
        }
        for pkg in &mut self.packages {
            pkg.state = PackageState::Removed;
        }

        store::delete::<Pipeline>(&self.name)?;
        log_status!("ppl", "Destroyed pipeline '{}'", self.name);
        Ok(report.finish())
    }

    fn report(&self, action: &str) -> PipelineReport {
        PipelineReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            pipeline: self.name.clone(),
            action: action.to_string(),
            packages: Vec::new(),
            outcome: PipelineOutcome::Success,
            cancelled: false,
        }
    }

    fn package_entry(&self, ordinal: usize, action: &str, error: Option<Error>) -> PackageReport {
        let pkg = &self.packages[ordinal];
        PackageReport {
            name: pkg.name.clone(),
            ordinal,
            action: action.to_string(),
            state: pkg.state,
            hosts: Vec::new(),
            error: error.map(|e| e.to_string()),
        }
    }

    /// Resolve the implementation for one package. On the first touch within
    /// a command the persisted package config is re-applied, so hooks in a
    /// fresh process see the configuration recorded at configure time.
    fn implementation_for(&self, ctx: &ExecContext, ordinal: usize) -> Result<Arc<dyn PackageImpl>> {
        if let Some(implementation) = ctx.cached(ordinal) {
            return Ok(implementation);
        }
        let pkg = &self.packages[ordinal];
        let implementation = ctx.repository.resolve(&pkg.name)?;
        if pkg.state != PackageState::Unconfigured {
            implementation.configure(&pkg.config)?;
        }
        ctx.cache(ordinal, Arc::clone(&implementation));
        Ok(implementation)
    }

    fn configure_one(&mut self, ctx: &ExecContext, ordinal: usize) -> PackageReport {
        let name = self.packages[ordinal].name.clone();
        let config = self.packages[ordinal].config.clone();
        let outcome = match ctx.cached(ordinal) {
            Some(implementation) => implementation.configure(&config),
            None => ctx.repository.resolve(&name).and_then(|implementation| {
                implementation.configure(&config)?;
                ctx.cache(ordinal, implementation);
                Ok(())
            }),
        };
        match outcome {
            Ok(()) => {
                self.packages[ordinal].state = PackageState::Configured;
                self.package_entry(ordinal, "configure", None)
            }
            Err(err) => self.package_entry(ordinal, "configure", Some(err)),
        }
    }

    fn start_one(&mut self, ctx: &ExecContext, ordinal: usize) -> Result<PackageReport> {
        let pkg = &self.packages[ordinal];
        if pkg.state == PackageState::Running {
            // Idempotent re-start, already live everywhere we know of.
            return Ok(self.package_entry(ordinal, "start", None));
        }
        let name = pkg.name.clone();
        let implementation = self.implementation_for(ctx, ordinal)?;
        let resolved = self.resolved_env(pkg)?;

        log_status!("ppl", "Starting '{}' on {} hosts", name, ctx.hosts.len());
        let hosts = collect_host_results(&ctx.hosts, |host| implementation.start(&resolved, host));

        if hosts.iter().any(|h| h.success) {
            self.packages[ordinal].state = PackageState::Running;
        }
        let mut entry = self.package_entry(ordinal, "start", None);
        entry.hosts = hosts;
        Ok(entry)
    }

    fn teardown_one(
        &mut self,
        ctx: &ExecContext,
        ordinal: usize,
        action: &str,
    ) -> Result<PackageReport> {
        let implementation = self.implementation_for(ctx, ordinal)?;

        let hosts = collect_host_results(&ctx.hosts, |host| {
            if action == "kill" {
                implementation.kill(host)
            } else {
                implementation.stop(host)
            }
        });

        // Transition only when every host confirmed; a partial stop leaves
        // the package Running so drift stays visible.
        if hosts.iter().all(|h| h.success) {
            self.packages[ordinal].state = PackageState::Configured;
        }
        let mut entry = self.package_entry(ordinal, action, None);
        entry.hosts = hosts;
        Ok(entry)
    }

    fn start_packages(&mut self, ctx: &ExecContext, report: &mut PipelineReport) -> Result<()> {
        for ordinal in 0..self.packages.len() {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let entry = self.start_one(ctx, ordinal)?;
            let failed = entry.hosts.iter().any(|h| !h.success);
            report.packages.push(entry);
            if failed {
                break;
            }
        }
        Ok(())
    }

    fn teardown(&mut self, ctx: &ExecContext, action: &str) -> Result<PipelineReport> {
        let mut report = self.report(action);
        for ordinal in (0..self.packages.len()).rev() {
            if ctx.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            if self.packages[ordinal].state != PackageState::Running {
                continue;
            }
            let entry = self.teardown_one(ctx, ordinal, action)?;
            report.packages.push(entry);
        }
        self.save()?;
        Ok(report.finish())
    }
}

impl PipelineReport {
    fn finish(mut self) -> PipelineReport {
        self.outcome = derive_outcome(&self.packages);
        self
    }
}

/// First package matching the selector: an in-range integer is an ordinal,
/// anything else matches by name.
fn match_selector(packages: &[Package], selector: &str) -> Option<usize> {
    if let Ok(ordinal) = selector.parse::<usize>() {
        if ordinal < packages.len() {
            return Some(ordinal);
        }
    }
    packages.iter().position(|p| p.name == selector)
}

/// Success iff every entry succeeded, Failed when none did, PartialFailure
/// for a proper nonempty failing subset. Package-level errors count like a
/// failing host entry.
fn derive_outcome(packages: &[PackageReport]) -> PipelineOutcome {
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for pkg in packages {
        if pkg.hosts.is_empty() {
            match pkg.error {
                None => succeeded += 1,
                Some(_) => failed += 1,
            }
            continue;
        }
        for host in &pkg.hosts {
            if host.success {
                succeeded += 1;
            } else {
                failed += 1;
            }
        }
        if pkg.error.is_some() {
            failed += 1;
        }
    }
    if failed == 0 {
        PipelineOutcome::Success
    } else if succeeded == 0 {
        PipelineOutcome::Failed
    } else {
        PipelineOutcome::PartialFailure
    }
}

/// Fan one per-host closure out across a bounded batch of threads. All host
/// results join before returning; result order matches host order.
fn fan_out<T, F>(hosts: &[String], op: F) -> Vec<Result<T>>
where
    T: Send,
    F: Fn(&str) -> Result<T> + Sync,
{
    let mut results = Vec::with_capacity(hosts.len());
    for chunk in hosts.chunks(MAX_PARALLEL_HOSTS) {
        let chunk_results: Vec<Result<T>> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|host| {
                    let op = &op;
                    scope.spawn(move || op(host))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(Error::internal_unexpected(
                            "Host operation thread panicked".to_string(),
                        ))
                    })
                })
                .collect()
        });
        results.extend(chunk_results);
    }
    results
}

fn collect_host_results<F>(hosts: &[String], op: F) -> Vec<HostResult>
where
    F: Fn(&str) -> Result<()> + Sync,
{
    fan_out(hosts, op)
        .into_iter()
        .zip(hosts)
        .map(|(outcome, host)| match outcome {
            Ok(()) => HostResult {
                host: host.clone(),
                success: true,
                error: None,
            },
            Err(err) => HostResult {
                host: host.clone(),
                success: false,
                error: Some(err.to_string()),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pkg(name: &str) -> Package {
        Package::new(name, BTreeMap::new())
    }

    fn entry(name: &str, host_flags: &[bool], error: Option<&str>) -> PackageReport {
        PackageReport {
            name: name.to_string(),
            ordinal: 0,
            action: "start".to_string(),
            state: PackageState::Running,
            hosts: host_flags
                .iter()
                .enumerate()
                .map(|(i, ok)| HostResult {
                    host: format!("h{}", i),
                    success: *ok,
                    error: None,
                })
                .collect(),
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn selector_matches_ordinal_then_name() {
        let packages = vec![pkg("alpha"), pkg("beta"), pkg("1")];
        assert_eq!(match_selector(&packages, "1"), Some(1));
        assert_eq!(match_selector(&packages, "beta"), Some(1));
        assert_eq!(match_selector(&packages, "9"), None);
        assert_eq!(match_selector(&packages, "gamma"), None);
    }

    #[test]
    fn outcome_success_requires_every_entry() {
        let packages = vec![entry("a", &[true, true], None), entry("b", &[true], None)];
        assert_eq!(derive_outcome(&packages), PipelineOutcome::Success);
    }

    #[test]
    fn outcome_partial_for_proper_failing_subset() {
        let packages = vec![entry("a", &[true, false], None)];
        assert_eq!(derive_outcome(&packages), PipelineOutcome::PartialFailure);
    }

    #[test]
    fn outcome_failed_when_nothing_succeeded() {
        let packages = vec![entry("a", &[false, false], None), entry("b", &[], Some("boom"))];
        assert_eq!(derive_outcome(&packages), PipelineOutcome::Failed);
    }

    #[test]
    fn outcome_counts_package_level_errors() {
        let packages = vec![entry("a", &[true], None), entry("b", &[], Some("boom"))];
        assert_eq!(derive_outcome(&packages), PipelineOutcome::PartialFailure);
    }

    #[test]
    fn empty_table_is_success() {
        assert_eq!(derive_outcome(&[]), PipelineOutcome::Success);
    }

    #[test]
    fn fan_out_preserves_host_order_across_chunks() {
        let hosts: Vec<String> = (0..20).map(|i| format!("h{}", i)).collect();
        let results = collect_host_results(&hosts, |host| {
            if host == "h7" {
                Err(Error::internal_unexpected("down".to_string()))
            } else {
                Ok(())
            }
        });
        assert_eq!(results.len(), 20);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.host, format!("h{}", i));
            assert_eq!(result.success, i != 7);
        }
    }

    #[test]
    fn cancel_token_is_shared_across_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
