use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, OnceLock};

use convoy::env::ResolvedEnv;
use convoy::pipeline::ExecContext;
use convoy::{
    BuiltinRepository, CancelToken, Error, ErrorCode, PackageImpl, PackageState, Pipeline,
    PipelineOutcome, Repository, Result,
};

static HOME: OnceLock<tempfile::TempDir> = OnceLock::new();

fn init_home() {
    let dir = HOME.get_or_init(|| tempfile::tempdir().unwrap());
    std::env::set_var("CONVOY_HOME", dir.path());
}

/// Records every lifecycle call in a shared log and fails on demand.
#[derive(Default)]
struct FakePackage {
    name: String,
    log: Arc<Mutex<Vec<String>>>,
    fail_start_hosts: Vec<String>,
    fail_stop: bool,
    live_hosts: Vec<String>,
    hot_reconfigure: bool,
}

impl FakePackage {
    fn new(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        FakePackage {
            name: name.to_string(),
            log,
            ..Default::default()
        }
    }

    fn record(&self, event: &str) {
        self.log.lock().unwrap().push(format!("{}:{}", self.name, event));
    }
}

impl PackageImpl for FakePackage {
    fn configure(&self, _config: &BTreeMap<String, String>) -> Result<()> {
        self.record("configure");
        Ok(())
    }

    fn start(&self, _env: &ResolvedEnv, host: &str) -> Result<()> {
        self.record(&format!("start@{}", host));
        if self.fail_start_hosts.iter().any(|h| h == host) {
            return Err(Error::unreachable(host, None));
        }
        Ok(())
    }

    fn stop(&self, host: &str) -> Result<()> {
        self.record(&format!("stop@{}", host));
        if self.fail_stop {
            return Err(Error::internal_unexpected("stop refused".to_string()));
        }
        Ok(())
    }

    fn kill(&self, host: &str) -> Result<()> {
        self.record(&format!("kill@{}", host));
        Ok(())
    }

    fn status(&self, host: &str) -> Result<bool> {
        Ok(self.live_hosts.iter().any(|h| h == host))
    }

    fn clean(&self) -> Result<()> {
        self.record("clean");
        Ok(())
    }

    fn supports_hot_reconfigure(&self) -> bool {
        self.hot_reconfigure
    }
}

#[derive(Default)]
struct FakeRepo {
    packages: HashMap<String, Arc<FakePackage>>,
}

impl FakeRepo {
    fn with(mut self, pkg: FakePackage) -> Self {
        self.packages.insert(pkg.name.clone(), Arc::new(pkg));
        self
    }
}

impl Repository for FakeRepo {
    fn resolve(&self, pkg_name: &str) -> Result<Arc<dyn PackageImpl>> {
        self.packages
            .get(pkg_name)
            .cloned()
            .map(|p| p as Arc<dyn PackageImpl>)
            .ok_or_else(|| Error::package_not_found(pkg_name))
    }
}

fn two_package_pipeline(name: &str, repo: &FakeRepo) -> Pipeline {
    let mut pipeline = Pipeline::create(name).unwrap();
    pipeline.append(repo, "pkgA", BTreeMap::new()).unwrap();
    pipeline.append(repo, "pkgB", BTreeMap::new()).unwrap();
    pipeline
}

fn ctx<'a>(repo: &'a FakeRepo, hosts: &[&str]) -> ExecContext<'a> {
    ExecContext::new(repo, hosts.iter().map(|h| h.to_string()).collect())
}

#[test]
fn destroy_then_load_is_not_found() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default().with(FakePackage::new("pkgA", log.clone()));

    let mut pipeline = Pipeline::create("doomed").unwrap();
    pipeline.append(&repo, "pkgA", BTreeMap::new()).unwrap();
    let report = pipeline.destroy(&ctx(&repo, &["h1"])).unwrap();
    assert_eq!(report.outcome, PipelineOutcome::Success);

    let err = Pipeline::load("doomed").unwrap_err();
    assert_eq!(err.code, ErrorCode::PipelineNotFound);
}

#[test]
fn create_twice_is_already_exists() {
    init_home();
    Pipeline::create("dup").unwrap();
    let err = Pipeline::create("dup").unwrap_err();
    assert_eq!(err.code, ErrorCode::PipelineAlreadyExists);
}

#[test]
fn package_order_survives_save_load_round_trip() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default()
        .with(FakePackage::new("alpha", log.clone()))
        .with(FakePackage::new("beta", log.clone()))
        .with(FakePackage::new("gamma", log.clone()));

    let mut pipeline = Pipeline::create("ordered").unwrap();
    for name in ["gamma", "alpha", "beta"] {
        pipeline.append(&repo, name, BTreeMap::new()).unwrap();
    }

    let loaded = Pipeline::load("ordered").unwrap();
    let names: Vec<&str> = loaded.packages.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["gamma", "alpha", "beta"]);
}

#[test]
fn append_unresolvable_package_is_not_found_and_not_persisted() {
    init_home();
    let repo = FakeRepo::default();
    let mut pipeline = Pipeline::create("strict").unwrap();
    let err = pipeline
        .append(&repo, "ghost", BTreeMap::new())
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::PackageNotFound);
    assert!(Pipeline::load("strict").unwrap().packages.is_empty());
}

#[test]
fn rm_matches_ordinal_then_name_without_reordering() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default()
        .with(FakePackage::new("a", log.clone()))
        .with(FakePackage::new("b", log.clone()))
        .with(FakePackage::new("c", log.clone()));

    let mut pipeline = Pipeline::create("trimmed").unwrap();
    for name in ["a", "b", "c"] {
        pipeline.append(&repo, name, BTreeMap::new()).unwrap();
    }

    let removed = pipeline.rm("1").unwrap();
    assert_eq!(removed.name, "b");
    let names: Vec<&str> = pipeline.packages.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["a", "c"]);

    let err = pipeline.rm("missing").unwrap_err();
    assert_eq!(err.code, ErrorCode::PackageNotFound);
}

#[test]
fn stop_issues_shutdown_in_reverse_declared_order() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default()
        .with(FakePackage::new("a", log.clone()))
        .with(FakePackage::new("b", log.clone()))
        .with(FakePackage::new("c", log.clone()));

    let mut pipeline = Pipeline::create("reversed").unwrap();
    for name in ["a", "b", "c"] {
        pipeline.append(&repo, name, BTreeMap::new()).unwrap();
    }
    let ctx = ctx(&repo, &["h1"]);
    pipeline.run(&ctx).unwrap();

    log.lock().unwrap().clear();
    let report = pipeline.stop(&ctx).unwrap();
    assert_eq!(report.outcome, PipelineOutcome::Success);

    let stops: Vec<String> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.contains(":stop@"))
        .cloned()
        .collect();
    assert_eq!(stops, vec!["c:stop@h1", "b:stop@h1", "a:stop@h1"]);
}

#[test]
fn stop_then_start_cycle_returns_every_package_to_running() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default()
        .with(FakePackage::new("pkgA", log.clone()))
        .with(FakePackage::new("pkgB", log.clone()));

    let mut pipeline = two_package_pipeline("cycle", &repo);
    let ctx = ctx(&repo, &["h1", "h2"]);

    let run = pipeline.run(&ctx).unwrap();
    assert_eq!(run.outcome, PipelineOutcome::Success);
    pipeline.stop(&ctx).unwrap();
    assert!(pipeline
        .packages
        .iter()
        .all(|p| p.state == PackageState::Configured));

    pipeline.start(&ctx).unwrap();
    assert!(pipeline
        .packages
        .iter()
        .all(|p| p.state == PackageState::Running));
}

#[test]
fn run_stops_advancing_at_first_failed_package() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut bad = FakePackage::new("pkgA", log.clone());
    bad.fail_start_hosts = vec!["h1".to_string()];
    let repo = FakeRepo::default()
        .with(bad)
        .with(FakePackage::new("pkgB", log.clone()));

    let mut pipeline = two_package_pipeline("halted", &repo);
    let report = pipeline.run(&ctx(&repo, &["h1"])).unwrap();

    assert_eq!(report.outcome, PipelineOutcome::Failed);
    // pkgB was never attempted.
    assert!(log.lock().unwrap().iter().all(|e| !e.starts_with("pkgB:start")));
    assert_eq!(pipeline.packages[0].state, PackageState::Configured);
    assert_eq!(pipeline.packages[1].state, PackageState::Unconfigured);
}

#[test]
fn start_partial_host_failure_is_partial_and_not_rolled_back() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut flaky = FakePackage::new("pkgA", log.clone());
    flaky.fail_start_hosts = vec!["h2".to_string()];
    let repo = FakeRepo::default().with(flaky);

    let mut pipeline = Pipeline::create("partial").unwrap();
    pipeline.append(&repo, "pkgA", BTreeMap::new()).unwrap();
    let report = pipeline.run(&ctx(&repo, &["h1", "h2"])).unwrap();

    assert_eq!(report.outcome, PipelineOutcome::PartialFailure);
    // Live somewhere, so the package counts as Running; no automatic stop.
    assert_eq!(pipeline.packages[0].state, PackageState::Running);
    let start_entry = report.packages.last().unwrap();
    let failed: Vec<&str> = start_entry
        .hosts
        .iter()
        .filter(|h| !h.success)
        .map(|h| h.host.as_str())
        .collect();
    assert_eq!(failed, vec!["h2"]);
    assert!(log.lock().unwrap().iter().all(|e| !e.contains("stop")));
}

#[test]
fn stop_failure_does_not_abort_the_sweep() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut sticky = FakePackage::new("pkgB", log.clone());
    sticky.fail_stop = true;
    let repo = FakeRepo::default()
        .with(FakePackage::new("pkgA", log.clone()))
        .with(sticky);

    let mut pipeline = two_package_pipeline("sweep", &repo);
    let ctx = ctx(&repo, &["h1"]);
    pipeline.run(&ctx).unwrap();

    let report = pipeline.stop(&ctx).unwrap();
    assert_eq!(report.outcome, PipelineOutcome::PartialFailure);
    // pkgB failed to stop but pkgA was still attempted afterwards.
    assert!(log
        .lock()
        .unwrap()
        .iter()
        .any(|e| e == "pkgA:stop@h1"));
    assert_eq!(pipeline.packages[0].state, PackageState::Configured);
    assert_eq!(pipeline.packages[1].state, PackageState::Running);
}

#[test]
fn clean_while_running_is_invalid_state() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default().with(FakePackage::new("pkgA", log.clone()));

    let mut pipeline = Pipeline::create("dirty").unwrap();
    pipeline.append(&repo, "pkgA", BTreeMap::new()).unwrap();
    let ctx = ctx(&repo, &["h1"]);
    pipeline.run(&ctx).unwrap();

    let err = pipeline.clean(&ctx).unwrap_err();
    assert_eq!(err.code, ErrorCode::StateInvalid);

    pipeline.stop(&ctx).unwrap();
    pipeline.clean(&ctx).unwrap();
    assert_eq!(pipeline.packages[0].state, PackageState::Unconfigured);
}

#[test]
fn killed_package_stays_configured_through_update() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default().with(FakePackage::new("pkgA", log.clone()));

    let mut pipeline = Pipeline::create("killed").unwrap();
    pipeline.append(&repo, "pkgA", BTreeMap::new()).unwrap();
    let ctx = ctx(&repo, &["h1"]);
    pipeline.run(&ctx).unwrap();
    pipeline.kill(&ctx).unwrap();
    assert_eq!(pipeline.packages[0].state, PackageState::Configured);

    // update re-applies config but never restarts a killed package.
    pipeline.update(&ctx).unwrap();
    assert_eq!(pipeline.packages[0].state, PackageState::Configured);
    assert!(log.lock().unwrap().iter().filter(|e| e.contains("start")).count() == 1);
}

#[test]
fn update_cycles_running_package_without_hot_reconfigure() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default().with(FakePackage::new("pkgA", log.clone()));

    let mut pipeline = Pipeline::create("cycled").unwrap();
    pipeline.append(&repo, "pkgA", BTreeMap::new()).unwrap();
    let ctx = ctx(&repo, &["h1"]);
    pipeline.run(&ctx).unwrap();

    log.lock().unwrap().clear();
    pipeline.update(&ctx).unwrap();
    assert_eq!(
        log.lock().unwrap().as_slice(),
        &[
            "pkgA:stop@h1".to_string(),
            "pkgA:configure".to_string(),
            "pkgA:start@h1".to_string()
        ]
    );
    assert_eq!(pipeline.packages[0].state, PackageState::Running);
}

#[test]
fn update_hot_reconfigures_in_place() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut hot = FakePackage::new("pkgA", log.clone());
    hot.hot_reconfigure = true;
    let repo = FakeRepo::default().with(hot);

    let mut pipeline = Pipeline::create("hot").unwrap();
    pipeline.append(&repo, "pkgA", BTreeMap::new()).unwrap();
    let ctx = ctx(&repo, &["h1"]);
    pipeline.run(&ctx).unwrap();

    log.lock().unwrap().clear();
    pipeline.update(&ctx).unwrap();
    assert_eq!(log.lock().unwrap().as_slice(), &["pkgA:configure".to_string()]);
    assert_eq!(pipeline.packages[0].state, PackageState::Running);
}

#[test]
fn status_reports_drift_without_mutating_state() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut ghost = FakePackage::new("pkgA", log.clone());
    // Recorded Running below, but live on h1 only: h2 drifted.
    ghost.live_hosts = vec!["h1".to_string()];
    let repo = FakeRepo::default().with(ghost);

    let mut pipeline = Pipeline::create("drifty").unwrap();
    pipeline.append(&repo, "pkgA", BTreeMap::new()).unwrap();
    let ctx = ctx(&repo, &["h1", "h2"]);
    pipeline.run(&ctx).unwrap();

    let status = pipeline.status(&ctx).unwrap();
    assert!(status.drift);
    let pkg = &status.packages[0];
    assert_eq!(pkg.state, PackageState::Running);
    assert!(!pkg.hosts[0].drift);
    assert!(pkg.hosts[1].drift);
    // Pure query: state untouched.
    assert_eq!(
        Pipeline::load("drifty").unwrap().packages[0].state,
        PackageState::Running
    );
}

#[test]
fn cancellation_skips_not_yet_started_packages() {
    init_home();
    let log = Arc::new(Mutex::new(Vec::new()));
    let repo = FakeRepo::default()
        .with(FakePackage::new("pkgA", log.clone()))
        .with(FakePackage::new("pkgB", log.clone()));

    let mut pipeline = two_package_pipeline("cancelled", &repo);
    let cancel = CancelToken::new();
    cancel.cancel();
    let mut ctx = ctx(&repo, &["h1"]);
    ctx.cancel = cancel;

    let report = pipeline.run(&ctx).unwrap();
    assert!(report.cancelled);
    assert!(report.packages.is_empty());
    assert!(log.lock().unwrap().is_empty());
}

#[test]
fn builtin_service_runs_and_stops_from_persisted_config() {
    init_home();
    let repo = BuiltinRepository::new();

    let mut pipeline = Pipeline::create("svc").unwrap();
    let config: BTreeMap<String, String> = [
        ("start", "true"),
        ("stop", "true"),
        ("kill", "true"),
        ("status", "true"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    pipeline.append(&repo, "service", config).unwrap();

    let run_ctx = ExecContext::new(&repo, vec!["localhost".to_string()]);
    let report = pipeline.run(&run_ctx).unwrap();
    assert_eq!(report.outcome, PipelineOutcome::Success);
    assert_eq!(pipeline.packages[0].state, PackageState::Running);

    // A later command sees only the persisted record; the stop hook must be
    // rebuilt from the recorded config.
    let mut reloaded = Pipeline::load("svc").unwrap();
    let stop_ctx = ExecContext::new(&repo, vec!["localhost".to_string()]);
    let report = reloaded.stop(&stop_ctx).unwrap();
    assert_eq!(report.outcome, PipelineOutcome::Success);
    assert_eq!(reloaded.packages[0].state, PackageState::Configured);
}

#[test]
fn placement_prefers_hostfile_then_graph_then_localhost() {
    init_home();
    let pipeline = Pipeline::create("placed").unwrap();

    assert_eq!(pipeline.placement(None).unwrap(), vec!["localhost"]);

    let graph = convoy::ResourceGraph {
        nodes: vec![
            convoy::Node {
                hostname: "n1".to_string(),
                devices: Vec::new(),
            },
            convoy::Node {
                hostname: "n2".to_string(),
                devices: Vec::new(),
            },
        ],
    };
    assert_eq!(pipeline.placement(Some(&graph)).unwrap(), vec!["n1", "n2"]);

    let hostfile = convoy::Hostfile::parse("node-[01-02]\n").unwrap();
    hostfile.save_named("placed-hosts").unwrap();
    let mut pipeline = pipeline;
    pipeline.hostfile_ref = Some("placed-hosts".to_string());
    pipeline.save().unwrap();
    assert_eq!(
        pipeline.placement(Some(&graph)).unwrap(),
        vec!["node-01", "node-02"]
    );
}
