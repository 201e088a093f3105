use crate::error::{Error, Result};
use crate::paths;
use crate::store::{self, ConfigEntity};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Variables captured from the calling process when an environment is built.
/// Build-system and toolchain variables a cluster deployment typically needs
/// to carry onto remote hosts.
pub const CAPTURED_ENV_VARS: &[&str] = &[
    "CMAKE_MODULE_PATH",
    "CMAKE_PREFIX_PATH",
    "PKG_CONFIG_PATH",
    "CPATH",
    "C_INCLUDE_PATH",
    "CPLUS_INCLUDE_PATH",
    "INCLUDE_PATH",
    "LD_LIBRARY_PATH",
    "LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
    "LD_PRELOAD",
    "PATH",
    "MANPATH",
    "PYTHONPATH",
    "PERL5LIB",
    "CLASSPATH",
    "GOPATH",
    "CARGO_HOME",
    "TCLLIBPATH",
    "JAVA_HOME",
    "CC",
    "CXX",
    "FC",
    "F77",
    "F90",
    "MPICC",
    "MPICXX",
    "MPIFC",
    "MPIF77",
    "MPIF90",
    "CFLAGS",
    "CXXFLAGS",
    "FFLAGS",
    "LDFLAGS",
    "LIBS",
];

/// Captured variables treated as ordered `:`-separated search paths. Anything
/// else captured lands in the scalar override map.
const SEQUENCE_VARS: &[&str] = &[
    "CMAKE_MODULE_PATH",
    "CMAKE_PREFIX_PATH",
    "PKG_CONFIG_PATH",
    "CPATH",
    "C_INCLUDE_PATH",
    "CPLUS_INCLUDE_PATH",
    "INCLUDE_PATH",
    "LD_LIBRARY_PATH",
    "LIBRARY_PATH",
    "DYLD_LIBRARY_PATH",
    "PATH",
    "MANPATH",
    "PYTHONPATH",
    "PERL5LIB",
    "CLASSPATH",
    "TCLLIBPATH",
];

fn is_sequence_var(name: &str) -> bool {
    SEQUENCE_VARS.contains(&name)
}

/// One PATH-style sequence. Prepends and appends are stored apart from the
/// captured base so scope layering can place an inner scope's appends after
/// outer-scope values.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sequence {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prepends: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub appends: Vec<String>,
}

impl Sequence {
    /// The sequence in effective order: prepends, base values, appends.
    pub fn flatten(&self) -> Vec<String> {
        let mut all = self.prepends.clone();
        all.extend(self.values.iter().cloned());
        all.extend(self.appends.iter().cloned());
        all
    }
}

/// A named environment: ordered PATH-style sequences plus scalar overrides.
/// Persisted one YAML record per name under `envs/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub variables: BTreeMap<String, Sequence>,
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

/// A module declaration file under `modules/<name>.yaml`: paths to prepend to
/// sequence variables plus scalar assignments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Module {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub prepends: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub setenvs: BTreeMap<String, String>,
}

impl ConfigEntity for Environment {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn record_path(name: &str) -> Result<PathBuf> {
        paths::env_record(name)
    }
    fn record_dir() -> Result<PathBuf> {
        paths::envs()
    }
    fn not_found_error(name: String) -> Error {
        Error::env_not_found(name)
    }
    fn entity_type() -> &'static str {
        "env"
    }
}

impl ConfigEntity for Module {
    fn name(&self) -> &str {
        &self.name
    }
    fn set_name(&mut self, name: String) {
        self.name = name;
    }
    fn record_path(name: &str) -> Result<PathBuf> {
        paths::module(name)
    }
    fn record_dir() -> Result<PathBuf> {
        paths::modules()
    }
    fn not_found_error(name: String) -> Error {
        Error::module_not_found(name)
    }
    fn entity_type() -> &'static str {
        "module"
    }
}

impl Environment {
    pub fn new(name: impl Into<String>) -> Self {
        Environment {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Snapshot the calling process environment for the captured-variable
    /// list, then apply declarations in order. A source is either a scalar
    /// `KEY=value` set or a `module:<name>` load.
    pub fn build(name: &str, sources: &[String]) -> Result<Environment> {
        let env = Self::build_with(name, sources, |v| std::env::var(v).ok(), Module::load)?;
        env.save()?;
        log_status!("env", "Built environment '{}'", name);
        Ok(env)
    }

    fn build_with(
        name: &str,
        sources: &[String],
        lookup: impl Fn(&str) -> Option<String>,
        load_module: impl Fn(&str) -> Result<Module>,
    ) -> Result<Environment> {
        let mut env = Environment::new(name);

        for var in CAPTURED_ENV_VARS {
            let Some(value) = lookup(var) else { continue };
            if value.is_empty() {
                continue;
            }
            if is_sequence_var(var) {
                let parts: Vec<String> = value
                    .split(':')
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect();
                env.variables.insert(
                    var.to_string(),
                    Sequence {
                        values: parts,
                        ..Default::default()
                    },
                );
            } else {
                env.overrides.insert(var.to_string(), value);
            }
        }

        for source in sources {
            if let Some(module_name) = source.strip_prefix("module:") {
                let module = load_module(module_name)?;
                env.apply_module(&module);
            } else if let Some((key, value)) = source.split_once('=') {
                if key.is_empty() {
                    return Err(Error::validation_invalid_argument(
                        "source",
                        "Empty variable name in KEY=value source",
                        Some(source.clone()),
                        None,
                    ));
                }
                env.overrides.insert(key.to_string(), value.to_string());
            } else {
                return Err(Error::validation_invalid_argument(
                    "source",
                    "Expected KEY=value or module:<name>",
                    Some(source.clone()),
                    None,
                ));
            }
        }

        Ok(env)
    }

    /// Prepend a module's paths and apply its scalar assignments.
    pub fn apply_module(&mut self, module: &Module) {
        for (var, values) in &module.prepends {
            let seq = self.variables.entry(var.clone()).or_default();
            for value in values.iter().rev() {
                seq.prepends.insert(0, value.clone());
            }
        }
        for (var, value) in &module.setenvs {
            self.overrides.insert(var.clone(), value.clone());
        }
    }

    /// Duplicates are preserved; rank in the sequence is significant.
    pub fn prepend(&mut self, var: &str, value: &str) {
        self.variables
            .entry(var.to_string())
            .or_default()
            .prepends
            .insert(0, value.to_string());
    }

    pub fn append(&mut self, var: &str, value: &str) {
        self.variables
            .entry(var.to_string())
            .or_default()
            .appends
            .push(value.to_string());
    }

    pub fn set(&mut self, var: &str, value: &str) {
        self.overrides.insert(var.to_string(), value.to_string());
    }

    /// Read-only merged render: sequences joined with `:`, scalar overrides
    /// applied last.
    pub fn show(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for (var, seq) in &self.variables {
            merged.insert(var.clone(), seq.flatten().join(":"));
        }
        for (var, value) in &self.overrides {
            merged.insert(var.clone(), value.clone());
        }
        merged
    }

    pub fn load(name: &str) -> Result<Environment> {
        store::load(name)
    }

    pub fn save(&self) -> Result<()> {
        store::save(self)
    }

    pub fn delete(name: &str) -> Result<()> {
        store::delete::<Environment>(name)
    }

    pub fn exists(name: &str) -> bool {
        store::exists::<Environment>(name)
    }

    pub fn list() -> Result<Vec<String>> {
        store::list_names::<Environment>()
    }

    /// Duplicate a named environment under a new name. Fails AlreadyExists
    /// when the destination exists, unless `overwrite` is set.
    pub fn copy(src: &str, dst: &str, overwrite: bool) -> Result<Environment> {
        let mut env = Environment::load(src)?;
        if !overwrite && Environment::exists(dst) {
            return Err(Error::env_already_exists(dst));
        }
        env.name = dst.to_string();
        env.save()?;
        log_status!("env", "Copied environment '{}' to '{}'", src, dst);
        Ok(env)
    }
}

impl Module {
    pub fn load(name: &str) -> Result<Module> {
        store::load(name)
    }

    pub fn save(&self) -> Result<()> {
        store::save(self)
    }

    pub fn list() -> Result<Vec<String>> {
        store::list_names::<Module>()
    }
}

/// The fully layered view a package runs under.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolvedEnv {
    pub variables: BTreeMap<String, Vec<String>>,
    pub overrides: BTreeMap<String, String>,
}

impl ResolvedEnv {
    /// Shell-ready `(KEY, value)` pairs, sequences joined with `:`.
    pub fn as_pairs(&self) -> Vec<(String, String)> {
        let mut merged: BTreeMap<String, String> = BTreeMap::new();
        for (var, seq) in &self.variables {
            merged.insert(var.clone(), seq.join(":"));
        }
        for (var, value) in &self.overrides {
            merged.insert(var.clone(), value.clone());
        }
        merged.into_iter().collect()
    }
}

/// Layer the three environment scopes. Sequences nest: each inner scope wraps
/// the outer result, its prepends and base values leading and its appends
/// trailing. Package prepends therefore come first and package appends last.
/// Scalars apply global, pipeline, package so the package value wins.
pub fn resolve(
    global: Option<&Environment>,
    pipeline: Option<&Environment>,
    package: Option<&Environment>,
) -> ResolvedEnv {
    let mut resolved = ResolvedEnv::default();

    if let Some(scope) = global {
        for (var, seq) in &scope.variables {
            resolved.variables.insert(var.clone(), seq.flatten());
        }
    }
    for scope in [pipeline, package].into_iter().flatten() {
        for (var, seq) in &scope.variables {
            let outer = resolved.variables.entry(var.clone()).or_default();
            let mut layered = seq.prepends.clone();
            layered.extend(seq.values.iter().cloned());
            layered.append(outer);
            layered.extend(seq.appends.iter().cloned());
            *outer = layered;
        }
    }

    for scope in [global, pipeline, package].into_iter().flatten() {
        for (var, value) in &scope.overrides {
            resolved.overrides.insert(var.clone(), value.clone());
        }
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_path(name: &str, paths: &[&str]) -> Environment {
        let mut env = Environment::new(name);
        env.variables.insert(
            "PATH".to_string(),
            Sequence {
                values: paths.iter().map(|p| p.to_string()).collect(),
                ..Default::default()
            },
        );
        env
    }

    #[test]
    fn resolve_concatenates_sequences_package_first() {
        let global = env_with_path("global", &["/usr/bin"]);
        let pipeline = env_with_path("pipeline", &["/opt/bin"]);
        let package = env_with_path("package", &["/pkg/bin"]);

        let resolved = resolve(Some(&global), Some(&pipeline), Some(&package));
        assert_eq!(
            resolved.variables.get("PATH").unwrap(),
            &vec![
                "/pkg/bin".to_string(),
                "/opt/bin".to_string(),
                "/usr/bin".to_string()
            ]
        );
    }

    #[test]
    fn resolve_places_inner_scope_appends_after_outer_values() {
        let global = env_with_path("global", &["/usr/bin"]);
        let mut pipeline = Environment::new("pipeline");
        pipeline.append("PATH", "/opt/late");

        let resolved = resolve(Some(&global), Some(&pipeline), None);
        assert_eq!(
            resolved.variables.get("PATH").unwrap(),
            &vec!["/usr/bin".to_string(), "/opt/late".to_string()]
        );
    }

    #[test]
    fn resolve_nests_prepends_and_appends_by_scope() {
        let global = env_with_path("global", &["/usr/bin"]);
        let mut pipeline = Environment::new("pipeline");
        pipeline.append("PATH", "/ppl/late");
        let mut package = Environment::new("package");
        package.prepend("PATH", "/pkg/bin");
        package.append("PATH", "/pkg/late");

        let resolved = resolve(Some(&global), Some(&pipeline), Some(&package));
        assert_eq!(
            resolved.variables.get("PATH").unwrap(),
            &vec![
                "/pkg/bin".to_string(),
                "/usr/bin".to_string(),
                "/ppl/late".to_string(),
                "/pkg/late".to_string()
            ]
        );
    }

    #[test]
    fn resolve_scalar_package_wins() {
        let mut global = Environment::new("g");
        global.set("CC", "gcc");
        let mut pipeline = Environment::new("p");
        pipeline.set("CC", "clang");
        let mut package = Environment::new("k");
        package.set("CC", "mpicc");

        let resolved = resolve(Some(&global), Some(&pipeline), Some(&package));
        assert_eq!(resolved.overrides.get("CC").unwrap(), "mpicc");
    }

    #[test]
    fn resolve_with_missing_scopes_passes_through() {
        let pipeline = env_with_path("p", &["/opt/bin"]);
        let resolved = resolve(None, Some(&pipeline), None);
        assert_eq!(
            resolved.variables.get("PATH").unwrap(),
            &vec!["/opt/bin".to_string()]
        );
    }

    #[test]
    fn prepend_and_append_preserve_duplicates() {
        let mut env = Environment::new("e");
        env.append("PATH", "/a");
        env.append("PATH", "/a");
        env.prepend("PATH", "/b");
        assert_eq!(
            env.variables.get("PATH").unwrap().flatten(),
            vec!["/b".to_string(), "/a".to_string(), "/a".to_string()]
        );
    }

    #[test]
    fn build_captures_sequences_and_applies_sources_in_order() {
        let sources = vec![
            "CC=mpicc".to_string(),
            "module:spack".to_string(),
        ];
        let mut prepends = BTreeMap::new();
        prepends.insert("PATH".to_string(), vec!["/spack/bin".to_string()]);
        let mut setenvs = BTreeMap::new();
        setenvs.insert("SPACK_ROOT".to_string(), "/spack".to_string());
        let module = Module {
            name: "spack".to_string(),
            prepends,
            setenvs,
        };

        let env = Environment::build_with(
            "dev",
            &sources,
            |var| match var {
                "PATH" => Some("/usr/bin:/bin".to_string()),
                "CC" => Some("gcc".to_string()),
                _ => None,
            },
            |name| {
                assert_eq!(name, "spack");
                Ok(module.clone())
            },
        )
        .unwrap();

        assert_eq!(
            env.variables.get("PATH").unwrap().flatten(),
            vec![
                "/spack/bin".to_string(),
                "/usr/bin".to_string(),
                "/bin".to_string()
            ]
        );
        assert_eq!(env.overrides.get("CC").unwrap(), "mpicc");
        assert_eq!(env.overrides.get("SPACK_ROOT").unwrap(), "/spack");
    }

    #[test]
    fn build_rejects_malformed_source() {
        let err = Environment::build_with(
            "dev",
            &["not-a-source".to_string()],
            |_| None,
            |_| Ok(Module::default()),
        )
        .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::ValidationInvalidArgument);
    }

    #[test]
    fn apply_module_prepends_keep_declared_order() {
        let mut env = env_with_path("e", &["/usr/bin"]);
        let mut prepends = BTreeMap::new();
        prepends.insert(
            "PATH".to_string(),
            vec!["/m/bin".to_string(), "/m/sbin".to_string()],
        );
        env.apply_module(&Module {
            name: "m".to_string(),
            prepends,
            setenvs: BTreeMap::new(),
        });
        assert_eq!(
            env.variables.get("PATH").unwrap().flatten(),
            vec![
                "/m/bin".to_string(),
                "/m/sbin".to_string(),
                "/usr/bin".to_string()
            ]
        );
    }

    #[test]
    fn show_joins_sequences_and_overlays_scalars() {
        let mut env = env_with_path("e", &["/a", "/b"]);
        env.set("CC", "gcc");
        let merged = env.show();
        assert_eq!(merged.get("PATH").unwrap(), "/a:/b");
        assert_eq!(merged.get("CC").unwrap(), "gcc");
    }
}
