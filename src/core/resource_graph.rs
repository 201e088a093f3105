use crate::error::{Error, Result};
use crate::local_files::{self, FileSystem};
use crate::paths;
use crate::store;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Upper bound on concurrent discovery probes per build.
const MAX_PARALLEL_PROBES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Cpu,
    Gpu,
    Nic,
    Storage,
    Other,
}

impl DeviceType {
    /// Parse a user-supplied filter string. Unknown strings return None so
    /// `filter` can yield an empty result instead of an error.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cpu" => Some(DeviceType::Cpu),
            "gpu" => Some(DeviceType::Gpu),
            "nic" => Some(DeviceType::Nic),
            "storage" => Some(DeviceType::Storage),
            "other" => Some(DeviceType::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub hostname: String,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl Node {
    pub fn has_device_type(&self, device_type: DeviceType) -> bool {
        self.devices.iter().any(|d| d.device_type == device_type)
    }
}

/// The discovered (or loaded) model of cluster hosts and their devices.
///
/// A graph is replaced wholesale on rebuild/load and shared read-only while a
/// command is in flight; nothing mutates a published graph in place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
}

/// Summary statistics for the CLI `rg info` surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSummary {
    pub total_nodes: usize,
    pub total_devices: usize,
    pub device_types: BTreeMap<String, usize>,
    pub unreachable_nodes: Vec<String>,
}

/// Collaborator that inventories one host. Implementations are expected to be
/// cheap to share across probe threads.
pub trait DiscoveryProbe: Send + Sync {
    fn probe(&self, hostname: &str) -> Result<Vec<Device>>;
}

impl ResourceGraph {
    /// Probe every target and assemble a graph.
    ///
    /// Unreachable hosts become present-but-device-less nodes; partial
    /// success is the normal case on a real cluster. Fails only when zero
    /// targets respond. Node order follows target order.
    pub fn build(targets: &[String], probe: Arc<dyn DiscoveryProbe>) -> Result<ResourceGraph> {
        let unique: Vec<String> = dedup_preserving_order(targets);
        if unique.is_empty() {
            return Err(Error::validation_invalid_argument(
                "targets",
                "Cannot build a resource graph from zero targets",
                None,
                None,
            ));
        }

        let results = probe_all(&unique, probe);

        let mut nodes = Vec::with_capacity(unique.len());
        let mut reachable = 0usize;
        for (hostname, outcome) in unique.iter().zip(results) {
            match outcome {
                Ok(devices) => {
                    reachable += 1;
                    nodes.push(Node {
                        hostname: hostname.clone(),
                        devices,
                    });
                }
                Err(err) => {
                    log_status!("rg", "Host '{}' unreachable: {}", hostname, err.message);
                    nodes.push(Node {
                        hostname: hostname.clone(),
                        devices: Vec::new(),
                    });
                }
            }
        }

        if reachable == 0 {
            return Err(Error::unreachable(
                unique.join(","),
                Some("no target responded to discovery".to_string()),
            ));
        }

        log_status!("rg", "Probed {} of {} nodes", reachable, nodes.len());
        Ok(ResourceGraph { nodes })
    }

    /// Deserialize a persisted graph. NotFound when absent, a parse error
    /// when malformed.
    pub fn load(path: &Path) -> Result<ResourceGraph> {
        if !path.exists() {
            return Err(Error::graph_not_found(path.display().to_string()));
        }
        let raw = local_files::local().read(path)?;
        let graph: ResourceGraph = store::from_yaml(&path.display().to_string(), &raw)?;
        graph.validate(path)?;
        Ok(graph)
    }

    /// Persist atomically (write-to-temp-then-rename via LocalFs).
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            local_files::local().ensure_dir(parent)?;
        }
        let content = store::to_yaml(self)?;
        local_files::local().write(path, &content)
    }

    /// Canonical persisted-graph location for the active installation.
    pub fn path() -> Result<PathBuf> {
        paths::resource_graph()
    }

    /// Nodes owning at least one device of the given type, original order
    /// preserved. An unknown type string yields an empty sequence.
    pub fn filter(&self, device_type: &str) -> Vec<&Node> {
        let Some(wanted) = DeviceType::parse(device_type) else {
            return Vec::new();
        };
        self.nodes
            .iter()
            .filter(|n| n.has_device_type(wanted))
            .collect()
    }

    /// Exact-match hostname lookup.
    pub fn node(&self, hostname: &str) -> Result<&Node> {
        self.nodes
            .iter()
            .find(|n| n.hostname == hostname)
            .ok_or_else(|| Error::node_not_found(hostname))
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.hostname.clone()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn summary(&self) -> GraphSummary {
        let mut device_types: BTreeMap<String, usize> = BTreeMap::new();
        let mut total_devices = 0usize;
        let mut unreachable_nodes = Vec::new();

        for node in &self.nodes {
            if node.devices.is_empty() {
                unreachable_nodes.push(node.hostname.clone());
            }
            for device in &node.devices {
                total_devices += 1;
                let key = serde_json::to_value(device.device_type)
                    .ok()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .unwrap_or_else(|| "other".to_string());
                *device_types.entry(key).or_default() += 1;
            }
        }

        GraphSummary {
            total_nodes: self.nodes.len(),
            total_devices,
            device_types,
            unreachable_nodes,
        }
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.hostname.as_str()) {
                return Err(Error::parse_error(
                    path.display().to_string(),
                    format!("duplicate hostname '{}'", node.hostname),
                ));
            }
        }
        Ok(())
    }
}

fn dedup_preserving_order(targets: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    targets
        .iter()
        .filter(|t| seen.insert(t.as_str()))
        .cloned()
        .collect()
}

/// Fan probes out across a bounded batch of threads and join all results
/// before assembling the graph. Result order matches target order.
fn probe_all(targets: &[String], probe: Arc<dyn DiscoveryProbe>) -> Vec<Result<Vec<Device>>> {
    use std::thread;

    let mut results: Vec<Result<Vec<Device>>> = Vec::with_capacity(targets.len());

    for chunk in targets.chunks(MAX_PARALLEL_PROBES) {
        let handles: Vec<_> = chunk
            .iter()
            .map(|hostname| {
                let hostname = hostname.clone();
                let probe = Arc::clone(&probe);
                thread::spawn(move || probe.probe(&hostname))
            })
            .collect();

        for handle in handles {
            results.push(handle.join().unwrap_or_else(|_| {
                Err(Error::internal_unexpected(
                    "Discovery probe thread panicked".to_string(),
                ))
            }));
        }
    }

    results
}

/// SSH-backed discovery probe. Inventories CPUs, GPUs, NICs and mounted
/// storage with standard tools; a host that fails the first round trip is
/// reported Unreachable.
pub struct SshProbe;

impl DiscoveryProbe for SshProbe {
    fn probe(&self, hostname: &str) -> Result<Vec<Device>> {
        use crate::ssh::SshClient;

        let client = SshClient::new(hostname);
        let mut devices = Vec::new();

        let cpus = client.execute("nproc 2>/dev/null");
        if !cpus.success {
            return Err(Error::unreachable(hostname, Some(cpus.stderr)));
        }
        if let Ok(count) = cpus.stdout.trim().parse::<u64>() {
            let mut attributes = BTreeMap::new();
            attributes.insert("cores".to_string(), serde_json::json!(count));
            devices.push(Device {
                id: "cpu0".to_string(),
                device_type: DeviceType::Cpu,
                attributes,
            });
        }

        let gpus = client.execute("nvidia-smi --query-gpu=name --format=csv,noheader 2>/dev/null");
        if gpus.success {
            for (idx, name) in gpus.stdout.lines().filter(|l| !l.trim().is_empty()).enumerate() {
                let mut attributes = BTreeMap::new();
                attributes.insert("model".to_string(), serde_json::json!(name.trim()));
                devices.push(Device {
                    id: format!("gpu{}", idx),
                    device_type: DeviceType::Gpu,
                    attributes,
                });
            }
        }

        let nics = client.execute("ls /sys/class/net 2>/dev/null");
        if nics.success {
            for name in nics.stdout.split_whitespace().filter(|n| *n != "lo") {
                devices.push(Device {
                    id: name.to_string(),
                    device_type: DeviceType::Nic,
                    attributes: BTreeMap::new(),
                });
            }
        }

        let mounts = client.execute("df --output=source,target,avail -x tmpfs -x devtmpfs 2>/dev/null | tail -n +2");
        if mounts.success {
            for (idx, line) in mounts.stdout.lines().enumerate() {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() < 3 || !fields[0].starts_with('/') {
                    continue;
                }
                let mut attributes = BTreeMap::new();
                attributes.insert("device".to_string(), serde_json::json!(fields[0]));
                attributes.insert("mount".to_string(), serde_json::json!(fields[1]));
                attributes.insert("avail_kb".to_string(), serde_json::json!(fields[2]));
                devices.push(Device {
                    id: format!("disk{}", idx),
                    device_type: DeviceType::Storage,
                    attributes,
                });
            }
        }

        Ok(devices)
    }
}
