// Public modules
pub mod env;
pub mod error;
pub mod hostfile;
pub mod package;
pub mod pipeline;
pub mod repository;
pub mod resource_graph;
pub mod shell;
pub mod ssh;

// Internal modules - not part of public API
pub(crate) mod local_files;
pub(crate) mod paths;
pub(crate) mod store;

// Re-export common types for convenience
pub use env::{Environment, Module, ResolvedEnv, Sequence};
pub use error::{Error, ErrorCode, Result};
pub use hostfile::Hostfile;
pub use package::{Package, PackageImpl, PackageState};
pub use pipeline::{
    CancelToken, ExecContext, OrchestratorStore, Pipeline, PipelineOutcome, PipelineReport,
    StatusReport,
};
pub use repository::{BuiltinRepository, Repository};
pub use resource_graph::{Device, DeviceType, DiscoveryProbe, Node, ResourceGraph, SshProbe};
