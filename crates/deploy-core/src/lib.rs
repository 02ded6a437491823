//! Consensus network node lifecycle core.
//!
//! Drives deployment and membership changes of a running network on top of
//! the key material managed by `deploy-keys`:
//!
//! - Node registry with stable node ids and account numbers
//! - `config.txt` address book rendering
//! - Remote staging of files and commands into node pods
//! - Ordered step pipeline with retry, skip and rollback
//! - Add, update and delete orchestration that never touches the key files
//!   of uninvolved nodes

pub mod chart;
pub mod cluster;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;
pub mod staging;
pub mod topology;

pub use chart::{ChartInstaller, ChartValues, RecordingChartInstaller};
pub use cluster::{MemoryCluster, NodeStatus, PodAccess};
pub use config::DeployConfig;
pub use error::{ClusterError, DeployError, PipelineError};
pub use lifecycle::{
    Collaborators, LifecycleOperation, OperationReport, Orchestrator, TlsRotation, UpdateOptions,
};
pub use pipeline::{Pipeline, PipelineOutcome, RetryPolicy, Step};
pub use registry::{NodeRecord, NodeRegistry};
pub use topology::{AccountId, NetworkTopology, TopologyRenderer};
