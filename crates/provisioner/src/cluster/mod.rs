/// 集群编排与查询

pub mod orchestrator;
pub mod registry;

pub use orchestrator::{ClusterOrchestrator, CreateOutcome};
pub use registry::ClusterRegistry;
