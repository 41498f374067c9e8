/// Kubernetes 引导：节点命令、分阶段执行、kubeconfig 合并

pub mod commands;
pub mod kubeconfig;
pub mod runner;

pub use runner::{ClusterCidrs, RemoteBootstrapper};
