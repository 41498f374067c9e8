/// Easy VM Cluster - 公共库
///
/// 提供集群编排各模块共享的类型、错误处理、元数据编解码和工具函数

pub mod errors;
pub mod metadata;
pub mod models;
pub mod utils;

// 重新导出常用类型
pub use errors::{Error, Result};
pub use models::{Cluster, ClusterSpec, Image, ImageClass, Instance, InstanceState, Network, Role};
