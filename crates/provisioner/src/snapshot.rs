/// 集群快照
///
/// 集群快照即对每个成员虚拟机各做一个快照，快照名为 `<实例名>-<时间戳>`

use chrono::{DateTime, Utc};
use common::{Error, Result};
use std::sync::Arc;
use tracing::info;

use crate::cluster::ClusterRegistry;
use crate::hypervisor::VirtBackend;

/// 快照列表中的一行
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub instance: String,
    pub name: String,
    pub current: bool,
}

pub struct SnapshotManager {
    backend: Arc<dyn VirtBackend>,
    registry: Arc<ClusterRegistry>,
}

pub fn snapshot_name(instance: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}", instance, at.format("%Y%m%d%H%M%S"))
}

impl SnapshotManager {
    pub fn new(backend: Arc<dyn VirtBackend>, registry: Arc<ClusterRegistry>) -> Self {
        Self { backend, registry }
    }

    async fn members(&self, cluster: &str) -> Result<Vec<String>> {
        let instances = self.registry.instances(Some(cluster)).await?;
        if instances.is_empty() {
            return Err(Error::NotFound(format!("集群 {} 不存在", cluster)));
        }
        Ok(instances.into_iter().map(|i| i.name).collect())
    }

    /// 为每个成员创建快照，返回快照名
    pub async fn create(&self, cluster: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut created = Vec::new();
        for instance in self.members(cluster).await? {
            let name = snapshot_name(&instance, now);
            self.backend.create_snapshot(&instance, &name).await?;
            info!("📸 已创建快照 {}", name);
            created.push(name);
        }
        Ok(created)
    }

    pub async fn list(&self, cluster: &str) -> Result<Vec<SnapshotEntry>> {
        let mut entries = Vec::new();
        for instance in self.members(cluster).await? {
            for snap in self.backend.list_snapshots(&instance).await? {
                entries.push(SnapshotEntry {
                    instance: instance.clone(),
                    name: snap.name,
                    current: snap.current,
                });
            }
        }
        Ok(entries)
    }

    /// 每个成员回滚到各自的当前快照
    pub async fn revert(&self, cluster: &str) -> Result<Vec<String>> {
        let mut reverted = Vec::new();
        for instance in self.members(cluster).await? {
            let snap = self.backend.revert_current_snapshot(&instance).await?;
            info!("⏪ {} 已回滚到 {}", instance, snap);
            reverted.push(snap);
        }
        Ok(reverted)
    }
}
