/// 集群编排
///
/// 创建：幂等检查 → 基础镜像 → 网络 → 按控制节点、工作节点顺序并发启动实例。
/// 删除：逐个实例串行清理，遇到第一个错误即中止。

use common::models::{Cluster, ClusterSpec, Instance, Network};
use common::{Error, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::registry::ClusterRegistry;
use crate::hypervisor::VirtBackend;
use crate::instance::{InstanceLifecycle, LaunchContext};
use crate::network::NetworkManager;
use crate::storage::{ImageStore, DISK_VOLUME, SEED_VOLUME};

/// 创建结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created(Cluster),
    /// 已有实例带有该集群名，未做任何改动
    AlreadyExists(Cluster),
}

impl CreateOutcome {
    pub fn cluster(&self) -> &Cluster {
        match self {
            CreateOutcome::Created(c) | CreateOutcome::AlreadyExists(c) => c,
        }
    }
}

pub struct ClusterOrchestrator {
    backend: Arc<dyn VirtBackend>,
    images: Arc<ImageStore>,
    networks: Arc<NetworkManager>,
    registry: Arc<ClusterRegistry>,
    default_network: Network,
}

impl ClusterOrchestrator {
    pub fn new(
        backend: Arc<dyn VirtBackend>,
        images: Arc<ImageStore>,
        networks: Arc<NetworkManager>,
        registry: Arc<ClusterRegistry>,
        default_network: Network,
    ) -> Self {
        Self {
            backend,
            images,
            networks,
            registry,
            default_network,
        }
    }

    pub async fn create(
        &self,
        spec: &ClusterSpec,
        lifecycle: &Arc<InstanceLifecycle>,
        cancel: &CancellationToken,
    ) -> Result<CreateOutcome> {
        spec.check()?;

        if let Some(existing) = self.registry.get(&spec.name).await? {
            info!("ℹ️ 集群 {} 已存在（{} 个实例），跳过创建", spec.name, existing.instances.len());
            return Ok(CreateOutcome::AlreadyExists(existing));
        }

        info!(
            "🚀 创建集群 {}: {} 个控制节点, {} 个工作节点",
            spec.name, spec.controllers, spec.workers
        );

        // 共享依赖在并发启动前解析一次
        let base = self.images.ensure_base(&spec.image).await?;
        let network = self.resolve_network(&spec.network).await?;
        let slot = self.registry.allocate_slot().await?;
        let ctx = Arc::new(LaunchContext {
            base,
            network,
            resources: spec.resources.clone(),
            public_key: spec.public_key.clone(),
            slot,
        });

        let tasks: Vec<_> = spec
            .members()
            .into_iter()
            .map(|plan| {
                let lifecycle = lifecycle.clone();
                let ctx = ctx.clone();
                let cancel = cancel.clone();
                let name = plan.name.clone();
                let handle =
                    tokio::spawn(async move { lifecycle.create(plan, &ctx, &cancel).await });
                (name, handle)
            })
            .collect();

        let (names, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        let mut instances: Vec<Instance> = Vec::with_capacity(results.len());
        let mut first_error: Option<Error> = None;
        for (name, joined) in names.into_iter().zip(results) {
            let result = joined
                .map_err(|e| Error::Internal(format!("实例 {} 的任务异常退出: {}", name, e)))
                .and_then(|r| r);
            match result {
                Ok(instance) => instances.push(instance),
                Err(e) => {
                    error!(instance = %name, "❌ 实例创建失败: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            warn!(
                "⚠️ 集群 {} 部分创建失败，已创建的资源保留，可通过 delete 后重新创建",
                spec.name
            );
            return Err(e);
        }

        info!("✅ 集群 {} 创建完成", spec.name);
        Ok(CreateOutcome::Created(Cluster {
            name: spec.name.clone(),
            instances,
        }))
    }

    /// 按名称查找网络；若是默认网络且不存在则创建
    async fn resolve_network(&self, name: &str) -> Result<Network> {
        if let Some(network) = self.networks.resolve(name).await? {
            return Ok(network);
        }
        if name == self.default_network.name {
            return self.networks.ensure_default(&self.default_network).await;
        }
        Err(Error::NotFound(format!("网络 {} 不存在", name)))
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        let instances = self.registry.instances(Some(name)).await?;
        if instances.is_empty() {
            warn!("⚠️ 集群 {} 不存在或已删除", name);
            return Ok(());
        }

        info!("🗑️ 删除集群 {}（{} 个实例）", name, instances.len());
        for instance in &instances {
            self.delete_instance(instance).await.map_err(|e| {
                error!(instance = %instance.name, "❌ 删除失败，中止: {}", e);
                e
            })?;
        }
        info!("✅ 集群 {} 已删除", name);
        Ok(())
    }

    async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        for snapshot in self.backend.list_snapshots(&instance.name).await? {
            self.backend.delete_snapshot(&instance.name, &snapshot.name).await?;
        }

        match self.backend.delete_domain(&instance.name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        for volume in [DISK_VOLUME, SEED_VOLUME] {
            if let Some(image) = self.images.find_instance_volume(&instance.name, volume).await? {
                self.images.delete(&image).await?;
            }
        }
        info!(instance = %instance.name, "🗑️ 实例已删除");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Cluster>> {
        self.registry.clusters().await
    }
}
