/// 实例生命周期
///
/// 单个实例从无到可 SSH 登录的全过程：
/// Pending → DiskDerived → SeedReady → DomainDefined → Booted → IpAssigned → SshReady
///
/// 每一步都可重入：已存在的根盘、种子卷和虚拟机定义会被直接复用，
/// 中途失败后重新执行不会重复创建资源。失败时不回滚，已创建的资源保留。

use common::metadata::{AddressTag, InstanceTag, ADDRESS_NS};
use common::models::{Image, Instance, InstanceState, Network, Resources};
use common::{Error, Result};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::seed::{SeedBuilder, SeedRequest};
use crate::hypervisor::domain_xml::{generate_domain_xml, DomainConfig};
use crate::hypervisor::VirtBackend;
use crate::ssh::{wait_for_ssh, KnownHosts, SshProbe};
use crate::storage::image_store::{ImageStore, SEED_VOLUME};
use crate::wait::{wait_until, RetryPolicy};

/// 等待参数
#[derive(Debug, Clone, Copy)]
pub struct LifecycleSettings {
    pub ip_poll_interval: Duration,
    pub ip_wait_timeout: Duration,
    pub ssh_policy: RetryPolicy,
}

impl LifecycleSettings {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            ip_poll_interval: cfg.ip_poll_interval(),
            ip_wait_timeout: cfg.ip_wait_timeout(),
            ssh_policy: RetryPolicy {
                max_attempts: cfg.ssh_max_attempts,
                interval: cfg.ssh_retry_interval(),
            },
        }
    }
}

/// 一次集群创建中所有实例共享的参数
#[derive(Debug, Clone)]
pub struct LaunchContext {
    pub base: Image,
    pub network: Network,
    pub resources: Resources,
    pub public_key: String,
    /// 集群网段槽位，写入每个实例的归属标签
    pub slot: u32,
}

/// 各实例当前所处的状态
#[derive(Debug, Clone, Default)]
pub struct ProgressBoard {
    inner: Arc<RwLock<HashMap<String, InstanceState>>>,
}

impl ProgressBoard {
    pub async fn set(&self, instance: &str, state: InstanceState) {
        self.inner.write().await.insert(instance.to_string(), state);
        debug!(instance = %instance, state = %state, "状态迁移");
    }

    pub async fn get(&self, instance: &str) -> Option<InstanceState> {
        self.inner.read().await.get(instance).copied()
    }
}

pub struct InstanceLifecycle {
    backend: Arc<dyn VirtBackend>,
    images: Arc<ImageStore>,
    seeds: Arc<dyn SeedBuilder>,
    probe: Arc<dyn SshProbe>,
    known_hosts: Arc<KnownHosts>,
    settings: LifecycleSettings,
    machine: String,
    emulator: PathBuf,
    progress: ProgressBoard,
}

impl InstanceLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn VirtBackend>,
        images: Arc<ImageStore>,
        seeds: Arc<dyn SeedBuilder>,
        probe: Arc<dyn SshProbe>,
        known_hosts: Arc<KnownHosts>,
        settings: LifecycleSettings,
        machine: impl Into<String>,
        emulator: PathBuf,
    ) -> Self {
        Self {
            backend,
            images,
            seeds,
            probe,
            known_hosts,
            settings,
            machine: machine.into(),
            emulator,
            progress: ProgressBoard::default(),
        }
    }

    pub fn progress(&self) -> &ProgressBoard {
        &self.progress
    }

    /// 把一个规划中的实例推进到 SSH 可用
    pub async fn create(
        &self,
        plan: Instance,
        ctx: &LaunchContext,
        cancel: &CancellationToken,
    ) -> Result<Instance> {
        let name = plan.name.clone();
        self.progress.set(&name, InstanceState::Pending).await;
        info!(instance = %name, role = %plan.role, "🚀 开始创建实例");

        let disk = self
            .images
            .derive_instance_disk(&name, &ctx.base, &ctx.resources.disk)
            .await?;
        self.progress.set(&name, InstanceState::DiskDerived).await;

        let seed = self.ensure_seed(&name, ctx).await?;
        self.progress.set(&name, InstanceState::SeedReady).await;

        self.ensure_domain(&plan, ctx, &disk, &seed).await?;
        self.progress.set(&name, InstanceState::DomainDefined).await;

        check_cancelled(cancel, &name)?;
        self.backend.start_domain(&name).await?;
        self.progress.set(&name, InstanceState::Booted).await;

        let ip = self.wait_for_address(&name, &ctx.network, cancel).await?;
        self.backend
            .set_domain_metadata(&name, &AddressTag { ip }.to_xml(), ADDRESS_NS)
            .await?;
        self.progress.set(&name, InstanceState::IpAssigned).await;
        info!(instance = %name, ip = %ip, "📡 已分配地址");

        wait_for_ssh(
            self.probe.as_ref(),
            &self.known_hosts,
            ip,
            self.settings.ssh_policy,
            cancel,
        )
        .await?;
        self.progress.set(&name, InstanceState::SshReady).await;
        info!(instance = %name, "✅ 实例就绪");

        Ok(Instance {
            ip_addresses: vec![ip],
            active: true,
            ..plan
        })
    }

    async fn ensure_seed(&self, name: &str, ctx: &LaunchContext) -> Result<Image> {
        if let Some(existing) = self.images.find_instance_volume(name, SEED_VOLUME).await? {
            debug!(instance = %name, "种子卷已存在，跳过生成");
            return Ok(existing);
        }

        let dest = self.images.prepare_instance_volume(name, SEED_VOLUME).await?;
        let request = SeedRequest {
            hostname: name.to_string(),
            public_key: ctx.public_key.clone(),
            dns_server: ctx.network.dns_server,
        };
        self.seeds.build(&request, &dest).await?;
        self.images.register_instance_volume(name, SEED_VOLUME).await
    }

    async fn ensure_domain(
        &self,
        plan: &Instance,
        ctx: &LaunchContext,
        disk: &Image,
        seed: &Image,
    ) -> Result<()> {
        let defined = self
            .backend
            .list_domains()
            .await?
            .iter()
            .any(|d| d.name == plan.name);
        if defined {
            debug!(instance = %plan.name, "虚拟机已定义，跳过");
            return Ok(());
        }

        let xml = generate_domain_xml(&DomainConfig {
            name: plan.name.clone(),
            vcpu: ctx.resources.vcpu,
            memory_bytes: ctx.resources.memory_bytes,
            machine: self.machine.clone(),
            emulator: self.emulator.clone(),
            seed_path: seed.path.clone(),
            disk_path: disk.path.clone(),
            backing_path: ctx.base.path.clone(),
            network: ctx.network.name.clone(),
            tag: InstanceTag {
                cluster: plan.cluster.clone(),
                suffix: plan.suffix.clone(),
                role: plan.role,
                slot: ctx.slot,
            },
        })?;
        self.backend.define_domain(&xml).await
    }

    /// 轮询网卡地址，优先取落在网络子网内的地址
    async fn wait_for_address(
        &self,
        name: &str,
        network: &Network,
        cancel: &CancellationToken,
    ) -> Result<Ipv4Addr> {
        let operation = format!("等待 {} 分配地址", name);
        wait_until(
            &operation,
            self.settings.ip_poll_interval,
            self.settings.ip_wait_timeout,
            cancel,
            || async {
                let addrs = self.backend.interface_addresses(name).await?;
                Ok(pick_address(&addrs, network))
            },
        )
        .await
    }
}

fn pick_address(addrs: &[Ipv4Addr], network: &Network) -> Option<Ipv4Addr> {
    addrs
        .iter()
        .find(|a| network.subnet.contains(**a))
        .or_else(|| addrs.first())
        .copied()
}

fn check_cancelled(cancel: &CancellationToken, name: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(format!("创建 {}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeProbe, Harness, ProbeStep};
    use common::models::{NetworkType, Role};

    fn plan() -> Instance {
        Instance::planned(Role::Worker, 0, "demo", "local")
    }

    #[test]
    fn test_pick_address_prefers_subnet() {
        let net =
            Network::from_request("easyvm", NetworkType::Bridge, "192.168.66.0/24", None, None, true)
                .unwrap();
        let other = Ipv4Addr::new(172, 17, 0, 1);
        let inside = Ipv4Addr::new(192, 168, 66, 23);
        assert_eq!(pick_address(&[other, inside], &net), Some(inside));
        assert_eq!(pick_address(&[other], &net), Some(other));
        assert_eq!(pick_address(&[], &net), None);
    }

    #[tokio::test]
    async fn test_create_reaches_ssh_ready() {
        let h = Harness::new(FakeProbe::ready());
        let ctx = h.launch_context().await;
        let name = plan().name.clone();
        h.backend.assign_address_after(&name, 2, Ipv4Addr::new(192, 168, 66, 20));

        let instance = h
            .lifecycle
            .create(plan(), &ctx, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(instance.primary_ip(), Some(Ipv4Addr::new(192, 168, 66, 20)));
        assert!(instance.active);
        assert_eq!(
            h.lifecycle.progress().get(&name).await,
            Some(InstanceState::SshReady)
        );

        let xml = h.backend.domain_xml(&name).unwrap();
        let tag = InstanceTag::from_domain_xml(&xml).unwrap().unwrap();
        assert_eq!(tag.cluster, "demo");
        assert_eq!(tag.role, Role::Worker);
        assert_eq!(tag.slot, ctx.slot);
        let addr = AddressTag::from_domain_xml(&xml).unwrap().unwrap();
        assert_eq!(addr.ip, Ipv4Addr::new(192, 168, 66, 20));
        assert!(h.backend.is_running(&name));

        let kh = tokio::fs::read_to_string(h.known_hosts.path()).await.unwrap();
        assert!(kh.contains("192.168.66.20"));
    }

    #[tokio::test]
    async fn test_create_twice_reuses_resources() {
        let h = Harness::new(FakeProbe::ready());
        let ctx = h.launch_context().await;
        let name = plan().name.clone();
        h.backend.assign_address_after(&name, 0, Ipv4Addr::new(192, 168, 66, 21));

        h.lifecycle.create(plan(), &ctx, &CancellationToken::new()).await.unwrap();
        h.lifecycle.create(plan(), &ctx, &CancellationToken::new()).await.unwrap();

        assert_eq!(h.disk_tool.overlays_created(), 1);
        assert_eq!(h.seeds.builds(), 1);
        assert_eq!(h.backend.domain_defines(), 1);
    }

    #[tokio::test]
    async fn test_address_timeout_leaves_domain_booted() {
        let h = Harness::new(FakeProbe::ready());
        let ctx = h.launch_context().await;
        let name = plan().name.clone();

        let err = h
            .lifecycle
            .create(plan(), &ctx, &CancellationToken::new())
            .await;

        assert!(matches!(err, Err(Error::Timeout(_))));
        assert_eq!(h.lifecycle.progress().get(&name).await, Some(InstanceState::Booted));
        // 不回滚
        assert!(h.backend.domain_xml(&name).is_some());
    }

    #[tokio::test]
    async fn test_auth_failure_stops_at_ip_assigned() {
        let h = Harness::new(FakeProbe::scripted(vec![ProbeStep::AuthDenied]));
        let ctx = h.launch_context().await;
        let name = plan().name.clone();
        h.backend.assign_address_after(&name, 0, Ipv4Addr::new(192, 168, 66, 22));

        let err = h
            .lifecycle
            .create(plan(), &ctx, &CancellationToken::new())
            .await;

        assert!(matches!(err, Err(Error::Authentication(_))));
        assert_eq!(
            h.lifecycle.progress().get(&name).await,
            Some(InstanceState::IpAssigned)
        );
    }

    #[tokio::test]
    async fn test_cancelled_before_boot() {
        let h = Harness::new(FakeProbe::ready());
        let ctx = h.launch_context().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = h.lifecycle.create(plan(), &ctx, &cancel).await;
        assert!(matches!(err, Err(Error::Cancelled(_))));
        assert!(!h.backend.is_running(&plan().name));
    }
}
