//! 测试用的内存实现
//!
//! 每个外部依赖（libvirt、qemu-img、下载、ISO 打包、SSH）都有一个可编排的替身，
//! `Harness` 把它们装配成与生产环境相同的对象图。

use async_trait::async_trait;
use common::models::{ClusterSpec, ImageSource, ImageSpec, Resources};
use common::{Error, Result};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cluster::{ClusterOrchestrator, ClusterRegistry};
use crate::config::{test_config, Config};
use crate::hypervisor::{
    DomainRecord, NetworkRecord, PoolInfo, SnapshotRecord, VirtBackend, VolumeInfo,
};
use crate::instance::{InstanceLifecycle, LaunchContext, LifecycleSettings, SeedBuilder, SeedRequest};
use crate::network::NetworkManager;
use crate::ssh::{KnownHosts, RemoteExecutor, SshProbe};
use crate::storage::qemu_img::DiskInfo;
use crate::storage::{DiskTool, ImageFetcher, ImageStore};
use crate::wait::RetryPolicy;

pub const TEST_KEY: &str = "ssh-ed25519 AAAAC3NzaTest operator@host";

// ---------------------------------------------------------------------------
// VirtBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct FakeDomain {
    xml: String,
    metadata: BTreeMap<String, String>,
    running: bool,
    snapshots: Vec<SnapshotRecord>,
}

impl FakeDomain {
    /// 定义 XML 加上后写入的元数据
    fn render(&self) -> String {
        if self.metadata.is_empty() {
            return self.xml.clone();
        }
        let extra: String = self.metadata.values().cloned().collect();
        if self.xml.contains("</metadata>") {
            self.xml.replacen("</metadata>", &format!("{}</metadata>", extra), 1)
        } else {
            self.xml
                .replacen("</domain>", &format!("<metadata>{}</metadata></domain>", extra), 1)
        }
    }
}

#[derive(Default)]
struct BackendState {
    pools: BTreeMap<String, PathBuf>,
    networks: BTreeMap<String, (String, bool)>,
    network_defines: usize,
    domains: BTreeMap<String, FakeDomain>,
    domain_defines: usize,
    /// 实例名 → (剩余空轮询次数, 地址)
    address_plans: HashMap<String, (u32, Ipv4Addr)>,
    fail_volume_deletes: bool,
}

/// 存储池映射到真实目录，其余对象保存在内存
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<BackendState>,
}

fn not_found(what: &str, name: &str) -> Error {
    Error::NotFound(format!("{} {} 不存在", what, name))
}

fn xml_name(xml: &str) -> Result<String> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| Error::Hypervisor(format!("XML 无效: {}", e)))?;
    doc.root_element()
        .children()
        .find(|n| n.has_tag_name("name"))
        .and_then(|n| n.text())
        .map(str::to_string)
        .ok_or_else(|| Error::Hypervisor("XML 缺少 name".to_string()))
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, BackendState> {
        self.state.lock().unwrap()
    }

    pub fn has_pool(&self, name: &str) -> bool {
        self.state().pools.contains_key(name)
    }

    pub fn fail_volume_deletes(&self, fail: bool) {
        self.state().fail_volume_deletes = fail;
    }

    pub fn network_defines(&self) -> usize {
        self.state().network_defines
    }

    pub fn insert_network(&self, name: &str, xml: &str) {
        self.state().networks.insert(name.to_string(), (xml.to_string(), true));
    }

    pub fn domain_defines(&self) -> usize {
        self.state().domain_defines
    }

    pub fn insert_domain(&self, name: &str, xml: &str, running: bool) {
        self.state().domains.insert(
            name.to_string(),
            FakeDomain {
                xml: xml.to_string(),
                running,
                ..Default::default()
            },
        );
    }

    pub fn domain_xml(&self, name: &str) -> Option<String> {
        self.state().domains.get(name).map(FakeDomain::render)
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state().domains.get(name).is_some_and(|d| d.running)
    }

    /// 前 `empty_polls` 次查询返回空，之后返回 ip
    pub fn assign_address_after(&self, name: &str, empty_polls: u32, ip: Ipv4Addr) {
        self.state()
            .address_plans
            .insert(name.to_string(), (empty_polls, ip));
    }
}

#[async_trait]
impl VirtBackend for FakeBackend {
    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        Ok(self
            .state()
            .pools
            .iter()
            .map(|(name, path)| PoolInfo {
                name: name.clone(),
                path: path.clone(),
                active: true,
            })
            .collect())
    }

    async fn define_pool(&self, name: &str, path: &Path) -> Result<()> {
        let mut state = self.state();
        if state.pools.contains_key(name) {
            return Err(Error::AlreadyExists(format!("存储池 {}", name)));
        }
        std::fs::create_dir_all(path)?;
        state.pools.insert(name.to_string(), path.to_path_buf());
        Ok(())
    }

    async fn refresh_pool(&self, name: &str) -> Result<()> {
        if self.has_pool(name) {
            Ok(())
        } else {
            Err(not_found("存储池", name))
        }
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        self.state()
            .pools
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("存储池", name))
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        let dir = self
            .state()
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| not_found("存储池", pool))?;
        let mut volumes = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                volumes.push(VolumeInfo {
                    name: entry.file_name().to_string_lossy().into_owned(),
                    path: entry.path(),
                });
            }
        }
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(volumes)
    }

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        let dir = {
            let state = self.state();
            if state.fail_volume_deletes {
                return Err(Error::Hypervisor(format!("无法删除存储卷 {}", volume)));
            }
            state.pools.get(pool).cloned().ok_or_else(|| not_found("存储池", pool))?
        };
        let path = dir.join(volume);
        if !path.is_file() {
            return Err(not_found("存储卷", volume));
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkRecord>> {
        Ok(self
            .state()
            .networks
            .iter()
            .map(|(name, (xml, active))| NetworkRecord {
                name: name.clone(),
                xml: xml.clone(),
                active: *active,
            })
            .collect())
    }

    async fn define_network(&self, xml: &str) -> Result<()> {
        let name = xml_name(xml)?;
        let mut state = self.state();
        state.networks.insert(name, (xml.to_string(), true));
        state.network_defines += 1;
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        self.state()
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("网络", name))
    }

    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        Ok(self
            .state()
            .domains
            .iter()
            .map(|(name, d)| DomainRecord {
                name: name.clone(),
                xml: d.render(),
                active: d.running,
            })
            .collect())
    }

    async fn define_domain(&self, xml: &str) -> Result<()> {
        let name = xml_name(xml)?;
        let mut state = self.state();
        let domain = state.domains.entry(name).or_default();
        domain.xml = xml.to_string();
        state.domain_defines += 1;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        let domain = state.domains.get_mut(name).ok_or_else(|| not_found("虚拟机", name))?;
        domain.running = true;
        Ok(())
    }

    async fn interface_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let mut state = self.state();
        if !state.domains.get(name).is_some_and(|d| d.running) {
            return Ok(Vec::new());
        }
        match state.address_plans.get_mut(name) {
            Some((remaining, _)) if *remaining > 0 => {
                *remaining -= 1;
                Ok(Vec::new())
            }
            Some((_, ip)) => Ok(vec![*ip]),
            None => Ok(Vec::new()),
        }
    }

    async fn set_domain_metadata(&self, name: &str, xml: &str, ns: &str) -> Result<()> {
        let mut state = self.state();
        let domain = state.domains.get_mut(name).ok_or_else(|| not_found("虚拟机", name))?;
        domain.metadata.insert(ns.to_string(), xml.to_string());
        Ok(())
    }

    async fn delete_domain(&self, name: &str) -> Result<()> {
        self.state()
            .domains
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found("虚拟机", name))
    }

    async fn create_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state();
        let d = state.domains.get_mut(domain).ok_or_else(|| not_found("虚拟机", domain))?;
        for s in d.snapshots.iter_mut() {
            s.current = false;
        }
        d.snapshots.push(SnapshotRecord {
            name: snapshot.to_string(),
            current: true,
        });
        Ok(())
    }

    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotRecord>> {
        self.state()
            .domains
            .get(domain)
            .map(|d| d.snapshots.clone())
            .ok_or_else(|| not_found("虚拟机", domain))
    }

    async fn revert_current_snapshot(&self, domain: &str) -> Result<String> {
        self.state()
            .domains
            .get(domain)
            .ok_or_else(|| not_found("虚拟机", domain))?
            .snapshots
            .iter()
            .find(|s| s.current)
            .map(|s| s.name.clone())
            .ok_or_else(|| not_found("当前快照", domain))
    }

    async fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        let mut state = self.state();
        let d = state.domains.get_mut(domain).ok_or_else(|| not_found("虚拟机", domain))?;
        let before = d.snapshots.len();
        d.snapshots.retain(|s| s.name != snapshot);
        if d.snapshots.len() == before {
            return Err(not_found("快照", snapshot));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// DiskTool / ImageFetcher / SeedBuilder
// ---------------------------------------------------------------------------

/// 记录每个增量盘的后端镜像
#[derive(Default)]
pub struct FakeDiskTool {
    overlays: Mutex<HashMap<PathBuf, PathBuf>>,
    created: AtomicUsize,
}

impl FakeDiskTool {
    pub fn backing_of(&self, path: &Path) -> Option<PathBuf> {
        self.overlays.lock().unwrap().get(path).cloned()
    }

    pub fn overlays_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiskTool for FakeDiskTool {
    async fn create_overlay(&self, base: &Path, target: &Path, _size: &str) -> Result<()> {
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(target, b"qcow2-overlay")?;
        self.overlays
            .lock()
            .unwrap()
            .insert(target.to_path_buf(), base.to_path_buf());
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn info(&self, path: &Path) -> Result<DiskInfo> {
        let size = std::fs::metadata(path)?.len();
        Ok(DiskInfo {
            virtual_size: 10 << 30,
            actual_size: size,
            format: "qcow2".to_string(),
            backing_filename: self.backing_of(path).map(|p| p.display().to_string()),
        })
    }
}

pub struct FakeFetcher {
    calls: AtomicUsize,
    write_file: AtomicBool,
}

impl Default for FakeFetcher {
    fn default() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            write_file: AtomicBool::new(true),
        }
    }
}

impl FakeFetcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// false 时假装成功但不落盘
    pub fn set_write_file(&self, write: bool) {
        self.write_file.store(write, Ordering::SeqCst);
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, _source: &ImageSource, dest: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.write_file.load(Ordering::SeqCst) {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(dest, b"qcow2-base")?;
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSeedBuilder {
    builds: AtomicUsize,
}

impl FakeSeedBuilder {
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SeedBuilder for FakeSeedBuilder {
    async fn build(&self, request: &SeedRequest, dest: &Path) -> Result<()> {
        std::fs::write(dest, format!("cidata:{}", request.hostname))?;
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SSH
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeStep {
    Refused,
    AuthDenied,
    Ready,
}

/// 每个主机独立按脚本推进，脚本用完后一律就绪
pub struct FakeProbe {
    script: Vec<ProbeStep>,
    attempts: Mutex<HashMap<Ipv4Addr, usize>>,
}

impl FakeProbe {
    pub fn scripted(script: Vec<ProbeStep>) -> Self {
        Self {
            script,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn ready() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn attempts(&self, host: Ipv4Addr) -> usize {
        self.attempts.lock().unwrap().get(&host).copied().unwrap_or(0)
    }
}

#[async_trait]
impl SshProbe for FakeProbe {
    async fn probe(&self, host: Ipv4Addr) -> Result<String> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(host).or_insert(0);
            *n += 1;
            *n - 1
        };
        match self.script.get(attempt).copied().unwrap_or(ProbeStep::Ready) {
            ProbeStep::Refused => Err(Error::Connectivity(format!("{}: Connection refused", host))),
            ProbeStep::AuthDenied => Err(Error::Authentication(format!("{}: Permission denied", host))),
            ProbeStep::Ready => Ok(format!("{} ssh-ed25519 AAAAfake{}\n", host, host.octets()[3])),
        }
    }
}

/// 一次远程调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecEvent {
    pub host: String,
    pub script: String,
}

/// 按调用顺序记录远程命令，按子串匹配返回预设输出或错误
#[derive(Default)]
pub struct FakeExecutor {
    events: Mutex<Vec<ExecEvent>>,
    responses: Mutex<Vec<(String, String)>>,
    failures: Mutex<Vec<(String, String, String)>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, pattern: &str, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), output.to_string()));
    }

    pub fn fail_on(&self, host: &str, pattern: &str, message: &str) {
        self.failures
            .lock()
            .unwrap()
            .push((host.to_string(), pattern.to_string(), message.to_string()));
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(&self, host: &str, commands: &[String]) -> Result<String> {
        let script = crate::ssh::remote::join_commands(commands);
        self.events.lock().unwrap().push(ExecEvent {
            host: host.to_string(),
            script: script.clone(),
        });
        // 让并发的节点有机会交错执行
        tokio::task::yield_now().await;

        let failure = self
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(h, p, _)| h == host && script.contains(p.as_str()))
            .map(|(_, _, msg)| msg.clone());
        if let Some(msg) = failure {
            return Err(Error::RemoteCommand(format!("{}: {}", host, msg)));
        }
        Ok(self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| script.contains(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// 装配
// ---------------------------------------------------------------------------

pub fn cluster_spec(name: &str, controllers: u32, workers: u32) -> ClusterSpec {
    ClusterSpec {
        name: name.to_string(),
        suffix: "local".to_string(),
        controllers,
        workers,
        resources: Resources::new(2, "1G", "10G").unwrap(),
        image: ImageSpec {
            name: "ubuntu2004".to_string(),
            distribution: "ubuntu".to_string(),
            source: ImageSource::url("https://example.invalid/focal.img"),
        },
        network: "easyvm".to_string(),
        public_key: TEST_KEY.to_string(),
    }
}

/// 与生产装配一致的对象图，外部依赖全部替换为内存实现
pub struct Harness {
    _dir: tempfile::TempDir,
    pub cfg: Config,
    pub backend: Arc<FakeBackend>,
    pub disk_tool: Arc<FakeDiskTool>,
    pub fetcher: Arc<FakeFetcher>,
    pub seeds: Arc<FakeSeedBuilder>,
    pub probe: Arc<FakeProbe>,
    pub known_hosts: Arc<KnownHosts>,
    pub images: Arc<ImageStore>,
    pub networks: Arc<NetworkManager>,
    pub registry: Arc<ClusterRegistry>,
    pub lifecycle: Arc<InstanceLifecycle>,
    pub orchestrator: ClusterOrchestrator,
}

impl Harness {
    pub fn new(probe: FakeProbe) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());

        let backend = Arc::new(FakeBackend::new());
        let disk_tool = Arc::new(FakeDiskTool::default());
        let fetcher = Arc::new(FakeFetcher::default());
        let seeds = Arc::new(FakeSeedBuilder::default());
        let probe = Arc::new(probe);
        let known_hosts = Arc::new(KnownHosts::new(cfg.known_hosts()));

        let images = Arc::new(ImageStore::new(
            backend.clone(),
            disk_tool.clone(),
            fetcher.clone(),
            cfg.image_root.clone(),
            cfg.pool_namespace.clone(),
        ));
        let networks = Arc::new(NetworkManager::new(backend.clone()));
        let registry = Arc::new(ClusterRegistry::new(backend.clone()));

        let settings = LifecycleSettings {
            ip_poll_interval: Duration::from_millis(5),
            ip_wait_timeout: Duration::from_millis(150),
            ssh_policy: RetryPolicy {
                max_attempts: 5,
                interval: Duration::from_millis(1),
            },
        };
        let lifecycle = Arc::new(InstanceLifecycle::new(
            backend.clone(),
            images.clone(),
            seeds.clone(),
            probe.clone(),
            known_hosts.clone(),
            settings,
            "pc-q35-focal",
            PathBuf::from("/usr/bin/qemu-system-x86_64"),
        ));
        let orchestrator = ClusterOrchestrator::new(
            backend.clone(),
            images.clone(),
            networks.clone(),
            registry.clone(),
            cfg.default_network().unwrap(),
        );

        Self {
            _dir: dir,
            cfg,
            backend,
            disk_tool,
            fetcher,
            seeds,
            probe,
            known_hosts,
            images,
            networks,
            registry,
            lifecycle,
            orchestrator,
        }
    }

    /// 准备好基础镜像与默认网络
    pub async fn launch_context(&self) -> LaunchContext {
        let base = self
            .images
            .ensure_base(&self.cfg.image_spec(&self.cfg.default_image_name))
            .await
            .unwrap();
        let network = self
            .networks
            .ensure_default(&self.cfg.default_network().unwrap())
            .await
            .unwrap();
        LaunchContext {
            base,
            network,
            resources: Resources::new(2, "1G", "10G").unwrap(),
            public_key: TEST_KEY.to_string(),
            slot: 0,
        }
    }
}
