/// Easy VM Cloud - easyvm
///
/// 在本机 libvirt 上创建 Kubernetes 虚拟机集群，并可选地完成 kubeadm 引导

use anyhow::{bail, Context};
use clap::Parser;
use common::models::{
    Cluster, ClusterSpec, ImageClass, ImageSource, ImageSpec, Network, NetworkType, Resources,
};
use common::utils::{expand_tilde, format_bytes};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod bootstrap;
mod cli;
mod cluster;
mod config;
mod hypervisor;
mod instance;
mod inventory;
mod network;
mod node;
mod playbook;
mod snapshot;
mod ssh;
mod storage;
mod wait;

#[cfg(test)]
mod testing;

use bootstrap::{ClusterCidrs, RemoteBootstrapper};
use cli::{
    Cli, ClusterCommand, ClusterCreateArgs, Commands, ImageCommand, NetworkCommand,
    SnapshotCommand,
};
use cluster::{ClusterOrchestrator, ClusterRegistry, CreateOutcome};
use crate::config::Config;
use hypervisor::{HypervisorManager, VirtBackend};
use instance::{GenIsoSeedBuilder, InstanceLifecycle, LifecycleSettings};
use network::NetworkManager;
use playbook::PlaybookRunner;
use snapshot::SnapshotManager;
use ssh::{KnownHosts, OpenSshExecutor, OpenSshProbe};
use storage::{HttpFetcher, ImageStore, QemuImg};

/// 各命令共享的对象
struct App {
    cfg: Config,
    backend: Arc<dyn VirtBackend>,
    images: Arc<ImageStore>,
    networks: Arc<NetworkManager>,
    registry: Arc<ClusterRegistry>,
}

impl App {
    fn connect(cfg: Config) -> anyhow::Result<Self> {
        info!("🔧 连接 libvirt: {}", cfg.libvirt_uri);
        let backend: Arc<dyn VirtBackend> = Arc::new(HypervisorManager::new(&cfg.libvirt_uri)?);
        let images = Arc::new(ImageStore::new(
            backend.clone(),
            Arc::new(QemuImg),
            Arc::new(HttpFetcher::new()?),
            cfg.image_root.clone(),
            cfg.pool_namespace.clone(),
        ));
        let networks = Arc::new(NetworkManager::new(backend.clone()));
        let registry = Arc::new(ClusterRegistry::new(backend.clone()));
        Ok(Self {
            cfg,
            backend,
            images,
            networks,
            registry,
        })
    }

    fn orchestrator(&self) -> anyhow::Result<ClusterOrchestrator> {
        Ok(ClusterOrchestrator::new(
            self.backend.clone(),
            self.images.clone(),
            self.networks.clone(),
            self.registry.clone(),
            self.cfg.default_network()?,
        ))
    }

    /// 只有创建实例时才需要宿主机平台信息
    fn lifecycle(&self) -> anyhow::Result<Arc<InstanceLifecycle>> {
        let platform = node::HostPlatform::detect(self.cfg.host_platform.as_deref())?;
        let machine = platform.machine_type()?;
        let emulator = node::find_emulator()?;
        node::check_kvm();
        info!("🖥️ 机器类型: {}, 模拟器: {}", machine, emulator.display());

        Ok(Arc::new(InstanceLifecycle::new(
            self.backend.clone(),
            self.images.clone(),
            Arc::new(GenIsoSeedBuilder),
            Arc::new(OpenSshProbe::new(
                self.cfg.ssh_user.clone(),
                self.cfg.identity(),
                self.cfg.ssh_connect_timeout_secs,
            )),
            Arc::new(KnownHosts::new(self.cfg.known_hosts())),
            LifecycleSettings::from_config(&self.cfg),
            machine,
            emulator,
        )))
    }

    fn bootstrapper(&self) -> RemoteBootstrapper {
        let executor = OpenSshExecutor::new(
            self.cfg.ssh_user.clone(),
            self.cfg.identity(),
            self.cfg.known_hosts(),
            self.cfg.ssh_connect_timeout_secs,
        );
        RemoteBootstrapper::new(
            Arc::new(executor),
            self.cfg.state_dir.clone(),
            self.cfg.kubeconfig(),
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let cfg = Config::from_env()?;

    // RUST_LOG 优先于配置中的 log_level
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("⚠️ 收到中断信号，不再启动新的操作");
                cancel.cancel();
            }
        });
    }

    let app = App::connect(cfg)?;
    match cli.command {
        Commands::Cluster(cmd) => run_cluster(&app, cmd, &cancel).await,
        Commands::Image(cmd) => run_image(&app, cmd).await,
        Commands::Network(cmd) => run_network(&app, cmd).await,
        Commands::Snapshot(cmd) => run_snapshot(&app, cmd).await,
    }
}

async fn run_cluster(app: &App, cmd: ClusterCommand, cancel: &CancellationToken) -> anyhow::Result<()> {
    match cmd {
        ClusterCommand::Create(args) => create_cluster(app, args, cancel).await,
        ClusterCommand::Delete { name } => {
            app.orchestrator()?.delete(&name).await?;
            Ok(())
        }
        ClusterCommand::List => {
            let clusters = app.orchestrator()?.list().await?;
            print_clusters(&clusters);
            Ok(())
        }
    }
}

async fn create_cluster(
    app: &App,
    args: ClusterCreateArgs,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let cfg = &app.cfg;
    let key_path = expand_tilde(&args.publickey);
    let public_key = tokio::fs::read_to_string(&key_path)
        .await
        .with_context(|| format!("无法读取公钥 {}", key_path.display()))?;

    let image_name = args.image.as_deref().unwrap_or(&cfg.default_image_name);
    let spec = ClusterSpec {
        name: args.name.clone(),
        suffix: args.suffix.clone(),
        controllers: args.controller,
        workers: args.worker,
        resources: Resources::new(args.cpu, &args.memory, &args.disk)?,
        image: cfg.image_spec(image_name),
        network: args
            .network
            .clone()
            .unwrap_or_else(|| cfg.default_network_name.clone()),
        public_key: public_key.trim().to_string(),
    };

    let lifecycle = app.lifecycle()?;
    let outcome = match app.orchestrator()?.create(&spec, &lifecycle, cancel).await {
        Ok(outcome) => outcome,
        Err(e) => {
            for member in spec.members() {
                let state = lifecycle.progress().get(&member.name).await;
                warn!(
                    instance = %member.name,
                    "实例停在 {}",
                    state.map(|s| s.as_str()).unwrap_or("pending")
                );
            }
            return Err(e.into());
        }
    };
    if let CreateOutcome::AlreadyExists(c) = &outcome {
        warn!("⚠️ 集群 {} 已存在，沿用现有实例", c.name);
    }
    let cluster = outcome.cluster();
    print_clusters(std::slice::from_ref(cluster));

    if args.exec {
        let (pod, service) = app.registry.cluster_cidrs(&spec.name).await?;
        let report = app
            .bootstrapper()
            .bootstrap(cluster, ClusterCidrs { pod, service }, cancel)
            .await?;
        if !report.is_complete() {
            for (node, reason) in &report.failures {
                error!(node = %node, "❌ {}", reason);
            }
            bail!(
                "集群 {} 引导未完成: {} 个节点失败",
                spec.name,
                report.failures.len()
            );
        }
        info!(
            "✅ 集群 {} 引导完成，控制平面 {}，kubeconfig 已合并到 {}",
            spec.name,
            report.control_plane,
            cfg.kubeconfig().display()
        );
    }

    if let Some(dest) = &args.inventory {
        let artifacts = cfg.state_dir.join(&spec.name);
        inventory::write(cluster, &spec.suffix, &artifacts, dest).await?;
    }

    if let Some(location) = &args.gitlocation {
        let runner = PlaybookRunner::new(cfg.kubespray_repo.clone(), &cfg.state_dir);
        runner.clone_playbooks(location).await?;
        if let (true, Some(inventory)) = (args.run, &args.inventory) {
            if cancel.is_cancelled() {
                bail!("操作已取消");
            }
            runner.run_playbook(inventory, location).await?;
        }
    }
    Ok(())
}

fn print_clusters(clusters: &[Cluster]) {
    println!("{:<16} {:<36} {:<12} {}", "CLUSTER", "INSTANCE", "ROLE", "IP");
    for cluster in clusters {
        for instance in &cluster.instances {
            let ip = instance
                .primary_ip()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "not allocated yet".to_string());
            println!(
                "{:<16} {:<36} {:<12} {}",
                cluster.name,
                instance.name,
                instance.role.as_str(),
                ip
            );
        }
    }
}

async fn run_image(app: &App, cmd: ImageCommand) -> anyhow::Result<()> {
    match cmd {
        ImageCommand::Create {
            name,
            distribution,
            url,
            path,
        } => {
            let source = match (url, path) {
                (Some(url), _) => ImageSource::url(url),
                (None, Some(path)) => ImageSource::file(path.display().to_string()),
                (None, None) if name == app.cfg.default_image_name => {
                    app.cfg.image_spec(&name).source
                }
                (None, None) => bail!("镜像 {} 需要指定 --url 或 --path", name),
            };
            let image = app
                .images
                .ensure_base(&ImageSpec {
                    name,
                    distribution,
                    source,
                })
                .await?;
            println!("{}", image.path.display());
        }
        ImageCommand::List => {
            println!("{:<24} {:<16} {:<12} {}", "NAME", "DISTRIBUTION", "SIZE", "PATH");
            for image in app.images.list(ImageClass::Distribution).await? {
                let size = match app.images.info(&image).await {
                    Ok(info) => format_bytes(info.virtual_size),
                    Err(e) => {
                        warn!("⚠️ 无法读取 {} 的容量: {}", image.name, e);
                        "-".to_string()
                    }
                };
                println!(
                    "{:<24} {:<16} {:<12} {}",
                    image.name,
                    image.owner,
                    size,
                    image.path.display()
                );
            }
        }
        ImageCommand::Delete { name, distribution } => {
            let image = app
                .images
                .resolve_base(&name, &distribution)
                .await?
                .ok_or_else(|| common::Error::NotFound(format!("镜像 {}/{}", distribution, name)))?;
            app.images.delete(&image).await?;
        }
    }
    Ok(())
}

async fn run_network(app: &App, cmd: NetworkCommand) -> anyhow::Result<()> {
    match cmd {
        NetworkCommand::Create {
            name,
            subnet,
            gateway,
            dnsserver,
            dhcp,
            network_type,
        } => {
            let network_type: NetworkType = network_type.parse()?;
            let spec = Network::from_request(
                &name,
                network_type,
                &subnet,
                gateway.as_deref(),
                dnsserver.as_deref(),
                dhcp,
            )?;
            app.networks.create(&spec).await?;
        }
        NetworkCommand::List => {
            println!(
                "{:<16} {:<8} {:<18} {:<16} {:<6} {}",
                "NAME", "TYPE", "SUBNET", "GATEWAY", "DHCP", "ACTIVE"
            );
            for net in app.networks.list().await? {
                println!(
                    "{:<16} {:<8} {:<18} {:<16} {:<6} {}",
                    net.name,
                    net.network_type.as_str(),
                    net.subnet.to_string(),
                    net.gateway.to_string(),
                    net.dhcp,
                    net.active
                );
            }
        }
        NetworkCommand::Delete { name } => app.networks.delete(&name).await?,
    }
    Ok(())
}

async fn run_snapshot(app: &App, cmd: SnapshotCommand) -> anyhow::Result<()> {
    let snapshots = SnapshotManager::new(app.backend.clone(), app.registry.clone());
    match cmd {
        SnapshotCommand::Create { cluster } => {
            for name in snapshots.create(&cluster).await? {
                println!("{}", name);
            }
        }
        SnapshotCommand::List { cluster } => {
            println!("{:<36} {:<52} {}", "INSTANCE", "SNAPSHOT", "CURRENT");
            for entry in snapshots.list(&cluster).await? {
                println!("{:<36} {:<52} {}", entry.instance, entry.name, entry.current);
            }
        }
        SnapshotCommand::Revert { cluster } => {
            snapshots.revert(&cluster).await?;
        }
    }
    Ok(())
}
