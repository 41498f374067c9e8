/// 命令行定义

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// 在单台 KVM 宿主机上创建和管理 Kubernetes 虚拟机集群
#[derive(Parser)]
#[command(name = "easyvm", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 集群管理
    #[command(subcommand)]
    Cluster(ClusterCommand),
    /// 发行版镜像管理
    #[command(subcommand)]
    Image(ImageCommand),
    /// 虚拟网络管理
    #[command(subcommand)]
    Network(NetworkCommand),
    /// 集群快照
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
}

#[derive(Subcommand)]
pub enum ClusterCommand {
    /// 创建集群
    Create(ClusterCreateArgs),
    /// 删除集群及其全部磁盘、快照
    Delete { name: String },
    /// 列出集群与实例
    List,
}

#[derive(Args)]
pub struct ClusterCreateArgs {
    pub name: String,

    /// 工作节点数量
    #[arg(long, default_value_t = 0)]
    pub worker: u32,

    /// 控制节点数量
    #[arg(long, default_value_t = 1)]
    pub controller: u32,

    /// 实例名后缀
    #[arg(long, default_value = "local")]
    pub suffix: String,

    /// 基础镜像名，默认取配置中的 default_image_name
    #[arg(long)]
    pub image: Option<String>,

    /// 网络名，默认取配置中的默认网络
    #[arg(long)]
    pub network: Option<String>,

    #[arg(long, default_value = "12G")]
    pub memory: String,

    #[arg(long, default_value_t = 4)]
    pub cpu: u32,

    #[arg(long, default_value = "10G")]
    pub disk: String,

    /// 注入实例的公钥文件
    #[arg(long, default_value = "~/.ssh/id_rsa.pub")]
    pub publickey: String,

    /// 生成 kubespray 清单到该路径
    #[arg(long)]
    pub inventory: Option<PathBuf>,

    /// kubespray 代码目录，不存在时自动克隆
    #[arg(long)]
    pub gitlocation: Option<PathBuf>,

    /// 用生成的清单执行 kubespray
    #[arg(long, requires_all = ["inventory", "gitlocation"])]
    pub run: bool,

    /// 通过 SSH 直接用 kubeadm 引导集群
    #[arg(long, conflicts_with = "run")]
    pub exec: bool,
}

#[derive(Subcommand)]
pub enum ImageCommand {
    /// 下载或导入发行版镜像
    Create {
        name: String,
        #[arg(long, default_value = "ubuntu")]
        distribution: String,
        #[arg(long, conflicts_with = "path")]
        url: Option<String>,
        /// 本地镜像文件
        #[arg(long)]
        path: Option<PathBuf>,
    },
    List,
    Delete {
        name: String,
        #[arg(long)]
        distribution: String,
    },
}

#[derive(Subcommand)]
pub enum NetworkCommand {
    Create {
        name: String,
        #[arg(long)]
        subnet: String,
        #[arg(long)]
        gateway: Option<String>,
        #[arg(long)]
        dnsserver: Option<String>,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        dhcp: bool,
        /// bridge 或 ovs
        #[arg(long = "type", default_value = "bridge")]
        network_type: String,
    },
    List,
    Delete { name: String },
}

#[derive(Subcommand)]
pub enum SnapshotCommand {
    /// 为集群每个成员创建快照
    Create { cluster: String },
    List { cluster: String },
    /// 回滚到当前快照
    Revert { cluster: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_create_defaults() {
        let cli = Cli::try_parse_from(["easyvm", "cluster", "create", "demo"]).unwrap();
        let Commands::Cluster(ClusterCommand::Create(args)) = cli.command else {
            panic!("expected cluster create");
        };
        assert_eq!(args.name, "demo");
        assert_eq!(args.worker, 0);
        assert_eq!(args.controller, 1);
        assert_eq!(args.suffix, "local");
        assert_eq!(args.memory, "12G");
        assert_eq!(args.cpu, 4);
        assert_eq!(args.disk, "10G");
        assert_eq!(args.publickey, "~/.ssh/id_rsa.pub");
        assert!(!args.run && !args.exec);
    }

    #[test]
    fn test_run_requires_inventory_and_gitlocation() {
        assert!(Cli::try_parse_from(["easyvm", "cluster", "create", "demo", "--run"]).is_err());
        assert!(Cli::try_parse_from([
            "easyvm", "cluster", "create", "demo", "--run", "--inventory", "/tmp/inv.yaml",
            "--gitlocation", "/tmp/kubespray",
        ])
        .is_ok());
    }

    #[test]
    fn test_network_create_flags() {
        let cli = Cli::try_parse_from([
            "easyvm", "network", "create", "lab", "--subnet", "10.10.0.0/24", "--dhcp", "false",
            "--type", "ovs",
        ])
        .unwrap();
        let Commands::Network(NetworkCommand::Create { dhcp, network_type, gateway, .. }) =
            cli.command
        else {
            panic!("expected network create");
        };
        assert!(!dhcp);
        assert_eq!(network_type, "ovs");
        assert!(gateway.is_none());
    }
}
