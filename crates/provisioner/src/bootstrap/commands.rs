/// 引导过程中在节点上执行的命令

use common::models::{Cluster, Instance};
use common::utils::Ipv4Cidr;
use common::{Error, Result};

const CRI_SOCKET: &str = "/var/run/crio/crio.sock";

/// API Server 端口
pub const API_PORT: u16 = 6443;

/// Ubuntu 节点准备：关闭 swap、内核模块与 sysctl、软件源、容器运行时与 kubeadm
pub fn ubuntu_prep() -> Vec<String> {
    [
        "hwclock --hctosys",
        "sed -i '/ swap / s/^\\(.*\\)$/#\\1/g' /etc/fstab",
        "swapoff -a",
        "modprobe overlay",
        "modprobe br_netfilter",
        "echo overlay > /etc/modules-load.d/crio.conf",
        "echo br_netfilter >> /etc/modules-load.d/crio.conf",
        "echo \"net.bridge.bridge-nf-call-ip6tables = 1\" > /etc/sysctl.d/kubernetes.conf",
        "echo \"net.bridge.bridge-nf-call-iptables = 1\" >> /etc/sysctl.d/kubernetes.conf",
        "echo \"net.ipv4.ip_forward = 1\" >> /etc/sysctl.d/kubernetes.conf",
        "sysctl --system",
        ". /etc/os-release",
        "curl -s https://packages.cloud.google.com/apt/doc/apt-key.gpg | apt-key add -",
        "wget -nv https://download.opensuse.org/repositories/devel:/kubic:/libcontainers:/stable/xUbuntu_${VERSION_ID}/Release.key -O- | apt-key add -",
        "wget -nv http://download.opensuse.org/repositories/devel:/kubic:/libcontainers:/stable:/cri-o:/1.20:/1.20.2/x${NAME}_${VERSION_ID}/Release.key -O- | apt-key add -",
        "echo \"deb https://apt.kubernetes.io/ kubernetes-xenial main\" > /etc/apt/sources.list.d/kubernetes.list",
        "echo \"deb http://download.opensuse.org/repositories/devel:/kubic:/libcontainers:/stable:/cri-o:/1.20:/1.20.2/x${NAME}_${VERSION_ID}/ /\" > /etc/apt/sources.list.d/devel:kubic:libcontainers:stable.list",
        "echo \"deb https://download.opensuse.org/repositories/devel:/kubic:/libcontainers:/stable/xUbuntu_${VERSION_ID}/ /\" >> /etc/apt/sources.list.d/devel:kubic:libcontainers:stable.list",
        "apt update",
        "apt -y install kubelet kubeadm kubectl cri-o cri-o-runc",
        "systemctl enable crio",
        "systemctl start crio",
        "systemctl enable kubelet",
        "rm -rf /etc/cni/net.d/*",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// 为每个集群成员追加 /etc/hosts 条目
pub fn hosts_entries(cluster: &Cluster) -> Result<Vec<String>> {
    cluster
        .instances
        .iter()
        .map(|instance| {
            let ip = require_ip(instance)?;
            Ok(format!(
                "echo \"{} {} {}\" >> /etc/hosts",
                ip,
                instance.name,
                instance.short_name()
            ))
        })
        .collect()
}

pub fn image_pull() -> Vec<String> {
    vec![format!("kubeadm config images pull --cri-socket {}", CRI_SOCKET)]
}

pub fn kubeadm_init(pod: &Ipv4Cidr, service: &Ipv4Cidr, endpoint: &str) -> Vec<String> {
    vec![format!(
        "kubeadm init --pod-network-cidr={} --service-cidr={} --control-plane-endpoint={} --cri-socket {}",
        pod, service, endpoint, CRI_SOCKET
    )]
}

pub fn token_create() -> Vec<String> {
    vec!["kubeadm token create --print-join-command".to_string()]
}

pub fn fetch_admin_conf() -> Vec<String> {
    vec!["cat /etc/kubernetes/admin.conf".to_string()]
}

/// 去掉远程输出末尾的回车换行
pub fn clean_token(raw: &str) -> String {
    raw.trim_end_matches(['\r', '\n']).to_string()
}

pub fn require_ip(instance: &Instance) -> Result<std::net::Ipv4Addr> {
    instance
        .primary_ip()
        .ok_or_else(|| Error::InvalidArgument(format!("实例 {} 尚未分配地址", instance.name)))
}
