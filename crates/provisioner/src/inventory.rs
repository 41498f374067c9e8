/// kubespray 清单生成

use common::models::{Cluster, Role};
use common::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// 空值映射，序列化为 `{}`
#[derive(Debug, Default, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
struct Host {
    ansible_host: String,
}

#[derive(Debug, Serialize)]
struct All {
    hosts: BTreeMap<String, Host>,
    vars: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize)]
struct Group {
    hosts: BTreeMap<String, Empty>,
}

#[derive(Debug, Serialize)]
struct Children {
    children: BTreeMap<String, Empty>,
}

#[derive(Debug, Serialize)]
struct Inventory {
    all: All,
    #[serde(rename = "kube-master")]
    kube_master: Group,
    #[serde(rename = "kube-node")]
    kube_node: Group,
    etcd: Group,
    #[serde(rename = "k8s-cluster")]
    k8s_cluster: Children,
}

/// 渲染清单 YAML，artifacts_dir 为 kubespray 存放产物的目录
pub fn render(cluster: &Cluster, suffix: &str, artifacts_dir: &Path) -> Result<String> {
    let mut hosts = BTreeMap::new();
    let mut kube_master = Group::default();
    let mut kube_node = Group::default();
    let mut etcd = Group::default();

    for instance in &cluster.instances {
        let ip = instance.primary_ip().ok_or_else(|| {
            Error::InvalidArgument(format!("实例 {} 尚未分配地址，无法生成清单", instance.name))
        })?;
        hosts.insert(instance.name.clone(), Host { ansible_host: ip.to_string() });
        match instance.role {
            Role::Controller => {
                kube_master.hosts.insert(instance.name.clone(), Empty {});
                etcd.hosts.insert(instance.name.clone(), Empty {});
            }
            Role::Worker => {
                kube_node.hosts.insert(instance.name.clone(), Empty {});
            }
        }
    }

    let vars: BTreeMap<String, String> = [
        ("cluster_name", format!("{}.{}", cluster.name, suffix)),
        ("artifacts_dir", artifacts_dir.display().to_string()),
        ("kube_network_plugin", "cni".to_string()),
        ("kube_network_plugin_multus", "false".to_string()),
        ("kubectl_localhost", "true".to_string()),
        ("kubeconfig_localhost", "true".to_string()),
        ("override_system_hostname", "true".to_string()),
        ("container_manager", "crio".to_string()),
        ("kubelet_deployment_type", "host".to_string()),
        ("download_container", "false".to_string()),
        ("etcd_deployment_type", "host".to_string()),
        ("host_key_checking", "false".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let inventory = Inventory {
        all: All { hosts, vars },
        kube_master,
        kube_node,
        etcd,
        k8s_cluster: Children {
            children: [("kube-master".to_string(), Empty {}), ("kube-node".to_string(), Empty {})]
                .into_iter()
                .collect(),
        },
    };
    Ok(serde_yaml::to_string(&inventory)?)
}

/// 渲染并写入清单文件
pub async fn write(cluster: &Cluster, suffix: &str, artifacts_dir: &Path, dest: &Path) -> Result<()> {
    let yaml = render(cluster, suffix, artifacts_dir)?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, yaml).await?;
    info!("📋 清单已写入 {}", dest.display());
    Ok(())
}
