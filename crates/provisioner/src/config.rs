/// 配置管理
///
/// 加载顺序：内置默认值 → 配置文件（$EASYVM_CONFIG 或 ~/.config/easyvm/config.toml）
/// → 环境变量 EASYVM_*，后者覆盖前者。

use common::models::{ImageSource, ImageSpec, Network, NetworkType};
use common::utils::expand_tilde;
use common::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_IMAGE_URL: &str =
    "https://cloud-images.ubuntu.com/releases/focal/release-20210315/ubuntu-20.04-server-cloudimg-amd64.img";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub libvirt_uri: String,
    pub image_root: PathBuf,
    /// 存储池名前缀
    pub pool_namespace: String,
    /// 本地状态目录，存放集群凭据与 ansible 日志
    pub state_dir: PathBuf,
    pub kubeconfig_path: String,
    pub known_hosts_path: String,
    pub ssh_user: String,
    pub ssh_identity: Option<String>,
    pub ssh_connect_timeout_secs: u64,
    pub ip_poll_interval_secs: u64,
    pub ip_wait_timeout_secs: u64,
    pub ssh_max_attempts: u32,
    pub ssh_retry_interval_secs: u64,
    pub log_level: String,
    /// 覆盖宿主机平台检测，格式 <id>:<version>
    pub host_platform: Option<String>,

    pub default_image_name: String,
    pub default_image_distribution: String,
    pub default_image_url: String,

    pub default_network_name: String,
    pub default_network_subnet: String,
    pub default_network_gateway: String,
    pub default_network_dhcp: bool,

    pub kubespray_repo: String,
}

impl Config {
    /// 从默认值、配置文件与环境变量加载配置
    pub fn from_env() -> Result<Self> {
        let file = std::env::var("EASYVM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| expand_tilde("~/.config/easyvm/config.toml"));

        let builder = Self::defaults(::config::Config::builder())
            .map_err(config_err)?
            .add_source(::config::File::from(file).required(false))
            .add_source(::config::Environment::with_prefix("EASYVM").try_parsing(true));

        let cfg: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(config_err)?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn defaults(
        builder: ::config::ConfigBuilder<::config::builder::DefaultState>,
    ) -> std::result::Result<::config::ConfigBuilder<::config::builder::DefaultState>, ::config::ConfigError> {
        builder
            .set_default("libvirt_uri", "qemu:///system")?
            .set_default("image_root", "/var/lib/libvirt/images")?
            .set_default("pool_namespace", "easyvm")?
            .set_default("state_dir", "/tmp/easyvm")?
            .set_default("kubeconfig_path", "~/.kube/config")?
            .set_default("known_hosts_path", "~/.ssh/known_hosts")?
            .set_default("ssh_user", "root")?
            .set_default("ssh_connect_timeout_secs", 5)?
            .set_default("ip_poll_interval_secs", 2)?
            .set_default("ip_wait_timeout_secs", 600)?
            .set_default("ssh_max_attempts", 60)?
            .set_default("ssh_retry_interval_secs", 2)?
            .set_default("log_level", "info")?
            .set_default("default_image_name", "ubuntu2004")?
            .set_default("default_image_distribution", "ubuntu")?
            .set_default("default_image_url", DEFAULT_IMAGE_URL)?
            .set_default("default_network_name", "easyvm")?
            .set_default("default_network_subnet", "192.168.66.0/24")?
            .set_default("default_network_gateway", "192.168.66.1")?
            .set_default("default_network_dhcp", true)?
            .set_default("kubespray_repo", "https://github.com/kubernetes-sigs/kubespray")
    }

    /// 校验数值型配置
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("ip_poll_interval_secs", self.ip_poll_interval_secs),
            ("ip_wait_timeout_secs", self.ip_wait_timeout_secs),
            ("ssh_retry_interval_secs", self.ssh_retry_interval_secs),
            ("ssh_connect_timeout_secs", self.ssh_connect_timeout_secs),
            ("ssh_max_attempts", self.ssh_max_attempts as u64),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{} 必须大于 0", key)));
            }
        }
        if self.pool_namespace.is_empty() || self.pool_namespace.contains(':') {
            return Err(Error::Config(format!(
                "pool_namespace 不能为空且不能包含冒号: {:?}",
                self.pool_namespace
            )));
        }
        // 默认网络需能通过校验
        self.default_network()?;
        Ok(())
    }

    pub fn ip_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ip_poll_interval_secs)
    }

    pub fn ip_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_wait_timeout_secs)
    }

    pub fn ssh_retry_interval(&self) -> Duration {
        Duration::from_secs(self.ssh_retry_interval_secs)
    }

    pub fn kubeconfig(&self) -> PathBuf {
        expand_tilde(&self.kubeconfig_path)
    }

    pub fn known_hosts(&self) -> PathBuf {
        expand_tilde(&self.known_hosts_path)
    }

    pub fn identity(&self) -> Option<PathBuf> {
        self.ssh_identity.as_deref().map(expand_tilde)
    }

    /// 默认网络定义
    pub fn default_network(&self) -> Result<Network> {
        Network::from_request(
            &self.default_network_name,
            NetworkType::Bridge,
            &self.default_network_subnet,
            Some(&self.default_network_gateway),
            None,
            self.default_network_dhcp,
        )
    }

    /// 指定名称的镜像请求，默认镜像使用内置下载地址
    pub fn image_spec(&self, name: &str) -> ImageSpec {
        ImageSpec {
            name: name.to_string(),
            distribution: self.default_image_distribution.clone(),
            source: ImageSource::url(self.default_image_url.clone()),
        }
    }
}

fn config_err(e: ::config::ConfigError) -> Error {
    Error::Config(e.to_string())
}

#[cfg(test)]
pub(crate) fn test_config(root: &std::path::Path) -> Config {
    Config {
        libvirt_uri: "test:///default".into(),
        image_root: root.join("images"),
        pool_namespace: "easyvm".into(),
        state_dir: root.join("state"),
        kubeconfig_path: root.join("kubeconfig").to_string_lossy().into_owned(),
        known_hosts_path: root.join("known_hosts").to_string_lossy().into_owned(),
        ssh_user: "root".into(),
        ssh_identity: None,
        ssh_connect_timeout_secs: 1,
        ip_poll_interval_secs: 1,
        ip_wait_timeout_secs: 5,
        ssh_max_attempts: 5,
        ssh_retry_interval_secs: 1,
        log_level: "debug".into(),
        host_platform: Some("ubuntu:20.04".into()),
        default_image_name: "ubuntu2004".into(),
        default_image_distribution: "ubuntu".into(),
        default_image_url: "https://example.invalid/focal.img".into(),
        default_network_name: "easyvm".into(),
        default_network_subnet: "192.168.66.0/24".into(),
        default_network_gateway: "192.168.66.1".into(),
        default_network_dhcp: true,
        kubespray_repo: "https://example.invalid/kubespray".into(),
    }
}
