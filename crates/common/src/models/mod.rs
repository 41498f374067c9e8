/// 数据模型定义
///
/// 集群、实例、镜像、网络等领域对象。集群与实例不做持久化，
/// 列表查询时从虚拟机元数据标签重建。

use crate::utils::{parse_size, Ipv4Cidr};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use validator::{Validate, ValidationError};

/// 实例角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Controller,
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Worker => "worker",
        }
    }

    /// 实例名前缀
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Controller => "c",
            Role::Worker => "w",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "controller" => Ok(Role::Controller),
            "worker" => Ok(Role::Worker),
            other => Err(Error::InvalidArgument(format!("未知角色: {}", other))),
        }
    }
}

/// 镜像分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageClass {
    /// 共享的发行版基础镜像
    Distribution,
    /// 实例派生的磁盘或 cloud-init 种子
    Instance,
}

impl ImageClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageClass::Distribution => "distribution",
            ImageClass::Instance => "instance",
        }
    }
}

impl FromStr for ImageClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "distribution" => Ok(ImageClass::Distribution),
            "instance" => Ok(ImageClass::Instance),
            other => Err(Error::InvalidArgument(format!("未知镜像分类: {}", other))),
        }
    }
}

/// 镜像来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocationKind {
    Url,
    File,
}

/// 镜像来源
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSource {
    pub location: String,
    pub kind: LocationKind,
}

impl ImageSource {
    pub fn url(location: impl Into<String>) -> Self {
        Self { location: location.into(), kind: LocationKind::Url }
    }

    pub fn file(location: impl Into<String>) -> Self {
        Self { location: location.into(), kind: LocationKind::File }
    }
}

/// 基础镜像请求
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub name: String,
    pub distribution: String,
    pub source: ImageSource,
}

/// 已存在于存储池中的镜像
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// 卷名
    pub name: String,
    pub class: ImageClass,
    /// 发行版名或实例名
    pub owner: String,
    /// 所属存储池
    pub pool: String,
    /// 卷在宿主机上的路径
    pub path: PathBuf,
}

/// 网络链路层类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Bridge,
    Ovs,
}

impl NetworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkType::Bridge => "bridge",
            NetworkType::Ovs => "ovs",
        }
    }
}

impl FromStr for NetworkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bridge" => Ok(NetworkType::Bridge),
            "ovs" => Ok(NetworkType::Ovs),
            other => Err(Error::Config(format!("网络类型只能是 bridge 或 ovs: {}", other))),
        }
    }
}

/// 虚拟网络
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub name: String,
    pub network_type: NetworkType,
    pub subnet: Ipv4Cidr,
    pub gateway: Ipv4Addr,
    pub dns_server: Ipv4Addr,
    pub dhcp: bool,
    pub active: bool,
}

impl Network {
    /// 由用户输入构造网络定义，缺省网关为网络地址 +1，缺省 DNS 为网关
    pub fn from_request(
        name: &str,
        network_type: NetworkType,
        subnet: &str,
        gateway: Option<&str>,
        dns_server: Option<&str>,
        dhcp: bool,
    ) -> Result<Self> {
        let subnet: Ipv4Cidr = subnet.parse()?;
        if subnet.size() < 4 {
            return Err(Error::Config(format!("子网过小: {}", subnet)));
        }

        let gateway = match gateway {
            Some(g) => parse_ipv4(g, "网关")?,
            None => subnet
                .nth(1)
                .ok_or_else(|| Error::Config(format!("无法计算网关: {}", subnet)))?,
        };
        if !subnet.contains(gateway) {
            return Err(Error::Config(format!("网关 {} 不在子网 {} 内", gateway, subnet)));
        }

        let dns_server = match dns_server {
            Some(d) => parse_ipv4(d, "DNS")?,
            None => gateway,
        };
        if !subnet.contains(dns_server) {
            return Err(Error::Config(format!("DNS {} 不在子网 {} 内", dns_server, subnet)));
        }

        Ok(Self {
            name: name.to_string(),
            network_type,
            subnet,
            gateway,
            dns_server,
            dhcp,
            active: false,
        })
    }

    /// DHCP 地址范围：子网第三个地址到倒数第二个地址
    pub fn dhcp_range(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        let size = self.subnet.size();
        if size < 4 {
            return None;
        }
        Some((self.subnet.nth(2)?, self.subnet.nth(size - 2)?))
    }
}

fn parse_ipv4(value: &str, what: &str) -> Result<Ipv4Addr> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("无效的{}地址: {}", what, value)))
}

/// 实例资源模板
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Resources {
    #[validate(range(min = 1, max = 256))]
    pub vcpu: u32,
    #[validate(range(min = 268435456))]
    pub memory_bytes: u64,
    /// 根盘容量，原样传给 qemu-img，例如 "10G"
    #[validate(length(min = 1))]
    pub disk: String,
}

impl Resources {
    pub fn new(vcpu: u32, memory: &str, disk: &str) -> Result<Self> {
        // 先校验格式
        parse_size(disk)?;
        Ok(Self {
            vcpu,
            memory_bytes: parse_size(memory)?,
            disk: disk.to_string(),
        })
    }

    pub fn memory_mib(&self) -> u64 {
        self.memory_bytes / (1024 * 1024)
    }
}

/// 集群创建请求
#[derive(Debug, Clone, Validate)]
#[validate(schema(function = "validate_member_count"))]
pub struct ClusterSpec {
    #[validate(length(min = 1, max = 48), custom = "validate_label")]
    pub name: String,
    #[validate(length(min = 1, max = 32), custom = "validate_label")]
    pub suffix: String,
    #[validate(range(max = 16))]
    pub controllers: u32,
    #[validate(range(max = 64))]
    pub workers: u32,
    #[validate]
    pub resources: Resources,
    pub image: ImageSpec,
    pub network: String,
    /// 注入到 cloud-init 的公钥内容
    #[validate(length(min = 1))]
    pub public_key: String,
}

impl ClusterSpec {
    /// 校验请求，失败映射为配置错误
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::Config(format!("集群参数无效: {}", e)))
    }

    /// 展开为有序的实例列表：先控制节点，再工作节点
    pub fn members(&self) -> Vec<Instance> {
        let controllers = (0..self.controllers).map(|i| (Role::Controller, i));
        let workers = (0..self.workers).map(|i| (Role::Worker, i));
        controllers
            .chain(workers)
            .map(|(role, idx)| Instance::planned(role, idx, &self.name, &self.suffix))
            .collect()
    }
}

fn validate_label(value: &str) -> std::result::Result<(), ValidationError> {
    let ok = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !value.starts_with('-')
        && !value.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(ValidationError::new("dns_label"))
    }
}

fn validate_member_count(spec: &ClusterSpec) -> std::result::Result<(), ValidationError> {
    if spec.controllers + spec.workers == 0 {
        return Err(ValidationError::new("empty_cluster"));
    }
    Ok(())
}

/// 生成实例名：<角色前缀>-instance-<序号>.<集群>.<后缀>
pub fn instance_name(role: Role, index: u32, cluster: &str, suffix: &str) -> String {
    format!("{}-instance-{}.{}.{}", role.prefix(), index, cluster, suffix)
}

/// 实例快照，由元数据标签重建
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub name: String,
    pub role: Role,
    pub cluster: String,
    pub suffix: String,
    pub ip_addresses: Vec<Ipv4Addr>,
    pub active: bool,
}

impl Instance {
    pub fn planned(role: Role, index: u32, cluster: &str, suffix: &str) -> Self {
        Self {
            name: instance_name(role, index, cluster, suffix),
            role,
            cluster: cluster.to_string(),
            suffix: suffix.to_string(),
            ip_addresses: Vec::new(),
            active: false,
        }
    }

    /// 主机短名（实例名第一个点之前）
    pub fn short_name(&self) -> &str {
        self.name.split('.').next().unwrap_or(&self.name)
    }

    pub fn primary_ip(&self) -> Option<Ipv4Addr> {
        self.ip_addresses.first().copied()
    }
}

/// 实例生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum InstanceState {
    Pending,
    DiskDerived,
    SeedReady,
    DomainDefined,
    Booted,
    IpAssigned,
    SshReady,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::DiskDerived => "disk-derived",
            InstanceState::SeedReady => "seed-ready",
            InstanceState::DomainDefined => "domain-defined",
            InstanceState::Booted => "booted",
            InstanceState::IpAssigned => "ip-assigned",
            InstanceState::SshReady => "ssh-ready",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 集群视图，仅为查询时的瞬时快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub name: String,
    pub instances: Vec<Instance>,
}

impl Cluster {
    pub fn controllers(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.role == Role::Controller)
    }

    pub fn workers(&self) -> impl Iterator<Item = &Instance> {
        self.instances.iter().filter(|i| i.role == Role::Worker)
    }
}
