/// 虚拟化后端抽象
///
/// 编排层只通过这个接口访问存储池、存储卷、虚拟网络和虚拟机，
/// 生产实现为基于 libvirt 的 `HypervisorManager`。

use async_trait::async_trait;
use common::Result;
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// 存储池信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolInfo {
    pub name: String,
    pub path: PathBuf,
    pub active: bool,
}

/// 存储卷信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub path: PathBuf,
}

/// 虚拟网络记录，xml 为完整定义
#[derive(Debug, Clone)]
pub struct NetworkRecord {
    pub name: String,
    pub xml: String,
    pub active: bool,
}

/// 虚拟机记录，xml 为完整定义（含 metadata）
#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub name: String,
    pub xml: String,
    pub active: bool,
}

/// 快照记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRecord {
    pub name: String,
    pub current: bool,
}

#[async_trait]
pub trait VirtBackend: Send + Sync + 'static {
    // ---- 存储池 ----

    /// 列出所有存储池（含未激活）
    async fn list_pools(&self) -> Result<Vec<PoolInfo>>;

    /// 定义目录型存储池，创建目录、启动并设置自动启动
    async fn define_pool(&self, name: &str, path: &std::path::Path) -> Result<()>;

    /// 重新扫描存储池目录，使新落盘的文件成为存储卷
    async fn refresh_pool(&self, name: &str) -> Result<()>;

    /// 停止并取消定义存储池，不删除目录
    async fn delete_pool(&self, name: &str) -> Result<()>;

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>>;

    /// 删除存储卷，卷不存在时返回 NotFound
    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()>;

    // ---- 虚拟网络 ----

    async fn list_networks(&self) -> Result<Vec<NetworkRecord>>;

    /// 定义、启动网络并设置自动启动
    async fn define_network(&self, xml: &str) -> Result<()>;

    /// 停止（如在运行）并取消定义网络
    async fn delete_network(&self, name: &str) -> Result<()>;

    // ---- 虚拟机 ----

    async fn list_domains(&self) -> Result<Vec<DomainRecord>>;

    async fn define_domain(&self, xml: &str) -> Result<()>;

    /// 启动虚拟机并设置自动启动
    async fn start_domain(&self, name: &str) -> Result<()>;

    /// 查询虚拟机当前的 IPv4 地址
    async fn interface_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>>;

    /// 写入（或覆盖）一个命名空间元数据元素
    async fn set_domain_metadata(&self, name: &str, xml: &str, ns: &str) -> Result<()>;

    /// 停止（如在运行）并取消定义虚拟机
    async fn delete_domain(&self, name: &str) -> Result<()>;

    // ---- 快照 ----

    async fn create_snapshot(&self, domain: &str, snapshot: &str) -> Result<()>;

    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotRecord>>;

    /// 回滚到当前快照，返回快照名
    async fn revert_current_snapshot(&self, domain: &str) -> Result<String>;

    async fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()>;
}
