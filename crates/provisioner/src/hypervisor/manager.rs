/// 虚拟化管理器
///
/// 负责与 libvirt 交互，管理存储池、存储卷、虚拟网络、虚拟机与快照。
/// 所有调用在连接锁内串行执行，锁内不跨越 await。

use async_trait::async_trait;
use common::{Error, Result};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;
use virt::error::ErrorNumber;
use virt::network::Network;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;

use super::backend::{DomainRecord, NetworkRecord, PoolInfo, SnapshotRecord, VirtBackend, VolumeInfo};
use common::utils::xml_escape;

// libvirt 常量
const VIR_DOMAIN_METADATA_ELEMENT: i32 = 2;
const VIR_DOMAIN_AFFECT_LIVE: u32 = 1;
const VIR_DOMAIN_AFFECT_CONFIG: u32 = 2;
const VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE: u32 = 0;
const VIR_IP_ADDR_TYPE_IPV4: i64 = 0;

pub struct HypervisorManager {
    conn: Arc<Mutex<Connect>>,
}

impl HypervisorManager {
    pub fn new(uri: &str) -> Result<Self> {
        let conn = Connect::open(Some(uri))
            .map_err(|e| Error::Hypervisor(format!("无法连接到 libvirt {}: {}", uri, e)))?;

        tracing::info!("✅ 成功连接到 libvirt: {}", uri);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

/// 对象不存在类的错误码
fn is_missing(code: ErrorNumber) -> bool {
    matches!(
        code,
        ErrorNumber::NoDomain
            | ErrorNumber::NoNetwork
            | ErrorNumber::NoStoragePool
            | ErrorNumber::NoStorageVolume
            | ErrorNumber::NoDomainSnapshot
    )
}

/// 将 libvirt 错误映射为统一错误，"不存在" 类错误映射为 NotFound
fn map_err(what: &str, e: virt::error::Error) -> Error {
    if is_missing(e.code()) {
        Error::NotFound(format!("{}: {}", what, e))
    } else {
        Error::Hypervisor(format!("{}: {}", what, e))
    }
}

fn lookup_domain(conn: &Connect, name: &str) -> Result<Domain> {
    Domain::lookup_by_name(conn, name).map_err(|e| map_err(&format!("虚拟机 {}", name), e))
}

fn lookup_pool(conn: &Connect, name: &str) -> Result<StoragePool> {
    StoragePool::lookup_by_name(conn, name).map_err(|e| map_err(&format!("存储池 {}", name), e))
}

/// 解析存储池 XML 中的目标路径
fn pool_target_path(xml: &str) -> Result<PathBuf> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| Error::Internal(format!("解析XML失败: {}", e)))?;

    doc.descendants()
        .find(|n| n.has_tag_name("target"))
        .and_then(|t| t.children().find(|n| n.has_tag_name("path")))
        .and_then(|p| p.text())
        .map(|p| PathBuf::from(p.trim()))
        .ok_or_else(|| Error::Storage("存储池 XML 缺少 target/path".to_string()))
}

fn pool_xml(name: &str, path: &Path) -> String {
    format!(
        "<pool type='dir'>\n  <name>{}</name>\n  <target>\n    <path>{}</path>\n  </target>\n</pool>\n",
        xml_escape(name),
        xml_escape(&path.to_string_lossy())
    )
}

#[async_trait]
impl VirtBackend for HypervisorManager {
    async fn list_pools(&self) -> Result<Vec<PoolInfo>> {
        let conn = self.conn.lock().await;
        let pools = conn
            .list_all_storage_pools(0)
            .map_err(|e| map_err("无法列出存储池", e))?;

        let mut out = Vec::with_capacity(pools.len());
        for pool in pools {
            let name = pool.get_name().map_err(|e| map_err("无法获取存储池名称", e))?;
            let xml = pool
                .get_xml_desc(0)
                .map_err(|e| map_err(&format!("无法获取存储池 {} 定义", name), e))?;
            let active = pool.is_active().map_err(|e| map_err("无法获取存储池状态", e))?;
            out.push(PoolInfo {
                path: pool_target_path(&xml)?,
                name,
                active,
            });
        }
        Ok(out)
    }

    async fn define_pool(&self, name: &str, path: &Path) -> Result<()> {
        tracing::info!("💾 定义存储池: {} -> {}", name, path.display());

        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| Error::Storage(format!("无法创建目录 {}: {}", path.display(), e)))?;

        let conn = self.conn.lock().await;
        let pool = StoragePool::define_xml(&conn, &pool_xml(name, path), 0)
            .map_err(|e| map_err(&format!("无法定义存储池 {}", name), e))?;
        pool.create(0)
            .map_err(|e| map_err(&format!("无法启动存储池 {}", name), e))?;
        pool.set_autostart(true)
            .map_err(|e| map_err(&format!("无法设置存储池 {} 自动启动", name), e))?;

        tracing::info!("✅ 存储池 {} 已就绪", name);
        Ok(())
    }

    async fn refresh_pool(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let pool = lookup_pool(&conn, name)?;
        pool.refresh(0)
            .map_err(|e| map_err(&format!("无法刷新存储池 {}", name), e))?;
        Ok(())
    }

    async fn delete_pool(&self, name: &str) -> Result<()> {
        tracing::info!("🗑️ 删除存储池: {}", name);

        let conn = self.conn.lock().await;
        let pool = lookup_pool(&conn, name)?;
        if pool.is_active().map_err(|e| map_err("无法获取存储池状态", e))? {
            pool.destroy()
                .map_err(|e| map_err(&format!("无法停止存储池 {}", name), e))?;
        }
        pool.undefine()
            .map_err(|e| map_err(&format!("无法取消定义存储池 {}", name), e))?;
        Ok(())
    }

    async fn list_volumes(&self, pool: &str) -> Result<Vec<VolumeInfo>> {
        let conn = self.conn.lock().await;
        let pool_obj = lookup_pool(&conn, pool)?;
        let vols = pool_obj
            .list_all_volumes(0)
            .map_err(|e| map_err(&format!("无法列出存储池 {} 的卷", pool), e))?;

        let mut out = Vec::with_capacity(vols.len());
        for vol in vols {
            let name = vol.get_name().map_err(|e| map_err("无法获取卷名称", e))?;
            let path = vol.get_path().map_err(|e| map_err("无法获取卷路径", e))?;
            out.push(VolumeInfo { name, path: PathBuf::from(path) });
        }
        Ok(out)
    }

    async fn delete_volume(&self, pool: &str, volume: &str) -> Result<()> {
        tracing::info!("🗑️ 删除存储卷: {}/{}", pool, volume);

        let conn = self.conn.lock().await;
        let pool_obj = lookup_pool(&conn, pool)?;
        let vol = StorageVol::lookup_by_name(&pool_obj, volume)
            .map_err(|e| map_err(&format!("存储卷 {}/{}", pool, volume), e))?;
        vol.delete(0)
            .map_err(|e| map_err(&format!("无法删除存储卷 {}/{}", pool, volume), e))?;
        Ok(())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkRecord>> {
        let conn = self.conn.lock().await;
        let networks = conn
            .list_all_networks(0)
            .map_err(|e| map_err("无法列出网络", e))?;

        let mut out = Vec::with_capacity(networks.len());
        for net in networks {
            let name = net.get_name().map_err(|e| map_err("无法获取网络名称", e))?;
            let xml = net
                .get_xml_desc(0)
                .map_err(|e| map_err(&format!("无法获取网络 {} 定义", name), e))?;
            let active = net.is_active().map_err(|e| map_err("无法获取网络状态", e))?;
            out.push(NetworkRecord { name, xml, active });
        }
        Ok(out)
    }

    async fn define_network(&self, xml: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let net = Network::define_xml(&conn, xml).map_err(|e| map_err("无法定义网络", e))?;
        net.create().map_err(|e| map_err("无法启动网络", e))?;
        net.set_autostart(true)
            .map_err(|e| map_err("无法设置网络自动启动", e))?;
        Ok(())
    }

    async fn delete_network(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let net = Network::lookup_by_name(&conn, name)
            .map_err(|e| map_err(&format!("网络 {}", name), e))?;
        if net.is_active().map_err(|e| map_err("无法获取网络状态", e))? {
            net.destroy()
                .map_err(|e| map_err(&format!("无法停止网络 {}", name), e))?;
        }
        net.undefine()
            .map_err(|e| map_err(&format!("无法取消定义网络 {}", name), e))?;
        Ok(())
    }

    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let conn = self.conn.lock().await;
        let domains = conn
            .list_all_domains(0)
            .map_err(|e| map_err("无法列出虚拟机", e))?;

        let mut out = Vec::with_capacity(domains.len());
        for domain in domains {
            let name = domain.get_name().map_err(|e| map_err("无法获取虚拟机名称", e))?;
            let xml = domain
                .get_xml_desc(0)
                .map_err(|e| map_err(&format!("无法获取虚拟机 {} 定义", name), e))?;
            let active = domain.is_active().map_err(|e| map_err("无法获取虚拟机状态", e))?;
            out.push(DomainRecord { name, xml, active });
        }
        Ok(out)
    }

    async fn define_domain(&self, xml: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        Domain::define_xml(&conn, xml).map_err(|e| map_err("无法定义虚拟机", e))?;
        Ok(())
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let domain = lookup_domain(&conn, name)?;

        if domain.is_active().map_err(|e| map_err("无法获取虚拟机状态", e))? {
            tracing::info!("✅ 虚拟机 {} 已经在运行", name);
        } else {
            domain
                .create()
                .map_err(|e| map_err(&format!("无法启动虚拟机 {}", name), e))?;
        }
        domain
            .set_autostart(true)
            .map_err(|e| map_err(&format!("无法设置虚拟机 {} 自动启动", name), e))?;
        Ok(())
    }

    async fn interface_addresses(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let conn = self.conn.lock().await;
        let domain = lookup_domain(&conn, name)?;
        let ifaces = domain
            .interface_addresses(VIR_DOMAIN_INTERFACE_ADDRESSES_SRC_LEASE, 0)
            .map_err(|e| map_err(&format!("无法查询虚拟机 {} 地址", name), e))?;

        let addrs = ifaces
            .iter()
            .flat_map(|iface| iface.addrs.iter())
            .filter(|a| a.typed == VIR_IP_ADDR_TYPE_IPV4)
            .filter_map(|a| a.addr.parse::<Ipv4Addr>().ok())
            .collect();
        Ok(addrs)
    }

    async fn set_domain_metadata(&self, name: &str, xml: &str, ns: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let domain = lookup_domain(&conn, name)?;

        let mut flags = VIR_DOMAIN_AFFECT_CONFIG;
        if domain.is_active().map_err(|e| map_err("无法获取虚拟机状态", e))? {
            flags |= VIR_DOMAIN_AFFECT_LIVE;
        }
        domain
            .set_metadata(
                VIR_DOMAIN_METADATA_ELEMENT,
                Some(xml),
                Some(common::metadata::PREFIX),
                Some(ns),
                flags,
            )
            .map_err(|e| map_err(&format!("无法写入虚拟机 {} 元数据", name), e))?;
        Ok(())
    }

    async fn delete_domain(&self, name: &str) -> Result<()> {
        tracing::info!("🗑️ 删除虚拟机: {}", name);

        let conn = self.conn.lock().await;
        let domain = lookup_domain(&conn, name)?;

        if domain.is_active().map_err(|e| map_err("无法获取虚拟机状态", e))? {
            tracing::info!("🛑 虚拟机 {} 正在运行，先停止它", name);
            domain
                .destroy()
                .map_err(|e| map_err(&format!("无法停止虚拟机 {}", name), e))?;
        }
        domain
            .undefine()
            .map_err(|e| map_err(&format!("无法删除虚拟机定义 {}", name), e))?;
        Ok(())
    }

    async fn create_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let dom = lookup_domain(&conn, domain)?;
        let xml = format!(
            "<domainsnapshot><name>{}</name></domainsnapshot>",
            xml_escape(snapshot)
        );
        DomainSnapshot::create_xml(&dom, &xml, 0)
            .map_err(|e| map_err(&format!("无法为 {} 创建快照", domain), e))?;
        Ok(())
    }

    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotRecord>> {
        let conn = self.conn.lock().await;
        let dom = lookup_domain(&conn, domain)?;
        let snapshots = dom
            .list_all_snapshots(0)
            .map_err(|e| map_err(&format!("无法列出 {} 的快照", domain), e))?;

        let mut out = Vec::with_capacity(snapshots.len());
        for snap in snapshots {
            out.push(SnapshotRecord {
                name: snap.get_name().map_err(|e| map_err("无法获取快照名称", e))?,
                current: snap.is_current(0).map_err(|e| map_err("无法获取快照状态", e))?,
            });
        }
        Ok(out)
    }

    async fn revert_current_snapshot(&self, domain: &str) -> Result<String> {
        let conn = self.conn.lock().await;
        let dom = lookup_domain(&conn, domain)?;
        let snap = DomainSnapshot::current(&dom, 0)
            .map_err(|e| map_err(&format!("虚拟机 {} 没有当前快照", domain), e))?;
        let name = snap.get_name().map_err(|e| map_err("无法获取快照名称", e))?;
        snap.revert(0)
            .map_err(|e| map_err(&format!("无法回滚 {} 到快照 {}", domain, name), e))?;
        Ok(name)
    }

    async fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let dom = lookup_domain(&conn, domain)?;
        let snap = DomainSnapshot::lookup_by_name(&dom, snapshot, 0)
            .map_err(|e| map_err(&format!("快照 {}/{}", domain, snapshot), e))?;
        snap.delete(0)
            .map_err(|e| map_err(&format!("无法删除快照 {}/{}", domain, snapshot), e))?;
        Ok(())
    }
}
