/// 集群注册表
///
/// 不维护任何本地状态，每次查询都从虚拟机元数据标签重建集群视图

use common::metadata::{AddressTag, InstanceTag};
use common::models::{Cluster, Instance};
use common::utils::Ipv4Cidr;
use common::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::hypervisor::{DomainRecord, VirtBackend};

/// 可分配的集群网段数量
const MAX_CLUSTERS: u32 = 64;

pub struct ClusterRegistry {
    backend: Arc<dyn VirtBackend>,
}

impl ClusterRegistry {
    pub fn new(backend: Arc<dyn VirtBackend>) -> Self {
        Self { backend }
    }

    /// 所有带归属标签的虚拟机，标签无法解析的跳过
    async fn tagged_domains(&self) -> Result<Vec<(DomainRecord, InstanceTag)>> {
        let mut tagged = Vec::new();
        for record in self.backend.list_domains().await? {
            match InstanceTag::from_domain_xml(&record.xml) {
                Ok(Some(tag)) => tagged.push((record, tag)),
                Ok(None) => {}
                Err(e) => warn!("⚠️ 虚拟机 {} 的归属标签无法解析，跳过: {}", record.name, e),
            }
        }
        Ok(tagged)
    }

    /// 列出带归属标签的实例，可按集群名过滤
    pub async fn instances(&self, cluster: Option<&str>) -> Result<Vec<Instance>> {
        let mut instances = Vec::new();
        for (record, tag) in self.tagged_domains().await? {
            if cluster.is_some_and(|c| c != tag.cluster) {
                continue;
            }

            let ip_addresses = self.addresses(&record).await;
            instances.push(Instance {
                name: record.name,
                role: tag.role,
                cluster: tag.cluster,
                suffix: tag.suffix,
                ip_addresses,
                active: record.active,
            });
        }
        instances.sort_by_key(|i| (i.role, member_index(&i.name), i.name.clone()));
        Ok(instances)
    }

    /// 优先使用地址标签，没有时对运行中的虚拟机实时查询
    async fn addresses(&self, record: &DomainRecord) -> Vec<Ipv4Addr> {
        match AddressTag::from_domain_xml(&record.xml) {
            Ok(Some(tag)) => return vec![tag.ip],
            Ok(None) => {}
            Err(e) => warn!("⚠️ 虚拟机 {} 的地址标签无法解析: {}", record.name, e),
        }
        if !record.active {
            return Vec::new();
        }
        match self.backend.interface_addresses(&record.name).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("查询 {} 的地址失败: {}", record.name, e);
                Vec::new()
            }
        }
    }

    /// 按集群名分组，集群按名称排序
    pub async fn clusters(&self) -> Result<Vec<Cluster>> {
        let mut grouped: BTreeMap<String, Vec<Instance>> = BTreeMap::new();
        for instance in self.instances(None).await? {
            grouped.entry(instance.cluster.clone()).or_default().push(instance);
        }
        Ok(grouped
            .into_iter()
            .map(|(name, instances)| Cluster { name, instances })
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        let instances = self.instances(Some(name)).await?;
        if instances.is_empty() {
            return Ok(None);
        }
        Ok(Some(Cluster {
            name: name.to_string(),
            instances,
        }))
    }

    /// 集群创建时分配的网段槽位
    pub async fn cluster_slot(&self, name: &str) -> Result<u32> {
        self.tagged_domains()
            .await?
            .into_iter()
            .filter(|(_, tag)| tag.cluster == name)
            .map(|(_, tag)| tag.slot)
            .min()
            .ok_or_else(|| Error::NotFound(format!("集群 {} 不存在", name)))
    }

    /// 现有集群未占用的最小槽位
    pub async fn allocate_slot(&self) -> Result<u32> {
        let used: BTreeSet<u32> = self
            .tagged_domains()
            .await?
            .into_iter()
            .map(|(_, tag)| tag.slot)
            .collect();
        let slot = (0..MAX_CLUSTERS)
            .find(|k| !used.contains(k))
            .ok_or_else(|| {
                Error::Config(format!("集群数量超过上限 {}，无法分配网段", MAX_CLUSTERS))
            })?;
        debug!("分配网段槽位 {}", slot);
        Ok(slot)
    }

    /// 集群的 Pod 与 Service 网段
    pub async fn cluster_cidrs(&self, name: &str) -> Result<(Ipv4Cidr, Ipv4Cidr)> {
        cidrs_for_slot(self.cluster_slot(name).await?)
    }
}

/// 槽位 k：Pod 10.(32+k).0.0/16，Service 10.(96+k).0.0/16
pub fn cidrs_for_slot(k: u32) -> Result<(Ipv4Cidr, Ipv4Cidr)> {
    if k >= MAX_CLUSTERS {
        return Err(Error::Config(format!(
            "网段槽位 {} 超过上限 {}",
            k, MAX_CLUSTERS
        )));
    }
    let k = k as u8;
    let pod = Ipv4Cidr::new(Ipv4Addr::new(10, 32 + k, 0, 0), 16)?;
    let service = Ipv4Cidr::new(Ipv4Addr::new(10, 96 + k, 0, 0), 16)?;
    Ok((pod, service))
}

/// 从实例名中取序号，例如 w-instance-12.demo.local → 12
fn member_index(name: &str) -> u32 {
    name.split('.')
        .next()
        .and_then(|short| short.rsplit('-').next())
        .and_then(|idx| idx.parse().ok())
        .unwrap_or(u32::MAX)
}
