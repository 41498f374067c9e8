/// 网络管理器
///
/// 负责查找、创建和删除本工具管理的虚拟网络

use common::models::Network;
use common::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

use super::xml::{generate_network_xml, parse_network};
use crate::hypervisor::VirtBackend;

pub struct NetworkManager {
    backend: Arc<dyn VirtBackend>,
}

impl NetworkManager {
    pub fn new(backend: Arc<dyn VirtBackend>) -> Self {
        Self { backend }
    }

    /// 列出带归属标签的网络（含未激活）
    pub async fn list(&self) -> Result<Vec<Network>> {
        let mut networks = Vec::new();
        for record in self.backend.list_networks().await? {
            if let Some(net) = parse_network(&record.name, &record.xml, record.active)? {
                networks.push(net);
            }
        }
        Ok(networks)
    }

    /// 按名称查找本工具管理的网络
    pub async fn resolve(&self, name: &str) -> Result<Option<Network>> {
        Ok(self.list().await?.into_iter().find(|n| n.name == name))
    }

    /// 网络不存在时按给定定义创建
    pub async fn ensure_default(&self, spec: &Network) -> Result<Network> {
        if let Some(existing) = self.resolve(&spec.name).await? {
            info!("🌐 网络 {} 已存在", spec.name);
            return Ok(existing);
        }

        let records = self.backend.list_networks().await?;
        if records.iter().any(|r| r.name == spec.name) {
            return Err(Error::Config(format!(
                "网络 {} 已存在但不是由 easyvm 创建的",
                spec.name
            )));
        }

        info!(
            "🌐 创建网络: {} (type: {}, subnet: {}, gateway: {}, dhcp: {})",
            spec.name,
            spec.network_type.as_str(),
            spec.subnet,
            spec.gateway,
            spec.dhcp
        );
        let xml = generate_network_xml(spec)?;
        self.backend.define_network(&xml).await?;

        self.resolve(&spec.name)
            .await?
            .ok_or_else(|| Error::Network(format!("网络 {} 创建后仍未找到", spec.name)))
    }

    /// 新建网络，同名网络已存在时报错
    pub async fn create(&self, spec: &Network) -> Result<Network> {
        let records = self.backend.list_networks().await?;
        if records.iter().any(|r| r.name == spec.name) {
            return Err(Error::AlreadyExists(format!("网络 {}", spec.name)));
        }
        self.ensure_default(spec).await
    }

    /// 删除网络，不存在时视为成功
    pub async fn delete(&self, name: &str) -> Result<()> {
        match self.backend.delete_network(name).await {
            Ok(()) => {
                info!("✅ 网络 {} 已删除", name);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!("⚠️ 网络 {} 不存在", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
