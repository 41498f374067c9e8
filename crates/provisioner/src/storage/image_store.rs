/// 镜像存储
///
/// 存储池按 `<命名空间>:<分类>:<发行版或实例名>` 命名，列表时只需解析池名即可
/// 按分类过滤。发行版镜像只落盘一次，实例根盘以其为后端做写时复制。

use common::models::{Image, ImageClass, ImageSpec};
use common::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::fetch::ImageFetcher;
use super::qemu_img::{DiskInfo, DiskTool};
use crate::hypervisor::VirtBackend;

/// 实例根盘卷名
pub const DISK_VOLUME: &str = "disk";
/// 实例 cloud-init 种子卷名
pub const SEED_VOLUME: &str = "cloudinit";

pub struct ImageStore {
    backend: Arc<dyn VirtBackend>,
    disk_tool: Arc<dyn DiskTool>,
    fetcher: Arc<dyn ImageFetcher>,
    root: PathBuf,
    namespace: String,
}

impl ImageStore {
    pub fn new(
        backend: Arc<dyn VirtBackend>,
        disk_tool: Arc<dyn DiskTool>,
        fetcher: Arc<dyn ImageFetcher>,
        root: PathBuf,
        namespace: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            disk_tool,
            fetcher,
            root,
            namespace: namespace.into(),
        }
    }

    pub fn pool_name(&self, class: ImageClass, owner: &str) -> String {
        format!("{}:{}:{}", self.namespace, class.as_str(), owner)
    }

    /// 解析池名，不属于本命名空间时返回 None
    pub fn parse_pool_name(&self, pool: &str) -> Option<(ImageClass, String)> {
        let mut parts = pool.splitn(3, ':');
        if parts.next()? != self.namespace {
            return None;
        }
        let class = parts.next()?.parse().ok()?;
        let owner = parts.next()?;
        if owner.is_empty() {
            return None;
        }
        Some((class, owner.to_string()))
    }

    pub fn pool_path(&self, class: ImageClass, owner: &str) -> PathBuf {
        self.root.join(class.as_str()).join(owner)
    }

    /// 实例卷的落盘路径
    pub fn instance_volume_path(&self, instance: &str, volume: &str) -> PathBuf {
        self.pool_path(ImageClass::Instance, instance).join(volume)
    }

    /// 列出某分类下的全部镜像
    pub async fn list(&self, class: ImageClass) -> Result<Vec<Image>> {
        let mut images = Vec::new();
        for pool in self.backend.list_pools().await? {
            let Some((pool_class, owner)) = self.parse_pool_name(&pool.name) else {
                continue;
            };
            if pool_class != class {
                continue;
            }
            for vol in self.backend.list_volumes(&pool.name).await? {
                images.push(Image {
                    name: vol.name,
                    class,
                    owner: owner.clone(),
                    pool: pool.name.clone(),
                    path: vol.path,
                });
            }
        }
        Ok(images)
    }

    async fn find(&self, class: ImageClass, owner: &str, name: &str) -> Result<Option<Image>> {
        let pool = self.pool_name(class, owner);
        let pools = self.backend.list_pools().await?;
        if !pools.iter().any(|p| p.name == pool) {
            return Ok(None);
        }

        let found = self
            .backend
            .list_volumes(&pool)
            .await?
            .into_iter()
            .find(|v| v.name == name)
            .map(|v| Image {
                name: v.name,
                class,
                owner: owner.to_string(),
                pool: pool.clone(),
                path: v.path,
            });
        Ok(found)
    }

    /// 查找发行版基础镜像，只读
    pub async fn resolve_base(&self, name: &str, distribution: &str) -> Result<Option<Image>> {
        self.find(ImageClass::Distribution, distribution, name).await
    }

    /// 确保存储池存在，不存在则创建
    async fn ensure_pool(&self, class: ImageClass, owner: &str) -> Result<String> {
        let pool = self.pool_name(class, owner);
        let pools = self.backend.list_pools().await?;
        if !pools.iter().any(|p| p.name == pool) {
            self.backend
                .define_pool(&pool, &self.pool_path(class, owner))
                .await?;
        }
        Ok(pool)
    }

    /// 确保基础镜像存在，缺失时下载或复制，之后重新查询确认
    pub async fn ensure_base(&self, spec: &ImageSpec) -> Result<Image> {
        if let Some(image) = self.resolve_base(&spec.name, &spec.distribution).await? {
            debug!("基础镜像已存在: {}", image.path.display());
            return Ok(image);
        }

        info!("📦 基础镜像 {} 不存在，开始创建", spec.name);
        let pool = self.ensure_pool(ImageClass::Distribution, &spec.distribution).await?;
        let dest = self
            .pool_path(ImageClass::Distribution, &spec.distribution)
            .join(&spec.name);

        self.fetcher.fetch(&spec.source, &dest).await?;
        self.backend.refresh_pool(&pool).await?;

        let image = self
            .resolve_base(&spec.name, &spec.distribution)
            .await?
            .ok_or_else(|| Error::ImageCreationFailed(format!("镜像 {} 创建后仍未找到", spec.name)))?;

        info!("✅ 基础镜像就绪: {}", image.path.display());
        Ok(image)
    }

    /// 查找实例卷
    pub async fn find_instance_volume(&self, instance: &str, volume: &str) -> Result<Option<Image>> {
        self.find(ImageClass::Instance, instance, volume).await
    }

    /// 以基础镜像为后端派生实例根盘，已存在时原样返回
    pub async fn derive_instance_disk(
        &self,
        instance: &str,
        backing: &Image,
        size: &str,
    ) -> Result<Image> {
        if let Some(existing) = self.find_instance_volume(instance, DISK_VOLUME).await? {
            debug!(instance = %instance, "实例根盘已存在，跳过派生");
            return Ok(existing);
        }

        let pool = self.ensure_pool(ImageClass::Instance, instance).await?;
        let target = self.instance_volume_path(instance, DISK_VOLUME);
        self.disk_tool.create_overlay(&backing.path, &target, size).await?;
        self.backend.refresh_pool(&pool).await?;

        self.find_instance_volume(instance, DISK_VOLUME)
            .await?
            .ok_or_else(|| Error::ImageCreationFailed(format!("实例 {} 根盘派生后未找到", instance)))
    }

    /// 准备实例存储池，返回卷应落盘的路径
    pub async fn prepare_instance_volume(&self, instance: &str, volume: &str) -> Result<PathBuf> {
        self.ensure_pool(ImageClass::Instance, instance).await?;
        Ok(self.instance_volume_path(instance, volume))
    }

    /// 将已落盘的实例文件登记为存储卷
    pub async fn register_instance_volume(&self, instance: &str, volume: &str) -> Result<Image> {
        let pool = self.pool_name(ImageClass::Instance, instance);
        self.backend.refresh_pool(&pool).await?;
        self.find_instance_volume(instance, volume)
            .await?
            .ok_or_else(|| Error::ImageCreationFailed(format!("实例 {} 的卷 {} 登记失败", instance, volume)))
    }

    /// 删除镜像；卷不存在视为成功，池空时一并删除池与目录
    pub async fn delete(&self, image: &Image) -> Result<()> {
        match self.backend.delete_volume(&image.pool, &image.name).await {
            Ok(()) => info!("🗑️ 已删除卷 {}/{}", image.pool, image.name),
            Err(e) if e.is_not_found() => {
                warn!("⚠️ 卷不存在，跳过: {}/{}", image.pool, image.name);
            }
            Err(e) => return Err(e),
        }

        let remaining = match self.backend.list_volumes(&image.pool).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !remaining.is_empty() {
            return Ok(());
        }

        let dir = self.pool_path(image.class, &image.owner);
        self.backend.delete_pool(&image.pool).await?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Storage(format!("无法删除目录 {}: {}", dir.display(), e)));
            }
        }
        info!("🗑️ 存储池 {} 已清空并删除", image.pool);
        Ok(())
    }

    /// 查询镜像容量信息
    pub async fn info(&self, image: &Image) -> Result<DiskInfo> {
        self.disk_tool.info(&image.path).await
    }
}
