/// qemu-img 封装
///
/// 派生写时复制磁盘、读取镜像信息

use async_trait::async_trait;
use common::{Error, Result};
use serde::Deserialize;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, error, info};

/// 镜像信息（qemu-img info --output=json 的子集）
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiskInfo {
    #[serde(rename = "virtual-size")]
    pub virtual_size: u64,
    #[serde(rename = "actual-size", default)]
    pub actual_size: u64,
    pub format: String,
    #[serde(rename = "backing-filename", default)]
    pub backing_filename: Option<String>,
}

/// 磁盘派生工具
#[async_trait]
pub trait DiskTool: Send + Sync + 'static {
    /// 以 base 为后端创建 qcow2 增量盘
    async fn create_overlay(&self, base: &Path, target: &Path, size: &str) -> Result<()>;

    async fn info(&self, path: &Path) -> Result<DiskInfo>;
}

pub struct QemuImg;

#[async_trait]
impl DiskTool for QemuImg {
    async fn create_overlay(&self, base: &Path, target: &Path, size: &str) -> Result<()> {
        info!("💽 派生磁盘: {} (backing: {}, size: {})", target.display(), base.display(), size);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("无法创建目录: {}", e)))?;
        }

        let output = Command::new("qemu-img")
            .arg("create")
            .arg("-b")
            .arg(base)
            .arg("-f")
            .arg("qcow2")
            .arg("-F")
            .arg("qcow2")
            .arg(target)
            .arg(size)
            .output()
            .await
            .map_err(|e| Error::Storage(format!("无法执行 qemu-img: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!("qemu-img create 失败: {}", stderr);
            return Err(Error::Storage(format!("派生磁盘失败: {}", stderr.trim())));
        }

        debug!("qemu-img: {}", String::from_utf8_lossy(&output.stdout).trim());
        Ok(())
    }

    async fn info(&self, path: &Path) -> Result<DiskInfo> {
        let output = Command::new("qemu-img")
            .arg("info")
            .arg("-U")
            .arg("--output=json")
            .arg(path)
            .output()
            .await
            .map_err(|e| Error::Storage(format!("无法执行 qemu-img info: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Storage(format!("qemu-img info 失败: {}", stderr.trim())));
        }

        parse_info(&output.stdout)
    }
}

fn parse_info(stdout: &[u8]) -> Result<DiskInfo> {
    serde_json::from_slice(stdout)
        .map_err(|e| Error::Storage(format!("无法解析 qemu-img 输出: {}", e)))
}
