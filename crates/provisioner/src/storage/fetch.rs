/// 基础镜像获取
///
/// 支持 HTTP(S) 下载与本地文件复制。先写入 `.part` 临时文件，完成后再改名，
/// 中途失败不会在存储池目录留下半截镜像。

use async_trait::async_trait;
use common::models::{ImageSource, LocationKind};
use common::utils::format_bytes;
use common::{Error, Result};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

#[async_trait]
pub trait ImageFetcher: Send + Sync + 'static {
    /// 将镜像落盘到 dest
    async fn fetch(&self, source: &ImageSource, dest: &Path) -> Result<()>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Internal(format!("无法创建 HTTP 客户端: {}", e)))?;
        Ok(Self { client })
    }

    async fn download(&self, url: &str, tmp: &Path) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::ImageCreationFailed(format!("下载 {} 失败: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(Error::ImageCreationFailed(format!(
                "下载 {} 失败: HTTP {}",
                url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(tmp).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| Error::ImageCreationFailed(format!("下载 {} 中断: {}", url, e)))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, source: &ImageSource, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = part_path(dest);

        let result = match source.kind {
            LocationKind::Url => {
                info!("⬇️ 下载镜像: {} -> {}", source.location, dest.display());
                self.download(&source.location, &tmp).await
            }
            LocationKind::File => {
                info!("📄 复制镜像: {} -> {}", source.location, dest.display());
                tokio::fs::copy(&source.location, &tmp).await.map_err(|e| {
                    Error::ImageCreationFailed(format!("复制 {} 失败: {}", source.location, e))
                })
            }
        };

        match result {
            Ok(bytes) => {
                tokio::fs::rename(&tmp, dest).await?;
                debug!("镜像落盘完成: {} ({})", dest.display(), format_bytes(bytes));
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(e)
            }
        }
    }
}
