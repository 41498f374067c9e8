/// known_hosts 维护
///
/// 多个实例的就绪探测并发写同一个文件，写入在互斥锁内完成，
/// 先写临时文件再改名替换。

use common::{Error, Result};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct KnownHosts {
    path: PathBuf,
    lock: Mutex<()>,
}

impl KnownHosts {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 替换 host 的全部主机密钥；keys 为 ssh-keyscan 的输出
    pub async fn record(&self, host: &str, keys: &str) -> Result<()> {
        let fresh: Vec<&str> = keys
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();
        if fresh.is_empty() {
            return Err(Error::InvalidArgument(format!("{} 没有可记录的主机密钥", host)));
        }

        let _guard = self.lock.lock().await;

        // 哈希形式（|1|...）的条目只能交给 ssh-keygen 匹配
        if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            forget_host(&self.path, host).await;
        }

        let existing = match tokio::fs::read_to_string(&self.path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };

        // 同一地址可能被之前的集群用过，旧密钥一并去掉
        let mut out: Vec<&str> = existing
            .lines()
            .filter(|line| !line_matches_host(line, host))
            .collect();
        out.extend(fresh.iter().copied());

        let mut content = out.join("\n");
        content.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension(format!("tmp-{}", common::utils::generate_id()));
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("已记录 {} 的 {} 条主机密钥", host, fresh.len());
        Ok(())
    }
}

/// ssh-keygen -R，失败时只告警，明文条目随后仍会被过滤
async fn forget_host(path: &Path, host: &str) {
    match Command::new("ssh-keygen")
        .arg("-R")
        .arg(host)
        .arg("-f")
        .arg(path)
        .output()
        .await
    {
        Ok(output) if output.status.success() => {
            // ssh-keygen 会留下 .old 备份
            let mut backup = path.as_os_str().to_owned();
            backup.push(".old");
            let _ = tokio::fs::remove_file(backup).await;
        }
        Ok(output) => warn!(
            "⚠️ ssh-keygen -R {} 失败: {}",
            host,
            String::from_utf8_lossy(&output.stderr).trim()
        ),
        Err(e) => warn!("⚠️ 无法执行 ssh-keygen: {}", e),
    }
}

fn line_matches_host(line: &str, host: &str) -> bool {
    line.split_whitespace()
        .next()
        .map(|hosts| hosts.split(',').any(|h| h == host))
        .unwrap_or(false)
}
