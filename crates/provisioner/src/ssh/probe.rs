/// SSH 就绪探测
///
/// 获取主机密钥并验证登录。连接被拒绝、超时等视为暂时不可用，
/// 认证失败视为致命错误，不再重试。

use async_trait::async_trait;
use common::{Error, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::known_hosts::KnownHosts;
use crate::wait::{retry_transient, RetryPolicy};

#[async_trait]
pub trait SshProbe: Send + Sync + 'static {
    /// 探测一次，成功时返回主机密钥（known_hosts 格式）
    async fn probe(&self, host: Ipv4Addr) -> Result<String>;
}

/// 根据 ssh 的错误输出区分认证失败与连接问题
pub fn classify_ssh_failure(host: &str, stderr: &str) -> Error {
    const AUTH_MARKERS: &[&str] = &[
        "Permission denied",
        "Too many authentication failures",
        "Host key verification failed",
        "no matching host key type",
    ];
    let detail = stderr.trim();
    if AUTH_MARKERS.iter().any(|m| detail.contains(m)) {
        Error::Authentication(format!("{}: {}", host, detail))
    } else {
        Error::Connectivity(format!("{}: {}", host, detail))
    }
}

/// 基于 OpenSSH 命令行的实现
pub struct OpenSshProbe {
    user: String,
    identity: Option<PathBuf>,
    connect_timeout_secs: u64,
}

impl OpenSshProbe {
    pub fn new(user: impl Into<String>, identity: Option<PathBuf>, connect_timeout_secs: u64) -> Self {
        Self {
            user: user.into(),
            identity,
            connect_timeout_secs,
        }
    }

    async fn keyscan(&self, host: &str) -> Result<String> {
        let output = Command::new("ssh-keyscan")
            .arg("-T")
            .arg(self.connect_timeout_secs.to_string())
            .arg(host)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("无法执行 ssh-keyscan: {}", e)))?;

        let keys = String::from_utf8_lossy(&output.stdout).to_string();
        let has_key = keys.lines().any(|l| !l.trim().is_empty() && !l.starts_with('#'));
        if !has_key {
            return Err(Error::Connectivity(format!("{} 尚未返回主机密钥", host)));
        }
        Ok(keys)
    }

    async fn login_check(&self, host: &str) -> Result<()> {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg("UserKnownHostsFile=/dev/null")
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        let output = cmd
            .arg(format!("{}@{}", self.user, host))
            .arg("true")
            .output()
            .await
            .map_err(|e| Error::Internal(format!("无法执行 ssh: {}", e)))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_ssh_failure(host, &String::from_utf8_lossy(&output.stderr)))
        }
    }
}

#[async_trait]
impl SshProbe for OpenSshProbe {
    async fn probe(&self, host: Ipv4Addr) -> Result<String> {
        let host = host.to_string();
        let keys = self.keyscan(&host).await?;
        self.login_check(&host).await?;
        Ok(keys)
    }
}

/// 等待 SSH 就绪并把主机密钥写入 known_hosts
pub async fn wait_for_ssh(
    probe: &dyn SshProbe,
    known_hosts: &KnownHosts,
    host: Ipv4Addr,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    let operation = format!("ssh {}", host);
    let keys = retry_transient(policy, &operation, cancel, || probe.probe(host)).await?;
    known_hosts.record(&host.to_string(), &keys).await?;
    info!("🔑 {} SSH 已就绪", host);
    Ok(())
}
