/// 远程命令执行

use async_trait::async_trait;
use common::{Error, Result};
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use super::probe::classify_ssh_failure;

#[async_trait]
pub trait RemoteExecutor: Send + Sync + 'static {
    /// 在一次会话内按顺序执行命令，返回标准输出
    async fn run(&self, host: &str, commands: &[String]) -> Result<String>;
}

/// 基于 OpenSSH 的实现，主机密钥必须已记录在 known_hosts 中
pub struct OpenSshExecutor {
    user: String,
    identity: Option<PathBuf>,
    known_hosts: PathBuf,
    connect_timeout_secs: u64,
}

impl OpenSshExecutor {
    pub fn new(
        user: impl Into<String>,
        identity: Option<PathBuf>,
        known_hosts: PathBuf,
        connect_timeout_secs: u64,
    ) -> Self {
        Self {
            user: user.into(),
            identity,
            known_hosts,
            connect_timeout_secs,
        }
    }

    fn command(&self, host: &str, script: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=yes")
            .arg("-o")
            .arg(format!("UserKnownHostsFile={}", self.known_hosts.display()))
            .arg("-o")
            .arg("LogLevel=ERROR")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout_secs));
        if let Some(identity) = &self.identity {
            cmd.arg("-i").arg(identity);
        }
        cmd.arg(format!("{}@{}", self.user, host)).arg(script);
        cmd
    }
}

/// 把命令序列拼成一条远程脚本，退出码取最后一条命令
pub fn join_commands(commands: &[String]) -> String {
    commands.join("; ")
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn run(&self, host: &str, commands: &[String]) -> Result<String> {
        if commands.is_empty() {
            return Ok(String::new());
        }
        let script = join_commands(commands);
        debug!(host = %host, "执行远程命令: {}", script);

        let output = self
            .command(host, &script)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("无法执行 ssh: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        // ssh 自身失败时退出码为 255
        match output.status.code() {
            Some(255) => Err(classify_ssh_failure(host, &stderr)),
            code => Err(Error::RemoteCommand(format!(
                "{} 退出码 {:?}: {}",
                host,
                code,
                stderr.trim()
            ))),
        }
    }
}
