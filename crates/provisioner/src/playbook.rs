/// kubespray playbook 获取与执行

use common::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

pub struct PlaybookRunner {
    repo: String,
    log_path: PathBuf,
}

impl PlaybookRunner {
    pub fn new(repo: impl Into<String>, state_dir: &Path) -> Self {
        Self {
            repo: repo.into(),
            log_path: state_dir.join("ansible.log"),
        }
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// 克隆 playbook 仓库，目录已是 git 仓库时直接复用
    pub async fn clone_playbooks(&self, location: &Path) -> Result<()> {
        if location.join(".git").is_dir() {
            warn!("⚠️ {} 已存在，复用已有的 playbook", location.display());
            return Ok(());
        }
        if let Some(parent) = location.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("📥 克隆 {} 到 {}", self.repo, location.display());
        let output = Command::new("git")
            .arg("clone")
            .arg("--depth")
            .arg("1")
            .arg(&self.repo)
            .arg(location)
            .output()
            .await
            .map_err(|e| Error::Internal(format!("无法执行 git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::RemoteCommand(format!(
                "git clone 失败: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// 执行 cluster.yml，输出追加到 ansible.log
    pub async fn run_playbook(&self, inventory: &Path, location: &Path) -> Result<()> {
        if let Some(parent) = self.log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)?;
        let log_err = log.try_clone()?;

        info!("▶️ 执行 kubespray，日志: {}", self.log_path.display());
        let status = Command::new("ansible-playbook")
            .arg("-i")
            .arg(inventory)
            .arg(location.join("cluster.yml"))
            .arg("-b")
            .env("ANSIBLE_HOST_KEY_CHECKING", "False")
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .status()
            .await
            .map_err(|e| Error::Internal(format!("无法执行 ansible-playbook: {}", e)))?;

        if !status.success() {
            return Err(Error::RemoteCommand(format!(
                "ansible-playbook 退出码 {:?}，详见 {}",
                status.code(),
                self.log_path.display()
            )));
        }
        info!("✅ kubespray 执行完成");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_existing_checkout_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let location = dir.path().join("kubespray");
        std::fs::create_dir_all(location.join(".git")).unwrap();

        let runner = PlaybookRunner::new("https://example.invalid/kubespray", dir.path());
        runner.clone_playbooks(&location).await.unwrap();
        assert_eq!(runner.log_path(), dir.path().join("ansible.log"));
    }
}
