/// cloud-init 种子构建
///
/// 生成 NoCloud 数据源（user-data + meta-data）并打包为卷标 cidata 的 ISO

use async_trait::async_trait;
use common::utils::generate_id;
use common::{Error, Result};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// 非特权账户名
pub const GUEST_USER: &str = "easyvm";

/// 种子内容参数
#[derive(Debug, Clone)]
pub struct SeedRequest {
    pub hostname: String,
    pub public_key: String,
    pub dns_server: Ipv4Addr,
}

#[async_trait]
pub trait SeedBuilder: Send + Sync + 'static {
    /// 生成种子 ISO 写到 dest
    async fn build(&self, request: &SeedRequest, dest: &Path) -> Result<()>;
}

#[derive(Debug, Serialize)]
struct CloudConfig {
    hostname: String,
    manage_etc_hosts: bool,
    users: Vec<User>,
    ssh_pwauth: bool,
    disable_root: bool,
    write_files: Vec<WriteFile>,
    runcmd: Vec<String>,
}

#[derive(Debug, Serialize)]
struct User {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sudo: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    home: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shell: Option<String>,
    lock_passwd: bool,
    ssh_authorized_keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct WriteFile {
    path: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct MetaData {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "local-hostname")]
    local_hostname: String,
}

/// 渲染 user-data
pub fn render_user_data(request: &SeedRequest) -> Result<String> {
    let key = request.public_key.trim().to_string();
    let config = CloudConfig {
        hostname: request.hostname.clone(),
        manage_etc_hosts: true,
        users: vec![
            User {
                name: GUEST_USER.to_string(),
                sudo: Some("ALL=(ALL) NOPASSWD:ALL".to_string()),
                home: Some(format!("/home/{}", GUEST_USER)),
                shell: Some("/bin/bash".to_string()),
                lock_passwd: true,
                ssh_authorized_keys: vec![key.clone()],
            },
            User {
                name: "root".to_string(),
                sudo: None,
                home: None,
                shell: None,
                lock_passwd: true,
                ssh_authorized_keys: vec![key],
            },
        ],
        ssh_pwauth: false,
        disable_root: false,
        write_files: vec![WriteFile {
            path: "/etc/systemd/resolved.conf".to_string(),
            content: format!("[Resolve]\nDNS={}\n", request.dns_server),
        }],
        runcmd: vec!["systemctl restart systemd-resolved.service".to_string()],
    };

    Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&config)?))
}

/// 渲染 meta-data
pub fn render_meta_data(request: &SeedRequest) -> Result<String> {
    let meta = MetaData {
        instance_id: request.hostname.clone(),
        local_hostname: request.hostname.clone(),
    };
    Ok(serde_yaml::to_string(&meta)?)
}

/// 基于 genisoimage（或 mkisofs）的实现
pub struct GenIsoSeedBuilder;

impl GenIsoSeedBuilder {
    async fn run_iso_tool(tool: &str, staging: &Path, output: &Path) -> std::io::Result<std::process::Output> {
        Command::new(tool)
            .arg("-output")
            .arg(output)
            .arg("-volid")
            .arg("cidata")
            .arg("-joliet")
            .arg("-rock")
            .arg(staging.join("user-data"))
            .arg(staging.join("meta-data"))
            .output()
            .await
    }

    async fn build_in(staging: &Path, request: &SeedRequest, dest: &Path) -> Result<()> {
        tokio::fs::write(staging.join("user-data"), render_user_data(request)?).await?;
        tokio::fs::write(staging.join("meta-data"), render_meta_data(request)?).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let output = match Self::run_iso_tool("genisoimage", staging, dest).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("未找到 genisoimage，改用 mkisofs");
                Self::run_iso_tool("mkisofs", staging, dest).await
            }
            other => other,
        }
        .map_err(|e| Error::ImageCreationFailed(format!("无法执行 ISO 打包工具: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ImageCreationFailed(format!(
                "cloud-init ISO 打包失败: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SeedBuilder for GenIsoSeedBuilder {
    async fn build(&self, request: &SeedRequest, dest: &Path) -> Result<()> {
        info!(instance = %request.hostname, "💿 生成 cloud-init 种子");

        let staging: PathBuf = std::env::temp_dir().join(format!("easyvm-seed-{}", generate_id()));
        tokio::fs::create_dir_all(&staging).await?;

        let result = Self::build_in(&staging, request, dest).await;
        let _ = tokio::fs::remove_dir_all(&staging).await;
        result
    }
}
