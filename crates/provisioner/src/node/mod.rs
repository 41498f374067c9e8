/// 宿主机信息
///
/// 负责识别宿主机发行版，并据此选择虚拟机的机器类型：
/// - 发行版/版本检测（sysinfo 读取 os-release）
/// - 机器类型查表
/// - 模拟器与 KVM 能力检测

use common::{Error, Result};
use std::path::{Path, PathBuf};
use sysinfo::System;
use tracing::{debug, info, warn};

/// 已验证过的宿主机组合：(发行版 ID, 版本, 机器类型)
const MACHINE_PROFILES: &[(&str, &str, &str)] = &[
    ("centos", "8", "pc-q35-rhel8.2.0"),
    ("ubuntu", "20.04", "pc-q35-focal"),
    ("ubuntu", "22.04", "pc-q35-jammy"),
];

/// 常见的模拟器位置，PATH 中找不到时回退
const EMULATOR_FALLBACKS: &[&str] = &["/usr/bin/qemu-system-x86_64", "/usr/libexec/qemu-kvm"];

/// 宿主机平台
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatform {
    pub id: String,
    pub version: String,
}

impl HostPlatform {
    /// 检测宿主机平台，`override_spec` 形如 `ubuntu:20.04`
    pub fn detect(override_spec: Option<&str>) -> Result<Self> {
        if let Some(spec) = override_spec {
            let (id, version) = spec.split_once(':').ok_or_else(|| {
                Error::Config(format!("host_platform 格式应为 <id>:<version>: {}", spec))
            })?;
            debug!("使用配置指定的宿主机平台: {}", spec);
            return Ok(Self {
                id: id.to_string(),
                version: version.to_string(),
            });
        }

        let id = System::distribution_id();
        let version = System::os_version().ok_or_else(|| {
            Error::UnsupportedHostPlatform(format!("无法识别 {} 的版本号", id))
        })?;

        info!("🖥️ 宿主机平台: {} {}", id, version);
        Ok(Self { id, version })
    }

    /// 查表得到机器类型
    pub fn machine_type(&self) -> Result<&'static str> {
        MACHINE_PROFILES
            .iter()
            .find(|(id, version, _)| *id == self.id && *version == self.version)
            .map(|(_, _, machine)| *machine)
            .ok_or_else(|| {
                Error::UnsupportedHostPlatform(format!("{} {}", self.id, self.version))
            })
    }
}

/// 查找 qemu 模拟器
pub fn find_emulator() -> Result<PathBuf> {
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join("qemu-system-x86_64");
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    EMULATOR_FALLBACKS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| Error::Config("未找到 qemu-system-x86_64".to_string()))
}

/// 检查 KVM 支持，缺失时只告警（嵌套环境仍可用 TCG 运行）
pub fn check_kvm() -> bool {
    let has_kvm = Path::new("/dev/kvm").exists();
    if has_kvm {
        debug!("检测到 KVM 支持");
    } else {
        warn!("⚠️ 未检测到 /dev/kvm，虚拟机性能会很差");
    }
    has_kvm
}
