/// 虚拟机 XML 生成

use common::metadata::InstanceTag;
use common::{Error, Result};
use std::fmt::Write;
use std::path::PathBuf;

use common::utils::xml_escape;

/// 虚拟机定义参数
#[derive(Debug, Clone)]
pub struct DomainConfig {
    pub name: String,
    pub vcpu: u32,
    pub memory_bytes: u64,
    /// 机器类型，来自宿主机平台查表
    pub machine: String,
    pub emulator: PathBuf,
    /// cloud-init 种子 ISO
    pub seed_path: PathBuf,
    /// 实例根盘（qcow2 增量盘）
    pub disk_path: PathBuf,
    /// 根盘的后端基础镜像
    pub backing_path: PathBuf,
    pub network: String,
    pub tag: InstanceTag,
}

/// 生成虚拟机 XML 配置
pub fn generate_domain_xml(config: &DomainConfig) -> Result<String> {
    let mut xml = String::new();
    write_domain(&mut xml, config)
        .map_err(|e| Error::Internal(format!("生成虚拟机 XML 失败: {}", e)))?;
    Ok(xml)
}

fn write_domain(xml: &mut String, config: &DomainConfig) -> std::fmt::Result {
    writeln!(xml, "<domain type='kvm'>")?;
    writeln!(xml, "  <name>{}</name>", xml_escape(&config.name))?;

    // 集群归属标签
    writeln!(xml, "  <metadata>")?;
    writeln!(xml, "    {}", config.tag.to_xml())?;
    writeln!(xml, "  </metadata>")?;

    writeln!(xml, "  <memory unit='b'>{}</memory>", config.memory_bytes)?;
    writeln!(xml, "  <currentMemory unit='b'>{}</currentMemory>", config.memory_bytes)?;
    writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", config.vcpu)?;
    writeln!(xml, "  <cpu mode='host-model' check='none'/>")?;

    writeln!(xml, "  <os>")?;
    writeln!(xml, "    <type arch='x86_64' machine='{}'>hvm</type>", config.machine)?;
    writeln!(xml, "  </os>")?;

    writeln!(xml, "  <features>")?;
    writeln!(xml, "    <acpi/>")?;
    writeln!(xml, "    <apic/>")?;
    writeln!(xml, "  </features>")?;

    writeln!(xml, "  <clock offset='utc'>")?;
    writeln!(xml, "    <timer name='rtc' tickpolicy='catchup'/>")?;
    writeln!(xml, "    <timer name='pit' tickpolicy='delay'/>")?;
    writeln!(xml, "    <timer name='hpet' present='no'/>")?;
    writeln!(xml, "  </clock>")?;

    writeln!(xml, "  <on_poweroff>destroy</on_poweroff>")?;
    writeln!(xml, "  <on_reboot>restart</on_reboot>")?;
    writeln!(xml, "  <on_crash>destroy</on_crash>")?;

    writeln!(xml, "  <devices>")?;
    writeln!(xml, "    <emulator>{}</emulator>", config.emulator.display())?;

    // cloud-init 种子，只读光驱
    writeln!(xml, "    <disk type='file' device='cdrom'>")?;
    writeln!(xml, "      <driver name='qemu' type='raw'/>")?;
    writeln!(xml, "      <source file='{}'/>", xml_escape(&config.seed_path.to_string_lossy()))?;
    writeln!(xml, "      <target dev='sda' bus='sata'/>")?;
    writeln!(xml, "      <readonly/>")?;
    writeln!(xml, "      <address type='drive' controller='0' bus='0' target='0' unit='0'/>")?;
    writeln!(xml, "    </disk>")?;

    // 根盘，后端链指向基础镜像
    writeln!(xml, "    <disk type='file' device='disk'>")?;
    writeln!(xml, "      <driver name='qemu' type='qcow2' cache='writeback'/>")?;
    writeln!(xml, "      <source file='{}'/>", xml_escape(&config.disk_path.to_string_lossy()))?;
    writeln!(xml, "      <backingStore type='file'>")?;
    writeln!(xml, "        <format type='qcow2'/>")?;
    writeln!(xml, "        <source file='{}'/>", xml_escape(&config.backing_path.to_string_lossy()))?;
    writeln!(xml, "      </backingStore>")?;
    writeln!(xml, "      <target dev='vda' bus='virtio'/>")?;
    writeln!(xml, "    </disk>")?;

    writeln!(xml, "    <interface type='network'>")?;
    writeln!(xml, "      <source network='{}'/>", xml_escape(&config.network))?;
    writeln!(xml, "      <model type='virtio'/>")?;
    writeln!(xml, "    </interface>")?;

    // 串口控制台
    writeln!(xml, "    <serial type='pty'>")?;
    writeln!(xml, "      <target type='isa-serial' port='0'>")?;
    writeln!(xml, "        <model name='isa-serial'/>")?;
    writeln!(xml, "      </target>")?;
    writeln!(xml, "    </serial>")?;
    writeln!(xml, "    <console type='pty'>")?;
    writeln!(xml, "      <target type='serial' port='0'/>")?;
    writeln!(xml, "    </console>")?;

    // QEMU Guest Agent 通道
    writeln!(xml, "    <channel type='unix'>")?;
    writeln!(xml, "      <source mode='bind'/>")?;
    writeln!(xml, "      <target type='virtio' name='org.qemu.guest_agent.0'/>")?;
    writeln!(xml, "    </channel>")?;

    writeln!(xml, "    <graphics type='vnc' port='-1' autoport='yes' listen='127.0.0.1'/>")?;
    writeln!(xml, "    <video>")?;
    writeln!(xml, "      <model type='qxl' ram='65536' vram='65536' vgamem='16384' heads='1' primary='yes'/>")?;
    writeln!(xml, "    </video>")?;
    writeln!(xml, "    <memballoon model='virtio'/>")?;
    writeln!(xml, "    <rng model='virtio'>")?;
    writeln!(xml, "      <backend model='random'>/dev/urandom</backend>")?;
    writeln!(xml, "    </rng>")?;

    writeln!(xml, "  </devices>")?;
    writeln!(xml, "</domain>")?;
    Ok(())
}
