/// 虚拟网络 XML 生成与解析

use common::metadata::NetworkTag;
use common::models::{Network, NetworkType};
use common::utils::{xml_escape, Ipv4Cidr};
use common::{Error, Result};
use std::fmt::Write;
use std::net::Ipv4Addr;

/// Linux 网桥名最大长度
const MAX_BRIDGE_NAME: usize = 15;

/// 生成网络 XML 配置
pub fn generate_network_xml(network: &Network) -> Result<String> {
    if network.name.len() > MAX_BRIDGE_NAME {
        return Err(Error::Config(format!(
            "网络名 {} 超过 {} 个字符，无法用作网桥名",
            network.name, MAX_BRIDGE_NAME
        )));
    }

    let mut xml = String::new();
    write_network(&mut xml, network)
        .map_err(|e| Error::Internal(format!("生成网络 XML 失败: {}", e)))?;
    Ok(xml)
}

fn write_network(xml: &mut String, network: &Network) -> std::fmt::Result {
    let tag = NetworkTag {
        network_type: network.network_type,
        dns_server: network.dns_server,
    };
    let name = xml_escape(&network.name);

    writeln!(xml, "<network>")?;
    writeln!(xml, "  <name>{}</name>", name)?;
    writeln!(xml, "  <metadata>")?;
    writeln!(xml, "    {}", tag.to_xml())?;
    writeln!(xml, "  </metadata>")?;

    match network.network_type {
        NetworkType::Bridge => {
            writeln!(xml, "  <forward mode='nat'>")?;
            writeln!(xml, "    <nat>")?;
            writeln!(xml, "      <port start='1024' end='65535'/>")?;
            writeln!(xml, "    </nat>")?;
            writeln!(xml, "  </forward>")?;
            writeln!(xml, "  <bridge name='{}' stp='on' delay='0'/>", name)?;
            writeln!(
                xml,
                "  <ip address='{}' netmask='{}'>",
                network.gateway,
                network.subnet.netmask()
            )?;
            if let Some((start, end)) = network.dhcp.then(|| network.dhcp_range()).flatten() {
                writeln!(xml, "    <dhcp>")?;
                writeln!(xml, "      <range start='{}' end='{}'/>", start, end)?;
                writeln!(xml, "    </dhcp>")?;
            }
            writeln!(xml, "  </ip>")?;
        }
        NetworkType::Ovs => {
            // 接入预先创建好的同名 OVS 网桥，地址由外部管理
            writeln!(xml, "  <forward mode='bridge'/>")?;
            writeln!(xml, "  <bridge name='{}'/>", name)?;
            writeln!(xml, "  <virtualport type='openvswitch'/>")?;
        }
    }

    writeln!(xml, "</network>")?;
    Ok(())
}

/// 解析网络 XML，没有归属标签时返回 None
pub fn parse_network(name: &str, xml: &str, active: bool) -> Result<Option<Network>> {
    let Some(tag) = NetworkTag::from_network_xml(xml)? else {
        return Ok(None);
    };

    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| Error::Internal(format!("解析XML失败: {}", e)))?;

    let ip_node = doc
        .root_element()
        .children()
        .find(|n| n.has_tag_name("ip") && n.attribute("family").map_or(true, |f| f == "ipv4"));

    let (gateway, subnet, dhcp) = match ip_node {
        Some(ip) => {
            let gateway = parse_addr(ip.attribute("address"), "address")?;
            let prefix = match (ip.attribute("prefix"), ip.attribute("netmask")) {
                (Some(p), _) => p
                    .parse::<u8>()
                    .map_err(|_| Error::Network(format!("网络 {} 前缀无效: {}", name, p)))?,
                (None, Some(mask)) => u32::from(parse_addr(Some(mask), "netmask")?).count_ones() as u8,
                (None, None) => 24,
            };
            let dhcp = ip.children().any(|n| n.has_tag_name("dhcp"));
            (gateway, Ipv4Cidr::new(gateway, prefix)?, dhcp)
        }
        None => {
            // OVS 网络没有 ip 段，以 DNS 地址占位
            (tag.dns_server, Ipv4Cidr::new(tag.dns_server, 32)?, false)
        }
    };

    Ok(Some(Network {
        name: name.to_string(),
        network_type: tag.network_type,
        subnet,
        gateway,
        dns_server: tag.dns_server,
        dhcp,
        active,
    }))
}

fn parse_addr(value: Option<&str>, what: &str) -> Result<Ipv4Addr> {
    let value = value.ok_or_else(|| Error::Network(format!("网络 XML 缺少 {}", what)))?;
    value
        .parse()
        .map_err(|_| Error::Network(format!("网络 XML 中 {} 无效: {}", what, value)))
}
