/// 元数据标签编解码
///
/// 集群归属信息以带命名空间和版本号的 XML 元素写入 libvirt 对象的
/// `<metadata>` 节点。解码只认根元素的命名空间，子元素按本地名匹配，
/// 未知子元素与未知属性一律忽略，高版本写入的标签仍可被读取。

use crate::models::{NetworkType, Role};
use crate::utils::xml_escape;
use crate::{Error, Result};
use roxmltree::{Document, Node};
use std::net::Ipv4Addr;

/// libvirt 元数据命名空间前缀
pub const PREFIX: &str = "easyvm";

/// 当前标签版本
pub const SCHEMA_VERSION: u32 = 1;

pub const INSTANCE_NS: &str = "http://easyvm.io/instance/v1";
pub const ADDRESS_NS: &str = "http://easyvm.io/address/v1";
pub const NETWORK_NS: &str = "http://easyvm.io/network/v1";

/// 实例归属标签
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTag {
    pub cluster: String,
    pub suffix: String,
    pub role: Role,
    /// 集群网段槽位，创建时分配，同一集群的实例相同
    pub slot: u32,
}

impl InstanceTag {
    pub fn to_xml(&self) -> String {
        element(
            "instance",
            INSTANCE_NS,
            &[
                ("cluster", self.cluster.as_str()),
                ("suffix", self.suffix.as_str()),
                ("role", self.role.as_str()),
                ("slot", &self.slot.to_string()),
            ],
        )
    }

    /// 从完整的 domain XML 中提取标签，没有标签时返回 None
    pub fn from_domain_xml(xml: &str) -> Result<Option<Self>> {
        let doc = parse(xml)?;
        let Some(node) = find_tag(&doc, "instance", INSTANCE_NS) else {
            return Ok(None);
        };

        let role = required(&node, "role")?.parse::<Role>()?;
        let raw_slot = required(&node, "slot")?;
        let slot = raw_slot
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("槽位内容无效: {}", raw_slot)))?;
        Ok(Some(Self {
            cluster: required(&node, "cluster")?,
            suffix: required(&node, "suffix")?,
            role,
            slot,
        }))
    }
}

/// 实例地址标签，IP 分配后回写，虚拟机关机后仍可查询
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTag {
    pub ip: Ipv4Addr,
}

impl AddressTag {
    pub fn to_xml(&self) -> String {
        element("address", ADDRESS_NS, &[("ip", &self.ip.to_string())])
    }

    pub fn from_domain_xml(xml: &str) -> Result<Option<Self>> {
        let doc = parse(xml)?;
        let Some(node) = find_tag(&doc, "address", ADDRESS_NS) else {
            return Ok(None);
        };

        let raw = required(&node, "ip")?;
        let ip = raw
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("地址标签内容无效: {}", raw)))?;
        Ok(Some(Self { ip }))
    }
}

/// 网络归属标签，用于区分本工具创建的网络
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkTag {
    pub network_type: NetworkType,
    pub dns_server: Ipv4Addr,
}

impl NetworkTag {
    pub fn to_xml(&self) -> String {
        element(
            "network",
            NETWORK_NS,
            &[
                ("owner", PREFIX),
                ("type", self.network_type.as_str()),
                ("dns", &self.dns_server.to_string()),
            ],
        )
    }

    pub fn from_network_xml(xml: &str) -> Result<Option<Self>> {
        let doc = parse(xml)?;
        let Some(node) = find_tag(&doc, "network", NETWORK_NS) else {
            return Ok(None);
        };

        let network_type = required(&node, "type")?.parse::<NetworkType>()?;
        let raw = required(&node, "dns")?;
        let dns_server = raw
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("网络标签 DNS 无效: {}", raw)))?;
        Ok(Some(Self { network_type, dns_server }))
    }
}

fn element(name: &str, ns: &str, fields: &[(&str, &str)]) -> String {
    let mut xml = format!(
        "<{p}:{n} xmlns:{p}=\"{ns}\" version=\"{v}\">",
        p = PREFIX,
        n = name,
        ns = ns,
        v = SCHEMA_VERSION
    );
    for (key, value) in fields {
        xml.push_str(&format!("<{p}:{k}>{v}</{p}:{k}>", p = PREFIX, k = key, v = xml_escape(value)));
    }
    xml.push_str(&format!("</{}:{}>", PREFIX, name));
    xml
}

fn parse(xml: &str) -> Result<Document<'_>> {
    Document::parse(xml).map_err(|e| Error::Internal(format!("解析元数据 XML 失败: {}", e)))
}

fn find_tag<'a, 'input>(doc: &'a Document<'input>, name: &str, ns: &str) -> Option<Node<'a, 'input>> {
    doc.descendants().find(|n| {
        n.is_element() && n.tag_name().name() == name && n.tag_name().namespace() == Some(ns)
    })
}

fn required(node: &Node<'_, '_>, child: &str) -> Result<String> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == child)
        .and_then(|n| n.text())
        .map(|t| t.trim().to_string())
        .ok_or_else(|| Error::InvalidArgument(format!("元数据标签缺少字段: {}", child)))
}
