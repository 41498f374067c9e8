/// 网络管理
///
/// 基于 libvirt 虚拟网络，支持 NAT 网桥与 Open vSwitch

pub mod manager;
pub mod xml;

pub use manager::NetworkManager;
