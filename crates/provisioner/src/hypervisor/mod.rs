/// 虚拟化管理
///
/// 与 libvirt/QEMU/KVM 交互

pub mod backend;
pub mod domain_xml;
pub mod manager;

pub use backend::{DomainRecord, NetworkRecord, PoolInfo, SnapshotRecord, VirtBackend, VolumeInfo};
pub use manager::HypervisorManager;
