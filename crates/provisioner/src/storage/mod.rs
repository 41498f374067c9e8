/// 存储管理
///
/// 基础镜像获取、实例磁盘派生与存储池生命周期

pub mod fetch;
pub mod image_store;
pub mod qemu_img;

pub use fetch::{HttpFetcher, ImageFetcher};
pub use image_store::{ImageStore, DISK_VOLUME, SEED_VOLUME};
pub use qemu_img::{DiskTool, QemuImg};
