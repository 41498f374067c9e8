/// 实例：cloud-init 种子与生命周期

pub mod lifecycle;
pub mod seed;

pub use lifecycle::{InstanceLifecycle, LaunchContext, LifecycleSettings};
pub use seed::{GenIsoSeedBuilder, SeedBuilder, SeedRequest};
