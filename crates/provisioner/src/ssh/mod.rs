/// SSH 相关：就绪探测、known_hosts 维护、远程命令执行

pub mod known_hosts;
pub mod probe;
pub mod remote;

pub use known_hosts::KnownHosts;
pub use probe::{wait_for_ssh, OpenSshProbe, SshProbe};
pub use remote::{OpenSshExecutor, RemoteExecutor};
