use thiserror::Error;

/// 统一错误类型
#[derive(Error, Debug)]
pub enum Error {
    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("资源已存在: {0}")]
    AlreadyExists(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("无效参数: {0}")]
    InvalidArgument(String),

    #[error("不支持的宿主机平台: {0}")]
    UnsupportedHostPlatform(String),

    #[error("虚拟化错误: {0}")]
    Hypervisor(String),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("镜像创建失败: {0}")]
    ImageCreationFailed(String),

    #[error("连接暂不可用: {0}")]
    Connectivity(String),

    #[error("认证错误: {0}")]
    Authentication(String),

    #[error("远程命令执行失败: {0}")]
    RemoteCommand(String),

    #[error("等待超时: {0}")]
    Timeout(String),

    #[error("操作已取消: {0}")]
    Cancelled(String),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML 错误: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("内部错误: {0}")]
    Internal(String),

    #[error("其他错误: {0}")]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// 资源不存在，多数调用点将其视为"继续创建"而不是失败
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// 可重试的瞬时错误（SSH 尚未监听、IP 尚未分配）
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Connectivity(_))
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, Error>;
