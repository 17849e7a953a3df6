//! 错误分类，每一类对应一个独立的进程退出码

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("描述文件格式错误: {0}")]
    MalformedDescriptor(String),

    #[error("源地址无效: {0}")]
    InvalidSource(String),

    #[error("获取源码失败: {0}")]
    FetchError(String),

    #[error("未找到: {0}")]
    NotFound(String),

    #[error("安装失败: {message}")]
    InstallError {
        message: String,
        /// 失败前已经写入前缀目录的文件（不会自动回滚）
        written: Vec<PathBuf>,
    },

    #[error("注册定时任务失败: {0}")]
    RegistrationError(String),

    #[error("验证失败: {0}")]
    VerificationError(String),

    #[error("{0} 正在安装中")]
    AlreadyInstalling(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("已安装包记录读写失败: {0}")]
    Registry(String),
}

impl Error {
    pub fn install(message: impl Into<String>) -> Self {
        Error::InstallError {
            message: message.into(),
            written: Vec::new(),
        }
    }

    /// 进程退出码
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::MalformedDescriptor(_) => 2,
            Error::InvalidSource(_) => 3,
            Error::FetchError(_) => 4,
            Error::NotFound(_) => 5,
            Error::InstallError { .. } => 6,
            Error::RegistrationError(_) => 7,
            Error::VerificationError(_) => 8,
            Error::AlreadyInstalling(_) => 9,
            Error::Config(_) | Error::Registry(_) => 1,
        }
    }
}
