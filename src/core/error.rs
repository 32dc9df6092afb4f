//! 错误处理模块
//!
//! 定义了命令提交核心中使用的统一错误类型，使用 `thiserror` 提供友好的错误消息。
//!
//! # 错误分类
//!
//! - **资源耗尽**（`OutOfCommandLists`）：命令记录器池已满且没有已完成的记录器可回收，
//!   调用方可以 `flush` 后重试
//! - **协议违规**（`InvalidCommandListState` / `InvalidArgument`）：调用方在错误的状态下
//!   调用了操作，属于调用方的 bug，只报告不纠正
//! - **设备错误**（`GenericDevice` / `OutOfMemory`）：底层图形 API 调用失败，
//!   对当前操作是致命的，但不影响进程
//!
//! 核心内部没有任何自动重试。

use thiserror::Error;

/// 统一的 Result 类型
///
/// 所有可能返回错误的函数都应该使用这个类型。
pub type Result<T> = std::result::Result<T, DistQueueError>;

/// 命令提交核心的错误类型
#[derive(Debug, Error)]
pub enum DistQueueError {
    /// 命令记录器池已满，且 FIFO 队首的记录器尚未在 GPU 上完成
    #[error("Out of command lists: recorder pool is at capacity and nothing in flight has completed")]
    OutOfCommandLists,

    /// 在错误的状态下操作命令列表
    #[error("Invalid command list state: {0}")]
    InvalidCommandListState(String),

    /// 参数无效
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// 底层设备调用失败
    #[error("Device error: {0}")]
    GenericDevice(String),

    /// 设备内存不足
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 配置相关的错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// 配置文件解析失败
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// 配置值无效
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 资源耗尽，可恢复
    Exhaustion,
    /// 调用方违反了使用协议
    ProtocolViolation,
    /// 底层设备失败
    Device,
    /// 配置或 IO 问题
    Configuration,
}

impl DistQueueError {
    /// 获取错误类别
    pub fn kind(&self) -> ErrorKind {
        match self {
            DistQueueError::OutOfCommandLists => ErrorKind::Exhaustion,
            DistQueueError::InvalidCommandListState(_) | DistQueueError::InvalidArgument(_) => {
                ErrorKind::ProtocolViolation
            }
            DistQueueError::GenericDevice(_) | DistQueueError::OutOfMemory(_) => ErrorKind::Device,
            DistQueueError::Config(_) | DistQueueError::Io(_) => ErrorKind::Configuration,
        }
    }

    /// 调用方是否可以通过退避或 `flush` 恢复
    pub fn is_recoverable(&self) -> bool {
        self.kind() == ErrorKind::Exhaustion
    }

    pub(crate) fn invalid_state(msg: impl Into<String>) -> Self {
        DistQueueError::InvalidCommandListState(msg.into())
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        DistQueueError::InvalidArgument(msg.into())
    }

    pub(crate) fn device(msg: impl Into<String>) -> Self {
        DistQueueError::GenericDevice(msg.into())
    }
}
