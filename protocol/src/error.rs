//! 错误类型定义

use thiserror::Error;

/// 协议错误类型
///
/// 帧层面的错误一律导致连接关闭。
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 序列化错误
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// 帧头声明的长度非法
    #[error("Invalid frame length: {length} (expected 1..={max})")]
    InvalidLength { length: usize, max: usize },

    /// 帧大小超限（编码端）
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// 空帧（编码端）
    #[error("Frame payload is empty")]
    EmptyFrame,

    /// 帧内容不是合法 UTF-8
    #[error("Frame payload is not valid UTF-8")]
    InvalidUtf8,

    /// 连接超时
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// 连接已关闭
    #[error("Connection closed")]
    ConnectionClosed,
}

/// 请求解析错误（不关闭连接，以错误响应返回）
#[derive(Error, Debug)]
pub enum RequestError {
    /// 未知的命令类型
    #[error("Unknown request type: {0}")]
    UnknownType(String),

    /// 参数缺失或类型错误
    #[error("Bad request data for {command}: {source}")]
    BadData {
        command: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// 协议操作结果类型
pub type Result<T> = std::result::Result<T, ProtocolError>;
