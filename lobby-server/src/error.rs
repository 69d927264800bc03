//! 服务端错误类型
//!
//! 按类别划分，每个变体对应唯一一个线上 [`ErrorCode`]。

use protocol::{ErrorCode, RequestError};
use thiserror::Error;

/// 认证错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("用户名或密码错误")]
    BadCredentials,
    #[error("账号已在线")]
    AlreadyOnline,
    #[error("用户名已被占用")]
    DuplicateAccount,
    #[error("未登录")]
    Unauthenticated,
}

/// 房间状态错误（不修改任何状态）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("房间正在开始或已在对局中")]
    AlreadyStarting,
    #[error("房间已满")]
    RoomFull,
    #[error("只有房主可以执行该操作")]
    NotHost,
    #[error("房间状态不允许该操作")]
    WrongState,
    #[error("玩家人数不足")]
    NotEnoughPlayers,
    #[error("已在其他房间中")]
    AlreadyInRoom,
    #[error("不在房间中")]
    NotInRoom,
}

/// 传输错误（对应的传输会话被丢弃）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("文件哈希不匹配")]
    HashMismatch,
    #[error("文件大小不匹配: 期望 {expected}, 实际 {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("分片序号错误: 期望 {expected}, 收到 {received}")]
    SequenceError { expected: u64, received: u64 },
    #[error("未知的传输会话: {0}")]
    UnknownTransferId(String),
}

/// 对局编排错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error("游戏服务器启动失败: {0}")]
    SpawnFailed(String),
    #[error("没有可用端口")]
    NoPortsAvailable,
    #[error("对局令牌无效")]
    BadToken,
}

/// 记录存储错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 暂时不可用（I/O 失败等）
    #[error("存储不可用: {0}")]
    Unavailable(String),
    /// 唯一键冲突
    #[error("记录已存在")]
    Conflict,
    /// 关联记录不存在
    #[error("记录不存在")]
    Missing,
}

/// 大厅服务错误
#[derive(Error, Debug)]
pub enum LobbyError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Orchestration(#[from] OrchestrationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error("不存在: {0}")]
    NotFound(&'static str),

    #[error("无权操作")]
    Forbidden,

    #[error("已存在: {0}")]
    AlreadyExists(&'static str),

    #[error("游戏包无效: {0}")]
    InvalidPackage(String),

    #[error("游戏已下架")]
    GameDelisted,

    #[error("响应过大: {size} 字节 (上限 {max})")]
    ResponseTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl LobbyError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        LobbyError::BadRequest(msg.into())
    }

    pub fn invalid_package(msg: impl Into<String>) -> Self {
        LobbyError::InvalidPackage(msg.into())
    }

    /// 对应的线上错误码
    pub fn code(&self) -> ErrorCode {
        match self {
            LobbyError::Auth(e) => match e {
                AuthError::BadCredentials => ErrorCode::BadCredentials,
                AuthError::AlreadyOnline => ErrorCode::AlreadyOnline,
                AuthError::DuplicateAccount => ErrorCode::DuplicateAccount,
                AuthError::Unauthenticated => ErrorCode::Unauthenticated,
            },
            LobbyError::State(e) => match e {
                StateError::AlreadyStarting => ErrorCode::AlreadyStarting,
                StateError::RoomFull => ErrorCode::RoomFull,
                StateError::NotHost => ErrorCode::NotHost,
                StateError::WrongState => ErrorCode::WrongState,
                StateError::NotEnoughPlayers => ErrorCode::NotEnoughPlayers,
                StateError::AlreadyInRoom => ErrorCode::AlreadyInRoom,
                StateError::NotInRoom => ErrorCode::NotInRoom,
            },
            LobbyError::Transfer(e) => match e {
                TransferError::HashMismatch => ErrorCode::HashMismatch,
                TransferError::SizeMismatch { .. } => ErrorCode::SizeMismatch,
                TransferError::SequenceError { .. } => ErrorCode::SequenceError,
                TransferError::UnknownTransferId(_) => ErrorCode::UnknownTransferId,
            },
            LobbyError::Orchestration(e) => match e {
                OrchestrationError::SpawnFailed(_) => ErrorCode::SpawnFailed,
                OrchestrationError::NoPortsAvailable => ErrorCode::NoPortsAvailable,
                OrchestrationError::BadToken => ErrorCode::BadToken,
            },
            LobbyError::Store(StoreError::Unavailable(_)) => ErrorCode::StoreUnavailable,
            LobbyError::Store(StoreError::Conflict) => ErrorCode::AlreadyExists,
            LobbyError::Store(StoreError::Missing) => ErrorCode::NotFound,
            LobbyError::Request(RequestError::UnknownType(_)) => ErrorCode::UnknownType,
            LobbyError::Request(RequestError::BadData { .. }) => ErrorCode::BadRequest,
            LobbyError::BadRequest(_) => ErrorCode::BadRequest,
            LobbyError::NotFound(_) => ErrorCode::NotFound,
            LobbyError::Forbidden => ErrorCode::Forbidden,
            LobbyError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            LobbyError::InvalidPackage(_) => ErrorCode::InvalidPackage,
            LobbyError::GameDelisted => ErrorCode::GameDelisted,
            LobbyError::ResponseTooLarge { .. } => ErrorCode::ResponseTooLarge,
            LobbyError::Io(_) | LobbyError::Internal(_) => ErrorCode::InternalError,
        }
    }
}

/// 服务端操作结果类型
pub type LobbyResult<T> = std::result::Result<T, LobbyError>;
