//! 协议常量定义

use std::time::Duration;

/// 帧头大小: 4 字节大端长度
pub const FRAME_HEADER_SIZE: usize = 4;

/// 消息帧最大大小（64 KiB）
pub const MAX_FRAME_SIZE: usize = 65536;

/// 单个传输分片的最大原始字节数
///
/// base64 会膨胀约 4/3，加上 JSON 包装后仍需落在 [`MAX_FRAME_SIZE`] 之内。
pub const MAX_CHUNK_BYTES: usize = 32 * 1024;

/// 对局记录默认页大小
pub const DEFAULT_HISTORY_PAGE: usize = 50;

/// 对局记录单页上限
pub const MAX_HISTORY_PAGE: usize = 200;

/// 用户名最大长度
pub const MAX_NAME_LEN: usize = 32;

/// 游戏描述最大长度
pub const MAX_DESC_LEN: usize = 500;

/// 游戏 ID / 版本号最大长度
pub const MAX_IDENT_LEN: usize = 64;

/// 开发者服务默认端口
pub const DEFAULT_DEVELOPER_PORT: u16 = 10102;

/// 大厅服务默认端口
pub const DEFAULT_LOBBY_PORT: u16 = 10103;

/// 连接超时（秒）
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// 连接超时 Duration
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(CONNECT_TIMEOUT_SECS);
