//! 游戏大厅服务端
//!
//! 包含:
//! - 会话注册
//! - 游戏包分片上传 / 下载
//! - 房间系统
//! - 对局编排（拉起游戏服务器、回收结果）
//! - 记录存储

pub mod archive;
pub mod config;
pub mod error;
pub mod ids;
pub mod manifest;
pub mod orchestrator;
pub mod outbox;
pub mod room;
pub mod router;
pub mod server;
pub mod session;
pub mod store;
pub mod transfer;

pub use config::LobbyConfig;
pub use error::{LobbyError, LobbyResult};
pub use orchestrator::{GameLauncher, GameProcess, LaunchPlan, Orchestrator, ProcessLauncher};
pub use room::{Room, RoomManager};
pub use router::{MessageHandler, Surface};
pub use server::{serve, spawn_janitor, LobbyState};
pub use session::SessionRegistry;
pub use store::{MemoryStore, Store};
pub use transfer::TransferEngine;
