//! 游戏大厅共享协议库
//!
//! 包含:
//! - 帧编解码 (长度前缀 + JSON)
//! - 消息类型定义 (ClientRequest, Response, Event, ServerFrame)
//! - 传输层抽象 (Connector, Connection, Listener traits)

pub mod codec;
mod constants;
mod error;
mod message;
mod transport;

pub use codec::{encode_frame, encode_message, FrameDecoder};
pub use constants::*;
pub use error::{ProtocolError, RequestError, Result};
pub use message::{
    AccountId, AccountKind, ClientRequest, Credentials, DelistRequest, DownloadChunk,
    DownloadInit, DownloadRef, ErrorCode, Event, GameInfo, GameRef, HostChanged, MatchEnded,
    MatchPage, MatchReport, MatchResult, MemberChanged, MemberRole, MemberView, RequestEnvelope,
    Response, RoomClosed, RoomCreate, RoomId, RoomRef, RoomState, RoomTarget, RoomView,
    ServerFrame, StartFailed, UploadChunk, UploadFinish, UploadInit, UploadRef,
};
pub use transport::{
    Connection, Connector, FrameReader, FrameWriter, Listener, TcpConnection, TcpConnector,
    TcpListener,
};
