//! 消息类型定义
//!
//! - 请求: `{"type": <command>, "data": {...}}`
//! - 响应: `{"ok": true, ...}` / `{"ok": false, "error": <reason>, ...}`
//! - 推送: `{"type": "event", "name": <event>, "data": {...}}`

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::codec::base64_bytes;
use crate::error::RequestError;

/// 账号 ID
pub type AccountId = u64;

/// 房间 ID
pub type RoomId = u64;

/// 账号类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountKind {
    Developer,
    Player,
}

/// 房间状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    /// 等待玩家 / 可开始
    Open,
    /// 房主已发起开始，正在拉起游戏服务器
    Starting,
    /// 对局进行中
    Playing,
    /// 已解散
    Closed,
}

/// 房间成员角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Host,
    Member,
}

// ============================================================================
// 请求
// ============================================================================

/// 请求信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

/// 用户名 + 密码
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// 指定游戏
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRef {
    pub game_id: String,
}

/// 上架 / 下架
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelistRequest {
    pub game_id: String,
    #[serde(default = "default_true")]
    pub delisted: bool,
}

fn default_true() -> bool {
    true
}

/// 上传初始化
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadInit {
    /// 为空时根据 `name` 自动分配
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub version: String,
    #[serde(default)]
    pub file_name: Option<String>,
    pub size_bytes: u64,
    /// 小写十六进制 SHA-256
    #[serde(alias = "sha256")]
    pub hash: String,
}

/// 上传分片
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadChunk {
    pub upload_id: String,
    pub seq: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// 上传完成
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadFinish {
    pub upload_id: String,
    #[serde(default)]
    pub changelog: Option<String>,
}

/// 指定上传会话
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRef {
    pub upload_id: String,
}

/// 下载初始化
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInit {
    pub game_id: String,
    /// 为空时取最新版本
    #[serde(default)]
    pub version: Option<String>,
}

/// 下载窗口
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadChunk {
    pub download_id: String,
    pub offset: u64,
    #[serde(default)]
    pub limit: Option<u64>,
}

/// 指定下载会话
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRef {
    pub download_id: String,
}

/// 创建房间
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomCreate {
    pub game_id: String,
    /// 固定的版本；为空时取最新版本
    #[serde(default)]
    pub version: Option<String>,
}

/// 指定房间
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRef {
    pub room_id: RoomId,
}

/// 房主操作的目标房间；为空时取自己所在的房间
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomTarget {
    #[serde(default)]
    pub room_id: Option<RoomId>,
}

/// 对局记录分页；`limit` 为空时取默认页大小
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPage {
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// 游戏服务器回传的对局结果
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchReport {
    pub room_id: RoomId,
    /// 对局令牌，必须与拉起时下发的一致
    pub token: String,
    #[serde(default)]
    pub game_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub ended_at: Option<i64>,
    #[serde(default)]
    pub winner: Option<AccountId>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub results: Value,
}

/// 客户端发送给服务端的请求
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientRequest {
    // === 开发者 ===
    DevRegister(Credentials),
    DevLogin(Credentials),
    DevLogout,
    GameListMine,
    GameListVersions(GameRef),
    GameDelist(DelistRequest),
    GameUploadInit(UploadInit),
    GameUploadChunk(UploadChunk),
    GameUploadFinish(UploadFinish),
    GameUploadAbort(UploadRef),

    // === 玩家 ===
    PlayerRegister(Credentials),
    PlayerLogin(Credentials),
    PlayerLogout,
    PlayerList,

    // === 商店 ===
    StoreListGames,
    StoreGameDetail(GameRef),
    StoreDownloadInit(DownloadInit),
    StoreDownloadChunk(DownloadChunk),
    StoreDownloadAbort(DownloadRef),

    // === 房间 ===
    RoomCreate(RoomCreate),
    RoomJoin(RoomRef),
    RoomLeave,
    RoomList,
    RoomDetail(RoomRef),
    RoomStart(RoomTarget),
    RoomEnd(RoomTarget),
    RoomDismiss(RoomTarget),

    // === 游戏服务器回调 ===
    PostResult(MatchReport),

    // === 其他 ===
    MatchListMine(MatchPage),
    Ping,
}

fn payload<T: DeserializeOwned>(command: &'static str, data: Value) -> Result<T, RequestError> {
    serde_json::from_value(data).map_err(|source| RequestError::BadData { command, source })
}

impl ClientRequest {
    /// 从信封解析出具体请求
    ///
    /// 无参数的命令忽略 `data`；未知的 `type` 返回 [`RequestError::UnknownType`]。
    pub fn from_envelope(envelope: RequestEnvelope) -> Result<Self, RequestError> {
        let RequestEnvelope { kind, data } = envelope;
        let request = match kind.as_str() {
            "dev_register" => Self::DevRegister(payload("dev_register", data)?),
            "dev_login" => Self::DevLogin(payload("dev_login", data)?),
            "dev_logout" => Self::DevLogout,
            "game_list_mine" => Self::GameListMine,
            "game_list_versions" => Self::GameListVersions(payload("game_list_versions", data)?),
            "game_delist" => Self::GameDelist(payload("game_delist", data)?),
            "game_upload_init" => Self::GameUploadInit(payload("game_upload_init", data)?),
            "game_upload_chunk" => Self::GameUploadChunk(payload("game_upload_chunk", data)?),
            "game_upload_finish" => Self::GameUploadFinish(payload("game_upload_finish", data)?),
            "game_upload_abort" => Self::GameUploadAbort(payload("game_upload_abort", data)?),

            "player_register" => Self::PlayerRegister(payload("player_register", data)?),
            "player_login" => Self::PlayerLogin(payload("player_login", data)?),
            "player_logout" => Self::PlayerLogout,
            "player_list" => Self::PlayerList,

            "store_list_games" => Self::StoreListGames,
            "store_game_detail" => Self::StoreGameDetail(payload("store_game_detail", data)?),
            "store_download_init" => Self::StoreDownloadInit(payload("store_download_init", data)?),
            "store_download_chunk" => {
                Self::StoreDownloadChunk(payload("store_download_chunk", data)?)
            }
            "store_download_abort" => {
                Self::StoreDownloadAbort(payload("store_download_abort", data)?)
            }

            "room_create" => Self::RoomCreate(payload("room_create", data)?),
            "room_join" => Self::RoomJoin(payload("room_join", data)?),
            "room_leave" => Self::RoomLeave,
            "room_list" => Self::RoomList,
            "room_detail" => Self::RoomDetail(payload("room_detail", data)?),
            "room_start" => Self::RoomStart(optional_payload("room_start", data)?),
            "room_end" => Self::RoomEnd(optional_payload("room_end", data)?),
            "room_dismiss" => Self::RoomDismiss(optional_payload("room_dismiss", data)?),

            "post_result" => Self::PostResult(payload("post_result", data)?),

            "match_list_mine" => {
                Self::MatchListMine(optional_payload("match_list_mine", data)?)
            }
            "ping" => Self::Ping,

            _ => return Err(RequestError::UnknownType(kind)),
        };
        Ok(request)
    }

    /// 转成请求信封（客户端发送用）
    pub fn to_envelope(&self) -> serde_json::Result<RequestEnvelope> {
        serde_json::from_value(serde_json::to_value(self)?)
    }

    /// 命令名（线上 `type` 字段）
    pub fn command(&self) -> &'static str {
        match self {
            Self::DevRegister(_) => "dev_register",
            Self::DevLogin(_) => "dev_login",
            Self::DevLogout => "dev_logout",
            Self::GameListMine => "game_list_mine",
            Self::GameListVersions(_) => "game_list_versions",
            Self::GameDelist(_) => "game_delist",
            Self::GameUploadInit(_) => "game_upload_init",
            Self::GameUploadChunk(_) => "game_upload_chunk",
            Self::GameUploadFinish(_) => "game_upload_finish",
            Self::GameUploadAbort(_) => "game_upload_abort",
            Self::PlayerRegister(_) => "player_register",
            Self::PlayerLogin(_) => "player_login",
            Self::PlayerLogout => "player_logout",
            Self::PlayerList => "player_list",
            Self::StoreListGames => "store_list_games",
            Self::StoreGameDetail(_) => "store_game_detail",
            Self::StoreDownloadInit(_) => "store_download_init",
            Self::StoreDownloadChunk(_) => "store_download_chunk",
            Self::StoreDownloadAbort(_) => "store_download_abort",
            Self::RoomCreate(_) => "room_create",
            Self::RoomJoin(_) => "room_join",
            Self::RoomLeave => "room_leave",
            Self::RoomList => "room_list",
            Self::RoomDetail(_) => "room_detail",
            Self::RoomStart(_) => "room_start",
            Self::RoomEnd(_) => "room_end",
            Self::RoomDismiss(_) => "room_dismiss",
            Self::PostResult(_) => "post_result",
            Self::MatchListMine(_) => "match_list_mine",
            Self::Ping => "ping",
        }
    }
}

fn optional_payload<T: DeserializeOwned + Default>(
    command: &'static str,
    data: Value,
) -> Result<T, RequestError> {
    if data.is_null() {
        Ok(T::default())
    } else {
        payload(command, data)
    }
}

// ============================================================================
// 响应
// ============================================================================

/// 响应信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Response {
    /// 成功响应
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
            body: Map::new(),
        }
    }

    /// 成功响应，负载的字段平铺到顶层
    pub fn ok_with<T: Serialize>(body: &T) -> Self {
        match serde_json::to_value(body) {
            Ok(Value::Object(body)) => Self {
                ok: true,
                error: None,
                body,
            },
            Ok(other) => Self::ok().with("data", other),
            Err(_) => Self::error(ErrorCode::InternalError),
        }
    }

    /// 错误响应
    pub fn error(code: ErrorCode) -> Self {
        Self {
            ok: false,
            error: Some(code),
            body: Map::new(),
        }
    }

    /// 追加一个字段
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.body.insert(key.to_string(), value.into());
        self
    }

    /// 读取字段
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    /// 把平铺的字段解析成具体类型
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(Value::Object(self.body.clone()))
    }
}

// ============================================================================
// 推送事件
// ============================================================================

/// 对局交接信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameInfo {
    pub room_id: RoomId,
    pub game_id: String,
    pub version: String,
    pub host: String,
    pub port: u16,
    pub token: String,
}

/// 开始失败
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFailed {
    pub room_id: RoomId,
    pub error: ErrorCode,
}

/// 对局结束
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchEnded {
    pub room_id: RoomId,
    pub result: MatchResult,
}

/// 房间成员变化
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberChanged {
    pub room_id: RoomId,
    pub player_id: AccountId,
}

/// 房主变更
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostChanged {
    pub room_id: RoomId,
    pub host_player_id: AccountId,
}

/// 房间解散
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomClosed {
    pub room_id: RoomId,
}

/// 服务端推送事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data", rename_all = "snake_case")]
pub enum Event {
    GameInfo(GameInfo),
    StartFailed(StartFailed),
    MatchEnded(MatchEnded),
    PlayerJoined(MemberChanged),
    PlayerLeft(MemberChanged),
    HostChanged(HostChanged),
    RoomClosed(RoomClosed),
}

/// 服务端发出的一帧：响应或推送
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Response(Response),
    Event(Event),
}

#[derive(Serialize)]
struct EventFrame<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(flatten)]
    event: &'a Event,
}

impl Serialize for ServerFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ServerFrame::Response(response) => response.serialize(serializer),
            ServerFrame::Event(event) => EventFrame {
                kind: "event",
                event,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for ServerFrame {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use serde::de::Error as _;

        let mut value = Value::deserialize(deserializer)?;
        if value.get("type").and_then(Value::as_str) == Some("event") {
            if let Some(object) = value.as_object_mut() {
                object.remove("type");
            }
            serde_json::from_value(value)
                .map(ServerFrame::Event)
                .map_err(D::Error::custom)
        } else {
            serde_json::from_value(value)
                .map(ServerFrame::Response)
                .map_err(D::Error::custom)
        }
    }
}

impl From<Response> for ServerFrame {
    fn from(response: Response) -> Self {
        ServerFrame::Response(response)
    }
}

impl From<Event> for ServerFrame {
    fn from(event: Event) -> Self {
        ServerFrame::Event(event)
    }
}

// ============================================================================
// 共享数据视图
// ============================================================================

/// 对局结果记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub room_id: RoomId,
    pub game_id: String,
    pub version: String,
    pub started_at: i64,
    pub ended_at: i64,
    pub winner: Option<AccountId>,
    pub reason: String,
    #[serde(default)]
    pub results: Value,
    #[serde(default)]
    pub players: Vec<AccountId>,
}

/// 房间成员
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberView {
    pub player_id: AccountId,
    pub role: MemberRole,
    /// 对局中途离开的成员
    pub absent: bool,
}

/// 房间信息（用于列表和详情）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomView {
    pub room_id: RoomId,
    pub game_id: String,
    pub version: String,
    pub host_player_id: AccountId,
    pub state: RoomState,
    pub members: Vec<MemberView>,
    pub min_players: u32,
    pub max_players: u32,
}

// ============================================================================
// 错误码
// ============================================================================

/// 错误码定义（线上为 snake_case 字符串）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // === 认证 ===
    BadCredentials,
    AlreadyOnline,
    DuplicateAccount,
    Unauthenticated,

    // === 房间状态 ===
    AlreadyStarting,
    RoomFull,
    NotHost,
    WrongState,
    NotEnoughPlayers,
    AlreadyInRoom,
    NotInRoom,

    // === 传输 ===
    HashMismatch,
    SizeMismatch,
    SequenceError,
    UnknownTransferId,

    // === 对局编排 ===
    SpawnFailed,
    NoPortsAvailable,
    BadToken,

    // === 存储 ===
    StoreUnavailable,

    // === 请求 ===
    BadRequest,
    UnknownType,
    NotFound,
    Forbidden,
    AlreadyExists,
    InvalidPackage,
    GameDelisted,
    ResponseTooLarge,
    InternalError,
}

impl ErrorCode {
    /// 线上字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadCredentials => "bad_credentials",
            ErrorCode::AlreadyOnline => "already_online",
            ErrorCode::DuplicateAccount => "duplicate_account",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::AlreadyStarting => "already_starting",
            ErrorCode::RoomFull => "room_full",
            ErrorCode::NotHost => "not_host",
            ErrorCode::WrongState => "wrong_state",
            ErrorCode::NotEnoughPlayers => "not_enough_players",
            ErrorCode::AlreadyInRoom => "already_in_room",
            ErrorCode::NotInRoom => "not_in_room",
            ErrorCode::HashMismatch => "hash_mismatch",
            ErrorCode::SizeMismatch => "size_mismatch",
            ErrorCode::SequenceError => "sequence_error",
            ErrorCode::UnknownTransferId => "unknown_transfer_id",
            ErrorCode::SpawnFailed => "spawn_failed",
            ErrorCode::NoPortsAvailable => "no_ports_available",
            ErrorCode::BadToken => "bad_token",
            ErrorCode::StoreUnavailable => "store_unavailable",
            ErrorCode::BadRequest => "bad_request",
            ErrorCode::UnknownType => "unknown_type",
            ErrorCode::NotFound => "not_found",
            ErrorCode::Forbidden => "forbidden",
            ErrorCode::AlreadyExists => "already_exists",
            ErrorCode::InvalidPackage => "invalid_package",
            ErrorCode::GameDelisted => "game_delisted",
            ErrorCode::ResponseTooLarge => "response_too_large",
            ErrorCode::InternalError => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
