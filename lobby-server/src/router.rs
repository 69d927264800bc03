//! 请求分发
//!
//! 每条请求得到一条响应；房间变化产生的推送在状态修改完成后统一发出。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use protocol::{
    AccountId, AccountKind, ClientRequest, Credentials, DelistRequest, ErrorCode, GameRef,
    MatchPage, MatchReport, MatchResult, Response, RoomCreate, RoomId, RoomState, RoomTarget,
    ServerFrame, DEFAULT_HISTORY_PAGE, MAX_FRAME_SIZE, MAX_HISTORY_PAGE,
};

use crate::error::{AuthError, LobbyError, LobbyResult, StateError};
use crate::manifest::ClientType;
use crate::outbox::Pending;
use crate::server::LobbyState;
use crate::session::{ConnectionId, Session};
use crate::store::{GamePackage, GameVersion};

/// 服务入口
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Surface {
    /// 开发者服务
    Developer,
    /// 玩家大厅
    Lobby,
}

impl Surface {
    /// 该入口登录的账号类型
    pub fn account_kind(self) -> AccountKind {
        match self {
            Surface::Developer => AccountKind::Developer,
            Surface::Lobby => AccountKind::Player,
        }
    }

    /// 连接建立后的问候
    pub fn greeting(self) -> Response {
        let hello = match self {
            Surface::Developer => "developer_ready",
            Surface::Lobby => "lobby_ready",
        };
        Response::ok().with("hello", hello)
    }

    /// 该入口是否处理这条命令
    pub fn accepts(self, request: &ClientRequest) -> bool {
        use ClientRequest::*;
        match request {
            Ping => true,
            DevRegister(_) | DevLogin(_) | DevLogout | GameListMine | GameListVersions(_)
            | GameDelist(_) | GameUploadInit(_) | GameUploadChunk(_) | GameUploadFinish(_)
            | GameUploadAbort(_) => self == Surface::Developer,
            _ => self == Surface::Lobby,
        }
    }
}

/// 单个连接的上下文
pub struct ConnectionContext {
    pub id: ConnectionId,
    pub surface: Surface,
    /// 本连接上登录得到的令牌
    pub token: Option<String>,
    /// 推送通道
    pub tx: mpsc::Sender<ServerFrame>,
}

impl ConnectionContext {
    pub fn new(id: ConnectionId, surface: Surface, tx: mpsc::Sender<ServerFrame>) -> Self {
        Self {
            id,
            surface,
            token: None,
            tx,
        }
    }
}

/// 开发者自己的游戏
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub game_id: String,
    pub name: String,
    pub description: String,
    pub delisted: bool,
    pub latest_version: Option<String>,
    pub version_count: usize,
}

impl From<&GamePackage> for GameSummary {
    fn from(package: &GamePackage) -> Self {
        Self {
            game_id: package.game_id.clone(),
            name: package.name.clone(),
            description: package.description.clone(),
            delisted: package.delisted,
            latest_version: package.latest().map(|v| v.version.clone()),
            version_count: package.versions.len(),
        }
    }
}

/// 版本信息
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionView {
    pub version: String,
    pub client_type: ClientType,
    pub min_players: u32,
    pub max_players: u32,
    pub size_bytes: u64,
    pub hash: String,
    pub file_name: String,
    pub changelog: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<&GameVersion> for VersionView {
    fn from(version: &GameVersion) -> Self {
        Self {
            version: version.version.clone(),
            client_type: version.client_type,
            min_players: version.min_players,
            max_players: version.max_players,
            size_bytes: version.size_bytes,
            hash: version.hash.clone(),
            file_name: version.file_name.clone(),
            changelog: version.changelog.clone(),
            uploaded_at: version.uploaded_at,
        }
    }
}

/// 商店中的游戏
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEntry {
    pub game_id: String,
    pub name: String,
    pub description: String,
    pub developer: String,
    pub latest: VersionView,
}

/// 在线玩家
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerView {
    pub player_id: AccountId,
    pub username: String,
    pub room_id: Option<RoomId>,
    pub room_state: Option<RoomState>,
}

fn json<T: Serialize>(value: &T) -> LobbyResult<Value> {
    serde_json::to_value(value).map_err(|e| LobbyError::Internal(e.to_string()))
}

/// 阻塞线程池中执行
async fn blocking<T, F>(f: F) -> LobbyResult<T>
where
    F: FnOnce() -> LobbyResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| LobbyError::Internal(e.to_string()))?
}

/// 消息处理器
pub struct MessageHandler;

impl MessageHandler {
    /// 处理一条请求
    pub async fn handle(
        state: &Arc<LobbyState>,
        ctx: &mut ConnectionContext,
        request: ClientRequest,
    ) -> Response {
        let command = request.command();
        if !ctx.surface.accepts(&request) {
            debug!("连接 {} 在 {:?} 上发送了 {}", ctx.id, ctx.surface, command);
            return Response::error(ErrorCode::UnknownType);
        }

        let result = Self::dispatch(state, ctx, request)
            .await
            .and_then(Self::ensure_fits);

        match result {
            Ok(response) => response,
            Err(e) => {
                match e.code() {
                    ErrorCode::InternalError
                    | ErrorCode::StoreUnavailable
                    | ErrorCode::ResponseTooLarge => {
                        error!("{} 失败 (连接 {}): {}", command, ctx.id, e)
                    }
                    _ => warn!("{} 被拒绝 (连接 {}): {}", command, ctx.id, e),
                }
                Response::error(e.code())
            }
        }
    }

    /// 响应必须能装进一帧，否则改为错误响应
    fn ensure_fits(response: Response) -> LobbyResult<Response> {
        let size = serde_json::to_vec(&response)
            .map_err(|e| LobbyError::Internal(e.to_string()))?
            .len();
        if size > MAX_FRAME_SIZE {
            return Err(LobbyError::ResponseTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(response)
    }

    /// 请求解析失败
    pub fn reject(ctx: &ConnectionContext, e: LobbyError) -> Response {
        warn!("连接 {} 的请求无法解析: {}", ctx.id, e);
        Response::error(e.code())
    }

    async fn dispatch(
        state: &Arc<LobbyState>,
        ctx: &mut ConnectionContext,
        request: ClientRequest,
    ) -> LobbyResult<Response> {
        match request {
            ClientRequest::Ping => Ok(Response::ok().with("pong", true)),

            ClientRequest::DevRegister(c) | ClientRequest::PlayerRegister(c) => {
                Self::handle_register(state, ctx, c)
            }
            ClientRequest::DevLogin(c) | ClientRequest::PlayerLogin(c) => {
                Self::handle_login(state, ctx, c)
            }
            ClientRequest::DevLogout | ClientRequest::PlayerLogout => {
                Self::handle_logout(state, ctx).await
            }

            // 游戏服务器回调以令牌认证，不需要登录
            ClientRequest::PostResult(report) => Self::handle_post_result(state, report).await,

            request => {
                let session = Self::session(state, ctx)?;
                Self::dispatch_authenticated(state, ctx, &session, request).await
            }
        }
    }

    async fn dispatch_authenticated(
        state: &Arc<LobbyState>,
        ctx: &mut ConnectionContext,
        session: &Session,
        request: ClientRequest,
    ) -> LobbyResult<Response> {
        let me = session.account_id;
        let conn = ctx.id;

        match request {
            // === 开发者 ===
            ClientRequest::GameListMine => Self::handle_list_mine(state, me),
            ClientRequest::GameListVersions(GameRef { game_id }) => {
                Self::handle_list_versions(state, me, &game_id)
            }
            ClientRequest::GameDelist(req) => Self::handle_delist(state, me, req),
            ClientRequest::GameUploadInit(init) => {
                Ok(Response::ok_with(&state.transfers.begin_upload(conn, me, init)?))
            }
            ClientRequest::GameUploadChunk(chunk) => {
                let transfers = state.transfers.clone();
                let ack = blocking(move || {
                    transfers.upload_chunk(conn, &chunk.upload_id, chunk.seq, &chunk.data)
                })
                .await?;
                Ok(Response::ok_with(&ack))
            }
            ClientRequest::GameUploadFinish(finish) => {
                let transfers = state.transfers.clone();
                let published = blocking(move || {
                    transfers.finish_upload(conn, &finish.upload_id, finish.changelog)
                })
                .await?;
                Ok(Response::ok_with(&published))
            }
            ClientRequest::GameUploadAbort(r) => {
                state.transfers.abort(conn, &r.upload_id)?;
                Ok(Response::ok().with("uploadId", r.upload_id))
            }

            // === 玩家 / 商店 ===
            ClientRequest::PlayerList => Self::handle_player_list(state),
            ClientRequest::StoreListGames => Self::handle_store_list(state),
            ClientRequest::StoreGameDetail(GameRef { game_id }) => {
                Self::handle_store_detail(state, me, &game_id)
            }
            ClientRequest::StoreDownloadInit(init) => {
                let transfers = state.transfers.clone();
                let ticket = blocking(move || {
                    transfers.begin_download(conn, &init.game_id, init.version.as_deref())
                })
                .await?;
                Ok(Response::ok_with(&ticket))
            }
            ClientRequest::StoreDownloadChunk(chunk) => {
                let window = state.transfers.download_chunk(
                    conn,
                    &chunk.download_id,
                    chunk.offset,
                    chunk.limit,
                )?;
                Ok(Response::ok_with(&window))
            }
            ClientRequest::StoreDownloadAbort(r) => {
                state.transfers.abort(conn, &r.download_id)?;
                Ok(Response::ok().with("downloadId", r.download_id))
            }

            // === 房间 ===
            ClientRequest::RoomCreate(create) => Self::handle_room_create(state, me, create),
            ClientRequest::RoomJoin(r) => {
                let mut pending = Pending::new();
                let view = state.rooms.join(me, r.room_id, &mut pending)?;
                pending.flush(&state.outbox).await;
                Ok(Response::ok_with(&view))
            }
            ClientRequest::RoomLeave => {
                let mut pending = Pending::new();
                let room_id = state.rooms.leave(me, &mut pending)?;
                pending.flush(&state.outbox).await;
                Ok(Response::ok().with("roomId", room_id))
            }
            ClientRequest::RoomList => {
                Ok(Response::ok().with("rooms", json(&state.rooms.list())?))
            }
            ClientRequest::RoomDetail(r) => Ok(Response::ok_with(&state.rooms.detail(r.room_id)?)),
            ClientRequest::RoomStart(RoomTarget { room_id }) => {
                let room_id = state.rooms.resolve_target(me, room_id)?;
                state.orchestrator.start(me, room_id).await?;
                Ok(Response::ok().with("roomId", room_id).with("starting", true))
            }
            ClientRequest::RoomEnd(RoomTarget { room_id }) => {
                let room_id = state.rooms.resolve_target(me, room_id)?;
                let accepted = state.orchestrator.end_by_host(me, room_id).await?;
                Ok(Response::ok().with("roomId", room_id).with("accepted", accepted))
            }
            ClientRequest::RoomDismiss(RoomTarget { room_id }) => {
                let room_id = state.rooms.resolve_target(me, room_id)?;
                state.orchestrator.dismiss(me, room_id).await?;
                Ok(Response::ok().with("roomId", room_id))
            }

            ClientRequest::MatchListMine(page) => Self::handle_match_history(state, me, page),

            // 已在 dispatch 中处理
            ClientRequest::Ping
            | ClientRequest::DevRegister(_)
            | ClientRequest::PlayerRegister(_)
            | ClientRequest::DevLogin(_)
            | ClientRequest::PlayerLogin(_)
            | ClientRequest::DevLogout
            | ClientRequest::PlayerLogout
            | ClientRequest::PostResult(_) => Err(LobbyError::Internal("unreachable".into())),
        }
    }

    /// 当前连接的会话
    fn session(state: &LobbyState, ctx: &ConnectionContext) -> LobbyResult<Session> {
        let token = ctx.token.as_deref().ok_or(AuthError::Unauthenticated)?;
        Ok(state.sessions.authenticate(token)?)
    }

    /// 处理注册
    fn handle_register(
        state: &LobbyState,
        ctx: &ConnectionContext,
        c: Credentials,
    ) -> LobbyResult<Response> {
        let account = state
            .sessions
            .register(ctx.surface.account_kind(), &c.username, &c.password)?;
        Ok(Response::ok()
            .with("accountId", account.id)
            .with("username", account.username))
    }

    /// 处理登录
    fn handle_login(
        state: &LobbyState,
        ctx: &mut ConnectionContext,
        c: Credentials,
    ) -> LobbyResult<Response> {
        let kind = ctx.surface.account_kind();
        let session = state.sessions.login(ctx.id, kind, &c.username, &c.password)?;

        if kind == AccountKind::Player {
            state
                .outbox
                .register(session.account_id, ctx.id, ctx.tx.clone());
        }
        ctx.token = Some(session.token.clone());

        Ok(Response::ok()
            .with("token", session.token)
            .with("accountId", session.account_id)
            .with("username", session.username))
    }

    /// 处理注销；玩家的会话结束等同于离开房间
    async fn handle_logout(
        state: &LobbyState,
        ctx: &mut ConnectionContext,
    ) -> LobbyResult<Response> {
        let token = ctx.token.take().ok_or(AuthError::Unauthenticated)?;
        let Some(session) = state.sessions.logout(&token) else {
            return Err(AuthError::Unauthenticated.into());
        };

        if session.kind == AccountKind::Player {
            let mut pending = Pending::new();
            state.rooms.handle_disconnect(session.account_id, &mut pending);
            state.outbox.unregister(session.account_id, ctx.id);
            pending.flush(&state.outbox).await;
        }
        Ok(Response::ok())
    }

    /// 开发者的游戏列表
    fn handle_list_mine(state: &LobbyState, me: AccountId) -> LobbyResult<Response> {
        let games: Vec<GameSummary> = state
            .store
            .list_packages()?
            .iter()
            .filter(|p| p.developer_id == me)
            .map(GameSummary::from)
            .collect();
        Ok(Response::ok().with("games", json(&games)?))
    }

    /// 取自己名下的游戏
    fn owned_package(state: &LobbyState, me: AccountId, game_id: &str) -> LobbyResult<GamePackage> {
        let package = state
            .store
            .package(game_id)?
            .ok_or(LobbyError::NotFound("game"))?;
        if package.developer_id != me {
            return Err(LobbyError::Forbidden);
        }
        Ok(package)
    }

    fn handle_list_versions(
        state: &LobbyState,
        me: AccountId,
        game_id: &str,
    ) -> LobbyResult<Response> {
        let package = Self::owned_package(state, me, game_id)?;
        let versions: Vec<VersionView> = package.versions.iter().map(VersionView::from).collect();
        Ok(Response::ok()
            .with("gameId", package.game_id)
            .with("versions", json(&versions)?))
    }

    /// 下架 / 重新上架
    fn handle_delist(
        state: &LobbyState,
        me: AccountId,
        req: DelistRequest,
    ) -> LobbyResult<Response> {
        let package = Self::owned_package(state, me, &req.game_id)?;
        if req.delisted && state.rooms.has_active_match_for(&package.game_id) {
            return Err(StateError::WrongState.into());
        }
        state.store.set_delisted(&package.game_id, req.delisted)?;
        Ok(Response::ok()
            .with("gameId", package.game_id)
            .with("delisted", req.delisted))
    }

    /// 在线玩家
    fn handle_player_list(state: &LobbyState) -> LobbyResult<Response> {
        let players: Vec<PlayerView> = state
            .sessions
            .online(AccountKind::Player)
            .into_iter()
            .map(|s| {
                let room_id = state.rooms.room_of(s.account_id);
                let room_state = room_id
                    .and_then(|id| state.rooms.detail(id).ok())
                    .map(|view| view.state);
                PlayerView {
                    player_id: s.account_id,
                    username: s.username,
                    room_id,
                    room_state,
                }
            })
            .collect();
        Ok(Response::ok().with("players", json(&players)?))
    }

    fn store_entry(state: &LobbyState, package: &GamePackage) -> LobbyResult<Option<StoreEntry>> {
        let Some(latest) = package.latest() else {
            return Ok(None);
        };
        let developer = state
            .store
            .account(package.developer_id)?
            .map(|a| a.username)
            .unwrap_or_default();
        Ok(Some(StoreEntry {
            game_id: package.game_id.clone(),
            name: package.name.clone(),
            description: package.description.clone(),
            developer,
            latest: VersionView::from(latest),
        }))
    }

    /// 商店列表（不含已下架的）
    fn handle_store_list(state: &LobbyState) -> LobbyResult<Response> {
        let mut games = Vec::new();
        for package in state.store.list_packages()?.iter().filter(|p| !p.delisted) {
            if let Some(entry) = Self::store_entry(state, package)? {
                games.push(entry);
            }
        }
        Ok(Response::ok().with("games", json(&games)?))
    }

    fn handle_store_detail(
        state: &LobbyState,
        me: AccountId,
        game_id: &str,
    ) -> LobbyResult<Response> {
        let package = state
            .store
            .package(game_id)?
            .ok_or(LobbyError::NotFound("game"))?;
        if package.delisted {
            return Err(LobbyError::GameDelisted);
        }
        let entry = Self::store_entry(state, &package)?.ok_or(LobbyError::NotFound("version"))?;
        let versions: Vec<VersionView> = package.versions.iter().map(VersionView::from).collect();
        let played = state.store.has_played(me, game_id)?;

        Ok(Response::ok_with(&entry)
            .with("versions", json(&versions)?)
            .with("played", played))
    }

    /// 创建房间，版本在创建时固定
    fn handle_room_create(
        state: &LobbyState,
        me: AccountId,
        create: RoomCreate,
    ) -> LobbyResult<Response> {
        let package = state
            .store
            .package(&create.game_id)?
            .ok_or(LobbyError::NotFound("game"))?;
        if package.delisted {
            return Err(LobbyError::GameDelisted);
        }
        let version = state
            .store
            .version(&create.game_id, create.version.as_deref())?
            .ok_or(LobbyError::NotFound("version"))?;

        let view = state.rooms.create(me, package.game_id, version)?;
        Ok(Response::ok_with(&view))
    }

    /// 自己参加过的对局，最近的在前
    fn handle_match_history(
        state: &LobbyState,
        me: AccountId,
        page: MatchPage,
    ) -> LobbyResult<Response> {
        let limit = page.limit.unwrap_or(DEFAULT_HISTORY_PAGE);
        if limit == 0 || limit > MAX_HISTORY_PAGE {
            return Err(LobbyError::bad_request(format!(
                "limit 应在 1..={} 之间",
                MAX_HISTORY_PAGE
            )));
        }

        let history = state.store.matches_for_player(me)?;
        let total = history.len();
        let matches: Vec<MatchResult> = history
            .into_iter()
            .rev()
            .skip(page.offset)
            .take(limit)
            .collect();

        Ok(Response::ok()
            .with("matches", json(&matches)?)
            .with("offset", page.offset)
            .with("total", total))
    }

    async fn handle_post_result(state: &LobbyState, report: MatchReport) -> LobbyResult<Response> {
        let room_id = report.room_id;
        let accepted = state.orchestrator.post_result(report).await?;
        Ok(Response::ok()
            .with("roomId", room_id)
            .with("accepted", accepted))
    }
}
