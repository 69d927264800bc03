//! 房间系统
//!
//! 状态机: Open → Starting → Playing → Open，`room_dismiss` 进入 Closed。
//!
//! 每个房间一把锁；成员索引 (玩家 → 房间) 单独存放。
//! 加锁顺序固定为先成员索引、后房间，持有房间锁时不访问成员索引。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry as IndexEntry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use protocol::{
    AccountId, Event, HostChanged, MatchReport, MemberChanged, MemberRole, MemberView, RoomClosed,
    RoomId, RoomState, RoomView,
};

use crate::error::{LobbyError, LobbyResult, OrchestrationError, StateError};
use crate::ids::random_hex;
use crate::orchestrator::GameProcess;
use crate::outbox::Pending;
use crate::store::GameVersion;

/// 房间成员
#[derive(Debug, Clone)]
pub struct Member {
    pub player_id: AccountId,
    /// 对局中离开，对局结束时移除
    pub absent: bool,
}

/// 进行中的对局
#[derive(Debug, Clone)]
pub struct ActiveMatch {
    pub match_id: u64,
    pub token: String,
    pub port: u16,
    pub started_at: DateTime<Utc>,
    pub process: GameProcess,
}

/// 房主发起开始后得到的凭据
#[derive(Debug, Clone)]
pub struct StartTicket {
    pub room_id: RoomId,
    pub match_id: u64,
    /// 本局的一次性令牌
    pub token: String,
    pub game_id: String,
    pub version: GameVersion,
    pub players: Vec<AccountId>,
}

/// Starting 状态下正在拉起的对局
#[derive(Debug, Clone)]
pub struct PendingStart {
    pub match_id: u64,
    pub token: String,
    /// 就绪确认前游戏服务器已回传的结果
    pub early_result: Option<MatchReport>,
}

/// 就绪确认的结果
#[derive(Debug)]
pub struct Confirmed {
    /// 需要收到 `game_info` 的在场成员
    pub recipients: Vec<AccountId>,
    pub early_result: Option<MatchReport>,
}

/// 如何认领对局结果
#[derive(Debug, Clone, Copy)]
pub enum MatchClaim<'a> {
    /// 游戏服务器回传，必须带正确令牌
    Token(&'a str),
    /// 内部结束（进程退出、房主结束）
    MatchId(u64),
}

/// 被接受的对局结束
pub struct MatchEnd {
    pub active: ActiveMatch,
    pub game_id: String,
    pub version: String,
    /// 参与对局的全部玩家（含中途离开的）
    pub players: Vec<AccountId>,
    /// 结束时仍在场的成员
    pub recipients: Vec<AccountId>,
}

/// 房间
pub struct Room {
    pub id: RoomId,
    pub game_id: String,
    /// 创建时固定的版本
    pub version: GameVersion,
    pub host: AccountId,
    /// 按加入顺序
    pub members: Vec<Member>,
    pub state: RoomState,
    pub pending_start: Option<PendingStart>,
    pub active: Option<ActiveMatch>,
    /// 房主断线，对局结束后解散
    pub close_after_match: bool,
    pub created_at: DateTime<Utc>,
}

impl Room {
    /// 创建新房间
    pub fn new(id: RoomId, host: AccountId, game_id: String, version: GameVersion) -> Self {
        Self {
            id,
            game_id,
            version,
            host,
            members: vec![Member {
                player_id: host,
                absent: false,
            }],
            state: RoomState::Open,
            pending_start: None,
            active: None,
            close_after_match: false,
            created_at: Utc::now(),
        }
    }

    /// 获取房间信息（用于列表展示）
    pub fn view(&self) -> RoomView {
        RoomView {
            room_id: self.id,
            game_id: self.game_id.clone(),
            version: self.version.version.clone(),
            host_player_id: self.host,
            state: self.state,
            members: self
                .members
                .iter()
                .map(|m| MemberView {
                    player_id: m.player_id,
                    role: if m.player_id == self.host {
                        MemberRole::Host
                    } else {
                        MemberRole::Member
                    },
                    absent: m.absent,
                })
                .collect(),
            min_players: self.version.min_players,
            max_players: self.version.max_players,
        }
    }

    /// 检查玩家是否在房间中（不含已离开的）
    pub fn has_player(&self, player_id: AccountId) -> bool {
        self.members
            .iter()
            .any(|m| m.player_id == player_id && !m.absent)
    }

    /// 在场成员
    pub fn present(&self) -> Vec<AccountId> {
        self.members
            .iter()
            .filter(|m| !m.absent)
            .map(|m| m.player_id)
            .collect()
    }

    fn all_members(&self) -> Vec<AccountId> {
        self.members.iter().map(|m| m.player_id).collect()
    }

    fn is_starting(&self, match_id: u64) -> bool {
        self.state == RoomState::Starting
            && self
                .pending_start
                .as_ref()
                .is_some_and(|s| s.match_id == match_id)
    }

    fn is_full(&self) -> bool {
        self.members.len() >= self.version.max_players as usize
    }

    fn ensure_host(&self, player_id: AccountId) -> Result<(), StateError> {
        if self.state == RoomState::Closed {
            return Err(StateError::WrongState);
        }
        if !self.has_player(player_id) {
            return Err(StateError::NotInRoom);
        }
        if self.host != player_id {
            return Err(StateError::NotHost);
        }
        Ok(())
    }

    /// 对局结束 / 开始失败后回到 Open：移除离开的成员，必要时移交房主
    fn settle(&mut self, pending: &mut Pending) {
        self.members.retain(|m| !m.absent);
        self.pending_start = None;
        self.active = None;

        if self.close_after_match || self.members.is_empty() {
            self.state = RoomState::Closed;
            pending.broadcast(self.present(), Event::RoomClosed(RoomClosed { room_id: self.id }));
            return;
        }

        self.state = RoomState::Open;
        self.reassign_host(pending);
    }

    /// 房主不在场时，交给最早加入的在场成员
    fn reassign_host(&mut self, pending: &mut Pending) {
        if self.has_player(self.host) {
            return;
        }
        if let Some(next) = self.members.iter().find(|m| !m.absent).map(|m| m.player_id) {
            self.host = next;
            info!("房间 {} 房主变更为 {}", self.id, next);
            pending.broadcast(
                self.present(),
                Event::HostChanged(HostChanged {
                    room_id: self.id,
                    host_player_id: next,
                }),
            );
        }
    }
}

/// 房间管理器
pub struct RoomManager {
    rooms: DashMap<RoomId, Arc<Mutex<Room>>>,
    /// 玩家 ID -> 所在房间
    membership: DashMap<AccountId, RoomId>,
    next_room_id: AtomicU64,
    next_match_id: AtomicU64,
}

impl RoomManager {
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            membership: DashMap::new(),
            next_room_id: AtomicU64::new(1),
            next_match_id: AtomicU64::new(1),
        }
    }

    fn room(&self, room_id: RoomId) -> LobbyResult<Arc<Mutex<Room>>> {
        self.rooms
            .get(&room_id)
            .map(|r| r.value().clone())
            .ok_or(LobbyError::NotFound("room"))
    }

    /// 房间关闭后的清理；调用时不得持有房间锁
    fn forget(&self, room_id: RoomId, members: &[AccountId]) {
        self.rooms.remove(&room_id);
        for player_id in members {
            self.membership.remove_if(player_id, |_, r| *r == room_id);
        }
        info!("房间 {} 已关闭", room_id);
    }

    /// 玩家所在房间
    pub fn room_of(&self, player_id: AccountId) -> Option<RoomId> {
        self.membership.get(&player_id).map(|r| *r.value())
    }

    /// 房主操作的目标：显式指定或自己所在的房间
    pub fn resolve_target(
        &self,
        player_id: AccountId,
        room_id: Option<RoomId>,
    ) -> LobbyResult<RoomId> {
        match room_id.or_else(|| self.room_of(player_id)) {
            Some(room_id) => Ok(room_id),
            None => Err(StateError::NotInRoom.into()),
        }
    }

    /// 创建房间，创建者成为房主
    pub fn create(
        &self,
        host: AccountId,
        game_id: String,
        version: GameVersion,
    ) -> LobbyResult<RoomView> {
        let IndexEntry::Vacant(slot) = self.membership.entry(host) else {
            return Err(StateError::AlreadyInRoom.into());
        };

        let room_id = self.next_room_id.fetch_add(1, Ordering::SeqCst);
        let room = Room::new(room_id, host, game_id, version);
        let view = room.view();
        self.rooms.insert(room_id, Arc::new(Mutex::new(room)));
        slot.insert(room_id);

        info!("玩家 {} 创建房间 {} ({} {})", host, room_id, view.game_id, view.version);
        Ok(view)
    }

    /// 加入房间
    pub fn join(
        &self,
        player_id: AccountId,
        room_id: RoomId,
        pending: &mut Pending,
    ) -> LobbyResult<RoomView> {
        let IndexEntry::Vacant(slot) = self.membership.entry(player_id) else {
            return Err(StateError::AlreadyInRoom.into());
        };

        let room = self.room(room_id)?;
        let view = {
            let mut room = room.lock();
            if room.state != RoomState::Open {
                return Err(StateError::WrongState.into());
            }
            if room.is_full() {
                return Err(StateError::RoomFull.into());
            }

            pending.broadcast(
                room.present(),
                Event::PlayerJoined(MemberChanged {
                    room_id,
                    player_id,
                }),
            );
            room.members.push(Member {
                player_id,
                absent: false,
            });
            room.view()
        };
        slot.insert(room_id);

        info!("玩家 {} 加入房间 {}", player_id, room_id);
        Ok(view)
    }

    /// 离开房间
    ///
    /// 对局中离开只标记为缺席，对局继续；否则直接移除，空房间被销毁。
    pub fn leave(&self, player_id: AccountId, pending: &mut Pending) -> LobbyResult<RoomId> {
        let room_id = self.room_of(player_id).ok_or(StateError::NotInRoom)?;
        self.depart(player_id, room_id, false, pending)?;
        Ok(room_id)
    }

    /// 玩家断线
    ///
    /// 房主断线会解散房间；对局进行中则推迟到对局结束。
    pub fn handle_disconnect(&self, player_id: AccountId, pending: &mut Pending) {
        if let Some(room_id) = self.room_of(player_id) {
            let _ = self.depart(player_id, room_id, true, pending);
        }
    }

    fn depart(
        &self,
        player_id: AccountId,
        room_id: RoomId,
        disconnected: bool,
        pending: &mut Pending,
    ) -> LobbyResult<()> {
        let room = match self.room(room_id) {
            Ok(room) => room,
            Err(e) => {
                self.membership.remove(&player_id);
                return Err(e);
            }
        };

        let mut closed_members = None;
        {
            let mut room = room.lock();
            if !room.has_player(player_id) {
                drop(room);
                self.membership.remove_if(&player_id, |_, r| *r == room_id);
                return Err(StateError::NotInRoom.into());
            }
            let is_host = room.host == player_id;
            let state = room.state;

            match state {
                RoomState::Starting | RoomState::Playing => {
                    let member = room.members.iter_mut().find(|m| m.player_id == player_id);
                    if let Some(member) = member {
                        member.absent = true;
                    }
                    if disconnected && is_host {
                        room.close_after_match = true;
                    }
                }
                RoomState::Open if disconnected && is_host => {
                    room.state = RoomState::Closed;
                    room.members.retain(|m| m.player_id != player_id);
                    pending.broadcast(room.present(), Event::RoomClosed(RoomClosed { room_id }));
                    closed_members = Some(room.all_members());
                }
                RoomState::Open => {
                    room.members.retain(|m| m.player_id != player_id);
                    if room.members.is_empty() {
                        room.state = RoomState::Closed;
                        closed_members = Some(Vec::new());
                    } else {
                        room.reassign_host(pending);
                    }
                }
                RoomState::Closed => return Err(StateError::WrongState.into()),
            }

            if room.state != RoomState::Closed {
                pending.broadcast(
                    room.present(),
                    Event::PlayerLeft(MemberChanged { room_id, player_id }),
                );
            }
        }

        self.membership.remove_if(&player_id, |_, r| *r == room_id);
        if let Some(members) = closed_members {
            self.forget(room_id, &members);
        }

        debug!("玩家 {} 离开房间 {} (断线: {})", player_id, room_id, disconnected);
        Ok(())
    }

    /// 房间列表（不含已关闭的）
    pub fn list(&self) -> Vec<RoomView> {
        let rooms: Vec<Arc<Mutex<Room>>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        let mut views: Vec<RoomView> = rooms
            .iter()
            .map(|room| room.lock().view())
            .filter(|view| view.state != RoomState::Closed)
            .collect();
        views.sort_by_key(|v| v.room_id);
        views
    }

    /// 房间详情
    pub fn detail(&self, room_id: RoomId) -> LobbyResult<RoomView> {
        let view = self.room(room_id)?.lock().view();
        if view.state == RoomState::Closed {
            return Err(LobbyError::NotFound("room"));
        }
        Ok(view)
    }

    /// 房主发起开始：Open → Starting
    ///
    /// 并发调用只有一个成功，其余得到 AlreadyStarting。
    pub fn begin_start(
        &self,
        player_id: AccountId,
        room_id: RoomId,
    ) -> LobbyResult<StartTicket> {
        let room = self.room(room_id)?;
        let mut room = room.lock();
        room.ensure_host(player_id)?;

        match room.state {
            RoomState::Starting | RoomState::Playing => {
                return Err(StateError::AlreadyStarting.into())
            }
            RoomState::Closed => return Err(StateError::WrongState.into()),
            RoomState::Open => {}
        }

        let players = room.present();
        if players.len() < room.version.min_players as usize {
            return Err(StateError::NotEnoughPlayers.into());
        }

        let match_id = self.next_match_id.fetch_add(1, Ordering::SeqCst);
        let token = random_hex(16);
        room.state = RoomState::Starting;
        room.pending_start = Some(PendingStart {
            match_id,
            token: token.clone(),
            early_result: None,
        });

        info!("房间 {} 开始拉起对局 {} ({} 人)", room_id, match_id, players.len());
        Ok(StartTicket {
            room_id,
            match_id,
            token,
            game_id: room.game_id.clone(),
            version: room.version.clone(),
            players,
        })
    }

    /// 开始失败：Starting → Open
    ///
    /// 返回需要通知的在场成员；房间已不在等待该对局时返回 `None`。
    pub fn rollback_start(
        &self,
        room_id: RoomId,
        match_id: u64,
        pending: &mut Pending,
    ) -> Option<Vec<AccountId>> {
        let room = self.room(room_id).ok()?;

        let (recipients, closed) = {
            let mut room = room.lock();
            if !room.is_starting(match_id) {
                return None;
            }
            if let Some(start) = room.pending_start.as_ref().filter(|s| s.early_result.is_some()) {
                warn!("房间 {} 对局 {} 启动失败，丢弃已回传的结果", room_id, start.match_id);
            }
            let recipients = room.present();
            let members = room.all_members();
            room.settle(pending);
            (recipients, (room.state == RoomState::Closed).then_some(members))
        };

        if let Some(members) = closed {
            self.forget(room_id, &members);
        }
        Some(recipients)
    }

    /// 游戏服务器就绪：Starting → Playing
    ///
    /// 房间已不在等待这个对局（被解散等）时原样退回，由调用方停止进程。
    /// 就绪前已回传的结果一并交回，由调用方立即结束对局。
    pub fn confirm_playing(
        &self,
        room_id: RoomId,
        active: ActiveMatch,
    ) -> Result<Confirmed, ActiveMatch> {
        let Ok(room) = self.room(room_id) else {
            return Err(active);
        };
        let mut room = room.lock();
        if !room.is_starting(active.match_id) {
            return Err(active);
        }

        info!("房间 {} 对局 {} 开始 (端口 {})", room_id, active.match_id, active.port);
        let early_result = room.pending_start.take().and_then(|s| s.early_result);
        room.state = RoomState::Playing;
        room.active = Some(active);
        Ok(Confirmed {
            recipients: room.present(),
            early_result,
        })
    }

    /// 就绪确认前到达的结果先暂存
    ///
    /// 房间不在 Starting 时返回 `Ok(None)`，按正常流程认领；
    /// 令牌正确时返回是否是第一份结果。
    pub fn hold_early_result(&self, report: &MatchReport) -> LobbyResult<Option<bool>> {
        let Ok(room) = self.room(report.room_id) else {
            return Ok(None);
        };
        let mut room = room.lock();
        if room.state != RoomState::Starting {
            return Ok(None);
        }
        let Some(start) = room.pending_start.as_mut() else {
            return Ok(None);
        };
        if start.token != report.token {
            return Err(OrchestrationError::BadToken.into());
        }
        if start.early_result.is_some() {
            return Ok(Some(false));
        }

        info!("房间 {} 对局 {} 在就绪前回传了结果", report.room_id, start.match_id);
        start.early_result = Some(report.clone());
        Ok(Some(true))
    }

    /// 是否已暂存了该对局的结果
    pub fn has_early_result(&self, room_id: RoomId, match_id: u64) -> bool {
        let Ok(room) = self.room(room_id) else {
            return false;
        };
        let room = room.lock();
        room.is_starting(match_id)
            && room
                .pending_start
                .as_ref()
                .is_some_and(|s| s.early_result.is_some())
    }

    /// 认领对局结果：Playing → Open
    ///
    /// 每局只有第一个认领成功；之后的返回 `Ok(None)`。
    pub fn take_active_match(
        &self,
        room_id: RoomId,
        claim: MatchClaim<'_>,
        pending: &mut Pending,
    ) -> LobbyResult<Option<MatchEnd>> {
        let room = match self.room(room_id) {
            Ok(room) => room,
            Err(_) => return Ok(None),
        };

        let (end, closed) = {
            let mut room = room.lock();
            let Some(active) = room.active.as_ref() else {
                return Ok(None);
            };
            match claim {
                MatchClaim::Token(token) if token != active.token => {
                    return Err(OrchestrationError::BadToken.into());
                }
                MatchClaim::MatchId(id) if id != active.match_id => return Ok(None),
                _ => {}
            }

            let Some(active) = room.active.take() else {
                return Ok(None);
            };
            let end = MatchEnd {
                active,
                game_id: room.game_id.clone(),
                version: room.version.version.clone(),
                players: room.all_members(),
                recipients: room.present(),
            };
            room.settle(pending);
            let closed = (room.state == RoomState::Closed).then(|| end.players.clone());
            (end, closed)
        };

        if let Some(members) = closed {
            self.forget(room_id, &members);
        }
        Ok(Some(end))
    }

    /// 房主结束对局前的检查，返回进行中的对局 ID
    pub fn active_match_id(&self, player_id: AccountId, room_id: RoomId) -> LobbyResult<u64> {
        let room = self.room(room_id)?;
        let room = room.lock();
        room.ensure_host(player_id)?;
        match (&room.state, &room.active) {
            (RoomState::Playing, Some(active)) => Ok(active.match_id),
            _ => Err(StateError::WrongState.into()),
        }
    }

    /// 房主解散房间；返回需要停止的对局
    pub fn dismiss(
        &self,
        player_id: AccountId,
        room_id: RoomId,
        pending: &mut Pending,
    ) -> LobbyResult<Option<ActiveMatch>> {
        let room = self.room(room_id)?;
        let (active, members) = {
            let mut room = room.lock();
            room.ensure_host(player_id)?;

            room.state = RoomState::Closed;
            room.pending_start = None;
            let active = room.active.take();
            let others: Vec<AccountId> =
                room.present().into_iter().filter(|p| *p != player_id).collect();
            pending.broadcast(others, Event::RoomClosed(RoomClosed { room_id }));
            (active, room.all_members())
        };

        self.forget(room_id, &members);
        Ok(active)
    }

    /// 是否有该游戏的对局正在进行或拉起中
    pub fn has_active_match_for(&self, game_id: &str) -> bool {
        let rooms: Vec<Arc<Mutex<Room>>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        rooms.iter().any(|room| {
            let room = room.lock();
            room.game_id == game_id
                && matches!(room.state, RoomState::Starting | RoomState::Playing)
        })
    }

    /// 全部房间中的进行中对局（关闭时停止用）
    pub fn active_matches(&self) -> Vec<(RoomId, ActiveMatch)> {
        let rooms: Vec<Arc<Mutex<Room>>> = self.rooms.iter().map(|r| r.value().clone()).collect();
        rooms
            .iter()
            .filter_map(|room| {
                let room = room.lock();
                room.active.clone().map(|active| (room.id, active))
            })
            .collect()
    }

    /// 当前房间数
    pub fn count(&self) -> usize {
        self.rooms.len()
    }
}

impl Default for RoomManager {
    fn default() -> Self {
        Self::new()
    }
}
