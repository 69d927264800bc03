//! 对局编排
//!
//! 房主发起开始后：分配端口、生成令牌、拉起游戏服务器进程并等待端口可连接，
//! 成功后向成员推送 `game_info`。对局期间由监督任务等待进程退出。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use protocol::{
    AccountId, ErrorCode, Event, GameInfo, MatchEnded, MatchReport, MatchResult, RoomId,
    StartFailed,
};

use crate::config::LobbyConfig;
use crate::error::{LobbyResult, OrchestrationError};
use crate::manifest::EntryPoint;
use crate::outbox::{Outbox, Pending};
use crate::room::{ActiveMatch, MatchClaim, RoomManager, StartTicket};
use crate::store::Store;

/// 就绪探测间隔
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 游戏服务器端口池
pub struct PortPool {
    free: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            free: Mutex::new((min..=max).collect()),
        }
    }

    /// 取一个空闲且本机可绑定的端口
    pub fn allocate(&self) -> Result<u16, OrchestrationError> {
        let mut free = self.free.lock();
        let candidates: Vec<u16> = free.iter().copied().collect();
        for port in candidates {
            // 被其他程序占用的端口跳过，留在池中下次再试
            if std::net::TcpListener::bind(("0.0.0.0", port)).is_ok() {
                free.remove(&port);
                return Ok(port);
            }
        }
        Err(OrchestrationError::NoPortsAvailable)
    }

    pub fn release(&self, port: u16) {
        self.free.lock().insert(port);
    }

    pub fn available(&self) -> usize {
        self.free.lock().len()
    }
}

/// 拉起游戏服务器所需的全部信息
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub room_id: RoomId,
    pub match_id: u64,
    pub game_id: String,
    pub version: String,
    pub package_root: PathBuf,
    pub entry: EntryPoint,
    /// 游戏服务器对外地址
    pub host: String,
    pub port: u16,
    pub token: String,
    pub lobby_host: String,
    pub lobby_port: u16,
    pub expected_players: usize,
    pub log_path: PathBuf,
}

impl LaunchPlan {
    /// 替换参数模板中的占位符
    pub fn render(&self, template: &str) -> String {
        template
            .replace("{host}", &self.host)
            .replace("{port}", &self.port.to_string())
            .replace("{token}", &self.token)
            .replace("{roomId}", &self.room_id.to_string())
            .replace("{gameId}", &self.game_id)
            .replace("{version}", &self.version)
            .replace("{lobbyHost}", &self.lobby_host)
            .replace("{lobbyPort}", &self.lobby_port.to_string())
    }

    /// 最终命令行：程序 + 参数
    pub fn command_line(&self) -> (PathBuf, Vec<String>) {
        let module = self.package_root.join(&self.entry.module);
        let args: Vec<String> = self.entry.argv.iter().map(|a| self.render(a)).collect();

        let interpreter = self.entry.interpreter.clone().or_else(|| {
            match Path::new(&self.entry.module).extension().and_then(|e| e.to_str()) {
                Some("py") => Some("python3".to_string()),
                _ => None,
            }
        });

        match interpreter {
            Some(interpreter) => {
                let mut full = vec![module.to_string_lossy().into_owned()];
                full.extend(args);
                (PathBuf::from(interpreter), full)
            }
            None => (module, args),
        }
    }

    /// 传给游戏服务器的环境变量
    pub fn env(&self) -> Vec<(&'static str, String)> {
        vec![
            ("ARCADE_LOBBY_HOST", self.lobby_host.clone()),
            ("ARCADE_LOBBY_PORT", self.lobby_port.to_string()),
            ("ARCADE_ROOM_ID", self.room_id.to_string()),
            ("ARCADE_TOKEN", self.token.clone()),
            ("ARCADE_GAME_ID", self.game_id.clone()),
            ("ARCADE_VERSION", self.version.clone()),
            ("ARCADE_PORT", self.port.to_string()),
            ("ARCADE_EXPECTED_PLAYERS", self.expected_players.to_string()),
        ]
    }
}

/// 游戏服务器启动器
#[async_trait]
pub trait GameLauncher: Send + Sync {
    async fn launch(&self, plan: &LaunchPlan) -> Result<Child, OrchestrationError>;
}

/// 以子进程方式拉起入口，输出写入日志文件
pub struct ProcessLauncher;

#[async_trait]
impl GameLauncher for ProcessLauncher {
    async fn launch(&self, plan: &LaunchPlan) -> Result<Child, OrchestrationError> {
        let spawn_failed = |e: std::io::Error| OrchestrationError::SpawnFailed(e.to_string());

        let log_path = plan.log_path.clone();
        let (log, log_err) = tokio::task::spawn_blocking(move || open_log(&log_path))
            .await
            .map_err(|e| OrchestrationError::SpawnFailed(e.to_string()))?
            .map_err(spawn_failed)?;

        let (program, args) = plan.command_line();
        info!(
            "拉起游戏服务器: {} {} (房间 {}, 端口 {})",
            program.display(),
            args.join(" "),
            plan.room_id,
            plan.port
        );

        let mut command = Command::new(&program);
        command
            .args(&args)
            .current_dir(&plan.package_root)
            .envs(plan.env())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true);

        command.spawn().map_err(spawn_failed)
    }
}

/// 游戏服务器的输出日志（stdout 与 stderr 各一个句柄）
fn open_log(path: &Path) -> std::io::Result<(std::fs::File, std::fs::File)> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let log_err = log.try_clone()?;
    Ok((log, log_err))
}

/// 游戏服务器进程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Launching,
    Alive,
    Exited(Option<i32>),
}

/// 游戏服务器进程句柄
///
/// 子进程由监督任务独占；其他地方只能观察状态或请求停止。
#[derive(Debug, Clone)]
pub struct GameProcess {
    state: Arc<watch::Sender<ProcessState>>,
    stop: Arc<Notify>,
}

impl GameProcess {
    /// 接管子进程并启动监督任务
    pub fn supervise(mut child: Child, stop_timeout: Duration) -> Self {
        let state = Arc::new(watch::Sender::new(ProcessState::Launching));
        let stop = Arc::new(Notify::new());

        let process = Self {
            state: state.clone(),
            stop: stop.clone(),
        };

        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop.notified() => {
                    let _ = child.start_kill();
                    match tokio::time::timeout(stop_timeout, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!("游戏服务器在 {:?} 内未退出", stop_timeout);
                            Err(std::io::Error::from(std::io::ErrorKind::TimedOut))
                        }
                    }
                }
            };

            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("等待游戏服务器退出失败: {}", e);
                    None
                }
            };
            state.send_replace(ProcessState::Exited(code));
        });

        process
    }

    /// 端口已就绪
    pub fn mark_alive(&self) {
        self.state.send_if_modified(|state| {
            if *state == ProcessState::Launching {
                *state = ProcessState::Alive;
                true
            } else {
                false
            }
        });
    }

    pub fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    /// 请求停止（幂等）
    pub fn stop(&self) {
        if !matches!(self.state(), ProcessState::Exited(_)) {
            self.stop.notify_one();
        }
    }

    /// 等待进程退出，返回退出码
    pub async fn wait_exit(&self) -> Option<i32> {
        let mut rx = self.state.subscribe();
        loop {
            let current = *rx.borrow_and_update();
            if let ProcessState::Exited(code) = current {
                return code;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// 已退出的句柄（房间测试用）
    #[cfg(test)]
    pub(crate) fn exited() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(ProcessState::Exited(Some(0)))),
            stop: Arc::new(Notify::new()),
        }
    }
}

/// 等待游戏服务器端口可连接
async fn wait_ready(
    process: &GameProcess,
    port: u16,
    timeout: Duration,
) -> Result<(), OrchestrationError> {
    let ready = async {
        loop {
            if let ProcessState::Exited(code) = process.state() {
                return Err(OrchestrationError::SpawnFailed(format!(
                    "进程提前退出 (退出码 {:?})",
                    code
                )));
            }
            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    };

    match tokio::time::timeout(timeout, ready).await {
        Ok(result) => result,
        Err(_) => Err(OrchestrationError::SpawnFailed(format!(
            "{:?} 内端口 {} 未就绪",
            timeout, port
        ))),
    }
}

/// 对局结果
struct Outcome {
    winner: Option<AccountId>,
    reason: String,
    results: Value,
    started_at: Option<i64>,
    ended_at: Option<i64>,
}

impl Outcome {
    fn internal(reason: &str) -> Self {
        Self {
            winner: None,
            reason: reason.to_string(),
            results: Value::Null,
            started_at: None,
            ended_at: None,
        }
    }
}

/// 对局编排器
pub struct Orchestrator {
    config: Arc<LobbyConfig>,
    ports: PortPool,
    launcher: Arc<dyn GameLauncher>,
    rooms: Arc<RoomManager>,
    store: Arc<dyn Store>,
    outbox: Arc<Outbox>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<LobbyConfig>,
        launcher: Arc<dyn GameLauncher>,
        rooms: Arc<RoomManager>,
        store: Arc<dyn Store>,
        outbox: Arc<Outbox>,
    ) -> Self {
        let ports = PortPool::new(config.game_port_min, config.game_port_max);
        Self {
            config,
            ports,
            launcher,
            rooms,
            store,
            outbox,
        }
    }

    pub fn ports(&self) -> &PortPool {
        &self.ports
    }

    /// 房主发起开始
    ///
    /// 状态切换和端口分配同步完成，拉起进程在后台任务中进行。
    pub async fn start(self: &Arc<Self>, player_id: AccountId, room_id: RoomId) -> LobbyResult<()> {
        let ticket = self.rooms.begin_start(player_id, room_id)?;

        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                warn!("房间 {} 开始失败: {}", room_id, e);
                let mut pending = Pending::new();
                self.rooms.rollback_start(room_id, ticket.match_id, &mut pending);
                pending.flush(&self.outbox).await;
                return Err(e.into());
            }
        };

        let this = self.clone();
        tokio::spawn(async move {
            this.run_match(ticket, port).await;
        });
        Ok(())
    }

    fn plan(&self, ticket: &StartTicket, port: u16) -> LaunchPlan {
        LaunchPlan {
            room_id: ticket.room_id,
            match_id: ticket.match_id,
            game_id: ticket.game_id.clone(),
            version: ticket.version.version.clone(),
            package_root: ticket.version.package_root.clone(),
            entry: ticket.version.server.clone(),
            host: self.config.public_game_host.clone(),
            port,
            token: ticket.token.clone(),
            lobby_host: self.config.callback_host.clone(),
            lobby_port: self.config.lobby_port(),
            expected_players: ticket.players.len(),
            log_path: self
                .config
                .logs_dir()
                .join(format!("game_room_{}.log", ticket.room_id)),
        }
    }

    /// 拉起并等待就绪
    async fn run_match(self: Arc<Self>, ticket: StartTicket, port: u16) {
        let plan = self.plan(&ticket, port);

        let launched = match self.launcher.launch(&plan).await {
            Ok(child) => {
                let process = GameProcess::supervise(child, self.config.stop_timeout());
                match wait_ready(&process, port, self.config.spawn_timeout()).await {
                    Ok(()) => Ok(process),
                    // 游戏已经结束并回传了结果，按正常对局收尾
                    Err(e) if self.rooms.has_early_result(ticket.room_id, ticket.match_id) => {
                        info!("房间 {} 端口未就绪但结果已回传: {}", ticket.room_id, e);
                        Ok(process)
                    }
                    Err(e) => {
                        process.stop();
                        Err(e)
                    }
                }
            }
            Err(e) => Err(e),
        };

        let process = match launched {
            Ok(process) => process,
            Err(e) => {
                error!("房间 {} 游戏服务器启动失败: {}", ticket.room_id, e);
                self.ports.release(port);
                let mut pending = Pending::new();
                if let Some(recipients) =
                    self.rooms.rollback_start(ticket.room_id, ticket.match_id, &mut pending)
                {
                    let failed = Event::StartFailed(StartFailed {
                        room_id: ticket.room_id,
                        error: ErrorCode::SpawnFailed,
                    });
                    let mut notice = Pending::new();
                    notice.broadcast(recipients, failed);
                    notice.flush(&self.outbox).await;
                }
                pending.flush(&self.outbox).await;
                return;
            }
        };

        process.mark_alive();
        let active = ActiveMatch {
            match_id: ticket.match_id,
            token: plan.token.clone(),
            port,
            started_at: Utc::now(),
            process: process.clone(),
        };

        match self.rooms.confirm_playing(ticket.room_id, active) {
            Ok(confirmed) => {
                let info = Event::GameInfo(GameInfo {
                    room_id: ticket.room_id,
                    game_id: plan.game_id.clone(),
                    version: plan.version.clone(),
                    host: plan.host.clone(),
                    port,
                    token: plan.token.clone(),
                });
                let mut pending = Pending::new();
                pending.broadcast(confirmed.recipients, info);
                pending.flush(&self.outbox).await;

                let this = self.clone();
                tokio::spawn(async move {
                    this.watch_exit(ticket.room_id, ticket.match_id, process).await;
                });

                if let Some(report) = confirmed.early_result {
                    if let Err(e) = self.post_result(report).await {
                        error!("房间 {} 对局 {} 收尾失败: {}", ticket.room_id, ticket.match_id, e);
                    }
                }
            }
            Err(active) => {
                warn!("房间 {} 已不再等待对局 {}，停止游戏服务器", ticket.room_id, ticket.match_id);
                active.process.stop();
                self.ports.release(port);
            }
        }
    }

    /// 进程退出后若宽限期内仍无结果，记为中止
    async fn watch_exit(self: Arc<Self>, room_id: RoomId, match_id: u64, process: GameProcess) {
        let code = process.wait_exit().await;
        info!("房间 {} 游戏服务器退出 (退出码 {:?})", room_id, code);

        tokio::time::sleep(self.config.exit_grace()).await;
        match self
            .conclude(room_id, MatchClaim::MatchId(match_id), Outcome::internal("aborted"))
            .await
        {
            Ok(true) => warn!("房间 {} 对局 {} 未回传结果，记为中止", room_id, match_id),
            Ok(false) => {}
            Err(e) => error!("房间 {} 对局 {} 收尾失败: {}", room_id, match_id, e),
        }
    }

    /// 游戏服务器回传结果；返回是否被接受
    pub async fn post_result(&self, report: MatchReport) -> LobbyResult<bool> {
        if let Some(accepted) = self.rooms.hold_early_result(&report)? {
            return Ok(accepted);
        }

        let outcome = Outcome {
            winner: report.winner,
            reason: report.reason.unwrap_or_else(|| "finished".to_string()),
            results: report.results,
            started_at: report.started_at,
            ended_at: report.ended_at,
        };
        self.conclude(report.room_id, MatchClaim::Token(&report.token), outcome)
            .await
    }

    /// 房主强制结束对局
    pub async fn end_by_host(&self, player_id: AccountId, room_id: RoomId) -> LobbyResult<bool> {
        let match_id = self.rooms.active_match_id(player_id, room_id)?;
        self.conclude(room_id, MatchClaim::MatchId(match_id), Outcome::internal("host_ended"))
            .await
    }

    /// 房主解散房间，进行中的对局一并停止
    pub async fn dismiss(&self, player_id: AccountId, room_id: RoomId) -> LobbyResult<()> {
        let mut pending = Pending::new();
        let active = self.rooms.dismiss(player_id, room_id, &mut pending)?;
        if let Some(active) = active {
            info!("房间 {} 解散，停止对局 {}", room_id, active.match_id);
            active.process.stop();
            self.ports.release(active.port);
        }
        pending.flush(&self.outbox).await;
        Ok(())
    }

    /// 每局只接受一次结束
    async fn conclude(
        &self,
        room_id: RoomId,
        claim: MatchClaim<'_>,
        outcome: Outcome,
    ) -> LobbyResult<bool> {
        let mut pending = Pending::new();
        let Some(end) = self.rooms.take_active_match(room_id, claim, &mut pending)? else {
            if matches!(claim, MatchClaim::Token(_)) {
                warn!("房间 {} 的对局结果迟到或重复，已忽略", room_id);
            }
            return Ok(false);
        };

        end.active.process.stop();
        self.ports.release(end.active.port);

        let result = MatchResult {
            room_id,
            game_id: end.game_id,
            version: end.version,
            started_at: outcome
                .started_at
                .unwrap_or_else(|| end.active.started_at.timestamp()),
            ended_at: outcome.ended_at.unwrap_or_else(|| Utc::now().timestamp()),
            winner: outcome.winner,
            reason: outcome.reason,
            results: outcome.results,
            players: end.players,
        };
        info!(
            "房间 {} 对局 {} 结束: {} (胜者 {:?})",
            room_id, end.active.match_id, result.reason, result.winner
        );

        let recorded = self.store.record_match(result.clone());

        let mut notice = Pending::new();
        notice.broadcast(
            end.recipients,
            Event::MatchEnded(MatchEnded {
                room_id,
                result,
            }),
        );
        notice.flush(&self.outbox).await;
        pending.flush(&self.outbox).await;

        if let Err(e) = recorded {
            error!("对局结果写入失败: {}", e);
            return Err(e.into());
        }
        Ok(true)
    }

    /// 关闭服务时停止全部游戏服务器
    pub fn shutdown(&self) {
        for (room_id, active) in self.rooms.active_matches() {
            info!("停止房间 {} 的游戏服务器", room_id);
            active.process.stop();
        }
    }
}
