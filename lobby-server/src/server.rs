//! 服务器主逻辑
//!
//! 每个连接一个任务：读循环处理请求，写任务按顺序发出响应和推送。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use protocol::{
    AccountKind, ClientRequest, Connection, Listener, ProtocolError, RequestEnvelope,
    ServerFrame, TcpConnection, TcpListener,
};

use crate::config::LobbyConfig;
use crate::error::{LobbyError, LobbyResult};
use crate::orchestrator::{GameLauncher, Orchestrator};
use crate::outbox::{Outbox, Pending};
use crate::room::RoomManager;
use crate::router::{ConnectionContext, MessageHandler, Surface};
use crate::session::{ConnectionId, SessionRegistry};
use crate::store::Store;
use crate::transfer::TransferEngine;

/// 每个连接待发送队列长度
const OUTBOUND_QUEUE: usize = 64;

/// 服务器状态
pub struct LobbyState {
    pub config: Arc<LobbyConfig>,
    pub store: Arc<dyn Store>,
    pub sessions: SessionRegistry,
    pub rooms: Arc<RoomManager>,
    pub transfers: Arc<TransferEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub outbox: Arc<Outbox>,
    next_connection_id: AtomicU64,
}

impl LobbyState {
    pub fn new(
        config: LobbyConfig,
        store: Arc<dyn Store>,
        launcher: Arc<dyn GameLauncher>,
    ) -> LobbyResult<Arc<Self>> {
        let config = Arc::new(config);
        let transfers = Arc::new(TransferEngine::new(&config, store.clone())?);
        let rooms = Arc::new(RoomManager::new());
        let outbox = Arc::new(Outbox::new());
        let orchestrator = Arc::new(Orchestrator::new(
            config.clone(),
            launcher,
            rooms.clone(),
            store.clone(),
            outbox.clone(),
        ));

        Ok(Arc::new(Self {
            sessions: SessionRegistry::new(store.clone()),
            config,
            store,
            rooms,
            transfers,
            orchestrator,
            outbox,
            next_connection_id: AtomicU64::new(1),
        }))
    }

    fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::SeqCst)
    }

    /// 处理连接断开
    ///
    /// 传输会话随连接丢弃；进行中的对局不受影响。
    pub async fn handle_disconnect(&self, ctx: &ConnectionContext) {
        self.transfers.abort_connection(ctx.id);

        let Some(session) = self.sessions.drop_connection(ctx.id) else {
            return;
        };
        info!("{} 断开连接", session.username);

        if session.kind == AccountKind::Player {
            let mut pending = Pending::new();
            self.rooms.handle_disconnect(session.account_id, &mut pending);
            self.outbox.unregister(session.account_id, ctx.id);
            pending.flush(&self.outbox).await;
        }
    }
}

/// 接受连接，直到监听器出错
pub async fn serve(state: Arc<LobbyState>, mut listener: TcpListener, surface: Surface) {
    info!(
        "{:?} 服务监听于 {}",
        surface,
        listener.local_addr().unwrap_or_default()
    );

    loop {
        match listener.accept().await {
            Ok(conn) => {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_connection(state, conn, surface).await;
                });
            }
            Err(e) => {
                error!("接受连接失败: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// 单个连接的读写循环
pub async fn handle_connection(state: Arc<LobbyState>, conn: TcpConnection, surface: Surface) {
    let id = state.next_connection_id();
    let peer = conn.peer_addr().unwrap_or_else(|| "unknown".to_string());
    info!("新连接 {} 来自 {} ({:?})", id, peer, surface);

    let (mut reader, mut writer) = conn.split();
    let (tx, mut rx) = mpsc::channel::<ServerFrame>(OUTBOUND_QUEUE);

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match writer.send(&frame).await {
                Ok(()) => {}
                // 编码阶段就被拒绝，连接本身仍可用
                Err(e @ ProtocolError::FrameTooLarge { .. }) => {
                    error!("连接 {} 丢弃过大的帧: {}", id, e);
                }
                Err(e) => {
                    debug!("连接 {} 写入失败: {}", id, e);
                    break;
                }
            }
        }
        let _ = writer.shutdown().await;
    });

    let mut ctx = ConnectionContext::new(id, surface, tx.clone());
    let idle = state.config.session_idle_timeout();

    if tx.send(surface.greeting().into()).await.is_ok() {
        loop {
            let text = match tokio::time::timeout(idle, reader.read_text()).await {
                Ok(Ok(text)) => text,
                Ok(Err(ProtocolError::ConnectionClosed)) => break,
                Ok(Err(e)) => {
                    warn!("连接 {} 协议错误，关闭连接: {}", id, e);
                    break;
                }
                Err(_) => {
                    info!("连接 {} 空闲超时", id);
                    break;
                }
            };

            // JSON 本身无法解析视为协议错误；结构不对只回错误
            let value: Value = match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(e) => {
                    warn!("连接 {} 收到非法 JSON，关闭连接: {}", id, e);
                    break;
                }
            };

            let response = match serde_json::from_value::<RequestEnvelope>(value) {
                Ok(envelope) => match ClientRequest::from_envelope(envelope) {
                    Ok(request) => {
                        debug!("连接 {} 请求 {}", id, request.command());
                        MessageHandler::handle(&state, &mut ctx, request).await
                    }
                    Err(e) => MessageHandler::reject(&ctx, e.into()),
                },
                Err(e) => MessageHandler::reject(&ctx, LobbyError::bad_request(e.to_string())),
            };

            if tx.send(response.into()).await.is_err() {
                break;
            }
        }
    }

    state.handle_disconnect(&ctx).await;
    drop(ctx);
    drop(tx);
    let _ = writer_task.await;
    info!("连接 {} 已关闭", id);
}

/// 定期回收空闲的传输会话
pub fn spawn_janitor(state: Arc<LobbyState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.sweep_interval());
        let idle = state.config.transfer_idle_timeout();
        loop {
            ticker.tick().await;
            let reaped = state.transfers.reap_idle(idle);
            if reaped > 0 {
                info!("回收 {} 个空闲传输会话", reaped);
            }
        }
    })
}
