//! 推送通道
//!
//! 每个已登录玩家对应一个写任务的发送端。
//! 房间操作在持锁期间只把事件记入 [`Pending`]，释放锁之后再统一发送。

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use protocol::{AccountId, Event, ServerFrame};

use crate::session::ConnectionId;

struct Mailbox {
    connection: ConnectionId,
    tx: mpsc::Sender<ServerFrame>,
}

/// 玩家 ID -> 消息发送通道
#[derive(Default)]
pub struct Outbox {
    mailboxes: DashMap<AccountId, Mailbox>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登录后绑定
    pub fn register(
        &self,
        player_id: AccountId,
        connection: ConnectionId,
        tx: mpsc::Sender<ServerFrame>,
    ) {
        self.mailboxes.insert(player_id, Mailbox { connection, tx });
    }

    /// 解除绑定；只移除属于该连接的通道
    pub fn unregister(&self, player_id: AccountId, connection: ConnectionId) {
        self.mailboxes
            .remove_if(&player_id, |_, mailbox| mailbox.connection == connection);
    }

    /// 发送消息给玩家
    pub async fn send_to_player(&self, player_id: AccountId, event: Event) {
        // 先取出发送端，不能在持有分片锁时 await
        let tx = self.mailboxes.get(&player_id).map(|m| m.tx.clone());
        match tx {
            Some(tx) => {
                let _ = tx.send(ServerFrame::Event(event)).await;
            }
            None => debug!("玩家 {} 不在线，丢弃推送", player_id),
        }
    }
}

/// 待发送的消息
#[derive(Debug, Default)]
pub struct Pending {
    messages: Vec<(AccountId, Event)>,
}

impl Pending {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发送给多个玩家
    pub fn broadcast<I>(&mut self, players: I, event: Event)
    where
        I: IntoIterator<Item = AccountId>,
    {
        for player_id in players {
            self.messages.push((player_id, event.clone()));
        }
    }

    /// 取出全部消息（测试中检查用）
    #[cfg(test)]
    pub fn drain(&mut self) -> Vec<(AccountId, Event)> {
        std::mem::take(&mut self.messages)
    }

    pub async fn flush(self, outbox: &Outbox) {
        for (player_id, event) in self.messages {
            outbox.send_to_player(player_id, event).await;
        }
    }
}
