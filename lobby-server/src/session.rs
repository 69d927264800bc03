//! 会话注册表
//!
//! 每个连接最多持有一个会话，每个账号最多一个有效令牌。
//! 这是"账号是否在线"的唯一依据。

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use protocol::{AccountId, AccountKind, MAX_NAME_LEN};

use crate::error::{AuthError, LobbyError, LobbyResult, StoreError};
use crate::ids::random_hex;
use crate::store::{Account, NewAccount, Store};

/// 连接 ID
pub type ConnectionId = u64;

/// 已登录会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub account_id: AccountId,
    pub kind: AccountKind,
    pub username: String,
    pub connection: ConnectionId,
    pub logged_in_at: DateTime<Utc>,
}

#[derive(Default)]
struct Tables {
    by_token: HashMap<String, Session>,
    by_account: HashMap<AccountId, String>,
    by_connection: HashMap<ConnectionId, String>,
}

impl Tables {
    fn remove_token(&mut self, token: &str) -> Option<Session> {
        let session = self.by_token.remove(token)?;
        self.by_account.remove(&session.account_id);
        self.by_connection.remove(&session.connection);
        Some(session)
    }
}

/// 会话注册表
pub struct SessionRegistry {
    store: Arc<dyn Store>,
    tables: Mutex<Tables>,
}

/// 加盐密码哈希
fn hash_password(salt: &str, password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            tables: Mutex::new(Tables::default()),
        }
    }

    /// 验证用户名和密码格式
    pub fn validate_credentials(username: &str, password: &str) -> LobbyResult<()> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(LobbyError::bad_request("用户名和密码不能为空"));
        }
        if username.chars().count() > MAX_NAME_LEN {
            return Err(LobbyError::bad_request("用户名过长"));
        }
        if username.chars().any(|c| c.is_control()) {
            return Err(LobbyError::bad_request("用户名包含非法字符"));
        }
        Ok(())
    }

    /// 注册账号
    pub fn register(
        &self,
        kind: AccountKind,
        username: &str,
        password: &str,
    ) -> LobbyResult<Account> {
        Self::validate_credentials(username, password)?;

        let salt = random_hex(16);
        let account = self
            .store
            .create_account(NewAccount {
                kind,
                username: username.trim().to_string(),
                password_hash: hash_password(&salt, password),
                salt,
            })
            .map_err(|e| match e {
                StoreError::Conflict => LobbyError::from(AuthError::DuplicateAccount),
                other => LobbyError::from(other),
            })?;

        info!("注册账号: {} ({:?}, id={})", account.username, kind, account.id);
        Ok(account)
    }

    /// 登录，返回新令牌
    pub fn login(
        &self,
        connection: ConnectionId,
        kind: AccountKind,
        username: &str,
        password: &str,
    ) -> LobbyResult<Session> {
        let account = self
            .store
            .find_account(kind, username.trim())?
            .ok_or(AuthError::BadCredentials)?;

        if hash_password(&account.salt, password) != account.password_hash {
            warn!("登录失败: {} 密码错误", account.username);
            return Err(AuthError::BadCredentials.into());
        }

        let mut tables = self.tables.lock();
        if tables.by_account.contains_key(&account.id)
            || tables.by_connection.contains_key(&connection)
        {
            warn!("重复登录被拒绝: {} (连接 {})", account.username, connection);
            return Err(AuthError::AlreadyOnline.into());
        }

        let session = Session {
            token: random_hex(16),
            account_id: account.id,
            kind,
            username: account.username,
            connection,
            logged_in_at: Utc::now(),
        };
        tables.by_account.insert(session.account_id, session.token.clone());
        tables.by_connection.insert(connection, session.token.clone());
        tables.by_token.insert(session.token.clone(), session.clone());

        info!("登录成功: {} ({:?}, 连接 {})", session.username, kind, connection);
        Ok(session)
    }

    /// 注销（幂等）
    pub fn logout(&self, token: &str) -> Option<Session> {
        let removed = self.tables.lock().remove_token(token);
        if let Some(session) = &removed {
            info!("注销: {}", session.username);
        }
        removed
    }

    /// 校验令牌
    pub fn authenticate(&self, token: &str) -> Result<Session, AuthError> {
        self.tables
            .lock()
            .by_token
            .get(token)
            .cloned()
            .ok_or(AuthError::Unauthenticated)
    }

    /// 连接断开，作废绑定在该连接上的令牌
    pub fn drop_connection(&self, connection: ConnectionId) -> Option<Session> {
        let mut tables = self.tables.lock();
        let token = tables.by_connection.get(&connection).cloned()?;
        tables.remove_token(&token)
    }

    /// 账号是否在线
    pub fn is_online(&self, account_id: AccountId) -> bool {
        self.tables.lock().by_account.contains_key(&account_id)
    }

    /// 在线账号列表（按 ID 排序）
    pub fn online(&self, kind: AccountKind) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .tables
            .lock()
            .by_token
            .values()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.account_id);
        sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[test]
    fn test_register_and_login() {
        let sessions = registry();
        let account = sessions.register(AccountKind::Player, "alice", "pw").unwrap();

        let session = sessions.login(1, AccountKind::Player, "alice", "pw").unwrap();
        assert_eq!(session.account_id, account.id);
        assert_eq!(session.token.len(), 32);
        assert_eq!(sessions.authenticate(&session.token).unwrap(), session);
    }

    #[test]
    fn test_duplicate_account() {
        let sessions = registry();
        sessions.register(AccountKind::Player, "alice", "pw").unwrap();

        let err = sessions.register(AccountKind::Player, "alice", "other").unwrap_err();
        assert!(matches!(err, LobbyError::Auth(AuthError::DuplicateAccount)));
        // 不同账号类型互不影响
        assert!(sessions.register(AccountKind::Developer, "alice", "pw").is_ok());
    }

    #[test]
    fn test_bad_credentials() {
        let sessions = registry();
        sessions.register(AccountKind::Player, "alice", "pw").unwrap();

        for (user, pass) in [("alice", "wrong"), ("bob", "pw")] {
            let err = sessions.login(1, AccountKind::Player, user, pass).unwrap_err();
            assert!(matches!(err, LobbyError::Auth(AuthError::BadCredentials)));
        }
        // 开发者账号不能登录玩家端
        let err = sessions.login(1, AccountKind::Developer, "alice", "pw").unwrap_err();
        assert!(matches!(err, LobbyError::Auth(AuthError::BadCredentials)));
    }

    #[test]
    fn test_already_online_then_logout() {
        let sessions = registry();
        sessions.register(AccountKind::Player, "alice", "pw").unwrap();

        let first = sessions.login(1, AccountKind::Player, "alice", "pw").unwrap();
        let err = sessions.login(2, AccountKind::Player, "alice", "pw").unwrap_err();
        assert!(matches!(err, LobbyError::Auth(AuthError::AlreadyOnline)));
        // 被拒绝的登录不产生令牌
        assert_eq!(sessions.online(AccountKind::Player).len(), 1);

        assert!(sessions.logout(&first.token).is_some());
        assert!(sessions.logout(&first.token).is_none());
        assert_eq!(
            sessions.authenticate(&first.token).unwrap_err(),
            AuthError::Unauthenticated
        );

        let second = sessions.login(2, AccountKind::Player, "alice", "pw").unwrap();
        assert_ne!(second.token, first.token);
    }

    #[test]
    fn test_one_session_per_connection() {
        let sessions = registry();
        sessions.register(AccountKind::Player, "alice", "pw").unwrap();
        sessions.register(AccountKind::Player, "bob", "pw").unwrap();

        sessions.login(1, AccountKind::Player, "alice", "pw").unwrap();
        let err = sessions.login(1, AccountKind::Player, "bob", "pw").unwrap_err();
        assert!(matches!(err, LobbyError::Auth(AuthError::AlreadyOnline)));
    }

    #[test]
    fn test_drop_connection() {
        let sessions = registry();
        let account = sessions.register(AccountKind::Player, "alice", "pw").unwrap();
        let session = sessions.login(7, AccountKind::Player, "alice", "pw").unwrap();

        assert!(sessions.is_online(account.id));
        assert_eq!(sessions.drop_connection(7).unwrap().token, session.token);
        assert!(!sessions.is_online(account.id));
        assert!(sessions.drop_connection(7).is_none());
    }

    #[test]
    fn test_empty_credentials_rejected() {
        let sessions = registry();
        assert!(matches!(
            sessions.register(AccountKind::Player, "  ", "pw"),
            Err(LobbyError::BadRequest(_))
        ));
        assert!(matches!(
            sessions.register(AccountKind::Player, "alice", ""),
            Err(LobbyError::BadRequest(_))
        ));
    }
}
