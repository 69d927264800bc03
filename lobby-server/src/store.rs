//! 记录存储
//!
//! [`Store`] 是大厅依赖的同步查询/命令接口；[`MemoryStore`] 是内存实现，
//! 可选地在每次修改后把全部数据写入一个 JSON 快照文件。

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use protocol::{AccountId, AccountKind, MatchResult};

use crate::error::StoreError;
use crate::manifest::{ClientType, EntryPoint};

pub type StoreResult<T> = Result<T, StoreError>;

/// 账号
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub kind: AccountKind,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
    pub created_at: DateTime<Utc>,
}

/// 新账号
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub kind: AccountKind,
    pub username: String,
    pub password_hash: String,
    pub salt: String,
}

/// 游戏版本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameVersion {
    pub version: String,
    pub client_type: ClientType,
    pub min_players: u32,
    pub max_players: u32,
    pub server: EntryPoint,
    pub client: EntryPoint,
    /// 小写十六进制 SHA-256
    pub hash: String,
    pub size_bytes: u64,
    pub file_name: String,
    /// 原始 zip
    pub archive_path: PathBuf,
    /// 解压后的包根目录
    pub package_root: PathBuf,
    pub changelog: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

/// 游戏
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GamePackage {
    pub game_id: String,
    pub name: String,
    pub description: String,
    pub developer_id: AccountId,
    pub delisted: bool,
    /// 按上传顺序，最后一个为最新版本
    pub versions: Vec<GameVersion>,
    pub created_at: DateTime<Utc>,
}

impl GamePackage {
    pub fn latest(&self) -> Option<&GameVersion> {
        self.versions.last()
    }

    pub fn find_version(&self, version: &str) -> Option<&GameVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

/// 新游戏
#[derive(Debug, Clone)]
pub struct NewPackage {
    pub game_id: String,
    pub name: String,
    pub description: String,
    pub developer_id: AccountId,
}

/// 记录存储接口
///
/// 所有调用都可能返回 [`StoreError::Unavailable`]，调用方视为暂时性失败。
pub trait Store: Send + Sync {
    /// 创建账号；同类型下用户名重复返回 [`StoreError::Conflict`]
    fn create_account(&self, account: NewAccount) -> StoreResult<Account>;

    fn find_account(&self, kind: AccountKind, username: &str) -> StoreResult<Option<Account>>;

    fn account(&self, id: AccountId) -> StoreResult<Option<Account>>;

    /// 创建游戏；ID 重复返回 [`StoreError::Conflict`]
    fn create_package(&self, package: NewPackage) -> StoreResult<GamePackage>;

    fn package(&self, game_id: &str) -> StoreResult<Option<GamePackage>>;

    /// 全部游戏（含已下架）
    fn list_packages(&self) -> StoreResult<Vec<GamePackage>>;

    /// 设置下架标记；游戏不存在返回 [`StoreError::Missing`]
    fn set_delisted(&self, game_id: &str, delisted: bool) -> StoreResult<()>;

    /// 追加版本；版本号重复返回 [`StoreError::Conflict`]
    fn add_version(&self, game_id: &str, version: GameVersion) -> StoreResult<()>;

    /// 查询版本；`version` 为空时返回最新版本
    fn version(&self, game_id: &str, version: Option<&str>) -> StoreResult<Option<GameVersion>>;

    fn record_match(&self, result: MatchResult) -> StoreResult<()>;

    /// 玩家是否玩过该游戏
    fn has_played(&self, player_id: AccountId, game_id: &str) -> StoreResult<bool>;

    fn matches_for_player(&self, player_id: AccountId) -> StoreResult<Vec<MatchResult>>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreData {
    next_account_id: AccountId,
    accounts: BTreeMap<AccountId, Account>,
    packages: BTreeMap<String, GamePackage>,
    matches: Vec<MatchResult>,
}

/// 内存存储
pub struct MemoryStore {
    data: Mutex<StoreData>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    /// 纯内存存储
    pub fn new() -> Self {
        Self {
            data: Mutex::new(StoreData {
                next_account_id: 1,
                ..StoreData::default()
            }),
            snapshot: None,
        }
    }

    /// 打开带快照的存储；快照存在时先加载
    pub fn open(snapshot: &Path) -> StoreResult<Self> {
        let data = if snapshot.exists() {
            let content = fs::read_to_string(snapshot).map_err(unavailable)?;
            serde_json::from_str(&content)
                .map_err(|e| StoreError::Unavailable(format!("快照格式错误: {}", e)))?
        } else {
            if let Some(parent) = snapshot.parent() {
                fs::create_dir_all(parent).map_err(unavailable)?;
            }
            StoreData {
                next_account_id: 1,
                ..StoreData::default()
            }
        };

        Ok(Self {
            data: Mutex::new(data),
            snapshot: Some(snapshot.to_path_buf()),
        })
    }

    /// 在锁内执行修改并写快照；快照写入失败时修改不生效
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreData) -> StoreResult<T>) -> StoreResult<T> {
        let mut data = self.data.lock();
        match &self.snapshot {
            None => f(&mut data),
            Some(path) => {
                let mut draft = data.clone();
                let value = f(&mut draft)?;
                persist(path, &draft)?;
                *data = draft;
                Ok(value)
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn unavailable(e: std::io::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// 先写临时文件再改名，保证快照完整
fn persist(path: &Path, data: &StoreData) -> StoreResult<()> {
    let content = serde_json::to_vec_pretty(data)
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    let tmp = path.with_extension("json.tmp");

    fs::write(&tmp, content)
        .and_then(|_| fs::rename(&tmp, path))
        .map_err(|e| {
            error!("写入存储快照失败: {:?}: {}", path, e);
            unavailable(e)
        })?;

    debug!("存储快照已更新: {:?}", path);
    Ok(())
}

impl Store for MemoryStore {
    fn create_account(&self, account: NewAccount) -> StoreResult<Account> {
        self.mutate(|data| {
            let taken = data
                .accounts
                .values()
                .any(|a| a.kind == account.kind && a.username == account.username);
            if taken {
                return Err(StoreError::Conflict);
            }

            let id = data.next_account_id.max(1);
            data.next_account_id = id + 1;

            let account = Account {
                id,
                kind: account.kind,
                username: account.username,
                password_hash: account.password_hash,
                salt: account.salt,
                created_at: Utc::now(),
            };
            data.accounts.insert(id, account.clone());
            Ok(account)
        })
    }

    fn find_account(&self, kind: AccountKind, username: &str) -> StoreResult<Option<Account>> {
        let data = self.data.lock();
        Ok(data
            .accounts
            .values()
            .find(|a| a.kind == kind && a.username == username)
            .cloned())
    }

    fn account(&self, id: AccountId) -> StoreResult<Option<Account>> {
        Ok(self.data.lock().accounts.get(&id).cloned())
    }

    fn create_package(&self, package: NewPackage) -> StoreResult<GamePackage> {
        self.mutate(|data| {
            if data.packages.contains_key(&package.game_id) {
                return Err(StoreError::Conflict);
            }

            let package = GamePackage {
                game_id: package.game_id,
                name: package.name,
                description: package.description,
                developer_id: package.developer_id,
                delisted: false,
                versions: Vec::new(),
                created_at: Utc::now(),
            };
            data.packages.insert(package.game_id.clone(), package.clone());
            Ok(package)
        })
    }

    fn package(&self, game_id: &str) -> StoreResult<Option<GamePackage>> {
        Ok(self.data.lock().packages.get(game_id).cloned())
    }

    fn list_packages(&self) -> StoreResult<Vec<GamePackage>> {
        Ok(self.data.lock().packages.values().cloned().collect())
    }

    fn set_delisted(&self, game_id: &str, delisted: bool) -> StoreResult<()> {
        self.mutate(|data| {
            let package = data.packages.get_mut(game_id).ok_or(StoreError::Missing)?;
            package.delisted = delisted;
            Ok(())
        })
    }

    fn add_version(&self, game_id: &str, version: GameVersion) -> StoreResult<()> {
        self.mutate(|data| {
            let package = data.packages.get_mut(game_id).ok_or(StoreError::Missing)?;
            if package.find_version(&version.version).is_some() {
                return Err(StoreError::Conflict);
            }
            package.versions.push(version);
            Ok(())
        })
    }

    fn version(&self, game_id: &str, version: Option<&str>) -> StoreResult<Option<GameVersion>> {
        let data = self.data.lock();
        let Some(package) = data.packages.get(game_id) else {
            return Ok(None);
        };
        Ok(match version {
            Some(v) => package.find_version(v).cloned(),
            None => package.latest().cloned(),
        })
    }

    fn record_match(&self, result: MatchResult) -> StoreResult<()> {
        self.mutate(|data| {
            data.matches.push(result);
            Ok(())
        })
    }

    fn has_played(&self, player_id: AccountId, game_id: &str) -> StoreResult<bool> {
        let data = self.data.lock();
        Ok(data
            .matches
            .iter()
            .any(|m| m.game_id == game_id && m.players.contains(&player_id)))
    }

    fn matches_for_player(&self, player_id: AccountId) -> StoreResult<Vec<MatchResult>> {
        let data = self.data.lock();
        Ok(data
            .matches
            .iter()
            .filter(|m| m.players.contains(&player_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_version(version: &str, min: u32, max: u32) -> GameVersion {
        GameVersion {
            version: version.to_string(),
            client_type: ClientType::Cli,
            min_players: min,
            max_players: max,
            server: EntryPoint {
                module: "server_main.py".to_string(),
                argv: vec!["{port}".to_string()],
                interpreter: None,
            },
            client: EntryPoint {
                module: "client_main.py".to_string(),
                argv: Vec::new(),
                interpreter: None,
            },
            hash: "00".repeat(32),
            size_bytes: 0,
            file_name: "package.zip".to_string(),
            archive_path: PathBuf::from("package.zip"),
            package_root: PathBuf::from("."),
            changelog: None,
            uploaded_at: Utc::now(),
        }
    }

    fn new_account(kind: AccountKind, username: &str) -> NewAccount {
        NewAccount {
            kind,
            username: username.to_string(),
            password_hash: "h".to_string(),
            salt: "s".to_string(),
        }
    }

    fn new_package(game_id: &str) -> NewPackage {
        NewPackage {
            game_id: game_id.to_string(),
            name: "Bomb".to_string(),
            description: String::new(),
            developer_id: 1,
        }
    }

    #[test]
    fn test_account_uniqueness_per_kind() {
        let store = MemoryStore::new();
        let dev = store.create_account(new_account(AccountKind::Developer, "alice")).unwrap();
        // 玩家与开发者账号分开
        let player = store.create_account(new_account(AccountKind::Player, "alice")).unwrap();
        assert_ne!(dev.id, player.id);

        assert_eq!(
            store
                .create_account(new_account(AccountKind::Player, "alice"))
                .unwrap_err(),
            StoreError::Conflict
        );
        assert_eq!(
            store.find_account(AccountKind::Player, "alice").unwrap().unwrap().id,
            player.id
        );
    }

    #[test]
    fn test_versions_latest_and_lookup() {
        let store = MemoryStore::new();
        store.create_package(new_package("bomb")).unwrap();
        store.add_version("bomb", sample_version("1.0", 2, 2)).unwrap();
        store.add_version("bomb", sample_version("1.1", 2, 4)).unwrap();

        assert_eq!(store.version("bomb", None).unwrap().unwrap().version, "1.1");
        assert_eq!(store.version("bomb", Some("1.0")).unwrap().unwrap().max_players, 2);
        assert!(store.version("bomb", Some("9.9")).unwrap().is_none());
        assert_eq!(
            store.add_version("bomb", sample_version("1.0", 2, 2)).unwrap_err(),
            StoreError::Conflict
        );
        assert_eq!(
            store.add_version("ghost", sample_version("1.0", 2, 2)).unwrap_err(),
            StoreError::Missing
        );
    }

    #[test]
    fn test_match_history() {
        let store = MemoryStore::new();
        store
            .record_match(MatchResult {
                room_id: 1,
                game_id: "bomb".to_string(),
                version: "1.0".to_string(),
                started_at: 0,
                ended_at: 1,
                winner: Some(7),
                reason: "finished".to_string(),
                results: serde_json::Value::Null,
                players: vec![7, 8],
            })
            .unwrap();

        assert!(store.has_played(8, "bomb").unwrap());
        assert!(!store.has_played(9, "bomb").unwrap());
        assert_eq!(store.matches_for_player(7).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        {
            let store = MemoryStore::open(&path).unwrap();
            store.create_account(new_account(AccountKind::Developer, "dev")).unwrap();
            store.create_package(new_package("bomb")).unwrap();
            store.set_delisted("bomb", true).unwrap();
        }

        let store = MemoryStore::open(&path).unwrap();
        assert!(store.find_account(AccountKind::Developer, "dev").unwrap().is_some());
        assert!(store.package("bomb").unwrap().unwrap().delisted);
        // ID 计数器也被恢复
        let next = store.create_account(new_account(AccountKind::Player, "p")).unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn test_snapshot_write_failure_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = MemoryStore::open(&path).unwrap();

        // 快照位置被目录占用，写入必然失败
        fs::create_dir_all(&path).unwrap();
        assert!(matches!(
            store.create_package(new_package("bomb")),
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.package("bomb").unwrap().is_none());
    }
}
