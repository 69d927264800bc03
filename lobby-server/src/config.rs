//! 服务配置
//!
//! 加载顺序: 默认值 → JSON 配置文件 → 环境变量覆盖 → 校验。

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use protocol::{DEFAULT_DEVELOPER_PORT, DEFAULT_LOBBY_PORT};

/// 默认上传大小上限（256 MiB）
const DEFAULT_MAX_UPLOAD_BYTES: u64 = 256 * 1024 * 1024;

/// 大厅服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbyConfig {
    /// 玩家大厅监听地址
    pub lobby_bind: String,
    /// 开发者服务监听地址
    pub developer_bind: String,
    /// 下发给玩家的游戏服务器地址
    pub public_game_host: String,
    /// 游戏服务器回连大厅用的地址
    pub callback_host: String,
    /// 游戏服务器端口池
    pub game_port_min: u16,
    pub game_port_max: u16,
    /// 数据根目录（游戏包、临时文件、日志）
    pub storage_root: PathBuf,
    /// 记录存储的 JSON 快照；为空时只在内存中
    pub store_snapshot: Option<PathBuf>,
    pub spawn_timeout_secs: u64,
    pub exit_grace_ms: u64,
    pub stop_timeout_secs: u64,
    pub transfer_idle_timeout_secs: u64,
    pub session_idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_upload_bytes: u64,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        let storage_root = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("arcade-lobby");

        Self {
            lobby_bind: format!("0.0.0.0:{}", DEFAULT_LOBBY_PORT),
            developer_bind: format!("0.0.0.0:{}", DEFAULT_DEVELOPER_PORT),
            public_game_host: "127.0.0.1".to_string(),
            callback_host: "127.0.0.1".to_string(),
            game_port_min: 10000,
            game_port_max: 20000,
            storage_root,
            store_snapshot: None,
            spawn_timeout_secs: 10,
            exit_grace_ms: 500,
            stop_timeout_secs: 2,
            transfer_idle_timeout_secs: 120,
            session_idle_timeout_secs: 600,
            sweep_interval_secs: 15,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl LobbyConfig {
    /// 从文件加载（可选），再应用环境变量并校验
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// 读取 JSON 配置文件，缺省字段取默认值
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("无法读取配置文件: {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("配置文件格式错误: {}", path.display()))
    }

    /// 应用环境变量覆盖
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = lookup("ARCADE_LOBBY_BIND") {
            self.lobby_bind = bind;
        }

        if let Some(bind) = lookup("ARCADE_DEVELOPER_BIND") {
            self.developer_bind = bind;
        }

        if let Some(host) = lookup("ARCADE_PUBLIC_GAME_HOST") {
            self.public_game_host = host;
        }

        if let Some(root) = lookup("ARCADE_STORAGE_ROOT") {
            self.storage_root = PathBuf::from(root);
        }

        if let Some(port) = lookup("ARCADE_GAME_PORT_MIN").and_then(|v| v.parse().ok()) {
            self.game_port_min = port;
        }

        if let Some(port) = lookup("ARCADE_GAME_PORT_MAX").and_then(|v| v.parse().ok()) {
            self.game_port_max = port;
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        self.lobby_bind
            .parse::<SocketAddr>()
            .context("lobby_bind 格式错误")?;

        self.developer_bind
            .parse::<SocketAddr>()
            .context("developer_bind 格式错误")?;

        if self.game_port_min == 0 || self.game_port_min > self.game_port_max {
            return Err(anyhow::anyhow!(
                "游戏端口范围非法: {}-{}",
                self.game_port_min,
                self.game_port_max
            ));
        }

        if self.public_game_host.is_empty() {
            return Err(anyhow::anyhow!("public_game_host 不能为空"));
        }

        if self.spawn_timeout_secs == 0 {
            return Err(anyhow::anyhow!("spawn_timeout_secs 必须大于 0"));
        }

        if self.max_upload_bytes == 0 {
            return Err(anyhow::anyhow!("max_upload_bytes 必须大于 0"));
        }

        Ok(())
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    pub fn exit_grace(&self) -> Duration {
        Duration::from_millis(self.exit_grace_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn transfer_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.transfer_idle_timeout_secs)
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.session_idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// 大厅对游戏服务器公布的端口
    pub fn lobby_port(&self) -> u16 {
        self.lobby_bind
            .parse::<SocketAddr>()
            .map(|addr| addr.port())
            .unwrap_or(DEFAULT_LOBBY_PORT)
    }

    /// 游戏包目录
    pub fn packages_dir(&self) -> PathBuf {
        self.storage_root.join("packages")
    }

    /// 上传暂存目录
    pub fn uploads_dir(&self) -> PathBuf {
        self.storage_root.join("uploads")
    }

    /// 游戏服务器日志目录
    pub fn logs_dir(&self) -> PathBuf {
        self.storage_root.join("run").join("logs")
    }
}
