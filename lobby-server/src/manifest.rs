//! 游戏包清单 (manifest.json)

use std::fs;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LobbyError, LobbyResult};

/// 清单文件名
pub const MANIFEST_FILE: &str = "manifest.json";

/// 客户端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    Cli,
    Gui,
}

/// 入口描述
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// 相对于包根目录的入口文件
    pub module: String,
    /// 参数模板，支持 `{port}` `{token}` 等占位符
    #[serde(default)]
    pub argv: Vec<String>,
    /// 解释器；为空时按扩展名推断
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoints {
    pub server: EntryPoint,
    pub client: EntryPoint,
}

/// 游戏包清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub game_id: String,
    pub name: String,
    pub version: String,
    pub developer: String,
    pub description: String,
    pub client_type: ClientType,
    pub min_players: u32,
    pub max_players: u32,
    pub entrypoints: EntryPoints,
}

impl Manifest {
    /// 解析并校验清单文本
    pub fn parse(text: &str) -> LobbyResult<Self> {
        let manifest: Manifest = serde_json::from_str(text)
            .map_err(|e| LobbyError::invalid_package(format!("manifest.json 格式错误: {}", e)))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> LobbyResult<()> {
        if self.game_id.trim().is_empty()
            || self.name.trim().is_empty()
            || self.version.trim().is_empty()
            || self.developer.trim().is_empty()
        {
            return Err(LobbyError::invalid_package("清单缺少身份字段"));
        }

        if self.min_players == 0 || self.min_players > self.max_players {
            return Err(LobbyError::invalid_package(format!(
                "玩家人数范围非法: {}-{}",
                self.min_players, self.max_players
            )));
        }

        if self.entrypoints.server.module.trim().is_empty()
            || self.entrypoints.client.module.trim().is_empty()
        {
            return Err(LobbyError::invalid_package("入口文件为空"));
        }

        Ok(())
    }

    /// 在解压目录中定位包根目录并读取清单
    ///
    /// 清单可以在解压目录顶层，也可以在唯一的顶层子目录中。
    pub fn locate(extracted: &Path) -> LobbyResult<(PathBuf, Manifest)> {
        let root = find_package_root(extracted)?;
        let text = fs::read_to_string(root.join(MANIFEST_FILE))?;
        let manifest = Self::parse(&text)?;

        let module = Path::new(&manifest.entrypoints.server.module);
        let escapes = module
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || !root.join(module).is_file() {
            return Err(LobbyError::invalid_package(format!(
                "服务端入口不存在: {}",
                manifest.entrypoints.server.module
            )));
        }

        Ok((root, manifest))
    }
}

fn find_package_root(extracted: &Path) -> LobbyResult<PathBuf> {
    if extracted.join(MANIFEST_FILE).is_file() {
        return Ok(extracted.to_path_buf());
    }

    let children = fs::read_dir(extracted)?.collect::<Result<Vec<_>, _>>()?;
    if let [only] = children.as_slice() {
        let path = only.path();
        if path.is_dir() && path.join(MANIFEST_FILE).is_file() {
            return Ok(path);
        }
    }

    Err(LobbyError::invalid_package("缺少 manifest.json"))
}
