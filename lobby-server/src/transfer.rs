//! 分片传输引擎
//!
//! 上传: init 声明大小和哈希 → 按序号 0,1,2.. 发送分片 → finish 校验并发布。
//! 下载: init 重新校验文件哈希 → 按偏移量读取窗口，到达末尾的窗口带 `done`。
//!
//! 任何传输错误都会丢弃对应会话，不影响服务器其他部分。

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use protocol::{
    codec::base64_bytes, AccountId, UploadInit, MAX_CHUNK_BYTES, MAX_DESC_LEN, MAX_IDENT_LEN,
};

use crate::archive::extract_zip;
use crate::config::LobbyConfig;
use crate::error::{LobbyError, LobbyResult, StoreError, TransferError};
use crate::ids::{random_hex, to_hex};
use crate::manifest::Manifest;
use crate::session::ConnectionId;
use crate::store::{GameVersion, NewPackage, Store};

/// 包内 zip 文件名
const ARCHIVE_NAME: &str = "package.zip";

/// 解压目录名
const EXTRACTED_DIR: &str = "extracted";

/// 上传初始化结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTicket {
    pub upload_id: String,
    pub game_id: String,
}

/// 分片确认
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChunkAck {
    pub received: u64,
    pub expected: u64,
}

/// 发布结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Published {
    pub game_id: String,
    pub version: String,
}

/// 下载初始化结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadTicket {
    pub download_id: String,
    pub game_id: String,
    pub version: String,
    pub file_name: String,
    pub size_bytes: u64,
    pub hash: String,
}

/// 下载窗口
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadWindow {
    pub download_id: String,
    pub offset: u64,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    pub done: bool,
}

struct UploadSession {
    developer_id: AccountId,
    game_id: String,
    name: Option<String>,
    description: Option<String>,
    version: String,
    file_name: String,
    expected_size: u64,
    expected_hash: String,
    received: u64,
    next_seq: u64,
    hasher: Sha256,
    staging_path: PathBuf,
    file: File,
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        // 发布成功后暂存文件已被移走，这里失败无妨
        let _ = fs::remove_file(&self.staging_path);
    }
}

struct DownloadSession {
    game_id: String,
    version: String,
    path: PathBuf,
    size: u64,
    /// 已交付的最远位置
    cursor: u64,
}

enum Transfer {
    Upload(UploadSession),
    Download(DownloadSession),
}

struct Entry {
    connection: ConnectionId,
    last_activity: Instant,
    transfer: Transfer,
}

type EntryRef = Arc<Mutex<Entry>>;

/// 传输引擎
pub struct TransferEngine {
    store: Arc<dyn Store>,
    sessions: DashMap<String, EntryRef>,
    uploads_dir: PathBuf,
    packages_dir: PathBuf,
    max_upload_bytes: u64,
}

impl TransferEngine {
    pub fn new(config: &LobbyConfig, store: Arc<dyn Store>) -> LobbyResult<Self> {
        let uploads_dir = config.uploads_dir();
        let packages_dir = config.packages_dir();
        fs::create_dir_all(&uploads_dir)?;
        fs::create_dir_all(&packages_dir)?;

        Ok(Self {
            store,
            sessions: DashMap::new(),
            uploads_dir,
            packages_dir,
            max_upload_bytes: config.max_upload_bytes,
        })
    }

    /// 当前活跃的传输会话数
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    /// 取出属于该连接的会话
    fn entry(&self, connection: ConnectionId, id: &str) -> LobbyResult<EntryRef> {
        let entry = self
            .sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| TransferError::UnknownTransferId(id.to_string()))?;

        if entry.lock().connection != connection {
            return Err(TransferError::UnknownTransferId(id.to_string()).into());
        }
        Ok(entry)
    }

    fn discard(&self, id: &str) {
        self.sessions.remove(id);
    }

    // ========================================================================
    // 上传
    // ========================================================================

    /// 开始上传
    pub fn begin_upload(
        &self,
        connection: ConnectionId,
        developer_id: AccountId,
        init: UploadInit,
    ) -> LobbyResult<UploadTicket> {
        let version = init.version.trim().to_string();
        if !is_valid_ident(&version) {
            return Err(LobbyError::bad_request("版本号非法"));
        }
        if init.size_bytes == 0 || init.size_bytes > self.max_upload_bytes {
            return Err(LobbyError::bad_request(format!(
                "文件大小非法: {} (上限 {})",
                init.size_bytes, self.max_upload_bytes
            )));
        }
        let expected_hash = init.hash.trim().to_ascii_lowercase();
        if expected_hash.len() != 64 || !expected_hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(LobbyError::bad_request("哈希必须是 64 位十六进制 SHA-256"));
        }
        let name = init.name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        let description = init.description.map(|d| d.trim().to_string());
        if name.as_ref().is_some_and(|n| n.chars().count() > MAX_IDENT_LEN)
            || description.as_ref().is_some_and(|d| d.chars().count() > MAX_DESC_LEN)
        {
            return Err(LobbyError::bad_request("名称或描述过长"));
        }

        let game_id = match init.game_id.map(|g| g.trim().to_string()).filter(|g| !g.is_empty()) {
            Some(game_id) => {
                if !is_valid_ident(&game_id) {
                    return Err(LobbyError::bad_request("游戏 ID 非法"));
                }
                if let Some(package) = self.store.package(&game_id)? {
                    if package.developer_id != developer_id {
                        return Err(LobbyError::Forbidden);
                    }
                    if package.find_version(&version).is_some() {
                        return Err(LobbyError::AlreadyExists("version"));
                    }
                }
                game_id
            }
            None => {
                let name = name
                    .as_deref()
                    .ok_or_else(|| LobbyError::bad_request("新游戏需要提供 gameId 或 name"))?;
                self.allocate_game_id(name)?
            }
        };

        let upload_id = random_hex(12);
        let staging_path = self.uploads_dir.join(format!("{}.part", upload_id));
        let file = File::create(&staging_path)?;

        let file_name = init
            .file_name
            .and_then(|f| Path::new(&f).file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| format!("{}-{}.zip", game_id, version));

        info!(
            "开始上传: {} {} ({} 字节, 会话 {})",
            game_id, version, init.size_bytes, upload_id
        );

        let session = UploadSession {
            developer_id,
            game_id: game_id.clone(),
            name,
            description,
            version,
            file_name,
            expected_size: init.size_bytes,
            expected_hash,
            received: 0,
            next_seq: 0,
            hasher: Sha256::new(),
            staging_path,
            file,
        };
        self.sessions.insert(
            upload_id.clone(),
            Arc::new(Mutex::new(Entry {
                connection,
                last_activity: Instant::now(),
                transfer: Transfer::Upload(session),
            })),
        );

        Ok(UploadTicket { upload_id, game_id })
    }

    /// 根据名称生成未被占用的游戏 ID
    fn allocate_game_id(&self, name: &str) -> LobbyResult<String> {
        let base = slugify(name);
        if self.store.package(&base)?.is_none() {
            return Ok(base);
        }
        for _ in 0..8 {
            let candidate = format!("{}-{}", base, random_hex(2));
            if self.store.package(&candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        Err(LobbyError::AlreadyExists("gameId"))
    }

    /// 接收分片
    pub fn upload_chunk(
        &self,
        connection: ConnectionId,
        upload_id: &str,
        seq: u64,
        data: &[u8],
    ) -> LobbyResult<ChunkAck> {
        let entry = self.entry(connection, upload_id)?;

        let result = {
            let mut guard = entry.lock();
            guard.last_activity = Instant::now();
            match &mut guard.transfer {
                Transfer::Upload(upload) => write_chunk(upload, seq, data),
                Transfer::Download(_) => {
                    return Err(TransferError::UnknownTransferId(upload_id.to_string()).into())
                }
            }
        };

        if let Err(e) = &result {
            if matches!(e, LobbyError::Transfer(_) | LobbyError::Io(_)) {
                warn!("上传 {} 分片 {} 失败，丢弃会话: {}", upload_id, seq, e);
                self.discard(upload_id);
            }
        }
        result
    }

    /// 完成上传：校验大小和哈希后发布
    ///
    /// 涉及解压，调用方应在阻塞线程池中执行。
    pub fn finish_upload(
        &self,
        connection: ConnectionId,
        upload_id: &str,
        changelog: Option<String>,
    ) -> LobbyResult<Published> {
        self.entry(connection, upload_id)?;
        let (_, entry) = self
            .sessions
            .remove(upload_id)
            .ok_or_else(|| TransferError::UnknownTransferId(upload_id.to_string()))?;

        let mut guard = entry.lock();
        let upload = match &mut guard.transfer {
            Transfer::Upload(upload) => upload,
            Transfer::Download(_) => {
                return Err(TransferError::UnknownTransferId(upload_id.to_string()).into())
            }
        };

        if upload.received != upload.expected_size {
            warn!(
                "上传 {} 大小不符: {}/{}",
                upload_id, upload.received, upload.expected_size
            );
            return Err(TransferError::SizeMismatch {
                expected: upload.expected_size,
                actual: upload.received,
            }
            .into());
        }

        let digest = to_hex(&upload.hasher.clone().finalize());
        if digest != upload.expected_hash {
            warn!("上传 {} 哈希不符", upload_id);
            return Err(TransferError::HashMismatch.into());
        }

        upload.file.flush()?;
        let published = self.publish(upload_id, upload, changelog)?;
        info!("发布成功: {} {}", published.game_id, published.version);
        Ok(published)
    }

    /// 在私有暂存目录中组装好包，再整体改名到位，最后写入存储
    fn publish(
        &self,
        upload_id: &str,
        upload: &UploadSession,
        changelog: Option<String>,
    ) -> LobbyResult<Published> {
        let game_dir = self.packages_dir.join(&upload.game_id);
        let final_dir = game_dir.join(&upload.version);
        if final_dir.exists() {
            return Err(LobbyError::AlreadyExists("version"));
        }

        let staging_dir = game_dir.join(format!(".staging-{}", upload_id));
        let (relative_root, manifest) = match assemble(&staging_dir, upload) {
            Ok(assembled) => assembled,
            Err(e) => {
                let _ = fs::remove_dir_all(&staging_dir);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&staging_dir, &final_dir) {
            let _ = fs::remove_dir_all(&staging_dir);
            return Err(e.into());
        }

        let version = GameVersion {
            version: upload.version.clone(),
            client_type: manifest.client_type,
            min_players: manifest.min_players,
            max_players: manifest.max_players,
            server: manifest.entrypoints.server.clone(),
            client: manifest.entrypoints.client.clone(),
            hash: upload.expected_hash.clone(),
            size_bytes: upload.expected_size,
            file_name: upload.file_name.clone(),
            archive_path: final_dir.join(ARCHIVE_NAME),
            package_root: final_dir.join(relative_root),
            changelog: changelog.filter(|c| !c.trim().is_empty()),
            uploaded_at: Utc::now(),
        };

        if let Err(e) = self.record_version(upload, &manifest, version) {
            let _ = fs::remove_dir_all(&final_dir);
            return Err(e);
        }

        Ok(Published {
            game_id: upload.game_id.clone(),
            version: upload.version.clone(),
        })
    }

    fn record_version(
        &self,
        upload: &UploadSession,
        manifest: &Manifest,
        version: GameVersion,
    ) -> LobbyResult<()> {
        let package = match self.store.package(&upload.game_id)? {
            Some(package) => package,
            None => {
                let created = self.store.create_package(NewPackage {
                    game_id: upload.game_id.clone(),
                    name: upload.name.clone().unwrap_or_else(|| manifest.name.clone()),
                    description: upload
                        .description
                        .clone()
                        .unwrap_or_else(|| manifest.description.clone()),
                    developer_id: upload.developer_id,
                });
                match created {
                    Ok(package) => package,
                    // 并发创建同一个游戏
                    Err(StoreError::Conflict) => self
                        .store
                        .package(&upload.game_id)?
                        .ok_or(StoreError::Missing)?,
                    Err(e) => return Err(e.into()),
                }
            }
        };

        if package.developer_id != upload.developer_id {
            return Err(LobbyError::Forbidden);
        }

        self.store
            .add_version(&upload.game_id, version)
            .map_err(|e| match e {
                StoreError::Conflict => LobbyError::AlreadyExists("version"),
                other => other.into(),
            })
    }

    // ========================================================================
    // 下载
    // ========================================================================

    /// 开始下载；文件哈希与记录不符时拒绝
    ///
    /// 需要读完整个文件，调用方应在阻塞线程池中执行。
    pub fn begin_download(
        &self,
        connection: ConnectionId,
        game_id: &str,
        version: Option<&str>,
    ) -> LobbyResult<DownloadTicket> {
        if self.store.package(game_id)?.is_none() {
            return Err(LobbyError::NotFound("game"));
        }
        let record = self
            .store
            .version(game_id, version)?
            .ok_or(LobbyError::NotFound("version"))?;

        let (size, digest) = file_digest(&record.archive_path).map_err(|e| {
            warn!("游戏包文件不可读: {:?}: {}", record.archive_path, e);
            LobbyError::NotFound("artifact")
        })?;
        if size != record.size_bytes {
            warn!("游戏包大小与记录不符: {} {}", game_id, record.version);
            return Err(TransferError::SizeMismatch {
                expected: record.size_bytes,
                actual: size,
            }
            .into());
        }
        if digest != record.hash {
            warn!("游戏包哈希与记录不符: {} {}", game_id, record.version);
            return Err(TransferError::HashMismatch.into());
        }

        let download_id = random_hex(12);
        self.sessions.insert(
            download_id.clone(),
            Arc::new(Mutex::new(Entry {
                connection,
                last_activity: Instant::now(),
                transfer: Transfer::Download(DownloadSession {
                    game_id: game_id.to_string(),
                    version: record.version.clone(),
                    path: record.archive_path.clone(),
                    size,
                    cursor: 0,
                }),
            })),
        );

        debug!("开始下载: {} {} (会话 {})", game_id, record.version, download_id);
        Ok(DownloadTicket {
            download_id,
            game_id: game_id.to_string(),
            version: record.version,
            file_name: record.file_name,
            size_bytes: size,
            hash: record.hash,
        })
    }

    /// 读取一个下载窗口
    pub fn download_chunk(
        &self,
        connection: ConnectionId,
        download_id: &str,
        offset: u64,
        limit: Option<u64>,
    ) -> LobbyResult<DownloadWindow> {
        let entry = self.entry(connection, download_id)?;

        let result = {
            let mut guard = entry.lock();
            guard.last_activity = Instant::now();
            match &mut guard.transfer {
                Transfer::Download(download) => read_window(download, offset, limit),
                Transfer::Upload(_) => {
                    return Err(TransferError::UnknownTransferId(download_id.to_string()).into())
                }
            }
        };

        match result {
            Ok((data, done)) => {
                if done {
                    self.discard(download_id);
                    debug!("下载完成: 会话 {}", download_id);
                }
                Ok(DownloadWindow {
                    download_id: download_id.to_string(),
                    offset,
                    data,
                    done,
                })
            }
            Err(e) => {
                if matches!(e, LobbyError::Io(_)) {
                    self.discard(download_id);
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // 清理
    // ========================================================================

    /// 主动取消
    pub fn abort(&self, connection: ConnectionId, id: &str) -> LobbyResult<()> {
        self.entry(connection, id)?;
        self.discard(id);
        info!("传输已取消: {}", id);
        Ok(())
    }

    /// 连接断开，丢弃它的全部传输
    pub fn abort_connection(&self, connection: ConnectionId) -> usize {
        let owned: Vec<String> = self
            .snapshot()
            .into_iter()
            .filter(|(_, entry)| entry.lock().connection == connection)
            .map(|(id, _)| id)
            .collect();

        for id in &owned {
            self.discard(id);
        }
        if !owned.is_empty() {
            info!("连接 {} 断开，丢弃 {} 个传输", connection, owned.len());
        }
        owned.len()
    }

    /// 回收空闲超时的会话
    pub fn reap_idle(&self, idle: Duration) -> usize {
        let expired: Vec<(String, String)> = self
            .snapshot()
            .into_iter()
            .filter_map(|(id, entry)| {
                let guard = entry.lock();
                if guard.last_activity.elapsed() >= idle {
                    Some((id, describe(&guard)))
                } else {
                    None
                }
            })
            .collect();

        for (id, what) in &expired {
            self.discard(id);
            warn!("传输空闲超时: {} ({})", id, what);
        }
        expired.len()
    }

    /// 复制出会话列表，避免持有分片锁时再去锁会话
    fn snapshot(&self) -> Vec<(String, EntryRef)> {
        self.sessions
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

fn describe(entry: &Entry) -> String {
    match &entry.transfer {
        Transfer::Upload(u) => format!(
            "上传 {} {} {}/{}",
            u.game_id, u.version, u.received, u.expected_size
        ),
        Transfer::Download(d) => format!(
            "下载 {} {} {}/{}",
            d.game_id, d.version, d.cursor, d.size
        ),
    }
}

fn write_chunk(upload: &mut UploadSession, seq: u64, data: &[u8]) -> LobbyResult<ChunkAck> {
    if seq != upload.next_seq {
        return Err(TransferError::SequenceError {
            expected: upload.next_seq,
            received: seq,
        }
        .into());
    }
    if data.is_empty() {
        return Err(LobbyError::bad_request("空分片"));
    }
    if data.len() > MAX_CHUNK_BYTES {
        return Err(LobbyError::bad_request("分片过大"));
    }

    let received = upload.received + data.len() as u64;
    if received > upload.expected_size {
        return Err(TransferError::SizeMismatch {
            expected: upload.expected_size,
            actual: received,
        }
        .into());
    }

    upload.file.write_all(data)?;
    upload.hasher.update(data);
    upload.received = received;
    upload.next_seq += 1;

    Ok(ChunkAck {
        received,
        expected: upload.expected_size,
    })
}

fn read_window(
    download: &mut DownloadSession,
    offset: u64,
    limit: Option<u64>,
) -> LobbyResult<(Vec<u8>, bool)> {
    if offset > download.size {
        return Err(LobbyError::bad_request(format!(
            "偏移量越界: {} > {}",
            offset, download.size
        )));
    }

    let window = limit
        .unwrap_or(MAX_CHUNK_BYTES as u64)
        .clamp(1, MAX_CHUNK_BYTES as u64);
    let length = window.min(download.size - offset);

    let mut file = File::open(&download.path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut data = vec![0u8; length as usize];
    file.read_exact(&mut data)?;

    let end = offset + length;
    download.cursor = download.cursor.max(end);
    Ok((data, end == download.size))
}

/// 在暂存目录中放入 zip 并解压，返回包根目录（相对暂存目录）和清单
fn assemble(staging_dir: &Path, upload: &UploadSession) -> LobbyResult<(PathBuf, Manifest)> {
    fs::create_dir_all(staging_dir)?;

    let archive_path = staging_dir.join(ARCHIVE_NAME);
    fs::rename(&upload.staging_path, &archive_path)?;

    let extracted = staging_dir.join(EXTRACTED_DIR);
    extract_zip(&archive_path, &extracted)?;

    let (root, manifest) = Manifest::locate(&extracted)?;
    if manifest.game_id != upload.game_id {
        return Err(LobbyError::invalid_package(format!(
            "清单 gameId 不符: {} != {}",
            manifest.game_id, upload.game_id
        )));
    }
    if manifest.version != upload.version {
        return Err(LobbyError::invalid_package(format!(
            "清单版本不符: {} != {}",
            manifest.version, upload.version
        )));
    }

    let relative = root
        .strip_prefix(staging_dir)
        .map(Path::to_path_buf)
        .map_err(|_| LobbyError::Internal("包根目录不在暂存目录中".to_string()))?;
    Ok((relative, manifest))
}

/// 流式计算文件大小和 SHA-256
fn file_digest(path: &Path) -> std::io::Result<(u64, String)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, to_hex(&hasher.finalize())))
}

/// 游戏 ID / 版本号: 字母数字开头，只含字母数字和 `.` `_` `-`
pub fn is_valid_ident(s: &str) -> bool {
    s.len() <= MAX_IDENT_LEN
        && s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
}

/// 由名称生成游戏 ID
pub fn slugify(name: &str) -> String {
    let mut slug = String::new();
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.is_empty() && !slug.ends_with('-') {
            slug.push('-');
        }
    }
    let slug: String = slug.trim_end_matches('-').chars().take(48).collect();
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() {
        "game".to_string()
    } else {
        slug
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::archive::tests::build_zip;
    use crate::manifest::tests::manifest_json;
    use crate::store::MemoryStore;

    pub(crate) struct Fixture {
        pub dir: tempfile::TempDir,
        pub store: Arc<MemoryStore>,
        pub engine: TransferEngine,
    }

    pub(crate) fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = LobbyConfig {
            storage_root: dir.path().to_path_buf(),
            ..LobbyConfig::default()
        };
        let store = Arc::new(MemoryStore::new());
        let engine = TransferEngine::new(&config, store.clone()).unwrap();
        Fixture { dir, store, engine }
    }

    pub(crate) fn package_zip(game_id: &str, version: &str, min: u32, max: u32) -> Vec<u8> {
        let manifest = manifest_json(game_id, version, min, max);
        build_zip(&[
            ("bomb/manifest.json", manifest.as_bytes()),
            ("bomb/server_main.py", b"print('server')"),
            ("bomb/client_main.py", b"print('client')"),
        ])
    }

    pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
        to_hex(&Sha256::digest(bytes))
    }

    fn init(game_id: &str, version: &str, bytes: &[u8]) -> UploadInit {
        UploadInit {
            game_id: Some(game_id.to_string()),
            name: Some("Bomb Pass".to_string()),
            description: None,
            version: version.to_string(),
            file_name: Some("bomb.zip".to_string()),
            size_bytes: bytes.len() as u64,
            hash: sha256_hex(bytes),
        }
    }

    /// 完整上传一个版本
    pub(crate) fn upload(
        engine: &TransferEngine,
        developer: AccountId,
        game_id: &str,
        version: &str,
        bytes: &[u8],
    ) -> LobbyResult<Published> {
        let ticket = engine.begin_upload(1, developer, init(game_id, version, bytes))?;
        for (seq, chunk) in bytes.chunks(1000).enumerate() {
            engine.upload_chunk(1, &ticket.upload_id, seq as u64, chunk)?;
        }
        engine.finish_upload(1, &ticket.upload_id, Some("first".to_string()))
    }

    #[test]
    fn test_upload_publishes_version() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);

        let published = upload(&fx.engine, 9, "bomb", "1.0", &bytes).unwrap();
        assert_eq!(published.game_id, "bomb");

        let version = fx.store.version("bomb", None).unwrap().unwrap();
        assert_eq!(version.max_players, 2);
        assert_eq!(version.size_bytes, bytes.len() as u64);
        assert!(version.package_root.join("server_main.py").is_file());
        assert_eq!(fs::read(&version.archive_path).unwrap(), bytes);
        assert_eq!(fx.store.package("bomb").unwrap().unwrap().developer_id, 9);
        assert_eq!(fx.engine.active(), 0);
    }

    #[test]
    fn test_out_of_order_chunk_discards_session() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        let ticket = fx.engine.begin_upload(1, 9, init("bomb", "1.0", &bytes)).unwrap();

        fx.engine.upload_chunk(1, &ticket.upload_id, 0, &bytes[..10]).unwrap();
        let err = fx.engine.upload_chunk(1, &ticket.upload_id, 2, &bytes[10..20]).unwrap_err();
        assert!(matches!(
            err,
            LobbyError::Transfer(TransferError::SequenceError { expected: 1, received: 2 })
        ));

        // 会话已被丢弃，暂存文件被删除
        let err = fx.engine.upload_chunk(1, &ticket.upload_id, 1, &bytes[10..20]).unwrap_err();
        assert!(matches!(err, LobbyError::Transfer(TransferError::UnknownTransferId(_))));
        assert_eq!(fs::read_dir(fx.dir.path().join("uploads")).unwrap().count(), 0);
        assert!(fx.store.package("bomb").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_seq_rejected() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        let ticket = fx.engine.begin_upload(1, 9, init("bomb", "1.0", &bytes)).unwrap();

        fx.engine.upload_chunk(1, &ticket.upload_id, 0, &bytes[..10]).unwrap();
        assert!(matches!(
            fx.engine.upload_chunk(1, &ticket.upload_id, 0, &bytes[..10]),
            Err(LobbyError::Transfer(TransferError::SequenceError { .. }))
        ));
    }

    #[test]
    fn test_overflow_is_size_mismatch() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        let ticket = fx.engine.begin_upload(1, 9, init("bomb", "1.0", &bytes[..100])).unwrap();

        let err = fx.engine.upload_chunk(1, &ticket.upload_id, 0, &bytes[..101]).unwrap_err();
        assert!(matches!(err, LobbyError::Transfer(TransferError::SizeMismatch { .. })));
        assert_eq!(fx.engine.active(), 0);
    }

    #[test]
    fn test_short_upload_is_size_mismatch() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        let ticket = fx.engine.begin_upload(1, 9, init("bomb", "1.0", &bytes)).unwrap();
        fx.engine.upload_chunk(1, &ticket.upload_id, 0, &bytes[..10]).unwrap();

        let err = fx.engine.finish_upload(1, &ticket.upload_id, None).unwrap_err();
        assert!(matches!(err, LobbyError::Transfer(TransferError::SizeMismatch { .. })));
        assert!(fx.store.version("bomb", None).unwrap().is_none());
    }

    #[test]
    fn test_hash_mismatch_publishes_nothing() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        let mut declared = init("bomb", "1.0", &bytes);
        declared.hash = "ab".repeat(32);

        let ticket = fx.engine.begin_upload(1, 9, declared).unwrap();
        fx.engine.upload_chunk(1, &ticket.upload_id, 0, &bytes).unwrap();

        let err = fx.engine.finish_upload(1, &ticket.upload_id, None).unwrap_err();
        assert!(matches!(err, LobbyError::Transfer(TransferError::HashMismatch)));
        assert!(fx.store.package("bomb").unwrap().is_none());
        assert!(!fx.dir.path().join("packages/bomb/1.0").exists());
    }

    #[test]
    fn test_manifest_mismatch_rolls_back() {
        let fx = fixture();
        let bytes = package_zip("other", "1.0", 2, 2);

        let err = upload(&fx.engine, 9, "bomb", "1.0", &bytes).unwrap_err();
        assert!(matches!(err, LobbyError::InvalidPackage(_)));
        // 暂存目录被清理，没有任何可见产物
        let game_dir = fx.dir.path().join("packages/bomb");
        assert!(!game_dir.exists() || fs::read_dir(&game_dir).unwrap().count() == 0);
    }

    #[test]
    fn test_foreign_game_forbidden() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        upload(&fx.engine, 9, "bomb", "1.0", &bytes).unwrap();

        let next = package_zip("bomb", "1.1", 2, 2);
        assert!(matches!(
            fx.engine.begin_upload(1, 10, init("bomb", "1.1", &next)),
            Err(LobbyError::Forbidden)
        ));
        assert!(matches!(
            fx.engine.begin_upload(1, 9, init("bomb", "1.0", &bytes)),
            Err(LobbyError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_game_id_from_name() {
        let fx = fixture();
        let bytes = package_zip("bomb-pass", "1.0", 2, 2);
        let mut request = init("x", "1.0", &bytes);
        request.game_id = None;

        let ticket = fx.engine.begin_upload(1, 9, request).unwrap();
        assert_eq!(ticket.game_id, "bomb-pass");
        assert_eq!(slugify("  Hello, World!! "), "hello-world");
        assert_eq!(slugify("***"), "game");
    }

    #[test]
    fn test_download_windows() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        upload(&fx.engine, 9, "bomb", "1.0", &bytes).unwrap();

        let ticket = fx.engine.begin_download(2, "bomb", None).unwrap();
        assert_eq!(ticket.size_bytes, bytes.len() as u64);
        assert_eq!(ticket.hash, sha256_hex(&bytes));

        let mut received = Vec::new();
        let mut done_count = 0;
        let mut offset = 0u64;
        while offset < ticket.size_bytes {
            let window = fx
                .engine
                .download_chunk(2, &ticket.download_id, offset, Some(100))
                .unwrap();
            assert!(window.data.len() <= 100);
            offset += window.data.len() as u64;
            received.extend_from_slice(&window.data);
            if window.done {
                done_count += 1;
                assert_eq!(offset, ticket.size_bytes);
            }
        }
        assert_eq!(done_count, 1);
        assert_eq!(received, bytes);

        // 会话在 done 后关闭
        assert!(matches!(
            fx.engine.download_chunk(2, &ticket.download_id, 0, None),
            Err(LobbyError::Transfer(TransferError::UnknownTransferId(_)))
        ));
    }

    #[test]
    fn test_download_window_clamped_and_bounded() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        upload(&fx.engine, 9, "bomb", "1.0", &bytes).unwrap();
        let ticket = fx.engine.begin_download(2, "bomb", Some("1.0")).unwrap();

        let window = fx
            .engine
            .download_chunk(2, &ticket.download_id, 0, Some(10_000_000))
            .unwrap();
        assert_eq!(window.data.len(), bytes.len().min(MAX_CHUNK_BYTES));

        assert!(matches!(
            fx.engine
                .download_chunk(2, &ticket.download_id, ticket.size_bytes + 1, None),
            Err(LobbyError::BadRequest(_))
        ));
        // 其他连接看不到这个会话
        assert!(matches!(
            fx.engine.download_chunk(3, &ticket.download_id, 0, None),
            Err(LobbyError::Transfer(TransferError::UnknownTransferId(_)))
        ));
    }

    #[test]
    fn test_download_detects_corruption() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        upload(&fx.engine, 9, "bomb", "1.0", &bytes).unwrap();

        let version = fx.store.version("bomb", None).unwrap().unwrap();
        let mut corrupted = bytes.clone();
        corrupted[0] ^= 0xff;
        fs::write(&version.archive_path, corrupted).unwrap();

        assert!(matches!(
            fx.engine.begin_download(2, "bomb", None),
            Err(LobbyError::Transfer(TransferError::HashMismatch))
        ));
        assert!(matches!(
            fx.engine.begin_download(2, "ghost", None),
            Err(LobbyError::NotFound(_))
        ));
    }

    #[test]
    fn test_abort_connection_and_reap() {
        let fx = fixture();
        let bytes = package_zip("bomb", "1.0", 2, 2);
        fx.engine.begin_upload(1, 9, init("bomb", "1.0", &bytes)).unwrap();
        fx.engine.begin_upload(2, 9, init("bomb", "1.1", &bytes)).unwrap();

        assert_eq!(fx.engine.abort_connection(1), 1);
        assert_eq!(fx.engine.active(), 1);

        assert_eq!(fx.engine.reap_idle(Duration::from_secs(3600)), 0);
        assert_eq!(fx.engine.reap_idle(Duration::ZERO), 1);
        assert_eq!(fx.engine.active(), 0);
        assert_eq!(fs::read_dir(fx.dir.path().join("uploads")).unwrap().count(), 0);
    }
}
