//! 端到端流程：上传游戏 → 建房 → 开始 → 回传结果

use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::process::{Child, Command};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use lobby_server::error::OrchestrationError;
use lobby_server::ids::to_hex;
use lobby_server::{serve, GameLauncher, LaunchPlan, LobbyConfig, LobbyState, MemoryStore, Surface};
use protocol::{
    AccountId, ClientRequest, Connection, Connector, Credentials, ErrorCode, Event, MatchPage,
    MatchReport, Response, RoomCreate, RoomRef, RoomTarget, ServerFrame, TcpConnection,
    TcpConnector, TcpListener, UploadChunk, UploadFinish, UploadInit,
};

const WAIT: Duration = Duration::from_secs(10);

/// 进程用 sleep 代替，端口由测试自己监听
struct FakeLauncher;

#[async_trait]
impl GameLauncher for FakeLauncher {
    async fn launch(&self, plan: &LaunchPlan) -> Result<Child, OrchestrationError> {
        let failed = |e: std::io::Error| OrchestrationError::SpawnFailed(e.to_string());

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", plan.port))
            .await
            .map_err(failed)?;
        tokio::spawn(async move {
            while let Ok((_stream, _)) = listener.accept().await {}
        });

        Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .map_err(failed)
    }
}

struct Client {
    conn: TcpConnection,
    events: Vec<Event>,
}

impl Client {
    async fn connect(addr: &str) -> Self {
        let conn = TcpConnector.connect(addr).await.unwrap();
        let mut client = Self {
            conn,
            events: Vec::new(),
        };
        let hello = client.next_response().await;
        assert!(hello.ok);
        client
    }

    async fn next_frame(&mut self) -> ServerFrame {
        tokio::time::timeout(WAIT, self.conn.recv::<ServerFrame>())
            .await
            .expect("timed out waiting for frame")
            .unwrap()
    }

    async fn next_response(&mut self) -> Response {
        loop {
            match self.next_frame().await {
                ServerFrame::Response(response) => return response,
                ServerFrame::Event(event) => self.events.push(event),
            }
        }
    }

    async fn request(&mut self, request: ClientRequest) -> Response {
        self.conn.send(&request).await.unwrap();
        self.next_response().await
    }

    async fn next_event(&mut self) -> Event {
        if !self.events.is_empty() {
            return self.events.remove(0);
        }
        match self.next_frame().await {
            ServerFrame::Event(event) => event,
            other => panic!("Unexpected frame: {:?}", other),
        }
    }

    /// 跳过其他推送，直到满足条件的事件
    async fn wait_for<F: Fn(&Event) -> bool>(&mut self, matches: F) -> Event {
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
        }
    }
}

fn credentials(username: &str) -> Credentials {
    Credentials {
        username: username.to_string(),
        password: "secret".to_string(),
    }
}

fn package(game_id: &str, version: &str, max_players: u32) -> Vec<u8> {
    let manifest = json!({
        "gameId": game_id,
        "name": "Bomb Pass",
        "version": version,
        "developer": "studio",
        "description": "pass the bomb",
        "clientType": "cli",
        "minPlayers": 2,
        "maxPlayers": max_players,
        "entrypoints": {
            "server": {"module": "server_main.py", "argv": ["--port", "{port}", "--token", "{token}"]},
            "client": {"module": "client_main.py"}
        }
    })
    .to_string();

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    let entries: [(&str, &[u8]); 3] = [
        ("manifest.json", manifest.as_bytes()),
        ("server_main.py", b"print('server')"),
        ("client_main.py", b"print('client')"),
    ];
    for (name, content) in entries {
        writer.start_file(name, options).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

async fn start_lobby() -> (tempfile::TempDir, Arc<LobbyState>, String, String) {
    let dir = tempfile::tempdir().unwrap();

    let free = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let base = free.local_addr().unwrap().port();
    drop(free);

    let config = LobbyConfig {
        storage_root: dir.path().to_path_buf(),
        game_port_min: base,
        game_port_max: base.saturating_add(20),
        spawn_timeout_secs: 5,
        ..LobbyConfig::default()
    };
    let state =
        LobbyState::new(config, Arc::new(MemoryStore::new()), Arc::new(FakeLauncher)).unwrap();

    let lobby = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let developer = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let lobby_addr = lobby.local_addr().unwrap().to_string();
    let developer_addr = developer.local_addr().unwrap().to_string();

    tokio::spawn(serve(state.clone(), TcpListener::from_std(lobby), Surface::Lobby));
    tokio::spawn(serve(state.clone(), TcpListener::from_std(developer), Surface::Developer));

    (dir, state, lobby_addr, developer_addr)
}

async fn publish(addr: &str, game_id: &str, version: &str, max_players: u32) {
    let mut dev = Client::connect(addr).await;
    assert!(dev.request(ClientRequest::DevRegister(credentials("studio"))).await.ok);
    assert!(dev.request(ClientRequest::DevLogin(credentials("studio"))).await.ok);

    let bytes = package(game_id, version, max_players);
    let init = UploadInit {
        game_id: Some(game_id.to_string()),
        name: Some("Bomb Pass".to_string()),
        description: Some("pass the bomb".to_string()),
        version: version.to_string(),
        file_name: Some("bomb.zip".to_string()),
        size_bytes: bytes.len() as u64,
        hash: to_hex(&Sha256::digest(&bytes)),
    };
    let response = dev.request(ClientRequest::GameUploadInit(init)).await;
    assert!(response.ok, "{:?}", response);
    let upload_id = response.field("uploadId").and_then(Value::as_str).unwrap().to_string();

    for (seq, chunk) in bytes.chunks(256).enumerate() {
        let response = dev
            .request(ClientRequest::GameUploadChunk(UploadChunk {
                upload_id: upload_id.clone(),
                seq: seq as u64,
                data: chunk.to_vec(),
            }))
            .await;
        assert!(response.ok, "{:?}", response);
    }

    let response = dev
        .request(ClientRequest::GameUploadFinish(UploadFinish {
            upload_id,
            changelog: Some("first release".to_string()),
        }))
        .await;
    assert!(response.ok, "{:?}", response);
    assert_eq!(response.field("version").and_then(Value::as_str), Some(version));
}

async fn player(addr: &str, username: &str) -> (Client, AccountId) {
    let mut client = Client::connect(addr).await;
    assert!(client.request(ClientRequest::PlayerRegister(credentials(username))).await.ok);
    let response = client.request(ClientRequest::PlayerLogin(credentials(username))).await;
    assert!(response.ok, "{:?}", response);
    let id = response.field("accountId").and_then(Value::as_u64).unwrap();
    (client, id)
}

fn room_state(response: &Response) -> Option<&str> {
    response.field("state").and_then(Value::as_str)
}

#[tokio::test]
async fn test_full_match_flow() {
    let (_dir, _state, lobby_addr, developer_addr) = start_lobby().await;
    publish(&developer_addr, "bomb", "1.0", 2).await;

    let (mut alice, alice_id) = player(&lobby_addr, "alice").await;
    let (mut bob, bob_id) = player(&lobby_addr, "bob").await;
    let (mut carol, _) = player(&lobby_addr, "carol").await;

    // 建房并加入
    let response = alice
        .request(ClientRequest::RoomCreate(RoomCreate {
            game_id: "bomb".to_string(),
            version: Some("1.0".to_string()),
        }))
        .await;
    assert!(response.ok, "{:?}", response);
    let room_id = response.field("roomId").and_then(Value::as_u64).unwrap();

    assert!(bob.request(ClientRequest::RoomJoin(RoomRef { room_id })).await.ok);
    let response = carol.request(ClientRequest::RoomJoin(RoomRef { room_id })).await;
    assert_eq!(response.error, Some(ErrorCode::RoomFull));

    // 非房主不能开始
    let response = bob.request(ClientRequest::RoomStart(RoomTarget::default())).await;
    assert_eq!(response.error, Some(ErrorCode::NotHost));

    let response = alice
        .request(ClientRequest::RoomStart(RoomTarget { room_id: Some(room_id) }))
        .await;
    assert!(response.ok, "{:?}", response);

    // 两人收到同一个令牌
    let alice_info = match alice.wait_for(|e| matches!(e, Event::GameInfo(_))).await {
        Event::GameInfo(info) => info,
        _ => unreachable!(),
    };
    let bob_info = match bob.wait_for(|e| matches!(e, Event::GameInfo(_))).await {
        Event::GameInfo(info) => info,
        _ => unreachable!(),
    };
    assert_eq!(alice_info.token, bob_info.token);
    assert_eq!(alice_info.port, bob_info.port);
    assert_eq!(alice_info.room_id, room_id);
    assert_eq!(alice_info.token.len(), 32);

    let detail = alice.request(ClientRequest::RoomDetail(RoomRef { room_id })).await;
    assert_eq!(room_state(&detail), Some("playing"));

    // 游戏服务器回传结果
    let mut game_server = Client::connect(&lobby_addr).await;
    let report = |token: &str| MatchReport {
        room_id,
        token: token.to_string(),
        game_id: Some("bomb".to_string()),
        version: Some("1.0".to_string()),
        started_at: None,
        ended_at: None,
        winner: Some(alice_id),
        reason: Some("finished".to_string()),
        results: json!({"scores": [3, 1]}),
    };

    let response = game_server.request(ClientRequest::PostResult(report("forged"))).await;
    assert_eq!(response.error, Some(ErrorCode::BadToken));

    let response = game_server
        .request(ClientRequest::PostResult(report(&alice_info.token)))
        .await;
    assert!(response.ok, "{:?}", response);
    assert_eq!(response.field("accepted"), Some(&Value::Bool(true)));

    for client in [&mut alice, &mut bob] {
        match client.wait_for(|e| matches!(e, Event::MatchEnded(_))).await {
            Event::MatchEnded(ended) => {
                assert_eq!(ended.result.winner, Some(alice_id));
                assert_eq!(ended.result.players, vec![alice_id, bob_id]);
            }
            _ => unreachable!(),
        }
    }

    let detail = alice.request(ClientRequest::RoomDetail(RoomRef { room_id })).await;
    assert_eq!(room_state(&detail), Some("open"));

    let history = bob.request(ClientRequest::MatchListMine(MatchPage::default())).await;
    let matches = history.field("matches").and_then(Value::as_array).unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["winner"], json!(alice_id));

    // 重复的结果不再被接受
    let response = game_server
        .request(ClientRequest::PostResult(report(&alice_info.token)))
        .await;
    assert!(response.ok);
    assert_eq!(response.field("accepted"), Some(&Value::Bool(false)));
}

#[tokio::test]
async fn test_second_login_rejected() {
    let (_dir, _state, lobby_addr, _developer_addr) = start_lobby().await;
    let (mut alice, _) = player(&lobby_addr, "alice").await;

    let mut second = Client::connect(&lobby_addr).await;
    let response = second.request(ClientRequest::PlayerLogin(credentials("alice"))).await;
    assert_eq!(response.error, Some(ErrorCode::AlreadyOnline));

    assert!(alice.request(ClientRequest::PlayerLogout).await.ok);
    let response = alice.request(ClientRequest::RoomList).await;
    assert_eq!(response.error, Some(ErrorCode::Unauthenticated));

    // 注销后可以在别的连接登录
    let response = second.request(ClientRequest::PlayerLogin(credentials("alice"))).await;
    assert!(response.ok, "{:?}", response);
}

#[tokio::test]
async fn test_download_after_publish() {
    let (_dir, _state, lobby_addr, developer_addr) = start_lobby().await;
    publish(&developer_addr, "bomb", "1.0", 4).await;
    let (mut alice, _) = player(&lobby_addr, "alice").await;

    let response = alice
        .request(ClientRequest::StoreDownloadInit(protocol::DownloadInit {
            game_id: "bomb".to_string(),
            version: None,
        }))
        .await;
    assert!(response.ok, "{:?}", response);
    let download_id = response.field("downloadId").and_then(Value::as_str).unwrap().to_string();
    let size = response.field("sizeBytes").and_then(Value::as_u64).unwrap();
    let hash = response.field("hash").and_then(Value::as_str).unwrap().to_string();

    let mut received = Vec::new();
    loop {
        let response = alice
            .request(ClientRequest::StoreDownloadChunk(protocol::DownloadChunk {
                download_id: download_id.clone(),
                offset: received.len() as u64,
                limit: Some(300),
            }))
            .await;
        assert!(response.ok, "{:?}", response);
        let window: DownloadWindowView = response.decode().unwrap();
        assert_eq!(window.offset, received.len() as u64);
        received.extend_from_slice(&window.data);
        if window.done {
            break;
        }
    }

    assert_eq!(received.len() as u64, size);
    assert_eq!(to_hex(&Sha256::digest(&received)), hash);

    // 会话已关闭
    let response = alice
        .request(ClientRequest::StoreDownloadChunk(protocol::DownloadChunk {
            download_id,
            offset: 0,
            limit: None,
        }))
        .await;
    assert_eq!(response.error, Some(ErrorCode::UnknownTransferId));
}

#[derive(serde::Deserialize)]
struct DownloadWindowView {
    offset: u64,
    #[serde(with = "protocol::codec::base64_bytes")]
    data: Vec<u8>,
    done: bool,
}
