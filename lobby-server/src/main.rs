use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lobby_server::{
    serve, spawn_janitor, LobbyConfig, LobbyState, MemoryStore, ProcessLauncher, Store, Surface,
};
use protocol::{Listener, TcpListener};

/// 游戏大厅服务端
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 配置文件路径（JSON），也可用 ARCADE_CONFIG 指定
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// 日志级别
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 启动服务（默认）
    Serve,
    /// 查看生效的配置
    Config {
        /// 打印合并后的配置
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(format!("lobby_server={}", cli.log_level).parse()?))
        .init();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var_os("ARCADE_CONFIG").map(PathBuf::from));
    let config = LobbyConfig::load(config_path.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Config { show } => {
            if show {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                println!("配置有效");
            }
            Ok(())
        }
        Commands::Serve => run(config).await,
    }
}

async fn run(config: LobbyConfig) -> Result<()> {
    info!("游戏大厅服务端启动中...");

    let store: Arc<dyn Store> = match &config.store_snapshot {
        Some(path) => Arc::new(
            MemoryStore::open(path)
                .with_context(|| format!("无法打开记录快照: {}", path.display()))?,
        ),
        None => Arc::new(MemoryStore::new()),
    };

    let lobby = TcpListener::bind(&config.lobby_bind)
        .await
        .with_context(|| format!("无法监听 {}", config.lobby_bind))?;
    let developer = TcpListener::bind(&config.developer_bind)
        .await
        .with_context(|| format!("无法监听 {}", config.developer_bind))?;

    let state = LobbyState::new(config, store, Arc::new(ProcessLauncher))?;
    let janitor = spawn_janitor(state.clone());

    tokio::select! {
        _ = serve(state.clone(), lobby, Surface::Lobby) => {}
        _ = serve(state.clone(), developer, Surface::Developer) => {}
        result = tokio::signal::ctrl_c() => {
            result.context("无法监听退出信号")?;
            info!("收到退出信号");
        }
    }

    janitor.abort();
    state.orchestrator.shutdown();
    // 给监督任务留出停止游戏服务器的时间
    tokio::time::sleep(state.config.stop_timeout()).await;
    info!("服务端已退出");

    Ok(())
}
