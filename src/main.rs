//! rtmpctl - control client for a video-to-RTMP streaming backend.
//!
//! Commands map onto the backend's HTTP API (start/stop streams, list
//! sources) plus one WebSocket telemetry channel per attached session.
//! `watch` restores the persisted attachment set and renders live status,
//! latency and stats per session until interrupted; attachments survive
//! across runs without re-issuing start commands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rtmpctl::{
    api::{ApiClient, SourceType, StartStreamRequest, StreamMode},
    attachments::AttachmentManager,
    config::Config,
    protocol::SessionId,
    registry::SessionRegistry,
    store::FileStore,
};

/// rtmpctl - control client for a video-to-RTMP streaming backend.
///
/// Upload videos, start/stop streaming sessions, and attach to any number
/// of in-flight sessions to watch their live telemetry in the terminal.
#[derive(Parser, Debug)]
#[command(name = "rtmpctl", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Backend base URL (overrides the config file)
    #[arg(long, env = "RTMPCTL_SERVER", global = true)]
    server: Option<String>,

    /// Bearer token (overrides the config file)
    #[arg(long, env = "RTMPCTL_TOKEN", global = true)]
    token: Option<String>,

    /// Path to the config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Log in and save the bearer token to the config file
    Login {
        username: String,

        /// Password (prompted on stdin if omitted)
        #[arg(long)]
        password: Option<String>,
    },

    /// List uploaded videos
    Videos,

    /// Upload an mp4 video
    Upload {
        /// Path to the .mp4 file
        file: PathBuf,
    },

    /// List playlists
    Playlists,

    /// List sessions the backend reports as running
    Active,

    /// Start a streaming session, attach to it, and watch its telemetry
    Start {
        /// Source kind: "video" or "playlist"
        #[arg(long, default_value = "video")]
        source_type: SourceType,

        /// Id of the video or playlist to stream
        #[arg(long)]
        source_id: u64,

        /// Destination RTMP URL
        #[arg(long)]
        destination: String,

        /// Playback mode: "once", "loop_video" or "loop_playlist"
        #[arg(long, default_value = "once")]
        mode: StreamMode,

        /// Exit after starting instead of watching
        #[arg(long)]
        no_watch: bool,
    },

    /// Stop a streaming session on the backend and stop watching it
    Stop {
        /// Session id to stop
        id: SessionId,
    },

    /// Attach to a session's telemetry and watch it
    Attach {
        /// Session id to attach to
        id: SessionId,

        /// Record the attachment and exit instead of watching
        #[arg(long)]
        no_watch: bool,
    },

    /// Detach from a session's telemetry (the stream keeps running)
    Detach {
        /// Session id to detach from
        id: SessionId,
    },

    /// Watch all attached sessions (restores the persisted attachment set)
    Watch,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?
        .unwrap_or_default();
    if let Some(server) = cli.server {
        config.server = server;
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }

    match cli.command {
        Commands::Login { username, password } => {
            run_login(config, &config_path, username, password).await
        }
        Commands::Videos => run_videos(config).await,
        Commands::Upload { file } => run_upload(config, file).await,
        Commands::Playlists => run_playlists(config).await,
        Commands::Active => run_active(config).await,
        Commands::Start {
            source_type,
            source_id,
            destination,
            mode,
            no_watch,
        } => {
            let req = StartStreamRequest {
                source_type,
                source_id,
                destination,
                mode,
            };
            run_start(config, req, no_watch).await
        }
        Commands::Stop { id } => run_stop(config, id).await,
        Commands::Attach { id, no_watch } => run_attach(config, id, no_watch).await,
        Commands::Detach { id } => run_detach(config, id).await,
        Commands::Watch => run_watch(config).await,
    }
}

fn init_tracing() {
    // Command output goes to stdout; diagnostics stay on stderr.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "rtmpctl=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Build the attachment manager over the on-disk attachment store.
fn build_manager(config: &Config) -> anyhow::Result<AttachmentManager> {
    let api = ApiClient::new(&config.server, config.token.clone())?;
    let store = FileStore::new(FileStore::default_path());
    Ok(AttachmentManager::new(
        api,
        SessionRegistry::new(),
        Box::new(store),
    ))
}

fn prompt_password() -> anyhow::Result<String> {
    use std::io::{BufRead, Write};
    eprint!("password: ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read password from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn run_login(
    config: Config,
    config_path: &Path,
    username: String,
    password: Option<String>,
) -> anyhow::Result<()> {
    let password = match password {
        Some(p) => p,
        None => prompt_password()?,
    };
    let api = ApiClient::new(&config.server, None)?;
    let token = api.login(&username, &password).await?;
    let updated = Config {
        token: Some(token),
        ..config
    };
    updated.save(config_path)?;
    println!(
        "logged in as {}; token saved to {}",
        username,
        config_path.display()
    );
    Ok(())
}

async fn run_videos(config: Config) -> anyhow::Result<()> {
    let api = ApiClient::new(&config.server, config.token.clone())?;
    let videos = api.list_videos().await?;
    if videos.is_empty() {
        println!("no videos uploaded");
        return Ok(());
    }
    for v in videos {
        println!("{:>6}  {}", v.id, v.filename);
    }
    Ok(())
}

async fn run_upload(config: Config, file: PathBuf) -> anyhow::Result<()> {
    let api = ApiClient::new(&config.server, config.token.clone())?;
    let video = api.upload_video(&file).await?;
    println!("uploaded {} as video {}", video.filename, video.id);
    Ok(())
}

async fn run_playlists(config: Config) -> anyhow::Result<()> {
    let api = ApiClient::new(&config.server, config.token.clone())?;
    let playlists = api.list_playlists().await?;
    if playlists.is_empty() {
        println!("no playlists");
        return Ok(());
    }
    for p in playlists {
        println!("{:>6}  {} ({} items)", p.id, p.name, p.items.len());
    }
    Ok(())
}

async fn run_active(config: Config) -> anyhow::Result<()> {
    let api = ApiClient::new(&config.server, config.token.clone())?;
    let sessions = api.active_streams().await?;
    if sessions.is_empty() {
        println!("no active streams");
        return Ok(());
    }
    for s in sessions {
        println!(
            "{:>6}  {:<10} pid={:<8} started={}",
            s.id,
            s.status.as_deref().unwrap_or("-"),
            s.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            s.start_time.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

async fn run_start(
    config: Config,
    req: StartStreamRequest,
    no_watch: bool,
) -> anyhow::Result<()> {
    let manager = build_manager(&config)?;
    manager.restore_on_load();
    let id = manager.start_streaming(req).await?;
    println!("stream {} started", id);
    if no_watch {
        manager.shutdown_all();
        return Ok(());
    }
    watch_loop(&manager).await
}

async fn run_stop(config: Config, id: SessionId) -> anyhow::Result<()> {
    let manager = build_manager(&config)?;
    manager.restore_on_load();
    match manager.stop_and_detach(id).await {
        Ok(()) => println!("stream {} stopped and detached", id),
        Err(e) => eprintln!(
            "warning: backend stop for stream {} failed ({}); stopped watching it locally",
            id, e
        ),
    }
    manager.shutdown_all();
    Ok(())
}

async fn run_attach(config: Config, id: SessionId, no_watch: bool) -> anyhow::Result<()> {
    let manager = build_manager(&config)?;
    manager.restore_on_load();
    if manager.attach(id) {
        println!("attached to session {}", id);
    } else {
        println!("already attached to session {}", id);
    }
    if no_watch {
        manager.shutdown_all();
        return Ok(());
    }
    watch_loop(&manager).await
}

async fn run_detach(config: Config, id: SessionId) -> anyhow::Result<()> {
    let manager = build_manager(&config)?;
    manager.restore_on_load();
    if manager.detach(id) {
        println!("detached from session {}", id);
    } else {
        println!("not attached to session {}", id);
    }
    manager.shutdown_all();
    Ok(())
}

async fn run_watch(config: Config) -> anyhow::Result<()> {
    let manager = build_manager(&config)?;
    let restored = manager.restore_on_load();
    if restored == 0 {
        println!("no persisted attachments; use `rtmpctl attach <id>` or `rtmpctl start`");
        return Ok(());
    }
    if let Err(e) = manager.registry().refresh(manager.api()).await {
        tracing::debug!(error = %e, "active-session refresh failed");
    }
    watch_loop(&manager).await
}

/// Render the attachment mapping until Ctrl+C: once per change
/// notification (coalescing bursts) and on a slow keepalive tick so fully
/// disconnected sessions stay visible.
async fn watch_loop(manager: &AttachmentManager) -> anyhow::Result<()> {
    let mut updates = manager.subscribe();
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    eprintln!(
        "watching {} session(s) — Ctrl+C to exit",
        manager.attached_ids().len()
    );
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => render(manager),
            result = updates.recv() => {
                match result {
                    Ok(_) => {
                        while updates.try_recv().is_ok() {}
                        render(manager);
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
    manager.shutdown_all();
    Ok(())
}

fn render(manager: &AttachmentManager) {
    let snapshot = manager.snapshot();
    if snapshot.is_empty() {
        println!("(no attached sessions)");
        return;
    }
    for (id, record) in snapshot {
        let latency = record
            .latency_ms
            .map(|ms| format!("{}ms", ms))
            .unwrap_or_else(|| "-".into());
        let field = |key: &str| {
            record
                .stats
                .get(key)
                .map(display_value)
                .unwrap_or_else(|| "-".into())
        };
        println!(
            "session {:>5}  {:<12} {:>7}  bitrate={} fps={} dropped={} status={} dest={}",
            id,
            record.status.to_string(),
            latency,
            field("bitrate"),
            field("fps"),
            field("dropped_frames"),
            field("status"),
            field("rtmp_url"),
        );
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
