//! RTP relay server binary entry point
//!
//! Starts the WebSocket signaling server and relays the configured source to
//! every connected browser through Kurento Media Server.
//!
//! # Usage
//!
//! ```bash
//! # Relay an RTSP camera through a local KMS
//! cargo run -p rtp-relay-server -- \
//!   --listen 0.0.0.0:8080 \
//!   --kms-url ws://localhost:8888/kurento \
//!   --player-uri rtsp://camera.local/stream
//!
//! # Receive RTP from an external sender, no recording
//! cargo run -p rtp-relay-server -- \
//!   --source rtp --sender-ip 192.168.1.20 --no-recording
//!
//! # Exercise the signaling path without a media server
//! cargo run -p rtp-relay-server -- --engine loopback
//!
//! # Start from a YAML config, flags override it
//! cargo run -p rtp-relay-server -- --config relay.yaml --max-sessions 20
//! ```

use clap::Parser;
use rtp_relay::config::{CryptoSuite, MediaProfile, RtpSenderProfile, SourceConfig};
use rtp_relay::{KurentoClient, LoopbackEngine, MediaEngine, RelayConfig, SignalingServer, SrtpConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Loopback engine call journal and released-pipeline records kept
const LOOPBACK_HISTORY: usize = 1024;

/// RTP Relay Server
///
/// Relays a media source (player URI or RTP sender) to WebRTC peers, one
/// Kurento pipeline per signaling connection.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML or JSON configuration file; flags below override its values
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Signaling WebSocket listen address [default: 0.0.0.0:8080]
    #[arg(short, long, env = "RELAY_LISTEN")]
    listen: Option<String>,

    /// Kurento Media Server URL [default: ws://localhost:8888/kurento]
    #[arg(long, env = "KMS_URL")]
    kms_url: Option<String>,

    /// Media engine backend
    #[arg(long, default_value = "kurento", env = "RELAY_ENGINE")]
    engine: EngineKind,

    /// Source kind
    #[arg(long, env = "RELAY_SOURCE")]
    source: Option<SourceKind>,

    /// URI played by the player source (file://, http://, rtsp://)
    #[arg(long, env = "RELAY_PLAYER_URI")]
    player_uri: Option<String>,

    /// IP address of the external RTP sender (RTP source only)
    #[arg(long, env = "RELAY_SENDER_IP")]
    sender_ip: Option<String>,

    /// Let the media server discover the sender address (COMEDIA)
    #[arg(long)]
    comedia: bool,

    /// Disable per-session recording
    #[arg(long)]
    no_recording: bool,

    /// URI prefix recordings are written under [default: file:///tmp/]
    #[arg(long, env = "RELAY_RECORDING_URI")]
    recording_uri: Option<String>,

    /// Recording container profile
    #[arg(long, env = "RELAY_RECORDING_PROFILE")]
    profile: Option<Profile>,

    /// Maximum concurrent sessions (0 = unlimited)
    #[arg(long, env = "RELAY_MAX_SESSIONS")]
    max_sessions: Option<usize>,

    /// Media server request timeout in milliseconds
    #[arg(long, env = "RELAY_REQUEST_TIMEOUT_MS")]
    request_timeout_ms: Option<u64>,

    /// SRTP cipher suite for secure RTP sources
    #[arg(long, default_value = "aes128-80")]
    srtp_suite: Suite,

    /// SRTP master key used by the media server (plain ASCII)
    #[arg(long, env = "RELAY_SRTP_ENGINE_KEY", requires = "srtp_sender_key")]
    srtp_engine_key: Option<String>,

    /// SRTP master key used by the RTP sender (plain ASCII)
    #[arg(long, env = "RELAY_SRTP_SENDER_KEY", requires = "srtp_engine_key")]
    srtp_sender_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EngineKind {
    /// Kurento Media Server over JSON-RPC
    Kurento,
    /// In-process engine without real media
    Loopback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum SourceKind {
    /// Player endpoint fed from a URI
    Player,
    /// RTP endpoint fed by an external sender
    Rtp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Profile {
    Mp4,
    Webm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum Suite {
    #[value(name = "aes128-80")]
    Aes128_80,
    #[value(name = "aes128-32")]
    Aes128_32,
    #[value(name = "aes256-80")]
    Aes256_80,
    #[value(name = "aes256-32")]
    Aes256_32,
}

impl From<Suite> for CryptoSuite {
    fn from(suite: Suite) -> Self {
        match suite {
            Suite::Aes128_80 => CryptoSuite::Aes128CmHmacSha1_80,
            Suite::Aes128_32 => CryptoSuite::Aes128CmHmacSha1_32,
            Suite::Aes256_80 => CryptoSuite::Aes256CmHmacSha1_80,
            Suite::Aes256_32 => CryptoSuite::Aes256CmHmacSha1_32,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Set up Ctrl+C handler at the very start
    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_handler = Arc::clone(&shutdown_flag);

    ctrlc::set_handler(move || {
        eprintln!("\nCtrl+C received, shutting down...");

        let was_already_set = shutdown_flag_handler.swap(true, Ordering::SeqCst);
        if was_already_set {
            eprintln!("Shutdown already in progress, forcing exit");
            std::process::exit(0);
        }

        // Pipelines get a few seconds to be released
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_secs(5));
            eprintln!("Graceful shutdown timeout (5s), forcing exit");
            std::process::exit(0);
        });
    })?;

    // Create multi-threaded tokio runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("relay-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args, shutdown_flag))
}

async fn async_main(
    args: Args,
    shutdown_flag: Arc<AtomicBool>,
) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!(
        version = rtp_relay::version(),
        engine = ?args.engine,
        "RTP relay server starting"
    );

    let config = build_config(&args)?;
    config.validate()?;

    info!(
        listen_addr = %config.listen_addr,
        kms_url = %config.kms_url,
        source = ?config.source,
        recording = config.recording.enabled,
        srtp = config.srtp.is_some(),
        max_sessions = config.max_sessions,
        "Configuration loaded"
    );

    let engine: Arc<dyn MediaEngine> = match args.engine {
        EngineKind::Kurento => {
            let client = KurentoClient::connect(&config.kms_url, config.request_timeout()).await?;
            info!("Connected to media server at {}", client.url());
            Arc::new(client)
        }
        EngineKind::Loopback => {
            warn!("Using the loopback engine: no media will flow");
            Arc::new(LoopbackEngine::new().with_history_limit(LOOPBACK_HISTORY))
        }
    };

    let server = SignalingServer::bind(config, engine).await?;
    let handle = server.start()?;
    info!("Server running on ws://{}. Press Ctrl+C to shutdown.", handle.local_addr());

    while !shutdown_flag.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }

    let registry = Arc::clone(handle.registry());
    info!(
        sessions = registry.len(),
        "Shutdown signal received, releasing sessions..."
    );
    handle.shutdown().await;

    // Connection tasks release their pipelines on the way out
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(3);
    while !registry.is_empty() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
    }
    if !registry.is_empty() {
        warn!(
            sessions = ?registry.ids(),
            "Sessions still registered at shutdown deadline"
        );
    }

    info!("RTP relay server shut down gracefully");
    Ok(())
}

/// Build the relay configuration from the config file (if any) and flags
fn build_config(args: &Args) -> Result<RelayConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            RelayConfig::from_file(path)?
        }
        None => RelayConfig::default(),
    };

    if let Some(listen) = &args.listen {
        config.listen_addr = listen.clone();
    }
    if let Some(url) = &args.kms_url {
        config.kms_url = url.clone();
    }

    let source_kind = args.source.or(match (&args.player_uri, &args.sender_ip) {
        (Some(_), _) => Some(SourceKind::Player),
        (None, Some(_)) => Some(SourceKind::Rtp),
        (None, None) => None,
    });
    match source_kind {
        Some(SourceKind::Player) => {
            let uri = match (&args.player_uri, &config.source) {
                (Some(uri), _) => uri.clone(),
                (None, SourceConfig::Player { uri }) => uri.clone(),
                (None, SourceConfig::Rtp(_)) => {
                    return Err("--source player requires --player-uri".into())
                }
            };
            config.source = SourceConfig::Player { uri };
        }
        Some(SourceKind::Rtp) => {
            let mut profile = match &config.source {
                SourceConfig::Rtp(profile) => profile.clone(),
                SourceConfig::Player { .. } => RtpSenderProfile::default(),
            };
            if let Some(ip) = &args.sender_ip {
                profile.sender_ip = ip.clone();
            }
            profile.use_comedia |= args.comedia;
            config.source = SourceConfig::Rtp(profile);
        }
        None => {}
    }

    if args.no_recording {
        config.recording.enabled = false;
    }
    if let Some(uri) = &args.recording_uri {
        config.recording.base_uri = uri.clone();
    }
    if let Some(profile) = args.profile {
        config.recording.media_profile = match profile {
            Profile::Mp4 => MediaProfile::Mp4,
            Profile::Webm => MediaProfile::Webm,
        };
    }

    if let Some(max) = args.max_sessions {
        config.max_sessions = max;
    }
    if let Some(timeout) = args.request_timeout_ms {
        config.request_timeout_ms = timeout;
    }

    if let (Some(engine_key), Some(sender_key)) = (&args.srtp_engine_key, &args.srtp_sender_key) {
        config.srtp = Some(SrtpConfig {
            crypto_suite: args.srtp_suite.into(),
            engine_key: engine_key.clone(),
            sender_key: sender_key.clone(),
        });
    }

    Ok(config)
}

fn init_tracing() {
    // Initialize tracing with EnvFilter for RUST_LOG support
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
