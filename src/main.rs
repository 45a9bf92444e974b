use async_trait::async_trait;
use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use ranchat::auth::{AuthBootstrap, FileDeviceKeyStore, HttpDeviceBinder};
use ranchat::call::{CallDependencies, CallOrchestrator};
use ranchat::config::AppConfig;
use ranchat::media::{PermissionGrants, SyntheticDevices, WebRtcMediaSessionFactory};
use ranchat::services::{AdEvent, AdManager, Entitlements, InterstitialPresenter, SubscriptionStatus};
use ranchat::types::events::{Event, EventBus, EventHandler};
use ranchat_tokio_transport::TokioWebSocketTransportFactory;
use ranchat_ureq_http_client::UreqHttpClient;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

// Headless client for the matchmaking service. Captures synthetic media, so
// it is mostly useful for exercising the server and TURN setup.
//
// Usage:
//   cargo run                         # defaults, overridable via RANCHAT_* env vars
//   cargo run -- --premium            # behave like an entitled user
//   cargo run -- --country KR -g female
//
// Commands on stdin: n (next), r (retry), c (toggle camera), m (toggle mic),
// s (stop), g (go), q (quit).

#[derive(Parser, Debug)]
#[command(name = "ranchat", about = "Random video chat client")]
struct Args {
    /// Signaling endpoint, overrides RANCHAT_SIGNALING_URL.
    #[arg(long)]
    signaling_url: Option<String>,

    /// Country filter for matching.
    #[arg(long)]
    country: Option<String>,

    /// Gender filter for matching.
    #[arg(short, long)]
    gender: Option<String>,

    /// Treat this session as entitled.
    #[arg(long)]
    premium: bool,

    /// Deny camera access to exercise the permission error path.
    #[arg(long)]
    no_camera: bool,
}

/// Desktop stand-in for the ad SDK: "shows" by logging and closes at once.
#[derive(Default)]
struct ConsolePresenter {
    events: Mutex<Option<mpsc::UnboundedSender<AdEvent>>>,
}

#[async_trait]
impl InterstitialPresenter for ConsolePresenter {
    async fn initialize(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }

    fn load(&self, events: mpsc::UnboundedSender<AdEvent>) -> Result<(), anyhow::Error> {
        events.send(AdEvent::Loaded)?;
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(events);
        Ok(())
    }

    fn show(&self) -> Result<(), anyhow::Error> {
        info!(target: "Ads", "[interstitial]");
        if let Some(events) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            events.send(AdEvent::Closed)?;
        }
        Ok(())
    }
}

struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle_event(&self, event: &Event) {
        match event {
            Event::PeerInfo(peer) => info!(
                "Talking to someone from {} ({}, {})",
                peer.country, peer.language, peer.gender
            ),
            Event::NoMatchPrompt => info!("Nobody around. Type 'r' to retry or 'q' to quit."),
            Event::FreeLimitReached => info!("Free call time is up, remote video hidden."),
            Event::CallError(e) | Event::ServerError(e) | Event::ProtocolError(e) => {
                warn!("{e}")
            }
            Event::AuthFailed(e) => error!("Could not sign in: {e}"),
            other => match serde_json::to_string(other) {
                Ok(json) => info!("{json}"),
                Err(_) => info!("{other:?}"),
            },
        }
    }
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {e}");
            return;
        }
    };

    rt.block_on(run(args));
}

async fn run(args: Args) {
    let mut config = AppConfig::from_env();
    if let Some(url) = args.signaling_url {
        config.signaling_url = url;
    }
    if let Some(country) = args.country {
        config.filters.country = country;
    }
    if let Some(gender) = args.gender {
        config.filters.gender = gender;
    }
    info!("Signaling at {}", config.signaling_url);

    let http = Arc::new(UreqHttpClient::new());
    let sessions = Arc::new(AuthBootstrap::new(
        Arc::new(FileDeviceKeyStore::new(config.device_key_path.clone())),
        Arc::new(HttpDeviceBinder::new(
            http,
            config.auth_base_urls.clone(),
            config.platform.clone(),
        )),
    ));

    let subscription = Arc::new(SubscriptionStatus::new(config.entitlement_id.clone(), None));
    subscription.init().await;
    if args.premium {
        subscription.set_premium(true);
    }
    let entitlements: Arc<dyn Entitlements> = subscription;

    let ads = Arc::new(AdManager::new(
        Arc::new(ConsolePresenter::default()),
        entitlements.clone(),
        config.ad_config(),
    ));
    ads.init().await;

    let grants = PermissionGrants {
        camera: !args.no_camera,
        microphone: true,
    };
    let media_factory = Arc::new(WebRtcMediaSessionFactory::new(
        config.media_config(),
        Arc::new(SyntheticDevices::new(grants)),
    ));

    let events = EventBus::new();
    events.add_handler(Arc::new(LoggingHandler));

    let deps = CallDependencies {
        transport_factory: Arc::new(TokioWebSocketTransportFactory::new()),
        media_factory,
        sessions,
        entitlements,
        interstitials: ads,
    };
    let (orchestrator, handle) = CallOrchestrator::new(config.call_config(), deps, events);
    let mut actor = tokio::spawn(orchestrator.run());

    if let Err(e) = handle.start() {
        error!("Failed to start: {e}");
        return;
    }

    let mut camera = true;
    let mut microphone = true;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = &mut actor => {
                info!("Bye");
                return;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                let _ = handle.exit();
                break;
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) | Err(_) => {
                        let _ = handle.exit();
                        break;
                    }
                };
                let result = match line.trim() {
                    "n" => handle.find_other(),
                    "r" => handle.retry(),
                    "s" => handle.stop(),
                    "g" => handle.start(),
                    "c" => {
                        camera = !camera;
                        handle.set_camera_enabled(camera)
                    }
                    "m" => {
                        microphone = !microphone;
                        handle.set_microphone_enabled(microphone)
                    }
                    "q" => {
                        let _ = handle.exit();
                        break;
                    }
                    "" => Ok(()),
                    other => {
                        warn!("Unknown command '{other}'");
                        Ok(())
                    }
                };
                if result.is_err() {
                    break;
                }
            }
        }
    }

    if let Err(e) = actor.await {
        error!("Call orchestrator task failed: {e}");
    }
    info!("Bye");
}
