use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use wlan_authsec::config::{Config, SimulationConfig};
use wlan_authsec::keys::{KeyMaterial, SetKeysReq};
use wlan_authsec::mac::MacAddr;
use wlan_authsec::mlm::device::{ChannelControlPlane, SimulatedDevice};
use wlan_authsec::mlm::{
    AuthFrame, KeyScope, MlmEvent, Mlme, MlmeIo, OutFrame, STATUS_SUCCESS,
};
use wlan_authsec::session::AuthType;
use wlan_authsec::wep::{self, TsfIvSource, WepKey};

#[derive(Parser)]
#[command(name = "wlan-authsec")]
#[command(about = "WLAN pre-authentication, WEP auth-body crypto and key install")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the management loop against a simulated device
    Run,
    /// WEP-encrypt an authentication frame body
    Encrypt {
        /// WEP-40 or WEP-104 key (hex)
        #[arg(long)]
        key: String,
        #[arg(long, default_value_t = 0)]
        key_id: u8,
        /// Plaintext body (hex)
        #[arg(long)]
        body: String,
    },
    /// Decrypt an authentication frame body and check its ICV
    Decrypt {
        /// WEP-40 or WEP-104 key (hex)
        #[arg(long)]
        key: String,
        /// IV | KeyId | ciphertext (hex)
        #[arg(long)]
        frame: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(&cli.config).unwrap_or_else(|e| {
        eprintln!("Warning: Failed to load config from {:?}: {}", cli.config, e);
        eprintln!("Using default configuration");
        Config::default()
    });

    // Initialize tracing/logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    match cli.command {
        Command::Run => run(config).await,
        Command::Encrypt { key, key_id, body } => {
            let key = WepKey::from_hex(&key)?;
            let body = hex::decode(&body).context("body is not valid hex")?;
            let frame = wep::encrypt_auth_body(&key, key_id, &body, &mut TsfIvSource::new())?;
            println!("{}", hex::encode(frame));
            Ok(())
        }
        Command::Decrypt { key, frame } => {
            let key = WepKey::from_hex(&key)?;
            let frame = hex::decode(&frame).context("frame is not valid hex")?;
            if let Some(key_id) = wep::key_id_of(&frame) {
                info!("Frame uses key id {}", key_id);
            }
            let body = wep::decrypt_auth_body(&key, &frame)?;
            println!("{}", hex::encode(body));
            Ok(())
        }
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    info!("wlan-authsec v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "{:?} on {} (auth {:?}, privacy {})",
        config.mlm.role, config.mlm.bssid, config.mlm.auth_type, config.mlm.privacy
    );

    let sim = config.simulation.clone().unwrap_or_else(|| {
        info!("No [simulation] section, using an idle device with no demo peers");
        SimulationConfig {
            device_latency_ms: 10,
            device_queue_depth: 8,
            peers: Vec::new(),
            wep_key: String::new(),
        }
    });

    let wep_key = if sim.wep_key.is_empty() {
        None
    } else {
        Some(WepKey::from_hex(&sim.wep_key).context("invalid [simulation] wep_key")?)
    };

    let (hal, hal_rx) = ChannelControlPlane::new(sim.device_queue_depth);
    let session_id = config.mlm.session_id;
    let (mlme, io) = Mlme::new(config, wep_key.clone(), hal);
    let MlmeIo {
        events,
        mut confirms,
        mut frames,
    } = io;

    SimulatedDevice::new(Duration::from_millis(sim.device_latency_ms))
        .spawn(hal_rx, events.clone());
    let mlme_task = tokio::spawn(mlme.run());

    // SME side: log every confirmation
    tokio::spawn(async move {
        while let Some(cnf) = confirms.recv().await {
            match serde_json::to_string(&cnf) {
                Ok(json) => info!("SME <- {}", json),
                Err(e) => warn!("Could not encode confirmation: {}", e),
            }
        }
    });

    // Air side: stand in for each demo peer's half of the exchange
    let air_events = events.clone();
    let peer_key = wep_key.clone();
    tokio::spawn(async move {
        let mut ivs = TsfIvSource::new();
        while let Some(out) = frames.recv().await {
            let (peer, frame) = match out {
                OutFrame::Auth { peer, frame } => (peer, frame),
                OutFrame::Deauth { peer, reason } => {
                    info!("Air <- deauth to {} ({:?})", peer, reason);
                    continue;
                }
            };
            info!(
                "Air <- auth frame {} to {} (status {})",
                frame.seq, peer, frame.status
            );
            if frame.seq != 2 || frame.status != STATUS_SUCCESS || frame.algo != AuthType::Shared {
                continue;
            }
            let Some(key) = &peer_key else { continue };
            match wep::encrypt_auth_body(key, 0, &frame.body, &mut ivs) {
                Ok(body) => {
                    let reply = AuthFrame::new(AuthType::Shared, 3, STATUS_SUCCESS, body);
                    let ev = MlmEvent::AuthFrame { peer, frame: reply };
                    if air_events.send(ev).await.is_err() {
                        break;
                    }
                }
                Err(e) => error!("Demo peer {} could not answer challenge: {}", peer, e),
            }
        }
    });

    script_demo(&events, &sim.peers, session_id, wep_key.as_ref()).await?;

    info!("Management loop running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    events.send(MlmEvent::Teardown).await.ok();
    mlme_task.await.context("management loop panicked")?;

    Ok(())
}

/// Authenticate, associate and key every demo peer
async fn script_demo(
    events: &mpsc::Sender<MlmEvent>,
    peers: &[MacAddr],
    session_id: u8,
    key: Option<&WepKey>,
) -> anyhow::Result<()> {
    let algo = if key.is_some() {
        AuthType::Shared
    } else {
        AuthType::Open
    };

    for (n, peer) in peers.iter().enumerate() {
        let aid = n as u16 + 1;
        info!("Demo peer {} authenticating ({:?})", peer, algo);
        events
            .send(MlmEvent::AuthFrame {
                peer: *peer,
                frame: AuthFrame::new(algo, 1, STATUS_SUCCESS, Vec::new()),
            })
            .await?;
        tokio::time::sleep(Duration::from_millis(50)).await;

        events
            .send(MlmEvent::Associated { peer: *peer, aid })
            .await?;

        let Some(key) = key else { continue };
        let material = KeyMaterial::wep(0, true, key.as_bytes())?;
        events
            .send(MlmEvent::SetKeys {
                req: SetKeysReq {
                    peer_mac: *peer,
                    aid,
                    session_id,
                    material,
                },
                scope: KeyScope::Peer {
                    sta_idx: aid,
                    def_wep_idx: 0,
                },
            })
            .await?;
    }

    if let Some(key) = key {
        let material = KeyMaterial::wep(0, false, key.as_bytes())?;
        events
            .send(MlmEvent::SetKeys {
                req: SetKeysReq {
                    peer_mac: MacAddr::ZERO,
                    aid: 0,
                    session_id,
                    material,
                },
                scope: KeyScope::Group,
            })
            .await?;
    }
    Ok(())
}
