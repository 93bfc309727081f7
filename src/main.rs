//! v380-cli - Lightweight CLI client for V380 4G cloud cameras
//!
//! Records and restreams live video from cameras behind the vendor cloud
//! relay, decrypting on the fly.

mod cloud;
mod config;
mod crypto;
mod error;
mod rtsp;
mod stream;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cloud::CloudClient;
use stream::recorder::{self, CancelToken, RecorderOptions};

#[derive(Parser)]
#[command(name = "v380-cli")]
#[command(about = "Record live video from V380 4G cloud cameras", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Record the live stream to elementary-stream files
    Record {
        /// Camera device ID (from the QR code)
        #[arg(short, long)]
        device_id: u32,

        /// Device password (not the account password)
        #[arg(short, long)]
        password: String,

        /// Recording duration in seconds
        #[arg(short = 't', long, default_value = "60")]
        duration: u64,

        /// Output directory for recordings
        #[arg(short, long, default_value = "recordings")]
        output_dir: PathBuf,

        /// Output filename prefix
        #[arg(long, default_value = "v380")]
        prefix: String,

        /// Override the API server address
        #[arg(long)]
        server: Option<String>,

        /// Override the encryption handle (cameras with fixed handles)
        #[arg(long)]
        handle: Option<u32>,

        /// Disable audio recording
        #[arg(long)]
        no_audio: bool,

        /// Serve the live stream over RTSP while recording
        #[arg(long)]
        rtsp: bool,

        /// RTSP server port
        #[arg(long)]
        rtsp_port: Option<u16>,

        /// Also save the undecrypted relay stream for offline analysis
        #[arg(long)]
        debug: bool,
    },

    /// Authenticate against the cloud and print session details
    Login {
        /// Camera device ID
        #[arg(short, long)]
        device_id: u32,

        /// Device password
        #[arg(short, long)]
        password: String,

        /// Override the API server address
        #[arg(long)]
        server: Option<String>,
    },

    /// Send the cloud-registration packet only
    Register {
        /// Camera device ID
        #[arg(short, long)]
        device_id: u32,

        /// Override the API server address
        #[arg(long)]
        server: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cfg = config::Config::load().unwrap_or_else(|e| {
        tracing::warn!("ignoring unreadable config: {e:#}");
        config::Config::default()
    });

    match cli.command {
        Commands::Record {
            device_id,
            password,
            duration,
            output_dir,
            prefix,
            server,
            handle,
            no_audio,
            rtsp,
            rtsp_port,
            debug,
        } => {
            let rtsp_port = cfg.rtsp_port(rtsp_port);
            let mut client =
                CloudClient::new(device_id, password, cfg.endpoints(server.as_deref()));

            // Best-effort: prime the relay, then log in regardless.
            if let Err(e) = client.register().await {
                tracing::warn!("registration failed ({e}), continuing");
            }
            client.connect().await?;
            client.login().await?;
            if let Some(handle) = handle {
                client.set_handle(handle)?;
            }

            let rtsp_server = if rtsp {
                let server = rtsp::RtspServer::start(rtsp_port).await?;
                println!("watch live: rtsp://localhost:{}/stream", server.port());
                Some(server)
            } else {
                None
            };

            let cancel = CancelToken::new();
            {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        tracing::info!("interrupt received, stopping recording");
                        cancel.cancel();
                    }
                });
            }

            let opts = RecorderOptions {
                duration: Duration::from_secs(duration),
                output_dir,
                prefix,
                enable_audio: !no_audio,
                raw_dump: debug,
            };
            let summary =
                recorder::record(&client, &opts, rtsp_server.as_ref().map(Arc::clone), cancel)
                    .await?;

            if let Some(server) = rtsp_server {
                server.shutdown().await;
            }

            if summary.cancelled {
                println!("recording stopped early");
            }
            println!(
                "video: {} ({:.1} KiB)",
                summary.video_path.display(),
                summary.video_bytes as f64 / 1024.0
            );
            if let Some(audio_path) = &summary.audio_path {
                println!(
                    "audio: {} ({:.1} KiB)",
                    audio_path.display(),
                    summary.audio_bytes as f64 / 1024.0
                );
            }
        }

        Commands::Login {
            device_id,
            password,
            server,
        } => {
            let mut client =
                CloudClient::new(device_id, password, cfg.endpoints(server.as_deref()));
            client.connect().await?;
            let session = client.login().await?.clone();
            println!("session: {}", session.session);
            println!("handle:  {}", session.handle);
            if let Some(battery) = client.battery() {
                println!("battery: {battery}%");
            }
            println!(
                "audio:   {}",
                if client.audio_supported() {
                    "supported"
                } else {
                    "not supported"
                }
            );
        }

        Commands::Register { device_id, server } => {
            let client = CloudClient::new(device_id, String::new(), cfg.endpoints(server.as_deref()));
            client.register().await?;
        }
    }

    Ok(())
}
