//! Duocall CLI
//!
//! Runs a loopback call between two in-process participants over an
//! in-memory signaling pair, which exercises the whole session lifecycle
//! without a relay deployment.

use anyhow::Result;
use clap::{Parser, Subcommand};
use duocall_core::{
    memory_pair, CallConfig, CallSessionController, CallStatus, MediaKind, ParticipantId,
    SignalingTransport,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Local identity (random when omitted)
    #[arg(short, long, env = "DUOCALL_IDENTITY")]
    identity: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a loopback call between two in-process participants
    Loopback {
        /// Place a video call instead of audio-only
        #[arg(long)]
        video: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "3")]
        duration: u64,

        /// Toggle screen share on and off mid-call
        #[arg(long)]
        screen_share: bool,
    },

    /// Show engine defaults
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("duocall=info")
        .init();

    let cli = Cli::parse();
    let identity = cli
        .identity
        .unwrap_or_else(|| random_identity("caller"));

    match cli.command {
        Commands::Loopback {
            video,
            duration,
            screen_share,
        } => {
            handle_loopback(&identity, video, duration, screen_share).await?;
        }
        Commands::Status => {
            handle_status();
        }
    }

    Ok(())
}

async fn handle_loopback(
    identity: &str,
    video: bool,
    duration: u64,
    screen_share: bool,
) -> Result<()> {
    let kind = if video {
        MediaKind::Video
    } else {
        MediaKind::Audio
    };
    let caller_id = ParticipantId::new(identity);
    let callee_id = ParticipantId::new(random_identity("callee"));

    println!("📞 {caller_id} calling {callee_id} ({kind})");

    let (caller_transport, callee_transport) = memory_pair();

    // The callee side: pick up the offer, accept, run until the call ends.
    let callee_local = callee_id.clone();
    let callee_task = tokio::spawn(async move {
        let message = callee_transport.recv().await?;
        let (mut callee, offer) = CallSessionController::from_offer(
            callee_local,
            message,
            CallConfig::default(),
            callee_transport,
        )?;
        callee.accept_incoming_call(offer).await?;
        println!("✅ callee accepted, status: {:?}", callee.status());
        callee.run().await?;
        println!("👋 callee finished, status: {:?}", callee.status());
        Ok::<_, anyhow::Error>(())
    });

    let mut caller = CallSessionController::outgoing(
        caller_id,
        callee_id,
        "loopback",
        kind,
        identity,
        CallConfig::default(),
        caller_transport,
    );
    caller.start_outgoing_call().await?;
    println!("🔔 ringing, status: {:?}", caller.status());

    run_for(&mut caller, Duration::from_millis(500)).await;
    println!("🔗 caller status: {:?}", caller.status());

    if screen_share && !video {
        println!("⚠️  --screen-share needs --video (no outgoing video leg to replace)");
    }
    if screen_share && video && caller.status() == CallStatus::Connected {
        caller.toggle_screen_share().await?;
        println!("🖥️  screen share on");
        run_for(&mut caller, Duration::from_secs(1)).await;
        caller.toggle_screen_share().await?;
        println!("📷 screen share off, back on camera");
    }

    run_for(&mut caller, Duration::from_secs(duration)).await;

    caller.end_call().await?;
    if let Some(elapsed) = caller.duration() {
        println!("⏱️  connected for {}ms", elapsed.num_milliseconds());
    }
    println!("👋 caller finished, status: {:?}", caller.status());

    callee_task.await??;
    Ok(())
}

/// Drive the session event loop for a bounded slice of time
async fn run_for(
    caller: &mut CallSessionController<duocall_core::MemorySignalingTransport>,
    window: Duration,
) {
    if caller.status().is_terminal() {
        return;
    }
    tokio::select! {
        _ = caller.run() => {}
        () = sleep(window) => {}
    }
}

fn handle_status() {
    let config = CallConfig::default();
    println!("duocall defaults");
    println!("  path discovery (STUN only):");
    for server in &config.stun_servers {
        println!("    {server}");
    }
    println!(
        "  microphone: {}",
        config.media.audio_device.as_deref().unwrap_or("unavailable")
    );
    println!(
        "  camera:     {}",
        config.media.video_device.as_deref().unwrap_or("unavailable")
    );
    println!("  screen capture: {}", config.media.screen_capture);
}

fn random_identity(prefix: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!("{prefix}-{}", suffix.to_lowercase())
}
