use std::sync::Arc;

use anyhow::Result;
use huddle_client::media::gst_capture::GstDevices;
use huddle_client::media::gst_encoder::{GstRecordingEncoders, GstSampleEncoders};
use huddle_client::session::{NoModel, RecordingToggle};
use huddle_client::transport::RtcTransport;
use huddle_client::transport::rtc::RtcConfig;
use huddle_client::{PersistentSettings, Session, SessionDeps, SessionOptions, Settings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "huddle=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Huddle...");

    let settings = Settings::load()?;
    let mut persistent = PersistentSettings::load();

    let deps = SessionDeps {
        transport: Arc::new(RtcTransport::new(
            RtcConfig::from(&settings),
            Arc::new(GstSampleEncoders::new()?),
        )?),
        devices: Arc::new(GstDevices::new()?),
        segmenter: Arc::new(NoModel),
        recording_encoders: Arc::new(GstRecordingEncoders::new()?),
    };
    let session = Session::new(deps, SessionOptions::from_settings(&settings, &persistent))?;

    let mut notices = session.subscribe_notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            tracing::warn!("{}", notice);
        }
    });

    let mut roster = session.subscribe_roster();
    tokio::spawn(async move {
        while roster.changed().await.is_ok() {
            let names: Vec<String> = roster
                .borrow_and_update()
                .iter()
                .map(|p| format!("{} ({})", p.display_name, p.peer_id))
                .collect();
            tracing::info!("Participants: {}", names.join(", "));
        }
    });

    let local_id = session.start().await?;
    tracing::info!("Connected as {}", local_id);

    if let Some(remote_id) = std::env::args().nth(1) {
        session.join(&remote_id).await?;
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = session.wait_ended() => break,
            line = lines.next_line(), if console => match line {
                Ok(Some(line)) => {
                    if !command(&session, line.trim()).await {
                        break;
                    }
                }
                // Keep running until Ctrl-C
                _ => console = false,
            },
        }
    }

    persistent.background_mode = session.background_mode();
    if let Some(local) = session.roster().into_iter().find(|p| p.is_local) {
        persistent.display_name = Some(local.display_name);
    }
    persistent.save();

    if !session.is_ended() {
        let summary = session.end_session().await?;
        if let Some(recording) = summary.recording {
            tracing::info!("Recording saved to {}", recording.path.display());
        }
    }
    tracing::info!("Session ended");
    Ok(())
}

/// Handle one console command; false means quit
async fn command(session: &Session, line: &str) -> bool {
    let result = match line {
        "a" => session.toggle_audio().map(|on| tracing::info!("Microphone {}", on_off(on))),
        "v" => session.toggle_video().map(|on| tracing::info!("Camera {}", on_off(on))),
        "b" => session
            .cycle_background()
            .map(|mode| tracing::info!("Background: {:?}", mode)),
        "s" => session
            .toggle_screen_share()
            .await
            .map(|on| tracing::info!("Screen share {}", on_off(on))),
        "r" => session.toggle_recording().await.map(|toggle| match toggle {
            RecordingToggle::Started => tracing::info!("Recording started"),
            RecordingToggle::Stopped(Some(artifact)) => {
                tracing::info!("Recording saved to {}", artifact.path.display())
            }
            RecordingToggle::Stopped(None) | RecordingToggle::NotStarted => tracing::info!("Not recording"),
        }),
        "q" => return false,
        "" => Ok(()),
        other => {
            if let Some(remote_id) = other.strip_prefix("join ") {
                session.join(remote_id.trim()).await
            } else if let Some(name) = other.strip_prefix("name ") {
                session.set_display_name(name.trim()).await
            } else {
                tracing::info!(
                    "Commands: a (mic), v (camera), b (background), s (screen), r (record), join <id>, name <name>, q"
                );
                Ok(())
            }
        }
    };
    if let Err(e) = result {
        tracing::error!("{}", e);
    }
    true
}

fn on_off(on: bool) -> &'static str {
    if on { "on" } else { "off" }
}
