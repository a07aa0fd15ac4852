use anyhow::{Context, bail};
use clap::Parser;
use pixelstream::session::{ConnectionState, StreamingSession};
use pixelstream::settings::{SettingsHandle, SettingsOverrides, StreamSettings};
use pixelstream::transport::websocket::WebSocketConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use fitspace::auth::AuthInfo;
use fitspace::config::Config;
use fitspace::logging::{self, LogConfig, LogLevel};
use fitspace::provision::{InstanceManager, InstanceStatus, ProvisionConfig};
use fitspace::teardown::ReleaseBeacon;
use fitspace::workflow::{ConnectionBridge, ProvisioningWorkflow};

/// Headless driver for the Fitspace streaming stack: provisions a rendering
/// instance, attaches the streaming session, and keeps it alive until
/// interrupted.
#[derive(Parser, Debug)]
#[command(name = "fitspace", version, about = "Fitspace streaming companion")]
struct Cli {
    /// Log verbosity.
    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Bearer token issued by the identity provider.
    #[arg(long, env = "FITSPACE_TOKEN")]
    token: Option<String>,

    /// Use a throwaway guest identity instead of a token.
    #[arg(long)]
    guest: bool,

    /// Connect straight to this signalling URL, bypassing provisioning.
    #[arg(long)]
    signalling_url: Option<String>,

    /// Engine command to send once the stream is connected.
    #[arg(long)]
    command: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("failed to initialize logging")?;

    let config = Config::from_env().context("invalid environment configuration")?;

    let identity = if let Some(token) = &cli.token {
        AuthInfo::from_bearer_token(token).context("failed to parse identity token")?
    } else if cli.guest {
        AuthInfo::guest()
    } else {
        bail!("no identity; pass --token or --guest");
    };
    info!(
        target = "fitspace",
        user_id = identity.user_id.as_deref().unwrap_or("<none>"),
        "identity resolved"
    );

    let settings = SettingsHandle::new(StreamSettings {
        signalling_url: config.signalling_url.clone(),
        ..StreamSettings::default()
    });
    if config.localhost_mode {
        // Activates the override layer so loopback engines are reachable.
        settings.set_overrides(Some(SettingsOverrides::default()));
    }

    let session = Arc::new(StreamingSession::new(Arc::new(WebSocketConnector), settings));
    session.subscribe(|message| {
        debug!(target = "fitspace", %message, "engine message");
    });

    if let Some(url) = &cli.signalling_url {
        session
            .connect(Some(url))
            .await
            .context("direct connect failed")?;
        attach_until_interrupted(&session, cli.command.as_deref()).await?;
        session.disconnect().await;
        return Ok(());
    }

    let manager = Arc::new(
        InstanceManager::new(ProvisionConfig::new(config.provision_base.clone()))
            .context("failed to build provisioning client")?,
    );
    let workflow = Arc::new(ProvisioningWorkflow::new(manager.clone(), identity));
    workflow
        .ensure_started()
        .await
        .context("provisioning kick-off failed")?;

    let bridge = ConnectionBridge::new(session.clone(), manager.clone());
    let result = drive(&session, &manager, &bridge, cli.command.as_deref()).await;

    workflow.shutdown();
    session.disconnect().await;
    if let (Some(endpoint), Some(instance_id)) =
        (config.teardown_url.clone(), manager.snapshot().instance_id)
    {
        ReleaseBeacon::new(endpoint)?.release(&instance_id).await;
    }
    result
}

/// Main loop: nudge the bridge once a second, watch the session state, and
/// bail out on terminal provisioning errors or ctrl-c.
async fn drive(
    session: &Arc<StreamingSession>,
    manager: &Arc<InstanceManager>,
    bridge: &ConnectionBridge,
    command: Option<&str>,
) -> anyhow::Result<()> {
    let mut state_rx = session.watch_state();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut command_sent = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target = "fitspace", "interrupted; shutting down");
                return Ok(());
            }
            _ = ticker.tick() => {
                if manager.status() == InstanceStatus::Error {
                    bail!(
                        "provisioning failed: {}",
                        manager.last_error().unwrap_or_else(|| "unknown".into())
                    );
                }
                if let Err(err) = bridge.maybe_connect().await {
                    warn!(target = "fitspace", error = %err, "connect attempt failed");
                }
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = *state_rx.borrow();
                info!(target = "fitspace", ?state, "session state");
                if state == ConnectionState::Connected && !command_sent {
                    if let Some(name) = command {
                        session.send_command(name, None).await?;
                        command_sent = true;
                    }
                }
            }
        }
    }
}

/// Direct-connect mode: stay attached until ctrl-c, sending the one-shot
/// command when the stream comes up.
async fn attach_until_interrupted(
    session: &Arc<StreamingSession>,
    command: Option<&str>,
) -> anyhow::Result<()> {
    let mut state_rx = session.watch_state();
    let mut command_sent = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(target = "fitspace", "interrupted; shutting down");
                return Ok(());
            }
            changed = state_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let state = *state_rx.borrow();
                info!(target = "fitspace", ?state, "session state");
                match state {
                    ConnectionState::Connected if !command_sent => {
                        if let Some(name) = command {
                            session.send_command(name, None).await?;
                            command_sent = true;
                        }
                    }
                    ConnectionState::Error => {
                        bail!(
                            "stream failed: {}",
                            session.last_error().unwrap_or_else(|| "unknown".into())
                        );
                    }
                    _ => {}
                }
            }
        }
    }
}
