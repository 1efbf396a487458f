//! Thingy Bridge - reports a Thingy:52's temperature to an AWS IoT shadow.
//!
//! Run with: `cargo run -p thingy-bridge -- -e <endpoint> -c <cert> -k <key> -r <ca> -m <mac>`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use thingy_bridge::{ChannelOptions, Config, MqttShadowChannel};
use thingy_core::{DeltaHandler, NotificationKind, Reconciler, SensorLink, ShadowChannel, ThingyDevice};

/// Thingy Bridge - keep an AWS IoT device shadow in sync with a Thingy:52.
#[derive(Parser, Debug, Default)]
#[command(name = "thingy-bridge")]
#[command(version, about, long_about = None)]
struct Args {
    /// AWS IoT endpoint (overrides config).
    #[arg(short, long)]
    endpoint: Option<String>,

    /// Root CA certificate file (overrides config).
    #[arg(short, long)]
    root_ca: Option<PathBuf>,

    /// Client certificate file (overrides config).
    #[arg(short, long)]
    cert: Option<PathBuf>,

    /// Client private key file (overrides config).
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Thing name [config default: Bot].
    #[arg(short = 'n', long)]
    thing_name: Option<String>,

    /// MQTT client id [config default: basicShadowDeltaListener].
    #[arg(short = 'i', long)]
    client_id: Option<String>,

    /// Sensor MAC address (overrides config).
    #[arg(short, long)]
    mac_address: Option<String>,

    /// Path to configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    verbose: bool,
}

impl Args {
    /// Apply command-line values on top of the file configuration.
    fn apply(&self, config: &mut Config) {
        if let Some(endpoint) = &self.endpoint {
            config.shadow.endpoint = endpoint.clone();
        }
        if let Some(root_ca) = &self.root_ca {
            config.shadow.root_ca = Some(root_ca.clone());
        }
        if let Some(cert) = &self.cert {
            config.shadow.cert = Some(cert.clone());
        }
        if let Some(key) = &self.key {
            config.shadow.key = Some(key.clone());
        }
        if let Some(thing_name) = &self.thing_name {
            config.shadow.thing_name = thing_name.clone();
        }
        if let Some(client_id) = &self.client_id {
            config.shadow.client_id = client_id.clone();
        }
        if let Some(address) = &self.mac_address {
            config.sensor.address = address.clone();
        }
    }

    fn log_filter(&self) -> anyhow::Result<EnvFilter> {
        let level = if self.verbose { "debug" } else { "info" };
        Ok(EnvFilter::from_default_env()
            .add_directive(format!("thingy_bridge={}", level).parse()?)
            .add_directive(format!("thingy_core={}", level).parse()?))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(args.log_filter()?)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default().unwrap_or_else(|e| {
            warn!("Ignoring default config: {}", e);
            Config::default()
        }),
    };
    args.apply(&mut config);
    config.validate()?;

    run_bridge(config).await
}

async fn run_bridge(config: Config) -> anyhow::Result<()> {
    let thing_name = config.shadow.thing_name.clone();

    info!(address = %config.sensor.address, "Connecting to sensor");
    let device = ThingyDevice::connect_with_config(&config.sensor.address, config.connection_config())
        .await
        .with_context(|| format!("Failed to connect to sensor {}", config.sensor.address))?;
    let device = Arc::new(device);
    device
        .enable_notifications(&[NotificationKind::Temperature, NotificationKind::Button])
        .await
        .context("Failed to enable sensor notifications")?;

    let options = ChannelOptions::from_config(&config).context("Failed to load TLS credentials")?;
    let channel = MqttShadowChannel::connect(options)
        .await
        .with_context(|| format!("Failed to connect to {}", config.shadow.endpoint))?;
    let channel = Arc::new(channel);

    channel
        .subscribe_responses(&thing_name)
        .await
        .context("Failed to subscribe to shadow responses")?;
    let deltas = Arc::new(DeltaHandler::new());
    channel
        .subscribe_delta(&thing_name, deltas.into_handler())
        .await
        .context("Failed to subscribe to shadow deltas")?;

    let reconciler = Reconciler::new(
        Arc::clone(&device),
        Arc::clone(&channel),
        thing_name,
        config.reconcile_options(),
    );

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    reconciler.run(cancel).await;

    channel.disconnect().await;
    if let Err(e) = device.disconnect().await {
        warn!("Sensor disconnect failed: {}", e);
    }
    info!("Bridge stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_flags() {
        let args = Args::try_parse_from([
            "thingy-bridge",
            "-e",
            "abc-ats.iot.us-east-1.amazonaws.com",
            "-r",
            "ca.pem",
            "-c",
            "cert.pem",
            "-k",
            "key.pem",
            "-n",
            "Greenhouse",
            "-i",
            "bridge-1",
            "-m",
            "C8:2E:11:22:33:44",
        ])
        .unwrap();

        assert_eq!(args.endpoint.as_deref(), Some("abc-ats.iot.us-east-1.amazonaws.com"));
        assert_eq!(args.client_id.as_deref(), Some("bridge-1"));
        assert_eq!(args.mac_address.as_deref(), Some("C8:2E:11:22:33:44"));
        assert!(!args.verbose);
    }

    #[test]
    fn test_long_flags() {
        let args = Args::try_parse_from([
            "thingy-bridge",
            "--client-id",
            "bridge-2",
            "--thing-name",
            "Bot",
            "--config",
            "/etc/thingy/bridge.toml",
            "--verbose",
        ])
        .unwrap();

        assert_eq!(args.client_id.as_deref(), Some("bridge-2"));
        assert_eq!(args.config, Some(PathBuf::from("/etc/thingy/bridge.toml")));
        assert!(args.verbose);
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config = Config::default();
        config.shadow.endpoint = "from-file.example.com".to_string();
        config.shadow.thing_name = "FileThing".to_string();
        config.sensor.address = "AA:BB:CC:DD:EE:FF".to_string();

        let args = Args {
            endpoint: Some("from-cli.example.com".to_string()),
            mac_address: Some("C8:2E:11:22:33:44".to_string()),
            cert: Some(PathBuf::from("cert.pem")),
            ..Args::default()
        };
        args.apply(&mut config);

        assert_eq!(config.shadow.endpoint, "from-cli.example.com");
        assert_eq!(config.shadow.thing_name, "FileThing");
        assert_eq!(config.sensor.address, "C8:2E:11:22:33:44");
        assert_eq!(config.shadow.cert, Some(PathBuf::from("cert.pem")));
        assert_eq!(config.shadow.key, None);
    }

    #[test]
    fn test_missing_key_fails_validation() {
        let mut config = Config::default();
        let args = Args {
            endpoint: Some("abc-ats.iot.us-east-1.amazonaws.com".to_string()),
            root_ca: Some(PathBuf::from("ca.pem")),
            cert: Some(PathBuf::from("cert.pem")),
            mac_address: Some("C8:2E:11:22:33:44".to_string()),
            ..Args::default()
        };
        args.apply(&mut config);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Missing credentials for authentication."));
    }

    #[test]
    fn test_log_filter_levels() {
        let quiet = Args::default().log_filter().unwrap().to_string();
        assert!(quiet.contains("thingy_bridge=info"));

        let verbose = Args {
            verbose: true,
            ..Args::default()
        };
        let filter = verbose.log_filter().unwrap().to_string();
        assert!(filter.contains("thingy_core=debug"));
    }
}
