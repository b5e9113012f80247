//! `iothub-transport` command line
//!
//! Connects one device over MQTT, subscribes to cloud-to-device messages,
//! direct methods and the device twin, and logs everything it receives.

use bytes::Bytes;
use clap::{Parser, Subcommand};
use futures::StreamExt;
use iothub_transport::callbacks::{
    ConnectionStatus, ConnectionStatusReason, DeviceIdentity, MethodRequest, TransportCallbacks,
    TwinUpdateState,
};
use iothub_transport::clock::SystemClock;
use iothub_transport::config::{AppConfig, ConfigError};
use iothub_transport::device::DeviceHandle;
use iothub_transport::message::{Message, MessageDisposition, OutboundQueue};
use iothub_transport::observability::logging::parse_level;
use iothub_transport::observability::{init_logging, LogFormat};
use iothub_transport::transport::mqtt::{MqttTransport, RumqttcClient};
use iothub_transport::transport::TlsIoFactory;
use serde_json::json;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_tokio::Signals;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

/// Status sent back for every direct method
const METHOD_STATUS_OK: i32 = 200;
const TICK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "iothub-transport")]
#[command(about = "Device-to-cloud MQTT transport for IoT Hub devices")]
#[command(version)]
struct Cli {
    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect the configured device and run until SIGINT or SIGTERM
    Run {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Validate a configuration file and exit
    CheckConfig {
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let path = match &cli.command {
        Commands::Run { config } | Commands::CheckConfig { config } => config.clone(),
    };
    let loaded = load_configuration(&path);

    let (level, format) = match &loaded {
        Ok(config) => (
            parse_level(&config.logging.level),
            LogFormat::parse(&config.logging.format),
        ),
        Err(_) => (Level::INFO, LogFormat::Compact),
    };
    let level = match cli.verbose {
        0 => level,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let include_spans = std::env::var("LOG_SPANS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if let Err(e) = init_logging(level, format, include_spans) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let config = match loaded {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration from {}: {}", path.display(), e);
            process::exit(1);
        }
    };

    match cli.command {
        Commands::CheckConfig { .. } => {
            info!(
                hub = %config.hub.name,
                device_id = %config.device.device_id,
                "Configuration is valid"
            );
        }
        Commands::Run { .. } => {
            if let Err(e) = run(config).await {
                error!("Transport failed: {}", e);
                process::exit(1);
            }
        }
    }

    info!("Shutdown complete");
}

fn load_configuration(path: &Path) -> Result<AppConfig, ConfigError> {
    AppConfig::load_from_file(path)
}

/// Work the tick loop does on the callbacks' behalf once `do_work` returns
enum Inbound {
    Message(Message),
    Method(MethodRequest),
}

struct LoggingCallbacks {
    inbound: mpsc::UnboundedSender<Inbound>,
}

impl TransportCallbacks for LoggingCallbacks {
    fn message_received(&self, device: &DeviceIdentity, message: Message) -> bool {
        info!(
            device = %device,
            message_id = ?message.properties().message_id,
            body = %String::from_utf8_lossy(message.body()),
            "Cloud-to-device message received"
        );
        self.inbound.send(Inbound::Message(message)).is_ok()
    }

    fn input_message_received(&self, device: &DeviceIdentity, message: Message) -> bool {
        info!(device = %device, bytes = message.body().len(), "Input message received");
        self.inbound.send(Inbound::Message(message)).is_ok()
    }

    fn connection_status_changed(
        &self,
        device: &DeviceIdentity,
        status: ConnectionStatus,
        reason: ConnectionStatusReason,
    ) {
        info!(device = %device, ?status, ?reason, "Connection status changed");
    }

    fn twin_reported_state_complete(&self, device: &DeviceIdentity, item_id: u32, status_code: i32) {
        info!(device = %device, item_id, status_code, "Reported properties acknowledged");
    }

    fn twin_retrieve_properties_complete(
        &self,
        device: &DeviceIdentity,
        state: TwinUpdateState,
        payload: &[u8],
    ) {
        info!(
            device = %device,
            ?state,
            twin = %String::from_utf8_lossy(payload),
            "Twin update received"
        );
    }

    fn device_method(&self, device: &DeviceIdentity, request: MethodRequest) -> bool {
        info!(device = %device, method = %request.name, "Direct method invoked");
        self.inbound.send(Inbound::Method(request)).is_ok()
    }
}

async fn run(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let transport_config = config.transport_config()?;
    let device = config.device_config(&transport_config)?;

    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    let callbacks = Arc::new(LoggingCallbacks { inbound: inbound_tx });
    let client = RumqttcClient::from_current_runtime()?;

    let mut transport = MqttTransport::new(
        &transport_config,
        Box::new(client),
        Arc::new(TlsIoFactory),
        callbacks,
        Arc::new(SystemClock),
    )?
    .with_port(config.mqtt.port);

    for option in config.transport_options() {
        transport.set_option(option)?;
    }
    transport.set_retry_policy(config.retry.retry_policy()?, config.retry.max_retry_time_secs)?;

    let handle = transport.register(device, OutboundQueue::new())?;

    transport.subscribe(handle)?;
    transport.subscribe_device_method(handle)?;
    transport.subscribe_device_twin(handle)?;
    if transport_config.module_id.is_some() {
        transport.subscribe_input_queue(handle)?;
    }

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let signals_handle = signals.handle();
    let mut ticker = tokio::time::interval(TICK_INTERVAL);

    info!(hostname = transport.hostname(), "Transport running");

    loop {
        tokio::select! {
            signal = signals.next() => {
                match signal {
                    Some(SIGINT) => info!("Received SIGINT, shutting down gracefully..."),
                    Some(SIGTERM) => info!("Received SIGTERM, shutting down gracefully..."),
                    other => warn!(?other, "Signal stream ended, shutting down"),
                }
                break;
            }
            _ = ticker.tick() => {
                transport.do_work();
                while let Ok(item) = inbound_rx.try_recv() {
                    answer(&mut transport, handle, item);
                }
            }
        }
    }

    signals_handle.close();
    transport.destroy();
    Ok(())
}

fn answer(transport: &mut MqttTransport, handle: DeviceHandle, item: Inbound) {
    match item {
        Inbound::Message(message) => {
            if let Err(e) =
                transport.send_message_disposition(handle, message, MessageDisposition::Accepted)
            {
                warn!(error = %e, "Could not accept message");
            }
        }
        Inbound::Method(request) => {
            let payload = match serde_json::to_vec(&json!({ "method": request.name, "handled": true })) {
                Ok(body) => Bytes::from(body),
                Err(e) => {
                    warn!(method = %request.name, error = %e, "Could not encode method response");
                    Bytes::from_static(b"{}")
                }
            };
            if let Err(e) = transport.device_method_response(
                handle,
                &request.handle,
                &payload,
                METHOD_STATUS_OK,
            ) {
                warn!(method = %request.name, error = %e, "Could not answer method");
            }
        }
    }
}
