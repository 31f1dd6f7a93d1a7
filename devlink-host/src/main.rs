//! Devlink device core on a desktop
//!
//! `run` hosts the device with file-backed storage and a TCP listener in place
//! of the BLE pairing service; `provision` plays the companion app against it.

mod companion;
mod wifi;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use devlink_device::{
    CancellationToken, Device, DeviceConfig, DeviceContext, DeviceIdentity, FileFirmware, FileStorage, FramedLink,
    JsonValue, MqttTransport, Preferences, ProvisioningHandler, ReqwestClient, devlink_home, json, load_or_create_mac,
};
use devlink_mcu::ALL_NAMESPACES;
use devlink_proto::ProvisionRequest;
use devlink_proto::ble::commands;
use log::*;
use tokio::net::TcpListener;

use companion::Companion;
use wifi::HostWifi;

#[derive(clap::Parser)]
#[command(name = "devlink-host")]
#[command(about = "Devlink device core on a desktop")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the device, accepting companion connections on the pairing address
    Run {
        /// Pairing link address
        #[arg(short, long, default_value = "127.0.0.1:7878")]
        listen: String,
        /// Largest firmware image accepted, in bytes
        #[arg(long, default_value_t = 4 * 1024 * 1024)]
        firmware_capacity: u64,
    },
    /// Talk to a running device as the companion app
    Provision {
        /// Pairing link address of the device
        #[arg(short, long, default_value = "127.0.0.1:7878")]
        device: String,
        #[command(subcommand)]
        step: Step,
    },
    /// Erase stored credentials, tokens and the clock snapshot
    Reset,
}

#[derive(clap::Args, Clone)]
struct Endpoints {
    #[arg(long)]
    auth_url: String,
    #[arg(long)]
    token_url: String,
    #[arg(long)]
    mqtt_url: String,
    #[arg(long)]
    cloud_api_url: String,
    #[arg(long)]
    config_url: String,
}

impl Endpoints {
    fn request(&self) -> Vec<u8> {
        let data = json!({
            "authUrl": self.auth_url,
            "tokenUrl": self.token_url,
            "mqttUrl": self.mqtt_url,
            "cloudApiUrl": self.cloud_api_url,
            "configUrl": self.config_url,
        });
        ProvisionRequest::new(commands::SERVER_DATA, data).to_bytes()
    }
}

#[derive(clap::Subcommand)]
enum Step {
    /// Send the service endpoints
    ServerData {
        #[command(flatten)]
        endpoints: Endpoints,
    },
    /// Send WiFi credentials in the legacy `ssid:password` form
    Wifi {
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        password: String,
    },
    /// Fetch the pairing code
    GetToken,
    /// Wait for the user to approve the pairing
    CheckAuth,
    /// Whole pairing session: endpoints, WiFi, pairing code, approval
    Pair {
        #[command(flatten)]
        endpoints: Endpoints,
        #[arg(long)]
        ssid: String,
        #[arg(long)]
        password: String,
        /// CHECK_AUTH rounds before giving up
        #[arg(long, default_value_t = 15)]
        rounds: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli: Cli = clap::Parser::parse();

    match cli.command {
        Commands::Run { listen, firmware_capacity } => run(&listen, firmware_capacity).await,
        Commands::Provision { device, step } => provision(&device, step).await,
        Commands::Reset => reset(),
    }
}

fn open_storage(home: &Path) -> anyhow::Result<Preferences> {
    Ok(Preferences::new(FileStorage::open(home.join("storage"))?))
}

async fn run(listen: &str, firmware_capacity: u64) -> anyhow::Result<()> {
    let home = devlink_home()?;
    let config = DeviceConfig::load_or_create(&home)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            on_signal.cancel();
        }
    });

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind to {}", listen))?;
    let listener = Arc::new(listener);
    info!("Pairing link listening on {}", listen);

    // every pass is one boot
    loop {
        let prefs = open_storage(&home)?;
        let identity = DeviceIdentity::new(load_or_create_mac(&prefs)?, &config);
        let ctx = DeviceContext::load(identity, config.clone(), prefs)?;

        let firmware = home.join("firmware.bin");
        let mut device = Device::new(
            ctx,
            ReqwestClient::new(config.ota_timeout()),
            HostWifi::new(),
            MqttTransport::new(config.ca_bundle.clone()),
            move || FileFirmware::new(firmware.clone(), firmware_capacity),
        );
        register_commands(&mut device);
        info!("Device {} booting", device.id());

        let pairing = tokio::spawn(serve_pairing(
            listener.clone(),
            device.provisioning(),
            device.handle().aux_token(),
        ));

        let reason = device.run(shutdown.clone()).await;
        pairing.abort();

        match reason {
            None => return Ok(()),
            Some(reason) => {
                warn!("Restarting: {:?}", reason);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn register_commands(device: &mut Device) {
    let ctx = device.context().clone();
    device.command("status", move |_, _| {
        let conn = ctx.connection();
        Ok(json!({
            "wifi": conn.wifi_up,
            "broker": conn.broker_up,
            "uptime": ctx.uptime().as_secs(),
            "version": ctx.identity().firmware_version,
        }))
    });

    let telemetry = device.telemetry().clone();
    device.command("telemetry/submit", move |_, params| {
        let method = params["method"].as_str().unwrap_or("sensor-data");
        let name = params["name"].as_str().ok_or("missing name")?;
        let value = params["value"].as_f64().ok_or("missing value")?;
        telemetry.submit(method, name, value);
        Ok(JsonValue::Null)
    });
}

async fn serve_pairing(listener: Arc<TcpListener>, handler: ProvisioningHandler, cancel: CancellationToken) {
    let handler = Arc::new(handler);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!("Companion connected from {}", addr);
                    let handler = handler.clone();
                    tokio::spawn(async move { handler.serve(FramedLink::new(stream)).await });
                }
                Err(e) => warn!("failed to accept: {}", e),
            }
        }
    }
}

async fn provision(addr: &str, step: Step) -> anyhow::Result<()> {
    let mut companion = Companion::connect(addr).await?;

    let message = match step {
        Step::ServerData { endpoints } => endpoints.request(),
        Step::Wifi { ssid, password } => format!("{}:{}", ssid, password).into_bytes(),
        Step::GetToken => ProvisionRequest::new(commands::GET_TOKEN, JsonValue::Null).to_bytes(),
        Step::CheckAuth => ProvisionRequest::new(commands::CHECK_AUTH, JsonValue::Null).to_bytes(),
        Step::Pair { endpoints, ssid, password, rounds } => {
            return pair(&mut companion, &endpoints, &ssid, &password, rounds).await;
        }
    };

    let response = companion.request(message).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    if !response.is_success {
        bail!("{}", response.error);
    }
    Ok(())
}

async fn pair(companion: &mut Companion, endpoints: &Endpoints, ssid: &str, password: &str, rounds: u32) -> anyhow::Result<()> {
    let response = companion.request(endpoints.request()).await?;
    if !response.is_success {
        bail!("SERVER_DATA: {}", response.error);
    }

    let response = companion.request(format!("{}:{}", ssid, password).into_bytes()).await?;
    if !response.is_success {
        bail!("WiFi: {}", response.error);
    }

    let response = companion
        .request(ProvisionRequest::new(commands::GET_TOKEN, JsonValue::Null).to_bytes())
        .await?;
    let Some(token) = response.data.filter(|_| response.is_success) else {
        bail!("GET_TOKEN: {}", response.error);
    };
    println!("Device {} ({})", token.chip_id, token.mac_address);
    println!("Approve code {} at {}", token.user_code, token.verification_uri);

    for round in 1..=rounds {
        let response = companion
            .request(ProvisionRequest::new(commands::CHECK_AUTH, JsonValue::Null).to_bytes())
            .await?;
        if response.is_success {
            println!("Device authorized");
            return Ok(());
        }
        info!("Not authorized yet ({}/{}): {}", round, rounds, response.error);
    }
    bail!("device was not authorized after {} rounds", rounds)
}

fn reset() -> anyhow::Result<()> {
    let home = devlink_home()?;
    let prefs = open_storage(&home)?;
    prefs.clear_all(&ALL_NAMESPACES)?;
    println!("Cleared stored state in {}", home.display());
    Ok(())
}
