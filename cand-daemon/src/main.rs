//! cand - CAN bus to message bus bridge daemon
//!
//! Loads a DBC catalog, attaches to a CAN interface and bridges it to a
//! publish/subscribe bus: either an in-process bus that clients reach over
//! TCP, or a Redis server.

use anyhow::{Context, Result};
use cand_core::{
    parse_dbc_file, Bridge, FrameReceiver, FrameSender, LocalBus, MessageBus, PayloadFormat,
    RangePolicy, VirtualBus,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

mod broker;
mod config;

use config::{AppConfig, BusBackend};

/// cand - bridge a CAN bus and a message bus
#[derive(Parser, Debug)]
#[command(name = "cand")]
#[command(about = "Bridge a CAN bus and a publish/subscribe message bus", long_about = None)]
#[command(version)]
struct Args {
    /// Path to configuration file (config.toml)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the DBC file describing the bus
    #[arg(long, value_name = "FILE")]
    dbc: Option<PathBuf>,

    /// SocketCAN interface (e.g. can0); a virtual bus is used when absent
    #[arg(short, long, value_name = "IFACE")]
    interface: Option<String>,

    /// Address of the TCP message bus front-end
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Use the Redis server at URL as message bus
    #[arg(long, value_name = "URL")]
    redis: Option<String>,

    /// What to do with out-of-range values
    #[arg(long, value_name = "POLICY", value_parser = parse_range_policy)]
    range_policy: Option<RangePolicy>,

    /// Message bus payload encoding (json or msgpack)
    #[arg(long, value_name = "FORMAT", value_parser = parse_payload_format)]
    payload_format: Option<PayloadFormat>,

    /// Verbosity level (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    /// Command-line values take precedence over the configuration file
    fn apply(&self, config: &mut AppConfig) {
        if let Some(dbc) = &self.dbc {
            config.can.dbc = Some(dbc.clone());
        }
        if let Some(interface) = &self.interface {
            config.can.interface = Some(interface.clone());
        }
        if let Some(listen) = &self.listen {
            config.broker.listen = listen.clone();
            config.broker.enabled = true;
        }
        if let Some(url) = &self.redis {
            config.bus.backend = BusBackend::Redis;
            config.bus.redis_url = url.clone();
        }
        if let Some(policy) = self.range_policy {
            config.bridge.range_policy = policy;
        }
        if let Some(format) = self.payload_format {
            config.bridge.payload_format = format;
        }
    }
}

fn parse_range_policy(value: &str) -> Result<RangePolicy, String> {
    match value {
        "clamp" => Ok(RangePolicy::Clamp),
        "reject" => Ok(RangePolicy::Reject),
        other => Err(format!("expected 'clamp' or 'reject', got '{}'", other)),
    }
}

fn parse_payload_format(value: &str) -> Result<PayloadFormat, String> {
    match value {
        "json" => Ok(PayloadFormat::Json),
        "msgpack" => Ok(PayloadFormat::Msgpack),
        other => Err(format!("expected 'json' or 'msgpack', got '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.verbose, args.quiet);

    log::info!("cand v{}", env!("CARGO_PKG_VERSION"));
    log::info!("Using bridge library v{}", cand_core::VERSION);

    let mut config = match &args.config {
        Some(path) => {
            log::info!("Loading configuration from: {:?}", path);
            config::load_config(path)?
        }
        None => AppConfig::default(),
    };
    args.apply(&mut config);

    run(config).await
}

async fn run(config: AppConfig) -> Result<()> {
    let dbc = config
        .can
        .dbc
        .as_ref()
        .context("No DBC file given (use --dbc or set [can] dbc in the config file)")?;

    log::info!("Loading DBC: {:?}", dbc);
    let mut definitions =
        parse_dbc_file(dbc).with_context(|| format!("Failed to load DBC file: {:?}", dbc))?;
    config::apply_cycle_overrides(&mut definitions.messages, &config.can.cycle_overrides)?;
    let catalog = Arc::new(
        definitions
            .into_catalog()
            .context("Invalid message catalog")?,
    );

    let stats = catalog.stats();
    log::info!(
        "Catalog: {} messages, {} signals, {} periodic, {} skipped",
        stats.num_messages,
        stats.num_signals,
        stats.num_periodic,
        stats.num_skipped
    );

    let (sender, receiver) = open_transport(&config)?;
    let bus = open_bus(&config).await?;

    let bridge = Arc::new(Bridge::new(
        catalog,
        config.bridge.clone(),
        sender,
        Arc::clone(&bus),
    ));
    let handle = bridge
        .start(receiver)
        .await
        .context("Failed to start bridge")?;
    let cancel = handle.cancel_token();

    let broker = if config.broker.enabled {
        let listener = TcpListener::bind(&config.broker.listen)
            .await
            .with_context(|| format!("Failed to bind {}", config.broker.listen))?;
        Some(tokio::spawn(broker::serve(
            listener,
            Arc::clone(&bus),
            config.bridge.payload_format,
            cancel.clone(),
        )))
    } else {
        None
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for shutdown signal")?;
            log::info!("Shutdown requested");
        }
        _ = cancel.cancelled() => {}
    }

    handle.shutdown().await;
    if let Some(broker) = broker {
        if let Err(e) = broker.await {
            log::error!("Broker task failed: {}", e);
        }
    }

    let stats = serde_json::to_string_pretty(&bridge.stats())?;
    log::info!("Final statistics:\n{}", stats);

    Ok(())
}

async fn open_bus(config: &AppConfig) -> Result<Arc<dyn MessageBus>> {
    match config.bus.backend {
        BusBackend::Local => Ok(Arc::new(LocalBus::new())),
        BusBackend::Redis => open_redis_bus(&config.bus.redis_url).await,
    }
}

#[cfg(feature = "redis")]
async fn open_redis_bus(url: &str) -> Result<Arc<dyn MessageBus>> {
    let bus = cand_core::RedisBus::connect(url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", url))?;
    Ok(Arc::new(bus))
}

#[cfg(not(feature = "redis"))]
async fn open_redis_bus(url: &str) -> Result<Arc<dyn MessageBus>> {
    anyhow::bail!("Built without Redis support, cannot use {}", url)
}

type Transport = (Arc<dyn FrameSender>, Box<dyn FrameReceiver>);

#[cfg(feature = "socketcan")]
fn open_transport(config: &AppConfig) -> Result<Transport> {
    match &config.can.interface {
        Some(interface) => {
            let (sender, receiver) = cand_core::transport::socketcan::open(
                interface,
                config.bridge.frame_queue_capacity,
            )
            .with_context(|| format!("Failed to open CAN interface {}", interface))?;
            Ok((Arc::new(sender), Box::new(receiver)))
        }
        None => Ok(virtual_transport(config)),
    }
}

#[cfg(not(feature = "socketcan"))]
fn open_transport(config: &AppConfig) -> Result<Transport> {
    if let Some(interface) = &config.can.interface {
        log::warn!(
            "Built without SocketCAN support, ignoring interface {}",
            interface
        );
    }
    Ok(virtual_transport(config))
}

fn virtual_transport(config: &AppConfig) -> Transport {
    log::warn!("No CAN interface, frames go to an in-process virtual bus");
    let (sender, receiver) = VirtualBus::new(config.bridge.frame_queue_capacity).node();
    (Arc::new(sender), Box::new(receiver))
}

/// Initialize logging based on verbosity level
fn init_logging(verbose: u8, quiet: bool) {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    let level = if quiet {
        LevelFilter::Error
    } else {
        match verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{} {}] {}",
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
