//! usbip-exportd
//!
//! Exports USB devices attached to this machine over the USB/IP protocol.
//! A remote host running the vhci importer attaches to a device and its
//! URBs are replayed against the real hardware here.

mod config;
mod engine;
mod net;
mod usb;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use usb::Registry;

#[derive(Parser, Debug)]
#[command(name = "usbip-exportd")]
#[command(author, version, about = "USB/IP export server - share local USB devices over TCP")]
#[command(long_about = "
Exports USB devices attached to this machine to a remote USB/IP importer
(the Linux vhci_hcd driver). One importer at a time; exports are rebuilt
from the attached hardware on every start.

EXAMPLES:
    # Export every attached device on the standard port
    usbip-exportd

    # Export only Brother devices, with debug logging
    usbip-exportd --filter '0x04f9:*' --log-level debug

    # Show what would be exported and exit
    usbip-exportd --list-devices

On the importing host:
    modprobe vhci-hcd
    usbip list -r <this-host>
    usbip attach -r <this-host> -b <busid>
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to the default location and exit
    #[arg(long)]
    save_config: bool,

    /// List exportable USB devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Listening port (overrides the configuration file)
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Additional VID:PID device filter (repeatable)
    #[arg(long, value_name = "VID:PID")]
    filter: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = config::ServerConfig::default();
        let path = config::ServerConfig::default_path();
        config.save(&path).context("failed to save configuration")?;
        println!("configuration saved to {}", path.display());
        return Ok(());
    }

    let mut config = match args.config {
        Some(ref path) => config::ServerConfig::load(Some(path.clone()))
            .context("failed to load configuration")?,
        None => config::ServerConfig::load_or_default(),
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.usb.filters.extend(args.filter.iter().cloned());

    let log_level = args.log_level.as_deref().unwrap_or(&config.server.log_level);
    setup_logging(log_level).context("failed to set up logging")?;

    info!("usbip-exportd v{}", env!("CARGO_PKG_VERSION"));

    let registry = Arc::new(Registry::new());
    let exported = usb::enumerate::register_attached_devices(&registry, &config.usb.filters)
        .context("device enumeration failed")?;

    if args.list_devices {
        list_devices(&registry);
        return Ok(());
    }
    if exported == 0 {
        info!("no exportable devices found; importers will see an empty list");
    }

    let serve = net::run(registry, &config.server.bind_addr, config.server.port);
    tokio::select! {
        result = serve => {
            if let Err(e) = &result {
                error!("listener failed: {e:#}");
            }
            result
        }
        _ = signal::ctrl_c() => {
            info!("received Ctrl+C, shutting down");
            Ok(())
        }
    }
}

fn list_devices(registry: &Registry) {
    let devices = registry.list();
    if devices.is_empty() {
        println!("No exportable USB devices found.");
        return;
    }
    println!("Exportable devices:\n");
    for device in devices {
        println!(
            "  {:<10} {:04x}:{:04x} bus {:03} dev {:03} speed {:?}",
            device.busid.to_string(),
            device.id_vendor,
            device.id_product,
            device.busnum,
            device.devnum,
            device.speed,
        );
        for (index, interface) in device.interfaces.iter().enumerate() {
            println!(
                "      if{index}: class {:02x}/{:02x} protocol {:02x}",
                interface.class, interface.subclass, interface.protocol
            );
        }
        println!();
    }
}
