//! upnp-nat - command line control point for a UPnP gateway

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use upnp_nat::{
    DeviceDescription, Mapping, NatConfig, NatDevice, ProcessTeardownGuard, Protocol,
    RenewalScheduler, UpnpNatDevice,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "UPnP IGD port mapping client", long_about = None)]
struct Args {
    /// Device description URL reported by discovery (LOCATION header)
    #[arg(short, long)]
    location: String,

    /// Local address facing the gateway
    #[arg(long)]
    local: IpAddr,

    /// Control URL, skips fetching the description document
    #[arg(long, requires = "service_type")]
    control_url: Option<String>,

    /// Service type URN, used together with --control-url
    #[arg(long)]
    service_type: Option<String>,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the gateway's external IP address
    ExternalIp,
    /// List every mapping on the gateway
    List,
    /// Look up the mapping for one external port
    Get {
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,
        #[arg(long)]
        port: u16,
    },
    /// Create a mapping
    Add {
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,
        /// Local port
        #[arg(long)]
        port: u16,
        /// External port, defaults to the local port
        #[arg(long)]
        public_port: Option<u16>,
        /// Lease in seconds; 0 is permanent, omitted is a renewed session
        #[arg(long)]
        lifetime: Option<i32>,
        #[arg(long)]
        description: Option<String>,
        /// Keep renewing until Ctrl-C, then release
        #[arg(long)]
        hold: bool,
    },
    /// Delete a mapping
    Delete {
        #[arg(long, default_value = "TCP")]
        protocol: Protocol,
        /// External port
        #[arg(long)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    upnp_nat::init();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => NatConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => NatConfig::default(),
    };

    let description = match (&args.control_url, &args.service_type) {
        (Some(control_url), Some(service_type)) => {
            DeviceDescription::new(args.local, &args.location, control_url, service_type)?
        }
        _ => DeviceDescription::fetch(args.local, &args.location, config.request_timeout())
            .await
            .context("Failed to resolve gateway control endpoint")?,
    };
    let device = Arc::new(UpnpNatDevice::new(description, &config));
    println!("Using {}", device);

    match args.command {
        Command::ExternalIp => {
            let ip = device.get_external_ip().await?;
            println!("{}", ip);
        }
        Command::List => {
            let mappings = device.get_all_mappings().await?;
            if mappings.is_empty() {
                println!("No mappings");
            }
            for mapping in mappings {
                println!("{}", mapping);
            }
        }
        Command::Get { protocol, port } => {
            match device.get_specific_mapping(protocol, port).await? {
                Some(mapping) => println!("{}", mapping),
                None => println!("No {} mapping on port {}", protocol, port),
            }
        }
        Command::Add {
            protocol,
            port,
            public_port,
            lifetime,
            description,
            hold,
        } => {
            let mapping = Mapping::new(
                protocol,
                None,
                port,
                public_port.unwrap_or(port),
                lifetime.unwrap_or(Mapping::SESSION_LIFETIME),
                description.unwrap_or_else(|| config.default_description.clone()),
            )?;
            let created = device.create_port_map(mapping).await?;
            println!("Created {}", created);

            if hold {
                let scheduler = RenewalScheduler::start(
                    device.clone(),
                    config.renew_interval(),
                    config.renew_initial_delay(),
                );
                let guard = ProcessTeardownGuard::new(device.clone(), Some(scheduler));
                println!("Holding mapping, press Ctrl-C to release");
                guard.watch_ctrl_c().await?;
            }
        }
        Command::Delete { protocol, port } => {
            let mapping = match device.get_specific_mapping(protocol, port).await? {
                Some(mapping) => mapping,
                None => Mapping::new(protocol, None, port, port, 0, "")?,
            };
            device.delete_port_map(&mapping).await?;
            println!("Deleted {} mapping on port {}", protocol, port);
        }
    }

    Ok(())
}
