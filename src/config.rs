use clap::Parser;
use color_eyre::eyre::eyre;
use std::net::{Ipv4Addr, SocketAddr};

use crate::header;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "TCP relay that disguises raw streams as an HTTP upgrade handshake",
    long_about = "wsrelay accepts HTTP-looking connections, reads the X-Real-Host \
header from the initial request, dials that destination, answers with a \
101 Switching Protocols response, and then relays raw bytes both ways."
)]
pub struct Cli {
    /// Bind address
    #[arg(short = 'b', long = "bind", default_value = "0.0.0.0")]
    pub bind: Ipv4Addr,

    /// Port to listen on
    #[arg(short = 'p', long = "port", default_value_t = 8080)]
    pub port: u16,

    /// Destination used when the preamble carries no X-Real-Host header
    #[arg(
        long = "default-host",
        default_value = "127.0.0.1:22",
        value_name = "HOST:PORT"
    )]
    pub default_host: String,
}

/// Relay configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub default_target: String,
}

impl RelayConfig {
    /// Create RelayConfig from CLI arguments
    pub fn from_cli(args: Cli) -> color_eyre::Result<Self> {
        if header::split_host_port(&args.default_host).is_none() {
            return Err(eyre!(
                "Invalid --default-host {:?}, expected host:port",
                args.default_host
            ));
        }

        Ok(Self {
            listen_addr: SocketAddr::from((args.bind, args.port)),
            default_target: args.default_host,
        })
    }
}
