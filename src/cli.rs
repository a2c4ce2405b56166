//! Command-line surface (ambient), spec §6's CLI tables expressed with
//! `clap`'s derive API — grounded in
//! `examples/gouthamsk98-VAD-Sensor-Bridge/rust-udp-mqtt/src/config.rs`, the
//! only repo in the pack with a real `clap::Parser` surface (the teacher has
//! no CLI at all; it is GUI-configured).

use std::net::IpAddr;

use clap::{Parser, ValueEnum};

use crate::wire::Encoding;

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum EncodingArg {
    S16le,
    S32le,
    F32le,
    S24le,
    U8,
}

impl From<EncodingArg> for Encoding {
    fn from(value: EncodingArg) -> Self {
        match value {
            EncodingArg::S16le => Encoding::PcmS16Le,
            EncodingArg::S32le => Encoding::PcmS32Le,
            EncodingArg::F32le => Encoding::PcmF32Le,
            EncodingArg::S24le => Encoding::PcmS24Le,
            EncodingArg::U8 => Encoding::PcmU8,
        }
    }
}

/// `audiocast-server` command line.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Capture this host's audio output and stream it to connected players")]
pub struct ServerArgs {
    /// Bind address for RPC and UDP (default: auto-detect a private-range interface)
    #[arg(long)]
    pub bind: Option<IpAddr>,

    /// Port used for both RPC and UDP
    #[arg(long, default_value_t = 10120)]
    pub port: u16,

    #[arg(long, value_enum, default_value_t = EncodingArg::F32le)]
    pub encoding: EncodingArg,

    #[arg(long, default_value_t = 2, value_parser = clap::value_parser!(u8).range(1..=8))]
    pub channels: u8,

    #[arg(long, default_value_t = 48_000, value_parser = clap::value_parser!(u32).range(8_000..=384_000))]
    pub rate: u32,

    /// Increase log verbosity (repeatable: info -> debug -> trace)
    #[arg(short = 'V', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// `audiocast-client` command line.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Connect to an audiocast server and play its stream")]
pub struct ClientArgs {
    /// Server address
    #[arg(long)]
    pub server: IpAddr,

    #[arg(long, default_value_t = 10120)]
    pub server_port: u16,

    /// Local address to advertise (default: auto-detect)
    #[arg(long)]
    pub client_address: Option<IpAddr>,

    /// Local UDP port (0 => random in 49152..65535)
    #[arg(long, default_value_t = 0)]
    pub client_port: u16,

    #[arg(short = 'V', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Maps a repeated `-V` count onto a `tracing_subscriber::EnvFilter` spec,
/// honoring `RUST_LOG` first when set.
pub fn env_filter_for_verbosity(verbose: u8) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        };
        tracing_subscriber::EnvFilter::new(level)
    })
}

/// Auto-detects a bind address per spec §6: prefer a private-range (RFC
/// 1918) interface, fall back to the first non-loopback interface, then to
/// `0.0.0.0`.
pub fn auto_detect_bind_address() -> IpAddr {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(ifaces) => ifaces,
        Err(err) => {
            tracing::warn!(%err, "could not enumerate network interfaces, binding 0.0.0.0");
            return IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED);
        }
    };

    let candidates: Vec<IpAddr> = interfaces
        .into_iter()
        .filter(|i| !i.is_loopback())
        .map(|i| i.ip())
        .collect();

    candidates
        .iter()
        .find(|ip| is_private_range(ip))
        .or_else(|| candidates.first())
        .copied()
        .unwrap_or(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED))
}

fn is_private_range(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(_) => false,
    }
}

/// Resolves `--client-port 0` into a random ephemeral port in 49152..65535.
///
/// Draws randomness from `uuid::Uuid::new_v4()` rather than pulling in a
/// dedicated `rand` dependency for one call site.
pub fn resolve_client_port(requested: u16) -> u16 {
    if requested != 0 {
        return requested;
    }
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let raw = u16::from_be_bytes([bytes[0], bytes[1]]);
    const RANGE_START: u16 = 49_152;
    const RANGE_LEN: u16 = u16::MAX - RANGE_START; // 65535 - 49152, keeps the add below from overflowing
    RANGE_START + (raw % (RANGE_LEN + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_increasing_levels() {
        assert!(env_filter_for_verbosity(0).to_string().contains("info"));
        assert!(env_filter_for_verbosity(1).to_string().contains("debug"));
        assert!(env_filter_for_verbosity(2).to_string().contains("trace"));
    }

    #[test]
    fn resolve_client_port_keeps_explicit_port() {
        assert_eq!(resolve_client_port(5000), 5000);
    }

    #[test]
    fn resolve_client_port_randomizes_when_zero() {
        let port = resolve_client_port(0);
        assert!((49_152..=65_535).contains(&port));
    }
}
