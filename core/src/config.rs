//! Configuration options.
//!
//! The engine is configured from a TOML file with one section per
//! subsystem. All tunables travel by value in the built configuration, so
//! independent engines with different tunings can coexist in one process.
//!
//! ```toml
//! [flowtable]
//!     idle_timeout_ms = 300_000
//!     active_timeout_ms = 1_800_000
//!     max_flows = 100_000
//!
//! [export]
//!     rtt_min_samples = 3
//!
//! [interfaces]
//!     ifmap = [{ net = "10.0.0.0/8", ingress = 1, egress = 2 }]
//!     source_nets = ["10.0.0.0/8"]
//!     source_macs = ["02:00:00:00:00:01"]
//! ```

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::errors::QofError;
use crate::ifmap::{IfMap, MacList, NetList};
use crate::packet::MAC_ADDR_LENGTH;

/// Loads and validates a configuration file.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let config_str = fs::read_to_string(&path)
        .with_context(|| format!("reading config {}", path.as_ref().display()))?;
    let config: RuntimeConfig = toml::from_str(&config_str).context("parsing config")?;
    config.validate()?;
    Ok(config)
}

/// Returns the default configuration, for demonstration and tests.
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Flow table settings.
    #[serde(default)]
    pub flowtable: FlowTableConfig,

    /// Export settings.
    #[serde(default)]
    pub export: ExportConfig,

    /// Interface map and direction classification inputs.
    #[serde(default)]
    pub interfaces: InterfaceConfig,
}

impl RuntimeConfig {
    /// Rejects inconsistent settings before the engine starts.
    pub fn validate(&self) -> Result<(), QofError> {
        fn invalid(msg: &str) -> QofError {
            QofError::Config(msg.to_owned())
        }

        let ft = &self.flowtable;
        if ft.idle_timeout_ms == 0 || ft.active_timeout_ms == 0 {
            return Err(invalid("timeouts must be nonzero"));
        }
        if ft.idle_timeout_ms > ft.active_timeout_ms {
            return Err(invalid("idle timeout exceeds active timeout"));
        }
        if ft.rtx_scale == 0 {
            return Err(invalid("rtx_scale must be nonzero"));
        }
        if ft
            .rtx_scale
            .checked_mul(64)
            .map_or(true, |word| ft.rtx_span < word)
        {
            return Err(invalid("rtx_span must cover at least one bitmap word"));
        }
        if self.export.rtt_min_samples == 0 {
            return Err(invalid("rtt_min_samples must be at least 1"));
        }
        self.interfaces
            .build()
            .map(|_| ())
            .map_err(|e| QofError::Config(e.to_string()))
    }
}

/* --------------------------------------------------------------------------------- */

/// Flow table settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct FlowTableConfig {
    /// Maximum inter-packet gap before a flow is closed as idle, ms.
    /// Defaults to `300_000`.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Maximum flow lifetime before rollover into a continuation flow,
    /// ms. Defaults to `1_800_000`.
    #[serde(default = "default_active_timeout_ms")]
    pub active_timeout_ms: u64,

    /// Maximum number of concurrently tracked flows; `0` means unbounded.
    /// Defaults to `0`.
    #[serde(default = "default_max_flows")]
    pub max_flows: usize,

    /// Emit each biflow as two uniflow records. Defaults to `false`.
    #[serde(default)]
    pub uniflow: bool,

    /// SiLK compatibility: clamp exported counters to 32 bits and roll
    /// flows over before an octet counter overflows. Defaults to `false`.
    #[serde(default)]
    pub silk: bool,

    /// Capture MAC addresses from the first packet. Defaults to `false`.
    #[serde(default)]
    pub mac: bool,

    /// Export extended per-direction statistics. Defaults to `false`.
    #[serde(default)]
    pub stats: bool,

    /// Admit out-of-sequence packets without advancing the table clock
    /// instead of dropping them. Defaults to `false`.
    #[serde(default)]
    pub force_read_all: bool,

    /// Close UDP flows matching this port after one packet; `1` matches
    /// every port, `0` disables. Defaults to `0`.
    #[serde(default)]
    pub udp_uniflow_port: u16,

    /// Sequence span covered by the retransmission bitmap, bytes.
    /// Defaults to 4 MiB of in-flight sequence space.
    #[serde(default = "default_rtx_span")]
    pub rtx_span: u32,

    /// Bytes of sequence space per bitmap bit. Defaults to `128`.
    #[serde(default = "default_rtx_scale")]
    pub rtx_scale: u32,

    /// RTT sample ring capacity per direction; `0` disables RTT
    /// estimation. Defaults to `128`.
    #[serde(default = "default_rtt_ring_capacity")]
    pub rtt_ring_capacity: usize,
}

fn default_idle_timeout_ms() -> u64 {
    300_000
}

fn default_active_timeout_ms() -> u64 {
    1_800_000
}

fn default_max_flows() -> usize {
    0
}

fn default_rtx_span() -> u32 {
    4 * 1024 * 1024
}

fn default_rtx_scale() -> u32 {
    128
}

fn default_rtt_ring_capacity() -> usize {
    128
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        FlowTableConfig {
            idle_timeout_ms: default_idle_timeout_ms(),
            active_timeout_ms: default_active_timeout_ms(),
            max_flows: default_max_flows(),
            uniflow: false,
            silk: false,
            mac: false,
            stats: false,
            force_read_all: false,
            udp_uniflow_port: 0,
            rtx_span: default_rtx_span(),
            rtx_scale: default_rtx_scale(),
            rtt_ring_capacity: default_rtt_ring_capacity(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// Export settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ExportConfig {
    /// Minimum RTT sample count before per-direction RTT fields are
    /// emitted. Defaults to `3`.
    #[serde(default = "default_rtt_min_samples")]
    pub rtt_min_samples: u64,

    /// Rotation boundary for the export sink, ms of packet time; `0`
    /// disables rotation. Defaults to `0`.
    #[serde(default)]
    pub rotate_ms: u64,

    /// Interval between process statistics records, ms; `0` disables the
    /// periodic record. Defaults to `300_000`.
    #[serde(default = "default_stats_interval_ms")]
    pub stats_interval_ms: u64,
}

fn default_rtt_min_samples() -> u64 {
    3
}

fn default_stats_interval_ms() -> u64 {
    300_000
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            rtt_min_samples: default_rtt_min_samples(),
            rotate_ms: 0,
            stats_interval_ms: default_stats_interval_ms(),
        }
    }
}

/* --------------------------------------------------------------------------------- */

/// One interface map entry: a prefix annotated with interface numbers.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IfMapEntry {
    /// CIDR prefix.
    pub net: IpNet,
    /// Ingress interface number for matching source addresses; `0` skips.
    #[serde(default)]
    pub ingress: u8,
    /// Egress interface number for matching destination addresses; `0`
    /// skips.
    #[serde(default)]
    pub egress: u8,
}

/// Interface map and direction classification inputs.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct InterfaceConfig {
    /// Prefix-to-interface annotations.
    #[serde(default)]
    pub ifmap: Vec<IfMapEntry>,

    /// Prefixes classified as internal for flow direction.
    #[serde(default)]
    pub source_nets: Vec<IpNet>,

    /// MAC addresses of source-side interfaces, `aa:bb:cc:dd:ee:ff`.
    #[serde(default)]
    pub source_macs: Vec<String>,
}

impl InterfaceConfig {
    /// Expands the configured entries into their lookup structures.
    pub fn build(&self) -> Result<(IfMap, NetList, MacList)> {
        let mut ifmap = IfMap::default();
        for entry in &self.ifmap {
            match entry.net {
                IpNet::V4(net) => ifmap.add_v4(net, entry.ingress, entry.egress),
                IpNet::V6(net) => ifmap.add_v6(net, entry.ingress, entry.egress),
            }
        }

        let mut nets = NetList::default();
        for net in &self.source_nets {
            match net {
                IpNet::V4(net) => nets.add_v4(*net),
                IpNet::V6(net) => nets.add_v6(*net),
            }
        }

        let mut macs = MacList::default();
        for mac in &self.source_macs {
            macs.add(parse_mac(mac)?);
        }

        Ok((ifmap, nets, macs))
    }
}

fn parse_mac(s: &str) -> Result<[u8; MAC_ADDR_LENGTH]> {
    let mut mac = [0u8; MAC_ADDR_LENGTH];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts
            .next()
            .with_context(|| format!("malformed MAC address {:?}", s))?;
        *byte = u8::from_str_radix(part, 16)
            .with_context(|| format!("malformed MAC address {:?}", s))?;
    }
    if parts.next().is_some() {
        bail!("malformed MAC address {:?}", s);
    }
    Ok(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_config_defaults_valid() {
        default_config().validate().unwrap();
    }

    #[test]
    fn core_config_parse_toml() {
        let toml_str = r#"
            [flowtable]
            idle_timeout_ms = 60000
            active_timeout_ms = 120000
            max_flows = 1000
            uniflow = true

            [export]
            rtt_min_samples = 1

            [interfaces]
            ifmap = [{ net = "10.0.0.0/8", ingress = 1, egress = 2 }]
            source_nets = ["192.168.0.0/16"]
            source_macs = ["02:00:00:00:00:01"]
        "#;
        let config: RuntimeConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.flowtable.idle_timeout_ms, 60_000);
        assert!(config.flowtable.uniflow);
        assert_eq!(config.export.rtt_min_samples, 1);
        assert_eq!(config.interfaces.ifmap.len(), 1);
    }

    #[test]
    fn core_config_rejects_zero_timeout() {
        let mut config = default_config();
        config.flowtable.idle_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn core_config_rejects_inverted_timeouts() {
        let mut config = default_config();
        config.flowtable.idle_timeout_ms = 100;
        config.flowtable.active_timeout_ms = 50;
        assert!(config.validate().is_err());
    }

    #[test]
    fn core_config_rejects_bad_mac() {
        let mut config = default_config();
        config.interfaces.source_macs.push("zz:00".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn core_config_parse_mac() {
        assert_eq!(
            parse_mac("aa:bb:cc:dd:ee:ff").unwrap(),
            [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]
        );
        assert!(parse_mac("aa:bb").is_err());
        assert!(parse_mac("aa:bb:cc:dd:ee:ff:00").is_err());
    }
}
