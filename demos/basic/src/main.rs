//! Meters a synthetic TCP connection and prints the flow records as JSON
//! lines. Stands in for a real decoder feeding the engine.

use anyhow::Result;
use clap::Parser;

use qof_core::config::{default_config, load_config};
use qof_core::export::JsonLinesExporter;
use qof_core::packet::{
    IpInfo, IterSource, PacketInfo, TcpInfo, ACK, FIN, PSH, SYN, TCP_PROTOCOL,
};
use qof_core::{Engine, FlowKey};

#[derive(Parser, Debug)]
struct Args {
    /// Path to a TOML configuration file.
    #[clap(short, long)]
    config: Option<String>,
}

fn tcp(key: FlowKey, ptime: u64, seq: u32, ack: u32, flags: u8, datalen: u32) -> PacketInfo {
    PacketInfo {
        ptime,
        key,
        iplen: 40 + datalen,
        datalen,
        ipinfo: IpInfo { ttl: 64, ecn: 0 },
        tcpinfo: TcpInfo {
            seq,
            ack,
            flags,
            rwin: 29200,
            ..TcpInfo::default()
        },
        smac: [2, 0, 0, 0, 0, 1],
        dmac: [2, 0, 0, 0, 0, 2],
    }
}

/// One complete connection: handshake, a data segment each way, teardown.
fn synthetic_connection() -> Vec<PacketInfo> {
    let k = FlowKey::v4([192, 0, 2, 1], [198, 51, 100, 7], 47000, 443, TCP_PROTOCOL);
    let rk = k.reverse();
    vec![
        tcp(k, 0, 1000, 0, SYN, 0),
        tcp(rk, 40, 9000, 1001, SYN | ACK, 0),
        tcp(k, 80, 1001, 9001, ACK, 0),
        tcp(k, 100, 1001, 9001, ACK | PSH, 500),
        tcp(rk, 140, 9001, 1501, ACK | PSH, 1200),
        tcp(k, 180, 1501, 10201, ACK, 0),
        tcp(k, 200, 1501, 10201, FIN | ACK, 0),
        tcp(rk, 240, 10201, 1502, FIN | ACK, 0),
        tcp(k, 280, 1502, 10202, ACK, 0),
    ]
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };
    config.export.rtt_min_samples = 1;

    let exporter = JsonLinesExporter::new(std::io::stdout().lock());
    let mut engine = Engine::new(&config, exporter)?;
    engine.install_interrupt_handler()?;

    let mut source = IterSource::new(synthetic_connection());
    let stats = engine.run(&mut source)?;
    log::info!(
        "{} packets metered into {} flows",
        stats.packet_total_count,
        stats.exported_flow_total_count
    );
    Ok(())
}
