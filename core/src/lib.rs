//! A passive TCP/IP flow meter.
//!
//! qof-core consumes a stream of timestamped, decoded packets and produces
//! bidirectional flow records annotated with passively measured TCP
//! performance indicators: sequence-space accounting across wraparound,
//! retransmission and reordering counts, sequence loss estimates,
//! round-trip time, receive-window dynamics, and ECN/option usage.
//!
//! The pipeline is single-threaded and cooperative: an [`Engine`] pulls
//! packets from a [`PacketSource`](packet::PacketSource), admits them to a
//! [`FlowTable`](flowtable::FlowTable) keyed by bidirectional five-tuple,
//! and hands closed flows to an [`Exporter`](export::Exporter). Link-layer
//! decoding, fragment reassembly, and the concrete export codec live
//! outside this crate; their interface contracts are [`packet`] and
//! [`export`].
//!
//! ```no_run
//! use qof_core::config::default_config;
//! use qof_core::export::JsonLinesExporter;
//! use qof_core::packet::IterSource;
//! use qof_core::Engine;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = default_config();
//!     let exporter = JsonLinesExporter::new(std::io::stdout().lock());
//!     let mut engine = Engine::new(&config, exporter)?;
//!     engine.install_interrupt_handler()?;
//!     // packets come from a decoder; replay an empty stream here
//!     let mut source = IterSource::new(vec![]);
//!     let stats = engine.run(&mut source)?;
//!     eprintln!("{} flows exported", stats.exported_flow_total_count);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dynamics;
pub mod errors;
pub mod export;
pub mod flowtable;
pub mod ifmap;
pub mod packet;
mod runtime;
pub mod stats;
pub mod utils;

pub use self::errors::QofError;
pub use self::flowtable::flow::{Flow, FlowEndReason};
pub use self::flowtable::flow_key::{AddrPair, FlowKey};
pub use self::packet::PacketInfo;
pub use self::runtime::{spawn_source, ChannelSource, Engine};
