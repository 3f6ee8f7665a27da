//! Corriente core — a clocked, graph-based streaming audio engine.
//!
//! The engine models sound as a graph of *nodes*, each owning one or more
//! mono [`streams`](stream) recomputed once per processing cycle by a central
//! [`Server`]. Construction arguments accept numbers, lists or other nodes
//! ([`Sig`]); list- and node-valued arguments drive *multichannel expansion*
//! (see [`sig`]), the rule that decides how many parallel voices a node
//! instantiates and how arguments wrap across them.
//!
//! # Core pieces
//!
//! - [`Server`] — lifecycle (`boot`/`start`/`stop`/`shutdown`), the per-cycle
//!   graph walk in dependency order, offline and realtime drivers, resampling
//!   brackets and the control→audio command queue.
//! - [`NodeBuilder`] / [`Unit`] — how node types plug in: a builder describes
//!   parameters, the server expands them into per-voice units.
//! - [`NodeHandle`] — the control-side face of a node: `out`, `play`, `stop`,
//!   `mix`, `get`, parameter and input swaps.
//! - [`table`] — fixed-length lookup buffers with analytic generators,
//!   file-backed construction, and the handle API for regeneration.
//! - [`InputFader`] — the click-free crossfade behind every hot-swappable
//!   input.
//! - [`backend`] — contracts for audio devices, render sinks, sound-file
//!   decoders and control-event transports (implemented in `corriente-io`).
//!
//! # Example
//!
//! ```rust,ignore
//! use corriente_core::{Driver, MemorySink, Server, ServerConfig};
//! use corriente_dsp::Sine;
//!
//! let mut server = Server::new(ServerConfig::default());
//! server.boot(Driver::offline(MemorySink::new(), 2.0))?;
//! let osc = server.add(Sine::new().freq([440.0, 443.0]).mul(0.2))?;
//! osc.mix(&mut server, 1)?.out(&mut server, 0, 1, 0.0, 0.0)?;
//! server.start()?; // renders two seconds into the sink
//! ```
//!
//! # Threading
//!
//! A single audio thread (device callback or offline worker) executes the
//! graph walk; nothing on that path blocks or allocates in steady state.
//! Control-side mutations cross over as commands applied atomically at the
//! start of the next cycle. Value peeks and the sample clock come back over
//! lock-free snapshots.

pub mod backend;
pub mod error;
pub mod fader;
pub mod node;
pub mod server;
pub mod sig;
pub mod stream;
pub mod table;

pub use backend::{
    AudioBackend, ControlEvent, DeviceInfo, DuplexCallback, EventMap, IoConfig, MemorySink,
    RenderSink, SoundDecoder, SoundInfo,
};
pub use error::{Error, Result};
pub use fader::InputFader;
pub use node::{NodeBuilder, NodeHandle, NodeId, Render, Unit, UnitError, UnitStatus};
pub use server::{BuildCtx, Driver, Server, ServerConfig, TableInfo};
pub use sig::{ParamSlot, Sig, expansion_len};
pub use stream::{StreamId, StreamPool};
pub use table::{
    CurveTable, HarmTable, NewTable, SegmentKind, SndTable, TableBuilder, TableData, TableHandle,
    TableId, TablePool, WinTable, Window, breakpoint_curve, harmonic_series,
};
