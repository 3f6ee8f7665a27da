//! Node abstractions: units, handles, and the per-cycle render context.
//!
//! A *node* is a unit of the audio graph owning one or more streams and a
//! per-cycle transfer function. Under the multichannel-expansion rule a node
//! is a set of *voices*: each voice is one [`Unit`] instance produced by a
//! [`NodeBuilder`], holding its own resolved parameter slots and writing a
//! fixed number of output streams per cycle (one for most nodes; spectral
//! units emit several).

use crate::backend::EventMap;
use crate::error::Result;
use crate::server::BuildCtx;
use crate::sig::{ParamSlot, Sig};
use crate::stream::{StreamId, StreamPool};
use crate::table::TablePool;

/// Unique identifier of a node in the engine.
///
/// Node ids are assigned sequentially and never reused within a server boot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Returns the raw numeric identifier.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Control-side handle to a constructed node.
///
/// Handles are cheap copies carrying the node's immutable facts: its id, its
/// stream count (fixed by expansion at construction) and whether it is a
/// control-only node. All operations go through the server.
#[derive(Clone, Copy, Debug)]
pub struct NodeHandle {
    id: NodeId,
    nstreams: usize,
    control_only: bool,
}

impl NodeHandle {
    pub(crate) fn new(id: NodeId, nstreams: usize, control_only: bool) -> Self {
        Self {
            id,
            nstreams,
            control_only,
        }
    }

    /// The node's id.
    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Number of streams this node owns. Immutable after construction.
    #[inline]
    pub fn nstreams(&self) -> usize {
        self.nstreams
    }

    /// Whether the node is control-only (routing it to the output is a no-op).
    #[inline]
    pub fn is_control_only(&self) -> bool {
        self.control_only
    }
}

/// Everything a unit may touch while computing one cycle.
pub struct Render<'a> {
    /// All stream buffers (this unit's own outputs are checked out and
    /// therefore read as silence — dependency order makes that unreachable).
    pub pool: &'a StreamPool,
    /// All tables, writable (recorders and morphers mutate them in-cycle).
    pub tables: &'a mut TablePool,
    /// Last value per external control-event channel, drained this cycle.
    pub events: &'a EventMap,
    /// Deinterleaved duplex input channels; empty when not in duplex mode.
    pub input: &'a [Vec<f32>],
    /// Sampling rate at this node's rate (server rate times its rate factor).
    pub sample_rate: f32,
    /// Frames to produce this cycle at this node's rate.
    pub frames: usize,
}

/// What a unit reports after computing a cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    /// Keep the node active.
    Continue,
    /// The unit finished its work (recorder full, envelope released); the
    /// node deactivates once every voice reports done.
    Done,
}

/// Failure inside a unit's per-cycle computation.
///
/// Never aborts the cycle: the engine silences the node's output for the
/// cycle and logs the message.
#[derive(Debug)]
pub struct UnitError {
    /// Human-readable description of the failure.
    pub message: String,
}

impl UnitError {
    /// Creates a unit error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// One voice of a node: the per-cycle transfer function over its inputs and
/// internal state.
///
/// Implementations must not block or allocate in [`process`](Unit::process);
/// all buffers and lookup structures are sized at construction.
pub trait Unit: Send {
    /// Computes one cycle into `outs` (one buffer per output stream of this
    /// voice, each `rc.frames` long).
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError>;

    /// Replaces a named parameter's slot. Returns `false` for unknown names.
    fn set_param(&mut self, _name: &str, _slot: ParamSlot) -> bool {
        false
    }

    /// Crossfades the unit's primary input to a new slot over `fade_samples`
    /// samples. No-op for units without a hot-swappable input.
    fn swap_input(&mut self, _slot: ParamSlot, _fade_samples: usize) {}

    /// Restores construction-time state (phase, counters, envelope stages).
    /// Called when the node is (re)played.
    fn reset(&mut self) {}
}

/// Recipe for a node: its expansion-participating parameters and a factory
/// for per-voice units.
///
/// The server drives expansion: it computes the voice count from
/// [`params`](NodeBuilder::params) plus `mul`/`add`, then calls
/// [`make_unit`](NodeBuilder::make_unit) once per voice with a build context
/// that resolves each [`Sig`] under the wrap rule.
pub trait NodeBuilder {
    /// The parameters participating in stream-count expansion, `mul`/`add`
    /// excluded (the server adds those itself).
    fn params(&self) -> Vec<&Sig>;

    /// Post-scale multiplier, audio-rate capable.
    fn mul(&self) -> &Sig;

    /// Post-scale offset, audio-rate capable.
    fn add(&self) -> &Sig;

    /// Output streams per voice. One for almost every node.
    fn outs_per_voice(&self) -> usize {
        1
    }

    /// Control-only nodes produce values for other nodes, never audio for the
    /// output bus; routing them out is accepted and ignored.
    fn is_control_only(&self) -> bool {
        false
    }

    /// Voice-count override for nodes that derive their layout from another
    /// node's stream structure instead of parameter expansion (spectral
    /// resynthesis, for example). `mul`/`add` still wrap across the fixed
    /// count.
    fn fixed_voices(&self) -> Option<usize> {
        None
    }

    /// Builds the unit for `voice`.
    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>>;
}

/// Round-robin down-mix unit.
///
/// Output stream `v` is the sum of input streams `i` with `i % voices == v`.
/// With `voices == 1` this is the plain sum of every input stream — the
/// standard device for collapsing multichannel expansion back down.
pub(crate) struct MixUnit {
    inputs: Vec<StreamId>,
}

impl MixUnit {
    pub(crate) fn new(inputs: Vec<StreamId>) -> Self {
        Self { inputs }
    }
}

impl Unit for MixUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let voices = outs.len();
        for out in outs.iter_mut() {
            out[..rc.frames].fill(0.0);
        }
        for (k, id) in self.inputs.iter().enumerate() {
            let src = rc.pool.read(*id);
            let out = &mut outs[k % voices];
            for i in 0..rc.frames.min(src.len()) {
                out[i] += src[i];
            }
        }
        Ok(UnitStatus::Continue)
    }
}
