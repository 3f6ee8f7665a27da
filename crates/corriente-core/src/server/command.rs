//! Control-thread commands applied by the engine at cycle boundaries.
//!
//! Every mutation of a live graph crosses the control/audio boundary as a
//! [`Command`] on an SPSC ring buffer, drained once at the start of each
//! processing cycle — updates are atomic per cycle, never torn mid-buffer.
//! Anything that needs heap storage (node entries, stream buffers, table
//! data) is allocated on the control thread and moved through the queue.

use crate::node::NodeId;
use crate::server::engine::NodeEntry;
use crate::sig::ParamSlot;
use crate::stream::StreamId;
use crate::table::{TableData, TableId};

/// Capacity of the control→audio command ring.
pub(crate) const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Output-bus routing of a root node.
#[derive(Clone, Copy, Debug)]
pub(crate) struct OutRouting {
    /// First output channel.
    pub channel: usize,
    /// Channel step between consecutive streams.
    pub increment: usize,
}

/// A single control mutation.
pub(crate) enum Command {
    /// Install a fully built node and its stream buffers.
    AddNode {
        id: NodeId,
        entry: NodeEntry,
        buffers: Vec<(StreamId, Vec<f32>)>,
    },
    /// Install a table.
    AddTable { id: TableId, data: TableData },
    /// Replace a table's contents (regeneration, resize, morph sources).
    ReplaceTable { id: TableId, data: TableData },
    /// (Re)activate a node. Delay and duration are in node-rate samples.
    Play {
        id: NodeId,
        delay: u64,
        dur: Option<u64>,
    },
    /// (Re)activate a node and route it to the output bus.
    Out {
        id: NodeId,
        routing: OutRouting,
        delay: u64,
        dur: Option<u64>,
    },
    /// Deactivate a node, fading over `fade` node-rate samples (0 = now).
    Stop { id: NodeId, fade: usize },
    /// Replace a named parameter's per-voice slots.
    SetParam {
        id: NodeId,
        name: String,
        slots: Vec<(usize, ParamSlot)>,
        add_deps: Vec<NodeId>,
    },
    /// Crossfade the primary input of each voice to a new slot.
    SwapInput {
        id: NodeId,
        slots: Vec<(usize, ParamSlot)>,
        fade: usize,
        add_deps: Vec<NodeId>,
    },
    /// Set the server's global amplitude.
    SetAmp(f32),
}
