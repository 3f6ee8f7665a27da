//! The per-cycle graph executor.
//!
//! [`Engine`] owns all runtime state the audio thread touches: node entries,
//! stream and table pools, the drained event map and the cached dependency
//! order. One call to [`render_cycle`](Engine::render_cycle) performs a full
//! processing cycle:
//!
//! 1. drain control commands, 2. drain external events, 3. capture duplex
//! input, 4. process every active node in dependency order (each node strictly
//! after its inputs), 5. sum root streams into the interleaved output scaled
//! by the global amplitude, 6. publish stream peeks, 7. advance the sample
//! clock.
//!
//! The executor never allocates in steady state: buffers travel through the
//! checkout scratch, the topological order is recomputed into persistent
//! scratch vectors only when the graph changes, and per-node failures degrade
//! to silence instead of unwinding.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::backend::{ControlEvent, EventMap};
use crate::node::{NodeId, Render, Unit, UnitStatus};
use crate::sig::ParamSlot;
use crate::stream::{PeekBuffer, StreamId, StreamPool};
use crate::table::TablePool;

use super::command::{Command, OutRouting};

/// Reserved registry capacity so steady-state node insertion does not grow
/// the slot vectors on the audio thread.
const NODE_CAPACITY: usize = 256;

/// One voice of a node at runtime.
pub(crate) struct UnitInstance {
    pub unit: Box<dyn Unit>,
    /// Output streams of this voice, in order.
    pub streams: Vec<StreamId>,
    pub mul: ParamSlot,
    pub add: ParamSlot,
}

/// Node lifecycle at runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PlayState {
    Playing,
    /// Fading out; counts down in node-rate samples.
    Stopping { fade_left: usize, fade_total: usize },
    /// Final buffer already produced and still readable by consumers this
    /// cycle; silenced and stopped at the start of the next cycle.
    Draining,
    Stopped,
}

/// Runtime record of one node.
pub(crate) struct NodeEntry {
    pub voices: Vec<UnitInstance>,
    /// Upstream nodes whose streams this node reads.
    pub deps: Vec<NodeId>,
    pub state: PlayState,
    /// Node-rate samples to wait before the play window opens.
    pub delay: u64,
    /// Length of the play window in node-rate samples; `None` = forever.
    pub dur: Option<u64>,
    /// Node-rate samples elapsed since the last (re)play.
    pub elapsed: u64,
    pub routing: Option<OutRouting>,
    /// Signed power-of-two rate exponent relative to the server rate.
    pub rate_exp: i8,
    /// Frames this node produces per cycle (`buffer_size` scaled by rate).
    pub frames: usize,
    pub control_only: bool,
}

/// The audio-thread side of the server.
pub(crate) struct Engine {
    nodes: Vec<Option<NodeEntry>>,
    pool: StreamPool,
    tables: TablePool,
    events: EventMap,
    cmd_rx: rtrb::Consumer<Command>,
    event_rx: crossbeam_channel::Receiver<ControlEvent>,
    /// Cached topological order (indices into `nodes`).
    order: Vec<usize>,
    order_dirty: bool,
    // Persistent scratch for order recomputation.
    in_degree: Vec<u32>,
    ready: Vec<usize>,
    dependents: Vec<Vec<usize>>,
    /// Scratch holding buffers checked out of the pool for the current voice.
    checkout: Vec<Vec<f32>>,
    peeks: Arc<PeekBuffer>,
    clock: Arc<AtomicU64>,
    amp: f32,
    sample_rate: f32,
    buffer_size: usize,
    channels: usize,
    input_channels: usize,
    /// Deinterleaved duplex input, one buffer per channel.
    input_scratch: Vec<Vec<f32>>,
}

impl Engine {
    pub(crate) fn new(
        sample_rate: f32,
        buffer_size: usize,
        channels: usize,
        input_channels: usize,
        amp: f32,
        cmd_rx: rtrb::Consumer<Command>,
        event_rx: crossbeam_channel::Receiver<ControlEvent>,
        peeks: Arc<PeekBuffer>,
        clock: Arc<AtomicU64>,
    ) -> Self {
        Self {
            nodes: Vec::with_capacity(NODE_CAPACITY),
            pool: StreamPool::with_capacity(NODE_CAPACITY * 2, buffer_size),
            tables: TablePool::default(),
            events: EventMap::default(),
            cmd_rx,
            event_rx,
            order: Vec::with_capacity(NODE_CAPACITY),
            order_dirty: false,
            in_degree: Vec::with_capacity(NODE_CAPACITY),
            ready: Vec::with_capacity(NODE_CAPACITY),
            dependents: Vec::with_capacity(NODE_CAPACITY),
            checkout: Vec::with_capacity(8),
            peeks,
            clock,
            amp,
            sample_rate,
            buffer_size,
            channels,
            input_channels,
            input_scratch: vec![vec![0.0; buffer_size]; input_channels],
        }
    }

    /// Runs one full processing cycle.
    ///
    /// `input` is one interleaved block of captured samples (empty when not
    /// in duplex mode); `output` is the interleaved output block of
    /// `buffer_size * channels` samples, overwritten entirely.
    pub(crate) fn render_cycle(&mut self, input: &[f32], output: &mut [f32]) {
        self.drain_commands();
        self.drain_events();
        if self.order_dirty {
            self.recompute_order();
        }
        self.capture_input(input);

        Self::process_nodes(
            &mut self.nodes,
            &self.order,
            &mut self.pool,
            &mut self.tables,
            &self.events,
            &self.input_scratch,
            &mut self.checkout,
            self.sample_rate,
        );

        self.sum_roots(output);
        self.publish_peeks();
        self.clock.fetch_add(self.buffer_size as u64, Ordering::Relaxed);
    }

    /// Applies every pending control command.
    pub(crate) fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.pop() {
            self.apply(cmd);
        }
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            self.events.set(event.channel, event.value as f32);
        }
    }

    fn capture_input(&mut self, input: &[f32]) {
        if self.input_channels == 0 {
            return;
        }
        let chans = self.input_channels;
        for (ch, buf) in self.input_scratch.iter_mut().enumerate() {
            for (i, sample) in buf.iter_mut().enumerate() {
                *sample = input.get(i * chans + ch).copied().unwrap_or(0.0);
            }
        }
    }

    /// Applies one command immediately.
    pub(crate) fn apply(&mut self, cmd: Command) {
        match cmd {
            Command::AddNode { id, entry, buffers } => {
                for (sid, buf) in buffers {
                    self.pool.insert(sid, buf);
                }
                let idx = id.index();
                if idx >= self.nodes.len() {
                    self.nodes.resize_with(idx + 1, || None);
                }
                self.nodes[idx] = Some(entry);
                self.order_dirty = true;
            }
            Command::AddTable { id, data } | Command::ReplaceTable { id, data } => {
                self.tables.insert(id, data);
            }
            Command::Play { id, delay, dur } => {
                if let Some(entry) = self.entry_mut(id) {
                    entry.state = PlayState::Playing;
                    entry.delay = delay;
                    entry.dur = dur;
                    entry.elapsed = 0;
                    for voice in &mut entry.voices {
                        voice.unit.reset();
                    }
                }
            }
            Command::Out {
                id,
                routing,
                delay,
                dur,
            } => {
                if let Some(entry) = self.entry_mut(id) {
                    entry.routing = Some(routing);
                    entry.state = PlayState::Playing;
                    entry.delay = delay;
                    entry.dur = dur;
                    entry.elapsed = 0;
                    for voice in &mut entry.voices {
                        voice.unit.reset();
                    }
                }
            }
            Command::Stop { id, fade } => {
                let idx = id.index();
                if fade == 0 {
                    self.deactivate(idx);
                } else if let Some(entry) = self.entry_mut(id)
                    && entry.state == PlayState::Playing
                {
                    entry.state = PlayState::Stopping {
                        fade_left: fade,
                        fade_total: fade,
                    };
                }
            }
            Command::SetParam {
                id,
                name,
                slots,
                add_deps,
            } => {
                if let Some(entry) = self.entry_mut(id) {
                    for (voice, slot) in slots {
                        let Some(instance) = entry.voices.get_mut(voice) else {
                            continue;
                        };
                        match name.as_str() {
                            "mul" => instance.mul = slot,
                            "add" => instance.add = slot,
                            other => {
                                if !instance.unit.set_param(other, slot) {
                                    tracing::warn!(node = %id, param = other, "unknown parameter ignored");
                                }
                            }
                        }
                    }
                    entry.deps.extend(add_deps);
                    self.order_dirty = true;
                }
            }
            Command::SwapInput {
                id,
                slots,
                fade,
                add_deps,
            } => {
                if let Some(entry) = self.entry_mut(id) {
                    for (voice, slot) in slots {
                        if let Some(instance) = entry.voices.get_mut(voice) {
                            instance.unit.swap_input(slot, fade);
                        }
                    }
                    entry.deps.extend(add_deps);
                    self.order_dirty = true;
                }
            }
            Command::SetAmp(amp) => self.amp = amp,
        }
    }

    fn entry_mut(&mut self, id: NodeId) -> Option<&mut NodeEntry> {
        self.nodes.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Stops a node immediately and silences its streams.
    fn deactivate(&mut self, idx: usize) {
        if let Some(Some(entry)) = self.nodes.get_mut(idx) {
            entry.state = PlayState::Stopped;
            for voice in &entry.voices {
                for &sid in &voice.streams {
                    self.pool.clear(sid);
                }
            }
        }
    }

    /// Kahn's algorithm over the dependency lists, into persistent scratch.
    fn recompute_order(&mut self) {
        let n = self.nodes.len();
        self.in_degree.clear();
        self.in_degree.resize(n, 0);
        if self.dependents.len() < n {
            self.dependents.resize_with(n, Vec::new);
        }
        for list in &mut self.dependents {
            list.clear();
        }

        for (idx, slot) in self.nodes.iter().enumerate() {
            let Some(entry) = slot else { continue };
            for dep in &entry.deps {
                let di = dep.index();
                if di < n && self.nodes[di].is_some() {
                    self.dependents[di].push(idx);
                    self.in_degree[idx] += 1;
                }
            }
        }

        self.ready.clear();
        for (idx, slot) in self.nodes.iter().enumerate() {
            if slot.is_some() && self.in_degree[idx] == 0 {
                self.ready.push(idx);
            }
        }

        self.order.clear();
        while let Some(idx) = self.ready.pop() {
            self.order.push(idx);
            for k in 0..self.dependents[idx].len() {
                let consumer = self.dependents[idx][k];
                self.in_degree[consumer] -= 1;
                if self.in_degree[consumer] == 0 {
                    self.ready.push(consumer);
                }
            }
        }
        // Cycles are rejected at the control side; a mismatch here means a
        // node was left out of the walk.
        debug_assert_eq!(
            self.order.len(),
            self.nodes.iter().filter(|n| n.is_some()).count()
        );
        self.order_dirty = false;
        tracing::debug!(nodes = self.order.len(), "dependency order recomputed");
    }

    /// Processes every active node in dependency order.
    ///
    /// Free function over disjoint engine fields so the borrow checker can
    /// see that node state, pools and scratch never alias.
    #[allow(clippy::too_many_arguments)]
    fn process_nodes(
        nodes: &mut [Option<NodeEntry>],
        order: &[usize],
        pool: &mut StreamPool,
        tables: &mut TablePool,
        events: &EventMap,
        input: &[Vec<f32>],
        checkout: &mut Vec<Vec<f32>>,
        sample_rate: f32,
    ) {
        for &idx in order {
            let Some(entry) = nodes.get_mut(idx).and_then(Option::as_mut) else {
                continue;
            };
            if entry.state == PlayState::Stopped {
                continue;
            }
            if entry.state == PlayState::Draining {
                Self::silence_entry(entry, pool);
                continue;
            }

            let frames = entry.frames;
            let delay = entry.delay;
            let dur = entry.dur;
            let elapsed = entry.elapsed;

            // Entirely before the play window: nothing to compute yet.
            if elapsed + frames as u64 <= delay {
                entry.elapsed += frames as u64;
                continue;
            }
            // Entirely past the window: deactivate.
            if let Some(d) = dur
                && elapsed >= delay + d
            {
                Self::silence_entry(entry, pool);
                continue;
            }

            let fade = match entry.state {
                PlayState::Stopping {
                    fade_left,
                    fade_total,
                } => Some((fade_left, fade_total)),
                _ => None,
            };
            let node_sr = sample_rate * rate_factor(entry.rate_exp);
            let mut all_done = !entry.voices.is_empty();

            for voice in &mut entry.voices {
                checkout.clear();
                for &sid in &voice.streams {
                    checkout.push(pool.take(sid));
                }

                let result = {
                    let mut rc = Render {
                        pool: &*pool,
                        tables: &mut *tables,
                        events,
                        input,
                        sample_rate: node_sr,
                        frames,
                    };
                    voice.unit.process(&mut rc, &mut checkout[..])
                };

                match result {
                    Ok(UnitStatus::Done) => {}
                    Ok(UnitStatus::Continue) => all_done = false,
                    Err(err) => {
                        all_done = false;
                        tracing::warn!(
                            node = idx,
                            error = %err.message,
                            "unit failed; silenced for this cycle"
                        );
                        for buf in checkout.iter_mut() {
                            let n = frames.min(buf.len());
                            buf[..n].fill(0.0);
                        }
                    }
                }

                // Post-scale, then mask to the play window and stop fade.
                let pool_ref = &*pool;
                for buf in checkout.iter_mut() {
                    if buf.is_empty() {
                        continue;
                    }
                    apply_post_scale(buf, frames, voice.mul, voice.add, pool_ref);
                    shape_window(buf, frames, elapsed, delay, dur, fade);
                }

                for (k, &sid) in voice.streams.iter().enumerate() {
                    pool.restore(sid, std::mem::take(&mut checkout[k]));
                }
                checkout.clear();
            }

            entry.elapsed += frames as u64;

            // Transitions keep the just-produced buffer intact for one more
            // cycle: consumers later in the walk still read it.
            if all_done {
                entry.state = PlayState::Draining;
                continue;
            }
            if let Some((fade_left, fade_total)) = fade {
                entry.state = if fade_left <= frames {
                    PlayState::Draining
                } else {
                    PlayState::Stopping {
                        fade_left: fade_left - frames,
                        fade_total,
                    }
                };
                continue;
            }
            if let Some(d) = dur
                && entry.elapsed >= delay + d
            {
                entry.state = PlayState::Draining;
            }
        }
    }

    fn silence_entry(entry: &mut NodeEntry, pool: &mut StreamPool) {
        entry.state = PlayState::Stopped;
        for voice in &entry.voices {
            for &sid in &voice.streams {
                pool.clear(sid);
            }
        }
    }

    /// Sums every root's streams into the interleaved output buffer.
    fn sum_roots(&mut self, output: &mut [f32]) {
        output.fill(0.0);
        let channels = self.channels;
        let frames = self.buffer_size;
        for slot in &self.nodes {
            let Some(entry) = slot else { continue };
            if entry.state == PlayState::Stopped || entry.control_only {
                continue;
            }
            let Some(routing) = entry.routing else {
                continue;
            };
            // Cross-rate nodes never route directly to the bus (rejected at
            // control time); guard anyway.
            if entry.rate_exp != 0 {
                continue;
            }
            let mut k = 0usize;
            for voice in &entry.voices {
                for &sid in &voice.streams {
                    let ch = (routing.channel + k * routing.increment) % channels;
                    let buf = self.pool.read(sid);
                    for i in 0..frames.min(buf.len()) {
                        output[i * channels + ch] += buf[i] * self.amp;
                    }
                    k += 1;
                }
            }
        }
    }

    fn publish_peeks(&self) {
        for slot in &self.nodes {
            let Some(entry) = slot else { continue };
            for voice in &entry.voices {
                for &sid in &voice.streams {
                    let first = self.pool.read(sid).first().copied().unwrap_or(0.0);
                    self.peeks.publish(sid, first);
                }
            }
        }
    }

    // --- Control-side access while the engine is reclaimed (not started) ---

    /// First sample of a stream's current buffer.
    pub(crate) fn stream_first(&self, sid: StreamId) -> f32 {
        self.pool.read(sid).first().copied().unwrap_or(0.0)
    }

    /// Copies one channel of a table.
    pub(crate) fn table_channel(&self, id: crate::table::TableId, chan: usize) -> Option<Vec<f32>> {
        self.tables.get(id).map(|t| t.channel(chan).to_vec())
    }
}

/// Rate multiplier for a signed power-of-two exponent.
#[inline]
pub(crate) fn rate_factor(exp: i8) -> f32 {
    if exp >= 0 {
        (1u32 << exp) as f32
    } else {
        1.0 / (1u32 << (-exp)) as f32
    }
}

#[inline]
fn apply_post_scale(
    buf: &mut [f32],
    frames: usize,
    mul: ParamSlot,
    add: ParamSlot,
    pool: &StreamPool,
) {
    let n = frames.min(buf.len());
    match (mul, add) {
        (ParamSlot::Fixed(m), ParamSlot::Fixed(a)) => {
            if m != 1.0 || a != 0.0 {
                for sample in &mut buf[..n] {
                    *sample = *sample * m + a;
                }
            }
        }
        _ => {
            for (i, sample) in buf[..n].iter_mut().enumerate() {
                *sample = *sample * mul.at(pool, i) + add.at(pool, i);
            }
        }
    }
}

/// Masks a buffer to the play window and applies the stop fade-out.
#[inline]
fn shape_window(
    buf: &mut [f32],
    frames: usize,
    elapsed: u64,
    delay: u64,
    dur: Option<u64>,
    fade: Option<(usize, usize)>,
) {
    let windowed = elapsed < delay || dur.is_some() || fade.is_some();
    if !windowed {
        return;
    }
    let n = frames.min(buf.len());
    for (i, sample) in buf[..n].iter_mut().enumerate() {
        let pos = elapsed + i as u64;
        let mut gain = if pos < delay { 0.0 } else { 1.0 };
        if let Some(d) = dur
            && pos >= delay + d
        {
            gain = 0.0;
        }
        if let Some((fade_left, fade_total)) = fade {
            let f = fade_left.saturating_sub(i) as f32 / fade_total as f32;
            gain *= f.min(1.0);
        }
        if gain != 1.0 {
            *sample *= gain;
        }
    }
}
