//! The server: configuration, lifecycle, and the control-side graph API.
//!
//! A [`Server`] owns the processing [`Engine`] and drives it from one of two
//! drivers: a realtime [`AudioBackend`] whose device callback runs one cycle
//! per buffer, or an offline loop that renders as fast as possible into a
//! [`RenderSink`]. Lifecycle:
//!
//! ```text
//! NotBooted ──boot──▶ BootedStopped ──start──▶ Started
//!     ▲                    ▲  │                   │
//!     └─────shutdown───────┘  └──────stop─────────┘
//! ```
//!
//! Nodes and tables are built on the control thread, fully allocated, and
//! handed to the engine through the command queue; while the server is
//! started the engine is owned by the audio callback (or the offline worker)
//! and the control side communicates exclusively through the queue, the peek
//! buffer and the sample clock.

mod command;
pub(crate) mod engine;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::backend::{AudioBackend, ControlEvent, DuplexCallback, IoConfig, RenderSink};
use crate::error::{Error, Result};
use crate::fader::InputFader;
use crate::node::{MixUnit, NodeBuilder, NodeHandle, NodeId};
use crate::sig::{ParamSlot, Sig, expansion_len};
use crate::stream::{PeekBuffer, StreamId};
use crate::table::{TableBuilder, TableHandle, TableId};

use command::{COMMAND_QUEUE_CAPACITY, Command, OutRouting};
use engine::{Engine, NodeEntry, PlayState, UnitInstance, rate_factor};

/// Streams covered by the lock-free peek buffer. Streams past this many do
/// not publish peeks (their `get` reads 0 while the server is started).
const PEEK_CAPACITY: usize = 4096;

/// Server configuration, fixed while booted.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ServerConfig {
    /// Sampling rate in Hz.
    pub sample_rate: u32,
    /// Frames per processing cycle.
    pub buffer_size: usize,
    /// Output channel count.
    pub channels: usize,
    /// Input channel count used when `duplex` is set.
    pub input_channels: usize,
    /// Whether to capture audio input each cycle.
    pub duplex: bool,
    /// Global output amplitude.
    pub amp: f32,
    /// Optional output device name filter.
    pub output_device: Option<String>,
    /// Optional input device name filter.
    pub input_device: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            buffer_size: 256,
            channels: 2,
            input_channels: 1,
            duplex: false,
            amp: 1.0,
            output_device: None,
            input_device: None,
        }
    }
}

/// What drives the processing cycles.
pub enum Driver {
    /// Render `duration` seconds into a sink, as fast as possible.
    Offline {
        /// Destination for the interleaved output buffers.
        sink: Box<dyn RenderSink>,
        /// Seconds of audio to render.
        duration: f64,
    },
    /// A callback-based audio device drives the cycles in real time.
    Realtime(Box<dyn AudioBackend>),
}

impl Driver {
    /// Offline rendering into `sink` for `duration` seconds.
    pub fn offline(sink: impl RenderSink + 'static, duration: f64) -> Self {
        Driver::Offline {
            sink: Box::new(sink),
            duration,
        }
    }

    /// Realtime rendering through an audio backend.
    pub fn realtime(backend: impl AudioBackend + 'static) -> Self {
        Driver::Realtime(Box::new(backend))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    NotBooted,
    BootedStopped,
    Started,
}

/// Control-side record of a node.
struct NodeMeta {
    streams: Vec<StreamId>,
    nvoices: usize,
    rate_exp: i8,
    control_only: bool,
    deps: Vec<NodeId>,
}

/// Control-side facts about a table.
#[derive(Debug, Clone, Copy)]
pub struct TableInfo {
    /// Samples per channel.
    pub size: usize,
    /// Channel count.
    pub channels: usize,
    /// Duration in seconds.
    pub duration: f64,
}

impl TableInfo {
    /// Read frequency reproducing original pitch (`1 / duration`).
    pub fn rate(&self) -> f64 {
        if self.duration > 0.0 { 1.0 / self.duration } else { 0.0 }
    }
}

/// The central clocked scheduler.
pub struct Server {
    config: ServerConfig,
    state: RunState,
    engine: Arc<Mutex<Option<Engine>>>,
    cmd_tx: Option<rtrb::Producer<Command>>,
    event_tx: crossbeam_channel::Sender<ControlEvent>,
    event_rx: crossbeam_channel::Receiver<ControlEvent>,
    backend: Option<Box<dyn AudioBackend>>,
    sink: Option<Arc<Mutex<Box<dyn RenderSink>>>>,
    offline_total_cycles: u64,
    rendered_cycles: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    peeks: Arc<PeekBuffer>,
    clock: Arc<AtomicU64>,
    node_meta: Vec<Option<NodeMeta>>,
    table_meta: Vec<Option<TableInfo>>,
    next_node: u32,
    next_stream: u32,
    next_table: u32,
    rate_exp: i8,
    amp: f32,
}

impl Server {
    /// Creates a server with the given configuration. Nothing is allocated
    /// for processing until [`boot`](Self::boot).
    pub fn new(config: ServerConfig) -> Self {
        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let amp = config.amp;
        Self {
            config,
            state: RunState::NotBooted,
            engine: Arc::new(Mutex::new(None)),
            cmd_tx: None,
            event_tx,
            event_rx,
            backend: None,
            sink: None,
            offline_total_cycles: 0,
            rendered_cycles: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
            peeks: Arc::new(PeekBuffer::new(PEEK_CAPACITY)),
            clock: Arc::new(AtomicU64::new(0)),
            node_meta: Vec::new(),
            table_meta: Vec::new(),
            next_node: 0,
            next_stream: 0,
            next_table: 0,
            rate_exp: 0,
            amp,
        }
    }

    // --- Configuration ---

    /// Sampling rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    /// Frames per processing cycle.
    pub fn buffer_size(&self) -> usize {
        self.config.buffer_size
    }

    /// Output channel count.
    pub fn channels(&self) -> usize {
        self.config.channels
    }

    /// Changes the sampling rate. Rejected while booted.
    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        self.require_not_booted("change the sampling rate")?;
        self.config.sample_rate = sample_rate;
        Ok(())
    }

    /// Changes the buffer size. Rejected while booted.
    pub fn set_buffer_size(&mut self, buffer_size: usize) -> Result<()> {
        self.require_not_booted("change the buffer size")?;
        self.config.buffer_size = buffer_size;
        Ok(())
    }

    /// Changes the output channel count. Rejected while booted.
    pub fn set_channels(&mut self, channels: usize) -> Result<()> {
        self.require_not_booted("change the channel count")?;
        self.config.channels = channels;
        Ok(())
    }

    /// Sets the global output amplitude. Allowed in any state.
    pub fn set_amp(&mut self, amp: f32) -> Result<()> {
        self.amp = amp;
        self.config.amp = amp;
        if self.state != RunState::NotBooted {
            self.dispatch(Command::SetAmp(amp))?;
        }
        Ok(())
    }

    /// Global output amplitude.
    pub fn amp(&self) -> f32 {
        self.amp
    }

    /// A sender for external control events (MIDI/OSC adapters). Cloneable,
    /// usable from any thread; events drain into the engine once per cycle.
    pub fn event_sender(&self) -> crossbeam_channel::Sender<ControlEvent> {
        self.event_tx.clone()
    }

    /// Samples elapsed on the engine clock since boot.
    pub fn elapsed_samples(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Seconds elapsed on the engine clock since boot.
    pub fn elapsed_seconds(&self) -> f64 {
        self.elapsed_samples() as f64 / f64::from(self.config.sample_rate)
    }

    /// Whether the server is booted (engine allocated).
    pub fn is_booted(&self) -> bool {
        self.state != RunState::NotBooted
    }

    /// Whether processing cycles are running.
    pub fn is_started(&self) -> bool {
        self.state == RunState::Started
    }

    // --- Lifecycle ---

    /// Validates the configuration, allocates the engine and binds the
    /// driver.
    ///
    /// # Errors
    ///
    /// [`Error::Config`] for invalid configuration, [`Error::Device`] if the
    /// realtime backend cannot be opened (the server stays not booted),
    /// [`Error::State`] if already booted.
    pub fn boot(&mut self, driver: Driver) -> Result<()> {
        if self.state != RunState::NotBooted {
            return Err(Error::state("server is already booted; shutdown first"));
        }
        self.validate_config()?;

        let (cmd_tx, cmd_rx) = rtrb::RingBuffer::new(COMMAND_QUEUE_CAPACITY);
        let input_channels = if self.config.duplex {
            self.config.input_channels
        } else {
            0
        };
        self.clock.store(0, Ordering::Relaxed);
        let engine = Engine::new(
            self.config.sample_rate as f32,
            self.config.buffer_size,
            self.config.channels,
            input_channels,
            self.config.amp,
            cmd_rx,
            self.event_rx.clone(),
            Arc::clone(&self.peeks),
            Arc::clone(&self.clock),
        );
        *self.engine.lock() = Some(engine);

        match driver {
            Driver::Offline { sink, duration } => {
                if duration <= 0.0 {
                    *self.engine.lock() = None;
                    return Err(Error::config("offline render duration must be positive"));
                }
                let cycles = (duration * f64::from(self.config.sample_rate)
                    / self.config.buffer_size as f64)
                    .ceil() as u64;
                self.sink = Some(Arc::new(Mutex::new(sink)));
                self.offline_total_cycles = cycles;
                self.rendered_cycles.store(0, Ordering::Relaxed);
                tracing::info!(
                    duration,
                    cycles,
                    sample_rate = self.config.sample_rate,
                    "server booted for offline rendering"
                );
            }
            Driver::Realtime(mut backend) => {
                let io_config = IoConfig {
                    sample_rate: self.config.sample_rate,
                    buffer_size: self.config.buffer_size as u32,
                    output_channels: self.config.channels as u16,
                    input_channels: input_channels as u16,
                    output_device: self.config.output_device.clone(),
                    input_device: self.config.input_device.clone(),
                };
                let engine_ref = Arc::clone(&self.engine);
                let callback: DuplexCallback = Box::new(move |input, output| {
                    if let Some(mut guard) = engine_ref.try_lock() {
                        if let Some(eng) = guard.as_mut() {
                            eng.render_cycle(input, output);
                            return;
                        }
                    }
                    output.fill(0.0);
                });
                if let Err(err) = backend.open(&io_config, callback) {
                    *self.engine.lock() = None;
                    return Err(err);
                }
                tracing::info!(
                    backend = backend.name(),
                    sample_rate = self.config.sample_rate,
                    buffer_size = self.config.buffer_size,
                    channels = self.config.channels,
                    duplex = self.config.duplex,
                    "server booted on audio device"
                );
                self.backend = Some(backend);
            }
        }

        self.cmd_tx = Some(cmd_tx);
        self.state = RunState::BootedStopped;
        Ok(())
    }

    /// Begins processing cycles.
    ///
    /// Realtime: starts the device stream and returns. Offline: renders the
    /// configured duration synchronously, then returns with the server back
    /// in the stopped state.
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            RunState::NotBooted => {
                return Err(Error::state("server must be booted before start"));
            }
            RunState::Started => return Err(Error::state("server is already started")),
            RunState::BootedStopped => {}
        }
        if self.backend.is_some() {
            if let Some(backend) = self.backend.as_mut() {
                backend.start()?;
            }
            self.state = RunState::Started;
            tracing::info!("server started");
            Ok(())
        } else {
            self.state = RunState::Started;
            let result = self.run_offline();
            self.state = RunState::BootedStopped;
            result
        }
    }

    /// Begins offline rendering on a worker thread and returns immediately.
    ///
    /// Cancellation is cooperative: [`stop`](Self::stop) raises a flag
    /// checked once per cycle, and a later `start_nonblocking` resumes from
    /// where rendering left off.
    pub fn start_nonblocking(&mut self) -> Result<()> {
        match self.state {
            RunState::NotBooted => {
                return Err(Error::state("server must be booted before start"));
            }
            RunState::Started => return Err(Error::state("server is already started")),
            RunState::BootedStopped => {}
        }
        if self.backend.is_some() {
            return Err(Error::state(
                "non-blocking start applies to offline rendering only",
            ));
        }
        let Some(sink) = self.sink.as_ref().map(Arc::clone) else {
            return Err(Error::state("server was not booted with an offline driver"));
        };

        let engine = Arc::clone(&self.engine);
        let running = Arc::clone(&self.running);
        let rendered = Arc::clone(&self.rendered_cycles);
        let total = self.offline_total_cycles;
        let frames = self.config.buffer_size;
        let channels = self.config.channels;
        running.store(true, Ordering::Release);

        self.worker = Some(std::thread::spawn(move || {
            let mut out = vec![0.0f32; frames * channels];
            let mut guard = engine.lock();
            let Some(eng) = guard.as_mut() else { return };
            let mut sink = sink.lock();
            while running.load(Ordering::Acquire) && rendered.load(Ordering::Relaxed) < total {
                eng.render_cycle(&[], &mut out);
                if let Err(err) = sink.append(&out) {
                    tracing::error!(error = %err, "render sink failed; rendering aborted");
                    break;
                }
                rendered.fetch_add(1, Ordering::Relaxed);
            }
            tracing::debug!("offline render worker exited");
        }));
        self.state = RunState::Started;
        Ok(())
    }

    /// Waits for a non-blocking render to finish, then stops.
    pub fn wait(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
            self.state = RunState::BootedStopped;
            self.running.store(false, Ordering::Release);
        }
        Ok(())
    }

    /// Halts processing without deallocating anything; a later
    /// [`start`](Self::start) resumes without re-booting.
    pub fn stop(&mut self) -> Result<()> {
        if self.state != RunState::Started {
            return Err(Error::state("server is not started"));
        }
        if let Some(worker) = self.worker.take() {
            self.running.store(false, Ordering::Release);
            let _ = worker.join();
        } else if let Some(backend) = self.backend.as_mut() {
            backend.stop()?;
        }
        self.state = RunState::BootedStopped;
        // Apply anything still queued so direct access sees current state.
        if let Some(engine) = self.engine.lock().as_mut() {
            engine.drain_commands();
        }
        tracing::info!("server stopped");
        Ok(())
    }

    /// Releases the driver and drops the engine; every node and table handle
    /// becomes invalid. The server returns to the not-booted state and may
    /// be booted again with a fresh configuration.
    pub fn shutdown(&mut self) -> Result<()> {
        if self.state == RunState::Started {
            self.stop()?;
        }
        if let Some(mut backend) = self.backend.take() {
            backend.close()?;
        }
        if let Some(sink) = self.sink.take() {
            sink.lock().finalize()?;
        }
        *self.engine.lock() = None;
        self.cmd_tx = None;
        self.node_meta.clear();
        self.table_meta.clear();
        self.next_node = 0;
        self.next_stream = 0;
        self.next_table = 0;
        self.rate_exp = 0;
        self.offline_total_cycles = 0;
        self.rendered_cycles.store(0, Ordering::Relaxed);
        self.clock.store(0, Ordering::Relaxed);
        self.state = RunState::NotBooted;
        tracing::info!("server shut down");
        Ok(())
    }

    // --- Resampling brackets ---

    /// Opens a resampling block: nodes built until
    /// [`end_resampling_block`](Self::end_resampling_block) run at
    /// `sample_rate * factor`. `factor` is a signed power of two with
    /// magnitude ≥ 2; negative values downsample.
    pub fn begin_resampling_block(&mut self, factor: i32) -> Result<()> {
        self.require_booted("open a resampling block")?;
        if self.rate_exp != 0 {
            return Err(Error::state("already inside a resampling block"));
        }
        let magnitude = factor.unsigned_abs();
        if magnitude < 2 || !magnitude.is_power_of_two() {
            return Err(Error::config(
                "resampling factor must be a signed power of two with magnitude >= 2",
            ));
        }
        let exp = magnitude.trailing_zeros() as i8;
        let exp = if factor < 0 { -exp } else { exp };
        // Verify the scaled buffer length is an exact, non-zero frame count.
        self.frames_for(exp)?;
        self.rate_exp = exp;
        tracing::debug!(factor, "resampling block opened");
        Ok(())
    }

    /// Closes the current resampling block.
    pub fn end_resampling_block(&mut self) -> Result<()> {
        if self.rate_exp == 0 {
            return Err(Error::state("no resampling block is open"));
        }
        self.rate_exp = 0;
        Ok(())
    }

    /// Frames per cycle for a node at rate exponent `exp`.
    fn frames_for(&self, exp: i8) -> Result<usize> {
        let base = self.config.buffer_size;
        if exp >= 0 {
            Ok(base << exp)
        } else {
            let div = 1usize << (-exp) as usize;
            if base % div != 0 || base / div == 0 {
                return Err(Error::config(
                    "buffer size is not divisible by the downsampling factor",
                ));
            }
            Ok(base / div)
        }
    }

    // --- Node construction ---

    /// Builds a node from a [`NodeBuilder`], running multichannel expansion
    /// over its parameters (plus `mul`/`add`), and activates it.
    pub fn add<B: NodeBuilder>(&mut self, builder: B) -> Result<NodeHandle> {
        self.require_booted("create nodes")?;
        let outs = builder.outs_per_voice();
        if outs == 0 {
            return Err(Error::config("node must produce at least one stream"));
        }
        let params = builder.params();
        let mut fan: Vec<&Sig> = params;
        fan.push(builder.mul());
        fan.push(builder.add());
        let nvoices = match builder.fixed_voices() {
            Some(n) => {
                if n == 0 {
                    return Err(Error::config("node must have at least one voice"));
                }
                // Arguments still validate (empty lists fail fast).
                expansion_len(&fan)?;
                n
            }
            None => expansion_len(&fan)?,
        };

        let rate_exp = self.rate_exp;
        let frames = self.frames_for(rate_exp)?;
        let mut deps: Vec<NodeId> = Vec::new();
        let mut voices = Vec::with_capacity(nvoices);
        let mut buffers = Vec::with_capacity(nvoices * outs);

        for voice in 0..nvoices {
            let (unit, mul, add) = {
                let mut ctx = BuildCtx {
                    server: self,
                    deps: &mut deps,
                    rate_exp,
                    frames,
                };
                let unit = builder.make_unit(&mut ctx, voice)?;
                let mul = ctx.slot(builder.mul(), voice)?;
                let add = ctx.slot(builder.add(), voice)?;
                (unit, mul, add)
            };
            let mut streams = Vec::with_capacity(outs);
            for _ in 0..outs {
                let sid = StreamId(self.next_stream);
                self.next_stream += 1;
                streams.push(sid);
                buffers.push((sid, vec![0.0f32; frames]));
            }
            voices.push(UnitInstance {
                unit,
                streams,
                mul,
                add,
            });
        }

        let id = NodeId(self.next_node);
        self.next_node += 1;
        let control_only = builder.is_control_only();
        let flat_streams: Vec<StreamId> = voices
            .iter()
            .flat_map(|v| v.streams.iter().copied())
            .collect();
        let nstreams = flat_streams.len();

        self.store_meta(
            id,
            NodeMeta {
                streams: flat_streams,
                nvoices,
                rate_exp,
                control_only,
                deps: deps.clone(),
            },
        );

        let entry = NodeEntry {
            voices,
            deps,
            state: PlayState::Playing,
            delay: 0,
            dur: None,
            elapsed: 0,
            routing: None,
            rate_exp,
            frames,
            control_only,
        };
        self.dispatch(Command::AddNode {
            id,
            entry,
            buffers,
        })?;
        tracing::debug!(node = %id, voices = nvoices, streams = nstreams, "node created");
        Ok(NodeHandle::new(id, nstreams, control_only))
    }

    // --- Node operations (reached through NodeHandle) ---

    pub(crate) fn node_play(&mut self, handle: &NodeHandle, dur: f64, delay: f64) -> Result<()> {
        let (delay_samps, dur_samps) = self.window_samples(handle, dur, delay)?;
        self.dispatch(Command::Play {
            id: handle.id(),
            delay: delay_samps,
            dur: dur_samps,
        })
    }

    pub(crate) fn node_out(
        &mut self,
        handle: &NodeHandle,
        channel: usize,
        increment: usize,
        dur: f64,
        delay: f64,
    ) -> Result<()> {
        let meta = self.meta(handle.id())?;
        // Control-only nodes accept out() silently so call chains never have
        // to care — they just keep playing.
        if meta.control_only {
            return Ok(());
        }
        if meta.rate_exp != 0 {
            return Err(Error::config(
                "node runs inside a resampling block; resample it to the server rate before routing out",
            ));
        }
        let (delay_samps, dur_samps) = self.window_samples(handle, dur, delay)?;
        self.dispatch(Command::Out {
            id: handle.id(),
            routing: OutRouting { channel, increment },
            delay: delay_samps,
            dur: dur_samps,
        })
    }

    pub(crate) fn node_stop(&mut self, handle: &NodeHandle, wait: f64) -> Result<()> {
        let rate_exp = self.meta(handle.id())?.rate_exp;
        let node_sr = f64::from(self.config.sample_rate) * f64::from(rate_factor(rate_exp));
        let fade = (wait.max(0.0) * node_sr).round() as usize;
        self.dispatch(Command::Stop {
            id: handle.id(),
            fade,
        })
    }

    pub(crate) fn node_mix(&mut self, handle: &NodeHandle, voices: usize) -> Result<NodeHandle> {
        self.require_booted("create nodes")?;
        if voices == 0 {
            return Err(Error::config("mix needs at least one output stream"));
        }
        let meta = self.meta(handle.id())?;
        if meta.rate_exp != self.rate_exp {
            return Err(Error::config(
                "rate mismatch: mix input runs at a different rate; insert a Resample node",
            ));
        }
        let inputs = meta.streams.clone();
        let frames = self.frames_for(self.rate_exp)?;

        let mut streams = Vec::with_capacity(voices);
        let mut buffers = Vec::with_capacity(voices);
        for _ in 0..voices {
            let sid = StreamId(self.next_stream);
            self.next_stream += 1;
            streams.push(sid);
            buffers.push((sid, vec![0.0f32; frames]));
        }

        let id = NodeId(self.next_node);
        self.next_node += 1;
        self.store_meta(
            id,
            NodeMeta {
                streams: streams.clone(),
                nvoices: 1,
                rate_exp: self.rate_exp,
                control_only: false,
                deps: vec![handle.id()],
            },
        );
        let entry = NodeEntry {
            voices: vec![UnitInstance {
                unit: Box::new(MixUnit::new(inputs)),
                streams,
                mul: ParamSlot::Fixed(1.0),
                add: ParamSlot::Fixed(0.0),
            }],
            deps: vec![handle.id()],
            state: PlayState::Playing,
            delay: 0,
            dur: None,
            elapsed: 0,
            routing: None,
            rate_exp: self.rate_exp,
            frames,
            control_only: false,
        };
        self.dispatch(Command::AddNode {
            id,
            entry,
            buffers,
        })?;
        tracing::debug!(node = %id, voices, "mix node created");
        Ok(NodeHandle::new(id, voices, false))
    }

    pub(crate) fn node_get(&self, handle: &NodeHandle, stream: usize) -> f32 {
        let Ok(meta) = self.meta(handle.id()) else {
            return 0.0;
        };
        let Some(&sid) = meta.streams.get(stream) else {
            return 0.0;
        };
        if self.state == RunState::Started {
            self.peeks.read(sid)
        } else {
            self.engine
                .lock()
                .as_ref()
                .map_or(0.0, |eng| eng.stream_first(sid))
        }
    }

    pub(crate) fn node_get_all(&self, handle: &NodeHandle) -> Vec<f32> {
        (0..handle.nstreams())
            .map(|k| self.node_get(handle, k))
            .collect()
    }

    pub(crate) fn node_set_param(
        &mut self,
        handle: &NodeHandle,
        name: &str,
        sig: Sig,
    ) -> Result<()> {
        let (slots, add_deps) = self.resolve_voice_slots(handle, &sig)?;
        self.extend_deps(handle.id(), &add_deps);
        self.dispatch(Command::SetParam {
            id: handle.id(),
            name: name.to_string(),
            slots,
            add_deps,
        })
    }

    pub(crate) fn node_set_input(
        &mut self,
        handle: &NodeHandle,
        sig: Sig,
        fadetime: f64,
    ) -> Result<()> {
        let (slots, add_deps) = self.resolve_voice_slots(handle, &sig)?;
        let rate_exp = self.meta(handle.id())?.rate_exp;
        let node_sr = f64::from(self.config.sample_rate) * f64::from(rate_factor(rate_exp));
        let fade = (fadetime.max(0.0) * node_sr).round() as usize;
        self.extend_deps(handle.id(), &add_deps);
        self.dispatch(Command::SwapInput {
            id: handle.id(),
            slots,
            fade,
            add_deps,
        })
    }

    // --- Tables ---

    /// Builds a table and installs it in the engine.
    pub fn add_table<B: TableBuilder>(&mut self, builder: B) -> Result<TableHandle> {
        self.require_booted("create tables")?;
        let data = builder.build(self.config.sample_rate as f32)?;
        let id = TableId(self.next_table);
        self.next_table += 1;
        self.store_table_meta(
            id,
            TableInfo {
                size: data.size(),
                channels: data.channels(),
                duration: data.duration(),
            },
        );
        self.dispatch(Command::AddTable { id, data })?;
        tracing::debug!(table = id.index(), "table created");
        Ok(TableHandle { id })
    }

    /// Regenerates a table's contents from a builder.
    pub fn table_replace<B: TableBuilder>(
        &mut self,
        handle: &TableHandle,
        builder: B,
    ) -> Result<()> {
        self.table_info(handle)?;
        let data = builder.build(self.config.sample_rate as f32)?;
        self.store_table_meta(
            handle.id,
            TableInfo {
                size: data.size(),
                channels: data.channels(),
                duration: data.duration(),
            },
        );
        self.dispatch(Command::ReplaceTable {
            id: handle.id,
            data,
        })
    }

    /// Reallocates a table to `size` samples per channel, erasing contents.
    pub fn table_resize(&mut self, handle: &TableHandle, size: usize) -> Result<()> {
        let info = self.table_info(handle)?;
        let duration = size as f64 / f64::from(self.config.sample_rate);
        let data = crate::table::TableData::silent(size, info.channels, duration)?;
        self.store_table_meta(
            handle.id,
            TableInfo {
                size,
                channels: info.channels,
                duration,
            },
        );
        self.dispatch(Command::ReplaceTable {
            id: handle.id,
            data,
        })
    }

    /// Control-side facts about a table.
    pub fn table_info(&self, handle: &TableHandle) -> Result<TableInfo> {
        self.table_meta
            .get(handle.id.index())
            .and_then(|m| *m)
            .ok_or_else(|| Error::config("unknown table (was the server shut down?)"))
    }

    /// Copies one channel of a table. Only available while stopped.
    pub fn table_samples(&self, handle: &TableHandle, chan: usize) -> Result<Vec<f32>> {
        if self.state == RunState::Started {
            return Err(Error::state(
                "stop the server before copying table contents",
            ));
        }
        self.engine
            .lock()
            .as_ref()
            .and_then(|eng| eng.table_channel(handle.id, chan))
            .ok_or_else(|| Error::config("unknown table (was the server shut down?)"))
    }

    // --- Internal helpers ---

    fn validate_config(&self) -> Result<()> {
        if self.config.sample_rate == 0 {
            return Err(Error::config("sampling rate must be greater than zero"));
        }
        if self.config.buffer_size == 0 {
            return Err(Error::config("buffer size must be greater than zero"));
        }
        if self.config.channels == 0 {
            return Err(Error::config("channel count must be at least one"));
        }
        if self.config.duplex && self.config.input_channels == 0 {
            return Err(Error::config("duplex mode needs at least one input channel"));
        }
        Ok(())
    }

    fn run_offline(&mut self) -> Result<()> {
        let engine_arc = Arc::clone(&self.engine);
        let mut guard = engine_arc.lock();
        let engine = guard
            .as_mut()
            .ok_or_else(|| Error::state("engine is missing"))?;
        let sink_arc = self
            .sink
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| Error::state("server was not booted with an offline driver"))?;
        let mut sink = sink_arc.lock();

        let mut out = vec![0.0f32; self.config.buffer_size * self.config.channels];
        let total = self.offline_total_cycles;
        while self.rendered_cycles.load(Ordering::Relaxed) < total {
            engine.render_cycle(&[], &mut out);
            sink.append(&out)?;
            self.rendered_cycles.fetch_add(1, Ordering::Relaxed);
        }
        tracing::info!(cycles = total, "offline render complete");
        Ok(())
    }

    fn require_booted(&self, action: &str) -> Result<()> {
        if self.state == RunState::NotBooted {
            return Err(Error::state(format!(
                "server must be booted to {action}"
            )));
        }
        Ok(())
    }

    fn require_not_booted(&self, action: &str) -> Result<()> {
        if self.state != RunState::NotBooted {
            return Err(Error::state(format!(
                "shutdown the server to {action}"
            )));
        }
        Ok(())
    }

    fn dispatch(&mut self, cmd: Command) -> Result<()> {
        if self.state == RunState::Started {
            let tx = self
                .cmd_tx
                .as_mut()
                .ok_or_else(|| Error::state("command queue is missing"))?;
            tx.push(cmd)
                .map_err(|_| Error::state("command queue is full"))?;
        } else if let Some(engine) = self.engine.lock().as_mut() {
            engine.apply(cmd);
        }
        Ok(())
    }

    fn meta(&self, id: NodeId) -> Result<&NodeMeta> {
        self.node_meta
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::config("unknown node (was the server shut down?)"))
    }

    fn store_meta(&mut self, id: NodeId, meta: NodeMeta) {
        let idx = id.index();
        if idx >= self.node_meta.len() {
            self.node_meta.resize_with(idx + 1, || None);
        }
        self.node_meta[idx] = Some(meta);
    }

    fn store_table_meta(&mut self, id: TableId, info: TableInfo) {
        let idx = id.index();
        if idx >= self.table_meta.len() {
            self.table_meta.resize_with(idx + 1, || None);
        }
        self.table_meta[idx] = Some(info);
    }

    fn extend_deps(&mut self, id: NodeId, add: &[NodeId]) {
        if let Some(Some(meta)) = self.node_meta.get_mut(id.index()) {
            meta.deps.extend_from_slice(add);
        }
    }

    /// Resolves a signal for every voice of a node, rejecting dependency
    /// cycles.
    fn resolve_voice_slots(
        &self,
        handle: &NodeHandle,
        sig: &Sig,
    ) -> Result<(Vec<(usize, ParamSlot)>, Vec<NodeId>)> {
        let meta = self.meta(handle.id())?;
        let nvoices = meta.nvoices;
        let rate_exp = meta.rate_exp;
        let mut deps = Vec::new();
        let mut slots = Vec::with_capacity(nvoices);
        for voice in 0..nvoices {
            let slot = self.resolve_slot(sig, voice, rate_exp, &mut deps)?;
            slots.push((voice, slot));
        }
        for dep in &deps {
            if *dep == handle.id() || self.depends_on(*dep, handle.id()) {
                return Err(Error::config(
                    "assignment would create a dependency cycle between nodes",
                ));
            }
        }
        deps.dedup();
        Ok((slots, deps))
    }

    fn resolve_slot(
        &self,
        sig: &Sig,
        voice: usize,
        rate_exp: i8,
        deps: &mut Vec<NodeId>,
    ) -> Result<ParamSlot> {
        match sig {
            Sig::Num(value) => Ok(ParamSlot::Fixed(*value as f32)),
            Sig::List(values) => {
                if values.is_empty() {
                    return Err(Error::config("parameter cannot be empty"));
                }
                Ok(ParamSlot::Fixed(values[voice % values.len()] as f32))
            }
            Sig::Node(other) => {
                let meta = self.meta(other.id())?;
                if meta.rate_exp != rate_exp {
                    return Err(Error::config(
                        "rate mismatch: input runs at a different rate; insert a Resample node",
                    ));
                }
                let sid = meta.streams[voice % meta.streams.len()];
                deps.push(other.id());
                Ok(ParamSlot::Stream(sid))
            }
        }
    }

    /// Whether `a` transitively depends on `b` (control-side mirror).
    fn depends_on(&self, a: NodeId, b: NodeId) -> bool {
        let mut stack = vec![a];
        let mut visited = vec![false; self.node_meta.len()];
        while let Some(current) = stack.pop() {
            if current == b {
                return true;
            }
            let idx = current.index();
            if idx >= visited.len() || visited[idx] {
                continue;
            }
            visited[idx] = true;
            if let Some(Some(meta)) = self.node_meta.get(idx) {
                stack.extend(meta.deps.iter().copied());
            }
        }
        false
    }

    fn window_samples(
        &self,
        handle: &NodeHandle,
        dur: f64,
        delay: f64,
    ) -> Result<(u64, Option<u64>)> {
        let rate_exp = self.meta(handle.id())?.rate_exp;
        let node_sr = f64::from(self.config.sample_rate) * f64::from(rate_factor(rate_exp));
        let delay_samps = (delay.max(0.0) * node_sr).round() as u64;
        let dur_samps = if dur > 0.0 {
            Some((dur * node_sr).round() as u64)
        } else {
            None
        };
        Ok((delay_samps, dur_samps))
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.state == RunState::Started {
            let _ = self.stop();
        }
    }
}

/// Context handed to [`NodeBuilder::make_unit`] for one voice.
///
/// Resolves [`Sig`] arguments to per-voice [`ParamSlot`]s under the wrap
/// rule, records stream dependencies and answers sizing questions.
pub struct BuildCtx<'a> {
    server: &'a Server,
    deps: &'a mut Vec<NodeId>,
    rate_exp: i8,
    frames: usize,
}

impl BuildCtx<'_> {
    /// Sampling rate at the node's own rate.
    pub fn sample_rate(&self) -> f32 {
        self.server.config.sample_rate as f32 * rate_factor(self.rate_exp)
    }

    /// The server's base sampling rate.
    pub fn server_sample_rate(&self) -> f32 {
        self.server.config.sample_rate as f32
    }

    /// Frames this node produces per cycle.
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Output channel count of the server.
    pub fn channels(&self) -> usize {
        self.server.config.channels
    }

    /// Resolves an argument to this voice's slot (wrap rule), recording the
    /// dependency if it is a node.
    pub fn slot(&mut self, sig: &Sig, voice: usize) -> Result<ParamSlot> {
        self.server.resolve_slot(sig, voice, self.rate_exp, self.deps)
    }

    /// Resolves a hot-swappable input to a steady [`InputFader`].
    pub fn fader(&mut self, sig: &Sig, voice: usize) -> Result<InputFader> {
        Ok(InputFader::steady(self.slot(sig, voice)?))
    }

    /// Resolves an argument across a resampling boundary, returning the slot
    /// together with the source node's rate exponent and frame count. Only
    /// rate-converter nodes should need this.
    pub fn slot_any_rate(&mut self, sig: &Sig, voice: usize) -> Result<(ParamSlot, i8, usize)> {
        match sig {
            Sig::Node(other) => {
                let meta = self.server.meta(other.id())?;
                let sid = meta.streams[voice % meta.streams.len()];
                self.deps.push(other.id());
                let frames = self.server.frames_for(meta.rate_exp)?;
                Ok((ParamSlot::Stream(sid), meta.rate_exp, frames))
            }
            other => Ok((
                self.server.resolve_slot(other, voice, self.rate_exp, self.deps)?,
                self.rate_exp,
                self.frames,
            )),
        }
    }

    /// Validates a table handle and returns its facts.
    pub fn table(&self, handle: &TableHandle) -> Result<TableInfo> {
        self.server.table_info(handle)
    }

    /// The full ordered stream list of a node, recording the dependency.
    /// For builders that consume another node's streams structurally rather
    /// than through per-voice wrapping.
    pub fn streams_of(&mut self, handle: &NodeHandle) -> Result<Vec<StreamId>> {
        let meta = self.server.meta(handle.id())?;
        if meta.rate_exp != self.rate_exp {
            return Err(Error::config(
                "rate mismatch: input runs at a different rate; insert a Resample node",
            ));
        }
        self.deps.push(handle.id());
        Ok(meta.streams.clone())
    }

    /// Validates a duplex input channel and returns its index.
    pub fn input_channel(&self, channel: usize) -> Result<usize> {
        if !self.server.config.duplex {
            return Err(Error::config("server is not in duplex mode"));
        }
        if channel >= self.server.config.input_channels {
            return Err(Error::config("input channel out of range"));
        }
        Ok(channel)
    }

    /// Rate exponent of a node (for rate-converter builders).
    pub fn node_rate(&self, handle: &NodeHandle) -> Result<i8> {
        Ok(self.server.meta(handle.id())?.rate_exp)
    }
}

impl NodeHandle {
    /// Routes the node's streams to the output bus and (re)activates it:
    /// stream `k` sums into channel `channel + k * increment`. Runs for
    /// `dur` seconds (0 = forever) starting after `delay` seconds. Fluent:
    /// returns the handle. A no-op for control-only nodes.
    pub fn out(
        &self,
        server: &mut Server,
        channel: usize,
        increment: usize,
        dur: f64,
        delay: f64,
    ) -> crate::error::Result<NodeHandle> {
        server.node_out(self, channel, increment, dur, delay)?;
        Ok(*self)
    }

    /// (Re)activates the node without routing it to the output bus.
    pub fn play(
        &self,
        server: &mut Server,
        dur: f64,
        delay: f64,
    ) -> crate::error::Result<NodeHandle> {
        server.node_play(self, dur, delay)?;
        Ok(*self)
    }

    /// Deactivates the node after a fade-out of `wait` seconds (0 = now).
    pub fn stop(&self, server: &mut Server, wait: f64) -> crate::error::Result<NodeHandle> {
        server.node_stop(self, wait)?;
        Ok(*self)
    }

    /// Builds a round-robin down-mix of this node's streams into `voices`
    /// streams.
    pub fn mix(&self, server: &mut Server, voices: usize) -> crate::error::Result<NodeHandle> {
        server.node_mix(self, voices)
    }

    /// First sample of the node's first stream this cycle.
    pub fn get(&self, server: &Server) -> f32 {
        server.node_get(self, 0)
    }

    /// First sample of every stream this cycle.
    pub fn get_all(&self, server: &Server) -> Vec<f32> {
        server.node_get_all(self)
    }

    /// Replaces a named parameter (including `"mul"` and `"add"`) with a new
    /// value, list or node, re-applying the wrap rule across voices.
    pub fn set_param(
        &self,
        server: &mut Server,
        name: &str,
        value: impl Into<Sig>,
    ) -> crate::error::Result<()> {
        server.node_set_param(self, name, value.into())
    }

    /// Crossfades the node's primary input to a new source over `fadetime`
    /// seconds.
    pub fn set_input(
        &self,
        server: &mut Server,
        value: impl Into<Sig>,
        fadetime: f64,
    ) -> crate::error::Result<()> {
        server.node_set_input(self, value.into(), fadetime)
    }
}

impl TableHandle {
    /// Facts about the table.
    pub fn info(&self, server: &Server) -> crate::error::Result<TableInfo> {
        server.table_info(self)
    }

    /// Copies one channel of the table. Only available while stopped.
    pub fn samples(&self, server: &Server, chan: usize) -> crate::error::Result<Vec<f32>> {
        server.table_samples(self, chan)
    }

    /// Regenerates the table from a builder.
    pub fn replace<B: TableBuilder>(
        &self,
        server: &mut Server,
        builder: B,
    ) -> crate::error::Result<()> {
        server.table_replace(self, builder)
    }

    /// Reallocates the table to `size` samples, erasing its contents.
    pub fn resize(&self, server: &mut Server, size: usize) -> crate::error::Result<()> {
        server.table_resize(self, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemorySink;
    use crate::node::{Render, Unit, UnitStatus};

    /// Minimal test node: emits its `value` argument each sample.
    struct Emit {
        value: Sig,
        mul: Sig,
        add: Sig,
    }

    impl Emit {
        fn new(value: impl Into<Sig>) -> Self {
            Self {
                value: value.into(),
                mul: Sig::Num(1.0),
                add: Sig::Num(0.0),
            }
        }
    }

    struct EmitUnit {
        value: ParamSlot,
    }

    impl Unit for EmitUnit {
        fn process(
            &mut self,
            rc: &mut Render<'_>,
            outs: &mut [Vec<f32>],
        ) -> std::result::Result<UnitStatus, crate::node::UnitError> {
            for i in 0..rc.frames {
                outs[0][i] = self.value.at(rc.pool, i);
            }
            Ok(UnitStatus::Continue)
        }
    }

    impl NodeBuilder for Emit {
        fn params(&self) -> Vec<&Sig> {
            vec![&self.value]
        }
        fn mul(&self) -> &Sig {
            &self.mul
        }
        fn add(&self) -> &Sig {
            &self.add
        }
        fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
            Ok(Box::new(EmitUnit {
                value: ctx.slot(&self.value, voice)?,
            }))
        }
    }

    fn booted_server(duration: f64) -> (Server, Arc<Mutex<Vec<f32>>>) {
        let mut server = Server::new(ServerConfig {
            sample_rate: 44100,
            buffer_size: 64,
            channels: 1,
            ..ServerConfig::default()
        });
        let sink = MemorySink::new();
        let buffer = sink.buffer();
        server.boot(Driver::offline(sink, duration)).unwrap();
        (server, buffer)
    }

    #[test]
    fn start_before_boot_is_state_error() {
        let mut server = Server::default();
        assert!(matches!(server.start().unwrap_err(), Error::State(_)));
    }

    #[test]
    fn add_before_boot_is_state_error() {
        let mut server = Server::default();
        let err = server.add(Emit::new(1.0)).unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn double_boot_rejected() {
        let (mut server, _) = booted_server(0.01);
        let err = server
            .boot(Driver::offline(MemorySink::new(), 0.01))
            .unwrap_err();
        assert!(matches!(err, Error::State(_)));
    }

    #[test]
    fn config_immutable_while_booted() {
        let (mut server, _) = booted_server(0.01);
        assert!(matches!(
            server.set_sample_rate(48000).unwrap_err(),
            Error::State(_)
        ));
        server.shutdown().unwrap();
        server.set_sample_rate(48000).unwrap();
        assert_eq!(server.sample_rate(), 48000);
    }

    #[test]
    fn invalid_config_rejected_at_boot() {
        let mut server = Server::new(ServerConfig {
            buffer_size: 0,
            ..ServerConfig::default()
        });
        let err = server
            .boot(Driver::offline(MemorySink::new(), 1.0))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!server.is_booted());
    }

    #[test]
    fn expansion_computes_max_and_wraps() {
        let (mut server, _) = booted_server(0.01);
        // Lengths [3, 1, 5]: nstreams must be 5.
        let five = server.add(Emit::new([0.0, 1.0, 2.0, 3.0, 4.0])).unwrap();
        let mut node = Emit::new([10.0, 20.0, 30.0]);
        node.mul = Sig::Num(1.0);
        node.add = Sig::Node(five);
        let handle = server.add(node).unwrap();
        assert_eq!(handle.nstreams(), 5);
    }

    #[test]
    fn empty_list_parameter_fails_construction() {
        let (mut server, _) = booted_server(0.01);
        let err = server.add(Emit::new(Vec::<f64>::new())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn offline_render_produces_requested_length() {
        let (mut server, buffer) = booted_server(0.1);
        let node = server.add(Emit::new(0.5)).unwrap();
        node.out(&mut server, 0, 1, 0.0, 0.0).unwrap();
        server.start().unwrap();
        // 0.1 s at 44100 Hz, mono, rounded up to whole 64-frame cycles.
        let cycles = (0.1f64 * 44100.0 / 64.0).ceil() as usize;
        assert_eq!(buffer.lock().len(), cycles * 64);
        assert!(!server.is_started());
    }

    #[test]
    fn stop_start_resumes_without_reboot() {
        let (mut server, _) = booted_server(10.0);
        server.start_nonblocking().unwrap();
        assert!(server.is_started());
        server.stop().unwrap();
        assert!(!server.is_started());
        // Resumes with no second boot.
        server.start_nonblocking().unwrap();
        assert!(server.is_started());
        server.stop().unwrap();
    }

    #[test]
    fn shutdown_invalidates_handles() {
        let (mut server, _) = booted_server(0.01);
        let node = server.add(Emit::new(1.0)).unwrap();
        server.shutdown().unwrap();
        assert!(!server.is_booted());
        let err = node.play(&mut server, 0.0, 0.0).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn mix_collapses_streams() {
        let (mut server, _) = booted_server(0.01);
        let node = server.add(Emit::new([1.0, 2.0, 3.0])).unwrap();
        let mixed = node.mix(&mut server, 1).unwrap();
        assert_eq!(mixed.nstreams(), 1);
        server.start().unwrap();
        assert_eq!(mixed.get(&server), 6.0);
    }

    #[test]
    fn resampling_block_validation() {
        let (mut server, _) = booted_server(0.01);
        assert!(matches!(
            server.begin_resampling_block(3).unwrap_err(),
            Error::Config(_)
        ));
        assert!(matches!(
            server.end_resampling_block().unwrap_err(),
            Error::State(_)
        ));
        server.begin_resampling_block(2).unwrap();
        assert!(matches!(
            server.begin_resampling_block(2).unwrap_err(),
            Error::State(_)
        ));
        server.end_resampling_block().unwrap();
    }

    #[test]
    fn cross_rate_input_rejected() {
        let (mut server, _) = booted_server(0.01);
        let slow = server.add(Emit::new(1.0)).unwrap();
        server.begin_resampling_block(2).unwrap();
        let err = server.add(Emit::new(slow)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        server.end_resampling_block().unwrap();
    }

    #[test]
    fn set_param_rejects_dependency_cycle() {
        let (mut server, _) = booted_server(0.01);
        let a = server.add(Emit::new(1.0)).unwrap();
        let b = server.add(Emit::new(a)).unwrap();
        let err = a.set_param(&mut server, "value", b).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn out_on_resampled_node_rejected() {
        let (mut server, _) = booted_server(0.01);
        server.begin_resampling_block(2).unwrap();
        let fast = server.add(Emit::new(1.0)).unwrap();
        let err = fast.out(&mut server, 0, 1, 0.0, 0.0).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        server.end_resampling_block().unwrap();
    }
}
