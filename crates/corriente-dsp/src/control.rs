//! Control-rate sources: envelopes, external events, duplex input.
//!
//! [`Fader`] and [`CtrlIn`] are control-only nodes — they produce values for
//! other nodes' parameters, and routing them to the output bus is accepted
//! and ignored. [`AudioIn`] is ordinary audio.

use corriente_core::{
    BuildCtx, Error, NodeBuilder, ParamSlot, Render, Result, Sig, Unit, UnitError, UnitStatus,
};

/// A linear attack / sustain / release envelope.
///
/// Rises from 0 to 1 over `fadein` seconds, sustains, and — when `dur` is
/// positive — releases over `fadeout` seconds so the whole envelope lasts
/// `dur`. With `dur == 0` it sustains until the node is stopped. The unit
/// reports done after the release, deactivating the node. Typically used as
/// another node's `mul`.
pub struct Fader {
    fadein: f64,
    fadeout: f64,
    dur: f64,
    mul: Sig,
    add: Sig,
}

impl Fader {
    /// A 10 ms attack, 100 ms release envelope sustaining until stopped.
    pub fn new() -> Self {
        Self {
            fadein: 0.01,
            fadeout: 0.1,
            dur: 0.0,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Attack time in seconds.
    pub fn fadein(mut self, seconds: f64) -> Self {
        self.fadein = seconds;
        self
    }

    /// Release time in seconds.
    pub fn fadeout(mut self, seconds: f64) -> Self {
        self.fadeout = seconds;
        self
    }

    /// Total duration in seconds; 0 sustains forever.
    pub fn dur(mut self, seconds: f64) -> Self {
        self.dur = seconds;
        self
    }

    /// Post-scale multiplier.
    pub fn mul(mut self, value: impl Into<Sig>) -> Self {
        self.mul = value.into();
        self
    }

    /// Post-scale offset.
    pub fn add(mut self, value: impl Into<Sig>) -> Self {
        self.add = value.into();
        self
    }
}

impl Default for Fader {
    fn default() -> Self {
        Self::new()
    }
}

struct FaderUnit {
    fadein: f64,
    fadeout: f64,
    dur: f64,
    /// Samples since (re)trigger.
    pos: u64,
}

impl Unit for FaderUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let sr = f64::from(rc.sample_rate);
        let attack = (self.fadein * sr).max(1.0);
        let release = (self.fadeout * sr).max(1.0);
        let total = if self.dur > 0.0 {
            Some(self.dur * sr)
        } else {
            None
        };
        let out = &mut outs[0];
        let mut finished = false;
        for i in 0..rc.frames {
            let t = self.pos as f64;
            let mut v = (t / attack).min(1.0);
            if let Some(total) = total {
                let remaining = total - t;
                if remaining <= 0.0 {
                    v = 0.0;
                    finished = true;
                } else if remaining < release {
                    v = v.min(remaining / release);
                }
            }
            out[i] = v as f32;
            self.pos += 1;
        }
        if finished {
            Ok(UnitStatus::Done)
        } else {
            Ok(UnitStatus::Continue)
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
    }
}

impl NodeBuilder for Fader {
    fn params(&self) -> Vec<&Sig> {
        Vec::new()
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn is_control_only(&self) -> bool {
        true
    }

    fn make_unit(&self, _ctx: &mut BuildCtx<'_>, _voice: usize) -> Result<Box<dyn Unit>> {
        if self.fadein < 0.0 || self.fadeout < 0.0 || self.dur < 0.0 {
            return Err(Error::config("envelope times cannot be negative"));
        }
        Ok(Box::new(FaderUnit {
            fadein: self.fadein,
            fadeout: self.fadeout,
            dur: self.dur,
            pos: 0,
        }))
    }
}

/// The last value of an external control-event channel, slewed.
///
/// Events arrive from MIDI/OSC adapters through the server's event sender
/// and drain once per cycle; this node follows the most recent value on its
/// channel with a one-pole slew so abrupt controller jumps do not click.
pub struct CtrlIn {
    channel: u32,
    init: f64,
    slew: f64,
    mul: Sig,
    add: Sig,
}

impl CtrlIn {
    /// Follows control channel `channel`, starting at 0.
    pub fn new(channel: u32) -> Self {
        Self {
            channel,
            init: 0.0,
            slew: 0.005,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Value before any event arrives.
    pub fn init(mut self, value: f64) -> Self {
        self.init = value;
        self
    }

    /// Slew time constant in seconds; 0 follows instantly.
    pub fn slew(mut self, seconds: f64) -> Self {
        self.slew = seconds;
        self
    }

    /// Post-scale multiplier.
    pub fn mul(mut self, value: impl Into<Sig>) -> Self {
        self.mul = value.into();
        self
    }

    /// Post-scale offset.
    pub fn add(mut self, value: impl Into<Sig>) -> Self {
        self.add = value.into();
        self
    }
}

struct CtrlInUnit {
    channel: u32,
    init: f32,
    slew: f64,
    current: f32,
}

impl Unit for CtrlInUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let target = rc.events.get(self.channel).unwrap_or(self.init);
        let coeff = if self.slew <= 0.0 {
            1.0
        } else {
            1.0 - (-1.0 / (self.slew * f64::from(rc.sample_rate))).exp() as f32
        };
        let out = &mut outs[0];
        for sample in &mut out[..rc.frames] {
            self.current += coeff * (target - self.current);
            *sample = self.current;
        }
        Ok(UnitStatus::Continue)
    }

    fn reset(&mut self) {
        self.current = self.init;
    }
}

impl NodeBuilder for CtrlIn {
    fn params(&self) -> Vec<&Sig> {
        Vec::new()
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn is_control_only(&self) -> bool {
        true
    }

    fn make_unit(&self, _ctx: &mut BuildCtx<'_>, _voice: usize) -> Result<Box<dyn Unit>> {
        Ok(Box::new(CtrlInUnit {
            channel: self.channel,
            init: self.init as f32,
            slew: self.slew,
            current: self.init as f32,
        }))
    }
}

/// One channel of the server's duplex audio input as a node.
pub struct AudioIn {
    channel: usize,
    mul: Sig,
    add: Sig,
}

impl AudioIn {
    /// Captures input channel `channel`.
    pub fn new(channel: usize) -> Self {
        Self {
            channel,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Post-scale multiplier.
    pub fn mul(mut self, value: impl Into<Sig>) -> Self {
        self.mul = value.into();
        self
    }

    /// Post-scale offset.
    pub fn add(mut self, value: impl Into<Sig>) -> Self {
        self.add = value.into();
        self
    }
}

struct AudioInUnit {
    channel: usize,
}

impl Unit for AudioInUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let out = &mut outs[0];
        match rc.input.get(self.channel) {
            Some(captured) => {
                let n = rc.frames.min(captured.len());
                out[..n].copy_from_slice(&captured[..n]);
                out[n..rc.frames].fill(0.0);
            }
            None => out[..rc.frames].fill(0.0),
        }
        Ok(UnitStatus::Continue)
    }
}

impl NodeBuilder for AudioIn {
    fn params(&self) -> Vec<&Sig> {
        Vec::new()
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, _voice: usize) -> Result<Box<dyn Unit>> {
        Ok(Box::new(AudioInUnit {
            channel: ctx.input_channel(self.channel)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corriente_core::{EventMap, StreamPool, TablePool};

    fn run(unit: &mut dyn Unit, events: &EventMap, frames: usize, cycles: usize) -> Vec<f32> {
        let pool = StreamPool::with_capacity(0, frames);
        let mut tables = TablePool::default();
        let mut collected = Vec::new();
        let mut outs = vec![vec![0.0f32; frames]];
        for _ in 0..cycles {
            let mut rc = Render {
                pool: &pool,
                tables: &mut tables,
                events,
                input: &[],
                sample_rate: 1000.0,
                frames,
            };
            unit.process(&mut rc, &mut outs).unwrap();
            collected.extend_from_slice(&outs[0]);
        }
        collected
    }

    #[test]
    fn fader_attack_sustain_release_shape() {
        // 10 ms attack, 20 ms release, 100 ms total at 1 kHz.
        let mut unit = FaderUnit {
            fadein: 0.01,
            fadeout: 0.02,
            dur: 0.1,
            pos: 0,
        };
        let events = EventMap::default();
        let out = run(&mut unit, &events, 25, 5);
        assert_eq!(out[0], 0.0);
        assert!((out[5] - 0.5).abs() < 1e-6, "mid-attack {}", out[5]);
        assert_eq!(out[50], 1.0);
        // Release: 10 samples before the end the value is half way down.
        assert!((out[90] - 0.5).abs() < 1e-6, "mid-release {}", out[90]);
        assert!(out[99] < 0.1);
    }

    #[test]
    fn fader_reports_done_after_total_duration() {
        let mut unit = FaderUnit {
            fadein: 0.001,
            fadeout: 0.001,
            dur: 0.01,
            pos: 0,
        };
        let pool = StreamPool::with_capacity(0, 16);
        let mut tables = TablePool::default();
        let events = EventMap::default();
        let mut outs = vec![vec![0.0f32; 16]];
        let mut done = false;
        for _ in 0..4 {
            let mut rc = Render {
                pool: &pool,
                tables: &mut tables,
                events: &events,
                input: &[],
                sample_rate: 1000.0,
                frames: 16,
            };
            if matches!(unit.process(&mut rc, &mut outs).unwrap(), UnitStatus::Done) {
                done = true;
                break;
            }
        }
        assert!(done);
    }

    #[test]
    fn ctrlin_follows_event_value() {
        let mut events = EventMap::default();
        events.set(3, 0.8);
        let mut unit = CtrlInUnit {
            channel: 3,
            init: 0.0,
            slew: 0.0,
            current: 0.0,
        };
        let out = run(&mut unit, &events, 8, 1);
        assert!(out.iter().all(|&v| (v - 0.8).abs() < 1e-6));
    }

    #[test]
    fn audioin_copies_captured_channel() {
        let pool = StreamPool::with_capacity(0, 4);
        let mut tables = TablePool::default();
        let events = EventMap::default();
        let captured = vec![vec![0.1f32, 0.2, 0.3, 0.4], vec![1.0f32; 4]];
        let mut unit = AudioInUnit { channel: 1 };
        let mut outs = vec![vec![0.0f32; 4]];
        let mut rc = Render {
            pool: &pool,
            tables: &mut tables,
            events: &events,
            input: &captured,
            sample_rate: 44100.0,
            frames: 4,
        };
        unit.process(&mut rc, &mut outs).unwrap();
        assert_eq!(outs[0], vec![1.0; 4]);

        // Out-of-range channel degrades to silence, never a crash.
        let mut bad = AudioInUnit { channel: 9 };
        let mut rc = Render {
            pool: &pool,
            tables: &mut tables,
            events: &events,
            input: &captured,
            sample_rate: 44100.0,
            frames: 4,
        };
        bad.process(&mut rc, &mut outs).unwrap();
        assert_eq!(outs[0], vec![0.0; 4]);
    }

    #[test]
    fn ctrlin_slew_is_gradual() {
        let mut events = EventMap::default();
        events.set(1, 1.0);
        let mut unit = CtrlInUnit {
            channel: 1,
            init: 0.0,
            slew: 0.05,
            current: 0.0,
        };
        let out = run(&mut unit, &events, 64, 1);
        assert!(out[0] < 0.1);
        assert!(out.windows(2).all(|w| w[1] >= w[0]));
        assert!(out[63] < 1.0);
    }
}
