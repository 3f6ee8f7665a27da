//! Audio-rate oscillators.
//!
//! Phase accumulators run in f64 and always wrap to `[0, 1)` — an oscillator
//! never clamps or errors on extreme frequency input.

use std::f64::consts::TAU;

use corriente_core::{
    BuildCtx, Error, NodeBuilder, ParamSlot, Render, Result, Sig, Unit, UnitError, UnitStatus,
};

/// A sine wave oscillator.
///
/// Sample `n` of a fresh oscillator at fixed frequency `f` is exactly
/// `sin(2π f n / sr)`: the first sample reads the initial phase, and the
/// accumulator advances afterwards.
pub struct Sine {
    freq: Sig,
    phase: Sig,
    mul: Sig,
    add: Sig,
}

impl Sine {
    /// A 1 kHz sine at full scale.
    pub fn new() -> Self {
        Self {
            freq: Sig::Num(1000.0),
            phase: Sig::Num(0.0),
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Frequency in Hz. Accepts a number, list, or node.
    pub fn freq(mut self, value: impl Into<Sig>) -> Self {
        self.freq = value.into();
        self
    }

    /// Initial phase in periods (`[0, 1)`). Number or list only.
    pub fn phase(mut self, value: impl Into<Sig>) -> Self {
        self.phase = value.into();
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

impl Default for Sine {
    fn default() -> Self {
        Self::new()
    }
}

struct SineUnit {
    freq: ParamSlot,
    phase0: f64,
    phase: f64,
}

impl Unit for SineUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let sr = f64::from(rc.sample_rate);
        let out = &mut outs[0];
        for i in 0..rc.frames {
            out[i] = (TAU * self.phase).sin() as f32;
            self.phase += f64::from(self.freq.at(rc.pool, i)) / sr;
            self.phase -= self.phase.floor();
        }
        Ok(UnitStatus::Continue)
    }

    fn set_param(&mut self, name: &str, slot: ParamSlot) -> bool {
        if name == "freq" {
            self.freq = slot;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.phase = self.phase0;
    }
}

impl NodeBuilder for Sine {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.freq, &self.phase]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        let phase0 = self
            .phase
            .scalar_at(voice)
            .ok_or_else(|| Error::config("phase must be a number or a list of numbers"))?;
        Ok(Box::new(SineUnit {
            freq: ctx.slot(&self.freq, voice)?,
            phase0,
            phase: phase0,
        }))
    }
}

/// A sine oscillator with one-sample self-feedback phase modulation.
///
/// `feedback` scales the previous output sample added to the phase, giving a
/// cheap brightness control that drifts toward noise as it approaches 1.
/// Feedback is internal state, not a graph cycle.
pub struct SineLoop {
    freq: Sig,
    feedback: Sig,
    mul: Sig,
    add: Sig,
}

impl SineLoop {
    /// A 1 kHz feedback sine with no feedback.
    pub fn new() -> Self {
        Self {
            freq: Sig::Num(1000.0),
            feedback: Sig::Num(0.0),
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Frequency in Hz.
    pub fn freq(mut self, value: impl Into<Sig>) -> Self {
        self.freq = value.into();
        self
    }

    /// Feedback amount, usually `[0, 1)`.
    pub fn feedback(mut self, value: impl Into<Sig>) -> Self {
        self.feedback = value.into();
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

impl Default for SineLoop {
    fn default() -> Self {
        Self::new()
    }
}

struct SineLoopUnit {
    freq: ParamSlot,
    feedback: ParamSlot,
    phase: f64,
    last: f64,
}

impl Unit for SineLoopUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let sr = f64::from(rc.sample_rate);
        let out = &mut outs[0];
        for i in 0..rc.frames {
            let fb = f64::from(self.feedback.at(rc.pool, i));
            let y = (TAU * (self.phase + fb * self.last)).sin();
            out[i] = y as f32;
            self.last = y;
            self.phase += f64::from(self.freq.at(rc.pool, i)) / sr;
            self.phase -= self.phase.floor();
        }
        Ok(UnitStatus::Continue)
    }

    fn set_param(&mut self, name: &str, slot: ParamSlot) -> bool {
        match name {
            "freq" => self.freq = slot,
            "feedback" => self.feedback = slot,
            _ => return false,
        }
        true
    }

    fn reset(&mut self) {
        self.phase = 0.0;
        self.last = 0.0;
    }
}

impl NodeBuilder for SineLoop {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.freq, &self.feedback]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        Ok(Box::new(SineLoopUnit {
            freq: ctx.slot(&self.freq, voice)?,
            feedback: ctx.slot(&self.feedback, voice)?,
            phase: 0.0,
            last: 0.0,
        }))
    }
}

/// A linear ramp from 0 to 1 at the given frequency; the workhorse index
/// signal for table readers. Phase wraps.
pub struct Phasor {
    freq: Sig,
    phase: Sig,
    mul: Sig,
    add: Sig,
}

impl Phasor {
    /// A 100 Hz ramp.
    pub fn new() -> Self {
        Self {
            freq: Sig::Num(100.0),
            phase: Sig::Num(0.0),
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Frequency in Hz.
    pub fn freq(mut self, value: impl Into<Sig>) -> Self {
        self.freq = value.into();
        self
    }

    /// Initial phase in `[0, 1)`. Number or list only.
    pub fn phase(mut self, value: impl Into<Sig>) -> Self {
        self.phase = value.into();
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

impl Default for Phasor {
    fn default() -> Self {
        Self::new()
    }
}

struct PhasorUnit {
    freq: ParamSlot,
    phase0: f64,
    phase: f64,
}

impl Unit for PhasorUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let sr = f64::from(rc.sample_rate);
        let out = &mut outs[0];
        for i in 0..rc.frames {
            out[i] = self.phase as f32;
            self.phase += f64::from(self.freq.at(rc.pool, i)) / sr;
            self.phase -= self.phase.floor();
        }
        Ok(UnitStatus::Continue)
    }

    fn set_param(&mut self, name: &str, slot: ParamSlot) -> bool {
        if name == "freq" {
            self.freq = slot;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.phase = self.phase0;
    }
}

impl NodeBuilder for Phasor {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.freq, &self.phase]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        let phase0 = self
            .phase
            .scalar_at(voice)
            .ok_or_else(|| Error::config("phase must be a number or a list of numbers"))?;
        Ok(Box::new(PhasorUnit {
            freq: ctx.slot(&self.freq, voice)?,
            phase0,
            phase: phase0,
        }))
    }
}

/// White noise from a per-voice linear congruential generator.
///
/// Deterministic: the sequence depends only on the voice index, so renders
/// are reproducible.
pub struct Noise {
    mul: Sig,
    add: Sig,
}

impl Noise {
    /// Full-scale white noise.
    pub fn new() -> Self {
        Self {
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

impl Default for Noise {
    fn default() -> Self {
        Self::new()
    }
}

struct NoiseUnit {
    seed: u32,
    state: u32,
}

impl NoiseUnit {
    #[inline]
    fn next(&mut self) -> f32 {
        self.state = self.state.wrapping_mul(1664525).wrapping_add(1013904223);
        (self.state >> 8) as f32 / 8_388_608.0 - 1.0
    }
}

impl Unit for NoiseUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let out = &mut outs[0];
        for sample in &mut out[..rc.frames] {
            *sample = self.next();
        }
        Ok(UnitStatus::Continue)
    }

    fn reset(&mut self) {
        self.state = self.seed;
    }
}

impl NodeBuilder for Noise {
    fn params(&self) -> Vec<&Sig> {
        Vec::new()
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, _ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        let seed = 0x1234_5678u32 ^ (voice as u32).wrapping_mul(0x9E37_79B9);
        Ok(Box::new(NoiseUnit { seed, state: seed }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::run_unit;

    #[test]
    fn sine_matches_closed_form() {
        let mut unit = SineUnit {
            freq: ParamSlot::Fixed(440.0),
            phase0: 0.0,
            phase: 0.0,
        };
        let out = run_unit(&mut unit, 44100.0, 64, 1);
        for (n, &v) in out.iter().enumerate() {
            let want = (TAU * 440.0 * n as f64 / 44100.0).sin() as f32;
            assert!((v - want).abs() < 1e-6, "sample {n}: {v} vs {want}");
        }
    }

    #[test]
    fn sine_phase_survives_cycle_boundaries() {
        let mut unit = SineUnit {
            freq: ParamSlot::Fixed(440.0),
            phase0: 0.0,
            phase: 0.0,
        };
        let out = run_unit(&mut unit, 44100.0, 16, 8);
        for (n, &v) in out.iter().enumerate() {
            let want = (TAU * 440.0 * n as f64 / 44100.0).sin() as f32;
            assert!((v - want).abs() < 1e-5, "sample {n}");
        }
    }

    #[test]
    fn sine_reset_restores_initial_phase() {
        let mut unit = SineUnit {
            freq: ParamSlot::Fixed(1000.0),
            phase0: 0.25,
            phase: 0.25,
        };
        let first = run_unit(&mut unit, 44100.0, 32, 1);
        unit.reset();
        let second = run_unit(&mut unit, 44100.0, 32, 1);
        assert_eq!(first, second);
    }

    #[test]
    fn phasor_stays_in_unit_range_and_wraps() {
        let mut unit = PhasorUnit {
            freq: ParamSlot::Fixed(1000.0),
            phase0: 0.0,
            phase: 0.0,
        };
        let out = run_unit(&mut unit, 8000.0, 64, 4);
        assert!(out.iter().all(|&v| (0.0..1.0).contains(&v)));
        // 1000 Hz at 8 kHz wraps every 8 samples.
        assert!((out[8] - out[0]).abs() < 1e-6);
    }

    #[test]
    fn sineloop_without_feedback_is_a_sine() {
        let mut unit = SineLoopUnit {
            freq: ParamSlot::Fixed(220.0),
            feedback: ParamSlot::Fixed(0.0),
            phase: 0.0,
            last: 0.0,
        };
        let out = run_unit(&mut unit, 44100.0, 64, 1);
        for (n, &v) in out.iter().enumerate() {
            let want = (TAU * 220.0 * n as f64 / 44100.0).sin() as f32;
            assert!((v - want).abs() < 1e-6);
        }
    }

    #[test]
    fn noise_bounded_and_deterministic() {
        let mut a = NoiseUnit {
            seed: 1,
            state: 1,
        };
        let mut b = NoiseUnit {
            seed: 1,
            state: 1,
        };
        let out_a = run_unit(&mut a, 44100.0, 256, 4);
        let out_b = run_unit(&mut b, 44100.0, 256, 4);
        assert_eq!(out_a, out_b);
        assert!(out_a.iter().all(|v| v.abs() <= 1.0));
        // Not silent.
        assert!(out_a.iter().any(|v| v.abs() > 0.1));
    }
}
