//! IIR filters with hot-swappable inputs.
//!
//! [`Biquad`] uses the RBJ Audio EQ Cookbook coefficients in a Direct Form I
//! structure; coefficients are recomputed whenever frequency or Q change, so
//! both can be driven at audio rate. [`Tone`] is a cheap one-pole lowpass.

use std::f32::consts::PI;

use corriente_core::{
    BuildCtx, Error, InputFader, NodeBuilder, ParamSlot, Render, Result, Sig, Unit, UnitError,
    UnitStatus,
};

/// Second-order filter response shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Lowpass.
    Lowpass,
    /// Highpass.
    Highpass,
    /// Bandpass (constant 0 dB peak gain).
    Bandpass,
    /// Band-reject.
    Notch,
    /// Allpass (flat magnitude, phase rotation).
    Allpass,
}

impl FilterKind {
    /// Filter kind from a numeric type index (0 = lowpass, 1 = highpass,
    /// 2 = bandpass, 3 = notch, 4 = allpass).
    ///
    /// # Errors
    ///
    /// Unsupported indices fail fast with a configuration error.
    pub fn from_index(index: usize) -> Result<Self> {
        match index {
            0 => Ok(FilterKind::Lowpass),
            1 => Ok(FilterKind::Highpass),
            2 => Ok(FilterKind::Bandpass),
            3 => Ok(FilterKind::Notch),
            4 => Ok(FilterKind::Allpass),
            other => Err(Error::config(format!(
                "unsupported filter type index: {other}"
            ))),
        }
    }
}

/// RBJ cookbook coefficients, normalized by `a0`.
fn coefficients(kind: FilterKind, freq: f32, q: f32, sample_rate: f32) -> (f32, f32, f32, f32, f32) {
    let freq = freq.clamp(1.0, sample_rate * 0.49);
    let q = q.max(0.001);
    let omega = 2.0 * PI * freq / sample_rate;
    let cos_omega = omega.cos();
    let sin_omega = omega.sin();
    let alpha = sin_omega / (2.0 * q);

    let (b0, b1, b2) = match kind {
        FilterKind::Lowpass => {
            let b1 = 1.0 - cos_omega;
            (b1 / 2.0, b1, b1 / 2.0)
        }
        FilterKind::Highpass => {
            let b1 = -(1.0 + cos_omega);
            (-b1 / 2.0, b1, -b1 / 2.0)
        }
        FilterKind::Bandpass => (alpha, 0.0, -alpha),
        FilterKind::Notch => (1.0, -2.0 * cos_omega, 1.0),
        FilterKind::Allpass => (1.0 - alpha, -2.0 * cos_omega, 1.0 + alpha),
    };
    let a0 = 1.0 + alpha;
    let a1 = -2.0 * cos_omega;
    let a2 = 1.0 - alpha;

    let inv = 1.0 / a0;
    (b0 * inv, b1 * inv, b2 * inv, a1 * inv, a2 * inv)
}

/// Second-order IIR filter.
pub struct Biquad {
    input: Sig,
    freq: Sig,
    q: Sig,
    kind: FilterKind,
    mul: Sig,
    add: Sig,
}

impl Biquad {
    /// A 1 kHz lowpass over `input`.
    pub fn new(input: impl Into<Sig>) -> Self {
        Self {
            input: input.into(),
            freq: Sig::Num(1000.0),
            q: Sig::Num(1.0),
            kind: FilterKind::Lowpass,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Cutoff / center frequency in Hz.
    pub fn freq(mut self, value: impl Into<Sig>) -> Self {
        self.freq = value.into();
        self
    }

    /// Q factor.
    pub fn q(mut self, value: impl Into<Sig>) -> Self {
        self.q = value.into();
        self
    }

    /// Response shape.
    pub fn kind(mut self, kind: FilterKind) -> Self {
        self.kind = kind;
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

struct BiquadUnit {
    input: InputFader,
    freq: ParamSlot,
    q: ParamSlot,
    kind: FilterKind,
    // Cached normalized coefficients for the last (freq, q).
    b0: f32,
    b1: f32,
    b2: f32,
    a1: f32,
    a2: f32,
    last_freq: f32,
    last_q: f32,
    x1: f32,
    x2: f32,
    y1: f32,
    y2: f32,
}

impl BiquadUnit {
    fn refresh(&mut self, freq: f32, q: f32, sample_rate: f32) {
        let (b0, b1, b2, a1, a2) = coefficients(self.kind, freq, q, sample_rate);
        self.b0 = b0;
        self.b1 = b1;
        self.b2 = b2;
        self.a1 = a1;
        self.a2 = a2;
        self.last_freq = freq;
        self.last_q = q;
    }
}

impl Unit for BiquadUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let out = &mut outs[0];
        for i in 0..rc.frames {
            let freq = self.freq.at(rc.pool, i);
            let q = self.q.at(rc.pool, i);
            if freq != self.last_freq || q != self.last_q {
                self.refresh(freq, q, rc.sample_rate);
            }
            let x = self.input.advance(rc.pool, i);
            let y = self.b0 * x + self.b1 * self.x1 + self.b2 * self.x2
                - self.a1 * self.y1
                - self.a2 * self.y2;
            self.x2 = self.x1;
            self.x1 = x;
            self.y2 = self.y1;
            self.y1 = y;
            out[i] = y;
        }
        Ok(UnitStatus::Continue)
    }

    fn set_param(&mut self, name: &str, slot: ParamSlot) -> bool {
        match name {
            "freq" => self.freq = slot,
            "q" => self.q = slot,
            _ => return false,
        }
        true
    }

    fn swap_input(&mut self, slot: ParamSlot, fade_samples: usize) {
        self.input.swap(slot, fade_samples);
    }

    fn reset(&mut self) {
        self.x1 = 0.0;
        self.x2 = 0.0;
        self.y1 = 0.0;
        self.y2 = 0.0;
    }
}

impl NodeBuilder for Biquad {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.input, &self.freq, &self.q]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        let mut unit = BiquadUnit {
            input: ctx.fader(&self.input, voice)?,
            freq: ctx.slot(&self.freq, voice)?,
            q: ctx.slot(&self.q, voice)?,
            kind: self.kind,
            b0: 0.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            last_freq: f32::NAN,
            last_q: f32::NAN,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        };
        if let (ParamSlot::Fixed(freq), ParamSlot::Fixed(q)) = (unit.freq, unit.q) {
            unit.refresh(freq, q, ctx.sample_rate());
        }
        Ok(Box::new(unit))
    }
}

/// One-pole lowpass filter (`y += c * (x - y)`).
pub struct Tone {
    input: Sig,
    freq: Sig,
    mul: Sig,
    add: Sig,
}

impl Tone {
    /// A 1 kHz one-pole lowpass over `input`.
    pub fn new(input: impl Into<Sig>) -> Self {
        Self {
            input: input.into(),
            freq: Sig::Num(1000.0),
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Cutoff frequency in Hz.
    pub fn freq(mut self, value: impl Into<Sig>) -> Self {
        self.freq = value.into();
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

struct ToneUnit {
    input: InputFader,
    freq: ParamSlot,
    coeff: f32,
    last_freq: f32,
    y: f32,
}

impl Unit for ToneUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let out = &mut outs[0];
        for i in 0..rc.frames {
            let freq = self.freq.at(rc.pool, i);
            if freq != self.last_freq {
                self.coeff = 1.0 - (-2.0 * PI * freq.max(0.1) / rc.sample_rate).exp();
                self.last_freq = freq;
            }
            let x = self.input.advance(rc.pool, i);
            self.y += self.coeff * (x - self.y);
            out[i] = self.y;
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

    fn swap_input(&mut self, slot: ParamSlot, fade_samples: usize) {
        self.input.swap(slot, fade_samples);
    }

    fn reset(&mut self) {
        self.y = 0.0;
    }
}

impl NodeBuilder for Tone {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.input, &self.freq]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        Ok(Box::new(ToneUnit {
            input: ctx.fader(&self.input, voice)?,
            freq: ctx.slot(&self.freq, voice)?,
            coeff: 0.0,
            last_freq: f32::NAN,
            y: 0.0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corriente_core::{EventMap, Render, StreamPool, TablePool};

    /// Runs a unit for one cycle against a pool holding one input stream.
    fn run_over(unit: &mut dyn Unit, pool: &StreamPool, frames: usize, sample_rate: f32) -> Vec<f32> {
        let mut tables = TablePool::default();
        let events = EventMap::default();
        let mut outs = vec![vec![0.0f32; frames]];
        let mut rc = Render {
            pool,
            tables: &mut tables,
            events: &events,
            input: &[],
            sample_rate,
            frames,
        };
        unit.process(&mut rc, &mut outs).unwrap();
        outs.remove(0)
    }

    fn biquad_unit(kind: FilterKind, freq: f32, q: f32, sr: f32, input: ParamSlot) -> BiquadUnit {
        let mut unit = BiquadUnit {
            input: InputFader::steady(input),
            freq: ParamSlot::Fixed(freq),
            q: ParamSlot::Fixed(q),
            kind,
            b0: 0.0,
            b1: 0.0,
            b2: 0.0,
            a1: 0.0,
            a2: 0.0,
            last_freq: f32::NAN,
            last_q: f32::NAN,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
        };
        unit.refresh(freq, q, sr);
        unit
    }

    /// RMS of the steady-state tail of a filtered sine.
    fn filtered_rms(kind: FilterKind, cutoff: f32, tone_hz: f32) -> f32 {
        let sr = 44100.0;
        let n = 4096;
        let input: Vec<f32> = (0..n)
            .map(|i| (2.0 * PI * tone_hz * i as f32 / sr).sin())
            .collect();
        let mut pool = StreamPool::with_capacity(1, n);
        let sid = pool.push(input);
        let mut unit = biquad_unit(kind, cutoff, 0.707, sr, ParamSlot::Stream(sid));
        let out = run_over(&mut unit, &pool, n, sr);
        let tail = &out[n / 2..];
        (tail.iter().map(|v| v * v).sum::<f32>() / tail.len() as f32).sqrt()
    }

    #[test]
    fn unsupported_type_index_is_config_error() {
        assert!(FilterKind::from_index(4).is_ok());
        let err = FilterKind::from_index(9).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn lowpass_passes_low_rejects_high() {
        let low = filtered_rms(FilterKind::Lowpass, 1000.0, 100.0);
        let high = filtered_rms(FilterKind::Lowpass, 1000.0, 10000.0);
        assert!(low > 0.6, "passband rms {low}");
        assert!(high < 0.1, "stopband rms {high}");
    }

    #[test]
    fn highpass_rejects_low_passes_high() {
        let low = filtered_rms(FilterKind::Highpass, 1000.0, 100.0);
        let high = filtered_rms(FilterKind::Highpass, 1000.0, 10000.0);
        assert!(low < 0.1, "stopband rms {low}");
        assert!(high > 0.6, "passband rms {high}");
    }

    #[test]
    fn notch_cuts_center_frequency() {
        let center = filtered_rms(FilterKind::Notch, 1000.0, 1000.0);
        let off = filtered_rms(FilterKind::Notch, 1000.0, 4000.0);
        assert!(center < 0.15, "notch center rms {center}");
        assert!(off > 0.5, "off-notch rms {off}");
    }

    #[test]
    fn tone_smooths_constant_to_constant() {
        let sr = 44100.0;
        let n = 4096;
        let mut pool = StreamPool::with_capacity(1, n);
        let sid = pool.push(vec![1.0f32; n]);
        let mut unit = ToneUnit {
            input: InputFader::steady(ParamSlot::Stream(sid)),
            freq: ParamSlot::Fixed(500.0),
            coeff: 0.0,
            last_freq: f32::NAN,
            y: 0.0,
        };
        let out = run_over(&mut unit, &pool, n, sr);
        assert!((out[n - 1] - 1.0).abs() < 1e-3);
        // Monotone rise, no overshoot.
        assert!(out.windows(2).all(|w| w[1] >= w[0] - 1e-6));
        assert!(out.iter().all(|&v| v <= 1.0 + 1e-6));
    }
}
