//! Interpolated feedback delay.

use corriente_core::{
    BuildCtx, Error, InputFader, NodeBuilder, ParamSlot, Render, Result, Sig, Unit, UnitError,
    UnitStatus,
};

/// A feedback delay line with linear-interpolated fractional reads.
///
/// Delay time and feedback are audio-rate capable; the maximum delay is
/// fixed at construction (the ring buffer never reallocates). The input is
/// hot-swappable through the input fader.
pub struct Delay {
    input: Sig,
    delay: Sig,
    feedback: Sig,
    maxdelay: f64,
    mul: Sig,
    add: Sig,
}

impl Delay {
    /// A quarter-second echo of `input` with no feedback.
    pub fn new(input: impl Into<Sig>) -> Self {
        Self {
            input: input.into(),
            delay: Sig::Num(0.25),
            feedback: Sig::Num(0.0),
            maxdelay: 1.0,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Delay time in seconds, clamped to `[0, maxdelay]`.
    pub fn delay(mut self, value: impl Into<Sig>) -> Self {
        self.delay = value.into();
        self
    }

    /// Feedback amount applied to the recirculated signal.
    pub fn feedback(mut self, value: impl Into<Sig>) -> Self {
        self.feedback = value.into();
        self
    }

    /// Maximum delay time in seconds (ring buffer capacity).
    pub fn maxdelay(mut self, seconds: f64) -> Self {
        self.maxdelay = seconds;
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

struct DelayUnit {
    input: InputFader,
    delay: ParamSlot,
    feedback: ParamSlot,
    ring: Vec<f32>,
    write_pos: usize,
}

impl DelayUnit {
    /// Linear-interpolated read `delay_samples` behind the write head.
    #[inline]
    fn read(&self, delay_samples: f32) -> f32 {
        let len = self.ring.len();
        let clamped = delay_samples.clamp(0.0, (len - 1) as f32);
        let whole = clamped as usize;
        let frac = clamped - whole as f32;
        let read_pos = (self.write_pos + len - whole - 1) % len;
        let next_pos = (read_pos + len - 1) % len;
        let a = self.ring[read_pos];
        let b = self.ring[next_pos];
        a + (b - a) * frac
    }
}

impl Unit for DelayUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let out = &mut outs[0];
        let len = self.ring.len();
        for i in 0..rc.frames {
            let delay_samples = self.delay.at(rc.pool, i).max(0.0) * rc.sample_rate;
            let delayed = self.read(delay_samples);
            let x = self.input.advance(rc.pool, i);
            let fb = self.feedback.at(rc.pool, i);
            self.ring[self.write_pos] = x + delayed * fb;
            self.write_pos = (self.write_pos + 1) % len;
            out[i] = delayed;
        }
        Ok(UnitStatus::Continue)
    }

    fn set_param(&mut self, name: &str, slot: ParamSlot) -> bool {
        match name {
            "delay" => self.delay = slot,
            "feedback" => self.feedback = slot,
            _ => return false,
        }
        true
    }

    fn swap_input(&mut self, slot: ParamSlot, fade_samples: usize) {
        self.input.swap(slot, fade_samples);
    }

    fn reset(&mut self) {
        self.ring.fill(0.0);
        self.write_pos = 0;
    }
}

impl NodeBuilder for Delay {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.input, &self.delay, &self.feedback]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        if self.maxdelay <= 0.0 {
            return Err(Error::config("maxdelay must be positive"));
        }
        let capacity = (self.maxdelay * f64::from(ctx.sample_rate())).ceil() as usize + 1;
        Ok(Box::new(DelayUnit {
            input: ctx.fader(&self.input, voice)?,
            delay: ctx.slot(&self.delay, voice)?,
            feedback: ctx.slot(&self.feedback, voice)?,
            ring: vec![0.0; capacity.max(2)],
            write_pos: 0,
        }))
    }
}
