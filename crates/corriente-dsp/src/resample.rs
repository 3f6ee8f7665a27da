//! Rate conversion across resampling-block boundaries.
//!
//! A stream may only feed nodes running at its own rate; [`Resample`] is the
//! one node allowed to read across the boundary. Build it *outside* the
//! source's bracket (or inside a bracket for the opposite direction): the
//! node converts from the source's rate to the rate in effect where it is
//! built.

use corriente_core::{
    BuildCtx, Error, NodeBuilder, ParamSlot, Render, Result, Sig, Unit, UnitError, UnitStatus,
};

/// Conversion mode.
///
/// Interpolation modes apply when converting upward (source slower than this
/// node), decimation modes when converting downward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMode {
    /// Repeat each source sample (upsampling).
    ZeroHold,
    /// Two-point linear interpolation (upsampling).
    Linear,
    /// Four-point cubic interpolation (upsampling).
    Cubic,
    /// Keep every n-th sample (downsampling).
    Drop,
    /// Average each group of n samples (downsampling).
    Average,
}

impl ResampleMode {
    /// Mode from a numeric index (0 = zero-hold, 1 = linear, 2 = cubic,
    /// 3 = drop, 4 = average).
    ///
    /// # Errors
    ///
    /// Unsupported indices fail fast with a configuration error.
    pub fn from_index(index: usize) -> Result<Self> {
        match index {
            0 => Ok(ResampleMode::ZeroHold),
            1 => Ok(ResampleMode::Linear),
            2 => Ok(ResampleMode::Cubic),
            3 => Ok(ResampleMode::Drop),
            4 => Ok(ResampleMode::Average),
            other => Err(Error::config(format!(
                "unsupported interpolation index: {other}"
            ))),
        }
    }

    fn upsampling(self) -> bool {
        matches!(
            self,
            ResampleMode::ZeroHold | ResampleMode::Linear | ResampleMode::Cubic
        )
    }
}

/// Converts a stream from another rate bracket to this node's rate.
pub struct Resample {
    input: Sig,
    mode: ResampleMode,
    mul: Sig,
    add: Sig,
}

impl Resample {
    /// Linear conversion of `input` to the rate in effect at build time.
    pub fn new(input: impl Into<Sig>) -> Self {
        Self {
            input: input.into(),
            mode: ResampleMode::Linear,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Conversion mode; must match the conversion direction.
    pub fn mode(mut self, mode: ResampleMode) -> Self {
        self.mode = mode;
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

struct ResampleUnit {
    input: ParamSlot,
    mode: ResampleMode,
    /// Output frames per source frame (up) or source frames per output
    /// frame (down).
    factor: usize,
    /// Carry of the last source samples for interpolation continuity.
    hist: [f32; 3],
}

impl ResampleUnit {
    #[inline]
    fn src_at(&self, src: &[f32], idx: isize) -> f32 {
        if idx < 0 {
            self.hist[(3 + idx) as usize]
        } else {
            src.get(idx as usize).copied().unwrap_or(0.0)
        }
    }
}

impl Unit for ResampleUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let src = match self.input {
            ParamSlot::Stream(id) => rc.pool.read(id),
            ParamSlot::Fixed(_) => {
                // A constant needs no conversion.
                let v = self.input.at(rc.pool, 0);
                outs[0][..rc.frames].fill(v);
                return Ok(UnitStatus::Continue);
            }
        };
        let out = &mut outs[0];
        let factor = self.factor;
        if self.mode.upsampling() {
            for i in 0..rc.frames {
                let idx = (i / factor) as isize;
                let t = (i % factor) as f32 / factor as f32;
                out[i] = match self.mode {
                    ResampleMode::ZeroHold => self.src_at(src, idx),
                    ResampleMode::Linear => {
                        let a = self.src_at(src, idx - 1);
                        let b = self.src_at(src, idx);
                        a + (b - a) * t
                    }
                    ResampleMode::Cubic => {
                        let y0 = self.src_at(src, idx - 2);
                        let y1 = self.src_at(src, idx - 1);
                        let y2 = self.src_at(src, idx);
                        let y3 = self.src_at(src, idx + 1);
                        let a = 0.5 * (3.0 * (y1 - y2) - y0 + y3);
                        let b = y2 + y2 + y0 - 0.5 * (5.0 * y1 + y3);
                        let c = 0.5 * (y2 - y0);
                        ((a * t + b) * t + c) * t + y1
                    }
                    _ => unreachable!(),
                };
            }
        } else {
            for i in 0..rc.frames {
                out[i] = match self.mode {
                    ResampleMode::Drop => src.get(i * factor).copied().unwrap_or(0.0),
                    ResampleMode::Average => {
                        let group = &src[(i * factor).min(src.len())
                            ..((i + 1) * factor).min(src.len())];
                        if group.is_empty() {
                            0.0
                        } else {
                            group.iter().sum::<f32>() / group.len() as f32
                        }
                    }
                    _ => unreachable!(),
                };
            }
        }
        // Carry the source tail for next-cycle interpolation.
        let n = src.len();
        for (k, slot) in self.hist.iter_mut().enumerate() {
            *slot = if n + k >= 3 { src[n + k - 3] } else { 0.0 };
        }
        Ok(UnitStatus::Continue)
    }
}

impl NodeBuilder for Resample {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.input]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        let (slot, _src_exp, src_frames) = ctx.slot_any_rate(&self.input, voice)?;
        let my_frames = ctx.frames();
        if src_frames == my_frames && matches!(slot, ParamSlot::Stream(_)) {
            return Err(Error::config(
                "input already runs at this rate; nothing to resample",
            ));
        }
        let (factor, up) = if my_frames >= src_frames {
            (my_frames / src_frames, true)
        } else {
            (src_frames / my_frames, false)
        };
        if up && !self.mode.upsampling() {
            return Err(Error::config(
                "decimation mode cannot be used for upsampling",
            ));
        }
        if !up && self.mode.upsampling() {
            return Err(Error::config(
                "interpolation mode cannot be used for downsampling",
            ));
        }
        Ok(Box::new(ResampleUnit {
            input: slot,
            mode: self.mode,
            factor,
            hist: [0.0; 3],
        }))
    }
}
