//! Streaming spectral analysis and resynthesis.
//!
//! [`Fft`] slides a window over its input and emits, per voice, one
//! real/imaginary stream pair per overlap branch: sample `n` of a pair
//! carries one bin of the branch's current frame, bins cycling `0..size`
//! while the next frame is analyzed. [`Ifft`] consumes those pairs,
//! rebuilds frames, and resynthesizes by windowed overlap-add. A matched
//! pair reconstructs its input with `2 * size` samples of latency.
//!
//! Spectral streams are frame data, not audio; route only the [`Ifft`]
//! output to the bus.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;

use corriente_core::{
    BuildCtx, Error, NodeBuilder, NodeHandle, ParamSlot, Render, Result, Sig, StreamId, Unit,
    UnitError, UnitStatus, Window,
};

fn validate_layout(size: usize, overlaps: usize) -> Result<usize> {
    if size < 8 || !size.is_power_of_two() {
        return Err(Error::config("frame size must be a power of two, at least 8"));
    }
    if !matches!(overlaps, 1 | 2 | 4) {
        return Err(Error::config("overlaps must be 1, 2 or 4"));
    }
    Ok(size / overlaps)
}

fn analysis_window(size: usize, overlaps: usize) -> Result<Vec<f32>> {
    if overlaps == 1 {
        Window::Rectangular.fill(size)
    } else {
        Window::Hann.fill(size)
    }
}

/// Streaming forward FFT.
pub struct Fft {
    input: Sig,
    size: usize,
    overlaps: usize,
    mul: Sig,
    add: Sig,
}

impl Fft {
    /// A 1024-point, 4-overlap analysis of `input`.
    pub fn new(input: impl Into<Sig>) -> Self {
        Self {
            input: input.into(),
            size: 1024,
            overlaps: 4,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Frame size in samples (power of two).
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Overlap count: 1, 2 or 4.
    pub fn overlaps(mut self, overlaps: usize) -> Self {
        self.overlaps = overlaps;
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

struct Branch {
    re: Vec<f32>,
    im: Vec<f32>,
    counter: usize,
    counter0: usize,
}

struct FftUnit {
    input: ParamSlot,
    size: usize,
    ring: Vec<f32>,
    ring_pos: usize,
    window: Vec<f32>,
    branches: Vec<Branch>,
    fft: Arc<dyn rustfft::Fft<f32>>,
    work: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Unit for FftUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let size = self.size;
        for i in 0..rc.frames {
            let x = self.input.at(rc.pool, i);
            self.ring[self.ring_pos] = x;
            self.ring_pos = (self.ring_pos + 1) % size;

            for (b, branch) in self.branches.iter_mut().enumerate() {
                if branch.counter == 0 {
                    // Analyze the latest `size` samples into a fresh frame.
                    for j in 0..size {
                        let s = self.ring[(self.ring_pos + j) % size] * self.window[j];
                        self.work[j] = Complex { re: s, im: 0.0 };
                    }
                    self.fft
                        .process_with_scratch(&mut self.work, &mut self.scratch);
                    for j in 0..size {
                        branch.re[j] = self.work[j].re;
                        branch.im[j] = self.work[j].im;
                    }
                }
                outs[2 * b][i] = branch.re[branch.counter];
                outs[2 * b + 1][i] = branch.im[branch.counter];
                branch.counter = (branch.counter + 1) % size;
            }
        }
        Ok(UnitStatus::Continue)
    }

    fn set_param(&mut self, name: &str, slot: ParamSlot) -> bool {
        if name == "input" {
            self.input = slot;
            true
        } else {
            false
        }
    }

    fn reset(&mut self) {
        self.ring.fill(0.0);
        self.ring_pos = 0;
        for branch in &mut self.branches {
            branch.re.fill(0.0);
            branch.im.fill(0.0);
            branch.counter = branch.counter0;
        }
    }
}

impl NodeBuilder for Fft {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.input]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn outs_per_voice(&self) -> usize {
        2 * self.overlaps
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        let hop = validate_layout(self.size, self.overlaps)?;
        let window = analysis_window(self.size, self.overlaps)?;
        let fft = FftPlanner::new().plan_fft_forward(self.size);
        let scratch_len = fft.get_inplace_scratch_len();
        let branches = (0..self.overlaps)
            .map(|b| {
                let counter0 = (self.size - b * hop) % self.size;
                Branch {
                    re: vec![0.0; self.size],
                    im: vec![0.0; self.size],
                    counter: counter0,
                    counter0,
                }
            })
            .collect();
        Ok(Box::new(FftUnit {
            input: ctx.slot(&self.input, voice)?,
            size: self.size,
            ring: vec![0.0; self.size],
            ring_pos: 0,
            window,
            branches,
            fft,
            work: vec![Complex { re: 0.0, im: 0.0 }; self.size],
            scratch: vec![Complex { re: 0.0, im: 0.0 }; scratch_len],
        }))
    }
}

/// Streaming inverse FFT with overlap-add resynthesis.
///
/// The source must be an [`Fft`] node built with the same `size` and
/// `overlaps`, created while both nodes are stopped so their frame counters
/// stay aligned.
pub struct Ifft {
    source: NodeHandle,
    size: usize,
    overlaps: usize,
    mul: Sig,
    add: Sig,
}

impl Ifft {
    /// Resynthesis of a 1024-point, 4-overlap analysis.
    pub fn new(source: NodeHandle) -> Self {
        Self {
            source,
            size: 1024,
            overlaps: 4,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Frame size in samples; must match the source analysis.
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Overlap count; must match the source analysis.
    pub fn overlaps(mut self, overlaps: usize) -> Self {
        self.overlaps = overlaps;
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

struct IfftUnit {
    inputs: Vec<(StreamId, StreamId)>,
    size: usize,
    branches: Vec<Branch>,
    accum: Vec<f32>,
    accum_pos: usize,
    scale: f32,
    ifft: Arc<dyn rustfft::Fft<f32>>,
    work: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl Unit for IfftUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let size = self.size;
        let accum_len = self.accum.len();
        let out = &mut outs[0];
        for i in 0..rc.frames {
            for (b, branch) in self.branches.iter_mut().enumerate() {
                let (re_id, im_id) = self.inputs[b];
                branch.re[branch.counter] =
                    rc.pool.read(re_id).get(i).copied().unwrap_or(0.0);
                branch.im[branch.counter] =
                    rc.pool.read(im_id).get(i).copied().unwrap_or(0.0);
                branch.counter += 1;
                if branch.counter == size {
                    branch.counter = 0;
                    for j in 0..size {
                        self.work[j] = Complex {
                            re: branch.re[j],
                            im: branch.im[j],
                        };
                    }
                    self.ifft
                        .process_with_scratch(&mut self.work, &mut self.scratch);
                    let norm = self.scale / size as f32;
                    for j in 0..size {
                        let idx = (self.accum_pos + j) % accum_len;
                        self.accum[idx] += self.work[j].re * norm;
                    }
                }
            }
            out[i] = self.accum[self.accum_pos];
            self.accum[self.accum_pos] = 0.0;
            self.accum_pos = (self.accum_pos + 1) % accum_len;
        }
        Ok(UnitStatus::Continue)
    }

    fn reset(&mut self) {
        self.accum.fill(0.0);
        self.accum_pos = 0;
        for branch in &mut self.branches {
            branch.re.fill(0.0);
            branch.im.fill(0.0);
            branch.counter = branch.counter0;
        }
    }
}

impl NodeBuilder for Ifft {
    fn params(&self) -> Vec<&Sig> {
        Vec::new()
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn fixed_voices(&self) -> Option<usize> {
        Some((self.source.nstreams() / (2 * self.overlaps)).max(1))
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        let hop = validate_layout(self.size, self.overlaps)?;
        let streams = ctx.streams_of(&self.source)?;
        let per_voice = 2 * self.overlaps;
        if streams.len() % per_voice != 0 {
            return Err(Error::config(
                "source stream count does not match the size/overlaps layout",
            ));
        }
        let base = voice * per_voice;
        if base + per_voice > streams.len() {
            return Err(Error::config("source has too few spectral stream pairs"));
        }
        let inputs: Vec<(StreamId, StreamId)> = (0..self.overlaps)
            .map(|b| (streams[base + 2 * b], streams[base + 2 * b + 1]))
            .collect();
        let branches = (0..self.overlaps)
            .map(|b| {
                let counter0 = (self.size - b * hop) % self.size;
                Branch {
                    re: vec![0.0; self.size],
                    im: vec![0.0; self.size],
                    counter: counter0,
                    counter0,
                }
            })
            .collect();
        let ifft = FftPlanner::new().plan_fft_inverse(self.size);
        let scratch_len = ifft.get_inplace_scratch_len();
        let scale = if self.overlaps == 1 {
            1.0
        } else {
            2.0 / self.overlaps as f32
        };
        Ok(Box::new(IfftUnit {
            inputs,
            size: self.size,
            branches,
            accum: vec![0.0; 2 * self.size],
            accum_pos: 0,
            scale,
            ifft,
            work: vec![Complex { re: 0.0, im: 0.0 }; self.size],
            scratch: vec![Complex { re: 0.0, im: 0.0 }; scratch_len],
        }))
    }
}
