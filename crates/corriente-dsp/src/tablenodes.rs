//! Nodes that read from and write into tables.
//!
//! Index policies, per reader: [`Osc`] is an oscillator, so its phase always
//! wraps; [`TableRead`] is positional, so it clamps by default and wraps
//! only in explicit loop mode; [`TableRec`] writes straight through and
//! stops at the end.

use corriente_core::{
    BuildCtx, Error, NodeBuilder, ParamSlot, Render, Result, Sig, TableHandle, TableId, Unit,
    UnitError, UnitStatus,
};

/// Interpolation used by table-lookup oscillators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OscInterp {
    /// Two-point linear interpolation.
    #[default]
    Linear,
    /// Four-point cubic interpolation.
    Cubic,
}

/// A wavetable oscillator: reads one table period per `1/freq` seconds.
///
/// Phase always wraps.
pub struct Osc {
    table: TableHandle,
    freq: Sig,
    phase: Sig,
    interp: OscInterp,
    mul: Sig,
    add: Sig,
}

impl Osc {
    /// A 1 kHz oscillator over `table`.
    pub fn new(table: TableHandle) -> Self {
        Self {
            table,
            freq: Sig::Num(1000.0),
            phase: Sig::Num(0.0),
            interp: OscInterp::Linear,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Frequency in Hz.
    pub fn freq(mut self, value: impl Into<Sig>) -> Self {
        self.freq = value.into();
        self
    }

    /// Initial phase in periods (`[0, 1)`). Number or list only.
    pub fn phase(mut self, value: impl Into<Sig>) -> Self {
        self.phase = value.into();
        self
    }

    /// Lookup interpolation.
    pub fn interp(mut self, interp: OscInterp) -> Self {
        self.interp = interp;
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

struct OscUnit {
    table: TableId,
    freq: ParamSlot,
    interp: OscInterp,
    phase0: f64,
    phase: f64,
}

impl Unit for OscUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let Some(table) = rc.tables.get(self.table) else {
            return Err(UnitError::new("wavetable is missing"));
        };
        let size = table.size() as f64;
        let sr = f64::from(rc.sample_rate);
        let out = &mut outs[0];
        for i in 0..rc.frames {
            let pos = self.phase * size;
            out[i] = match self.interp {
                OscInterp::Linear => table.lookup_wrap(0, pos),
                OscInterp::Cubic => table.lookup_cubic_wrap(0, pos),
            };
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

impl NodeBuilder for Osc {
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
        ctx.table(&self.table)?;
        let phase0 = self
            .phase
            .scalar_at(voice)
            .ok_or_else(|| Error::config("phase must be a number or a list of numbers"))?;
        Ok(Box::new(OscUnit {
            table: self.table.id(),
            freq: ctx.slot(&self.freq, voice)?,
            interp: self.interp,
            phase0,
            phase: phase0,
        }))
    }
}

/// A positional table reader driven by a normalized 0..1 index signal.
///
/// Clamps by default; in loop mode the index wraps, so reading at `1.3` is
/// identical to reading at `0.3`.
pub struct TableRead {
    table: TableHandle,
    index: Sig,
    looping: bool,
    mul: Sig,
    add: Sig,
}

impl TableRead {
    /// A clamping reader over `table` driven by `index`.
    pub fn new(table: TableHandle, index: impl Into<Sig>) -> Self {
        Self {
            table,
            index: index.into(),
            looping: false,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Wrap out-of-range indices instead of clamping.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
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

struct TableReadUnit {
    table: TableId,
    index: ParamSlot,
    looping: bool,
}

impl Unit for TableReadUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let Some(table) = rc.tables.get(self.table) else {
            return Err(UnitError::new("table is missing"));
        };
        let size = table.size() as f64;
        let out = &mut outs[0];
        for i in 0..rc.frames {
            let pos = f64::from(self.index.at(rc.pool, i)) * size;
            out[i] = if self.looping {
                table.lookup_wrap(0, pos)
            } else {
                table.lookup_clamp(0, pos)
            };
        }
        Ok(UnitStatus::Continue)
    }

    fn set_param(&mut self, name: &str, slot: ParamSlot) -> bool {
        if name == "index" {
            self.index = slot;
            true
        } else {
            false
        }
    }
}

impl NodeBuilder for TableRead {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.index]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        ctx.table(&self.table)?;
        Ok(Box::new(TableReadUnit {
            table: self.table.id(),
            index: ctx.slot(&self.index, voice)?,
            looping: self.looping,
        }))
    }
}

/// Records its input into a table until the table is full.
///
/// Voice `v` writes into table channel `v` (last channel reused beyond the
/// channel count). Optional boundary fades avoid clicks at the edges of the
/// recorded region. On completion the node emits a single one-sample trigger
/// pulse on its output stream and deactivates; replaying records again from
/// the start.
pub struct TableRec {
    input: Sig,
    table: TableHandle,
    fadetime: f64,
    mul: Sig,
    add: Sig,
}

impl TableRec {
    /// Records `input` into `table` with no boundary fades.
    pub fn new(input: impl Into<Sig>, table: TableHandle) -> Self {
        Self {
            input: input.into(),
            table,
            fadetime: 0.0,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Fade-in/out time at the recording boundaries, in seconds.
    pub fn fadetime(mut self, seconds: f64) -> Self {
        self.fadetime = seconds;
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

struct TableRecUnit {
    input: ParamSlot,
    table: TableId,
    chan: usize,
    size: usize,
    fade: usize,
    write_pos: usize,
    finished: bool,
}

impl Unit for TableRecUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let out = &mut outs[0];
        out[..rc.frames].fill(0.0);
        if self.finished {
            return Ok(UnitStatus::Done);
        }
        let pool = rc.pool;
        let Some(table) = rc.tables.get_mut(self.table) else {
            return Err(UnitError::new("destination table is missing"));
        };
        let chan = self.chan.min(table.channels() - 1);
        for i in 0..rc.frames {
            if self.write_pos >= self.size {
                break;
            }
            let mut gain = 1.0f32;
            if self.fade > 0 {
                if self.write_pos < self.fade {
                    gain = self.write_pos as f32 / self.fade as f32;
                }
                let remaining = self.size - self.write_pos;
                if remaining <= self.fade {
                    gain = gain.min(remaining as f32 / self.fade as f32);
                }
            }
            let x = self.input.at(pool, i) * gain;
            table.channel_mut(chan)[self.write_pos] = x;
            self.write_pos += 1;
            if self.write_pos == self.size {
                // One-shot completion trigger.
                out[i] = 1.0;
                self.finished = true;
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
        self.write_pos = 0;
        self.finished = false;
    }
}

impl NodeBuilder for TableRec {
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
        let info = ctx.table(&self.table)?;
        if self.fadetime < 0.0 {
            return Err(Error::config("fadetime cannot be negative"));
        }
        let fade = (self.fadetime * f64::from(ctx.sample_rate())).round() as usize;
        Ok(Box::new(TableRecUnit {
            input: ctx.slot(&self.input, voice)?,
            table: self.table.id(),
            chan: voice,
            size: info.size,
            fade: fade.min(info.size / 2),
            write_pos: 0,
            finished: false,
        }))
    }
}

/// Writes into a destination table, once per cycle, the linear blend of the
/// two source tables bracketing a 0..1 control input.
///
/// All sources and the destination must be equal-sized. Control-only: the
/// node's output stream stays silent and routing it out is a no-op.
pub struct TableMorph {
    input: Sig,
    dest: TableHandle,
    sources: Vec<TableHandle>,
    mul: Sig,
    add: Sig,
}

impl TableMorph {
    /// Morphs across `sources` into `dest`, selected by `input` in `[0, 1]`.
    pub fn new(input: impl Into<Sig>, dest: TableHandle, sources: Vec<TableHandle>) -> Self {
        Self {
            input: input.into(),
            dest,
            sources,
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

struct TableMorphUnit {
    input: ParamSlot,
    dest: TableId,
    sources: Vec<TableId>,
    blend: Vec<f32>,
}

impl Unit for TableMorphUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        outs[0][..rc.frames].fill(0.0);

        let x = f64::from(self.input.at(rc.pool, 0)).clamp(0.0, 1.0);
        let scaled = x * (self.sources.len() - 1) as f64;
        let lo = scaled.floor() as usize;
        let hi = (lo + 1).min(self.sources.len() - 1);
        let frac = (scaled - scaled.floor()) as f32;

        {
            let Some(a) = rc.tables.get(self.sources[lo]) else {
                return Err(UnitError::new("morph source table is missing"));
            };
            let a = a.channel(0);
            if a.len() != self.blend.len() {
                return Err(UnitError::new("morph source size changed"));
            }
            self.blend.copy_from_slice(a);
        }
        if hi != lo && frac > 0.0 {
            let Some(b) = rc.tables.get(self.sources[hi]) else {
                return Err(UnitError::new("morph source table is missing"));
            };
            let b = b.channel(0);
            if b.len() != self.blend.len() {
                return Err(UnitError::new("morph source size changed"));
            }
            for (dst, &s) in self.blend.iter_mut().zip(b.iter()) {
                *dst += (s - *dst) * frac;
            }
        }

        let Some(dest) = rc.tables.get_mut(self.dest) else {
            return Err(UnitError::new("morph destination table is missing"));
        };
        if dest.size() != self.blend.len() {
            return Err(UnitError::new("morph destination size changed"));
        }
        dest.channel_mut(0).copy_from_slice(&self.blend);
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
}

impl NodeBuilder for TableMorph {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.input]
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

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        if self.sources.len() < 2 {
            return Err(Error::config("morph needs at least two source tables"));
        }
        let dest = ctx.table(&self.dest)?;
        for source in &self.sources {
            let info = ctx.table(source)?;
            if info.size != dest.size {
                return Err(Error::config(
                    "morph sources and destination must be equal-sized",
                ));
            }
        }
        Ok(Box::new(TableMorphUnit {
            input: ctx.slot(&self.input, voice)?,
            dest: self.dest.id(),
            sources: self.sources.iter().map(TableHandle::id).collect(),
            blend: vec![0.0; dest.size],
        }))
    }
}
