//! Granular synthesis over a source table.

use corriente_core::{
    BuildCtx, Error, NodeBuilder, ParamSlot, Render, Result, Sig, TableHandle, TableId, Unit,
    UnitError, UnitStatus,
};

/// A granular synthesizer reading grains from a source table through an
/// envelope table.
///
/// `pitch` sets the per-grain read increment, `pos` the grain start position
/// in table samples, `dur` the grain length in seconds — all audio-rate
/// capable and sampled at each grain (re)spawn. Grain positions clamp to the
/// table bounds; spawn jitter comes from a deterministic per-voice generator
/// so renders are reproducible.
pub struct Granulator {
    table: TableHandle,
    env: TableHandle,
    pitch: Sig,
    pos: Sig,
    dur: Sig,
    grains: usize,
    mul: Sig,
    add: Sig,
}

impl Granulator {
    /// Eight 100 ms grains at original pitch, reading from `table` with the
    /// amplitude shape of `env`.
    pub fn new(table: TableHandle, env: TableHandle) -> Self {
        Self {
            table,
            env,
            pitch: Sig::Num(1.0),
            pos: Sig::Num(0.0),
            dur: Sig::Num(0.1),
            grains: 8,
            mul: Sig::Num(1.0),
            add: Sig::Num(0.0),
        }
    }

    /// Read increment (1.0 = original pitch).
    pub fn pitch(mut self, value: impl Into<Sig>) -> Self {
        self.pitch = value.into();
        self
    }

    /// Grain start position in table samples.
    pub fn pos(mut self, value: impl Into<Sig>) -> Self {
        self.pos = value.into();
        self
    }

    /// Grain duration in seconds.
    pub fn dur(mut self, value: impl Into<Sig>) -> Self {
        self.dur = value.into();
        self
    }

    /// Number of overlapping grains.
    pub fn grains(mut self, grains: usize) -> Self {
        self.grains = grains;
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

#[derive(Clone, Copy, Default)]
struct Grain {
    table_pos: f64,
    inc: f64,
    age: usize,
    len: usize,
}

struct GranulatorUnit {
    table: TableId,
    env: TableId,
    pitch: ParamSlot,
    pos: ParamSlot,
    dur: ParamSlot,
    grains: Vec<Grain>,
    scale: f32,
    rng: u32,
    seed: u32,
    primed: bool,
}

impl GranulatorUnit {
    #[inline]
    fn jitter(&mut self) -> f64 {
        self.rng = self.rng.wrapping_mul(1664525).wrapping_add(1013904223);
        f64::from(self.rng >> 8) / 16_777_216.0
    }
}

impl Unit for GranulatorUnit {
    fn process(
        &mut self,
        rc: &mut Render<'_>,
        outs: &mut [Vec<f32>],
    ) -> std::result::Result<UnitStatus, UnitError> {
        let out = &mut outs[0];
        let pool = rc.pool;
        let Some(table) = rc.tables.get(self.table) else {
            return Err(UnitError::new("source table is missing"));
        };
        let Some(env) = rc.tables.get(self.env) else {
            return Err(UnitError::new("envelope table is missing"));
        };
        let table_max = (table.size() - 1) as f64;
        let env_max = (env.size() - 1) as f64;
        let sr = f64::from(rc.sample_rate);

        // Stagger grain ages on the very first cycle so the overlaps spread
        // evenly instead of firing in phase.
        if !self.primed {
            let len = (f64::from(self.dur.at(pool, 0)).max(0.001) * sr) as usize;
            let count = self.grains.len();
            for (k, grain) in self.grains.iter_mut().enumerate() {
                grain.len = len.max(1);
                grain.age = k * grain.len / count;
                grain.table_pos = f64::from(self.pos.at(pool, 0)).clamp(0.0, table_max);
                grain.inc = f64::from(self.pitch.at(pool, 0));
            }
            self.primed = true;
        }

        for i in 0..rc.frames {
            let mut acc = 0.0f32;
            for g in 0..self.grains.len() {
                let mut grain = self.grains[g];
                if grain.age >= grain.len {
                    let dur = f64::from(self.dur.at(pool, i)).max(0.001);
                    let jit = (self.jitter() - 0.5) * dur * 0.05 * sr;
                    grain.len = ((dur * sr) as usize).max(1);
                    grain.age = 0;
                    grain.table_pos =
                        (f64::from(self.pos.at(pool, i)) + jit).clamp(0.0, table_max);
                    grain.inc = f64::from(self.pitch.at(pool, i));
                }
                let env_pos = grain.age as f64 / grain.len as f64 * env_max;
                let amp = env.lookup_clamp(0, env_pos);
                acc += table.lookup_clamp(0, grain.table_pos) * amp;
                grain.table_pos = (grain.table_pos + grain.inc).clamp(0.0, table_max);
                grain.age += 1;
                self.grains[g] = grain;
            }
            out[i] = acc * self.scale;
        }
        Ok(UnitStatus::Continue)
    }

    fn set_param(&mut self, name: &str, slot: ParamSlot) -> bool {
        match name {
            "pitch" => self.pitch = slot,
            "pos" => self.pos = slot,
            "dur" => self.dur = slot,
            _ => return false,
        }
        true
    }

    fn reset(&mut self) {
        self.rng = self.seed;
        self.primed = false;
        for grain in &mut self.grains {
            *grain = Grain::default();
        }
    }
}

impl NodeBuilder for Granulator {
    fn params(&self) -> Vec<&Sig> {
        vec![&self.pitch, &self.pos, &self.dur]
    }

    fn mul(&self) -> &Sig {
        &self.mul
    }

    fn add(&self) -> &Sig {
        &self.add
    }

    fn make_unit(&self, ctx: &mut BuildCtx<'_>, voice: usize) -> Result<Box<dyn Unit>> {
        if self.grains == 0 {
            return Err(Error::config("grain count must be at least one"));
        }
        ctx.table(&self.table)?;
        ctx.table(&self.env)?;
        let seed = 0x51ab_7e11u32 ^ (voice as u32).wrapping_mul(0x9E37_79B9);
        Ok(Box::new(GranulatorUnit {
            table: self.table.id(),
            env: self.env.id(),
            pitch: ctx.slot(&self.pitch, voice)?,
            pos: ctx.slot(&self.pos, voice)?,
            dur: ctx.slot(&self.dur, voice)?,
            grains: vec![Grain::default(); self.grains],
            scale: 1.0 / (self.grains as f32).sqrt(),
            rng: seed,
            seed,
            primed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corriente_core::{EventMap, Render, StreamPool, TableData, TablePool, Window};

    fn tables() -> (TablePool, TableId, TableId) {
        let mut pool = TablePool::default();
        let src = pool.push(TableData::new(vec![vec![1.0f32; 4096]], 1.0).unwrap());
        let env = pool.push(TableData::new(vec![Window::Hann.fill(512).unwrap()], 1.0).unwrap());
        (pool, src, env)
    }

    fn unit(src: TableId, env: TableId, grains: usize) -> GranulatorUnit {
        GranulatorUnit {
            table: src,
            env,
            pitch: ParamSlot::Fixed(1.0),
            pos: ParamSlot::Fixed(0.0),
            dur: ParamSlot::Fixed(0.02),
            grains: vec![Grain::default(); grains],
            scale: 1.0 / (grains as f32).sqrt(),
            rng: 7,
            seed: 7,
            primed: false,
        }
    }

    fn run(unit: &mut GranulatorUnit, tables: &mut TablePool, frames: usize, cycles: usize) -> Vec<f32> {
        let pool = StreamPool::with_capacity(0, frames);
        let events = EventMap::default();
        let mut collected = Vec::new();
        let mut outs = vec![vec![0.0f32; frames]];
        for _ in 0..cycles {
            let mut rc = Render {
                pool: &pool,
                tables: &mut *tables,
                events: &events,
                input: &[],
                sample_rate: 44100.0,
                frames,
            };
            unit.process(&mut rc, &mut outs).unwrap();
            collected.extend_from_slice(&outs[0]);
        }
        collected
    }

    #[test]
    fn produces_steady_energy_from_constant_table() {
        let (mut tables, src, env) = tables();
        let mut g = unit(src, env, 8);
        let out = run(&mut g, &mut tables, 256, 8);
        // After the first grain period the overlapped Hann envelopes sum to
        // roughly constant energy; just assert it is alive and bounded.
        let tail = &out[1024..];
        assert!(tail.iter().any(|v| v.abs() > 0.1));
        assert!(tail.iter().all(|v| v.abs() < 8.0));
    }

    #[test]
    fn missing_table_is_a_unit_error() {
        let (real, src, env) = tables();
        drop(real);
        // Fresh empty pool: the recorded ids resolve to nothing.
        let mut tables = TablePool::default();
        let mut g = unit(src, env, 4);
        let pool = StreamPool::with_capacity(0, 16);
        let events = EventMap::default();
        let mut outs = vec![vec![0.0f32; 16]];
        let mut rc = Render {
            pool: &pool,
            tables: &mut tables,
            events: &events,
            input: &[],
            sample_rate: 44100.0,
            frames: 16,
        };
        assert!(g.process(&mut rc, &mut outs).is_err());
    }

    #[test]
    fn deterministic_across_resets() {
        let (mut tables, src, env) = tables();
        let mut g = unit(src, env, 4);
        let first = run(&mut g, &mut tables, 128, 4);
        g.reset();
        let second = run(&mut g, &mut tables, 128, 4);
        assert_eq!(first, second);
    }
}
