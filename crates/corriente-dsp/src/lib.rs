//! Corriente DSP — the node library for the corriente audio engine.
//!
//! Every type here is a [`NodeBuilder`](corriente_core::NodeBuilder): a
//! recipe the server expands into per-voice processing units under the
//! multichannel-expansion rule. All parameters accept
//! [`Sig`](corriente_core::Sig) values — numbers, lists, or other nodes for
//! audio-rate control.
//!
//! # Index policies
//!
//! Out-of-range positions never crash; each reader documents its policy:
//! oscillator phase always wraps ([`Sine`], [`Phasor`], [`Osc`]); positional
//! table readers clamp by default and wrap only in explicit loop mode
//! ([`TableRead`], [`Granulator`]).
//!
//! # Hot-swappable inputs
//!
//! Filter and delay inputs go through the engine's input fader: swapping the
//! source live crossfades instead of clicking.

pub mod control;
pub mod delay;
pub mod filter;
pub mod granular;
pub mod osc;
pub mod resample;
pub mod spectral;
pub mod tablenodes;

pub use control::{AudioIn, CtrlIn, Fader};
pub use delay::Delay;
pub use filter::{Biquad, FilterKind, Tone};
pub use granular::Granulator;
pub use osc::{Noise, Phasor, Sine, SineLoop};
pub use resample::{Resample, ResampleMode};
pub use spectral::{Fft, Ifft};
pub use tablenodes::{Osc, OscInterp, TableMorph, TableRead, TableRec};

#[cfg(test)]
pub(crate) mod testutil {
    //! Minimal harness for driving a unit outside a server.

    use corriente_core::{EventMap, Render, StreamPool, TablePool, Unit, UnitStatus};

    /// Drives `unit` for `cycles` cycles of `frames` frames against empty
    /// pools, returning the concatenated first output stream.
    pub fn run_unit(unit: &mut dyn Unit, sample_rate: f32, frames: usize, cycles: usize) -> Vec<f32> {
        let pool = StreamPool::with_capacity(0, frames);
        let mut tables = TablePool::default();
        let events = EventMap::default();
        let mut collected = Vec::with_capacity(frames * cycles);
        let mut outs = vec![vec![0.0f32; frames]];
        for _ in 0..cycles {
            let mut rc = Render {
                pool: &pool,
                tables: &mut tables,
                events: &events,
                input: &[],
                sample_rate,
                frames,
            };
            let status = unit.process(&mut rc, &mut outs).expect("unit failed");
            assert!(matches!(status, UnitStatus::Continue | UnitStatus::Done));
            collected.extend_from_slice(&outs[0]);
        }
        collected
    }
}
