//! Click-free input swapping.
//!
//! [`InputFader`] is the small per-voice state machine behind every
//! hot-swappable `input` parameter. It has two states: **steady** (emit the
//! current input) and **fading** (linear blend from the old input to the new
//! one, advanced once per sample inside the owning unit's processing
//! routine).
//!
//! Re-swapping while a fade is in flight rebases instead of stacking: the
//! last blended output value is frozen as the new fade source and the fade
//! restarts toward the latest target. Output is continuous at the rebase
//! instant and there is never more than one fade in progress.

use crate::sig::ParamSlot;
use crate::stream::StreamPool;

/// Linear crossfade between two parameter slots.
#[derive(Clone, Debug)]
pub struct InputFader {
    from: ParamSlot,
    to: ParamSlot,
    /// Samples elapsed in the current fade.
    pos: usize,
    /// Fade length in samples; 0 means steady.
    total: usize,
    /// Last emitted value, the rebase point for mid-fade swaps.
    last: f32,
}

impl InputFader {
    /// Creates a fader resting on `slot`.
    pub fn steady(slot: ParamSlot) -> Self {
        Self {
            from: slot,
            to: slot,
            pos: 0,
            total: 0,
            last: 0.0,
        }
    }

    /// Swaps to a new input over `fade_samples` samples.
    ///
    /// With `fade_samples == 0` the switch is instantaneous. While already
    /// fading, the current blended value becomes the new fade source.
    pub fn swap(&mut self, slot: ParamSlot, fade_samples: usize) {
        if fade_samples == 0 {
            self.from = slot;
            self.to = slot;
            self.total = 0;
            self.pos = 0;
            return;
        }
        self.from = if self.is_fading() {
            ParamSlot::Fixed(self.last)
        } else {
            self.to
        };
        self.to = slot;
        self.total = fade_samples;
        self.pos = 0;
    }

    /// Whether a fade is currently in flight.
    #[inline]
    pub fn is_fading(&self) -> bool {
        self.total != 0
    }

    /// The slot the fader is resting on or heading toward.
    #[inline]
    pub fn target(&self) -> ParamSlot {
        self.to
    }

    /// Emits the faded value at sample `i` of the current cycle and advances
    /// the fade by one sample.
    #[inline]
    pub fn advance(&mut self, pool: &StreamPool, i: usize) -> f32 {
        let value = if self.total == 0 {
            self.to.at(pool, i)
        } else {
            let t = self.pos as f32 / self.total as f32;
            let blended = self.from.at(pool, i) * (1.0 - t) + self.to.at(pool, i) * t;
            self.pos += 1;
            if self.pos >= self.total {
                self.from = self.to;
                self.total = 0;
                self.pos = 0;
            }
            blended
        };
        self.last = value;
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> StreamPool {
        StreamPool::with_capacity(0, 8)
    }

    #[test]
    fn steady_passes_target_through() {
        let pool = pool();
        let mut fader = InputFader::steady(ParamSlot::Fixed(1.0));
        for i in 0..8 {
            assert_eq!(fader.advance(&pool, i), 1.0);
        }
        assert!(!fader.is_fading());
    }

    #[test]
    fn fade_is_linear_and_settles() {
        let pool = pool();
        let mut fader = InputFader::steady(ParamSlot::Fixed(0.0));
        fader.swap(ParamSlot::Fixed(1.0), 4);

        let ramp: Vec<f32> = (0..4).map(|i| fader.advance(&pool, i)).collect();
        assert_eq!(ramp, vec![0.0, 0.25, 0.5, 0.75]);
        assert!(!fader.is_fading());
        assert_eq!(fader.advance(&pool, 4), 1.0);
    }

    #[test]
    fn instant_swap_with_zero_fade() {
        let pool = pool();
        let mut fader = InputFader::steady(ParamSlot::Fixed(0.0));
        fader.swap(ParamSlot::Fixed(3.0), 0);
        assert_eq!(fader.advance(&pool, 0), 3.0);
        assert!(!fader.is_fading());
    }

    #[test]
    fn reswap_mid_fade_rebases_without_jump() {
        let pool = pool();
        let mut fader = InputFader::steady(ParamSlot::Fixed(0.0));
        fader.swap(ParamSlot::Fixed(1.0), 10);

        let mut prev = 0.0;
        for i in 0..5 {
            prev = fader.advance(&pool, i);
        }
        // Rebase toward a new target mid-fade.
        fader.swap(ParamSlot::Fixed(-1.0), 10);
        let first_after = fader.advance(&pool, 5);
        // Continuous at the rebase instant: first sample starts from the
        // frozen blend, not from the new target.
        assert!((first_after - prev).abs() <= 0.2001, "jump: {prev} -> {first_after}");
        assert!(fader.is_fading());

        // Drive the fade to completion; it must land on the latest target.
        for i in 0..10 {
            fader.advance(&pool, 6 + i);
        }
        assert_eq!(fader.advance(&pool, 16), -1.0);
    }

    #[test]
    fn per_sample_delta_bounded_by_fade_slope() {
        let pool = pool();
        let mut fader = InputFader::steady(ParamSlot::Fixed(0.0));
        let total = 64;
        fader.swap(ParamSlot::Fixed(1.0), total);

        let bound = 1.0 / total as f32 + 1e-6;
        let mut prev = fader.advance(&pool, 0);
        for i in 1..(total + 8) {
            let v = fader.advance(&pool, i);
            assert!((v - prev).abs() <= bound, "delta too large at {i}");
            prev = v;
        }
    }
}
