//! Constructor arguments and the multichannel-expansion rule.
//!
//! Every node parameter accepts a [`Sig`]: a plain number, a list of numbers,
//! or another node (audio-rate control). At construction time the expansion
//! resolver computes how many parallel voices the new node instantiates and
//! how each argument wraps across them:
//!
//! - a number (or a single-stream node) has fan length 1,
//! - a list has fan length `len(list)` (an empty list is an error),
//! - a multi-stream node contributes its stream count.
//!
//! The new node's stream count is the **maximum** fan length over all of its
//! parameters, `mul` and `add` included. Voice `i` then receives
//! `arg[i % len(arg)]` — shorter arguments wrap around, they are never
//! zero-padded and never an error. For node-valued arguments the wrap happens
//! at the stream level, which is how chaining multichannel nodes naturally
//! expands downstream (and why `mix` exists to collapse it back down).

use crate::error::{Error, Result};
use crate::node::NodeHandle;
use crate::stream::{StreamId, StreamPool};

/// A constructor argument: number, list of numbers, or node.
#[derive(Clone, Debug)]
pub enum Sig {
    /// A constant scalar.
    Num(f64),
    /// A list of scalars, one per voice, wrapping.
    List(Vec<f64>),
    /// An audio-rate control: one of the node's streams per voice, wrapping.
    Node(NodeHandle),
}

impl Sig {
    /// Fan length of this argument under the expansion rule.
    ///
    /// # Errors
    ///
    /// An empty list is a [`Error::Config`]: there is no value to wrap.
    pub fn fan_len(&self) -> Result<usize> {
        match self {
            Sig::Num(_) => Ok(1),
            Sig::List(values) => {
                if values.is_empty() {
                    Err(Error::config("parameter cannot be empty"))
                } else {
                    Ok(values.len())
                }
            }
            Sig::Node(handle) => Ok(handle.nstreams()),
        }
    }

    /// Scalar value for `voice` if this argument is a number or list.
    ///
    /// Node-valued arguments resolve to streams instead; see the server's
    /// build context.
    pub fn scalar_at(&self, voice: usize) -> Option<f64> {
        match self {
            Sig::Num(value) => Some(*value),
            Sig::List(values) => {
                if values.is_empty() {
                    None
                } else {
                    Some(values[voice % values.len()])
                }
            }
            Sig::Node(_) => None,
        }
    }
}

/// Stream count implied by a full parameter set: the maximum fan length.
pub fn expansion_len(args: &[&Sig]) -> Result<usize> {
    let mut n = 1;
    for arg in args {
        n = n.max(arg.fan_len()?);
    }
    Ok(n)
}

impl From<f64> for Sig {
    fn from(value: f64) -> Self {
        Sig::Num(value)
    }
}

impl From<f32> for Sig {
    fn from(value: f32) -> Self {
        Sig::Num(f64::from(value))
    }
}

impl From<i32> for Sig {
    fn from(value: i32) -> Self {
        Sig::Num(f64::from(value))
    }
}

impl From<Vec<f64>> for Sig {
    fn from(values: Vec<f64>) -> Self {
        Sig::List(values)
    }
}

impl From<&[f64]> for Sig {
    fn from(values: &[f64]) -> Self {
        Sig::List(values.to_vec())
    }
}

impl<const N: usize> From<[f64; N]> for Sig {
    fn from(values: [f64; N]) -> Self {
        Sig::List(values.to_vec())
    }
}

impl From<NodeHandle> for Sig {
    fn from(handle: NodeHandle) -> Self {
        Sig::Node(handle)
    }
}

impl From<&NodeHandle> for Sig {
    fn from(handle: &NodeHandle) -> Self {
        Sig::Node(*handle)
    }
}

/// A parameter resolved for one voice: either a constant or a live stream.
///
/// Slots are produced once at construction by the expansion resolver and
/// replaced only through explicit parameter swaps; they are never re-resolved
/// behind the caller's back.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamSlot {
    /// A constant value for every sample of the cycle.
    Fixed(f32),
    /// Sample `i` of another node's stream.
    Stream(StreamId),
}

impl ParamSlot {
    /// Value of this parameter at sample `i` of the current cycle.
    #[inline]
    pub fn at(&self, pool: &StreamPool, i: usize) -> f32 {
        match self {
            ParamSlot::Fixed(value) => *value,
            ParamSlot::Stream(id) => pool.read(*id).get(i).copied().unwrap_or(0.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeId;

    fn handle(nstreams: usize) -> NodeHandle {
        NodeHandle::new(NodeId(7), nstreams, false)
    }

    #[test]
    fn fan_lengths() {
        assert_eq!(Sig::from(440.0).fan_len().unwrap(), 1);
        assert_eq!(Sig::from([1.0, 2.0, 3.0]).fan_len().unwrap(), 3);
        assert_eq!(Sig::Node(handle(5)).fan_len().unwrap(), 5);
    }

    #[test]
    fn empty_list_is_config_error() {
        let err = Sig::List(Vec::new()).fan_len().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn expansion_is_max_over_args() {
        let a = Sig::from([0.0, 0.0, 0.0]);
        let b = Sig::from(1.0);
        let c = Sig::Node(handle(5));
        assert_eq!(expansion_len(&[&a, &b, &c]).unwrap(), 5);
    }

    #[test]
    fn list_wraps_across_voices() {
        let arg = Sig::from([10.0, 20.0, 30.0]);
        let got: Vec<f64> = (0..5).map(|v| arg.scalar_at(v).unwrap()).collect();
        assert_eq!(got, vec![10.0, 20.0, 30.0, 10.0, 20.0]);
    }

    #[test]
    fn scalar_repeats_for_every_voice() {
        let arg = Sig::from(2.5);
        assert_eq!(arg.scalar_at(0), Some(2.5));
        assert_eq!(arg.scalar_at(17), Some(2.5));
    }

    #[test]
    fn slot_reads_fixed_and_stream() {
        let mut pool = StreamPool::with_capacity(2, 4);
        pool.insert(StreamId(0), vec![0.1, 0.2, 0.3, 0.4]);

        let fixed = ParamSlot::Fixed(5.0);
        let stream = ParamSlot::Stream(StreamId(0));
        assert_eq!(fixed.at(&pool, 3), 5.0);
        assert_eq!(stream.at(&pool, 2), 0.3);
        // Past the end of the buffer reads as zero, not a panic.
        assert_eq!(stream.at(&pool, 99), 0.0);
    }
}
