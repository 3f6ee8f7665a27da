//! Tables: fixed-length sample buffers used as lookup sources.
//!
//! Tables hold waveforms, envelopes, impulse responses and recorded audio.
//! They are not part of the per-cycle graph; graph nodes read and write them.
//! A table owns one or more equal-length float buffers (channels) plus the
//! duration metadata needed to reproduce original pitch for file-backed
//! content.
//!
//! Index policy is always the *reader's* documented choice: the lookup
//! helpers here provide both wrapping and clamping forms and every
//! table-consuming node states which one it uses.

use crate::error::{Error, Result};

/// Identifier of a table in the engine's [`TablePool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TableId(pub(crate) u32);

impl TableId {
    /// Returns the raw index.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Control-side handle to a table.
#[derive(Clone, Copy, Debug)]
pub struct TableHandle {
    pub(crate) id: TableId,
}

impl TableHandle {
    /// The table's id.
    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }
}

/// An owned, fixed-length multi-channel sample buffer.
#[derive(Clone, Debug)]
pub struct TableData {
    chans: Vec<Vec<f32>>,
    duration: f64,
}

impl TableData {
    /// Creates a table from channel buffers and its duration in seconds.
    ///
    /// # Errors
    ///
    /// All channels must be equal-length and non-empty.
    pub fn new(chans: Vec<Vec<f32>>, duration: f64) -> Result<Self> {
        let size = chans.first().map_or(0, Vec::len);
        if size == 0 {
            return Err(Error::config("table size must be greater than zero"));
        }
        if chans.iter().any(|c| c.len() != size) {
            return Err(Error::config("table channels must be equal length"));
        }
        Ok(Self { chans, duration })
    }

    /// Creates a silent table of `size` samples per channel lasting
    /// `duration` seconds.
    pub fn silent(size: usize, channels: usize, duration: f64) -> Result<Self> {
        if size == 0 {
            return Err(Error::config("table size must be greater than zero"));
        }
        if channels == 0 {
            return Err(Error::config("table must have at least one channel"));
        }
        Ok(Self {
            chans: vec![vec![0.0; size]; channels],
            duration,
        })
    }

    /// Samples per channel.
    #[inline]
    pub fn size(&self) -> usize {
        self.chans[0].len()
    }

    /// Number of channels.
    #[inline]
    pub fn channels(&self) -> usize {
        self.chans.len()
    }

    /// Duration in seconds.
    #[inline]
    pub fn duration(&self) -> f64 {
        self.duration
    }

    /// Read frequency that reproduces the original pitch (`1 / duration`).
    #[inline]
    pub fn rate(&self) -> f64 {
        if self.duration > 0.0 { 1.0 / self.duration } else { 0.0 }
    }

    /// One channel's samples.
    #[inline]
    pub fn channel(&self, chan: usize) -> &[f32] {
        &self.chans[chan.min(self.chans.len() - 1)]
    }

    /// Mutable access to one channel's samples.
    #[inline]
    pub fn channel_mut(&mut self, chan: usize) -> &mut Vec<f32> {
        let last = self.chans.len() - 1;
        &mut self.chans[chan.min(last)]
    }

    /// Linear-interpolated read at fractional sample position `pos`,
    /// wrapping (looping) around the table length.
    #[inline]
    pub fn lookup_wrap(&self, chan: usize, pos: f64) -> f32 {
        let size = self.size() as f64;
        let p = pos.rem_euclid(size);
        let i0 = p.floor() as usize;
        let frac = (p - p.floor()) as f32;
        let data = self.channel(chan);
        let a = data[i0];
        let b = data[(i0 + 1) % data.len()];
        a + (b - a) * frac
    }

    /// Linear-interpolated read at fractional sample position `pos`, clamped
    /// to the table bounds.
    #[inline]
    pub fn lookup_clamp(&self, chan: usize, pos: f64) -> f32 {
        let max = (self.size() - 1) as f64;
        let p = pos.clamp(0.0, max);
        let i0 = p.floor() as usize;
        let frac = (p - p.floor()) as f32;
        let data = self.channel(chan);
        let a = data[i0];
        let b = data[(i0 + 1).min(data.len() - 1)];
        a + (b - a) * frac
    }

    /// Four-point cubic (Catmull-Rom) read at fractional position `pos`,
    /// wrapping around the table length.
    #[inline]
    pub fn lookup_cubic_wrap(&self, chan: usize, pos: f64) -> f32 {
        let size = self.size();
        let p = pos.rem_euclid(size as f64);
        let i1 = p.floor() as usize;
        let t = (p - p.floor()) as f32;
        let data = self.channel(chan);
        let i0 = (i1 + size - 1) % size;
        let i2 = (i1 + 1) % size;
        let i3 = (i1 + 2) % size;
        let (y0, y1, y2, y3) = (data[i0], data[i1], data[i2], data[i3]);
        let a = 0.5 * (3.0 * (y1 - y2) - y0 + y3);
        let b = y2 + y2 + y0 - 0.5 * (5.0 * y1 + y3);
        let c = 0.5 * (y2 - y0);
        ((a * t + b) * t + c) * t + y1
    }
}

/// Owns every table in the engine, slot-indexed by [`TableId`].
#[derive(Default)]
pub struct TablePool {
    slots: Vec<Option<TableData>>,
}

impl TablePool {
    /// Installs a table at `id`.
    pub fn insert(&mut self, id: TableId, data: TableData) {
        let idx = id.index();
        if idx >= self.slots.len() {
            self.slots.resize_with(idx + 1, || None);
        }
        self.slots[idx] = Some(data);
    }

    /// Appends a table in the next slot and returns its id. For standalone
    /// use (unit tests, offline tools); the server assigns ids itself.
    pub fn push(&mut self, data: TableData) -> TableId {
        let id = TableId(self.slots.len() as u32);
        self.insert(id, data);
        id
    }

    /// The table at `id`, if present.
    #[inline]
    pub fn get(&self, id: TableId) -> Option<&TableData> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Mutable access to the table at `id`.
    #[inline]
    pub fn get_mut(&mut self, id: TableId) -> Option<&mut TableData> {
        self.slots.get_mut(id.index()).and_then(Option::as_mut)
    }
}

// --- Analytic generators ---

/// Additive synthesis of a harmonic series into `size` samples.
///
/// `amps[k]` is the relative amplitude of harmonic `k + 1`. One full period
/// of the resulting waveform spans the table.
pub fn harmonic_series(size: usize, amps: &[f64]) -> Result<Vec<f32>> {
    if size == 0 {
        return Err(Error::config("table size must be greater than zero"));
    }
    if amps.is_empty() {
        return Err(Error::config("parameter cannot be empty"));
    }
    let mut out = vec![0.0f32; size];
    for (k, &amp) in amps.iter().enumerate() {
        if amp == 0.0 {
            continue;
        }
        let harmonic = (k + 1) as f64;
        for (i, sample) in out.iter_mut().enumerate() {
            let phase = 2.0 * std::f64::consts::PI * harmonic * i as f64 / size as f64;
            *sample += (amp * phase.sin()) as f32;
        }
    }
    Ok(out)
}

/// Fixed window shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// Rectangular (all ones).
    Rectangular,
    /// Hann window (raised cosine).
    Hann,
    /// Hamming window.
    Hamming,
    /// Blackman window.
    Blackman,
    /// Blackman-Harris window (better sidelobe suppression).
    BlackmanHarris,
}

impl Window {
    /// Applies the window to a buffer in place.
    pub fn apply(&self, buffer: &mut [f32]) {
        let n = buffer.len();
        if n == 0 {
            return;
        }
        let step = 2.0 * std::f32::consts::PI / n as f32;
        match self {
            Window::Rectangular => {}
            Window::Hann => {
                for (i, sample) in buffer.iter_mut().enumerate() {
                    *sample *= 0.5 * (1.0 - (step * i as f32).cos());
                }
            }
            Window::Hamming => {
                for (i, sample) in buffer.iter_mut().enumerate() {
                    *sample *= 0.54 - 0.46 * (step * i as f32).cos();
                }
            }
            Window::Blackman => {
                for (i, sample) in buffer.iter_mut().enumerate() {
                    let x = step * i as f32;
                    *sample *= 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos();
                }
            }
            Window::BlackmanHarris => {
                for (i, sample) in buffer.iter_mut().enumerate() {
                    let x = step * i as f32;
                    *sample *= 0.35875 - 0.48829 * x.cos() + 0.14128 * (2.0 * x).cos()
                        - 0.01168 * (3.0 * x).cos();
                }
            }
        }
    }

    /// The window coefficients for `size` samples.
    pub fn fill(&self, size: usize) -> Result<Vec<f32>> {
        if size == 0 {
            return Err(Error::config("table size must be greater than zero"));
        }
        let mut out = vec![1.0; size];
        self.apply(&mut out);
        Ok(out)
    }
}

/// Interpolation used between breakpoints of a curve table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SegmentKind {
    /// Straight lines between points.
    Linear,
    /// Half-cosine easing between points.
    Cosine,
    /// Catmull-Rom cubic through the points.
    Cubic,
    /// Power-curve segments, `value = a + (b - a) * t^exp`. The exponent
    /// must be positive.
    Exponential(f64),
}

/// Renders a breakpoint-interpolated curve into `size` samples.
///
/// `points` are `(time, value)` pairs with time normalized to `[0, 1]`,
/// sorted ascending, starting at 0 and ending at 1.
pub fn breakpoint_curve(size: usize, points: &[(f64, f64)], kind: SegmentKind) -> Result<Vec<f32>> {
    if size == 0 {
        return Err(Error::config("table size must be greater than zero"));
    }
    if points.len() < 2 {
        return Err(Error::config("curve needs at least two breakpoints"));
    }
    if points[0].0 != 0.0 || points[points.len() - 1].0 != 1.0 {
        return Err(Error::config("curve breakpoints must span [0, 1]"));
    }
    if points.windows(2).any(|w| w[1].0 < w[0].0) {
        return Err(Error::config("curve breakpoints must be sorted by time"));
    }
    if let SegmentKind::Exponential(exp) = kind
        && exp <= 0.0
    {
        return Err(Error::config("curve exponent must be positive"));
    }

    let mut out = vec![0.0f32; size];
    let mut seg = 0;
    for (i, sample) in out.iter_mut().enumerate() {
        let x = if size == 1 { 0.0 } else { i as f64 / (size - 1) as f64 };
        while seg + 2 < points.len() && x > points[seg + 1].0 {
            seg += 1;
        }
        let (t0, v0) = points[seg];
        let (t1, v1) = points[seg + 1];
        let span = t1 - t0;
        let t = if span > 0.0 { ((x - t0) / span).clamp(0.0, 1.0) } else { 1.0 };
        let value = match kind {
            SegmentKind::Linear => v0 + (v1 - v0) * t,
            SegmentKind::Cosine => {
                let eased = (1.0 - (std::f64::consts::PI * t).cos()) * 0.5;
                v0 + (v1 - v0) * eased
            }
            SegmentKind::Cubic => {
                let vm1 = if seg == 0 { v0 } else { points[seg - 1].1 };
                let vp2 = if seg + 2 < points.len() { points[seg + 2].1 } else { v1 };
                let a = 0.5 * (3.0 * (v0 - v1) - vm1 + vp2);
                let b = v1 + v1 + vm1 - 0.5 * (5.0 * v0 + vp2);
                let c = 0.5 * (v1 - vm1);
                ((a * t + b) * t + c) * t + v0
            }
            SegmentKind::Exponential(exp) => v0 + (v1 - v0) * t.powf(exp),
        };
        *sample = value as f32;
    }
    Ok(out)
}

// --- Table builders ---

/// Recipe for a table, consumed by `Server::add_table`.
pub trait TableBuilder {
    /// Renders the table contents at the server's sampling rate.
    fn build(&self, sample_rate: f32) -> Result<TableData>;
}

/// Harmonic-series additive waveform table.
#[derive(Debug, Clone)]
pub struct HarmTable {
    amps: Vec<f64>,
    size: usize,
}

impl HarmTable {
    /// One period of a waveform with the given relative harmonic amplitudes.
    pub fn new(amps: impl Into<Vec<f64>>) -> Self {
        Self {
            amps: amps.into(),
            size: 8192,
        }
    }

    /// Table length in samples (default 8192).
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl TableBuilder for HarmTable {
    fn build(&self, sample_rate: f32) -> Result<TableData> {
        let samples = harmonic_series(self.size, &self.amps)?;
        let duration = f64::from(self.size as u32) / f64::from(sample_rate);
        TableData::new(vec![samples], duration)
    }
}

/// Fixed-shape window table.
#[derive(Debug, Clone)]
pub struct WinTable {
    window: Window,
    size: usize,
}

impl WinTable {
    /// A window of the given shape.
    pub fn new(window: Window) -> Self {
        Self { window, size: 8192 }
    }

    /// Table length in samples (default 8192).
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl TableBuilder for WinTable {
    fn build(&self, sample_rate: f32) -> Result<TableData> {
        let samples = self.window.fill(self.size)?;
        let duration = f64::from(self.size as u32) / f64::from(sample_rate);
        TableData::new(vec![samples], duration)
    }
}

/// Breakpoint-interpolated curve table.
#[derive(Debug, Clone)]
pub struct CurveTable {
    points: Vec<(f64, f64)>,
    kind: SegmentKind,
    size: usize,
}

impl CurveTable {
    /// A curve through `(time, value)` breakpoints with time in `[0, 1]`.
    pub fn new(points: impl Into<Vec<(f64, f64)>>, kind: SegmentKind) -> Self {
        Self {
            points: points.into(),
            kind,
            size: 8192,
        }
    }

    /// Table length in samples (default 8192).
    pub fn size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}

impl TableBuilder for CurveTable {
    fn build(&self, sample_rate: f32) -> Result<TableData> {
        let samples = breakpoint_curve(self.size, &self.points, self.kind)?;
        let duration = f64::from(self.size as u32) / f64::from(sample_rate);
        TableData::new(vec![samples], duration)
    }
}

/// Empty (silent) table, typically a recording destination.
#[derive(Debug, Clone)]
pub struct NewTable {
    length: f64,
    channels: usize,
}

impl NewTable {
    /// A silent table lasting `length` seconds at the server rate.
    pub fn new(length: f64) -> Self {
        Self {
            length,
            channels: 1,
        }
    }

    /// Channel count (default 1).
    pub fn channels(mut self, channels: usize) -> Self {
        self.channels = channels;
        self
    }
}

impl TableBuilder for NewTable {
    fn build(&self, sample_rate: f32) -> Result<TableData> {
        if self.length <= 0.0 {
            return Err(Error::config("table length must be positive"));
        }
        let size = (self.length * f64::from(sample_rate)).round() as usize;
        TableData::silent(size, self.channels, self.length)
    }
}

/// Sound-file-backed table.
///
/// Decoding happens eagerly through the [`SoundDecoder`] contract; the
/// builder then just installs the decoded buffers. The duration (and thus
/// [`TableData::rate`]) reflects the file's own sampling rate, so reading one
/// table period per `1 / duration` seconds reproduces the original pitch.
///
/// [`SoundDecoder`]: crate::backend::SoundDecoder
#[derive(Debug, Clone)]
pub struct SndTable {
    data: TableData,
}

impl SndTable {
    /// Decodes `[start, stop)` seconds of a sound file (`stop` 0 = end of
    /// file) into a table.
    pub fn read(
        decoder: &dyn crate::backend::SoundDecoder,
        path: impl AsRef<std::path::Path>,
        start: f64,
        stop: f64,
    ) -> Result<Self> {
        let path = path.as_ref();
        let info = decoder.probe(path)?;
        let chans = decoder.decode(path, start, stop, None)?;
        let frames = chans.first().map_or(0, Vec::len);
        let duration = frames as f64 / f64::from(info.sample_rate);
        Ok(Self {
            data: TableData::new(chans, duration)?,
        })
    }
}

impl TableBuilder for SndTable {
    fn build(&self, _sample_rate: f32) -> Result<TableData> {
        Ok(self.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_is_config_error() {
        assert!(matches!(
            TableData::silent(0, 1, 1.0).unwrap_err(),
            Error::Config(_)
        ));
        assert!(matches!(harmonic_series(0, &[1.0]).unwrap_err(), Error::Config(_)));
        assert!(matches!(Window::Hann.fill(0).unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn rate_is_inverse_duration() {
        let t = TableData::silent(44100, 1, 2.0).unwrap();
        assert_eq!(t.rate(), 0.5);
    }

    #[test]
    fn wrap_read_is_periodic() {
        let data = TableData::new(vec![vec![0.0, 1.0, 2.0, 3.0]], 1.0).unwrap();
        // Normalized position 1.3 of a loop reader equals 0.3: here in raw
        // sample positions, 4 * 1.3 == 5.2 wraps to 1.2.
        let wrapped = data.lookup_wrap(0, 5.2);
        let direct = data.lookup_wrap(0, 1.2);
        assert!((wrapped - direct).abs() < 1e-6);
    }

    #[test]
    fn clamp_read_pins_to_ends() {
        let data = TableData::new(vec![vec![1.0, 2.0, 3.0]], 1.0).unwrap();
        assert_eq!(data.lookup_clamp(0, -4.0), 1.0);
        assert_eq!(data.lookup_clamp(0, 99.0), 3.0);
    }

    #[test]
    fn harmonic_series_fundamental_is_sine() {
        let size = 512;
        let table = harmonic_series(size, &[1.0]).unwrap();
        for (i, &v) in table.iter().enumerate() {
            let want = (2.0 * std::f64::consts::PI * i as f64 / size as f64).sin() as f32;
            assert!((v - want).abs() < 1e-5, "mismatch at {i}");
        }
    }

    #[test]
    fn hann_window_ends_near_zero_peaks_mid() {
        let w = Window::Hann.fill(128).unwrap();
        assert!(w[0].abs() < 1e-6);
        assert!((w[64] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn linear_curve_endpoints() {
        let curve =
            breakpoint_curve(101, &[(0.0, 0.0), (0.5, 1.0), (1.0, 0.0)], SegmentKind::Linear)
                .unwrap();
        assert_eq!(curve[0], 0.0);
        assert!((curve[50] - 1.0).abs() < 1e-6);
        assert!(curve[100].abs() < 1e-6);
    }

    #[test]
    fn unsorted_breakpoints_rejected() {
        let err = breakpoint_curve(16, &[(0.0, 0.0), (0.8, 1.0), (0.2, 0.5), (1.0, 0.0)], SegmentKind::Linear)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn non_positive_exponent_rejected() {
        let err = breakpoint_curve(16, &[(0.0, 0.0), (1.0, 1.0)], SegmentKind::Exponential(0.0))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn cosine_curve_is_monotonic_on_rising_segment() {
        let curve =
            breakpoint_curve(64, &[(0.0, 0.0), (1.0, 1.0)], SegmentKind::Cosine).unwrap();
        for w in curve.windows(2) {
            assert!(w[1] >= w[0]);
        }
    }
}
