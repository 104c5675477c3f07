//! Identifier strip codec.
//!
//! Encodes an integer identifier into a horizontal band of solid
//! colour cells drawn across the frame, and recovers it from sampled
//! luma.
//!
//! ## Cell layout
//!
//! ```text
//! | quiet (0…0) | guard | data bits MSB → LSB | guard | quiet (0…0) |
//! ```
//!
//! Cells tile the frame width evenly. Cell boundaries are rounded to
//! whole pixels and the last cell is closed at the frame edge, so it
//! absorbs the rounding remainder.
//!
//! ## Sampling
//!
//! Each cell is sampled inside an inset rectangle (15 % of the cell
//! width on each side, 30 % of the band height top and bottom) to keep
//! clear of edge bleed introduced by scaling or compression. A pixel
//! is part of the sample when its centre lies inside the inset
//! rectangle, which with rounded boundaries guarantees it belongs to
//! the sampled cell.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::StampError;
use crate::frame::{Rect, Rgb, VideoFrame};

/// Horizontal sampling inset, as a fraction of the cell width.
const CELL_INSET: f64 = 0.15;
/// Vertical sampling inset, as a fraction of the band height.
const BAND_INSET: f64 = 0.30;
/// Iteration cap for the two-class-mean threshold.
pub const MAX_THRESHOLD_ITERATIONS: u32 = 6;
/// Convergence tolerance for the two-class-mean threshold.
pub const THRESHOLD_EPSILON: f32 = 1e-3;
/// Below this fraction of the configured colour contrast the sampled
/// lumas are treated as a single class.
const MIN_RELATIVE_SPREAD: f32 = 0.25;

// ── StripSpec ────────────────────────────────────────────────────

/// Where the strip band sits in the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BandPosition {
    Top,
    #[default]
    Bottom,
}

/// Strip configuration shared by the encoder and decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StripSpec {
    /// Number of data bits (1..=64).
    pub bits: u32,
    /// Quiet cells (always 0) on each side.
    pub quiet_cells: u32,
    /// Guard pattern bracketing the data bits, each entry 0 or 1.
    pub guard: Vec<u8>,
    /// Band height in pixels.
    pub band_height: u32,
    /// Band placement.
    pub position: BandPosition,
    /// Colour of a 0 cell.
    pub zero_color: Rgb,
    /// Colour of a 1 cell.
    pub one_color: Rgb,
}

impl Default for StripSpec {
    fn default() -> Self {
        Self {
            bits: 32,
            quiet_cells: 0,
            guard: Vec::new(),
            band_height: 30,
            position: BandPosition::Bottom,
            zero_color: Rgb::WHITE,
            one_color: Rgb::BLACK,
        }
    }
}

impl StripSpec {
    /// Total number of cells: `2·quiet + 2·|guard| + bits`.
    pub fn cell_count(&self) -> usize {
        2 * self.quiet_cells as usize + 2 * self.guard.len() + self.bits as usize
    }

    /// Cell indices carrying the data bits.
    pub fn data_window(&self) -> Range<usize> {
        let start = self.quiet_cells as usize + self.guard.len();
        start..start + self.bits as usize
    }

    /// Check that the spec can round-trip an identifier.
    pub fn validate(&self) -> Result<(), StampError> {
        if self.bits == 0 || self.bits > 64 {
            return Err(StampError::InvalidConfig(format!(
                "strip bits must be in 1..=64, got {}",
                self.bits
            )));
        }
        if self.band_height == 0 {
            return Err(StampError::InvalidConfig("strip band height must be non-zero".into()));
        }
        if self.guard.iter().any(|&g| g > 1) {
            return Err(StampError::InvalidConfig("guard pattern entries must be 0 or 1".into()));
        }
        if (self.zero_color.luma() - self.one_color.luma()).abs() < f32::EPSILON {
            return Err(StampError::InvalidConfig(
                "strip colours must differ in luma".into(),
            ));
        }
        Ok(())
    }

    /// The band rectangle for a `width × height` frame.
    pub fn band_rect(&self, width: u32, height: u32) -> Rect {
        let h = self.band_height.min(height);
        let y = match self.position {
            BandPosition::Top => 0,
            BandPosition::Bottom => height - h,
        };
        Rect::new(0, y, width, h)
    }

    /// Cell values for `identifier`, left to right.
    pub fn cells(&self, identifier: u64) -> Vec<bool> {
        let quiet = self.quiet_cells as usize;
        let mut cells = Vec::with_capacity(self.cell_count());
        cells.extend(std::iter::repeat_n(false, quiet));
        cells.extend(self.guard.iter().map(|&g| g > 0));
        for i in 0..self.bits {
            let shift = self.bits - 1 - i;
            let bit = identifier.checked_shr(shift).unwrap_or(0) & 1;
            cells.push(bit == 1);
        }
        cells.extend(self.guard.iter().map(|&g| g > 0));
        cells.extend(std::iter::repeat_n(false, quiet));
        cells
    }

    fn color_for(&self, bit: bool) -> Rgb {
        if bit { self.one_color } else { self.zero_color }
    }

    /// `true` when a 1 cell renders darker than a 0 cell.
    fn one_is_darker(&self) -> bool {
        self.one_color.luma() < self.zero_color.luma()
    }
}

/// Pixel column ranges of `cells` cells tiled across `width`.
fn cell_spans(width: u32, cells: usize) -> Vec<Range<u32>> {
    let w = width as u64;
    let n = cells as u64;
    let boundary = |i: u64| ((2 * i * w + n) / (2 * n)) as u32;
    (0..n)
        .map(|i| {
            let end = if i + 1 == n { width } else { boundary(i + 1) };
            boundary(i)..end
        })
        .collect()
}

// ── EncodedStrip ─────────────────────────────────────────────────

/// A rendered strip for one identifier at one frame width.
///
/// The band is uniform vertically, so a single row of colours is kept
/// and repeated over the band height when drawn.
#[derive(Debug, Clone)]
pub struct EncodedStrip {
    identifier: u64,
    width: u32,
    spec: StripSpec,
    cells: Vec<bool>,
    row: Vec<Rgb>,
}

impl EncodedStrip {
    pub fn identifier(&self) -> u64 {
        self.identifier
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn cells(&self) -> &[bool] {
        &self.cells
    }

    /// One row of the band, `width` pixels long.
    pub fn row(&self) -> &[Rgb] {
        &self.row
    }

    /// Paint the band into `frame` in place.
    pub fn draw(&self, frame: &mut VideoFrame) {
        let band = self.spec.band_rect(frame.width, frame.height);
        let width = self.width.min(frame.width);
        for y in band.y..band.y + band.height {
            for (x, &color) in self.row.iter().enumerate().take(width as usize) {
                frame.set_rgb(x as u32, y, color);
            }
        }
    }
}

/// Render `identifier` as a strip `width` pixels wide.
///
/// Returns `None` only when `width` or `spec.bits` is zero.
pub fn encode(identifier: u64, spec: &StripSpec, width: u32) -> Option<EncodedStrip> {
    if width == 0 || spec.bits == 0 {
        return None;
    }
    let cells = spec.cells(identifier);
    let mut row = vec![spec.zero_color; width as usize];
    for (span, &bit) in cell_spans(width, cells.len()).into_iter().zip(&cells) {
        let color = spec.color_for(bit);
        for x in span {
            row[x as usize] = color;
        }
    }
    Some(EncodedStrip {
        identifier,
        width,
        spec: spec.clone(),
        cells,
        row,
    })
}

// ── StripCache ───────────────────────────────────────────────────

/// Keeps the last rendered strip and rebuilds it lazily when the
/// identifier, width, or spec changes.
#[derive(Debug, Default)]
pub struct StripCache {
    cached: Option<EncodedStrip>,
    rebuilds: u64,
}

impl StripCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_encode(
        &mut self,
        identifier: u64,
        spec: &StripSpec,
        width: u32,
    ) -> Option<&EncodedStrip> {
        let stale = match &self.cached {
            Some(strip) => {
                strip.identifier != identifier || strip.width != width || strip.spec != *spec
            }
            None => true,
        };
        if stale {
            self.cached = encode(identifier, spec, width);
            self.rebuilds += 1;
        }
        self.cached.as_ref()
    }

    pub fn invalidate(&mut self) {
        self.cached = None;
    }

    /// How many times the strip has been rebuilt.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }
}

// ── Threshold ────────────────────────────────────────────────────

/// How sampled cell lumas are split into 0 and 1.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Threshold {
    /// Caller-supplied luma threshold in `0.0..=1.0`.
    Fixed(f32),
    /// Two-class-mean threshold computed from the samples.
    #[default]
    Dynamic,
}

/// Result of [`iterative_threshold`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdEstimate {
    pub value: f32,
    /// Refinement passes performed (at most [`MAX_THRESHOLD_ITERATIONS`]).
    pub iterations: u32,
}

/// Iterative two-class-mean (isodata) threshold.
///
/// Starts at the midpoint of the observed range, then repeatedly
/// splits the samples by the current threshold and moves it to the
/// mean of the two class means. Stops after
/// [`MAX_THRESHOLD_ITERATIONS`] passes, when a class is empty, or when
/// the threshold moves by less than [`THRESHOLD_EPSILON`].
pub fn iterative_threshold(samples: &[f32]) -> Option<ThresholdEstimate> {
    let min = samples.iter().copied().reduce(f32::min)?;
    let max = samples.iter().copied().reduce(f32::max)?;
    let mut t = (min + max) * 0.5;
    let mut iterations = 0;

    for _ in 0..MAX_THRESHOLD_ITERATIONS {
        let (mut sum_lo, mut cnt_lo) = (0.0f32, 0u32);
        let (mut sum_hi, mut cnt_hi) = (0.0f32, 0u32);
        for &v in samples {
            if v < t {
                sum_lo += v;
                cnt_lo += 1;
            } else {
                sum_hi += v;
                cnt_hi += 1;
            }
        }
        if cnt_lo == 0 || cnt_hi == 0 {
            break;
        }
        iterations += 1;
        let next = (sum_lo / cnt_lo as f32 + sum_hi / cnt_hi as f32) * 0.5;
        let delta = (next - t).abs();
        t = next;
        if delta < THRESHOLD_EPSILON {
            break;
        }
    }

    Some(ThresholdEstimate {
        value: t,
        iterations,
    })
}

fn dynamic_threshold(lumas: &[f32], spec: &StripSpec) -> f32 {
    let zero = spec.zero_color.luma();
    let one = spec.one_color.luma();
    let midpoint = (zero + one) * 0.5;

    let min = lumas.iter().copied().fold(f32::INFINITY, f32::min);
    let max = lumas.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max - min < (zero - one).abs() * MIN_RELATIVE_SPREAD {
        // A uniform strip (all zeros or all ones) has a single class.
        return midpoint;
    }
    iterative_threshold(lumas).map_or(midpoint, |est| est.value)
}

// ── Decoding ─────────────────────────────────────────────────────

/// Pixels whose centres lie in `[origin + inset·extent, origin + (1 - inset)·extent]`,
/// as `(first, count)`. Falls back to the pixel under the midpoint.
fn inset_span(origin: f64, extent: f64, inset: f64) -> (u32, u32) {
    let lo = origin + extent * inset;
    let hi = origin + extent * (1.0 - inset);
    let first = (lo - 0.5).ceil().max(0.0);
    let last = (hi - 0.5).floor();
    if last >= first {
        (first as u32, (last - first) as u32 + 1)
    } else {
        ((origin + extent * 0.5).floor().max(0.0) as u32, 1)
    }
}

/// Average luma of every cell in the band, left to right.
fn sample_cells(frame: &VideoFrame, spec: &StripSpec) -> Option<Vec<f32>> {
    let band = spec.band_rect(frame.width, frame.height);
    let cells = spec.cell_count();
    if cells == 0 || band.is_empty() {
        return None;
    }
    let cell_width = band.width as f64 / cells as f64;
    let (row, rows) = inset_span(band.y as f64, band.height as f64, BAND_INSET);

    (0..cells)
        .map(|i| {
            let origin = band.x as f64 + i as f64 * cell_width;
            let (col, cols) = inset_span(origin, cell_width, CELL_INSET);
            frame.average_luma(Rect::new(col, row, cols, rows))
        })
        .collect()
}

/// Recover the identifier from the strip band of `frame`.
///
/// Returns `None` when the frame is degenerate (width or height ≤ 1)
/// or the data window does not fit the sampled cells.
pub fn decode(frame: &VideoFrame, spec: &StripSpec, threshold: Threshold) -> Option<u64> {
    if frame.is_degenerate() {
        return None;
    }
    let lumas = sample_cells(frame, spec)?;
    let window = spec.data_window();
    if window.end > lumas.len() {
        return None;
    }

    let t = match threshold {
        Threshold::Fixed(v) => v,
        Threshold::Dynamic => dynamic_threshold(&lumas, spec),
    };
    let one_is_darker = spec.one_is_darker();

    let value = lumas[window].iter().fold(0u64, |acc, &luma| {
        let bit = if one_is_darker { luma < t } else { luma > t };
        (acc << 1) | bit as u64
    });
    Some(value)
}

/// Decimal-string form of [`decode`].
pub fn decode_string(frame: &VideoFrame, spec: &StripSpec, threshold: Threshold) -> Option<String> {
    decode(frame, spec, threshold).map(|id| id.to_string())
}

// ── Tests ────────────────────────────────────────────────────────
