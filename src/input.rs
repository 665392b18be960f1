//! Raw reconstruction input: tracked positions, timed ultrasound frames and
//! the probe they were recorded with.

use ndarray::{Array2, Array3, ArrayView2, Axis, s};
use rayon::prelude::*;

use crate::error::ReconstructError;
use crate::geometry::Transform3D;
use crate::probe::ProbeGeometry;

/// One tracking sample. `pose` is `pr_m_s`: probe sensor to patient reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedPosition {
    /// Milliseconds.
    pub timestamp: f64,
    pub pose: Transform3D,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FramePixels {
    /// Indexed (row, column).
    Gray(Array2<u8>),
    /// Indexed (row, column, channel).
    Rgb(Array3<u8>),
}

impl FramePixels {
    /// Frame size as (height, width).
    pub fn dim(&self) -> (usize, usize) {
        match self {
            FramePixels::Gray(data) => data.dim(),
            FramePixels::Rgb(data) => {
                let (h, w, _) = data.dim();
                (h, w)
            }
        }
    }

    /// Reduce to one intensity channel.
    ///
    /// In angio mode only coloured pixels (flow) are kept, at the strength of
    /// their strongest channel; gray tissue pixels become zero.
    pub fn to_intensity(&self, angio: bool) -> Array2<u8> {
        match self {
            FramePixels::Gray(data) if angio => Array2::zeros(data.dim()),
            FramePixels::Gray(data) => data.clone(),
            FramePixels::Rgb(data) => {
                let (h, w, _) = data.dim();
                Array2::from_shape_fn((h, w), |(row, col)| {
                    let px = data.slice(s![row, col, ..]);
                    // missing channels repeat the first one
                    let channel = |i: usize| px.get(i).or_else(|| px.get(0)).copied().unwrap_or(0);
                    let (r, g, b) = (channel(0), channel(1), channel(2));
                    if angio {
                        if r == g && g == b { 0 } else { r.max(g).max(b) }
                    } else {
                        Self::luminance(r, g, b)
                    }
                })
            }
        }
    }

    #[inline]
    fn luminance(r: u8, g: u8, b: u8) -> u8 {
        (0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64)
            .round()
            .clamp(0.0, 255.0) as u8
    }

    pub fn is_color(&self) -> bool {
        matches!(self, FramePixels::Rgb(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimedFrame {
    /// Milliseconds.
    pub timestamp: f64,
    pub pixels: FramePixels,
}

/// Everything recorded during one freehand sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct InputDataSet {
    pub name: String,
    pub frames: Vec<TimedFrame>,
    pub positions: Vec<TimedPosition>,
    pub probe: ProbeGeometry,
    /// Probe calibration `s_m_t`: tool space to sensor space.
    pub s_m_t: Transform3D,
    /// Only frames inside this time range (ms, inclusive) are used.
    pub time_range: Option<(f64, f64)>,
}

impl InputDataSet {
    pub fn new(
        name: impl Into<String>,
        frames: Vec<TimedFrame>,
        positions: Vec<TimedPosition>,
        probe: ProbeGeometry,
    ) -> Self {
        Self {
            name: name.into(),
            frames,
            positions,
            probe,
            s_m_t: Transform3D::identity(),
            time_range: None,
        }
    }

    pub fn with_calibration(mut self, s_m_t: Transform3D) -> Self {
        self.s_m_t = s_m_t;
        self
    }

    pub fn with_time_range(mut self, start: f64, end: f64) -> Self {
        self.time_range = Some((start, end));
        self
    }

    pub fn frame_timestamps(&self) -> Vec<f64> {
        self.frames.iter().map(|f| f.timestamp).collect()
    }

    /// Structural checks done before any processing.
    pub fn validate(&self) -> Result<(), ReconstructError> {
        if self.frames.is_empty() {
            return Err(ReconstructError::NoFrames);
        }
        if self.positions.is_empty() {
            return Err(ReconstructError::NoPositions);
        }
        if !Self::strictly_increasing(self.frames.iter().map(|f| f.timestamp)) {
            return Err(ReconstructError::UnorderedTimestamps("frames"));
        }
        if !Self::strictly_increasing(self.positions.iter().map(|p| p.timestamp)) {
            return Err(ReconstructError::UnorderedTimestamps("positions"));
        }
        self.probe.validate()?;

        let (w, h) = self.probe.dimensions;
        if let Some(frame) = self.frames.iter().find(|f| f.pixels.dim() != (h, w)) {
            let (fh, fw) = frame.pixels.dim();
            return Err(ReconstructError::InvalidProbe(format!(
                "frame at {} ms is {fw}x{fh}, probe expects {w}x{h}",
                frame.timestamp
            )));
        }
        let narrow = self.frames.iter().find(|f| match &f.pixels {
            FramePixels::Rgb(data) => data.len_of(Axis(2)) < 3,
            FramePixels::Gray(_) => false,
        });
        if let Some(frame) = narrow {
            return Err(ReconstructError::invalid_option(
                "frames",
                format!("colour frame at {} ms has fewer than 3 channels", frame.timestamp),
            ));
        }
        Ok(())
    }

    fn strictly_increasing(mut values: impl Iterator<Item = f64>) -> bool {
        let Some(mut previous) = values.next() else {
            return true;
        };
        for value in values {
            if value.is_nan() || value <= previous {
                return false;
            }
            previous = value;
        }
        true
    }

    /// Indices of the frames inside the configured time range.
    pub fn frames_in_time_range(&self) -> Vec<usize> {
        self.frames
            .iter()
            .enumerate()
            .filter(|(_, f)| match self.time_range {
                Some((start, end)) => f.timestamp >= start && f.timestamp <= end,
                None => true,
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Intensity images of the selected frames stacked as (frame, row, column).
    pub fn intensity_stack(&self, indices: &[usize], angio: bool) -> Array3<u8> {
        let (w, h) = self.probe.dimensions;
        let images: Vec<Array2<u8>> = indices
            .par_iter()
            .map(|&i| self.frames[i].pixels.to_intensity(angio))
            .collect();

        let mut stack = Array3::<u8>::zeros((images.len(), h, w));
        for (mut layer, image) in stack.axis_iter_mut(Axis(0)).zip(images.iter()) {
            layer.assign(image);
        }
        stack
    }
}

/// Mean absolute intensity change between consecutive frames, one value per
/// pair. Used as the image-side motion signal for time alignment.
pub fn frame_motion_signal(stack: &Array3<u8>) -> Vec<f64> {
    let n = stack.len_of(Axis(0));
    (1..n)
        .into_par_iter()
        .map(|i| {
            let a: ArrayView2<u8> = stack.index_axis(Axis(0), i - 1);
            let b: ArrayView2<u8> = stack.index_axis(Axis(0), i);
            let total: u64 = a
                .iter()
                .zip(b.iter())
                .map(|(&x, &y)| x.abs_diff(y) as u64)
                .sum();
            total as f64 / a.len().max(1) as f64
        })
        .collect()
}
