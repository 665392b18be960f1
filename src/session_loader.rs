//! Loading a recorded freehand session from disk.
//!
//! A session with base name `<b>` consists of
//!  - `<b>.mhd`: MetaImage header of the frame stack (`MET_UCHAR`, one or
//!    three channels) and the raw file it points to,
//!  - `<b>.fts` frame timestamps, `<b>.tp` positions and `<b>.tts` position
//!    timestamps, or the older `<b>.tim` and `<b>.pos` pair,
//!  - `<b>.probe.toml` probe geometry and sensor calibration,
//!  - optionally `<b>.msk`, a raw mask of valid pixels.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array2, Array3, Array4, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ReconstructError;
use crate::geometry::Transform3D;
use crate::input::{FramePixels, InputDataSet, TimedFrame, TimedPosition};
use crate::probe::{ProbeGeometry, ProbeType};

/// Largest tolerated difference between probe and image pixel spacing (mm).
const SPACING_TOLERANCE: f64 = 0.001;

#[derive(Debug, Error)]
pub enum SessionLoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Missing session file {0}")]
    MissingFile(PathBuf),

    #[error("Failed to parse {file}: {reason}")]
    Parse { file: PathBuf, reason: String },

    #[error("Mismatch between number of images ({images}) and frame timestamps ({timestamps})")]
    FrameCountMismatch { images: usize, timestamps: usize },

    #[error("Unsupported image format: {0}")]
    Unsupported(String),

    #[error("Invalid probe file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] ReconstructError),
}

/// Contents of `<b>.probe.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeDefinition {
    #[serde(default)]
    pub probe_type: ProbeType,
    /// Probe origin in pixels (column, row).
    pub origin: [f64; 2],
    pub depth_start: f64,
    pub depth_end: f64,
    pub width: f64,
    /// Pixel spacing (mm); the image spacing wins when they differ.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spacing: Option<[f64; 2]>,
    /// Upper three rows of `s_m_t`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration: Option<[[f64; 4]; 3]>,
}

/// Frame stack header.
struct ImageHeader {
    width: usize,
    height: usize,
    frames: usize,
    channels: usize,
    spacing: (f64, f64),
    data_file: PathBuf,
}

pub struct SessionLoader;

impl SessionLoader {
    /// Load the session whose frame stack header is `mhd_path`.
    ///
    /// # Errors
    ///
    /// Returns error if a required file is missing or malformed, or when the
    /// number of frames and frame timestamps differ
    pub fn load(mhd_path: &Path) -> Result<InputDataSet, SessionLoaderError> {
        let name = mhd_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("session")
            .to_string();
        let base = mhd_path.with_extension("");

        let header = Self::read_header(mhd_path)?;
        let pixels = Self::read_frames(&header)?;
        let (frame_times, positions) = Self::read_tracking(&base)?;

        if frame_times.len() != pixels.len() {
            return Err(SessionLoaderError::FrameCountMismatch {
                images: pixels.len(),
                timestamps: frame_times.len(),
            });
        }
        let frames = frame_times
            .into_iter()
            .zip(pixels)
            .map(|(timestamp, pixels)| TimedFrame { timestamp, pixels })
            .collect();

        let (probe, s_m_t) = Self::read_probe(&base, &header)?;
        log::info!(
            "Loaded session {name}: {} frames of {}x{}, {} positions",
            header.frames,
            header.width,
            header.height,
            positions.len()
        );
        Ok(InputDataSet::new(name, frames, positions, probe).with_calibration(s_m_t))
    }

    fn sibling(base: &Path, extension: &str) -> PathBuf {
        let mut path = base.as_os_str().to_owned();
        path.push(".");
        path.push(extension);
        PathBuf::from(path)
    }

    fn read_text(path: &Path) -> Result<String, SessionLoaderError> {
        if !path.exists() {
            return Err(SessionLoaderError::MissingFile(path.to_path_buf()));
        }
        Ok(fs::read_to_string(path)?)
    }

    fn parse_error(path: &Path, reason: impl Into<String>) -> SessionLoaderError {
        SessionLoaderError::Parse {
            file: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn read_numbers(path: &Path) -> Result<Vec<f64>, SessionLoaderError> {
        Self::read_text(path)?
            .split_whitespace()
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|_| Self::parse_error(path, format!("not a number: {token}")))
            })
            .collect()
    }

    fn read_header(path: &Path) -> Result<ImageHeader, SessionLoaderError> {
        let text = Self::read_text(path)?;
        let fields: HashMap<&str, &str> = text
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| (key.trim(), value.trim()))
            .collect();
        let field = |key: &str| {
            fields
                .get(key)
                .copied()
                .ok_or_else(|| Self::parse_error(path, format!("missing {key}")))
        };
        let numbers = |key: &str| -> Result<Vec<f64>, SessionLoaderError> {
            field(key)?
                .split_whitespace()
                .map(|v| v.parse::<f64>().map_err(|_| Self::parse_error(path, format!("bad {key}"))))
                .collect()
        };

        let element_type = field("ElementType")?;
        if element_type != "MET_UCHAR" {
            return Err(SessionLoaderError::Unsupported(element_type.to_string()));
        }
        let dims = numbers("DimSize")?;
        let spacing = numbers("ElementSpacing")?;
        if dims.len() != 3 || spacing.len() < 2 {
            return Err(Self::parse_error(path, "expected three dimensions"));
        }
        let channels = match fields.get("ElementNumberOfChannels") {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| Self::parse_error(path, "bad ElementNumberOfChannels"))?,
            None => 1,
        };
        if channels != 1 && channels != 3 {
            return Err(SessionLoaderError::Unsupported(format!("{channels} channels")));
        }
        let data_file = path.with_file_name(field("ElementDataFile")?);

        Ok(ImageHeader {
            width: dims[0] as usize,
            height: dims[1] as usize,
            frames: dims[2] as usize,
            channels,
            spacing: (spacing[0], spacing[1]),
            data_file,
        })
    }

    fn read_frames(header: &ImageHeader) -> Result<Vec<FramePixels>, SessionLoaderError> {
        if !header.data_file.exists() {
            return Err(SessionLoaderError::MissingFile(header.data_file.clone()));
        }
        let bytes = fs::read(&header.data_file)?;
        let expected = header.width * header.height * header.frames * header.channels;
        if bytes.len() != expected {
            return Err(Self::parse_error(
                &header.data_file,
                format!("expected {expected} bytes, found {}", bytes.len()),
            ));
        }

        let frames: Vec<FramePixels> = match header.channels {
            1 => Array3::from_shape_vec((header.frames, header.height, header.width), bytes)
                .map_err(|e| Self::parse_error(&header.data_file, e.to_string()))?
                .axis_iter(Axis(0))
                .map(|frame| FramePixels::Gray(frame.to_owned()))
                .collect(),
            _ => Array4::from_shape_vec((header.frames, header.height, header.width, header.channels), bytes)
                .map_err(|e| Self::parse_error(&header.data_file, e.to_string()))?
                .axis_iter(Axis(0))
                .map(|frame| FramePixels::Rgb(frame.to_owned()))
                .collect(),
        };
        Ok(frames)
    }

    /// Frame timestamps and positions, from the current or the legacy layout.
    fn read_tracking(base: &Path) -> Result<(Vec<f64>, Vec<TimedPosition>), SessionLoaderError> {
        let fts = Self::sibling(base, "fts");
        if fts.exists() {
            let frame_times = Self::read_numbers(&fts)?;
            let tp = Self::sibling(base, "tp");
            let matrices = Self::read_numbers(&tp)?;
            let tts = Self::sibling(base, "tts");
            let times = Self::read_numbers(&tts)?;
            if matrices.len() % 12 != 0 || matrices.len() / 12 != times.len() {
                return Err(Self::parse_error(
                    &tp,
                    format!("{} numbers for {} position timestamps", matrices.len(), times.len()),
                ));
            }
            let positions = times
                .iter()
                .zip(matrices.chunks_exact(12))
                .map(|(&timestamp, values)| Self::position(&tp, timestamp, values))
                .collect::<Result<_, _>>()?;
            return Ok((frame_times, positions));
        }

        let tim = Self::sibling(base, "tim");
        let pos = Self::sibling(base, "pos");
        if !tim.exists() {
            return Err(SessionLoaderError::MissingFile(fts));
        }
        let frame_times = Self::read_numbers(&tim)?;
        let records = Self::read_numbers(&pos)?;
        if records.len() % 13 != 0 {
            return Err(Self::parse_error(&pos, "expected a timestamp and twelve matrix values per position"));
        }
        let positions = records
            .chunks_exact(13)
            .map(|record| Self::position(&pos, record[0], &record[1..]))
            .collect::<Result<_, _>>()?;
        Ok((frame_times, positions))
    }

    fn matrix_rows(values: &[f64]) -> [[f64; 4]; 3] {
        let mut rows = [[0.0; 4]; 3];
        for (i, v) in values.iter().take(12).enumerate() {
            rows[i / 4][i % 4] = *v;
        }
        rows
    }

    fn position(file: &Path, timestamp: f64, values: &[f64]) -> Result<TimedPosition, SessionLoaderError> {
        let pose = Transform3D::from_rows(&Self::matrix_rows(values))
            .map_err(|e| Self::parse_error(file, format!("position at {timestamp} ms: {e}")))?;
        Ok(TimedPosition { timestamp, pose })
    }

    fn read_probe(base: &Path, header: &ImageHeader) -> Result<(ProbeGeometry, Transform3D), SessionLoaderError> {
        let dimensions = (header.width, header.height);
        let probe_file = Self::sibling(base, "probe.toml");
        let mut s_m_t = Transform3D::identity();

        let mut probe = if probe_file.exists() {
            let definition: ProbeDefinition = toml::from_str(&fs::read_to_string(&probe_file)?)?;
            if let Some([sx, sy]) = definition.spacing
                && ((sx - header.spacing.0).abs() > SPACING_TOLERANCE
                    || (sy - header.spacing.1).abs() > SPACING_TOLERANCE)
            {
                log::warn!(
                    "Probe spacing ({sx}, {sy}) differs from image spacing ({}, {}), using the image spacing",
                    header.spacing.0,
                    header.spacing.1
                );
            }
            if let Some(rows) = &definition.calibration {
                s_m_t = Transform3D::from_rows(rows)?;
            }
            ProbeGeometry {
                probe_type: definition.probe_type,
                spacing: header.spacing,
                dimensions,
                origin: (definition.origin[0], definition.origin[1]),
                depth_start: definition.depth_start,
                depth_end: definition.depth_end,
                width: definition.width,
                mask: None,
            }
        } else {
            log::warn!("No probe file {}, using the whole frame", probe_file.display());
            ProbeGeometry::full_frame(header.spacing, dimensions)
        };

        let mask_file = Self::sibling(base, "msk");
        if mask_file.exists() {
            let bytes = fs::read(&mask_file)?;
            let mask = Array2::from_shape_vec((header.height, header.width), bytes)
                .map_err(|e| Self::parse_error(&mask_file, e.to_string()))?;
            probe.mask = Some(mask);
        }
        probe.validate()?;
        Ok((probe, s_m_t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Vector3D;
    use approx::assert_relative_eq;

    struct TempDir(PathBuf);

    impl TempDir {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!("us-reconstruct-{tag}-{}", std::process::id()));
            fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn write_stack(dir: &Path, channels: usize) -> PathBuf {
        let mhd = dir.join("sweep.mhd");
        fs::write(
            &mhd,
            format!(
                "ObjectType = Image\nNDims = 3\nDimSize = 4 3 2\nElementSpacing = 0.5 0.25 1\n\
                 ElementNumberOfChannels = {channels}\nElementType = MET_UCHAR\nElementDataFile = sweep.raw\n"
            ),
        )
        .unwrap();
        let bytes: Vec<u8> = (0..4 * 3 * 2 * channels).map(|i| i as u8).collect();
        fs::write(dir.join("sweep.raw"), bytes).unwrap();
        mhd
    }

    #[test]
    fn test_load_session() {
        let dir = TempDir::new("session");
        let mhd = write_stack(&dir.0, 1);
        fs::write(dir.0.join("sweep.fts"), "0\n33.5\n").unwrap();
        fs::write(dir.0.join("sweep.tts"), "-5\n40\n").unwrap();
        fs::write(
            dir.0.join("sweep.tp"),
            "1 0 0 10\n0 1 0 20\n0 0 1 30\n1 0 0 11\n0 1 0 20\n0 0 1 30\n",
        )
        .unwrap();
        fs::write(
            dir.0.join("sweep.probe.toml"),
            "probe_type = \"Linear\"\norigin = [2.0, 0.0]\ndepth_start = 0.0\ndepth_end = 0.75\n\
             width = 2.0\nspacing = [0.6, 0.25]\ncalibration = [[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0], [0.0, 0.0, 1.0, 5.0]]\n",
        )
        .unwrap();

        let data = SessionLoader::load(&mhd).unwrap();
        assert_eq!(data.name, "sweep");
        assert_eq!(data.frame_timestamps(), vec![0.0, 33.5]);
        assert_eq!(data.positions.len(), 2);
        assert_relative_eq!(data.positions[1].pose.translation(), Vector3D::new(11.0, 20.0, 30.0));
        assert_relative_eq!(data.s_m_t.translation(), Vector3D::new(0.0, 0.0, 5.0));
        // the image spacing wins over the probe file
        assert_eq!(data.probe.spacing, (0.5, 0.25));
        assert_eq!(data.probe.probe_type, ProbeType::Linear);
        match &data.frames[1].pixels {
            FramePixels::Gray(frame) => assert_eq!(frame[[0, 1]], 13),
            FramePixels::Rgb(_) => panic!("expected gray frames"),
        }
        assert!(data.validate().is_ok());
    }

    #[test]
    fn test_legacy_tracking_and_colour_frames() {
        let dir = TempDir::new("legacy");
        let mhd = write_stack(&dir.0, 3);
        fs::write(dir.0.join("sweep.tim"), "10\n20\n").unwrap();
        fs::write(dir.0.join("sweep.pos"), "12\n1 0 0 0\n0 1 0 0\n0 0 1 7\n").unwrap();
        fs::write(dir.0.join("sweep.msk"), vec![1u8; 12]).unwrap();

        let data = SessionLoader::load(&mhd).unwrap();
        assert_eq!(data.positions.len(), 1);
        assert_eq!(data.positions[0].timestamp, 12.0);
        assert_relative_eq!(data.positions[0].pose.translation(), Vector3D::new(0.0, 0.0, 7.0));
        assert!(data.frames[0].pixels.is_color());
        assert_eq!(data.frames[0].pixels.dim(), (3, 4));
        // no probe file: the whole frame is used
        assert_eq!(data.probe.probe_type, ProbeType::None);
        assert_eq!(data.probe.mask.as_ref().map(|m| m.dim()), Some((3, 4)));
    }

    #[test]
    fn test_frame_count_mismatch() {
        let dir = TempDir::new("mismatch");
        let mhd = write_stack(&dir.0, 1);
        fs::write(dir.0.join("sweep.tim"), "10\n20\n30\n").unwrap();
        fs::write(dir.0.join("sweep.pos"), "").unwrap();

        assert!(matches!(
            SessionLoader::load(&mhd),
            Err(SessionLoaderError::FrameCountMismatch {
                images: 2,
                timestamps: 3
            })
        ));
    }

    #[test]
    fn test_missing_files() {
        let dir = TempDir::new("missing");
        assert!(matches!(
            SessionLoader::load(&dir.0.join("sweep.mhd")),
            Err(SessionLoaderError::MissingFile(_))
        ));
        let mhd = write_stack(&dir.0, 1);
        assert!(matches!(SessionLoader::load(&mhd), Err(SessionLoaderError::MissingFile(_))));
    }
}
