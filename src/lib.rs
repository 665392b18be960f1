//! # us-reconstruct library
//!
//! This crate reconstructs a 3D volume from a freehand ultrasound sweep:
//! a sequence of timed 2D frames plus the tracked pose of the probe.
//!
//! A reconstruction runs in three steps:
//!  - Temporal alignment: the tracking clock is mapped onto the frame clock,
//!    either with an explicit calibration or with an estimated offset, and one
//!    pose is interpolated per frame (translation linear, rotation SLERP).
//!  - Planning: an output grid is fitted around all frames, oriented along
//!    the patient reference or the frames themselves.
//!  - Filling: one of three algorithms writes the voxels, in parallel using
//!    rayon:
//!     - Nearest frame
//!     - Local (distance weighted) average
//!     - Gaussian splatting
//!
//!  The [`Reconstructer`] drives these steps, publishes the finished
//!  [`OutputVolume`] and reports progress through events. Reconstructions can
//!  run on a worker thread and be cancelled.
//!
//! # Examples
//!
//! ## Reconstructing a recorded session
//!
//! Load the session stored next to `sweep.mhd`, reconstruct it with the
//! default settings and save the center slice in the Axial axis.
//!
//! ```no_run
//! # use us_reconstruct::{Orientation, ReconstructOutcome, Reconstructer, SessionLoader};
//! # use std::path::Path;
//! let data = SessionLoader::load(Path::new("sweep.mhd"))
//!     .expect("should have loaded the session");
//! let reconstructer = Reconstructer::default();
//! reconstructer.set_input_data(data).expect("should have accepted the data");
//! if let ReconstructOutcome::Finished(volume) = reconstructer
//!     .reconstruct()
//!     .expect("should have reconstructed the volume")
//! {
//!     let image = volume
//!         .get_image_from_axis(volume.dim().0 / 2, Orientation::Axial)
//!         .expect("should have returned image at center of volume");
//!     image.save("result.png");
//! }
//! ```

pub mod algorithm;
pub mod enums;
pub mod error;
pub mod geometry;
pub mod input;
mod interpolator;
pub mod params;
pub mod planner;
pub mod probe;
pub mod reconstructer;
pub mod session_loader;
pub mod temporal;
pub mod volume;

pub use algorithm::{AlgorithmOptions, CancelToken, ReconstructAlgorithm, create_algorithm};
pub use enums::{AlgorithmKind, AlignmentMethod, Orientation, OutputOrientation, ReconstructState};
pub use error::{Diagnostic, ReconstructError, Severity};
pub use geometry::{Transform3D, Vector3D};
pub use input::{FramePixels, InputDataSet, TimedFrame, TimedPosition};
pub use params::ReconstructParams;
pub use planner::OutputVolumeParams;
pub use probe::{ProbeGeometry, ProbeType};
pub use reconstructer::{ReconstructEvent, ReconstructOutcome, ReconstructTask, Reconstructer};
pub use session_loader::SessionLoader;
pub use temporal::TimeCalibration;
pub use volume::OutputVolume;
