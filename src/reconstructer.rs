//! Reconstruction orchestration: owns the input, runs alignment and planning,
//! drives the fill and publishes the finished volume.

use std::any::Any;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread;

use futures::channel::oneshot;
use ndarray::Axis;
use parking_lot::{Mutex, RwLock};
use web_time::Instant;

use crate::algorithm::{
    AlgorithmOptions, CancelToken, FillOutcome, ReconstructAlgorithm, ReconstructInput, create_algorithm, run_fill,
};
use crate::enums::{AlignmentMethod, ReconstructState};
use crate::error::{Diagnostic, ReconstructError};
use crate::input::{InputDataSet, frame_motion_signal};
use crate::params::ReconstructParams;
use crate::planner::{OutputVolumeParams, PlanSettings, PlannedVolume, plan_output_volume};
use crate::temporal::TimeCalibration;
use crate::volume::OutputVolume;

#[derive(Debug, Clone, PartialEq)]
pub enum ReconstructEvent {
    ParamsChanged,
    AlgorithmChanged,
    /// Carries the name of the new data set.
    InputDataSelected(String),
    ReconstructFinished,
    ReconstructCancelled,
    ReconstructFailed(String),
}

#[derive(Debug, Clone)]
pub enum ReconstructOutcome {
    Finished(Arc<OutputVolume>),
    Cancelled,
}

type Listener = Box<dyn Fn(&ReconstructEvent) + Send + Sync>;

/// Result of alignment and planning, reused until the input or a
/// preparation-relevant setting changes.
struct Prepared {
    calibration: TimeCalibration,
    planned: PlannedVolume,
    input: Arc<ReconstructInput>,
}

#[derive(Default)]
struct Inner {
    state: ReconstructState,
    params: ReconstructParams,
    original: Option<Arc<InputDataSet>>,
    prepared: Option<Prepared>,
    output: Option<Arc<OutputVolume>>,
    diagnostics: Vec<Diagnostic>,
    cancel: Option<CancelToken>,
    /// Bumped whenever the input, the settings or the prepared data change.
    generation: u64,
}

impl Inner {
    fn report(&mut self, diagnostic: Diagnostic) {
        diagnostic.log();
        self.diagnostics.push(diagnostic);
    }

    fn invalidate(&mut self) {
        self.generation += 1;
        self.prepared = None;
    }

    fn prepare_request(&self) -> Result<PrepareRequest, ReconstructError> {
        match (&self.original, self.state) {
            (Some(data), state) if state != ReconstructState::Idle => Ok(PrepareRequest {
                data: data.clone(),
                params: self.params.clone(),
                generation: self.generation,
            }),
            _ => Err(ReconstructError::NoInputData),
        }
    }

    fn fail(&mut self, error: &ReconstructError) -> ReconstructEvent {
        self.state = ReconstructState::Error;
        self.invalidate();
        self.output = None;
        self.report(Diagnostic::error(error.to_string()));
        ReconstructEvent::ReconstructFailed(error.to_string())
    }
}

/// Snapshot for running alignment and planning without holding the lock.
struct PrepareRequest {
    data: Arc<InputDataSet>,
    params: ReconstructParams,
    generation: u64,
}

enum Start {
    Ready(FillJob),
    NeedsPreparation(PrepareRequest),
}

struct Shared {
    inner: Mutex<Inner>,
    listeners: RwLock<Vec<Listener>>,
}

/// Everything the fill needs, detached from the lock.
struct FillJob {
    algorithm: Box<dyn ReconstructAlgorithm>,
    input: Arc<ReconstructInput>,
    params: OutputVolumeParams,
    threads: Option<usize>,
    cancel: CancelToken,
}

impl FillJob {
    /// `Ok(None)` when cancelled.
    fn run(self) -> Result<Option<OutputVolume>, ReconstructError> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut volume = OutputVolume::empty(self.params);
            run_fill(self.algorithm.as_ref(), &self.input, &mut volume, &self.cancel, self.threads)
                .map(|outcome| (outcome, volume))
        }));
        match result {
            Ok(Ok((FillOutcome::Completed, volume))) => Ok(Some(volume)),
            Ok(Ok((FillOutcome::Cancelled, _))) => Ok(None),
            Ok(Err(e)) => Err(e),
            Err(payload) => Err(ReconstructError::WorkerFailed(panic_message(payload))),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Settings that only affect the fill, not alignment or planning.
fn same_preparation(a: &ReconstructParams, b: &ReconstructParams) -> bool {
    let strip = |p: &ReconstructParams| ReconstructParams {
        algorithm: String::new(),
        algorithm_options: AlgorithmOptions::default(),
        threads: None,
        ..p.clone()
    };
    strip(a) == strip(b)
}

/// Align, plan and assemble the fill input from the pristine data set.
fn prepare_input(
    data: &InputDataSet,
    params: &ReconstructParams,
    diagnostics: &mut Vec<Diagnostic>,
    on_aligned: impl FnOnce(),
) -> Result<Prepared, ReconstructError> {
    let start = Instant::now();
    data.validate()?;
    params.validate()?;

    let selected = data.frames_in_time_range();
    if selected.len() < data.frames.len() {
        diagnostics.push(Diagnostic::info(format!(
            "Using {} of {} frames inside the reconstruction time range",
            selected.len(),
            data.frames.len()
        )));
    }
    if selected.is_empty() {
        return Err(ReconstructError::NoFrames);
    }

    let stack = data.intensity_stack(&selected, params.angio);
    let frame_times: Vec<f64> = selected.iter().map(|&i| data.frames[i].timestamp).collect();
    let motion = (params.time_calibration.is_none()
        && params.alignment_method == AlignmentMethod::MotionCorrelation)
        .then(|| frame_motion_signal(&stack));

    let alignment =
        params
            .aligner()
            .align(&frame_times, motion.as_deref(), &data.positions, params.time_calibration)?;
    diagnostics.extend(alignment.diagnostics.iter().cloned());
    on_aligned();

    let t_m_u = data.probe.t_m_u();
    let pr_m_u: Vec<_> = alignment
        .frame_poses
        .iter()
        .map(|pr_m_s| *pr_m_s * data.s_m_t * t_m_u)
        .collect();

    let corners = data.probe.input_rectangle(params.mask_reduce)?;
    let (sx, sy) = data.probe.spacing;
    let planned = plan_output_volume(
        &pr_m_u,
        &corners,
        &PlanSettings {
            orientation: params.orientation,
            spacing: params.spacing,
            input_spacing: sx.min(sy),
            max_voxels: params.max_voxels,
        },
    )?;

    let frames = stack.select(Axis(0), &alignment.valid_frames);
    let input = ReconstructInput::new(frames, planned.d_m_u.clone(), data.probe.mask(), data.probe.spacing)?;
    log::info!(
        "Prepared {} frames of {} in {:?}",
        input.frame_count(),
        data.name,
        start.elapsed()
    );

    Ok(Prepared {
        calibration: TimeCalibration::new(alignment.time_offset, alignment.time_scale),
        planned,
        input: Arc::new(input),
    })
}

/// Freehand reconstruction of one input data set. Cheap to clone; clones
/// share state.
#[derive(Clone)]
pub struct Reconstructer {
    shared: Arc<Shared>,
}

impl Default for Reconstructer {
    fn default() -> Self {
        Self::new(ReconstructParams::default())
    }
}

impl Reconstructer {
    pub fn new(params: ReconstructParams) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    params,
                    ..Default::default()
                }),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Register a callback for [`ReconstructEvent`]s. Callbacks run on the
    /// thread that caused the event and must not subscribe themselves.
    pub fn subscribe(&self, listener: impl Fn(&ReconstructEvent) + Send + Sync + 'static) {
        self.shared.listeners.write().push(Box::new(listener));
    }

    fn emit(&self, events: &[ReconstructEvent]) {
        let listeners = self.shared.listeners.read();
        for event in events {
            log::debug!("Event {event:?}");
            for listener in listeners.iter() {
                listener(event);
            }
        }
    }

    pub fn state(&self) -> ReconstructState {
        self.shared.inner.lock().state
    }

    pub fn params(&self) -> ReconstructParams {
        self.shared.inner.lock().params.clone()
    }

    /// Diagnostics of the last prepare or reconstruct run.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.shared.inner.lock().diagnostics.clone()
    }

    /// The last published volume.
    pub fn output(&self) -> Option<Arc<OutputVolume>> {
        self.shared.inner.lock().output.clone()
    }

    pub fn output_volume_params(&self) -> Option<OutputVolumeParams> {
        let inner = self.shared.inner.lock();
        inner.prepared.as_ref().map(|p| p.planned.params.clone())
    }

    /// Time calibration applied by the last preparation.
    pub fn time_calibration(&self) -> Option<TimeCalibration> {
        let inner = self.shared.inner.lock();
        inner.prepared.as_ref().map(|p| p.calibration)
    }

    pub fn set_input_data(&self, data: InputDataSet) -> Result<(), ReconstructError> {
        let name = data.name.clone();
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == ReconstructState::Reconstructing {
                return Err(ReconstructError::Busy);
            }
            log::info!("Selected input data {name} with {} frames", data.frames.len());
            inner.original = Some(Arc::new(data));
            inner.invalidate();
            inner.output = None;
            inner.diagnostics.clear();
            inner.state = ReconstructState::DataLoaded;
        }
        self.emit(&[ReconstructEvent::InputDataSelected(name)]);
        Ok(())
    }

    /// Replace the settings. Alignment and planning are redone on the next
    /// run unless only algorithm settings changed.
    pub fn set_params(&self, params: ReconstructParams) -> Result<(), ReconstructError> {
        params.validate()?;
        let mut events = vec![ReconstructEvent::ParamsChanged];
        {
            let mut inner = self.shared.inner.lock();
            if inner.state == ReconstructState::Reconstructing {
                return Err(ReconstructError::Busy);
            }
            if inner.params.algorithm_kind().ok() != params.algorithm_kind().ok() {
                events.push(ReconstructEvent::AlgorithmChanged);
            }
            if !same_preparation(&inner.params, &params) {
                inner.invalidate();
                if inner.state != ReconstructState::Idle && inner.original.is_some() {
                    inner.state = ReconstructState::DataLoaded;
                }
            }
            inner.params = params;
        }
        self.emit(&events);
        Ok(())
    }

    /// Align and plan without holding the lock, then store the result.
    /// Fails with `Busy` when the input or settings changed meanwhile.
    fn run_preparation(&self, request: PrepareRequest) -> Result<OutputVolumeParams, ReconstructError> {
        let mut diagnostics = Vec::new();
        let result = prepare_input(&request.data, &request.params, &mut diagnostics, || {
            let mut inner = self.shared.inner.lock();
            if inner.generation == request.generation && inner.state != ReconstructState::Reconstructing {
                inner.state = ReconstructState::Aligned;
            }
        });
        let (error, event) = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != request.generation || inner.state == ReconstructState::Reconstructing {
                log::debug!("Discarding preparation of outdated input");
                return Err(ReconstructError::Busy);
            }
            inner.diagnostics.clear();
            for diagnostic in diagnostics {
                inner.report(diagnostic);
            }
            match result {
                Ok(prepared) => {
                    let params = prepared.planned.params.clone();
                    inner.prepared = Some(prepared);
                    inner.state = ReconstructState::VolumePlanned;
                    return Ok(params);
                }
                Err(e) => {
                    let event = inner.fail(&e);
                    (e, event)
                }
            }
        };
        self.emit(&[event]);
        Err(error)
    }

    /// Run alignment and planning so the output grid can be inspected or
    /// changed before reconstructing.
    pub fn prepare(&self) -> Result<OutputVolumeParams, ReconstructError> {
        let request = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ReconstructState::Reconstructing {
                return Err(ReconstructError::Busy);
            }
            inner.prepared = None;
            inner.diagnostics.clear();
            inner.prepare_request().map_err(|e| {
                let event = inner.fail(&e);
                (e, event)
            })
        };
        match request {
            Ok(request) => self.run_preparation(request),
            Err((e, event)) => {
                self.emit(&[event]);
                Err(e)
            }
        }
    }

    /// Override the planned grid. Frame poses are re-expressed for the new
    /// grid; the spacing and dimensions are used as given.
    pub fn set_output_volume_params(&self, params: OutputVolumeParams) -> Result<(), ReconstructError> {
        let mut inner = self.shared.inner.lock();
        if inner.state == ReconstructState::Reconstructing {
            return Err(ReconstructError::Busy);
        }
        let prepared = inner.prepared.as_mut().ok_or(ReconstructError::NoInputData)?;
        let planned = prepared.planned.reoriented(params)?;
        let input = prepared.input.with_poses(planned.d_m_u.clone())?;
        prepared.planned = planned;
        prepared.input = Arc::new(input);
        inner.generation += 1;
        inner.state = ReconstructState::VolumePlanned;
        Ok(())
    }

    /// Pre phase: create the algorithm, prepare when needed and mark the
    /// reconstructer busy.
    fn begin(&self) -> Result<FillJob, ReconstructError> {
        let cancel = CancelToken::new();
        match self.try_begin(&cancel)? {
            Start::Ready(job) => Ok(job),
            Start::NeedsPreparation(request) => self.prepare_and_begin(request, &cancel),
        }
    }

    fn prepare_and_begin(&self, request: PrepareRequest, cancel: &CancelToken) -> Result<FillJob, ReconstructError> {
        self.run_preparation(request)?;
        match self.try_begin(cancel)? {
            Start::Ready(job) => Ok(job),
            // invalidated again between the two steps
            Start::NeedsPreparation(_) => Err(ReconstructError::Busy),
        }
    }

    fn try_begin(&self, cancel: &CancelToken) -> Result<Start, ReconstructError> {
        let result = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ReconstructState::Reconstructing {
                return Err(ReconstructError::Busy);
            }
            Self::begin_locked(&mut inner, cancel).map_err(|e| {
                let event = inner.fail(&e);
                (e, event)
            })
        };
        result.map_err(|(e, event)| {
            self.emit(&[event]);
            e
        })
    }

    fn begin_locked(inner: &mut Inner, cancel: &CancelToken) -> Result<Start, ReconstructError> {
        let kind = inner.params.algorithm_kind()?;
        let algorithm = create_algorithm(kind, &inner.params.algorithm_options)?;
        let Some(prepared) = inner.prepared.as_ref() else {
            inner.diagnostics.clear();
            return inner.prepare_request().map(Start::NeedsPreparation);
        };
        let job = FillJob {
            algorithm,
            input: prepared.input.clone(),
            params: prepared.planned.params.clone(),
            threads: inner.params.threads,
            cancel: cancel.clone(),
        };
        log::info!("Starting {} reconstruction", kind);
        inner.cancel = Some(cancel.clone());
        inner.state = ReconstructState::Reconstructing;
        Ok(Start::Ready(job))
    }

    /// Post phase: publish the volume or record why there is none.
    fn finish(
        &self,
        result: Result<Option<OutputVolume>, ReconstructError>,
    ) -> Result<ReconstructOutcome, ReconstructError> {
        let (outcome, event) = {
            let mut inner = self.shared.inner.lock();
            inner.cancel = None;
            match result {
                Ok(Some(volume)) => {
                    let volume = Arc::new(volume);
                    inner.report(Diagnostic::info(format!(
                        "Reconstructed {} of {} voxels",
                        volume.filled_voxel_count(),
                        volume.data().len()
                    )));
                    inner.output = Some(volume.clone());
                    inner.state = ReconstructState::Done;
                    (Ok(ReconstructOutcome::Finished(volume)), ReconstructEvent::ReconstructFinished)
                }
                Ok(None) => {
                    inner.report(Diagnostic::warning("Reconstruction cancelled"));
                    inner.state = ReconstructState::VolumePlanned;
                    (Ok(ReconstructOutcome::Cancelled), ReconstructEvent::ReconstructCancelled)
                }
                Err(e) => {
                    let event = inner.fail(&e);
                    (Err(e), event)
                }
            }
        };
        self.emit(&[event]);
        outcome
    }

    /// Reconstruct on the calling thread.
    pub fn reconstruct(&self) -> Result<ReconstructOutcome, ReconstructError> {
        let job = self.begin()?;
        self.finish(job.run())
    }

    /// Reconstruct on a worker thread. Alignment and planning, when still
    /// needed, also run there. The returned task resolves when the fill is
    /// done and can cancel it.
    pub fn spawn_reconstruct(&self) -> Result<ReconstructTask, ReconstructError> {
        let cancel = CancelToken::new();
        let start = self.try_begin(&cancel)?;
        let busy = matches!(start, Start::Ready(_));
        let (sender, receiver) = oneshot::channel();
        let this = self.clone();
        let worker_cancel = cancel.clone();

        let spawned = thread::Builder::new()
            .name("us-reconstruct".to_string())
            .spawn(move || {
                let job = match start {
                    Start::Ready(job) => Ok(job),
                    Start::NeedsPreparation(request) => this.prepare_and_begin(request, &worker_cancel),
                };
                let outcome = job.and_then(|job| this.finish(job.run()));
                // the task may have been dropped
                let _ = sender.send(outcome);
            });
        if let Err(e) = spawned {
            let message = e.to_string();
            if busy {
                self.finish(Err(ReconstructError::WorkerFailed(message.clone()))).ok();
            }
            return Err(ReconstructError::WorkerFailed(message));
        }
        Ok(ReconstructTask { receiver, cancel })
    }

    /// Ask a running fill to stop. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        match &self.shared.inner.lock().cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop all derived data and the output. The input is kept for
    /// [`reload`](Self::reload).
    pub fn clear_all(&self) -> Result<(), ReconstructError> {
        let mut inner = self.shared.inner.lock();
        if inner.state == ReconstructState::Reconstructing {
            return Err(ReconstructError::Busy);
        }
        inner.invalidate();
        inner.output = None;
        inner.diagnostics.clear();
        inner.state = ReconstructState::Idle;
        Ok(())
    }

    /// Select the kept input data again after [`clear_all`](Self::clear_all).
    pub fn reload(&self) -> Result<(), ReconstructError> {
        let name = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ReconstructState::Reconstructing {
                return Err(ReconstructError::Busy);
            }
            let name = inner.original.as_ref().ok_or(ReconstructError::NoInputData)?.name.clone();
            inner.invalidate();
            inner.output = None;
            inner.diagnostics.clear();
            inner.state = ReconstructState::DataLoaded;
            name
        };
        self.emit(&[ReconstructEvent::InputDataSelected(name)]);
        Ok(())
    }
}

/// Handle to a reconstruction running on a worker thread.
pub struct ReconstructTask {
    receiver: oneshot::Receiver<Result<ReconstructOutcome, ReconstructError>>,
    cancel: CancelToken,
}

impl ReconstructTask {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Block the current thread until the worker is done.
    pub fn wait(self) -> Result<ReconstructOutcome, ReconstructError> {
        futures::executor::block_on(self)
    }
}

impl Future for ReconstructTask {
    type Output = Result<ReconstructOutcome, ReconstructError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ReconstructError::WorkerFailed(
                "worker exited without a result".to_string(),
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::AlgorithmKind;
    use crate::error::Severity;
    use crate::geometry::{Transform3D, Vector3D};
    use crate::input::{FramePixels, TimedFrame, TimedPosition};
    use crate::probe::ProbeGeometry;
    use ndarray::Array2;

    /// Thirty frames one millimetre apart, swept along x of the patient
    /// reference.
    fn sweep() -> InputDataSet {
        let frames = (0..30)
            .map(|i| TimedFrame {
                timestamp: i as f64 * 20.0,
                pixels: FramePixels::Gray(Array2::from_shape_fn((24, 32), |(row, col)| {
                    (50 + (row + col + i) % 100) as u8
                })),
            })
            .collect();
        let positions = (-5..=65)
            .map(|k| {
                let t = k as f64 * 10.0;
                TimedPosition {
                    timestamp: t,
                    pose: Transform3D::from_translation(&Vector3D::new(0.05 * t, 2.0, -1.0)),
                }
            })
            .collect();
        InputDataSet::new("sweep", frames, positions, ProbeGeometry::full_frame((0.5, 0.5), (32, 24)))
    }

    fn params() -> ReconstructParams {
        ReconstructParams {
            alignment_method: AlignmentMethod::Disabled,
            ..Default::default()
        }
    }

    fn recorded(reconstructer: &Reconstructer) -> Arc<Mutex<Vec<ReconstructEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        reconstructer.subscribe(move |event| sink.lock().push(event.clone()));
        events
    }

    #[test]
    fn test_full_run() {
        let reconstructer = Reconstructer::new(params());
        let events = recorded(&reconstructer);
        reconstructer.set_input_data(sweep()).unwrap();
        assert_eq!(reconstructer.state(), ReconstructState::DataLoaded);

        let outcome = reconstructer.reconstruct().unwrap();
        let ReconstructOutcome::Finished(volume) = outcome else {
            panic!("reconstruction did not finish");
        };
        assert_eq!(reconstructer.state(), ReconstructState::Done);
        assert!(Arc::ptr_eq(&volume, &reconstructer.output().unwrap()));
        assert!(volume.filled_voxel_count() > volume.data().len() / 2);
        assert_eq!(reconstructer.time_calibration(), Some(TimeCalibration::default()));
        assert_eq!(
            *events.lock(),
            vec![
                ReconstructEvent::InputDataSelected("sweep".into()),
                ReconstructEvent::ReconstructFinished
            ]
        );
    }

    #[test]
    fn test_zero_positions_fail_without_output() {
        let reconstructer = Reconstructer::new(params());
        let events = recorded(&reconstructer);
        let mut data = sweep();
        data.positions.clear();
        reconstructer.set_input_data(data).unwrap();

        assert!(matches!(reconstructer.reconstruct(), Err(ReconstructError::NoPositions)));
        assert_eq!(reconstructer.state(), ReconstructState::Error);
        assert!(reconstructer.output().is_none());
        assert!(
            reconstructer
                .diagnostics()
                .iter()
                .any(|d| d.severity == Severity::Error && d.message == "No positions found")
        );
        assert!(matches!(
            events.lock().last(),
            Some(ReconstructEvent::ReconstructFailed(message)) if message == "No positions found"
        ));
    }

    #[test]
    fn test_busy_while_reconstructing() {
        let reconstructer = Reconstructer::new(params());
        reconstructer.set_input_data(sweep()).unwrap();
        let job = reconstructer.begin().unwrap();
        assert_eq!(reconstructer.state(), ReconstructState::Reconstructing);

        assert!(matches!(reconstructer.reconstruct(), Err(ReconstructError::Busy)));
        assert!(matches!(reconstructer.set_input_data(sweep()), Err(ReconstructError::Busy)));
        assert!(matches!(reconstructer.set_params(params()), Err(ReconstructError::Busy)));
        assert!(matches!(reconstructer.clear_all(), Err(ReconstructError::Busy)));

        reconstructer.finish(job.run()).unwrap();
        assert_eq!(reconstructer.state(), ReconstructState::Done);
    }

    /// Fills slices until half the volume is written, then cancels through
    /// the reconstructer like a caller on another thread would.
    struct CancelHalfway {
        reconstructer: Reconstructer,
    }

    impl ReconstructAlgorithm for CancelHalfway {
        fn name(&self) -> &'static str {
            "cancel-halfway"
        }

        fn reconstruct(
            &self,
            _input: &ReconstructInput,
            volume: &mut OutputVolume,
            cancel: &CancelToken,
        ) -> Result<FillOutcome, ReconstructError> {
            let depth = volume.dim().0;
            for (z, mut slice) in volume.data_mut().axis_iter_mut(Axis(0)).enumerate() {
                if cancel.is_cancelled() {
                    return Ok(FillOutcome::Cancelled);
                }
                slice.fill(255);
                if z == depth / 2 {
                    assert!(self.reconstructer.cancel());
                }
            }
            Ok(FillOutcome::Completed)
        }
    }

    #[test]
    fn test_cancel_mid_fill_keeps_previous_output() {
        let reconstructer = Reconstructer::new(params());
        reconstructer.set_input_data(sweep()).unwrap();
        let ReconstructOutcome::Finished(first) = reconstructer.reconstruct().unwrap() else {
            panic!("reconstruction did not finish");
        };
        // frame intensities stay below 150
        assert!(first.data().iter().all(|&v| v < 150));

        let mut job = reconstructer.begin().unwrap();
        job.algorithm = Box::new(CancelHalfway {
            reconstructer: reconstructer.clone(),
        });
        let outcome = reconstructer.finish(job.run()).unwrap();

        assert!(matches!(outcome, ReconstructOutcome::Cancelled));
        assert_eq!(reconstructer.state(), ReconstructState::VolumePlanned);
        let output = reconstructer.output().unwrap();
        assert!(Arc::ptr_eq(&first, &output));
        assert!(output.data().iter().all(|&v| v < 150));
    }

    #[test]
    fn test_cancel_before_fill_keeps_previous_output() {
        let reconstructer = Reconstructer::new(params());
        let events = recorded(&reconstructer);
        reconstructer.set_input_data(sweep()).unwrap();
        let ReconstructOutcome::Finished(first) = reconstructer.reconstruct().unwrap() else {
            panic!("reconstruction did not finish");
        };

        let job = reconstructer.begin().unwrap();
        assert!(reconstructer.cancel());
        let outcome = reconstructer.finish(job.run()).unwrap();

        assert!(matches!(outcome, ReconstructOutcome::Cancelled));
        assert_eq!(reconstructer.state(), ReconstructState::VolumePlanned);
        assert!(Arc::ptr_eq(&first, &reconstructer.output().unwrap()));
        assert_eq!(events.lock().last(), Some(&ReconstructEvent::ReconstructCancelled));
        assert!(!reconstructer.cancel());
    }

    #[test]
    fn test_params_change_events() {
        let reconstructer = Reconstructer::new(params());
        reconstructer.set_input_data(sweep()).unwrap();
        reconstructer.prepare().unwrap();
        let events = recorded(&reconstructer);

        let mut changed = params();
        changed.algorithm = AlgorithmKind::GaussianSplat.name().to_string();
        reconstructer.set_params(changed.clone()).unwrap();
        assert_eq!(
            *events.lock(),
            vec![ReconstructEvent::ParamsChanged, ReconstructEvent::AlgorithmChanged]
        );
        // the plan survives an algorithm change
        assert!(reconstructer.output_volume_params().is_some());

        events.lock().clear();
        changed.spacing = Some(1.0);
        reconstructer.set_params(changed).unwrap();
        assert_eq!(*events.lock(), vec![ReconstructEvent::ParamsChanged]);
        assert!(reconstructer.output_volume_params().is_none());
        assert_eq!(reconstructer.state(), ReconstructState::DataLoaded);
        assert_eq!(reconstructer.prepare().unwrap().spacing, 1.0);
    }

    #[test]
    fn test_override_output_grid() {
        let reconstructer = Reconstructer::new(params());
        reconstructer.set_input_data(sweep()).unwrap();
        let mut grid = reconstructer.prepare().unwrap();
        assert_eq!(reconstructer.state(), ReconstructState::VolumePlanned);
        assert_eq!(grid.spacing, 0.5);

        grid.set_spacing(1.0);
        reconstructer.set_output_volume_params(grid.clone()).unwrap();
        let ReconstructOutcome::Finished(volume) = reconstructer.reconstruct().unwrap() else {
            panic!("reconstruction did not finish");
        };
        assert_eq!(volume.params().dim, grid.dim);

        grid.set_spacing(-1.0);
        assert!(reconstructer.set_output_volume_params(grid).is_err());
    }

    #[test]
    fn test_oversized_grid_is_rejected() {
        let reconstructer = Reconstructer::new(params());
        reconstructer.set_input_data(sweep()).unwrap();
        let mut grid = reconstructer.prepare().unwrap();

        grid.dim = [1 << 22; 3];
        assert!(matches!(
            reconstructer.set_output_volume_params(grid),
            Err(ReconstructError::InvalidOption { .. })
        ));
        assert_eq!(reconstructer.state(), ReconstructState::VolumePlanned);
        assert!(matches!(
            reconstructer.reconstruct().unwrap(),
            ReconstructOutcome::Finished(_)
        ));
    }

    #[test]
    fn test_panicking_fill_releases_the_reconstructer() {
        let reconstructer = Reconstructer::new(params());
        let events = recorded(&reconstructer);
        reconstructer.set_input_data(sweep()).unwrap();

        // too large to allocate
        let mut job = reconstructer.begin().unwrap();
        job.params.dim = [1 << 22; 3];
        assert!(matches!(
            reconstructer.finish(job.run()),
            Err(ReconstructError::WorkerFailed(_))
        ));
        assert_eq!(reconstructer.state(), ReconstructState::Error);
        assert!(reconstructer.output().is_none());
        assert!(matches!(
            events.lock().last(),
            Some(ReconstructEvent::ReconstructFailed(_))
        ));

        assert!(matches!(
            reconstructer.reconstruct().unwrap(),
            ReconstructOutcome::Finished(_)
        ));
    }

    #[test]
    fn test_tiny_spacing_stays_within_voxel_budget() {
        let reconstructer = Reconstructer::new(ReconstructParams {
            spacing: Some(1e-6),
            ..params()
        });
        reconstructer.set_input_data(sweep()).unwrap();
        let grid = reconstructer.prepare().unwrap();
        assert!(grid.voxel_count() <= grid.max_voxels);
        assert!(grid.spacing > 1e-6);
    }

    #[test]
    fn test_narrow_colour_frames_fail_without_panicking() {
        let reconstructer = Reconstructer::new(params());
        let mut data = sweep();
        data.frames[3].pixels = FramePixels::Rgb(ndarray::Array3::zeros((24, 32, 2)));
        reconstructer.set_input_data(data).unwrap();

        assert!(matches!(
            reconstructer.reconstruct(),
            Err(ReconstructError::InvalidOption { .. })
        ));
        assert_eq!(reconstructer.state(), ReconstructState::Error);
        assert!(reconstructer.output().is_none());
    }

    #[test]
    fn test_outdated_preparation_is_discarded() {
        let reconstructer = Reconstructer::new(params());
        reconstructer.set_input_data(sweep()).unwrap();
        let request = reconstructer.shared.inner.lock().prepare_request().unwrap();

        let mut other = sweep();
        other.name = "other".into();
        reconstructer.set_input_data(other).unwrap();

        assert!(matches!(
            reconstructer.run_preparation(request),
            Err(ReconstructError::Busy)
        ));
        assert_eq!(reconstructer.state(), ReconstructState::DataLoaded);
        assert!(reconstructer.output_volume_params().is_none());
        assert!(reconstructer.prepare().is_ok());
    }

    #[test]
    fn test_spawned_reconstruction() {
        let reconstructer = Reconstructer::new(params());
        reconstructer.set_input_data(sweep()).unwrap();
        let task = reconstructer.spawn_reconstruct().unwrap();
        let outcome = task.wait().unwrap();

        assert!(matches!(outcome, ReconstructOutcome::Finished(_)));
        assert_eq!(reconstructer.state(), ReconstructState::Done);
        assert!(reconstructer.output().is_some());
    }

    #[test]
    fn test_clear_and_reload() {
        let reconstructer = Reconstructer::new(params());
        reconstructer.set_input_data(sweep()).unwrap();
        reconstructer.reconstruct().unwrap();

        reconstructer.clear_all().unwrap();
        assert_eq!(reconstructer.state(), ReconstructState::Idle);
        assert!(reconstructer.output().is_none());
        assert!(matches!(reconstructer.prepare(), Err(ReconstructError::NoInputData)));

        reconstructer.reload().unwrap();
        assert_eq!(reconstructer.state(), ReconstructState::DataLoaded);
        assert!(reconstructer.prepare().is_ok());
    }

    #[test]
    fn test_estimation_fallback_is_reported() {
        let reconstructer = Reconstructer::default();
        let mut data = sweep();
        // identical frames carry no motion to correlate
        for frame in &mut data.frames {
            frame.pixels = FramePixels::Gray(Array2::from_elem((24, 32), 90));
        }
        reconstructer.set_input_data(data).unwrap();
        reconstructer.prepare().unwrap();

        assert_eq!(reconstructer.time_calibration(), Some(TimeCalibration::default()));
        assert!(
            reconstructer
                .diagnostics()
                .iter()
                .any(|d| d.severity == Severity::Warning)
        );
    }
}
