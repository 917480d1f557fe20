//! Sequential simulation of the parameter sets assigned to a worker.
//!
//! A failing sample does not abort the sweep: it is logged, recorded in the [`SweepReport`],
//! and its voltage row is filled with NaN so that the completed samples can still be saved.
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use derivative::Derivative;
use nalgebra::DMatrix;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::error::SweepError;
use crate::model::{BallStickGeometry, ModelKind};
use crate::params::{ParameterSet, ParameterSpec, SampleBatch};
use crate::partition::{ExecutionMode, WorkerRange};
use crate::simulator::{SimulationContext, Simulator};
use crate::stimulus::Stimulus;
use crate::store::{StoreLayout, TraceStore};
use crate::{DEFAULT_MINMAX, PROGRESS_INTERVAL};

/// A sample whose simulation failed.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct FailedSample {
    /// The global index of the sample.
    pub index: usize,
    pub params: ParameterSet,
    pub reason: String,
}

/// Summary of a sweep over a worker range.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    pub model: String,
    pub range: WorkerRange,
    pub completed: usize,
    pub failed: Vec<FailedSample>,
}

impl SweepReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn failed_indices(&self) -> Vec<usize> {
        self.failed.iter().map(|sample| sample.index).collect()
    }

    /// Save the report as JSON.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), SweepError> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self).map_err(|e| SweepError::IOError(e.to_string()))
    }
}

/// The voltage traces of a worker range, one row per sample, and the sweep report.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub voltages: DMatrix<f64>,
    pub report: SweepReport,
}

/// Runs the samples of a model under a fixed stimulus and simulation context.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Sweep {
    model: ModelKind,
    geometry: BallStickGeometry,
    ctx: SimulationContext,
    stimulus: Stimulus,
    #[derivative(Debug = "ignore")]
    engine: Box<dyn Simulator>,
}

impl Sweep {
    pub fn new(model: ModelKind, ctx: SimulationContext, stimulus: Stimulus, engine: Box<dyn Simulator>) -> Self {
        Sweep {
            model,
            geometry: BallStickGeometry::default(),
            ctx,
            stimulus,
            engine,
        }
    }

    /// Use a different dendritic geometry for the multi-compartment models.
    pub fn with_geometry(mut self, geometry: BallStickGeometry) -> Self {
        self.geometry = geometry;
        self
    }

    pub fn model(&self) -> ModelKind {
        self.model
    }

    pub fn context(&self) -> &SimulationContext {
        &self.ctx
    }

    pub fn stimulus(&self) -> &Stimulus {
        &self.stimulus
    }

    /// Simulate one parameter set and return its voltage trace.
    pub fn simulate(&mut self, params: &[f64]) -> Result<Vec<f64>, SweepError> {
        let topology = self.model.build_topology_with(params, &self.geometry)?;
        let recording = self.engine.run(&self.ctx, &topology, self.stimulus.values())?;
        Ok(recording.voltage(self.ctx.num_timepoints())?.to_vec())
    }

    /// Simulate every parameter set of a batch, whose rows are the samples of `range`.
    pub fn run(&mut self, batch: &SampleBatch, range: &WorkerRange) -> Result<SweepOutcome, SweepError> {
        if batch.dim() != self.model.dim() {
            return Err(SweepError::InvalidParameter(format!(
                "model {} expects {} parameters, the batch has {}",
                self.model,
                self.model.dim(),
                batch.dim()
            )));
        }
        if batch.num_samples() != range.len() {
            return Err(SweepError::ShapeMismatch(format!(
                "{} parameter sets given for the range [{}, {})",
                batch.num_samples(),
                range.start,
                range.stop
            )));
        }

        let num_timepoints = self.ctx.num_timepoints();
        let mut voltages = DMatrix::zeros(batch.num_samples(), num_timepoints);
        let mut failed = vec![];

        for (i, params) in batch.rows().enumerate() {
            if i % PROGRESS_INTERVAL == 0 {
                log::info!("{} / {}", i, batch.num_samples());
            }
            log::debug!("About to run with params = {:?}", params);
            let index = range.start + i;
            match self.simulate(&params) {
                Ok(v) => voltages.row_mut(i).iter_mut().zip(v).for_each(|(x, v)| *x = v),
                Err(e) => {
                    log::warn!("Sample {} failed with params = {:?}: {}", index, params, e);
                    voltages.row_mut(i).fill(f64::NAN);
                    failed.push(FailedSample {
                        index,
                        params,
                        reason: e.to_string(),
                    });
                }
            }
        }

        let report = SweepReport {
            model: self.model.to_string(),
            range: *range,
            completed: batch.num_samples() - failed.len(),
            failed,
        };
        if report.is_success() {
            log::info!("Simulated {} samples", report.completed);
        } else {
            log::warn!(
                "Simulated {} samples, {} failed: {:?}",
                report.completed,
                report.failed.len(),
                report.failed_indices()
            );
        }
        Ok(SweepOutcome { voltages, report })
    }
}

/// Where the parameter sets of a run come from.
#[derive(Debug, PartialEq, Clone)]
pub enum SampleSource {
    /// A parameter file, one set per line.
    File(PathBuf),
    /// `num` sets drawn uniformly at random, from `seed` if given.
    Random { num: usize, seed: Option<u64> },
    /// A single explicit parameter set.
    Explicit(ParameterSet),
    /// The default parameters of the model.
    Defaults,
}

impl SampleSource {
    /// Pick the source of a run. A parameter file takes precedence over a number of random
    /// samples, which takes precedence over an explicit parameter set.
    pub fn select(
        param_file: Option<PathBuf>,
        num: Option<usize>,
        params: Option<ParameterSet>,
        seed: Option<u64>,
    ) -> Self {
        match (param_file, num, params) {
            (Some(path), ..) => SampleSource::File(path),
            (None, Some(num), _) => SampleSource::Random { num, seed },
            (None, None, Some(params)) => SampleSource::Explicit(params),
            (None, None, None) => SampleSource::Defaults,
        }
    }
}

/// Returns the generator used to sample parameter sets.
///
/// Without a seed, every worker draws from its own entropy and the workers no longer agree on
/// the global batch.
pub fn sampling_rng(seed: Option<u64>, mode: &ExecutionMode) -> ChaCha8Rng {
    match seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => {
            if mode.is_parallel() {
                log::warn!("No --seed given, every worker samples its own parameter sets");
            }
            ChaCha8Rng::from_entropy()
        }
    }
}

/// Returns the parameter sets of this worker and their global indices.
pub fn select_samples(
    source: &SampleSource,
    model: ModelKind,
    spec: &ParameterSpec,
    mode: &ExecutionMode,
) -> Result<(SampleBatch, WorkerRange), SweepError> {
    let all = match source {
        SampleSource::File(path) => SampleBatch::load_from(path, spec)?,
        SampleSource::Random { num, seed } => {
            SampleBatch::rand(spec, *num, &mut sampling_rng(*seed, mode))
        }
        SampleSource::Explicit(params) => {
            spec.check_len(params)?;
            SampleBatch::from_rows(&[params.clone()], spec.dim())?
        }
        SampleSource::Defaults => {
            log::info!("Cell parameters not specified, running with default parameters");
            SampleBatch::from_rows(&[model.default_params()], spec.dim())?
        }
    };

    let range = mode.range(all.num_samples())?;
    Ok((all.slice(&range)?, range))
}

/// Returns an error if a run would neither plot nor save anything, unless it is forced.
pub fn check_output_action(plot: bool, save: bool, force: bool) -> Result<(), SweepError> {
    if plot || save || force {
        Ok(())
    } else {
        Err(SweepError::NoOutputAction)
    }
}

/// Fail before simulating anything if the results of `range` would not fit in the store.
pub fn check_store(
    store: &TraceStore,
    model: ModelKind,
    ctx: &SimulationContext,
    range: &WorkerRange,
) -> Result<(), SweepError> {
    let header = store.header();
    if header.model != model.name() {
        return Err(SweepError::ShapeMismatch(format!(
            "{} was created for model {}, not {}",
            store.path().display(),
            header.model,
            model
        )));
    }
    if store.num_timepoints() != ctx.num_timepoints() {
        return Err(SweepError::ShapeMismatch(format!(
            "{} holds traces of {} time points, this run produces {}",
            store.path().display(),
            store.num_timepoints(),
            ctx.num_timepoints()
        )));
    }
    if range.stop > store.num_samples() {
        return Err(SweepError::ShapeMismatch(format!(
            "{} holds {} samples, cannot write samples {} through {}",
            store.path().display(),
            store.num_samples(),
            range.start,
            range.stop
        )));
    }
    Ok(())
}

/// Returns the layout of a trace store for a sweep of `num_samples` samples.
pub fn store_layout(
    model: ModelKind,
    ctx: &SimulationContext,
    stimulus: &Stimulus,
    num_samples: usize,
) -> Result<StoreLayout, SweepError> {
    let spec = model.spec()?;
    Ok(StoreLayout {
        model: model.to_string(),
        param_names: spec.names(),
        dt: ctx.dt(),
        tstop: ctx.tstop(),
        num_samples,
        num_timepoints: ctx.num_timepoints(),
        phys_par_range: spec.bounds(),
        stim: stimulus.values().to_vec(),
    })
}

/// Write the parameters and traces of a worker range into a trace store.
pub fn save_outcome(
    store: &TraceStore,
    spec: &ParameterSpec,
    batch: &SampleBatch,
    outcome: &SweepOutcome,
) -> Result<(), SweepError> {
    log::info!("Saving into {}", store.path().display());
    let normalized = batch.normalize(spec, DEFAULT_MINMAX)?;
    store.write_rows(
        &outcome.report.range,
        batch.matrix(),
        normalized.matrix(),
        &outcome.voltages,
    )?;
    log::info!("Saved samples {} through {}", outcome.report.range.start, outcome.report.range.stop);
    Ok(())
}

/// Simulate every model at its default parameters and return the ones that fail.
pub fn check_models(
    engine: &mut dyn Simulator,
    ctx: &SimulationContext,
    stim: &[f64],
) -> Vec<(ModelKind, SweepError)> {
    ModelKind::all()
        .into_iter()
        .filter_map(|model| {
            let res = model
                .build_topology(&model.default_params())
                .and_then(|topology| engine.run(ctx, &topology, stim))
                .and_then(|recording| recording.voltage(ctx.num_timepoints()).map(|_| ()));
            match res {
                Ok(()) => {
                    log::info!("Model {}: ok", model);
                    None
                }
                Err(e) => {
                    log::warn!("Model {}: {}", model, e);
                    Some((model, e))
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Topology;
    use crate::simulator::Recording;

    /// Returns the stimulus as voltage, and fails whenever the soma sodium density exceeds 600.
    struct EchoEngine;

    impl Simulator for EchoEngine {
        fn run(
            &mut self,
            ctx: &SimulationContext,
            topology: &Topology,
            stim: &[f64],
        ) -> Result<Recording, SweepError> {
            let gnabar = topology.sections[0]
                .mechanisms
                .iter()
                .find(|m| m.name == "na")
                .map(|m| m.params[0].1);
            if gnabar.map_or(false, |g| g > 600.0) {
                return Err(SweepError::SimulationError("diverged".to_string()));
            }
            let mut recording = Recording::new();
            recording.insert(
                "v",
                (0..=ctx.num_timepoints()).map(|i| stim.get(i).copied().unwrap_or(0.0)).collect(),
            );
            Ok(recording)
        }
    }

    fn sweep() -> Sweep {
        let ctx = SimulationContext::build(0.5, 2.0).unwrap();
        let stimulus = Stimulus::new(vec![1.0, 2.0, 3.0, 4.0, 5.0], 0.5);
        Sweep::new(ModelKind::HhPoint5Param, ctx, stimulus, Box::new(EchoEngine))
    }

    #[test]
    fn test_run_isolates_failures() {
        let mut sweep = sweep();
        let batch = SampleBatch::from_rows(
            &[
                vec![500.0, 10.0, 1.5, 0.0005, 0.5],
                vec![900.0, 10.0, 1.5, 0.0005, 0.5],
                vec![300.0, 10.0, 1.5, 0.0005, 0.5],
            ],
            5,
        )
        .unwrap();

        let outcome = sweep.run(&batch, &WorkerRange::new(4, 7)).unwrap();
        assert_eq!(outcome.voltages.shape(), (3, 4));
        assert_eq!(outcome.voltages.row(0).iter().copied().collect::<Vec<_>>(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(outcome.voltages.row(1).iter().all(|v| v.is_nan()));
        assert_eq!(outcome.voltages[(2, 3)], 4.0);

        assert_eq!(outcome.report.completed, 2);
        assert_eq!(outcome.report.failed_indices(), vec![5]);
        assert_eq!(outcome.report.failed[0].params[0], 900.0);
        assert!(!outcome.report.is_success());
    }

    #[test]
    fn test_run_rejects_mismatched_batch() {
        let mut sweep = sweep();
        let batch = SampleBatch::from_rows(&[vec![0.1, 0.2, -60.0, 1.0]], 4).unwrap();
        assert!(matches!(
            sweep.run(&batch, &WorkerRange::new(0, 1)),
            Err(SweepError::InvalidParameter(_))
        ));

        let batch = SampleBatch::from_rows(&[ModelKind::HhPoint5Param.default_params()], 5).unwrap();
        assert!(matches!(
            sweep.run(&batch, &WorkerRange::new(0, 2)),
            Err(SweepError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_check_models() {
        let ctx = SimulationContext::build(0.5, 2.0).unwrap();
        let problems = check_models(&mut EchoEngine, &ctx, &[0.0; 5]);
        assert!(problems.is_empty());
    }

    #[test]
    fn test_sample_source_precedence() {
        let file = Some(PathBuf::from("params.txt"));
        let params = Some(vec![0.02, 0.2, -65.0, 2.0]);
        assert_eq!(
            SampleSource::select(file.clone(), Some(5), params.clone(), None),
            SampleSource::File(PathBuf::from("params.txt"))
        );
        assert_eq!(
            SampleSource::select(None, Some(5), params.clone(), Some(3)),
            SampleSource::Random { num: 5, seed: Some(3) }
        );
        assert_eq!(
            SampleSource::select(None, None, params.clone(), Some(3)),
            SampleSource::Explicit(vec![0.02, 0.2, -65.0, 2.0])
        );
        assert_eq!(SampleSource::select(None, None, None, None), SampleSource::Defaults);
    }

    #[test]
    fn test_select_samples() {
        let model = ModelKind::Izhi;
        let spec = model.spec().unwrap();
        let mode = ExecutionMode::build(Some(1), Some(3)).unwrap();

        let source = SampleSource::Random { num: 10, seed: Some(7) };
        let (batch, range) = select_samples(&source, model, &spec, &mode).unwrap();
        let all = SampleBatch::rand(&spec, 10, &mut ChaCha8Rng::seed_from_u64(7));
        assert_eq!(range, WorkerRange::new(4, 8));
        assert_eq!(batch, all.slice(&range).unwrap());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.txt");
        all.save_to(&path).unwrap();
        let (batch, range) = select_samples(&SampleSource::File(path), model, &spec, &mode).unwrap();
        assert_eq!(range, WorkerRange::new(4, 8));
        assert_eq!(batch, all.slice(&range).unwrap());

        let (batch, range) =
            select_samples(&SampleSource::Defaults, model, &spec, &ExecutionMode::Single).unwrap();
        assert_eq!(range, WorkerRange::new(0, 1));
        assert_eq!(batch.row(0), model.default_params());

        let source = SampleSource::Explicit(vec![0.05, 0.3, -70.0, 4.0]);
        let (batch, _) = select_samples(&source, model, &spec, &ExecutionMode::Single).unwrap();
        assert_eq!(batch.row(0), vec![0.05, 0.3, -70.0, 4.0]);

        let source = SampleSource::Explicit(vec![0.05, 0.3, -70.0]);
        assert!(matches!(
            select_samples(&source, model, &spec, &ExecutionMode::Single),
            Err(SweepError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_check_output_action() {
        assert_eq!(check_output_action(false, false, false), Err(SweepError::NoOutputAction));
        assert!(check_output_action(true, false, false).is_ok());
        assert!(check_output_action(false, true, false).is_ok());
        assert!(check_output_action(false, false, true).is_ok());
    }

    #[test]
    fn test_check_store() {
        let ctx = SimulationContext::build(0.5, 2.0).unwrap();
        let stimulus = Stimulus::new(vec![0.0; 4], 0.5);
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::create(
            dir.path().join("out.h5"),
            &store_layout(ModelKind::Izhi, &ctx, &stimulus, 4).unwrap(),
        )
        .unwrap();

        assert!(check_store(&store, ModelKind::Izhi, &ctx, &WorkerRange::new(2, 4)).is_ok());
        assert!(matches!(
            check_store(&store, ModelKind::HhPoint5Param, &ctx, &WorkerRange::new(0, 4)),
            Err(SweepError::ShapeMismatch(_))
        ));
        let longer = SimulationContext::build(0.5, 3.0).unwrap();
        assert!(matches!(
            check_store(&store, ModelKind::Izhi, &longer, &WorkerRange::new(0, 4)),
            Err(SweepError::ShapeMismatch(_))
        ));
        assert!(matches!(
            check_store(&store, ModelKind::Izhi, &ctx, &WorkerRange::new(3, 5)),
            Err(SweepError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_report_json() {
        let report = SweepReport {
            model: "izhi".to_string(),
            range: WorkerRange::new(0, 2),
            completed: 1,
            failed: vec![FailedSample {
                index: 1,
                params: vec![0.02, 0.2, -65.0, 2.0],
                reason: "diverged".to_string(),
            }],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failures.json");
        report.save_to(&path).unwrap();
        let loaded: SweepReport = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
        assert_eq!(loaded, report);
    }
}
