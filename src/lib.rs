//! This crate generates synthetic voltage traces of compartmental neuron models for machine
//! learning, by sweeping their biophysical parameters through the NEURON simulator.
//!
//! # Sampling Parameters
//!
//! ```rust
//! use rusty_sweep::model::ModelKind;
//! use rusty_sweep::params::SampleBatch;
//! use rand::SeedableRng;
//! use rand_chacha::ChaCha8Rng;
//!
//! let spec = ModelKind::Izhi.spec().unwrap();
//! let mut rng = ChaCha8Rng::seed_from_u64(42);
//! let batch = SampleBatch::rand(&spec, 1000, &mut rng);
//!
//! assert_eq!(batch.num_samples(), 1000);
//! assert_eq!(batch.dim(), 4);
//!
//! // Parameters are stored both in physical units and normalized into [-1, 1]
//! let normalized = batch.normalize(&spec, 1.0).unwrap();
//! assert!(normalized.matrix().iter().all(|x| x.abs() <= 1.0));
//! ```
//!
//! # Splitting a Sweep Among Workers
//!
//! ```rust
//! use rusty_sweep::partition::{partition, WorkerRange};
//!
//! let ranges = partition(10, 3).unwrap();
//! assert_eq!(ranges, vec![WorkerRange::new(0, 4), WorkerRange::new(4, 8), WorkerRange::new(8, 10)]);
//! ```
//!
//! # Simulating
//!
//! A [`driver::Sweep`] runs the samples of a worker through any [`simulator::Simulator`], e.g.,
//! the [`nrniv::NrnivEngine`], and the results are written into a [`store::TraceStore`].

pub mod driver;
pub mod error;
pub mod model;
pub mod nrniv;
pub mod params;
pub mod partition;
pub mod simulator;
pub mod stimulus;
pub mod store;

/// The default number of samples of a trace store.
pub const DEFAULT_NUM_SAMPLES: usize = 10000;
/// The default integration step (ms).
pub const DEFAULT_DT: f64 = 0.02;
/// The default stop time (ms), before silence padding.
pub const DEFAULT_TSTOP: f64 = 160.0;
/// The default temperature of the simulations (°C).
pub const DEFAULT_CELSIUS: f64 = 33.0;
/// The bound of the normalized parameter range [-minmax, minmax].
pub const DEFAULT_MINMAX: f64 = 1.0;
/// Number of samples between two progress messages.
pub const PROGRESS_INTERVAL: usize = 100;
