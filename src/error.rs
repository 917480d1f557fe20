//! Error module for the Rusty Sweep library.
use std::error::Error;
use std::fmt;

/// Error types for the library.
#[derive(Debug, PartialEq)]
pub enum SweepError {
    /// Error for invalid parameters, e.g., an inverted range or a parameter set of the wrong length.
    InvalidParameter(String),
    /// Error for an unknown model name.
    InvalidModel(String),
    /// Error for an unknown stimulus type or an unusable stimulus file.
    InvalidStimulus(String),
    /// Error for an integration step inconsistent with the stop time or with whole steps per millisecond.
    InvalidTimeStep { dt: f64, tstop: f64 },
    /// Nothing would be plotted or saved and `--force` was not given.
    NoOutputAction,
    /// Error for an invalid worker identity.
    InvalidWorker { rank: usize, workers: usize },
    /// Error raised by the simulation engine while running one sample.
    SimulationError(String),
    /// Error for data whose shape does not match the target container.
    ShapeMismatch(String),
    /// Error for a file that is not a valid trace store.
    InvalidStore(String),
    /// Some samples of a sweep failed; the remaining results were saved.
    FailedSamples(usize),
    /// Error for I/O operations.
    IOError(String),
}

impl fmt::Display for SweepError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SweepError::InvalidParameter(e) => write!(f, "Invalid parameters: {}", e),
            SweepError::InvalidModel(e) => write!(f, "Invalid model: {}", e),
            SweepError::InvalidStimulus(e) => write!(f, "Invalid stimulus: {}", e),
            SweepError::InvalidTimeStep { dt, tstop } => write!(
                f,
                "Invalid choice of dt: {} does not give a whole number of steps per ms and over tstop = {}",
                dt, tstop
            ),
            SweepError::NoOutputAction => write!(
                f,
                "You didn't choose to plot or save anything. Pass --force to continue anyways"
            ),
            SweepError::InvalidWorker { rank, workers } => {
                write!(f, "Invalid worker: rank {} among {} workers", rank, workers)
            }
            SweepError::SimulationError(e) => write!(f, "Simulation error: {}", e),
            SweepError::ShapeMismatch(e) => write!(f, "Shape mismatch: {}", e),
            SweepError::InvalidStore(e) => write!(f, "Invalid trace store: {}", e),
            SweepError::FailedSamples(n) => write!(f, "{} samples failed to simulate", n),
            SweepError::IOError(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl Error for SweepError {}

impl From<std::io::Error> for SweepError {
    fn from(e: std::io::Error) -> Self {
        SweepError::IOError(e.to_string())
    }
}

impl From<hdf5::Error> for SweepError {
    fn from(e: hdf5::Error) -> Self {
        SweepError::IOError(e.to_string())
    }
}
