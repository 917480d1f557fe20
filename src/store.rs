//! HDF5 container for the results of a sweep.
//!
//! A trace store holds five datasets:
//!
//! - `phys_par`: N×D physical parameter values,
//! - `norm_par`: N×D normalized parameter values,
//! - `phys_par_range`: D×2 parameter bounds,
//! - `stim`: the stimulus waveform shared by every sample,
//! - `voltages`: N×T voltage traces,
//!
//! and the attributes `model`, `param_names`, `dt` and `tstop` on the root group.
//!
//! The datasets are allocated on creation and read as zeros until written. Every access opens
//! the file, works on it and closes it while holding `<store>.lock`, so independent processes
//! filling disjoint row ranges take turns on the file.
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::{Duration, Instant};

use hdf5::types::VarLenUnicode;
use nalgebra::DMatrix;
use ndarray::{s, Array1, Array2};

use crate::error::SweepError;
use crate::partition::WorkerRange;

pub const PHYS_PAR: &str = "phys_par";
pub const NORM_PAR: &str = "norm_par";
pub const PHYS_PAR_RANGE: &str = "phys_par_range";
pub const STIM: &str = "stim";
pub const VOLTAGES: &str = "voltages";

const MODEL_ATTR: &str = "model";
const PARAM_NAMES_ATTR: &str = "param_names";
const DT_ATTR: &str = "dt";
const TSTOP_ATTR: &str = "tstop";

/// How long a process waits for the lock of a store before giving up.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(600);
/// Delay between two attempts to take the lock of a store.
const LOCK_POLL: Duration = Duration::from_millis(50);

/// The metadata of a trace store, read once when it is opened.
#[derive(Debug, PartialEq, Clone)]
pub struct StoreHeader {
    pub model: String,
    pub param_names: Vec<String>,
    pub dt: f64,
    pub tstop: f64,
    pub num_samples: usize,
    pub num_timepoints: usize,
}

/// Everything needed to create a trace store.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub model: String,
    pub param_names: Vec<String>,
    pub dt: f64,
    pub tstop: f64,
    pub num_samples: usize,
    pub num_timepoints: usize,
    /// D×2 parameter bounds.
    pub phys_par_range: DMatrix<f64>,
    pub stim: Vec<f64>,
}

/// Exclusive access to a store across processes, released on drop.
#[derive(Debug)]
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    fn acquire(store: &Path, timeout: Duration) -> Result<Self, SweepError> {
        let mut path = store.as_os_str().to_owned();
        path.push(".lock");
        let path = PathBuf::from(path);

        let start = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => return Ok(StoreLock { path }),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(SweepError::IOError(format!(
                            "{} is still locked after {:?}, remove {} if no worker is running",
                            store.display(),
                            timeout,
                            path.display()
                        )));
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(e) => {
                    return Err(SweepError::IOError(format!(
                        "cannot lock {}: {}",
                        store.display(),
                        e
                    )))
                }
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            log::warn!("Cannot release {}: {}", self.path.display(), e);
        }
    }
}

fn to_array(matrix: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(matrix.shape(), |(i, j)| matrix[(i, j)])
}

fn to_matrix(array: &Array2<f64>) -> DMatrix<f64> {
    let (nrows, ncols) = array.dim();
    DMatrix::from_fn(nrows, ncols, |i, j| array[[i, j]])
}

fn invalid(path: &Path, e: impl std::fmt::Display) -> SweepError {
    SweepError::InvalidStore(format!("{}: {}", path.display(), e))
}

/// An existing trace store.
#[derive(Debug)]
pub struct TraceStore {
    path: PathBuf,
    header: StoreHeader,
    lock_timeout: Duration,
}

impl TraceStore {
    /// Create a trace store, overwriting any existing file, and write the parameter bounds and
    /// the stimulus. The other datasets read as zeros.
    pub fn create<P: AsRef<Path>>(path: P, layout: &StoreLayout) -> Result<Self, SweepError> {
        let path = path.as_ref();
        let dim = layout.param_names.len();
        if layout.phys_par_range.shape() != (dim, 2) {
            return Err(SweepError::ShapeMismatch(format!(
                "parameter bounds have shape {:?}, expected ({}, 2)",
                layout.phys_par_range.shape(),
                dim
            )));
        }
        let param_names = layout
            .param_names
            .iter()
            .map(|name| VarLenUnicode::from_str(name).map_err(|e| invalid(path, e)))
            .collect::<Result<Vec<_>, _>>()?;
        let model = VarLenUnicode::from_str(&layout.model).map_err(|e| invalid(path, e))?;

        let _lock = StoreLock::acquire(path, LOCK_TIMEOUT)?;
        if path.exists() {
            log::warn!("Overwriting existing trace store {}", path.display());
        }
        let file = hdf5::File::create(path)?;
        file.new_dataset::<f64>()
            .shape((layout.num_samples, dim))
            .create(PHYS_PAR)?;
        file.new_dataset::<f64>()
            .shape((layout.num_samples, dim))
            .create(NORM_PAR)?;
        file.new_dataset_builder()
            .with_data(&to_array(&layout.phys_par_range))
            .create(PHYS_PAR_RANGE)?;
        file.new_dataset_builder()
            .with_data(&Array1::from(layout.stim.clone()))
            .create(STIM)?;
        file.new_dataset::<f64>()
            .shape((layout.num_samples, layout.num_timepoints))
            .create(VOLTAGES)?;

        file.new_attr::<VarLenUnicode>()
            .shape(())
            .create(MODEL_ATTR)?
            .write_scalar(&model)?;
        file.new_attr::<VarLenUnicode>()
            .shape(dim)
            .create(PARAM_NAMES_ATTR)?
            .write(&Array1::from(param_names))?;
        file.new_attr::<f64>().shape(()).create(DT_ATTR)?.write_scalar(&layout.dt)?;
        file.new_attr::<f64>()
            .shape(())
            .create(TSTOP_ATTR)?
            .write_scalar(&layout.tstop)?;
        drop(file);

        log::info!(
            "Created trace store {} for {} samples of {} time points",
            path.display(),
            layout.num_samples,
            layout.num_timepoints
        );
        Ok(TraceStore {
            path: path.to_path_buf(),
            header: StoreHeader {
                model: layout.model.clone(),
                param_names: layout.param_names.clone(),
                dt: layout.dt,
                tstop: layout.tstop,
                num_samples: layout.num_samples,
                num_timepoints: layout.num_timepoints,
            },
            lock_timeout: LOCK_TIMEOUT,
        })
    }

    /// Open an existing trace store and read its metadata.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, SweepError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SweepError::IOError(format!(
                "trace store {} does not exist, create it first with --create",
                path.display()
            )));
        }

        let header = {
            let _lock = StoreLock::acquire(path, LOCK_TIMEOUT)?;
            let file = hdf5::File::open(path).map_err(|e| invalid(path, e))?;
            Self::read_header(path, &file)?
        };

        log::debug!("Opened trace store {}", path.display());
        Ok(TraceStore {
            path: path.to_path_buf(),
            header,
            lock_timeout: LOCK_TIMEOUT,
        })
    }

    fn read_header(path: &Path, file: &hdf5::File) -> Result<StoreHeader, SweepError> {
        let model = file
            .attr(MODEL_ATTR)
            .and_then(|attr| attr.read_scalar::<VarLenUnicode>())
            .map_err(|e| invalid(path, e))?
            .as_str()
            .to_string();
        let param_names = file
            .attr(PARAM_NAMES_ATTR)
            .and_then(|attr| attr.read_1d::<VarLenUnicode>())
            .map_err(|e| invalid(path, e))?
            .iter()
            .map(|name| name.as_str().to_string())
            .collect::<Vec<_>>();
        let dt = file
            .attr(DT_ATTR)
            .and_then(|attr| attr.read_scalar::<f64>())
            .map_err(|e| invalid(path, e))?;
        let tstop = file
            .attr(TSTOP_ATTR)
            .and_then(|attr| attr.read_scalar::<f64>())
            .map_err(|e| invalid(path, e))?;

        let shape = |name: &str| -> Result<Vec<usize>, SweepError> {
            Ok(file.dataset(name).map_err(|e| invalid(path, e))?.shape())
        };
        let dim = param_names.len();
        let voltages = shape(VOLTAGES)?;
        if voltages.len() != 2 {
            return Err(invalid(path, "voltages is not a table"));
        }
        for name in [PHYS_PAR, NORM_PAR] {
            if shape(name)? != vec![voltages[0], dim] {
                return Err(invalid(path, format!("{} does not have {} columns", name, dim)));
            }
        }
        if shape(PHYS_PAR_RANGE)? != vec![dim, 2] {
            return Err(invalid(path, "phys_par_range is not a D×2 table"));
        }
        if shape(STIM)?.len() != 1 {
            return Err(invalid(path, "stim is not a vector"));
        }

        Ok(StoreHeader {
            model,
            param_names,
            dt,
            tstop,
            num_samples: voltages[0],
            num_timepoints: voltages[1],
        })
    }

    /// Wait at most `timeout` for the other processes using the store.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    /// Returns the number of samples (N).
    pub fn num_samples(&self) -> usize {
        self.header.num_samples
    }

    /// Returns the number of parameters (D).
    pub fn dim(&self) -> usize {
        self.header.param_names.len()
    }

    /// Returns the number of time points per trace (T).
    pub fn num_timepoints(&self) -> usize {
        self.header.num_timepoints
    }

    /// Write the results of a worker range: physical and normalized parameters and voltages.
    /// Every table must have one row per index of the range.
    pub fn write_rows(
        &self,
        range: &WorkerRange,
        phys_par: &DMatrix<f64>,
        norm_par: &DMatrix<f64>,
        voltages: &DMatrix<f64>,
    ) -> Result<(), SweepError> {
        for (name, rows) in [(PHYS_PAR, phys_par), (NORM_PAR, norm_par), (VOLTAGES, voltages)] {
            if rows.nrows() != range.len() {
                return Err(SweepError::ShapeMismatch(format!(
                    "{} rows given for {} but the range [{}, {}) has {}",
                    rows.nrows(),
                    name,
                    range.start,
                    range.stop,
                    range.len()
                )));
            }
        }
        if range.stop > self.num_samples() {
            return Err(SweepError::ShapeMismatch(format!(
                "range [{}, {}) exceeds the {} samples of {}",
                range.start,
                range.stop,
                self.num_samples(),
                self.path.display()
            )));
        }
        if phys_par.ncols() != self.dim() || norm_par.ncols() != self.dim() {
            return Err(SweepError::ShapeMismatch(format!(
                "{} has {} parameters, got {}",
                self.path.display(),
                self.dim(),
                phys_par.ncols()
            )));
        }
        if voltages.ncols() != self.num_timepoints() {
            return Err(SweepError::ShapeMismatch(format!(
                "{} has traces of {} time points, got {}",
                self.path.display(),
                self.num_timepoints(),
                voltages.ncols()
            )));
        }
        if range.is_empty() {
            return Ok(());
        }

        let _lock = StoreLock::acquire(&self.path, self.lock_timeout)?;
        let file = hdf5::File::open_rw(&self.path)?;
        for (name, rows) in [(PHYS_PAR, phys_par), (NORM_PAR, norm_par), (VOLTAGES, voltages)] {
            file.dataset(name)?
                .write_slice(&to_array(rows), s![range.start..range.stop, ..])?;
        }
        Ok(())
    }

    /// Read a whole 1-D dataset.
    pub fn read_vector(&self, name: &str) -> Result<Vec<f64>, SweepError> {
        let _lock = StoreLock::acquire(&self.path, self.lock_timeout)?;
        let file = hdf5::File::open(&self.path)?;
        let values = file.dataset(name)?.read_1d::<f64>()?;
        Ok(values.to_vec())
    }

    /// Read a 2-D dataset.
    pub fn read_matrix(&self, name: &str) -> Result<DMatrix<f64>, SweepError> {
        let _lock = StoreLock::acquire(&self.path, self.lock_timeout)?;
        let file = hdf5::File::open(&self.path)?;
        let values = file.dataset(name)?.read_2d::<f64>()?;
        Ok(to_matrix(&values))
    }

    /// Returns the layout the store was created with.
    pub fn layout(&self) -> Result<StoreLayout, SweepError> {
        Ok(StoreLayout {
            model: self.header.model.clone(),
            param_names: self.header.param_names.clone(),
            dt: self.header.dt,
            tstop: self.header.tstop,
            num_samples: self.num_samples(),
            num_timepoints: self.num_timepoints(),
            phys_par_range: self.read_matrix(PHYS_PAR_RANGE)?,
            stim: self.read_vector(STIM)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(num_samples: usize) -> StoreLayout {
        StoreLayout {
            model: "izhi".to_string(),
            param_names: vec!["a".to_string(), "b".to_string()],
            dt: 0.5,
            tstop: 2.0,
            num_samples,
            num_timepoints: 4,
            phys_par_range: DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 1.0]),
            stim: vec![0.0, 1.0, 2.0, 3.0, 4.0],
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h5");
        TraceStore::create(&path, &layout(3)).unwrap();

        let store = TraceStore::open(&path).unwrap();
        assert_eq!(store.num_samples(), 3);
        assert_eq!(store.dim(), 2);
        assert_eq!(store.num_timepoints(), 4);
        assert_eq!(store.header().model, "izhi");
        assert_eq!(store.header().dt, 0.5);
        assert_eq!(store.header().tstop, 2.0);
        assert_eq!(store.read_vector(STIM).unwrap(), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            store.read_matrix(PHYS_PAR_RANGE).unwrap(),
            DMatrix::from_row_slice(2, 2, &[0.0, 1.0, -1.0, 1.0])
        );
        assert_eq!(store.read_matrix(VOLTAGES).unwrap(), DMatrix::zeros(3, 4));

        let layout = store.layout().unwrap();
        assert_eq!(layout.num_samples, 3);
        assert_eq!(layout.param_names, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(layout.stim, vec![0.0, 1.0, 2.0, 3.0, 4.0]);

        // No lock is left behind.
        assert!(!dir.path().join("out.h5.lock").exists());
    }

    #[test]
    fn test_write_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h5");
        let store = TraceStore::create(&path, &layout(3)).unwrap();

        let phys = DMatrix::from_row_slice(2, 2, &[0.1, 0.2, 0.3, 0.4]);
        let norm = DMatrix::from_row_slice(2, 2, &[-0.8, 0.2, -0.4, 0.4]);
        let voltages = DMatrix::from_row_slice(2, 4, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        store.write_rows(&WorkerRange::new(1, 3), &phys, &norm, &voltages).unwrap();

        let stored = store.read_matrix(VOLTAGES).unwrap();
        assert_eq!(stored.row(0).iter().copied().collect::<Vec<_>>(), vec![0.0; 4]);
        assert_eq!(stored.row(2).iter().copied().collect::<Vec<_>>(), vec![5.0, 6.0, 7.0, 8.0]);
        assert_eq!(store.read_matrix(PHYS_PAR).unwrap()[(1, 1)], 0.2);
        assert_eq!(store.read_matrix(NORM_PAR).unwrap()[(2, 0)], -0.4);
    }

    #[test]
    fn test_two_handles_write_disjoint_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h5");
        TraceStore::create(&path, &layout(4)).unwrap();

        let first = TraceStore::open(&path).unwrap();
        let second = TraceStore::open(&path).unwrap();
        let params = DMatrix::from_element(2, 2, 0.5);
        second
            .write_rows(&WorkerRange::new(2, 4), &params, &params, &DMatrix::from_element(2, 4, 2.0))
            .unwrap();
        first
            .write_rows(&WorkerRange::new(0, 2), &params, &params, &DMatrix::from_element(2, 4, 1.0))
            .unwrap();

        let voltages = first.read_matrix(VOLTAGES).unwrap();
        assert_eq!(voltages.rows(0, 2), DMatrix::from_element(2, 4, 1.0));
        assert_eq!(voltages.rows(2, 2), DMatrix::from_element(2, 4, 2.0));
    }

    #[test]
    fn test_write_rows_rejects_bad_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let store = TraceStore::create(dir.path().join("out.h5"), &layout(2)).unwrap();

        let phys = DMatrix::zeros(2, 2);
        let voltages = DMatrix::zeros(2, 4);
        assert!(matches!(
            store.write_rows(&WorkerRange::new(1, 3), &phys, &phys, &voltages),
            Err(SweepError::ShapeMismatch(_))
        ));
        assert!(matches!(
            store.write_rows(&WorkerRange::new(0, 2), &DMatrix::zeros(2, 3), &phys, &voltages),
            Err(SweepError::ShapeMismatch(_))
        ));
        assert!(matches!(
            store.write_rows(&WorkerRange::new(0, 2), &phys, &phys, &DMatrix::zeros(2, 5)),
            Err(SweepError::ShapeMismatch(_))
        ));
        assert!(matches!(
            store.write_rows(&WorkerRange::new(0, 1), &phys, &phys, &voltages),
            Err(SweepError::ShapeMismatch(_))
        ));
        assert_eq!(store.read_matrix(VOLTAGES).unwrap(), DMatrix::zeros(2, 4));
    }

    #[test]
    fn test_locked_store_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h5");
        let store = TraceStore::create(&path, &layout(1))
            .unwrap()
            .with_lock_timeout(Duration::from_millis(120));

        std::fs::write(dir.path().join("out.h5.lock"), b"").unwrap();
        assert!(matches!(store.read_vector(STIM), Err(SweepError::IOError(_))));

        std::fs::remove_file(dir.path().join("out.h5.lock")).unwrap();
        assert_eq!(store.read_vector(STIM).unwrap().len(), 5);
    }

    #[test]
    fn test_open_missing_or_invalid() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            TraceStore::open(dir.path().join("missing.h5")),
            Err(SweepError::IOError(_))
        ));

        let path = dir.path().join("garbage.h5");
        std::fs::write(&path, b"not a trace store at all").unwrap();
        assert!(matches!(TraceStore::open(&path), Err(SweepError::InvalidStore(_))));
    }
}
