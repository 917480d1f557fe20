//! Stimulus waveforms injected into the simulated cells.
//!
//! A waveform is either generated from a built-in family (ramp, step, chirp or noise) or
//! read from a text file, and sampled at the integration step of the simulation.
use std::f64::consts::PI;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use itertools::Itertools;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::SweepError;

/// Amplitude gained by each index of a built-in family.
pub const AMPLITUDE_STEP: f64 = 0.1;
/// Upper frequency (kHz) gained by each index of the chirp family.
pub const CHIRP_FREQUENCY_STEP: f64 = 0.005;

/// Amplitude multipliers of the known stimulus files, looked up by file name.
pub const FILE_MULTIPLIERS: [(&str, f64); 6] = [
    ("Ramp_0p5.csv", 30.0),
    ("Step_0p2.csv", 30.0),
    ("chirp_05.csv", 10.0),
    ("chirp_damp.csv", 15.0),
    ("chirp_damp_8k.csv", 15.0),
    ("he_1i_1.csv", 20.0),
];

/// The built-in waveform families.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum StimKind {
    /// Linear increase from zero to the amplitude.
    Ramp,
    /// Constant amplitude between 10% and 90% of the duration, zero elsewhere.
    Step,
    /// Sine of constant amplitude whose frequency increases linearly from zero.
    Chirp,
    /// Gaussian white noise whose standard deviation is the amplitude.
    Noise,
}

impl StimKind {
    pub fn all() -> [StimKind; 4] {
        [StimKind::Ramp, StimKind::Step, StimKind::Chirp, StimKind::Noise]
    }

    pub fn name(&self) -> &'static str {
        match self {
            StimKind::Ramp => "ramp",
            StimKind::Step => "step",
            StimKind::Chirp => "chirp",
            StimKind::Noise => "noise",
        }
    }

    /// Sample the waveform of the given index over `num_steps` steps of `dt` ms.
    pub fn waveform(&self, index: usize, dt: f64, num_steps: usize) -> Result<Vec<f64>, SweepError> {
        let level = index.checked_add(1).ok_or_else(|| {
            SweepError::InvalidStimulus(format!("stimulus index {} is too large", index))
        })? as f64;
        let amplitude = AMPLITUDE_STEP * level;
        let duration = dt * num_steps as f64;
        let values = match self {
            StimKind::Ramp => (0..num_steps)
                .map(|i| amplitude * i as f64 / num_steps as f64)
                .collect(),
            StimKind::Step => (0..num_steps)
                .map(|i| {
                    if 10 * i >= num_steps && 10 * i < 9 * num_steps {
                        amplitude
                    } else {
                        0.0
                    }
                })
                .collect(),
            StimKind::Chirp => {
                let f1 = CHIRP_FREQUENCY_STEP * level;
                (0..num_steps)
                    .map(|i| {
                        let t = i as f64 * dt;
                        amplitude * (PI * f1 * t * t / duration).sin()
                    })
                    .collect()
            }
            StimKind::Noise => {
                let mut rng = ChaCha8Rng::seed_from_u64(index as u64);
                let normal = Normal::new(0.0, amplitude).map_err(|e| {
                    SweepError::InvalidStimulus(format!(
                        "noise of standard deviation {}: {}",
                        amplitude, e
                    ))
                })?;
                (0..num_steps).map(|_| normal.sample(&mut rng)).collect()
            }
        };
        Ok(values)
    }
}

impl fmt::Display for StimKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for StimKind {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StimKind::all()
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                SweepError::InvalidStimulus(format!(
                    "unknown stimulus type {} (choose one of: {})",
                    s,
                    StimKind::all().iter().join(", ")
                ))
            })
    }
}

/// Where the stimulus waveform comes from.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum StimSource {
    /// A built-in family and index.
    Builtin { kind: StimKind, index: usize },
    /// A text file with one value per sample, scaled by a multiplier. Known files have a
    /// default multiplier, see [`FILE_MULTIPLIERS`].
    File { path: PathBuf, multiplier: Option<f64> },
}

impl StimSource {
    /// Returns a short label describing the stimulus, e.g., `ramp_03`.
    pub fn label(&self) -> String {
        match self {
            StimSource::Builtin { kind, index } => format!("{}_{:02}", kind, index),
            StimSource::File { path, .. } => path
                .file_stem()
                .map(|stem| stem.to_string_lossy().to_string())
                .unwrap_or_default(),
        }
    }
}

/// Returns the amplitude multiplier of a known stimulus file.
pub fn file_multiplier(path: &Path) -> Option<f64> {
    let name = path.file_name()?.to_str()?;
    FILE_MULTIPLIERS
        .iter()
        .find(|(file, _)| *file == name)
        .map(|(_, multiplier)| *multiplier)
}

/// A waveform sampled every `dt` ms.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Stimulus {
    values: Vec<f64>,
    dt: f64,
}

impl Stimulus {
    pub fn new(values: Vec<f64>, dt: f64) -> Self {
        Stimulus { values, dt }
    }

    /// Build the stimulus of a source.
    ///
    /// Built-in waveforms last `duration` ms; file waveforms keep their own length.
    /// `silence` ms of zeros are added before and after the waveform.
    pub fn build(source: &StimSource, dt: f64, duration: f64, silence: f64) -> Result<Self, SweepError> {
        let values = match source {
            StimSource::Builtin { kind, index } => {
                let num_steps = (duration / dt).round() as usize;
                kind.waveform(*index, dt, num_steps)?
            }
            StimSource::File { path, multiplier } => {
                let multiplier = multiplier.or_else(|| file_multiplier(path)).ok_or_else(|| {
                    SweepError::InvalidStimulus(format!(
                        "no known multiplier for {}, pass --stim-multiplier",
                        path.display()
                    ))
                })?;
                read_waveform(path)?
                    .into_iter()
                    .map(|value| value * multiplier)
                    .collect()
            }
        };

        let stimulus = Stimulus { values, dt }.with_silence(silence);
        log::debug!(
            "Stimulus {}: {} samples ({} ms)",
            source.label(),
            stimulus.len(),
            stimulus.duration()
        );
        Ok(stimulus)
    }

    /// Returns the stimulus with `silence` ms of zeros before and after it.
    pub fn with_silence(self, silence: f64) -> Self {
        let pad = (silence / self.dt).round() as usize;
        if pad == 0 {
            return self;
        }
        let mut values = vec![0.0; pad];
        values.extend(self.values);
        values.extend(std::iter::repeat(0.0).take(pad));
        Stimulus { values, dt: self.dt }
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the duration of the stimulus (ms).
    pub fn duration(&self) -> f64 {
        self.dt * self.values.len() as f64
    }

    /// Multiply every sample by a constant.
    pub fn scaled(self, multiplier: f64) -> Self {
        Stimulus {
            values: self.values.into_iter().map(|v| v * multiplier).collect(),
            dt: self.dt,
        }
    }
}

/// Read a waveform from a text file of whitespace or comma separated values.
pub fn read_waveform(path: &Path) -> Result<Vec<f64>, SweepError> {
    let content = fs::read_to_string(path).map_err(|e| {
        SweepError::InvalidStimulus(format!("cannot read stimulus file {}: {}", path.display(), e))
    })?;
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(|line| line.split(|c: char| c.is_whitespace() || c == ','))
        .filter(|token| !token.is_empty())
        .map(|token| {
            token.parse::<f64>().map_err(|e| {
                SweepError::InvalidStimulus(format!("{}: {}: {}", path.display(), token, e))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        for kind in StimKind::all() {
            assert_eq!(kind.name().parse::<StimKind>().unwrap(), kind);
        }
        assert!(matches!("square".parse::<StimKind>(), Err(SweepError::InvalidStimulus(_))));
    }

    #[test]
    fn test_builtin_waveforms() {
        let ramp = StimKind::Ramp.waveform(4, 0.5, 100).unwrap();
        assert_eq!(ramp.len(), 100);
        assert_eq!(ramp[0], 0.0);
        assert!(ramp.windows(2).all(|w| w[1] > w[0]));
        assert!(*ramp.last().unwrap() < 0.5);

        let step = StimKind::Step.waveform(0, 0.1, 100).unwrap();
        assert_eq!(step[9], 0.0);
        assert_eq!(step[10], 0.1);
        assert_eq!(step[89], 0.1);
        assert_eq!(step[90], 0.0);

        let chirp = StimKind::Chirp.waveform(2, 0.02, 1000).unwrap();
        assert!(chirp.iter().all(|v| v.abs() <= 0.3 + 1e-12));

        let noise_1 = StimKind::Noise.waveform(3, 0.02, 50).unwrap();
        let noise_2 = StimKind::Noise.waveform(3, 0.02, 50).unwrap();
        assert_eq!(noise_1, noise_2);
        assert_ne!(noise_1, StimKind::Noise.waveform(4, 0.02, 50).unwrap());
    }

    #[test]
    fn test_index_out_of_range() {
        for kind in StimKind::all() {
            assert!(matches!(
                kind.waveform(usize::MAX, 0.02, 10),
                Err(SweepError::InvalidStimulus(_))
            ));
        }
        let source = StimSource::Builtin {
            kind: StimKind::Noise,
            index: usize::MAX,
        };
        assert!(matches!(
            Stimulus::build(&source, 0.02, 1.0, 0.0),
            Err(SweepError::InvalidStimulus(_))
        ));
    }

    #[test]
    fn test_build_with_silence() {
        let source = StimSource::Builtin {
            kind: StimKind::Step,
            index: 0,
        };
        let stimulus = Stimulus::build(&source, 0.5, 10.0, 2.0).unwrap();
        assert_eq!(stimulus.len(), 4 + 20 + 4);
        assert!(stimulus.values()[..4].iter().all(|v| *v == 0.0));
        assert!(stimulus.values()[24..].iter().all(|v| *v == 0.0));
        assert_eq!(stimulus.duration(), 14.0);
        assert_eq!(source.label(), "step_00");
    }

    #[test]
    fn test_file_stimulus() {
        let dir = tempfile::tempdir().unwrap();

        let known = dir.path().join("chirp_05.csv");
        fs::write(&known, "0.0\n0.5\n-1.0\n").unwrap();
        let source = StimSource::File {
            path: known.clone(),
            multiplier: None,
        };
        let stimulus = Stimulus::build(&source, 0.02, 0.0, 0.0).unwrap();
        assert_eq!(stimulus.values(), &[0.0, 5.0, -10.0]);

        let source = StimSource::File {
            path: known,
            multiplier: Some(2.0),
        };
        let stimulus = Stimulus::build(&source, 0.02, 0.0, 0.0).unwrap();
        assert_eq!(stimulus.values(), &[0.0, 1.0, -2.0]);

        let unknown = dir.path().join("mystery.csv");
        fs::write(&unknown, "1 2 3\n").unwrap();
        let source = StimSource::File {
            path: unknown,
            multiplier: None,
        };
        assert!(matches!(
            Stimulus::build(&source, 0.02, 0.0, 0.0),
            Err(SweepError::InvalidStimulus(_))
        ));
    }
}
