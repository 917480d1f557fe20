//! Catalogue of the neuron models and construction of their topologies.
//!
//! Each [`ModelKind`] carries its own parameter specification and turns a parameter set into
//! a [`Topology`], an engine-agnostic description of the sections, inserted mechanisms,
//! stimulus target and recording probes of the cell.
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::error::SweepError;
use crate::params::ParameterSpec;

/// Length of a section left at the engine defaults (µm).
pub const DEFAULT_SECTION_LENGTH: f64 = 100.0;
/// Diameter of a section left at the engine defaults (µm).
pub const DEFAULT_SECTION_DIAM: f64 = 500.0;
/// Soma diameter of the multi-compartment models (µm), from Fiala and Harris (1999), table 1.1.
pub const DEFAULT_SOMA_DIAM: f64 = 21.0;
/// Lower bound of the Hodgkin-Huxley ranges, relative to the default value.
pub const RANGE_LOW_FACTOR: f64 = 0.5;
/// Upper bound of the Hodgkin-Huxley ranges, relative to the default value.
pub const RANGE_HIGH_FACTOR: f64 = 2.0;

/// A density mechanism inserted in a section, with its parameter assignments.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Mechanism {
    /// The mechanism name, e.g., `na` or `pas`.
    pub name: String,
    /// The (parameter, value) pairs, e.g., `("gbar", 500.0)`.
    pub params: Vec<(String, f64)>,
}

impl Mechanism {
    pub fn new(name: &str, params: &[(&str, f64)]) -> Self {
        Mechanism {
            name: name.to_string(),
            params: params.iter().map(|(p, v)| (p.to_string(), *v)).collect(),
        }
    }
}

/// Where the 0 end of a section is attached on its parent.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub parent: String,
    pub position: f64,
}

/// A cylindrical compartment.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Section {
    pub name: String,
    /// Length (µm).
    pub length: f64,
    /// Diameter (µm).
    pub diam: f64,
    /// Specific membrane capacitance (µF/cm²), engine default if `None`.
    pub cm: Option<f64>,
    pub mechanisms: Vec<Mechanism>,
    pub parent: Option<Attachment>,
}

impl Section {
    pub fn new(name: &str, length: f64, diam: f64) -> Self {
        Section {
            name: name.to_string(),
            length,
            diam,
            cm: None,
            mechanisms: vec![],
            parent: None,
        }
    }

    pub fn has_mechanism(&self, name: &str) -> bool {
        self.mechanisms.iter().any(|mechanism| mechanism.name == name)
    }
}

/// An artificial cell implemented as a point process located on a host section.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PointProcess {
    /// The mechanism name, e.g., `Izhi2003a`.
    pub kind: String,
    pub section: String,
    pub position: f64,
    pub params: Vec<(String, f64)>,
}

/// The variable driven by the stimulus waveform.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum StimTarget {
    /// The amplitude of a current clamp placed on a section.
    IClamp { section: String, position: f64 },
    /// A variable of the point process, e.g., its input current.
    PointProcess { variable: String },
}

/// The variable sampled by a recording probe.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub enum ProbeTarget {
    Section {
        section: String,
        position: f64,
        variable: String,
    },
    PointProcess {
        variable: String,
    },
}

/// A named recording of one variable at every time step.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Probe {
    pub name: String,
    pub target: ProbeTarget,
}

impl Probe {
    pub fn section(name: &str, section: &str, position: f64, variable: &str) -> Self {
        Probe {
            name: name.to_string(),
            target: ProbeTarget::Section {
                section: section.to_string(),
                position,
                variable: variable.to_string(),
            },
        }
    }

    pub fn point_process(name: &str, variable: &str) -> Self {
        Probe {
            name: name.to_string(),
            target: ProbeTarget::PointProcess {
                variable: variable.to_string(),
            },
        }
    }
}

/// Engine-agnostic description of a cell ready to be simulated.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Topology {
    pub sections: Vec<Section>,
    pub point_process: Option<PointProcess>,
    pub stim: StimTarget,
    pub probes: Vec<Probe>,
}

impl Topology {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|section| section.name == name)
    }

    pub fn probe_names(&self) -> Vec<&str> {
        self.probes.iter().map(|probe| probe.name.as_str()).collect()
    }
}

/// Geometry of the soma and dendrites of the multi-compartment models.
#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
pub struct BallStickGeometry {
    /// Soma diameter and length (µm).
    pub soma_diam: f64,
    /// Dendrite diameter (µm).
    pub dend_diam: f64,
    /// Apical dendrite length (µm); basal dendrites are a quarter of it.
    pub dend_length: f64,
}

impl Default for BallStickGeometry {
    fn default() -> Self {
        BallStickGeometry {
            soma_diam: DEFAULT_SOMA_DIAM,
            dend_diam: DEFAULT_SOMA_DIAM / 10.0,
            dend_length: DEFAULT_SOMA_DIAM * 10.0,
        }
    }
}

/// Channel densities of one section. Calcium and leak channels are only inserted if given.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct ChannelDensities {
    pub gnabar: f64,
    pub gkbar: f64,
    pub gcabar: Option<f64>,
    pub gl: Option<f64>,
}

impl ChannelDensities {
    fn mechanisms(&self) -> Vec<Mechanism> {
        let mut mechanisms = vec![
            Mechanism::new("na", &[("gbar", self.gnabar)]),
            Mechanism::new("kv", &[("gbar", self.gkbar)]),
        ];
        if let Some(gcabar) = self.gcabar {
            mechanisms.push(Mechanism::new("ca", &[("gbar", gcabar)]));
        }
        if let Some(gl) = self.gl {
            mechanisms.push(Mechanism::new("pas", &[("g", gl)]));
        }
        mechanisms
    }
}

/// Returns a section with the given geometry and channels.
pub fn active_section(name: &str, length: f64, diam: f64, channels: &ChannelDensities) -> Section {
    Section {
        mechanisms: channels.mechanisms(),
        ..Section::new(name, length, diam)
    }
}

/// Returns the soma of a ball-and-stick cell, a cylinder as long as it is wide.
pub fn soma(geometry: &BallStickGeometry, channels: &ChannelDensities) -> Section {
    active_section("soma", geometry.soma_diam, geometry.soma_diam, channels)
}

/// Returns a dendrite attached to `parent` at `position`.
pub fn dendrite(
    name: &str,
    length: f64,
    geometry: &BallStickGeometry,
    channels: &ChannelDensities,
    parent: &str,
    position: f64,
) -> Section {
    Section {
        parent: Some(Attachment {
            parent: parent.to_string(),
            position,
        }),
        ..active_section(name, length, geometry.dend_diam, channels)
    }
}

/// Set the same specific capacitance on every section.
pub fn set_cm(sections: &mut [Section], cm: f64) {
    sections.iter_mut().for_each(|section| section.cm = Some(cm));
}

/// Probes of the somatic voltage and membrane currents.
pub fn somatic_probes(section: &str) -> Vec<Probe> {
    vec![
        Probe::section("v", section, 0.5, "v"),
        Probe::section("ina", section, 0.5, "ina"),
        Probe::section("ik", section, 0.5, "ik"),
        Probe::section("ica", section, 0.5, "ica"),
        Probe::section("i_leak", section, 0.5, "i_pas"),
        Probe::section("i_cap", section, 0.5, "i_cap"),
    ]
}

/// The neuron model variants.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    /// Izhikevich (2003) point neuron.
    Izhi,
    /// Single-compartment Hodgkin-Huxley-style cell.
    HhPoint5Param,
    /// Soma with an active dendrite.
    HhBallStick7Param,
    /// Soma with an active dendrite carrying calcium and leak channels.
    HhBallStick9Param,
    /// Soma with an apical and two basal dendrites.
    HhTwoDend13Param,
}

const IZHI_PARAMS: [(&str, f64, f64, f64); 4] = [
    ("a", 0.02, 0.01, 0.1),
    ("b", 0.2, 0.1, 0.4),
    ("c", -65.0, -80.0, -50.0),
    ("d", 2.0, 0.5, 10.0),
];

const HH_POINT_5PARAM: [(&str, f64); 5] = [
    ("gnabar", 500.0),
    ("gkbar", 10.0),
    ("gcabar", 1.5),
    ("gl", 0.0005),
    ("cm", 0.5),
];

const HH_BALL_STICK_7PARAM: [(&str, f64); 7] = [
    ("gnabar_soma", 500.0),
    ("gnabar_dend", 500.0),
    ("gkbar_soma", 10.0),
    ("gkbar_dend", 10.0),
    ("gcabar_soma", 1.5),
    ("gl_soma", 0.0005),
    ("cm", 0.5),
];

const HH_BALL_STICK_9PARAM: [(&str, f64); 9] = [
    ("gnabar_soma", 500.0),
    ("gnabar_dend", 500.0),
    ("gkbar_soma", 10.0),
    ("gkbar_dend", 10.0),
    ("gcabar_soma", 1.5),
    ("gcabar_dend", 1.5),
    ("gl_soma", 0.0005),
    ("gl_dend", 0.0005),
    ("cm", 0.5),
];

const HH_TWO_DEND_13PARAM: [(&str, f64); 13] = [
    ("gnabar_soma", 500.0),
    ("gnabar_apic", 500.0),
    ("gnabar_basal", 500.0),
    ("gkbar_soma", 10.0),
    ("gkbar_apic", 10.0),
    ("gkbar_basal", 10.0),
    ("gcabar_soma", 1.5),
    ("gcabar_apic", 1.5),
    ("gcabar_basal", 1.5),
    ("gl_soma", 0.0005),
    ("gl_apic", 0.0005),
    ("gl_basal", 0.0005),
    ("cm", 0.5),
];

impl ModelKind {
    pub fn all() -> [ModelKind; 5] {
        [
            ModelKind::Izhi,
            ModelKind::HhPoint5Param,
            ModelKind::HhBallStick7Param,
            ModelKind::HhBallStick9Param,
            ModelKind::HhTwoDend13Param,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::Izhi => "izhi",
            ModelKind::HhPoint5Param => "hh_point_5param",
            ModelKind::HhBallStick7Param => "hh_ball_stick_7param",
            ModelKind::HhBallStick9Param => "hh_ball_stick_9param",
            ModelKind::HhTwoDend13Param => "hh_two_dend_13param",
        }
    }

    /// Returns the (name, default) pairs of the Hodgkin-Huxley variants.
    fn hh_defaults(&self) -> &'static [(&'static str, f64)] {
        match self {
            ModelKind::Izhi => &[],
            ModelKind::HhPoint5Param => &HH_POINT_5PARAM,
            ModelKind::HhBallStick7Param => &HH_BALL_STICK_7PARAM,
            ModelKind::HhBallStick9Param => &HH_BALL_STICK_9PARAM,
            ModelKind::HhTwoDend13Param => &HH_TWO_DEND_13PARAM,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            ModelKind::Izhi => IZHI_PARAMS.len(),
            _ => self.hh_defaults().len(),
        }
    }

    pub fn param_names(&self) -> Vec<&'static str> {
        match self {
            ModelKind::Izhi => IZHI_PARAMS.iter().map(|(name, ..)| *name).collect(),
            _ => self.hh_defaults().iter().map(|(name, _)| *name).collect(),
        }
    }

    pub fn default_params(&self) -> Vec<f64> {
        match self {
            ModelKind::Izhi => IZHI_PARAMS.iter().map(|(_, default, ..)| *default).collect(),
            _ => self.hh_defaults().iter().map(|(_, default)| *default).collect(),
        }
    }

    /// Returns the parameter specification of the model.
    /// The Hodgkin-Huxley variants span half to twice their default values.
    pub fn spec(&self) -> Result<ParameterSpec, SweepError> {
        match self {
            ModelKind::Izhi => {
                ParameterSpec::build(IZHI_PARAMS.iter().map(|&(name, _, min, max)| (name, min, max)))
            }
            _ => ParameterSpec::build(self.hh_defaults().iter().map(|&(name, default)| {
                (name, RANGE_LOW_FACTOR * default, RANGE_HIGH_FACTOR * default)
            })),
        }
    }

    /// Build the topology of the model for a parameter set, with the default geometry.
    pub fn build_topology(&self, params: &[f64]) -> Result<Topology, SweepError> {
        self.build_topology_with(params, &BallStickGeometry::default())
    }

    /// Build the topology of the model for a parameter set and a dendritic geometry.
    /// Returns an error if the parameter set does not match the model.
    pub fn build_topology_with(
        &self,
        params: &[f64],
        geometry: &BallStickGeometry,
    ) -> Result<Topology, SweepError> {
        if params.len() != self.dim() {
            return Err(SweepError::InvalidParameter(format!(
                "model {} expects {} parameters ({}), got {}",
                self.name(),
                self.dim(),
                self.param_names().iter().join(", "),
                params.len()
            )));
        }

        let topology = match *self {
            ModelKind::Izhi => izhi_topology(params),
            ModelKind::HhPoint5Param => hh_point_topology(params),
            ModelKind::HhBallStick7Param => ball_stick_topology(params, geometry, false),
            ModelKind::HhBallStick9Param => ball_stick_topology(params, geometry, true),
            ModelKind::HhTwoDend13Param => two_dend_topology(params, geometry),
        };
        Ok(topology)
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for ModelKind {
    type Err = SweepError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::all()
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                SweepError::InvalidModel(format!(
                    "{} (choose one of: {})",
                    s,
                    ModelKind::all().iter().join(", ")
                ))
            })
    }
}

fn izhi_topology(params: &[f64]) -> Topology {
    let host = Section::new("dummy", DEFAULT_SECTION_LENGTH, DEFAULT_SECTION_DIAM);
    let point_process = PointProcess {
        kind: "Izhi2003a".to_string(),
        section: host.name.clone(),
        position: 0.5,
        params: IZHI_PARAMS
            .iter()
            .zip(params.iter())
            .map(|((name, ..), value)| (name.to_string(), *value))
            .collect(),
    };

    Topology {
        sections: vec![host],
        point_process: Some(point_process),
        stim: StimTarget::PointProcess {
            variable: "Iin".to_string(),
        },
        // V is the model variable, not the membrane potential of the host section.
        probes: vec![Probe::point_process("v", "V")],
    }
}

fn somatic_clamp() -> StimTarget {
    StimTarget::IClamp {
        section: "soma".to_string(),
        position: 0.5,
    }
}

fn hh_point_topology(params: &[f64]) -> Topology {
    let channels = ChannelDensities {
        gnabar: params[0],
        gkbar: params[1],
        gcabar: Some(params[2]),
        gl: Some(params[3]),
    };
    let mut sections = vec![active_section(
        "soma",
        DEFAULT_SECTION_LENGTH,
        DEFAULT_SECTION_DIAM,
        &channels,
    )];
    set_cm(&mut sections, params[4]);

    Topology {
        sections,
        point_process: None,
        stim: somatic_clamp(),
        probes: somatic_probes("soma"),
    }
}

fn ball_stick_topology(params: &[f64], geometry: &BallStickGeometry, dend_passive: bool) -> Topology {
    // 7 params: gnabar_soma, gnabar_dend, gkbar_soma, gkbar_dend, gcabar_soma, gl_soma, cm
    // 9 params: ... gcabar_soma, gcabar_dend, gl_soma, gl_dend, cm
    let (soma_channels, dend_channels) = if dend_passive {
        (
            ChannelDensities {
                gnabar: params[0],
                gkbar: params[2],
                gcabar: Some(params[4]),
                gl: Some(params[6]),
            },
            ChannelDensities {
                gnabar: params[1],
                gkbar: params[3],
                gcabar: Some(params[5]),
                gl: Some(params[7]),
            },
        )
    } else {
        (
            ChannelDensities {
                gnabar: params[0],
                gkbar: params[2],
                gcabar: Some(params[4]),
                gl: Some(params[5]),
            },
            ChannelDensities {
                gnabar: params[1],
                gkbar: params[3],
                gcabar: None,
                gl: None,
            },
        )
    };
    let cm = params[params.len() - 1];

    let mut sections = vec![
        soma(geometry, &soma_channels),
        dendrite("dend", geometry.dend_length, geometry, &dend_channels, "soma", 1.0),
    ];
    set_cm(&mut sections, cm);

    let mut probes = somatic_probes("soma");
    probes.push(Probe::section("v_dend", "dend", 1.0, "v"));

    Topology {
        sections,
        point_process: None,
        stim: somatic_clamp(),
        probes,
    }
}

fn two_dend_topology(params: &[f64], geometry: &BallStickGeometry) -> Topology {
    let channels = |offset: usize| ChannelDensities {
        gnabar: params[offset],
        gkbar: params[3 + offset],
        gcabar: Some(params[6 + offset]),
        gl: Some(params[9 + offset]),
    };
    let basal_length = geometry.dend_length / 4.0;

    let mut sections = vec![
        soma(geometry, &channels(0)),
        dendrite("apic", geometry.dend_length, geometry, &channels(1), "soma", 1.0),
    ];
    sections.extend(
        (0..2).map(|i| dendrite(&format!("basal_{}", i), basal_length, geometry, &channels(2), "soma", 0.0)),
    );
    set_cm(&mut sections, params[12]);

    let mut probes = somatic_probes("soma");
    probes.push(Probe::section("v_dend", "apic", 1.0, "v"));

    Topology {
        sections,
        point_process: None,
        stim: somatic_clamp(),
        probes,
    }
}
