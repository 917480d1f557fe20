//! Simulation engine backed by the NEURON `nrniv` executable.
//!
//! Every run renders the topology as a hoc program in a scratch directory, executes it with
//! `nrniv`, and reads the recorded vectors back from a text file written by the program.
//! Custom mechanisms (`na`, `kv`, `ca`, `Izhi2003a`) must be compiled with `nrnivmodl` in the
//! mechanism directory, which is used as the working directory of the process.
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use itertools::Itertools;

use crate::error::SweepError;
use crate::model::{ProbeTarget, StimTarget, Topology};
use crate::simulator::{Recording, SimulationContext, Simulator};

/// Name of the stimulus file in the scratch directory.
pub const STIM_FILE: &str = "stim.dat";
/// Name of the recording file in the scratch directory.
pub const RECORDING_FILE: &str = "rec.dat";
/// Name of the hoc program in the scratch directory.
pub const SCRIPT_FILE: &str = "run.hoc";

/// A [`Simulator`] running each simulation in a fresh `nrniv` process.
#[derive(Debug, Clone)]
pub struct NrnivEngine {
    executable: PathBuf,
    mod_dir: Option<PathBuf>,
}

impl NrnivEngine {
    pub fn new<P: AsRef<Path>>(executable: P, mod_dir: Option<PathBuf>) -> Self {
        NrnivEngine {
            executable: executable.as_ref().to_path_buf(),
            mod_dir,
        }
    }
}

impl Simulator for NrnivEngine {
    fn run(
        &mut self,
        ctx: &SimulationContext,
        topology: &Topology,
        stim: &[f64],
    ) -> Result<Recording, SweepError> {
        let start = Instant::now();
        let scratch = tempfile::Builder::new().prefix("rusty_sweep").tempdir()?;
        let stim_path = scratch.path().join(STIM_FILE);
        let recording_path = scratch.path().join(RECORDING_FILE);
        let script_path = scratch.path().join(SCRIPT_FILE);

        fs::write(&stim_path, stim.iter().map(|v| v.to_string()).join("\n") + "\n")?;
        fs::write(&script_path, render_hoc(ctx, topology, &stim_path, &recording_path)?)?;

        log::debug!(
            "Running simulation for {} ms with dt = {} ({} total timesteps)",
            ctx.tstop(),
            ctx.dt(),
            ctx.num_timepoints()
        );

        let mut command = Command::new(&self.executable);
        command.arg("-nobanner").arg("-notatty").arg(&script_path);
        if let Some(mod_dir) = &self.mod_dir {
            command.current_dir(mod_dir);
        }
        let output = command.output().map_err(|e| {
            SweepError::SimulationError(format!(
                "cannot run {}: {}",
                self.executable.display(),
                e
            ))
        })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(SweepError::SimulationError(format!(
                "{} exited with {}: {}",
                self.executable.display(),
                output.status,
                stderr.trim()
            )));
        }

        let content = fs::read_to_string(&recording_path).map_err(|e| {
            SweepError::SimulationError(format!(
                "no recording produced ({}): {}",
                e,
                stderr.trim()
            ))
        })?;
        let recording = parse_recording(&content)?;
        if let Some(missing) = topology
            .probes
            .iter()
            .find(|probe| recording.get(&probe.name).is_none())
        {
            return Err(SweepError::SimulationError(format!(
                "probe {} missing from the recording: {}",
                missing.name,
                stderr.trim()
            )));
        }

        log::debug!("Time to simulate: {:?}", start.elapsed());
        Ok(recording)
    }
}

fn quoted(path: &Path) -> Result<String, SweepError> {
    let path = path.display().to_string();
    if path.contains('"') {
        return Err(SweepError::SimulationError(format!(
            "path {} cannot be quoted in hoc",
            path
        )));
    }
    Ok(format!("\"{}\"", path))
}

/// Render the hoc program simulating a topology.
///
/// The program reads the stimulus from `stim_path` and writes one block per probe to
/// `recording_path`, each block being a `# name` line followed by one value per line.
pub fn render_hoc(
    ctx: &SimulationContext,
    topology: &Topology,
    stim_path: &Path,
    recording_path: &Path,
) -> Result<String, SweepError> {
    let mut hoc = String::new();
    let mut line = |s: String| {
        hoc.push_str(&s);
        hoc.push('\n');
    };

    line("load_file(\"stdrun.hoc\")".to_string());
    line(format!("celsius = {}", ctx.celsius()));

    // Morphology and mechanisms
    line(format!(
        "create {}",
        topology.sections.iter().map(|section| section.name.as_str()).join(", ")
    ));
    for section in topology.sections.iter() {
        let mut body = format!("L = {} diam = {}", section.length, section.diam);
        if let Some(cm) = section.cm {
            body.push_str(&format!(" cm = {}", cm));
        }
        for mechanism in section.mechanisms.iter() {
            body.push_str(&format!(" insert {}", mechanism.name));
            for (param, value) in mechanism.params.iter() {
                body.push_str(&format!(" {}_{} = {}", param, mechanism.name, value));
            }
        }
        line(format!("{} {{ {} }}", section.name, body));
    }
    for section in topology.sections.iter() {
        if let Some(attachment) = &section.parent {
            line(format!(
                "connect {}(0), {}({})",
                section.name, attachment.parent, attachment.position
            ));
        }
    }

    if let Some(cell) = &topology.point_process {
        line("objref cell".to_string());
        line(format!("{} cell = new {}({})", cell.section, cell.kind, cell.position));
        for (param, value) in cell.params.iter() {
            line(format!("cell.{} = {}", param, value));
        }
    }

    // Stimulus
    let stim_variable = match &topology.stim {
        StimTarget::IClamp { section, position } => {
            line("objref clamp".to_string());
            line(format!("{} clamp = new IClamp({})", section, position));
            line("clamp.del = 0".to_string());
            line(format!("clamp.dur = {}", ctx.tstop()));
            "clamp.amp".to_string()
        }
        StimTarget::PointProcess { variable } => {
            if topology.point_process.is_none() {
                return Err(SweepError::SimulationError(
                    "the stimulus targets a point process but the topology has none".to_string(),
                ));
            }
            format!("cell.{}", variable)
        }
    };
    line("objref stimfile, stimvec".to_string());
    line("stimfile = new File()".to_string());
    line(format!("stimfile.ropen({})", quoted(stim_path)?));
    line("stimvec = new Vector()".to_string());
    line("stimvec.scanf(stimfile)".to_string());
    line("stimfile.close()".to_string());
    line(format!("stimvec.play(&{}, {})", stim_variable, ctx.dt()));

    // Recordings
    let vectors = (0..topology.probes.len()).map(|i| format!("rec_{}", i)).collect::<Vec<_>>();
    if !vectors.is_empty() {
        line(format!("objref {}", vectors.join(", ")));
    }
    for (vector, probe) in vectors.iter().zip(topology.probes.iter()) {
        let reference = match &probe.target {
            ProbeTarget::Section {
                section,
                position,
                variable,
            } => format!("{}.{}({})", section, variable, position),
            ProbeTarget::PointProcess { variable } => format!("cell.{}", variable),
        };
        line(format!("{} = new Vector({})", vector, ctx.num_timepoints() + 1));
        line(format!("{}.record(&{})", vector, reference));
    }

    // Run
    line(format!("tstop = {}", ctx.tstop()));
    line(format!("steps_per_ms = {}", ctx.steps_per_ms()));
    line(format!("dt = {}", ctx.dt()));
    line("run()".to_string());

    // Output
    line("objref recfile".to_string());
    line("recfile = new File()".to_string());
    line(format!("recfile.wopen({})", quoted(recording_path)?));
    for (vector, probe) in vectors.iter().zip(topology.probes.iter()) {
        line(format!("recfile.printf(\"# {}\\n\")", probe.name));
        line(format!("{}.printf(recfile, \"%.17g\\n\")", vector));
    }
    line("recfile.close()".to_string());
    line("quit()".to_string());

    Ok(hoc)
}

/// Parse the recording file written by the hoc program.
pub fn parse_recording(content: &str) -> Result<Recording, SweepError> {
    let mut recording = Recording::new();
    let mut current: Option<(String, Vec<f64>)> = None;

    for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
        if let Some(name) = line.strip_prefix('#') {
            if let Some((name, values)) = current.take() {
                recording.insert(&name, values);
            }
            current = Some((name.trim().to_string(), vec![]));
            continue;
        }
        let value = line.parse::<f64>().map_err(|e| {
            SweepError::SimulationError(format!("malformed recorded value {}: {}", line, e))
        })?;
        match current.as_mut() {
            Some((_, values)) => values.push(value),
            None => {
                return Err(SweepError::SimulationError(
                    "recorded values found before any vector name".to_string(),
                ))
            }
        }
    }
    if let Some((name, values)) = current.take() {
        recording.insert(&name, values);
    }

    if recording.is_empty() {
        return Err(SweepError::SimulationError("empty recording".to_string()));
    }
    Ok(recording)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelKind;

    fn render(kind: ModelKind) -> String {
        let ctx = SimulationContext::build(0.02, 10.0).unwrap();
        let topology = kind.build_topology(&kind.default_params()).unwrap();
        render_hoc(&ctx, &topology, Path::new("/tmp/s/stim.dat"), Path::new("/tmp/s/rec.dat")).unwrap()
    }

    #[test]
    fn test_render_izhi() {
        let hoc = render(ModelKind::Izhi);
        assert!(hoc.contains("create dummy\n"));
        assert!(hoc.contains("dummy cell = new Izhi2003a(0.5)\n"));
        assert!(hoc.contains("cell.c = -65\n"));
        assert!(hoc.contains("stimvec.play(&cell.Iin, 0.02)\n"));
        assert!(hoc.contains("rec_0.record(&cell.V)\n"));
        assert!(!hoc.contains("IClamp"));
        assert!(hoc.contains("steps_per_ms = 50\n"));
        assert!(hoc.ends_with("quit()\n"));
    }

    #[test]
    fn test_render_section_body() {
        let hoc = render(ModelKind::HhPoint5Param);
        assert!(hoc.contains(
            "soma { L = 100 diam = 500 cm = 0.5 insert na gbar_na = 500 insert kv gbar_kv = 10 \
             insert ca gbar_ca = 1.5 insert pas g_pas = 0.0005 }\n"
        ));
    }

    #[test]
    fn test_render_two_dend() {
        let hoc = render(ModelKind::HhTwoDend13Param);
        assert!(hoc.contains("create soma, apic, basal_0, basal_1\n"));
        assert!(hoc.contains("insert na gbar_na = 500"));
        assert!(hoc.contains("insert pas g_pas = 0.0005"));
        assert!(hoc.contains("connect apic(0), soma(1)\n"));
        assert!(hoc.contains("connect basal_1(0), soma(0)\n"));
        assert!(hoc.contains("soma clamp = new IClamp(0.5)\n"));
        assert!(hoc.contains("clamp.dur = 10\n"));
        assert!(hoc.contains("stimvec.play(&clamp.amp, 0.02)\n"));
        assert!(hoc.contains(".record(&soma.i_pas(0.5))\n"));
        assert!(hoc.contains(".record(&apic.v(1))\n"));
        assert!(hoc.contains("recfile.printf(\"# v_dend\\n\")\n"));
    }

    #[test]
    fn test_parse_recording() {
        let recording = parse_recording("# v\n-65\n-64.5\n\n# ina\n0.1\n0.2\n0.3\n").unwrap();
        assert_eq!(recording.len(), 2);
        assert_eq!(recording.get("v").unwrap(), &[-65.0, -64.5]);
        assert_eq!(recording.get("ina").unwrap(), &[0.1, 0.2, 0.3]);
        assert_eq!(recording.names().collect::<Vec<_>>(), vec!["ina", "v"]);
    }

    #[test]
    fn test_parse_malformed_recording() {
        assert!(parse_recording("").is_err());
        assert!(parse_recording("1.0\n# v\n").is_err());
        assert!(matches!(
            parse_recording("# v\nnot-a-number\n"),
            Err(SweepError::SimulationError(_))
        ));
    }

    #[test]
    fn test_missing_executable() {
        let ctx = SimulationContext::build(0.5, 1.0).unwrap();
        let topology = ModelKind::Izhi.build_topology(&ModelKind::Izhi.default_params()).unwrap();
        let mut engine = NrnivEngine::new("/nonexistent/nrniv", None);
        assert!(matches!(
            engine.run(&ctx, &topology, &[0.0, 0.0]),
            Err(SweepError::SimulationError(_))
        ));
    }
}
