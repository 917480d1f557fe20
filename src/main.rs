use std::path::PathBuf;

use clap::Parser;
use log::LevelFilter;
use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;

use rusty_sweep::driver::{
    check_models, check_output_action, check_store, sampling_rng, save_outcome, select_samples,
    store_layout, SampleSource, Sweep,
};
use rusty_sweep::error::SweepError;
use rusty_sweep::model::ModelKind;
use rusty_sweep::nrniv::NrnivEngine;
use rusty_sweep::params::SampleBatch;
use rusty_sweep::partition::ExecutionMode;
use rusty_sweep::simulator::SimulationContext;
use rusty_sweep::stimulus::{StimSource, Stimulus};
use rusty_sweep::store::TraceStore;
use rusty_sweep::DEFAULT_NUM_SAMPLES;

#[derive(Parser, Debug)]
#[command(about = "Simulate neuron models over sampled parameters and store their voltage traces")]
struct Args {
    /// The model, one of: izhi, hh_point_5param, hh_ball_stick_7param, hh_ball_stick_9param, hh_two_dend_13param
    #[arg(long, default_value = "izhi")]
    model: String,
    /// The trace store to save to. Must exist, unless --create is given
    #[arg(long)]
    outfile: Option<PathBuf>,
    /// Create the trace store, store the stimulus and parameter bounds, and exit
    #[arg(long)]
    create: bool,
    /// Create the parameter file (--param-file) with --num random parameter sets, and exit
    #[arg(long)]
    create_params: bool,
    /// Print the voltage traces as (time, value) rows on stdout
    #[arg(long)]
    plot_v: bool,
    /// Print the stimulus as (time, value) rows on stdout
    #[arg(long)]
    plot_stim: bool,
    /// Run even if nothing is plotted or saved
    #[arg(long)]
    force: bool,
    /// The stop time (ms), excluding silence
    #[arg(long, default_value = "160")]
    tstop: f64,
    /// The integration step (ms)
    #[arg(long, default_value = "0.02")]
    dt: f64,
    /// The amount of pre/post-stimulus silence (ms)
    #[arg(long, default_value = "0")]
    silence: f64,
    /// Explicit values of a single parameter set
    #[arg(long, num_args = 1.., allow_negative_numbers = true)]
    params: Option<Vec<f64>>,
    /// The number of random parameter sets. This is the total number over all workers
    #[arg(long)]
    num: Option<usize>,
    /// A text file with one parameter set per line
    #[arg(long)]
    param_file: Option<PathBuf>,
    /// The seed used for parameter sampling
    #[arg(long)]
    seed: Option<u64>,
    /// The built-in stimulus family: ramp, step, chirp or noise
    #[arg(long, default_value = "ramp")]
    stim_type: String,
    /// The index within the stimulus family
    #[arg(long, visible_alias = "stim-i", default_value = "0")]
    stim_idx: usize,
    /// A text file with the stimulus waveform, overrides --stim-type and --stim-idx
    #[arg(long)]
    stim_file: Option<PathBuf>,
    /// The amplitude multiplier of the stimulus
    #[arg(long)]
    stim_multiplier: Option<f64>,
    /// The rank of this worker, required when there is more than one worker
    #[arg(long, env = "RSWEEP_RANK")]
    rank: Option<usize>,
    /// The total number of workers
    #[arg(long, env = "RSWEEP_WORKERS")]
    workers: Option<usize>,
    /// The NEURON executable
    #[arg(long, default_value = "nrniv")]
    nrniv: PathBuf,
    /// The directory where the mechanisms were compiled with nrnivmodl
    #[arg(long)]
    mod_dir: Option<PathBuf>,
    /// Simulate every model at its default parameters and report the ones that fail
    #[arg(long)]
    check_models: bool,
    /// Save the list of failed samples as JSON
    #[arg(long)]
    failure_report: Option<PathBuf>,
    /// The log level: off, error, warn, info, debug or trace
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Also write the logs to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn init_logging(args: &Args) -> Result<(), SweepError> {
    let pattern = "{d(%Y-%m-%d %H:%M:%S)} {l} - {m}{n}";
    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(pattern)))
        .build();

    let mut config = Config::builder().appender(Appender::builder().build("stderr", Box::new(stderr)));
    let mut root = Root::builder().appender("stderr");
    if let Some(log_file) = &args.log_file {
        let logfile = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(pattern)))
            .build(log_file)
            .map_err(|e| SweepError::IOError(e.to_string()))?;
        config = config.appender(Appender::builder().build("logfile", Box::new(logfile)));
        root = root.appender("logfile");
    }

    let level = args
        .log_level
        .parse::<LevelFilter>()
        .map_err(|_| SweepError::InvalidParameter(format!("unknown log level {}", args.log_level)))?;
    let config = config
        .build(root.build(level))
        .map_err(|e| SweepError::IOError(e.to_string()))?;
    log4rs::init_config(config).map_err(|e| SweepError::IOError(e.to_string()))?;
    Ok(())
}

fn stim_source(args: &Args) -> Result<StimSource, SweepError> {
    match &args.stim_file {
        Some(path) => Ok(StimSource::File {
            path: path.clone(),
            multiplier: args.stim_multiplier,
        }),
        None => Ok(StimSource::Builtin {
            kind: args.stim_type.parse()?,
            index: args.stim_idx,
        }),
    }
}

fn print_table(label: &str, values: &[f64], dt: f64) {
    println!("# {}", label);
    for (i, value) in values.iter().enumerate() {
        println!("{}\t{}", i as f64 * dt, value);
    }
}

fn run(args: &Args) -> Result<(), SweepError> {
    let model: ModelKind = args.model.parse()?;
    let spec = model.spec()?;
    let ctx = SimulationContext::build(args.dt, args.tstop + 2.0 * args.silence)?;
    let stimulus = Stimulus::build(&stim_source(args)?, args.dt, args.tstop, args.silence)?;
    let mode = ExecutionMode::build(args.rank, args.workers)?;
    let mut engine = NrnivEngine::new(&args.nrniv, args.mod_dir.clone());

    if args.check_models {
        let problems = check_models(&mut engine, &ctx, stimulus.values());
        for (model, e) in problems.iter() {
            log::error!("Model {} failed: {}", model, e);
        }
        return match problems.len() {
            0 => Ok(()),
            n => Err(SweepError::FailedSamples(n)),
        };
    }

    if args.create {
        let outfile = args.outfile.as_ref().ok_or_else(|| {
            SweepError::InvalidParameter("--create needs --outfile".to_string())
        })?;
        if mode.rank() != 0 {
            log::info!("Only rank 0 creates the trace store");
            return Ok(());
        }
        let num_samples = args.num.unwrap_or(DEFAULT_NUM_SAMPLES);
        TraceStore::create(outfile, &store_layout(model, &ctx, &stimulus, num_samples)?)?;
        log::info!("Done.");
        return Ok(());
    }

    if args.create_params {
        let param_file = args.param_file.as_ref().ok_or_else(|| {
            SweepError::InvalidParameter("--create-params needs --param-file".to_string())
        })?;
        let num_samples = args.num.unwrap_or(DEFAULT_NUM_SAMPLES);
        SampleBatch::rand(&spec, num_samples, &mut sampling_rng(args.seed, &mode)).save_to(param_file)?;
        log::info!("Saved {} parameter sets to {}", num_samples, param_file.display());
        return Ok(());
    }

    check_output_action(args.plot_v || args.plot_stim, args.outfile.is_some(), args.force)?;

    let source = SampleSource::select(
        args.param_file.clone(),
        args.num,
        args.params.clone(),
        args.seed,
    );
    let (batch, range) = select_samples(&source, model, &spec, &mode)?;
    let store = match &args.outfile {
        Some(outfile) => {
            let store = TraceStore::open(outfile)?;
            check_store(&store, model, &ctx, &range)?;
            Some(store)
        }
        None => None,
    };

    let mut sweep = Sweep::new(model, ctx, stimulus, Box::new(engine));
    let outcome = sweep.run(&batch, &range)?;

    if args.plot_stim {
        print_table("stim", sweep.stimulus().values(), ctx.dt());
    }
    if args.plot_v {
        for (i, row) in outcome.voltages.row_iter().enumerate() {
            let v = row.iter().copied().collect::<Vec<f64>>();
            print_table(&format!("v {}", range.start + i), &v, ctx.dt());
        }
    }

    if let Some(store) = &store {
        save_outcome(store, &spec, &batch, &outcome)?;
    }
    if let Some(failure_report) = &args.failure_report {
        outcome.report.save_to(failure_report)?;
    }

    match outcome.report.failed.len() {
        0 => Ok(()),
        n => Err(SweepError::FailedSamples(n)),
    }
}

fn main() -> Result<(), SweepError> {
    let args = Args::parse();
    init_logging(&args)?;
    log::info!("{:?}", args);

    run(&args).map_err(|e| {
        log::error!("{}", e);
        e
    })
}
