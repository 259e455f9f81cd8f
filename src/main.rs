mod cli;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Args, Command};
use dyadsync_core::{MarkerCatalog, MarkerSink, MarkerValue, Trial};
use dyadsync_experiment::sim::{AutoResponder, SimProvider, SimSurfaces};
use dyadsync_experiment::{
    Block, ExecutionObserver, JsonCollector, MarkerEmitter, Resources, Runtime, RuntimeConfig,
    Timeline,
};
use dyadsync_timing::SimulatedTimer;
use log::info;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Validate {
            timeline,
            media_root,
            skip_media,
        } => validate(&timeline, media_root, skip_media),
        Command::Summary { timeline } => summary(&timeline),
        Command::Simulate {
            timeline,
            output,
            speedup,
            seed,
            video_secs,
            response_delay_ms,
            catalog,
        } => {
            let config = runtime_config(args.config.as_deref())?;
            simulate(
                &timeline,
                config,
                SimulateOptions {
                    output,
                    speedup,
                    seed: seed.unwrap_or_else(|| rand::rng().random()),
                    video_secs,
                    response_delay: Duration::from_millis(response_delay_ms),
                    catalog,
                },
            )
        }
    }
}

fn load(path: &Path) -> Result<Timeline> {
    Timeline::load(path).with_context(|| format!("loading timeline {}", path.display()))
}

fn runtime_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let mut config = match path {
        Some(path) => RuntimeConfig::from_json_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

fn validate(path: &Path, media_root: Option<PathBuf>, skip_media: bool) -> Result<()> {
    let timeline = load(path)?;
    let root = media_root
        .or_else(|| path.parent().map(Path::to_path_buf))
        .unwrap_or_default();

    let errors = if skip_media {
        timeline.validate()
    } else {
        timeline.validate_media(|video| root.join(video).exists())
    };
    if !errors.is_empty() {
        for error in &errors {
            println!("  {error}");
        }
        bail!("{} has {} problem(s)", path.display(), errors.len());
    }
    println!(
        "{}: OK ({} blocks, {} trials)",
        timeline.metadata.name,
        timeline.blocks.len(),
        timeline.total_trials()
    );
    Ok(())
}

fn minutes(seconds: f64) -> String {
    format!("{}:{:02}", (seconds / 60.0) as u64, (seconds % 60.0).round() as u64)
}

fn summary(path: &Path) -> Result<()> {
    let timeline = load(path)?;
    let meta = &timeline.metadata;
    println!("=== {} ===", meta.name);
    if !meta.description.is_empty() {
        println!("{}", meta.description);
    }
    println!(
        "Displays {:?}, audio {:?}, marker stream {}{}",
        meta.display_indices,
        meta.audio_indices,
        meta.marker_stream_name,
        if meta.markers_enabled { "" } else { " (disabled)" }
    );

    for (i, block) in timeline.blocks.iter().enumerate() {
        let phases = block.procedure.as_ref().map_or(0, |p| p.len());
        let estimate = block.duration(None);
        println!(
            "  {i}. {} [{}] {} trial(s), {phases} phase(s), {:?} order, ~{}{}",
            block.name,
            block.kind,
            block.trial_count(),
            block.randomization.method,
            minutes(estimate.seconds),
            if estimate.is_exact() {
                String::new()
            } else {
                format!(" + {} open-ended phase(s)", estimate.unknown)
            }
        );
    }

    let total = timeline.duration(None);
    println!(
        "Total: {} trials, ~{} known duration, {} phase(s) of unknown length",
        timeline.total_trials(),
        minutes(total.seconds),
        total.unknown
    );
    Ok(())
}

struct SimulateOptions {
    output: PathBuf,
    speedup: u32,
    seed: u64,
    video_secs: f64,
    response_delay: Duration,
    catalog: Option<PathBuf>,
}

/// Stands in for the marker transport: every value goes to the `markers` log target.
struct StreamSink {
    stream: String,
}

impl MarkerSink for StreamSink {
    fn push(&mut self, value: &MarkerValue) {
        log::debug!(target: "markers", "{} <- {value}", self.stream);
    }
}

struct Progress {
    started: Instant,
}

impl ExecutionObserver for Progress {
    fn block_started(&mut self, index: usize, block: &Block) {
        info!("block {index} ({}) started", block.name);
    }

    fn trial_completed(&mut self, block: &str, position: usize, trial: &Trial) {
        info!(
            "{block}: trial {} (row {}) done after {:.1} s",
            position + 1,
            trial.id,
            self.started.elapsed().as_secs_f64()
        );
    }
}

fn simulate(path: &Path, config: RuntimeConfig, opts: SimulateOptions) -> Result<()> {
    let mut timeline = load(path)?;
    let timer = SimulatedTimer::accelerated(opts.speedup);
    let provider = SimProvider::new(timer.shared()).with_default_duration(opts.video_secs);
    let resources = Resources::new(Arc::new(provider), timeline.metadata.audio_indices);

    let catalog = match &opts.catalog {
        Some(path) => MarkerCatalog::open(path)?,
        None => MarkerCatalog::with_defaults(),
    };
    let markers = MarkerEmitter::new(timer.shared(), timeline.metadata.name.clone())
        .with_sink(Box::new(StreamSink {
            stream: timeline.metadata.marker_stream_name.clone(),
        }))
        .with_catalog(catalog);

    let mut rt = Runtime::new(
        config,
        timer.shared(),
        resources,
        Box::new(SimSurfaces::new()),
        Box::new(AutoResponder::new(opts.seed, opts.response_delay)),
    )
    .with_markers(markers);

    let mut collector = JsonCollector::create(&opts.output, timeline.metadata.name.clone())?;
    info!(
        "simulating {} at {}x, response seed {}",
        timeline.metadata.name, opts.speedup, opts.seed
    );
    let mut progress = Progress {
        started: Instant::now(),
    };
    timeline.execute(&mut rt, Some(&mut collector), &mut progress)?;

    print!("{}", rt.markers.log().summary());
    if let Some(catalog) = rt.markers.take_catalog() {
        catalog.close()?;
    }
    println!(
        "{} trials, {} responses written to {}",
        collector.document().trials.len(),
        collector.document().responses.len(),
        collector.path().display()
    );
    Ok(())
}
