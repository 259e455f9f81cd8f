use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Dual-participant synchronized stimulus timelines")]
pub struct Args {
    /// Runtime timing config (JSON); DYADSYNC_* environment variables override it
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check a timeline's structure and that every referenced video exists
    Validate {
        timeline: PathBuf,

        /// Directory relative video paths are resolved against
        #[arg(long, value_name = "DIR")]
        media_root: Option<PathBuf>,

        /// Only check structure
        #[arg(long, default_value_t = false)]
        skip_media: bool,
    },

    /// Print blocks, trial counts and the estimated running time
    Summary { timeline: PathBuf },

    /// Run a timeline against simulated devices in accelerated time
    Simulate {
        timeline: PathBuf,

        /// Results document
        #[arg(long, short, default_value = "results.json")]
        output: PathBuf,

        /// Virtual seconds per real second
        #[arg(long, default_value_t = 20)]
        speedup: u32,

        /// Seed for simulated responses; random when absent
        #[arg(long)]
        seed: Option<u64>,

        /// Length of every simulated video, in seconds
        #[arg(long, default_value_t = 2.0)]
        video_secs: f64,

        /// How long simulated participants take to answer
        #[arg(long, default_value_t = 800)]
        response_delay_ms: u64,

        /// Marker catalog to load and save back; the default code book when absent
        #[arg(long, value_name = "PATH")]
        catalog: Option<PathBuf>,
    },
}
