//! CLI argument parsing definitions

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "mediaqueue-cli", author, version, about, long_about = None)]
pub struct Cli {
    /// Queue directory (defaults to ~/.mediaqueue/queue)
    #[arg(long, value_name = "PATH", global = true)]
    pub queue_dir: Option<PathBuf>,

    /// Verbose logging (also enabled by MEDIAQUEUE_DEBUG=1)
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Add a task to the queue
    Enqueue(EnqueueArgs),

    /// List tasks in queue order
    List {
        /// Print the tasks as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show one task as JSON
    Show {
        task_id: String,
    },

    /// Cancel a queued or running task
    Cancel {
        task_id: String,
    },

    /// Delete a task, cancelling it first if it is running
    Remove {
        task_id: String,
    },

    /// Hold back every pending task
    Pause,

    /// Release paused tasks
    Resume,

    /// Delete completed, failed and cancelled tasks
    Clear,

    /// Set how many workers may run at once (1-4)
    Concurrency {
        #[arg(value_name = "N")]
        workers: usize,
    },

    /// Run the orchestrator in the foreground until Ctrl-C
    Run {
        /// Stop once nothing is pending or running
        #[arg(long)]
        exit_when_idle: bool,
    },
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum KindArg {
    #[default]
    Image,
    Video,
}

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum ModelArg {
    #[default]
    General,
    Anime,
}

#[derive(Args, Debug)]
pub struct EnqueueArgs {
    /// Source media file
    pub input: PathBuf,

    /// Media kind
    #[arg(long, value_enum, default_value_t = KindArg::Image)]
    pub kind: KindArg,

    /// Where to write the result (defaults to <stem>_upscaled_<scale>x<ext>)
    #[arg(long, short, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Upscale factor (2, 3 or 4)
    #[arg(long, default_value_t = 2)]
    pub scale: u8,

    #[arg(long, value_enum, default_value_t = ModelArg::General)]
    pub model: ModelArg,

    /// Restore faces after upscaling
    #[arg(long)]
    pub face_enhance: bool,

    /// Drop metadata from the output
    #[arg(long)]
    pub strip_metadata: bool,

    /// Overwrite the input with the result
    #[arg(long)]
    pub replace_original: bool,

    /// Frame interpolation factor for videos (2, 4 or 8)
    #[arg(long, value_name = "FACTOR")]
    pub interpolate: Option<u8>,

    /// Output frame rate for videos
    #[arg(long)]
    pub fps: Option<f64>,

    /// Skip the input existence check
    #[arg(long)]
    pub allow_missing_input: bool,
}
