use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use mediaqueue::core::jobs::{
    EnqueueRequest, FrameInterpolation, Task, UpscaleModel, UpscaleParams, VideoParams,
};
use mediaqueue::core::orchestrator::Orchestrator;
use mediaqueue::core::queue::QueueEvent;
use mediaqueue::core::settings::default_queue_dir;
use mediaqueue::core::QueueError;

mod cli;
use cli::{Cli, Commands, EnqueueArgs, KindArg, ModelArg};

fn build_request(args: EnqueueArgs) -> Result<EnqueueRequest> {
    let upscale = UpscaleParams {
        scale: args.scale,
        face_enhance: args.face_enhance,
        model: match args.model {
            ModelArg::General => UpscaleModel::General,
            ModelArg::Anime => UpscaleModel::Anime,
        },
        preserve_metadata: !args.strip_metadata,
        replace_original: args.replace_original,
    };

    let mut request = match args.kind {
        KindArg::Image => {
            if args.interpolate.is_some() || args.fps.is_some() {
                bail!("--interpolate and --fps only apply to videos");
            }
            EnqueueRequest::image(args.input, upscale)
        }
        KindArg::Video => EnqueueRequest::video(
            args.input,
            VideoParams {
                upscale,
                interpolation: args.interpolate.map(|factor| FrameInterpolation { factor }),
                fps_override: args.fps,
            },
        ),
    };
    if let Some(output) = args.output {
        request = request.with_output_path(output);
    }
    if !args.allow_missing_input {
        request = request.require_existing_input();
    }
    Ok(request)
}

fn print_table(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("Queue is empty");
        return;
    }
    println!(
        "{:<32} {:<18} {:>6}  {:<5}  INPUT",
        "ID", "STATUS", "DONE", "KIND"
    );
    for task in tasks {
        println!(
            "{:<32} {:<18} {:>5.0}%  {:<5}  {}",
            task.id,
            task.status,
            task.progress,
            task.kind(),
            task.input_path.display()
        );
    }
}

fn print_event(event: &QueueEvent) {
    match event {
        QueueEvent::TaskAdded(task) => {
            println!("+ {} {} {}", task.id, task.kind(), task.input_path.display())
        }
        QueueEvent::TaskUpdated(task) => match &task.error_message {
            Some(message) if task.status.is_terminal() => {
                println!("  {} {} ({})", task.id, task.status, message)
            }
            _ => println!("  {} {} {:.0}%", task.id, task.status, task.progress),
        },
        QueueEvent::TaskRemoved(task_id) => println!("- {}", task_id),
        QueueEvent::QueueChanged => {}
    }
}

/// Foreground orchestrator loop.
async fn run(mut orchestrator: Orchestrator, exit_when_idle: bool) -> Result<()> {
    let mut events = orchestrator
        .take_event_receiver()
        .context("event receiver already taken")?;

    let mut ticker = tokio::time::interval(orchestrator.settings().poll_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(
        queue_dir = %orchestrator.queue_dir().display(),
        concurrency = orchestrator.desired_concurrency(),
        "Processing queue"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                tokio::task::block_in_place(|| orchestrator.poll_updates());
                while let Ok(event) = events.try_recv() {
                    print_event(&event);
                }
                if exit_when_idle
                    && orchestrator.active_count() == 0
                    && orchestrator.get_next_pending().is_none()
                {
                    info!("Queue idle");
                    break;
                }
            }
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Interrupted");
                break;
            }
        }
    }

    tokio::task::block_in_place(|| orchestrator.shutdown());
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    Ok(())
}

fn execute(mut orchestrator: Orchestrator, command: Commands) -> Result<()> {
    match command {
        Commands::Enqueue(args) => {
            let task = orchestrator.enqueue(build_request(args)?)?;
            println!("{}", task.id);
        }
        Commands::List { json } => {
            let tasks = orchestrator.list_tasks();
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                print_table(&tasks);
            }
        }
        Commands::Show { task_id } => {
            let task = orchestrator
                .get_task(&task_id)
                .ok_or(QueueError::TaskNotFound(task_id))?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        Commands::Cancel { task_id } => {
            if !orchestrator.cancel(&task_id) {
                bail!("task {task_id} is missing or already finished");
            }
            println!("Cancellation requested for {task_id}");
        }
        Commands::Remove { task_id } => {
            if !orchestrator.remove(&task_id) {
                return Err(QueueError::TaskNotFound(task_id).into());
            }
            println!("Removed {task_id}");
        }
        Commands::Pause => println!("Paused {} task(s)", orchestrator.pause()),
        Commands::Resume => println!("Resumed {} task(s)", orchestrator.resume()),
        Commands::Clear => println!("Cleared {} task(s)", orchestrator.clear_completed()),
        Commands::Concurrency { workers } => {
            let applied = orchestrator.set_concurrency(workers)?;
            println!("Concurrency set to {applied}");
        }
        Commands::Run { .. } => bail!("run needs the foreground loop"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let queue_dir: PathBuf = match cli.queue_dir {
        Some(dir) => dir,
        None => default_queue_dir().context("cannot determine the home directory; pass --queue-dir")?,
    };
    std::fs::create_dir_all(&queue_dir)
        .with_context(|| format!("cannot create queue directory {}", queue_dir.display()))?;

    let debug = cli.debug || mediaqueue::debug_from_env();
    mediaqueue::init_logging(&queue_dir.join(mediaqueue::LOG_DIR_NAME), "cli.log", debug);

    let orchestrator = Orchestrator::open(&queue_dir)
        .with_context(|| format!("cannot open queue at {}", queue_dir.display()))?;

    match cli.command {
        Commands::Run { exit_when_idle } => run(orchestrator, exit_when_idle).await,
        // One-shot commands edit the queue; a running `run` host picks the changes up.
        command => execute(orchestrator.without_dispatch(), command),
    }
}
