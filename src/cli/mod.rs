use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use crate::coordinator::{JobEvent, TranscodeCoordinator};
use crate::models::{load_config, JobRecord, JobSpec, JobState};

/// Exit status when the job was cancelled (mirrors SIGINT).
pub const EXIT_CANCELLED: i32 = 130;

/// Transcode Coordinator - run external transcoding jobs
#[derive(Parser, Debug)]
#[command(
    name = "tcoord",
    version,
    about = "Transcode Coordinator - run external transcoding jobs"
)]
pub struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one transcode job and follow it to completion
    Run {
        /// Source media file
        #[arg(short = 'i', long)]
        input: PathBuf,

        /// Destination file
        #[arg(short = 'o', long)]
        output: PathBuf,

        /// Tool to launch (overrides config)
        #[arg(short = 't', long)]
        tool: Option<String>,

        /// Give up after this many seconds (overrides config, 0 = no limit)
        #[arg(long)]
        timeout: Option<u64>,

        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,

        /// Arguments passed to the tool
        #[arg(last = true, required = true)]
        args: Vec<String>,
    },
}

/// Run the selected command and return the process exit status.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<i32> {
    match &cli.command {
        Some(Commands::Run {
            input,
            output,
            tool,
            timeout,
            config,
            args,
        }) => {
            cmd_run(
                input.clone(),
                output.clone(),
                tool.clone(),
                *timeout,
                config.clone(),
                args.clone(),
            )
            .await
        }
        None => {
            // No subcommand provided -- print help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(0)
        }
    }
}

pub async fn cmd_run(
    input: PathBuf,
    output: PathBuf,
    tool: Option<String>,
    timeout: Option<u64>,
    config_path: Option<PathBuf>,
    args: Vec<String>,
) -> anyhow::Result<i32> {
    let mut config = load_config(config_path.as_deref())?;
    if let Some(tool) = tool {
        config.tool = tool;
    }
    if let Some(timeout) = timeout {
        config.job_timeout_secs = timeout;
    }

    let coordinator = TranscodeCoordinator::from_config(config)
        .await
        .context("Failed to start coordinator")?;
    let spec = JobSpec::new(input, output, args)?;

    // Subscribe before submitting so fast jobs cannot finish unseen
    let events = coordinator.subscribe();
    let id = coordinator.submit(spec).await?;
    println!("Job {} submitted.", id);

    let record = follow_job(&coordinator, events, id).await?;
    Ok(report_outcome(&record))
}

async fn follow_job(
    coordinator: &TranscodeCoordinator,
    mut events: crate::coordinator::Subscription,
    id: Uuid,
) -> anyhow::Result<JobRecord> {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancelling = false;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(JobEvent::Progress { job_id, line, .. }) if job_id == id => {
                    println!("{}", line);
                }
                Some(JobEvent::Started { job_id, pid, .. }) if job_id == id => {
                    tracing::debug!("Job {} running (pid {:?})", id, pid);
                }
                Some(JobEvent::Overflow { missed }) => {
                    eprintln!("Warning: {} event(s) dropped", missed);
                    // The terminal event may have been among them
                    let record = coordinator.get_status(id).await?;
                    if record.state.is_terminal() {
                        return Ok(record);
                    }
                }
                Some(event) if event.is_terminal() && event.job_id() == Some(id) => {
                    return Ok(coordinator.get_status(id).await?);
                }
                Some(_) => {}
                None => anyhow::bail!("Event stream closed before job {} finished", id),
            },
            result = &mut ctrl_c, if !cancelling => {
                result.context("Failed to listen for Ctrl+C")?;
                cancelling = true;
                eprintln!("Cancelling job {}...", id);
                coordinator.cancel(id).await?;
            }
        }
    }
}

fn report_outcome(record: &JobRecord) -> i32 {
    match record.state {
        JobState::Succeeded => {
            println!(
                "Job {} succeeded: {} ({} bytes)",
                record.id(),
                record.spec.output_path().display(),
                record.output_bytes.unwrap_or_default()
            );
            0
        }
        JobState::Cancelled => {
            eprintln!("Job {} cancelled.", record.id());
            EXIT_CANCELLED
        }
        _ => {
            let reason = record
                .failure
                .map(|f| f.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            match record.exit_code {
                Some(code) => eprintln!("Job {} failed: {} (exit code {})", record.id(), reason, code),
                None => eprintln!("Job {} failed: {}", record.id(), reason),
            }
            if !record.log_tail.is_empty() {
                eprintln!("Last output:");
                for line in record.log_tail.lines() {
                    eprintln!("  {}", line);
                }
            }
            1
        }
    }
}
