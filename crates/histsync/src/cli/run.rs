//! `histsync run`: one pipeline run, now.

use super::exit::ExitStatus;
use super::output::{format_duration, print_table};
use anyhow::{Context, Result};
use histsync::{local_pipeline, Config, RunOutcome, RunStatus, RunSummary, SystemClock};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, clap::Args)]
pub struct RunArgs {
    /// Historian export directory (overrides remote_dir from the config file)
    #[arg(long)]
    pub remote_dir: Option<PathBuf>,

    /// Print the run summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl RunArgs {
    pub fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.remote_dir {
            config.remote_dir = Some(dir.to_string_lossy().into_owned());
        }
    }
}

pub fn run(args: &RunArgs, config: &Config) -> Result<ExitStatus> {
    let pipeline = local_pipeline(config, Arc::new(SystemClock))?;
    let outcome = pipeline.run_once();

    if args.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&outcome).context("Failed to serialize run summary")?
        );
    } else {
        print_outcome(&outcome);
    }

    Ok(ExitStatus::for_outcome(&outcome))
}

fn print_outcome(outcome: &RunOutcome) {
    let summary = match outcome {
        RunOutcome::SkippedBusy => {
            println!("Skipped: another run is in progress.");
            return;
        }
        RunOutcome::Completed(summary) => summary,
    };

    let (failed, attempted) = summary.failure_counts();
    let verdict = match summary.status {
        RunStatus::Success => "succeeded".to_string(),
        RunStatus::PartialFailure => format!("completed with {} of {} items failed", failed, attempted),
        RunStatus::Failed => "FAILED".to_string(),
    };
    println!(
        "Run {} {} in {}",
        summary.run_id,
        verdict,
        format_duration(summary.elapsed)
    );
    println!();

    print_stage_lines(summary);

    if let Some(load) = &summary.load {
        if !load.per_tag.is_empty() {
            println!();
            let rows = load
                .per_tag
                .iter()
                .map(|t| {
                    vec![
                        t.tag.to_string(),
                        t.rows_inserted.to_string(),
                        format_duration(t.duration),
                        if t.completed { "ok" } else { "failed" }.to_string(),
                    ]
                })
                .collect();
            print_table(&["TAG", "ROWS", "TIME", "STATUS"], rows);
        }
    }

    let failures: Vec<_> = summary
        .fetch
        .iter()
        .flat_map(|f| f.failures.iter())
        .chain(summary.load.iter().flat_map(|l| l.failures.iter()))
        .collect();
    if !failures.is_empty() {
        println!();
        println!("Failures:");
        for failure in failures {
            println!("  - {}", failure);
        }
    }

    if !summary.errors.is_empty() {
        println!();
        println!("Errors:");
        for err in &summary.errors {
            println!("  - {}", err);
        }
    }
}

fn print_stage_lines(summary: &RunSummary) {
    match &summary.fetch {
        Some(f) => println!(
            "Fetch: {} attempted, {} succeeded, {} failed ({} stale staging files swept)",
            f.attempted, f.succeeded, f.failed, f.swept_staging
        ),
        None => println!("Fetch: did not complete"),
    }
    match &summary.load {
        Some(l) => println!(
            "Load:  {} files, {} succeeded, {} failed, {} skipped, {} rows inserted",
            l.files_processed, l.succeeded, l.failed, l.skipped, l.rows_inserted
        ),
        None => println!("Load:  did not complete"),
    }
}
