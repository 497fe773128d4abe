//! Queue inspection and maintenance subcommands.
//!
//! Reads the same SQLite store the running application writes, so these
//! commands are safe to run alongside it.

use anyhow::{Result, bail};
use chrono::{Duration, Utc};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use deskchat_core::queue::PostJobStore;
use deskchat_types::job::{JobId, JobStatus, PostJob};

use crate::state::AppState;

/// Longest body preview shown in tables.
const PREVIEW_CHARS: usize = 48;

/// Job subcommands.
#[derive(Subcommand)]
pub enum JobsCommand {
    /// List jobs in submission order.
    #[command(alias = "ls")]
    List {
        /// Only show jobs with this status (deferred, pending, delivered, failed).
        #[arg(long)]
        status: Option<JobStatus>,
    },

    /// Show one job in full.
    Show {
        /// Job id as printed by `jobs list` (`<lane>/<seq>`).
        id: JobId,
    },

    /// Count jobs by status.
    Stats,

    /// Delete delivered jobs older than the given age.
    Prune {
        /// Minimum age, in hours, of delivered jobs to delete.
        #[arg(long, default_value = "168")]
        older_than_hours: u32,
    },
}

/// Handle a jobs subcommand.
pub async fn handle_jobs_command(cmd: JobsCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        JobsCommand::List { status } => list_jobs(state, status, json).await,
        JobsCommand::Show { id } => show_job(state, id, json).await,
        JobsCommand::Stats => job_stats(state, json).await,
        JobsCommand::Prune { older_than_hours } => prune_jobs(state, older_than_hours, json).await,
    }
}

async fn list_jobs(state: &AppState, status: Option<JobStatus>, json: bool) -> Result<()> {
    let jobs = state.store.list(status).await?;

    if json {
        let items: Vec<serde_json::Value> = jobs.iter().map(job_json).collect();
        let result = serde_json::json!({
            "jobs": items,
            "count": jobs.len(),
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!();
        match status {
            Some(status) => println!("  {} No {} jobs.", style("i").blue().bold(), status),
            None => println!("  {} The queue is empty.", style("i").blue().bold()),
        }
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Job").fg(Color::White),
        Cell::new("Status").fg(Color::White),
        Cell::new("Attempts").fg(Color::White),
        Cell::new("Submitted").fg(Color::White),
        Cell::new("Body").fg(Color::White),
        Cell::new("Last error").fg(Color::White),
    ]);

    for job in &jobs {
        table.add_row(vec![
            Cell::new(job.id.to_string()).fg(Color::Cyan),
            Cell::new(job.status.as_str()).fg(status_color(job.status)),
            Cell::new(job.attempts),
            Cell::new(job.submitted_at.format("%Y-%m-%d %H:%M:%S").to_string()),
            Cell::new(preview(&job.body)),
            Cell::new(job.last_error.as_deref().unwrap_or("")).fg(Color::DarkGrey),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    println!("  {} job(s)", jobs.len());
    println!();

    Ok(())
}

async fn show_job(state: &AppState, id: JobId, json: bool) -> Result<()> {
    let Some(job) = state.store.get(&id).await? else {
        bail!("Job '{id}' not found");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&job_json(&job))?);
        return Ok(());
    }

    let dash = "-".to_string();
    println!();
    println!("  {} {}", style("Job").bold(), style(&job.id).cyan());
    println!();
    println!(
        "  Status:        {}",
        style(job.status).fg(console_color(job.status))
    );
    println!("  Attempts:      {}", job.attempts);
    println!("  Submitted:     {}", job.submitted_at.to_rfc3339());
    println!("  Updated:       {}", job.updated_at.to_rfc3339());
    println!(
        "  Next attempt:  {}",
        job.next_attempt_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| dash.clone())
    );
    match &job.address {
        Some(address) => {
            println!("  Guest:         {}", address.guest_id);
            println!("  Session:       {}", address.session_id);
            println!("  Case link:     {}", address.case_link_id);
        }
        None => println!("  Address:       {}", style("(awaiting session)").dim()),
    }
    if let Some(error) = &job.last_error {
        println!("  Last error:    {}", style(error).red());
    }
    println!();
    println!("  {}", style("── Body ──").dim());
    println!("  {}", job.body);
    println!();

    Ok(())
}

async fn job_stats(state: &AppState, json: bool) -> Result<()> {
    let counts = state.store.count_by_status().await?;
    let total: u64 = counts.iter().map(|(_, n)| n).sum();
    let lanes = state.store.pending_lanes().await?;

    if json {
        let by_status: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, n)| (status.to_string(), serde_json::json!(n)))
            .collect();
        let result = serde_json::json!({
            "total": total,
            "by_status": by_status,
            "pending_lanes": lanes.len(),
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!();
    println!("  {}", style("── Delivery queue ──").dim());
    println!("  Total:          {}", style(total).bold());
    for (status, n) in &counts {
        println!(
            "  {:<15} {}",
            format!("{}:", capitalize(status.as_str())),
            style(n).fg(console_color(*status))
        );
    }
    println!("  Pending lanes:  {}", lanes.len());
    println!();

    Ok(())
}

async fn prune_jobs(state: &AppState, older_than_hours: u32, json: bool) -> Result<()> {
    let cutoff = Utc::now() - Duration::hours(i64::from(older_than_hours));
    let pruned = state.store.prune_delivered(cutoff).await?;
    tracing::info!(pruned, %cutoff, "pruned delivered jobs");

    if json {
        let result = serde_json::json!({
            "pruned": pruned,
            "cutoff": cutoff.to_rfc3339(),
        });
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!();
        println!(
            "  {} Pruned {} delivered job(s) older than {}h",
            style("ok").green(),
            style(pruned).bold(),
            older_than_hours,
        );
        println!();
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// JSON view of a job. The guest token is never printed.
fn job_json(job: &PostJob) -> serde_json::Value {
    serde_json::json!({
        "id": job.id.to_string(),
        "lane": job.id.lane,
        "seq": job.id.seq,
        "status": job.status,
        "attempts": job.attempts,
        "body": job.body,
        "guest_id": job.address.as_ref().map(|a| &a.guest_id),
        "session_id": job.address.as_ref().map(|a| &a.session_id),
        "case_link_id": job.address.as_ref().map(|a| &a.case_link_id),
        "submitted_at": job.submitted_at,
        "next_attempt_at": job.next_attempt_at,
        "last_error": job.last_error,
        "updated_at": job.updated_at,
    })
}

fn preview(body: &str) -> String {
    let line = body.lines().next().unwrap_or("");
    if line.chars().count() > PREVIEW_CHARS || line.len() < body.len() {
        let cut: String = line.chars().take(PREVIEW_CHARS - 3).collect();
        format!("{cut}...")
    } else {
        line.to_string()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn status_color(status: JobStatus) -> Color {
    match status {
        JobStatus::Deferred => Color::Blue,
        JobStatus::Pending => Color::Yellow,
        JobStatus::Delivered => Color::Green,
        JobStatus::Failed => Color::Red,
    }
}

fn console_color(status: JobStatus) -> console::Color {
    match status {
        JobStatus::Deferred => console::Color::Blue,
        JobStatus::Pending => console::Color::Yellow,
        JobStatus::Delivered => console::Color::Green,
        JobStatus::Failed => console::Color::Red,
    }
}
