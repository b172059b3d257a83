//! Batch admission simulator.
//!
//! Loads a job file, admits every job concurrently against an in-process
//! instance, prints where each job landed, and tears the instance down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use lanekeeper_core::{
    CloseSessionRequest, CreateSessionRequest, EventBus, GraphDef, Instance, InstanceConfig,
    InstanceEvent, LaneId, LocalEngine, MemoryEventBus, ResourceMap, SessionConfig,
};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::ConfigLoader;

/// Simulate arguments.
#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Job file ([[jobs]] entries)
    pub jobs: PathBuf,

    /// Tear down with a single reset instead of closing each session
    #[arg(long)]
    pub reset: bool,

    /// Give up on a job that waits longer than this for lanes
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Use this config file instead of the user and project config
    #[arg(long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
struct JobFile {
    #[serde(default)]
    jobs: Vec<JobSpec>,
}

/// One job of a job file.
#[derive(Debug, Clone, Deserialize)]
struct JobSpec {
    name: String,

    /// Op names, chained into a linear graph
    #[serde(default = "default_nodes")]
    nodes: Vec<String>,

    #[serde(default)]
    persistent: HashMap<String, f64>,

    #[serde(default)]
    temporary: HashMap<String, f64>,

    /// Run one task for this long, then close the session early
    hold_ms: Option<u64>,
}

fn default_nodes() -> Vec<String> {
    vec!["NoOp".to_string()]
}

impl JobSpec {
    fn to_request(&self) -> CreateSessionRequest {
        CreateSessionRequest {
            graph_def: GraphDef::linear(self.nodes.iter().map(String::as_str)),
            config: SessionConfig {
                name: Some(self.name.clone()),
                resource_map: ResourceMap {
                    persistent: self.persistent.clone(),
                    temporary: self.temporary.clone(),
                },
            },
        }
    }
}

#[derive(Debug)]
enum JobStatus {
    /// Admitted and still registered
    Live,
    /// Admitted, ran its hold, and closed itself
    Released,
    /// Still waiting for lanes when nothing else could free any
    Queued,
    Failed(String),
}

#[derive(Debug)]
struct JobOutcome {
    name: String,
    handle: Option<String>,
    status: JobStatus,
}

/// Lane placement as reported when the job was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Placement {
    lane_id: LaneId,
    lane_size: u64,
    lane_avail: u64,
    lane_stream: u32,
}

/// Run simulate command.
pub async fn run(args: SimulateArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => ConfigLoader::load_from_path(path)?,
        None => ConfigLoader::load()?,
    };
    if args.timeout_ms.is_some() {
        config.scheduler.wait_timeout_ms = args.timeout_ms;
    }

    let jobs = load_jobs(&args.jobs)?;
    if jobs.is_empty() {
        println!("No jobs in {}.", args.jobs.display());
        return Ok(());
    }

    let bus = Arc::new(MemoryEventBus::default());
    let instance = Arc::new(build_instance(config, Arc::clone(&bus))?);

    let outcomes = admit_all(&instance, jobs).await;
    let placements = placements(&*bus).await;
    println!("{}", render_table(&outcomes, &placements));

    let live: Vec<String> = outcomes
        .iter()
        .filter(|o| matches!(o.status, JobStatus::Live))
        .filter_map(|o| o.handle.clone())
        .collect();
    teardown(&instance, live, args.reset).await
}

fn load_jobs(path: &Path) -> Result<Vec<JobSpec>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    parse_jobs(&contents).with_context(|| format!("Invalid job file {}", path.display()))
}

fn parse_jobs(contents: &str) -> Result<Vec<JobSpec>> {
    let file: JobFile = toml::from_str(contents)?;
    Ok(file.jobs)
}

fn build_instance(config: InstanceConfig, bus: Arc<MemoryEventBus>) -> Result<Instance> {
    let engine = Arc::new(LocalEngine::new());
    Ok(Instance::new(config, engine, bus)?)
}

/// How often admission progress is checked
const PROGRESS_POLL: Duration = Duration::from_millis(10);

/// Submit every job at once and wait until each one has settled or is stuck
///
/// Admitted jobs without a hold keep their lanes until teardown, so once
/// every unfinished job is a queued lane request none of them can make
/// progress. Those jobs are cancelled and reported as queued.
async fn admit_all(instance: &Arc<Instance>, jobs: Vec<JobSpec>) -> Vec<JobOutcome> {
    let tasks: Vec<_> = jobs
        .into_iter()
        .map(|job| {
            let instance = Arc::clone(instance);
            let name = job.name.clone();
            (name, tokio::spawn(async move { run_job(&instance, job).await }))
        })
        .collect();

    loop {
        let unfinished = tasks.iter().filter(|(_, task)| !task.is_finished()).count();
        if unfinished == 0 {
            break;
        }
        if instance.lane_manager().pending_requests() >= unfinished {
            for (name, task) in tasks.iter().filter(|(_, task)| !task.is_finished()) {
                warn!(job = %name, "No lanes can free up, giving up on queued job");
                task.abort();
            }
            break;
        }
        tokio::time::sleep(PROGRESS_POLL).await;
    }

    let mut outcomes = Vec::with_capacity(tasks.len());
    for (name, task) in tasks {
        let outcome = match task.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => JobOutcome {
                name,
                handle: None,
                status: JobStatus::Queued,
            },
            Err(e) => JobOutcome {
                name,
                handle: None,
                status: JobStatus::Failed(format!("job task failed: {e}")),
            },
        };
        outcomes.push(outcome);
    }
    outcomes
}

async fn run_job(instance: &Instance, job: JobSpec) -> JobOutcome {
    let name = job.name.clone();
    let handle = match instance.create_session(job.to_request()).await {
        Ok(response) => response.session_handle,
        Err(e) => {
            warn!(job = %name, error = %e, "Job was not admitted");
            return JobOutcome {
                name,
                handle: None,
                status: JobStatus::Failed(e.to_string()),
            };
        }
    };
    debug!(job = %name, sess = %handle, "Job admitted");

    let Some(hold_ms) = job.hold_ms else {
        return JobOutcome {
            name,
            handle: Some(handle),
            status: JobStatus::Live,
        };
    };

    let status = match hold_then_close(instance, &handle, hold_ms).await {
        Ok(()) => JobStatus::Released,
        Err(e) => JobStatus::Failed(e.to_string()),
    };
    JobOutcome {
        name,
        handle: Some(handle),
        status,
    }
}

async fn hold_then_close(instance: &Instance, handle: &str, hold_ms: u64) -> Result<()> {
    let session = instance.find_session(handle)?;
    let task = session.begin_task()?;
    tokio::time::sleep(Duration::from_millis(hold_ms)).await;
    drop(task);
    drop(session);

    instance
        .close_session(CloseSessionRequest {
            session_handle: handle.to_string(),
        })
        .await?;
    Ok(())
}

/// First lane assignment of every session, keyed by handle
async fn placements(bus: &dyn EventBus) -> HashMap<String, Placement> {
    let mut placements = HashMap::new();
    for (_, event) in bus.events_from(0).await {
        if let InstanceEvent::LaneAssigned {
            session_id,
            lane_id,
            lane_size,
            lane_avail,
            lane_stream,
        } = event
        {
            placements.entry(session_id).or_insert(Placement {
                lane_id,
                lane_size,
                lane_avail,
                lane_stream,
            });
        }
    }
    placements
}

fn render_table(outcomes: &[JobOutcome], placements: &HashMap<String, Placement>) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Job").fg(Color::Cyan),
        Cell::new("Handle").fg(Color::Cyan),
        Cell::new("Lane").fg(Color::Cyan),
        Cell::new("Capacity").fg(Color::Cyan),
        Cell::new("Available").fg(Color::Cyan),
        Cell::new("Stream").fg(Color::Cyan),
        Cell::new("Status").fg(Color::Cyan),
    ]);

    for outcome in outcomes {
        let placement = outcome
            .handle
            .as_ref()
            .and_then(|handle| placements.get(handle));
        let status = match &outcome.status {
            JobStatus::Live => Cell::new("live").fg(Color::Green),
            JobStatus::Released => Cell::new("released"),
            JobStatus::Queued => Cell::new("queued").fg(Color::Yellow),
            JobStatus::Failed(reason) => Cell::new(reason).fg(Color::Red),
        };

        table.add_row(vec![
            Cell::new(&outcome.name),
            Cell::new(outcome.handle.as_deref().unwrap_or("-")),
            Cell::new(placement.map_or("-".to_string(), |p| p.lane_id.to_string())),
            Cell::new(placement.map_or("-".to_string(), |p| format_bytes(p.lane_size))),
            Cell::new(placement.map_or("-".to_string(), |p| format_bytes(p.lane_avail))),
            Cell::new(placement.map_or("-".to_string(), |p| p.lane_stream.to_string())),
            status,
        ]);
    }
    table
}

async fn teardown(instance: &Instance, live: Vec<String>, reset: bool) -> Result<()> {
    if reset {
        let count = instance.session_count();
        instance.reset().await?;
        println!("Reset closed {count} session(s).");
        return Ok(());
    }

    let mut closed = 0;
    let mut failed = 0;
    for handle in live {
        match instance
            .close_session(CloseSessionRequest {
                session_handle: handle.clone(),
            })
            .await
        {
            Ok(()) => closed += 1,
            Err(e) => {
                warn!(sess = %handle, error = %e, "Failed to close session");
                failed += 1;
            }
        }
    }
    info!(closed, failed, "Simulation torn down");
    println!("Closed {closed} session(s), {failed} failed.");

    if failed > 0 {
        anyhow::bail!("{failed} session(s) failed to close");
    }
    Ok(())
}

/// Format bytes as a human-readable string (1.5G, 512M, 4K).
fn format_bytes(bytes: u64) -> String {
    const UNITS: [(u64, &str); 3] = [(1 << 30, "G"), (1 << 20, "M"), (1 << 10, "K")];
    for (size, suffix) in UNITS {
        if bytes >= size {
            let value = bytes as f64 / size as f64;
            return if bytes % size == 0 {
                format!("{}{suffix}", bytes / size)
            } else {
                format!("{value:.1}{suffix}")
            };
        }
    }
    bytes.to_string()
}
