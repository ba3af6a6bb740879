use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use docflow_core::error::PipelineError;
use docflow_core::facets::FacetSchemaCache;
use docflow_core::models::{
    Correlation, Job, JobOptions, JobStatus, NewJob, Phase, PhasePolicies, PhasePolicy, SourceRef,
};
use docflow_core::naming;
use docflow_core::repair::RepairReconciler;
use docflow_core::resolver::ArtifactResolver;
use docflow_core::storage::{StorageItem, StorageProvider};

use crate::config::Config;
use crate::db;
use crate::index::SqliteIndex;
use crate::provider;
use crate::queue::{JobQueue, QueueOptions};
use crate::restart::{bulk_restart, BulkRestartRequest, RestartFilter};
use crate::storage_fs::{self, LocalStorage};
use crate::worker::{RunOutcome, Worker, WorkerOptions};

/// Options for `docflow enqueue` and `docflow enqueue-dir`.
#[derive(Debug, Clone, Default)]
pub struct EnqueueArgs {
    pub batch: Option<String>,
    pub lang: Option<String>,
    pub template: Option<String>,
    pub policies: Vec<(String, String)>,
    pub user: Option<String>,
    pub library: Option<String>,
    pub no_cache: bool,
}

/// Parse `phase=policy` pairs into a policy set.
pub fn parse_policies(pairs: &[(String, String)]) -> Result<PhasePolicies> {
    let mut policies = PhasePolicies::default();
    for (phase, policy) in pairs {
        let phase: Phase = phase.parse()?;
        let policy: PhasePolicy = policy.parse()?;
        policies.set(phase, policy);
    }
    Ok(policies)
}

/// Job type from the file extension, e.g. `pdf`.
fn job_type_for(name: &str) -> String {
    match naming::split_extension(name).1.trim_start_matches('.') {
        "" => "document".to_string(),
        ext => ext.to_ascii_lowercase(),
    }
}

fn new_job(config: &Config, item: &StorageItem, args: &EnqueueArgs, policies: PhasePolicies) -> NewJob {
    NewJob {
        job_type: job_type_for(&item.name),
        correlation: Correlation {
            source: SourceRef {
                item_id: item.id.clone(),
                parent_id: item.parent_id.clone(),
                name: item.name.clone(),
                mime_type: item.mime_type.clone(),
            },
            options: JobOptions {
                target_language: args
                    .lang
                    .clone()
                    .unwrap_or_else(|| config.pipeline.target_language.clone()),
                source_language: None,
                template: args.template.clone(),
                use_cache: !args.no_cache,
            },
        },
        policies,
        user_email: args.user.clone(),
        library_id: args.library.clone(),
        batch_id: args.batch.clone(),
        max_attempts: None,
    }
}

async fn open_queue(config: &Config) -> Result<JobQueue> {
    let pool = db::connect(config).await?;
    Ok(JobQueue::new(pool, QueueOptions::from_config(config)))
}

pub async fn run_enqueue(config: &Config, item_id: &str, args: &EnqueueArgs) -> Result<()> {
    let storage = LocalStorage::new(&config.storage.root)?;
    let item = storage
        .get_item(item_id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("source item {}", item_id)))?;
    if !item.is_file() {
        bail!("{} is not a file", item_id);
    }
    let policies = parse_policies(&args.policies)?;
    let queue = open_queue(config).await?;

    let job = queue.enqueue(new_job(config, &item, args, policies)).await?;
    println!("{}", job.id);
    Ok(())
}

pub async fn run_enqueue_dir(
    config: &Config,
    folder: &str,
    include: &[String],
    args: &EnqueueArgs,
) -> Result<()> {
    let include = if include.is_empty() {
        storage_fs::default_include_globs()
    } else {
        include.to_vec()
    };
    let ids = storage_fs::scan_sources(&config.storage.root, folder, &include)?;
    let storage = LocalStorage::new(&config.storage.root)?;
    let policies = parse_policies(&args.policies)?;
    let queue = open_queue(config).await?;

    let batch = args
        .batch
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let args = EnqueueArgs {
        batch: Some(batch.clone()),
        ..args.clone()
    };

    let mut enqueued = 0usize;
    for id in &ids {
        let Some(item) = storage.get_item(id).await? else {
            continue;
        };
        queue.enqueue(new_job(config, &item, &args, policies)).await?;
        enqueued += 1;
    }

    println!("enqueue-dir {}", folder);
    println!("  matched:  {}", ids.len());
    println!("  enqueued: {}", enqueued);
    println!("  batch:    {}", batch);
    Ok(())
}

/// Assemble a worker over the local library and the configured provider.
pub async fn build_worker(config: &Config) -> Result<Worker> {
    let pool = db::connect(config).await?;
    let queue = JobQueue::new(pool.clone(), QueueOptions::from_config(config));
    let storage: Arc<dyn StorageProvider> = Arc::new(LocalStorage::new(&config.storage.root)?);
    let resolver = Arc::new(ArtifactResolver::new(storage, config.pipeline.legacy_fallback));
    let provider = provider::from_config(&config.provider)?;
    let sink = Arc::new(SqliteIndex::new(pool, config.pipeline.max_tokens));
    let schemas = Arc::new(FacetSchemaCache::new(Arc::new(config.facet_schemas())));

    Ok(Worker::new(
        queue,
        resolver,
        Arc::from(provider),
        sink,
        schemas,
        WorkerOptions::from_config(config),
    ))
}

pub async fn run_work(config: &Config, once: bool) -> Result<()> {
    let worker = build_worker(config).await?;

    if once {
        match worker.run_once().await? {
            RunOutcome::Idle => println!("no claimable job"),
            RunOutcome::Completed(id) => println!("completed {}", id),
            RunOutcome::Failed(id) => println!("failed {}", id),
            RunOutcome::Parked(id) => println!("parked {}", id),
            RunOutcome::LeaseLost(id) => println!("lease lost {}", id),
        }
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown requested");
        signal.cancel();
    });
    worker.run(cancel).await
}

fn print_job(job: &Job) {
    println!("job {}", job.id);
    println!("  source:   {}", job.correlation.source.name);
    println!("  status:   {}", job.status);
    println!("  attempts: {}/{}", job.attempts, job.max_attempts);
    if let Some(batch) = &job.batch_id {
        println!("  batch:    {}", batch);
    }
    if let Some(until) = job.parked_until {
        println!("  parked:   until {}", until.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  steps:");
    for step in &job.steps {
        let reason = step
            .details
            .get("reason")
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        let marker = if step.is_skipped() { " (skipped)" } else { "" };
        println!("    {:<10} {:<10} {}{}", step.name, step.status, reason, marker);
        if let Some(err) = &step.error {
            println!("      error: [{}] {}", err.code, err.message);
        }
    }
    if let Some(err) = &job.error {
        println!("  error:    [{}] {}", err.code, err.message);
    }
    println!("  trace:    {} events", job.trace.len());
}

pub async fn run_status(config: &Config, id: &str, json: bool) -> Result<()> {
    let queue = open_queue(config).await?;
    let job = queue
        .get(id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("job {}", id)))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job(&job);
    }
    Ok(())
}

pub async fn run_counters(config: &Config) -> Result<()> {
    let queue = open_queue(config).await?;
    let counters = queue.counters().await?;
    let rows: BTreeMap<&str, i64> = [
        ("queued", counters.queued),
        ("running", counters.running),
        ("completed", counters.completed),
        ("failed", counters.failed),
    ]
    .into_iter()
    .collect();
    println!("{}", serde_json::to_string(&rows)?);
    Ok(())
}

pub async fn run_restart(
    config: &Config,
    batch: Option<String>,
    status: Option<String>,
    confirm: bool,
) -> Result<()> {
    let status = status.as_deref().map(str::parse::<JobStatus>).transpose()?;
    let queue = open_queue(config).await?;
    let report = bulk_restart(
        &queue,
        &BulkRestartRequest {
            filter: RestartFilter {
                batch_id: batch,
                status,
                job_type: None,
            },
            confirm,
        },
    )
    .await?;

    println!("restart");
    println!("  matched:   {}", report.matched);
    println!("  restarted: {}", report.restarted);
    println!("  failed:    {}", report.failed);
    for item in report.items.iter().filter(|i| !i.ok) {
        println!("    {}: {}", item.job_id, item.error.as_deref().unwrap_or("unknown error"));
    }
    Ok(())
}

pub async fn run_adopt(config: &Config, item_id: &str, lang: Option<&str>, template: Option<&str>) -> Result<()> {
    let storage = Arc::new(LocalStorage::new(&config.storage.root)?);
    let item = storage
        .get_item(item_id)
        .await?
        .with_context(|| format!("source item {} not found", item_id))?;
    let source = SourceRef {
        item_id: item.id.clone(),
        parent_id: item.parent_id.clone(),
        name: item.name.clone(),
        mime_type: item.mime_type.clone(),
    };
    let language = lang.unwrap_or(&config.pipeline.target_language);
    let template = template.unwrap_or(&config.pipeline.template);

    let resolver = Arc::new(ArtifactResolver::new(storage, true));
    let outcome = RepairReconciler::new(resolver)
        .adopt_legacy(&source, language, Some(template))
        .await?;
    println!("{}", serde_json::to_string(&outcome)?);
    Ok(())
}
