//! The worker loop: claim a job, gate each phase, execute, persist.
//!
//! One [`Worker`] processes one job at a time. Several workers, in one
//! process or many, may share a database; the queue's lease protocol keeps
//! them from processing the same job concurrently.
//!
//! Per claimed job:
//!
//! 1. reset its step records and start a heartbeat task;
//! 2. build the context: source item, legacy adoption, pending callback
//!    (persisted as the transformation before any gate runs);
//! 3. load the artifact state and record the derived phase needs;
//! 4. for each configured phase, evaluate its gate, record the decision,
//!    then skip or execute; reload the artifact state after every executed
//!    phase;
//! 5. complete the job with a summary of what was produced.
//!
//! A provider that accepts a request asynchronously leaves the job parked
//! until its callback arrives or the dispatch window expires.
//!
//! Phase errors fail the step and the job. Errors raised while building
//! the context are orchestrator errors: they are traced, the job is
//! failed, and the loop moves on to the next poll.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{json, Map, Value};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};

use docflow_core::chunk::content_hash;
use docflow_core::error::{error_code, PipelineError};
use docflow_core::facets::FacetSchemaCache;
use docflow_core::frontmatter::{self, FrontmatterAnalysis, PhaseNeeds, ValidationReport};
use docflow_core::gate::{self, ExtractGateInput, IngestGateInput, PhaseDecision, TransformGateInput};
use docflow_core::models::{
    trace_names, Job, JobError, Phase, SourceRef, Step, StepError, StepStatus, TraceEvent,
};
use docflow_core::naming::ArtifactKind;
use docflow_core::repair::{AdoptionOutcome, RepairCheck, RepairReconciler};
use docflow_core::resolver::{ArtifactLocation, ArtifactResolver, ExistsOptions, ResolvedArtifact};
use docflow_core::startability::{self, Startability, DISPATCH_WINDOW_MS};

use crate::callback::{new_secret, CallbackChannel, CallbackPayload};
use crate::config::Config;
use crate::index::{IngestDocument, IngestSink};
use crate::provider::{
    CallbackTarget, DocumentProvider, ExtractRequest, ProviderOutcome, TransformRequest,
};
use crate::queue::{Claim, JobQueue};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Template used when a job does not name one.
    pub default_template: String,
    /// Callback URL pattern; `{id}` is replaced with the job id.
    pub callback_url: Option<String>,
}

impl WorkerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            poll_interval: config.queue.poll_interval(),
            heartbeat_interval: config.queue.heartbeat_interval(),
            default_template: config.pipeline.template.clone(),
            callback_url: config.provider.callback_url.clone(),
        }
    }
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            heartbeat_interval: Duration::from_millis(5_000),
            default_template: "default".to_string(),
            callback_url: None,
        }
    }
}

/// What one [`Worker::run_once`] call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was claimable.
    Idle,
    Completed(String),
    Failed(String),
    /// Waiting for an asynchronous provider.
    Parked(String),
    /// Another worker took the job over; processing stopped.
    LeaseLost(String),
}

pub struct Worker {
    queue: JobQueue,
    callbacks: CallbackChannel,
    resolver: Arc<ArtifactResolver>,
    reconciler: RepairReconciler,
    provider: Arc<dyn DocumentProvider>,
    sink: Arc<dyn IngestSink>,
    schemas: Arc<FacetSchemaCache>,
    options: WorkerOptions,
}

/// Everything known about a claimed job before its phases run.
struct JobContext {
    job: Job,
    process_id: String,
    source: SourceRef,
    language: String,
    template: String,
    callback: Option<CallbackPayload>,
}

impl JobContext {
    fn callback_completed(&self) -> bool {
        self.callback.as_ref().is_some_and(CallbackPayload::is_completed)
    }

    fn use_cache(&self) -> bool {
        self.job.correlation.options.use_cache
    }
}

/// Observable artifacts for a job's source, re-read after every phase.
struct ArtifactState {
    transcript: Option<ResolvedArtifact>,
    transformation: Option<ResolvedArtifact>,
    analysis: Option<FrontmatterAnalysis>,
    report: ValidationReport,
    repair: RepairCheck,
    needs: PhaseNeeds,
    transcript_gate_exists: bool,
}

impl ArtifactState {
    /// The artifact ingestion would index: the transformation when there is one.
    fn current(&self) -> Option<&ResolvedArtifact> {
        self.transformation.as_ref().or(self.transcript.as_ref())
    }

    fn transcript_has_core(&self) -> bool {
        self.transcript
            .as_ref()
            .and_then(|t| t.content.as_deref())
            .map(|text| {
                let analysis = frontmatter::analyze(text);
                analysis.has_frontmatter && frontmatter::has_core(&analysis.meta)
            })
            .unwrap_or(false)
    }
}

/// Result of executing one phase.
enum PhaseRun {
    Done(Map<String, Value>),
    /// The provider took the request; the result arrives by callback.
    Accepted,
    /// A previous dispatch is still inside the window.
    AlreadyStarted { retry_at: chrono::DateTime<Utc> },
}

enum Dispatch {
    Ready(Option<CallbackTarget>),
    Refused { retry_at: chrono::DateTime<Utc> },
}

impl Worker {
    pub fn new(
        queue: JobQueue,
        resolver: Arc<ArtifactResolver>,
        provider: Arc<dyn DocumentProvider>,
        sink: Arc<dyn IngestSink>,
        schemas: Arc<FacetSchemaCache>,
        options: WorkerOptions,
    ) -> Self {
        Self {
            callbacks: CallbackChannel::new(queue.clone()),
            reconciler: RepairReconciler::new(resolver.clone()),
            queue,
            resolver,
            provider,
            sink,
            schemas,
            options,
        }
    }

    /// Poll until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(provider = self.provider.name(), "worker started");
        while !cancel.is_cancelled() {
            let idle = match self.run_once().await {
                Ok(RunOutcome::Idle) => true,
                Ok(outcome) => {
                    debug!(?outcome, "job processed");
                    false
                }
                Err(e) => {
                    error!(error = %format!("{:#}", e), "worker poll failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }
        info!("worker stopped");
        Ok(())
    }

    /// Claim and process at most one job.
    pub async fn run_once(&self) -> Result<RunOutcome> {
        self.queue.fail_exhausted(Utc::now()).await?;
        let Some(claim) = self.queue.claim().await? else {
            return Ok(RunOutcome::Idle);
        };
        let job_id = claim.job.id.clone();
        let process_id = claim.process_id().to_string();

        match self.process(claim).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let code = error_code(&err);
                let message = format!("{:#}", err);
                error!(job_id = %job_id, code, error = %message, "orchestrator error");
                self.queue
                    .append_trace(
                        &job_id,
                        &TraceEvent::new(
                            trace_names::ORCHESTRATOR_ERROR,
                            json!({ "code": code, "message": message }),
                        ),
                    )
                    .await?;
                let error = JobError {
                    code: code.to_string(),
                    message,
                };
                if self.queue.fail(&job_id, Some(&process_id), &error).await? {
                    Ok(RunOutcome::Failed(job_id))
                } else {
                    Ok(RunOutcome::LeaseLost(job_id))
                }
            }
        }
    }

    async fn process(&self, claim: Claim) -> Result<RunOutcome> {
        let process_id = claim.process_id().to_string();
        let job = claim.job;
        let job_id = job.id.clone();
        info!(job_id = %job_id, source = %job.correlation.source.name, kind = ?claim.kind, "processing job");

        let heartbeat = Heartbeat::spawn(
            self.queue.clone(),
            &job_id,
            &process_id,
            self.options.heartbeat_interval,
        );
        if !self.queue.reset_steps(&job_id, &process_id).await? {
            return Ok(RunOutcome::LeaseLost(job_id));
        }

        let ctx = self.build_context(job, process_id).await?;
        if let Some(payload) = ctx.callback.as_ref().filter(|p| !p.is_completed()) {
            let error = JobError {
                code: "provider_error".to_string(),
                message: payload
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("provider reported status '{}'", payload.status)),
            };
            self.queue.append_log(&job_id, "error", &error.message).await?;
            return Ok(if self.queue.fail(&job_id, Some(&ctx.process_id), &error).await? {
                RunOutcome::Failed(job_id)
            } else {
                RunOutcome::LeaseLost(job_id)
            });
        }

        let mut state = self.load_state(&ctx).await?;
        self.queue
            .append_trace(
                &job_id,
                &TraceEvent::new(trace_names::PHASE_NEEDS, json!({
                    "needs": state.needs,
                    "reasons": state.report.reasons,
                })),
            )
            .await?;

        let mut pages: Option<u32> = None;
        let mut chunks: Option<usize> = None;

        for phase in ctx.job.phases() {
            if heartbeat.is_lost() {
                return Ok(RunOutcome::LeaseLost(job_id));
            }
            let decision = self.decide(phase, &ctx, &state).await?;
            self.queue
                .append_trace(
                    &job_id,
                    &TraceEvent::new(trace_names::GATE_DECISION, decision.trace_attributes()),
                )
                .await?;
            info!(
                job_id = %job_id,
                phase = %phase,
                action = decision.action.as_str(),
                reason = %decision.reason,
                "gate decision"
            );

            let mut step = Step::pending(phase);
            step.details.insert("action".into(), json!(decision.action.as_str()));
            step.details.insert("reason".into(), json!(decision.reason.as_str()));

            if !decision.should_run() {
                step.details.insert("skipped".into(), json!(true));
                step.transition(StepStatus::Completed, Utc::now())?;
                if !self.queue.update_step(&job_id, Some(&ctx.process_id), &step).await? {
                    return Ok(RunOutcome::LeaseLost(job_id));
                }
                continue;
            }

            step.transition(StepStatus::Running, Utc::now())?;
            if !self.queue.update_step(&job_id, Some(&ctx.process_id), &step).await? {
                return Ok(RunOutcome::LeaseLost(job_id));
            }

            let run = match phase {
                Phase::Extract => self.run_extract(&ctx, &mut pages).await,
                Phase::Transform => self.run_transform(&ctx, &state, pages).await,
                Phase::Ingest => self.run_ingest(&ctx, &state, &mut chunks).await,
            };

            match run {
                Ok(PhaseRun::Done(details)) => {
                    step.details.extend(details);
                    step.transition(StepStatus::Completed, Utc::now())?;
                    if !self.queue.update_step(&job_id, Some(&ctx.process_id), &step).await? {
                        return Ok(RunOutcome::LeaseLost(job_id));
                    }
                    state = self.load_state(&ctx).await?;
                }
                Ok(PhaseRun::Accepted) => {
                    let until = Utc::now() + ChronoDuration::milliseconds(DISPATCH_WINDOW_MS);
                    self.queue
                        .append_trace(
                            &job_id,
                            &TraceEvent::new(
                                trace_names::REQUEST_ACKNOWLEDGED,
                                json!({ "phase": phase.as_str(), "provider": self.provider.name() }),
                            ),
                        )
                        .await?;
                    if !self.queue.park(&job_id, &ctx.process_id, until).await? {
                        return Ok(RunOutcome::LeaseLost(job_id));
                    }
                    info!(job_id = %job_id, phase = %phase, "provider accepted request, job parked");
                    return Ok(RunOutcome::Parked(job_id));
                }
                Ok(PhaseRun::AlreadyStarted { retry_at }) => {
                    self.queue
                        .append_log(
                            &job_id,
                            "info",
                            &format!("{} already dispatched, waiting until {}", phase, retry_at),
                        )
                        .await?;
                    if !self.queue.park(&job_id, &ctx.process_id, retry_at).await? {
                        return Ok(RunOutcome::LeaseLost(job_id));
                    }
                    return Ok(RunOutcome::Parked(job_id));
                }
                Err(err) => {
                    let code = error_code(&err);
                    let message = format!("{:#}", err);
                    warn!(job_id = %job_id, phase = %phase, code, error = %message, "phase failed");
                    step.error = Some(StepError {
                        code: code.to_string(),
                        message: message.clone(),
                        at: Utc::now(),
                    });
                    step.transition(StepStatus::Failed, Utc::now())?;
                    if !self.queue.update_step(&job_id, Some(&ctx.process_id), &step).await? {
                        return Ok(RunOutcome::LeaseLost(job_id));
                    }
                    self.queue.append_log(&job_id, "error", &format!("{}: {}", phase, message)).await?;
                    let error = JobError {
                        code: code.to_string(),
                        message: format!("{} failed: {}", phase, message),
                    };
                    return Ok(if self.queue.fail(&job_id, Some(&ctx.process_id), &error).await? {
                        RunOutcome::Failed(job_id)
                    } else {
                        RunOutcome::LeaseLost(job_id)
                    });
                }
            }
        }

        let result = json!({
            "transcript_id": state.transcript.as_ref().map(|a| a.id.clone()),
            "transformation_id": state.transformation.as_ref().map(|a| a.id.clone()),
            "chunks": chunks,
        });
        drop(heartbeat);
        if self.queue.complete(&job_id, Some(&ctx.process_id), Some(result)).await? {
            info!(job_id = %job_id, "job completed");
            Ok(RunOutcome::Completed(job_id))
        } else {
            Ok(RunOutcome::LeaseLost(job_id))
        }
    }

    async fn build_context(&self, job: Job, process_id: String) -> Result<JobContext> {
        let mut source = job.correlation.source.clone();
        let item = self
            .resolver
            .storage()
            .get_item(&source.item_id)
            .await
            .with_context(|| format!("loading source item {}", source.item_id))?
            .ok_or_else(|| PipelineError::NotFound(format!("source item {}", source.item_id)))?;
        if source.mime_type.is_none() {
            source.mime_type = item.mime_type.clone();
        }

        let language = job.target_language().to_string();
        let template = job
            .correlation
            .options
            .template
            .clone()
            .unwrap_or_else(|| self.options.default_template.clone());

        if self.resolver.allows_legacy_fallback() {
            let outcome = self
                .reconciler
                .adopt_legacy(&source, &language, Some(&template))
                .await
                .context("adopting legacy artifact")?;
            if outcome != AdoptionOutcome::NoLegacy {
                self.queue
                    .append_trace(
                        &job.id,
                        &TraceEvent::new(trace_names::LEGACY_ADOPTION, serde_json::to_value(&outcome)?),
                    )
                    .await?;
            }
        }

        let callback = self.callbacks.take(&job.id).await?;
        if let Some(payload) = callback.as_ref().filter(|p| p.is_completed()) {
            let text = callback_artifact_text(payload)?;
            let artifact = self
                .resolver
                .write_artifact(&source, ArtifactKind::Transformation, &language, Some(&template), &text)
                .await
                .context("persisting callback result")?;
            debug!(job_id = %job.id, artifact = %artifact.id, "callback result stored");
        }

        Ok(JobContext {
            job,
            process_id,
            source,
            language,
            template,
            callback,
        })
    }

    async fn find_loaded(
        &self,
        ctx: &JobContext,
        kind: ArtifactKind,
        template: Option<&str>,
    ) -> Result<Option<ResolvedArtifact>> {
        match self.resolver.find(&ctx.source, kind, &ctx.language, template).await? {
            Some(mut artifact) => {
                self.resolver.load_content(&mut artifact).await?;
                Ok(Some(artifact))
            }
            None => Ok(None),
        }
    }

    async fn load_state(&self, ctx: &JobContext) -> Result<ArtifactState> {
        let mut transformation = self
            .find_loaded(ctx, ArtifactKind::Transformation, Some(&ctx.template))
            .await?;
        let mut transcript = self.find_loaded(ctx, ArtifactKind::Transcript, None).await?;

        if transcript.is_none() && transformation.is_none() && self.resolver.allows_legacy_fallback() {
            let legacy = self
                .resolver
                .resolve(&ctx.source, &ctx.language, ArtifactKind::Transcript, None, true)
                .await?
                .filter(|a| a.location == ArtifactLocation::LegacySibling);
            match legacy {
                Some(a) if a.kind == ArtifactKind::Transformation => transformation = Some(a),
                other => transcript = other,
            }
        }

        let current = transformation.as_ref().or(transcript.as_ref());
        let analysis = current
            .and_then(|a| a.content.as_deref())
            .map(frontmatter::analyze);
        let empty = Map::new();
        let report = frontmatter::validate(
            analysis.as_ref().map(|a| &a.meta).unwrap_or(&empty),
            ctx.job.user_email.as_deref(),
            ctx.job.library_id.as_deref(),
            &self.schemas,
        )
        .await;
        let needs = PhaseNeeds::derive(
            current.is_some(),
            analysis.as_ref().is_some_and(|a| a.has_frontmatter),
            report.frontmatter_valid,
        );
        let repair = match &transformation {
            Some(artifact) => RepairReconciler::check_artifact(artifact),
            None => RepairCheck {
                exists: false,
                has_core: false,
                needs_repair: false,
                artifact_id: None,
            },
        };
        let transcript_gate_exists = transcript.is_some()
            || self
                .resolver
                .exists(
                    &ctx.source,
                    ArtifactKind::Transcript,
                    &ctx.language,
                    ExistsOptions {
                        include_supersets: true,
                        template_name: None,
                    },
                )
                .await?;

        Ok(ArtifactState {
            transcript,
            transformation,
            analysis,
            report,
            repair,
            needs,
            transcript_gate_exists,
        })
    }

    async fn decide(&self, phase: Phase, ctx: &JobContext, state: &ArtifactState) -> Result<PhaseDecision> {
        let policy = ctx.job.policies.get(phase);
        let decision = match phase {
            Phase::Extract => gate::decide_extract(&ExtractGateInput {
                is_callback_completed: ctx.callback_completed(),
                policy,
                gate_exists: ctx.use_cache() && state.transcript_gate_exists,
            }),
            Phase::Transform => gate::decide_transform(&TransformGateInput {
                is_callback_completed: ctx.callback_completed(),
                is_frontmatter_complete_from_body: match &ctx.callback {
                    Some(payload) => payload.has_core_frontmatter(),
                    None => state.transcript_has_core(),
                },
                needs_repair: state.repair.needs_repair,
                policy,
                gate_exists: ctx.use_cache() && state.repair.exists && state.report.frontmatter_valid,
            }),
            Phase::Ingest => {
                let already_ingested = match (ctx.use_cache(), state.current()) {
                    (true, Some(artifact)) => {
                        let hash = content_hash(artifact.content.as_deref().unwrap_or_default());
                        self.sink.is_ingested(&ctx.source.item_id, &hash).await?
                    }
                    _ => false,
                };
                gate::decide_ingest(&IngestGateInput {
                    policy,
                    has_markdown: state.current().is_some(),
                    frontmatter_valid: state.needs.need_ingest,
                    already_ingested,
                })
            }
        };
        Ok(decision)
    }

    /// Check the dispatch window and issue a callback secret.
    async fn prepare_dispatch(&self, ctx: &JobContext) -> Result<Dispatch> {
        let job = self
            .queue
            .get(&ctx.job.id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("job {}", ctx.job.id)))?;

        if let Startability::AlreadyStarted { acknowledged_at } = startability::can_start(&job, Utc::now()) {
            let answered = job
                .latest_trace(trace_names::CALLBACK_RECEIVED)
                .is_some_and(|cb| cb.at >= acknowledged_at);
            if !answered && !startability::bypasses_window(&job) {
                return Ok(Dispatch::Refused {
                    retry_at: acknowledged_at + ChronoDuration::milliseconds(DISPATCH_WINDOW_MS),
                });
            }
        }

        let Some(pattern) = &self.options.callback_url else {
            return Ok(Dispatch::Ready(None));
        };
        let (token, hash) = new_secret();
        if !self.queue.set_callback_secret(&job.id, &ctx.process_id, &hash).await? {
            anyhow::bail!("lease lost before dispatch");
        }
        Ok(Dispatch::Ready(Some(CallbackTarget {
            url: pattern.replace("{id}", &job.id),
            token,
        })))
    }

    async fn run_extract(&self, ctx: &JobContext, pages: &mut Option<u32>) -> Result<PhaseRun> {
        let callback = match self.prepare_dispatch(ctx).await? {
            Dispatch::Ready(callback) => callback,
            Dispatch::Refused { retry_at } => return Ok(PhaseRun::AlreadyStarted { retry_at }),
        };
        let mime_type = ctx.source.mime_type.as_deref().ok_or_else(|| {
            PipelineError::Validation(format!("no content type known for {}", ctx.source.name))
        })?;
        let bytes = self.resolver.storage().get_binary(&ctx.source.item_id).await?;

        let outcome = self
            .provider
            .extract(&ExtractRequest {
                source: &ctx.source,
                bytes: &bytes,
                mime_type,
                target_language: &ctx.language,
                callback,
            })
            .await?;
        let transcript = match outcome {
            ProviderOutcome::Completed(t) => t,
            ProviderOutcome::Accepted => return Ok(PhaseRun::Accepted),
        };
        *pages = transcript.pages;

        let artifact = self
            .resolver
            .write_artifact(&ctx.source, ArtifactKind::Transcript, &ctx.language, None, &transcript.markdown)
            .await?;
        let mut details = Map::new();
        details.insert("artifact_id".into(), json!(artifact.id));
        details.insert("pages".into(), json!(transcript.pages));
        Ok(PhaseRun::Done(details))
    }

    async fn run_transform(&self, ctx: &JobContext, state: &ArtifactState, pages: Option<u32>) -> Result<PhaseRun> {
        let source_text = state
            .transcript
            .as_ref()
            .or(state.transformation.as_ref())
            .and_then(|a| a.content.as_deref())
            .ok_or_else(|| {
                PipelineError::Validation(format!("no transcript to transform for {}", ctx.source.name))
            })?;
        let body = frontmatter::analyze(source_text).body;

        let callback = match self.prepare_dispatch(ctx).await? {
            Dispatch::Ready(callback) => callback,
            Dispatch::Refused { retry_at } => return Ok(PhaseRun::AlreadyStarted { retry_at }),
        };
        let outcome = self
            .provider
            .transform(&TransformRequest {
                source: &ctx.source,
                transcript: &body,
                template: &ctx.template,
                target_language: &ctx.language,
                pages,
                callback,
            })
            .await?;
        let transformed = match outcome {
            ProviderOutcome::Completed(t) => t,
            ProviderOutcome::Accepted => return Ok(PhaseRun::Accepted),
        };
        if !frontmatter::has_core(&transformed.meta) {
            warn!(job_id = %ctx.job.id, "transformation lacks core frontmatter");
        }

        let artifact = self
            .resolver
            .write_artifact(
                &ctx.source,
                ArtifactKind::Transformation,
                &ctx.language,
                Some(&ctx.template),
                &transformed.render()?,
            )
            .await?;
        let mut details = Map::new();
        details.insert("artifact_id".into(), json!(artifact.id));
        details.insert("template".into(), json!(ctx.template));
        Ok(PhaseRun::Done(details))
    }

    async fn run_ingest(&self, ctx: &JobContext, state: &ArtifactState, chunks: &mut Option<usize>) -> Result<PhaseRun> {
        let artifact = state
            .current()
            .ok_or_else(|| PipelineError::Validation("nothing to ingest".to_string()))?;
        let text = artifact.content.as_deref().unwrap_or_default();
        let analysis = match &state.analysis {
            Some(a) => a.clone(),
            None => frontmatter::analyze(text),
        };
        let title = analysis
            .meta
            .get("title")
            .and_then(Value::as_str)
            .map(str::to_string);

        let written = self
            .sink
            .ingest(&IngestDocument {
                source_id: ctx.source.item_id.clone(),
                artifact_id: artifact.id.clone(),
                title,
                language: ctx.language.clone(),
                library_id: ctx.job.library_id.clone(),
                body: analysis.body,
                meta: analysis.meta,
                artifact_hash: content_hash(text),
            })
            .await?;
        *chunks = Some(written);

        let mut details = Map::new();
        details.insert("artifact_id".into(), json!(artifact.id));
        details.insert("chunks".into(), json!(written));
        Ok(PhaseRun::Done(details))
    }
}

/// Artifact text for a completed callback payload.
///
/// Metadata sent alongside the markdown wins over frontmatter embedded in it.
fn callback_artifact_text(payload: &CallbackPayload) -> Result<String> {
    if payload.meta.is_empty() {
        return Ok(payload.markdown.clone());
    }
    let body = frontmatter::analyze(&payload.markdown).body;
    frontmatter::compose(&payload.meta, &body)
}

/// Background lease refresher, stopped when dropped.
struct Heartbeat {
    lost: Arc<AtomicBool>,
    _guard: DropGuard,
}

impl Heartbeat {
    fn spawn(queue: JobQueue, job_id: &str, process_id: &str, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let lost = Arc::new(AtomicBool::new(false));
        let task_cancel = cancel.clone();
        let task_lost = lost.clone();
        let job_id = job_id.to_string();
        let process_id = process_id.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => match queue.heartbeat(&job_id, Some(&process_id)).await {
                        Ok(true) => {}
                        Ok(false) => {
                            warn!(job_id = %job_id, "lease lost");
                            task_lost.store(true, Ordering::SeqCst);
                            break;
                        }
                        Err(e) => warn!(job_id = %job_id, error = %e, "heartbeat failed"),
                    },
                }
            }
        });

        Self {
            lost,
            _guard: cancel.drop_guard(),
        }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}
