//! Bulk restart of jobs by batch, status, or type.

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use docflow_core::error::PipelineError;
use docflow_core::models::JobStatus;

use crate::queue::{JobFilter, JobQueue};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestartFilter {
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub job_type: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkRestartRequest {
    #[serde(default)]
    pub filter: RestartFilter,
    /// Must be `true`; nothing is queried otherwise.
    #[serde(default)]
    pub confirm: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RestartItem {
    pub job_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BulkRestartReport {
    pub matched: usize,
    pub restarted: usize,
    pub failed: usize,
    /// Distinct batch ids among the matched jobs.
    pub batches: Vec<String>,
    pub items: Vec<RestartItem>,
}

/// Restart every non-archived job matching `request.filter`.
///
/// A running job whose lease is still fresh is not touched; it is reported
/// as a failed item.
pub async fn bulk_restart(queue: &JobQueue, request: &BulkRestartRequest) -> Result<BulkRestartReport> {
    if !request.confirm {
        return Err(PipelineError::BadRequest("bulk restart requires confirm: true".into()).into());
    }

    let jobs = queue
        .list(&JobFilter {
            status: request.filter.status,
            batch_id: request.filter.batch_id.clone(),
            job_type: request.filter.job_type.clone(),
            include_archived: false,
            limit: None,
        })
        .await?;

    let now = Utc::now();
    let batches: BTreeSet<String> = jobs.iter().filter_map(|j| j.batch_id.clone()).collect();
    let mut items = Vec::with_capacity(jobs.len());

    for job in &jobs {
        let live_lease = job.status == JobStatus::Running
            && job.lease().is_some_and(|l| !l.is_stale(now, queue.stale_ms()));
        if live_lease {
            items.push(RestartItem {
                job_id: job.id.clone(),
                ok: false,
                error: Some("job is running with a live lease".to_string()),
            });
            continue;
        }

        match queue.restart(&job.id).await {
            Ok(_) => items.push(RestartItem {
                job_id: job.id.clone(),
                ok: true,
                error: None,
            }),
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "restart failed");
                items.push(RestartItem {
                    job_id: job.id.clone(),
                    ok: false,
                    error: Some(e.to_string()),
                });
            }
        }
    }

    let restarted = items.iter().filter(|i| i.ok).count();
    let report = BulkRestartReport {
        matched: jobs.len(),
        restarted,
        failed: items.len() - restarted,
        batches: batches.into_iter().collect(),
        items,
    };
    info!(matched = report.matched, restarted = report.restarted, failed = report.failed, "bulk restart");
    Ok(report)
}
