//! End-to-end extraction run: list, tier, fetch detail, normalize, budget,
//! snapshot.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde_json::Value as JsonValue;
use tokio::task::JoinSet;
use tracing::{info, warn};
use uuid::Uuid;

use pulse_client::wire::{RawActivity, RawIssue};
use pulse_client::{
    drain, ApiError, ClientConfig, Direction, PageRequest, RateLimitConfig, RetryPolicy,
    TrackerClient,
};
use pulse_core::{
    Disposition, Manifest, ManifestEntry, OmissionReason, ProjectInfo, RunSummary, Snapshot,
    SnapshotPayload, Tier,
};
use pulse_store::SnapshotStore;

use crate::budget::{BudgetConfig, Budgeter};
use crate::normalize::Normalizer;
use crate::{
    ExtractConfig, ProjectRegistry, TierPolicy, ACTIVITY_FIELDS, DETAIL_FIELDS, DIGEST_FIELDS,
    LISTING_FIELDS,
};

pub struct ExtractionPipeline {
    config: ExtractConfig,
    tier_policy: TierPolicy,
    client: TrackerClient,
    store: SnapshotStore,
    cancel: Arc<AtomicBool>,
}

impl ExtractionPipeline {
    pub fn new(config: ExtractConfig, tier_policy: TierPolicy) -> Result<Self> {
        let client = TrackerClient::new(ClientConfig {
            base_url: config.base_url.clone(),
            token: config.token.clone(),
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            rate: RateLimitConfig {
                concurrency: config.concurrency_limit,
                ..RateLimitConfig::default()
            },
            retry: RetryPolicy {
                max_attempts: config.max_retry_attempts,
                base_delay: Duration::from_millis(config.backoff_base_ms),
                ..RetryPolicy::default()
            },
        })?;
        let store = SnapshotStore::new(config.snapshots_dir.clone());
        Ok(Self {
            config,
            tier_policy,
            client,
            store,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Cooperative cancellation handle. Setting the flag makes the run stop
    /// at the next stage boundary without writing a partial snapshot.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.load(AtomicOrdering::Relaxed) {
            bail!("extraction cancelled before completion");
        }
        Ok(())
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        info!(%run_id, project_id = %self.config.project_id, "starting extraction run");

        let project = self
            .client
            .project(&self.config.project_id)
            .await
            .context("fetching project details")?;
        let project = ProjectInfo {
            id: project.id,
            name: project.name,
            short_name: project.short_name,
        };

        let raw_sprints = self
            .client
            .sprints(&self.config.project_id)
            .await
            .context("fetching sprints")?;

        self.check_cancelled()?;

        let listing_source = self.client.issues(&self.config.project_id, LISTING_FIELDS);
        let listing = drain(
            &listing_source,
            PageRequest::Offset {
                skip: 0,
                top: self.config.page_size,
            },
        )
        .await
        .context("listing project entities")?;
        let listed_entities = listing.len();
        info!(listed_entities, "listing sweep complete");

        let (active_ids, closed_ids) = partition_by_tier(&self.tier_policy, &listing);

        self.check_cancelled()?;

        let mut fetch_entries: Vec<ManifestEntry> = Vec::new();
        let mut raw_active: Vec<(RawIssue, Vec<RawActivity>)> = Vec::new();
        let mut raw_closed: Vec<RawIssue> = Vec::new();

        let mut detail_tasks = JoinSet::new();
        for id in active_ids {
            let client = self.client.clone();
            let top = self.config.activity_page_size;
            detail_tasks.spawn(async move {
                let result = fetch_active_detail(&client, &id, top).await;
                (id, result)
            });
        }
        while let Some(joined) = detail_tasks.join_next().await {
            // Bailing here drops the set and aborts the remaining fetches.
            self.check_cancelled()?;
            let (id, result) = joined.context("joining detail fetch task")?;
            match result {
                Ok(detail) => raw_active.push(detail),
                Err(err) => record_fetch_failure(&mut fetch_entries, &id, err)?,
            }
        }

        self.check_cancelled()?;

        let mut digest_tasks = JoinSet::new();
        for id in closed_ids {
            let client = self.client.clone();
            digest_tasks.spawn(async move {
                let result = client.issue_detail(&id, DIGEST_FIELDS).await;
                (id, result)
            });
        }
        while let Some(joined) = digest_tasks.join_next().await {
            self.check_cancelled()?;
            let (id, result) = joined.context("joining digest fetch task")?;
            match result {
                Ok(issue) => raw_closed.push(issue),
                Err(err) => record_fetch_failure(&mut fetch_entries, &id, err)?,
            }
        }

        self.check_cancelled()?;

        let mut normalizer = Normalizer::new(self.config.sentinel_cutoff());
        let active: Vec<_> = raw_active
            .iter()
            .map(|(issue, activities)| normalizer.record(issue, activities))
            .collect();
        let closed: Vec<_> = raw_closed
            .iter()
            .map(|issue| {
                let record = normalizer.record(issue, &[]);
                normalizer.digest(&record)
            })
            .collect();
        let sprints: Vec<_> = raw_sprints
            .iter()
            .map(|s| normalizer.sprint("sprint", s))
            .collect();

        // Everything serialized around the entity lists is reserved off the
        // budget before any record is admitted.
        let envelope = serde_json::to_vec(&SnapshotPayload {
            project: project.clone(),
            active: Vec::new(),
            closed: Vec::new(),
            sprints: sprints.clone(),
        })
        .map(|v| v.len())
        .unwrap_or(0);

        let budgeter = Budgeter::new(BudgetConfig {
            byte_budget: self.config.byte_budget,
            active_share: self.config.active_share,
        });
        let outcome = budgeter.assemble(active, closed, envelope);

        let mut manifest = Manifest {
            entries: fetch_entries,
            warnings: normalizer.take_warnings(),
        };
        manifest.entries.extend(outcome.entries);

        let truncated_entities = manifest.count(Disposition::Truncated);
        let omitted_entities = manifest.count(Disposition::Omitted);
        let warnings = manifest.warnings.len();
        let active_entities = outcome.active.len();
        let closed_entities = outcome.closed.len();
        let payload_bytes = outcome.payload_bytes;

        let snapshot = Snapshot {
            extracted_at: Utc::now(),
            payload: SnapshotPayload {
                project,
                active: outcome.active,
                closed: outcome.closed,
                sprints,
            },
            manifest,
        };
        let stored = self.store.write(&snapshot).await?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            listed_entities,
            active_entities,
            closed_entities,
            truncated_entities,
            omitted_entities,
            warnings,
            payload_bytes,
            snapshot_path: stored.path.display().to_string(),
        };
        info!(
            %run_id,
            active_entities,
            closed_entities,
            omitted_entities,
            payload_bytes,
            "extraction run complete"
        );
        Ok(summary)
    }
}

/// Only a 404 is tolerated: the entity vanished between listing and detail
/// fetch, so it is marked omitted and the run continues. Every other failure
/// has already exhausted its retries, and a partial snapshot would corrupt
/// the next delta comparison, so the run aborts.
fn record_fetch_failure(
    entries: &mut Vec<ManifestEntry>,
    entity_id: &str,
    err: ApiError,
) -> Result<()> {
    match err {
        ApiError::NotFound { .. } => {
            warn!(entity_id, "entity disappeared between listing and detail fetch");
            entries.push(ManifestEntry::omitted(
                entity_id,
                OmissionReason::FetchError,
                "not found at detail fetch",
            ));
            Ok(())
        }
        ApiError::Auth { .. } => Err(err).context("authentication rejected"),
        other => Err(other).with_context(|| format!("fetching entity {entity_id}")),
    }
}

async fn fetch_active_detail(
    client: &TrackerClient,
    issue_id: &str,
    activity_top: usize,
) -> Result<(RawIssue, Vec<RawActivity>), ApiError> {
    let issue = client.issue_detail(issue_id, DETAIL_FIELDS).await?;
    let source = client.activities(issue_id, ACTIVITY_FIELDS);
    let activities = drain(
        &source,
        PageRequest::Cursor {
            cursor: None,
            direction: Direction::Forward,
            top: activity_top,
        },
    )
    .await?;
    Ok((issue, activities))
}

/// Reads the workflow state straight off the listing payload; the full
/// normalizer only runs on detail responses.
fn listing_state(raw: &RawIssue) -> Option<&str> {
    raw.custom_fields
        .iter()
        .find(|f| f.name.eq_ignore_ascii_case("State") || f.name.eq_ignore_ascii_case("Stage"))
        .and_then(|f| f.value.get("name").and_then(JsonValue::as_str))
}

/// Tier is decided once here; a state change mid-run does not move an
/// entity between tiers.
fn partition_by_tier(policy: &TierPolicy, listing: &[RawIssue]) -> (Vec<String>, Vec<String>) {
    let mut active = Vec::new();
    let mut closed = Vec::new();
    for issue in listing {
        let tier = listing_state(issue)
            .map(|state| policy.tier(state))
            .unwrap_or(Tier::Active);
        match tier {
            Tier::Active => active.push(issue.id.clone()),
            Tier::Closed => closed.push(issue.id.clone()),
        }
    }
    (active, closed)
}

pub async fn run_extract_from_env() -> Result<RunSummary> {
    let config = ExtractConfig::from_env();
    let tier_policy = match ProjectRegistry::load(&config.workspace_root).await {
        Ok(registry) => registry
            .entry(&config.project_id)
            .filter(|entry| !entry.closed_states.is_empty())
            .map(|entry| TierPolicy::new(&entry.closed_states))
            .unwrap_or_default(),
        Err(err) => {
            warn!(error = %err, "no project registry, using default closed states");
            TierPolicy::default()
        }
    };
    let pipeline = ExtractionPipeline::new(config, tier_policy)?;
    pipeline.run_once().await
}
