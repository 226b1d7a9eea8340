//! Extraction orchestration: project registry, tier classification, field
//! normalization, byte budgeting, and the end-to-end pipeline.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tokio::fs;

use pulse_core::Tier;

pub mod budget;
pub mod normalize;
pub mod pipeline;

pub const CRATE_NAME: &str = "pulse-extract";

/// Minimal selector for the listing sweep; enough to tier an entity and
/// order degradation without pulling history.
pub const LISTING_FIELDS: &str = "id,idReadable,summary,updated,resolved,\
customFields(id,name,$type,value(id,name,localizedName,presentation))";

/// Full selector for Active-tier detail fetches.
pub const DETAIL_FIELDS: &str = "id,idReadable,summary,description,created,updated,resolved,\
customFields(id,name,$type,value(id,name,text,localizedName,presentation,minutes)),\
tags(id,name),\
comments(id,text,created,author(id,login,name,email)),\
sprint(id,name,goal,start,finish),\
assignee(id,login,name,email),\
reporter(id,login,name,email),\
links(id,direction,linkType(id,name,sourceToTarget,targetToSource),issues(id,idReadable,summary)),\
timeTracking(workItems(id,duration(minutes,presentation),date,author(id,login,name),text)),\
project(id,name,shortName)";

/// Reduced selector for Closed-tier digests: no comments, links, or history.
pub const DIGEST_FIELDS: &str = "id,idReadable,summary,created,updated,resolved,\
customFields(id,name,$type,value(id,name,localizedName,presentation,minutes)),\
assignee(id,login,name,email),\
timeTracking(workItems(id,duration(minutes)))";

pub const ACTIVITY_FIELDS: &str = "id,timestamp,author(id,login,name),category(id),\
added(id,name,text,localizedName,presentation),\
removed(id,name,text,localizedName,presentation),\
target(id,field(id,name))";

/// Per-project entries from `projects.yaml` at the workspace root.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectRegistry {
    pub projects: Vec<ProjectEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectEntry {
    pub project_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub closed_states: Vec<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ProjectRegistry {
    pub async fn load(workspace_root: &PathBuf) -> Result<Self> {
        let path = workspace_root.join("projects.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn entry(&self, project_id: &str) -> Option<&ProjectEntry> {
        self.projects
            .iter()
            .find(|p| p.enabled && p.project_id == project_id)
    }
}

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub base_url: String,
    pub token: String,
    pub project_id: String,
    pub snapshots_dir: PathBuf,
    pub page_size: usize,
    pub activity_page_size: usize,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub byte_budget: usize,
    pub active_share: f64,
    pub due_window_days: i64,
    pub max_retry_attempts: usize,
    pub backoff_base_ms: u64,
    pub concurrency_limit: usize,
    /// Epoch-millis cutoff; timestamps at or below it are placeholders.
    pub sentinel_millis: i64,
    pub workspace_root: PathBuf,
}

impl ExtractConfig {
    pub fn from_env() -> Self {
        Self {
            base_url: std::env::var("PULSE_BASE_URL")
                .unwrap_or_else(|_| "https://tracker.example.com".to_string()),
            token: std::env::var("PULSE_TOKEN").unwrap_or_default(),
            project_id: std::env::var("PULSE_PROJECT_ID").unwrap_or_else(|_| "0-9".to_string()),
            snapshots_dir: std::env::var("PULSE_SNAPSHOTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            page_size: std::env::var("PULSE_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(50),
            activity_page_size: std::env::var("PULSE_ACTIVITY_PAGE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(100),
            http_timeout_secs: std::env::var("PULSE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
            user_agent: std::env::var("PULSE_USER_AGENT")
                .unwrap_or_else(|_| "pulse-extract/0.1".to_string()),
            byte_budget: std::env::var("PULSE_BYTE_BUDGET")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2_000_000),
            active_share: std::env::var("PULSE_ACTIVE_SHARE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.75),
            due_window_days: std::env::var("PULSE_DUE_WINDOW_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            max_retry_attempts: std::env::var("PULSE_MAX_RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            backoff_base_ms: std::env::var("PULSE_BACKOFF_BASE_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            concurrency_limit: std::env::var("PULSE_CONCURRENCY_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(8),
            sentinel_millis: std::env::var("PULSE_SENTINEL_MILLIS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn sentinel_cutoff(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.sentinel_millis)
            .single()
            .unwrap_or_default()
    }
}

/// State-based tier classifier. Matching is case-insensitive; the closed
/// set is fixed for the lifetime of a run, so an entity's tier is decided
/// once at listing time.
#[derive(Debug, Clone)]
pub struct TierPolicy {
    closed: HashSet<String>,
}

impl TierPolicy {
    pub fn new<S: AsRef<str>>(closed_states: &[S]) -> Self {
        Self {
            closed: closed_states
                .iter()
                .map(|s| s.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn tier(&self, state: &str) -> Tier {
        if self.closed.contains(&state.to_ascii_lowercase()) {
            Tier::Closed
        } else {
            Tier::Active
        }
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::new(&[
            "done",
            "fixed",
            "verified",
            "closed",
            "duplicate",
            "won't fix",
            "obsolete",
        ])
    }
}
