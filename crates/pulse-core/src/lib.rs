//! Core domain model for Tracker Pulse: normalized entities, custom field
//! values, snapshots, and manifests.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "pulse-core";

/// Detail tier assigned to an entity for one extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tier {
    Active,
    Closed,
}

/// Field kind as declared by the remote field definition. Immutable once
/// observed for a given field name within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    EnumSingle,
    EnumMulti,
    UserSingle,
    UserMulti,
    Numeric,
    Date,
    Period,
    Text,
}

impl FieldKind {
    pub fn is_multi(self) -> bool {
        matches!(self, FieldKind::EnumMulti | FieldKind::UserMulti)
    }
}

/// One normalized field value. Multi-valued fields carry an ordered sequence
/// of these, never an aggregate blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CustomFieldValue {
    Enum { raw: String, display: String },
    User { raw: String, display: String },
    Numeric { raw: String, value: f64, display: String },
    Date { raw: i64, instant: DateTime<Utc>, display: String },
    Period { raw: String, minutes: i64, display: String },
    Text { raw: String, display: String },
}

impl CustomFieldValue {
    pub fn display(&self) -> &str {
        match self {
            CustomFieldValue::Enum { display, .. }
            | CustomFieldValue::User { display, .. }
            | CustomFieldValue::Numeric { display, .. }
            | CustomFieldValue::Date { display, .. }
            | CustomFieldValue::Period { display, .. }
            | CustomFieldValue::Text { display, .. } => display,
        }
    }

    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            CustomFieldValue::Date { instant, .. } => Some(*instant),
            _ => None,
        }
    }
}

/// Named field with its resolved kind and ordered values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomField {
    pub name: String,
    pub kind: FieldKind,
    pub values: Vec<CustomFieldValue>,
}

impl CustomField {
    pub fn first_display(&self) -> Option<&str> {
        self.values.first().map(CustomFieldValue::display)
    }
}

/// Priority ladder parsed from the remote priority field. `rank()` is the
/// degradation key: higher rank is dropped or truncated earlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Minor,
    Unknown,
}

impl Priority {
    pub fn from_display(display: &str) -> Self {
        let lower = display.to_ascii_lowercase();
        if lower.contains("critical") || lower.contains("show-stopper") || lower.contains("urgent")
        {
            Priority::Critical
        } else if lower.contains("high") || lower.contains("major") {
            Priority::High
        } else if lower.contains("normal") || lower.contains("medium") {
            Priority::Normal
        } else if lower.contains("minor") || lower.contains("low") {
            Priority::Minor
        } else {
            Priority::Unknown
        }
    }

    pub fn rank(self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Minor => 3,
            Priority::Unknown => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Author {
    pub login: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub author: Author,
    pub created: Option<DateTime<Utc>>,
    pub text: String,
}

/// One activity log entry. The per-entity sequence is kept non-decreasing by
/// timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityItem {
    pub category: String,
    pub author: Author,
    pub timestamp: Option<DateTime<Utc>>,
    pub field: Option<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub author: Author,
    pub date: Option<DateTime<Utc>>,
    pub minutes: i64,
    pub text: Option<String>,
}

/// Deduplicated symmetric relationship edge with canonical direction: the
/// inward and outward views of one link resolve to the same edge.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkEdge {
    pub link_type: String,
    pub source_id: String,
    pub target_id: String,
}

impl LinkEdge {
    /// Builds the canonical edge from one endpoint's view. An inward view is
    /// flipped so both endpoints produce identical edges.
    pub fn canonical(link_type: &str, outward: bool, this_id: &str, other_id: &str) -> Self {
        let (source_id, target_id) = if outward {
            (this_id.to_string(), other_id.to_string())
        } else {
            (other_id.to_string(), this_id.to_string())
        };
        Self {
            link_type: link_type.to_string(),
            source_id,
            target_id,
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.link_type.to_ascii_lowercase().contains("block")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SprintRef {
    pub id: String,
    pub name: String,
    pub goal: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub finish: Option<DateTime<Utc>>,
}

/// Fully normalized Active-tier entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub id: String,
    pub id_readable: String,
    pub summary: String,
    pub description: Option<String>,
    pub state: String,
    pub priority: Priority,
    pub assignee: Option<Author>,
    pub reporter: Option<Author>,
    pub created: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub resolved: Option<DateTime<Utc>>,
    pub fields: Vec<CustomField>,
    pub comments: Vec<Comment>,
    pub activity: Vec<ActivityItem>,
    pub links: Vec<LinkEdge>,
    pub work_items: Vec<WorkItem>,
    pub sprint: Option<SprintRef>,
    pub tags: Vec<String>,
    pub time_spent_minutes: i64,
}

impl EntityRecord {
    pub fn field(&self, name: &str) -> Option<&CustomField> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    pub fn due_date(&self) -> Option<DateTime<Utc>> {
        self.field("Due Date")
            .and_then(|f| f.values.first())
            .and_then(CustomFieldValue::instant)
    }

    /// Copy with comment/activity/work-item history cleared. The budgeter
    /// falls back to this when the full record does not fit.
    pub fn header_only(&self) -> EntityRecord {
        let mut header = self.clone();
        header.comments.clear();
        header.activity.clear();
        header.work_items.clear();
        header
    }
}

/// Reduced Closed-tier digest: identifier, summary, final state and assignee,
/// aggregate time spent, and milestone/version tags only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDigest {
    pub id: String,
    pub id_readable: String,
    pub summary: String,
    pub state: String,
    pub assignee: Option<String>,
    pub resolved: Option<DateTime<Utc>>,
    pub time_spent_minutes: i64,
    pub milestones: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Included,
    Truncated,
    Omitted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmissionReason {
    Budget,
    FetchError,
    DataQuality,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub entity_id: String,
    pub disposition: Disposition,
    pub reason: Option<OmissionReason>,
    pub note: Option<String>,
}

impl ManifestEntry {
    pub fn included(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            disposition: Disposition::Included,
            reason: None,
            note: None,
        }
    }

    pub fn truncated(entity_id: impl Into<String>, reason: OmissionReason, note: &str) -> Self {
        Self {
            entity_id: entity_id.into(),
            disposition: Disposition::Truncated,
            reason: Some(reason),
            note: Some(note.to_string()),
        }
    }

    pub fn omitted(entity_id: impl Into<String>, reason: OmissionReason, note: &str) -> Self {
        Self {
            entity_id: entity_id.into(),
            disposition: Disposition::Omitted,
            reason: Some(reason),
            note: Some(note.to_string()),
        }
    }
}

/// Non-fatal quality flag raised during normalization (sentinel timestamps,
/// unmapped field shapes, kind conflicts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQualityWarning {
    pub entity_id: String,
    pub field: Option<String>,
    pub message: String,
}

/// Per-snapshot record of what was included, truncated, or omitted and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    pub entries: Vec<ManifestEntry>,
    pub warnings: Vec<DataQualityWarning>,
}

impl Manifest {
    pub fn count(&self, disposition: Disposition) -> usize {
        self.entries
            .iter()
            .filter(|e| e.disposition == disposition)
            .count()
    }

    pub fn omitted(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.disposition == Disposition::Omitted)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub short_name: Option<String>,
}

/// Budget-bounded normalized payload handed to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotPayload {
    pub project: ProjectInfo,
    pub active: Vec<EntityRecord>,
    pub closed: Vec<EntityDigest>,
    pub sprints: Vec<SprintRef>,
}

/// One immutable extraction result. Snapshots are append-only; "current" is
/// resolved by most-recent-timestamp lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub extracted_at: DateTime<Utc>,
    pub payload: SnapshotPayload,
    pub manifest: Manifest,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub listed_entities: usize,
    pub active_entities: usize,
    pub closed_entities: usize,
    pub truncated_entities: usize,
    pub omitted_entities: usize,
    pub warnings: usize,
    pub payload_bytes: usize,
    pub snapshot_path: String,
}

/// Orders two records by degradation key; entities sorted `Less` degrade
/// first.
pub fn priority_then_recency(a: &EntityRecord, b: &EntityRecord) -> Ordering {
    b.priority
        .rank()
        .cmp(&a.priority.rank())
        .then_with(|| match (a.updated, b.updated) {
            (Some(ua), Some(ub)) => ua.cmp(&ub),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.id.cmp(&b.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_parsing_is_lenient() {
        assert_eq!(Priority::from_display("Critical"), Priority::Critical);
        assert_eq!(Priority::from_display("Show-stopper"), Priority::Critical);
        assert_eq!(Priority::from_display("Major"), Priority::High);
        assert_eq!(Priority::from_display("medium"), Priority::Normal);
        assert_eq!(Priority::from_display("Low"), Priority::Minor);
        assert_eq!(Priority::from_display("???"), Priority::Unknown);
    }

    #[test]
    fn canonical_edges_match_from_both_endpoints() {
        let outward = LinkEdge::canonical("Depend", true, "P-1", "P-2");
        let inward = LinkEdge::canonical("Depend", false, "P-2", "P-1");
        assert_eq!(outward, inward);
        assert_eq!(outward.source_id, "P-1");
        assert_eq!(outward.target_id, "P-2");
    }

    #[test]
    fn blocking_detection_is_case_insensitive() {
        let edge = LinkEdge::canonical("Blocks", true, "P-1", "P-2");
        assert!(edge.is_blocking());
        let edge = LinkEdge::canonical("Relates", true, "P-1", "P-2");
        assert!(!edge.is_blocking());
    }
}
