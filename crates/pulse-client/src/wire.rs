//! Raw wire shapes returned by the tracker REST API. These never leak past
//! the normalizer.

use serde::Deserialize;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawUser {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawCustomField {
    #[serde(default)]
    pub id: String,
    pub name: String,
    /// Shape varies by field type: object, array, scalar, or null.
    #[serde(default)]
    pub value: JsonValue,
    /// Field-definition type hint, e.g. `DateIssueCustomField`.
    #[serde(rename = "$type", default)]
    pub field_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTag {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawComment {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub author: Option<RawUser>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLinkType {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub source_to_target: Option<String>,
    #[serde(default)]
    pub target_to_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIssueRef {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub id_readable: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawLink {
    #[serde(default)]
    pub id: String,
    /// `OUTWARD`, `INWARD`, or `BOTH`.
    #[serde(default)]
    pub direction: String,
    pub link_type: Option<RawLinkType>,
    #[serde(default)]
    pub issues: Vec<RawIssueRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSprint {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub start: Option<i64>,
    #[serde(default)]
    pub finish: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPeriodValue {
    #[serde(default)]
    pub minutes: Option<i64>,
    #[serde(default)]
    pub presentation: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawWorkItem {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub duration: Option<RawPeriodValue>,
    #[serde(default)]
    pub date: Option<i64>,
    #[serde(default)]
    pub author: Option<RawUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawTimeTracking {
    #[serde(default)]
    pub work_items: Vec<RawWorkItem>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawProject {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawIssue {
    pub id: String,
    #[serde(default)]
    pub id_readable: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub updated: Option<i64>,
    #[serde(default)]
    pub resolved: Option<i64>,
    #[serde(default)]
    pub custom_fields: Vec<RawCustomField>,
    #[serde(default)]
    pub tags: Vec<RawTag>,
    #[serde(default)]
    pub comments: Vec<RawComment>,
    #[serde(default)]
    pub assignee: Option<RawUser>,
    #[serde(default)]
    pub reporter: Option<RawUser>,
    #[serde(default)]
    pub links: Vec<RawLink>,
    #[serde(default)]
    pub sprint: Option<RawSprint>,
    #[serde(default)]
    pub time_tracking: Option<RawTimeTracking>,
    #[serde(default)]
    pub project: Option<RawProject>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawActivityCategory {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawActivityField {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawActivityTarget {
    #[serde(default)]
    pub field: Option<RawActivityField>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawActivity {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub author: Option<RawUser>,
    #[serde(default)]
    pub category: Option<RawActivityCategory>,
    #[serde(default)]
    pub target: Option<RawActivityTarget>,
    #[serde(default)]
    pub added: JsonValue,
    #[serde(default)]
    pub removed: JsonValue,
}

/// Cursor-paged activity endpoint response: before/after gap cursors around
/// the returned window.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawActivityPage {
    #[serde(default)]
    pub activities: Vec<RawActivity>,
    #[serde(default)]
    pub before_cursor: Option<String>,
    #[serde(default)]
    pub after_cursor: Option<String>,
    #[serde(default)]
    pub has_before: bool,
    #[serde(default)]
    pub has_after: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAgile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub projects: Vec<RawProject>,
}
