//! Converts raw wire shapes into normalized records. All timestamp, field
//! kind, and link-direction quirks of the remote API are absorbed here.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;

use pulse_client::wire::{RawActivity, RawCustomField, RawIssue, RawLink, RawSprint, RawUser};
use pulse_core::{
    ActivityItem, Author, Comment, CustomField, CustomFieldValue, DataQualityWarning,
    EntityDigest, EntityRecord, FieldKind, LinkEdge, Priority, SprintRef, WorkItem,
};

/// Stateful normalizer for one extraction run. Field kinds are pinned on
/// first observation; warnings accumulate until drained.
pub struct Normalizer {
    sentinel_cutoff: DateTime<Utc>,
    kinds: HashMap<String, FieldKind>,
    warnings: Vec<DataQualityWarning>,
}

impl Default for Normalizer {
    fn default() -> Self {
        // Epoch-or-earlier instants are placeholder values, not real dates.
        Self::new(Utc.timestamp_millis_opt(0).single().unwrap_or_default())
    }
}

impl Normalizer {
    pub fn new(sentinel_cutoff: DateTime<Utc>) -> Self {
        Self {
            sentinel_cutoff,
            kinds: HashMap::new(),
            warnings: Vec::new(),
        }
    }

    pub fn take_warnings(&mut self) -> Vec<DataQualityWarning> {
        std::mem::take(&mut self.warnings)
    }

    fn warn(&mut self, entity_id: &str, field: Option<&str>, message: impl Into<String>) {
        self.warnings.push(DataQualityWarning {
            entity_id: entity_id.to_string(),
            field: field.map(str::to_string),
            message: message.into(),
        });
    }

    /// Epoch-millis conversion with sentinel filtering. Sentinel values are
    /// flagged and treated as absent rather than surfacing a bogus date.
    pub fn timestamp(
        &mut self,
        entity_id: &str,
        field: Option<&str>,
        millis: Option<i64>,
    ) -> Option<DateTime<Utc>> {
        let millis = millis?;
        let instant = Utc.timestamp_millis_opt(millis).single()?;
        if instant <= self.sentinel_cutoff {
            self.warn(
                entity_id,
                field,
                format!("sentinel timestamp {millis} treated as absent"),
            );
            return None;
        }
        Some(instant)
    }

    /// Normalizes one raw custom field. Returns `None` only when the field
    /// carries no representable values at all.
    pub fn field(&mut self, entity_id: &str, raw: &RawCustomField) -> Option<CustomField> {
        let observed = infer_kind(raw)?;
        let kind = match self.kinds.get(&raw.name) {
            Some(registered) if *registered != observed => {
                let registered = *registered;
                self.warn(
                    entity_id,
                    Some(&raw.name),
                    format!(
                        "field kind conflict: registered {registered:?}, observed {observed:?}"
                    ),
                );
                registered
            }
            Some(registered) => *registered,
            None => {
                self.kinds.insert(raw.name.clone(), observed);
                observed
            }
        };

        let values = self.values(entity_id, &raw.name, kind, &raw.value);
        Some(CustomField {
            name: raw.name.clone(),
            kind,
            values,
        })
    }

    fn values(
        &mut self,
        entity_id: &str,
        name: &str,
        kind: FieldKind,
        value: &JsonValue,
    ) -> Vec<CustomFieldValue> {
        if value.is_null() {
            return Vec::new();
        }
        if kind.is_multi() {
            let items = match value.as_array() {
                Some(items) => items.clone(),
                // Single value arriving for a multi-valued kind still counts.
                None => vec![value.clone()],
            };
            return items
                .iter()
                .filter_map(|item| self.single_value(entity_id, name, kind, item))
                .collect();
        }
        self.single_value(entity_id, name, kind, value)
            .into_iter()
            .collect()
    }

    fn single_value(
        &mut self,
        entity_id: &str,
        name: &str,
        kind: FieldKind,
        value: &JsonValue,
    ) -> Option<CustomFieldValue> {
        match kind {
            FieldKind::Date => {
                let millis = value.as_i64().or_else(|| {
                    value.get("value").and_then(JsonValue::as_i64)
                })?;
                let instant = self.timestamp(entity_id, Some(name), Some(millis))?;
                Some(CustomFieldValue::Date {
                    raw: millis,
                    instant,
                    display: instant.to_rfc3339(),
                })
            }
            FieldKind::Period => {
                let minutes = value.get("minutes").and_then(JsonValue::as_i64)?;
                let display = value
                    .get("presentation")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{minutes}m"));
                Some(CustomFieldValue::Period {
                    raw: minutes.to_string(),
                    minutes,
                    display,
                })
            }
            FieldKind::Numeric => {
                let number = value.as_f64()?;
                Some(CustomFieldValue::Numeric {
                    raw: value.to_string(),
                    value: number,
                    display: value.to_string(),
                })
            }
            FieldKind::UserSingle | FieldKind::UserMulti => {
                let login = value.get("login").and_then(JsonValue::as_str)?;
                let display = value
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or(login);
                Some(CustomFieldValue::User {
                    raw: login.to_string(),
                    display: display.to_string(),
                })
            }
            FieldKind::EnumSingle | FieldKind::EnumMulti => {
                let display = object_display(value)?;
                let raw = value
                    .get("id")
                    .and_then(JsonValue::as_str)
                    .unwrap_or(&display)
                    .to_string();
                Some(CustomFieldValue::Enum { raw, display })
            }
            FieldKind::Text => match value {
                JsonValue::String(text) => Some(CustomFieldValue::Text {
                    raw: text.clone(),
                    display: text.clone(),
                }),
                JsonValue::Object(_) => {
                    if let Some(text) = value.get("text").and_then(JsonValue::as_str) {
                        Some(CustomFieldValue::Text {
                            raw: text.to_string(),
                            display: text.to_string(),
                        })
                    } else {
                        // Unmapped shape: keep the value legible rather than
                        // dropping it.
                        self.warn(
                            entity_id,
                            Some(name),
                            "unmapped field value shape, kept as text",
                        );
                        let rendered = value.to_string();
                        Some(CustomFieldValue::Text {
                            raw: rendered.clone(),
                            display: rendered,
                        })
                    }
                }
                other => {
                    let rendered = other.to_string();
                    Some(CustomFieldValue::Text {
                        raw: rendered.clone(),
                        display: rendered,
                    })
                }
            },
        }
    }

    /// Builds the full Active-tier record from a detail response plus its
    /// drained activity stream.
    pub fn record(&mut self, raw: &RawIssue, activities: &[RawActivity]) -> EntityRecord {
        let entity_id = raw.id.clone();
        let fields: Vec<CustomField> = raw
            .custom_fields
            .iter()
            .filter_map(|f| self.field(&entity_id, f))
            .collect();

        let state = field_display(&fields, &["State", "Stage"])
            .unwrap_or_else(|| "Unknown".to_string());
        let priority = field_display(&fields, &["Priority"])
            .map(|d| Priority::from_display(&d))
            .unwrap_or(Priority::Unknown);

        let created = self.timestamp(&entity_id, Some("created"), raw.created);
        let updated = self.timestamp(&entity_id, Some("updated"), raw.updated);
        let resolved = self.timestamp(&entity_id, Some("resolved"), raw.resolved);

        let comments = raw
            .comments
            .iter()
            .map(|c| Comment {
                id: c.id.clone(),
                author: c.author.as_ref().map(author).unwrap_or_default(),
                created: self.timestamp(&entity_id, Some("comment"), c.created),
                text: c.text.clone(),
            })
            .collect();

        let mut activity: Vec<ActivityItem> = activities
            .iter()
            .map(|a| ActivityItem {
                category: a
                    .category
                    .as_ref()
                    .map(|c| c.id.clone())
                    .unwrap_or_default(),
                author: a.author.as_ref().map(author).unwrap_or_default(),
                timestamp: self.timestamp(&entity_id, Some("activity"), a.timestamp),
                field: a
                    .target
                    .as_ref()
                    .and_then(|t| t.field.as_ref())
                    .map(|f| f.name.clone()),
                added: flatten_change_values(&a.added),
                removed: flatten_change_values(&a.removed),
            })
            .collect();
        activity.sort_by_key(|a| a.timestamp);

        let links = canonical_links(&entity_id, &raw.links);

        let work_items: Vec<WorkItem> = raw
            .time_tracking
            .as_ref()
            .map(|tt| {
                tt.work_items
                    .iter()
                    .map(|w| WorkItem {
                        author: w.author.as_ref().map(author).unwrap_or_default(),
                        date: self.timestamp(&entity_id, Some("work item"), w.date),
                        minutes: w
                            .duration
                            .as_ref()
                            .and_then(|d| d.minutes)
                            .unwrap_or_default(),
                        text: w.text.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        let time_spent_minutes = work_items.iter().map(|w| w.minutes).sum();

        EntityRecord {
            id: entity_id.clone(),
            id_readable: raw.id_readable.clone(),
            summary: raw.summary.clone(),
            description: raw.description.clone(),
            state,
            priority,
            assignee: raw.assignee.as_ref().map(author),
            reporter: raw.reporter.as_ref().map(author),
            created,
            updated,
            resolved,
            fields,
            comments,
            activity,
            links,
            work_items,
            sprint: raw.sprint.as_ref().map(|s| self.sprint(&entity_id, s)),
            tags: raw.tags.iter().map(|t| t.name.clone()).collect(),
            time_spent_minutes,
        }
    }

    /// Reduces a record to its Closed-tier digest.
    pub fn digest(&self, record: &EntityRecord) -> EntityDigest {
        let milestones = record
            .fields
            .iter()
            .filter(|f| {
                let name = f.name.to_ascii_lowercase();
                name.contains("version") || name.contains("milestone")
            })
            .flat_map(|f| f.values.iter().map(|v| v.display().to_string()))
            .collect();
        EntityDigest {
            id: record.id.clone(),
            id_readable: record.id_readable.clone(),
            summary: record.summary.clone(),
            state: record.state.clone(),
            assignee: record.assignee.as_ref().map(|a| {
                if a.name.is_empty() {
                    a.login.clone()
                } else {
                    a.name.clone()
                }
            }),
            resolved: record.resolved,
            time_spent_minutes: record.time_spent_minutes,
            milestones,
        }
    }

    pub fn sprint(&mut self, entity_id: &str, raw: &RawSprint) -> SprintRef {
        SprintRef {
            id: raw.id.clone(),
            name: raw.name.clone(),
            goal: raw.goal.clone(),
            start: self.timestamp(entity_id, Some("sprint start"), raw.start),
            finish: self.timestamp(entity_id, Some("sprint finish"), raw.finish),
        }
    }
}

fn author(raw: &RawUser) -> Author {
    Author {
        login: raw.login.clone(),
        name: if raw.name.is_empty() {
            raw.login.clone()
        } else {
            raw.name.clone()
        },
    }
}

fn infer_kind(raw: &RawCustomField) -> Option<FieldKind> {
    if let Some(hint) = raw.field_type.as_deref() {
        if hint.contains("Date") {
            return Some(FieldKind::Date);
        }
        if hint.contains("Period") {
            return Some(FieldKind::Period);
        }
    }
    match &raw.value {
        JsonValue::Null => None,
        JsonValue::Number(_) => Some(FieldKind::Numeric),
        JsonValue::String(_) | JsonValue::Bool(_) => Some(FieldKind::Text),
        JsonValue::Object(map) => {
            if map.contains_key("minutes") {
                Some(FieldKind::Period)
            } else if map.contains_key("login") {
                Some(FieldKind::UserSingle)
            } else if ["name", "localizedName"]
                .iter()
                .any(|key| map.contains_key(*key))
            {
                Some(FieldKind::EnumSingle)
            } else {
                // No recognizable enum shape; normalized as text.
                Some(FieldKind::Text)
            }
        }
        JsonValue::Array(items) => match items.first() {
            Some(JsonValue::Object(map)) if map.contains_key("login") => {
                Some(FieldKind::UserMulti)
            }
            _ => Some(FieldKind::EnumMulti),
        },
    }
}

fn object_display(value: &JsonValue) -> Option<String> {
    for key in ["name", "localizedName", "presentation", "text"] {
        if let Some(text) = value.get(key).and_then(JsonValue::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }
    value.as_str().map(str::to_string)
}

fn field_display(fields: &[CustomField], names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .and_then(CustomField::first_display)
            .map(str::to_string)
    })
}

/// Flattens an activity `added`/`removed` payload, which may be an object,
/// an array of objects, a scalar, or null.
fn flatten_change_values(value: &JsonValue) -> Vec<String> {
    match value {
        JsonValue::Null => Vec::new(),
        JsonValue::Array(items) => items.iter().filter_map(object_display).collect(),
        JsonValue::String(text) => vec![text.clone()],
        other => object_display(other).into_iter().collect(),
    }
}

/// Deduplicates link edges across both endpoints' views. The inward and
/// outward renditions of one relationship collapse to a single edge.
fn canonical_links(this_id: &str, raw: &[RawLink]) -> Vec<LinkEdge> {
    let mut edges = BTreeSet::new();
    for link in raw {
        let Some(link_type) = link.link_type.as_ref() else {
            continue;
        };
        let outward = !link.direction.eq_ignore_ascii_case("INWARD");
        for other in &link.issues {
            edges.insert(LinkEdge::canonical(
                &link_type.name,
                outward,
                this_id,
                &other.id,
            ));
        }
    }
    edges.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_client::wire::{RawIssueRef, RawLinkType};
    use serde_json::json;

    fn raw_field(name: &str, field_type: Option<&str>, value: JsonValue) -> RawCustomField {
        serde_json::from_value(json!({
            "id": format!("field-{name}"),
            "name": name,
            "$type": field_type,
            "value": value,
        }))
        .unwrap()
    }

    #[test]
    fn enum_field_from_object_shape() {
        let mut normalizer = Normalizer::default();
        let field = normalizer
            .field("1-1", &raw_field("State", None, json!({"id": "s-1", "name": "Open"})))
            .unwrap();
        assert_eq!(field.kind, FieldKind::EnumSingle);
        assert_eq!(field.first_display(), Some("Open"));
        assert!(normalizer.take_warnings().is_empty());
    }

    #[test]
    fn user_multi_field_keeps_value_order() {
        let mut normalizer = Normalizer::default();
        let field = normalizer
            .field(
                "1-1",
                &raw_field(
                    "Reviewers",
                    None,
                    json!([
                        {"login": "ada", "name": "Ada L"},
                        {"login": "bram", "name": "Bram M"},
                    ]),
                ),
            )
            .unwrap();
        assert_eq!(field.kind, FieldKind::UserMulti);
        let displays: Vec<_> = field.values.iter().map(|v| v.display()).collect();
        assert_eq!(displays, vec!["Ada L", "Bram M"]);
    }

    #[test]
    fn period_field_extracts_minutes() {
        let mut normalizer = Normalizer::default();
        let field = normalizer
            .field(
                "1-1",
                &raw_field(
                    "Estimation",
                    Some("PeriodIssueCustomField"),
                    json!({"minutes": 90, "presentation": "1h 30m"}),
                ),
            )
            .unwrap();
        assert_eq!(field.kind, FieldKind::Period);
        assert!(matches!(
            &field.values[0],
            CustomFieldValue::Period { minutes: 90, display, .. } if display == "1h 30m"
        ));
    }

    #[test]
    fn sentinel_date_is_flagged_and_dropped() {
        let mut normalizer = Normalizer::default();
        let field = normalizer
            .field("1-1", &raw_field("Due Date", Some("DateIssueCustomField"), json!(0)))
            .unwrap();
        assert_eq!(field.kind, FieldKind::Date);
        assert!(field.values.is_empty());
        let warnings = normalizer.take_warnings();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].field.as_deref(), Some("Due Date"));
    }

    #[test]
    fn custom_sentinel_cutoff_flags_dates_at_or_before_it() {
        let cutoff = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
        let mut normalizer = Normalizer::new(cutoff);

        let stale = Utc
            .with_ymd_and_hms(1999, 6, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert_eq!(normalizer.timestamp("1-1", Some("created"), Some(stale)), None);
        assert_eq!(normalizer.take_warnings().len(), 1);

        let live = Utc
            .with_ymd_and_hms(2001, 6, 1, 0, 0, 0)
            .unwrap()
            .timestamp_millis();
        assert!(normalizer.timestamp("1-1", Some("created"), Some(live)).is_some());
        assert!(normalizer.take_warnings().is_empty());
    }

    #[test]
    fn kind_conflict_keeps_first_registration_and_warns() {
        let mut normalizer = Normalizer::default();
        normalizer
            .field("1-1", &raw_field("Sev", None, json!({"name": "High"})))
            .unwrap();
        let field = normalizer
            .field("1-2", &raw_field("Sev", None, json!(4.0)))
            .unwrap();
        assert_eq!(field.kind, FieldKind::EnumSingle);
        let warnings = normalizer.take_warnings();
        assert!(warnings[0].message.contains("kind conflict"));
    }

    #[test]
    fn unmapped_shape_falls_back_to_text_with_warning() {
        let mut normalizer = Normalizer::default();
        normalizer
            .field("1-1", &raw_field("Notes", None, json!({"text": "hello"})))
            .unwrap();
        let field = normalizer
            .field("1-2", &raw_field("Notes", None, json!({"weird": true})))
            .unwrap();
        assert_eq!(field.kind, FieldKind::Text);
        assert!(matches!(&field.values[0], CustomFieldValue::Text { .. }));
        assert_eq!(normalizer.take_warnings().len(), 1);
    }

    #[test]
    fn symmetric_links_collapse_to_one_edge() {
        let links = vec![
            RawLink {
                id: "l-1".into(),
                direction: "OUTWARD".into(),
                link_type: Some(RawLinkType {
                    name: "Blocks".into(),
                    source_to_target: Some("blocks".into()),
                    target_to_source: Some("is blocked by".into()),
                }),
                issues: vec![RawIssueRef {
                    id: "1-2".into(),
                    id_readable: "P-2".into(),
                    summary: String::new(),
                }],
            },
            // Duplicate rendition of the same relationship.
            RawLink {
                id: "l-2".into(),
                direction: "OUTWARD".into(),
                link_type: Some(RawLinkType {
                    name: "Blocks".into(),
                    source_to_target: None,
                    target_to_source: None,
                }),
                issues: vec![RawIssueRef {
                    id: "1-2".into(),
                    id_readable: "P-2".into(),
                    summary: String::new(),
                }],
            },
        ];
        let edges = canonical_links("1-1", &links);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].source_id, "1-1");
        assert_eq!(edges[0].target_id, "1-2");
    }

    #[test]
    fn record_sorts_activity_and_sums_time() {
        let issue: RawIssue = serde_json::from_value(json!({
            "id": "1-1",
            "idReadable": "P-1",
            "summary": "Fix the flaky gateway",
            "created": 1_700_000_000_000i64,
            "updated": 1_700_100_000_000i64,
            "customFields": [
                {"name": "State", "value": {"name": "In Progress"}},
                {"name": "Priority", "value": {"name": "Critical"}},
            ],
            "timeTracking": {
                "workItems": [
                    {"duration": {"minutes": 30}, "date": 1_700_000_000_000i64},
                    {"duration": {"minutes": 45}, "date": 1_700_050_000_000i64},
                ]
            },
        }))
        .unwrap();
        let activities: Vec<RawActivity> = serde_json::from_value(json!([
            {"id": "a-2", "timestamp": 1_700_090_000_000i64, "added": {"name": "In Progress"}},
            {"id": "a-1", "timestamp": 1_700_010_000_000i64, "added": {"name": "Open"}},
        ]))
        .unwrap();

        let mut normalizer = Normalizer::default();
        let record = normalizer.record(&issue, &activities);
        assert_eq!(record.state, "In Progress");
        assert_eq!(record.priority, Priority::Critical);
        assert_eq!(record.time_spent_minutes, 75);
        assert_eq!(record.activity[0].added, vec!["Open"]);
        assert_eq!(record.activity[1].added, vec!["In Progress"]);
    }

    #[test]
    fn normalizing_identical_input_twice_yields_identical_records() {
        let raw = json!({
            "id": "1-5",
            "idReadable": "P-5",
            "summary": "Stabilize the export path",
            "created": 1_700_000_000_000i64,
            "updated": 1_700_100_000_000i64,
            "assignee": {"login": "ada", "name": "Ada L"},
            "customFields": [
                {"name": "State", "value": {"name": "In Progress"}},
                {"name": "Priority", "value": {"name": "High"}},
                {"name": "Due Date", "$type": "DateIssueCustomField", "value": 1_700_500_000_000i64},
                {"name": "Fix versions", "value": [{"name": "2026.3"}]},
            ],
            "comments": [
                {"id": "c-1", "author": {"login": "bob", "name": "Bob"}, "created": 1_700_050_000_000i64, "text": "see notes"},
            ],
        });
        let raw_activities = json!([
            {"id": "a-2", "timestamp": 1_700_090_000_000i64, "added": {"name": "In Progress"}},
            {"id": "a-1", "timestamp": 1_700_010_000_000i64, "added": {"name": "Open"}},
        ]);

        let issue: RawIssue = serde_json::from_value(raw.clone()).unwrap();
        let activities: Vec<RawActivity> = serde_json::from_value(raw_activities.clone()).unwrap();
        let first = Normalizer::default().record(&issue, &activities);

        let issue_again: RawIssue = serde_json::from_value(raw).unwrap();
        let activities_again: Vec<RawActivity> =
            serde_json::from_value(raw_activities).unwrap();
        let second = Normalizer::default().record(&issue_again, &activities_again);

        assert_eq!(first, second);
    }

    #[test]
    fn digest_collects_milestones() {
        let mut normalizer = Normalizer::default();
        let issue: RawIssue = serde_json::from_value(json!({
            "id": "1-3",
            "idReadable": "P-3",
            "summary": "Ship the importer",
            "resolved": 1_700_200_000_000i64,
            "assignee": {"login": "ada", "name": "Ada L"},
            "customFields": [
                {"name": "State", "value": {"name": "Done"}},
                {"name": "Fix versions", "value": [{"name": "2026.3"}]},
            ],
        }))
        .unwrap();
        let record = normalizer.record(&issue, &[]);
        let digest = normalizer.digest(&record);
        assert_eq!(digest.state, "Done");
        assert_eq!(digest.assignee.as_deref(), Some("Ada L"));
        assert_eq!(digest.milestones, vec!["2026.3"]);
    }
}
