//! Diffs two snapshots into an ordered change list. Operates on normalized
//! payload data only; raw remote responses never reach this layer.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};

use pulse_core::{LinkEdge, Snapshot};

/// One detected change, sorted for presentation by severity rank, then
/// timestamp, then entity id.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub entity_id: String,
    pub at: DateTime<Utc>,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    ApproachingDeadline {
        summary: String,
        due: DateTime<Utc>,
    },
    NewBlockingLink {
        link_type: String,
        target_id: String,
    },
    StateTransition {
        from: String,
        to: String,
    },
    Reassigned {
        from: Option<String>,
        to: Option<String>,
    },
    Created {
        summary: String,
    },
}

impl ChangeKind {
    fn severity(&self) -> u8 {
        match self {
            ChangeKind::ApproachingDeadline { .. } => 0,
            ChangeKind::NewBlockingLink { .. } => 1,
            ChangeKind::StateTransition { .. } => 2,
            ChangeKind::Reassigned { .. } => 3,
            ChangeKind::Created { .. } => 4,
        }
    }
}

/// Comparable view over an entity regardless of tier. Digests carry no
/// links or due date, so those comparisons only apply between active
/// records.
struct EntityView<'a> {
    state: &'a str,
    assignee: Option<String>,
    due: Option<DateTime<Utc>>,
}

fn index_snapshot(snapshot: &Snapshot) -> HashMap<&str, EntityView<'_>> {
    let mut map = HashMap::new();
    for record in &snapshot.payload.active {
        map.insert(
            record.id.as_str(),
            EntityView {
                state: record.state.as_str(),
                assignee: record.assignee.as_ref().map(|a| {
                    if a.name.is_empty() {
                        a.login.clone()
                    } else {
                        a.name.clone()
                    }
                }),
                due: record.due_date(),
            },
        );
    }
    for digest in &snapshot.payload.closed {
        map.insert(
            digest.id.as_str(),
            EntityView {
                state: digest.state.as_str(),
                assignee: digest.assignee.clone(),
                due: None,
            },
        );
    }
    map
}

fn edge_set(snapshot: &Snapshot) -> BTreeSet<&LinkEdge> {
    snapshot
        .payload
        .active
        .iter()
        .flat_map(|r| r.links.iter())
        .collect()
}

#[derive(Debug, Clone, Copy)]
pub struct DeltaEngine {
    due_window: Duration,
}

impl DeltaEngine {
    pub fn new(due_window_days: i64) -> Self {
        Self {
            due_window: Duration::days(due_window_days),
        }
    }

    fn due_within_window(&self, due: DateTime<Utc>, observed_at: DateTime<Utc>) -> bool {
        due > observed_at && due <= observed_at + self.due_window
    }

    /// Computes the ordered change list between two snapshots, older first.
    /// Set comparisons are order-independent.
    pub fn diff(&self, older: &Snapshot, newer: &Snapshot) -> Vec<Change> {
        let old_index = index_snapshot(older);
        let new_index = index_snapshot(newer);
        let old_edges = edge_set(older);
        // Entities the older run omitted were present, just not captured.
        // Comparing against their absence would fabricate Created entries.
        let old_omitted: HashSet<&str> = older
            .manifest
            .omitted()
            .map(|entry| entry.entity_id.as_str())
            .collect();
        let mut changes = Vec::new();

        for record in &newer.payload.active {
            if old_omitted.contains(record.id.as_str()) {
                continue;
            }
            let at = record.updated.unwrap_or(newer.extracted_at);
            match old_index.get(record.id.as_str()) {
                None => {
                    changes.push(Change {
                        entity_id: record.id.clone(),
                        at,
                        kind: ChangeKind::Created {
                            summary: record.summary.clone(),
                        },
                    });
                }
                Some(old) => {
                    if old.state != record.state {
                        changes.push(Change {
                            entity_id: record.id.clone(),
                            at,
                            kind: ChangeKind::StateTransition {
                                from: old.state.to_string(),
                                to: record.state.clone(),
                            },
                        });
                    }
                    let new_assignee = new_index
                        .get(record.id.as_str())
                        .and_then(|v| v.assignee.clone());
                    if old.assignee != new_assignee {
                        changes.push(Change {
                            entity_id: record.id.clone(),
                            at,
                            kind: ChangeKind::Reassigned {
                                from: old.assignee.clone(),
                                to: new_assignee,
                            },
                        });
                    }
                }
            }

            for edge in record.links.iter().filter(|e| e.is_blocking()) {
                // Each edge appears on both endpoint records; report it once,
                // from its source side.
                if edge.source_id == record.id && !old_edges.contains(edge) {
                    changes.push(Change {
                        entity_id: record.id.clone(),
                        at,
                        kind: ChangeKind::NewBlockingLink {
                            link_type: edge.link_type.clone(),
                            target_id: edge.target_id.clone(),
                        },
                    });
                }
            }

            if let Some(due) = record.due_date() {
                let entered_window = self.due_within_window(due, newer.extracted_at)
                    && !old_index
                        .get(record.id.as_str())
                        .and_then(|v| v.due)
                        .map(|old_due| self.due_within_window(old_due, older.extracted_at))
                        .unwrap_or(false);
                if entered_window {
                    changes.push(Change {
                        entity_id: record.id.clone(),
                        at,
                        kind: ChangeKind::ApproachingDeadline {
                            summary: record.summary.clone(),
                            due,
                        },
                    });
                }
            }
        }

        for digest in &newer.payload.closed {
            if old_omitted.contains(digest.id.as_str()) {
                continue;
            }
            let at = digest.resolved.unwrap_or(newer.extracted_at);
            match old_index.get(digest.id.as_str()) {
                None => {
                    changes.push(Change {
                        entity_id: digest.id.clone(),
                        at,
                        kind: ChangeKind::Created {
                            summary: digest.summary.clone(),
                        },
                    });
                }
                Some(old) if old.state != digest.state => {
                    changes.push(Change {
                        entity_id: digest.id.clone(),
                        at,
                        kind: ChangeKind::StateTransition {
                            from: old.state.to_string(),
                            to: digest.state.clone(),
                        },
                    });
                }
                Some(_) => {}
            }
        }

        changes.sort_by(|a, b| {
            a.kind
                .severity()
                .cmp(&b.kind.severity())
                .then_with(|| a.at.cmp(&b.at))
                .then_with(|| a.entity_id.cmp(&b.entity_id))
        });
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pulse_core::{
        Author, CustomField, CustomFieldValue, EntityRecord, FieldKind, Manifest, ManifestEntry,
        OmissionReason, Priority, ProjectInfo, SnapshotPayload,
    };

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, day, hour, 0, 0).single().unwrap()
    }

    fn record(id: &str, state: &str) -> EntityRecord {
        EntityRecord {
            id: id.to_string(),
            id_readable: id.to_string(),
            summary: format!("summary {id}"),
            description: None,
            state: state.to_string(),
            priority: Priority::Normal,
            assignee: None,
            reporter: None,
            created: Some(ts(20, 9)),
            updated: Some(ts(25, 9)),
            resolved: None,
            fields: vec![],
            comments: vec![],
            activity: vec![],
            links: vec![],
            work_items: vec![],
            sprint: None,
            tags: vec![],
            time_spent_minutes: 0,
        }
    }

    fn snapshot(day: u32, active: Vec<EntityRecord>) -> Snapshot {
        Snapshot {
            extracted_at: ts(day, 6),
            payload: SnapshotPayload {
                project: ProjectInfo {
                    id: "0-9".into(),
                    name: "Pulse".into(),
                    short_name: None,
                },
                active,
                closed: vec![],
                sprints: vec![],
            },
            manifest: Manifest::default(),
        }
    }

    #[test]
    fn single_state_transition_reports_exactly_one_change() {
        let older = snapshot(25, vec![record("1-1", "Open"), record("1-2", "Open")]);
        let newer = snapshot(26, vec![record("1-1", "In Progress"), record("1-2", "Open")]);

        let changes = DeltaEngine::new(3).diff(&older, &newer);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entity_id, "1-1");
        assert!(matches!(
            &changes[0].kind,
            ChangeKind::StateTransition { from, to } if from == "Open" && to == "In Progress"
        ));
    }

    #[test]
    fn created_and_reassigned_are_detected() {
        let older = snapshot(25, vec![record("1-1", "Open")]);
        let mut changed = record("1-1", "Open");
        changed.assignee = Some(Author {
            login: "mira".into(),
            name: "Mira K".into(),
        });
        let newer = snapshot(26, vec![changed, record("1-3", "Open")]);

        let changes = DeltaEngine::new(3).diff(&older, &newer);
        assert_eq!(changes.len(), 2);
        assert!(matches!(
            &changes[0].kind,
            ChangeKind::Reassigned { from: None, to: Some(name) } if name == "Mira K"
        ));
        assert!(matches!(&changes[1].kind, ChangeKind::Created { .. }));
    }

    #[test]
    fn entity_omitted_from_older_snapshot_is_not_reported_as_created() {
        let mut older = snapshot(25, vec![record("1-1", "Open")]);
        older.manifest.entries.push(ManifestEntry::omitted(
            "1-2",
            OmissionReason::Budget,
            "dropped to fit the byte budget",
        ));
        let newer = snapshot(26, vec![record("1-1", "Open"), record("1-2", "Open")]);

        let changes = DeltaEngine::new(3).diff(&older, &newer);
        assert!(changes.is_empty(), "unexpected changes: {changes:?}");
    }

    #[test]
    fn new_blocking_link_is_reported_once_from_source_side() {
        let older = snapshot(25, vec![record("1-1", "Open"), record("1-2", "Open")]);
        let mut source = record("1-1", "Open");
        source.links = vec![LinkEdge::canonical("Blocks", true, "1-1", "1-2")];
        let mut target = record("1-2", "Open");
        target.links = vec![LinkEdge::canonical("Blocks", false, "1-2", "1-1")];
        let newer = snapshot(26, vec![source, target]);

        let changes = DeltaEngine::new(3).diff(&older, &newer);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].entity_id, "1-1");
        assert!(matches!(
            &changes[0].kind,
            ChangeKind::NewBlockingLink { target_id, .. } if target_id == "1-2"
        ));
    }

    #[test]
    fn deadline_entering_the_window_is_reported() {
        let due = ts(27, 12);
        let due_field = CustomField {
            name: "Due Date".into(),
            kind: FieldKind::Date,
            values: vec![CustomFieldValue::Date {
                raw: due.timestamp_millis(),
                instant: due,
                display: due.to_rfc3339(),
            }],
        };

        // Due date is outside the window on day 20, inside it on day 26.
        let mut before = record("1-1", "Open");
        before.fields = vec![due_field.clone()];
        let mut after = before.clone();
        after.fields = vec![due_field];
        let older = snapshot(20, vec![before]);
        let newer = snapshot(26, vec![after]);

        let changes = DeltaEngine::new(3).diff(&older, &newer);
        assert_eq!(changes.len(), 1);
        assert!(matches!(
            &changes[0].kind,
            ChangeKind::ApproachingDeadline { due: d, .. } if *d == due
        ));
    }

    #[test]
    fn changes_are_ordered_by_severity() {
        let older = snapshot(25, vec![record("1-1", "Open")]);
        let mut transitioned = record("1-1", "Fixed");
        transitioned.links = vec![LinkEdge::canonical("Blocks", true, "1-1", "1-9")];
        let newer = snapshot(26, vec![transitioned, record("1-9", "Open")]);

        let changes = DeltaEngine::new(3).diff(&older, &newer);
        assert_eq!(changes.len(), 3);
        assert!(matches!(&changes[0].kind, ChangeKind::NewBlockingLink { .. }));
        assert!(matches!(&changes[1].kind, ChangeKind::StateTransition { .. }));
        assert!(matches!(&changes[2].kind, ChangeKind::Created { .. }));
    }
}
