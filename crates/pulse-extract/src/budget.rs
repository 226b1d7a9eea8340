//! Byte budgeting for the assembled payload. Degradation is staged: active
//! history is truncated first, then closed digests are dropped, and whole
//! active entities go only when nothing else fits.

use std::cmp::Ordering;

use serde::Serialize;
use tracing::debug;

use pulse_core::{
    priority_then_recency, EntityDigest, EntityRecord, ManifestEntry, OmissionReason,
};

#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub byte_budget: usize,
    /// Fraction of the budget reserved for the active tier, clamped to
    /// 0.70..=0.80.
    pub active_share: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            byte_budget: 2_000_000,
            active_share: 0.75,
        }
    }
}

impl BudgetConfig {
    pub fn active_cap(&self, effective_budget: usize) -> usize {
        let share = self.active_share.clamp(0.70, 0.80);
        (effective_budget as f64 * share) as usize
    }
}

/// Orders records for degradation; entities sorted `Less` degrade first.
pub trait TruncationOrder: Send + Sync {
    fn compare(&self, a: &EntityRecord, b: &EntityRecord) -> Ordering;
}

/// Default order: lowest priority first, then least recently updated.
#[derive(Default)]
pub struct PriorityThenRecency;

impl TruncationOrder for PriorityThenRecency {
    fn compare(&self, a: &EntityRecord, b: &EntityRecord) -> Ordering {
        priority_then_recency(a, b)
    }
}

pub struct BudgetOutcome {
    pub active: Vec<EntityRecord>,
    pub closed: Vec<EntityDigest>,
    pub entries: Vec<ManifestEntry>,
    pub payload_bytes: usize,
}

pub struct Budgeter {
    config: BudgetConfig,
    order: Box<dyn TruncationOrder>,
}

fn record_bytes<T: Serialize>(value: &T) -> usize {
    serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0)
}

/// Serialized size plus one byte for the array separator the element costs
/// once it joins the payload.
fn element_cost<T: Serialize>(value: &T) -> usize {
    record_bytes(value) + 1
}

impl Budgeter {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            order: Box::<PriorityThenRecency>::default(),
        }
    }

    pub fn with_order(mut self, order: Box<dyn TruncationOrder>) -> Self {
        self.order = order;
        self
    }

    /// Fits actives and closed digests into the byte budget. Every entity
    /// that entered assembly comes out with a manifest entry.
    ///
    /// `envelope_bytes` is the serialized size of the payload with both
    /// entity lists empty; it is reserved up front so the assembled payload
    /// stays within the budget once project, sprints, and container keys
    /// are serialized around the records.
    pub fn assemble(
        &self,
        mut active: Vec<EntityRecord>,
        mut closed: Vec<EntityDigest>,
        envelope_bytes: usize,
    ) -> BudgetOutcome {
        let mut entries = Vec::new();
        let effective_budget = self.config.byte_budget.saturating_sub(envelope_bytes);

        // Ordered degrade-first; survivors are restored to id order below.
        active.sort_by(|a, b| self.order.compare(a, b));

        let mut sizes: Vec<usize> = active.iter().map(element_cost).collect();
        let mut active_total: usize = sizes.iter().sum();
        let active_cap = self.config.active_cap(effective_budget);

        // Stage 1: shed history from degrade-first records until the active
        // tier fits under its share of the budget.
        let mut truncated = vec![false; active.len()];
        let mut i = 0;
        while active_total > active_cap && i < active.len() {
            let header = active[i].header_only();
            let header_bytes = element_cost(&header);
            if header_bytes < sizes[i] {
                active_total = active_total - sizes[i] + header_bytes;
                sizes[i] = header_bytes;
                active[i] = header;
                truncated[i] = true;
            }
            i += 1;
        }

        // Stage 3 precondition check: if headers alone exceed the whole
        // budget, closed digests cannot be kept at all.
        let mut dropped_all_closed = false;
        if active_total > effective_budget {
            for digest in closed.drain(..) {
                entries.push(ManifestEntry::omitted(
                    digest.id,
                    OmissionReason::Budget,
                    "dropped to make room for active entities",
                ));
            }
            dropped_all_closed = true;

            // Stage 3: drop whole active entities, degrade-first.
            while active_total > effective_budget && !active.is_empty() {
                let record = active.remove(0);
                let bytes = sizes.remove(0);
                truncated.remove(0);
                active_total -= bytes;
                debug!(entity_id = %record.id, bytes, "dropping active entity over budget");
                entries.push(ManifestEntry::omitted(
                    record.id,
                    OmissionReason::Budget,
                    "active entity exceeded remaining budget",
                ));
            }
        }

        for (record, was_truncated) in active.iter().zip(&truncated) {
            if *was_truncated {
                entries.push(ManifestEntry::truncated(
                    record.id.clone(),
                    OmissionReason::Budget,
                    "history removed to fit byte budget",
                ));
            } else {
                entries.push(ManifestEntry::included(record.id.clone()));
            }
        }

        // Stage 2: closed digests fill whatever the active tier left over.
        if !dropped_all_closed {
            let mut remaining = effective_budget - active_total;
            let mut kept = Vec::with_capacity(closed.len());
            // Most recently resolved digests are kept longest.
            closed.sort_by(|a, b| b.resolved.cmp(&a.resolved));
            for digest in closed {
                let bytes = element_cost(&digest);
                if bytes <= remaining {
                    remaining -= bytes;
                    entries.push(ManifestEntry::included(digest.id.clone()));
                    kept.push(digest);
                } else {
                    entries.push(ManifestEntry::omitted(
                        digest.id,
                        OmissionReason::Budget,
                        "closed digest exceeded remaining budget",
                    ));
                }
            }
            closed = kept;
        }

        active.sort_by(|a, b| a.id.cmp(&b.id));
        closed.sort_by(|a, b| a.id.cmp(&b.id));
        let payload_bytes = envelope_bytes
            + sizes.iter().sum::<usize>()
            + closed.iter().map(element_cost).sum::<usize>();

        BudgetOutcome {
            active,
            closed,
            entries,
            payload_bytes,
        }
    }
}
