use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::descriptor::{JobDescriptor, JobRegistry};
use crate::error::SchedulerError;
use crate::job::JobKind;

#[derive(Debug, Default)]
struct SlotCounts {
    kinds: HashMap<JobKind, usize>,
    groups: HashMap<String, usize>,
}

/// In-flight counters per job kind and per concurrency group.
///
/// Checking the ceilings and incrementing the counters happen under one
/// lock, so concurrent claimers can never push a counter past its ceiling.
/// Counters are released when the returned [`SlotPermit`] is dropped.
#[derive(Default)]
pub struct SlotTable {
    counts: Mutex<SlotCounts>,
}

impl fmt::Debug for SlotTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("SlotTable");
        match self.counts.try_lock() {
            Some(counts) => {
                debug.field("kinds", &counts.kinds);
                debug.field("groups", &counts.groups);
            }
            None => {
                debug.field("counts", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl SlotTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims one slot for the descriptor's kind and group, or returns
    /// `None` if either is at its ceiling.
    pub fn try_claim(self: &Arc<Self>, descriptor: &JobDescriptor) -> Option<SlotPermit> {
        let kind = descriptor.kind();
        let group = descriptor.concurrency_group();

        let mut counts = self.counts.lock();
        let kind_count = counts.kinds.get(kind).copied().unwrap_or(0);
        if kind_count >= descriptor.ceiling() {
            return None;
        }
        if let Some(group) = group {
            let group_count = counts.groups.get(group.name()).copied().unwrap_or(0);
            if group_count >= group.ceiling() {
                return None;
            }
            *counts.groups.entry(group.name().to_string()).or_insert(0) += 1;
        }
        *counts.kinds.entry(kind.clone()).or_insert(0) += 1;
        drop(counts);

        Some(SlotPermit {
            table: Arc::clone(self),
            kind: kind.clone(),
            group: group.map(|g| g.name().to_string()),
        })
    }

    pub fn in_flight(&self, kind: &JobKind) -> usize {
        self.counts.lock().kinds.get(kind).copied().unwrap_or(0)
    }

    pub fn group_in_flight(&self, group: &str) -> usize {
        self.counts.lock().groups.get(group).copied().unwrap_or(0)
    }

    /// Kinds that cannot take another job right now, either because the
    /// kind itself or its group is at the ceiling.
    pub fn saturated_kinds(&self, registry: &JobRegistry) -> HashSet<JobKind> {
        let counts = self.counts.lock();
        registry
            .descriptors()
            .filter(|descriptor| {
                let kind_full = counts.kinds.get(descriptor.kind()).copied().unwrap_or(0)
                    >= descriptor.ceiling();
                let group_full = descriptor.concurrency_group().is_some_and(|group| {
                    counts.groups.get(group.name()).copied().unwrap_or(0) >= group.ceiling()
                });
                kind_full || group_full
            })
            .map(|descriptor| descriptor.kind().clone())
            .collect()
    }

    /// Verifies the counters for one descriptor are within their ceilings.
    pub fn verify(&self, descriptor: &JobDescriptor) -> Result<(), SchedulerError> {
        let counts = self.counts.lock();
        let in_flight = counts.kinds.get(descriptor.kind()).copied().unwrap_or(0);
        if in_flight > descriptor.ceiling() {
            return Err(SchedulerError::ConcurrencyCeilingExceeded {
                scope: format!("kind {}", descriptor.kind()),
                in_flight,
                ceiling: descriptor.ceiling(),
            });
        }
        if let Some(group) = descriptor.concurrency_group() {
            let in_flight = counts.groups.get(group.name()).copied().unwrap_or(0);
            if in_flight > group.ceiling() {
                return Err(SchedulerError::ConcurrencyCeilingExceeded {
                    scope: format!("group {}", group.name()),
                    in_flight,
                    ceiling: group.ceiling(),
                });
            }
        }
        Ok(())
    }

    fn release(&self, kind: &JobKind, group: Option<&str>) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.kinds.get_mut(kind) {
            *count = count.saturating_sub(1);
        }
        if let Some(group) = group
            && let Some(count) = counts.groups.get_mut(group)
        {
            *count = count.saturating_sub(1);
        }
    }
}

/// One claimed slot. Dropping it releases the kind and group counters.
pub struct SlotPermit {
    table: Arc<SlotTable>,
    kind: JobKind,
    group: Option<String>,
}

impl SlotPermit {
    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }
}

impl fmt::Debug for SlotPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotPermit")
            .field("kind", &self.kind)
            .field("group", &self.group)
            .finish()
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        self.table.release(&self.kind, self.group.as_deref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ConcurrencyGroup;

    #[test]
    fn kind_ceiling_is_enforced() {
        let table = SlotTable::new();
        let descriptor = JobDescriptor::new("hash").max_concurrent(2);

        let first = table.try_claim(&descriptor).unwrap();
        let _second = table.try_claim(&descriptor).unwrap();
        assert!(table.try_claim(&descriptor).is_none());
        assert_eq!(table.in_flight(descriptor.kind()), 2);

        drop(first);
        assert_eq!(table.in_flight(descriptor.kind()), 1);
        assert!(table.try_claim(&descriptor).is_some());
    }

    #[test]
    fn group_excludes_other_kinds() {
        let table = SlotTable::new();
        let group = ConcurrencyGroup::new("anidb-udp");
        let get_file = JobDescriptor::new("get_file").in_group(group.clone());
        let add_mylist = JobDescriptor::new("add_mylist").in_group(group);

        let permit = table.try_claim(&get_file).unwrap();
        assert!(table.try_claim(&add_mylist).is_none());
        assert_eq!(table.group_in_flight("anidb-udp"), 1);

        drop(permit);
        assert!(table.try_claim(&add_mylist).is_some());
    }

    #[test]
    fn failed_group_claim_leaves_kind_untouched() {
        let table = SlotTable::new();
        let group = ConcurrencyGroup::new("g");
        let a = JobDescriptor::new("a").in_group(group.clone());
        let b = JobDescriptor::new("b").in_group(group);

        let _held = table.try_claim(&a).unwrap();
        assert!(table.try_claim(&b).is_none());
        assert_eq!(table.in_flight(b.kind()), 0);
        assert!(table.verify(&b).is_ok());
    }

    #[test]
    fn permits_release_on_drop_across_threads() {
        let table = SlotTable::new();
        let descriptor = JobDescriptor::new("hash").max_concurrent(1);
        let permit = table.try_claim(&descriptor).unwrap();

        std::thread::spawn(move || drop(permit)).join().unwrap();
        assert_eq!(table.in_flight(descriptor.kind()), 0);
    }
}
