use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::ConcurrencySettings;
use crate::error::SchedulerError;
use crate::job::{job_key, JobInput, JobKind, JobOutcome, KeyField};
use crate::precondition::Precondition;
use crate::runtime::CancellationToken;

/// Group shared by every job kind that talks to the UDP API.
pub const ANIDB_UDP_GROUP: &str = "anidb-udp";
/// Group shared by every job kind that talks to the HTTP API.
pub const ANIDB_HTTP_GROUP: &str = "anidb-http";

/// Ceiling used for kinds that declare no per-kind limit.
pub const UNBOUNDED: usize = usize::MAX;

/// Job kinds in the same group share one in-flight ceiling.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConcurrencyGroup {
    name: String,
    ceiling: usize,
}

impl ConcurrencyGroup {
    /// A mutually exclusive group (ceiling 1).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ceiling: 1,
        }
    }

    pub fn with_ceiling(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }
}

/// Declares that an input field takes part in the job identity key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyFieldSpec {
    pub name: String,
    pub index: Option<u32>,
}

/// Static metadata of a job kind.
#[derive(Clone, Debug)]
pub struct JobDescriptor {
    kind: JobKind,
    concurrency_group: Option<ConcurrencyGroup>,
    max_concurrent: usize,
    max_allowed_concurrent: Option<usize>,
    key_fields: Vec<KeyFieldSpec>,
    preconditions: Vec<Arc<dyn Precondition>>,
}

impl JobDescriptor {
    pub fn new(kind: impl Into<JobKind>) -> Self {
        Self {
            kind: kind.into(),
            concurrency_group: None,
            max_concurrent: UNBOUNDED,
            max_allowed_concurrent: None,
            key_fields: Vec::new(),
            preconditions: Vec::new(),
        }
    }

    pub fn in_group(mut self, group: ConcurrencyGroup) -> Self {
        self.concurrency_group = Some(group);
        self
    }

    pub fn max_concurrent(mut self, ceiling: usize) -> Self {
        self.max_concurrent = ceiling;
        self
    }

    /// Upper bound applied to configuration overrides.
    pub fn max_allowed_concurrent(mut self, ceiling: usize) -> Self {
        self.max_allowed_concurrent = Some(ceiling);
        self
    }

    pub fn key_field(mut self, name: impl Into<String>) -> Self {
        self.key_fields.push(KeyFieldSpec {
            name: name.into(),
            index: None,
        });
        self
    }

    pub fn key_field_at(mut self, name: impl Into<String>, index: u32) -> Self {
        self.key_fields.push(KeyFieldSpec {
            name: name.into(),
            index: Some(index),
        });
        self
    }

    pub fn requires(mut self, precondition: impl Precondition + 'static) -> Self {
        self.preconditions.push(Arc::new(precondition));
        self
    }

    pub fn requires_shared(mut self, precondition: Arc<dyn Precondition>) -> Self {
        self.preconditions.push(precondition);
        self
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn concurrency_group(&self) -> Option<&ConcurrencyGroup> {
        self.concurrency_group.as_ref()
    }

    pub fn ceiling(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_allowed(&self) -> Option<usize> {
        self.max_allowed_concurrent
    }

    pub fn key_fields(&self) -> &[KeyFieldSpec] {
        &self.key_fields
    }

    pub fn preconditions(&self) -> &[Arc<dyn Precondition>] {
        &self.preconditions
    }

    /// Builds the identity key from the declared key fields of `input`.
    pub fn identity_key(&self, input: &JobInput) -> Result<String, SchedulerError> {
        let fields = self
            .key_fields
            .iter()
            .map(|spec| {
                let value = input.render_field(&spec.name).ok_or_else(|| {
                    SchedulerError::InvalidInput {
                        kind: self.kind.clone(),
                        reason: format!("missing key field `{}`", spec.name),
                    }
                })?;
                Ok(KeyField {
                    name: spec.name.clone(),
                    value,
                    index: spec.index,
                })
            })
            .collect::<Result<Vec<_>, SchedulerError>>()?;

        Ok(job_key(&self.kind, &fields))
    }

    fn apply_override(&mut self, requested: usize) {
        let clamped = match self.max_allowed_concurrent {
            Some(max) if max > 0 && requested > max => max,
            _ => requested,
        };
        if clamped != requested {
            tracing::warn!(
                kind = %self.kind,
                requested,
                clamped,
                "concurrency override exceeds the declared maximum"
            );
        }
        self.max_concurrent = clamped;
    }
}

/// Executes one job kind.
///
/// Implementations should check `cancel` at their own I/O boundaries and
/// return [`JobOutcome::Cancelled`] when it fires.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn execute(&self, input: &JobInput, cancel: CancellationToken) -> JobOutcome;
}

/// Descriptor and executor of a registered job kind.
#[derive(Clone)]
pub struct RegisteredJob {
    pub descriptor: Arc<JobDescriptor>,
    pub executor: Arc<dyn JobExecutor>,
}

impl fmt::Debug for RegisteredJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredJob")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Lookup table from job kind to descriptor and executor. Built once at
/// startup and immutable afterwards.
#[derive(Clone, Debug, Default)]
pub struct JobRegistry {
    jobs: HashMap<JobKind, RegisteredJob>,
    groups: HashMap<String, usize>,
}

impl JobRegistry {
    pub fn builder() -> JobRegistryBuilder {
        JobRegistryBuilder::default()
    }

    pub fn get(&self, kind: &JobKind) -> Option<&RegisteredJob> {
        self.jobs.get(kind)
    }

    pub fn descriptor(&self, kind: &JobKind) -> Option<&Arc<JobDescriptor>> {
        self.jobs.get(kind).map(|job| &job.descriptor)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &JobKind> {
        self.jobs.keys()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<JobDescriptor>> {
        self.jobs.values().map(|job| &job.descriptor)
    }

    pub fn group_ceiling(&self, group: &str) -> Option<usize> {
        self.groups.get(group).copied()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Collects registrations and validates them as a whole.
#[derive(Default)]
pub struct JobRegistryBuilder {
    entries: Vec<(JobDescriptor, Arc<dyn JobExecutor>)>,
    overrides: Option<ConcurrencySettings>,
}

impl fmt::Debug for JobRegistryBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<&JobKind> = self.entries.iter().map(|(d, _)| d.kind()).collect();
        f.debug_struct("JobRegistryBuilder")
            .field("kinds", &kinds)
            .field("overrides", &self.overrides)
            .finish()
    }
}

impl JobRegistryBuilder {
    pub fn register(
        mut self,
        descriptor: JobDescriptor,
        executor: impl JobExecutor + 'static,
    ) -> Self {
        self.entries.push((descriptor, Arc::new(executor)));
        self
    }

    pub fn register_shared(
        mut self,
        descriptor: JobDescriptor,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        self.entries.push((descriptor, executor));
        self
    }

    pub fn with_overrides(mut self, overrides: ConcurrencySettings) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn build(self) -> anyhow::Result<JobRegistry> {
        let mut jobs = HashMap::with_capacity(self.entries.len());
        let mut groups: HashMap<String, usize> = HashMap::new();

        for (mut descriptor, executor) in self.entries {
            if let Some(overrides) = &self.overrides
                && let Some(requested) = overrides.overrides.get(descriptor.kind().as_str())
            {
                descriptor.apply_override(*requested);
            }

            if descriptor.ceiling() == 0 {
                anyhow::bail!("job kind `{}` has a concurrency ceiling of 0", descriptor.kind());
            }

            if let Some(group) = descriptor.concurrency_group() {
                if group.ceiling() == 0 {
                    anyhow::bail!("concurrency group `{}` has a ceiling of 0", group.name());
                }
                match groups.get(group.name()) {
                    Some(existing) if *existing != group.ceiling() => anyhow::bail!(
                        "concurrency group `{}` declared with ceilings {} and {}",
                        group.name(),
                        existing,
                        group.ceiling()
                    ),
                    Some(_) => {}
                    None => {
                        groups.insert(group.name().to_string(), group.ceiling());
                    }
                }
            }

            let kind = descriptor.kind().clone();
            let registered = RegisteredJob {
                descriptor: Arc::new(descriptor),
                executor,
            };
            if jobs.insert(kind.clone(), registered).is_some() {
                anyhow::bail!("job kind `{kind}` registered twice");
            }
        }

        if let Some(overrides) = &self.overrides {
            for name in overrides.overrides.keys() {
                if !jobs.contains_key(&JobKind::from(name.as_str())) {
                    tracing::warn!(kind = %name, "concurrency override for unknown job kind");
                }
            }
        }

        Ok(JobRegistry { jobs, groups })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Noop;

    #[async_trait]
    impl JobExecutor for Noop {
        async fn execute(&self, _input: &JobInput, _cancel: CancellationToken) -> JobOutcome {
            JobOutcome::Success
        }
    }

    #[test]
    fn identity_key_follows_declared_fields() {
        let descriptor = JobDescriptor::new("anidb.get_file")
            .key_field("size")
            .key_field_at("hash", 0);
        let input = JobInput::new()
            .with("size", 1024u64)
            .with("hash", "abc")
            .with("ignored", "x");

        assert_eq!(
            descriptor.identity_key(&input).unwrap(),
            "anidb.get_file[hash=abc,size=1024]"
        );
    }

    #[test]
    fn identity_key_rejects_missing_field() {
        let descriptor = JobDescriptor::new("anidb.get_file").key_field("hash");
        let err = descriptor.identity_key(&JobInput::new()).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidInput { .. }));
    }

    #[test]
    fn overrides_are_clamped() {
        let mut overrides = BTreeMap::new();
        overrides.insert("image.download".to_string(), 32);
        overrides.insert("hash".to_string(), 3);

        let registry = JobRegistry::builder()
            .register(
                JobDescriptor::new("image.download")
                    .max_concurrent(8)
                    .max_allowed_concurrent(16),
                Noop,
            )
            .register(JobDescriptor::new("hash").max_concurrent(1), Noop)
            .with_overrides(ConcurrencySettings { overrides })
            .build()
            .unwrap();

        assert_eq!(registry.descriptor(&"image.download".into()).unwrap().ceiling(), 16);
        assert_eq!(registry.descriptor(&"hash".into()).unwrap().ceiling(), 3);
    }

    #[test]
    fn conflicting_group_ceilings_fail() {
        let result = JobRegistry::builder()
            .register(
                JobDescriptor::new("a").in_group(ConcurrencyGroup::new("g")),
                Noop,
            )
            .register(
                JobDescriptor::new("b").in_group(ConcurrencyGroup::new("g").with_ceiling(2)),
                Noop,
            )
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_kinds_fail() {
        let result = JobRegistry::builder()
            .register(JobDescriptor::new("a"), Noop)
            .register(JobDescriptor::new("a"), Noop)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn groups_are_indexed() {
        let registry = JobRegistry::builder()
            .register(
                JobDescriptor::new("a").in_group(ConcurrencyGroup::new(ANIDB_UDP_GROUP)),
                Noop,
            )
            .register(
                JobDescriptor::new("b").in_group(ConcurrencyGroup::new(ANIDB_UDP_GROUP)),
                Noop,
            )
            .build()
            .unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.group_ceiling(ANIDB_UDP_GROUP), Some(1));
    }
}
