//! Execution middleware that gates fires on resource tags.

use std::collections::HashSet;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::JobFailure;
use crate::metrics;
use crate::middleware::{ExecDecision, ExecOutcome, ExecutionMiddleware};
use crate::task::Task;

/// Defers fires while a required resource is absent.
///
/// Requirements are plain string tags: the gate holds a set of required tags
/// and a set of available ones. A fire is deferred while any required tag is
/// missing from the available set. Embedders flip availability at runtime
/// with [`HasTagGate::set_have_tag`] / [`HasTagGate::del_have_tag`].
#[derive(Default)]
pub struct HasTagGate {
    required: RwLock<HashSet<String>>,
    have: RwLock<HashSet<String>>,
}

impl HasTagGate {
    /// Create a gate with no requirements.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a resource as available.
    pub fn set_have_tag(&self, tag: impl Into<String>) {
        self.have
            .write()
            .expect("tag set lock poisoned")
            .insert(tag.into());
    }

    /// Mark a resource as no longer available.
    pub fn del_have_tag(&self, tag: &str) {
        self.have.write().expect("tag set lock poisoned").remove(tag);
    }

    /// Whether the resource `tag` is currently available.
    pub fn is_have_tag(&self, tag: &str) -> bool {
        self.have
            .read()
            .expect("tag set lock poisoned")
            .contains(tag)
    }

    /// Require a resource before guarded tasks may fire.
    pub fn set_required_tag(&self, tag: impl Into<String>) {
        self.required
            .write()
            .expect("tag set lock poisoned")
            .insert(tag.into());
    }

    /// Drop a requirement.
    pub fn del_required_tag(&self, tag: &str) {
        self.required
            .write()
            .expect("tag set lock poisoned")
            .remove(tag);
    }

    /// Whether `tag` is currently required.
    pub fn is_required_tag(&self, tag: &str) -> bool {
        self.required
            .read()
            .expect("tag set lock poisoned")
            .contains(tag)
    }

    fn first_missing(&self) -> Option<String> {
        let required = self.required.read().expect("tag set lock poisoned");
        let have = self.have.read().expect("tag set lock poisoned");
        required.iter().find(|t| !have.contains(*t)).cloned()
    }
}

#[async_trait]
impl ExecutionMiddleware for HasTagGate {
    fn name(&self) -> &'static str {
        "has-tag-gate"
    }

    async fn pre_handler(&self, task: &Task) -> ExecOutcome {
        match self.first_missing() {
            Some(tag) => {
                warn!(taskid = %task.get_id(), middleware = self.name(), tag = %tag, "missing tag");
                metrics::MW_HAS_TAGS_BLOCKED
                    .with_label_values(&[task.get_id()])
                    .inc();
                ExecOutcome::defer(JobFailure::deferred_job(format!("missing tag: {tag}")))
            }
            None => {
                debug!(taskid = %task.get_id(), middleware = self.name(), "all required tags present");
                ExecOutcome::next_mw()
            }
        }
    }

    async fn post_handler(&self, _task: &Task, _failure: Option<&JobFailure>) -> ExecDecision {
        ExecDecision::NextMw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;
    use crate::options::TaskOptions;
    use crate::task::test_task;

    #[tokio::test]
    async fn no_requirements_means_pass() {
        let (task, _rx) = test_task("tags-empty", TaskOptions::new());
        let gate = HasTagGate::new();
        assert_eq!(gate.pre_handler(&task).await.decision, ExecDecision::NextMw);
    }

    #[tokio::test]
    async fn missing_tag_defers_until_set() {
        let (task, _rx) = test_task("tags-missing", TaskOptions::new());
        let gate = HasTagGate::new();
        gate.set_required_tag("database");

        let outcome = gate.pre_handler(&task).await;
        assert_eq!(outcome.decision, ExecDecision::Defer);
        assert_eq!(
            outcome.failure.expect("deferred failure").kind,
            FailureKind::DeferredJob
        );

        gate.set_have_tag("database");
        assert_eq!(gate.pre_handler(&task).await.decision, ExecDecision::NextMw);
    }

    #[tokio::test]
    async fn deleting_a_have_tag_blocks_again() {
        let (task, _rx) = test_task("tags-flip", TaskOptions::new());
        let gate = HasTagGate::new();
        gate.set_required_tag("network");
        gate.set_have_tag("network");
        assert_eq!(gate.pre_handler(&task).await.decision, ExecDecision::NextMw);

        gate.del_have_tag("network");
        assert_eq!(gate.pre_handler(&task).await.decision, ExecDecision::Defer);
    }

    #[test]
    fn tag_accessors_reflect_membership() {
        let gate = HasTagGate::new();
        gate.set_required_tag("gpu");
        assert!(gate.is_required_tag("gpu"));
        assert!(!gate.is_have_tag("gpu"));

        gate.set_have_tag("gpu");
        assert!(gate.is_have_tag("gpu"));

        gate.del_required_tag("gpu");
        assert!(!gate.is_required_tag("gpu"));
    }
}
