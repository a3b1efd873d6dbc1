//! The pod operator capability.
//!
//! The engine never creates pods itself; an externally supplied operator
//! owns the pods' lifecycle and surfaces their availability. The engine
//! assumes nothing beyond these three contracts.

use crate::cluster::PodHandler;
use async_trait::async_trait;
use regex::Regex;

/// External capability driving the worker pods of a group.
#[async_trait]
pub trait Operator: Send + Sync + 'static {
    /// Requests a pod for the named runner. May return before the pod
    /// exists; availability arrives through [`Operator::watch`].
    fn spin_up(&self, name: &str);

    /// Requests removal of the named runner's pod. `soft` asks for a
    /// graceful teardown.
    fn tear_down(&self, name: &str, soft: bool);

    /// Streams pod availability changes for names matching `pattern` into
    /// the handlers. Runs until the group shuts down.
    async fn watch(&self, pattern: Regex, on_available: PodHandler, on_unavailable: PodHandler);
}
