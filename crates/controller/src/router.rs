use labeller_core::{EventHandler, ResourceSnapshot};
use labeller_queue::WorkQueue;
use metrics::counter;
use tracing::{debug, error};

/// Turns cache notifications into queue keys for objects in the watched namespace.
///
/// Enqueueing is its only side effect, so cache delivery never blocks on the API.
pub struct EventRouter {
    namespace: String,
    queue: WorkQueue<String>,
}

impl EventRouter {
    pub fn new(namespace: impl Into<String>, queue: WorkQueue<String>) -> Self {
        Self { namespace: namespace.into(), queue }
    }

    fn enqueue(&self, obj: &ResourceSnapshot) {
        let key = match obj.key() {
            Ok(k) => k,
            Err(e) => {
                error!(error = %e, "error getting namespace/key for pod");
                return;
            }
        };
        if key.namespace() != self.namespace {
            return;
        }
        debug!(pod = %key, "enqueued pod");
        counter!("labeller_enqueued_total", 1u64);
        self.queue.add(key.to_string());
    }
}

impl EventHandler for EventRouter {
    fn on_add(&self, obj: &ResourceSnapshot) { self.enqueue(obj); }

    fn on_update(&self, _old: &ResourceSnapshot, new: &ResourceSnapshot) { self.enqueue(new); }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn router() -> (EventRouter, WorkQueue<String>) {
        let q = WorkQueue::with_backoff("router-test", Duration::from_millis(5), Duration::from_secs(1));
        (EventRouter::new("prod", q.clone()), q)
    }

    fn pod(ns: Option<&str>, name: &str) -> ResourceSnapshot {
        ResourceSnapshot { namespace: ns.map(|s| s.to_string()), name: name.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn pods_in_namespace_are_enqueued_by_key() {
        let (r, q) = router();
        r.on_add(&pod(Some("prod"), "web-0"));
        assert_eq!(q.get().await.as_deref(), Some("prod/web-0"));
    }

    #[test]
    fn other_namespaces_are_ignored() {
        let (r, q) = router();
        r.on_add(&pod(Some("staging"), "web-0"));
        r.on_update(&pod(Some("prod"), "web-0"), &pod(Some("staging"), "web-0"));
        r.on_add(&pod(None, "node-scoped"));
        assert!(q.is_empty());
    }

    #[test]
    fn objects_without_key_are_dropped() {
        let (r, q) = router();
        r.on_add(&pod(Some("prod"), ""));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn update_routes_the_new_object() {
        let (r, q) = router();
        r.on_update(&pod(Some("staging"), "old"), &pod(Some("prod"), "new"));
        r.on_update(&pod(Some("prod"), "new"), &pod(Some("prod"), "new"));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("prod/new"));
    }
}
