//! Shared per-query execution context registry.
//!
//! Tasks of the same query share one [`QueryContext`] (session properties,
//! memory accounting hooks). The registry hands out `Arc` references and
//! keeps only `Weak` entries, so a context dies with the last task that
//! references it; [`QueryContextManager::prune`] drops the dead entries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use flq_common::QueryId;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::task::unix_now_ms;

/// Session property capping drivers per task.
pub const MAX_DRIVERS_PER_TASK: &str = "max_drivers_per_task";
/// Session property capping concurrently started lifespans per task.
pub const CONCURRENT_LIFESPANS_PER_TASK: &str = "concurrent_lifespans_per_task";
/// Session property selecting the session timezone.
pub const SESSION_TIMEZONE: &str = "session_timezone";

#[derive(Debug, Serialize, Deserialize)]
/// Shared execution environment for all tasks of one query.
pub struct QueryContext {
    query_id: QueryId,
    session_properties: HashMap<String, String>,
    created_at_ms: u64,
}

impl QueryContext {
    fn new(query_id: QueryId, session_properties: HashMap<String, String>) -> Self {
        Self {
            query_id,
            session_properties,
            created_at_ms: unix_now_ms(),
        }
    }

    /// Owning query id.
    pub fn query_id(&self) -> &QueryId {
        &self.query_id
    }

    /// Creation timestamp in unix milliseconds.
    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }

    /// Raw session property lookup.
    pub fn session_property(&self, key: &str) -> Option<&str> {
        self.session_properties.get(key).map(String::as_str)
    }

    /// Parsed `max_drivers_per_task`, if set and numeric.
    pub fn max_drivers_per_task(&self) -> Option<usize> {
        self.session_property(MAX_DRIVERS_PER_TASK)?.parse().ok()
    }

    /// Parsed `concurrent_lifespans_per_task`, if set and numeric.
    pub fn concurrent_lifespans_per_task(&self) -> Option<usize> {
        self.session_property(CONCURRENT_LIFESPANS_PER_TASK)?
            .parse()
            .ok()
    }

    /// Session timezone, if set.
    pub fn session_timezone(&self) -> Option<&str> {
        self.session_property(SESSION_TIMEZONE)
    }
}

#[derive(Debug, Default)]
/// Registry mapping query ids to live shared contexts.
pub struct QueryContextManager {
    contexts: Mutex<HashMap<QueryId, Weak<QueryContext>>>,
}

impl QueryContextManager {
    fn locked(&self) -> MutexGuard<'_, HashMap<QueryId, Weak<QueryContext>>> {
        self.contexts.lock().expect("query context lock poisoned")
    }

    /// Upgrade the live context for `query_id`, or create one seeded with
    /// the given session properties. Properties of later tasks of the same
    /// query do not overwrite the live context.
    pub fn get_or_create(
        &self,
        query_id: &QueryId,
        session_properties: &HashMap<String, String>,
    ) -> Arc<QueryContext> {
        let mut contexts = self.locked();
        if let Some(ctx) = contexts.get(query_id).and_then(Weak::upgrade) {
            return ctx;
        }
        debug!(query_id = %query_id, "creating query context");
        let ctx = Arc::new(QueryContext::new(
            query_id.clone(),
            session_properties.clone(),
        ));
        contexts.insert(query_id.clone(), Arc::downgrade(&ctx));
        ctx
    }

    /// Live context for `query_id`, if any task still references it.
    pub fn get(&self, query_id: &QueryId) -> Option<Arc<QueryContext>> {
        self.locked().get(query_id).and_then(Weak::upgrade)
    }

    /// Drop entries whose context died with its last referencing task.
    /// Returns the number of entries removed.
    pub fn prune(&self) -> usize {
        let mut contexts = self.locked();
        let before = contexts.len();
        contexts.retain(|_, ctx| ctx.strong_count() > 0);
        before - contexts.len()
    }

    /// Number of queries with a live context.
    pub fn len(&self) -> usize {
        self.locked()
            .values()
            .filter(|ctx| ctx.strong_count() > 0)
            .count()
    }

    /// Whether no query has a live context.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_is_shared_per_query() {
        let manager = QueryContextManager::default();
        let props = HashMap::from([(MAX_DRIVERS_PER_TASK.to_string(), "4".to_string())]);
        let a = manager.get_or_create(&QueryId("q1".to_string()), &props);
        let b = manager.get_or_create(&QueryId("q1".to_string()), &HashMap::new());
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.max_drivers_per_task(), Some(4));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn context_dies_with_last_reference() {
        let manager = QueryContextManager::default();
        let ctx = manager.get_or_create(&QueryId("q1".to_string()), &HashMap::new());
        assert_eq!(manager.len(), 1);
        drop(ctx);
        assert!(manager.get(&QueryId("q1".to_string())).is_none());
        assert_eq!(manager.prune(), 1);
        assert!(manager.is_empty());
    }
}
