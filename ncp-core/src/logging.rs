//! RPC/lifecycle event shape, spec §4.8. Grounded on the teacher's
//! `mcp-bouncer-core/src/logging.rs` (`Event`, `now_millis`,
//! `RpcEventPublisher`), moved here rather than into `ncp-logging` so the
//! Orchestrator can depend on the trait without depending on DuckDB.
//!
//! Deviates from the teacher in one respect: the teacher parameterizes
//! `BouncerService<E, CP, L>` generically over `L: RpcEventPublisher + Clone`.
//! `Orchestrator` instead stores `Arc<dyn RpcEventPublisher>`, so the trait
//! here drops the `Clone` supertrait to stay object-safe. See DESIGN.md.

use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value as JsonValue;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Event {
    pub id: Uuid,
    pub ts_ms: i64,
    pub method: String,
    pub endpoint_name: Option<String>,
    pub qualified_tool: Option<String>,
    pub duration_ms: Option<i64>,
    pub ok: bool,
    pub error: Option<String>,
    pub request_json: Option<JsonValue>,
    pub response_json: Option<JsonValue>,
}

impl Event {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            ts_ms: now_millis(),
            method: method.into(),
            endpoint_name: None,
            qualified_tool: None,
            duration_ms: None,
            ok: true,
            error: None,
            request_json: None,
            response_json: None,
        }
    }
}

static LAST_MS: AtomicI64 = AtomicI64::new(0);

/// Monotonic-ish millisecond clock so two events in the same millisecond
/// still sort in call order.
pub fn now_millis() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64;
    loop {
        let prev = LAST_MS.load(Ordering::Relaxed);
        let next = if now > prev { now } else { prev + 1 };
        if LAST_MS
            .compare_exchange(prev, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return next;
        }
    }
}

/// Abstraction the Orchestrator logs through, so it never depends on DuckDB
/// directly. Mirrors the teacher's `RpcEventPublisher`, minus the `Clone`
/// bound — `Orchestrator` holds this as `Arc<dyn RpcEventPublisher>` rather
/// than a generic parameter, so the trait must stay object-safe.
pub trait RpcEventPublisher: Send + Sync {
    fn log(&self, event: Event);
}

/// Default sink when no logger is wired in: events are simply discarded.
#[derive(Debug, Default)]
pub struct NoopPublisher;

impl RpcEventPublisher for NoopPublisher {
    fn log(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_new_sets_ok_true_by_default() {
        let e = Event::new("run");
        assert!(e.ok);
        assert_eq!(e.method, "run");
    }

    #[test]
    fn now_millis_is_nondecreasing_across_calls() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }

    #[test]
    fn noop_publisher_accepts_events_without_panicking() {
        let pub_ = NoopPublisher;
        pub_.log(Event::new("attach"));
    }
}
