//! Structured RPC/lifecycle event sink. Grounded on the teacher's
//! `mcp-bouncer-logging` crate: an async mpsc channel feeding a background
//! writer task that owns a single DuckDB connection, batches inserts, and
//! checkpoints periodically. Kept as a sibling crate (not folded into
//! `ncp-core`) for the same reason the teacher split it out: heavyweight
//! persistence shouldn't be a mandatory dependency of the orchestrator
//! library itself.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use duckdb::Connection as DuckConn;
use serde_json::Value as JsonValue;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Duration, Instant};

use ncp_core::config_provider::ConfigProvider;
pub use ncp_core::logging::{Event, RpcEventPublisher};

#[derive(Clone)]
pub struct LoggerCfg {
    pub enabled: bool,
    pub db_path: PathBuf,
    pub redact_keys: Vec<String>,
}

enum Msg {
    Event(Box<Event>),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct LoggerHandle {
    tx: mpsc::Sender<Msg>,
    cfg: Arc<LoggerCfg>,
}

static LOGGER: OnceLock<LoggerHandle> = OnceLock::new();

#[derive(Clone, Default)]
pub struct DuckDbPublisher;

impl RpcEventPublisher for DuckDbPublisher {
    fn log(&self, event: Event) {
        log_rpc_event(event);
    }
}

fn default_db_path(cp: &dyn ConfigProvider) -> PathBuf {
    cp.base_dir().join("events.duckdb")
}

fn default_redact_list() -> Vec<String> {
    vec![
        "authorization".into(),
        "token".into(),
        "password".into(),
        "secret".into(),
        "api_key".into(),
        "access_token".into(),
        "refresh_token".into(),
    ]
}

/// Start the background writer. Safe to call more than once — only the
/// first call wins, same `OnceLock` idiom as the teacher's `init_once_with`.
pub fn init_once_with(cp: &dyn ConfigProvider) {
    let cfg = LoggerCfg {
        enabled: true,
        db_path: default_db_path(cp),
        redact_keys: default_redact_list(),
    };
    let (tx, rx) = mpsc::channel::<Msg>(8_192);
    let handle = LoggerHandle {
        tx,
        cfg: Arc::new(cfg),
    };
    if LOGGER.set(handle.clone()).is_ok() {
        tokio::spawn(async move { writer_task(handle.cfg.clone(), rx).await });
    }
}

pub fn log_rpc_event(mut evt: Event) {
    if let Some(handle) = LOGGER.get() {
        if !handle.cfg.enabled {
            return;
        }
        evt.request_json = evt.request_json.map(|v| redact_json(v, &handle.cfg.redact_keys));
        evt.response_json = evt.response_json.map(|v| redact_json(v, &handle.cfg.redact_keys));
        let _ = handle.tx.try_send(Msg::Event(Box::new(evt)));
    }
}

pub async fn force_flush_and_checkpoint() {
    if let Some(handle) = LOGGER.get() {
        let (tx_done, rx_done) = oneshot::channel();
        let _ = handle.tx.send(Msg::Flush(tx_done)).await;
        let _ = tokio::time::timeout(Duration::from_secs(2), rx_done).await;
    }
}

async fn writer_task(cfg: Arc<LoggerCfg>, mut rx: mpsc::Receiver<Msg>) {
    if let Some(parent) = cfg.db_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let mut conn = match DuckConn::open(&cfg.db_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(target = "ncp_logging", path = %cfg.db_path.display(), error = %e, "open_failed");
            return;
        }
    };
    if let Err(e) = create_schema(&conn) {
        tracing::error!(target = "ncp_logging", error = %e, "schema_failed");
        return;
    }

    let mut buf: Vec<Event> = Vec::with_capacity(512);
    let mut last = Instant::now();
    let mut last_checkpoint = Instant::now();
    let flush_every = Duration::from_millis(250);

    loop {
        match timeout(flush_every, rx.recv()).await {
            Ok(Some(Msg::Event(e))) => {
                buf.push(*e);
                if buf.len() >= 256 || last.elapsed() >= flush_every {
                    flush_and_log(&mut conn, &mut buf);
                    last = Instant::now();
                    checkpoint_if_due(&mut conn, &mut last_checkpoint);
                }
            }
            Ok(Some(Msg::Flush(done))) => {
                flush_and_log(&mut conn, &mut buf);
                let _ = conn.execute("CHECKPOINT", []);
                let _ = done.send(());
                last = Instant::now();
            }
            Ok(None) => {
                flush_and_log(&mut conn, &mut buf);
                let _ = conn.execute("CHECKPOINT", []);
                break;
            }
            Err(_) => {
                if !buf.is_empty() {
                    flush_and_log(&mut conn, &mut buf);
                }
                checkpoint_if_due(&mut conn, &mut last_checkpoint);
            }
        }
    }
}

fn checkpoint_if_due(conn: &mut DuckConn, last_checkpoint: &mut Instant) {
    if last_checkpoint.elapsed() >= Duration::from_secs(1) {
        let _ = conn.execute("CHECKPOINT", []);
        *last_checkpoint = Instant::now();
    }
}

fn flush_and_log(conn: &mut DuckConn, buf: &mut Vec<Event>) {
    if buf.is_empty() {
        return;
    }
    if let Err(e) = flush_events(conn, buf) {
        tracing::warn!(target = "ncp_logging", count = buf.len(), error = %e, "flush_failed");
    }
    buf.clear();
}

fn create_schema(conn: &DuckConn) -> duckdb::Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS rpc_events (
            id UUID PRIMARY KEY,
            ts TIMESTAMP NOT NULL,
            method TEXT NOT NULL,
            endpoint_name TEXT,
            qualified_tool TEXT,
            duration_ms BIGINT,
            ok BOOLEAN NOT NULL,
            error TEXT,
            request_json TEXT,
            response_json TEXT
        );
        "#,
    )
}

fn flush_events(conn: &mut DuckConn, events: &[Event]) -> duckdb::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO rpc_events (id, ts, method, endpoint_name, qualified_tool, duration_ms, ok, error, request_json, response_json) VALUES (?, to_timestamp(?::BIGINT / 1000.0), ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        for e in events {
            stmt.execute(duckdb::params![
                e.id.to_string(),
                e.ts_ms,
                e.method,
                e.endpoint_name,
                e.qualified_tool,
                e.duration_ms,
                e.ok,
                e.error,
                e.request_json.as_ref().map(|v| v.to_string()),
                e.response_json.as_ref().map(|v| v.to_string()),
            ])?;
        }
    }
    tx.commit()
}

pub fn redact_json(mut v: JsonValue, keys_lc: &[String]) -> JsonValue {
    fn rec(v: &mut JsonValue, keys_lc: &[String]) {
        match v {
            JsonValue::Object(map) => {
                for (k, val) in map.iter_mut() {
                    if keys_lc.iter().any(|x| x == &k.to_lowercase()) {
                        *val = JsonValue::String("***".to_string());
                    } else {
                        rec(val, keys_lc);
                    }
                }
            }
            JsonValue::Array(arr) => {
                for item in arr.iter_mut() {
                    rec(item, keys_lc);
                }
            }
            _ => {}
        }
    }
    rec(&mut v, keys_lc);
    v
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redact_json_masks_nested_secret_keys() {
        let keys = default_redact_list();
        let v = json!({
            "headers": { "Authorization": "Bearer abc123" },
            "body": { "password": "hunter2", "username": "alice" }
        });
        let redacted = redact_json(v, &keys);
        assert_eq!(redacted["headers"]["Authorization"], "***");
        assert_eq!(redacted["body"]["password"], "***");
        assert_eq!(redacted["body"]["username"], "alice");
    }

    #[test]
    fn redact_json_is_case_insensitive_on_key_name() {
        let keys = default_redact_list();
        let v = json!({ "TOKEN": "secret-value" });
        let redacted = redact_json(v, &keys);
        assert_eq!(redacted["TOKEN"], "***");
    }

    #[test]
    fn redact_json_leaves_unrelated_keys_untouched() {
        let keys = default_redact_list();
        let v = json!({ "query": "search term", "limit": 5 });
        let redacted = redact_json(v.clone(), &keys);
        assert_eq!(redacted, v);
    }

    #[test]
    fn event_new_sets_ok_true_by_default() {
        let e = Event::new("run");
        assert!(e.ok);
        assert_eq!(e.method, "run");
    }
}
