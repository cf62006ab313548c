//! Structured access-log records, batched flush, and alert rules (§4.9, C9).
//!
//! Distinct from developer-facing `tracing` diagnostics: this pipeline
//! carries one record per request, destined for a pluggable sink rather
//! than stdout.

pub mod sink;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, warn};

pub use sink::{FileSink, LogSink, TracingSink};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogRecord {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub route_id: Option<String>,
    pub node_id: Option<String>,
    pub status: u16,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub total_ms: u64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    pub status_at_least: Option<u16>,
    pub total_ms_at_least: Option<u64>,
}

impl AlertRule {
    fn matches(&self, record: &AccessLogRecord) -> bool {
        let status_hit = self.status_at_least.map(|s| record.status >= s).unwrap_or(false);
        let latency_hit = self.total_ms_at_least.map(|t| record.total_ms >= t).unwrap_or(false);
        status_hit || latency_hit
    }
}

#[derive(Debug, Clone)]
pub struct AlertFired {
    pub rule_name: String,
    pub record: AccessLogRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub async_queue_size: usize,
    pub async_flush_interval: Duration,
    pub batch_size: usize,
    pub mask_fields: Vec<String>,
    pub alert_rules: Vec<AlertRule>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            async_queue_size: 10_000,
            async_flush_interval: Duration::from_secs(2),
            batch_size: 200,
            mask_fields: vec![],
            alert_rules: vec![],
        }
    }
}

/// Masks configured sensitive fields in a record's JSON projection before
/// it ever reaches a sink.
fn mask(record: &AccessLogRecord, fields: &[String]) -> serde_json::Value {
    let mut value = serde_json::to_value(record).unwrap_or(serde_json::Value::Null);
    if let serde_json::Value::Object(map) = &mut value {
        for field in fields {
            if map.contains_key(field) {
                map.insert(field.clone(), serde_json::Value::String("***".into()));
            }
        }
    }
    value
}

/// Bounded in-memory ring feeding a batch worker that flushes to a
/// `LogSink` on a timer or when `batch_size` fills, whichever comes
/// first. Overflow drops the oldest record rather than blocking request
/// handling.
pub struct LogPipeline {
    cfg: PipelineConfig,
    queue: Arc<Mutex<VecDeque<AccessLogRecord>>>,
    sink: Arc<dyn LogSink>,
    alerts_tx: broadcast::Sender<AlertFired>,
}

impl LogPipeline {
    pub fn new(cfg: PipelineConfig, sink: Arc<dyn LogSink>) -> Self {
        let (alerts_tx, _) = broadcast::channel(256);
        LogPipeline { cfg, queue: Arc::new(Mutex::new(VecDeque::new())), sink, alerts_tx }
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertFired> {
        self.alerts_tx.subscribe()
    }

    pub async fn record(&self, rec: AccessLogRecord) {
        for rule in &self.cfg.alert_rules {
            if rule.matches(&rec) {
                let _ = self.alerts_tx.send(AlertFired { rule_name: rule.name.clone(), record: rec.clone() });
            }
        }
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.cfg.async_queue_size {
            queue.pop_front();
            warn!("log pipeline queue full, dropping oldest record");
        }
        queue.push_back(rec);
    }

    /// Spawns the batch-flush worker; call once per pipeline instance.
    pub fn spawn_flusher(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.cfg.async_flush_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.flush_batch().await,
                    _ = shutdown.recv() => {
                        self.flush_batch().await;
                        break;
                    }
                }
            }
        });
    }

    async fn flush_batch(&self) {
        let batch: Vec<AccessLogRecord> = {
            let mut queue = self.queue.lock().await;
            let n = queue.len().min(self.cfg.batch_size.max(1));
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return;
        }
        let masked: Vec<serde_json::Value> = batch.iter().map(|r| mask(r, &self.cfg.mask_fields)).collect();
        if let Err(e) = self.sink.write_batch(&masked).await {
            warn!(%e, "log sink flush failed");
        } else {
            debug!(count = masked.len(), "flushed access log batch");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        count: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl LogSink for CountingSink {
        async fn write_batch(&self, records: &[serde_json::Value]) -> crate::Result<()> {
            self.count.fetch_add(records.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn record(status: u16, total_ms: u64) -> AccessLogRecord {
        AccessLogRecord {
            request_id: "r1".into(),
            method: "GET".into(),
            path: "/x".into(),
            route_id: None,
            node_id: None,
            status,
            bytes_in: 0,
            bytes_out: 0,
            total_ms,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn batch_flushes_on_manual_trigger() {
        let sink = Arc::new(CountingSink { count: AtomicUsize::new(0) });
        let pipeline = LogPipeline::new(PipelineConfig::default(), sink.clone());
        pipeline.record(record(200, 10)).await;
        pipeline.record(record(404, 12)).await;
        pipeline.flush_batch().await;
        assert_eq!(sink.count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn overflow_drops_oldest() {
        let sink = Arc::new(CountingSink { count: AtomicUsize::new(0) });
        let mut cfg = PipelineConfig::default();
        cfg.async_queue_size = 1;
        let pipeline = LogPipeline::new(cfg, sink);
        pipeline.record(record(200, 1)).await;
        pipeline.record(record(200, 2)).await;
        assert_eq!(pipeline.queue.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn status_threshold_alert_fires() {
        let sink = Arc::new(CountingSink { count: AtomicUsize::new(0) });
        let mut cfg = PipelineConfig::default();
        cfg.alert_rules = vec![AlertRule { name: "5xx".into(), status_at_least: Some(500), total_ms_at_least: None }];
        let pipeline = Arc::new(LogPipeline::new(cfg, sink));
        let mut alerts = pipeline.subscribe_alerts();
        pipeline.record(record(503, 5)).await;
        let fired = alerts.try_recv().unwrap();
        assert_eq!(fired.rule_name, "5xx");
    }

    #[test]
    fn masking_redacts_configured_fields() {
        let rec = record(200, 5);
        let masked = mask(&rec, &["request_id".to_string()]);
        assert_eq!(masked["request_id"], "***");
        assert_eq!(masked["method"], "GET");
    }
}
