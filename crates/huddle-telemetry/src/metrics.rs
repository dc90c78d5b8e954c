use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

/// One persisted metric value.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: i64,
    pub timestamp: String,
    pub name: String,
    pub value: f64,
    pub labels: Option<String>,
    pub metric_type: MetricType,
}

#[derive(Clone, Debug, Default)]
pub struct MetricsQuery {
    pub name: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Current in-memory values, keyed by rendered metric name
/// (`name` or `name{key=value,...}`).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsView {
    pub counters: BTreeMap<String, u64>,
    pub gauges: BTreeMap<String, f64>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct MetricKey {
    name: String,
    labels: Vec<(String, String)>,
}

impl MetricKey {
    fn new(name: &str, labels: &[(&str, &str)]) -> Self {
        let mut labels: Vec<(String, String)> = labels
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        labels.sort();
        Self {
            name: name.to_string(),
            labels,
        }
    }

    fn labels_json(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let map: BTreeMap<&str, &str> = self
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        serde_json::to_string(&map).ok()
    }

    fn rendered(&self) -> String {
        if self.labels.is_empty() {
            return self.name.clone();
        }
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        format!("{}{{{}}}", self.name, labels.join(","))
    }
}

/// Labelled counters and gauges, snapshotted to SQLite on demand.
pub struct MetricsRecorder {
    counters: RwLock<HashMap<MetricKey, AtomicU64>>,
    // f64 bit patterns
    gauges: RwLock<HashMap<MetricKey, AtomicU64>>,
    db: Mutex<Connection>,
}

const SCHEMA: &str = "PRAGMA synchronous = NORMAL;
     CREATE TABLE IF NOT EXISTS metrics_snapshots (
         id INTEGER PRIMARY KEY AUTOINCREMENT,
         timestamp TEXT NOT NULL,
         name TEXT NOT NULL,
         value REAL NOT NULL,
         labels TEXT,
         metric_type TEXT NOT NULL
     );
     CREATE INDEX IF NOT EXISTS idx_metrics_name ON metrics_snapshots(name, timestamp);";

impl MetricsRecorder {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    /// Recorder whose snapshots live only as long as the process.
    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            counters: RwLock::new(HashMap::new()),
            gauges: RwLock::new(HashMap::new()),
            db: Mutex::new(conn),
        })
    }

    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)], n: u64) {
        let key = MetricKey::new(name, labels);
        if let Some(counter) = self.counters.read().get(&key) {
            counter.fetch_add(n, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(n, Ordering::Relaxed);
    }

    pub fn counter_get(&self, name: &str, labels: &[(&str, &str)]) -> u64 {
        self.counters
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], value: f64) {
        let key = MetricKey::new(name, labels);
        if let Some(gauge) = self.gauges.read().get(&key) {
            gauge.store(value.to_bits(), Ordering::Relaxed);
            return;
        }
        self.gauges
            .write()
            .insert(key, AtomicU64::new(value.to_bits()));
    }

    pub fn gauge_get(&self, name: &str, labels: &[(&str, &str)]) -> f64 {
        self.gauges
            .read()
            .get(&MetricKey::new(name, labels))
            .map_or(0.0, |g| f64::from_bits(g.load(Ordering::Relaxed)))
    }

    pub fn view(&self) -> MetricsView {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(key, c)| (key.rendered(), c.load(Ordering::Relaxed)))
            .collect();
        let gauges = self
            .gauges
            .read()
            .iter()
            .map(|(key, g)| (key.rendered(), f64::from_bits(g.load(Ordering::Relaxed))))
            .collect();
        MetricsView { counters, gauges }
    }

    /// Write every current value as one row. Returns the number of rows.
    pub fn snapshot(&self) -> Result<usize, rusqlite::Error> {
        let timestamp = Utc::now().to_rfc3339();
        let mut rows: Vec<(String, f64, Option<String>, MetricType)> = Vec::new();
        for (key, counter) in self.counters.read().iter() {
            rows.push((
                key.name.clone(),
                counter.load(Ordering::Relaxed) as f64,
                key.labels_json(),
                MetricType::Counter,
            ));
        }
        for (key, gauge) in self.gauges.read().iter() {
            rows.push((
                key.name.clone(),
                f64::from_bits(gauge.load(Ordering::Relaxed)),
                key.labels_json(),
                MetricType::Gauge,
            ));
        }

        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO metrics_snapshots (timestamp, name, value, labels, metric_type)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for (name, value, labels, metric_type) in &rows {
                stmt.execute(rusqlite::params![
                    timestamp,
                    name,
                    value,
                    labels,
                    metric_type.as_str()
                ])?;
            }
        }
        tx.commit()?;
        Ok(rows.len())
    }

    /// Newest first.
    pub fn query(&self, q: &MetricsQuery) -> Result<Vec<MetricsSnapshot>, rusqlite::Error> {
        let mut sql = String::from(
            "SELECT id, timestamp, name, value, labels, metric_type FROM metrics_snapshots WHERE 1=1",
        );
        let mut params: Vec<String> = Vec::new();
        if let Some(name) = &q.name {
            params.push(name.clone());
            sql.push_str(&format!(" AND name = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(since.clone());
            sql.push_str(&format!(" AND timestamp >= ?{}", params.len()));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(1000)));

        let conn = self.db.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            let metric_type: String = row.get(5)?;
            Ok(MetricsSnapshot {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                name: row.get(2)?,
                value: row.get(3)?,
                labels: row.get(4)?,
                metric_type: if metric_type == "gauge" {
                    MetricType::Gauge
                } else {
                    MetricType::Counter
                },
            })
        })?;
        rows.collect()
    }

    /// Delete snapshots older than `retention_days`. Returns rows removed.
    pub fn prune(&self, retention_days: u32) -> Result<usize, rusqlite::Error> {
        let cutoff = (Utc::now() - Duration::days(i64::from(retention_days))).to_rfc3339();
        let conn = self.db.lock();
        conn.execute(
            "DELETE FROM metrics_snapshots WHERE timestamp < ?1",
            [cutoff],
        )
    }
}
