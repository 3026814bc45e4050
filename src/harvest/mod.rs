pub mod epf;
pub mod partition;
pub mod source;
pub mod spins;

use crate::config::AppConfig;
use crate::engine::SharedGateway;
use crate::error::{Result, SearchEngineError};
use crate::index::IndexManager;
use crate::schema::{FieldType, IndexSchema, SearchDocument};
use crate::types::IndexName;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

pub use epf::EpfSource;
pub use partition::{HarvestPartition, IdRange};
pub use source::{Connector, HarvestSource, MySqlConnector, RowSource, SourceRow};
pub use spins::SpinsSource;

/// Knobs for one harvest run
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestOptions {
    pub forks: usize,
    /// Total document cap, split between workers
    pub limit: Option<u64>,
    /// Overrides the source's batch size
    pub batch_size: Option<u64>,
    /// Recreate the index and ignore previously indexed documents
    pub reset: bool,
    /// Per-worker cap applied outside production
    pub dev_limit: Option<u64>,
}

impl Default for HarvestOptions {
    fn default() -> Self {
        Self {
            forks: 3,
            limit: None,
            batch_size: None,
            reset: false,
            dev_limit: None,
        }
    }
}

impl HarvestOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            forks: config.harvest.forks,
            dev_limit: (!config.environment.is_production()).then_some(config.harvest.dev_limit),
            ..Self::default()
        }
    }

    /// Documents fork `fork_index` may index before stopping.
    ///
    /// The first `limit % forks` workers take one extra document so the
    /// shares add up to `limit` exactly.
    pub fn worker_cap(&self, fork_index: usize) -> Option<u64> {
        let forks = self.forks.max(1) as u64;
        let share = self.limit.map(|limit| {
            let extra = u64::from((fork_index as u64) < limit % forks);
            limit / forks + extra
        });
        match (share, self.dev_limit) {
            (Some(share), Some(dev)) => Some(share.min(dev)),
            (share, dev) => share.or(dev),
        }
    }
}

/// Per-worker counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub indexed: u64,
    pub failed_batches: u64,
    pub skipped_rows: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct RunTotals {
    stats: WorkerStats,
    failed_workers: usize,
}

impl RunTotals {
    fn add(&mut self, stats: WorkerStats) {
        self.stats.indexed += stats.indexed;
        self.stats.failed_batches += stats.failed_batches;
        self.stats.skipped_rows += stats.skipped_rows;
    }
}

/// Outcome of a harvest run
#[derive(Debug, Clone, PartialEq)]
pub struct HarvestReport {
    pub index: IndexName,
    /// Documents in the index after the run
    pub doc_count: u64,
    pub size_in_bytes: u64,
    pub duration: Duration,
    /// Documents sent by this run
    pub indexed: u64,
    pub failed_batches: u64,
    pub skipped_rows: u64,
    pub failed_workers: usize,
}

impl fmt::Display for HarvestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Index: {}", self.index)?;
        writeln!(f, "Documents in index: {}", self.doc_count)?;
        writeln!(
            f,
            "Index size: {:.2} MB",
            self.size_in_bytes as f64 / (1024.0 * 1024.0)
        )?;
        writeln!(f, "Indexed this run: {}", self.indexed)?;
        writeln!(f, "Failed batches: {}", self.failed_batches)?;
        writeln!(f, "Skipped rows: {}", self.skipped_rows)?;
        if self.failed_workers > 0 {
            writeln!(f, "Failed workers: {}", self.failed_workers)?;
        }
        write!(f, "Duration: {:.1}s", self.duration.as_secs_f64())
    }
}

/// MySQL-backed source for `index` using the configured connection string.
pub fn mysql_source(config: &AppConfig, index: IndexName) -> Result<Arc<dyn HarvestSource>> {
    let connector = Arc::new(MySqlConnector::new(config.source_url(index)?));
    let batch_size = config.batch_size(index);
    let source: Arc<dyn HarvestSource> = match index {
        IndexName::Spins => Arc::new(SpinsSource::new(connector, batch_size)),
        IndexName::Epf => Arc::new(EpfSource::new(connector, batch_size)),
    };
    Ok(source)
}

/// Loads one source into its index with a fixed number of concurrent workers
pub struct Harvester {
    manager: IndexManager,
    source: Arc<dyn HarvestSource>,
}

impl Harvester {
    pub fn new(manager: IndexManager, source: Arc<dyn HarvestSource>) -> Self {
        Self { manager, source }
    }

    pub async fn run(&self, options: &HarvestOptions) -> Result<HarvestReport> {
        if options.forks == 0 {
            return Err(SearchEngineError::argument("At least one fork is required"));
        }
        let started = Instant::now();
        let index = self.source.index();

        if options.reset {
            self.manager.reset(index).await?;
        } else {
            self.manager.ensure(index).await?;
        }

        let rows = self.source.connect().await?;
        self.source.prepare(rows.as_ref()).await?;
        let bounds = source::id_bounds(self.source.as_ref(), rows.as_ref()).await?;
        drop(rows);

        let partitions = match bounds {
            Some((min_id, max_id)) => {
                let start = self.resume_from(min_id, options.reset).await?;
                let batch_size = options.batch_size.unwrap_or_else(|| self.source.batch_size());
                tracing::info!(
                    index = %index,
                    min_id = start,
                    max_id,
                    batch_size,
                    forks = options.forks,
                    "Starting harvest"
                );
                HarvestPartition::plan(options.forks, start, max_id, batch_size)?
            }
            None => {
                tracing::info!("Source for index {} is empty", index);
                Vec::new()
            }
        };

        let totals = self
            .manager
            .with_relaxed_write_settings(index, || self.fan_out(partitions, options))
            .await?;

        let stats = self.manager.finish_bulk_load(index).await?;
        let report = HarvestReport {
            index,
            doc_count: stats.doc_count,
            size_in_bytes: stats.size_in_bytes,
            duration: started.elapsed(),
            indexed: totals.stats.indexed,
            failed_batches: totals.stats.failed_batches,
            skipped_rows: totals.stats.skipped_rows,
            failed_workers: totals.failed_workers,
        };
        tracing::info!(
            index = %index,
            docs = report.doc_count,
            failed_batches = report.failed_batches,
            "Harvest finished in {:.1}s",
            report.duration.as_secs_f64()
        );
        Ok(report)
    }

    /// First id to harvest: after the highest one already indexed, when the
    /// source supports resuming.
    async fn resume_from(&self, min_id: i64, reset: bool) -> Result<i64> {
        let Some(field) = self.source.resume_field().filter(|_| !reset) else {
            return Ok(min_id);
        };
        match self.manager.max_value(self.source.index(), field).await? {
            Some(indexed) => {
                let next = indexed as i64 + 1;
                tracing::info!("Resuming index {} after id {}", self.source.index(), indexed as i64);
                Ok(next.max(min_id))
            }
            None => Ok(min_id),
        }
    }

    /// One task per partition; waits for all of them.
    async fn fan_out(&self, partitions: Vec<HarvestPartition>, options: &HarvestOptions) -> Result<RunTotals> {
        let mut workers = JoinSet::new();
        for partition in partitions {
            let cap = options.worker_cap(partition.fork_index);
            let source = self.source.clone();
            let gateway = self.manager.gateway().clone();
            workers.spawn(async move {
                let outcome = harvest_partition(source, gateway, partition, cap).await;
                (partition.fork_index, outcome)
            });
        }

        let spawned = workers.len();
        let mut totals = RunTotals::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(stats))) => totals.add(stats),
                Ok((fork, Err(e))) => {
                    tracing::error!(fork, error = %e, "Harvest worker failed");
                    totals.failed_workers += 1;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Harvest worker aborted");
                    totals.failed_workers += 1;
                }
            }
        }

        if spawned > 0 && totals.failed_workers == spawned {
            return Err(SearchEngineError::HarvestError(format!(
                "All {} workers failed",
                spawned
            )));
        }
        Ok(totals)
    }
}

/// Harvest one partition batch by batch.
///
/// A batch whose fetch or bulk request fails is logged and skipped. Only a
/// failure to open the source connection ends the worker with an error.
pub async fn harvest_partition(
    source: Arc<dyn HarvestSource>,
    gateway: SharedGateway,
    partition: HarvestPartition,
    cap: Option<u64>,
) -> Result<WorkerStats> {
    let fork = partition.fork_index;
    let index = source.index();
    let schema = IndexSchema::for_index(index);
    let rows = source.connect().await?;
    let mut stats = WorkerStats::default();

    tracing::info!(
        fork,
        from_id = partition.first_id(),
        max_id = partition.max_id,
        "Worker started"
    );

    for IdRange { from, to } in partition.batches() {
        if let Some(cap) = cap.filter(|cap| stats.indexed >= *cap) {
            tracing::info!(fork, "Worker reached its cap of {} documents", cap);
            break;
        }

        let fetched = match rows.fetch(source.range_query(), &[from, to]).await {
            Ok(fetched) => fetched,
            Err(e) => {
                tracing::warn!(fork, from_id = from, to_id = to, error = %e, "Failed to fetch batch");
                stats.failed_batches += 1;
                continue;
            }
        };

        let mut docs = Vec::with_capacity(fetched.len());
        for row in fetched {
            match to_document(source.as_ref(), &schema, row) {
                Some(doc) => docs.push(doc),
                None => stats.skipped_rows += 1,
            }
        }
        if let Some(cap) = cap {
            docs.truncate((cap - stats.indexed) as usize);
        }
        if docs.is_empty() {
            continue;
        }

        match gateway.bulk(index, &docs).await {
            Ok(()) => {
                stats.indexed += docs.len() as u64;
                tracing::info!(fork, from_id = from, to_id = to, docs = docs.len(), "Indexed batch");
            }
            Err(e) => {
                tracing::warn!(fork, from_id = from, to_id = to, error = %e, "Failed to index batch");
                stats.failed_batches += 1;
            }
        }
    }

    tracing::info!(fork, docs = stats.indexed, "Worker finished");
    Ok(stats)
}

fn to_document(source: &dyn HarvestSource, schema: &IndexSchema, row: SourceRow) -> Option<SearchDocument> {
    let mut doc = source.map_row(row)?;
    doc.sanitize();
    coerce_to_schema(&mut doc, schema);
    doc.has_fields(source.required_fields()).then_some(doc)
}

/// Relational sources hand out flags as 0/1 and some numbers as strings.
fn coerce_to_schema(doc: &mut SearchDocument, schema: &IndexSchema) {
    let updates: Vec<(String, Value)> = doc
        .iter()
        .filter_map(|(key, value)| {
            let coerced = match (schema.field_type(key)?, value) {
                (FieldType::Boolean { .. }, Value::Number(n)) => Value::Bool(n.as_f64()? != 0.0),
                (FieldType::Boolean { .. }, Value::String(s)) => {
                    Value::Bool(matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                }
                (FieldType::Integer { .. } | FieldType::Long { .. }, Value::String(s)) => {
                    Value::from(s.trim().parse::<i64>().ok()?)
                }
                _ => return None,
            };
            Some((key.clone(), coerced))
        })
        .collect();
    for (key, value) in updates {
        doc.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{MemoryGateway, SearchGateway};
    use async_trait::async_trait;
    use rstest::rstest;
    use serde_json::json;
    use tracing_test::traced_test;

    /// Spin table with ids `1..=rows`
    struct SpinTable {
        rows: i64,
    }

    #[async_trait]
    impl RowSource for SpinTable {
        async fn fetch(&self, _sql: &str, params: &[i64]) -> Result<Vec<SourceRow>> {
            let rows = match params {
                [from, to] => (*from.max(&1)..=*to.min(&self.rows))
                    .map(|id| json!({"id": id, "artist_name": "Low", "song_name": format!("Track {}", id)}))
                    .collect(),
                _ => vec![json!({"min_id": 1, "max_id": self.rows})],
            };
            Ok(rows.into_iter().filter_map(|r| r.as_object().cloned()).collect())
        }
    }

    #[async_trait]
    impl Connector for SpinTable {
        async fn connect(&self) -> Result<Arc<dyn RowSource>> {
            Ok(Arc::new(SpinTable { rows: self.rows }))
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_batch_is_logged_and_skipped() {
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_bulk_for_ids(["7"]).unwrap();
        let manager = IndexManager::new(gateway.clone(), 1, 1);
        let source = Arc::new(SpinsSource::new(Arc::new(SpinTable { rows: 20 }), 5));

        let options = HarvestOptions {
            forks: 2,
            ..HarvestOptions::default()
        };
        let report = Harvester::new(manager, source).run(&options).await.unwrap();

        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.indexed, 15);
        assert_eq!(gateway.count(IndexName::Spins).await.unwrap(), 15);
        assert!(gateway.document(IndexName::Spins, "7").unwrap().is_none());
        assert!(gateway.document(IndexName::Spins, "11").unwrap().is_some());
        assert!(logs_contain("Failed to index batch"));
        assert!(logs_contain("from_id=6"));

        let settings = gateway.settings(IndexName::Spins).unwrap().unwrap();
        assert!(!settings.contains_key("refresh_interval"));
        assert_eq!(settings["number_of_replicas"], 1);
        assert_eq!(gateway.force_merge_count().unwrap(), 1);
    }

    #[rstest]
    #[case(2)]
    #[case(3)]
    #[case(4)]
    #[tokio::test]
    async fn test_limit_is_a_total_cap(#[case] forks: usize) {
        let gateway = Arc::new(MemoryGateway::new());
        let manager = IndexManager::new(gateway.clone(), 1, 0);
        let source = Arc::new(SpinsSource::new(Arc::new(SpinTable { rows: 100 }), 10));
        let options = HarvestOptions {
            forks,
            limit: Some(25),
            ..HarvestOptions::default()
        };
        let report = Harvester::new(manager, source).run(&options).await.unwrap();
        assert_eq!(report.indexed, 25);
        assert_eq!(report.doc_count, 25);
    }

    #[test]
    fn test_worker_cap() {
        let mut options = HarvestOptions {
            forks: 3,
            limit: Some(10),
            ..HarvestOptions::default()
        };
        let caps: Vec<Option<u64>> = (0..3).map(|fork| options.worker_cap(fork)).collect();
        assert_eq!(caps, vec![Some(4), Some(3), Some(3)]);
        options.dev_limit = Some(2);
        assert_eq!(options.worker_cap(0), Some(2));
        options.limit = None;
        assert_eq!(options.worker_cap(2), Some(2));
        options.dev_limit = None;
        assert_eq!(options.worker_cap(1), None);
    }

    #[test]
    fn test_options_from_config() {
        let mut config = AppConfig::default();
        assert_eq!(HarvestOptions::from_config(&config).dev_limit, Some(200_000));
        config.environment = crate::config::Environment::Production;
        let options = HarvestOptions::from_config(&config);
        assert_eq!(options.dev_limit, None);
        assert_eq!(options.forks, 3);
    }

    #[test]
    fn test_coerce_to_schema() {
        let schema = IndexSchema::for_index(IndexName::Epf);
        let mut doc = SearchDocument::with_id("1-2-3");
        doc.insert("release_various_artists", 1);
        doc.insert("release_year_released", "1984");
        doc.insert("song_name", "1999");
        coerce_to_schema(&mut doc, &schema);
        assert_eq!(doc.get("release_various_artists"), Some(&json!(true)));
        assert_eq!(doc.get("release_year_released"), Some(&json!(1984)));
        assert_eq!(doc.get("song_name"), Some(&json!("1999")));
    }

    #[test]
    fn test_report_display() {
        let report = HarvestReport {
            index: IndexName::Spins,
            doc_count: 12,
            size_in_bytes: 2 * 1024 * 1024,
            duration: Duration::from_millis(1500),
            indexed: 12,
            failed_batches: 1,
            skipped_rows: 0,
            failed_workers: 0,
        };
        let text = report.to_string();
        assert!(text.contains("Documents in index: 12"));
        assert!(text.contains("Index size: 2.00 MB"));
        assert!(text.contains("Duration: 1.5s"));
    }
}
