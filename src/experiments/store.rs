//! Result persistence and cross-run analysis.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use super::record::{RunResult, StopReason};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("result store I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode result '{name}': {source}")]
    Json {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Sink for finalized runs.
pub trait ResultStore: Send {
    fn persist(&mut self, result: &RunResult) -> Result<(), StoreError>;
}

/// Keeps results in memory, in persistence order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    results: Vec<RunResult>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> &[RunResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<RunResult> {
        self.results
    }
}

impl ResultStore for MemoryStore {
    fn persist(&mut self, result: &RunResult) -> Result<(), StoreError> {
        self.results.push(result.clone());
        Ok(())
    }
}

/// Writes each run to `<dir>/<name>_<YYYYmmdd_HHMMSS>.json`.
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
    written: Vec<PathBuf>,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Vec::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn written(&self) -> &[PathBuf] {
        &self.written
    }

    /// Every parsable result file in `dir`, ordered by file name. Files
    /// that fail to parse are skipped with a warning.
    pub fn load_all(dir: impl AsRef<Path>) -> Result<Vec<RunResult>, StoreError> {
        let dir = dir.as_ref();
        let io_error = |source: std::io::Error| StoreError::Io {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(io_error)?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut results = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = std::fs::read_to_string(&path).map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
            match serde_json::from_str::<RunResult>(&raw) {
                Ok(result) => results.push(result),
                Err(err) => log::warn!("skipping {}: {err}", path.display()),
            }
        }
        Ok(results)
    }

    fn target_path(&self, result: &RunResult) -> PathBuf {
        let stem = format!(
            "{}_{}",
            sanitize(result.name()),
            result.finished_at().format("%Y%m%d_%H%M%S")
        );
        let mut path = self.dir.join(format!("{stem}.json"));
        let mut suffix = 1;
        while path.exists() {
            path = self.dir.join(format!("{stem}_{suffix}.json"));
            suffix += 1;
        }
        path
    }
}

impl ResultStore for JsonFileStore {
    fn persist(&mut self, result: &RunResult) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StoreError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let encoded = serde_json::to_string_pretty(result).map_err(|source| StoreError::Json {
            name: result.name().to_string(),
            source,
        })?;
        let path = self.target_path(result);
        std::fs::write(&path, encoded).map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;

        log::info!("saved {} to {}", result.name(), path.display());
        self.written.push(path);
        Ok(())
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

/// One row of a [`SweepReport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SweepEntry {
    pub name: String,
    pub attempts: usize,
    pub success_rate: f64,
    pub block_rate: f64,
    pub mean_latency: Option<Duration>,
    pub first_block_index: Option<usize>,
    pub stop_reason: StopReason,
    pub settings: String,
}

impl SweepEntry {
    fn from_result(result: &RunResult) -> Self {
        let summary = result.summary();
        let parameters = result.parameters();
        Self {
            name: result.name().to_string(),
            attempts: summary.total_attempts,
            success_rate: summary.success_rate,
            block_rate: summary.block_rate,
            mean_latency: summary.mean_latency,
            first_block_index: summary.first_block_index,
            stop_reason: result.stop_reason(),
            settings: format!(
                "pacing={} retry={} rotation={} transport={} parallelism={}",
                parameters.pacing,
                parameters.retry,
                parameters.rotation,
                parameters.transport,
                parameters.parallelism
            ),
        }
    }

    /// Name prefix up to the first `_`, e.g. `delay` for `delay_fixed_2s`.
    pub fn family(&self) -> &str {
        self.name.split('_').next().unwrap_or(&self.name)
    }
}

/// Runs ranked by success rate, best first.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    entries: Vec<SweepEntry>,
}

impl SweepReport {
    pub const RECOMMENDATIONS: usize = 5;

    pub fn from_results(results: &[RunResult]) -> Self {
        let mut entries: Vec<SweepEntry> = results.iter().map(SweepEntry::from_result).collect();
        entries.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then(a.block_rate.total_cmp(&b.block_rate))
                .then_with(|| a.name.cmp(&b.name))
        });
        Self { entries }
    }

    pub fn entries(&self) -> &[SweepEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn best(&self, n: usize) -> &[SweepEntry] {
        &self.entries[..n.min(self.entries.len())]
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return writeln!(f, "no experiment results");
        }

        let mut families: BTreeMap<&str, Vec<&SweepEntry>> = BTreeMap::new();
        for entry in &self.entries {
            families.entry(entry.family()).or_default().push(entry);
        }

        for (family, entries) in families {
            writeln!(f, "== {} ==", family.to_uppercase())?;
            for entry in entries {
                writeln!(
                    f,
                    "{:<24} success {:>5.1}%  blocked {:>5.1}%  avg {:>6}  first block {:>4}  ({}, {} attempts)",
                    entry.name,
                    entry.success_rate * 100.0,
                    entry.block_rate * 100.0,
                    entry
                        .mean_latency
                        .map(|d| format!("{:.2}s", d.as_secs_f64()))
                        .unwrap_or_else(|| "n/a".into()),
                    entry
                        .first_block_index
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "n/a".into()),
                    entry.stop_reason,
                    entry.attempts
                )?;
            }
        }

        writeln!(f, "== TOP {} ==", Self::RECOMMENDATIONS)?;
        for (rank, entry) in self.best(Self::RECOMMENDATIONS).iter().enumerate() {
            writeln!(
                f,
                "{}. {} ({:.1}% success) {}",
                rank + 1,
                entry.name,
                entry.success_rate * 100.0,
                entry.settings
            )?;
        }
        Ok(())
    }
}
