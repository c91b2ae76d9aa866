use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use regflow_core::{ChunkId, ChunkRecord};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::detect::{inspect, CorruptionKind, DetectionReport, Finding, ScanScope};
use crate::error::IntegrityError;
use crate::record::{checksum, StoredRecord};

type CorruptionListener = Arc<dyn Fn(&CorruptionEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityConfig {
    pub expected_dimensions: usize,
    pub required_metadata: Vec<String>,
    pub scan_interval: Duration,
}

impl Default for IntegrityConfig {
    fn default() -> Self {
        Self {
            expected_dimensions: 384,
            required_metadata: vec!["id".to_owned(), "path".to_owned()],
            scan_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Restore from the backup snapshot.
    BackupRestore,
    /// Rebuild from the redundant replica.
    RedundancyReconstruction,
    /// Accept the current content and recompute its checksum. Only repairs checksum damage.
    ChecksumRepair,
}

/// The three stored copies of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordCopy {
    Primary,
    Backup,
    Replica,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub strategy: Option<RecoveryStrategy>,
    pub corrupted: usize,
    pub recovered: Vec<ChunkId>,
    pub quarantined: Vec<ChunkId>,
    /// `recovered / corrupted`; `1.0` when nothing needed recovery.
    pub recovery_rate: f64,
}

/// Published to subscribers whenever a scan finds new corruption.
#[derive(Debug, Clone, PartialEq)]
pub struct CorruptionEvent {
    pub ids: Vec<ChunkId>,
    pub findings: Vec<Finding>,
}

#[derive(Default)]
struct StoreState {
    primary: HashMap<ChunkId, StoredRecord>,
    backup: HashMap<ChunkId, StoredRecord>,
    replica: HashMap<ChunkId, StoredRecord>,
    corrupted: BTreeSet<ChunkId>,
    quarantined: BTreeMap<ChunkId, StoredRecord>,
    last_detection: Option<DetectionReport>,
}

impl StoreState {
    fn copies_mut(&mut self, copy: RecordCopy) -> &mut HashMap<ChunkId, StoredRecord> {
        match copy {
            RecordCopy::Primary => &mut self.primary,
            RecordCopy::Backup => &mut self.backup,
            RecordCopy::Replica => &mut self.replica,
        }
    }
}

struct Inner {
    config: IntegrityConfig,
    state: Mutex<StoreState>,
    listeners: Mutex<Vec<CorruptionListener>>,
}

/// In-memory, integrity-checked chunk store.
#[derive(Clone)]
pub struct IntegrityStore {
    inner: Arc<Inner>,
}

impl IntegrityStore {
    pub fn new(config: IntegrityConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(StoreState::default()),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &IntegrityConfig {
        &self.inner.config
    }

    pub fn subscribe(&self, listener: CorruptionListener) {
        self.inner.listeners.lock().push(listener);
    }

    /// Store `chunk`, replacing any earlier version and clearing its corruption state.
    pub fn insert(&self, chunk: &ChunkRecord) -> StoredRecord {
        let record = StoredRecord::from_chunk(chunk);
        let mut state = self.inner.state.lock();
        state.backup.insert(record.id, record.clone());
        state.replica.insert(record.id, record.clone());
        state.primary.insert(record.id, record.clone());
        state.corrupted.remove(&record.id);
        state.quarantined.remove(&record.id);
        record
    }

    /// Read the primary copy, verifying its checksum first.
    pub fn get(&self, id: ChunkId) -> Result<StoredRecord, IntegrityError> {
        let mut state = self.inner.state.lock();
        if state.corrupted.contains(&id) || state.quarantined.contains_key(&id) {
            return Err(IntegrityError::CorruptionDetected { id });
        }
        let record = state
            .primary
            .get(&id)
            .ok_or(IntegrityError::UnknownRecord { id })?;
        if !record.checksum_matches() {
            state.corrupted.insert(id);
            tracing::warn!(target = "regflow.integrity", %id, "checksum mismatch on read");
            return Err(IntegrityError::CorruptionDetected { id });
        }
        Ok(record.clone())
    }

    pub fn remove(&self, id: ChunkId) -> bool {
        let mut state = self.inner.state.lock();
        state.backup.remove(&id);
        state.replica.remove(&id);
        state.corrupted.remove(&id);
        let quarantined = state.quarantined.remove(&id).is_some();
        state.primary.remove(&id).is_some() || quarantined
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        let state = self.inner.state.lock();
        state.primary.contains_key(&id) || state.quarantined.contains_key(&id)
    }

    /// Number of readable-or-suspect primaries (quarantined records excluded).
    pub fn len(&self) -> usize {
        self.inner.state.lock().primary.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn corrupted(&self) -> Vec<ChunkId> {
        self.inner.state.lock().corrupted.iter().copied().collect()
    }

    pub fn quarantined(&self) -> Vec<ChunkId> {
        self.inner.state.lock().quarantined.keys().copied().collect()
    }

    pub fn last_detection(&self) -> Option<DetectionReport> {
        self.inner.state.lock().last_detection.clone()
    }

    /// Mutate one stored copy in place without touching its checksum.
    ///
    /// This is the fault-injection hook for exercising detection and recovery.
    pub fn tamper(
        &self,
        copy: RecordCopy,
        id: ChunkId,
        f: impl FnOnce(&mut StoredRecord),
    ) -> bool {
        let mut state = self.inner.state.lock();
        match state.copies_mut(copy).get_mut(&id) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Scan every primary within `scope` and mark damaged records as corrupted.
    pub fn detect(&self, scope: ScanScope) -> DetectionReport {
        let config = &self.inner.config;
        let (report, newly_corrupted) = {
            let mut state = self.inner.state.lock();
            let mut ids: Vec<ChunkId> = state.primary.keys().copied().collect();
            ids.sort();

            let mut findings = Vec::new();
            let mut corrupted = Vec::new();
            for id in ids {
                let Some(record) = state.primary.get(&id) else {
                    continue;
                };
                let problems = inspect(
                    record,
                    scope,
                    config.expected_dimensions,
                    &config.required_metadata,
                );
                if problems.is_empty() {
                    continue;
                }
                corrupted.push(id);
                findings.extend(problems.into_iter().map(|kind| Finding { id, kind }));
            }

            let newly_corrupted: Vec<ChunkId> = corrupted
                .iter()
                .copied()
                .filter(|id| !state.corrupted.contains(id))
                .collect();
            state.corrupted.extend(corrupted.iter().copied());

            let scanned = state.primary.len();
            let report = DetectionReport {
                scope,
                scanned,
                integrity_score: match scanned {
                    0 => 1.0,
                    n => 1.0 - corrupted.len() as f64 / n as f64,
                },
                corrupted,
                findings,
            };
            state.last_detection = Some(report.clone());
            (report, newly_corrupted)
        };

        if !report.is_clean() {
            tracing::warn!(
                target = "regflow.integrity",
                ?scope,
                corrupted = report.corrupted.len(),
                scanned = report.scanned,
                integrity_score = report.integrity_score,
                "corruption detected"
            );
        }
        if !newly_corrupted.is_empty() {
            let event = CorruptionEvent {
                findings: report
                    .findings
                    .iter()
                    .filter(|f| newly_corrupted.contains(&f.id))
                    .cloned()
                    .collect(),
                ids: newly_corrupted,
            };
            let listeners = self.inner.listeners.lock().clone();
            for listener in listeners {
                listener(&event);
            }
        }
        report
    }

    /// Repair every record currently marked corrupted, quarantining what cannot be repaired.
    ///
    /// Candidates restored from the backup or replica must themselves pass a full check.
    /// `scope` selects which damage [`RecoveryStrategy::ChecksumRepair`] is allowed to see.
    pub fn recover(&self, scope: ScanScope, strategy: RecoveryStrategy) -> RecoveryReport {
        let config = &self.inner.config;
        let check = |record: &StoredRecord, scope: ScanScope| {
            inspect(
                record,
                scope,
                config.expected_dimensions,
                &config.required_metadata,
            )
        };

        let mut state = self.inner.state.lock();
        let targets: Vec<ChunkId> = std::mem::take(&mut state.corrupted).into_iter().collect();
        let mut report = RecoveryReport {
            strategy: Some(strategy),
            corrupted: targets.len(),
            ..RecoveryReport::default()
        };

        for id in targets {
            let Some(current) = state.primary.get(&id).cloned() else {
                continue;
            };
            let repaired = match strategy {
                RecoveryStrategy::BackupRestore => state
                    .backup
                    .get(&id)
                    .filter(|&candidate| check(candidate, ScanScope::All).is_empty())
                    .cloned(),
                RecoveryStrategy::RedundancyReconstruction => state
                    .replica
                    .get(&id)
                    .filter(|&candidate| check(candidate, ScanScope::All).is_empty())
                    .cloned(),
                RecoveryStrategy::ChecksumRepair => {
                    let problems = check(&current, scope);
                    let only_checksum = !problems.is_empty()
                        && problems.iter().all(|p| *p == CorruptionKind::ChecksumMismatch)
                        && check(&current, ScanScope::All)
                            .iter()
                            .all(|p| *p == CorruptionKind::ChecksumMismatch);
                    only_checksum.then(|| StoredRecord {
                        checksum: checksum(&current.content),
                        ..current.clone()
                    })
                }
            };

            match repaired {
                Some(record) => {
                    if strategy == RecoveryStrategy::ChecksumRepair {
                        // The accepted content becomes the new reference for the other copies.
                        state.backup.insert(id, record.clone());
                        state.replica.insert(id, record.clone());
                    }
                    state.primary.insert(id, record);
                    report.recovered.push(id);
                }
                None => {
                    state.primary.remove(&id);
                    state.quarantined.insert(id, current);
                    report.quarantined.push(id);
                }
            }
        }
        drop(state);

        report.recovery_rate = match report.corrupted {
            0 => 1.0,
            n => report.recovered.len() as f64 / n as f64,
        };
        if report.corrupted > 0 {
            tracing::info!(
                target = "regflow.integrity",
                ?strategy,
                corrupted = report.corrupted,
                recovered = report.recovered.len(),
                quarantined = report.quarantined.len(),
                recovery_rate = report.recovery_rate,
                "recovery finished"
            );
        }
        report
    }

    /// Run [`Self::detect`] every `interval` until `token` is cancelled.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_periodic_scan(
        &self,
        interval: Duration,
        scope: ScanScope,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let store = self.clone();
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; scans start one interval in.
            ticker.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        store.detect(scope);
                    }
                }
            }
            tracing::debug!(target = "regflow.integrity", "periodic scan stopped");
        })
    }
}

impl std::fmt::Debug for IntegrityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("IntegrityStore")
            .field("records", &state.primary.len())
            .field("corrupted", &state.corrupted.len())
            .field("quarantined", &state.quarantined.len())
            .finish()
    }
}
