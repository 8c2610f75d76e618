//! Sync progress tracking and persistence.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use mailsync_common::{Collection, Error, PageRange, Result};

/// Where a collection is in its fetch lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CollectionPhase {
    /// Not being fetched; eligible for the next pass.
    #[default]
    Idle,
    /// A page loop is running.
    Fetching,
    /// The last page came back short. Never fetched again.
    Complete,
    /// The page at `resume` failed; the next pass restarts there.
    Failed { error: String, resume: PageRange },
}

/// Progress record for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "CollectionRecord", into = "CollectionRecord")]
pub struct CollectionState {
    phase: CollectionPhase,
    count: Option<u64>,
    fetched: u64,
}

impl CollectionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> &CollectionPhase {
        &self.phase
    }

    pub fn busy(&self) -> bool {
        self.phase == CollectionPhase::Fetching
    }

    pub fn complete(&self) -> bool {
        self.phase == CollectionPhase::Complete
    }

    pub fn error(&self) -> Option<&str> {
        match &self.phase {
            CollectionPhase::Failed { error, .. } => Some(error),
            _ => None,
        }
    }

    /// The failed page request, present exactly when `error()` is.
    pub fn error_request_range(&self) -> Option<PageRange> {
        match &self.phase {
            CollectionPhase::Failed { resume, .. } => Some(*resume),
            _ => None,
        }
    }

    /// Best-effort remote total, if known.
    pub fn count(&self) -> Option<u64> {
        self.count
    }

    /// Items received up to the last successful page.
    pub fn fetched(&self) -> u64 {
        self.fetched
    }

    /// Whether the next pass should page this collection.
    pub fn is_eligible(&self) -> bool {
        !self.busy() && !self.complete()
    }

    /// Enter `Fetching` and return the first page to request.
    ///
    /// A stored failure is consumed: paging resumes at the exact failed
    /// window. Otherwise paging starts at offset 0.
    pub fn begin_fetch(&mut self, initial_limit: u64) -> PageRange {
        let range = self
            .error_request_range()
            .unwrap_or_else(|| PageRange::first(initial_limit));
        self.phase = CollectionPhase::Fetching;
        range
    }

    /// Record a successful page of `received` items.
    ///
    /// # Returns
    /// Whether more pages follow (the page was full).
    pub fn record_page(&mut self, range: PageRange, received: u64) -> bool {
        let more = received == range.limit;
        self.fetched = range.offset + received;
        self.phase = if more {
            CollectionPhase::Fetching
        } else {
            CollectionPhase::Complete
        };
        more
    }

    /// Record a failed page request.
    pub fn record_failure(&mut self, error: impl Into<String>, range: PageRange) {
        self.phase = CollectionPhase::Failed {
            error: error.into(),
            resume: range,
        };
    }

    pub fn set_count(&mut self, count: u64) {
        self.count = Some(count);
    }

    /// Drop a `Fetching` phase that cannot still be running.
    pub fn clear_busy(&mut self) {
        if self.busy() {
            self.phase = CollectionPhase::Idle;
        }
    }
}

/// Persisted shape of a collection record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CollectionRecord {
    #[serde(default)]
    busy: bool,
    #[serde(default)]
    complete: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_request_range: Option<PageRange>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    fetched: u64,
}

impl From<CollectionRecord> for CollectionState {
    fn from(record: CollectionRecord) -> Self {
        let phase = if record.complete {
            CollectionPhase::Complete
        } else if let (Some(error), Some(resume)) = (record.error, record.error_request_range) {
            CollectionPhase::Failed { error, resume }
        } else if record.busy {
            CollectionPhase::Fetching
        } else {
            CollectionPhase::Idle
        };

        Self {
            phase,
            count: record.count,
            fetched: record.fetched,
        }
    }
}

impl From<CollectionState> for CollectionRecord {
    fn from(state: CollectionState) -> Self {
        Self {
            busy: state.busy(),
            complete: state.complete(),
            error: state.error().map(str::to_string),
            error_request_range: state.error_request_range(),
            count: state.count,
            fetched: state.fetched,
        }
    }
}

/// Progress summary derived from a state snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncStats {
    pub collections: usize,
    pub complete: usize,
    pub failed: usize,
    pub fetched: u64,
    /// Sum of known remote totals.
    pub count: u64,
}

/// Sync progress for one account.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Position in the push-update stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
    /// Progress records keyed by collection name.
    #[serde(flatten)]
    collections: BTreeMap<String, CollectionState>,
}

impl SyncState {
    /// Create a new empty sync state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the record for a collection.
    pub fn get(&self, collection: Collection) -> Option<&CollectionState> {
        self.collections.get(collection.as_str())
    }

    /// Get the record for a collection, creating it on first use.
    pub fn entry(&mut self, collection: Collection) -> &mut CollectionState {
        self.collections
            .entry(collection.as_str().to_string())
            .or_default()
    }

    /// Forget a collection's progress.
    pub fn remove(&mut self, collection: Collection) -> Option<CollectionState> {
        self.collections.remove(collection.as_str())
    }

    /// All records, ordered by collection name.
    pub fn collections(&self) -> impl Iterator<Item = (&str, &CollectionState)> {
        self.collections.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Whether any collection is being fetched.
    pub fn busy(&self) -> bool {
        self.collections.values().any(CollectionState::busy)
    }

    /// Clear `Fetching` everywhere; nothing survives a process boundary in flight.
    pub fn clear_busy(&mut self) {
        self.collections
            .values_mut()
            .for_each(CollectionState::clear_busy);
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn set_cursor(&mut self, cursor: impl Into<String>) {
        self.cursor = Some(cursor.into());
    }

    /// Summarize progress across collections.
    pub fn stats(&self) -> SyncStats {
        self.collections
            .values()
            .fold(SyncStats::default(), |mut stats, state| {
                stats.collections += 1;
                stats.complete += usize::from(state.complete());
                stats.failed += usize::from(state.error().is_some());
                stats.fetched += state.fetched();
                stats.count += state.count().unwrap_or(0);
                stats
            })
    }

    /// Serialize to a JSON value.
    pub fn to_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON value.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize from JSON.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}
