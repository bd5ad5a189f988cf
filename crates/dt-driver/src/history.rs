//! Append-only evaluation history.
//!
//! The driver owns the [`EvaluationHistory`] and is the only writer. Any number
//! of [`HistoryReader`]s can be handed out; readers see a consistent prefix and
//! cannot mutate it.

use parking_lot::RwLock;
use std::sync::Arc;

use dt_types::{EvaluationRecord, HistoryError, HistorySummary};

type Records = Arc<RwLock<Vec<Arc<EvaluationRecord>>>>;

#[derive(Debug, Default)]
pub struct EvaluationHistory {
    records: Records,
}

impl EvaluationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record. Its index must equal the current length.
    pub fn append(&self, record: EvaluationRecord) -> Result<(), HistoryError> {
        let mut records = self.records.write();
        let expected = records.len() as u64;
        if record.index != expected {
            return Err(HistoryError::Corruption {
                expected,
                found: record.index,
            });
        }
        records.push(Arc::new(record));
        Ok(())
    }

    /// Index the next appended record must carry.
    pub fn next_index(&self) -> u64 {
        self.records.read().len() as u64
    }

    pub fn reader(&self) -> HistoryReader {
        HistoryReader {
            records: Arc::clone(&self.records),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<EvaluationRecord> {
        self.reader().snapshot()
    }

    pub fn query<P>(&self, predicate: P) -> Query<P>
    where
        P: Fn(&EvaluationRecord) -> bool,
    {
        self.reader().query(predicate)
    }
}

/// Read-only handle onto a history.
#[derive(Debug, Clone)]
pub struct HistoryReader {
    records: Records,
}

impl HistoryReader {
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: u64) -> Option<Arc<EvaluationRecord>> {
        self.records.read().get(index as usize).cloned()
    }

    /// Records matching `predicate`, over the prefix present right now.
    pub fn query<P>(&self, predicate: P) -> Query<P>
    where
        P: Fn(&EvaluationRecord) -> bool,
    {
        Query {
            prefix: self.records.read().clone(),
            predicate,
        }
    }

    pub fn snapshot(&self) -> Vec<EvaluationRecord> {
        self.records
            .read()
            .iter()
            .map(|record| record.as_ref().clone())
            .collect()
    }

    pub fn summary(&self) -> HistorySummary {
        let prefix = self.records.read().clone();
        HistorySummary::from_records(prefix.iter().map(Arc::as_ref))
    }
}

/// Lazy, restartable view over a fixed prefix of the history.
///
/// Every call to [`iter`](Query::iter) starts over from the first record.
/// Records appended after the query was created are not visible.
pub struct Query<P> {
    prefix: Vec<Arc<EvaluationRecord>>,
    predicate: P,
}

impl<P> Query<P>
where
    P: Fn(&EvaluationRecord) -> bool,
{
    pub fn iter(&self) -> impl Iterator<Item = &EvaluationRecord> + '_ {
        self.prefix
            .iter()
            .map(Arc::as_ref)
            .filter(move |record| (self.predicate)(*record))
    }

    pub fn count(&self) -> usize {
        self.iter().count()
    }

    /// Length of the prefix the query runs over.
    pub fn prefix_len(&self) -> usize {
        self.prefix.len()
    }
}
