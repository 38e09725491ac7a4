use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::RwLock;

use ingest_api::{BatchSink, BoxFuture, CommitError, DecodedRecord};

// ═══════════════════════════════════════════════════════════════
//  MemoryTable
// ═══════════════════════════════════════════════════════════════

#[derive(Default)]
struct Table {
    rows: Vec<DecodedRecord>,
    sequences: HashSet<i64>,
    batch_sizes: Vec<usize>,
    transactions: usize,
}

/// In-memory stand-in for the target table.
///
/// Batches are staged and only published to `rows` once every row passed,
/// so a failing commit leaves nothing behind. Can enforce a unique
/// `sequence_number` and inject failures for testing.
#[derive(Default)]
pub struct MemoryTable {
    table: RwLock<Table>,
    unique_sequence: bool,
    commit_delay: Option<Duration>,
    failures_left: AtomicUsize,
}

impl MemoryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject batches that repeat a `sequence_number`, like a UNIQUE constraint.
    pub fn with_unique_sequence(mut self) -> Self {
        self.unique_sequence = true;
        self
    }

    /// Hold every commit for `delay` before applying it.
    pub fn with_commit_delay(mut self, delay: Duration) -> Self {
        self.commit_delay = Some(delay);
        self
    }

    /// Fail the next `n` commits halfway through their rows.
    pub fn fail_next_commits(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Committed rows in commit order.
    pub async fn rows(&self) -> Vec<DecodedRecord> {
        self.table.read().await.rows.clone()
    }

    /// Row count of each successful commit.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.table.read().await.batch_sizes.clone()
    }

    /// Transactions opened, failed ones included.
    pub async fn transactions(&self) -> usize {
        self.table.read().await.transactions
    }

    async fn apply(&self, batch: &[DecodedRecord]) -> Result<(), CommitError> {
        if let Some(delay) = self.commit_delay {
            tokio::time::sleep(delay).await;
        }

        let mut table = self.table.write().await;
        table.transactions += 1;
        let fail_at = self.take_failure().then_some(batch.len() / 2);

        let mut staged = Vec::with_capacity(batch.len());
        let mut staged_sequences = HashSet::new();
        for (i, record) in batch.iter().enumerate() {
            if fail_at == Some(i) {
                tracing::debug!(row = i, "injected commit failure, rolling back");
                return Err(CommitError::Unavailable(format!(
                    "injected failure at row {i} of {}",
                    batch.len()
                )));
            }
            if self.unique_sequence
                && (table.sequences.contains(&record.sequence_number)
                    || !staged_sequences.insert(record.sequence_number))
            {
                return Err(CommitError::Rejected(format!(
                    "duplicate sequence_number {}",
                    record.sequence_number
                )));
            }
            staged.push(record.clone());
        }

        table.sequences.extend(staged.iter().map(|r| r.sequence_number));
        table.rows.extend(staged);
        table.batch_sizes.push(batch.len());
        Ok(())
    }
}

impl BatchSink for MemoryTable {
    fn commit<'a>(&'a self, batch: &'a [DecodedRecord]) -> BoxFuture<'a, Result<(), CommitError>> {
        Box::pin(async move {
            if batch.is_empty() {
                return Ok(());
            }
            self.apply(batch).await
        })
    }
}
