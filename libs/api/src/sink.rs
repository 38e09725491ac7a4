use crate::{BoxFuture, CommitError, DecodedRecord};

/// Persistence side of the pipeline.
///
/// `commit` writes the whole batch inside one transaction: on `Ok` every
/// row is visible, on `Err` none is. An empty batch is a no-op that must
/// succeed without touching the store.
pub trait BatchSink: Send + Sync {
    fn commit<'a>(&'a self, batch: &'a [DecodedRecord]) -> BoxFuture<'a, Result<(), CommitError>>;
}
