use ingest_api::DecodedRecord;

/// In-memory batch of decoded records in receipt order.
///
/// The buffer never flushes on its own: the consumption loop asks
/// [`should_flush`](Self::should_flush) after every append, and the driver
/// drains whatever is left at shutdown regardless of the threshold.
#[derive(Debug, Default)]
pub struct BatchBuffer {
    records: Vec<DecodedRecord>,
}

impl BatchBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, record: DecodedRecord) {
        self.records.push(record);
    }

    pub fn should_flush(&self, threshold: usize) -> bool {
        self.records.len() >= threshold
    }

    /// Take the current contents, leaving an empty buffer with the same
    /// capacity behind.
    pub fn drain(&mut self) -> Vec<DecodedRecord> {
        let capacity = self.records.capacity();
        std::mem::replace(&mut self.records, Vec::with_capacity(capacity))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_is_inclusive() {
        let mut buffer = BatchBuffer::with_capacity(2);
        assert!(!buffer.should_flush(2));
        buffer.append(DecodedRecord::new("a", 1));
        assert!(!buffer.should_flush(2));
        buffer.append(DecodedRecord::new("b", 2));
        assert!(buffer.should_flush(2));
    }

    #[test]
    fn drain_keeps_order_and_resets() {
        let mut buffer = BatchBuffer::default();
        for (i, content) in ["x", "y", "z"].into_iter().enumerate() {
            buffer.append(DecodedRecord::new(content, i as i64));
        }

        let batch = buffer.drain();
        assert_eq!(
            batch.iter().map(|r| r.content.as_str()).collect::<Vec<_>>(),
            ["x", "y", "z"]
        );
        assert!(buffer.is_empty());
        assert_eq!(buffer.len(), 0);
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn appending_past_threshold_is_allowed() {
        let mut buffer = BatchBuffer::default();
        for i in 0..5 {
            buffer.append(DecodedRecord::new("r", i));
        }
        assert!(buffer.should_flush(3));
        assert_eq!(buffer.len(), 5);
    }
}
