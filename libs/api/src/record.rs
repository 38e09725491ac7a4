use serde::{Deserialize, Serialize};

/// One decoded message, the unit the pipeline buffers and persists.
///
/// Maps onto one row `(content, sequence_number)` of the target table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub content: String,
    pub sequence_number: i64,
}

impl DecodedRecord {
    pub fn new(content: impl Into<String>, sequence_number: i64) -> Self {
        Self {
            content: content.into(),
            sequence_number,
        }
    }
}
