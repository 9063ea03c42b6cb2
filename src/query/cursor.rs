//! Cursor interface
//!
//! The downstream sink for query results. Queries push samples into a
//! cursor; `put` returning false signals that the consumer is full or
//! cancelled and the pipeline must stop pulling.

use crate::series::Sample;
use crate::storage::error::StorageError;

/// In-process push interface with backpressure.
pub trait InternalCursor {
    /// Deliver one sample. Returning false cancels the query; no further
    /// `put` will be delivered.
    fn put(&mut self, sample: Sample) -> bool;

    /// Abort with an error. Terminal; `complete` will not follow.
    fn set_error(&mut self, error: StorageError);

    /// All samples delivered without error.
    fn complete(&mut self);
}

/// Collecting cursor: buffers everything it is given. The default
/// consumer for library callers and tests.
#[derive(Debug, Default)]
pub struct VecCursor {
    pub samples: Vec<Sample>,
    pub error: Option<StorageError>,
    pub completed: bool,
    /// When set, `put` refuses samples past this count, exercising the
    /// backpressure path.
    pub limit: Option<usize>,
}

impl VecCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Data samples only, margins and flush markers stripped.
    pub fn data(&self) -> Vec<Sample> {
        self.samples.iter().copied().filter(|s| s.is_data()).collect()
    }
}

impl InternalCursor for VecCursor {
    fn put(&mut self, sample: Sample) -> bool {
        if let Some(limit) = self.limit {
            if self.samples.len() >= limit {
                return false;
            }
        }
        self.samples.push(sample);
        true
    }

    fn set_error(&mut self, error: StorageError) {
        self.error = Some(error);
    }

    fn complete(&mut self) {
        self.completed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_cursor_collects() {
        let mut cur = VecCursor::new();
        assert!(cur.put(Sample::new(1, 10, 1.0)));
        assert!(cur.put(Sample::hi_margin(20)));
        cur.complete();

        assert_eq!(cur.samples.len(), 2);
        assert_eq!(cur.data().len(), 1);
        assert!(cur.completed);
        assert!(cur.error.is_none());
    }

    #[test]
    fn test_vec_cursor_limit_backpressure() {
        let mut cur = VecCursor::with_limit(2);
        assert!(cur.put(Sample::new(1, 1, 1.0)));
        assert!(cur.put(Sample::new(1, 2, 2.0)));
        assert!(!cur.put(Sample::new(1, 3, 3.0)));
        assert_eq!(cur.samples.len(), 2);
    }
}
