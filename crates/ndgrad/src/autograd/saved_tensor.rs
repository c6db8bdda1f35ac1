//! Values saved during the forward pass for use in backward.

use crate::error::{GraphError, Result};
use crate::tensor::GradValue;
use parking_lot::Mutex;
use std::sync::Arc;

/// A forward value held by a backward function.
///
/// The engine releases saved values once a node has run and the caller did
/// not ask to keep the graph. Reading a released value is an error that tells
/// the caller to retry with `keep_graph`.
#[derive(Debug)]
pub struct SavedTensor<T: GradValue> {
    data: Mutex<Option<Arc<T>>>,
}

impl<T: GradValue> SavedTensor<T> {
    pub fn new(value: Arc<T>) -> Self {
        Self {
            data: Mutex::new(Some(value)),
        }
    }

    /// Get the saved value.
    ///
    /// `owner` names the backward function for the error message.
    pub fn get(&self, owner: &str) -> Result<Arc<T>> {
        self.data
            .lock()
            .clone()
            .ok_or_else(|| GraphError::SavedTensorReleased {
                name: owner.to_string(),
            })
    }

    /// Drop the saved value. Idempotent.
    pub fn release(&self) {
        self.data.lock().take();
    }

    pub fn is_released(&self) -> bool {
        self.data.lock().is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_then_release() {
        let saved = SavedTensor::new(Arc::new(2.5_f64));
        assert_eq!(*saved.get("MulBackward").unwrap(), 2.5);
        assert!(!saved.is_released());

        saved.release();
        saved.release();
        assert!(saved.is_released());

        let err = saved.get("MulBackward").unwrap_err();
        assert!(matches!(err, GraphError::SavedTensorReleased { name } if name == "MulBackward"));
    }

    #[test]
    fn test_release_does_not_free_shared_value() {
        let value = Arc::new(1.0_f64);
        let saved = SavedTensor::new(value.clone());
        saved.release();
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
