//! Per-node gradient accumulation buffer.

use crate::error::{GraphError, Result};
use crate::tensor::GradValue;

/// Gradients collected for the input slots of one node during one pass.
///
/// Contributions to the same slot are summed. A slot nobody contributed to
/// stays `None`.
#[derive(Debug)]
pub struct InputBuffer<T: GradValue> {
    buffer: Vec<Option<T>>,
}

impl<T: GradValue> InputBuffer<T> {
    pub fn new(size: usize) -> Self {
        Self {
            buffer: vec![None; size],
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Add `grad` into `slot`. `None` contributes nothing.
    pub fn add(&mut self, slot: usize, grad: Option<T>) -> Result<()> {
        let len = self.buffer.len();
        let entry = self.buffer.get_mut(slot).ok_or_else(|| {
            GraphError::Internal(format!("gradient for slot {slot} of a {len}-slot buffer"))
        })?;
        let Some(grad) = grad else {
            return Ok(());
        };
        match entry {
            Some(existing) => *existing = existing.add(&grad)?,
            None => *entry = Some(grad),
        }
        Ok(())
    }

    pub fn get(&self, slot: usize) -> Option<&T> {
        self.buffer.get(slot).and_then(Option::as_ref)
    }

    pub fn into_vec(self) -> Vec<Option<T>> {
        self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::DenseTensor;
    use approx::assert_relative_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;

    #[test]
    fn test_missing_contributions_stay_none() {
        let mut buffer = InputBuffer::<f64>::new(3);
        buffer.add(1, Some(2.0)).unwrap();
        buffer.add(2, None).unwrap();
        assert_eq!(buffer.into_vec(), vec![None, Some(2.0), None]);
    }

    #[test]
    fn test_out_of_range_slot() {
        let mut buffer = InputBuffer::<f64>::new(1);
        assert!(matches!(
            buffer.add(1, Some(1.0)),
            Err(GraphError::Internal(_))
        ));
    }

    #[test]
    fn test_sum_is_independent_of_arrival_order() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut contributions: Vec<f64> = (1..=16).map(|i| i as f64 * 0.25).collect();
        let expected: f64 = contributions.iter().sum();

        for _ in 0..10 {
            contributions.shuffle(&mut rng);
            let mut buffer = InputBuffer::new(2);
            for &c in &contributions {
                buffer.add(0, Some(c)).unwrap();
            }
            assert_relative_eq!(*buffer.get(0).unwrap(), expected, epsilon = 1e-12);
            assert!(buffer.get(1).is_none());
        }
    }

    #[test]
    fn test_shape_mismatch_is_reported() {
        let mut buffer = InputBuffer::new(1);
        buffer.add(0, Some(DenseTensor::ones(&[2]))).unwrap();
        let err = buffer.add(0, Some(DenseTensor::ones(&[3]))).unwrap_err();
        assert!(matches!(err, GraphError::ShapeMismatch { .. }));
    }
}
