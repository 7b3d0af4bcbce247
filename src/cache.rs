//! Per-class activation store

use std::collections::BTreeMap;

use candle_core::Tensor;

use crate::classes::ClassId;
use crate::error::{ProbeError, Result};

/// Pooled activations for every class of one split.
///
/// Each tensor has shape `(n_examples, d_model)`, one row per text, and is
/// never modified once inserted.
#[derive(Debug, Default, Clone)]
pub struct ActivationCache {
    activations: BTreeMap<ClassId, Tensor>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the activations of a class
    pub fn insert(&mut self, class: ClassId, activations: Tensor) {
        self.activations.insert(class, activations);
    }

    /// Activations of a class
    pub fn get(&self, class: ClassId) -> Option<&Tensor> {
        self.activations.get(&class)
    }

    /// Activations of a class, or `InvalidClass` if absent
    pub fn require(&self, class: ClassId) -> Result<&Tensor> {
        self.get(class).ok_or(ProbeError::InvalidClass(class))
    }

    /// Class ids in ascending order
    pub fn classes(&self) -> impl Iterator<Item = ClassId> + '_ {
        self.activations.keys().copied()
    }

    /// Iterate over (class, activations)
    pub fn iter(&self) -> impl Iterator<Item = (ClassId, &Tensor)> {
        self.activations.iter().map(|(k, v)| (*k, v))
    }

    /// Number of stored classes
    pub fn n_classes(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Hidden dimension of the stored activations (from the first class)
    pub fn d_model(&self) -> Result<Option<usize>> {
        match self.activations.values().next() {
            Some(t) => Ok(Some(t.dim(1)?)),
            None => Ok(None),
        }
    }
}

impl FromIterator<(ClassId, Tensor)> for ActivationCache {
    fn from_iter<I: IntoIterator<Item = (ClassId, Tensor)>>(iter: I) -> Self {
        Self {
            activations: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_cache_basic() {
        let device = Device::Cpu;
        let mut cache = ActivationCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.d_model().unwrap(), None);

        cache.insert(3, Tensor::zeros((4, 16), DType::F32, &device).unwrap());
        cache.insert(-2, Tensor::zeros((2, 16), DType::F32, &device).unwrap());

        assert_eq!(cache.n_classes(), 2);
        assert_eq!(cache.classes().collect::<Vec<_>>(), vec![-2, 3]);
        assert_eq!(cache.d_model().unwrap(), Some(16));
        assert!(cache.get(3).is_some());
        assert!(cache.get(4).is_none());
        assert!(matches!(cache.require(4), Err(ProbeError::InvalidClass(4))));
    }
}
