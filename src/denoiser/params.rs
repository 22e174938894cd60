//! Named parameter tensors.

use std::collections::BTreeMap;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

/// Named collection of `f32` tensors such as weights, gradients or optimizer
/// moments.
///
/// Iteration order is the lexical order of names, so every worker walks the
/// tensors in the same order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamSet {
    tensors: BTreeMap<String, ArrayD<f32>>,
}

impl ParamSet {
    /// Empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a tensor.
    pub fn insert(&mut self, name: impl Into<String>, tensor: ArrayD<f32>) {
        self.tensors.insert(name.into(), tensor);
    }

    /// Tensor by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.tensors.get(name)
    }

    /// Mutable tensor by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.tensors.get_mut(name)
    }

    /// Iterate tensors in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArrayD<f32>)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Iterate tensors mutably in name order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut ArrayD<f32>)> {
        self.tensors.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of tensors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the set holds no tensors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar elements.
    #[must_use]
    pub fn num_elements(&self) -> usize {
        self.tensors.values().map(ArrayD::len).sum()
    }

    /// A set with the same names and shapes, filled with zeros.
    #[must_use]
    pub fn zeros_like(&self) -> Self {
        Self {
            tensors: self
                .tensors
                .iter()
                .map(|(k, v)| (k.clone(), ArrayD::zeros(v.raw_dim())))
                .collect(),
        }
    }

    /// Whether both sets have identical names and shapes.
    #[must_use]
    pub fn same_layout(&self, other: &Self) -> bool {
        self.tensors.len() == other.tensors.len()
            && self
                .tensors
                .iter()
                .zip(&other.tensors)
                .all(|((ka, va), (kb, vb))| ka == kb && va.shape() == vb.shape())
    }

    /// Whether every element is finite.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        self.tensors
            .values()
            .all(|t| t.iter().all(|v| v.is_finite()))
    }

    /// L2 norm over all elements, accumulated in `f64`.
    #[must_use]
    pub fn global_norm(&self) -> f64 {
        self.tensors
            .values()
            .flat_map(|t| t.iter())
            .map(|&v| f64::from(v) * f64::from(v))
            .sum::<f64>()
            .sqrt()
    }

    /// Multiply every element by `factor`.
    pub fn scale(&mut self, factor: f32) {
        for tensor in self.tensors.values_mut() {
            tensor.mapv_inplace(|v| v * factor);
        }
    }

    /// Rescale so the global norm does not exceed `max_norm`.
    ///
    /// Returns the norm before clipping.
    #[allow(clippy::cast_possible_truncation)]
    pub fn clip_global_norm(&mut self, max_norm: f64) -> f64 {
        let norm = self.global_norm();
        if norm > max_norm && norm.is_finite() {
            self.scale((max_norm / norm) as f32);
        }
        norm
    }
}

impl FromIterator<(String, ArrayD<f32>)> for ParamSet {
    fn from_iter<I: IntoIterator<Item = (String, ArrayD<f32>)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::IxDyn;

    use super::*;

    fn params() -> ParamSet {
        let mut set = ParamSet::new();
        set.insert("b", ArrayD::from_elem(IxDyn(&[2]), 3.0));
        set.insert("a", ArrayD::from_elem(IxDyn(&[2, 2]), 0.0));
        set
    }

    #[test]
    fn test_iteration_is_name_ordered() {
        let names: Vec<_> = params().iter().map(|(n, _)| n.to_string()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_layout_and_zeros() {
        let set = params();
        let zeros = set.zeros_like();
        assert!(set.same_layout(&zeros));
        assert_eq!(zeros.global_norm(), 0.0);
        assert_eq!(set.num_elements(), 6);

        let mut other = set.clone();
        other.insert("a", ArrayD::zeros(IxDyn(&[4])));
        assert!(!set.same_layout(&other));
    }

    #[test]
    fn test_clip_global_norm() {
        let mut set = params();
        let before = set.clip_global_norm(1.0);
        approx::assert_relative_eq!(before, 18.0_f64.sqrt());
        approx::assert_relative_eq!(set.global_norm(), 1.0, epsilon = 1e-6);

        let mut small = params();
        small.clip_global_norm(100.0);
        assert_eq!(small, params());
    }

    #[test]
    fn test_finite_check() {
        let mut set = params();
        assert!(set.is_finite());
        set.get_mut("b").unwrap()[[0]] = f32::NAN;
        assert!(!set.is_finite());
    }
}
