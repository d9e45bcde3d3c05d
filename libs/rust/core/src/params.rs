//! Model parameters exchanged between coordinator and clients.
//!
//! A `ParameterSet` is immutable once built; clones share the same backing
//! storage, so broadcasting one set to many clients copies nothing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::FlError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTensor")]
pub struct Tensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

#[derive(Deserialize)]
struct RawTensor {
    shape: Vec<usize>,
    values: Vec<f32>,
}

impl TryFrom<RawTensor> for Tensor {
    type Error = FlError;
    fn try_from(raw: RawTensor) -> Result<Self, FlError> { Tensor::new(raw.shape, raw.values) }
}

impl Tensor {
    pub fn new(shape: Vec<usize>, values: Vec<f32>) -> Result<Self, FlError> {
        let expected: usize = shape.iter().product();
        if expected != values.len() {
            return Err(FlError::InvalidTensor { shape, expected, actual: values.len() });
        }
        Ok(Self { shape, values })
    }

    /// One-dimensional tensor; always well formed.
    pub fn vector(values: Vec<f32>) -> Self { Self { shape: vec![values.len()], values } }

    pub fn shape(&self) -> &[usize] { &self.shape }
    pub fn values(&self) -> &[f32] { &self.values }
    pub fn len(&self) -> usize { self.values.len() }
    pub fn is_empty(&self) -> bool { self.values.is_empty() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    tensors: Arc<Vec<Tensor>>,
}

impl ParameterSet {
    pub fn new(tensors: Vec<Tensor>) -> Self { Self { tensors: Arc::new(tensors) } }

    pub fn tensors(&self) -> &[Tensor] { &self.tensors }
    pub fn len(&self) -> usize { self.tensors.len() }
    pub fn is_empty(&self) -> bool { self.tensors.is_empty() }
    pub fn shapes(&self) -> Vec<Vec<usize>> { self.tensors.iter().map(|t| t.shape.clone()).collect() }

    /// First position at which `candidate` differs in shape: `(position, expected, actual)`.
    /// A missing or surplus tensor is reported with an empty shape on the absent side.
    pub fn shape_mismatch(&self, candidate: &ParameterSet) -> Option<(usize, Vec<usize>, Vec<usize>)> {
        let n = self.len().max(candidate.len());
        (0..n).find_map(|i| {
            let expected = self.tensors.get(i).map(|t| t.shape()).unwrap_or(&[]);
            let actual = candidate.tensors.get(i).map(|t| t.shape()).unwrap_or(&[]);
            let present = i < self.len() && i < candidate.len();
            if present && expected == actual { None } else { Some((i, expected.to_vec(), actual.to_vec())) }
        })
    }

    /// True when both handles point at the same published set.
    pub fn ptr_eq(&self, other: &ParameterSet) -> bool { Arc::ptr_eq(&self.tensors, &other.tensors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tensor_validates_element_count() {
        assert!(Tensor::new(vec![2, 3], vec![0.0; 6]).is_ok());
        let err = Tensor::new(vec![2, 3], vec![0.0; 5]).unwrap_err();
        assert_eq!(err, FlError::InvalidTensor { shape: vec![2, 3], expected: 6, actual: 5 });
    }

    #[test]
    fn shape_mismatch_reports_first_difference() {
        let reference = ParameterSet::new(vec![Tensor::vector(vec![0.0; 3]), Tensor::vector(vec![0.0])]);
        let same = ParameterSet::new(vec![Tensor::vector(vec![1.0; 3]), Tensor::vector(vec![2.0])]);
        assert!(reference.shape_mismatch(&same).is_none());

        let wrong = ParameterSet::new(vec![Tensor::vector(vec![1.0; 3]), Tensor::vector(vec![2.0, 3.0])]);
        assert_eq!(reference.shape_mismatch(&wrong), Some((1, vec![1], vec![2])));

        let short = ParameterSet::new(vec![Tensor::vector(vec![1.0; 3])]);
        assert_eq!(reference.shape_mismatch(&short), Some((1, vec![1], vec![])));
    }

    #[test]
    fn deserialized_tensors_are_validated() {
        let ok: Tensor = serde_json::from_str(r#"{"shape": [2], "values": [1.0, 2.0]}"#).unwrap();
        assert_eq!(ok.values(), &[1.0, 2.0]);
        let err = serde_json::from_str::<Tensor>(r#"{"shape": [2, 2], "values": [1.0]}"#).unwrap_err();
        assert!(err.to_string().contains("needs 4 values, got 1"), "{err}");
        let set = serde_json::to_string(&ParameterSet::new(vec![ok])).unwrap();
        assert_eq!(serde_json::from_str::<ParameterSet>(&set).unwrap().shapes(), vec![vec![2]]);
    }

    #[test]
    fn clones_share_storage() {
        let p = ParameterSet::new(vec![Tensor::vector(vec![1.0])]);
        let q = p.clone();
        assert!(p.ptr_eq(&q));
        assert!(!p.ptr_eq(&ParameterSet::new(vec![Tensor::vector(vec![1.0])])));
    }
}
