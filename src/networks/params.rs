//! Flattened parameter and gradient sets
//!
//! A [`TensorSet`] is an ordered list of flattened tensors collected in module
//! traversal order. Two modules of the same architecture always produce
//! aligned sets, so sets can be summed, averaged across workers, clipped and
//! written back without knowing the concrete network type.

use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;

use crate::error::{Result, TrainerError};

/// One flattened tensor with its original shape
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FlatTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

impl FlatTensor {
    /// Copy a tensor's values into host memory
    pub fn from_tensor<B: Backend, const D: usize>(tensor: &Tensor<B, D>) -> Self {
        Self {
            shape: tensor.dims().to_vec(),
            values: tensor.to_data().iter::<f32>().collect(),
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            values: vec![0.0; len],
        }
    }

    fn to_tensor<B: Backend, const D: usize>(&self, device: &B::Device) -> Tensor<B, D> {
        Tensor::from_data(
            TensorData::new(self.values.clone(), self.shape.clone()).convert::<B::FloatElem>(),
            device,
        )
    }
}

/// Ordered collection of flattened tensors
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TensorSet {
    entries: Vec<FlatTensor>,
}

impl TensorSet {
    pub fn new(entries: Vec<FlatTensor>) -> Self {
        Self { entries }
    }

    /// Snapshot every float parameter of a module
    pub fn from_module<B: Backend, M: Module<B>>(module: &M) -> Self {
        let mut collector = ParamCollector::default();
        module.visit(&mut collector);
        Self::new(collector.entries)
    }

    /// Collect the gradients of a module's parameters.
    ///
    /// Parameters that received no gradient contribute zeros.
    pub fn from_gradients<B, M>(module: &M, grads: &B::Gradients) -> Self
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut collector = GradCollector::<B> {
            grads,
            entries: Vec::new(),
        };
        module.visit(&mut collector);
        Self::new(collector.entries)
    }

    pub fn entries(&self) -> &[FlatTensor] {
        &self.entries
    }

    /// Number of tensors in the set
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total number of scalar values
    pub fn num_elements(&self) -> usize {
        self.entries.iter().map(|e| e.values.len()).sum()
    }

    pub fn zeros_like(&self) -> Self {
        Self::new(
            self.entries
                .iter()
                .map(|e| FlatTensor::zeros(e.shape.clone()))
                .collect(),
        )
    }

    /// Whether both sets have the same tensors in the same shapes
    pub fn same_layout(&self, other: &TensorSet) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|(a, b)| a.shape == b.shape)
    }

    fn check_layout(&self, other: &TensorSet) -> Result<()> {
        if self.same_layout(other) {
            Ok(())
        } else {
            Err(TrainerError::Shape {
                what: "tensor set",
                expected: self.num_elements(),
                actual: other.num_elements(),
            })
        }
    }

    /// Element-wise `self += other`
    pub fn add_assign(&mut self, other: &TensorSet) -> Result<()> {
        self.check_layout(other)?;
        for (dst, src) in self.entries.iter_mut().zip(&other.entries) {
            for (d, s) in dst.values.iter_mut().zip(&src.values) {
                *d += *s;
            }
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f32) {
        for entry in &mut self.entries {
            for v in &mut entry.values {
                *v *= factor;
            }
        }
    }

    /// Global L2 norm over every value in the set
    pub fn l2_norm(&self) -> f32 {
        let sum_sq: f64 = self
            .entries
            .iter()
            .flat_map(|e| e.values.iter())
            .map(|&v| (v as f64) * (v as f64))
            .sum();
        sum_sq.sqrt() as f32
    }

    /// Rescale so the global norm does not exceed `max_norm`.
    ///
    /// Returns the norm measured before clipping.
    pub fn clip_norm(&mut self, max_norm: f32) -> f32 {
        let norm = self.l2_norm();
        let coef = max_norm / (norm + 1e-6);
        if coef < 1.0 {
            self.scale(coef);
        }
        norm
    }

    /// Move towards `live` by `tau`: `self = tau * live + (1 - tau) * self`
    pub fn lerp_toward(&mut self, live: &TensorSet, tau: f32) -> Result<()> {
        self.check_layout(live)?;
        for (dst, src) in self.entries.iter_mut().zip(&live.entries) {
            for (t, l) in dst.values.iter_mut().zip(&src.values) {
                *t = tau * *l + (1.0 - tau) * *t;
            }
        }
        Ok(())
    }

    /// Element-wise mean of aligned sets, summed in the given order
    pub fn mean(sets: &[TensorSet]) -> Result<TensorSet> {
        let Some(first) = sets.first() else {
            return Ok(TensorSet::default());
        };
        let mut total = first.clone();
        for set in &sets[1..] {
            total.add_assign(set)?;
        }
        total.scale(1.0 / sets.len() as f32);
        Ok(total)
    }

    /// Append another set's tensors after this one's
    pub fn concat(mut self, other: TensorSet) -> TensorSet {
        self.entries.extend(other.entries);
        self
    }

    /// Split into the first `at` tensors and the rest
    pub fn split_at(mut self, at: usize) -> Result<(TensorSet, TensorSet)> {
        if at > self.entries.len() {
            return Err(TrainerError::Shape {
                what: "tensor set split",
                expected: at,
                actual: self.entries.len(),
            });
        }
        let rest = self.entries.split_off(at);
        Ok((self, TensorSet::new(rest)))
    }

    /// Largest absolute element-wise difference between aligned sets
    pub fn max_abs_diff(&self, other: &TensorSet) -> Option<f32> {
        if !self.same_layout(other) {
            return None;
        }
        let diff = self
            .entries
            .iter()
            .zip(&other.entries)
            .flat_map(|(a, b)| a.values.iter().zip(&b.values))
            .map(|(x, y)| (x - y).abs())
            .fold(0.0f32, f32::max);
        Some(diff)
    }

    /// Overwrite a module's parameters, keeping parameter ids and grad flags
    pub fn load_into<B: Backend, M: Module<B>>(&self, module: M) -> Result<M> {
        self.check_layout(&TensorSet::layout_of(&module))?;
        let mut loader = ParamLoader {
            source: &self.entries,
            index: 0,
        };
        Ok(module.map(&mut loader))
    }

    /// Build optimizer gradients for a module from this set
    pub fn to_gradients_params<B, M>(&self, module: &M) -> Result<GradientsParams>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        self.check_layout(&TensorSet::layout_of(module))?;
        let mut registrar = GradRegistrar::<B> {
            source: &self.entries,
            index: 0,
            grads: GradientsParams::new(),
            _backend: PhantomData,
        };
        module.visit(&mut registrar);
        Ok(registrar.grads)
    }

    fn layout_of<B: Backend, M: Module<B>>(module: &M) -> TensorSet {
        let mut collector = ShapeCollector::default();
        module.visit(&mut collector);
        TensorSet::new(
            collector
                .shapes
                .into_iter()
                .map(|shape| FlatTensor {
                    shape,
                    values: Vec::new(),
                })
                .collect(),
        )
    }
}

/// Soft update (Polyak averaging) of a target module towards its live module:
/// `θ_target = τ * θ_live + (1 - τ) * θ_target`
pub fn soft_update<B, M>(live: &M, target: M, tau: f32) -> Result<M>
where
    B: Backend,
    M: Module<B>,
{
    // tau = 0 leaves the target untouched
    if tau == 0.0 {
        return Ok(target);
    }
    let live_params = TensorSet::from_module(live);
    if tau == 1.0 {
        return live_params.load_into(target);
    }
    let mut target_params = TensorSet::from_module(&target);
    target_params.lerp_toward(&live_params, tau)?;
    target_params.load_into(target)
}

// ============================================================================
// Visitors and mappers
// ============================================================================

#[derive(Default)]
struct ParamCollector {
    entries: Vec<FlatTensor>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector {
    fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
        self.entries.push(FlatTensor::from_tensor(tensor));
    }
}

#[derive(Default)]
struct ShapeCollector {
    shapes: Vec<Vec<usize>>,
}

impl<B: Backend> ModuleVisitor<B> for ShapeCollector {
    fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
        self.shapes.push(tensor.dims().to_vec());
    }
}

struct GradCollector<'a, B: AutodiffBackend> {
    grads: &'a B::Gradients,
    entries: Vec<FlatTensor>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradCollector<'_, B> {
    fn visit_float<const D: usize>(&mut self, _id: &ParamId, tensor: &Tensor<B, D>) {
        let entry = match tensor.grad(self.grads) {
            Some(grad) => FlatTensor::from_tensor(&grad),
            None => FlatTensor::zeros(tensor.dims().to_vec()),
        };
        self.entries.push(entry);
    }
}

struct GradRegistrar<'a, B: AutodiffBackend> {
    source: &'a [FlatTensor],
    index: usize,
    grads: GradientsParams,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradRegistrar<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: &ParamId, tensor: &Tensor<B, D>) {
        if let Some(entry) = self.source.get(self.index) {
            let grad = entry.to_tensor::<B::InnerBackend, D>(&tensor.device());
            self.grads.register(id.clone(), grad);
        }
        self.index += 1;
    }
}

struct ParamLoader<'a> {
    source: &'a [FlatTensor],
    index: usize,
}

impl<B: Backend> ModuleMapper<B> for ParamLoader<'_> {
    fn map_float<const D: usize>(&mut self, _id: &ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let entry = self.source.get(self.index);
        self.index += 1;
        match entry {
            Some(entry) => {
                let require_grad = tensor.is_require_grad();
                entry
                    .to_tensor::<B, D>(&tensor.device())
                    .set_require_grad(require_grad)
            }
            None => tensor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::nn::{Linear, LinearConfig};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn set(values: &[&[f32]]) -> TensorSet {
        TensorSet::new(
            values
                .iter()
                .map(|v| FlatTensor {
                    shape: vec![v.len()],
                    values: v.to_vec(),
                })
                .collect(),
        )
    }

    #[test]
    fn test_mean_of_sets() {
        let mean = TensorSet::mean(&[set(&[&[1.0, 2.0], &[4.0]]), set(&[&[3.0, 6.0], &[0.0]])])
            .unwrap();
        assert_eq!(mean, set(&[&[2.0, 4.0], &[2.0]]));
    }

    #[test]
    fn test_layout_mismatch_is_rejected() {
        let mut a = set(&[&[1.0, 2.0]]);
        assert!(a.add_assign(&set(&[&[1.0]])).is_err());
        assert!(a.max_abs_diff(&set(&[&[1.0], &[2.0]])).is_none());
    }

    #[test]
    fn test_clip_norm_bounds_global_norm() {
        let mut grads = set(&[&[3.0], &[4.0]]);
        let before = grads.clip_norm(1.0);

        assert!((before - 5.0).abs() < 1e-6);
        assert!((grads.l2_norm() - 1.0).abs() < 1e-4);

        let mut small = set(&[&[0.3], &[0.4]]);
        small.clip_norm(1.0);
        assert_eq!(small, set(&[&[0.3], &[0.4]]));
    }

    #[test]
    fn test_lerp_toward() {
        let mut target = set(&[&[0.0, 10.0]]);
        target.lerp_toward(&set(&[&[1.0, 0.0]]), 0.25).unwrap();
        assert_eq!(target, set(&[&[0.25, 7.5]]));
    }

    #[test]
    fn test_concat_and_split() {
        let joined = set(&[&[1.0]]).concat(set(&[&[2.0], &[3.0]]));
        let (head, tail) = joined.split_at(1).unwrap();
        assert_eq!(head, set(&[&[1.0]]));
        assert_eq!(tail, set(&[&[2.0], &[3.0]]));
    }

    #[test]
    fn test_module_roundtrip_through_set() {
        let device = Default::default();
        let a: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let b: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);

        let params = TensorSet::from_module(&a);
        assert_eq!(params.len(), 2);
        assert_eq!(params.num_elements(), 3 * 2 + 2);

        let b = params.load_into(b).unwrap();
        assert_eq!(TensorSet::from_module(&b), params);
    }

    #[test]
    fn test_soft_update_extremes() {
        let device = Default::default();
        let live: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        let target: Linear<TestBackend> = LinearConfig::new(4, 3).init(&device);
        let before = TensorSet::from_module(&target);

        let unchanged = soft_update(&live, target.clone(), 0.0).unwrap();
        assert_eq!(TensorSet::from_module(&unchanged), before);

        let replaced = soft_update(&live, target, 1.0).unwrap();
        assert_eq!(
            TensorSet::from_module(&replaced),
            TensorSet::from_module(&live)
        );
    }
}
