use burn::{
    module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId},
    optim::GradientsParams,
    prelude::Backend,
    tensor::{Tensor, TensorData, backend::AutodiffBackend},
};
use log::{debug, warn};

use super::{CollectiveError, Communicator, GRAD_CLIP_NORM, Payload};

/// Scales `grads` in place so their global L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut [f32], max_norm: f32) -> f32 {
    let norm = grads
        .iter()
        .map(|&g| (g as f64) * (g as f64))
        .sum::<f64>()
        .sqrt() as f32;

    if norm > max_norm && norm.is_finite() {
        let scale = max_norm / norm;
        grads.iter_mut().for_each(|g| *g *= scale);
    }

    norm
}

struct ParamFlattener {
    values: Vec<f32>,
}

impl<B: Backend> ModuleVisitor<B> for ParamFlattener {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.values.extend(tensor.to_data().iter::<f32>());
    }
}

struct ParamCounter {
    numel: usize,
}

impl<B: Backend> ModuleVisitor<B> for ParamCounter {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        self.numel += tensor.shape().num_elements();
    }
}

struct ParamLoader<'a> {
    values: &'a [f32],
    offset: usize,
}

impl<B: Backend> ModuleMapper<B> for ParamLoader<'_> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        let shape = tensor.shape();
        let end = self.offset + shape.num_elements();
        let data = TensorData::new(self.values[self.offset..end].to_vec(), shape);
        self.offset = end;

        let loaded = Tensor::from_data(data, &tensor.device());
        if tensor.is_require_grad() {
            loaded.require_grad()
        } else {
            loaded
        }
    }
}

/// Moves gradients out of `grads` into one flat buffer in visit order,
/// zero-filling parameters that received none this step.
struct GradFlattener<'a> {
    grads: &'a mut GradientsParams,
    values: Vec<f32>,
    present: Vec<f32>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradFlattener<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        match self.grads.remove::<B::InnerBackend, D>(id) {
            Some(grad) => {
                self.values.extend(grad.into_data().iter::<f32>());
                self.present.push(1.0);
            }
            None => {
                let numel = tensor.shape().num_elements();
                self.values.extend(std::iter::repeat_n(0.0, numel));
                self.present.push(0.0);
            }
        }
    }
}

struct GradWriter<'a> {
    grads: GradientsParams,
    values: &'a [f32],
    present: &'a [f32],
    offset: usize,
    index: usize,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradWriter<'_> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        let shape = tensor.shape();
        let end = self.offset + shape.num_elements();

        if self.present[self.index] > 0.0 {
            let data = TensorData::new(self.values[self.offset..end].to_vec(), shape);
            let grad = Tensor::<B::InnerBackend, D>::from_data(data, &tensor.device());
            self.grads.register::<B::InnerBackend, D>(id, grad);
        }

        self.offset = end;
        self.index += 1;
    }
}

/// Averaged, clipped gradients ready for the optimizer.
pub struct SyncedGradients {
    pub grads: GradientsParams,
    /// Global norm of the averaged gradients before clipping.
    pub norm: f32,
    /// Set when the norm was not finite. `grads` is empty and the step must
    /// not be applied; every worker sees the same reduced norm.
    pub skipped: bool,
}

/// Keeps model replicas identical: same initial parameters everywhere, then
/// the same averaged gradients every step.
pub struct GradientSynchronizer<'a> {
    comm: &'a dyn Communicator,
    fp16: bool,
    max_norm: f32,
}

impl<'a> GradientSynchronizer<'a> {
    pub fn new(comm: &'a dyn Communicator, fp16: bool) -> Self {
        Self {
            comm,
            fp16,
            max_norm: GRAD_CLIP_NORM,
        }
    }

    pub fn world_size(&self) -> usize {
        self.comm.world_size()
    }

    pub fn is_root(&self) -> bool {
        self.comm.rank() == 0
    }

    /// Replaces every replica's parameters with rank 0's.
    pub fn broadcast_parameters<B: Backend, M: Module<B>>(
        &self,
        module: M,
    ) -> Result<M, CollectiveError> {
        if self.world_size() == 1 {
            return Ok(module);
        }

        let mut flattener = ParamFlattener { values: Vec::new() };
        module.visit(&mut flattener);

        let values = self
            .comm
            .broadcast(Payload::Full(flattener.values), 0)?
            .into_f32();

        load_parameters(module, &values)
    }

    /// All-reduces `grads`, divides by the group size and clips the result to
    /// the global norm bound. Parameters without a gradient on every worker
    /// stay without one.
    ///
    /// With fp16 compression each worker first clips its own gradients to the
    /// bound so that no element overflows the half precision range. A
    /// non-finite norm yields an empty, skipped update.
    pub fn synchronize<B: AutodiffBackend, M: AutodiffModule<B>>(
        &self,
        module: &M,
        mut grads: GradientsParams,
    ) -> Result<SyncedGradients, CollectiveError> {
        let mut flattener = GradFlattener {
            grads: &mut grads,
            values: Vec::new(),
            present: Vec::new(),
        };
        module.visit(&mut flattener);

        let GradFlattener {
            mut values,
            mut present,
            ..
        } = flattener;
        let n_values = values.len();

        if self.world_size() > 1 {
            if self.fp16 {
                clip_grad_norm(&mut values, self.max_norm);
            }
            values.append(&mut present);
            let reduced = self
                .comm
                .all_reduce_sum(Payload::compress(&values, self.fp16))?
                .into_f32();

            let scale = 1.0 / self.world_size() as f32;
            values = reduced[..n_values].iter().map(|v| v * scale).collect();
            present = reduced[n_values..].to_vec();
        }

        let norm = clip_grad_norm(&mut values, self.max_norm);
        debug!("Gradient norm {norm:.4}");

        if !norm.is_finite() {
            warn!("Skipping update with gradient norm {norm}");
            return Ok(SyncedGradients {
                grads: GradientsParams::new(),
                norm,
                skipped: true,
            });
        }

        let mut writer = GradWriter {
            grads,
            values: &values,
            present: &present,
            offset: 0,
            index: 0,
        };
        module.visit(&mut writer);

        Ok(SyncedGradients {
            grads: writer.grads,
            norm,
            skipped: false,
        })
    }

    /// Elementwise sum of `values` across the group, in full precision.
    pub fn all_reduce_sum(&self, values: &[f32]) -> Result<Vec<f32>, CollectiveError> {
        Ok(self
            .comm
            .all_reduce_sum(Payload::Full(values.to_vec()))?
            .into_f32())
    }
}

/// Flat copy of every float parameter in module visit order.
pub fn flatten_parameters<B: Backend, M: Module<B>>(module: &M) -> Vec<f32> {
    let mut flattener = ParamFlattener { values: Vec::new() };
    module.visit(&mut flattener);
    flattener.values
}

/// Inverse of [`flatten_parameters`].
pub fn load_parameters<B: Backend, M: Module<B>>(
    module: M,
    values: &[f32],
) -> Result<M, CollectiveError> {
    let mut counter = ParamCounter { numel: 0 };
    module.visit(&mut counter);

    if counter.numel != values.len() {
        return Err(CollectiveError::Layout {
            expected: counter.numel,
            got: values.len(),
        });
    }

    Ok(module.map(&mut ParamLoader { values, offset: 0 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalGroup, SingleProcess};
    use burn::{
        backend::{Autodiff, NdArray},
        nn::{Linear, LinearConfig},
        optim::{AdamConfig, Optimizer},
    };
    use std::thread;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[derive(Module, Debug)]
    struct TwoHeads<B: Backend> {
        shared: Linear<B>,
        extra: Linear<B>,
    }

    fn grad_values<const D: usize>(grads: &GradientsParams, id: ParamId) -> Vec<f32> {
        grads
            .get::<NdArray<f32>, D>(id)
            .unwrap()
            .into_data()
            .iter::<f32>()
            .collect()
    }

    fn linear_grads(model: &Linear<TestBackend>, grads: &GradientsParams) -> Vec<f32> {
        let mut values = grad_values::<2>(grads, model.weight.id);
        values.extend(grad_values::<1>(grads, model.bias.as_ref().unwrap().id));
        values
    }

    fn l2(values: &[f32]) -> f32 {
        values.iter().map(|g| g * g).sum::<f32>().sqrt()
    }

    fn assert_close(actual: &[f32], expected: &[f32]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-6, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn clipping_scales_to_threshold_and_keeps_direction() {
        let mut grads = vec![3.0, 4.0];
        let norm = clip_grad_norm(&mut grads, 1.0);

        assert!((norm - 5.0).abs() < 1e-6);
        let clipped = (grads[0] * grads[0] + grads[1] * grads[1]).sqrt();
        assert!((clipped - 1.0).abs() < 1e-6);
        assert!((grads[0] / grads[1] - 0.75).abs() < 1e-6);
    }

    #[test]
    fn clipping_leaves_small_gradients_alone() {
        let mut grads = vec![0.3, 0.4];
        clip_grad_norm(&mut grads, 1.0);
        assert_eq!(grads, vec![0.3, 0.4]);
    }

    #[test]
    fn parameters_round_trip_through_flat_buffer() {
        let device = Default::default();
        let source: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);
        let target: Linear<TestBackend> = LinearConfig::new(3, 2).init(&device);

        let values = flatten_parameters(&source);
        assert_eq!(values.len(), 3 * 2 + 2);

        let loaded = load_parameters(target, &values).unwrap();
        assert_eq!(flatten_parameters(&loaded), values);
        assert!(load_parameters(loaded, &values[1..]).is_err());
    }

    #[test]
    fn broadcast_makes_replicas_identical() {
        let group = LocalGroup::new(2);

        let replicas: Vec<Vec<f32>> = thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let device = Default::default();
                        let model: Linear<TestBackend> = LinearConfig::new(4, 4).init(&device);
                        let sync = GradientSynchronizer::new(comm, false);
                        let model = sync.broadcast_parameters(model).unwrap();
                        flatten_parameters(&model)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(replicas[0], replicas[1]);
    }

    #[test]
    fn synchronize_clips_local_gradients() {
        let device = Default::default();
        let model: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let input = Tensor::<TestBackend, 2>::from_floats([[100.0, -100.0]], &device);

        let loss = model.forward(input).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &model);

        let comm = SingleProcess;
        let synced = GradientSynchronizer::new(&comm, false)
            .synchronize(&model, grads)
            .unwrap();

        assert!(synced.norm > 100.0);

        assert!(!synced.skipped);
        assert!((l2(&linear_grads(&model, &synced.grads)) - 1.0).abs() < 1e-4);
    }

    #[test]
    fn half_precision_sync_still_clips_huge_gradients() {
        let group = LocalGroup::new(2);

        let results: Vec<(f32, bool, Vec<f32>)> = thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let device = Default::default();
                        let sync = GradientSynchronizer::new(comm, true);
                        let model: Linear<TestBackend> = sync
                            .broadcast_parameters(LinearConfig::new(2, 1).init(&device))
                            .unwrap();

                        // Weight gradients beyond the largest finite f16.
                        let input =
                            Tensor::<TestBackend, 2>::from_floats([[1e5, -1e5]], &device);
                        let loss = model.forward(input).sum();
                        let grads = GradientsParams::from_grads(loss.backward(), &model);

                        let synced = sync.synchronize(&model, grads).unwrap();
                        let values = linear_grads(&model, &synced.grads);
                        (synced.norm, synced.skipped, values)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (norm, skipped, values) in &results {
            assert!(norm.is_finite());
            assert!(!skipped);
            assert!(values.iter().all(|v| v.is_finite()));
            assert!((l2(values) - 1.0).abs() < 1e-2, "{values:?}");
            assert!(values[0] > 0.0 && values[1] < 0.0);
        }
        assert_eq!(results[0].2, results[1].2);
    }

    #[test]
    fn non_finite_norm_skips_the_update() {
        let device = Default::default();
        let model: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let input = Tensor::<TestBackend, 2>::from_floats([[f32::INFINITY, 1.0]], &device);

        let loss = model.forward(input).sum();
        let grads = GradientsParams::from_grads(loss.backward(), &model);

        let comm = SingleProcess;
        let synced = GradientSynchronizer::new(&comm, true)
            .synchronize(&model, grads)
            .unwrap();

        assert!(synced.skipped);
        assert!(!synced.norm.is_finite());
        assert!(synced.grads.get::<NdArray<f32>, 2>(model.weight.id).is_none());
    }

    #[test]
    fn workers_average_gradients_and_step_in_lockstep() {
        let group = LocalGroup::new(2);
        let inputs = [[0.1, 0.2], [0.3, -0.1]];

        let results: Vec<(Vec<f32>, Vec<f32>, Vec<f32>, Vec<f32>)> = thread::scope(|s| {
            let handles: Vec<_> = group
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let device = Default::default();
                        let sync = GradientSynchronizer::new(comm, false);
                        let model = TwoHeads::<TestBackend> {
                            shared: LinearConfig::new(2, 1).init(&device),
                            extra: LinearConfig::new(2, 1).init(&device),
                        };
                        let model = sync.broadcast_parameters(model).unwrap();
                        let initial = flatten_parameters(&model);

                        // Only rank 0 reaches the extra head.
                        let rank = comm.rank();
                        let x = Tensor::<TestBackend, 2>::from_floats([inputs[rank]], &device);
                        let mut loss = model.shared.forward(x.clone()).sum().mul_scalar(0.1);
                        if rank == 0 {
                            loss = loss + model.extra.forward(x).sum().mul_scalar(0.1);
                        }
                        let grads = GradientsParams::from_grads(loss.backward(), &model);

                        let synced = sync.synchronize(&model, grads).unwrap();
                        let shared = linear_grads(&model.shared, &synced.grads);
                        let extra = linear_grads(&model.extra, &synced.grads);

                        let mut optim = AdamConfig::new().init::<TestBackend, TwoHeads<TestBackend>>();
                        let model = optim.step(1e-2, model, synced.grads);

                        (initial, flatten_parameters(&model), shared, extra)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        for (initial, params, shared, extra) in &results {
            assert_close(shared, &[0.02, 0.005, 0.1]);
            // Present on one rank of two: half of that rank's gradient.
            assert_close(extra, &[0.005, 0.01, 0.05]);
            assert_ne!(initial, params);
        }
        assert_eq!(results[0].1, results[1].1);
    }
}
