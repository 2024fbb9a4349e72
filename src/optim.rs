//! Adam-family optimizers with Keras default moments.
//!
//! burn ships Adam; Nadam and Adamax are provided here as `SimpleOptimizer`s
//! so every `OptimizerKind` resolves to a concrete optimizer.

use burn::{
    module::AutodiffModule,
    optim::{adaptor::OptimizerAdaptor, Adam, AdamConfig, SimpleOptimizer},
    record::Record,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Tensor,
    },
    LearningRate,
};

const BETA_1: f64 = 0.9;
const BETA_2: f64 = 0.999;
const EPSILON: f64 = 1e-7;
/// Momentum schedule decay used by Nadam.
const SCHEDULE_DECAY: f64 = 0.004;

pub fn adam<B: AutodiffBackend, M: AutodiffModule<B>>() -> OptimizerAdaptor<Adam, M, B> {
    AdamConfig::new()
        .with_beta_1(BETA_1 as f32)
        .with_beta_2(BETA_2 as f32)
        .with_epsilon(EPSILON as f32)
        .init()
}

pub fn nadam<B: AutodiffBackend, M: AutodiffModule<B>>() -> OptimizerAdaptor<Nadam, M, B> {
    Nadam::default().into()
}

pub fn adamax<B: AutodiffBackend, M: AutodiffModule<B>>() -> OptimizerAdaptor<Adamax, M, B> {
    Adamax::default().into()
}

#[derive(Record, Clone)]
pub struct MomentState<B: Backend, const D: usize> {
    pub time: usize,
    pub moment_1: Tensor<B, D>,
    pub moment_2: Tensor<B, D>,
}

impl<B: Backend, const D: usize> MomentState<B, D> {
    fn zeros_like(tensor: &Tensor<B, D>) -> Self {
        Self {
            time: 0,
            moment_1: tensor.zeros_like(),
            moment_2: tensor.zeros_like(),
        }
    }

    fn to_device(self, device: &B::Device) -> Self {
        Self {
            time: self.time,
            moment_1: self.moment_1.to_device(device),
            moment_2: self.moment_2.to_device(device),
        }
    }
}

/// Nadam moments plus the running product of the momentum schedule.
#[derive(Record, Clone)]
pub struct NadamState<B: Backend, const D: usize> {
    pub moment: MomentState<B, D>,
    pub schedule: f64,
}

/// Adam with Nesterov momentum and a warming momentum schedule.
#[derive(Debug, Clone)]
pub struct Nadam {
    beta_1: f64,
    beta_2: f64,
    epsilon: f64,
}

impl Default for Nadam {
    fn default() -> Self {
        Self {
            beta_1: BETA_1,
            beta_2: BETA_2,
            epsilon: EPSILON,
        }
    }
}

impl Nadam {
    fn momentum_at(&self, step: usize) -> f64 {
        self.beta_1 * (1.0 - 0.5 * 0.96f64.powf(step as f64 * SCHEDULE_DECAY))
    }
}

impl<B: Backend> SimpleOptimizer<B> for Nadam {
    type State<const D: usize> = NadamState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let NadamState { moment: state, schedule } = state.unwrap_or_else(|| NadamState {
            moment: MomentState::zeros_like(&tensor),
            schedule: 1.0,
        });
        let time = state.time + 1;

        let momentum = self.momentum_at(time);
        let momentum_next = self.momentum_at(time + 1);
        let schedule = schedule * momentum;
        let schedule_next = schedule * momentum_next;

        let moment_1 = state
            .moment_1
            .mul_scalar(self.beta_1)
            .add(grad.clone().mul_scalar(1.0 - self.beta_1));
        let moment_2 = state
            .moment_2
            .mul_scalar(self.beta_2)
            .add(grad.clone().powf_scalar(2.0).mul_scalar(1.0 - self.beta_2));

        let grad_hat = grad.div_scalar(1.0 - schedule);
        let moment_1_hat = moment_1.clone().div_scalar(1.0 - schedule_next);
        let moment_2_hat = moment_2.clone().div_scalar(1.0 - self.beta_2.powi(time as i32));

        let update = grad_hat
            .mul_scalar(1.0 - momentum)
            .add(moment_1_hat.mul_scalar(momentum_next))
            .div(moment_2_hat.sqrt().add_scalar(self.epsilon))
            .mul_scalar(lr);

        let state = NadamState {
            moment: MomentState {
                time,
                moment_1,
                moment_2,
            },
            schedule,
        };
        (tensor.sub(update), Some(state))
    }

    fn to_device<const D: usize>(state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        NadamState {
            moment: state.moment.to_device(device),
            schedule: state.schedule,
        }
    }
}

/// Adam variant scaled by the infinity norm of past gradients.
#[derive(Debug, Clone)]
pub struct Adamax {
    beta_1: f64,
    beta_2: f64,
    epsilon: f64,
}

impl Default for Adamax {
    fn default() -> Self {
        Self {
            beta_1: BETA_1,
            beta_2: BETA_2,
            epsilon: EPSILON,
        }
    }
}

impl<B: Backend> SimpleOptimizer<B> for Adamax {
    type State<const D: usize> = MomentState<B, D>;

    fn step<const D: usize>(
        &self,
        lr: LearningRate,
        tensor: Tensor<B, D>,
        grad: Tensor<B, D>,
        state: Option<Self::State<D>>,
    ) -> (Tensor<B, D>, Option<Self::State<D>>) {
        let state = state.unwrap_or_else(|| MomentState::zeros_like(&tensor));
        let time = state.time + 1;

        let moment_1 = state
            .moment_1
            .mul_scalar(self.beta_1)
            .add(grad.clone().mul_scalar(1.0 - self.beta_1));
        // Exponentially weighted infinity norm.
        let moment_2 = state.moment_2.mul_scalar(self.beta_2).max_pair(grad.abs());

        let step_size = lr / (1.0 - self.beta_1.powi(time as i32));
        let update = moment_1
            .clone()
            .div(moment_2.clone().add_scalar(self.epsilon))
            .mul_scalar(step_size);

        let state = MomentState {
            time,
            moment_1,
            moment_2,
        };
        (tensor.sub(update), Some(state))
    }

    fn to_device<const D: usize>(state: Self::State<D>, device: &B::Device) -> Self::State<D> {
        state.to_device(device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use burn::backend::NdArray;

    type TestBackend = NdArray;

    /// Runs `steps` updates on f(x) = sum(x^2) and returns the final point.
    fn minimize<O: SimpleOptimizer<TestBackend>>(optim: &O, lr: f64, steps: usize) -> Vec<f32> {
        let device = Default::default();
        let mut x = Tensor::<TestBackend, 1>::from_floats([3.0, -2.0], &device);
        let mut state = None;
        for _ in 0..steps {
            let grad = x.clone().mul_scalar(2.0);
            let (next, next_state) = optim.step(lr, x, grad, state);
            x = next;
            state = next_state;
        }
        x.into_data().to_vec::<f32>().unwrap()
    }

    #[test]
    fn test_adamax_first_step_moves_by_lr() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0, -2.0], &device);
        let grad = Tensor::<TestBackend, 1>::from_floats([4.0, -4.0], &device);
        let (x, state) = Adamax::default().step(0.01, x, grad, None);
        let x = x.into_data().to_vec::<f32>().unwrap();
        assert_relative_eq!(x[0], 0.99, epsilon = 1e-5);
        assert_relative_eq!(x[1], -1.99, epsilon = 1e-5);
        assert_eq!(state.unwrap().time, 1);
    }

    #[test]
    fn test_nadam_first_step_descends() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 1>::from_floats([1.0, -1.0], &device);
        let grad = Tensor::<TestBackend, 1>::from_floats([0.5, -0.5], &device);
        let (x, _) = Nadam::default().step(0.01, x, grad, None);
        let x = x.into_data().to_vec::<f32>().unwrap();
        assert!(x[0] < 1.0 && x[0] > 0.98);
        assert!(x[1] > -1.0 && x[1] < -0.98);
    }

    #[test]
    fn test_nadam_state_carries_schedule_product() {
        let device = Default::default();
        let nadam = Nadam::default();
        let mut x = Tensor::<TestBackend, 1>::from_floats([1.0, -1.0], &device);
        let mut state = None;
        for _ in 0..3 {
            let grad = x.clone().mul_scalar(2.0);
            let (next, next_state) = nadam.step(0.01, x, grad, state);
            x = next;
            state = next_state;
        }
        let state = state.unwrap();
        let expected = nadam.momentum_at(1) * nadam.momentum_at(2) * nadam.momentum_at(3);
        assert_eq!(state.moment.time, 3);
        assert_relative_eq!(state.schedule, expected, epsilon = 1e-12);
    }

    #[test]
    fn test_optimizers_converge_on_quadratic() {
        for x in [minimize(&Nadam::default(), 0.05, 400), minimize(&Adamax::default(), 0.05, 400)] {
            assert!(x.iter().all(|v| v.abs() < 0.25), "did not converge: {x:?}");
        }
    }
}
