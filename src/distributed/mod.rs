pub mod communicator;
pub mod sync;

pub use communicator::{Communicator, LocalCommunicator, LocalGroup, Payload, SingleProcess};
pub use sync::{GradientSynchronizer, SyncedGradients, clip_grad_norm};

/// Fixed bound on the global gradient norm applied before every optimizer step.
pub const GRAD_CLIP_NORM: f32 = 1.0;

#[derive(Debug, thiserror::Error)]
pub enum CollectiveError {
    #[error("collective aborted by a failing worker")]
    Aborted,
    #[error("rank {rank} contributed {got} values to a collective expecting {expected}")]
    Mismatch {
        rank: usize,
        expected: usize,
        got: usize,
    },
    #[error("broadcast root {0} is outside the group")]
    InvalidRoot(usize),
    #[error("parameter buffer holds {got} values, module needs {expected}")]
    Layout { expected: usize, got: usize },
}
