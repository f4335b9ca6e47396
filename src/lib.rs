pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod logging;
pub mod loss;
pub mod model;
pub mod task;
pub mod telemetry;
pub mod train;
pub mod validation;

pub use config::GenSenConfig;
pub use model::{GenSen, GenSenModelConfig, MultitaskModel};
pub use task::{Task, TaskSet};
pub use train::{Trainer, TrainingOutcome};
