pub mod config;
pub mod decision;
pub mod engine;
pub mod reward;
pub mod types;

pub use config::AMASConfig;
pub use decision::{EnsembleDecision, Learner, LearnerError, LearnerOutput};
pub use engine::AmasEngine;
pub use types::*;
