pub mod evaluator;

pub use evaluator::{log_summary, Evaluator, RunSummary};
