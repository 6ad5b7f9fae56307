mod orchestrator;

pub use orchestrator::*;
