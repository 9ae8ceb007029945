pub mod cache;
pub mod dedup;
pub mod deps;
pub mod invoker;
pub mod locks;
pub mod media;
pub mod model;
pub mod orchestrator;
pub mod resolver;
pub mod stages;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use deps::PipelineDeps;
pub use orchestrator::Orchestrator;
