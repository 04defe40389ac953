pub mod pipeline;
pub mod processor;
#[cfg(test)]
pub(crate) mod test_support;

pub use pipeline::{Pipeline, PipelineDeps};
pub use processor::{
    BoundedRetry, ProcessorSettings, RetryDecision, RetryPolicy, SessionEnd, UnitProcessor,
};
