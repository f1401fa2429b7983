pub mod callback;
pub mod job_log;
pub mod lanes;
pub mod orchestrator;
pub mod propagation;
pub mod status;
pub mod tx;

#[cfg(test)]
mod test_support;

pub use callback::{CallbackOutcome, CallbackRouter};
pub use job_log::JobEventLogger;
pub use lanes::JobLanes;
pub use orchestrator::JobOrchestrator;
pub use status::node_status_for;
pub use tx::JobTx;
