pub mod memory;
pub mod postgres;
pub mod run_store;
pub mod step_store;

pub use memory::MemoryEngineStore;
pub use postgres::{PostgresEngineStore, StepTransaction};
pub use run_store::{CreateRunOutcome, RunStore};
pub use step_store::StepStore;

#[cfg(test)]
pub use run_store::MockRunStore;
#[cfg(test)]
pub use step_store::MockStepStore;
