pub mod step_record;
pub mod workflow_run;

pub use step_record::StepRecord;
pub use workflow_run::{RunStatus, WorkflowRun};
