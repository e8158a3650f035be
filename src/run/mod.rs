/// Run records and history
///
/// - Run, step and snapshot types with their status machines
/// - Append-only history of finished runs behind the RunRepository trait

pub mod types;

pub mod history;

pub use history::{RunHistory, RunRepository};
pub use types::{ExecutionStep, FlowRun, RunSnapshot, RunStatus, StepStatus, TriggerSource};
