//! Planning and execution.
//!
//! The diff engine compares each declared node with its recorded resource,
//! the planner turns the differences into an ordered list of actions, and the
//! executor runs that list against a provider on a bounded pool.

mod diff;
mod executor;
mod plan;
mod policy;

pub use diff::{DiffEngine, DiffType, FieldChange, ResourceDiff};
pub use executor::{
    ActionOutcome, NodeState, OutcomeStatus, PlanExecutor, ReconciliationResult, RetryPolicy,
};
pub use plan::{Action, ActionId, ActionKind, Plan, Planner};
pub use policy::ReplacePolicy;
