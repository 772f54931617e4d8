mod job;
mod state;

pub use crate::ids::{Address, JobId};
pub use job::{
    AuditRecord, Job, JobSpec, JobView, Payout, PendingTransition, ResourceRequirements,
};
pub use state::{JobStatus, StateMachine};

#[cfg(test)]
pub(crate) use job::fixtures;
