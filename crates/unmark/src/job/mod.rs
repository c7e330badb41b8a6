//! Job records and their lifecycle state machine.

pub mod model;
pub mod status;

pub use model::{JobFilter, JobId, JobSnapshot, JobUpdate, NewJob, UpdateRejected};
pub use status::{JobStatus, ParseStatusError};
