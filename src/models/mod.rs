pub mod grading;
pub mod job;
pub mod payload;
pub mod snapshot;
pub mod submission;
