pub mod grading;
pub mod health;
pub mod metrics;
