//! Asynchronous grading-job pipeline
//!
//! This library accepts grading requests for submission versions, hands them to
//! a Redis-backed dispatch queue and executes them in worker processes that
//! call an external grader (or grade objective questions by rule), with
//! bounded retries and exactly-once result persistence in PostgreSQL.

pub mod app_state;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod routes;
pub mod services;
pub mod store;
