//! One query module per table. All functions take a `&PgPool` and return
//! `anyhow::Result`, with optimistic locking on status transitions.

pub mod batches;
pub mod jobs;
pub mod model_configs;
pub mod task_events;
pub mod tasks;
