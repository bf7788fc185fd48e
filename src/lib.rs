//! kobold - a GitOps image-update controller.
//!
//! Registry push notifications arrive on named channels, are decoded into
//! image references and stored as pending tasks. After a quiet period the
//! pending tasks are grouped per target repository and handed to a bounded
//! pool of workers that rewrite, commit and push the references.

pub mod app;
pub mod config;
pub mod git;
pub mod handler;
pub mod metrics;
pub mod plugin;
pub mod pool;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod types;
