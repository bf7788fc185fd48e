//! Core domain types for the image-update controller.
//!
//! This module contains the task model shared by the store, the worker pool
//! and the handlers.

pub mod ids;
pub mod task;
pub mod uri;

pub use ids::{Fingerprint, TaskId};
pub use task::{PostHook, Task, TaskGroup, TaskStatus, UnknownStatus};
pub use uri::{InvalidPackageUri, PackageUri};
