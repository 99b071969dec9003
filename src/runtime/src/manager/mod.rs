//! Client for the machine-container manager.
//!
//! The manager exposes a REST API over a UNIX socket. Mutations return
//! background operations; [`operation::OperationHandle`] is the single
//! submit-then-await helper every mutating call composes.

pub mod client;
pub mod operation;
pub mod rest;
pub mod types;

pub use client::{ExecSession, ManagerClient};
pub use operation::OperationHandle;
