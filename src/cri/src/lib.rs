//! podlx CRI - Kubernetes Container Runtime Interface implementation.
//!
//! Maps CRI concepts onto a machine-container manager:
//! - Pod Sandbox → infra container owning the pod's network namespace
//! - Container → manager container joined to the sandbox's network
//! - Image → entry in the manager's image store

pub mod container;
pub mod error;
pub mod image_service;
pub mod mapper;
pub mod runtime_service;
pub mod sandbox;
pub mod server;
pub mod streaming;

/// Generated CRI v1alpha2 protobuf types.
pub mod cri_api {
    tonic::include_proto!("runtime.v1alpha2");
}
