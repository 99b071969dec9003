//! South side of the podlx CRI shim.
//!
//! Talks to the machine-container manager over its HTTP/UNIX-socket API
//! (container CRUD, state transitions, exec streams, images, files) and to
//! the CNI plugin tree for pod networking. Everything here returns the
//! classified errors of `podlx_core::error`; the CRI layer on top decides
//! how they surface.

pub mod image;
pub mod manager;
pub mod network;

pub use manager::client::ManagerClient;
pub use network::CniPlugin;
