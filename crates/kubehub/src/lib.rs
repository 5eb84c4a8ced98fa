//! Keel kubehub: kube-rs backed resource client and Kubernetes status polling.

#![forbid(unsafe_code)]

pub mod client;
pub mod status;

pub use client::{KubeError, KubeResourceClient};
pub use status::{compute_status, ClientStatusPoller};
