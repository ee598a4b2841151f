//! Bootstraps Kubernetes clusters whose nodes are containers on the local
//! container engine.

pub mod actions;
pub mod cluster;
pub mod concurrent;
pub mod config;
pub mod errors;
pub mod kubeadm;
pub mod kubeconfig;
pub mod load;
pub mod node;
pub mod patch;
pub mod provision;
pub mod runtime;
pub mod wait;
