//! Custom Resource Definitions for Meshplane
//!
//! This module contains the CRD definitions owned by the management cluster.

mod cluster;

pub use cluster::{KubernetesCluster, KubernetesClusterSpec, SecretRef};
