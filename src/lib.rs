//! Convoy: a multi-cluster progressive rollout controller
//!
//! Convoy moves traffic and compute capacity from an incumbent release to a
//! contender release across a set of workload clusters, advancing through a
//! declared strategy one step at a time. The strategy loop decides which
//! target objects need patches; the traffic loop realises weight splits by
//! flipping labels on individual pods.

pub mod clusters;
pub mod controller;
pub mod crd;
pub mod shutdown;
