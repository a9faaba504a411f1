//! Execution environments (backends) for the ASG.
//!
//! `backend` defines the trait, `cpu_backend` evaluates graphs with
//! `ndarray`, and `compiled` binds a shape-checked graph to a parameter store.

pub mod backend;
pub mod compiled;
pub mod cpu_backend;
