//! Building blocks for declaring an EKS platform as a graph of cloud resources.
//!
//! Declarations go through a [`stack::Stack`], which hands them to a
//! [`engine::ProvisioningEngine`] once everything they depend on exists. Attributes that only
//! exist after creation are [`output::Output`]s.
pub mod config;
pub mod constants;
pub mod engine;
pub mod graph;
pub mod output;
pub mod policy;
pub mod stack;
pub mod telemetry;
