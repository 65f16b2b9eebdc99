/*!
  Declares an EKS cluster and its ecosystem: node groups, IRSA-backed add-ons, Karpenter and VPC
  endpoints, on top of the resource graph in `models::stack`.
!*/
pub mod addon;
pub mod cluster;
pub mod collaborators;
pub mod composition;
pub mod endpoints;
pub mod error;
pub mod identity;
pub mod network;
pub mod nodegroup;

pub use error::{Error, Result};
