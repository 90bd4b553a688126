//! Space-filling-curve octree domain decomposition and halo exchange for particle codes
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod assignment;
pub mod backend;
pub mod comm;
pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod focus;
pub mod geometry;
pub mod halos;
pub mod octree;
pub mod sfc;
pub mod tools;
#[cfg(feature = "vtk")]
pub mod vtk;

pub use comm::{Communicator, SingleRank, ThreadComm};
#[cfg(feature = "mpi")]
pub use comm::MpiComm;
pub use config::DomainConfig;
pub use domain::{Domain, SyncSummary};
pub use error::{CommError, DomainError};
pub use exchange::{Field, ParticleData};
pub use geometry::{Boundary, BoundingBox};
