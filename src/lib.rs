// Distributed proper orthogonal decomposition (POD)

#![doc = include_str!("../README.md")]

pub mod comm;
pub mod error;
pub mod linalg;
pub mod ops;
pub mod partition;
pub mod pod;
pub mod tsqr;

pub use comm::{run_group, ChannelGroup, ProcessGroup, ReduceOp, SerialGroup};
pub use error::{PodError, Result};
pub use tsqr::{tsqr_svd, TsqrSvdOutput};
