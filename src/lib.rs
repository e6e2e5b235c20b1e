//! Conway's Game of Life run by a cohort of processes that a broker spawns
//! on demand. A manager splits the grid into row partitions, workers step
//! them and swap boundary rows with their ring neighbours every tick, and
//! the client steers the run with STOP/CONTINUE/SNAPSHOT directives.

pub mod cohort;
pub mod config;
pub mod hex;
pub mod life;
pub mod net;

#[cfg(feature = "broker")]
pub mod broker;
#[cfg(feature = "client")]
pub mod client;

pub use net::error::{Error, ErrorKind, Result};
