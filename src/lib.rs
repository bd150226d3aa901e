//! `beem-fit` library crate.
//!
//! The binary (`beem`) is a thin wrapper around this library so that:
//!
//! - the fitting core is testable without spawning processes
//! - grids can be built, fitted and saved from other Rust code
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
