//! Emission model implementations.
//!
//! The model is a small, pure function so that fitting/search code can stay
//! independent of which backend evaluates it.

pub mod model;

pub use model::*;
