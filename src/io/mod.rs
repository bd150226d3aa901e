//! Input/output helpers.
//!
//! - grid snapshot JSON freeze/thaw (`store`)
//! - CSV exports of fitted grids (`export`)

pub mod export;
pub mod store;

pub use export::*;
pub use store::*;
