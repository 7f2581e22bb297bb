//! Shared primitives for the cyanea workspace.
//!
//! - **Error types**: [`CyaneaError`] and [`Result`] for structured error handling
//! - **Traits**: small contracts such as [`Summarizable`] and [`Annotated`]
//!   implemented by the model and move types of the other crates

pub mod error;
pub mod traits;

pub use error::{CyaneaError, Result};
pub use traits::*;
