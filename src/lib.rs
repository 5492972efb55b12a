// Library interface for krm-render
// Exposes the hydration engine for testing and embedding

pub mod condition;
pub mod error;
pub mod fnruntime;
pub mod hydrate;
pub mod image;
pub mod pkg;
pub mod resource;
pub mod results;

pub use error::{Error, Result};
