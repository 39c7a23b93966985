//! Python bindings for medfeed.
//!
//! Built with the `python` feature as the `_medfeed` extension module.

// pyo3 macro expansions contain unsafe blocks.
#![allow(unsafe_code)]

pub mod conversion;
pub mod logging;
pub mod module;
pub mod streams;
pub mod validation;
