//! Python bindings (feature `pyo3`)

pub mod federation;
pub mod types;
