//! PyO3 wrapper for Federation

use pyo3::exceptions::{PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;

use super::types::{disposition_to_py, message_to_py, parse_time_request, status_to_py};
use crate::federation::config::TimeConfig;
use crate::federation::engine::{Federation as RustFederation, NullBroadcaster};

/// Python wrapper for a federation's time management
///
/// # Example (from Python)
///
/// ```python
/// from hla_time_core import Federation
///
/// fed = Federation()
/// fed.join(1)
/// fed.request(1, {"type": "enable_time_regulation", "lookahead": 5.0})
/// print(fed.lbts())  # 5.0
/// ```
#[pyclass(name = "Federation")]
pub struct PyFederation {
    inner: RustFederation<NullBroadcaster>,
}

#[pymethods]
impl PyFederation {
    /// Create a federation, optionally from a JSON config string
    #[new]
    #[pyo3(signature = (config_json=None))]
    fn new(config_json: Option<&str>) -> PyResult<Self> {
        let config = match config_json {
            Some(json) => TimeConfig::from_json_str(json)
                .map_err(|e| PyValueError::new_err(format!("Invalid config: {}", e)))?,
            None => TimeConfig::default(),
        };
        let inner = RustFederation::new(config, NullBroadcaster)
            .map_err(|e| PyValueError::new_err(format!("Invalid config: {}", e)))?;
        Ok(PyFederation { inner })
    }

    fn id(&self) -> String {
        self.inner.id().to_string()
    }

    fn join(&self, federate: u32) {
        self.inner.join(federate);
    }

    fn resign(&self, federate: u32) -> PyResult<()> {
        self.inner
            .resign(federate)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))
    }

    /// Process a time-management request dict
    ///
    /// Returns `{"accepted": bool, "grants": [...], "flushed": [...]}`.
    /// Raises ValueError when the request is rejected.
    fn request(&self, py: Python<'_>, source: u32, request: &Bound<'_, PyDict>) -> PyResult<Py<PyDict>> {
        let request = parse_time_request(request)?;
        let disposition = self
            .inner
            .process(source, &request)
            .map_err(|e| PyValueError::new_err(e.to_string()))?;
        disposition_to_py(py, &disposition)
    }

    /// Next deliverable callback for `federate`, or None
    fn poll(&self, py: Python<'_>, federate: u32) -> PyResult<Option<Py<PyDict>>> {
        let message = self
            .inner
            .poll(federate)
            .map_err(|e| PyRuntimeError::new_err(e.to_string()))?;
        message.map(|m| message_to_py(py, &m)).transpose()
    }

    /// Federation LBTS (`inf` when nobody regulates)
    fn lbts(&self) -> f64 {
        self.inner.lbts()
    }

    fn status(&self, py: Python<'_>, federate: u32) -> PyResult<Option<Py<PyDict>>> {
        self.inner
            .status(federate)
            .map(|status| status_to_py(py, &status))
            .transpose()
    }
}
