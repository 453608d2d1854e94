//! Type conversion utilities for FFI boundary
//!
//! Converts between request/outcome types and Python dicts.

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList};

use crate::events::handler::HandlerOutcome;
use crate::events::types::{TimeAdvanceGrant, TimeRequest};
use crate::federation::engine::RequestDisposition;
use crate::models::message::Message;
use crate::models::time_status::{TimeStatus, TriState};

/// Extract a required field from a Python dict with a clear error message
fn extract_required<'py, T: FromPyObject<'py>>(dict: &Bound<'py, PyDict>, key: &str) -> PyResult<T> {
    dict.get_item(key)?
        .ok_or_else(|| PyValueError::new_err(format!("Missing required field '{}'", key)))?
        .extract()
}

/// Extract an optional field, `None` when missing
fn extract_optional<'py, T: FromPyObject<'py>>(dict: &Bound<'py, PyDict>, key: &str) -> PyResult<Option<T>> {
    match dict.get_item(key)? {
        Some(value) if !value.is_none() => Ok(Some(value.extract()?)),
        _ => Ok(None),
    }
}

/// Parse a request dict such as `{"type": "time_advance_request", "time": 5.0}`
pub fn parse_time_request(dict: &Bound<'_, PyDict>) -> PyResult<TimeRequest> {
    let kind: String = extract_required(dict, "type")?;
    let request = match kind.as_str() {
        "enable_time_regulation" => TimeRequest::EnableTimeRegulation {
            federate_time: extract_optional(dict, "federate_time")?.unwrap_or(0.0),
            lookahead: extract_required(dict, "lookahead")?,
        },
        "disable_time_regulation" => TimeRequest::DisableTimeRegulation,
        "enable_time_constrained" => TimeRequest::EnableTimeConstrained,
        "disable_time_constrained" => TimeRequest::DisableTimeConstrained,
        "time_advance_request" => TimeRequest::TimeAdvanceRequest {
            time: extract_required(dict, "time")?,
            next_event: extract_optional(dict, "next_event")?.unwrap_or(false),
        },
        "next_event_request" => TimeRequest::TimeAdvanceRequest {
            time: extract_required(dict, "time")?,
            next_event: true,
        },
        "modify_lookahead" => TimeRequest::ModifyLookahead {
            lookahead: extract_required(dict, "lookahead")?,
        },
        "flush_queue_request" => TimeRequest::FlushQueueRequest {
            max_time: extract_required(dict, "max_time")?,
        },
        "enable_asynchronous_delivery" => TimeRequest::EnableAsynchronousDelivery,
        "disable_asynchronous_delivery" => TimeRequest::DisableAsynchronousDelivery,
        "regulation_acknowledged" => TimeRequest::RegulationAcknowledged {
            regulator: extract_required(dict, "regulator")?,
        },
        other => {
            return Err(PyValueError::new_err(format!(
                "Unknown time request type '{}'",
                other
            )))
        }
    };
    Ok(request)
}

fn tristate_name(state: TriState) -> &'static str {
    match state {
        TriState::Off => "off",
        TriState::Pending => "pending",
        TriState::On => "on",
    }
}

pub fn status_to_py(py: Python<'_>, status: &TimeStatus) -> PyResult<Py<PyDict>> {
    let dict = PyDict::new_bound(py);
    dict.set_item("federate", status.federate())?;
    dict.set_item("regulating", tristate_name(status.regulating()))?;
    dict.set_item("constrained", tristate_name(status.constrained()))?;
    dict.set_item("asynchronous", status.is_asynchronous())?;
    dict.set_item("lookahead", status.lookahead())?;
    dict.set_item("current_time", status.current_time())?;
    dict.set_item("requested_time", status.requested_time())?;
    Ok(dict.unbind())
}

pub fn grant_to_py(py: Python<'_>, grant: &TimeAdvanceGrant) -> PyResult<Py<PyDict>> {
    let dict = PyDict::new_bound(py);
    dict.set_item("federate", grant.federate)?;
    dict.set_item("time", grant.time)?;
    Ok(dict.unbind())
}

pub fn message_to_py(py: Python<'_>, message: &Message) -> PyResult<Py<PyDict>> {
    let dict = PyDict::new_bound(py);
    dict.set_item("kind", message.kind())?;
    dict.set_item("source", message.source)?;
    dict.set_item("timestamp", message.timestamp())?;
    Ok(dict.unbind())
}

fn outcome_to_py(py: Python<'_>, outcome: &HandlerOutcome) -> PyResult<Py<PyDict>> {
    let dict = PyDict::new_bound(py);
    dict.set_item("accepted", true)?;

    let grants = PyList::empty_bound(py);
    for grant in &outcome.grants {
        grants.append(grant_to_py(py, grant)?)?;
    }
    dict.set_item("grants", grants)?;

    let flushed = PyList::empty_bound(py);
    for message in &outcome.flushed {
        flushed.append(message_to_py(py, message)?)?;
    }
    dict.set_item("flushed", flushed)?;
    dict.set_item("num_broadcasts", outcome.broadcasts.len())?;
    Ok(dict.unbind())
}

pub fn disposition_to_py(py: Python<'_>, disposition: &RequestDisposition) -> PyResult<Py<PyDict>> {
    match disposition {
        RequestDisposition::Accepted(outcome) => outcome_to_py(py, outcome),
        RequestDisposition::Dropped => {
            let dict = PyDict::new_bound(py);
            dict.set_item("accepted", false)?;
            Ok(dict.unbind())
        }
    }
}
