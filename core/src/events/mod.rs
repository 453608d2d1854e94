//! Time-management requests, notices and their handlers

pub mod handler;
pub mod types;

pub use handler::{
    HandlerContext, HandlerOutcome, SaveRestoreStatus, TimeRequestError, TimeRequestHandler,
};
pub use types::{RequestEnvelope, TimeAdvanceGrant, TimeNotice, TimeRequest};
