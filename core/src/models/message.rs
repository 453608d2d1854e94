//! Incoming messages held in a federate's event queue
//!
//! Payload contents (attribute values, parameters) are opaque bytes here: the
//! wire format belongs to the transport layer. What the time core cares about
//! is the delivery order of a message and whether it counts as a "message" in
//! the HLA sense (reflect, interaction, remove) or as a plain callback.
//!
//! # Example
//!
//! ```rust
//! use hla_time_core::models::message::{Message, Payload};
//!
//! let msg = Message::timestamped(Some(2), 42.0, Payload::Interaction {
//!     class: 7,
//!     data: vec![1, 2, 3],
//! });
//! assert_eq!(msg.timestamp(), Some(42.0));
//! assert!(msg.is_object_message());
//! ```

use crate::models::time_status::FederateHandle;
use serde::{Deserialize, Serialize};

/// Delivery order of a queued message
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "order", rename_all = "snake_case")]
pub enum Delivery {
    /// Delivered as soon as the release rules allow
    ReceiveOrder,

    /// Delivered in timestamp order, never before the federate's time reaches `time`
    TimestampOrder { time: f64 },
}

/// Callback carried by a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Attribute reflection for an object instance
    Reflect { object: u64, data: Vec<u8> },

    /// Received interaction
    Interaction { class: u32, data: Vec<u8> },

    /// Object instance removal
    RemoveObject { object: u64 },

    /// Time advance grant for the receiving federate
    TimeAdvanceGrant { time: f64 },

    /// Regulation enable confirmed
    TimeRegulationEnabled { time: f64 },

    /// Constrained enable confirmed
    TimeConstrainedEnabled { time: f64 },

    /// Any other callback (sync points, ownership notices, ...)
    Notification { name: String },
}

/// A message waiting in an event queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sending federate, `None` for callbacks generated by the time core
    pub source: Option<FederateHandle>,
    pub delivery: Delivery,
    pub payload: Payload,
}

impl Message {
    pub fn receive_order(source: Option<FederateHandle>, payload: Payload) -> Self {
        Self {
            source,
            delivery: Delivery::ReceiveOrder,
            payload,
        }
    }

    pub fn timestamped(source: Option<FederateHandle>, time: f64, payload: Payload) -> Self {
        Self {
            source,
            delivery: Delivery::TimestampOrder { time },
            payload,
        }
    }

    /// Grant callback, queued TSO at the granted time
    pub fn time_advance_grant(time: f64) -> Self {
        Self::timestamped(None, time, Payload::TimeAdvanceGrant { time })
    }

    pub fn timestamp(&self) -> Option<f64> {
        match self.delivery {
            Delivery::ReceiveOrder => None,
            Delivery::TimestampOrder { time } => Some(time),
        }
    }

    pub fn is_timestamped(&self) -> bool {
        self.timestamp().is_some()
    }

    pub fn is_time_advance(&self) -> bool {
        matches!(self.payload, Payload::TimeAdvanceGrant { .. })
    }

    /// Reflections, interactions and removals
    ///
    /// A constrained federate without asynchronous delivery only receives these
    /// while it has an advance outstanding.
    pub fn is_object_message(&self) -> bool {
        matches!(
            self.payload,
            Payload::Reflect { .. } | Payload::Interaction { .. } | Payload::RemoveObject { .. }
        )
    }

    /// Drop the timestamp, turning the message into a receive-order message
    pub fn into_receive_order(mut self) -> Self {
        self.delivery = Delivery::ReceiveOrder;
        self
    }

    /// Short name of the payload kind, for logs
    pub fn kind(&self) -> &'static str {
        match self.payload {
            Payload::Reflect { .. } => "Reflect",
            Payload::Interaction { .. } => "Interaction",
            Payload::RemoveObject { .. } => "RemoveObject",
            Payload::TimeAdvanceGrant { .. } => "TimeAdvanceGrant",
            Payload::TimeRegulationEnabled { .. } => "TimeRegulationEnabled",
            Payload::TimeConstrainedEnabled { .. } => "TimeConstrainedEnabled",
            Payload::Notification { .. } => "Notification",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_is_not_an_object_message() {
        let grant = Message::time_advance_grant(5.0);
        assert!(grant.is_time_advance());
        assert!(!grant.is_object_message());
        assert_eq!(grant.timestamp(), Some(5.0));
    }

    #[test]
    fn test_into_receive_order_drops_timestamp() {
        let msg = Message::timestamped(Some(1), 3.0, Payload::RemoveObject { object: 9 });
        let ro = msg.into_receive_order();
        assert_eq!(ro.timestamp(), None);
        assert_eq!(ro.kind(), "RemoveObject");
    }
}
