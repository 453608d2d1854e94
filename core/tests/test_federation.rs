//! Federation Engine Tests
//!
//! End-to-end flows through `Federation`: routing, publishing through the
//! broadcaster, the incoming-message cycle and concurrent use.

use hla_time_core::events::types::{TimeAdvanceGrant, TimeNotice, TimeRequest};
use hla_time_core::federation::{
    Federation, NullBroadcaster, Published, RecordingBroadcaster, RequestDisposition, TimeConfig,
};
use hla_time_core::models::message::{Message, Payload};
use hla_time_core::models::time_status::{FederateHandle, TimeStatusError};
use hla_time_core::{SaveRestoreStatus, TimeRequestError};
use std::sync::Arc;

// ============================================================================
// Test Helpers
// ============================================================================

fn recording_federation() -> (Federation<Arc<RecordingBroadcaster>>, Arc<RecordingBroadcaster>) {
    let broadcaster = Arc::new(RecordingBroadcaster::new());
    let federation = Federation::new(TimeConfig::default(), Arc::clone(&broadcaster)).unwrap();
    (federation, broadcaster)
}

fn regulate<B: hla_time_core::Broadcaster>(
    federation: &Federation<B>,
    federate: FederateHandle,
    lookahead: f64,
) {
    federation
        .process(
            federate,
            &TimeRequest::EnableTimeRegulation {
                federate_time: 0.0,
                lookahead,
            },
        )
        .unwrap();
    for peer in federation.members() {
        if peer != federate {
            federation
                .process(peer, &TimeRequest::RegulationAcknowledged { regulator: federate })
                .unwrap();
        }
    }
    assert!(federation.status(federate).unwrap().is_regulating());
}

fn constrain<B: hla_time_core::Broadcaster>(federation: &Federation<B>, federate: FederateHandle) {
    federation
        .process(federate, &TimeRequest::EnableTimeConstrained)
        .unwrap();
    let callback = federation.poll(federate).unwrap().unwrap();
    assert_eq!(callback.kind(), "TimeConstrainedEnabled");
}

fn advance(time: f64) -> TimeRequest {
    TimeRequest::TimeAdvanceRequest {
        time,
        next_event: false,
    }
}

fn grant(federate: FederateHandle, time: f64) -> TimeAdvanceGrant {
    TimeAdvanceGrant { federate, time }
}

// ============================================================================
// Request Flow
// ============================================================================

#[test]
fn test_regulator_gates_constrained_federate_end_to_end() {
    let (federation, broadcaster) = recording_federation();
    federation.join(1);
    federation.join(2);
    regulate(&federation, 1, 5.0);
    constrain(&federation, 2);
    assert_eq!(federation.lbts(), 5.0);

    let disposition = federation.process(2, &advance(10.0)).unwrap();
    assert!(disposition.outcome().unwrap().grants.is_empty());
    assert!(federation.status(2).unwrap().is_advancing());

    broadcaster.take();
    federation.process(1, &advance(5.0)).unwrap();
    assert_eq!(broadcaster.grants(), vec![grant(1, 5.0), grant(2, 10.0)]);
    assert_eq!(
        broadcaster.notices(),
        vec![TimeNotice::Request(advance(5.0))]
    );

    let delivered = federation.poll(2).unwrap().unwrap();
    assert_eq!(delivered.payload, Payload::TimeAdvanceGrant { time: 10.0 });
    assert_eq!(federation.status(2).unwrap().current_time(), 10.0);
}

#[test]
fn test_broadcasts_precede_grants() {
    let (federation, broadcaster) = recording_federation();
    federation.join(1);
    federation.process(1, &advance(3.0)).unwrap();

    assert_eq!(
        broadcaster.published(),
        vec![
            Published::Broadcast {
                source: 1,
                notice: TimeNotice::Request(advance(3.0)),
            },
            Published::Grant(grant(1, 3.0)),
        ]
    );
}

#[test]
fn test_rejected_request_publishes_nothing() {
    let (federation, broadcaster) = recording_federation();
    federation.join(1);
    federation.process(1, &advance(5.0)).unwrap();
    broadcaster.take();

    let err = federation.process(1, &advance(3.0)).unwrap_err();
    assert!(matches!(err, TimeRequestError::Status(_)));
    assert!(broadcaster.published().is_empty());
    assert_eq!(federation.status(1).unwrap().current_time(), 5.0);
}

#[test]
fn test_non_member_request_is_dropped() {
    let (federation, broadcaster) = recording_federation();
    federation.join(1);

    let disposition = federation
        .process(
            4,
            &TimeRequest::EnableTimeRegulation {
                federate_time: 0.0,
                lookahead: 1.0,
            },
        )
        .unwrap();
    assert_eq!(disposition, RequestDisposition::Dropped);
    assert!(!disposition.is_accepted());
    assert!(broadcaster.published().is_empty());
    assert_eq!(federation.lbts(), f64::INFINITY);
}

#[test]
fn test_resign_publishes_unblocked_grants() {
    let (federation, broadcaster) = recording_federation();
    for federate in [1, 2] {
        federation.join(federate);
    }
    regulate(&federation, 1, 2.0);
    constrain(&federation, 2);
    federation.process(2, &advance(6.0)).unwrap();
    broadcaster.take();

    federation.resign(1).unwrap();
    assert_eq!(broadcaster.grants(), vec![grant(2, 6.0)]);
    assert_eq!(federation.members(), vec![2]);
    assert!(federation.resign(1).is_err());
}

#[test]
fn test_delivered_event_retargets_next_event_request() {
    let (federation, broadcaster) = recording_federation();
    federation.join(1);
    federation.join(2);
    regulate(&federation, 2, 1.0);
    constrain(&federation, 1);

    federation
        .process(
            1,
            &TimeRequest::TimeAdvanceRequest {
                time: 100.0,
                next_event: true,
            },
        )
        .unwrap();
    federation
        .deliver(
            1,
            Message::timestamped(Some(2), 20.0, Payload::RemoveObject { object: 8 }),
        )
        .unwrap();
    broadcaster.take();

    federation.process(2, &advance(25.0)).unwrap();
    assert_eq!(broadcaster.grants(), vec![grant(1, 20.0), grant(2, 25.0)]);

    let released = federation.drain(1).unwrap();
    let kinds: Vec<_> = released.iter().map(|m| m.kind()).collect();
    assert_eq!(kinds, vec!["RemoveObject", "TimeAdvanceGrant"]);
}

// ============================================================================
// Incoming-Message Cycle
// ============================================================================

#[test]
fn test_idle_constrained_federate_holds_ro_interactions() {
    let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
    federation.join(1);
    federation.join(2);
    regulate(&federation, 1, 1.0);
    constrain(&federation, 2);

    federation
        .deliver(2, Message::timestamped(Some(1), 3.0, Payload::RemoveObject { object: 1 }))
        .unwrap();
    federation
        .deliver(2, Message::timestamped(Some(1), 1.0, Payload::RemoveObject { object: 2 }))
        .unwrap();
    federation
        .deliver(
            2,
            Message::receive_order(
                Some(1),
                Payload::Interaction {
                    class: 4,
                    data: Vec::new(),
                },
            ),
        )
        .unwrap();

    // idle at time 0: nothing may be delivered yet
    assert_eq!(federation.poll(2).unwrap(), None);

    federation.process(1, &advance(4.0)).unwrap();
    federation.process(2, &advance(5.0)).unwrap();
    let released: Vec<_> = federation
        .drain(2)
        .unwrap()
        .iter()
        .map(|m| (m.kind(), m.timestamp()))
        .collect();
    assert_eq!(
        released,
        vec![
            ("RemoveObject", Some(1.0)),
            ("RemoveObject", Some(3.0)),
            ("TimeAdvanceGrant", Some(5.0)),
        ]
    );
    assert_eq!(federation.queue_len(2), Some(1));

    federation
        .process(2, &TimeRequest::EnableAsynchronousDelivery)
        .unwrap();
    let released = federation.drain(2).unwrap();
    assert_eq!(released.len(), 1);
    assert_eq!(released[0].kind(), "Interaction");
}

#[test]
fn test_regulator_cannot_deliver_into_granted_past() {
    let (federation, broadcaster) = recording_federation();
    federation.join(1);
    federation.join(2);
    regulate(&federation, 1, 5.0);
    constrain(&federation, 2);
    federation.process(2, &advance(10.0)).unwrap();
    federation.process(1, &advance(5.0)).unwrap();
    assert_eq!(federation.status(2).unwrap().current_time(), 10.0);
    broadcaster.take();

    let err = federation
        .deliver(2, Message::timestamped(Some(1), 7.0, Payload::RemoveObject { object: 1 }))
        .unwrap_err();
    assert_eq!(
        err,
        TimeRequestError::Status(TimeStatusError::InvalidTimestamp {
            timestamp: 7.0,
            bound: 10.0
        })
    );
    assert!(broadcaster.published().is_empty());

    let released: Vec<_> = federation
        .drain(2)
        .unwrap()
        .iter()
        .map(|m| (m.kind(), m.timestamp()))
        .collect();
    assert_eq!(released, vec![("TimeAdvanceGrant", Some(10.0))]);
}

#[test]
fn test_lits_tracks_regulator_progress() {
    let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
    federation.join(1);
    federation.join(2);
    regulate(&federation, 1, 2.0);
    constrain(&federation, 2);
    assert_eq!(federation.lits_for(2), Some(2.0));

    federation.process(1, &advance(6.0)).unwrap();
    assert_eq!(federation.lits_for(2), Some(8.0));
    assert_eq!(federation.lits_for(5), None);
}

#[test]
fn test_unconstrained_federate_receives_tso_as_ro() {
    let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
    federation.join(1);
    federation
        .deliver(1, Message::timestamped(Some(2), 50.0, Payload::RemoveObject { object: 1 }))
        .unwrap();

    let message = federation.poll(1).unwrap().unwrap();
    assert_eq!(message.timestamp(), None);
}

// ============================================================================
// Save / Restore Gate
// ============================================================================

#[test]
fn test_save_blocks_advances_until_complete() {
    let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
    federation.join(1);

    federation.begin_save().unwrap();
    assert_eq!(federation.save_restore_status(), SaveRestoreStatus::Saving);
    assert_eq!(
        federation.process(1, &advance(1.0)).unwrap_err(),
        TimeRequestError::SaveInProgress
    );

    federation.complete_save().unwrap();
    assert!(federation.process(1, &advance(1.0)).unwrap().is_accepted());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_unconstrained_federates() {
    let federation = Federation::new(TimeConfig::default(), NullBroadcaster).unwrap();
    for federate in 0..4 {
        federation.join(federate);
    }

    std::thread::scope(|scope| {
        for federate in 0..4 {
            let federation = &federation;
            scope.spawn(move || {
                for step in 1..=50 {
                    federation.process(federate, &advance(step as f64)).unwrap();
                }
            });
        }
    });

    for federate in 0..4 {
        assert_eq!(federation.status(federate).unwrap().current_time(), 50.0);
    }
}

#[test]
fn test_regulator_thread_releases_constrained_federate() {
    let (federation, broadcaster) = recording_federation();
    federation.join(1);
    federation.join(2);
    regulate(&federation, 1, 1.0);
    constrain(&federation, 2);
    federation.process(2, &advance(50.0)).unwrap();

    let shared = Arc::new(federation);
    let regulator = {
        let federation = Arc::clone(&shared);
        std::thread::spawn(move || {
            for step in 1..=60 {
                federation.process(1, &advance(step as f64)).unwrap();
            }
        })
    };
    regulator.join().unwrap();

    assert_eq!(shared.status(2).unwrap().current_time(), 50.0);
    assert!(broadcaster.grants().contains(&grant(2, 50.0)));
    assert_eq!(shared.lbts(), 61.0);
}
