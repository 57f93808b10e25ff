//! End-to-end coordinator scenarios over scripted collaborators

mod common;

use std::time::Duration;

use common::{call_ended, eventually, host, prune_config, test_config, Harness, LOCAL_SESSION};
use relaycall_core::error::{Error, RelayError, SignalingError};
use relaycall_core::models::{Participant, ParticipantId, PullState, PushState, TrackId};
use relaycall_core::traits::{CloseReason, SignalingEvent};
use relaycall_core::{CallEvent, CallSnapshot, CallState, EndReason};
use relaycall_proto::relay::{SessionDescription, TrackObject, TrackResult, TracksResponse};
use relaycall_proto::{OutboundMessage, ParticipantState, ProtoError, TrackKind, TrackState};
use serde_json::json;

fn pull_state(snapshot: &CallSnapshot, participant: &str, track: &str) -> Option<PullState> {
    snapshot
        .participants
        .iter()
        .find(|p| p.id.as_str() == participant)?
        .track(&TrackId::new(track))
        .map(|t| t.pull_state().clone())
}

fn participant<'a>(snapshot: &'a CallSnapshot, id: &str) -> &'a Participant {
    snapshot
        .participants
        .iter()
        .find(|p| p.id.as_str() == id)
        .unwrap()
}

fn is_active(s: &CallSnapshot) -> bool {
    s.state == CallState::Active
}

#[tokio::test(start_paused = true)]
async fn test_host_track_pulled_in_one_batch() {
    let harness = Harness::start();
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();

    let snapshot = harness
        .wait_for(|s| is_active(s) && pull_state(s, "p1", "t1") == Some(PullState::Pulled))
        .await;

    assert_eq!(
        harness.relay.pull_requests(),
        vec![vec![TrackObject::remote("t1", "s1")]]
    );
    assert_eq!(snapshot.session.unwrap().id.as_str(), LOCAL_SESSION);
    assert_eq!(harness.signaling.tokens(), vec!["test-key".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_renegotiation_runs_before_track_is_pulled() {
    let harness = Harness::start_with(test_config(), |_, relay, _| {
        relay.script_pull(Ok(TracksResponse {
            requires_immediate_renegotiation: true,
            session_description: Some(SessionDescription::offer("relay-offer")),
            tracks: vec![TrackResult {
                mid: Some("0".to_string()),
                track_name: Some("t1".to_string()),
                ..TrackResult::default()
            }],
        }));
    });
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();

    let snapshot = harness
        .wait_for(|s| is_active(s) && pull_state(s, "p1", "t1") == Some(PullState::Pulled))
        .await;

    assert_eq!(
        harness.log.since("pull_tracks"),
        vec![
            "pull_tracks",
            "set_remote_description:offer",
            "create_answer",
            "set_local_description:answer",
            "renegotiate:answer",
        ]
    );
    assert_eq!(
        harness.relay.renegotiations(),
        vec![SessionDescription::answer("local-answer")]
    );

    let t1 = participant(&snapshot, "p1").track(&TrackId::new("t1")).unwrap();
    assert_eq!(t1.pull_state(), &PullState::Pulled);
    assert_eq!(t1.mid(), Some("0"));
}

#[tokio::test(start_paused = true)]
async fn test_renegotiation_rejected_by_engine_fails_batch() {
    let harness = Harness::start_with(test_config(), |_, relay, negotiator| {
        relay.script_pull(Ok(TracksResponse {
            requires_immediate_renegotiation: true,
            session_description: Some(SessionDescription::offer("relay-offer")),
            tracks: vec![],
        }));
        negotiator.reject_next_remote(
            relaycall_core::error::NegotiationError::Rejected("state mismatch".to_string()),
        );
    });
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();

    let snapshot = harness
        .wait_for(|s| matches!(pull_state(s, "p1", "t1"), Some(PullState::Failed(_))))
        .await;
    assert!(matches!(
        pull_state(&snapshot, "p1", "t1"),
        Some(PullState::Failed(reason)) if reason.contains("state mismatch")
    ));
    assert_eq!(snapshot.state, CallState::Active);
    assert!(harness.relay.renegotiations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_call_null_ends_and_tears_down() {
    let mut harness = Harness::start();
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();
    harness.wait_for(is_active).await;

    harness.deliver(call_ended());
    let snapshot = harness.wait_for(|s| s.state == CallState::Ended).await;

    assert!(harness.negotiator.is_closed());
    assert!(snapshot.participants.is_empty());
    assert!(snapshot.session.is_none());
    assert_eq!(snapshot.end_reason, Some(EndReason::Remote));
    assert_eq!(harness.signaling.disconnects(), 1);

    let final_snapshot = (&mut harness.task).await.unwrap();
    assert_eq!(final_snapshot.state, CallState::Ended);
    assert!(harness
        .drain_events()
        .contains(&CallEvent::Ended(EndReason::Remote)));
    assert!(harness.handle.accept().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_call_null_before_any_call_is_ignored() {
    let harness = Harness::start();
    harness.deliver(call_ended());
    harness.deliver_participants(json!([host("p1", &[])]));

    let snapshot = harness
        .wait_for(|s| s.state == CallState::SessionCreated)
        .await;
    assert_eq!(snapshot.participants.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pull_transport_failure_only_affects_its_batch() {
    let harness = Harness::start();
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();
    harness
        .wait_for(|s| pull_state(s, "p1", "t1") == Some(PullState::Pulled))
        .await;

    harness
        .relay
        .script_pull(Err(RelayError::Transport("connection reset".to_string())));
    harness.deliver_participants(json!([host("p1", &["s1/t1", "s1/t2"])]));

    let snapshot = harness
        .wait_for(|s| matches!(pull_state(s, "p1", "t2"), Some(PullState::Failed(_))))
        .await;

    assert_eq!(pull_state(&snapshot, "p1", "t1"), Some(PullState::Pulled));
    assert_eq!(snapshot.state, CallState::Active);
    assert!(matches!(
        snapshot.last_error,
        Some(Error::Relay(RelayError::Transport(_)))
    ));
    assert_eq!(
        harness.relay.pull_requests()[1],
        vec![TrackObject::remote("t2", "s1")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_per_track_error_and_explicit_retry() {
    let harness = Harness::start_with(test_config(), |_, relay, _| {
        relay.script_pull(Ok(TracksResponse {
            tracks: vec![
                TrackResult {
                    mid: Some("0".to_string()),
                    track_name: Some("t1".to_string()),
                    ..TrackResult::default()
                },
                TrackResult {
                    track_name: Some("t2".to_string()),
                    error_code: Some("404".to_string()),
                    error_description: Some("track not found".to_string()),
                    ..TrackResult::default()
                },
            ],
            ..TracksResponse::default()
        }));
    });
    harness.deliver_participants(json!([host("p1", &["s1/t1", "s1/t2"])]));
    harness.handle.accept().await.unwrap();

    let snapshot = harness
        .wait_for(|s| matches!(pull_state(s, "p1", "t2"), Some(PullState::Failed(_))))
        .await;
    assert_eq!(pull_state(&snapshot, "p1", "t1"), Some(PullState::Pulled));
    assert_eq!(
        pull_state(&snapshot, "p1", "t2"),
        Some(PullState::Failed("404: track not found".to_string()))
    );

    // No automatic retry
    harness.deliver_participants(json!([host("p1", &["s1/t1", "s1/t2"])]));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(harness.relay.pull_requests().len(), 1);

    harness.handle.retry_failed_pulls().await.unwrap();
    harness
        .wait_for(|s| pull_state(s, "p1", "t2") == Some(PullState::Pulled))
        .await;
    assert_eq!(
        harness.relay.pull_requests()[1],
        vec![TrackObject::remote("t2", "s1")]
    );
}

#[tokio::test(start_paused = true)]
async fn test_same_update_twice_pulls_once() {
    let harness = Harness::start();
    let payload = json!([host("p1", &["s1/t1"])]);
    harness.deliver_participants(payload.clone());
    harness.handle.accept().await.unwrap();
    let first = harness
        .wait_for(|s| is_active(s) && pull_state(s, "p1", "t1") == Some(PullState::Pulled))
        .await;

    harness.deliver_participants(payload);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(harness.relay.pull_requests().len(), 1);
    assert_eq!(harness.handle.snapshot().participants, first.participants);
}

#[tokio::test(start_paused = true)]
async fn test_at_most_one_round_in_flight() {
    let harness = Harness::start_with(test_config(), |_, relay, negotiator| {
        relay.set_latency(Duration::from_millis(50));
        negotiator.set_latency(Duration::from_millis(20));
        negotiator.add_local_track("mic", TrackKind::Audio);
        relay.script_pull(Ok(TracksResponse {
            requires_immediate_renegotiation: true,
            session_description: Some(SessionDescription::offer("relay-offer")),
            tracks: ["t1", "t2", "t3"]
                .iter()
                .enumerate()
                .map(|(i, name)| TrackResult {
                    mid: Some(format!("{}", i + 2)),
                    track_name: Some((*name).to_string()),
                    ..TrackResult::default()
                })
                .collect(),
        }));
    });

    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();
    harness.deliver_participants(json!([host("p1", &["s1/t1", "s1/t2"])]));
    harness.negotiator.add_local_track("cam", TrackKind::Video);
    harness.handle.local_tracks_changed().await.unwrap();
    harness.deliver_participants(json!([host("p1", &["s1/t1", "s1/t2"]), host("p2", &["s2/t3"])]));

    let snapshot = harness
        .wait_for(|s| {
            ["t1", "t2"]
                .iter()
                .all(|t| pull_state(s, "p1", t) == Some(PullState::Pulled))
                && pull_state(s, "p2", "t3") == Some(PullState::Pulled)
        })
        .await;

    assert_eq!(harness.negotiator.peak_in_flight(), 1);
    assert_eq!(harness.relay.peak_in_flight(), 1);

    let me = participant(&snapshot, "me");
    assert!(me
        .tracks
        .iter()
        .all(|t| t.push_state() == &PushState::Pushed));
    assert_eq!(me.tracks.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_track_id_is_reported_not_fatal() {
    let mut harness = Harness::start();
    harness.deliver_participants(json!([host("p1", &["no-separator", "s1/t1"])]));
    harness.handle.accept().await.unwrap();

    let snapshot = harness
        .wait_for(|s| is_active(s) && pull_state(s, "p1", "t1") == Some(PullState::Pulled))
        .await;
    assert_eq!(participant(&snapshot, "p1").tracks.len(), 1);

    let events = harness.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::Error(Error::Protocol(ProtoError::MalformedTrackId { raw, .. })) if raw == "no-separator"
    )));
}

#[tokio::test(start_paused = true)]
async fn test_decode_error_and_unknown_messages_are_not_fatal() {
    let harness = Harness::start();
    harness.deliver(SignalingEvent::DecodeError(ProtoError::Malformed(
        "expected value at line 1".to_string(),
    )));
    harness.deliver(SignalingEvent::Message(relaycall_proto::InboundMessage::Unknown));
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();

    let snapshot = harness
        .wait_for(|s| {
            matches!(s.last_error, Some(Error::Protocol(_)))
                && pull_state(s, "p1", "t1") == Some(PullState::Pulled)
        })
        .await;
    assert_eq!(snapshot.state, CallState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_push_publishes_local_tracks_then_pulls() {
    let harness = Harness::start_with(test_config(), |_, _, negotiator| {
        negotiator.add_local_track("mic", TrackKind::Audio);
    });
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();
    harness
        .wait_for(|s| pull_state(s, "p1", "t1") == Some(PullState::Pulled))
        .await;

    assert_eq!(
        harness.log.since("create_offer"),
        vec![
            "create_offer",
            "set_local_description:offer",
            "push_tracks",
            "set_remote_description:answer",
            "pull_tracks",
        ]
    );
    assert_eq!(
        harness.relay.push_requests(),
        vec![vec![TrackObject::local("mic", "0")]]
    );

    let sent = harness.signaling.sent();
    assert_eq!(sent[0], OutboundMessage::ParticipantJoined);
    let OutboundMessage::ParticipantUpdate { participant } = &sent[1] else {
        panic!("expected participantUpdate, got {:?}", sent[1]);
    };
    assert_eq!(participant.state, ParticipantState::Joined);
    assert_eq!(participant.transceiver_session_id.as_deref(), Some(LOCAL_SESSION));
    assert_eq!(participant.tracks.len(), 1);
    assert_eq!(participant.tracks[0].id, format!("{LOCAL_SESSION}/mic"));
    assert_eq!(participant.tracks[0].kind, TrackKind::Audio);
    assert_eq!(participant.tracks[0].state, TrackState::Inactive);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_local_participant_pushes_only_new_tracks() {
    let mut config = test_config();
    config.credentials.id = None;
    let harness = Harness::start_with(config, |_, _, negotiator| {
        negotiator.add_local_track("mic", TrackKind::Audio);
    });
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();
    harness
        .wait_for(|s| pull_state(s, "p1", "t1") == Some(PullState::Pulled))
        .await;

    harness.negotiator.add_local_track("cam", TrackKind::Video);
    harness.handle.local_tracks_changed().await.unwrap();
    eventually(|| harness.relay.push_requests().len() == 2).await;

    assert_eq!(
        harness.relay.push_requests(),
        vec![
            vec![TrackObject::local("mic", "0")],
            vec![TrackObject::local("cam", "1")],
        ]
    );

    // The announcement still lists everything published so far
    eventually(|| {
        harness.signaling.sent().iter().any(|m| {
            matches!(m, OutboundMessage::ParticipantUpdate { participant } if participant.tracks.len() == 2)
        })
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn test_push_failure_ends_call() {
    let harness = Harness::start_with(test_config(), |_, relay, negotiator| {
        negotiator.add_local_track("mic", TrackKind::Audio);
        relay.script_push(Err(RelayError::Api {
            status: 500,
            message: "internal".to_string(),
        }));
    });
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();

    let snapshot = harness.wait_for(|s| s.state == CallState::Ended).await;
    assert!(matches!(
        snapshot.end_reason,
        Some(EndReason::Failed(Error::Relay(RelayError::Api { status: 500, .. })))
    ));
    assert!(harness.relay.pull_requests().is_empty());
    assert!(harness.negotiator.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_create_session_failure_ends_call() {
    let harness = Harness::start_with(test_config(), |_, relay, _| {
        relay.script_create_session(Err(RelayError::Authentication("401".to_string())));
    });
    harness.deliver_participants(json!([host("p1", &[])]));

    let snapshot = harness.wait_for(|s| s.state == CallState::Ended).await;
    assert!(matches!(
        snapshot.last_error,
        Some(Error::Relay(RelayError::Authentication(_)))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_accept_before_session_is_deferred_not_dropped() {
    let mut harness = Harness::start();
    harness.handle.accept().await.unwrap();

    harness.wait_for(is_active).await;
    let states: Vec<_> = harness
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CallEvent::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            CallState::SessionCreated,
            CallState::Negotiating,
            CallState::Active
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_decline_publishes_and_ends() {
    let harness = Harness::start();
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness
        .wait_for(|s| s.state == CallState::SessionCreated)
        .await;

    harness.handle.decline().await.unwrap();
    let snapshot = harness.wait_for(|s| s.state == CallState::Ended).await;
    assert_eq!(snapshot.end_reason, Some(EndReason::Declined));

    let last = harness.signaling.sent().pop().unwrap();
    let OutboundMessage::ParticipantUpdate { participant } = last else {
        panic!("expected participantUpdate");
    };
    assert_eq!(participant.state, ParticipantState::Declined);
    assert!(participant.tracks.is_empty());
    assert!(harness.relay.pull_requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_leave_cancels_in_flight_round() {
    let harness = Harness::start_with(test_config(), |_, relay, _| {
        relay.set_latency(Duration::from_secs(5));
    });
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();
    eventually(|| harness.log.entries().contains(&"pull_tracks".to_string())).await;

    harness.handle.leave().await.unwrap();
    let snapshot = harness.wait_for(|s| s.state == CallState::Ended).await;

    assert_eq!(snapshot.end_reason, Some(EndReason::Left));
    let OutboundMessage::ParticipantUpdate { participant } =
        harness.signaling.sent().pop().unwrap()
    else {
        panic!("expected participantUpdate");
    };
    assert_eq!(participant.state, ParticipantState::None);
    assert!(participant.tracks.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_recoverable_close_reconnects_and_republishes() {
    let harness = Harness::start_with(test_config(), |_, _, negotiator| {
        negotiator.add_local_track("mic", TrackKind::Audio);
    });
    let second = harness.signaling.script_connection();
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();
    harness
        .wait_for(|s| pull_state(s, "p1", "t1") == Some(PullState::Pulled))
        .await;
    eventually(|| harness.signaling.sent().len() == 2).await;

    harness.deliver(SignalingEvent::Closed(CloseReason::GoingAway));
    eventually(|| harness.signaling.connects() == 2).await;
    eventually(|| harness.signaling.sent().len() >= 4).await;

    let sent = harness.signaling.sent();
    assert_eq!(sent[2], OutboundMessage::ParticipantJoined);
    let OutboundMessage::ParticipantUpdate { participant } = &sent[3] else {
        panic!("expected participantUpdate after reconnect");
    };
    assert_eq!(participant.tracks[0].id, format!("{LOCAL_SESSION}/mic"));
    assert_eq!(harness.handle.snapshot().state, CallState::Active);
    assert_eq!(harness.signaling.tokens(), vec!["test-key", "test-key"]);

    // The new connection keeps feeding the registry
    second
        .send(common::user_state(json!([host("p1", &["s1/t1", "s1/t2"])])))
        .unwrap();
    harness
        .wait_for(|s| pull_state(s, "p1", "t2") == Some(PullState::Pulled))
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_exhaustion_ends_call() {
    let harness = Harness::start();
    harness.deliver_participants(json!([host("p1", &[])]));
    harness.handle.accept().await.unwrap();
    harness.wait_for(is_active).await;

    harness.deliver(SignalingEvent::Closed(CloseReason::Abnormal(
        "connection reset".to_string(),
    )));
    let snapshot = harness.wait_for(|s| s.state == CallState::Ended).await;

    assert!(matches!(
        snapshot.end_reason,
        Some(EndReason::Failed(Error::Transport(_)))
    ));
    // One immediate attempt plus the configured retries
    assert_eq!(harness.signaling.connects(), 1 + 1 + 3);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_reconnect_ends_immediately() {
    let harness = Harness::start_with(test_config(), |signaling, _, _| {
        signaling.script_failure(SignalingError::Rejected("401 unauthorized".to_string()));
    });
    harness.deliver_participants(json!([host("p1", &[])]));
    harness.wait_for(|s| s.state == CallState::SessionCreated).await;

    harness.deliver(SignalingEvent::Closed(CloseReason::HeartbeatTimeout));
    let snapshot = harness.wait_for(|s| s.state == CallState::Ended).await;

    assert!(matches!(
        snapshot.last_error,
        Some(Error::Signaling(SignalingError::Rejected(_)))
    ));
    assert_eq!(harness.signaling.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_normal_close_ends_call() {
    let harness = Harness::start();
    harness.deliver_participants(json!([host("p1", &[])]));
    harness.handle.accept().await.unwrap();
    harness.wait_for(is_active).await;

    harness.deliver(SignalingEvent::Closed(CloseReason::Normal));
    let snapshot = harness.wait_for(|s| s.state == CallState::Ended).await;
    assert!(matches!(snapshot.end_reason, Some(EndReason::Failed(_))));
    assert_eq!(harness.signaling.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pruned_participant_pull_result_is_discarded() {
    let mut harness = Harness::start_with(prune_config(), |_, relay, _| {
        relay.set_latency(Duration::from_millis(200));
    });
    harness.deliver_participants(json!([host("p1", &["s1/t1"])]));
    harness.handle.accept().await.unwrap();
    eventually(|| harness.log.entries().contains(&"pull_tracks".to_string())).await;

    harness.deliver_participants(json!([host("p2", &[])]));
    harness.wait_for(|s| s.state == CallState::Active).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let snapshot = harness.handle.snapshot();
    assert!(snapshot
        .participants
        .iter()
        .all(|p| p.id != ParticipantId::new("p1")));
    let events = harness.drain_events();
    assert!(!events
        .iter()
        .any(|e| matches!(e, CallEvent::TrackPulled { .. })));
    assert!(events.iter().any(|e| matches!(
        e,
        CallEvent::ParticipantsChanged { removed, .. } if removed.contains(&ParticipantId::new("p1"))
    )));
}
