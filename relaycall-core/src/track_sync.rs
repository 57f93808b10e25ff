//! Pull/push synchronisation of tracks against the relay
//!
//! Every round is split in three so the registry is only ever touched by the
//! coordinator actor:
//!
//! 1. `begin_*` (sync, `&mut ParticipantRegistry`): select tracks and move them
//!    into their in-flight state
//! 2. `execute_*` (async, no registry access): talk to the relay and the media
//!    engine; may be cancelled by dropping the future
//! 3. `complete_*` (sync, `&mut ParticipantRegistry`): apply the outcome
//!
//! State is only mutated in step 3, after every request of the round resolved.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relaycall_proto::relay::{SdpType, TrackObject, TrackResult};
use relaycall_proto::signaling::{ParticipantUpdate, TrackDescriptor};
use relaycall_proto::{OutboundMessage, ParticipantRole, ParticipantState, ProtoError, TrackKind, TrackState};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Participant, ParticipantId, PullState, PushState, SessionId, Track, TrackId};
use crate::registry::ParticipantRegistry;
use crate::resilience::timeout::with_timeout;
use crate::traits::{MediaNegotiator, RelayApi, TransceiverInfo};

/// Upper bounds for the external calls of a round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTimeouts {
    pub relay: Duration,
    pub engine: Duration,
}

impl RoundTimeouts {
    #[must_use]
    pub const fn from_config(config: &Config) -> Self {
        Self {
            relay: config.relay.request_timeout(),
            engine: config.negotiation.engine_timeout(),
        }
    }
}

/// A remote track selected for pulling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullTarget {
    pub participant_id: ParticipantId,
    pub track_id: TrackId,
    /// Relay session publishing the track
    pub remote_session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullPlan {
    pub session_id: SessionId,
    pub targets: Vec<PullTarget>,
}

/// Per-track result of a pull round that reached the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Pulled { mid: Option<String> },
    Failed(String),
}

#[derive(Debug)]
pub struct PullOutcome {
    pub plan: PullPlan,
    /// `Err` fails the whole batch
    pub result: Result<Vec<TrackOutcome>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PulledTrack {
    pub participant_id: ParticipantId,
    pub track_id: TrackId,
    pub mid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedTrack {
    pub participant_id: ParticipantId,
    pub track_id: TrackId,
    pub reason: String,
}

/// What `complete_pull` changed
#[derive(Debug, Default)]
pub struct PullReport {
    pub pulled: Vec<PulledTrack>,
    pub failed: Vec<FailedTrack>,
    /// Targets whose participant or track left the registry mid-round
    pub discarded: Vec<PullTarget>,
    pub batch_error: Option<Error>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushPlan {
    pub session_id: SessionId,
    pub local_participant: Option<ParticipantId>,
    /// Tracks published by an earlier round; never pushed again
    pub already_pushed: HashSet<TrackId>,
    /// Published set carried over from the previous round
    pub published: Vec<Track>,
}

/// A local track the relay answered for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushedTrack {
    pub track_id: TrackId,
    pub kind: TrackKind,
    pub mid: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct PushOutcome {
    pub plan: PushPlan,
    pub result: Result<Vec<PushedTrack>>,
}

#[derive(Debug, Default)]
pub struct PushReport {
    pub pushed: Vec<TrackId>,
    pub failed: Vec<FailedTrack>,
    /// Current published track set of the local participant
    pub published: Vec<Track>,
}

/// Drives the relay and the media engine through pull and push rounds
#[derive(Clone)]
pub struct TrackSync {
    relay: Arc<dyn RelayApi>,
    negotiator: Arc<dyn MediaNegotiator>,
    timeouts: RoundTimeouts,
}

impl TrackSync {
    pub fn new(
        relay: Arc<dyn RelayApi>,
        negotiator: Arc<dyn MediaNegotiator>,
        timeouts: RoundTimeouts,
    ) -> Self {
        Self {
            relay,
            negotiator,
            timeouts,
        }
    }

    /// Move every host track that was never pulled into `Pulling`.
    ///
    /// Returns `None` when nothing needs pulling. A track already `Pulling`,
    /// `Pulled` or `Failed` is skipped, so duplicate updates never pull twice.
    pub fn begin_pull(
        registry: &mut ParticipantRegistry,
        session_id: &SessionId,
    ) -> Option<PullPlan> {
        let mut targets = Vec::new();

        for participant in registry.participants_mut() {
            if !participant.is_host() {
                continue;
            }
            for track in &mut participant.tracks {
                let Some(remote_session_id) = track.session_id.clone() else {
                    continue;
                };
                if track.begin_pull() {
                    targets.push(PullTarget {
                        participant_id: participant.id.clone(),
                        track_id: track.id.clone(),
                        remote_session_id,
                    });
                }
            }
        }

        if targets.is_empty() {
            return None;
        }

        debug!(
            session_id = %session_id,
            tracks = targets.len(),
            "Pull round planned"
        );
        Some(PullPlan {
            session_id: session_id.clone(),
            targets,
        })
    }

    /// One `pullTracks` call for the whole batch, followed by the renegotiation
    /// exchange when the relay asks for it
    pub async fn execute_pull(&self, plan: PullPlan) -> PullOutcome {
        let result = self.pull_batch(&plan).await;
        PullOutcome { plan, result }
    }

    async fn pull_batch(&self, plan: &PullPlan) -> Result<Vec<TrackOutcome>> {
        let tracks = plan
            .targets
            .iter()
            .map(|t| TrackObject::remote(t.track_id.as_str(), t.remote_session_id.as_str()))
            .collect();

        let response = with_timeout(
            self.timeouts.relay,
            "pull_tracks",
            self.relay.pull_tracks(&plan.session_id, tracks),
        )
        .await?;

        if response.requires_immediate_renegotiation {
            let Some(offer) = response.session_description.clone() else {
                return Err(ProtoError::Malformed(
                    "renegotiation required without a session description".to_string(),
                )
                .into());
            };
            if offer.kind != SdpType::Offer {
                return Err(ProtoError::Malformed(format!(
                    "expected an offer to renegotiate, got {:?}",
                    offer.kind
                ))
                .into());
            }
            self.renegotiate(&plan.session_id, offer).await?;
        } else if response.session_description.is_some() {
            debug!(
                session_id = %plan.session_id,
                "Ignoring session description without renegotiation flag"
            );
        }

        Ok(plan
            .targets
            .iter()
            .enumerate()
            .map(|(index, target)| match find_result(&response.tracks, index, target) {
                Some(result) => match result.error_reason() {
                    Some(reason) => TrackOutcome::Failed(reason),
                    None => TrackOutcome::Pulled {
                        mid: result.mid.clone(),
                    },
                },
                None => TrackOutcome::Failed("missing from relay response".to_string()),
            })
            .collect())
    }

    /// `setRemoteDescription(offer) -> createAnswer -> setLocalDescription -> renegotiate`
    async fn renegotiate(
        &self,
        session_id: &SessionId,
        offer: relaycall_proto::relay::SessionDescription,
    ) -> Result<()> {
        let engine = self.timeouts.engine;

        with_timeout(
            engine,
            "set_remote_description",
            self.negotiator.set_remote_description(offer),
        )
        .await?;
        let answer = with_timeout(engine, "create_answer", self.negotiator.create_answer()).await?;
        with_timeout(
            engine,
            "set_local_description",
            self.negotiator.set_local_description(answer.clone()),
        )
        .await?;
        with_timeout(
            self.timeouts.relay,
            "renegotiate",
            self.relay.renegotiate(session_id, answer),
        )
        .await?;

        debug!(session_id = %session_id, "Renegotiated");
        Ok(())
    }

    /// Apply a pull outcome.
    ///
    /// A participant removed while the round was in flight does not cancel the
    /// round: its relay pull and renegotiation have already run, and only its
    /// result is discarded here (reported in `PullReport::discarded`).
    pub fn complete_pull(registry: &mut ParticipantRegistry, outcome: PullOutcome) -> PullReport {
        let mut report = PullReport::default();
        let PullOutcome { plan, result } = outcome;

        let outcomes: Vec<TrackOutcome> = match result {
            Ok(outcomes) => outcomes,
            Err(e) => {
                warn!(
                    session_id = %plan.session_id,
                    tracks = plan.targets.len(),
                    error = %e,
                    "Pull round failed"
                );
                let reason = e.to_string();
                report.batch_error = Some(e);
                vec![TrackOutcome::Failed(reason); plan.targets.len()]
            }
        };

        for (target, outcome) in plan.targets.into_iter().zip(outcomes) {
            let Some(track) = registry.track_mut(&target.participant_id, &target.track_id) else {
                debug!(
                    participant_id = %target.participant_id,
                    track_id = %target.track_id,
                    "Discarding pull result for removed track"
                );
                report.discarded.push(target);
                continue;
            };

            let applied = match outcome {
                TrackOutcome::Pulled { mid } => track.complete_pull(mid.clone()).map(|()| {
                    report.pulled.push(PulledTrack {
                        participant_id: target.participant_id.clone(),
                        track_id: target.track_id.clone(),
                        mid,
                    });
                }),
                TrackOutcome::Failed(reason) => track.fail_pull(reason.clone()).map(|()| {
                    report.failed.push(FailedTrack {
                        participant_id: target.participant_id.clone(),
                        track_id: target.track_id.clone(),
                        reason,
                    });
                }),
            };

            if let Err(e) = applied {
                // Reset and re-pulled while the round was in flight
                warn!(error = %e, "Dropping stale pull result");
                report.discarded.push(target);
            }
        }

        info!(
            pulled = report.pulled.len(),
            failed = report.failed.len(),
            discarded = report.discarded.len(),
            "Pull round completed"
        );
        report
    }

    /// Explicit retry: every failed host track goes back to `NotPulled`
    pub fn reset_failed(registry: &mut ParticipantRegistry) -> usize {
        let mut reset = 0;
        for participant in registry.participants_mut() {
            for track in &mut participant.tracks {
                if matches!(track.pull_state(), PullState::Failed(_)) && track.reset_pull() {
                    reset += 1;
                }
            }
        }
        reset
    }

    /// Mark local tracks the feed already knows as `Pushing`.
    ///
    /// `published` is the set reported by the previous round. It also covers
    /// rounds where the local participant is not in the registry.
    pub fn begin_push(
        registry: &mut ParticipantRegistry,
        session_id: &SessionId,
        local_participant: Option<&ParticipantId>,
        published: &[Track],
    ) -> PushPlan {
        let mut already_pushed: HashSet<TrackId> =
            published.iter().map(|t| t.id.clone()).collect();

        if let Some(participant) = local_participant.and_then(|id| registry.participant_mut(id)) {
            for track in &mut participant.tracks {
                if track.push_state() == &PushState::Pushed {
                    already_pushed.insert(track.id.clone());
                } else if !already_pushed.contains(&track.id) {
                    track.begin_push();
                }
            }
        }

        PushPlan {
            session_id: session_id.clone(),
            local_participant: local_participant.cloned(),
            already_pushed,
            published: published.to_vec(),
        }
    }

    /// Offer every sending transceiver whose track is not yet published and
    /// apply the relay's answer
    pub async fn execute_push(&self, plan: PushPlan) -> PushOutcome {
        let result = self.push_round(&plan).await;
        PushOutcome { plan, result }
    }

    async fn push_round(&self, plan: &PushPlan) -> Result<Vec<PushedTrack>> {
        let engine = self.timeouts.engine;

        let candidates = self.unpublished(plan).await?;
        if candidates.is_empty() {
            debug!(session_id = %plan.session_id, "No local tracks to push");
            return Ok(Vec::new());
        }

        let offer = with_timeout(engine, "create_offer", self.negotiator.create_offer()).await?;
        with_timeout(
            engine,
            "set_local_description",
            self.negotiator.set_local_description(offer.clone()),
        )
        .await?;

        // Mids are only assigned once the offer is applied
        let candidates = self.unpublished(plan).await?;
        let mut objects = Vec::with_capacity(candidates.len());
        for (track_id, info) in &candidates {
            let Some(mid) = info.mid.as_deref() else {
                return Err(Error::invalid_state(format!(
                    "transceiver for track {track_id} has no mid after set_local_description"
                )));
            };
            objects.push(TrackObject::local(track_id.as_str(), mid));
        }

        let pushed = with_timeout(
            self.timeouts.relay,
            "push_tracks",
            self.relay.push_tracks(&plan.session_id, offer, objects),
        )
        .await?;

        if pushed.requires_immediate_renegotiation {
            info!(
                session_id = %plan.session_id,
                "Relay requested renegotiation after push; the next pull round handles it"
            );
        }

        with_timeout(
            engine,
            "set_remote_description",
            self.negotiator
                .set_remote_description(pushed.remote_description),
        )
        .await?;

        Ok(candidates
            .into_iter()
            .map(|(track_id, info)| {
                let result = pushed.tracks.iter().find(|r| {
                    r.track_name.as_deref() == Some(track_id.as_str())
                        || (r.track_name.is_none() && r.mid.is_some() && r.mid == info.mid)
                });
                PushedTrack {
                    mid: result.and_then(|r| r.mid.clone()).or(info.mid),
                    error: result.and_then(TrackResult::error_reason),
                    kind: info.kind,
                    track_id,
                }
            })
            .collect())
    }

    async fn unpublished(&self, plan: &PushPlan) -> Result<Vec<(TrackId, TransceiverInfo)>> {
        let transceivers = with_timeout(
            self.timeouts.engine,
            "local_transceivers",
            self.negotiator.local_transceivers(),
        )
        .await?;

        Ok(transceivers
            .into_iter()
            .filter(|t| t.direction.sends())
            .filter_map(|t| {
                let track_id = TrackId::new(t.track_id.clone()?);
                (!plan.already_pushed.contains(&track_id)).then_some((track_id, t))
            })
            .collect())
    }

    /// Apply a push outcome to the local participant.
    ///
    /// A failed round is returned as `Err` after its tracks were marked failed.
    pub fn complete_push(
        registry: &mut ParticipantRegistry,
        outcome: PushOutcome,
    ) -> Result<PushReport> {
        let PushOutcome { plan, result } = outcome;
        let local = plan.local_participant.as_ref();

        let pushed = match result {
            Ok(pushed) => pushed,
            Err(e) => {
                if let Some(participant) = local.and_then(|id| registry.participant_mut(id)) {
                    for track in participant.tracks.iter_mut().filter(|t| t.push_state() == &PushState::Pushing) {
                        if let Err(stale) = track.fail_push(e.to_string()) {
                            debug!(error = %stale, "Push failure not applied");
                        }
                    }
                }
                warn!(session_id = %plan.session_id, error = %e, "Push round failed");
                return Err(e);
            }
        };

        let mut report = PushReport::default();

        let Some(local_id) = local else {
            warn!(
                session_id = %plan.session_id,
                "Local participant unknown; published tracks are kept outside the registry"
            );
            report.published = plan.published;
            for p in pushed {
                if let Some(reason) = p.error {
                    warn!(track_id = %p.track_id, reason = %reason, "Relay rejected local track");
                    continue;
                }
                let mut track = Track::local(p.track_id.clone(), plan.session_id.clone(), p.kind);
                track.begin_push();
                match track.complete_push(p.mid) {
                    Ok(()) => {
                        report.pushed.push(p.track_id);
                        report.published.push(track);
                    }
                    Err(e) => debug!(error = %e, "Dropping stale push result"),
                }
            }
            info!(
                session_id = %plan.session_id,
                pushed = report.pushed.len(),
                published = report.published.len(),
                "Push round completed"
            );
            return Ok(report);
        };

        if registry.participant(local_id).is_none() {
            registry.insert(Participant::new(
                local_id.clone(),
                ParticipantRole::User,
                ParticipantState::Joined,
            ));
        }
        let Some(participant) = registry.participant_mut(local_id) else {
            return Err(Error::invalid_state(format!(
                "local participant {local_id} vanished during push"
            )));
        };

        // Published before the local participant showed up in the feed
        for mut track in plan.published {
            match participant.track_mut(&track.id) {
                Some(existing) if existing.push_state() != &PushState::Pushed => {
                    track.state = existing.state;
                    *existing = track;
                }
                Some(_) => {}
                None => participant.tracks.push(track),
            }
        }

        for p in pushed {
            if participant.track(&p.track_id).is_none() {
                participant.tracks.push(Track::local(
                    p.track_id.clone(),
                    plan.session_id.clone(),
                    p.kind,
                ));
            }
            let Some(track) = participant.track_mut(&p.track_id) else {
                continue;
            };
            track.begin_push();

            let applied = match p.error {
                Some(reason) => track.fail_push(reason.clone()).map(|()| {
                    report.failed.push(FailedTrack {
                        participant_id: local_id.clone(),
                        track_id: p.track_id.clone(),
                        reason,
                    });
                }),
                None => track
                    .complete_push(p.mid)
                    .map(|()| report.pushed.push(p.track_id.clone())),
            };
            if let Err(e) = applied {
                debug!(error = %e, "Dropping stale push result");
            }
        }

        // Announced by the feed but not bound to any sending transceiver
        for track in &mut participant.tracks {
            if track.push_state() == &PushState::Pushing {
                if let Err(e) = track.fail_push("not published by any local transceiver") {
                    debug!(error = %e, "Push failure not applied");
                }
            }
        }

        report.published = participant
            .tracks
            .iter()
            .filter(|t| t.push_state() == &PushState::Pushed)
            .cloned()
            .collect();

        info!(
            session_id = %plan.session_id,
            pushed = report.pushed.len(),
            failed = report.failed.len(),
            "Push round completed"
        );
        Ok(report)
    }
}

/// Match a relay result to the pull target at `index` of the request.
///
/// An exact `(sessionId, trackName)` match wins. Results without a `sessionId`
/// are matched by request position first, so two hosts publishing the same
/// track name in one batch each get their own result.
fn find_result<'a>(
    results: &'a [TrackResult],
    index: usize,
    target: &PullTarget,
) -> Option<&'a TrackResult> {
    let named = |r: &&TrackResult| r.track_name.as_deref() == Some(target.track_id.as_str());

    results
        .iter()
        .filter(named)
        .find(|r| r.session_id.as_deref() == Some(target.remote_session_id.as_str()))
        .or_else(|| {
            results
                .get(index)
                .filter(|r| named(r) && r.session_id.is_none())
        })
        .or_else(|| results.iter().filter(named).find(|r| r.session_id.is_none()))
}

/// The `participantUpdate` announcing the local participant.
///
/// Track ids are namespaced with our relay session and always sent as `inactive`.
#[must_use]
pub fn participant_update(
    state: ParticipantState,
    session_id: Option<&SessionId>,
    published: &[Track],
) -> OutboundMessage {
    let tracks = session_id.map_or_else(Vec::new, |session| {
        published
            .iter()
            .map(|track| TrackDescriptor {
                id: format!("{session}/{}", track.id),
                kind: track.kind,
                state: TrackState::Inactive,
            })
            .collect()
    });

    OutboundMessage::ParticipantUpdate {
        participant: ParticipantUpdate {
            state,
            transceiver_session_id: session_id.map(ToString::to_string),
            tracks,
        },
    }
}
