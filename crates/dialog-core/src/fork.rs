//! Forked ringing: ordering strategies and the first-winner race

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::stream::{BoxStream, SelectAll, StreamExt};
use rand::seq::SliceRandom;
use tokio::sync::{oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use flowpbx_sip_core::{Response, StatusCode};

use crate::client::{ClientDialog, ClientInvite};
use crate::error::Result;

/// How long losers are watched for a late 200 after the race settles.
const LATE_ANSWER_GRACE: Duration = Duration::from_secs(32);

/// Member ordering for ring groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RingStrategy {
    /// Everyone at once; first 200 wins.
    #[default]
    RingAll,
    /// Rotate the starting member per group on every call.
    RoundRobin,
    /// Longest time since last answered call first.
    LongestIdle,
    /// Uniform shuffle without replacement.
    Random,
}

impl RingStrategy {
    pub fn parse(s: &str) -> RingStrategy {
        match s {
            "round_robin" => RingStrategy::RoundRobin,
            "longest_idle" => RingStrategy::LongestIdle,
            "random" => RingStrategy::Random,
            _ => RingStrategy::RingAll,
        }
    }

    /// Whether members ring one after another instead of in parallel.
    pub fn is_sequential(self) -> bool {
        !matches!(self, RingStrategy::RingAll)
    }
}

/// Process-local ring-group state: rotation counters and answer history.
/// Resets on restart by design.
#[derive(Default)]
pub struct RingState {
    counters: DashMap<u64, AtomicUsize>,
    last_answered: DashMap<String, Instant>,
}

impl RingState {
    pub fn new() -> Self {
        RingState::default()
    }

    /// Record that a member answered, for longest-idle ordering.
    pub fn record_answer(&self, member: &str) {
        self.last_answered.insert(member.to_string(), Instant::now());
    }

    /// Order the members of `group` for one call attempt.
    pub fn order_members(
        &self,
        strategy: RingStrategy,
        group: u64,
        members: &[String],
    ) -> Vec<String> {
        let mut ordered: Vec<String> = members.to_vec();
        match strategy {
            RingStrategy::RingAll => {}
            RingStrategy::RoundRobin => {
                if !ordered.is_empty() {
                    let counter = self.counters.entry(group).or_insert_with(|| AtomicUsize::new(0));
                    let start = counter.fetch_add(1, Ordering::AcqRel) % ordered.len();
                    ordered.rotate_left(start);
                }
            }
            RingStrategy::LongestIdle => {
                // Never-answered members sort first, among themselves by
                // ascending member id.
                ordered.sort_by(|a, b| {
                    let ta = self.last_answered.get(a).map(|t| *t);
                    let tb = self.last_answered.get(b).map(|t| *t);
                    match (ta, tb) {
                        (None, None) => a.cmp(b),
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(ta), Some(tb)) => ta.cmp(&tb).then_with(|| a.cmp(b)),
                    }
                });
            }
            RingStrategy::Random => {
                ordered.shuffle(&mut rand::thread_rng());
            }
        }
        ordered
    }
}

/// How a ring attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingOutcome {
    Answered,
    Busy,
    Declined,
    NoAnswer,
    Cancelled,
    Failed,
}

/// Result of racing a set of legs.
pub struct RaceResult {
    /// Index of the winning leg, its established dialog and its 200.
    pub winner: Option<(usize, ClientDialog, Response)>,
    pub outcome: RingOutcome,
}

/// Race a set of already-built legs: send all INVITEs, accept the first
/// 200, CANCEL everyone else. `ringing` fires once on the first provisional
/// so the upstream leg can be rung. `cancel` aborts the whole attempt
/// (caller hangup).
pub async fn ring_race(
    mut legs: Vec<ClientInvite>,
    ring_timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
    mut ringing: Option<oneshot::Sender<()>>,
) -> Result<RaceResult> {
    if legs.is_empty() {
        return Ok(RaceResult {
            winner: None,
            outcome: RingOutcome::NoAnswer,
        });
    }

    let mut streams: SelectAll<BoxStream<'static, (usize, Response)>> = SelectAll::new();
    for (index, leg) in legs.iter_mut().enumerate() {
        if let Some(rx) = leg.take_responses() {
            streams.push(ReceiverStream::new(rx).map(move |resp| (index, resp)).boxed());
        }
    }

    let mut finals: Vec<Option<StatusCode>> = vec![None; legs.len()];
    for (index, leg) in legs.iter().enumerate() {
        if let Err(err) = leg.send().await {
            warn!("leg {index} failed to send: {err}");
            finals[index] = Some(StatusCode::SERVICE_UNAVAILABLE);
        }
    }
    if finals.iter().all(|f| f.is_some()) {
        return Ok(RaceResult {
            winner: None,
            outcome: RingOutcome::Failed,
        });
    }

    let deadline = tokio::time::sleep(ring_timeout);
    tokio::pin!(deadline);

    let mut legs: Vec<Option<ClientInvite>> = legs.into_iter().map(Some).collect();

    enum Decision {
        Timeout,
        HungUp,
        Winner(usize, Response),
        Exhausted,
    }

    let decision = loop {
        tokio::select! {
            _ = &mut deadline => break Decision::Timeout,
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break Decision::HungUp;
                }
            }
            item = streams.next() => {
                let (index, response) = match item {
                    Some(item) => item,
                    None => break Decision::Exhausted,
                };

                if response.status.is_provisional() {
                    if response.status.as_u16() >= 180 {
                        if let Some(tx) = ringing.take() {
                            let _ = tx.send(());
                        }
                    }
                    continue;
                }
                if response.status.is_success() {
                    break Decision::Winner(index, response);
                }

                // Final non-2xx for this leg.
                finals[index] = Some(response.status);
                if finals.iter().all(|f| f.is_some()) {
                    break Decision::Exhausted;
                }
            }
        }
    };

    match decision {
        Decision::Timeout => {
            debug!("ring timeout reached");
            cancel_remaining(&mut legs, &finals).await;
            absorb_losers(legs, streams);
            Ok(RaceResult {
                winner: None,
                outcome: RingOutcome::NoAnswer,
            })
        }
        Decision::HungUp => {
            info!("caller cancelled while ringing");
            cancel_remaining(&mut legs, &finals).await;
            absorb_losers(legs, streams);
            Ok(RaceResult {
                winner: None,
                outcome: RingOutcome::Cancelled,
            })
        }
        Decision::Exhausted => Ok(RaceResult {
            winner: None,
            outcome: settle_outcome(&finals),
        }),
        Decision::Winner(index, response) => {
            let winner = match legs[index].take() {
                Some(leg) => leg,
                None => {
                    return Ok(RaceResult {
                        winner: None,
                        outcome: RingOutcome::Failed,
                    })
                }
            };
            winner.ack(&response).await?;
            info!(call_id = %winner.call_id(), "leg {index} answered, cancelling the rest");
            cancel_remaining(&mut legs, &finals).await;
            absorb_losers(legs, streams);
            let dialog = winner.into_dialog(&response)?;
            Ok(RaceResult {
                winner: Some((index, dialog, response)),
                outcome: RingOutcome::Answered,
            })
        }
    }
}

/// Outcome when no leg answered: busy beats decline beats plain no-answer.
fn settle_outcome(finals: &[Option<StatusCode>]) -> RingOutcome {
    if finals
        .iter()
        .flatten()
        .any(|s| *s == StatusCode::BUSY_HERE)
    {
        RingOutcome::Busy
    } else if finals.iter().flatten().any(|s| *s == StatusCode::DECLINE) {
        RingOutcome::Declined
    } else {
        RingOutcome::NoAnswer
    }
}

/// Cancel every leg that has not produced a final response.
async fn cancel_remaining(legs: &mut [Option<ClientInvite>], finals: &[Option<StatusCode>]) {
    for (index, slot) in legs.iter_mut().enumerate() {
        if let Some(leg) = slot.as_ref() {
            if finals[index].is_none() {
                if let Err(err) = leg.cancel().await {
                    warn!("CANCEL for leg {index} failed: {err}");
                }
            }
        }
    }
}

/// Watch cancelled legs for a grace period: a 200 that slips in after the
/// race is answered with ACK + BYE so the device does not stay off-hook.
fn absorb_losers(
    legs: Vec<Option<ClientInvite>>,
    mut streams: SelectAll<BoxStream<'static, (usize, Response)>>,
) {
    tokio::spawn(async move {
        let deadline = tokio::time::sleep(LATE_ANSWER_GRACE);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                item = streams.next() => {
                    let (index, response) = match item {
                        Some(item) => item,
                        None => break,
                    };
                    if response.status.is_success() {
                        if let Some(leg) = legs.get(index).and_then(|l| l.as_ref()) {
                            info!(
                                call_id = %leg.call_id(),
                                "late 200 from cancelled leg, sending BYE"
                            );
                            let _ = leg.ack_and_bye(&response).await;
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(n: usize) -> Vec<String> {
        (1..=n).map(|i| format!("{:03}", 200 + i)).collect()
    }

    #[test]
    fn round_robin_rotates_evenly() {
        let state = RingState::new();
        let members = members(3);
        let mut starts = std::collections::HashMap::new();
        for _ in 0..9 {
            let ordered = state.order_members(RingStrategy::RoundRobin, 7, &members);
            *starts.entry(ordered[0].clone()).or_insert(0u32) += 1;
            // Rotation keeps relative order.
            assert_eq!(ordered.len(), 3);
        }
        // 9 calls over 3 members: each starts exactly 3 times.
        assert!(starts.values().all(|&count| count == 3));
    }

    #[test]
    fn round_robin_counters_are_per_group() {
        let state = RingState::new();
        let members = members(2);
        let first_a = state.order_members(RingStrategy::RoundRobin, 1, &members);
        let first_b = state.order_members(RingStrategy::RoundRobin, 2, &members);
        // Both groups start fresh at index 0.
        assert_eq!(first_a[0], first_b[0]);
    }

    #[test]
    fn longest_idle_prefers_never_answered_then_id() {
        let state = RingState::new();
        let members = members(3); // 201, 202, 203
        state.record_answer("201");

        let ordered = state.order_members(RingStrategy::LongestIdle, 1, &members);
        assert_eq!(ordered, vec!["202", "203", "201"]);

        state.record_answer("202");
        let ordered = state.order_members(RingStrategy::LongestIdle, 1, &members);
        assert_eq!(ordered, vec!["203", "201", "202"]);
    }

    #[test]
    fn random_is_a_permutation() {
        let state = RingState::new();
        let members = members(5);
        let ordered = state.order_members(RingStrategy::Random, 1, &members);
        let mut sorted = ordered.clone();
        sorted.sort();
        assert_eq!(sorted, members);
    }

    #[test]
    fn outcome_priority() {
        assert_eq!(
            settle_outcome(&[Some(StatusCode::BUSY_HERE), Some(StatusCode::NOT_FOUND)]),
            RingOutcome::Busy
        );
        assert_eq!(
            settle_outcome(&[Some(StatusCode::DECLINE), Some(StatusCode::NOT_FOUND)]),
            RingOutcome::Declined
        );
        assert_eq!(
            settle_outcome(&[Some(StatusCode::NOT_FOUND)]),
            RingOutcome::NoAnswer
        );
    }

    #[tokio::test]
    async fn empty_leg_set_is_no_answer() {
        let (_tx, mut cancel) = watch::channel(false);
        let result = ring_race(Vec::new(), Duration::from_secs(1), &mut cancel, None)
            .await
            .unwrap();
        assert!(result.winner.is_none());
        assert_eq!(result.outcome, RingOutcome::NoAnswer);
    }

    #[test]
    fn strategy_parsing() {
        assert_eq!(RingStrategy::parse("round_robin"), RingStrategy::RoundRobin);
        assert_eq!(RingStrategy::parse("ring_all"), RingStrategy::RingAll);
        assert_eq!(RingStrategy::parse("unknown"), RingStrategy::RingAll);
        assert!(RingStrategy::LongestIdle.is_sequential());
        assert!(!RingStrategy::RingAll.is_sequential());
    }
}
