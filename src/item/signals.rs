//! Completion signals behind `once_synced`, `once_stored` and
//! `once_ready_for`.
//!
//! Each target publishes its phase and a finished-round count on a watch
//! channel. A waiter records which round is outstanding when it is created
//! and resolves once that round is finished, even if a later round has
//! already started by the time it is polled.

use crate::core::{Result, SyncError};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Idle,
    Busy,
    Failed(SyncError),
}

/// Phase of one target plus the number of rounds it has finished.
///
/// A watch receiver only sees the latest value, so a waiter pins the round it
/// waits for by count rather than by observing `Busy` turn into `Idle`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Round {
    phase: Phase,
    settled: u64,
}

impl Round {
    pub(crate) fn channel() -> watch::Sender<Round> {
        watch::Sender::new(Round {
            phase: Phase::Idle,
            settled: 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Readiness {
    Pending,
    Ready,
    Failed(SyncError),
}

pub(crate) fn begin(round: &watch::Sender<Round>) {
    round.send_modify(|round| round.phase = Phase::Busy);
}

pub(crate) fn finish(round: &watch::Sender<Round>) {
    round.send_if_modified(|round| {
        if round.phase != Phase::Busy {
            return false;
        }
        round.phase = Phase::Idle;
        round.settled += 1;
        true
    });
}

pub(crate) fn fail_round(round: &watch::Sender<Round>, err: &SyncError) {
    round.send_modify(|round| round.phase = Phase::Failed(err.clone()));
}

/// Wait for the round outstanding right now. The target round is fixed here,
/// before the returned future is first polled.
pub(crate) fn wait_settled(
    round: &watch::Sender<Round>,
) -> impl Future<Output = Result<()>> + Send + 'static {
    let mut receiver = round.subscribe();
    let target = {
        let current = receiver.borrow();
        match current.phase {
            Phase::Idle => current.settled,
            Phase::Busy => current.settled + 1,
            Phase::Failed(_) => u64::MAX,
        }
    };
    async move {
        let reached = receiver
            .wait_for(|round| round.settled >= target || matches!(round.phase, Phase::Failed(_)))
            .await
            .map(|round| round.clone());
        match reached {
            Ok(round) if round.settled >= target => Ok(()),
            Ok(Round {
                phase: Phase::Failed(err),
                ..
            }) => Err(err),
            // a dropped sender means the record is gone and nothing is pending
            _ => Ok(()),
        }
    }
}

pub(crate) async fn wait_ready(
    mut readiness: watch::Receiver<Readiness>,
    discarded: SyncError,
) -> Result<()> {
    let ready = readiness
        .wait_for(|readiness| *readiness != Readiness::Pending)
        .await
        .map(|readiness| readiness.clone());
    match ready {
        Ok(Readiness::Ready) => Ok(()),
        Ok(Readiness::Failed(err)) => Err(err),
        Ok(Readiness::Pending) | Err(_) => Err(discarded),
    }
}

/// Fail a readiness signal that has not resolved yet.
pub(crate) fn fail_pending(readiness: &watch::Sender<Readiness>, err: &SyncError) {
    readiness.send_if_modified(|current| {
        if *current == Readiness::Pending {
            *current = Readiness::Failed(err.clone());
            true
        } else {
            false
        }
    });
}
