// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

//! Notifications delivered from background mount tasks to the caller

use tokio::sync::{mpsc, oneshot};

use crate::{Error, Result};

#[cfg(test)]
#[path = "./signal_test.rs"]
mod signal_test;

/// Create a connected readiness notifier and signal.
pub(crate) fn readiness() -> (ReadinessNotifier, Readiness) {
    let (tx, rx) = oneshot::channel();
    (ReadinessNotifier { tx }, Readiness { rx })
}

/// Create a connected termination reporter and channel.
pub(crate) fn termination() -> (TerminationReporter, Termination) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TerminationReporter { tx }, Termination { rx })
}

/// Fires the readiness signal, exactly once.
#[derive(Debug)]
pub(crate) struct ReadinessNotifier {
    tx: oneshot::Sender<Result<()>>,
}

impl ReadinessNotifier {
    pub fn fire(self, result: Result<()>) {
        if let Err(unobserved) = self.tx.send(result) {
            tracing::debug!(result = ?unobserved, "mount readiness was never awaited");
        }
    }
}

/// Signals that the mount handshake has concluded.
///
/// The signal carries the outcome of the handshake. A channel
/// descriptor handed back by a negotiation must not be used before
/// this has resolved to `Ok`. Waiting consumes the signal so it can
/// only ever be observed once.
#[derive(Debug)]
pub struct Readiness {
    rx: oneshot::Receiver<Result<()>>,
}

impl Readiness {
    /// Wait for the handshake to conclude.
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or_else(|_| Err(abandoned()))
    }

    /// Block the current thread until the handshake concludes.
    ///
    /// This must not be called from within an async context.
    pub fn blocking_wait(self) -> Result<()> {
        self.rx.blocking_recv().unwrap_or_else(|_| Err(abandoned()))
    }
}

fn abandoned() -> Error {
    Error::handshake("the handshake task stopped without reporting a result")
}

/// Reports failures of a mount that was already reported as ready.
#[derive(Debug, Clone)]
pub(crate) struct TerminationReporter {
    tx: mpsc::UnboundedSender<Error>,
}

impl TerminationReporter {
    pub fn report(&self, err: Error) {
        if let Err(unobserved) = self.tx.send(err) {
            tracing::warn!(err = ?unobserved.0, "mount terminated with nobody listening");
        }
    }
}

/// A stream of failures that ended a mount after it became ready.
///
/// Unlike [`Readiness`] this can be observed repeatedly. It yields
/// `None` once no more reports can be produced, either because the
/// backend does not supervise its helper after the handshake or
/// because the helper has been reaped.
#[derive(Debug)]
pub struct Termination {
    rx: mpsc::UnboundedReceiver<Error>,
}

impl Termination {
    /// A termination channel that will never report anything.
    pub(crate) fn closed() -> Self {
        let (_, termination) = termination();
        termination
    }

    /// Wait for the next reported failure.
    pub async fn next(&mut self) -> Option<Error> {
        self.rx.recv().await
    }

    /// Return an already reported failure, if any, without waiting.
    pub fn try_next(&mut self) -> Option<Error> {
        self.rx.try_recv().ok()
    }
}
