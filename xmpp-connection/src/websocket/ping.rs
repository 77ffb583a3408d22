// Copyright (c) 2024 Jonas Schäfer <jonas@zombofant.net>
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Liveness monitoring with transport-level pings.

use core::time::Duration;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::connection::{Shared, WriterCommand};
use crate::Error;

/// Tokens of the pings which were sent but not answered yet.
///
/// A token leaves the set either through its pong or through its
/// deadline, never both.
#[derive(Debug, Default)]
pub(crate) struct PendingPings(Mutex<HashSet<Bytes>>);

impl PendingPings {
    fn lock(&self) -> MutexGuard<'_, HashSet<Bytes>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a fresh token and record it as outstanding.
    fn issue(&self) -> Bytes {
        let mut pending = self.lock();
        loop {
            let token = Bytes::from(format!("{:016x}", rand::thread_rng().gen::<u64>()));
            if pending.insert(token.clone()) {
                return token;
            }
        }
    }

    /// Whether `token` was still outstanding when its deadline passed.
    fn expire(&self, token: &[u8]) -> bool {
        self.lock().remove(token)
    }

    /// Record the pong for `payload`. Unknown payloads are ignored.
    pub fn pong(&self, payload: &[u8]) {
        if self.lock().remove(payload) {
            log::trace!("Got pong {:?}", String::from_utf8_lossy(payload));
        } else {
            log::debug!("Ignoring unmatched pong");
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => core::future::pending().await,
    }
}

/// Send a ping every `interval`; fail the connection with
/// [`Error::NoPong`] if one is not answered within `response_timeout`.
pub(crate) async fn monitor(
    pings: Arc<PendingPings>,
    shared: Arc<Shared>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    interval: Duration,
    response_timeout: Duration,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Deadlines come due in the order the pings were sent.
    let mut deadlines: VecDeque<(Instant, Bytes)> = VecDeque::new();

    loop {
        let next_deadline = deadlines.front().map(|(deadline, _)| *deadline);
        tokio::select! {
            _ = ticker.tick() => {
                if shared.is_closing() {
                    break;
                }
                let token = pings.issue();
                if writer_tx.send(WriterCommand::Ping(token.clone())).is_err() {
                    break;
                }
                deadlines.push_back((Instant::now() + response_timeout, token));
            }
            _ = sleep_until(next_deadline) => {
                let Some((_, token)) = deadlines.pop_front() else {
                    continue;
                };
                if pings.expire(&token) {
                    log::warn!("No pong received within {:?}", response_timeout);
                    shared.fail(Error::NoPong);
                    break;
                }
            }
        }
    }
    log::trace!("Ping monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfiguration;
    use crate::test_util::{Recorded, RecordingSession};

    const INTERVAL: Duration = Duration::from_secs(10);
    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Monitor {
        pings: Arc<PendingPings>,
        writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
        events: mpsc::UnboundedReceiver<Recorded>,
        _session: Arc<RecordingSession>,
    }

    fn start() -> Monitor {
        let (session, events) = RecordingSession::new("example.org");
        let config = ConnectionConfiguration::builder("example.org").build().unwrap();
        let shared = Shared::new(Arc::new(config), session.weak(), false);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let pings = Arc::new(PendingPings::default());
        tokio::spawn(monitor(
            pings.clone(),
            shared,
            writer_tx,
            INTERVAL,
            TIMEOUT,
        ));
        Monitor {
            pings,
            writer_rx,
            events,
            _session: session,
        }
    }

    async fn next_ping(rx: &mut mpsc::UnboundedReceiver<WriterCommand>) -> Bytes {
        match rx.recv().await {
            Some(WriterCommand::Ping(token)) => token,
            _ => panic!("expected a ping"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_fails_once() {
        let mut m = start();
        let started = Instant::now();
        next_ping(&mut m.writer_rx).await;
        assert_eq!(started.elapsed(), INTERVAL);
        assert_eq!(m.pings.len(), 1);

        match m.events.recv().await {
            Some(Recorded::Exception(Error::NoPong)) => (),
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(started.elapsed(), INTERVAL + TIMEOUT);
        assert_eq!(m.pings.len(), 0);

        tokio::time::sleep(INTERVAL * 3).await;
        assert!(m.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_in_time_suppresses_failure() {
        let mut m = start();
        for _ in 0..3 {
            let token = next_ping(&mut m.writer_rx).await;
            tokio::time::sleep(TIMEOUT / 2).await;
            m.pings.pong(&token);
            assert_eq!(m.pings.len(), 0);
        }
        tokio::time::sleep(TIMEOUT).await;
        assert!(m.events.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn late_pong_is_ignored() {
        let mut m = start();
        let token = next_ping(&mut m.writer_rx).await;
        assert!(matches!(
            m.events.recv().await,
            Some(Recorded::Exception(Error::NoPong))
        ));
        m.pings.pong(&token);
        m.pings.pong(b"unknown");
        assert_eq!(m.pings.len(), 0);
        assert!(m.events.try_recv().is_err());
    }

    #[test]
    fn tokens_are_unique() {
        let pings = PendingPings::default();
        let tokens: HashSet<Bytes> = (0..100).map(|_| pings.issue()).collect();
        assert_eq!(tokens.len(), 100);
        assert_eq!(pings.len(), 100);
    }
}
