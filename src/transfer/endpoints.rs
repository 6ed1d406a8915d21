// SPDX-FileCopyrightText: 2025 The superseedr Contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use crate::config::Settings;

use std::collections::HashMap;
use std::net::SocketAddr;

use strum_macros::Display;
use tokio::time::{Duration, Instant};
use tracing::{event, Level};

/// Retry state of one candidate peer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum EndpointState {
    NeverTried,
    Connecting,
    Connected,
    Backoff { attempt: u32, retry_at: Instant },
    Exhausted,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            base: Duration::from_millis(settings.backoff_base_ms),
            max: Duration::from_millis(settings.backoff_max_ms),
            max_attempts: settings.max_connect_attempts,
        }
    }

    /// `base * 2^(attempt - 1)` capped at `max`, plus jitter.
    pub fn delay(&self, attempt: u32, jitter: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let scaled = self.base.saturating_mul(1u32 << exponent);
        scaled.min(self.max) + jitter
    }
}

#[derive(Debug, Clone)]
struct Endpoint {
    state: EndpointState,
    failures: u32,
    hash_failures: u32,
    banned: bool,
}

impl Endpoint {
    fn new(state: EndpointState) -> Self {
        Self {
            state,
            failures: 0,
            hash_failures: 0,
            banned: false,
        }
    }
}

/// Every endpoint the transfer has heard of, in discovery order.
#[derive(Debug, Clone)]
pub struct EndpointBook {
    policy: BackoffPolicy,
    order: Vec<SocketAddr>,
    endpoints: HashMap<SocketAddr, Endpoint>,
}

impl EndpointBook {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            order: Vec::new(),
            endpoints: HashMap::new(),
        }
    }

    /// Returns false if the address was already known.
    pub fn add(&mut self, addr: SocketAddr) -> bool {
        if self.endpoints.contains_key(&addr) {
            return false;
        }
        self.order.push(addr);
        self.endpoints
            .insert(addr, Endpoint::new(EndpointState::NeverTried));
        true
    }

    pub fn state(&self, addr: &SocketAddr) -> Option<EndpointState> {
        self.endpoints.get(addr).map(|endpoint| endpoint.state)
    }

    pub fn is_banned(&self, addr: &SocketAddr) -> bool {
        self.endpoints
            .get(addr)
            .is_some_and(|endpoint| endpoint.banned)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Claims up to `limit` endpoints that may be dialed now and marks them
    /// `Connecting`.
    pub fn take_ready(&mut self, now: Instant, limit: usize) -> Vec<SocketAddr> {
        let mut ready = Vec::new();
        for addr in &self.order {
            if ready.len() >= limit {
                break;
            }
            let Some(endpoint) = self.endpoints.get_mut(addr) else {
                continue;
            };
            let dialable = match endpoint.state {
                EndpointState::NeverTried => true,
                EndpointState::Backoff { retry_at, .. } => retry_at <= now,
                _ => false,
            };
            if dialable {
                endpoint.state = EndpointState::Connecting;
                ready.push(*addr);
            }
        }
        ready
    }

    /// A peer dialed us. Returns false for banned or already active addresses.
    pub fn accept_incoming(&mut self, addr: SocketAddr) -> bool {
        if !self.endpoints.contains_key(&addr) {
            self.order.push(addr);
            self.endpoints
                .insert(addr, Endpoint::new(EndpointState::NeverTried));
        }
        match self.endpoints.get_mut(&addr) {
            Some(endpoint)
                if !endpoint.banned
                    && !matches!(
                        endpoint.state,
                        EndpointState::Connecting | EndpointState::Connected
                    ) =>
            {
                endpoint.state = EndpointState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// The handshake succeeded. Retry counting starts over, so only
    /// consecutive failed attempts exhaust an endpoint.
    pub fn connected(&mut self, addr: &SocketAddr) {
        if let Some(endpoint) = self.endpoints.get_mut(addr) {
            endpoint.state = EndpointState::Connected;
            endpoint.failures = 0;
        }
    }

    /// A connection attempt or session ended. Schedules the next attempt or
    /// gives up on the endpoint.
    pub fn failed(&mut self, addr: &SocketAddr, now: Instant, jitter: Duration) -> EndpointState {
        let policy = self.policy;
        let Some(endpoint) = self.endpoints.get_mut(addr) else {
            return EndpointState::Exhausted;
        };
        endpoint.failures += 1;

        endpoint.state = if endpoint.banned || endpoint.failures >= policy.max_attempts {
            EndpointState::Exhausted
        } else {
            let delay = policy.delay(endpoint.failures, jitter);
            EndpointState::Backoff {
                attempt: endpoint.failures,
                retry_at: now + delay,
            }
        };
        event!(
            Level::DEBUG,
            %addr,
            failures = endpoint.failures,
            state = %endpoint.state,
            "Endpoint scheduled"
        );
        endpoint.state
    }

    /// Counts a verification failure the peer contributed to. Returns true
    /// once the peer has reached `limit` consecutive failures and is banned.
    pub fn record_hash_failure(&mut self, addr: &SocketAddr, limit: u32) -> bool {
        let Some(endpoint) = self.endpoints.get_mut(addr) else {
            return false;
        };
        endpoint.hash_failures += 1;
        if endpoint.hash_failures >= limit && !endpoint.banned {
            endpoint.banned = true;
            event!(Level::WARN, %addr, failures = endpoint.hash_failures, "Banning peer for corrupt data");
        }
        endpoint.banned
    }

    /// The peer contributed to a verified piece.
    pub fn record_good_piece(&mut self, addr: &SocketAddr) {
        if let Some(endpoint) = self.endpoints.get_mut(addr) {
            endpoint.hash_failures = 0;
            endpoint.failures = 0;
        }
    }

    pub fn all_exhausted(&self) -> bool {
        self.endpoints
            .values()
            .all(|endpoint| endpoint.state == EndpointState::Exhausted)
    }

    pub fn backing_off(&self) -> usize {
        self.endpoints
            .values()
            .filter(|endpoint| matches!(endpoint.state, EndpointState::Backoff { .. }))
            .count()
    }

    pub fn next_retry_at(&self) -> Option<Instant> {
        self.endpoints
            .values()
            .filter_map(|endpoint| match endpoint.state {
                EndpointState::Backoff { retry_at, .. } => Some(retry_at),
                _ => None,
            })
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            max_attempts: 4,
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 1, 1], port))
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = policy();
        let none = Duration::ZERO;
        assert_eq!(policy.delay(1, none), Duration::from_millis(100));
        assert_eq!(policy.delay(2, none), Duration::from_millis(200));
        assert_eq!(policy.delay(3, none), Duration::from_millis(400));
        assert_eq!(policy.delay(5, none), Duration::from_millis(1000));
        assert_eq!(policy.delay(60, none), Duration::from_millis(1000));
        assert_eq!(
            policy.delay(1, Duration::from_millis(7)),
            Duration::from_millis(107)
        );
    }

    #[test]
    fn test_backoff_lifecycle_until_exhausted() {
        let mut book = EndpointBook::new(policy());
        let now = Instant::now();
        assert!(book.add(addr(1)));
        assert!(!book.add(addr(1)));

        assert_eq!(book.take_ready(now, 10), vec![addr(1)]);
        assert_eq!(book.state(&addr(1)), Some(EndpointState::Connecting));
        assert!(book.take_ready(now, 10).is_empty());

        let state = book.failed(&addr(1), now, Duration::ZERO);
        assert_eq!(
            state,
            EndpointState::Backoff {
                attempt: 1,
                retry_at: now + Duration::from_millis(100)
            }
        );
        assert!(book.take_ready(now, 10).is_empty());
        assert_eq!(book.next_retry_at(), Some(now + Duration::from_millis(100)));

        let later = now + Duration::from_millis(100);
        assert_eq!(book.take_ready(later, 10), vec![addr(1)]);
        book.failed(&addr(1), later, Duration::ZERO);
        book.take_ready(later + Duration::from_secs(1), 10);
        book.failed(&addr(1), later, Duration::ZERO);
        book.take_ready(later + Duration::from_secs(2), 10);
        assert_eq!(
            book.failed(&addr(1), later, Duration::ZERO),
            EndpointState::Exhausted
        );
        assert!(book.all_exhausted());
    }

    #[test]
    fn test_take_ready_respects_limit_and_order() {
        let mut book = EndpointBook::new(policy());
        for port in 1..=5 {
            book.add(addr(port));
        }
        let now = Instant::now();
        assert_eq!(book.take_ready(now, 2), vec![addr(1), addr(2)]);
        assert_eq!(book.take_ready(now, 10), vec![addr(3), addr(4), addr(5)]);
        assert!(!book.all_exhausted());
    }

    #[test]
    fn test_banned_peer_is_exhausted_on_next_failure() {
        let mut book = EndpointBook::new(policy());
        book.add(addr(1));
        book.take_ready(Instant::now(), 1);
        book.connected(&addr(1));

        assert!(!book.record_hash_failure(&addr(1), 2));
        assert!(book.record_hash_failure(&addr(1), 2));
        assert!(book.is_banned(&addr(1)));
        assert_eq!(
            book.failed(&addr(1), Instant::now(), Duration::ZERO),
            EndpointState::Exhausted
        );
        assert!(!book.accept_incoming(addr(1)));
    }

    #[test]
    fn test_good_piece_resets_counters() {
        let mut book = EndpointBook::new(policy());
        book.add(addr(1));
        book.record_hash_failure(&addr(1), 3);
        book.failed(&addr(1), Instant::now(), Duration::ZERO);
        book.record_good_piece(&addr(1));
        assert!(!book.record_hash_failure(&addr(1), 2));
    }

    #[test]
    fn test_completed_handshake_resets_retry_budget() {
        let mut book = EndpointBook::new(policy());
        book.add(addr(1));
        let mut now = Instant::now();
        for _ in 0..policy().max_attempts * 3 {
            assert_eq!(book.take_ready(now, 1), vec![addr(1)]);
            book.connected(&addr(1));
            let state = book.failed(&addr(1), now, Duration::ZERO);
            assert!(matches!(state, EndpointState::Backoff { attempt: 1, .. }));
            now += Duration::from_secs(1);
        }
        assert!(!book.all_exhausted());

        // Failed dials still count up.
        for _ in 1..policy().max_attempts {
            book.take_ready(now, 1);
            book.failed(&addr(1), now, Duration::ZERO);
            now += Duration::from_secs(1);
        }
        assert_eq!(book.state(&addr(1)), Some(EndpointState::Exhausted));
    }

    #[test]
    fn test_incoming_registration() {
        let mut book = EndpointBook::new(policy());
        assert!(book.accept_incoming(addr(9)));
        assert!(!book.accept_incoming(addr(9)));
        book.connected(&addr(9));
        assert_eq!(book.state(&addr(9)), Some(EndpointState::Connected));
        assert_eq!(book.len(), 1);
    }
}
