// Install-token store and per-IP rate limiting.
//
// Tokens are 32 random bytes, hex-encoded, bound to the minting address and
// a short expiry, and single-use. Consumption is an atomic check-and-mark
// under one lock so concurrent tunnel attempts cannot double-spend; consumed
// entries stay as tombstones until expiry so a replay is reported as a
// replay rather than an unknown token.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::TokenError;

pub const TOKEN_BYTES: usize = 32;

#[derive(Debug, Clone)]
pub struct InstallToken {
    pub bound_ip: IpAddr,
    pub expires_at: Instant,
    pub consumed: bool,
}

/// Seam between the HTTP handlers and the token state, so upgrade semantics
/// are testable without a server.
pub trait TokenStore: Send + Sync {
    /// Mint a fresh token bound to `ip`. Returns (token, ttl).
    fn mint(&self, ip: IpAddr) -> Result<(String, Duration), TokenError>;

    /// Atomically validate and consume. At most one caller ever succeeds
    /// for a given token.
    fn consume(&self, token: &str, ip: IpAddr) -> Result<(), TokenError>;

    /// Drop expired tokens.
    fn prune(&self);
}

pub struct MemoryTokenStore {
    ttl: Duration,
    rng: SystemRandom,
    tokens: Mutex<HashMap<String, InstallToken>>,
}

impl MemoryTokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            rng: SystemRandom::new(),
            tokens: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    fn insert_raw(&self, token: &str, bound_ip: IpAddr, expires_at: Instant) {
        self.tokens.lock().unwrap().insert(
            token.to_string(),
            InstallToken { bound_ip, expires_at, consumed: false },
        );
    }
}

impl TokenStore for MemoryTokenStore {
    fn mint(&self, ip: IpAddr) -> Result<(String, Duration), TokenError> {
        let mut bytes = [0u8; TOKEN_BYTES];
        self.rng
            .fill(&mut bytes)
            .map_err(|_| TokenError::CapacityReached)?;
        let token: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();

        let mut tokens = self.tokens.lock().unwrap();
        tokens.insert(
            token.clone(),
            InstallToken {
                bound_ip: ip,
                expires_at: Instant::now() + self.ttl,
                consumed: false,
            },
        );
        info!(
            "[PHASE: relay] [STEP: mint] Token minted for {} (ttl_secs={}, outstanding={})",
            ip,
            self.ttl.as_secs(),
            tokens.len()
        );
        Ok((token, self.ttl))
    }

    fn consume(&self, token: &str, ip: IpAddr) -> Result<(), TokenError> {
        let mut tokens = self.tokens.lock().unwrap();
        let entry = tokens.get_mut(token).ok_or(TokenError::Unknown)?;

        if entry.expires_at <= Instant::now() {
            // Expired tokens are dead either way; remove on sight.
            tokens.remove(token);
            return Err(TokenError::Expired);
        }
        if entry.consumed {
            warn!(
                "[PHASE: relay] [STEP: consume] Replay of a consumed token from {}",
                ip
            );
            return Err(TokenError::AlreadyConsumed);
        }
        if entry.bound_ip != ip {
            // Leave the entry in place: the legitimate holder may still
            // arrive from the minting address.
            warn!(
                "[PHASE: relay] [STEP: consume] Token presented from {} but bound elsewhere",
                ip
            );
            return Err(TokenError::IpMismatch);
        }

        // Tombstone until expiry; prune() sweeps it with the rest.
        entry.consumed = true;
        info!("[PHASE: relay] [STEP: consume] Token consumed by {}", ip);
        Ok(())
    }

    fn prune(&self) {
        let now = Instant::now();
        let mut tokens = self.tokens.lock().unwrap();
        let before = tokens.len();
        tokens.retain(|_, t| t.expires_at > now);
        let removed = before - tokens.len();
        if removed > 0 {
            debug!(
                "[PHASE: relay] [STEP: prune] Dropped {} expired token(s)",
                removed
            );
        }
    }
}

/// Fixed-window per-IP request limiter with a hard cap on tracked addresses
/// so spoofed sources cannot grow the map without bound.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    max_tracked_ips: usize,
    state: Mutex<HashMap<IpAddr, WindowState>>,
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    count: u32,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            max_tracked_ips: 10_000,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), TokenError> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();

        if let Some(entry) = state.get_mut(&ip) {
            if now.duration_since(entry.window_start) >= self.window {
                entry.window_start = now;
                entry.count = 1;
                return Ok(());
            }
            if entry.count >= self.max_requests {
                return Err(TokenError::RateLimited);
            }
            entry.count += 1;
            return Ok(());
        }

        if state.len() >= self.max_tracked_ips {
            let window = self.window;
            state.retain(|_, e| now.duration_since(e.window_start) < window);
            if state.len() >= self.max_tracked_ips {
                // Still full after reclaiming expired windows: refuse rather
                // than grow.
                return Err(TokenError::RateLimited);
            }
        }
        state.insert(ip, WindowState { window_start: now, count: 1 });
        Ok(())
    }

    /// Drop windows that have fully elapsed.
    pub fn prune(&self) {
        let now = Instant::now();
        let window = self.window;
        self.state
            .lock()
            .unwrap()
            .retain(|_, e| now.duration_since(e.window_start) < window);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn minted_token_is_hex_and_consumable_once() {
        let store = MemoryTokenStore::new(Duration::from_secs(900));
        let (token, ttl) = store.mint(ip(1)).unwrap();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(ttl.as_secs(), 900);

        assert!(store.consume(&token, ip(1)).is_ok());
        assert_eq!(
            store.consume(&token, ip(1)),
            Err(TokenError::AlreadyConsumed)
        );
    }

    #[test]
    fn replayed_token_reports_prior_consumption() {
        let store = MemoryTokenStore::new(Duration::from_secs(900));
        let (token, _) = store.mint(ip(1)).unwrap();
        assert!(store.consume(&token, ip(1)).is_ok());

        // The tombstone outlives the consumption, so a replay is refused as
        // a replay regardless of who presents it.
        assert_eq!(
            store.consume(&token, ip(1)),
            Err(TokenError::AlreadyConsumed)
        );
        assert_eq!(
            store.consume(&token, ip(2)),
            Err(TokenError::AlreadyConsumed)
        );
        // An unexpired tombstone survives the sweep.
        store.prune();
        assert_eq!(
            store.consume(&token, ip(1)),
            Err(TokenError::AlreadyConsumed)
        );
    }

    #[test]
    fn unknown_token_rejected() {
        let store = MemoryTokenStore::new(Duration::from_secs(900));
        assert_eq!(store.consume("deadbeef", ip(1)), Err(TokenError::Unknown));
    }

    #[test]
    fn ip_mismatch_keeps_the_token_alive() {
        let store = MemoryTokenStore::new(Duration::from_secs(900));
        let (token, _) = store.mint(ip(1)).unwrap();
        assert_eq!(store.consume(&token, ip(2)), Err(TokenError::IpMismatch));
        // Legitimate holder can still use it.
        assert!(store.consume(&token, ip(1)).is_ok());
    }

    #[test]
    fn expired_token_rejected_and_removed() {
        let store = MemoryTokenStore::new(Duration::from_secs(900));
        store.insert_raw("abc123", ip(1), Instant::now() - Duration::from_secs(1));
        assert_eq!(store.consume("abc123", ip(1)), Err(TokenError::Expired));
        assert_eq!(store.consume("abc123", ip(1)), Err(TokenError::Unknown));
    }

    #[test]
    fn concurrent_consumption_has_exactly_one_winner() {
        let store = Arc::new(MemoryTokenStore::new(Duration::from_secs(900)));
        let (token, _) = store.mint(ip(1)).unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = Arc::clone(&store);
            let token = token.clone();
            handles.push(std::thread::spawn(move || {
                store.consume(&token, ip(1)).is_ok()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn prune_drops_only_expired_tokens() {
        let store = MemoryTokenStore::new(Duration::from_secs(900));
        let (live, _) = store.mint(ip(1)).unwrap();
        store.insert_raw("stale", ip(2), Instant::now() - Duration::from_secs(1));
        store.prune();
        assert_eq!(store.consume("stale", ip(2)), Err(TokenError::Unknown));
        assert!(store.consume(&live, ip(1)).is_ok());
    }

    #[test]
    fn quota_exhausts_within_one_window() {
        let limiter = RateLimiter::new(5, Duration::from_secs(3600));
        for _ in 0..5 {
            assert!(limiter.check(ip(1)).is_ok());
        }
        assert_eq!(limiter.check(ip(1)), Err(TokenError::RateLimited));
        // A different address is unaffected.
        assert!(limiter.check(ip(2)).is_ok());
    }

    #[test]
    fn window_resets_after_elapsing() {
        let limiter = RateLimiter::new(1, Duration::from_millis(10));
        assert!(limiter.check(ip(1)).is_ok());
        assert_eq!(limiter.check(ip(1)), Err(TokenError::RateLimited));
        std::thread::sleep(Duration::from_millis(15));
        assert!(limiter.check(ip(1)).is_ok());
    }
}
