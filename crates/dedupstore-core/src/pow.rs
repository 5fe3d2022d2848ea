//! Proof-of-ownership challenge/response.
//!
//! A challenge is a random hash bound to a (principal, object) pair. The
//! claimant searches for a nonce such that `SHA-256("{challenge}:{nonce}")`
//! starts with `difficulty` hex zeros. Challenges are single use: the first
//! successful verification removes it, a failed one leaves it in place.
//!
//! Two verifiers share the same challenge book: [`FixedDifficultyVerifier`]
//! and [`AdaptiveVerifier`], which moves the difficulty inside
//! `[min_difficulty, max_difficulty]` from recent solve times and upload load.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tracing::{debug, info};

use crate::digest::ContentDigest;
use crate::error::{DedupError, DedupResult};
use crate::records::PrincipalId;

/// Verifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowConfig {
    /// Starting difficulty in leading hex zeros
    pub difficulty: u32,
    /// Adaptive lower bound
    pub min_difficulty: u32,
    /// Adaptive upper bound
    pub max_difficulty: u32,
    /// Select the adaptive verifier
    pub adaptive: bool,
    /// Solves faster than this raise difficulty
    pub target_solve_min_secs: f64,
    /// Solves slower than this lower difficulty
    pub target_solve_max_secs: f64,
    /// Solve times retained
    pub solve_history: usize,
    /// Recent solves averaged for an adjustment
    pub adjustment_window: usize,
    /// Load above which difficulty drops
    pub load_high: f64,
    /// Load below which difficulty rises
    pub load_low: f64,
    /// Window over which uploads are counted
    pub load_window_secs: u64,
    /// Uploads per window that count as full load
    pub load_capacity: u64,
    /// Optional challenge lifetime; unset means challenges only end by use
    pub challenge_ttl_secs: Option<u64>,
}

impl Default for PowConfig {
    fn default() -> Self {
        Self {
            difficulty: 4,
            min_difficulty: 2,
            max_difficulty: 6,
            adaptive: true,
            target_solve_min_secs: 2.0,
            target_solve_max_secs: 5.0,
            solve_history: 20,
            adjustment_window: 5,
            load_high: 0.8,
            load_low: 0.3,
            load_window_secs: 300,
            load_capacity: 100,
            challenge_ttl_secs: None,
        }
    }
}

impl PowConfig {
    fn ttl(&self) -> Option<Duration> {
        self.challenge_ttl_secs.map(Duration::from_secs)
    }
}

/// An issued puzzle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Claimant
    pub principal: PrincipalId,
    /// Object being claimed
    pub digest: ContentDigest,
    /// Hex hash the nonce is appended to
    pub challenge_hash: String,
    /// Required leading hex zeros
    pub difficulty: u32,
    /// Issue time
    pub issued_at: DateTime<Utc>,
}

/// Evidence of a successful verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofReceipt {
    /// Challenge that was answered
    pub challenge_hash: String,
    /// Winning response hash
    pub response_hash: String,
    /// Difficulty it was checked against
    pub difficulty: u32,
    /// Time from issue to verification
    pub solve_time: Duration,
}

/// Per-(principal, object) protocol state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeState {
    /// No challenge has been issued
    Idle,
    /// A challenge is outstanding
    Challenged,
    /// The last challenge was answered
    Verified,
    /// The last challenge lapsed before it was answered
    Expired,
}

/// Verifier counters for dashboards.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifierStats {
    /// Difficulty new challenges receive
    pub difficulty: u32,
    /// Adaptive verifier in use
    pub adaptive: bool,
    /// Challenges issued
    pub challenges_issued: u64,
    /// Successful verifications
    pub verifications: u64,
    /// Rejected proofs
    pub failures: u64,
    /// Mean verification cost in milliseconds
    pub avg_verify_ms: f64,
    /// Outstanding challenges
    pub active_challenges: usize,
    /// Mean of the recent solve times, if any
    pub recent_solve_avg_secs: Option<f64>,
    /// Current load ratio
    pub current_load: f64,
}

/// The verifier seam; implementations are chosen at construction from [`PowConfig::adaptive`].
pub trait OwnershipVerifier: Send + Sync {
    /// Issue (or reissue) a challenge for a pair.
    fn generate_challenge(&self, principal: PrincipalId, digest: &ContentDigest) -> Challenge;

    /// Check a nonce against the outstanding challenge and consume it on success.
    fn verify_proof(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        nonce: u64,
    ) -> DedupResult<ProofReceipt>;

    /// Difficulty the next challenge would receive.
    fn current_difficulty(&self) -> u32;

    /// Protocol state of a pair.
    fn challenge_state(&self, principal: PrincipalId, digest: &ContentDigest) -> ChallengeState;

    /// Note one upload for load estimation.
    fn record_load_event(&self) {}

    /// Counters.
    fn stats(&self) -> VerifierStats;
}

/// Response hash for a challenge and nonce.
pub fn response_hash(challenge_hash: &str, nonce: u64) -> String {
    hex::encode(Sha256::digest(format!("{challenge_hash}:{nonce}").as_bytes()))
}

/// True if `hash` starts with `difficulty` `'0'` characters.
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let d = difficulty as usize;
    hash.len() >= d && hash.bytes().take(d).all(|b| b == b'0')
}

/// Brute-force a nonce, as a client would.
pub fn solve_challenge(
    challenge_hash: &str,
    difficulty: u32,
    max_iterations: u64,
) -> Option<(u64, String)> {
    (0..max_iterations).find_map(|nonce| {
        let response = response_hash(challenge_hash, nonce);
        meets_difficulty(&response, difficulty).then_some((nonce, response))
    })
}

#[derive(Debug, Clone)]
struct Outstanding {
    challenge: Challenge,
    issued: Instant,
}

/// Outstanding challenges and last outcomes, keyed by (principal, object).
#[derive(Default)]
struct ChallengeBook {
    active: DashMap<(PrincipalId, ContentDigest), Outstanding>,
    outcomes: DashMap<(PrincipalId, ContentDigest), ChallengeState>,
    issued: AtomicU64,
    verifications: AtomicU64,
    failures: AtomicU64,
    verify_nanos: AtomicU64,
}

impl ChallengeBook {
    fn issue(&self, principal: PrincipalId, digest: &ContentDigest, difficulty: u32) -> Challenge {
        let mut salt = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut salt);
        let issued_at = Utc::now();
        let material = format!(
            "{}:{}:{}:{}",
            principal,
            digest.to_hex(),
            hex::encode(salt),
            issued_at.timestamp()
        );
        let challenge = Challenge {
            principal,
            digest: *digest,
            challenge_hash: hex::encode(Sha256::digest(material.as_bytes())),
            difficulty,
            issued_at,
        };
        self.active.insert(
            (principal, *digest),
            Outstanding {
                challenge: challenge.clone(),
                issued: Instant::now(),
            },
        );
        self.outcomes.remove(&(principal, *digest));
        self.issued.fetch_add(1, Ordering::Relaxed);
        debug!(principal, digest = %digest.short(), difficulty, "issued challenge");
        challenge
    }

    fn verify(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        nonce: u64,
        ttl: Option<Duration>,
    ) -> DedupResult<ProofReceipt> {
        let started = Instant::now();
        let result = self.check(principal, digest, nonce, ttl);
        self.verify_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        match &result {
            Ok(_) => self.verifications.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.failures.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn check(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        nonce: u64,
        ttl: Option<Duration>,
    ) -> DedupResult<ProofReceipt> {
        let key = (principal, *digest);
        let entry = self
            .active
            .get(&key)
            .map(|e| e.value().clone())
            .ok_or_else(|| DedupError::NoActiveChallenge {
                principal,
                digest: digest.to_hex(),
            })?;

        if let Some(ttl) = ttl {
            if entry.issued.elapsed() > ttl {
                self.active.remove(&key);
                self.outcomes.insert(key, ChallengeState::Expired);
                return Err(DedupError::ChallengeExpired {
                    principal,
                    digest: digest.to_hex(),
                });
            }
        }

        let difficulty = entry.challenge.difficulty;
        let response = response_hash(&entry.challenge.challenge_hash, nonce);
        if !meets_difficulty(&response, difficulty) {
            return Err(DedupError::InvalidProof {
                difficulty,
                response,
            });
        }

        // a concurrent verifier may have consumed or replaced it
        let consumed = self.active.remove_if(&key, |_, e| {
            e.challenge.challenge_hash == entry.challenge.challenge_hash
        });
        if consumed.is_none() {
            return Err(DedupError::NoActiveChallenge {
                principal,
                digest: digest.to_hex(),
            });
        }
        self.outcomes.insert(key, ChallengeState::Verified);
        Ok(ProofReceipt {
            challenge_hash: entry.challenge.challenge_hash,
            response_hash: response,
            difficulty,
            solve_time: entry.issued.elapsed(),
        })
    }

    fn state(&self, principal: PrincipalId, digest: &ContentDigest) -> ChallengeState {
        let key = (principal, *digest);
        if self.active.contains_key(&key) {
            return ChallengeState::Challenged;
        }
        self.outcomes
            .get(&key)
            .map(|s| *s.value())
            .unwrap_or(ChallengeState::Idle)
    }

    fn fill_stats(&self, stats: &mut VerifierStats) {
        let verifications = self.verifications.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let attempts = verifications + failures;
        stats.challenges_issued = self.issued.load(Ordering::Relaxed);
        stats.verifications = verifications;
        stats.failures = failures;
        stats.active_challenges = self.active.len();
        stats.avg_verify_ms = if attempts == 0 {
            0.0
        } else {
            self.verify_nanos.load(Ordering::Relaxed) as f64 / attempts as f64 / 1_000_000.0
        };
    }
}

/// Always issues the configured difficulty.
pub struct FixedDifficultyVerifier {
    difficulty: u32,
    ttl: Option<Duration>,
    book: ChallengeBook,
}

impl FixedDifficultyVerifier {
    /// Verifier at a fixed difficulty.
    pub fn new(difficulty: u32, ttl: Option<Duration>) -> Self {
        Self {
            difficulty,
            ttl,
            book: ChallengeBook::default(),
        }
    }
}

impl OwnershipVerifier for FixedDifficultyVerifier {
    fn generate_challenge(&self, principal: PrincipalId, digest: &ContentDigest) -> Challenge {
        self.book.issue(principal, digest, self.difficulty)
    }

    fn verify_proof(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        nonce: u64,
    ) -> DedupResult<ProofReceipt> {
        self.book.verify(principal, digest, nonce, self.ttl)
    }

    fn current_difficulty(&self) -> u32 {
        self.difficulty
    }

    fn challenge_state(&self, principal: PrincipalId, digest: &ContentDigest) -> ChallengeState {
        self.book.state(principal, digest)
    }

    fn stats(&self) -> VerifierStats {
        let mut stats = VerifierStats {
            difficulty: self.difficulty,
            ..VerifierStats::default()
        };
        self.book.fill_stats(&mut stats);
        stats
    }
}

/// Rolling solve-time window driving difficulty changes.
#[derive(Debug, Clone)]
pub struct DifficultyController {
    min: u32,
    max: u32,
    target_min: f64,
    target_max: f64,
    load_low: f64,
    load_high: f64,
    window: usize,
    capacity: usize,
    history: VecDeque<f64>,
}

impl DifficultyController {
    /// Controller with the bounds and targets from `config`.
    pub fn new(config: &PowConfig) -> Self {
        Self {
            min: config.min_difficulty,
            max: config.max_difficulty,
            target_min: config.target_solve_min_secs,
            target_max: config.target_solve_max_secs,
            load_low: config.load_low,
            load_high: config.load_high,
            window: config
                .adjustment_window
                .max(1)
                .min(config.solve_history.max(1)),
            capacity: config.solve_history.max(1),
            history: VecDeque::new(),
        }
    }

    /// Remember a solve time.
    pub fn record_solve(&mut self, secs: f64) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(secs);
    }

    /// Mean of the last `adjustment_window` solves, once that many have been seen.
    pub fn recent_average(&self) -> Option<f64> {
        if self.history.len() < self.window {
            return None;
        }
        Some(self.history.iter().rev().take(self.window).sum::<f64>() / self.window as f64)
    }

    /// Next difficulty from `current` given recent solve times. Unchanged until a full window exists.
    pub fn adjust_for_solves(&self, current: u32) -> u32 {
        let next = match self.recent_average() {
            Some(avg) if avg < self.target_min => current + 1,
            Some(avg) if avg > self.target_max => current.saturating_sub(1),
            _ => current,
        };
        next.clamp(self.min, self.max)
    }

    /// Next difficulty from `current` given the load ratio.
    pub fn adjust_for_load(&self, current: u32, load: f64) -> u32 {
        let next = if load > self.load_high {
            current.saturating_sub(1)
        } else if load < self.load_low {
            current + 1
        } else {
            current
        };
        next.clamp(self.min, self.max)
    }
}

/// Upload events inside a sliding window, as a fraction of capacity.
#[derive(Debug, Clone)]
pub struct LoadGauge {
    window: Duration,
    capacity: u64,
    events: VecDeque<Instant>,
}

impl LoadGauge {
    /// Gauge over `window` with `capacity` events meaning full load.
    pub fn new(window: Duration, capacity: u64) -> Self {
        Self {
            window,
            capacity: capacity.max(1),
            events: VecDeque::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Record one event now.
    pub fn record(&mut self) {
        let now = Instant::now();
        self.prune(now);
        self.events.push_back(now);
    }

    /// Events in the window over capacity, capped at 1.0.
    pub fn load(&mut self) -> f64 {
        self.prune(Instant::now());
        (self.events.len() as f64 / self.capacity as f64).min(1.0)
    }
}

/// Verifier whose difficulty tracks solve time and load.
pub struct AdaptiveVerifier {
    ttl: Option<Duration>,
    difficulty: AtomicU32,
    controller: Mutex<DifficultyController>,
    gauge: Mutex<LoadGauge>,
    book: ChallengeBook,
}

impl AdaptiveVerifier {
    /// Adaptive verifier starting at `config.difficulty`.
    pub fn new(config: &PowConfig) -> Self {
        Self {
            ttl: config.ttl(),
            difficulty: AtomicU32::new(
                config
                    .difficulty
                    .clamp(config.min_difficulty, config.max_difficulty),
            ),
            controller: Mutex::new(DifficultyController::new(config)),
            gauge: Mutex::new(LoadGauge::new(
                Duration::from_secs(config.load_window_secs),
                config.load_capacity,
            )),
            book: ChallengeBook::default(),
        }
    }
}

impl AdaptiveVerifier {
    fn store_difficulty(&self, current: u32, next: u32, cause: &str) {
        if next != current {
            self.difficulty.store(next, Ordering::Relaxed);
            info!(from = current, to = next, cause, "adjusted pow difficulty");
        }
    }
}

impl OwnershipVerifier for AdaptiveVerifier {
    fn generate_challenge(&self, principal: PrincipalId, digest: &ContentDigest) -> Challenge {
        let load = self.gauge.lock().load();
        let difficulty = {
            let controller = self.controller.lock();
            let current = self.difficulty.load(Ordering::Relaxed);
            let next = controller.adjust_for_load(current, load);
            self.store_difficulty(current, next, "load");
            next
        };
        self.book.issue(principal, digest, difficulty)
    }

    fn verify_proof(
        &self,
        principal: PrincipalId,
        digest: &ContentDigest,
        nonce: u64,
    ) -> DedupResult<ProofReceipt> {
        let receipt = self.book.verify(principal, digest, nonce, self.ttl)?;
        let mut controller = self.controller.lock();
        controller.record_solve(receipt.solve_time.as_secs_f64());
        let current = self.difficulty.load(Ordering::Relaxed);
        self.store_difficulty(current, controller.adjust_for_solves(current), "solve time");
        Ok(receipt)
    }

    fn current_difficulty(&self) -> u32 {
        self.difficulty.load(Ordering::Relaxed)
    }

    fn challenge_state(&self, principal: PrincipalId, digest: &ContentDigest) -> ChallengeState {
        self.book.state(principal, digest)
    }

    fn record_load_event(&self) {
        self.gauge.lock().record();
    }

    fn stats(&self) -> VerifierStats {
        let mut stats = VerifierStats {
            difficulty: self.current_difficulty(),
            adaptive: true,
            recent_solve_avg_secs: self.controller.lock().recent_average(),
            current_load: self.gauge.lock().load(),
            ..VerifierStats::default()
        };
        self.book.fill_stats(&mut stats);
        stats
    }
}

/// Verifier selected by configuration.
pub fn build_verifier(config: &PowConfig) -> DedupResult<Box<dyn OwnershipVerifier>> {
    if config.min_difficulty > config.max_difficulty {
        return Err(DedupError::InvalidConfig(format!(
            "pow min difficulty {} exceeds max {}",
            config.min_difficulty, config.max_difficulty
        )));
    }
    if config.max_difficulty > 64 {
        return Err(DedupError::InvalidConfig(
            "pow difficulty cannot exceed the 64 hex digits of a SHA-256".into(),
        ));
    }
    Ok(if config.adaptive {
        Box::new(AdaptiveVerifier::new(config))
    } else {
        Box::new(FixedDifficultyVerifier::new(config.difficulty, config.ttl()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn digest() -> ContentDigest {
        ContentDigest::of(b"owned content")
    }

    fn fixed(difficulty: u32) -> FixedDifficultyVerifier {
        FixedDifficultyVerifier::new(difficulty, None)
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("00ab", 2));
        assert!(!meets_difficulty("0a0b", 2));
        assert!(meets_difficulty("anything", 0));
        assert!(!meets_difficulty("0", 2));
    }

    #[test]
    fn test_solve_and_verify() {
        let v = fixed(2);
        let d = digest();
        let ch = v.generate_challenge(7, &d);
        assert_eq!(ch.challenge_hash.len(), 64);
        assert_eq!(v.challenge_state(7, &d), ChallengeState::Challenged);

        let (nonce, response) = solve_challenge(&ch.challenge_hash, 2, 1_000_000).unwrap();
        let receipt = v.verify_proof(7, &d, nonce).unwrap();
        assert_eq!(receipt.response_hash, response);
        assert!(receipt.response_hash.starts_with("00"));
        assert_eq!(v.challenge_state(7, &d), ChallengeState::Verified);
    }

    #[test]
    fn test_challenge_is_single_use() {
        let v = fixed(1);
        let d = digest();
        let ch = v.generate_challenge(1, &d);
        let (nonce, _) = solve_challenge(&ch.challenge_hash, 1, 100_000).unwrap();
        v.verify_proof(1, &d, nonce).unwrap();
        assert!(matches!(
            v.verify_proof(1, &d, nonce),
            Err(DedupError::NoActiveChallenge { .. })
        ));
    }

    #[test]
    fn test_wrong_nonce_leaves_challenge() {
        let v = fixed(2);
        let d = digest();
        let ch = v.generate_challenge(3, &d);
        let bad = (0..10_000u64)
            .find(|n| !meets_difficulty(&response_hash(&ch.challenge_hash, *n), 2))
            .unwrap();
        let err = v.verify_proof(3, &d, bad).unwrap_err();
        assert!(matches!(err, DedupError::InvalidProof { difficulty: 2, .. }));
        assert!(err.is_retryable());
        assert_eq!(v.challenge_state(3, &d), ChallengeState::Challenged);

        let (nonce, _) = solve_challenge(&ch.challenge_hash, 2, 1_000_000).unwrap();
        assert!(v.verify_proof(3, &d, nonce).is_ok());
        assert_eq!(v.stats().failures, 1);
        assert_eq!(v.stats().verifications, 1);
    }

    #[test]
    fn test_challenge_scoped_to_principal() {
        let v = fixed(1);
        let d = digest();
        let ch = v.generate_challenge(1, &d);
        let (nonce, _) = solve_challenge(&ch.challenge_hash, 1, 100_000).unwrap();
        assert!(matches!(
            v.verify_proof(2, &d, nonce),
            Err(DedupError::NoActiveChallenge { .. })
        ));
        assert_eq!(v.challenge_state(2, &d), ChallengeState::Idle);
    }

    #[test]
    fn test_reissue_replaces_challenge() {
        let v = fixed(1);
        let d = digest();
        let first = v.generate_challenge(1, &d);
        let second = v.generate_challenge(1, &d);
        assert_ne!(first.challenge_hash, second.challenge_hash);
        assert_eq!(v.stats().active_challenges, 1);
    }

    #[test]
    fn test_expired_challenge() {
        let v = FixedDifficultyVerifier::new(1, Some(Duration::ZERO));
        let d = digest();
        let ch = v.generate_challenge(1, &d);
        let (nonce, _) = solve_challenge(&ch.challenge_hash, 1, 100_000).unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert!(matches!(
            v.verify_proof(1, &d, nonce),
            Err(DedupError::ChallengeExpired { .. })
        ));
        assert_eq!(v.challenge_state(1, &d), ChallengeState::Expired);
    }

    #[test]
    fn test_load_rule_within_bounds() {
        let c = DifficultyController::new(&PowConfig::default());
        assert_eq!(c.adjust_for_load(4, 0.5), 4);
        // light load pushes up, clamped at max
        assert_eq!(c.adjust_for_load(4, 0.1), 5);
        assert_eq!(c.adjust_for_load(6, 0.1), 6);
        // heavy load pushes down, clamped at min
        assert_eq!(c.adjust_for_load(4, 0.9), 3);
        assert_eq!(c.adjust_for_load(2, 0.9), 2);
    }

    #[test]
    fn test_solve_rule_waits_for_full_window() {
        let mut c = DifficultyController::new(&PowConfig::default());
        assert_eq!(c.adjust_for_solves(4), 4);
        for _ in 0..4 {
            c.record_solve(0.5);
            assert_eq!(c.recent_average(), None);
            assert_eq!(c.adjust_for_solves(4), 4);
        }
        c.record_solve(0.5);
        assert_eq!(c.adjust_for_solves(4), 5);
        assert_eq!(c.adjust_for_solves(6), 6);

        for _ in 0..5 {
            c.record_solve(9.0);
        }
        assert_eq!(c.recent_average(), Some(9.0));
        assert_eq!(c.adjust_for_solves(4), 3);
        assert_eq!(c.adjust_for_solves(2), 2);

        // only the last five count
        for _ in 0..4 {
            c.record_solve(3.0);
        }
        assert_eq!(c.recent_average(), Some(4.2));
        assert_eq!(c.adjust_for_solves(4), 4);
    }

    #[test]
    fn test_controller_history_is_bounded() {
        let config = PowConfig {
            solve_history: 3,
            adjustment_window: 10,
            ..PowConfig::default()
        };
        let mut c = DifficultyController::new(&config);
        for s in [100.0, 1.0, 2.0, 3.0] {
            c.record_solve(s);
        }
        assert_eq!(c.recent_average(), Some(2.0));
    }

    #[test]
    fn test_load_gauge_ratio() {
        let mut g = LoadGauge::new(Duration::from_secs(60), 4);
        assert_eq!(g.load(), 0.0);
        g.record();
        g.record();
        assert!((g.load() - 0.5).abs() < 1e-9);
        for _ in 0..10 {
            g.record();
        }
        assert_eq!(g.load(), 1.0);
    }

    #[test]
    fn test_adaptive_applies_load_when_issuing() {
        let config = PowConfig {
            difficulty: 1,
            min_difficulty: 1,
            max_difficulty: 3,
            load_capacity: 4,
            ..PowConfig::default()
        };
        let v = AdaptiveVerifier::new(&config);
        let d = digest();
        // idle store raises difficulty before the challenge goes out
        let ch = v.generate_challenge(1, &d);
        assert_eq!(ch.difficulty, 2);
        assert_eq!(v.current_difficulty(), 2);

        for _ in 0..4 {
            v.record_load_event();
        }
        let ch = v.generate_challenge(2, &d);
        assert_eq!(ch.difficulty, 1);
        assert!(v.stats().adaptive);
    }

    #[test]
    fn test_adaptive_ignores_solves_until_window_fills() {
        let config = PowConfig {
            difficulty: 1,
            min_difficulty: 1,
            max_difficulty: 2,
            // steady load keeps the load rule quiet
            load_low: 0.0,
            load_high: 1.0,
            ..PowConfig::default()
        };
        let v = AdaptiveVerifier::new(&config);
        let d = digest();
        for principal in 0..5u64 {
            assert_eq!(v.current_difficulty(), 1);
            assert_eq!(v.stats().recent_solve_avg_secs, None);
            let ch = v.generate_challenge(principal, &d);
            let (nonce, _) = solve_challenge(&ch.challenge_hash, ch.difficulty, 100_000).unwrap();
            v.verify_proof(principal, &d, nonce).unwrap();
        }
        // five fast solves raise it once
        assert_eq!(v.current_difficulty(), 2);
        assert!(v.stats().recent_solve_avg_secs.is_some());
    }

    #[test]
    fn test_build_verifier_selects_impl() {
        let fixed = build_verifier(&PowConfig {
            adaptive: false,
            ..PowConfig::default()
        })
        .unwrap();
        assert!(!fixed.stats().adaptive);
        let adaptive = build_verifier(&PowConfig::default()).unwrap();
        assert!(adaptive.stats().adaptive);
        assert!(build_verifier(&PowConfig {
            min_difficulty: 5,
            max_difficulty: 3,
            ..PowConfig::default()
        })
        .is_err());
    }

    proptest! {
        #[test]
        fn prop_solver_output_verifies(seed in any::<u64>()) {
            let v = fixed(1);
            let d = ContentDigest::of(&seed.to_le_bytes());
            let ch = v.generate_challenge(seed, &d);
            let (nonce, _) = solve_challenge(&ch.challenge_hash, 1, 100_000).unwrap();
            prop_assert!(v.verify_proof(seed, &d, nonce).is_ok());
        }
    }
}
