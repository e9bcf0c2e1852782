//! Per-recipient cooldown, per-recipient daily cap and a global sliding window.
//!
//! All three checks run under one lock, so a reservation either passes every
//! check and is recorded, or is denied without side effects. A [`Reservation`]
//! that is dropped without [`Reservation::commit`] gives its slot back.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use alloy_primitives::Address;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::{
    RateLimitReason, SponsorError,
    config::RateLimitConfig,
    types::{SponsorshipRecord, SponsorshipStatus},
};

const GLOBAL_WINDOW: Duration = Duration::from_secs(60);
const DAILY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// A refused reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Denied {
    pub reason: RateLimitReason,
    pub retry_after: Duration,
}

impl From<Denied> for SponsorError {
    fn from(denied: Denied) -> Self {
        Self::RateLimited {
            reason: denied.reason,
            retry_after: denied.retry_after,
        }
    }
}

#[derive(Debug, Default)]
struct RecipientWindow {
    last_reserved: Option<Instant>,
    /// Reservation times inside the daily window, oldest first.
    day: VecDeque<Instant>,
}

impl RecipientWindow {
    /// Holds nothing that could deny a reservation at `now`.
    fn is_idle(&self, now: Instant, cooldown: Duration) -> bool {
        self.day.is_empty()
            && self
                .last_reserved
                .is_none_or(|last| now.saturating_duration_since(last) >= cooldown)
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    recipients: HashMap<Address, RecipientWindow>,
    global: VecDeque<Instant>,
    last_sweep: Option<Instant>,
}

impl LimiterState {
    /// Drops recipients whose windows have fully expired, at most once per
    /// global window.
    fn sweep(&mut self, now: Instant, cooldown: Duration) {
        if self
            .last_sweep
            .is_some_and(|last| now.saturating_duration_since(last) < GLOBAL_WINDOW)
        {
            return;
        }
        self.last_sweep = Some(now);

        let before = self.recipients.len();
        self.recipients.retain(|_, window| {
            prune(&mut window.day, now, DAILY_WINDOW);
            !window.is_idle(now, cooldown)
        });
        let swept = before - self.recipients.len();
        if swept > 0 {
            debug!(swept, remaining = self.recipients.len(), "Swept idle rate limit windows");
        }
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while window
        .front()
        .is_some_and(|at| now.saturating_duration_since(*at) >= span)
    {
        window.pop_front();
    }
}

fn remove_one(window: &mut VecDeque<Instant>, at: Instant) {
    if let Some(index) = window.iter().rposition(|entry| *entry == at) {
        window.remove(index);
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::default(),
        }
    }

    pub const fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Reserves a sponsorship slot for `recipient`, or says how long to wait.
    pub fn try_reserve(&self, recipient: Address) -> Result<Reservation<'_>, Denied> {
        let now = Instant::now();
        let cooldown = self.config.cooldown();
        let mut state = self.state.lock();
        prune(&mut state.global, now, GLOBAL_WINDOW);
        state.sweep(now, cooldown);

        let global_count = state.global.len();
        let global_oldest = state.global.front().copied();
        let window = state.recipients.entry(recipient).or_default();
        prune(&mut window.day, now, DAILY_WINDOW);

        if let Some(last) = window.last_reserved {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < cooldown {
                return Err(Denied {
                    reason: RateLimitReason::Cooldown,
                    retry_after: cooldown - elapsed,
                });
            }
        }

        if let Some(cap) = self.config.daily_per_recipient
            && window.day.len() >= cap as usize
        {
            let oldest = window.day.front().copied().unwrap_or(now);
            return Err(Denied {
                reason: RateLimitReason::DailyLimit,
                retry_after: DAILY_WINDOW.saturating_sub(now.saturating_duration_since(oldest)),
            });
        }

        if let Some(cap) = self.config.global_per_minute
            && global_count >= cap as usize
        {
            let oldest = global_oldest.unwrap_or(now);
            return Err(Denied {
                reason: RateLimitReason::GlobalThroughput,
                retry_after: GLOBAL_WINDOW.saturating_sub(now.saturating_duration_since(oldest)),
            });
        }

        let previous = window.last_reserved.replace(now);
        window.day.push_back(now);
        state.global.push_back(now);

        debug!(%recipient, "Reserved sponsorship slot");

        Ok(Reservation {
            limiter: self,
            recipient,
            at: now,
            previous,
            committed: false,
        })
    }

    /// Rebuilds windows from persisted history so a restart keeps cooldowns.
    /// Only pending and confirmed records count; failed transfers released theirs.
    pub fn hydrate(&self, records: &[SponsorshipRecord], now_unix: u64) {
        let now = Instant::now();
        let mut relevant: Vec<_> = records
            .iter()
            .filter(|record| record.status != SponsorshipStatus::Failed)
            .filter(|record| record.age_at(now_unix) < DAILY_WINDOW.as_secs())
            .collect();
        relevant.sort_by_key(|record| record.created_at);

        let mut state = self.state.lock();
        for record in &relevant {
            let age = Duration::from_secs(record.age_at(now_unix));
            let Some(at) = now.checked_sub(age) else {
                continue;
            };
            let window = state.recipients.entry(record.recipient).or_default();
            window.last_reserved = Some(at);
            window.day.push_back(at);
            if age < GLOBAL_WINDOW {
                state.global.push_back(at);
            }
        }

        debug!(
            records = relevant.len(),
            recipients = state.recipients.len(),
            "Hydrated rate limiter"
        );
    }

    fn release(&self, recipient: Address, at: Instant, previous: Option<Instant>) {
        let now = Instant::now();
        let mut state = self.state.lock();
        remove_one(&mut state.global, at);
        if let Some(window) = state.recipients.get_mut(&recipient) {
            remove_one(&mut window.day, at);
            if window.last_reserved == Some(at) {
                window.last_reserved = previous;
            }
            if window.is_idle(now, self.config.cooldown()) {
                state.recipients.remove(&recipient);
            }
        }
        debug!(%recipient, "Released sponsorship slot");
    }
}

/// A granted slot. Dropping it uncommitted undoes the reservation.
#[derive(Debug)]
#[must_use = "an uncommitted reservation is released on drop"]
pub struct Reservation<'a> {
    limiter: &'a RateLimiter,
    recipient: Address,
    at: Instant,
    previous: Option<Instant>,
    committed: bool,
}

impl Reservation<'_> {
    pub const fn recipient(&self) -> Address {
        self.recipient
    }

    /// Keeps the slot; called once the sponsorship record is durable.
    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.limiter
                .release(self.recipient, self.at, self.previous);
        }
    }
}
