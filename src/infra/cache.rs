//! Freshness-window cache with an injected clock.
//!
//! Holds one `(value, timestamp)` pair. A read inside the window returns
//! the cached value; a read outside it reports a miss so the owner can
//! recompute. The clock is a trait object so tests can step time by hand.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

/// Monotonic time source.
pub trait Clock: Send + Sync
{
    /// Time elapsed since an arbitrary fixed origin.
    fn now(&self) -> Duration;
}

/// Wall clock backed by [`Instant`].
#[derive(Debug)]
pub struct SystemClock
{
    origin: Instant,
}

impl SystemClock
{
    pub fn new() -> Self
    {
        Self { origin: Instant::now() }
    }
}

impl Default for SystemClock
{
    fn default() -> Self
    {
        Self::new()
    }
}

impl Clock for SystemClock
{
    fn now(&self) -> Duration
    {
        self.origin
            .elapsed()
    }
}

/// Hand-driven clock; clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock
{
    millis: Arc<AtomicU64>,
}

impl ManualClock
{
    pub fn new() -> Self
    {
        Self::default()
    }

    /// Move time forward.
    pub fn advance(
        &self,
        by: Duration,
    )
    {
        self.millis
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock
{
    fn now(&self) -> Duration
    {
        Duration::from_millis(
            self.millis
                .load(Ordering::SeqCst),
        )
    }
}

/// Single-slot cache keyed by a freshness window.
pub struct FreshCache<T>
{
    clock: Arc<dyn Clock>,
    ttl: Duration,
    slot: Option<(T, Duration)>,
}

impl<T: Clone> FreshCache<T>
{
    pub fn new(
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self
    {
        Self { clock, ttl, slot: None }
    }

    /// Cached value if it was stored less than `ttl` ago.
    pub fn get(&self) -> Option<T>
    {
        let (value, stored_at) = self
            .slot
            .as_ref()?;
        let age = self
            .clock
            .now()
            .saturating_sub(*stored_at);

        if age < self.ttl { Some(value.clone()) } else { None }
    }

    /// Replace the cached value, stamping it with the current time.
    pub fn put(
        &mut self,
        value: T,
    )
    {
        let now = self
            .clock
            .now();
        self.slot = Some((value, now));
    }

    /// Return the fresh value or compute, store, and return a new one.
    pub fn get_or_try_insert_with<E>(
        &mut self,
        f: impl FnOnce() -> Result<T, E>,
    ) -> Result<T, E>
    {
        if let Some(v) = self.get()
        {
            return Ok(v);
        }

        let v = f()?;
        self.put(v.clone());
        Ok(v)
    }

    /// Drop the cached value.
    pub fn invalidate(&mut self)
    {
        self.slot = None;
    }
}

impl<T> std::fmt::Debug for FreshCache<T>
{
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result
    {
        f.debug_struct("FreshCache")
            .field("ttl", &self.ttl)
            .field("filled", &self.slot.is_some())
            .finish()
    }
}
