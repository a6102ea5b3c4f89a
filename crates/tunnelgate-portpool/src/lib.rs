//! Bounded TCP port range allocator backing tunnel-agent acceptors
//!
//! A [`PortAllocator`] hands out ports from a configured `[first, last]`
//! range, lowest-free-first, so released ports are re-handed-out
//! predictably. When constructed without a range it is a no-op: every
//! acquire succeeds without bookkeeping, signaling callers to let the OS
//! pick an ephemeral port instead.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, trace};

/// Errors returned while constructing or operating a [`PortAllocator`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortAllocatorError {
    #[error("bad range expression: {0:?}")]
    BadRangeExpression(String),

    #[error("bad range expression: first port {first} is greater than last port {last}")]
    BadRangeExpressionMinGtMax { first: u16, last: u16 },

    #[error("port range exhausted")]
    ExhaustedRange,
}

/// `None` when an owning id isn't tracked (unconfigured allocator).
#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Free,
    Owned(String),
}

struct Pool {
    first: u16,
    last: u16,
    slots: BTreeMap<u16, Slot>,
}

/// A bounded, named-range TCP port allocator.
///
/// Cloning is not supported directly; share an allocator behind an `Arc`
/// the way the registry does with its [`PortAllocator`] instance.
pub struct PortAllocator {
    range: Option<String>,
    pool: Option<Mutex<Pool>>,
}

impl PortAllocator {
    /// Build an allocator. `range` of `None` makes every `acquire` a no-op
    /// that returns [`None`] (the caller should bind an ephemeral port).
    pub fn new(range: Option<&str>) -> Result<Self, PortAllocatorError> {
        let Some(range) = range else {
            return Ok(Self {
                range: None,
                pool: None,
            });
        };

        let (first_str, last_str) = range
            .split_once(':')
            .ok_or_else(|| PortAllocatorError::BadRangeExpression(range.to_string()))?;

        if first_str.is_empty()
            || last_str.is_empty()
            || !first_str.bytes().all(|b| b.is_ascii_digit())
            || !last_str.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(PortAllocatorError::BadRangeExpression(range.to_string()));
        }

        let first: u16 = first_str
            .parse()
            .map_err(|_| PortAllocatorError::BadRangeExpression(range.to_string()))?;
        let last: u16 = last_str
            .parse()
            .map_err(|_| PortAllocatorError::BadRangeExpression(range.to_string()))?;

        if first > last {
            return Err(PortAllocatorError::BadRangeExpressionMinGtMax { first, last });
        }

        let slots = (first..=last).map(|p| (p, Slot::Free)).collect();

        Ok(Self {
            range: Some(range.to_string()),
            pool: Some(Mutex::new(Pool { first, last, slots })),
        })
    }

    /// The raw `"first:last"` string this allocator was configured with.
    pub fn range(&self) -> Option<&str> {
        self.range.as_deref()
    }

    /// Lowest port in the configured range, if any.
    pub fn first(&self) -> Option<u16> {
        self.pool.as_ref().map(|p| p.lock().unwrap().first)
    }

    /// Highest port in the configured range, if any.
    pub fn last(&self) -> Option<u16> {
        self.pool.as_ref().map(|p| p.lock().unwrap().last)
    }

    /// Acquire the lowest-numbered free port for `owner_id`.
    ///
    /// Returns `Ok(None)` when the allocator is unconfigured (caller should
    /// let the OS assign an ephemeral port); `Ok(Some(port))` on success.
    pub fn acquire(&self, owner_id: &str) -> Result<Option<u16>, PortAllocatorError> {
        let Some(pool) = &self.pool else {
            trace!("port allocator unconfigured, letting OS assign a port");
            return Ok(None);
        };

        let mut pool = pool.lock().unwrap();
        let free_port = pool
            .slots
            .iter()
            .find(|(_, slot)| **slot == Slot::Free)
            .map(|(port, _)| *port);

        match free_port {
            Some(port) => {
                pool.slots.insert(port, Slot::Owned(owner_id.to_string()));
                debug!(port, owner_id, "acquired port");
                Ok(Some(port))
            }
            None => Err(PortAllocatorError::ExhaustedRange),
        }
    }

    /// Release `port` back to the free pool. Idempotent; ports outside the
    /// configured range are silently ignored.
    pub fn release(&self, port: u16) {
        let Some(pool) = &self.pool else {
            return;
        };

        let mut pool = pool.lock().unwrap();
        if let Some(slot) = pool.slots.get_mut(&port) {
            if *slot != Slot::Free {
                debug!(port, "released port");
            }
            *slot = Slot::Free;
        }
    }
}
