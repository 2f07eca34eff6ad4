//! Port allocation for spawned backends.

use crate::error::{GatewayError, Result};
use parking_lot::Mutex;
use std::collections::HashSet;

pub const FIRST_BACKEND_PORT: u16 = 10000;
const LAST_BACKEND_PORT: u32 = 65535;

/// Hands out TCP ports for the stdio→HTTP shim from a monotonic pool.
///
/// The cursor only ever moves forward: releasing a port returns it to the
/// free set but never rewinds `next`, so a freshly released port is not
/// immediately handed to a new backend while the old child may still be
/// tearing down its listener.
#[derive(Debug)]
pub struct PortAllocator {
    inner: Mutex<PortPool>,
}

#[derive(Debug)]
struct PortPool {
    next: u32,
    used: HashSet<u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::starting_at(FIRST_BACKEND_PORT)
    }

    fn starting_at(first: u16) -> Self {
        Self {
            inner: Mutex::new(PortPool {
                next: u32::from(first),
                used: HashSet::new(),
            }),
        }
    }

    /// Returns the smallest free port at or above the cursor and advances the
    /// cursor past it.
    pub fn allocate(&self) -> Result<u16> {
        let mut pool = self.inner.lock();
        let mut candidate = pool.next;
        while candidate <= LAST_BACKEND_PORT && pool.used.contains(&(candidate as u16)) {
            candidate += 1;
        }
        if candidate > LAST_BACKEND_PORT {
            return Err(GatewayError::PortExhausted);
        }
        let port = candidate as u16;
        pool.used.insert(port);
        pool.next = candidate + 1;
        Ok(port)
    }

    /// Releasing a port that was never allocated is a no-op.
    pub fn release(&self, port: u16) {
        self.inner.lock().used.remove(&port);
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
