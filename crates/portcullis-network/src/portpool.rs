//! Persistent host port pool.
//!
//! Ports are handed out from a fixed range and recorded per container handle
//! in a JSON state file, so that allocations survive across the short-lived
//! `up`/`down` invocations and are never issued twice.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use async_trait::async_trait;
use portcullis_common::{PortcullisError, PortcullisResult};
use serde::{Deserialize, Serialize};

use crate::platform::PortAllocator;
use crate::statefile::{LockedFile, blocking};

/// On-disk pool state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PoolState {
    #[serde(default)]
    acquired_ports: BTreeMap<String, BTreeSet<u16>>,
}

impl PoolState {
    fn is_acquired(&self, port: u16) -> bool {
        self.acquired_ports.values().any(|ports| ports.contains(&port))
    }
}

/// File-backed [`PortAllocator`].
#[derive(Debug, Clone)]
pub struct PortPool {
    path: PathBuf,
    start: u16,
    capacity: u16,
}

impl PortPool {
    /// Create a pool managing `capacity` ports from `start`.
    pub fn new(path: impl Into<PathBuf>, start: u16, capacity: u16) -> Self {
        Self {
            path: path.into(),
            start,
            capacity,
        }
    }

    /// Whether `port` belongs to the managed range.
    #[must_use]
    pub fn in_range(&self, port: u16) -> bool {
        port >= self.start && u32::from(port) < u32::from(self.start) + u32::from(self.capacity)
    }

    /// Ports currently held by `handle`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file cannot be read.
    pub fn ports_of(&self, handle: &str) -> PortcullisResult<Vec<u16>> {
        let mut file = step("open lock", LockedFile::open(&self.path))?;
        let state: PoolState = step("decoding state file", file.load())?;
        Ok(state
            .acquired_ports
            .get(handle)
            .map(|ports| ports.iter().copied().collect())
            .unwrap_or_default())
    }

    fn acquire(&self, handle: &str) -> PortcullisResult<u16> {
        let mut file = step("open lock", LockedFile::open(&self.path))?;
        let mut state: PoolState = step("decoding state file", file.load())?;
        let port = self.acquire_one(&mut state, handle)?;
        step("encode and overwrite", file.store(&state))?;
        Ok(port)
    }

    fn release(&self, handle: &str) -> PortcullisResult<usize> {
        let mut file = step("open lock", LockedFile::open(&self.path))?;
        let mut state: PoolState = step("decoding state file", file.load())?;

        match state.acquired_ports.remove(handle) {
            Some(ports) => {
                step("encode and overwrite", file.store(&state))?;
                Ok(ports.len())
            }
            None => Ok(0),
        }
    }

    fn acquire_one(&self, state: &mut PoolState, handle: &str) -> PortcullisResult<u16> {
        let candidate = (0..self.capacity)
            .filter_map(|offset| self.start.checked_add(offset))
            .find(|port| !state.is_acquired(*port))
            .ok_or(PortcullisError::PortPoolExhausted)?;

        state
            .acquired_ports
            .entry(handle.to_string())
            .or_default()
            .insert(candidate);
        Ok(candidate)
    }
}

#[async_trait]
impl PortAllocator for PortPool {
    async fn allocate_port(&self, handle: &str, preferred: u16) -> PortcullisResult<u16> {
        if preferred != 0 {
            if self.in_range(preferred) {
                return Err(PortcullisError::PortAllocation {
                    operation: format!("allocate port {preferred}"),
                    message: "cannot specify port from allocation range".to_string(),
                });
            }
            return Ok(preferred);
        }

        let pool = self.clone();
        let owner = handle.to_string();
        let port = blocking(move || pool.acquire(&owner)).await?;

        tracing::debug!(handle, port, "Allocated host port");
        Ok(port)
    }

    async fn release_all_ports(&self, handle: &str) -> PortcullisResult<()> {
        let pool = self.clone();
        let owner = handle.to_string();
        let released = blocking(move || pool.release(&owner)).await?;

        if released > 0 {
            tracing::debug!(handle, released, "Released host ports");
        }
        Ok(())
    }
}

fn step<T>(operation: &str, result: PortcullisResult<T>) -> PortcullisResult<T> {
    result.map_err(|e| PortcullisError::PortAllocation {
        operation: operation.to_string(),
        message: e.to_string(),
    })
}
