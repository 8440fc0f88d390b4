//! Bus router and transaction handles

use super::{BusAddress, I2cBackend, Segment};
use sprout_shared::BusError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, trace};

/// How many transaction timeouts a caller may wait for a busy segment.
const LOCK_WAIT_FACTOR: u32 = 4;

/// Serializes access per `(bus, mux)` segment.
pub struct BusRouter {
    backend: Arc<dyn I2cBackend>,
    segments: Mutex<HashMap<Segment, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl BusRouter {
    pub fn new(backend: Arc<dyn I2cBackend>, timeout: Duration) -> Self {
        Self {
            backend,
            segments: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Get an exclusive handle for one transaction.
    ///
    /// Blocks while another handle on the same segment is alive. When the
    /// address sits behind a mux, the mux channel is selected before the
    /// handle is returned. Direct addresses get an unrouted handle without
    /// taking any lock.
    pub async fn acquire(&self, address: &BusAddress) -> Result<BusHandle, BusError> {
        let Some(segment) = address.segment() else {
            return Ok(BusHandle {
                backend: Arc::clone(&self.backend),
                address: *address,
                timeout: self.timeout,
                guard: None,
            });
        };

        let lock = self.segment_lock(segment);
        let wait = self.timeout.saturating_mul(LOCK_WAIT_FACTOR);
        let guard = tokio::time::timeout(wait, lock.lock_owned())
            .await
            .map_err(|_| BusError::Timeout {
                segment: segment.to_string(),
                timeout_ms: wait.as_millis() as u64,
            })?;
        trace!(%segment, "segment acquired");

        let handle = BusHandle {
            backend: Arc::clone(&self.backend),
            address: *address,
            timeout: self.timeout,
            guard: Some(guard),
        };

        if let (Some(mux), Some(channel)) = (address.mux, address.channel) {
            if channel > 7 {
                return Err(BusError::Io(format!("mux channel {} out of range", channel)));
            }
            let backend = Arc::clone(&self.backend);
            handle
                .bounded(async move { backend.write(segment.bus, mux, &[1u8 << channel]).await })
                .await?;
            debug!(%segment, channel, "mux channel selected");
        }

        Ok(handle)
    }

    fn segment_lock(&self, segment: Segment) -> Arc<AsyncMutex<()>> {
        let mut segments = self.segments.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(segments.entry(segment).or_default())
    }
}

/// Exclusive access to one device for the lifetime of the handle.
///
/// Dropping the handle releases the segment.
pub struct BusHandle {
    backend: Arc<dyn I2cBackend>,
    address: BusAddress,
    timeout: Duration,
    guard: Option<OwnedMutexGuard<()>>,
}

impl BusHandle {
    pub fn address(&self) -> &BusAddress {
        &self.address
    }

    pub fn is_routed(&self) -> bool {
        self.guard.is_some()
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<(), BusError> {
        let (bus, address) = self.target()?;
        self.bounded(self.backend.write(bus, address, bytes)).await
    }

    pub async fn read(&self, len: usize) -> Result<Vec<u8>, BusError> {
        let (bus, address) = self.target()?;
        self.bounded(self.backend.read(bus, address, len)).await
    }

    pub async fn write_read(&self, bytes: &[u8], len: usize) -> Result<Vec<u8>, BusError> {
        let (bus, address) = self.target()?;
        self.bounded(self.backend.write_read(bus, address, bytes, len)).await
    }

    pub async fn read_register(&self, register: u8) -> Result<u8, BusError> {
        let bytes = self.write_read(&[register], 1).await?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| BusError::Io(format!("empty read of register 0x{:02x}", register)))
    }

    pub async fn write_register(&self, register: u8, value: u8) -> Result<(), BusError> {
        self.write(&[register, value]).await
    }

    fn target(&self) -> Result<(u8, u8), BusError> {
        match (self.address.bus, self.address.address) {
            (Some(bus), Some(address)) => Ok((bus, address)),
            _ => Err(BusError::Unroutable),
        }
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, BusError>
    where
        F: Future<Output = Result<T, BusError>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout {
                segment: self.address.to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}
