//! Per-device connection manager.
//!
//! Owns one transport behind a single async lock so reads, writes and
//! reconnects never interleave. After the first successful connect a
//! health-check task wakes every `health_check_interval`; while the link
//! is down it retries with exponential backoff (`base_delay × 2^attempts`)
//! until `max_reconnect_attempts` is reached, after which the device
//! stays disconnected until a manual `connect` resets the counter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::TransportError;
use crate::signal_map::SignalAddress;
use crate::transport::PlcTransport;

/// Connection tuning extracted from a device's configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub health_check_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
}

impl From<&crate::config::PlcConnectionConfig> for ConnectionSettings {
    fn from(cfg: &crate::config::PlcConnectionConfig) -> Self {
        Self {
            connect_timeout: cfg.connect_timeout,
            operation_timeout: cfg.operation_timeout,
            health_check_interval: cfg.health_check_interval,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay: cfg.reconnect_base_delay,
        }
    }
}

/// Exclusive owner of one device's transport.
pub struct ConnectionManager {
    device_id: String,
    transport: Arc<Mutex<Box<dyn PlcTransport>>>,
    settings: ConnectionSettings,
    reconnect_attempts: Arc<AtomicU32>,
    health_task: StdMutex<Option<JoinHandle<()>>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConnectionManager {
    pub fn new(
        device_id: impl Into<String>,
        transport: Box<dyn PlcTransport>,
        settings: ConnectionSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            transport: Arc::new(Mutex::new(transport)),
            settings,
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
            health_task: StdMutex::new(None),
            shutdown_rx,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Connect and, on first success, start the health-check task.
    pub async fn connect(&self) -> Result<(), TransportError> {
        {
            let mut transport = self.transport.lock().await;
            transport.connect(self.settings.connect_timeout).await?;
        }
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        tracing::info!(device_id = %self.device_id, "PLC connected");
        self.ensure_health_task();
        Ok(())
    }

    /// Disconnect and stop health-driven reconnection.
    pub async fn disconnect(&self) {
        if let Some(task) = self.health_task.lock().unwrap().take() {
            task.abort();
        }
        self.transport.lock().await.disconnect().await;
        tracing::info!(device_id = %self.device_id, "PLC disconnected");
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.lock().await.is_connected()
    }

    /// Current reconnect attempt counter (for introspection/tests).
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    fn ensure_health_task(&self) {
        let mut slot = self.health_task.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let device_id = self.device_id.clone();
        let transport = Arc::clone(&self.transport);
        let attempts = Arc::clone(&self.reconnect_attempts);
        let settings = self.settings.clone();
        let mut shutdown_rx = self.shutdown_rx.clone();

        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(settings.health_check_interval) => {}
                    _ = shutdown_rx.changed() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                if transport.lock().await.is_connected() {
                    continue;
                }

                let attempt = attempts.load(Ordering::SeqCst);
                if attempt >= settings.max_reconnect_attempts {
                    tracing::trace!(
                        device_id = %device_id,
                        attempt,
                        "reconnect attempts exhausted, waiting for manual connect"
                    );
                    continue;
                }

                // Exponent capped so the shift cannot overflow.
                let backoff = settings
                    .reconnect_base_delay
                    .saturating_mul(1u32 << attempt.min(16));
                tracing::warn!(
                    device_id = %device_id,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "PLC link down, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown_rx.changed() => {}
                }
                if *shutdown_rx.borrow() {
                    break;
                }

                let result = transport
                    .lock()
                    .await
                    .connect(settings.connect_timeout)
                    .await;
                match result {
                    Ok(()) => {
                        attempts.store(0, Ordering::SeqCst);
                        tracing::info!(device_id = %device_id, "PLC reconnected");
                    }
                    Err(e) => {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        tracing::warn!(
                            device_id = %device_id,
                            error = %e,
                            "reconnect attempt failed"
                        );
                    }
                }
            }
        }));
    }

    /// A `ConnectionLost` fault does not force reconnection here; it
    /// resets the attempt counter so the next health tick retries fast.
    fn note_result<T>(&self, result: &Result<T, TransportError>) {
        if matches!(result, Err(TransportError::ConnectionLost)) {
            self.reconnect_attempts.store(0, Ordering::SeqCst);
        }
    }

    async fn timed<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        F: std::future::Future<Output = Result<T, TransportError>>,
    {
        let result = match tokio::time::timeout(self.settings.operation_timeout, op).await {
            Ok(r) => r,
            Err(_) => Err(TransportError::Timeout),
        };
        self.note_result(&result);
        result
    }

    pub async fn read_bool(&self, addr: &SignalAddress) -> Result<bool, TransportError> {
        self.timed(async { self.transport.lock().await.read_bool(addr).await })
            .await
    }

    pub async fn write_bool(
        &self,
        addr: &SignalAddress,
        value: bool,
    ) -> Result<(), TransportError> {
        self.timed(async { self.transport.lock().await.write_bool(addr, value).await })
            .await
    }

    pub async fn read_byte(&self, addr: &SignalAddress) -> Result<u8, TransportError> {
        self.timed(async { self.transport.lock().await.read_byte(addr).await })
            .await
    }

    pub async fn write_byte(&self, addr: &SignalAddress, value: u8) -> Result<(), TransportError> {
        self.timed(async { self.transport.lock().await.write_byte(addr, value).await })
            .await
    }

    pub async fn read_word(&self, addr: &SignalAddress) -> Result<i16, TransportError> {
        self.timed(async { self.transport.lock().await.read_word(addr).await })
            .await
    }

    pub async fn write_word(&self, addr: &SignalAddress, value: i16) -> Result<(), TransportError> {
        self.timed(async { self.transport.lock().await.write_word(addr, value).await })
            .await
    }

    pub async fn read_dword(&self, addr: &SignalAddress) -> Result<i32, TransportError> {
        self.timed(async { self.transport.lock().await.read_dword(addr).await })
            .await
    }

    pub async fn write_dword(
        &self,
        addr: &SignalAddress,
        value: i32,
    ) -> Result<(), TransportError> {
        self.timed(async { self.transport.lock().await.write_dword(addr, value).await })
            .await
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal_map::AddressWidth;
    use crate::transport::EmulatedPlc;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            connect_timeout: Duration::from_millis(100),
            operation_timeout: Duration::from_millis(100),
            health_check_interval: Duration::from_millis(50),
            max_reconnect_attempts: 3,
            reconnect_base_delay: Duration::from_millis(10),
        }
    }

    fn bit_addr() -> SignalAddress {
        SignalAddress {
            db: 1,
            width: AddressWidth::Bit,
            offset: 0,
            bit: Some(0),
        }
    }

    #[tokio::test]
    async fn test_connect_and_passthrough() {
        let (_tx, rx) = watch::channel(false);
        let plc = EmulatedPlc::new();
        let mgr = ConnectionManager::new("D1", Box::new(plc.clone()), settings(), rx);

        mgr.connect().await.unwrap();
        mgr.write_bool(&bit_addr(), true).await.unwrap();
        assert!(mgr.read_bool(&bit_addr()).await.unwrap());
        mgr.disconnect().await;
    }

    #[tokio::test]
    async fn test_connection_lost_resets_attempt_counter() {
        let (_tx, rx) = watch::channel(false);
        let plc = EmulatedPlc::new();
        let mgr = ConnectionManager::new("D1", Box::new(plc.clone()), settings(), rx);
        mgr.connect().await.unwrap();

        mgr.reconnect_attempts.store(2, Ordering::SeqCst);
        plc.sever();
        let err = mgr.read_bool(&bit_addr()).await.unwrap_err();
        assert_eq!(err, TransportError::ConnectionLost);
        assert_eq!(mgr.reconnect_attempts(), 0);
        mgr.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_check_reconnects_after_drop() {
        let (_tx, rx) = watch::channel(false);
        let plc = EmulatedPlc::new();
        let mgr = ConnectionManager::new("D1", Box::new(plc.clone()), settings(), rx);
        mgr.connect().await.unwrap();

        plc.sever();
        assert!(!mgr.is_connected().await);

        // One health interval + one backoff step is enough.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(mgr.is_connected().await);
        mgr.disconnect().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up_after_max_attempts() {
        let (_tx, rx) = watch::channel(false);
        let plc = EmulatedPlc::new();
        let mgr = ConnectionManager::new("D1", Box::new(plc.clone()), settings(), rx);
        mgr.connect().await.unwrap();

        plc.sever();
        plc.set_refuse_connections(true);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mgr.reconnect_attempts(), 3);
        assert!(!mgr.is_connected().await);

        // Manual connect resets the counter and resumes.
        plc.set_refuse_connections(false);
        mgr.connect().await.unwrap();
        assert_eq!(mgr.reconnect_attempts(), 0);
        mgr.disconnect().await;
    }
}
