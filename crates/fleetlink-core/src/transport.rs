//! Narrow contract to the cloud transport.
//!
//! The real broker connection (MQTT or similar) lives outside this crate;
//! components only see this trait. Inbound control documents arrive on
//! channels owned by the agent wiring, not through this trait.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport failures. All are retryable from the caller's perspective.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,

    #[error("transport send failed: {0}")]
    SendFailed(String),
}

/// Outbound publish surface of the cloud transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Publish a checkin payload. An `Ok` means the broker acknowledged.
    async fn send_checkin(&self, payload: Bytes) -> Result<(), TransportError>;

    /// Publish a triggered vehicle data payload.
    async fn send_vehicle_data(&self, payload: Bytes) -> Result<(), TransportError>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording transport double shared by the crate's tests.

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    /// Records every publish; can be scripted to fail the next N sends.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub checkins: Mutex<Vec<Vec<u8>>>,
        pub vehicle_data: Mutex<Vec<Vec<u8>>>,
        fail_next: AtomicUsize,
        attempts: AtomicUsize,
    }

    impl RecordingTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make the next `count` sends fail.
        pub fn fail_next(&self, count: usize) {
            self.fail_next.store(count, Ordering::SeqCst);
        }

        fn should_fail(&self) -> bool {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            self.fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }

        /// Sends attempted, successful or not.
        pub fn attempt_count(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        pub fn checkin_count(&self) -> usize {
            self.checkins.lock().unwrap().len()
        }

        pub fn vehicle_data_count(&self) -> usize {
            self.vehicle_data.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_checkin(&self, payload: Bytes) -> Result<(), TransportError> {
            if self.should_fail() {
                return Err(TransportError::SendFailed("scripted failure".into()));
            }
            self.checkins.lock().unwrap().push(payload.to_vec());
            Ok(())
        }

        async fn send_vehicle_data(&self, payload: Bytes) -> Result<(), TransportError> {
            if self.should_fail() {
                return Err(TransportError::SendFailed("scripted failure".into()));
            }
            self.vehicle_data.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
    }
}
