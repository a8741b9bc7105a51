//! Buffer manager implementation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{RawDataHandle, SignalId, Timestamp};

/// Number of distinct usage-hint stages.
const STAGE_COUNT: usize = 3;

/// Pipeline stage at which a handle is being held.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStage {
    /// Referenced from an inspection-engine history buffer.
    HistoryBuffer = 0,
    /// Selected for upload by a triggered campaign.
    SelectedForUpload = 1,
    /// Currently being serialized/sent.
    Uploading = 2,
}

/// Errors surfaced by the buffer manager. None are fatal to the caller.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RawDataError {
    /// No buffer configuration exists for the signal.
    #[error("no raw data configuration for signal {signal_id}")]
    NoConfig { signal_id: SignalId },

    /// The sample exceeds the per-sample size limit.
    #[error("sample of {size} bytes exceeds limit of {max} for signal {signal_id}")]
    SampleTooLarge {
        signal_id: SignalId,
        size: usize,
        max: usize,
    },

    /// Admission failed: every resident sample is referenced, or the byte
    /// budget is exhausted.
    #[error("out of buffer space for signal {signal_id}")]
    OutOfMemory { signal_id: SignalId },
}

/// Resolved quota for one signal's buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalBufferConfig {
    pub signal_id: SignalId,
    /// Bytes dedicated to this signal even while unused.
    pub reserved_bytes: usize,
    /// Upper bound on the bytes this signal may occupy.
    pub max_bytes: usize,
    /// Upper bound on resident samples.
    pub max_samples: usize,
    /// Upper bound on a single sample.
    pub max_bytes_per_sample: usize,
}

/// Startup configuration for the buffer manager.
#[derive(Debug, Clone, Deserialize)]
pub struct RawDataBufferConfig {
    /// Byte cap across all signals.
    #[serde(default = "default_max_overall_bytes")]
    pub max_overall_bytes: usize,
    #[serde(default)]
    pub reserved_bytes_per_signal: usize,
    #[serde(default = "default_max_bytes_per_signal")]
    pub max_bytes_per_signal: usize,
    #[serde(default = "default_max_samples_per_signal")]
    pub max_samples_per_signal: usize,
    #[serde(default = "default_max_bytes_per_sample")]
    pub max_bytes_per_sample: usize,
}

const fn default_max_overall_bytes() -> usize {
    1024 * 1024 * 1024
}

const fn default_max_bytes_per_signal() -> usize {
    500 * 1024 * 1024
}

const fn default_max_samples_per_signal() -> usize {
    1000
}

const fn default_max_bytes_per_sample() -> usize {
    10 * 1024 * 1024
}

impl Default for RawDataBufferConfig {
    fn default() -> Self {
        Self {
            max_overall_bytes: default_max_overall_bytes(),
            reserved_bytes_per_signal: 0,
            max_bytes_per_signal: default_max_bytes_per_signal(),
            max_samples_per_signal: default_max_samples_per_signal(),
            max_bytes_per_sample: default_max_bytes_per_sample(),
        }
    }
}

impl RawDataBufferConfig {
    /// Quota for one signal under this configuration.
    #[must_use]
    pub fn signal_config(&self, signal_id: SignalId) -> SignalBufferConfig {
        SignalBufferConfig {
            signal_id,
            reserved_bytes: self.reserved_bytes_per_signal,
            max_bytes: self.max_bytes_per_signal,
            max_samples: self.max_samples_per_signal,
            max_bytes_per_sample: self.max_bytes_per_sample,
        }
    }
}

/// Counters for one signal's buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalBufferStats {
    pub samples_received: usize,
    pub samples_resident: usize,
    pub bytes_resident: usize,
}

struct Frame {
    handle: RawDataHandle,
    timestamp_ms: Timestamp,
    data: Bytes,
    /// Live [`LoanedFrame`] guards over this frame.
    loans: u32,
    usage_hints: [u32; STAGE_COUNT],
}

impl Frame {
    fn is_referenced(&self) -> bool {
        self.loans > 0 || self.usage_hints.iter().any(|&h| h > 0)
    }
}

struct SignalBuffer {
    config: SignalBufferConfig,
    frames: VecDeque<Frame>,
    bytes_in_use: usize,
    samples_received: usize,
    /// Set when the configuration no longer wants this signal; the buffer
    /// is removed once the last loan is returned.
    deleting: bool,
}

impl SignalBuffer {
    fn new(config: SignalBufferConfig) -> Self {
        Self {
            config,
            frames: VecDeque::new(),
            bytes_in_use: 0,
            samples_received: 0,
            deleting: false,
        }
    }

    /// Drop the oldest frame that nothing references. Returns the freed
    /// byte count.
    fn evict_oldest_unreferenced(&mut self) -> Option<usize> {
        let idx = self.frames.iter().position(|f| !f.is_referenced())?;
        let frame = self.frames.remove(idx)?;
        let freed = frame.data.len();
        self.bytes_in_use -= freed;
        Some(freed)
    }
}

struct ManagerState {
    buffers: HashMap<SignalId, SignalBuffer>,
    bytes_in_use: usize,
    bytes_reserved: usize,
}

/// Owner of all raw payload bytes on the agent.
///
/// Multi-producer/multi-consumer; all state behind one mutex, critical
/// sections kept short. Every other component holds non-owning handles and
/// borrows bytes back through [`BufferManager::borrow_frame`].
pub struct BufferManager {
    max_overall_bytes: usize,
    state: Mutex<ManagerState>,
    next_handle: AtomicU32,
}

impl BufferManager {
    #[must_use]
    pub fn new(config: &RawDataBufferConfig) -> Arc<Self> {
        Arc::new(Self {
            max_overall_bytes: config.max_overall_bytes,
            state: Mutex::new(ManagerState {
                buffers: HashMap::new(),
                bytes_in_use: 0,
                bytes_reserved: 0,
            }),
            next_handle: AtomicU32::new(1),
        })
    }

    /// Replace the set of configured signals.
    ///
    /// Signals absent from `signal_configs` have their buffers removed;
    /// buffers with outstanding loans are only marked for deletion and
    /// disappear when the last loan is returned.
    ///
    /// # Errors
    ///
    /// Returns [`RawDataError::OutOfMemory`] when the summed reserves of
    /// the requested signals exceed the overall byte cap. Already-present
    /// buffers are kept in that case.
    pub fn update_config(
        &self,
        signal_configs: &HashMap<SignalId, SignalBufferConfig>,
    ) -> Result<(), RawDataError> {
        let mut state = self.state.lock().expect("buffer manager poisoned");

        let reserved: usize = signal_configs.values().map(|c| c.reserved_bytes).sum();
        if reserved > self.max_overall_bytes {
            warn!(
                reserved,
                cap = self.max_overall_bytes,
                "raw buffer reserves exceed overall cap, keeping previous configuration"
            );
            return Err(RawDataError::OutOfMemory {
                signal_id: crate::types::INVALID_SIGNAL_ID,
            });
        }

        // Remove or flag buffers that are no longer wanted.
        let stale: Vec<SignalId> = state
            .buffers
            .keys()
            .filter(|id| !signal_configs.contains_key(*id))
            .copied()
            .collect();
        for signal_id in stale {
            let fully_unreferenced = state
                .buffers
                .get(&signal_id)
                .is_some_and(|b| b.frames.iter().all(|f| f.loans == 0));
            if fully_unreferenced {
                if let Some(buffer) = state.buffers.remove(&signal_id) {
                    state.bytes_in_use -= buffer.bytes_in_use;
                }
                debug!(signal_id, "removed raw data buffer");
            } else if let Some(buffer) = state.buffers.get_mut(&signal_id) {
                buffer.deleting = true;
            }
        }

        for (signal_id, config) in signal_configs {
            match state.buffers.get_mut(signal_id) {
                Some(buffer) => {
                    buffer.config = config.clone();
                    buffer.deleting = false;
                }
                None => {
                    state.buffers.insert(*signal_id, SignalBuffer::new(config.clone()));
                }
            }
        }
        state.bytes_reserved = reserved;
        Ok(())
    }

    /// Store a payload for `signal_id`, returning its handle.
    ///
    /// # Errors
    ///
    /// [`RawDataError::NoConfig`] when the signal has no buffer,
    /// [`RawDataError::SampleTooLarge`] when the payload exceeds the
    /// per-sample limit, [`RawDataError::OutOfMemory`] when admission
    /// fails.
    pub fn store(
        &self,
        signal_id: SignalId,
        data: Bytes,
        timestamp_ms: Timestamp,
    ) -> Result<RawDataHandle, RawDataError> {
        let size = data.len();
        let mut state = self.state.lock().expect("buffer manager poisoned");
        let global_in_use = state.bytes_in_use;
        let global_cap = self.max_overall_bytes;

        let buffer = state
            .buffers
            .get_mut(&signal_id)
            .filter(|b| !b.deleting)
            .ok_or(RawDataError::NoConfig { signal_id })?;

        if size > buffer.config.max_bytes_per_sample {
            return Err(RawDataError::SampleTooLarge {
                signal_id,
                size,
                max: buffer.config.max_bytes_per_sample,
            });
        }

        let mut freed = 0usize;
        while buffer.frames.len() >= buffer.config.max_samples {
            match buffer.evict_oldest_unreferenced() {
                Some(bytes) => freed += bytes,
                None => return Err(RawDataError::OutOfMemory { signal_id }),
            }
        }
        while buffer.bytes_in_use + size > buffer.config.max_bytes {
            match buffer.evict_oldest_unreferenced() {
                Some(bytes) => freed += bytes,
                None => return Err(RawDataError::OutOfMemory { signal_id }),
            }
        }
        // Global cap, after the per-signal reserve this buffer is entitled
        // to. Eviction within this signal already freed what it could.
        let projected = global_in_use - freed + size;
        if projected > global_cap && buffer.bytes_in_use + size > buffer.config.reserved_bytes {
            return Err(RawDataError::OutOfMemory { signal_id });
        }

        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed).max(1);
        buffer.frames.push_back(Frame {
            handle,
            timestamp_ms,
            data,
            loans: 0,
            usage_hints: [0; STAGE_COUNT],
        });
        buffer.bytes_in_use += size;
        buffer.samples_received += 1;
        state.bytes_in_use = state.bytes_in_use - freed + size;
        Ok(handle)
    }

    /// Borrow the bytes behind a handle.
    ///
    /// Returns `None` when the handle is unknown (already evicted) or the
    /// signal has no buffer. The frame stays resident while the returned
    /// guard is alive.
    pub fn borrow_frame(
        self: &Arc<Self>,
        signal_id: SignalId,
        handle: RawDataHandle,
    ) -> Option<LoanedFrame> {
        let mut state = self.state.lock().expect("buffer manager poisoned");
        let buffer = state.buffers.get_mut(&signal_id)?;
        let frame = buffer.frames.iter_mut().find(|f| f.handle == handle)?;
        frame.loans += 1;
        Some(LoanedFrame {
            manager: Arc::clone(self),
            signal_id,
            handle,
            timestamp_ms: frame.timestamp_ms,
            data: frame.data.clone(),
        })
    }

    /// Mark a handle as held at a pipeline stage, protecting it from
    /// eviction.
    pub fn increase_usage_hint(
        &self,
        signal_id: SignalId,
        handle: RawDataHandle,
        stage: BufferStage,
    ) -> bool {
        let mut state = self.state.lock().expect("buffer manager poisoned");
        let Some(frame) = state
            .buffers
            .get_mut(&signal_id)
            .and_then(|b| b.frames.iter_mut().find(|f| f.handle == handle))
        else {
            return false;
        };
        frame.usage_hints[stage as usize] += 1;
        true
    }

    /// Undo one [`BufferManager::increase_usage_hint`].
    pub fn decrease_usage_hint(
        &self,
        signal_id: SignalId,
        handle: RawDataHandle,
        stage: BufferStage,
    ) -> bool {
        let mut state = self.state.lock().expect("buffer manager poisoned");
        let Some(frame) = state
            .buffers
            .get_mut(&signal_id)
            .and_then(|b| b.frames.iter_mut().find(|f| f.handle == handle))
        else {
            return false;
        };
        frame.usage_hints[stage as usize] = frame.usage_hints[stage as usize].saturating_sub(1);
        true
    }

    /// Whether a handle currently resolves to resident bytes.
    #[must_use]
    pub fn is_borrowable(&self, signal_id: SignalId, handle: RawDataHandle) -> bool {
        let state = self.state.lock().expect("buffer manager poisoned");
        state
            .buffers
            .get(&signal_id)
            .is_some_and(|b| b.frames.iter().any(|f| f.handle == handle))
    }

    /// Whether a buffer is configured for the signal.
    #[must_use]
    pub fn has_config(&self, signal_id: SignalId) -> bool {
        let state = self.state.lock().expect("buffer manager poisoned");
        state.buffers.get(&signal_id).is_some_and(|b| !b.deleting)
    }

    /// Per-signal counters, if the signal has a buffer.
    #[must_use]
    pub fn stats(&self, signal_id: SignalId) -> Option<SignalBufferStats> {
        let state = self.state.lock().expect("buffer manager poisoned");
        state.buffers.get(&signal_id).map(|b| SignalBufferStats {
            samples_received: b.samples_received,
            samples_resident: b.frames.len(),
            bytes_resident: b.bytes_in_use,
        })
    }

    /// Bytes currently resident across all signals.
    #[must_use]
    pub fn bytes_in_use(&self) -> usize {
        self.state.lock().expect("buffer manager poisoned").bytes_in_use
    }

    fn return_loan(&self, signal_id: SignalId, handle: RawDataHandle) {
        let mut state = self.state.lock().expect("buffer manager poisoned");
        let Some(buffer) = state.buffers.get_mut(&signal_id) else {
            return;
        };
        if let Some(frame) = buffer.frames.iter_mut().find(|f| f.handle == handle) {
            frame.loans = frame.loans.saturating_sub(1);
        }
        if buffer.deleting && buffer.frames.iter().all(|f| f.loans == 0) {
            if let Some(buffer) = state.buffers.remove(&signal_id) {
                state.bytes_in_use -= buffer.bytes_in_use;
            }
            debug!(signal_id, "removed raw data buffer after last loan");
        }
    }
}

impl std::fmt::Debug for BufferManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().expect("buffer manager poisoned");
        f.debug_struct("BufferManager")
            .field("buffers", &state.buffers.len())
            .field("bytes_in_use", &state.bytes_in_use)
            .finish()
    }
}

/// RAII borrow of a raw data frame.
///
/// The bytes stay valid for as long as the guard is alive; dropping it
/// releases the reference.
pub struct LoanedFrame {
    manager: Arc<BufferManager>,
    signal_id: SignalId,
    handle: RawDataHandle,
    timestamp_ms: Timestamp,
    data: Bytes,
}

impl LoanedFrame {
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub const fn handle(&self) -> RawDataHandle {
        self.handle
    }

    #[must_use]
    pub const fn timestamp_ms(&self) -> Timestamp {
        self.timestamp_ms
    }
}

impl Drop for LoanedFrame {
    fn drop(&mut self) {
        self.manager.return_loan(self.signal_id, self.handle);
    }
}

impl std::fmt::Debug for LoanedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoanedFrame")
            .field("signal_id", &self.signal_id)
            .field("handle", &self.handle)
            .field("len", &self.data.len())
            .finish()
    }
}
