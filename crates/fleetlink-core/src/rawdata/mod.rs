//! Raw data buffer manager.
//!
//! Oversized opaque signal payloads (images, strings, serialized frames)
//! are not carried through the signal pipeline by value. Decoders store
//! them here and forward a 32-bit handle; downstream consumers borrow the
//! bytes back for as long as a [`LoanedFrame`] guard is alive.
//!
//! # Admission
//!
//! Each signal gets a quota resolved from [`RawDataBufferConfig`]:
//! reserved bytes, max bytes, max samples and max bytes per sample. A new
//! sample that would exceed `max_samples` evicts the oldest unreferenced
//! sample of that signal; if every resident sample is referenced the new
//! one is rejected. Samples larger than `max_bytes_per_sample` are always
//! rejected. A global byte cap applies across all signals on top of the
//! per-signal reserves.
//!
//! # Usage hints
//!
//! A handle can be marked as in use at a given pipeline stage (history
//! buffer, selected for upload, uploading). Hints make a frame ineligible
//! for eviction but, unlike a loan, do not pin the bytes against
//! `update_config` removal of the whole signal.

mod manager;
#[cfg(test)]
mod tests;

pub use manager::{
    BufferManager, BufferStage, LoanedFrame, RawDataBufferConfig, RawDataError,
    SignalBufferConfig, SignalBufferStats,
};
