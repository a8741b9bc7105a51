//! Tests for the raw data buffer manager: admission, eviction, loans,
//! usage hints and reconfiguration.

use std::collections::HashMap;

use bytes::Bytes;

use super::*;
use crate::types::SignalId;

// =============================================================================
// Test helpers
// =============================================================================

fn config(max_samples: usize, max_bytes: usize, max_per_sample: usize) -> RawDataBufferConfig {
    RawDataBufferConfig {
        max_overall_bytes: 1024 * 1024,
        reserved_bytes_per_signal: 0,
        max_bytes_per_signal: max_bytes,
        max_samples_per_signal: max_samples,
        max_bytes_per_sample: max_per_sample,
    }
}

fn manager_with_signals(
    config: &RawDataBufferConfig,
    signals: &[SignalId],
) -> std::sync::Arc<BufferManager> {
    let manager = BufferManager::new(config);
    let configs: HashMap<SignalId, SignalBufferConfig> = signals
        .iter()
        .map(|&id| (id, config.signal_config(id)))
        .collect();
    manager.update_config(&configs).unwrap();
    manager
}

fn payload(len: usize) -> Bytes {
    Bytes::from(vec![0xAB; len])
}

// =============================================================================
// Admission
// =============================================================================

#[test]
fn store_without_config_is_rejected() {
    let manager = BufferManager::new(&config(4, 1024, 256));
    let err = manager.store(1, payload(10), 100).unwrap_err();
    assert_eq!(err, RawDataError::NoConfig { signal_id: 1 });
}

#[test]
fn oversized_sample_is_rejected() {
    let manager = manager_with_signals(&config(4, 1024, 16), &[1]);
    let err = manager.store(1, payload(17), 100).unwrap_err();
    assert_eq!(
        err,
        RawDataError::SampleTooLarge {
            signal_id: 1,
            size: 17,
            max: 16
        }
    );
}

#[test]
fn max_samples_evicts_oldest_unreferenced() {
    let manager = manager_with_signals(&config(2, 1024, 256), &[1]);
    let first = manager.store(1, payload(8), 100).unwrap();
    let second = manager.store(1, payload(8), 200).unwrap();
    let third = manager.store(1, payload(8), 300).unwrap();

    assert!(!manager.is_borrowable(1, first));
    assert!(manager.is_borrowable(1, second));
    assert!(manager.is_borrowable(1, third));
    assert_eq!(manager.stats(1).unwrap().samples_resident, 2);
}

#[test]
fn fully_referenced_buffer_rejects_new_samples() {
    let manager = manager_with_signals(&config(2, 1024, 256), &[1]);
    let a = manager.store(1, payload(8), 100).unwrap();
    let b = manager.store(1, payload(8), 200).unwrap();
    let loan_a = manager.borrow_frame(1, a).unwrap();
    let loan_b = manager.borrow_frame(1, b).unwrap();

    let err = manager.store(1, payload(8), 300).unwrap_err();
    assert_eq!(err, RawDataError::OutOfMemory { signal_id: 1 });

    drop(loan_a);
    drop(loan_b);
    // Space can be reclaimed again once the loans are returned.
    manager.store(1, payload(8), 400).unwrap();
}

#[test]
fn per_signal_byte_budget_is_enforced() {
    let manager = manager_with_signals(&config(100, 32, 32), &[1]);
    manager.store(1, payload(16), 100).unwrap();
    manager.store(1, payload(16), 200).unwrap();
    // Third sample forces eviction of the first to stay under 32 bytes.
    manager.store(1, payload(16), 300).unwrap();
    let stats = manager.stats(1).unwrap();
    assert_eq!(stats.samples_resident, 2);
    assert!(stats.bytes_resident <= 32);
}

#[test]
fn byte_budget_counts_all_resident_frames() {
    let manager = manager_with_signals(&config(100, 64, 64), &[1, 2]);
    manager.store(1, payload(30), 100).unwrap();
    manager.store(2, payload(30), 100).unwrap();
    assert_eq!(manager.bytes_in_use(), 60);
}

// =============================================================================
// Loans
// =============================================================================

#[test]
fn loan_pins_bytes_against_eviction() {
    let manager = manager_with_signals(&config(1, 1024, 256), &[1]);
    let handle = manager.store(1, payload(8), 100).unwrap();
    let loan = manager.borrow_frame(1, handle).unwrap();

    // Buffer holds max one sample and its only frame is loaned out.
    let err = manager.store(1, payload(8), 200).unwrap_err();
    assert_eq!(err, RawDataError::OutOfMemory { signal_id: 1 });
    assert_eq!(loan.data(), &[0xAB; 8][..]);

    drop(loan);
    manager.store(1, payload(8), 300).unwrap();
    assert!(!manager.is_borrowable(1, handle));
}

#[test]
fn borrow_unknown_handle_returns_none() {
    let manager = manager_with_signals(&config(4, 1024, 256), &[1]);
    assert!(manager.borrow_frame(1, 9999).is_none());
    assert!(manager.borrow_frame(2, 1).is_none());
}

// =============================================================================
// Usage hints
// =============================================================================

#[test]
fn usage_hint_protects_from_eviction() {
    let manager = manager_with_signals(&config(2, 1024, 256), &[1]);
    let a = manager.store(1, payload(8), 100).unwrap();
    let b = manager.store(1, payload(8), 200).unwrap();
    assert!(manager.increase_usage_hint(1, a, BufferStage::SelectedForUpload));

    // `a` is protected, so `b` is the oldest evictable frame.
    manager.store(1, payload(8), 300).unwrap();
    assert!(manager.is_borrowable(1, a));
    assert!(!manager.is_borrowable(1, b));

    assert!(manager.decrease_usage_hint(1, a, BufferStage::SelectedForUpload));
    manager.store(1, payload(8), 400).unwrap();
    assert!(!manager.is_borrowable(1, a));
}

#[test]
fn usage_hint_on_unknown_handle_fails() {
    let manager = manager_with_signals(&config(2, 1024, 256), &[1]);
    assert!(!manager.increase_usage_hint(1, 42, BufferStage::Uploading));
}

// =============================================================================
// Reconfiguration
// =============================================================================

#[test]
fn removed_signal_loses_its_buffer() {
    let cfg = config(4, 1024, 256);
    let manager = manager_with_signals(&cfg, &[1, 2]);
    manager.store(1, payload(8), 100).unwrap();

    let only_two: HashMap<SignalId, SignalBufferConfig> =
        [(2, cfg.signal_config(2))].into_iter().collect();
    manager.update_config(&only_two).unwrap();

    assert!(!manager.has_config(1));
    assert!(manager.has_config(2));
    assert_eq!(manager.bytes_in_use(), 0);
}

#[test]
fn removal_with_live_loan_is_deferred() {
    let cfg = config(4, 1024, 256);
    let manager = manager_with_signals(&cfg, &[1]);
    let handle = manager.store(1, payload(8), 100).unwrap();
    let loan = manager.borrow_frame(1, handle).unwrap();

    manager.update_config(&HashMap::new()).unwrap();
    // The loan keeps the bytes alive even though the config is gone.
    assert!(!manager.has_config(1));
    assert_eq!(loan.data().len(), 8);

    drop(loan);
    assert!(!manager.is_borrowable(1, handle));
    assert_eq!(manager.bytes_in_use(), 0);
}

#[test]
fn excessive_reserves_keep_previous_config() {
    let manager = manager_with_signals(&config(4, 1024, 256), &[1]);
    let mut greedy = HashMap::new();
    greedy.insert(
        2,
        SignalBufferConfig {
            signal_id: 2,
            reserved_bytes: 2 * 1024 * 1024,
            max_bytes: 2 * 1024 * 1024,
            max_samples: 4,
            max_bytes_per_sample: 256,
        },
    );
    assert!(manager.update_config(&greedy).is_err());
    // Signal 1 is still usable.
    manager.store(1, payload(8), 100).unwrap();
}
