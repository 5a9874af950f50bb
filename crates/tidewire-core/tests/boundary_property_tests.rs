//! Property-based tests for boundary framing
//!
//! These tests verify that message bodies are recovered exactly no matter
//! how the raw stream is cut into chunks, including cuts inside the marker.

use proptest::prelude::*;
use tidewire_core::{contains_marker, BoundaryScanner, BOUNDARY_MARKER};

/// Generate payloads that never contain the marker
fn arb_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..300).prop_filter("payload contains marker", |p| {
        !contains_marker(p)
    })
}

/// Generate payloads biased towards marker bytes so near-misses are common
fn arb_marker_like_payload() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(prop::sample::select(BOUNDARY_MARKER.to_vec()), 0..64)
        .prop_filter("payload contains marker", |p| !contains_marker(p))
}

/// Concatenate each payload followed by the marker
fn frame(payloads: &[Vec<u8>]) -> Vec<u8> {
    let mut wire = Vec::new();
    for payload in payloads {
        wire.extend_from_slice(payload);
        wire.extend_from_slice(&BOUNDARY_MARKER);
    }
    wire
}

/// Feed `wire` in chunks of the given sizes (cycled) and collect messages
fn scan_in_chunks(wire: &[u8], sizes: &[usize]) -> (Vec<Vec<u8>>, BoundaryScanner) {
    let mut scanner = BoundaryScanner::new();
    let mut messages = Vec::new();
    let mut current = Vec::new();
    let mut offset = 0;
    let mut turn = 0;

    while offset < wire.len() {
        let size = sizes[turn % sizes.len()].max(1);
        let end = (offset + size).min(wire.len());
        for scan in scanner.scan(&wire[offset..end]) {
            current.extend_from_slice(&scan.body);
            if scan.boundary_found {
                messages.push(std::mem::take(&mut current));
            }
        }
        offset = end;
        turn += 1;
    }
    (messages, scanner)
}

proptest! {
    /// Property: any chunk partition recovers every payload exactly
    #[test]
    fn chunking_never_changes_messages(
        payloads in prop::collection::vec(arb_payload(), 1..6),
        sizes in prop::collection::vec(1usize..40, 1..10),
    ) {
        let wire = frame(&payloads);
        let (messages, scanner) = scan_in_chunks(&wire, &sizes);

        prop_assert_eq!(&messages, &payloads);
        prop_assert_eq!(scanner.boundaries_found(), payloads.len() as u64);
        prop_assert!(!scanner.has_pending());
    }

    /// Property: payloads made of marker bytes are never cut short
    #[test]
    fn near_miss_payloads_survive(
        payload in arb_marker_like_payload(),
        size in 1usize..12,
    ) {
        let wire = frame(std::slice::from_ref(&payload));
        let (messages, _) = scan_in_chunks(&wire, &[size]);
        prop_assert_eq!(messages, vec![payload]);
    }

    /// Property: withheld bytes never exceed the carry capacity between chunks
    #[test]
    fn carry_stays_bounded(
        payload in arb_payload(),
        sizes in prop::collection::vec(1usize..20, 1..6),
    ) {
        let mut scanner = BoundaryScanner::new();
        let mut offset = 0;
        let mut turn = 0;
        while offset < payload.len() {
            let end = (offset + sizes[turn % sizes.len()]).min(payload.len());
            scanner.scan(&payload[offset..end]);
            prop_assert!(scanner.carry().len() <= scanner.carry_capacity());
            offset = end;
            turn += 1;
        }
    }
}
