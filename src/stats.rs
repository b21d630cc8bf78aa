//! Channel traffic counters
//!
//! A flat bundle of relaxed atomics updated outside the hot paths. All
//! updates are idempotent increments or last-writer-wins stamps, so no
//! single-writer discipline is required.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Counter bundle attached to every RPC channel
#[derive(Debug, Default)]
pub struct ChannelStats {
    requests_sent: AtomicU64,
    responses_sent: AtomicU64,
    errors_sent: AtomicU64,
    requests_received: AtomicU64,
    responses_received: AtomicU64,
    errors_received: AtomicU64,

    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    largest_packet_sent: AtomicU64,
    largest_packet_received: AtomicU64,
    last_message_size_sent: AtomicU64,
    last_message_size_received: AtomicU64,
    max_wait_ms_sent: AtomicU64,
    max_wait_ms_received: AtomicU64,

    discarded_responses: AtomicU64,
    last_discarded_id: AtomicU64,
    timeouts: AtomicU64,
    last_timeout_unix_ms: AtomicU64,
    malformed_frames: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub requests_sent: u64,
    pub responses_sent: u64,
    pub errors_sent: u64,
    pub requests_received: u64,
    pub responses_received: u64,
    pub errors_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub largest_packet_sent: u64,
    pub largest_packet_received: u64,
    pub last_message_size_sent: u64,
    pub last_message_size_received: u64,
    pub max_wait_ms_sent: u64,
    pub max_wait_ms_received: u64,
    pub discarded_responses: u64,
    pub last_discarded_id: u64,
    pub timeouts: u64,
    pub last_timeout_unix_ms: u64,
    pub malformed_frames: u64,
}

impl ChannelStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_sent(&self) {
        self.responses_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error_sent(&self) {
        self.errors_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_response_received(&self) {
        self.responses_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error_received(&self) {
        self.errors_received.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_packet_sent(&self, len: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(len as u64, Ordering::Relaxed);
        self.largest_packet_sent
            .fetch_max(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_packet_received(&self, len: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
        self.largest_packet_received
            .fetch_max(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message_sent(&self, payload_len: usize) {
        self.last_message_size_sent
            .store(payload_len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message_received(&self, payload_len: usize) {
        self.last_message_size_received
            .store(payload_len as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_send_wait(&self, millis: u64) {
        self.max_wait_ms_sent.fetch_max(millis, Ordering::Relaxed);
    }

    pub(crate) fn record_receive_wait(&self, millis: u64) {
        self.max_wait_ms_received
            .fetch_max(millis, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded_response(&self, id: u64) {
        self.discarded_responses.fetch_add(1, Ordering::Relaxed);
        self.last_discarded_id.store(id, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.last_timeout_unix_ms.store(now, Ordering::Relaxed);
    }

    pub(crate) fn record_malformed_frame(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy every counter at once
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            responses_sent: self.responses_sent.load(Ordering::Relaxed),
            errors_sent: self.errors_sent.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            responses_received: self.responses_received.load(Ordering::Relaxed),
            errors_received: self.errors_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            largest_packet_sent: self.largest_packet_sent.load(Ordering::Relaxed),
            largest_packet_received: self.largest_packet_received.load(Ordering::Relaxed),
            last_message_size_sent: self.last_message_size_sent.load(Ordering::Relaxed),
            last_message_size_received: self.last_message_size_received.load(Ordering::Relaxed),
            max_wait_ms_sent: self.max_wait_ms_sent.load(Ordering::Relaxed),
            max_wait_ms_received: self.max_wait_ms_received.load(Ordering::Relaxed),
            discarded_responses: self.discarded_responses.load(Ordering::Relaxed),
            last_discarded_id: self.last_discarded_id.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            last_timeout_unix_ms: self.last_timeout_unix_ms.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter
    pub fn reset(&self) {
        for counter in [
            &self.requests_sent,
            &self.responses_sent,
            &self.errors_sent,
            &self.requests_received,
            &self.responses_received,
            &self.errors_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.packets_sent,
            &self.packets_received,
            &self.largest_packet_sent,
            &self.largest_packet_received,
            &self.last_message_size_sent,
            &self.last_message_size_received,
            &self.max_wait_ms_sent,
            &self.max_wait_ms_received,
            &self.discarded_responses,
            &self.last_discarded_id,
            &self.timeouts,
            &self.last_timeout_unix_ms,
            &self.malformed_frames,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Export the current snapshot as pretty JSON
    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.snapshot())
    }
}
