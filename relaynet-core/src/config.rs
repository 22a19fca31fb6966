//! Settings structures shared by the transfer engine, with TOML loading and
//! optional hot-reload via the `notify` crate.
//!
//! All public APIs are async-ready but do not impose an async runtime
//! themselves, mirroring the teacher crate's config module. Durations are
//! stored as millisecond counts (TOML-friendly) with accessor methods
//! returning `std::time::Duration`, the same split the teacher uses for
//! `reorder_timeout_ms` / `reorder_timeout()`.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::{Error, Result};

/// Client-wide knobs that are not specific to one buffer direction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub send_buffer: SendBufferSettings,
    pub receive_buffer: ReceiveBufferSettings,
    pub forward_buffer: ForwardBufferSettings,
    pub contract_manager: ContractManagerSettings,
    pub multi_client: MultiClientSettings,
    /// Size of the bounded intake channel feeding a sequence's run loop.
    pub sequence_buffer_size: usize,
    /// Size of the bounded ack-intake channel feeding a sequence's run loop.
    pub ack_buffer_size: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            send_buffer: SendBufferSettings::default(),
            receive_buffer: ReceiveBufferSettings::default(),
            forward_buffer: ForwardBufferSettings::default(),
            contract_manager: ContractManagerSettings::default(),
            multi_client: MultiClientSettings::default(),
            sequence_buffer_size: 32,
            ack_buffer_size: 32,
        }
    }
}

/// Settings governing `SendSequence` behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SendBufferSettings {
    pub create_contract_timeout_ms: u64,
    pub create_contract_retry_interval_ms: u64,
    pub min_resend_interval_ms: u64,
    pub max_resend_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub selective_ack_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub resend_queue_max_byte_count: u64,
    pub write_timeout_ms: u64,
    /// Smoothing factor applied to RTT samples, clamped into
    /// `[min_resend_interval, max_resend_interval]`.
    pub rtt_scale: f64,
}

impl Default for SendBufferSettings {
    fn default() -> Self {
        Self {
            create_contract_timeout_ms: 30_000,
            create_contract_retry_interval_ms: 250,
            min_resend_interval_ms: 1_000,
            max_resend_interval_ms: 5_000,
            ack_timeout_ms: 30_000,
            selective_ack_timeout_ms: 30_000,
            idle_timeout_ms: 60_000,
            resend_queue_max_byte_count: 2 * 1024 * 1024,
            write_timeout_ms: 5_000,
            rtt_scale: 2.0,
        }
    }
}

impl SendBufferSettings {
    pub fn create_contract_timeout(&self) -> Duration {
        Duration::from_millis(self.create_contract_timeout_ms)
    }
    pub fn create_contract_retry_interval(&self) -> Duration {
        Duration::from_millis(self.create_contract_retry_interval_ms)
    }
    pub fn min_resend_interval(&self) -> Duration {
        Duration::from_millis(self.min_resend_interval_ms)
    }
    pub fn max_resend_interval(&self) -> Duration {
        Duration::from_millis(self.max_resend_interval_ms)
    }
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
    pub fn selective_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.selective_ack_timeout_ms)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Clamp a raw RTT sample (scaled by `rtt_scale`) into
    /// `[min_resend_interval, max_resend_interval]`.
    pub fn clamp_rtt(&self, sample: Duration) -> Duration {
        let scaled = sample.mul_f64(self.rtt_scale.max(0.0));
        scaled.clamp(self.min_resend_interval(), self.max_resend_interval())
    }
}

/// Settings governing `ReceiveSequence` behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiveBufferSettings {
    pub gap_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub receive_queue_max_byte_count: u64,
    pub max_open_receive_contract: usize,
    pub ack_compress_timeout_ms: u64,
    /// Whether nack packs without a `contractId` are accepted.
    pub allow_legacy_nack: bool,
}

impl Default for ReceiveBufferSettings {
    fn default() -> Self {
        Self {
            gap_timeout_ms: 30_000,
            idle_timeout_ms: 120_000,
            receive_queue_max_byte_count: (5 * 1024 * 1024) / 2,
            max_open_receive_contract: 4,
            ack_compress_timeout_ms: 50,
            allow_legacy_nack: false,
        }
    }
}

impl ReceiveBufferSettings {
    pub fn gap_timeout(&self) -> Duration {
        Duration::from_millis(self.gap_timeout_ms)
    }
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
    pub fn ack_compress_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_compress_timeout_ms)
    }
}

/// Settings governing `ForwardSequence` behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ForwardBufferSettings {
    pub idle_timeout_ms: u64,
    pub write_timeout_ms: u64,
    /// Runtime toggle for validating forwarded envelopes before copying
    /// them to the destination writer (see open question in SPEC_FULL.md).
    pub verify_forward_messages: bool,
}

impl Default for ForwardBufferSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 60_000,
            write_timeout_ms: 5_000,
            verify_forward_messages: true,
        }
    }
}

impl ForwardBufferSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Settings governing `ContractManager` behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContractManagerSettings {
    pub standard_contract_transfer_byte_count: u64,
    pub contract_fill_fraction: f64,
    pub min_message_byte_count: u64,
}

impl Default for ContractManagerSettings {
    fn default() -> Self {
        Self {
            standard_contract_transfer_byte_count: 8 * 1024 * 1024 * 1024,
            contract_fill_fraction: 0.5,
            min_message_byte_count: 256,
        }
    }
}

impl ContractManagerSettings {
    /// Usable byte budget for a contract: `transferByteCount * fillFraction`.
    pub fn usable_byte_count(&self, transfer_byte_count: u64) -> u64 {
        (transfer_byte_count as f64 * self.contract_fill_fraction.clamp(0.0, 1.0)) as u64
    }

    /// Per-message charge: `max(messageBytes, minMessageByteCount)`.
    pub fn charge_for(&self, message_bytes: u64) -> u64 {
        message_bytes.max(self.min_message_byte_count)
    }
}

/// Settings governing `MultiClientWindow` behavior.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultiClientSettings {
    pub window_size_min: usize,
    pub window_size_max: usize,
    pub window_expand_scale: f64,
    pub window_collapse_scale: f64,
    pub window_expand_max_overshoot_scale: f64,
    pub reconnect_scale: f64,
    pub window_resize_timeout_ms: u64,
    pub window_enumerate_empty_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub blackhole_timeout_ms: u64,
    pub client_affinity_timeout_ms: u64,
    pub write_retry_timeout_ms: u64,
    pub stats_window_duration_ms: u64,
    pub stats_window_bucket_duration_ms: u64,
    /// Percentile (0.0-1.0) used to select the representative source count
    /// across channels, e.g. 1.0 = max.
    pub stats_source_count_selection: f64,
}

impl Default for MultiClientSettings {
    fn default() -> Self {
        Self {
            window_size_min: 2,
            window_size_max: 8,
            window_expand_scale: 1.5,
            window_collapse_scale: 0.75,
            window_expand_max_overshoot_scale: 2.0,
            reconnect_scale: 1.0,
            window_resize_timeout_ms: 15_000,
            window_enumerate_empty_timeout_ms: 30_000,
            ping_timeout_ms: 5_000,
            blackhole_timeout_ms: 15_000,
            client_affinity_timeout_ms: 0,
            write_retry_timeout_ms: 5_000,
            stats_window_duration_ms: 60_000,
            stats_window_bucket_duration_ms: 1_000,
            stats_source_count_selection: 1.0,
        }
    }
}

impl MultiClientSettings {
    pub fn window_resize_timeout(&self) -> Duration {
        Duration::from_millis(self.window_resize_timeout_ms)
    }
    pub fn window_enumerate_empty_timeout(&self) -> Duration {
        Duration::from_millis(self.window_enumerate_empty_timeout_ms)
    }
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
    pub fn blackhole_timeout(&self) -> Duration {
        Duration::from_millis(self.blackhole_timeout_ms)
    }
    pub fn client_affinity_timeout(&self) -> Duration {
        Duration::from_millis(self.client_affinity_timeout_ms)
    }
    pub fn write_retry_timeout(&self) -> Duration {
        Duration::from_millis(self.write_retry_timeout_ms)
    }
    pub fn stats_window_duration(&self) -> Duration {
        Duration::from_millis(self.stats_window_duration_ms)
    }
    pub fn stats_window_bucket_duration(&self) -> Duration {
        Duration::from_millis(self.stats_window_bucket_duration_ms)
    }

    /// `1 + ceil(window / bucket)`: the invariant bound on live event
    /// buckets regardless of traffic rate.
    pub fn max_bucket_count(&self) -> usize {
        let window = self.stats_window_duration_ms.max(1);
        let bucket = self.stats_window_bucket_duration_ms.max(1);
        1 + ((window + bucket - 1) / bucket) as usize
    }
}

impl ClientSettings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(&path)?;
        let settings = toml::from_str::<ClientSettings>(&data)?;
        Ok(settings)
    }

    /// Watch a settings file for changes and receive updates through a
    /// watch channel. The returned watcher is leaked so it keeps running
    /// for the lifetime of the process, matching the teacher crate's
    /// `NyxConfig::watch_file` convention.
    pub fn watch_file<P: AsRef<Path>>(
        path: P,
    ) -> Result<(Arc<ClientSettings>, watch::Receiver<Arc<ClientSettings>>)> {
        let path_buf = path.as_ref().to_path_buf();
        let initial = Arc::new(Self::from_file(&path_buf)?);
        let path_in_closure = path_buf.clone();
        let (tx, rx) = watch::channel(initial.clone());

        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| {
                if let Ok(event) = res {
                    if matches!(event.kind, EventKind::Modify(_)) {
                        if let Ok(updated) = Self::from_file(&path_in_closure) {
                            let _ = tx.send(Arc::new(updated));
                        }
                    }
                }
            })
            .map_err(|e| Error::config(e.to_string()))?;

        watcher
            .watch(&path_buf, RecursiveMode::NonRecursive)
            .map_err(|e| Error::config(e.to_string()))?;
        std::mem::forget(watcher);

        Ok((initial, rx))
    }
}
