//! `MultiClientWindow`/`MultiClientChannel`: a weighted pool of provider
//! sessions (`Client`s), selected per-destination with short-lived
//! affinity, resized toward observed traffic, and pruned of blackholed
//! channels.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use std::sync::Arc;
use tokio::sync::RwLock;

use relaynet_core::config::MultiClientSettings;
use relaynet_core::shuffle::weighted_shuffle;
use relaynet_core::Id;

use crate::client::Client;

/// Bucketed event-rate tracker bounded by `max_bucket_count()` live
/// buckets regardless of traffic rate.
pub struct StatsWindow {
    bucket_duration: Duration,
    window: Duration,
    max_buckets: usize,
    buckets: Mutex<VecDeque<(Instant, u64)>>,
}

impl StatsWindow {
    pub fn new(settings: &MultiClientSettings) -> Self {
        Self {
            bucket_duration: settings.stats_window_bucket_duration(),
            window: settings.stats_window_duration(),
            max_buckets: settings.max_bucket_count(),
            buckets: Mutex::new(VecDeque::with_capacity(settings.max_bucket_count())),
        }
    }

    pub fn record(&self, at: Instant) {
        let mut buckets = self.buckets.lock().expect("stats lock poisoned");
        match buckets.back_mut() {
            Some((start, count)) if at.duration_since(*start) < self.bucket_duration => {
                *count += 1;
            }
            _ => buckets.push_back((at, 1)),
        }
        while let Some((start, _)) = buckets.front() {
            if at.duration_since(*start) > self.window {
                buckets.pop_front();
            } else {
                break;
            }
        }
        debug_assert!(buckets.len() <= self.max_buckets);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().expect("stats lock poisoned").len()
    }

    /// Events per second over the retained window.
    pub fn rate(&self) -> f64 {
        let buckets = self.buckets.lock().expect("stats lock poisoned");
        let total: u64 = buckets.iter().map(|(_, count)| count).sum();
        total as f64 / self.window.as_secs_f64().max(0.001)
    }
}

/// One provider session in the window, with the traffic stats and
/// liveness tracking used to weight and prune it.
pub struct MultiClientChannel {
    id: Id,
    client: Arc<Client>,
    stats: StatsWindow,
    last_response_at: Mutex<Instant>,
    blackholed: AtomicBool,
    blackhole_timeout: Duration,
}

impl MultiClientChannel {
    fn new(client: Arc<Client>, settings: &MultiClientSettings) -> Self {
        Self {
            id: client.local_id(),
            client,
            stats: StatsWindow::new(settings),
            last_response_at: Mutex::new(Instant::now()),
            blackholed: AtomicBool::new(false),
            blackhole_timeout: settings.blackhole_timeout(),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn client(&self) -> Arc<Client> {
        self.client.clone()
    }

    pub fn record_send(&self) {
        self.stats.record(Instant::now());
    }

    pub fn record_response(&self) {
        *self.last_response_at.lock().expect("response lock poisoned") = Instant::now();
        self.blackholed.store(false, Ordering::Relaxed);
    }

    /// A channel is blackholed once it has been sending traffic but has
    /// gone `blackhole_timeout` without a single response.
    pub fn is_blackholed(&self) -> bool {
        if self.blackholed.load(Ordering::Relaxed) {
            return true;
        }
        let silent_for = self
            .last_response_at
            .lock()
            .expect("response lock poisoned")
            .elapsed();
        self.stats.rate() > 0.0 && silent_for > self.blackhole_timeout
    }

    pub fn mark_blackholed(&self) {
        self.blackholed.store(true, Ordering::Relaxed);
    }

    fn weight(&self) -> f64 {
        if self.is_blackholed() {
            0.0
        } else {
            1.0 / (1.0 + self.stats.rate())
        }
    }
}

/// The weighted pool of channels a multi-client transfer is spread
/// across, with destination affinity and traffic-driven resizing.
pub struct MultiClientWindow {
    settings: MultiClientSettings,
    channels: RwLock<Vec<Arc<MultiClientChannel>>>,
    affinity: Mutex<HashMap<Id, (Id, Instant)>>,
}

impl MultiClientWindow {
    pub fn new(settings: MultiClientSettings) -> Self {
        Self {
            settings,
            channels: RwLock::new(Vec::new()),
            affinity: Mutex::new(HashMap::new()),
        }
    }

    pub async fn add_channel(&self, client: Arc<Client>) -> Arc<MultiClientChannel> {
        let channel = Arc::new(MultiClientChannel::new(client, &self.settings));
        self.channels.write().await.push(channel.clone());
        channel
    }

    pub async fn remove_channel(&self, id: Id) {
        self.channels.write().await.retain(|c| c.id != id);
    }

    pub async fn channel_count(&self) -> usize {
        self.channels.read().await.len()
    }

    pub async fn prune_blackholed(&self) -> Vec<Id> {
        let mut channels = self.channels.write().await;
        let (keep, drop): (Vec<_>, Vec<_>) = channels.drain(..).partition(|c| !c.is_blackholed());
        *channels = keep;
        drop.into_iter().map(|c| c.id).collect()
    }

    /// Choose a channel for `destination_id`: reuse the last channel used
    /// for that destination within `client_affinity_timeout`, otherwise a
    /// weighted pick among live channels.
    pub async fn select(&self, destination_id: Id) -> Option<Arc<MultiClientChannel>> {
        {
            let affinity = self.affinity.lock().expect("affinity lock poisoned");
            if let Some((channel_id, last_used)) = affinity.get(&destination_id) {
                if last_used.elapsed() < self.settings.client_affinity_timeout() {
                    let channel_id = *channel_id;
                    drop(affinity);
                    if let Some(channel) = self
                        .channels
                        .read()
                        .await
                        .iter()
                        .find(|c| c.id == channel_id && !c.is_blackholed())
                    {
                        return Some(channel.clone());
                    }
                }
            }
        }

        let candidates = self.channels.read().await.clone();
        if candidates.is_empty() {
            return None;
        }
        let weighted: Vec<(Arc<MultiClientChannel>, f64)> =
            candidates.into_iter().map(|c| (c.clone(), c.weight())).collect();
        let mut rng = rand::thread_rng();
        let chosen = weighted_shuffle(weighted, &mut rng).into_iter().next()?;
        self.affinity
            .lock()
            .expect("affinity lock poisoned")
            .insert(destination_id, (chosen.id, Instant::now()));
        Some(chosen)
    }

    /// The window size the current aggregate send rate calls for: expand
    /// when traffic outruns `window_expand_scale` of the current size,
    /// collapse when it falls under `window_collapse_scale`, and never
    /// move further than `window_expand_max_overshoot_scale` in one step.
    pub async fn desired_window_size(&self, aggregate_send_rate: f64) -> usize {
        let current = self.channels.read().await.len().max(1);
        let expand_threshold = current as f64 * self.settings.window_expand_scale;
        let collapse_threshold = current as f64 * self.settings.window_collapse_scale;

        let target = if aggregate_send_rate > expand_threshold {
            (current as f64 * self.settings.window_expand_scale).ceil() as usize
        } else if aggregate_send_rate < collapse_threshold {
            (current as f64 * self.settings.window_collapse_scale).floor() as usize
        } else {
            current
        };

        let max_step = (current as f64 * self.settings.window_expand_max_overshoot_scale).ceil() as usize;
        target
            .min(max_step.max(self.settings.window_size_min))
            .clamp(self.settings.window_size_min, self.settings.window_size_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_window_never_exceeds_invariant_bucket_bound() {
        let settings = MultiClientSettings {
            stats_window_duration_ms: 1_000,
            stats_window_bucket_duration_ms: 100,
            ..MultiClientSettings::default()
        };
        let stats = StatsWindow::new(&settings);
        let start = Instant::now();
        for i in 0..500u64 {
            stats.record(start + Duration::from_millis(i * 3));
            assert!(stats.bucket_count() <= settings.max_bucket_count());
        }
    }

    #[test]
    fn rate_reflects_recorded_events() {
        let settings = MultiClientSettings::default();
        let stats = StatsWindow::new(&settings);
        let now = Instant::now();
        for _ in 0..10 {
            stats.record(now);
        }
        assert!(stats.rate() > 0.0);
    }

    #[tokio::test]
    async fn desired_window_size_stays_within_bounds() {
        let settings = MultiClientSettings {
            window_size_min: 2,
            window_size_max: 8,
            ..MultiClientSettings::default()
        };
        let window = MultiClientWindow::new(settings);
        let size = window.desired_window_size(1_000_000.0).await;
        assert!((2..=8).contains(&size));
    }
}
