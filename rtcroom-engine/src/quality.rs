//! Network quality classification and bitrate feedback
//!
//! Loss/RTT samples reported by the transport are kept per channel in a
//! rolling window. On every evaluation tick each channel with samples is
//! classified, and every local video send channel runs one AIMD step:
//!
//! - loss or RTT above the "bad" threshold: multiply the target by
//!   `decrease_factor`
//! - loss and RTT below the "good" threshold: add `increase_step_bps`
//! - otherwise hold
//!
//! Both outputs are advisory. Nothing here throttles the pipeline.

use dashmap::DashMap;
use rtcroom_core::QualityConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::types::{ChannelKey, StreamType, UserId};

/// One delivery statistics report from the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSample {
    pub key: ChannelKey,
    /// Packet loss ratio in `[0, 1]`
    pub loss_ratio: f64,
    pub rtt_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkQuality {
    Unknown,
    Excellent,
    Good,
    Poor,
    Bad,
    VeryBad,
    Down,
}

impl NetworkQuality {
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Excellent => 1,
            Self::Good => 2,
            Self::Poor => 3,
            Self::Bad => 4,
            Self::VeryBad => 5,
            Self::Down => 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub key: ChannelKey,
    pub quality: NetworkQuality,
    pub rtt_ms: u32,
    pub loss_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitrateRequest {
    pub stream_type: StreamType,
    pub bitrate_bps: u32,
}

/// Result of one evaluation tick
#[derive(Debug, Default, Clone, PartialEq)]
pub struct QualityEvaluation {
    pub reports: Vec<QualityReport>,
    pub bitrate_requests: Vec<BitrateRequest>,
}

#[derive(Default)]
struct ChannelSamples {
    samples: VecDeque<(Instant, f64, u32)>,
}

impl ChannelSamples {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((t, _, _)) = self.samples.front() {
            if now.duration_since(*t) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn averages(&self) -> Option<(f64, u32)> {
        if self.samples.is_empty() {
            return None;
        }
        let n = self.samples.len();
        let loss = self.samples.iter().map(|(_, l, _)| l).sum::<f64>() / n as f64;
        let rtt = self.samples.iter().map(|(_, _, r)| u64::from(*r)).sum::<u64>() / n as u64;
        Some((loss, u32::try_from(rtt).unwrap_or(u32::MAX)))
    }
}

pub struct QualityMonitor {
    config: QualityConfig,
    channels: DashMap<ChannelKey, ChannelSamples>,
    /// Current bitrate target per local video send stream
    targets: DashMap<StreamType, u32>,
}

impl QualityMonitor {
    #[must_use]
    pub fn new(config: QualityConfig) -> Self {
        Self {
            config,
            channels: DashMap::new(),
            targets: DashMap::new(),
        }
    }

    pub fn record(&self, sample: NetworkSample, now: Instant) {
        let mut entry = self.channels.entry(sample.key).or_default();
        entry
            .samples
            .push_back((now, sample.loss_ratio.clamp(0.0, 1.0), sample.rtt_ms));
        entry.prune(now, Duration::from_millis(self.config.window_ms));
    }

    /// Start bitrate feedback for a local video send channel
    pub fn track_send_video(&self, stream_type: StreamType) {
        self.targets
            .entry(stream_type)
            .or_insert(self.config.initial_bitrate_bps);
    }

    pub fn untrack(&self, key: &ChannelKey) {
        self.channels.remove(key);
        if let ChannelKey::Send(stream_type) = key {
            self.targets.remove(stream_type);
        }
    }

    pub fn remove_user(&self, user_id: &UserId) {
        self.channels
            .retain(|key, _| key.remote_user().map_or(true, |u| u != user_id));
    }

    pub fn clear(&self) {
        self.channels.clear();
        self.targets.clear();
    }

    #[must_use]
    pub fn bitrate_target(&self, stream_type: StreamType) -> Option<u32> {
        self.targets.get(&stream_type).map(|t| *t)
    }

    pub fn evaluate(&self, now: Instant) -> QualityEvaluation {
        let window = Duration::from_millis(self.config.window_ms);
        let mut evaluation = QualityEvaluation::default();

        for mut entry in self.channels.iter_mut() {
            entry.prune(now, window);
            let Some((loss, rtt)) = entry.averages() else {
                continue;
            };
            evaluation.reports.push(QualityReport {
                key: entry.key().clone(),
                quality: classify(&self.config, rtt, loss),
                rtt_ms: rtt,
                loss_ratio: loss,
            });
        }
        evaluation.reports.sort_by(|a, b| a.key.to_string().cmp(&b.key.to_string()));

        for mut target in self.targets.iter_mut() {
            let stream_type = *target.key();
            let Some((loss, rtt)) = self
                .channels
                .get(&ChannelKey::Send(stream_type))
                .and_then(|c| c.averages())
            else {
                continue;
            };

            let current = *target;
            let next = aimd_step(&self.config, current, rtt, loss);
            if next != current {
                *target = next;
                info!(
                    stream_type = %stream_type,
                    from = current,
                    to = next,
                    rtt_ms = rtt,
                    loss,
                    "Requesting video bitrate change"
                );
                evaluation.bitrate_requests.push(BitrateRequest {
                    stream_type,
                    bitrate_bps: next,
                });
            }
        }
        evaluation.bitrate_requests.sort_by_key(|r| r.stream_type);

        debug!(
            reports = evaluation.reports.len(),
            requests = evaluation.bitrate_requests.len(),
            "Quality evaluated"
        );
        evaluation
    }
}

/// Classify averaged loss/RTT into a quality level
#[must_use]
pub fn classify(config: &QualityConfig, rtt_ms: u32, loss: f64) -> NetworkQuality {
    if loss >= 0.5 {
        return NetworkQuality::Down;
    }

    let mut score: i8 = 5;

    if rtt_ms >= config.rtt_bad_ms {
        score -= 2;
    } else if rtt_ms >= config.rtt_good_ms {
        score -= 1;
    }

    if loss >= config.loss_bad * 2.0 {
        score -= 3;
    } else if loss >= config.loss_bad {
        score -= 2;
    } else if loss >= config.loss_good {
        score -= 1;
    }

    match score.clamp(0, 5) {
        5 => NetworkQuality::Excellent,
        4 => NetworkQuality::Good,
        3 => NetworkQuality::Poor,
        2 => NetworkQuality::Bad,
        1 => NetworkQuality::VeryBad,
        _ => NetworkQuality::Down,
    }
}

fn aimd_step(config: &QualityConfig, current: u32, rtt_ms: u32, loss: f64) -> u32 {
    let next = if rtt_ms > config.rtt_bad_ms || loss > config.loss_bad {
        (f64::from(current) * config.decrease_factor).round() as u32
    } else if rtt_ms < config.rtt_good_ms && loss < config.loss_good {
        current.saturating_add(config.increase_step_bps)
    } else {
        current
    };
    next.clamp(config.min_bitrate_bps, config.max_bitrate_bps)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(key: ChannelKey, loss: f64, rtt: u32) -> NetworkSample {
        NetworkSample {
            key,
            loss_ratio: loss,
            rtt_ms: rtt,
        }
    }

    #[test]
    fn test_classify_levels() {
        let config = QualityConfig::default();
        assert_eq!(classify(&config, 40, 0.0), NetworkQuality::Excellent);
        assert_eq!(classify(&config, 200, 0.0), NetworkQuality::Good);
        assert_eq!(classify(&config, 200, 0.03), NetworkQuality::Poor);
        assert_eq!(classify(&config, 500, 0.12), NetworkQuality::VeryBad);
        assert_eq!(classify(&config, 500, 0.25), NetworkQuality::Down);
        assert_eq!(classify(&config, 10, 0.9), NetworkQuality::Down);
    }

    #[test]
    fn test_aimd_step() {
        let config = QualityConfig::default();
        assert_eq!(aimd_step(&config, 1_000_000, 50, 0.0), 1_100_000);
        assert_eq!(aimd_step(&config, 1_000_000, 500, 0.0), 700_000);
        assert_eq!(aimd_step(&config, 1_000_000, 200, 0.05), 1_000_000);
        assert_eq!(aimd_step(&config, config.max_bitrate_bps, 50, 0.0), config.max_bitrate_bps);
        assert_eq!(aimd_step(&config, config.min_bitrate_bps, 900, 0.4), config.min_bitrate_bps);
    }

    #[test]
    fn test_evaluate_reports_and_requests() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let now = Instant::now();
        monitor.track_send_video(StreamType::VideoHigh);
        monitor.record(sample(ChannelKey::send(StreamType::VideoHigh), 0.3, 600), now);
        monitor.record(sample(ChannelKey::receive("bob", StreamType::Audio), 0.0, 30), now);

        let eval = monitor.evaluate(now);
        assert_eq!(eval.reports.len(), 2);
        assert_eq!(
            eval.bitrate_requests,
            vec![BitrateRequest {
                stream_type: StreamType::VideoHigh,
                bitrate_bps: 840_000,
            }]
        );
        assert_eq!(monitor.bitrate_target(StreamType::VideoHigh), Some(840_000));
    }

    #[test]
    fn test_unchanged_target_requests_nothing() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let now = Instant::now();
        monitor.track_send_video(StreamType::VideoLow);
        monitor.record(sample(ChannelKey::send(StreamType::VideoLow), 0.05, 200), now);
        assert!(monitor.evaluate(now).bitrate_requests.is_empty());
    }

    #[test]
    fn test_old_samples_leave_the_window() {
        let config = QualityConfig {
            window_ms: 1_000,
            ..QualityConfig::default()
        };
        let monitor = QualityMonitor::new(config);
        let start = Instant::now();
        monitor.record(sample(ChannelKey::receive("bob", StreamType::Audio), 0.4, 900), start);

        let later = start + Duration::from_secs(5);
        assert!(monitor.evaluate(later).reports.is_empty());
    }

    #[test]
    fn test_remove_user_drops_their_channels() {
        let monitor = QualityMonitor::new(QualityConfig::default());
        let now = Instant::now();
        monitor.record(sample(ChannelKey::receive("bob", StreamType::Audio), 0.0, 30), now);
        monitor.record(sample(ChannelKey::receive("eve", StreamType::Audio), 0.0, 30), now);
        monitor.remove_user(&UserId::from("bob"));

        let eval = monitor.evaluate(now);
        assert_eq!(eval.reports.len(), 1);
        assert_eq!(eval.reports[0].key, ChannelKey::receive("eve", StreamType::Audio));
    }
}
