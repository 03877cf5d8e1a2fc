// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for a replica.
//!
//! Everything is serde-deserializable with per-field defaults so a minimal
//! config file only needs the node name, data directory, and (for a
//! subscribing replica) the upstream address. Durations are humantime strings
//! ("15s", "10m"); accessors parse them and fall back to the documented
//! default on a bad value rather than failing mid-run.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ReplicationError, Result};

fn parse_duration_or(raw: &str, field: &str, fallback: Duration) -> Duration {
    humantime::parse_duration(raw).unwrap_or_else(|_| {
        warn!(field, value = raw, fallback = ?fallback, "unparseable duration, using fallback");
        fallback
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// 4-character node name of this replica. Blocks sourced from this node
    /// are never re-materialized locally.
    pub local_node: String,
    /// Directory holding the per-(day, node) index files.
    pub data_dir: PathBuf,
    /// Days of data retained; blocks outside `today ± retention` are dropped.
    #[serde(default = "default_retention_days")]
    pub retention_days: i32,
    #[serde(default)]
    pub settings: ReplicationSettings,
    /// Present on subscribing replicas; absent on a pure producer.
    #[serde(default)]
    pub upstream: Option<UpstreamConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub accrete: AccreteConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_queue_capacity")]
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Listen address for subscriber sessions; `None` disables the endpoint.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: Option<String>,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: String,
    /// Upper bound on blocks served per repair request.
    #[serde(default = "default_max_repair_blocks")]
    pub max_repair_blocks: usize,
    /// Where a lapped session cursor jumps to, as percent of capacity
    /// behind head.
    #[serde(default = "default_lap_resync_pct")]
    pub lap_resync_pct: u32,
    /// Starting point for playback subscribers on an already-lapped queue.
    #[serde(default = "default_playback_resync_pct")]
    pub playback_resync_pct: u32,
}

impl EndpointConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        parse_duration_or(
            &self.heartbeat_interval,
            "endpoint.heartbeat_interval",
            Duration::from_secs(15),
        )
    }

    pub fn idle_timeout(&self) -> Duration {
        parse_duration_or(
            &self.idle_timeout,
            "endpoint.idle_timeout",
            Duration::from_secs(120),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Emit a loss alert once per this many lost blocks.
    #[serde(default = "default_loss_alert_every")]
    pub loss_alert_every: u64,
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval: String,
    /// A file untouched this long is closed by maintenance.
    #[serde(default = "default_stale_close")]
    pub stale_close: String,
    /// Bound on the upstream full-index fetch during bootstrap.
    #[serde(default = "default_bootstrap_timeout")]
    pub bootstrap_timeout: String,
    #[serde(default = "default_status_interval")]
    pub status_interval: String,
}

impl ConsumerConfig {
    pub fn maintenance_interval(&self) -> Duration {
        parse_duration_or(
            &self.maintenance_interval,
            "consumer.maintenance_interval",
            Duration::from_secs(600),
        )
    }

    pub fn stale_close(&self) -> Duration {
        parse_duration_or(&self.stale_close, "consumer.stale_close", Duration::from_secs(7200))
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        parse_duration_or(
            &self.bootstrap_timeout,
            "consumer.bootstrap_timeout",
            Duration::from_secs(30),
        )
    }

    pub fn status_interval(&self) -> Duration {
        parse_duration_or(&self.status_interval, "consumer.status_interval", Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Pass interval while gaps were found recently.
    #[serde(default = "default_active_interval")]
    pub active_interval: String,
    /// Pass interval once the file has been quiet.
    #[serde(default = "default_quiet_interval")]
    pub quiet_interval: String,
    /// Global ceiling on repair requests issued per second.
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// The actively-written last extent is only compared every Nth pass.
    #[serde(default = "default_check_last_extent_every")]
    pub check_last_extent_every: u32,
    /// Minimum spacing between corruption-triggered re-bootstraps of one file.
    #[serde(default = "default_rebootstrap_min_interval")]
    pub rebootstrap_min_interval: String,
}

impl ReconcileConfig {
    pub fn active_interval(&self) -> Duration {
        parse_duration_or(&self.active_interval, "reconcile.active_interval", Duration::from_secs(60))
    }

    pub fn quiet_interval(&self) -> Duration {
        parse_duration_or(&self.quiet_interval, "reconcile.quiet_interval", Duration::from_secs(900))
    }

    pub fn rebootstrap_min_interval(&self) -> Duration {
        parse_duration_or(
            &self.rebootstrap_min_interval,
            "reconcile.rebootstrap_min_interval",
            Duration::from_secs(300),
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccreteConfig {
    /// Partial buffers idle this long are abandoned and logged.
    #[serde(default = "default_abandon_after")]
    pub abandon_after: String,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval: String,
}

impl AccreteConfig {
    pub fn abandon_after(&self) -> Duration {
        parse_duration_or(&self.abandon_after, "accrete.abandon_after", Duration::from_secs(600))
    }

    pub fn sweep_interval(&self) -> Duration {
        parse_duration_or(&self.sweep_interval, "accrete.sweep_interval", Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// host:port of the upstream streaming endpoint.
    pub addr: String,
    /// At most 10 characters; identifies this subscriber in upstream logs.
    pub subscriber_tag: String,
    /// Ask for backlog replay on first connect.
    #[serde(default = "default_playback")]
    pub playback: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, "upstream.connect_timeout", Duration::from_secs(10))
    }
}

fn default_retention_days() -> i32 {
    30
}
fn default_queue_capacity() -> u32 {
    10_000
}
fn default_bind_addr() -> Option<String> {
    Some("0.0.0.0:7981".to_string())
}
fn default_max_sessions() -> usize {
    32
}
fn default_heartbeat_interval() -> String {
    "15s".to_string()
}
fn default_idle_timeout() -> String {
    "120s".to_string()
}
fn default_max_repair_blocks() -> usize {
    64
}
fn default_lap_resync_pct() -> u32 {
    95
}
fn default_playback_resync_pct() -> u32 {
    90
}
fn default_loss_alert_every() -> u64 {
    1000
}
fn default_maintenance_interval() -> String {
    "10m".to_string()
}
fn default_stale_close() -> String {
    "2h".to_string()
}
fn default_bootstrap_timeout() -> String {
    "30s".to_string()
}
fn default_status_interval() -> String {
    "1m".to_string()
}
fn default_active_interval() -> String {
    "60s".to_string()
}
fn default_quiet_interval() -> String {
    "900s".to_string()
}
fn default_requests_per_second() -> u32 {
    20
}
fn default_check_last_extent_every() -> u32 {
    10
}
fn default_rebootstrap_min_interval() -> String {
    "5m".to_string()
}
fn default_abandon_after() -> String {
    "10m".to_string()
}
fn default_sweep_interval() -> String {
    "1m".to_string()
}
fn default_playback() -> bool {
    true
}
fn default_connect_timeout() -> String {
    "10s".to_string()
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            capacity: default_queue_capacity(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig {
            bind_addr: default_bind_addr(),
            max_sessions: default_max_sessions(),
            heartbeat_interval: default_heartbeat_interval(),
            idle_timeout: default_idle_timeout(),
            max_repair_blocks: default_max_repair_blocks(),
            lap_resync_pct: default_lap_resync_pct(),
            playback_resync_pct: default_playback_resync_pct(),
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        ConsumerConfig {
            loss_alert_every: default_loss_alert_every(),
            maintenance_interval: default_maintenance_interval(),
            stale_close: default_stale_close(),
            bootstrap_timeout: default_bootstrap_timeout(),
            status_interval: default_status_interval(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            active_interval: default_active_interval(),
            quiet_interval: default_quiet_interval(),
            requests_per_second: default_requests_per_second(),
            check_last_extent_every: default_check_last_extent_every(),
            rebootstrap_min_interval: default_rebootstrap_min_interval(),
        }
    }
}

impl Default for AccreteConfig {
    fn default() -> Self {
        AccreteConfig {
            abandon_after: default_abandon_after(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.local_node.len() != 4 {
            return Err(ReplicationError::Config(format!(
                "local_node must be exactly 4 characters, got {:?}",
                self.local_node
            )));
        }
        if self.retention_days <= 0 {
            return Err(ReplicationError::Config(
                "retention_days must be positive".to_string(),
            ));
        }
        if self.settings.queue.capacity == 0 {
            return Err(ReplicationError::Config(
                "queue.capacity must be positive".to_string(),
            ));
        }
        let ep = &self.settings.endpoint;
        if ep.lap_resync_pct > 100 || ep.playback_resync_pct > 100 {
            return Err(ReplicationError::Config(
                "resync percentages must be within 0..=100".to_string(),
            ));
        }
        if ep.max_repair_blocks == 0 || ep.max_repair_blocks > 64 {
            return Err(ReplicationError::Config(
                "endpoint.max_repair_blocks must be within 1..=64".to_string(),
            ));
        }
        if self.settings.reconcile.requests_per_second == 0 {
            return Err(ReplicationError::Config(
                "reconcile.requests_per_second must be positive".to_string(),
            ));
        }
        if let Some(up) = &self.upstream {
            if up.subscriber_tag.len() > 10 {
                return Err(ReplicationError::Config(format!(
                    "subscriber_tag {:?} exceeds 10 characters",
                    up.subscriber_tag
                )));
            }
            if up.addr.is_empty() {
                return Err(ReplicationError::Config("upstream.addr is empty".to_string()));
            }
        }
        Ok(())
    }

    /// The local node name as wire bytes, space-padded.
    pub fn node_bytes(&self) -> [u8; 4] {
        let mut node = *b"    ";
        for (dst, src) in node.iter_mut().zip(self.local_node.bytes()) {
            *dst = src;
        }
        node
    }

    /// Small intervals and a tiny queue, for unit and integration tests.
    pub fn for_testing(data_dir: PathBuf) -> ReplicationConfig {
        ReplicationConfig {
            local_node: "TST1".to_string(),
            data_dir,
            retention_days: 10,
            settings: ReplicationSettings {
                queue: QueueConfig { capacity: 64 },
                endpoint: EndpointConfig {
                    bind_addr: Some("127.0.0.1:0".to_string()),
                    heartbeat_interval: "200ms".to_string(),
                    idle_timeout: "2s".to_string(),
                    ..EndpointConfig::default()
                },
                consumer: ConsumerConfig {
                    maintenance_interval: "500ms".to_string(),
                    stale_close: "1s".to_string(),
                    bootstrap_timeout: "2s".to_string(),
                    status_interval: "1s".to_string(),
                    ..ConsumerConfig::default()
                },
                reconcile: ReconcileConfig {
                    active_interval: "100ms".to_string(),
                    quiet_interval: "500ms".to_string(),
                    rebootstrap_min_interval: "1s".to_string(),
                    ..ReconcileConfig::default()
                },
                accrete: AccreteConfig {
                    abandon_after: "500ms".to_string(),
                    sweep_interval: "100ms".to_string(),
                },
            },
            upstream: None,
        }
    }
}
