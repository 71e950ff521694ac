//! Configuration files.
use serde::{Deserialize, Serialize};
use std::{fmt, path::Path, str::FromStr, time::Duration};

/// Configuration for the fbc sync engine.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct Config {
    /// Bulk synchronization.
    pub sync: SyncConfig,
    /// Peer bookkeeping.
    pub peers: PeersConfig,
    /// Block propagation.
    pub fetcher: FetcherConfig,
}

impl Config {
    /// Loads the configuration from the given TOML file, creating it with defaults if missing.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, confy::ConfyError> {
        confy::load_path(path)
    }

    /// Stores the configuration to the given TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), confy::ConfyError> {
        confy::store_path(path, self)
    }
}

/// The synchronisation strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Download and execute every block from the common ancestor on.
    Full,
    /// Download headers, bodies and receipts, then the state at a pivot block, and only execute
    /// the blocks after the pivot.
    #[default]
    Fast,
}

impl SyncMode {
    /// Returns the mode as a string.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Fast => "fast",
        }
    }

    /// Returns true for [`SyncMode::Fast`].
    pub const fn is_fast(&self) -> bool {
        matches!(self, Self::Fast)
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing a [`SyncMode`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseSyncModeError {
    /// Light clients are served by a different protocol.
    #[error("light sync is not supported by the bulk synchronizer")]
    LightUnsupported,
    /// Unknown mode.
    #[error("unknown sync mode: {0}")]
    Unknown(String),
}

impl FromStr for SyncMode {
    type Err = ParseSyncModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "fast" => Ok(Self::Fast),
            "light" => Err(ParseSyncModeError::LightUnsupported),
            other => Err(ParseSyncModeError::Unknown(other.to_string())),
        }
    }
}

/// Bulk synchronization configuration.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// The preferred sync mode.
    pub mode: SyncMode,
    /// Fast sync is only used when the target is more than this many blocks ahead of the local
    /// head.
    pub fast_sync_threshold: u64,
    /// Number of blocks below the target the fast sync pivot is placed at.
    pub pivot_margin: u64,
    /// Amount of headers to be fetched per request.
    pub max_header_fetch: u64,
    /// Number of header fetches to need for a skeleton assembly.
    pub max_skeleton_size: u64,
    /// Amount of block bodies to be fetched per request.
    pub max_body_fetch: usize,
    /// Amount of transaction receipts to allow fetching per request.
    pub max_receipt_fetch: usize,
    /// Amount of node state values to allow fetching per request.
    pub max_state_fetch: usize,
    /// Number of times a work item may expire or fail before the session is aborted.
    pub max_retries: u32,
    /// Maximum number of downloaded but not yet committed blocks.
    pub max_buffered_blocks: usize,
    /// Maximum chain reorganisation depth the ancestor search accepts.
    pub max_fork_ancestry: u64,
    /// Fast sync verifies the seal of every n-th header.
    pub seal_check_frequency: u64,
    /// How often in flight requests are checked for expiry.
    #[serde(with = "humantime_serde")]
    pub expire_interval: Duration,
    /// How often a sync with the best peer is forced.
    #[serde(with = "humantime_serde")]
    pub force_sync_interval: Duration,
    /// Number of connected peers required before a forced sync starts.
    pub min_desired_peers: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Fast,
            fast_sync_threshold: 1024,
            pivot_margin: 64,
            max_header_fetch: 192,
            max_skeleton_size: 128,
            max_body_fetch: 128,
            max_receipt_fetch: 256,
            max_state_fetch: 384,
            max_retries: 5,
            max_buffered_blocks: 8192,
            max_fork_ancestry: 90_000,
            seal_check_frequency: 100,
            expire_interval: Duration::from_millis(500),
            force_sync_interval: Duration::from_secs(10),
            min_desired_peers: 5,
        }
    }
}

/// Peer bookkeeping configuration.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct PeersConfig {
    /// Maximum number of registered peers.
    pub max_peers: usize,
    /// Maximum number of concurrent requests per peer, across all kinds.
    pub max_concurrent_requests_per_peer: usize,
    /// Round trip time assumed for a peer that has not answered anything yet.
    #[serde(with = "humantime_serde")]
    pub initial_rtt: Duration,
    /// Lower bound of the adaptive request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout_min: Duration,
    /// Upper bound of the adaptive request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout_max: Duration,
    /// Time a request should take; used to size requests by measured throughput.
    #[serde(with = "humantime_serde")]
    pub target_request_time: Duration,
    /// Number of timeouts after which a peer is dropped.
    pub timeout_strikes: u32,
}

impl Default for PeersConfig {
    fn default() -> Self {
        Self {
            max_peers: 25,
            max_concurrent_requests_per_peer: 4,
            initial_rtt: Duration::from_secs(5),
            request_timeout_min: Duration::from_secs(2),
            request_timeout_max: Duration::from_secs(60),
            target_request_time: Duration::from_secs(1),
            timeout_strikes: 3,
        }
    }
}

/// Block propagation configuration.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Time allowance before an announced block is explicitly requested.
    #[serde(with = "humantime_serde")]
    pub arrive_timeout: Duration,
    /// Interval used to collate almost-expired announces with fetches.
    #[serde(with = "humantime_serde")]
    pub gather_slack: Duration,
    /// Maximum allotted time to return an explicitly requested block.
    #[serde(with = "humantime_serde")]
    pub fetch_timeout: Duration,
    /// Maximum allowed backward distance from the chain head.
    pub max_uncle_dist: u64,
    /// Maximum allowed distance from the chain head to queue.
    pub max_queue_dist: u64,
    /// Maximum number of unique blocks a peer may have announced.
    pub hash_limit: usize,
    /// Maximum number of unique blocks a peer may have delivered.
    pub block_limit: usize,
    /// Length of the sliding window for the announcement rate limit.
    #[serde(with = "humantime_serde")]
    pub announce_window: Duration,
    /// Announcements a peer may make per window before being flagged.
    pub max_announcements: usize,
    /// Maximum number of unknown ancestors fetched to link a propagated block.
    pub max_lookup_depth: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            arrive_timeout: Duration::from_millis(500),
            gather_slack: Duration::from_millis(100),
            fetch_timeout: Duration::from_secs(5),
            max_uncle_dist: 7,
            max_queue_dist: 32,
            hash_limit: 256,
            block_limit: 64,
            announce_window: Duration::from_secs(10),
            max_announcements: 256,
            max_lookup_depth: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXTENSION: &str = "toml";

    fn with_tempdir(filename: &str, proc: fn(&std::path::Path)) {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(filename).with_extension(EXTENSION);

        proc(&config_path);

        temp_dir.close().unwrap()
    }

    #[test]
    fn test_store_and_load_config() {
        with_tempdir("config-store-test", |config_path| {
            let mut config = Config::default();
            config.sync.mode = SyncMode::Full;
            config.peers.request_timeout_max = Duration::from_secs(30);
            config.save(config_path).unwrap();

            let loaded = Config::load(config_path).unwrap();
            assert_eq!(config, loaded);
        })
    }

    #[test]
    fn test_load_creates_default() {
        with_tempdir("config-default-test", |config_path| {
            let loaded = Config::load(config_path).unwrap();
            assert_eq!(loaded, Config::default());
            assert!(config_path.exists());
        })
    }

    #[test]
    fn parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            mode = "full"
            expire_interval = "250ms"

            [fetcher]
            max_queue_dist = 16
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.mode, SyncMode::Full);
        assert_eq!(config.sync.expire_interval, Duration::from_millis(250));
        assert_eq!(config.sync.max_header_fetch, 192);
        assert_eq!(config.fetcher.max_queue_dist, 16);
        assert_eq!(config.fetcher.arrive_timeout, Duration::from_millis(500));
    }

    #[test]
    fn sync_mode_from_str() {
        assert_eq!("fast".parse::<SyncMode>(), Ok(SyncMode::Fast));
        assert_eq!("Full".parse::<SyncMode>(), Ok(SyncMode::Full));
        assert_eq!("light".parse::<SyncMode>(), Err(ParseSyncModeError::LightUnsupported));
        assert!("snap".parse::<SyncMode>().is_err());
        assert_eq!(SyncMode::Fast.to_string(), "fast");
    }
}
