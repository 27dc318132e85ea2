//! Runtime settings handed to processor factories.
//!
//! The server builds one [`Settings`] value from its command line and shares
//! it behind an `Arc`. `Default` matches the server's defaults.

use core::time::Duration;

/// Limits of the per-client already-sent blob tracking.
#[derive(Clone, Debug, PartialEq)]
pub struct ExcludeCacheSettings {
    /// Maximum number of blobs remembered per client.
    pub max_size: usize,
    /// Share of a client's oldest entries dropped when `max_size` is exceeded.
    pub purge_percentage: u8,
    /// Clients idle for longer than this are forgotten.
    pub inactivity_timeout: Duration,
    /// A blob sent longer ago than this may be sent again.
    pub resend_timeout: Duration,
}

impl Default for ExcludeCacheSettings {
    fn default() -> Self {
        Self {
            max_size: 1000,
            purge_percentage: 20,
            inactivity_timeout: Duration::from_secs(60),
            resend_timeout: Duration::from_millis(200),
        }
    }
}

/// Settings of the OSG processors.
#[derive(Clone, Debug, PartialEq)]
pub struct OsgSettings {
    pub enabled: bool,
    /// Fractional retry budget, see [`crate::processors::osg::OsgCaller`].
    pub retry_count: f64,
    /// Run the remote call on a background thread.
    pub async_processing: bool,
    /// Satellites served by OSG instead of Cassandra.
    pub sats: Vec<i32>,
    /// Seq-id namespaces (`gnl|SRA|...` style prefixes) resolved by OSG.
    pub namespaces: Vec<String>,
}

impl Default for OsgSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            retry_count: 2.0,
            async_processing: true,
            sats: Vec::new(),
            namespaces: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    /// Size threshold (bytes) below which slim and smart TSE requests also
    /// receive the blob data. A request may raise it.
    pub send_blob_if_small: u64,
    pub exclude_cache: ExcludeCacheSettings,
    /// Maximum number of split-info blobs kept in memory.
    pub split_info_cache_size: usize,
    pub osg: OsgSettings,
    pub enable_dummy: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            send_blob_if_small: 10 * 1024,
            exclude_cache: ExcludeCacheSettings::default(),
            split_info_cache_size: 1000,
            osg: OsgSettings::default(),
            enable_dummy: false,
        }
    }
}
