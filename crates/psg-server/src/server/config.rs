use anyhow::bail;
use clap::{ArgAction, Parser};
use core::time::Duration;
use psg_core::config::{ExcludeCacheSettings, OsgSettings, Settings};
use serde::Serialize;
use std::path::PathBuf;

/// Runtime configuration for the `psg-server` binary.
///
/// Every option is read from the command line or the environment (including a
/// `.env` file), with defaults suitable for a single-node deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "psg-server",
    version,
    about = "An HTTP gateway streaming sequence data from several backends"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:2180"))]
    pub server_addr: String,

    /// Number of worker tasks running processors.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 4)]
    pub num_workers: usize,

    /// Capacity of each worker's queue of pending processors.
    ///
    /// Environment variable: `WORK_QUEUE_SIZE`
    #[arg(long, env = "WORK_QUEUE_SIZE", default_value_t = 64)]
    pub work_queue_size: usize,

    /// Maximum number of reply chunks merged into one body frame.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 64)]
    pub stream_buffer_size: usize,

    /// Seconds to wait for in-flight replies on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Blobs up to this size (bytes) are sent along with slim and smart TSE
    /// replies.
    ///
    /// Environment variable: `SEND_BLOB_IF_SMALL`
    #[arg(long, env = "SEND_BLOB_IF_SMALL", default_value_t = 10_240)]
    pub send_blob_if_small: u64,

    /// Maximum number of blobs remembered per client.
    ///
    /// Environment variable: `EXCLUDE_CACHE_MAX_SIZE`
    #[arg(long, env = "EXCLUDE_CACHE_MAX_SIZE", default_value_t = 1000)]
    pub exclude_cache_max_size: usize,

    /// Percentage of a client's entries dropped once the limit is exceeded.
    ///
    /// Environment variable: `EXCLUDE_CACHE_PURGE_PERCENTAGE`
    #[arg(long, env = "EXCLUDE_CACHE_PURGE_PERCENTAGE", default_value_t = 20)]
    pub exclude_cache_purge_percentage: u8,

    /// Seconds after which an idle client is forgotten.
    ///
    /// Environment variable: `EXCLUDE_CACHE_INACTIVITY_PURGE_TIMEOUT`
    #[arg(long, env = "EXCLUDE_CACHE_INACTIVITY_PURGE_TIMEOUT", default_value_t = 60)]
    pub exclude_cache_inactivity_purge_timeout: u64,

    /// Seconds after which an already sent blob may be sent again.
    ///
    /// Environment variable: `RESEND_TIMEOUT`
    #[arg(long, env = "RESEND_TIMEOUT", default_value_t = 0.2)]
    pub resend_timeout: f64,

    /// Number of split-info blobs kept in memory.
    ///
    /// Environment variable: `SPLIT_INFO_CACHE_SIZE`
    #[arg(long, env = "SPLIT_INFO_CACHE_SIZE", default_value_t = 1000)]
    pub split_info_cache_size: usize,

    /// Retry budget of OSG calls. Stale pooled connections cost a fraction of
    /// a retry.
    ///
    /// Environment variable: `OSG_RETRY_COUNT`
    #[arg(long, env = "OSG_RETRY_COUNT", default_value_t = 2.0)]
    pub osg_retry_count: f64,

    /// Run OSG and WGS fetches on background threads.
    ///
    /// Environment variable: `OSG_ASYNC`
    #[arg(long, env = "OSG_ASYNC", default_value_t = true, action = ArgAction::Set)]
    pub osg_async: bool,

    /// Satellites served by OSG.
    ///
    /// Environment variable: `OSG_SATS`
    #[arg(long, env = "OSG_SATS", value_delimiter = ',')]
    pub osg_sats: Vec<i32>,

    /// Seq-id prefixes resolved by OSG.
    ///
    /// Environment variable: `OSG_NAMESPACES`
    #[arg(long, env = "OSG_NAMESPACES", value_delimiter = ',')]
    pub osg_namespaces: Vec<String>,

    /// Size of the OSG connection pool.
    ///
    /// Environment variable: `OSG_POOL_SIZE`
    #[arg(long, env = "OSG_POOL_SIZE", default_value_t = 4)]
    pub osg_pool_size: usize,

    /// Register the catch-all processor.
    ///
    /// Environment variable: `ENABLE_DUMMY`
    #[arg(long, env = "ENABLE_DUMMY", default_value_t = false, action = ArgAction::Set)]
    pub enable_dummy: bool,

    /// JSON file with the data served by the in-memory backends.
    ///
    /// Environment variable: `FIXTURE`
    #[arg(long, env = "FIXTURE")]
    pub fixture: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub work_queue_size: usize,
    pub stream_buffer_size: usize,
    pub shutdown_timeout: u64,
    pub send_blob_if_small: u64,
    pub exclude_cache_max_size: usize,
    pub exclude_cache_purge_percentage: u8,
    pub exclude_cache_inactivity_purge_timeout: u64,
    pub resend_timeout: f64,
    pub split_info_cache_size: usize,
    pub osg_retry_count: f64,
    pub osg_async: bool,
    pub osg_sats: Vec<i32>,
    pub osg_namespaces: Vec<String>,
    pub osg_pool_size: usize,
    pub enable_dummy: bool,
    pub fixture: Option<PathBuf>,
}

impl ServerConfig {
    /// The engine settings handed to the processor factories.
    pub fn settings(&self) -> Settings {
        Settings {
            send_blob_if_small: self.send_blob_if_small,
            exclude_cache: ExcludeCacheSettings {
                max_size: self.exclude_cache_max_size,
                purge_percentage: self.exclude_cache_purge_percentage,
                inactivity_timeout: Duration::from_secs(self.exclude_cache_inactivity_purge_timeout),
                resend_timeout: Duration::from_secs_f64(self.resend_timeout),
            },
            split_info_cache_size: self.split_info_cache_size,
            osg: OsgSettings {
                enabled: true,
                retry_count: self.osg_retry_count,
                async_processing: self.osg_async,
                sats: self.osg_sats.clone(),
                namespaces: self.osg_namespaces.clone(),
            },
            enable_dummy: self.enable_dummy,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.work_queue_size == 0 {
            bail!("WORK_QUEUE_SIZE must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.exclude_cache_purge_percentage > 100 {
            bail!(
                "EXCLUDE_CACHE_PURGE_PERCENTAGE ({}) must be between 0 and 100",
                args.exclude_cache_purge_percentage
            );
        }

        if !args.resend_timeout.is_finite() || args.resend_timeout < 0.0 {
            bail!("RESEND_TIMEOUT must be a non-negative number of seconds");
        }

        if !args.osg_retry_count.is_finite() || args.osg_retry_count < 1.0 {
            bail!(
                "OSG_RETRY_COUNT ({}) must allow at least one attempt",
                args.osg_retry_count
            );
        }

        if args.osg_pool_size == 0 {
            bail!("OSG_POOL_SIZE must be greater than 0");
        }

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            work_queue_size: args.work_queue_size,
            stream_buffer_size: args.stream_buffer_size,
            shutdown_timeout: args.shutdown_timeout,
            send_blob_if_small: args.send_blob_if_small,
            exclude_cache_max_size: args.exclude_cache_max_size,
            exclude_cache_purge_percentage: args.exclude_cache_purge_percentage,
            exclude_cache_inactivity_purge_timeout: args.exclude_cache_inactivity_purge_timeout,
            resend_timeout: args.resend_timeout,
            split_info_cache_size: args.split_info_cache_size,
            osg_retry_count: args.osg_retry_count,
            osg_async: args.osg_async,
            osg_sats: args.osg_sats,
            osg_namespaces: args.osg_namespaces,
            osg_pool_size: args.osg_pool_size,
            enable_dummy: args.enable_dummy,
            fixture: args.fixture,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = core::iter::once("psg-server").chain(args.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn settings_follow_the_command_line() {
        let config = parse(&[
            "--send-blob-if-small",
            "500",
            "--resend-timeout",
            "1.5",
            "--osg-async",
            "false",
            "--osg-sats",
            "25,26",
        ])
        .unwrap();
        let settings = config.settings();

        assert_eq!(settings.send_blob_if_small, 500);
        assert_eq!(settings.exclude_cache.resend_timeout, Duration::from_millis(1500));
        assert!(!settings.osg.async_processing);
        assert_eq!(settings.osg.sats, vec![25, 26]);
    }

    #[test]
    fn zero_workers_are_rejected() {
        let err = parse(&["--num-workers", "0"]).unwrap_err();
        assert!(err.to_string().contains("NUM_WORKERS"));
    }

    #[test]
    fn retry_budget_below_one_attempt_is_rejected() {
        assert!(parse(&["--osg-retry-count", "0.5"]).is_err());
    }
}
