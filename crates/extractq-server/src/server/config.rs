use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use std::path::PathBuf;

/// Runtime configuration for the `extractq-server` binary.
///
/// Every value can be given as a CLI flag or an environment variable; a
/// `.env` file in the working directory is loaded first. The defaults match
/// a single relay sitting next to the public Overpass API.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "extractq-server",
    version,
    about = "Queues Overpass extract requests, caches chunks and streams progress to clients"
)]
pub struct CliArgs {
    /// Address to accept client connections on.
    ///
    /// Environment variable: `LISTEN_ADDR`
    #[arg(long, env = "LISTEN_ADDR", default_value_t = String::from("localhost:6020"))]
    pub listen_addr: String,

    /// Directory holding one file per fetched chunk. Created if missing.
    ///
    /// Environment variable: `CACHE_DIR`
    #[arg(long, env = "CACHE_DIR", default_value = "overpass")]
    pub cache_dir: PathBuf,

    /// Base URL of the Overpass API. `status` and `interpreter` are resolved
    /// relative to it.
    ///
    /// Environment variable: `OVERPASS_URL`
    #[arg(long, env = "OVERPASS_URL", default_value_t = String::from("https://overpass-api.de/api"))]
    pub overpass_url: String,

    /// Seconds to wait for the upstream status endpoint before treating the
    /// upstream as unavailable.
    ///
    /// Environment variable: `STATUS_TIMEOUT_SECS`
    #[arg(long, env = "STATUS_TIMEOUT_SECS", default_value_t = 10)]
    pub status_timeout_secs: u64,

    /// Seconds to wait for a single extract query to complete.
    ///
    /// Environment variable: `FETCH_TIMEOUT_SECS`
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value_t = 600)]
    pub fetch_timeout_secs: u64,

    /// Upper bound on a single rate-limit backoff. Capacity is re-checked
    /// after every wait, so this only bounds how stale a wait can get.
    ///
    /// Environment variable: `MAX_WAIT_SECS`
    #[arg(long, env = "MAX_WAIT_SECS", default_value_t = 300)]
    pub max_wait_secs: u64,

    /// Largest inbound frame a client may send, in bytes.
    ///
    /// Environment variable: `MAX_FRAME_BYTES`
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = extractq_core::DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,

    /// Seconds to wait for a client's acknowledgment before dropping the
    /// connection. `0` waits forever. The job itself is never affected.
    ///
    /// Environment variable: `ACK_TIMEOUT_SECS`
    #[arg(long, env = "ACK_TIMEOUT_SECS", default_value_t = 0)]
    pub ack_timeout_secs: u64,

    /// Webhook that receives operator alerts as a JSON `{subject, body}`
    /// POST. Alerts are only logged when unset.
    ///
    /// Environment variable: `ALERT_WEBHOOK`
    #[arg(long, env = "ALERT_WEBHOOK")]
    pub alert_webhook: Option<String>,

    /// Free space, in bytes, below which the cache volume raises an alert.
    ///
    /// Environment variable: `MIN_FREE_BYTES`
    #[arg(long, env = "MIN_FREE_BYTES", default_value_t = 1024 * 1024 * 1024)]
    pub min_free_bytes: u64,

    /// Seconds to let in-flight sessions drain on shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 5)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub cache_dir: PathBuf,
    pub overpass_url: String,
    pub status_timeout: Duration,
    pub fetch_timeout: Duration,
    pub max_wait: Duration,
    pub max_frame_bytes: usize,
    pub ack_timeout: Option<Duration>,
    pub alert_webhook: Option<String>,
    pub min_free_bytes: u64,
    pub shutdown_timeout: Duration,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.listen_addr.trim().is_empty() {
            bail!("LISTEN_ADDR must not be empty");
        }
        if args.max_frame_bytes == 0 {
            bail!("MAX_FRAME_BYTES must be greater than 0");
        }
        if args.status_timeout_secs == 0 {
            bail!("STATUS_TIMEOUT_SECS must be greater than 0");
        }
        if args.fetch_timeout_secs == 0 {
            bail!("FETCH_TIMEOUT_SECS must be greater than 0");
        }
        if args.max_wait_secs == 0 {
            bail!("MAX_WAIT_SECS must be greater than 0");
        }

        Ok(Self {
            listen_addr: args.listen_addr,
            cache_dir: args.cache_dir,
            overpass_url: args.overpass_url.trim_end_matches('/').to_string(),
            status_timeout: Duration::from_secs(args.status_timeout_secs),
            fetch_timeout: Duration::from_secs(args.fetch_timeout_secs),
            max_wait: Duration::from_secs(args.max_wait_secs),
            max_frame_bytes: args.max_frame_bytes,
            ack_timeout: (args.ack_timeout_secs > 0)
                .then(|| Duration::from_secs(args.ack_timeout_secs)),
            alert_webhook: args.alert_webhook.filter(|url| !url.trim().is_empty()),
            min_free_bytes: args.min_free_bytes,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
        })
    }
}
