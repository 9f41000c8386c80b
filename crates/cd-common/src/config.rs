use std::time::Duration;

use clap::Parser;

/// Recognized configuration options (spec §6), read from the environment
/// the way `gateway::args::Args` / `deployer::args::Args` do.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Durable store connection string.
    #[clap(long, env = "POSTGRES_URL")]
    pub postgres_url: String,

    /// QRL counters backend.
    #[clap(long, env = "CACHE_URL")]
    pub cache_url: String,

    /// Message bus endpoint.
    #[clap(long, env = "BUS_URL")]
    pub bus_url: String,

    #[clap(long, env = "STORE_ENDPOINT")]
    pub store_endpoint: String,
    #[clap(long, env = "STORE_ACCESS")]
    pub store_access: String,
    #[clap(long, env = "STORE_SECRET")]
    pub store_secret: String,
    #[clap(long, env = "STORE_BUCKET")]
    pub store_bucket: String,
    #[clap(long, env = "STORE_TLS", default_value_t = true)]
    pub store_tls: bool,

    #[clap(long, env = "MAX_DEPLOYMENT_RETRIES", default_value_t = 5)]
    pub max_deployment_retries: u32,

    /// Root directory each build clones into and runs `docker build` from.
    #[clap(long, env = "SCRATCH_ROOT", default_value = "/var/lib/cd-server/scratch")]
    pub scratch_root: std::path::PathBuf,

    /// Prefix prepended to every image tag the build worker pushes.
    #[clap(long, env = "REGISTRY_PREFIX", default_value = "registry.internal")]
    pub registry_prefix: String,

    #[clap(long, env = "MAX_ARTIFACT_BYTES", default_value_t = 2 * 1024 * 1024 * 1024)]
    pub max_artifact_bytes: u64,

    #[clap(long, env = "CLONE_RETRY_ATTEMPTS", default_value_t = 3)]
    pub clone_retry_attempts: u32,

    /// Root directory the routing publisher writes proxy config into.
    #[clap(long, env = "ROUTING_ROOT", default_value = "/var/lib/cd-server/routing")]
    pub routing_root: std::path::PathBuf,

    #[clap(long, env = "BUILD_TIMEOUT", value_parser = parse_seconds, default_value = "1800")]
    pub build_timeout: Duration,

    #[clap(long, env = "DEPLOY_TIMEOUT", value_parser = parse_seconds, default_value = "1800")]
    pub deploy_timeout: Duration,

    #[clap(long, env = "HEALTH_INTERVAL", value_parser = parse_seconds, default_value = "5")]
    pub health_interval: Duration,

    #[clap(long, env = "HEALTH_THRESHOLD", default_value_t = 3)]
    pub health_threshold: u32,

    #[clap(long, env = "CANARY_PCT", default_value_t = 10)]
    pub canary_pct: u8,

    #[clap(long, env = "CANARY_WINDOW", value_parser = parse_seconds, default_value = "300")]
    pub canary_window: Duration,

    #[clap(long, env = "EVENT_KEEP_HOURS", default_value_t = 72)]
    pub event_keep_hours: u32,

    #[clap(long, env = "ARCHIVE_TO_STORE_AFTER_HOURS", default_value_t = 24)]
    pub archive_to_store_after_hours: u32,

    #[clap(long, env = "ARCHIVE_DELETE_AFTER_DAYS", default_value_t = 30)]
    pub archive_delete_after_days: u32,

    /// Address the HTTP read-model surface (spec §6) binds to.
    #[clap(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: std::net::SocketAddr,
}

fn parse_seconds(s: &str) -> Result<Duration, std::num::ParseIntError> {
    Ok(Duration::from_secs(s.parse()?))
}

impl Args {
    /// Exit code 1 is "fatal configuration or connection error at startup"
    /// (spec §6). Called once, right after `Args::parse()`.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.postgres_url.is_empty() || self.bus_url.is_empty() || self.cache_url.is_empty() {
            return Err(crate::error::Error::custom(
                crate::error::ErrorKind::ConfigurationInvalid,
                "postgres, bus, and cache URLs are all required",
            ));
        }
        if self.canary_pct == 0 || self.canary_pct > 100 {
            return Err(crate::error::Error::custom(
                crate::error::ErrorKind::ConfigurationInvalid,
                "CANARY_PCT must be in 1..=100",
            ));
        }
        Ok(())
    }
}
