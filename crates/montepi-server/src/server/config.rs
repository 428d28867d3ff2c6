use anyhow::bail;
use clap::{Parser, ValueEnum};
use core::{fmt, time::Duration};
use montepi::EngineConfig;

/// Which halves of the service this process runs.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    /// HTTP API and queue workers in one process.
    All,
    /// HTTP API only; chunk jobs are left for worker processes.
    Api,
    /// Queue workers only.
    Worker,
}

impl ServerRole {
    pub const fn serves_http(self) -> bool {
        matches!(self, Self::All | Self::Api)
    }

    pub const fn runs_workers(self) -> bool {
        matches!(self, Self::All | Self::Worker)
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::All => "all",
            Self::Api => "api",
            Self::Worker => "worker",
        })
    }
}

/// Runtime configuration for the `montepi-server` binary.
///
/// All values are parsed from CLI arguments or environment variables (a
/// `.env` file is loaded first), with defaults suitable for a single-node
/// deployment.
///
/// Several processes can cooperate on the same calculations by pointing them
/// at one SQLite file and giving each a role.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "montepi-server",
    version,
    about = "An HTTP service estimating π by distributed Monte Carlo sampling"
)]
pub struct CliArgs {
    /// Address the HTTP API listens on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8000"))]
    pub server_addr: String,

    /// SQLite connection string, e.g. `sqlite://montepi.db`.
    ///
    /// Leave empty to keep everything in process memory. The in-memory backend
    /// cannot be shared, so it requires `ROLE=all`.
    ///
    /// Environment variable: `DATABASE_URL`
    #[arg(long, env = "DATABASE_URL", default_value_t = String::new())]
    pub database_url: String,

    /// Which parts of the service to run.
    ///
    /// Environment variable: `ROLE`
    #[arg(long, env = "ROLE", value_enum, default_value_t = ServerRole::All)]
    pub role: ServerRole,

    /// Number of queue workers, each executing one chunk at a time.
    ///
    /// Sampling is CPU-bound, so the default is one worker per core.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = num_cpus::get())]
    pub num_workers: usize,

    /// Execution budget of one chunk job before it is retried.
    ///
    /// Environment variable: `JOB_TIMEOUT_SECS`
    #[arg(long, env = "JOB_TIMEOUT_SECS", default_value_t = 600)]
    pub job_timeout_secs: u64,

    /// Deliveries of one chunk job before it is dead-lettered.
    ///
    /// Environment variable: `MAX_ATTEMPTS`
    #[arg(long, env = "MAX_ATTEMPTS", default_value_t = 3)]
    pub max_attempts: u32,

    /// Time-to-live of the aggregation lock.
    ///
    /// Environment variable: `LOCK_TTL_SECS`
    #[arg(long, env = "LOCK_TTL_SECS", default_value_t = 10)]
    pub lock_ttl_secs: u64,

    /// Interval between progress snapshots on a stream.
    ///
    /// Environment variable: `STREAM_INTERVAL_MS`
    #[arg(long, env = "STREAM_INTERVAL_MS", default_value_t = 1000)]
    pub stream_interval_ms: u64,

    /// Snapshots after which a progress stream is closed regardless of state.
    ///
    /// Environment variable: `STREAM_MAX_TICKS`
    #[arg(long, env = "STREAM_MAX_TICKS", default_value_t = 300)]
    pub stream_max_ticks: u32,

    /// Snapshots buffered per stream before the publisher waits for the
    /// client.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 4)]
    pub stream_buffer_size: usize,

    /// Entries returned by `GET /api/history`.
    ///
    /// Environment variable: `HISTORY_LIMIT`
    #[arg(long, env = "HISTORY_LIMIT", default_value_t = 30)]
    pub history_limit: u32,

    /// How long shutdown waits for open streams and for each worker.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 3)]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub database_url: Option<String>,
    pub role: ServerRole,
    pub num_workers: usize,
    pub engine: EngineConfig,
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        let database_url = Some(args.database_url.trim().to_string()).filter(|s| !s.is_empty());

        if database_url.is_none() && args.role != ServerRole::All {
            bail!(
                "ROLE={} requires DATABASE_URL; the in-memory backend is private to one process",
                args.role
            );
        }

        if args.role.runs_workers() && args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.max_attempts == 0 {
            bail!("MAX_ATTEMPTS must be greater than 0");
        }

        if args.job_timeout_secs == 0 {
            bail!("JOB_TIMEOUT_SECS must be greater than 0");
        }

        if args.lock_ttl_secs == 0 {
            bail!("LOCK_TTL_SECS must be greater than 0");
        }

        if args.stream_interval_ms == 0 {
            bail!("STREAM_INTERVAL_MS must be greater than 0");
        }

        if args.stream_max_ticks == 0 {
            bail!("STREAM_MAX_TICKS must be greater than 0");
        }

        if args.history_limit == 0 {
            bail!("HISTORY_LIMIT must be greater than 0");
        }

        let engine = EngineConfig {
            lock_ttl: Duration::from_secs(args.lock_ttl_secs),
            job_timeout: Duration::from_secs(args.job_timeout_secs),
            max_attempts: args.max_attempts,
            stream_interval: Duration::from_millis(args.stream_interval_ms),
            stream_max_ticks: args.stream_max_ticks,
            stream_buffer_size: args.stream_buffer_size.max(1),
            history_limit: args.history_limit,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            ..EngineConfig::default()
        };

        Ok(Self {
            server_addr: args.server_addr,
            database_url,
            role: args.role,
            num_workers: args.num_workers,
            engine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<ServerConfig> {
        let argv = core::iter::once("montepi-server").chain(extra.iter().copied());
        ServerConfig::try_from(CliArgs::try_parse_from(argv)?)
    }

    #[test]
    fn defaults_match_engine_defaults() {
        let config = parse(&["--database-url", "", "--role", "all", "--num-workers", "2"]).unwrap();
        let defaults = EngineConfig::default();
        assert_eq!(config.database_url, None);
        assert_eq!(config.engine.job_timeout, defaults.job_timeout);
        assert_eq!(config.engine.lock_ttl, defaults.lock_ttl);
        assert_eq!(config.engine.max_attempts, defaults.max_attempts);
        assert_eq!(config.engine.stream_interval, defaults.stream_interval);
        assert_eq!(config.engine.stream_max_ticks, defaults.stream_max_ticks);
        assert_eq!(config.engine.history_limit, defaults.history_limit);
    }

    #[test]
    fn split_roles_need_a_shared_database() {
        assert!(parse(&["--database-url", "", "--role", "worker"]).is_err());
        assert!(parse(&["--database-url", " ", "--role", "api"]).is_err());

        let config = parse(&["--role", "worker", "--database-url", "sqlite://pi.db"]).unwrap();
        assert_eq!(config.database_url.as_deref(), Some("sqlite://pi.db"));
        assert!(config.role.runs_workers());
        assert!(!config.role.serves_http());
    }

    #[test]
    fn rejects_zero_values() {
        for flag in ["--num-workers", "--max-attempts", "--stream-interval-ms"] {
            assert!(parse(&["--database-url", "", "--role", "all", flag, "0"]).is_err());
        }
    }

    #[test]
    fn api_role_may_run_without_workers() {
        let config = parse(&[
            "--role",
            "api",
            "--num-workers",
            "0",
            "--database-url",
            "sqlite::memory:",
        ])
        .unwrap();
        assert_eq!(config.role, ServerRole::Api);
    }
}
