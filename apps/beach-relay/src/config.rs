use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;

/// Validated runtime settings for the relay server.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    pub shared_secret: String,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub cleanup_interval: Duration,
    pub request_timeout: Duration,
    pub pending_sweep_interval: Duration,
    /// Entries older than this are force-expired by the pending sweep.
    pub pending_max_age: Duration,
    pub fail_pending_on_disconnect: bool,
    pub shutdown_grace: Duration,
}

impl RelayConfig {
    /// Defaults suitable for tests and local runs.
    pub fn local(shared_secret: impl Into<String>) -> Self {
        let request_timeout = Duration::from_secs(10);
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            shared_secret: shared_secret.into(),
            keepalive_interval: Duration::from_secs(20),
            keepalive_timeout: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(60),
            request_timeout,
            pending_sweep_interval: Duration::from_secs(30),
            pending_max_age: request_timeout * 3,
            fail_pending_on_disconnect: true,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Address to bind the HTTP and websocket listener to.
    #[arg(long, env = "BEACH_RELAY_LISTEN_ADDR", default_value = "127.0.0.1:3010")]
    pub listen_addr: String,

    /// Secret peers present as `token` and callers present as `x-api-key`.
    #[arg(long, env = "BEACH_RELAY_SHARED_SECRET", hide_env_values = true)]
    pub shared_secret: Option<String>,

    #[arg(long, env = "BEACH_RELAY_KEEPALIVE_INTERVAL_SECS", default_value_t = 20)]
    pub keepalive_interval_secs: u64,

    /// Close a peer connection after this long without a pong.
    #[arg(long, env = "BEACH_RELAY_KEEPALIVE_TIMEOUT_SECS", default_value_t = 60)]
    pub keepalive_timeout_secs: u64,

    #[arg(long, env = "BEACH_RELAY_CLEANUP_INTERVAL_SECS", default_value_t = 60)]
    pub cleanup_interval_secs: u64,

    /// Default time a request waits for its result.
    #[arg(long, env = "BEACH_RELAY_REQUEST_TIMEOUT_SECS", default_value_t = 10)]
    pub request_timeout_secs: u64,

    #[arg(long, env = "BEACH_RELAY_PENDING_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub pending_sweep_interval_secs: u64,

    /// Fail a client's outstanding requests as soon as it disconnects
    /// instead of letting them time out.
    #[arg(
        long,
        env = "BEACH_RELAY_FAIL_PENDING_ON_DISCONNECT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub fail_pending_on_disconnect: bool,

    #[arg(long, env = "BEACH_RELAY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

impl TryFrom<ServeArgs> for RelayConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        let shared_secret = match args.shared_secret {
            Some(secret) if !secret.trim().is_empty() => secret,
            _ => bail!("a shared secret is required (BEACH_RELAY_SHARED_SECRET)"),
        };
        for (name, value) in [
            ("keepalive interval", args.keepalive_interval_secs),
            ("keepalive timeout", args.keepalive_timeout_secs),
            ("cleanup interval", args.cleanup_interval_secs),
            ("request timeout", args.request_timeout_secs),
            ("pending sweep interval", args.pending_sweep_interval_secs),
        ] {
            if value == 0 {
                bail!("{name} must be at least one second");
            }
        }
        if args.keepalive_timeout_secs <= args.keepalive_interval_secs {
            bail!(
                "keepalive timeout ({}s) must exceed the keepalive interval ({}s)",
                args.keepalive_timeout_secs,
                args.keepalive_interval_secs
            );
        }

        let request_timeout = Duration::from_secs(args.request_timeout_secs);
        Ok(RelayConfig {
            listen_addr,
            shared_secret,
            keepalive_interval: Duration::from_secs(args.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(args.keepalive_timeout_secs),
            cleanup_interval: Duration::from_secs(args.cleanup_interval_secs),
            request_timeout,
            pending_sweep_interval: Duration::from_secs(args.pending_sweep_interval_secs),
            pending_max_age: request_timeout * 3,
            fail_pending_on_disconnect: args.fail_pending_on_disconnect,
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
