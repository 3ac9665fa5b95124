// Copyright 2020 Joyent, Inc.

//! Cluster configuration: an explicit record of every recognized knob plus a
//! builder. There is no process-wide state; everything the cluster and its
//! background tasks consult is injected here at construction time.

use std::sync::Arc;
use std::time::Duration;

use slog::Logger;

use crate::balancer::{Balancer, RandomChoice, RoundRobin};
use crate::context::Context;
use crate::credentials::Credentials;
use crate::error::Error;
use crate::trace::Trace;

pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TRACKER_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_TRACKER_BACKOFF_MAX: Duration = Duration::from_secs(60);
pub const DEFAULT_PREFER_LOCAL_FACTOR: f64 = 0.95;

/// Which selection policy the cluster installs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BalancerKind {
    RoundRobin,
    RandomChoice,
}

impl BalancerKind {
    pub(crate) fn new_balancer(self, prefer_local_factor: f64) -> Box<dyn Balancer> {
        match self {
            BalancerKind::RoundRobin => Box::new(RoundRobin::new()),
            BalancerKind::RandomChoice => {
                Box::new(RandomChoice::new(prefer_local_factor))
            }
        }
    }
}

/// Opaque TLS material. The cluster core never parses it; it is handed to
/// the dialer on every dial, and the dialer owns the actual TLS handshake.
#[derive(Clone, Debug, Default)]
pub struct TlsConfig {
    /// PEM- or DER-encoded root certificates.
    pub root_certificates: Vec<Vec<u8>>,
    /// Override for the name verified against the server certificate.
    pub server_name: Option<String>,
}

/// Every recognized knob, with the documented defaults. Construct with
/// `ClusterConfig::default()` or through [`ClusterConfig::builder`].
#[derive(Clone)]
pub struct ClusterConfig {
    /// Per-dial deadline applied by the tracker.
    pub dial_timeout: Duration,
    /// Cadence of the discovery driver.
    pub discovery_interval: Duration,
    /// Base period of the tracker; also the initial per-connection redial
    /// backoff.
    pub tracker_interval: Duration,
    /// Ceiling for the per-connection redial backoff.
    pub tracker_backoff_max: Duration,
    pub balancer: BalancerKind,
    /// Probability that the weighted balancer samples the local partition.
    pub prefer_local_factor: f64,
    pub tls: Option<TlsConfig>,
    /// Credential source. A fresh token is fetched for every RPC and rides
    /// the per-call context to the transport; tokens are never cached.
    pub credentials: Option<Arc<dyn Credentials>>,
    pub trace: Trace,
    /// Falls back to the `slog-stdlog` drain when absent.
    pub log: Option<Logger>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            tracker_interval: DEFAULT_TRACKER_INTERVAL,
            tracker_backoff_max: DEFAULT_TRACKER_BACKOFF_MAX,
            balancer: BalancerKind::RandomChoice,
            prefer_local_factor: DEFAULT_PREFER_LOCAL_FACTOR,
            tls: None,
            credentials: None,
            trace: Trace::default(),
            log: None,
        }
    }
}

impl ClusterConfig {
    pub fn builder() -> ClusterConfigBuilder {
        ClusterConfigBuilder {
            config: ClusterConfig::default(),
        }
    }

    // Derive the per-call context: fetch one token from the credential
    // source and attach it. No source configured means no token.
    pub(crate) fn authorize(&self, ctx: &Context) -> Result<Context, Error> {
        match &self.credentials {
            Some(credentials) => Ok(ctx.with_auth_token(credentials.token(ctx)?)),
            None => Ok(ctx.clone()),
        }
    }
}

/// Builder whose setters return the builder, so configuration reads as a
/// chain.
pub struct ClusterConfigBuilder {
    config: ClusterConfig,
}

impl ClusterConfigBuilder {
    pub fn dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.config.dial_timeout = dial_timeout;
        self
    }

    pub fn discovery_interval(mut self, discovery_interval: Duration) -> Self {
        self.config.discovery_interval = discovery_interval;
        self
    }

    pub fn tracker_interval(mut self, tracker_interval: Duration) -> Self {
        self.config.tracker_interval = tracker_interval;
        self
    }

    pub fn tracker_backoff_max(mut self, tracker_backoff_max: Duration) -> Self {
        self.config.tracker_backoff_max = tracker_backoff_max;
        self
    }

    pub fn balancer(mut self, balancer: BalancerKind) -> Self {
        self.config.balancer = balancer;
        self
    }

    pub fn prefer_local_factor(mut self, prefer_local_factor: f64) -> Self {
        self.config.prefer_local_factor = prefer_local_factor;
        self
    }

    pub fn tls(mut self, tls: TlsConfig) -> Self {
        self.config.tls = Some(tls);
        self
    }

    pub fn credentials(mut self, credentials: Arc<dyn Credentials>) -> Self {
        self.config.credentials = Some(credentials);
        self
    }

    pub fn trace(mut self, trace: Trace) -> Self {
        self.config.trace = trace;
        self
    }

    pub fn log(mut self, log: Logger) -> Self {
        self.config.log = Some(log);
        self
    }

    pub fn build(self) -> ClusterConfig {
        self.config
    }
}
