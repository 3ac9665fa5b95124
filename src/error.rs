// Copyright 2020 Joyent, Inc.

use thiserror::Error;

use crate::transport::TransportError;

/// Errors surfaced by the cluster to its callers.
///
/// Dial failures never appear here: they are consumed by the tracker, which
/// keeps retrying the endpoint in the background. See
/// [`DialError`](crate::transport::DialError).
#[derive(Debug, Error)]
pub enum Error {
    /// The cluster has been closed. Terminal; every operation fails with
    /// this once `close` has run.
    #[error("cluster is closed")]
    ClusterClosed,
    /// `get` carried a deadline and it expired before any connection came
    /// online. Without a deadline `get` blocks instead.
    #[error("no endpoints online before the deadline")]
    ClusterEmpty,
    /// The context was canceled. Propagated verbatim to the caller.
    #[error("operation canceled")]
    Canceled,
    /// The context deadline expired outside of `get`.
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    /// An RPC on an established connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The discovery RPC failed.
    #[error("discovery failed: {0}")]
    Discovery(String),
    /// The credential source could not produce a token.
    #[error("credentials: {0}")]
    Credentials(String),
}
