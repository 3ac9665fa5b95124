// Copyright 2020 Joyent, Inc.

//! Transport and dialer contracts consumed by the cluster.
//!
//! The cluster never speaks a wire protocol itself. A *transport* is any
//! multiplexing channel that can run unary calls and open streams; a *dialer*
//! is the function that establishes one. Both are supplied by the caller,
//! which is where protocol, TLS, and credential concerns live.

use std::collections::HashMap;
use std::io;

use thiserror::Error;

use crate::context::Context;

/// Leading/trailing metadata attached to a transport response.
pub type Metadata = HashMap<String, Vec<String>>;

/// A unary response: opaque payload plus whatever metadata the server
/// attached. Metadata is handed to the context's metadata callback chain by
/// the connection that ran the call.
#[derive(Clone, Debug, Default)]
pub struct Response {
    pub payload: Vec<u8>,
    pub metadata: Metadata,
}

/// A live channel to one endpoint.
///
/// Implementations are expected to multiplex: several callers may hold the
/// same transport and issue calls concurrently. `close` must tolerate being
/// called while calls are in flight; those calls fail on the caller's side.
/// The per-call auth token, when the cluster has a credential source, rides
/// the context (`Context::auth_token`); implementations attach it to the
/// wire however their protocol expects.
pub trait Transport: Send + Sync + 'static {
    type Stream: Send;

    /// Run a unary call.
    fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        payload: &[u8],
    ) -> Result<Response, TransportError>;

    /// Open a streaming call.
    fn new_stream(
        &self,
        ctx: &Context,
        method: &str,
    ) -> Result<Self::Stream, TransportError>;

    /// Tear the channel down.
    fn close(&self);
}

/// Why a dial attempt failed. The distinction matters to the tracker:
/// a refused endpoint is retried on the plain backoff schedule, a timed-out
/// one waits longer.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("connection refused: {0}")]
    Refused(String),
    #[error("dial timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl DialError {
    pub fn is_timeout(&self) -> bool {
        match self {
            DialError::Timeout(_) => true,
            DialError::Refused(_) => false,
            DialError::Io(err) => err.kind() == io::ErrorKind::TimedOut,
        }
    }
}

/// An RPC failure reported by a transport.
#[derive(Clone, Debug, Error)]
pub enum TransportError {
    /// The endpoint is up but cannot serve right now.
    #[error("endpoint unavailable: {0}")]
    Unavailable(String),
    /// The channel itself broke.
    #[error("network failure: {0}")]
    Network(String),
    /// The request was malformed; the connection is healthy.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The server answered with an application-level error.
    #[error("remote error: {0}")]
    Remote(String),
}

impl TransportError {
    /// Whether this failure indicts the connection rather than the request.
    /// Indicting failures cause the owning cluster to pessimize the
    /// connection; the rest leave it in rotation.
    pub fn pessimizes(&self) -> bool {
        match self {
            TransportError::Unavailable(_) | TransportError::Network(_) => true,
            TransportError::InvalidArgument(_) | TransportError::Remote(_) => false,
        }
    }
}
