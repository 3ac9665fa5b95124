// Copyright 2020 Joyent, Inc.

//! A single cluster member: one transport channel plus runtime state.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, TimeZone, Utc};

use crate::cluster::Shared;
use crate::context::Context;
use crate::endpoint::Addr;
use crate::error::Error;
use crate::transport::{Transport, TransportError};

/// Connection lifecycle states.
///
/// Offline: never dialed, or the last dial failed; queued for the tracker.
/// Online: dialed and in the balancer rotation.
/// Banned: pessimized out of the rotation; queued for the tracker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    Offline,
    Online,
    Banned,
}

impl ConnState {
    fn as_u8(self) -> u8 {
        match self {
            ConnState::Offline => 0,
            ConnState::Online => 1,
            ConnState::Banned => 2,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnState::Online,
            2 => ConnState::Banned,
            _ => ConnState::Offline,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnState::Offline => fmt.write_str("offline"),
            ConnState::Online => fmt.write_str("online"),
            ConnState::Banned => fmt.write_str("banned"),
        }
    }
}

/// Point-in-time snapshot of one connection's runtime counters, as handed to
/// `Cluster::stats` visitors.
#[derive(Clone, Debug)]
pub struct ConnStats {
    pub state: ConnState,
    pub op_started: u64,
    pub op_succeeded: u64,
    pub op_failed: u64,
    /// RPC failures since the connection last came online.
    pub errors_since_online: u64,
    /// Dial failures recorded by the tracker. These never count into
    /// `op_failed`; a connection that was never offered to a caller keeps
    /// `op_failed` at zero.
    pub dial_failures: u64,
    pub last_use: Option<DateTime<Utc>>,
}

// The shared heart of a connection. State is written only under the cluster
// lock; counters are free-running atomics.
pub(crate) struct ConnCore<T: Transport> {
    addr: Addr,
    transport: Mutex<Option<Arc<T>>>,
    state: AtomicU8,
    op_started: AtomicU64,
    op_succeeded: AtomicU64,
    op_failed: AtomicU64,
    errors_since_online: AtomicU64,
    dial_failures: AtomicU64,
    // Millis since the Unix epoch; zero means never used.
    last_use_millis: AtomicI64,
}

impl<T: Transport> ConnCore<T> {
    pub(crate) fn new(addr: Addr) -> Self {
        ConnCore {
            addr,
            transport: Mutex::new(None),
            state: AtomicU8::new(ConnState::Offline.as_u8()),
            op_started: AtomicU64::new(0),
            op_succeeded: AtomicU64::new(0),
            op_failed: AtomicU64::new(0),
            errors_since_online: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            last_use_millis: AtomicI64::new(0),
        }
    }

    pub(crate) fn addr(&self) -> &Addr {
        &self.addr
    }

    pub(crate) fn state(&self) -> ConnState {
        ConnState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_state(&self, state: ConnState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn transport(&self) -> Option<Arc<T>> {
        self.transport.lock().unwrap().clone()
    }

    pub(crate) fn set_transport(&self, transport: Arc<T>) {
        *self.transport.lock().unwrap() = Some(transport);
    }

    // Taking rather than cloning is what keeps transport close exactly-once.
    pub(crate) fn take_transport(&self) -> Option<Arc<T>> {
        self.transport.lock().unwrap().take()
    }

    pub(crate) fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn reset_errors_since_online(&self) {
        self.errors_since_online.store(0, Ordering::SeqCst);
    }

    fn touch(&self) {
        self.last_use_millis
            .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }

    // Read order: state first, then the counters.
    pub(crate) fn snapshot(&self) -> ConnStats {
        let state = self.state();
        let last_use_millis = self.last_use_millis.load(Ordering::SeqCst);
        ConnStats {
            state,
            op_started: self.op_started.load(Ordering::SeqCst),
            op_succeeded: self.op_succeeded.load(Ordering::SeqCst),
            op_failed: self.op_failed.load(Ordering::SeqCst),
            errors_since_online: self.errors_since_online.load(Ordering::SeqCst),
            dial_failures: self.dial_failures.load(Ordering::SeqCst),
            last_use: if last_use_millis == 0 {
                None
            } else {
                Some(Utc.timestamp_millis(last_use_millis))
            },
        }
    }
}

/// A live connection handed out by `Cluster::get`.
///
/// Cheap to clone; clones share the underlying channel. The connection stays
/// valid until the cluster removes or closes it. Holders never hold the
/// cluster lock, so RPCs on a connection cannot stall cluster mutations.
pub struct Connection<T: Transport> {
    pub(crate) core: Arc<ConnCore<T>>,
    pub(crate) cluster: Weak<Shared<T>>,
}

impl<T: Transport> Clone for Connection<T> {
    fn clone(&self) -> Self {
        Connection {
            core: self.core.clone(),
            cluster: self.cluster.clone(),
        }
    }
}

impl<T: Transport> Connection<T> {
    pub fn address(&self) -> &Addr {
        self.core.addr()
    }

    pub fn state(&self) -> ConnState {
        self.core.state()
    }

    /// Snapshot of the runtime counters.
    pub fn runtime(&self) -> ConnStats {
        self.core.snapshot()
    }

    /// Run a unary call on this connection.
    ///
    /// When the cluster has a credential source, a fresh token is fetched
    /// and attached to the per-call context first. A failure the transport
    /// classifies as unavailable or network-level asks the owning cluster
    /// to pessimize this connection; an invalid-argument or application
    /// error leaves it in rotation. Response metadata is handed to the
    /// context's metadata callback chain.
    pub fn invoke(
        &self,
        ctx: &Context,
        method: &str,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let ctx = self.authorize(ctx)?;
        self.core.op_started.fetch_add(1, Ordering::SeqCst);
        self.core.touch();

        let transport = match self.core.transport() {
            Some(transport) => transport,
            None => return Err(self.record_call_failure(offline_error())),
        };

        match transport.invoke(&ctx, method, payload) {
            Ok(response) => {
                self.core.op_succeeded.fetch_add(1, Ordering::SeqCst);
                ctx.call_metadata_callback(&response.metadata);
                Ok(response.payload)
            }
            Err(err) => Err(self.record_call_failure(err)),
        }
    }

    /// Open a streaming call. Token handling and failure classification
    /// match `invoke`.
    pub fn stream(
        &self,
        ctx: &Context,
        method: &str,
    ) -> Result<T::Stream, Error> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let ctx = self.authorize(ctx)?;
        self.core.op_started.fetch_add(1, Ordering::SeqCst);
        self.core.touch();

        let transport = match self.core.transport() {
            Some(transport) => transport,
            None => return Err(self.record_call_failure(offline_error())),
        };

        match transport.new_stream(&ctx, method) {
            Ok(stream) => {
                self.core.op_succeeded.fetch_add(1, Ordering::SeqCst);
                Ok(stream)
            }
            Err(err) => Err(self.record_call_failure(err)),
        }
    }

    /// Close the underlying transport. Idempotent; a second close is a
    /// no-op. The cluster notices on the next failed call and re-tracks the
    /// endpoint.
    pub fn close(&self) {
        if let Some(transport) = self.core.take_transport() {
            transport.close();
        }
    }

    // A fresh token accompanies every call; tokens are never cached. A
    // connection that has outlived its cluster makes the call bare.
    fn authorize(&self, ctx: &Context) -> Result<Context, Error> {
        match self.cluster.upgrade() {
            Some(shared) => shared.authorize(ctx),
            None => Ok(ctx.clone()),
        }
    }

    // Unavailable and network-level failures ask the cluster to pessimize
    // this connection; a missing transport counts as unavailable too.
    fn record_call_failure(&self, err: TransportError) -> Error {
        self.core.op_failed.fetch_add(1, Ordering::SeqCst);
        self.core.errors_since_online.fetch_add(1, Ordering::SeqCst);
        if err.pessimizes() {
            if let Some(shared) = self.cluster.upgrade() {
                Shared::pessimize_core(&shared, &self.core);
            }
        }
        Error::Transport(err)
    }
}

fn offline_error() -> TransportError {
    TransportError::Unavailable(String::from("connection is offline"))
}

impl<T: Transport> fmt::Debug for Connection<T> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Connection")
            .field("addr", self.core.addr())
            .field("state", &self.core.state())
            .finish()
    }
}
