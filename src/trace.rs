// Copyright 2020 Joyent, Inc.

//! Observability hooks.
//!
//! Injected at construction through the cluster config; there is no
//! process-wide trace state. Every hook is optional and fires outside the
//! cluster lock, so hooks may block without stalling the cluster (though
//! they run on cluster and tracker threads, so they should not block long).

use std::fmt;
use std::sync::Arc;

use crate::connection::ConnState;
use crate::endpoint::Addr;
use crate::transport::DialError;

#[derive(Clone, Default)]
pub struct Trace {
    /// The tracker is about to dial an endpoint.
    pub dial_start: Option<Arc<dyn Fn(&Addr) + Send + Sync>>,
    /// A dial attempt finished; `None` means success.
    pub dial_done: Option<Arc<dyn Fn(&Addr, Option<&DialError>) + Send + Sync>>,
    /// A connection changed lifecycle state.
    pub conn_state: Option<Arc<dyn Fn(&Addr, ConnState) + Send + Sync>>,
    /// A connection was pessimized; the flag reports whether it was the
    /// last usable one.
    pub pessimize: Option<Arc<dyn Fn(&Addr, bool) + Send + Sync>>,
    /// A `get` call resolved; `None` means it failed.
    pub get_done: Option<Arc<dyn Fn(Option<&Addr>) + Send + Sync>>,
    /// A discovery refresh was applied with this many endpoints.
    pub discovery_done: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl Trace {
    pub(crate) fn on_dial_start(&self, addr: &Addr) {
        if let Some(hook) = &self.dial_start {
            hook(addr);
        }
    }

    pub(crate) fn on_dial_done(&self, addr: &Addr, err: Option<&DialError>) {
        if let Some(hook) = &self.dial_done {
            hook(addr, err);
        }
    }

    pub(crate) fn on_conn_state(&self, addr: &Addr, state: ConnState) {
        if let Some(hook) = &self.conn_state {
            hook(addr, state);
        }
    }

    pub(crate) fn on_pessimize(&self, addr: &Addr, last_good: bool) {
        if let Some(hook) = &self.pessimize {
            hook(addr, last_good);
        }
    }

    pub(crate) fn on_get_done(&self, addr: Option<&Addr>) {
        if let Some(hook) = &self.get_done {
            hook(addr);
        }
    }

    pub(crate) fn on_discovery_done(&self, endpoints: usize) {
        if let Some(hook) = &self.discovery_done {
            hook(endpoints);
        }
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Trace")
            .field("dial_start", &self.dial_start.is_some())
            .field("dial_done", &self.dial_done.is_some())
            .field("conn_state", &self.conn_state.is_some())
            .field("pessimize", &self.pessimize.is_some())
            .field("get_done", &self.get_done.is_some())
            .field("discovery_done", &self.discovery_done.is_some())
            .finish()
    }
}
