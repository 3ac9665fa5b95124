// Copyright 2020 Joyent, Inc.

//! The connection cluster: an index of endpoints, the balancer that selects
//! among the Online ones, and the tracker that redials the rest.
//!
//! One mutex guards the index, the balancer membership, and the tracker
//! queue. It is never held across a dial, a transport call, a user callback,
//! or anything else that can block; the tracker snapshots work under the
//! lock, dials outside it, and reacquires it to apply the results.
//!
//! The cluster is cheap to clone; clones share all state. Discovery feeds
//! endpoint changes in through `insert`/`update`/`remove` (usually via
//! [`merge_endpoints`](crate::discovery::merge_endpoints)); consumers take
//! connections out through `get`.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use slog::{debug, info, o, warn, Drain, Logger};

use crate::balancer::{Balancer, BalancerInfo, Handle};
use crate::config::{ClusterConfig, TlsConfig};
use crate::connection::{ConnCore, ConnState, ConnStats, Connection};
use crate::context::Context;
use crate::endpoint::{Addr, Endpoint};
use crate::error::Error;
use crate::transport::{DialError, Transport};

// Get waiters re-check cancellation at least this often.
const GET_WAIT_SLICE: Duration = Duration::from_millis(10);

/// Dialer contract supplied by the transport layer: establish a channel to
/// `addr` within the context's deadline. The cluster hands the configured
/// TLS material along on every dial.
pub type Dialer<T> = Box<
    dyn Fn(&Context, &Addr, Option<&TlsConfig>) -> Result<T, DialError>
        + Send
        + Sync,
>;

enum TrackerMsg {
    Wake,
    Stop,
}

struct TrackerHandle {
    tx: Sender<TrackerMsg>,
    thread: thread::JoinHandle<()>,
}

// Per-endpoint bookkeeping. The balancer handle is present exactly when the
// connection is Online; `tracked` mirrors membership in the redial queue.
struct Entry<T: Transport> {
    conn: Arc<ConnCore<T>>,
    info: BalancerInfo,
    handle: Option<Handle>,
    tracked: bool,
    next_attempt: Instant,
    backoff: ExponentialBackoff,
}

struct Core<T: Transport> {
    closed: bool,
    index: HashMap<Addr, Entry<T>>,
    balancer: Box<dyn Balancer>,
    queue: VecDeque<Addr>,
}

pub(crate) struct Shared<T: Transport> {
    core: Mutex<Core<T>>,
    wait: Condvar,
    dial: Dialer<T>,
    config: ClusterConfig,
    log: Logger,
    // Tracker thread handle; spawned once, on the first enqueue.
    tracker: Mutex<Option<TrackerHandle>>,
    // Out-of-band refresh channel registered by the discovery driver.
    refresh: Mutex<Option<Sender<()>>>,
}

/// A load-balanced cluster of connections to a dynamic set of endpoints.
pub struct Cluster<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Clone for Cluster<T> {
    fn clone(&self) -> Self {
        Cluster {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Transport> Cluster<T> {
    pub fn new(config: ClusterConfig, dial: Dialer<T>) -> Self {
        let log = config
            .log
            .clone()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        let balancer = config
            .balancer
            .new_balancer(config.prefer_local_factor);
        Cluster {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    closed: false,
                    index: HashMap::new(),
                    balancer,
                    queue: VecDeque::new(),
                }),
                wait: Condvar::new(),
                dial,
                config,
                log,
                tracker: Mutex::new(None),
                refresh: Mutex::new(None),
            }),
        }
    }

    /// Register the channel the discovery driver listens on. Pessimizing the
    /// last usable connection sends one out-of-band refresh signal on it.
    pub fn register_refresh(&self, tx: Sender<()>) {
        *self.shared.refresh.lock().unwrap() = Some(tx);
    }

    /// Take the next Online connection the balancer offers.
    ///
    /// Blocks while no connection is Online: without a context deadline,
    /// until an insert (or tracker redial) produces one or the context is
    /// canceled; with a deadline, failing with `ClusterEmpty` when it
    /// expires first.
    pub fn get(&self, ctx: &Context) -> Result<Connection<T>, Error> {
        let shared = &self.shared;
        let mut guard = shared.core.lock().unwrap();
        loop {
            if guard.closed {
                return Err(Error::ClusterClosed);
            }
            if ctx.is_canceled() {
                return Err(Error::Canceled);
            }

            let picked = {
                let core = &mut *guard;
                match core.balancer.next() {
                    Some(addr) => {
                        core.index.get(&addr).map(|entry| (addr, entry.conn.clone()))
                    }
                    None => None,
                }
            };
            if let Some((addr, conn)) = picked {
                drop(guard);
                shared.config.trace.on_get_done(Some(&addr));
                return Ok(Connection {
                    core: conn,
                    cluster: Arc::downgrade(shared),
                });
            }

            // Nothing Online right now.
            let now = Instant::now();
            let slice = match ctx.deadline() {
                Some(deadline) => {
                    if now >= deadline {
                        drop(guard);
                        shared.config.trace.on_get_done(None);
                        return Err(Error::ClusterEmpty);
                    }
                    GET_WAIT_SLICE.min(deadline - now)
                }
                None => GET_WAIT_SLICE,
            };
            let (reacquired, _) =
                shared.wait.wait_timeout(guard, slice).unwrap();
            guard = reacquired;
        }
    }

    /// Add an endpoint. A new identity starts Offline and is queued for the
    /// tracker's next dial; an identity already present is always treated as
    /// an update of its metadata.
    pub fn insert(&self, ctx: &Context, endpoint: Endpoint) -> Result<(), Error> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let addr = endpoint.addr();
        let info = BalancerInfo::from(&endpoint);
        let inserted = {
            let mut guard = self.shared.core.lock().unwrap();
            if guard.closed {
                return Err(Error::ClusterClosed);
            }
            let core = &mut *guard;
            if core.index.contains_key(&addr) {
                apply_update(core, &addr, info);
                false
            } else {
                debug!(self.shared.log, "inserting endpoint {}", addr);
                core.index.insert(
                    addr.clone(),
                    Entry {
                        conn: Arc::new(ConnCore::new(addr.clone())),
                        info,
                        handle: None,
                        tracked: true,
                        next_attempt: Instant::now(),
                        backoff: self.shared.redial_backoff(),
                    },
                );
                core.queue.push_back(addr.clone());
                true
            }
        };
        if inserted {
            Shared::ensure_tracker(&self.shared);
            self.shared.wake_tracker();
            self.shared.config.trace.on_conn_state(&addr, ConnState::Offline);
        }
        Ok(())
    }

    /// Replace an endpoint's advisory metadata. Unknown identities are a
    /// no-op.
    pub fn update(&self, ctx: &Context, endpoint: Endpoint) -> Result<(), Error> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let addr = endpoint.addr();
        let info = BalancerInfo::from(&endpoint);
        let mut guard = self.shared.core.lock().unwrap();
        if guard.closed {
            return Err(Error::ClusterClosed);
        }
        apply_update(&mut *guard, &addr, info);
        Ok(())
    }

    /// Drop an endpoint unconditionally, closing its transport. Unknown
    /// identities are a no-op. Does not wait for RPCs already in flight on
    /// the removed connection.
    pub fn remove(&self, ctx: &Context, endpoint: &Endpoint) -> Result<(), Error> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let addr = endpoint.addr();
        let transport = {
            let mut guard = self.shared.core.lock().unwrap();
            if guard.closed {
                return Err(Error::ClusterClosed);
            }
            let core = &mut *guard;
            let mut entry = match core.index.remove(&addr) {
                Some(entry) => entry,
                None => return Ok(()),
            };
            if let Some(handle) = entry.handle.take() {
                core.balancer.remove(handle);
            }
            if entry.tracked {
                core.queue.retain(|queued| queued != &addr);
            }
            entry.conn.take_transport()
        };
        if let Some(transport) = transport {
            transport.close();
        }
        debug!(self.shared.log, "removed endpoint {}", addr);
        Ok(())
    }

    /// Take the connection out of rotation: Banned, out of the balancer,
    /// queued for the tracker. A connection that is not Online is left
    /// alone. When this was the last usable connection the discovery driver
    /// is signaled to refresh out of band.
    pub fn pessimize(
        &self,
        ctx: &Context,
        conn: &Connection<T>,
    ) -> Result<(), Error> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        Shared::pessimize_core(&self.shared, &conn.core);
        Ok(())
    }

    /// Shut the cluster down: fail all waiters, stop the tracker, and close
    /// every transport exactly once. A second close fails with
    /// `ClusterClosed` like any other operation.
    pub fn close(&self) -> Result<(), Error> {
        let mut transports = Vec::new();
        {
            let mut guard = self.shared.core.lock().unwrap();
            if guard.closed {
                return Err(Error::ClusterClosed);
            }
            guard.closed = true;
            let core = &mut *guard;
            for (_, entry) in core.index.iter_mut() {
                if let Some(handle) = entry.handle.take() {
                    core.balancer.remove(handle);
                }
                if let Some(transport) = entry.conn.take_transport() {
                    transports.push(transport);
                }
                entry.conn.set_state(ConnState::Offline);
            }
            core.queue.clear();
            core.index.clear();
        }
        // Wake every get waiter so they observe the closed flag.
        self.shared.wait.notify_all();

        let tracker = self.shared.tracker.lock().unwrap().take();
        if let Some(handle) = tracker {
            let _ = handle.tx.send(TrackerMsg::Stop);
            let _ = handle.thread.join();
        }

        for transport in transports {
            transport.close();
        }
        info!(self.shared.log, "cluster closed");
        Ok(())
    }

    /// Visit a point-in-time snapshot of every endpoint's runtime stats.
    /// The snapshot is taken under the cluster lock; the visitor runs after
    /// it is released.
    pub fn stats<F>(&self, mut visit: F)
    where
        F: FnMut(&Endpoint, ConnStats),
    {
        let snapshot: Vec<(Endpoint, ConnStats)> = {
            let guard = self.shared.core.lock().unwrap();
            guard
                .index
                .iter()
                .map(|(addr, entry)| {
                    (
                        Endpoint {
                            host: addr.host.clone(),
                            port: addr.port,
                            load_factor: entry.info.load_factor,
                            local: entry.info.local,
                        },
                        entry.conn.snapshot(),
                    )
                })
                .collect()
        };
        for (endpoint, stats) in snapshot {
            visit(&endpoint, stats);
        }
    }

    pub(crate) fn trace(&self) -> &crate::trace::Trace {
        &self.shared.config.trace
    }
}

// An already-present identity always takes the update path, whatever public
// operation it arrived through.
fn apply_update<T: Transport>(core: &mut Core<T>, addr: &Addr, info: BalancerInfo) {
    let Core {
        index, balancer, ..
    } = core;
    if let Some(entry) = index.get_mut(addr) {
        entry.info = info;
        if let Some(handle) = entry.handle {
            balancer.update(handle, info);
        }
    }
}

impl<T: Transport> Shared<T> {
    // Per-call context derivation for connections; see
    // `ClusterConfig::authorize`.
    pub(crate) fn authorize(&self, ctx: &Context) -> Result<Context, Error> {
        self.config.authorize(ctx)
    }

    fn redial_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.config.tracker_interval,
            initial_interval: self.config.tracker_interval,
            max_interval: self.config.tracker_backoff_max,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    fn wake_tracker(&self) {
        if let Some(handle) = &*self.tracker.lock().unwrap() {
            let _ = handle.tx.send(TrackerMsg::Wake);
        }
    }

    fn ensure_tracker(shared: &Arc<Shared<T>>) {
        let mut tracker = shared.tracker.lock().unwrap();
        if tracker.is_some() {
            return;
        }
        let (tx, rx) = channel();
        let shared_clone = shared.clone();
        let thread = thread::spawn(move || tracker_loop(shared_clone, rx));
        *tracker = Some(TrackerHandle { tx, thread });
    }

    // Pessimize by connection identity, verified against the exact
    // connection object so a removed-and-reinserted endpoint is not banned
    // by a stale holder.
    pub(crate) fn pessimize_core(
        shared: &Arc<Shared<T>>,
        conn: &Arc<ConnCore<T>>,
    ) {
        let addr = conn.addr().clone();
        let (last_good, transport) = {
            let mut guard = shared.core.lock().unwrap();
            if guard.closed {
                return;
            }
            let core = &mut *guard;
            let Core {
                index,
                balancer,
                queue,
                ..
            } = core;
            let entry = match index.get_mut(&addr) {
                Some(entry) if Arc::ptr_eq(&entry.conn, conn) => entry,
                _ => return,
            };
            // Only an Online connection holds a balancer handle; anything
            // else is already being tracked or torn down.
            let handle = match entry.handle.take() {
                Some(handle) => handle,
                None => return,
            };
            let last_good = balancer.pessimize(handle);
            balancer.remove(handle);
            conn.set_state(ConnState::Banned);
            if !entry.tracked {
                entry.tracked = true;
                entry.next_attempt = Instant::now();
                entry.backoff = shared.redial_backoff();
                queue.push_back(addr.clone());
            }
            (last_good, conn.take_transport())
        };
        if let Some(transport) = transport {
            transport.close();
        }
        warn!(
            shared.log,
            "pessimized connection to {} (last_good: {})", addr, last_good
        );
        shared.config.trace.on_pessimize(&addr, last_good);
        shared.config.trace.on_conn_state(&addr, ConnState::Banned);
        Shared::ensure_tracker(shared);
        shared.wake_tracker();
        if last_good {
            if let Some(tx) = &*shared.refresh.lock().unwrap() {
                let _ = tx.send(());
            }
        }
    }

    // How long the tracker may sleep before some queued entry is due.
    fn next_tracker_sleep(&self) -> Duration {
        let guard = self.core.lock().unwrap();
        let now = Instant::now();
        let mut sleep = self.config.tracker_interval;
        for addr in guard.queue.iter() {
            if let Some(entry) = guard.index.get(addr) {
                let until = if entry.next_attempt > now {
                    entry.next_attempt - now
                } else {
                    Duration::from_millis(0)
                };
                if until < sleep {
                    sleep = until;
                }
            }
        }
        sleep
    }
}

fn redial_delay(
    backoff: &mut ExponentialBackoff,
    err: &DialError,
    max: Duration,
) -> Duration {
    let base = backoff.next_backoff().unwrap_or(max);
    // A refused endpoint retries on the plain schedule; a timed-out one
    // waits twice as long.
    let delay = if err.is_timeout() { base * 2 } else { base };
    if delay > max {
        max
    } else {
        delay
    }
}

// The tracker: one cooperative thread that redials every queued connection,
// promoting the ones that come back.
fn tracker_loop<T: Transport>(
    shared: Arc<Shared<T>>,
    rx: Receiver<TrackerMsg>,
) {
    let log = shared.log.new(o!("task" => "tracker"));
    debug!(log, "tracker started");
    loop {
        let timeout = shared.next_tracker_sleep();
        match rx.recv_timeout(timeout) {
            Ok(TrackerMsg::Stop) | Err(RecvTimeoutError::Disconnected) => break,
            Ok(TrackerMsg::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }

        // Snapshot the due entries, then dial outside the lock.
        let now = Instant::now();
        let due: Vec<(Addr, Arc<ConnCore<T>>)> = {
            let guard = shared.core.lock().unwrap();
            if guard.closed {
                break;
            }
            guard
                .queue
                .iter()
                .filter_map(|addr| {
                    guard.index.get(addr).and_then(|entry| {
                        if entry.next_attempt <= now {
                            Some((addr.clone(), entry.conn.clone()))
                        } else {
                            None
                        }
                    })
                })
                .collect()
        };
        if due.is_empty() {
            continue;
        }
        debug!(log, "redialing {} tracked connection(s)", due.len());

        let mut dialed = Vec::with_capacity(due.len());
        for (addr, conn) in due {
            shared.config.trace.on_dial_start(&addr);
            let ctx =
                Context::background().with_timeout(shared.config.dial_timeout);
            let result =
                (shared.dial)(&ctx, &addr, shared.config.tls.as_ref());
            shared.config.trace.on_dial_done(&addr, result.as_ref().err());
            dialed.push((addr, conn, result));
        }

        // Reacquire the lock and fold the results back in.
        let mut to_close: Vec<Arc<T>> = Vec::new();
        let mut promoted: Vec<Addr> = Vec::new();
        let closed = {
            let mut guard = shared.core.lock().unwrap();
            let core = &mut *guard;
            if core.closed {
                for (_, _, result) in dialed {
                    if let Ok(transport) = result {
                        to_close.push(Arc::new(transport));
                    }
                }
                true
            } else {
                let Core {
                    index,
                    balancer,
                    queue,
                    ..
                } = core;
                for (addr, conn, result) in dialed {
                    let entry = match index.get_mut(&addr) {
                        Some(entry) if Arc::ptr_eq(&entry.conn, &conn) => entry,
                        // Removed or replaced while we were dialing; the
                        // fresh transport is not ours to install.
                        _ => {
                            if let Ok(transport) = result {
                                to_close.push(Arc::new(transport));
                            }
                            continue;
                        }
                    };
                    match result {
                        Ok(transport) if conn.state() != ConnState::Online => {
                            conn.set_transport(Arc::new(transport));
                            conn.set_state(ConnState::Online);
                            conn.reset_errors_since_online();
                            entry.handle =
                                Some(balancer.insert(addr.clone(), entry.info));
                            entry.tracked = false;
                            entry.backoff.reset();
                            queue.retain(|queued| queued != &addr);
                            promoted.push(addr);
                        }
                        Ok(transport) => to_close.push(Arc::new(transport)),
                        Err(err) => {
                            conn.record_dial_failure();
                            let delay = redial_delay(
                                &mut entry.backoff,
                                &err,
                                shared.config.tracker_backoff_max,
                            );
                            entry.next_attempt = Instant::now() + delay;
                            debug!(
                                log,
                                "redial of {} failed: {}; next attempt in {:?}",
                                addr,
                                err,
                                delay
                            );
                        }
                    }
                }
                false
            }
        };

        for transport in to_close {
            transport.close();
        }
        if !promoted.is_empty() {
            shared.wait.notify_all();
            for addr in promoted {
                info!(log, "connection to {} is online", addr);
                shared.config.trace.on_conn_state(&addr, ConnState::Online);
            }
        }
        if closed {
            break;
        }
    }
    debug!(log, "tracker exiting");
}
