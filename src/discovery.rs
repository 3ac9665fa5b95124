// Copyright 2020 Joyent, Inc.

//! Periodic endpoint discovery feeding the cluster.
//!
//! The driver owns one thread. A repeating timer tick and the cluster's
//! out-of-band refresh signal (sent when the last usable connection is
//! pessimized) arrive on the same channel; each one triggers a discovery
//! call whose result is diffed against the previously applied list and
//! folded into the cluster. Discovery failures are retried with bounded
//! exponential backoff while the cluster keeps serving its current set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use backoff::{ExponentialBackoff, Operation};
use slog::{debug, info, warn, Logger};

use crate::cluster::Cluster;
use crate::context::Context;
use crate::endpoint::{diff_endpoints, sort_endpoints, Endpoint};
use crate::error::Error;
use crate::transport::Transport;

/// Endpoint discovery contract. Implementations typically wrap the
/// database's discovery RPC; the encoding is theirs to own.
pub trait Discover: Send + 'static {
    fn discover(&mut self, ctx: &Context) -> Result<Vec<Endpoint>, Error>;
}

/// A fixed endpoint list. Useful for tests and for deployments without a
/// discovery service.
pub struct StaticDiscover {
    endpoints: Vec<Endpoint>,
}

impl StaticDiscover {
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        StaticDiscover { endpoints }
    }
}

impl Discover for StaticDiscover {
    fn discover(&mut self, _ctx: &Context) -> Result<Vec<Endpoint>, Error> {
        Ok(self.endpoints.clone())
    }
}

/// Apply a refreshed endpoint list to the cluster by diffing it against the
/// previously applied one. Both lists must be identity-sorted. Unchanged
/// identities become updates, new ones inserts, vanished ones removes.
pub fn merge_endpoints<T: Transport>(
    ctx: &Context,
    cluster: &Cluster<T>,
    curr: &[Endpoint],
    next: &[Endpoint],
) -> Result<(), Error> {
    let mut updates = Vec::new();
    let mut inserts = Vec::new();
    let mut removes = Vec::new();
    diff_endpoints(
        curr,
        next,
        |_, j| updates.push(j),
        |_, j| inserts.push(j),
        |i, _| removes.push(i),
    );
    for j in updates {
        cluster.update(ctx, next[j].clone())?;
    }
    for j in inserts {
        cluster.insert(ctx, next[j].clone())?;
    }
    for i in removes {
        cluster.remove(ctx, &curr[i])?;
    }
    Ok(())
}

/// Handle on the running discovery driver. Dropping it stops the thread.
pub struct DiscoveryDriver {
    tx: Sender<()>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    _timer: timer::Timer,
    _guard: timer::Guard,
}

impl DiscoveryDriver {
    /// Start discovering into `cluster`, refreshing every `interval` and
    /// whenever the cluster signals. Registers the refresh channel with the
    /// cluster and performs one refresh immediately.
    pub fn start<T, D>(
        cluster: Cluster<T>,
        discoverer: D,
        interval: Duration,
        log: Logger,
    ) -> Self
    where
        T: Transport,
        D: Discover,
    {
        let (tx, rx) = channel();
        cluster.register_refresh(tx.clone());

        let periodic = timer::Timer::new();
        let tick_tx = tx.clone();
        let guard = periodic.schedule_repeating(
            chrono::Duration::from_std(interval)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            move || {
                let _ = tick_tx.send(());
            },
        );

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let thread = thread::spawn(move || {
            driver_loop(cluster, discoverer, rx, stop_clone, interval, log);
        });

        DiscoveryDriver {
            tx,
            stop,
            thread: Some(thread),
            _timer: periodic,
            _guard: guard,
        }
    }

    /// Stop the driver and join its thread. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for DiscoveryDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn driver_loop<T, D>(
    cluster: Cluster<T>,
    mut discoverer: D,
    rx: Receiver<()>,
    stop: Arc<AtomicBool>,
    interval: Duration,
    log: Logger,
) where
    T: Transport,
    D: Discover,
{
    let mut current: Vec<Endpoint> = Vec::new();
    loop {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match refresh(&cluster, &mut discoverer, &current, interval, &log) {
            Ok(next) => current = next,
            Err(Error::ClusterClosed) => {
                info!(log, "cluster closed; discovery stopping");
                break;
            }
            Err(err) => warn!(log, "discovery refresh failed: {}", err),
        }
        // Sleep until the next timer tick or out-of-band signal.
        if rx.recv().is_err() {
            break;
        }
        if stop.load(Ordering::SeqCst) {
            break;
        }
    }
    debug!(log, "discovery driver exiting");
}

fn refresh<T, D>(
    cluster: &Cluster<T>,
    discoverer: &mut D,
    current: &[Endpoint],
    interval: Duration,
    log: &Logger,
) -> Result<Vec<Endpoint>, Error>
where
    T: Transport,
    D: Discover,
{
    let ctx = Context::background().with_timeout(interval);

    // Retry the discovery call itself; one refresh never retries past its
    // own interval.
    let mut backoff = ExponentialBackoff {
        max_elapsed_time: Some(interval),
        ..ExponentialBackoff::default()
    };
    let mut op = || {
        discoverer.discover(&ctx).map_err(|err| {
            debug!(log, "discovery attempt failed: {}", err);
            backoff::Error::Transient(err)
        })
    };
    let mut next = op.retry(&mut backoff).map_err(|err| match err {
        backoff::Error::Permanent(inner) | backoff::Error::Transient(inner) => {
            inner
        }
    })?;

    sort_endpoints(&mut next);
    merge_endpoints(&ctx, cluster, current, &next)?;
    info!(log, "discovery applied {} endpoint(s)", next.len());
    cluster.trace().on_discovery_done(next.len());
    Ok(next)
}
