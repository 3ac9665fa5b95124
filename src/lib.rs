// Copyright 2020 Joyent, Inc.

//! A load-balanced connection cluster for multi-node SQL services
//!
//! Carom keeps a rack of long-lived connections to a dynamic set of database
//! endpoints so that the layers above it (session pools, query execution)
//! can obtain a healthy connection in O(1) without caring about discovery
//! churn, transient failures, or reconnection. It grew out of the same
//! billiards tradition as cueball: keep the balls rolling, swap them out
//! quietly when they scratch.
//!
//! ## Pieces on the table
//!
//! * [`Cluster`](cluster/struct.Cluster.html) owns the endpoint index and is
//!   the only public mutation surface: `get`, `insert`, `update`, `remove`,
//!   `pessimize`, `close`, `stats`.
//! * A [`Balancer`](balancer/trait.Balancer.html) picks among the Online
//!   connections. Two policies ship: plain round-robin and weighted random
//!   with locality preference (the default).
//! * The *tracker* is a background thread owned by the cluster. Every
//!   connection that is not Online sits in its queue and is redialed with
//!   per-connection exponential backoff until it recovers or is removed.
//! * A [`Discover`](discovery/trait.Discover.html) implementation feeds the
//!   [`DiscoveryDriver`](discovery/struct.DiscoveryDriver.html), which
//!   periodically diffs the discovered endpoint list against the installed
//!   one and drives the cluster accordingly.
//!
//! ## Connection lifecycle
//!
//! ```text
//!           dial ok
//!  Offline ─────────► Online
//!    ▲                 │  pessimize / RPC failure
//!    │  remove         ▼
//!    └──────────────  Banned
//!                     │ tracker redial ok
//!                     └──────────────► Online
//! ```
//!
//! An insert creates the connection Offline and queues it; the tracker's
//! first successful dial promotes it into the balancer. An RPC failure the
//! transport classifies as unavailable or network-level pessimizes the
//! connection: banned, out of the balancer, back in the tracker queue.
//! Remove deletes it from every structure and closes its transport.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//!
//! use carom::cluster::Cluster;
//! use carom::config::ClusterConfig;
//! use carom::context::Context;
//! use carom::discovery::{DiscoveryDriver, StaticDiscover};
//! use carom::endpoint::Endpoint;
//!
//! let config = ClusterConfig::builder()
//!     .dial_timeout(Duration::from_secs(1))
//!     .build();
//! let cluster = Cluster::new(config, Box::new(|ctx, addr, tls| {
//!     // Establish your transport here: gRPC channel, TLS socket, ...
//!     grpc_dial(ctx, &addr.host, addr.port, tls)
//! }));
//!
//! let discover = StaticDiscover::new(vec![Endpoint::new("db-1", 2135)]);
//! let _driver = DiscoveryDriver::start(
//!     cluster.clone(),
//!     discover,
//!     Duration::from_secs(60),
//!     log.clone(),
//! );
//!
//! let ctx = Context::background().with_timeout(Duration::from_secs(5));
//! let conn = cluster.get(&ctx)?;
//! let reply = conn.invoke(&ctx, "/Service/Method", &request)?;
//! ```
//!
//! The cluster never persists anything: state is rebuilt from discovery on
//! every process start.

#![allow(missing_docs)]

pub mod balancer;
pub mod cluster;
pub mod config;
pub mod connection;
pub mod context;
pub mod credentials;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod trace;
pub mod transport;

/// Crate version, surfaced for user-agent style reporting.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
