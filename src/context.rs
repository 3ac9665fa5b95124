// Copyright 2020 Joyent, Inc.

//! Cancellation, deadlines, and per-call metadata callbacks.
//!
//! A `Context` is an immutable value. Deriving one (`with_timeout`,
//! `with_cancel`, `with_metadata_callback`) copies the original and leaves it
//! untouched, so a context handed to a background task cannot be mutated
//! behind its back. Cancel handles affect the context they were derived from
//! and everything derived from it afterwards, never an ancestor.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::credentials::Token;
use crate::error::Error;
use crate::transport::Metadata;

/// Callback invoked with metadata surfaced on a transport response.
pub type MetadataCallback = Arc<dyn Fn(&Metadata) + Send + Sync>;

#[derive(Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancels: Vec<Arc<AtomicBool>>,
    metadata_callback: Option<MetadataCallback>,
    auth_token: Option<Token>,
}

/// Cancels the context it was created from. Cheap to clone.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

impl Context {
    /// The root context: no deadline, never canceled.
    pub fn background() -> Self {
        Context::default()
    }

    /// Derive a context that expires at `deadline`. An earlier deadline
    /// already present wins.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        ctx
    }

    /// Derive a context that expires `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a cancelable context and the handle that cancels it.
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let flag = Arc::new(AtomicBool::new(false));
        let mut ctx = self.clone();
        ctx.cancels.push(flag.clone());
        (ctx, CancelHandle(flag))
    }

    /// Attach a metadata callback. When one is already attached the new
    /// callback composes with it: the existing chain runs first, then the
    /// new callback.
    pub fn with_metadata_callback(&self, callback: MetadataCallback) -> Self {
        let mut ctx = self.clone();
        ctx.metadata_callback = Some(match self.metadata_callback.clone() {
            Some(prev) => Arc::new(move |md: &Metadata| {
                prev(md);
                callback(md);
            }) as MetadataCallback,
            None => callback,
        });
        ctx
    }

    /// Run the metadata callback chain. Empty metadata is skipped, as is a
    /// context with no callback attached.
    pub fn call_metadata_callback(&self, metadata: &Metadata) {
        if metadata.is_empty() {
            return;
        }
        if let Some(callback) = &self.metadata_callback {
            callback(metadata);
        }
    }

    /// Derive a context carrying the auth token for one call. The
    /// connection attaches a freshly fetched token here before every RPC;
    /// transports read it back with [`auth_token`](Context::auth_token).
    pub fn with_auth_token(&self, token: Token) -> Self {
        let mut ctx = self.clone();
        ctx.auth_token = Some(token);
        ctx
    }

    pub fn auth_token(&self) -> Option<&Token> {
        self.auth_token.as_ref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_canceled(&self) -> bool {
        self.cancels.iter().any(|flag| flag.load(Ordering::SeqCst))
    }

    /// The error this context currently carries, if any. Cancellation takes
    /// precedence over an expired deadline.
    pub fn err(&self) -> Option<Error> {
        if self.is_canceled() {
            return Some(Error::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Some(Error::DeadlineExceeded);
            }
        }
        None
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("Context")
            .field("deadline", &self.deadline)
            .field("cancel_sources", &self.cancels.len())
            .field("has_metadata_callback", &self.metadata_callback.is_some())
            .field("has_auth_token", &self.auth_token.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn cancel_reaches_descendants_not_ancestors() {
        let root = Context::background();
        let (parent, handle) = root.with_cancel();
        let child = parent.with_timeout(Duration::from_secs(60));

        assert!(!parent.is_canceled());
        handle.cancel();
        assert!(parent.is_canceled());
        assert!(child.is_canceled());
        assert!(!root.is_canceled());
    }

    #[test]
    fn earlier_deadline_wins() {
        let near = Instant::now() + Duration::from_millis(10);
        let far = Instant::now() + Duration::from_secs(60);
        let ctx = Context::background().with_deadline(near).with_deadline(far);
        assert_eq!(ctx.deadline(), Some(near));
    }

    #[test]
    fn deadline_expiry_reported() {
        let ctx = Context::background().with_timeout(Duration::from_millis(0));
        match ctx.err() {
            Some(Error::DeadlineExceeded) => (),
            other => panic!("unexpected context error: {:?}", other),
        }
    }

    #[test]
    fn metadata_callbacks_compose_in_insertion_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen1 = seen.clone();
        let seen2 = seen.clone();
        let ctx = Context::background()
            .with_metadata_callback(Arc::new(move |_md: &Metadata| {
                seen1.lock().unwrap().push(1);
            }))
            .with_metadata_callback(Arc::new(move |_md: &Metadata| {
                seen2.lock().unwrap().push(2);
            }));

        let mut md = Metadata::new();
        md.insert(String::from("x-served-by"), vec![String::from("node-1")]);
        ctx.call_metadata_callback(&md);

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn auth_token_rides_the_derived_context_only() {
        let root = Context::background();
        let ctx = root.with_auth_token(Token::new("t0ken"));
        assert_eq!(ctx.auth_token().map(|t| t.as_str()), Some("t0ken"));
        assert!(root.auth_token().is_none());
    }

    #[test]
    fn empty_metadata_skips_callbacks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen1 = seen.clone();
        let ctx = Context::background().with_metadata_callback(Arc::new(
            move |_md: &Metadata| {
                seen1.lock().unwrap().push(1);
            },
        ));
        ctx.call_metadata_callback(&Metadata::new());
        assert!(seen.lock().unwrap().is_empty());
    }
}
