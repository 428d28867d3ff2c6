//! JSON API and server-sent progress events.
//!
//! | Method | Path                                | Handler                |
//! |--------|-------------------------------------|------------------------|
//! | POST   | `/api/calculate`                    | [`handler::calculate`] |
//! | GET    | `/api/calculate/{calculation}`      | [`handler::show`]      |
//! | GET    | `/api/calculate/{calculation}/stream` | [`handler::stream`]  |
//! | GET    | `/api/history`                      | [`handler::history`]   |
//! | GET    | `/healthz`                          | [`handler::health`]    |
//!
//! `{calculation}` is either the integer id or the UUID token.

pub mod error;
pub mod handler;
pub mod request;


use crate::server::telemetry::{
    decrement_streams_inflight, increment_streams_inflight, record_stream_duration,
};
use axum::{
    Router,
    routing::{get, post},
};
use core::time::Duration;
use montepi::CalculationService;
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub service: CalculationService,
    pub streams: StreamTracker,
}

impl AppState {
    pub fn new(service: CalculationService) -> Self {
        Self {
            service,
            streams: StreamTracker::default(),
        }
    }
}

/// Counts open progress streams and ends them on shutdown.
#[derive(Clone, Default)]
pub struct StreamTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    inflight: AtomicUsize,
    refusing: AtomicBool,
    cancel: CancellationToken,
}

/// Held by an open stream; dropping it closes the slot.
pub struct StreamGuard {
    tracker: StreamTracker,
    opened: Instant,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.tracker.inner.inflight.fetch_sub(1, Ordering::AcqRel);
        decrement_streams_inflight();
        record_stream_duration(self.opened.elapsed().as_millis() as f64);
    }
}

impl StreamTracker {
    /// Registers a new stream, or `None` once shutdown has begun.
    pub fn open(&self) -> Option<StreamGuard> {
        if self.is_refusing() {
            return None;
        }
        self.inner.inflight.fetch_add(1, Ordering::AcqRel);
        increment_streams_inflight();
        Some(StreamGuard {
            tracker: self.clone(),
            opened: Instant::now(),
        })
    }

    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::Acquire)
    }

    pub fn is_refusing(&self) -> bool {
        self.inner.refusing.load(Ordering::Acquire)
    }

    /// Resolves when open streams must end.
    pub fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.inner.cancel.clone().cancelled_owned()
    }

    /// Refuses new work, waits up to `grace` for open streams to finish on
    /// their own, then ends the rest.
    pub async fn shutdown(&self, grace: Duration) {
        #[cfg(feature = "tracing")]
        tracing::info!("Refusing new requests");
        self.inner.refusing.store(true, Ordering::Release);

        #[cfg(feature = "tracing")]
        tracing::info!("Draining in-flight streams ({} active)", self.inflight());
        let drained = timeout(grace, async {
            while self.inflight() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("All in-flight streams drained");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Graceful drain timed out ({} streams still active)",
                    self.inflight()
                );
            }
        }

        self.inner.cancel.cancel();
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/calculate", post(handler::calculate))
        .route("/api/calculate/{calculation}", get(handler::show))
        .route("/api/calculate/{calculation}/stream", get(handler::stream))
        .route("/api/history", get(handler::history))
        .route("/healthz", get(handler::health))
        .layer(
            ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            ),
        )
        .with_state(state)
}
