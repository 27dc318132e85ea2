//! The HTTP service: request decoding, dispatch, and reply streaming.
//!
//! [`PsgService`] owns the dispatcher, the worker pool that starts
//! processors, and the loop that completes background fetches. Each route
//! decodes its query string into a request and streams the reply chunks as
//! the response body.

use super::{
    backends::{self, Backends},
    params::Params,
};
use crate::server::{
    config::ServerConfig,
    pool::manager::WorkerPool,
    streaming::coordinator::start_reply,
    telemetry::{Rejection, record_rejection, record_request},
};
use anyhow::Context;
use axum::{
    body::Body,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use core::time::Duration;
use psg_core::{
    Error, Result,
    backend::memory::{Delivery, Fixture},
    cache::ExcludeBlobCache,
    dispatcher::Dispatcher,
    loop_binder::LoopBinder,
    request::RequestPayload,
};
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Media type of reply bodies.
pub const PSG_CONTENT_TYPE: &str = "application/x-ncbi-psg";

/// Builds one request payload from decoded parameters.
pub type PayloadParser = fn(&Params) -> Result<RequestPayload>;

#[derive(Clone)]
pub struct PsgService {
    config: Arc<ServerConfig>,
    dispatcher: Arc<Dispatcher>,
    worker_pool: Arc<WorkerPool>,
    binder: Option<Arc<LoopBinder>>,
    housekeeping: CancellationToken,
}

impl PsgService {
    /// Registers the processors over `fixture` and spawns the worker tasks on
    /// the current runtime.
    ///
    /// With `osg_async` set, a dedicated thread is started to complete the
    /// background OSG and WGS fetches.
    pub fn new(config: ServerConfig, fixture: Fixture, delivery: Delivery) -> anyhow::Result<Self> {
        let binder = if config.osg_async {
            let (binder, _handle) =
                LoopBinder::spawn("psg-loop").context("cannot start the completion loop thread")?;
            Some(binder)
        } else {
            None
        };

        let Backends { dispatcher, exclude } =
            backends::build(&config, fixture, delivery, binder.clone());
        let worker_pool = WorkerPool::spawn(
            config.num_workers,
            config.work_queue_size,
            config.shutdown_timeout,
        );

        let housekeeping = CancellationToken::new();
        spawn_exclude_cache_purge(
            exclude,
            Duration::from_secs(config.exclude_cache_inactivity_purge_timeout.max(1)),
            housekeeping.clone(),
        );

        Ok(Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            worker_pool: Arc::new(worker_pool),
            binder,
            housekeeping,
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Decodes the query, dispatches the request and streams its reply.
    ///
    /// Malformed parameters are answered with 400 and a plain-text reason. A
    /// request arriving during shutdown gets 503.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
    pub async fn serve(&self, query: Option<String>, parse: PayloadParser) -> Response {
        let params = Params::parse(query.as_deref());
        let request = match parse(&params).and_then(|payload| params.request(payload)) {
            Ok(request) => request,
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Rejected request: {e}");
                record_rejection(Rejection::BadRequest);
                return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
            }
        };

        record_request(request.kind().as_str());

        if !self.worker_pool.is_accepting() {
            record_rejection(Rejection::ShuttingDown);
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Error::ServiceShutdown.to_string(),
            )
                .into_response();
        }

        let body = start_reply(
            request,
            &self.dispatcher,
            &self.worker_pool,
            self.config.stream_buffer_size,
        )
        .await;

        (
            [(header::CONTENT_TYPE, PSG_CONTENT_TYPE)],
            Body::from_stream(body),
        )
            .into_response()
    }

    /// Refuses new requests, drains the worker pool and stops the completion
    /// loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.housekeeping.cancel();
        let result = self.worker_pool.shutdown().await;
        if let Some(binder) = &self.binder {
            binder.shutdown();
        }
        result
    }
}

fn spawn_exclude_cache_purge(
    exclude: Arc<ExcludeBlobCache>,
    every: Duration,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let _purged = exclude.purge_inactive(Instant::now());
                    #[cfg(feature = "tracing")]
                    if _purged > 0 {
                        tracing::debug!("Purged {_purged} inactive exclude-cache client(s)");
                    }
                }
            }
        }
    });
}
