//! One logical exporter endpoint backed by several physical channels.
//!
//! A client can often reach an exporter more than one way: directly over
//! the LAN, or routed through the controller.  [`ChannelSet`] holds those
//! routes in priority order and [`MultipathStub`] picks one per call:
//!
//! 1. Probe each channel in order (probing starts an idle channel
//!    connecting) and dispatch on the first that is `READY`.
//! 2. If none is ready, dispatch on the last channel anyway.  The last
//!    route is the routed fallback, which connects lazily and queues.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use jmp_core::{Channel, ConnectivityState, ExporterService, Report, RpcError, StatusResponse};

/// A [`ChannelSet`] needs at least one route.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("a channel set needs at least one channel")]
pub struct EmptyChannelSet;

/// One physical route: the channel's connectivity plus the stub bound to it.
#[derive(Clone)]
pub struct Route {
    pub channel: Arc<dyn Channel>,
    pub stub: Arc<dyn ExporterService>,
}

impl Route {
    pub fn new(channel: Arc<dyn Channel>, stub: Arc<dyn ExporterService>) -> Self {
        Self { channel, stub }
    }
}

/// Ordered routes to one exporter, highest priority first.
///
/// Immutable after construction.
#[derive(Clone)]
pub struct ChannelSet {
    routes: Arc<[Route]>,
}

#[allow(clippy::len_without_is_empty)]
impl ChannelSet {
    /// # Errors
    ///
    /// Returns [`EmptyChannelSet`] if `routes` is empty.
    pub fn new(routes: Vec<Route>) -> Result<Self, EmptyChannelSet> {
        if routes.is_empty() {
            return Err(EmptyChannelSet);
        }
        Ok(Self {
            routes: routes.into(),
        })
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    /// Number of routes; never zero.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Index of the route the next call should use.
    pub fn select(&self) -> usize {
        let last = self.routes.len() - 1;
        for (idx, route) in self.routes.iter().enumerate() {
            let state = route.channel.state(true);
            if state == ConnectivityState::Ready {
                debug!(channel = route.channel.target(), "dispatching on ready channel");
                return idx;
            }
            debug!(channel = route.channel.target(), %state, "channel not ready");
        }
        debug!(
            channel = self.routes[last].channel.target(),
            "no channel ready, falling back to last"
        );
        last
    }
}

/// An [`ExporterService`] that dispatches every call over a [`ChannelSet`].
#[derive(Clone)]
pub struct MultipathStub {
    channels: ChannelSet,
}

impl MultipathStub {
    pub fn new(channels: ChannelSet) -> Self {
        Self { channels }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    fn pick(&self) -> &Arc<dyn ExporterService> {
        &self.channels.routes[self.channels.select()].stub
    }
}

#[async_trait]
impl ExporterService for MultipathStub {
    async fn get_report(&self) -> Result<Vec<Report>, RpcError> {
        self.pick().get_report().await
    }

    async fn get_status(&self) -> Result<StatusResponse, RpcError> {
        self.pick().get_status().await
    }

    async fn driver_call(
        &self,
        uuid: Uuid,
        method: String,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.pick().driver_call(uuid, method, args).await
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
