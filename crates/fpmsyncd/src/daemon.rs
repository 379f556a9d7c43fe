//! fpmsyncd assembly
//!
//! Wires the link cache, the netlink handlers, the FPM server and the event
//! loop together from one [`FpmsyncConfig`].
//!
//! ```text
//!  FPM peer ──TCP──▶ FpmLink ──▶ Dispatcher ─┬─▶ LinkSync  ──▶ LinkCache
//!                       ▲                    ├─▶ RouteSync ──▶ ROUTE_TABLE
//!                       │                    └─▶ NeighSync ──▶ NEIGH_TABLE
//!                   EventLoop ── timeout ──▶ RouteSync (dump timeout)
//! ```

use crate::config::FpmsyncConfig;
use crate::dispatcher::HandlerRegistry;
use crate::error::Result;
use crate::fpm_link::FpmLink;
use crate::link_sync::{LinkCache, LinkSync, SharedLinkCache};
use crate::neigh_sync::NeighSync;
use crate::netlink::MessageKind;
use crate::producer_table::{
    ProducerTable, RedisProducerTable, APP_NEIGH_TABLE_NAME, APP_ROUTE_TABLE_NAME,
};
use crate::route_sync::RouteSync;
use crate::select::{EventLoop, SelectOutcome};
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::atomic::AtomicBool;
use tracing::{info, instrument};

/// The running daemon.
pub struct FpmSyncd {
    event_loop: EventLoop,
    link: Rc<RefCell<FpmLink>>,
    route_sync: Rc<RefCell<RouteSync>>,
    links: SharedLinkCache,
}

impl FpmSyncd {
    /// Build the daemon on top of the given producer tables.
    ///
    /// Binds the FPM listener, so it must run inside a tokio runtime.
    #[instrument(skip_all)]
    pub fn new(
        config: &FpmsyncConfig,
        route_table: Box<dyn ProducerTable>,
        neigh_table: Box<dyn ProducerTable>,
    ) -> Result<Self> {
        config.validate()?;

        let links = LinkCache::shared();
        let route_sync = Rc::new(RefCell::new(RouteSync::new(
            route_table,
            links.clone(),
            &config.routing,
        )));
        let neigh_sync = NeighSync::new(neigh_table, links.clone());

        let dispatcher = HandlerRegistry::builder()
            .register(&[MessageKind::Link], LinkSync::new(links.clone()))
            .register(&[MessageKind::Route, MessageKind::Done], route_sync.clone())
            .register(&[MessageKind::Neighbor], neigh_sync)
            .build();

        let link = Rc::new(RefCell::new(FpmLink::bind(&config.fpm, dispatcher)?));

        let mut event_loop = EventLoop::new(config.select_timeout());
        event_loop.add_source(link.clone());
        event_loop.add_periodic_task(route_sync.clone());

        info!(
            fpm = %config.fpm.socket_addr(),
            select_timeout_ms = config.event_loop.select_timeout_ms,
            "fpmsyncd initialized"
        );

        Ok(Self {
            event_loop,
            link,
            route_sync,
            links,
        })
    }

    /// Build the daemon writing to Redis APPL_DB.
    pub fn connect(config: &FpmsyncConfig) -> Result<Self> {
        let url = config.database.appl_db_url();
        let route_table = RedisProducerTable::connect(&url, APP_ROUTE_TABLE_NAME)?;
        let neigh_table = RedisProducerTable::connect(&url, APP_NEIGH_TABLE_NAME)?;
        Self::new(config, Box::new(route_table), Box::new(neigh_table))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.link.borrow().local_addr()
    }

    pub fn link(&self) -> &Rc<RefCell<FpmLink>> {
        &self.link
    }

    pub fn route_sync(&self) -> &Rc<RefCell<RouteSync>> {
        &self.route_sync
    }

    pub fn link_cache(&self) -> &SharedLinkCache {
        &self.links
    }

    pub fn event_loop(&self) -> &EventLoop {
        &self.event_loop
    }

    pub async fn run_once(&mut self) -> SelectOutcome {
        self.event_loop.run_once().await
    }

    pub async fn run(&mut self, shutdown: &AtomicBool) {
        self.event_loop.run(shutdown).await
    }
}
