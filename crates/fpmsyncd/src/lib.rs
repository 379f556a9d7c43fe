//! FPM Synchronization Daemon for SONiC
//!
//! This crate provides the Rust implementation of fpmsyncd. The routing
//! daemon streams route, neighbor and link updates over the Forwarding Plane
//! Manager (FPM) TCP protocol; fpmsyncd frames that byte stream, decodes the
//! netlink payloads, and publishes the result to SONiC's Redis APPL_DB.
//!
//! # NIST 800-53 Rev 5 Control Mappings
//!
//! This module implements the following security controls:
//!
//! | Control | Description | Implementation |
//! |---------|-------------|----------------|
//! | AU-3 | Content of Audit Records | Structured logging with peer and message details |
//! | AU-12 | Audit Record Generation | Connection lifecycle and route changes logged |
//! | CM-6 | Configuration Settings | TOML configuration file |
//! | CM-8 | System Component Inventory | Link cache and route table |
//! | SC-5 | DoS Protection | Bounded framing arena, single FPM peer |
//! | SC-7 | Boundary Protection | Loopback-only listener by default |
//! | SI-4 | System Monitoring | Real-time route monitoring |
//! | SI-10 | Input Validation | FPM header and netlink validation |
//! | SI-11 | Error Handling | Structured error types |
//!
//! # Architecture
//!
//! ```text
//! +----------------+       +----------------------------------+       +----------------+
//! |  Routing       |       |            fpmsyncd              |       |  Redis (SONiC) |
//! |  daemon (FPM)  |       |                                  |       |                |
//! |                |--TCP->|  FpmLink -> FramingBuffer        |       |    APPL_DB     |
//! |  RTM_NEWROUTE  |       |     |                            |       |                |
//! |  RTM_NEWNEIGH  |       |     v                            |       |                |
//! |  RTM_NEWLINK   |       |  NetlinkDecoder -> Dispatcher    |       |                |
//! |                |       |     +-> LinkSync  (LinkCache)    |       |                |
//! |                |       |     +-> RouteSync ---------------|------>|  ROUTE_TABLE   |
//! |                |       |     +-> NeighSync ---------------|------>|  NEIGH_TABLE   |
//! +----------------+       |                                  |       +----------------+
//!                          |  EventLoop (select + timeouts)   |
//!                          +----------------------------------+
//! ```

pub mod config;
pub mod daemon;
pub mod dispatcher;
pub mod error;
pub mod fpm_link;
pub mod framing;
pub mod link_sync;
pub mod neigh_sync;
pub mod netlink;
pub mod producer_table;
pub mod resync;
pub mod route_sync;
pub mod select;
pub mod types;

pub use config::FpmsyncConfig;
pub use daemon::FpmSyncd;
pub use dispatcher::{DispatchStats, Dispatcher, HandlerRegistry, NetlinkHandler};
pub use error::{DecodeError, FpmError, FramingError, Result};
pub use fpm_link::{FpmLink, LinkStats};
pub use framing::{
    encode_message, FpmMessageType, FramingBuffer, MessageHeader, MessageValidator, RawMessage,
};
pub use link_sync::{LinkCache, LinkSync};
pub use neigh_sync::NeighSync;
pub use netlink::{DecodedNetlinkObject, MessageKind, NetlinkDecoder};
pub use producer_table::{MemoryProducerTable, ProducerTable, RedisProducerTable};
pub use route_sync::RouteSync;
pub use select::{EventLoop, PeriodicTask, SelectOutcome, Selectable};
pub use types::{MacAddress, NeighborState};
