//! Dispatch of decoded netlink objects to per-kind handlers
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Only registered message kinds reach handlers
//! - AU-12: Audit Record Generation - Handler failures are logged with message context

use crate::error::{FpmError, Result};
use crate::netlink::{DecodedNetlinkObject, MessageKind};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use tracing::{trace, warn};

/// Consumer of decoded netlink objects of one or more kinds.
///
/// Handlers run synchronously on the event loop thread and must not block.
/// Returning an error drops the object; the stream continues.
pub trait NetlinkHandler {
    fn name(&self) -> &str;

    fn on_netlink_message(&mut self, msg: &DecodedNetlinkObject<'_>) -> Result<()>;
}

impl<T: NetlinkHandler> NetlinkHandler for Rc<RefCell<T>> {
    fn name(&self) -> &str {
        // Diagnostics only; must not hold a borrow.
        std::any::type_name::<T>()
    }

    fn on_netlink_message(&mut self, msg: &DecodedNetlinkObject<'_>) -> Result<()> {
        let mut inner = self
            .try_borrow_mut()
            .map_err(|_| FpmError::Internal("re-entrant netlink handler".into()))?;
        inner.on_netlink_message(msg)
    }
}

/// Counters maintained by the [`Dispatcher`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStats {
    /// Objects accepted by a handler.
    pub dispatched: u64,
    /// Objects with no registered handler.
    pub unhandled: u64,
    /// Objects a handler rejected.
    pub failed: u64,
}

/// Builder for the immutable kind -> handler mapping.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn NetlinkHandler>>,
    routes: BTreeMap<MessageKind, usize>,
}

impl HandlerRegistry {
    pub fn builder() -> Self {
        Self::default()
    }

    /// Register `handler` for every kind in `kinds`.
    ///
    /// A later registration for the same kind replaces the earlier one.
    pub fn register<H>(mut self, kinds: &[MessageKind], handler: H) -> Self
    where
        H: NetlinkHandler + 'static,
    {
        let index = self.handlers.len();
        self.handlers.push(Box::new(handler));
        for kind in kinds {
            self.routes.insert(*kind, index);
        }
        self
    }

    pub fn build(self) -> Dispatcher {
        Dispatcher {
            registry: self,
            stats: DispatchStats::default(),
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.routes.keys().collect::<Vec<_>>())
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Routes decoded objects to their handler.
#[derive(Debug)]
pub struct Dispatcher {
    registry: HandlerRegistry,
    stats: DispatchStats,
}

impl Dispatcher {
    /// True if a handler is registered for `kind`.
    pub fn handles(&self, kind: MessageKind) -> bool {
        self.registry.routes.contains_key(&kind)
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Hand `msg` to the handler registered for its kind.
    ///
    /// Never fails: unregistered kinds are dropped and handler errors are
    /// logged and counted.
    pub fn dispatch(&mut self, msg: &DecodedNetlinkObject<'_>) {
        let index = msg
            .kind
            .and_then(|kind| self.registry.routes.get(&kind).copied());

        let Some(handler) = index.and_then(|i| self.registry.handlers.get_mut(i)) else {
            trace!(
                message_type = msg.header.message_type,
                "No handler registered, dropping netlink message"
            );
            self.stats.unhandled += 1;
            return;
        };

        match handler.on_netlink_message(msg) {
            Ok(()) => self.stats.dispatched += 1,
            Err(e) => {
                self.stats.failed += 1;
                warn!(
                    handler = handler.name(),
                    kind = ?msg.kind,
                    message_type = msg.header.message_type,
                    seq = msg.header.sequence,
                    error = %e,
                    "Netlink handler rejected message"
                );
            }
        }
    }
}
