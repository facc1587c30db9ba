//! Integration bus - priority-ordered pub/sub dispatch of lifecycle events
//!
//! Integration handlers subscribe to event kinds and are invoked
//! sequentially, in ascending priority order, on the emitter's thread.
//! A failing handler never blocks the handlers after it.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::types::{Event, EventKind};

/// Priority levels for integration handlers
///
/// Lower values run first. CRITICAL is reserved for handlers that must
/// observe every event before anything else reacts (analytics, tracking).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IntegrationPriority {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl IntegrationPriority {
    /// Numeric rank used for ordering (CRITICAL=0 .. BACKGROUND=40)
    pub fn rank(&self) -> u8 {
        match self {
            IntegrationPriority::Critical => 0,
            IntegrationPriority::High => 10,
            IntegrationPriority::Normal => 20,
            IntegrationPriority::Low => 30,
            IntegrationPriority::Background => 40,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntegrationPriority::Critical => "CRITICAL",
            IntegrationPriority::High => "HIGH",
            IntegrationPriority::Normal => "NORMAL",
            IntegrationPriority::Low => "LOW",
            IntegrationPriority::Background => "BACKGROUND",
        }
    }
}

/// Interface for cross-cutting event subscribers
///
/// Handlers are invoked on the emitter's thread and must return quickly;
/// long work should be offloaded. Errors are caught, counted, and logged
/// by the bus - they never propagate to the emitter.
pub trait IntegrationHandler: Send + Sync {
    /// Unique handler name, used for registration and diagnostics
    fn name(&self) -> &str;

    /// Execution priority (defaults to NORMAL)
    fn priority(&self) -> IntegrationPriority {
        IntegrationPriority::Normal
    }

    /// Event kinds this handler wants to receive
    fn subscriptions(&self) -> Vec<EventKind>;

    /// Whether the handler can currently be used
    fn is_available(&self) -> bool {
        true
    }

    /// Handle one event
    fn handle_event(&self, event: &Event) -> eyre::Result<()>;
}

/// Factory used to rebuild a handler for reload support
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn IntegrationHandler> + Send + Sync>;

struct Registered {
    handler: Arc<dyn IntegrationHandler>,
    factory: Option<HandlerFactory>,
    /// Registration sequence number, used to break priority ties
    order: u64,
}

#[derive(Default)]
struct Table {
    handlers: HashMap<String, Registered>,
    /// kind -> handler names, kept sorted by (priority rank, registration order)
    subscriptions: HashMap<EventKind, Vec<String>>,
    next_order: u64,
}

impl Table {
    fn resort(&mut self, kind: EventKind) {
        let Some(names) = self.subscriptions.get_mut(&kind) else {
            return;
        };
        let handlers = &self.handlers;
        names.sort_by_key(|n| {
            handlers
                .get(n)
                .map(|r| (r.handler.priority().rank(), r.order))
                .unwrap_or((u8::MAX, u64::MAX))
        });
    }
}

/// Bus statistics snapshot
#[derive(Clone, Debug, Default, Serialize)]
pub struct BusStats {
    pub events_emitted: u64,
    pub handlers_invoked: u64,
    pub errors_handled: u64,
    pub handlers_registered: usize,
    pub handlers_available: usize,
}

/// Diagnostic record for a single integration
#[derive(Clone, Debug, Serialize)]
pub struct IntegrationInfo {
    pub name: String,
    pub priority: &'static str,
    pub available: bool,
    pub subscriptions: Vec<&'static str>,
}

/// Central event bus for integration handlers
///
/// The handler table is guarded by a mutex; dispatch itself runs outside
/// the lock on a snapshot, so handlers may re-enter the bus.
pub struct IntegrationBus {
    table: Mutex<Table>,
    events_emitted: AtomicU64,
    handlers_invoked: AtomicU64,
    errors_handled: AtomicU64,
}

impl IntegrationBus {
    pub fn new() -> Self {
        debug!("IntegrationBus::new: creating bus");
        Self {
            table: Mutex::new(Table::default()),
            events_emitted: AtomicU64::new(0),
            handlers_invoked: AtomicU64::new(0),
            errors_handled: AtomicU64::new(0),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a handler, replacing any existing handler with the same name
    pub fn register(&self, handler: Arc<dyn IntegrationHandler>) {
        self.register_inner(handler, None);
    }

    /// Register a handler built from a factory, enabling [`IntegrationBus::reload_integration`]
    pub fn register_with_factory(&self, factory: HandlerFactory) {
        let handler = factory();
        self.register_inner(handler, Some(factory));
    }

    fn register_inner(&self, handler: Arc<dyn IntegrationHandler>, factory: Option<HandlerFactory>) {
        let name = handler.name().to_string();
        let mut table = self.table();

        if table.handlers.contains_key(&name) {
            warn!(%name, "Replacing existing integration");
            Self::remove_from_table(&mut table, &name);
        }

        let order = table.next_order;
        table.next_order += 1;

        let kinds = handler.subscriptions();
        debug!(%name, priority = handler.priority().as_str(), subscription_count = kinds.len(), "Registered integration");

        table.handlers.insert(
            name.clone(),
            Registered {
                handler,
                factory,
                order,
            },
        );

        for kind in kinds {
            table.subscriptions.entry(kind).or_default().push(name.clone());
            table.resort(kind);
        }
    }

    fn remove_from_table(table: &mut Table, name: &str) -> Option<Registered> {
        let removed = table.handlers.remove(name)?;
        for names in table.subscriptions.values_mut() {
            names.retain(|n| n != name);
        }
        Some(removed)
    }

    /// Unregister a handler by name; returns true if one was removed
    pub fn unregister(&self, name: &str) -> bool {
        let mut table = self.table();
        let removed = Self::remove_from_table(&mut table, name).is_some();
        if removed {
            debug!(%name, "Unregistered integration");
        }
        removed
    }

    /// Emit an event to all subscribed handlers
    ///
    /// Delivery is sequential in ascending priority order; registration
    /// order breaks ties. Unavailable handlers are skipped. A handler
    /// error (or panic) is counted and logged, and dispatch continues.
    pub fn emit(&self, event: &Event) {
        self.events_emitted.fetch_add(1, Ordering::Relaxed);

        let snapshot: Vec<Arc<dyn IntegrationHandler>> = {
            let table = self.table();
            let Some(names) = table.subscriptions.get(&event.kind) else {
                debug!(kind = event.kind.as_str(), "No handlers for event");
                return;
            };
            names
                .iter()
                .filter_map(|n| table.handlers.get(n).map(|r| r.handler.clone()))
                .collect()
        };

        debug!(
            kind = event.kind.as_str(),
            stage = %event.stage,
            handler_count = snapshot.len(),
            "IntegrationBus::emit"
        );

        for handler in snapshot {
            if !handler.is_available() {
                debug!(name = handler.name(), "Handler not available, skipping");
                continue;
            }

            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle_event(event)));
            match outcome {
                Ok(Ok(())) => {
                    self.handlers_invoked.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.handlers_invoked.fetch_add(1, Ordering::Relaxed);
                    self.errors_handled.fetch_add(1, Ordering::Relaxed);
                    warn!(name = handler.name(), kind = event.kind.as_str(), error = %e, "Integration handler failed");
                }
                Err(_) => {
                    self.handlers_invoked.fetch_add(1, Ordering::Relaxed);
                    self.errors_handled.fetch_add(1, Ordering::Relaxed);
                    warn!(name = handler.name(), kind = event.kind.as_str(), "Integration handler panicked");
                }
            }
        }
    }

    /// Rebuild a handler from its registered factory
    ///
    /// Unregisters the handler, invokes the factory, and registers the
    /// fresh instance. Handlers registered without a factory cannot be
    /// reloaded. On factory panic the original handler is restored.
    pub fn reload_integration(&self, name: &str) -> bool {
        let (handler, factory) = {
            let table = self.table();
            match table.handlers.get(name) {
                Some(r) => (r.handler.clone(), r.factory.clone()),
                None => {
                    warn!(%name, "Cannot reload unknown integration");
                    return false;
                }
            }
        };

        let Some(factory) = factory else {
            warn!(%name, "Integration has no factory, cannot reload");
            return false;
        };

        self.unregister(name);

        match catch_unwind(AssertUnwindSafe(|| factory())) {
            Ok(fresh) => {
                self.register_inner(fresh, Some(factory));
                debug!(%name, "Reloaded integration");
                true
            }
            Err(_) => {
                warn!(%name, "Integration factory panicked, restoring original");
                self.register(handler);
                false
            }
        }
    }

    /// Reload every registered integration; returns per-handler success
    pub fn reload_all(&self) -> HashMap<String, bool> {
        let names: Vec<String> = self.table().handlers.keys().cloned().collect();
        names
            .into_iter()
            .map(|n| {
                let ok = self.reload_integration(&n);
                (n, ok)
            })
            .collect()
    }

    /// Get a registered handler by name
    pub fn get_handler(&self, name: &str) -> Option<Arc<dyn IntegrationHandler>> {
        self.table().handlers.get(name).map(|r| r.handler.clone())
    }

    /// Diagnostic record for one integration
    pub fn get_integration_info(&self, name: &str) -> Option<IntegrationInfo> {
        let table = self.table();
        let registered = table.handlers.get(name)?;
        Some(IntegrationInfo {
            name: registered.handler.name().to_string(),
            priority: registered.handler.priority().as_str(),
            available: registered.handler.is_available(),
            subscriptions: registered
                .handler
                .subscriptions()
                .iter()
                .map(|k| k.as_str())
                .collect(),
        })
    }

    /// Bus counters plus registration summary
    pub fn get_stats(&self) -> BusStats {
        let table = self.table();
        let available = table
            .handlers
            .values()
            .filter(|r| r.handler.is_available())
            .count();
        BusStats {
            events_emitted: self.events_emitted.load(Ordering::Relaxed),
            handlers_invoked: self.handlers_invoked.load(Ordering::Relaxed),
            errors_handled: self.errors_handled.load(Ordering::Relaxed),
            handlers_registered: table.handlers.len(),
            handlers_available: available,
        }
    }
}

impl Default for IntegrationBus {
    fn default() -> Self {
        Self::new()
    }
}
