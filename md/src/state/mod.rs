//! Mission state - the record and its persistence

mod record;
mod store;

pub use record::{CycleSummary, HistoryEntry, MissionRecord};
pub use store::{StateError, StateStore};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Shared handle to the state store
///
/// The store is the single writer of the mission file; components that
/// need it share one handle and take the lock for the duration of each
/// operation.
pub type SharedState = Arc<Mutex<StateStore>>;

/// Wrap a store for sharing
pub fn shared(store: StateStore) -> SharedState {
    Arc::new(Mutex::new(store))
}

/// Lock a shared store, recovering from poisoning
pub fn lock(state: &SharedState) -> MutexGuard<'_, StateStore> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
