//! Persistence collaborator.
//!
//! The server never touches storage formats. It asks a
//! [`PersistenceBackend`] to load or save named stores and logs whatever
//! goes wrong; a failed save never stops the server or a shutdown.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// A unit of persistent state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Store {
    /// Known players and their attributes.
    PlayerDb,
    /// Banned names and addresses.
    BanList,
    /// One world, by name.
    World(String),
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PlayerDb => f.write_str("player database"),
            Self::BanList => f.write_str("ban list"),
            Self::World(name) => write!(f, "world '{name}'"),
        }
    }
}

/// Errors reported by a persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Reading or writing the store failed.
    #[error("I/O error on {store}: {source}")]
    Io {
        store: Store,
        #[source]
        source: std::io::Error,
    },

    /// The stored data could not be encoded or decoded.
    #[error("bad data in {store}: {message}")]
    Format { store: Store, message: String },

    /// The backend cannot serve requests right now.
    #[error("persistence unavailable: {0}")]
    Unavailable(String),
}

/// Loads and saves the server's stores.
pub trait PersistenceBackend: Send + Sync + 'static {
    fn load(&self, store: &Store) -> Result<(), PersistenceError>;

    fn save(&self, store: &Store) -> Result<(), PersistenceError>;

    /// Names of the worlds that should be loaded and saved.
    fn world_names(&self) -> Vec<String>;

    /// Releases memory or on-disk slack. Called from the background worker
    /// when a compaction was requested. The default does nothing.
    fn compact(&self) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Keeps nothing. For servers without storage and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

impl PersistenceBackend for NullPersistence {
    fn load(&self, _store: &Store) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn save(&self, _store: &Store) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn world_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Every store the backend knows about: player db, ban list, then worlds.
pub(crate) fn all_stores(backend: &dyn PersistenceBackend) -> Vec<Store> {
    let mut stores = vec![Store::PlayerDb, Store::BanList];
    stores.extend(backend.world_names().into_iter().map(Store::World));
    stores
}

/// Loads every store. Returns how many failed; each failure is logged.
pub(crate) fn load_all(backend: &dyn PersistenceBackend) -> usize {
    for_each_store(backend, "load", |store| backend.load(store))
}

/// Saves every store. Returns how many failed; each failure is logged.
pub(crate) fn save_all(backend: &dyn PersistenceBackend) -> usize {
    for_each_store(backend, "save", |store| backend.save(store))
}

fn for_each_store(
    backend: &dyn PersistenceBackend,
    action: &'static str,
    op: impl Fn(&Store) -> Result<(), PersistenceError>,
) -> usize {
    let stores = match catch_unwind(AssertUnwindSafe(|| all_stores(backend))) {
        Ok(stores) => stores,
        Err(_) => {
            tracing::error!(action, "persistence backend panicked listing worlds");
            vec![Store::PlayerDb, Store::BanList]
        }
    };
    let mut failures = 0;
    for store in &stores {
        match catch_unwind(AssertUnwindSafe(|| op(store))) {
            Ok(Ok(())) => tracing::debug!(%store, action, "store done"),
            Ok(Err(e)) => {
                failures += 1;
                tracing::error!(%store, action, error = %e, "persistence failed");
            }
            Err(_) => {
                failures += 1;
                tracing::error!(%store, action, "persistence backend panicked");
            }
        }
    }
    failures
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Recording {
        saved: Mutex<Vec<Store>>,
        fail_on: Option<Store>,
    }

    impl PersistenceBackend for Recording {
        fn load(&self, _store: &Store) -> Result<(), PersistenceError> {
            Ok(())
        }

        fn save(&self, store: &Store) -> Result<(), PersistenceError> {
            if self.fail_on.as_ref() == Some(store) {
                return Err(PersistenceError::Unavailable("disk full".into()));
            }
            self.saved.lock().push(store.clone());
            Ok(())
        }

        fn world_names(&self) -> Vec<String> {
            vec!["main".into(), "nether".into()]
        }
    }

    #[test]
    fn test_all_stores_lists_fixed_stores_then_worlds() {
        let backend = Recording {
            saved: Mutex::new(Vec::new()),
            fail_on: None,
        };
        assert_eq!(
            all_stores(&backend),
            vec![
                Store::PlayerDb,
                Store::BanList,
                Store::World("main".into()),
                Store::World("nether".into()),
            ]
        );
    }

    #[test]
    fn test_save_all_failure_continues_with_remaining_stores() {
        let backend = Recording {
            saved: Mutex::new(Vec::new()),
            fail_on: Some(Store::BanList),
        };
        assert_eq!(save_all(&backend), 1);
        assert_eq!(backend.saved.lock().len(), 3);
    }

    #[test]
    fn test_save_all_panicking_backend_is_contained() {
        struct Panics;
        impl PersistenceBackend for Panics {
            fn load(&self, _: &Store) -> Result<(), PersistenceError> {
                Ok(())
            }
            fn save(&self, _: &Store) -> Result<(), PersistenceError> {
                panic!("boom")
            }
            fn world_names(&self) -> Vec<String> {
                Vec::new()
            }
        }
        assert_eq!(save_all(&Panics), 2);
    }

    #[test]
    fn test_store_display() {
        assert_eq!(Store::World("main".into()).to_string(), "world 'main'");
        assert_eq!(Store::PlayerDb.to_string(), "player database");
    }
}
