//! JSON files in a data directory, one per store.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use blockforge::{PersistenceBackend, PersistenceError, Store};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub first_seen: u64,
    pub last_seen: u64,
    pub logins: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldMeta {
    pub spawn: [i32; 3],
    pub created: u64,
}

impl Default for WorldMeta {
    fn default() -> Self {
        Self {
            spawn: [0, 64, 0],
            created: unix_now(),
        }
    }
}

#[derive(Default)]
struct Data {
    players: BTreeMap<String, PlayerRecord>,
    bans: BTreeSet<String>,
    worlds: BTreeMap<String, WorldMeta>,
}

pub struct JsonStorage {
    dir: PathBuf,
    data: Mutex<Data>,
}

impl JsonStorage {
    /// Opens (creating if needed) a data directory. `worlds` names the
    /// worlds to keep; each gets a default file on first save.
    pub fn open(dir: impl Into<PathBuf>, worlds: &[&str]) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join("worlds"))?;
        let data = Data {
            worlds: worlds
                .iter()
                .map(|w| (w.to_string(), WorldMeta::default()))
                .collect(),
            ..Data::default()
        };
        Ok(Self {
            dir,
            data: Mutex::new(data),
        })
    }

    pub fn record_login(&self, name: &str) {
        let now = unix_now();
        let mut data = self.data.lock();
        let record = data.players.entry(name.to_lowercase()).or_insert_with(|| PlayerRecord {
            first_seen: now,
            ..PlayerRecord::default()
        });
        record.last_seen = now;
        record.logins += 1;
    }

    pub fn is_banned(&self, name: &str) -> bool {
        self.data.lock().bans.contains(&name.to_lowercase())
    }

    pub fn ban(&self, name: &str) -> bool {
        self.data.lock().bans.insert(name.to_lowercase())
    }

    pub fn known_players(&self) -> usize {
        self.data.lock().players.len()
    }

    fn path_for(&self, store: &Store) -> PathBuf {
        match store {
            Store::PlayerDb => self.dir.join("players.json"),
            Store::BanList => self.dir.join("bans.json"),
            Store::World(name) => self.dir.join("worlds").join(format!("{name}.json")),
        }
    }
}

impl PersistenceBackend for JsonStorage {
    fn load(&self, store: &Store) -> Result<(), PersistenceError> {
        let path = self.path_for(store);
        if !path.exists() {
            return Ok(());
        }
        let mut data = self.data.lock();
        match store {
            Store::PlayerDb => data.players = read_json(store, &path)?,
            Store::BanList => data.bans = read_json(store, &path)?,
            Store::World(name) => {
                let meta = read_json(store, &path)?;
                data.worlds.insert(name.clone(), meta);
            }
        }
        Ok(())
    }

    fn save(&self, store: &Store) -> Result<(), PersistenceError> {
        let path = self.path_for(store);
        let json = {
            let data = self.data.lock();
            match store {
                Store::PlayerDb => serde_json::to_vec_pretty(&data.players),
                Store::BanList => serde_json::to_vec_pretty(&data.bans),
                Store::World(name) => match data.worlds.get(name) {
                    Some(meta) => serde_json::to_vec_pretty(meta),
                    None => return Ok(()),
                },
            }
        }
        .map_err(|e| PersistenceError::Format {
            store: store.clone(),
            message: e.to_string(),
        })?;
        write_atomically(&path, &json).map_err(|source| PersistenceError::Io {
            store: store.clone(),
            source,
        })
    }

    fn world_names(&self) -> Vec<String> {
        self.data.lock().worlds.keys().cloned().collect()
    }

    /// Removes temp files left behind by interrupted saves.
    fn compact(&self) -> Result<(), PersistenceError> {
        let mut removed = 0;
        for dir in [self.dir.clone(), self.dir.join("worlds")] {
            let entries = fs::read_dir(&dir).map_err(|e| PersistenceError::Unavailable(e.to_string()))?;
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "tmp") && fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }
        tracing::info!(removed, "removed stale temp files");
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(store: &Store, path: &Path) -> Result<T, PersistenceError> {
    let bytes = fs::read(path).map_err(|source| PersistenceError::Io {
        store: store.clone(),
        source,
    })?;
    serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Format {
        store: store.clone(),
        message: e.to_string(),
    })
}

fn write_atomically(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sandbox-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn test_save_then_load_restores_players_and_bans() {
        let dir = temp_dir("roundtrip");
        let storage = JsonStorage::open(&dir, &["main"]).unwrap();
        storage.record_login("Bob");
        storage.ban("Griefer");
        for store in [Store::PlayerDb, Store::BanList, Store::World("main".into())] {
            storage.save(&store).unwrap();
        }

        let reopened = JsonStorage::open(&dir, &[]).unwrap();
        reopened.load(&Store::PlayerDb).unwrap();
        reopened.load(&Store::BanList).unwrap();
        assert_eq!(reopened.known_players(), 1);
        assert!(reopened.is_banned("griefer"));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_corrupt_file_returns_format_error() {
        let dir = temp_dir("corrupt");
        let storage = JsonStorage::open(&dir, &[]).unwrap();
        fs::write(dir.join("bans.json"), b"{ not json").unwrap();

        let err = storage.load(&Store::BanList).unwrap_err();
        assert!(matches!(err, PersistenceError::Format { .. }));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_compact_removes_temp_files() {
        let dir = temp_dir("compact");
        let storage = JsonStorage::open(&dir, &[]).unwrap();
        fs::write(dir.join("players.json.tmp"), b"{}").unwrap();

        storage.compact().unwrap();
        assert!(!dir.join("players.json.tmp").exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
