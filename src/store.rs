/*!
 # Persistence

 Rules and configuration are kept as two small JSON files. Loading never
 fails: a missing, unreadable or invalid file falls back to defaults so the
 device always boots.
*/

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::schedule::{RuleRecord, RuleSet};
use crate::{Error, Result};

pub const RULES_FILE: &str = "schedules.json";
pub const CONFIG_FILE: &str = "zebrascent.json";

/// Where rules and configuration live between boots
pub trait Persistence: Send {
    fn load_rules(&self) -> RuleSet;
    fn save_rules(&mut self, rules: &RuleSet) -> Result<()>;
    fn load_config(&self) -> Config;
    fn save_config(&mut self, config: &Config) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RulesFile {
    rules: Vec<RuleRecord>,
}

/// JSON files in one directory
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Uses `dir`, creating it if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        debug!("Using data directory {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read(&self, name: &str) -> Option<String> {
        let path = self.dir.join(name);
        match fs::read_to_string(&path) {
            Ok(text) => Some(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("{} not found, using defaults", path.display());
                None
            }
            Err(e) => {
                warn!("Could not read {}: {}, using defaults", path.display(), e);
                None
            }
        }
    }

    /// Writes through a temporary file so a power cut never leaves half a file
    fn write(&self, name: &str, text: &str) -> Result<()> {
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        debug!("Wrote {} ({} bytes)", path.display(), text.len());
        Ok(())
    }
}

impl Persistence for FileStore {
    #[instrument(skip(self))]
    fn load_rules(&self) -> RuleSet {
        let Some(text) = self.read(RULES_FILE) else {
            return RuleSet::default();
        };
        let parsed = serde_json::from_str::<RulesFile>(&text)
            .map_err(Error::from)
            .and_then(|file| RuleSet::from_records(&file.rules));
        match parsed {
            Ok(rules) => {
                info!("Loaded {} enabled rule(s)", rules.enabled_count());
                rules
            }
            Err(e) => {
                warn!("Ignoring stored rules: {}", e);
                RuleSet::default()
            }
        }
    }

    #[instrument(skip(self, rules))]
    fn save_rules(&mut self, rules: &RuleSet) -> Result<()> {
        let text = serde_json::to_string(&RulesFile {
            rules: rules.to_records(),
        })?;
        self.write(RULES_FILE, &text)
    }

    #[instrument(skip(self))]
    fn load_config(&self) -> Config {
        let Some(text) = self.read(CONFIG_FILE) else {
            return Config::default();
        };
        let parsed = serde_json::from_str::<Config>(&text)
            .map_err(Error::from)
            .and_then(|cfg| cfg.validate().map(|_| cfg));
        match parsed {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!("Ignoring stored configuration: {}", e);
                Config::default()
            }
        }
    }

    #[instrument(skip(self, config))]
    fn save_config(&mut self, config: &Config) -> Result<()> {
        let text = serde_json::to_string_pretty(config)?;
        self.write(CONFIG_FILE, &text)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    rules: Option<RuleSet>,
    config: Option<Config>,
    fail_writes: bool,
    writes: usize,
}

/// Store kept in memory, shared between clones.
///
/// Lets callers run the controller without a filesystem and inspect what
/// would have been written.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following save fail with an I/O error
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    pub fn writes(&self) -> usize {
        self.inner.lock().writes
    }

    pub fn stored_rules(&self) -> Option<RuleSet> {
        self.inner.lock().rules
    }

    pub fn stored_config(&self) -> Option<Config> {
        self.inner.lock().config.clone()
    }

    fn check(inner: &MemoryInner) -> Result<()> {
        if inner.fail_writes {
            return Err(Error::Io(std::io::Error::other("store is read-only")));
        }
        Ok(())
    }
}

impl Persistence for MemoryStore {
    fn load_rules(&self) -> RuleSet {
        self.inner.lock().rules.unwrap_or_default()
    }

    fn save_rules(&mut self, rules: &RuleSet) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check(&inner)?;
        inner.rules = Some(*rules);
        inner.writes += 1;
        Ok(())
    }

    fn load_config(&self) -> Config {
        self.inner.lock().config.clone().unwrap_or_default()
    }

    fn save_config(&mut self, config: &Config) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check(&inner)?;
        inner.config = Some(config.clone());
        inner.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Channel;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "zebra-scent-store-{}-{}",
            name,
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    fn sample_rules() -> RuleSet {
        RuleSet::from_records(&[RuleRecord {
            en: true,
            ch: 3,
            s: 480,
            e: 540,
            d: 0x7F,
        }])
        .unwrap()
    }

    #[test]
    fn missing_files_give_defaults() {
        let store = FileStore::open(temp_dir("missing")).unwrap();
        assert_eq!(store.load_rules(), RuleSet::default());
        assert_eq!(store.load_config(), Config::default());
    }

    #[test]
    fn rules_survive_a_reboot() {
        let dir = temp_dir("rules");
        let mut store = FileStore::open(&dir).unwrap();
        store.save_rules(&sample_rules()).unwrap();

        let reopened = FileStore::open(&dir).unwrap();
        assert_eq!(reopened.load_rules(), sample_rules());

        let text = fs::read_to_string(dir.join(RULES_FILE)).unwrap();
        assert!(text.starts_with(r#"{"rules":[{"en":true,"ch":3,"s":480,"e":540,"d":127}"#));
    }

    #[test]
    fn config_survives_a_reboot() {
        let dir = temp_dir("config");
        let mut store = FileStore::open(&dir).unwrap();
        let cfg = Config::default()
            .with_names(&["Vanilla".into()])
            .unwrap();
        store.save_config(&cfg).unwrap();

        let loaded = FileStore::open(&dir).unwrap().load_config();
        assert_eq!(loaded.names.get(Channel::new(1).unwrap()), "Vanilla");
    }

    #[test]
    fn corrupt_or_invalid_files_fall_back_to_defaults() {
        let dir = temp_dir("corrupt");
        let store = FileStore::open(&dir).unwrap();
        fs::write(dir.join(RULES_FILE), "{ not json").unwrap();
        assert_eq!(store.load_rules(), RuleSet::default());

        fs::write(dir.join(RULES_FILE), r#"{"rules":[{"en":true,"ch":12}]}"#).unwrap();
        assert_eq!(store.load_rules(), RuleSet::default());

        fs::write(dir.join(CONFIG_FILE), r#"{"mqttPort":0}"#).unwrap();
        assert_eq!(store.load_config(), Config::default());
    }

    #[test]
    fn memory_store_can_refuse_writes() {
        let mut store = MemoryStore::new();
        store.fail_writes(true);
        assert!(matches!(store.save_rules(&sample_rules()), Err(Error::Io(_))));
        assert_eq!(store.stored_rules(), None);

        store.fail_writes(false);
        store.save_rules(&sample_rules()).unwrap();
        assert_eq!(store.clone().load_rules(), sample_rules());
        assert_eq!(store.writes(), 1);
    }
}
