//! Persisted endpoint settings.
//!
//! A small versioned record (volume, mic gain, auto-answer and AEC flags)
//! stored through an external key/value store under one stable key. Loaded
//! at startup; saves are debounced 250 ms after any mutation so slider
//! drags do not hammer the store.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::SettingsError;

/// Current record version.
pub const SETTINGS_VERSION: u8 = 1;

/// Auto-answer incoming calls.
pub const FLAG_AUTO_ANSWER: u8 = 1 << 0;
/// Echo cancellation enabled.
pub const FLAG_AEC: u8 = 1 << 1;

/// Debounce window between a mutation and the store write.
pub const SAVE_DEBOUNCE: Duration = Duration::from_millis(250);

/// External key/value persistence seam.
pub trait SettingsStore: Send {
    fn load(&mut self, key: &str) -> Option<Vec<u8>>;
    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), SettingsError>;
}

/// In-memory store for tests and hosts without persistence.
#[derive(Default)]
pub struct MemoryStore {
    entries: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemoryStore {
    fn load(&mut self, key: &str) -> Option<Vec<u8>> {
        self.entries.get(key).cloned()
    }

    fn store(&mut self, key: &str, value: &[u8]) -> Result<(), SettingsError> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// The persisted record. Fixed 4-byte layout, version first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredSettings {
    pub version: u8,
    /// Output volume, percent 0..=100.
    pub volume_pct: u8,
    /// Mic gain in whole dB, -20..=20.
    pub mic_gain_db: i8,
    pub flags: u8,
}

impl Default for StoredSettings {
    fn default() -> Self {
        Self {
            version: SETTINGS_VERSION,
            volume_pct: 100,
            mic_gain_db: 0,
            flags: FLAG_AUTO_ANSWER,
        }
    }
}

impl StoredSettings {
    pub fn to_bytes(&self) -> [u8; 4] {
        [
            self.version,
            self.volume_pct,
            self.mic_gain_db as u8,
            self.flags,
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SettingsError> {
        if bytes.len() < 4 {
            return Err(SettingsError::Corrupt);
        }
        if bytes[0] != SETTINGS_VERSION {
            return Err(SettingsError::Version(bytes[0]));
        }
        Ok(Self {
            version: bytes[0],
            volume_pct: bytes[1].min(100),
            mic_gain_db: (bytes[2] as i8).clamp(-20, 20),
            flags: bytes[3],
        })
    }

    pub fn auto_answer(&self) -> bool {
        self.flags & FLAG_AUTO_ANSWER != 0
    }

    pub fn aec(&self) -> bool {
        self.flags & FLAG_AEC != 0
    }

    pub fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}

/// Debounced writer around a [`SettingsStore`].
pub struct SettingsSaver {
    store: Box<dyn SettingsStore>,
    key: String,
    current: StoredSettings,
    due: Option<Instant>,
}

impl SettingsSaver {
    pub fn new(store: Box<dyn SettingsStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            current: StoredSettings::default(),
            due: None,
        }
    }

    /// Set the in-memory record without scheduling a save. Used to apply
    /// configuration defaults before [`SettingsSaver::load`].
    pub fn seed(&mut self, settings: StoredSettings) {
        self.current = settings;
    }

    /// Load the stored record, falling back to defaults on absence,
    /// version mismatch or corruption.
    pub fn load(&mut self) -> StoredSettings {
        match self.store.load(&self.key) {
            Some(bytes) => match StoredSettings::from_bytes(&bytes) {
                Ok(settings) => {
                    tracing::info!(
                        volume_pct = settings.volume_pct,
                        mic_gain_db = settings.mic_gain_db,
                        "loaded settings"
                    );
                    self.current = settings;
                    settings
                }
                Err(e) => {
                    tracing::warn!("ignoring stored settings: {e}");
                    self.current
                }
            },
            None => {
                tracing::info!("no saved settings, using defaults");
                self.current
            }
        }
    }

    pub fn current(&self) -> StoredSettings {
        self.current
    }

    /// Mutate the record and schedule a debounced save.
    pub fn update(&mut self, mutate: impl FnOnce(&mut StoredSettings)) {
        mutate(&mut self.current);
        self.current.version = SETTINGS_VERSION;
        if self.due.is_none() {
            self.due = Some(Instant::now() + SAVE_DEBOUNCE);
        }
    }

    /// Write the record if a scheduled save has come due. Polled from the
    /// net task's loop.
    pub fn flush_due(&mut self, now: Instant) {
        let Some(due) = self.due else {
            return;
        };
        if now < due {
            return;
        }
        self.due = None;
        match self.store.store(&self.key, &self.current.to_bytes()) {
            Ok(()) => tracing::debug!(
                volume_pct = self.current.volume_pct,
                mic_gain_db = self.current.mic_gain_db,
                flags = self.current.flags,
                "saved settings"
            ),
            Err(e) => tracing::warn!("settings save failed: {e}"),
        }
    }

    /// Force out any pending save, debounce notwithstanding.
    pub fn flush_now(&mut self) {
        if self.due.take().is_some() {
            if let Err(e) = self.store.store(&self.key, &self.current.to_bytes()) {
                tracing::warn!("settings save failed: {e}");
            }
        }
    }
}
