use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

use crate::dimensions::ActiveDimension;
use crate::error::Result;
use crate::logging;
use crate::session::SessionState;
use crate::settings::Settings;

const SETTINGS_KEY: &str = "settings";
const SESSION_KEY: &str = "session";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StoredCalibration {
    pub character_key: String,
    pub profile_hash: String,
    pub dimensions: Vec<ActiveDimension>,
    /// Operator-edited; never invalidated by a profile change.
    pub manual: bool,
    pub updated_at: String,
}

/// One row of the cross-session report index.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReportIndexEntry {
    pub id: String,
    pub chat_id: String,
    pub character: String,
    pub model: Option<String>,
    pub resilience: f64,
    pub quality: f64,
    pub compatibility: f64,
    pub messages_scored: i64,
    pub corrections_injected: i64,
    pub created_at: String,
}

/// Global settings, per-chat metadata, calibration cache and report index.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            -- Global key-value settings
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Per-chat metadata (session state lives under key 'session')
            CREATE TABLE IF NOT EXISTS chat_metadata (
                chat_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (chat_id, key)
            );

            -- Calibrated dimensions per character
            CREATE TABLE IF NOT EXISTS calibrations (
                character_key TEXT PRIMARY KEY,
                profile_hash TEXT NOT NULL,
                dimensions TEXT NOT NULL,
                manual INTEGER DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            -- Cross-session report index
            CREATE TABLE IF NOT EXISTS report_index (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL,
                character TEXT NOT NULL,
                model TEXT,
                resilience REAL NOT NULL,
                quality REAL NOT NULL,
                compatibility REAL NOT NULL,
                messages_scored INTEGER DEFAULT 0,
                corrections_injected INTEGER DEFAULT 0,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_report_index_chat ON report_index(chat_id);
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T>,
    {
        // A panic while holding the lock leaves SQLite itself consistent.
        let conn = self
            .conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Ok(f(&conn)?)
    }

    // ============ Settings ============

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, now],
            )?;
            Ok(())
        })
    }

    /// Stored settings merged over defaults. Unreadable JSON yields defaults.
    pub fn load_settings(&self) -> Result<Settings> {
        let stored = match self.get_setting(SETTINGS_KEY)? {
            Some(raw) => serde_json::from_str::<Value>(&raw).unwrap_or_else(|e| {
                logging::log_error(None, &format!("Stored settings unreadable, using defaults: {}", e));
                Value::Null
            }),
            None => Value::Null,
        };
        Ok(Settings::merge_with_defaults(&stored))
    }

    pub fn save_settings(&self, settings: &Settings) -> Result<()> {
        let json = serde_json::to_string(settings)?;
        self.set_setting(SETTINGS_KEY, &json)
    }

    // ============ Chat metadata ============

    pub fn get_chat_value(&self, chat_id: &str, key: &str) -> Result<Option<String>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM chat_metadata WHERE chat_id = ?1 AND key = ?2",
                params![chat_id, key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    pub fn set_chat_value(&self, chat_id: &str, key: &str, value: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO chat_metadata (chat_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(chat_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![chat_id, key, value, now],
            )?;
            Ok(())
        })
    }

    pub fn delete_chat_value(&self, chat_id: &str, key: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM chat_metadata WHERE chat_id = ?1 AND key = ?2",
                params![chat_id, key],
            )?;
            Ok(())
        })
    }

    /// Load a chat's session, fresh if none or unreadable.
    pub fn load_session(&self, chat_id: &str, history_cap: usize) -> Result<SessionState> {
        let stored = self.get_chat_value(chat_id, SESSION_KEY)?;
        Ok(SessionState::from_stored(chat_id, stored.as_deref(), history_cap))
    }

    pub fn save_session(&self, state: &SessionState) -> Result<()> {
        let json = serde_json::to_string(state)?;
        self.set_chat_value(&state.chat_id, SESSION_KEY, &json)
    }

    // ============ Calibrations ============

    pub fn get_calibration(&self, character_key: &str) -> Result<Option<StoredCalibration>> {
        let row: Option<(String, String, String, i64, String)> = self.with_connection(|conn| {
            conn.query_row(
                "SELECT character_key, profile_hash, dimensions, manual, updated_at
                 FROM calibrations WHERE character_key = ?1",
                params![character_key],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                        row.get(4)?,
                    ))
                },
            )
            .optional()
        })?;

        let Some((character_key, profile_hash, dimensions, manual, updated_at)) = row else {
            return Ok(None);
        };
        match serde_json::from_str::<Vec<ActiveDimension>>(&dimensions) {
            Ok(dimensions) => Ok(Some(StoredCalibration {
                character_key,
                profile_hash,
                dimensions,
                manual: manual != 0,
                updated_at,
            })),
            Err(e) => {
                logging::log_error(
                    None,
                    &format!("Cached calibration for {} unreadable, ignoring: {}", character_key, e),
                );
                Ok(None)
            }
        }
    }

    pub fn save_calibration(
        &self,
        character_key: &str,
        profile_hash: &str,
        dimensions: &[ActiveDimension],
        manual: bool,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let json = serde_json::to_string(dimensions)?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO calibrations (character_key, profile_hash, dimensions, manual, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(character_key) DO UPDATE SET
                    profile_hash = excluded.profile_hash,
                    dimensions = excluded.dimensions,
                    manual = excluded.manual,
                    updated_at = excluded.updated_at",
                params![character_key, profile_hash, json, manual as i64, now],
            )?;
            Ok(())
        })
    }

    /// Store an operator-edited dimension set. It survives profile edits
    /// until `unpin_dimensions`.
    pub fn pin_dimensions(&self, character_key: &str, dimensions: &[ActiveDimension]) -> Result<()> {
        let hash = self
            .get_calibration(character_key)?
            .map(|c| c.profile_hash)
            .unwrap_or_default();
        self.save_calibration(character_key, &hash, dimensions, true)
    }

    /// Drop the manual flag so the next profile change recalibrates.
    pub fn unpin_dimensions(&self, character_key: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "UPDATE calibrations SET manual = 0 WHERE character_key = ?1",
                params![character_key],
            )?;
            Ok(())
        })
    }

    // ============ Report index ============

    pub fn record_report(&self, entry: &ReportIndexEntry) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO report_index
                 (id, chat_id, character, model, resilience, quality, compatibility,
                  messages_scored, corrections_injected, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.id,
                    entry.chat_id,
                    entry.character,
                    entry.model,
                    entry.resilience,
                    entry.quality,
                    entry.compatibility,
                    entry.messages_scored,
                    entry.corrections_injected,
                    entry.created_at
                ],
            )?;
            Ok(())
        })
    }

    /// Newest first.
    pub fn list_report_index(&self) -> Result<Vec<ReportIndexEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, chat_id, character, model, resilience, quality, compatibility,
                        messages_scored, corrections_injected, created_at
                 FROM report_index
                 ORDER BY created_at DESC",
            )?;

            let entries = stmt.query_map([], |row| {
                Ok(ReportIndexEntry {
                    id: row.get(0)?,
                    chat_id: row.get(1)?,
                    character: row.get(2)?,
                    model: row.get(3)?,
                    resilience: row.get(4)?,
                    quality: row.get(5)?,
                    compatibility: row.get(6)?,
                    messages_scored: row.get(7)?,
                    corrections_injected: row.get(8)?,
                    created_at: row.get(9)?,
                })
            })?;

            entries.collect()
        })
    }
}
