use std::{collections::HashMap, path::PathBuf};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::session::UserChoice;

/// Client-side fallback store, keyed by username. Mirrors repeat counts so
/// the replay gate survives a server outage, and caches choices so branch
/// resolution works offline.
#[derive(Debug, Clone)]
pub struct LocalStore {
    path: PathBuf,
}

impl LocalStore {
    pub fn open(path: PathBuf) -> Result<Self> {
        let store = Self { path };
        store.init_db()?;
        Ok(store)
    }

    pub fn open_default() -> Result<Self> {
        let base = dirs::config_dir()
            .context("unable to locate OS config directory for local store")?
            .join("radio-terminal");
        std::fs::create_dir_all(&base)
            .with_context(|| format!("failed creating store dir at {}", base.display()))?;
        Self::open(base.join("terminal.db"))
    }

    fn conn(&self) -> Result<Connection> {
        Connection::open(&self.path)
            .with_context(|| format!("failed opening sqlite db at {}", self.path.display()))
    }

    fn init_db(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS repeat_counts (
    username TEXT NOT NULL,
    frequency TEXT NOT NULL,
    count INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (username, frequency)
);
CREATE TABLE IF NOT EXISTS user_choices (
    username TEXT NOT NULL,
    frequency TEXT NOT NULL,
    choice_id TEXT NOT NULL,
    option_id TEXT NOT NULL,
    text TEXT,
    PRIMARY KEY (username, frequency, choice_id)
);
"#,
        )
        .context("failed creating local store tables")?;
        Ok(())
    }

    pub fn repeat_counts(&self, username: &str) -> Result<HashMap<String, u32>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT frequency, count FROM repeat_counts WHERE username = ?1")
            .context("failed preparing repeat-count query")?;
        let rows = stmt
            .query_map(params![username], |row| {
                let frequency: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((frequency, count.max(0) as u32))
            })
            .context("failed querying repeat counts")?;
        let mut out = HashMap::new();
        for row in rows {
            let (frequency, count) = row.context("failed decoding repeat-count row")?;
            out.insert(frequency, count);
        }
        Ok(out)
    }

    /// Record a repeat count, never lowering an existing value.
    pub fn record_repeat(&self, username: &str, frequency: &str, count: u32) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
INSERT INTO repeat_counts (username, frequency, count) VALUES (?1, ?2, ?3)
ON CONFLICT (username, frequency) DO UPDATE SET count = MAX(count, excluded.count)
"#,
            params![username, frequency, count],
        )
        .with_context(|| format!("failed recording repeat count for {frequency}"))?;
        Ok(())
    }

    /// Merge server-held repeat counts with the local mirror, the higher
    /// value per frequency winning, and persist the merged view locally.
    pub fn reconcile_repeats(
        &self,
        username: &str,
        server: &HashMap<String, u32>,
    ) -> Result<HashMap<String, u32>> {
        let mut merged = self.repeat_counts(username)?;
        for (frequency, count) in server {
            let entry = merged.entry(frequency.clone()).or_insert(0);
            *entry = (*entry).max(*count);
        }
        for (frequency, count) in &merged {
            self.record_repeat(username, frequency, *count)?;
        }
        Ok(merged)
    }

    /// Delete-then-insert, keyed by (frequency, choiceId): re-selection
    /// overwrites rather than appends.
    pub fn cache_choice(&self, username: &str, choice: &UserChoice) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn
            .transaction()
            .context("failed starting choice transaction")?;
        tx.execute(
            "DELETE FROM user_choices WHERE username = ?1 AND frequency = ?2 AND choice_id = ?3",
            params![username, choice.frequency, choice.choice_id],
        )
        .context("failed clearing previous choice")?;
        tx.execute(
            "INSERT INTO user_choices (username, frequency, choice_id, option_id, text) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                username,
                choice.frequency,
                choice.choice_id,
                choice.option_id,
                choice.text
            ],
        )
        .context("failed inserting choice")?;
        tx.commit().context("failed committing choice upsert")?;
        Ok(())
    }

    pub fn cached_choices(&self, username: &str, frequency: &str) -> Result<Vec<UserChoice>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT frequency, choice_id, option_id, text FROM user_choices WHERE username = ?1 AND frequency = ?2",
            )
            .context("failed preparing choice query")?;
        let rows = stmt
            .query_map(params![username, frequency], |row| {
                Ok(UserChoice {
                    frequency: row.get(0)?,
                    choice_id: row.get(1)?,
                    option_id: row.get(2)?,
                    text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                })
            })
            .context("failed querying cached choices")?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed decoding choice row")?);
        }
        Ok(out)
    }
}
