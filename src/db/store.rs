//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("database lock poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Create a store that lives only as long as the process.
    pub fn in_memory() -> Result<Self, DbError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute_batch(include_str!("../../migrations/0001_init.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    // --- Websites ---

    /// Add a new website owned by `user_id` and return it.
    pub fn add_website(&self, user_id: &str, url: &str) -> Result<Website, DbError> {
        let website = Website {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            url: url.to_string(),
            disabled: false,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO websites (id, user_id, url, disabled) VALUES (?1, ?2, ?3, 0)",
            params![website.id, website.user_id, website.url],
        )?;
        Ok(website)
    }

    /// Get a website by ID.
    pub fn get_website(&self, id: &str) -> Result<Website, DbError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT id, user_id, url, disabled FROM websites WHERE id = ?1",
            params![id],
            website_from_row,
        )
        .optional()?
        .ok_or(DbError::NotFound)
    }

    /// Get the enabled websites owned by a user.
    pub fn get_user_websites(&self, user_id: &str) -> Result<Vec<Website>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, url, disabled FROM websites WHERE user_id = ?1 AND disabled = 0",
        )?;
        let websites = stmt
            .query_map(params![user_id], website_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(websites)
    }

    /// Get every website that is eligible for scheduling.
    pub fn get_active_websites(&self) -> Result<Vec<Website>, DbError> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT id, user_id, url, disabled FROM websites WHERE disabled = 0")?;
        let websites = stmt
            .query_map([], website_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(websites)
    }

    /// Disable a website owned by `user_id`. Its ticks are kept.
    pub fn disable_website(&self, id: &str, user_id: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE websites SET disabled = 1 WHERE id = ?1 AND user_id = ?2",
            params![id, user_id],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    // --- Ticks ---

    /// Append ticks in batch. Returns how many were written.
    ///
    /// A row the database refuses is logged and skipped; the rest of the
    /// batch is still committed.
    pub fn add_ticks(&self, ticks: &[Tick]) -> Result<usize, DbError> {
        if ticks.is_empty() {
            return Ok(0);
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;
        let mut written = 0;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO ticks (website_id, validator_id, status, latency, time)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;

            for t in ticks {
                let Ok(latency) = i64::try_from(t.latency) else {
                    tracing::warn!(
                        "Skipping tick for {}: latency {} out of range",
                        t.website_id,
                        t.latency
                    );
                    continue;
                };

                let inserted = stmt.execute(params![
                    t.website_id,
                    t.validator_id,
                    t.status.as_str(),
                    latency,
                    t.timestamp.format(TIME_FORMAT).to_string(),
                ]);
                match inserted {
                    Ok(_) => written += 1,
                    Err(e) => tracing::warn!("Skipping tick for {}: {}", t.website_id, e),
                }
            }
        }

        tx.commit()?;
        Ok(written)
    }

    /// Get every tick recorded for a website, oldest first.
    pub fn get_ticks(&self, website_id: &str) -> Result<Vec<Tick>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT website_id, validator_id, status, latency, time FROM ticks
             WHERE website_id = ?1 ORDER BY time ASC, id ASC",
        )?;

        let ticks = stmt
            .query_map(params![website_id], |row| {
                let status: String = row.get(2)?;
                let latency: i64 = row.get(3)?;
                let time_str: String = row.get(4)?;
                Ok(Tick {
                    website_id: row.get(0)?,
                    validator_id: row.get(1)?,
                    status: status.parse().unwrap_or(TickStatus::Bad),
                    latency: latency.max(0) as u64,
                    timestamp: parse_db_time(&time_str).unwrap_or_else(Utc::now),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(ticks)
    }

    /// Time of the most recent tick for every website that has one.
    pub fn get_last_tick_times(&self) -> Result<HashMap<WebsiteId, DateTime<Utc>>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT website_id, MAX(time) FROM ticks GROUP BY website_id")?;

        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let time: Option<String> = row.get(1)?;
                Ok((id, time))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, time)| {
                time.and_then(|t| parse_db_time(&t)).map(|t| (id, t))
            })
            .collect())
    }

    // --- Validators ---

    /// Find a validator identity by its hex public key.
    pub fn find_validator_by_key(
        &self,
        public_key: &str,
    ) -> Result<Option<ValidatorRecord>, DbError> {
        let conn = self.lock()?;
        let record = conn
            .query_row(
                "SELECT id, public_key, location FROM validators WHERE public_key = ?1",
                params![public_key],
                |row| {
                    Ok(ValidatorRecord {
                        id: row.get(0)?,
                        public_key: row.get(1)?,
                        location: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    /// Insert a validator identity. An existing row for the same key wins.
    pub fn add_validator(&self, record: &ValidatorRecord) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO validators (id, public_key, location) VALUES (?1, ?2, ?3)
             ON CONFLICT(public_key) DO NOTHING",
            params![record.id, record.public_key, record.location],
        )?;
        Ok(())
    }

    /// Update the location label of a validator.
    pub fn update_validator_location(&self, id: &str, location: &str) -> Result<(), DbError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE validators SET location = ?1 WHERE id = ?2",
            params![location, id],
        )?;
        Ok(())
    }
}

fn website_from_row(row: &rusqlite::Row<'_>) -> SqlResult<Website> {
    let disabled: i64 = row.get(3)?;
    Ok(Website {
        id: row.get(0)?,
        user_id: row.get(1)?,
        url: row.get(2)?,
        disabled: disabled != 0,
    })
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        TIME_FORMAT,
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;

    fn tick(website_id: &str, status: TickStatus, latency: u64, timestamp: DateTime<Utc>) -> Tick {
        Tick {
            website_id: website_id.to_string(),
            validator_id: "v1".to_string(),
            status,
            latency,
            timestamp,
        }
    }

    #[test]
    fn test_website_lifecycle() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();

        let site = store.add_website("user-1", "https://example.com").unwrap();
        assert!(!site.disabled);

        let fetched = store.get_website(&site.id).unwrap();
        assert_eq!(fetched, site);
        assert_eq!(store.get_user_websites("user-1").unwrap().len(), 1);
        assert!(store.get_user_websites("user-2").unwrap().is_empty());

        // Another user cannot disable it
        assert!(matches!(
            store.disable_website(&site.id, "user-2"),
            Err(DbError::NotFound)
        ));

        store.disable_website(&site.id, "user-1").unwrap();
        assert!(store.get_website(&site.id).unwrap().disabled);
        assert!(store.get_user_websites("user-1").unwrap().is_empty());
        assert!(store.get_active_websites().unwrap().is_empty());

        assert!(matches!(store.get_website("missing"), Err(DbError::NotFound)));
    }

    #[test]
    fn test_ticks_come_back_ordered_by_time() {
        let store = Store::in_memory().unwrap();
        let w1 = store.add_website("u", "https://one.example").unwrap().id;
        let w2 = store.add_website("u", "https://two.example").unwrap().id;
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        // Appended out of order, as validators reply
        let written = store
            .add_ticks(&[
                tick(&w1, TickStatus::Bad, 300, base + Duration::seconds(30)),
                tick(&w1, TickStatus::Good, 100, base),
                tick(&w2, TickStatus::Good, 50, base + Duration::seconds(5)),
            ])
            .unwrap();
        assert_eq!(written, 3);

        let ticks = store.get_ticks(&w1).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].timestamp, base);
        assert_eq!(ticks[0].status, TickStatus::Good);
        assert_eq!(ticks[1].latency, 300);

        let last = store.get_last_tick_times().unwrap();
        assert_eq!(last.get(&w1), Some(&(base + Duration::seconds(30))));
        assert_eq!(last.get(&w2), Some(&(base + Duration::seconds(5))));
    }

    #[test]
    fn test_bad_rows_do_not_sink_the_batch() {
        let store = Store::in_memory().unwrap();
        let w1 = store.add_website("u", "https://one.example").unwrap().id;
        let now = Utc::now();

        let written = store
            .add_ticks(&[
                tick(&w1, TickStatus::Good, 10, now),
                // Does not fit the latency column
                tick(&w1, TickStatus::Bad, u64::MAX, now),
                // Unknown website
                tick("missing", TickStatus::Good, 20, now),
                tick(&w1, TickStatus::Good, 30, now + Duration::seconds(1)),
            ])
            .unwrap();
        assert_eq!(written, 2);

        let latencies: Vec<u64> = store.get_ticks(&w1).unwrap().iter().map(|t| t.latency).collect();
        assert_eq!(latencies, vec![10, 30]);
        assert!(store.get_ticks("missing").unwrap().is_empty());
    }

    #[test]
    fn test_validator_identity_is_unique_per_key() {
        let store = Store::in_memory().unwrap();
        let record = ValidatorRecord {
            id: "v-1".to_string(),
            public_key: "ab".repeat(32),
            location: "unknown".to_string(),
        };
        store.add_validator(&record).unwrap();

        // Second insert with the same key keeps the first identity
        store
            .add_validator(&ValidatorRecord {
                id: "v-2".to_string(),
                ..record.clone()
            })
            .unwrap();

        let found = store.find_validator_by_key(&record.public_key).unwrap().unwrap();
        assert_eq!(found.id, "v-1");

        store.update_validator_location("v-1", "Berlin, Berlin, DE").unwrap();
        let found = store.find_validator_by_key(&record.public_key).unwrap().unwrap();
        assert_eq!(found.location, "Berlin, Berlin, DE");

        assert!(store.find_validator_by_key("00").unwrap().is_none());
    }
}
