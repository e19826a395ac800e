//! # Output Cache
//!
//! Worker outputs keyed by (prompt hash, provider). An entry is only reused
//! when its confidence is above [`CACHE_REUSE_THRESHOLD`]; anything else
//! counts as a miss. Entries never expire.
//!
//! With a database attached, writes go through to the `output_cache` table
//! and existing rows are loaded on construction.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::state::db::{parse_timestamp, HivemindDb};

/// Cached confidence must exceed this to be reused
pub const CACHE_REUSE_THRESHOLD: u8 = 70;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheEntry {
    pub output: String,
    pub confidence: u8,
    pub created_at: DateTime<Utc>,
}

/// Cache statistics for monitoring
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl CacheStats {
    /// Cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type CacheKey = (String, String);

#[derive(Default)]
pub struct OutputCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    stats: Mutex<CacheStats>,
    db: Option<Arc<HivemindDb>>,
}

impl OutputCache {
    /// In-memory only
    pub fn new() -> Self {
        Self::default()
    }

    /// Backed by the `output_cache` table; loads existing entries
    pub fn with_db(db: Arc<HivemindDb>) -> Result<Self> {
        let mut entries = HashMap::new();
        {
            let conn = db.connection();
            let conn = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
            let mut stmt = conn.prepare(
                "SELECT prompt_hash, provider, output, confidence, created_at FROM output_cache",
            )?;
            let rows = stmt.query_map([], |row| {
                let created_at: String = row.get(4)?;
                Ok((
                    (row.get::<_, String>(0)?, row.get::<_, String>(1)?),
                    CacheEntry {
                        output: row.get(2)?,
                        confidence: row.get(3)?,
                        created_at: parse_timestamp(&created_at),
                    },
                ))
            })?;
            for row in rows {
                let (key, entry) = row.context("Failed to read cache row")?;
                entries.insert(key, entry);
            }
        }

        tracing::debug!(entries = entries.len(), "Loaded output cache");
        Ok(Self {
            entries: Mutex::new(entries),
            stats: Mutex::new(CacheStats::default()),
            db: Some(db),
        })
    }

    /// Deterministic hash of a prompt
    pub fn prompt_hash(prompt: &str) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        prompt.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Reusable entry for (prompt, provider), if confident enough
    pub fn get(&self, prompt: &str, provider: &str) -> Option<CacheEntry> {
        let key = (Self::prompt_hash(prompt), provider.to_string());
        let hit = self
            .entries
            .lock()
            .ok()?
            .get(&key)
            .filter(|entry| entry.confidence > CACHE_REUSE_THRESHOLD)
            .cloned();

        if let Ok(mut stats) = self.stats.lock() {
            if hit.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }

        if hit.is_some() {
            tracing::debug!(provider = %provider, hash = %key.0, "Output cache hit");
        }
        hit
    }

    /// Store a successful output. Empty outputs are ignored.
    pub fn set(&self, prompt: &str, provider: &str, output: &str, confidence: u8) {
        if output.trim().is_empty() {
            return;
        }

        let hash = Self::prompt_hash(prompt);
        let entry = CacheEntry {
            output: output.to_string(),
            confidence: confidence.min(100),
            created_at: Utc::now(),
        };

        if let Some(db) = &self.db {
            if let Err(e) = persist(db, &hash, provider, &entry) {
                tracing::warn!(provider = %provider, "Failed to persist cache entry: {}", e);
            }
        }

        if let Ok(mut entries) = self.entries.lock() {
            entries.insert((hash, provider.to_string()), entry);
        }
        if let Ok(mut stats) = self.stats.lock() {
            stats.writes += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().map(|s| *s).unwrap_or_default()
    }
}

fn persist(db: &HivemindDb, hash: &str, provider: &str, entry: &CacheEntry) -> Result<()> {
    let conn = db.connection();
    let conn = conn
        .lock()
        .map_err(|e| anyhow::anyhow!("Lock error: {}", e))?;
    conn.execute(
        r#"
        INSERT OR REPLACE INTO output_cache (prompt_hash, provider, output, confidence, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5)
        "#,
        params![
            hash,
            provider,
            entry.output,
            entry.confidence,
            entry.created_at.to_rfc3339()
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reuse_threshold_is_strict() {
        let cache = OutputCache::new();
        cache.set("p", "claude", "at threshold", CACHE_REUSE_THRESHOLD);
        assert!(cache.get("p", "claude").is_none());

        cache.set("p", "claude", "above threshold", CACHE_REUSE_THRESHOLD + 1);
        assert_eq!(cache.get("p", "claude").unwrap().output, "above threshold");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_hit_rate_without_lookups() {
        assert_eq!(OutputCache::new().stats().hit_rate(), 0.0);
    }

    #[test]
    fn test_keyed_by_provider() {
        let cache = OutputCache::new();
        cache.set("p", "claude", "answer", 90);
        assert!(cache.get("p", "codex").is_none());
        assert!(cache.get("other prompt", "claude").is_none());
    }

    #[test]
    fn test_empty_output_not_cached() {
        let cache = OutputCache::new();
        cache.set("p", "claude", "   ", 95);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(OutputCache::prompt_hash("x"), OutputCache::prompt_hash("x"));
        assert_ne!(OutputCache::prompt_hash("x"), OutputCache::prompt_hash("y"));
    }

    #[test]
    fn test_persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hivemind.db");

        {
            let db = Arc::new(HivemindDb::open_at(&path).unwrap());
            let cache = OutputCache::with_db(db).unwrap();
            cache.set("prompt", "claude", "persisted", 88);
        }

        let db = Arc::new(HivemindDb::open_at(&path).unwrap());
        let cache = OutputCache::with_db(db).unwrap();
        let entry = cache.get("prompt", "claude").unwrap();
        assert_eq!(entry.output, "persisted");
        assert_eq!(entry.confidence, 88);
    }
}
