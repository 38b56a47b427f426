use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backends::Storage;
use crate::merge::Metric;

/// 🗄️ A `HashMap` pretending to be a database, with a switch to make it pretend to be a
/// *broken* database.
///
/// Behaves like a table with a unique key: `insert` on an existing key and `update` on a
/// missing key are errors, same as the real thing would complain about.
#[derive(Debug, Clone)]
pub struct InMemoryStorage<M> {
    rows: Arc<Mutex<HashMap<String, M>>>,
    // 💥 when set, every call fails. For exercising the flush retry path.
    failing: Arc<AtomicBool>,
}

impl<M: Metric> Default for InMemoryStorage<M> {
    fn default() -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl<M: Metric> InMemoryStorage<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 🔎 Read a row without going through the trait (and without the failure switch).
    pub async fn get_row(&self, key: &str) -> Option<M> {
        self.rows.lock().await.get(key).cloned()
    }

    /// 📸 Every stored row, ordered by key.
    pub async fn snapshot(&self) -> Vec<M> {
        let rows = self.rows.lock().await;
        let mut keys: Vec<&String> = rows.keys().collect();
        keys.sort();
        keys.into_iter().map(|key| rows[key].clone()).collect()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.lock().await.is_empty()
    }

    /// 🔌 Pull the plug (`true`) or plug it back in (`false`).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_plugged_in(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            bail!("💀 in-memory storage is switched to failing");
        }
        Ok(())
    }
}

#[async_trait]
impl<M: Metric> Storage<M> for InMemoryStorage<M> {
    async fn get(&self, key: &str) -> Result<Option<M>> {
        self.check_plugged_in()?;
        Ok(self.rows.lock().await.get(key).cloned())
    }

    async fn insert(&self, row: &M) -> Result<()> {
        self.check_plugged_in()?;
        let key = row.aggregation_key();
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&key) {
            bail!("row '{}' already exists in {}", key, M::NAME);
        }
        rows.insert(key, row.clone());
        Ok(())
    }

    async fn update(&self, key: &str, row: &M) -> Result<()> {
        self.check_plugged_in()?;
        let mut rows = self.rows.lock().await;
        match rows.get_mut(key) {
            Some(existing) => {
                *existing = row.clone();
                Ok(())
            }
            None => bail!("row '{}' does not exist in {}", key, M::NAME),
        }
    }
}
