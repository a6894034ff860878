use std::collections::HashSet;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::info;

use crate::compactor;
use crate::engine::{Engine, EngineConfig, EngineError};
use crate::limits::*;
use crate::model::*;
use crate::store::WalStore;
use crate::token::TokenSigner;

pub type DepartmentEngine = Engine<WalStore>;

/// Manages per-department engines. Each department gets its own
/// Engine + WAL + compactor. Department = database name from the pgwire connection.
pub struct DepartmentManager {
    engines: DashMap<String, Arc<DepartmentEngine>>,
    data_dir: PathBuf,
    compact_threshold: u64,
    config: EngineConfig,
    signer: TokenSigner,
    admins: HashSet<String>,
}

impl DepartmentManager {
    pub fn new(
        data_dir: PathBuf,
        compact_threshold: u64,
        config: EngineConfig,
        signer: TokenSigner,
        admins: HashSet<String>,
    ) -> Self {
        Self {
            engines: DashMap::new(),
            data_dir,
            compact_threshold,
            config,
            signer,
            admins,
        }
    }

    pub fn is_admin(&self, account: &str) -> bool {
        self.admins.contains(account)
    }

    /// Get or lazily create the engine for a department.
    pub fn get_or_create(&self, department: &str) -> io::Result<Arc<DepartmentEngine>> {
        if department.len() > MAX_DEPARTMENT_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "department name too long",
            ));
        }
        // Sanitize to prevent path traversal; the sanitized name is the key so
        // two spellings never share one WAL through two stores.
        let safe_name: String = department
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-')
            .collect();
        if safe_name.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty department name",
            ));
        }
        if let Some(engine) = self.engines.get(&safe_name) {
            return Ok(engine.value().clone());
        }
        if self.engines.len() >= MAX_DEPARTMENTS {
            return Err(io::Error::other("too many departments"));
        }

        let engine = match self.engines.entry(safe_name.clone()) {
            Entry::Occupied(e) => return Ok(e.get().clone()),
            Entry::Vacant(slot) => {
                let wal_path = self.data_dir.join(format!("{safe_name}.wal"));
                let store = Arc::new(WalStore::open(&safe_name, &wal_path)?);
                let engine = Arc::new(Engine::new(
                    &safe_name,
                    store.clone(),
                    self.config,
                    self.signer.clone(),
                ));
                let threshold = self.compact_threshold;
                tokio::spawn(async move {
                    compactor::run_compactor(store, threshold).await;
                });
                slot.insert(engine.clone());
                engine
            }
        };
        metrics::gauge!(crate::observability::DEPARTMENTS_ACTIVE).set(self.engines.len() as f64);
        info!(department = %safe_name, "department loaded");
        Ok(engine)
    }

    /// Loaded departments, by name.
    pub fn departments(&self) -> Vec<(String, Arc<DepartmentEngine>)> {
        let mut all: Vec<_> = self
            .engines
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    /// Active reservations and blocks of every loaded department intersecting
    /// `[start, end)`. Administrators only.
    pub async fn oversight_calendar(
        &self,
        account: &Account,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<CalendarItem>, EngineError> {
        if !account.is_admin {
            return Err(EngineError::Forbidden(format!(
                "{} is not an administrator.",
                account.id
            )));
        }
        let window = Span::try_new(start, end).ok_or_else(|| {
            EngineError::Validation("window start must be before window end".into())
        })?;
        if window.duration_ms() > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let mut items = Vec::new();
        for (_, engine) in self.departments() {
            items.extend(engine.calendar_items(window).await?);
        }
        items.sort_by_key(|item| item.span().start);
        Ok(items)
    }
}
