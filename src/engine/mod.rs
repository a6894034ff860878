mod directory;
mod error;
mod lifecycle;
mod overlap;
mod queries;
mod quota;

pub use error::EngineError;
pub use lifecycle::{NewReservation, ReservationChange};
pub use overlap::{first_conflict, is_overlapping};
pub use queries::natural_cmp;
pub use quota::within_weekly_quota;

use std::sync::Arc;

use chrono_tz::Tz;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{DirectoryStore, ReservationStore};
use crate::token::TokenSigner;

/// Booking rules applied by every engine.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    pub weekly_quota: u32,
    /// Zone in which calendar weeks start on Monday 00:00.
    pub tz: Tz,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            weekly_quota: 5,
            tz: chrono_tz::America::New_York,
        }
    }
}

/// Booking engine for one department.
///
/// Writes are serialised per owner and per resource: the lifecycle holds
/// the owner's lock and then the resource locks (sorted by id) across the
/// whole read-validate-write sequence.
pub struct Engine<S> {
    department: String,
    store: Arc<S>,
    config: EngineConfig,
    signer: TokenSigner,
    owner_locks: DashMap<String, Arc<Mutex<()>>>,
    resource_locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

/// Locks held for the duration of one write. Dropped in reverse order.
pub(crate) struct WriteGuards {
    _resources: Vec<OwnedMutexGuard<()>>,
    _owner: Option<OwnedMutexGuard<()>>,
}

impl<S> Engine<S>
where
    S: ReservationStore + DirectoryStore,
{
    pub fn new(department: &str, store: Arc<S>, config: EngineConfig, signer: TokenSigner) -> Self {
        Self {
            department: department.to_string(),
            store,
            config,
            signer,
            owner_locks: DashMap::new(),
            resource_locks: DashMap::new(),
        }
    }

    pub fn department(&self) -> &str {
        &self.department
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Signed handle for a reservation, required by delete.
    pub fn token_for(&self, id: Ulid) -> String {
        self.signer.sign(id)
    }

    /// Resolve the caller against this department's roster.
    pub async fn account(&self, id: &str, is_admin: bool) -> Result<Account, EngineError> {
        let role = self
            .store
            .get_member(id)
            .await
            .map_err(EngineError::from)?
            .map(|m| m.role);
        Ok(Account {
            id: id.to_string(),
            department: self.department.clone(),
            role,
            is_admin,
        })
    }

    /// Take the owner lock (if any) and then each resource lock in id order.
    pub(crate) async fn lock(&self, owner: Option<&str>, resources: &[Ulid]) -> WriteGuards {
        let owner_guard = match owner {
            Some(owner) => {
                let mutex = self.owner_locks.entry(owner.to_string()).or_default().clone();
                Some(mutex.lock_owned().await)
            }
            None => None,
        };
        let mut ids = resources.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let mutex = self.resource_locks.entry(id).or_default().clone();
            guards.push(mutex.lock_owned().await);
        }
        WriteGuards {
            _resources: guards,
            _owner: owner_guard,
        }
    }

    /// Resource the request names, or a validation error.
    pub(crate) async fn resource(&self, id: Ulid) -> Result<Resource, EngineError> {
        self.store
            .get_resource(id)
            .await?
            .ok_or_else(|| EngineError::Validation(format!("unknown resource {id}")))
    }

    /// Id of the first active reservation or block on `resource_id` that
    /// `span` would overlap. `exclude` skips the reservation being moved.
    pub(crate) async fn find_conflict(
        &self,
        resource_id: Ulid,
        window: Span,
        span: &Span,
        exclude: Option<Ulid>,
    ) -> Result<Option<Ulid>, EngineError> {
        let existing = self
            .store
            .query_by_resource_and_range(resource_id, window)
            .await?;
        let blocks = self.store.query_blocks(&self.department, resource_id).await?;
        let candidates = existing
            .iter()
            .filter(|r| r.active && Some(r.id) != exclude)
            .map(|r| (r.id, &r.span))
            .chain(blocks.iter().map(|b| (b.id, &b.span)));
        Ok(first_conflict(candidates, span))
    }

    /// Log and count the outcome of a lifecycle operation.
    pub(crate) fn observe<T>(&self, op: &'static str, result: &Result<T, EngineError>) {
        let outcome = match result {
            Ok(_) => "ok",
            Err(EngineError::Overlap(_)) => "overlap",
            Err(EngineError::QuotaExceeded { .. }) => "quota_exceeded",
            Err(EngineError::Forbidden(_)) => "forbidden",
            Err(EngineError::BadIntegrityToken) => "bad_token",
            Err(EngineError::StorageFailure(_)) => "storage_failure",
            Err(EngineError::Validation(_)) => "validation",
            Err(EngineError::NotFound(_)) => "not_found",
            Err(EngineError::LimitExceeded(_)) => "limit_exceeded",
        };
        metrics::counter!(
            crate::observability::RESERVATIONS_TOTAL,
            "op" => op,
            "outcome" => outcome
        )
        .increment(1);
        match result {
            Ok(_) => {}
            Err(EngineError::StorageFailure(detail)) => {
                error!(department = %self.department, op, %detail, "storage failure");
            }
            Err(e) => debug!(department = %self.department, op, error = %e, "rejected"),
        }
    }
}

/// Checked span for untrusted input.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = Span::try_new(start, end)
        .ok_or_else(|| EngineError::Validation("start must be before end".into()))?;
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range".into()));
    }
    Ok(span)
}

/// Checked listing window.
pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let window = Span::try_new(start, end)
        .ok_or_else(|| EngineError::Validation("window start must be before window end".into()))?;
    if window.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(window)
}
