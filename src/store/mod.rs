//! Store contracts consumed by the booking engine, and the WAL-backed
//! implementation used by the server.

mod wal_store;

pub use wal_store::WalStore;

use async_trait::async_trait;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(Ulid),
    /// Conditional update refused: the record was already soft-deleted.
    #[error("record inactive: {0}")]
    Inactive(Ulid),
    #[error("WAL error: {0}")]
    Wal(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Single-record mutation applied by [`ReservationStore::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordUpdate {
    Move {
        resource_id: Ulid,
        resource_name: String,
        span: Span,
        changed_at: Ms,
    },
    Deactivate {
        changed_at: Ms,
    },
}

/// Reservation records and the secondary indexes the engine queries.
///
/// Every write is atomic at single-record granularity. Implementations must not
/// retry writes internally: a write with unknown outcome is reported as an error.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Active reservations of `owner` whose start falls inside `week`.
    async fn query_by_owner_and_week(&self, owner: &str, week: Span)
    -> StoreResult<Vec<Reservation>>;

    /// Active reservations on `resource_id` intersecting `range`.
    async fn query_by_resource_and_range(
        &self,
        resource_id: Ulid,
        range: Span,
    ) -> StoreResult<Vec<Reservation>>;

    /// Blocked intervals of `resource_id` in `department`.
    async fn query_blocks(
        &self,
        department: &str,
        resource_id: Ulid,
    ) -> StoreResult<Vec<BlockedInterval>>;

    async fn get(&self, id: Ulid) -> StoreResult<Option<Reservation>>;

    async fn put(&self, reservation: &Reservation) -> StoreResult<()>;

    /// Conditional on the record existing and being active.
    async fn update(&self, id: Ulid, update: RecordUpdate) -> StoreResult<Reservation>;

    /// Every reservation of `owner`, active or not, sorted by start.
    async fn query_by_owner(&self, owner: &str) -> StoreResult<Vec<Reservation>>;

    /// Every reservation in the department, active or not, sorted by start.
    async fn query_all(&self) -> StoreResult<Vec<Reservation>>;

    /// Active reservations intersecting `range`, any resource, sorted by start.
    async fn query_active_in_range(&self, range: Span) -> StoreResult<Vec<Reservation>>;
}

/// Resources, blocks and the department roster.
#[async_trait]
pub trait DirectoryStore: Send + Sync {
    async fn get_resource(&self, id: Ulid) -> StoreResult<Option<Resource>>;
    async fn list_resources(&self) -> StoreResult<Vec<Resource>>;
    async fn put_resource(&self, resource: &Resource) -> StoreResult<()>;

    async fn get_block(&self, id: Ulid) -> StoreResult<Option<BlockedInterval>>;
    async fn put_block(&self, block: &BlockedInterval) -> StoreResult<()>;
    async fn remove_block(&self, id: Ulid) -> StoreResult<Option<BlockedInterval>>;
    async fn blocks_in_range(&self, range: Span) -> StoreResult<Vec<BlockedInterval>>;

    async fn get_member(&self, account: &str) -> StoreResult<Option<Member>>;
    async fn list_members(&self) -> StoreResult<Vec<Member>>;
    async fn put_member(&self, member: &Member) -> StoreResult<()>;
    async fn remove_member(&self, account: &str) -> StoreResult<bool>;
}
