use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{DirectoryStore, ReservationStore};

use super::{validate_span, Engine, EngineError};

impl<S> Engine<S>
where
    S: ReservationStore + DirectoryStore,
{
    pub async fn add_resource(
        &self,
        account: &Account,
        resource: Resource,
    ) -> Result<Resource, EngineError> {
        self.require_manager(account)?;
        if resource.room.is_empty() || resource.title.is_empty() {
            return Err(EngineError::Validation("room and title are required".into()));
        }
        if resource.room.len() > MAX_NAME_LEN || resource.title.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("resource name too long"));
        }
        if self.store.get_resource(resource.id).await?.is_some() {
            return Err(EngineError::Validation(format!(
                "resource {} already exists",
                resource.id
            )));
        }
        if self.store.list_resources().await?.len() >= MAX_RESOURCES_PER_DEPARTMENT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        self.store.put_resource(&resource).await?;
        info!(department = %self.department(), id = %resource.id, name = %resource.display_name(), "resource added");
        Ok(resource)
    }

    /// Block time on a resource. Refused if the id is taken or the span would
    /// overlap an active reservation or another block.
    pub async fn add_block(
        &self,
        account: &Account,
        id: Ulid,
        resource_id: Ulid,
        start: Ms,
        end: Ms,
        note: Option<String>,
    ) -> Result<BlockedInterval, EngineError> {
        self.require_manager(account)?;
        let span = validate_span(start, end)?;
        if note.as_ref().is_some_and(|n| n.len() > MAX_NOTE_LEN) {
            return Err(EngineError::LimitExceeded("block note too long"));
        }
        let resource = self.resource(resource_id).await?;

        // The block id is locked alongside the resource so two inserts of one
        // id on different resources cannot both pass the check.
        let _guards = self.lock(None, &[resource.id, id]).await;
        if self.store.get_block(id).await?.is_some() {
            return Err(EngineError::Validation(format!("block {id} already exists")));
        }
        if let Some(conflict) = self.find_conflict(resource.id, span, &span, None).await? {
            return Err(EngineError::Overlap(conflict));
        }
        let block = BlockedInterval {
            id,
            resource_id: resource.id,
            span,
            note,
        };
        self.store.put_block(&block).await?;
        info!(department = %self.department(), %id, resource = %resource.id, span = %span, "block added");
        Ok(block)
    }

    pub async fn remove_block(
        &self,
        account: &Account,
        id: Ulid,
    ) -> Result<BlockedInterval, EngineError> {
        self.require_manager(account)?;
        let block = self
            .store
            .remove_block(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        info!(department = %self.department(), %id, "block removed");
        Ok(block)
    }

    pub async fn set_member(&self, account: &Account, member: Member) -> Result<Member, EngineError> {
        self.require_manager(account)?;
        if member.account.is_empty() {
            return Err(EngineError::Validation("account is required".into()));
        }
        if member.account.len() > MAX_ACCOUNT_LEN {
            return Err(EngineError::LimitExceeded("account name too long"));
        }
        self.store.put_member(&member).await?;
        info!(department = %self.department(), account = %member.account, role = member.role.as_str(), "member set");
        Ok(member)
    }

    /// Returns whether the account was on the roster.
    pub async fn remove_member(&self, account: &Account, target: &str) -> Result<bool, EngineError> {
        self.require_manager(account)?;
        let removed = self.store.remove_member(target).await?;
        if removed {
            info!(department = %self.department(), account = %target, "member removed");
        }
        Ok(removed)
    }
}
