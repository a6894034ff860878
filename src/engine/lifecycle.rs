use tracing::info;
use ulid::Ulid;

use crate::calendar::now_ms;
use crate::limits::*;
use crate::model::*;
use crate::store::{DirectoryStore, RecordUpdate, ReservationStore};

use super::quota::{week_for_start, within_weekly_quota};
use super::{validate_span, validate_window, Engine, EngineError};

/// A proposed booking as submitted by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub resource_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    /// The calendar range the caller was looking at, if any. Candidates are
    /// gathered over this range widened to cover the proposal.
    pub window: Option<(Ms, Ms)>,
}

/// New times, and optionally a new resource, for an existing booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationChange {
    pub start: Ms,
    pub end: Ms,
    pub resource_id: Option<Ulid>,
}

const NOT_YOURS_MODIFY: &str = "You can only modify your own reservations.";
const NOT_YOURS_DELETE: &str = "You can only delete your own reservations.";

fn validate_duration(span: &Span) -> Result<(), EngineError> {
    if span.duration_ms() > MAX_RESERVATION_MS {
        return Err(EngineError::LimitExceeded("reservation longer than 24 hours"));
    }
    Ok(())
}

impl<S> Engine<S>
where
    S: ReservationStore + DirectoryStore,
{
    pub async fn create_reservation(
        &self,
        account: &Account,
        request: NewReservation,
    ) -> Result<Reservation, EngineError> {
        let result = self.create(account, request).await;
        self.observe("create", &result);
        result
    }

    pub async fn modify_reservation(
        &self,
        account: &Account,
        id: Ulid,
        request: ReservationChange,
    ) -> Result<Reservation, EngineError> {
        let result = self.modify(account, id, request).await;
        self.observe("modify", &result);
        result
    }

    /// Soft delete through a signed token. A bad token ends the request
    /// before the store is consulted.
    pub async fn delete_reservation(
        &self,
        account: &Account,
        token: &str,
    ) -> Result<Reservation, EngineError> {
        let result = self.delete(account, token).await;
        self.observe("delete", &result);
        result
    }

    async fn create(
        &self,
        account: &Account,
        request: NewReservation,
    ) -> Result<Reservation, EngineError> {
        if !account.can_book() {
            return Err(EngineError::Forbidden(format!(
                "{} is not on the {} roster.",
                account.id, self.department
            )));
        }
        let span = validate_span(request.start, request.end)?;
        validate_duration(&span)?;
        let window = match request.window {
            Some((start, end)) => validate_window(start, end)?.hull(&span),
            None => span,
        };
        let resource = self.resource(request.resource_id).await?;

        let _guards = self.lock(Some(account.id.as_str()), &[resource.id]).await;

        let week = week_for_start(span.start, self.config.tz)?;
        let booked = self
            .store
            .query_by_owner_and_week(&account.id, week.span)
            .await?
            .len();
        if !within_weekly_quota(booked, self.config.weekly_quota) {
            return Err(EngineError::QuotaExceeded {
                limit: self.config.weekly_quota,
                week_start: week.monday,
            });
        }

        if let Some(conflict) = self.find_conflict(resource.id, window, &span, None).await? {
            return Err(EngineError::Overlap(conflict));
        }

        let reservation = Reservation {
            id: Ulid::new(),
            owner: account.id.clone(),
            department: self.department.clone(),
            resource_id: resource.id,
            resource_name: resource.display_name(),
            span,
            active: true,
            created_at: now_ms(),
            changed_at: None,
        };
        self.store.put(&reservation).await?;
        info!(
            department = %self.department,
            id = %reservation.id,
            owner = %reservation.owner,
            resource = %reservation.resource_id,
            span = %reservation.span,
            "reservation created"
        );
        Ok(reservation)
    }

    async fn modify(
        &self,
        account: &Account,
        id: Ulid,
        request: ReservationChange,
    ) -> Result<Reservation, EngineError> {
        let current = self.active_reservation(id).await?;
        if current.owner != account.id {
            return Err(EngineError::Forbidden(NOT_YOURS_MODIFY.into()));
        }
        let span = validate_span(request.start, request.end)?;
        validate_duration(&span)?;
        let target = match request.resource_id {
            Some(rid) if rid != current.resource_id => self.resource(rid).await?,
            _ => self.resource(current.resource_id).await?,
        };

        let _guards = self
            .lock(Some(current.owner.as_str()), &[current.resource_id, target.id])
            .await;
        // Re-read under the locks: a concurrent delete wins.
        let current = self.active_reservation(id).await?;

        let old_week = week_for_start(current.span.start, self.config.tz)?;
        let new_week = week_for_start(span.start, self.config.tz)?;
        if old_week.monday != new_week.monday {
            let booked = self
                .store
                .query_by_owner_and_week(&current.owner, new_week.span)
                .await?
                .len();
            if !within_weekly_quota(booked, self.config.weekly_quota) {
                return Err(EngineError::QuotaExceeded {
                    limit: self.config.weekly_quota,
                    week_start: new_week.monday,
                });
            }
        }

        if let Some(conflict) = self
            .find_conflict(target.id, span, &span, Some(current.id))
            .await?
        {
            return Err(EngineError::Overlap(conflict));
        }

        let updated = self
            .store
            .update(
                id,
                RecordUpdate::Move {
                    resource_id: target.id,
                    resource_name: target.display_name(),
                    span,
                    changed_at: now_ms(),
                },
            )
            .await?;
        info!(
            department = %self.department,
            %id,
            resource = %updated.resource_id,
            span = %updated.span,
            "reservation modified"
        );
        Ok(updated)
    }

    async fn delete(&self, account: &Account, token: &str) -> Result<Reservation, EngineError> {
        let id = self.signer.verify(token)?;
        let current = self.active_reservation(id).await?;

        let _guards = self
            .lock(Some(current.owner.as_str()), &[current.resource_id])
            .await;
        let current = self.active_reservation(id).await?;
        if current.owner != account.id {
            return Err(EngineError::Forbidden(NOT_YOURS_DELETE.into()));
        }

        let deleted = self
            .store
            .update(
                id,
                RecordUpdate::Deactivate {
                    changed_at: now_ms(),
                },
            )
            .await?;
        info!(department = %self.department, %id, "reservation deleted");
        Ok(deleted)
    }

    /// The reservation, provided it exists and is still active.
    async fn active_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        match self.store.get(id).await? {
            Some(r) if r.active => Ok(r),
            _ => Err(EngineError::NotFound(id)),
        }
    }
}
