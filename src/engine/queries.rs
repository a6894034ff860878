use std::cmp::Ordering;

use crate::model::*;
use crate::store::{DirectoryStore, ReservationStore};

use super::{validate_window, Engine, EngineError};

impl<S> Engine<S>
where
    S: ReservationStore + DirectoryStore,
{
    /// The caller's own reservations, active or not, by start.
    pub async fn my_reservations(&self, account: &Account) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.store.query_by_owner(&account.id).await?)
    }

    /// Active reservations and blocks intersecting `[start, end)`, by start.
    pub async fn calendar(
        &self,
        account: &Account,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<CalendarItem>, EngineError> {
        if !account.can_view_calendar() {
            return Err(EngineError::Forbidden(format!(
                "{} is not on the {} roster.",
                account.id, self.department
            )));
        }
        let window = validate_window(start, end)?;
        self.calendar_items(window).await
    }

    /// Calendar feed without a permission check, for cross-department oversight.
    pub(crate) async fn calendar_items(&self, window: Span) -> Result<Vec<CalendarItem>, EngineError> {
        let mut items: Vec<CalendarItem> = self
            .store
            .query_active_in_range(window)
            .await?
            .into_iter()
            .map(CalendarItem::Reservation)
            .collect();
        items.extend(
            self.store
                .blocks_in_range(window)
                .await?
                .into_iter()
                .map(|block| CalendarItem::Block {
                    department: self.department.clone(),
                    block,
                }),
        );
        items.sort_by_key(|item| item.span().start);
        Ok(items)
    }

    /// Department resources in natural order of room, then title.
    pub async fn resources(&self) -> Result<Vec<Resource>, EngineError> {
        let mut resources = self.store.list_resources().await?;
        resources.sort_by(|a, b| {
            natural_cmp(&a.room, &b.room).then_with(|| natural_cmp(&a.title, &b.title))
        });
        Ok(resources)
    }

    /// Every reservation in the department, including deleted ones.
    pub async fn department_reservations(
        &self,
        account: &Account,
    ) -> Result<Vec<Reservation>, EngineError> {
        self.require_manager(account)?;
        Ok(self.store.query_all().await?)
    }

    pub async fn roster(&self, account: &Account) -> Result<Vec<Member>, EngineError> {
        self.require_manager(account)?;
        Ok(self.store.list_members().await?)
    }

    pub(crate) fn require_manager(&self, account: &Account) -> Result<(), EngineError> {
        if account.can_manage_department() {
            Ok(())
        } else {
            Err(EngineError::Forbidden(format!(
                "{} does not administer {}.",
                account.id, self.department
            )))
        }
    }
}

/// Compare strings so that embedded numbers order by value: "900" < "1000".
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let na = take_number(&mut a);
                let nb = take_number(&mut b);
                // Compare by length after stripping zeros, then lexically.
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta.len().cmp(&tb.len()).then_with(|| ta.cmp(tb));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                let ord = x
                    .to_lowercase()
                    .cmp(y.to_lowercase())
                    .then_with(|| x.cmp(&y));
                if ord != Ordering::Equal {
                    return ord;
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
        digits.push(c);
        chars.next();
    }
    digits
}
