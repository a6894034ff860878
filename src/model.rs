use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only time type stored or compared.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input: `None` unless `start < end`.
    pub fn try_new(start: Ms, end: Ms) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Half-open intersection. Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Smallest span covering both.
    pub fn hull(&self, other: &Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A single booking of a resource. Never physically removed: deletion flips `active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub owner: String,
    pub department: String,
    pub resource_id: Ulid,
    pub resource_name: String,
    pub span: Span,
    pub active: bool,
    pub created_at: Ms,
    /// `None` until the first modify or delete.
    pub changed_at: Option<Ms>,
}

/// Administratively blocked time on a resource. Not owned by any account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedInterval {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub note: Option<String>,
}

/// A bookable room or space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub room: String,
    pub title: String,
}

impl Resource {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.room, self.title)
    }
}

/// Roster role within a department. Staff and chairs administer the department.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Member,
    Staff,
    Chair,
}

impl Role {
    pub fn is_department_admin(self) -> bool {
        matches!(self, Role::Staff | Role::Chair)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Member => "member",
            Role::Staff => "staff",
            Role::Chair => "chair",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "member" => Ok(Role::Member),
            "staff" => Ok(Role::Staff),
            "chair" => Ok(Role::Chair),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub account: String,
    pub role: Role,
}

/// The authenticated caller, resolved once per request and passed explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub department: String,
    /// Roster role in `department`, if the account is on the roster.
    pub role: Option<Role>,
    /// Configured administrator: read-only oversight everywhere.
    pub is_admin: bool,
}

impl Account {
    /// Only roster members book. Administrators have read-only oversight.
    pub fn can_book(&self) -> bool {
        self.role.is_some()
    }

    pub fn can_view_calendar(&self) -> bool {
        self.role.is_some() || self.is_admin
    }

    pub fn can_manage_department(&self) -> bool {
        self.is_admin || self.role.is_some_and(Role::is_department_admin)
    }
}

/// Store change record, one per WAL entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    ResourceAdded(Resource),
    BlockAdded(BlockedInterval),
    BlockRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    MemberSet(Member),
    MemberRemoved {
        account: String,
    },
    ReservationCreated(Reservation),
    ReservationMoved {
        id: Ulid,
        resource_id: Ulid,
        resource_name: String,
        span: Span,
        changed_at: Ms,
    },
    ReservationDeactivated {
        id: Ulid,
        changed_at: Ms,
    },
}

/// One entry on a resource calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalendarEntry {
    pub id: Ulid,
    pub span: Span,
}

/// Active reservation spans of one resource, sorted by `span.start`.
#[derive(Debug, Clone, Default)]
pub struct ResourceCalendar {
    pub entries: Vec<CalendarEntry>,
}

impl ResourceCalendar {
    /// Insert maintaining sort order by span.start.
    pub fn insert(&mut self, entry: CalendarEntry) {
        let pos = self
            .entries
            .binary_search_by_key(&entry.span.start, |e| e.span.start)
            .unwrap_or_else(|e| e);
        self.entries.insert(pos, entry);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<CalendarEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos))
    }

    /// Return only entries whose span overlaps the query window.
    /// Uses binary search to skip entries starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &CalendarEntry> {
        let right_bound = self.entries.partition_point(|e| e.span.start < query.end);
        self.entries[..right_bound]
            .iter()
            .filter(move |e| e.span.end > query.start)
    }
}

/// One row of the calendar feed: a reservation or a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarItem {
    Reservation(Reservation),
    Block {
        department: String,
        block: BlockedInterval,
    },
}

impl CalendarItem {
    pub fn span(&self) -> Span {
        match self {
            CalendarItem::Reservation(r) => r.span,
            CalendarItem::Block { block, .. } => block.span,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
    }

    #[test]
    fn span_try_new_rejects_empty_and_inverted() {
        assert!(Span::try_new(100, 100).is_none());
        assert!(Span::try_new(200, 100).is_none());
        assert_eq!(Span::try_new(100, 101), Some(Span::new(100, 101)));
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_hull() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 400);
        assert_eq!(a.hull(&b), Span::new(100, 400));
        assert_eq!(b.hull(&a), Span::new(100, 400));
    }

    #[test]
    fn role_parse_and_admin_flag() {
        assert_eq!("Staff".parse::<Role>(), Ok(Role::Staff));
        assert_eq!("chair".parse::<Role>(), Ok(Role::Chair));
        assert!("janitor".parse::<Role>().is_err());
        assert!(!Role::Member.is_department_admin());
        assert!(Role::Chair.is_department_admin());
    }

    #[test]
    fn account_permissions() {
        let mut acct = Account {
            id: "u1".into(),
            department: "ECON".into(),
            role: None,
            is_admin: false,
        };
        assert!(!acct.can_book());
        assert!(!acct.can_view_calendar());
        assert!(!acct.can_manage_department());

        acct.role = Some(Role::Member);
        assert!(acct.can_book());
        assert!(acct.can_view_calendar());
        assert!(!acct.can_manage_department());

        acct.role = Some(Role::Staff);
        assert!(acct.can_manage_department());

        acct.role = None;
        acct.is_admin = true;
        assert!(!acct.can_book());
        assert!(acct.can_view_calendar());
        assert!(acct.can_manage_department());
    }

    fn entry(start: Ms, end: Ms) -> CalendarEntry {
        CalendarEntry {
            id: Ulid::new(),
            span: Span::new(start, end),
        }
    }

    #[test]
    fn calendar_ordering() {
        let mut cal = ResourceCalendar::default();
        cal.insert(entry(300, 400));
        cal.insert(entry(100, 200));
        cal.insert(entry(200, 300));
        assert_eq!(cal.entries[0].span.start, 100);
        assert_eq!(cal.entries[1].span.start, 200);
        assert_eq!(cal.entries[2].span.start, 300);
    }

    #[test]
    fn calendar_remove_middle_preserves_order() {
        let mut cal = ResourceCalendar::default();
        let entries: Vec<_> = (0..3).map(|i| entry(i * 100, i * 100 + 50)).collect();
        for e in &entries {
            cal.insert(*e);
        }
        assert!(cal.remove(entries[1].id).is_some());
        assert_eq!(cal.entries.len(), 2);
        assert_eq!(cal.entries[0].id, entries[0].id);
        assert_eq!(cal.entries[1].id, entries[2].id);
        assert!(cal.remove(Ulid::new()).is_none());
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut cal = ResourceCalendar::default();
        cal.insert(entry(100, 200));
        cal.insert(entry(450, 600));
        cal.insert(entry(1000, 1100));

        let hits: Vec<_> = cal.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut cal = ResourceCalendar::default();
        cal.insert(entry(100, 200));
        assert_eq!(cal.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(cal.overlapping(&Span::new(0, 100)).count(), 0);
    }

    #[test]
    fn overlapping_large_entry_spanning_query() {
        let mut cal = ResourceCalendar::default();
        cal.insert(entry(0, 10_000));
        assert_eq!(cal.overlapping(&Span::new(500, 600)).count(), 1);
    }

    #[test]
    fn change_serialization_roundtrip() {
        let change = Change::ResourceAdded(Resource {
            id: Ulid::new(),
            room: "100 Dodge".into(),
            title: "Space A".into(),
        });
        let bytes = bincode::serialize(&change).unwrap();
        let decoded: Change = bincode::deserialize(&bytes).unwrap();
        assert_eq!(change, decoded);
    }
}
