use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

/// A booking window. `start < end` strictly; both endpoints belong to the
/// window as far as temporal classification goes, so a booking whose `end`
/// equals `now` still counts as in progress at that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }
}

/// Approval status of a booking. WAITING is the only initial status; the
/// item's owner moves it to APPROVED or REJECTED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Waiting,
    Approved,
    Rejected,
    /// Present in the data model for replay compatibility; no operation
    /// currently produces it.
    Canceled,
}

impl BookingStatus {
    /// Whether the booking still occupies the item's schedule. Rejected and
    /// canceled bookings never surface as last/next.
    pub fn is_active(&self) -> bool {
        matches!(self, BookingStatus::Waiting | BookingStatus::Approved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Waiting => "WAITING",
            BookingStatus::Approved => "APPROVED",
            BookingStatus::Rejected => "REJECTED",
            BookingStatus::Canceled => "CANCELED",
        }
    }
}

/// List-query view selector. CURRENT/PAST/FUTURE are derived from the
/// booking window relative to `now`; WAITING/REJECTED match the stored
/// status. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    All,
    Current,
    Past,
    Future,
    Waiting,
    Rejected,
}

impl StateFilter {
    /// Case-insensitive filter lookup; `None` for a name this engine does
    /// not understand.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Some(StateFilter::All),
            "CURRENT" => Some(StateFilter::Current),
            "PAST" => Some(StateFilter::Past),
            "FUTURE" => Some(StateFilter::Future),
            "WAITING" => Some(StateFilter::Waiting),
            "REJECTED" => Some(StateFilter::Rejected),
            _ => None,
        }
    }
}

/// A reservation of one item by one booker for a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub booker_id: Ulid,
    pub span: Span,
    pub status: BookingStatus,
}

/// A registered user. The engine only needs identity and existence; profile
/// data lives elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: Ulid,
    pub name: Option<String>,
}

/// Full state of one item: ownership, the availability flag, and every
/// booking ever requested against it, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct ItemState {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub name: Option<String>,
    pub available: bool,
    pub bookings: Vec<Booking>,
}

impl ItemState {
    pub fn new(id: Ulid, owner_id: Ulid, name: Option<String>, available: bool) -> Self {
        Self {
            id,
            owner_id,
            name,
            available,
            bookings: Vec::new(),
        }
    }

    /// Insert preserving sort order by span.start.
    pub fn insert_booking(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .binary_search_by_key(&booking.span.start, |b| b.span.start)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    pub fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }
}

/// The event types — flat, no nesting. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    UserRegistered {
        id: Ulid,
        name: Option<String>,
    },
    ItemListed {
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        available: bool,
    },
    ItemAvailabilitySet {
        id: Ulid,
        available: bool,
    },
    BookingRequested {
        id: Ulid,
        item_id: Ulid,
        booker_id: Ulid,
        span: Span,
    },
    BookingDecided {
        id: Ulid,
        item_id: Ulid,
        approved: bool,
    },
}

// ── Query projections ────────────────────────────────────────────

/// A booking as rows leave the engine: the item id is denormalized in so
/// the wire layer never needs a second lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRecord {
    pub id: Ulid,
    pub item_id: Ulid,
    pub booker_id: Ulid,
    pub start: Ms,
    pub end: Ms,
    pub status: BookingStatus,
}

impl BookingRecord {
    pub fn of(item_id: Ulid, booking: &Booking) -> Self {
        Self {
            id: booking.id,
            item_id,
            booker_id: booking.booker_id,
            start: booking.span.start,
            end: booking.span.end,
            status: booking.status,
        }
    }
}

/// Per-item last/next view for the catalog. Recomputed on every read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemSchedule {
    pub item_id: Ulid,
    pub last: Option<BookingRecord>,
    pub next: Option<BookingRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(start: Ms, end: Ms) -> Booking {
        Booking {
            id: Ulid::new(),
            booker_id: Ulid::new(),
            span: Span::new(start, end),
            status: BookingStatus::Waiting,
        }
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn status_active() {
        assert!(BookingStatus::Waiting.is_active());
        assert!(BookingStatus::Approved.is_active());
        assert!(!BookingStatus::Rejected.is_active());
        assert!(!BookingStatus::Canceled.is_active());
    }

    #[test]
    fn state_filter_parse() {
        assert_eq!(StateFilter::parse("ALL"), Some(StateFilter::All));
        assert_eq!(StateFilter::parse("waiting"), Some(StateFilter::Waiting));
        assert_eq!(StateFilter::parse("Future"), Some(StateFilter::Future));
        assert_eq!(StateFilter::parse("SOMEDAY"), None);
        assert_eq!(StateFilter::parse(""), None);
    }

    #[test]
    fn booking_insert_keeps_order() {
        let mut item = ItemState::new(Ulid::new(), Ulid::new(), None, true);
        item.insert_booking(booking(300, 400));
        item.insert_booking(booking(100, 200));
        item.insert_booking(booking(200, 300));
        assert_eq!(item.bookings[0].span.start, 100);
        assert_eq!(item.bookings[1].span.start, 200);
        assert_eq!(item.bookings[2].span.start, 300);
    }

    #[test]
    fn booking_lookup() {
        let mut item = ItemState::new(Ulid::new(), Ulid::new(), None, true);
        let b = booking(100, 200);
        item.insert_booking(b);
        assert_eq!(item.booking(&b.id), Some(&b));
        assert!(item.booking(&Ulid::new()).is_none());
    }

    #[test]
    fn booking_record_projection() {
        let item_id = Ulid::new();
        let b = booking(100, 200);
        let rec = BookingRecord::of(item_id, &b);
        assert_eq!(rec.id, b.id);
        assert_eq!(rec.item_id, item_id);
        assert_eq!(rec.start, 100);
        assert_eq!(rec.end, 200);
        assert_eq!(rec.status, BookingStatus::Waiting);
    }

    #[test]
    fn event_roundtrip() {
        let event = Event::BookingRequested {
            id: Ulid::new(),
            item_id: Ulid::new(),
            booker_id: Ulid::new(),
            span: Span::new(1000, 2000),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
