use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, UTC. The only instant type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
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

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    #[cfg(test)]
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A calendar day on which the professional takes no bookings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionDate {
    pub date: NaiveDate,
    pub reason: Option<String>,
}

/// Weekly recurring working hours for one professional.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub professional_id: String,
    /// Weekday numbers, 0 = Sunday .. 6 = Saturday.
    pub days: BTreeSet<u8>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub buffer_minutes: i64,
    /// Sorted by date, at most one entry per date.
    pub exceptions: Vec<ExceptionDate>,
}

impl Availability {
    pub fn works_on(&self, date: NaiveDate) -> bool {
        let weekday = date.weekday().num_days_from_sunday() as u8;
        self.days.contains(&weekday)
    }

    pub fn is_exception(&self, date: NaiveDate) -> bool {
        self.exceptions
            .binary_search_by_key(&date, |e| e.date)
            .is_ok()
    }

    /// `[date @ start_time, date @ end_time)` in UTC.
    pub fn working_window(&self, date: NaiveDate) -> Span {
        let start = date.and_time(self.start_time).and_utc().timestamp_millis();
        let end = date.and_time(self.end_time).and_utc().timestamp_millis();
        Span::new(start, end)
    }

    /// Insert or replace the exception for `exception.date`.
    pub fn upsert_exception(&mut self, exception: ExceptionDate) {
        match self
            .exceptions
            .binary_search_by_key(&exception.date, |e| e.date)
        {
            Ok(pos) => self.exceptions[pos] = exception,
            Err(pos) => self.exceptions.insert(pos, exception),
        }
    }

    pub fn remove_exception(&mut self, date: NaiveDate) -> Option<ExceptionDate> {
        self.exceptions
            .binary_search_by_key(&date, |e| e.date)
            .ok()
            .map(|pos| self.exceptions.remove(pos))
    }
}

/// Professional-initiated range that is never bookable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTime {
    pub id: Ulid,
    pub professional_id: String,
    pub span: Span,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Expired,
}

impl BookingStatus {
    /// Pending and confirmed bookings hold their time range.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Cancelled and expired are final; anything live may be cancelled or
    /// expired, and only pending may be confirmed.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!((self, next), (Pending, Confirmed) | (_, Cancelled) | (_, Expired))
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(BookingStatus::Pending),
            "confirmed" => Ok(BookingStatus::Confirmed),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            "expired" => Ok(BookingStatus::Expired),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub professional_id: String,
    /// Anonymous bookings carry no client.
    pub client_id: Option<String>,
    pub service: String,
    pub span: Span,
    pub status: BookingStatus,
    pub created_at: Ms,
}

/// What a client submits to book. The id is client-generated so a retried
/// request cannot create a second record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub professional_id: String,
    pub client_id: Option<String>,
    pub service: String,
    pub start: Ms,
    pub end: Ms,
}

/// A bookable range produced by the slot generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub start: Ms,
    pub end: Ms,
}

impl Slot {
    #[cfg(test)]
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// Records kept in start order inside a ledger.
pub trait Timed {
    fn span(&self) -> Span;
}

impl Timed for BlockedTime {
    fn span(&self) -> Span {
        self.span
    }
}

impl Timed for Booking {
    fn span(&self) -> Span {
        self.span
    }
}

/// Insert maintaining sort order by `span.start`.
fn insert_sorted<T: Timed>(items: &mut Vec<T>, item: T) {
    let pos = items
        .binary_search_by_key(&item.span().start, |i| i.span().start)
        .unwrap_or_else(|e| e);
    items.insert(pos, item);
}

/// Items whose span overlaps `query`. Binary search skips everything
/// starting at or after `query.end`.
fn overlapping<'a, T: Timed>(items: &'a [T], query: &Span) -> impl Iterator<Item = &'a T> {
    let right_bound = items.partition_point(|i| i.span().start < query.end);
    let query_start = query.start;
    items[..right_bound]
        .iter()
        .filter(move |i| i.span().end > query_start)
}

/// Everything the engine knows about one professional. Guarded by a single
/// lock so that conflict checks and inserts are serialized per professional.
#[derive(Debug, Clone)]
pub struct Ledger {
    pub professional_id: String,
    pub availability: Option<Availability>,
    /// Sorted by `span.start`.
    pub blocked: Vec<BlockedTime>,
    /// Sorted by `span.start`, all statuses.
    pub bookings: Vec<Booking>,
}

impl Ledger {
    pub fn new(professional_id: String) -> Self {
        Self {
            professional_id,
            availability: None,
            blocked: Vec::new(),
            bookings: Vec::new(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.blocked.len() + self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.availability.is_none() && self.blocked.is_empty() && self.bookings.is_empty()
    }

    pub fn insert_blocked(&mut self, blocked: BlockedTime) {
        insert_sorted(&mut self.blocked, blocked);
    }

    pub fn remove_blocked(&mut self, id: Ulid) -> Option<BlockedTime> {
        let pos = self.blocked.iter().position(|b| b.id == id)?;
        Some(self.blocked.remove(pos))
    }

    pub fn insert_booking(&mut self, booking: Booking) {
        insert_sorted(&mut self.bookings, booking);
    }

    pub fn booking(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    pub fn blocked_overlapping(&self, query: &Span) -> impl Iterator<Item = &BlockedTime> {
        overlapping(&self.blocked, query)
    }

    /// Pending and confirmed bookings overlapping `query`.
    pub fn active_bookings_overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        overlapping(&self.bookings, query).filter(|b| b.status.is_active())
    }
}

/// Flat event types; this is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AvailabilitySet {
        availability: Availability,
    },
    AvailabilityDeleted {
        professional_id: String,
    },
    ExceptionAdded {
        professional_id: String,
        exception: ExceptionDate,
    },
    ExceptionRemoved {
        professional_id: String,
        date: NaiveDate,
    },
    BlockedTimeAdded {
        blocked: BlockedTime,
    },
    BlockedTimeRemoved {
        id: Ulid,
        professional_id: String,
    },
    BookingRequested {
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        professional_id: String,
        status: BookingStatus,
    },
}

impl Event {
    pub fn professional_id(&self) -> &str {
        match self {
            Event::AvailabilitySet { availability } => &availability.professional_id,
            Event::BlockedTimeAdded { blocked } => &blocked.professional_id,
            Event::BookingRequested { booking } => &booking.professional_id,
            Event::AvailabilityDeleted { professional_id }
            | Event::ExceptionAdded { professional_id, .. }
            | Event::ExceptionRemoved { professional_id, .. }
            | Event::BlockedTimeRemoved { professional_id, .. }
            | Event::BookingStatusChanged { professional_id, .. } => professional_id,
        }
    }
}
