use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::slots::{generate_slots, validate_duration};
use super::{Engine, EngineError, NotFound};

impl Engine {
    /// Bookable slots for `professional_id` on `date`.
    ///
    /// A professional without a schedule is `NotFound`, distinct from a
    /// configured schedule that yields zero slots.
    pub async fn compute_slots(
        &self,
        professional_id: &str,
        date: NaiveDate,
        duration_minutes: i64,
    ) -> Result<Vec<Slot>, EngineError> {
        validate_duration(duration_minutes)?;
        let missing = || EngineError::NotFound(NotFound::Availability(professional_id.to_string()));
        let ledger = self.ledger(professional_id).ok_or_else(missing)?;
        let guard = ledger.read().await;
        let availability = guard.availability.as_ref().ok_or_else(missing)?;

        let window = availability.working_window(date);
        let bookings: Vec<Booking> = guard
            .active_bookings_overlapping(&window)
            .cloned()
            .collect();
        let blocked: Vec<BlockedTime> = guard.blocked_overlapping(&window).cloned().collect();

        generate_slots(
            date,
            availability,
            &bookings,
            &blocked,
            duration_minutes,
            self.now_ms(),
            self.policy(),
        )
    }

    pub async fn get_availability(&self, professional_id: &str) -> Result<Availability, EngineError> {
        let missing = || EngineError::NotFound(NotFound::Availability(professional_id.to_string()));
        let ledger = self.ledger(professional_id).ok_or_else(missing)?;
        let guard = ledger.read().await;
        guard.availability.clone().ok_or_else(missing)
    }

    pub async fn list_blocked_time(&self, professional_id: &str) -> Vec<BlockedTime> {
        match self.ledger(professional_id) {
            Some(ledger) => ledger.read().await.blocked.clone(),
            None => Vec::new(),
        }
    }

    /// All bookings of a professional in start order, terminal ones included.
    pub async fn list_bookings(&self, professional_id: &str) -> Vec<Booking> {
        match self.ledger(professional_id) {
            Some(ledger) => ledger.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let missing = || EngineError::NotFound(NotFound::Booking(id));
        let pid = self.record_owner(&id).ok_or_else(missing)?;
        let ledger = self.ledger(&pid).ok_or_else(missing)?;
        let guard = ledger.read().await;
        guard.booking(id).cloned().ok_or_else(missing)
    }

    /// Pending bookings whose start has passed without confirmation.
    pub async fn collect_expirable_bookings(&self, now: Ms) -> Vec<Ulid> {
        let mut stale = Vec::new();
        for ledger in self.all_ledgers() {
            let guard = ledger.read().await;
            stale.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Pending && b.span.start <= now)
                    .map(|b| b.id),
            );
        }
        stale
    }
}
