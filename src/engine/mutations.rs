use chrono::NaiveDate;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_admission, validate_id, validate_span};
use super::{Engine, EngineError, NotFound};

fn validate_reason(reason: &Option<String>) -> Result<(), EngineError> {
    if let Some(r) = reason
        && r.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
    Ok(())
}

/// Check and normalize a schedule: exceptions end up sorted with one entry
/// per date (the last one given wins).
fn normalize_availability(mut availability: Availability) -> Result<Availability, EngineError> {
    validate_id("professional_id", &availability.professional_id)?;
    if let Some(bad) = availability.days.iter().find(|d| **d > 6) {
        return Err(EngineError::invalid(format!(
            "weekday {bad} out of range 0 (Sunday) ..= 6 (Saturday)"
        )));
    }
    if availability.start_time >= availability.end_time {
        return Err(EngineError::invalid(format!(
            "start_time {} must be before end_time {}",
            availability.start_time.format("%H:%M"),
            availability.end_time.format("%H:%M")
        )));
    }
    if !(0..=MAX_BUFFER_MINUTES).contains(&availability.buffer_minutes) {
        return Err(EngineError::invalid(format!(
            "buffer_minutes must be within 0..={MAX_BUFFER_MINUTES}"
        )));
    }
    if availability.exceptions.len() > MAX_EXCEPTIONS {
        return Err(EngineError::LimitExceeded("too many exception dates"));
    }
    let given = std::mem::take(&mut availability.exceptions);
    for exception in given {
        validate_reason(&exception.reason)?;
        availability.upsert_exception(exception);
    }
    Ok(availability)
}

impl Engine {
    // ── Availability ─────────────────────────────────────────

    /// Create or replace the professional's schedule, exceptions included.
    pub async fn upsert_availability(&self, availability: Availability) -> Result<(), EngineError> {
        let availability = normalize_availability(availability)?;
        let ledger = self.ledger_or_create(&availability.professional_id)?;
        let guard = ledger.write_owned().await;
        info!(
            "availability set for {}: days {:?} {}-{} buffer {}m",
            availability.professional_id,
            availability.days,
            availability.start_time.format("%H:%M"),
            availability.end_time.format("%H:%M"),
            availability.buffer_minutes
        );
        self.commit(guard, Event::AvailabilitySet { availability }).await
    }

    pub async fn delete_availability(&self, professional_id: &str) -> Result<(), EngineError> {
        let missing = || EngineError::NotFound(NotFound::Availability(professional_id.to_string()));
        let ledger = self.ledger(professional_id).ok_or_else(missing)?;
        let guard = ledger.write_owned().await;
        if guard.availability.is_none() {
            return Err(missing());
        }
        let event = Event::AvailabilityDeleted {
            professional_id: professional_id.to_string(),
        };
        self.commit(guard, event).await
    }

    pub async fn add_exception(
        &self,
        professional_id: &str,
        exception: ExceptionDate,
    ) -> Result<(), EngineError> {
        validate_reason(&exception.reason)?;
        let missing = || EngineError::NotFound(NotFound::Availability(professional_id.to_string()));
        let ledger = self.ledger(professional_id).ok_or_else(missing)?;
        let guard = ledger.write_owned().await;
        let availability = guard.availability.as_ref().ok_or_else(missing)?;
        if !availability.is_exception(exception.date) && availability.exceptions.len() >= MAX_EXCEPTIONS {
            return Err(EngineError::LimitExceeded("too many exception dates"));
        }
        let event = Event::ExceptionAdded {
            professional_id: professional_id.to_string(),
            exception,
        };
        self.commit(guard, event).await
    }

    pub async fn remove_exception(&self, professional_id: &str, date: NaiveDate) -> Result<(), EngineError> {
        let missing = || EngineError::NotFound(NotFound::Availability(professional_id.to_string()));
        let ledger = self.ledger(professional_id).ok_or_else(missing)?;
        let guard = ledger.write_owned().await;
        let availability = guard.availability.as_ref().ok_or_else(missing)?;
        if !availability.is_exception(date) {
            return Err(EngineError::NotFound(NotFound::Exception(date)));
        }
        let event = Event::ExceptionRemoved {
            professional_id: professional_id.to_string(),
            date,
        };
        self.commit(guard, event).await
    }

    // ── Blocked time ─────────────────────────────────────────

    /// Block a range. Existing bookings inside it are left alone; the block
    /// only stops new slots and new bookings.
    pub async fn add_blocked_time(&self, blocked: BlockedTime) -> Result<(), EngineError> {
        validate_id("professional_id", &blocked.professional_id)?;
        validate_span(&blocked.span)?;
        validate_reason(&blocked.reason)?;
        if self.record_owner(&blocked.id).is_some() {
            return Err(EngineError::AlreadyExists(blocked.id));
        }
        let ledger = self.ledger_or_create(&blocked.professional_id)?;
        let guard = ledger.write_owned().await;
        if guard.record_count() >= MAX_RECORDS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many records for professional"));
        }
        let id = blocked.id;
        self.claim_record_id(id, &blocked.professional_id)?;
        self.commit_claimed(guard, Event::BlockedTimeAdded { blocked }, id)
            .await
    }

    /// Returns the owning professional.
    pub async fn remove_blocked_time(&self, id: Ulid) -> Result<String, EngineError> {
        let guard = self.resolve_record_write(id, NotFound::BlockedTime(id)).await?;
        if !guard.blocked.iter().any(|b| b.id == id) {
            return Err(EngineError::NotFound(NotFound::BlockedTime(id)));
        }
        let professional_id = guard.professional_id.clone();
        let event = Event::BlockedTimeRemoved {
            id,
            professional_id: professional_id.clone(),
        };
        self.commit(guard, event).await?;
        Ok(professional_id)
    }

    // ── Bookings ─────────────────────────────────────────────

    /// Admission controller: validate, check for overlap with active bookings
    /// and blocked time, then record the booking as pending.
    ///
    /// The professional's write lock is held from the overlap check until the
    /// booking is applied, so two overlapping requests for the same
    /// professional can never both be admitted.
    pub async fn request_booking(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        let result = self.admit(request).await;
        match &result {
            Ok(booking) => {
                metrics::counter!(crate::observability::BOOKINGS_ADMITTED_TOTAL).increment(1);
                info!(
                    "booking {} admitted for {} [{}, {})",
                    booking.id, booking.professional_id, booking.span.start, booking.span.end
                );
            }
            Err(e) => {
                metrics::counter!(crate::observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.kind())
                    .increment(1);
                debug!("booking rejected: {e}");
            }
        }
        result
    }

    async fn admit(&self, request: BookingRequest) -> Result<Booking, EngineError> {
        validate_id("professional_id", &request.professional_id)?;
        if let Some(client) = &request.client_id {
            validate_id("client_id", client)?;
        }
        if request.service.trim().is_empty() {
            return Err(EngineError::invalid("service must not be empty"));
        }
        if request.service.len() > MAX_SERVICE_LEN {
            return Err(EngineError::LimitExceeded("service too long"));
        }
        if request.start >= request.end {
            return Err(EngineError::invalid(format!(
                "start ({}) must be before end ({})",
                request.start, request.end
            )));
        }
        let span = Span::new(request.start, request.end);
        validate_span(&span)?;
        if self.record_owner(&request.id).is_some() {
            return Err(EngineError::AlreadyExists(request.id));
        }

        let ledger = self.ledger_or_create(&request.professional_id)?;
        let guard = ledger.write_owned().await;
        if guard.record_count() >= MAX_RECORDS_PER_PROFESSIONAL {
            return Err(EngineError::LimitExceeded("too many records for professional"));
        }
        check_admission(&guard, &span)?;
        self.claim_record_id(request.id, &request.professional_id)?;

        let booking = Booking {
            id: request.id,
            professional_id: request.professional_id,
            client_id: request.client_id,
            service: request.service,
            span,
            status: BookingStatus::Pending,
            created_at: self.now_ms(),
        };
        self.commit_claimed(guard, Event::BookingRequested { booking: booking.clone() }, booking.id)
            .await?;
        Ok(booking)
    }

    /// Move a booking along `pending → {confirmed, cancelled}`,
    /// `confirmed → cancelled`, or any non-terminal state to `expired`.
    pub async fn update_booking_status(
        &self,
        id: Ulid,
        status: BookingStatus,
    ) -> Result<Booking, EngineError> {
        let guard = self.resolve_record_write(id, NotFound::Booking(id)).await?;
        let current = guard
            .booking(id)
            .cloned()
            .ok_or(EngineError::NotFound(NotFound::Booking(id)))?;
        if !current.status.can_transition_to(status) {
            return Err(EngineError::invalid(format!(
                "booking {id} cannot move from {} to {status}",
                current.status
            )));
        }
        let event = Event::BookingStatusChanged {
            id,
            professional_id: current.professional_id.clone(),
            status,
        };
        self.commit(guard, event).await?;
        info!("booking {id}: {} -> {status}", current.status);
        Ok(Booking { status, ..current })
    }

    /// Expire `id` if it is still pending and its start is at or before `now`.
    /// Returns whether it was expired; a booking confirmed in the meantime is
    /// left alone.
    pub async fn expire_stale_booking(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let guard = self.resolve_record_write(id, NotFound::Booking(id)).await?;
        let Some(booking) = guard.booking(id) else {
            return Err(EngineError::NotFound(NotFound::Booking(id)));
        };
        if booking.status != BookingStatus::Pending || booking.span.start > now {
            return Ok(false);
        }
        let event = Event::BookingStatusChanged {
            id,
            professional_id: booking.professional_id.clone(),
            status: BookingStatus::Expired,
        };
        self.commit(guard, event).await?;
        Ok(true)
    }
}
