use chrono::NaiveDate;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

// ── Slot Generation ───────────────────────────────────────────────

/// Booking horizon relative to "now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotPolicy {
    /// Candidates starting before `now + min_notice_ms` are dropped.
    pub min_notice_ms: Ms,
    /// Candidates starting after `now + max_advance_ms` are dropped.
    pub max_advance_ms: Ms,
}

impl Default for SlotPolicy {
    fn default() -> Self {
        Self {
            min_notice_ms: DEFAULT_MIN_NOTICE_MS,
            max_advance_ms: DEFAULT_MAX_ADVANCE_MS,
        }
    }
}

pub fn validate_duration(duration_minutes: i64) -> Result<(), EngineError> {
    if duration_minutes <= 0 {
        return Err(EngineError::invalid(format!(
            "duration must be positive, got {duration_minutes}"
        )));
    }
    if duration_minutes > MAX_SLOT_DURATION_MINUTES {
        return Err(EngineError::invalid(format!(
            "duration must be at most {MAX_SLOT_DURATION_MINUTES} minutes"
        )));
    }
    Ok(())
}

/// Compute the bookable slots of one calendar day.
///
/// Candidates start at the working window's start and advance by
/// `duration + buffer`; a candidate whose end would pass the window end stops
/// the walk. A candidate is omitted when it overlaps an active booking or a
/// blocked range, when `date` is an exception date, or when it falls outside
/// the notice/advance horizon. Survivors come back in chronological order.
///
/// `bookings` and `blocked` are expected to be pre-filtered to the day; they
/// are not re-filtered here. Cancelled/expired bookings are ignored.
pub fn generate_slots(
    date: NaiveDate,
    availability: &Availability,
    bookings: &[Booking],
    blocked: &[BlockedTime],
    duration_minutes: i64,
    now: Ms,
    policy: SlotPolicy,
) -> Result<Vec<Slot>, EngineError> {
    validate_duration(duration_minutes)?;

    if !availability.works_on(date) || availability.is_exception(date) {
        return Ok(Vec::new());
    }

    let window = availability.working_window(date);
    let duration = duration_minutes * MINUTE_MS;
    let step = duration + availability.buffer_minutes.max(0) * MINUTE_MS;
    let earliest = now + policy.min_notice_ms;
    let latest = now + policy.max_advance_ms;

    let mut busy: Vec<Span> = bookings
        .iter()
        .filter(|b| b.status.is_active())
        .map(|b| b.span)
        .chain(blocked.iter().map(|b| b.span))
        .collect();
    busy.sort_by_key(|s| s.start);
    let busy = merge_overlapping(&busy);

    // Candidates advance monotonically, so one cursor over the merged busy
    // list is enough.
    let mut slots = Vec::new();
    let mut bi = 0;
    let mut start = window.start;
    while start + duration <= window.end {
        let candidate = Span::new(start, start + duration);

        while bi < busy.len() && busy[bi].end <= candidate.start {
            bi += 1;
        }
        let collides = bi < busy.len() && busy[bi].start < candidate.end;

        if !collides && start >= earliest && start <= latest {
            slots.push(Slot {
                start: candidate.start,
                end: candidate.end,
            });
        }
        start += step;
    }

    Ok(slots)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;
    use ulid::Ulid;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    fn midnight(s: &str) -> Ms {
        date(s).and_hms_opt(0, 0, 0).unwrap().and_utc().timestamp_millis()
    }

    fn weekdays(buffer_minutes: i64) -> Availability {
        Availability {
            professional_id: "pro".into(),
            days: [1, 2, 3, 4, 5].into_iter().collect(),
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            buffer_minutes,
            exceptions: Vec::new(),
        }
    }

    fn booking(start: Ms, end: Ms, status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            professional_id: "pro".into(),
            client_id: None,
            service: "consult".into(),
            span: Span::new(start, end),
            status,
            created_at: 0,
        }
    }

    fn blocked(start: Ms, end: Ms) -> BlockedTime {
        BlockedTime {
            id: Ulid::new(),
            professional_id: "pro".into(),
            span: Span::new(start, end),
            reason: Some("lunch".into()),
        }
    }

    // Friday 2026-10-16; Monday 2026-10-26 is ten days later.
    fn now() -> Ms {
        midnight("2026-10-16")
    }

    fn hours_of(slots: &[Slot], day: Ms) -> Vec<(Ms, Ms)> {
        slots
            .iter()
            .map(|s| ((s.start - day) / M, (s.end - day) / M))
            .collect()
    }

    #[test]
    fn beyond_advance_window_is_empty() {
        let slots = generate_slots(
            date("2026-11-23"),
            &weekdays(0),
            &[],
            &[],
            60,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn free_day_yields_eight_hourly_slots() {
        let day = midnight("2026-10-26");
        let slots = generate_slots(
            date("2026-10-26"),
            &weekdays(0),
            &[],
            &[],
            60,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        assert_eq!(slots.len(), 8);
        assert_eq!(slots[0], Slot { start: day + 9 * H, end: day + 10 * H });
        assert_eq!(slots[7], Slot { start: day + 16 * H, end: day + 17 * H });
    }

    #[test]
    fn booking_removes_its_slot() {
        let day = midnight("2026-10-26");
        let taken = booking(day + 11 * H, day + 12 * H, BookingStatus::Pending);
        let slots = generate_slots(
            date("2026-10-26"),
            &weekdays(0),
            &[taken],
            &[],
            60,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        assert_eq!(slots.len(), 7);
        assert!(slots.iter().all(|s| s.start != day + 11 * H));
    }

    #[test]
    fn cancelled_booking_frees_its_slot() {
        let day = midnight("2026-10-26");
        let gone = booking(day + 11 * H, day + 12 * H, BookingStatus::Cancelled);
        let expired = booking(day + 13 * H, day + 14 * H, BookingStatus::Expired);
        let slots = generate_slots(
            date("2026-10-26"),
            &weekdays(0),
            &[gone, expired],
            &[],
            60,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        assert_eq!(slots.len(), 8);
    }

    #[test]
    fn buffer_spaces_slots() {
        let day = midnight("2026-10-26");
        let slots = generate_slots(
            date("2026-10-26"),
            &weekdays(15),
            &[],
            &[],
            60,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        assert_eq!(
            hours_of(&slots, day),
            vec![
                (540, 600),
                (615, 675),
                (690, 750),
                (765, 825),
                (840, 900),
                (915, 975),
            ]
        );
    }

    #[test]
    fn trailing_partial_window_dropped() {
        let day = midnight("2026-10-26");
        let slots = generate_slots(
            date("2026-10-26"),
            &weekdays(0),
            &[],
            &[],
            90,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        // 09:00 .. 16:30 in 90-minute steps; 16:30-18:00 would overrun.
        assert_eq!(slots.len(), 5);
        assert_eq!(slots.last().unwrap().end, day + 16 * H + 30 * M);
    }

    #[test]
    fn blocked_range_excludes_every_touched_slot() {
        let day = midnight("2026-10-26");
        let lunch = blocked(day + 12 * H + 30 * M, day + 13 * H + 30 * M);
        let slots = generate_slots(
            date("2026-10-26"),
            &weekdays(0),
            &[],
            &[lunch],
            60,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        assert_eq!(slots.len(), 6);
        assert!(slots.iter().all(|s| s.start != day + 12 * H && s.start != day + 13 * H));
    }

    #[test]
    fn weekend_is_empty() {
        let slots = generate_slots(
            date("2026-10-25"),
            &weekdays(0),
            &[],
            &[],
            60,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn exception_date_is_empty() {
        let mut availability = weekdays(0);
        availability.upsert_exception(ExceptionDate {
            date: date("2026-10-26"),
            reason: Some("conference".into()),
        });
        let slots = generate_slots(
            date("2026-10-26"),
            &availability,
            &[],
            &[],
            60,
            now(),
            SlotPolicy::default(),
        )
        .unwrap();
        assert!(slots.is_empty());
    }

    #[test]
    fn notice_window_drops_early_slots() {
        let day = midnight("2026-10-26");
        // "now" is Sunday 12:30, so anything before Monday 12:30 is too soon.
        let slots = generate_slots(
            date("2026-10-26"),
            &weekdays(0),
            &[],
            &[],
            60,
            day - 24 * H + 12 * H + 30 * M,
            SlotPolicy::default(),
        )
        .unwrap();
        assert_eq!(slots.first().unwrap().start, day + 13 * H);
        assert_eq!(slots.len(), 4);
    }

    #[test]
    fn custom_policy_is_honoured() {
        let day = midnight("2026-10-26");
        let policy = SlotPolicy {
            min_notice_ms: 0,
            max_advance_ms: 10 * H,
        };
        let slots = generate_slots(date("2026-10-26"), &weekdays(0), &[], &[], 60, day, policy).unwrap();
        assert_eq!(hours_of(&slots, day), vec![(540, 600), (600, 660)]);
    }

    #[test]
    fn non_positive_duration_rejected() {
        for d in [0, -30] {
            let result = generate_slots(
                date("2026-10-26"),
                &weekdays(0),
                &[],
                &[],
                d,
                now(),
                SlotPolicy::default(),
            );
            assert!(matches!(result, Err(EngineError::Validation(_))));
        }
    }

    #[test]
    fn oversized_duration_rejected() {
        assert!(validate_duration(MAX_SLOT_DURATION_MINUTES).is_ok());
        assert!(validate_duration(MAX_SLOT_DURATION_MINUTES + 1).is_err());
    }

    #[test]
    fn merge_overlapping_basic() {
        let spans = vec![Span::new(100, 300), Span::new(200, 400), Span::new(500, 600)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 400), Span::new(500, 600)]
        );
        assert_eq!(
            merge_overlapping(&[Span::new(100, 200), Span::new(200, 300)]),
            vec![Span::new(100, 300)]
        );
        assert!(merge_overlapping(&[]).is_empty());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        const DAY: &str = "2026-10-28"; // Wednesday

        fn arb_availability() -> impl Strategy<Value = Availability> {
            (0u32..20, 1u32..5, 0i64..45).prop_map(|(start_h, len_h, buffer)| Availability {
                professional_id: "pro".into(),
                days: (0..=6).collect(),
                start_time: NaiveTime::from_hms_opt(start_h, 0, 0).unwrap(),
                end_time: NaiveTime::from_hms_opt((start_h + len_h).min(23), 59, 0).unwrap(),
                buffer_minutes: buffer,
                exceptions: Vec::new(),
            })
        }

        fn arb_busy() -> impl Strategy<Value = Vec<(Ms, Ms)>> {
            prop::collection::vec((0i64..24 * 60, 1i64..180), 0..6).prop_map(|v| {
                v.into_iter()
                    .map(|(start_min, len_min)| (start_min * M, (start_min + len_min) * M))
                    .collect()
            })
        }

        fn arb_status() -> impl Strategy<Value = BookingStatus> {
            prop_oneof![
                Just(BookingStatus::Pending),
                Just(BookingStatus::Confirmed),
                Just(BookingStatus::Cancelled),
                Just(BookingStatus::Expired),
            ]
        }

        proptest! {
            #[test]
            fn slots_stay_inside_working_window(
                availability in arb_availability(),
                duration in 5i64..240,
            ) {
                let day = midnight(DAY);
                let window = availability.working_window(date(DAY));
                let slots = generate_slots(
                    date(DAY), &availability, &[], &[], duration, day - 5 * 24 * H, SlotPolicy::default(),
                ).unwrap();
                for s in &slots {
                    prop_assert!(window.contains_span(&s.span()));
                    prop_assert_eq!(s.end - s.start, duration * M);
                }
                for pair in slots.windows(2) {
                    prop_assert!(pair[1].start >= pair[0].end + availability.buffer_minutes * M);
                }
            }

            #[test]
            fn slots_never_touch_busy_time(
                availability in arb_availability(),
                booked in arb_busy(),
                statuses in prop::collection::vec(arb_status(), 6),
                blocks in arb_busy(),
                duration in 5i64..120,
            ) {
                let day = midnight(DAY);
                let bookings: Vec<Booking> = booked
                    .iter()
                    .zip(statuses.iter())
                    .map(|(&(s, e), &st)| booking(day + s, day + e, st))
                    .collect();
                let blocked: Vec<BlockedTime> =
                    blocks.iter().map(|&(s, e)| blocked(day + s, day + e)).collect();

                let slots = generate_slots(
                    date(DAY), &availability, &bookings, &blocked, duration, day - 5 * 24 * H, SlotPolicy::default(),
                ).unwrap();

                for s in &slots {
                    let span = s.span();
                    for b in bookings.iter().filter(|b| b.status.is_active()) {
                        prop_assert!(!span.overlaps(&b.span));
                    }
                    for b in &blocked {
                        prop_assert!(!span.overlaps(&b.span));
                    }
                }
            }

            #[test]
            fn slots_respect_notice_and_advance(
                availability in arb_availability(),
                duration in 5i64..240,
                now_offset_min in -(40i64 * 24 * 60)..(2 * 24 * 60),
            ) {
                let now = midnight(DAY) + now_offset_min * M;
                let slots = generate_slots(
                    date(DAY), &availability, &[], &[], duration, now, SlotPolicy::default(),
                ).unwrap();
                for s in &slots {
                    prop_assert!(s.start >= now + DEFAULT_MIN_NOTICE_MS);
                    prop_assert!(s.start <= now + DEFAULT_MAX_ADVANCE_MS);
                }
            }

            #[test]
            fn regeneration_is_identical(
                availability in arb_availability(),
                booked in arb_busy(),
                duration in 5i64..240,
            ) {
                let day = midnight(DAY);
                let bookings: Vec<Booking> = booked
                    .iter()
                    .map(|&(s, e)| booking(day + s, day + e, BookingStatus::Confirmed))
                    .collect();
                let run = || generate_slots(
                    date(DAY), &availability, &bookings, &[], duration, day - 3 * 24 * H, SlotPolicy::default(),
                ).unwrap();
                let first = run();
                let second = run();
                prop_assert_eq!(&first, &second);
                for pair in first.windows(2) {
                    prop_assert!(pair[0].start < pair[1].start);
                }
            }
        }
    }
}
