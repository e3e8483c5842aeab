//! Pure temporal classification. Everything here is a function of the
//! booking list and an explicit `now`; no clocks, no locks, no I/O.

use crate::model::{Booking, Ms, Span, StateFilter};

/// Where a window sits relative to `now`. Endpoints are inclusive on both
/// sides for CURRENT, so `end == now` is still CURRENT, not PAST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeState {
    Past,
    Current,
    Future,
}

pub fn time_state(span: Span, now: Ms) -> TimeState {
    if span.end < now {
        TimeState::Past
    } else if span.start > now {
        TimeState::Future
    } else {
        TimeState::Current
    }
}

impl StateFilter {
    pub fn matches(&self, booking: &Booking, now: Ms) -> bool {
        match self {
            StateFilter::All => true,
            StateFilter::Past => time_state(booking.span, now) == TimeState::Past,
            StateFilter::Current => time_state(booking.span, now) == TimeState::Current,
            StateFilter::Future => time_state(booking.span, now) == TimeState::Future,
            StateFilter::Waiting => booking.status == crate::model::BookingStatus::Waiting,
            StateFilter::Rejected => booking.status == crate::model::BookingStatus::Rejected,
        }
    }
}

/// Most recently finished active booking: maximal `end ≤ now`, ties broken
/// by the larger `start`.
pub fn last_booking(bookings: &[Booking], now: Ms) -> Option<&Booking> {
    bookings
        .iter()
        .filter(|b| b.status.is_active() && b.span.end <= now)
        .max_by_key(|b| (b.span.end, b.span.start))
}

/// Active booking covering `now`, if any. The list is sorted by start and
/// windows may overlap; the earliest-starting cover wins.
pub fn current_booking(bookings: &[Booking], now: Ms) -> Option<&Booking> {
    bookings
        .iter()
        .find(|b| b.status.is_active() && b.span.start <= now && now <= b.span.end)
}

/// Soonest upcoming active booking: minimal `start ≥ now`.
pub fn next_booking(bookings: &[Booking], now: Ms) -> Option<&Booking> {
    bookings
        .iter()
        .filter(|b| b.status.is_active() && b.span.start >= now)
        .min_by_key(|b| b.span.start)
}

/// The (last, next) pair shown on the catalog card.
///
/// When nothing has finished yet but a booking covers `now`, that in-progress
/// booking is reported as "last" and "next" is suppressed even if later
/// bookings exist. The card then reads "in use now" rather than promising an
/// upcoming slot that may shift.
pub fn schedule(bookings: &[Booking], now: Ms) -> (Option<&Booking>, Option<&Booking>) {
    if let Some(last) = last_booking(bookings, now) {
        (Some(last), next_booking(bookings, now))
    } else if let Some(cur) = current_booking(bookings, now) {
        (Some(cur), None)
    } else {
        (None, next_booking(bookings, now))
    }
}
