use std::collections::HashMap;

use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::classify::schedule;
use super::{Engine, EngineError};

/// Page bounds: zero-based offset, at least one row, capped size.
fn validate_page(from: i64, size: i64) -> Result<(), EngineError> {
    if from < 0 || size < 1 {
        return Err(EngineError::Pagination { from, size });
    }
    if size > MAX_PAGE_SIZE {
        return Err(EngineError::LimitExceeded("page size too large"));
    }
    Ok(())
}

/// Sort newest-start first, then apply the page window.
fn page(mut records: Vec<BookingRecord>, from: i64, size: i64) -> Vec<BookingRecord> {
    records.sort_by(|a, b| b.start.cmp(&a.start));
    records
        .into_iter()
        .skip(from as usize)
        .take(size as usize)
        .collect()
}

impl Engine {
    /// Fetch one booking, visible only to its booker or the item's owner.
    /// Anyone else gets the NotFound a missing booking would produce.
    pub async fn booking_for_participant(
        &self,
        booking_id: Ulid,
        viewer_id: Ulid,
    ) -> Result<BookingRecord, EngineError> {
        if !self.user_exists(&viewer_id) {
            return Err(EngineError::NotFound(viewer_id));
        }
        let item_id = self
            .item_for_booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        let item = self
            .get_item(&item_id)
            .ok_or(EngineError::NotFound(item_id))?;
        let guard = item.read().await;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.booker_id != viewer_id && guard.owner_id != viewer_id {
            return Err(EngineError::NotFound(booking_id));
        }
        Ok(BookingRecord::of(item_id, booking))
    }

    /// All bookings made by a user, filtered by state, newest-start first.
    ///
    /// The state string is checked before anything else so a typo fails the
    /// same way whether or not the user exists.
    pub async fn bookings_by_booker(
        &self,
        booker_id: Ulid,
        state: &str,
        from: i64,
        size: i64,
        now: Ms,
    ) -> Result<Vec<BookingRecord>, EngineError> {
        let filter = StateFilter::parse(state)
            .ok_or_else(|| EngineError::UnsupportedState(state.to_string()))?;
        validate_page(from, size)?;
        if !self.user_exists(&booker_id) {
            return Err(EngineError::NotFound(booker_id));
        }

        let booking_ids = self
            .bookings_by_booker
            .get(&booker_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        // Group by item so each item lock is taken once.
        let mut by_item: HashMap<Ulid, Vec<Ulid>> = HashMap::new();
        for bid in booking_ids {
            if let Some(item_id) = self.item_for_booking(&bid) {
                by_item.entry(item_id).or_default().push(bid);
            }
        }

        let mut records = Vec::new();
        for (item_id, ids) in by_item {
            let item = match self.get_item(&item_id) {
                Some(i) => i,
                None => continue,
            };
            let guard = item.read().await;
            for bid in ids {
                if let Some(b) = guard.booking(&bid)
                    && filter.matches(b, now)
                {
                    records.push(BookingRecord::of(item_id, b));
                }
            }
        }

        Ok(page(records, from, size))
    }

    /// All bookings against a user's items, filtered by state, newest-start
    /// first.
    pub async fn bookings_by_owner(
        &self,
        owner_id: Ulid,
        state: &str,
        from: i64,
        size: i64,
        now: Ms,
    ) -> Result<Vec<BookingRecord>, EngineError> {
        let filter = StateFilter::parse(state)
            .ok_or_else(|| EngineError::UnsupportedState(state.to_string()))?;
        validate_page(from, size)?;
        if !self.user_exists(&owner_id) {
            return Err(EngineError::NotFound(owner_id));
        }

        let item_ids = self
            .items_by_owner
            .get(&owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();

        let mut records = Vec::new();
        for item_id in item_ids {
            let item = match self.get_item(&item_id) {
                Some(i) => i,
                None => continue,
            };
            let guard = item.read().await;
            for b in &guard.bookings {
                if filter.matches(b, now) {
                    records.push(BookingRecord::of(item_id, b));
                }
            }
        }

        Ok(page(records, from, size))
    }

    /// Last/next view for one item. A missing item yields an empty schedule,
    /// not an error; the catalog shows the card either way.
    pub async fn item_schedule(&self, item_id: Ulid, now: Ms) -> Result<ItemSchedule, EngineError> {
        let item = match self.get_item(&item_id) {
            Some(i) => i,
            None => {
                return Ok(ItemSchedule {
                    item_id,
                    last: None,
                    next: None,
                });
            }
        };
        let guard = item.read().await;
        let (last, next) = schedule(&guard.bookings, now);
        Ok(ItemSchedule {
            item_id,
            last: last.map(|b| BookingRecord::of(item_id, b)),
            next: next.map(|b| BookingRecord::of(item_id, b)),
        })
    }

    /// Schedules for every item a user owns, ordered by item id so the
    /// catalog view is stable across calls.
    pub async fn owner_schedules(
        &self,
        owner_id: Ulid,
        now: Ms,
    ) -> Result<Vec<ItemSchedule>, EngineError> {
        if !self.user_exists(&owner_id) {
            return Err(EngineError::NotFound(owner_id));
        }
        let mut item_ids = self
            .items_by_owner
            .get(&owner_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        item_ids.sort();

        let mut schedules = Vec::with_capacity(item_ids.len());
        for item_id in item_ids {
            schedules.push(self.item_schedule(item_id, now).await?);
        }
        Ok(schedules)
    }
}
