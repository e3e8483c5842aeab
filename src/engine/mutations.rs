use std::sync::Arc;

use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::rules::{decide_transition, validate_booking_window};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    pub async fn register_user(&self, id: Ulid, name: Option<String>) -> Result<(), EngineError> {
        if self.users.len() >= MAX_USERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("user name too long"));
        }
        if self.users.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::UserRegistered {
            id,
            name: name.clone(),
        };
        self.persist(&event).await?;
        self.users.insert(id, User { id, name });
        Ok(())
    }

    pub async fn list_item(
        &self,
        id: Ulid,
        owner_id: Ulid,
        name: Option<String>,
        available: bool,
    ) -> Result<(), EngineError> {
        if self.items.len() >= MAX_ITEMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many items"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("item name too long"));
        }
        if self.items.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if !self.user_exists(&owner_id) {
            return Err(EngineError::NotFound(owner_id));
        }

        let event = Event::ItemListed {
            id,
            owner_id,
            name: name.clone(),
            available,
        };
        self.persist(&event).await?;
        let item = ItemState::new(id, owner_id, name, available);
        self.items.insert(id, Arc::new(RwLock::new(item)));
        self.items_by_owner.entry(owner_id).or_default().push(id);
        self.notify.send(id, &event);
        Ok(())
    }

    pub async fn set_item_availability(
        &self,
        id: Ulid,
        available: bool,
    ) -> Result<(), EngineError> {
        let item = self.get_item(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = item.write().await;
        let event = Event::ItemAvailabilitySet { id, available };
        self.persist_and_apply(id, &mut guard, &event).await
    }

    /// Create a booking request. Checks run in a fixed order so callers see
    /// the same error for the same input regardless of other state: window
    /// shape, then item existence and availability, then the parties.
    ///
    /// Overlap with other bookings on the item is deliberately not checked.
    /// Several WAITING requests may cover the same window; the owner picks
    /// one by approving it.
    pub async fn request_booking(
        &self,
        id: Ulid,
        item_id: Ulid,
        booker_id: Ulid,
        start: Ms,
        end: Ms,
        now: Ms,
    ) -> Result<BookingRecord, EngineError> {
        let span = validate_booking_window(start, end, now)?;
        let item = self.get_item(&item_id).ok_or(EngineError::NotFound(item_id))?;
        let mut guard = item.write().await;
        if !guard.available {
            return Err(EngineError::Unavailable(item_id));
        }
        if guard.owner_id == booker_id {
            return Err(EngineError::SameParty(booker_id));
        }
        if !self.user_exists(&booker_id) {
            return Err(EngineError::NotFound(booker_id));
        }
        if guard.bookings.len() >= MAX_BOOKINGS_PER_ITEM {
            return Err(EngineError::LimitExceeded("too many bookings on item"));
        }
        if self.booking_to_item.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::BookingRequested {
            id,
            item_id,
            booker_id,
            span,
        };
        self.persist_and_apply(item_id, &mut guard, &event).await?;
        let booking = guard.booking(&id).ok_or(EngineError::NotFound(id))?;
        Ok(BookingRecord::of(item_id, booking))
    }

    /// Decide a WAITING booking. Only the item's owner may decide; anyone
    /// else gets the same NotFound a missing booking would produce, so
    /// probing ids reveals nothing.
    pub async fn decide_booking(
        &self,
        booking_id: Ulid,
        acting_user: Ulid,
        approve: bool,
    ) -> Result<BookingRecord, EngineError> {
        if !self.user_exists(&acting_user) {
            return Err(EngineError::NotFound(acting_user));
        }
        let (item_id, mut guard) = self.resolve_booking_write(&booking_id).await?;
        if guard.owner_id != acting_user {
            return Err(EngineError::NotFound(booking_id));
        }
        let current = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .status;
        decide_transition(current, approve).ok_or(EngineError::AlreadyDecided(booking_id))?;

        let event = Event::BookingDecided {
            id: booking_id,
            item_id,
            approved: approve,
        };
        self.persist_and_apply(item_id, &mut guard, &event).await?;
        let booking = guard
            .booking(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        Ok(BookingRecord::of(item_id, booking))
    }

    /// Compact the WAL by rewriting it with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();

        for entry in self.users.iter() {
            let user = entry.value();
            events.push(Event::UserRegistered {
                id: user.id,
                name: user.name.clone(),
            });
        }

        let item_ids: Vec<Ulid> = self.items.iter().map(|e| *e.key()).collect();
        for id in item_ids {
            let entry = match self.items.get(&id) {
                Some(e) => e,
                None => continue,
            };
            let item = entry.value().clone();
            drop(entry);
            // Mutations hold the item write lock across their WAL commit, so
            // contention here is routine. Wait for the writer, never panic.
            let guard = item.read().await;

            events.push(Event::ItemListed {
                id: guard.id,
                owner_id: guard.owner_id,
                name: guard.name.clone(),
                available: guard.available,
            });

            for booking in &guard.bookings {
                events.push(Event::BookingRequested {
                    id: booking.id,
                    item_id: guard.id,
                    booker_id: booking.booker_id,
                    span: booking.span,
                });
                match booking.status {
                    BookingStatus::Waiting | BookingStatus::Canceled => {}
                    BookingStatus::Approved => events.push(Event::BookingDecided {
                        id: booking.id,
                        item_id: guard.id,
                        approved: true,
                    }),
                    BookingStatus::Rejected => events.push(Event::BookingDecided {
                        id: booking.id,
                        item_id: guard.id,
                        approved: false,
                    }),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
