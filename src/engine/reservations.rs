use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{ConflictCheck, detect_with_alternatives, validate_span};
use super::lifecycle::{SingleCommit, record_conflicts};
use super::{Engine, EngineError};

fn count(outcome: &'static str) {
    metrics::counter!(crate::observability::RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
}

impl Engine {
    /// Hold an interval for `hold_minutes`. The hold blocks every later check on
    /// this provider until it is confirmed, cancelled or expires.
    pub async fn reserve(&self, req: TimeSlotRequest) -> Result<Reservation, EngineError> {
        let as_booking = BookingRequest {
            client_id: req.client_id,
            provider_id: req.provider_id,
            service_ids: vec![req.service_id],
            add_on_ids: req.add_on_ids.clone(),
            start: req.start,
            duration_minutes: req.duration_minutes,
            package_id: req.package_id,
            payment: PaymentMethod::default(),
            recurrence: None,
            notes: None,
        };
        let resolved = self.resolve_request(&as_booking)?;
        let span = Span::from_minutes(req.start, resolved.duration_minutes);
        validate_span(&span)?;

        let mut ps = self.provider(req.provider_id)?.write_owned().await;
        let now = self.clock.now();
        let check = ConflictCheck {
            span,
            now,
            window: self.window(now),
            ignore: None,
            pending: &[],
        };
        let conflicts = detect_with_alternatives(&ps, &check);
        if !conflicts.is_empty() {
            count("conflict");
            record_conflicts(&conflicts);
            return Err(EngineError::Conflict(conflicts));
        }
        if let Some(package_id) = req.package_id {
            self.packages
                .check(package_id, req.client_id, &as_booking.service_ids, 1, now)?;
        }

        let reservation = Reservation {
            id: Ulid::new(),
            time_slot_id: time_slot_id(req.provider_id, span.start),
            client_id: req.client_id,
            provider_id: req.provider_id,
            service_id: req.service_id,
            add_on_ids: req.add_on_ids,
            package_id: req.package_id,
            start: span.start,
            end: span.end,
            status: ReservationStatus::Pending,
            reserved_at: now,
            expires_at: now + self.settings.hold(),
            booking_id: None,
        };
        self.persist_and_apply(
            &mut ps,
            vec![Event::ReservationPlaced {
                reservation: reservation.clone(),
            }],
        )
        .await?;

        count("placed");
        info!(reservation = %reservation.id, provider = %reservation.provider_id, start = span.start, "hold placed");
        Ok(reservation)
    }

    /// Turn a live hold into a confirmed booking. Confirming the same hold again
    /// returns the booking it already produced.
    pub async fn confirm_reservation(
        &self,
        id: Ulid,
        payment: PaymentMethod,
    ) -> Result<Booking, EngineError> {
        let mut ps = self.resolve_entity_write("reservation", id).await?;
        let reservation = ps
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", id))?;

        match reservation.status {
            ReservationStatus::Confirmed | ReservationStatus::Completed => {
                let booking_id = reservation
                    .booking_id
                    .ok_or(EngineError::not_found("booking", id))?;
                return ps
                    .bookings
                    .get(&booking_id)
                    .cloned()
                    .ok_or(EngineError::not_found("booking", booking_id));
            }
            ReservationStatus::Expired => return Err(EngineError::ReservationExpired(id)),
            ReservationStatus::Cancelled => {
                return Err(EngineError::ReservationClosed(id, reservation.status));
            }
            ReservationStatus::Pending => {}
        }

        let now = self.clock.now();
        if reservation.is_expired_at(now) {
            // The sweep may not have run yet; release here so the slot frees at once.
            self.persist_and_apply(
                &mut ps,
                vec![Event::ReservationReleased {
                    id,
                    provider_id: reservation.provider_id,
                    status: ReservationStatus::Expired,
                }],
            )
            .await?;
            count("expired");
            info!(reservation = %id, "hold expired at confirm");
            return Err(EngineError::ReservationExpired(id));
        }

        let request = BookingRequest::from_reservation(&reservation, payment);
        let resolved = self.resolve_request(&request)?;
        let booking_id = Ulid::new();
        let booking = self
            .commit_single(
                &mut ps,
                SingleCommit {
                    booking_id,
                    request: &request,
                    resolved: &resolved,
                    status: BookingStatus::Confirmed,
                    reservation_id: Some(id),
                    ignore: Some(id),
                    now,
                },
                vec![Event::ReservationConfirmed {
                    id,
                    provider_id: reservation.provider_id,
                    booking_id,
                }],
            )
            .await?;

        count("confirmed");
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "source" => "reservation")
            .increment(1);
        info!(reservation = %id, booking = %booking.id, "hold confirmed");
        Ok(booking)
    }

    /// Release a hold. Releasing one that is already gone is a no-op.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let mut ps = self.resolve_entity_write("reservation", id).await?;
        let reservation = ps
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", id))?;

        match reservation.status {
            ReservationStatus::Cancelled | ReservationStatus::Expired => return Ok(reservation),
            ReservationStatus::Confirmed | ReservationStatus::Completed => {
                return Err(EngineError::ReservationClosed(id, reservation.status));
            }
            ReservationStatus::Pending => {}
        }

        let status = if reservation.is_expired_at(self.clock.now()) {
            ReservationStatus::Expired
        } else {
            ReservationStatus::Cancelled
        };
        self.persist_and_apply(
            &mut ps,
            vec![Event::ReservationReleased {
                id,
                provider_id: reservation.provider_id,
                status,
            }],
        )
        .await?;

        count("cancelled");
        info!(reservation = %id, "hold released");
        ps.reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", id))
    }

    /// Current view of a hold. A pending hold past its expiry reads as expired even
    /// before the sweep releases it.
    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let ps = self.resolve_entity_read("reservation", id).await?;
        let mut reservation = ps
            .reservations
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("reservation", id))?;
        if reservation.is_expired_at(self.clock.now()) {
            reservation.status = ReservationStatus::Expired;
        }
        Ok(reservation)
    }

    /// (reservation, provider) pairs whose holds have lapsed. Providers that are
    /// locked right now are skipped and picked up on the next sweep.
    pub fn collect_expired_reservations(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.providers.iter() {
            let ps = entry.value().clone();
            if let Ok(guard) = ps.try_read() {
                for interval in &guard.intervals {
                    if let IntervalKind::Hold { expires_at } = interval.kind
                        && expires_at <= now
                    {
                        expired.push((interval.id, guard.id));
                    }
                }
            }
        }
        expired
    }

    /// Release a lapsed hold. Returns false if it was confirmed or released in the meantime.
    pub async fn release_expired(&self, id: Ulid) -> Result<bool, EngineError> {
        let mut ps = self.resolve_entity_write("reservation", id).await?;
        let now = self.clock.now();
        let Some(reservation) = ps.reservations.get(&id).filter(|r| r.is_expired_at(now)) else {
            return Ok(false);
        };
        let event = Event::ReservationReleased {
            id,
            provider_id: reservation.provider_id,
            status: ReservationStatus::Expired,
        };
        self.persist_and_apply(&mut ps, vec![event]).await?;
        count("expired");
        Ok(true)
    }
}
