use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::notify::Reminder;

use super::conflict::{ConflictCheck, detect_with_alternatives, validate_span};
use super::recurrence::expand;
use super::validator::{FailedOccurrence, ResolvedRequest, plan_occurrences, price_breakdown};
use super::{Engine, EngineError};

/// Legal moves of the booking state machine.
pub fn can_transition(from: BookingStatus, to: BookingStatus) -> bool {
    use BookingStatus::*;
    matches!(
        (from, to),
        (Pending, Confirmed)
            | (Confirmed, InProgress)
            | (InProgress, Completed)
            | (Pending | Confirmed, Cancelled)
            | (Confirmed, Rescheduled)
            | (Pending | Confirmed | InProgress, NoShow)
    )
}

/// Stamp a transition onto a booking. Legality is checked before the event is written.
pub(crate) fn apply_transition(
    b: &mut Booking,
    to: BookingStatus,
    at: Ms,
    actor: Actor,
    reason: Option<String>,
) {
    b.status = to;
    let ts = &mut b.timestamps;
    match to {
        BookingStatus::Pending => {}
        BookingStatus::Confirmed => ts.confirmed_at = Some(at),
        BookingStatus::InProgress => ts.started_at = Some(at),
        BookingStatus::Completed => ts.completed_at = Some(at),
        BookingStatus::NoShow => ts.no_show_at = Some(at),
        BookingStatus::Rescheduled => ts.rescheduled_at = Some(at),
        BookingStatus::Cancelled => {
            ts.cancelled_at = Some(at);
            b.cancellation = Some(Cancellation { by: actor, reason });
            // A series is refunded through its occurrences
            if b.payment_status == PaymentStatus::Paid && !b.is_series_parent() {
                b.payment_status = PaymentStatus::RefundDue;
            }
        }
    }
    if let Some(usage) = b.package.as_mut()
        && usage.state == PackageUsageState::Earmarked
    {
        match to {
            BookingStatus::Completed | BookingStatus::NoShow => {
                usage.state = PackageUsageState::Consumed;
            }
            BookingStatus::Cancelled => usage.state = PackageUsageState::Released,
            _ => {}
        }
    }
}

/// Occurrences of a series, including replacements of rescheduled ones.
fn series_children(ps: &ProviderState, parent_id: Ulid) -> Vec<&Booking> {
    let mut children: Vec<&Booking> = ps
        .bookings
        .values()
        .filter(|b| b.parent_booking_id == Some(parent_id))
        .collect();
    children.sort_by_key(|b| (b.scheduled_at, b.id));
    children
}

/// A series parent reads as the least advanced of its live occurrences. Once all
/// of them are settled it is completed if any was, otherwise no-show or cancelled.
fn series_status(ps: &ProviderState, parent: &Booking) -> BookingStatus {
    use BookingStatus::*;
    if parent.status == Cancelled {
        return Cancelled;
    }
    let live: Vec<BookingStatus> = series_children(ps, parent.id)
        .into_iter()
        .map(|c| c.status)
        .filter(|s| *s != Rescheduled)
        .collect();
    if live.is_empty() {
        return parent.status;
    }
    [Pending, Confirmed, InProgress, Completed, NoShow]
        .into_iter()
        .find(|s| live.contains(s))
        .unwrap_or(Cancelled)
}

/// Booking as callers see it. Series parents carry the status of their occurrences.
fn read_back(ps: &ProviderState, booking: &Booking) -> Booking {
    let mut view = booking.clone();
    if view.is_series_parent() {
        view.status = series_status(ps, booking);
    }
    view
}

/// Ledger event that settles a booking's earmark when it reaches `to`.
fn settle_package(b: &Booking, to: BookingStatus) -> Option<Event> {
    let usage = b.package.filter(|u| u.state == PackageUsageState::Earmarked)?;
    match to {
        BookingStatus::Completed | BookingStatus::NoShow => Some(Event::PackageConsumed {
            id: usage.package_id,
            booking_id: Some(b.id),
            sessions: usage.sessions,
            from_earmark: true,
        }),
        BookingStatus::Cancelled => Some(Event::PackageReleased {
            id: usage.package_id,
            booking_id: b.id,
            sessions: usage.sessions,
        }),
        _ => None,
    }
}

/// Result of a recurring request: what was created and what was not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesOutcome {
    pub parent: Booking,
    pub created: Vec<Booking>,
    pub failed: Vec<FailedOccurrence>,
}

impl SeriesOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One booking about to be written.
pub(super) struct SingleCommit<'a> {
    pub booking_id: Ulid,
    pub request: &'a BookingRequest,
    pub resolved: &'a ResolvedRequest,
    pub status: BookingStatus,
    pub reservation_id: Option<Ulid>,
    /// Hold that must not count against the request (the one being confirmed).
    pub ignore: Option<Ulid>,
    pub now: Ms,
}

fn draft(
    id: Ulid,
    req: &BookingRequest,
    resolved: &ResolvedRequest,
    start: Ms,
    status: BookingStatus,
    now: Ms,
) -> Booking {
    Booking {
        id,
        client_id: req.client_id,
        provider_id: req.provider_id,
        service_ids: resolved.service_ids(),
        add_on_ids: req.add_on_ids.clone(),
        status,
        scheduled_at: start,
        duration_minutes: resolved.duration_minutes,
        recurrence: None,
        package: None,
        parent_booking_id: None,
        child_booking_ids: Vec::new(),
        payment_status: PaymentStatus::Pending,
        payment_receipt: None,
        total_amount: 0,
        reservation_id: None,
        rescheduled_from: None,
        rescheduled_to: None,
        cancellation: None,
        notes: req.notes.clone(),
        timestamps: BookingTimestamps {
            created_at: now,
            confirmed_at: (status == BookingStatus::Confirmed).then_some(now),
            ..Default::default()
        },
    }
}

impl Engine {
    /// Charge through the payment collaborator. Failure aborts the caller's commit.
    async fn charge(
        &self,
        amount: Cents,
        method: &PaymentMethod,
        package_funded: bool,
    ) -> Result<(PaymentStatus, Option<String>), EngineError> {
        if amount == 0 {
            let status = if package_funded {
                PaymentStatus::CoveredByPackage
            } else {
                PaymentStatus::Paid
            };
            return Ok((status, None));
        }
        let currency = &self.settings.pricing.currency;
        match self.payments.charge(amount, currency, method).await {
            Ok(receipt) => {
                let status = if receipt.captured {
                    PaymentStatus::Paid
                } else {
                    PaymentStatus::Pending
                };
                Ok((status, Some(receipt.reference)))
            }
            Err(e) => {
                metrics::counter!(crate::observability::PAYMENT_FAILURES_TOTAL).increment(1);
                warn!(amount, "payment failed: {e}");
                Err(EngineError::Downstream {
                    collaborator: "payment",
                    message: e.to_string(),
                })
            }
        }
    }

    /// Reverse a captured charge after its commit failed. A charge that cannot be
    /// voided is logged with its reference and counted.
    async fn void_charge(&self, amount: Cents, status: PaymentStatus, receipt: Option<&str>) {
        let (PaymentStatus::Paid, Some(reference)) = (status, receipt) else {
            return;
        };
        error!(reference, amount, "commit failed after payment capture, voiding charge");
        let currency = &self.settings.pricing.currency;
        if let Err(e) = self.payments.void(reference, amount, currency).await {
            metrics::counter!(crate::observability::ORPHANED_CHARGES_TOTAL).increment(1);
            error!(reference, amount, "captured charge could not be voided: {e}");
        }
    }

    pub(super) fn schedule_reminder(&self, booking: &Booking, provider_name: &str, now: Ms) {
        let lead_minutes = self.settings.reminder_lead_minutes;
        let when = booking.scheduled_at - lead_minutes as Ms * MINUTE;
        if when <= now {
            debug!(booking = %booking.id, "reminder time already passed, skipped");
            return;
        }
        self.reminders.dispatch(Reminder {
            booking_id: booking.id,
            provider_name: provider_name.to_string(),
            when,
            lead_minutes,
        });
    }

    /// Conflict check, package earmark, payment and WAL write for one booking.
    /// `extra` events are committed in the same record, ahead of the booking.
    pub(super) async fn commit_single(
        &self,
        ps: &mut ProviderState,
        commit: SingleCommit<'_>,
        mut extra: Vec<Event>,
    ) -> Result<Booking, EngineError> {
        let SingleCommit {
            booking_id,
            request: req,
            resolved,
            status,
            reservation_id,
            ignore,
            now,
        } = commit;

        let span = Span::from_minutes(req.start, resolved.duration_minutes);
        validate_span(&span)?;
        let check = ConflictCheck {
            span,
            now,
            window: self.window(now),
            ignore,
            pending: &[],
        };
        let conflicts = detect_with_alternatives(ps, &check);
        if !conflicts.is_empty() {
            record_conflicts(&conflicts);
            return Err(EngineError::Conflict(conflicts));
        }

        let _package_guard = match req.package_id {
            Some(package_id) => {
                let guard = self.packages.lock(package_id).await?;
                self.packages
                    .check(package_id, req.client_id, &req.service_ids, 1, now)?;
                Some(guard)
            }
            None => None,
        };

        let price = price_breakdown(
            &resolved.services,
            &resolved.add_ons,
            req.package_id.is_some(),
            1,
            &self.settings.pricing,
        );
        let (payment_status, receipt) = self
            .charge(price.total, &req.payment, req.package_id.is_some())
            .await?;

        let mut booking = draft(booking_id, req, resolved, req.start, status, now);
        booking.reservation_id = reservation_id;
        booking.total_amount = price.total;
        booking.payment_status = payment_status;
        booking.payment_receipt = receipt;
        booking.package = req.package_id.map(|package_id| PackageUsage {
            package_id,
            sessions: 1,
            state: PackageUsageState::Earmarked,
        });

        extra.push(Event::BookingCreated {
            booking: booking.clone(),
        });
        if let Some(usage) = booking.package {
            extra.push(Event::PackageEarmarked {
                id: usage.package_id,
                booking_id: booking.id,
                sessions: usage.sessions,
            });
        }
        if let Err(e) = self.persist_and_apply(ps, extra).await {
            self.void_charge(
                booking.total_amount,
                booking.payment_status,
                booking.payment_receipt.as_deref(),
            )
            .await;
            return Err(e);
        }

        self.schedule_reminder(&booking, &ps.name, now);
        Ok(booking)
    }

    /// Book an interval directly, without a prior hold. The booking starts pending.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        if req.recurrence.is_some() {
            return Err(EngineError::invalid(
                "recurring requests must use the series endpoint",
            ));
        }
        let resolved = self.resolve_request(&req)?;
        let mut ps = self.provider(req.provider_id)?.write_owned().await;
        let now = self.clock.now();
        let booking = self
            .commit_single(
                &mut ps,
                SingleCommit {
                    booking_id: Ulid::new(),
                    request: &req,
                    resolved: &resolved,
                    status: BookingStatus::Pending,
                    reservation_id: None,
                    ignore: None,
                    now,
                },
                Vec::new(),
            )
            .await?;

        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "source" => "direct").increment(1);
        info!(booking = %booking.id, provider = %booking.provider_id, "booking created");
        Ok(booking)
    }

    /// Expand a recurring request and create every occurrence that fits.
    /// Conflicting occurrences, and those beyond the package balance, are reported
    /// in `failed`; the rest are written as one commit.
    pub async fn create_series(&self, req: BookingRequest) -> Result<SeriesOutcome, EngineError> {
        let cfg = req
            .recurrence
            .clone()
            .ok_or(EngineError::invalid("recurrence is required for a series"))?;
        let resolved = self.resolve_request(&req)?;
        let mut ps = self.provider(req.provider_id)?.write_owned().await;
        let now = self.clock.now();

        let expansion = expand(req.start, ps.tz, &cfg)?;
        let mut plan = plan_occurrences(
            &ps,
            &expansion.starts,
            resolved.duration_minutes,
            now,
            self.window(now),
        );

        let _package_guard = match req.package_id {
            Some(package_id) => {
                let guard = self.packages.lock(package_id).await?;
                let pkg = self
                    .packages
                    .check(package_id, req.client_id, &req.service_ids, 1, now)?;
                plan.limit_to_balance(pkg.remaining() as usize);
                Some(guard)
            }
            None => None,
        };

        if plan.accepted.is_empty() {
            let conflicts: Vec<BookingConflict> = plan
                .failed
                .iter()
                .find(|f| !f.conflicts.is_empty())
                .map(|f| f.conflicts.clone())
                .unwrap_or_default();
            if conflicts.is_empty() {
                let reason = plan.failed.first().map_or("no occurrences", |f| f.reason.as_str());
                return Err(EngineError::invalid(reason));
            }
            record_conflicts(&conflicts);
            return Err(EngineError::Conflict(conflicts));
        }

        let package_funded = req.package_id.is_some();
        let price = price_breakdown(
            &resolved.services,
            &resolved.add_ons,
            package_funded,
            plan.accepted.len() as u32,
            &self.settings.pricing,
        );
        let (payment_status, receipt) = self
            .charge(price.total, &req.payment, package_funded)
            .await?;

        let parent_id = Ulid::new();
        let children: Vec<Booking> = plan
            .accepted
            .iter()
            .map(|span| {
                let mut child =
                    draft(Ulid::new(), &req, &resolved, span.start, BookingStatus::Pending, now);
                child.parent_booking_id = Some(parent_id);
                child.total_amount = price.per_occurrence_total;
                child.payment_status = payment_status;
                child.payment_receipt = receipt.clone();
                child.package = req.package_id.map(|package_id| PackageUsage {
                    package_id,
                    sessions: 1,
                    state: PackageUsageState::Earmarked,
                });
                child
            })
            .collect();

        let mut parent = draft(
            parent_id,
            &req,
            &resolved,
            plan.accepted[0].start,
            BookingStatus::Pending,
            now,
        );
        parent.recurrence = Some(cfg);
        parent.child_booking_ids = children.iter().map(|c| c.id).collect();
        parent.total_amount = price.total;
        parent.payment_status = payment_status;
        parent.payment_receipt = receipt;

        let mut events = Vec::with_capacity(children.len() * 2 + 1);
        events.push(Event::BookingCreated {
            booking: parent.clone(),
        });
        for child in &children {
            events.push(Event::BookingCreated {
                booking: child.clone(),
            });
            if let Some(usage) = child.package {
                events.push(Event::PackageEarmarked {
                    id: usage.package_id,
                    booking_id: child.id,
                    sessions: usage.sessions,
                });
            }
        }
        if let Err(e) = self.persist_and_apply(&mut ps, events).await {
            self.void_charge(
                parent.total_amount,
                parent.payment_status,
                parent.payment_receipt.as_deref(),
            )
            .await;
            return Err(e);
        }

        for child in &children {
            self.schedule_reminder(child, &ps.name, now);
        }
        metrics::counter!(crate::observability::BOOKINGS_TOTAL, "source" => "series")
            .increment(children.len() as u64);
        info!(
            series = %parent_id,
            created = children.len(),
            failed = plan.failed.len(),
            truncated = expansion.truncated,
            "series created"
        );
        Ok(SeriesOutcome {
            parent,
            created: children,
            failed: plan.failed,
        })
    }

    /// Move a booking through the state machine. Cancelling a series parent
    /// cancels every occurrence that can still be cancelled, and fails when none can.
    pub async fn update_status(
        &self,
        id: Ulid,
        to: BookingStatus,
        actor: Actor,
        reason: Option<String>,
    ) -> Result<Booking, EngineError> {
        if to == BookingStatus::Rescheduled {
            return Err(EngineError::invalid("use reschedule to move a booking"));
        }
        let reason = reason.filter(|r| !r.trim().is_empty());
        if to == BookingStatus::Cancelled && actor == Actor::Provider && reason.is_none() {
            return Err(EngineError::invalid(
                "a reason is required when the provider cancels",
            ));
        }

        let mut ps = self.resolve_entity_write("booking", id).await?;
        let booking = ps
            .bookings
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("booking", id))?;
        let now = self.clock.now();

        let from = if booking.is_series_parent() {
            series_status(&ps, &booking)
        } else {
            booking.status
        };
        let invalid = EngineError::InvalidTransition { id, from, to };
        let mut targets = vec![booking.clone()];
        if booking.is_series_parent() {
            if to != BookingStatus::Cancelled || from.is_terminal() {
                return Err(invalid);
            }
            let cancellable: Vec<Booking> = series_children(&ps, id)
                .into_iter()
                .filter(|child| can_transition(child.status, to))
                .cloned()
                .collect();
            if cancellable.is_empty() {
                return Err(invalid);
            }
            targets.extend(cancellable);
        } else {
            if !can_transition(booking.status, to) {
                return Err(invalid);
            }
            if to == BookingStatus::NoShow && now < booking.scheduled_at {
                return Err(EngineError::invalid(
                    "a booking cannot be marked no-show before its scheduled time",
                ));
            }
        }

        let mut events = Vec::with_capacity(targets.len() * 2);
        for target in &targets {
            events.push(Event::BookingTransitioned {
                id: target.id,
                provider_id: target.provider_id,
                to,
                at: now,
                actor,
                reason: reason.clone(),
            });
            events.extend(settle_package(target, to));
        }
        self.persist_and_apply(&mut ps, events).await?;

        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "to" => to.as_str())
            .increment(targets.len() as u64);
        info!(booking = %id, %from, %to, affected = targets.len(), "booking transitioned");
        ps.bookings
            .get(&id)
            .map(|b| read_back(&ps, b))
            .ok_or(EngineError::not_found("booking", id))
    }

    /// Replace a confirmed booking with one at `new_start`. The old booking keeps its
    /// history and points at the new one; a package earmark moves with it.
    pub async fn reschedule(&self, id: Ulid, new_start: Ms) -> Result<Booking, EngineError> {
        let mut ps = self.resolve_entity_write("booking", id).await?;
        let old = ps
            .bookings
            .get(&id)
            .cloned()
            .ok_or(EngineError::not_found("booking", id))?;
        if old.is_series_parent() {
            return Err(EngineError::invalid(
                "reschedule the occurrences of a series individually",
            ));
        }
        if !can_transition(old.status, BookingStatus::Rescheduled) {
            return Err(EngineError::InvalidTransition {
                id,
                from: old.status,
                to: BookingStatus::Rescheduled,
            });
        }

        let now = self.clock.now();
        let span = Span::from_minutes(new_start, old.duration_minutes);
        validate_span(&span)?;
        let check = ConflictCheck {
            span,
            now,
            window: self.window(now),
            ignore: Some(id),
            pending: &[],
        };
        let conflicts = detect_with_alternatives(&ps, &check);
        if !conflicts.is_empty() {
            record_conflicts(&conflicts);
            return Err(EngineError::Conflict(conflicts));
        }

        let replacement = Booking {
            id: Ulid::new(),
            status: BookingStatus::Confirmed,
            scheduled_at: new_start,
            child_booking_ids: Vec::new(),
            reservation_id: None,
            rescheduled_from: Some(id),
            rescheduled_to: None,
            cancellation: None,
            timestamps: BookingTimestamps {
                created_at: now,
                confirmed_at: Some(now),
                ..Default::default()
            },
            ..old.clone()
        };
        let events = vec![
            Event::BookingCreated {
                booking: replacement.clone(),
            },
            Event::BookingRescheduled {
                id,
                provider_id: old.provider_id,
                new_booking_id: replacement.id,
                at: now,
            },
        ];
        self.persist_and_apply(&mut ps, events).await?;

        self.schedule_reminder(&replacement, &ps.name, now);
        metrics::counter!(crate::observability::BOOKING_TRANSITIONS_TOTAL, "to" => "rescheduled")
            .increment(1);
        info!(booking = %id, replacement = %replacement.id, "booking rescheduled");
        Ok(replacement)
    }

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let ps = self.resolve_entity_read("booking", id).await?;
        ps.bookings
            .get(&id)
            .map(|b| read_back(&ps, b))
            .ok_or(EngineError::not_found("booking", id))
    }

    /// Bookings of one provider starting in `[from, to)`, by start time.
    pub async fn list_bookings(
        &self,
        provider_id: Ulid,
        from: Option<Ms>,
        to: Option<Ms>,
    ) -> Result<Vec<Booking>, EngineError> {
        let ps = self.provider(provider_id)?.read_owned().await;
        let mut bookings: Vec<Booking> = ps
            .bookings
            .values()
            .filter(|b| from.is_none_or(|f| b.scheduled_at >= f))
            .filter(|b| to.is_none_or(|t| b.scheduled_at < t))
            .map(|b| read_back(&ps, b))
            .collect();
        bookings.sort_by_key(|b| (b.scheduled_at, b.id));
        Ok(bookings)
    }
}

pub(super) fn record_conflicts(conflicts: &[BookingConflict]) {
    for conflict in conflicts {
        metrics::counter!(crate::observability::CONFLICTS_TOTAL, "type" => conflict.kind.as_str())
            .increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking(status: BookingStatus) -> Booking {
        Booking {
            id: Ulid::new(),
            client_id: Ulid::new(),
            provider_id: Ulid::new(),
            service_ids: vec![],
            add_on_ids: vec![],
            status,
            scheduled_at: 0,
            duration_minutes: 30,
            recurrence: None,
            package: Some(PackageUsage {
                package_id: Ulid::new(),
                sessions: 1,
                state: PackageUsageState::Earmarked,
            }),
            parent_booking_id: None,
            child_booking_ids: vec![],
            payment_status: PaymentStatus::Paid,
            payment_receipt: None,
            total_amount: 0,
            reservation_id: None,
            rescheduled_from: None,
            rescheduled_to: None,
            cancellation: None,
            notes: None,
            timestamps: BookingTimestamps::default(),
        }
    }

    #[test]
    fn transition_table() {
        use BookingStatus::*;
        assert!(can_transition(Pending, Confirmed));
        assert!(can_transition(Confirmed, InProgress));
        assert!(can_transition(InProgress, Completed));
        assert!(can_transition(Pending, Cancelled));
        assert!(can_transition(Confirmed, Rescheduled));
        assert!(can_transition(InProgress, NoShow));

        assert!(!can_transition(Pending, Completed));
        assert!(!can_transition(InProgress, Cancelled));
        assert!(!can_transition(Pending, Rescheduled));
        for terminal in [Completed, Cancelled, NoShow, Rescheduled] {
            for to in [Pending, Confirmed, InProgress, Completed, Cancelled, NoShow, Rescheduled] {
                assert!(!can_transition(terminal, to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn completion_consumes_earmark() {
        let mut b = booking(BookingStatus::InProgress);
        let event = settle_package(&b, BookingStatus::Completed);
        assert!(matches!(
            event,
            Some(Event::PackageConsumed { from_earmark: true, sessions: 1, .. })
        ));
        apply_transition(&mut b, BookingStatus::Completed, 99, Actor::Provider, None);
        assert_eq!(b.timestamps.completed_at, Some(99));
        assert_eq!(b.package.unwrap().state, PackageUsageState::Consumed);
        assert!(settle_package(&b, BookingStatus::NoShow).is_none());
    }

    #[test]
    fn cancellation_releases_earmark_and_records_actor() {
        let mut b = booking(BookingStatus::Confirmed);
        assert!(matches!(
            settle_package(&b, BookingStatus::Cancelled),
            Some(Event::PackageReleased { .. })
        ));
        apply_transition(
            &mut b,
            BookingStatus::Cancelled,
            7,
            Actor::Provider,
            Some("sick".into()),
        );
        assert_eq!(b.package.unwrap().state, PackageUsageState::Released);
        assert_eq!(b.payment_status, PaymentStatus::RefundDue);
        assert_eq!(
            b.cancellation,
            Some(Cancellation {
                by: Actor::Provider,
                reason: Some("sick".into())
            })
        );
    }

    #[test]
    fn confirmation_leaves_earmark_alone() {
        let b = booking(BookingStatus::Pending);
        assert!(settle_package(&b, BookingStatus::Confirmed).is_none());
    }
}
