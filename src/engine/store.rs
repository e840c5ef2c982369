use std::collections::HashMap;

use chrono_tz::Tz;
use ulid::Ulid;

use crate::model::*;

use super::calendar::parse_tz;
use super::lifecycle::apply_transition;

/// Build the empty calendar a `ProviderCreated` event describes.
pub(crate) fn provider_from_created(event: &Event) -> Option<ProviderState> {
    let Event::ProviderCreated {
        id,
        name,
        timezone,
        buffer_minutes,
        slot_minutes,
    } = event
    else {
        return None;
    };
    Some(ProviderState::new(
        *id,
        name.clone(),
        parse_tz(timezone).unwrap_or(Tz::UTC),
        *buffer_minutes as Ms * MINUTE,
        *slot_minutes as Ms * MINUTE,
    ))
}

/// Apply a provider-scoped event to its calendar (no locking, caller holds the lock).
pub(crate) fn apply_to_provider(ps: &mut ProviderState, event: &Event) {
    match event {
        Event::ProviderUpdated {
            name,
            timezone,
            buffer_minutes,
            slot_minutes,
            ..
        } => {
            ps.name = name.clone();
            ps.tz = parse_tz(timezone).unwrap_or(ps.tz);
            ps.buffer = *buffer_minutes as Ms * MINUTE;
            ps.slot_step = *slot_minutes as Ms * MINUTE;
        }
        Event::RuleAdded { rule } => ps.rules.push(rule.clone()),
        Event::RuleRemoved { id, .. } => ps.rules.retain(|r| r.id != *id),
        Event::OverrideSet { entry } => {
            ps.overrides.insert(entry.date, entry.clone());
        }
        Event::OverrideCleared { date, .. } => {
            ps.overrides.remove(date);
        }
        Event::CalendarEventAdded { event } => ps.events.push(event.clone()),
        Event::CalendarEventRemoved { id, .. } => ps.events.retain(|e| e.id != *id),
        Event::ReservationPlaced { reservation } => {
            if reservation.status == ReservationStatus::Pending {
                ps.insert_interval(Interval {
                    id: reservation.id,
                    span: reservation.span(),
                    kind: IntervalKind::Hold {
                        expires_at: reservation.expires_at,
                    },
                });
            }
            ps.reservations.insert(reservation.id, reservation.clone());
        }
        Event::ReservationReleased { id, status, .. } => {
            ps.remove_interval(*id);
            if let Some(r) = ps.reservations.get_mut(id) {
                r.status = *status;
            }
        }
        Event::ReservationConfirmed { id, booking_id, .. } => {
            ps.remove_interval(*id);
            if let Some(r) = ps.reservations.get_mut(id) {
                r.status = ReservationStatus::Confirmed;
                r.booking_id = Some(*booking_id);
            }
        }
        Event::BookingCreated { booking } => {
            if booking.occupies_calendar() {
                ps.insert_interval(Interval {
                    id: booking.id,
                    span: booking.span(),
                    kind: IntervalKind::Booking,
                });
            }
            if let Some(parent_id) = booking.parent_booking_id
                && let Some(parent) = ps.bookings.get_mut(&parent_id)
                && !parent.child_booking_ids.contains(&booking.id)
            {
                parent.child_booking_ids.push(booking.id);
            }
            ps.bookings.insert(booking.id, booking.clone());
        }
        Event::BookingTransitioned {
            id,
            to,
            at,
            actor,
            reason,
            ..
        } => {
            let Some(booking) = ps.bookings.get_mut(id) else {
                return;
            };
            apply_transition(booking, *to, *at, *actor, reason.clone());
            let occupies = booking.occupies_calendar();
            let reservation_id = booking.reservation_id;
            if !occupies {
                ps.remove_interval(*id);
            }
            if *to == BookingStatus::Completed
                && let Some(rid) = reservation_id
                && let Some(r) = ps.reservations.get_mut(&rid)
            {
                r.status = ReservationStatus::Completed;
            }
        }
        Event::BookingRescheduled {
            id,
            new_booking_id,
            at,
            ..
        } => {
            if let Some(booking) = ps.bookings.get_mut(id) {
                booking.status = BookingStatus::Rescheduled;
                booking.rescheduled_to = Some(*new_booking_id);
                booking.timestamps.rescheduled_at = Some(*at);
                if let Some(usage) = booking.package.as_mut()
                    && usage.state == PackageUsageState::Earmarked
                {
                    usage.state = PackageUsageState::Transferred;
                }
            }
            ps.remove_interval(*id);
        }
        // Created is handled at the map level; the rest are not provider-scoped.
        Event::ProviderCreated { .. }
        | Event::ServiceRegistered { .. }
        | Event::AddOnRegistered { .. }
        | Event::PackageRegistered { .. }
        | Event::PackageEarmarked { .. }
        | Event::PackageReleased { .. }
        | Event::PackageConsumed { .. } => {}
    }
}

/// The package a ledger event targets.
pub(crate) fn package_event_id(event: &Event) -> Option<Ulid> {
    match event {
        Event::PackageEarmarked { id, .. }
        | Event::PackageReleased { id, .. }
        | Event::PackageConsumed { id, .. } => Some(*id),
        Event::PackageRegistered { package } => Some(package.id),
        _ => None,
    }
}

pub(crate) fn apply_to_package(pkg: &mut BookingPackage, event: &Event) {
    match event {
        Event::PackageEarmarked { sessions, .. } => {
            pkg.sessions_reserved += sessions;
        }
        Event::PackageReleased { sessions, .. } => {
            pkg.sessions_reserved = pkg.sessions_reserved.saturating_sub(*sessions);
        }
        Event::PackageConsumed {
            sessions,
            from_earmark,
            ..
        } => {
            if *from_earmark {
                pkg.sessions_reserved = pkg.sessions_reserved.saturating_sub(*sessions);
            }
            pkg.sessions_used = (pkg.sessions_used + sessions).min(pkg.total_sessions);
        }
        _ => {}
    }
}

/// Ids a provider owns and that the engine resolves back to it.
pub(crate) fn owned_entity_ids(ps: &ProviderState) -> impl Iterator<Item = Ulid> + '_ {
    ps.rules
        .iter()
        .map(|r| r.id)
        .chain(ps.events.iter().map(|e| e.id))
        .chain(ps.reservations.keys().copied())
        .chain(ps.bookings.keys().copied())
}

pub(crate) enum EntityChange {
    Link(Ulid),
    Unlink(Ulid),
}

pub(crate) fn entity_change(event: &Event) -> Option<EntityChange> {
    match event {
        Event::RuleAdded { rule } => Some(EntityChange::Link(rule.id)),
        Event::CalendarEventAdded { event } => Some(EntityChange::Link(event.id)),
        Event::ReservationPlaced { reservation } => Some(EntityChange::Link(reservation.id)),
        Event::BookingCreated { booking } => Some(EntityChange::Link(booking.id)),
        Event::RuleRemoved { id, .. } | Event::CalendarEventRemoved { id, .. } => {
            Some(EntityChange::Unlink(*id))
        }
        _ => None,
    }
}

/// Whole-log fold. Startup replay builds one, compaction snapshots one.
#[derive(Debug, Default)]
pub(crate) struct Projection {
    pub providers: HashMap<Ulid, ProviderState>,
    pub services: HashMap<Ulid, Service>,
    pub add_ons: HashMap<Ulid, AddOn>,
    pub packages: HashMap<Ulid, BookingPackage>,
}

impl Projection {
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut projection = Self::default();
        for event in events {
            projection.apply(event);
        }
        projection
    }

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ProviderCreated { id, .. } => {
                if let Some(ps) = provider_from_created(event) {
                    self.providers.insert(*id, ps);
                }
            }
            Event::ServiceRegistered { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::AddOnRegistered { add_on } => {
                self.add_ons.insert(add_on.id, add_on.clone());
            }
            Event::PackageRegistered { package } => {
                self.packages.insert(package.id, package.clone());
            }
            other => {
                if let Some(pid) = other.provider_id() {
                    if let Some(ps) = self.providers.get_mut(&pid) {
                        apply_to_provider(ps, other);
                    }
                } else if let Some(pkg) =
                    package_event_id(other).and_then(|id| self.packages.get_mut(&id))
                {
                    apply_to_package(pkg, other);
                }
            }
        }
    }

    /// Minimal events that recreate this state. Every hold and booking is kept with
    /// its current status, so ids stay resolvable after a restart.
    pub fn snapshot(&self) -> Vec<Event> {
        fn sorted<T>(map: &HashMap<Ulid, T>) -> Vec<&T> {
            let mut keys: Vec<&Ulid> = map.keys().collect();
            keys.sort();
            keys.into_iter().filter_map(|k| map.get(k)).collect()
        }

        let mut events = Vec::new();
        for service in sorted(&self.services) {
            events.push(Event::ServiceRegistered {
                service: service.clone(),
            });
        }
        for add_on in sorted(&self.add_ons) {
            events.push(Event::AddOnRegistered {
                add_on: add_on.clone(),
            });
        }
        for package in sorted(&self.packages) {
            events.push(Event::PackageRegistered {
                package: package.clone(),
            });
        }
        for ps in sorted(&self.providers) {
            events.push(Event::ProviderCreated {
                id: ps.id,
                name: ps.name.clone(),
                timezone: ps.tz.name().to_string(),
                buffer_minutes: (ps.buffer / MINUTE) as u32,
                slot_minutes: (ps.slot_step / MINUTE) as u32,
            });
            events.extend(ps.rules.iter().map(|rule| Event::RuleAdded { rule: rule.clone() }));
            events.extend(
                ps.overrides
                    .values()
                    .map(|entry| Event::OverrideSet { entry: entry.clone() }),
            );
            events.extend(
                ps.events
                    .iter()
                    .map(|event| Event::CalendarEventAdded { event: event.clone() }),
            );
            // Released holds keep their final status and occupy nothing on replay
            for reservation in sorted(&ps.reservations) {
                events.push(Event::ReservationPlaced {
                    reservation: reservation.clone(),
                });
            }
            for booking in sorted(&ps.bookings) {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }
        events
    }
}
