use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only instant type.
pub type Ms = i64;

/// Money in minor units.
pub type Cents = i64;

pub const MINUTE: Ms = 60_000;
pub const HOUR: Ms = 60 * MINUTE;
pub const DAY: Ms = 24 * HOUR;

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

    pub fn from_minutes(start: Ms, minutes: u32) -> Self {
        Self::new(start, start + minutes as Ms * MINUTE)
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    /// Grow the span by `pad` on both sides.
    pub fn padded(&self, pad: Ms) -> Span {
        Span::new(self.start - pad, self.end + pad)
    }

    pub fn shifted(&self, by: Ms) -> Span {
        Span::new(self.start + by, self.end + by)
    }
}

/// Wall-clock range within one local day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

// ── Availability sources ─────────────────────────────────────────

/// Weekly working hours for one weekday. `day_of_week` counts from Sunday = 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub is_active: bool,
    pub effective_from: NaiveDate,
    pub effective_to: Option<NaiveDate>,
    pub timezone: String,
    pub breaks: Vec<TimeRange>,
}

impl AvailabilityRule {
    pub fn hours(&self) -> TimeRange {
        TimeRange::new(self.start_time, self.end_time)
    }

    pub fn applies_on(&self, date: NaiveDate, day_of_week: u8) -> bool {
        self.is_active
            && self.day_of_week == day_of_week
            && self.effective_from <= date
            && self.effective_to.is_none_or(|to| date <= to)
    }
}

/// Replaces the weekly rule for a single date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityOverride {
    pub provider_id: Ulid,
    pub date: NaiveDate,
    pub is_available: bool,
    pub custom_hours: Option<Vec<TimeRange>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalendarEventKind {
    Blackout,
    Vacation,
    Holiday,
    SpecialHours,
    Other,
}

/// Multi-day marker on a provider's calendar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub id: Ulid,
    pub provider_id: Ulid,
    pub title: String,
    pub kind: CalendarEventKind,
    pub start: Ms,
    pub end: Ms,
    pub affects_availability: bool,
}

impl CalendarEvent {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

// ── Catalog ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOn {
    pub id: Ulid,
    pub name: String,
    pub price_cents: Cents,
}

// ── Reservations ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    /// Pending hold released by its TTL.
    Expired,
}

/// Time-boxed exclusive hold on an interval, pending confirmation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub time_slot_id: String,
    pub client_id: Ulid,
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub add_on_ids: Vec<Ulid>,
    pub package_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub status: ReservationStatus,
    pub reserved_at: Ms,
    pub expires_at: Ms,
    pub booking_id: Option<Ulid>,
}

impl Reservation {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }

    pub fn is_expired_at(&self, now: Ms) -> bool {
        self.status == ReservationStatus::Pending && self.expires_at <= now
    }
}

/// Deterministic slot identifier: the same provider and start always map to the same id.
pub fn time_slot_id(provider_id: Ulid, start: Ms) -> String {
    format!("{provider_id}:{start}")
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
    Rescheduled,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BookingStatus::Completed
                | BookingStatus::Cancelled
                | BookingStatus::NoShow
                | BookingStatus::Rescheduled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::NoShow => "no_show",
            BookingStatus::Rescheduled => "rescheduled",
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    Client,
    Provider,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    CoveredByPackage,
    RefundDue,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    #[default]
    PayAtVenue,
    Card { token: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceKind {
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceConfig {
    #[serde(rename = "type")]
    pub kind: RecurrenceKind,
    pub interval: u32,
    pub days_of_week: Option<Vec<u8>>,
    pub end_date: Option<NaiveDate>,
    pub max_occurrences: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageUsageState {
    Earmarked,
    Consumed,
    Released,
    /// Earmark carried over to the booking this one was rescheduled to.
    Transferred,
}

/// How a booking draws on a prepaid package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageUsage {
    pub package_id: Ulid,
    pub sessions: u32,
    pub state: PackageUsageState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cancellation {
    pub by: Actor,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingTimestamps {
    pub created_at: Ms,
    pub confirmed_at: Option<Ms>,
    pub started_at: Option<Ms>,
    pub completed_at: Option<Ms>,
    pub cancelled_at: Option<Ms>,
    pub no_show_at: Option<Ms>,
    pub rescheduled_at: Option<Ms>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub client_id: Ulid,
    pub provider_id: Ulid,
    pub service_ids: Vec<Ulid>,
    pub add_on_ids: Vec<Ulid>,
    pub status: BookingStatus,
    pub scheduled_at: Ms,
    pub duration_minutes: u32,
    pub recurrence: Option<RecurrenceConfig>,
    pub package: Option<PackageUsage>,
    pub parent_booking_id: Option<Ulid>,
    pub child_booking_ids: Vec<Ulid>,
    pub payment_status: PaymentStatus,
    pub payment_receipt: Option<String>,
    pub total_amount: Cents,
    pub reservation_id: Option<Ulid>,
    pub rescheduled_from: Option<Ulid>,
    pub rescheduled_to: Option<Ulid>,
    pub cancellation: Option<Cancellation>,
    pub notes: Option<String>,
    pub timestamps: BookingTimestamps,
}

impl Booking {
    pub fn span(&self) -> Span {
        Span::from_minutes(self.scheduled_at, self.duration_minutes)
    }

    /// The anchor record of a recurring series. It aggregates children and never
    /// occupies the calendar itself.
    pub fn is_series_parent(&self) -> bool {
        self.recurrence.is_some() && self.parent_booking_id.is_none()
    }

    pub fn occupies_calendar(&self) -> bool {
        !self.is_series_parent()
            && !matches!(
                self.status,
                BookingStatus::Cancelled | BookingStatus::Rescheduled
            )
    }
}

// ── Packages ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingPackage {
    pub id: Ulid,
    pub client_id: Ulid,
    pub name: String,
    /// Services this package can fund. Empty means any service.
    pub service_ids: Vec<Ulid>,
    pub total_sessions: u32,
    pub sessions_used: u32,
    pub sessions_reserved: u32,
    pub purchased_at: Ms,
    pub validity_days: Option<u32>,
    pub transferrable: bool,
}

impl BookingPackage {
    pub fn remaining(&self) -> u32 {
        self.total_sessions
            .saturating_sub(self.sessions_used)
            .saturating_sub(self.sessions_reserved)
    }

    pub fn expires_at(&self) -> Option<Ms> {
        self.validity_days
            .map(|days| self.purchased_at + days as Ms * DAY)
    }

    pub fn is_expired_at(&self, at: Ms) -> bool {
        self.expires_at().is_some_and(|exp| at > exp)
    }
}

// ── Conflicts ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Overlap,
    BufferViolation,
    OutsideHours,
    Unavailable,
    AlreadyBooked,
    BreakTime,
    BusinessHours,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::Overlap => "overlap",
            ConflictKind::BufferViolation => "buffer_violation",
            ConflictKind::OutsideHours => "outside_hours",
            ConflictKind::Unavailable => "unavailable",
            ConflictKind::AlreadyBooked => "already_booked",
            ConflictKind::BreakTime => "break_time",
            ConflictKind::BusinessHours => "business_hours",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingConflict {
    #[serde(rename = "type")]
    pub kind: ConflictKind,
    pub message: String,
    pub conflicting_id: Option<Ulid>,
    pub suggested_alternatives: Vec<Span>,
}

impl BookingConflict {
    pub fn new(kind: ConflictKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            conflicting_id: None,
            suggested_alternatives: Vec::new(),
        }
    }

    pub fn with_conflicting(mut self, id: Ulid) -> Self {
        self.conflicting_id = Some(id);
        self
    }
}

// ── Derived views ────────────────────────────────────────────────

/// Candidate bookable interval. Recomputed on every query, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: String,
    pub provider_id: Ulid,
    pub service_id: Option<Ulid>,
    pub start: Ms,
    pub end: Ms,
    pub duration_minutes: u32,
    pub is_available: bool,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    pub booking_id: Option<Ulid>,
    pub price_cents: Option<Cents>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlotAvailability {
    pub provider_id: Ulid,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    pub service_id: Option<Ulid>,
    pub duration_minutes: u32,
    pub total_available: usize,
    pub slots: Vec<TimeSlot>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub services: Cents,
    pub add_ons: Cents,
    pub discount: Cents,
    pub taxes: Cents,
    pub fees: Cents,
    pub per_occurrence_total: Cents,
    pub occurrences: u32,
    pub total: Cents,
    pub currency: String,
}

// ── Requests ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityQuery {
    pub provider_id: Ulid,
    pub date_from: NaiveDate,
    pub date_to: NaiveDate,
    #[serde(default)]
    pub service_id: Option<Ulid>,
    /// Minutes; defaults to the service duration, then the provider's slot step.
    #[serde(default)]
    pub duration: Option<u32>,
    #[serde(default)]
    pub include_blocked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlotRequest {
    pub provider_id: Ulid,
    pub service_id: Ulid,
    pub client_id: Ulid,
    pub start: Ms,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub add_on_ids: Vec<Ulid>,
    #[serde(default)]
    pub package_id: Option<Ulid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRequest {
    pub client_id: Ulid,
    pub provider_id: Ulid,
    pub service_ids: Vec<Ulid>,
    #[serde(default)]
    pub add_on_ids: Vec<Ulid>,
    pub start: Ms,
    #[serde(default)]
    pub duration_minutes: Option<u32>,
    #[serde(default)]
    pub package_id: Option<Ulid>,
    #[serde(default)]
    pub payment: PaymentMethod,
    #[serde(default)]
    pub recurrence: Option<RecurrenceConfig>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl BookingRequest {
    pub(crate) fn from_reservation(r: &Reservation, payment: PaymentMethod) -> Self {
        Self {
            client_id: r.client_id,
            provider_id: r.provider_id,
            service_ids: vec![r.service_id],
            add_on_ids: r.add_on_ids.clone(),
            start: r.start,
            duration_minutes: Some(((r.end - r.start) / MINUTE) as u32),
            package_id: r.package_id,
            payment,
            recurrence: None,
            notes: None,
        }
    }
}

// ── Provider calendar ────────────────────────────────────────────

/// What an occupied interval represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalKind {
    /// Reservation hold with expiration.
    Hold { expires_at: Ms },
    /// Committed booking.
    Booking,
}

/// A single occupied interval; `id` is the reservation or booking id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
    pub id: Ulid,
    pub span: Span,
    pub kind: IntervalKind,
}

impl Interval {
    /// Expired holds stay in the list until released but no longer block anything.
    pub fn is_active_at(&self, now: Ms) -> bool {
        match self.kind {
            IntervalKind::Hold { expires_at } => expires_at > now,
            IntervalKind::Booking => true,
        }
    }
}

/// One provider's calendar: the single mutable resource everything else projects from.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderState {
    pub id: Ulid,
    pub name: String,
    pub tz: Tz,
    /// Idle time required on both sides of every appointment.
    pub buffer: Ms,
    /// Slot generator granularity.
    pub slot_step: Ms,
    pub rules: Vec<AvailabilityRule>,
    pub overrides: BTreeMap<NaiveDate, AvailabilityOverride>,
    pub events: Vec<CalendarEvent>,
    /// Holds and bookings, sorted by `span.start`.
    pub intervals: Vec<Interval>,
    pub reservations: HashMap<Ulid, Reservation>,
    pub bookings: HashMap<Ulid, Booking>,
}

impl ProviderState {
    pub fn new(id: Ulid, name: String, tz: Tz, buffer: Ms, slot_step: Ms) -> Self {
        Self {
            id,
            name,
            tz,
            buffer,
            slot_step,
            rules: Vec::new(),
            overrides: BTreeMap::new(),
            events: Vec::new(),
            intervals: Vec::new(),
            reservations: HashMap::new(),
            bookings: HashMap::new(),
        }
    }

    /// Insert interval maintaining sort order by span.start.
    pub fn insert_interval(&mut self, interval: Interval) {
        let pos = self
            .intervals
            .binary_search_by_key(&interval.span.start, |i| i.span.start)
            .unwrap_or_else(|e| e);
        self.intervals.insert(pos, interval);
    }

    /// Remove interval by id.
    pub fn remove_interval(&mut self, id: Ulid) -> Option<Interval> {
        let pos = self.intervals.iter().position(|i| i.id == id)?;
        Some(self.intervals.remove(pos))
    }

    /// Return only intervals whose span overlaps the query window.
    /// Uses binary search to skip intervals starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Interval> {
        let right_bound = self
            .intervals
            .partition_point(|i| i.span.start < query.end);
        self.intervals[..right_bound]
            .iter()
            .filter(move |i| i.span.end > query.start)
    }

    pub fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id,
            name: self.name.clone(),
            timezone: self.tz.name().to_string(),
            buffer_minutes: (self.buffer / MINUTE) as u32,
            slot_minutes: (self.slot_step / MINUTE) as u32,
            rules: self.rules.clone(),
            overrides: self.overrides.values().cloned().collect(),
            events: self.events.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: Ulid,
    pub name: String,
    pub timezone: String,
    pub buffer_minutes: u32,
    pub slot_minutes: u32,
    pub rules: Vec<AvailabilityRule>,
    pub overrides: Vec<AvailabilityOverride>,
    pub events: Vec<CalendarEvent>,
}

// ── WAL record format ────────────────────────────────────────────

/// The event types. Flat, no nesting beyond the records they carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ProviderCreated {
        id: Ulid,
        name: String,
        timezone: String,
        buffer_minutes: u32,
        slot_minutes: u32,
    },
    ProviderUpdated {
        id: Ulid,
        name: String,
        timezone: String,
        buffer_minutes: u32,
        slot_minutes: u32,
    },
    RuleAdded {
        rule: AvailabilityRule,
    },
    RuleRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    OverrideSet {
        entry: AvailabilityOverride,
    },
    OverrideCleared {
        provider_id: Ulid,
        date: NaiveDate,
    },
    CalendarEventAdded {
        event: CalendarEvent,
    },
    CalendarEventRemoved {
        id: Ulid,
        provider_id: Ulid,
    },
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationReleased {
        id: Ulid,
        provider_id: Ulid,
        status: ReservationStatus,
    },
    ReservationConfirmed {
        id: Ulid,
        provider_id: Ulid,
        booking_id: Ulid,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingTransitioned {
        id: Ulid,
        provider_id: Ulid,
        to: BookingStatus,
        at: Ms,
        actor: Actor,
        reason: Option<String>,
    },
    BookingRescheduled {
        id: Ulid,
        provider_id: Ulid,
        new_booking_id: Ulid,
        at: Ms,
    },
    ServiceRegistered {
        service: Service,
    },
    AddOnRegistered {
        add_on: AddOn,
    },
    PackageRegistered {
        package: BookingPackage,
    },
    PackageEarmarked {
        id: Ulid,
        booking_id: Ulid,
        sessions: u32,
    },
    PackageReleased {
        id: Ulid,
        booking_id: Ulid,
        sessions: u32,
    },
    PackageConsumed {
        id: Ulid,
        booking_id: Option<Ulid>,
        sessions: u32,
        from_earmark: bool,
    },
}

impl Event {
    /// The provider whose calendar this event mutates, if any.
    pub fn provider_id(&self) -> Option<Ulid> {
        match self {
            Event::ProviderCreated { id, .. } | Event::ProviderUpdated { id, .. } => Some(*id),
            Event::RuleAdded { rule } => Some(rule.provider_id),
            Event::OverrideSet { entry } => Some(entry.provider_id),
            Event::CalendarEventAdded { event } => Some(event.provider_id),
            Event::ReservationPlaced { reservation } => Some(reservation.provider_id),
            Event::BookingCreated { booking } => Some(booking.provider_id),
            Event::RuleRemoved { provider_id, .. }
            | Event::OverrideCleared { provider_id, .. }
            | Event::CalendarEventRemoved { provider_id, .. }
            | Event::ReservationReleased { provider_id, .. }
            | Event::ReservationConfirmed { provider_id, .. }
            | Event::BookingTransitioned { provider_id, .. }
            | Event::BookingRescheduled { provider_id, .. } => Some(*provider_id),
            Event::ServiceRegistered { .. }
            | Event::AddOnRegistered { .. }
            | Event::PackageRegistered { .. }
            | Event::PackageEarmarked { .. }
            | Event::PackageReleased { .. }
            | Event::PackageConsumed { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_interval(start: Ms, end: Ms) -> Interval {
        Interval {
            id: Ulid::new(),
            span: Span::new(start, end),
            kind: IntervalKind::Booking,
        }
    }

    fn empty_provider() -> ProviderState {
        ProviderState::new(Ulid::new(), "p".into(), Tz::UTC, 0, 15 * MINUTE)
    }

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(199));
        assert!(!s.contains_instant(200)); // half-open
        assert_eq!(s.padded(10), Span::new(90, 210));
        assert_eq!(Span::from_minutes(0, 30), Span::new(0, 30 * MINUTE));
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        assert!(outer.contains_span(&Span::new(150, 300)));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&Span::new(50, 200)));
    }

    #[test]
    fn interval_ordering() {
        let mut ps = empty_provider();
        ps.insert_interval(booking_interval(300, 400));
        ps.insert_interval(booking_interval(100, 200));
        ps.insert_interval(Interval {
            id: Ulid::new(),
            span: Span::new(200, 300),
            kind: IntervalKind::Hold { expires_at: 9999 },
        });
        let starts: Vec<Ms> = ps.intervals.iter().map(|i| i.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_middle_preserves_order() {
        let mut ps = empty_provider();
        let ids: Vec<Ulid> = (0..3)
            .map(|i| {
                let iv = booking_interval(i * 100, i * 100 + 50);
                let id = iv.id;
                ps.insert_interval(iv);
                id
            })
            .collect();
        assert!(ps.remove_interval(ids[1]).is_some());
        assert!(ps.remove_interval(Ulid::new()).is_none());
        assert_eq!(ps.intervals.len(), 2);
        assert_eq!(ps.intervals[0].id, ids[0]);
        assert_eq!(ps.intervals[1].id, ids[2]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut ps = empty_provider();
        ps.insert_interval(booking_interval(100, 200));
        ps.insert_interval(booking_interval(450, 600));
        ps.insert_interval(booking_interval(1000, 1100));

        let hits: Vec<_> = ps.overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut ps = empty_provider();
        ps.insert_interval(booking_interval(100, 200));
        assert_eq!(ps.overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(ps.overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn hold_activity_depends_on_expiry() {
        let hold = Interval {
            id: Ulid::new(),
            span: Span::new(0, 100),
            kind: IntervalKind::Hold { expires_at: 500 },
        };
        assert!(hold.is_active_at(499));
        assert!(!hold.is_active_at(500));
        assert!(booking_interval(0, 100).is_active_at(i64::MAX));
    }

    #[test]
    fn package_balance_and_expiry() {
        let pkg = BookingPackage {
            id: Ulid::new(),
            client_id: Ulid::new(),
            name: "5 blowouts".into(),
            service_ids: vec![],
            total_sessions: 5,
            sessions_used: 2,
            sessions_reserved: 1,
            purchased_at: 0,
            validity_days: Some(30),
            transferrable: false,
        };
        assert_eq!(pkg.remaining(), 2);
        assert_eq!(pkg.expires_at(), Some(30 * DAY));
        assert!(!pkg.is_expired_at(30 * DAY));
        assert!(pkg.is_expired_at(30 * DAY + 1));
    }

    #[test]
    fn booking_status_terminality() {
        assert!(!BookingStatus::Pending.is_terminal());
        assert!(!BookingStatus::InProgress.is_terminal());
        assert!(BookingStatus::Rescheduled.is_terminal());
        assert_eq!(BookingStatus::NoShow.to_string(), "no_show");
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ProviderCreated {
            id: Ulid::new(),
            name: "Studio".into(),
            timezone: "Europe/Paris".into(),
            buffer_minutes: 10,
            slot_minutes: 15,
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn rule_with_dates_roundtrips_through_bincode() {
        let rule = AvailabilityRule {
            id: Ulid::new(),
            provider_id: Ulid::new(),
            day_of_week: 1,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
            is_active: true,
            effective_from: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            effective_to: None,
            timezone: "UTC".into(),
            breaks: vec![TimeRange::new(
                NaiveTime::from_hms_opt(12, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(13, 0, 0).unwrap(),
            )],
        };
        let event = Event::RuleAdded { rule };
        let bytes = bincode::serialize(&event).unwrap();
        assert_eq!(bincode::deserialize::<Event>(&bytes).unwrap(), event);
    }
}
