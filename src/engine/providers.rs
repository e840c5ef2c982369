use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::calendar::parse_tz;
use super::slots::{SlotSpec, slots};
use super::store::provider_from_created;
use super::{Engine, EngineError};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub timezone: String,
    #[serde(default)]
    pub buffer_minutes: u32,
    /// Falls back to the engine's default slot granularity.
    #[serde(default)]
    pub slot_minutes: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub day_of_week: u8,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub effective_from: NaiveDate,
    #[serde(default)]
    pub effective_to: Option<NaiveDate>,
    /// Defaults to the provider's zone.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub breaks: Vec<TimeRange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideSpec {
    pub is_available: bool,
    #[serde(default)]
    pub custom_hours: Option<Vec<TimeRange>>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEventSpec {
    pub title: String,
    pub kind: CalendarEventKind,
    pub start: Ms,
    pub end: Ms,
    #[serde(default = "default_true")]
    pub affects_availability: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub duration_minutes: u32,
    pub price_cents: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddOnSpec {
    pub name: String,
    pub price_cents: Cents,
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::invalid(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    Ok(())
}

fn check_provider(spec: &ProviderSpec, slot_minutes: u32) -> Result<(), EngineError> {
    check_name(&spec.name, "provider name")?;
    if parse_tz(&spec.timezone).is_none() {
        return Err(EngineError::invalid(format!("unknown timezone {}", spec.timezone)));
    }
    if spec.buffer_minutes > MAX_BUFFER_MINUTES {
        return Err(EngineError::LimitExceeded("buffer too long"));
    }
    if slot_minutes == 0 || slot_minutes as Ms * MINUTE > MAX_BOOKING_DURATION_MS {
        return Err(EngineError::invalid("slot_minutes must be between 1 and 1440"));
    }
    Ok(())
}

/// Ranges must be well formed and pairwise disjoint.
fn check_ranges(ranges: &[TimeRange], what: &str) -> Result<(), EngineError> {
    if let Some(bad) = ranges.iter().find(|r| !r.is_valid()) {
        return Err(EngineError::invalid(format!(
            "{what} {}-{} ends before it starts",
            bad.start, bad.end
        )));
    }
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|r| r.start);
    if sorted.windows(2).any(|w| w[0].overlaps(&w[1])) {
        return Err(EngineError::invalid(format!("{what}s overlap")));
    }
    Ok(())
}

fn check_rule(spec: &RuleSpec) -> Result<(), EngineError> {
    if spec.day_of_week > 6 {
        return Err(EngineError::invalid("day_of_week must be in 0..=6"));
    }
    let hours = TimeRange::new(spec.start_time, spec.end_time);
    if !hours.is_valid() {
        return Err(EngineError::invalid("start_time must be before end_time"));
    }
    if spec.effective_to.is_some_and(|to| to < spec.effective_from) {
        return Err(EngineError::invalid("effective_to is before effective_from"));
    }
    if spec.breaks.len() > MAX_BREAKS_PER_RULE {
        return Err(EngineError::LimitExceeded("too many breaks in rule"));
    }
    check_ranges(&spec.breaks, "break")?;
    if spec.breaks.iter().any(|b| !hours.contains(b)) {
        return Err(EngineError::invalid("breaks must lie within the rule's hours"));
    }
    if let Some(tz) = &spec.timezone
        && parse_tz(tz).is_none()
    {
        return Err(EngineError::invalid(format!("unknown timezone {tz}")));
    }
    Ok(())
}

fn check_price(price_cents: Cents) -> Result<(), EngineError> {
    if price_cents < 0 {
        return Err(EngineError::invalid("price must not be negative"));
    }
    Ok(())
}

impl Engine {
    pub async fn create_provider(&self, spec: ProviderSpec) -> Result<ProviderInfo, EngineError> {
        let slot_minutes = spec.slot_minutes.unwrap_or(self.settings.slot_minutes);
        check_provider(&spec, slot_minutes)?;

        let id = Ulid::new();
        let event = Event::ProviderCreated {
            id,
            name: spec.name,
            timezone: spec.timezone,
            buffer_minutes: spec.buffer_minutes,
            slot_minutes,
        };
        let ps = provider_from_created(&event)
            .ok_or(EngineError::invalid("provider could not be created"))?;
        self.wal_append(vec![event]).await?;
        let info = ps.info();
        self.providers.insert(id, Arc::new(RwLock::new(ps)));

        metrics::gauge!(crate::observability::PROVIDERS_ACTIVE).set(self.providers.len() as f64);
        info!(provider = %id, name = %info.name, "provider created");
        Ok(info)
    }

    pub async fn update_provider(
        &self,
        id: Ulid,
        spec: ProviderSpec,
    ) -> Result<ProviderInfo, EngineError> {
        let mut ps = self.provider(id)?.write_owned().await;
        let slot_minutes = spec.slot_minutes.unwrap_or((ps.slot_step / MINUTE) as u32);
        check_provider(&spec, slot_minutes)?;
        let event = Event::ProviderUpdated {
            id,
            name: spec.name,
            timezone: spec.timezone,
            buffer_minutes: spec.buffer_minutes,
            slot_minutes,
        };
        self.persist_and_apply(&mut ps, vec![event]).await?;
        info!(provider = %id, "provider updated");
        Ok(ps.info())
    }

    pub async fn provider_info(&self, id: Ulid) -> Result<ProviderInfo, EngineError> {
        Ok(self.provider(id)?.read().await.info())
    }

    pub async fn add_rule(
        &self,
        provider_id: Ulid,
        spec: RuleSpec,
    ) -> Result<AvailabilityRule, EngineError> {
        check_rule(&spec)?;
        let mut ps = self.provider(provider_id)?.write_owned().await;
        if ps.rules.len() >= MAX_RULES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many rules on provider"));
        }
        let rule = AvailabilityRule {
            id: Ulid::new(),
            provider_id,
            day_of_week: spec.day_of_week,
            start_time: spec.start_time,
            end_time: spec.end_time,
            is_active: spec.is_active,
            effective_from: spec.effective_from,
            effective_to: spec.effective_to,
            timezone: spec
                .timezone
                .unwrap_or_else(|| ps.tz.name().to_string()),
            breaks: spec.breaks,
        };
        self.persist_and_apply(&mut ps, vec![Event::RuleAdded { rule: rule.clone() }])
            .await?;
        info!(provider = %provider_id, rule = %rule.id, day = rule.day_of_week, "rule added");
        Ok(rule)
    }

    pub async fn remove_rule(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ps = self.resolve_entity_write("rule", id).await?;
        if !ps.rules.iter().any(|r| r.id == id) {
            return Err(EngineError::not_found("rule", id));
        }
        let provider_id = ps.id;
        self.persist_and_apply(&mut ps, vec![Event::RuleRemoved { id, provider_id }])
            .await?;
        info!(provider = %provider_id, rule = %id, "rule removed");
        Ok(())
    }

    /// Replace the weekly rule for one date. A later override for the same date wins.
    pub async fn set_override(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
        spec: OverrideSpec,
    ) -> Result<AvailabilityOverride, EngineError> {
        if let Some(hours) = &spec.custom_hours {
            if hours.len() > MAX_CUSTOM_HOURS_PER_OVERRIDE {
                return Err(EngineError::LimitExceeded("too many custom hour ranges"));
            }
            check_ranges(hours, "custom hour range")?;
        }
        if spec.reason.as_ref().is_some_and(|r| r.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("override reason too long"));
        }
        let mut ps = self.provider(provider_id)?.write_owned().await;
        if !ps.overrides.contains_key(&date) && ps.overrides.len() >= MAX_OVERRIDES_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many overrides on provider"));
        }
        let entry = AvailabilityOverride {
            provider_id,
            date,
            is_available: spec.is_available,
            custom_hours: spec.custom_hours,
            reason: spec.reason,
        };
        self.persist_and_apply(&mut ps, vec![Event::OverrideSet { entry: entry.clone() }])
            .await?;
        info!(provider = %provider_id, %date, open = entry.is_available, "override set");
        Ok(entry)
    }

    /// Returns false if there was no override for `date`.
    pub async fn clear_override(
        &self,
        provider_id: Ulid,
        date: NaiveDate,
    ) -> Result<bool, EngineError> {
        let mut ps = self.provider(provider_id)?.write_owned().await;
        if !ps.overrides.contains_key(&date) {
            return Ok(false);
        }
        self.persist_and_apply(&mut ps, vec![Event::OverrideCleared { provider_id, date }])
            .await?;
        info!(provider = %provider_id, %date, "override cleared");
        Ok(true)
    }

    pub async fn add_calendar_event(
        &self,
        provider_id: Ulid,
        spec: CalendarEventSpec,
    ) -> Result<CalendarEvent, EngineError> {
        check_name(&spec.title, "event title")?;
        if spec.end <= spec.start {
            return Err(EngineError::invalid("event must end after it starts"));
        }
        if spec.end - spec.start > MAX_CALENDAR_EVENT_SPAN_MS {
            return Err(EngineError::LimitExceeded("calendar event longer than a year"));
        }
        if spec.start < MIN_VALID_TIMESTAMP_MS || spec.end > MAX_VALID_TIMESTAMP_MS {
            return Err(EngineError::LimitExceeded("timestamp out of range"));
        }
        let mut ps = self.provider(provider_id)?.write_owned().await;
        if ps.events.len() >= MAX_EVENTS_PER_PROVIDER {
            return Err(EngineError::LimitExceeded("too many calendar events on provider"));
        }
        let event = CalendarEvent {
            id: Ulid::new(),
            provider_id,
            title: spec.title,
            kind: spec.kind,
            start: spec.start,
            end: spec.end,
            affects_availability: spec.affects_availability,
        };
        self.persist_and_apply(
            &mut ps,
            vec![Event::CalendarEventAdded {
                event: event.clone(),
            }],
        )
        .await?;
        info!(provider = %provider_id, event = %event.id, kind = ?event.kind, "calendar event added");
        Ok(event)
    }

    pub async fn remove_calendar_event(&self, id: Ulid) -> Result<(), EngineError> {
        let mut ps = self.resolve_entity_write("calendar event", id).await?;
        if !ps.events.iter().any(|e| e.id == id) {
            return Err(EngineError::not_found("calendar event", id));
        }
        let provider_id = ps.id;
        self.persist_and_apply(&mut ps, vec![Event::CalendarEventRemoved { id, provider_id }])
            .await?;
        info!(provider = %provider_id, event = %id, "calendar event removed");
        Ok(())
    }

    pub async fn register_service(&self, spec: ServiceSpec) -> Result<Service, EngineError> {
        check_name(&spec.name, "service name")?;
        check_price(spec.price_cents)?;
        if spec.duration_minutes == 0 || spec.duration_minutes as Ms * MINUTE > MAX_BOOKING_DURATION_MS {
            return Err(EngineError::invalid("service duration must be between 1 and 1440 minutes"));
        }
        let service = Service {
            id: Ulid::new(),
            name: spec.name,
            duration_minutes: spec.duration_minutes,
            price_cents: spec.price_cents,
        };
        self.persist_global(vec![Event::ServiceRegistered {
            service: service.clone(),
        }])
        .await?;
        info!(service = %service.id, name = %service.name, "service registered");
        Ok(service)
    }

    pub async fn register_add_on(&self, spec: AddOnSpec) -> Result<AddOn, EngineError> {
        check_name(&spec.name, "add-on name")?;
        check_price(spec.price_cents)?;
        let add_on = AddOn {
            id: Ulid::new(),
            name: spec.name,
            price_cents: spec.price_cents,
        };
        self.persist_global(vec![Event::AddOnRegistered {
            add_on: add_on.clone(),
        }])
        .await?;
        info!(add_on = %add_on.id, name = %add_on.name, "add-on registered");
        Ok(add_on)
    }

    /// Candidate slots for a date range, recomputed from the calendar on every call.
    pub async fn availability(
        &self,
        q: &AvailabilityQuery,
    ) -> Result<TimeSlotAvailability, EngineError> {
        if q.date_to < q.date_from {
            return Err(EngineError::invalid("date_to is before date_from"));
        }
        if (q.date_to - q.date_from).num_days() >= MAX_QUERY_WINDOW_DAYS {
            return Err(EngineError::LimitExceeded("query window longer than 62 days"));
        }
        let service = q
            .service_id
            .map(|id| {
                self.services
                    .get(&id)
                    .map(|s| s.value().clone())
                    .ok_or(EngineError::not_found("service", id))
            })
            .transpose()?;

        let ps = self.provider(q.provider_id)?.read_owned().await;
        let duration_minutes = q
            .duration
            .or(service.as_ref().map(|s| s.duration_minutes))
            .unwrap_or((ps.slot_step / MINUTE) as u32);
        if duration_minutes == 0 {
            return Err(EngineError::invalid("duration must be positive"));
        }
        if duration_minutes as Ms * MINUTE > MAX_BOOKING_DURATION_MS {
            return Err(EngineError::LimitExceeded("duration longer than 24 hours"));
        }

        let now = self.clock.now();
        let spec = SlotSpec {
            date_from: q.date_from,
            date_to: q.date_to,
            service_id: q.service_id,
            duration: duration_minutes as Ms * MINUTE,
            price_cents: service.map(|s| s.price_cents),
            include_blocked: q.include_blocked,
            now,
            window: self.window(now),
        };
        let slots: Vec<TimeSlot> = slots(&ps, spec).collect();
        Ok(TimeSlotAvailability {
            provider_id: q.provider_id,
            date_from: q.date_from,
            date_to: q.date_to,
            service_id: q.service_id,
            duration_minutes,
            total_available: slots.iter().filter(|s| s.is_available).count(),
            slots,
        })
    }
}
