use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{
    MAX_ADD_ONS_PER_BOOKING, MAX_BOOKING_DURATION_MS, MAX_NOTES_LEN, MAX_SERVICES_PER_BOOKING,
};
use crate::model::*;

use super::conflict::{BookingWindow, ConflictCheck, detect_with_alternatives, validate_span};
use super::recurrence::expand;
use super::{Engine, EngineError, PricingSettings};

/// Catalog entries a request refers to, looked up once.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedRequest {
    pub services: Vec<Service>,
    pub add_ons: Vec<AddOn>,
    pub duration_minutes: u32,
}

impl ResolvedRequest {
    pub fn service_ids(&self) -> Vec<Ulid> {
        self.services.iter().map(|s| s.id).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingValidation {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub conflicts: Vec<BookingConflict>,
    pub estimated_total: Cents,
    pub breakdown: PriceBreakdown,
    /// Starts that would be created, in order.
    pub occurrences: Vec<Ms>,
}

/// Occurrence that could not be placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOccurrence {
    pub start: Ms,
    pub reason: String,
    pub conflicts: Vec<BookingConflict>,
}

/// Accepted spans and rejected starts of one (possibly recurring) request.
#[derive(Debug, Default)]
pub(crate) struct OccurrencePlan {
    pub accepted: Vec<Span>,
    pub failed: Vec<FailedOccurrence>,
}

impl OccurrencePlan {
    /// Fail accepted occurrences beyond what a package balance of `funded` covers.
    /// Returns how many were moved.
    pub fn limit_to_balance(&mut self, funded: usize) -> usize {
        if self.accepted.len() <= funded {
            return 0;
        }
        let unfunded = self.accepted.split_off(funded);
        let moved = unfunded.len();
        self.failed.extend(unfunded.into_iter().map(|span| FailedOccurrence {
            start: span.start,
            reason: "package balance exhausted".into(),
            conflicts: Vec::new(),
        }));
        self.failed.sort_by_key(|f| f.start);
        moved
    }
}

/// Check each start against the calendar and against the starts accepted before it.
pub(crate) fn plan_occurrences(
    ps: &ProviderState,
    starts: &[Ms],
    duration_minutes: u32,
    now: Ms,
    window: BookingWindow,
) -> OccurrencePlan {
    let mut plan = OccurrencePlan::default();
    for &start in starts {
        let span = Span::from_minutes(start, duration_minutes);
        if let Err(e) = validate_span(&span) {
            plan.failed.push(FailedOccurrence {
                start,
                reason: e.to_string(),
                conflicts: Vec::new(),
            });
            continue;
        }
        let check = ConflictCheck {
            span,
            now,
            window,
            ignore: None,
            pending: &plan.accepted,
        };
        let conflicts = detect_with_alternatives(ps, &check);
        if conflicts.is_empty() {
            plan.accepted.push(span);
        } else {
            plan.failed.push(FailedOccurrence {
                start,
                reason: "conflict".into(),
                conflicts,
            });
        }
    }
    plan
}

fn round_half_up(numerator: i64, denominator: i64) -> i64 {
    (numerator + denominator / 2) / denominator
}

/// Price of `occurrences` identical appointments. A package covers the service
/// subtotal; add-ons, taxes and fees stay payable.
pub fn price_breakdown(
    services: &[Service],
    add_ons: &[AddOn],
    package_funded: bool,
    occurrences: u32,
    pricing: &PricingSettings,
) -> PriceBreakdown {
    let services_total: Cents = services.iter().map(|s| s.price_cents).sum();
    let add_ons_total: Cents = add_ons.iter().map(|a| a.price_cents).sum();
    let discount = if package_funded { services_total } else { 0 };
    let taxable = services_total + add_ons_total - discount;
    let taxes = round_half_up(taxable * pricing.tax_rate_bps as i64, 10_000);
    let fees = pricing.booking_fee_cents;
    let per_occurrence_total = taxable + taxes + fees;
    PriceBreakdown {
        services: services_total,
        add_ons: add_ons_total,
        discount,
        taxes,
        fees,
        per_occurrence_total,
        occurrences,
        total: per_occurrence_total * occurrences as Cents,
        currency: pricing.currency.clone(),
    }
}

impl Engine {
    /// Shape and catalog checks shared by every booking path.
    pub(crate) fn resolve_request(
        &self,
        req: &BookingRequest,
    ) -> Result<ResolvedRequest, EngineError> {
        if req.service_ids.is_empty() {
            return Err(EngineError::invalid("at least one service is required"));
        }
        if req.service_ids.len() > MAX_SERVICES_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many services in one booking"));
        }
        if req.add_on_ids.len() > MAX_ADD_ONS_PER_BOOKING {
            return Err(EngineError::LimitExceeded("too many add-ons in one booking"));
        }
        if req.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }

        let services = req
            .service_ids
            .iter()
            .map(|id| {
                self.services
                    .get(id)
                    .map(|s| s.value().clone())
                    .ok_or(EngineError::not_found("service", *id))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let add_ons = req
            .add_on_ids
            .iter()
            .map(|id| {
                self.add_ons
                    .get(id)
                    .map(|a| a.value().clone())
                    .ok_or(EngineError::not_found("add-on", *id))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let duration_minutes = req
            .duration_minutes
            .unwrap_or_else(|| services.iter().map(|s| s.duration_minutes).sum());
        if duration_minutes == 0 {
            return Err(EngineError::invalid("duration must be positive"));
        }
        if duration_minutes as Ms * MINUTE > MAX_BOOKING_DURATION_MS {
            return Err(EngineError::LimitExceeded("duration longer than 24 hours"));
        }

        Ok(ResolvedRequest {
            services,
            add_ons,
            duration_minutes,
        })
    }

    /// Dry run of a booking request. Never mutates state.
    pub async fn validate_booking(
        &self,
        req: &BookingRequest,
    ) -> Result<BookingValidation, EngineError> {
        let ps_lock = self.provider(req.provider_id)?;
        let mut report = BookingValidation::default();

        let resolved = match self.resolve_request(req) {
            Ok(resolved) => resolved,
            Err(e) => {
                report.errors.push(e.to_string());
                return Ok(report);
            }
        };

        let ps = ps_lock.read().await;
        let now = self.clock.now();
        let starts = match &req.recurrence {
            None => vec![req.start],
            Some(cfg) => match expand(req.start, ps.tz, cfg) {
                Ok(expansion) => {
                    if expansion.truncated {
                        report.warnings.push(format!(
                            "series truncated to {} occurrences",
                            expansion.starts.len()
                        ));
                    }
                    expansion.starts
                }
                Err(e) => {
                    report.errors.push(e.to_string());
                    return Ok(report);
                }
            },
        };

        let mut plan = plan_occurrences(
            &ps,
            &starts,
            resolved.duration_minutes,
            now,
            self.window(now),
        );
        for failed in &plan.failed {
            if failed.conflicts.is_empty() {
                report.errors.push(failed.reason.clone());
            }
        }
        report.conflicts = plan
            .failed
            .iter()
            .flat_map(|f| f.conflicts.iter().cloned())
            .collect();

        let mut package_funded = false;
        if let Some(package_id) = req.package_id {
            match self
                .packages
                .check(package_id, req.client_id, &req.service_ids, 1, now)
            {
                Ok(pkg) => {
                    package_funded = true;
                    let wanted = plan.accepted.len();
                    let unfunded = plan.limit_to_balance(pkg.remaining() as usize);
                    if unfunded > 0 {
                        report.warnings.push(format!(
                            "package covers {} of {wanted} occurrences",
                            wanted - unfunded
                        ));
                    }
                }
                Err(e) => report.errors.push(e.to_string()),
            }
        }

        let lead = self.settings.reminder_lead_minutes as Ms * MINUTE;
        if plan.accepted.first().is_some_and(|s| s.start - lead <= now) {
            report
                .warnings
                .push("appointment starts within the reminder lead time, no reminder will be sent".into());
        }

        let occurrences = match req.recurrence {
            None => 1,
            Some(_) => plan.accepted.len() as u32,
        };
        report.breakdown = price_breakdown(
            &resolved.services,
            &resolved.add_ons,
            package_funded,
            occurrences,
            &self.settings.pricing,
        );
        report.estimated_total = report.breakdown.total;
        report.occurrences = plan.accepted.iter().map(|s| s.start).collect();
        report.is_valid = report.errors.is_empty() && report.conflicts.is_empty();
        Ok(report)
    }
}
