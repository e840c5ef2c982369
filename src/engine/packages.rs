use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::info;
use ulid::Ulid;

use crate::limits::{MAX_NAME_LEN, MAX_PACKAGE_SESSIONS};
use crate::model::*;

use super::store::apply_to_package;
use super::{Engine, EngineError};

/// Prepaid session balances. Each package has its own async lock; whoever holds it
/// may check the balance and commit a ledger event without racing another booking.
#[derive(Default)]
pub struct PackageLedger {
    packages: DashMap<Ulid, BookingPackage>,
    locks: DashMap<Ulid, Arc<Mutex<()>>>,
}

impl PackageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &Ulid) -> Option<BookingPackage> {
        self.packages.get(id).map(|p| p.value().clone())
    }

    pub fn contains(&self, id: &Ulid) -> bool {
        self.packages.contains_key(id)
    }

    pub(super) fn insert(&self, package: BookingPackage) {
        self.locks.entry(package.id).or_default();
        self.packages.insert(package.id, package);
    }

    pub(super) fn apply(&self, id: &Ulid, event: &Event) {
        if let Some(mut pkg) = self.packages.get_mut(id) {
            apply_to_package(&mut pkg, event);
        }
    }

    pub(super) async fn lock(&self, id: Ulid) -> Result<OwnedMutexGuard<()>, EngineError> {
        let lock = self
            .locks
            .get(&id)
            .map(|l| l.value().clone())
            .ok_or(EngineError::not_found("package", id))?;
        Ok(lock.lock_owned().await)
    }

    /// Can `client_id` spend `sessions` from this package on these services at `at`?
    pub fn check(
        &self,
        id: Ulid,
        client_id: Ulid,
        service_ids: &[Ulid],
        sessions: u32,
        at: Ms,
    ) -> Result<BookingPackage, EngineError> {
        let pkg = self.get(&id).ok_or(EngineError::not_found("package", id))?;
        if pkg.is_expired_at(at) {
            return Err(EngineError::PackageExpired(id));
        }
        if !pkg.transferrable && pkg.client_id != client_id {
            return Err(EngineError::invalid(format!(
                "package {id} belongs to another client and is not transferrable"
            )));
        }
        if !pkg.service_ids.is_empty()
            && let Some(s) = service_ids.iter().find(|s| !pkg.service_ids.contains(s))
        {
            return Err(EngineError::invalid(format!(
                "package {id} does not cover service {s}"
            )));
        }
        if pkg.remaining() < sessions {
            return Err(EngineError::PackageExhausted {
                id,
                remaining: pkg.remaining(),
                requested: sessions,
            });
        }
        Ok(pkg)
    }
}

pub(crate) fn validate_package(pkg: &BookingPackage) -> Result<(), EngineError> {
    if pkg.name.is_empty() {
        return Err(EngineError::invalid("package name must not be empty"));
    }
    if pkg.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("package name too long"));
    }
    if pkg.total_sessions == 0 {
        return Err(EngineError::invalid("package needs at least one session"));
    }
    if pkg.total_sessions > MAX_PACKAGE_SESSIONS {
        return Err(EngineError::LimitExceeded("too many sessions in package"));
    }
    if pkg.sessions_used > pkg.total_sessions {
        return Err(EngineError::invalid("sessions_used exceeds total_sessions"));
    }
    if pkg.validity_days == Some(0) {
        return Err(EngineError::invalid("validity_days must be positive"));
    }
    Ok(())
}

impl Engine {
    pub async fn register_package(
        &self,
        mut package: BookingPackage,
    ) -> Result<BookingPackage, EngineError> {
        package.sessions_reserved = 0;
        validate_package(&package)?;
        if self.packages.contains(&package.id) {
            return Err(EngineError::AlreadyExists(package.id));
        }
        self.persist_global(vec![Event::PackageRegistered {
            package: package.clone(),
        }])
        .await?;
        info!(package = %package.id, sessions = package.total_sessions, "package registered");
        Ok(package)
    }

    pub fn get_package(&self, id: Ulid) -> Result<BookingPackage, EngineError> {
        self.packages
            .get(&id)
            .ok_or(EngineError::not_found("package", id))
    }

    /// Charge sessions outside of any booking.
    pub async fn consume_package(
        &self,
        id: Ulid,
        sessions: u32,
    ) -> Result<BookingPackage, EngineError> {
        if sessions == 0 {
            return Err(EngineError::invalid("sessions must be at least 1"));
        }
        let _guard = self.packages.lock(id).await?;
        let pkg = self.get_package(id)?;
        let now = self.clock.now();
        if pkg.is_expired_at(now) {
            return Err(EngineError::PackageExpired(id));
        }
        if pkg.remaining() < sessions {
            return Err(EngineError::PackageExhausted {
                id,
                remaining: pkg.remaining(),
                requested: sessions,
            });
        }
        self.persist_global(vec![Event::PackageConsumed {
            id,
            booking_id: None,
            sessions,
            from_earmark: false,
        }])
        .await?;
        info!(package = %id, sessions, "package sessions consumed");
        self.get_package(id)
    }
}
