mod availability;
mod calendar;
mod conflict;
mod error;
mod lifecycle;
mod packages;
mod providers;
mod recurrence;
mod reservations;
mod slots;
mod store;
mod validator;

pub use calendar::{DaySchedule, local_date, local_to_ms, resolve_day};
pub use conflict::{BookingWindow, ConflictCheck, detect, detect_with_alternatives};
pub use error::EngineError;
pub use lifecycle::{SeriesOutcome, can_transition};
pub use packages::PackageLedger;
pub use providers::{AddOnSpec, CalendarEventSpec, OverrideSpec, ProviderSpec, RuleSpec, ServiceSpec};
pub use recurrence::{Expansion, expand, occurrences};
pub use slots::{SlotSpec, Slots, slots};
pub use validator::{BookingValidation, FailedOccurrence, price_breakdown};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use ulid::Ulid;

use crate::model::*;
use crate::notify::{LogNotifier, Notifier, ReminderDispatcher};
use crate::payment::{DeferredGateway, PaymentGateway};
use crate::wal::Wal;

use store::{EntityChange, Projection, apply_to_provider, entity_change, owned_entity_ids, package_event_id};

pub type SharedProviderState = Arc<RwLock<ProviderState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    /// One commit: every event lands in a single record or none do.
    Append {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<usize>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingCommit = (Vec<Event>, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { events, response } => {
                let mut batch = vec![(events, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { events, response }) => {
                            batch.push((events, response));
                        }
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingCommit]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (events, _) in batch {
        if let Err(e) = wal.append_buffered(events) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingCommit>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { response } => {
            let _ = response.send(compact(wal));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// Fold the log into its current state and rewrite it as the minimal event set.
/// Runs inside the writer, so no commit can land between the fold and the swap.
fn compact(wal: &mut Wal) -> io::Result<usize> {
    wal.flush_sync()?;
    let events = Wal::replay(wal.path())?;
    let snapshot = Projection::from_events(&events).snapshot();
    Wal::write_compact_file(wal.path(), &snapshot)?;
    wal.swap_compact_file()?;
    Ok(snapshot.len())
}

// ── Clock ────────────────────────────────────────────────

/// Source of "now". Manual clocks drive expiry in tests and simulations.
#[derive(Debug, Clone, Default)]
pub enum Clock {
    #[default]
    System,
    Manual(Arc<AtomicI64>),
}

impl Clock {
    pub fn manual(start: Ms) -> Self {
        Clock::Manual(Arc::new(AtomicI64::new(start)))
    }

    pub fn now(&self) -> Ms {
        match self {
            Clock::System => conflict::now_ms(),
            Clock::Manual(t) => t.load(Ordering::SeqCst),
        }
    }

    /// No-op on the system clock.
    pub fn advance(&self, by: Ms) {
        if let Clock::Manual(t) = self {
            t.fetch_add(by, Ordering::SeqCst);
        }
    }

    pub fn set(&self, to: Ms) {
        if let Clock::Manual(t) = self {
            t.store(to, Ordering::SeqCst);
        }
    }
}

// ── Settings & collaborators ─────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingSettings {
    pub tax_rate_bps: u32,
    pub booking_fee_cents: Cents,
    pub currency: String,
}

impl Default for PricingSettings {
    fn default() -> Self {
        Self {
            tax_rate_bps: 0,
            booking_fee_cents: 0,
            currency: "USD".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub hold_minutes: u32,
    pub reminder_lead_minutes: u32,
    pub max_advance_days: u32,
    pub min_notice_minutes: u32,
    /// Default slot granularity for new providers.
    pub slot_minutes: u32,
    pub pricing: PricingSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            hold_minutes: 15,
            reminder_lead_minutes: 60,
            max_advance_days: 180,
            min_notice_minutes: 0,
            slot_minutes: 15,
            pricing: PricingSettings::default(),
        }
    }
}

impl EngineSettings {
    pub fn hold(&self) -> Ms {
        self.hold_minutes as Ms * MINUTE
    }

    pub fn window(&self, now: Ms) -> BookingWindow {
        BookingWindow {
            earliest: now + self.min_notice_minutes as Ms * MINUTE,
            latest: now + self.max_advance_days as Ms * DAY,
        }
    }
}

/// External systems the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub payments: Arc<dyn PaymentGateway>,
    pub clock: Clock,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            notifier: Arc::new(LogNotifier),
            payments: Arc::new(DeferredGateway),
            clock: Clock::System,
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub(super) providers: DashMap<Ulid, SharedProviderState>,
    /// Reverse lookup: entity (rule/event/reservation/booking) id → provider id
    pub(super) entity_to_provider: DashMap<Ulid, Ulid>,
    pub(super) services: DashMap<Ulid, Service>,
    pub(super) add_ons: DashMap<Ulid, AddOn>,
    pub(super) packages: PackageLedger,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) settings: EngineSettings,
    pub(super) clock: Clock,
    pub(super) reminders: ReminderDispatcher,
    pub(super) payments: Arc<dyn PaymentGateway>,
}

impl Engine {
    /// Replay the WAL at `wal_path` and start the writer and reminder tasks.
    /// Must be called from within a Tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        settings: EngineSettings,
        collaborators: Collaborators,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let projection = Projection::from_events(&events);
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            providers: DashMap::new(),
            entity_to_provider: DashMap::new(),
            services: DashMap::new(),
            add_ons: DashMap::new(),
            packages: PackageLedger::new(),
            wal_tx,
            settings,
            clock: collaborators.clock,
            reminders: ReminderDispatcher::spawn(collaborators.notifier),
            payments: collaborators.payments,
        };

        let Projection {
            providers,
            services,
            add_ons,
            packages,
        } = projection;
        for (id, ps) in providers {
            for entity in owned_entity_ids(&ps) {
                engine.entity_to_provider.insert(entity, id);
            }
            engine.providers.insert(id, Arc::new(RwLock::new(ps)));
        }
        for (id, service) in services {
            engine.services.insert(id, service);
        }
        for (id, add_on) in add_ons {
            engine.add_ons.insert(id, add_on);
        }
        for package in packages.into_values() {
            engine.packages.insert(package);
        }

        metrics::gauge!(crate::observability::PROVIDERS_ACTIVE).set(engine.providers.len() as f64);
        tracing::info!(
            events = events.len(),
            providers = engine.providers.len(),
            "engine state replayed"
        );
        Ok(engine)
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub(super) fn window(&self, now: Ms) -> BookingWindow {
        self.settings.window(now)
    }

    /// Write one commit to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
    }

    pub fn get_provider(&self, id: &Ulid) -> Option<SharedProviderState> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    pub(super) fn provider(&self, id: Ulid) -> Result<SharedProviderState, EngineError> {
        self.get_provider(&id)
            .ok_or(EngineError::not_found("provider", id))
    }

    pub fn get_provider_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_provider.get(entity_id).map(|e| *e.value())
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    /// WAL-append then apply, as one commit. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        ps: &mut ProviderState,
        events: Vec<Event>,
    ) -> Result<(), EngineError> {
        self.wal_append(events.clone()).await?;
        for event in &events {
            match event.provider_id() {
                Some(pid) => {
                    debug_assert_eq!(pid, ps.id, "commit spans providers");
                    apply_to_provider(ps, event);
                    self.index(pid, event);
                }
                None => self.apply_global(event),
            }
        }
        Ok(())
    }

    /// Commit events that touch no provider calendar (catalog, package ledger).
    pub(super) async fn persist_global(&self, events: Vec<Event>) -> Result<(), EngineError> {
        self.wal_append(events.clone()).await?;
        for event in &events {
            self.apply_global(event);
        }
        Ok(())
    }

    fn apply_global(&self, event: &Event) {
        match event {
            Event::ServiceRegistered { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::AddOnRegistered { add_on } => {
                self.add_ons.insert(add_on.id, add_on.clone());
            }
            Event::PackageRegistered { package } => self.packages.insert(package.clone()),
            other => {
                if let Some(id) = package_event_id(other) {
                    self.packages.apply(&id, other);
                }
            }
        }
    }

    fn index(&self, provider_id: Ulid, event: &Event) {
        match entity_change(event) {
            Some(EntityChange::Link(id)) => {
                self.entity_to_provider.insert(id, provider_id);
            }
            Some(EntityChange::Unlink(id)) => {
                self.entity_to_provider.remove(&id);
            }
            None => {}
        }
    }

    /// Lookup entity → provider, acquire the provider's write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        kind: &'static str,
        entity_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<ProviderState>, EngineError> {
        let provider_id = self
            .get_provider_for_entity(&entity_id)
            .ok_or(EngineError::not_found(kind, entity_id))?;
        Ok(self.provider(provider_id)?.write_owned().await)
    }

    pub(super) async fn resolve_entity_read(
        &self,
        kind: &'static str,
        entity_id: Ulid,
    ) -> Result<OwnedRwLockReadGuard<ProviderState>, EngineError> {
        let provider_id = self
            .get_provider_for_entity(&entity_id)
            .ok_or(EngineError::not_found(kind, entity_id))?;
        Ok(self.provider(provider_id)?.read_owned().await)
    }

    /// Rewrite the WAL with only the events needed to recreate the current state.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| EngineError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Wal(e.to_string()))
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
