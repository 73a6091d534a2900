mod availability;
mod capacity;
mod conflict;
mod entitlement;
mod error;
mod mutations;
mod payments;
mod queries;
mod routines;
mod transactions;

pub use availability::{free_windows, merge_overlapping, subtract_ranges};
pub use conflict::ScheduleKey;
pub use error::EngineError;
pub use transactions::RecurringClass;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::debug;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedMemberState = Arc<RwLock<MemberState>>;
pub type SharedCourtState = Arc<RwLock<CourtState>>;
pub type SharedClassState = Arc<RwLock<ClassState>>;
pub type SharedSchedule = Arc<RwLock<Schedule>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that queue up while a flush is in
/// progress are written together and share a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let WalCommand::Append { event, response } = cmd else {
            handle_non_append(&mut wal, cmd);
            continue;
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    // Keep ordering: the batch is flushed before the other command runs.
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        respond_batch(batch, &result);

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so a half-buffered batch never leaks into the next one.
    let flushed = wal.flush_sync();
    appended.and(flushed)
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
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
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

/// All club state, held in memory and made durable through the WAL.
///
/// Every member, court, class and instructor schedule sits behind its own
/// `RwLock`. A mutation holds the write lock of the resource it checks for the
/// whole check → log → apply sequence, so two requests can never both pass an
/// overlap or capacity check against the same old state.
///
/// Lock order, whenever more than one is held: `registry` → members →
/// instructor schedules → courts → classes, ids ascending within a kind.
/// Anything that makes a record point at a plan, user or routine template
/// holds `registry`, so deleting one of those sees every reference.
pub struct Engine {
    pub(super) members: DashMap<Ulid, SharedMemberState>,
    pub(super) plans: DashMap<Ulid, Plan>,
    pub(super) users: DashMap<Ulid, User>,
    pub(super) templates: DashMap<Ulid, RoutineTemplate>,
    pub(super) courts: DashMap<Ulid, SharedCourtState>,
    pub(super) classes: DashMap<Ulid, SharedClassState>,
    /// Instructor user id → active classes they teach.
    pub(super) instructors: DashMap<Ulid, SharedSchedule>,
    /// Normalized national id → member id.
    pub(super) national_ids: DashMap<String, Ulid>,
    /// Lower-cased email → member id.
    pub(super) emails: DashMap<String, Ulid>,
    pub(super) booking_to_court: DashMap<Ulid, Ulid>,
    pub(super) enrollment_to_class: DashMap<Ulid, Ulid>,
    pub(super) subscription_to_member: DashMap<Ulid, Ulid>,
    pub(super) payment_to_member: DashMap<Ulid, Ulid>,
    pub(super) routine_to_member: DashMap<Ulid, Ulid>,
    /// Serializes uniqueness checks on names/ids and guards WAL compaction.
    pub(super) registry: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
}

// ── Event application ────────────────────────────────────

/// Apply a member-scoped event (caller holds the member's write lock).
pub(super) fn apply_to_member(ms: &mut MemberState, event: &Event) {
    match event {
        Event::MemberUpdated { profile, .. } => ms.member.profile = profile.clone(),
        Event::MemberStatusChanged { active, .. } => ms.member.active = *active,
        Event::SubscriptionAssigned { subscription, deactivated } => {
            for sub in ms.subscriptions.iter_mut() {
                if deactivated.contains(&sub.id) {
                    sub.active = false;
                }
            }
            ms.subscriptions.push(subscription.clone());
        }
        Event::SubscriptionDeactivated { id, .. } => {
            if let Some(sub) = ms.subscriptions.iter_mut().find(|s| s.id == *id) {
                sub.active = false;
            }
        }
        Event::PaymentSaved { payment, moved_from } => {
            if payment.member_id == ms.member.id {
                ms.payments.insert(payment.id, payment.clone());
            } else if *moved_from == Some(ms.member.id) {
                ms.payments.remove(&payment.id);
            }
        }
        Event::PaymentRemoved { id, .. } => {
            ms.payments.remove(id);
        }
        Event::RoutineSaved { routine } => {
            ms.routines.insert(routine.id, routine.clone());
        }
        Event::RoutineRemoved { id, .. } => {
            ms.routines.remove(id);
        }
        _ => {}
    }
}

/// Apply a court-scoped event (caller holds the court's write lock).
pub(super) fn apply_to_court(cs: &mut CourtState, event: &Event) {
    match event {
        Event::CourtUpdated { court } => cs.court = court.clone(),
        Event::BookingSaved { booking, moved_from } => {
            if booking.court_id == cs.court.id {
                cs.upsert_booking(booking.clone());
            } else if *moved_from == Some(cs.court.id) {
                cs.remove_booking(booking.id);
            }
        }
        Event::BookingCancelled { id, .. } => {
            if let Some(mut booking) = cs.bookings.get(id).cloned() {
                booking.status = BookingStatus::Cancelled;
                cs.upsert_booking(booking);
            }
        }
        Event::MemberDeleted { cascade, .. } => {
            for (court_id, booking_id) in &cascade.bookings {
                if *court_id == cs.court.id {
                    cs.remove_booking(*booking_id);
                }
            }
        }
        _ => {}
    }
}

/// Apply a class-scoped event (caller holds the class's write lock).
pub(super) fn apply_to_class(cs: &mut ClassState, event: &Event) {
    match event {
        Event::ClassUpdated { class, .. } => cs.class = class.clone(),
        Event::EnrollmentSaved { enrollment } => {
            cs.enrollments.insert(enrollment.member_id, enrollment.clone());
        }
        Event::MemberDeleted { id, cascade } => {
            if cascade.enrollments.iter().any(|(class_id, _)| *class_id == cs.class.id) {
                cs.enrollments.remove(id);
            }
        }
        _ => {}
    }
}

/// Apply a class event to the schedule of instructor `owner`.
pub(super) fn apply_to_schedule(schedule: &mut Schedule, owner: Ulid, event: &Event) {
    let place = |schedule: &mut Schedule, class: &Class| {
        if class.instructor_id == owner && class.active {
            schedule.insert(
                class.date,
                Slot {
                    id: class.id,
                    range: class.range,
                },
            );
        }
    };
    match event {
        Event::ClassCreated { class } => place(schedule, class),
        Event::ClassesCreated { classes } => {
            for class in classes {
                place(schedule, class);
            }
        }
        Event::ClassUpdated { class, .. } => {
            schedule.remove_id(class.id);
            place(schedule, class);
        }
        Event::ClassDeleted { id, .. } => {
            schedule.remove_id(*id);
        }
        _ => {}
    }
}

/// Resources whose watchers should hear about an event.
fn event_resources(event: &Event) -> Vec<Ulid> {
    match event {
        Event::MemberRegistered { member } => vec![member.id],
        Event::MemberUpdated { id, .. } | Event::MemberStatusChanged { id, .. } => vec![*id],
        Event::MemberDeleted { id, cascade } => {
            let mut ids = vec![*id];
            ids.extend(cascade.bookings.iter().map(|(court_id, _)| *court_id));
            ids.extend(cascade.enrollments.iter().map(|(class_id, _)| *class_id));
            ids.extend(cascade.logins.iter().copied());
            ids.sort();
            ids.dedup();
            ids
        }
        Event::SubscriptionAssigned { subscription, .. } => vec![subscription.member_id],
        Event::SubscriptionDeactivated { member_id, .. } => vec![*member_id],
        Event::PlanCreated { plan } | Event::PlanUpdated { plan } => vec![plan.id],
        Event::PlanDeleted { id } | Event::UserDeleted { id } | Event::CourtDeleted { id } => {
            vec![*id]
        }
        Event::UserRegistered { user } => vec![user.id],
        Event::CourtCreated { court } | Event::CourtUpdated { court } => vec![court.id],
        Event::BookingSaved { booking, moved_from } => {
            let mut ids = vec![booking.court_id];
            if let Some(from) = moved_from {
                ids.push(*from);
            }
            ids
        }
        Event::BookingCancelled { court_id, .. } => vec![*court_id],
        Event::ClassCreated { class } | Event::ClassUpdated { class, .. } => {
            vec![class.id, class.instructor_id]
        }
        Event::ClassesCreated { classes } => {
            let mut ids: Vec<Ulid> = classes.iter().map(|c| c.id).collect();
            ids.extend(classes.first().map(|c| c.instructor_id));
            ids
        }
        Event::ClassDeleted { id, instructor_id } => vec![*id, *instructor_id],
        Event::EnrollmentSaved { enrollment } => vec![enrollment.class_id],
        Event::PaymentSaved { payment, moved_from } => {
            let mut ids = vec![payment.member_id];
            if let Some(from) = moved_from {
                ids.push(*from);
            }
            ids
        }
        Event::PaymentRemoved { member_id, .. } => vec![*member_id],
        Event::TemplateSaved { template } => vec![template.id],
        Event::TemplateDeleted { id } => vec![*id],
        Event::RoutineSaved { routine } => vec![routine.member_id, routine.instructor_id],
        Event::RoutineRemoved {
            member_id,
            instructor_id,
            ..
        } => vec![*member_id, *instructor_id],
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            members: DashMap::new(),
            plans: DashMap::new(),
            users: DashMap::new(),
            templates: DashMap::new(),
            courts: DashMap::new(),
            classes: DashMap::new(),
            instructors: DashMap::new(),
            national_ids: DashMap::new(),
            emails: DashMap::new(),
            booking_to_court: DashMap::new(),
            enrollment_to_class: DashMap::new(),
            subscription_to_member: DashMap::new(),
            payment_to_member: DashMap::new(),
            routine_to_member: DashMap::new(),
            registry: Mutex::new(()),
            wal_tx,
            notify,
        };

        // Replay: we're the sole owner of these Arcs, so try_write always succeeds
        // instantly. Never use blocking_write here: this may run inside an async context.
        for event in &events {
            engine.replay_event(event);
        }
        debug!("replayed {} events from {}", events.len(), wal_path.display());

        Ok(engine)
    }

    fn replay_event(&self, event: &Event) {
        self.apply_registry(event);
        match event {
            Event::MemberUpdated { id, .. }
            | Event::MemberStatusChanged { id, .. }
            | Event::SubscriptionDeactivated { member_id: id, .. }
            | Event::PaymentRemoved { member_id: id, .. }
            | Event::RoutineRemoved { member_id: id, .. } => {
                if let Some(ms) = self.get_member_state(id) {
                    let mut guard = ms.try_write().expect("replay: uncontended write");
                    apply_to_member(&mut guard, event);
                }
            }
            Event::SubscriptionAssigned { subscription, .. } => {
                if let Some(ms) = self.get_member_state(&subscription.member_id) {
                    let mut guard = ms.try_write().expect("replay: uncontended write");
                    apply_to_member(&mut guard, event);
                }
            }
            Event::RoutineSaved { routine } => {
                if let Some(ms) = self.get_member_state(&routine.member_id) {
                    let mut guard = ms.try_write().expect("replay: uncontended write");
                    apply_to_member(&mut guard, event);
                }
            }
            Event::PaymentSaved { payment, moved_from } => {
                for member_id in std::iter::once(payment.member_id).chain(*moved_from) {
                    if let Some(ms) = self.get_member_state(&member_id) {
                        let mut guard = ms.try_write().expect("replay: uncontended write");
                        apply_to_member(&mut guard, event);
                    }
                }
            }
            Event::MemberDeleted { cascade, .. } => {
                for (court_id, _) in &cascade.bookings {
                    if let Some(cs) = self.get_court_state(court_id) {
                        let mut guard = cs.try_write().expect("replay: uncontended write");
                        apply_to_court(&mut guard, event);
                    }
                }
                for (class_id, _) in &cascade.enrollments {
                    if let Some(cs) = self.get_class_state(class_id) {
                        let mut guard = cs.try_write().expect("replay: uncontended write");
                        apply_to_class(&mut guard, event);
                    }
                }
            }
            Event::CourtUpdated { .. } | Event::BookingSaved { .. } | Event::BookingCancelled { .. } => {
                for court_id in event_resources(event) {
                    if let Some(cs) = self.get_court_state(&court_id) {
                        let mut guard = cs.try_write().expect("replay: uncontended write");
                        apply_to_court(&mut guard, event);
                    }
                }
            }
            Event::ClassCreated { class } | Event::ClassUpdated { class, .. } => {
                let mut owners = vec![class.instructor_id];
                if let Event::ClassUpdated {
                    previous_instructor: Some(prev),
                    ..
                } = event
                {
                    owners.push(*prev);
                }
                for owner in owners {
                    if let Some(schedule) = self.get_schedule(&owner) {
                        let mut guard = schedule.try_write().expect("replay: uncontended write");
                        apply_to_schedule(&mut guard, owner, event);
                    }
                }
                if let Some(cs) = self.get_class_state(&class.id) {
                    let mut guard = cs.try_write().expect("replay: uncontended write");
                    apply_to_class(&mut guard, event);
                }
            }
            Event::ClassDeleted { instructor_id, .. } => {
                if let Some(schedule) = self.get_schedule(instructor_id) {
                    let mut guard = schedule.try_write().expect("replay: uncontended write");
                    apply_to_schedule(&mut guard, *instructor_id, event);
                }
            }
            Event::ClassesCreated { classes } => {
                if let Some(owner) = classes.first().map(|c| c.instructor_id) {
                    if let Some(schedule) = self.get_schedule(&owner) {
                        let mut guard = schedule.try_write().expect("replay: uncontended write");
                        apply_to_schedule(&mut guard, owner, event);
                    }
                }
            }
            Event::EnrollmentSaved { enrollment } => {
                if let Some(cs) = self.get_class_state(&enrollment.class_id) {
                    let mut guard = cs.try_write().expect("replay: uncontended write");
                    apply_to_class(&mut guard, event);
                }
            }
            _ => {}
        }
    }

    /// Map-level effects of an event: registry inserts/removals and id indexes.
    /// Never touches a per-resource lock.
    fn apply_registry(&self, event: &Event) {
        match event {
            Event::MemberRegistered { member } => {
                self.index_member(member.id, &member.profile);
                self.members
                    .insert(member.id, Arc::new(RwLock::new(MemberState::new(member.clone()))));
            }
            Event::MemberUpdated { id, profile } => {
                self.unindex_member(*id);
                self.index_member(*id, profile);
            }
            Event::MemberDeleted { id, cascade } => {
                self.unindex_member(*id);
                self.members.remove(id);
                self.subscription_to_member.retain(|_, member_id| member_id != id);
                self.payment_to_member.retain(|_, member_id| member_id != id);
                self.routine_to_member.retain(|_, member_id| member_id != id);
                for (_, booking_id) in &cascade.bookings {
                    self.booking_to_court.remove(booking_id);
                }
                for (_, enrollment_id) in &cascade.enrollments {
                    self.enrollment_to_class.remove(enrollment_id);
                }
                for user_id in &cascade.logins {
                    self.users.remove(user_id);
                }
            }
            Event::PlanCreated { plan } | Event::PlanUpdated { plan } => {
                self.plans.insert(plan.id, plan.clone());
            }
            Event::PlanDeleted { id } => {
                self.plans.remove(id);
            }
            Event::UserRegistered { user } => {
                if user.role == Role::Instructor {
                    self.instructors.entry(user.id).or_default();
                }
                self.users.insert(user.id, user.clone());
            }
            Event::UserDeleted { id } => {
                self.users.remove(id);
                self.instructors.remove(id);
            }
            Event::CourtCreated { court } => {
                self.courts
                    .insert(court.id, Arc::new(RwLock::new(CourtState::new(court.clone()))));
            }
            Event::CourtDeleted { id } => {
                self.courts.remove(id);
                self.booking_to_court.retain(|_, court_id| court_id != id);
            }
            Event::BookingSaved { booking, .. } => {
                self.booking_to_court.insert(booking.id, booking.court_id);
            }
            Event::ClassCreated { class } => {
                self.classes
                    .insert(class.id, Arc::new(RwLock::new(ClassState::new(class.clone()))));
            }
            Event::ClassesCreated { classes } => {
                for class in classes {
                    self.classes
                        .insert(class.id, Arc::new(RwLock::new(ClassState::new(class.clone()))));
                }
            }
            Event::ClassDeleted { id, .. } => {
                self.classes.remove(id);
                self.enrollment_to_class.retain(|_, class_id| class_id != id);
            }
            Event::EnrollmentSaved { enrollment } => {
                self.enrollment_to_class
                    .insert(enrollment.id, enrollment.class_id);
            }
            Event::SubscriptionAssigned { subscription, .. } => {
                self.subscription_to_member
                    .insert(subscription.id, subscription.member_id);
            }
            Event::PaymentSaved { payment, .. } => {
                self.payment_to_member.insert(payment.id, payment.member_id);
            }
            Event::PaymentRemoved { id, .. } => {
                self.payment_to_member.remove(id);
            }
            Event::TemplateSaved { template } => {
                self.templates.insert(template.id, template.clone());
            }
            Event::TemplateDeleted { id } => {
                self.templates.remove(id);
            }
            Event::RoutineSaved { routine } => {
                self.routine_to_member.insert(routine.id, routine.member_id);
            }
            Event::RoutineRemoved { id, .. } => {
                self.routine_to_member.remove(id);
            }
            Event::MemberStatusChanged { .. }
            | Event::SubscriptionDeactivated { .. }
            | Event::CourtUpdated { .. }
            | Event::BookingCancelled { .. }
            | Event::ClassUpdated { .. } => {}
        }
    }

    fn index_member(&self, id: Ulid, profile: &MemberProfile) {
        self.national_ids.insert(profile.national_id.clone(), id);
        self.emails.insert(profile.email.to_lowercase(), id);
    }

    fn unindex_member(&self, id: Ulid) {
        self.national_ids.retain(|_, member_id| *member_id != id);
        self.emails.retain(|_, member_id| *member_id != id);
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Registry effects + watcher notification for an event already in the WAL.
    pub(super) fn publish(&self, event: &Event) {
        self.apply_registry(event);
        for resource_id in event_resources(event) {
            self.notify.send(resource_id, event);
        }
    }

    /// WAL-append, apply, publish for an event that touches no per-resource state.
    pub(super) async fn persist_registry(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.publish(event);
        Ok(())
    }

    pub(super) async fn persist_and_apply_member(
        &self,
        ms: &mut MemberState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_member(ms, event);
        self.publish(event);
        Ok(())
    }

    pub(super) async fn persist_and_apply_court(
        &self,
        cs: &mut CourtState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_court(cs, event);
        self.publish(event);
        Ok(())
    }

    pub(super) async fn persist_and_apply_class(
        &self,
        cs: &mut ClassState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_class(cs, event);
        self.publish(event);
        Ok(())
    }

    pub fn get_member_state(&self, id: &Ulid) -> Option<SharedMemberState> {
        self.members.get(id).map(|e| e.value().clone())
    }

    pub fn get_court_state(&self, id: &Ulid) -> Option<SharedCourtState> {
        self.courts.get(id).map(|e| e.value().clone())
    }

    pub fn get_class_state(&self, id: &Ulid) -> Option<SharedClassState> {
        self.classes.get(id).map(|e| e.value().clone())
    }

    pub fn get_schedule(&self, instructor_id: &Ulid) -> Option<SharedSchedule> {
        self.instructors.get(instructor_id).map(|e| e.value().clone())
    }

    pub fn court_for_booking(&self, booking_id: &Ulid) -> Option<Ulid> {
        self.booking_to_court.get(booking_id).map(|e| *e.value())
    }

    pub fn class_for_enrollment(&self, enrollment_id: &Ulid) -> Option<Ulid> {
        self.enrollment_to_class.get(enrollment_id).map(|e| *e.value())
    }

    pub fn member_for_payment(&self, payment_id: &Ulid) -> Option<Ulid> {
        self.payment_to_member.get(payment_id).map(|e| *e.value())
    }

    pub fn member_for_routine(&self, routine_id: &Ulid) -> Option<Ulid> {
        self.routine_to_member.get(routine_id).map(|e| *e.value())
    }

    /// Ids of a map, sorted: the order in which their locks may be taken.
    pub(super) fn sorted_ids<V>(map: &DashMap<Ulid, V>) -> Vec<Ulid> {
        let mut ids: Vec<Ulid> = map.iter().map(|e| *e.key()).collect();
        ids.sort();
        ids
    }

    /// Compact the WAL down to the events needed to recreate the current state.
    ///
    /// Holds the registry lock and a read lock on every resource until the new
    /// file is in place, so no committed mutation can fall between the snapshot
    /// and the swap.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let mut events = Vec::new();

        let mut users: Vec<User> = self.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|user| Event::UserRegistered { user }));

        let mut plans: Vec<Plan> = self.plans.iter().map(|e| e.value().clone()).collect();
        plans.sort_by_key(|p| p.id);
        events.extend(plans.into_iter().map(|plan| Event::PlanCreated { plan }));

        let mut templates: Vec<RoutineTemplate> =
            self.templates.iter().map(|e| e.value().clone()).collect();
        templates.sort_by_key(|t| t.id);
        events.extend(templates.into_iter().map(|template| Event::TemplateSaved { template }));

        let mut member_guards = Vec::new();
        for id in Self::sorted_ids(&self.members) {
            let Some(ms) = self.get_member_state(&id) else { continue };
            let guard = ms.read_owned().await;
            // Deleted while we waited for the lock.
            if !self.members.contains_key(&id) {
                continue;
            }
            events.push(Event::MemberRegistered {
                member: guard.member.clone(),
            });
            for subscription in &guard.subscriptions {
                events.push(Event::SubscriptionAssigned {
                    subscription: subscription.clone(),
                    deactivated: Vec::new(),
                });
            }
            let mut payments: Vec<&Payment> = guard.payments.values().collect();
            payments.sort_by_key(|p| p.id);
            events.extend(payments.into_iter().map(|payment| Event::PaymentSaved {
                payment: payment.clone(),
                moved_from: None,
            }));
            let mut routines: Vec<&Routine> = guard.routines.values().collect();
            routines.sort_by_key(|r| r.id);
            events.extend(routines.into_iter().map(|routine| Event::RoutineSaved {
                routine: routine.clone(),
            }));
            member_guards.push(guard);
        }

        let mut schedule_guards = Vec::new();
        for id in Self::sorted_ids(&self.instructors) {
            if let Some(schedule) = self.get_schedule(&id) {
                schedule_guards.push(schedule.read_owned().await);
            }
        }

        let mut court_guards = Vec::new();
        for id in Self::sorted_ids(&self.courts) {
            let Some(cs) = self.get_court_state(&id) else { continue };
            let guard = cs.read_owned().await;
            if !self.courts.contains_key(&id) {
                continue;
            }
            events.push(Event::CourtCreated {
                court: guard.court.clone(),
            });
            let mut bookings: Vec<&Booking> = guard.bookings.values().collect();
            bookings.sort_by_key(|b| b.id);
            for booking in bookings {
                events.push(Event::BookingSaved {
                    booking: booking.clone(),
                    moved_from: None,
                });
            }
            court_guards.push(guard);
        }

        let mut class_guards = Vec::new();
        for id in Self::sorted_ids(&self.classes) {
            let Some(cs) = self.get_class_state(&id) else { continue };
            let guard = cs.read_owned().await;
            if !self.classes.contains_key(&id) {
                continue;
            }
            events.push(Event::ClassCreated {
                class: guard.class.clone(),
            });
            let mut enrollments: Vec<&Enrollment> = guard.enrollments.values().collect();
            enrollments.sort_by_key(|e| e.id);
            for enrollment in enrollments {
                events.push(Event::EnrollmentSaved {
                    enrollment: enrollment.clone(),
                });
            }
            class_guards.push(guard);
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
