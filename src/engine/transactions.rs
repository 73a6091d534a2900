use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedRwLockWriteGuard;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{BOOKINGS_COMMITTED_TOTAL, CLASSES_CREATED_TOTAL, ENROLLMENTS_COMMITTED_TOTAL};

use super::capacity::check_capacity;
use super::conflict::{check_no_conflict, check_unique_start, now_ms, validate_date_span, validate_range};
use super::{apply_to_class, apply_to_court, apply_to_schedule, Engine, EngineError};

/// A class repeated on every day of a date range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurringClass {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub instructor_id: Ulid,
    pub range: TimeRange,
    pub capacity: u32,
}

fn check_class_details(details: &ClassDetails) -> Result<(), EngineError> {
    validate_range(&details.range)?;
    if details.name.trim().is_empty() {
        return Err(EngineError::InvalidInput("class name must not be empty".into()));
    }
    if details.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("class name too long"));
    }
    if let Some(d) = &details.description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if details.capacity == 0 {
        return Err(EngineError::InvalidInput("class capacity must be at least one".into()));
    }
    if details.capacity > MAX_CLASS_CAPACITY {
        return Err(EngineError::LimitExceeded("class capacity too large"));
    }
    Ok(())
}

impl Engine {
    pub(super) fn require_instructor(&self, id: Ulid) -> Result<(), EngineError> {
        let user = self.users.get(&id).ok_or(EngineError::NotFound(id))?;
        if user.role != Role::Instructor {
            return Err(EngineError::InvalidInput(format!("user {id} is not an instructor")));
        }
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────────────

    /// Book a court, or edit an existing booking when `existing` is given.
    ///
    /// The member's entitlement is read under their lock and the overlap check
    /// runs under the court's write lock, held until the booking is applied.
    /// An edit that moves the booking to another court locks both courts in id
    /// order. The result is always a confirmed booking.
    pub async fn create_or_update_booking(
        &self,
        member_id: Ulid,
        court_id: Ulid,
        date: NaiveDate,
        range: TimeRange,
        existing: Option<Ulid>,
    ) -> Result<Booking, EngineError> {
        validate_range(&range)?;

        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let member = ms.read().await;
        self.require_entitlement(&member, Capability::CourtBooking)?;

        let source = match existing {
            Some(id) => Some(self.court_for_booking(&id).ok_or(EngineError::NotFound(id))?),
            None => None,
        };
        let mut court_ids = vec![court_id];
        if let Some(src) = source
            && src != court_id
        {
            court_ids.push(src);
        }
        court_ids.sort();

        let mut guards: Vec<OwnedRwLockWriteGuard<CourtState>> = Vec::with_capacity(2);
        for id in &court_ids {
            let cs = self.get_court_state(id).ok_or(EngineError::NotFound(*id))?;
            guards.push(cs.write_owned().await);
            if !self.courts.contains_key(id) {
                return Err(EngineError::NotFound(*id));
            }
        }

        let previous = match (existing, source) {
            (Some(id), Some(src)) => {
                let holder = guards
                    .iter()
                    .find(|g| g.court.id == src)
                    .ok_or(EngineError::NotFound(src))?;
                // Moved by a concurrent edit between the index lookup and locking.
                let booking = holder
                    .bookings
                    .get(&id)
                    .cloned()
                    .ok_or(EngineError::ScheduleConflict(id))?;
                if booking.status == BookingStatus::Cancelled {
                    return Err(EngineError::InvalidTransition("cannot edit a cancelled booking"));
                }
                Some(booking)
            }
            _ => None,
        };

        let target = guards
            .iter()
            .position(|g| g.court.id == court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        {
            let cs = &guards[target];
            if !cs.court.active {
                return Err(EngineError::Inactive(court_id));
            }
            if previous.is_none() && cs.bookings.len() >= MAX_BOOKINGS_PER_COURT {
                return Err(EngineError::LimitExceeded("too many bookings on court"));
            }
            check_no_conflict(&cs.schedule, date, &range, existing)?;
            check_unique_start(cs, date, &range, existing).map_err(|e| e.user_facing(court_id))?;
        }

        let booking = Booking {
            id: existing.unwrap_or_else(Ulid::new),
            member_id,
            court_id,
            date,
            range,
            status: BookingStatus::Confirmed,
            registered_at: previous.as_ref().map_or_else(now_ms, |b| b.registered_at),
        };
        let event = Event::BookingSaved {
            booking: booking.clone(),
            moved_from: source.filter(|src| *src != court_id),
        };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            apply_to_court(guard, &event);
        }
        self.publish(&event);

        let op = if previous.is_some() { "update" } else { "create" };
        metrics::counter!(BOOKINGS_COMMITTED_TOTAL, "op" => op).increment(1);
        debug!("booking {} on court {court_id} {date} {}-{}", booking.id, range.start, range.end);
        Ok(booking)
    }

    /// Cancel a booking. It stays on record but frees its window.
    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let court_id = self.court_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let cs = self
            .get_court_state(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let mut guard = cs.write().await;
        if !self.courts.contains_key(&court_id) {
            return Err(EngineError::NotFound(id));
        }
        let booking = guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if booking.status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidTransition("booking already cancelled"));
        }
        let event = Event::BookingCancelled { id, court_id };
        self.persist_and_apply_court(&mut guard, &event).await?;
        Ok(Booking {
            status: BookingStatus::Cancelled,
            ..booking
        })
    }

    // ── Enrollments ──────────────────────────────────────────────

    /// Enroll a member in a class. Enrolling twice returns the existing record,
    /// even once the class has filled up, since the seat is already theirs.
    pub async fn enroll_member(
        &self,
        member_id: Ulid,
        class_id: Ulid,
    ) -> Result<Enrollment, EngineError> {
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let member = ms.read().await;
        self.require_entitlement(&member, Capability::ClassEnrollment)?;

        let cs = self
            .get_class_state(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let mut guard = cs.write().await;
        if !self.classes.contains_key(&class_id) {
            return Err(EngineError::NotFound(class_id));
        }
        if !guard.class.active {
            return Err(EngineError::Inactive(class_id));
        }

        let enrollment = match guard.enrollments.get(&member_id) {
            Some(e) if e.status == EnrollmentStatus::Enrolled => return Ok(e.clone()),
            Some(e) => Enrollment {
                status: EnrollmentStatus::Enrolled,
                attendance: Attendance::Pending,
                ..e.clone()
            },
            None => Enrollment {
                id: Ulid::new(),
                member_id,
                class_id,
                status: EnrollmentStatus::Enrolled,
                attendance: Attendance::Pending,
                registered_at: now_ms(),
            },
        };
        check_capacity(&guard)?;

        let event = Event::EnrollmentSaved {
            enrollment: enrollment.clone(),
        };
        self.persist_and_apply_class(&mut guard, &event).await?;
        metrics::counter!(ENROLLMENTS_COMMITTED_TOTAL).increment(1);
        debug!("member {member_id} enrolled in class {class_id}");
        Ok(enrollment)
    }

    /// Cancel an enrollment. Cancelling twice is a no-op.
    pub async fn cancel_enrollment(&self, id: Ulid) -> Result<Enrollment, EngineError> {
        self.update_enrollment(id, |e| {
            if e.status == EnrollmentStatus::Cancelled {
                return Ok(None);
            }
            Ok(Some(Enrollment {
                status: EnrollmentStatus::Cancelled,
                ..e.clone()
            }))
        })
        .await
    }

    pub async fn set_attendance(
        &self,
        id: Ulid,
        attendance: Attendance,
    ) -> Result<Enrollment, EngineError> {
        self.update_enrollment(id, |e| {
            if e.status != EnrollmentStatus::Enrolled {
                return Err(EngineError::InvalidTransition(
                    "attendance needs an active enrollment",
                ));
            }
            if e.attendance == attendance {
                return Ok(None);
            }
            Ok(Some(Enrollment {
                attendance,
                ..e.clone()
            }))
        })
        .await
    }

    /// Lock the enrollment's class and commit whatever `change` returns.
    /// `Ok(None)` means nothing to do.
    async fn update_enrollment(
        &self,
        id: Ulid,
        change: impl FnOnce(&Enrollment) -> Result<Option<Enrollment>, EngineError>,
    ) -> Result<Enrollment, EngineError> {
        let class_id = self.class_for_enrollment(&id).ok_or(EngineError::NotFound(id))?;
        let cs = self
            .get_class_state(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let mut guard = cs.write().await;
        if !self.classes.contains_key(&class_id) {
            return Err(EngineError::NotFound(id));
        }
        let current = guard.enrollment(id).cloned().ok_or(EngineError::NotFound(id))?;
        let Some(updated) = change(&current)? else {
            return Ok(current);
        };
        let event = Event::EnrollmentSaved {
            enrollment: updated.clone(),
        };
        self.persist_and_apply_class(&mut guard, &event).await?;
        Ok(updated)
    }

    // ── Classes ──────────────────────────────────────────────────

    pub async fn create_class(&self, details: ClassDetails) -> Result<Class, EngineError> {
        check_class_details(&details)?;
        self.require_instructor(details.instructor_id)?;
        if self.classes.len() >= MAX_CLASSES {
            return Err(EngineError::LimitExceeded("too many classes"));
        }

        let schedule = self
            .get_schedule(&details.instructor_id)
            .ok_or(EngineError::NotFound(details.instructor_id))?;
        let mut guard = schedule.write().await;
        // The instructor may have been removed while we waited.
        self.require_instructor(details.instructor_id)?;
        check_no_conflict(&guard, details.date, &details.range, None)?;

        let class = Class::from_details(Ulid::new(), details);
        let event = Event::ClassCreated {
            class: class.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_schedule(&mut guard, class.instructor_id, &event);
        self.publish(&event);

        metrics::counter!(CLASSES_CREATED_TOTAL).increment(1);
        info!("created class {} ({}) on {}", class.id, class.name, class.date);
        Ok(class)
    }

    /// One class per day in `[from, to]`. Either every day fits the
    /// instructor's schedule and all are created, or none are.
    pub async fn create_recurring_classes(
        &self,
        template: RecurringClass,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Class>, EngineError> {
        validate_date_span(from, to)?;
        let days: Vec<NaiveDate> = from.iter_days().take_while(|d| *d <= to).collect();
        let details: Vec<ClassDetails> = days
            .iter()
            .map(|&date| ClassDetails {
                name: template.name.clone(),
                description: template.description.clone(),
                instructor_id: template.instructor_id,
                date,
                range: template.range,
                capacity: template.capacity,
            })
            .collect();
        for d in &details {
            check_class_details(d)?;
        }
        self.require_instructor(template.instructor_id)?;
        if self.classes.len() + details.len() > MAX_CLASSES {
            return Err(EngineError::LimitExceeded("too many classes"));
        }

        let schedule = self
            .get_schedule(&template.instructor_id)
            .ok_or(EngineError::NotFound(template.instructor_id))?;
        let mut guard = schedule.write().await;
        self.require_instructor(template.instructor_id)?;

        // Phase 1: validate every day against the schedule as it stands.
        for d in &details {
            check_no_conflict(&guard, d.date, &d.range, None)?;
        }

        // Phase 2: commit the whole series as one record.
        let created: Vec<Class> = details
            .into_iter()
            .map(|d| Class::from_details(Ulid::new(), d))
            .collect();
        let event = Event::ClassesCreated {
            classes: created.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_schedule(&mut guard, template.instructor_id, &event);
        self.publish(&event);

        metrics::counter!(CLASSES_CREATED_TOTAL).increment(created.len() as u64);
        info!(
            "created {} recurring classes {} from {from} to {to}",
            created.len(),
            template.name
        );
        Ok(created)
    }

    pub async fn update_class(&self, id: Ulid, details: ClassDetails) -> Result<Class, EngineError> {
        check_class_details(&details)?;
        self.require_instructor(details.instructor_id)?;
        self.rewrite_class(id, details.instructor_id, |current, enrolled| {
            if details.capacity < enrolled {
                return Err(EngineError::CapacityExceeded {
                    class: id,
                    capacity: details.capacity,
                });
            }
            Ok(Class {
                active: current.active,
                ..Class::from_details(id, details)
            })
        })
        .await
    }

    /// Deactivating frees the instructor's slot; reactivating must fit again.
    pub async fn set_class_active(&self, id: Ulid, active: bool) -> Result<Class, EngineError> {
        let instructor_id = self.class_instructor(id).await?;
        self.rewrite_class(id, instructor_id, |current, _| {
            Ok(Class {
                active,
                ..current.clone()
            })
        })
        .await
    }

    async fn class_instructor(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let cs = self.get_class_state(&id).ok_or(EngineError::NotFound(id))?;
        let instructor_id = cs.read().await.class.instructor_id;
        Ok(instructor_id)
    }

    /// Lock both instructor schedules (old and new) and the class, then commit
    /// the class `build` returns after re-running the overlap check.
    async fn rewrite_class(
        &self,
        id: Ulid,
        instructor_id: Ulid,
        build: impl FnOnce(&Class, u32) -> Result<Class, EngineError>,
    ) -> Result<Class, EngineError> {
        let previous_instructor = self.class_instructor(id).await?;
        let mut owners = vec![instructor_id, previous_instructor];
        owners.sort();
        owners.dedup();

        let mut schedules = Vec::with_capacity(owners.len());
        for owner in &owners {
            let schedule = self.get_schedule(owner).ok_or(EngineError::NotFound(*owner))?;
            schedules.push((*owner, schedule.write_owned().await));
        }
        self.require_instructor(instructor_id)?;
        let cs = self.get_class_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = cs.write().await;
        if !self.classes.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.class.instructor_id != previous_instructor {
            // Reassigned concurrently; the caller may retry.
            return Err(EngineError::ScheduleConflict(id));
        }

        let class = build(&guard.class, guard.enrolled_count())?;
        if class == guard.class {
            return Ok(class);
        }
        if class.active {
            let (_, target) = schedules
                .iter()
                .find(|(owner, _)| *owner == class.instructor_id)
                .ok_or(EngineError::NotFound(class.instructor_id))?;
            check_no_conflict(target, class.date, &class.range, Some(id))?;
        }

        let event = Event::ClassUpdated {
            class: class.clone(),
            previous_instructor: (previous_instructor != class.instructor_id)
                .then_some(previous_instructor),
        };
        self.wal_append(&event).await?;
        for (owner, schedule) in schedules.iter_mut() {
            apply_to_schedule(schedule, *owner, &event);
        }
        apply_to_class(&mut guard, &event);
        self.publish(&event);
        Ok(class)
    }

    /// Remove a class with all its enrollments.
    pub async fn delete_class(&self, id: Ulid) -> Result<(), EngineError> {
        let instructor_id = self.class_instructor(id).await?;
        let schedule = self
            .get_schedule(&instructor_id)
            .ok_or(EngineError::NotFound(instructor_id))?;
        let mut sched = schedule.write().await;
        let cs = self.get_class_state(&id).ok_or(EngineError::NotFound(id))?;
        let guard = cs.write().await;
        if guard.class.instructor_id != instructor_id {
            return Err(EngineError::ScheduleConflict(id));
        }
        if !self.classes.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let event = Event::ClassDeleted { id, instructor_id };
        self.wal_append(&event).await?;
        apply_to_schedule(&mut sched, instructor_id, &event);
        self.publish(&event);
        info!("deleted class {id} with {} enrollments", guard.enrollments.len());
        Ok(())
    }
}
