use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::availability::free_windows;
use super::capacity::has_seat;
use super::conflict::{find_conflict, validate_date_span, validate_range};
use super::mutations::normalize_national_id;
use super::{Engine, EngineError, ScheduleKey};

impl Engine {
    // ── Core checks ──────────────────────────────────────────────

    /// Whether `range` on `date` overlaps anything on the keyed schedule.
    /// Touching endpoints are not a conflict.
    pub async fn has_conflict(
        &self,
        key: ScheduleKey,
        date: NaiveDate,
        range: TimeRange,
        exclude: Option<Ulid>,
    ) -> Result<bool, EngineError> {
        validate_range(&range)?;
        let hit = match key {
            ScheduleKey::Court(id) => {
                let cs = self.get_court_state(&id).ok_or(EngineError::NotFound(id))?;
                let guard = cs.read().await;
                find_conflict(&guard.schedule, date, &range, exclude)
            }
            ScheduleKey::Instructor(id) => {
                let schedule = self.get_schedule(&id).ok_or(EngineError::NotFound(id))?;
                let guard = schedule.read().await;
                find_conflict(&guard, date, &range, exclude)
            }
        };
        Ok(hit.is_some())
    }

    pub async fn has_capacity(&self, class_id: Ulid) -> Result<bool, EngineError> {
        let cs = self
            .get_class_state(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let guard = cs.read().await;
        Ok(has_seat(&guard))
    }

    // ── Members & plans ──────────────────────────────────────────

    pub async fn get_member(&self, id: Ulid) -> Result<Member, EngineError> {
        let ms = self.get_member_state(&id).ok_or(EngineError::NotFound(id))?;
        let member = ms.read().await.member.clone();
        Ok(member)
    }

    pub async fn find_member_by_national_id(&self, national_id: &str) -> Option<Member> {
        let id = *self.national_ids.get(&normalize_national_id(national_id))?;
        self.get_member(id).await.ok()
    }

    /// All members, by last name then first name.
    pub async fn list_members(&self) -> Vec<Member> {
        let mut members = Vec::with_capacity(self.members.len());
        for id in Self::sorted_ids(&self.members) {
            if let Ok(member) = self.get_member(id).await {
                members.push(member);
            }
        }
        members.sort_by(|a, b| {
            (&a.profile.last_name, &a.profile.first_name)
                .cmp(&(&b.profile.last_name, &b.profile.first_name))
        });
        members
    }

    pub fn get_plan(&self, id: Ulid) -> Result<Plan, EngineError> {
        self.plans
            .get(&id)
            .map(|p| p.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn list_plans(&self) -> Vec<Plan> {
        let mut plans: Vec<Plan> = self.plans.iter().map(|p| p.value().clone()).collect();
        plans.sort_by(|a, b| a.name.cmp(&b.name));
        plans
    }

    /// Assignments of a member, newest first.
    pub async fn subscriptions_of(&self, member_id: Ulid) -> Result<Vec<Subscription>, EngineError> {
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let mut subs = ms.read().await.subscriptions.clone();
        subs.reverse();
        Ok(subs)
    }

    /// The plan a member should be shown as having on `today`. Unlike the
    /// entitlement check, lapsed assignments are skipped here.
    pub async fn current_plan(
        &self,
        member_id: Ulid,
        today: NaiveDate,
    ) -> Result<Option<PlanSummary>, EngineError> {
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let guard = ms.read().await;
        Ok(guard.current_subscription(today).and_then(|sub| {
            self.plans.get(&sub.plan_id).map(|plan| PlanSummary {
                plan_id: plan.id,
                plan_name: plan.name.clone(),
                valid_until: sub.end_date,
            })
        }))
    }

    // ── Users & courts ───────────────────────────────────────────

    pub fn get_user(&self, id: Ulid) -> Result<User, EngineError> {
        self.users
            .get(&id)
            .map(|u| u.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn list_users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.iter().map(|u| u.value().clone()).collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users
    }

    pub async fn get_court(&self, id: Ulid) -> Result<Court, EngineError> {
        let cs = self.get_court_state(&id).ok_or(EngineError::NotFound(id))?;
        let court = cs.read().await.court.clone();
        Ok(court)
    }

    pub async fn list_courts(&self) -> Vec<Court> {
        let mut courts = Vec::with_capacity(self.courts.len());
        for id in Self::sorted_ids(&self.courts) {
            if let Ok(court) = self.get_court(id).await {
                courts.push(court);
            }
        }
        courts.sort_by(|a, b| a.name.cmp(&b.name));
        courts
    }

    // ── Bookings ─────────────────────────────────────────────────

    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let court_id = self.court_for_booking(&id).ok_or(EngineError::NotFound(id))?;
        let cs = self
            .get_court_state(&court_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = cs.read().await;
        guard.bookings.get(&id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Live bookings of a court on one day, by start time.
    pub async fn bookings_of(&self, court_id: Ulid, date: NaiveDate) -> Result<Vec<Booking>, EngineError> {
        let cs = self
            .get_court_state(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.read().await;
        Ok(guard
            .schedule
            .day(date)
            .iter()
            .filter_map(|slot| guard.bookings.get(&slot.id).cloned())
            .collect())
    }

    /// Free windows of a court inside `opening` on `date`, at least
    /// `min_minutes` long.
    pub async fn court_availability(
        &self,
        court_id: Ulid,
        date: NaiveDate,
        opening: TimeRange,
        min_minutes: i64,
    ) -> Result<Vec<TimeRange>, EngineError> {
        validate_range(&opening)?;
        let cs = self
            .get_court_state(&court_id)
            .ok_or(EngineError::NotFound(court_id))?;
        let guard = cs.read().await;
        let busy: Vec<TimeRange> = guard.schedule.day(date).iter().map(|s| s.range).collect();
        Ok(free_windows(&opening, &busy, min_minutes.max(0)))
    }

    /// Confirmed bookings in `[from, to]` across all courts, by date then start.
    pub async fn court_calendar(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<CourtEvent>, EngineError> {
        validate_date_span(from, to)?;
        let mut found: Vec<(Booking, String)> = Vec::new();
        for court_id in Self::sorted_ids(&self.courts) {
            let Some(cs) = self.get_court_state(&court_id) else { continue };
            let guard = cs.read().await;
            found.extend(
                guard
                    .bookings
                    .values()
                    .filter(|b| {
                        b.status == BookingStatus::Confirmed && b.date >= from && b.date <= to
                    })
                    .map(|b| (b.clone(), guard.court.name.clone())),
            );
        }
        // Court locks are released before member locks are taken.
        let names = self.member_names(found.iter().map(|(b, _)| b.member_id)).await;

        let mut events: Vec<CourtEvent> = found
            .into_iter()
            .map(|(b, court_name)| CourtEvent {
                booking_id: b.id,
                court_id: b.court_id,
                court_name,
                member_id: b.member_id,
                member_name: names.get(&b.member_id).cloned().unwrap_or_default(),
                date: b.date,
                range: b.range,
            })
            .collect();
        events.sort_by_key(|e| (e.date, e.range.start, e.court_id));
        Ok(events)
    }

    async fn member_names(&self, ids: impl Iterator<Item = Ulid>) -> HashMap<Ulid, String> {
        let mut names = HashMap::new();
        for id in ids {
            if names.contains_key(&id) {
                continue;
            }
            if let Ok(member) = self.get_member(id).await {
                names.insert(id, member.profile.display_name());
            }
        }
        names
    }

    // ── Classes ──────────────────────────────────────────────────

    pub async fn get_class(&self, id: Ulid) -> Result<Class, EngineError> {
        let cs = self.get_class_state(&id).ok_or(EngineError::NotFound(id))?;
        let class = cs.read().await.class.clone();
        Ok(class)
    }

    pub async fn get_enrollment(&self, id: Ulid) -> Result<Enrollment, EngineError> {
        let class_id = self.class_for_enrollment(&id).ok_or(EngineError::NotFound(id))?;
        let cs = self
            .get_class_state(&class_id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = cs.read().await;
        guard.enrollment(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Active classes in `[from, to]` with their seat counts, by date then start.
    pub async fn class_calendar(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ClassEvent>, EngineError> {
        validate_date_span(from, to)?;
        let mut events = Vec::new();
        for class_id in Self::sorted_ids(&self.classes) {
            let Some(cs) = self.get_class_state(&class_id) else { continue };
            let guard = cs.read().await;
            let class = &guard.class;
            if !class.active || class.date < from || class.date > to {
                continue;
            }
            events.push(ClassEvent {
                class_id: class.id,
                name: class.name.clone(),
                instructor_id: class.instructor_id,
                instructor_name: self
                    .users
                    .get(&class.instructor_id)
                    .map(|u| u.name.clone())
                    .unwrap_or_default(),
                date: class.date,
                range: class.range,
                capacity: class.capacity,
                enrolled: guard.enrolled_count(),
                seats_left: guard.seats_left(),
            });
        }
        events.sort_by_key(|e| (e.date, e.range.start, e.class_id));
        Ok(events)
    }

    /// Class detail with its enrolled members, by name.
    pub async fn class_roster(&self, class_id: Ulid) -> Result<ClassRoster, EngineError> {
        let cs = self
            .get_class_state(&class_id)
            .ok_or(EngineError::NotFound(class_id))?;
        let (class, enrolled, seats_left, active) = {
            let guard = cs.read().await;
            let active: Vec<Enrollment> = guard
                .enrollments
                .values()
                .filter(|e| e.status == EnrollmentStatus::Enrolled)
                .cloned()
                .collect();
            (guard.class.clone(), guard.enrolled_count(), guard.seats_left(), active)
        };
        let names = self.member_names(active.iter().map(|e| e.member_id)).await;

        let mut students: Vec<RosterEntry> = active
            .into_iter()
            .map(|e| RosterEntry {
                enrollment_id: e.id,
                member_id: e.member_id,
                member_name: names.get(&e.member_id).cloned().unwrap_or_default(),
                attendance: e.attendance,
            })
            .collect();
        students.sort_by(|a, b| a.member_name.cmp(&b.member_name));
        Ok(ClassRoster {
            class,
            enrolled,
            seats_left,
            students,
        })
    }
}
