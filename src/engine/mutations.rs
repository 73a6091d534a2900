use chrono::{Days, NaiveDate};
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_ms;
use super::{apply_to_class, apply_to_court, Engine, EngineError};

/// Strip `.` and `-` separators and upper-case the check digit.
pub fn normalize_national_id(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != '.' && *c != '-' && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn check_name(name: &str, what: &'static str) -> Result<(), EngineError> {
    if name.trim().is_empty() {
        return Err(EngineError::InvalidInput(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded(what));
    }
    Ok(())
}

fn check_description(description: &Option<String>) -> Result<(), EngineError> {
    if let Some(d) = description
        && d.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    Ok(())
}

fn clean_profile(mut profile: MemberProfile) -> Result<MemberProfile, EngineError> {
    profile.national_id = normalize_national_id(&profile.national_id);
    if profile.national_id.is_empty() {
        return Err(EngineError::InvalidInput("national id must not be empty".into()));
    }
    if profile.national_id.len() > MAX_NATIONAL_ID_LEN {
        return Err(EngineError::LimitExceeded("national id too long"));
    }
    check_name(&profile.first_name, "first name")?;
    check_name(&profile.last_name, "last name")?;
    if let Some(second) = &profile.second_last_name {
        check_name(second, "second last name")?;
    }
    profile.email = profile.email.trim().to_string();
    if profile.email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match profile.email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => {}
        _ => {
            return Err(EngineError::InvalidInput(format!(
                "malformed email: {}",
                profile.email
            )));
        }
    }
    if let Some(weight) = profile.fitness.weight_grams
        && !(1..=MAX_WEIGHT_GRAMS).contains(&weight)
    {
        return Err(EngineError::InvalidInput(format!("weight out of range: {weight} g")));
    }
    if let Some(height) = profile.fitness.height_cm
        && !(MIN_HEIGHT_CM..=MAX_HEIGHT_CM).contains(&height)
    {
        return Err(EngineError::InvalidInput(format!("height out of range: {height} cm")));
    }
    Ok(profile)
}

fn check_plan(plan: &Plan) -> Result<(), EngineError> {
    check_name(&plan.name, "plan name")?;
    check_description(&plan.description)?;
    if plan.duration_days == 0 {
        return Err(EngineError::InvalidInput("plan duration must be at least one day".into()));
    }
    if plan.duration_days > MAX_PLAN_DURATION_DAYS {
        return Err(EngineError::LimitExceeded("plan duration too long"));
    }
    if plan.price < 0 {
        return Err(EngineError::InvalidInput("plan price must not be negative".into()));
    }
    Ok(())
}

impl Engine {
    // ── Members ──────────────────────────────────────────────────

    /// Caller must hold `registry`.
    fn check_member_unique(&self, profile: &MemberProfile, this: Ulid) -> Result<(), EngineError> {
        if let Some(owner) = self.national_ids.get(&profile.national_id)
            && *owner != this
        {
            return Err(EngineError::AlreadyExists(format!(
                "member with national id {}",
                profile.national_id
            )));
        }
        if let Some(owner) = self.emails.get(&profile.email.to_lowercase())
            && *owner != this
        {
            return Err(EngineError::AlreadyExists(format!(
                "member with email {}",
                profile.email
            )));
        }
        Ok(())
    }

    /// Caller must hold `registry`.
    fn check_assigned_instructor(&self, fitness: &Fitness) -> Result<(), EngineError> {
        let Some(instructor_id) = fitness.instructor_id else {
            return Ok(());
        };
        match self.users.get(&instructor_id) {
            Some(user) if user.role == Role::Instructor => Ok(()),
            Some(_) => Err(EngineError::InvalidInput(format!(
                "user {instructor_id} is not an instructor"
            ))),
            None => Err(EngineError::NotFound(instructor_id)),
        }
    }

    pub async fn register_member(
        &self,
        id: Ulid,
        profile: MemberProfile,
    ) -> Result<Member, EngineError> {
        let profile = clean_profile(profile)?;
        let _registry = self.registry.lock().await;
        if self.members.len() >= MAX_MEMBERS {
            return Err(EngineError::LimitExceeded("too many members"));
        }
        if self.members.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("member {id}")));
        }
        self.check_member_unique(&profile, id)?;
        self.check_assigned_instructor(&profile.fitness)?;

        let member = Member {
            id,
            profile,
            active: true,
            registered_at: now_ms(),
        };
        self.persist_registry(&Event::MemberRegistered {
            member: member.clone(),
        })
        .await?;
        info!("registered member {id}");
        Ok(member)
    }

    pub async fn update_member(
        &self,
        id: Ulid,
        profile: MemberProfile,
    ) -> Result<Member, EngineError> {
        let profile = clean_profile(profile)?;
        let _registry = self.registry.lock().await;
        let ms = self.get_member_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ms.write().await;
        if !self.members.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        self.check_member_unique(&profile, id)?;
        self.check_assigned_instructor(&profile.fitness)?;

        let event = Event::MemberUpdated { id, profile };
        self.persist_and_apply_member(&mut guard, &event).await?;
        Ok(guard.member.clone())
    }

    pub async fn set_member_active(&self, id: Ulid, active: bool) -> Result<Member, EngineError> {
        let ms = self.get_member_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ms.write().await;
        if !self.members.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.member.active != active {
            let event = Event::MemberStatusChanged { id, active };
            self.persist_and_apply_member(&mut guard, &event).await?;
        }
        Ok(guard.member.clone())
    }

    /// Remove a member together with their bookings, enrollments, payments,
    /// routines and login users, committed as a single record.
    ///
    /// Holds `registry` so compaction cannot snapshot a half-deleted member, and
    /// the member's write lock so no booking or enrollment for them can commit
    /// mid-cascade.
    pub async fn delete_member(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let ms = self.get_member_state(&id).ok_or(EngineError::NotFound(id))?;
        let _member = ms.write().await;
        if !self.members.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }

        let mut cascade = MemberCascade::default();
        let mut court_guards = Vec::new();
        for court_id in Self::sorted_ids(&self.courts) {
            let Some(cs) = self.get_court_state(&court_id) else { continue };
            let guard = cs.write_owned().await;
            let mut owned: Vec<Ulid> = guard
                .bookings
                .values()
                .filter(|b| b.member_id == id)
                .map(|b| b.id)
                .collect();
            if owned.is_empty() {
                continue;
            }
            owned.sort();
            cascade
                .bookings
                .extend(owned.into_iter().map(|booking_id| (court_id, booking_id)));
            court_guards.push(guard);
        }

        let mut class_guards = Vec::new();
        for class_id in Self::sorted_ids(&self.classes) {
            let Some(cs) = self.get_class_state(&class_id) else { continue };
            let guard = cs.write_owned().await;
            if !self.classes.contains_key(&class_id) {
                continue;
            }
            let Some(enrollment_id) = guard.enrollments.get(&id).map(|e| e.id) else {
                continue;
            };
            cascade.enrollments.push((class_id, enrollment_id));
            class_guards.push(guard);
        }

        cascade.logins = self
            .users
            .iter()
            .filter(|u| u.member_id == Some(id))
            .map(|u| u.id)
            .collect();
        cascade.logins.sort();

        let event = Event::MemberDeleted { id, cascade };
        self.wal_append(&event).await?;
        for guard in &mut court_guards {
            apply_to_court(guard, &event);
        }
        for guard in &mut class_guards {
            apply_to_class(guard, &event);
        }
        self.publish(&event);
        info!("deleted member {id}");
        Ok(())
    }

    // ── Plans ────────────────────────────────────────────────────

    /// Caller must hold `registry`.
    fn check_plan_name_free(&self, name: &str, this: Ulid) -> Result<(), EngineError> {
        let taken = self
            .plans
            .iter()
            .any(|p| p.id != this && p.name.eq_ignore_ascii_case(name.trim()));
        if taken {
            return Err(EngineError::AlreadyExists(format!("plan named {name}")));
        }
        Ok(())
    }

    pub async fn create_plan(&self, plan: Plan) -> Result<Plan, EngineError> {
        check_plan(&plan)?;
        let _registry = self.registry.lock().await;
        if self.plans.len() >= MAX_PLANS {
            return Err(EngineError::LimitExceeded("too many plans"));
        }
        if self.plans.contains_key(&plan.id) {
            return Err(EngineError::AlreadyExists(format!("plan {}", plan.id)));
        }
        self.check_plan_name_free(&plan.name, plan.id)?;
        self.persist_registry(&Event::PlanCreated { plan: plan.clone() })
            .await?;
        Ok(plan)
    }

    /// Edits apply to existing assignments too: entitlement reads the plan's
    /// current flags.
    pub async fn update_plan(&self, plan: Plan) -> Result<Plan, EngineError> {
        check_plan(&plan)?;
        let _registry = self.registry.lock().await;
        if !self.plans.contains_key(&plan.id) {
            return Err(EngineError::NotFound(plan.id));
        }
        self.check_plan_name_free(&plan.name, plan.id)?;
        self.persist_registry(&Event::PlanUpdated { plan: plan.clone() })
            .await?;
        Ok(plan)
    }

    pub async fn delete_plan(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        if !self.plans.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        for member_id in Self::sorted_ids(&self.members) {
            let Some(ms) = self.get_member_state(&member_id) else { continue };
            let guard = ms.read().await;
            if guard.subscriptions.iter().any(|s| s.plan_id == id)
                || guard.payments.values().any(|p| p.plan_id == id)
            {
                return Err(EngineError::InUse(id));
            }
        }
        self.persist_registry(&Event::PlanDeleted { id }).await
    }

    // ── Subscriptions ────────────────────────────────────────────

    /// Give a member a plan starting `start_date`. Every other active
    /// assignment of the member is deactivated in the same record.
    pub async fn assign_plan(
        &self,
        member_id: Ulid,
        plan_id: Ulid,
        start_date: NaiveDate,
        amount_paid: i64,
    ) -> Result<Subscription, EngineError> {
        if amount_paid < 0 {
            return Err(EngineError::InvalidInput("amount paid must not be negative".into()));
        }
        // Keeps the plan alive until the assignment is committed.
        let _registry = self.registry.lock().await;
        let duration_days = self
            .plans
            .get(&plan_id)
            .map(|p| p.duration_days)
            .ok_or(EngineError::NotFound(plan_id))?;
        let end_date = start_date
            .checked_add_days(Days::new(u64::from(duration_days)))
            .ok_or_else(|| EngineError::InvalidInput(format!("{start_date} is out of range")))?;

        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let mut guard = ms.write().await;
        if !self.members.contains_key(&member_id) {
            return Err(EngineError::NotFound(member_id));
        }
        if guard.subscriptions.len() >= MAX_SUBSCRIPTIONS_PER_MEMBER {
            return Err(EngineError::LimitExceeded("too many plan assignments"));
        }

        let subscription = Subscription {
            id: Ulid::new(),
            member_id,
            plan_id,
            start_date,
            end_date,
            amount_paid,
            active: true,
        };
        let deactivated = guard
            .subscriptions
            .iter()
            .filter(|s| s.active)
            .map(|s| s.id)
            .collect();
        let event = Event::SubscriptionAssigned {
            subscription: subscription.clone(),
            deactivated,
        };
        self.persist_and_apply_member(&mut guard, &event).await?;
        info!("assigned plan {plan_id} to member {member_id} until {end_date}");
        Ok(subscription)
    }

    pub async fn deactivate_subscription(&self, id: Ulid) -> Result<Subscription, EngineError> {
        let member_id = self
            .subscription_to_member
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ms.write().await;
        let sub = guard
            .subscriptions
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        if !sub.active {
            return Ok(sub);
        }
        let event = Event::SubscriptionDeactivated { id, member_id };
        self.persist_and_apply_member(&mut guard, &event).await?;
        Ok(Subscription {
            active: false,
            ..sub
        })
    }

    /// Deactivate every active assignment that ended before `today`.
    pub async fn expire_subscriptions(&self, today: NaiveDate) -> Result<usize, EngineError> {
        let mut expired = 0;
        for member_id in Self::sorted_ids(&self.members) {
            let Some(ms) = self.get_member_state(&member_id) else { continue };
            let mut guard = ms.write().await;
            let lapsed: Vec<Ulid> = guard
                .subscriptions
                .iter()
                .filter(|s| s.active && s.end_date < today)
                .map(|s| s.id)
                .collect();
            for id in lapsed {
                let event = Event::SubscriptionDeactivated { id, member_id };
                self.persist_and_apply_member(&mut guard, &event).await?;
                expired += 1;
            }
        }
        if expired > 0 {
            metrics::counter!(crate::observability::SUBSCRIPTIONS_EXPIRED_TOTAL)
                .increment(expired as u64);
        }
        Ok(expired)
    }

    // ── Users ────────────────────────────────────────────────────

    pub async fn register_user(&self, mut user: User) -> Result<User, EngineError> {
        user.national_id = normalize_national_id(&user.national_id);
        if user.national_id.is_empty() {
            return Err(EngineError::InvalidInput("national id must not be empty".into()));
        }
        if user.national_id.len() > MAX_NATIONAL_ID_LEN {
            return Err(EngineError::LimitExceeded("national id too long"));
        }
        check_name(&user.name, "user name")?;
        match (user.role, user.member_id) {
            (Role::Member, None) => {
                return Err(EngineError::InvalidInput(
                    "member logins must link a member record".into(),
                ));
            }
            (Role::Member, Some(member_id)) => {
                if !self.members.contains_key(&member_id) {
                    return Err(EngineError::NotFound(member_id));
                }
            }
            (_, Some(_)) => {
                return Err(EngineError::InvalidInput(
                    "only member logins link a member record".into(),
                ));
            }
            (_, None) => {}
        }

        let _registry = self.registry.lock().await;
        if self.users.len() >= MAX_USERS {
            return Err(EngineError::LimitExceeded("too many users"));
        }
        if self.users.contains_key(&user.id) {
            return Err(EngineError::AlreadyExists(format!("user {}", user.id)));
        }
        if self.users.iter().any(|u| u.national_id == user.national_id) {
            return Err(EngineError::AlreadyExists(format!(
                "user with national id {}",
                user.national_id
            )));
        }
        self.persist_registry(&Event::UserRegistered { user: user.clone() })
            .await?;
        info!("registered {:?} user {}", user.role, user.id);
        Ok(user)
    }

    /// Instructors still owning classes, coaching members or credited with a
    /// routine cannot be removed.
    pub async fn delete_user(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        if !self.users.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if self.coaches_anyone(id).await {
            return Err(EngineError::InUse(id));
        }
        // Held so no class can be scheduled for this instructor mid-check.
        let schedule = self.get_schedule(&id);
        let _schedule = match &schedule {
            Some(s) => Some(s.write().await),
            None => None,
        };
        if schedule.is_some() && self.classes_of_instructor(id).await > 0 {
            return Err(EngineError::InUse(id));
        }
        self.persist_registry(&Event::UserDeleted { id }).await
    }

    /// Whether a member is assigned to `instructor_id` or holds one of their routines.
    async fn coaches_anyone(&self, instructor_id: Ulid) -> bool {
        for member_id in Self::sorted_ids(&self.members) {
            let Some(ms) = self.get_member_state(&member_id) else { continue };
            let guard = ms.read().await;
            if guard.member.profile.fitness.instructor_id == Some(instructor_id)
                || guard.routines.values().any(|r| r.instructor_id == instructor_id)
            {
                return true;
            }
        }
        false
    }

    /// Classes, active or not, taught by `instructor_id`.
    async fn classes_of_instructor(&self, instructor_id: Ulid) -> usize {
        let mut count = 0;
        for class_id in Self::sorted_ids(&self.classes) {
            let Some(cs) = self.get_class_state(&class_id) else { continue };
            if cs.read().await.class.instructor_id == instructor_id {
                count += 1;
            }
        }
        count
    }

    // ── Courts ───────────────────────────────────────────────────

    /// Caller must hold `registry`.
    async fn check_court_name_free(&self, name: &str, this: Ulid) -> Result<(), EngineError> {
        for court_id in Self::sorted_ids(&self.courts) {
            if court_id == this {
                continue;
            }
            let Some(cs) = self.get_court_state(&court_id) else { continue };
            if cs.read().await.court.name.eq_ignore_ascii_case(name.trim()) {
                return Err(EngineError::AlreadyExists(format!("court named {name}")));
            }
        }
        Ok(())
    }

    pub async fn create_court(
        &self,
        id: Ulid,
        name: String,
        kind: CourtKind,
    ) -> Result<Court, EngineError> {
        check_name(&name, "court name")?;
        let _registry = self.registry.lock().await;
        if self.courts.len() >= MAX_COURTS {
            return Err(EngineError::LimitExceeded("too many courts"));
        }
        if self.courts.contains_key(&id) {
            return Err(EngineError::AlreadyExists(format!("court {id}")));
        }
        self.check_court_name_free(&name, id).await?;

        let court = Court {
            id,
            name,
            kind,
            active: true,
        };
        self.persist_registry(&Event::CourtCreated {
            court: court.clone(),
        })
        .await?;
        Ok(court)
    }

    pub async fn update_court(
        &self,
        id: Ulid,
        name: String,
        kind: CourtKind,
    ) -> Result<Court, EngineError> {
        check_name(&name, "court name")?;
        let _registry = self.registry.lock().await;
        let cs = self.get_court_state(&id).ok_or(EngineError::NotFound(id))?;
        self.check_court_name_free(&name, id).await?;
        let mut guard = cs.write().await;
        let court = Court {
            name,
            kind,
            ..guard.court.clone()
        };
        let event = Event::CourtUpdated { court };
        self.persist_and_apply_court(&mut guard, &event).await?;
        Ok(guard.court.clone())
    }

    /// Inactive courts keep their bookings but accept no new ones.
    pub async fn set_court_active(&self, id: Ulid, active: bool) -> Result<Court, EngineError> {
        let cs = self.get_court_state(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = cs.write().await;
        if !self.courts.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        if guard.court.active != active {
            let court = Court {
                active,
                ..guard.court.clone()
            };
            let event = Event::CourtUpdated { court };
            self.persist_and_apply_court(&mut guard, &event).await?;
        }
        Ok(guard.court.clone())
    }

    /// Remove a court together with every booking on it.
    pub async fn delete_court(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let cs = self.get_court_state(&id).ok_or(EngineError::NotFound(id))?;
        let _guard = cs.write().await;
        self.persist_registry(&Event::CourtDeleted { id }).await?;
        info!("deleted court {id}");
        Ok(())
    }
}
