use tokio::sync::OwnedRwLockWriteGuard;
use tracing::info;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::PAYMENTS_RECORDED_TOTAL;

use super::{apply_to_member, Engine, EngineError};

fn check_payment(details: &PaymentDetails) -> Result<(), EngineError> {
    if details.amount <= 0 {
        return Err(EngineError::InvalidInput("payment amount must be positive".into()));
    }
    if let Some(notes) = &details.notes
        && notes.len() > MAX_DESCRIPTION_LEN
    {
        return Err(EngineError::LimitExceeded("payment notes too long"));
    }
    Ok(())
}

/// The member's active assignment of `plan_id` that runs longest.
fn linked_subscription(ms: &MemberState, plan_id: Ulid) -> Option<Ulid> {
    ms.subscriptions
        .iter()
        .filter(|s| s.active && s.plan_id == plan_id)
        .max_by_key(|s| s.end_date)
        .map(|s| s.id)
}

fn status_label(status: PaymentStatus) -> &'static str {
    match status {
        PaymentStatus::Pending => "pending",
        PaymentStatus::Completed => "completed",
        PaymentStatus::Failed => "failed",
    }
}

impl Engine {
    /// Record a payment by an active member towards a plan.
    ///
    /// Every payment mutation holds `registry`: payments point at plans, and a
    /// plan with payments on record cannot be deleted.
    pub async fn record_payment(
        &self,
        details: PaymentDetails,
        status: PaymentStatus,
    ) -> Result<Payment, EngineError> {
        check_payment(&details)?;
        let _registry = self.registry.lock().await;
        if !self.plans.contains_key(&details.plan_id) {
            return Err(EngineError::NotFound(details.plan_id));
        }
        let member_id = details.member_id;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let mut guard = ms.write().await;
        if !self.members.contains_key(&member_id) {
            return Err(EngineError::NotFound(member_id));
        }
        if !guard.member.active {
            return Err(EngineError::Inactive(member_id));
        }
        if guard.payments.len() >= MAX_PAYMENTS_PER_MEMBER {
            return Err(EngineError::LimitExceeded("too many payments"));
        }

        let payment = Payment {
            id: Ulid::new(),
            member_id,
            plan_id: details.plan_id,
            subscription_id: linked_subscription(&guard, details.plan_id),
            paid_on: details.paid_on,
            amount: details.amount,
            method: details.method,
            notes: details.notes,
            status,
        };
        let event = Event::PaymentSaved {
            payment: payment.clone(),
            moved_from: None,
        };
        self.persist_and_apply_member(&mut guard, &event).await?;
        metrics::counter!(PAYMENTS_RECORDED_TOTAL, "status" => status_label(status)).increment(1);
        info!("recorded payment {} of {} from member {member_id}", payment.id, payment.amount);
        Ok(payment)
    }

    /// Edit a payment, possibly moving it to another member. Status is kept.
    /// The assignment link is recomputed when the member or plan changes.
    pub async fn update_payment(
        &self,
        id: Ulid,
        details: PaymentDetails,
    ) -> Result<Payment, EngineError> {
        check_payment(&details)?;
        let _registry = self.registry.lock().await;
        let source = self.member_for_payment(&id).ok_or(EngineError::NotFound(id))?;
        if !self.plans.contains_key(&details.plan_id) {
            return Err(EngineError::NotFound(details.plan_id));
        }
        let target = details.member_id;
        let mut member_ids = vec![source];
        if target != source {
            member_ids.push(target);
        }
        member_ids.sort();

        let mut guards: Vec<OwnedRwLockWriteGuard<MemberState>> = Vec::with_capacity(2);
        for member_id in &member_ids {
            let ms = self
                .get_member_state(member_id)
                .ok_or(EngineError::NotFound(*member_id))?;
            guards.push(ms.write_owned().await);
        }

        let current = guards
            .iter()
            .find(|g| g.member.id == source)
            .and_then(|g| g.payments.get(&id))
            .cloned()
            .ok_or(EngineError::NotFound(id))?;
        let holder = guards
            .iter()
            .find(|g| g.member.id == target)
            .ok_or(EngineError::NotFound(target))?;
        if target != source {
            if !holder.member.active {
                return Err(EngineError::Inactive(target));
            }
            if holder.payments.len() >= MAX_PAYMENTS_PER_MEMBER {
                return Err(EngineError::LimitExceeded("too many payments"));
            }
        }
        let subscription_id = if target == source && details.plan_id == current.plan_id {
            current.subscription_id
        } else {
            linked_subscription(holder, details.plan_id)
        };

        let payment = Payment {
            id,
            member_id: target,
            plan_id: details.plan_id,
            subscription_id,
            paid_on: details.paid_on,
            amount: details.amount,
            method: details.method,
            notes: details.notes,
            status: current.status,
        };
        let event = Event::PaymentSaved {
            payment: payment.clone(),
            moved_from: (target != source).then_some(source),
        };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            apply_to_member(guard, &event);
        }
        self.publish(&event);
        Ok(payment)
    }

    /// Settle a pending payment as completed or failed. Settled payments are final.
    pub async fn set_payment_status(
        &self,
        id: Ulid,
        status: PaymentStatus,
    ) -> Result<Payment, EngineError> {
        let _registry = self.registry.lock().await;
        let member_id = self.member_for_payment(&id).ok_or(EngineError::NotFound(id))?;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ms.write().await;
        let current = guard.payments.get(&id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status == status {
            return Ok(current);
        }
        if current.status != PaymentStatus::Pending {
            return Err(EngineError::InvalidTransition("only pending payments change status"));
        }
        let payment = Payment { status, ..current };
        let event = Event::PaymentSaved {
            payment: payment.clone(),
            moved_from: None,
        };
        self.persist_and_apply_member(&mut guard, &event).await?;
        Ok(payment)
    }

    pub async fn delete_payment(&self, id: Ulid) -> Result<(), EngineError> {
        let _registry = self.registry.lock().await;
        let member_id = self.member_for_payment(&id).ok_or(EngineError::NotFound(id))?;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(id))?;
        let mut guard = ms.write().await;
        if !guard.payments.contains_key(&id) {
            return Err(EngineError::NotFound(id));
        }
        let event = Event::PaymentRemoved { id, member_id };
        self.persist_and_apply_member(&mut guard, &event).await?;
        info!("deleted payment {id}");
        Ok(())
    }

    pub async fn get_payment(&self, id: Ulid) -> Result<Payment, EngineError> {
        let member_id = self.member_for_payment(&id).ok_or(EngineError::NotFound(id))?;
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(id))?;
        let payment = ms.read().await.payments.get(&id).cloned();
        payment.ok_or(EngineError::NotFound(id))
    }

    /// A member's payments, most recent first.
    pub async fn payments_of(&self, member_id: Ulid) -> Result<Vec<Payment>, EngineError> {
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let mut payments: Vec<Payment> = ms.read().await.payments.values().cloned().collect();
        payments.sort_by(|a, b| (b.paid_on, b.id).cmp(&(a.paid_on, a.id)));
        Ok(payments)
    }

    /// Every payment on record with member and plan names, most recent first.
    pub async fn list_payments(&self) -> Vec<PaymentEntry> {
        let mut entries = Vec::new();
        for member_id in Self::sorted_ids(&self.members) {
            let Some(ms) = self.get_member_state(&member_id) else { continue };
            let guard = ms.read().await;
            let member_name = guard.member.profile.display_name();
            entries.extend(guard.payments.values().map(|payment| PaymentEntry {
                payment: payment.clone(),
                member_name: member_name.clone(),
                plan_name: self
                    .plans
                    .get(&payment.plan_id)
                    .map(|p| p.name.clone())
                    .unwrap_or_default(),
            }));
        }
        entries.sort_by(|a, b| {
            (b.payment.paid_on, b.payment.id).cmp(&(a.payment.paid_on, a.payment.id))
        });
        entries
    }
}
