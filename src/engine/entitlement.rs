use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    /// Whether the member's entitling assignment grants `capability`.
    ///
    /// Looks only at the `active` flag, not the end date: lapsed assignments
    /// keep entitling until the expiry job deactivates them. A plan that no
    /// longer exists grants nothing.
    pub(super) fn is_entitled(&self, ms: &MemberState, capability: Capability) -> bool {
        ms.entitling_subscription().is_some_and(|sub| {
            self.plans
                .get(&sub.plan_id)
                .is_some_and(|plan| plan.grants(capability))
        })
    }

    pub(super) fn require_entitlement(
        &self,
        ms: &MemberState,
        capability: Capability,
    ) -> Result<(), EngineError> {
        // Deleted while the caller waited for the lock.
        if !self.members.contains_key(&ms.member.id) {
            return Err(EngineError::NotFound(ms.member.id));
        }
        if !ms.member.active {
            return Err(EngineError::Inactive(ms.member.id));
        }
        if !self.is_entitled(ms, capability) {
            metrics::counter!(crate::observability::ENTITLEMENT_DENIALS_TOTAL,
                "capability" => capability_label(capability))
            .increment(1);
            return Err(EngineError::EntitlementDenied {
                member: ms.member.id,
                capability,
            });
        }
        Ok(())
    }

    /// Resolve a member's entitlement. Unknown members are an error, not `false`.
    pub async fn resolve_entitlement(
        &self,
        member_id: Ulid,
        capability: Capability,
    ) -> Result<bool, EngineError> {
        let ms = self
            .get_member_state(&member_id)
            .ok_or(EngineError::NotFound(member_id))?;
        let guard = ms.read().await;
        Ok(self.is_entitled(&guard, capability))
    }
}

fn capability_label(capability: Capability) -> &'static str {
    match capability {
        Capability::CourtBooking => "court_booking",
        Capability::ClassEnrollment => "class_enrollment",
    }
}
