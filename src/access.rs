use ulid::Ulid;

use crate::engine::EngineError;
use crate::model::{Role, User};

/// The authenticated user behind a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Actor {
    pub user_id: Ulid,
    pub role: Role,
    /// Set for member logins.
    pub member_id: Option<Ulid>,
}

impl From<&User> for Actor {
    fn from(user: &User) -> Self {
        Self {
            user_id: user.id,
            role: user.role,
            member_id: user.member_id,
        }
    }
}

impl Actor {
    fn is_staff(&self) -> bool {
        matches!(self.role, Role::SuperAdmin | Role::Admin)
    }

    fn is_member(&self, member_id: Ulid) -> bool {
        self.role == Role::Member && self.member_id == Some(member_id)
    }

    fn is_instructor(&self, instructor_id: Ulid) -> bool {
        self.role == Role::Instructor && self.user_id == instructor_id
    }

    /// Admins act for every instructor; instructors only for themselves.
    fn acts_for_instructor(&self, instructor_id: Ulid) -> bool {
        self.is_staff() || self.is_instructor(instructor_id)
    }
}

/// What a watched id turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget {
    /// Courts, classes, plans and routine templates: public schedule data.
    Public,
    Member(Ulid),
    Instructor(Ulid),
    /// Any other login.
    User,
}

/// What an actor is trying to do, with the ownership facts the decision needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ManageMembers,
    ViewMember { member_id: Ulid },
    ManagePlans,
    ViewPlans,
    ManageUsers { role: Role },
    ViewUsers,
    ManageCourts,
    ViewSchedules,
    Book { member_id: Ulid },
    ManageClass { instructor_id: Ulid },
    Enroll { member_id: Ulid, instructor_id: Ulid },
    ViewRoster { instructor_id: Ulid },
    ManagePayments,
    ManageRoutineTemplates,
    /// Generate, toggle or delete a routine credited to `instructor_id`.
    ManageRoutine { instructor_id: Ulid },
    ViewRoutines {
        member_id: Ulid,
        /// The member's assigned instructor, if any.
        coach: Option<Ulid>,
    },
    ViewStudents { instructor_id: Ulid },
    Watch(WatchTarget),
}

pub fn authorize(actor: &Actor, action: &Action) -> Result<(), EngineError> {
    let allowed = match *action {
        Action::ManageMembers
        | Action::ManagePlans
        | Action::ManageCourts
        | Action::ViewUsers
        | Action::ManagePayments
        | Action::Watch(WatchTarget::User) => actor.is_staff(),
        Action::ViewMember { member_id } | Action::Watch(WatchTarget::Member(member_id)) => {
            actor.is_staff() || actor.is_member(member_id)
        }
        Action::ViewPlans | Action::ViewSchedules | Action::Watch(WatchTarget::Public) => true,
        Action::ManageUsers { role } => match role {
            Role::SuperAdmin | Role::Admin => actor.role == Role::SuperAdmin,
            Role::Instructor | Role::Member => actor.is_staff(),
        },
        Action::Book { member_id } => actor.is_staff() || actor.is_member(member_id),
        Action::ManageClass { instructor_id }
        | Action::ViewRoster { instructor_id }
        | Action::ManageRoutine { instructor_id }
        | Action::ViewStudents { instructor_id }
        | Action::Watch(WatchTarget::Instructor(instructor_id)) => {
            actor.acts_for_instructor(instructor_id)
        }
        Action::Enroll {
            member_id,
            instructor_id,
        } => actor.is_member(member_id) || actor.acts_for_instructor(instructor_id),
        Action::ManageRoutineTemplates => actor.is_staff() || actor.role == Role::Instructor,
        Action::ViewRoutines { member_id, coach } => {
            actor.is_staff()
                || actor.is_member(member_id)
                || coach.is_some_and(|id| actor.is_instructor(id))
        }
    };
    if allowed {
        Ok(())
    } else {
        Err(EngineError::Forbidden(denial(action)))
    }
}

fn denial(action: &Action) -> &'static str {
    match action {
        Action::ManageMembers => "managing members requires an admin",
        Action::ViewMember { .. } => "members may only view their own record",
        Action::ManagePlans => "managing plans requires an admin",
        Action::ViewPlans | Action::ViewSchedules | Action::Watch(WatchTarget::Public) => {
            "not allowed"
        }
        Action::Watch(WatchTarget::Member(_)) => "members may only watch their own record",
        Action::Watch(WatchTarget::Instructor(_)) => {
            "only admins or the instructor may watch an instructor"
        }
        Action::Watch(WatchTarget::User) => "watching users requires an admin",
        Action::ManageUsers { .. } => "not allowed to manage users of that role",
        Action::ViewUsers => "listing users requires an admin",
        Action::ManageCourts => "managing courts requires an admin",
        Action::Book { .. } => "members may only book for themselves",
        Action::ManageClass { .. } => "only admins or the class instructor may manage it",
        Action::Enroll { .. } => "members may only enroll themselves",
        Action::ViewRoster { .. } => "only admins or the class instructor may view the roster",
        Action::ManagePayments => "managing payments requires an admin",
        Action::ManageRoutineTemplates => "routine templates are for instructors and admins",
        Action::ManageRoutine { .. } => "only admins or the instructor may manage that routine",
        Action::ViewRoutines { .. } => {
            "routines are visible to the member, their instructor and admins"
        }
        Action::ViewStudents { .. } => "instructors may only list their own students",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn actor(role: Role) -> Actor {
        Actor {
            user_id: Ulid::new(),
            role,
            member_id: (role == Role::Member).then(Ulid::new),
        }
    }

    #[test]
    fn staff_manage_everything_structural() {
        for role in [Role::SuperAdmin, Role::Admin] {
            let a = actor(role);
            for action in [
                Action::ManageMembers,
                Action::ManagePlans,
                Action::ManageCourts,
                Action::ViewUsers,
            ] {
                assert!(authorize(&a, &action).is_ok(), "{role:?} {action:?}");
            }
        }
        for role in [Role::Instructor, Role::Member] {
            let a = actor(role);
            for action in [
                Action::ManageMembers,
                Action::ManagePlans,
                Action::ManageCourts,
                Action::ViewUsers,
            ] {
                assert!(
                    matches!(authorize(&a, &action), Err(EngineError::Forbidden(_))),
                    "{role:?} {action:?}"
                );
            }
        }
    }

    #[test]
    fn only_superadmin_creates_admins() {
        let admin_role = Action::ManageUsers { role: Role::Admin };
        let instructor_role = Action::ManageUsers {
            role: Role::Instructor,
        };
        assert!(authorize(&actor(Role::SuperAdmin), &admin_role).is_ok());
        assert!(authorize(&actor(Role::Admin), &admin_role).is_err());
        assert!(authorize(&actor(Role::Admin), &instructor_role).is_ok());
        assert!(authorize(&actor(Role::Instructor), &instructor_role).is_err());
    }

    #[test]
    fn members_act_only_for_themselves() {
        let me = actor(Role::Member);
        let mine = me.member_id.unwrap();
        let theirs = Ulid::new();
        assert!(authorize(&me, &Action::Book { member_id: mine }).is_ok());
        assert!(authorize(&me, &Action::Book { member_id: theirs }).is_err());
        assert!(authorize(&me, &Action::ViewMember { member_id: mine }).is_ok());
        assert!(authorize(&me, &Action::ViewMember { member_id: theirs }).is_err());

        let instructor_id = Ulid::new();
        assert!(authorize(&me, &Action::Enroll { member_id: mine, instructor_id }).is_ok());
        assert!(authorize(&me, &Action::Enroll { member_id: theirs, instructor_id }).is_err());
        assert!(authorize(&me, &Action::ManageClass { instructor_id }).is_err());
    }

    #[test]
    fn instructors_manage_only_their_classes() {
        let coach = actor(Role::Instructor);
        let own = Action::ManageClass {
            instructor_id: coach.user_id,
        };
        let other = Action::ManageClass {
            instructor_id: Ulid::new(),
        };
        assert!(authorize(&coach, &own).is_ok());
        assert!(authorize(&coach, &other).is_err());
        assert!(authorize(&coach, &Action::ViewRoster { instructor_id: coach.user_id }).is_ok());
        assert!(authorize(&coach, &Action::Book { member_id: Ulid::new() }).is_err());
        assert!(authorize(&actor(Role::Admin), &other).is_ok());
    }

    #[test]
    fn everyone_reads_schedules() {
        for role in [Role::SuperAdmin, Role::Admin, Role::Instructor, Role::Member] {
            assert!(authorize(&actor(role), &Action::ViewSchedules).is_ok());
            assert!(authorize(&actor(role), &Action::ViewPlans).is_ok());
            assert!(authorize(&actor(role), &Action::Watch(WatchTarget::Public)).is_ok());
        }
    }

    #[test]
    fn watching_private_records_follows_view_rules() {
        let me = actor(Role::Member);
        let mine = me.member_id.unwrap();
        let coach = actor(Role::Instructor);

        assert!(authorize(&me, &Action::Watch(WatchTarget::Member(mine))).is_ok());
        assert!(matches!(
            authorize(&me, &Action::Watch(WatchTarget::Member(Ulid::new()))),
            Err(EngineError::Forbidden(_))
        ));
        assert!(authorize(&me, &Action::Watch(WatchTarget::Instructor(coach.user_id))).is_err());
        assert!(authorize(&me, &Action::Watch(WatchTarget::User)).is_err());

        assert!(authorize(&coach, &Action::Watch(WatchTarget::Instructor(coach.user_id))).is_ok());
        assert!(authorize(&coach, &Action::Watch(WatchTarget::Member(mine))).is_err());

        let admin = actor(Role::Admin);
        assert!(authorize(&admin, &Action::Watch(WatchTarget::Member(mine))).is_ok());
        assert!(authorize(&admin, &Action::Watch(WatchTarget::User)).is_ok());
    }

    #[test]
    fn payments_are_staff_only() {
        assert!(authorize(&actor(Role::Admin), &Action::ManagePayments).is_ok());
        assert!(authorize(&actor(Role::Instructor), &Action::ManagePayments).is_err());
        assert!(authorize(&actor(Role::Member), &Action::ManagePayments).is_err());
    }

    #[test]
    fn routines_belong_to_member_and_coach() {
        let me = actor(Role::Member);
        let mine = me.member_id.unwrap();
        let coach = actor(Role::Instructor);
        let other_coach = actor(Role::Instructor);
        let view = Action::ViewRoutines {
            member_id: mine,
            coach: Some(coach.user_id),
        };

        assert!(authorize(&me, &view).is_ok());
        assert!(authorize(&coach, &view).is_ok());
        assert!(authorize(&other_coach, &view).is_err());
        assert!(authorize(&actor(Role::Admin), &view).is_ok());

        let manage = Action::ManageRoutine {
            instructor_id: coach.user_id,
        };
        assert!(authorize(&coach, &manage).is_ok());
        assert!(authorize(&other_coach, &manage).is_err());
        assert!(authorize(&me, &manage).is_err());

        assert!(authorize(&coach, &Action::ManageRoutineTemplates).is_ok());
        assert!(authorize(&me, &Action::ManageRoutineTemplates).is_err());
        assert!(authorize(&coach, &Action::ViewStudents { instructor_id: other_coach.user_id }).is_err());
    }
}
