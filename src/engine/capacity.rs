use crate::model::ClassState;

use super::EngineError;

/// A class admits another enrollment while fewer than `capacity` are enrolled.
/// Cancelled enrollments do not hold a seat.
pub(crate) fn has_seat(cs: &ClassState) -> bool {
    cs.enrolled_count() < cs.class.capacity
}

pub(crate) fn check_capacity(cs: &ClassState) -> Result<(), EngineError> {
    if !has_seat(cs) {
        return Err(EngineError::CapacityExceeded {
            class: cs.class.id,
            capacity: cs.class.capacity,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::{NaiveDate, NaiveTime};
    use ulid::Ulid;

    fn class_state(capacity: u32) -> ClassState {
        ClassState::new(Class {
            id: Ulid::new(),
            name: "Yoga".into(),
            description: None,
            instructor_id: Ulid::new(),
            date: NaiveDate::from_ymd_opt(2024, 6, 1).unwrap(),
            range: TimeRange::new(
                NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
                NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            ),
            capacity,
            active: true,
        })
    }

    fn enroll(cs: &mut ClassState, status: EnrollmentStatus) {
        let member_id = Ulid::new();
        cs.enrollments.insert(
            member_id,
            Enrollment {
                id: Ulid::new(),
                member_id,
                class_id: cs.class.id,
                status,
                attendance: Attendance::Pending,
                registered_at: 0,
            },
        );
    }

    #[test]
    fn fills_up_at_capacity() {
        let mut cs = class_state(2);
        assert!(has_seat(&cs));
        enroll(&mut cs, EnrollmentStatus::Enrolled);
        assert!(has_seat(&cs));
        enroll(&mut cs, EnrollmentStatus::Enrolled);
        assert!(!has_seat(&cs));
        assert!(matches!(
            check_capacity(&cs),
            Err(EngineError::CapacityExceeded { capacity: 2, .. })
        ));
    }

    #[test]
    fn cancelled_enrollments_free_their_seat() {
        let mut cs = class_state(1);
        enroll(&mut cs, EnrollmentStatus::Cancelled);
        enroll(&mut cs, EnrollmentStatus::Cancelled);
        assert!(check_capacity(&cs).is_ok());
        assert_eq!(cs.seats_left(), 1);
    }

    #[test]
    fn zero_capacity_never_admits() {
        assert!(!has_seat(&class_state(0)));
    }
}
