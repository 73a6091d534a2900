use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

/// Which schedule an overlap check runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ScheduleKey {
    /// Live bookings of a court.
    Court(Ulid),
    /// Active classes taught by an instructor.
    Instructor(Ulid),
}

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

pub(crate) fn validate_range(range: &TimeRange) -> Result<(), EngineError> {
    if !range.is_valid() {
        return Err(EngineError::InvalidInput(format!(
            "start {} must be before end {}",
            range.start, range.end
        )));
    }
    Ok(())
}

pub(crate) fn validate_date_span(from: NaiveDate, to: NaiveDate) -> Result<(), EngineError> {
    if from > to {
        return Err(EngineError::InvalidInput(format!("{from} is after {to}")));
    }
    if (to - from).num_days() >= crate::limits::MAX_RANGE_DAYS {
        return Err(EngineError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

/// First slot on `date` overlapping `range`, skipping the record being edited.
pub(crate) fn find_conflict(
    schedule: &Schedule,
    date: NaiveDate,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> Option<Ulid> {
    schedule
        .overlapping(date, range)
        .find(|slot| Some(slot.id) != exclude)
        .map(|slot| slot.id)
}

pub(crate) fn check_no_conflict(
    schedule: &Schedule,
    date: NaiveDate,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(schedule, date, range, exclude) {
        Some(id) => Err(EngineError::ScheduleConflict(id)),
        None => Ok(()),
    }
}

/// Secondary net behind the overlap check: one live booking per (court, date, start).
pub(crate) fn check_unique_start(
    cs: &CourtState,
    date: NaiveDate,
    range: &TimeRange,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if cs.start_taken(date, range.start, exclude) {
        return Err(EngineError::IntegrityViolation(format!(
            "court {} already has a booking starting {date} {}",
            cs.court.id, range.start
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    fn schedule_with(slots: &[(Ulid, TimeRange)]) -> Schedule {
        let mut s = Schedule::new();
        for &(id, range) in slots {
            s.insert(day(), Slot { id, range });
        }
        s
    }

    #[test]
    fn overlap_is_reported_with_the_blocking_id() {
        let existing = Ulid::new();
        let s = schedule_with(&[(existing, TimeRange::new(t(14, 0), t(15, 0)))]);
        let err = check_no_conflict(&s, day(), &TimeRange::new(t(14, 30), t(15, 30)), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::ScheduleConflict(id) if id == existing));
    }

    #[test]
    fn touching_windows_do_not_conflict() {
        let s = schedule_with(&[(Ulid::new(), TimeRange::new(t(14, 0), t(15, 0)))]);
        assert!(check_no_conflict(&s, day(), &TimeRange::new(t(15, 0), t(16, 0)), None).is_ok());
        assert!(check_no_conflict(&s, day(), &TimeRange::new(t(13, 0), t(14, 0)), None).is_ok());
    }

    #[test]
    fn excluded_record_is_ignored() {
        let own = Ulid::new();
        let s = schedule_with(&[(own, TimeRange::new(t(14, 0), t(15, 0)))]);
        let moved = TimeRange::new(t(14, 30), t(15, 30));
        assert!(check_no_conflict(&s, day(), &moved, Some(own)).is_ok());
        assert!(check_no_conflict(&s, day(), &moved, Some(Ulid::new())).is_err());
    }

    #[test]
    fn other_dates_do_not_conflict() {
        let s = schedule_with(&[(Ulid::new(), TimeRange::new(t(14, 0), t(15, 0)))]);
        let next = day().succ_opt().unwrap();
        assert!(check_no_conflict(&s, next, &TimeRange::new(t(14, 0), t(15, 0)), None).is_ok());
    }

    #[test]
    fn empty_or_inverted_range_is_invalid() {
        let r = TimeRange {
            start: t(15, 0),
            end: t(15, 0),
        };
        assert!(matches!(validate_range(&r), Err(EngineError::InvalidInput(_))));
        let r = TimeRange {
            start: t(16, 0),
            end: t(15, 0),
        };
        assert!(matches!(validate_range(&r), Err(EngineError::InvalidInput(_))));
    }

    #[test]
    fn date_span_limits() {
        let from = day();
        assert!(validate_date_span(from, from).is_ok());
        assert!(validate_date_span(from, from.pred_opt().unwrap()).is_err());
        let far = from + chrono::Days::new(400);
        assert!(matches!(
            validate_date_span(from, far),
            Err(EngineError::LimitExceeded(_))
        ));
    }
}
