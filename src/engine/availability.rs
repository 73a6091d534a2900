use crate::model::*;

// ── Free windows ─────────────────────────────────────────────────

/// Free windows inside `opening` once `busy` is taken out, dropping any window
/// shorter than `min_minutes`. `busy` need not be sorted or disjoint.
pub fn free_windows(opening: &TimeRange, busy: &[TimeRange], min_minutes: i64) -> Vec<TimeRange> {
    let mut busy: Vec<TimeRange> = busy
        .iter()
        .filter(|r| r.overlaps(opening))
        .copied()
        .collect();
    busy.sort_by_key(|r| r.start);
    let busy = merge_overlapping(&busy);

    subtract_ranges(&[*opening], &busy)
        .into_iter()
        .filter(|r| r.duration_minutes() >= min_minutes)
        .collect()
}

/// Merge sorted overlapping/adjacent windows into disjoint windows.
pub fn merge_overlapping(sorted: &[TimeRange]) -> Vec<TimeRange> {
    let mut merged: Vec<TimeRange> = Vec::new();
    for &range in sorted {
        if let Some(last) = merged.last_mut()
            && range.start <= last.end
        {
            last.end = last.end.max(range.end);
            continue;
        }
        merged.push(range);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start and disjoint.
pub fn subtract_ranges(base: &[TimeRange], to_remove: &[TimeRange]) -> Vec<TimeRange> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(TimeRange::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(TimeRange::new(cursor, b.end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn r(h1: u32, m1: u32, h2: u32, m2: u32) -> TimeRange {
        TimeRange::new(
            NaiveTime::from_hms_opt(h1, m1, 0).unwrap(),
            NaiveTime::from_hms_opt(h2, m2, 0).unwrap(),
        )
    }

    #[test]
    fn subtract_disjoint() {
        let base = vec![r(8, 0, 9, 0), r(10, 0, 11, 0)];
        assert_eq!(subtract_ranges(&base, &[r(9, 0, 10, 0)]), base);
    }

    #[test]
    fn subtract_covering() {
        assert!(subtract_ranges(&[r(9, 0, 10, 0)], &[r(8, 0, 11, 0)]).is_empty());
    }

    #[test]
    fn subtract_edges_and_middle() {
        let base = [r(8, 0, 20, 0)];
        let remove = [r(7, 0, 9, 0), r(12, 0, 13, 0), r(19, 0, 21, 0)];
        assert_eq!(
            subtract_ranges(&base, &remove),
            vec![r(9, 0, 12, 0), r(13, 0, 19, 0)]
        );
    }

    #[test]
    fn merge_overlapping_and_adjacent() {
        let sorted = [r(8, 0, 9, 0), r(9, 0, 10, 0), r(9, 30, 11, 0), r(12, 0, 13, 0)];
        assert_eq!(
            merge_overlapping(&sorted),
            vec![r(8, 0, 11, 0), r(12, 0, 13, 0)]
        );
    }

    #[test]
    fn free_windows_around_bookings() {
        let opening = r(8, 0, 22, 0);
        let busy = [r(18, 0, 19, 0), r(10, 0, 11, 30), r(11, 0, 12, 0)];
        assert_eq!(
            free_windows(&opening, &busy, 0),
            vec![r(8, 0, 10, 0), r(12, 0, 18, 0), r(19, 0, 22, 0)]
        );
    }

    #[test]
    fn free_windows_drops_short_gaps() {
        let opening = r(8, 0, 12, 0);
        let busy = [r(8, 30, 10, 0), r(10, 45, 12, 0)];
        assert_eq!(free_windows(&opening, &busy, 60), vec![]);
        assert_eq!(
            free_windows(&opening, &busy, 30),
            vec![r(8, 0, 8, 30), r(10, 0, 10, 45)]
        );
    }

    #[test]
    fn free_windows_ignores_bookings_outside_opening() {
        let opening = r(8, 0, 12, 0);
        let busy = [r(6, 0, 7, 0), r(13, 0, 14, 0)];
        assert_eq!(free_windows(&opening, &busy, 0), vec![opening]);
    }
}
