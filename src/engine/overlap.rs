use ulid::Ulid;

use crate::model::*;

/// True iff `proposed` intersects any candidate, half-open.
pub fn is_overlapping(candidates: &[Span], proposed: &Span) -> bool {
    candidates.iter().any(|c| c.overlaps(proposed))
}

/// First candidate blocking `proposed`, by id, for error reporting.
pub fn first_conflict<'a>(
    candidates: impl IntoIterator<Item = (Ulid, &'a Span)>,
    proposed: &Span,
) -> Option<Ulid> {
    candidates
        .into_iter()
        .find(|(_, span)| span.overlaps(proposed))
        .map(|(id, _)| id)
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;

    /// Start strictly inside, end strictly inside, or candidate contained
    /// in proposed (inclusive bounds).
    fn three_branch(candidate: &Span, proposed: &Span) -> bool {
        (candidate.start < proposed.start && proposed.start < candidate.end)
            || (candidate.start < proposed.end && proposed.end < candidate.end)
            || (proposed.start <= candidate.start && candidate.end <= proposed.end)
    }

    #[test]
    fn no_candidates_never_overlaps() {
        assert!(!is_overlapping(&[], &Span::new(10 * H, 11 * H)));
    }

    #[test]
    fn touching_endpoints_do_not_overlap() {
        let existing = [Span::new(10 * H, 11 * H)];
        assert!(!is_overlapping(&existing, &Span::new(11 * H, 12 * H)));
        assert!(!is_overlapping(&existing, &Span::new(9 * H, 10 * H)));
    }

    #[test]
    fn identical_overlaps() {
        let existing = [Span::new(10 * H, 11 * H)];
        assert!(is_overlapping(&existing, &Span::new(10 * H, 11 * H)));
    }

    #[test]
    fn containment_both_directions() {
        // new contains existing
        assert!(is_overlapping(&[Span::new(10 * H, 11 * H)], &Span::new(9 * H, 17 * H)));
        // existing contains new
        assert!(is_overlapping(&[Span::new(9 * H, 17 * H)], &Span::new(10 * H, 11 * H)));
    }

    #[test]
    fn partial_left_and_right() {
        let existing = [Span::new(10 * H, 12 * H)];
        assert!(is_overlapping(&existing, &Span::new(9 * H, 11 * H)));
        assert!(is_overlapping(&existing, &Span::new(11 * H, 13 * H)));
    }

    #[test]
    fn symmetric_and_matches_three_branch_on_grid() {
        let mut spans = Vec::new();
        for s in 0..8 {
            for e in (s + 1)..=8 {
                spans.push(Span::new(s, e));
            }
        }
        for a in &spans {
            for b in &spans {
                let ab = is_overlapping(&[*b], a);
                let ba = is_overlapping(&[*a], b);
                assert_eq!(ab, ba, "asymmetric for {a} vs {b}");
                assert_eq!(ab, three_branch(b, a), "disagrees with three-branch for {a} vs {b}");
            }
        }
    }

    #[test]
    fn first_conflict_reports_blocking_id() {
        let free = (Ulid::new(), Span::new(0, 10));
        let busy = (Ulid::new(), Span::new(20, 30));
        let proposed = Span::new(25, 35);
        let found = first_conflict([(free.0, &free.1), (busy.0, &busy.1)], &proposed);
        assert_eq!(found, Some(busy.0));
        assert_eq!(first_conflict([(free.0, &free.1)], &proposed), None);
    }
}
