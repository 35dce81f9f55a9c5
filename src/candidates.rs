//! Candidate resolution for a new phase: which drafts may the reasoning
//! step reference?

use std::collections::BTreeMap;

use crate::models::{ContentDraft, Phase, Provenance};

/// A draft eligible for the next phase, tagged with where it came from.
#[derive(Debug, Clone)]
pub struct CandidateDraft {
    pub draft: ContentDraft,
    pub provenance: Provenance,
}

/// Merge unassigned drafts with drafts attached to the strategy's prior
/// phases into one deduplicated set keyed by draft id.
///
/// Processing order is fixed: unassigned first, then phases oldest to
/// newest, last insert wins. A draft that shows up both unassigned and in a
/// prior phase is therefore tagged `prior_phase` — a previously attached
/// item is never truly unassigned.
pub fn resolve(
    unassigned: &[ContentDraft],
    phases: &[(Phase, Vec<ContentDraft>)],
) -> BTreeMap<String, CandidateDraft> {
    let mut candidates = BTreeMap::new();

    for draft in unassigned {
        candidates.insert(
            draft.id.clone(),
            CandidateDraft {
                draft: draft.clone(),
                provenance: Provenance::Unassigned,
            },
        );
    }

    for (_phase, drafts) in phases {
        for draft in drafts {
            candidates.insert(
                draft.id.clone(),
                CandidateDraft {
                    draft: draft.clone(),
                    provenance: Provenance::PriorPhase,
                },
            );
        }
    }

    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cadence, DraftStatus, PhaseStatus};
    use chrono::Utc;

    fn draft(id: &str, slug: &str) -> ContentDraft {
        ContentDraft {
            id: id.to_string(),
            project_id: "proj-1".to_string(),
            slug: slug.to_string(),
            title: slug.replace('-', " "),
            description: String::new(),
            primary_keyword: slug.replace('-', " "),
            status: DraftStatus::Published,
            role: None,
            strategy_id: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn phase(id: &str) -> Phase {
        Phase {
            id: id.to_string(),
            strategy_id: "strat-1".to_string(),
            phase_type: "growth".to_string(),
            name: format!("Phase {}", id),
            observation_weeks: 4,
            success_criteria: String::new(),
            cadence: Cadence::Weekly,
            status: PhaseStatus::Completed,
            started_at: None,
            target_completion: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_unassigned_only() {
        let result = resolve(&[draft("d-1", "a"), draft("d-2", "b")], &[]);
        assert_eq!(result.len(), 2);
        assert_eq!(result["d-1"].provenance, Provenance::Unassigned);
    }

    #[test]
    fn test_prior_phase_only() {
        let result = resolve(&[], &[(phase("p-1"), vec![draft("d-1", "a")])]);
        assert_eq!(result.len(), 1);
        assert_eq!(result["d-1"].provenance, Provenance::PriorPhase);
    }

    #[test]
    fn test_prior_phase_overrides_unassigned() {
        let result = resolve(
            &[draft("d-1", "a"), draft("d-2", "b")],
            &[(phase("p-1"), vec![draft("d-1", "a")])],
        );
        assert_eq!(result.len(), 2);
        assert_eq!(result["d-1"].provenance, Provenance::PriorPhase);
        assert_eq!(result["d-2"].provenance, Provenance::Unassigned);
    }

    #[test]
    fn test_duplicate_across_phases_deduplicates() {
        let result = resolve(
            &[],
            &[
                (phase("p-1"), vec![draft("d-1", "a")]),
                (phase("p-2"), vec![draft("d-1", "a"), draft("d-3", "c")]),
            ],
        );
        assert_eq!(result.len(), 2);
        assert_eq!(result["d-1"].provenance, Provenance::PriorPhase);
    }

    #[test]
    fn test_empty_inputs() {
        assert!(resolve(&[], &[]).is_empty());
    }
}
