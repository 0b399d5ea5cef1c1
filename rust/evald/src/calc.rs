use crate::error::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type BaseId = i64;

pub const SUB_SCORE_MIN: f64 = 1.0;
pub const SUB_SCORE_MAX: f64 = 5.0;
pub const SUB_SCORES_PER_BASE: usize = 3;

/// One rater's scores for one participant against one rubric base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreSubmission {
    pub rater_id: String,
    pub participant_id: String,
    pub base_id: BaseId,
    pub scores: [Option<f64>; SUB_SCORES_PER_BASE],
}

pub fn validate_sub_score(field: &str, value: f64) -> Result<(), CoreError> {
    if !(SUB_SCORE_MIN..=SUB_SCORE_MAX).contains(&value) {
        return Err(CoreError::Validation {
            field: field.to_string(),
            value,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub passes_to_group: f64,
    pub passes_to_interview: f64,
    /// Inclusive lower bound; 3.599, not 3.6.
    pub passes_to_discussion: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            passes_to_group: 4.7,
            passes_to_interview: 4.0,
            passes_to_discussion: 3.599,
        }
    }
}

impl Thresholds {
    pub fn validate(&self) -> Result<(), String> {
        let bands = [
            ("passesToGroup", self.passes_to_group),
            ("passesToInterview", self.passes_to_interview),
            ("passesToDiscussion", self.passes_to_discussion),
        ];
        for (key, v) in bands {
            if !v.is_finite() || !(SUB_SCORE_MIN..=SUB_SCORE_MAX).contains(&v) {
                return Err(format!("{} must be in 1..=5", key));
            }
        }
        if !(self.passes_to_group > self.passes_to_interview
            && self.passes_to_interview > self.passes_to_discussion)
        {
            return Err(
                "thresholds must be strictly descending: passesToGroup > passesToInterview > passesToDiscussion"
                    .to_string(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Status {
    Pending,
    PassesToGroup,
    PassesToInterview,
    PassesToDiscussion,
    Fails,
}

impl Status {
    pub const ALL: [Status; 5] = [
        Status::PassesToGroup,
        Status::PassesToInterview,
        Status::PassesToDiscussion,
        Status::Fails,
        Status::Pending,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::PassesToGroup => "passesToGroup",
            Self::PassesToInterview => "passesToInterview",
            Self::PassesToDiscussion => "passesToDiscussion",
            Self::Fails => "fails",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::PassesToGroup => "Passes to group",
            Self::PassesToInterview => "Passes to interview",
            Self::PassesToDiscussion => "Passes to discussion",
            Self::Fails => "Fails",
        }
    }
}

/// Maps an overall average onto an outcome band. Bands are checked from the
/// highest threshold down, each with an inclusive lower bound.
pub fn classify(overall_average: Option<f64>, thresholds: &Thresholds) -> Status {
    let Some(avg) = overall_average else {
        return Status::Pending;
    };
    if avg >= thresholds.passes_to_group {
        Status::PassesToGroup
    } else if avg >= thresholds.passes_to_interview {
        Status::PassesToInterview
    } else if avg >= thresholds.passes_to_discussion {
        Status::PassesToDiscussion
    } else {
        Status::Fails
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantAggregate {
    pub per_base_average: BTreeMap<BaseId, Option<f64>>,
    pub overall_average: Option<f64>,
    pub status: Status,
}

#[derive(Debug, Clone, Copy, Default)]
struct BaseAccumulator {
    sum: f64,
    count: usize,
}

impl BaseAccumulator {
    fn mean(self) -> Option<f64> {
        if self.count > 0 {
            Some(self.sum / (self.count as f64))
        } else {
            None
        }
    }
}

/// Mean of the values that are present; `None` when nothing is present.
pub fn mean_present<I>(values: I) -> Option<f64>
where
    I: IntoIterator<Item = Option<f64>>,
{
    let mut acc = BaseAccumulator::default();
    for v in values.into_iter().flatten() {
        acc.sum += v;
        acc.count += 1;
    }
    acc.mean()
}

impl ParticipantAggregate {
    /// A participant nobody has scored yet: every base unevaluated.
    pub fn pending(base_ids: &[BaseId]) -> Self {
        Self {
            per_base_average: base_ids.iter().map(|b| (*b, None)).collect(),
            overall_average: None,
            status: Status::Pending,
        }
    }
}

/// Per-participant, per-base averages across all raters, then an overall
/// average over the evaluated bases and its outcome status.
///
/// Every id in `base_ids` is present in each participant's map, `None` until
/// some sub-score exists for it.
pub fn aggregate(
    submissions: &[ScoreSubmission],
    base_ids: &[BaseId],
    thresholds: &Thresholds,
) -> Result<BTreeMap<String, ParticipantAggregate>, CoreError> {
    let mut by_participant: BTreeMap<String, BTreeMap<BaseId, BaseAccumulator>> = BTreeMap::new();
    let empty_bases = || {
        base_ids
            .iter()
            .map(|b| (*b, BaseAccumulator::default()))
            .collect::<BTreeMap<_, _>>()
    };

    for sub in submissions {
        for (i, score) in sub.scores.iter().enumerate() {
            if let Some(v) = score {
                validate_sub_score(&format!("score{}", i + 1), *v)?;
            }
        }
        let acc = by_participant
            .entry(sub.participant_id.clone())
            .or_insert_with(empty_bases)
            .entry(sub.base_id)
            .or_default();
        for v in sub.scores.iter().flatten() {
            acc.sum += v;
            acc.count += 1;
        }
    }

    Ok(by_participant
        .into_iter()
        .map(|(pid, bases)| {
            let per_base_average: BTreeMap<BaseId, Option<f64>> =
                bases.into_iter().map(|(b, acc)| (b, acc.mean())).collect();
            let overall_average = mean_present(per_base_average.values().copied());
            let status = classify(overall_average, thresholds);
            (
                pid,
                ParticipantAggregate {
                    per_base_average,
                    overall_average,
                    status,
                },
            )
        })
        .collect())
}

/// `aggregate`, plus a `Pending` row for each of `participant_ids` that has
/// no submissions yet.
pub fn aggregate_for<'a, P>(
    participant_ids: P,
    submissions: &[ScoreSubmission],
    base_ids: &[BaseId],
    thresholds: &Thresholds,
) -> Result<BTreeMap<String, ParticipantAggregate>, CoreError>
where
    P: IntoIterator<Item = &'a str>,
{
    let mut out = aggregate(submissions, base_ids, thresholds)?;
    for pid in participant_ids {
        out.entry(pid.to_string())
            .or_insert_with(|| ParticipantAggregate::pending(base_ids));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(rater: &str, participant: &str, base: BaseId, scores: [Option<f64>; 3]) -> ScoreSubmission {
        ScoreSubmission {
            rater_id: rater.to_string(),
            participant_id: participant.to_string(),
            base_id: base,
            scores,
        }
    }

    #[test]
    fn two_bases_average_into_interview_band() {
        let subs = vec![
            sub("r1", "p", 1, [Some(4.0), Some(4.0), Some(4.0)]),
            sub("r1", "p", 2, [Some(5.0), Some(5.0), Some(4.0)]),
        ];
        let out = aggregate(&subs, &[1, 2], &Thresholds::default()).expect("aggregate");
        let p = &out["p"];
        assert_eq!(p.per_base_average[&1], Some(4.0));
        assert!((p.per_base_average[&2].expect("base 2") - 14.0 / 3.0).abs() < 1e-9);
        let overall = p.overall_average.expect("overall");
        assert!((overall - 13.0 / 3.0).abs() < 1e-9);
        assert_eq!(p.status, Status::PassesToInterview);
    }

    #[test]
    fn averages_across_raters_and_skips_null_sub_scores() {
        let subs = vec![
            sub("r1", "p", 1, [Some(5.0), None, Some(3.0)]),
            sub("r2", "p", 1, [Some(2.0), None, None]),
        ];
        let out = aggregate(&subs, &[1], &Thresholds::default()).expect("aggregate");
        assert_eq!(out["p"].per_base_average[&1], Some(10.0 / 3.0));
    }

    #[test]
    fn unevaluated_bases_stay_present_as_null() {
        let subs = vec![
            sub("r1", "p", 1, [Some(5.0), Some(5.0), Some(5.0)]),
            sub("r1", "p", 2, [None, None, None]),
        ];
        let out = aggregate(&subs, &[1, 2, 3], &Thresholds::default()).expect("aggregate");
        let p = &out["p"];
        assert_eq!(p.per_base_average.len(), 3);
        assert_eq!(p.per_base_average[&2], None);
        assert_eq!(p.per_base_average[&3], None);
        assert_eq!(p.overall_average, Some(5.0));
        assert_eq!(p.status, Status::PassesToGroup);
    }

    #[test]
    fn participant_without_submissions_is_pending() {
        let out = aggregate_for(["nobody"], &[], &[1, 2], &Thresholds::default())
            .expect("aggregate");
        let p = &out["nobody"];
        assert_eq!(p.overall_average, None);
        assert_eq!(p.status, Status::Pending);
        assert_eq!(p.per_base_average.len(), 2);
        assert!(p.per_base_average.values().all(|v| v.is_none()));
    }

    #[test]
    fn seeded_ids_do_not_replace_scored_participants() {
        let subs = vec![sub("r1", "p", 1, [Some(4.0), Some(4.0), Some(4.0)])];
        let out = aggregate_for(["p", "q"], &subs, &[1], &Thresholds::default())
            .expect("aggregate");
        assert_eq!(out.len(), 2);
        assert_eq!(out["p"], aggregate(&subs, &[1], &Thresholds::default()).expect("aggregate")["p"]);
        assert_eq!(out["p"].overall_average, Some(4.0));
        assert_eq!(out["q"], ParticipantAggregate::pending(&[1]));
    }

    #[test]
    fn all_null_scores_are_pending_not_zero() {
        let subs = vec![sub("r1", "p", 1, [None, None, None])];
        let out = aggregate(&subs, &[], &Thresholds::default()).expect("aggregate");
        assert_eq!(out["p"].per_base_average.get(&1), Some(&None));
        assert_eq!(out["p"].status, Status::Pending);
    }

    #[test]
    fn out_of_range_sub_score_is_rejected() {
        for bad in [0.0, 0.99, 5.01, 6.0, f64::NAN] {
            let subs = vec![sub("r1", "p", 1, [Some(4.0), Some(bad), Some(4.0)])];
            let e = aggregate(&subs, &[1], &Thresholds::default()).expect_err("out of range");
            assert_eq!(e.code(), "validation_failed");
        }
    }

    #[test]
    fn classifier_boundaries_are_inclusive_from_the_top() {
        let t = Thresholds::default();
        assert_eq!(classify(None, &t), Status::Pending);
        assert_eq!(classify(Some(5.0), &t), Status::PassesToGroup);
        assert_eq!(classify(Some(4.7), &t), Status::PassesToGroup);
        assert_eq!(classify(Some(4.699999), &t), Status::PassesToInterview);
        assert_eq!(classify(Some(4.0), &t), Status::PassesToInterview);
        assert_eq!(classify(Some(3.999), &t), Status::PassesToDiscussion);
        assert_eq!(classify(Some(3.599), &t), Status::PassesToDiscussion);
        assert_eq!(classify(Some(3.598999), &t), Status::Fails);
        assert_eq!(classify(Some(1.0), &t), Status::Fails);
    }

    #[test]
    fn custom_thresholds_shift_the_bands() {
        let t = Thresholds {
            passes_to_group: 4.5,
            passes_to_interview: 3.5,
            passes_to_discussion: 3.0,
        };
        assert!(t.validate().is_ok());
        assert_eq!(classify(Some(4.6), &t), Status::PassesToGroup);
        assert_eq!(classify(Some(3.2), &t), Status::PassesToDiscussion);
    }

    #[test]
    fn thresholds_must_descend_within_score_range() {
        assert!(Thresholds::default().validate().is_ok());
        let flat = Thresholds {
            passes_to_group: 4.0,
            passes_to_interview: 4.0,
            passes_to_discussion: 3.0,
        };
        assert!(flat.validate().is_err());
        let high = Thresholds {
            passes_to_group: 5.5,
            ..Thresholds::default()
        };
        assert!(high.validate().is_err());
    }

    #[test]
    fn status_wire_names_round_trip_through_parse() {
        for st in Status::ALL {
            assert_eq!(Status::parse(st.as_str()), Some(st));
        }
        assert_eq!(
            serde_json::to_value(Status::PassesToDiscussion).expect("serialize"),
            serde_json::json!("passesToDiscussion")
        );
    }
}
