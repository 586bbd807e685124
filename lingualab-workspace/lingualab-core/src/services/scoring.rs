// src/services/scoring.rs
//! Pure scoring functions: knowledge-test partial credit, UEQ scale means and
//! the ratio helper every derived metric goes through.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Decimal places kept in derived metrics.
pub const METRIC_PLACES: i32 = 4;

pub fn round_to(x: f64, places: i32) -> f64 {
    let f = 10f64.powi(places);
    (x * f).round() / f
}

/// `num / den`, or `None` when the denominator is zero (or the result is not finite).
pub fn ratio(num: f64, den: f64) -> Option<f64> {
    if den == 0.0 {
        return None;
    }
    let r = num / den;
    r.is_finite().then(|| round_to(r, METRIC_PLACES))
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestItem {
    SingleChoice {
        id: String,
        #[serde(default = "default_weight")]
        weight: f64,
        correct: String,
        #[serde(default)]
        selected: Option<String>,
    },
    MultiSelect {
        id: String,
        #[serde(default = "default_weight")]
        weight: f64,
        options: Vec<String>,
        correct: Vec<String>,
        #[serde(default)]
        selected: Vec<String>,
    },
}

impl TestItem {
    pub fn id(&self) -> &str {
        match self {
            TestItem::SingleChoice { id, .. } | TestItem::MultiSelect { id, .. } => id,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            TestItem::SingleChoice { weight, .. } | TestItem::MultiSelect { weight, .. } => {
                weight.max(0.0)
            }
        }
    }

    pub fn is_answered(&self) -> bool {
        match self {
            TestItem::SingleChoice { selected, .. } => selected.is_some(),
            TestItem::MultiSelect { selected, .. } => !selected.is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemScore {
    pub id: String,
    pub score: f64,
    pub weight: f64,
    pub answered: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeTestSummary {
    pub items: usize,
    pub answered: usize,
    pub score: f64,
    pub max_score: f64,
    pub accuracy: Option<f64>,
}

/// Score one item.
///
/// Multi-select items earn `weight / options` for every option whose
/// selected-state matches the key (picked when correct, left out when not).
/// An item with nothing selected is unanswered and scores zero.
pub fn score_item(item: &TestItem) -> ItemScore {
    let weight = item.weight();
    let answered = item.is_answered();
    let score = match item {
        TestItem::SingleChoice {
            correct, selected, ..
        } => match selected {
            Some(s) if s == correct => weight,
            _ => 0.0,
        },
        TestItem::MultiSelect {
            options,
            correct,
            selected,
            ..
        } => {
            if !answered || options.is_empty() {
                0.0
            } else {
                let correct: BTreeSet<&str> = correct.iter().map(String::as_str).collect();
                let selected: BTreeSet<&str> = selected.iter().map(String::as_str).collect();
                let per_option = weight / options.len() as f64;
                let matches = options
                    .iter()
                    .filter(|o| correct.contains(o.as_str()) == selected.contains(o.as_str()))
                    .count();
                (per_option * matches as f64).min(weight)
            }
        }
    };
    ItemScore {
        id: item.id().to_string(),
        score: round_to(score, METRIC_PLACES),
        weight,
        answered,
    }
}

pub fn score_knowledge_test(items: &[TestItem]) -> (Vec<ItemScore>, KnowledgeTestSummary) {
    let scores: Vec<ItemScore> = items.iter().map(score_item).collect();
    let score: f64 = scores.iter().map(|s| s.score).sum();
    let max_score: f64 = scores.iter().map(|s| s.weight).sum();
    let summary = KnowledgeTestSummary {
        items: scores.len(),
        answered: scores.iter().filter(|s| s.answered).count(),
        score: round_to(score, METRIC_PLACES),
        max_score: round_to(max_score, METRIC_PLACES),
        accuracy: ratio(score, max_score),
    };
    (scores, summary)
}

// ---------- UEQ ----------

/// Item numbers (1-based) belonging to each UEQ scale.
pub const UEQ_SCALES: [(&str, &[u8]); 6] = [
    ("Attractiveness", &[1, 12, 14, 16, 24, 25]),
    ("Perspicuity", &[2, 4, 13, 21]),
    ("Efficiency", &[9, 20, 22, 23]),
    ("Dependability", &[8, 11, 17, 19]),
    ("Stimulation", &[5, 6, 7, 18]),
    ("Novelty", &[3, 10, 15, 26]),
];

/// Published benchmark `(mean, sd)` per scale.
pub const UEQ_BENCHMARKS: [(&str, f64, f64); 6] = [
    ("Attractiveness", 1.50, 0.85),
    ("Perspicuity", 1.45, 0.83),
    ("Efficiency", 1.38, 0.79),
    ("Dependability", 1.25, 0.86),
    ("Stimulation", 1.17, 0.96),
    ("Novelty", 0.78, 0.96),
];

pub const UEQ_ITEMS: usize = 26;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Grade {
    Excellent,
    Good,
    Okay,
    Weak,
}

pub fn grade(mean: f64, bench_mean: f64, sd: f64) -> Grade {
    if mean >= bench_mean + 0.5 * sd {
        Grade::Excellent
    } else if mean >= bench_mean {
        Grade::Good
    } else if mean >= bench_mean - 0.5 * sd {
        Grade::Okay
    } else {
        Grade::Weak
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UeqEvaluation {
    pub scale_means: BTreeMap<String, f64>,
    pub grades: BTreeMap<String, Grade>,
    pub answered_items: usize,
    pub complete: bool,
}

/// Answers are keyed `q1`..`q26` on a 1..=7 scale, mapped to -3..=+3.
/// A scale with any unanswered item is left out rather than guessed.
pub fn evaluate_ueq(answers: &BTreeMap<String, u8>) -> UeqEvaluation {
    let value = |n: u8| -> Option<f64> {
        answers
            .get(&format!("q{n}"))
            .filter(|v| (1..=7).contains(*v))
            .map(|v| f64::from(*v) - 4.0)
    };

    let mut out = UeqEvaluation::default();
    out.answered_items = (1..=UEQ_ITEMS as u8).filter(|n| value(*n).is_some()).count();
    for ((scale, items), (_, bench, sd)) in UEQ_SCALES.iter().zip(UEQ_BENCHMARKS.iter()) {
        let vals: Option<Vec<f64>> = items.iter().map(|n| value(*n)).collect();
        let Some(vals) = vals else {
            continue;
        };
        let mean = vals.iter().sum::<f64>() / vals.len() as f64;
        out.scale_means
            .insert(scale.to_string(), round_to(mean, METRIC_PLACES));
        out.grades.insert(scale.to_string(), grade(mean, *bench, *sd));
    }
    out.complete = out.scale_means.len() == UEQ_SCALES.len();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi(selected: &[&str]) -> TestItem {
        TestItem::MultiSelect {
            id: "q3".into(),
            weight: 1.0,
            options: ["a", "b", "c", "d"].map(String::from).to_vec(),
            correct: vec!["a".into(), "c".into()],
            selected: selected.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn multi_select_partial_credit() {
        assert_eq!(score_item(&multi(&["a", "c"])).score, 1.0);
        assert_eq!(score_item(&multi(&["a", "c", "d"])).score, 0.75);
        assert_eq!(score_item(&multi(&["b", "d"])).score, 0.0);
        let none = score_item(&multi(&[]));
        assert_eq!(none.score, 0.0);
        assert!(!none.answered);
    }

    #[test]
    fn single_choice_and_summary() {
        let items = vec![
            TestItem::SingleChoice {
                id: "q1".into(),
                weight: 1.0,
                correct: "b".into(),
                selected: Some("b".into()),
            },
            TestItem::SingleChoice {
                id: "q2".into(),
                weight: 1.0,
                correct: "a".into(),
                selected: None,
            },
            multi(&["a", "c", "d"]),
        ];
        let (_, summary) = score_knowledge_test(&items);
        assert_eq!(summary.items, 3);
        assert_eq!(summary.answered, 2);
        assert_eq!(summary.score, 1.75);
        assert_eq!(summary.max_score, 3.0);
        assert_eq!(summary.accuracy, Some(0.5833));
    }

    #[test]
    fn empty_test_has_no_accuracy() {
        let (_, summary) = score_knowledge_test(&[]);
        assert_eq!(summary.accuracy, None);
        assert_eq!(ratio(3.0, 0.0), None);
    }

    #[test]
    fn ueq_neutral_answers_grade_against_benchmarks() {
        let answers: BTreeMap<String, u8> = (1..=26).map(|n| (format!("q{n}"), 4)).collect();
        let eval = evaluate_ueq(&answers);
        assert!(eval.complete);
        assert_eq!(eval.scale_means["Novelty"], 0.0);
        // 0.0 vs Novelty bench 0.78 - 0.48 = 0.30 -> weak
        assert_eq!(eval.grades["Novelty"], Grade::Weak);
    }

    #[test]
    fn ueq_top_answers_are_excellent_and_partial_scales_are_skipped() {
        let mut answers: BTreeMap<String, u8> = (1..=26).map(|n| (format!("q{n}"), 7)).collect();
        answers.remove("q3");
        let eval = evaluate_ueq(&answers);
        assert!(!eval.complete);
        assert!(!eval.scale_means.contains_key("Novelty"));
        assert_eq!(eval.scale_means["Attractiveness"], 3.0);
        assert_eq!(eval.grades["Attractiveness"], Grade::Excellent);
        assert_eq!(eval.answered_items, 25);
    }
}
