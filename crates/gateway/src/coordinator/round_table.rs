//! Round-table consensus — scoring, ranking, judging, history.
//!
//! The coordinator fans a request out to every participant and hands the
//! tagged result set to this module. Everything here is pure over that
//! set: per-dimension scoring with externally supplied weights, ranking,
//! tie-breaking, and parsing of the optional judged head-to-head pass
//! between the top two scorers.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::TaskCategory;
use crate::config::{ProviderDescriptor, ScoreWeights, TieBreak};
use crate::events::CorrelationId;
use crate::provider::ProviderId;
use crate::request::Usage;

/// Per-dimension score vector, each dimension in 0–100.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResponseScores {
    pub relevance: f64,
    pub completeness: f64,
    pub efficiency: f64,
    pub task_alignment: f64,
}

impl ResponseScores {
    /// Weighted total score.
    pub fn total(&self, weights: &ScoreWeights) -> f64 {
        self.relevance * weights.relevance
            + self.completeness * weights.completeness
            + self.efficiency * weights.efficiency
            + self.task_alignment * weights.task_alignment
    }
}

/// One provider's outcome in a round-table competition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTableEntry {
    pub provider: ProviderId,
    /// Response content; `None` when the provider errored or timed out.
    pub content: Option<String>,
    pub usage: Usage,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub scores: ResponseScores,
    pub total_score: f64,
    /// 1-based rank after scoring; errored entries rank last.
    pub rank: usize,
    pub error: Option<String>,
}

impl RoundTableEntry {
    pub fn succeeded(&self) -> bool {
        self.content.is_some()
    }
}

/// Verdict of the judged head-to-head pass between the top two scorers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeVerdict {
    pub judge: ProviderId,
    pub winner: ProviderId,
    pub confidence: f64,
    pub reasoning: String,
}

/// Complete result of one round-table competition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTableResult {
    pub correlation_id: CorrelationId,
    pub winner: ProviderId,
    pub confidence: f64,
    pub entries: Vec<RoundTableEntry>,
    pub judge: Option<JudgeVerdict>,
    pub total_latency_ms: u64,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "and", "or", "but", "in", "on",
    "at", "to", "for", "of", "it", "this", "that", "with",
];

/// Pure scoring over a response. Weights stay in configuration so the
/// scoring model itself is data, not logic.
pub struct ResponseScorer;

impl ResponseScorer {
    pub fn score(
        content: &str,
        prompt: &str,
        category: TaskCategory,
        latency_ms: u64,
        cost_usd: f64,
    ) -> ResponseScores {
        if content.trim().is_empty() {
            return ResponseScores::default();
        }
        ResponseScores {
            relevance: Self::relevance(content, prompt),
            completeness: Self::completeness(content, category),
            efficiency: Self::efficiency(latency_ms, cost_usd),
            task_alignment: Self::task_alignment(content, category),
        }
    }

    /// Word overlap between prompt and response, stop words removed.
    fn relevance(content: &str, prompt: &str) -> f64 {
        let filter = |text: &str| {
            text.to_lowercase()
                .split_whitespace()
                .map(str::to_string)
                .filter(|w| !STOP_WORDS.contains(&w.as_str()))
                .collect::<std::collections::HashSet<String>>()
        };

        let prompt_words = filter(prompt);
        if prompt_words.is_empty() {
            return 50.0;
        }
        let content_words = filter(content);
        let overlap = prompt_words.intersection(&content_words).count();
        (overlap as f64 / prompt_words.len() as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Task-shape completion signals per category.
    fn completeness(content: &str, category: TaskCategory) -> f64 {
        let mut score: f64 = 60.0;
        let word_count = content.split_whitespace().count();

        match category {
            TaskCategory::Code | TaskCategory::Debugging => {
                if content.contains("```") || content.contains("fn ") || content.contains("def ") {
                    score += 25.0;
                } else {
                    score -= 15.0;
                }
            }
            TaskCategory::Planning | TaskCategory::Extraction => {
                if ["1.", "2.", "- ", "* "].iter().any(|m| content.contains(m)) {
                    score += 20.0;
                }
            }
            TaskCategory::Analysis | TaskCategory::Reasoning => {
                if word_count > 60 && content.contains('\n') {
                    score += 15.0;
                }
            }
            TaskCategory::Summarization => {
                // A summary should be substantive but bounded.
                if (20..=400).contains(&word_count) {
                    score += 20.0;
                }
            }
            _ => {
                if word_count >= 30 {
                    score += 10.0;
                }
            }
        }

        if content.matches("...").count() > 5 {
            score -= 10.0;
        }
        score.clamp(0.0, 100.0)
    }

    /// Latency and cost tiers.
    fn efficiency(latency_ms: u64, cost_usd: f64) -> f64 {
        let mut score: f64 = 50.0;

        score += match latency_ms {
            0..=999 => 25.0,
            1000..=2999 => 20.0,
            3000..=4999 => 10.0,
            5000..=9999 => 0.0,
            _ => -15.0,
        };

        score += if cost_usd < 0.005 {
            25.0
        } else if cost_usd < 0.01 {
            20.0
        } else if cost_usd < 0.05 {
            10.0
        } else if cost_usd > 0.10 {
            -15.0
        } else {
            0.0
        };

        score.clamp(0.0, 100.0)
    }

    /// Category-specific marker vocabulary.
    fn task_alignment(content: &str, category: TaskCategory) -> f64 {
        let markers: &[&str] = match category {
            TaskCategory::Reasoning | TaskCategory::Analysis | TaskCategory::Optimization => {
                &["because", "therefore", "step", "first", "then", "conclusion"]
            }
            TaskCategory::Creative | TaskCategory::Generation => {
                &["imagine", "vivid", "voice", "tone", "scene", "fresh"]
            }
            TaskCategory::Code | TaskCategory::Debugging => {
                &["function", "return", "error", "test", "fix", "implementation"]
            }
            TaskCategory::Planning => &["phase", "milestone", "goal", "risk", "timeline", "owner"],
            TaskCategory::Extraction | TaskCategory::Classification | TaskCategory::Moderation => {
                &["field", "label", "category", "value", "confidence", "match"]
            }
            TaskCategory::Summarization => &["key", "overall", "main", "briefly", "in short"],
            TaskCategory::Translation => &["translation", "language", "meaning"],
            TaskCategory::Qa | TaskCategory::Search => &["answer", "found", "source", "according"],
        };

        let lower = content.to_lowercase();
        let hits = markers.iter().filter(|m| lower.contains(**m)).count();
        (50.0 + 8.0 * hits as f64).clamp(0.0, 100.0)
    }
}

/// Compute totals and assign ranks, best first. Errored entries sink to
/// the bottom regardless of their (zero) scores.
pub fn rank_entries(entries: &mut [RoundTableEntry], weights: &ScoreWeights) {
    for entry in entries.iter_mut() {
        entry.total_score = if entry.succeeded() {
            entry.scores.total(weights)
        } else {
            0.0
        };
    }
    entries.sort_by(|a, b| {
        b.succeeded()
            .cmp(&a.succeeded())
            .then(b.total_score.partial_cmp(&a.total_score).unwrap_or(std::cmp::Ordering::Equal))
            .then(a.provider.cmp(&b.provider))
    });
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
}

/// Apply the configured tie-break between the top two ranked entries.
/// Returns true when positions 0 and 1 should be swapped.
pub fn tie_break_swaps(
    entries: &[RoundTableEntry],
    tie_break: TieBreak,
    descriptors: &[ProviderDescriptor],
) -> bool {
    if entries.len() < 2 || !entries[0].succeeded() || !entries[1].succeeded() {
        return false;
    }
    if (entries[0].total_score - entries[1].total_score).abs() > f64::EPSILON {
        return false;
    }

    let lookup = |id: &ProviderId| descriptors.iter().find(|d| &d.name == id);
    match tie_break {
        TieBreak::PreferScore => false,
        TieBreak::PreferPriority => match (lookup(&entries[0].provider), lookup(&entries[1].provider)) {
            (Some(a), Some(b)) => b.priority < a.priority,
            _ => false,
        },
        TieBreak::PreferCheaper => match (lookup(&entries[0].provider), lookup(&entries[1].provider)) {
            (Some(a), Some(b)) => b.cost_tier < a.cost_tier,
            _ => false,
        },
    }
}

/// Confidence for the scored outcome: the margin between the top two
/// totals, floored at an even split. Single-response competitions use
/// the normalized winning score directly.
pub fn scored_confidence(entries: &[RoundTableEntry]) -> f64 {
    let successes: Vec<&RoundTableEntry> = entries.iter().filter(|e| e.succeeded()).collect();
    match successes.as_slice() {
        [] => 0.0,
        [only] => (only.total_score / 100.0).clamp(0.0, 1.0),
        [top, second, ..] => {
            (0.5 + (top.total_score - second.total_score) / 200.0).clamp(0.5, 0.95)
        }
    }
}

/// Prompt for the judged head-to-head pass between the top two scorers.
pub fn judge_prompt(prompt: &str, a: &RoundTableEntry, b: &RoundTableEntry) -> String {
    format!(
        "You are judging a competition between two responses to the same prompt.\n\n\
         ORIGINAL PROMPT:\n{}\n\n\
         RESPONSE A:\n{}\n\n\
         RESPONSE B:\n{}\n\n\
         Evaluate both on accuracy, completeness, clarity, and usefulness.\n\
         Respond in this exact format:\n\
         WINNER: A or B\n\
         CONFIDENCE: 0.0 to 1.0\n\
         REASONING: your explanation",
        truncate(prompt, 1000),
        truncate(a.content.as_deref().unwrap_or(""), 2000),
        truncate(b.content.as_deref().unwrap_or(""), 2000),
    )
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Parse the judge's verdict. Returns `None` when the output does not
/// name a winner, in which case the scorer's ranking stands.
pub fn parse_judge_verdict(
    output: &str,
    judge: &ProviderId,
    a: &ProviderId,
    b: &ProviderId,
) -> Option<JudgeVerdict> {
    let upper = output.to_uppercase();
    let winner = if upper.contains("WINNER: A") {
        a.clone()
    } else if upper.contains("WINNER: B") {
        b.clone()
    } else {
        return None;
    };

    let confidence = output
        .lines()
        .find(|line| line.to_uppercase().contains("CONFIDENCE:"))
        .and_then(|line| line.rsplit(':').next())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .map(|c| c.clamp(0.0, 1.0))
        .unwrap_or(0.5);

    let reasoning = output
        .split_once("REASONING:")
        .map(|(_, rest)| rest.trim().to_string())
        .unwrap_or_default();

    Some(JudgeVerdict {
        judge: judge.clone(),
        winner,
        confidence,
        reasoning,
    })
}

// ---------------------------------------------------------------------------
// History
// ---------------------------------------------------------------------------

/// Bounded in-memory ring of recent round-table results.
pub struct RoundTableHistory {
    inner: Mutex<VecDeque<RoundTableResult>>,
    limit: usize,
}

impl RoundTableHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
        }
    }

    pub fn record(&self, result: RoundTableResult) {
        let mut inner = self.inner.lock().expect("round table history lock");
        if inner.len() == self.limit {
            inner.pop_front();
        }
        inner.push_back(result);
    }

    /// Most recent results, newest last.
    pub fn recent(&self, limit: usize) -> Vec<RoundTableResult> {
        let inner = self.inner.lock().expect("round table history lock");
        inner
            .iter()
            .skip(inner.len().saturating_sub(limit))
            .cloned()
            .collect()
    }

    /// Win counts per provider across the retained history.
    pub fn provider_wins(&self) -> HashMap<ProviderId, u32> {
        let inner = self.inner.lock().expect("round table history lock");
        let mut wins: HashMap<ProviderId, u32> = HashMap::new();
        for result in inner.iter() {
            *wins.entry(result.winner.clone()).or_insert(0) += 1;
        }
        wins
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("round table history lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(provider: &str, content: Option<&str>, latency_ms: u64) -> RoundTableEntry {
        RoundTableEntry {
            provider: ProviderId::from(provider),
            content: content.map(String::from),
            usage: Usage::default(),
            latency_ms,
            cost_usd: 0.001,
            scores: ResponseScores::default(),
            total_score: 0.0,
            rank: 0,
            error: content.is_none().then(|| "timed out".to_string()),
        }
    }

    #[test]
    fn test_empty_content_scores_zero() {
        let scores = ResponseScorer::score("   ", "prompt", TaskCategory::Code, 100, 0.0);
        assert_eq!(scores.total(&ScoreWeights::default()), 0.0);
    }

    #[test]
    fn test_relevance_rewards_overlap() {
        let on_topic = ResponseScorer::score(
            "the quicksort implementation partitions the array recursively",
            "implement quicksort over an array",
            TaskCategory::Code,
            500,
            0.001,
        );
        let off_topic = ResponseScorer::score(
            "bananas are an excellent source of potassium",
            "implement quicksort over an array",
            TaskCategory::Code,
            500,
            0.001,
        );
        assert!(on_topic.relevance > off_topic.relevance);
    }

    #[test]
    fn test_completeness_rewards_code_for_code_tasks() {
        let with_code =
            ResponseScorer::completeness("here:\n```rust\nfn main() {}\n```", TaskCategory::Code);
        let without_code = ResponseScorer::completeness("you should write some", TaskCategory::Code);
        assert!(with_code > without_code);
    }

    #[test]
    fn test_efficiency_tiers() {
        assert!(ResponseScorer::efficiency(500, 0.001) > ResponseScorer::efficiency(4000, 0.001));
        assert!(ResponseScorer::efficiency(500, 0.001) > ResponseScorer::efficiency(500, 0.2));
        assert!(ResponseScorer::efficiency(20_000, 0.5) < 50.0);
    }

    #[test]
    fn test_rank_entries_orders_by_total_and_sinks_errors() {
        let mut entries = vec![
            entry("slow", Some("weak"), 8000),
            entry("dead", None, 30_000),
            entry("good", Some("a thorough, structured answer with plenty of detail"), 400),
        ];
        entries[0].scores = ResponseScores {
            relevance: 20.0,
            completeness: 40.0,
            efficiency: 30.0,
            task_alignment: 50.0,
        };
        entries[2].scores = ResponseScores {
            relevance: 80.0,
            completeness: 85.0,
            efficiency: 95.0,
            task_alignment: 70.0,
        };

        rank_entries(&mut entries, &ScoreWeights::default());

        assert_eq!(entries[0].provider.as_str(), "good");
        assert_eq!(entries[0].rank, 1);
        assert_eq!(entries[2].provider.as_str(), "dead");
        assert_eq!(entries[2].rank, 3);
        assert_eq!(entries[2].total_score, 0.0);
    }

    #[test]
    fn test_scored_confidence_margin() {
        let mut entries = vec![entry("a", Some("x"), 100), entry("b", Some("y"), 100)];
        entries[0].total_score = 80.0;
        entries[1].total_score = 60.0;
        let confidence = scored_confidence(&entries);
        assert!((confidence - 0.6).abs() < 1e-9);

        // Single respondent: normalized winning score.
        let solo = vec![{
            let mut e = entry("a", Some("x"), 100);
            e.total_score = 70.0;
            e
        }];
        assert!((scored_confidence(&solo) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_parse_judge_verdict() {
        let a = ProviderId::from("alpha");
        let b = ProviderId::from("beta");
        let judge = ProviderId::from("judge");

        let output = "WINNER: B\nCONFIDENCE: 0.85\nREASONING: response B cites the documentation.";
        let verdict = parse_judge_verdict(output, &judge, &a, &b).unwrap();
        assert_eq!(verdict.winner, b);
        assert!((verdict.confidence - 0.85).abs() < 1e-9);
        assert!(verdict.reasoning.contains("cites the documentation"));

        // Undecided output leaves the scorer's ranking in place.
        assert!(parse_judge_verdict("no clear winner", &judge, &a, &b).is_none());
    }

    #[test]
    fn test_judge_verdict_without_confidence_defaults() {
        let a = ProviderId::from("alpha");
        let b = ProviderId::from("beta");
        let verdict =
            parse_judge_verdict("WINNER: A", &ProviderId::from("judge"), &a, &b).unwrap();
        assert_eq!(verdict.winner, a);
        assert!((verdict.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_tie_break_prefers_cheaper() {
        let mut entries = vec![entry("pricey", Some("x"), 100), entry("budget", Some("y"), 100)];
        entries[0].total_score = 70.0;
        entries[1].total_score = 70.0;

        let descriptors = vec![
            ProviderDescriptor::new("pricey").with_cost_tier(3),
            ProviderDescriptor::new("budget").with_cost_tier(1),
        ];

        assert!(tie_break_swaps(&entries, TieBreak::PreferCheaper, &descriptors));
        assert!(!tie_break_swaps(&entries, TieBreak::PreferScore, &descriptors));

        // No tie, no swap.
        entries[0].total_score = 75.0;
        assert!(!tie_break_swaps(&entries, TieBreak::PreferCheaper, &descriptors));
    }

    #[test]
    fn test_history_bounded_and_win_stats() {
        let history = RoundTableHistory::new(2);
        for (i, winner) in ["a", "b", "b"].iter().enumerate() {
            history.record(RoundTableResult {
                correlation_id: CorrelationId::from_value(format!("c{i}")),
                winner: ProviderId::from(*winner),
                confidence: 0.8,
                entries: vec![],
                judge: None,
                total_latency_ms: 100,
                created_at: Utc::now(),
            });
        }

        assert_eq!(history.len(), 2);
        let wins = history.provider_wins();
        // The oldest result (winner "a") fell out of the ring.
        assert_eq!(wins.get(&ProviderId::from("b")), Some(&2));
        assert_eq!(wins.get(&ProviderId::from("a")), None);

        let recent = history.recent(1);
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].correlation_id.as_str(), "c2");
    }
}
