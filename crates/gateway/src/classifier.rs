//! Task classification and technique recommendation.
//!
//! Labels an incoming request with a [`TaskCategory`] and a recommended
//! prompting [`Technique`]. Classification is an optimization, not a
//! correctness requirement: when the backend fails or times out the
//! classifier degrades to the configured default category instead of
//! failing the request.
//!
//! Results are cached by a normalized hash of the input for a bounded
//! TTL. A cache hit bypasses the backend entirely and is reported with
//! zero latency and `cached = true`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::request::Request;

/// Fixed set of task categories the gateway routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCategory {
    Reasoning,
    Creative,
    Code,
    Qa,
    Classification,
    Search,
    Analysis,
    Planning,
    Debugging,
    Optimization,
    Extraction,
    Moderation,
    Generation,
    Summarization,
    Translation,
}

impl TaskCategory {
    /// All categories, in declaration order.
    pub fn all() -> &'static [TaskCategory] {
        &[
            Self::Reasoning,
            Self::Creative,
            Self::Code,
            Self::Qa,
            Self::Classification,
            Self::Search,
            Self::Analysis,
            Self::Planning,
            Self::Debugging,
            Self::Optimization,
            Self::Extraction,
            Self::Moderation,
            Self::Generation,
            Self::Summarization,
            Self::Translation,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reasoning => "reasoning",
            Self::Creative => "creative",
            Self::Code => "code",
            Self::Qa => "qa",
            Self::Classification => "classification",
            Self::Search => "search",
            Self::Analysis => "analysis",
            Self::Planning => "planning",
            Self::Debugging => "debugging",
            Self::Optimization => "optimization",
            Self::Extraction => "extraction",
            Self::Moderation => "moderation",
            Self::Generation => "generation",
            Self::Summarization => "summarization",
            Self::Translation => "translation",
        }
    }
}

impl std::fmt::Display for TaskCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Prompting technique recommended for a task category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Technique {
    ChainOfThought,
    FewShot,
    SelfConsistency,
    TreeOfThoughts,
    React,
    Rag,
    StructuredOutput,
    RoleBased,
    StepBack,
    Direct,
}

impl Technique {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChainOfThought => "chain_of_thought",
            Self::FewShot => "few_shot",
            Self::SelfConsistency => "self_consistency",
            Self::TreeOfThoughts => "tree_of_thoughts",
            Self::React => "react",
            Self::Rag => "rag",
            Self::StructuredOutput => "structured_output",
            Self::RoleBased => "role_based",
            Self::StepBack => "step_back",
            Self::Direct => "direct",
        }
    }

    /// System preamble injected when this technique is applied, if any.
    pub fn preamble(&self) -> Option<&'static str> {
        match self {
            Self::ChainOfThought => {
                Some("Think through the problem step by step before giving the final answer.")
            }
            Self::FewShot => Some(
                "Follow the pattern established by any examples in the conversation before answering.",
            ),
            Self::SelfConsistency => Some(
                "Consider several independent lines of reasoning and answer with the most consistent conclusion.",
            ),
            Self::TreeOfThoughts => Some(
                "Explore multiple solution approaches, evaluate each briefly, then pursue the most promising one.",
            ),
            Self::React => Some(
                "Alternate between reasoning about the task and describing the concrete next action until done.",
            ),
            Self::Rag => Some(
                "Ground the answer strictly in the provided context; say so when the context is insufficient.",
            ),
            Self::StructuredOutput => {
                Some("Respond with well-formed structured output only, no surrounding prose.")
            }
            Self::RoleBased => Some("Answer as a senior domain expert would."),
            Self::StepBack => Some(
                "First state the general principle behind the question, then apply it to the specific case.",
            ),
            Self::Direct => None,
        }
    }
}

impl std::fmt::Display for Technique {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static category → technique mapping table, supplied by configuration.
/// Categories missing from the table resolve to [`Technique::Direct`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TechniqueMap {
    map: HashMap<TaskCategory, Technique>,
}

impl TechniqueMap {
    pub fn recommended(&self, category: TaskCategory) -> Technique {
        self.map.get(&category).copied().unwrap_or(Technique::Direct)
    }

    pub fn set(&mut self, category: TaskCategory, technique: Technique) {
        self.map.insert(category, technique);
    }
}

impl Default for TechniqueMap {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert(TaskCategory::Reasoning, Technique::ChainOfThought);
        map.insert(TaskCategory::Creative, Technique::RoleBased);
        map.insert(TaskCategory::Code, Technique::FewShot);
        map.insert(TaskCategory::Qa, Technique::Direct);
        map.insert(TaskCategory::Classification, Technique::StructuredOutput);
        map.insert(TaskCategory::Search, Technique::Rag);
        map.insert(TaskCategory::Analysis, Technique::StepBack);
        map.insert(TaskCategory::Planning, Technique::TreeOfThoughts);
        map.insert(TaskCategory::Debugging, Technique::React);
        map.insert(TaskCategory::Optimization, Technique::ChainOfThought);
        map.insert(TaskCategory::Extraction, Technique::StructuredOutput);
        map.insert(TaskCategory::Moderation, Technique::StructuredOutput);
        map.insert(TaskCategory::Generation, Technique::Direct);
        map.insert(TaskCategory::Summarization, Technique::Direct);
        map.insert(TaskCategory::Translation, Technique::Direct);
        Self { map }
    }
}

/// Classification result attached to a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskClassification {
    pub category: TaskCategory,
    /// Confidence in [0, 1]. Zero when the backend was unavailable and
    /// the default category was used.
    pub confidence: f32,
    pub technique: Technique,
    pub latency_ms: u64,
    pub cached: bool,
}

/// Error type for classifier backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifierError {
    #[error("classifier backend unavailable: {0}")]
    Unavailable(String),
}

/// Pluggable classification step. Implementations must be cheap —
/// the coordinator budgets well under the provider timeout for this.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    async fn classify(&self, text: &str) -> Result<(TaskCategory, f32), ClassifierError>;
}

/// Default backend: keyword scoring over the request text.
///
/// Deterministic and sub-millisecond, so the sub-100ms classification
/// target holds by construction.
pub struct KeywordClassifier;

impl KeywordClassifier {
    fn keyword_table() -> &'static [(TaskCategory, &'static [&'static str])] {
        &[
            (
                TaskCategory::Debugging,
                &["debug", "stack trace", "error", "crash", "broken", "fix the", "bug"],
            ),
            (
                TaskCategory::Code,
                &["code", "implement", "function", "class", "refactor", "api", "write a script"],
            ),
            (
                TaskCategory::Summarization,
                &["summarize", "summary", "tl;dr", "condense", "shorten"],
            ),
            (
                TaskCategory::Translation,
                &["translate", "translation", "in french", "in spanish", "in german"],
            ),
            (
                TaskCategory::Extraction,
                &["extract", "pull out", "parse", "fields", "entities"],
            ),
            (
                TaskCategory::Classification,
                &["classify", "categorize", "label", "which category", "tag"],
            ),
            (
                TaskCategory::Moderation,
                &["moderate", "policy violation", "offensive", "toxicity", "safe for"],
            ),
            (
                TaskCategory::Planning,
                &["plan", "roadmap", "milestones", "schedule", "steps to"],
            ),
            (
                TaskCategory::Optimization,
                &["optimize", "faster", "performance", "reduce cost", "efficient"],
            ),
            (
                TaskCategory::Analysis,
                &["analyze", "analysis", "compare", "evaluate", "assess", "trend"],
            ),
            (
                TaskCategory::Search,
                &["find", "search", "look up", "locate", "where is"],
            ),
            (
                TaskCategory::Creative,
                &["poem", "story", "creative", "slogan", "write a song", "imagine"],
            ),
            (
                TaskCategory::Reasoning,
                &["why", "prove", "reason", "logic", "deduce", "step by step"],
            ),
            (
                TaskCategory::Qa,
                &["what is", "who is", "when did", "how many", "question"],
            ),
        ]
    }
}

#[async_trait]
impl ClassifierBackend for KeywordClassifier {
    async fn classify(&self, text: &str) -> Result<(TaskCategory, f32), ClassifierError> {
        let lower = text.to_lowercase();
        let mut best: Option<(TaskCategory, usize)> = None;

        for (category, keywords) in Self::keyword_table() {
            let hits = keywords.iter().filter(|k| lower.contains(**k)).count();
            if hits > 0 && best.map(|(_, b)| hits > b).unwrap_or(true) {
                best = Some((*category, hits));
            }
        }

        match best {
            Some((category, hits)) => {
                let confidence = (0.5 + 0.1 * hits as f32).min(0.95);
                Ok((category, confidence))
            }
            None => Ok((TaskCategory::Generation, 0.3)),
        }
    }
}

struct CacheEntry {
    classification: TaskClassification,
    inserted_at: Instant,
}

/// Cache performance counters for the health snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierCacheStats {
    pub size: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f32,
}

/// Task classifier with TTL caching and default-category fallback.
pub struct TaskClassifier {
    backend: Arc<dyn ClassifierBackend>,
    techniques: TechniqueMap,
    config: ClassifierConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TaskClassifier {
    pub fn new(
        backend: Arc<dyn ClassifierBackend>,
        techniques: TechniqueMap,
        config: ClassifierConfig,
    ) -> Self {
        Self {
            backend,
            techniques,
            config,
            cache: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Classify a request. Never fails: backend errors and timeouts
    /// degrade to the configured default category.
    pub async fn classify(&self, request: &Request) -> TaskClassification {
        let text = request.classification_text();
        let key = Self::cache_key(&text);

        if let Some(hit) = self.cache_lookup(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(category = %hit.category, "classification cache hit");
            return hit;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let started = std::time::Instant::now();
        let timeout = Duration::from_millis(self.config.backend_timeout_ms);
        let outcome = tokio::time::timeout(timeout, self.backend.classify(&text)).await;

        let (category, confidence) = match outcome {
            Ok(Ok((category, confidence))) => (category, confidence.clamp(0.0, 1.0)),
            Ok(Err(e)) => {
                warn!(error = %e, fallback = %self.config.default_category, "classifier backend failed");
                (self.config.default_category, 0.0)
            }
            Err(_) => {
                warn!(
                    timeout_ms = self.config.backend_timeout_ms,
                    fallback = %self.config.default_category,
                    "classifier backend timed out"
                );
                (self.config.default_category, 0.0)
            }
        };

        let classification = TaskClassification {
            category,
            confidence,
            technique: self.techniques.recommended(category),
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
        };

        self.cache_store(key, &classification);
        classification
    }

    /// Recommended technique for a category, from the configured table.
    pub fn technique_for(&self, category: TaskCategory) -> Technique {
        self.techniques.recommended(category)
    }

    pub fn cache_stats(&self) -> ClassifierCacheStats {
        let cache = self.cache.lock().expect("classifier cache lock");
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        ClassifierCacheStats {
            size: cache.len(),
            max_size: self.config.cache_max_size,
            hits,
            misses,
            hit_ratio: if total == 0 {
                0.0
            } else {
                hits as f32 / total as f32
            },
        }
    }

    pub fn clear_cache(&self) {
        self.cache.lock().expect("classifier cache lock").clear();
    }

    fn cache_key(text: &str) -> String {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        let hash = blake3::hash(normalized.to_lowercase().as_bytes());
        hash.to_hex()[..16].to_string()
    }

    fn cache_lookup(&self, key: &str) -> Option<TaskClassification> {
        let ttl = Duration::from_secs(self.config.cache_ttl_secs);
        let mut cache = self.cache.lock().expect("classifier cache lock");
        match cache.get(key) {
            Some(entry) if entry.inserted_at.elapsed() < ttl => {
                let mut hit = entry.classification.clone();
                hit.cached = true;
                hit.latency_ms = 0;
                Some(hit)
            }
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_store(&self, key: String, classification: &TaskClassification) {
        let mut cache = self.cache.lock().expect("classifier cache lock");
        if cache.len() >= self.config.cache_max_size {
            // Evict the oldest entry to stay bounded.
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, e)| e.inserted_at)
                .map(|(k, _)| k.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key,
            CacheEntry {
                classification: classification.clone(),
                inserted_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Message;
    use std::sync::atomic::AtomicUsize;

    fn classifier_with(backend: Arc<dyn ClassifierBackend>) -> TaskClassifier {
        TaskClassifier::new(backend, TechniqueMap::default(), ClassifierConfig::default())
    }

    struct CountingBackend {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClassifierBackend for CountingBackend {
        async fn classify(&self, _text: &str) -> Result<(TaskCategory, f32), ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((TaskCategory::Code, 0.9))
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl ClassifierBackend for FailingBackend {
        async fn classify(&self, _text: &str) -> Result<(TaskCategory, f32), ClassifierError> {
            Err(ClassifierError::Unavailable("offline".into()))
        }
    }

    #[tokio::test]
    async fn test_keyword_backend_detects_categories() {
        let backend = KeywordClassifier;
        let (category, confidence) = backend
            .classify("please summarize this article into a short summary")
            .await
            .unwrap();
        assert_eq!(category, TaskCategory::Summarization);
        assert!(confidence > 0.5);

        let (category, _) = backend
            .classify("implement a function that parses json")
            .await
            .unwrap();
        assert_eq!(category, TaskCategory::Code);
    }

    #[tokio::test]
    async fn test_no_keywords_falls_to_generation() {
        let backend = KeywordClassifier;
        let (category, confidence) = backend.classify("hello there").await.unwrap();
        assert_eq!(category, TaskCategory::Generation);
        assert!(confidence < 0.5);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let classifier = classifier_with(backend.clone());
        let request = Request::new(vec![Message::user("implement quicksort")]);

        let first = classifier.classify(&request).await;
        assert!(!first.cached);
        let second = classifier.classify(&request).await;
        assert!(second.cached);
        assert_eq!(second.latency_ms, 0);
        assert_eq!(second.category, first.category);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);

        let stats = classifier.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_ratio - 0.5).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_expires_after_ttl() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let classifier = classifier_with(backend.clone());
        let request = Request::new(vec![Message::user("implement quicksort")]);

        classifier.classify(&request).await;
        tokio::time::advance(Duration::from_secs(3601)).await;
        let again = classifier.classify(&request).await;

        assert!(!again.cached);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_to_default() {
        let classifier = classifier_with(Arc::new(FailingBackend));
        let request = Request::new(vec![Message::user("anything at all")]);

        let result = classifier.classify(&request).await;
        assert_eq!(result.category, TaskCategory::Generation);
        assert_eq!(result.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_cache_key_normalizes_whitespace_and_case() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let classifier = classifier_with(backend.clone());

        let a = Request::new(vec![Message::user("Implement   QuickSort")]);
        let b = Request::new(vec![Message::user("implement quicksort")]);
        classifier.classify(&a).await;
        let hit = classifier.classify(&b).await;

        assert!(hit.cached);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_eviction_stays_bounded() {
        let backend = Arc::new(CountingBackend {
            calls: AtomicUsize::new(0),
        });
        let config = ClassifierConfig {
            cache_max_size: 2,
            ..ClassifierConfig::default()
        };
        let classifier = TaskClassifier::new(backend, TechniqueMap::default(), config);

        for text in ["one", "two", "three"] {
            let request = Request::new(vec![Message::user(text)]);
            classifier.classify(&request).await;
        }
        assert!(classifier.cache_stats().size <= 2);
    }

    #[test]
    fn test_default_technique_map_covers_all_categories() {
        let map = TechniqueMap::default();
        assert_eq!(map.recommended(TaskCategory::Reasoning), Technique::ChainOfThought);
        assert_eq!(map.recommended(TaskCategory::Extraction), Technique::StructuredOutput);
        // Every category resolves to something.
        for category in TaskCategory::all() {
            let _ = map.recommended(*category);
        }
    }
}
