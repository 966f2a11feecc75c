//! Intent classification
//!
//! A pluggable primary classifier (typically a language model) is asked
//! first. Its verdict is used only when it answers in time, names a known
//! intent, and is at least as confident as the configured threshold;
//! otherwise the keyword rule table decides. Entities from the built-in
//! vocabulary are merged in afterwards, with primary entities winning.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::fault::{Fault, classify};

// ============================================================================
// Intents
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    LiveQuery,
    Briefing,
    Status,
    Help,
    Greeting,
    Unknown,
}

impl IntentKind {
    pub const ALL: [IntentKind; 6] = [
        Self::LiveQuery,
        Self::Briefing,
        Self::Status,
        Self::Help,
        Self::Greeting,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LiveQuery => "live_query",
            Self::Briefing => "briefing",
            Self::Status => "status",
            Self::Help => "help",
            Self::Greeting => "greeting",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a label, ignoring case and surrounding whitespace.
    pub fn parse_label(label: &str) -> Option<Self> {
        let label = label.trim().to_lowercase();
        Self::ALL.into_iter().find(|kind| kind.as_str() == label)
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which path produced an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Primary,
    Rule,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub confidence: f32,
    pub entities: BTreeMap<String, String>,
    pub provenance: Provenance,
}

impl Intent {
    pub fn label(&self) -> &'static str {
        self.kind.as_str()
    }

    pub fn entity(&self, key: &str) -> Option<&str> {
        self.entities.get(key).map(String::as_str)
    }
}

// ============================================================================
// Primary classifier seam
// ============================================================================

/// Raw answer from a primary classifier, validated before use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PrimaryVerdict {
    pub intent: String,
    pub confidence: f32,
    #[serde(default)]
    pub entities: HashMap<String, String>,
}

#[async_trait]
pub trait PrimaryClassifier: Send + Sync {
    async fn classify(&self, text: &str, timeout: Duration) -> Result<PrimaryVerdict, Fault>;
}

// ============================================================================
// Configuration
// ============================================================================

/// One row of the fallback rule table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentRule {
    pub intent: IntentKind,
    pub keywords: Vec<String>,
    pub confidence: f32,
}

impl IntentRule {
    fn new(intent: IntentKind, keywords: &[&str], confidence: f32) -> Self {
        Self {
            intent,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            confidence,
        }
    }

    fn matches(&self, folded: &str) -> bool {
        self.keywords
            .iter()
            .filter(|k| !k.is_empty())
            .any(|k| folded.contains(&k.to_lowercase()))
    }
}

/// Keyword that maps to a canonical entity value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordMapping {
    pub keyword: String,
    pub value: String,
}

impl KeywordMapping {
    fn new(keyword: &str, value: &str) -> Self {
        Self {
            keyword: keyword.to_string(),
            value: value.to_string(),
        }
    }
}

/// Known entity values recognized in free text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityVocabulary {
    pub streamers: Vec<String>,
    pub time_ranges: Vec<KeywordMapping>,
    pub platforms: Vec<KeywordMapping>,
}

impl Default for EntityVocabulary {
    fn default() -> Self {
        Self {
            streamers: ["Uzi", "Faker", "TheShy", "Rookie", "Doublelift", "大司马"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            time_ranges: vec![
                KeywordMapping::new("today", "today"),
                KeywordMapping::new("今天", "today"),
                KeywordMapping::new("recent", "recent"),
                KeywordMapping::new("this week", "recent"),
                KeywordMapping::new("最近", "recent"),
                KeywordMapping::new("几天", "recent"),
            ],
            platforms: vec![
                KeywordMapping::new("huya", "huya"),
                KeywordMapping::new("虎牙", "huya"),
                KeywordMapping::new("twitch", "twitch"),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Minimum primary confidence accepted without falling back
    pub confidence_threshold: f32,

    /// Upper bound for one primary classification
    pub primary_timeout_ms: u64,

    /// Confidence reported when no rule matches
    pub unknown_confidence: f32,

    /// Ordered rule table; the first match wins
    pub rules: Vec<IntentRule>,

    pub vocabulary: EntityVocabulary,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            primary_timeout_ms: 3_000,
            unknown_confidence: 0.3,
            rules: default_rules(),
            vocabulary: EntityVocabulary::default(),
        }
    }
}

impl ClassifierConfig {
    pub fn primary_timeout(&self) -> Duration {
        Duration::from_millis(self.primary_timeout_ms)
    }
}

fn default_rules() -> Vec<IntentRule> {
    vec![
        IntentRule::new(
            IntentKind::LiveQuery,
            &["live", "streaming", "online", "on air", "直播", "开播", "在播"],
            0.85,
        ),
        IntentRule::new(
            IntentKind::Briefing,
            &["briefing", "report", "summary", "digest", "简报", "日报", "汇总", "总结"],
            0.85,
        ),
        IntentRule::new(IntentKind::Status, &["status", "health", "状态"], 0.85),
        IntentRule::new(IntentKind::Help, &["help", "帮助"], 0.85),
        // Greetings are short and common inside longer sentences, so last.
        IntentRule::new(IntentKind::Greeting, &["hello", "hi", "hey", "你好", "嗨"], 0.95),
    ]
}

// ============================================================================
// Classifier
// ============================================================================

pub struct IntentClassifier {
    primary: Option<Arc<dyn PrimaryClassifier>>,
    config: ClassifierConfig,
}

impl IntentClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            primary: None,
            config,
        }
    }

    pub fn with_primary(mut self, primary: Arc<dyn PrimaryClassifier>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify `text`. Never fails; the rule table is the floor.
    pub async fn classify(&self, text: &str) -> Intent {
        self.classify_with_cancel(text, &CancellationToken::new())
            .await
    }

    /// Like [`classify`](Self::classify), abandoning the primary call on cancel.
    pub async fn classify_with_cancel(&self, text: &str, cancel: &CancellationToken) -> Intent {
        let primary = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("request cancelled during classification, using rules");
                None
            }
            intent = self.try_primary(text) => intent,
        };

        let mut intent = primary.unwrap_or_else(|| self.classify_by_rules(text));
        for (key, value) in self.extract_entities(text) {
            intent.entities.entry(key).or_insert(value);
        }

        debug!(
            "classified as {} ({:.2}, {:?}) with {} entities",
            intent.kind,
            intent.confidence,
            intent.provenance,
            intent.entities.len()
        );
        intent
    }

    async fn try_primary(&self, text: &str) -> Option<Intent> {
        let primary = self.primary.as_ref()?;
        let timeout = self.config.primary_timeout();

        let verdict = match tokio::time::timeout(timeout, primary.classify(text, timeout)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(fault)) => {
                let class = classify(&fault);
                warn!(
                    "primary classifier failed ({}), falling back to rules: {}",
                    class.category, fault
                );
                return None;
            }
            Err(_) => {
                warn!("primary classifier timed out after {:?}, falling back to rules", timeout);
                return None;
            }
        };

        let Some(kind) = IntentKind::parse_label(&verdict.intent) else {
            warn!("primary classifier returned unknown label '{}'", verdict.intent);
            return None;
        };

        if !verdict.confidence.is_finite() || !(0.0..=1.0).contains(&verdict.confidence) {
            warn!(
                "primary classifier returned invalid confidence {}",
                verdict.confidence
            );
            return None;
        }

        if verdict.confidence < self.config.confidence_threshold {
            debug!(
                "primary confidence {:.2} below threshold {:.2}",
                verdict.confidence, self.config.confidence_threshold
            );
            return None;
        }

        Some(Intent {
            kind,
            confidence: verdict.confidence,
            entities: verdict.entities.into_iter().collect(),
            provenance: Provenance::Primary,
        })
    }

    /// Keyword fallback: first matching rule, else `unknown`.
    pub fn classify_by_rules(&self, text: &str) -> Intent {
        let folded = text.to_lowercase();

        let (kind, confidence) = self
            .config
            .rules
            .iter()
            .find(|rule| rule.matches(&folded))
            .map_or(
                (IntentKind::Unknown, self.config.unknown_confidence),
                |rule| (rule.intent, rule.confidence),
            );

        Intent {
            kind,
            confidence,
            entities: BTreeMap::new(),
            provenance: Provenance::Rule,
        }
    }

    /// Vocabulary entities found in `text`
    pub fn extract_entities(&self, text: &str) -> BTreeMap<String, String> {
        let folded = text.to_lowercase();
        let vocabulary = &self.config.vocabulary;
        let mut entities = BTreeMap::new();

        if let Some(streamer) = vocabulary
            .streamers
            .iter()
            .find(|name| !name.is_empty() && folded.contains(&name.to_lowercase()))
        {
            entities.insert("streamer".to_string(), streamer.clone());
        }

        let lookup = |mappings: &[KeywordMapping]| {
            mappings
                .iter()
                .find(|m| !m.keyword.is_empty() && folded.contains(&m.keyword.to_lowercase()))
                .map(|m| m.value.clone())
        };

        if let Some(range) = lookup(&vocabulary.time_ranges) {
            entities.insert("time_range".to_string(), range);
        }
        if let Some(platform) = lookup(&vocabulary.platforms) {
            entities.insert("platform".to_string(), platform);
        }

        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedPrimary(PrimaryVerdict);

    #[async_trait]
    impl PrimaryClassifier for FixedPrimary {
        async fn classify(&self, _text: &str, _timeout: Duration) -> Result<PrimaryVerdict, Fault> {
            Ok(self.0.clone())
        }
    }

    struct SlowPrimary;

    #[async_trait]
    impl PrimaryClassifier for SlowPrimary {
        async fn classify(&self, _text: &str, _timeout: Duration) -> Result<PrimaryVerdict, Fault> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(PrimaryVerdict::default())
        }
    }

    fn with_verdict(intent: &str, confidence: f32) -> IntentClassifier {
        let mut entities = HashMap::new();
        entities.insert("streamer".to_string(), "Faker".to_string());
        IntentClassifier::new(ClassifierConfig::default()).with_primary(Arc::new(FixedPrimary(
            PrimaryVerdict {
                intent: intent.to_string(),
                confidence,
                entities,
            },
        )))
    }

    #[tokio::test]
    async fn test_rules_without_primary() {
        let classifier = IntentClassifier::new(ClassifierConfig::default());

        let intent = classifier.classify("generate a report").await;
        assert_eq!(intent.kind, IntentKind::Briefing);
        assert_eq!(intent.provenance, Provenance::Rule);
        assert!((intent.confidence - 0.85).abs() < f32::EPSILON);

        let intent = classifier.classify("hello").await;
        assert_eq!(intent.kind, IntentKind::Greeting);
        assert!((intent.confidence - 0.95).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_unmatched_text_is_unknown() {
        let classifier = IntentClassifier::new(ClassifierConfig::default());
        let intent = classifier.classify("qwzx").await;
        assert_eq!(intent.kind, IntentKind::Unknown);
        assert!((intent.confidence - 0.3).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_primary_accepted_above_threshold() {
        let intent = with_verdict("live_query", 0.9).classify("is uzi streaming").await;
        assert_eq!(intent.kind, IntentKind::LiveQuery);
        assert_eq!(intent.provenance, Provenance::Primary);
        // Primary entity wins over the vocabulary match.
        assert_eq!(intent.entity("streamer"), Some("Faker"));
    }

    #[tokio::test]
    async fn test_primary_below_threshold_falls_back() {
        let intent = with_verdict("status", 0.5).classify("who is live today").await;
        assert_eq!(intent.kind, IntentKind::LiveQuery);
        assert_eq!(intent.provenance, Provenance::Rule);
        assert_eq!(intent.entity("time_range"), Some("today"));
    }

    #[tokio::test]
    async fn test_malformed_primary_falls_back() {
        let intent = with_verdict("weather", 0.99).classify("status please").await;
        assert_eq!(intent.kind, IntentKind::Status);
        assert_eq!(intent.provenance, Provenance::Rule);

        let intent = with_verdict("status", f32::NAN).classify("hello").await;
        assert_eq!(intent.kind, IntentKind::Greeting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_timeout_falls_back() {
        let classifier =
            IntentClassifier::new(ClassifierConfig::default()).with_primary(Arc::new(SlowPrimary));
        let intent = classifier.classify("generate a report").await;
        assert_eq!(intent.kind, IntentKind::Briefing);
        assert_eq!(intent.provenance, Provenance::Rule);
        assert!((intent.confidence - 0.85).abs() < f32::EPSILON);
    }

    #[test]
    fn test_entity_extraction() {
        let classifier = IntentClassifier::new(ClassifierConfig::default());
        let entities = classifier.extract_entities("大司马最近在虎牙直播吗");
        assert_eq!(entities.get("streamer").map(String::as_str), Some("大司马"));
        assert_eq!(entities.get("time_range").map(String::as_str), Some("recent"));
        assert_eq!(entities.get("platform").map(String::as_str), Some("huya"));
    }

    #[test]
    fn test_parse_label() {
        assert_eq!(IntentKind::parse_label(" Live_Query "), Some(IntentKind::LiveQuery));
        assert_eq!(IntentKind::parse_label("weather"), None);
    }
}
