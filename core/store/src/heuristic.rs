use crate::error::Result;
use recall_indexing::WordTokenizer;
use recall_schemas::MemoryType;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Keyword score for a category (0.0 to 1.0)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Confidence(f32);

impl Confidence {
    pub fn new(score: f32) -> Self {
        Self(score.clamp(0.0, 1.0))
    }

    pub fn score(&self) -> f32 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub memory_type: MemoryType,
    pub confidence: Confidence,
}

/// Cue words for one category. English cues match whole words, CJK cues
/// match as substrings since the text has no word boundaries.
struct CategoryCues {
    memory_type: MemoryType,
    weight: f32,
    english: Regex,
    cjk: &'static [&'static str],
}

impl CategoryCues {
    fn new(
        memory_type: MemoryType,
        weight: f32,
        english: &[&str],
        cjk: &'static [&'static str],
    ) -> Result<Self> {
        Ok(Self {
            memory_type,
            weight,
            english: word_pattern(english)?,
            cjk,
        })
    }

    fn hits(&self, text: &str) -> usize {
        self.english.find_iter(text).count() + self.cjk.iter().filter(|cue| text.contains(*cue)).count()
    }
}

fn word_pattern(words: &[&str]) -> Result<Regex> {
    let alternation = words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|");
    Ok(Regex::new(&format!(r"(?i)\b(?:{})\b", alternation))?)
}

/// Local keyword classifier used when no reasoning service is reachable.
pub struct HeuristicClassifier {
    categories: Vec<CategoryCues>,
}

impl HeuristicClassifier {
    pub fn new() -> Result<Self> {
        // Ordered by priority; ties go to the earlier category.
        let categories = vec![
            CategoryCues::new(
                MemoryType::Preference,
                0.6,
                &[
                    "like", "likes", "love", "loves", "prefer", "prefers", "preferred",
                    "favorite", "favourite", "hate", "hates", "dislike", "dislikes", "enjoy",
                    "enjoys", "fond",
                ],
                &["喜欢", "讨厌", "爱", "恨", "偏好"],
            )?,
            CategoryCues::new(
                MemoryType::Opinion,
                0.5,
                &[
                    "think", "thinks", "believe", "believes", "feel", "feels", "should",
                    "opinion", "probably", "seems", "guess", "suppose",
                ],
                &["认为", "觉得", "想", "应该"],
            )?,
            CategoryCues::new(
                MemoryType::Event,
                0.4,
                &[
                    "yesterday", "today", "tomorrow", "tonight", "meeting", "appointment",
                    "birthday", "deadline", "hours", "minutes", "monday", "tuesday",
                    "wednesday", "thursday", "friday", "saturday", "sunday", "scheduled",
                    "happened",
                ],
                &["昨天", "今天", "明天", "小时", "分钟"],
            )?,
            CategoryCues::new(
                MemoryType::Fact,
                0.3,
                &[
                    "is", "are", "was", "were", "has", "have", "belongs", "located", "born",
                    "lives", "works", "called", "named",
                ],
                &["是", "有", "在", "属于"],
            )?,
        ];

        Ok(Self { categories })
    }

    pub fn classify(&self, text: &str) -> Classification {
        let mut best: Option<(&CategoryCues, f32)> = None;

        for category in &self.categories {
            let hits = category.hits(text);
            if hits == 0 {
                continue;
            }
            let score = category.weight * (1.0 + 0.1 * (hits.min(4) - 1) as f32);
            match best {
                Some((_, best_score)) if best_score >= score => {}
                _ => best = Some((category, score)),
            }
        }

        match best {
            Some((category, score)) => Classification {
                memory_type: category.memory_type.clone(),
                confidence: Confidence::new(score),
            },
            None => Classification {
                memory_type: MemoryType::Other,
                confidence: Confidence::new(0.5),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub min_importance: f32,
    pub max_keywords: usize,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            min_importance: 0.3,
            max_keywords: 5,
        }
    }
}

/// A sentence judged worth remembering.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedMemory {
    pub content: String,
    pub importance: f32,
    pub memory_type: MemoryType,
    pub keywords: Vec<String>,
}

/// Rule-based extraction of memories from conversation text.
pub struct MemoryExtractor {
    config: ExtractorConfig,
    classifier: HeuristicClassifier,
    tokenizer: WordTokenizer,
    sentence_break: Regex,
    digits: Regex,
    pronouns: Regex,
    emotions: Regex,
    cognition: Regex,
    question: Regex,
}

const CJK_PRONOUNS: &[&str] = &["我", "你", "他", "她", "我们", "你们", "他们"];
const CJK_EMOTIONS: &[&str] = &["喜欢", "讨厌", "爱", "恨", "开心", "难过", "生气", "害怕"];
const CJK_COGNITION: &[&str] = &["记得", "知道", "认为", "觉得", "想要", "需要", "希望"];
const CJK_QUESTIONS: &[&str] = &["吗?", "吗？", "什么", "为什么", "怎么"];

impl MemoryExtractor {
    pub fn new(config: ExtractorConfig) -> Result<Self> {
        Ok(Self {
            config,
            classifier: HeuristicClassifier::new()?,
            tokenizer: WordTokenizer::with_min_len(3),
            sentence_break: Regex::new(r"[。！？!?;；]|\.(?:\s+|$)|\n+")?,
            digits: Regex::new(r"\d+")?,
            pronouns: word_pattern(&["i", "me", "my", "you", "your", "we", "our", "he", "she", "they"])?,
            emotions: word_pattern(&[
                "love", "loves", "hate", "hates", "like", "likes", "happy", "sad", "angry",
                "afraid", "scared", "enjoy", "enjoys",
            ])?,
            cognition: word_pattern(&[
                "remember", "know", "think", "believe", "want", "wants", "need", "needs", "hope",
            ])?,
            question: word_pattern(&["what", "why", "how", "when", "where", "who"])?,
        })
    }

    pub fn classifier(&self) -> &HeuristicClassifier {
        &self.classifier
    }

    pub fn split_sentences(&self, text: &str) -> Vec<String> {
        self.sentence_break
            .split(text)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Rule score: 0.1 base, +0.2 personal pronouns, +0.3 emotion words,
    /// +0.2 cognition verbs, +0.1 digits, +0.2 when answering a question.
    pub fn importance(&self, sentence: &str, last_user_message: Option<&str>) -> f32 {
        let mut importance = 0.1;

        if self.pronouns.is_match(sentence) || CJK_PRONOUNS.iter().any(|p| sentence.contains(p)) {
            importance += 0.2;
        }
        if self.emotions.is_match(sentence) || CJK_EMOTIONS.iter().any(|w| sentence.contains(w)) {
            importance += 0.3;
        }
        if self.cognition.is_match(sentence) || CJK_COGNITION.iter().any(|v| sentence.contains(v)) {
            importance += 0.2;
        }
        if self.digits.is_match(sentence) {
            importance += 0.1;
        }
        if let Some(question) = last_user_message {
            let asked = question.contains('?')
                || question.contains('？')
                || self.question.is_match(question)
                || CJK_QUESTIONS.iter().any(|q| question.contains(q));
            if asked {
                importance += 0.2;
            }
        }

        f32::min(importance, 1.0)
    }

    /// Most frequent terms, longer terms first on ties.
    pub fn keywords(&self, sentence: &str) -> Vec<String> {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for token in self.tokenizer.words(sentence) {
            *counts.entry(token).or_default() += 1;
        }

        let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then_with(|| a.0.chars().count().cmp(&b.0.chars().count()).reverse())
                .then_with(|| a.0.cmp(&b.0))
        });

        ranked
            .into_iter()
            .map(|(token, _)| token)
            .take(self.config.max_keywords)
            .collect()
    }

    pub fn extract(&self, text: &str, last_user_message: Option<&str>) -> Vec<ExtractedMemory> {
        let extracted: Vec<ExtractedMemory> = self
            .split_sentences(text)
            .into_iter()
            .filter_map(|sentence| {
                let importance = self.importance(&sentence, last_user_message);
                if importance < self.config.min_importance {
                    return None;
                }
                Some(ExtractedMemory {
                    memory_type: self.classifier.classify(&sentence).memory_type,
                    keywords: self.keywords(&sentence),
                    importance,
                    content: sentence,
                })
            })
            .collect();

        debug!("Extracted {} memories from {} chars", extracted.len(), text.len());
        extracted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classifier_categories() {
        let classifier = HeuristicClassifier::new().unwrap();

        assert_eq!(classifier.classify("User likes green tea").memory_type, MemoryType::Preference);
        assert_eq!(classifier.classify("I think Rust is great").memory_type, MemoryType::Opinion);
        assert_eq!(classifier.classify("The meeting is tomorrow").memory_type, MemoryType::Event);
        assert_eq!(classifier.classify("Paris is the capital of France").memory_type, MemoryType::Fact);
        assert_eq!(classifier.classify("zxqv").memory_type, MemoryType::Other);
        assert_eq!(classifier.classify("我喜欢喝茶").memory_type, MemoryType::Preference);
        assert_eq!(classifier.classify("明天下午开会").memory_type, MemoryType::Event);
    }

    #[test]
    fn test_confidence_is_clamped() {
        assert_eq!(Confidence::new(1.7).score(), 1.0);
        assert_eq!(Confidence::new(-0.2).score(), 0.0);
    }

    #[test]
    fn test_importance_rules() {
        let extractor = MemoryExtractor::new(ExtractorConfig::default()).unwrap();

        let plain = extractor.importance("The sky", None);
        assert!((plain - 0.1).abs() < 1e-6);

        let personal = extractor.importance("I love my 2 cats", None);
        assert!((personal - 0.7).abs() < 1e-6);

        let answered = extractor.importance("我喜欢猫", Some("你喜欢什么？"));
        assert!((answered - 0.8).abs() < 1e-6);

        let capped = extractor.importance("我记得我爱这3只猫", Some("为什么？"));
        assert!(capped <= 1.0);
    }

    #[test]
    fn test_extract_filters_low_importance() {
        let extractor = MemoryExtractor::new(ExtractorConfig::default()).unwrap();
        let extracted = extractor.extract("The sky. I love hiking in the mountains! Ok", None);

        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].content, "I love hiking in the mountains");
        assert_eq!(extracted[0].memory_type, MemoryType::Preference);
        assert!(extracted[0].keywords.contains(&"hiking".to_string()));
    }

    #[test]
    fn test_split_sentences() {
        let extractor = MemoryExtractor::new(ExtractorConfig::default()).unwrap();
        let sentences = extractor.split_sentences("今天很开心。明天去爬山！Version 3.5 shipped. Done");
        assert_eq!(sentences, vec!["今天很开心", "明天去爬山", "Version 3.5 shipped", "Done"]);
    }
}
