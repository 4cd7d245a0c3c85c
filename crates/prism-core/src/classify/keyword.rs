//! Keyword-scoring classifier.
//!
//! A [`KeywordClassifier`] counts how many of its indicator keywords occur
//! (as lowercase substrings) in the item's title and body, checks for
//! exclusion keywords, and maps the combination to a score:
//!
//! | indicators | exclusions | score |
//! |-----------|------------|-------|
//! | n > 0 | none | `base + min(bonus_cap, (n-1) · 0.03)`, at most `max_score` |
//! | n > 0 | some | `mixed_score` |
//! | 0 | some | `excluded_score` |
//! | 0 | none | `miss_score` |
//!
//! The profile's tag is attached when the score is at least 0.5.
//! The three presets carry Japanese and English keyword tables for Task,
//! Knowledge and Note.

use anyhow::Result;
use async_trait::async_trait;

use super::{Classifier, PluginVerdict};
use crate::models::{Category, Item};

const BONUS_STEP: f64 = 0.03;
const TAG_THRESHOLD: f64 = 0.5;

/// Scoring table for one keyword classifier.
#[derive(Debug, Clone)]
pub struct KeywordProfile {
    pub category: Category,
    pub indicators: Vec<String>,
    pub exclusions: Vec<String>,
    pub base_score: f64,
    pub bonus_cap: f64,
    pub max_score: f64,
    pub mixed_score: f64,
    pub excluded_score: f64,
    pub miss_score: f64,
    /// Tag attached to confident verdicts (e.g. `"task"`).
    pub tag: String,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_lowercase()).collect()
}

/// A plugin scoring items against a [`KeywordProfile`].
pub struct KeywordClassifier {
    name: String,
    labels: Vec<String>,
    profile: KeywordProfile,
}

impl KeywordClassifier {
    pub fn new(name: impl Into<String>, labels: Vec<String>, profile: KeywordProfile) -> Self {
        Self {
            name: name.into(),
            labels,
            profile,
        }
    }

    /// Look up a preset by name (`task`, `knowledge`, `note`).
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "task" => Some(Self::task()),
            "knowledge" => Some(Self::knowledge()),
            "note" => Some(Self::note()),
            _ => None,
        }
    }

    pub fn task() -> Self {
        Self::new(
            "task_keywords",
            vec!["task".to_string()],
            KeywordProfile {
                category: Category::Task,
                indicators: words(&[
                    "todo", "task", "deadline", "due", "schedule", "assign", "タスク", "締切",
                    "期限", "予定", "やること", "実施", "完了", "実行", "作業", "提出",
                    "レポート", "準備", "修正", "調査", "確認", "電話", "連絡", "相談",
                    "打ち合わせ", "開発", "実装", "テスト", "デプロイ", "リリース", "fix", "bug",
                    "debug", "issue", "solve", "check", "call", "contact", "meeting", "develop",
                    "implement", "deploy", "毎週", "毎月", "毎日", "定例", "レビュー", "週次",
                    "月次", "weekly", "monthly", "daily", "review", "recurring", "対応", "処理",
                    "申請", "承認", "更新", "追加", "削除", "改善", "最適化", "整理", "まとめ",
                ]),
                exclusions: words(&[
                    "メモ", "記録", "日記", "雑記", "感想", "思った", "memo", "note", "diary",
                    "journal",
                ]),
                base_score: 0.85,
                bonus_cap: 0.10,
                max_score: 0.95,
                mixed_score: 0.1,
                excluded_score: 0.1,
                miss_score: 0.2,
                tag: "task".to_string(),
            },
        )
    }

    pub fn knowledge() -> Self {
        Self::new(
            "knowledge_keywords",
            vec!["knowledge".to_string()],
            KeywordProfile {
                category: Category::Knowledge,
                indicators: words(&[
                    "how to", "architecture", "design", "reference", "knowledge", "faq", "設計",
                    "アーキテクチャ", "ナレッジ", "知識", "技術", "方法", "使い方", "手順",
                    "仕組み", "原理", "解説", "ドキュメント", "システム", "docker", "api",
                    "プログラミング", "開発", "学んだ", "学習", "勉強", "理解", "習得",
                    "マスター", "について", "とは", "what is", "learn", "study", "understand",
                    "原則", "手法", "アルゴリズム", "パターン", "フレームワーク", "ライブラリ",
                    "ツール", "best practice", "ベストプラクティス", "principle", "method",
                    "algorithm", "pattern", "framework", "python", "javascript", "java", "go",
                    "rust", "sql", "react", "vue", "angular", "node", "django", "flask", "aws",
                    "azure", "gcp", "kubernetes", "git", "理論", "概念", "定義", "規則", "法則",
                    "公式", "theory", "concept", "definition", "rule", "formula", "ノウハウ",
                    "コツ", "秘訣", "テクニック", "スキル", "覚え書き", "備忘録", "tips", "trick",
                    "skill",
                ]),
                exclusions: words(&[
                    "やる", "する", "実行", "完了", "提出", "締切", "do", "execute", "submit",
                    "deadline",
                ]),
                base_score: 0.80,
                bonus_cap: 0.15,
                max_score: 0.95,
                mixed_score: 0.5,
                excluded_score: 0.2,
                miss_score: 0.2,
                tag: "knowledge".to_string(),
            },
        )
    }

    /// Note preset. Its exclusions are the strongest Task and Knowledge
    /// words, and a miss on everything falls back to a weak Note verdict.
    pub fn note() -> Self {
        Self::new(
            "note_keywords",
            vec!["note".to_string()],
            KeywordProfile {
                category: Category::Note,
                indicators: words(&[
                    "メモ", "気づき", "記録", "日記", "備忘", "覚書", "memo", "note", "diary",
                    "observation", "記憶", "思考", "会議メモ", "meeting notes", "学び",
                    "learning", "振り返り", "reflection", "感想", "impression", "雑記",
                    "つぶやき", "ログ", "ジャーナル", "journal", "log", "thoughts", "random",
                    "アイデア", "思いつき", "ひらめき", "発想", "idea", "inspiration",
                    "brainstorm", "読書", "読んだ", "引用", "抜粋", "reading", "quote",
                    "excerpt", "book", "今日の", "昨日の", "最近", "ふと", "today", "yesterday",
                    "recently", "suddenly",
                ]),
                exclusions: words(&[
                    "todo", "task", "deadline", "due", "schedule", "assign", "タスク", "締切",
                    "期限", "やること", "実施", "完了", "how to", "architecture", "design",
                    "reference", "knowledge", "faq", "設計", "アーキテクチャ", "ナレッジ", "知識",
                    "技術", "原則", "ベストプラクティス", "best practice",
                ]),
                base_score: 0.75,
                bonus_cap: 0.15,
                max_score: 0.90,
                mixed_score: 0.5,
                excluded_score: 0.2,
                miss_score: 0.4,
                tag: "note".to_string(),
            },
        )
    }

    pub fn profile(&self) -> &KeywordProfile {
        &self.profile
    }

    /// Score lowercase text; returns `(score, reason)`.
    fn score(&self, text: &str) -> (f64, String) {
        let p = &self.profile;
        let hits = p.indicators.iter().filter(|k| text.contains(k.as_str())).count();
        let excluded = p.exclusions.iter().any(|k| text.contains(k.as_str()));
        match (hits, excluded) {
            (0, false) => (p.miss_score, "no keyword".to_string()),
            (0, true) => (p.excluded_score, "excluded by keyword".to_string()),
            (_, true) => (p.mixed_score, format!("mixed signals (count: {})", hits)),
            (n, false) => {
                let bonus = (BONUS_STEP * (n - 1) as f64).min(p.bonus_cap);
                (
                    (p.base_score + bonus).min(p.max_score),
                    format!("keyword match (count: {})", n),
                )
            }
        }
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    fn name(&self) -> &str {
        &self.name
    }

    fn labels(&self) -> &[String] {
        &self.labels
    }

    async fn classify(&self, item: &Item) -> Result<Option<PluginVerdict>> {
        let text = item.text().to_lowercase();
        let (score, reason) = self.score(&text);
        let mut verdict = PluginVerdict::new(self.profile.category, score, reason);
        if score >= TAG_THRESHOLD {
            verdict.tags.insert(self.profile.tag.clone());
        }
        Ok(Some(verdict))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn verdict(plugin: &KeywordClassifier, title: &str, body: &str) -> PluginVerdict {
        plugin
            .classify(&Item::inbox("p", title, body))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn task_single_and_multiple_hits() {
        let task = KeywordClassifier::task();
        let one = verdict(&task, "Schedule the deadline", "").await;
        assert!((one.score - 0.88).abs() < 1e-9, "two hits: {}", one.score);
        assert!(one.tags.contains("task"));

        let many = verdict(&task, "fix bug, deploy, review, call, check", "").await;
        assert!((many.score - 0.95).abs() < 1e-9);
    }

    #[tokio::test]
    async fn task_exclusion_wins() {
        let task = KeywordClassifier::task();
        let v = verdict(&task, "会議メモ", "レビューの感想").await;
        assert!((v.score - 0.1).abs() < 1e-9);
        assert!(v.tags.is_empty());
    }

    #[tokio::test]
    async fn knowledge_mixed_signals() {
        let k = KeywordClassifier::knowledge();
        let v = verdict(&k, "Docker の設計を完了", "").await;
        assert!((v.score - 0.5).abs() < 1e-9);
        assert_eq!(v.category, Category::Knowledge);
    }

    #[tokio::test]
    async fn note_fallback_is_below_default_threshold() {
        let n = KeywordClassifier::note();
        let v = verdict(&n, "空が青い", "").await;
        assert!((v.score - 0.4).abs() < 1e-9);
        assert!(v.score < crate::classify::DEFAULT_MIN_CONFIDENCE);
    }

    #[tokio::test]
    async fn note_hit_without_conflicts() {
        let n = KeywordClassifier::note();
        let v = verdict(&n, "読書メモ", "最近読んだ本").await;
        assert!(v.score >= 0.75 && v.score <= 0.90);
        assert!(v.tags.contains("note"));
    }

    #[test]
    fn presets_by_name() {
        assert!(KeywordClassifier::preset("task").is_some());
        assert!(KeywordClassifier::preset("habit").is_none());
    }
}
