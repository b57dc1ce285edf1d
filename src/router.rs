//! Question complexity routing.
//!
//! A [`ComplexityAnalyzer`] scores a question from surface cues and maps
//! the score onto a [`Tier`]; [`ModelRouter`] turns the tier (or an explicit
//! override) into the provider/model pair configured under `[routing]`.
//!
//! Every factor only adds to the score, so extending a question never moves
//! it from `complex` back to `simple`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::{RoutingConfig, TierConfig};

/// Requested complexity for a question.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    #[default]
    Auto,
    Simple,
    Complex,
}

/// Model tier a question is answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Simple,
    Complex,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Simple => "simple",
            Tier::Complex => "complex",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Analytical cues, each worth [`CUE_WEIGHT`]. Patterns carry no word
/// boundaries: a match must survive any text added before or after it.
const ANALYTICAL_CUES: &[(&str, &str)] = &[
    ("analyze", r"analy[sz]"),
    ("compare", r"compar"),
    ("synthesize", r"synthesi[sz]"),
    ("explain why", r"explain why"),
    ("what patterns", r"what patterns"),
    ("how does", r"how does"),
    ("summarize all", r"summari[sz]e all"),
    ("across", r"across"),
    ("relationship between", r"relationships? between"),
    ("connections", r"connection"),
    ("trends", r"trend"),
    ("insights", r"insight"),
    ("overall", r"overall"),
    ("comprehensive", r"comprehensive"),
    ("detailed analysis", r"detailed analysis"),
    ("what can you tell me about", r"what can you tell me about"),
    ("what do my notes say about", r"what do my notes say about"),
    ("what have i learned", r"what have i learn"),
    ("what are the key", r"what are the key"),
    ("pros and cons", r"pros and cons"),
    ("versus", r"(versus|vs\.?\s)"),
];

const CLAUSE_SEPARATORS: &[&str] = &[";", ", and ", ", but ", " and then "];

const CUE_WEIGHT: u32 = 2;
const LONG_QUESTION_WORDS: usize = 15;

/// Outcome of scoring one question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Analysis {
    pub tier: Tier,
    pub score: u32,
    /// Human-readable reasons, one per contributing factor.
    pub factors: Vec<String>,
}

pub struct ComplexityAnalyzer {
    cues: Vec<(&'static str, Regex)>,
    threshold: u32,
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self::new(2)
    }
}

impl ComplexityAnalyzer {
    /// A score at or above `threshold` routes to [`Tier::Complex`].
    pub fn new(threshold: u32) -> Self {
        let cues = ANALYTICAL_CUES
            .iter()
            .filter_map(|(label, pattern)| Regex::new(pattern).ok().map(|re| (*label, re)))
            .collect();
        Self { cues, threshold }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn analyze(&self, question: &str) -> Analysis {
        let text = question.to_ascii_lowercase();
        let mut score = 0u32;
        let mut factors = Vec::new();

        for (label, re) in &self.cues {
            if re.is_match(&text) {
                score += CUE_WEIGHT;
                factors.push(format!("analytical cue \"{}\" (+{})", label, CUE_WEIGHT));
            }
        }

        let words = text.split_whitespace().count();
        if words > LONG_QUESTION_WORDS {
            score += 1;
            factors.push(format!("long question: {} words (+1)", words));
        }

        let extra_questions = text.matches('?').count().saturating_sub(1) as u32;
        if extra_questions > 0 {
            score += extra_questions;
            factors.push(format!(
                "{} additional question mark(s) (+{})",
                extra_questions, extra_questions
            ));
        }

        let separators: u32 = CLAUSE_SEPARATORS
            .iter()
            .map(|sep| text.matches(sep).count() as u32)
            .sum();
        if separators > 0 {
            score += separators;
            factors.push(format!("{} clause separator(s) (+{})", separators, separators));
        }

        let tier = if score >= self.threshold {
            Tier::Complex
        } else {
            Tier::Simple
        };
        Analysis {
            tier,
            score,
            factors,
        }
    }

    /// Multi-line explanation of how `question` was scored.
    pub fn explain(&self, question: &str) -> String {
        let analysis = self.analyze(question);
        let mut out = format!(
            "tier: {} (score {}, threshold {})\n",
            analysis.tier, analysis.score, self.threshold
        );
        if analysis.factors.is_empty() {
            out.push_str("  no complexity cues found\n");
        }
        for factor in &analysis.factors {
            out.push_str("  - ");
            out.push_str(factor);
            out.push('\n');
        }
        out
    }
}

/// The model chosen for one question.
#[derive(Debug, Clone, Serialize)]
pub struct RouteDecision {
    pub tier: Tier,
    pub provider: String,
    pub model: String,
    /// True when the caller forced the tier.
    pub overridden: bool,
    pub analysis: Analysis,
}

pub struct ModelRouter {
    analyzer: ComplexityAnalyzer,
    simple: TierConfig,
    complex: TierConfig,
}

impl ModelRouter {
    pub fn new(routing: &RoutingConfig) -> Self {
        Self {
            analyzer: ComplexityAnalyzer::new(routing.complex_threshold),
            simple: routing.simple.clone(),
            complex: routing.complex.clone(),
        }
    }

    pub fn analyzer(&self) -> &ComplexityAnalyzer {
        &self.analyzer
    }

    pub fn tier_config(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Simple => &self.simple,
            Tier::Complex => &self.complex,
        }
    }

    pub fn resolve(&self, question: &str, complexity: Complexity) -> RouteDecision {
        let analysis = self.analyzer.analyze(question);
        let (tier, overridden) = match complexity {
            Complexity::Auto => (analysis.tier, false),
            Complexity::Simple => (Tier::Simple, true),
            Complexity::Complex => (Tier::Complex, true),
        };
        let target = self.tier_config(tier);
        tracing::debug!(
            tier = tier.as_str(),
            score = analysis.score,
            overridden,
            model = %target.model,
            "routed question"
        );
        RouteDecision {
            tier,
            provider: target.provider.clone(),
            model: target.model.clone(),
            overridden,
            analysis,
        }
    }
}
