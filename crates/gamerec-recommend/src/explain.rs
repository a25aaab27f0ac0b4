//! Justification rules: a declarative list evaluated in order against each candidate.

use std::collections::BTreeSet;

use gamerec_core::GameRecord;
use serde::{Deserialize, Serialize};

/// What a candidate is compared against: the seed game, or the merged profile of several
/// liked games.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub tags: BTreeSet<String>,
    pub price: f64,
}

impl Reference {
    pub fn of_game(game: &GameRecord) -> Self {
        Self {
            tags: game.tags.clone(),
            price: game.price,
        }
    }

    /// Union of tags and mean price.
    pub fn of_profile<'a>(games: impl IntoIterator<Item = &'a GameRecord>) -> Self {
        let mut tags = BTreeSet::new();
        let mut total = 0.0;
        let mut count = 0usize;
        for game in games {
            tags.extend(game.tags.iter().cloned());
            total += game.price;
            count += 1;
        }
        Self {
            tags,
            price: if count == 0 { 0.0 } else { total / count as f64 },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceBracket {
    Free,
    Budget,
    Standard,
    Premium,
    FullPrice,
}

impl PriceBracket {
    pub fn of(price: f64) -> Self {
        match price {
            p if p <= 0.0 => PriceBracket::Free,
            p if p < 10.0 => PriceBracket::Budget,
            p if p < 20.0 => PriceBracket::Standard,
            p if p < 40.0 => PriceBracket::Premium,
            _ => PriceBracket::FullPrice,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PriceBracket::Free => "free to play",
            PriceBracket::Budget => "under $10",
            PriceBracket::Standard => "$10 to $20",
            PriceBracket::Premium => "$20 to $40",
            PriceBracket::FullPrice => "$40 and up",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum JustificationRule {
    SharedTags { max_listed: usize },
    HighPositivity { min_ratio: f64, min_reviews: i64 },
    SimilarPriceBracket,
    LargePlayerBase { min_reviews: i64 },
    SimilarDescription { min_similarity: f64 },
    /// Fires only when nothing earlier in the list did.
    QualityFallback,
}

impl JustificationRule {
    /// Appends whatever this rule has to say about `candidate` to `out`.
    fn evaluate(
        &self,
        reference: &Reference,
        candidate: &GameRecord,
        similarity: f64,
        out: &mut Vec<String>,
    ) {
        match self {
            JustificationRule::SharedTags { max_listed } => out.extend(
                reference
                    .tags
                    .iter()
                    .filter(|tag| candidate.has_tag(tag))
                    .take(*max_listed)
                    .map(|tag| format!("shared tag: {tag}")),
            ),
            JustificationRule::HighPositivity {
                min_ratio,
                min_reviews,
            } => {
                if candidate.positive_ratio >= *min_ratio && candidate.review_count >= *min_reviews {
                    out.push(format!(
                        "{:.0}% positive across {} reviews",
                        candidate.positive_ratio * 100.0,
                        candidate.review_count
                    ));
                }
            }
            JustificationRule::SimilarPriceBracket => {
                let bracket = PriceBracket::of(candidate.price);
                if bracket == PriceBracket::of(reference.price) {
                    out.push(format!("similar price bracket ({})", bracket.label()));
                }
            }
            JustificationRule::LargePlayerBase { min_reviews } => {
                if candidate.review_count >= *min_reviews {
                    out.push("large player base".to_string());
                }
            }
            JustificationRule::SimilarDescription { min_similarity } => {
                if similarity >= *min_similarity {
                    out.push("closely matching description and tags".to_string());
                }
            }
            JustificationRule::QualityFallback => {
                if out.is_empty() {
                    out.push(format!(
                        "recommended for overall quality ({:.0}% positive)",
                        candidate.positive_ratio * 100.0
                    ));
                }
            }
        }
    }
}

pub fn default_rules() -> Vec<JustificationRule> {
    vec![
        JustificationRule::SharedTags { max_listed: 3 },
        JustificationRule::HighPositivity {
            min_ratio: 0.9,
            min_reviews: 50,
        },
        JustificationRule::SimilarPriceBracket,
        JustificationRule::LargePlayerBase { min_reviews: 10_000 },
        JustificationRule::SimilarDescription {
            min_similarity: 0.5,
        },
        JustificationRule::QualityFallback,
    ]
}

/// Every justification the rules produce for `candidate`; never empty when the list ends
/// in a [`JustificationRule::QualityFallback`].
pub fn justify(
    rules: &[JustificationRule],
    reference: &Reference,
    candidate: &GameRecord,
    similarity: f64,
) -> Vec<String> {
    let mut out = Vec::new();
    for rule in rules {
        rule.evaluate(reference, candidate, similarity, &mut out);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamerec_core::GameId;

    fn record(tags: &[&str], price: f64, ratio: f64, reviews: i64) -> GameRecord {
        GameRecord {
            game_id: GameId(1),
            title: "Candidate".into(),
            release_year: None,
            price,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            positive_ratio: ratio,
            review_count: reviews,
            owners_estimate: 0,
            description: String::new(),
        }
    }

    #[test]
    fn rules_fire_in_declared_order() {
        let seed = record(&["Puzzle", "Indie", "Relaxing", "Cozy"], 9.99, 0.5, 10);
        let candidate = record(&["Cozy", "Indie", "Puzzle", "Relaxing"], 4.99, 0.95, 20_000);
        let reasons = justify(&default_rules(), &Reference::of_game(&seed), &candidate, 0.8);
        assert_eq!(
            reasons,
            vec![
                "shared tag: Cozy".to_string(),
                "shared tag: Indie".to_string(),
                "shared tag: Puzzle".to_string(),
                "95% positive across 20000 reviews".to_string(),
                "similar price bracket (under $10)".to_string(),
                "large player base".to_string(),
                "closely matching description and tags".to_string(),
            ]
        );
    }

    #[test]
    fn fallback_only_when_nothing_else_applies() {
        let seed = record(&["Shooter"], 59.99, 0.5, 10);
        let candidate = record(&["Farming"], 0.0, 0.42, 3);
        let reasons = justify(&default_rules(), &Reference::of_game(&seed), &candidate, 0.0);
        assert_eq!(reasons, vec!["recommended for overall quality (42% positive)".to_string()]);
    }

    #[test]
    fn profile_reference_merges_tags_and_averages_price() {
        let a = record(&["Puzzle"], 10.0, 0.5, 1);
        let b = record(&["Indie"], 20.0, 0.5, 1);
        let reference = Reference::of_profile([&a, &b]);
        assert_eq!(reference.tags.len(), 2);
        assert_eq!(reference.price, 15.0);
        assert_eq!(PriceBracket::of(reference.price), PriceBracket::Standard);
    }
}
