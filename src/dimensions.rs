//! Behavioral dimension catalog
//!
//! Every dimension is a bipolar spectrum scored on a fixed 5-point rubric
//! (0, 0.25, 0.5, 0.75, 1.0). The catalog is static; calibration picks the
//! subset that applies to a character and attaches a target to each.

use serde::{Deserialize, Serialize};

/// The five discrete rubric levels.
pub const RUBRIC_LEVELS: [f64; 5] = [0.0, 0.25, 0.5, 0.75, 1.0];

/// One catalog entry. Immutable, defined once.
#[derive(Debug, Clone, Copy)]
pub struct Dimension {
    pub id: &'static str,
    pub low_label: &'static str,
    pub high_label: &'static str,
    /// Anchors for levels 0, 0.25, 0.5, 0.75, 1.0 in order.
    pub rubric: [&'static str; 5],
    /// Where an unconditioned AI assistant tends to sit.
    pub default_value: f64,
}

impl Dimension {
    /// Render the rubric as prompt text.
    pub fn rubric_text(&self) -> String {
        let mut lines = vec![format!(
            "{} ({} <-> {}):",
            self.id, self.low_label, self.high_label
        )];
        for (level, anchor) in RUBRIC_LEVELS.iter().zip(self.rubric.iter()) {
            lines.push(format!("  {:.2} = {}", level, anchor));
        }
        lines.join("\n")
    }
}

pub const CATALOG: &[Dimension] = &[
    Dimension {
        id: "warmth",
        low_label: "cold",
        high_label: "warm",
        rubric: [
            "Icy or hostile; no care for the other person",
            "Distant and clipped; courtesy without feeling",
            "Neutral; polite but emotionally flat",
            "Friendly and caring; shows interest in the other person",
            "Openly affectionate, nurturing, effusive",
        ],
        default_value: 0.75,
    },
    Dimension {
        id: "verbosity",
        low_label: "terse",
        high_label: "verbose",
        rubric: [
            "One-word or single-fragment replies",
            "Short, a sentence or two",
            "Moderate length, a short paragraph",
            "Long, several developed paragraphs",
            "Sprawling; elaborates far beyond what was asked",
        ],
        default_value: 0.7,
    },
    Dimension {
        id: "formality",
        low_label: "casual",
        high_label: "formal",
        rubric: [
            "Slang, fragments, no regard for register",
            "Relaxed and conversational",
            "Standard everyday register",
            "Careful, polished phrasing",
            "Ceremonial or archaic, strictly proper",
        ],
        default_value: 0.6,
    },
    Dimension {
        id: "assertiveness",
        low_label: "deferential",
        high_label: "assertive",
        rubric: [
            "Submissive; yields to every suggestion",
            "Hesitant; hedges and seeks approval",
            "Balanced; states views but accommodates",
            "Confident; pushes own view and direction",
            "Domineering; commands, refuses to yield",
        ],
        default_value: 0.35,
    },
    Dimension {
        id: "humor",
        low_label: "serious",
        high_label: "playful",
        rubric: [
            "Grave, no levity at all",
            "Mostly serious with rare dry remarks",
            "Occasional light humor",
            "Frequent jokes, teasing or wordplay",
            "Constantly joking, irreverent",
        ],
        default_value: 0.4,
    },
    Dimension {
        id: "expressiveness",
        low_label: "reserved",
        high_label: "expressive",
        rubric: [
            "No visible emotion; stoic",
            "Restrained; emotion only hinted at",
            "Moderate emotional display",
            "Emotion shown readily in words and actions",
            "Dramatic, emotion dominates every line",
        ],
        default_value: 0.6,
    },
    Dimension {
        id: "agreeableness",
        low_label: "contrarian",
        high_label: "agreeable",
        rubric: [
            "Argues with or rejects nearly everything",
            "Skeptical; frequently pushes back",
            "Agrees or disagrees on the merits",
            "Accommodating; rarely objects",
            "Agrees with everything, sycophantic",
        ],
        default_value: 0.85,
    },
    Dimension {
        id: "optimism",
        low_label: "pessimistic",
        high_label: "optimistic",
        rubric: [
            "Bleak, expects the worst",
            "Wary and doubtful about outcomes",
            "Realistic, even-handed outlook",
            "Hopeful, looks for the upside",
            "Relentlessly upbeat regardless of circumstance",
        ],
        default_value: 0.75,
    },
    Dimension {
        id: "complexity",
        low_label: "plain",
        high_label: "ornate",
        rubric: [
            "Very simple words and short sentences",
            "Plain, accessible language",
            "Average vocabulary and structure",
            "Rich vocabulary, varied sentence structure",
            "Florid, elaborate, heavily figurative prose",
        ],
        default_value: 0.55,
    },
    Dimension {
        id: "initiative",
        low_label: "reactive",
        high_label: "proactive",
        rubric: [
            "Only responds; never adds anything new",
            "Mostly follows the other person's lead",
            "Sometimes introduces ideas or actions",
            "Often drives the scene or topic forward",
            "Takes over the direction of every exchange",
        ],
        default_value: 0.6,
    },
];

/// Look up a catalog entry by id.
pub fn find_dimension(id: &str) -> Option<&'static Dimension> {
    CATALOG.iter().find(|d| d.id == id)
}

/// A catalog dimension calibrated for one character.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveDimension {
    pub id: String,
    /// Calibrated position in [0, 1].
    pub target: f64,
    /// How this character expresses that position.
    pub context: String,
}

impl ActiveDimension {
    pub fn new(id: &str, target: f64, context: &str) -> Self {
        Self {
            id: id.to_string(),
            target: target.clamp(0.0, 1.0),
            context: context.to_string(),
        }
    }

    pub fn catalog_entry(&self) -> Option<&'static Dimension> {
        find_dimension(&self.id)
    }

    /// Pole label nearest the target, e.g. "warm" for warmth at 0.8.
    pub fn target_pole(&self) -> &'static str {
        match self.catalog_entry() {
            Some(d) if self.target >= 0.5 => d.high_label,
            Some(d) => d.low_label,
            None => "",
        }
    }
}

/// Snap any value to the nearest rubric level.
///
/// Exact midpoints (0.125, 0.375, ...) round upward. Callers reject
/// non-finite input before snapping.
pub fn snap_to_discrete(value: f64) -> f64 {
    (value.clamp(0.0, 1.0) * 4.0).round() / 4.0
}

/// Stable hash of a profile's text, used to invalidate cached calibrations.
pub fn profile_hash(profile_text: &str) -> String {
    let hash = blake3::hash(profile_text.as_bytes()).to_hex();
    hash.as_str()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_ids_are_unique_and_defaults_in_range() {
        for (i, d) in CATALOG.iter().enumerate() {
            assert!((0.0..=1.0).contains(&d.default_value), "{}", d.id);
            assert!(CATALOG[i + 1..].iter().all(|o| o.id != d.id), "{}", d.id);
        }
    }

    #[test]
    fn snap_maps_to_nearest_level() {
        assert_eq!(snap_to_discrete(0.0), 0.0);
        assert_eq!(snap_to_discrete(0.1), 0.0);
        assert_eq!(snap_to_discrete(0.2), 0.25);
        assert_eq!(snap_to_discrete(0.6), 0.5);
        assert_eq!(snap_to_discrete(0.7), 0.75);
        assert_eq!(snap_to_discrete(0.9), 1.0);
        assert_eq!(snap_to_discrete(1.7), 1.0);
        assert_eq!(snap_to_discrete(-0.3), 0.0);
    }

    #[test]
    fn snap_ties_resolve_upward() {
        assert_eq!(snap_to_discrete(0.125), 0.25);
        assert_eq!(snap_to_discrete(0.375), 0.5);
        assert_eq!(snap_to_discrete(0.625), 0.75);
        assert_eq!(snap_to_discrete(0.875), 1.0);
    }

    #[test]
    fn snap_output_is_always_a_rubric_level() {
        for i in 0..=1000 {
            let v = snap_to_discrete(i as f64 / 1000.0);
            assert!(RUBRIC_LEVELS.contains(&v), "{} -> {}", i, v);
        }
    }

    #[test]
    fn profile_hash_changes_with_text() {
        assert_eq!(profile_hash("Mira is kind"), profile_hash("Mira is kind"));
        assert_ne!(profile_hash("Mira is kind"), profile_hash("Mira is cruel"));
    }

    #[test]
    fn active_dimension_clamps_target() {
        let d = ActiveDimension::new("warmth", 1.4, "");
        assert_eq!(d.target, 1.0);
        assert_eq!(d.target_pole(), "warm");
    }
}
