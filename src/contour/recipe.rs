//! Declarative contour construction.
//!
//! A [`Recipe`] is a small expression tree deserialized from the
//! configuration file: leaves are generators, inner nodes are the
//! composition operators. Building fails with `InvalidRecipe` on
//! semantic mistakes; unknown node types already fail at deserialization.

use super::{Contour, ContourError};
use crate::model::score::Tune;
use rand::Rng;
use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_unit_max() -> f64 {
    1.0
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recipe {
    Intensity {
        weights: Vec<f64>,
        #[serde(default)]
        random_weight: f64,
        #[serde(default = "default_true")]
        savgol: bool,
        #[serde(default)]
        shift: bool,
    },
    Random {
        #[serde(default)]
        min: f64,
        #[serde(default = "default_unit_max")]
        max: f64,
    },
    MessageLength,
    PitchDifference,
    Pitch {
        #[serde(default = "default_true")]
        savgol: bool,
        #[serde(default = "default_true")]
        shift: bool,
    },
    Phrase {
        levels: u32,
        exponent: f64,
    },
    Pattern {
        means: Vec<f64>,
        deviations: Vec<f64>,
        #[serde(default)]
        renormalize: bool,
    },
    Harmony {
        chord_score: Vec<f64>,
        allowed_chords: Vec<f64>,
        chords_per_bar: u32,
    },
    WeightedSum {
        parts: Vec<Recipe>,
        weights: Vec<f64>,
    },
    Multiply {
        parts: Vec<Recipe>,
    },
    LinearTransform {
        part: Box<Recipe>,
        scale: f64,
        offset: f64,
    },
    Shift {
        part: Box<Recipe>,
        amount: i64,
    },
}

impl Recipe {
    /// Recursively build the contour this recipe describes.
    pub fn build<R: Rng>(
        &self,
        tune: &Tune,
        transpose: i32,
        rng: &mut R,
    ) -> Result<Contour, ContourError> {
        match self {
            Recipe::Intensity {
                weights,
                random_weight,
                savgol,
                shift,
            } => super::intensity::compute(tune, weights, *random_weight, *savgol, *shift, rng),
            Recipe::Random { min, max } => super::shapes::random(tune, *min, *max, rng),
            Recipe::MessageLength => Ok(super::shapes::message_length(tune)),
            Recipe::PitchDifference => Ok(super::shapes::pitch_difference(tune)),
            Recipe::Pitch { savgol, shift } => Ok(super::shapes::pitch(tune, *savgol, *shift)),
            Recipe::Phrase { levels, exponent } => super::shapes::phrase(tune, *levels, *exponent),
            Recipe::Pattern {
                means,
                deviations,
                renormalize,
            } => super::shapes::pattern(tune, means, deviations, *renormalize, rng),
            Recipe::Harmony {
                chord_score,
                allowed_chords,
                chords_per_bar,
            } => super::harmony::compute(
                tune,
                chord_score,
                allowed_chords,
                *chords_per_bar,
                transpose,
                rng,
            ),
            Recipe::WeightedSum { parts, weights } => {
                let built = Self::build_parts(parts, tune, transpose, rng)?;
                let refs: Vec<&Contour> = built.iter().collect();
                super::weighted_sum(&refs, weights)
            }
            Recipe::Multiply { parts } => {
                let built = Self::build_parts(parts, tune, transpose, rng)?;
                let refs: Vec<&Contour> = built.iter().collect();
                super::multiply(&refs)
            }
            Recipe::LinearTransform {
                part,
                scale,
                offset,
            } => {
                let inner = part.build(tune, transpose, rng)?;
                super::linear_transform(&inner, *scale, *offset)
            }
            Recipe::Shift { part, amount } => {
                let inner = part.build(tune, transpose, rng)?;
                super::shift(&inner, *amount)
            }
        }
    }

    fn build_parts<R: Rng>(
        parts: &[Recipe],
        tune: &Tune,
        transpose: i32,
        rng: &mut R,
    ) -> Result<Vec<Contour>, ContourError> {
        if parts.is_empty() {
            return Err(ContourError::InvalidRecipe(
                "operator node has no parts".to_string(),
            ));
        }
        parts
            .iter()
            .map(|p| p.build(tune, transpose, rng))
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::score::{KeySignature, ScoreEvent, TimeSignature};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn small_tune() -> Tune {
        let mut events = Vec::new();
        for &p in &[60u8, 62, 64, 65, 67, 69, 71, 72] {
            events.push(ScoreEvent::NoteOn {
                pitch: p,
                velocity: 90,
                time: 0.0,
            });
            events.push(ScoreEvent::NoteOff { pitch: p, time: 0.5 });
        }
        Tune::from_parts(
            events,
            KeySignature::from_fifths(0, false),
            TimeSignature::new(4, 4),
            500_000,
            0.0,
            1,
        )
    }

    #[test]
    fn builds_a_composed_recipe_from_json() {
        let json = r#"{
            "type": "weighted_sum",
            "weights": [0.7, 0.3],
            "parts": [
                { "type": "phrase", "levels": 2, "exponent": 1.5 },
                { "type": "random", "min": 0.0, "max": 1.0 }
            ]
        }"#;
        let recipe: Recipe = serde_json::from_str(json).unwrap();
        let tune = small_tune();
        let mut rng = StdRng::seed_from_u64(21);
        let contour = recipe.build(&tune, 0, &mut rng).unwrap();
        assert_eq!(contour.len(), tune.note_on_count());
        for &v in contour.values().unwrap() {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn unknown_node_type_fails_at_deserialization() {
        let json = r#"{ "type": "sparkle" }"#;
        assert!(serde_json::from_str::<Recipe>(json).is_err());
    }

    #[test]
    fn empty_operator_is_an_invalid_recipe() {
        let recipe = Recipe::Multiply { parts: Vec::new() };
        let tune = small_tune();
        let mut rng = StdRng::seed_from_u64(22);
        assert!(matches!(
            recipe.build(&tune, 0, &mut rng),
            Err(ContourError::InvalidRecipe(_))
        ));
    }

    #[test]
    fn mismatched_weight_count_is_an_invalid_recipe() {
        let recipe = Recipe::WeightedSum {
            parts: vec![Recipe::MessageLength],
            weights: vec![0.5, 0.5],
        };
        let tune = small_tune();
        let mut rng = StdRng::seed_from_u64(23);
        assert!(matches!(
            recipe.build(&tune, 0, &mut rng),
            Err(ContourError::InvalidRecipe(_))
        ));
    }
}
