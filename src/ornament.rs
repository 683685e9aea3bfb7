//! Ornament selection policy.
//!
//! Each kind carries an eligibility rule over the current note context;
//! selection renormalizes the configured probabilities of the eligible
//! kinds into a proper distribution with an explicit no-ornament residual.

use crate::model::settings::OrnamentProbabilities;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrnamentKind {
    /// Short grace note from above, immediately before the main note.
    Cut,
    /// Five-segment turn around the main note.
    Roll,
    /// Continuous pitch-bend ramp into the main note from below.
    Slide,
    /// Placeholder that consumes nothing and emits nothing.
    Drop,
    /// A deliberately wrong pitch, cut short.
    Error,
}

/// Note context the eligibility rules look at.
#[derive(Debug, Clone, Copy)]
pub struct OrnamentContext {
    /// Wall-clock length of the note at the current tempo.
    pub note_length: f64,
    /// Eighth-note duration at the current tempo.
    pub eighth_duration: f64,
    /// Minimum note length for a slide on a beat.
    pub slide_duration: f64,
    pub on_beat: bool,
    /// Semitone delta from the previous note.
    pub pitch_difference: f64,
    pub slide_pitch_threshold: i32,
}

impl OrnamentKind {
    pub const ALL: [OrnamentKind; 5] = [
        OrnamentKind::Cut,
        OrnamentKind::Roll,
        OrnamentKind::Slide,
        OrnamentKind::Drop,
        OrnamentKind::Error,
    ];

    pub fn eligible(&self, ctx: &OrnamentContext) -> bool {
        match self {
            OrnamentKind::Cut => {
                ctx.note_length >= 0.75 * ctx.eighth_duration
                    && (ctx.on_beat || ctx.pitch_difference == 0.0)
            }
            // needs the value of a dotted quarter
            OrnamentKind::Roll => ctx.note_length - 3.0 * ctx.eighth_duration > -0.01,
            OrnamentKind::Slide => {
                (ctx.on_beat && ctx.note_length > ctx.slide_duration)
                    || ctx.pitch_difference >= ctx.slide_pitch_threshold as f64
            }
            OrnamentKind::Drop => !ctx.on_beat,
            OrnamentKind::Error => true,
        }
    }

    pub fn probability(&self, probabilities: &OrnamentProbabilities) -> f64 {
        match self {
            OrnamentKind::Cut => probabilities.cut,
            OrnamentKind::Roll => probabilities.roll,
            OrnamentKind::Slide => probabilities.slide,
            OrnamentKind::Drop => probabilities.drop,
            OrnamentKind::Error => probabilities.error,
        }
    }
}

/// Sample an ornament kind for the current note, or `None` for a plain note.
///
/// Probabilities of eligible kinds are kept as-is when they sum to at most 1
/// (the remainder is the no-ornament mass) and renormalized when they exceed 1.
pub fn choose<R: Rng>(
    probabilities: &OrnamentProbabilities,
    ctx: &OrnamentContext,
    rng: &mut R,
) -> Option<OrnamentKind> {
    let weighted: Vec<(OrnamentKind, f64)> = OrnamentKind::ALL
        .iter()
        .filter(|kind| kind.eligible(ctx))
        .map(|kind| (*kind, kind.probability(probabilities)))
        .filter(|(_, p)| *p > 0.0)
        .collect();

    let total: f64 = weighted.iter().map(|(_, p)| p).sum();
    if total <= 0.0 {
        return None;
    }
    let scale = if total > 1.0 { 1.0 / total } else { 1.0 };

    let draw = rng.random::<f64>();
    let mut cumulative = 0.0;
    for (kind, p) in weighted {
        cumulative += p * scale;
        if draw < cumulative {
            return Some(kind);
        }
    }
    None
}
