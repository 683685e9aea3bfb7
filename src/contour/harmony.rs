//! Windowed chord estimation.
//!
//! The tune is cut into fixed-size time windows (a bar divided by
//! `chords_per_bar`); each window gets one chord, encoded per note as
//! `root + 12 * quality` (0 major, 1 minor, 2 diminished).

use super::{Contour, ContourError};
use crate::model::score::Tune;
use rand::Rng;
use rand::seq::IndexedRandom;

pub const QUALITY_MAJOR: i32 = 0;
pub const QUALITY_MINOR: i32 = 1;
pub const QUALITY_DIMINISHED: i32 = 2;

pub fn compute<R: Rng>(
    tune: &Tune,
    chord_score: &[f64],
    allowed_chords: &[f64],
    chords_per_bar: u32,
    transpose: i32,
    rng: &mut R,
) -> Result<Contour, ContourError> {
    if chord_score.len() != 12 || allowed_chords.len() != 12 {
        return Err(ContourError::InvalidRecipe(
            "harmony templates must have exactly 12 entries".to_string(),
        ));
    }
    if chords_per_bar == 0 {
        return Err(ContourError::InvalidRecipe(
            "chords_per_bar must be at least 1".to_string(),
        ));
    }

    let notes = tune.notes();
    if notes.is_empty() {
        return Ok(Contour::from_values(Vec::new()));
    }

    let classes: Vec<usize> = notes
        .iter()
        .map(|n| (n.pitch as i32 + transpose).rem_euclid(12) as usize)
        .collect();
    let onsets: Vec<f64> = notes.iter().map(|n| n.onset).collect();

    let window = tune.bar_duration() / chords_per_bar as f64;
    let first = onsets.iter().cloned().fold(f64::INFINITY, f64::min);
    let last = onsets.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let root_rotation = tune.key().root as usize;
    let mut values = vec![0.0; notes.len()];

    let mut start = first;
    while start <= last + 1e-9 {
        // pickup notes get one window of their own, closed at the bar line
        let stop = if start < 0.0 { 0.0 } else { start + window };

        let members: Vec<usize> = (0..notes.len())
            .filter(|&i| onsets[i] >= start - 1e-9 && onsets[i] < stop - 1e-9)
            .collect();

        if !members.is_empty() {
            // accumulate the chord profile rolled to each sounding class
            let mut raw = [0.0f64; 12];
            for &i in &members {
                for (k, slot) in raw.iter_mut().enumerate() {
                    *slot += chord_score[(k + 12 - classes[i]) % 12];
                }
            }

            let mut masked = [0.0f64; 12];
            for (k, slot) in masked.iter_mut().enumerate() {
                *slot = raw[k] * allowed_chords[(k + 12 - root_rotation) % 12];
            }

            let peak = masked.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let tied: Vec<usize> = (0..12).filter(|&k| (masked[k] - peak).abs() < 1e-9).collect();
            let root = *tied.choose(rng).unwrap_or(&0);

            // quality from the unmasked profile around the chosen root
            let mut quality = QUALITY_MAJOR;
            if raw[(root + 3) % 12] > raw[(root + 4) % 12] {
                quality = QUALITY_MINOR;
                if raw[(root + 6) % 12] > raw[(root + 7) % 12] {
                    quality = QUALITY_DIMINISHED;
                }
            }

            let encoded = (root as i32 + 12 * quality) as f64;
            for &i in &members {
                values[i] = encoded;
            }
        }

        start = stop;
    }

    Ok(Contour::from_values(values))
}
