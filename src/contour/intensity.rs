//! The O'Canainn-style intensity contour: a weighted sum of five
//! musicological feature scores, optionally mixed with noise and smoothed.

use super::{Contour, ContourError};
use crate::model::score::{Note, Tune};
use crate::util;
use rand::Rng;
use std::collections::HashMap;

const FEATURE_COUNT: usize = 5;

/// Compute the intensity contour for a tune.
///
/// `weights` weigh, in order, the frequency, beat, ambitus, leap and length
/// scores; they are renormalized by their absolute sum and a negative weight
/// inverts its feature. `random_weight` mixes in uniform noise;
/// `savgol`/`shift` control the final smoothing step.
pub fn compute<R: Rng>(
    tune: &Tune,
    weights: &[f64],
    random_weight: f64,
    savgol: bool,
    shift: bool,
    rng: &mut R,
) -> Result<Contour, ContourError> {
    if weights.len() != FEATURE_COUNT {
        return Err(ContourError::InvalidRecipe(format!(
            "intensity contour needs {FEATURE_COUNT} feature weights, got {}",
            weights.len()
        )));
    }
    if !(0.0..=1.0).contains(&random_weight) {
        return Err(ContourError::InvalidRecipe(
            "random_weight must lie in [0,1]".to_string(),
        ));
    }

    let notes = tune.notes();
    let features = ocanainn_scores(tune, &notes);

    let total: f64 = weights.iter().map(|w| w.abs()).sum();
    if total == 0.0 {
        return Err(ContourError::InvalidRecipe(
            "intensity weights must not all be zero".to_string(),
        ));
    }

    let mut values = vec![0.0; notes.len()];
    for (feature, &weight) in features.iter().zip(weights) {
        let w = weight.abs() / total;
        for (slot, &score) in values.iter_mut().zip(feature) {
            *slot += w * if weight < 0.0 { 1.0 - score } else { score };
        }
    }

    if random_weight > 0.0 {
        for slot in values.iter_mut() {
            *slot = *slot * (1.0 - random_weight) + rng.random::<f64>() * random_weight;
        }
    }

    if savgol {
        values = util::scale_and_savgol(&values, shift);
    } else {
        for slot in values.iter_mut() {
            *slot = slot.clamp(0.0, 1.0);
        }
    }

    Ok(Contour::from_values(values))
}

/// The five per-note feature scores, each in [0,1].
pub fn ocanainn_scores(tune: &Tune, notes: &[Note]) -> [Vec<f64>; FEATURE_COUNT] {
    let classes: Vec<u8> = notes.iter().map(|n| n.pitch % 12).collect();

    // frequency score: pitch-class occurrence counts
    let mut class_counts: HashMap<u8, usize> = HashMap::new();
    for &c in &classes {
        *class_counts.entry(c).or_insert(0) += 1;
    }
    let frequency = min_max_normalize(
        classes
            .iter()
            .map(|c| class_counts[c] as f64)
            .collect::<Vec<f64>>(),
    );

    // beat score: pitch-class counts among on-beat notes, zero elsewhere
    let on_beat: Vec<bool> = notes.iter().map(|n| tune.is_on_beat(n.onset)).collect();
    let mut beat_counts: HashMap<u8, usize> = HashMap::new();
    for (i, &c) in classes.iter().enumerate() {
        if on_beat[i] {
            *beat_counts.entry(c).or_insert(0) += 1;
        }
    }
    let beat = min_max_normalize(
        classes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if on_beat[i] {
                    *beat_counts.get(c).unwrap_or(&0) as f64
                } else {
                    0.0
                }
            })
            .collect::<Vec<f64>>(),
    );

    // ambitus score: global extremes
    let (lowest, highest) = tune.ambitus();
    let ambitus: Vec<f64> = notes
        .iter()
        .map(|n| {
            if n.pitch == lowest || n.pitch == highest {
                1.0
            } else {
                0.0
            }
        })
        .collect();

    // leap score: pitch-class counts among notes reached by an upward leap
    let mut leap_flags = vec![false; notes.len()];
    for i in 1..notes.len() {
        if notes[i].pitch as i32 - notes[i - 1].pitch as i32 >= 7 {
            leap_flags[i] = true;
        }
    }
    let mut leap_counts: HashMap<u8, usize> = HashMap::new();
    for (i, &c) in classes.iter().enumerate() {
        if leap_flags[i] {
            *leap_counts.entry(c).or_insert(0) += 1;
        }
    }
    let leap = min_max_normalize(
        classes
            .iter()
            .enumerate()
            .map(|(i, c)| {
                if leap_flags[i] {
                    *leap_counts.get(c).unwrap_or(&0) as f64
                } else {
                    0.0
                }
            })
            .collect::<Vec<f64>>(),
    );

    // length score: longer than the single most common duration
    let modal = modal_duration(notes);
    let length: Vec<f64> = notes
        .iter()
        .map(|n| if n.duration > modal + 1e-9 { 1.0 } else { 0.0 })
        .collect();

    [frequency, beat, ambitus, leap, length]
}

fn min_max_normalize(mut values: Vec<f64>) -> Vec<f64> {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max > min {
        for v in values.iter_mut() {
            *v = (*v - min) / (max - min);
        }
    }
    values
}

/// The single most common note duration, grouping near-equal floats.
fn modal_duration(notes: &[Note]) -> f64 {
    let mut durations: Vec<f64> = notes.iter().map(|n| n.duration).collect();
    durations.sort_by(|a, b| a.total_cmp(b));

    let mut best = (0.0, 0usize);
    let mut i = 0;
    while i < durations.len() {
        let mut j = i;
        while j < durations.len() && durations[j] - durations[i] < 1e-6 {
            j += 1;
        }
        if j - i > best.1 {
            best = (durations[i], j - i);
        }
        i = j;
    }

    best.0
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::score::{KeySignature, ScoreEvent, TimeSignature};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn tune_with_pitches(pitches: &[u8]) -> Tune {
        let mut events = Vec::new();
        for &p in pitches {
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
    fn length_matches_note_on_count() {
        let tune = tune_with_pitches(&[60, 62, 64, 65, 67, 69, 71, 72]);
        let mut rng = StdRng::seed_from_u64(1);
        let contour =
            compute(&tune, &[0.2, 0.3, 0.1, 0.2, 0.2], 0.1, true, false, &mut rng).unwrap();
        assert_eq!(contour.len(), tune.note_on_count());
    }

    #[test]
    fn values_stay_in_unit_range() {
        let tune = tune_with_pitches(&[60, 72, 60, 64, 67, 60, 55, 62, 64, 60, 71, 72]);
        let mut rng = StdRng::seed_from_u64(2);
        for savgol in [false, true] {
            let contour = compute(
                &tune,
                &[0.25, 0.1, 0.3, 0.25, 0.1],
                0.3,
                savgol,
                true,
                &mut rng,
            )
            .unwrap();
            for &v in contour.values().unwrap() {
                assert!((0.0..=1.0).contains(&v), "{v} out of range");
            }
        }
    }

    #[test]
    fn ambitus_marks_extremes_only() {
        let tune = tune_with_pitches(&[60, 64, 72, 55, 62]);
        let notes = tune.notes();
        let [_, _, ambitus, _, _] = ocanainn_scores(&tune, &notes);
        assert_eq!(ambitus, vec![0.0, 0.0, 1.0, 1.0, 0.0]);
    }

    #[test]
    fn leap_requires_seven_semitones_up() {
        let tune = tune_with_pitches(&[60, 67, 74, 73]);
        let notes = tune.notes();
        let [_, _, _, leap, _] = ocanainn_scores(&tune, &notes);
        assert_eq!(leap[0], 0.0); // first note never leaps
        assert!(leap[1] > 0.0);
        assert!(leap[2] > 0.0);
        assert_eq!(leap[3], 0.0); // downward step
    }

    #[test]
    fn wrong_weight_count_is_a_recipe_error() {
        let tune = tune_with_pitches(&[60, 62]);
        let mut rng = StdRng::seed_from_u64(3);
        assert!(matches!(
            compute(&tune, &[1.0, 1.0], 0.0, false, false, &mut rng),
            Err(ContourError::InvalidRecipe(_))
        ));
    }
}
