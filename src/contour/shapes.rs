//! Simple contour generators: noise, note features and deterministic shapes.

use super::{Contour, ContourError};
use crate::model::score::Tune;
use crate::util;
use rand::Rng;
use std::f64::consts::TAU;

/// Uniform i.i.d. samples in `[min, max]`, one per note-on.
pub fn random<R: Rng>(tune: &Tune, min: f64, max: f64, rng: &mut R) -> Result<Contour, ContourError> {
    if min > max {
        return Err(ContourError::InvalidRecipe(format!(
            "random contour range is inverted: [{min}, {max}]"
        )));
    }
    let count = tune.note_on_count();
    let values = (0..count)
        .map(|_| {
            if min == max {
                min
            } else {
                rng.random_range(min..=max)
            }
        })
        .collect();
    Ok(Contour::from_values(values))
}

/// Per-note duration in seconds, unfiltered.
pub fn message_length(tune: &Tune) -> Contour {
    Contour::from_values(tune.notes().iter().map(|n| n.duration).collect())
}

/// Signed semitone delta from the previous note (0 for the first).
pub fn pitch_difference(tune: &Tune) -> Contour {
    let notes = tune.notes();
    let mut values = Vec::with_capacity(notes.len());
    for (i, n) in notes.iter().enumerate() {
        if i == 0 {
            values.push(0.0);
        } else {
            values.push(n.pitch as f64 - notes[i - 1].pitch as f64);
        }
    }
    Contour::from_values(values)
}

/// Raw MIDI pitch per note, optionally smoothed into [0,1].
pub fn pitch(tune: &Tune, savgol: bool, shift: bool) -> Contour {
    let values: Vec<f64> = tune.notes().iter().map(|n| n.pitch as f64).collect();
    if savgol {
        Contour::from_values(util::scale_and_savgol(&values, shift))
    } else {
        Contour::from_values(values)
    }
}

/// A raised-cosine swell over the phrase period, sampled at each note onset.
///
/// The period spans 2^(levels-1) bars; `exponent` sharpens the peak.
pub fn phrase(tune: &Tune, levels: u32, exponent: f64) -> Result<Contour, ContourError> {
    if levels == 0 {
        return Err(ContourError::InvalidRecipe(
            "phrase levels must be at least 1".to_string(),
        ));
    }
    let period = tune.bar_duration() * f64::from(1u32 << (levels - 1));
    let values = tune
        .notes()
        .iter()
        .map(|n| {
            let position = n.onset.rem_euclid(period) / period;
            ((1.0 - (TAU * position).cos()) / 2.0).powf(exponent)
        })
        .collect();
    Ok(Contour::from_values(values))
}

/// A per-slot gaussian template tiled across the bar; each note samples the
/// slot its onset falls in. With `renormalize`, samples inside each bar are
/// rescaled so their sum matches the template's.
pub fn pattern<R: Rng>(
    tune: &Tune,
    means: &[f64],
    deviations: &[f64],
    renormalize: bool,
    rng: &mut R,
) -> Result<Contour, ContourError> {
    if means.is_empty() || means.len() != deviations.len() {
        return Err(ContourError::InvalidRecipe(
            "pattern means and deviations must be non-empty and equally long".to_string(),
        ));
    }

    let notes = tune.notes();
    let bar = tune.bar_duration();
    let slot_duration = bar / means.len() as f64;

    let mut values = Vec::with_capacity(notes.len());
    let mut slots = Vec::with_capacity(notes.len());
    let mut bars = Vec::with_capacity(notes.len());
    for n in &notes {
        let slot = ((n.onset.rem_euclid(bar) / slot_duration) as usize).min(means.len() - 1);
        slots.push(slot);
        bars.push((n.onset / bar).floor() as i64);
        values.push(util::gaussian(rng, means[slot], deviations[slot]).max(0.0));
    }

    if renormalize {
        let mut i = 0;
        while i < values.len() {
            let mut j = i;
            let mut target = 0.0;
            let mut actual = 0.0;
            while j < values.len() && bars[j] == bars[i] {
                target += means[slots[j]];
                actual += values[j];
                j += 1;
            }
            if actual > 0.0 {
                let scale = target / actual;
                for v in values[i..j].iter_mut() {
                    *v *= scale;
                }
            }
            i = j;
        }
    }

    Ok(Contour::from_values(values))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::score::{KeySignature, ScoreEvent, TimeSignature};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn quarter_tune(pitches: &[u8]) -> Tune {
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
    fn random_respects_its_range() {
        let tune = quarter_tune(&[60, 62, 64, 65]);
        let mut rng = StdRng::seed_from_u64(11);
        let contour = random(&tune, 0.25, 0.75, &mut rng).unwrap();
        assert_eq!(contour.len(), 4);
        for &v in contour.values().unwrap() {
            assert!((0.25..=0.75).contains(&v));
        }
    }

    #[test]
    fn message_length_reports_durations() {
        let tune = quarter_tune(&[60, 62]);
        let contour = message_length(&tune);
        for &v in contour.values().unwrap() {
            assert!((v - 0.5).abs() < 1e-9);
        }
    }

    #[test]
    fn pitch_difference_starts_at_zero() {
        let tune = quarter_tune(&[60, 67, 64]);
        let contour = pitch_difference(&tune);
        assert_eq!(contour.values().unwrap(), &[0.0, 7.0, -3.0]);
    }

    #[test]
    fn phrase_peaks_mid_period() {
        let tune = quarter_tune(&[60; 16]);
        let contour = phrase(&tune, 2, 1.0).unwrap();
        let values = contour.values().unwrap();
        // period is two bars (4 seconds): note 4 (2 s in) sits at the peak,
        // note 8 lands on the period boundary where the curve returns to 0
        assert!((values[4] - 1.0).abs() < 1e-9);
        assert!(values[0] < 1e-9);
        assert!(values[8] < 1e-9);
        for &v in values {
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn pattern_renormalization_conserves_bar_sums() {
        let tune = quarter_tune(&[60; 8]);
        let mut rng = StdRng::seed_from_u64(12);
        let means = [1.2, 0.8, 1.0, 1.0];
        let deviations = [0.3, 0.3, 0.3, 0.3];
        let contour = pattern(&tune, &means, &deviations, true, &mut rng).unwrap();
        let values = contour.values().unwrap();
        let target: f64 = means.iter().sum();
        for bar in values.chunks(4) {
            assert!((bar.iter().sum::<f64>() - target).abs() < 1e-9);
        }
    }
}
