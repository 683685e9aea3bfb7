use rand::Rng;

/// Tolerance (in beats) within which a note is considered to land on a beat.
///
/// Derived from the shortest humanly playable note length.
pub const TRIGGER_DELTA: f64 = 0.05;

/// MIDI real-time clock pulses per quarter note.
pub const CLOCK_PPQN: u32 = 24;

/// Semitones to the next scale tone above, indexed by semitones from the tonic.
pub const ABOVE_APPROACH_SCALE: [i8; 12] = [2, 1, 2, 1, 1, 2, 1, 2, 1, 2, 1, 1];

/// Semitones to the next scale tone below, indexed by semitones from the tonic.
pub const BELOW_APPROACH_SCALE: [i8; 12] = [-1, -1, -2, -1, -2, -1, -1, -2, -1, -2, -1, -2];

/// Whether a pitch at the given distance from the tonic sits outside the scale
/// and needs quantization when injected as an error.
pub const NEEDS_PITCH_QUANTIZATION: [bool; 12] = [
    false, true, false, true, false, false, true, false, true, false, true, false,
];

/// Convert beats per minute to MIDI tempo (microseconds per quarter note).
pub fn bpm_to_tempo(bpm: f64) -> u32 {
    (60_000_000.0 / bpm).round() as u32
}

/// Convert MIDI tempo (microseconds per quarter note) to beats per minute.
pub fn tempo_to_bpm(tempo: u32) -> f64 {
    60_000_000.0 / tempo as f64
}

/// Chord tones in semitones from the root for a given harmony code.
///
/// Codes 0-11 are major chords, 12-23 minor, 24-35 diminished, 36-47 augmented;
/// the code modulo 12 is the root pitch class.
pub fn chord_pitches(harmony: i32) -> [i32; 3] {
    let mut third = 4;
    let mut fifth = 7;

    match harmony.div_euclid(12) {
        1 => third = 3,
        2 => {
            third = 3;
            fifth = 6;
        }
        3 => fifth = 8,
        _ => {}
    }

    [0, third, fifth]
}

/// Note name with octave for a MIDI note number, e.g. 62 -> "D4".
pub fn note_name(note: u8) -> String {
    const NAMES: [&str; 12] = [
        "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
    ];
    format!("{}{}", NAMES[(note % 12) as usize], (note / 12) as i32 - 1)
}

/// Sample a gaussian via the Box-Muller transform.
pub fn gaussian<R: Rng>(rng: &mut R, mean: f64, std_dev: f64) -> f64 {
    if std_dev == 0.0 {
        return mean;
    }
    let u1: f64 = rng.random_range(f64::EPSILON..1.0);
    let u2: f64 = rng.random_range(0.0..1.0);
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    mean + std_dev * z
}

// Savitzky-Golay least-squares coefficients for window 15, polynomial order 3.
const SAVGOL_WINDOW: usize = 15;
const SAVGOL_NORM: f64 = 1105.0;
const SAVGOL_KERNEL: [f64; SAVGOL_WINDOW] = [
    -78.0, -13.0, 42.0, 87.0, 122.0, 147.0, 162.0, 167.0, 162.0, 147.0, 122.0, 87.0, 42.0, -13.0,
    -78.0,
];

/// Smooth an array with a centered Savitzky-Golay filter (window 15, order 3),
/// padding both ends with the array mean so the boundary stays stable.
pub fn savgol_smooth(values: &[f64]) -> Vec<f64> {
    if values.is_empty() {
        return Vec::new();
    }

    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let half = SAVGOL_WINDOW / 2;

    let mut padded = Vec::with_capacity(values.len() + 2 * SAVGOL_WINDOW);
    padded.extend(std::iter::repeat_n(mean, SAVGOL_WINDOW));
    padded.extend_from_slice(values);
    padded.extend(std::iter::repeat_n(mean, SAVGOL_WINDOW));

    let mut out = Vec::with_capacity(values.len());
    for i in SAVGOL_WINDOW..SAVGOL_WINDOW + values.len() {
        let mut acc = 0.0;
        for (k, coeff) in SAVGOL_KERNEL.iter().enumerate() {
            acc += coeff * padded[i + k - half];
        }
        out.push(acc / SAVGOL_NORM);
    }

    out
}

/// Min-max scale to [0,1], smooth, optionally shift the mean toward 0.5
/// without leaving [0,1], then clamp.
pub fn scale_and_savgol(values: &[f64], shift: bool) -> Vec<f64> {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let scaled: Vec<f64> = if max > min {
        values.iter().map(|v| (v - min) / (max - min)).collect()
    } else {
        values.iter().map(|_| 0.0).collect()
    };

    let mut smoothed = savgol_smooth(&scaled);

    if shift && !smoothed.is_empty() {
        let mean = smoothed.iter().sum::<f64>() / smoothed.len() as f64;
        let peak = smoothed.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let delta = (0.5 - mean).min(1.0 - peak);
        for v in smoothed.iter_mut() {
            *v += delta;
        }
    }

    for v in smoothed.iter_mut() {
        *v = v.clamp(0.0, 1.0);
    }

    smoothed
}
