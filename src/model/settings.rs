use crate::contour::recipe::Recipe;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;

/// Settings for one generated contour: O'Canainn feature weights, noise
/// weight, smoothing toggles and the ensemble-following blend factor.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ContourSettings {
    pub weights: Vec<f64>,
    pub random_weight: f64,
    pub savgol: bool,
    pub shift: bool,
    /// Blend toward the external intensity value, in [-1,1]; negative
    /// inverts the intensity before blending.
    pub human_impact: f64,
    /// Velocity only: how much raw pitch height contributes on top of
    /// the feature sum.
    pub high_loud_weight: f64,
}

impl Default for ContourSettings {
    fn default() -> Self {
        Self {
            weights: vec![0.2, 0.3, 0.1, 0.2, 0.2],
            random_weight: 0.2,
            savgol: true,
            shift: false,
            human_impact: 0.0,
            high_loud_weight: 0.25,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct OrnamentProbabilities {
    pub cut: f64,
    pub roll: f64,
    pub slide: f64,
    pub drop: f64,
    pub error: f64,
}

impl Default for OrnamentProbabilities {
    fn default() -> Self {
        Self {
            cut: 1.0,
            roll: 1.0,
            slide: 1.0,
            drop: 0.1,
            error: 0.1,
        }
    }
}

/// Scalar performance parameters.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Values {
    pub bend_resolution: u32,
    pub cut_eighth_fraction: f64,
    pub cut_velocity_fraction: f64,
    pub roll_eighth_fraction: f64,
    pub slide_eighth_fraction: f64,
    /// Minimum absolute pitch jump (semitones) that makes a slide eligible.
    pub slide_pitch_threshold: i32,
    /// Maximum tempo deviation, in BPM, reached at tempo-contour extremes.
    pub tempo_warp_bpm: f64,
    pub beat_velocity_increase: u8,
    pub midi_channel: u8,
    /// Overrides the tune's own tempo when set.
    pub bpm: Option<f64>,
    pub transpose: i32,
    pub min_velocity: u8,
    pub max_velocity: u8,
    pub max_pitch_error: i8,
    pub min_pitch_error: i8,
    pub diatonic_errors: bool,
    /// Fraction of a note's length shaved off the note-off at full phrasing.
    pub legato_shave: f64,
    pub seed: u64,
}

impl Default for Values {
    fn default() -> Self {
        Self {
            bend_resolution: 32,
            cut_eighth_fraction: 0.2,
            cut_velocity_fraction: 0.8,
            roll_eighth_fraction: 0.8,
            slide_eighth_fraction: 0.66,
            slide_pitch_threshold: 6,
            tempo_warp_bpm: 10.0,
            beat_velocity_increase: 16,
            midi_channel: 0,
            bpm: None,
            transpose: 0,
            min_velocity: 0,
            max_velocity: 127,
            max_pitch_error: 2,
            min_pitch_error: -2,
            diatonic_errors: true,
            legato_shave: 0.2,
            seed: 42,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct HarmonySettings {
    /// Chord-compatibility profile per semitone from the chord root.
    pub chord_score: Vec<f64>,
    /// Which chord roots the key admits, per semitone from the tonic.
    pub allowed_chords: Vec<f64>,
    pub chords_per_bar: u32,
}

impl Default for HarmonySettings {
    fn default() -> Self {
        Self {
            chord_score: vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.25, 0.25, 0.0, 0.0],
            allowed_chords: vec![2.0, 0.0, 1.0, 0.0, 1.0, 2.0, 0.0, 2.0, 0.0, 1.0, 0.0, 0.0],
            chords_per_bar: 2,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct DroneSettings {
    pub active: bool,
    /// Contour whose current value gates the drone.
    pub contour: String,
    pub threshold: f64,
    /// Open-string style pitches always available regardless of harmony.
    pub allowed_notes: Vec<u8>,
    /// Beats between drone retriggers.
    pub retrigger_beats: f64,
}

impl Default for DroneSettings {
    fn default() -> Self {
        Self {
            active: false,
            contour: "intensity".to_string(),
            threshold: 0.6,
            allowed_notes: vec![55, 62, 69, 76],
            retrigger_beats: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SwingSettings {
    /// 0 disables; 1 pulls off-eighths all the way to the triplet position.
    pub amount: f64,
}

impl Default for SwingSettings {
    fn default() -> Self {
        Self { amount: 0.0 }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PhraseSettings {
    /// Phrase period spans 2^(levels-1) bars.
    pub levels: u32,
    pub exponent: f64,
}

impl Default for PhraseSettings {
    fn default() -> Self {
        Self {
            levels: 3,
            exponent: 2.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PatternSettings {
    pub active: bool,
    /// Per-slot gaussian means, tiled across the bar.
    pub means: Vec<f64>,
    pub deviations: Vec<f64>,
    /// Keep each bar's value sum constant.
    pub renormalize: bool,
}

impl Default for PatternSettings {
    fn default() -> Self {
        Self {
            active: false,
            means: vec![1.0],
            deviations: vec![0.0],
            renormalize: false,
        }
    }
}

/// The full merged performance configuration.
///
/// Defaults reproduce a plain but expressive rendition; a JSON file can
/// override any subset of leaves via [`GrooverConfig::load`].
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct GrooverConfig {
    pub velocity: ContourSettings,
    pub tempo: ContourSettings,
    pub ornament: ContourSettings,
    pub probabilities: OrnamentProbabilities,
    pub values: Values,
    /// Contour name to MIDI controller number, announced on every note-on.
    /// Ordered so emission and seed derivation stay deterministic.
    pub automation: BTreeMap<String, u8>,
    pub harmony: HarmonySettings,
    pub drone: DroneSettings,
    pub swing: SwingSettings,
    pub phrase: PhraseSettings,
    pub pattern: PatternSettings,
    /// Per-note approach overrides, keyed by note name (e.g. "D4"),
    /// mapping to the MIDI pitch to approach from.
    pub approach_from_above: BTreeMap<String, u8>,
    pub approach_from_below: BTreeMap<String, u8>,
    /// Extra declarative contours, built at startup.
    pub contours: BTreeMap<String, Recipe>,
}

impl GrooverConfig {
    /// Contour names every groover always owns.
    pub const BUILTIN_CONTOURS: [&'static str; 8] = [
        "velocity",
        "tempo",
        "ornament",
        "message length",
        "pitch difference",
        "phrase",
        "pattern",
        "harmony",
    ];

    fn base() -> Self {
        let mut config = Self {
            tempo: ContourSettings {
                weights: vec![0.25, 0.1, 0.3, 0.25, 0.1],
                shift: true,
                ..Default::default()
            },
            ornament: ContourSettings {
                weights: vec![0.2, 0.35, 0.15, 0.15, 0.2],
                ..Default::default()
            },
            ..Default::default()
        };
        config.automation.insert("velocity".to_string(), 46);
        config.automation.insert("tempo".to_string(), 47);
        config.automation.insert("ornament".to_string(), 48);
        config.automation.insert("intensity".to_string(), 49);
        config
    }

    /// Defaults merged with an optional JSON override file
    /// (last-writer-wins per leaf), validated once.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::base())?;

        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let overlay: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
            deep_merge(&mut merged, overlay);
        }

        let config: Self = serde_json::from_value(merged).context("malformed configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Fail fast on structural mistakes before any playback starts.
    pub fn validate(&self) -> Result<()> {
        for (name, settings) in [
            ("velocity", &self.velocity),
            ("tempo", &self.tempo),
            ("ornament", &self.ornament),
        ] {
            if settings.weights.len() != 5 {
                bail!(
                    "{name} contour needs exactly 5 feature weights, got {}",
                    settings.weights.len()
                );
            }
            if !(-1.0..=1.0).contains(&settings.human_impact) {
                bail!("{name} human_impact must lie in [-1,1]");
            }
        }

        if self.harmony.chord_score.len() != 12 || self.harmony.allowed_chords.len() != 12 {
            bail!("harmony templates must have exactly 12 entries");
        }
        if self.harmony.chords_per_bar == 0 {
            bail!("chords_per_bar must be at least 1");
        }

        for (name, p) in [
            ("cut", self.probabilities.cut),
            ("roll", self.probabilities.roll),
            ("slide", self.probabilities.slide),
            ("drop", self.probabilities.drop),
            ("error", self.probabilities.error),
        ] {
            if !(0.0..=1.0).contains(&p) {
                bail!("ornament probability for {name} must lie in [0,1]");
            }
        }

        if self.values.bend_resolution == 0 {
            bail!("bend_resolution must be at least 1");
        }
        if self.values.min_velocity > self.values.max_velocity {
            bail!("min_velocity exceeds max_velocity");
        }
        if self.values.min_pitch_error > self.values.max_pitch_error {
            bail!("min_pitch_error exceeds max_pitch_error");
        }
        if !(0.0..=1.0).contains(&self.values.legato_shave) {
            bail!("legato_shave must lie in [0,1]");
        }

        if self.pattern.means.is_empty() || self.pattern.means.len() != self.pattern.deviations.len()
        {
            bail!("pattern means and deviations must be non-empty and equally long");
        }

        for name in self.automation.keys() {
            let known = Self::BUILTIN_CONTOURS.contains(&name.as_str())
                || name == "intensity"
                || name == "human_impact"
                || self.contours.contains_key(name);
            if !known {
                bail!("automation maps unknown contour '{name}'");
            }
        }

        if self.drone.active {
            let known = Self::BUILTIN_CONTOURS.contains(&self.drone.contour.as_str())
                || self.drone.contour == "intensity"
                || self.contours.contains_key(&self.drone.contour);
            if !known {
                bail!("drone gates on unknown contour '{}'", self.drone.contour);
            }
            if self.drone.retrigger_beats <= 0.0 {
                bail!("drone retrigger_beats must be positive");
            }
        }

        Ok(())
    }

    /// RNG seed derived from the whole merged config, so identical
    /// config+seed gives identical performances.
    pub fn derived_seed(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        if let Ok(text) = serde_json::to_string(self) {
            text.hash(&mut hasher);
        }
        hasher.finish().wrapping_add(self.values.seed)
    }
}

/// Recursive JSON merge, overlay leaves win.
fn deep_merge(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => deep_merge(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}
