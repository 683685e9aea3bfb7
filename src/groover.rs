//! The performance state machine.
//!
//! A [`Groover`] owns the tune's contours and turns raw score events into
//! performed events: timing and tempo warp, velocity shaping, pitch errors,
//! ornament expansion, drone accompaniment and swing. Shared state sits
//! behind locks so a synchronization thread can seek and retune while the
//! playback thread performs.

use crate::contour::{self, Contour, ContourError};
use crate::model::score::{ScoreEvent, Tune};
use crate::model::settings::GrooverConfig;
use crate::ornament::{self, OrnamentContext, OrnamentKind};
use crate::util::{
    self, ABOVE_APPROACH_SCALE, BELOW_APPROACH_SCALE, CLOCK_PPQN, NEEDS_PITCH_QUANTIZATION,
    TRIGGER_DELTA,
};
use anyhow::{Result, anyhow};
use log::{debug, warn};
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GrooverError {
    #[error("unknown contour '{0}'")]
    UnknownContour(String),
    #[error(transparent)]
    Contour(#[from] ContourError),
}

/// Runtime value names that are not backed by a contour.
const INTENSITY: &str = "intensity";
const HUMAN_IMPACT: &str = "human_impact";

/// Minimum clock pulses before the external tempo estimate is trusted.
const CLOCK_WARMUP_PULSES: usize = 4;
const CLOCK_HISTORY: usize = CLOCK_PPQN as usize;

struct GrooverState {
    contours: HashMap<String, Contour>,
    values: HashMap<String, f64>,
    /// In-flight wrong notes, keyed by the sounding (transposed) pitch.
    pitch_errors: HashMap<u8, i8>,
    /// Pitches whose note-on was swallowed; their note-off is too.
    absorbed: HashSet<u8>,
    event_index: usize,
    performance_time: f64,
    /// Wall time owed by a previous ornament, subtracted from the next note.
    offset: f64,
    /// Legato shave carried into the next note-on.
    pending_delay: f64,
    drone_pitch: Option<u8>,
    drone_slot: Option<i64>,
    rng: StdRng,
}

struct ClockEstimator {
    last_pulse: Option<Instant>,
    deltas: VecDeque<f64>,
}

impl ClockEstimator {
    fn pulse(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_pulse {
            self.deltas.push_back(now.duration_since(last).as_secs_f64());
            if self.deltas.len() > CLOCK_HISTORY {
                self.deltas.pop_front();
            }
        }
        self.last_pulse = Some(now);
    }

    fn reset(&mut self) {
        self.last_pulse = None;
        self.deltas.clear();
    }

    /// Estimated tempo in microseconds per quarter, if enough pulses arrived.
    fn tempo(&self) -> Option<u32> {
        if self.deltas.len() < CLOCK_WARMUP_PULSES {
            return None;
        }
        let mean = self.deltas.iter().sum::<f64>() / self.deltas.len() as f64;
        Some((mean * CLOCK_PPQN as f64 * 1e6).round() as u32)
    }
}

pub struct Groover {
    tune: Arc<Tune>,
    config: GrooverConfig,
    /// Nominal tempo in microseconds per quarter (user bpm or the tune's).
    user_tempo: u32,
    transpose: i32,
    state: Mutex<GrooverState>,
    /// One-shot tempo set by the synchronization thread, microseconds per quarter.
    tempo_override: Mutex<Option<u32>>,
    clock: Mutex<ClockEstimator>,
}

impl Groover {
    /// Build every contour and seed the generator; identical tune, config
    /// and seed give identical performances.
    pub fn new(tune: Arc<Tune>, config: GrooverConfig) -> Result<Self> {
        config.validate()?;

        let mut rng = StdRng::seed_from_u64(config.derived_seed());
        let transpose = config.values.transpose;

        let mut contours: HashMap<String, Contour> = HashMap::new();

        let velocity_features = contour::intensity::compute(
            &tune,
            &config.velocity.weights,
            config.velocity.random_weight,
            config.velocity.savgol,
            config.velocity.shift,
            &mut rng,
        )?;
        let pitch_height = contour::shapes::pitch(&tune, true, true);
        let high_loud = config.velocity.high_loud_weight;
        contours.insert(
            "velocity".to_string(),
            contour::weighted_sum(&[&velocity_features, &pitch_height], &[1.0 - high_loud, high_loud])?,
        );

        contours.insert(
            "tempo".to_string(),
            contour::intensity::compute(
                &tune,
                &config.tempo.weights,
                config.tempo.random_weight,
                config.tempo.savgol,
                config.tempo.shift,
                &mut rng,
            )?,
        );

        contours.insert(
            "ornament".to_string(),
            contour::intensity::compute(
                &tune,
                &config.ornament.weights,
                config.ornament.random_weight,
                config.ornament.savgol,
                config.ornament.shift,
                &mut rng,
            )?,
        );

        contours.insert(
            "message length".to_string(),
            contour::shapes::message_length(&tune),
        );
        contours.insert(
            "pitch difference".to_string(),
            contour::shapes::pitch_difference(&tune),
        );
        contours.insert(
            "phrase".to_string(),
            contour::shapes::phrase(&tune, config.phrase.levels, config.phrase.exponent)?,
        );

        let pattern = if config.pattern.active {
            contour::shapes::pattern(
                &tune,
                &config.pattern.means,
                &config.pattern.deviations,
                config.pattern.renormalize,
                &mut rng,
            )?
        } else {
            Contour::from_values(vec![1.0; tune.note_on_count()])
        };
        contours.insert("pattern".to_string(), pattern);

        contours.insert(
            "harmony".to_string(),
            contour::harmony::compute(
                &tune,
                &config.harmony.chord_score,
                &config.harmony.allowed_chords,
                config.harmony.chords_per_bar,
                transpose,
                &mut rng,
            )?,
        );

        for (name, recipe) in &config.contours {
            if contours.contains_key(name) {
                return Err(anyhow!("contour '{name}' is defined twice"));
            }
            contours.insert(name.clone(), recipe.build(&tune, transpose, &mut rng)?);
        }

        let mut values: HashMap<String, f64> = HashMap::new();
        for name in contours.keys() {
            values.insert(name.clone(), 0.5);
        }
        values.insert("pattern".to_string(), 1.0);
        values.insert(INTENSITY.to_string(), 0.5);
        values.insert(HUMAN_IMPACT.to_string(), 1.0);

        let user_tempo = match config.values.bpm {
            Some(bpm) => util::bpm_to_tempo(bpm),
            None => tune.tempo(),
        };

        Ok(Self {
            tune,
            config,
            user_tempo,
            transpose,
            state: Mutex::new(GrooverState {
                contours,
                values,
                pitch_errors: HashMap::new(),
                absorbed: HashSet::new(),
                event_index: 0,
                performance_time: 0.0,
                offset: 0.0,
                pending_delay: 0.0,
                drone_pitch: None,
                drone_slot: None,
                rng,
            }),
            tempo_override: Mutex::new(None),
            clock: Mutex::new(ClockEstimator {
                last_pulse: None,
                deltas: VecDeque::new(),
            }),
        })
    }

    pub fn tune(&self) -> &Arc<Tune> {
        &self.tune
    }

    /// Pull the next raw score event and advance the performance clock.
    pub fn next_event(&self) -> Option<ScoreEvent> {
        let mut state = self.lock_state();
        let event = self.tune.events().get(state.event_index).copied()?;
        state.event_index += 1;
        state.performance_time += event.time();
        Some(event)
    }

    /// Perform one score event. Note-ons advance every contour first.
    pub fn perform(&self, event: ScoreEvent) -> Result<Vec<ScoreEvent>> {
        let mut state = self.lock_state();
        let state = &mut *state;

        if event.is_note_on() {
            self.advance_contours(state)?;
        }

        let tempo = self.current_tempo(state);
        let ratio = tempo as f64 / self.tune.tempo() as f64;
        let mut wall = event.time() * ratio;

        if !event.is_note() {
            // markers and metas keep their scaled delta, but still absorb
            // owed time so later notes stay on the grid
            wall -= state.offset;
            state.offset = 0.0;
            if wall < 0.0 {
                state.offset = -wall;
                wall = 0.0;
            }
            return Ok(vec![event.with_time(wall)]);
        }

        let pitch = clamp_pitch(
            event
                .pitch()
                .ok_or_else(|| anyhow!("note event without pitch"))?
                as i32
                + self.transpose,
        );

        if event.is_note_off() {
            if state.absorbed.remove(&pitch) {
                // its note-on never sounded; swallow silently, keep the time
                state.offset -= wall;
                return Ok(vec![]);
            }

            let shave = wall
                * self.config.values.legato_shave
                * (1.0 - state.values.get("phrase").copied().unwrap_or(0.5));
            wall -= shave;
            state.pending_delay += shave;

            wall -= state.offset;
            state.offset = 0.0;
            if wall < 0.0 {
                state.offset = -wall;
                wall = 0.0;
            }

            // a wrong note turns off the pitch that actually sounded
            let sounding = match state.pitch_errors.remove(&pitch) {
                Some(error) => clamp_pitch(pitch as i32 + error as i32),
                None => pitch,
            };

            return Ok(vec![ScoreEvent::NoteOff {
                pitch: sounding,
                time: wall.max(0.0),
            }]);
        }

        // note-on: micro-timing, owed time, carried delay, swing
        let pattern = state.values.get("pattern").copied().unwrap_or(1.0);
        wall *= pattern;

        wall -= state.offset;
        state.offset = 0.0;
        if wall < 0.0 {
            // the previous ornament ate this note entirely
            state.offset = -wall;
            state.absorbed.insert(pitch);
            return Ok(vec![]);
        }

        wall += state.pending_delay;
        state.pending_delay = 0.0;
        wall += self.swing_delay(state, ratio);

        let on_beat = self.tune.is_on_beat(state.performance_time);
        let velocity = self.current_velocity(state, on_beat, pattern);

        let mut events: Vec<ScoreEvent> = Vec::new();

        // announce contour values and tempo before the note itself
        for (name, controller) in &self.config.automation {
            if let Some(value) = state.values.get(name) {
                events.push(ScoreEvent::ControlChange {
                    controller: *controller,
                    value: (value.clamp(0.0, 1.0) * 127.0).round() as u8,
                    time: 0.0,
                });
            }
        }
        if !self.clock_active() {
            events.push(ScoreEvent::Tempo {
                tempo,
                time: 0.0,
            });
        }

        let note_length =
            state.values.get("message length").copied().unwrap_or(0.0) * ratio;
        let eighth = tempo as f64 / 1e6 / 2.0;

        let mut note_events = vec![ScoreEvent::NoteOn {
            pitch,
            velocity,
            time: wall,
        }];

        if state.rng.random::<f64>() < state.values.get("ornament").copied().unwrap_or(0.0) {
            let ctx = OrnamentContext {
                note_length,
                eighth_duration: eighth,
                slide_duration: eighth * self.config.values.slide_eighth_fraction,
                on_beat,
                pitch_difference: state
                    .values
                    .get("pitch difference")
                    .copied()
                    .unwrap_or(0.0),
                slide_pitch_threshold: self.config.values.slide_pitch_threshold,
            };
            if let Some(kind) = ornament::choose(&self.config.probabilities, &ctx, &mut state.rng)
            {
                debug!("Ornamenting {} with {:?}", util::note_name(pitch), kind);
                note_events =
                    self.generate_ornament(state, kind, pitch, velocity, wall, note_length, eighth);
            }
        }

        // drone retrigger on its own grid, interleaved before the melody
        if self.config.drone.active {
            let mut drone_events = self.advance_drone(state, pitch, velocity);
            drone_events.extend(note_events);
            note_events = drone_events;
        }

        events.extend(note_events);
        for e in events.iter_mut() {
            if e.time() < 0.0 {
                *e = e.with_time(0.0);
            }
        }

        Ok(events)
    }

    /// Advance every contour one step and blend toward the external
    /// intensity by each contour's configured human impact.
    fn advance_contours(&self, state: &mut GrooverState) -> Result<(), GrooverError> {
        let mut updates: Vec<(String, f64)> = Vec::with_capacity(state.contours.len());
        for (name, contour) in state.contours.iter_mut() {
            updates.push((name.clone(), contour.next()?));
        }
        for (name, value) in updates {
            state.values.insert(name, value);
        }

        let intensity = state.values.get(INTENSITY).copied().unwrap_or(0.5);
        let impact_scale = state.values.get(HUMAN_IMPACT).copied().unwrap_or(1.0);

        for (name, settings) in [
            ("velocity", &self.config.velocity),
            ("tempo", &self.config.tempo),
            ("ornament", &self.config.ornament),
        ] {
            let mut h = settings.human_impact * impact_scale;
            let mut i = intensity;
            if h < 0.0 {
                h = -h;
                i = 1.0 - i;
            }
            if h > 0.0
                && let Some(value) = state.values.get_mut(name)
            {
                *value = *value * (1.0 - h) + i * h;
            }
        }

        Ok(())
    }

    /// Delay owed to swing at the off-eighth, already in wall time.
    fn swing_delay(&self, state: &mut GrooverState, ratio: f64) -> f64 {
        let amount = self.config.swing.amount;
        if amount <= 0.0 {
            return 0.0;
        }

        let quarter = self.tune.tempo() as f64 / 1e6;
        let eighth = quarter / 2.0;
        let in_pair = state.performance_time.rem_euclid(quarter);
        if (in_pair - eighth).abs() / eighth <= TRIGGER_DELTA {
            // triplet position sits a sixth of a quarter past the off-eighth
            let delay = amount * quarter / 6.0 * ratio;
            state.offset += delay;
            delay
        } else {
            0.0
        }
    }

    fn current_velocity(&self, state: &GrooverState, on_beat: bool, pattern: f64) -> u8 {
        let min = self.config.values.min_velocity as f64;
        let max = self.config.values.max_velocity as f64;
        let mut value = state.values.get("velocity").copied().unwrap_or(0.5) * (max - min) + min;
        if on_beat {
            value += self.config.values.beat_velocity_increase as f64;
        }
        value *= pattern;
        value.clamp(min, max).round() as u8
    }

    /// Current tempo in microseconds per quarter: the external clock when
    /// active, otherwise the (possibly overridden) base warped by the tempo
    /// contour within a fixed BPM span.
    fn current_tempo(&self, state: &GrooverState) -> u32 {
        if let Ok(clock) = self.clock.lock()
            && let Some(tempo) = clock.tempo()
        {
            return tempo;
        }

        let base = self
            .tempo_override
            .lock()
            .ok()
            .and_then(|t| *t)
            .unwrap_or(self.user_tempo);

        let bpm = util::tempo_to_bpm(base);
        let value = state.values.get("tempo").copied().unwrap_or(0.5);
        let warp = 2.0 * self.config.values.tempo_warp_bpm * (value - 0.5);
        util::bpm_to_tempo((bpm + warp).max(1.0))
    }

    fn approach_from_above(&self, pitch: u8) -> u8 {
        if let Some(&p) = self.config.approach_from_above.get(&util::note_name(pitch)) {
            return p;
        }
        let index = self.tune.semitones_from_tonic(pitch);
        clamp_pitch(pitch as i32 + ABOVE_APPROACH_SCALE[index] as i32)
    }

    fn approach_from_below(&self, pitch: u8) -> u8 {
        if let Some(&p) = self.config.approach_from_below.get(&util::note_name(pitch)) {
            return p;
        }
        let index = self.tune.semitones_from_tonic(pitch);
        clamp_pitch(pitch as i32 + BELOW_APPROACH_SCALE[index] as i32)
    }

    /// Expand one note-on into its ornament. The first event carries the
    /// note's shaped delta; consumed duration is owed via `state.offset`.
    fn generate_ornament(
        &self,
        state: &mut GrooverState,
        kind: OrnamentKind,
        pitch: u8,
        velocity: u8,
        wall: f64,
        note_length: f64,
        eighth: f64,
    ) -> Vec<ScoreEvent> {
        let cut_velocity =
            (velocity as f64 * self.config.values.cut_velocity_fraction).round() as u8;

        match kind {
            OrnamentKind::Cut => {
                let grace = self.approach_from_above(pitch);
                let duration = eighth * self.config.values.cut_eighth_fraction;
                state.offset += duration;
                vec![
                    ScoreEvent::NoteOn {
                        pitch: grace,
                        velocity: cut_velocity,
                        time: wall,
                    },
                    ScoreEvent::NoteOff {
                        pitch: grace,
                        time: duration,
                    },
                    ScoreEvent::NoteOn {
                        pitch,
                        velocity,
                        time: 0.0,
                    },
                ]
            }
            OrnamentKind::Roll => {
                let segment = eighth * self.config.values.roll_eighth_fraction;
                let grace = eighth - segment;
                let upper = self.approach_from_above(pitch);
                let lower = self.approach_from_below(pitch);
                state.offset += 2.0 * eighth;
                vec![
                    ScoreEvent::NoteOn {
                        pitch,
                        velocity,
                        time: wall,
                    },
                    ScoreEvent::NoteOff {
                        pitch,
                        time: segment,
                    },
                    ScoreEvent::NoteOn {
                        pitch: upper,
                        velocity: cut_velocity,
                        time: 0.0,
                    },
                    ScoreEvent::NoteOff {
                        pitch: upper,
                        time: grace,
                    },
                    ScoreEvent::NoteOn {
                        pitch,
                        velocity,
                        time: 0.0,
                    },
                    ScoreEvent::NoteOff {
                        pitch,
                        time: segment,
                    },
                    ScoreEvent::NoteOn {
                        pitch: lower,
                        velocity: cut_velocity,
                        time: 0.0,
                    },
                    ScoreEvent::NoteOff {
                        pitch: lower,
                        time: grace,
                    },
                    ScoreEvent::NoteOn {
                        pitch,
                        velocity,
                        time: 0.0,
                    },
                ]
            }
            OrnamentKind::Slide => {
                let mut events = vec![ScoreEvent::NoteOn {
                    pitch,
                    velocity,
                    time: wall,
                }];

                let diff = self.approach_from_below(pitch) as f64 - pitch as f64;
                let bend = (4096.0 * diff).clamp(-8192.0, 8191.0);

                let resolution = self.config.values.bend_resolution;
                let slide_time = note_length / 4.0;
                state.offset += slide_time;
                let step = slide_time / resolution as f64;
                let exponent = state.rng.random_range(0.25..0.5);

                for i in (0..=resolution).rev() {
                    let p = (i as f64 / resolution as f64).powf(exponent) * bend;
                    events.push(ScoreEvent::PitchBend {
                        bend: p as i16,
                        time: step,
                    });
                }
                events.push(ScoreEvent::PitchBend {
                    bend: 0,
                    time: 0.0,
                });
                events
            }
            OrnamentKind::Drop => {
                // the note vanishes; give its delta back and swallow the off
                state.offset -= wall;
                state.absorbed.insert(pitch);
                Vec::new()
            }
            OrnamentKind::Error => {
                let min = self.config.values.min_pitch_error;
                let max = self.config.values.max_pitch_error;
                let mut error = state.rng.random_range(min..=max);

                if self.config.values.diatonic_errors && error != 0 {
                    let wrong = clamp_pitch(pitch as i32 + error as i32);
                    let index = self.tune.semitones_from_tonic(wrong);
                    if NEEDS_PITCH_QUANTIZATION[index] {
                        // snap by one semitone, never back to the true pitch
                        let down = error - 1;
                        let up = error + 1;
                        error = if down.abs() <= up.abs() {
                            if down == 0 { up } else { down }
                        } else if up == 0 {
                            down
                        } else {
                            up
                        };
                    }
                }

                let wrong = clamp_pitch(pitch as i32 + error as i32);
                state.pitch_errors.insert(pitch, (wrong as i32 - pitch as i32) as i8);

                let fraction = state.rng.random_range(0.4..0.9);
                let sounded = note_length * fraction;
                state.offset += sounded;

                vec![
                    ScoreEvent::NoteOn {
                        pitch: wrong,
                        velocity,
                        time: wall,
                    },
                    ScoreEvent::NoteOff {
                        pitch: wrong,
                        time: sounded,
                    },
                ]
            }
        }
    }

    /// Retrigger the drone once per grid slot while its gate contour is
    /// above threshold; stop it when the gate drops.
    fn advance_drone(
        &self,
        state: &mut GrooverState,
        melody_pitch: u8,
        velocity: u8,
    ) -> Vec<ScoreEvent> {
        let gate = state
            .values
            .get(&self.config.drone.contour)
            .copied()
            .unwrap_or(0.0);

        let mut events = Vec::new();

        if gate < self.config.drone.threshold {
            if let Some(prev) = state.drone_pitch.take() {
                events.push(ScoreEvent::NoteOff {
                    pitch: prev,
                    time: 0.0,
                });
            }
            state.drone_slot = None;
            return events;
        }

        let grid = self.tune.beat_duration() * self.config.drone.retrigger_beats;
        let slot = (state.performance_time / grid).floor() as i64;
        if state.drone_slot == Some(slot) {
            return events;
        }
        state.drone_slot = Some(slot);

        let harmony = state.values.get("harmony").copied().unwrap_or(0.0) as i32;
        let root = harmony.rem_euclid(12);
        let chord = util::chord_pitches(harmony);

        // chord tones below the melody, more than a sixth but within an octave
        let candidates: Vec<u8> = self
            .config
            .drone
            .allowed_notes
            .iter()
            .copied()
            .filter(|&d| {
                let interval = melody_pitch as i32 - d as i32;
                let degree = (d as i32 - root).rem_euclid(12);
                chord.contains(&degree) && interval > 6 && interval <= 12
            })
            .collect();

        let Some(&drone) = candidates
            .iter()
            .min_by_key(|&&d| (melody_pitch as i32 - d as i32).abs())
        else {
            return events;
        };

        if state.drone_pitch == Some(drone) {
            return events;
        }
        if let Some(prev) = state.drone_pitch.take() {
            events.push(ScoreEvent::NoteOff {
                pitch: prev,
                time: 0.0,
            });
        }
        events.push(ScoreEvent::NoteOn {
            pitch: drone,
            velocity,
            time: 0.0,
        });
        state.drone_pitch = Some(drone);
        events
    }

    /// Note-off for a still-sounding drone, for the end of playback.
    pub fn release(&self) -> Vec<ScoreEvent> {
        let mut state = self.lock_state();
        match state.drone_pitch.take() {
            Some(pitch) => vec![ScoreEvent::NoteOff { pitch, time: 0.0 }],
            None => Vec::new(),
        }
    }

    /// A closing chord tone derived from the last harmony estimate.
    pub fn end_notes(&self) -> Vec<ScoreEvent> {
        let mut state = self.lock_state();
        let state = &mut *state;

        let harmony = state.values.get("harmony").copied().unwrap_or(0.0) as i32;
        let root = harmony.rem_euclid(12);
        let chord = util::chord_pitches(harmony);
        let (low, high) = self.tune.ambitus();

        let candidates: Vec<u8> = (low..=high)
            .map(|p| clamp_pitch(p as i32 + self.transpose))
            .filter(|&p| chord.contains(&(p as i32 - root).rem_euclid(12)))
            .collect();

        let Some(&pitch) = candidates.choose(&mut state.rng) else {
            return Vec::new();
        };

        let tempo = self.current_tempo(state);
        let duration = 2.0 * tempo as f64 / 1e6;
        let velocity = self.current_velocity(state, true, 1.0);

        vec![
            ScoreEvent::NoteOn {
                pitch,
                velocity,
                time: 0.0,
            },
            ScoreEvent::NoteOff {
                pitch,
                time: duration,
            },
        ]
    }

    /// Seek to a song position. Unknown positions are logged and ignored
    /// since they can arise from benign message races.
    pub fn jump_to_pos(&self, position: u16) {
        let Some(entry) = self.tune.seek(position) else {
            warn!(
                "Ignoring jump to position {} beyond max {}",
                position,
                self.tune.max_position()
            );
            return;
        };

        let mut state = self.lock_state();
        state.event_index = entry.event_index;
        state.performance_time = entry.time;
        state.offset = 0.0;
        state.pending_delay = 0.0;
        state.pitch_errors.clear();
        state.absorbed.clear();
        state.drone_slot = None;

        for contour in state.contours.values_mut() {
            if entry.contour_index < contour.len() {
                // the jump target is in range of every computed contour
                let _ = contour.jump(entry.contour_index);
            }
        }
        debug!("Jumped to position {position}");
    }

    /// Override a runtime value from external control, clamped to [0,1].
    pub fn set_contour_value(&self, name: &str, value: f64) -> Result<(), GrooverError> {
        let mut state = self.lock_state();
        if !state.values.contains_key(name) {
            return Err(GrooverError::UnknownContour(name.to_string()));
        }
        state.values.insert(name.to_string(), value.clamp(0.0, 1.0));
        Ok(())
    }

    /// One-shot tempo from the synchronization coordinator, in BPM.
    pub fn set_tempo(&self, bpm: u32) {
        if let Ok(mut t) = self.tempo_override.lock() {
            *t = Some(util::bpm_to_tempo(bpm as f64));
        }
    }

    /// Register one external clock pulse (24 per quarter note).
    pub fn set_clock(&self) {
        if let Ok(mut clock) = self.clock.lock() {
            clock.pulse();
        }
    }

    /// Forget the external clock; tempo falls back to the contour warp.
    pub fn reset_clock(&self) {
        if let Ok(mut clock) = self.clock.lock() {
            clock.reset();
        }
    }

    pub fn clock_active(&self) -> bool {
        self.clock.lock().is_ok_and(|c| c.tempo().is_some())
    }

    /// Current effective tempo in BPM, contour warp included.
    pub fn bpm(&self) -> f64 {
        let state = self.lock_state();
        util::tempo_to_bpm(self.current_tempo(&state))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, GrooverState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn clamp_pitch(pitch: i32) -> u8 {
    pitch.clamp(0, 127) as u8
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::model::score::{KeySignature, TimeSignature};
    use crate::model::settings::OrnamentProbabilities;

    fn scale_tune(repeats: usize) -> Arc<Tune> {
        let mut events = Vec::new();
        for &p in &[62u8, 64, 66, 67, 69, 71, 73, 74] {
            events.push(ScoreEvent::NoteOn {
                pitch: p,
                velocity: 90,
                time: 0.0,
            });
            events.push(ScoreEvent::NoteOff { pitch: p, time: 0.5 });
        }
        Arc::new(Tune::from_parts(
            events,
            KeySignature::from_fifths(2, false),
            TimeSignature::new(4, 4),
            500_000,
            0.0,
            repeats,
        ))
    }

    fn run_full(groover: &Groover) -> Vec<ScoreEvent> {
        let mut output = Vec::new();
        while let Some(event) = groover.next_event() {
            if event.is_note() {
                output.extend(groover.perform(event).unwrap());
            }
        }
        output
    }

    #[test]
    fn identical_seeds_reproduce_the_performance() {
        let config = GrooverConfig::load(None).unwrap();
        let a = Groover::new(scale_tune(1), config.clone()).unwrap();
        let b = Groover::new(scale_tune(1), config).unwrap();
        assert_eq!(run_full(&a), run_full(&b));
    }

    #[test]
    fn different_seeds_diverge() {
        let config_a = GrooverConfig::load(None).unwrap();
        let mut config_b = config_a.clone();
        config_b.values.seed = 1234;
        let a = Groover::new(scale_tune(1), config_a).unwrap();
        let b = Groover::new(scale_tune(1), config_b).unwrap();
        assert_ne!(run_full(&a), run_full(&b));
    }

    #[test]
    fn no_event_ever_has_negative_time() {
        let mut config = GrooverConfig::load(None).unwrap();
        config.probabilities = OrnamentProbabilities {
            cut: 1.0,
            roll: 1.0,
            slide: 1.0,
            drop: 1.0,
            error: 1.0,
        };
        config.swing.amount = 0.5;
        config.values.legato_shave = 0.5;

        for seed in 0..20 {
            config.values.seed = seed;
            let groover = Groover::new(scale_tune(2), config.clone()).unwrap();
            for event in run_full(&groover) {
                assert!(event.time() >= 0.0, "negative delta in {event:?}");
            }
        }
    }

    #[test]
    fn swing_delays_off_eighths_and_owes_the_time_back() {
        let mut config = GrooverConfig::load(None).unwrap();
        config.probabilities = OrnamentProbabilities {
            cut: 0.0,
            roll: 0.0,
            slide: 0.0,
            drop: 0.0,
            error: 0.0,
        };
        config.swing.amount = 0.5;
        config.values.legato_shave = 0.0;
        config.values.tempo_warp_bpm = 0.0;

        // one bar of straight eighths at 120 bpm
        let mut events = Vec::new();
        for &p in &[62u8, 64, 66, 67, 69, 71, 73, 74] {
            events.push(ScoreEvent::NoteOn {
                pitch: p,
                velocity: 90,
                time: 0.0,
            });
            events.push(ScoreEvent::NoteOff { pitch: p, time: 0.25 });
        }
        let tune = Arc::new(Tune::from_parts(
            events,
            KeySignature::from_fifths(2, false),
            TimeSignature::new(4, 4),
            500_000,
            0.0,
            1,
        ));
        let groover = Groover::new(tune, config).unwrap();

        // triplet position sits a sixth of a quarter past the off-eighth
        let expected = 0.5 * 0.5 / 6.0;

        let mut elapsed = 0.0;
        let mut onsets = Vec::new();
        while let Some(event) = groover.next_event() {
            for out in groover.perform(event).unwrap() {
                elapsed += out.time();
                if out.is_note_on() {
                    onsets.push(elapsed);
                }
            }
        }

        // off-eighths wait for the triplet spot, beat notes stay on the grid
        assert_eq!(onsets.len(), 8);
        assert!(onsets[0].abs() < 1e-9);
        assert!((onsets[1] - (0.25 + expected)).abs() < 1e-9);
        assert!((onsets[2] - 0.5).abs() < 1e-9);
        assert!((onsets[3] - (0.75 + expected)).abs() < 1e-9);
    }

    #[test]
    fn pitch_error_bookkeeping_shifts_the_note_off() {
        let mut config = GrooverConfig::load(None).unwrap();
        // force errors only
        config.probabilities = OrnamentProbabilities {
            cut: 0.0,
            roll: 0.0,
            slide: 0.0,
            drop: 0.0,
            error: 1.0,
        };
        config.values.min_pitch_error = 2;
        config.values.max_pitch_error = 2;
        config.values.diatonic_errors = false;
        // pin the ornament contour at 1 by blending fully into intensity
        config.ornament.human_impact = 1.0;

        let groover = Groover::new(scale_tune(1), config).unwrap();
        groover.set_contour_value(INTENSITY, 1.0).unwrap();

        let mut wrong_pitch = None;
        let mut sounded = 0;
        while let Some(event) = groover.next_event() {
            let out = groover.perform(event).unwrap();
            if !event.is_note() {
                continue;
            }
            if event.is_note_on() {
                // a carried error offset may absorb a short note entirely
                wrong_pitch = out.iter().find(|e| e.is_note_on()).and_then(|on| {
                    sounded += 1;
                    assert_eq!(on.pitch(), event.pitch().map(|p| p + 2));
                    on.pitch()
                });
            } else if wrong_pitch.is_some() {
                // shifted note-off, and the table entry is consumed
                assert_eq!(out[0].pitch(), wrong_pitch);
                let state = groover.lock_state();
                assert!(state.pitch_errors.is_empty());
            }
        }
        assert!(sounded > 0);
    }

    #[test]
    fn unknown_contour_value_is_rejected() {
        let config = GrooverConfig::load(None).unwrap();
        let groover = Groover::new(scale_tune(1), config).unwrap();
        assert!(matches!(
            groover.set_contour_value("sparkle", 0.5),
            Err(GrooverError::UnknownContour(_))
        ));
        groover.set_contour_value(INTENSITY, 0.8).unwrap();
    }

    #[test]
    fn jump_beyond_max_position_is_ignored() {
        let config = GrooverConfig::load(None).unwrap();
        let groover = Groover::new(scale_tune(1), config).unwrap();
        let before = {
            let state = groover.lock_state();
            (state.event_index, state.performance_time)
        };
        groover.jump_to_pos(groover.tune().max_position() + 10);
        let after = {
            let state = groover.lock_state();
            (state.event_index, state.performance_time)
        };
        assert_eq!(before, after);
    }

    #[test]
    fn jump_realigns_events_and_contours() {
        let config = GrooverConfig::load(None).unwrap();
        let groover = Groover::new(scale_tune(1), config).unwrap();
        groover.jump_to_pos(2);

        let entry = groover.tune().seek(2).unwrap();
        let state = groover.lock_state();
        assert_eq!(state.event_index, entry.event_index);
        assert_eq!(state.performance_time, entry.time);
    }

    #[test]
    fn tempo_warp_spans_the_configured_bpm_range() {
        let mut config = GrooverConfig::load(None).unwrap();
        config.values.bpm = Some(120.0);
        config.values.tempo_warp_bpm = 10.0;
        let groover = Groover::new(scale_tune(1), config).unwrap();

        let mut state = groover.lock_state();
        state.values.insert("tempo".to_string(), 1.0);
        let fast = groover.current_tempo(&state);
        state.values.insert("tempo".to_string(), 0.0);
        let slow = groover.current_tempo(&state);

        assert!((util::tempo_to_bpm(fast) - 130.0).abs() < 0.5);
        assert!((util::tempo_to_bpm(slow) - 110.0).abs() < 0.5);
    }

    #[test]
    fn tempo_override_replaces_the_base() {
        let mut config = GrooverConfig::load(None).unwrap();
        config.values.bpm = Some(120.0);
        let groover = Groover::new(scale_tune(1), config).unwrap();
        groover.set_tempo(90);

        let state = groover.lock_state();
        let bpm = util::tempo_to_bpm(groover.current_tempo(&state));
        assert!((bpm - 90.0).abs() < 10.5); // within the warp span
    }

    #[test]
    fn approach_notes_follow_the_scale_with_overrides() {
        let mut config = GrooverConfig::load(None).unwrap();
        config.approach_from_above.insert("D4".to_string(), 65);
        let groover = Groover::new(scale_tune(1), config).unwrap();

        // override wins
        assert_eq!(groover.approach_from_above(62), 65);
        // scale step otherwise: E4 -> F#4 above, D4 below
        assert_eq!(groover.approach_from_above(64), 66);
        assert_eq!(groover.approach_from_below(64), 62);
    }
}
