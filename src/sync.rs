//! Multi-instance synchronization.
//!
//! Independent performers broadcast song-position markers and control
//! values; the [`Coordinator`] converges them on a shared position and
//! tempo and relays synthesized intensity between them. Decision logic is
//! pure (explicit `now`, returned messages) so the protocol is testable
//! without threads; [`Coordinator::run`] wraps it in a channel loop.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::seq::{IndexedRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

pub type InstanceId = String;

/// Wire messages exchanged between performer instances and the coordinator.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    Start,
    Stop,
    Continue,
    /// One pulse per 24th of a quarter note, for external tempo estimation.
    Clock,
    /// Clears tempo estimation state.
    Reset,
    SongPosition(u16),
    /// BPM packed across 7-bit payload bytes.
    Tempo(Vec<u8>),
    ControlChange { control: u8, value: u8 },
}

/// Pack an integer BPM across payload bytes, each at most 127, that sum
/// back to the BPM.
pub fn pack_tempo(bpm: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    let mut remaining = bpm;
    while remaining > 0 {
        let v = remaining.min(127);
        bytes.push(v as u8);
        remaining -= v;
    }
    bytes
}

pub fn unpack_tempo(bytes: &[u8]) -> u32 {
    bytes.iter().map(|&b| b as u32).sum()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionPolicy {
    Max,
    Min,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Aggregator {
    Mean,
    Min,
    Max,
    Constant,
}

impl Aggregator {
    fn apply(&self, values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        match self {
            Aggregator::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Aggregator::Min => values.iter().cloned().fold(f64::INFINITY, f64::min),
            Aggregator::Max => values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            Aggregator::Constant => 0.0,
        }
    }
}

/// One attention behavior: how an instance's relayed intensity and human
/// impact are synthesized from its peer group.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Behavior {
    pub intensity_aggregator: Aggregator,
    pub intensity_multiplier: f64,
    pub intensity_constant: f64,
    pub human_impact_aggregator: Aggregator,
    pub human_impact_multiplier: f64,
    pub human_impact_constant: f64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AttentionPolicy {
    pub behaviors: BTreeMap<String, Behavior>,
    pub group_min_size: usize,
    pub group_max_size: usize,
}

impl Default for AttentionPolicy {
    fn default() -> Self {
        let mut behaviors = BTreeMap::new();
        behaviors.insert(
            "match".to_string(),
            Behavior {
                intensity_aggregator: Aggregator::Mean,
                intensity_multiplier: 1.0,
                intensity_constant: 0.0,
                human_impact_aggregator: Aggregator::Mean,
                human_impact_multiplier: 1.0,
                human_impact_constant: 0.0,
            },
        );
        behaviors.insert(
            "backoff".to_string(),
            Behavior {
                intensity_aggregator: Aggregator::Min,
                intensity_multiplier: 0.5,
                intensity_constant: 0.0,
                human_impact_aggregator: Aggregator::Constant,
                human_impact_multiplier: 0.0,
                human_impact_constant: 0.0,
            },
        );
        behaviors.insert(
            "lead".to_string(),
            Behavior {
                intensity_aggregator: Aggregator::Max,
                intensity_multiplier: 1.5,
                intensity_constant: 0.0,
                human_impact_aggregator: Aggregator::Constant,
                human_impact_multiplier: 0.0,
                human_impact_constant: 1.0,
            },
        );
        Self {
            behaviors,
            group_min_size: 1,
            group_max_size: 3,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SyncConfig {
    /// Beats between song-position broadcasts.
    pub sync_interval: f64,
    /// Behavior switch cadence, in song-position intervals.
    pub switch_every: f64,
    pub position: PositionPolicy,
    /// Soft-fix threshold as a fraction of the song-position interval.
    pub fix_sync_multiplier: f64,
    /// Hard-fix threshold as a fraction of the song-position interval.
    pub stop_sync_multiplier: f64,
    pub intensity_control: u8,
    pub human_impact_control: u8,
    pub attention: AttentionPolicy,
    pub seed: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_interval: 1.0,
            switch_every: 16.0,
            position: PositionPolicy::Max,
            fix_sync_multiplier: 1.0 / 16.0,
            stop_sync_multiplier: 0.5,
            intensity_control: 49,
            human_impact_control: 50,
            attention: AttentionPolicy::default(),
            seed: 42,
        }
    }
}

struct InstanceSync {
    position: u16,
    last_seen: f64,
    intensity: f64,
    human_impact: f64,
    /// A one-shot tempo nudge was sent; reset to nominal on convergence.
    pending_tempo_fix: bool,
    human: bool,
    /// (switch time, behavior name, peer group).
    action: Option<(f64, String, Vec<InstanceId>)>,
}

struct Sleeper {
    id: InstanceId,
    start: f64,
    wait: f64,
    position: u16,
}

/// Converges positions and tempo across performer instances and relays
/// attention-policy intensity.
pub struct Coordinator {
    config: SyncConfig,
    tempo_bpm: u32,
    instances: BTreeMap<InstanceId, InstanceSync>,
    sleepers: Vec<Sleeper>,
    rng: StdRng,
}

impl Coordinator {
    pub fn new(config: SyncConfig, tempo_bpm: u32) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            tempo_bpm,
            instances: BTreeMap::new(),
            sleepers: Vec::new(),
            rng,
        }
    }

    /// Track an instance; human instances are observed but never corrected.
    pub fn register(&mut self, id: &str, human: bool) {
        self.instances.insert(
            id.to_string(),
            InstanceSync {
                position: 0,
                last_seen: 0.0,
                intensity: 0.5,
                human_impact: 0.5,
                pending_tempo_fix: false,
                human,
                action: None,
            },
        );
    }

    /// Seconds between song-position markers at the current tempo.
    fn songpos_wait(&self) -> f64 {
        self.config.sync_interval * 60.0 / self.tempo_bpm as f64
    }

    fn fix_threshold(&self) -> f64 {
        self.config.fix_sync_multiplier * 60.0 / self.tempo_bpm as f64
    }

    fn stop_threshold(&self) -> f64 {
        self.config.stop_sync_multiplier * 60.0 / self.tempo_bpm as f64
    }

    /// Change the nominal tempo and tell every instance.
    pub fn set_tempo(&mut self, bpm: u32) -> Vec<(InstanceId, SyncMessage)> {
        self.tempo_bpm = bpm;
        let payload = pack_tempo(bpm);
        self.instances
            .keys()
            .map(|id| (id.clone(), SyncMessage::Tempo(payload.clone())))
            .collect()
    }

    pub fn handle_message(
        &mut self,
        id: &str,
        message: SyncMessage,
        now: f64,
    ) -> Vec<(InstanceId, SyncMessage)> {
        match message {
            SyncMessage::SongPosition(pos) => self.handle_songpos(id, pos, now),
            SyncMessage::ControlChange { control, value } => {
                self.handle_control(id, control, value, now)
            }
            SyncMessage::Tempo(payload) => self.set_tempo(unpack_tempo(&payload)),
            // shell commands fan out to everyone
            SyncMessage::Start | SyncMessage::Stop | SyncMessage::Continue => self
                .instances
                .keys()
                .map(|other| (other.clone(), message.clone()))
                .collect(),
            // a leader's clock goes to everyone else
            SyncMessage::Clock | SyncMessage::Reset => self
                .instances
                .keys()
                .filter(|other| other.as_str() != id)
                .map(|other| (other.clone(), message.clone()))
                .collect(),
        }
    }

    /// Position convergence on one incoming marker.
    pub fn handle_songpos(
        &mut self,
        id: &str,
        pos: u16,
        now: f64,
    ) -> Vec<(InstanceId, SyncMessage)> {
        let songpos_wait = self.songpos_wait();

        if !self.instances.contains_key(id) {
            self.register(id, false);
        }

        // humans are inferred, never forced
        if self.instances.get(id).is_some_and(|i| i.human) {
            let ensemble = self
                .instances
                .values()
                .filter(|i| !i.human)
                .map(|i| i.position)
                .max()
                .unwrap_or(0);
            if let Some(entry) = self.instances.get_mut(id) {
                let skipped = now - entry.last_seen > 2.0 * songpos_wait;
                entry.position = if entry.last_seen == 0.0 || skipped {
                    ensemble
                } else {
                    entry.position + 1
                };
                entry.last_seen = now;
            }
            return Vec::new();
        }

        if let Some(entry) = self.instances.get_mut(id) {
            entry.position = pos;
            entry.last_seen = now;
        }

        let agreed = match self.config.position {
            PositionPolicy::Max => self.instances.values().map(|i| i.position).max(),
            PositionPolicy::Min => self.instances.values().map(|i| i.position).min(),
        }
        .unwrap_or(0);

        let at_agreed: Vec<f64> = self
            .instances
            .values()
            .filter(|i| i.position == agreed)
            .map(|i| i.last_seen)
            .collect();
        let timestamp = at_agreed.iter().sum::<f64>() / at_agreed.len().max(1) as f64;

        let mut out = Vec::new();

        // Instances whose position disagrees get a hard fix, but only when
        // their report is contemporaneous with this one. A stale report just
        // means their next marker hasn't arrived yet.
        let laggards: Vec<InstanceId> = self
            .instances
            .iter()
            .filter(|(other, i)| {
                !i.human
                    && i.last_seen > 0.0
                    && i.position != agreed
                    && now - i.last_seen <= self.stop_threshold()
                    && !self.sleepers.iter().any(|s| &s.id == *other)
            })
            .map(|(other, _)| other.clone())
            .collect();

        for other in laggards {
            debug!("Hard fix for {other}: position != {agreed}");
            out.push((other.clone(), SyncMessage::Stop));
            out.push((other.clone(), SyncMessage::SongPosition(agreed + 1)));
            self.sleepers.push(Sleeper {
                id: other,
                start: now,
                wait: (songpos_wait - (now - timestamp)).max(0.0),
                position: agreed + 1,
            });
        }

        // timing error of the sender against the agreed timestamp
        if pos == agreed && !self.sleepers.iter().any(|s| s.id == id) {
            let diff = now - timestamp;

            if self.instances.get(id).is_some_and(|i| i.pending_tempo_fix) {
                // previous nudge has done its job
                out.push((id.to_string(), SyncMessage::Tempo(pack_tempo(self.tempo_bpm))));
                if let Some(entry) = self.instances.get_mut(id) {
                    entry.pending_tempo_fix = false;
                }
            }

            if diff >= self.stop_threshold() {
                debug!("Hard fix for {id}: late by {diff:.3}s");
                out.push((id.to_string(), SyncMessage::Stop));
                out.push((id.to_string(), SyncMessage::SongPosition(agreed + 1)));
                self.sleepers.push(Sleeper {
                    id: id.to_string(),
                    start: now,
                    wait: (songpos_wait - diff).max(0.0),
                    position: agreed + 1,
                });
            } else if diff >= self.fix_threshold() {
                // one-shot tempo so the next beat lands on the agreed time
                let target = timestamp + songpos_wait;
                if target > now {
                    let nudged =
                        (self.tempo_bpm as f64 * songpos_wait / (target - now)).round() as u32;
                    debug!("Soft fix for {id}: late by {diff:.3}s, tempo {nudged}");
                    out.push((id.to_string(), SyncMessage::Tempo(pack_tempo(nudged))));
                    if let Some(entry) = self.instances.get_mut(id) {
                        entry.pending_tempo_fix = true;
                    }
                }
            }
        }

        out
    }

    /// Intensity relay on one incoming control value.
    pub fn handle_control(
        &mut self,
        id: &str,
        control: u8,
        value: u8,
        now: f64,
    ) -> Vec<(InstanceId, SyncMessage)> {
        if control != self.config.intensity_control && control != self.config.human_impact_control
        {
            return Vec::new();
        }

        if !self.instances.contains_key(id) {
            self.register(id, false);
        }

        let switch_timer = self.config.switch_every * self.songpos_wait();

        let (needs_switch, first_switch) = {
            let Some(entry) = self.instances.get_mut(id) else {
                return Vec::new();
            };
            if control == self.config.intensity_control {
                entry.intensity = value as f64 / 127.0;
            } else {
                entry.human_impact = value as f64 / 127.0;
            }
            if entry.human {
                return Vec::new();
            }
            // re-pick the behavior and peer group on the switch cadence
            match &entry.action {
                None => (true, true),
                Some((since, _, _)) => (now - since >= switch_timer, false),
            }
        };

        if needs_switch {
            let peers: Vec<InstanceId> = self
                .instances
                .keys()
                .filter(|other| other.as_str() != id)
                .cloned()
                .collect();
            if peers.is_empty() {
                return Vec::new();
            }

            let names: Vec<&String> = self.config.attention.behaviors.keys().collect();
            let Some(&name) = names.choose(&mut self.rng) else {
                return Vec::new();
            };
            let name = name.clone();

            let n = if peers.len() == 1 {
                1
            } else {
                self.rng.random_range(
                    self.config.attention.group_min_size.min(peers.len())
                        ..=self.config.attention.group_max_size.min(peers.len()),
                )
            };
            let mut group = peers;
            group.shuffle(&mut self.rng);
            group.truncate(n);

            // stagger the very first switch so instances don't re-pick in step
            let since = if first_switch {
                now - self.rng.random::<f64>() * switch_timer
            } else {
                now
            };

            info!("{id} now '{name}' toward {group:?}");
            if let Some(entry) = self.instances.get_mut(id) {
                entry.action = Some((since, name, group));
            }
        }

        let Some((_, name, group)) = self.instances.get(id).and_then(|i| i.action.clone())
        else {
            return Vec::new();
        };
        let Some(behavior) = self.config.attention.behaviors.get(&name).cloned() else {
            warn!("Unknown behavior '{name}'");
            return Vec::new();
        };

        let intensities: Vec<f64> = group
            .iter()
            .filter_map(|p| self.instances.get(p))
            .map(|i| i.intensity)
            .collect();
        let impacts: Vec<f64> = group
            .iter()
            .filter_map(|p| self.instances.get(p))
            .map(|i| i.human_impact)
            .collect();

        let intensity = behavior.intensity_aggregator.apply(&intensities)
            * behavior.intensity_multiplier
            + behavior.intensity_constant;
        let impact = behavior.human_impact_aggregator.apply(&impacts)
            * behavior.human_impact_multiplier
            + behavior.human_impact_constant;

        vec![
            (
                id.to_string(),
                SyncMessage::ControlChange {
                    control: self.config.intensity_control,
                    value: (intensity.clamp(0.0, 1.0) * 127.0).round() as u8,
                },
            ),
            (
                id.to_string(),
                SyncMessage::ControlChange {
                    control: self.config.human_impact_control,
                    value: (impact.clamp(0.0, 1.0) * 127.0).round() as u8,
                },
            ),
        ]
    }

    /// Resume instances whose deferred continue has come due.
    pub fn wake_sleepers(&mut self, now: f64) -> Vec<(InstanceId, SyncMessage)> {
        let mut awoken = Vec::new();
        self.sleepers.retain(|s| {
            if now - s.start >= s.wait {
                awoken.push((s.id.clone(), s.position));
                false
            } else {
                true
            }
        });

        let mut out = Vec::new();
        for (id, position) in awoken {
            if let Some(entry) = self.instances.get_mut(&id) {
                entry.position = position;
                entry.last_seen = now;
            }
            debug!("Waking {id} at position {position}");
            out.push((id, SyncMessage::Continue));
        }
        out
    }

    /// Channel-driven loop around the pure handlers. Returns when the
    /// inbound channel disconnects.
    pub fn run(
        mut self,
        inbound: Receiver<(InstanceId, SyncMessage)>,
        outbound: Sender<(InstanceId, SyncMessage)>,
    ) {
        let started = Instant::now();
        info!("Coordinator running at {} bpm", self.tempo_bpm);

        loop {
            let now = started.elapsed().as_secs_f64();
            for message in self.wake_sleepers(now) {
                if outbound.send(message).is_err() {
                    return;
                }
            }

            match inbound.recv_timeout(Duration::from_millis(5)) {
                Ok((id, message)) => {
                    let now = started.elapsed().as_secs_f64();
                    for out in self.handle_message(&id, message, now) {
                        if outbound.send(out).is_err() {
                            return;
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    info!("Coordinator shutting down");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn coordinator() -> Coordinator {
        // 120 bpm, one-beat markers: songpos_wait 0.5s, hard 0.25s, soft 1/32s
        Coordinator::new(SyncConfig::default(), 120)
    }

    #[test]
    fn tempo_pack_round_trips_for_all_supported_bpm() {
        for bpm in 20..=300 {
            let payload = pack_tempo(bpm);
            assert!(payload.iter().all(|&b| b <= 127));
            assert_eq!(unpack_tempo(&payload), bpm);
        }
        assert_eq!(unpack_tempo(&pack_tempo(137)), 137);
    }

    #[test]
    fn lagging_instance_gets_stop_and_seek() {
        let mut c = coordinator();
        c.register("a", false);
        c.register("b", false);
        c.register("c", false);

        assert!(c.handle_songpos("a", 5, 100.0).is_empty());
        assert!(c.handle_songpos("b", 5, 100.0).is_empty());

        let out = c.handle_songpos("c", 6, 100.02);
        let to_a: Vec<&SyncMessage> =
            out.iter().filter(|(id, _)| id == "a").map(|(_, m)| m).collect();
        let to_c: Vec<&SyncMessage> =
            out.iter().filter(|(id, _)| id == "c").map(|(_, m)| m).collect();

        assert_eq!(to_a, vec![&SyncMessage::Stop, &SyncMessage::SongPosition(7)]);
        assert!(to_c.is_empty());
    }

    #[test]
    fn sleepers_resume_on_the_next_beat() {
        let mut c = coordinator();
        c.register("a", false);
        c.register("b", false);
        c.handle_songpos("a", 5, 100.0);
        let out = c.handle_songpos("b", 6, 100.0);
        assert!(!out.is_empty());

        assert!(c.wake_sleepers(100.1).is_empty());
        let awoken = c.wake_sleepers(100.6);
        assert_eq!(awoken, vec![("a".to_string(), SyncMessage::Continue)]);
        // a is considered at the target position afterwards
        assert!(c.handle_songpos("a", 7, 100.6).is_empty());
    }

    #[test]
    fn small_lag_gets_a_one_shot_tempo_nudge_then_a_reset() {
        let mut c = coordinator();
        c.register("a", false);
        c.register("b", false);

        c.handle_songpos("a", 5, 100.0);
        let out = c.handle_songpos("b", 5, 100.1);
        // mean timestamp 100.05, lag 0.05: above 1/32s, below 0.25s
        assert_eq!(out.len(), 1);
        let (id, message) = &out[0];
        assert_eq!(id, "b");
        let SyncMessage::Tempo(payload) = message else {
            panic!("expected a tempo nudge, got {message:?}");
        };
        // 120 * 0.5 / (100.55 - 100.1) = 133.33
        assert_eq!(unpack_tempo(payload), 133);

        // next convergent marker resets the tempo to nominal
        c.handle_songpos("a", 6, 100.5);
        let out = c.handle_songpos("b", 6, 100.5);
        assert!(out.contains(&("b".to_string(), SyncMessage::Tempo(pack_tempo(120)))));
    }

    #[test]
    fn humans_are_tracked_but_never_corrected() {
        let mut c = coordinator();
        c.register("a", false);
        c.register("human", true);

        c.handle_songpos("a", 6, 100.0);
        // the human reports a stale position; nothing is sent to it
        let out = c.handle_songpos("human", 2, 100.01);
        assert!(out.is_empty());
        // and its position is inferred from the ensemble on first contact
        assert_eq!(c.instances["human"].position, 6);

        // subsequent beats advance it passively
        c.handle_songpos("human", 2, 100.5);
        assert_eq!(c.instances["human"].position, 7);

        // a lagging human never receives a hard fix
        let out = c.handle_songpos("a", 9, 101.0);
        assert!(out.iter().all(|(id, _)| id != "human"));
    }

    #[test]
    fn intensity_relay_synthesizes_from_the_peer_group() {
        let mut config = SyncConfig::default();
        // single deterministic behavior
        config.attention.behaviors = BTreeMap::from([(
            "match".to_string(),
            Behavior {
                intensity_aggregator: Aggregator::Mean,
                intensity_multiplier: 1.0,
                intensity_constant: 0.0,
                human_impact_aggregator: Aggregator::Constant,
                human_impact_multiplier: 0.0,
                human_impact_constant: 1.0,
            },
        )]);
        let mut c = Coordinator::new(config, 120);
        c.register("a", false);
        c.register("b", false);

        // b announces full intensity
        c.handle_control("b", 49, 127, 100.0);
        let out = c.handle_control("a", 49, 0, 100.1);
        assert_eq!(
            out,
            vec![
                (
                    "a".to_string(),
                    SyncMessage::ControlChange {
                        control: 49,
                        value: 127
                    }
                ),
                (
                    "a".to_string(),
                    SyncMessage::ControlChange {
                        control: 50,
                        value: 127
                    }
                ),
            ]
        );
    }

    #[test]
    fn unrelated_controls_are_ignored() {
        let mut c = coordinator();
        c.register("a", false);
        c.register("b", false);
        assert!(c.handle_control("a", 7, 99, 100.0).is_empty());
    }
}
