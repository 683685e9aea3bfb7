use clap::{ArgAction, Parser};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ceol",
    about = "Perform a traditional dance tune with human-like expression!"
)]
pub struct Args {
    /// Path to the source MIDI file.
    pub midi: PathBuf,

    /// Optional JSON configuration, merged over the built-in defaults.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Performance tempo in BPM. Defaults to the tempo in the file.
    #[arg(short, long)]
    pub bpm: Option<u32>,

    /// Transpose in semitones (positive or negative).
    #[arg(short, long, default_value_t = 0)]
    pub transpose: i32,

    /// How many times to play the tune through.
    #[arg(short, long, default_value_t = 1)]
    pub repeat: usize,

    /// Seed for every random decision; same seed, same performance.
    #[arg(short, long)]
    pub seed: Option<u64>,

    /// How much external intensity bends the performance, in [-1, 1].
    #[arg(long = "human-impact")]
    pub human_impact: Option<f64>,

    /// Snap wrong notes onto the scale of the key. Defaults to the
    /// configured value.
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    pub diatonic: Option<bool>,

    /// Number of performers playing together.
    #[arg(short, long, default_value_t = 1)]
    pub performers: usize,

    /// Controller number carrying the relayed ensemble intensity.
    #[arg(long, default_value_t = 49)]
    pub intensity_control: u8,

    /// Controller number carrying the relayed human impact.
    #[arg(long, default_value_t = 50)]
    pub human_impact_control: u8,

    /// Record the performance and save it as a MIDI file on completion.
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Start immediately instead of waiting for a start message.
    #[arg(long, action = ArgAction::Set, value_name = "BOOL", default_value_t = true)]
    pub autostart: bool,

    /// Prints every performed event to the terminal.
    #[arg(short, long)]
    pub verbose: bool,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn boolean_flags_take_explicit_values() {
        let args = Args::try_parse_from([
            "ceol",
            "tune.mid",
            "--diatonic",
            "false",
            "--autostart",
            "false",
        ])
        .unwrap();
        assert_eq!(args.diatonic, Some(false));
        assert!(!args.autostart);
    }

    #[test]
    fn diatonic_is_unset_unless_given() {
        let args = Args::try_parse_from(["ceol", "tune.mid"]).unwrap();
        assert_eq!(args.diatonic, None);
        assert!(args.autostart);
    }
}
