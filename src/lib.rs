pub mod contour;
mod groover;
mod midi_importer;
pub mod model;
mod ornament;
pub mod performer;
mod player;
mod sync;
mod util;

pub use groover::*;
pub use midi_importer::*;
pub use model::config::*;
pub use model::score::*;
pub use model::settings::*;
pub use ornament::*;
pub use player::*;
pub use sync::*;
pub use util::*;
