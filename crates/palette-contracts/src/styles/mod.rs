mod history;
mod library;
mod profile;

pub use history::{describe_history, HistoryStep};
pub use library::{Persisted, StyleLibrary, DEFAULT_QUOTA_BYTES, STYLE_LIBRARY_KEY};
pub use profile::{
    normalize_hex_color, StyleAnalysis, StyleEdit, StyleProfile, StyleSnapshot,
};
