//! Options the playlist core consumes, with their persisted defaults.

use std::path::Path;

use log::warn;

/// Runtime options of the playlist core, persisted to `core.toml`.
///
/// Changes enter through [`crate::PlaylistCore::set_config`]: flipping
/// `metadata_on_play` re-evaluates the background scan, the title fields
/// reformat entry titles across all playlists.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CoreConfig {
    /// Defer metadata reads until an entry is played. Suspends the
    /// background sweep; on-demand and playback scans still run.
    #[serde(default)]
    pub metadata_on_play: bool,
    /// Always restore the previous session in the paused state.
    #[serde(default)]
    pub always_resume_paused: bool,
    /// Pick songs in shuffled order.
    #[serde(default)]
    pub shuffle: bool,
    /// Template applied when an entry has both a title and an artist.
    #[serde(default = "default_title_format")]
    pub generic_title_format: String,
    /// Zero-pad entry numbers to the playlist width.
    #[serde(default)]
    pub leading_zero: bool,
    /// Show lengths of an hour or more as h:mm:ss.
    #[serde(default = "default_true")]
    pub show_hours: bool,
    /// Substitute filename-derived values for missing tags.
    #[serde(default = "default_true")]
    pub metadata_fallbacks: bool,
    /// Prefix formatted titles with the entry number.
    #[serde(default)]
    pub show_numbers: bool,
}

fn default_true() -> bool {
    true
}

fn default_title_format() -> String {
    "${artist} - ${title}".to_string()
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            metadata_on_play: false,
            always_resume_paused: false,
            shuffle: false,
            generic_title_format: default_title_format(),
            leading_zero: false,
            show_hours: true,
            metadata_fallbacks: true,
            show_numbers: false,
        }
    }
}

impl CoreConfig {
    /// Reads the config from `path`, falling back to defaults if the file is
    /// missing or malformed.
    pub fn load_from_path(path: &Path) -> Self {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(_) => return CoreConfig::default(),
        };
        match toml::from_str(&text) {
            Ok(config) => config,
            Err(err) => {
                warn!(
                    "Failed to parse config file {}. Using defaults. error={}",
                    path.display(),
                    err
                );
                CoreConfig::default()
            }
        }
    }

    pub(crate) fn title_options_differ(&self, other: &CoreConfig) -> bool {
        self.generic_title_format != other.generic_title_format
            || self.leading_zero != other.leading_zero
            || self.show_hours != other.show_hours
            || self.metadata_fallbacks != other.metadata_fallbacks
            || self.show_numbers != other.show_numbers
    }
}
