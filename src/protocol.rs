//! Shared value types passed between the core, its collaborators, and event
//! subscribers.

use std::fs::File;
use std::path::Path;

use crate::playlist_manager::Playlist;

/// Severity of a pending observer notification.
///
/// Levels are ordered: a `Structure` change subsumes `Metadata`, which
/// subsumes `Selection`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum UpdateLevel {
    #[default]
    NoUpdate,
    Selection,
    Metadata,
    Structure,
}

/// Range descriptor for a batch of pending playlist changes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Update {
    pub level: UpdateLevel,
    pub at: usize,
    pub count: usize,
}

impl Update {
    /// Widens this descriptor to also cover `level` over `at .. at + count`.
    pub(crate) fn expand(&mut self, level: UpdateLevel, at: usize, count: usize) {
        if self.level == UpdateLevel::NoUpdate {
            *self = Update { level, at, count };
            return;
        }
        let end = (self.at + self.count).max(at + count);
        self.at = self.at.min(at);
        self.count = end - self.at;
        self.level = self.level.max(level);
    }
}

/// How entry reads behave when the requested data has not been scanned yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetMode {
    /// Return whatever is cached, possibly nothing.
    Nowait,
    /// Block until the data is available or waiting is known to be futile.
    Wait,
}

/// Identifies the input plugin able to decode an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    pub name: &'static str,
}

/// Metadata record attached to a playlist entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tuple {
    pub title: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub genre: Option<String>,
    pub year: Option<u32>,
    pub track_number: Option<u32>,
    pub length_ms: Option<u64>,
    /// Segment start for cuesheet entries. Stream metadata never overwrites
    /// a tuple that carries this.
    pub start_time_ms: Option<u64>,
}

impl Tuple {
    /// Fallback tuple guessed from the file name alone.
    pub fn from_filename(filename: &str) -> Self {
        let stem = Path::new(filename)
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or(filename);
        Tuple {
            title: Some(stem.to_string()),
            ..Tuple::default()
        }
    }
}

/// One item handed to [`Playlist::insert_items`].
#[derive(Debug, Clone)]
pub struct AddItem {
    pub filename: String,
    /// Metadata already known to the caller, e.g. read from a playlist file.
    /// Entries without one are picked up by the background scan.
    pub tuple: Option<Tuple>,
}

impl AddItem {
    pub fn new(filename: impl Into<String>) -> Self {
        AddItem {
            filename: filename.into(),
            tuple: None,
        }
    }

    pub fn with_tuple(filename: impl Into<String>, tuple: Tuple) -> Self {
        AddItem {
            filename: filename.into(),
            tuple: Some(tuple),
        }
    }
}

/// Everything the playback thread needs to start decoding the current entry.
#[derive(Debug, Default)]
pub struct DecodeInfo {
    pub filename: Option<String>,
    pub decoder: Option<Decoder>,
    pub file: Option<File>,
    pub error: Option<String>,
}

/// Notifications emitted on the core's broadcast bus.
///
/// For a single operation the playback events arrive in the fixed order
/// `PlaylistSetPlaying`, `PlaylistPosition`, `PlaybackBegin`, `PlaybackStop`.
#[derive(Debug, Clone)]
pub enum Event {
    /// The active playlist changed.
    PlaylistActivate,
    /// The playing playlist changed, possibly to none.
    PlaylistSetPlaying,
    /// The current entry within the carried playlist changed.
    PlaylistPosition(Playlist),
    PlaybackBegin,
    PlaybackStop,
    /// A batch of playlist mutations is ready for observers; the payload is
    /// the highest level in the batch. Observers read
    /// [`Playlist::update_detail`] on each handle for the ranges.
    PlaylistUpdate(UpdateLevel),
    /// A playlist's background scan has drained.
    PlaylistScanComplete,
}
