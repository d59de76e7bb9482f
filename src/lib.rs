//! Playlist core for the Tonedeck desktop audio player.
//!
//! This crate owns the ordered collection of playlists, coordinates
//! background metadata scanning against them, drives the playback cursor
//! across entry transitions, and persists resume state across restarts.
//!
//! Everything hangs off a [`PlaylistCore`]. Individual playlists are reached
//! through [`Playlist`] handles: cheap value types that stay safe to hold
//! after the playlist they name has been deleted (operations then return a
//! documented default). The audio engine and album-art cache are external
//! collaborators, reached through the [`PlaybackEngine`] and [`ArtCache`]
//! traits. State changes are announced as [`Event`]s on a broadcast channel
//! obtained from [`PlaylistCore::subscribe`].

mod config;
mod dispatcher;
mod playback;
mod playlist;
mod playlist_manager;
mod protocol;
mod scanner;
mod state_persistence;

pub use config::CoreConfig;
pub use playback::{ArtCache, NullArt, NullPlayback, PlaybackEngine};
pub use playlist_manager::{Playlist, PlaylistCore};
pub use protocol::{AddItem, DecodeInfo, Decoder, Event, GetMode, Tuple, Update, UpdateLevel};
