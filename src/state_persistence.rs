//! Reader and writer for the session resume state.
//!
//! `playlist-state` is a line-oriented UTF-8 file in the user directory:
//!
//! ```text
//! active 0
//! playing 2
//! playlist 0
//! filename /home/user/mix.audpl
//! position 5
//! resume-state 1
//! resume-time 45000
//! ```
//!
//! Numbers are decimal integers. Unknown keys are skipped, missing keys take
//! defaults (`active 0`, `playing -1`, `position -1`, `resume-state` play,
//! `resume-time 0`). Writing is best-effort; a failure is logged and
//! swallowed.

use std::fmt::Write as _;
use std::io;
use std::path::Path;

use log::warn;

pub(crate) const STATE_FILE: &str = "playlist-state";

/// Per-playlist resume disposition, stored as its numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResumeState {
    /// Do not resume this playlist.
    Stop,
    Play,
    Pause,
}

impl ResumeState {
    fn code(self) -> i64 {
        match self {
            ResumeState::Stop => 0,
            ResumeState::Play => 1,
            ResumeState::Pause => 2,
        }
    }

    fn from_code(code: i64) -> ResumeState {
        match code {
            0 => ResumeState::Stop,
            2 => ResumeState::Pause,
            _ => ResumeState::Play,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PlaylistState {
    pub index: i64,
    pub filename: Option<String>,
    pub position: i64,
    pub resume_state: ResumeState,
    pub resume_time: i64,
}

impl PlaylistState {
    fn new(index: i64) -> Self {
        PlaylistState {
            index,
            filename: None,
            position: -1,
            resume_state: ResumeState::Play,
            resume_time: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct StateDoc {
    pub active: i64,
    pub playing: i64,
    pub playlists: Vec<PlaylistState>,
}

impl Default for StateDoc {
    fn default() -> Self {
        StateDoc {
            active: 0,
            playing: -1,
            playlists: Vec::new(),
        }
    }
}

pub(crate) fn write_state_file(path: &Path, doc: &StateDoc) -> io::Result<()> {
    let mut out = String::new();
    let _ = writeln!(out, "active {}", doc.active);
    let _ = writeln!(out, "playing {}", doc.playing);
    for playlist in &doc.playlists {
        let _ = writeln!(out, "playlist {}", playlist.index);
        if let Some(filename) = &playlist.filename {
            let _ = writeln!(out, "filename {}", filename);
        }
        let _ = writeln!(out, "position {}", playlist.position);
        let _ = writeln!(out, "resume-state {}", playlist.resume_state.code());
        let _ = writeln!(out, "resume-time {}", playlist.resume_time);
    }
    std::fs::write(path, out)
}

/// Best-effort variant of [`write_state_file`].
pub(crate) fn save_state_file(path: &Path, doc: &StateDoc) {
    if let Err(err) = write_state_file(path, doc) {
        warn!(
            "PlaylistManager: failed to write {}: {}",
            path.display(),
            err
        );
    }
}

pub(crate) fn read_state_file(path: &Path) -> io::Result<StateDoc> {
    let text = std::fs::read_to_string(path)?;
    Ok(parse_state(&text))
}

fn parse_state(text: &str) -> StateDoc {
    let mut doc = StateDoc::default();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key, value.trim()),
            None => (line, ""),
        };
        let int = value.parse::<i64>().ok();

        match key {
            "active" => {
                if let Some(value) = int {
                    doc.active = value;
                }
            }
            "playing" => {
                if let Some(value) = int {
                    doc.playing = value;
                }
            }
            "playlist" => {
                if let Some(value) = int {
                    doc.playlists.push(PlaylistState::new(value));
                }
            }
            "filename" => {
                if let Some(playlist) = doc.playlists.last_mut() {
                    if !value.is_empty() {
                        playlist.filename = Some(value.to_string());
                    }
                }
            }
            "position" => {
                if let (Some(playlist), Some(value)) = (doc.playlists.last_mut(), int) {
                    playlist.position = value;
                }
            }
            "resume-state" => {
                if let (Some(playlist), Some(value)) = (doc.playlists.last_mut(), int) {
                    playlist.resume_state = ResumeState::from_code(value);
                }
            }
            "resume-time" => {
                if let (Some(playlist), Some(value)) = (doc.playlists.last_mut(), int) {
                    playlist.resume_time = value;
                }
            }
            _ => {}
        }
    }

    doc
}
