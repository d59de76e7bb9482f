//! The playlist core: registry, identity records, scan scheduling, playback
//! coupling, and the public handle type.
//!
//! One mutex guards all of it; one condition variable wakes blocked entry
//! reads when a scan completes. Handles reach the core through a weak
//! reference and degrade to documented defaults once their playlist (or the
//! whole core) is gone.
//!
//! Identity model: each playlist gets an integer stamp for its lifetime.
//! The stamp's record in the ID table is never removed, it only loses its
//! data when the playlist is destroyed. That makes every outstanding
//! [`Playlist`] handle a safe weak reference:
//!
//! ```text
//! Playlist (public handle) -> ID record (stamp, weak) -> PlaylistData
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use log::{debug, info};
use tokio::sync::broadcast;

use crate::config::CoreConfig;
use crate::dispatcher::{Dispatcher, Tick, UPDATE_DELAY};
use crate::playback::{ArtCache, PlaybackEngine};
use crate::playlist::{PlaylistData, ScanStatus, Stamp};
use crate::protocol::{
    AddItem, DecodeInfo, Decoder, Event, GetMode, Tuple, Update, UpdateLevel,
};
use crate::scanner::{ScanRequest, ScannerPool, SCAN_FILE, SCAN_IMAGE, SCAN_THREADS, SCAN_TUPLE};
use crate::state_persistence::{self, PlaylistState, ResumeState, StateDoc, STATE_FILE};

const DEFAULT_TITLE: &str = "New Playlist";
const TEMP_TITLE: &str = "Now Playing";
const FIRST_STAMP: Stamp = 1000;

/* deferred playback hooks, fired outside the lock in this order */
const SET_PLAYLIST: u32 = 1 << 0;
const SET_POSITION: u32 = 1 << 1;
const PLAYBACK_BEGIN: u32 = 1 << 2;
const PLAYBACK_STOP: u32 = 1 << 3;

/// Stamp record: display index and data while alive, nothing after
/// destruction. Records stay in the table forever so stale handles resolve
/// to defaults instead of dangling.
struct IdRecord {
    index: Option<usize>,
    data: Option<PlaylistData>,
}

/// One in-flight scan. `pending` holds the request until it is handed to a
/// scanner worker or the playback thread.
struct ScanItem {
    stamp: Stamp,
    entry_key: u64,
    request_serial: u64,
    pending: Option<ScanRequest>,
    for_playback: bool,
    handled_by_playback: bool,
}

struct State {
    ids: HashMap<Stamp, IdRecord>,
    next_stamp: Stamp,
    /// Registry order; `ids[stamp].index` mirrors each position.
    order: Vec<Stamp>,
    active: Option<Stamp>,
    playing: Option<Stamp>,
    resume_playlist: Option<usize>,
    resume_paused: bool,
    scan_playlist: usize,
    scan_row: usize,
    scan_enabled_nominal: bool,
    scan_enabled: bool,
    scan_list: Vec<ScanItem>,
    update_level: UpdateLevel,
    update_delayed: bool,
    next_request_serial: u64,
    config: CoreConfig,
}

impl State {
    fn data(&self, stamp: Stamp) -> Option<&PlaylistData> {
        self.ids.get(&stamp).and_then(|record| record.data.as_ref())
    }

    fn data_mut(&mut self, stamp: Stamp) -> Option<&mut PlaylistData> {
        self.ids
            .get_mut(&stamp)
            .and_then(|record| record.data.as_mut())
    }

    fn index_of(&self, stamp: Stamp) -> Option<usize> {
        self.ids.get(&stamp).and_then(|record| record.index)
    }

    fn number_playlists(&mut self, from: usize) {
        for i in from..self.order.len() {
            let stamp = self.order[i];
            if let Some(record) = self.ids.get_mut(&stamp) {
                record.index = Some(i);
            }
        }
    }

    /// Mints an ID record, honoring a free requested stamp.
    fn create_playlist(&mut self, requested: Option<Stamp>) -> Stamp {
        let stamp = match requested {
            Some(stamp) if stamp >= 0 && !self.ids.contains_key(&stamp) => stamp,
            _ => {
                while self.ids.contains_key(&self.next_stamp) {
                    self.next_stamp += 1;
                }
                self.next_stamp
            }
        };
        self.ids.insert(
            stamp,
            IdRecord {
                index: None,
                data: Some(PlaylistData::new(stamp, DEFAULT_TITLE)),
            },
        );
        stamp
    }

    fn entry_probe(&self, stamp: Stamp, entry_num: usize) -> Option<(EntrySnapshot, u64, bool)> {
        let entry = self.data(stamp)?.entry_at(entry_num)?;
        Some((
            EntrySnapshot {
                decoder: entry.decoder,
                tuple: entry.tuple.clone(),
                error: entry.error.clone(),
            },
            entry.key,
            entry.filename.starts_with("stdin://"),
        ))
    }

    /// Drops scan items whose playlist or entry no longer exists.
    fn prune_scan_items(&mut self) {
        let ids = &self.ids;
        self.scan_list.retain(|item| {
            ids.get(&item.stamp)
                .and_then(|record| record.data.as_ref())
                .is_some_and(|data| data.entry_by_key(item.entry_key).is_some())
        });
    }
}

struct EntrySnapshot {
    decoder: Option<Decoder>,
    tuple: Option<Tuple>,
    error: Option<String>,
}

pub(crate) struct Shared {
    state: Mutex<State>,
    cond: Condvar,
    events: broadcast::Sender<Event>,
    playback: Arc<dyn PlaybackEngine>,
    art: Arc<dyn ArtCache>,
    scanner: ScannerPool,
    dispatcher: Dispatcher,
    user_dir: PathBuf,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    /* ---- update dispatch ---- */

    fn queue_global_update(&self, st: &mut State, level: UpdateLevel, delayed: bool) {
        if level == UpdateLevel::Structure {
            self.scan_restart(st);
        }

        if delayed {
            if st.update_level == UpdateLevel::NoUpdate {
                self.dispatcher.schedule_update(Some(UPDATE_DELAY));
                st.update_delayed = true;
            }
        } else if st.update_level == UpdateLevel::NoUpdate || st.update_delayed {
            // a non-delayed update promotes any pending delayed one
            self.dispatcher.schedule_update(None);
            st.update_delayed = false;
        }

        st.update_level = st.update_level.max(level);
    }

    /// Entry point for every queued container update: structural changes
    /// reopen the scan, metadata changes on the playing playlist re-push the
    /// current tuple to the engine and mark the playlist modified.
    fn signal_update_queued(&self, st: &mut State, stamp: Stamp, update: Update, delayed: bool) {
        let playing = st.playing == Some(stamp);
        if let Some(data) = st.data_mut(stamp) {
            if update.level == UpdateLevel::Structure {
                data.scan_status = ScanStatus::ScanActive;
            }
            if update.level >= UpdateLevel::Metadata {
                if playing {
                    if let Some(entry) = data.position().and_then(|pos| data.entry_at(pos)) {
                        self.playback
                            .set_info(entry.number, entry.tuple.clone().unwrap_or_default());
                    }
                }
                data.modified = true;
            }
        }
        self.queue_global_update(st, update.level, delayed);
    }

    /// The deferred tick: rotate every playlist's pending descriptor into
    /// its last-update slot, then announce the captured level.
    fn run_update(&self) {
        let level = {
            let mut st = self.lock();
            let stamps = st.order.clone();
            for stamp in stamps {
                if let Some(data) = st.data_mut(stamp) {
                    data.swap_updates();
                }
            }
            let level = st.update_level;
            st.update_level = UpdateLevel::NoUpdate;
            st.update_delayed = false;
            level
        };
        if level != UpdateLevel::NoUpdate {
            self.emit(Event::PlaylistUpdate(level));
        }
    }

    /* ---- scan scheduler ---- */

    fn scan_queue_entry(&self, st: &mut State, stamp: Stamp, entry_num: usize, for_playback: bool) {
        let serial = st.next_request_serial;
        st.next_request_serial += 1;

        let probe = {
            let Some(data) = st.data(stamp) else { return };
            let Some(entry) = data.entry_at(entry_num) else {
                return;
            };
            (entry.filename.clone(), entry.decoder, entry.tuple.clone(), entry.key)
        };
        let (filename, decoder, prior_tuple, key) = probe;

        let mut flags = 0;
        if prior_tuple.is_none() {
            flags |= SCAN_TUPLE;
        }
        if for_playback {
            flags |= SCAN_IMAGE | SCAN_FILE;
        }
        // a still-valid tuple rides along for reuse instead of being re-read
        let request = ScanRequest::new(
            serial,
            &filename,
            flags,
            decoder,
            if flags & SCAN_TUPLE != 0 { None } else { prior_tuple },
        );

        let mut item = ScanItem {
            stamp,
            entry_key: key,
            request_serial: serial,
            pending: None,
            for_playback,
            handled_by_playback: false,
        };
        if for_playback {
            // the playback thread runs this one synchronously
            item.pending = Some(request);
            st.scan_list.push(item);
        } else {
            st.scan_list.push(item);
            self.scanner.dispatch(request);
        }
    }

    /// Clears the playback tag from the scan list. A request the playback
    /// thread never consumed is requeued so the work is not lost.
    fn scan_reset_playback(&self, st: &mut State) {
        let Some(item) = st.scan_list.iter_mut().find(|item| item.for_playback) else {
            return;
        };
        item.for_playback = false;
        if !item.handled_by_playback {
            if let Some(request) = item.pending.take() {
                self.scanner.dispatch(request);
            }
        }
    }

    fn scan_check_complete(&self, st: &mut State, stamp: Stamp) {
        let in_flight = st.scan_list.iter().any(|item| item.stamp == stamp);
        let Some(data) = st.data_mut(stamp) else { return };
        if data.scan_status != ScanStatus::ScanEnding || in_flight {
            return;
        }
        data.scan_status = ScanStatus::NotScanning;
        debug!("PlaylistManager: scan of \"{}\" complete", data.title);

        if st.update_delayed {
            self.dispatcher.schedule_update(None);
            st.update_delayed = false;
        }
        // re-queueing replaces an undelivered event, deduplicating
        // back-to-back completions
        self.dispatcher.queue_scan_complete();
    }

    /// Walks the sweep cursor to the next scannable entry and queues it.
    fn scan_queue_next_entry(&self, st: &mut State) -> bool {
        if !st.scan_enabled {
            return false;
        }

        while st.scan_playlist < st.order.len() {
            let stamp = st.order[st.scan_playlist];

            if st.data(stamp).map(|data| data.scan_status) == Some(ScanStatus::ScanActive) {
                loop {
                    let probe = st.data(stamp).and_then(|data| {
                        let row = data.next_unscanned_entry(st.scan_row)?;
                        let entry = data.entry_at(row)?;
                        Some((row, entry.key, entry.filename.starts_with("stdin://")))
                    });
                    let Some((row, key, is_stream)) = probe else { break };
                    st.scan_row = row;

                    let in_list = st
                        .scan_list
                        .iter()
                        .any(|item| item.stamp == stamp && item.entry_key == key);
                    // stdin is not seekable, never scan it
                    if !in_list && !is_stream {
                        self.scan_queue_entry(st, stamp, row, false);
                        return true;
                    }
                    st.scan_row = row + 1;
                }

                if let Some(data) = st.data_mut(stamp) {
                    data.scan_status = ScanStatus::ScanEnding;
                }
                self.scan_check_complete(st, stamp);
            }

            st.scan_playlist += 1;
            st.scan_row = 0;
        }

        false
    }

    fn scan_schedule(&self, st: &mut State) {
        let mut scheduled = st.scan_list.len();
        while scheduled < SCAN_THREADS && self.scan_queue_next_entry(st) {
            scheduled += 1;
        }
    }

    fn scan_restart(&self, st: &mut State) {
        st.scan_playlist = 0;
        st.scan_row = 0;
        self.scan_schedule(st);
    }

    /// Completion callback for every scan request, from the worker pool or
    /// the playback thread.
    pub(crate) fn scan_finish(&self, request: &ScanRequest) {
        let mut st = self.lock();

        let Some(at) = st
            .scan_list
            .iter()
            .position(|item| item.request_serial == request.serial)
        else {
            // canceled while the request was running
            return;
        };
        let item = st.scan_list.remove(at);

        // only drizzle delayed updates while a scan is still in progress
        let delayed = st.scan_enabled
            && st
                .data(item.stamp)
                .is_some_and(|data| data.scan_status != ScanStatus::NotScanning);

        let config = st.config.clone();
        let update = st
            .data_mut(item.stamp)
            .and_then(|data| data.update_entry_from_scan(item.entry_key, request, &config));
        if let Some(update) = update {
            self.signal_update_queued(&mut st, item.stamp, update, delayed);
        }

        self.scan_check_complete(&mut st, item.stamp);
        self.scan_schedule(&mut st);

        self.cond.notify_all();
    }

    fn scan_cancel(&self, st: &mut State, stamp: Stamp, key: u64) {
        st.scan_list
            .retain(|item| !(item.stamp == stamp && item.entry_key == key));
    }

    /* ---- blocking entry read ---- */

    /// Resolves an entry, optionally blocking until a scan has populated the
    /// requested data. The lock is released while waiting; after one issued
    /// scan the read gives up rather than loop forever on data the scanner
    /// cannot produce.
    fn get_entry<'a>(
        &self,
        mut st: MutexGuard<'a, State>,
        stamp: Option<Stamp>,
        entry_num: usize,
        need_decoder: bool,
        need_tuple: bool,
    ) -> (MutexGuard<'a, State>, Option<EntrySnapshot>) {
        let mut scan_started = false;

        loop {
            let Some(stamp) = stamp else { return (st, None) };
            let Some((snapshot, key, is_stream)) = st.entry_probe(stamp, entry_num) else {
                return (st, None);
            };

            if is_stream
                || ((!need_decoder || snapshot.decoder.is_some())
                    && (!need_tuple || snapshot.tuple.is_some()))
            {
                return (st, Some(snapshot));
            }

            let in_list = st
                .scan_list
                .iter()
                .any(|item| item.stamp == stamp && item.entry_key == key);
            if !in_list {
                if scan_started {
                    return (st, Some(snapshot));
                }
                self.scan_queue_entry(&mut st, stamp, entry_num, false);
            }

            scan_started = true;
            st = self.cond.wait(st).unwrap();
        }
    }

    /* ---- playback coupling ---- */

    fn start_playback_locked(&self, st: &mut State, seek_time: i64, pause: bool) {
        self.art.clear_current();
        self.scan_reset_playback(st);
        self.playback.play(seek_time, pause);

        let Some(stamp) = st.playing else { return };
        let target = st.data(stamp).and_then(|data| {
            let pos = data.position()?;
            let entry = data.entry_at(pos)?;
            Some((pos, entry.key))
        });
        // playback always begins with a rescan of the current entry, to open
        // the file, ensure a valid tuple, and read the album art
        if let Some((pos, key)) = target {
            self.scan_cancel(st, stamp, key);
            self.scan_queue_entry(st, stamp, pos, true);
        }

        // the sweep starts over so entries around the new position are
        // covered promptly
        self.scan_restart(st);
    }

    fn stop_playback_locked(&self, st: &mut State) {
        self.art.clear_current();
        self.scan_reset_playback(st);
        self.playback.stop();
    }

    fn set_playing_locked(&self, st: &mut State, target: Option<Stamp>, paused: bool) -> u32 {
        if target == st.playing {
            // already playing; only the pause state may need to change
            if target.is_some() && self.playback.paused() != paused {
                self.playback.toggle_pause();
            }
            return 0;
        }

        let mut hooks = SET_PLAYLIST;

        if let Some(previous) = st.playing {
            let time = self.playback.time();
            if let Some(data) = st.data_mut(previous) {
                data.resume_time = time;
            }
        }

        let mut target = target;
        if let Some(stamp) = target {
            // is there anything to play?
            let needs_position = st.data(stamp).map_or(true, |data| data.position().is_none());
            if needs_position {
                let shuffle = st.config.shuffle;
                let advanced = st
                    .data_mut(stamp)
                    .is_some_and(|data| data.next_song(shuffle, true, 0));
                if advanced {
                    hooks |= SET_POSITION;
                } else {
                    target = None;
                }
            }
        }

        st.playing = target;

        if let Some(stamp) = target {
            let seek = st.data(stamp).map_or(0, |data| data.resume_time);
            self.start_playback_locked(st, seek, paused);
            hooks |= PLAYBACK_BEGIN;
        } else {
            self.stop_playback_locked(st);
            hooks |= PLAYBACK_STOP;
        }

        hooks
    }

    /// Re-syncs playback after a mutation moved the playing position.
    fn change_playback(&self, st: &mut State, stamp: Stamp) -> u32 {
        let mut hooks = SET_POSITION;

        if st.playing == Some(stamp) {
            if st.data(stamp).and_then(|data| data.position()).is_some() {
                let paused = self.playback.paused();
                self.start_playback_locked(st, 0, paused);
                hooks |= PLAYBACK_BEGIN;
            } else {
                st.playing = None;
                self.stop_playback_locked(st);
                hooks |= SET_PLAYLIST | PLAYBACK_STOP;
            }
        }

        hooks
    }

    fn call_playback_hooks(&self, playlist: Playlist, hooks: u32) {
        if hooks & SET_PLAYLIST != 0 {
            self.emit(Event::PlaylistSetPlaying);
        }
        if hooks & SET_POSITION != 0 {
            self.emit(Event::PlaylistPosition(playlist));
        }
        if hooks & PLAYBACK_BEGIN != 0 {
            self.emit(Event::PlaybackBegin);
        }
        if hooks & PLAYBACK_STOP != 0 {
            self.emit(Event::PlaybackStop);
        }
    }

    fn playback_entry(&self, st: &State, serial: u32) -> Option<(Stamp, u64, usize)> {
        if !self.playback.check_serial(serial) {
            return None;
        }
        let stamp = st.playing?;
        let data = st.data(stamp)?;
        let pos = data.position()?;
        let entry = data.entry_at(pos)?;
        Some((stamp, entry.key, pos))
    }

    /* ---- registry ---- */

    fn insert_playlist_locked(&self, st: &mut State, at: usize, stamp: Option<Stamp>) -> Stamp {
        let at = at.min(st.order.len());
        let stamp = st.create_playlist(stamp);
        st.order.insert(at, stamp);
        st.number_playlists(at);

        // only happens at startup
        if st.active.is_none() {
            st.active = Some(stamp);
        }

        let update = st
            .data_mut(stamp)
            .map(|data| data.queue_update(UpdateLevel::Structure, 0, 0));
        if let Some(update) = update {
            self.signal_update_queued(st, stamp, update, false);
        }
        debug!("PlaylistManager: inserted playlist {} at {}", stamp, at);
        stamp
    }

    fn get_blank_locked(&self, st: &mut State) -> Option<Stamp> {
        let active = st.active?;
        let reusable = st
            .data(active)
            .is_some_and(|data| data.title == DEFAULT_TITLE && data.n_entries() == 0);
        if reusable {
            return Some(active);
        }
        let at = st.index_of(active).map_or(st.order.len(), |i| i + 1);
        Some(self.insert_playlist_locked(st, at, None))
    }

    fn reformat_titles(&self, st: &mut State) {
        let config = st.config.clone();
        let stamps = st.order.clone();
        for stamp in stamps {
            let update = st
                .data_mut(stamp)
                .and_then(|data| data.reformat_titles(&config));
            if let Some(update) = update {
                self.signal_update_queued(st, stamp, update, false);
            }
        }
    }
}

/// Owner of the playlist registry. The registry always holds at least one
/// playlist; dropping the core stops the scanner and dispatcher threads.
pub struct PlaylistCore {
    shared: Arc<Shared>,
}

impl PlaylistCore {
    /// Builds the core with one fresh playlist, which becomes active.
    /// `user_dir` is where `playlist-state` lives.
    pub fn new(
        user_dir: impl Into<PathBuf>,
        playback: Arc<dyn PlaybackEngine>,
        art: Arc<dyn ArtCache>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);

        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let finish_weak = weak.clone();
            let scanner = ScannerPool::spawn(Arc::new(move |request: ScanRequest| {
                if let Some(shared) = finish_weak.upgrade() {
                    shared.scan_finish(&request);
                }
            }));

            let tick_weak = weak.clone();
            let dispatcher = Dispatcher::spawn(move |tick| {
                let Some(shared) = tick_weak.upgrade() else { return };
                match tick {
                    Tick::Update => shared.run_update(),
                    Tick::ScanComplete => shared.emit(Event::PlaylistScanComplete),
                }
            });

            Shared {
                state: Mutex::new(State {
                    ids: HashMap::new(),
                    next_stamp: FIRST_STAMP,
                    order: Vec::new(),
                    active: None,
                    playing: None,
                    resume_playlist: None,
                    resume_paused: false,
                    scan_playlist: 0,
                    scan_row: 0,
                    scan_enabled_nominal: false,
                    scan_enabled: false,
                    scan_list: Vec::new(),
                    update_level: UpdateLevel::NoUpdate,
                    update_delayed: false,
                    next_request_serial: 1,
                    config: CoreConfig::default(),
                }),
                cond: Condvar::new(),
                events,
                playback,
                art,
                scanner,
                dispatcher,
                user_dir: user_dir.into(),
            }
        });

        {
            let mut st = shared.lock();
            shared.insert_playlist_locked(&mut st, 0, None);
        }
        info!("PlaylistManager: initialized");

        PlaylistCore { shared }
    }

    /// Subscribes to core events; see [`Event`] for the catalogue.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.shared.events.subscribe()
    }

    pub fn config(&self) -> CoreConfig {
        self.shared.lock().config.clone()
    }

    /// Applies a config change: `metadata_on_play` re-evaluates the
    /// background sweep, title options reformat every playlist.
    pub fn set_config(&self, config: CoreConfig) {
        let mut st = self.shared.lock();
        let previous = std::mem::replace(&mut st.config, config.clone());

        if previous.metadata_on_play != config.metadata_on_play {
            st.scan_enabled = st.scan_enabled_nominal && !config.metadata_on_play;
            self.shared.scan_restart(&mut st);
        }
        if previous.title_options_differ(&config) {
            self.shared.reformat_titles(&mut st);
        }
    }

    /// Turns the background sweep on or off. On-demand and playback scans
    /// keep working either way.
    pub fn enable_scan(&self, enable: bool) {
        let mut st = self.shared.lock();
        st.scan_enabled_nominal = enable;
        st.scan_enabled = enable && !st.config.metadata_on_play;
        self.shared.scan_restart(&mut st);
    }

    pub fn n_playlists(&self) -> usize {
        self.shared.lock().order.len()
    }

    /// Handle for the playlist at `at`; a null handle when out of range.
    pub fn by_index(&self, at: usize) -> Playlist {
        let stamp = self.shared.lock().order.get(at).copied();
        Playlist::of(&self.shared, stamp)
    }

    pub fn active_playlist(&self) -> Playlist {
        let stamp = self.shared.lock().active;
        Playlist::of(&self.shared, stamp)
    }

    /// The playlist owning the playback cursor; a null handle when stopped.
    pub fn playing_playlist(&self) -> Playlist {
        let stamp = self.shared.lock().playing;
        Playlist::of(&self.shared, stamp)
    }

    pub fn insert_playlist(&self, at: usize) -> Playlist {
        let stamp = {
            let mut st = self.shared.lock();
            self.shared.insert_playlist_locked(&mut st, at, None)
        };
        Playlist::of(&self.shared, Some(stamp))
    }

    /// Insert with a requested stamp, used when restoring playlists from
    /// their on-disk files.
    pub fn insert_with_stamp(&self, at: usize, stamp: i32) -> Playlist {
        let stamp = {
            let mut st = self.shared.lock();
            self.shared.insert_playlist_locked(&mut st, at, Some(stamp))
        };
        Playlist::of(&self.shared, Some(stamp))
    }

    /// Inserts just after the active playlist and makes the new one active.
    pub fn new_playlist(&self) -> Playlist {
        let stamp = {
            let mut st = self.shared.lock();
            let at = st
                .active
                .and_then(|active| st.index_of(active))
                .map_or(st.order.len(), |i| i + 1);
            let stamp = self.shared.insert_playlist_locked(&mut st, at, None);
            st.active = Some(stamp);
            stamp
        };
        self.shared.emit(Event::PlaylistActivate);
        Playlist::of(&self.shared, Some(stamp))
    }

    /// The active playlist if it is still a pristine default, else a fresh
    /// playlist inserted right after it.
    pub fn blank_playlist(&self) -> Playlist {
        let stamp = {
            let mut st = self.shared.lock();
            self.shared.get_blank_locked(&mut st)
        };
        Playlist::of(&self.shared, stamp)
    }

    /// The playlist titled "Now Playing", created from a blank one if
    /// missing.
    pub fn temporary_playlist(&self) -> Playlist {
        let stamp = {
            let mut st = self.shared.lock();
            let found = st
                .order
                .iter()
                .copied()
                .find(|&stamp| st.data(stamp).is_some_and(|data| data.title == TEMP_TITLE));
            match found {
                Some(stamp) => Some(stamp),
                None => {
                    let stamp = self.shared.get_blank_locked(&mut st);
                    if let Some(stamp) = stamp {
                        if let Some(data) = st.data_mut(stamp) {
                            data.title = TEMP_TITLE.to_string();
                        }
                    }
                    stamp
                }
            }
        };
        Playlist::of(&self.shared, stamp)
    }

    /// Moves `count` playlists from `from` so the block ends up at `to`.
    /// Out-of-range arguments are ignored.
    pub fn reorder_playlists(&self, from: usize, to: usize, count: usize) {
        let mut st = self.shared.lock();
        let len = st.order.len();
        if count == 0 || from + count > len || to + count > len {
            return;
        }

        let moved: Vec<Stamp> = st.order.drain(from..from + count).collect();
        for (offset, stamp) in moved.into_iter().enumerate() {
            st.order.insert(to + offset, stamp);
        }
        st.number_playlists(from.min(to));

        self.shared
            .queue_global_update(&mut st, UpdateLevel::Structure, false);
    }

    /// Invalidates the metadata of every entry matching `filename`, across
    /// all playlists, and reopens the scan for the ones that changed.
    pub fn rescan_file(&self, filename: &str) {
        let mut st = self.shared.lock();
        let config = st.config.clone();
        let stamps = st.order.clone();
        let mut restart = false;

        for stamp in stamps {
            let result = st
                .data_mut(stamp)
                .map(|data| data.reset_tuple_of_file(filename, &config));
            if let Some((matched, update)) = result {
                if matched {
                    if let Some(data) = st.data_mut(stamp) {
                        data.scan_status = ScanStatus::ScanActive;
                    }
                    restart = true;
                }
                if let Some(update) = update {
                    self.shared.signal_update_queued(&mut st, stamp, update, false);
                }
            }
        }

        if restart {
            self.shared.scan_restart(&mut st);
        }
    }

    pub fn update_pending_any(&self) -> bool {
        self.shared.lock().update_level != UpdateLevel::NoUpdate
    }

    pub fn scan_in_progress_any(&self) -> bool {
        let st = self.shared.lock();
        st.order
            .iter()
            .any(|&stamp| st.data(stamp).is_some_and(|d| d.scan_status != ScanStatus::NotScanning))
    }

    /// Stops playback wherever it is running.
    pub fn stop_playback(&self) {
        let hooks = {
            let mut st = self.shared.lock();
            self.shared.set_playing_locked(&mut st, None, false)
        };
        self.shared.call_playback_hooks(Playlist::null(), hooks);
    }

    /// Writes `playlist-state`, best-effort. The engine clock is read before
    /// the playlist lock is taken.
    pub fn save_state(&self) {
        let paused = self.shared.playback.paused();
        let time = self.shared.playback.time();

        let doc = {
            let st = self.shared.lock();
            let mut doc = StateDoc {
                active: st
                    .active
                    .and_then(|stamp| st.index_of(stamp))
                    .map_or(-1, |i| i as i64),
                playing: st
                    .playing
                    .and_then(|stamp| st.index_of(stamp))
                    .map_or(-1, |i| i as i64),
                playlists: Vec::with_capacity(st.order.len()),
            };
            for (i, &stamp) in st.order.iter().enumerate() {
                let Some(data) = st.data(stamp) else { continue };
                let is_playing = st.playing == Some(stamp);
                doc.playlists.push(PlaylistState {
                    index: i as i64,
                    filename: data.filename.clone(),
                    position: data.position().map_or(-1, |p| p as i64),
                    resume_state: if is_playing && paused {
                        ResumeState::Pause
                    } else {
                        ResumeState::Play
                    },
                    // non-playing playlists keep the time recorded when they
                    // last lost the playing role
                    resume_time: if is_playing { time } else { data.resume_time },
                });
            }
            doc
        };

        let path = self.shared.user_dir.join(STATE_FILE);
        state_persistence::save_state_file(&path, &doc);
    }

    /// Restores `playlist-state`. A missing or unreadable file leaves the
    /// defaults in place; either way init-time updates are dropped so no
    /// update event fires for the load itself.
    pub fn load_state(&self) {
        let path = self.shared.user_dir.join(STATE_FILE);
        let doc = state_persistence::read_state_file(&path).unwrap_or_default();

        let mut st = self.shared.lock();

        if doc.active >= 0 {
            if let Some(&stamp) = st.order.get(doc.active as usize) {
                st.active = Some(stamp);
            }
        }
        st.resume_playlist = (doc.playing >= 0).then_some(doc.playing as usize);

        for playlist in &doc.playlists {
            if playlist.index < 0 {
                continue;
            }
            let Some(&stamp) = st.order.get(playlist.index as usize) else {
                continue;
            };
            if let Some(data) = st.data_mut(stamp) {
                data.filename = playlist.filename.clone();
                if playlist.position >= 0 && (playlist.position as usize) < data.n_entries() {
                    data.set_position(Some(playlist.position as usize), true);
                }
                data.resume_time = playlist.resume_time;
            }
            if st.resume_playlist == Some(playlist.index as usize) {
                match playlist.resume_state {
                    ResumeState::Stop => st.resume_playlist = None,
                    ResumeState::Pause => st.resume_paused = true,
                    ResumeState::Play => {}
                }
            }
        }

        // set initial focus and selection, drop updates queued during init
        let stamps = st.order.clone();
        for stamp in stamps {
            if let Some(data) = st.data_mut(stamp) {
                let focus = data
                    .position()
                    .or_else(|| (data.n_entries() > 0).then_some(0));
                if let Some(focus) = focus {
                    let _ = data.set_focus(Some(focus));
                    let _ = data.select_entry(focus, true);
                }
                data.cancel_updates();
            }
        }

        self.shared.dispatcher.cancel_update();
        st.update_level = UpdateLevel::NoUpdate;
        st.update_delayed = false;
    }

    /// Restarts playback where the restored state says it left off.
    pub fn resume(&self) {
        let (index, paused) = {
            let mut st = self.shared.lock();
            if st.config.always_resume_paused {
                st.resume_paused = true;
            }
            (st.resume_playlist, st.resume_paused)
        };
        let playlist = match index {
            Some(index) => self.by_index(index),
            None => Playlist::null(),
        };
        playlist.start_playback(paused);
    }

    /// Playback-thread entry point: runs the playback-tagged scan
    /// synchronously (with the lock released) and returns what the decoder
    /// needs. A stale `serial` yields an empty result.
    pub fn playback_entry_read(&self, serial: u32) -> DecodeInfo {
        let shared = &self.shared;
        let mut dec = DecodeInfo::default();

        let mut st = shared.lock();
        let Some((stamp, key, _)) = shared.playback_entry(&st, serial) else {
            return dec;
        };

        let mut request = {
            let item = st
                .scan_list
                .iter_mut()
                .find(|item| item.stamp == stamp && item.entry_key == key)
                .expect("playback entry has no scan item");
            assert!(item.for_playback, "playback scan item lost its slot");
            item.handled_by_playback = true;
            item.pending
                .take()
                .expect("playback scan request already taken")
        };
        drop(st);

        request.run();
        shared.scan_finish(&request);

        let st = shared.lock();
        // playback may have moved on while the scan ran
        if let Some((stamp, _, pos)) = shared.playback_entry(&st, serial) {
            if let Some(entry) = st.data(stamp).and_then(|data| data.entry_at(pos)) {
                shared
                    .playback
                    .set_info(pos, entry.tuple.clone().unwrap_or_default());
                shared.art.cache_current(
                    &entry.filename,
                    request.image_data.take(),
                    request.image_file.take(),
                );
                dec.filename = Some(entry.filename.clone());
                dec.decoder = request.decoder;
                dec.file = request.file.take();
                dec.error = request.error.take();
            }
        }
        dec
    }

    /// Playback-thread entry point for live stream tags. Cuesheet entries
    /// (those with a start time) keep their static metadata.
    pub fn playback_entry_set_tuple(&self, serial: u32, tuple: Tuple) {
        let shared = &self.shared;
        let mut st = shared.lock();
        let Some((stamp, key, _)) = shared.playback_entry(&st, serial) else {
            return;
        };

        let has_start_time = st
            .data(stamp)
            .and_then(|data| data.entry_by_key(key))
            .and_then(|entry| entry.tuple.as_ref())
            .and_then(|tuple| tuple.start_time_ms)
            .is_some();
        if has_start_time {
            return;
        }

        let config = st.config.clone();
        let update = st.data_mut(stamp).and_then(|data| {
            let entry_num = data.set_entry_tuple(key, Some(tuple), &config)?;
            Some(data.queue_update(UpdateLevel::Metadata, entry_num, 1))
        });
        if let Some(update) = update {
            shared.signal_update_queued(&mut st, stamp, update, false);
        }
    }

    /// Orderly teardown. Playback must already be stopped.
    pub fn shutdown(&self) {
        {
            let st = self.shared.lock();
            assert!(
                st.playing.is_none(),
                "core torn down while playback is active"
            );
        }
        self.shared.dispatcher.stop();
        self.shared.scanner.stop();
    }

    #[cfg(test)]
    fn assert_indices_consistent(&self) {
        let st = self.shared.lock();
        for (i, &stamp) in st.order.iter().enumerate() {
            assert_eq!(st.index_of(stamp), Some(i), "index of stamp {}", stamp);
        }
    }

    #[cfg(test)]
    fn scan_list_len(&self) -> usize {
        self.shared.lock().scan_list.len()
    }
}

impl Drop for PlaylistCore {
    fn drop(&mut self) {
        self.shared.dispatcher.stop();
        self.shared.scanner.stop();
    }
}

/// Lightweight handle to one playlist.
///
/// Copies freely and stays safe to hold after the playlist is deleted:
/// reads then return the documented default, mutations do nothing. Equality
/// compares identity, not contents.
#[derive(Clone, Debug)]
pub struct Playlist {
    shared: Weak<Shared>,
    stamp: Option<Stamp>,
}

impl PartialEq for Playlist {
    fn eq(&self, other: &Self) -> bool {
        self.stamp == other.stamp && Weak::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Playlist {}

impl Playlist {
    fn of(shared: &Arc<Shared>, stamp: Option<Stamp>) -> Playlist {
        Playlist {
            shared: Arc::downgrade(shared),
            stamp,
        }
    }

    /// A handle that resolves to nothing.
    pub fn null() -> Playlist {
        Playlist {
            shared: Weak::new(),
            stamp: None,
        }
    }

    /// Resolve-or-default for read-only accessors.
    fn read<R>(&self, default: R, f: impl FnOnce(&PlaylistData) -> R) -> R {
        let Some(shared) = self.shared.upgrade() else {
            return default;
        };
        let Some(stamp) = self.stamp else { return default };
        let st = shared.lock();
        match st.data(stamp) {
            Some(data) => f(data),
            None => default,
        }
    }

    /// Resolve-or-default for mutations; the queued update is routed
    /// through the core's dispatch path.
    fn mutate<R>(
        &self,
        default: R,
        f: impl FnOnce(&mut PlaylistData, &CoreConfig) -> (R, Option<Update>),
    ) -> R {
        let Some(shared) = self.shared.upgrade() else {
            return default;
        };
        let Some(stamp) = self.stamp else { return default };
        let mut st = shared.lock();
        let config = st.config.clone();
        let Some((result, update)) = st.data_mut(stamp).map(|data| f(data, &config)) else {
            return default;
        };
        if let Some(update) = update {
            shared.signal_update_queued(&mut st, stamp, update, false);
        }
        result
    }

    /// True while the playlist behind this handle is alive.
    pub fn exists(&self) -> bool {
        self.read(false, |_| true)
    }

    /// Current display position in the registry.
    pub fn index(&self) -> Option<usize> {
        let shared = self.shared.upgrade()?;
        let stamp = self.stamp?;
        let st = shared.lock();
        st.index_of(stamp)
    }

    /// The immutable integer stamp, the key of the playlist's on-disk file.
    pub fn stamp(&self) -> Option<i32> {
        self.read(None, |data| Some(data.stamp()))
    }

    pub fn n_entries(&self) -> usize {
        self.read(0, |data| data.n_entries())
    }

    pub fn title(&self) -> String {
        self.read(String::new(), |data| data.title.clone())
    }

    pub fn set_title(&self, title: &str) {
        self.mutate((), |data, _| {
            data.title = title.to_string();
            data.modified = true;
            ((), Some(data.queue_update(UpdateLevel::Metadata, 0, 0)))
        });
    }

    pub fn filename(&self) -> Option<String> {
        self.read(None, |data| data.filename.clone())
    }

    pub fn set_filename(&self, filename: Option<&str>) {
        self.mutate((), |data, _| {
            data.filename = filename.map(str::to_string);
            data.modified = true;
            ((), Some(data.queue_update(UpdateLevel::Metadata, 0, 0)))
        });
    }

    pub fn modified(&self) -> bool {
        self.read(false, |data| data.modified)
    }

    pub fn set_modified(&self, modified: bool) {
        self.mutate((), |data, _| {
            data.modified = modified;
            ((), None)
        });
    }

    /// Makes this playlist the user-focused one.
    pub fn activate(&self) {
        let Some(shared) = self.shared.upgrade() else { return };
        let Some(stamp) = self.stamp else { return };
        let changed = {
            let mut st = shared.lock();
            if st.data(stamp).is_none() {
                false
            } else if st.active != Some(stamp) {
                st.active = Some(stamp);
                true
            } else {
                false
            }
        };
        if changed {
            shared.emit(Event::PlaylistActivate);
        }
    }

    /// Destroys the playlist. The registry is refilled with a fresh default
    /// playlist if this was the last one; the active and playing roles move
    /// or stop as needed. Outstanding handles keep working, returning
    /// defaults.
    pub fn remove_playlist(&self) {
        let Some(shared) = self.shared.upgrade() else { return };
        let Some(stamp) = self.stamp else { return };

        let (was_active, was_playing) = {
            let mut st = shared.lock();
            let Some(at) = st.index_of(stamp) else { return };

            // break the weak link; the record itself stays forever
            if let Some(record) = st.ids.get_mut(&stamp) {
                record.index = None;
                record.data = None;
            }
            st.order.remove(at);
            st.prune_scan_items();

            if st.order.is_empty() {
                let fresh = st.create_playlist(None);
                st.order.push(fresh);
            }
            st.number_playlists(at);

            let mut was_active = false;
            if st.active == Some(stamp) {
                let active_num = at.min(st.order.len() - 1);
                st.active = Some(st.order[active_num]);
                was_active = true;
            }

            let mut was_playing = false;
            if st.playing == Some(stamp) {
                st.playing = None;
                shared.stop_playback_locked(&mut st);
                was_playing = true;
            }

            shared.queue_global_update(&mut st, UpdateLevel::Structure, false);
            debug!("PlaylistManager: removed playlist {}", stamp);
            (was_active, was_playing)
        };

        if was_active {
            shared.emit(Event::PlaylistActivate);
        }
        if was_playing {
            shared.emit(Event::PlaylistSetPlaying);
            shared.emit(Event::PlaybackStop);
        }
    }

    /* ---- entry access ---- */

    pub fn entry_filename(&self, entry_num: usize) -> Option<String> {
        self.read(None, |data| {
            data.entry_at(entry_num).map(|e| e.filename.clone())
        })
    }

    /// The formatted display title of an entry.
    pub fn entry_title(&self, entry_num: usize) -> Option<String> {
        self.read(None, |data| data.entry_at(entry_num).map(|e| e.title.clone()))
    }

    /// The entry's decoder plus any scan error. [`GetMode::Wait`] blocks
    /// until a scan has run; the result may still be `None` if the scanner
    /// could not identify the file.
    pub fn entry_decoder(&self, entry_num: usize, mode: GetMode) -> (Option<Decoder>, Option<String>) {
        let Some(shared) = self.shared.upgrade() else {
            return (None, None);
        };
        let st = shared.lock();
        let (_st, snapshot) =
            shared.get_entry(st, self.stamp, entry_num, mode == GetMode::Wait, false);
        match snapshot {
            Some(snapshot) => (snapshot.decoder, snapshot.error),
            None => (None, None),
        }
    }

    /// The entry's metadata plus any scan error, with the same waiting
    /// rules as [`Playlist::entry_decoder`].
    pub fn entry_tuple(&self, entry_num: usize, mode: GetMode) -> (Option<Tuple>, Option<String>) {
        let Some(shared) = self.shared.upgrade() else {
            return (None, None);
        };
        let st = shared.lock();
        let (_st, snapshot) =
            shared.get_entry(st, self.stamp, entry_num, false, mode == GetMode::Wait);
        match snapshot {
            Some(snapshot) => (snapshot.tuple, snapshot.error),
            None => (None, None),
        }
    }

    /* ---- position and playback ---- */

    pub fn position(&self) -> Option<usize> {
        self.read(None, |data| data.position())
    }

    pub fn set_position(&self, entry_num: Option<usize>) {
        let Some(shared) = self.shared.upgrade() else { return };
        let Some(stamp) = self.stamp else { return };
        let hooks = {
            let mut st = shared.lock();
            if st.data(stamp).is_none() {
                return;
            }
            if let Some(data) = st.data_mut(stamp) {
                data.set_position(entry_num, true);
            }
            shared.change_playback(&mut st, stamp)
        };
        shared.call_playback_hooks(self.clone(), hooks);
    }

    /// Starts (or un-pauses) playback of this playlist. Without a position,
    /// the first song is picked by the usual shuffle/queue rules; if there
    /// is nothing to play, playback stops instead.
    pub fn start_playback(&self, paused: bool) {
        let Some(shared) = self.shared.upgrade() else { return };
        let Some(stamp) = self.stamp else { return };
        let hooks = {
            let mut st = shared.lock();
            if st.data(stamp).is_none() {
                return;
            }
            shared.set_playing_locked(&mut st, Some(stamp), paused)
        };
        shared.call_playback_hooks(self.clone(), hooks);
    }

    /// Advances to the next song. Returns false when the playlist is
    /// exhausted (and `repeat` is off).
    pub fn next_song(&self, repeat: bool) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let Some(stamp) = self.stamp else { return false };
        let hooks = {
            let mut st = shared.lock();
            let shuffle = st.config.shuffle;
            let advanced = st.data_mut(stamp).is_some_and(|data| {
                let hint = data.position().map_or(0, |p| p + 1);
                data.next_song(shuffle, repeat, hint)
            });
            if !advanced {
                return false;
            }
            shared.change_playback(&mut st, stamp)
        };
        shared.call_playback_hooks(self.clone(), hooks);
        true
    }

    /// Steps back to the previous song. Returns false at the beginning.
    pub fn prev_song(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let Some(stamp) = self.stamp else { return false };
        let hooks = {
            let mut st = shared.lock();
            let shuffle = st.config.shuffle;
            let moved = st
                .data_mut(stamp)
                .is_some_and(|data| data.prev_song(shuffle));
            if !moved {
                return false;
            }
            shared.change_playback(&mut st, stamp)
        };
        shared.call_playback_hooks(self.clone(), hooks);
        true
    }

    /* ---- focus and selection ---- */

    pub fn get_focus(&self) -> Option<usize> {
        self.read(None, |data| data.focus())
    }

    pub fn set_focus(&self, entry_num: Option<usize>) {
        self.mutate((), |data, _| ((), data.set_focus(entry_num)));
    }

    pub fn entry_selected(&self, entry_num: usize) -> bool {
        self.read(false, |data| data.entry_selected(entry_num))
    }

    pub fn select_entry(&self, entry_num: usize, selected: bool) {
        self.mutate((), |data, _| ((), data.select_entry(entry_num, selected)));
    }

    pub fn n_selected(&self) -> usize {
        self.read(0, |data| data.n_selected())
    }

    pub fn select_all(&self, selected: bool) {
        self.mutate((), |data, _| ((), data.select_all(selected)));
    }

    /// Moves the selected entries by `distance` slots; returns the distance
    /// actually moved.
    pub fn shift_entries(&self, entry_num: usize, distance: isize) -> isize {
        self.mutate(0, |data, config| data.shift_entries(entry_num, distance, config))
    }

    /* ---- structural edits ---- */

    pub fn insert_items(&self, at: usize, items: Vec<AddItem>) {
        self.mutate((), |data, config| ((), data.insert_items(at, items, config)));
    }

    pub fn remove_entries(&self, at: usize, number: usize) {
        let Some(shared) = self.shared.upgrade() else { return };
        let Some(stamp) = self.stamp else { return };
        let hooks = {
            let mut st = shared.lock();
            let config = st.config.clone();
            let Some((position_changed, update)) = st
                .data_mut(stamp)
                .map(|data| data.remove_entries(at, number, &config))
            else {
                return;
            };
            st.prune_scan_items();
            if let Some(update) = update {
                shared.signal_update_queued(&mut st, stamp, update, false);
            }
            if position_changed {
                shared.change_playback(&mut st, stamp)
            } else {
                0
            }
        };
        shared.call_playback_hooks(self.clone(), hooks);
    }

    pub fn remove_selected(&self) {
        let Some(shared) = self.shared.upgrade() else { return };
        let Some(stamp) = self.stamp else { return };
        let hooks = {
            let mut st = shared.lock();
            let config = st.config.clone();
            let Some((position_changed, update)) = st
                .data_mut(stamp)
                .map(|data| data.remove_selected(&config))
            else {
                return;
            };
            st.prune_scan_items();
            if let Some(update) = update {
                shared.signal_update_queued(&mut st, stamp, update, false);
            }
            if position_changed {
                shared.change_playback(&mut st, stamp)
            } else {
                0
            }
        };
        shared.call_playback_hooks(self.clone(), hooks);
    }

    pub fn sort_by_filename(&self, compare: fn(&str, &str) -> std::cmp::Ordering) {
        self.mutate((), |data, config| {
            ((), data.sort_by(&|a, b| compare(&a.filename, &b.filename), config))
        });
    }

    pub fn sort_by_tuple(&self, compare: fn(Option<&Tuple>, Option<&Tuple>) -> std::cmp::Ordering) {
        self.mutate((), |data, config| {
            ((), data.sort_by(&|a, b| compare(a.tuple.as_ref(), b.tuple.as_ref()), config))
        });
    }

    pub fn sort_selected_by_filename(&self, compare: fn(&str, &str) -> std::cmp::Ordering) {
        self.mutate((), |data, config| {
            ((), data.sort_selected_by(&|a, b| compare(&a.filename, &b.filename), config))
        });
    }

    pub fn sort_selected_by_tuple(
        &self,
        compare: fn(Option<&Tuple>, Option<&Tuple>) -> std::cmp::Ordering,
    ) {
        self.mutate((), |data, config| {
            (
                (),
                data.sort_selected_by(&|a, b| compare(a.tuple.as_ref(), b.tuple.as_ref()), config),
            )
        });
    }

    pub fn reverse_order(&self) {
        self.mutate((), |data, config| ((), data.reverse_order(config)));
    }

    pub fn reverse_selected(&self) {
        self.mutate((), |data, config| ((), data.reverse_selected(config)));
    }

    pub fn randomize_order(&self) {
        self.mutate((), |data, config| ((), data.randomize_order(config)));
    }

    pub fn randomize_selected(&self) {
        self.mutate((), |data, config| ((), data.randomize_selected(config)));
    }

    /* ---- lengths ---- */

    pub fn total_length_ms(&self) -> u64 {
        self.read(0, |data| data.total_length())
    }

    pub fn selected_length_ms(&self) -> u64 {
        self.read(0, |data| data.selected_length())
    }

    /* ---- play queue ---- */

    pub fn n_queued(&self) -> usize {
        self.read(0, |data| data.n_queued())
    }

    pub fn queue_insert(&self, at: usize, entry_num: usize) {
        self.mutate((), |data, _| ((), data.queue_insert(at, entry_num)));
    }

    pub fn queue_insert_selected(&self, at: usize) {
        self.mutate((), |data, _| ((), data.queue_insert_selected(at)));
    }

    pub fn queue_get_entry(&self, at: usize) -> Option<usize> {
        self.read(None, |data| data.queue_get_entry(at))
    }

    pub fn queue_find_entry(&self, entry_num: usize) -> Option<usize> {
        self.read(None, |data| data.queue_find_entry(entry_num))
    }

    pub fn queue_remove(&self, at: usize, number: usize) {
        self.mutate((), |data, _| ((), data.queue_remove(at, number)));
    }

    pub fn queue_remove_selected(&self) {
        self.mutate((), |data, _| ((), data.queue_remove_selected()));
    }

    /* ---- updates and scanning ---- */

    pub fn update_pending(&self) -> bool {
        self.read(false, |data| data.update_pending())
    }

    /// The last batch handed to observers by a "playlist update" event.
    pub fn update_detail(&self) -> Update {
        self.read(Update::default(), |data| data.last_update())
    }

    pub fn scan_in_progress(&self) -> bool {
        self.read(false, |data| data.scan_status != ScanStatus::NotScanning)
    }

    /// Re-reads metadata for every entry.
    pub fn rescan_all(&self) {
        self.rescan(false);
    }

    /// Re-reads metadata for the selected entries.
    pub fn rescan_selected(&self) {
        self.rescan(true);
    }

    fn rescan(&self, selected_only: bool) {
        let Some(shared) = self.shared.upgrade() else { return };
        let Some(stamp) = self.stamp else { return };
        let mut st = shared.lock();
        if st.data(stamp).is_none() {
            return;
        }
        let config = st.config.clone();
        let update = st
            .data_mut(stamp)
            .and_then(|data| data.reset_tuples(selected_only, &config));
        if let Some(update) = update {
            shared.signal_update_queued(&mut st, stamp, update, false);
        }
        if let Some(data) = st.data_mut(stamp) {
            data.scan_status = ScanStatus::ScanActive;
        }
        shared.scan_restart(&mut st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    use tempfile::TempDir;
    use tokio::sync::broadcast::error::TryRecvError;

    use crate::playback::NullArt;

    #[derive(Debug, Clone, PartialEq)]
    enum EngineCall {
        Play { seek: i64, paused: bool },
        Stop,
        TogglePause,
    }

    #[derive(Default)]
    struct MockPlayback {
        calls: Mutex<Vec<EngineCall>>,
        paused: AtomicBool,
        time: AtomicI64,
        serial_ok: AtomicBool,
    }

    impl MockPlayback {
        fn calls(&self) -> Vec<EngineCall> {
            self.calls.lock().unwrap().clone()
        }

        fn last_play(&self) -> Option<(i64, bool)> {
            self.calls().into_iter().rev().find_map(|call| match call {
                EngineCall::Play { seek, paused } => Some((seek, paused)),
                _ => None,
            })
        }
    }

    impl PlaybackEngine for MockPlayback {
        fn play(&self, seek_ms: i64, paused: bool) {
            self.paused.store(paused, Ordering::SeqCst);
            self.calls
                .lock()
                .unwrap()
                .push(EngineCall::Play { seek: seek_ms, paused });
        }

        fn stop(&self) {
            self.calls.lock().unwrap().push(EngineCall::Stop);
        }

        fn set_info(&self, _entry_num: usize, _tuple: Tuple) {}

        fn check_serial(&self, _serial: u32) -> bool {
            self.serial_ok.load(Ordering::SeqCst)
        }

        fn paused(&self) -> bool {
            self.paused.load(Ordering::SeqCst)
        }

        fn toggle_pause(&self) {
            let paused = !self.paused.load(Ordering::SeqCst);
            self.paused.store(paused, Ordering::SeqCst);
            self.calls.lock().unwrap().push(EngineCall::TogglePause);
        }

        fn time(&self) -> i64 {
            self.time.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        core: PlaylistCore,
        engine: Arc<MockPlayback>,
        events: broadcast::Receiver<Event>,
        _dir: Option<TempDir>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().expect("failed to create temp dir");
            let mut harness = Self::at(dir.path().to_path_buf());
            harness._dir = Some(dir);
            harness
        }

        fn at(user_dir: PathBuf) -> Self {
            let engine = Arc::new(MockPlayback::default());
            let core = PlaylistCore::new(user_dir, engine.clone(), Arc::new(NullArt));
            let events = core.subscribe();
            Harness {
                core,
                engine,
                events,
                _dir: None,
            }
        }

        fn add_items(&self, playlist: &Playlist, names: &[&str]) {
            let items = names.iter().map(|name| AddItem::new(*name)).collect();
            playlist.insert_items(playlist.n_entries(), items);
        }

        fn add_scanned_items(&self, playlist: &Playlist, names: &[&str]) {
            let items = names
                .iter()
                .map(|name| {
                    AddItem::with_tuple(
                        *name,
                        Tuple {
                            title: Some(name.to_string()),
                            length_ms: Some(180_000),
                            ..Tuple::default()
                        },
                    )
                })
                .collect();
            playlist.insert_items(playlist.n_entries(), items);
        }

        fn wait_for_event(&mut self, what: &str, predicate: impl Fn(&Event) -> bool) -> Event {
            let deadline = Instant::now() + Duration::from_secs(2);
            loop {
                match self.events.try_recv() {
                    Ok(event) => {
                        if predicate(&event) {
                            return event;
                        }
                    }
                    Err(TryRecvError::Empty) => {
                        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
                        thread::sleep(Duration::from_millis(5));
                    }
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Closed) => panic!("event bus closed waiting for {}", what),
                }
            }
        }

        fn assert_no_event(&mut self, timeout: Duration, predicate: impl Fn(&Event) -> bool) {
            let deadline = Instant::now() + timeout;
            while Instant::now() < deadline {
                match self.events.try_recv() {
                    Ok(event) => assert!(!predicate(&event), "unexpected event: {:?}", event),
                    Err(TryRecvError::Empty) => thread::sleep(Duration::from_millis(5)),
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Closed) => return,
                }
            }
        }

        fn drain_events(&mut self) {
            loop {
                match self.events.try_recv() {
                    Ok(_) => {}
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Lagged(_)) => continue,
                    Err(TryRecvError::Closed) => break,
                }
            }
        }

        /// Lets pending update ticks flush, then empties the event queue.
        fn settle(&mut self) {
            self.wait_until("updates to flush", || !self.core.update_pending_any());
            thread::sleep(Duration::from_millis(20));
            self.drain_events();
        }

        fn wait_until(&self, what: &str, predicate: impl Fn() -> bool) {
            let deadline = Instant::now() + Duration::from_secs(2);
            while !predicate() {
                assert!(Instant::now() < deadline, "timed out waiting for {}", what);
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    #[test]
    fn cold_start_creates_one_default_playlist() {
        let harness = Harness::new();
        harness.core.load_state();

        assert_eq!(harness.core.n_playlists(), 1);
        let active = harness.core.active_playlist();
        assert_eq!(active.index(), Some(0));
        assert_eq!(active.title(), "New Playlist");
        assert_eq!(active.n_entries(), 0);
        assert!(!harness.core.update_pending_any());
        harness.core.assert_indices_consistent();
    }

    #[test]
    fn start_playback_fires_hooks_in_order() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/t/a.mp3", "/t/b.mp3", "/t/c.mp3"]);
        harness.settle();

        active.start_playback(false);

        harness.wait_for_event("set playing", |e| matches!(e, Event::PlaylistSetPlaying));
        harness.wait_for_event("position", |e| matches!(e, Event::PlaylistPosition(_)));
        harness.wait_for_event("playback begin", |e| matches!(e, Event::PlaybackBegin));

        assert_eq!(harness.core.playing_playlist().index(), active.index());
        assert_eq!(active.position(), Some(0));
        assert_eq!(harness.engine.last_play(), Some((0, false)));
    }

    #[test]
    fn restarting_the_playing_playlist_only_toggles_pause() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/t/a.mp3"]);
        active.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
        harness.settle();

        active.start_playback(true);
        assert!(harness.engine.paused());
        harness.assert_no_event(Duration::from_millis(200), |e| {
            matches!(e, Event::PlaylistSetPlaying | Event::PlaybackBegin)
        });
    }

    #[test]
    fn removing_the_playing_playlist_stops_and_reactivates() {
        let mut harness = Harness::new();
        let first = harness.core.active_playlist();
        harness.core.insert_playlist(1);
        harness.add_items(&first, &["/t/a.mp3"]);
        first.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
        harness.settle();

        first.remove_playlist();

        harness.wait_for_event("activate", |e| matches!(e, Event::PlaylistActivate));
        harness.wait_for_event("set playing", |e| matches!(e, Event::PlaylistSetPlaying));
        harness.wait_for_event("stop", |e| matches!(e, Event::PlaybackStop));

        assert!(!harness.core.playing_playlist().exists());
        assert!(!first.exists());
        assert_eq!(harness.core.n_playlists(), 1);
        assert_eq!(harness.core.active_playlist().index(), Some(0));
        assert_eq!(harness.engine.calls().last(), Some(&EngineCall::Stop));
        harness.core.assert_indices_consistent();
    }

    #[test]
    fn removing_a_playlist_emits_one_structure_update() {
        let mut harness = Harness::new();
        harness.core.insert_playlist(1);
        let second = harness.core.by_index(1);
        harness.settle();

        second.remove_playlist();

        harness.wait_for_event("structure update", |e| {
            matches!(e, Event::PlaylistUpdate(UpdateLevel::Structure))
        });
        harness.assert_no_event(Duration::from_millis(300), |e| {
            matches!(e, Event::PlaylistUpdate(_))
        });
        harness.core.assert_indices_consistent();
    }

    #[test]
    fn dead_handles_return_defaults() {
        let mut harness = Harness::new();
        harness.core.insert_playlist(1);
        let doomed = harness.core.by_index(1);
        harness.add_items(&doomed, &["/t/a.mp3"]);
        harness.settle();
        doomed.remove_playlist();

        assert!(!doomed.exists());
        assert_eq!(doomed.index(), None);
        assert_eq!(doomed.stamp(), None);
        assert_eq!(doomed.title(), "");
        assert_eq!(doomed.n_entries(), 0);
        assert_eq!(doomed.position(), None);
        assert_eq!(doomed.entry_filename(0), None);
        assert_eq!(doomed.entry_tuple(0, GetMode::Wait), (None, None));
        assert_eq!(doomed.total_length_ms(), 0);
        assert!(!doomed.next_song(true));
        doomed.insert_items(0, vec![AddItem::new("/t/b.mp3")]);
        assert_eq!(doomed.n_entries(), 0);
        doomed.start_playback(false);
        assert!(!harness.core.playing_playlist().exists());
    }

    #[test]
    fn removing_the_last_playlist_refills_the_registry() {
        let harness = Harness::new();
        let only = harness.core.active_playlist();
        only.remove_playlist();

        assert_eq!(harness.core.n_playlists(), 1);
        let fresh = harness.core.by_index(0);
        assert_eq!(fresh.title(), "New Playlist");
        assert_eq!(harness.core.active_playlist(), fresh);
        assert!(!only.exists());
        harness.core.assert_indices_consistent();
    }

    #[test]
    fn blank_playlist_reuses_an_empty_default() {
        let harness = Harness::new();
        let blank = harness.core.blank_playlist();
        assert_eq!(blank, harness.core.active_playlist());

        harness.add_items(&blank, &["/t/a.mp3"]);
        let second = harness.core.blank_playlist();
        assert_ne!(second, blank);
        assert_eq!(second.index(), Some(1));
    }

    #[test]
    fn temporary_playlist_is_found_or_created() {
        let harness = Harness::new();
        let temp = harness.core.temporary_playlist();
        assert_eq!(temp.title(), "Now Playing");

        let again = harness.core.temporary_playlist();
        assert_eq!(temp, again);
        assert_eq!(harness.core.n_playlists(), 1);
    }

    #[test]
    fn new_playlist_becomes_active() {
        let mut harness = Harness::new();
        harness.settle();
        let fresh = harness.core.new_playlist();
        harness.wait_for_event("activate", |e| matches!(e, Event::PlaylistActivate));
        assert_eq!(harness.core.active_playlist(), fresh);
        assert_eq!(fresh.index(), Some(1));
    }

    #[test]
    fn activate_fires_only_on_change() {
        let mut harness = Harness::new();
        harness.core.insert_playlist(1);
        let second = harness.core.by_index(1);
        harness.settle();

        second.activate();
        harness.wait_for_event("activate", |e| matches!(e, Event::PlaylistActivate));
        second.activate();
        harness.assert_no_event(Duration::from_millis(200), |e| {
            matches!(e, Event::PlaylistActivate)
        });
    }

    #[test]
    fn reorder_round_trips_and_renumbers() {
        let mut harness = Harness::new();
        for at in 1..4 {
            harness.core.insert_playlist(at);
        }
        let stamps: Vec<_> = (0..4).map(|i| harness.core.by_index(i).stamp()).collect();
        harness.settle();

        harness.core.reorder_playlists(0, 2, 2);
        harness.wait_for_event("first update", |e| {
            matches!(e, Event::PlaylistUpdate(UpdateLevel::Structure))
        });
        let shuffled: Vec<_> = (0..4).map(|i| harness.core.by_index(i).stamp()).collect();
        assert_eq!(shuffled, vec![stamps[2], stamps[3], stamps[0], stamps[1]]);
        harness.core.assert_indices_consistent();

        harness.core.reorder_playlists(2, 0, 2);
        harness.wait_for_event("second update", |e| {
            matches!(e, Event::PlaylistUpdate(UpdateLevel::Structure))
        });
        let restored: Vec<_> = (0..4).map(|i| harness.core.by_index(i).stamp()).collect();
        assert_eq!(restored, stamps);
        harness.core.assert_indices_consistent();
        harness.assert_no_event(Duration::from_millis(300), |e| {
            matches!(e, Event::PlaylistUpdate(_))
        });
    }

    #[test]
    fn scan_drains_and_fires_one_completion() {
        let mut harness = Harness::new();
        harness.core.enable_scan(true);
        // the initial empty playlist drains immediately
        harness.wait_for_event("initial drain", |e| matches!(e, Event::PlaylistScanComplete));

        let active = harness.core.active_playlist();
        harness.add_items(
            &active,
            &[
                "/missing/a.flac",
                "/missing/b.flac",
                "/missing/c.flac",
                "/missing/d.flac",
                "/missing/e.flac",
            ],
        );
        harness.wait_for_event("scan complete", |e| matches!(e, Event::PlaylistScanComplete));

        for i in 0..5 {
            let (tuple, _error) = active.entry_tuple(i, GetMode::Nowait);
            assert!(tuple.is_some(), "entry {} should have a fallback tuple", i);
        }
        assert!(!harness.core.scan_in_progress_any());
        assert_eq!(harness.core.scan_list_len(), 0);
        harness.assert_no_event(Duration::from_millis(300), |e| {
            matches!(e, Event::PlaylistScanComplete)
        });
    }

    #[test]
    fn wait_mode_returns_immediately_for_scanned_entries() {
        let harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_scanned_items(&active, &["/t/a.mp3"]);

        let (tuple, error) = active.entry_tuple(0, GetMode::Wait);
        assert_eq!(tuple.and_then(|t| t.title), Some("/t/a.mp3".to_string()));
        assert!(error.is_none());
    }

    #[test]
    fn stdin_entries_are_never_scanned() {
        let harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["stdin://capture"]);

        let (tuple, error) = active.entry_tuple(0, GetMode::Wait);
        assert!(tuple.is_none());
        assert!(error.is_none());
        assert_eq!(harness.core.scan_list_len(), 0);
    }

    #[test]
    fn wait_mode_gives_up_after_one_failed_scan() {
        let harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/missing/a.flac"]);

        // the scan runs but cannot identify a decoder; the read returns
        // instead of looping
        let (decoder, error) = active.entry_decoder(0, GetMode::Wait);
        assert!(decoder.is_none());
        assert!(error.is_some());
    }

    #[test]
    fn on_demand_scan_works_while_the_sweep_is_disabled() {
        let harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/missing/a.flac"]);

        let (tuple, _error) = active.entry_tuple(0, GetMode::Wait);
        assert_eq!(tuple.and_then(|t| t.title), Some("a".to_string()));
    }

    #[test]
    fn metadata_on_play_suspends_the_sweep() {
        let mut harness = Harness::new();
        let mut config = harness.core.config();
        config.metadata_on_play = true;
        harness.core.set_config(config);
        harness.core.enable_scan(true);

        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/missing/a.flac", "/missing/b.flac"]);
        harness.assert_no_event(Duration::from_millis(300), |e| {
            matches!(e, Event::PlaylistScanComplete)
        });
        assert!(active.entry_tuple(0, GetMode::Nowait).0.is_none());

        let mut config = harness.core.config();
        config.metadata_on_play = false;
        harness.core.set_config(config);
        harness.wait_for_event("scan complete", |e| matches!(e, Event::PlaylistScanComplete));
        assert!(active.entry_tuple(0, GetMode::Nowait).0.is_some());
        assert!(active.entry_tuple(1, GetMode::Nowait).0.is_some());
    }

    #[test]
    fn rescan_file_invalidates_matching_entries_everywhere() {
        let mut harness = Harness::new();
        harness.core.enable_scan(true);
        harness.wait_for_event("initial drain", |e| matches!(e, Event::PlaylistScanComplete));

        let first = harness.core.active_playlist();
        harness.add_scanned_items(&first, &["/t/shared.mp3", "/t/other.mp3"]);
        let second = harness.core.insert_playlist(1);
        harness.add_scanned_items(&second, &["/t/shared.mp3"]);
        harness.settle();

        harness.core.rescan_file("/t/shared.mp3");

        // the re-read from disk fails, so the fallback title replaces the tag
        harness.wait_until("the first playlist to rescan", || {
            first.entry_tuple(0, GetMode::Nowait).0.and_then(|t| t.title)
                == Some("shared".to_string())
        });
        harness.wait_until("the second playlist to rescan", || {
            second.entry_tuple(0, GetMode::Nowait).0.and_then(|t| t.title)
                == Some("shared".to_string())
        });
        assert_eq!(
            first.entry_tuple(1, GetMode::Nowait).0.and_then(|t| t.title),
            Some("/t/other.mp3".to_string())
        );
    }

    #[test]
    fn update_detail_reports_the_last_batch() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_scanned_items(&active, &["/t/a.mp3", "/t/b.mp3"]);
        harness.settle();

        active.select_entry(1, true);
        harness.wait_for_event("selection update", |e| {
            matches!(e, Event::PlaylistUpdate(UpdateLevel::Selection))
        });
        let detail = active.update_detail();
        assert_eq!(detail.level, UpdateLevel::Selection);
        assert_eq!((detail.at, detail.count), (1, 1));
        assert!(!active.update_pending());
    }

    #[test]
    fn deleting_the_playing_entry_stops_playback_cleanly() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/missing/only.flac"]);
        active.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
        harness.settle();
        assert_eq!(harness.core.scan_list_len(), 1);

        active.remove_entries(0, 1);

        harness.wait_for_event("stop", |e| matches!(e, Event::PlaybackStop));
        assert!(!harness.core.playing_playlist().exists());
        assert_eq!(harness.engine.calls().last(), Some(&EngineCall::Stop));
        assert_eq!(harness.core.scan_list_len(), 0);
    }

    #[test]
    fn canceled_playback_scan_is_requeued_to_the_pool() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/missing/a.flac"]);
        active.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
        harness.settle();

        harness.core.stop_playback();
        harness.wait_for_event("set playing", |e| matches!(e, Event::PlaylistSetPlaying));
        harness.wait_for_event("stop", |e| matches!(e, Event::PlaybackStop));

        // the untouched playback request went to the scanner instead
        harness.wait_until("the requeued scan to finish", || {
            active.entry_tuple(0, GetMode::Nowait).0.is_some()
        });
    }

    #[test]
    fn playback_entry_read_runs_the_scan_and_returns_decode_info() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/missing/a.flac"]);
        active.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
        harness.engine.serial_ok.store(true, Ordering::SeqCst);

        let info = harness.core.playback_entry_read(1);
        assert_eq!(info.filename.as_deref(), Some("/missing/a.flac"));
        assert!(info.error.is_some());
        assert!(info.decoder.is_none());

        // the synchronous scan still applied the fallback tuple
        assert!(active.entry_tuple(0, GetMode::Nowait).0.is_some());
        assert_eq!(harness.core.scan_list_len(), 0);
    }

    #[test]
    fn playback_entry_read_discards_stale_serials() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_items(&active, &["/missing/a.flac"]);
        active.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));

        let info = harness.core.playback_entry_read(99);
        assert!(info.filename.is_none());
        assert!(info.error.is_none());
        // the playback scan slot is untouched
        assert_eq!(harness.core.scan_list_len(), 1);
    }

    #[test]
    fn stream_metadata_skips_cuesheet_entries() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        active.insert_items(
            0,
            vec![AddItem::with_tuple(
                "/t/album.cue",
                Tuple {
                    title: Some("Cue Track".to_string()),
                    start_time_ms: Some(30_000),
                    ..Tuple::default()
                },
            )],
        );
        active.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
        harness.engine.serial_ok.store(true, Ordering::SeqCst);
        harness.settle();

        harness.core.playback_entry_set_tuple(
            1,
            Tuple {
                title: Some("Stream Title".to_string()),
                ..Tuple::default()
            },
        );

        assert_eq!(
            active.entry_tuple(0, GetMode::Nowait).0.and_then(|t| t.title),
            Some("Cue Track".to_string())
        );
        harness.assert_no_event(Duration::from_millis(300), |e| {
            matches!(e, Event::PlaylistUpdate(_))
        });
    }

    #[test]
    fn stream_metadata_updates_plain_entries() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_scanned_items(&active, &["/t/radio.mp3"]);
        active.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
        harness.engine.serial_ok.store(true, Ordering::SeqCst);
        harness.settle();

        harness.core.playback_entry_set_tuple(
            1,
            Tuple {
                title: Some("Now On Air".to_string()),
                ..Tuple::default()
            },
        );

        assert_eq!(
            active.entry_tuple(0, GetMode::Nowait).0.and_then(|t| t.title),
            Some("Now On Air".to_string())
        );
        harness.wait_for_event("metadata update", |e| {
            matches!(e, Event::PlaylistUpdate(UpdateLevel::Metadata))
        });
        assert!(active.modified());
    }

    #[test]
    fn save_and_restore_round_trips_the_session() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().to_path_buf();

        {
            let mut harness = Harness::at(path.clone());
            harness.core.insert_playlist(1);
            harness.core.insert_playlist(2);
            let third = harness.core.by_index(2);
            harness.add_scanned_items(&third, &["/t/a.mp3", "/t/b.mp3", "/t/c.mp3"]);
            third.set_filename(Some("/lists/road.audpl"));

            third.start_playback(false);
            harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
            harness.engine.time.store(45_000, Ordering::SeqCst);
            harness.engine.paused.store(true, Ordering::SeqCst);

            harness.core.save_state();
        }

        let mut harness = Harness::at(path);
        harness.core.insert_playlist(1);
        harness.core.insert_playlist(2);
        let third = harness.core.by_index(2);
        harness.add_scanned_items(&third, &["/t/a.mp3", "/t/b.mp3", "/t/c.mp3"]);

        harness.core.load_state();
        assert!(!harness.core.update_pending_any());
        assert_eq!(harness.core.active_playlist().index(), Some(0));
        assert_eq!(third.filename().as_deref(), Some("/lists/road.audpl"));
        assert_eq!(third.position(), Some(0));
        assert_eq!(third.get_focus(), Some(0));
        assert!(third.entry_selected(0));

        harness.drain_events();
        harness.core.resume();

        assert_eq!(harness.engine.last_play(), Some((45_000, true)));
        assert_eq!(harness.core.playing_playlist().index(), Some(2));
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
    }

    #[test]
    fn resume_state_stop_means_no_resume() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let doc = StateDoc {
            active: 0,
            playing: 0,
            playlists: vec![state_persistence::PlaylistState {
                index: 0,
                filename: None,
                position: 0,
                resume_state: ResumeState::Stop,
                resume_time: 9_000,
            }],
        };
        state_persistence::write_state_file(&dir.path().join(STATE_FILE), &doc)
            .expect("state file should write");

        let harness = Harness::at(dir.path().to_path_buf());
        let active = harness.core.active_playlist();
        harness.add_scanned_items(&active, &["/t/a.mp3"]);
        harness.core.load_state();
        harness.core.resume();

        assert!(harness.engine.last_play().is_none());
        assert!(!harness.core.playing_playlist().exists());
    }

    #[test]
    fn always_resume_paused_overrides_the_saved_state() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let doc = StateDoc {
            active: 0,
            playing: 0,
            playlists: vec![state_persistence::PlaylistState {
                index: 0,
                filename: None,
                position: 0,
                resume_state: ResumeState::Play,
                resume_time: 5_000,
            }],
        };
        state_persistence::write_state_file(&dir.path().join(STATE_FILE), &doc)
            .expect("state file should write");

        let harness = Harness::at(dir.path().to_path_buf());
        let active = harness.core.active_playlist();
        harness.add_scanned_items(&active, &["/t/a.mp3"]);
        harness.core.load_state();

        let mut config = harness.core.config();
        config.always_resume_paused = true;
        harness.core.set_config(config);
        harness.core.resume();

        assert_eq!(harness.engine.last_play(), Some((5_000, true)));
    }

    #[test]
    fn next_and_prev_drive_the_playback_cursor() {
        let mut harness = Harness::new();
        let active = harness.core.active_playlist();
        harness.add_scanned_items(&active, &["/t/a.mp3", "/t/b.mp3"]);
        active.start_playback(false);
        harness.wait_for_event("begin", |e| matches!(e, Event::PlaybackBegin));
        harness.settle();

        assert!(active.next_song(false));
        assert_eq!(active.position(), Some(1));
        harness.wait_for_event("position", |e| matches!(e, Event::PlaylistPosition(_)));
        harness.wait_for_event("begin again", |e| matches!(e, Event::PlaybackBegin));

        // end of the playlist without repeat stops the advance
        assert!(!active.next_song(false));
        assert_eq!(active.position(), Some(1));

        assert!(active.prev_song());
        assert_eq!(active.position(), Some(0));
    }
}

