//! Per-playlist data: entries, position, selection, the play queue, shuffle
//! history, and pending update bookkeeping.
//!
//! Nothing here is thread-safe on its own; all access goes through the
//! core's global lock.

use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::config::CoreConfig;
use crate::protocol::{AddItem, Decoder, Tuple, Update, UpdateLevel};
use crate::scanner::ScanRequest;

pub(crate) type Stamp = i32;

/// Background scan progress of one playlist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) enum ScanStatus {
    #[default]
    NotScanning,
    /// The sweep cursor still has entries to visit here.
    ScanActive,
    /// The cursor is past this playlist; in-flight scans may remain.
    ScanEnding,
}

/// One track position in a playlist.
#[derive(Debug)]
pub(crate) struct Entry {
    pub filename: String,
    pub decoder: Option<Decoder>,
    /// `Some` once populated by the scanner or loaded from a playlist file.
    pub tuple: Option<Tuple>,
    pub error: Option<String>,
    /// Back-index into the entry list, kept current by numbering passes.
    pub number: usize,
    /// Stable identity used by scan bookkeeping; survives reordering.
    pub key: u64,
    pub title: String,
    pub selected: bool,
}

pub(crate) struct PlaylistData {
    stamp: Stamp,
    pub title: String,
    /// On-disk export path, if the playlist has one.
    pub filename: Option<String>,
    pub modified: bool,
    pub scan_status: ScanStatus,
    /// Milliseconds into the current entry, refreshed when the playlist
    /// loses the playing role or restored from the state file.
    pub resume_time: i64,
    entries: Vec<Entry>,
    position: Option<usize>,
    focus: Option<usize>,
    /// Entry keys queued for playback, in play order.
    queue: Vec<u64>,
    /// Entry keys already played this shuffle cycle, in play order.
    shuffle_history: Vec<u64>,
    pending: Update,
    last: Update,
    next_key: u64,
}

impl PlaylistData {
    pub fn new(stamp: Stamp, title: &str) -> Self {
        PlaylistData {
            stamp,
            title: title.to_string(),
            filename: None,
            modified: false,
            scan_status: ScanStatus::NotScanning,
            resume_time: 0,
            entries: Vec::new(),
            position: None,
            focus: None,
            queue: Vec::new(),
            shuffle_history: Vec::new(),
            pending: Update::default(),
            last: Update::default(),
            next_key: 1,
        }
    }

    pub fn stamp(&self) -> Stamp {
        self.stamp
    }

    pub fn n_entries(&self) -> usize {
        self.entries.len()
    }

    pub fn entry_at(&self, entry_num: usize) -> Option<&Entry> {
        self.entries.get(entry_num)
    }

    pub fn entry_by_key(&self, key: u64) -> Option<&Entry> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn index_of_key(&self, key: u64) -> Option<usize> {
        self.entries.iter().position(|entry| entry.key == key)
    }

    pub fn position(&self) -> Option<usize> {
        self.position
    }

    /// Moves the position. With `update_shuffle`, the new entry is recorded
    /// as the most recent step of the shuffle history.
    pub fn set_position(&mut self, entry_num: Option<usize>, update_shuffle: bool) {
        self.position = entry_num.filter(|&n| n < self.entries.len());
        if update_shuffle {
            if let Some(n) = self.position {
                let key = self.entries[n].key;
                self.shuffle_history.retain(|&k| k != key);
                self.shuffle_history.push(key);
            }
        }
    }

    pub fn focus(&self) -> Option<usize> {
        self.focus
    }

    pub fn set_focus(&mut self, entry_num: Option<usize>) -> Option<Update> {
        let next = entry_num.filter(|&n| n < self.entries.len());
        if next == self.focus {
            return None;
        }
        let previous = self.focus;
        self.focus = next;
        let lo = previous
            .unwrap_or(usize::MAX)
            .min(next.unwrap_or(usize::MAX));
        let hi = previous.unwrap_or(0).max(next.unwrap_or(0));
        Some(self.queue_update(UpdateLevel::Selection, lo, hi - lo + 1))
    }

    pub fn entry_selected(&self, entry_num: usize) -> bool {
        self.entries.get(entry_num).is_some_and(|e| e.selected)
    }

    pub fn select_entry(&mut self, entry_num: usize, selected: bool) -> Option<Update> {
        let entry = self.entries.get_mut(entry_num)?;
        if entry.selected == selected {
            return None;
        }
        entry.selected = selected;
        Some(self.queue_update(UpdateLevel::Selection, entry_num, 1))
    }

    pub fn n_selected(&self) -> usize {
        self.entries.iter().filter(|e| e.selected).count()
    }

    pub fn select_all(&mut self, selected: bool) -> Option<Update> {
        let mut any = false;
        for entry in &mut self.entries {
            if entry.selected != selected {
                entry.selected = selected;
                any = true;
            }
        }
        any.then(|| self.queue_update(UpdateLevel::Selection, 0, self.entries.len()))
    }

    pub fn total_length(&self) -> u64 {
        self.entries
            .iter()
            .filter_map(|e| e.tuple.as_ref().and_then(|t| t.length_ms))
            .sum()
    }

    pub fn selected_length(&self) -> u64 {
        self.entries
            .iter()
            .filter(|e| e.selected)
            .filter_map(|e| e.tuple.as_ref().and_then(|t| t.length_ms))
            .sum()
    }

    /// Moves the selected entries by `distance` slots among the unselected
    /// ones; `entry_num` must name a selected entry. Returns the distance
    /// actually moved.
    pub fn shift_entries(
        &mut self,
        entry_num: usize,
        distance: isize,
        config: &CoreConfig,
    ) -> (isize, Option<Update>) {
        if distance == 0 || !self.entry_selected(entry_num) {
            return (0, None);
        }
        let n_selected = self.n_selected();
        let n_unselected = self.entries.len() - n_selected;
        let slot = self.entries[..entry_num]
            .iter()
            .filter(|e| !e.selected)
            .count() as isize;
        let shift = (slot + distance).clamp(0, n_unselected as isize) - slot;
        if shift == 0 {
            return (0, None);
        }

        let position_key = self.position.map(|p| self.entries[p].key);
        let focus_key = self.focus.map(|f| self.entries[f].key);

        let mut selected = Vec::with_capacity(n_selected);
        let mut unselected = Vec::with_capacity(n_unselected);
        for entry in self.entries.drain(..) {
            if entry.selected {
                selected.push(entry);
            } else {
                unselected.push(entry);
            }
        }
        self.entries = unselected;
        let at = (slot + shift) as usize;
        for (offset, entry) in selected.into_iter().enumerate() {
            self.entries.insert(at + offset, entry);
        }

        self.after_reorder(position_key, focus_key, config);
        let count = self.entries.len();
        (
            shift,
            Some(self.queue_update(UpdateLevel::Structure, 0, count)),
        )
    }

    pub fn sort_by(
        &mut self,
        compare: &dyn Fn(&Entry, &Entry) -> std::cmp::Ordering,
        config: &CoreConfig,
    ) -> Option<Update> {
        let position_key = self.position.map(|p| self.entries[p].key);
        let focus_key = self.focus.map(|f| self.entries[f].key);
        self.entries.sort_by(|a, b| compare(a, b));
        self.after_reorder(position_key, focus_key, config);
        let count = self.entries.len();
        Some(self.queue_update(UpdateLevel::Structure, 0, count))
    }

    pub fn sort_selected_by(
        &mut self,
        compare: &dyn Fn(&Entry, &Entry) -> std::cmp::Ordering,
        config: &CoreConfig,
    ) -> Option<Update> {
        self.rearrange_selected(config, |entries| entries.sort_by(|a, b| compare(a, b)))
    }

    pub fn reverse_order(&mut self, config: &CoreConfig) -> Option<Update> {
        let position_key = self.position.map(|p| self.entries[p].key);
        let focus_key = self.focus.map(|f| self.entries[f].key);
        self.entries.reverse();
        self.after_reorder(position_key, focus_key, config);
        let count = self.entries.len();
        Some(self.queue_update(UpdateLevel::Structure, 0, count))
    }

    pub fn reverse_selected(&mut self, config: &CoreConfig) -> Option<Update> {
        self.rearrange_selected(config, |entries| entries.reverse())
    }

    pub fn randomize_order(&mut self, config: &CoreConfig) -> Option<Update> {
        let position_key = self.position.map(|p| self.entries[p].key);
        let focus_key = self.focus.map(|f| self.entries[f].key);
        self.entries.shuffle(&mut rand::thread_rng());
        self.after_reorder(position_key, focus_key, config);
        let count = self.entries.len();
        Some(self.queue_update(UpdateLevel::Structure, 0, count))
    }

    pub fn randomize_selected(&mut self, config: &CoreConfig) -> Option<Update> {
        self.rearrange_selected(config, |entries| entries.shuffle(&mut rand::thread_rng()))
    }

    /// Pulls the selected entries out, lets `rearrange` reorder them, and
    /// puts them back in the same slots.
    fn rearrange_selected(
        &mut self,
        config: &CoreConfig,
        rearrange: impl FnOnce(&mut Vec<Entry>),
    ) -> Option<Update> {
        let slots: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.selected)
            .map(|(i, _)| i)
            .collect();
        if slots.len() < 2 {
            return None;
        }

        let position_key = self.position.map(|p| self.entries[p].key);
        let focus_key = self.focus.map(|f| self.entries[f].key);

        let mut selected = Vec::with_capacity(slots.len());
        for &slot in slots.iter().rev() {
            selected.push(self.entries.remove(slot));
        }
        selected.reverse();
        rearrange(&mut selected);
        for (&slot, entry) in slots.iter().zip(selected) {
            self.entries.insert(slot, entry);
        }

        self.after_reorder(position_key, focus_key, config);
        let at = slots[0];
        let count = self.entries.len() - at;
        Some(self.queue_update(UpdateLevel::Structure, at, count))
    }

    pub fn insert_items(
        &mut self,
        at: usize,
        items: Vec<AddItem>,
        config: &CoreConfig,
    ) -> Option<Update> {
        if items.is_empty() {
            return None;
        }
        let at = at.min(self.entries.len());
        let count = items.len();
        for (offset, item) in items.into_iter().enumerate() {
            let key = self.next_key;
            self.next_key += 1;
            self.entries.insert(
                at + offset,
                Entry {
                    filename: item.filename,
                    decoder: None,
                    tuple: item.tuple,
                    error: None,
                    number: 0,
                    key,
                    title: String::new(),
                    selected: false,
                },
            );
        }
        if let Some(p) = self.position {
            if p >= at {
                self.position = Some(p + count);
            }
        }
        if let Some(f) = self.focus {
            if f >= at {
                self.focus = Some(f + count);
            }
        }
        self.renumber(at);
        self.refresh_titles(config);
        let tail = self.entries.len() - at;
        Some(self.queue_update(UpdateLevel::Structure, at, tail))
    }

    /// Removes `number` entries starting at `at`. The boolean reports
    /// whether the position entry itself was removed.
    pub fn remove_entries(
        &mut self,
        at: usize,
        number: usize,
        config: &CoreConfig,
    ) -> (bool, Option<Update>) {
        let len = self.entries.len();
        if at >= len {
            return (false, None);
        }
        let number = number.min(len - at);
        if number == 0 {
            return (false, None);
        }

        let removed: Vec<u64> = self.entries[at..at + number].iter().map(|e| e.key).collect();
        let position_changed = self.position.is_some_and(|p| p >= at && p < at + number);

        self.position = match self.position {
            Some(p) if p >= at + number => Some(p - number),
            Some(p) if p >= at => None,
            other => other,
        };
        let new_len = len - number;
        self.focus = match self.focus {
            Some(f) if f >= at + number => Some(f - number),
            Some(f) if f >= at => (new_len > 0).then(|| at.min(new_len - 1)),
            other => other,
        };

        self.entries.drain(at..at + number);
        self.queue.retain(|key| !removed.contains(key));
        self.shuffle_history.retain(|key| !removed.contains(key));
        self.renumber(at);
        self.refresh_titles(config);
        let tail = self.entries.len() - at;
        (
            position_changed,
            Some(self.queue_update(UpdateLevel::Structure, at, tail)),
        )
    }

    pub fn remove_selected(&mut self, config: &CoreConfig) -> (bool, Option<Update>) {
        let first = match self.entries.iter().position(|e| e.selected) {
            Some(first) => first,
            None => return (false, None),
        };
        let removed: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.key)
            .collect();
        let position_changed = self.position.is_some_and(|p| self.entries[p].selected);
        let position_key =
            (!position_changed).then(|| self.position.map(|p| self.entries[p].key)).flatten();
        let focus_key = self
            .focus
            .filter(|&f| !self.entries[f].selected)
            .map(|f| self.entries[f].key);

        self.entries.retain(|e| !e.selected);
        self.queue.retain(|key| !removed.contains(key));
        self.shuffle_history.retain(|key| !removed.contains(key));
        self.renumber(0);
        self.refresh_titles(config);

        self.position = position_key.and_then(|key| self.index_of_key(key));
        let len = self.entries.len();
        self.focus = focus_key
            .and_then(|key| self.index_of_key(key))
            .or((len > 0).then(|| first.min(len - 1)));

        let tail = len.saturating_sub(first);
        (
            position_changed,
            Some(self.queue_update(UpdateLevel::Structure, first, tail)),
        )
    }

    /// Invalidates tuples so the next sweep re-reads them.
    pub fn reset_tuples(&mut self, selected_only: bool, config: &CoreConfig) -> Option<Update> {
        let mut any = false;
        for entry in &mut self.entries {
            if !selected_only || entry.selected {
                entry.tuple = None;
                entry.error = None;
                any = true;
            }
        }
        if !any {
            return None;
        }
        self.refresh_titles(config);
        let count = self.entries.len();
        Some(self.queue_update(UpdateLevel::Metadata, 0, count))
    }

    pub fn reset_tuple_of_file(
        &mut self,
        filename: &str,
        config: &CoreConfig,
    ) -> (bool, Option<Update>) {
        let mut matched = false;
        for entry in &mut self.entries {
            if entry.filename == filename {
                entry.tuple = None;
                entry.error = None;
                matched = true;
            }
        }
        if !matched {
            return (false, None);
        }
        self.refresh_titles(config);
        let count = self.entries.len();
        (
            true,
            Some(self.queue_update(UpdateLevel::Metadata, 0, count)),
        )
    }

    pub fn reformat_titles(&mut self, config: &CoreConfig) -> Option<Update> {
        if self.entries.is_empty() {
            return None;
        }
        self.refresh_titles(config);
        let count = self.entries.len();
        Some(self.queue_update(UpdateLevel::Metadata, 0, count))
    }

    pub fn n_queued(&self) -> usize {
        self.queue.len()
    }

    pub fn queue_insert(&mut self, at: usize, entry_num: usize) -> Option<Update> {
        let key = self.entries.get(entry_num)?.key;
        if self.queue.contains(&key) {
            return None;
        }
        let at = at.min(self.queue.len());
        self.queue.insert(at, key);
        Some(self.queue_update(UpdateLevel::Selection, entry_num, 1))
    }

    pub fn queue_insert_selected(&mut self, at: usize) -> Option<Update> {
        let keys: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.selected && !self.queue.contains(&e.key))
            .map(|e| e.key)
            .collect();
        if keys.is_empty() {
            return None;
        }
        let mut at = at.min(self.queue.len());
        for key in keys {
            self.queue.insert(at, key);
            at += 1;
        }
        let count = self.entries.len();
        Some(self.queue_update(UpdateLevel::Selection, 0, count))
    }

    /// Entry index of the queue slot `at`.
    pub fn queue_get_entry(&self, at: usize) -> Option<usize> {
        self.queue.get(at).and_then(|&key| self.index_of_key(key))
    }

    /// Queue slot of the entry `entry_num`.
    pub fn queue_find_entry(&self, entry_num: usize) -> Option<usize> {
        let key = self.entries.get(entry_num)?.key;
        self.queue.iter().position(|&k| k == key)
    }

    pub fn queue_remove(&mut self, at: usize, number: usize) -> Option<Update> {
        if at >= self.queue.len() || number == 0 {
            return None;
        }
        let number = number.min(self.queue.len() - at);
        self.queue.drain(at..at + number);
        let count = self.entries.len();
        Some(self.queue_update(UpdateLevel::Selection, 0, count))
    }

    pub fn queue_remove_selected(&mut self) -> Option<Update> {
        let before = self.queue.len();
        let selected: Vec<u64> = self
            .entries
            .iter()
            .filter(|e| e.selected)
            .map(|e| e.key)
            .collect();
        self.queue.retain(|key| !selected.contains(key));
        if self.queue.len() == before {
            return None;
        }
        let count = self.entries.len();
        Some(self.queue_update(UpdateLevel::Selection, 0, count))
    }

    /// Advances the position: queue first, then shuffle or sequential order.
    /// Returns false if nothing is left to play.
    pub fn next_song(&mut self, shuffle: bool, repeat: bool, hint: usize) -> bool {
        while let Some(&key) = self.queue.first() {
            self.queue.remove(0);
            if let Some(n) = self.index_of_key(key) {
                self.set_position(Some(n), true);
                return true;
            }
        }

        if shuffle {
            let fresh: Vec<usize> = self
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| !self.shuffle_history.contains(&e.key))
                .map(|(i, _)| i)
                .collect();
            let pool = if !fresh.is_empty() {
                fresh
            } else {
                if !repeat || self.entries.is_empty() {
                    return false;
                }
                self.shuffle_history.clear();
                // start a new cycle, avoiding an immediate repeat
                (0..self.entries.len())
                    .filter(|&i| Some(i) != self.position || self.entries.len() == 1)
                    .collect()
            };
            let n = pool[rand::thread_rng().gen_range(0..pool.len())];
            self.set_position(Some(n), true);
            return true;
        }

        if hint < self.entries.len() {
            self.set_position(Some(hint), true);
            true
        } else if repeat && !self.entries.is_empty() {
            self.set_position(Some(0), true);
            true
        } else {
            false
        }
    }

    /// Steps back to the previous song. Returns false at the beginning.
    pub fn prev_song(&mut self, shuffle: bool) -> bool {
        if shuffle {
            if self.shuffle_history.len() < 2 {
                return false;
            }
            self.shuffle_history.pop();
            let key = *self
                .shuffle_history
                .last()
                .expect("shuffle history checked non-empty");
            match self.index_of_key(key) {
                Some(n) => {
                    self.position = Some(n);
                    true
                }
                None => false,
            }
        } else {
            match self.position {
                Some(p) if p > 0 => {
                    self.set_position(Some(p - 1), true);
                    true
                }
                _ => false,
            }
        }
    }

    /// First entry at or after `from` whose tuple has not been read yet.
    pub fn next_unscanned_entry(&self, from: usize) -> Option<usize> {
        self.entries
            .iter()
            .skip(from)
            .position(|e| e.tuple.is_none())
            .map(|offset| from + offset)
    }

    /// Applies a finished scan to the entry it was queued for.
    pub fn update_entry_from_scan(
        &mut self,
        key: u64,
        request: &ScanRequest,
        config: &CoreConfig,
    ) -> Option<Update> {
        let idx = self.index_of_key(key)?;
        let total = self.entries.len();
        let entry = &mut self.entries[idx];

        if entry.decoder.is_none() {
            entry.decoder = request.decoder;
        }
        if entry.tuple.is_none() {
            entry.tuple = request.tuple.clone();
        }
        if entry.decoder.is_none() || entry.tuple.is_none() {
            entry.error = request.error.clone();
        }
        if entry.tuple.is_none() {
            // failed entries get a filename-derived tuple so the sweep does
            // not revisit them forever
            entry.tuple = Some(Tuple::from_filename(&entry.filename));
        }
        entry.title = format_title(&entry.filename, entry.tuple.as_ref(), idx, total, config);

        Some(self.queue_update(UpdateLevel::Metadata, idx, 1))
    }

    /// Replaces an entry's tuple. Callers queue their own update.
    pub fn set_entry_tuple(
        &mut self,
        key: u64,
        tuple: Option<Tuple>,
        config: &CoreConfig,
    ) -> Option<usize> {
        let idx = self.index_of_key(key)?;
        let total = self.entries.len();
        let entry = &mut self.entries[idx];
        entry.tuple = tuple;
        entry.title = format_title(&entry.filename, entry.tuple.as_ref(), idx, total, config);
        Some(idx)
    }

    /// Widens the pending update and returns the descriptor of this change
    /// for the core's dispatch path.
    pub fn queue_update(&mut self, level: UpdateLevel, at: usize, count: usize) -> Update {
        self.pending.expand(level, at, count);
        Update { level, at, count }
    }

    /// Rotates the pending descriptor into the last-update slot.
    pub fn swap_updates(&mut self) {
        self.last = std::mem::take(&mut self.pending);
    }

    pub fn cancel_updates(&mut self) {
        self.pending = Update::default();
        self.last = Update::default();
    }

    pub fn last_update(&self) -> Update {
        self.last
    }

    pub fn update_pending(&self) -> bool {
        self.pending.level != UpdateLevel::NoUpdate
    }

    fn renumber(&mut self, from: usize) {
        for i in from..self.entries.len() {
            self.entries[i].number = i;
        }
    }

    fn refresh_titles(&mut self, config: &CoreConfig) {
        let total = self.entries.len();
        for idx in 0..total {
            let entry = &mut self.entries[idx];
            entry.title = format_title(&entry.filename, entry.tuple.as_ref(), idx, total, config);
        }
    }

    fn after_reorder(
        &mut self,
        position_key: Option<u64>,
        focus_key: Option<u64>,
        config: &CoreConfig,
    ) {
        self.renumber(0);
        self.refresh_titles(config);
        self.position = position_key.and_then(|key| self.index_of_key(key));
        self.focus = focus_key.and_then(|key| self.index_of_key(key));
    }
}

fn format_title(
    filename: &str,
    tuple: Option<&Tuple>,
    number: usize,
    total: usize,
    config: &CoreConfig,
) -> String {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(filename);

    let mut title = match tuple {
        Some(tuple) => {
            let name = match tuple.title.as_deref().filter(|t| !t.is_empty()) {
                Some(name) => name,
                None if config.metadata_fallbacks => stem,
                None => "",
            };
            match tuple.artist.as_deref().filter(|a| !a.is_empty()) {
                Some(artist) => config
                    .generic_title_format
                    .replace("${artist}", artist)
                    .replace("${title}", name)
                    .replace("${album}", tuple.album.as_deref().unwrap_or("")),
                None => name.to_string(),
            }
        }
        None => stem.to_string(),
    };

    if config.show_numbers {
        let width = if config.leading_zero {
            total.max(1).to_string().len()
        } else {
            1
        };
        title = format!("{:0>width$}. {}", number + 1, title, width = width);
    }
    title
}
