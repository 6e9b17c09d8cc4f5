//! Play-order sequencing
//!
//! Decides which track plays next: sequential or shuffled, with a repeat
//! policy on top. Shuffle avoids back-to-back repeats and biases against
//! anything played within a recent-history window, so short playlists still
//! vary between cycles.
//!
//! The sequencer is polled ahead of the audible cursor by the prebuffer
//! manager; `rewind_for_back` exists so skip-back can unwind that lookahead.

use crate::playlist::{Playlist, PlaylistEntry, Track, TrackId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use segue_common::{RepeatMode, Settings};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Recent-play bias window, used by shuffle
///
/// Bounded history of track indices; anything inside it is avoided while
/// other candidates remain.
#[derive(Debug)]
struct ShuffleState {
    recent: VecDeque<usize>,
    window: usize,
}

impl ShuffleState {
    fn new(window: usize) -> Self {
        Self {
            recent: VecDeque::with_capacity(window),
            window,
        }
    }

    fn push(&mut self, index: usize) {
        self.recent.push_back(index);
        while self.recent.len() > self.window {
            self.recent.pop_front();
        }
    }

    fn contains(&self, index: usize) -> bool {
        self.recent.contains(&index)
    }
}

/// Track sequencer with shuffle and repeat policies
pub struct Sequencer {
    entries: Vec<PlaylistEntry>,
    shuffle: bool,
    repeat: RepeatMode,
    rng: StdRng,
    shuffle_state: ShuffleState,

    /// Sequential cursor (next index to issue)
    cursor: usize,
    /// Indices issued in the current cycle (shuffle bookkeeping)
    issued_this_cycle: HashSet<usize>,
    /// Every index issued, in issue order (skip-back support)
    issued_log: Vec<usize>,
    /// Pinned index for RepeatOne
    pinned: Option<usize>,
    /// Replays queued by `rewind_for_back`, issued before normal order
    pending: VecDeque<usize>,
    /// Terminal state under NoRepeat
    exhausted: bool,
}

impl Sequencer {
    pub fn new(playlist: &Playlist, settings: &Settings, seed: Option<u64>) -> Self {
        let len = playlist.len();
        let window = if settings.shuffle_history > 0 {
            settings.shuffle_history
        } else {
            (len / 3).max(2)
        };

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        debug!(
            "Sequencer: {} tracks, shuffle={}, repeat={}, history window={}",
            len, settings.shuffle, settings.repeat, window
        );

        Self {
            entries: playlist.entries().to_vec(),
            shuffle: settings.shuffle,
            repeat: settings.repeat,
            rng,
            shuffle_state: ShuffleState::new(window),
            cursor: 0,
            issued_this_cycle: HashSet::new(),
            issued_log: Vec::new(),
            pinned: None,
            pending: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether NoRepeat has run the playlist dry
    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Hand out the next track to prepare
    ///
    /// Returns `None` (terminal) only under NoRepeat once every track has
    /// been issued.
    pub fn next(&mut self) -> Option<Arc<Track>> {
        if self.exhausted || self.entries.is_empty() {
            return None;
        }

        if let Some(index) = self.pending.pop_front() {
            return Some(self.issue(index));
        }

        if self.repeat == RepeatMode::RepeatOne {
            let index = match self.pinned {
                Some(index) => index,
                None => {
                    let index = if self.shuffle {
                        self.rng.gen_range(0..self.entries.len())
                    } else {
                        0
                    };
                    self.pinned = Some(index);
                    index
                }
            };
            return Some(self.issue(index));
        }

        let index = if self.shuffle {
            self.next_shuffled()?
        } else {
            self.next_sequential()?
        };

        Some(self.issue(index))
    }

    fn next_sequential(&mut self) -> Option<usize> {
        if self.cursor >= self.entries.len() {
            match self.repeat {
                RepeatMode::NoRepeat => {
                    self.exhausted = true;
                    return None;
                }
                _ => self.cursor = 0,
            }
        }
        let index = self.cursor;
        self.cursor += 1;
        Some(index)
    }

    fn next_shuffled(&mut self) -> Option<usize> {
        let all: Vec<usize> = (0..self.entries.len()).collect();

        let mut candidates: Vec<usize> = all
            .iter()
            .copied()
            .filter(|i| !self.issued_this_cycle.contains(i))
            .collect();

        if candidates.is_empty() {
            if self.repeat == RepeatMode::NoRepeat {
                self.exhausted = true;
                return None;
            }
            // New cycle; the history window carries over so cycle
            // boundaries do not produce near-repeats
            self.issued_this_cycle.clear();
            candidates = all;
        }

        // Prefer candidates outside the recent window; when the whole pool
        // is recent (tiny playlist), at least avoid the immediately-previous
        // track. A lone survivor plays regardless of history.
        let fresh: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|i| !self.shuffle_state.contains(*i))
            .collect();

        let pool = if !fresh.is_empty() {
            fresh
        } else {
            let last = self.issued_log.last().copied();
            let non_last: Vec<usize> = candidates
                .iter()
                .copied()
                .filter(|i| Some(*i) != last)
                .collect();
            if non_last.is_empty() {
                candidates
            } else {
                non_last
            }
        };

        let pick = pool[self.rng.gen_range(0..pool.len())];
        Some(pick)
    }

    fn issue(&mut self, index: usize) -> Arc<Track> {
        self.issued_this_cycle.insert(index);
        self.shuffle_state.push(index);
        self.issued_log.push(index);
        Arc::clone(&self.entries[index].track)
    }

    /// Unwind the lookahead for a skip-back
    ///
    /// Arranges for `next()` to re-issue the track played before `current`,
    /// then `current` itself, then continue naturally. Everything issued
    /// after `current` (prefetched but discarded by the flush) is forgotten
    /// so shuffle can draw it again.
    pub fn rewind_for_back(&mut self, current: &TrackId) {
        self.exhausted = false;
        self.pending.clear();

        let Some(pos) = self
            .issued_log
            .iter()
            .rposition(|&i| self.entries[i].track.id == *current)
        else {
            return;
        };

        // Forget the prefetched tail (after current)
        for index in self.issued_log.drain(pos + 1..) {
            self.issued_this_cycle.remove(&index);
        }

        // Pop current; it will be re-issued
        let current_index = self.issued_log.pop().expect("position exists");
        self.issued_this_cycle.remove(&current_index);

        // Pop the previous track too, if there is one
        if let Some(previous_index) = self.issued_log.pop() {
            self.issued_this_cycle.remove(&previous_index);
            self.pending.push_back(previous_index);
        }
        self.pending.push_back(current_index);

        // Sequential continuation resumes after current
        self.cursor = current_index + 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playlist(n: usize) -> Playlist {
        let json: Vec<String> = (0..n)
            .map(|i| {
                format!(
                    r#"{{"id": "t{}", "title": "Track {}", "url": "http://x/{}", "duration": 180.0}}"#,
                    i, i, i
                )
            })
            .collect();
        let json = format!("[{}]", json.join(","));
        let descriptors: Vec<serde_json::Value> = serde_json::from_str(&json).unwrap();
        // Round-trip through the real loader path
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("playlist.json");
        std::fs::write(&path, serde_json::to_string(&descriptors).unwrap()).unwrap();
        Playlist::load(&path).unwrap()
    }

    fn settings(shuffle: bool, repeat: RepeatMode) -> Settings {
        Settings {
            shuffle,
            repeat,
            ..Default::default()
        }
    }

    fn id_of(track: &Arc<Track>) -> &str {
        track.id.as_str()
    }

    #[test]
    fn test_sequential_repeat_all_wraps() {
        let playlist = playlist(3);
        let mut seq = Sequencer::new(&playlist, &settings(false, RepeatMode::RepeatAll), Some(1));

        let ids: Vec<String> = (0..7)
            .map(|_| id_of(&seq.next().unwrap()).to_string())
            .collect();
        assert_eq!(ids, vec!["t0", "t1", "t2", "t0", "t1", "t2", "t0"]);
    }

    #[test]
    fn test_sequential_no_repeat_terminates() {
        let playlist = playlist(3);
        let mut seq = Sequencer::new(&playlist, &settings(false, RepeatMode::NoRepeat), Some(1));

        assert!(seq.next().is_some());
        assert!(seq.next().is_some());
        assert!(seq.next().is_some());
        assert!(seq.next().is_none());
        assert!(seq.is_exhausted());
        // Terminal, not transient
        assert!(seq.next().is_none());
    }

    #[test]
    fn test_repeat_one_pins_first_track() {
        let playlist = playlist(4);
        let mut seq = Sequencer::new(&playlist, &settings(false, RepeatMode::RepeatOne), Some(1));

        for _ in 0..10 {
            assert_eq!(id_of(&seq.next().unwrap()), "t0");
        }
    }

    #[test]
    fn test_shuffle_no_immediate_repeat() {
        let playlist = playlist(5);
        let mut seq = Sequencer::new(&playlist, &settings(true, RepeatMode::RepeatAll), Some(9));

        let mut last = String::new();
        for _ in 0..200 {
            let id = id_of(&seq.next().unwrap()).to_string();
            assert_ne!(id, last, "immediate repeat");
            last = id;
        }
    }

    #[test]
    fn test_shuffle_respects_history_window() {
        let playlist = playlist(10);
        let mut config = settings(true, RepeatMode::RepeatAll);
        config.shuffle_history = 3;
        let mut seq = Sequencer::new(&playlist, &config, Some(5));

        let ids: Vec<String> = (0..300)
            .map(|_| id_of(&seq.next().unwrap()).to_string())
            .collect();

        for window in ids.windows(4) {
            let mut seen = HashSet::new();
            for id in window {
                assert!(seen.insert(id.clone()), "repeat within window: {:?}", window);
            }
        }
    }

    #[test]
    fn test_shuffle_covers_whole_playlist_each_cycle() {
        let playlist = playlist(6);
        let mut seq = Sequencer::new(&playlist, &settings(true, RepeatMode::RepeatAll), Some(3));

        let first_cycle: HashSet<String> = (0..6)
            .map(|_| id_of(&seq.next().unwrap()).to_string())
            .collect();
        assert_eq!(first_cycle.len(), 6);
    }

    #[test]
    fn test_shuffle_no_repeat_terminates_after_full_pass() {
        let playlist = playlist(4);
        let mut seq = Sequencer::new(&playlist, &settings(true, RepeatMode::NoRepeat), Some(2));

        let mut seen = HashSet::new();
        for _ in 0..4 {
            seen.insert(id_of(&seq.next().unwrap()).to_string());
        }
        assert_eq!(seen.len(), 4);
        assert!(seq.next().is_none());
    }

    #[test]
    fn test_single_track_playlist_shuffles() {
        let playlist = playlist(1);
        let mut seq = Sequencer::new(&playlist, &settings(true, RepeatMode::RepeatAll), Some(1));

        // Only one eligible track: history must not deadlock
        for _ in 0..5 {
            assert_eq!(id_of(&seq.next().unwrap()), "t0");
        }
    }

    #[test]
    fn test_rewind_for_back_replays_previous_and_current() {
        let playlist = playlist(5);
        let mut seq = Sequencer::new(&playlist, &settings(false, RepeatMode::RepeatAll), Some(1));

        // Issue t0..t3 (t0, t1 played; t2, t3 prefetched)
        for _ in 0..4 {
            seq.next().unwrap();
        }

        // Audible track is t1; skip back
        seq.rewind_for_back(&TrackId::from("t1"));

        let ids: Vec<String> = (0..4)
            .map(|_| id_of(&seq.next().unwrap()).to_string())
            .collect();
        assert_eq!(ids, vec!["t0", "t1", "t2", "t3"]);
    }

    #[test]
    fn test_rewind_at_first_track_restarts_it() {
        let playlist = playlist(3);
        let mut seq = Sequencer::new(&playlist, &settings(false, RepeatMode::RepeatAll), Some(1));

        seq.next().unwrap(); // t0
        seq.next().unwrap(); // t1 prefetched

        seq.rewind_for_back(&TrackId::from("t0"));
        assert_eq!(id_of(&seq.next().unwrap()), "t0");
        assert_eq!(id_of(&seq.next().unwrap()), "t1");
    }
}
