//! Queue and history store
//!
//! One `PlayQueue` per session: the FIFO play queue plus three bounded
//! rings — recently played (autoplay seeding and "back"), precomputed
//! autoplay candidates, and failed tracks kept for diagnostics. Ring
//! overflow silently evicts the oldest entry; history is advisory, not
//! authoritative.

use cadenza_common::{PlayerParams, Track};
use std::collections::VecDeque;

/// Where an enqueue lands in the play queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePosition {
    #[default]
    Tail,
    Head,
    Index(usize),
}

/// FIFO play queue plus bounded played/autoplay/failed rings
#[derive(Debug)]
pub struct PlayQueue {
    queue: VecDeque<Track>,
    played: VecDeque<Track>,
    autoplay: VecDeque<Track>,
    failed: VecDeque<Track>,
    history_capacity: usize,
    autoplay_capacity: usize,
    failed_capacity: usize,
}

impl PlayQueue {
    pub fn new(params: &PlayerParams) -> Self {
        Self {
            queue: VecDeque::new(),
            played: VecDeque::new(),
            autoplay: VecDeque::new(),
            failed: VecDeque::new(),
            history_capacity: params.history_capacity,
            autoplay_capacity: params.autoplay_capacity,
            failed_capacity: params.failed_capacity,
        }
    }

    pub fn enqueue(&mut self, track: Track, position: QueuePosition) {
        match position {
            QueuePosition::Tail => self.queue.push_back(track),
            QueuePosition::Head => self.queue.push_front(track),
            QueuePosition::Index(i) => {
                let i = i.min(self.queue.len());
                self.queue.insert(i, track);
            }
        }
    }

    /// Pop the queue head (the next track to play)
    pub fn pop_next(&mut self) -> Option<Track> {
        self.queue.pop_front()
    }

    pub fn remove(&mut self, index: usize) -> Option<Track> {
        self.queue.remove(index)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &Track> {
        self.queue.iter()
    }

    /// Drop queued entries; rings are left alone (cleared only on destroy)
    pub fn clear_queue(&mut self) {
        self.queue.clear();
    }

    /// Clear everything, including the diagnostic rings
    pub fn clear_all(&mut self) {
        self.queue.clear();
        self.played.clear();
        self.autoplay.clear();
        self.failed.clear();
    }

    /// Push to the played ring, evicting the oldest entry past capacity
    pub fn record_played(&mut self, track: Track) {
        push_bounded(&mut self.played, track, self.history_capacity);
    }

    /// Most-recent-first view of the played ring
    pub fn history(&self) -> impl Iterator<Item = &Track> {
        self.played.iter().rev()
    }

    pub fn history_len(&self) -> usize {
        self.played.len()
    }

    /// Take the most recently played track (the "back" operation)
    pub fn take_previous(&mut self) -> Option<Track> {
        self.played.pop_back()
    }

    pub fn record_failed(&mut self, track: Track) {
        push_bounded(&mut self.failed, track, self.failed_capacity);
    }

    pub fn failed(&self) -> impl Iterator<Item = &Track> {
        self.failed.iter()
    }

    pub fn record_autoplay_candidates<I>(&mut self, candidates: I)
    where
        I: IntoIterator<Item = Track>,
    {
        for track in candidates {
            push_bounded(&mut self.autoplay, track, self.autoplay_capacity);
        }
    }

    pub fn pop_autoplay_candidate(&mut self) -> Option<Track> {
        self.autoplay.pop_front()
    }

    pub fn autoplay_candidates(&self) -> impl Iterator<Item = &Track> {
        self.autoplay.iter()
    }

    pub fn autoplay_len(&self) -> usize {
        self.autoplay.len()
    }

    pub fn clear_autoplay(&mut self) {
        self.autoplay.clear();
    }

    /// Replace the queue wholesale (snapshot restore)
    pub fn restore_queue<I>(&mut self, tracks: I)
    where
        I: IntoIterator<Item = Track>,
    {
        self.queue = tracks.into_iter().collect();
    }

    /// Replace the played ring wholesale (snapshot restore), oldest first
    pub fn restore_history<I>(&mut self, tracks: I)
    where
        I: IntoIterator<Item = Track>,
    {
        self.played.clear();
        for track in tracks {
            push_bounded(&mut self.played, track, self.history_capacity);
        }
    }
}

fn push_bounded(ring: &mut VecDeque<Track>, track: Track, capacity: usize) {
    if capacity == 0 {
        return;
    }
    while ring.len() >= capacity {
        ring.pop_front();
    }
    ring.push_back(track);
}
