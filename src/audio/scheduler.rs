//! # Playback Scheduler
//!
//! Gapless, interruptible sequencing of decoded reply audio.
//!
//! ## How scheduling works:
//! A single cursor (`next_start_time`) marks the point on the output clock
//! where the next chunk begins. Each chunk starts exactly at the cursor and
//! pushes it forward by its own duration, so consecutive chunks abut with no
//! gap and no overlap, in call order, however late each one was decoded.
//!
//! ## Unit lifecycle:
//! Every scheduled chunk becomes a playback unit in the active set. A unit
//! leaves the set exactly once: either its completion hook reports a natural
//! end ([`PlaybackScheduler::handle_ended`]) or [`PlaybackScheduler::interrupt`]
//! stops it. Whichever comes second finds the unit already gone and does nothing.

use crate::audio::codec::DecodedAudioBuffer;
use crate::error::AppResult;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Identifier of one scheduled playback unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u64);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit-{}", self.0)
    }
}

/// Callback fired once when a unit finishes playing on its own.
pub type CompletionHook = Box<dyn FnOnce() + Send + 'static>;

/// Notifier the scheduler turns into per-unit completion hooks.
pub type CompletionNotifier = Arc<dyn Fn(UnitId) + Send + Sync>;

/// The playback side of the audio graph, as seen by the scheduler.
///
/// ## Contract:
/// - `now()` is the output clock in seconds; it only moves forward
/// - `start()` plays `buffer` from clock time `at` and calls `on_ended` once
///   when the last sample has been rendered
/// - `stop()` silences a unit immediately and drops its hook; stopping an
///   unknown or finished unit returns `false` and has no other effect
pub trait PlaybackSink: Send + Sync {
    fn now(&self) -> f64;

    fn start(
        &self,
        unit: UnitId,
        buffer: Arc<DecodedAudioBuffer>,
        at: f64,
        on_ended: CompletionHook,
    ) -> AppResult<()>;

    fn stop(&self, unit: UnitId) -> bool;
}

/// A scheduled chunk in the active set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackUnit {
    pub id: UnitId,
    pub start_time: f64,
    pub duration: f64,
}

impl PlaybackUnit {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

/// Owns the playback cursor and the set of active units for one session.
pub struct PlaybackScheduler {
    sink: Arc<dyn PlaybackSink>,
    notify: CompletionNotifier,
    next_start_time: f64,
    active: HashMap<UnitId, PlaybackUnit>,
    next_id: u64,
}

impl PlaybackScheduler {
    /// Create a scheduler driving `sink`. `notify` is called (from whatever
    /// thread renders audio) with the id of each unit that ends naturally; the
    /// owner routes it back into [`handle_ended`](Self::handle_ended).
    pub fn new(sink: Arc<dyn PlaybackSink>, notify: CompletionNotifier) -> Self {
        Self {
            sink,
            notify,
            next_start_time: 0.0,
            active: HashMap::new(),
            next_id: 0,
        }
    }

    /// Queue `buffer` to start exactly when the previous chunk ends.
    ///
    /// ## Steps:
    /// 1. Catch the cursor up to the output clock if playback has drained
    /// 2. Register a completion hook for the new unit
    /// 3. Start it at the cursor and advance the cursor by its duration
    /// 4. Record it in the active set
    ///
    /// If the sink refuses the unit, the cursor is left untouched.
    pub fn schedule_chunk(&mut self, buffer: DecodedAudioBuffer) -> AppResult<PlaybackUnit> {
        let start_time = self.next_start_time.max(self.sink.now());

        self.next_id += 1;
        let id = UnitId(self.next_id);
        let notify = Arc::clone(&self.notify);
        let on_ended: CompletionHook = Box::new(move || notify(id));

        let unit = PlaybackUnit {
            id,
            start_time,
            duration: buffer.duration(),
        };

        self.sink.start(id, Arc::new(buffer), unit.start_time, on_ended)?;
        self.next_start_time = unit.end_time();
        self.active.insert(id, unit);

        debug!(
            unit = %id,
            start = unit.start_time,
            duration = unit.duration,
            end = unit.end_time(),
            active = self.active.len(),
            "Scheduled reply chunk"
        );
        Ok(unit)
    }

    /// Remove a unit that finished on its own. Returns `false` if it had
    /// already been removed by an interruption.
    pub fn handle_ended(&mut self, id: UnitId) -> bool {
        let removed = self.active.remove(&id).is_some();
        if removed {
            debug!(unit = %id, remaining = self.active.len(), "Reply chunk finished");
        }
        removed
    }

    /// Barge-in: stop every active unit and rewind the cursor.
    ///
    /// Returns how many units were cut off.
    pub fn interrupt(&mut self) -> usize {
        let flushed = self.active.len();
        for (id, _) in self.active.drain() {
            self.sink.stop(id);
        }
        self.next_start_time = 0.0;

        if flushed > 0 {
            info!(flushed, "Reply playback interrupted");
        }
        flushed
    }

    /// Full session reset. Same effect as [`interrupt`](Self::interrupt).
    pub fn reset(&mut self) -> usize {
        self.interrupt()
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, id: UnitId) -> bool {
        self.active.contains_key(&id)
    }

    /// Whether any reply audio is scheduled or playing.
    pub fn is_playing(&self) -> bool {
        !self.active.is_empty()
    }
}
