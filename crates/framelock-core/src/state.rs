//! Playback state and its single transition owner.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::player::PlayerError;

/// Playback state of a [`Player`](crate::player::Player).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlaybackState {
    /// Nothing running; the initial state and the state after `stop()`
    Stopped,
    /// The scheduler is presenting frames
    Playing,
    /// Presentation is halted; threads stay alive
    Paused,
    /// The store ran low; waiting for the decoder to catch up
    Buffering,
    /// A seek owns the decoder and the store
    Seeking,
    /// A slow-path seek is decoding towards its target
    SeekBuffering,
    /// Video decoding finished; buffered frames are still draining
    EndedStream,
    /// Every frame has been presented
    Ended,
}

impl PlaybackState {
    /// Whether the edge `self -> to` is allowed.
    pub fn can_transition_to(self, to: PlaybackState) -> bool {
        use PlaybackState::*;
        matches!(
            (self, to),
            (Stopped, Playing)
                | (Playing, Paused | Buffering | Seeking | EndedStream | Stopped)
                | (Buffering, Playing | Paused | Seeking | Stopped)
                | (Paused, Playing | Seeking | Stopped)
                | (Seeking, SeekBuffering | Paused | Stopped)
                | (SeekBuffering, Paused | Stopped)
                | (EndedStream, Ended | Paused | Seeking | Stopped)
                | (Ended, Seeking | Stopped)
        )
    }

    /// States in which the scheduler sleeps instead of consuming frames.
    pub fn is_holding(self) -> bool {
        matches!(
            self,
            PlaybackState::Paused | PlaybackState::Buffering | PlaybackState::SeekBuffering
        )
    }

    pub fn is_seeking(self) -> bool {
        matches!(self, PlaybackState::Seeking | PlaybackState::SeekBuffering)
    }
}

impl std::fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
            PlaybackState::Buffering => "buffering",
            PlaybackState::Seeking => "seeking",
            PlaybackState::SeekBuffering => "seek-buffering",
            PlaybackState::EndedStream => "ended-stream",
            PlaybackState::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Mutex-guarded [`PlaybackState`] that only accepts edges from the
/// transition table. Readers observe, one writer at a time transitions.
pub struct StateCell {
    state: Mutex<PlaybackState>,
    changed: Condvar,
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PlaybackState::Stopped),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> PlaybackState {
        *self.state.lock()
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&self, to: PlaybackState) -> Result<PlaybackState, PlayerError> {
        let mut state = self.state.lock();
        let from = *state;
        if !from.can_transition_to(to) {
            return Err(PlayerError::InvalidTransition { from, to });
        }
        *state = to;
        self.changed.notify_all();
        tracing::debug!("Playback state {} -> {}", from, to);
        Ok(from)
    }

    /// Moves to `to` only if the current state is one of `from`. Returns the
    /// previous state on success.
    pub fn transition_from(
        &self,
        from: &[PlaybackState],
        to: PlaybackState,
    ) -> Result<PlaybackState, PlayerError> {
        let mut state = self.state.lock();
        let current = *state;
        if !from.contains(&current) || !current.can_transition_to(to) {
            return Err(PlayerError::InvalidTransition { from: current, to });
        }
        *state = to;
        self.changed.notify_all();
        tracing::debug!("Playback state {} -> {}", current, to);
        Ok(current)
    }

    /// Moves to `Stopped` from any state. Returns the previous state.
    pub fn stop(&self) -> PlaybackState {
        let mut state = self.state.lock();
        let from = *state;
        if from != PlaybackState::Stopped {
            *state = PlaybackState::Stopped;
            self.changed.notify_all();
            tracing::debug!("Playback state {} -> stopped", from);
        }
        from
    }

    /// Blocks while `pred(state)` holds, up to `timeout`. Returns the state
    /// observed last.
    pub fn wait_while(
        &self,
        timeout: Duration,
        pred: impl Fn(PlaybackState) -> bool,
    ) -> PlaybackState {
        let mut state = self.state.lock();
        if pred(*state) {
            self.changed.wait_for(&mut state, timeout);
        }
        *state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PlaybackState::*;

    const ALL: [PlaybackState; 8] = [
        Stopped,
        Playing,
        Paused,
        Buffering,
        Seeking,
        SeekBuffering,
        EndedStream,
        Ended,
    ];

    #[test]
    fn test_lifecycle_edges() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), Stopped);
        for to in [Playing, Buffering, Playing, Seeking, SeekBuffering, Paused, Playing, EndedStream, Ended] {
            let Ok(_) = cell.transition(to) else {
                panic!("edge to {to} rejected");
            };
        }
        assert_eq!(cell.stop(), Ended);
        assert_eq!(cell.get(), Stopped);
    }

    #[test]
    fn test_rejects_edges_outside_table() {
        let cell = StateCell::new();
        assert!(matches!(
            cell.transition(Paused),
            Err(PlayerError::InvalidTransition { from: Stopped, to: Paused })
        ));
        let Ok(_) = cell.transition(Playing) else {
            panic!("play rejected");
        };
        assert!(cell.transition(SeekBuffering).is_err());
        assert!(cell.transition(Ended).is_err());
        assert_eq!(cell.get(), Playing);
    }

    #[test]
    fn test_table_has_no_self_edges() {
        for state in ALL {
            assert!(!state.can_transition_to(state), "{state} -> {state}");
        }
        let edges = ALL
            .iter()
            .flat_map(|a| ALL.iter().map(move |b| (*a, *b)))
            .filter(|(a, b)| a.can_transition_to(*b))
            .count();
        assert_eq!(edges, 24);
    }

    #[test]
    fn test_transition_from_checks_current() {
        let cell = StateCell::new();
        let Ok(_) = cell.transition(Playing) else {
            panic!("play rejected");
        };
        assert!(cell.transition_from(&[Buffering], Playing).is_err());
        assert_eq!(cell.transition_from(&[Playing, Buffering], Seeking).ok(), Some(Playing));
        assert!(cell.transition_from(&[Playing, Buffering], Seeking).is_err());
    }

    #[test]
    fn test_wait_while_returns_on_change() {
        let cell = std::sync::Arc::new(StateCell::new());
        let writer = {
            let cell = std::sync::Arc::clone(&cell);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                let _ = cell.transition(Playing);
            })
        };
        let mut seen = Stopped;
        for _ in 0..100 {
            seen = cell.wait_while(Duration::from_millis(50), |s| s == Stopped);
            if seen != Stopped {
                break;
            }
        }
        assert_eq!(seen, Playing);
        let Ok(()) = writer.join() else {
            panic!("writer panicked");
        };
    }
}
