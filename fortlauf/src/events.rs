//! Parse listeners: synchronous observation of parse runs.
//!
//! Listeners are called from the parse thread. A failing listener does not
//! corrupt the parse state: the failure is captured and the run is aborted
//! with [`RunError::Listener`](crate::RunError::Listener) at the next
//! synchronous boundary, attributed to the phase that produced it.

use std::fmt;

use crate::buffer::InputBuffer;
use crate::grammar::MatcherId;

/// The phases a listener can observe.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParsePhase {
    /// Before the root matcher runs.
    PreParse,
    /// Before a matcher is attempted.
    PreMatch,
    /// After a matcher succeeded.
    MatchSuccess,
    /// After a matcher failed.
    MatchFailure,
    /// After the root matcher returned.
    PostParse,
}

impl fmt::Display for ParsePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParsePhase::PreParse => "pre-parse",
            ParsePhase::PreMatch => "pre-match",
            ParsePhase::MatchSuccess => "match-success",
            ParsePhase::MatchFailure => "match-failure",
            ParsePhase::PostParse => "post-parse",
        };
        f.write_str(name)
    }
}

/// Details of a single match attempt, as seen by listeners.
pub struct MatchEvent<'a> {
    /// The matcher being attempted.
    pub matcher: MatcherId,
    /// The label of the matcher.
    pub label: &'a str,
    /// The logical index the attempt started at.
    pub start_index: usize,
    /// The current logical index (past the match for success events).
    pub current_index: usize,
    /// Nesting depth of the attempt, starting at `0` for the root.
    pub depth: usize,
}

/// Result type of listener callbacks.
pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Observer of parse runs, registered on a runner.
///
/// All methods default to doing nothing. Match events are delivered for the
/// user visible runs of a runner (the plain run, and for the recovering
/// runner the baseline and final runs); the speculative repair runs in
/// between stay silent.
pub trait ParseListener<V> {
    /// Called once before the root matcher runs.
    fn pre_parse(&mut self, buffer: &dyn InputBuffer) -> ListenerResult {
        let _ = buffer;
        Ok(())
    }

    /// Called before each matcher attempt.
    fn pre_match(&mut self, event: &MatchEvent<'_>) -> ListenerResult {
        let _ = event;
        Ok(())
    }

    /// Called after each successful matcher attempt.
    fn match_success(&mut self, event: &MatchEvent<'_>) -> ListenerResult {
        let _ = event;
        Ok(())
    }

    /// Called after each failed matcher attempt.
    fn match_failure(&mut self, event: &MatchEvent<'_>) -> ListenerResult {
        let _ = event;
        Ok(())
    }

    /// Called once after the root matcher returned.
    fn post_parse(&mut self, matched: bool, buffer: &dyn InputBuffer) -> ListenerResult {
        let _ = (matched, buffer);
        Ok(())
    }
}
