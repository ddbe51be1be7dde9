//! Error model: recoverable input errors and fatal run errors.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::events::ParsePhase;
use crate::grammar::{Grammar, MatcherId};

/// Fatal errors aborting a parse run.
///
/// Everything in here signals a defect in the grammar, a broken engine
/// invariant, a failing listener or an exceeded time budget. Malformed *input*
/// is never fatal: the recovering runner turns it into
/// [`InvalidInputError`] entries of the parse result instead.
#[derive(Error, Debug)]
pub enum RunError {
    /// The parse took longer than the configured timeout.
    #[error("parse run exceeded the configured timeout of {timeout:?}")]
    Timeout {
        /// The configured time budget that was exceeded.
        timeout: Duration,
    },
    /// The grammar itself is defective, e.g. a repetition over a matcher that
    /// can succeed without consuming input, or a rule that was never defined.
    #[error("invalid grammar: {0}")]
    InvalidGrammar(String),
    /// An engine or buffer invariant was broken. Always a bug.
    #[error("parser invariant violated: {0}")]
    Invariant(String),
    /// A registered listener failed; the parse is aborted at the next
    /// synchronous boundary.
    #[error("parse listener failed at {phase}: {source}")]
    Listener {
        /// The parse phase whose notification failed.
        phase: ParsePhase,
        /// The error returned by the listener.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RunError {
    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        RunError::Invariant(message.into())
    }
}

/// One step of a [`MatcherPath`]: a matcher and the index it was entered at.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MatcherPathElement {
    /// The matcher entered at this step.
    pub matcher: MatcherId,
    /// The logical input index the matcher started at.
    pub start_index: usize,
}

/// The chain of matchers from the root down to a specific match attempt.
///
/// Identifies a grammar position, e.g. which terminals failed at an error
/// location.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatcherPath {
    elements: Vec<MatcherPathElement>,
}

impl MatcherPath {
    pub(crate) fn new(elements: Vec<MatcherPathElement>) -> Self {
        debug_assert!(!elements.is_empty());
        Self { elements }
    }

    /// The steps of the path, from the root downwards.
    pub fn elements(&self) -> &[MatcherPathElement] {
        &self.elements
    }

    /// The innermost element, i.e. the matcher whose attempt this path
    /// records.
    pub fn leaf(&self) -> MatcherPathElement {
        *self.elements.last().unwrap()
    }

    /// Returns whether `self` is a prefix of `other`, comparing matchers per
    /// level.
    pub fn is_prefix_of(&self, other: &MatcherPath) -> bool {
        self.elements.len() <= other.elements.len()
            && self
                .elements
                .iter()
                .zip(&other.elements)
                .all(|(a, b)| a.matcher == b.matcher)
    }

    /// Renders the path as the rule labels joined with `/`.
    pub fn describe<V>(&self, grammar: &Grammar<V>) -> String {
        let mut out = String::new();
        for (i, element) in self.elements.iter().enumerate() {
            if i > 0 {
                out.push('/');
            }
            out.push_str(grammar.label(element.matcher));
        }
        out
    }
}

/// A single malformed region of the input, as located and repaired by the
/// recovering runner.
///
/// `start_index` and `end_index` are logical indices into the (patched) buffer
/// of the parse result; they are equal for a point error and span the skipped
/// region after a resynchronisation. Projecting them through
/// [`InputBuffer::original_index`](crate::InputBuffer::original_index) yields
/// positions in the original text.
#[derive(Clone, Debug)]
pub struct InvalidInputError {
    start_index: usize,
    end_index: usize,
    index_delta: isize,
    /// The matcher paths that were attempted and failed at the error location.
    pub failed_matchers: Vec<MatcherPath>,
}

impl InvalidInputError {
    pub(crate) fn new(index: usize, failed_matchers: Vec<MatcherPath>) -> Self {
        Self {
            start_index: index,
            end_index: index,
            index_delta: 0,
            failed_matchers,
        }
    }

    /// First logical index of the malformed region.
    pub fn start_index(&self) -> usize {
        (self.start_index as isize + self.index_delta) as usize
    }

    /// First logical index past the malformed region. Equal to
    /// [`start_index`](Self::start_index) for a point error.
    pub fn end_index(&self) -> usize {
        (self.end_index as isize + self.index_delta) as usize
    }

    /// Moves the reported indices to compensate for characters the runner
    /// inserted below them.
    pub(crate) fn shift_index_delta_by(&mut self, delta: isize) {
        self.index_delta += delta;
    }

    /// Records where the malformed region ends, given as a current logical
    /// index.
    pub(crate) fn set_end_index(&mut self, end_index: usize) {
        self.end_index = (end_index as isize - self.index_delta) as usize;
    }
}

impl fmt::Display for InvalidInputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start_index() == self.end_index() {
            write!(f, "invalid input at index {}", self.start_index())
        } else {
            write!(
                f,
                "invalid input in the range {}..{}",
                self.start_index(),
                self.end_index()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(matchers: &[u32]) -> MatcherPath {
        // MatcherId is opaque outside the crate; build paths through a grammar
        let mut builder = crate::GrammarBuilder::<()>::new();
        let ids: Vec<_> = (0..=*matchers.iter().max().unwrap())
            .map(|_| builder.ch('x'))
            .collect();
        MatcherPath::new(
            matchers
                .iter()
                .map(|&m| MatcherPathElement {
                    matcher: ids[m as usize],
                    start_index: 0,
                })
                .collect(),
        )
    }

    #[test]
    fn prefix_compares_matchers_per_level() {
        let a = path(&[0, 1]);
        let b = path(&[0, 1, 2]);
        let c = path(&[0, 2, 2]);
        assert!(a.is_prefix_of(&b));
        assert!(!b.is_prefix_of(&a));
        assert!(!a.is_prefix_of(&c));
        assert!(a.is_prefix_of(&a));
    }

    #[test]
    fn delta_shifts_both_indices() {
        let mut error = InvalidInputError::new(3, vec![]);
        error.shift_index_delta_by(2);
        assert_eq!(error.start_index(), 5);
        assert_eq!(error.end_index(), 5);
        error.set_end_index(9);
        assert_eq!(error.end_index(), 9);
        error.shift_index_delta_by(1);
        assert_eq!(error.start_index(), 6);
        assert_eq!(error.end_index(), 10);
    }
}
