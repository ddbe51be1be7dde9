//! The parse runners: a plain single-pass runner and the recovering runner.

use std::time::{Duration, Instant};

use crate::buffer::{InputBuffer, PatchBuffer, TextBuffer};
use crate::chars;
use crate::engine::{Engine, EngineOutcome, HandlerMode, RunConfig, RunMode};
use crate::error::{InvalidInputError, RunError};
use crate::events::ParseListener;
use crate::grammar::Grammar;
use crate::result::ParseResult;
use crate::stack::ValueStack;
use crate::visitors;

/// Runs the root matcher once, without error recovery.
///
/// The result's `matched` flag reports whether the input conforms to the
/// grammar; no input errors are collected. Use
/// [`RecoveringRunner`] to parse malformed input to completion.
pub struct BasicRunner<'g, V> {
    grammar: &'g Grammar<V>,
    listeners: Vec<Box<dyn ParseListener<V>>>,
}

impl<'g, V> BasicRunner<'g, V> {
    /// Creates a runner for the given grammar.
    pub fn new(grammar: &'g Grammar<V>) -> Self {
        Self {
            grammar,
            listeners: Vec::new(),
        }
    }

    /// Subscribes a listener to the runner's parse events.
    pub fn register_listener(&mut self, listener: Box<dyn ParseListener<V>>) {
        self.listeners.push(listener);
    }

    /// Parses `input`.
    pub fn run_str(&mut self, input: &str) -> Result<ParseResult<V>, RunError> {
        self.run_buffer(TextBuffer::new(input))
    }

    /// Parses the contents of `input`.
    pub fn run_buffer(&mut self, input: TextBuffer) -> Result<ParseResult<V>, RunError> {
        let mut buffer = PatchBuffer::new(input);
        let mut errors = Vec::new();
        let notify = !self.listeners.is_empty();
        let outcome = Engine::new(
            self.grammar,
            &mut buffer,
            &mut errors,
            &mut self.listeners,
            RunConfig {
                handler: HandlerMode::Direct,
                mode: RunMode::Plain,
                build_tree: true,
                notify_listeners: notify,
                timeout: None,
                started: Instant::now(),
            },
        )
        .run()?;
        Ok(ParseResult {
            matched: outcome.matched,
            tree: outcome.tree,
            stack: outcome.stack,
            errors,
            buffer,
        })
    }
}

/// Parses any input to completion, repairing and reporting every error.
///
/// A clean input is parsed in a single pass at the speed of the
/// [`BasicRunner`]. When the input does not conform to the grammar, the
/// runner repeatedly locates the first remaining error, tries to get past it
/// by deleting, inserting or replacing a single character (whichever carries
/// the parse furthest), and falls back to resynchronisation when no single
/// character fix helps. Repairs are spliced into the buffer as marker
/// characters, so the finished parse sees a conforming character stream. The
/// returned result always has `matched == true` and one
/// [`InvalidInputError`] per repaired error.
pub struct RecoveringRunner<'g, V> {
    grammar: &'g Grammar<V>,
    timeout: Option<Duration>,
    listeners: Vec<Box<dyn ParseListener<V>>>,
    last_result: Option<ParseResult<V>>,
}

impl<'g, V> RecoveringRunner<'g, V> {
    /// Creates a runner for the given grammar, without a time budget.
    pub fn new(grammar: &'g Grammar<V>) -> Self {
        Self {
            grammar,
            timeout: None,
            listeners: Vec::new(),
            last_result: None,
        }
    }

    /// Creates a runner aborting with [`RunError::Timeout`] when a parse
    /// takes longer than `timeout`.
    pub fn with_timeout(grammar: &'g Grammar<V>, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new(grammar)
        }
    }

    /// Subscribes a listener to the runner's parse events.
    ///
    /// Listeners observe the baseline run over the unmodified input and, if
    /// repairs were necessary, the final run over the repaired input. The
    /// speculative repair runs in between are not reported.
    pub fn register_listener(&mut self, listener: Box<dyn ParseListener<V>>) {
        self.listeners.push(listener);
    }

    /// The partial result of the most recent failed run, if any.
    ///
    /// Populated when a run returns a fatal error, with whatever buffer state
    /// and input errors had been established by then.
    pub fn last_result(&self) -> Option<&ParseResult<V>> {
        self.last_result.as_ref()
    }

    /// Takes ownership of the partial result of the most recent failed run.
    pub fn take_last_result(&mut self) -> Option<ParseResult<V>> {
        self.last_result.take()
    }

    /// Parses `input` to completion.
    pub fn run_str(&mut self, input: &str) -> Result<ParseResult<V>, RunError> {
        self.run_buffer(TextBuffer::new(input))
    }

    /// Parses the contents of `input` to completion.
    pub fn run_buffer(&mut self, input: TextBuffer) -> Result<ParseResult<V>, RunError> {
        let started = Instant::now();
        let mut buffer = PatchBuffer::new(input);
        let mut errors = Vec::new();
        let notify = !self.listeners.is_empty();

        let baseline = Engine::new(
            self.grammar,
            &mut buffer,
            &mut errors,
            &mut self.listeners,
            RunConfig {
                handler: HandlerMode::Direct,
                mode: RunMode::Plain,
                build_tree: true,
                notify_listeners: notify,
                timeout: self.timeout,
                started,
            },
        )
        .run();

        let recovered = match baseline {
            Ok(outcome) if outcome.matched => {
                return Ok(ParseResult {
                    matched: true,
                    tree: outcome.tree,
                    stack: outcome.stack,
                    errors,
                    buffer,
                });
            }
            Ok(_) => {
                let mut repair = Repair {
                    grammar: self.grammar,
                    buffer: &mut buffer,
                    errors: &mut errors,
                    listeners: &mut self.listeners,
                    timeout: self.timeout,
                    started,
                    notify,
                    error_index: None,
                };
                repair.recover()
            }
            Err(error) => Err(error),
        };

        match recovered {
            Ok(outcome) => {
                if !outcome.matched {
                    return Err(RunError::invariant(
                        "final run over the repaired input did not match",
                    ));
                }
                Ok(ParseResult {
                    matched: true,
                    tree: outcome.tree,
                    stack: outcome.stack,
                    errors,
                    buffer,
                })
            }
            Err(error) => {
                // keep the repaired-so-far state for post-mortem inspection
                self.last_result = Some(ParseResult {
                    matched: false,
                    tree: None,
                    stack: ValueStack::new(),
                    errors,
                    buffer,
                });
                Err(error)
            }
        }
    }
}

enum InsertionSearch {
    /// A trial rendered the whole input error free; the edit stays committed.
    InputIsErrorFree,
    /// The candidate pushing the error furthest to the right, if any.
    Best(Option<char>),
}

/// Per-run state of the repair loop.
struct Repair<'r, 'g, V> {
    grammar: &'g Grammar<V>,
    buffer: &'r mut PatchBuffer,
    errors: &'r mut Vec<InvalidInputError>,
    listeners: &'r mut Vec<Box<dyn ParseListener<V>>>,
    timeout: Option<Duration>,
    started: Instant,
    notify: bool,
    /// Location of the earliest remaining error, `None` once the input
    /// parses cleanly.
    error_index: Option<usize>,
}

impl<'r, 'g, V> Repair<'r, 'g, V> {
    fn recover(&mut self) -> Result<EngineOutcome<V>, RunError> {
        self.error_index = self.locating_run()?;
        if self.error_index.is_none() {
            return Err(RunError::invariant(
                "baseline run failed but the locating run found no error",
            ));
        }
        self.reporting_run()?;
        while !self.fix_error()? {
            self.reporting_run()?;
        }
        // rerun with tree building to produce the user visible result
        self.run_engine(RunMode::Plain, true, self.notify)
    }

    fn run_engine(
        &mut self,
        mode: RunMode,
        build_tree: bool,
        notify: bool,
    ) -> Result<EngineOutcome<V>, RunError> {
        Engine::new(
            self.grammar,
            self.buffer,
            self.errors,
            self.listeners,
            RunConfig {
                handler: HandlerMode::Recovery,
                mode,
                build_tree,
                notify_listeners: notify,
                timeout: self.timeout,
                started: self.started,
            },
        )
        .run()
    }

    /// Runs the matcher to find the first remaining error location, `None`
    /// if the input now parses cleanly.
    fn locating_run(&mut self) -> Result<Option<usize>, RunError> {
        let outcome = self.run_engine(RunMode::Locating, false, false)?;
        if outcome.matched {
            Ok(None)
        } else {
            Ok(Some(outcome.rightmost_failure.unwrap_or(0)))
        }
    }

    /// Runs the matcher to collect the failed matcher paths at the current
    /// error location and records the resulting error.
    fn reporting_run(&mut self) -> Result<(), RunError> {
        let error_index = self.error_index.ok_or_else(|| {
            RunError::invariant("reporting run without an error location")
        })?;
        let outcome = self.run_engine(RunMode::Reporting { error_index }, false, false)?;
        if outcome.matched {
            return Err(RunError::invariant(
                "reporting run matched input that failed to locate",
            ));
        }
        self.errors
            .push(InvalidInputError::new(error_index, outcome.failed_paths));
        Ok(())
    }

    /// One iteration of the repair loop. Returns `true` when no error
    /// remains to be fixed.
    fn fix_error(&mut self) -> Result<bool, RunError> {
        let Some(fix_index) = self.error_index else {
            return Ok(true);
        };

        if self.try_fix_by_single_char_deletion(fix_index)? {
            return Ok(true);
        }
        let next_after_deletion = self.error_index;

        let best_insertion = match self.find_best_single_char_insertion(fix_index)? {
            InsertionSearch::InputIsErrorFree => return Ok(true),
            InsertionSearch::Best(best) => best,
        };
        let next_after_insertion = self.error_index;

        let best_replacement = match self.find_best_single_char_replacement(fix_index)? {
            InsertionSearch::InputIsErrorFree => return Ok(true),
            InsertionSearch::Best(best) => best,
        };
        let next_after_replacement = self.error_index;

        let best = next_after_deletion
            .max(next_after_insertion)
            .max(next_after_replacement);
        if best > Some(fix_index) {
            // a single character fix gets past the error, commit the best one
            if best == next_after_deletion {
                self.buffer.insert(fix_index, chars::DEL_ERROR);
                self.error_index = next_after_deletion.map(|index| index + 1);
                self.shift_current_error(1)?;
            } else if best == next_after_insertion {
                let c = best_insertion.ok_or_else(|| {
                    RunError::invariant("insertion chosen without a candidate character")
                })?;
                // inserted right to left so the marker ends up in front
                self.buffer.insert(fix_index, c);
                self.buffer.insert(fix_index, chars::INS_ERROR);
                self.error_index = next_after_insertion.map(|index| index + 2);
                self.shift_current_error(2)?;
            } else {
                let c = best_replacement.ok_or_else(|| {
                    RunError::invariant("replacement chosen without a candidate character")
                })?;
                self.buffer.insert(fix_index + 1, c);
                self.buffer.insert(fix_index + 1, chars::INS_ERROR);
                self.buffer.insert(fix_index, chars::DEL_ERROR);
                self.error_index = next_after_replacement.map(|index| index + 5);
                self.shift_current_error(1)?;
            }
        } else {
            // no single character fix helps, resynchronise instead
            if self.buffer.char_at(fix_index) == chars::EOI {
                self.buffer.insert(fix_index, chars::RESYNC_EOI);
                self.shift_current_error(1)?;
                return Ok(true);
            }
            self.buffer.insert(fix_index, chars::RESYNC);
            self.shift_current_error(1)?;
            self.error_index = self.locating_run()?;
        }
        Ok(self.error_index.is_none())
    }

    fn try_fix_by_single_char_deletion(&mut self, fix_index: usize) -> Result<bool, RunError> {
        self.buffer.insert(fix_index, chars::DEL_ERROR);
        let located = self.locating_run()?;
        match located {
            None => {
                // compensate for the inserted marker
                self.shift_current_error(1)?;
                self.error_index = None;
                Ok(true)
            }
            Some(next_error) => {
                self.buffer.undo_insert(fix_index)?;
                self.error_index = Some(next_error.saturating_sub(1));
                Ok(false)
            }
        }
    }

    /// Tries inserting the starter character of every failed matcher of the
    /// current error and keeps the one that carries the parse furthest.
    fn find_best_single_char_insertion(
        &mut self,
        fix_index: usize,
    ) -> Result<InsertionSearch, RunError> {
        let leaves: Vec<_> = match self.errors.last() {
            Some(error) => error
                .failed_matchers
                .iter()
                .map(|path| path.leaf().matcher)
                .collect(),
            None => {
                return Err(RunError::invariant("insertion search without a current error"));
            }
        };

        let mut best_next_error: Option<usize> = None;
        let mut best_char: Option<char> = None;
        for leaf in leaves {
            let Some(starter) = visitors::starter_char(self.grammar, leaf) else {
                return Err(RunError::InvalidGrammar(format!(
                    "matcher '{}' failed at an error location but has no starter character",
                    self.grammar.label(leaf)
                )));
            };
            if starter == chars::EOI {
                // conjuring up the end of the input would be cheating
                continue;
            }
            self.buffer.insert(fix_index, starter);
            self.buffer.insert(fix_index, chars::INS_ERROR);
            match self.locating_run()? {
                None => {
                    // compensate for the two inserted characters
                    self.shift_current_error(2)?;
                    self.error_index = None;
                    return Ok(InsertionSearch::InputIsErrorFree);
                }
                Some(next_error) => {
                    self.buffer.undo_insert(fix_index)?;
                    self.buffer.undo_insert(fix_index)?;
                    let adjusted = Some(next_error.saturating_sub(2));
                    self.error_index = adjusted;
                    if best_next_error < adjusted {
                        best_next_error = adjusted;
                        best_char = Some(starter);
                    }
                }
            }
        }
        self.error_index = best_next_error;
        Ok(InsertionSearch::Best(best_char))
    }

    /// A replacement is a deletion followed by an insertion behind the
    /// deleted character.
    fn find_best_single_char_replacement(
        &mut self,
        fix_index: usize,
    ) -> Result<InsertionSearch, RunError> {
        self.buffer.insert(fix_index, chars::DEL_ERROR);
        match self.find_best_single_char_insertion(fix_index + 2)? {
            InsertionSearch::InputIsErrorFree => {
                // the insertion search shifted by two, the deletion marker
                // nets the replacement delta to one
                self.shift_current_error(-1)?;
                Ok(InsertionSearch::InputIsErrorFree)
            }
            InsertionSearch::Best(best) => {
                self.buffer.undo_insert(fix_index)?;
                self.error_index = self.error_index.map(|index| index.saturating_sub(3));
                Ok(InsertionSearch::Best(best))
            }
        }
    }

    fn shift_current_error(&mut self, delta: isize) -> Result<(), RunError> {
        match self.errors.last_mut() {
            Some(error) => {
                error.shift_index_delta_by(delta);
                Ok(())
            }
            None => Err(RunError::invariant("index shift without a current error")),
        }
    }
}
