//! Fortlauf is a runtime for parsing expression grammars whose parses always
//! run to completion: malformed input does not abort the parse, it is
//! repaired on the fly and every error is reported in a single pass.
//!
//! The crate provides a recursive-descent matcher engine interpreting a tree
//! of matchers, plus two runners driving it:
//!
//! * [`BasicRunner`] performs one ordinary run. If the input conforms to the
//!   grammar it produces a parse tree and the value stack built by the
//!   grammar's actions; otherwise it reports `matched == false` and nothing
//!   else.
//!
//! * [`RecoveringRunner`] never fails on malformed input. After a failing
//!   baseline run it locates the first error, determines the matchers that
//!   failed there, and speculatively edits the input: it tries deleting the
//!   offending character, inserting each candidate character the failed
//!   matchers could start with, and replacing the offending character,
//!   keeping whichever single character edit carries the next parse attempt
//!   furthest. If none helps, it resynchronises: it skips input until a
//!   character that may legally follow the failing rule and resumes there.
//!   This repeats until a full parse succeeds, so the result always has
//!   `matched == true` together with one [`InvalidInputError`] per repair.
//!
//! Edits never touch the original text. They are expressed as reserved marker
//! characters (see [`chars`]) spliced into the logical index space of a
//! [`PatchBuffer`], and the engine stays oblivious to recovery except for the
//! single handler hook that interprets those markers. Reported error
//! positions project back onto the original text through
//! [`InputBuffer::original_index`], and extraction never yields marker
//! characters.
//!
//! Grammars are assembled with a [`GrammarBuilder`]: character terminals,
//! sequences, ordered choices, repetitions, option, syntactic predicates and
//! action matchers operating on a [`ValueStack`]. Recursive rules are
//! declared with [`GrammarBuilder::rule`] and defined later. The finished
//! [`Grammar`] is immutable and may be shared; each parse owns its buffer,
//! frame stack and value stack, so separate parses can run on separate
//! threads.
//!
//! ```rust
//! use fortlauf::{chars, GrammarBuilder, RecoveringRunner};
//!
//! let mut g = GrammarBuilder::<()>::new();
//! let a = g.ch('a');
//! let b = g.ch('b');
//! let c = g.ch('c');
//! let eoi = g.eoi();
//! let root = g.seq([a, b, c, eoi]);
//! let grammar = g.build(root).unwrap();
//!
//! let mut runner = RecoveringRunner::new(&grammar);
//! let result = runner.run_str("ac").unwrap();
//! assert!(result.matched);
//! assert_eq!(result.errors.len(), 1);
//! // the missing 'b' was repaired at original index 1
//! use fortlauf::InputBuffer;
//! assert_eq!(result.buffer.original_index(result.errors[0].start_index()), 1);
//! ```

#![warn(missing_docs)]

pub mod chars;

mod buffer;
mod engine;
mod error;
mod events;
mod grammar;
mod result;
mod run;
mod stack;
mod visitors;

#[cfg(test)]
mod tests;

pub use buffer::{IndexRange, InputBuffer, PatchBuffer, Position, TextBuffer};
pub use error::{InvalidInputError, MatcherPath, MatcherPathElement, RunError};
pub use events::{ListenerResult, MatchEvent, ParseListener, ParsePhase};
pub use grammar::{ActionContext, Grammar, GrammarBuilder, MatcherId};
pub use result::{ParseNode, ParseResult};
pub use run::{BasicRunner, RecoveringRunner};
pub use stack::ValueStack;
