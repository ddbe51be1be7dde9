//! The matcher engine: activation frames, matcher interpretation and the
//! recovery handler.
//!
//! One [`Engine`] value performs one run of the root matcher over the current
//! buffer. The engine never knows *why* it is run; the runners configure a
//! handler mode (direct or recovering) and an observation mode (plain, error
//! locating, error reporting) and read the outcome. Repairs reach the engine
//! purely through the marker characters in the buffer, which only the
//! recovery handler interprets.

use std::time::{Duration, Instant};

use crate::buffer::{InputBuffer, PatchBuffer};
use crate::chars;
use crate::error::{InvalidInputError, MatcherPath, MatcherPathElement, RunError};
use crate::events::{MatchEvent, ParseListener, ParsePhase};
use crate::grammar::{ActionContext, ActionFn, Grammar, MatcherId, MatcherKind};
use crate::result::ParseNode;
use crate::stack::ValueStack;
use crate::visitors;

/// How matcher invocations are handled.
pub(crate) enum HandlerMode {
    /// Matchers are interpreted directly.
    Direct,
    /// Marker characters are interpreted and failed sequences may
    /// resynchronise.
    Recovery,
}

/// What the run observes on top of matching.
pub(crate) enum RunMode {
    Plain,
    /// Record the rightmost index at which a match attempt failed.
    Locating,
    /// Record the paths of single character matchers failing at the given
    /// index.
    Reporting { error_index: usize },
}

pub(crate) struct RunConfig {
    pub(crate) handler: HandlerMode,
    pub(crate) mode: RunMode,
    pub(crate) build_tree: bool,
    pub(crate) notify_listeners: bool,
    pub(crate) timeout: Option<Duration>,
    pub(crate) started: Instant,
}

/// Activation record of one matcher invocation. The frame stack is the
/// matcher context chain; the parent of a frame is the frame below it.
struct Frame {
    matcher: MatcherId,
    start: usize,
    current: usize,
    has_error: bool,
    child_index: usize,
    in_error_recovery: bool,
    nodes: Vec<ParseNode>,
}

pub(crate) struct EngineOutcome<V> {
    pub(crate) matched: bool,
    pub(crate) tree: Option<ParseNode>,
    pub(crate) stack: ValueStack<V>,
    pub(crate) rightmost_failure: Option<usize>,
    pub(crate) failed_paths: Vec<MatcherPath>,
}

pub(crate) struct Engine<'a, V> {
    grammar: &'a Grammar<V>,
    buffer: &'a mut PatchBuffer,
    errors: &'a mut Vec<InvalidInputError>,
    listeners: &'a mut Vec<Box<dyn ParseListener<V>>>,
    config: RunConfig,
    stack: ValueStack<V>,
    frames: Vec<Frame>,
    root_node: Option<ParseNode>,
    suppress_nodes: usize,
    fringe_index: usize,
    last_match_path: Option<MatcherPath>,
    rightmost_failure: Option<usize>,
    seeking: bool,
    failed_paths: Vec<MatcherPath>,
    fatal: Option<RunError>,
}

impl<'a, V> Engine<'a, V> {
    pub(crate) fn new(
        grammar: &'a Grammar<V>,
        buffer: &'a mut PatchBuffer,
        errors: &'a mut Vec<InvalidInputError>,
        listeners: &'a mut Vec<Box<dyn ParseListener<V>>>,
        config: RunConfig,
    ) -> Self {
        let seeking = matches!(config.mode, RunMode::Reporting { error_index } if error_index > 0);
        Self {
            grammar,
            buffer,
            errors,
            listeners,
            config,
            stack: ValueStack::new(),
            frames: Vec::new(),
            root_node: None,
            suppress_nodes: 0,
            fringe_index: 0,
            last_match_path: None,
            rightmost_failure: None,
            seeking,
            failed_paths: Vec::new(),
            fatal: None,
        }
    }

    pub(crate) fn run(mut self) -> Result<EngineOutcome<V>, RunError> {
        if self.config.notify_listeners {
            self.notify_pre_parse();
        }
        let matched = if self.fatal.is_none() {
            self.run_matcher(self.grammar.root())
        } else {
            false
        };
        if self.config.notify_listeners && self.fatal.is_none() {
            self.notify_post_parse(matched);
        }
        if let Some(fatal) = self.fatal.take() {
            return Err(fatal);
        }
        Ok(EngineOutcome {
            matched,
            tree: self.root_node.take(),
            stack: self.stack,
            rightmost_failure: self.rightmost_failure,
            failed_paths: self.failed_paths,
        })
    }

    /// Runs a matcher as a child of the current frame, consulting the
    /// configured handler.
    fn run_matcher(&mut self, matcher: MatcherId) -> bool {
        if self.fatal.is_some() {
            return false;
        }
        let (start, in_error_recovery) = match self.frames.last() {
            Some(parent) => (parent.current, parent.in_error_recovery),
            None => (0, false),
        };
        self.frames.push(Frame {
            matcher,
            start,
            current: start,
            has_error: false,
            child_index: 0,
            in_error_recovery,
            nodes: Vec::new(),
        });
        if self.config.notify_listeners {
            self.notify_match_event(ParsePhase::PreMatch);
        }
        let mut matched = if self.fatal.is_none() {
            match self.config.handler {
                HandlerMode::Direct => self.interpret(),
                HandlerMode::Recovery => self.recovery_match(),
            }
        } else {
            false
        };
        if self.fatal.is_some() {
            matched = false;
        }
        self.observe(matched);
        if self.config.notify_listeners && self.fatal.is_none() {
            self.notify_match_event(if matched {
                ParsePhase::MatchSuccess
            } else {
                ParsePhase::MatchFailure
            });
        }
        let frame = self.frames.pop().unwrap();
        if matched {
            let end_index = frame.current;
            let node = self.make_node(frame.matcher).then(|| ParseNode {
                matcher: frame.matcher,
                start_index: frame.start,
                end_index,
                has_error: frame.has_error,
                children: frame.nodes,
            });
            match self.frames.last_mut() {
                Some(parent) => {
                    parent.current = end_index;
                    if let Some(node) = node {
                        parent.nodes.push(node);
                    }
                }
                None => self.root_node = node,
            }
        }
        matched
    }

    fn make_node(&self, matcher: MatcherId) -> bool {
        self.config.build_tree
            && self.suppress_nodes == 0
            && !matches!(
                self.grammar.kind(matcher),
                MatcherKind::Action(_) | MatcherKind::Test(_) | MatcherKind::TestNot(_)
            )
    }

    fn observe(&mut self, matched: bool) {
        let frame = self.frames.last().unwrap();
        let (matcher, current) = (frame.matcher, frame.current);
        match self.config.mode {
            RunMode::Plain => {}
            RunMode::Locating => {
                if !matched && self.rightmost_failure.map_or(true, |index| index < current) {
                    self.rightmost_failure = Some(current);
                }
            }
            RunMode::Reporting { error_index } => {
                if !matched
                    && !self.seeking
                    && current == error_index
                    && visitors::is_single_char(self.grammar, matcher)
                {
                    let path = self.current_path();
                    if !self.failed_paths.contains(&path) {
                        self.failed_paths.push(path);
                    }
                }
                if matched && self.seeking && error_index <= current {
                    self.seeking = false;
                }
            }
        }
    }

    /// Interprets the matcher of the current frame directly.
    fn interpret(&mut self) -> bool {
        let grammar = self.grammar;
        let matcher = self.frames.last().unwrap().matcher;
        match grammar.kind(matcher) {
            MatcherKind::Char(c) => {
                let c = *c;
                self.match_char(|x| x == c)
            }
            MatcherKind::CharIgnoreCase { lower, upper } => {
                let (lower, upper) = (*lower, *upper);
                self.match_char(|x| x == lower || x == upper)
            }
            MatcherKind::CharRange { low, high } => {
                let (low, high) = (*low, *high);
                self.match_char(|x| (low..=high).contains(&x))
            }
            MatcherKind::AnyOf(set) => self.match_char(|x| set.contains(&x)),
            MatcherKind::Any => self.match_char(|x| x != chars::EOI),
            MatcherKind::Empty => true,
            MatcherKind::Nothing => false,
            MatcherKind::Sequence(children) => self.match_sequence(children),
            MatcherKind::FirstOf(children) => {
                for &child in children {
                    if self.run_matcher(child) {
                        return true;
                    }
                }
                false
            }
            MatcherKind::Optional(sub) => {
                self.run_matcher(*sub);
                self.fatal.is_none()
            }
            MatcherKind::ZeroOrMore(sub) => self.match_repetition(*sub, false),
            MatcherKind::OneOrMore(sub) => self.match_repetition(*sub, true),
            MatcherKind::Test(sub) => self.match_predicate(*sub, true),
            MatcherKind::TestNot(sub) => self.match_predicate(*sub, false),
            MatcherKind::Action(action) => {
                let action = action.clone();
                self.match_action(action)
            }
            MatcherKind::Link(_) => unreachable!("links are resolved at build time"),
        }
    }

    fn match_char(&mut self, accepts: impl Fn(char) -> bool) -> bool {
        if accepts(self.current_char()) {
            self.advance(1);
            true
        } else {
            false
        }
    }

    fn match_sequence(&mut self, children: &[MatcherId]) -> bool {
        let snapshot = self.stack.snapshot();
        for (index, &child) in children.iter().enumerate() {
            // the index is read back when computing follow sets
            self.frames.last_mut().unwrap().child_index = index;
            if !self.run_matcher(child) {
                self.stack.restore(snapshot);
                return false;
            }
        }
        true
    }

    fn match_repetition(&mut self, sub: MatcherId, require_one: bool) -> bool {
        if require_one && !self.run_matcher(sub) {
            return false;
        }
        let mut last_index = self.frames.last().unwrap().current;
        while self.run_matcher(sub) {
            let current = self.frames.last().unwrap().current;
            if current == last_index {
                self.fail(RunError::InvalidGrammar(format!(
                    "the inner rule '{}' of a repetition must not match empty input",
                    self.grammar.label(sub)
                )));
                return false;
            }
            last_index = current;
        }
        self.fatal.is_none()
    }

    fn match_predicate(&mut self, sub: MatcherId, positive: bool) -> bool {
        let saved_index = self.frames.last().unwrap().current;
        let snapshot = self.stack.snapshot();
        self.suppress_nodes += 1;
        let matched = self.run_matcher(sub);
        self.suppress_nodes -= 1;
        self.frames.last_mut().unwrap().current = saved_index;
        self.stack.restore(snapshot);
        if self.fatal.is_some() {
            return false;
        }
        if positive {
            matched
        } else {
            !matched
        }
    }

    fn match_action(&mut self, action: ActionFn<V>) -> bool {
        let depth = self.frames.len();
        // actions see the match of their enclosing rule so far
        let (start_index, current_index) = if depth >= 2 {
            (self.frames[depth - 2].start, self.frames[depth - 1].start)
        } else {
            let own = &self.frames[depth - 1];
            (own.start, own.current)
        };
        let in_error_recovery = self.frames[depth - 1].in_error_recovery;
        let stack = &mut self.stack;
        let buffer: &dyn InputBuffer = &*self.buffer;
        let mut ctx = ActionContext {
            stack,
            buffer,
            start_index,
            current_index,
            in_error_recovery,
        };
        action(&mut ctx)
    }

    /// The recovering match handler. Interprets marker characters in front of
    /// single character matchers and resynchronises qualifying failed
    /// sequences.
    fn recovery_match(&mut self) -> bool {
        let matcher = self.frames.last().unwrap().matcher;
        if visitors::is_single_char(self.grammar, matcher) {
            if self.prepare_error_location(matcher) && self.interpret() {
                let current = self.frames.last().unwrap().current;
                if self.fringe_index < current {
                    self.fringe_index = current;
                    self.last_match_path = Some(self.current_path());
                }
                return true;
            }
            return false;
        }

        if self.interpret() {
            return true;
        }
        if self.fatal.is_some() {
            return false;
        }

        if matches!(self.grammar.kind(matcher), MatcherKind::Sequence(_)) {
            match self.current_char() {
                chars::RESYNC | chars::RESYNC_START | chars::RESYNC_EOI => {
                    return self.qualifies_for_resync() && self.resynchronize();
                }
                _ => {}
            }
            // checked only on sequence failures to keep the hot path lean
            if let Some(timeout) = self.config.timeout {
                if self.config.started.elapsed() > timeout {
                    self.fail(RunError::Timeout { timeout });
                }
            }
        }
        false
    }

    /// Decides how a single character matcher faces the current character.
    ///
    /// At a deletion or insertion marker the cursor is moved past the marker
    /// (and past the deleted character) when the matcher would succeed there;
    /// at a resync marker single character matchers always fail.
    fn prepare_error_location(&mut self, matcher: MatcherId) -> bool {
        match self.current_char() {
            chars::DEL_ERROR => self.will_match_del_error(matcher),
            chars::INS_ERROR => self.will_match_ins_error(matcher),
            chars::RESYNC | chars::RESYNC_START | chars::RESYNC_EOI => false,
            _ => true,
        }
    }

    fn will_match_del_error(&mut self, matcher: MatcherId) -> bool {
        let pre_skip = self.frames.last().unwrap().current;
        self.advance(2); // the marker and the deleted character
        if !self.run_test_match(matcher) {
            self.frames.last_mut().unwrap().current = pre_skip;
            return false;
        }
        let frame = self.frames.last_mut().unwrap();
        frame.start = frame.current;
        self.mark_parent_error();
        true
    }

    fn will_match_ins_error(&mut self, matcher: MatcherId) -> bool {
        let pre_skip = self.frames.last().unwrap().current;
        self.advance(1); // the marker
        if !self.run_test_match(matcher) {
            self.frames.last_mut().unwrap().current = pre_skip;
            return false;
        }
        let frame = self.frames.last_mut().unwrap();
        frame.start = frame.current;
        self.mark_error();
        true
    }

    /// Skips any further markers and checks whether the matcher would succeed
    /// at the resulting position, without consuming it.
    fn run_test_match(&mut self, matcher: MatcherId) -> bool {
        if !self.prepare_error_location(matcher) {
            return false;
        }
        let saved = self.frames.last().unwrap().current;
        let matched = self.interpret();
        if matched {
            self.frames.last_mut().unwrap().current = saved;
        }
        matched
    }

    fn qualifies_for_resync(&self) -> bool {
        let frame = self.frames.last().unwrap();
        let path_is_prefix = match &self.last_match_path {
            Some(last) => self.current_path().is_prefix_of(last),
            None => false,
        };
        if frame.current == frame.start || !path_is_prefix {
            // only the outermost failing sequence may resynchronise here
            let len = self.frames.len();
            for ancestor in &self.frames[..len - 1] {
                if matches!(self.grammar.kind(ancestor.matcher), MatcherKind::Sequence(_)) {
                    return false;
                }
            }
        }
        true
    }

    /// Turns the failed sequence of the current frame into a match by
    /// replaying its actions and skipping input up to a legal follow
    /// character.
    fn resynchronize(&mut self) -> bool {
        self.mark_error();
        self.rerun_and_execute_error_actions();
        if self.fatal.is_some() {
            return false;
        }
        match self.current_char() {
            chars::RESYNC => {
                // first encounter: measure the illegal range and fence it in
                self.advance(1);
                let len = self.frames.len();
                let ancestors: Vec<(MatcherId, usize)> = self.frames[..len - 1]
                    .iter()
                    .rev()
                    .map(|frame| (frame.matcher, frame.child_index))
                    .collect();
                let follow = visitors::follow_matchers(self.grammar, &ancestors);
                let end_index = self.gobble_illegal_characters(&follow);
                let marker_index = match self.errors.last_mut() {
                    Some(error) => {
                        error.set_end_index(end_index);
                        error.start_index().checked_sub(1)
                    }
                    None => None,
                };
                let Some(marker_index) = marker_index else {
                    self.fail(RunError::invariant(
                        "resynchronisation without a current error",
                    ));
                    return false;
                };
                if let Err(error) = self.buffer.replace_inserted(marker_index, chars::RESYNC_START)
                {
                    self.fail(error);
                    return false;
                }
                self.buffer.insert(end_index, chars::RESYNC_END);
                self.advance(1); // past the end marker
            }
            chars::RESYNC_START => {
                // a range measured on an earlier pass
                self.advance(1);
                loop {
                    match self.current_char() {
                        chars::RESYNC_END => break,
                        chars::EOI => {
                            self.fail(RunError::invariant(
                                "resynchronisation range without an end marker",
                            ));
                            return false;
                        }
                        _ => self.advance(1),
                    }
                }
                self.advance(1); // past the end marker
            }
            chars::RESYNC_EOI => {}
            _ => {
                self.fail(RunError::invariant(
                    "resynchronisation outside a resync marker",
                ));
                return false;
            }
        }
        true
    }

    /// Reruns the children of the failed sequence, replacing the failing one
    /// with an empty match and executing the minimal action set of everything
    /// after it, so the value stack ends up as if the sequence had matched.
    fn rerun_and_execute_error_actions(&mut self) {
        let saved_index = self.frames.last().unwrap().current;
        {
            let frame = self.frames.last_mut().unwrap();
            frame.current = frame.start;
        }
        let matcher = self.frames.last().unwrap().matcher;
        let children: Vec<MatcherId> = match self.grammar.kind(matcher) {
            MatcherKind::Sequence(children) => children.clone(),
            _ => {
                self.fail(RunError::invariant("resynchronisation of a non-sequence"));
                return;
            }
        };
        // the original children already contributed their nodes
        self.suppress_nodes += 1;
        let mut pre_error = true;
        for child in children {
            if self.fatal.is_some() {
                break;
            }
            if pre_error && !self.run_matcher(child) {
                self.run_matcher(self.grammar.empty_matcher());
                self.frames.last_mut().unwrap().child_index = 1;
                pre_error = false;
            }
            if !pre_error {
                self.frames.last_mut().unwrap().in_error_recovery = true;
                match visitors::collect_resync_actions(self.grammar, child) {
                    Some(actions) => {
                        for action in actions {
                            // executed for their stack effect, results ignored
                            self.run_matcher(action);
                        }
                    }
                    None => self.fail(RunError::invariant(
                        "no consistent action replay under a resynchronised sequence",
                    )),
                }
                self.frames.last_mut().unwrap().in_error_recovery = false;
            }
        }
        self.suppress_nodes -= 1;
        self.frames.last_mut().unwrap().current = saved_index;
    }

    fn gobble_illegal_characters(&mut self, follow: &[MatcherId]) -> usize {
        loop {
            let c = self.current_char();
            if c == chars::EOI {
                break;
            }
            if follow
                .iter()
                .any(|&matcher| visitors::is_starter_char(self.grammar, matcher, c))
            {
                break;
            }
            self.advance(1);
        }
        self.frames.last().unwrap().current
    }

    fn current_char(&self) -> char {
        self.buffer.char_at(self.frames.last().unwrap().current)
    }

    fn advance(&mut self, n: usize) {
        self.frames.last_mut().unwrap().current += n;
    }

    fn current_path(&self) -> MatcherPath {
        MatcherPath::new(
            self.frames
                .iter()
                .map(|frame| MatcherPathElement {
                    matcher: frame.matcher,
                    start_index: frame.start,
                })
                .collect(),
        )
    }

    /// Marks the current frame and all its ancestors as erroneous.
    fn mark_error(&mut self) {
        for frame in self.frames.iter_mut() {
            frame.has_error = true;
        }
    }

    /// Marks the parent frame and all its ancestors as erroneous.
    fn mark_parent_error(&mut self) {
        let len = self.frames.len();
        if len >= 2 {
            for frame in &mut self.frames[..len - 1] {
                frame.has_error = true;
            }
        }
    }

    fn fail(&mut self, error: RunError) {
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
    }

    fn notify_pre_parse(&mut self) {
        let buffer: &dyn InputBuffer = &*self.buffer;
        for listener in self.listeners.iter_mut() {
            if let Err(source) = listener.pre_parse(buffer) {
                self.fatal = Some(RunError::Listener {
                    phase: ParsePhase::PreParse,
                    source,
                });
                return;
            }
        }
    }

    fn notify_post_parse(&mut self, matched: bool) {
        let buffer: &dyn InputBuffer = &*self.buffer;
        for listener in self.listeners.iter_mut() {
            if let Err(source) = listener.post_parse(matched, buffer) {
                self.fatal = Some(RunError::Listener {
                    phase: ParsePhase::PostParse,
                    source,
                });
                return;
            }
        }
    }

    fn notify_match_event(&mut self, phase: ParsePhase) {
        let grammar = self.grammar;
        let (matcher, start_index, current_index) = {
            let frame = self.frames.last().unwrap();
            (frame.matcher, frame.start, frame.current)
        };
        let event = MatchEvent {
            matcher,
            label: grammar.label(matcher),
            start_index,
            current_index,
            depth: self.frames.len() - 1,
        };
        for listener in self.listeners.iter_mut() {
            let result = match phase {
                ParsePhase::PreMatch => listener.pre_match(&event),
                ParsePhase::MatchSuccess => listener.match_success(&event),
                ParsePhase::MatchFailure => listener.match_failure(&event),
                ParsePhase::PreParse | ParsePhase::PostParse => Ok(()),
            };
            if let Err(source) = result {
                self.fatal = Some(RunError::Listener { phase, source });
                return;
            }
        }
    }
}
