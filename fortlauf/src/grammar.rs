//! The matcher model: grammar arena, matcher kinds and the grammar builder.
//!
//! A grammar is an arena of matcher nodes referenced by [`MatcherId`] handles.
//! Recursion is expressed through deferred rules: [`GrammarBuilder::rule`]
//! hands out the id of a named rule before its body exists, and
//! [`GrammarBuilder::define`] fills it in later. [`GrammarBuilder::build`]
//! validates the arena and resolves all rule references, so the finished
//! [`Grammar`] is immutable and can be shared between parses.

use std::rc::Rc;

use zwohash::HashMap;

use crate::buffer::InputBuffer;
use crate::error::RunError;
use crate::stack::ValueStack;

/// Handle of a matcher node inside a [`Grammar`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct MatcherId(u32);

impl MatcherId {
    #[inline]
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Context handed to action matchers.
///
/// Actions are the only matchers with access to the value stack. They see the
/// input matched so far by their enclosing rule and whether they are being
/// replayed as part of error recovery, in which case they should avoid
/// decisions based on matched text (the match they belong to never happened).
pub struct ActionContext<'a, V> {
    pub(crate) stack: &'a mut ValueStack<V>,
    pub(crate) buffer: &'a dyn InputBuffer,
    pub(crate) start_index: usize,
    pub(crate) current_index: usize,
    pub(crate) in_error_recovery: bool,
}

impl<'a, V> ActionContext<'a, V> {
    /// The value stack of the running parse.
    pub fn stack(&mut self) -> &mut ValueStack<V> {
        self.stack
    }

    /// Text matched so far by the rule the action is part of.
    pub fn matched_text(&self) -> String {
        self.buffer.extract(self.start_index, self.current_index)
    }

    /// Logical index the action runs at.
    pub fn current_index(&self) -> usize {
        self.current_index
    }

    /// Whether the action is replayed under a resynchronised rule.
    pub fn in_error_recovery(&self) -> bool {
        self.in_error_recovery
    }
}

pub(crate) type ActionFn<V> = Rc<dyn Fn(&mut ActionContext<'_, V>) -> bool>;

/// The matcher variants the engine interprets.
pub(crate) enum MatcherKind<V> {
    Char(char),
    CharIgnoreCase { lower: char, upper: char },
    CharRange { low: char, high: char },
    AnyOf(Vec<char>),
    Any,
    Empty,
    Nothing,
    Sequence(Vec<MatcherId>),
    FirstOf(Vec<MatcherId>),
    Optional(MatcherId),
    ZeroOrMore(MatcherId),
    OneOrMore(MatcherId),
    Test(MatcherId),
    TestNot(MatcherId),
    Action(ActionFn<V>),
    /// Reference to another node, produced by rule definition and resolved
    /// away by [`GrammarBuilder::build`]. Never observed by the engine.
    Link(MatcherId),
}

pub(crate) struct Matcher<V> {
    pub(crate) label: String,
    pub(crate) kind: MatcherKind<V>,
}

/// An immutable matcher tree, ready to be run against input.
pub struct Grammar<V> {
    nodes: Vec<Matcher<V>>,
    root: MatcherId,
    empty: MatcherId,
}

impl<V> std::fmt::Debug for Grammar<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Grammar")
            .field("matchers", &self.nodes.len())
            .field("root", &self.root)
            .finish()
    }
}

impl<V> Grammar<V> {
    /// The root matcher the runners start from.
    pub fn root(&self) -> MatcherId {
        self.root
    }

    /// The label of a matcher, either assigned or derived from its shape.
    pub fn label(&self, id: MatcherId) -> &str {
        &self.nodes[id.index()].label
    }

    #[inline]
    pub(crate) fn kind(&self, id: MatcherId) -> &MatcherKind<V> {
        &self.nodes[id.index()].kind
    }

    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// A shared trivially succeeding matcher, used as the stand-in for the
    /// failed element of a resynchronised sequence.
    pub(crate) fn empty_matcher(&self) -> MatcherId {
        self.empty
    }
}

/// Builder assembling a [`Grammar`].
pub struct GrammarBuilder<V> {
    nodes: Vec<(String, Option<MatcherKind<V>>)>,
    rules: HashMap<String, MatcherId>,
}

impl<V> Default for GrammarBuilder<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> GrammarBuilder<V> {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            rules: HashMap::default(),
        }
    }

    fn add(&mut self, label: String, kind: MatcherKind<V>) -> MatcherId {
        let id = MatcherId(self.nodes.len() as u32);
        self.nodes.push((label, Some(kind)));
        id
    }

    /// Matches the single character `c`.
    pub fn ch(&mut self, c: char) -> MatcherId {
        self.add(format!("'{}'", c.escape_default()), MatcherKind::Char(c))
    }

    /// Matches `c` case insensitively.
    pub fn ch_ignore_case(&mut self, c: char) -> MatcherId {
        let lower = c.to_lowercase().next().unwrap_or(c);
        let upper = c.to_uppercase().next().unwrap_or(c);
        self.add(
            format!("'{}/{}'", lower.escape_default(), upper.escape_default()),
            MatcherKind::CharIgnoreCase { lower, upper },
        )
    }

    /// Matches any character in the inclusive range `low..=high`.
    pub fn ch_range(&mut self, low: char, high: char) -> MatcherId {
        self.add(
            format!("'{}'..'{}'", low.escape_default(), high.escape_default()),
            MatcherKind::CharRange { low, high },
        )
    }

    /// Matches any of the characters of `set`.
    pub fn any_of(&mut self, set: &str) -> MatcherId {
        self.add(
            format!("[{}]", set.escape_default()),
            MatcherKind::AnyOf(set.chars().collect()),
        )
    }

    /// Matches any character except end of input.
    pub fn any(&mut self) -> MatcherId {
        self.add("ANY".into(), MatcherKind::Any)
    }

    /// Matches the end of the input.
    pub fn eoi(&mut self) -> MatcherId {
        self.add("EOI".into(), MatcherKind::Char(crate::chars::EOI))
    }

    /// Always succeeds without consuming input.
    pub fn empty(&mut self) -> MatcherId {
        self.add("EMPTY".into(), MatcherKind::Empty)
    }

    /// Never succeeds.
    pub fn nothing(&mut self) -> MatcherId {
        self.add("NOTHING".into(), MatcherKind::Nothing)
    }

    /// Matches the characters of `text` in order.
    ///
    /// Built as a sequence of single character matchers, so recovery treats
    /// string terminals exactly like spelled-out sequences.
    pub fn string(&mut self, text: &str) -> MatcherId {
        let children: Vec<_> = text.chars().map(|c| self.ch(c)).collect();
        self.add(
            format!("\"{}\"", text.escape_default()),
            MatcherKind::Sequence(children),
        )
    }

    /// Matches the characters of `text` in order, case insensitively.
    pub fn string_ignore_case(&mut self, text: &str) -> MatcherId {
        let children: Vec<_> = text.chars().map(|c| self.ch_ignore_case(c)).collect();
        self.add(
            format!("\"{}\"", text.escape_default()),
            MatcherKind::Sequence(children),
        )
    }

    /// Matches all of `children` in order.
    pub fn seq(&mut self, children: impl IntoIterator<Item = MatcherId>) -> MatcherId {
        self.add(
            "Sequence".into(),
            MatcherKind::Sequence(children.into_iter().collect()),
        )
    }

    /// Matches the first of `children` that succeeds, in order.
    pub fn first_of(&mut self, children: impl IntoIterator<Item = MatcherId>) -> MatcherId {
        self.add(
            "FirstOf".into(),
            MatcherKind::FirstOf(children.into_iter().collect()),
        )
    }

    /// Matches `sub` if possible, succeeding either way.
    pub fn optional(&mut self, sub: MatcherId) -> MatcherId {
        self.add("Optional".into(), MatcherKind::Optional(sub))
    }

    /// Matches `sub` as often as possible, requiring no match.
    pub fn zero_or_more(&mut self, sub: MatcherId) -> MatcherId {
        self.add("ZeroOrMore".into(), MatcherKind::ZeroOrMore(sub))
    }

    /// Matches `sub` as often as possible, requiring at least one match.
    pub fn one_or_more(&mut self, sub: MatcherId) -> MatcherId {
        self.add("OneOrMore".into(), MatcherKind::OneOrMore(sub))
    }

    /// Succeeds iff `sub` matches, consuming nothing.
    pub fn test(&mut self, sub: MatcherId) -> MatcherId {
        self.add("Test".into(), MatcherKind::Test(sub))
    }

    /// Succeeds iff `sub` does not match, consuming nothing.
    pub fn test_not(&mut self, sub: MatcherId) -> MatcherId {
        self.add("TestNot".into(), MatcherKind::TestNot(sub))
    }

    /// Runs `action` against the value stack when reached; the match fails if
    /// the action returns `false`.
    pub fn action(
        &mut self,
        action: impl Fn(&mut ActionContext<'_, V>) -> bool + 'static,
    ) -> MatcherId {
        self.add("Action".into(), MatcherKind::Action(Rc::new(action)))
    }

    /// Returns the id of the named rule, declaring it if necessary.
    ///
    /// The body is supplied later with [`define`](Self::define), which makes
    /// recursive grammars expressible.
    pub fn rule(&mut self, name: &str) -> MatcherId {
        if let Some(&id) = self.rules.get(name) {
            return id;
        }
        let id = MatcherId(self.nodes.len() as u32);
        self.nodes.push((name.to_owned(), None));
        self.rules.insert(name.to_owned(), id);
        id
    }

    /// Defines the body of a previously declared rule.
    pub fn define(&mut self, rule: MatcherId, body: MatcherId) -> Result<(), RunError> {
        let slot = &mut self.nodes[rule.index()];
        if slot.1.is_some() {
            return Err(RunError::InvalidGrammar(format!(
                "rule '{}' is defined twice",
                slot.0
            )));
        }
        slot.1 = Some(MatcherKind::Link(body));
        Ok(())
    }

    /// Overrides the label of a matcher.
    pub fn label(&mut self, id: MatcherId, label: impl Into<String>) {
        self.nodes[id.index()].0 = label.into();
    }

    /// Validates the arena and produces an immutable grammar rooted at `root`.
    ///
    /// Fails if a declared rule was never defined or a rule is defined only in
    /// terms of itself.
    pub fn build(mut self, root: MatcherId) -> Result<Grammar<V>, RunError> {
        for (label, kind) in &self.nodes {
            if kind.is_none() {
                return Err(RunError::InvalidGrammar(format!(
                    "rule '{label}' was declared but never defined"
                )));
            }
        }

        let resolve = |nodes: &[(String, Option<MatcherKind<V>>)],
                       mut id: MatcherId|
         -> Result<MatcherId, RunError> {
            let mut steps = 0;
            while let Some(MatcherKind::Link(target)) = &nodes[id.index()].1 {
                id = *target;
                steps += 1;
                if steps > nodes.len() {
                    return Err(RunError::InvalidGrammar(format!(
                        "rule '{}' is defined as itself",
                        nodes[id.index()].0
                    )));
                }
            }
            Ok(id)
        };

        let root = resolve(&self.nodes, root)?;
        let mut resolved_children = Vec::new();
        for index in 0..self.nodes.len() {
            let child_ids: Vec<MatcherId> = match self.nodes[index].1.as_ref().unwrap() {
                MatcherKind::Sequence(children) | MatcherKind::FirstOf(children) => {
                    children.clone()
                }
                MatcherKind::Optional(sub)
                | MatcherKind::ZeroOrMore(sub)
                | MatcherKind::OneOrMore(sub)
                | MatcherKind::Test(sub)
                | MatcherKind::TestNot(sub) => vec![*sub],
                _ => continue,
            };
            resolved_children.clear();
            for child in child_ids {
                resolved_children.push(resolve(&self.nodes, child)?);
            }
            match self.nodes[index].1.as_mut().unwrap() {
                MatcherKind::Sequence(children) | MatcherKind::FirstOf(children) => {
                    children.clone_from(&resolved_children);
                }
                MatcherKind::Optional(sub)
                | MatcherKind::ZeroOrMore(sub)
                | MatcherKind::OneOrMore(sub)
                | MatcherKind::Test(sub)
                | MatcherKind::TestNot(sub) => *sub = resolved_children[0],
                _ => unreachable!(),
            }
        }

        let empty = MatcherId(self.nodes.len() as u32);
        self.nodes.push(("EMPTY".into(), Some(MatcherKind::Empty)));

        let nodes = self
            .nodes
            .into_iter()
            .map(|(label, kind)| Matcher {
                label,
                kind: kind.unwrap(),
            })
            .collect();

        Ok(Grammar { nodes, root, empty })
    }
}
