//! Structural queries over the matcher tree used by the recovery machinery.
//!
//! All of these are pure: they read the grammar arena and never mutate it.
//! Grammars may be recursive, so every traversal that can revisit a node
//! carries a guard and answers conservatively on a cycle.

use crate::chars;
use crate::grammar::{Grammar, MatcherId, MatcherKind};

/// Whether the matcher consumes exactly one character when it matches.
/// Predicates answer for their inner matcher.
pub(crate) fn is_single_char<V>(grammar: &Grammar<V>, id: MatcherId) -> bool {
    let mut id = id;
    let mut steps = 0;
    loop {
        match grammar.kind(id) {
            MatcherKind::Char(_)
            | MatcherKind::CharIgnoreCase { .. }
            | MatcherKind::CharRange { .. }
            | MatcherKind::AnyOf(_)
            | MatcherKind::Any => return true,
            MatcherKind::Test(sub) | MatcherKind::TestNot(sub) => {
                id = *sub;
                steps += 1;
                if steps > grammar.node_count() {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// The single character a terminal can start with.
///
/// `None` for everything that has no unique starter: composites, [`Any`]
/// (which matches anything) and negative predicates. The repair loop treats a
/// `None` starter on a failed terminal as a grammar defect.
///
/// [`Any`]: MatcherKind::Any
pub(crate) fn starter_char<V>(grammar: &Grammar<V>, id: MatcherId) -> Option<char> {
    let mut id = id;
    let mut steps = 0;
    loop {
        match grammar.kind(id) {
            MatcherKind::Char(c) => return Some(*c),
            MatcherKind::CharIgnoreCase { lower, .. } => return Some(*lower),
            MatcherKind::CharRange { low, .. } => return Some(*low),
            MatcherKind::AnyOf(set) => return set.first().copied(),
            MatcherKind::Test(sub) => {
                id = *sub;
                steps += 1;
                if steps > grammar.node_count() {
                    return None;
                }
            }
            _ => return None,
        }
    }
}

/// Whether the matcher could begin with the character `c`.
pub(crate) fn is_starter_char<V>(grammar: &Grammar<V>, id: MatcherId, c: char) -> bool {
    is_starter_char_guarded(grammar, id, c, &mut Vec::new())
}

fn is_starter_char_guarded<V>(
    grammar: &Grammar<V>,
    id: MatcherId,
    c: char,
    visiting: &mut Vec<MatcherId>,
) -> bool {
    if visiting.contains(&id) {
        return false;
    }
    visiting.push(id);
    let result = match grammar.kind(id) {
        MatcherKind::Char(x) => *x == c,
        MatcherKind::CharIgnoreCase { lower, upper } => c == *lower || c == *upper,
        MatcherKind::CharRange { low, high } => (*low..=*high).contains(&c),
        MatcherKind::AnyOf(set) => set.contains(&c),
        MatcherKind::Any => c != chars::EOI,
        MatcherKind::Empty | MatcherKind::Nothing | MatcherKind::Action(_) => false,
        MatcherKind::Sequence(children) => {
            let mut starts = false;
            for &child in children {
                if is_starter_char_guarded(grammar, child, c, visiting) {
                    starts = true;
                    break;
                }
                if !can_match_empty(grammar, child) {
                    break;
                }
            }
            starts
        }
        MatcherKind::FirstOf(children) => children
            .iter()
            .any(|&child| is_starter_char_guarded(grammar, child, c, visiting)),
        MatcherKind::Optional(sub)
        | MatcherKind::ZeroOrMore(sub)
        | MatcherKind::OneOrMore(sub)
        | MatcherKind::Test(sub) => is_starter_char_guarded(grammar, *sub, c, visiting),
        MatcherKind::TestNot(_) => false,
        MatcherKind::Link(_) => unreachable!("links are resolved at build time"),
    };
    visiting.pop();
    result
}

/// Whether the matcher can succeed without consuming input.
pub(crate) fn can_match_empty<V>(grammar: &Grammar<V>, id: MatcherId) -> bool {
    can_match_empty_guarded(grammar, id, &mut Vec::new())
}

fn can_match_empty_guarded<V>(
    grammar: &Grammar<V>,
    id: MatcherId,
    visiting: &mut Vec<MatcherId>,
) -> bool {
    if visiting.contains(&id) {
        return false;
    }
    visiting.push(id);
    let result = match grammar.kind(id) {
        MatcherKind::Empty
        | MatcherKind::Optional(_)
        | MatcherKind::ZeroOrMore(_)
        | MatcherKind::Test(_)
        | MatcherKind::TestNot(_)
        | MatcherKind::Action(_) => true,
        MatcherKind::OneOrMore(sub) => can_match_empty_guarded(grammar, *sub, visiting),
        MatcherKind::Sequence(children) => children
            .iter()
            .all(|&child| can_match_empty_guarded(grammar, child, visiting)),
        MatcherKind::FirstOf(children) => children
            .iter()
            .any(|&child| can_match_empty_guarded(grammar, child, visiting)),
        MatcherKind::Char(_)
        | MatcherKind::CharIgnoreCase { .. }
        | MatcherKind::CharRange { .. }
        | MatcherKind::AnyOf(_)
        | MatcherKind::Any
        | MatcherKind::Nothing => false,
        MatcherKind::Link(_) => unreachable!("links are resolved at build time"),
    };
    visiting.pop();
    result
}

/// The matchers that may legally follow a failed sequence, given its ancestor
/// chain.
///
/// `ancestors` lists the enclosing matchers from the innermost parent
/// outwards, each with the child index it was at. A repetition ancestor
/// contributes its sub matcher and the walk continues; a sequence ancestor
/// contributes its remaining children and ends the walk at the first one that
/// cannot match empty.
pub(crate) fn follow_matchers<V>(
    grammar: &Grammar<V>,
    ancestors: &[(MatcherId, usize)],
) -> Vec<MatcherId> {
    let mut follow = Vec::new();
    for &(matcher, child_index) in ancestors {
        match grammar.kind(matcher) {
            MatcherKind::OneOrMore(sub) | MatcherKind::ZeroOrMore(sub) => {
                follow.push(*sub);
            }
            MatcherKind::Sequence(children) => {
                let mut complete = false;
                for &child in &children[child_index + 1..] {
                    follow.push(child);
                    if !can_match_empty(grammar, child) {
                        complete = true;
                        break;
                    }
                }
                if complete {
                    return follow;
                }
            }
            _ => {}
        }
    }
    follow
}

/// The minimal list of action matchers to replay under a resynchronised
/// sequence so the value stack stays consistent.
///
/// `None` means no consistent replay exists along this alternative. Sequences
/// may transitively contain themselves, so the traversal keeps a stack of the
/// sequences currently visited and answers `None` on a cycle.
pub(crate) fn collect_resync_actions<V>(
    grammar: &Grammar<V>,
    id: MatcherId,
) -> Option<Vec<MatcherId>> {
    collect_guarded(grammar, id, &mut Vec::new())
}

fn collect_guarded<V>(
    grammar: &Grammar<V>,
    id: MatcherId,
    path: &mut Vec<MatcherId>,
) -> Option<Vec<MatcherId>> {
    match grammar.kind(id) {
        MatcherKind::Action(_) => Some(vec![id]),
        MatcherKind::FirstOf(children) => children
            .iter()
            .find_map(|&child| collect_guarded(grammar, child, path)),
        MatcherKind::OneOrMore(sub) => collect_guarded(grammar, *sub, path),
        MatcherKind::Sequence(children) => {
            if path.contains(&id) {
                return None;
            }
            path.push(id);
            let mut actions = Some(Vec::new());
            for &child in children {
                match collect_guarded(grammar, child, path) {
                    Some(sub_actions) => actions.as_mut().unwrap().extend(sub_actions),
                    None => {
                        actions = None;
                        break;
                    }
                }
            }
            path.pop();
            actions
        }
        _ => Some(Vec::new()),
    }
}
