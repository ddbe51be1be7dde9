use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use assert_matches::assert_matches;

use crate::chars::{DEL_ERROR, INS_ERROR, RESYNC_END, RESYNC_START};
use crate::{
    chars, BasicRunner, Grammar, GrammarBuilder, InputBuffer, ListenerResult, MatchEvent,
    ParseListener, ParseResult, PatchBuffer, RecoveringRunner, RunError,
};

/// `root := 'a' 'b' 'c' EOI`
fn abc_grammar() -> Grammar<()> {
    let mut g = GrammarBuilder::new();
    let a = g.ch('a');
    let b = g.ch('b');
    let c = g.ch('c');
    let eoi = g.eoi();
    let root = g.seq([a, b, c, eoi]);
    g.label(root, "abc");
    g.build(root).unwrap()
}

/// `root := 'a'+ ';' EOI`
fn repetition_grammar() -> Grammar<()> {
    let mut g = GrammarBuilder::new();
    let a = g.ch('a');
    let rep = g.one_or_more(a);
    let semi = g.ch(';');
    let eoi = g.eoi();
    let root = g.seq([rep, semi, eoi]);
    g.build(root).unwrap()
}

/// `root := ('a' / 'b')+ ';' EOI`
fn choice_grammar() -> Grammar<()> {
    let mut g = GrammarBuilder::new();
    let a = g.ch('a');
    let b = g.ch('b');
    let letter = g.first_of([a, b]);
    let letters = g.one_or_more(letter);
    let semi = g.ch(';');
    let eoi = g.eoi();
    let root = g.seq([letters, semi, eoi]);
    g.build(root).unwrap()
}

/// `clause := ('a' / 'b')+ ';'` repeated until the end of the input.
fn clauses_grammar() -> Grammar<()> {
    let mut g = GrammarBuilder::new();
    let a = g.ch('a');
    let b = g.ch('b');
    let letter = g.first_of([a, b]);
    let letters = g.one_or_more(letter);
    let semi = g.ch(';');
    let clause = g.seq([letters, semi]);
    g.label(clause, "clause");
    let clauses = g.one_or_more(clause);
    let eoi = g.eoi();
    let root = g.seq([clauses, eoi]);
    g.build(root).unwrap()
}

fn logical_text(buffer: &PatchBuffer) -> Vec<char> {
    (0..buffer.len()).map(|index| buffer.char_at(index)).collect()
}

fn original_error_index<V>(result: &ParseResult<V>, error: usize) -> usize {
    result
        .buffer
        .original_index(result.errors[error].start_index())
}

#[test]
fn clean_input_parses_without_errors() {
    let grammar = abc_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("abc").unwrap();
    assert!(result.matched);
    assert!(!result.has_errors());
    assert_eq!(logical_text(&result.buffer), vec!['a', 'b', 'c']);
    let tree = result.tree.unwrap();
    assert_eq!(tree.start_index, 0);
    assert_eq!(tree.children.len(), 4);
    assert!(!tree.has_error);
}

#[test]
fn recovering_run_equals_basic_run_on_clean_input() {
    let grammar = abc_grammar();
    let basic = BasicRunner::new(&grammar).run_str("abc").unwrap();
    let recovering = RecoveringRunner::new(&grammar).run_str("abc").unwrap();
    assert!(basic.matched);
    assert!(recovering.matched);
    assert!(recovering.errors.is_empty());
    let basic_tree = basic.tree.unwrap();
    let recovering_tree = recovering.tree.unwrap();
    assert_eq!(basic_tree.children.len(), recovering_tree.children.len());
    assert_eq!(basic_tree.end_index, recovering_tree.end_index);
    assert_eq!(basic.stack.len(), recovering.stack.len());
}

#[test]
fn basic_runner_reports_failure_without_recovery() {
    let grammar = abc_grammar();
    let result = BasicRunner::new(&grammar).run_str("abd").unwrap();
    assert!(!result.matched);
    assert!(result.errors.is_empty());
    assert!(result.tree.is_none());
}

#[test]
fn wrong_character_is_repaired_by_replacement() {
    let grammar = abc_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("abd").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(original_error_index(&result, 0), 2);
    assert_eq!(
        logical_text(&result.buffer),
        vec!['a', 'b', DEL_ERROR, 'd', INS_ERROR, 'c']
    );
    // the reported position projects onto the offending original character
    let error = &result.errors[0];
    assert_eq!(
        result.buffer.extract(error.start_index(), error.start_index() + 1),
        "d"
    );
    // the failed matcher at the error location was the 'c' terminal
    assert_eq!(error.failed_matchers.len(), 1);
    assert!(error.failed_matchers[0].describe(&grammar).ends_with("'c'"));
}

#[test]
fn missing_character_is_repaired_by_insertion() {
    let grammar = abc_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("ac").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(original_error_index(&result, 0), 1);
    assert_eq!(
        logical_text(&result.buffer),
        vec!['a', INS_ERROR, 'b', 'c']
    );
}

#[test]
fn extra_character_is_repaired_by_deletion() {
    let grammar = abc_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("axbc").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(original_error_index(&result, 0), 1);
    assert_eq!(
        logical_text(&result.buffer),
        vec!['a', DEL_ERROR, 'x', 'b', 'c']
    );
    // the parse tree of the final run records that a repair happened
    assert!(result.tree.unwrap().has_error);
}

#[test]
fn deletion_inside_a_repetition() {
    let grammar = repetition_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("aa?a;").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(original_error_index(&result, 0), 2);
    assert_eq!(
        logical_text(&result.buffer),
        vec!['a', 'a', DEL_ERROR, '?', 'a', ';']
    );
}

#[test]
fn extra_terminator_is_repaired_by_deletion() {
    let grammar = choice_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("aab;;").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(original_error_index(&result, 0), 4);
    assert_eq!(
        logical_text(&result.buffer),
        vec!['a', 'a', 'b', ';', DEL_ERROR, ';']
    );
}

#[test]
fn unfixable_junk_triggers_resynchronisation() {
    let grammar = choice_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("aab!!!;").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 1);
    let error = &result.errors[0];
    // a range error covering the skipped characters
    assert!(error.start_index() < error.end_index());
    assert_eq!(result.buffer.original_index(error.start_index()), 3);
    assert_eq!(
        result
            .buffer
            .extract(error.start_index(), error.end_index()),
        "!!!;"
    );
    let text = logical_text(&result.buffer);
    assert!(text.contains(&RESYNC_START));
    assert!(text.contains(&RESYNC_END));
}

#[test]
fn resynchronisation_stops_at_a_follow_character() {
    let grammar = clauses_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("ab;a!!;ab;").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 1);
    let error = &result.errors[0];
    // the junk after the matched 'a' is skipped up to the next clause start
    assert_eq!(result.buffer.original_index(error.start_index()), 4);
    assert_eq!(
        result
            .buffer
            .extract(error.start_index(), error.end_index()),
        "!!;"
    );
    // parsing resumed: the final clause is part of the match
    let text = logical_text(&result.buffer);
    assert_eq!(text[text.len() - 3..], ['a', 'b', ';']);
}

#[test]
fn multiple_errors_are_all_reported_in_order() {
    let grammar = clauses_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("ab;ab!;a!;").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 2);
    assert_eq!(original_error_index(&result, 0), 5);
    assert_eq!(original_error_index(&result, 1), 8);
    assert!(result.errors[0].start_index() < result.errors[1].start_index());
    for error in &result.errors {
        assert!(!error.failed_matchers.is_empty());
    }
}

#[test]
fn empty_input_is_repaired_to_completion() {
    let grammar = abc_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("").unwrap();
    assert!(result.matched);
    assert!(result.has_errors());
}

#[test]
fn junk_only_input_is_repaired_to_completion() {
    let grammar = choice_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("???").unwrap();
    assert!(result.matched);
    assert!(result.has_errors());
}

#[test]
fn actions_build_the_value_stack() {
    let mut g = GrammarBuilder::<i32>::new();
    let a = g.ch('a');
    let b = g.ch('b');
    let letter = g.first_of([a, b]);
    let push = g.action(|ctx| {
        ctx.stack().push(1);
        true
    });
    let item = g.seq([letter, push]);
    let items = g.one_or_more(item);
    let semi = g.ch(';');
    let eoi = g.eoi();
    let root = g.seq([items, semi, eoi]);
    let grammar = g.build(root).unwrap();

    let result = RecoveringRunner::new(&grammar).run_str("ab;").unwrap();
    assert!(result.matched);
    assert!(!result.has_errors());
    assert_eq!(result.stack.len(), 2);
}

#[test]
fn failed_sequences_leave_the_value_stack_untouched() {
    let mut g = GrammarBuilder::<i32>::new();
    let a = g.ch('a');
    let push = g.action(|ctx| {
        ctx.stack().push(1);
        true
    });
    let b = g.ch('b');
    let with_action = g.seq([a, push, b]);
    let bare = g.ch('a');
    let choice = g.first_of([with_action, bare]);
    let eoi = g.eoi();
    let root = g.seq([choice, eoi]);
    let grammar = g.build(root).unwrap();

    // "a" fails the first alternative after its action ran; the fallback
    // must not see the pushed value
    let result = BasicRunner::new(&grammar).run_str("a").unwrap();
    assert!(result.matched);
    assert_eq!(result.stack.len(), 0);
}

#[test]
fn resynchronised_sequences_replay_their_actions() {
    let mut g = GrammarBuilder::<i32>::new();
    let a = g.ch('a');
    let b = g.ch('b');
    let letter = g.first_of([a, b]);
    let letters = g.one_or_more(letter);
    let semi = g.ch(';');
    let push = g.action(|ctx| {
        ctx.stack().push(1);
        true
    });
    let clause = g.seq([letters, semi, push]);
    let clauses = g.one_or_more(clause);
    let eoi = g.eoi();
    let root = g.seq([clauses, eoi]);
    let grammar = g.build(root).unwrap();

    // the first clause resynchronises over "!!;", the second parses cleanly;
    // both must have pushed their value
    let result = RecoveringRunner::new(&grammar).run_str("a!!;b;").unwrap();
    assert!(result.matched);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.stack.len(), 2);
}

#[test]
fn conditional_actions_can_fail_a_parse() {
    let mut g = GrammarBuilder::<i32>::new();
    let a = g.ch('a');
    let reject = g.action(|_| false);
    let eoi = g.eoi();
    let root = g.seq([a, reject, eoi]);
    let grammar = g.build(root).unwrap();
    let result = BasicRunner::new(&grammar).run_str("a").unwrap();
    assert!(!result.matched);
}

#[test]
fn case_insensitive_string_terminals() {
    let mut g = GrammarBuilder::<()>::new();
    let keyword = g.string_ignore_case("if");
    let eoi = g.eoi();
    let root = g.seq([keyword, eoi]);
    let grammar = g.build(root).unwrap();
    assert!(BasicRunner::new(&grammar).run_str("IF").unwrap().matched);
    assert!(BasicRunner::new(&grammar).run_str("iF").unwrap().matched);
    assert!(!BasicRunner::new(&grammar).run_str("of").unwrap().matched);
}

#[test]
fn predicates_check_without_consuming() {
    let mut g = GrammarBuilder::<()>::new();
    let b = g.ch('b');
    let not_b = g.test_not(b);
    let any = g.any();
    let other = g.seq([not_b, any]);
    let others = g.zero_or_more(other);
    let eoi = g.eoi();
    let root = g.seq([others, b, eoi]);
    let grammar = g.build(root).unwrap();
    let result = BasicRunner::new(&grammar).run_str("xayb").unwrap();
    assert!(result.matched);
    assert!(!BasicRunner::new(&grammar).run_str("xay").unwrap().matched);
}

#[test]
fn zero_width_repetition_is_an_invalid_grammar() {
    let mut g = GrammarBuilder::<()>::new();
    let a = g.ch('a');
    let opt = g.optional(a);
    let rep = g.one_or_more(opt);
    let eoi = g.eoi();
    let root = g.seq([rep, eoi]);
    let grammar = g.build(root).unwrap();
    let result = BasicRunner::new(&grammar).run_str("b");
    assert_matches!(result, Err(RunError::InvalidGrammar(..)));
}

#[test]
fn exceeding_the_time_budget_aborts_the_parse() {
    let grammar = abc_grammar();
    let mut runner = RecoveringRunner::with_timeout(&grammar, Duration::ZERO);
    let result = runner.run_str("ax");
    assert_matches!(result, Err(RunError::Timeout { .. }));
    // the partial state stays available for inspection
    let last = runner.last_result().unwrap();
    assert!(!last.matched);
}

#[derive(Default)]
struct EventLog {
    events: Rc<RefCell<Vec<String>>>,
}

impl ParseListener<()> for EventLog {
    fn pre_parse(&mut self, _buffer: &dyn InputBuffer) -> ListenerResult {
        self.events.borrow_mut().push("pre-parse".into());
        Ok(())
    }

    fn pre_match(&mut self, event: &MatchEvent<'_>) -> ListenerResult {
        self.events
            .borrow_mut()
            .push(format!("try {} @{}", event.label, event.start_index));
        Ok(())
    }

    fn match_success(&mut self, event: &MatchEvent<'_>) -> ListenerResult {
        self.events
            .borrow_mut()
            .push(format!("ok {} @{}", event.label, event.start_index));
        Ok(())
    }

    fn match_failure(&mut self, event: &MatchEvent<'_>) -> ListenerResult {
        self.events
            .borrow_mut()
            .push(format!("fail {} @{}", event.label, event.start_index));
        Ok(())
    }

    fn post_parse(&mut self, matched: bool, _buffer: &dyn InputBuffer) -> ListenerResult {
        self.events.borrow_mut().push(format!("post-parse {matched}"));
        Ok(())
    }
}

#[test]
fn listeners_observe_the_parse() {
    let grammar = abc_grammar();
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut runner = BasicRunner::new(&grammar);
    runner.register_listener(Box::new(EventLog {
        events: events.clone(),
    }));
    let result = runner.run_str("abc").unwrap();
    assert!(result.matched);

    let events = events.borrow();
    assert_eq!(events.first().map(String::as_str), Some("pre-parse"));
    assert_eq!(events.last().map(String::as_str), Some("post-parse true"));
    assert!(events.iter().any(|event| event == "ok 'a' @0"));
    assert!(events.iter().any(|event| event == "ok abc @0"));
}

#[test]
fn recovering_runner_reports_baseline_and_final_runs() {
    let grammar = abc_grammar();
    let events = Rc::new(RefCell::new(Vec::new()));
    let mut runner = RecoveringRunner::new(&grammar);
    runner.register_listener(Box::new(EventLog {
        events: events.clone(),
    }));
    let result = runner.run_str("ac").unwrap();
    assert!(result.matched);

    let events = events.borrow();
    let pre_parses = events.iter().filter(|event| *event == "pre-parse").count();
    assert_eq!(pre_parses, 2);
    assert!(events.iter().any(|event| event == "post-parse false"));
    assert_eq!(events.last().map(String::as_str), Some("post-parse true"));
}

struct FailingListener;

impl ParseListener<()> for FailingListener {
    fn pre_parse(&mut self, _buffer: &dyn InputBuffer) -> ListenerResult {
        Err("listener is broken".into())
    }
}

#[test]
fn listener_failures_abort_the_parse() {
    let grammar = abc_grammar();
    let mut runner = BasicRunner::new(&grammar);
    runner.register_listener(Box::new(FailingListener));
    let result = runner.run_str("abc");
    assert_matches!(
        result,
        Err(RunError::Listener {
            phase: crate::ParsePhase::PreParse,
            ..
        })
    );
}

#[test]
fn reported_positions_have_line_and_column() {
    let grammar = clauses_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("ab;ab!;a!;").unwrap();
    let error = &result.errors[0];
    let position = result.buffer.position(error.start_index());
    assert_eq!(position.line, 1);
    assert_eq!(
        position.column,
        result.buffer.original_index(error.start_index()) + 1
    );
}

#[test]
fn sentinels_never_leak_into_extracted_text() {
    let grammar = choice_grammar();
    let result = RecoveringRunner::new(&grammar).run_str("aab!!!;").unwrap();
    let full = result.buffer.extract(0, result.buffer.len());
    assert_eq!(full, "aab!!!;");
    assert!(full.chars().all(|c| !chars::is_marker(c)));
}
