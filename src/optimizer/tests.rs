//! End-to-end driver scenarios.

use crate::grammar::RuleHints;
use crate::opcodes::Op::*;
use crate::optimizer::{optimize_rule, OptConfig, OptError, OutputMode};

macro_rules! bc {
    ($($x:expr),* $(,)?) => { vec![$(($x) as i32),*] };
}

fn optimize(code: &[i32]) -> Vec<i32> {
    optimize_rule(code, "r", None, &OptConfig::default()).unwrap()
}

/// Optimizes, checks the result, and checks the result is a fixed point.
fn assert_optimizes(code: Vec<i32>, expected: Vec<i32>) {
    let out = optimize(&code);
    assert_eq!(out, expected, "input: {code:?}");
    assert_eq!(optimize(&out), expected, "output is not a fixed point: {code:?}");
}

#[test]
fn test_dead_pushes_collapse() {
    assert_optimizes(
        bc![PushNull, PushUndefined, PushEmptyArray, PushEmptyString, Pop, Pop, Pop, Pop],
        bc![],
    );
}

#[test]
fn test_dead_pushes_collapse_through_pop_n() {
    assert_optimizes(
        bc![PushNull, PushUndefined, PushEmptyArray, PushEmptyString, PopN, 4],
        bc![],
    );
}

#[test]
fn test_always_true_if_keeps_then_branch() {
    assert_optimizes(
        bc![PushEmptyArray, If, 2, 2, AcceptN, 1, Fail, 1],
        bc![PushEmptyArray, AcceptN, 1],
    );
}

#[test]
fn test_always_false_if_keeps_else_branch() {
    assert_optimizes(
        bc![PushNull, If, 2, 2, AcceptN, 1, Fail, 1],
        bc![PushNull, Fail, 1],
    );
}

#[test]
fn test_nested_silence_flattens() {
    assert_optimizes(
        bc![SilentFailsOn, SilentFailsOn, Rule, 1, SilentFailsOff, SilentFailsOff],
        bc![SilentFailsOn, Rule, 1, SilentFailsOff],
    );
}

#[test]
fn test_loop_on_known_failure_disappears() {
    assert_optimizes(
        bc![PushFailed, WhileNotError, 3, Pop, AcceptN, 1, Pop],
        bc![],
    );
}

#[test]
fn test_fail_under_silence_is_a_plain_push() {
    // FAIL becomes PUSH_FAILED, after which the silence markers guard
    // nothing and disappear too
    assert_optimizes(bc![SilentFailsOn, Fail, 0, SilentFailsOff], bc![PushFailed]);
}

#[test]
fn test_following_if_error_fuses_into_branches() {
    assert_optimizes(
        bc![MatchAny, 2, 2, AcceptN, 1, Fail, 0, IfError, 2, 0, Pop, PushNull],
        bc![MatchAny, 2, 4, AcceptN, 1, Fail, 0, Pop, PushNull],
    );
}

#[test]
fn test_pop_chain_sinks_and_dead_slot_goes() {
    // the saved position is only ever discarded, on both paths
    assert_optimizes(
        bc![PushCurrPos, MatchAny, 2, 2, AcceptN, 1, Fail, 0, Pop, Pop],
        bc![MatchAny, 3, 3, AcceptN, 1, Pop, Fail, 0, Pop],
    );
}

#[test]
fn test_wrap_feeding_a_killer() {
    assert_optimizes(bc![PushNull, PushNull, Wrap, 2, Pop], bc![]);
}

#[test]
fn test_wrap_then_nip_becomes_a_pluck() {
    assert_optimizes(
        bc![PushNull, PushUndefined, PushEmptyString, Wrap, 2, Nip],
        bc![PushNull, PushUndefined, PushEmptyString, Pluck, 3, 2, 1, 0],
    );
}

#[test]
fn test_text_feeding_a_killer() {
    assert_optimizes(bc![PushCurrPos, Text, Pop], bc![]);
}

#[test]
fn test_restoring_the_current_position_is_a_pop() {
    assert_optimizes(bc![PushCurrPos, PopCurrPos], bc![]);
}

#[test]
fn test_nip_of_a_fresh_push() {
    assert_optimizes(bc![PushNull, PushNull, Nip, PushNull, Pop, Pop], bc![]);
}

#[test]
fn test_call_absorbs_a_following_nip() {
    assert_optimizes(
        bc![PushNull, PushNull, Call, 0, 1, 0, Nip],
        bc![PushNull, PushNull, Call, 0, 2, 0],
    );
}

#[test]
fn test_conditional_of_identical_discards() {
    assert_optimizes(bc![PushEmptyString, IfLt, 5, 1, 1, Pop, Pop], bc![]);
}

#[test]
fn test_loop_body_rewrites_on_the_settled_pass() {
    assert_optimizes(
        bc![PushEmptyArray, WhileNotError, 4, Pop, PushNull, Pop, PushEmptyArray],
        bc![PushEmptyArray, WhileNotError, 2, Pop, PushEmptyArray],
    );
}

#[test]
fn test_never_matching_rule_kills_the_loop() {
    let hints = RuleHints::from_signums(&[-1]);
    let code = bc![Rule, 0, WhileNotError, 3, Pop, Rule, 0];
    let out = optimize_rule(&code, "r", Some(&hints), &OptConfig::default()).unwrap();
    assert_eq!(out, bc![Rule, 0]);
    // without the hint the loop must stay
    assert_eq!(optimize(&code), code);
}

#[test]
fn test_always_matching_rule_skips_the_error_arm() {
    let hints = RuleHints::from_signums(&[1]);
    let code = bc![Rule, 0, IfError, 1, 0, Pop];
    let out = optimize_rule(&code, "r", Some(&hints), &OptConfig::default()).unwrap();
    assert_eq!(out, bc![Rule, 0]);
}

#[test]
fn test_source_map_outputs_bypass_the_optimizer() {
    let conf = OptConfig { output: OutputMode::SourceAndMap, ..OptConfig::default() };
    let code = bc![PushNull, Pop];
    assert_eq!(optimize_rule(&code, "r", None, &conf).unwrap(), code);
    let conf = OptConfig { output: OutputMode::SourceWithInlineMap, ..OptConfig::default() };
    assert_eq!(optimize_rule(&code, "r", None, &conf).unwrap(), code);
}

#[test]
fn test_source_map_annotations_pass_through() {
    let code = bc![SourceMapPush, 0, PushNull, SourceMapPop];
    assert_eq!(optimize(&code), code);
}

#[test]
fn test_unchanged_rules_come_back_verbatim() {
    let code = bc![Rule, 0];
    assert_eq!(optimize(&code), code);
}

#[test]
fn test_underflow_names_the_rule() {
    let err = optimize_rule(&bc![Pop], "digits", None, &OptConfig::default()).unwrap_err();
    assert_eq!(err, OptError::StackUnderflow { rule: "digits".to_string(), what: "pop" });
}

#[test]
fn test_unbalanced_branches_are_rejected() {
    let err = optimize_rule(&bc![PushEmptyString, If, 1, 0, Pop], "r", None, &OptConfig::default())
        .unwrap_err();
    assert!(matches!(err, OptError::StackMismatch { then_depth: 0, else_depth: 1, .. }));
}

#[test]
fn test_output_mode_names() {
    assert_eq!("source-and-map".parse(), Ok(OutputMode::SourceAndMap));
    assert_eq!("source-with-inline-map".parse(), Ok(OutputMode::SourceWithInlineMap));
    assert_eq!("parser".parse(), Ok(OutputMode::Parser));
    assert!("bytecode".parse::<OutputMode>().is_err());
}

#[test]
fn test_skip_dead_slots_leaves_far_slots_alone() {
    // the null is produced long before the discard, out of peephole reach
    let conf = OptConfig { skip_dead_slots: true, ..OptConfig::default() };
    let code = bc![PushNull, Rule, 0, Pop, Pop];
    let out = optimize_rule(&code, "r", None, &conf).unwrap();
    assert_eq!(out, code);
    // the full driver removes the dead slot and sweeps the placeholders
    assert_eq!(optimize(&code), bc![Rule, 0, Pop]);
}
