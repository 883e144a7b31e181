//! Per-rule bytecode optimization.
//!
//! The driver formats a rule's flat bytecode into the tree form, alternates
//! the peephole visitors and the dead-slot pass until neither finds
//! anything, and flattens the result. Each rule's optimization is a
//! synchronous pure function of its bytecode and the read-only grammar
//! hints; errors mean the input bytecode is invalid and are never caught
//! here.

use std::str::FromStr;

use thiserror::Error;

use crate::grammar::RuleHints;

mod dead_slots;
pub mod interp;
pub mod peephole;
pub mod printer;
pub mod tree;
pub mod types;
#[cfg(test)]
mod tests;

use interp::State;
use peephole::Peephole;
use tree::Code;

/// An error in the bytecode being optimized. Fatal to the current rule,
/// never to other rules; a correct emitter never triggers one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptError {
    #[error("Rule {rule}: removing from an empty abstract stack ({what})")]
    StackUnderflow { rule: String, what: &'static str },
    #[error("Rule {rule}: the parse cursor can only be set from a saved offset")]
    BadCurrPos { rule: String },
    #[error("Rule {rule}: APPEND needs an array beneath the appended value")]
    BadAppend { rule: String },
    #[error("Rule {rule}: TEXT needs a saved offset on top of the stack")]
    BadText { rule: String },
    #[error("Rule {rule}: branches join with different stack depths ({then_depth} vs {else_depth})")]
    StackMismatch { rule: String, then_depth: usize, else_depth: usize },
    #[error("Rule {rule}: branches join with different silent-fail depths ({then_depth} vs {else_depth})")]
    SilentFailsMismatch { rule: String, then_depth: u32, else_depth: u32 },
    #[error("Rule {rule}: conditional can take neither branch")]
    ImpossibleConditional { rule: String },
    #[error("Rule {rule}: unknown opcode {code} at offset {offset}")]
    InvalidOpcode { rule: String, code: i32, offset: usize },
    #[error("Rule {rule}: malformed code tree ({reason})")]
    MalformedTree { rule: String, reason: &'static str },
}

/// What the surrounding build is emitting. Source-map outputs bypass the
/// optimizer entirely, because rewrites would detach the mappings.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum OutputMode {
    Parser,
    #[default]
    Source,
    SourceAndMap,
    SourceWithInlineMap,
}

impl OutputMode {
    pub fn emits_source_map(self) -> bool {
        matches!(self, OutputMode::SourceAndMap | OutputMode::SourceWithInlineMap)
    }
}

impl FromStr for OutputMode {
    type Err = String;

    fn from_str(s: &str) -> Result<OutputMode, String> {
        match s {
            "parser" => Ok(OutputMode::Parser),
            "source" => Ok(OutputMode::Source),
            "source-and-map" => Ok(OutputMode::SourceAndMap),
            "source-with-inline-map" => Ok(OutputMode::SourceWithInlineMap),
            other => Err(format!("unknown output mode `{other}`")),
        }
    }
}

/// Optimizer configuration, threaded into the driver by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct OptConfig {
    pub verbosity: u8,
    /// Dump before/after listings for every rule.
    pub dump_all: bool,
    /// Dump before/after listings for one rule.
    pub dump_rule: Option<String>,
    pub skip_dead_slots: bool,
    /// Outer-pass cap for pathological inputs; hitting it keeps the
    /// current code and warns instead of failing.
    pub max_passes: u32,
    pub output: OutputMode,
}

impl Default for OptConfig {
    fn default() -> OptConfig {
        OptConfig {
            verbosity: 0,
            dump_all: false,
            dump_rule: None,
            skip_dead_slots: false,
            max_passes: 64,
            output: OutputMode::Source,
        }
    }
}

impl OptConfig {
    pub fn from_env() -> OptConfig {
        OptConfig {
            verbosity: parse_env("PEGOPT_VERBOSITY", 0),
            dump_all: parse_env("PEGOPT_DUMP", false),
            dump_rule: parse_env_opt("PEGOPT_DUMP_RULE"),
            skip_dead_slots: parse_env("PEGOPT_SKIP_DEAD_SLOTS", false),
            max_passes: parse_env("PEGOPT_MAX_PASSES", 64),
            output: parse_env("PEGOPT_OUTPUT", OutputMode::Source),
        }
    }

    #[inline]
    pub fn should_log(&self, level: u8) -> bool {
        self.verbosity >= level
    }

    fn wants_dump(&self, rule: &str) -> bool {
        self.dump_all || self.dump_rule.as_deref() == Some(rule)
    }
}

fn parse_env_opt<T>(key: &str) -> Option<T>
where
    T: FromStr + 'static,
    <T as FromStr>::Err: std::fmt::Display,
{
    let Ok(mut val) = std::env::var(key) else {
        return None;
    };
    if std::any::TypeId::of::<T>() == std::any::TypeId::of::<bool>() {
        val = val.to_lowercase();
        if val == "1" || val == "yes" {
            val = "true".to_string();
        } else if val == "0" || val == "no" {
            val = "false".to_string();
        }
    }
    match val.parse::<T>() {
        Ok(v) => Some(v),
        Err(err) => {
            if val.is_empty() {
                None
            } else {
                panic!("Failed to parse env var {key} with value {val}: {err}");
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> T
where
    T: FromStr + 'static,
    <T as FromStr>::Err: std::fmt::Display,
{
    parse_env_opt(key).unwrap_or(default)
}

/// Optimizes one rule's flat bytecode. Returns the input unchanged when the
/// output mode carries source maps or when nothing could be improved.
pub fn optimize_rule(
    code: &[Code],
    rule: &str,
    hints: Option<&RuleHints>,
    conf: &OptConfig,
) -> Result<Vec<Code>, OptError> {
    if conf.output.emits_source_map() {
        return Ok(code.to_vec());
    }

    let mut block = tree::format(rule, code)?;
    let mut any_change = false;
    let mut passes: u32 = 0;
    loop {
        let mut state = State::new(rule, hints);
        let run = state.run(&mut block, &mut Peephole)?;
        let mut changed = run.changed;
        if !changed && !conf.skip_dead_slots {
            changed = dead_slots::remove_dead_slots(rule, &mut block)?;
        }
        if !changed {
            break;
        }
        any_change = true;
        passes += 1;
        if passes >= conf.max_passes {
            if conf.should_log(1) {
                println!(
                    "pegopt: rule {rule} did not settle after {passes} passes, keeping current code"
                );
            }
            break;
        }
    }

    let out = if any_change { tree::flatten(rule, &block)? } else { code.to_vec() };
    if conf.wants_dump(rule) {
        println!("pegopt: rule {rule} before:\n{}", printer::dump(code, rule)?);
        println!("pegopt: rule {rule} after:\n{}", printer::dump(&out, rule)?);
    }
    Ok(out)
}
