//! The abstract interpreter.
//!
//! A [`State`] simulates the VM stack symbolically, one rule at a time. It
//! owns the tree it runs, mutates it in place through the rewrites the
//! attached [`Visitor`] requests, and is cloned at every conditional branch
//! and loop entry and merged back at every join. Loops are iterated to a
//! fixed point with rewrites suppressed, then run once more to realize the
//! rewrites the fixpoint discovered.

use smallvec::SmallVec;

use crate::grammar::{MatchHint, RuleHints};
use crate::opcodes::Op;
use crate::optimizer::tree::{Block, Code, Instr};
use crate::optimizer::types::{IdGen, Tag, Value};
use crate::optimizer::OptError;

/// A rewrite requested against the block currently being interpreted.
#[derive(Debug)]
pub enum Rewrite {
    /// Replace `block[at .. at + len]` with `with`.
    Splice { at: usize, len: usize, with: Block },
    /// An in-place mutation already happened; only note that code changed.
    Touched,
}

/// Outcome of interpreting one element.
#[derive(Debug)]
pub struct InterpResult<'a> {
    /// Where interpretation continues, valid after the rewrite is applied.
    pub next_ip: usize,
    pub cond_state: Option<CondState<'a>>,
    pub rewrite: Option<Rewrite>,
}

impl<'a> InterpResult<'a> {
    pub fn fallthrough(ip: usize) -> InterpResult<'a> {
        InterpResult { next_ip: ip + 1, cond_state: None, rewrite: None }
    }
}

/// Outcome of running a whole block.
#[derive(Debug)]
pub struct RunResult<'a> {
    pub changed: bool,
    /// The last element's branch states, when it was a conditional.
    pub cond_state: Option<CondState<'a>>,
}

/// Per-branch abstract state observed at the join point of a conditional,
/// kept for follow-on optimizations. A side that itself ended in a
/// conditional carries that conditional's tree instead of a snapshot.
#[derive(Clone, Debug)]
pub enum CondState<'a> {
    Leaf(State<'a>),
    Split(Box<CondState<'a>>, Box<CondState<'a>>),
}

impl<'a> CondState<'a> {
    /// Visits every terminal state together with the child block whose join
    /// point it describes, recursing through trailing conditionals. Returns
    /// `Ok(false)` when the tree and the element shapes disagree.
    pub fn try_for_each_terminal<F>(&mut self, elem: &mut Instr, f: &mut F) -> Result<bool, OptError>
    where
        F: FnMut(&mut State<'a>, &mut Block) -> Result<(), OptError>,
    {
        let CondState::Split(then_cs, else_cs) = self else { return Ok(false) };
        let Instr::Cond { then_block, else_block, .. } = elem else { return Ok(false) };
        for (side, block) in [(then_cs, then_block), (else_cs, else_block)] {
            match side.as_mut() {
                CondState::Leaf(state) => f(state, block)?,
                split => {
                    let Some(last) = block.last_mut() else { return Ok(false) };
                    if !split.try_for_each_terminal(last, f)? {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Read-only variant of [`Self::try_for_each_terminal`].
    pub fn for_each_terminal<F>(&self, elem: &Instr, f: &mut F) -> bool
    where
        F: FnMut(&State<'a>),
    {
        let CondState::Split(then_cs, else_cs) = self else { return false };
        let Instr::Cond { then_block, else_block, .. } = elem else { return false };
        for (side, block) in [(then_cs, then_block), (else_cs, else_block)] {
            match side.as_ref() {
                CondState::Leaf(state) => f(state),
                split => {
                    let Some(last) = block.last() else { return false };
                    if !split.for_each_terminal(last, f) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// Visitor hooks dispatched around each element while a state runs a block.
/// Hooks are only invoked on the settled pass (`looping == 0`), never during
/// loop fixpoint iteration. The default implementations do nothing.
pub trait Visitor {
    fn pre_run(&mut self, _state: &State<'_>, _block: &Block) {}

    fn post_run(&mut self, _state: &State<'_>, _block: &Block) {}

    /// May take over the element entirely by returning a result.
    fn pre_interp<'a>(
        &mut self,
        _state: &mut State<'a>,
        _block: &mut Block,
        _ip: usize,
    ) -> Result<Option<InterpResult<'a>>, OptError> {
        Ok(None)
    }

    /// Runs after the element's transfer function; may amend the result.
    fn post_interp<'a>(
        &mut self,
        _state: &mut State<'a>,
        _block: &mut Block,
        _ip: usize,
        _res: &mut InterpResult<'a>,
    ) -> Result<(), OptError> {
        Ok(())
    }
}

/// Plain interpretation without peephole hooks.
pub struct NoVisitor;

impl Visitor for NoVisitor {}

/// A classifier decides, per side of a conditional, whether the abstract top
/// of stack restricts execution to that side alone, and how the top refines
/// inside that side.
pub type Classifier = fn(Value, bool) -> (bool, Option<Tag>);

fn classify_if(top: Value, for_then: bool) -> (bool, Option<Tag>) {
    if for_then {
        (top.must_be_true(), Some(top.tag.without(Tag::NULL | Tag::UNDEFINED)))
    } else {
        (top.must_be_false(), Some(top.tag.without(Tag::ARRAY | Tag::FAILED)))
    }
}

fn classify_if_error(top: Value, for_then: bool) -> (bool, Option<Tag>) {
    if for_then {
        (top.must_be(Tag::FAILED), Some(top.tag & Tag::FAILED))
    } else {
        (!top.could_be(Tag::FAILED), Some(top.tag.without(Tag::FAILED)))
    }
}

fn classify_if_not_error(top: Value, for_then: bool) -> (bool, Option<Tag>) {
    if for_then {
        (!top.could_be(Tag::FAILED), Some(top.tag.without(Tag::FAILED)))
    } else {
        (top.must_be(Tag::FAILED), Some(top.tag & Tag::FAILED))
    }
}

pub(crate) fn cond_peeks_stack(op: Op) -> bool {
    matches!(
        op,
        Op::If
            | Op::IfError
            | Op::IfNotError
            | Op::IfLt
            | Op::IfGe
            | Op::IfLtDynamic
            | Op::IfGeDynamic
    )
}

/// The abstract interpreter state for one rule.
#[derive(Clone, Debug)]
pub struct State<'a> {
    pub stack: SmallVec<[Value; 16]>,
    /// The parse cursor; always an `OFFSET` with an identity.
    pub curr_pos: Value,
    pub silent_fails: u32,
    /// Recursion depth of loop re-interpretations. Rewrites and visitors are
    /// suppressed while it is nonzero.
    looping: u32,
    pub rule: &'a str,
    hints: Option<&'a RuleHints>,
    ids: IdGen,
}

impl<'a> State<'a> {
    pub fn new(rule: &'a str, hints: Option<&'a RuleHints>) -> State<'a> {
        let ids = IdGen::new();
        let curr_pos = Value::with_id(Tag::OFFSET, ids.mint());
        State {
            stack: SmallVec::new(),
            curr_pos,
            silent_fails: 0,
            looping: 0,
            rule,
            hints,
            ids,
        }
    }

    pub fn underflow(&self, what: &'static str) -> OptError {
        OptError::StackUnderflow { rule: self.rule.to_string(), what }
    }

    fn pop(&mut self, what: &'static str) -> Result<Value, OptError> {
        match self.stack.pop() {
            Some(v) => Ok(v),
            None => Err(self.underflow(what)),
        }
    }

    fn discard(&mut self, n: Code) -> Result<(), OptError> {
        if n < 0 || n as usize > self.stack.len() {
            return Err(self.underflow("discard"));
        }
        let keep = self.stack.len() - n as usize;
        self.stack.truncate(keep);
        Ok(())
    }

    fn inspect(&self, depth: Code) -> Result<Value, OptError> {
        if depth < 0 || depth as usize >= self.stack.len() {
            return Err(self.underflow("inspect"));
        }
        Ok(self.stack[self.stack.len() - 1 - depth as usize])
    }

    /// Moves the parse cursor to a value unrelated to any previous one.
    fn advance(&mut self) {
        self.curr_pos = Value::with_id(Tag::OFFSET, self.ids.mint());
    }

    /// Joins `other` (the then-branch state) into `self` at a control-flow
    /// join. The abstract union is commutative, so branch order does not
    /// affect the output state.
    pub fn merge(&mut self, other: &State<'a>) -> Result<(), OptError> {
        if self.stack.len() != other.stack.len() {
            return Err(OptError::StackMismatch {
                rule: self.rule.to_string(),
                then_depth: other.stack.len(),
                else_depth: self.stack.len(),
            });
        }
        if self.silent_fails != other.silent_fails {
            return Err(OptError::SilentFailsMismatch {
                rule: self.rule.to_string(),
                then_depth: other.silent_fails,
                else_depth: self.silent_fails,
            });
        }
        for (a, b) in self.stack.iter_mut().zip(other.stack.iter()) {
            *a = Value::union(*a, *b);
        }
        // The cursor keeps its identity only when both paths agree on it.
        if self.curr_pos.id != other.curr_pos.id {
            self.curr_pos = Value::with_id(Tag::OFFSET, self.ids.mint());
        }
        Ok(())
    }

    /// Loop-fixpoint equality. The cursor is deliberately not compared:
    /// every iteration legitimately mints a fresh cursor identity.
    pub fn equal(&self, other: &State<'a>) -> bool {
        self.silent_fails == other.silent_fails
            && self.stack.len() == other.stack.len()
            && self.stack.iter().zip(other.stack.iter()).all(|(a, b)| a == b)
    }

    pub fn run<V: Visitor>(
        &mut self,
        block: &mut Block,
        vis: &mut V,
    ) -> Result<RunResult<'a>, OptError> {
        self.run_from(block, 0, vis)
    }

    /// Drives a block from `from`, dispatching visitors and applying the
    /// rewrites they request.
    pub fn run_from<V: Visitor>(
        &mut self,
        block: &mut Block,
        from: usize,
        vis: &mut V,
    ) -> Result<RunResult<'a>, OptError> {
        if self.looping == 0 {
            vis.pre_run(self, block);
        }
        let mut changed = false;
        let mut last_cond = None;
        let mut ip = from;
        while ip < block.len() {
            let pre = if self.looping == 0 { vis.pre_interp(self, block, ip)? } else { None };
            let mut res = match pre {
                Some(res) => res,
                None => {
                    let mut res = self.interp(block, ip, vis)?;
                    if self.looping == 0 {
                        vis.post_interp(self, block, ip, &mut res)?;
                    }
                    res
                }
            };
            if let Some(rewrite) = res.rewrite.take() {
                changed = true;
                if let Rewrite::Splice { at, len, with } = rewrite {
                    block.splice(at..at + len, with);
                }
            }
            last_cond = res.cond_state.take();
            ip = res.next_ip;
        }
        if self.looping == 0 {
            vis.post_run(self, block);
        }
        Ok(RunResult { changed, cond_state: last_cond })
    }

    /// Transfer function of one element.
    pub fn interp<V: Visitor>(
        &mut self,
        block: &mut Block,
        ip: usize,
        vis: &mut V,
    ) -> Result<InterpResult<'a>, OptError> {
        match &block[ip] {
            Instr::Cond { .. } => self.interp_condition(block, ip, vis),
            Instr::Loop { .. } => self.interp_loop(block, ip, vis),
            Instr::Flat { op, args } => {
                let op = *op;
                let args: SmallVec<[Code; 2]> = args.clone();
                self.interp_flat(op, &args)?;
                Ok(InterpResult::fallthrough(ip))
            }
        }
    }

    fn interp_flat(&mut self, op: Op, args: &[Code]) -> Result<(), OptError> {
        match op {
            Op::PushEmptyString => self.stack.push(Value::new(Tag::STRING)),
            Op::PushUndefined => self.stack.push(Value::new(Tag::UNDEFINED)),
            Op::PushNull => self.stack.push(Value::new(Tag::NULL)),
            Op::PushFailed => self.stack.push(Value::new(Tag::FAILED)),
            Op::PushEmptyArray => {
                let id = self.ids.mint();
                self.stack.push(Value::with_id(Tag::ARRAY, id));
            }
            Op::PushCurrPos => self.stack.push(self.curr_pos),
            Op::Pop => {
                self.pop("pop")?;
            }
            Op::PopN => self.discard(args[0])?,
            Op::Nip => {
                if self.stack.len() < 2 {
                    return Err(self.underflow("nip"));
                }
                let below = self.stack.len() - 2;
                self.stack.remove(below);
            }
            Op::PopCurrPos => {
                let v = self.pop("pop")?;
                if !v.must_be(Tag::OFFSET) {
                    return Err(OptError::BadCurrPos { rule: self.rule.to_string() });
                }
                let id = v.id.unwrap_or_else(|| self.ids.mint());
                self.curr_pos = Value::with_id(Tag::OFFSET, id);
            }
            Op::Append => {
                self.pop("pop")?;
                if self.stack.is_empty() {
                    return Err(self.underflow("pop"));
                }
                let at = self.stack.len() - 1;
                if !self.stack[at].must_be(Tag::ARRAY) {
                    return Err(OptError::BadAppend { rule: self.rule.to_string() });
                }
                // the array was mutated; it is no longer any remembered value
                let id = self.ids.mint();
                self.stack[at] = Value::with_id(Tag::ARRAY, id);
            }
            Op::Wrap => {
                self.discard(args[0])?;
                let id = self.ids.mint();
                self.stack.push(Value::with_id(Tag::ARRAY, id));
            }
            Op::Text => {
                let v = self.pop("pop")?;
                if !v.must_be(Tag::OFFSET) {
                    return Err(OptError::BadText { rule: self.rule.to_string() });
                }
                self.stack.push(Value::new(Tag::STRING));
            }
            Op::Pluck => {
                let n = args[0];
                let k = args[1];
                if k < 0 || args.len() != 2 + k as usize {
                    return Err(OptError::MalformedTree {
                        rule: self.rule.to_string(),
                        reason: "pluck argument count",
                    });
                }
                let mut picked: SmallVec<[Value; 4]> = SmallVec::new();
                for &p in &args[2..] {
                    picked.push(self.inspect(p)?);
                }
                self.discard(n)?;
                if k == 1 {
                    self.stack.push(picked[0]);
                } else {
                    let id = self.ids.mint();
                    self.stack.push(Value::with_id(Tag::ARRAY, id));
                }
            }
            Op::AcceptN | Op::AcceptString => {
                self.advance();
                self.stack.push(Value::new(Tag::STRING));
            }
            Op::Fail => self.stack.push(Value::new(Tag::FAILED)),
            Op::SilentFailsOn => self.silent_fails += 1,
            Op::SilentFailsOff => self.silent_fails = self.silent_fails.saturating_sub(1),
            Op::Call => {
                for &p in &args[3..] {
                    self.inspect(p)?;
                }
                self.discard(args[1])?;
                self.advance();
                self.stack.push(Value::new(Tag::ANY));
            }
            Op::Rule => {
                self.advance();
                let hint = usize::try_from(args[0])
                    .ok()
                    .and_then(|r| self.hints.map(|h| h.hint(r)))
                    .unwrap_or_default();
                let tag = match hint {
                    MatchHint::Always => Tag::ANY.without(Tag::FAILED),
                    MatchHint::Never => Tag::FAILED,
                    MatchHint::Unknown => Tag::ANY,
                };
                self.stack.push(Value::new(tag));
            }
            Op::LoadSavedPos => {
                self.inspect(args[0])?;
            }
            Op::UpdateSavedPos
            | Op::SourceMapPush
            | Op::SourceMapPop
            | Op::SourceMapLabelPush
            | Op::SourceMapLabelPop => {}
            _ => {
                return Err(OptError::MalformedTree {
                    rule: self.rule.to_string(),
                    reason: "structured opcode in a flat element",
                })
            }
        }
        Ok(())
    }

    fn interp_condition<V: Visitor>(
        &mut self,
        block: &mut Block,
        ip: usize,
        vis: &mut V,
    ) -> Result<InterpResult<'a>, OptError> {
        let Instr::Cond { op, .. } = &block[ip] else { unreachable!() };
        let classifier: Option<Classifier> = match op {
            Op::If => Some(classify_if),
            Op::IfError => Some(classify_if_error),
            Op::IfNotError => Some(classify_if_not_error),
            _ => None,
        };
        self.interp_condition_with(block, ip, vis, classifier)
    }

    /// Conditional transfer with an explicit classifier, exposed so tests
    /// can force contradictory verdicts.
    pub fn interp_condition_with<V: Visitor>(
        &mut self,
        block: &mut Block,
        ip: usize,
        vis: &mut V,
        classifier: Option<Classifier>,
    ) -> Result<InterpResult<'a>, OptError> {
        let Instr::Cond { op, .. } = &block[ip] else { unreachable!() };
        let op = *op;
        if cond_peeks_stack(op) && self.stack.is_empty() {
            return Err(self.underflow("condition"));
        }

        let mut then_refined = None;
        let mut else_refined = None;
        if let Some(classify) = classifier {
            let top = *self.stack.last().expect("classifier conditionals peek the stack");
            let (then_only, then_ref) = classify(top, true);
            let (else_only, else_ref) = classify(top, false);
            if then_only && else_only {
                return Err(OptError::ImpossibleConditional { rule: self.rule.to_string() });
            }
            if then_only || else_only {
                let refined = if then_only { then_ref } else { else_ref };
                if let Some(tag) = refined {
                    self.stack.last_mut().unwrap().tag = tag;
                }
                return self.run_single_branch(block, ip, vis, then_only);
            }
            then_refined = then_ref;
            else_refined = else_ref;
        }

        let mut then_state = self.clone();
        if let Some(tag) = then_refined {
            then_state.stack.last_mut().unwrap().tag = tag;
        }
        if let Some(tag) = else_refined {
            self.stack.last_mut().unwrap().tag = tag;
        }

        let (then_rr, else_rr, else_is_empty) = {
            let Instr::Cond { then_block, else_block, .. } = &mut block[ip] else {
                unreachable!()
            };
            let then_rr = then_state.run_from(then_block, 0, vis)?;
            let else_rr = self.run_from(else_block, 0, vis)?;
            (then_rr, else_rr, else_block.is_empty())
        };

        // An empty else with a deeper then side is the conditional-push
        // pattern; the extra values exist on the then path only.
        let mut then_cs = then_rr.cond_state;
        if else_is_empty && then_state.stack.len() > self.stack.len() {
            then_state.stack.truncate(self.stack.len());
            // any nested snapshots still carry the deeper stacks
            then_cs = None;
        }

        let else_snapshot = self.clone();
        self.merge(&then_state)?;
        let changed = then_rr.changed || else_rr.changed;
        let cond_state = CondState::Split(
            Box::new(then_cs.unwrap_or(CondState::Leaf(then_state))),
            Box::new(else_rr.cond_state.unwrap_or(CondState::Leaf(else_snapshot))),
        );
        Ok(InterpResult {
            next_ip: ip + 1,
            cond_state: Some(cond_state),
            rewrite: changed.then_some(Rewrite::Touched),
        })
    }

    /// Only one side of the conditional is reachable: run it in place and,
    /// on the settled pass, splice it over the conditional.
    fn run_single_branch<V: Visitor>(
        &mut self,
        block: &mut Block,
        ip: usize,
        vis: &mut V,
        then_side: bool,
    ) -> Result<InterpResult<'a>, OptError> {
        if self.looping == 0 {
            let mut branch = {
                let Instr::Cond { then_block, else_block, .. } = &mut block[ip] else {
                    unreachable!()
                };
                std::mem::take(if then_side { then_block } else { else_block })
            };
            let rr = self.run_from(&mut branch, 0, vis)?;
            let next_ip = ip + branch.len();
            Ok(InterpResult {
                next_ip,
                cond_state: rr.cond_state,
                rewrite: Some(Rewrite::Splice { at: ip, len: 1, with: branch }),
            })
        } else {
            let rr = {
                let Instr::Cond { then_block, else_block, .. } = &mut block[ip] else {
                    unreachable!()
                };
                let branch = if then_side { then_block } else { else_block };
                self.run_from(branch, 0, vis)?
            };
            Ok(InterpResult { next_ip: ip + 1, cond_state: rr.cond_state, rewrite: None })
        }
    }

    fn interp_loop<V: Visitor>(
        &mut self,
        block: &mut Block,
        ip: usize,
        vis: &mut V,
    ) -> Result<InterpResult<'a>, OptError> {
        let top = match self.stack.last() {
            Some(v) => *v,
            None => return Err(self.underflow("loop condition")),
        };
        if top.must_be(Tag::FAILED) {
            // the body can never run
            if self.looping == 0 {
                return Ok(InterpResult {
                    next_ip: ip,
                    cond_state: None,
                    rewrite: Some(Rewrite::Splice { at: ip, len: 1, with: Vec::new() }),
                });
            }
            return Ok(InterpResult::fallthrough(ip));
        }

        self.looping += 1;
        let mut saved = self.clone();
        let mut rounds: u32 = 0;
        loop {
            {
                let Instr::Loop { body } = &mut block[ip] else { unreachable!() };
                self.run_from(body, 0, vis)?;
            }
            self.merge(&saved)?;
            if self.equal(&saved) {
                break;
            }
            saved = self.clone();
            rounds += 1;
            assert!(
                rounds <= 7 * self.stack.len() as u32 + 8,
                "loop analysis did not converge in rule {}",
                self.rule
            );
        }
        self.looping -= 1;

        // One more pass with rewrites enabled to realize what the fixpoint
        // discovered; merging `saved` back keeps the zero-iteration path.
        let final_rr = {
            let Instr::Loop { body } = &mut block[ip] else { unreachable!() };
            self.run_from(body, 0, vis)?
        };
        self.merge(&saved)?;
        Ok(InterpResult {
            next_ip: ip + 1,
            cond_state: None,
            rewrite: final_rr.changed.then_some(Rewrite::Touched),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::tree::format;

    fn state(rule: &'static str) -> State<'static> {
        State::new(rule, None)
    }

    #[test]
    fn test_pop_on_empty_stack_names_the_rule() {
        let mut st = state("digits");
        let mut block = format("digits", &[Op::Pop.code()]).unwrap();
        let err = st.run(&mut block, &mut NoVisitor).unwrap_err();
        assert_eq!(
            err,
            OptError::StackUnderflow { rule: "digits".to_string(), what: "pop" }
        );
    }

    #[test]
    fn test_pluck_negative_discard() {
        let mut st = state("r");
        st.stack.push(Value::new(Tag::NULL));
        let err = st.interp_flat(Op::Pluck, &[-1, 1, 0]).unwrap_err();
        assert_eq!(err, OptError::StackUnderflow { rule: "r".to_string(), what: "discard" });
    }

    #[test]
    fn test_merge_depth_mismatch() {
        let mut a = state("r");
        let mut b = a.clone();
        a.stack.push(Value::new(Tag::NULL));
        b.stack.push(Value::new(Tag::NULL));
        b.stack.push(Value::new(Tag::STRING));
        let err = a.merge(&b).unwrap_err();
        assert!(matches!(err, OptError::StackMismatch { then_depth: 2, else_depth: 1, .. }));
    }

    #[test]
    fn test_merge_symmetry() {
        let mut a = state("r");
        let mut b = a.clone();
        a.stack.push(Value::new(Tag::STRING));
        a.stack.push(a.curr_pos);
        b.stack.push(Value::new(Tag::FAILED));
        b.stack.push(b.curr_pos);

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert!(ab.equal(&ba));
    }

    #[test]
    fn test_equal_ignores_curr_pos() {
        let mut a = state("r");
        let mut b = a.clone();
        b.advance();
        assert!(a.equal(&b));
        a.stack.push(Value::new(Tag::NULL));
        assert!(!a.equal(&b));
    }

    #[test]
    fn test_impossible_conditional() {
        let mut st = state("r");
        st.stack.push(Value::new(Tag::NULL));
        let mut block = vec![Instr::Cond {
            op: Op::If,
            arg: None,
            then_block: vec![Instr::flat(Op::Pop)],
            else_block: vec![Instr::flat(Op::Pop)],
        }];
        let contradiction: Classifier = |_, _| (true, None);
        let err = st
            .interp_condition_with(&mut block, 0, &mut NoVisitor, Some(contradiction))
            .unwrap_err();
        assert_eq!(err, OptError::ImpossibleConditional { rule: "r".to_string() });
    }

    #[test]
    fn test_loop_fixpoint_converges() {
        // body replaces the flag with a wider type every iteration
        let mut st = state("r");
        let mut block = format(
            "r",
            &[
                Op::PushEmptyString.code(),
                Op::WhileNotError.code(),
                3,
                Op::Pop.code(),
                Op::Rule.code(),
                0,
            ],
        )
        .unwrap();
        st.run(&mut block, &mut NoVisitor).unwrap();
        assert_eq!(st.stack.len(), 1);
        assert_eq!(st.stack[0].tag, Tag::ANY);
    }

    #[test]
    fn test_rule_hints_shape_the_pushed_value() {
        let hints = RuleHints::from_signums(&[1, -1, 0]);
        let mut st = State::new("r", Some(&hints));
        st.interp_flat(Op::Rule, &[0]).unwrap();
        st.interp_flat(Op::Rule, &[1]).unwrap();
        st.interp_flat(Op::Rule, &[2]).unwrap();
        assert_eq!(st.stack[0].tag, Tag::ANY.without(Tag::FAILED));
        assert_eq!(st.stack[1].tag, Tag::FAILED);
        assert_eq!(st.stack[2].tag, Tag::ANY);
    }

    #[test]
    fn test_conditional_push_pattern_truncates() {
        // IF_ERROR pushes a default only on the error path
        let mut st = state("r");
        st.stack.push(Value::new(Tag::FAILED | Tag::STRING));
        let mut block = format(
            "r",
            &[Op::IfError.code(), 1, 0, Op::PushNull.code()],
        )
        .unwrap();
        let res = st.interp(&mut block, 0, &mut NoVisitor).unwrap();
        assert_eq!(st.stack.len(), 1);
        assert!(res.cond_state.is_some());
    }
}
