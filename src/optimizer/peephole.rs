//! The peephole rewrite rules, expressed as an interpreter visitor.
//!
//! Every rewrite is conservative: a splice replaces a range with code whose
//! abstract pre- and post-state match the removed range, and the visitor
//! adjusts the interpreter state so resuming at `next_ip` observes exactly
//! what an untouched run would have.

use smallvec::SmallVec;

use crate::opcodes::{CurrPosUse, Op};
use crate::optimizer::interp::{InterpResult, NoVisitor, Rewrite, State, Visitor};
use crate::optimizer::tree::{Block, Instr};
use crate::optimizer::types::{Tag, Value};
use crate::optimizer::OptError;

/// The rewrite visitor installed by the driver.
pub struct Peephole;

impl Visitor for Peephole {
    fn pre_interp<'a>(
        &mut self,
        state: &mut State<'a>,
        block: &mut Block,
        ip: usize,
    ) -> Result<Option<InterpResult<'a>>, OptError> {
        Ok(pre_rewrite(state, block, ip))
    }

    fn post_interp<'a>(
        &mut self,
        state: &mut State<'a>,
        block: &mut Block,
        ip: usize,
        res: &mut InterpResult<'a>,
    ) -> Result<(), OptError> {
        post_rewrite(state, block, ip, res)
    }
}

/// A splice request that re-examines the spliced-in code.
fn splice<'a>(at: usize, len: usize, with: Vec<Instr>) -> InterpResult<'a> {
    InterpResult { next_ip: at, cond_state: None, rewrite: Some(Rewrite::Splice { at, len, with }) }
}

fn is_op(instr: &Instr, op: Op) -> bool {
    instr.flat_op() == Some(op)
}

/// An op that throws away the top of the stack without looking at it.
fn is_slot_killer(instr: &Instr) -> bool {
    match instr {
        Instr::Flat { op: Op::Pop, .. } => true,
        Instr::Flat { op: Op::PopN, args } => args[0] > 0,
        _ => false,
    }
}

/// The pushes whose only observable effect besides the new slot happens
/// regardless of where the slot ends up, so they commute with a NIP.
fn is_push_like(instr: &Instr) -> bool {
    match instr.flat_op() {
        Some(op) => {
            op.is_pure_push()
                || matches!(op, Op::Rule | Op::AcceptN | Op::AcceptString | Op::Fail)
        }
        None => false,
    }
}

/// Net stack shrinkage of a block made only of discards, or `None`.
fn pops_only_delta(block: &Block) -> Option<i32> {
    let mut total = 0i32;
    for instr in block {
        match instr {
            Instr::Flat { op: Op::Pop | Op::Nip, .. } => total += 1,
            Instr::Flat { op: Op::PopN, args } if args[0] >= 0 => total += args[0],
            _ => return None,
        }
    }
    Some(total)
}

/// A block that is safe to duplicate across branches: discards, at most one
/// constant push, at most one single-pick pluck, no net growth.
fn cheap_block(block: &Block) -> bool {
    let mut pushes = 0;
    let mut plucks = 0;
    let mut delta = 0i32;
    for instr in block {
        match instr {
            Instr::Flat { op: Op::Pop | Op::Nip, .. } => delta -= 1,
            Instr::Flat { op: Op::PopN, args } => {
                if args[0] < 0 {
                    return false;
                }
                delta -= args[0];
            }
            Instr::Flat { op, .. } if op.is_pure_push() => {
                pushes += 1;
                delta += 1;
            }
            Instr::Flat { op: Op::Pluck, args } if args[1] == 1 && args[0] >= 1 => {
                plucks += 1;
                delta += 1 - args[0];
            }
            _ => return false,
        }
    }
    pushes <= 1 && plucks <= 1 && delta <= 0
}

fn pre_rewrite<'a>(state: &State<'a>, block: &Block, ip: usize) -> Option<InterpResult<'a>> {
    let cur = &block[ip];

    // placeholder no-ops left by the dead-slot pass
    if let Instr::Flat { op: Op::PopN, args } = cur {
        if args[0] == 0 {
            return Some(splice(ip, 1, vec![]));
        }
    }

    // POP_CURR_POS of the value that already is the cursor
    if is_op(cur, Op::PopCurrPos) {
        if let Some(top) = state.stack.last() {
            if top.id.is_some() && top.id == state.curr_pos.id {
                return Some(splice(ip, 1, vec![Instr::flat(Op::Pop)]));
            }
        }
    }

    // a conditional whose branches only discard, identically, is its else
    if let Instr::Cond { then_block, else_block, .. } = cur {
        if let (Some(dt), Some(de)) = (pops_only_delta(then_block), pops_only_delta(else_block)) {
            if dt == de {
                return Some(splice(ip, 1, else_block.clone()));
            }
        }
    }

    let next = block.get(ip + 1)?;

    if is_op(next, Op::Nip) {
        // the new slot was about to be nipped: discard first, push cleanly
        if is_push_like(cur) {
            return Some(splice(ip, 2, vec![Instr::flat(Op::Pop), cur.clone()]));
        }
        // CALL absorbs the NIP into its discard count
        if let Instr::Flat { op: Op::Call, args } = cur {
            let mut args = args.clone();
            args[1] += 1;
            return Some(splice(ip, 2, vec![Instr::Flat { op: Op::Call, args }]));
        }
        // TEXT commutes with removing a slot below its input
        if is_op(cur, Op::Text) {
            return Some(splice(ip, 2, vec![Instr::flat(Op::Nip), Instr::flat(Op::Text)]));
        }
        if let Instr::Flat { op: Op::Wrap, args } = cur {
            let n = args[0];
            if n == 1 {
                return Some(splice(
                    ip,
                    2,
                    vec![Instr::flat(Op::Nip), Instr::flat1(Op::Wrap, 1)],
                ));
            }
            if n > 1 {
                // wrap-then-nip is a pluck that also drops the nipped slot
                let mut args: SmallVec<[i32; 2]> = SmallVec::new();
                args.push(n + 1);
                args.push(n);
                for p in (0..n).rev() {
                    args.push(p);
                }
                return Some(splice(ip, 2, vec![Instr::Flat { op: Op::Pluck, args }]));
            }
        }
    }

    if is_slot_killer(next) {
        // TEXT's only effect besides its output is stack shape
        if is_op(cur, Op::Text) {
            return Some(splice(ip, 1, vec![]));
        }
        // the nipped-over slot dies right after anyway
        if is_op(cur, Op::Nip) {
            return Some(splice(ip, 1, vec![Instr::flat(Op::Pop)]));
        }
        if let Instr::Flat { op: Op::Wrap | Op::Pluck, args } = cur {
            let n = args[0];
            if n == 0 {
                return Some(splice(ip, 1, vec![Instr::flat(Op::PushNull)]));
            }
            if n == 1 {
                return Some(splice(ip, 1, vec![]));
            }
            if n > 1 {
                return Some(splice(ip, 1, vec![Instr::pop_n(n - 1)]));
            }
        }
    }

    // POP then re-push of the kind already on top, for the singleton kinds
    if is_op(cur, Op::Pop) {
        let singleton = match next.flat_op() {
            Some(Op::PushNull) => Some(Tag::NULL),
            Some(Op::PushUndefined) => Some(Tag::UNDEFINED),
            Some(Op::PushFailed) => Some(Tag::FAILED),
            _ => None,
        };
        if let (Some(tag), Some(top)) = (singleton, state.stack.last()) {
            if top.must_be(tag) {
                return Some(splice(ip, 2, vec![]));
            }
        }
    }

    None
}

fn post_rewrite<'a>(
    state: &mut State<'a>,
    block: &mut Block,
    ip: usize,
    res: &mut InterpResult<'a>,
) -> Result<(), OptError> {
    if res.rewrite.is_some() {
        return Ok(());
    }

    if res.cond_state.is_some() {
        return fuse_after_conditional(state, block, ip, res);
    }

    let cur_op = match block[ip].flat_op() {
        Some(op) => op,
        None => return Ok(()),
    };

    // dead push: a pure push (or an unrecordable FAIL) feeding a discard
    if cur_op.is_pure_push() || (cur_op == Op::Fail && state.silent_fails > 0) {
        if let Some(next) = block.get(ip + 1) {
            if is_op(next, Op::Pop) {
                state.stack.pop();
                *res = splice(ip, 2, vec![]);
                return Ok(());
            }
            if let Instr::Flat { op: Op::PopN, args } = next {
                let k = args[0];
                if k >= 1 {
                    state.stack.pop();
                    let with = if k == 1 { vec![] } else { vec![Instr::pop_n(k - 1)] };
                    *res = splice(ip, 2, with);
                    return Ok(());
                }
            }
        }
    }

    // a failure the VM would not record
    if cur_op == Op::Fail && state.silent_fails > 0 {
        block[ip] = Instr::flat(Op::PushFailed);
        res.rewrite = Some(Rewrite::Touched);
        return Ok(());
    }

    // a cursor overwrite nothing reads before the next overwrite
    if cur_op == Op::PopCurrPos && curr_pos_dead_after(block, ip + 1) {
        block[ip] = Instr::flat(Op::Pop);
        res.rewrite = Some(Rewrite::Touched);
        return Ok(());
    }

    // silence markers nested inside an already silent region
    if cur_op == Op::SilentFailsOn && state.silent_fails > 1 {
        *res = splice(ip, 1, vec![]);
        return Ok(());
    }
    if cur_op == Op::SilentFailsOff && state.silent_fails > 0 {
        *res = splice(ip, 1, vec![]);
        return Ok(());
    }

    Ok(())
}

/// The cursor is dead when the rest of the block overwrites it before any
/// read. Structured control flow and the block end count as reads.
fn curr_pos_dead_after(block: &Block, from: usize) -> bool {
    for instr in &block[from..] {
        match instr {
            Instr::Flat { op, .. } => match op.curr_pos_use() {
                CurrPosUse::Read => return false,
                CurrPosUse::Write => return true,
                CurrPosUse::None => {}
            },
            _ => return false,
        }
    }
    false
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum Side {
    Then,
    Else,
    Unknown,
}

/// How a branch's abstract top relates to the conditional that follows.
fn classify_side(op: Op, top: Value) -> Side {
    match op {
        Op::If => {
            if top.must_be_true() {
                Side::Then
            } else if top.must_be_false() {
                Side::Else
            } else {
                Side::Unknown
            }
        }
        Op::IfError => {
            if top.must_be(Tag::FAILED) {
                Side::Then
            } else if !top.could_be(Tag::FAILED) {
                Side::Else
            } else {
                Side::Unknown
            }
        }
        Op::IfNotError => {
            if top.must_be(Tag::FAILED) {
                Side::Else
            } else if !top.could_be(Tag::FAILED) {
                Side::Then
            } else {
                Side::Unknown
            }
        }
        _ => Side::Unknown,
    }
}

fn fuse_after_conditional<'a>(
    state: &mut State<'a>,
    block: &mut Block,
    ip: usize,
    res: &mut InterpResult<'a>,
) -> Result<(), OptError> {
    if ip + 1 >= block.len() {
        return Ok(());
    }
    match &block[ip + 1] {
        Instr::Cond { op: Op::If | Op::IfError | Op::IfNotError, .. } => {
            fuse_conditional_pair(state, block, ip, res)
        }
        Instr::Loop { .. } => fuse_trailing_loop(state, block, ip, res),
        Instr::Flat { op: Op::Pop | Op::PopN | Op::Nip, .. } => {
            sink_pop_chain(state, block, ip, res)
        }
        _ => Ok(()),
    }
}

/// Replaces the outer state with the join of the updated terminal states
/// and deletes the fused element.
fn finish_fusion<'a>(
    state: &mut State<'a>,
    leaf_states: Vec<State<'a>>,
    at: usize,
    len: usize,
    res: &mut InterpResult<'a>,
) -> Result<(), OptError> {
    let mut iter = leaf_states.into_iter();
    let mut merged = iter.next().expect("a conditional has at least two terminals");
    for leaf in iter {
        merged.merge(&leaf)?;
    }
    state.stack = merged.stack;
    state.curr_pos = merged.curr_pos;
    state.silent_fails = merged.silent_fails;
    res.rewrite = Some(Rewrite::Splice { at, len, with: Vec::new() });
    res.next_ip = at;
    res.cond_state = None;
    Ok(())
}

/// Merges a following IF-family conditional into the conditional that
/// produced its input, specializing every terminal whose top already
/// decides the branch.
fn fuse_conditional_pair<'a>(
    state: &mut State<'a>,
    block: &mut Block,
    ip: usize,
    res: &mut InterpResult<'a>,
) -> Result<(), OptError> {
    let Instr::Cond { op: next_op, .. } = &block[ip + 1] else { unreachable!() };
    let next_op = *next_op;

    let depth = state.stack.len();
    let cs = res.cond_state.as_ref().expect("checked by the caller");
    let mut then_copies = 0usize;
    let mut else_copies = 0usize;
    let mut unknown = 0usize;
    let mut skewed = false;
    let shape_ok = cs.for_each_terminal(&block[ip], &mut |leaf| {
        if leaf.stack.len() != depth {
            skewed = true;
            return;
        }
        match leaf.stack.last() {
            None => skewed = true,
            Some(top) => match classify_side(next_op, *top) {
                Side::Then => then_copies += 1,
                Side::Else => else_copies += 1,
                Side::Unknown => unknown += 1,
            },
        }
    });
    if !shape_ok || skewed {
        return Ok(());
    }

    let (cheap_then, cheap_else) = {
        let Instr::Cond { then_block, else_block, .. } = &block[ip + 1] else { unreachable!() };
        (cheap_block(then_block), cheap_block(else_block))
    };
    let limit = if unknown > 0 { 0 } else { 1 };
    if !(cheap_then || then_copies + unknown <= limit) {
        return Ok(());
    }
    if !(cheap_else || else_copies + unknown <= limit) {
        return Ok(());
    }

    let next_elem = block[ip + 1].clone();
    let (inline_then, inline_else) = match &next_elem {
        Instr::Cond { then_block, else_block, .. } => (then_block.clone(), else_block.clone()),
        _ => unreachable!(),
    };

    let mut leaf_states: Vec<State<'a>> = Vec::new();
    let cs = res.cond_state.as_mut().expect("checked above");
    let done = cs.try_for_each_terminal(&mut block[ip], &mut |leaf, blk| {
        let top = *leaf.stack.last().expect("checked by the dry pass");
        let start = blk.len();
        match classify_side(next_op, top) {
            Side::Then => blk.extend(inline_then.iter().cloned()),
            Side::Else => blk.extend(inline_else.iter().cloned()),
            Side::Unknown => blk.push(next_elem.clone()),
        }
        leaf.run_from(blk, start, &mut NoVisitor)?;
        leaf_states.push(leaf.clone());
        Ok(())
    })?;
    debug_assert!(done, "terminal shape changed between the dry and write passes");

    finish_fusion(state, leaf_states, ip + 1, 1, res)
}

/// A loop after a conditional: paths whose top is already the failure
/// sentinel skip it entirely; at most one surviving path may carry it.
fn fuse_trailing_loop<'a>(
    state: &mut State<'a>,
    block: &mut Block,
    ip: usize,
    res: &mut InterpResult<'a>,
) -> Result<(), OptError> {
    let depth = state.stack.len();
    let cs = res.cond_state.as_ref().expect("checked by the caller");
    let mut live = 0usize;
    let mut skewed = false;
    let shape_ok = cs.for_each_terminal(&block[ip], &mut |leaf| {
        if leaf.stack.len() != depth {
            skewed = true;
            return;
        }
        match leaf.stack.last() {
            None => skewed = true,
            Some(top) => {
                if !top.must_be(Tag::FAILED) {
                    live += 1;
                }
            }
        }
    });
    if !shape_ok || skewed || live > 1 {
        return Ok(());
    }

    let loop_elem = block[ip + 1].clone();
    let mut leaf_states: Vec<State<'a>> = Vec::new();
    let cs = res.cond_state.as_mut().expect("checked above");
    let done = cs.try_for_each_terminal(&mut block[ip], &mut |leaf, blk| {
        let top = *leaf.stack.last().expect("checked by the dry pass");
        if !top.must_be(Tag::FAILED) {
            let start = blk.len();
            blk.push(loop_elem.clone());
            leaf.run_from(blk, start, &mut NoVisitor)?;
        }
        leaf_states.push(leaf.clone());
        Ok(())
    })?;
    debug_assert!(done, "terminal shape changed between the dry and write passes");

    finish_fusion(state, leaf_states, ip + 1, 1, res)
}

/// Pushes a contiguous run of discards into every terminal of the
/// conditional so per-branch rewrites can see them.
fn sink_pop_chain<'a>(
    state: &mut State<'a>,
    block: &mut Block,
    ip: usize,
    res: &mut InterpResult<'a>,
) -> Result<(), OptError> {
    let mut end = ip + 1;
    while end < block.len()
        && matches!(&block[end], Instr::Flat { op: Op::Pop | Op::PopN | Op::Nip, .. })
    {
        end += 1;
    }
    let chain: Vec<Instr> = block[ip + 1..end].to_vec();

    let depth = state.stack.len();
    let cs = res.cond_state.as_ref().expect("checked by the caller");
    let mut skewed = false;
    let shape_ok = cs.for_each_terminal(&block[ip], &mut |leaf| {
        skewed |= leaf.stack.len() != depth;
    });
    if !shape_ok || skewed {
        return Ok(());
    }

    let mut leaf_states: Vec<State<'a>> = Vec::new();
    let cs = res.cond_state.as_mut().expect("checked above");
    let done = cs.try_for_each_terminal(&mut block[ip], &mut |leaf, blk| {
        let start = blk.len();
        blk.extend(chain.iter().cloned());
        leaf.run_from(blk, start, &mut NoVisitor)?;
        leaf_states.push(leaf.clone());
        Ok(())
    })?;
    debug_assert!(done, "terminal shape changed between the dry and write passes");

    finish_fusion(state, leaf_states, ip + 1, end - (ip + 1), res)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cheap_block() {
        assert!(cheap_block(&vec![]));
        assert!(cheap_block(&vec![Instr::flat(Op::Pop), Instr::flat(Op::PushNull)]));
        assert!(cheap_block(&vec![Instr::Flat {
            op: Op::Pluck,
            args: smallvec::smallvec![2, 1, 0],
        }]));
        // two pushes, or net growth, are not cheap
        assert!(!cheap_block(&vec![
            Instr::flat(Op::PushNull),
            Instr::flat(Op::PushNull),
            Instr::pop_n(2),
        ]));
        assert!(!cheap_block(&vec![Instr::flat(Op::PushNull)]));
        assert!(!cheap_block(&vec![Instr::flat1(Op::AcceptN, 1)]));
    }

    #[test]
    fn test_pops_only_delta() {
        assert_eq!(pops_only_delta(&vec![]), Some(0));
        assert_eq!(
            pops_only_delta(&vec![Instr::flat(Op::Pop), Instr::pop_n(3), Instr::flat(Op::Nip)]),
            Some(5)
        );
        assert_eq!(pops_only_delta(&vec![Instr::flat(Op::PushNull)]), None);
    }
}
