//! Second-pass dataflow that removes stack slots nothing ever looks at.
//!
//! One traversal runs a symbolic stack of slot tokens, remembering for each
//! token who produced it, who consumed it and whether anything read its
//! value. A slot is removable when its producers are pure, every consumer
//! is a plain discard at the same loop depth, and it never crosses a loop
//! boundary or survives to the end of the rule. A second traversal, driven
//! by the same stable site numbering, rewrites producers into their discard
//! equivalents and shrinks the consumers. Rewritten producers that become
//! empty are left as `POP_N 0` placeholders for the peephole pass to sweep,
//! which keeps the site numbering stable while this pass runs.

use rustc_hash::{FxHashMap as HashMap, FxHashSet as HashSet};
use smallvec::SmallVec;

use crate::opcodes::Op;
use crate::optimizer::interp::cond_peeks_stack;
use crate::optimizer::tree::{Block, Instr};
use crate::optimizer::OptError;

pub(crate) fn remove_dead_slots(rule: &str, block: &mut Block) -> Result<bool, OptError> {
    let mut analysis = Analysis { rule, tokens: Vec::new(), site: 0 };
    let mut stack: Vec<usize> = Vec::new();
    analysis.walk_block(&mut stack, block, 0)?;
    // whatever is still on the stack is the rule's result
    for &t in &stack {
        analysis.tokens[t].escaped = true;
    }
    let (dead, debits) = analysis.settle();

    let mut changed = false;
    if !dead.is_empty() {
        let mut site = 0u32;
        rewrite_block(block, &mut site, &dead, &debits, &mut changed);
    }
    changed |= collapse_silent_regions(block);
    Ok(changed)
}

struct TokenInfo {
    /// Sites of the pure producers that can push this token.
    producers: SmallVec<[u32; 2]>,
    /// Sites of the discards that consumed it.
    consumers: SmallVec<[u32; 2]>,
    inspected: bool,
    /// Produced by an instruction with effects beyond the push.
    pinned: bool,
    /// Crossed a loop boundary or survived to the end of the rule.
    escaped: bool,
    /// Loop nesting depth at production.
    birth: u32,
}

struct Analysis<'a> {
    rule: &'a str,
    tokens: Vec<TokenInfo>,
    site: u32,
}

impl<'a> Analysis<'a> {
    fn underflow(&self, what: &'static str) -> OptError {
        OptError::StackUnderflow { rule: self.rule.to_string(), what }
    }

    fn produce(&mut self, site: u32, depth: u32, pinned: bool) -> usize {
        self.tokens.push(TokenInfo {
            producers: if pinned { SmallVec::new() } else { SmallVec::from_slice(&[site]) },
            consumers: SmallVec::new(),
            inspected: false,
            pinned,
            escaped: false,
            birth: depth,
        });
        self.tokens.len() - 1
    }

    fn inspect(&mut self, token: usize) {
        self.tokens[token].inspected = true;
    }

    fn discard(&mut self, token: usize, site: u32, depth: u32) {
        let info = &mut self.tokens[token];
        if info.birth == depth {
            info.consumers.push(site);
        } else {
            // iteration-count dependent; treat like a read
            info.inspected = true;
        }
    }

    fn merge_tokens(&mut self, a: usize, b: usize, depth: u32) -> usize {
        if a == b {
            return a;
        }
        let ta = &self.tokens[a];
        let tb = &self.tokens[b];
        let mut producers = ta.producers.clone();
        for &p in &tb.producers {
            if !producers.contains(&p) {
                producers.push(p);
            }
        }
        let info = TokenInfo {
            producers,
            consumers: SmallVec::new(),
            inspected: ta.inspected || tb.inspected,
            pinned: ta.pinned || tb.pinned,
            escaped: ta.escaped || tb.escaped,
            birth: depth,
        };
        self.tokens.push(info);
        self.tokens.len() - 1
    }

    fn walk_block(
        &mut self,
        stack: &mut Vec<usize>,
        block: &Block,
        depth: u32,
    ) -> Result<(), OptError> {
        for instr in block {
            let site = self.site;
            self.site += 1;
            match instr {
                Instr::Flat { op, args } => self.walk_flat(stack, *op, args, site, depth)?,
                Instr::Cond { op, then_block, else_block, .. } => {
                    if cond_peeks_stack(*op) {
                        match stack.last() {
                            Some(&t) => self.inspect(t),
                            None => return Err(self.underflow("condition")),
                        }
                    }
                    let mut then_stack = stack.clone();
                    self.walk_block(&mut then_stack, then_block, depth)?;
                    self.walk_block(stack, else_block, depth)?;
                    if else_block.is_empty() && then_stack.len() > stack.len() {
                        for &t in &then_stack[stack.len()..] {
                            self.tokens[t].escaped = true;
                        }
                        then_stack.truncate(stack.len());
                    }
                    if then_stack.len() != stack.len() {
                        return Err(OptError::StackMismatch {
                            rule: self.rule.to_string(),
                            then_depth: then_stack.len(),
                            else_depth: stack.len(),
                        });
                    }
                    for i in 0..stack.len() {
                        stack[i] = self.merge_tokens(then_stack[i], stack[i], depth);
                    }
                }
                Instr::Loop { body } => {
                    match stack.last() {
                        Some(&t) => self.inspect(t),
                        None => return Err(self.underflow("loop condition")),
                    }
                    let entry = stack.clone();
                    self.walk_block(stack, body, depth + 1)?;
                    if stack.len() != entry.len() {
                        return Err(OptError::StackMismatch {
                            rule: self.rule.to_string(),
                            then_depth: stack.len(),
                            else_depth: entry.len(),
                        });
                    }
                    for i in 0..stack.len() {
                        if self.tokens[stack[i]].birth > depth {
                            // flows from one iteration into the next
                            self.tokens[stack[i]].escaped = true;
                        }
                        stack[i] = self.merge_tokens(stack[i], entry[i], depth);
                    }
                }
            }
        }
        self.site += 1;
        Ok(())
    }

    fn walk_flat(
        &mut self,
        stack: &mut Vec<usize>,
        op: Op,
        args: &[i32],
        site: u32,
        depth: u32,
    ) -> Result<(), OptError> {
        match op {
            Op::PushEmptyString
            | Op::PushUndefined
            | Op::PushNull
            | Op::PushFailed
            | Op::PushEmptyArray
            | Op::PushCurrPos => {
                let t = self.produce(site, depth, false);
                stack.push(t);
            }
            Op::AcceptN | Op::AcceptString | Op::Fail | Op::Rule => {
                let t = self.produce(site, depth, true);
                stack.push(t);
            }
            Op::Pop => {
                let t = stack.pop().ok_or_else(|| self.underflow("pop"))?;
                self.discard(t, site, depth);
            }
            Op::PopN => {
                let n = args[0];
                if n < 0 || n as usize > stack.len() {
                    return Err(self.underflow("discard"));
                }
                for _ in 0..n {
                    let t = stack.pop().unwrap();
                    self.discard(t, site, depth);
                }
            }
            Op::Nip => {
                if stack.len() < 2 {
                    return Err(self.underflow("nip"));
                }
                let t = stack.remove(stack.len() - 2);
                self.discard(t, site, depth);
            }
            Op::PopCurrPos => {
                let t = stack.pop().ok_or_else(|| self.underflow("pop"))?;
                self.inspect(t);
            }
            Op::Append => {
                let t = stack.pop().ok_or_else(|| self.underflow("pop"))?;
                self.inspect(t);
                match stack.last() {
                    Some(&arr) => self.inspect(arr),
                    None => return Err(self.underflow("pop")),
                }
            }
            Op::Wrap => {
                let n = args[0];
                if n < 0 || n as usize > stack.len() {
                    return Err(self.underflow("discard"));
                }
                for _ in 0..n {
                    let t = stack.pop().unwrap();
                    self.inspect(t);
                }
                let t = self.produce(site, depth, false);
                stack.push(t);
            }
            Op::Text => {
                let t = stack.pop().ok_or_else(|| self.underflow("pop"))?;
                self.inspect(t);
                let t = self.produce(site, depth, false);
                stack.push(t);
            }
            Op::Pluck => {
                let n = args[0];
                for &p in &args[2..] {
                    if p < 0 || p as usize >= stack.len() {
                        return Err(self.underflow("inspect"));
                    }
                    let t = stack[stack.len() - 1 - p as usize];
                    self.inspect(t);
                }
                if n < 0 || n as usize > stack.len() {
                    return Err(self.underflow("discard"));
                }
                for _ in 0..n {
                    // a pluck is not a plain discard for the values it drops
                    let t = stack.pop().unwrap();
                    self.inspect(t);
                }
                let t = self.produce(site, depth, false);
                stack.push(t);
            }
            Op::Call => {
                for &p in &args[3..] {
                    if p < 0 || p as usize >= stack.len() {
                        return Err(self.underflow("inspect"));
                    }
                    let t = stack[stack.len() - 1 - p as usize];
                    self.inspect(t);
                }
                let n = args[1];
                if n < 0 || n as usize > stack.len() {
                    return Err(self.underflow("discard"));
                }
                for _ in 0..n {
                    let t = stack.pop().unwrap();
                    self.inspect(t);
                }
                let t = self.produce(site, depth, true);
                stack.push(t);
            }
            Op::LoadSavedPos => {
                let p = args[0];
                if p < 0 || p as usize >= stack.len() {
                    return Err(self.underflow("inspect"));
                }
                let t = stack[stack.len() - 1 - p as usize];
                self.inspect(t);
            }
            Op::UpdateSavedPos
            | Op::SilentFailsOn
            | Op::SilentFailsOff
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

    /// Decides which producer sites can go. Producers that ever share a
    /// token must be removed together, so disqualification propagates until
    /// stable.
    fn settle(&self) -> (HashSet<u32>, HashMap<u32, u32>) {
        let clean: Vec<bool> = self
            .tokens
            .iter()
            .map(|t| !t.pinned && !t.inspected && !t.escaped)
            .collect();

        let mut by_producer: HashMap<u32, Vec<usize>> = HashMap::default();
        for (i, t) in self.tokens.iter().enumerate() {
            for &p in &t.producers {
                by_producer.entry(p).or_default().push(i);
            }
        }
        let mut ok: HashSet<u32> = HashSet::default();
        for (&p, toks) in &by_producer {
            if toks.iter().all(|&i| clean[i]) {
                ok.insert(p);
            }
        }
        loop {
            let mut moved = false;
            for (i, t) in self.tokens.iter().enumerate() {
                if !clean[i] || t.producers.is_empty() {
                    continue;
                }
                if t.producers.iter().any(|p| !ok.contains(p)) {
                    for p in &t.producers {
                        moved |= ok.remove(p);
                    }
                }
            }
            if !moved {
                break;
            }
        }

        let mut debits: HashMap<u32, u32> = HashMap::default();
        for (i, t) in self.tokens.iter().enumerate() {
            if clean[i]
                && !t.producers.is_empty()
                && t.producers.iter().all(|p| ok.contains(p))
            {
                for &c in &t.consumers {
                    *debits.entry(c).or_insert(0) += 1;
                }
            }
        }
        (ok, debits)
    }
}

/// Re-derives the analysis site numbering and applies the removals.
fn rewrite_block(
    block: &mut Block,
    site: &mut u32,
    dead: &HashSet<u32>,
    debits: &HashMap<u32, u32>,
    changed: &mut bool,
) {
    for instr in block.iter_mut() {
        let s = *site;
        *site += 1;
        match instr {
            Instr::Cond { then_block, else_block, .. } => {
                rewrite_block(then_block, site, dead, debits, changed);
                rewrite_block(else_block, site, dead, debits, changed);
                continue;
            }
            Instr::Loop { body } => {
                rewrite_block(body, site, dead, debits, changed);
                continue;
            }
            Instr::Flat { .. } => {}
        }
        let (op, n0) = match &*instr {
            Instr::Flat { op, args } => (*op, args.first().copied().unwrap_or(0)),
            _ => unreachable!(),
        };
        if dead.contains(&s) {
            *instr = match op {
                Op::Text => Instr::flat(Op::Pop),
                Op::Wrap | Op::Pluck => Instr::pop_n(n0),
                _ => Instr::pop_n(0),
            };
            *changed = true;
        } else if let Some(&d) = debits.get(&s) {
            match op {
                Op::Pop | Op::Nip => {
                    debug_assert_eq!(d, 1);
                    *instr = Instr::pop_n(0);
                }
                Op::PopN => *instr = Instr::pop_n(n0 - d as i32),
                _ => {}
            }
            *changed = true;
        }
    }
    *site += 1;
}

/// Silence markers around code that can never report a failure are inert.
fn collapse_silent_regions(block: &mut Block) -> bool {
    let mut changed = false;
    for instr in block.iter_mut() {
        match instr {
            Instr::Cond { then_block, else_block, .. } => {
                changed |= collapse_silent_regions(then_block);
                changed |= collapse_silent_regions(else_block);
            }
            Instr::Loop { body } => changed |= collapse_silent_regions(body),
            Instr::Flat { .. } => {}
        }
    }
    let mut i = 0;
    while i < block.len() {
        if block[i].flat_op() == Some(Op::SilentFailsOn) {
            if let Some(j) = matching_off(block, i) {
                if region_reports_nothing(&block[i + 1..j]) {
                    block[i] = Instr::pop_n(0);
                    block[j] = Instr::pop_n(0);
                    changed = true;
                }
            }
        }
        i += 1;
    }
    changed
}

fn matching_off(block: &Block, on: usize) -> Option<usize> {
    let mut nested = 0u32;
    for j in on + 1..block.len() {
        match block[j].flat_op() {
            Some(Op::SilentFailsOn) => nested += 1,
            Some(Op::SilentFailsOff) => {
                if nested == 0 {
                    return Some(j);
                }
                nested -= 1;
            }
            _ => {}
        }
    }
    None
}

fn region_reports_nothing(region: &[Instr]) -> bool {
    region.iter().all(|instr| match instr {
        Instr::Flat { op, .. } => !matches!(op, Op::Fail | Op::Rule | Op::Call),
        Instr::Cond { then_block, else_block, .. } => {
            region_reports_nothing(then_block) && region_reports_nothing(else_block)
        }
        Instr::Loop { body } => region_reports_nothing(body),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optimizer::tree::{flatten, format};

    fn run(code: &[i32]) -> (bool, Vec<i32>) {
        let mut tree = format("r", code).unwrap();
        let changed = remove_dead_slots("r", &mut tree).unwrap();
        (changed, flatten("r", &tree).unwrap())
    }

    #[test]
    fn test_slot_nipped_away_is_removed() {
        // the saved position is only ever nipped over
        let (changed, out) = run(&[
            Op::PushCurrPos.code(),
            Op::Rule.code(),
            0,
            Op::Nip.code(),
        ]);
        assert!(changed);
        assert_eq!(out, vec![8, 0, 27, 0, 8, 0]);
    }

    #[test]
    fn test_inspected_slot_stays() {
        // the first position is only nipped over; the second feeds TEXT
        let (changed, out) = run(&[
            Op::PushCurrPos.code(),
            Op::PushCurrPos.code(),
            Op::Nip.code(),
            Op::Text.code(),
        ]);
        assert!(changed);
        assert_eq!(out, vec![8, 0, 5, 8, 0, 12]);
    }

    #[test]
    fn test_result_slot_escapes() {
        let (changed, _) = run(&[Op::PushNull.code()]);
        assert!(!changed);
    }

    #[test]
    fn test_loop_crossing_slot_stays() {
        // the loop flag is read by the loop itself
        let (changed, _) = run(&[
            Op::Rule.code(),
            0,
            Op::WhileNotError.code(),
            3,
            Op::Pop.code(),
            Op::Rule.code(),
            0,
            Op::Pop.code(),
        ]);
        assert!(!changed);
    }

    #[test]
    fn test_slot_below_loop_is_removed() {
        // a null pushed under the loop flag and popped after the loop
        let (changed, out) = run(&[
            Op::PushNull.code(),
            Op::Rule.code(),
            0,
            Op::WhileNotError.code(),
            3,
            Op::Pop.code(),
            Op::Rule.code(),
            0,
            Op::Pop.code(),
            Op::Pop.code(),
        ]);
        assert!(changed);
        assert_eq!(
            out,
            vec![8, 0, 27, 0, 16, 3, 6, 27, 0, 6, 8, 0]
        );
    }

    #[test]
    fn test_silent_pair_around_quiet_code_collapses() {
        let (changed, out) = run(&[
            Op::SilentFailsOn.code(),
            Op::AcceptN.code(),
            1,
            Op::SilentFailsOff.code(),
            Op::Pop.code(),
        ]);
        assert!(changed);
        assert_eq!(out, vec![8, 0, 21, 1, 8, 0, 6]);
    }

    #[test]
    fn test_silent_pair_around_rule_stays() {
        let (changed, _) = run(&[
            Op::SilentFailsOn.code(),
            Op::Rule.code(),
            0,
            Op::SilentFailsOff.code(),
            Op::Pop.code(),
        ]);
        assert!(!changed);
    }
}
