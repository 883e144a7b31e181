//! Bidirectional conversion between the flat opcode stream and the tree
//! form the optimizer rewrites.
//!
//! The tree makes structured control flow first-class: conditionals own
//! their two child blocks and loops own their body, so splices never have
//! to fix up jump offsets. Child-block lengths are recomputed on flatten
//! and never stored in the tree.

use smallvec::SmallVec;

use crate::opcodes::{Op, Shape};
use crate::optimizer::OptError;

/// One unit of the flat stream.
pub type Code = i32;

/// One element of the tree form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Instr {
    Flat {
        op: Op,
        args: SmallVec<[Code; 2]>,
    },
    Cond {
        op: Op,
        /// The flag argument of the one-argument conditionals.
        arg: Option<Code>,
        then_block: Block,
        else_block: Block,
    },
    Loop {
        body: Block,
    },
}

pub type Block = Vec<Instr>;

impl Instr {
    pub fn flat(op: Op) -> Instr {
        Instr::Flat { op, args: SmallVec::new() }
    }

    pub fn flat1(op: Op, arg: Code) -> Instr {
        let mut args = SmallVec::new();
        args.push(arg);
        Instr::Flat { op, args }
    }

    pub fn pop_n(n: Code) -> Instr {
        Instr::flat1(Op::PopN, n)
    }

    /// The flat opcode of this element, if it is a flat element.
    pub fn flat_op(&self) -> Option<Op> {
        match self {
            Instr::Flat { op, .. } => Some(*op),
            _ => None,
        }
    }
}

pub fn format(rule: &str, code: &[Code]) -> Result<Block, OptError> {
    parse_block(rule, code, 0)
}

fn parse_block(rule: &str, code: &[Code], base: usize) -> Result<Block, OptError> {
    let mut out = Block::new();
    let mut i = 0;
    while i < code.len() {
        let op = Op::from_code(code[i]).ok_or_else(|| OptError::InvalidOpcode {
            rule: rule.to_string(),
            code: code[i],
            offset: base + i,
        })?;
        match op.shape() {
            Shape::Flat => {
                let argc = flat_args_at(rule, op, code, i)?;
                let args: SmallVec<[Code; 2]> = code[i + 1..i + 1 + argc].iter().copied().collect();
                out.push(Instr::Flat { op, args });
                i += 1 + argc;
            }
            Shape::Cond => {
                let flagc = op.cond_arg_count();
                let header = 1 + flagc + 2;
                if i + header > code.len() {
                    return Err(truncated(rule));
                }
                let arg = (flagc == 1).then(|| code[i + 1]);
                let len_then = block_len(rule, code[i + 1 + flagc])?;
                let len_else = block_len(rule, code[i + 2 + flagc])?;
                let then_at = i + header;
                let else_at = then_at + len_then;
                if else_at + len_else > code.len() {
                    return Err(truncated(rule));
                }
                let then_block = parse_block(rule, &code[then_at..else_at], base + then_at)?;
                let else_block =
                    parse_block(rule, &code[else_at..else_at + len_else], base + else_at)?;
                out.push(Instr::Cond { op, arg, then_block, else_block });
                i = else_at + len_else;
            }
            Shape::Loop => {
                if i + 2 > code.len() {
                    return Err(truncated(rule));
                }
                let len_body = block_len(rule, code[i + 1])?;
                let body_at = i + 2;
                if body_at + len_body > code.len() {
                    return Err(truncated(rule));
                }
                let body = parse_block(rule, &code[body_at..body_at + len_body], base + body_at)?;
                out.push(Instr::Loop { body });
                i = body_at + len_body;
            }
        }
    }
    Ok(out)
}

/// Argument count of the flat opcode starting at `i`, reading the embedded
/// count for the variable-arity opcodes.
fn flat_args_at(rule: &str, op: Op, code: &[Code], i: usize) -> Result<usize, OptError> {
    let argc = match op.flat_arg_count() {
        Some(n) => n,
        None => match op {
            // PLUCK n k p1..pk
            Op::Pluck => {
                if i + 3 > code.len() {
                    return Err(truncated(rule));
                }
                2 + block_len(rule, code[i + 2])?
            }
            // CALL f n pc p1..pN with N given by pc
            Op::Call => {
                if i + 4 > code.len() {
                    return Err(truncated(rule));
                }
                3 + block_len(rule, code[i + 3])?
            }
            _ => unreachable!("{op} has a fixed arity"),
        },
    };
    if i + 1 + argc > code.len() {
        return Err(truncated(rule));
    }
    Ok(argc)
}

fn block_len(rule: &str, len: Code) -> Result<usize, OptError> {
    usize::try_from(len).map_err(|_| OptError::MalformedTree {
        rule: rule.to_string(),
        reason: "negative length",
    })
}

fn truncated(rule: &str) -> OptError {
    OptError::MalformedTree { rule: rule.to_string(), reason: "truncated instruction" }
}

pub fn flatten(rule: &str, block: &Block) -> Result<Vec<Code>, OptError> {
    let mut out = Vec::new();
    flatten_into(rule, block, &mut out)?;
    Ok(out)
}

fn flatten_into(rule: &str, block: &Block, out: &mut Vec<Code>) -> Result<(), OptError> {
    for instr in block {
        match instr {
            Instr::Flat { op, args } => {
                if op.shape() != Shape::Flat {
                    return Err(malformed(rule, "structured opcode in a flat element"));
                }
                match op.flat_arg_count() {
                    Some(n) if n != args.len() => {
                        return Err(malformed(rule, "wrong flat argument count"));
                    }
                    None => {
                        let counted = match op {
                            Op::Pluck if args.len() >= 2 => 2 + args[1] as usize,
                            Op::Call if args.len() >= 3 => 3 + args[2] as usize,
                            _ => return Err(malformed(rule, "wrong flat argument count")),
                        };
                        if counted != args.len() {
                            return Err(malformed(rule, "wrong flat argument count"));
                        }
                    }
                    _ => {}
                }
                out.push(op.code());
                out.extend_from_slice(args);
            }
            Instr::Cond { op, arg, then_block, else_block } => {
                if op.shape() != Shape::Cond {
                    return Err(malformed(rule, "non-conditional opcode in a conditional element"));
                }
                match (op.cond_arg_count(), arg) {
                    (0, None) | (1, Some(_)) => {}
                    _ => return Err(malformed(rule, "wrong conditional flag arguments")),
                }
                let mut then_code = Vec::new();
                flatten_into(rule, then_block, &mut then_code)?;
                let mut else_code = Vec::new();
                flatten_into(rule, else_block, &mut else_code)?;
                out.push(op.code());
                if let Some(a) = arg {
                    out.push(*a);
                }
                out.push(then_code.len() as Code);
                out.push(else_code.len() as Code);
                out.extend_from_slice(&then_code);
                out.extend_from_slice(&else_code);
            }
            Instr::Loop { body } => {
                let mut body_code = Vec::new();
                flatten_into(rule, body, &mut body_code)?;
                out.push(Op::WhileNotError.code());
                out.push(body_code.len() as Code);
                out.extend_from_slice(&body_code);
            }
        }
    }
    Ok(())
}

fn malformed(rule: &str, reason: &'static str) -> OptError {
    OptError::MalformedTree { rule: rule.to_string(), reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(code: &[Code]) {
        let tree = format("r", code).unwrap();
        assert_eq!(flatten("r", &tree).unwrap(), code, "tree: {tree:?}");
    }

    #[test]
    fn test_roundtrip_flat() {
        roundtrip(&[]);
        roundtrip(&[2, 1, 6]);
        roundtrip(&[8, 3, 11, 2, 12]);
        // variable arity: PLUCK 3 2 p p and CALL f n pc p
        roundtrip(&[36, 3, 2, 1, 0, 26, 0, 2, 1, 0]);
        roundtrip(&[39, 1, 2, 3, 40, 1]);
    }

    #[test]
    fn test_roundtrip_nested() {
        // IF_ERROR wrapping a loop wrapping a MATCH_STRING conditional
        roundtrip(&[
            14, 12, 1, // IF_ERROR then(12) else(1)
            16, 10, // WHILE_NOT_ERROR body(10)
            18, 0, 3, 3, // MATCH_STRING lit=0 then(3) else(3)
            22, 0, 10, // ACCEPT_STRING 0, APPEND
            23, 1, 6, // FAIL 1, POP
            6, // else: POP
        ]);
    }

    #[test]
    fn test_unknown_opcode() {
        let err = format("r", &[2, 99]).unwrap_err();
        assert_eq!(
            err,
            OptError::InvalidOpcode { rule: "r".to_string(), code: 99, offset: 1 }
        );
    }

    #[test]
    fn test_truncated_stream() {
        assert!(matches!(format("r", &[8]), Err(OptError::MalformedTree { .. })));
        assert!(matches!(format("r", &[13, 2, 2, 6]), Err(OptError::MalformedTree { .. })));
        assert!(matches!(format("r", &[16, 4, 6]), Err(OptError::MalformedTree { .. })));
        assert!(matches!(format("r", &[36, 2, 5, 0]), Err(OptError::MalformedTree { .. })));
    }

    #[test]
    fn test_flatten_validates_shape() {
        // a conditional opcode smuggled into a flat element
        let bad = vec![Instr::flat(Op::If)];
        assert!(matches!(flatten("r", &bad), Err(OptError::MalformedTree { .. })));

        // flag argument on a zero-argument conditional
        let bad = vec![Instr::Cond {
            op: Op::If,
            arg: Some(1),
            then_block: vec![],
            else_block: vec![],
        }];
        assert!(matches!(flatten("r", &bad), Err(OptError::MalformedTree { .. })));

        // missing flag argument on MATCH_STRING
        let bad = vec![Instr::Cond {
            op: Op::MatchString,
            arg: None,
            then_block: vec![],
            else_block: vec![],
        }];
        assert!(matches!(flatten("r", &bad), Err(OptError::MalformedTree { .. })));
    }
}
