//! Human-readable listings of rule bytecode, used by the opt-in dump.

use std::fmt::Write;

use crate::opcodes::Op;
use crate::optimizer::tree::{format, Block, Code, Instr};
use crate::optimizer::OptError;

/// Renders a flat opcode sequence as an indented listing with a running
/// stack depth per opcode.
pub fn dump(code: &[Code], rule: &str) -> Result<String, OptError> {
    let tree = format(rule, code)?;
    let mut out = String::new();
    write_block(&mut out, &tree, 1, 0);
    Ok(out)
}

fn write_block(out: &mut String, block: &Block, indent: usize, mut depth: i32) -> i32 {
    for instr in block {
        depth += write_instr(out, instr, indent, depth);
    }
    depth
}

fn write_instr(out: &mut String, instr: &Instr, indent: usize, depth: i32) -> i32 {
    let pad = "  ".repeat(indent);
    match instr {
        Instr::Flat { op, args } => {
            let mut line = format!("{pad}{op}");
            for a in args {
                let _ = write!(line, " {a}");
            }
            let delta = flat_delta(*op, args);
            let _ = writeln!(out, "{:<44}; sp={}", line, depth + delta);
            delta
        }
        Instr::Cond { op, arg, then_block, else_block } => {
            let mut line = format!("{pad}{op}");
            if let Some(a) = arg {
                let _ = write!(line, " {a}");
            }
            let _ = writeln!(out, "{:<44}; sp={}", line, depth);
            let _ = writeln!(out, "{pad} then:");
            let after_then = write_block(out, then_block, indent + 1, depth);
            if !else_block.is_empty() {
                let _ = writeln!(out, "{pad} else:");
                write_block(out, else_block, indent + 1, depth);
            }
            after_then - depth
        }
        Instr::Loop { body } => {
            let _ = writeln!(out, "{:<44}; sp={}", format!("{pad}{}", Op::WhileNotError), depth);
            let _ = writeln!(out, "{pad} body:");
            write_block(out, body, indent + 1, depth);
            0
        }
    }
}

/// Static net stack effect of one flat opcode.
fn flat_delta(op: Op, args: &[Code]) -> i32 {
    match op {
        Op::PushEmptyString
        | Op::PushUndefined
        | Op::PushNull
        | Op::PushFailed
        | Op::PushEmptyArray
        | Op::PushCurrPos
        | Op::AcceptN
        | Op::AcceptString
        | Op::Fail
        | Op::Rule => 1,
        Op::Pop | Op::PopCurrPos | Op::Nip | Op::Append => -1,
        Op::PopN => -args[0],
        Op::Wrap | Op::Pluck => 1 - args[0],
        Op::Call => 1 - args[1],
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_shape() {
        let listing = dump(
            &[5, 17, 2, 2, 21, 1, 23, 0, 9],
            "r",
        )
        .unwrap();
        assert!(listing.contains("PUSH_CURR_POS"));
        assert!(listing.contains("MATCH_ANY"));
        assert!(listing.contains(" then:"));
        assert!(listing.contains(" else:"));
        assert!(listing.contains("    ACCEPT_N 1"));
        assert!(listing.contains("sp=2"));
        assert!(listing.trim_end().ends_with("sp=1"));
    }
}
