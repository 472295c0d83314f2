//! Pretty-printing for MIR
//!
//! Human-readable dumps for debugging pass output; never parsed back.

use crate::instr::{BinOp, Block, CallKind, Instr, Operand, UnOp};
use std::fmt;

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Var(name) => write!(f, "{}", name),
            Operand::SelfRef => write!(f, "self"),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        };
        write!(f, "{}", s)
    }
}

impl fmt::Display for UnOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnOp::Neg => write!(f, "-"),
            UnOp::Not => write!(f, "!"),
        }
    }
}

impl fmt::Display for CallKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallKind::Direct => write!(f, "call"),
            CallKind::Closure => write!(f, "callcls"),
            CallKind::External => write!(f, "callext"),
        }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}:", self.label)?;
        for instr in &self.instrs {
            write_instr(f, instr, 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_instr(f, self, 0)
    }
}

fn write_instr(f: &mut fmt::Formatter<'_>, instr: &Instr, depth: usize) -> fmt::Result {
    let pad = "  ".repeat(depth);
    match instr {
        Instr::Number { name, val } => writeln!(f, "{}{} = num {}", pad, name, val),
        Instr::Str { name, val } => writeln!(f, "{}{} = str {:?}", pad, name, val),
        Instr::Alloca { name, ty } => writeln!(f, "{}{} = alloca {}", pad, name, ty),
        Instr::Load { name, src } => writeln!(f, "{}{} = load {}", pad, name, src),
        Instr::Store { dst, src } => writeln!(f, "{}store {} <- {}", pad, dst, src),
        Instr::BinOp { name, op, lhs, rhs } => {
            writeln!(f, "{}{} = {} {} {}", pad, name, lhs, op, rhs)
        }
        Instr::UnOp { name, op, value } => writeln!(f, "{}{} = {}{}", pad, name, op, value),
        Instr::Fun {
            name,
            args,
            body,
            free_vars,
            ..
        } => {
            write!(f, "{}fun {}({})", pad, name, args.join(", "))?;
            if !free_vars.is_empty() {
                write!(f, " captures [{}]", free_vars.join(", "))?;
            }
            writeln!(f)?;
            for i in &body.instrs {
                write_instr(f, i, depth + 1)?;
            }
            Ok(())
        }
        Instr::Call {
            name,
            callee,
            args,
            kind,
        } => {
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            writeln!(f, "{}{} = {} {}({})", pad, name, kind, callee, args.join(", "))
        }
        Instr::MakeClosure {
            name,
            fname,
            captures,
        } => writeln!(
            f,
            "{}{} = makeclosure {} [{}]",
            pad,
            name,
            fname,
            captures.join(", ")
        ),
        Instr::Array { name, elems } => {
            let elems: Vec<String> = elems.iter().map(|e| e.to_string()).collect();
            writeln!(f, "{}{} = array [{}]", pad, name, elems.join(", "))
        }
        Instr::ArrayAccess { name, array, index } => {
            writeln!(f, "{}{} = {}[{}]", pad, name, array, index)
        }
        Instr::Field {
            name,
            target,
            index,
        } => writeln!(f, "{}{} = field {}.{}", pad, name, target, index),
        Instr::If {
            name,
            cond,
            then_blk,
            else_blk,
        } => {
            writeln!(f, "{}{} = if {}", pad, name, cond)?;
            writeln!(f, "{}then:", pad)?;
            for i in &then_blk.instrs {
                write_instr(f, i, depth + 1)?;
            }
            writeln!(f, "{}else:", pad)?;
            for i in &else_blk.instrs {
                write_instr(f, i, depth + 1)?;
            }
            Ok(())
        }
        Instr::Ret { value } => writeln!(f, "{}ret {}", pad, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::MirBuilder;

    #[test]
    fn test_block_dump() {
        let mut b = MirBuilder::new();
        let mut body = Block::new("f");
        body.push(Instr::BinOp {
            name: "t0".into(),
            op: BinOp::Add,
            lhs: Operand::var("x"),
            rhs: Operand::SelfRef,
        });
        body.push(Instr::Ret {
            value: Operand::var("t0"),
        });
        let mut top = Block::new("top");
        top.push(b.function("f", vec!["x".into()], body));
        let dump = top.to_string();
        assert!(dump.contains("fun f(x)"));
        assert!(dump.contains("t0 = x + self"));
        assert!(dump.contains("ret t0"));
    }
}
