//! Seccomp-BPF program generation.
//!
//! ## Program Layout
//!
//! ```text
//! ld  [arch]
//! jeq AUDIT_ARCH_a, 0, 1      one pair per architecture
//! ja  block_a
//! ret <bad arch action>
//! block_a:
//!   ld  [nr]
//!   (x86_64) jge X32_SYSCALL_BIT -> ret <bad arch action>
//!   rule 0: jeq nr_0 ... ret <action_0>
//!   rule 1: ...
//!   ret <default action>
//! ```
//!
//! Rules are tested in insertion order and the first whose syscall and
//! conditions all match decides. Each 64-bit argument comparison is lowered
//! into 32-bit compares on the high word and then the low word.
//!
//! Conditional jumps only ever stay inside one rule, so their 8-bit offsets
//! cannot overflow. Jumps to architecture blocks use `ja`, which has a 32-bit
//! offset.

use std::collections::BTreeMap;
use std::io::Write;

use sysfence_sys::seccomp::{
    BPF_ABS, BPF_ALU, BPF_AND, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_K, BPF_LD,
    BPF_MAXINSNS, BPF_RET, BPF_W, OFFSET_ARCH, OFFSET_SYSCALL_NR, SockFilter, X32_SYSCALL_BIT,
    arg_offsets,
};

use crate::action::Action;
use crate::arch::Arch;
use crate::condition::{CompareOp, Condition};
use crate::error::{Error, Result};
use crate::filter::Rule;

/// Compiles per-architecture rule lists into a program.
pub(crate) fn compile(
    default_action: Action,
    bad_arch_action: Action,
    arches: &BTreeMap<Arch, Vec<Rule>>,
) -> Result<Vec<SockFilter>> {
    let mut asm = Assembler::default();
    let blocks: Vec<Label> = arches.keys().map(|_| asm.label()).collect();

    asm.load(OFFSET_ARCH);
    for (arch, &block) in arches.keys().zip(&blocks) {
        let skip = asm.label();
        asm.jump(BPF_JEQ, arch.audit_value(), Target::Next, Target::To(skip));
        asm.goto(block);
        asm.bind(skip);
    }
    asm.ret(bad_arch_action)?;

    for ((arch, rules), &block) in arches.iter().zip(&blocks) {
        asm.bind(block);
        asm.load(OFFSET_SYSCALL_NR);

        if *arch == Arch::X86_64 {
            let native = asm.label();
            asm.jump(BPF_JGE, X32_SYSCALL_BIT, Target::Next, Target::To(native));
            asm.ret(bad_arch_action)?;
            asm.bind(native);
        }

        // A holds the syscall number until a condition loads an argument.
        let mut nr_loaded = true;
        for rule in rules {
            let next = asm.label();
            if !nr_loaded {
                asm.load(OFFSET_SYSCALL_NR);
            }
            asm.jump(
                BPF_JEQ,
                rule.syscall().number() as u32,
                Target::Next,
                Target::To(next),
            );
            for cond in rule.conditions() {
                lower_condition(&mut asm, cond, next);
            }
            asm.ret(rule.action())?;
            asm.bind(next);
            nr_loaded = rule.conditions().is_empty();
        }

        asm.ret(default_action)?;
    }

    asm.finish()
}

/// Writes `program` as raw native-endian `struct sock_filter` records.
pub(crate) fn write_program<W: Write>(program: &[SockFilter], mut writer: W) -> Result<()> {
    for insn in program {
        writer.write_all(&insn.to_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Falls through when `cond` holds, jumps to `fail` otherwise.
fn lower_condition(asm: &mut Assembler, cond: &Condition, fail: Label) {
    let (hi_off, lo_off) = arg_offsets(cond.arg());
    let (hi, lo) = split(cond.operand1());
    let ok = asm.label();
    let pass = Target::To(ok);
    let fail = Target::To(fail);

    match cond.op() {
        CompareOp::Equal => {
            asm.load(hi_off);
            asm.jump(BPF_JEQ, hi, Target::Next, fail);
            asm.load(lo_off);
            asm.jump(BPF_JEQ, lo, pass, fail);
        }
        CompareOp::NotEqual => {
            asm.load(hi_off);
            asm.jump(BPF_JEQ, hi, Target::Next, pass);
            asm.load(lo_off);
            asm.jump(BPF_JEQ, lo, fail, pass);
        }
        CompareOp::Greater | CompareOp::GreaterEqual => {
            asm.load(hi_off);
            asm.jump(BPF_JGT, hi, pass, Target::Next);
            asm.jump(BPF_JEQ, hi, Target::Next, fail);
            asm.load(lo_off);
            let op = if cond.op() == CompareOp::Greater {
                BPF_JGT
            } else {
                BPF_JGE
            };
            asm.jump(op, lo, pass, fail);
        }
        // a < v is !(a >= v), a <= v is !(a > v)
        CompareOp::Less | CompareOp::LessEqual => {
            asm.load(hi_off);
            asm.jump(BPF_JGT, hi, fail, Target::Next);
            asm.jump(BPF_JEQ, hi, Target::Next, pass);
            asm.load(lo_off);
            let op = if cond.op() == CompareOp::Less {
                BPF_JGE
            } else {
                BPF_JGT
            };
            asm.jump(op, lo, fail, pass);
        }
        CompareOp::MaskedEqual => {
            let (value_hi, value_lo) = split(cond.operand2());
            asm.load(hi_off);
            asm.stmt(BPF_ALU | BPF_AND | BPF_K, hi);
            asm.jump(BPF_JEQ, value_hi, Target::Next, fail);
            asm.load(lo_off);
            asm.stmt(BPF_ALU | BPF_AND | BPF_K, lo);
            asm.jump(BPF_JEQ, value_lo, pass, fail);
        }
        CompareOp::Invalid => asm.goto_target(fail),
    }

    asm.bind(ok);
}

const fn split(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

#[derive(Debug, Clone, Copy)]
struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum Target {
    Next,
    To(Label),
}

#[derive(Debug)]
struct Pending {
    insn: SockFilter,
    jt: Target,
    jf: Target,
    /// Unconditional jump, resolved into `k`.
    ja: Option<Label>,
}

/// Forward-only assembler with symbolic jump targets.
#[derive(Debug, Default)]
struct Assembler {
    code: Vec<Pending>,
    labels: Vec<Option<usize>>,
}

impl Assembler {
    fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.code.len());
    }

    fn stmt(&mut self, code: u16, k: u32) {
        self.code.push(Pending {
            insn: SockFilter::stmt(code, k),
            jt: Target::Next,
            jf: Target::Next,
            ja: None,
        });
    }

    fn load(&mut self, offset: u32) {
        self.stmt(BPF_LD | BPF_W | BPF_ABS, offset);
    }

    fn ret(&mut self, action: Action) -> Result<()> {
        let raw = action.to_raw().ok_or(Error::InvalidAction)?;
        self.stmt(BPF_RET | BPF_K, raw);
        Ok(())
    }

    fn jump(&mut self, op: u16, k: u32, jt: Target, jf: Target) {
        self.code.push(Pending {
            insn: SockFilter::jump(BPF_JMP | op | BPF_K, k, 0, 0),
            jt,
            jf,
            ja: None,
        });
    }

    fn goto(&mut self, label: Label) {
        self.code.push(Pending {
            insn: SockFilter::stmt(BPF_JMP | BPF_JA, 0),
            jt: Target::Next,
            jf: Target::Next,
            ja: Some(label),
        });
    }

    fn goto_target(&mut self, target: Target) {
        if let Target::To(label) = target {
            self.goto(label);
        }
    }

    fn distance(&self, pc: usize, label: Label) -> Result<usize> {
        let dest = self.labels[label.0].ok_or(Error::FilterInvalid)?;
        dest.checked_sub(pc + 1).ok_or(Error::FilterInvalid)
    }

    fn short(&self, pc: usize, target: Target) -> Result<u8> {
        match target {
            Target::Next => Ok(0),
            Target::To(label) => {
                let distance = self.distance(pc, label)?;
                u8::try_from(distance).map_err(|_| Error::ProgramTooLarge {
                    len: self.code.len(),
                    max: BPF_MAXINSNS,
                })
            }
        }
    }

    fn finish(self) -> Result<Vec<SockFilter>> {
        let len = self.code.len();
        if len > BPF_MAXINSNS {
            return Err(Error::ProgramTooLarge {
                len,
                max: BPF_MAXINSNS,
            });
        }

        let mut program = Vec::with_capacity(len);
        for (pc, pending) in self.code.iter().enumerate() {
            let mut insn = pending.insn;
            insn.jt = self.short(pc, pending.jt)?;
            insn.jf = self.short(pc, pending.jf)?;
            if let Some(label) = pending.ja {
                insn.k = self.distance(pc, label)? as u32;
            }
            program.push(insn);
        }
        Ok(program)
    }
}
