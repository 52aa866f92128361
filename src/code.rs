//! The VM instruction set and the code and data arenas.
//!
//! The code pool is the compiler's only output format: the parser appends
//! instruction words as it reads source, and the VM executes that buffer
//! directly. There is no other intermediate representation.

use std::fmt::{self, Write as _};

use crate::types::WORD;

// ─── Instruction set ───────────────────────────────────────────────

/// VM opcodes, in the original's numbering.
///
/// Everything at or below `Adj` carries one inline operand word; the rest of
/// the instruction stream is operand-free. The block from `Or` through `Mod`
/// is the ALU (`a = pop() OP a`), and everything from `Open` on is a syscall
/// into the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    Lea,
    Imm,
    Jmp,
    Jsr,
    Bz,
    Bnz,
    Ent,
    Adj,
    Lev,
    Li,
    Lc,
    Si,
    Sc,
    Psh,
    Or,
    Xor,
    And,
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    Shl,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Open,
    Read,
    Clos,
    Prtf,
    Malc,
    Free,
    Mset,
    Mcmp,
    Exit,
}

impl Op {
    pub const ALL: [Op; 39] = [
        Op::Lea,
        Op::Imm,
        Op::Jmp,
        Op::Jsr,
        Op::Bz,
        Op::Bnz,
        Op::Ent,
        Op::Adj,
        Op::Lev,
        Op::Li,
        Op::Lc,
        Op::Si,
        Op::Sc,
        Op::Psh,
        Op::Or,
        Op::Xor,
        Op::And,
        Op::Eq,
        Op::Ne,
        Op::Lt,
        Op::Gt,
        Op::Le,
        Op::Ge,
        Op::Shl,
        Op::Shr,
        Op::Add,
        Op::Sub,
        Op::Mul,
        Op::Div,
        Op::Mod,
        Op::Open,
        Op::Read,
        Op::Clos,
        Op::Prtf,
        Op::Malc,
        Op::Free,
        Op::Mset,
        Op::Mcmp,
        Op::Exit,
    ];

    /// Decode an instruction word.
    pub fn from_word(w: i64) -> Option<Op> {
        usize::try_from(w).ok().and_then(|i| Self::ALL.get(i).copied())
    }

    /// Whether one operand word follows the opcode inline.
    pub fn has_operand(self) -> bool {
        self <= Op::Adj
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Op::Lea => "LEA",
            Op::Imm => "IMM",
            Op::Jmp => "JMP",
            Op::Jsr => "JSR",
            Op::Bz => "BZ",
            Op::Bnz => "BNZ",
            Op::Ent => "ENT",
            Op::Adj => "ADJ",
            Op::Lev => "LEV",
            Op::Li => "LI",
            Op::Lc => "LC",
            Op::Si => "SI",
            Op::Sc => "SC",
            Op::Psh => "PSH",
            Op::Or => "OR",
            Op::Xor => "XOR",
            Op::And => "AND",
            Op::Eq => "EQ",
            Op::Ne => "NE",
            Op::Lt => "LT",
            Op::Gt => "GT",
            Op::Le => "LE",
            Op::Ge => "GE",
            Op::Shl => "SHL",
            Op::Shr => "SHR",
            Op::Add => "ADD",
            Op::Sub => "SUB",
            Op::Mul => "MUL",
            Op::Div => "DIV",
            Op::Mod => "MOD",
            Op::Open => "OPEN",
            Op::Read => "READ",
            Op::Clos => "CLOS",
            Op::Prtf => "PRTF",
            Op::Malc => "MALC",
            Op::Free => "FREE",
            Op::Mset => "MSET",
            Op::Mcmp => "MCMP",
            Op::Exit => "EXIT",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

/// Built-in syscall spellings, seeded into the symbol table with class `Sys`
/// and the opcode as their value.
pub const SYSCALLS: &[(&str, Op)] = &[
    ("open", Op::Open),
    ("read", Op::Read),
    ("close", Op::Clos),
    ("printf", Op::Prtf),
    ("malloc", Op::Malc),
    ("free", Op::Free),
    ("memset", Op::Mset),
    ("memcmp", Op::Mcmp),
    ("exit", Op::Exit),
];

/// An arena refused an append because its fixed capacity is spent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolExhausted;

// ─── Code pool ─────────────────────────────────────────────────────

/// Append-only buffer of instruction and operand words.
///
/// Forward jumps are emitted with a zero placeholder whose index the caller
/// keeps on its own stack and later `patch`es. The pool also remembers
/// whether its most recent instruction is a load (`LI`/`LC`): assignment,
/// address-of, and ++/-- consume that pending load instead of inspecting raw
/// buffer words, turning an rvalue tail back into an lvalue address.
pub struct CodePool {
    words: Vec<i64>,
    cap: usize,
    last_load: Option<Op>,
}

impl CodePool {
    pub fn new(cap_words: usize) -> Self {
        Self {
            words: Vec::new(),
            cap: cap_words,
            last_load: None,
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Address of the next word to be emitted.
    pub fn here(&self) -> i64 {
        self.words.len() as i64
    }

    pub fn emit(&mut self, op: Op) -> Result<(), PoolExhausted> {
        if self.words.len() + 1 > self.cap {
            return Err(PoolExhausted);
        }
        self.words.push(op as i64);
        self.last_load = match op {
            Op::Li | Op::Lc => Some(op),
            _ => None,
        };
        Ok(())
    }

    pub fn emit_with(&mut self, op: Op, operand: i64) -> Result<(), PoolExhausted> {
        if self.words.len() + 2 > self.cap {
            return Err(PoolExhausted);
        }
        self.words.push(op as i64);
        self.words.push(operand);
        self.last_load = None;
        Ok(())
    }

    /// Emit a jump with a placeholder target; returns the slot to `patch`.
    pub fn emit_jump(&mut self, op: Op) -> Result<usize, PoolExhausted> {
        if self.words.len() + 2 > self.cap {
            return Err(PoolExhausted);
        }
        self.words.push(op as i64);
        self.words.push(0);
        self.last_load = None;
        Ok(self.words.len() - 1)
    }

    pub fn patch(&mut self, at: usize, value: i64) {
        self.words[at] = value;
    }

    /// Remove the pending load and return it, if the last emitted
    /// instruction was one.
    pub fn pop_if_load(&mut self) -> Option<Op> {
        let op = self.last_load.take()?;
        self.words.pop();
        Some(op)
    }

    pub fn words(&self) -> &[i64] {
        &self.words
    }

    pub fn into_words(self) -> Vec<i64> {
        self.words
    }

    /// Disassemble the words from `from` to the end, one instruction per
    /// line. Shared by the `-s` listing and by tests.
    pub fn disasm_from(&self, from: usize) -> String {
        let mut out = String::new();
        let mut i = from;
        while i < self.words.len() {
            match Op::from_word(self.words[i]) {
                Some(op) if op.has_operand() => {
                    let operand = self.words.get(i + 1).copied().unwrap_or(0);
                    let _ = writeln!(out, "    {:<4} {}", op.mnemonic(), operand);
                    i += 2;
                }
                Some(op) => {
                    let _ = writeln!(out, "    {}", op.mnemonic());
                    i += 1;
                }
                None => {
                    let _ = writeln!(out, "    ??? {}", self.words[i]);
                    i += 1;
                }
            }
        }
        out
    }
}

// ─── Data pool ─────────────────────────────────────────────────────

/// Append-only arena for global storage and string-literal bytes. Addresses
/// handed out are final guest addresses: the base is fixed by the memory
/// layout, so no relocation happens at load time.
pub struct DataPool {
    bytes: Vec<u8>,
    base: i64,
    cap: usize,
}

impl DataPool {
    pub fn new(base: i64, cap: usize) -> Self {
        Self {
            bytes: Vec::new(),
            base,
            cap,
        }
    }

    /// Guest address of the next byte to be appended.
    pub fn addr(&self) -> i64 {
        self.base + self.bytes.len() as i64
    }

    pub fn push(&mut self, b: u8) -> Result<(), PoolExhausted> {
        if self.bytes.len() + 1 > self.cap {
            return Err(PoolExhausted);
        }
        self.bytes.push(b);
        Ok(())
    }

    /// Zero-fill up to the next word boundary.
    pub fn align(&mut self) -> Result<(), PoolExhausted> {
        while self.bytes.len() % WORD as usize != 0 {
            self.push(0)?;
        }
        Ok(())
    }

    /// Reserve one zeroed, word-aligned word for a global variable and
    /// return its guest address.
    pub fn alloc_word(&mut self) -> Result<i64, PoolExhausted> {
        self.align()?;
        let addr = self.addr();
        for _ in 0..WORD {
            self.push(0)?;
        }
        Ok(addr)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
