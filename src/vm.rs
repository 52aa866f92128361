//! The stack-based virtual machine and its system-call surface.
//!
//! The VM executes the code pool directly: one hot loop fetches an opcode
//! word, optionally its inline operand, and dispatches. Guest data, heap,
//! and stack live in one flat byte array indexed by guest address, with a
//! null guard page at the bottom; the code pool is a separate address space,
//! which is safe because the dialect has no function pointers. Registers are
//! the original's five: `pc`, `sp`, `bp`, the accumulator `a`, and a cycle
//! counter.

use std::fs::File;
use std::io::{self, Read as _, Write};

use thiserror::Error;

use crate::code::Op;
use crate::types::WORD;
use crate::Program;

const WORD_BYTES: usize = WORD as usize;

// ─── Memory layout ─────────────────────────────────────────────────

/// Guest address-space layout: a null guard page, then the data, heap, and
/// stack arenas, each `pool_size` bytes. The same structure sizes the code
/// pool (in words), so compiler and VM always agree on addresses.
#[derive(Clone, Copy, Debug)]
pub struct Layout {
    pub pool_size: usize,
    pub data_base: usize,
    pub heap_base: usize,
    pub stack_base: usize,
    pub stack_top: usize,
    pub code_words: usize,
}

impl Layout {
    /// Addresses below this fault, so a guest null dereference is caught.
    pub const NULL_GUARD: usize = 0x1000;

    pub fn new(pool_size: usize) -> Self {
        let pool = (pool_size.max(4096) + WORD_BYTES - 1) & !(WORD_BYTES - 1);
        let data_base = Self::NULL_GUARD;
        let heap_base = data_base + pool;
        let stack_base = heap_base + pool;
        Self {
            pool_size: pool,
            data_base,
            heap_base,
            stack_base,
            stack_top: stack_base + pool,
            code_words: pool / WORD_BYTES,
        }
    }
}

// ─── Errors and results ────────────────────────────────────────────

/// Why the VM stopped abnormally. All of these are terminal; the host exits
/// with -1 after reporting.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("unknown instruction = {op}! cycle = {cycle}")]
    UnknownInstruction { op: i64, cycle: u64 },
    #[error("bad memory access at {addr:#x}, cycle = {cycle}")]
    BadAddress { addr: i64, cycle: u64 },
    #[error("pc escaped the code pool at {pc}, cycle = {cycle}")]
    BadPc { pc: i64, cycle: u64 },
    #[error("stack overflow, cycle = {cycle}")]
    StackOverflow { cycle: u64 },
    #[error("division by zero, cycle = {cycle}")]
    DivisionByZero { cycle: u64 },
    #[error("guest arguments do not fit in the data pool")]
    ArgsTooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Outcome of a completed run.
#[derive(Clone, Copy, Debug)]
pub struct ExecutionResult {
    /// The guest's exit code: the `EXIT` argument, or `main`'s return value.
    pub exit_code: i64,
    /// Instructions executed.
    pub cycles: u64,
}

// ─── The machine ───────────────────────────────────────────────────

pub struct Vm<W: Write> {
    code: Vec<i64>,
    mem: Vec<u8>,
    layout: Layout,
    pc: usize,
    sp: usize,
    bp: usize,
    a: i64,
    cycle: u64,
    heap_next: usize,
    /// Guest file descriptors 3 and up; 0 is the host's stdin.
    files: Vec<Option<File>>,
    out: W,
    debug: bool,
}

impl Vm<io::Stdout> {
    pub fn new(program: &Program, args: &[String]) -> Result<Self, VmError> {
        Self::with_output(program, args, io::stdout())
    }
}

impl<W: Write> Vm<W> {
    /// Load a program: copy its data image, materialize `args` as the guest
    /// argv, and set up the stack so a `return` from `main` exits with
    /// `main`'s value.
    pub fn with_output(program: &Program, args: &[String], out: W) -> Result<Self, VmError> {
        let layout = program.layout;
        let mut code = program.code.clone();
        // The halt stub doubles as main's return address.
        let halt = code.len() as i64;
        code.push(Op::Psh as i64);
        code.push(Op::Exit as i64);

        let mut mem = vec![0u8; layout.stack_top];
        mem[layout.data_base..layout.data_base + program.data.len()]
            .copy_from_slice(&program.data);

        // Argv strings and the pointer array go in the data region tail.
        let mut cursor = layout.data_base + program.data.len();
        let mut pointers = Vec::with_capacity(args.len());
        for arg in args {
            let bytes = arg.as_bytes();
            if cursor + bytes.len() + 1 > layout.heap_base {
                return Err(VmError::ArgsTooLarge);
            }
            mem[cursor..cursor + bytes.len()].copy_from_slice(bytes);
            pointers.push(cursor as i64);
            cursor += bytes.len() + 1;
        }
        cursor = (cursor + WORD_BYTES - 1) & !(WORD_BYTES - 1);
        let argv = cursor as i64;
        if cursor + pointers.len() * WORD_BYTES > layout.heap_base {
            return Err(VmError::ArgsTooLarge);
        }
        for p in &pointers {
            mem[cursor..cursor + WORD_BYTES].copy_from_slice(&p.to_le_bytes());
            cursor += WORD_BYTES;
        }

        let mut vm = Self {
            code,
            mem,
            layout,
            pc: program.entry,
            sp: layout.stack_top,
            bp: layout.stack_top,
            a: 0,
            cycle: 0,
            heap_next: layout.heap_base,
            files: Vec::new(),
            out,
            debug: false,
        };
        // main(argc, argv), then the halt stub as the return address.
        vm.push(args.len() as i64)?;
        vm.push(argv)?;
        vm.push(halt)?;
        Ok(vm)
    }

    pub fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    // ─── Memory access ─────────────────────────────────────────────

    fn load_word(&self, addr: i64) -> Result<i64, VmError> {
        let a = addr as usize;
        if addr < Layout::NULL_GUARD as i64 || a + WORD_BYTES > self.mem.len() {
            return Err(VmError::BadAddress { addr, cycle: self.cycle });
        }
        let mut b = [0u8; WORD_BYTES];
        b.copy_from_slice(&self.mem[a..a + WORD_BYTES]);
        Ok(i64::from_le_bytes(b))
    }

    fn store_word(&mut self, addr: i64, v: i64) -> Result<(), VmError> {
        let a = addr as usize;
        if addr < Layout::NULL_GUARD as i64 || a + WORD_BYTES > self.mem.len() {
            return Err(VmError::BadAddress { addr, cycle: self.cycle });
        }
        self.mem[a..a + WORD_BYTES].copy_from_slice(&v.to_le_bytes());
        Ok(())
    }

    /// Byte loads sign-extend, matching a signed `char` on the original's
    /// host platforms.
    fn load_byte(&self, addr: i64) -> Result<i64, VmError> {
        let a = addr as usize;
        if addr < Layout::NULL_GUARD as i64 || a >= self.mem.len() {
            return Err(VmError::BadAddress { addr, cycle: self.cycle });
        }
        Ok(self.mem[a] as i8 as i64)
    }

    fn store_byte(&mut self, addr: i64, v: i64) -> Result<(), VmError> {
        let a = addr as usize;
        if addr < Layout::NULL_GUARD as i64 || a >= self.mem.len() {
            return Err(VmError::BadAddress { addr, cycle: self.cycle });
        }
        self.mem[a] = v as u8;
        Ok(())
    }

    fn push(&mut self, v: i64) -> Result<(), VmError> {
        if self.sp < self.layout.stack_base + WORD_BYTES {
            return Err(VmError::StackOverflow { cycle: self.cycle });
        }
        self.sp -= WORD_BYTES;
        self.store_word(self.sp as i64, v)
    }

    fn pop(&mut self) -> Result<i64, VmError> {
        let v = self.load_word(self.sp as i64)?;
        self.sp += WORD_BYTES;
        Ok(v)
    }

    /// Zero-terminated guest string.
    fn read_cstr(&self, addr: i64) -> Result<Vec<u8>, VmError> {
        let mut s = Vec::new();
        let mut a = addr;
        loop {
            let b = self.load_byte(a)? as u8;
            if b == 0 {
                return Ok(s);
            }
            s.push(b);
            a += 1;
        }
    }

    /// Syscall argument `k`, counting down from the last one pushed.
    fn sys_arg(&self, k: i64) -> Result<i64, VmError> {
        self.load_word(self.sp as i64 + k * WORD)
    }

    // ─── Dispatch ──────────────────────────────────────────────────

    pub fn run(&mut self) -> Result<ExecutionResult, VmError> {
        loop {
            let fetched = self.pc;
            let word = *self.code.get(fetched).ok_or(VmError::BadPc {
                pc: fetched as i64,
                cycle: self.cycle,
            })?;
            self.pc += 1;
            self.cycle += 1;

            let op = Op::from_word(word).ok_or(VmError::UnknownInstruction {
                op: word,
                cycle: self.cycle,
            })?;

            if self.debug {
                if op.has_operand() {
                    let operand = self.code.get(self.pc).copied().unwrap_or(0);
                    writeln!(self.out, "{}> {:<4} {}", self.cycle, op.mnemonic(), operand)?;
                } else {
                    writeln!(self.out, "{}> {}", self.cycle, op.mnemonic())?;
                }
            }

            let operand = if op.has_operand() {
                let v = *self.code.get(self.pc).ok_or(VmError::BadPc {
                    pc: self.pc as i64,
                    cycle: self.cycle,
                })?;
                self.pc += 1;
                v
            } else {
                0
            };

            match op {
                Op::Lea => {
                    self.a = (self.bp as i64).wrapping_add(operand.wrapping_mul(WORD));
                }
                Op::Imm => self.a = operand,
                Op::Jmp => self.pc = operand as usize,
                Op::Jsr => {
                    self.push(self.pc as i64)?;
                    self.pc = operand as usize;
                }
                Op::Bz => {
                    if self.a == 0 {
                        self.pc = operand as usize;
                    }
                }
                Op::Bnz => {
                    if self.a != 0 {
                        self.pc = operand as usize;
                    }
                }
                Op::Ent => {
                    self.push(self.bp as i64)?;
                    self.bp = self.sp;
                    let new_sp = (self.sp as i64).wrapping_sub(operand.wrapping_mul(WORD));
                    if new_sp < self.layout.stack_base as i64 || new_sp > self.layout.stack_top as i64 {
                        return Err(VmError::StackOverflow { cycle: self.cycle });
                    }
                    self.sp = new_sp as usize;
                }
                Op::Adj => {
                    let new_sp = (self.sp as i64).wrapping_add(operand.wrapping_mul(WORD));
                    if new_sp < self.layout.stack_base as i64 || new_sp > self.layout.stack_top as i64 {
                        return Err(VmError::BadAddress { addr: new_sp, cycle: self.cycle });
                    }
                    self.sp = new_sp as usize;
                }
                Op::Lev => {
                    self.sp = self.bp;
                    self.bp = self.load_word(self.sp as i64)? as usize;
                    self.sp += WORD_BYTES;
                    self.pc = self.load_word(self.sp as i64)? as usize;
                    self.sp += WORD_BYTES;
                }
                Op::Li => self.a = self.load_word(self.a)?,
                Op::Lc => self.a = self.load_byte(self.a)?,
                Op::Si => {
                    let addr = self.pop()?;
                    self.store_word(addr, self.a)?;
                }
                Op::Sc => {
                    let addr = self.pop()?;
                    self.store_byte(addr, self.a)?;
                    // The store narrows the accumulator like a signed char
                    // assignment would.
                    self.a = self.a as i8 as i64;
                }
                Op::Psh => self.push(self.a)?,

                Op::Or
                | Op::Xor
                | Op::And
                | Op::Eq
                | Op::Ne
                | Op::Lt
                | Op::Gt
                | Op::Le
                | Op::Ge
                | Op::Shl
                | Op::Shr
                | Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod => self.alu(op)?,

                Op::Open => self.sys_open()?,
                Op::Read => self.sys_read()?,
                Op::Clos => self.sys_close()?,
                Op::Prtf => self.sys_printf()?,
                Op::Malc => self.sys_malloc()?,
                Op::Free => {
                    // Bump allocator: freeing is accepted and ignored.
                }
                Op::Mset => self.sys_memset()?,
                Op::Mcmp => self.sys_memcmp()?,
                Op::Exit => {
                    let code = self.load_word(self.sp as i64)?;
                    self.out.flush()?;
                    return Ok(ExecutionResult {
                        exit_code: code,
                        cycles: self.cycle,
                    });
                }
            }
        }
    }

    /// Two-operand ALU: `a = pop() OP a`, two's-complement throughout, with
    /// an arithmetic right shift.
    fn alu(&mut self, op: Op) -> Result<(), VmError> {
        let b = self.pop()?;
        let a = self.a;
        self.a = match op {
            Op::Or => b | a,
            Op::Xor => b ^ a,
            Op::And => b & a,
            Op::Eq => (b == a) as i64,
            Op::Ne => (b != a) as i64,
            Op::Lt => (b < a) as i64,
            Op::Gt => (b > a) as i64,
            Op::Le => (b <= a) as i64,
            Op::Ge => (b >= a) as i64,
            Op::Shl => b.wrapping_shl(a as u32),
            Op::Shr => b.wrapping_shr(a as u32),
            Op::Add => b.wrapping_add(a),
            Op::Sub => b.wrapping_sub(a),
            Op::Mul => b.wrapping_mul(a),
            Op::Div | Op::Mod => {
                if a == 0 {
                    return Err(VmError::DivisionByZero { cycle: self.cycle });
                }
                if op == Op::Div {
                    b.wrapping_div(a)
                } else {
                    b.wrapping_rem(a)
                }
            }
            _ => unreachable!("not an ALU op"),
        };
        Ok(())
    }

    // ─── Syscalls ──────────────────────────────────────────────────

    /// `open(path, flags)`: flags are accepted and ignored; the surface is
    /// read-only.
    fn sys_open(&mut self) -> Result<(), VmError> {
        let path = self.read_cstr(self.sys_arg(1)?)?;
        self.a = match std::str::from_utf8(&path).ok().and_then(|p| File::open(p).ok()) {
            Some(f) => {
                self.files.push(Some(f));
                (self.files.len() - 1 + 3) as i64
            }
            None => -1,
        };
        Ok(())
    }

    /// `read(fd, buf, n)`: fd 0 is the host stdin. A bad buffer reads as
    /// the host kernel would report it: -1, not a fault.
    fn sys_read(&mut self) -> Result<(), VmError> {
        let fd = self.sys_arg(2)?;
        let buf = self.sys_arg(1)?;
        let n = self.sys_arg(0)?;

        let start = buf as usize;
        let ok_range = n >= 0
            && buf >= Layout::NULL_GUARD as i64
            && start.checked_add(n as usize).is_some_and(|end| end <= self.mem.len());
        if !ok_range {
            self.a = -1;
            return Ok(());
        }
        let dst = &mut self.mem[start..start + n as usize];

        self.a = if fd == 0 {
            match io::stdin().read(dst) {
                Ok(count) => count as i64,
                Err(_) => -1,
            }
        } else {
            match usize::try_from(fd - 3)
                .ok()
                .and_then(|i| self.files.get_mut(i))
                .and_then(|f| f.as_mut())
            {
                Some(f) => match f.read(dst) {
                    Ok(count) => count as i64,
                    Err(_) => -1,
                },
                None => -1,
            }
        };
        Ok(())
    }

    fn sys_close(&mut self) -> Result<(), VmError> {
        let fd = self.sys_arg(0)?;
        self.a = match usize::try_from(fd - 3).ok().and_then(|i| self.files.get_mut(i)) {
            Some(slot) if slot.is_some() => {
                *slot = None;
                0
            }
            _ => -1,
        };
        Ok(())
    }

    /// `printf(fmt, ...)`: the argument count comes from the operand of
    /// the `ADJ` that follows the call site, and the window is fixed at six
    /// slots, the format string plus five values, read unconditionally no
    /// matter what the format demands. Returns the byte count written.
    fn sys_printf(&mut self) -> Result<(), VmError> {
        let argc = self.code.get(self.pc + 1).copied().unwrap_or(0);
        let base = (self.sp as i64).wrapping_add(argc.wrapping_mul(WORD));
        let fmt = self.read_cstr(self.load_word(base.wrapping_sub(WORD))?)?;
        // Fewer pushed arguments just means the tail slots hold whatever the
        // stack holds below them, as in the original.
        let mut window = [0i64; 5];
        for (k, slot) in window.iter_mut().enumerate() {
            *slot = self.load_word(base.wrapping_sub(WORD * (k as i64 + 2)))?;
        }

        let mut outbuf: Vec<u8> = Vec::new();
        // Directives past the five value slots format zeros.
        let mut values = window.iter().copied().chain(std::iter::repeat(0));

        let mut i = 0;
        while i < fmt.len() {
            let c = fmt[i];
            i += 1;
            if c != b'%' {
                outbuf.push(c);
                continue;
            }
            if i >= fmt.len() {
                outbuf.push(b'%');
                break;
            }
            let mut width = 0usize;
            while i < fmt.len() && fmt[i].is_ascii_digit() {
                width = width * 10 + (fmt[i] - b'0') as usize;
                i += 1;
            }
            let mut precision = None;
            if i < fmt.len() && fmt[i] == b'.' {
                i += 1;
                let mut p = 0usize;
                while i < fmt.len() && fmt[i].is_ascii_digit() {
                    p = p * 10 + (fmt[i] - b'0') as usize;
                    i += 1;
                }
                precision = Some(p);
            }
            if i >= fmt.len() {
                outbuf.push(b'%');
                break;
            }
            let conv = fmt[i];
            i += 1;
            match conv {
                b'd' => {
                    let v = values.next().unwrap_or(0);
                    pad_into(&mut outbuf, v.to_string().as_bytes(), width);
                }
                b'x' => {
                    let v = values.next().unwrap_or(0);
                    pad_into(&mut outbuf, format!("{v:x}").as_bytes(), width);
                }
                b'c' => {
                    let v = values.next().unwrap_or(0);
                    outbuf.push(v as u8);
                }
                b's' => {
                    let v = values.next().unwrap_or(0);
                    let mut s = self.read_cstr(v)?;
                    if let Some(p) = precision {
                        s.truncate(p);
                    }
                    pad_into(&mut outbuf, &s, width);
                }
                b'%' => outbuf.push(b'%'),
                other => {
                    outbuf.push(b'%');
                    outbuf.push(other);
                }
            }
        }

        self.out.write_all(&outbuf)?;
        self.out.flush()?;
        self.a = outbuf.len() as i64;
        Ok(())
    }

    fn sys_malloc(&mut self) -> Result<(), VmError> {
        let n = self.sys_arg(0)?;
        self.a = 0;
        if n >= 0 {
            let size = ((n as usize) + WORD_BYTES - 1) & !(WORD_BYTES - 1);
            if self
                .heap_next
                .checked_add(size)
                .is_some_and(|end| end <= self.layout.stack_base)
            {
                self.a = self.heap_next as i64;
                self.heap_next += size;
            }
        }
        Ok(())
    }

    fn sys_memset(&mut self) -> Result<(), VmError> {
        let dst = self.sys_arg(2)?;
        let val = self.sys_arg(1)?;
        let n = self.sys_arg(0)?;
        let (start, end) = self.byte_range(dst, n)?;
        self.mem[start..end].fill(val as u8);
        self.a = dst;
        Ok(())
    }

    fn sys_memcmp(&mut self) -> Result<(), VmError> {
        let p1 = self.sys_arg(2)?;
        let p2 = self.sys_arg(1)?;
        let n = self.sys_arg(0)?;
        let (s1, e1) = self.byte_range(p1, n)?;
        let (s2, _) = self.byte_range(p2, n)?;
        self.a = 0;
        for k in 0..(e1 - s1) {
            let b1 = self.mem[s1 + k];
            let b2 = self.mem[s2 + k];
            if b1 != b2 {
                self.a = b1 as i64 - b2 as i64;
                break;
            }
        }
        Ok(())
    }

    /// Validate `[addr, addr+n)` against guest memory; a bad range is a
    /// fault, as it would be for the host C library.
    fn byte_range(&self, addr: i64, n: i64) -> Result<(usize, usize), VmError> {
        let bad = VmError::BadAddress { addr, cycle: self.cycle };
        if addr < Layout::NULL_GUARD as i64 || n < 0 {
            return Err(bad);
        }
        let start = addr as usize;
        match start.checked_add(n as usize) {
            Some(end) if end <= self.mem.len() => Ok((start, end)),
            _ => Err(bad),
        }
    }
}

fn pad_into(out: &mut Vec<u8>, s: &[u8], width: usize) {
    for _ in s.len()..width {
        out.push(b' ');
    }
    out.extend_from_slice(s);
}
