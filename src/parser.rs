//! The single-pass parser and code emitter.
//!
//! There is no syntax tree. Expression and statement parsing append VM
//! instructions to the code pool as tokens are consumed, tracking only `ty`,
//! the type of the value the emitted code will leave in the accumulator.
//! Operator precedence is handled by climbing: `expr(min)` parses a primary,
//! then keeps folding operators while the lookahead token's precedence (its
//! position in the `Token` ordering) clears `min`. Forward jumps are emitted
//! with placeholder targets held in locals on the parser's own call stack
//! and patched once the target address is known.

use crate::code::{CodePool, DataPool, Op};
use crate::diagnostic::Diagnostic;
use crate::lexer::Scanner;
use crate::lexeme::Token;
use crate::sym::{Class, SymId, SymbolTable};
use crate::types::{Ty, WORD};
use crate::vm::Layout;
use crate::{CompileOptions, Program};

const MAX_EXPR_DEPTH: u32 = 256;

pub(crate) struct Parser<'src> {
    scan: Scanner<'src>,
    syms: SymbolTable,
    code: CodePool,
    data: DataPool,
    layout: Layout,
    /// Type of the value the most recently emitted expression leaves in the
    /// accumulator.
    ty: Ty,
    /// Frame-slot bookkeeping for the function being parsed: locals live
    /// below `loc`, parameters above it.
    loc: i64,
    depth: u32,
    /// Call sites whose `JSR` operand awaits the function's definition.
    fixups: Vec<(SymId, usize)>,
}

impl<'src> Parser<'src> {
    pub(crate) fn parse(source: &'src [u8], options: &CompileOptions) -> Result<Program, Diagnostic> {
        let layout = Layout::new(options.pool_size);
        let mut syms = SymbolTable::with_pool_size(options.pool_size);
        syms.seed();
        let mut parser = Parser {
            scan: Scanner::new(source, options.listing),
            syms,
            code: CodePool::new(layout.code_words),
            data: DataPool::new(layout.data_base as i64, options.pool_size),
            layout,
            ty: Ty::INT,
            loc: 0,
            depth: 0,
            fixups: Vec::new(),
        };
        parser.run()
    }

    fn run(&mut self) -> Result<Program, Diagnostic> {
        self.next()?;
        while self.tok() != Token::Eof {
            self.global_group()?;
        }

        if let Some(&(id, _)) = self.fixups.first() {
            let name = self.syms.get(id).name.clone();
            return Err(self.err(format!("undefined function {name}")));
        }

        let entry = match self.syms.lookup("main").map(|id| self.syms.get(id)) {
            Some(s) if s.class == Some(Class::Fun) && s.val >= 0 => s.val as usize,
            _ => return Err(self.err("main() not defined")),
        };

        Ok(Program {
            code: std::mem::replace(&mut self.code, CodePool::new(0)).into_words(),
            data: std::mem::replace(&mut self.data, DataPool::new(0, 0)).into_bytes(),
            entry,
            layout: self.layout,
        })
    }

    // ─── Plumbing ──────────────────────────────────────────────────

    fn tok(&self) -> Token {
        self.scan.tok
    }

    fn next(&mut self) -> Result<(), Diagnostic> {
        self.scan.advance(&mut self.syms, &mut self.data, &self.code)
    }

    fn err(&self, msg: impl Into<String>) -> Diagnostic {
        Diagnostic::error(msg, self.scan.line, self.scan.span())
    }

    fn expect(&mut self, tok: Token, msg: &str) -> Result<(), Diagnostic> {
        if self.tok() == tok {
            self.next()
        } else {
            Err(self.err(msg))
        }
    }

    fn emit(&mut self, op: Op) -> Result<(), Diagnostic> {
        self.code
            .emit(op)
            .map_err(|_| self.err("code pool exhausted"))
    }

    fn emit_with(&mut self, op: Op, operand: i64) -> Result<(), Diagnostic> {
        self.code
            .emit_with(op, operand)
            .map_err(|_| self.err("code pool exhausted"))
    }

    /// Emit a forward jump; the returned slot is patched later.
    fn jump(&mut self, op: Op) -> Result<usize, Diagnostic> {
        self.code
            .emit_jump(op)
            .map_err(|_| self.err("code pool exhausted"))
    }

    /// Turn the tail of the last emitted operand from an rvalue back into an
    /// lvalue: the pending `LI`/`LC` is removed, leaving the address in the
    /// accumulator, and the load op is returned so callers can reissue it.
    fn take_load(&mut self, msg: &str) -> Result<Op, Diagnostic> {
        self.code.pop_if_load().ok_or_else(|| self.err(msg))
    }

    // ─── Expressions ───────────────────────────────────────────────

    /// Parse one expression at the given precedence floor, emitting code
    /// that leaves its value in the accumulator and its type in `self.ty`.
    fn expr(&mut self, min: Token) -> Result<(), Diagnostic> {
        self.depth += 1;
        if self.depth > MAX_EXPR_DEPTH {
            return Err(self.err("expression too deeply nested"));
        }
        self.primary()?;
        self.climb(min)?;
        self.depth -= 1;
        Ok(())
    }

    fn primary(&mut self) -> Result<(), Diagnostic> {
        match self.tok() {
            Token::Eof => Err(self.err("unexpected eof in expression")),

            Token::Num => {
                let v = self.scan.ival;
                self.emit_with(Op::Imm, v)?;
                self.next()?;
                self.ty = Ty::INT;
                Ok(())
            }

            Token::Str => {
                // Adjacent string literals concatenate: the scanner appends
                // each run of bytes, and only once the run ends do we seal it
                // with the terminator and re-align the data pointer.
                let addr = self.scan.ival;
                self.emit_with(Op::Imm, addr)?;
                self.next()?;
                while self.tok() == Token::Str {
                    self.next()?;
                }
                if self.data.push(0).is_err() || self.data.align().is_err() {
                    return Err(self.err("data pool exhausted"));
                }
                self.ty = Ty::CHAR.ptr_to();
                Ok(())
            }

            Token::Sizeof => {
                self.next()?;
                self.expect(Token::LParen, "open paren expected in sizeof")?;
                let mut ty = Ty::INT;
                if self.tok() == Token::Int {
                    self.next()?;
                } else if self.tok() == Token::Char {
                    self.next()?;
                    ty = Ty::CHAR;
                }
                while self.tok() == Token::Mul {
                    self.next()?;
                    ty = ty.ptr_to();
                }
                self.expect(Token::RParen, "close paren expected in sizeof")?;
                self.emit_with(Op::Imm, ty.size())?;
                self.ty = Ty::INT;
                Ok(())
            }

            Token::Id => {
                let id = self.scan.id;
                self.next()?;
                if self.tok() == Token::LParen {
                    return self.call(id);
                }
                let (class, ty, val) = {
                    let s = self.syms.get(id);
                    (s.class, s.ty, s.val)
                };
                match class {
                    Some(Class::Num) => {
                        self.emit_with(Op::Imm, val)?;
                        self.ty = Ty::INT;
                    }
                    Some(Class::Loc) => {
                        self.emit_with(Op::Lea, self.loc - val)?;
                        self.ty = ty;
                        self.emit(if ty.is_byte() { Op::Lc } else { Op::Li })?;
                    }
                    Some(Class::Glo) => {
                        self.emit_with(Op::Imm, val)?;
                        self.ty = ty;
                        self.emit(if ty.is_byte() { Op::Lc } else { Op::Li })?;
                    }
                    _ => return Err(self.err("undefined variable")),
                }
                Ok(())
            }

            Token::LParen => {
                self.next()?;
                if self.tok() == Token::Int || self.tok() == Token::Char {
                    // A cast: parse the type, then a unary-precedence
                    // operand, and override its type.
                    let mut cast = if self.tok() == Token::Int { Ty::INT } else { Ty::CHAR };
                    self.next()?;
                    while self.tok() == Token::Mul {
                        self.next()?;
                        cast = cast.ptr_to();
                    }
                    self.expect(Token::RParen, "bad cast")?;
                    self.expr(Token::Inc)?;
                    self.ty = cast;
                } else {
                    self.expr(Token::Assign)?;
                    self.expect(Token::RParen, "close paren expected")?;
                }
                Ok(())
            }

            Token::Mul => {
                self.next()?;
                self.expr(Token::Inc)?;
                self.ty = self.ty.deref().ok_or_else(|| self.err("bad dereference"))?;
                self.emit(if self.ty.is_byte() { Op::Lc } else { Op::Li })
            }

            Token::And => {
                self.next()?;
                self.expr(Token::Inc)?;
                self.take_load("bad address-of")?;
                self.ty = self.ty.ptr_to();
                Ok(())
            }

            Token::Bang => {
                self.next()?;
                self.expr(Token::Inc)?;
                self.emit(Op::Psh)?;
                self.emit_with(Op::Imm, 0)?;
                self.emit(Op::Eq)?;
                self.ty = Ty::INT;
                Ok(())
            }

            Token::Tilde => {
                self.next()?;
                self.expr(Token::Inc)?;
                self.emit(Op::Psh)?;
                self.emit_with(Op::Imm, -1)?;
                self.emit(Op::Xor)?;
                self.ty = Ty::INT;
                Ok(())
            }

            Token::Add => {
                self.next()?;
                self.expr(Token::Inc)?;
                self.ty = Ty::INT;
                Ok(())
            }

            Token::Sub => {
                self.next()?;
                if self.tok() == Token::Num {
                    let v = self.scan.ival.wrapping_neg();
                    self.emit_with(Op::Imm, v)?;
                    self.next()?;
                } else {
                    self.emit_with(Op::Imm, -1)?;
                    self.emit(Op::Psh)?;
                    self.expr(Token::Inc)?;
                    self.emit(Op::Mul)?;
                }
                self.ty = Ty::INT;
                Ok(())
            }

            t @ (Token::Inc | Token::Dec) => {
                self.next()?;
                self.expr(Token::Inc)?;
                let load = self.take_load("bad lvalue in pre-increment")?;
                self.emit(Op::Psh)?;
                self.emit(load)?;
                self.emit(Op::Psh)?;
                self.emit_with(Op::Imm, self.ty.stride())?;
                self.emit(if t == Token::Inc { Op::Add } else { Op::Sub })?;
                self.emit(if self.ty.is_byte() { Op::Sc } else { Op::Si })
            }

            _ => Err(self.err("bad expression")),
        }
    }

    /// Push arguments left to right, then dispatch to a syscall or `JSR`.
    fn call(&mut self, id: SymId) -> Result<(), Diagnostic> {
        self.next()?;
        let mut argc = 0i64;
        while self.tok() != Token::RParen {
            self.expr(Token::Assign)?;
            self.emit(Op::Psh)?;
            argc += 1;
            if self.tok() == Token::Comma {
                self.next()?;
            }
        }
        self.next()?;

        let (class, val) = {
            let s = self.syms.get(id);
            (s.class, s.val)
        };
        match class {
            Some(Class::Sys) => {
                let op = Op::from_word(val).ok_or_else(|| self.err("bad function call"))?;
                self.emit(op)?;
            }
            Some(Class::Fun) if val >= 0 => {
                self.emit_with(Op::Jsr, val)?;
            }
            Some(Class::Fun) => {
                // Known only from earlier call sites; add another fixup.
                let at = self.jump(Op::Jsr)?;
                self.fixups.push((id, at));
            }
            None => {
                // First sight of the name: implicitly declare a function
                // returning int and patch the target when it is defined.
                let s = self.syms.get_mut(id);
                s.class = Some(Class::Fun);
                s.ty = Ty::INT;
                s.val = -1;
                let at = self.jump(Op::Jsr)?;
                self.fixups.push((id, at));
            }
            _ => return Err(self.err("bad function call")),
        }
        if argc > 0 {
            self.emit_with(Op::Adj, argc)?;
        }
        self.ty = self.syms.get(id).ty;
        Ok(())
    }

    /// The precedence climb over binary, ternary, postfix, and assignment
    /// operators.
    fn climb(&mut self, min: Token) -> Result<(), Diagnostic> {
        while self.tok() >= min {
            let left = self.ty;
            match self.tok() {
                Token::Assign => {
                    self.next()?;
                    self.take_load("bad lvalue in assignment")?;
                    self.emit(Op::Psh)?;
                    self.expr(Token::Assign)?;
                    self.ty = left;
                    self.emit(if left.is_byte() { Op::Sc } else { Op::Si })?;
                }

                Token::Cond => {
                    self.next()?;
                    let no = self.jump(Op::Bz)?;
                    self.expr(Token::Assign)?;
                    self.expect(Token::Colon, "conditional missing colon")?;
                    self.code.patch(no, self.code.here() + 2);
                    let done = self.jump(Op::Jmp)?;
                    self.expr(Token::Cond)?;
                    self.code.patch(done, self.code.here());
                }

                Token::Lor => {
                    self.next()?;
                    let out = self.jump(Op::Bnz)?;
                    self.expr(Token::Lan)?;
                    self.code.patch(out, self.code.here());
                    self.ty = Ty::INT;
                }

                Token::Lan => {
                    self.next()?;
                    let out = self.jump(Op::Bz)?;
                    self.expr(Token::Or)?;
                    self.code.patch(out, self.code.here());
                    self.ty = Ty::INT;
                }

                Token::Or => self.binary(Token::Xor, Op::Or)?,
                Token::Xor => self.binary(Token::And, Op::Xor)?,
                Token::And => self.binary(Token::Eq, Op::And)?,
                Token::Eq => self.binary(Token::Lt, Op::Eq)?,
                Token::Ne => self.binary(Token::Lt, Op::Ne)?,
                Token::Lt => self.binary(Token::Shl, Op::Lt)?,
                Token::Gt => self.binary(Token::Shl, Op::Gt)?,
                Token::Le => self.binary(Token::Shl, Op::Le)?,
                Token::Ge => self.binary(Token::Shl, Op::Ge)?,
                Token::Shl => self.binary(Token::Add, Op::Shl)?,
                Token::Shr => self.binary(Token::Add, Op::Shr)?,
                Token::Mul => self.binary(Token::Inc, Op::Mul)?,
                Token::Div => self.binary(Token::Inc, Op::Div)?,
                Token::Mod => self.binary(Token::Inc, Op::Mod)?,

                Token::Add => {
                    self.next()?;
                    self.emit(Op::Psh)?;
                    self.expr(Token::Mul)?;
                    self.ty = left;
                    if left.word_scaled() {
                        // Pointer arithmetic scales the integer operand by
                        // the pointee size.
                        self.emit(Op::Psh)?;
                        self.emit_with(Op::Imm, WORD)?;
                        self.emit(Op::Mul)?;
                    }
                    self.emit(Op::Add)?;
                }

                Token::Sub => {
                    self.next()?;
                    self.emit(Op::Psh)?;
                    self.expr(Token::Mul)?;
                    if left.word_scaled() && left == self.ty {
                        // Pointer difference: subtract, then divide back
                        // down to an element count.
                        self.emit(Op::Sub)?;
                        self.emit(Op::Psh)?;
                        self.emit_with(Op::Imm, WORD)?;
                        self.emit(Op::Div)?;
                        self.ty = Ty::INT;
                    } else {
                        self.ty = left;
                        if left.word_scaled() {
                            self.emit(Op::Psh)?;
                            self.emit_with(Op::Imm, WORD)?;
                            self.emit(Op::Mul)?;
                        }
                        self.emit(Op::Sub)?;
                    }
                }

                t @ (Token::Inc | Token::Dec) => {
                    // Postfix: store the stepped value, then step the
                    // accumulator back so the expression yields the old one.
                    let load = self.take_load("bad lvalue in post-increment")?;
                    self.emit(Op::Psh)?;
                    self.emit(load)?;
                    self.emit(Op::Psh)?;
                    self.emit_with(Op::Imm, self.ty.stride())?;
                    self.emit(if t == Token::Inc { Op::Add } else { Op::Sub })?;
                    self.emit(if self.ty.is_byte() { Op::Sc } else { Op::Si })?;
                    self.emit(Op::Psh)?;
                    self.emit_with(Op::Imm, self.ty.stride())?;
                    self.emit(if t == Token::Inc { Op::Sub } else { Op::Add })?;
                    self.next()?;
                }

                Token::Brak => {
                    self.next()?;
                    self.emit(Op::Psh)?;
                    self.expr(Token::Assign)?;
                    self.expect(Token::RBracket, "close bracket expected")?;
                    if left.word_scaled() {
                        self.emit(Op::Psh)?;
                        self.emit_with(Op::Imm, WORD)?;
                        self.emit(Op::Mul)?;
                    } else if !left.is_ptr() {
                        return Err(self.err("pointer type expected"));
                    }
                    self.emit(Op::Add)?;
                    self.ty = left
                        .deref()
                        .ok_or_else(|| self.err("pointer type expected"))?;
                    self.emit(if self.ty.is_byte() { Op::Lc } else { Op::Li })?;
                }

                _ => return Err(self.err("compiler error: unexpected operator")),
            }
        }
        Ok(())
    }

    /// The common binary-operator tail: push the left value, parse the right
    /// operand one precedence tier up, fold with `op`.
    fn binary(&mut self, rhs_min: Token, op: Op) -> Result<(), Diagnostic> {
        self.next()?;
        self.emit(Op::Psh)?;
        self.expr(rhs_min)?;
        self.emit(op)?;
        self.ty = Ty::INT;
        Ok(())
    }

    // ─── Statements ────────────────────────────────────────────────

    fn stmt(&mut self) -> Result<(), Diagnostic> {
        match self.tok() {
            Token::If => {
                self.next()?;
                self.expect(Token::LParen, "open paren expected")?;
                self.expr(Token::Assign)?;
                self.expect(Token::RParen, "close paren expected")?;
                let no = self.jump(Op::Bz)?;
                self.stmt()?;
                if self.tok() == Token::Else {
                    self.code.patch(no, self.code.here() + 2);
                    let done = self.jump(Op::Jmp)?;
                    self.next()?;
                    self.stmt()?;
                    self.code.patch(done, self.code.here());
                } else {
                    self.code.patch(no, self.code.here());
                }
                Ok(())
            }

            Token::While => {
                self.next()?;
                let top = self.code.here();
                self.expect(Token::LParen, "open paren expected")?;
                self.expr(Token::Assign)?;
                self.expect(Token::RParen, "close paren expected")?;
                let out = self.jump(Op::Bz)?;
                self.stmt()?;
                self.emit_with(Op::Jmp, top)?;
                self.code.patch(out, self.code.here());
                Ok(())
            }

            Token::Return => {
                self.next()?;
                if self.tok() != Token::Semi {
                    self.expr(Token::Assign)?;
                }
                self.emit(Op::Lev)?;
                self.expect(Token::Semi, "semicolon expected")
            }

            Token::LBrace => {
                self.next()?;
                while self.tok() != Token::RBrace {
                    self.stmt()?;
                }
                self.next()
            }

            Token::Semi => self.next(),

            _ => {
                self.expr(Token::Assign)?;
                self.expect(Token::Semi, "semicolon expected")
            }
        }
    }

    // ─── Top level ─────────────────────────────────────────────────

    /// One top-level group: an enum declaration and/or a comma-separated run
    /// of global declarations sharing a base type, ended by `;` (or by a
    /// function body's closing brace).
    fn global_group(&mut self) -> Result<(), Diagnostic> {
        let mut base = Ty::INT;
        match self.tok() {
            Token::Int => self.next()?,
            Token::Char => {
                self.next()?;
                base = Ty::CHAR;
            }
            Token::Enum => self.enum_decl()?,
            _ => {}
        }

        while self.tok() != Token::Semi && self.tok() != Token::RBrace {
            let mut ty = base;
            while self.tok() == Token::Mul {
                self.next()?;
                ty = ty.ptr_to();
            }
            if self.tok() != Token::Id {
                return Err(self.err("bad global declaration"));
            }
            let id = self.scan.id;
            let (class, val) = {
                let s = self.syms.get(id);
                (s.class, s.val)
            };
            // A forward-referenced function may now be defined; anything
            // else already bound is a duplicate.
            let forward = class == Some(Class::Fun) && val < 0;
            if class.is_some() && !forward {
                return Err(self.err("duplicate global definition"));
            }
            self.next()?;
            self.syms.get_mut(id).ty = ty;

            if self.tok() == Token::LParen {
                self.function_def(id)?;
            } else if forward {
                return Err(self.err("duplicate global definition"));
            } else {
                let s = self.syms.get_mut(id);
                s.class = Some(Class::Glo);
                let addr = self
                    .data
                    .alloc_word()
                    .map_err(|_| self.err("data pool exhausted"))?;
                self.syms.get_mut(id).val = addr;
            }

            if self.tok() == Token::Comma {
                self.next()?;
            }
        }
        self.next()
    }

    /// `enum [name] { A [= num], B, ... };`: each name becomes an integer
    /// constant; there is no enum type.
    fn enum_decl(&mut self) -> Result<(), Diagnostic> {
        self.next()?;
        if self.tok() != Token::LBrace {
            self.next()?; // optional tag, ignored
        }
        if self.tok() == Token::LBrace {
            self.next()?;
            let mut value = 0i64;
            while self.tok() != Token::RBrace {
                if self.tok() != Token::Id {
                    return Err(self.err("bad enum identifier"));
                }
                let id = self.scan.id;
                self.next()?;
                if self.tok() == Token::Assign {
                    self.next()?;
                    if self.tok() != Token::Num {
                        return Err(self.err("bad enum initializer"));
                    }
                    value = self.scan.ival;
                    self.next()?;
                }
                let s = self.syms.get_mut(id);
                s.class = Some(Class::Num);
                s.ty = Ty::INT;
                s.val = value;
                value += 1;
                if self.tok() == Token::Comma {
                    self.next()?;
                }
            }
            self.next()?;
        }
        Ok(())
    }

    /// A function definition: parameters, locals, body. Parameters count up
    /// from 0 and locals continue past `loc`, so `LEA loc - slot` reaches
    /// arguments at positive and locals at negative frame offsets.
    fn function_def(&mut self, id: SymId) -> Result<(), Diagnostic> {
        let entry = self.code.here();
        {
            let s = self.syms.get_mut(id);
            s.class = Some(Class::Fun);
            s.val = entry;
        }
        // Earlier call sites can now be resolved.
        let pending: Vec<usize> = self
            .fixups
            .iter()
            .filter(|&&(sid, _)| sid == id)
            .map(|&(_, at)| at)
            .collect();
        for at in pending {
            self.code.patch(at, entry);
        }
        self.fixups.retain(|&(sid, _)| sid != id);

        self.next()?;
        let mut slot = 0i64;
        while self.tok() != Token::RParen {
            let mut ty = Ty::INT;
            if self.tok() == Token::Int {
                self.next()?;
            } else if self.tok() == Token::Char {
                self.next()?;
                ty = Ty::CHAR;
            }
            while self.tok() == Token::Mul {
                self.next()?;
                ty = ty.ptr_to();
            }
            if self.tok() != Token::Id {
                return Err(self.err("bad parameter declaration"));
            }
            let pid = self.scan.id;
            if self.syms.get(pid).class == Some(Class::Loc) {
                return Err(self.err("duplicate parameter definition"));
            }
            self.syms.shadow_local(pid, ty, slot);
            slot += 1;
            self.next()?;
            if self.tok() == Token::Comma {
                self.next()?;
            }
        }
        self.next()?;
        if self.tok() != Token::LBrace {
            return Err(self.err("bad function definition"));
        }
        slot += 1;
        self.loc = slot;
        self.next()?;

        // Locals are declared before the first statement.
        while self.tok() == Token::Int || self.tok() == Token::Char {
            let base = if self.tok() == Token::Int { Ty::INT } else { Ty::CHAR };
            self.next()?;
            while self.tok() != Token::Semi {
                let mut ty = base;
                while self.tok() == Token::Mul {
                    self.next()?;
                    ty = ty.ptr_to();
                }
                if self.tok() != Token::Id {
                    return Err(self.err("bad local declaration"));
                }
                let lid = self.scan.id;
                if self.syms.get(lid).class == Some(Class::Loc) {
                    return Err(self.err("duplicate local definition"));
                }
                slot += 1;
                self.syms.shadow_local(lid, ty, slot);
                self.next()?;
                if self.tok() == Token::Comma {
                    self.next()?;
                }
            }
            self.next()?;
        }

        self.emit_with(Op::Ent, slot - self.loc)?;
        while self.tok() != Token::RBrace {
            self.stmt()?;
        }
        self.emit(Op::Lev)?;

        self.syms.restore_locals();
        Ok(())
    }
}
