//! Parser for the textual IR form emitted by `lir::write`.
//!
//! Source value/block/entity numbers are renumbered into fresh entities;
//! only phi operands may reference values that are defined further down.

mod lexer;

use ahash::AHashMap;
use lir::{
    verify_function, AbiParam, Block, Function, FunctionSignature, FuncRef, InstructionData,
    MemEffects, Module, Opcode, Type, Value,
};

use crate::lexer::{Lexer, LocatedToken, Token};

pub type ParseResult<T> = Result<T, String>;

/// Parse a single function.
pub fn parse_function(source: &str) -> ParseResult<Function> {
    let mut parser = Parser::new(source);
    let func = parser.parse_function(None)?;
    if parser.peek()?.is_some() {
        return parser.err("trailing input after function");
    }
    Ok(func)
}

/// Parse a module: global declarations followed by functions.
pub fn parse_module(source: &str) -> ParseResult<Module> {
    let mut parser = Parser::new(source);
    let mut module = Module::new();
    let mut globals: AHashMap<u32, lir::GlobalRef> = AHashMap::new();
    let mut shadow_links: Vec<(lir::GlobalRef, u32)> = Vec::new();

    while let Some(tok) = parser.peek()? {
        match tok {
            Token::Global(num) => {
                parser.advance()?;
                parser.expect(Token::Equal, "'='")?;
                parser.expect_keyword("global")?;
                let ty = parser.expect_type()?;
                let global = module.declare_global(format!("g{}", num), ty);
                if globals.insert(num, global).is_some() {
                    return parser.err("redefinition of global");
                }
                if let Some(Token::Identifier("shadow")) = parser.peek()? {
                    parser.advance()?;
                    match parser.next_token()? {
                        Token::Global(shadow) => shadow_links.push((global, shadow)),
                        _ => return parser.err("expected shadow global"),
                    }
                }
            }
            Token::Identifier("function") => {
                let func = parser.parse_function(Some(&globals))?;
                module.define_function(func);
            }
            _ => return parser.err("expected global or function"),
        }
    }

    for (global, shadow_num) in shadow_links {
        let shadow = *globals
            .get(&shadow_num)
            .ok_or_else(|| "shadow references undeclared global".to_string())?;
        module.set_shadow(global, shadow);
    }
    Ok(module)
}

struct Parser<'a> {
    lexer: Lexer<'a>,
    lookahead: Option<LocatedToken<'a>>,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Parser { lexer: Lexer::new(source), lookahead: None, line: 1 }
    }

    fn err<T>(&self, message: impl Into<String>) -> ParseResult<T> {
        Err(format!("line {}: {}", self.line, message.into()))
    }

    fn fill(&mut self) -> ParseResult<()> {
        if self.lookahead.is_none() {
            match self.lexer.next() {
                Some(Ok(tok)) => {
                    self.line = tok.line;
                    self.lookahead = Some(tok);
                }
                Some(Err(line)) => return Err(format!("line {}: invalid character", line)),
                None => {}
            }
        }
        Ok(())
    }

    fn peek(&mut self) -> ParseResult<Option<Token<'a>>> {
        self.fill()?;
        Ok(self.lookahead.map(|tok| tok.token))
    }

    fn advance(&mut self) -> ParseResult<Token<'a>> {
        self.fill()?;
        match self.lookahead.take() {
            Some(tok) => Ok(tok.token),
            None => self.err("unexpected end of input"),
        }
    }

    fn next_token(&mut self) -> ParseResult<Token<'a>> {
        self.advance()
    }

    fn expect(&mut self, want: Token<'a>, what: &str) -> ParseResult<()> {
        let got = self.advance()?;
        if got != want {
            return self.err(format!("expected {}", what));
        }
        Ok(())
    }

    fn expect_keyword(&mut self, word: &str) -> ParseResult<()> {
        match self.advance()? {
            Token::Identifier(id) if id == word => Ok(()),
            _ => self.err(format!("expected '{}'", word)),
        }
    }

    fn expect_type(&mut self) -> ParseResult<Type> {
        match self.advance()? {
            Token::Identifier(id) => {
                Type::from_name(id).ok_or_else(|| format!("line {}: unknown type", self.line))
            }
            _ => self.err("expected type"),
        }
    }

    fn eat(&mut self, want: Token<'a>) -> ParseResult<bool> {
        if self.peek()? == Some(want) {
            self.advance()?;
            return Ok(true);
        }
        Ok(false)
    }
}

/// Per-function parsing state.
///
/// Source value and block numbers are preserved: the entity spaces are
/// padded with unused placeholders so that printing a parsed function
/// reproduces the source numbering.
struct FuncParser<'a, 'b> {
    parser: &'b mut Parser<'a>,
    func: Function,
    func_refs: AHashMap<u32, FuncRef>,
    slots: AHashMap<u32, lir::StackSlot>,
    globals: Option<&'b AHashMap<u32, lir::GlobalRef>>,
}

impl<'a> Parser<'a> {
    fn parse_function(
        &mut self,
        globals: Option<&AHashMap<u32, lir::GlobalRef>>,
    ) -> ParseResult<Function> {
        self.expect_keyword("function")?;
        let sig = self.parse_signature()?;
        self.expect(Token::LBrace, "'{'")?;
        let mut fp = FuncParser {
            func: Function::with_signature(sig),
            parser: self,
            func_refs: AHashMap::new(),
            slots: AHashMap::new(),
            globals,
        };
        fp.parse_preamble()?;
        fp.parse_body()?;
        let func = fp.func;
        verify_function(&func).map_err(|e| format!("verifier: {}", e))?;
        Ok(func)
    }

    /// `%name(f64, ptr readonly nocapture, ...) -> f64, i64 [readonly]`
    fn parse_signature(&mut self) -> ParseResult<FunctionSignature> {
        let name = match self.advance()? {
            Token::Name(name) => name.to_owned(),
            _ => return self.err("expected function name"),
        };
        self.expect(Token::LPar, "'('")?;
        let mut params = Vec::new();
        if self.peek()? != Some(Token::RPar) {
            loop {
                let ty = self.expect_type()?;
                let mut param = AbiParam::new(ty);
                while let Some(Token::Identifier(attr)) = self.peek()? {
                    match attr {
                        "readonly" => param.readonly = true,
                        "readnone" => param.readnone = true,
                        "nocapture" => param.nocapture = true,
                        _ => return self.err("unknown parameter attribute"),
                    }
                    self.advance()?;
                }
                params.push(param);
                if !self.eat(Token::Comma)? {
                    break;
                }
            }
        }
        self.expect(Token::RPar, "')'")?;
        let mut returns = Vec::new();
        if self.eat(Token::Arrow)? {
            loop {
                returns.push(self.expect_type()?);
                if !self.eat(Token::Comma)? {
                    break;
                }
            }
        }
        let mut sig = FunctionSignature::new(name, params, returns);
        if let Some(Token::Identifier(effects @ ("readonly" | "readnone"))) = self.peek()? {
            sig.effects =
                if effects == "readonly" { MemEffects::ReadOnly } else { MemEffects::ReadNone };
            self.advance()?;
        }
        Ok(sig)
    }
}

impl<'a, 'b> FuncParser<'a, 'b> {
    fn parse_preamble(&mut self) -> ParseResult<()> {
        loop {
            match self.parser.peek()? {
                Some(Token::FuncRef(num)) => {
                    self.parser.advance()?;
                    self.parser.expect(Token::Equal, "'='")?;
                    let sig = self.parser.parse_signature()?;
                    let func_ref = self.func.import_signature(sig);
                    if self.func_refs.insert(num, func_ref).is_some() {
                        return self.parser.err("redefinition of function reference");
                    }
                }
                Some(Token::StackSlot(num)) => {
                    self.parser.advance()?;
                    self.parser.expect(Token::Equal, "'='")?;
                    self.parser.expect_keyword("slot")?;
                    let ty = self.parser.expect_type()?;
                    let slot = self.func.create_stack_slot(ty);
                    if self.slots.insert(num, slot).is_some() {
                        return self.parser.err("redefinition of stack slot");
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn parse_body(&mut self) -> ParseResult<()> {
        loop {
            match self.parser.peek()? {
                Some(Token::Block(_)) => self.parse_block()?,
                Some(Token::RBrace) => {
                    self.parser.advance()?;
                    return Ok(());
                }
                _ => return self.parser.err("expected block header or '}'"),
            }
        }
    }

    /// Source block numbers map to the same entity numbers; the block
    /// space is padded with never-inserted blocks where the source skips.
    fn ensure_block(&mut self, num: u32) -> Block {
        while self.func.dfg.num_blocks() <= num as usize {
            self.func.dfg.make_block();
        }
        Block::from(num as usize)
    }

    /// Source value numbers map to the same entity numbers; gaps are
    /// padded with detached placeholder values that nothing uses.
    fn ensure_value(&mut self, num: u32) -> Value {
        while self.func.dfg.num_values() <= num as usize {
            self.func.dfg.make_detached_value(Type::F64);
        }
        Value::from(num as usize)
    }

    /// A value mentioned as an operand. Phi operands may be forward
    /// references; everything else must already be defined.
    fn use_value(&mut self, num: u32, allow_forward: bool) -> ParseResult<Value> {
        let val = self.ensure_value(num);
        if !allow_forward && !self.func.dfg.value_is_defined(val) {
            return self.parser.err(format!("use of undefined value v{}", num));
        }
        Ok(val)
    }

    /// A value mentioned as a definition (result or block param).
    fn def_value(&mut self, num: u32) -> ParseResult<Value> {
        let val = self.ensure_value(num);
        if self.func.dfg.value_is_defined(val) {
            return self.parser.err(format!("redefinition of v{}", num));
        }
        Ok(val)
    }

    fn expect_value_use(&mut self) -> ParseResult<Value> {
        match self.parser.advance()? {
            Token::Value(num) => self.use_value(num, false),
            _ => self.parser.err("expected value"),
        }
    }

    fn expect_block_ref(&mut self) -> ParseResult<Block> {
        match self.parser.advance()? {
            Token::Block(num) => Ok(self.ensure_block(num)),
            _ => self.parser.err("expected block"),
        }
    }

    fn parse_block(&mut self) -> ParseResult<()> {
        let num = match self.parser.advance()? {
            Token::Block(num) => num,
            _ => unreachable!(),
        };
        let block = self.ensure_block(num);
        if self.func.layout.is_block_inserted(block) {
            return self.parser.err(format!("redefinition of block{}", num));
        }
        self.func.layout.append_block(block);

        if self.parser.eat(Token::LPar)? {
            loop {
                let param = match self.parser.advance()? {
                    Token::Value(num) => self.def_value(num)?,
                    _ => return self.parser.err("expected block parameter"),
                };
                self.parser.expect(Token::Colon, "':'")?;
                let ty = self.parser.expect_type()?;
                self.func.dfg.attach_block_param(block, param, ty);
                if !self.parser.eat(Token::Comma)? {
                    break;
                }
            }
            self.parser.expect(Token::RPar, "')'")?;
        }
        self.parser.expect(Token::Colon, "':'")?;

        loop {
            match self.parser.peek()? {
                Some(Token::Block(_)) | Some(Token::RBrace) | None => return Ok(()),
                _ => self.parse_instruction(block)?,
            }
        }
    }

    fn parse_instruction(&mut self, block: Block) -> ParseResult<()> {
        // Optional result list: `v1 = ...` / `v1, v2 = ...`.
        let mut results = Vec::new();
        if let Some(Token::Value(_)) = self.parser.peek()? {
            loop {
                match self.parser.advance()? {
                    Token::Value(num) => results.push(self.def_value(num)?),
                    _ => return self.parser.err("expected result value"),
                }
                if !self.parser.eat(Token::Comma)? {
                    break;
                }
            }
            self.parser.expect(Token::Equal, "'='")?;
        }

        let opcode = match self.parser.advance()? {
            Token::Identifier(name) => Opcode::from_name(name)
                .ok_or_else(|| format!("line {}: unknown opcode '{}'", self.parser.line, name))?,
            _ => return self.parser.err("expected opcode"),
        };

        let ctrl_ty = if self.parser.eat(Token::Dot)? {
            Some(self.parser.expect_type()?)
        } else {
            None
        };
        let require_ty = |ty: Option<Type>| {
            ty.ok_or_else(|| format!("opcode {} requires a type suffix", opcode))
        };

        let data = match opcode {
            Opcode::Fneg
            | Opcode::Sqrt
            | Opcode::Sin
            | Opcode::Cos
            | Opcode::Exp
            | Opcode::Exp2
            | Opcode::Log
            | Opcode::Log2
            | Opcode::Log10
            | Opcode::Fabs
            | Opcode::Floor
            | Opcode::Ceil
            | Opcode::Ftrunc
            | Opcode::Round
            | Opcode::LifetimeStart
            | Opcode::LifetimeEnd => {
                let arg = self.expect_value_use()?;
                InstructionData::Unary { op: opcode, arg }
            }
            Opcode::Load
            | Opcode::Bitcast
            | Opcode::Fpext
            | Opcode::Fptrunc
            | Opcode::Zext
            | Opcode::Itrunc
            | Opcode::Sitofp
            | Opcode::Fptosi
            | Opcode::Ptrtoint
            | Opcode::Inttoptr
            | Opcode::Splat => {
                let ty = require_ty(ctrl_ty)?;
                let arg = self.expect_value_use()?;
                InstructionData::UnaryTy { op: opcode, arg, ty }
            }
            Opcode::Fadd
            | Opcode::Fsub
            | Opcode::Fmul
            | Opcode::Fdiv
            | Opcode::Pow
            | Opcode::Fmin
            | Opcode::Fmax
            | Opcode::Iadd
            | Opcode::Isub
            | Opcode::Imul
            | Opcode::Ishl
            | Opcode::Lshr
            | Opcode::Band
            | Opcode::Bor
            | Opcode::Bxor
            | Opcode::Ieq
            | Opcode::Ilt
            | Opcode::Feq
            | Opcode::Flt
            | Opcode::Fle
            | Opcode::Store => {
                let lhs = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let rhs = self.expect_value_use()?;
                InstructionData::Binary { op: opcode, args: [lhs, rhs] }
            }
            Opcode::Select | Opcode::Memcpy | Opcode::Memmove | Opcode::Memset => {
                let a = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let b = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let c = self.expect_value_use()?;
                InstructionData::Ternary { op: opcode, args: [a, b, c] }
            }
            Opcode::Gep => {
                let elem_ty = require_ty(ctrl_ty)?;
                let base = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let index = self.expect_value_use()?;
                InstructionData::Gep { args: [base, index], elem_ty }
            }
            Opcode::Extract => {
                let arg = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let lane = self.parse_int()? as u8;
                InstructionData::Extract { arg, lane }
            }
            Opcode::Insert => {
                let agg = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let elem = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let lane = self.parse_int()? as u8;
                InstructionData::Insert { args: [agg, elem], lane }
            }
            Opcode::Shuffle => {
                let lhs = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let rhs = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let mask = self.parse_int()? as u32;
                InstructionData::Shuffle { args: [lhs, rhs], mask }
            }
            Opcode::Fconst => {
                let ty = require_ty(ctrl_ty)?;
                let imm = match self.parser.advance()? {
                    Token::Number(text) => {
                        text.parse::<lir::Ieee64>().map_err(|e| {
                            format!("line {}: {}", self.parser.line, e)
                        })?
                    }
                    _ => return self.parser.err("expected float immediate"),
                };
                InstructionData::UnaryIeee64 { imm, ty }
            }
            Opcode::Iconst => {
                let ty = require_ty(ctrl_ty)?;
                let imm = self.parse_int()?;
                InstructionData::UnaryInt { imm, ty }
            }
            Opcode::Bconst => {
                let imm = match self.parser.advance()? {
                    Token::Identifier("true") => true,
                    Token::Identifier("false") => false,
                    _ => return self.parser.err("expected boolean immediate"),
                };
                InstructionData::UnaryBool { imm }
            }
            Opcode::Nullptr | Opcode::Unreachable => InstructionData::Nullary { op: opcode },
            Opcode::GlobalAddr => match self.parser.advance()? {
                Token::Global(num) => {
                    let globals = self
                        .globals
                        .ok_or_else(|| "global reference outside a module".to_string())?;
                    let global = *globals
                        .get(&num)
                        .ok_or_else(|| format!("undeclared global gv{}", num))?;
                    InstructionData::UnaryGlobal { global }
                }
                _ => return self.parser.err("expected global"),
            },
            Opcode::StackLoad => match self.parser.advance()? {
                Token::StackSlot(num) => {
                    let slot = *self
                        .slots
                        .get(&num)
                        .ok_or_else(|| format!("undeclared stack slot ss{}", num))?;
                    InstructionData::StackLoad { slot }
                }
                _ => return self.parser.err("expected stack slot"),
            },
            Opcode::StackStore => {
                let arg = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                match self.parser.advance()? {
                    Token::StackSlot(num) => {
                        let slot = *self
                            .slots
                            .get(&num)
                            .ok_or_else(|| format!("undeclared stack slot ss{}", num))?;
                        InstructionData::StackStore { slot, arg }
                    }
                    _ => return self.parser.err("expected stack slot"),
                }
            }
            Opcode::Call => {
                let func_ref = match self.parser.advance()? {
                    Token::FuncRef(num) => *self
                        .func_refs
                        .get(&num)
                        .ok_or_else(|| format!("undeclared function reference fn{}", num))?,
                    _ => return self.parser.err("expected function reference"),
                };
                self.parser.expect(Token::LPar, "'('")?;
                let mut args = Vec::new();
                if self.parser.peek()? != Some(Token::RPar) {
                    loop {
                        args.push(self.expect_value_use()?);
                        if !self.parser.eat(Token::Comma)? {
                            break;
                        }
                    }
                }
                self.parser.expect(Token::RPar, "')'")?;
                let mut list = lir::ValueList::new();
                list.extend(args.into_iter(), &mut self.func.dfg.value_lists);
                InstructionData::Call { func_ref, args: list }
            }
            Opcode::Jmp => {
                let destination = self.expect_block_ref()?;
                InstructionData::Jump { destination }
            }
            Opcode::Br => {
                let cond = self.expect_value_use()?;
                self.parser.expect(Token::Comma, "','")?;
                let then_dest = self.expect_block_ref()?;
                self.parser.expect(Token::Comma, "','")?;
                let else_dest = self.expect_block_ref()?;
                InstructionData::Branch { arg: cond, then_dest, else_dest }
            }
            Opcode::Ret => {
                let mut args = Vec::new();
                if let Some(Token::Value(_)) = self.parser.peek()? {
                    loop {
                        args.push(self.expect_value_use()?);
                        if !self.parser.eat(Token::Comma)? {
                            break;
                        }
                    }
                }
                let mut list = lir::ValueList::new();
                list.extend(args.into_iter(), &mut self.func.dfg.value_lists);
                InstructionData::Ret { args: list }
            }
            Opcode::Phi => {
                let ty = self.parser.expect_type()?;
                let mut edges = Vec::new();
                loop {
                    self.parser.expect(Token::LBracket, "'['")?;
                    let val = match self.parser.advance()? {
                        Token::Value(num) => self.use_value(num, true)?,
                        _ => return self.parser.err("expected value"),
                    };
                    self.parser.expect(Token::Comma, "','")?;
                    let pred = self.expect_block_ref()?;
                    self.parser.expect(Token::RBracket, "']'")?;
                    edges.push((pred, val));
                    if !self.parser.eat(Token::Comma)? {
                        break;
                    }
                }
                self.func.dfg.make_phi_data(ty, &edges)
            }
        };

        let inst = self.func.dfg.make_inst(data);
        let num_results =
            self.func.dfg.make_inst_results_reusing(inst, results.iter().map(|v| Some(*v)));
        if num_results != results.len() {
            return self
                .parser
                .err(format!("expected {} results, found {}", num_results, results.len()));
        }
        self.func.layout.append_inst(inst, block);
        Ok(())
    }

    fn parse_int(&mut self) -> ParseResult<i64> {
        match self.parser.advance()? {
            Token::Number(text) => {
                let parsed = if let Some(hex) = text.strip_prefix("0x") {
                    u64::from_str_radix(hex, 16).map(|v| v as i64).ok()
                } else {
                    text.parse::<i64>().ok()
                };
                parsed.ok_or_else(|| format!("line {}: bad integer", self.parser.line))
            }
            _ => self.parser.err("expected integer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let src = "\
function %square(f64) -> f64 {
block0(v0: f64):
    v1 = fmul v0, v0
    ret v1
}
";
        let func = parse_function(src).unwrap();
        assert_eq!(func.to_string(), src);
    }

    #[test]
    fn phis_and_branches() {
        let src = "\
function %loop_sum(ptr, i64) -> f64 {
block0(v0: ptr, v1: i64):
    v2 = iconst.i64 0
    v3 = fconst.f64 0.0
    jmp block1

block1:
    v4 = phi i64 [v2, block0], [v8, block2]
    v5 = phi f64 [v3, block0], [v7, block2]
    v9 = ilt v4, v1
    br v9, block2, block3

block2:
    v10 = gep.f64 v0, v4
    v6 = load.f64 v10
    v7 = fadd v5, v6
    v11 = iconst.i64 1
    v8 = iadd v4, v11
    jmp block1

block3:
    ret v5
}
";
        let func = parse_function(src).unwrap();
        assert_eq!(func.to_string(), src);
    }

    #[test]
    fn preamble_and_calls() {
        let src = "\
function %f(f64) -> f64 {
    fn0 = %malloc(i64) -> ptr
    fn1 = %g(f64) -> f64 readonly
    ss0 = slot f64

block0(v0: f64):
    v1 = call fn1(v0)
    stack_store v1, ss0
    v2 = stack_load ss0
    ret v2
}
";
        let func = parse_function(src).unwrap();
        assert_eq!(func.to_string(), src);
    }

    #[test]
    fn rejects_undefined_values() {
        let src = "\
function %f(f64) -> f64 {
block0(v0: f64):
    v1 = fmul v0, v2
    ret v1
}
";
        assert!(parse_function(src).is_err());
    }
}
