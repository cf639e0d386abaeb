//! Compilation des commandes : descente récursive sur le DSL, émission du
//! bytecode page par page.
//!
//! La compilation se fait en deux passes. La passe de préparation parcourt
//! toutes les pages pour enregistrer symboles, constantes et fonctions (ce
//! qui autorise les références avant déclaration) ; son émission part dans
//! un buffer jetable. La passe d'émission produit les octets définitifs et
//! résout les labels par chaînes de trous ; les adresses de fonctions
//! inter-pages sont patchées une fois toutes les pages émises.

use std::collections::HashMap;

use nact_core::{cali, text, OutBuf, SysVer};

use crate::config::Config;
use crate::debuginfo::DebugInfo;
use crate::lexer::Lexer;
use crate::{sco, CompileError, Result};

/* ─────────────────────────── Symboles ─────────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Symbol {
    Variable(u16),
    Const(u16),
}

#[derive(Debug, Default)]
struct Label {
    addr: u32,      // 0 = non résolu
    hole: u32,      // tête de la chaîne de trous, 0 = aucune
    source_loc: usize,
}

#[derive(Debug, Default)]
pub(crate) struct Function {
    params: Vec<u16>,
    page: Option<u16>,
    addr: Option<u32>,
    // Slots dword à patcher une fois l'adresse connue : (page, offset).
    holes: Vec<(usize, u32)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Prepare,
    Emit,
}

/// Une page compilée.
#[derive(Debug)]
pub struct PageSco {
    /// Bytecode complet (en-tête compris).
    pub data: Vec<u8>,
    /// Volumes d'archive où ranger la page.
    pub volume_bits: u32,
}

/* ─────────────────────────── Compilateur ─────────────────────────── */

/// État partagé d'une unité de compilation (toutes les pages).
pub struct Compiler {
    pub(crate) config: Config,
    src_names: Vec<String>,
    /// Table globale des variables, dans l'ordre des indices.
    pub variables: Vec<String>,
    symbols: HashMap<String, Symbol>,
    verbs: HashMap<String, u8>,
    objects: HashMap<String, u8>,
    functions: HashMap<String, Function>,
    /// Carte de debug alimentée pendant l'émission (option `debug`).
    pub dbg: Option<DebugInfo>,
}

impl Compiler {
    /// Prépare une unité de compilation. `src_names` sont les noms de base
    /// des pages ; `variables` la liste pré-déclarée (option `-V`).
    pub fn new(
        config: Config,
        src_names: Vec<String>,
        variables: Vec<String>,
        verbs: &[String],
        objects: &[String],
    ) -> Result<Self> {
        let mut symbols = HashMap::new();
        for (i, name) in variables.iter().enumerate() {
            if !name.is_empty() {
                symbols.insert(name.clone(), Symbol::Variable(i as u16));
            }
        }
        let index_map = |names: &[String]| -> Result<HashMap<String, u8>> {
            if names.len() > 256 {
                return Err(CompileError::Msg("too many verb/object names".into()));
            }
            Ok(names.iter().enumerate().map(|(i, n)| (n.clone(), i as u8)).collect())
        };
        Ok(Self {
            config,
            src_names,
            variables,
            symbols,
            verbs: index_map(verbs)?,
            objects: index_map(objects)?,
            functions: HashMap::new(),
            dbg: None,
        })
    }

    /// Passe de préparation d'une page.
    pub fn preprocess(&mut self, source: &str, page: usize) -> Result<()> {
        self.run_page(source, page, Pass::Prepare).map(|_| ())
    }

    /// Passe d'émission d'une page.
    pub fn compile(&mut self, source: &str, page: usize) -> Result<PageSco> {
        self.run_page(source, page, Pass::Emit)
    }

    /// Patch final des appels de fonctions inter-pages.
    pub fn finalize(&mut self, pages: &mut [PageSco]) -> Result<()> {
        for (name, func) in &self.functions {
            let Some(addr) = func.addr else {
                if func.holes.is_empty() {
                    continue;
                }
                return Err(CompileError::Msg(format!("undefined function '{name}'")));
            };
            for &(page, offset) in &func.holes {
                let i = offset as usize;
                pages[page].data[i..i + 4].copy_from_slice(&addr.to_le_bytes());
            }
        }
        Ok(())
    }

    fn run_page(&mut self, source: &str, page: usize, pass: Pass) -> Result<PageSco> {
        let src_name = self.src_names[page].clone();
        let mut out = OutBuf::new();
        let hdr_size = sco::init(&mut out, &self.config, &src_name, page)?;
        if let (Pass::Emit, Some(dbg)) = (pass, self.dbg.as_mut()) {
            dbg.init_page(page);
        }
        let mut cx = PageCx {
            comp: self,
            lex: Lexer::new(source, &src_name, page),
            out,
            pass,
            labels: HashMap::new(),
            page,
            volume_bits: 1 << 1,
            default_addr: None,
            menu_item_start: None,
            hdr_size,
        };
        cx.toplevel()?;

        if let Some(top) = cx.menu_item_start {
            return Err(cx.lex.diag_at(top, "unfinished menu item").into());
        }
        if pass == Pass::Emit {
            cx.check_undefined_labels()?;
        }
        let volume_bits = cx.volume_bits;
        let default_addr = cx.resolved_default_addr();
        let mut out = cx.out;
        sco::finalize(&mut out, &self.config, hdr_size, default_addr)?;
        if pass == Pass::Emit {
            if let Some(limit) = self.config.sys_ver.page_size_limit() {
                if out.addr() as usize > limit {
                    return Err(CompileError::Msg(format!(
                        "{src_name}: page size exceeds {limit} bytes"
                    )));
                }
            }
            if let Some(dbg) = self.dbg.as_mut() {
                dbg.finish_page();
            }
        }
        Ok(PageSco { data: out.into_vec(), volume_bits })
    }

    fn lookup_var(&mut self, name: &str, create: bool) -> Result<Option<u16>> {
        match self.symbols.get(name) {
            Some(Symbol::Variable(ix)) => return Ok(Some(*ix)),
            Some(Symbol::Const(_)) => {
                if create {
                    return Err(CompileError::Msg(format!(
                        "'{name}' is already defined as a constant"
                    )));
                }
                return Ok(None);
            }
            None => {}
        }
        if !create {
            return Ok(None);
        }
        let ix = self.variables.len();
        if ix > 0x3fff {
            return Err(CompileError::Msg("too many variables".into()));
        }
        self.variables.push(name.to_owned());
        self.symbols.insert(name.to_owned(), Symbol::Variable(ix as u16));
        Ok(Some(ix as u16))
    }
}

/* ─────────────────────────── Compilation d'une page ─────────────────────────── */

struct PageCx<'c, 's> {
    comp: &'c mut Compiler,
    lex: Lexer<'s>,
    out: OutBuf,
    pass: Pass,
    labels: HashMap<String, Label>,
    page: usize,
    volume_bits: u32,
    default_addr: Option<u16>,
    menu_item_start: Option<usize>,
    hdr_size: u32,
}

enum Cmd {
    Eof,
    Byte(u8),
    If,
    Const,
    Pragma,
}

impl PageCx<'_, '_> {
    fn emitting(&self) -> bool {
        self.pass == Pass::Emit
    }

    fn sys_ver(&self) -> SysVer {
        self.comp.config.sys_ver
    }

    fn legacy(&self) -> bool {
        self.sys_ver().is_legacy()
    }

    fn err_at(&self, pos: usize, msg: impl Into<String>) -> CompileError {
        self.lex.diag_at(pos, msg).into()
    }

    fn err(&self, msg: impl Into<String>) -> CompileError {
        self.lex.diag(msg).into()
    }

    /* ── Expressions ── */

    fn number(&mut self) -> Result<()> {
        let n = self.lex.get_number()?;
        self.emit_number(n);
        Ok(())
    }

    fn emit_number(&mut self, n: u32) {
        let ceiling = self.sys_ver().cali_ceiling(self.comp.config.sys0dc_offby1_error);
        cali::encode_number(&mut self.out, n, ceiling);
    }

    fn variable(&mut self, create: bool) -> Result<u16> {
        let top = self.lex.pos();
        let id = self.lex.get_identifier()?.to_owned();
        self.variable_named(&id, create, top)
    }

    fn variable_named(&mut self, id: &str, create: bool, top: usize) -> Result<u16> {
        match self.comp.lookup_var(id, create) {
            Ok(Some(ix)) => {
                cali::encode_var(&mut self.out, u32::from(ix))
                    .map_err(|e| self.err_at(top, e.to_string()))?;
                Ok(ix)
            }
            Ok(None) => {
                if self.emitting() {
                    Err(self.err_at(top, format!("Undefined variable '{id}'")))
                } else {
                    // Passe de préparation : le buffer est jetable.
                    self.out.emit(0x80);
                    Ok(0)
                }
            }
            Err(CompileError::Msg(msg)) => Err(self.err_at(top, msg)),
            Err(e) => Err(e),
        }
    }

    // Référence var[expr] (leaf du décodeur, dialectes 3.5+).
    fn array_ref(&mut self, var: u16) -> Result<()> {
        self.out.emit(cali::OP_C0);
        self.out.emit(cali::OP_C0_INDEX);
        self.out.emit_word_be(var);
        self.expr_equal()?;
        self.out.emit(cali::OP_END);
        self.lex.expect(b']')?;
        Ok(())
    }

    // Réécrit la dernière référence de variable en référence de tableau.
    // La variable vient d'être émise ; on la retire pour la préfixer.
    fn rewrite_var_as_aref(&mut self, var_begin: u32, var: u16) -> Result<()> {
        self.out.seek(var_begin);
        self.array_ref(var)
    }

    // prim ::= '(' equal ')' | number | '#' filename | const | var
    fn expr_prim(&mut self) -> Result<()> {
        if self.lex.consume(b'(')? {
            self.expr_equal()?;
            self.lex.expect(b')')?;
        } else if self.lex.next_char()?.is_ascii_digit() {
            self.number()?;
        } else if self.lex.consume(b'#')? {
            let top = self.lex.pos();
            let fname = self.lex.get_filename()?.to_owned();
            let page = self
                .comp
                .src_names
                .iter()
                .position(|n| n.eq_ignore_ascii_case(&fname))
                .ok_or_else(|| {
                    self.err_at(top, format!("reference to unknown source file: '{fname}'"))
                })?;
            self.emit_number(page as u32);
        } else {
            let top = self.lex.pos();
            let id = self.lex.get_identifier()?.to_owned();
            if id == "__LINE__" {
                let line = self.lex.line();
                self.emit_number(line);
            } else if let Some(Symbol::Const(v)) = self.comp.symbols.get(&id) {
                let v = *v;
                self.emit_number(u32::from(v));
            } else {
                let var_begin = self.out.addr();
                let var = self.variable_named(&id, false, top)?;
                if self.sys_ver().has_extended_ops() && self.lex.consume(b'[')? {
                    self.rewrite_var_as_aref(var_begin, var)?;
                }
            }
        }
        Ok(())
    }

    // mul ::= prim ('*' prim | '/' prim | '%' prim)*
    fn expr_mul(&mut self) -> Result<()> {
        self.expr_prim()?;
        loop {
            if self.lex.consume(b'*')? {
                self.expr_prim()?;
                // System 1 : '*' est la division entière.
                self.out.emit(if self.sys_ver() == SysVer::System1 {
                    cali::OP_DIV
                } else {
                    cali::OP_MUL
                });
            } else if self.lex.next_char()? == b'/' {
                if self.sys_ver() == SysVer::System1 {
                    return Err(self.err("division is written '*' in System 1"));
                }
                self.lex.consume(b'/')?;
                self.expr_prim()?;
                self.out.emit(cali::OP_DIV);
            } else if self.sys_ver().has_extended_ops() && self.lex.consume(b'%')? {
                self.expr_prim()?;
                self.out.emit(cali::OP_C0);
                self.out.emit(cali::OP_C0_MOD);
            } else {
                return Ok(());
            }
        }
    }

    // add ::= mul ('+' mul | '-' mul)*
    fn expr_add(&mut self) -> Result<()> {
        self.expr_mul()?;
        loop {
            if self.lex.consume(b'+')? {
                self.expr_mul()?;
                self.out.emit(cali::OP_ADD);
            } else if self.lex.consume(b'-')? {
                self.expr_mul()?;
                self.out.emit(cali::OP_SUB);
            } else {
                return Ok(());
            }
        }
    }

    // bits ::= add ('&' add | '|' add | '^' add)*   (3.5+)
    fn expr_bits(&mut self) -> Result<()> {
        self.expr_add()?;
        if !self.sys_ver().has_extended_ops() {
            return Ok(());
        }
        loop {
            let op = match self.lex.next_char()? {
                b'&' => cali::OP_AND,
                b'|' => cali::OP_OR,
                b'^' => cali::OP_XOR,
                _ => return Ok(()),
            };
            self.lex.bump();
            self.expr_add()?;
            self.out.emit(op);
        }
    }

    // compare ::= bits ('<' bits | '>' bits | '<=' bits | '>=' bits)*
    fn expr_compare(&mut self) -> Result<()> {
        self.expr_bits()?;
        loop {
            let (plain, escaped) = match self.lex.next_char()? {
                b'<' => (cali::OP_LT, cali::OP_C0_LE),
                b'>' => (cali::OP_GT, cali::OP_C0_GE),
                _ => return Ok(()),
            };
            self.lex.bump();
            let wide = self.sys_ver().has_extended_ops() && self.lex.peek() == b'=';
            if wide {
                self.lex.bump();
            }
            self.expr_bits()?;
            if wide {
                self.out.emit(cali::OP_C0);
                self.out.emit(escaped);
            } else {
                self.out.emit(plain);
            }
        }
    }

    // equal ::= compare ('=' compare | '\' compare | '$' compare)*
    fn expr_equal(&mut self) -> Result<()> {
        self.expr_compare()?;
        loop {
            if self.lex.consume(b'=')? {
                self.expr_compare()?;
                self.out.emit(cali::OP_EQ);
            } else if self.lex.consume(b'\\')? {
                self.expr_compare()?;
                self.out.emit(cali::OP_NE);
            } else if self.lex.consume(b'$')? {
                // Séparateur hérité : l'opérande de droite est gardé tel quel.
                self.expr_compare()?;
            } else {
                return Ok(());
            }
        }
    }

    fn expr(&mut self) -> Result<()> {
        self.expr_equal()?;
        self.out.emit(cali::OP_END);
        Ok(())
    }

    /* ── Chaînes ── */

    fn echo(&mut self) -> u8 {
        let c = self.lex.bump();
        self.out.emit(c);
        c
    }

    fn echo_char(&mut self) {
        self.echo();
        while text::is_utf8_trail(self.lex.peek()) {
            self.echo();
        }
    }

    fn compile_sjis_codepoint(&mut self) -> Result<()> {
        let top = self.lex.pos();
        self.lex.expect(b'<')?;
        let code = self.lex.get_number()?;
        let (c1, c2) = ((code >> 8) as u8, code as u8);
        if self.comp.config.unicode {
            if !text::is_valid_sjis(c1, c2) {
                return Err(self.err_at(top, format!("Invalid SJIS code {code:#x}")));
            }
            let utf8 = text::to_utf8(&[c1, c2]).map_err(|e| self.err_at(top, e.to_string()))?;
            self.out.emit_string(&utf8);
        } else {
            self.out.emit_word_be(code as u16);
        }
        Ok(self.lex.expect(b'>')?)
    }

    // Une suite de caractères non ASCII : transcodage (et compaction).
    fn compile_multibyte(&mut self, compact: bool) -> Result<()> {
        if self.comp.config.unicode {
            while !self.lex.peek().is_ascii() {
                self.echo_char();
            }
            return Ok(());
        }
        let top = self.lex.pos();
        while !self.lex.peek().is_ascii() {
            self.lex.bump_char();
        }
        let span = std::str::from_utf8(&self.lex_src()[top..self.lex.pos()])
            .map_err(|_| self.err_at(top, "invalid UTF-8 sequence"))?
            .to_owned();
        let sjis = text::to_cp932(&span).map_err(|e| self.err_at(top, e.to_string()))?;
        if !compact {
            self.out.emit_bytes(&sjis);
            return Ok(());
        }
        let mut it = sjis.iter().copied().peekable();
        while let Some(c1) = it.next() {
            if !text::is_sjis_byte1(c1) {
                self.out.emit(c1);
                continue;
            }
            let c2 = it.next().unwrap_or(0);
            match text::compact_sjis(c1, c2) {
                Some(hk) => self.out.emit(hk),
                None => {
                    self.out.emit(c1);
                    self.out.emit(c2);
                }
            }
        }
        Ok(())
    }

    fn lex_src(&self) -> &[u8] {
        // Le lexer expose la source pour les coupes multi-octets.
        self.lex.src()
    }

    fn compile_string(&mut self, terminator: u8, compact: bool, forbid_ascii: bool) -> Result<()> {
        let top = self.lex.pos();
        loop {
            let b = self.lex.peek();
            if b == terminator {
                break;
            }
            if b == b'<' {
                self.compile_sjis_codepoint()?;
                continue;
            }
            let b = if b == b'\\' {
                self.lex.bump();
                self.lex.peek()
            } else {
                b
            };
            if b == 0 {
                return Err(self.err_at(top, "unfinished string"));
            }
            if !b.is_ascii() {
                self.compile_multibyte(compact)?;
            } else if forbid_ascii {
                return Err(self.err("ASCII characters cannot be used here"));
            } else {
                if self.pass == Pass::Prepare && b < b' ' {
                    tracing::warn!("{}", self.lex.diag("Control character in string."));
                }
                self.echo();
            }
        }
        Ok(self.lex.expect(terminator)?)
    }

    fn compile_bare_string(&mut self) -> Result<()> {
        let top = self.lex.pos();
        loop {
            match self.lex.peek() {
                b',' | b':' => return Ok(()),
                0 => return Err(self.err_at(top, "unfinished string argument")),
                b if b.is_ascii() => {
                    self.echo();
                }
                _ => self.compile_multibyte(false)?,
            }
        }
    }

    /* ── Labels ── */

    fn addr_width(&self) -> u32 {
        if self.legacy() { 2 } else { 4 }
    }

    fn add_label(&mut self) -> Result<()> {
        let top = self.lex.pos();
        let id = self.lex.get_label()?.to_owned();
        if !self.emitting() {
            return Ok(());
        }
        let here = self.out.addr();
        let label = self.labels.entry(id.clone()).or_insert_with(|| Label {
            source_loc: top,
            ..Label::default()
        });
        if label.addr != 0 {
            return Err(self.err_at(top, format!("label '{id}' redefined")));
        }
        label.addr = here;
        let (mut hole, addr) = (label.hole, label.addr);
        label.hole = 0;
        while hole != 0 {
            hole = if self.legacy() {
                u32::from(self.out.swap_word(hole, addr as u16))
            } else {
                self.out.swap_dword(hole, addr)
            };
        }
        Ok(())
    }

    fn label_ref(&mut self) -> Result<()> {
        let top = self.lex.pos();
        let id = self.lex.get_label()?.to_owned();
        if !self.emitting() {
            return Ok(());
        }
        let width = self.addr_width();
        let label = self.labels.entry(id).or_insert_with(|| Label {
            source_loc: top,
            ..Label::default()
        });
        if label.addr == 0 {
            // Chaîne de trous : le slot reçoit l'offset du trou précédent.
            let prev = label.hole;
            if width == 2 {
                self.out.emit_word(prev as u16);
            } else {
                self.out.emit_dword(prev);
            }
            label.hole = self.out.addr() - width;
        } else if width == 2 {
            self.out.emit_word(label.addr as u16);
        } else {
            self.out.emit_dword(label.addr);
        }
        Ok(())
    }

    fn check_undefined_labels(&self) -> Result<()> {
        for (name, label) in &self.labels {
            if label.hole != 0 {
                return Err(self.err_at(label.source_loc, format!("undefined label '{name}'")));
            }
        }
        Ok(())
    }

    fn resolved_default_addr(&self) -> Option<u16> {
        self.default_addr
            .or_else(|| self.labels.get("default").map(|l| l.addr as u16).filter(|&a| a != 0))
    }

    /* ── Commandes ── */

    fn get_command(&mut self) -> Result<Cmd> {
        self.lex.skip_whitespaces()?;
        let top = self.lex.pos();
        let b = self.lex.peek();
        match b {
            0 | b'}' | b'>' => Ok(if b == 0 { Cmd::Eof } else { Cmd::Byte(b) }),
            b'A' | b'R' => {
                self.echo();
                Ok(Cmd::Byte(b))
            }
            _ if b.is_ascii_uppercase() => {
                self.lex.bump();
                if self.lex.peek().is_ascii_uppercase() {
                    let two = format!("{}{}", b as char, self.lex.peek() as char);
                    return Err(self.err_at(top, format!("Unknown command {two}")));
                }
                self.out.emit(b);
                Ok(Cmd::Byte(b))
            }
            _ if b.is_ascii_lowercase() => {
                while self.lex.peek().is_ascii_alphanumeric() {
                    self.lex.bump();
                }
                let kw = std::str::from_utf8(&self.lex_src()[top..self.lex.pos()]).unwrap();
                match kw {
                    "if" => Ok(Cmd::If),
                    "const" => Ok(Cmd::Const),
                    "pragma" => Ok(Cmd::Pragma),
                    _ => Err(self.err_at(top, format!("Unknown command {kw}"))),
                }
            }
            _ => {
                self.lex.bump();
                Ok(Cmd::Byte(b))
            }
        }
    }

    // assign ::= '!' var '['? … ']'? [+-*/%&|^]? ':' expr '!'
    fn assign(&mut self) -> Result<()> {
        let op_pos = self.out.addr();
        self.out.emit(b'!');
        let top = self.lex.pos();
        let var_begin = self.out.addr();
        let var = self.variable(true)?;
        if self.sys_ver().has_extended_ops() && self.lex.consume(b'[')? {
            self.rewrite_var_as_aref(var_begin, var)?;
        }
        for (i, &c) in [b'+', b'-', b'*', b'/', b'%', b'&', b'|', b'^'].iter().enumerate() {
            if self.lex.consume(c)? {
                if !self.sys_ver().has_compound_assign() {
                    return Err(self.err_at(top, "compound assignment requires System 3.9"));
                }
                self.out.set(op_pos, 0x10 + i as u8);
                break;
            }
        }
        self.lex.expect(b':')?;
        self.expr()?;
        self.lex.expect(b'!')?;
        if self.legacy() {
            self.out.emit(b'!');
        }
        Ok(())
    }

    // conditional ::= '{' expr ':' commands '}' ['else' ['if' …] …]
    fn conditional(&mut self) -> Result<()> {
        self.out.emit(b'{');
        self.expr()?;
        self.lex.expect(b':')?;
        let hole = self.out.addr();
        self.out.emit_word(0);
        self.commands()?;
        self.lex.expect(b'}')?;
        if matches!(self.sys_ver(), SysVer::System1 | SysVer::System2) {
            self.out.emit(b'}');
            self.out.swap_word(hole, self.out.addr() as u16);
            return Ok(());
        }
        if self.legacy() {
            self.out.swap_word(hole, self.out.addr() as u16);
            return Ok(());
        }
        // Dialectes 3.5+ : chaque branche se termine par un saut, même sans
        // else (il atterrit alors sur l'instruction suivante).
        self.out.emit(b'@');
        let jump_hole = self.out.addr();
        self.out.emit_dword(0);
        self.out.swap_word(hole, self.out.addr() as u16);
        if self.lex.consume_keyword("else")? {
            if self.lex.consume_keyword("if")? {
                self.lex.expect(b'{')?;
                self.conditional()?;
            } else {
                self.lex.expect(b'{')?;
                self.commands()?;
                self.lex.expect(b'}')?;
            }
        }
        self.out.swap_dword(jump_hole, self.out.addr());
        Ok(())
    }

    // while-loop ::= '<@' expr ':' commands '>'
    fn while_loop(&mut self) -> Result<()> {
        let loop_addr = self.out.addr();
        self.out.emit(b'{');
        self.expr()?;
        self.lex.expect(b':')?;
        let end_hole = self.out.addr();
        self.out.emit_word(0);

        self.commands()?;

        self.lex.expect(b'>')?;
        self.out.emit(b'>');
        self.out.emit_word(loop_addr as u16);

        self.out.swap_word(end_hole, self.out.addr() as u16);
        Ok(())
    }

    // for-loop ::= '<' var ',' expr ',' expr ',' expr ',' expr ':' commands '>'
    fn for_loop(&mut self) -> Result<()> {
        self.out.emit(b'!');
        let var_begin = self.out.addr();
        // La boucle peut définir sa variable de compteur.
        self.variable(true)?;
        let var_end = self.out.addr();
        self.lex.expect(b',')?;

        self.expr()?; // départ
        self.lex.expect(b',')?;
        if self.legacy() {
            self.out.emit(b'!');
        }

        self.out.emit(b'<');
        self.out.emit(0x00);
        let loop_addr = self.out.addr();
        self.out.emit(b'<');
        self.out.emit(0x01);

        let end_hole = self.out.addr();
        self.out.emit_word(0);

        // Copie des octets de la variable de boucle.
        for i in var_begin..var_end {
            let b = self.out.get(i);
            self.out.emit(b);
        }
        self.out.emit(cali::OP_END);

        self.expr()?; // fin
        self.lex.expect(b',')?;
        self.expr()?; // sens
        self.lex.expect(b',')?;
        self.expr()?; // pas
        self.lex.expect(b':')?;

        self.commands()?;

        self.lex.expect(b'>')?;
        self.out.emit(b'>');
        self.out.emit_word(loop_addr as u16);

        self.out.swap_word(end_hole, self.out.addr() as u16);
        Ok(())
    }

    fn verb_value(&mut self, table: &'static str) -> Result<u8> {
        let top = self.lex.pos();
        if self.lex.next_char()?.is_ascii_digit() {
            let n = self.lex.get_number()?;
            return u8::try_from(n).map_err(|_| self.err_at(top, format!("{table} out of range")));
        }
        let id = self.lex.get_identifier()?.to_owned();
        let map = if table == "verb" { &self.comp.verbs } else { &self.comp.objects };
        map.get(&id)
            .copied()
            .ok_or_else(|| self.err_at(top, format!("unknown {table} '{id}'")))
    }

    // verb-obj ::= placeholder label ',' verb ',' obj ':'
    fn verb_obj(&mut self) -> Result<()> {
        let loc = self.out.addr();
        self.out.emit_word(0);
        self.label_ref()?;
        self.lex.expect(b',')?;
        let verb = self.verb_value("verb")?;
        self.lex.expect(b',')?;
        let obj = self.verb_value("object")?;
        self.lex.expect(b':')?;
        if self.emitting() {
            self.out.set(loc, verb);
            self.out.set(loc + 1, obj);
        }
        Ok(())
    }

    // '**name' param (',' param)* ':'
    fn function_def(&mut self) -> Result<()> {
        let top = self.lex.pos();
        let name = self.lex.get_label()?.to_owned();
        let mut params = Vec::new();
        if self.lex.next_char()? != b':' {
            loop {
                let ptop = self.lex.pos();
                let id = self.lex.get_identifier()?.to_owned();
                let var = match self.comp.lookup_var(&id, true) {
                    Ok(Some(ix)) => ix,
                    Ok(None) => unreachable!("create inserts"),
                    Err(CompileError::Msg(msg)) => return Err(self.err_at(ptop, msg)),
                    Err(e) => return Err(e),
                };
                params.push(var);
                if !self.lex.consume(b',')? {
                    break;
                }
            }
        }
        self.lex.expect(b':')?;

        let page = self.page as u16;
        let here = self.out.addr();
        let func = self.comp.functions.entry(name.clone()).or_default();
        match self.pass {
            Pass::Prepare => {
                if func.page.is_some() {
                    return Err(self.err_at(top, format!("function '{name}' redefined")));
                }
                func.page = Some(page);
                func.params = params;
            }
            Pass::Emit => {
                func.addr = Some(here);
            }
        }
        Ok(())
    }

    // '~0,' expr ':' | '~~expr' ':' | '~name' [args] ':'
    fn funcall(&mut self) -> Result<()> {
        match self.lex.next_char()? {
            b'0' => {
                self.lex.bump();
                self.lex.expect(b',')?;
                self.out.emit(b'~');
                self.out.emit_word(0);
                self.expr()?;
            }
            b'~' => {
                // '~~expr:' : cible calculée.
                self.lex.bump();
                self.out.emit(b'~');
                self.out.emit_word(0xffff);
                self.expr()?;
            }
            _ => {
                let top = self.lex.pos();
                let name = self.lex.get_label()?.to_owned();
                self.funcall_named(&name, top)?;
            }
        }
        Ok(self.lex.expect(b':')?)
    }

    fn funcall_named(&mut self, name: &str, top: usize) -> Result<()> {
        let (page, addr, params) = match self.comp.functions.get(name) {
            Some(f) if f.page.is_some() => (f.page.unwrap(), f.addr, f.params.clone()),
            _ if self.pass == Pass::Prepare => {
                // Les pages suivantes ne sont pas encore préparées : on se
                // contente de consommer les arguments.
                while self.lex.next_char()? != b':' {
                    self.expr_equal()?;
                    if !self.lex.consume(b',')? {
                        break;
                    }
                }
                return Ok(());
            }
            _ => return Err(self.err_at(top, format!("undefined function '{name}'"))),
        };

        let mut argc = 0;
        while self.lex.next_char()? != b':' {
            let arg_top = self.lex.pos();
            if argc == params.len() {
                return Err(self.err_at(arg_top, format!("too many arguments to '{name}'")));
            }
            self.out.emit(b'!');
            cali::encode_var(&mut self.out, u32::from(params[argc]))
                .map_err(|e| self.err_at(arg_top, e.to_string()))?;
            self.expr()?;
            argc += 1;
            if !self.lex.consume(b',')? {
                break;
            }
        }
        if argc != params.len() {
            return Err(self.err_at(top, format!("too few arguments to '{name}'")));
        }

        self.out.emit(b'~');
        self.out.emit_word(page + 1);
        match addr {
            Some(addr) => self.out.emit_dword(addr),
            None => {
                let hole = self.out.addr();
                self.out.emit_dword(0);
                if self.emitting() {
                    if let Some(f) = self.comp.functions.get_mut(name) {
                        f.holes.push((self.page, hole));
                    }
                }
            }
        }
        Ok(())
    }

    // '#label,' expr ':' — référence de table de données (3.5+).
    fn data_table_ref(&mut self) -> Result<()> {
        self.out.emit(b'#');
        self.label_ref()?;
        self.lex.expect(b',')?;
        self.expr()?;
        Ok(self.lex.expect(b':')?)
    }

    // '[' ouvre soit un verbe-objet (System 1/2/3) soit un bloc de données
    // '[n, n, …]'. Le premier séparateur rencontré tranche.
    fn bracket_is_data(&self) -> Result<bool> {
        for &b in &self.lex.src()[self.lex.pos()..] {
            match b {
                b']' => return Ok(true),
                b':' => return Ok(false),
                _ => {}
            }
        }
        Err(self.err("unterminated '['"))
    }

    // data-array ::= '[' [n['b'] (',' n['b'])*] ']'
    fn data_array(&mut self) -> Result<()> {
        if self.lex.consume(b']')? {
            return Ok(());
        }
        loop {
            let top = self.lex.pos();
            let n = self.lex.get_number()?;
            if self.lex.consume(b'b')? {
                let b = u8::try_from(n).map_err(|_| self.err_at(top, "byte value out of range"))?;
                self.out.emit(b);
            } else {
                let w =
                    u16::try_from(n).map_err(|_| self.err_at(top, "word value out of range"))?;
                self.out.emit_word(w);
            }
            if !self.lex.consume(b',')? {
                break;
            }
        }
        Ok(self.lex.expect(b']')?)
    }

    /* ── Arguments des commandes lettres ── */

    fn signature(&self, cmd: u8) -> Option<&'static str> {
        // Table System 1/2/3 ; les identités de jeux pourront la raffiner.
        Some(match cmd {
            b'A' | b'F' | b'R' => "",
            b'B' => "neeeeee",
            b'E' | b'I' => "eeeeee",
            b'G' | b'L' | b'Q' => "e",
            b'H' => "ne",
            b'J' | b'O' | b'T' | b'U' | b'V' | b'Y' | b'Z' => "ee",
            b'K' | b'S' | b'X' => "n",
            b'M' => "s",
            b'N' => "nee",
            b'P' => "eeee",
            b'W' => "eee",
            _ => return None,
        })
    }

    fn string_argument(&mut self, nul_terminated: bool) -> Result<()> {
        // Ne saute que les blancs ASCII : l'espace pleine chasse fait
        // partie de l'argument.
        while self.lex.peek().is_ascii_whitespace() {
            self.lex.bump();
        }
        if self.lex.peek() == b'"' {
            self.lex.expect(b'"')?;
            self.compile_string(b'"', false, false)?;
        } else {
            self.compile_bare_string()?;
        }
        self.out.emit(if nul_terminated { 0 } else { b':' });
        Ok(())
    }

    fn arguments(&mut self, sig: &str) -> Result<()> {
        let mut sig = sig.as_bytes();
        if sig.first() == Some(&b'n') {
            let top = self.lex.pos();
            let n = self.lex.get_number()?;
            let n = u8::try_from(n).map_err(|_| self.err_at(top, "argument out of range"))?;
            self.out.emit(n);
            sig = &sig[1..];
            if !sig.is_empty() {
                // Virgule optionnelle après le numéro de sous-commande.
                self.lex.consume(b',')?;
            }
        }

        let mut rest = sig.iter().copied().peekable();
        while let Some(kind) = rest.next() {
            match kind {
                b'e' => self.expr()?,
                b'n' => {
                    let top = self.lex.pos();
                    let n = self.lex.get_number()?;
                    let n =
                        u8::try_from(n).map_err(|_| self.err_at(top, "argument out of range"))?;
                    self.out.emit(n);
                }
                b's' => self.string_argument(false)?,
                b'z' => self.string_argument(true)?,
                b'o' => {
                    // Chaîne brouillée : échange de quartets sur place.
                    self.out.emit(0);
                    self.lex.expect(b'"')?;
                    let start = self.out.addr();
                    self.compile_string(b'"', false, false)?;
                    for i in start..self.out.addr() {
                        let b = self.out.get(i);
                        self.out.set(i, b >> 4 | b << 4);
                    }
                    self.out.emit(0);
                }
                b'v' => {
                    self.variable(false)?;
                    self.out.emit(cali::OP_END);
                }
                other => {
                    return Err(CompileError::Msg(format!(
                        "BUG: invalid arguments() template: {}",
                        other as char
                    )))
                }
            }
            if rest.peek().is_some() {
                if self.lex.consume(b':')? {
                    return Err(self.err_at(self.lex.pos() - 1, "too few arguments"));
                }
                self.lex.expect(b',')?;
            }
        }
        if self.lex.consume(b',')? {
            return Err(self.err_at(self.lex.pos() - 1, "too many arguments"));
        }
        Ok(self.lex.expect(b':')?)
    }

    /* ── Pragmas ── */

    fn pragma(&mut self) -> Result<()> {
        if self.lex.consume_keyword("ald_volume")? {
            let top = self.lex.pos();
            let n = self.lex.get_number()?;
            if n > nact_archive::volume::MAX_VOLUME {
                return Err(self.err_at(top, format!("volume letter {n} out of range")));
            }
            self.volume_bits = if n == 0 { 0 } else { 1 << n };
            Ok(self.lex.expect(b':')?)
        } else if self.lex.consume_keyword("dri_volume")? {
            let top = self.lex.pos();
            let letters = self.lex.get_identifier()?.to_owned();
            let mut bits = 0u32;
            for c in letters.chars() {
                if !c.is_ascii_alphabetic() {
                    return Err(self.err_at(top, format!("invalid volume letter '{c}'")));
                }
                bits |= 1 << (c.to_ascii_uppercase() as u32 - 'A' as u32 + 1);
            }
            self.volume_bits = bits;
            Ok(self.lex.expect(b':')?)
        } else if self.lex.consume_keyword("address")? {
            let address = self.lex.get_number()?;
            // Revenir sous des labels déjà émis est accepté : les
            // références suivantes seront patchées là où elles tombent.
            self.out.seek(self.hdr_size.max(address));
            if self.emitting() {
                if let Some(dbg) = self.comp.dbg.as_mut() {
                    // Les adresses de la table LINE doivent rester croissantes.
                    dbg.line_reset();
                }
            }
            Ok(self.lex.expect(b':')?)
        } else if self.lex.consume_keyword("default_address")? {
            let n = self.lex.get_number()?;
            self.default_addr = Some(n as u16);
            Ok(self.lex.expect(b':')?)
        } else {
            Err(self.err("unknown pragma"))
        }
    }

    /* ── Boucle principale ── */

    fn command(&mut self) -> Result<bool> {
        self.lex.skip_whitespaces()?;
        if self.emitting() {
            let (line, addr) = (self.lex.line(), self.out.addr());
            if let Some(dbg) = self.comp.dbg.as_mut() {
                dbg.line_add(line, addr);
            }
        }

        let command_top = self.lex.pos();
        let cmd = self.get_command()?;
        let b = match cmd {
            Cmd::Eof => return Ok(false),
            Cmd::If => {
                self.lex.expect(b'{')?;
                self.conditional()?;
                return Ok(true);
            }
            Cmd::Const => {
                self.define_const()?;
                return Ok(true);
            }
            Cmd::Pragma => {
                self.pragma()?;
                return Ok(true);
            }
            Cmd::Byte(b) => b,
        };

        match b {
            0x1a => {} // DOS EOF

            b'\'' => {
                let forbid_ascii = !self.comp.config.ascii_messages;
                if self.comp.config.quoted_strings {
                    self.out.emit(b'\'');
                    self.compile_string(b'\'', false, forbid_ascii)?;
                    self.out.emit(b'\'');
                } else {
                    self.compile_string(b'\'', true, forbid_ascii)?;
                }
            }

            b'!' => self.assign()?,

            b'{' => self.conditional()?,

            b'}' => return Ok(false),

            b'*' => {
                if !self.legacy() && self.lex.consume(b'*')? {
                    self.function_def()?;
                } else {
                    self.add_label()?;
                    self.lex.expect(b':')?;
                }
            }

            b'@' => {
                self.out.emit(b);
                self.label_ref()?;
                self.lex.expect(b':')?;
            }

            b'\\' => {
                self.out.emit(b);
                if self.lex.consume(b'0')? {
                    // Retour d'appel.
                    if self.legacy() {
                        self.out.emit_word(0);
                    } else {
                        self.out.emit_dword(0);
                    }
                } else {
                    self.label_ref()?;
                }
                self.lex.expect(b':')?;
            }

            b'&' | b'%' => {
                self.out.emit(b);
                self.expr()?;
                self.lex.expect(b':')?;
            }

            b'<' => {
                if self.lex.consume(b'@')? {
                    self.while_loop()?;
                } else {
                    self.for_loop()?;
                }
            }

            b'>' => return Ok(false),

            b']' => self.out.emit(b),

            b'$' => {
                self.out.emit(b);
                if self.menu_item_start.take().is_some() {
                    // '$' fermant d'un item resté ouvert.
                } else {
                    self.label_ref()?;
                    self.lex.expect(b'$')?;
                    if !self.lex.peek().is_ascii() {
                        let forbid_ascii = !self.comp.config.ascii_messages;
                        self.compile_string(b'$', !self.comp.config.quoted_strings, forbid_ascii)?;
                        self.out.emit(b'$');
                    } else {
                        self.menu_item_start = Some(command_top);
                    }
                }
            }

            b'_' => {
                self.label_ref()?;
                self.lex.expect(b':')?;
            }

            b'"' => {
                self.compile_string(b'"', false, false)?;
                self.out.emit(0);
            }

            b'[' => {
                if !self.legacy() || self.bracket_is_data()? {
                    self.data_array()?;
                } else {
                    self.out.emit(b);
                    self.verb_obj()?;
                }
            }

            b':' if self.legacy() => {
                self.out.emit(b);
                self.expr()?;
                self.lex.expect(b',')?;
                self.verb_obj()?;
            }

            b'~' if !self.legacy() => self.funcall()?,

            b'#' if !self.legacy() => self.data_table_ref()?,

            _ if b.is_ascii_uppercase() => {
                let sig = self.signature(b).ok_or_else(|| {
                    self.err_at(command_top, format!("Unknown command {}", b as char))
                })?;
                if !sig.is_empty() {
                    self.arguments(sig)?;
                }
            }

            _ => {
                return Err(self.err_at(command_top, format!("Unknown command {}", b as char)));
            }
        }
        Ok(true)
    }

    fn commands(&mut self) -> Result<()> {
        while self.command()? {}
        Ok(())
    }

    fn toplevel(&mut self) -> Result<()> {
        if self.comp.config.unicode && self.page == 0 {
            // Commande "ZU 1:" injectée pour marquer un SCO Unicode.
            self.lex.skip_whitespaces()?;
            if self.emitting() {
                let (line, addr) = (self.lex.line(), self.out.addr());
                if let Some(dbg) = self.comp.dbg.as_mut() {
                    dbg.line_add(line, addr);
                }
            }
            self.out.emit_bytes(&[b'Z', b'U', 0x41, 0x7f]);
        }

        self.commands()?;
        if self.lex.peek() != 0 {
            return Err(self.err(format!("unexpected '{}'", self.lex.peek() as char)));
        }
        Ok(())
    }

    // 'const' 'word' id '=' n (',' id '=' n)* ':'
    fn define_const(&mut self) -> Result<()> {
        if !self.lex.consume_keyword("word")? {
            return Err(self.err("unknown const type"));
        }
        loop {
            let top = self.lex.pos();
            let id = self.lex.get_identifier()?.to_owned();
            self.lex.consume(b'=')?;
            let val = self.lex.get_number()?;
            let val = u16::try_from(val).map_err(|_| self.err_at(top, "constant out of range"))?;
            if self.pass == Pass::Prepare {
                match self.comp.symbols.get(&id) {
                    Some(Symbol::Variable(_)) => {
                        return Err(
                            self.err_at(top, format!("'{id}' is already defined as a variable"))
                        )
                    }
                    Some(Symbol::Const(_)) => {
                        return Err(self.err_at(top, format!("constant '{id}' redefined")))
                    }
                    None => {
                        self.comp.symbols.insert(id, Symbol::Const(val));
                    }
                }
            }
            if !self.lex.consume(b',')? {
                break;
            }
        }
        Ok(self.lex.expect(b':')?)
    }
}
