//! Marche analyse/émission sur une page.
//!
//! La même marche sert deux fois : sans sortie pour classer les octets
//! (code, labels, données, annotations de flot de contrôle), puis avec
//! sortie pour réémettre le DSL une fois les marques stables. Un octet de
//! tête inconnu pendant l'analyse fait reculer la marche et marque la zone
//! en données ; à l'émission c'est une erreur.

use std::collections::HashMap;
use std::rc::Rc;

use bitflags::bitflags;
use nact_core::cali::{self, Cali, ParseMode};
use nact_core::{text, SysVer};

use crate::sco::{Mark, MarkFlags, MarkType, Sco};
use crate::{DcError, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StrFlags: u8 {
        const ESCAPE = 1;
        const EXPAND = 2;
    }
}

#[derive(Debug)]
pub(crate) struct Function {
    pub name: String,
    /// None tant qu'aucun site d'appel n'a fixé la liste.
    pub params: Option<Vec<u16>>,
}

/// État d'une décompilation complète.
pub struct Decompiler {
    pub(crate) scos: Vec<Option<Sco>>,
    pub(crate) variables: Vec<Option<String>>,
    pub(crate) functions: HashMap<(u16, u32), Function>,
    pub(crate) disable_else: bool,
    pub(crate) old_sr: bool,
    pub(crate) utf8_input: bool,
    pub(crate) utf8_output: bool,
    pub(crate) address_prefix: bool,
    pub(crate) saw_bare_messages: bool,
    pub(crate) saw_ascii_messages: bool,

    page: usize,
    pos: usize,
    indent: usize,
    out: Option<Vec<u8>>,
}

impl Decompiler {
    pub(crate) fn new(scos: Vec<Option<Sco>>) -> Decompiler {
        Decompiler {
            scos,
            variables: Vec::new(),
            functions: HashMap::new(),
            disable_else: false,
            old_sr: false,
            utf8_input: false,
            utf8_output: true,
            address_prefix: false,
            saw_bare_messages: false,
            saw_ascii_messages: false,
            page: 0,
            pos: 0,
            indent: 1,
            out: None,
        }
    }

    fn sco(&self) -> &Sco {
        self.scos[self.page].as_ref().expect("current page exists")
    }

    fn sco_mut(&mut self) -> &mut Sco {
        self.scos[self.page].as_mut().expect("current page exists")
    }

    fn legacy(&self) -> bool {
        self.sco().sys_ver.is_legacy()
    }

    fn err(&self, msg: impl Into<String>) -> DcError {
        DcError::At { name: self.sco().sco_name.clone(), addr: self.pos, msg: msg.into() }
    }

    /* ── Sortie ── */

    fn putc(&mut self, c: u8) {
        if let Some(out) = &mut self.out {
            out.push(c);
        }
    }

    fn puts(&mut self, s: &str) {
        if let Some(out) = &mut self.out {
            out.extend_from_slice(s.as_bytes());
        }
    }

    fn print_address(&mut self) {
        if self.address_prefix {
            let s = format!("/* {:05x} */\t", self.pos);
            self.puts(&s);
        }
    }

    fn print_indent(&mut self) {
        if self.out.is_none() {
            return;
        }
        self.print_address();
        for _ in 0..self.indent {
            self.putc(b'\t');
        }
    }

    fn advance_char(&self, data: &[u8], i: usize) -> usize {
        if self.utf8_input {
            let mut i = i + 1;
            while i < data.len() && text::is_utf8_trail(data[i]) {
                i += 1;
            }
            i
        } else if text::is_sjis_byte1(data[i]) {
            i + 2
        } else {
            i + 1
        }
    }

    fn put_string_n(&mut self, s: &[u8], flags: StrFlags) {
        if self.out.is_none() {
            return;
        }
        let mut i = 0;
        while i < s.len() {
            let c = s[i];
            i += 1;
            if c.is_ascii_graphic() || c == b'\t' {
                if flags.contains(StrFlags::ESCAPE) && matches!(c, b'\\' | b'\'' | b'"' | b'<') {
                    self.putc(b'\\');
                }
                self.putc(c);
            } else if self.utf8_input {
                self.putc(c);
                while i < s.len() && text::is_utf8_trail(s[i]) {
                    self.putc(s[i]);
                    i += 1;
                }
            } else if text::is_compacted_sjis(c) {
                match text::expand_sjis(c) {
                    Some(full) if flags.contains(StrFlags::EXPAND) => {
                        self.putc((full >> 8) as u8);
                        self.putc(full as u8);
                    }
                    _ => self.putc(c),
                }
            } else if c == 0xde || c == 0xdf {
                // Marques de voisement demi-chasse.
                self.putc(c);
            } else {
                let c2 = s.get(i).copied().unwrap_or(0);
                i += 1;
                if self.utf8_output
                    && flags.contains(StrFlags::ESCAPE)
                    && !text::is_unicode_safe(c, c2)
                {
                    let s = format!("<0x{:04X}>", u16::from(c) << 8 | u16::from(c2));
                    self.puts(&s);
                } else {
                    self.putc(c);
                    self.putc(c2);
                }
            }
        }
    }

    // Copie depuis le flux jusqu'au terminateur (consommé).
    fn put_string(&mut self, data: &[u8], terminator: u8, flags: StrFlags) -> Result<()> {
        let end = data[self.pos..self.sco().filesize]
            .iter()
            .position(|&b| b == terminator)
            .map(|i| self.pos + i)
            .ok_or_else(|| self.err("unterminated string"))?;
        self.put_string_n(&data[self.pos..end], flags);
        self.pos = end + 1;
        Ok(())
    }

    /* ── Expressions ── */

    fn parse_cali(&mut self, data: &[u8], mode: ParseMode) -> Result<Cali> {
        let ver = self.sco().sys_ver;
        cali::parse(data, &mut self.pos, mode, ver).map_err(|e| self.err(e.to_string()))
    }

    fn cali(&mut self, data: &[u8], mode: ParseMode) -> Result<Cali> {
        let node = self.parse_cali(data, mode)?;
        if self.out.is_some() {
            let mut s = String::new();
            let sys1 = self.sco().sys_ver == SysVer::System1;
            node.print(&mut self.variables, sys1, &mut s);
            self.puts(&s);
        }
        Ok(node)
    }

    /* ── Labels ── */

    fn label(&mut self, data: &[u8]) -> Result<usize> {
        let addr = if self.legacy() {
            let a = u16::from_le_bytes([data[self.pos], data[self.pos + 1]]) as usize;
            self.pos += 2;
            a
        } else {
            let a = u32::from_le_bytes(data[self.pos..self.pos + 4].try_into().unwrap()) as usize;
            self.pos += 4;
            a
        };
        if addr == 0 {
            self.putc(b'0');
            return Ok(addr);
        }
        let s = format!("L_{addr:05x}");
        self.puts(&s);
        if addr > self.sco().filesize {
            return Err(self.err(format!("label address out of range: {addr:#x}")));
        }
        let pos = self.pos;
        let sco = self.sco_mut();
        if !sco.mark[addr].contains(MarkFlags::LABEL) && addr < pos {
            sco.analyzed = false;
        }
        sco.mark[addr].insert(MarkFlags::LABEL);
        Ok(addr)
    }

    /* ── Fonctions ── */

    fn function_name(&self, page: usize, addr: usize) -> String {
        match self.scos.get(page).and_then(Option::as_ref) {
            Some(sco) => {
                let stem = sco.src_name.rsplit_once('.').map_or(sco.src_name.as_str(), |(s, _)| s);
                format!("{stem}_{addr:x}")
            }
            None => format!("F_{page}_{addr:05x}"),
        }
    }

    fn get_function(&mut self, page: usize, addr: usize) -> (u16, u32) {
        let key = (page as u16, addr as u32);
        if !self.functions.contains_key(&key) {
            if self.scos.get(page).and_then(Option::as_ref).is_none() {
                tracing::warn!(page, addr, "function call into a missing page");
            }
            let name = self.function_name(page, addr);
            self.functions.insert(key, Function { name, params: None });
        }
        key
    }

    fn func_label(&mut self, page: usize, addr: usize) -> Result<(u16, u32)> {
        let key = self.get_function(page, addr);
        let name = self.functions[&key].name.clone();
        self.puts(&name);

        if let Some(sco) = self.scos.get_mut(page).and_then(Option::as_mut) {
            if addr > sco.filesize {
                return Err(DcError::At {
                    name: sco.sco_name.clone(),
                    addr,
                    msg: "function address out of range".into(),
                });
            }
            let mark = &mut sco.mark[addr];
            mark.insert(MarkFlags::FUNC_TOP);
            if !mark.contains(MarkFlags::CODE) && !mark.contains(MarkFlags::DATA) {
                if page != self.page || addr < self.pos {
                    sco.analyzed = false;
                }
            }
        }
        Ok(key)
    }

    fn defun(&mut self, key: (u16, u32)) {
        let f = &self.functions[&key];
        let (name, params) = (f.name.clone(), f.params.clone().unwrap_or_default());
        self.puts("**");
        self.puts(&name);
        let mut sep = " ";
        let mut s = String::new();
        for &var in &params {
            s.push_str(sep);
            sep = ", ";
            Cali::Variable(var).print(&mut self.variables, false, &mut s);
        }
        self.puts(&s);
        self.putc(b':');
    }

    fn func_labels(&mut self, page: usize, addr: usize) -> Result<()> {
        if self.out.is_none() {
            return Ok(());
        }
        let key = (page as u16, addr as u32);
        if !self.functions.contains_key(&key) {
            return Err(self.err(format!("BUG: function record for ({page}:{addr:x}) not found")));
        }
        self.print_address();
        self.defun(key);
        self.putc(b'\n');
        Ok(())
    }

    // Variable affectée par la commande '!' en `addr` ; avance `addr` au
    // début de la commande suivante.
    fn next_assignment_var(&mut self, data: &[u8], addr: &mut usize) -> Result<u16> {
        debug_assert_eq!(data[*addr], b'!');
        let mut p = *addr + 1;
        let ver = self.sco().sys_ver;
        let node =
            cali::parse(data, &mut p, ParseMode::Lhs, ver).map_err(|e| self.err(e.to_string()))?;
        let Cali::Variable(var) = node else {
            return Err(self.err("unexpected assignment target in call sequence"));
        };
        *addr = self.next_command(*addr)?;
        Ok(var)
    }

    // Début de la commande marquée suivante.
    fn next_command(&self, mut addr: usize) -> Result<usize> {
        let sco = self.sco();
        loop {
            addr += 1;
            if addr > sco.filesize {
                return Err(DcError::At {
                    name: sco.sco_name.clone(),
                    addr,
                    msg: "ran off the end of the page".into(),
                });
            }
            if !sco.mark[addr].is_empty() {
                return Ok(addr);
            }
        }
    }

    // Infère les paramètres d'une fonction par le plus long suffixe commun
    // des affectations précédant chaque site d'appel.
    fn analyze_args(
        &mut self,
        data: &[u8],
        key: (u16, u32),
        topaddr_candidate: usize,
        funcall_addr: usize,
    ) -> Result<()> {
        if topaddr_candidate == 0 {
            self.functions.get_mut(&key).expect("registered").params = Some(Vec::new());
            return Ok(());
        }

        let mut argc = 0;
        for a in topaddr_candidate..funcall_addr {
            if !self.sco().mark[a].is_empty() {
                argc += 1;
            }
        }

        let mut top = topaddr_candidate;
        let known = self.functions[&key].params.clone();
        let new_params = match known {
            None => {
                // Premier site d'appel rencontré.
                let mut params = Vec::with_capacity(argc);
                let mut addr = top;
                while addr < funcall_addr {
                    params.push(self.next_assignment_var(data, &mut addr)?);
                }
                params
            }
            Some(mut params) => {
                if argc < params.len() {
                    let excess = params.len() - argc;
                    params.drain(..excess);
                }
                let mut argc = argc;
                while argc > params.len() {
                    top = self.next_command(top)?;
                    argc -= 1;
                }
                let mut argi = 0;
                let mut last_mismatch = 0;
                let mut addr = top;
                let mut candidate = top;
                while addr < funcall_addr {
                    let var = self.next_assignment_var(data, &mut addr)?;
                    if params[argi] != var {
                        candidate = addr;
                        last_mismatch = argi + 1;
                    }
                    argi += 1;
                }
                params.drain(..last_mismatch);
                top = candidate;
                params
            }
        };
        self.functions.get_mut(&key).expect("registered").params = Some(new_params);

        if top < funcall_addr {
            self.sco_mut().mark[top].annotate(MarkType::FuncallTop);
        }
        Ok(())
    }

    // Réémission d'un appel avec arguments depuis son annotation
    // FUNCALL_TOP. Rend false si l'annotation s'est révélée périmée.
    fn funcall_with_args(&mut self, data: &[u8]) -> Result<bool> {
        let start = self.pos;
        let mut argc = 0;
        let mut addr = start;
        let mut was_not_funcall = false;
        while data[addr] == b'!' {
            argc += 1;
            addr = self.next_command(addr)?;
            if self.sco().mark[addr] != Mark::code_only() {
                // Un label est apparu au milieu de la séquence après la
                // pose de l'annotation.
                self.sco_mut().mark[start].annotate(MarkType::None);
                if data[addr] == b'!' {
                    self.sco_mut().mark[addr].annotate(MarkType::FuncallTop);
                }
                was_not_funcall = true;
                argc = 0;
            }
        }
        if data[addr] != b'~' {
            return Err(self.err("call sequence does not end in a function call"));
        }

        let page = u16::from_le_bytes([data[addr + 1], data[addr + 2]]) as usize;
        let funcaddr =
            u32::from_le_bytes(data[addr + 3..addr + 7].try_into().unwrap()) as usize;
        let key = self.get_function(page.wrapping_sub(1), funcaddr);

        let params_len = self.functions[&key].params.as_ref().map_or(0, Vec::len);
        let first_param = self.functions[&key].params.as_ref().and_then(|p| p.first().copied());
        if argc > 20 && self.page == 0 && first_param == Some(0) {
            // Probablement la séquence d'initialisation des variables en
            // tête de scénario, pas des arguments.
            self.sco_mut().mark[start].annotate(MarkType::None);
            argc = 0;
            was_not_funcall = true;
        }

        if was_not_funcall {
            if argc < params_len {
                let f = self.functions.get_mut(&key).expect("registered");
                if let Some(params) = &mut f.params {
                    let excess = params.len() - argc;
                    params.drain(..excess);
                }
            }
            return Ok(false);
        }

        if params_len < argc {
            // La liste a rétréci depuis la pose de l'annotation.
            self.sco_mut().mark[start].annotate(MarkType::None);
            if params_len == 0 {
                return Ok(false);
            }
            let mut a = start;
            for _ in 0..argc - params_len {
                a = self.next_command(a)?;
            }
            self.sco_mut().mark[a].annotate(MarkType::FuncallTop);
            return Ok(false);
        }

        self.putc(b'~');
        let name = self.functions[&key].name.clone();
        self.puts(&name);
        let mut sep = " ";
        for _ in 0..argc {
            self.pos += 1; // '!'
            self.parse_cali(data, ParseMode::Lhs)?;
            self.puts(sep);
            sep = ", ";
            self.cali(data, ParseMode::Full)?;
        }
        self.putc(b':');
        debug_assert_eq!(self.pos, addr);
        self.pos = addr + 7; // '~', page, adresse
        Ok(true)
    }

    fn funcall(&mut self, data: &[u8], funcall_top: usize) -> Result<()> {
        let calladdr = self.pos - 1;
        let page = u16::from_le_bytes([data[self.pos], data[self.pos + 1]]);
        self.pos += 2;
        match page {
            0 => {
                // Retour.
                self.puts("0,");
                self.cali(data, ParseMode::Full)?;
            }
            0xffff => {
                // Cible calculée ('~~expr:').
                self.putc(b'~');
                self.cali(data, ParseMode::Full)?;
            }
            _ => {
                let addr =
                    u32::from_le_bytes(data[self.pos..self.pos + 4].try_into().unwrap()) as usize;
                self.pos += 4;
                let key = self.func_label(usize::from(page) - 1, addr)?;
                self.analyze_args(data, key, funcall_top, calladdr)?;
            }
        }
        self.putc(b':');
        Ok(())
    }

    /* ── Flot de contrôle ── */

    fn surrounding_else(&self, data: &[u8], stack: &[usize]) -> Option<usize> {
        let &top = stack.last()?;
        let at = self.pos.checked_sub(6)?;
        if self.sco().mark[at].typ() != MarkType::Else {
            return None;
        }
        let target = u32::from_le_bytes(data[at + 1..at + 5].try_into().unwrap()) as usize;
        (target == top).then_some(at)
    }

    fn conditional(&mut self, data: &[u8], stack: &mut Vec<usize>) -> Result<()> {
        let surrounding_else = if self.legacy() { None } else { self.surrounding_else(data, stack) };

        self.indent += 1;
        self.cali(data, ParseMode::Full)?;
        self.putc(b':');
        let mut endaddr = u16::from_le_bytes([data[self.pos], data[self.pos + 1]]) as usize;
        self.pos += 2;
        if endaddr > self.sco().filesize {
            return Err(self.err(format!("branch end out of range: {endaddr:#x}")));
        }
        self.sco_mut().mark[endaddr].insert(MarkFlags::CODE);

        if !self.legacy() && endaddr >= self.sco().hdr_size + 5 {
            if data[endaddr - 3] == b'>' {
                // Fin de boucle while : rien à reconstruire.
            } else if data[endaddr - 5] == b'@' {
                if !self.disable_else {
                    let target =
                        u32::from_le_bytes(data[endaddr - 4..endaddr].try_into().unwrap())
                            as usize;
                    if endaddr <= target && target <= self.sco().filesize {
                        if let Some(at) = surrounding_else {
                            if stack.last() == Some(&target) {
                                stack.pop();
                                self.sco_mut().mark[at].annotate(MarkType::ElseIf);
                            }
                        }
                        let m = &mut self.sco_mut().mark[endaddr - 5];
                        if m.typ() != MarkType::ElseIf {
                            m.annotate(MarkType::Else);
                        }
                        endaddr = target;
                    } else {
                        self.disable_else = true;
                    }
                }
            } else {
                self.disable_else = true;
            }
        }
        stack.push(endaddr);
        Ok(())
    }

    fn for_loop(&mut self, data: &[u8]) -> Result<()> {
        // Retrouve l'affectation qui ouvre la boucle.
        let mut m = self.pos - 2;
        while m > self.sco().hdr_size && !self.sco().mark[m].contains(MarkFlags::CODE) {
            m -= 1;
        }
        self.sco_mut().mark[m].annotate(MarkType::ForStart);

        if data[self.pos] != 0 {
            return Err(self.err(format!("for-loop: 0 expected, got {:#04x}", data[self.pos])));
        }
        if data[self.pos + 1] != b'<' || data[self.pos + 2] != 1 {
            return Err(self.err("for-loop: '<' 0x01 expected"));
        }
        self.pos += 3;
        self.pos += 2; // trou de fin
        self.parse_cali(data, ParseMode::Full)?; // copie de la variable
        self.cali(data, ParseMode::Full)?; // fin
        self.puts(", ");
        self.cali(data, ParseMode::Full)?; // sens
        self.puts(", ");
        self.cali(data, ParseMode::Full)?; // pas
        self.putc(b':');
        self.indent += 1;
        Ok(())
    }

    fn loop_end(&mut self, data: &[u8], stack: &mut Vec<usize>) -> Result<()> {
        let addr = u16::from_le_bytes([data[self.pos], data[self.pos + 1]]) as usize;
        self.pos += 2;
        if addr >= self.sco().filesize {
            return Err(self.err("loop target out of range"));
        }
        match data[addr] {
            b'{' => {
                self.sco_mut().mark[addr].annotate(MarkType::WhileStart);
                if stack.last() != Some(&self.pos) {
                    return Err(self.err(format!(
                        "while-loop: unexpected address ({:?} != {:#x})",
                        stack.last(),
                        self.pos
                    )));
                }
                stack.pop();
            }
            b'<' => {}
            _ => return Err(self.err("Unexpected loop structure")),
        }
        Ok(())
    }

    /* ── Arguments des commandes lettres ── */

    fn signature(&self, cmd: u8) -> Option<&'static str> {
        // Le pendant exact de la table du compilateur.
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

    fn arguments(&mut self, data: &[u8], sig: &str) -> Result<()> {
        let mut sep = " ";
        for kind in sig.bytes() {
            self.puts(sep);
            sep = ", ";
            match kind {
                b'e' | b'v' => {
                    self.cali(data, ParseMode::Full)?;
                }
                b'n' => {
                    let s = format!("{}", data[self.pos]);
                    self.pos += 1;
                    self.puts(&s);
                }
                b's' => self.put_string(data, b':', StrFlags::empty())?,
                b'z' => self.put_string(data, 0, StrFlags::empty())?,
                b'o' => {
                    // Chaîne brouillée : quartets échangés.
                    if data[self.pos] != 0 {
                        return Err(self.err("0x00 expected"));
                    }
                    self.pos += 1;
                    self.putc(b'"');
                    let end = data[self.pos..self.sco().filesize]
                        .iter()
                        .position(|&b| b == 0)
                        .map(|i| self.pos + i)
                        .ok_or_else(|| self.err("unterminated string"))?;
                    let buf: Vec<u8> =
                        data[self.pos..end].iter().map(|&b| b >> 4 | b << 4).collect();
                    self.put_string_n(&buf, StrFlags::empty());
                    self.pos = end + 1;
                    self.putc(b'"');
                }
                other => {
                    return Err(self.err(format!(
                        "BUG: invalid arguments() template: {}",
                        other as char
                    )))
                }
            }
        }
        self.putc(b':');
        Ok(())
    }

    /* ── Divers ── */

    fn page_name(&mut self, data: &[u8], cmd: u8) -> Result<()> {
        let node = self.parse_cali(data, ParseMode::Full)?;
        if self.out.is_none() {
            return Ok(());
        }
        if let Cali::Number(n) = node {
            if n >= 0 && (cmd != b'%' || n != 0) {
                if let Some(sco) = self.scos.get(n as usize).and_then(Option::as_ref) {
                    let s = format!("#{}", sco.src_name);
                    self.puts(&s);
                    return Ok(());
                }
            }
        }
        let mut s = String::new();
        let sys1 = self.sco().sys_ver == SysVer::System1;
        node.print(&mut self.variables, sys1, &mut s);
        self.puts(&s);
        Ok(())
    }

    fn inline_menu_string(&mut self, data: &[u8]) -> Result<bool> {
        let mut end = self.pos;
        while end < self.sco().filesize && (data[end] == 0x20 || data[end] > 0x80) {
            end = self.advance_char(data, end);
        }
        if data.get(end) != Some(&b'$') {
            return Ok(false);
        }
        self.put_string_n(&data[self.pos..end], StrFlags::EXPAND);
        self.pos = end;
        self.putc(data[self.pos]);
        self.pos += 1;
        Ok(true)
    }

    fn is_string_data(&self, s: &[u8], should_expand: bool) -> bool {
        if s.first() == Some(&0) && s.len() == 1 {
            return true;
        }
        let mut i = 0;
        while i < s.len() {
            if s[i] == 0 {
                return i >= 2;
            }
            if self.utf8_input {
                let step = match s[i] {
                    0..=0x7f => 1,
                    0x80..=0xdf => 2,
                    0xe0..=0xef => 3,
                    0xf0..=0xf7 => 4,
                    _ => return false,
                };
                if i + step > s.len() {
                    return false;
                }
                if !s[i + 1..i + step].iter().all(|&b| text::is_utf8_trail(b)) {
                    return false;
                }
                i += step;
            } else if i + 1 < s.len() && text::is_valid_sjis(s[i], s[i + 1]) {
                i += 2;
            } else if s[i].is_ascii_graphic()
                || s[i] == b' '
                || (should_expand && text::is_compacted_sjis(s[i]))
            {
                i += 1;
            } else {
                return false;
            }
        }
        false
    }

    fn data_block(&mut self, data: &[u8], end: usize) -> Result<()> {
        // Cibles des tables de pointeurs : des labels, même pendant
        // l'analyse.
        let width = if self.legacy() { 2 } else { 4 };
        for p in self.pos..end {
            if self.sco().mark[p].contains(MarkFlags::DATA_TABLE) && p + width <= end {
                let target = if width == 2 {
                    u16::from_le_bytes([data[p], data[p + 1]]) as usize
                } else {
                    u32::from_le_bytes(data[p..p + 4].try_into().unwrap()) as usize
                };
                if target < self.sco().filesize {
                    let sco = self.sco_mut();
                    if !sco.mark[target].contains(MarkFlags::LABEL) {
                        sco.analyzed = false;
                    }
                    sco.mark[target].insert(MarkFlags::LABEL | MarkFlags::DATA);
                }
            }
        }

        if self.out.is_none() {
            self.pos = end;
            return Ok(());
        }

        let should_expand = true;
        let mut prefer_string = false;

        while self.pos < end {
            self.print_indent();

            if self.sco().mark[self.pos].contains(MarkFlags::DATA_TABLE)
                && self.pos + width <= end
            {
                let target = if width == 2 {
                    u16::from_le_bytes([data[self.pos], data[self.pos + 1]]) as usize
                } else {
                    u32::from_le_bytes(data[self.pos..self.pos + 4].try_into().unwrap()) as usize
                };
                let s = format!("_L_{target:05x}:\n");
                self.puts(&s);
                self.pos += width;
                continue;
            }

            let rest = &data[self.pos..end];
            if self.is_string_data(rest, should_expand)
                || (rest.first() == Some(&0)
                    && (prefer_string || self.is_string_data(&rest[1..], should_expand)))
            {
                self.putc(b'"');
                self.put_string(data, 0, StrFlags::ESCAPE | StrFlags::EXPAND)?;
                self.puts("\"\n");
                prefer_string = true;
                continue;
            }
            prefer_string = false;

            self.putc(b'[');
            let mut sep = "";
            while self.pos < end && !self.is_string_data(&data[self.pos..end], should_expand) {
                if self.pos + 1 == end {
                    tracing::warn!(
                        "{}:{:x}: data block with odd number of bytes",
                        self.sco().sco_name,
                        self.pos
                    );
                    let s = format!("{sep}{}b", data[self.pos]);
                    self.puts(&s);
                    self.pos += 1;
                    break;
                }
                let v = u16::from_le_bytes([data[self.pos], data[self.pos + 1]]);
                let s = format!("{sep}{v}");
                self.puts(&s);
                self.pos += 2;
                sep = ", ";
            }
            self.puts("]\n");
        }
        Ok(())
    }

    fn get_command(&mut self, data: &[u8]) -> u8 {
        let cmd = data[self.pos];
        self.pos += 1;
        self.putc(if (0x10..=0x17).contains(&cmd) { b'!' } else { cmd });
        cmd
    }

    /* ── Marche principale ── */

    fn dispatch(
        &mut self,
        data: &[u8],
        cmd: u8,
        stack: &mut Vec<usize>,
        in_menu_item: &mut bool,
        funcall_top: usize,
        next_funcall_top: &mut usize,
    ) -> Result<()> {
        let legacy = self.legacy();
        match cmd {
            b'!' | 0x10..=0x17 => {
                if cmd == b'!' {
                    *next_funcall_top =
                        if funcall_top != 0 { funcall_top } else { self.pos - 1 };
                }
                let node = self.cali(data, ParseMode::Lhs)?;
                if matches!(node, Cali::ArrayRef(..)) {
                    // Une référence de tableau ne peut pas être un argument.
                    *next_funcall_top = 0;
                }
                self.putc(b' ');
                if cmd != b'!' {
                    self.putc(b"+-*/%&|^"[usize::from(cmd) - 0x10]);
                }
                self.puts(": ");
                self.cali(data, ParseMode::Full)?;
                self.putc(b'!');
                if legacy {
                    if data.get(self.pos) != Some(&b'!') {
                        return Err(self.err("'!' expected after assignment"));
                    }
                    self.pos += 1;
                }
            }

            b'\'' => {
                // Message quoté.
                if data[self.pos..self.sco().filesize]
                    .iter()
                    .take_while(|&&b| b != b'\'')
                    .any(u8::is_ascii_graphic)
                {
                    self.saw_ascii_messages = true;
                }
                self.put_string(data, b'\'', StrFlags::ESCAPE)?;
                self.putc(b'\'');
            }

            b'{' => self.conditional(data, stack)?,

            b'@' => {
                self.label(data)?;
                self.putc(b':');
            }

            b'\\' => {
                self.label(data)?;
                self.putc(b':');
            }

            b'&' | b'%' => {
                self.page_name(data, cmd)?;
                self.putc(b':');
            }

            b'<' => self.for_loop(data)?,

            b'>' => self.loop_end(data, stack)?,

            b']' => {}

            b'$' => {
                *in_menu_item = !*in_menu_item;
                if *in_menu_item {
                    self.label(data)?;
                    self.putc(b'$');
                    if self.inline_menu_string(data)? {
                        *in_menu_item = false;
                    }
                }
            }

            b'[' if legacy => {
                let (verb, obj) = (data[self.pos], data[self.pos + 1]);
                self.pos += 2;
                self.label(data)?;
                let s = format!(", {verb}, {obj}:");
                self.puts(&s);
            }

            b':' if legacy => {
                self.cali(data, ParseMode::Full)?;
                self.puts(", ");
                let (verb, obj) = (data[self.pos], data[self.pos + 1]);
                self.pos += 2;
                self.label(data)?;
                let s = format!(", {verb}, {obj}:");
                self.puts(&s);
            }

            b'~' if !legacy => self.funcall(data, funcall_top)?,

            b'#' if !legacy => {
                let table = self.label(data)?;
                // La table et ses cibles sont des données.
                if table != 0 && table < self.sco().filesize {
                    self.sco_mut().mark[table].insert(MarkFlags::DATA_TABLE | MarkFlags::DATA);
                }
                self.puts(", ");
                self.cali(data, ParseMode::Full)?;
                self.putc(b':');
            }

            _ if cmd.is_ascii_uppercase() => {
                let sig = self
                    .signature(cmd)
                    .ok_or_else(|| self.err(format!("unknown command '{}'", cmd as char)))?;
                if !sig.is_empty() {
                    self.arguments(data, sig)?;
                }
            }

            _ => return Err(self.err(format!("unknown command {cmd:#04x}"))),
        }
        Ok(())
    }

    pub(crate) fn decompile_page(&mut self, page: usize, out: Option<Vec<u8>>) -> Result<Option<Vec<u8>>> {
        self.page = page;
        self.out = out;
        self.indent = 1;
        let data: Rc<Vec<u8>> = self.sco().data.clone();
        let data: &[u8] = &data;
        let filesize = self.sco().filesize;
        let default_addr = usize::from(self.sco().default_addr);
        self.pos = self.sco().hdr_size;

        let mut in_menu_item = false;
        let mut stack: Vec<usize> = Vec::new();
        let mut next_funcall_top = 0usize;

        // SCO Unicode : la commande marqueur "ZU 1:" de la page 0.
        if self.utf8_input && page == 0 && data[self.pos..].starts_with(b"ZU\x41\x7f") {
            self.pos += 4;
        }

        while self.pos < filesize {
            let topaddr = self.pos;
            let mark = self.sco().mark[topaddr];
            while stack.last() == Some(&topaddr) {
                stack.pop();
                self.indent -= 1;
                if self.indent == 0 {
                    return Err(self.err("unbalanced branch end"));
                }
                self.print_indent();
                self.puts("}\n");
                next_funcall_top = 0;
            }
            let funcall_top = if mark.beyond(MarkFlags::CODE) { 0 } else { next_funcall_top };
            next_funcall_top = 0;

            if mark.contains(MarkFlags::FUNC_TOP) {
                self.func_labels(page, topaddr)?;
            }
            if mark.contains(MarkFlags::LABEL) {
                self.print_address();
                if topaddr == default_addr {
                    self.puts("*default:\n");
                }
                let s = format!("*L_{topaddr:05x}:\n");
                self.puts(&s);
            }

            if mark.contains(MarkFlags::DATA) {
                let mut data_end = self.pos + 1;
                while data_end < filesize && !self.sco().mark[data_end].beyond(MarkFlags::DATA) {
                    data_end += 1;
                }
                self.data_block(data, data_end)?;
                continue;
            }

            if mark.typ() == MarkType::ElseIf && !self.disable_else {
                if data[self.pos] != b'@' || data.get(self.pos + 5) != Some(&b'{') {
                    return Err(self.err("inconsistent else-if annotation"));
                }
                self.pos += 6;
                self.indent = self.indent.saturating_sub(1);
                stack.pop();
                self.print_indent();
                self.puts("} else if {");
                self.conditional(data, &mut stack)?;
                self.putc(b'\n');
                continue;
            }
            if mark.typ() == MarkType::Else && !self.disable_else {
                if data[self.pos] != b'@' {
                    return Err(self.err("inconsistent else annotation"));
                }
                self.pos += 5;
                let target =
                    u32::from_le_bytes(data[self.pos - 4..self.pos].try_into().unwrap()) as usize;
                if target != self.pos {
                    self.indent = self.indent.saturating_sub(1);
                    self.print_indent();
                    self.puts("} else {\n");
                    self.indent += 1;
                }
                continue;
            }

            // Octet '}' de fin de bloc System 1/2 : la fermeture est
            // imprimée au dépilement, l'octet lui-même est muet.
            if matches!(self.sco().sys_ver, SysVer::System1 | SysVer::System2)
                && data[self.pos] == b'}'
            {
                let pos = self.pos;
                self.sco_mut().mark[pos].insert(MarkFlags::CODE);
                self.pos += 1;
                continue;
            }

            if data[self.pos] == b'>' {
                // Saturé : du bytecode étranger peut présenter un '>' orphelin.
                self.indent = self.indent.saturating_sub(1);
            }
            self.print_indent();

            if data[self.pos] == 0 || data[self.pos] == 0x20 || data[self.pos] > 0x80 {
                // Message non quoté (ou donnée chaîne égarée dans le code).
                self.saw_bare_messages = true;
                self.putc(b'\'');
                let begin = self.pos;
                while self.pos < filesize
                    && (data[self.pos] == 0x20 || data[self.pos] > 0x80)
                {
                    self.pos = self.advance_char(data, self.pos);
                    if !self.sco().mark[self.pos].is_empty() {
                        break;
                    }
                }
                let end = self.pos;
                self.put_string_n(&data[begin..end], StrFlags::ESCAPE | StrFlags::EXPAND);
                self.puts("'\n");
                if data.get(self.pos) == Some(&0) {
                    // Donnée chaîne en zone code : probablement des doubles
                    // quotes saisies à la place de simples.
                    self.sco_mut().mark[begin].insert(MarkFlags::DATA);
                    self.pos += 1;
                } else {
                    self.sco_mut().mark[begin].insert(MarkFlags::CODE);
                }
                continue;
            }

            let pos = self.pos;
            self.sco_mut().mark[pos].insert(MarkFlags::CODE);

            if mark.typ() == MarkType::ForStart {
                if data[self.pos] != b'!' {
                    return Err(self.err("inconsistent for-loop annotation"));
                }
                self.pos += 1;
                self.putc(b'<');
                self.cali(data, ParseMode::Lhs)?;
                self.puts(", ");
                self.cali(data, ParseMode::Full)?;
                self.puts(", ");
                if self.legacy() {
                    if data.get(self.pos) != Some(&b'!') {
                        return Err(self.err("'!' expected in for-loop prologue"));
                    }
                    self.pos += 1;
                }
                if data.get(self.pos) != Some(&b'<') {
                    return Err(self.err("'<' expected in for-loop prologue"));
                }
                self.pos += 1;
                self.for_loop(data)?;
                self.putc(b'\n');
                continue;
            }
            if mark.typ() == MarkType::WhileStart {
                if data[self.pos] != b'{' {
                    return Err(self.err("inconsistent while annotation"));
                }
                self.pos += 1;
                self.puts("<@");
                self.conditional(data, &mut stack)?;
                self.putc(b'\n');
                continue;
            }
            if mark.typ() == MarkType::FuncallTop && self.funcall_with_args(data)? {
                self.putc(b'\n');
                continue;
            }

            let cmd = self.get_command(data);
            match self.dispatch(
                data,
                cmd,
                &mut stack,
                &mut in_menu_item,
                funcall_top,
                &mut next_funcall_top,
            ) {
                Ok(()) => {}
                Err(e) => {
                    if self.out.is_some() {
                        return Err(e);
                    }
                    // Phase d'analyse : on recule et on réessaie la zone en
                    // tant que données.
                    self.pos = topaddr;
                    let m = &mut self.sco_mut().mark[topaddr];
                    m.remove(MarkFlags::CODE);
                    m.insert(MarkFlags::DATA);
                    continue;
                }
            }
            self.putc(b'\n');
        }

        while stack.last() == Some(&filesize) {
            stack.pop();
            self.indent -= 1;
            if self.indent == 0 {
                return Err(self.err("unbalanced branch end"));
            }
            self.print_indent();
            self.puts("}\n");
        }
        if self.sco().mark[filesize].contains(MarkFlags::LABEL) {
            let s = format!("*L_{filesize:05x}:\n");
            self.puts(&s);
        }
        Ok(self.out.take())
    }

    /// Source de remplacement pour un slot de page absent : volume nul pour
    /// que la recompilation n'archive rien, et les fonctions qui y pointent
    /// épinglées à leur adresse.
    pub(crate) fn missing_page_source(&mut self, page: usize) -> Vec<u8> {
        let mut keys: Vec<(u16, u32)> = self
            .functions
            .keys()
            .filter(|k| usize::from(k.0) == page)
            .copied()
            .collect();
        keys.sort_unstable_by_key(|k| k.1);

        self.out = Some(b"pragma ald_volume 0:\n".to_vec());
        for key in keys {
            let s = format!("pragma address 0x{:x}:\n", key.1);
            self.puts(&s);
            self.defun(key);
            self.putc(b'\n');
        }
        self.out.take().expect("just set")
    }
}
