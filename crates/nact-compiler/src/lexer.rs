//! Lexer du DSL de scénarios.
//!
//! Pas de flux de tokens : le compilateur demande au lexer ce qu'il attend
//! (`get_identifier`, `get_label`, `get_number`, …) sur un curseur d'octets
//! UTF-8. Les blancs couvrent l'espace idéographique U+3000 et trois formes
//! de commentaires (`;`, `//`, `/* */` non imbriqué).

use crate::Diagnostic;

/// Curseur lexical sur une source UTF-8.
#[derive(Debug)]
pub struct Lexer<'s> {
    src: &'s [u8],
    pos: usize,
    line: u32,
    name: String,
    page: usize,
}

/// Résultat des getters du lexer.
pub type LexResult<T> = Result<T, Diagnostic>;

impl<'s> Lexer<'s> {
    /// Installe un curseur au début de `source`.
    pub fn new(source: &'s str, name: &str, page: usize) -> Self {
        Self { src: source.as_bytes(), pos: 0, line: 1, name: name.to_owned(), page }
    }

    /// Index de page de la source courante.
    pub fn page(&self) -> usize {
        self.page
    }

    /// Octets de la source (pour les coupes multi-octets du compilateur).
    pub fn src(&self) -> &'s [u8] {
        self.src
    }

    /// Numéro de ligne courant (1-base).
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Position courante (offset d'octet).
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Repositionne le curseur (retour arrière après un essai de lecture).
    pub fn set_pos(&mut self, pos: usize) {
        debug_assert!(pos <= self.pos);
        self.line -= self.src[pos..self.pos].iter().filter(|&&b| b == b'\n').count() as u32;
        self.pos = pos;
    }

    /// Octet sous le curseur, 0 à la fin.
    pub fn peek(&self) -> u8 {
        self.src.get(self.pos).copied().unwrap_or(0)
    }

    fn peek_at(&self, off: usize) -> u8 {
        self.src.get(self.pos + off).copied().unwrap_or(0)
    }

    /// Avance d'un octet et le renvoie.
    pub fn bump(&mut self) -> u8 {
        let b = self.peek();
        if b != 0 {
            self.pos += 1;
            if b == b'\n' {
                self.line += 1;
            }
        }
        b
    }

    /// Avance d'un caractère entier (octet + continuations UTF-8).
    pub fn bump_char(&mut self) {
        self.bump();
        while nact_core::text::is_utf8_trail(self.peek()) {
            self.bump();
        }
    }

    /// Diagnostic ancré à `pos`.
    pub fn diag_at(&self, pos: usize, msg: impl Into<String>) -> Diagnostic {
        Diagnostic::new(&self.name, self.src, pos, msg.into())
    }

    /// Diagnostic à la position courante.
    pub fn diag(&self, msg: impl Into<String>) -> Diagnostic {
        self.diag_at(self.pos, msg)
    }

    /// Saute blancs et commentaires.
    pub fn skip_whitespaces(&mut self) -> LexResult<()> {
        loop {
            let b = self.peek();
            if b != 0 && b.is_ascii_whitespace() {
                self.bump();
            } else if b == b';' || (b == b'/' && self.peek_at(1) == b'/') {
                while self.peek() != 0 && self.peek() != b'\n' {
                    self.bump();
                }
            } else if b == b'/' && self.peek_at(1) == b'*' {
                let top = self.pos;
                self.bump();
                self.bump();
                loop {
                    match self.bump() {
                        0 => return Err(self.diag_at(top, "unfinished comment")),
                        b'*' if self.peek() == b'/' => {
                            self.bump();
                            break;
                        }
                        _ => {}
                    }
                }
            } else if b == 0xe3 && self.peek_at(1) == 0x80 && self.peek_at(2) == 0x80 {
                // U+3000 IDEOGRAPHIC SPACE
                self.pos += 3;
            } else {
                return Ok(());
            }
        }
    }

    /// Prochain octet significatif (sans le consommer).
    pub fn next_char(&mut self) -> LexResult<u8> {
        self.skip_whitespaces()?;
        Ok(self.peek())
    }

    /// Consomme `c` s'il est le prochain octet significatif.
    pub fn consume(&mut self, c: u8) -> LexResult<bool> {
        if self.next_char()? != c {
            return Ok(false);
        }
        self.bump();
        Ok(true)
    }

    /// Exige `c` comme prochain octet significatif.
    pub fn expect(&mut self, c: u8) -> LexResult<()> {
        if self.next_char()? != c {
            return Err(self.diag(format!("'{}' expected", c as char)));
        }
        self.bump();
        Ok(())
    }

    /// Consomme `keyword` s'il est présent avec une frontière de mot.
    pub fn consume_keyword(&mut self, keyword: &str) -> LexResult<bool> {
        self.skip_whitespaces()?;
        let k = keyword.as_bytes();
        if !self.src[self.pos..].starts_with(k) {
            return Ok(false);
        }
        let after = self.peek_at(k.len());
        if after.is_ascii_alphanumeric() || after == b'_' {
            return Ok(false);
        }
        self.pos += k.len();
        Ok(true)
    }

    fn is_identifier(b: u8) -> bool {
        b.is_ascii_alphanumeric() || !b.is_ascii() || b == b'_' || b == b'.'
    }

    fn is_label(b: u8) -> bool {
        !b.is_ascii() || (b.is_ascii_graphic() && !matches!(b, b'$' | b',' | b';' | b':'))
    }

    fn span_from(&self, top: usize) -> &'s str {
        // La source vient d'un &str : les frontières restent valides.
        let src: &'s [u8] = self.src;
        std::str::from_utf8(&src[top..self.pos]).expect("identifier spans are valid UTF-8")
    }

    /// Identifiant : `[A-Za-z_.]` ou tout octet non ASCII, chiffre initial
    /// interdit.
    pub fn get_identifier(&mut self) -> LexResult<&'s str> {
        self.skip_whitespaces()?;
        let top = self.pos;
        let b = self.peek();
        if !Self::is_identifier(b) || b.is_ascii_digit() {
            return Err(self.diag_at(top, "identifier expected"));
        }
        while Self::is_identifier(self.peek()) {
            self.bump_char();
        }
        Ok(self.span_from(top))
    }

    /// Label : toute séquence imprimable hors `$ , ; :` et blancs.
    pub fn get_label(&mut self) -> LexResult<&'s str> {
        self.skip_whitespaces()?;
        let top = self.pos;
        while Self::is_label(self.peek()) {
            self.bump_char();
        }
        if self.pos == top {
            return Err(self.diag_at(top, "label expected"));
        }
        Ok(self.span_from(top))
    }

    /// Nom de fichier (même classe que les identifiants, chiffres admis).
    pub fn get_filename(&mut self) -> LexResult<&'s str> {
        let top = self.pos;
        while Self::is_identifier(self.peek()) {
            self.bump_char();
        }
        if self.pos == top {
            return Err(self.diag_at(top, "file name expected"));
        }
        Ok(self.span_from(top))
    }

    /// Nombre décimal, `0x…` hexadécimal ou `0b…` binaire.
    pub fn get_number(&mut self) -> LexResult<u32> {
        if !self.next_char()?.is_ascii_digit() {
            return Err(self.diag("number expected"));
        }
        let top = self.pos;
        let radix = if self.peek() == b'0' && matches!(self.peek_at(1), b'x' | b'X') {
            self.pos += 2;
            16
        } else if self.peek() == b'0' && matches!(self.peek_at(1), b'b' | b'B') {
            self.pos += 2;
            2
        } else {
            10
        };
        let digits_top = self.pos;
        while (self.peek() as char).is_digit(radix) {
            self.bump();
        }
        let digits = self.span_from(digits_top);
        u32::from_str_radix(digits, radix).map_err(|_| self.diag_at(top, "malformed number"))
    }
}
