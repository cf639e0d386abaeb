//! nact-compiler — compilation des scénarios vers les archives à volumes.
//!
//! Chaîne : lecture des sources (UTF-8 ou CP932) listées par le `.hed`,
//! passe de préparation (symboles, constantes, fonctions), passe
//! d'émission page par page, patch des appels inter-pages, assemblage des
//! volumes d'archive et des fichiers annexes (AG00, symboles de debug).
//!
//! Les erreurs sont toutes fatales : un [`Diagnostic`] porte le fichier,
//! la ligne, la colonne, la ligne source citée et un caret.

#![deny(missing_docs)]

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Compilation des commandes.
pub mod compile;
/// Configuration projet et `.hed`.
pub mod config;
/// Symboles de debug.
pub mod debuginfo;
/// Lexer du DSL.
pub mod lexer;
/// Prologue/épilogue de page.
pub mod sco;

pub use compile::{Compiler, PageSco};
pub use config::Config;

/// Alias résultat du crate.
pub type Result<T> = std::result::Result<T, CompileError>;

/* ─────────────────────────── Diagnostics ─────────────────────────── */

/// Erreur localisée dans une source, au format
/// `fichier line N column M: message`, suivie de la ligne citée et d'un
/// caret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    file: String,
    line: u32,
    col: u32,
    msg: String,
    src_line: String,
    caret_pad: String,
}

impl Diagnostic {
    /// Construit un diagnostic pour l'offset `pos` de `src`.
    pub fn new(file: &str, src: &[u8], pos: usize, msg: String) -> Self {
        let pos = pos.min(src.len());
        let line_start = src[..pos].iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
        let line_end = src[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(src.len(), |i| pos + i);
        let line = src[..line_start].iter().filter(|&&b| b == b'\n').count() as u32 + 1;
        let src_line = String::from_utf8_lossy(&src[line_start..line_end]).into_owned();
        let caret_pad = src[line_start..pos]
            .iter()
            .map(|&b| if b == b'\t' { '\t' } else { ' ' })
            .collect();
        Self {
            file: file.to_owned(),
            line,
            col: (pos - line_start) as u32 + 1,
            msg,
            src_line,
            caret_pad,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} line {} column {}: {}", self.file, self.line, self.col, self.msg)?;
        writeln!(f, "{}", self.src_line)?;
        write!(f, "{}^", self.caret_pad)
    }
}

impl std::error::Error for Diagnostic {}

/// Erreurs du compilateur.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Erreur localisée dans une source.
    #[error("{0}")]
    Diag(#[from] Diagnostic),
    /// Erreur sans position.
    #[error("{0}")]
    Msg(String),
    /// Erreur d'archive.
    #[error(transparent)]
    Archive(#[from] nact_archive::ArchiveError),
    /// Erreur d'entrée/sortie.
    #[error("{}: {source}", path.display())]
    Io {
        /// Fichier fautif.
        path: PathBuf,
        /// Erreur système.
        source: std::io::Error,
    },
}

fn io_err(path: &Path, source: std::io::Error) -> CompileError {
    CompileError::Io { path: path.to_owned(), source }
}

/* ─────────────────────────── Lecture des sources ─────────────────────────── */

/// Lit un fichier source dans l'encodage configuré et le rend en UTF-8.
/// Les octets invalides sont des erreurs pointées ligne/colonne.
pub fn read_source(path: &Path, utf8: bool) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| io_err(path, e))?;
    let name = path.display().to_string();
    if utf8 {
        match nact_core::text::validate_utf8(&bytes) {
            None => Ok(String::from_utf8(bytes).expect("validated")),
            Some(at) => {
                Err(Diagnostic::new(&name, &bytes, at, "Invalid UTF-8 character".into()).into())
            }
        }
    } else {
        let decoded = nact_core::text::to_utf8_sub(&bytes);
        match decoded.find('\u{fffd}') {
            None => Ok(decoded),
            Some(at) => Err(Diagnostic::new(
                &name,
                decoded.as_bytes(),
                at,
                "Invalid Shift_JIS character".into(),
            )
            .into()),
        }
    }
}

fn read_list_file(path: &Path, utf8: bool) -> Result<Vec<String>> {
    Ok(config::read_list(&read_source(path, utf8)?))
}

fn basename(path: &Path) -> String {
    path.file_name().map_or_else(String::new, |n| n.to_string_lossy().into_owned())
}

/* ─────────────────────────── Pilote de compilation ─────────────────────────── */

/// Compile `src_paths` et écrit les volumes d'archive sous `adisk_path`
/// (le nom du volume A ; les lettres suivantes en sont dérivées), plus les
/// fichiers annexes.
pub fn build(config: &Config, src_paths: &[PathBuf], adisk_path: &Path) -> Result<()> {
    let mut sources = Vec::with_capacity(src_paths.len());
    for path in src_paths {
        sources.push((basename(path), read_source(path, config.utf8)?));
    }

    let variables = match &config.var_list {
        Some(path) => read_list_file(path, config.utf8)?,
        None => Vec::new(),
    };
    let verbs = match &config.verb_list {
        Some(path) => read_list_file(path, config.utf8)?,
        None => Vec::new(),
    };
    let objects = match &config.obj_list {
        Some(path) => read_list_file(path, config.utf8)?,
        None => Vec::new(),
    };

    let src_names: Vec<String> = sources.iter().map(|(n, _)| n.clone()).collect();
    let mut compiler =
        Compiler::new(config.clone(), src_names, variables, &verbs, &objects)?;
    if config.debug {
        compiler.dbg = Some(debuginfo::DebugInfo::new(sources.clone()));
    }

    for (page, (name, text)) in sources.iter().enumerate() {
        tracing::debug!(page, name, "preprocessing");
        compiler.preprocess(text, page)?;
    }
    let mut pages = Vec::with_capacity(sources.len());
    for (page, (name, text)) in sources.iter().enumerate() {
        tracing::debug!(page, name, "compiling");
        pages.push(compiler.compile(text, page)?);
    }
    compiler.finalize(&mut pages)?;

    let mut mask = 0u32;
    let entries: Vec<Option<nact_archive::Entry>> = pages
        .iter()
        .enumerate()
        .map(|(i, page)| {
            mask |= page.volume_bits;
            Some(nact_archive::Entry {
                id: i as u32 + 1,
                data: page.data.clone(),
                volume_bits: page.volume_bits,
            })
        })
        .collect();

    let kind = nact_archive::VolumeKind::from(config.sys_ver.archive_kind());
    for volume in 1..=nact_archive::volume::MAX_VOLUME {
        if mask & 1 << volume == 0 {
            continue;
        }
        let path = nact_archive::path_for_volume(adisk_path, volume)?;
        tracing::info!(path = %path.display(), "writing archive volume");
        nact_archive::volume::write_volume_file(&entries, volume, kind, &path)?;
    }

    if !verbs.is_empty() || !objects.is_empty() {
        let ag00 = nact_archive::ag00::Ag00 {
            uk1: config.ag00_uk1,
            uk2: config.ag00_uk2,
            verbs,
            objects,
        };
        let dir = adisk_path.parent().unwrap_or_else(|| Path::new("."));
        nact_archive::ag00::write(&ag00, &dir.join("AG00.DAT"))?;
    }

    if let Some(dbg) = &compiler.dbg {
        let path = PathBuf::from(format!("{}.symbols", adisk_path.display()));
        let mut file = fs::File::create(&path).map_err(|e| io_err(&path, e))?;
        dbg.write(&compiler.variables, &mut file).map_err(|e| io_err(&path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nact_core::SysVer;
    use pretty_assertions::assert_eq;

    fn compile_pages(config: Config, sources: &[&str]) -> Vec<PageSco> {
        let names: Vec<String> = (0..sources.len()).map(|i| format!("p{i}.adv")).collect();
        let mut c = Compiler::new(config, names, vec![], &[], &[]).unwrap();
        for (i, src) in sources.iter().enumerate() {
            c.preprocess(src, i).unwrap();
        }
        let mut pages = Vec::new();
        for (i, src) in sources.iter().enumerate() {
            pages.push(c.compile(src, i).unwrap());
        }
        c.finalize(&mut pages).unwrap();
        pages
    }

    fn compile_one(src: &str) -> Vec<u8> {
        compile_pages(Config::default(), &[src]).remove(0).data
    }

    fn compile_err(config: Config, src: &str) -> String {
        let mut c =
            Compiler::new(config, vec!["p0.adv".into()], vec![], &[], &[]).unwrap();
        match c.preprocess(src, 0).and_then(|()| c.compile(src, 0).map(|_| ())) {
            Err(e) => e.to_string(),
            Ok(()) => panic!("expected a compile error"),
        }
    }

    #[test]
    fn number_expression_bytes() {
        // G prend une expression : 5 s'encode 0x45 puis OP_END.
        let data = compile_one("G 5:");
        assert_eq!(&data[2..], &[b'G', 0x45, 0x7f]);
    }

    #[test]
    fn assignment_defines_the_variable() {
        let data = compile_one("!X:0!");
        assert_eq!(&data[2..], &[0x21, 0x80, 0x40, 0x7f, 0x21]);
    }

    #[test]
    fn operator_precedence_in_postfix() {
        let data = compile_one("!A:0!!B:0!G A + B * 2:");
        let g = 2 + 5 + 5;
        assert_eq!(&data[g..], &[b'G', 0x80, 0x81, 0x42, 0x77, 0x79, 0x7f]);
    }

    #[test]
    fn system1_star_is_division() {
        let config = Config { sys_ver: SysVer::System1, ..Config::default() };
        let data = compile_pages(config, &["!A:2*3!"]).remove(0).data;
        assert_eq!(&data[2..], &[0x21, 0x80, 0x42, 0x43, 0x78, 0x7f, 0x21]);

        let config = Config { sys_ver: SysVer::System1, ..Config::default() };
        let err = compile_err(config, "!A:6/2!");
        assert!(err.contains("division is written '*'"), "{err}");
    }

    #[test]
    fn forward_label_reference_is_patched() {
        let data = compile_one("@L:  *L:");
        // '@' en 2, trou en 3-4 patché vers 5, adresse par défaut 5-2=3.
        assert_eq!(data, vec![0x03, 0x00, 0x40, 0x05, 0x00]);
    }

    #[test]
    fn backward_label_reference_is_direct() {
        let data = compile_one("*L: @L:");
        assert_eq!(data, vec![0x03, 0x00, 0x40, 0x02, 0x00]);
    }

    #[test]
    fn hole_chain_patches_every_reference() {
        let data = compile_one("@L: @L: @L: *L:");
        assert_eq!(&data[2..], &[0x40, 11, 0, 0x40, 11, 0, 0x40, 11, 0]);
    }

    #[test]
    fn undefined_label_is_reported_at_first_use() {
        let err = compile_err(Config::default(), "@nowhere:");
        assert!(err.contains("undefined label 'nowhere'"), "{err}");
        assert!(err.contains("line 1"), "{err}");
    }

    #[test]
    fn duplicate_label_is_an_error() {
        let err = compile_err(Config::default(), "*L: *L:");
        assert!(err.contains("label 'L' redefined"), "{err}");
    }

    #[test]
    fn default_label_fills_the_header_slot() {
        let data = compile_one("R *default: R");
        // Le deuxième R est à l'offset 3.
        assert_eq!(&data[..2], &[0x03, 0x00]);
    }

    #[test]
    fn pragma_default_address_wins() {
        let data = compile_one("pragma default_address 0x42: R");
        assert_eq!(&data[..2], &[0x42, 0x00]);
    }

    #[test]
    fn conditional_patches_its_end_hole() {
        let data = compile_one("{1: R }");
        // '{' expr(41 7f) trou(2) 'R' ; fin = 8.
        assert_eq!(&data[2..], &[0x7b, 0x41, 0x7f, 0x08, 0x00, b'R']);
    }

    #[test]
    fn system2_conditional_emits_a_closing_brace() {
        let config = Config { sys_ver: SysVer::System2, ..Config::default() };
        let data = compile_pages(config, &["{1: R }"]).remove(0).data;
        // Trou 16 bits pointant après le '}' émis.
        assert_eq!(&data[2..], &[0x7b, 0x41, 0x7f, 0x09, 0x00, b'R', 0x7d]);
    }

    #[test]
    fn if_keyword_is_sugar_for_conditional() {
        assert_eq!(compile_one("if {1: R }"), compile_one("{1: R }"));
    }

    #[test]
    fn while_loop_bytes() {
        let data = compile_one("<@1: R >");
        // boucle en 2 : '{' 41 7f trou ; 'R' ; '>' back-edge ; fin = 11.
        assert_eq!(&data[2..], &[0x7b, 0x41, 0x7f, 11, 0, b'R', b'>', 0x02, 0x00]);
    }

    #[test]
    fn for_loop_bytes() {
        let data = compile_one("<I, 0, 5, 1, 1: R >");
        assert_eq!(
            &data[2..],
            &[
                0x21, 0x80, 0x40, 0x7f, 0x21, // !I:0!
                b'<', 0x00, // prologue
                b'<', 0x01, 25, 0, // entrée de boucle, trou de fin
                0x80, 0x7f, // copie de la variable
                0x45, 0x7f, // fin
                0x41, 0x7f, // sens
                0x41, 0x7f, // pas
                b'R',
                b'>', 0x09, 0x00, // back-edge vers l'entrée
            ]
        );
    }

    #[test]
    fn constants_resolve_before_their_declaration() {
        let data = compile_one("G C: const word C = 7:");
        assert_eq!(&data[2..], &[b'G', 0x47, 0x7f]);
    }

    #[test]
    fn variables_resolve_before_their_assignment() {
        let data = compile_one("G X: !X:0!");
        assert_eq!(&data[2..5], &[b'G', 0x80, 0x7f]);
    }

    #[test]
    fn constant_cannot_be_assigned() {
        let err = compile_err(Config::default(), "const word C = 5: !C:1!");
        assert!(err.contains("already defined as a constant"), "{err}");
    }

    #[test]
    fn constant_redefinition_is_an_error() {
        let err = compile_err(Config::default(), "const word C = 5, C = 6:");
        assert!(err.contains("constant 'C' redefined"), "{err}");
    }

    #[test]
    fn compound_assignment_is_gated_on_39() {
        let err = compile_err(Config::default(), "!X:0!!X+:1!");
        assert!(err.contains("System 3.9"), "{err}");

        let config = Config { sys_ver: SysVer::System39, ..Config::default() };
        let data = compile_pages(config, &["!X:0!!X+:1!"]).remove(0).data;
        let hdr = 18 + 6 + 2;
        // Non-legacy : pas de '!' fermant ; second opcode réécrit en 0x10.
        assert_eq!(&data[hdr..hdr + 4], &[0x21, 0x80, 0x40, 0x7f]);
        assert_eq!(&data[hdr + 4..hdr + 8], &[0x10, 0x80, 0x41, 0x7f]);
    }

    #[test]
    fn else_chain_jumps_to_a_common_end() {
        let config = Config { sys_ver: SysVer::System35, ..Config::default() };
        let data = compile_pages(config, &["{1: R } else if {2: R } else { R }"]).remove(0).data;
        let hdr = 18 + 6 + 2;
        let code = &data[hdr..];
        // Première condition : '{' 41 7f puis trou 16 bits (adresse absolue).
        assert_eq!(&code[..3], &[0x7b, 0x41, 0x7f]);
        let end1 = u16::from_le_bytes([code[3], code[4]]) as usize;
        // Le trou pointe après le saut de branche.
        assert_eq!(data[end1 - 5], b'@');
        let jump1 = u32::from_le_bytes(data[end1 - 4..end1].try_into().unwrap()) as usize;
        // Et le saut atterrit à la fin de toute la chaîne.
        assert_eq!(jump1, data.len());
        // La deuxième condition commence pile au point de chute du trou.
        assert_eq!(data[end1], 0x7b);
    }

    #[test]
    fn functions_patch_across_pages() {
        let config = Config { sys_ver: SysVer::System35, ..Config::default() };
        let pages = compile_pages(config, &["~setup 9:", "**setup N: R"]);
        let hdr = 18 + 6 + 2;
        let callee_addr = hdr as u32; // '**setup' au tout début de la page 1
        let code = &pages[0].data[hdr..];
        assert_eq!(&code[..4], &[0x21, 0x80, 0x49, 0x7f]); // !N:9 (sans '!')
        assert_eq!(code[4], b'~');
        assert_eq!(u16::from_le_bytes([code[5], code[6]]), 2); // page 1 + 1
        assert_eq!(u32::from_le_bytes(code[7..11].try_into().unwrap()), callee_addr);
    }

    #[test]
    fn funcall_argument_count_is_checked() {
        let config = Config { sys_ver: SysVer::System35, ..Config::default() };
        let names = vec!["p0.adv".to_owned()];
        let mut c = Compiler::new(config, names, vec![], &[], &[]).unwrap();
        let src = "**f A, B: R ~f 1:";
        c.preprocess(src, 0).unwrap();
        let err = c.compile(src, 0).unwrap_err().to_string();
        assert!(err.contains("too few arguments"), "{err}");
    }

    #[test]
    fn funcall_return_and_computed_forms() {
        let config = Config { sys_ver: SysVer::System35, ..Config::default() };
        let pages = compile_pages(config, &["!X:0!~0, 1:~~X+1:"]);
        let hdr = 18 + 6 + 2;
        let code = &pages[0].data[hdr + 4..];
        assert_eq!(&code[..5], &[b'~', 0x00, 0x00, 0x41, 0x7f]);
        assert_eq!(&code[5..], &[b'~', 0xff, 0xff, 0x80, 0x41, 0x79, 0x7f]);
    }

    #[test]
    fn quoted_and_unquoted_messages() {
        let quoted = compile_one("'あい'");
        assert_eq!(&quoted[2..], &[0x27, 0x82, 0xa0, 0x82, 0xa2, 0x27]);

        let config = Config { quoted_strings: false, ..Config::default() };
        let compacted = compile_pages(config, &["'あい'"]).remove(0).data;
        assert_eq!(&compacted[2..], &[0xb1, 0xb2]);
    }

    #[test]
    fn ascii_in_messages_is_policed() {
        let err = compile_err(Config::default(), "'abc'");
        assert!(err.contains("ASCII characters cannot be used here"), "{err}");

        let config = Config { ascii_messages: true, ..Config::default() };
        let data = compile_pages(config, &["'ab'"]).remove(0).data;
        assert_eq!(&data[2..], &[0x27, b'a', b'b', 0x27]);
    }

    #[test]
    fn sjis_codepoint_escape() {
        let data = compile_one("'<0x82A0>'");
        assert_eq!(&data[2..], &[0x27, 0x82, 0xa0, 0x27]);
    }

    #[test]
    fn string_data_is_nul_terminated() {
        let data = compile_one("\"abc\"");
        assert_eq!(&data[2..], &[b'a', b'b', b'c', 0x00]);
    }

    #[test]
    fn string_argument_quoted_or_bare() {
        assert_eq!(&compile_one("M foo:")[2..], &[b'M', b'f', b'o', b'o', b':']);
        assert_eq!(&compile_one("M \"a b\":")[2..], &[b'M', b'a', b' ', b'b', b':']);
    }

    #[test]
    fn argument_arity_is_checked() {
        let err = compile_err(Config::default(), "J 1:");
        assert!(err.contains("too few arguments"), "{err}");
        let err = compile_err(Config::default(), "J 1, 2, 3:");
        assert!(err.contains("too many arguments"), "{err}");
    }

    #[test]
    fn subcommand_comma_is_optional() {
        assert_eq!(compile_one("H 1, 2:"), compile_one("H 1 2:"));
    }

    #[test]
    fn label_call_and_return() {
        let data = compile_one("\\0: \\L: *L:");
        assert_eq!(&data[2..], &[0x5c, 0x00, 0x00, 0x5c, 0x08, 0x00]);
    }

    #[test]
    fn verb_object_resolution_by_name_and_number() {
        let config = Config::default();
        let verbs = vec!["look".to_owned(), "take".to_owned()];
        let objects = vec!["door".to_owned()];
        let mut c = Compiler::new(config, vec!["p0.adv".into()], vec![], &verbs, &objects)
            .unwrap();
        let src = "[L, take, door: *L:";
        c.preprocess(src, 0).unwrap();
        let data = c.compile(src, 0).unwrap().data;
        // '[' verbe=1 objet=0 label=7.
        assert_eq!(&data[2..], &[b'[', 0x01, 0x00, 0x07, 0x00]);

        let src = "[L, 1, 0: *L:";
        let mut c2 = Compiler::new(Config::default(), vec!["p0.adv".into()], vec![], &[], &[])
            .unwrap();
        c2.preprocess(src, 0).unwrap();
        assert_eq!(c2.compile(src, 0).unwrap().data[2..], data[2..]);
    }

    #[test]
    fn unknown_verb_is_an_error() {
        let err = compile_err(Config::default(), "[L, push, 0: *L:");
        assert!(err.contains("unknown verb 'push'"), "{err}");
    }

    #[test]
    fn menu_item_with_inline_text() {
        let data = compile_one("$L$あ$ *L:");
        assert_eq!(&data[2..], &[b'$', 0x08, 0x00, 0x82, 0xa0, b'$']);
    }

    #[test]
    fn menu_item_with_ascii_body_toggles() {
        let data = compile_one("$L$R$ *L:");
        // Le corps ASCII est compilé comme des commandes ('R'), puis le
        // second '$' referme l'item.
        assert_eq!(&data[2..], &[b'$', 0x07, 0x00, b'R', b'$']);
    }

    #[test]
    fn unfinished_menu_item_is_an_error() {
        let err = compile_err(Config::default(), "$L$R *L:");
        assert!(err.contains("unfinished menu item"), "{err}");
    }

    #[test]
    fn pragma_ald_volume_sets_page_volume() {
        let config = Config::default();
        let names = vec!["p0.adv".to_owned()];
        let mut c = Compiler::new(config, names, vec![], &[], &[]).unwrap();
        let src = "pragma ald_volume 2: R";
        c.preprocess(src, 0).unwrap();
        assert_eq!(c.compile(src, 0).unwrap().volume_bits, 1 << 2);
    }

    #[test]
    fn pragma_dri_volume_sets_a_mask() {
        let config = Config { sys_ver: SysVer::System36, ..Config::default() };
        let names = vec!["p0.adv".to_owned()];
        let mut c = Compiler::new(config, names, vec![], &[], &[]).unwrap();
        let src = "pragma dri_volume BC: R";
        c.preprocess(src, 0).unwrap();
        assert_eq!(c.compile(src, 0).unwrap().volume_bits, 0b110 << 1);
    }

    #[test]
    fn pragma_volume_out_of_range() {
        let err = compile_err(Config::default(), "pragma ald_volume 27: R");
        assert!(err.contains("out of range"), "{err}");
    }

    #[test]
    fn pragma_address_repositions_the_cursor() {
        let data = compile_one("R pragma address 0x10: R");
        assert_eq!(data.len(), 0x11);
        assert_eq!(data[0x10], b'R');
        assert_eq!(data[2], b'R');
        assert!(data[3..0x10].iter().all(|&b| b == 0));
    }

    #[test]
    fn unknown_pragma_is_an_error() {
        let err = compile_err(Config::default(), "pragma whatever 1:");
        assert!(err.contains("unknown pragma"), "{err}");
    }

    #[test]
    fn unknown_command_is_located() {
        let err = compile_err(Config::default(), "R\n  ?");
        assert!(err.contains("Unknown command ?"), "{err}");
        assert!(err.contains("line 2 column 3"), "{err}");
    }

    #[test]
    fn two_uppercase_letters_are_rejected() {
        let err = compile_err(Config::default(), "QQ 1:");
        assert!(err.contains("Unknown command QQ"), "{err}");
    }

    #[test]
    fn page_reference_in_expression() {
        let config = Config::default();
        let names = vec!["p0.adv".to_owned(), "menu.adv".to_owned()];
        let mut c = Compiler::new(config, names, vec![], &[], &[]).unwrap();
        let src = "&#menu.adv:";
        c.preprocess(src, 0).unwrap();
        let data = c.compile(src, 0).unwrap().data;
        assert_eq!(&data[2..], &[b'&', 0x41, 0x7f]);
    }

    #[test]
    fn unicode_mode_injects_zu_on_page_zero() {
        let config = Config { unicode: true, ..Config::default() };
        let pages = compile_pages(config, &["R", "R"]);
        assert_eq!(&pages[0].data[2..6], &[b'Z', b'U', 0x41, 0x7f]);
        assert_eq!(&pages[1].data[2..], &[b'R']);
    }

    #[test]
    fn unicode_mode_emits_utf8_messages() {
        let config = Config { unicode: true, ..Config::default() };
        let data = compile_pages(config, &["R'あ'"]).remove(0).data;
        assert_eq!(&data[6..], &[b'R', 0x27, 0xe3, 0x81, 0x82, 0x27]);
    }

    #[test]
    fn array_reference_as_target_and_operand() {
        let config = Config { sys_ver: SysVer::System35, ..Config::default() };
        let pages = compile_pages(config, &["!T:0!!T[2]:T[1]+1!"]);
        let hdr = 18 + 6 + 2;
        let code = &pages[0].data[hdr + 4..];
        assert_eq!(
            code,
            &[
                0x21, 0xc0, 0x01, 0x00, 0x00, 0x42, 0x7f, // !T[2]
                0xc0, 0x01, 0x00, 0x00, 0x41, 0x7f, // T[1]
                0x41, 0x79, 0x7f, // + 1, fin
            ]
        );
    }

    #[test]
    fn page_size_limit_for_legacy_dialects() {
        let big = format!("\"{}\"", "a".repeat(0x10010));
        let err = compile_err(Config::default(), &big);
        assert!(err.contains("page size exceeds"), "{err}");
    }

    #[test]
    fn build_writes_archive_and_companions() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("start.adv");
        fs::write(&src, "!RND:0!\nR\n").unwrap();
        let verbs = dir.path().join("verbs.txt");
        fs::write(&verbs, "look\ntake\n").unwrap();
        let objs = dir.path().join("objects.txt");
        fs::write(&objs, "door\n").unwrap();

        let config = Config {
            verb_list: Some(verbs),
            obj_list: Some(objs),
            debug: true,
            ..Config::default()
        };
        let adisk = dir.path().join("ADISK.DAT");
        build(&config, &[src], &adisk).unwrap();

        assert!(adisk.exists());
        assert!(dir.path().join("AG00.DAT").exists());
        assert!(dir.path().join("ADISK.DAT.symbols").exists());

        let mut entries = Vec::new();
        nact_archive::read_volume(&mut entries, &adisk).unwrap();
        let entry = entries[0].as_ref().unwrap();
        assert_eq!(entry.id, 1);
        // !RND:0! R : l'adresse par défaut pointe fin-2.
        assert_eq!(&entry.data[2..10], &[0x21, 0x80, 0x40, 0x7f, 0x21, b'R', 0, 0]);
    }

    #[test]
    fn source_encoding_errors_are_located() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("bad.adv");
        fs::write(&src, [b'R', b'\n', 0xff, 0xfe]).unwrap();
        let err = read_source(&src, true).unwrap_err().to_string();
        assert!(err.contains("Invalid UTF-8 character"), "{err}");
        assert!(err.contains("line 2"), "{err}");
    }
}
