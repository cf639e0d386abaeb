//! Configuration de projet et fichier d'en-tête `.hed`.
//!
//! Le fichier projet est du `clé = valeur` ligne à ligne ; les chemins y
//! sont relatifs au répertoire du fichier. Le `.hed` liste les sources de
//! pages sous une section `#SYSTEM35`, avec commentaires `;` et fin de
//! fichier DOS 0x1A.

use std::path::{Path, PathBuf};

use nact_core::{game, SysVer};

use crate::{CompileError, Result};

/// Options d'une unité de compilation / décompilation.
#[derive(Debug, Clone)]
pub struct Config {
    /// Dialecte cible.
    pub sys_ver: SysVer,
    /// Identité de jeu (affine les tables de commandes).
    pub game: Option<&'static game::GameInfo>,
    /// Fichier `.hed` listant les pages.
    pub hed: Option<PathBuf>,
    /// Liste de variables pré-déclarées.
    pub var_list: Option<PathBuf>,
    /// Liste de noms de verbes.
    pub verb_list: Option<PathBuf>,
    /// Liste de noms d'objets.
    pub obj_list: Option<PathBuf>,
    /// Nom de l'archive A en sortie.
    pub adisk_name: Option<PathBuf>,
    /// Répertoire de sortie du décompilateur.
    pub outdir: Option<PathBuf>,
    /// Sources en UTF-8 (sinon CP932).
    pub utf8: bool,
    /// Bytecode en UTF-8 (runtime Unicode).
    pub unicode: bool,
    /// Générer les symboles de debug.
    pub debug: bool,
    /// Messages entre quotes dans le bytecode.
    pub quoted_strings: bool,
    /// Marqueur de révision dans les symboles de debug.
    pub rev_marker: bool,
    /// Compatibilité bug-à-bug de l'encodeur de nombres.
    pub sys0dc_offby1_error: bool,
    /// Autoriser l'ASCII dans les messages.
    pub ascii_messages: bool,
    /// Ne pas reconstruire les else à la décompilation.
    pub disable_else: bool,
    /// Ancienne variante de la commande SR.
    pub old_sr: bool,
    /// Premier champ inconnu de AG00.
    pub ag00_uk1: u32,
    /// Second champ inconnu de AG00.
    pub ag00_uk2: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sys_ver: SysVer::DEFAULT,
            game: None,
            hed: None,
            var_list: None,
            verb_list: None,
            obj_list: None,
            adisk_name: None,
            outdir: None,
            utf8: true,
            unicode: false,
            debug: false,
            quoted_strings: true,
            rev_marker: false,
            sys0dc_offby1_error: false,
            ascii_messages: false,
            disable_else: false,
            old_sr: false,
            ag00_uk1: 0,
            ag00_uk2: 0,
        }
    }
}

fn to_bool(val: &str) -> Result<bool> {
    if ["yes", "true", "on", "1"].iter().any(|s| val.eq_ignore_ascii_case(s)) {
        Ok(true)
    } else if ["no", "false", "off", "0"].iter().any(|s| val.eq_ignore_ascii_case(s)) {
        Ok(false)
    } else {
        Err(CompileError::Msg(format!("Invalid boolean value '{val}'")))
    }
}

fn join(dir: Option<&Path>, value: &str) -> PathBuf {
    match dir {
        Some(dir) if !Path::new(value).is_absolute() => dir.join(value),
        _ => PathBuf::from(value),
    }
}

impl Config {
    /// Charge un fichier projet `clé = valeur`. Les clés inconnues sont
    /// ignorées avec un avertissement.
    pub fn load(&mut self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .map_err(|e| CompileError::Msg(format!("{}: {e}", path.display())))?;
        let text = String::from_utf8_lossy(&bytes);
        let dir = path.parent();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            let Some((key, val)) = line.split_once('=') else {
                continue;
            };
            let (key, val) = (key.trim(), val.trim());
            match key {
                "sys_ver" => {
                    self.sys_ver = SysVer::from_opt(val).ok_or_else(|| {
                        CompileError::Msg(format!("Unknown system version '{val}'"))
                    })?;
                }
                "game" => {
                    let info = game::by_name(val)
                        .ok_or_else(|| CompileError::Msg(format!("Unknown game '{val}'")))?;
                    self.sys_ver = info.sys_ver;
                    self.game = Some(info);
                }
                "encoding" => {
                    self.utf8 = match val.to_ascii_lowercase().as_str() {
                        "utf8" => true,
                        "sjis" => false,
                        _ => return Err(CompileError::Msg(format!("Unknown encoding {val}"))),
                    };
                }
                "hed" => self.hed = Some(join(dir, val)),
                "variables" => self.var_list = Some(join(dir, val)),
                "verbs" => self.verb_list = Some(join(dir, val)),
                "objects" => self.obj_list = Some(join(dir, val)),
                "adisk_name" => self.adisk_name = Some(join(dir, val)),
                "outdir" => self.outdir = Some(join(dir, val)),
                "unicode" => self.unicode = to_bool(val)?,
                "debug" => self.debug = to_bool(val)?,
                "quoted_strings" => self.quoted_strings = to_bool(val)?,
                "rev_marker" => self.rev_marker = to_bool(val)?,
                "sys0dc_offby1_error" => self.sys0dc_offby1_error = to_bool(val)?,
                "ascii_messages" => self.ascii_messages = to_bool(val)?,
                "disable_else" => self.disable_else = to_bool(val)?,
                "old_SR" => self.old_sr = to_bool(val)?,
                "ag00_uk1" => {
                    self.ag00_uk1 = val
                        .parse()
                        .map_err(|_| CompileError::Msg(format!("Invalid number '{val}'")))?;
                }
                "ag00_uk2" => {
                    self.ag00_uk2 = val
                        .parse()
                        .map_err(|_| CompileError::Msg(format!("Invalid number '{val}'")))?;
                }
                _ => tracing::warn!(key, "unknown configuration key"),
            }
        }
        Ok(())
    }
}

/// Lit un fichier `.hed` : la liste des sources de pages.
pub fn read_hed(path: &Path, contents: &str) -> Result<Vec<PathBuf>> {
    #[derive(PartialEq)]
    enum Section {
        Initial,
        System35,
    }
    let dir = path.parent();
    let mut section = Section::Initial;
    let mut sources = Vec::new();
    for line in contents.lines() {
        if line.starts_with('\x1a') {
            break; // DOS EOF
        }
        if let Some(header) = line.strip_prefix('#') {
            match header.trim_end() {
                "SYSTEM35" => section = Section::System35,
                other => {
                    return Err(CompileError::Msg(format!(
                        "{}: unknown section #{other}",
                        path.display()
                    )))
                }
            }
            continue;
        }
        let line = line.split(';').next().unwrap_or("").trim_end();
        if line.is_empty() {
            continue;
        }
        if section == Section::Initial {
            return Err(CompileError::Msg(format!("{}: syntax error", path.display())));
        }
        sources.push(join(dir, line));
    }
    Ok(sources)
}

/// Découpe un fichier liste (un nom par ligne, lignes vides finales
/// ignorées).
pub fn read_list(contents: &str) -> Vec<String> {
    let mut names: Vec<String> =
        contents.lines().map(|l| l.trim_end().to_owned()).collect();
    while names.last().is_some_and(String::is_empty) {
        names.pop();
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loads_every_recognized_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nact.cfg");
        std::fs::write(
            &path,
            "sys_ver = 3.6\nencoding = sjis\nhed = game.hed\nvariables = vars.txt\n\
             adisk_name = ADISK.DAT\nunicode = false\ndebug = yes\nquoted_strings = off\n\
             sys0dc_offby1_error = 1\nascii_messages = true\ndisable_else = true\n\
             old_SR = on\nag00_uk1 = 3\nag00_uk2 = 7\n",
        )
        .unwrap();
        let mut config = Config::default();
        config.load(&path).unwrap();
        assert_eq!(config.sys_ver, SysVer::System36);
        assert!(!config.utf8);
        assert_eq!(config.hed, Some(dir.path().join("game.hed")));
        assert_eq!(config.adisk_name, Some(dir.path().join("ADISK.DAT")));
        assert!(config.debug);
        assert!(!config.quoted_strings);
        assert!(config.sys0dc_offby1_error);
        assert!(config.ascii_messages);
        assert!(config.disable_else);
        assert!(config.old_sr);
        assert_eq!((config.ag00_uk1, config.ag00_uk2), (3, 7));
    }

    #[test]
    fn game_key_fixes_the_dialect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nact.cfg");
        std::fs::write(&path, "game = rance3\n").unwrap();
        let mut config = Config::default();
        config.load(&path).unwrap();
        assert_eq!(config.sys_ver, SysVer::System2);
        assert!(config.load(&path).is_ok());

        std::fs::write(&path, "game = unknown_thing\n").unwrap();
        assert!(config.load(&path).is_err());
    }

    #[test]
    fn hed_requires_a_section() {
        let path = Path::new("dir/game.hed");
        let ok = read_hed(path, "#SYSTEM35\nstart.adv\n; note\nsecond.adv ; menu\n").unwrap();
        assert_eq!(ok, vec![PathBuf::from("dir/start.adv"), PathBuf::from("dir/second.adv")]);

        assert!(read_hed(path, "start.adv\n").is_err());
        assert!(read_hed(path, "#SYSTEM99\n").is_err());
    }

    #[test]
    fn hed_stops_at_dos_eof() {
        let ok = read_hed(Path::new("g.hed"), "#SYSTEM35\na.adv\n\x1a\nb.adv\n").unwrap();
        assert_eq!(ok, vec![PathBuf::from("a.adv")]);
    }

    #[test]
    fn list_strips_trailing_blank_lines() {
        assert_eq!(read_list("RND\nX\n\n\n"), vec!["RND".to_owned(), "X".to_owned()]);
    }
}
