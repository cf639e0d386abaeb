//! nact-decompiler — des archives de scénarios vers le DSL.
//!
//! Deux phases pilotées par les tableaux de marques : une analyse à point
//! fixe (liste de pages sales) qui classe chaque octet et découvre labels,
//! structures de contrôle et fonctions, puis une passe d'émission qui
//! réécrit le texte source et les fichiers de projet (config, `.hed`,
//! listes de variables et de verbes/objets).

#![deny(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use nact_core::{text, SysVer};

/// Marche analyse/émission.
pub mod decompile;
/// Pré-analyse des tables de données.
pub mod preprocess;
/// Pages et marques.
pub mod sco;

pub use decompile::Decompiler;
use sco::Sco;

/// Alias résultat du crate.
pub type Result<T> = std::result::Result<T, DcError>;

/// Erreurs du décompilateur.
#[derive(Debug, Error)]
pub enum DcError {
    /// Erreur localisée dans une page.
    #[error("{name}:{addr:x}: {msg}")]
    At {
        /// Nom interne de la page.
        name: String,
        /// Adresse de l'octet fautif.
        addr: usize,
        /// Détail.
        msg: String,
    },
    /// En-tête SCO inexploitable.
    #[error("{name}: unexpected file size in SCO header (page {page})")]
    BadHeader {
        /// Nom interne de la page.
        name: String,
        /// Index de page.
        page: usize,
    },
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

fn io_err(path: &Path, source: std::io::Error) -> DcError {
    DcError::Io { path: path.to_owned(), source }
}

/// Options d'une décompilation.
#[derive(Debug, Clone)]
pub struct DcConfig {
    /// Dialecte des pages sans en-tête SCO.
    pub sys_ver: SysVer,
    /// Préfixer chaque ligne de l'adresse.
    pub address: bool,
    /// Sorties en UTF-8 (sinon CP932).
    pub utf8_output: bool,
    /// Ne pas reconstruire les else.
    pub disable_else: bool,
    /// Ancienne variante de la commande SR (recopiée dans la config).
    pub old_sr: bool,
}

impl Default for DcConfig {
    fn default() -> Self {
        Self {
            sys_ver: SysVer::DEFAULT,
            address: false,
            utf8_output: true,
            disable_else: false,
            old_sr: false,
        }
    }
}

/// Résultat d'une décompilation en mémoire : le texte de chaque page (dans
/// l'encodage de sortie) et les fichiers de projet.
#[derive(Debug, Default)]
pub struct Project {
    /// (nom de fichier, contenu) par page.
    pub sources: Vec<(String, Vec<u8>)>,
    /// Contenu du fichier de configuration.
    pub config: String,
    /// Contenu du `.hed`.
    pub hed: String,
    /// Contenu de `variables.txt`.
    pub variables: String,
    /// Listes de verbes/objets si une table AG00 a été lue.
    pub names: Option<(String, String)>,
}

fn volume_letters(bits: u32) -> String {
    (1..=nact_archive::volume::MAX_VOLUME)
        .filter(|v| bits & 1 << v != 0)
        .map(|v| (b'A' + v as u8 - 1) as char)
        .collect()
}

fn missing_adv_name(page: usize) -> String {
    format!("_missing{page}.adv")
}

/// Décompile une séquence d'entrées d'archive en projet complet.
pub fn decompile(
    entries: Vec<Option<nact_archive::Entry>>,
    config: &DcConfig,
    adisk_name: Option<&str>,
    ag00: Option<&nact_archive::ag00::Ag00>,
) -> Result<Project> {
    let mut scos: Vec<Option<Sco>> = Vec::with_capacity(entries.len());
    for (page, entry) in entries.into_iter().enumerate() {
        scos.push(match entry {
            Some(e) => Some(Sco::new(page, e.data, e.volume_bits, config.sys_ver)?),
            None => None,
        });
    }

    // SCO Unicode : marqué par la commande "ZU 1:" en tête de page 0.
    let utf8_input = scos
        .first()
        .and_then(Option::as_ref)
        .is_some_and(|s| s.data[s.hdr_size..].starts_with(b"ZU\x41\x7f"));
    if utf8_input && !config.utf8_output {
        return Err(DcError::Msg("Unicode game data cannot be decompiled with -Es.".into()));
    }

    preprocess::preprocess(&mut scos);

    let mut dc = Decompiler::new(scos);
    dc.utf8_input = utf8_input;
    dc.utf8_output = config.utf8_output;
    dc.address_prefix = config.address;
    dc.disable_else = config.disable_else;
    dc.old_sr = config.old_sr;

    // Analyse à point fixe : on rejoue chaque page salie jusqu'à ce qu'une
    // passe complète ne change plus rien.
    loop {
        let mut progressed = false;
        for page in 0..dc.scos.len() {
            let dirty = dc.scos[page].as_ref().is_some_and(|s| !s.analyzed);
            if !dirty {
                continue;
            }
            tracing::info!(page, "analyzing");
            progressed = true;
            dc.scos[page].as_mut().expect("checked").analyzed = true;
            dc.decompile_page(page, None)?;
        }
        if !progressed {
            break;
        }
    }

    // Émission.
    let mut project = Project::default();
    let mut cfg_sys_ver = config.sys_ver;
    for page in 0..dc.scos.len() {
        if dc.scos[page].is_none() {
            let body = dc.missing_page_source(page);
            project.sources.push((missing_adv_name(page), body));
            continue;
        }
        let sco = dc.scos[page].as_ref().expect("checked above");
        tracing::info!(page, name = %sco.src_name, "decompiling");
        cfg_sys_ver = sco.sys_ver;
        let mut head = Vec::new();
        match sco.sys_ver.archive_kind() {
            nact_core::ArchiveKind::Ald => {
                let home = sco.volume_bits.trailing_zeros();
                if sco.volume_bits == 0 {
                    head.extend_from_slice(b"pragma ald_volume 0:\n");
                } else if home != 1 {
                    head.extend_from_slice(format!("pragma ald_volume {home}:\n").as_bytes());
                }
            }
            nact_core::ArchiveKind::Dri => {
                if sco.volume_bits != 1 << 1 {
                    head.extend_from_slice(
                        format!("pragma dri_volume {}:\n", volume_letters(sco.volume_bits))
                            .as_bytes(),
                    );
                }
            }
        }
        let name = sco.src_name.clone();
        let body = dc.decompile_page(page, Some(head))?.expect("emission requested");
        // Le texte émis est dans l'encodage du bytecode ; conversion unique
        // en sortie, comme pour les fichiers annexes.
        let body = if !utf8_input && config.utf8_output {
            text::to_utf8_sub(&body).into_bytes()
        } else {
            body
        };
        project.sources.push((name, body));
    }

    // Fichiers de projet.
    let hed_name = "nactdc.hed";
    let mut cfg = String::new();
    if let Some(adisk) = adisk_name {
        cfg.push_str(&format!("adisk_name = {adisk}\n"));
    }
    cfg.push_str(&format!("sys_ver = {cfg_sys_ver}\n"));
    cfg.push_str(&format!("hed = {hed_name}\n"));
    cfg.push_str("variables = variables.txt\n");
    if ag00.is_some() {
        cfg.push_str("verbs = verbs.txt\nobjects = objects.txt\n");
    }
    if dc.disable_else {
        cfg.push_str("disable_else = true\n");
    }
    if dc.old_sr {
        cfg.push_str("old_SR = true\n");
    }
    if dc.saw_bare_messages {
        cfg.push_str("quoted_strings = false\n");
    }
    if dc.saw_ascii_messages {
        cfg.push_str("ascii_messages = true\n");
    }
    cfg.push_str(&format!("encoding = {}\n", if config.utf8_output { "utf8" } else { "sjis" }));
    if utf8_input {
        cfg.push_str("unicode = true\n");
    }
    project.config = cfg;

    let mut hed = String::from("#SYSTEM35\n");
    for (page, sco) in dc.scos.iter().enumerate() {
        match sco {
            Some(s) => hed.push_str(&s.src_name),
            None => hed.push_str(&missing_adv_name(page)),
        }
        hed.push('\n');
    }
    project.hed = hed;

    let mut vars = String::new();
    for v in &dc.variables {
        vars.push_str(v.as_deref().unwrap_or(""));
        vars.push('\n');
    }
    project.variables = vars;

    if let Some(ag00) = ag00 {
        let list = |names: &[String]| {
            let mut s = String::new();
            for n in names {
                s.push_str(n);
                s.push('\n');
            }
            s
        };
        project.names = Some((list(&ag00.verbs), list(&ag00.objects)));
    }

    Ok(project)
}

/// Écrit un [`Project`] dans `outdir`, en transcodant si nécessaire.
pub fn write_project(project: &Project, outdir: &Path, utf8_output: bool) -> Result<()> {
    fs::create_dir_all(outdir).map_err(|e| io_err(outdir, e))?;
    let encode = |s: &str| -> Vec<u8> {
        if utf8_output {
            s.as_bytes().to_vec()
        } else {
            text::to_cp932_sub(s, '?')
        }
    };
    for (name, body) in &project.sources {
        let path = outdir.join(name);
        fs::write(&path, body).map_err(|e| io_err(&path, e))?;
    }
    let path = outdir.join("nact.cfg");
    fs::write(&path, project.config.as_bytes()).map_err(|e| io_err(&path, e))?;
    let path = outdir.join("nactdc.hed");
    fs::write(&path, encode(&project.hed)).map_err(|e| io_err(&path, e))?;
    let path = outdir.join("variables.txt");
    fs::write(&path, encode(&project.variables)).map_err(|e| io_err(&path, e))?;
    if let Some((verbs, objects)) = &project.names {
        let path = outdir.join("verbs.txt");
        fs::write(&path, encode(verbs)).map_err(|e| io_err(&path, e))?;
        let path = outdir.join("objects.txt");
        fs::write(&path, encode(objects)).map_err(|e| io_err(&path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nact_archive::Entry;
    use nact_compiler::{Compiler, Config};
    use pretty_assertions::assert_eq;

    fn compile_pages(config: Config, names: &[&str], sources: &[&str]) -> Vec<Vec<u8>> {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let mut c = Compiler::new(config, names, vec![], &[], &[]).unwrap();
        for (i, src) in sources.iter().enumerate() {
            c.preprocess(src, i).unwrap();
        }
        let mut pages = Vec::new();
        for (i, src) in sources.iter().enumerate() {
            pages.push(c.compile(src, i).unwrap());
        }
        c.finalize(&mut pages).unwrap();
        pages.into_iter().map(|p| p.data).collect()
    }

    fn entries_of(pages: &[Vec<u8>]) -> Vec<Option<Entry>> {
        pages
            .iter()
            .enumerate()
            .map(|(i, data)| {
                Some(Entry { id: i as u32 + 1, data: data.clone(), volume_bits: 1 << 1 })
            })
            .collect()
    }

    fn page_text(project: &Project, page: usize) -> String {
        String::from_utf8(project.sources[page].1.clone()).unwrap()
    }

    // Décompile puis recompile : les octets doivent être identiques.
    fn assert_roundtrip(config: Config, sources: &[&str]) {
        let names: Vec<String> = (0..sources.len()).map(|i| format!("{i}.adv")).collect();
        let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let pages = compile_pages(config.clone(), &name_refs, sources);

        let dc_config = DcConfig { sys_ver: config.sys_ver, ..DcConfig::default() };
        let project = decompile(entries_of(&pages), &dc_config, None, None).unwrap();

        let variables: Vec<String> =
            project.variables.lines().map(str::to_owned).collect();
        let texts: Vec<String> = (0..sources.len()).map(|i| page_text(&project, i)).collect();
        let text_refs: Vec<&str> = texts.iter().map(String::as_str).collect();

        let mut rc = Compiler::new(
            Config { var_list: None, ..config },
            names.clone(),
            variables,
            &[],
            &[],
        )
        .unwrap();
        for (i, src) in text_refs.iter().enumerate() {
            if let Err(e) = rc.preprocess(src, i) {
                panic!("recompile (preprocess) failed: {e}\nsource:\n{src}");
            }
        }
        let mut back = Vec::new();
        for (i, src) in text_refs.iter().enumerate() {
            match rc.compile(src, i) {
                Ok(p) => back.push(p),
                Err(e) => panic!("recompile failed: {e}\nsource:\n{src}"),
            }
        }
        rc.finalize(&mut back).unwrap();
        for (i, page) in back.iter().enumerate() {
            assert_eq!(page.data, pages[i], "page {i} bytes differ\nsource:\n{}", texts[i]);
        }
    }

    #[test]
    fn roundtrips_control_flow_and_messages() {
        let config = Config { quoted_strings: false, ..Config::default() };
        assert_roundtrip(
            config,
            &["!X:0!{X = 0:A}<@X < 5:!X:X + 1!>@L1:G X + 2 * 3:*L1:'あい'R"],
        );
    }

    #[test]
    fn roundtrips_for_loop_and_call() {
        let config = Config { quoted_strings: false, ..Config::default() };
        assert_roundtrip(config, &["<I, 0, 5, 1, 1:A>\\0:\\L2:*L2:R"]);
    }

    #[test]
    fn roundtrips_verb_obj_and_data() {
        let config = Config { quoted_strings: false, ..Config::default() };
        assert_roundtrip(config, &["[L3, 2, 1:*L3::1, L3, 3, 4:\"str\"R"]);
    }

    #[test]
    fn roundtrips_across_pages() {
        let config = Config { quoted_strings: false, ..Config::default() };
        assert_roundtrip(config, &["&#1.adv:R", "!Y:7!R"]);
    }

    #[test]
    fn roundtrips_system35_functions_and_else() {
        let config = Config {
            sys_ver: SysVer::System35,
            quoted_strings: true,
            ..Config::default()
        };
        assert_roundtrip(
            config,
            &[
                "!X:0!~setup 1, 2:~setup 3, 4:{X = 1:A} else if {X = 2:R} else {A}R",
                "**setup A1, B1:!Z:A1 + B1!\\0:",
            ],
        );
    }

    #[test]
    fn reconstructs_if_else_without_raw_jumps() {
        let config = Config { sys_ver: SysVer::System35, ..Config::default() };
        let pages = compile_pages(config, &["0.adv"], &["!X:0!{X = 1:A} else {R}R"]);
        let project =
            decompile(entries_of(&pages), &DcConfig::default(), None, None).unwrap();
        let text = page_text(&project, 0);
        assert!(text.contains("} else {"), "{text}");
        assert!(!text.contains("@L_"), "{text}");
    }

    #[test]
    fn reconstructs_loops() {
        let config = Config { quoted_strings: false, ..Config::default() };
        let pages =
            compile_pages(config, &["0.adv"], &["!X:0!<@X < 3:!X:X + 1!><I, 0, 5, 1, 1:A>R"]);
        let project =
            decompile(entries_of(&pages), &DcConfig::default(), None, None).unwrap();
        let text = page_text(&project, 0);
        assert!(text.contains("<@VAR0 < 3:"), "{text}");
        assert!(text.contains("<VAR1, 0, 5, 1, 1:"), "{text}");
    }

    #[test]
    fn infers_function_parameters() {
        let config = Config { sys_ver: SysVer::System35, ..Config::default() };
        let pages = compile_pages(
            config,
            &["0.adv", "1.adv"],
            &["~setup 1, 2:~setup 3, 4:R", "**setup P, Q:R"],
        );
        let project =
            decompile(entries_of(&pages), &DcConfig::default(), None, None).unwrap();
        let caller = page_text(&project, 0);
        let callee = page_text(&project, 1);
        // La page 1 commence à 0x19 (en-tête SCO compris).
        assert!(caller.contains("~1_19 1, 2:"), "{caller}");
        assert!(caller.contains("~1_19 3, 4:"), "{caller}");
        assert!(callee.contains("**1_19 VAR0, VAR1:"), "{callee}");
    }

    #[test]
    fn neighbouring_functions_keep_separate_params() {
        let config = Config { sys_ver: SysVer::System35, ..Config::default() };
        let pages = compile_pages(
            config,
            &["0.adv", "1.adv"],
            &["~f 1, 2:A~g 9:R", "**f P, Q:R**g Q:\\0:"],
        );
        let project =
            decompile(entries_of(&pages), &DcConfig::default(), None, None).unwrap();
        let caller = page_text(&project, 0);
        assert!(caller.contains("~1_19 1, 2:"), "{caller}");
        assert!(caller.contains("~1_1a 9:"), "{caller}");
    }

    #[test]
    fn unknown_lead_bytes_become_data() {
        // Une page fabriquée : un octet de commande inconnu (0x01 0x02).
        let data = vec![0x05, 0x00, b'R', 0x01, 0x02];
        let entries = vec![Some(Entry { id: 1, data, volume_bits: 1 << 1 })];
        let project = decompile(entries, &DcConfig::default(), None, None).unwrap();
        let text = page_text(&project, 0);
        assert!(text.contains("[513]"), "{text}");
    }

    #[test]
    fn string_data_blocks_are_quoted() {
        let config = Config { quoted_strings: false, ..Config::default() };
        let pages = compile_pages(config, &["0.adv"], &["R\"hi\"R"]);
        let project =
            decompile(entries_of(&pages), &DcConfig::default(), None, None).unwrap();
        let text = page_text(&project, 0);
        assert!(text.contains("\"hi\""), "{text}");
    }

    #[test]
    fn missing_pages_get_stub_sources() {
        let config = Config { quoted_strings: false, ..Config::default() };
        let pages = compile_pages(config, &["0.adv"], &["R"]);
        let mut entries = entries_of(&pages);
        entries.push(None);
        let project =
            decompile(entries, &DcConfig::default(), None, None).unwrap();
        assert_eq!(project.sources[1].0, "_missing1.adv");
        let stub = page_text(&project, 1);
        assert!(stub.contains("pragma ald_volume 0:"), "{stub}");
        assert!(project.hed.contains("_missing1.adv"), "{}", project.hed);
    }

    #[test]
    fn project_config_reflects_discoveries() {
        let config = Config { quoted_strings: false, ..Config::default() };
        let pages = compile_pages(config, &["0.adv"], &["'あ'R"]);
        let project = decompile(
            entries_of(&pages),
            &DcConfig::default(),
            Some("ADISK.DAT"),
            None,
        )
        .unwrap();
        assert!(project.config.contains("adisk_name = ADISK.DAT"), "{}", project.config);
        assert!(project.config.contains("sys_ver = 3"), "{}", project.config);
        assert!(project.config.contains("quoted_strings = false"), "{}", project.config);
        assert!(project.config.contains("encoding = utf8"), "{}", project.config);
    }

    #[test]
    fn unicode_pages_require_utf8_output() {
        let config = Config { unicode: true, ..Config::default() };
        let pages = compile_pages(config, &["0.adv"], &["R"]);
        let bad = DcConfig { utf8_output: false, ..DcConfig::default() };
        assert!(decompile(entries_of(&pages), &bad, None, None).is_err());
    }

    #[test]
    fn writes_project_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config { quoted_strings: false, ..Config::default() };
        let pages = compile_pages(config, &["0.adv"], &["'あ'R"]);
        let dc_config = DcConfig::default();
        let project = decompile(entries_of(&pages), &dc_config, None, None).unwrap();
        write_project(&project, dir.path(), true).unwrap();
        let text = fs::read_to_string(dir.path().join("0.adv")).unwrap();
        assert!(text.contains('あ'), "{text}");
        assert!(dir.path().join("nact.cfg").exists());
        assert!(dir.path().join("variables.txt").exists());
    }
}
