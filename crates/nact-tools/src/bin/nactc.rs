// crates/nact-tools/src/bin/nactc.rs
//! Compilateur nact : sources .adv -> archives de volumes.
//! Usage basique :
//!   nactc -p projet.cfg
//!   nactc -i sources.hed -o ADISK.DAT
//!   nactc -s 2 -Es page0.adv page1.adv
//! Sans argument, `nact.cfg` est lu s'il existe.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;

use nact_compiler::{config, Config};

#[derive(Parser, Debug)]
#[command(
    name = "nactc",
    about = "Compilateur de scénarios NACT (.adv -> archives ALD/DRI)",
    disable_version_flag = true
)]
struct Cli {
    /// Fichier(s) source, ajoutés après ceux du .hed
    sources: Vec<Utf8PathBuf>,

    /// Archive de sortie (volume A ; les suivants en dérivent)
    #[arg(short = 'o', long = "output")]
    output: Option<Utf8PathBuf>,

    /// Générer les symboles de debug
    #[arg(short = 'g', long = "debug")]
    debug: bool,

    /// Identité de jeu
    #[arg(short = 'G', long = "game")]
    game: Option<String>,

    /// Encodage des sources : -Es (CP932) ou -Eu (UTF-8, défaut)
    #[arg(short = 'E', long = "encoding")]
    encoding: Option<String>,

    /// Fichier d'en-tête listant les pages
    #[arg(short = 'i', long = "hed")]
    hed: Option<Utf8PathBuf>,

    /// Fichier de configuration du projet
    #[arg(short = 'p', long = "project")]
    project: Option<Utf8PathBuf>,

    /// Version du système cible (1|2|3|3.5|3.6|3.8|3.9)
    #[arg(short = 's', long = "sys-ver")]
    sys_ver: Option<String>,

    /// Bytecode Unicode (runtimes le supportant)
    #[arg(short = 'u', long = "unicode")]
    unicode: bool,

    /// Liste de variables pré-déclarées
    #[arg(short = 'V', long = "variables")]
    variables: Option<Utf8PathBuf>,

    /// Afficher la version et sortir
    #[arg(short = 'v', long = "version")]
    version: bool,
}

fn main() -> ExitCode {
    nact_tools::init_tracing(false);
    match real_main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn real_main() -> Result<()> {
    let cli = Cli::parse();
    if cli.version {
        println!("nactc {}", nact_tools::VERSION);
        return Ok(());
    }

    let mut cfg = Config::default();

    if let Some(project) = &cli.project {
        cfg.load(project.as_std_path())?;
    } else if cli.hed.is_none() && cli.sources.is_empty() {
        let fallback = PathBuf::from("nact.cfg");
        if !fallback.exists() {
            return Err(anyhow!(
                "no sources given and no nact.cfg found; see nactc --help"
            ));
        }
        cfg.load(&fallback)?;
    }

    // La ligne de commande prime sur le projet.
    if let Some(game) = &cli.game {
        let info = nact_tools::parse_game(game)?;
        cfg.game = Some(info);
        cfg.sys_ver = info.sys_ver;
    }
    if let Some(ver) = &cli.sys_ver {
        cfg.sys_ver = nact_tools::parse_sys_ver(ver)?;
    }
    if let Some(encoding) = &cli.encoding {
        cfg.utf8 = nact_tools::parse_encoding(encoding)?;
    }
    if cli.unicode {
        cfg.unicode = true;
    }
    if cli.debug {
        cfg.debug = true;
    }
    if let Some(vars) = &cli.variables {
        cfg.var_list = Some(vars.as_std_path().to_owned());
    }

    let hed = cli.hed.as_ref().map(|p| p.as_std_path().to_owned()).or_else(|| cfg.hed.clone());
    let mut sources: Vec<PathBuf> = Vec::new();
    if let Some(hed) = &hed {
        let text = nact_compiler::read_source(hed, cfg.utf8)?;
        sources.extend(config::read_hed(hed, &text)?);
    }
    sources.extend(cli.sources.iter().map(|p| p.as_std_path().to_owned()));
    if sources.is_empty() {
        return Err(anyhow!("No source file specified."));
    }

    let adisk = cli
        .output
        .as_ref()
        .map(|p| p.as_std_path().to_owned())
        .or_else(|| cfg.adisk_name.clone())
        .unwrap_or_else(|| {
            let dir = cli
                .project
                .as_ref()
                .and_then(|p| p.parent())
                .map(|p| p.as_std_path().to_owned())
                .unwrap_or_default();
            dir.join("ADISK.DAT")
        });

    tracing::info!(archive = %adisk.display(), pages = sources.len(), "compiling");
    nact_compiler::build(&cfg, &sources, &adisk)
        .with_context(|| format!("compiling to {}", adisk.display()))?;
    Ok(())
}
