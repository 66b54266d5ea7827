//! Opal middle-end CLI
//!
//! Operates on textual IR modules: run the optimization pipeline over a
//! file, validate it, or pretty-print it. The front-end drives the library
//! directly; this binary exists for debugging and for the test fixtures.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{generate, Shell};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

use opalc::config::Config;
use opalc::passes::PassRunner;
use opalc::ssa::parser::parse_module;
use opalc::ssa::validator::Validator;
use opalc::ssa::writer::write_module;
use opalc::target::Target;

#[derive(ClapParser)]
#[command(name = "opalc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Opal middle-end - optimize and inspect textual IR", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the optimization pipeline over an IR file
    Opt {
        /// Input .ir file
        input: PathBuf,

        /// Output path (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Optimization level (0, 1 or 2)
        #[arg(short = 'O', long, default_value_t = 1)]
        opt_level: u8,

        /// Dump IR after every pass and validate it
        #[arg(long)]
        debug: bool,

        /// Rewrite external symbol references through an address table
        #[arg(long)]
        addr_table: bool,

        /// Target triple, e.g. x86_64-linux-gnu
        #[arg(long)]
        target: Option<String>,

        /// Project configuration file (opal.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Check an IR file for structural violations
    Validate {
        /// Input .ir file
        input: PathBuf,
    },

    /// Parse and pretty-print an IR file
    Print {
        /// Input .ir file
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Opt {
            input,
            output,
            opt_level,
            debug,
            addr_table,
            target,
            config,
        } => {
            run_opt(
                &input,
                output.as_deref(),
                opt_level,
                debug,
                addr_table,
                target.as_deref(),
                config.as_deref(),
            );
        }
        Commands::Validate { input } => run_validate(&input),
        Commands::Print { input } => run_print(&input),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }
}

fn load_module(input: &Path) -> opalc::ssa::Module {
    let source = match std::fs::read_to_string(input) {
        Ok(source) => source,
        Err(error) => {
            eprintln!("error: cannot read {}: {}", input.display(), error);
            process::exit(1);
        }
    };

    match parse_module(&source) {
        Ok(module) => module,
        Err(error) => {
            eprintln!("error: {}: {}", input.display(), error);
            process::exit(1);
        }
    }
}

fn run_opt(
    input: &Path,
    output: Option<&Path>,
    opt_level: u8,
    debug: bool,
    addr_table: bool,
    target: Option<&str>,
    config_path: Option<&Path>,
) {
    let mut config = match config_path {
        Some(path) => {
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(error) => {
                    eprintln!("error: cannot read {}: {}", path.display(), error);
                    process::exit(1);
                }
            };
            match Config::from_toml(&text) {
                Ok(config) => config,
                Err(message) => {
                    eprintln!("error: {}", message);
                    process::exit(1);
                }
            }
        }
        None => Config::default(),
    };

    if opt_level > 2 {
        eprintln!("error: opt_level must be 0, 1 or 2");
        process::exit(1);
    }
    config.opt_level = opt_level;
    config.debug = config.debug || debug;
    config.generate_addr_table = config.generate_addr_table || addr_table;

    if let Some(triple) = target {
        config.target = match Target::parse(triple) {
            Ok(target) => target,
            Err(error) => {
                eprintln!("error: {}", error);
                process::exit(1);
            }
        };
    }

    let mut module = load_module(input);

    // The binary operates on foreign IR; treat every parsed function as a
    // root so dead-function elimination keeps them all.
    for func in &mut module.functions {
        func.global = true;
    }

    if let Err(error) = PassRunner::new(config).run(&mut module) {
        eprintln!("error: {}", error);
        process::exit(1);
    }

    let text = write_module(&module);
    match output {
        Some(path) => {
            if let Err(error) = std::fs::write(path, text) {
                eprintln!("error: cannot write {}: {}", path.display(), error);
                process::exit(1);
            }
        }
        None => print!("{}", text),
    }
}

fn run_validate(input: &Path) {
    let module = load_module(input);

    let mut validator = Validator::new();
    if validator.validate(&module) {
        println!("{}: ok", input.display());
    } else {
        eprint!("{}", validator.report());
        process::exit(1);
    }
}

fn run_print(input: &Path) {
    let module = load_module(input);
    print!("{}", write_module(&module));
}
