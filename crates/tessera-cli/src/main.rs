mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{EXIT_CONFIG_ERROR, EXIT_FAILURE, EXIT_STORE_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "tessera",
    version,
    about = "Transactional operation-execution kernel for a management controller"
)]
struct Cli {
    /// Directory holding tessera.toml and the persisted configuration.
    #[arg(long, default_value = "~/.local/share/tessera")]
    store: String,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute the operations in a JSON file, one transaction each.
    Exec {
        /// File holding one operation object or an array of them.
        file: PathBuf,
        /// Continue with the next operation after a failed one.
        #[arg(long, default_value_t = false)]
        keep_going: bool,
    },
    /// Execute a single operation.
    Op {
        /// Operation name, e.g. "add" or "write-attribute".
        name: String,
        /// Target address, e.g. "/subsystem=web".
        #[arg(default_value = "/")]
        address: String,
        /// Operation parameter as key=value; values are parsed as JSON when possible.
        #[arg(short, long = "param")]
        params: Vec<String>,
        /// Roll back when a RUNTIME or VERIFY step fails.
        #[arg(long, default_value_t = false)]
        rollback_on_failure: bool,
        /// Lock and stability wait budget in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print a resource from the booted model.
    Read {
        #[arg(default_value = "/")]
        address: String,
        /// Include children, nested by type then name.
        #[arg(short, long, default_value_t = false)]
        recursive: bool,
    },
    /// Boot the persisted configuration and report the process state.
    Status,
    /// List committed configuration history copies.
    History,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TESSERA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let store_path = expand_tilde(&cli.store);
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
        Commands::History => commands::history::run(&store_path, json_output),
        command => commands::open_engine(&store_path).and_then(|engine| match command {
            Commands::Exec { file, keep_going } => {
                commands::exec::run(&engine, &file, keep_going, json_output)
            }
            Commands::Op {
                name,
                address,
                params,
                rollback_on_failure,
                timeout,
            } => commands::op::run(
                &engine,
                &name,
                &address,
                &params,
                &commands::op::OpOptions {
                    rollback_on_failure,
                    timeout,
                },
                json_output,
            ),
            Commands::Read { address, recursive } => {
                commands::read::run(&engine, &address, recursive)
            }
            Commands::Status => commands::status::run(&engine, json_output),
            Commands::Completions { .. } | Commands::History => Ok(commands::EXIT_SUCCESS),
        }),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("configuration error:")
                || msg.starts_with("invalid operation")
            {
                EXIT_CONFIG_ERROR
            } else if msg.starts_with("store error:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
