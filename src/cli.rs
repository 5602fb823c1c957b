use crate::command;
use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{Shell, generate};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "pgsandbox")]
#[command(about = "Disposable PostgreSQL source sandboxes with all-or-nothing patching")]
#[command(after_help = "Sandboxes are tracked in <state_dir>/registry.json.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone, build, initialize and start a new sandbox
    New {
        /// Unique name for the sandbox
        label: String,
    },

    /// Apply a unified diff to a running sandbox, rebuild and restart it.
    /// On failure the previous version is restored and the command exits 1.
    ApplyPatch {
        /// Sandbox to patch
        #[arg(short, long)]
        sandbox: String,

        /// Patch file, or '-' to read it from stdin
        file: String,
    },

    /// Show registered sandboxes
    #[command(visible_alias = "ls")]
    List {
        /// Probe each server and report live/unreachable/degraded
        #[arg(long)]
        probe: bool,

        /// Print JSON even on a terminal
        #[arg(long)]
        json: bool,
    },

    /// Stop a sandbox and remove it from the registry
    Stop {
        label: String,

        /// Also delete the sandbox's checkout, build and data
        #[arg(long)]
        purge: bool,
    },

    /// Stop and deregister every sandbox
    StopAll {
        /// Also delete each sandbox's files
        #[arg(long)]
        purge: bool,
    },

    /// Print a live sandbox, reusing one when possible and provisioning otherwise
    Ensure {
        /// Sandbox to acquire (default: first live one, else "default")
        label: Option<String>,
    },

    /// Print the source root used by inspection tools
    Path {
        /// Sandbox to resolve (default: first live one)
        label: Option<String>,
    },

    /// Run one JSON request and print a JSON reply
    Call {
        /// Request such as '{"command":"ensure"}', or '-' to read it from stdin
        request: String,
    },

    /// Generate shell completions
    Completions {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// --- Public Entry Point ---
pub fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::New { label } => command::new::run(&label),
        Commands::ApplyPatch { sandbox, file } => command::apply_patch::run(&sandbox, &file),
        Commands::List { probe, json } => command::list::run(probe, json),
        Commands::Stop { label, purge } => command::stop::run(&label, purge),
        Commands::StopAll { purge } => command::stop::run_all(purge),
        Commands::Ensure { label } => command::ensure::run(label.as_deref()),
        Commands::Path { label } => command::path::run(label.as_deref()),
        Commands::Call { request } => {
            let code = command::call::run(&request)?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Completions { shell } => {
            generate_completions(shell);
            Ok(())
        }
    }
}

fn generate_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut std::io::stdout());
}
