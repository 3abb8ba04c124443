//! Command-line front end: `init` and `status` for the project-context
//! directory that `roles::load_project_context` reads at startup.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "spiral-ctl", about = "Manage a spiral-orchestrator project context")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the project-context directory tree at `path` (default `.`).
    Init { path: Option<PathBuf> },
    /// Report whether `path` (default `.`) is an initialized project context.
    Status { path: Option<PathBuf> },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Init { path } => init(&path.unwrap_or_else(|| PathBuf::from("."))),
        Command::Status { path } => status(&path.unwrap_or_else(|| PathBuf::from("."))),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init(dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(dir.join("agents")).map_err(|e| format!("failed to create {}: {e}", dir.join("agents").display()))?;

    write_if_absent(&dir.join("context.yaml"), "# project-wide context consumed by roles::load_project_context\n")?;
    write_if_absent(&dir.join("rules.yaml"), "# project rules consumed by roles::load_project_context\n")?;
    write_if_absent(&dir.join("architecture.md"), "# Architecture\n\nDescribe the system here.\n")?;

    println!("initialized project context at {}", dir.display());
    Ok(())
}

fn write_if_absent(path: &Path, contents: &str) -> Result<(), String> {
    if path.is_file() {
        return Ok(());
    }
    std::fs::write(path, contents).map_err(|e| format!("failed to write {}: {e}", path.display()))
}

fn status(dir: &Path) -> Result<(), String> {
    if !dir.is_dir() {
        return Err(format!("{} does not exist", dir.display()));
    }

    let context = dir.join("context.yaml").is_file();
    let rules = dir.join("rules.yaml").is_file();
    let architecture = dir.join("architecture.md").is_file();
    let agents = dir.join("agents").is_dir();

    println!("project context at {}:", dir.display());
    println!("  context.yaml:    {}", present(context));
    println!("  rules.yaml:      {}", present(rules));
    println!("  architecture.md: {}", present(architecture));
    println!("  agents/:         {}", present(agents));

    if !(context || rules || architecture || agents) {
        return Err(format!("{} exists but is not an initialized project context", dir.display()));
    }

    Ok(())
}

fn present(found: bool) -> &'static str {
    if found {
        "present"
    } else {
        "missing"
    }
}
