//! CloudSync CLI - browse and edit cloud storage from the terminal
//!
//! Authorization URLs are printed to stderr; paste the callback URL the
//! provider redirects to back into the terminal.

use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cloudsync::{CachedSource, ConsoleWindow, Settings, SourceError, SourceRegistry};

/// CLI command
#[derive(Debug)]
enum Command {
    /// List a directory
    List { source: String, path: String },
    /// Download a file to the local filesystem
    Get {
        source: String,
        path: String,
        name: String,
        output: PathBuf,
    },
    /// Upload a local file
    Put {
        source: String,
        path: String,
        input: PathBuf,
        name: String,
    },
    MakeDir {
        source: String,
        path: String,
        name: String,
    },
    RemoveDir {
        source: String,
        path: String,
        name: String,
    },
    MoveDir {
        source: String,
        path: String,
        name: String,
        new_name: String,
    },
    Move {
        source: String,
        path: String,
        name: String,
        new_name: String,
    },
    Remove {
        source: String,
        path: String,
        name: String,
    },
    /// Show help
    Help,
}

fn print_help() {
    eprintln!(
        r#"CloudSync - Cached access to Google Drive, Dropbox and OneDrive

USAGE:
    cloudsync ls <source> [path]
    cloudsync get <source> <path> <name> [output]
    cloudsync put <source> <path> <local_file> [name]
    cloudsync mkdir <source> <path> <name>
    cloudsync rmdir <source> <path> <name>
    cloudsync mvdir <source> <path> <name> <new_name>
    cloudsync mv <source> <path> <name> <new_name>
    cloudsync rm <source> <path> <name>
    cloudsync help

SOURCES:
    gdrive  Google Drive
    dbx     Dropbox
    odrive  OneDrive

COMMANDS:
    ls      List the folders and files in a directory
    get     Download a file (defaults to ./<name>)
    put     Upload a file, replacing any file with the same name
    mkdir   Create a directory
    rmdir   Move a directory to the provider's trash
    mvdir   Rename a directory
    mv      Rename a file
    rm      Move a file to the provider's trash
    help    Show this help message

EXAMPLES:
    # List the Dropbox root
    cloudsync ls dbx /

    # Upload a score into a OneDrive folder
    cloudsync put odrive /Music/Scores ./bach.pdf

ENVIRONMENT:
    CLOUDSYNC_REDIRECT_URI           OAuth callback URL registered with the providers
    CLOUDSYNC_REQUEST_TIMEOUT_SECS   Per-request HTTP timeout
    RUST_LOG                         Log filter (trace, debug, info, warn, error)
"#
    );
}

fn arg(args: &[String], index: usize, usage: &str) -> Result<String> {
    args.get(index)
        .cloned()
        .ok_or_else(|| anyhow!("Usage: cloudsync {}", usage))
}

fn parse_args() -> Result<Command> {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        return Ok(Command::Help);
    }

    match args[1].as_str() {
        "ls" => Ok(Command::List {
            source: arg(&args, 2, "ls <source> [path]")?,
            path: args.get(3).cloned().unwrap_or_default(),
        }),
        "get" => {
            let usage = "get <source> <path> <name> [output]";
            let name = arg(&args, 4, usage)?;
            Ok(Command::Get {
                source: arg(&args, 2, usage)?,
                path: arg(&args, 3, usage)?,
                output: PathBuf::from(args.get(5).unwrap_or(&name)),
                name,
            })
        }
        "put" => {
            let usage = "put <source> <path> <local_file> [name]";
            let input = PathBuf::from(arg(&args, 4, usage)?);
            let name = match args.get(5) {
                Some(name) => name.clone(),
                None => input
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(str::to_string)
                    .ok_or_else(|| anyhow!("Cannot derive a file name from {}", input.display()))?,
            };
            Ok(Command::Put {
                source: arg(&args, 2, usage)?,
                path: arg(&args, 3, usage)?,
                input,
                name,
            })
        }
        "mkdir" | "rmdir" | "rm" => {
            let usage = format!("{} <source> <path> <name>", args[1]);
            let source = arg(&args, 2, &usage)?;
            let path = arg(&args, 3, &usage)?;
            let name = arg(&args, 4, &usage)?;
            Ok(match args[1].as_str() {
                "mkdir" => Command::MakeDir { source, path, name },
                "rmdir" => Command::RemoveDir { source, path, name },
                _ => Command::Remove { source, path, name },
            })
        }
        "mvdir" | "mv" => {
            let usage = format!("{} <source> <path> <name> <new_name>", args[1]);
            let source = arg(&args, 2, &usage)?;
            let path = arg(&args, 3, &usage)?;
            let name = arg(&args, 4, &usage)?;
            let new_name = arg(&args, 5, &usage)?;
            Ok(if args[1] == "mvdir" {
                Command::MoveDir {
                    source,
                    path,
                    name,
                    new_name,
                }
            } else {
                Command::Move {
                    source,
                    path,
                    name,
                    new_name,
                }
            })
        }
        "help" | "--help" | "-h" => Ok(Command::Help),
        _ => {
            eprintln!("Unknown command: {}", args[1]);
            Ok(Command::Help)
        }
    }
}

async fn list(source: &CachedSource, path: &str) -> Result<()> {
    let entry = source.get_directory(path, false).await?;
    for name in entry.dirs.keys() {
        println!("{}/", name);
    }
    for file in entry.files.values() {
        let modified = file
            .modified_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>12}  {}  {}", file.size, modified, file.name);
    }
    Ok(())
}

async fn run(registry: &SourceRegistry, command: Command) -> Result<()> {
    match command {
        Command::Help => {
            print_help();
        }
        Command::List { source, path } => {
            let source = registry.resolve(&source)?;
            list(&source, &path).await?;
        }
        Command::Get {
            source,
            path,
            name,
            output,
        } => {
            let source = registry.resolve(&source)?;
            let file = source.get_file(&path, &name).await?;
            tokio::fs::write(&output, &file.data)
                .await
                .with_context(|| format!("Failed to write {}", output.display()))?;
            info!(path = %file.path, size = file.size, "Downloaded {} to {}", file.name, output.display());
        }
        Command::Put {
            source,
            path,
            input,
            name,
        } => {
            let data = tokio::fs::read(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let source = registry.resolve(&source)?;
            let written = source.put_file(&path, &name, &data).await?;
            info!(size = data.len(), "Uploaded {}", written.name);
        }
        Command::MakeDir { source, path, name } => {
            registry.resolve(&source)?.create_directory(&path, &name).await?;
            info!("Created directory {}", name);
        }
        Command::RemoveDir { source, path, name } => {
            registry.resolve(&source)?.trash_directory(&path, &name).await?;
            info!("Trashed directory {}", name);
        }
        Command::MoveDir {
            source,
            path,
            name,
            new_name,
        } => {
            registry
                .resolve(&source)?
                .rename_directory(&path, &name, &new_name)
                .await?;
            info!("Renamed directory {} to {}", name, new_name);
        }
        Command::Move {
            source,
            path,
            name,
            new_name,
        } => {
            registry
                .resolve(&source)?
                .rename_file(&path, &name, &new_name)
                .await?;
            info!("Renamed {} to {}", name, new_name);
        }
        Command::Remove { source, path, name } => {
            registry.resolve(&source)?.trash_file(&path, &name).await?;
            info!("Trashed {}", name);
        }
    }

    for id in registry.active() {
        registry.get(id).log_metrics();
    }
    Ok(())
}

/// Whether a failure is the user's own choice (e.g. closing the authorization prompt)
fn is_expected_failure(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SourceError>()
        .is_some_and(SourceError::is_expected)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    // Parse command
    let command = match parse_args() {
        Ok(cmd) => cmd,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(1);
        }
    };

    let registry = SourceRegistry::new(Settings::from_env(), Arc::new(ConsoleWindow))?;

    if let Err(e) = run(&registry, command).await {
        if is_expected_failure(&e) {
            info!("{}", e);
        } else {
            error!(error = %e, "Command failed");
        }
        std::process::exit(1);
    }

    Ok(())
}
