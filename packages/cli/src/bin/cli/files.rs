// ABOUTME: CLI commands for a machine's sandboxed file tree
// ABOUTME: List, upload (archives are expanded), delete, clone, read and write

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use std::io::Read;
use std::path::PathBuf;
use vmweb_cli::files_table;
use vmweb_machines::files::is_archive;
use vmweb_machines::MachineManager;

#[derive(Subcommand)]
pub enum FilesCommands {
    /// List a directory
    Ls {
        /// Machine ID
        id: String,
        /// Directory relative to the file root
        #[arg(default_value = "/")]
        path: String,
    },
    /// Upload a local file; .zip, .tar, .tar.gz and .tgz archives are expanded
    Upload {
        /// Machine ID
        id: String,
        /// Local file to upload
        file: PathBuf,
        /// Target directory relative to the file root
        #[arg(long, default_value = "/")]
        to: String,
        /// Upload archives as-is instead of expanding them
        #[arg(long)]
        raw: bool,
    },
    /// Delete a file
    Rm {
        /// Machine ID
        id: String,
        /// File path relative to the file root
        path: String,
    },
    /// Delete a folder and everything in it
    Rmdir {
        /// Machine ID
        id: String,
        /// Folder path relative to the file root
        path: String,
    },
    /// Clone a git repository into the file tree
    Clone {
        /// Machine ID
        id: String,
        /// Repository URL
        url: String,
        /// Target directory relative to the file root
        #[arg(long, default_value = "/")]
        to: String,
    },
    /// Print a file
    Cat {
        /// Machine ID
        id: String,
        /// File path relative to the file root
        path: String,
    },
    /// Write a file from a local file or stdin
    Write {
        /// Machine ID
        id: String,
        /// File path relative to the file root
        path: String,
        /// Local source file (stdin when omitted)
        #[arg(long)]
        from: Option<PathBuf>,
    },
}

pub async fn handle_files_command(manager: &MachineManager, command: FilesCommands) -> Result<()> {
    match command {
        FilesCommands::Ls { id, path } => {
            let entries = manager.files(&id).await?.list(&path).await?;
            if entries.is_empty() {
                println!("{}", "Directory is empty".dimmed());
            } else {
                println!("{}", files_table(&entries));
            }
        }
        FilesCommands::Upload { id, file, to, raw } => {
            let files = manager.files(&id).await?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .with_context(|| format!("{} has no file name", file.display()))?;
            let contents = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let target = if is_archive(&name) && !raw {
                files.upload_archive(&to, &name, contents).await?
            } else {
                files.upload_file(&to, &name, &contents).await?
            };
            println!("{} Uploaded {} to {}", "✓".green(), name.bold(), target.display());
        }
        FilesCommands::Rm { id, path } => {
            manager.files(&id).await?.delete_file(&path).await?;
            println!("{} Deleted file {}", "✓".green(), path);
        }
        FilesCommands::Rmdir { id, path } => {
            manager.files(&id).await?.delete_folder(&path).await?;
            println!("{} Deleted folder {}", "✓".green(), path);
        }
        FilesCommands::Clone { id, url, to } => {
            println!("{} Cloning {}...", "▶".blue(), url);
            let target = manager.files(&id).await?.clone_repository(&to, &url).await?;
            println!("{} Cloned into {}", "✓".green(), target.display());
        }
        FilesCommands::Cat { id, path } => {
            print!("{}", manager.files(&id).await?.read_file(&path).await?);
        }
        FilesCommands::Write { id, path, from } => {
            let contents = match from {
                Some(source) => tokio::fs::read_to_string(&source)
                    .await
                    .with_context(|| format!("Failed to read {}", source.display()))?,
                None => {
                    let mut buffer = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buffer)
                        .context("Failed to read stdin")?;
                    buffer
                }
            };
            manager.files(&id).await?.write_file(&path, &contents).await?;
            println!("{} Wrote {} bytes to {}", "✓".green(), contents.len(), path);
        }
    }
    Ok(())
}
