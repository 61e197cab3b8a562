#![forbid(unsafe_code)]

mod render;
mod shell;

use anyhow::{Context, Result, bail};
use e2fs::{Ext2Fs, ImageFs, OpenOptions};
use serde::Serialize;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter (default `warn`).
const LOG_ENV: &str = "E2FS_LOG";

#[derive(Debug, Serialize)]
struct InspectOutput {
    filesystem: &'static str,
    #[serde(flatten)]
    info: e2fs::FsInfo,
    inodes_count: u32,
    blocks_count: u32,
    groups: Vec<e2fs::Ext2GroupDesc>,
}

fn main() {
    init_tracing();
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run() -> Result<()> {
    let mut args = env::args().skip(1);
    let Some(command) = args.next() else {
        print_usage();
        return Ok(());
    };

    match command.as_str() {
        "shell" => {
            let Some(path) = args.next() else {
                bail!("shell requires an image path");
            };
            let read_only = args.any(|arg| arg == "--read-only");
            shell_cmd(Path::new(&path), read_only)
        }
        "inspect" => {
            let Some(path) = args.next() else {
                bail!("inspect requires a path argument");
            };
            let json = args.any(|arg| arg == "--json");
            inspect(Path::new(&path), json)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("e2fs-cli\n");
    println!("USAGE:");
    println!("  e2fs-cli shell <image-path> [--read-only]");
    println!("  e2fs-cli inspect <image-path> [--json]");
    println!();
    println!("Set {LOG_ENV}=debug (or any tracing filter) for engine logs on stderr.");
}

fn mount(path: &Path, read_only: bool) -> Result<ImageFs> {
    let options = OpenOptions {
        read_only,
        ..OpenOptions::default()
    };
    Ext2Fs::open(path, &options)
        .with_context(|| format!("failed to mount ext2 image {}", path.display()))
}

fn shell_cmd(path: &Path, read_only: bool) -> Result<()> {
    let fs = mount(path, read_only)?;
    let mut session = shell::Session::new(fs);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut lines = stdin.lock().lines();

    loop {
        write!(stdout, "{}", session.prompt())?;
        stdout.flush()?;
        let Some(line) = lines.next() else {
            writeln!(stdout)?;
            break;
        };
        let line = line.context("failed to read command")?;
        if session.execute(&line, &mut stdout)? == shell::Flow::Exit {
            break;
        }
    }
    session.close().context("failed to flush image")?;
    Ok(())
}

fn inspect(path: &Path, json: bool) -> Result<()> {
    let fs = mount(path, true)?;
    let output = InspectOutput {
        filesystem: "ext2",
        info: fs.info(),
        inodes_count: fs.superblock().inodes_count,
        blocks_count: fs.superblock().blocks_count,
        groups: fs.groups().to_vec(),
    };

    let mut stdout = io::stdout();
    if json {
        writeln!(
            stdout,
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        )?;
    } else {
        writeln!(stdout, "e2fs inspector")?;
        writeln!(stdout, "filesystem: {}", output.filesystem)?;
        writeln!(stdout, "inodes_count: {}", output.inodes_count)?;
        writeln!(stdout, "blocks_count: {}", output.blocks_count)?;
        render::info(&mut stdout, &output.info)?;
    }
    Ok(())
}
