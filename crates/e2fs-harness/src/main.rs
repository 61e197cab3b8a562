#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use e2fs_core::{Ext2Fs, OpenOptions};
use e2fs_harness::{ImageSpec, build_image, check_consistency};
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("mkimage") => mkimage(&args[1..]),
        Some("check") => check(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn mkimage(args: &[String]) -> Result<()> {
    let out = args
        .first()
        .context("usage: e2fs-harness mkimage <out> [--spec FILE] [--blocks N] [--block-size N]")?;
    let mut spec = ImageSpec::default();
    let mut index = 1_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--spec" => {
                let raw = args.get(index + 1).context("--spec requires a path")?;
                spec = ImageSpec::from_json_file(Path::new(raw))?;
                index += 2;
            }
            "--blocks" => {
                let raw = args.get(index + 1).context("--blocks requires a value")?;
                spec.blocks_count = raw.parse().context("invalid --blocks value")?;
                index += 2;
            }
            "--block-size" => {
                let raw = args.get(index + 1).context("--block-size requires a value")?;
                spec.block_size = raw.parse().context("invalid --block-size value")?;
                index += 2;
            }
            "--label" => {
                let raw = args.get(index + 1).context("--label requires a value")?;
                spec.volume_name.clone_from(raw);
                index += 2;
            }
            other => bail!("unknown mkimage option: {other}"),
        }
    }

    let image = build_image(&spec)?;
    fs::write(out, &image).with_context(|| format!("failed to write {out}"))?;
    eprintln!(
        "wrote {out}: {} blocks of {} bytes, {} groups",
        spec.blocks_count,
        spec.block_size,
        spec.group_count()
    );
    Ok(())
}

fn check(args: &[String]) -> Result<()> {
    let path = args.first().context("usage: e2fs-harness check <image>")?;
    let options = OpenOptions {
        read_only: true,
        ..OpenOptions::default()
    };
    let fs = Ext2Fs::open(path, &options).with_context(|| format!("failed to mount {path}"))?;
    let report = check_consistency(&fs)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        bail!("{} consistency problem(s)", report.problems.len());
    }
    Ok(())
}

fn print_usage() {
    println!("e2fs-harness: test image builder and consistency checker");
    println!();
    println!("USAGE:");
    println!("  e2fs-harness mkimage <out> [--spec FILE] [--blocks N] [--block-size N] [--label NAME]");
    println!("  e2fs-harness check <image>");
    println!();
    println!("MKIMAGE:");
    println!("  Writes a minimal ext2 image holding only the root directory.");
    println!("  --spec reads geometry from JSON (fields of ImageSpec; missing fields default).");
    println!();
    println!("CHECK:");
    println!("  Mounts read-only, compares bitmaps with free counters and validates");
    println!("  every directory block reachable from the root. Exits 1 on problems.");
}
