//! merkle-tree: offline batch build, proof generation and verification.
//!
//! Builds a Merkle tree from positional data blocks, a line-per-block input
//! file, or every regular file under a directory, prints (or saves) the tree
//! JSON followed by the root hash, and optionally emits an inclusion proof
//! with a VALID/INVALID verdict.

use std::path::PathBuf;

use clap::Parser;
use serde_json::json;

use merkle_watch::error::{Error, Result};
use merkle_watch::proof::verify_data;
use merkle_watch::tree::MerkleTree;
use merkle_watch::walker;

#[derive(Parser)]
#[command(name = "merkle-tree")]
#[command(about = "Build a Merkle tree from data blocks or files and verify inclusion proofs")]
struct Args {
    /// Data blocks to build the tree from
    data: Vec<String>,

    /// File containing data blocks, one per line (blank lines skipped)
    #[arg(long)]
    input_file: Option<PathBuf>,

    /// Build from every regular file under this directory instead of data
    /// blocks (files are hashed by content, in sorted path order)
    #[arg(long, conflicts_with_all = ["data", "input_file"])]
    directory: Option<PathBuf>,

    /// Save the tree JSON to this file instead of stdout
    #[arg(long)]
    output_file: Option<PathBuf>,

    /// Pretty-print the JSON output
    #[arg(long)]
    pretty: bool,

    /// Generate an inclusion proof for this data block and verify it
    /// against the root
    #[arg(long, value_name = "DATA")]
    verify: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("merkle-tree: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let tree = build_tree(&args).await?;
    let root = tree
        .root_hash()
        .ok_or_else(|| Error::Empty("no data blocks provided".to_string()))?
        .to_string();

    let rendered = if args.pretty {
        tree.to_json_pretty()
    } else {
        tree.to_json_string()
    };

    match &args.output_file {
        Some(path) => {
            std::fs::write(path, &rendered)
                .map_err(|e| Error::Io(format!("cannot write {}: {e}", path.display())))?;
            println!("Merkle Tree saved to {}", path.display());
        }
        None => {
            println!("Merkle Tree JSON:");
            println!("{rendered}");
        }
    }

    println!();
    println!("Merkle Root: {root}");

    if let Some(target) = &args.verify {
        let proof = tree.prove_data(target)?;
        let proof_json = if args.pretty {
            serde_json::to_string_pretty(&proof)?
        } else {
            serde_json::to_string(&proof)?
        };
        println!();
        println!("Proof for {}:", json!(target));
        println!("{proof_json}");

        let verdict = if verify_data(target, &proof, &root) {
            "VALID"
        } else {
            "INVALID"
        };
        println!("Verification: {verdict}");
    }

    Ok(())
}

async fn build_tree(args: &Args) -> Result<MerkleTree> {
    if let Some(dir) = &args.directory {
        let scan = walker::walk(dir, None)?;
        return MerkleTree::from_files(&scan.files).await;
    }

    let mut blocks = args.data.clone();
    if let Some(path) = &args.input_file {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Io(format!("cannot read {}: {e}", path.display())))?;
        blocks.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(String::from),
        );
    }

    if blocks.is_empty() {
        return Err(Error::Empty("no data blocks provided".to_string()));
    }

    Ok(MerkleTree::from_data(&blocks))
}
