//! Out-of-band hash recording utility.
//!
//! Populates the manifest the runner verifies against. Runs with the same
//! hash-directory policy as the runner; typically invoked by whoever owns
//! the hash directory after changing a config or env file.

use clap::Parser;

use gscr_core::safety::hash::{resolve_hash_dir, Verifier};

#[derive(Parser, Debug)]
#[command(
    name = "gscr-record",
    version,
    about = "Record file hashes for the safe command runner"
)]
struct RecordCli {
    /// Hash manifest directory; overrides GSCR_HASH_DIRECTORY and the
    /// compile-time default.
    #[arg(long, value_name = "PATH")]
    hash_directory: Option<String>,

    /// Files to record. Repeatable.
    #[arg(long = "file", value_name = "PATH", required = true)]
    files: Vec<String>,

    /// Overwrite existing manifest entries.
    #[arg(long)]
    force: bool,
}

fn main() {
    let cli = RecordCli::parse();

    let hash_dir = match resolve_hash_dir(cli.hash_directory.as_deref()) {
        Ok(dir) => dir,
        Err(e) => {
            eprintln!("[CRITICAL] verification: hash_directory_validation: {e}");
            std::process::exit(4);
        }
    };
    let verifier = Verifier::new(hash_dir);

    let mut failed = false;
    for file in &cli.files {
        match verifier.record_file(file, cli.force) {
            Ok(entry) => println!("recorded {file} -> {}", entry.display()),
            Err(e) => {
                eprintln!("error: failed to record {file}: {e}");
                failed = true;
            }
        }
    }
    std::process::exit(if failed { 2 } else { 0 });
}
