//! CLI commands.

pub mod backup;
pub mod gc;
pub mod integrity;
pub mod restore;

use std::io::prelude::*;

use anyhow::{Context, Result};

/// Asks on stdout, reads the answer from stdin. Anything but an explicit
/// yes is a no.
pub fn confirm(question: &str) -> Result<bool> {
    print!("{question} (y/n) ");
    std::io::stdout().flush().context("Couldn't flush stdout")?;
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Couldn't read stdin")?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}
