//! Small helpers shared across commands: a confirmation prompt for
//! destructive verbs, ported from `_confirm_or_exit` in
//! `original_source/transient/cli.py`.

use std::io::Write;

pub fn prompt_yes_no(question: &str) -> anyhow::Result<bool> {
    eprint!("{question} [y/N] ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}
