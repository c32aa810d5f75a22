//! Check command implementation.

use anyhow::Result;
use graft_core::Pattern;

pub fn run(pattern_text: &str) -> Result<()> {
    let pattern = Pattern::parse(pattern_text)?;
    let wildcards = pattern
        .elements()
        .iter()
        .filter(|element| element.is_none())
        .count();

    println!("{}", pattern);
    println!("{} byte(s), {} wildcard(s)", pattern.len(), wildcards);
    Ok(())
}
