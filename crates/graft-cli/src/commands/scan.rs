//! Scan command implementation.
//!
//! Runs patterns against an image dump on disk and reports every match
//! offset plus the derived target (match + entry offset), so pattern sets
//! can be validated without attaching to a live process.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use graft_core::{Pattern, load_pattern_set};
use tracing::info;

pub fn run(
    file: &Path,
    pattern: Option<&str>,
    set: Option<&Path>,
    name: Option<&str>,
    limit: usize,
) -> Result<()> {
    let buffer =
        fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    info!("Scanning {} ({} bytes)", file.display(), buffer.len());

    match (pattern, set) {
        (Some(text), None) => scan_one(&buffer, "pattern", text, 0, limit),
        (None, Some(set_path)) => {
            let set = load_pattern_set(set_path)?;
            match name {
                Some(name) => {
                    let entry = set.entry(name).with_context(|| {
                        format!("No entry '{}' in {}", name, set_path.display())
                    })?;
                    scan_one(&buffer, &entry.name, &entry.pattern, entry.offset, limit)
                }
                None => {
                    for entry in &set.entries {
                        scan_one(&buffer, &entry.name, &entry.pattern, entry.offset, limit)?;
                    }
                    Ok(())
                }
            }
        }
        _ => bail!("Provide either --pattern or --set"),
    }
}

fn scan_one(buffer: &[u8], label: &str, text: &str, offset: i64, limit: usize) -> Result<()> {
    let pattern = Pattern::parse(text)
        .with_context(|| format!("Entry '{}' has invalid pattern text", label))?;
    let matches = pattern.find_all(buffer);

    if matches.is_empty() {
        println!("{}: not found", label);
        return Ok(());
    }

    println!("{}: {} match(es)", label, matches.len());
    for position in matches.iter().take(limit) {
        let target = (*position as i64).wrapping_add(offset);
        println!("  0x{:08X} -> target 0x{:08X}", position, target);
    }
    if matches.len() > limit {
        println!("  ... ({} more)", matches.len() - limit);
    }

    Ok(())
}
