//! Set command implementation.

use std::path::Path;

use anyhow::Result;
use graft_core::load_pattern_set;
use tracing::warn;

pub fn run(file: &Path) -> Result<()> {
    let set = load_pattern_set(file)?;
    println!(
        "Pattern set version {} ({} entries)",
        set.version,
        set.entries.len()
    );

    for entry in &set.entries {
        match entry.compile() {
            Ok(pattern) => {
                println!("  {:<24} {} (offset {:+})", entry.name, pattern, entry.offset)
            }
            Err(e) => {
                warn!("Entry '{}' does not compile: {}", entry.name, e);
                println!("  {:<24} INVALID: {}", entry.name, e);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lists_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"version":"1","entries":[{{"name":"a","pattern":"48 ?? C3","offset":2}}]}}"#
        )
        .unwrap();

        assert!(run(file.path()).is_ok());
    }
}
