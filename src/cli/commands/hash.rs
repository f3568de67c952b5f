//! Hash command implementation.

use crate::cache::hash::resources_hash;
use crate::store::manifest::{parse_file, Manifest};
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

/// Print the desired version of each ConfigRequest in a manifest.
#[derive(Args, Debug)]
pub struct HashArgs {
    /// Manifest file path.
    #[arg(short, long)]
    pub manifest: PathBuf,
}

/// Run the hash command.
pub fn run_hash(args: HashArgs) -> Result<()> {
    for (key, version) in desired_versions(&args.manifest)? {
        println!("{}\t{}", key, version);
    }
    Ok(())
}

/// `(request key, desired version)` for every ConfigRequest in the file.
fn desired_versions(path: &Path) -> Result<Vec<(String, String)>> {
    let mut versions = Vec::new();
    for manifest in parse_file(path)? {
        if let Manifest::ConfigRequest { metadata, spec } = manifest {
            spec.validate()
                .with_context(|| format!("invalid ConfigRequest {}", metadata.key()))?;
            let version = resources_hash(&spec.normalized_resources(), spec.serialization);
            versions.push((metadata.key().to_string(), version));
        }
    }
    Ok(versions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn yaml_file() -> tempfile::NamedTempFile {
        tempfile::Builder::new().suffix(".yaml").tempfile().unwrap()
    }

    #[test]
    fn key_order_does_not_change_the_version() {
        let mut a = yaml_file();
        writeln!(
            a,
            "kind: ConfigRequest\nmetadata:\n  name: n1\nspec:\n  nodeID: n1\n  resources:\n    - type: cluster\n      value: '{{\"name\":\"c\",\"connect_timeout\":\"1s\"}}'"
        )
        .unwrap();
        let mut b = yaml_file();
        writeln!(
            b,
            "kind: ConfigRequest\nmetadata:\n  name: n1\nspec:\n  nodeID: n1\n  resources:\n    - type: cluster\n      value: '{{\"connect_timeout\":\"1s\",\"name\":\"c\"}}'"
        )
        .unwrap();

        let first = desired_versions(a.path()).unwrap();
        let second = desired_versions(b.path()).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }
}
