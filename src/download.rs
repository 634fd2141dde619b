//! Downloading of pre-clustered ARG databases.
//!
//! A database is a gzipped tarball of MSA files (one per gene cluster),
//! fetched from the release bucket and unpacked into the output directory
//! ready for `argraph index`.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::ArgraphError;

/// Databases available for download.
pub const AVAILABLE_DATABASES: &[&str] = &["arg-annot", "resfinder", "card"];

/// Clustering identities available for download.
pub const AVAILABLE_IDENTITIES: &[&str] = &["90"];

const DB_URL_BASE: &str =
    "https://github.com/argraph/argraph-db/raw/main/clustered-ARG-databases";

/// Options for the get subcommand.
#[derive(Debug, Clone)]
pub struct GetOpts {
    pub database: String,
    pub identity: String,
    pub out_dir: PathBuf,
}

/// Downloads a URL to a file with a generous timeout for large tarballs.
fn fetch_file(url: &str, output_path: &Path) -> Result<()> {
    let response = ureq::get(url)
        .timeout(Duration::from_secs(300))
        .call()
        .with_context(|| format!("failed to download {}", url))?;
    let mut output = File::create(output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;
    std::io::copy(&mut response.into_reader(), &mut output)
        .with_context(|| format!("failed to write {}", output_path.display()))?;
    Ok(())
}

/// Fetches and unpacks a pre-clustered database tarball.
///
/// Returns the directory holding the unpacked MSA files.
pub fn run_get(opts: &GetOpts) -> Result<PathBuf> {
    if !AVAILABLE_DATABASES.contains(&opts.database.as_str()) {
        return Err(ArgraphError::BadInput(format!(
            "unrecognised database: {} (choose one of: {})",
            opts.database,
            AVAILABLE_DATABASES.join("/")
        ))
        .into());
    }
    if !AVAILABLE_IDENTITIES.contains(&opts.identity.as_str()) {
        return Err(ArgraphError::BadInput(format!(
            "clustering identity not available: {} (choose one of: {})",
            opts.identity,
            AVAILABLE_IDENTITIES.join("/")
        ))
        .into());
    }
    std::fs::create_dir_all(&opts.out_dir)
        .with_context(|| format!("can't create output directory: {}", opts.out_dir.display()))?;

    let tarball_name = format!("{}.{}.tar.gz", opts.database, opts.identity);
    let url = format!("{}/{}", DB_URL_BASE, tarball_name);
    let staging = tempfile::tempdir().context("failed to create staging directory")?;
    let tarball_path = staging.path().join(&tarball_name);
    info!(%url, "downloading database");
    fetch_file(&url, &tarball_path)?;

    let tarball = File::open(&tarball_path)
        .with_context(|| format!("failed to open {}", tarball_path.display()))?;
    let decoder = flate2::read::GzDecoder::new(BufReader::new(tarball));
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(&opts.out_dir)
        .context("failed to unpack database tarball")?;

    let db_dir = opts.out_dir.join(format!("{}.{}", opts.database, opts.identity));
    let msa_dir = if db_dir.is_dir() { db_dir } else { opts.out_dir.clone() };
    let msa_count = std::fs::read_dir(&msa_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().and_then(|e| e.to_str()) == Some("msa"))
        .count();
    if msa_count == 0 {
        return Err(ArgraphError::BadInput(format!(
            "downloaded database contains no MSA files: {}",
            msa_dir.display()
        ))
        .into());
    }
    info!(
        database = %opts.database,
        msa_files = msa_count,
        dir = %msa_dir.display(),
        "database ready"
    );
    Ok(msa_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_database_rejected() {
        let opts = GetOpts {
            database: "not-a-db".to_string(),
            identity: "90".to_string(),
            out_dir: PathBuf::from("."),
        };
        assert!(run_get(&opts).is_err());
    }

    #[test]
    fn test_unknown_identity_rejected() {
        let opts = GetOpts {
            database: "arg-annot".to_string(),
            identity: "85".to_string(),
            out_dir: PathBuf::from("."),
        };
        assert!(run_get(&opts).is_err());
    }
}
