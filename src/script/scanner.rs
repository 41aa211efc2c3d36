use super::{has_script_extension, Listing, ScriptFile};
use crate::{MigrunError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

/// List every `.sql` script directly inside `dir`, sorted by name.
///
/// Only an unreadable directory is fatal. A script file that exists but cannot
/// be read is reported in `Listing::unreadable` with a warning, so it is never
/// mistaken for a removed script. Dev scripts are returned as well; callers
/// decide what to do with them.
pub fn scan(dir: &Path) -> Result<Listing> {
    let entries = fs::read_dir(dir).map_err(|e| MigrunError::io(dir, e))?;

    let mut listing = Listing::default();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry in {}: {}", dir.display(), e);
                continue;
            }
        };

        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warn!("Skipping file with non UTF-8 name: {:?}", raw);
                continue;
            }
        };

        if !has_script_extension(&name) {
            continue;
        }

        let path = entry.path();
        let content = match fs::metadata(&path) {
            Ok(meta) if !meta.is_file() => continue,
            Ok(_) => fs::read(&path),
            Err(e) => Err(e),
        };
        let content = match content {
            Ok(content) => content,
            Err(e) => {
                warn!("Cannot read script {}: {}", path.display(), e);
                listing.unreadable.push(name);
                continue;
            }
        };

        if std::str::from_utf8(&content).is_err() {
            warn!("{} is not valid UTF-8; fingerprinting its raw bytes", name);
        }

        let mut script = ScriptFile::from_bytes(&name, path, &content);
        script.last_modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from);

        if script.is_dev() {
            info!("Dev script {} will not be migrated", script.name);
        }
        debug!("Scanned {} ({}, {})", script.name, script.kind, script.fingerprint);
        listing.scripts.push(script);
    }

    listing.scripts.sort_by(|a, b| a.name.cmp(&b.name));
    listing.unreadable.sort();
    info!("Found {} scripts in {}", listing.scripts.len(), dir.display());
    Ok(listing)
}
