//! Recordings catalog, rebuilt from the filesystem on demand.
//!
//! The sidecar JSON written by the capture pipeline is the source of
//! truth; a capture file without a readable sidecar is invisible to
//! the catalog. Scans are cheap enough to rerun after every finished
//! session instead of maintaining an incremental index.

use std::fs;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};

use crate::protocol::{RecordingDescriptor, SidecarMetadata};

/// Walk `dir` and build the catalog, newest first. Unreadable entries
/// are skipped with a warning rather than failing the whole scan.
pub fn scan(dir: &Path) -> Vec<RecordingDescriptor> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("[catalog] cannot read {}: {}", dir.display(), err);
            return Vec::new();
        }
    };

    let mut recordings = Vec::new();
    for entry in entries.flatten() {
        let sidecar_path = entry.path();
        if sidecar_path.extension().and_then(|ext| ext.to_str()) != Some("json") {
            continue;
        }

        let metadata: SidecarMetadata = match fs::read_to_string(&sidecar_path)
            .map_err(|err| err.to_string())
            .and_then(|raw| serde_json::from_str(&raw).map_err(|err| err.to_string()))
        {
            Ok(metadata) => metadata,
            Err(err) => {
                warn!(
                    "[catalog] skipping unreadable sidecar {}: {}",
                    sidecar_path.display(),
                    err
                );
                continue;
            }
        };

        let wav_path = sidecar_path.with_extension("wav");
        let stat = match fs::metadata(&wav_path) {
            Ok(stat) => stat,
            Err(err) => {
                warn!(
                    "[catalog] sidecar without capture file {}: {}",
                    wav_path.display(),
                    err
                );
                continue;
            }
        };

        let created = stat
            .modified()
            .map(|mtime| {
                DateTime::<Utc>::from(mtime).to_rfc3339_opts(SecondsFormat::Millis, true)
            })
            .unwrap_or_else(|_| metadata.started_at.clone());

        let filename = wav_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        recordings.push(RecordingDescriptor {
            filename,
            created,
            size: stat.len(),
            metadata,
        });
    }

    recordings.sort_by(|a, b| b.created.cmp(&a.created));
    recordings
}
