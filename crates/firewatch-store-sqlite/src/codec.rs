//! Snapshot codec: the raw database image and its text-safe envelope.
//!
//! Images are produced and consumed with the engine's online backup API through a
//! scratch file, so the round trip preserves row ids and the autoincrement sequence.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose;
use base64::write::EncoderStringWriter;
use base64::Engine as _;
use rusqlite::{Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{
    table_has_column, table_has_unique_key, ObservationStore, OBSERVATION_KEY_COLUMNS,
    SCHEMA_VERSION,
};

pub const SNAPSHOT_FORMAT: &str = "firewatch-snapshot.v1";

/// Input block size fed to the streaming base64 encoder.
pub const ENCODE_BLOCK_BYTES: usize = 32 * 1024;

/// Slot value wrapping a database image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotEnvelope {
    pub format: String,
    pub saved_at: String,
    pub sha256: String,
    pub bytes: usize,
    pub image: String,
}

/// Serialize the whole database into a standalone image.
///
/// # Errors
/// Returns an error when the backup or the scratch file read fails.
pub fn export_image(store: &ObservationStore) -> Result<Vec<u8>> {
    let scratch = scratch_path("export");
    let image = store
        .conn
        .backup(DatabaseName::Main, &scratch, None)
        .with_context(|| format!("failed to back up store to {}", scratch.display()))
        .and_then(|()| {
            fs::read(&scratch)
                .with_context(|| format!("failed to read exported image {}", scratch.display()))
        });
    remove_scratch(&scratch);
    image
}

/// Build a store from an image produced by [`export_image`].
///
/// The image must pass `PRAGMA quick_check`, carry a schema version no newer than
/// [`SCHEMA_VERSION`], and, when it has an observations table, give that table a
/// `region_code` column and a unique index over [`OBSERVATION_KEY_COLUMNS`].
///
/// # Errors
/// Returns an error when the image is empty, is not a database, or fails validation.
pub fn import_image(image: &[u8]) -> Result<ObservationStore> {
    if image.is_empty() {
        bail!("snapshot image is empty");
    }

    let scratch = scratch_path("import");
    let conn = fs::write(&scratch, image)
        .with_context(|| format!("failed to write scratch image {}", scratch.display()))
        .and_then(|()| restore_connection(&scratch));
    remove_scratch(&scratch);
    let conn = conn?;

    let quick_check: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .context("failed to run PRAGMA quick_check on snapshot")?;
    if quick_check != "ok" {
        bail!("snapshot failed integrity check: {quick_check}");
    }

    let version: i64 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .context("failed to read snapshot schema version")?;
    if version > SCHEMA_VERSION {
        bail!("snapshot schema version {version} is newer than supported {SCHEMA_VERSION}");
    }

    let has_table: i64 = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'observations')",
            [],
            |row| row.get(0),
        )
        .context("failed to inspect snapshot tables")?;
    if has_table == 1 {
        if !table_has_column(&conn, "observations", "region_code")? {
            bail!("snapshot observations table has no region_code column");
        }
        if !table_has_unique_key(&conn, "observations", OBSERVATION_KEY_COLUMNS)? {
            bail!("snapshot observations table lacks the unique observation key");
        }
    }

    ObservationStore::from_connection(conn)
}

/// Encode the store as a JSON envelope suitable for a text slot.
///
/// # Errors
/// Returns an error when the image cannot be exported or serialized.
pub fn encode_snapshot(store: &ObservationStore) -> Result<String> {
    let image = export_image(store)?;
    let envelope = SnapshotEnvelope {
        format: SNAPSHOT_FORMAT.to_string(),
        saved_at: now_rfc3339()?,
        sha256: sha256_hex(&image),
        bytes: image.len(),
        image: encode_image_blocks(&image)?,
    };
    serde_json::to_string(&envelope).context("failed to serialize snapshot envelope")
}

/// Decode an envelope written by [`encode_snapshot`] back into a store.
///
/// # Errors
/// Returns an error when the envelope is malformed, the format is unknown, the image
/// length or digest does not match, or the image fails [`import_image`].
pub fn decode_snapshot(text: &str) -> Result<ObservationStore> {
    let envelope: SnapshotEnvelope =
        serde_json::from_str(text).context("snapshot is not a valid envelope")?;
    if envelope.format != SNAPSHOT_FORMAT {
        bail!("unsupported snapshot format `{}`", envelope.format);
    }

    let image = general_purpose::STANDARD
        .decode(envelope.image.as_bytes())
        .context("snapshot image is not valid base64")?;
    if image.len() != envelope.bytes {
        return Err(anyhow!(
            "snapshot image is {} bytes, envelope declares {}",
            image.len(),
            envelope.bytes
        ));
    }
    let digest = sha256_hex(&image);
    if digest != envelope.sha256 {
        bail!("snapshot digest mismatch: expected {}, computed {digest}", envelope.sha256);
    }

    import_image(&image)
}

fn encode_image_blocks(image: &[u8]) -> Result<String> {
    let mut writer = EncoderStringWriter::new(&general_purpose::STANDARD);
    for block in image.chunks(ENCODE_BLOCK_BYTES) {
        writer.write_all(block).context("failed to encode snapshot block")?;
    }
    Ok(writer.into_inner())
}

fn restore_connection(path: &Path) -> Result<Connection> {
    let mut conn =
        Connection::open_in_memory().context("failed to open in-memory sqlite engine")?;
    conn.restore(DatabaseName::Main, path, None::<fn(rusqlite::backup::Progress)>)
        .with_context(|| format!("failed to restore snapshot image from {}", path.display()))?;
    Ok(conn)
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn scratch_path(purpose: &str) -> PathBuf {
    std::env::temp_dir().join(format!("firewatch-{purpose}-{}.sqlite3", Ulid::new()))
}

fn remove_scratch(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "failed to remove scratch image");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{observation, region};
    use crate::OBSERVATIONS_SCHEMA_SQL;

    fn seeded_store() -> Result<ObservationStore> {
        let mut store = ObservationStore::open_in_memory()?;
        store.replace_region(
            &region("BRA"),
            &[observation(-10.0, -50.0, 300.0), observation(-15.0, -45.0, 310.0)],
        )?;
        store.replace_region(&region("USA"), &[observation(40.0, -120.0, 330.0)])?;
        Ok(store)
    }

    #[test]
    fn snapshot_round_trip_keeps_rows_and_ids() -> Result<()> {
        let store = seeded_store()?;
        let regions = [region("BRA"), region("USA")];
        let before = store.read_regions(&regions)?;

        let text = encode_snapshot(&store)?;
        let mut restored = decode_snapshot(&text)?;
        assert_eq!(restored.read_regions(&regions)?, before);
        assert_eq!(restored.schema_version()?, SCHEMA_VERSION);

        // The restored store keeps accepting writes after its imported rows.
        restored.replace_region(&region("ARG"), &[observation(-34.0, -64.0, 305.0)])?;
        assert_eq!(restored.row_count()?, 4);
        Ok(())
    }

    #[test]
    fn envelope_records_digest_and_length() -> Result<()> {
        let store = seeded_store()?;
        let envelope: SnapshotEnvelope = serde_json::from_str(&encode_snapshot(&store)?)?;
        let image = general_purpose::STANDARD.decode(envelope.image.as_bytes())?;

        assert_eq!(envelope.format, SNAPSHOT_FORMAT);
        assert_eq!(envelope.bytes, image.len());
        assert_eq!(envelope.sha256, sha256_hex(&image));
        assert!(OffsetDateTime::parse(
            &envelope.saved_at,
            &time::format_description::well_known::Rfc3339
        )
        .is_ok());
        Ok(())
    }

    #[test]
    fn block_encoding_matches_one_shot_encoding() -> Result<()> {
        let image: Vec<u8> = (0..(ENCODE_BLOCK_BYTES * 2 + 17)).map(|i| (i % 251) as u8).collect();
        assert_eq!(encode_image_blocks(&image)?, general_purpose::STANDARD.encode(&image));
        Ok(())
    }

    #[test]
    fn tampered_or_truncated_snapshots_are_rejected() -> Result<()> {
        let store = seeded_store()?;
        let text = encode_snapshot(&store)?;

        assert!(decode_snapshot(&text[..text.len() / 2]).is_err());
        assert!(decode_snapshot("").is_err());
        assert!(decode_snapshot("not json at all").is_err());

        let mut envelope: SnapshotEnvelope = serde_json::from_str(&text)?;
        envelope.sha256 = sha256_hex(b"something else");
        assert!(decode_snapshot(&serde_json::to_string(&envelope)?).is_err());

        let mut envelope: SnapshotEnvelope = serde_json::from_str(&text)?;
        envelope.bytes += 1;
        assert!(decode_snapshot(&serde_json::to_string(&envelope)?).is_err());

        let mut envelope: SnapshotEnvelope = serde_json::from_str(&text)?;
        envelope.format = "firewatch-snapshot.v0".to_string();
        assert!(decode_snapshot(&serde_json::to_string(&envelope)?).is_err());
        Ok(())
    }

    #[test]
    fn garbage_image_with_valid_digest_is_rejected() -> Result<()> {
        let image = b"definitely not a sqlite database image".to_vec();
        let envelope = SnapshotEnvelope {
            format: SNAPSHOT_FORMAT.to_string(),
            saved_at: now_rfc3339()?,
            sha256: sha256_hex(&image),
            bytes: image.len(),
            image: general_purpose::STANDARD.encode(&image),
        };
        assert!(decode_snapshot(&serde_json::to_string(&envelope)?).is_err());
        assert!(import_image(&[]).is_err());
        Ok(())
    }

    #[test]
    fn image_from_a_newer_schema_is_rejected() -> Result<()> {
        let store = seeded_store()?;
        store.conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)?;
        let image = export_image(&store)?;
        assert!(import_image(&image).is_err());
        Ok(())
    }

    #[test]
    fn image_with_incompatible_observations_table_is_rejected() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("CREATE TABLE observations (id INTEGER PRIMARY KEY, latitude REAL);")?;
        let legacy = ObservationStore { conn };
        let image = export_image(&legacy)?;
        assert!(import_image(&image).is_err());
        Ok(())
    }

    #[test]
    fn image_without_the_unique_observation_key_is_rejected() -> Result<()> {
        let conn = Connection::open_in_memory()?;
        let keyless = OBSERVATIONS_SCHEMA_SQL.replace(
            ",\n  UNIQUE(region_code, latitude, longitude, acq_date, acq_time, satellite)",
            "",
        );
        assert_ne!(keyless, OBSERVATIONS_SCHEMA_SQL);
        conn.execute_batch(&keyless)?;
        let image = export_image(&ObservationStore { conn })?;

        let err = match import_image(&image) {
            Ok(_) => panic!("image without the unique key was accepted"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("unique observation key"), "{err:#}");
        Ok(())
    }
}
