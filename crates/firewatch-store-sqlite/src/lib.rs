use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use firewatch_core::{
    BoundingBox, BoundingBoxStats, Feature, FeatureCollection, FieldStats, ObservationRecord,
    RegionCode,
};
use rusqlite::types::ValueRef;
use rusqlite::{params, params_from_iter, Connection, Row, TransactionBehavior};

pub mod codec;
pub mod sandbox;
pub mod slot;

pub use sandbox::ScalarQueryError;

/// Version recorded in `PRAGMA user_version` for images written by this crate.
pub const SCHEMA_VERSION: i64 = 1;

/// Schema of the observations table, published so query authors can target it.
pub const OBSERVATIONS_SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS observations (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  region_code TEXT NOT NULL,
  latitude REAL NOT NULL,
  longitude REAL NOT NULL,
  brightness REAL NOT NULL,
  scan REAL,
  track REAL,
  acq_date TEXT NOT NULL,
  acq_time TEXT NOT NULL,
  satellite TEXT NOT NULL,
  confidence INTEGER,
  version TEXT,
  bright_t31 REAL,
  frp REAL,
  daynight TEXT,
  UNIQUE(region_code, latitude, longitude, acq_date, acq_time, satellite)
);

CREATE INDEX IF NOT EXISTS idx_observations_region_code ON observations(region_code);
CREATE INDEX IF NOT EXISTS idx_observations_lat_lon ON observations(latitude, longitude);
";

/// Composite key enforced by the engine; a later insert with the same key wins.
pub const OBSERVATION_KEY_COLUMNS: &[&str] =
    &["region_code", "latitude", "longitude", "acq_date", "acq_time", "satellite"];

const INSERT_OBSERVATION_SQL: &str = r"
INSERT OR REPLACE INTO observations(
  region_code, latitude, longitude, brightness, scan, track,
  acq_date, acq_time, satellite, confidence, version,
  bright_t31, frp, daynight
) VALUES (
  ?1, ?2, ?3, ?4, ?5, ?6,
  ?7, ?8, ?9, ?10, ?11,
  ?12, ?13, ?14
)";

const SELECT_OBSERVATION_COLUMNS: &str = "id, region_code, latitude, longitude, brightness, \
     scan, track, acq_date, acq_time, satellite, confidence, version, bright_t31, frp, daynight";

const BOX_STATS_COLUMNS: &str = "COUNT(*), \
     AVG(brightness), MIN(brightness), MAX(brightness), \
     AVG(frp), MIN(frp), MAX(frp), \
     AVG(scan), MIN(scan), MAX(scan), \
     AVG(track), MIN(track), MAX(track)";

/// Embedded relational cache of fire observations, partitioned by region.
///
/// The connection never leaves this crate; every mutation is a whole-region replace
/// or a full clear.
pub struct ObservationStore {
    conn: Connection,
}

impl ObservationStore {
    /// Open an empty in-memory store with the observation schema in place.
    ///
    /// # Errors
    /// Returns an error when the engine cannot be opened or the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("failed to open in-memory sqlite engine")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create the table and indices if absent. Safe to call repeatedly.
    ///
    /// # Errors
    /// Returns an error when schema statements fail.
    pub fn ensure_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(OBSERVATIONS_SCHEMA_SQL)
            .context("failed to apply observations schema")?;
        self.conn
            .pragma_update(None, "user_version", SCHEMA_VERSION)
            .context("failed to record schema version")?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the pragma cannot be read.
    pub fn schema_version(&self) -> Result<i64> {
        self.conn
            .query_row("PRAGMA user_version", [], |row| row.get::<_, i64>(0))
            .context("failed to read schema version")
    }

    /// Replace every stored row of `region` with `rows` in one transaction.
    ///
    /// Rows are inserted in batch order with insert-or-replace, so a later row with the
    /// same composite key wins. Returns the number of rows stored for the region after
    /// commit. Any failure rolls back and leaves the previous rows in place.
    ///
    /// # Errors
    /// Returns an error when any statement in the transaction fails.
    pub fn replace_region(
        &mut self,
        region: &RegionCode,
        rows: &[ObservationRecord],
    ) -> Result<usize> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start replace transaction")?;

        tx.execute("DELETE FROM observations WHERE region_code = ?1", params![region.as_str()])
            .with_context(|| format!("failed to delete observations for region {region}"))?;

        {
            let mut insert = tx
                .prepare(INSERT_OBSERVATION_SQL)
                .context("failed to prepare observation insert")?;
            for (index, row) in rows.iter().enumerate() {
                insert
                    .execute(params![
                        region.as_str(),
                        row.latitude,
                        row.longitude,
                        row.brightness,
                        row.scan,
                        row.track,
                        row.acq_date,
                        row.acq_time,
                        row.satellite,
                        row.confidence,
                        row.version,
                        row.bright_t31,
                        row.frp,
                        row.daynight,
                    ])
                    .with_context(|| {
                        format!("failed to insert observation #{index} for region {region}")
                    })?;
            }
        }

        let stored = count_rows(
            &tx,
            "SELECT COUNT(*) FROM observations WHERE region_code = ?1",
            params![region.as_str()],
        )?;
        tx.commit().context("failed to commit replace transaction")?;

        tracing::debug!(region = %region, batch = rows.len(), stored, "replaced region observations");
        Ok(stored)
    }

    /// Export each requested region as a FeatureCollection, ordered by row id.
    ///
    /// Every requested region is present in the result, empty when it has no rows.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn read_regions(
        &self,
        regions: &[RegionCode],
    ) -> Result<BTreeMap<String, FeatureCollection>> {
        let mut collections: BTreeMap<String, FeatureCollection> = regions
            .iter()
            .map(|region| (region.as_str().to_string(), FeatureCollection::empty()))
            .collect();
        if regions.is_empty() {
            return Ok(collections);
        }

        let placeholders =
            (1..=regions.len()).map(|index| format!("?{index}")).collect::<Vec<_>>().join(",");
        let sql = format!(
            "SELECT {SELECT_OBSERVATION_COLUMNS} FROM observations
             WHERE region_code IN ({placeholders})
             ORDER BY id ASC"
        );
        let mut stmt = self.conn.prepare(&sql).context("failed to prepare region export")?;
        let mut rows = stmt
            .query(params_from_iter(regions.iter().map(RegionCode::as_str)))
            .context("failed to query region export")?;

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let region: String = row.get(1)?;
            let record = read_observation(row, 2)?;
            collections
                .entry(region)
                .or_default()
                .features
                .push(Feature::from_observation(id, &record));
        }

        Ok(collections)
    }

    /// Aggregate statistics over every region for rows inside `bbox`.
    ///
    /// Null values are left out of a field's avg/min/max but still counted. An empty
    /// match yields `count = 0` and no statistics.
    ///
    /// # Errors
    /// Returns an error when the aggregate query fails.
    pub fn count_in_box(&self, bbox: &BoundingBox) -> Result<BoundingBoxStats> {
        let (lat_min, lat_max) = bbox.latitude_range();
        let longitude_clause = if bbox.wraps_antimeridian() {
            "(longitude >= ?3 OR longitude <= ?4)"
        } else {
            "longitude BETWEEN ?3 AND ?4"
        };
        let sql = format!(
            "SELECT {BOX_STATS_COLUMNS} FROM observations
             WHERE latitude BETWEEN ?1 AND ?2 AND {longitude_clause}"
        );

        let (count, stats) = self
            .conn
            .query_row(&sql, params![lat_min, lat_max, bbox.west, bbox.east], |row| {
                let count: i64 = row.get(0)?;
                Ok((
                    count,
                    BoundingBoxStats {
                        count: 0,
                        brightness: read_field_stats(row, 1)?,
                        frp: read_field_stats(row, 4)?,
                        scan: read_field_stats(row, 7)?,
                        track: read_field_stats(row, 10)?,
                    },
                ))
            })
            .context("failed to aggregate observations in bounding box")?;

        let count = u64::try_from(count).context("negative observation count")?;
        if count == 0 {
            return Ok(BoundingBoxStats::default());
        }
        Ok(BoundingBoxStats { count, ..stats })
    }

    /// Run an untrusted scalar query inside the sandbox and return its single number.
    ///
    /// # Errors
    /// Returns `ScalarQueryError::Rejected` for anything other than a single read-only
    /// `SELECT` yielding one row with one numeric column, and `ScalarQueryError::Guard`
    /// when query_only mode cannot be entered or left.
    pub fn run_scalar(&self, sql: &str) -> Result<f64, ScalarQueryError> {
        let statement_sql = sandbox::validate_scalar_query(sql)?;
        let guard = sandbox::QueryOnlyGuard::enable(&self.conn)?;
        let value = self.query_scalar(statement_sql);
        guard.release()?;
        value
    }

    fn query_scalar(&self, statement_sql: &str) -> Result<f64, ScalarQueryError> {
        let mut stmt = self
            .conn
            .prepare(statement_sql)
            .map_err(|err| ScalarQueryError::Rejected(format!("query does not compile: {err}")))?;
        if !stmt.readonly() {
            return Err(ScalarQueryError::Rejected("statement is not read-only".to_string()));
        }
        if stmt.column_count() != 1 {
            return Err(ScalarQueryError::Rejected(format!(
                "query must return exactly one column, found {}",
                stmt.column_count()
            )));
        }

        let mut rows = stmt.query([])?;
        let value = {
            let Some(row) = rows.next()? else {
                return Err(ScalarQueryError::Rejected("query returned no rows".to_string()));
            };
            numeric_value(row.get_ref(0)?)?
        };
        if rows.next()?.is_some() {
            return Err(ScalarQueryError::Rejected(
                "query must return exactly one row".to_string(),
            ));
        }
        Ok(value)
    }

    /// Delete every row of every region. Returns the number of rows removed.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear(&mut self) -> Result<usize> {
        self.conn.execute("DELETE FROM observations", []).context("failed to clear observations")
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn row_count(&self) -> Result<usize> {
        count_rows(&self.conn, "SELECT COUNT(*) FROM observations", [])
    }

    /// Number of stored rows per region code.
    ///
    /// # Errors
    /// Returns an error when the grouping query fails.
    pub fn region_counts(&self) -> Result<BTreeMap<String, usize>> {
        let mut stmt = self.conn.prepare(
            "SELECT region_code, COUNT(*) FROM observations GROUP BY region_code ORDER BY region_code",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (region, count) = row?;
            counts.insert(region, usize::try_from(count).context("negative region count")?);
        }
        Ok(counts)
    }

    /// Run `PRAGMA quick_check`; `Ok(true)` when the engine reports `ok`.
    ///
    /// # Errors
    /// Returns an error when the pragma cannot run.
    pub fn integrity_check(&self) -> Result<bool> {
        let message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .context("failed to run PRAGMA quick_check")?;
        Ok(message == "ok")
    }
}

fn count_rows<P: rusqlite::Params>(conn: &Connection, sql: &str, params: P) -> Result<usize> {
    let count: i64 = conn
        .query_row(sql, params, |row| row.get(0))
        .with_context(|| format!("failed to count rows: {sql}"))?;
    usize::try_from(count).map_err(|_| anyhow!("negative row count from: {sql}"))
}

fn read_observation(row: &Row<'_>, offset: usize) -> rusqlite::Result<ObservationRecord> {
    Ok(ObservationRecord {
        latitude: row.get(offset)?,
        longitude: row.get(offset + 1)?,
        brightness: row.get(offset + 2)?,
        scan: row.get(offset + 3)?,
        track: row.get(offset + 4)?,
        acq_date: row.get(offset + 5)?,
        acq_time: row.get(offset + 6)?,
        satellite: row.get(offset + 7)?,
        confidence: row.get(offset + 8)?,
        version: row.get(offset + 9)?,
        bright_t31: row.get(offset + 10)?,
        frp: row.get(offset + 11)?,
        daynight: row.get(offset + 12)?,
    })
}

fn read_field_stats(row: &Row<'_>, offset: usize) -> rusqlite::Result<FieldStats> {
    Ok(FieldStats { avg: row.get(offset)?, min: row.get(offset + 1)?, max: row.get(offset + 2)? })
}

fn numeric_value(value: ValueRef<'_>) -> Result<f64, ScalarQueryError> {
    match value {
        ValueRef::Integer(number) => {
            #[allow(clippy::cast_precision_loss)]
            let number = number as f64;
            Ok(number)
        }
        ValueRef::Real(number) if number.is_finite() => Ok(number),
        ValueRef::Real(_) => {
            Err(ScalarQueryError::Rejected("query returned a non-finite number".to_string()))
        }
        ValueRef::Null => Err(ScalarQueryError::Rejected("query returned NULL".to_string())),
        ValueRef::Text(_) | ValueRef::Blob(_) => {
            Err(ScalarQueryError::Rejected("query returned a non-numeric value".to_string()))
        }
    }
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table}"))?;
    if exists != 1 {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

/// True when `table` has a unique index over exactly `columns`, in any order.
fn table_has_unique_key(conn: &Connection, table: &str, columns: &[&str]) -> Result<bool> {
    let mut indexes = conn
        .prepare(r#"SELECT name, "unique" FROM pragma_index_list(?1)"#)
        .with_context(|| format!("failed to list indexes of {table}"))?;
    let unique_indexes = indexes
        .query_map(params![table], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut wanted: Vec<&str> = columns.to_vec();
    wanted.sort_unstable();
    let mut index_columns =
        conn.prepare("SELECT name FROM pragma_index_info(?1)").context("failed to inspect index")?;
    for (index, unique) in unique_indexes {
        if unique != 1 {
            continue;
        }
        let mut found = index_columns
            .query_map(params![index], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        found.sort_unstable();
        if found.iter().map(String::as_str).eq(wanted.iter().copied()) {
            return Ok(true);
        }
    }
    Ok(false)
}
