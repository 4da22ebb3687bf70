//! Parquet snapshots of a run's recipes and offerings, plus a sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use dnh_core::{NutrientSlot, VenueSnapshot};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Write `snapshots/{recipes,offerings}.parquet` under `reports_dir` and return the manifest path.
pub fn export_parquet_snapshots(reports_dir: &Path, snapshots: &[VenueSnapshot]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir).with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let recipes_path = snapshot_dir.join("recipes.parquet");
    let offerings_path = snapshot_dir.join("offerings.parquet");
    write_recipes_parquet(&recipes_path, snapshots)?;
    write_offerings_parquet(&offerings_path, snapshots)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("recipes", reports_dir, &recipes_path)?,
            manifest_entry("offerings", reports_dir, &offerings_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes).with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn nutrient_status(slot: &NutrientSlot) -> &'static str {
    match slot {
        NutrientSlot::Pending => "pending",
        NutrientSlot::Populated(_) => "populated",
        NutrientSlot::Failed { .. } => "failed",
    }
}

fn write_recipes_parquet(path: &Path, snapshots: &[VenueSnapshot]) -> Result<()> {
    let rows: Vec<_> = snapshots
        .iter()
        .flat_map(|s| s.recipes.iter().map(move |r| (s.key.as_str(), r)))
        .collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("venue_key", DataType::Utf8, false),
        ArrowField::new("harvest_date", DataType::Utf8, false),
        ArrowField::new("remote_id", DataType::Int64, false),
        ArrowField::new("uuid", DataType::Utf8, false),
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("menu_id", DataType::Int64, false),
        ArrowField::new("meal_id", DataType::Int64, false),
        ArrowField::new("nutrient_status", DataType::Utf8, false),
        ArrowField::new("calories", DataType::Utf8, true),
        ArrowField::new("vegetarian", DataType::Boolean, false),
        ArrowField::new("vegan", DataType::Boolean, false),
        ArrowField::new("gluten_free", DataType::Boolean, false),
    ]));

    let flags: Vec<_> = rows.iter().map(|(_, r)| r.dietary_flags()).collect();
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(rows.iter().map(|(k, _)| *k).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, r)| r.date.to_string()).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(rows.iter().map(|(_, r)| r.remote_id).collect::<Vec<_>>())),
            Arc::new(StringArray::from(rows.iter().map(|(_, r)| r.identity()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, r)| r.display_name()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, r)| r.category.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(rows.iter().map(|(_, r)| r.menu_id).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|(_, r)| r.meal_id).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                rows.iter().map(|(_, r)| nutrient_status(&r.nutrients)).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                rows.iter()
                    .map(|(_, r)| r.nutrients.facts().and_then(|f| f.calories.amount.as_deref()))
                    .collect::<Vec<_>>(),
            )),
            Arc::new(BooleanArray::from(flags.iter().map(|f| f.vegetarian).collect::<Vec<_>>())),
            Arc::new(BooleanArray::from(flags.iter().map(|f| f.vegan).collect::<Vec<_>>())),
            Arc::new(BooleanArray::from(flags.iter().map(|f| f.gluten_free).collect::<Vec<_>>())),
        ],
    )
    .context("building recipes record batch")?;
    write_parquet(path, batch)
}

fn write_offerings_parquet(path: &Path, snapshots: &[VenueSnapshot]) -> Result<()> {
    let offerings: Vec<_> = snapshots.iter().flat_map(|s| s.offerings.iter()).collect();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("uuid", DataType::Utf8, false),
        ArrowField::new("venue_key", DataType::Utf8, false),
        ArrowField::new("date", DataType::Utf8, false),
        ArrowField::new("menu_name", DataType::Utf8, false),
        ArrowField::new("meal_name", DataType::Utf8, false),
        ArrowField::new("recipe_count", DataType::UInt32, false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(offerings.iter().map(|o| o.uuid.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                offerings.iter().map(|o| o.venue_key.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                offerings.iter().map(|o| o.date.to_string()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                offerings.iter().map(|o| o.menu_name.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                offerings.iter().map(|o| o.meal_name.as_str()).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                offerings
                    .iter()
                    .map(|o| o.recipe_refs.len() as u32)
                    .collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building offerings record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let rel = path.strip_prefix(reports_dir).unwrap_or(path).display().to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use dnh_core::{Meal, Menu, Offering, Recipe};
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn row_count(path: &Path) -> usize {
        let file = File::open(path).expect("open parquet");
        ParquetRecordBatchReaderBuilder::try_new(file)
            .expect("reader")
            .build()
            .expect("build")
            .map(|batch| batch.expect("batch").num_rows())
            .sum()
    }

    #[test]
    fn writes_both_tables_and_a_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let date = NaiveDate::from_ymd_opt(2015, 9, 26).expect("date");
        let menu = Menu { id: 27, name: "Entrees".into() };
        let meal = Meal { id: 1, name: "Lunch".into(), code: "L".into(), start_time: 660, end_time: 840 };
        let recipe = |remote_id| Recipe {
            remote_id,
            name: "Tofu Bowl [vg]".into(),
            category: "Bowls".into(),
            rank: 1,
            mm_id: 2,
            menu_id: 27,
            meal_id: 1,
            date,
            nutrients: NutrientSlot::Pending,
        };
        let mut offering = Offering::new("CYC", date, &menu, &meal);
        offering.recipe_refs = vec!["a".into(), "b".into()];
        let snapshot = VenueSnapshot {
            key: "CYC".into(),
            name: "Courtyard Cafe".into(),
            session: "CYC.s".into(),
            harvest_date: date,
            menus: vec![menu.clone()],
            meals: vec![meal.clone()],
            recipes: vec![recipe(1), recipe(2), recipe(3)],
            offerings: vec![offering],
        };

        let manifest_path = export_parquet_snapshots(dir.path(), &[snapshot]).expect("export");

        let manifest: ParquetManifest =
            serde_json::from_slice(&std::fs::read(&manifest_path).expect("read")).expect("manifest");
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].path, "snapshots/recipes.parquet");
        assert_eq!(manifest.files[0].sha256.len(), 64);
        assert_eq!(row_count(&dir.path().join("snapshots/recipes.parquet")), 3);
        assert_eq!(row_count(&dir.path().join("snapshots/offerings.parquet")), 1);
    }

    #[test]
    fn empty_runs_still_produce_readable_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        export_parquet_snapshots(dir.path(), &[]).expect("export");
        assert_eq!(row_count(&dir.path().join("snapshots/recipes.parquet")), 0);
    }
}
