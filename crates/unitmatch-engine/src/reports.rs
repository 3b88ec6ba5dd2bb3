//! Per-run report directory: JSON payload, Markdown brief and Parquet
//! snapshots with a SHA-256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{ArrayRef, Float64Array, Int32Array, Int64Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::info;

use crate::{MatchOutput, ScoredPair};

pub const OUTPUT_FILE: &str = "match_output.json";
pub const BRIEF_FILE: &str = "match_brief.md";

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub matcher_run_key: String,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub dir: PathBuf,
    pub output_path: PathBuf,
    pub manifest_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ReportWriter {
    root: PathBuf,
}

impl ReportWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn run_dir(&self, output: &MatchOutput) -> PathBuf {
        self.root.join(output.matcher_run_key.to_string())
    }

    pub async fn write(&self, output: &MatchOutput) -> Result<RunReport> {
        let dir = self.run_dir(output);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        let output_path = dir.join(OUTPUT_FILE);
        let json = serde_json::to_vec_pretty(output).context("serializing match output")?;
        fs::write(&output_path, json)
            .await
            .with_context(|| format!("writing {}", output_path.display()))?;

        fs::write(dir.join(BRIEF_FILE), render_brief(output))
            .await
            .with_context(|| format!("writing {BRIEF_FILE}"))?;

        let manifest_path = export_parquet_snapshots(&dir, output).await?;
        info!(dir = %dir.display(), "run report written");

        Ok(RunReport {
            dir,
            output_path,
            manifest_path,
        })
    }
}

pub fn render_brief(output: &MatchOutput) -> String {
    let s = &output.input_summary;
    let mut lines = vec![
        "# Listing Match Brief".to_string(),
        String::new(),
        format!("- Collection run: `{}`", output.run_id),
        format!("- Matcher run: `{}`", output.matcher_run_key),
        format!("- Rules: {}", output.rules_snapshot.algorithm_version),
        format!("- Started: {}", output.started_at),
        format!("- Generated: {}", output.generated_at),
        format!("- Listings: {}", s.count),
        format!("- Candidate pairs: {}", s.candidate_pairs),
        format!("- Auto match: {}", s.auto_match),
        format!("- Review required: {}", s.review_required),
        format!("- Distinct: {}", s.distinct),
        format!("- Merged groups: {}", s.merged_groups),
    ];

    if !s.oversized_wildcard_buckets.is_empty() {
        lines.push(String::new());
        lines.push("## Oversized Wildcard Buckets".to_string());
        for bucket in &s.oversized_wildcard_buckets {
            lines.push(format!(
                "- `{}`: {} listings, paired first {}",
                bucket.key, bucket.size, bucket.cap
            ));
        }
    }

    if !output.match_groups.is_empty() {
        lines.push(String::new());
        lines.push("## Groups".to_string());
        for group in &output.match_groups {
            let members = group
                .members
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("- {} ({}): {}", group.canonical_key, group.member_count, members));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshots(dir: &Path, output: &MatchOutput) -> Result<PathBuf> {
    let snapshot_dir = dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let pairs_path = snapshot_dir.join("match_pairs.parquet");
    let groups_path = snapshot_dir.join("match_group_members.parquet");
    write_pairs_parquet(&pairs_path, output)?;
    write_group_members_parquet(&groups_path, output)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        matcher_run_key: output.matcher_run_key.to_string(),
        files: vec![
            manifest_entry("match_pairs", dir, &pairs_path)?,
            manifest_entry("match_group_members", dir, &groups_path)?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
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

fn write_pairs_parquet(path: &Path, output: &MatchOutput) -> Result<()> {
    let pairs = &output.pairs;
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_listing_id", DataType::Int64, false),
        ArrowField::new("target_listing_id", DataType::Int64, false),
        ArrowField::new("score", DataType::Int32, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("address_score", DataType::Float64, false),
        ArrowField::new("distance_score", DataType::Float64, false),
        ArrowField::new("area_score", DataType::Float64, false),
        ArrowField::new("price_score", DataType::Float64, false),
        ArrowField::new("attribute_score", DataType::Float64, false),
        ArrowField::new("distance_m", DataType::Float64, true),
    ]));

    let f64_col = |f: fn(&ScoredPair) -> f64| -> ArrayRef {
        Arc::new(Float64Array::from(pairs.iter().map(f).collect::<Vec<_>>()))
    };

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                pairs.iter().map(|p| p.source_listing_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int64Array::from(
                pairs.iter().map(|p| p.target_listing_id).collect::<Vec<_>>(),
            )),
            Arc::new(Int32Array::from(pairs.iter().map(|p| p.score).collect::<Vec<_>>())),
            Arc::new(StringArray::from(
                pairs.iter().map(|p| Some(p.status.as_str())).collect::<Vec<_>>(),
            )),
            f64_col(|p| p.address_score),
            f64_col(|p| p.distance_score),
            f64_col(|p| p.area_score),
            f64_col(|p| p.price_score),
            f64_col(|p| p.attribute_score),
            Arc::new(Float64Array::from(
                pairs.iter().map(|p| p.reason.distance_m).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building match_pairs record batch")?;
    write_parquet(path, batch)
}

fn write_group_members_parquet(path: &Path, output: &MatchOutput) -> Result<()> {
    let rows = output
        .match_groups
        .iter()
        .flat_map(|g| {
            g.member_scores
                .iter()
                .map(move |m| (g.group_id as u32, g.canonical_key.as_str(), m.listing_id, m.score))
        })
        .collect::<Vec<_>>();

    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("group_id", DataType::UInt32, false),
        ArrowField::new("canonical_key", DataType::Utf8, false),
        ArrowField::new("listing_id", DataType::Int64, false),
        ArrowField::new("member_score", DataType::Int32, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(UInt32Array::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
            Arc::new(StringArray::from(rows.iter().map(|r| Some(r.1)).collect::<Vec<_>>())),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.2).collect::<Vec<_>>())),
            Arc::new(Int32Array::from(rows.iter().map(|r| r.3).collect::<Vec<_>>())),
        ],
    )
    .context("building match_group_members record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, dir: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(dir).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MatchEngine, RulesConfig};
    use tempfile::tempdir;
    use unitmatch_core::{InputDocument, Listing};

    fn output() -> MatchOutput {
        let twin = |id| Listing {
            address_code: Some("1168010100".into()),
            rent_amount: Some(50.0),
            area_exclusive_m2: Some(33.0),
            lat: Some(37.5),
            lng: Some(127.0),
            ..Listing::with_id(id)
        };
        MatchEngine::new(RulesConfig::default())
            .run(&InputDocument {
                run_id: "collect-7".into(),
                listings: vec![twin(1), twin(2)],
            })
            .unwrap()
    }

    #[tokio::test]
    async fn report_directory_has_payload_brief_and_snapshots() {
        let dir = tempdir().expect("tempdir");
        let output = output();
        let report = ReportWriter::new(dir.path()).write(&output).await.expect("report");

        assert_eq!(report.dir, dir.path().join(output.matcher_run_key.to_string()));
        let payload: MatchOutput =
            serde_json::from_slice(&std::fs::read(&report.output_path).unwrap()).unwrap();
        assert_eq!(payload, output);

        let brief = std::fs::read_to_string(report.dir.join(BRIEF_FILE)).unwrap();
        assert!(brief.contains("collect-7"));
        assert!(brief.contains("- Merged groups: 1"));

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&report.manifest_path).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 2);
        for file in files {
            let path = report.dir.join(file["path"].as_str().unwrap());
            assert!(path.exists());
            assert_eq!(file["sha256"].as_str().unwrap().len(), 64);
        }
    }
}
