/// Post collection dumps to a Mad Dash REST server
///
/// Each argument is a JSON dump (or a directory searched recursively for
/// them). A dump maps histogram names to histogram objects, plus an optional
/// `filelist` entry `{"files": [...]}`. The file stem names the collection.

use anyhow::{bail, Context, Result};
use maddash::histogram::FILELIST_NAME;
use serde_json::{json, Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

struct Client {
    http: reqwest::Client,
    base_url: String,
    token: String,
    database: String,
    update: bool,
}

impl Client {
    async fn post(&self, route: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url.trim_end_matches('/'), route))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {} failed", route))?;

        let status = response.status();
        let payload: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            bail!("POST {} returned {}: {}", route, status, payload);
        }
        Ok(payload)
    }

    async fn post_files(&self, collection: &str, files: &Value) -> Result<()> {
        let body = json!({
            "database": self.database,
            "collection": collection,
            "files": files,
            "update": self.update,
        });
        let response = self.post("/files/names", &body).await?;
        debug!("POST response: {}", response);
        Ok(())
    }

    async fn post_histogram(&self, collection: &str, histogram: &Value) -> Result<()> {
        let body = json!({
            "database": self.database,
            "collection": collection,
            "histogram": histogram,
            "update": self.update,
        });
        let response = self.post("/histogram", &body).await?;
        debug!("POST response: {}", response);
        Ok(())
    }
}

/// Every `.json` file named by `paths`, directories expanded recursively
fn collect_dumps(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut dumps = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut children: Vec<PathBuf> = fs::read_dir(path)
                .with_context(|| format!("cannot read directory {}", path.display()))?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<std::io::Result<_>>()?;
            children.sort();
            dumps.extend(
                collect_dumps(&children)?
                    .into_iter()
                    .filter(|p| p.extension().and_then(|s| s.to_str()) == Some("json")),
            );
        } else if path.is_file() {
            dumps.push(path.clone());
        } else {
            warn!("Skipping {} (not a file or directory)", path.display());
        }
    }
    Ok(dumps)
}

fn collection_name(path: &Path) -> Result<String> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .with_context(|| format!("cannot derive a collection name from {}", path.display()))
}

async fn ingest(client: &Client, path: &Path) -> Result<usize> {
    let collection = collection_name(path)?;
    let content = fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let dump: Map<String, Value> = serde_json::from_str(&content)
        .with_context(|| format!("{} is not a JSON object", path.display()))?;

    if let Some(files) = dump.get(FILELIST_NAME).and_then(|entry| entry.get("files")) {
        if files.as_array().map_or(false, |f| !f.is_empty()) {
            client.post_files(&collection, files).await?;
            info!("POSTed filelist to {} (db: {})", collection, client.database);
        } else {
            info!("No files in filelist of {}", collection);
        }
    }

    let mut posted = 0;
    for (name, histogram) in dump.iter().filter(|(name, _)| name.as_str() != FILELIST_NAME) {
        client
            .post_histogram(&collection, histogram)
            .await
            .with_context(|| format!("histogram '{}' of {}", name, collection))?;
        posted += 1;
    }
    info!("POSTed {} histograms to {} (db: {})", posted, collection, client.database);
    Ok(posted)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_target(false).init();

    let paths: Vec<PathBuf> = std::env::args().skip(1).map(PathBuf::from).collect();
    if paths.is_empty() {
        bail!("usage: ingest-collections <dump.json | directory>...");
    }

    let client = Client {
        http: reqwest::Client::new(),
        base_url: std::env::var("MAD_DASH_URL").unwrap_or_else(|_| "http://127.0.0.1:8080".to_string()),
        token: std::env::var("MAD_DASH_TOKEN").context("MAD_DASH_TOKEN environment variable is required")?,
        database: std::env::var("MAD_DASH_DATABASE").unwrap_or_else(|_| "simprod_histos".to_string()),
        update: std::env::var("MAD_DASH_UPDATE")
            .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false),
    };

    let dumps = collect_dumps(&paths)?;
    info!("Found {} collection dumps", dumps.len());

    let mut total = 0;
    for dump in &dumps {
        total += ingest(&client, dump).await?;
    }

    info!("✅ Done: {} histograms from {} collections", total, dumps.len());
    Ok(())
}
