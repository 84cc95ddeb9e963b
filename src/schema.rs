use std::{fs, path::Path};

use anyhow::Result;
use hitl_protocol::{HitlRequest, HitlResponse, ReviewOutcome, WsEvent};
use schemars::{JsonSchema, schema_for};

/// Emit a JSON Schema for every wire message into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>> {
    fs::create_dir_all(out_dir)?;
    Ok(vec![
        write_one::<HitlRequest>(out_dir, "hitl-request")?,
        write_one::<HitlResponse>(out_dir, "hitl-response")?,
        write_one::<ReviewOutcome>(out_dir, "review-outcome")?,
        write_one::<WsEvent>(out_dir, "ws-event")?,
    ])
}

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<String> {
    let schema = schema_for!(T);
    let filename = format!("{}.schema.json", name);
    fs::write(out_dir.join(&filename), serde_json::to_string_pretty(&schema)?)?;
    Ok(filename)
}
