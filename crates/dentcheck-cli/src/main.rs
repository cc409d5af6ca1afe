use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use dentcheck_contracts::assessment::AssessmentRecord;
use dentcheck_contracts::cache::CacheStore;
use dentcheck_contracts::events::EventWriter;
use dentcheck_contracts::vocab::CategoryRegistry;
use dentcheck_engine::{
    assessment_cache_key, assessment_prompt, decode_oriented_image, mime_for_extension,
    process_reply_with_overlay, GeminiAssessor, ImageDimensions, DEFAULT_ASSESSMENT_MODEL,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "dentcheck", version, about = "Vehicle damage assessment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Assess a vehicle photo, either live against Gemini or by replaying a
    /// saved model reply.
    Assess(AssessArgs),
    /// Print the fixed damage vocabulary.
    Categories,
}

#[derive(Debug, Parser)]
struct AssessArgs {
    /// Vehicle photo to assess.
    #[arg(long)]
    image: PathBuf,
    /// Replay a saved raw model reply instead of calling the model.
    #[arg(long)]
    reply: Option<PathBuf>,
    #[arg(long, default_value = DEFAULT_ASSESSMENT_MODEL)]
    model: String,
    /// Directory for assessment.json and annotated.png.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Append pipeline events to this events.jsonl file.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Memoize assessments in this JSON cache file.
    #[arg(long)]
    cache: Option<PathBuf>,
    #[arg(long)]
    pretty: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Assess(args) => run_assess(args),
        Command::Categories => {
            for name in CategoryRegistry::new().names() {
                println!("{name}");
            }
            Ok(())
        }
    }
}

fn run_assess(args: AssessArgs) -> Result<()> {
    let image_bytes = fs::read(&args.image)
        .with_context(|| format!("failed reading {}", args.image.display()))?;
    let image = decode_oriented_image(&image_bytes)?;
    let dims = ImageDimensions {
        width: image.width(),
        height: image.height(),
    };

    let request_id = Uuid::new_v4().to_string();
    let events = args
        .events
        .as_ref()
        .map(|path| EventWriter::new(path, &request_id));
    emit_event(
        &events,
        "assessment_started",
        json!({
            "image": args.image.display().to_string(),
            "model": args.model,
            "image_width": dims.width,
            "image_height": dims.height,
        }),
    )?;

    let prompt = assessment_prompt(dims);
    let cache_key = assessment_cache_key(&image_bytes, &args.model, &prompt);
    if let Some(path) = &args.cache {
        let mut cache = CacheStore::new(path);
        if let Some(hit) = cache.get(&cache_key) {
            emit_event(&events, "cache_hit", json!({ "key": cache_key }))?;
            return print_payload(&hit, args.pretty);
        }
    }

    let mut warnings = Vec::new();
    let raw_reply = match &args.reply {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?,
        None => GeminiAssessor::new().request_reply(
            &image_bytes,
            mime_for_image(&args.image),
            dims,
            &args.model,
            &mut warnings,
        )?,
    };
    emit_event(
        &events,
        "reply_received",
        json!({
            "source": if args.reply.is_some() { "replay" } else { "gemini" },
            "chars": raw_reply.chars().count(),
        }),
    )?;

    let outcome = process_reply_with_overlay(&raw_reply, &image)?;
    warnings.extend(outcome.warnings.iter().cloned());
    emit_event(
        &events,
        "boxes_validated",
        json!({ "accepted": outcome.boxes.len() }),
    )?;
    if outcome.payload.contains_key("annotated_image_base64") {
        emit_event(&events, "overlay_rendered", json!({}))?;
    }

    let record = AssessmentRecord::from_value(Value::Object(outcome.payload.clone()))?;
    for label in CategoryRegistry::new().unknown_labels(&record.damage_type) {
        warnings.push(format!(
            "damage_type label '{label}' is outside the fixed vocabulary."
        ));
    }

    if let Some(path) = &args.cache {
        CacheStore::new(path).set(&cache_key, cacheable_payload(&outcome.payload))?;
    }

    if let Some(out_dir) = &args.out {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed creating {}", out_dir.display()))?;
        fs::write(
            out_dir.join("assessment.json"),
            serde_json::to_string_pretty(&Value::Object(outcome.payload.clone()))?,
        )?;
        if let Some(encoded) = record.annotated_image_base64.as_deref() {
            let bytes = BASE64
                .decode(encoded)
                .context("annotated image base64 decode failed")?;
            fs::write(out_dir.join("annotated.png"), bytes)?;
        }
    }

    for warning in &warnings {
        eprintln!("warning: {warning}");
    }
    emit_event(
        &events,
        "assessment_completed",
        json!({
            "severity": outcome.payload.get("severity").cloned().unwrap_or(Value::Null),
            "accepted_boxes": outcome.boxes.len(),
            "warnings": warnings.len(),
        }),
    )?;

    print_payload(&outcome.payload, args.pretty)
}

fn emit_event(events: &Option<EventWriter>, event_type: &str, payload: Value) -> Result<()> {
    if let Some(writer) = events {
        writer.emit(
            event_type,
            payload.as_object().cloned().unwrap_or_default(),
        )?;
    }
    Ok(())
}

fn mime_for_image(path: &Path) -> &'static str {
    path.extension()
        .and_then(|value| value.to_str())
        .and_then(mime_for_extension)
        .unwrap_or("image/jpeg")
}

/// The annotated PNG is large and cheap to re-render; cache everything else.
fn cacheable_payload(payload: &Map<String, Value>) -> Map<String, Value> {
    let mut cached = payload.clone();
    cached.remove("annotated_image_base64");
    cached
}

fn print_payload(payload: &Map<String, Value>, pretty: bool) -> Result<()> {
    let value = Value::Object(payload.clone());
    let rendered = if pretty {
        serde_json::to_string_pretty(&value)?
    } else {
        serde_json::to_string(&value)?
    };
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use serde_json::json;

    use super::{cacheable_payload, mime_for_image};

    #[test]
    fn cacheable_payload_strips_annotation_only() {
        let payload = json!({
            "damage_detected": "Yes",
            "bboxes": [{"x": 1, "y": 2, "width": 3, "height": 4}],
            "annotated_image_base64": "AAAA",
        })
        .as_object()
        .cloned()
        .unwrap();
        let cached = cacheable_payload(&payload);
        assert!(!cached.contains_key("annotated_image_base64"));
        assert_eq!(cached.get("damage_detected"), Some(&json!("Yes")));
        assert_eq!(payload.len(), 3);
    }

    #[test]
    fn mime_falls_back_to_jpeg() {
        assert_eq!(mime_for_image(Path::new("car.png")), "image/png");
        assert_eq!(mime_for_image(Path::new("car.JPG")), "image/jpeg");
        assert_eq!(mime_for_image(Path::new("car.heic")), "image/jpeg");
        assert_eq!(mime_for_image(Path::new("car")), "image/jpeg");
    }
}
