use std::env;
use std::io::Cursor;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dentcheck_contracts::assessment::BBox;
use dentcheck_contracts::error::AssessError;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};

pub const DEFAULT_ASSESSMENT_MODEL: &str = "gemini-2.5-pro";

pub const SYSTEM_INSTRUCTION: &str = "You are an expert vehicle damage assessor working for an insurance company. Analyze the image of the vehicle and detect any type of damage.
Only use the following predefined damage categories:

Broken Glass, Broken Lights, Scratch, Dent, Crack, Punctured Tyre, Lost Parts, Torn, Non-Damaged

Provide output strictly in the following JSON format:

{
  \"damage_detected\": \"Yes/No\",
  \"damage_type\": [\"one or more of the listed categories\"],
  \"damage_location\": \"specific car part (e.g., front bumper, rear door, windshield) or 'Not Applicable' if no damage\",
  \"severity\": \"None / Low / Medium / High\" (use 'None' if no damage detected),
  \"description\": \"short factual explanation based on visible evidence\"
}";

pub const IMAGE_PROMPT: &str = r#"Analyze this vehicle image for damage. Return only JSON.

For bounding boxes, use NORMALIZED coordinates (0.0 to 1.0):
- x: left edge as fraction of image width (0.0 = left, 1.0 = right)
- y: top edge as fraction of image height (0.0 = top, 1.0 = bottom)
- width: box width as fraction of image width
- height: box height as fraction of image height

Example: damage in center would be around x=0.4, y=0.4, width=0.2, height=0.2

{
  "damage_detected": "Yes/No",
  "damage_type": ["Broken Glass/Broken Lights/Scratch/Dent/Crack/Punctured Tyre/Lost Parts/Torn/Non-Damaged"],
  "damage_location": "specific car part or Not Applicable",
  "severity": "None/Low/Medium/High",
  "description": "brief description",
  "bboxes": [{"x": 0.0, "y": 0.0, "width": 0.0, "height": 0.0}],
  "image_width": 0,
  "image_height": 0
}"#;

// Fractional coordinates are accepted up to 1.1 to tolerate near-edge
// rounding in the model's output.
const NORMALIZED_MAX: f64 = 1.1;

pub const OVERLAY_STROKE_WIDTH: u32 = 4;
const OVERLAY_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const GEMINI_TIMEOUT_SECONDS: f64 = 90.0;
const GEMINI_TRANSPORT_RETRIES: usize = 2;
const GEMINI_RETRY_BACKOFF_SECONDS: f64 = 1.2;

/// Pixel dimensions of the orientation-corrected source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone)]
pub struct AssessmentOutcome {
    /// The reply map with validated geometry merged in, ready for schema
    /// validation.
    pub payload: Map<String, Value>,
    pub boxes: Vec<BBox>,
    pub warnings: Vec<String>,
}

/// Removes the markdown code fence the model tends to wrap its JSON in.
pub fn strip_reply_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Parses the raw reply into a top-level JSON object.
///
/// Any syntax error, and a top-level value that is not an object, surface as
/// `MalformedReply`: no usable assessment can be produced from either.
pub fn extract_reply(raw: &str) -> Result<Map<String, Value>, AssessError> {
    let parsed: Value = serde_json::from_str(strip_reply_fences(raw))
        .map_err(|err| AssessError::MalformedReply(err.to_string()))?;
    match parsed {
        Value::Object(map) => Ok(map),
        other => Err(AssessError::MalformedReply(format!(
            "top-level reply must be a JSON object, got {}",
            json_type_name(&other)
        ))),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn coerce_finite(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64().filter(|parsed| parsed.is_finite()),
        Value::String(raw) => raw.trim().parse::<f64>().ok().filter(|parsed| parsed.is_finite()),
        _ => None,
    }
}

/// True iff the value coerces to a finite number in [0, 1.1]. Non-numeric
/// values classify as not normalized; the absolute-pixel path then rejects
/// them during coercion.
fn is_normalized(value: &Value) -> bool {
    coerce_finite(value)
        .map(|parsed| (0.0..=NORMALIZED_MAX).contains(&parsed))
        .unwrap_or(false)
}

fn box_field(entry: &Map<String, Value>, key: &str) -> Value {
    entry.get(key).cloned().unwrap_or_else(|| json!(0))
}

/// Normalizes and validates one candidate box. `None` means the entry is
/// dropped; siblings are unaffected.
fn validated_box(entry: &Value, dims: ImageDimensions) -> Option<BBox> {
    let entry = entry.as_object()?;
    let raw = [
        box_field(entry, "x"),
        box_field(entry, "y"),
        box_field(entry, "width"),
        box_field(entry, "height"),
    ];

    // All-four-or-nothing: one absolute pixel value in an otherwise
    // fractional box would corrupt the other three if scaled independently.
    let fractional = raw.iter().all(is_normalized);

    let mut fields = [0f64; 4];
    for (slot, value) in fields.iter_mut().zip(&raw) {
        *slot = coerce_finite(value)?;
    }
    let [mut fx, mut fy, mut fw, mut fh] = fields;
    if fractional {
        fx *= f64::from(dims.width);
        fw *= f64::from(dims.width);
        fy *= f64::from(dims.height);
        fh *= f64::from(dims.height);
    }
    clip_box(fx, fy, fw, fh, dims)
}

/// Rounds, clamps and clips one pixel-space box against the image bounds.
///
/// Negative origins clamp to 0 (assumed off-by-rounding near the edge);
/// degenerate boxes and boxes whose origin lies outside the frame are
/// dropped; overhanging boxes are clipped, not rejected.
pub fn clip_box(fx: f64, fy: f64, fw: f64, fh: f64, dims: ImageDimensions) -> Option<BBox> {
    let x = (fx.round() as i64).max(0);
    let y = (fy.round() as i64).max(0);
    let mut width = (fw.round() as i64).max(0);
    let mut height = (fh.round() as i64).max(0);
    if width <= 0 || height <= 0 {
        return None;
    }
    let image_width = i64::from(dims.width);
    let image_height = i64::from(dims.height);
    if x >= image_width || y >= image_height {
        return None;
    }
    width = width.min(image_width - x);
    height = height.min(image_height - y);
    Some(BBox {
        x: x as u32,
        y: y as u32,
        width: width as u32,
        height: height as u32,
    })
}

/// Validates the whole candidate batch, preserving emission order among
/// accepted boxes. A missing or non-array `bboxes` value degrades to an
/// empty list; a malformed entry drops alone.
pub fn validate_bboxes(reply: &Map<String, Value>, dims: ImageDimensions) -> Vec<BBox> {
    let Some(entries) = reply.get("bboxes").and_then(Value::as_array) else {
        return Vec::new();
    };
    entries
        .iter()
        .filter_map(|entry| validated_box(entry, dims))
        .collect()
}

fn draw_box_outline(canvas: &mut RgbImage, bbox: &BBox) {
    for inset in 0..OVERLAY_STROKE_WIDTH {
        let width = bbox.width.saturating_sub(inset * 2);
        let height = bbox.height.saturating_sub(inset * 2);
        if width == 0 || height == 0 {
            break;
        }
        let rect = Rect::at((bbox.x + inset) as i32, (bbox.y + inset) as i32).of_size(width, height);
        draw_hollow_rect_mut(canvas, rect, OVERLAY_COLOR);
    }
}

/// Draws the accepted boxes on a copy of the source image and returns the
/// PNG as base64. The source image is never mutated.
pub fn render_overlay(image: &DynamicImage, boxes: &[BBox]) -> Result<String> {
    let mut canvas = image.to_rgb8();
    for bbox in boxes {
        draw_box_outline(&mut canvas, bbox);
    }
    let mut encoded = Vec::new();
    canvas
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .context("annotated image PNG encode failed")?;
    Ok(BASE64.encode(encoded))
}

/// Overwrites the geometry keys in the reply map with validated values and
/// attaches the overlay when one was rendered.
pub fn assemble_assessment(
    payload: &mut Map<String, Value>,
    boxes: &[BBox],
    dims: ImageDimensions,
    annotated: Option<String>,
) {
    let rows = boxes
        .iter()
        .map(|bbox| {
            json!({
                "x": bbox.x,
                "y": bbox.y,
                "width": bbox.width,
                "height": bbox.height,
            })
        })
        .collect();
    payload.insert("bboxes".to_string(), Value::Array(rows));
    payload.insert("image_width".to_string(), json!(dims.width));
    payload.insert("image_height".to_string(), json!(dims.height));
    if let Some(encoded) = annotated {
        payload.insert("annotated_image_base64".to_string(), Value::String(encoded));
    }
}

/// Runs Extractor → Normalizer → Validator/Clipper → Assembler without
/// producing an overlay.
pub fn process_reply(
    raw_reply: &str,
    dims: ImageDimensions,
) -> Result<AssessmentOutcome, AssessError> {
    let mut payload = extract_reply(raw_reply)?;
    let mut warnings = Vec::new();
    let candidate_count = count_candidates(&payload, &mut warnings);
    let boxes = validate_bboxes(&payload, dims);
    if candidate_count > boxes.len() {
        push_unique_warning(
            &mut warnings,
            format!(
                "{} candidate box(es) dropped during validation.",
                candidate_count - boxes.len()
            ),
        );
    }
    assemble_assessment(&mut payload, &boxes, dims, None);
    Ok(AssessmentOutcome {
        payload,
        boxes,
        warnings,
    })
}

/// Full pipeline including the best-effort overlay. Rendering failures are
/// contained: the annotated field is omitted and a warning recorded.
pub fn process_reply_with_overlay(
    raw_reply: &str,
    image: &DynamicImage,
) -> Result<AssessmentOutcome, AssessError> {
    let dims = ImageDimensions {
        width: image.width(),
        height: image.height(),
    };
    let mut outcome = process_reply(raw_reply, dims)?;
    if outcome.boxes.is_empty() {
        return Ok(outcome);
    }
    match render_overlay(image, &outcome.boxes) {
        Ok(encoded) => {
            outcome
                .payload
                .insert("annotated_image_base64".to_string(), Value::String(encoded));
        }
        Err(err) => {
            push_unique_warning(
                &mut outcome.warnings,
                format!("Annotated overlay skipped: {err:#}"),
            );
        }
    }
    Ok(outcome)
}

fn count_candidates(payload: &Map<String, Value>, warnings: &mut Vec<String>) -> usize {
    match payload.get("bboxes") {
        None => 0,
        Some(Value::Array(rows)) => rows.len(),
        Some(other) => {
            push_unique_warning(
                warnings,
                format!(
                    "bboxes field is {}, not an array; ignoring it.",
                    json_type_name(other)
                ),
            );
            0
        }
    }
}

/// Decodes image bytes and applies the stored EXIF orientation so reported
/// geometry matches the visually displayed image.
pub fn decode_oriented_image(bytes: &[u8]) -> Result<DynamicImage> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("image format detection failed")?;
    let mut decoder = reader.into_decoder().context("image decode failed")?;
    let orientation = decoder.orientation().unwrap_or(Orientation::NoTransforms);
    let mut image = DynamicImage::from_decoder(decoder).context("image decode failed")?;
    image.apply_orientation(orientation);
    Ok(image)
}

pub fn assessment_prompt(dims: ImageDimensions) -> String {
    format!(
        "{IMAGE_PROMPT}\n\nImageSize: width={}, height={} (pixels)",
        dims.width, dims.height
    )
}

/// Digest identifying one assessment request, for cache lookups.
pub fn assessment_cache_key(image_bytes: &[u8], model: &str, prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image_bytes);
    hasher.update(model.as_bytes());
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn mime_for_extension(extension: &str) -> Option<&'static str> {
    match extension.to_ascii_lowercase().as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

/// Inference collaborator: sends the photo and prompt to Gemini and returns
/// the raw reply text. The processing pipeline never depends on this.
pub struct GeminiAssessor {
    api_base: String,
    http: HttpClient,
}

impl GeminiAssessor {
    pub fn new() -> Self {
        Self {
            api_base: env::var("GEMINI_API_BASE")
                .ok()
                .map(|value| value.trim().trim_end_matches('/').to_string())
                .filter(|value| !value.is_empty())
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com/v1beta".to_string()),
            http: HttpClient::new(),
        }
    }

    pub fn api_key() -> Option<String> {
        non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY"))
    }

    fn endpoint_for_model(&self, model: &str) -> String {
        let trimmed = model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    pub fn request_reply(
        &self,
        image_bytes: &[u8],
        mime: &str,
        dims: ImageDimensions,
        model: &str,
        warnings: &mut Vec<String>,
    ) -> Result<String> {
        let Some(api_key) = Self::api_key() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let endpoint = self.endpoint_for_model(model);
        let payload = json!({
            "systemInstruction": {
                "parts": [{ "text": SYSTEM_INSTRUCTION }],
            },
            "contents": [{
                "role": "user",
                "parts": [
                    { "text": assessment_prompt(dims) },
                    image_part_from_bytes(image_bytes, mime),
                ],
            }],
        });
        let response = self.post_with_transport_retries(&endpoint, &api_key, &payload, warnings)?;
        let parsed = response_json_or_error("Gemini", response)?;
        extract_reply_text(&parsed).context("Gemini response contained no text part")
    }

    fn post_with_transport_retries(
        &self,
        endpoint: &str,
        api_key: &str,
        payload: &Value,
        warnings: &mut Vec<String>,
    ) -> Result<HttpResponse> {
        for attempt in 0..=GEMINI_TRANSPORT_RETRIES {
            let response = self
                .http
                .post(endpoint)
                .query(&[("key", api_key)])
                .timeout(Duration::from_secs_f64(GEMINI_TIMEOUT_SECONDS))
                .json(payload)
                .send();

            match response {
                Ok(ok) => return Ok(ok),
                Err(raw) => {
                    let err = anyhow::Error::new(raw)
                        .context(format!("Gemini request failed ({endpoint})"));
                    if !is_retryable_transport_error(&err) || attempt >= GEMINI_TRANSPORT_RETRIES {
                        return Err(err);
                    }
                    push_unique_warning(
                        warnings,
                        format!(
                            "Gemini transport retry {}/{} after transient request failure.",
                            attempt + 1,
                            GEMINI_TRANSPORT_RETRIES
                        ),
                    );
                    let delay_s = GEMINI_RETRY_BACKOFF_SECONDS * (attempt as f64 + 1.0);
                    thread::sleep(Duration::from_secs_f64(delay_s));
                }
            }
        }

        unreachable!("Gemini transport retry loop should always return a response or error")
    }
}

impl Default for GeminiAssessor {
    fn default() -> Self {
        Self::new()
    }
}

fn image_part_from_bytes(bytes: &[u8], mime: &str) -> Value {
    json!({
        "inlineData": {
            "mimeType": mime,
            "data": BASE64.encode(bytes),
        }
    })
}

fn extract_reply_text(response_payload: &Value) -> Option<String> {
    let candidates = response_payload.get("candidates").and_then(Value::as_array)?;
    let parts = candidates
        .first()?
        .get("content")
        .and_then(Value::as_object)
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)?;
    let mut out = String::new();
    for part in parts {
        if let Some(text) = part.get("text").and_then(Value::as_str) {
            out.push_str(text);
        }
    }
    if out.trim().is_empty() {
        return None;
    }
    Some(out)
}

fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use base64::Engine as _;
    use dentcheck_contracts::assessment::{AssessmentRecord, BBox, DamageDetected};
    use image::{DynamicImage, Rgb, RgbImage};
    use serde_json::{json, Value};

    use super::BASE64;
    use super::{
        assemble_assessment, assessment_cache_key, clip_box, draw_box_outline, extract_reply,
        extract_reply_text, is_normalized, process_reply, process_reply_with_overlay,
        render_overlay, strip_reply_fences, validate_bboxes, ImageDimensions,
        OVERLAY_STROKE_WIDTH,
    };

    fn dims(width: u32, height: u32) -> ImageDimensions {
        ImageDimensions { width, height }
    }

    fn white_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([255, 255, 255])))
    }

    #[test]
    fn fence_stripping_handles_tagged_and_bare_fences() {
        assert_eq!(strip_reply_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_reply_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_reply_fences("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_reply_fences("```json\n{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn fenced_and_plain_replies_extract_identically() -> anyhow::Result<()> {
        let fenced = extract_reply("```json\n{\"damage_detected\":\"No\",\"bboxes\":[]}\n```")?;
        let plain = extract_reply("{\"damage_detected\":\"No\",\"bboxes\":[]}")?;
        assert_eq!(fenced, plain);
        Ok(())
    }

    #[test]
    fn unparseable_reply_is_malformed() {
        let err = extract_reply("not json at all").expect_err("must fail");
        assert!(err.to_string().contains("not parseable as JSON"));
    }

    #[test]
    fn non_object_reply_is_malformed() {
        let err = extract_reply("[1, 2, 3]").expect_err("must fail");
        assert!(err.to_string().contains("an array"));
    }

    #[test]
    fn normalized_classifier_boundary_values() {
        assert!(is_normalized(&json!(0)));
        assert!(is_normalized(&json!(1.0)));
        assert!(is_normalized(&json!(1.1)));
        assert!(is_normalized(&json!("0.5")));
        assert!(!is_normalized(&json!(1.11)));
        assert!(!is_normalized(&json!(-0.01)));
        assert!(!is_normalized(&json!("abc")));
        assert!(!is_normalized(&json!(null)));
        assert!(!is_normalized(&json!(true)));
        assert!(!is_normalized(&json!([0.5])));
    }

    #[test]
    fn fractional_box_scales_to_pixels() {
        let reply = json!({
            "bboxes": [{"x": 0.1, "y": 0.2, "width": 0.3, "height": 0.1}],
        });
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(1000, 500));
        assert_eq!(
            boxes,
            vec![BBox {
                x: 100,
                y: 100,
                width: 300,
                height: 50,
            }]
        );
    }

    #[test]
    fn pixel_box_passes_through_and_clips_overhang() {
        let reply = json!({
            "bboxes": [{"x": 950, "y": 50, "width": 200, "height": 100}],
        });
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(1000, 500));
        assert_eq!(
            boxes,
            vec![BBox {
                x: 950,
                y: 50,
                width: 50,
                height: 100,
            }]
        );
    }

    #[test]
    fn one_absolute_field_disables_scaling_for_the_whole_box() {
        // x=400 forces the absolute path; the fractional-looking fields must
        // not be scaled on their own.
        let reply = json!({
            "bboxes": [{"x": 400, "y": 0.5, "width": 80, "height": 60}],
        });
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(1000, 500));
        assert_eq!(
            boxes,
            vec![BBox {
                x: 400,
                y: 1,
                width: 80,
                height: 60,
            }]
        );
    }

    #[test]
    fn origin_outside_frame_is_dropped() {
        let reply = json!({
            "bboxes": [{"x": 1200, "y": 10, "width": 50, "height": 50}],
        });
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(1000, 500));
        assert!(boxes.is_empty());
    }

    #[test]
    fn degenerate_boxes_are_dropped() {
        let reply = json!({
            "bboxes": [
                {"x": 10, "y": 10, "width": 0, "height": 20},
                {"x": 10, "y": 10, "width": 20, "height": 0.4},
            ],
        });
        // width 0 and a height rounding to 0 both reject; x=10 keeps the
        // second box on the absolute path.
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(100, 100));
        assert!(boxes.is_empty());
    }

    #[test]
    fn negative_origin_clamps_to_zero() {
        let reply = json!({
            "bboxes": [{"x": -3, "y": -2, "width": 50, "height": 40}],
        });
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(100, 100));
        assert_eq!(
            boxes,
            vec![BBox {
                x: 0,
                y: 0,
                width: 50,
                height: 40,
            }]
        );
    }

    #[test]
    fn malformed_entry_drops_without_sinking_siblings() {
        let reply = json!({
            "bboxes": [
                {"x": 10, "y": 10, "width": 20, "height": 20},
                {"x": "abc", "y": 10, "width": 20, "height": 20},
                "not an object",
                {"x": 40, "y": 40, "width": 20, "height": 20},
            ],
        });
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(100, 100));
        assert_eq!(
            boxes,
            vec![
                BBox {
                    x: 10,
                    y: 10,
                    width: 20,
                    height: 20,
                },
                BBox {
                    x: 40,
                    y: 40,
                    width: 20,
                    height: 20,
                },
            ]
        );
    }

    #[test]
    fn missing_fields_read_as_zero_and_reject() {
        let reply = json!({
            "bboxes": [{"x": 0.5, "y": 0.5}],
        });
        // width/height default to 0, so the box is degenerate.
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(100, 100));
        assert!(boxes.is_empty());
    }

    #[test]
    fn non_array_bboxes_degrades_to_empty() {
        let reply = json!({ "bboxes": "none" });
        assert!(validate_bboxes(reply.as_object().unwrap(), dims(100, 100)).is_empty());
        let reply = json!({});
        assert!(validate_bboxes(reply.as_object().unwrap(), dims(100, 100)).is_empty());
    }

    #[test]
    fn accepted_boxes_satisfy_bounds_invariants() {
        let reply = json!({
            "bboxes": [
                {"x": 0.95, "y": 0.5, "width": 0.2, "height": 0.6},
                {"x": 990, "y": 490, "width": 500, "height": 500},
                {"x": -10, "y": -10, "width": 2000, "height": 2000},
            ],
        });
        let image = dims(1000, 500);
        let boxes = validate_bboxes(reply.as_object().unwrap(), image);
        assert_eq!(boxes.len(), 3);
        for bbox in &boxes {
            assert!(bbox.width > 0);
            assert!(bbox.height > 0);
            assert!(bbox.x + bbox.width <= image.width);
            assert!(bbox.y + bbox.height <= image.height);
        }
    }

    #[test]
    fn clipping_is_idempotent() {
        let image = dims(1000, 500);
        let reply = json!({
            "bboxes": [
                {"x": 950, "y": 50, "width": 200, "height": 100},
                {"x": 0.1, "y": 0.2, "width": 0.3, "height": 0.1},
            ],
        });
        let first = validate_bboxes(reply.as_object().unwrap(), image);
        let second: Vec<BBox> = first
            .iter()
            .filter_map(|bbox| {
                clip_box(
                    f64::from(bbox.x),
                    f64::from(bbox.y),
                    f64::from(bbox.width),
                    f64::from(bbox.height),
                    image,
                )
            })
            .collect();
        assert_eq!(first, second);
    }

    #[test]
    fn order_among_accepted_boxes_is_preserved() {
        let reply = json!({
            "bboxes": [
                {"x": 30, "y": 30, "width": 5, "height": 5},
                {"x": 200, "y": 10, "width": 5, "height": 5},
                {"x": 1, "y": 1, "width": 5, "height": 5},
            ],
        });
        let boxes = validate_bboxes(reply.as_object().unwrap(), dims(100, 100));
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].x, 30);
        assert_eq!(boxes[1].x, 1);
    }

    #[test]
    fn overlay_encodes_png_base64() -> anyhow::Result<()> {
        let image = white_image(64, 64);
        let boxes = vec![BBox {
            x: 8,
            y: 8,
            width: 16,
            height: 16,
        }];
        let encoded = render_overlay(&image, &boxes)?;
        let bytes = BASE64.decode(encoded)?;
        assert_eq!(bytes[..4], [0x89, b'P', b'N', b'G']);
        Ok(())
    }

    #[test]
    fn outline_has_fixed_stroke_width() {
        let mut canvas = RgbImage::from_pixel(64, 64, Rgb([255, 255, 255]));
        let bbox = BBox {
            x: 8,
            y: 8,
            width: 16,
            height: 16,
        };
        draw_box_outline(&mut canvas, &bbox);
        let red = Rgb([255u8, 0, 0]);
        let white = Rgb([255u8, 255, 255]);
        for offset in 0..OVERLAY_STROKE_WIDTH {
            assert_eq!(*canvas.get_pixel(8 + offset, 8 + offset), red);
        }
        // just inside the stroke
        assert_eq!(*canvas.get_pixel(12, 12), white);
        // center untouched, outside untouched
        assert_eq!(*canvas.get_pixel(16, 16), white);
        assert_eq!(*canvas.get_pixel(7, 7), white);
    }

    #[test]
    fn source_image_is_not_mutated_by_rendering() -> anyhow::Result<()> {
        let image = white_image(32, 32);
        let boxes = vec![BBox {
            x: 2,
            y: 2,
            width: 10,
            height: 10,
        }];
        render_overlay(&image, &boxes)?;
        assert_eq!(*image.to_rgb8().get_pixel(2, 2), Rgb([255, 255, 255]));
        Ok(())
    }

    #[test]
    fn assembler_overwrites_model_geometry() {
        let mut payload = json!({
            "damage_detected": "Yes",
            "bboxes": [{"x": 99999, "y": 99999, "width": 1, "height": 1}],
            "image_width": 1,
            "image_height": 1,
        })
        .as_object()
        .cloned()
        .unwrap();
        let boxes = vec![BBox {
            x: 5,
            y: 6,
            width: 7,
            height: 8,
        }];
        assemble_assessment(&mut payload, &boxes, dims(640, 480), None);
        assert_eq!(
            payload.get("bboxes"),
            Some(&json!([{"x": 5, "y": 6, "width": 7, "height": 8}]))
        );
        assert_eq!(payload.get("image_width"), Some(&json!(640)));
        assert_eq!(payload.get("image_height"), Some(&json!(480)));
        assert!(!payload.contains_key("annotated_image_base64"));
    }

    #[test]
    fn fenced_no_damage_reply_produces_no_overlay() -> anyhow::Result<()> {
        let image = white_image(320, 240);
        let outcome = process_reply_with_overlay(
            "```json\n{\"damage_detected\":\"No\",\"bboxes\":[]}\n```",
            &image,
        )?;
        assert!(outcome.boxes.is_empty());
        assert!(!outcome.payload.contains_key("annotated_image_base64"));
        assert_eq!(outcome.payload.get("bboxes"), Some(&json!([])));
        assert_eq!(outcome.payload.get("image_width"), Some(&json!(320)));
        Ok(())
    }

    #[test]
    fn dropped_batch_produces_empty_bboxes_and_no_overlay() -> anyhow::Result<()> {
        let image = white_image(1000, 500);
        let outcome = process_reply_with_overlay(
            "{\"bboxes\":[{\"x\":1200,\"y\":10,\"width\":50,\"height\":50}]}",
            &image,
        )?;
        assert!(outcome.boxes.is_empty());
        assert_eq!(outcome.payload.get("bboxes"), Some(&json!([])));
        assert!(!outcome.payload.contains_key("annotated_image_base64"));
        assert!(outcome
            .warnings
            .iter()
            .any(|warning| warning.contains("dropped")));
        Ok(())
    }

    #[test]
    fn accepted_boxes_attach_an_overlay() -> anyhow::Result<()> {
        let image = white_image(1000, 500);
        let outcome = process_reply_with_overlay(
            "{\"damage_detected\":\"Yes\",\"bboxes\":[{\"x\":0.1,\"y\":0.2,\"width\":0.3,\"height\":0.1}]}",
            &image,
        )?;
        assert_eq!(outcome.boxes.len(), 1);
        let encoded = outcome
            .payload
            .get("annotated_image_base64")
            .and_then(Value::as_str)
            .expect("overlay should be attached");
        assert!(!encoded.is_empty());
        Ok(())
    }

    #[test]
    fn assembled_payload_passes_schema_validation() -> anyhow::Result<()> {
        let raw = json!({
            "damage_detected": "Yes",
            "damage_type": ["Dent", "Scratch"],
            "damage_location": "front bumper",
            "severity": "Medium",
            "description": "Visible dent and scratches on the front bumper area",
            "bboxes": [{"x": 0.4, "y": 0.4, "width": 0.2, "height": 0.2}],
            "image_width": 0,
            "image_height": 0,
        })
        .to_string();
        let outcome = process_reply(&raw, dims(800, 600))?;
        let record = AssessmentRecord::from_value(Value::Object(outcome.payload))?;
        assert_eq!(record.damage_detected, DamageDetected::Yes);
        assert_eq!(record.image_width, 800);
        assert_eq!(
            record.bboxes,
            vec![BBox {
                x: 320,
                y: 240,
                width: 160,
                height: 120,
            }]
        );
        Ok(())
    }

    #[test]
    fn gemini_reply_text_concatenates_first_candidate_parts() {
        let payload = json!({
            "candidates": [{
                "content": {
                    "parts": [
                        {"text": "```json\n"},
                        {"text": "{\"damage_detected\":\"No\"}"},
                        {"text": "\n```"},
                    ],
                },
            }],
        });
        let text = extract_reply_text(&payload).expect("text parts present");
        assert_eq!(strip_reply_fences(&text), "{\"damage_detected\":\"No\"}");

        assert!(extract_reply_text(&json!({"candidates": []})).is_none());
        assert!(extract_reply_text(&json!({})).is_none());
    }

    #[test]
    fn cache_key_tracks_all_inputs() {
        let base = assessment_cache_key(b"image", "gemini-2.5-pro", "prompt");
        assert_eq!(
            base,
            assessment_cache_key(b"image", "gemini-2.5-pro", "prompt")
        );
        assert_ne!(base, assessment_cache_key(b"other", "gemini-2.5-pro", "prompt"));
        assert_ne!(base, assessment_cache_key(b"image", "gemini-2.5-flash", "prompt"));
        assert_ne!(base, assessment_cache_key(b"image", "gemini-2.5-pro", "other"));
    }
}
