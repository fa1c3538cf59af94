use std::{
    path::{Path, PathBuf},
    sync::LazyLock,
};

use anyhow::Context;
use base64::Engine;
use regex::Regex;
use serde_json::{Value, json};
use submit_core::ModelMetadata;

use crate::{collaborators::MetadataGenerator, config::VisionConfig, stages::prepare::walk_files};

static RE_THOUSANDS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)(\d+)k").unwrap());
static RE_PLAIN_COUNT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{4,})").unwrap());

const MIN_POLYGON_HINT: u64 = 1_000;
const MAX_POLYGON_HINT: u64 = 10_000_000;

const PROMPT: &str = "Analyze this 3D model preview image and describe it for a marketplace listing. \
Return only a JSON object with the fields: title (2-5 words, capitalized), description (50-150 words), \
tags (5-15 search tags), category (one of Character, Vehicle, Architecture, Aircraft, Animal, Plant, \
Furniture, Electronics, Weapon, Food, Sport, Various), subcategory, is_human, is_rigged, has_textures, \
suggested_price (USD, 25-99).";

/// Describes the bundle with an OpenAI-compatible vision model and fills the
/// technical fields from the files themselves.
pub struct VisionMetadataGenerator {
    client: reqwest::Client,
    config: VisionConfig,
}

impl VisionMetadataGenerator {
    pub fn new(config: VisionConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build vision http client")?;
        Ok(Self { client, config })
    }

    async fn describe(&self, image: &Path) -> anyhow::Result<ModelMetadata> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            anyhow::bail!("OPENAI_API_KEY is not set");
        };
        let bytes = tokio::fs::read(image)
            .await
            .with_context(|| format!("read preview {}", image.display()))?;
        let data_url = format!(
            "data:{};base64,{}",
            mime_type(image),
            base64::engine::general_purpose::STANDARD.encode(bytes)
        );

        let body = json!({
            "model": self.config.model,
            "max_tokens": 1000,
            "temperature": 0.3,
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": PROMPT },
                    { "type": "image_url", "image_url": { "url": data_url, "detail": "high" } }
                ]
            }]
        });
        let resp: Value = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("vision request")?
            .error_for_status()
            .context("vision request (status)")?
            .json()
            .await
            .context("vision response")?;

        let content = resp
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .context("vision response has no message content")?;
        let raw: Value = serde_json::from_str(strip_code_fence(content))
            .context("vision response is not JSON")?;
        Ok(ModelMetadata::from_loose_json(&raw))
    }
}

#[async_trait::async_trait]
impl MetadataGenerator for VisionMetadataGenerator {
    async fn analyze(&self, extract_dir: &Path) -> ModelMetadata {
        let root = extract_dir.to_path_buf();
        let scan = tokio::task::spawn_blocking(move || {
            let files = walk_files(&root).unwrap_or_default();
            (
                find_preview_image(&files),
                polygon_info(&root, &files),
            )
        })
        .await;
        let (preview, polygons) = match scan {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "metadata scan failed");
                (None, None)
            }
        };

        let mut metadata = match preview.as_deref() {
            Some(image) => match self.describe(image).await {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %format!("{e:#}"), "vision analysis failed, using defaults");
                    ModelMetadata::default()
                }
            },
            None => {
                tracing::info!(dir = %extract_dir.display(), "no preview image found, using defaults");
                ModelMetadata::default()
            }
        };
        finish_metadata(&mut metadata, preview, polygons);
        metadata
    }
}

/// Fields that never come from the vision model.
pub(crate) fn finish_metadata(
    metadata: &mut ModelMetadata,
    preview: Option<PathBuf>,
    polygons: Option<(u64, u64)>,
) {
    let base = ModelMetadata::default();
    metadata.preview_image = preview.map(|p| p.display().to_string());
    if let Some((polygons, vertices)) = polygons {
        metadata.polygons = polygons;
        metadata.vertices = vertices;
    }
    metadata.geometry = base.geometry;
    metadata.unwrapped_uvs = true;
    metadata.non_overlapping = true;
    metadata.ai_generated = false;
    metadata.license = base.license;
}

fn file_name_lower(p: &Path) -> String {
    p.file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn has_ext(p: &Path, exts: &[&str]) -> bool {
    p.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|e| exts.contains(&e.to_ascii_lowercase().as_str()))
}

fn preview_tier(path: &Path) -> usize {
    let name = file_name_lower(path);
    if name.contains("_render_1_view") {
        0
    } else if name.contains("_view") {
        1
    } else {
        2
    }
}

/// Picks the image sent to the vision model. Engine renders win, then any
/// `_view` image, then any image; within a tier names mentioning `render` or
/// `view` come first.
pub(crate) fn find_preview_image(files: &[PathBuf]) -> Option<PathBuf> {
    let images: Vec<&PathBuf> = files
        .iter()
        .filter(|p| has_ext(p, &["jpg", "jpeg", "png"]))
        .collect();
    let best = images.iter().map(|p| preview_tier(p)).min()?;
    let matches: Vec<&PathBuf> = images
        .into_iter()
        .filter(|p| preview_tier(p) == best)
        .collect();
    let preferred = matches.iter().find(|p| {
        let name = file_name_lower(p);
        name.contains("render") || name.contains("view")
    });
    preferred.or(matches.first()).map(|p| p.to_path_buf())
}

fn hint_from_name(name: &str) -> Option<u64> {
    let count = RE_THOUSANDS
        .captures(name)
        .and_then(|c| c[1].parse::<u64>().ok())
        .map(|n| n.saturating_mul(1000))
        .or_else(|| RE_PLAIN_COUNT.captures(name).and_then(|c| c[1].parse::<u64>().ok()))?;
    (MIN_POLYGON_HINT..=MAX_POLYGON_HINT)
        .contains(&count)
        .then_some(count)
}

/// Polygon and vertex counts: a `polygons`/`vertices` JSON sidecar wins over
/// an `NNNk` hint in a bundle folder name.
pub(crate) fn polygon_info(root: &Path, files: &[PathBuf]) -> Option<(u64, u64)> {
    let mut names: Vec<String> = root
        .file_name()
        .and_then(|s| s.to_str())
        .map(|s| vec![s.to_string()])
        .unwrap_or_default();
    if let Ok(rd) = std::fs::read_dir(root) {
        let mut dirs: Vec<String> = rd
            .flatten()
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        dirs.sort();
        names.extend(dirs);
    }
    let mut info = names
        .iter()
        .find_map(|n| hint_from_name(n))
        .map(|polygons| (polygons, polygons + polygons / 10));

    for sidecar in files.iter().filter(|p| has_ext(p, &["json"])) {
        let Ok(text) = std::fs::read_to_string(sidecar) else {
            continue;
        };
        let Ok(data) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let polygons = data.get("polygons").and_then(Value::as_u64);
        let vertices = data.get("vertices").and_then(Value::as_u64);
        if polygons.is_none() && vertices.is_none() {
            continue;
        }
        let (p0, v0) = info.unwrap_or((
            submit_core::metadata::DEFAULT_POLYGONS,
            submit_core::metadata::DEFAULT_POLYGONS,
        ));
        info = Some((polygons.unwrap_or(p0), vertices.unwrap_or(v0)));
        break;
    }
    info
}

fn mime_type(p: &Path) -> &'static str {
    match p
        .extension()
        .and_then(|s| s.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

/// Models often wrap JSON in a markdown fence.
fn strip_code_fence(content: &str) -> &str {
    let content = content.trim();
    let Some(start) = content.find("```") else {
        return content;
    };
    let after = &content[start + 3..];
    let after = after.strip_prefix("json").unwrap_or(after);
    match after.find("```") {
        Some(end) => after[..end].trim(),
        None => after.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn preview_prefers_engine_render() {
        let files = vec![
            PathBuf::from("/x/a/aaa.png"),
            PathBuf::from("/x/a/side_view.png"),
            PathBuf::from("/x/a/abc_Unity_HDRP_Render_1_view.jpg"),
        ];
        assert_eq!(
            find_preview_image(&files),
            Some(PathBuf::from("/x/a/abc_Unity_HDRP_Render_1_view.jpg"))
        );

        let files = vec![PathBuf::from("/x/a.png"), PathBuf::from("/x/b_render.jpg")];
        assert_eq!(
            find_preview_image(&files),
            Some(PathBuf::from("/x/b_render.jpg"))
        );
        assert_eq!(
            find_preview_image(&[PathBuf::from("/x/mesh.fbx")]),
            None
        );
    }

    #[test]
    fn polygon_hint_from_folder_name() {
        assert_eq!(hint_from_name("3f2a_100k"), Some(100_000));
        assert_eq!(hint_from_name("tree_250000"), Some(250_000));
        assert_eq!(hint_from_name("tiny_1k"), Some(1_000));
        assert_eq!(hint_from_name("lod_999"), None);
        assert_eq!(hint_from_name("extracted"), None);
    }

    #[test]
    fn sidecar_overrides_folder_hint() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("extracted");
        fs::create_dir_all(root.join("knight_50k")).unwrap();
        assert_eq!(polygon_info(&root, &[]), Some((50_000, 55_000)));

        let sidecar = root.join("knight_50k/info.json");
        fs::write(&sidecar, r#"{"polygons": 42000, "vertices": 40000}"#).unwrap();
        assert_eq!(polygon_info(&root, &[sidecar]), Some((42_000, 40_000)));
    }

    #[test]
    fn fences_are_stripped() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fence(" {\"b\":2} "), "{\"b\":2}");
    }

    #[tokio::test]
    async fn missing_api_key_falls_back_to_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("extracted");
        fs::create_dir_all(root.join("car_20k")).unwrap();
        fs::write(root.join("car_20k/front_view.png"), b"png").unwrap();

        let generator = VisionMetadataGenerator::new(VisionConfig::default()).unwrap();
        let m = generator.analyze(&root).await;
        assert_eq!(m.title, ModelMetadata::default().title);
        assert_eq!(m.polygons, 20_000);
        assert_eq!(m.vertices, 22_000);
        assert!(m.preview_image.unwrap().ends_with("front_view.png"));
        assert_eq!(m.license, "Royalty free");
    }
}
