//! Tool discovery.
//!
//! A tool is any local image named `<prefix><tool>:<tag>` whose build
//! definition carries a valid metadata block. Discovery results are cached
//! as one immutable map; a rescan builds a fresh map and swaps it in whole,
//! so concurrent readers see either the old map or the new one.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::adapters::ContainerRuntime;
use crate::domain::ToolMetadata;

/// A discovered tool and the image it runs in
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Tool {
    /// Full image reference, e.g. `bioframe-spades:latest`
    pub image: String,
    pub metadata: ToolMetadata,
}

/// Tool name (as derived from the image) to tool
pub type ToolMap = BTreeMap<String, Tool>;

/// An image reference split according to the naming convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageRef<'a> {
    pub tool: &'a str,
    pub tag: &'a str,
}

impl<'a> ImageRef<'a> {
    /// Parse `<prefix><tool>:<tag>`. Anything else is not a tool image.
    pub fn parse(image: &'a str, prefix: &str) -> Option<Self> {
        let (repository, tag) = image.rsplit_once(':')?;
        let tool = repository.strip_prefix(prefix)?;

        let valid_tool = !tool.is_empty()
            && tool
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_tool || tag.is_empty() || tag == "<none>" || tag.contains('/') {
            return None;
        }

        Some(Self { tool, tag })
    }
}

/// Numeric-aware tag ordering: digit runs compare as numbers, so `10.0 > 9.0`
pub fn compare_tags(a: &str, b: &str) -> Ordering {
    let (left, right) = (tag_parts(a), tag_parts(b));

    for (x, y) in left.iter().zip(&right) {
        let ord = match (x, y) {
            (TagPart::Number(m), TagPart::Number(n)) => m.cmp(n),
            (TagPart::Text(s), TagPart::Text(t)) => s.cmp(t),
            (TagPart::Text(_), TagPart::Number(_)) => Ordering::Less,
            (TagPart::Number(_), TagPart::Text(_)) => Ordering::Greater,
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }

    // `1.0` < `1.0.1`; `01` and `1` fall back to plain text
    left.len().cmp(&right.len()).then_with(|| a.cmp(b))
}

#[derive(Debug)]
enum TagPart<'a> {
    Text(&'a str),
    Number(u64),
}

fn tag_part(chunk: &str) -> TagPart<'_> {
    match chunk.parse::<u64>() {
        Ok(n) => TagPart::Number(n),
        Err(_) => TagPart::Text(chunk),
    }
}

/// Split a tag into alternating digit and non-digit runs
fn tag_parts(tag: &str) -> Vec<TagPart<'_>> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut digits = None;
    for (i, c) in tag.char_indices() {
        let is_digit = c.is_ascii_digit();
        if digits.is_some_and(|d| d != is_digit) {
            parts.push(tag_part(&tag[start..i]));
            start = i;
        }
        digits = Some(is_digit);
    }
    if start < tag.len() {
        parts.push(tag_part(&tag[start..]));
    }

    parts
}

/// Session-scoped tool registry
pub struct ToolRegistry {
    runtime: Arc<dyn ContainerRuntime>,
    image_prefix: String,
    cache: RwLock<Option<Arc<ToolMap>>>,
}

impl ToolRegistry {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, image_prefix: impl Into<String>) -> Self {
        Self {
            runtime,
            image_prefix: image_prefix.into(),
            cache: RwLock::new(None),
        }
    }

    pub fn image_prefix(&self) -> &str {
        &self.image_prefix
    }

    /// The cached map, scanning on first use
    pub async fn discover(&self) -> Result<Arc<ToolMap>> {
        if let Some(tools) = self.cached() {
            return Ok(tools);
        }
        self.rescan().await
    }

    /// Force a fresh scan and replace the cache
    #[instrument(skip(self), fields(runtime = self.runtime.name()))]
    pub async fn rescan(&self) -> Result<Arc<ToolMap>> {
        let images = self
            .runtime
            .list_images()
            .await
            .context("Failed to list container images")?;

        // One image per tool: prefer `latest`, otherwise the greatest tag
        let mut chosen: BTreeMap<&str, (&str, &str)> = BTreeMap::new();
        for image in &images {
            let Some(parsed) = ImageRef::parse(image, &self.image_prefix) else {
                continue;
            };
            let replace = match chosen.get(parsed.tool) {
                None => true,
                Some((_, tag)) => {
                    *tag != "latest"
                        && (parsed.tag == "latest" || compare_tags(parsed.tag, tag).is_gt())
                }
            };
            if replace {
                chosen.insert(parsed.tool, (image.as_str(), parsed.tag));
            }
        }

        let mut tools = ToolMap::new();
        for (name, (image, _)) in chosen {
            let definition = match self.runtime.build_definition(image).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(image, error = %format!("{:#}", e), "Skipping tool: build definition unavailable");
                    continue;
                }
            };

            match ToolMetadata::from_definition(&definition, name) {
                Ok(metadata) => {
                    debug!(tool = name, image, "Registered tool");
                    tools.insert(
                        name.to_string(),
                        Tool {
                            image: image.to_string(),
                            metadata,
                        },
                    );
                }
                Err(e) => {
                    warn!(image, error = %e, "Skipping tool: invalid metadata");
                }
            }
        }

        info!(count = tools.len(), "Tool discovery complete");

        let tools = Arc::new(tools);
        *self.cache.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&tools));
        Ok(tools)
    }

    /// Look up one tool, scanning on first use
    pub async fn get(&self, name: &str) -> Result<Option<Tool>> {
        Ok(self.discover().await?.get(name).cloned())
    }

    /// The current cached map, if any scan has completed
    pub fn cached(&self) -> Option<Arc<ToolMap>> {
        self.cache
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
