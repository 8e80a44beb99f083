//! Descriptors - render/filter の定義と画像フォーマット（名前で引く）
//!
//! リモートの peer は `TaskRequest` の中で名前で参照する。未知の名前は
//! semantic な拒否で、専用のレスポンスコードを返す。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How to run a renderer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderDesc {
    pub name: String,
    pub binary: PathBuf,
    #[serde(default)]
    pub required_args: Vec<String>,
}

/// How to run a filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterDesc {
    pub name: String,
    pub binary: PathBuf,
    #[serde(default)]
    pub required_args: Vec<String>,
}

/// An output image format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFormat {
    pub name: String,
    pub extension: String,
}

impl ImageFormat {
    pub fn new(name: impl Into<String>, extension: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extension: extension.into(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DescriptorError {
    #[error("duplicate render description {0:?}")]
    DuplicateRender(String),

    #[error("duplicate filter description {0:?}")]
    DuplicateFilter(String),

    #[error("duplicate image format {0:?}")]
    DuplicateFormat(String),
}

/// Registry of descriptions (name -> description).
///
/// Built during initialization (mutable), shared read-only afterwards.
#[derive(Debug, Default)]
pub struct Descriptors {
    renderers: HashMap<String, Arc<RenderDesc>>,
    filters: HashMap<String, Arc<FilterDesc>>,
    formats: HashMap<String, Arc<ImageFormat>>,
}

impl Descriptors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the built-in image formats.
    pub fn with_builtin_formats() -> Self {
        let mut d = Self::new();
        for (name, ext) in [("png", "png"), ("ppm", "ppm"), ("tga", "tga")] {
            d.formats
                .insert(name.to_string(), Arc::new(ImageFormat::new(name, ext)));
        }
        d
    }

    pub fn register_render(&mut self, desc: RenderDesc) -> Result<(), DescriptorError> {
        if self.renderers.contains_key(&desc.name) {
            return Err(DescriptorError::DuplicateRender(desc.name));
        }
        self.renderers.insert(desc.name.clone(), Arc::new(desc));
        Ok(())
    }

    pub fn register_filter(&mut self, desc: FilterDesc) -> Result<(), DescriptorError> {
        if self.filters.contains_key(&desc.name) {
            return Err(DescriptorError::DuplicateFilter(desc.name));
        }
        self.filters.insert(desc.name.clone(), Arc::new(desc));
        Ok(())
    }

    pub fn register_format(&mut self, format: ImageFormat) -> Result<(), DescriptorError> {
        if self.formats.contains_key(&format.name) {
            return Err(DescriptorError::DuplicateFormat(format.name));
        }
        self.formats.insert(format.name.clone(), Arc::new(format));
        Ok(())
    }

    pub fn render(&self, name: &str) -> Option<&Arc<RenderDesc>> {
        self.renderers.get(name)
    }

    pub fn filter(&self, name: &str) -> Option<&Arc<FilterDesc>> {
        self.filters.get(name)
    }

    pub fn format(&self, name: &str) -> Option<&Arc<ImageFormat>> {
        self.formats.get(name)
    }

    pub fn len(&self) -> usize {
        self.renderers.len() + self.filters.len() + self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn povray() -> RenderDesc {
        RenderDesc {
            name: "povray".into(),
            binary: "/usr/bin/povray".into(),
            required_args: vec!["+V".into()],
        }
    }

    #[test]
    fn lookup_registered_descriptions() {
        let mut d = Descriptors::with_builtin_formats();
        d.register_render(povray()).unwrap();

        assert_eq!(d.render("povray").unwrap().required_args, vec!["+V"]);
        assert!(d.render("blender").is_none());
        assert_eq!(d.format("png").unwrap().extension, "png");
        assert!(d.filter("gamma").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut d = Descriptors::with_builtin_formats();
        d.register_render(povray()).unwrap();

        assert_eq!(
            d.register_render(povray()),
            Err(DescriptorError::DuplicateRender("povray".into()))
        );
        assert_eq!(
            d.register_format(ImageFormat::new("png", "png")),
            Err(DescriptorError::DuplicateFormat("png".into()))
        );
    }
}
