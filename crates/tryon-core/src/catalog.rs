//! Product catalog.
//!
//! Products are keyed by id and embedded at compile time from
//! `contrib/catalog.toml`.

use crate::asset::MaterialOverrides;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const CATALOG_TOML: &str = include_str!("../../../contrib/catalog.toml");

static CATALOG: OnceLock<Vec<Product>> = OnceLock::new();

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    product: Vec<Product>,
}

/// One try-on product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    /// Asset file name, relative to the asset directory.
    pub model: String,
    /// Vertical nudge in scene pixels (positive = up).
    #[serde(default)]
    pub offset_y: f32,
    /// Target overlay width relative to the blended face span.
    #[serde(default = "default_scale")]
    pub scale: f32,
    #[serde(default)]
    pub lens_meshes: Vec<String>,
    #[serde(default)]
    pub frame_meshes: Vec<String>,
}

fn default_scale() -> f32 {
    1.0
}

impl Product {
    pub fn model_path(&self, asset_dir: &Path) -> PathBuf {
        asset_dir.join(&self.model)
    }

    pub fn overrides(&self) -> MaterialOverrides {
        MaterialOverrides {
            lens: self.lens_meshes.clone(),
            frame: self.frame_meshes.clone(),
        }
    }
}

/// Parse a catalog document. Entries with an empty id or a non-positive scale are skipped.
pub fn parse_catalog(src: &str) -> Result<Vec<Product>, toml::de::Error> {
    let file: CatalogFile = toml::from_str(src)?;
    Ok(file
        .product
        .into_iter()
        .filter(|p| {
            let ok = !p.id.is_empty() && p.scale.is_finite() && p.scale > 0.0;
            if !ok {
                tracing::warn!(id = %p.id, "skipping invalid catalog entry");
            }
            ok
        })
        .collect())
}

fn catalog() -> &'static Vec<Product> {
    CATALOG.get_or_init(|| match parse_catalog(CATALOG_TOML) {
        Ok(products) => products,
        Err(e) => {
            tracing::error!(error = %e, "bad catalog TOML");
            Vec::new()
        }
    })
}

/// Look up a product by id.
pub fn lookup_product(id: &str) -> Option<&'static Product> {
    catalog().iter().find(|p| p.id == id)
}

pub fn list_products() -> &'static [Product] {
    catalog()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_embedded_catalog_loads() {
        assert_eq!(list_products().len(), 22);
        let p = lookup_product("glasses1").unwrap();
        assert_eq!(p.name, "Aviator Elite");
        assert_eq!(p.model, "glasses1.glb");
        assert_eq!(p.scale, 1.0);
    }

    #[test]
    fn test_unknown_product() {
        assert!(lookup_product("monocle").is_none());
    }

    #[test]
    fn test_defaults_and_overrides() {
        let src = r#"
            [[product]]
            id = "x"
            name = "X"
            model = "x.glb"
            lens_meshes = ["Lens_L", "Lens_R"]
        "#;
        let products = parse_catalog(src).unwrap();
        assert_eq!(products[0].scale, 1.0);
        assert_eq!(products[0].offset_y, 0.0);
        assert_eq!(products[0].overrides().lens.len(), 2);
        assert_eq!(
            products[0].model_path(Path::new("/assets")),
            PathBuf::from("/assets/x.glb")
        );
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let src = r#"
            [[product]]
            id = "bad"
            name = "Bad"
            model = "bad.glb"
            scale = 0.0
        "#;
        assert!(parse_catalog(src).unwrap().is_empty());
    }
}
