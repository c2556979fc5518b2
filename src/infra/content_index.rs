//! TOML content index.
//!
//! A flat description of the published site the operator binary resolves
//! entities against:
//!
//! ```toml
//! home = "https://example.com/"
//! global_archive = "product"
//!
//! [[entities]]
//! id = 42
//! url = "/widgets/blue/"
//! kind = "product"
//! terms = ["/product-category/widgets/"]
//!
//! [[archives]]
//! kind = "product"
//! url = "/shop/"
//! ```
//!
//! Relative URLs are joined onto the configured site URL.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::cache::{CacheError, ContentSource, EntityId, trailing_slash};
use crate::config::WarmTarget;

use super::error::InfraError;

const DEFAULT_GLOBAL_ARCHIVE_KIND: &str = "product";

#[derive(Debug, Clone, Deserialize)]
pub struct EntityRecord {
    pub id: EntityId,
    pub url: Option<String>,
    pub kind: String,
    #[serde(default = "published_default")]
    pub published: bool,
    #[serde(default)]
    pub terms: Vec<String>,
}

fn published_default() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveRecord {
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct RawIndex {
    home: Option<String>,
    global_archive: Option<String>,
    entities: Vec<EntityRecord>,
    archives: Vec<ArchiveRecord>,
}

/// Entity and archive lookups backed by a TOML file.
#[derive(Debug, Clone)]
pub struct ContentIndex {
    site_url: Url,
    home: String,
    global_archive_kind: String,
    entities: BTreeMap<EntityId, EntityRecord>,
    archives: BTreeMap<String, String>,
}

impl ContentIndex {
    pub fn load(path: &Path, site_url: &Url) -> Result<Self, InfraError> {
        let raw = fs::read_to_string(path)
            .map_err(|err| InfraError::content_index(path, err.to_string()))?;
        Self::parse(&raw, site_url).map_err(|message| InfraError::content_index(path, message))
    }

    pub fn parse(raw: &str, site_url: &Url) -> Result<Self, String> {
        let index: RawIndex = toml::from_str(raw).map_err(|err| err.to_string())?;

        let home = match index.home.as_deref() {
            Some(home) => absolute(site_url, home)?,
            None => site_url.to_string(),
        };

        let mut entities = BTreeMap::new();
        for entity in index.entities {
            let id = entity.id;
            if entities.insert(id, entity).is_some() {
                return Err(format!("duplicate entity id {id}"));
            }
        }

        let archives = index
            .archives
            .into_iter()
            .map(|archive| (archive.kind, archive.url))
            .collect();

        Ok(Self {
            site_url: site_url.clone(),
            home: trailing_slash(&home),
            global_archive_kind: index
                .global_archive
                .unwrap_or_else(|| DEFAULT_GLOBAL_ARCHIVE_KIND.to_string()),
            entities,
            archives,
        })
    }

    /// An index with no entities or archives; only the site root resolves.
    pub fn empty(site_url: &Url) -> Self {
        Self {
            site_url: site_url.clone(),
            home: trailing_slash(site_url.as_str()),
            global_archive_kind: DEFAULT_GLOBAL_ARCHIVE_KIND.to_string(),
            entities: BTreeMap::new(),
            archives: BTreeMap::new(),
        }
    }

    pub fn entity(&self, id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&id)
    }

    /// Candidate URLs for warming, deduplicated, at most `limit` of them.
    pub fn warm_urls(&self, target: WarmTarget, limit: usize) -> Vec<String> {
        let mut urls = Vec::new();
        if matches!(target, WarmTarget::All | WarmTarget::Home) {
            urls.push(self.home.clone());
        }
        if matches!(target, WarmTarget::All | WarmTarget::Posts) {
            urls.extend(
                self.entities
                    .values()
                    .filter(|entity| entity.published)
                    .filter_map(|entity| entity.url.as_deref())
                    .filter_map(|url| absolute(&self.site_url, url).ok())
                    .map(|url| trailing_slash(&url)),
            );
        }
        if matches!(target, WarmTarget::All | WarmTarget::Archives) {
            urls.extend(
                self.archives
                    .values()
                    .filter_map(|url| absolute(&self.site_url, url).ok())
                    .map(|url| trailing_slash(&url)),
            );
        }

        let mut seen = HashSet::new();
        urls.retain(|url| seen.insert(url.clone()));
        urls.truncate(limit);
        urls
    }

    fn resolve(&self, url: &str) -> Result<String, CacheError> {
        absolute(&self.site_url, url).map_err(CacheError::lookup)
    }
}

impl ContentSource for ContentIndex {
    fn site_root(&self) -> String {
        self.home.clone()
    }

    fn canonical_url(&self, id: EntityId) -> Result<Option<String>, CacheError> {
        self.entities
            .get(&id)
            .and_then(|entity| entity.url.as_deref())
            .map(|url| self.resolve(url))
            .transpose()
    }

    fn entity_kind(&self, id: EntityId) -> Result<Option<String>, CacheError> {
        Ok(self.entities.get(&id).map(|entity| entity.kind.clone()))
    }

    fn archive_url(&self, kind: &str) -> Result<Option<String>, CacheError> {
        self.archives
            .get(kind)
            .map(|url| self.resolve(url))
            .transpose()
    }

    fn term_urls(&self, id: EntityId) -> Result<Vec<String>, CacheError> {
        let Some(entity) = self.entities.get(&id) else {
            return Ok(Vec::new());
        };
        entity.terms.iter().map(|url| self.resolve(url)).collect()
    }

    fn global_archive_url(&self) -> Result<Option<String>, CacheError> {
        self.archive_url(&self.global_archive_kind)
    }
}

fn absolute(base: &Url, url: &str) -> Result<String, String> {
    base.join(url.trim())
        .map(|joined| joined.to_string())
        .map_err(|err| format!("invalid url `{url}`: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INDEX: &str = r#"
home = "/"

[[entities]]
id = 42
url = "/widgets/blue/"
kind = "product"
terms = ["/product-category/widgets/", "https://example.com/product-tag/sale"]

[[entities]]
id = 7
url = "/draft/"
kind = "post"
published = false

[[entities]]
id = 9
kind = "attachment"

[[archives]]
kind = "product"
url = "/shop/"
"#;

    fn index() -> ContentIndex {
        let site = Url::parse("https://example.com/").unwrap();
        ContentIndex::parse(INDEX, &site).unwrap()
    }

    #[test]
    fn resolves_relative_urls_against_site() {
        let index = index();
        assert_eq!(index.site_root(), "https://example.com/");
        assert_eq!(
            index.canonical_url(42).unwrap().as_deref(),
            Some("https://example.com/widgets/blue/")
        );
        assert_eq!(
            index.archive_url("product").unwrap().as_deref(),
            Some("https://example.com/shop/")
        );
        assert_eq!(
            index.term_urls(42).unwrap(),
            vec![
                "https://example.com/product-category/widgets/".to_string(),
                "https://example.com/product-tag/sale".to_string()
            ]
        );
    }

    #[test]
    fn unknown_entities_resolve_to_nothing() {
        let index = index();
        assert_eq!(index.canonical_url(1000).unwrap(), None);
        assert_eq!(index.entity_kind(1000).unwrap(), None);
        assert!(index.term_urls(1000).unwrap().is_empty());
        assert_eq!(index.canonical_url(9).unwrap(), None);
    }

    #[test]
    fn global_archive_defaults_to_product_listing() {
        assert_eq!(
            index().global_archive_url().unwrap().as_deref(),
            Some("https://example.com/shop/")
        );
    }

    #[test]
    fn warm_urls_skip_unpublished_and_respect_limit() {
        let index = index();
        assert_eq!(
            index.warm_urls(WarmTarget::All, 10),
            vec![
                "https://example.com/".to_string(),
                "https://example.com/widgets/blue/".to_string(),
                "https://example.com/shop/".to_string(),
            ]
        );
        assert_eq!(index.warm_urls(WarmTarget::All, 1).len(), 1);
        assert_eq!(
            index.warm_urls(WarmTarget::Archives, 10),
            vec!["https://example.com/shop/".to_string()]
        );
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let site = Url::parse("https://example.com/").unwrap();
        let raw = "[[entities]]\nid = 1\nkind = \"post\"\n[[entities]]\nid = 1\nkind = \"post\"\n";
        assert!(ContentIndex::parse(raw, &site).is_err());
    }
}
