use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::SiteConfig;
use crate::integrity::PathResolver;
use crate::runtime::ResolvedPaths;

/// Local directories behind the `public://` and `private://` stream wrappers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamPaths {
    pub public_dir: PathBuf,
    pub private_dir: Option<PathBuf>,
}

impl StreamPaths {
    /// Configured paths are relative to the Drupal root; the public
    /// directory defaults to `sites/<site>/files`.
    pub fn for_site(paths: &ResolvedPaths, site: &SiteConfig, site_name: &str) -> Result<Self> {
        let drupal_root = paths.require_drupal_root()?;
        let public_dir = match site.files.public_path.as_deref() {
            Some(path) => join_under(drupal_root, path),
            None => paths.site_files_dir(site_name)?,
        };
        let private_dir = site
            .files
            .private_path
            .as_deref()
            .map(|path| join_under(drupal_root, path));
        Ok(Self {
            public_dir,
            private_dir,
        })
    }
}

impl PathResolver for StreamPaths {
    fn resolve(&self, uri: &str) -> Option<PathBuf> {
        let (scheme, target) = uri.split_once("://")?;
        let target = target.trim_start_matches('/');
        let base = match scheme {
            "public" => &self.public_dir,
            "private" => self.private_dir.as_ref()?,
            _ => return None,
        };
        Some(base.join(target))
    }
}

fn join_under(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
