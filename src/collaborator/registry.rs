use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use url::Url;

use super::{CollaboratorError, SiteAdapter};

/// Lowercased host of `url`. `None` if the url does not parse or has no host.
pub fn site_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()?
        .host_str()
        .map(|host| host.to_ascii_lowercase())
}

/// `url` without its query string or fragment. Unparseable input comes back
/// unchanged.
pub fn clean_url(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => url.to_string(),
    }
}

/// Site adapters keyed by domain.
#[derive(Clone, Default)]
pub struct SiteRegistry {
    adapters: HashMap<String, Arc<dyn SiteAdapter>>,
}

impl fmt::Debug for SiteRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SiteRegistry")
            .field("domains", &self.domains())
            .finish()
    }
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, domain: impl Into<String>, adapter: Arc<dyn SiteAdapter>) {
        self.adapters
            .insert(domain.into().to_ascii_lowercase(), adapter);
    }

    pub fn with(mut self, domain: impl Into<String>, adapter: Arc<dyn SiteAdapter>) -> Self {
        self.register(domain, adapter);
        self
    }

    /// The adapter for the site `url` points at.
    pub fn resolve(&self, url: &str) -> Result<Arc<dyn SiteAdapter>, CollaboratorError> {
        let domain = site_domain(url)
            .ok_or_else(|| CollaboratorError::MissingData(format!("not a url: {url}")))?;
        let bare = domain.strip_prefix("www.").unwrap_or(&domain);
        self.adapters
            .get(&domain)
            .or_else(|| self.adapters.get(bare))
            .cloned()
            .ok_or(CollaboratorError::UnsupportedSite(domain))
    }

    pub fn supports(&self, url: &str) -> bool {
        self.resolve(url).is_ok()
    }

    /// Registered domains, sorted.
    pub fn domains(&self) -> Vec<&str> {
        let mut domains: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        domains.sort_unstable();
        domains
    }
}
