//! Same-origin classification of a navigation and its redirect chain.
//!
//! Anything classified [`OriginClass::CrossOrigin`] must never hand script the
//! real destination URL or a usable window handle.

use serde::Serialize;
use url::{Origin, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginClass {
    SameOrigin,
    CrossOrigin,
}

/// Opaque origins (`data:`, `about:blank`, ...) are never same-origin with
/// anything, including themselves.
pub fn same_origin(current: &Origin, candidate: &Url) -> bool {
    current.is_tuple() && *current == candidate.origin()
}

/// Same-origin iff the initial URL and every redirect hop share the current
/// document's origin.
pub fn classify(current: &Url, navigation_url: &Url, redirect_chain: &[Url]) -> OriginClass {
    let origin = current.origin();
    let all_same = std::iter::once(navigation_url)
        .chain(redirect_chain)
        .all(|hop| same_origin(&origin, hop));

    if all_same {
        OriginClass::SameOrigin
    } else {
        OriginClass::CrossOrigin
    }
}

/// The URL string script may see for a navigation of the given class.
pub fn redact(url: &Url, class: OriginClass) -> String {
    match class {
        OriginClass::SameOrigin => url.as_str().to_string(),
        OriginClass::CrossOrigin => String::new(),
    }
}

/// Incremental form of [`classify`] for hops that arrive while a transition is
/// already open. Once a foreign hop is seen the guard stays cross-origin.
#[derive(Debug, Clone)]
pub struct RedirectGuard {
    origin: Origin,
    class: OriginClass,
    last: Url,
    hops: usize,
}

impl RedirectGuard {
    pub fn new(current: &Url, navigation_url: &Url, redirect_chain: &[Url]) -> Self {
        let class = classify(current, navigation_url, redirect_chain);
        let last = redirect_chain
            .last()
            .unwrap_or(navigation_url)
            .clone();
        Self {
            origin: current.origin(),
            class,
            last,
            hops: redirect_chain.len(),
        }
    }

    pub fn observe(&mut self, hop: &Url) -> OriginClass {
        self.hops += 1;
        self.last = hop.clone();
        if !same_origin(&self.origin, hop) {
            self.class = OriginClass::CrossOrigin;
        }
        self.class
    }

    pub fn class(&self) -> OriginClass {
        self.class
    }

    pub fn last_url(&self) -> &Url {
        &self.last
    }

    pub fn hops(&self) -> usize {
        self.hops
    }
}
