//! Request classification and strategy selection.

use url::Url;

use crate::http::{Destination, Request};

/// Routing class of an intercepted request, recomputed per request.
///
/// `CrossOrigin` and `Other` map to the same strategy but stay distinct
/// because diagnostics report them separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingClass {
  CrossOrigin,
  StaticAsset,
  Document,
  Other,
}

impl RoutingClass {
  pub fn as_str(&self) -> &'static str {
    match self {
      RoutingClass::CrossOrigin => "cross-origin",
      RoutingClass::StaticAsset => "static-asset",
      RoutingClass::Document => "document",
      RoutingClass::Other => "other",
    }
  }

  /// The caching strategy this class routes to.
  pub fn strategy(&self) -> Strategy {
    match self {
      RoutingClass::StaticAsset => Strategy::CacheFirst,
      RoutingClass::Document => Strategy::NetworkFirstWithFallback,
      RoutingClass::CrossOrigin | RoutingClass::Other => Strategy::NetworkFirst,
    }
  }
}

/// The four caching strategies the executor implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  NetworkFirstWithFallback,
  StaleWhileRevalidate,
}

/// Classify a request. Rules are evaluated in order, first match wins:
///
/// 1. Origin differs from the page origin → cross-origin
/// 2. Known static path prefix, or destination style/script/font → static-asset
/// 3. Destination document → document
/// 4. Everything else → other
pub fn classify(request: &Request, page_origin: &Url, static_prefixes: &[String]) -> RoutingClass {
  if request.url.origin() != page_origin.origin() {
    return RoutingClass::CrossOrigin;
  }

  let path = request.url.path();
  let is_static_path = static_prefixes.iter().any(|p| path.starts_with(p.as_str()));
  let is_static_destination = matches!(
    request.destination,
    Destination::Style | Destination::Script | Destination::Font
  );
  if is_static_path || is_static_destination {
    return RoutingClass::StaticAsset;
  }

  if request.destination == Destination::Document {
    return RoutingClass::Document;
  }

  RoutingClass::Other
}
