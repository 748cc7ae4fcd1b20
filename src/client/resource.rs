//! Resource kinds and their collection paths

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{require_non_empty, ArgumentError};

/// Object collections exposed by the API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    File,
    Url,
    Domain,
    IpAddress,
    Analysis,
    Collection,
    Graph,
    Comment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::File,
        ResourceKind::Url,
        ResourceKind::Domain,
        ResourceKind::IpAddress,
        ResourceKind::Analysis,
        ResourceKind::Collection,
        ResourceKind::Graph,
        ResourceKind::Comment,
    ];

    /// Collection path segment
    pub fn path_segment(self) -> &'static str {
        match self {
            ResourceKind::File => "files",
            ResourceKind::Url => "urls",
            ResourceKind::Domain => "domains",
            ResourceKind::IpAddress => "ip_addresses",
            ResourceKind::Analysis => "analyses",
            ResourceKind::Collection => "collections",
            ResourceKind::Graph => "graphs",
            ResourceKind::Comment => "comments",
        }
    }

    /// Path of a single object, e.g. `files/{sha256}`
    ///
    /// URL objects are addressed by the unpadded URL-safe base64 encoding of
    /// the URL itself; every other kind uses the identifier verbatim.
    pub fn object_path(self, id: &str) -> Result<String, ArgumentError> {
        let id = require_non_empty(Some(id), "id")?.trim();
        let id = match self {
            ResourceKind::Url => url_identifier(id),
            _ => id.to_string(),
        };
        Ok(format!("{}/{}", self.path_segment(), id))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

impl FromStr for ResourceKind {
    type Err = ArgumentError;

    /// Accepts the collection segment (`files`) or the singular name (`file`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase().replace('-', "_");
        ResourceKind::ALL
            .into_iter()
            .find(|kind| {
                let segment = kind.path_segment();
                wanted == segment || wanted == singular(segment)
            })
            .ok_or_else(|| ArgumentError::Invalid {
                name: "kind",
                reason: format!("unknown resource kind '{}'", s),
            })
    }
}

fn singular(segment: &str) -> &str {
    match segment {
        "analyses" => "analysis",
        "ip_addresses" => "ip_address",
        other => other.strip_suffix('s').unwrap_or(other),
    }
}

/// Identifier of a URL object
pub fn url_identifier(url: &str) -> String {
    URL_SAFE_NO_PAD.encode(url.as_bytes())
}
