//! Byte containers volumes live in, addressed by URL.

pub mod file;
pub mod http;

pub use file::FileBacking;
pub use http::HttpBacking;

use crate::error::Result;
use crate::stream::Stream;

pub trait Backing: Stream {
    /// Cut the container at `len`, for stores that can.
    fn truncate(&mut self, _len: u64) -> Result<()> {
        Ok(())
    }
}

/// True when `uri` names something a backing adapter can open.
pub fn is_backing_uri(uri: &str) -> bool {
    uri.starts_with("file://") || uri.starts_with("http://") || uri.starts_with("https://")
}

/// Turn a plain path into a `file://` URI, URIs pass through.
pub fn to_uri(path_or_uri: &str) -> String {
    if is_backing_uri(path_or_uri) {
        return path_or_uri.to_string();
    }
    let path = std::path::Path::new(path_or_uri);
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|d| d.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    format!("file://{}", abs.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uris() {
        assert!(is_backing_uri("file:///tmp/x"));
        assert!(is_backing_uri("https://example.com/x"));
        assert!(!is_backing_uri("urn:aff4:x"));

        assert_eq!(to_uri("/tmp/v.aff4"), "file:///tmp/v.aff4");
        assert_eq!(to_uri("http://h/v.aff4"), "http://h/v.aff4");
        assert!(to_uri("v.aff4").starts_with("file:///"));
    }
}
