pub mod protocol;
pub mod server;

pub use server::{GatewayContext, NbdServer};

use url::Url;

/// Parse the transport-level export name into a URI. The path names the
/// volume (`/<volume_id>`) and the query string carries the session token.
pub fn parse_export_uri(name: &str) -> Result<Url, url::ParseError> {
    // export names are server-relative; anchor them to parse as a URL
    let base = Url::parse("nbd://gateway/").expect("static base URL");
    base.join(name)
}

/// The volume id addressed by an export URI: the first path segment.
pub fn volume_id_from_uri(uri: &Url) -> Option<String> {
    uri.path_segments()
        .and_then(|mut segments| segments.next().map(str::to_string))
        .filter(|s| !s.is_empty())
}
