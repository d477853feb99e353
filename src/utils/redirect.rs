//! Post-login redirect validation
//!
//! The `rd` parameter given to `/authorize` is echoed back as a `Location`
//! after sign-in, so it must never point off-site.

use log::{debug, warn};
use url::Url;

const MAX_REDIRECT_LENGTH: usize = 2048;

/// Validate a post-login redirect target
///
/// Accepts relative paths (`/app/home?tab=1`) and absolute URLs on the
/// website origin. Returns the normalized target, or `None` if it is unsafe.
#[must_use]
pub fn validate_post_login_redirect(target: &str, website_origin: &Url) -> Option<String> {
    debug!("Validating post-login redirect target: {target}");

    if target.is_empty() || target.len() > MAX_REDIRECT_LENGTH {
        warn!("Rejected redirect target with length {}", target.len());
        return None;
    }

    if has_suspicious_characters(target) {
        warn!("Rejected redirect target with suspicious characters: {target}");
        return None;
    }

    let decoded = urlencoding::decode(target).map_or_else(|_| target.to_string(), |d| d.into_owned());
    if decoded != target && (has_suspicious_characters(&decoded) || decoded.starts_with("//")) {
        warn!("Rejected encoded redirect target: {target}");
        return None;
    }

    if is_relative_path(target) {
        if target.split(['/', '?', '#']).any(|segment| segment == "..") {
            warn!("Rejected path traversal in redirect target: {target}");
            return None;
        }
        return Some(target.to_string());
    }

    let parsed = Url::parse(target).ok()?;
    if parsed.origin() == website_origin.origin() {
        return Some(parsed.to_string());
    }

    warn!(
        "Rejected off-site redirect target to host {:?}",
        parsed.host_str()
    );
    None
}

fn is_relative_path(target: &str) -> bool {
    target.starts_with('/') && !target.starts_with("//") && !target.contains(':')
}

fn has_suspicious_characters(target: &str) -> bool {
    target.contains('\\') || target.chars().any(char::is_control)
}
