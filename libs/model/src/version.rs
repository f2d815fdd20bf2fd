//! The compatibility matrix between client versions, gateway versions and the
//! syntactic features of DNS resource addresses.
//!
//! Address syntax is versioned: `*` matches a single label, `**` matches any
//! number of labels, `?` matches a single character. Clients older than 1.2
//! only understand the legacy syntax where a single leading wildcard label is
//! allowed (legacy `*` spans multiple labels, legacy `?` spans one).

use semver::{Version, VersionReq};

/// Clients reporting anything older than this are rejected at join.
pub const MIN_CLIENT_VERSION: Version = Version::new(1, 0, 0);

/// The version reported by a session is not a semantic version.
///
/// `development` and `unknown` builds fall into this bucket on purpose.
#[derive(Debug, thiserror::Error)]
#[error("`{0}` is not a valid semantic version")]
pub struct InvalidVersion(pub String);

pub fn parse_version(version: &str) -> Result<Version, InvalidVersion> {
    Version::parse(version).map_err(|_| InvalidVersion(version.to_owned()))
}

/// Whether a client understands globs in non-leading positions.
pub fn supports_full_globs(client: &Version) -> bool {
    *client >= Version::new(1, 2, 0)
}

/// The gateway versions a client of the given version can connect through.
pub fn gateway_requirement(client: &Version) -> VersionReq {
    let requirement = if *client < Version::new(1, 1, 0) {
        "> 0.0.0"
    } else {
        ">= 1.1.0"
    };

    VersionReq::parse(requirement).expect("static version requirements must parse")
}

/// Renders a DNS address for a pre-1.2 client, or `None` if the legacy syntax
/// cannot express it.
pub fn legacy_dns_address(address: &str) -> Option<String> {
    let (prefix, rest) = if let Some(rest) = address.strip_prefix("**.") {
        ("*.", rest)
    } else if let Some(rest) = address.strip_prefix("*.") {
        ("?.", rest)
    } else if let Some(rest) = address.strip_prefix("?.") {
        ("?.", rest)
    } else {
        ("", address)
    };

    if rest.contains(['*', '?']) {
        return None;
    }

    Some(format!("{prefix}{rest}"))
}

/// Whether serving this address requires a gateway that understands the
/// versioned glob syntax (anything beyond a single leading wildcard).
pub fn requires_modern_gateway(address: &str) -> bool {
    legacy_dns_address(address).is_none()
}

/// Whether a gateway of the given version can serve the given DNS address.
pub fn gateway_supports_address(gateway: &Version, address: &str) -> bool {
    if requires_modern_gateway(address) {
        return *gateway >= Version::new(1, 1, 0);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_is_not_a_version() {
        assert!(parse_version("development").is_err());
        assert!(parse_version("unknown").is_err());
    }

    #[test]
    fn pre_1_1_clients_accept_any_gateway() {
        let req = gateway_requirement(&Version::new(1, 0, 5));

        assert!(req.matches(&Version::new(0, 9, 0)));
        assert!(req.matches(&Version::new(1, 1, 0)));
    }

    #[test]
    fn one_dot_one_clients_need_modern_gateways() {
        let req = gateway_requirement(&Version::new(1, 1, 99));

        assert!(!req.matches(&Version::new(1, 0, 9)));
        assert!(req.matches(&Version::new(1, 1, 0)));
        assert!(req.matches(&Version::new(1, 2, 3)));
    }

    #[test]
    fn leading_multi_label_glob_maps_to_legacy_star() {
        assert_eq!(
            legacy_dns_address("**.glob.com").as_deref(),
            Some("*.glob.com")
        );
    }

    #[test]
    fn leading_single_label_glob_maps_to_legacy_question_mark() {
        assert_eq!(legacy_dns_address("*.q.com").as_deref(), Some("?.q.com"));
    }

    #[test]
    fn non_leading_globs_cannot_be_rendered() {
        assert_eq!(legacy_dns_address("foo.*.ex.com"), None);
        assert_eq!(legacy_dns_address("foo.**.glob.com"), None);
        assert_eq!(legacy_dns_address("us-east?-d.glob.com"), None);
    }

    #[test]
    fn plain_addresses_pass_through() {
        assert_eq!(
            legacy_dns_address("app.example.com").as_deref(),
            Some("app.example.com")
        );
    }

    #[test]
    fn old_gateways_only_serve_leading_globs() {
        let old = Version::new(1, 0, 3);

        assert!(gateway_supports_address(&old, "*.example.com"));
        assert!(!gateway_supports_address(&old, "foo.*.example.com"));
        assert!(gateway_supports_address(&Version::new(1, 1, 0), "foo.*.example.com"));
    }
}
