//! Route rules and their precompiled match caches.
//!
//! - Hostnames are normalized to lowercase with the trailing dot trimmed
//! - `domain` rules compare the registrable domain (eTLD+1) of the target
//! - `cidr` and `domain` rules are mutually exclusive: IPs never match a
//!   domain rule, hostnames never match a CIDR rule

use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use ipnet::IpNet;
use publicsuffix::{List, Psl};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Egress;
use crate::error::{Error, Result};

/// Environment variable naming a public suffix list that replaces the
/// embedded copy.
pub const PUBLIC_SUFFIX_LIST_ENV: &str = "BURROW_PUBLIC_SUFFIX_LIST";

static PUBLIC_SUFFIX_LIST: LazyLock<List> = LazyLock::new(load_public_suffix_list);

fn load_public_suffix_list() -> List {
    if let Ok(path) = std::env::var(PUBLIC_SUFFIX_LIST_ENV) {
        match std::fs::read(&path).map(|bytes| List::from_bytes(&bytes)) {
            Ok(Ok(list)) => return list,
            Ok(Err(e)) => warn!(path = %path, error = %e, "Ignoring unparsable public suffix list"),
            Err(e) => warn!(path = %path, error = %e, "Ignoring unreadable public suffix list"),
        }
    }
    const EMBEDDED: &[u8] = include_bytes!("../../resources/public_suffix_list.dat");
    List::from_bytes(EMBEDDED).unwrap_or_default()
}

/// Normalize a hostname for matching.
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_lowercase()
}

/// The registrable domain of `host`, e.g. `google.co.jp` for
/// `www.google.co.jp`. Names the suffix list cannot split fall back to the
/// normalized name itself.
pub fn registrable_domain(host: &str) -> String {
    let host = normalize_hostname(host);
    PUBLIC_SUFFIX_LIST
        .domain(host.as_bytes())
        .and_then(|domain| std::str::from_utf8(domain.as_bytes()).ok().map(str::to_string))
        .unwrap_or(host)
}

/// Parse `dst` as an IP address, accepting bracketed IPv6 literals.
fn parse_ip(dst: &str) -> Option<IpAddr> {
    let dst = dst
        .strip_prefix('[')
        .and_then(|d| d.strip_suffix(']'))
        .unwrap_or(dst);
    dst.parse().ok()
}

/// How a route's sources are compared against a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// Matches everything.
    #[default]
    Default,
    Exact,
    Domain,
    Regex,
    Cidr,
}

impl FromStr for MatchType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(MatchType::Default),
            "exact" => Ok(MatchType::Exact),
            "domain" => Ok(MatchType::Domain),
            "regex" => Ok(MatchType::Regex),
            "cidr" => Ok(MatchType::Cidr),
            other => Err(Error::Config(format!("unknown match type {other:?}"))),
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchType::Default => "default",
            MatchType::Exact => "exact",
            MatchType::Domain => "domain",
            MatchType::Regex => "regex",
            MatchType::Cidr => "cidr",
        };
        f.write_str(name)
    }
}

/// Lookup structures built once from a route's sources.
#[derive(Debug, Clone, Default)]
pub struct MatchCache {
    exact: HashSet<String>,
    domains: HashSet<String>,
    regexes: Vec<Regex>,
    networks: Vec<IpNet>,
}

/// One routing rule.
#[derive(Debug, Clone)]
pub struct Route {
    pub sources: Vec<String>,
    pub ext_path: Option<PathBuf>,
    pub destination: Egress,
    pub match_type: MatchType,
    cache: MatchCache,
}

impl Route {
    pub fn new(
        sources: Vec<String>,
        ext_path: Option<PathBuf>,
        destination: Egress,
        match_type: MatchType,
    ) -> Self {
        Self {
            sources,
            ext_path,
            destination,
            match_type,
            cache: MatchCache::default(),
        }
    }

    /// Catch-all rule used by the server when no routes are configured.
    pub fn server_default() -> Self {
        Self::new(Vec::new(), None, Egress::Direct, MatchType::Default)
    }

    /// Catch-all rule used by the client when no routes are configured.
    pub fn client_default() -> Self {
        Self::new(Vec::new(), None, Egress::Proxy, MatchType::Default)
    }

    /// Blocks every IPv6 literal destination.
    pub fn ipv6_block() -> Self {
        Self::new(vec!["::/0".to_string()], None, Egress::Block, MatchType::Cidr)
    }

    /// Build the match cache from `sources` plus the lines of `ext_path`.
    /// Must run once before [`Route::matches`].
    pub fn generate_cache(&mut self) -> Result<()> {
        let mut sources = self.sources.clone();
        if let Some(path) = &self.ext_path {
            sources.extend(read_source_file(path)?);
        }

        let mut cache = MatchCache::default();
        for source in sources {
            match self.match_type {
                MatchType::Default => {}
                MatchType::Exact => {
                    cache.exact.insert(normalize_hostname(&source));
                }
                MatchType::Domain => {
                    cache
                        .domains
                        .insert(normalize_hostname(source.trim_start_matches('.')));
                }
                MatchType::Regex => {
                    let regex = Regex::new(&source).map_err(|e| Error::Regex {
                        pattern: source.clone(),
                        source: e,
                    })?;
                    cache.regexes.push(regex);
                }
                MatchType::Cidr => {
                    let network = source
                        .parse::<IpNet>()
                        .or_else(|_| source.parse::<IpAddr>().map(IpNet::from))
                        .map_err(|_| Error::Cidr(source.clone()))?;
                    cache.networks.push(network);
                }
            }
        }

        debug!(
            match_type = %self.match_type,
            destination = %self.destination,
            exact = cache.exact.len(),
            domains = cache.domains.len(),
            regexes = cache.regexes.len(),
            networks = cache.networks.len(),
            "Route cache generated"
        );
        self.cache = cache;
        Ok(())
    }

    /// Whether `dst` (a hostname or IP literal, without port) matches.
    pub fn matches(&self, dst: &str) -> bool {
        match self.match_type {
            MatchType::Default => true,
            MatchType::Exact => self.cache.exact.contains(&normalize_hostname(dst)),
            MatchType::Domain => {
                parse_ip(dst).is_none() && self.cache.domains.contains(&registrable_domain(dst))
            }
            MatchType::Regex => self.cache.regexes.iter().any(|r| r.is_match(dst)),
            MatchType::Cidr => match parse_ip(dst) {
                Some(ip) => self.cache.networks.iter().any(|net| net.contains(&ip)),
                None => false,
            },
        }
    }
}

/// One pattern per line; blank lines and `#` comments are skipped.
fn read_source_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path).map_err(|source| Error::SourceFile {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn route(match_type: MatchType, sources: &[&str]) -> Route {
        let mut route = Route::new(
            sources.iter().map(|s| s.to_string()).collect(),
            None,
            Egress::Direct,
            match_type,
        );
        route.generate_cache().unwrap();
        route
    }

    #[rstest]
    #[case("sub.www.google.com", "google.com")]
    #[case("www.google.co.jp", "google.co.jp")]
    #[case("WWW.Example.ORG.", "example.org")]
    #[case("example.com", "example.com")]
    #[case("localhost", "localhost")]
    fn test_registrable_domain(#[case] host: &str, #[case] expected: &str) {
        assert_eq!(registrable_domain(host), expected);
    }

    #[rstest]
    #[case("10.1.2.3", true)]
    #[case("10.255.255.255", true)]
    #[case("11.0.0.1", false)]
    #[case("192.168.1.1", true)]
    #[case("2001:db8::1", false)]
    #[case("example.com", false)]
    #[case("10.example.com", false)]
    fn test_cidr_route(#[case] dst: &str, #[case] expected: bool) {
        let route = route(MatchType::Cidr, &["10.0.0.0/8", "192.168.1.1"]);
        assert_eq!(route.matches(dst), expected);
    }

    #[rstest]
    #[case("google.com", true)]
    #[case("sub.www.google.com", true)]
    #[case("www.google.co.jp", true)]
    #[case("google.com.evil.net", false)]
    #[case("notgoogle.com", false)]
    #[case("8.8.8.8", false)]
    fn test_domain_route(#[case] dst: &str, #[case] expected: bool) {
        let route = route(MatchType::Domain, &["google.com", "Google.co.jp"]);
        assert_eq!(route.matches(dst), expected);
    }

    #[rstest]
    #[case("example.com", true)]
    #[case("EXAMPLE.com", true)]
    #[case("www.example.com", false)]
    fn test_exact_route(#[case] dst: &str, #[case] expected: bool) {
        let route = route(MatchType::Exact, &["example.com"]);
        assert_eq!(route.matches(dst), expected);
    }

    #[rstest]
    #[case("ads.tracker.net", true)]
    #[case("cdn.example.com", true)]
    #[case("example.org", false)]
    fn test_regex_route(#[case] dst: &str, #[case] expected: bool) {
        let route = route(MatchType::Regex, &[r"^ads\.", r"\.example\.com$"]);
        assert_eq!(route.matches(dst), expected);
    }

    #[test]
    fn test_default_route_matches_everything() {
        let route = Route::server_default();
        assert!(route.matches("anything.test"));
        assert!(route.matches("127.0.0.1"));
        assert_eq!(Route::client_default().destination, Egress::Proxy);
    }

    #[test]
    fn test_ipv6_block_rule() {
        let mut route = Route::ipv6_block();
        route.generate_cache().unwrap();
        assert!(route.matches("::1"));
        assert!(route.matches("[2001:db8::1]"));
        assert!(!route.matches("127.0.0.1"));
        assert_eq!(route.destination, Egress::Block);
    }

    #[test]
    fn test_generate_cache_reports_bad_sources() {
        let mut bad_regex = Route::new(vec!["(".to_string()], None, Egress::Direct, MatchType::Regex);
        match bad_regex.generate_cache() {
            Err(Error::Regex { pattern, .. }) => assert_eq!(pattern, "("),
            other => panic!("Expected Regex error, got {:?}", other),
        }

        let mut bad_cidr = Route::new(vec!["10.0.0.0/33".to_string()], None, Egress::Direct, MatchType::Cidr);
        match bad_cidr.generate_cache() {
            Err(Error::Cidr(source)) => assert_eq!(source, "10.0.0.0/33"),
            other => panic!("Expected Cidr error, got {:?}", other),
        }

        let mut missing = Route::new(
            Vec::new(),
            Some(PathBuf::from("/nonexistent/burrow/routes.txt")),
            Egress::Direct,
            MatchType::Exact,
        );
        assert!(matches!(missing.generate_cache(), Err(Error::SourceFile { .. })));
    }

    #[test]
    fn test_ext_path_sources_are_appended() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# blocked hosts").unwrap();
        writeln!(file, "ads.example.net").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  tracker.example.org  ").unwrap();

        let mut route = Route::new(
            vec!["inline.example.com".to_string()],
            Some(file.path().to_path_buf()),
            Egress::Blackhole,
            MatchType::Exact,
        );
        route.generate_cache().unwrap();

        assert!(route.matches("inline.example.com"));
        assert!(route.matches("ads.example.net"));
        assert!(route.matches("tracker.example.org"));
        assert!(!route.matches("# blocked hosts"));
    }

    #[test]
    fn test_match_type_parse() {
        assert_eq!("CIDR".parse::<MatchType>().unwrap(), MatchType::Cidr);
        assert!("glob".parse::<MatchType>().is_err());
    }
}
