use crate::codec::Algorithm;
use crate::config::Config;
use http::header;
use http::request::Parts;
use std::cmp::Ordering;

/// Picks the response encoding for a request, or `None` for passthrough.
///
/// The exclusion predicate is consulted first; an excluded request is never
/// compressed regardless of its headers.
pub fn negotiate(request: &Parts, config: &Config) -> Option<Algorithm> {
    if config.is_excluded(request) {
        tracing::debug!(path = %request.uri.path(), "compression excluded for request");
        return None;
    }

    let values: Vec<&str> = request
        .headers
        .get_all(header::ACCEPT_ENCODING)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let accept_encoding = (!values.is_empty()).then(|| values.join(","));

    let selected = select_encoding(accept_encoding.as_deref(), config);
    tracing::debug!(
        accept_encoding = accept_encoding.as_deref().unwrap_or(""),
        selected = selected.map_or("", |a| a.content_encoding()),
        "negotiated response encoding"
    );
    selected
}

/// Selects the best enabled algorithm for an `Accept-Encoding` value.
///
/// Candidates are ranked by quality, then configured priority, then the fixed
/// fallback order `br`, `gzip`, `deflate`, `zstd`. A missing or empty header
/// never selects anything. `*` applies its quality to every enabled algorithm
/// the header does not name explicitly.
pub fn select_encoding(accept_encoding: Option<&str>, config: &Config) -> Option<Algorithm> {
    let header = accept_encoding?.trim();
    if header.is_empty() {
        return None;
    }

    let mut explicit: [Option<f32>; 4] = [None; 4];
    let mut wildcard: Option<f32> = None;

    for part in header.split(',') {
        let (encoding, quality) = parse_encoding_with_quality(part.trim());
        if encoding == "*" {
            wildcard = Some(wildcard.map_or(quality, |q| q.max(quality)));
        } else if let Some(algorithm) = Algorithm::from_token(encoding) {
            let slot = &mut explicit[algorithm.index()];
            *slot = Some(slot.map_or(quality, |q| q.max(quality)));
        }
    }

    config
        .enabled_algorithms()
        .filter_map(|algorithm| {
            let quality = explicit[algorithm.index()].or(wildcard)?;
            (quality > 0.0).then_some((algorithm, quality))
        })
        .max_by(|(a, qa), (b, qb)| compare_candidates(config, (*a, *qa), (*b, *qb)))
        .map(|(algorithm, _)| algorithm)
}

/// Orders candidates so that the preferred one compares greatest.
fn compare_candidates(config: &Config, a: (Algorithm, f32), b: (Algorithm, f32)) -> Ordering {
    a.1.total_cmp(&b.1)
        .then_with(|| {
            config
                .settings(a.0)
                .priority
                .cmp(&config.settings(b.0).priority)
        })
        // Earlier in the fallback order is better, so reverse the index.
        .then_with(|| b.0.index().cmp(&a.0.index()))
}

/// Parses an encoding entry like "gzip" or "br;q=0.8" into (encoding, quality).
///
/// A missing, malformed, or out-of-range quality counts as 1.0.
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.split(';');
    let encoding = parts.next().unwrap_or("").trim();

    let quality = parts
        .map(str::trim)
        .find_map(|param| {
            param
                .strip_prefix("q=")
                .or_else(|| param.strip_prefix("Q="))
        })
        .and_then(|q| q.trim().parse::<f32>().ok())
        .filter(|q| (0.0..=1.0).contains(q))
        .unwrap_or(1.0);

    (encoding, quality)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn select(header: &str) -> Option<Algorithm> {
        select_encoding(Some(header), &Config::default())
    }

    fn parts(accept_encoding: Option<&str>) -> Parts {
        let mut builder = http::Request::get("/resource");
        if let Some(value) = accept_encoding {
            builder = builder.header(header::ACCEPT_ENCODING, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_parse_quality() {
        assert_eq!(parse_encoding_with_quality("gzip"), ("gzip", 1.0));
        assert_eq!(parse_encoding_with_quality("br;q=0.8"), ("br", 0.8));
        assert_eq!(parse_encoding_with_quality("br ; Q=0.25"), ("br", 0.25));
        assert_eq!(parse_encoding_with_quality("zstd;level=3;q=0"), ("zstd", 0.0));
    }

    #[test]
    fn test_parse_quality_lenient() {
        assert_eq!(parse_encoding_with_quality("gzip;q=abc"), ("gzip", 1.0));
        assert_eq!(parse_encoding_with_quality("gzip;q=7"), ("gzip", 1.0));
        assert_eq!(parse_encoding_with_quality("gzip;q=-0.5"), ("gzip", 1.0));
        assert_eq!(parse_encoding_with_quality("gzip;q=NaN"), ("gzip", 1.0));
        assert_eq!(parse_encoding_with_quality("gzip;q="), ("gzip", 1.0));
    }

    #[test]
    fn test_absent_or_empty_header() {
        assert_eq!(select_encoding(None, &Config::default()), None);
        assert_eq!(select(""), None);
        assert_eq!(select("  "), None);
    }

    #[test]
    #[cfg(all(feature = "brotli", feature = "gzip", feature = "deflate", feature = "zstd"))]
    fn test_single_encodings() {
        assert_eq!(select("br"), Some(Algorithm::Brotli));
        assert_eq!(select("gzip"), Some(Algorithm::Gzip));
        assert_eq!(select("deflate"), Some(Algorithm::Deflate));
        assert_eq!(select("zstd"), Some(Algorithm::Zstd));
    }

    #[test]
    #[cfg(all(feature = "brotli", feature = "gzip", feature = "deflate"))]
    fn test_quality_weighted_selection() {
        assert_eq!(
            select("br;q=0.5, gzip;q=0.7, deflate;q=0.3"),
            Some(Algorithm::Gzip)
        );
    }

    #[test]
    #[cfg(all(feature = "brotli", feature = "gzip", feature = "deflate", feature = "zstd"))]
    fn test_priority_tie_break() {
        assert_eq!(select("br, gzip, deflate, zstd"), Some(Algorithm::Brotli));
        assert_eq!(select("zstd, deflate, gzip"), Some(Algorithm::Gzip));
    }

    #[test]
    #[cfg(all(feature = "gzip", feature = "zstd"))]
    fn test_configured_priority_wins_over_fallback() {
        let config = Config::builder()
            .priority(Algorithm::Zstd, 100)
            .build()
            .unwrap();
        assert_eq!(
            select_encoding(Some("gzip, zstd"), &config),
            Some(Algorithm::Zstd)
        );
        // Quality still comes first.
        assert_eq!(
            select_encoding(Some("gzip, zstd;q=0.9"), &config),
            Some(Algorithm::Gzip)
        );
    }

    #[test]
    #[cfg(all(feature = "gzip", feature = "deflate"))]
    fn test_equal_priority_uses_fallback_order() {
        let config = Config::builder()
            .priority(Algorithm::Gzip, 5)
            .priority(Algorithm::Deflate, 5)
            .build()
            .unwrap();
        assert_eq!(
            select_encoding(Some("deflate, gzip"), &config),
            Some(Algorithm::Gzip)
        );
    }

    #[test]
    fn test_unknown_encoding() {
        assert_eq!(select("doesnotexist"), None);
        assert_eq!(select("identity, compress"), None);
    }

    #[test]
    #[cfg(feature = "brotli")]
    fn test_quality_zero_rejects() {
        assert_eq!(select("gzip;q=0"), None);
        assert_eq!(select("gzip;q=0, br"), Some(Algorithm::Brotli));
        assert_eq!(select("br;q=0, gzip;q=0, deflate;q=0, zstd;q=0"), None);
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_disabled_algorithm_skipped() {
        let config = Config::builder()
            .enable(Algorithm::Brotli, false)
            .build()
            .unwrap();
        assert_eq!(
            select_encoding(Some("br, gzip;q=0.5"), &config),
            Some(Algorithm::Gzip)
        );
        assert_eq!(select_encoding(Some("br"), &config), None);
    }

    #[test]
    #[cfg(all(feature = "brotli", feature = "gzip", feature = "deflate", feature = "zstd"))]
    fn test_wildcard() {
        assert_eq!(select("*"), Some(Algorithm::Brotli));
        assert_eq!(select("br;q=0, *"), Some(Algorithm::Gzip));
        assert_eq!(select("*;q=0.5, zstd"), Some(Algorithm::Zstd));
        assert_eq!(select("*;q=0"), None);
        assert_eq!(select("gzip;q=0, br;q=0, *;q=0.1"), Some(Algorithm::Deflate));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_case_insensitive_and_aliases() {
        assert_eq!(select("GZIP"), Some(Algorithm::Gzip));
        assert_eq!(select("x-gzip;q=0.9, deflate;q=0.1"), Some(Algorithm::Gzip));
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_negotiate_joins_header_lines() {
        let mut request = parts(Some("identity"));
        request
            .headers
            .append(header::ACCEPT_ENCODING, "gzip".parse().unwrap());
        assert_eq!(
            negotiate(&request, &Config::default()),
            Some(Algorithm::Gzip)
        );
    }

    #[test]
    #[cfg(feature = "gzip")]
    fn test_negotiate_exclusion_short_circuits() {
        let config = Config::builder().exclude(|_| true).build().unwrap();
        assert_eq!(negotiate(&parts(Some("gzip")), &config), None);
        assert_eq!(negotiate(&parts(None), &Config::default()), None);
    }
}
