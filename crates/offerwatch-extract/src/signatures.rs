//! Landing-page shapes that make extracted facts untrustworthy: search
//! results pages and anti-automation block pages.

use url::Url;

use crate::profile::SearchUrlRules;

/// True when the landing URL looks like a search results page under the
/// given path/query rules.
pub fn is_search_results_url(landing_url: &str, rules: &SearchUrlRules) -> bool {
    let Ok(url) = Url::parse(landing_url) else {
        return false;
    };
    let path = url.path().to_ascii_lowercase();
    let path_hit = rules.path_prefixes.iter().any(|prefix| {
        let prefix = prefix.trim_end_matches('/').to_ascii_lowercase();
        !prefix.is_empty() && (path == prefix || path.starts_with(&format!("{prefix}/")))
    });
    if path_hit {
        return true;
    }
    url.query_pairs().any(|(name, value)| {
        !value.trim().is_empty()
            && rules
                .query_params
                .iter()
                .any(|param| param.eq_ignore_ascii_case(&name))
    })
}

/// Returns the first block-page marker found in `body` (case-insensitive).
pub fn find_block_marker<'a>(body: &str, markers: &'a [String]) -> Option<&'a str> {
    if markers.is_empty() {
        return None;
    }
    let haystack = body.to_lowercase();
    markers
        .iter()
        .map(String::as_str)
        .filter(|m| !m.trim().is_empty())
        .find(|marker| haystack.contains(&marker.to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> SearchUrlRules {
        SearchUrlRules {
            path_prefixes: vec!["/s".into(), "/search/".into()],
            query_params: vec!["k".into(), "searchTerm".into()],
        }
    }

    #[test]
    fn path_prefix_matches_whole_segments_only() {
        assert!(is_search_results_url("https://shop.example/s?foo=1", &rules()));
        assert!(is_search_results_url("https://shop.example/search/plants", &rules()));
        assert!(!is_search_results_url("https://shop.example/sp/monte-carlo", &rules()));
    }

    #[test]
    fn query_params_need_a_value() {
        assert!(is_search_results_url("https://shop.example/browse?k=java+fern", &rules()));
        assert!(is_search_results_url("https://shop.example/browse?SEARCHTERM=moss", &rules()));
        assert!(!is_search_results_url("https://shop.example/browse?k=", &rules()));
        assert!(!is_search_results_url("https://shop.example/dp/B000123", &rules()));
        assert!(!is_search_results_url("not a url", &rules()));
    }

    #[test]
    fn block_markers_are_case_insensitive() {
        let markers = vec!["Robot or human?".to_string(), "px-captcha".to_string()];
        assert_eq!(
            find_block_marker("<h1>ROBOT OR HUMAN?</h1>", &markers),
            Some("Robot or human?")
        );
        assert_eq!(find_block_marker("<div id=\"px-captcha\"></div>", &markers), Some("px-captcha"));
        assert_eq!(find_block_marker("<h1>Java Fern</h1>", &markers), None);
    }
}
