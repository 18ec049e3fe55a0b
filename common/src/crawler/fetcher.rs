// Page fetching and extraction for crawl steps.
//
// Extraction stays deliberately shallow: a title, the visible text, and the
// outbound links. Anything richer (markdown conversion, per-site scraping)
// is the business of the content extractors, not the engine.

use crate::errors::CrawlError;
use scraper::{Html, Selector};
use std::time::Duration;
use url::Url;

/// Build the shared crawl client. One client per pool; connection reuse
/// across workers.
pub fn build_client(user_agent: &str, fetch_timeout: Duration) -> Result<reqwest::Client, CrawlError> {
    reqwest::Client::builder()
        .user_agent(user_agent)
        .timeout(fetch_timeout)
        .build()
        .map_err(|e| CrawlError::FetchFailed {
            url: String::new(),
            reason: e.to_string(),
        })
}

/// Fetch one page body, mapping any transport or status failure to a
/// per-URL error.
pub async fn fetch_body(client: &reqwest::Client, url: &Url) -> Result<String, CrawlError> {
    client
        .get(url.clone())
        .send()
        .await
        .and_then(|response| response.error_for_status())
        .map_err(|e| CrawlError::FetchFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?
        .text()
        .await
        .map_err(|e| CrawlError::FetchFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

/// Title, visible text, and absolute outbound links of one page.
#[derive(Debug, Clone)]
pub struct ExtractedPage {
    pub title: String,
    pub text: String,
    pub links: Vec<Url>,
}

/// Parse a page body. Synchronous on purpose: the parsed DOM is not Send
/// and must not be held across await points.
pub fn extract_page(base: &Url, body: &str, collect_links: bool) -> ExtractedPage {
    let document = Html::parse_document(body);

    let title_selector = Selector::parse("title").expect("valid selector");
    let h1_selector = Selector::parse("h1").expect("valid selector");
    let body_selector = Selector::parse("body").expect("valid selector");
    let link_selector = Selector::parse("a[href]").expect("valid selector");

    let title = document
        .select(&title_selector)
        .next()
        .or_else(|| document.select(&h1_selector).next())
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| base.to_string());

    let text = document
        .select(&body_selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<Vec<_>>().join(" ")))
        .unwrap_or_default();

    let mut links = Vec::new();
    if collect_links {
        let mut seen = std::collections::HashSet::new();
        for element in document.select(&link_selector) {
            let Some(href) = element.value().attr("href") else {
                continue;
            };
            let Ok(mut resolved) = base.join(href) else {
                continue;
            };
            resolved.set_fragment(None);
            if resolved.scheme() != "http" && resolved.scheme() != "https" {
                continue;
            }
            if seen.insert(resolved.to_string()) {
                links.push(resolved);
            }
        }
    }

    ExtractedPage { title, text, links }
}

fn collapse_whitespace(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
        <html>
          <head><title>  Sample
            Page </title></head>
          <body>
            <h1>Heading</h1>
            <p>Some   body text.</p>
            <a href="/relative">rel</a>
            <a href="https://other.test/page">abs</a>
            <a href="#fragment">frag</a>
            <a href="mailto:x@example.com">mail</a>
            <a href="/relative">dup</a>
          </body>
        </html>"##;

    #[test]
    fn test_extract_title_and_text() {
        let base = Url::parse("https://example.test/dir/").unwrap();
        let page = extract_page(&base, PAGE, false);
        assert_eq!(page.title, "Sample Page");
        assert!(page.text.contains("Some body text."));
        assert!(page.links.is_empty());
    }

    #[test]
    fn test_extract_links_resolved_and_deduped() {
        let base = Url::parse("https://example.test/dir/").unwrap();
        let page = extract_page(&base, PAGE, true);

        let links: Vec<String> = page.links.iter().map(Url::to_string).collect();
        assert!(links.contains(&"https://example.test/relative".to_string()));
        assert!(links.contains(&"https://other.test/page".to_string()));
        // fragment-only and mailto links dropped; duplicate collapsed;
        // the bare-fragment link resolves to the base itself
        assert_eq!(
            links
                .iter()
                .filter(|l| l.as_str() == "https://example.test/relative")
                .count(),
            1
        );
        assert!(!links.iter().any(|l| l.starts_with("mailto:")));
    }

    #[test]
    fn test_title_falls_back_to_url() {
        let base = Url::parse("https://example.test/").unwrap();
        let page = extract_page(&base, "<html><body>no title</body></html>", false);
        assert_eq!(page.title, "https://example.test/");
    }
}
