pub mod fetcher;
pub mod pool;

pub use fetcher::{build_client, extract_page, fetch_body, ExtractedPage};
pub use pool::{CrawlOutcome, CrawlParams, CrawlerPool};
