use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use std::time::Duration;
use tracing::{info, warn};

use super::{ContentSource, Stage, StageError};
use crate::core::trend::Candidate;

const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Default discovery backend: fetches the configured RSS/Atom feeds and
/// yields one candidate per item. A single bad feed is skipped; discovery
/// only fails when no feed yields anything at all.
pub struct RssSource {
    client: reqwest::Client,
    feed_urls: Vec<String>,
}

impl RssSource {
    pub fn new(client: reqwest::Client, feed_urls: Vec<String>) -> Self {
        Self { client, feed_urls }
    }

    async fn fetch_feed(&self, url: &str) -> anyhow::Result<Vec<Candidate>> {
        let body = self
            .client
            .get(url)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(parse_feed(&body)?)
    }
}

#[async_trait]
impl ContentSource for RssSource {
    async fn discover(&self) -> Result<Vec<Candidate>, StageError> {
        if self.feed_urls.is_empty() {
            return Err(StageError::new(Stage::Discover, "no feed URLs configured"));
        }

        let mut candidates = Vec::new();
        let mut failures = Vec::new();
        for url in &self.feed_urls {
            match self.fetch_feed(url).await {
                Ok(items) => {
                    info!("Feed {} yielded {} items", url, items.len());
                    candidates.extend(items);
                }
                Err(e) => {
                    warn!("Feed {} failed: {}", url, e);
                    failures.push(format!("{url}: {e}"));
                }
            }
        }

        if candidates.is_empty() && !failures.is_empty() {
            return Err(StageError::new(
                Stage::Discover,
                format!("every feed failed: {}", failures.join("; ")),
            ));
        }
        Ok(candidates)
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Title,
    Description,
}

/// Parse RSS 2.0 `<item>` or Atom `<entry>` elements into candidates.
fn parse_feed(xml: &str) -> quick_xml::Result<Vec<Candidate>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut candidates = Vec::new();
    let mut in_item = false;
    let mut field: Option<Field> = None;
    let mut title = String::new();
    let mut description = String::new();

    loop {
        match reader.read_event()? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"item" | b"entry" => {
                    in_item = true;
                    title.clear();
                    description.clear();
                }
                b"title" if in_item => field = Some(Field::Title),
                b"description" | b"summary" | b"content" if in_item => {
                    field = Some(Field::Description)
                }
                _ => field = None,
            },
            Event::Text(t) => {
                if in_item && let Some(f) = field {
                    let text = t.unescape()?;
                    match f {
                        Field::Title => title.push_str(&text),
                        Field::Description => description.push_str(&text),
                    }
                }
            }
            Event::CData(t) => {
                if in_item && let Some(f) = field {
                    let text = String::from_utf8_lossy(&t.into_inner()).into_owned();
                    match f {
                        Field::Title => title.push_str(&text),
                        Field::Description => description.push_str(&text),
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"item" | b"entry" => {
                    if !title.trim().is_empty() {
                        candidates.push(Candidate {
                            title: title.trim().to_string(),
                            description: description.trim().to_string(),
                        });
                    }
                    in_item = false;
                    field = None;
                }
                _ => field = None,
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rss_items() {
        let xml = r#"<?xml version="1.0"?>
            <rss version="2.0"><channel>
                <title>Channel title ignored</title>
                <item>
                    <title>First headline</title>
                    <description>First body</description>
                </item>
                <item>
                    <title>Second headline</title>
                    <description><![CDATA[Body with <b>markup</b>]]></description>
                </item>
            </channel></rss>"#;

        let items = parse_feed(xml).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].title, "First headline");
        assert_eq!(items[0].description, "First body");
        assert_eq!(items[1].description, "Body with <b>markup</b>");
    }

    #[test]
    fn parses_atom_entries() {
        let xml = r#"<?xml version="1.0"?>
            <feed xmlns="http://www.w3.org/2005/Atom">
                <title>Feed title ignored</title>
                <entry>
                    <title>Atom headline</title>
                    <summary>Atom body</summary>
                </entry>
            </feed>"#;

        let items = parse_feed(xml).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Atom headline");
        assert_eq!(items[0].description, "Atom body");
    }

    #[test]
    fn skips_items_without_titles() {
        let xml = r#"<rss><channel>
            <item><description>no title here</description></item>
            <item><title>Kept</title></item>
        </channel></rss>"#;

        let items = parse_feed(xml).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].title, "Kept");
    }

    #[test]
    fn unescapes_entities() {
        let xml = r#"<rss><channel><item>
            <title>Salt &amp; Pepper</title>
        </item></channel></rss>"#;

        let items = parse_feed(xml).unwrap();
        assert_eq!(items[0].title, "Salt & Pepper");
    }

    #[tokio::test]
    async fn empty_feed_list_is_a_discover_error() {
        let source = RssSource::new(reqwest::Client::new(), Vec::new());
        let err = source.discover().await.unwrap_err();
        assert_eq!(err.stage, Stage::Discover);
    }
}
