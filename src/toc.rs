use anyhow::Context as _;
use scraper::{Html, Selector};

use crate::formats::{TocDocument, TocItem};

/// Parsed table of contents plus the values derived from it once.
#[derive(Debug, Clone)]
pub struct TableOfContents {
    pub document: TocDocument,
    /// Title with filename-hostile characters replaced, used for the archive name.
    pub sanitized_title: String,
    /// `src` of the thumbnail `<img>`, if the tag carries one.
    pub cover_ref: Option<String>,
}

impl TableOfContents {
    pub fn parse(body: &[u8]) -> anyhow::Result<Self> {
        let document: TocDocument = serde_json::from_slice(body).context("parse toc json")?;
        if document.items.is_empty() {
            anyhow::bail!("toc has no items");
        }

        let sanitized_title = sanitize_title(&document.title);
        let cover_ref = cover_ref_from_thumbnail_tag(&document.thumbnail_tag);

        Ok(Self {
            document,
            sanitized_title,
            cover_ref,
        })
    }

    pub fn book_id(&self) -> &str {
        &self.document.book_id
    }

    pub fn title(&self) -> &str {
        &self.document.title
    }

    /// Slug used by the host in image URLs.
    pub fn title_safe(&self) -> &str {
        &self.document.title_safe
    }

    pub fn items(&self) -> &[TocItem] {
        &self.document.items
    }
}

/// Replaces `"%*/:<>?\|~` and every whitespace run with `_`.
pub fn sanitize_title(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut in_whitespace = false;
    for ch in title.chars() {
        if ch.is_whitespace() {
            if !in_whitespace {
                out.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        match ch {
            '"' | '%' | '*' | '/' | ':' | '<' | '>' | '?' | '\\' | '|' | '~' => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}

fn cover_ref_from_thumbnail_tag(tag: &str) -> Option<String> {
    let fragment = Html::parse_fragment(tag);
    let selector = Selector::parse("img[src]").ok()?;
    fragment
        .select(&selector)
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(str::trim)
        .filter(|src| !src.is_empty())
        .map(str::to_owned)
}
