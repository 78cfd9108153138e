use std::path::Path;

use anyhow::Context as _;
use scraper::{Html, Selector};

use crate::staging::{Payload, StagingFs, oebps_path};
use crate::xhtml::{ensure_xhtml_void_tags, replace_html_only_entities};

const PAGE_HEAD: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops">
    <head>
        <title></title>
        <style>
        p.pre {
            font-family: monospace;
            white-space: pre;
        }
        </style>
    </head>
"#;

/// Wraps the `<body>` of a fetched page into the fixed XHTML page template.
pub fn render_page(raw_html: &str) -> String {
    let body = extract_body(raw_html);
    let body = replace_html_only_entities(&ensure_xhtml_void_tags(&body));

    let mut out = String::with_capacity(PAGE_HEAD.len() + body.len() + 16);
    out.push_str(PAGE_HEAD);
    out.push_str("    ");
    out.push_str(&body);
    out.push_str("\n</html>");
    out
}

/// Renders `raw_html` and stores it at `OEBPS/<dest>`.
pub fn write_page(staging: &dyn StagingFs, dest: &Path, raw_html: &str) -> anyhow::Result<()> {
    let xhtml = render_page(raw_html);
    staging
        .write(&oebps_path(dest), Payload::Text(&xhtml))
        .with_context(|| format!("write page: {}", dest.display()))
}

fn extract_body(raw_html: &str) -> String {
    let doc = Html::parse_document(raw_html);
    let body = Selector::parse("body")
        .ok()
        .and_then(|sel| doc.select(&sel).next().map(|node| node.html()));
    body.unwrap_or_else(|| "<body></body>".to_owned())
}
