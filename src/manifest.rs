use std::path::Path;

use anyhow::Context as _;
use chrono::Utc;
use serde_json::{Map, Value};
use tera::{Context, Tera};

use crate::formats::TocDocument;
use crate::staging::{Payload, StagingFs, sanitize_relative_path, to_slash_path};
use crate::xhtml::xml_escape;

pub const CONTENT_OPF: &str = "OEBPS/content.opf";
pub const TOC_NCX: &str = "OEBPS/toc.ncx";

/// TOC items that name their page file, each with `href` set to the same
/// sanitized path the page is written to under `OEBPS/`.
///
/// Items without a `full_path` are left out: the file they become is only
/// known once their page descriptor is fetched, after the manifests are done.
pub fn manifest_pages(toc: &TocDocument) -> Vec<Map<String, Value>> {
    toc.items
        .iter()
        .filter_map(|item| {
            let full_path = item.extra.get("full_path")?.as_str()?;
            let href = to_slash_path(&sanitize_relative_path(full_path)?);
            let mut page = item.extra.clone();
            page.insert("url".to_owned(), Value::String(item.url.clone()));
            page.insert("href".to_owned(), Value::String(href));
            Some(page)
        })
        .collect()
}

/// Renders one manifest template. `info` is the whole TOC document, `pages`
/// its [`manifest_pages`] and `modified` the timestamp stamped into the
/// package metadata.
pub fn render_manifest(
    name: &str,
    template: &str,
    toc: &TocDocument,
    modified: &str,
) -> anyhow::Result<String> {
    let mut tera = Tera::default();
    tera.autoescape_on(vec![".opf", ".ncx"]);
    tera.set_escape_fn(xml_escape);
    tera.add_raw_template(name, template)
        .with_context(|| format!("parse manifest template: {name}"))?;

    let mut context = Context::new();
    context.insert("info", toc);
    context.insert("pages", &manifest_pages(toc));
    context.insert("modified", modified);

    tera.render(name, &context)
        .with_context(|| format!("render manifest template: {name}"))
}

/// Renders `content.opf` and `toc.ncx` in place, replacing the skeleton templates.
pub fn render_manifests(staging: &dyn StagingFs, toc: &TocDocument) -> anyhow::Result<()> {
    let modified = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    for rel in [CONTENT_OPF, TOC_NCX] {
        let rel_path = Path::new(rel);
        let template = staging
            .read_to_string(rel_path)
            .with_context(|| format!("read manifest template: {rel}"))?;
        let name = rel_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(rel);
        let rendered = render_manifest(name, &template, toc, &modified)?;
        staging
            .write(rel_path, Payload::Text(&rendered))
            .with_context(|| format!("write manifest: {rel}"))?;
        tracing::debug!(path = rel, "rendered manifest");
    }
    Ok(())
}
