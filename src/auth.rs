use std::fmt;

use anyhow::Context as _;
use scraper::{Html, Selector};
use url::Url;

use crate::config::SiteConfig;

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Login form found on the host's landing page, with credentials filled in.
#[derive(Clone)]
pub struct LoginForm {
    pub action: Url,
    pub fields: Vec<(String, String)>,
}

impl fmt::Debug for LoginForm {
    // Field values include the password; only names are shown.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoginForm")
            .field("action", &self.action.as_str())
            .field(
                "fields",
                &self.fields.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl LoginForm {
    /// Takes the first `<form>` of `html`, keeps its pre-filled inputs (CSRF
    /// tokens and the like) and sets the email and password fields.
    pub fn from_html(
        html: &str,
        page_url: &Url,
        site: &SiteConfig,
        credentials: &Credentials,
    ) -> anyhow::Result<Self> {
        let doc = Html::parse_document(html);
        let form_sel = selector("form")?;
        let input_sel = selector("input[name]")?;

        let form = doc
            .select(&form_sel)
            .next()
            .ok_or_else(|| anyhow::anyhow!("no login form on {page_url}"))?;

        let action = match form.value().attr("action").map(str::trim) {
            Some(action) if !action.is_empty() => page_url
                .join(action)
                .with_context(|| format!("resolve login form action: {action}"))?,
            _ => page_url.clone(),
        };

        let mut fields: Vec<(String, String)> = Vec::new();
        for input in form.select(&input_sel) {
            let element = input.value();
            let Some(name) = element.attr("name") else {
                continue;
            };
            let kind = element.attr("type").unwrap_or("text").to_ascii_lowercase();
            match kind.as_str() {
                "submit" | "button" | "image" | "reset" | "file" => continue,
                "checkbox" | "radio" if element.attr("checked").is_none() => continue,
                _ => {}
            }
            let value = element.attr("value").unwrap_or_default();
            fields.push((name.to_owned(), value.to_owned()));
        }

        set_field(&mut fields, &site.email_field, &credentials.email);
        set_field(&mut fields, &site.password_field, &credentials.password);

        Ok(Self { action, fields })
    }
}

fn set_field(fields: &mut Vec<(String, String)>, name: &str, value: &str) {
    fields.retain(|(existing, _)| existing != name);
    fields.push((name.to_owned(), value.to_owned()));
}

fn selector(css: &str) -> anyhow::Result<Selector> {
    Selector::parse(css).map_err(|err| anyhow::anyhow!("invalid selector {css:?}: {err:?}"))
}
