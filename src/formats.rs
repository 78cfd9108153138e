use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// TOC document as served by the host's `nest/epub/toc` endpoint.
///
/// Fields beyond the ones the crawler needs are kept in `extra` so the
/// manifest templates see the whole document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocDocument {
    pub title_safe: String,
    pub title: String,
    #[serde(deserialize_with = "string_or_number")]
    pub book_id: String,
    pub thumbnail_tag: String,
    pub items: Vec<TocItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TocItem {
    pub url: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Per-section descriptor returned for each TOC item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageDescriptor {
    pub content: String,
    pub full_path: String,
    #[serde(default)]
    pub images: Vec<Option<String>>,
}

impl PageDescriptor {
    /// Image references, skipping null and empty entries.
    pub fn image_refs(&self) -> impl Iterator<Item = &str> {
        self.images
            .iter()
            .filter_map(|img| img.as_deref())
            .filter(|img| !img.trim().is_empty())
    }
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toc_accepts_numeric_book_id_and_keeps_extra_fields() {
        let toc: TocDocument = serde_json::from_str(
            r#"{"title_safe":"t","title":"T","book_id":9781,"thumbnail_tag":"",
                "items":[{"url":"/a","label":"Intro"}],"authors":["A"]}"#,
        )
        .unwrap();
        assert_eq!(toc.book_id, "9781");
        assert_eq!(toc.items[0].extra["label"], "Intro");
        assert!(toc.extra.contains_key("authors"));

        let value = serde_json::to_value(&toc).unwrap();
        assert_eq!(value["items"][0]["label"], "Intro");
        assert_eq!(value["book_id"], "9781");
    }

    #[test]
    fn descriptor_skips_empty_image_refs() {
        let page: PageDescriptor = serde_json::from_str(
            r#"{"content":"/c","full_path":"ch01.html","images":["a.png","",null,"b.png"]}"#,
        )
        .unwrap();
        assert_eq!(page.image_refs().collect::<Vec<_>>(), vec!["a.png", "b.png"]);
    }

    #[test]
    fn descriptor_without_images_is_valid() {
        let page: PageDescriptor =
            serde_json::from_str(r#"{"content":"/c","full_path":"ch01.html"}"#).unwrap();
        assert_eq!(page.image_refs().count(), 0);
    }
}
