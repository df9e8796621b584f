//! Bookmark records and the card data derived from them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use url::Url;

use crate::error::{Error, Result};

/// A saved bookmark as stored in the `bookmarks` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(default = "default_category")]
    pub category: String,
    pub created_at: DateTime<Utc>,
    pub user_id: String,
}

fn default_category() -> String {
    Category::General.label().to_string()
}

// Tables created with a bigint key deliver ids as JSON numbers.
fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Number(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Number(n) => n.to_string(),
    })
}

/// Insert payload. The store assigns `id` and `created_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewBookmark {
    pub title: String,
    pub url: String,
    pub category: String,
    pub user_id: String,
}

impl NewBookmark {
    /// Trims the fields and rejects an empty title or URL. An empty category
    /// becomes `General`; any other category is kept as typed.
    pub fn new(user_id: &str, title: &str, url: &str, category: &str) -> Result<Self> {
        let title = title.trim();
        let url = url.trim();
        if title.is_empty() {
            return Err(Error::invalid_input("title must not be empty"));
        }
        if url.is_empty() {
            return Err(Error::invalid_input("url must not be empty"));
        }

        let category = match category.trim() {
            "" => Category::General.label().to_string(),
            other => other.to_string(),
        };

        Ok(Self {
            title: title.to_string(),
            url: url.to_string(),
            category,
            user_id: user_id.to_string(),
        })
    }
}

/// The categories offered in the creation form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    General,
    Dev,
    Design,
    Personal,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::General,
        Category::Dev,
        Category::Design,
        Category::Personal,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Category::General => "General",
            Category::Dev => "Dev",
            Category::Design => "Design",
            Category::Personal => "Personal",
        }
    }

    /// Exact, case-sensitive match on the label.
    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.label() == label)
    }

    pub fn tag_style(&self) -> TagStyle {
        let classes = match self {
            Category::Dev => "bg-indigo-500/10 text-indigo-400",
            Category::Design => "bg-amber-500/10 text-amber-400",
            Category::Personal => "bg-pink-500/10 text-pink-400",
            Category::General => "bg-emerald-500/10 text-emerald-400",
        };
        TagStyle {
            category: *self,
            classes,
        }
    }

    /// Style for a stored category string; unknown categories use `General`.
    pub fn style_for(category: &str) -> TagStyle {
        Self::from_label(category)
            .unwrap_or(Category::General)
            .tag_style()
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Visual style of a category tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagStyle {
    /// The category whose palette is used
    pub category: Category,
    /// Utility classes for web renderers
    pub classes: &'static str,
}

/// Host part of `url`, or an empty string when it does not parse.
pub fn hostname(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_default()
}

/// Google favicon service URL for `url`'s host; `None` renders a generic link icon.
pub fn favicon_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(format!(
        "https://www.google.com/s2/favicons?domain={}&sz=40",
        host
    ))
}

/// Everything a front-end needs to draw one bookmark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookmarkCard {
    pub id: String,
    pub title: String,
    pub url: String,
    pub hostname: String,
    pub favicon_url: Option<String>,
    /// The stored category, shown verbatim
    pub category: String,
    pub tag: TagStyle,
    /// True while the create is still waiting for the store
    pub pending: bool,
    pub created_at: DateTime<Utc>,
}

impl BookmarkCard {
    pub fn from_bookmark(bookmark: &Bookmark, pending: bool) -> Self {
        Self {
            id: bookmark.id.clone(),
            title: bookmark.title.clone(),
            url: bookmark.url.clone(),
            hostname: hostname(&bookmark.url),
            favicon_url: favicon_url(&bookmark.url),
            category: bookmark.category.clone(),
            tag: Category::style_for(&bookmark.category),
            pending,
            created_at: bookmark.created_at,
        }
    }
}
