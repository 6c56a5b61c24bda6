use std::collections::BTreeMap;
use std::str::FromStr;

use blogmesh_types::{settings, Cid, LogAddress, MediaRecord};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

/// Key under which posts and comments store their primary key.
const PRIMARY_KEY: &str = "_id";

/// Settings of a blog that has replicated far enough to be shown.
///
/// Only constructible from a view carrying a name, a description and a
/// parseable posts address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlogSettings {
    pub name: String,
    pub description: String,
    pub posts_address: LogAddress,
    pub comments_address: Option<LogAddress>,
    pub media_address: Option<LogAddress>,
    pub profile_picture: Option<Cid>,
}

impl BlogSettings {
    /// Read settings from a materialized settings log, or `None` while any
    /// required key is still missing.
    pub fn from_view(view: &BTreeMap<String, Value>) -> Option<Self> {
        let name = non_empty(view, settings::BLOG_NAME)?;
        let description = non_empty(view, settings::BLOG_DESCRIPTION)?;
        let posts_address = address(view, settings::POSTS_DB_ADDRESS)?;
        Some(Self {
            name: name.to_owned(),
            description: description.to_owned(),
            posts_address,
            comments_address: address(view, settings::COMMENTS_DB_ADDRESS),
            media_address: address(view, settings::MEDIA_DB_ADDRESS),
            profile_picture: non_empty(view, settings::PROFILE_PICTURE)
                .and_then(|raw| Cid::from_str(raw).ok()),
        })
    }

    /// Every log address this blog spans, settings excluded.
    pub fn addresses(&self) -> Vec<LogAddress> {
        std::iter::once(self.posts_address.clone())
            .chain(self.comments_address.clone())
            .chain(self.media_address.clone())
            .collect()
    }
}

fn non_empty<'a>(view: &'a BTreeMap<String, Value>, key: &str) -> Option<&'a str> {
    view.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn address(view: &BTreeMap<String, Value>, key: &str) -> Option<LogAddress> {
    let raw = non_empty(view, key)?;
    match LogAddress::parse(raw) {
        Ok(address) => Some(address),
        Err(e) => {
            warn!(%key, value = %raw, error = %e, "ignoring malformed log address");
            None
        }
    }
}

/// A post or comment, keyed by `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Post {
    /// Build a post from a stored record, moving `_id` into `id`.
    ///
    /// Records without `_id` take their log key as id. Non-object values are
    /// skipped.
    pub fn from_record(key: &str, value: &Value) -> Option<Self> {
        let mut fields = value.as_object()?.clone();
        let id = match fields.remove(PRIMARY_KEY) {
            Some(Value::String(id)) => id,
            Some(other) => other.to_string(),
            None => key.to_owned(),
        };
        Some(Self { id, fields })
    }

    pub fn title(&self) -> Option<&str> {
        self.fields.get("title").and_then(Value::as_str)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }
}

/// Posts of a materialized view, ordered by log key.
pub fn posts_from_view(view: &BTreeMap<String, Value>) -> Vec<Post> {
    view.iter()
        .filter_map(|(key, value)| Post::from_record(key, value))
        .collect()
}

/// Media records of a materialized view. Records that do not parse are skipped.
pub fn media_from_view(view: &BTreeMap<String, Value>) -> Vec<MediaRecord> {
    view.iter()
        .filter_map(|(key, value)| match serde_json::from_value(value.clone()) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(%key, error = %e, "skipping malformed media record");
                None
            }
        })
        .collect()
}

/// Everything a reader needs to render a blog.
///
/// Published to observers only once the settings are complete; `comments`
/// and `media` are filled when those logs are reachable and empty otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlogState {
    pub address: LogAddress,
    pub settings: BlogSettings,
    pub posts: Vec<Post>,
    pub comments: Vec<Post>,
    pub media: Vec<MediaRecord>,
}

impl BlogState {
    pub fn post(&self, id: &str) -> Option<&Post> {
        self.posts.iter().find(|p| p.id == id)
    }
}
