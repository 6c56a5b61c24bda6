use std::fmt;

use serde::{Deserialize, Serialize};

/// Keys of the settings log.
pub mod settings {
    pub const BLOG_NAME: &str = "blogName";
    pub const BLOG_DESCRIPTION: &str = "blogDescription";
    pub const POSTS_DB_ADDRESS: &str = "postsDBAddress";
    pub const COMMENTS_DB_ADDRESS: &str = "commentsDBAddress";
    pub const MEDIA_DB_ADDRESS: &str = "mediaDBAddress";
    pub const PROFILE_PICTURE: &str = "profilePicture";
    pub const OWNER_IDENTITY: &str = "ownerIdentity";
}

/// Conventional role of a log within a blog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Settings,
    Posts,
    Comments,
    Media,
    Other,
}

impl LogKind {
    /// Settings keys that hold the address of another log, with that log's kind.
    pub const CROSS_REFERENCES: [(&'static str, LogKind); 3] = [
        (settings::POSTS_DB_ADDRESS, LogKind::Posts),
        (settings::COMMENTS_DB_ADDRESS, LogKind::Comments),
        (settings::MEDIA_DB_ADDRESS, LogKind::Media),
    ];

    /// Classify a log by its manifest name.
    ///
    /// Names are matched case-insensitively on their suffix, so both
    /// `settings` and `myblog-settings` are settings logs.
    pub fn from_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.ends_with("settings") {
            Self::Settings
        } else if name.ends_with("posts") {
            Self::Posts
        } else if name.ends_with("comments") {
            Self::Comments
        } else if name.ends_with("media") {
            Self::Media
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Posts => "posts",
            Self::Comments => "comments",
            Self::Media => "media",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entry of the media log. `cid` names a blob in the blob store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub cid: String,
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub media_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_from_name() {
        assert_eq!(LogKind::from_name("settings"), LogKind::Settings);
        assert_eq!(LogKind::from_name("MyBlog-Settings"), LogKind::Settings);
        assert_eq!(LogKind::from_name("posts"), LogKind::Posts);
        assert_eq!(LogKind::from_name("comments"), LogKind::Comments);
        assert_eq!(LogKind::from_name("media"), LogKind::Media);
        assert_eq!(LogKind::from_name("drafts"), LogKind::Other);
    }

    #[test]
    fn cross_references_cover_dependent_logs() {
        let kinds: Vec<LogKind> = LogKind::CROSS_REFERENCES.iter().map(|(_, k)| *k).collect();
        assert_eq!(kinds, vec![LogKind::Posts, LogKind::Comments, LogKind::Media]);
    }

    #[test]
    fn media_record_uses_type_field() {
        let m: MediaRecord = serde_json::from_value(json!({
            "id": "m1", "cid": "abc", "name": "cat.png", "size": 12, "type": "image/png"
        }))
        .unwrap();
        assert_eq!(m.media_type, "image/png");
        assert_eq!(serde_json::to_value(&m).unwrap()["type"], "image/png");
    }
}
