use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Placeholder app URI meaning "the app this graph runs in".
pub const LOCALHOST: &str = "localhost";

/// Address of an extension (or, with empty group/extension, of the engine)
/// inside a running app.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
pub struct Location {
    #[serde(default)]
    pub app_uri: String,
    #[serde(default)]
    pub graph_id: String,
    #[serde(default)]
    pub extension_group_name: String,
    #[serde(default)]
    pub extension_name: String,
}

impl Location {
    pub fn new(
        app_uri: impl Into<String>,
        graph_id: impl Into<String>,
        extension_group_name: impl Into<String>,
        extension_name: impl Into<String>,
    ) -> Self {
        Self {
            app_uri: app_uri.into(),
            graph_id: graph_id.into(),
            extension_group_name: extension_group_name.into(),
            extension_name: extension_name.into(),
        }
    }

    /// The engine of a graph is addressed by app + graph only.
    pub fn engine(app_uri: impl Into<String>, graph_id: impl Into<String>) -> Self {
        Self::new(app_uri, graph_id, "", "")
    }

    pub fn is_empty(&self) -> bool {
        self.app_uri.is_empty()
            && self.graph_id.is_empty()
            && self.extension_group_name.is_empty()
            && self.extension_name.is_empty()
    }

    pub fn is_engine(&self) -> bool {
        self.extension_group_name.is_empty() && self.extension_name.is_empty()
    }

    /// Replace the `localhost` placeholder (or an empty app URI) with the
    /// URI of the running app.
    pub fn translate_localhost(&mut self, app_uri: &str) {
        if self.app_uri.is_empty() || self.app_uri == LOCALHOST {
            self.app_uri = app_uri.to_string();
        }
    }

    pub fn with_localhost_translated(mut self, app_uri: &str) -> Self {
        self.translate_localhost(app_uri);
        self
    }

    /// Same app/graph/group/extension after placeholder resolution.
    pub fn matches(&self, other: &Location, app_uri: &str) -> bool {
        self.clone().with_localhost_translated(app_uri)
            == other.clone().with_localhost_translated(app_uri)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.app_uri, self.graph_id, self.extension_group_name, self.extension_name
        )
    }
}
