//! smartmarks library crate
//!
//! AI-derived smart categories, tags and summaries layered over a host
//! bookmark tree. The host supplies bookmark records and calls
//! [`smart::regenerate`] (or [`tagging::tag_bookmarks`]); results are kept in a
//! [`store::MetadataStore`].

pub mod bookmark;
pub mod config;
pub mod crawler;
pub mod error;
pub mod llm;
pub mod smart;
pub mod store;
pub mod tagging;
pub mod util;

pub use bookmark::{
    Bookmark, BookmarkMeta, MetaUpdate, SmartCategory, SourceBookmark, UNCATEGORIZED_ID,
};
pub use config::Config;
pub use crawler::{PageFetcher, PageLookup, WebContent};
pub use error::{Error, Result};
pub use llm::{AiSettings, CompletionClient, CompletionRequest, OpenAiClient};
pub use smart::{regenerate, BackoffPolicy, CancelToken, RunReport, SmartCategorizer};
pub use store::{FileBackend, MemoryBackend, MetadataStore};
pub use tagging::{
    generate_tags_and_summary, tag_bookmarks, tag_bookmarks_with_pages, TaggingReport,
};
