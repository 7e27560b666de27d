//! Page parsers for the news portal.
//!
//! Scraping follows a two-phase pattern:
//!
//! 1. **Indexing** ([`listing`]): discover article URLs on a category page
//! 2. **Extraction** ([`article`]): turn an article page into its fields and
//!    genre signals
//!
//! Both phases are pure functions of the HTML; fetching lives in
//! [`crate::fetch`].

pub mod article;
pub mod listing;
