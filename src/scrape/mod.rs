//! Scrapers for the announcement and homework pages.
//!
//! Their output (text notes, submitted files) is guarded by file existence
//! only. Homework resources are the exception: they are regular portal files
//! and go through the fetch engine like every other download.

mod announcements;
mod homework;

use std::path::Path;

use scraper::ElementRef;
use thiserror::Error;

use crate::{
    archive::RunCounters,
    db::{StoreError, StoreHandle},
    downloader::{Downloader, FetchError},
    portal::{PortalError, Session},
};

pub use announcements::archive_announcements;
pub use homework::archive_homework;

/// Width of the separator line in the text notes
const RULE_WIDTH: usize = 40;

#[derive(Error, Debug)]
pub enum ScrapeError {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Portal error: {0}")]
    Portal(#[from] PortalError),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("page layout not recognised: {0}")]
    Layout(String),
}

/// Everything a scraper borrows from the unit running it
pub struct ScrapeContext<'a> {
    pub session: &'a Session,
    pub downloader: &'a Downloader,
    pub handle: &'a StoreHandle,
    pub counters: &'a RunCounters,
    pub debug_dir: &'a Path,
    /// Dump every fetched page, not only unrecognised ones
    pub dump_pages: bool,
}

/// Text of an element with every fragment trimmed, fragments joined without separator
fn compact_text(element: &ElementRef) -> String {
    element.text().map(str::trim).collect::<String>()
}

/// Text of an element, one non-empty trimmed fragment per line
fn text_lines(element: &ElementRef) -> String {
    element
        .text()
        .map(str::trim)
        .filter(|fragment| !fragment.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use scraper::{Html, Selector};

    #[test]
    fn test_text_helpers() {
        let html = Html::parse_fragment("<div> Vize <b>tarihi</b>\n <p> 12.04.2024 </p></div>");
        let selector = Selector::parse("div").unwrap();
        let div = html.select(&selector).next().unwrap();

        assert_eq!(compact_text(&div), "Vizetarihi12.04.2024");
        assert_eq!(text_lines(&div), "Vize\ntarihi\n12.04.2024");
    }
}
