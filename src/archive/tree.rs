//! Tree traversal over the portal's file listing pages

use std::{path::Path, str::FromStr};

use bytesize::ByteSize;
use once_cell::sync::Lazy;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, error, instrument, trace, warn};

use super::{Archiver, Unit};
use crate::{db::StoreError, db::StoreHandle, sanitize::sanitize_filename};

static LISTING_TABLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".dosyaSistemi table.data").unwrap());
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").unwrap());
static ANCHOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a").unwrap());
static ICON: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());

const FOLDER_ICON_SUFFIX: &str = "/folder.png";

/// One entry of a listing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingRow {
    pub name: String,
    pub link: String,
    /// Declared size; always present for files
    pub size: Option<ByteSize>,
    pub is_folder: bool,
}

impl ListingRow {
    // <tr>
    //   <td><img src="/images/ds/folder.png"/> <a href="/Sinif/1/DersDosyalari?g5">Hafta 1</a></td>
    //   <td>1,5 MB</td> ...
    // </tr>
    fn from_row(row: &ElementRef) -> Option<Self> {
        let cells: Vec<ElementRef> = row.select(&CELL).collect();
        let first = cells.first()?;

        let anchor = first.select(&ANCHOR).next()?;
        let link = anchor.value().attr("href")?.trim().to_string();
        let name = anchor.text().collect::<String>().trim().to_string();
        if link.is_empty() {
            return None;
        }

        let is_folder = first
            .select(&ICON)
            .next()
            .and_then(|img| img.value().attr("src"))
            .is_some_and(|src| src.ends_with(FOLDER_ICON_SUFFIX));

        let size = cells.get(1).and_then(|cell| parse_size(&cell.text().collect::<String>()));
        if !is_folder && size.is_none() {
            return None;
        }

        Some(Self {
            name,
            link,
            size,
            is_folder,
        })
    }
}

/// "1,5 MB" / "300 KB" as shown by the portal, which counts in powers of 1024
fn parse_size(text: &str) -> Option<ByteSize> {
    let compact: String = text
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| if c == ',' { '.' } else { c.to_ascii_uppercase() })
        .collect();
    let binary = match compact.strip_suffix('B') {
        Some(head) if head.ends_with(['K', 'M', 'G']) => format!("{head}iB"),
        _ => compact,
    };
    ByteSize::from_str(&binary).ok()
}

/// Rows of the listing table, header excluded.
///
/// None when the page has no listing table at all (a link that points
/// somewhere else). Malformed rows are dropped.
pub fn parse_listing(html: &str) -> Option<Vec<ListingRow>> {
    let document = Html::parse_document(html);
    let table = document.select(&LISTING_TABLE).next()?;

    let rows = table
        .select(&ROW)
        .skip(1)
        .filter_map(|row| {
            let parsed = ListingRow::from_row(&row);
            if parsed.is_none() {
                trace!(row = %row.html(), "Skipping unparseable listing row");
            }
            parsed
        })
        .collect();
    Some(rows)
}

impl Archiver {
    /// Walk one listing page into `destination`.
    ///
    /// Sub-folders and large files become their own units; small files are
    /// fetched here, in table order.
    #[instrument(level = "debug", skip(self, handle), fields(url = %url))]
    pub(super) async fn traverse(
        &self,
        url: &Url,
        destination: &Path,
        handle: &StoreHandle,
    ) -> Result<(), StoreError> {
        let html = match self.downloader.get_page(url).await {
            Ok(html) => html,
            Err(e) => {
                warn!(error = %e, dir = ?destination, "Failed to fetch listing page");
                self.counters.record_page_failure();
                return Ok(());
            }
        };

        let Some(rows) = parse_listing(&html) else {
            debug!("No listing table on page");
            return Ok(());
        };
        debug!(rows = rows.len(), "Parsed listing page");

        let threshold = self.config.fetch.large_file_threshold;
        for row in rows {
            if self.cancel_token.is_cancelled() {
                break;
            }

            let link = match url.join(&row.link) {
                Ok(link) => link,
                Err(e) => {
                    warn!(link = %row.link, error = %e, "Skipping row with invalid link");
                    continue;
                }
            };

            if row.is_folder {
                let folder = destination.join(sanitize_filename(&row.name));
                if let Err(e) = tokio::fs::create_dir_all(&folder).await {
                    error!(error = %e, dir = ?folder, "Failed to create folder, skipping it");
                    continue;
                }
                self.spawn_unit(Unit::Folder {
                    url: link,
                    destination: folder,
                });
            } else if row.size.is_some_and(|size| size > threshold) {
                debug!(name = %row.name, size = ?row.size, "Large file, fetching in its own unit");
                self.spawn_unit(Unit::File {
                    url: link,
                    destination: destination.to_path_buf(),
                });
            } else {
                let outcome = self.downloader.fetch_file(&link, destination, handle).await?;
                self.counters.record(&outcome);
            }
        }
        Ok(())
    }
}
