use std::path::Path;

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, warn};

use super::{RULE_WIDTH, ScrapeContext, ScrapeError, compact_text, text_lines};
use crate::{
    archive::ANNOUNCEMENTS,
    downloader::write_new,
    portal::Course,
    sanitize::sanitize_filename,
    util::dump_html_for_debug,
};

static CONTAINER: Lazy<Selector> =
    Lazy::new(|| Selector::parse("#ctl00_ContentPlaceHolder1_pnlDuyurular").unwrap());
static ITEM: Lazy<Selector> = Lazy::new(|| Selector::parse("div.col-md-12").unwrap());
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("h4").unwrap());
static DATE: Lazy<Selector> = Lazy::new(|| Selector::parse(".text-muted").unwrap());
static BODY: Lazy<Selector> = Lazy::new(|| Selector::parse(".panel-body").unwrap());

static DATE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{1,2})\.(\d{1,2})\.(\d{4})").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
struct Announcement {
    title: String,
    /// Date line exactly as shown by the portal
    date: String,
    body: String,
}

impl Announcement {
    /// `YYYY-MM-DD - <title>.txt`
    fn file_name(&self) -> String {
        format!("{} - {}.txt", file_date(&self.date), sanitize_filename(&self.title))
    }

    fn render(&self) -> String {
        format!(
            "Başlık: {}\nTarih: {}\n{}\n\n{}",
            self.title,
            self.date,
            "=".repeat(RULE_WIDTH),
            self.body
        )
    }
}

fn file_date(raw: &str) -> String {
    let parsed = DATE_PATTERN.captures(raw).and_then(|caps| {
        NaiveDate::from_ymd_opt(caps[3].parse().ok()?, caps[2].parse().ok()?, caps[1].parse().ok()?)
    });
    match parsed {
        Some(date) => date.format("%Y-%m-%d").to_string(),
        None => sanitize_filename(&raw.replace('.', "-")),
    }
}

/// None when the page does not look like an announcement list
fn parse_announcements(html: &str) -> Option<Vec<Announcement>> {
    let document = Html::parse_document(html);
    let container = document.select(&CONTAINER).next()?;

    let items: Vec<_> = container.select(&ITEM).collect();
    if items.is_empty() {
        return None;
    }

    let announcements = items
        .iter()
        .filter_map(|item| {
            let title = item.select(&TITLE).next()?;
            let date = item.select(&DATE).next()?;
            let body = item.select(&BODY).next()?;
            Some(Announcement {
                title: compact_text(&title),
                date: compact_text(&date),
                body: text_lines(&body),
            })
        })
        .collect();
    Some(announcements)
}

/// Save every announcement of `course` as a text file under `destination`
#[instrument(level = "debug", skip(ctx, course), fields(crn = %course.crn))]
pub async fn archive_announcements(
    ctx: &ScrapeContext<'_>,
    course: &Course,
    destination: &Path,
) -> Result<(), ScrapeError> {
    let url = ctx.session.resolve(&course.page_link(ANNOUNCEMENTS.0))?;
    let html = ctx.downloader.get_page(&url).await.inspect_err(|_| {
        ctx.counters.record_page_failure();
    })?;

    let Some(announcements) = parse_announcements(&html) else {
        warn!(url = %url, "Announcement list not recognised");
        dump_html_for_debug(ctx.debug_dir, &format!("Duyurular_CRN_{}", course.crn), &html).await;
        return Ok(());
    };

    let mut written = 0;
    for announcement in &announcements {
        let path = destination.join(announcement.file_name());
        match write_new(&path, announcement.render().as_bytes()).await {
            Ok(true) => {
                info!(path = ?path, "New announcement");
                ctx.counters.record_artifact();
                written += 1;
            }
            Ok(false) => debug!(path = ?path, "Announcement already saved"),
            Err(e) => warn!(error = %e, title = %announcement.title, "Failed to save announcement"),
        }
    }

    debug!(found = announcements.len(), written, "Announcements archived");
    Ok(())
}
