//! Homework pages
//!
//! Per homework a folder named after its title receives a `detaylar.txt`
//! summary, the resource files attached by the instructor and the files the
//! student submitted. Submissions are either a plain link or an ASP.NET
//! postback that answers with the file.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Url, header};
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, info, instrument, warn};

use super::{RULE_WIDTH, ScrapeContext, ScrapeError, compact_text, text_lines};
use crate::{
    archive::HOMEWORK,
    downloader::{parse_content_disposition, write_new},
    portal::{Course, PortalError},
    sanitize::{repair_mojibake, sanitize_filename},
    util::dump_html_for_debug,
};

const DETAIL_LINK_TEXT: &str = "Ödevi Görüntüle";
const RESOURCES_HEADING: &str = "Kaynak Dosyalar";
const DESCRIPTION_LABEL: &str = "ödev açıklaması";
const SUBMISSION_LINK_TEXT: &str = "Yüklediğiniz ödev dosyalarını indirin";
const POSTBACK_MARKER: &str = "javascript:__doPostBack";
const EVENT_TARGET_FIELD: &str = "__EVENTTARGET";
const DETAILS_FILE_NAME: &str = "detaylar.txt";
const SUBMISSION_FALLBACK_NAME: &str = "teslim_edilen_dosya.zip";
const NO_DEADLINES: &str = "Tarih bilgisi bulunamadı.";
const NO_DESCRIPTION: &str = "Açıklama bulunamadı.";

static LIST_CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("table.data td").unwrap());
static CONTAINER: Lazy<Selector> = Lazy::new(|| Selector::parse("div.orta > div.ic").unwrap());
static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());
static FORM_BLOCK: Lazy<Selector> = Lazy::new(|| Selector::parse("div.form2").unwrap());
static TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table").unwrap());
static DATA_TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse("table.data").unwrap());
static FIELD_TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("span.title_field").unwrap());
static HEADING: Lazy<Selector> = Lazy::new(|| Selector::parse("h2").unwrap());
static POSTBACK_FORM: Lazy<Selector> = Lazy::new(|| Selector::parse("form#aspnetForm").unwrap());
static INPUT: Lazy<Selector> = Lazy::new(|| Selector::parse("input").unwrap());

static POSTBACK_TARGET: Lazy<Regex> = Lazy::new(|| Regex::new(r"__doPostBack\('([^']*)'").unwrap());

/// How the student's own submission can be retrieved
#[derive(Debug, Clone, PartialEq, Eq)]
enum Submission {
    Link(String),
    PostBack {
        action: String,
        fields: Vec<(String, String)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HomeworkDetail {
    title: String,
    /// Contents of `detaylar.txt`; None when the page has no details block
    details: Option<String>,
    resources: Vec<String>,
    submission: Option<Submission>,
}

/// Links of the individual homework pages, in list order
fn parse_homework_links(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut links: Vec<String> = Vec::new();

    for cell in document.select(&LIST_CELL) {
        let detail_link = cell
            .select(&LINK)
            .find(|a| repair_mojibake(&compact_text(a)).contains(DETAIL_LINK_TEXT));
        if let Some(href) = detail_link.and_then(|a| a.value().attr("href")) {
            let href = href.trim().to_string();
            if !links.contains(&href) {
                links.push(href);
            }
        }
    }
    links
}

fn parse_homework_detail(html: &str) -> Result<HomeworkDetail, ScrapeError> {
    let document = Html::parse_document(html);
    let container = document
        .select(&CONTAINER)
        .next()
        .ok_or_else(|| ScrapeError::Layout("no 'div.orta > div.ic' content block".into()))?;
    let title = container
        .select(&TITLE)
        .next()
        .map(|h1| repair_mojibake(&compact_text(&h1)).into_owned())
        .ok_or_else(|| ScrapeError::Layout("homework has no title".into()))?;

    let details = container
        .select(&FORM_BLOCK)
        .next()
        .map(|block| render_details(&title, &block));

    Ok(HomeworkDetail {
        resources: resource_links(&container),
        submission: submission(&document, &container),
        details,
        title,
    })
}

fn render_details(title: &str, block: &ElementRef) -> String {
    let deadlines = block
        .select(&TABLE)
        .next()
        .map(|table| repair_mojibake(&text_lines(&table)).into_owned())
        .unwrap_or_else(|| NO_DEADLINES.to_string());

    let description = block
        .select(&FIELD_TITLE)
        .find(|span| {
            repair_mojibake(&compact_text(span))
                .to_lowercase()
                .contains(DESCRIPTION_LABEL)
        })
        .and_then(|label| {
            label
                .next_siblings()
                .filter_map(ElementRef::wrap)
                .find(|el| el.value().name() == "span" && el.value().classes().any(|c| c == "data_field"))
        })
        .map(|data| repair_mojibake(&text_lines(&data)).into_owned())
        .unwrap_or_else(|| NO_DESCRIPTION.to_string());

    format!(
        "Ödev Detayları: {title}\n{}\n{deadlines}\n\n--- Açıklama ---\n{description}\n",
        "=".repeat(RULE_WIDTH)
    )
}

// <h2>Kaynak Dosyalar</h2><div><table class="data">...<a href="...">
fn resource_links(container: &ElementRef) -> Vec<String> {
    let Some(heading) = container
        .select(&HEADING)
        .find(|h2| repair_mojibake(&compact_text(h2)).contains(RESOURCES_HEADING))
    else {
        return Vec::new();
    };

    heading
        .next_siblings()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "div")
        .and_then(|div| div.select(&DATA_TABLE).next())
        .map(|table| {
            table
                .select(&LINK)
                .filter_map(|a| a.value().attr("href"))
                .map(|href| href.trim().to_string())
                .collect()
        })
        .unwrap_or_default()
}

fn submission(document: &Html, container: &ElementRef) -> Option<Submission> {
    let href = container
        .select(&LINK)
        .find(|a| repair_mojibake(&compact_text(a)).contains(SUBMISSION_LINK_TEXT))?
        .value()
        .attr("href")?
        .trim()
        .to_string();

    if !href.contains(POSTBACK_MARKER) {
        return Some(Submission::Link(href));
    }

    let Some(target) = POSTBACK_TARGET.captures(&href).map(|caps| caps[1].to_string()) else {
        warn!(href = %href, "Postback target not recognised");
        return None;
    };
    let Some(form) = document.select(&POSTBACK_FORM).next() else {
        warn!("Postback form not found, submitted files cannot be downloaded");
        return None;
    };

    let mut fields: Vec<(String, String)> = form
        .select(&INPUT)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            Some((name.to_string(), input.value().attr("value").unwrap_or("").to_string()))
        })
        .collect();
    match fields.iter_mut().find(|(name, _)| name == EVENT_TARGET_FIELD) {
        Some((_, value)) => *value = target,
        None => fields.push((EVENT_TARGET_FIELD.to_string(), target)),
    }

    Some(Submission::PostBack {
        action: form.value().attr("action").unwrap_or("").trim().to_string(),
        fields,
    })
}

/// Archive every homework of `course` into `destination`
#[instrument(level = "debug", skip(ctx, course), fields(crn = %course.crn))]
pub async fn archive_homework(
    ctx: &ScrapeContext<'_>,
    course: &Course,
    destination: &Path,
) -> Result<(), ScrapeError> {
    let list_url = ctx.session.resolve(&course.page_link(HOMEWORK.0))?;
    let html = ctx.downloader.get_page(&list_url).await.inspect_err(|_| {
        ctx.counters.record_page_failure();
    })?;
    if ctx.dump_pages {
        dump_html_for_debug(ctx.debug_dir, &format!("Homework_List_CRN_{}", course.crn), &html).await;
    }

    let links = parse_homework_links(&html);
    if links.is_empty() {
        debug!("No homework listed");
        return Ok(());
    }
    debug!(count = links.len(), "Found homework");

    for href in links {
        let url = match list_url.join(&href) {
            Ok(url) => url,
            Err(e) => {
                warn!(href = %href, error = %e, "Skipping homework with invalid link");
                continue;
            }
        };
        match archive_one(ctx, course, &url, destination).await {
            Ok(()) => {}
            Err(ScrapeError::Store(e)) => return Err(e.into()),
            Err(e) => warn!(url = %url, error = %e, "Skipping homework"),
        }
    }
    Ok(())
}

async fn archive_one(
    ctx: &ScrapeContext<'_>,
    course: &Course,
    url: &Url,
    destination: &Path,
) -> Result<(), ScrapeError> {
    let html = ctx.downloader.get_page(url).await.inspect_err(|_| {
        ctx.counters.record_page_failure();
    })?;
    if ctx.dump_pages {
        let page_id = url.path_segments().and_then(|mut s| s.next_back()).unwrap_or("unknown");
        dump_html_for_debug(
            ctx.debug_dir,
            &format!("Homework_Detail_{page_id}_CRN_{}", course.crn),
            &html,
        )
        .await;
    }

    let detail = parse_homework_detail(&html)?;
    let folder = destination.join(sanitize_filename(&detail.title));
    tokio::fs::create_dir_all(&folder).await?;

    match &detail.details {
        Some(details) => {
            let path = folder.join(DETAILS_FILE_NAME);
            if write_new(&path, details.as_bytes()).await? {
                info!(path = ?path, "Saved homework details");
                ctx.counters.record_artifact();
            }
        }
        None => warn!(url = %url, "Homework has no details block"),
    }

    for href in &detail.resources {
        let link = url.join(href)?;
        let outcome = ctx.downloader.fetch_file(&link, &folder, ctx.handle).await?;
        ctx.counters.record(&outcome);
    }

    match detail.submission {
        Some(Submission::Link(href)) => {
            let link = url.join(&href)?;
            let outcome = ctx.downloader.fetch_file(&link, &folder, ctx.handle).await?;
            ctx.counters.record(&outcome);
        }
        Some(Submission::PostBack { action, fields }) => {
            download_postback(ctx, &url.join(&action)?, &fields, &folder).await?;
        }
        None => {}
    }
    Ok(())
}

/// Replay the page form with the event target set; the response is the file
async fn download_postback(
    ctx: &ScrapeContext<'_>,
    action: &Url,
    fields: &[(String, String)],
    folder: &Path,
) -> Result<(), ScrapeError> {
    debug!(action = %action, "Requesting submitted files");
    let response = ctx.session.post_form(action.clone(), fields).await?;

    let name = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .and_then(|value| parse_content_disposition(&String::from_utf8_lossy(value.as_bytes())))
        .unwrap_or_else(|| SUBMISSION_FALLBACK_NAME.to_string());
    let path = folder.join(sanitize_filename(&name));
    if tokio::fs::try_exists(&path).await? {
        debug!(path = ?path, "Submitted file already saved");
        return Ok(());
    }

    let body = response.bytes().await.map_err(PortalError::from)?;
    if write_new(&path, &body).await? {
        info!(path = ?path, "Saved submitted file");
        ctx.counters.record_artifact();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        archive::RunCounters,
        config::Config,
        db::RecordStore,
        downloader::Downloader,
        portal::Session,
        test_support::MockPortal,
    };

    const LIST_PAGE: &str = r#"<html><body><table class="data">
        <tr><td><b>Ödev 1</b> <a href="/Sinif/1/Odev/11">Ödevi Görüntüle</a></td></tr>
        <tr><td><b>Ödev 2</b> <a href="/Sinif/1/Odev/12">Ödevi Görüntüle</a> <a href="/x">Başka</a></td></tr>
        <tr><td><a href="/Sinif/1/Odev/11">Ödevi Görüntüle</a></td></tr>
        </table></body></html>"#;

    const DETAIL_PAGE: &str = r#"<html><body><form id="aspnetForm" action="./12">
        <input type="hidden" name="__VIEWSTATE" value="vs" />
        <input type="hidden" name="__EVENTTARGET" value="" />
        <div class="orta"><div class="ic">
          <h1>Ödev 2: Graphs</h1>
          <div class="form2">
            <table><tr><td>Teslim Tarihi</td><td>20.05.2024 23:59</td></tr></table>
            <span class="title_field">Ödev Açıklaması</span>
            <span class="data_field">Implement BFS.<br/>Submit a zip.</span>
          </div>
          <h2>Kaynak Dosyalar</h2>
          <div><table class="data"><tr><td><a href="/Sinif/1/Odev/12?g501">graph.txt</a></td></tr></table></div>
          <a href="javascript:__doPostBack('ctl00$ContentPlaceHolder1$lbDownload','')">Yüklediğiniz ödev dosyalarını indirin</a>
        </div></div>
        </form></body></html>"#;

    #[test]
    fn test_homework_links_are_deduplicated() {
        assert_eq!(
            parse_homework_links(LIST_PAGE),
            vec!["/Sinif/1/Odev/11".to_string(), "/Sinif/1/Odev/12".to_string()]
        );
    }

    #[test]
    fn test_parse_homework_detail() {
        let detail = parse_homework_detail(DETAIL_PAGE).unwrap();

        assert_eq!(detail.title, "Ödev 2: Graphs");
        assert_eq!(detail.resources, vec!["/Sinif/1/Odev/12?g501".to_string()]);

        let details = detail.details.unwrap();
        assert!(details.starts_with("Ödev Detayları: Ödev 2: Graphs\n========"));
        assert!(details.contains("Teslim Tarihi\n20.05.2024 23:59\n\n--- Açıklama ---\n"));
        assert!(details.ends_with("Implement BFS.\nSubmit a zip.\n"));

        let Some(Submission::PostBack { action, fields }) = detail.submission else {
            panic!("expected a postback submission");
        };
        assert_eq!(action, "./12");
        assert!(fields.contains(&(
            "__EVENTTARGET".to_string(),
            "ctl00$ContentPlaceHolder1$lbDownload".to_string()
        )));
        assert!(fields.contains(&("__VIEWSTATE".to_string(), "vs".to_string())));
    }

    #[test]
    fn test_direct_submission_link() {
        let html = r#"<div class="orta"><div class="ic"><h1>HW</h1>
            <a href="/Sinif/1/Odev/3?g77">Yüklediğiniz ödev dosyalarını indirin</a></div></div>"#;
        let detail = parse_homework_detail(html).unwrap();

        assert_eq!(detail.submission, Some(Submission::Link("/Sinif/1/Odev/3?g77".to_string())));
        assert_eq!(detail.details, None);
        assert!(detail.resources.is_empty());
    }

    #[test]
    fn test_missing_content_block_is_a_layout_error() {
        assert!(matches!(
            parse_homework_detail("<html><h1>Hata</h1></html>"),
            Err(ScrapeError::Layout(_))
        ));
    }

    #[tokio::test]
    async fn test_archive_homework_saves_details_resources_and_submission() {
        let portal = MockPortal::default();
        portal.html(
            "/Sinif/1/Odevler",
            r#"<table class="data">
                 <tr><td><a href="/Sinif/1/Odev/11">Ödevi Görüntüle</a></td></tr>
                 <tr><td><a href="/Sinif/1/Odev/12">Ödevi Görüntüle</a></td></tr>
               </table>"#,
        );
        portal.html("/Sinif/1/Odev/12", DETAIL_PAGE);
        portal.file("/Sinif/1/Odev/12?g501", "graph.txt", b"1 2\n2 3\n");
        portal.post_response(
            "/Sinif/1/Odev/12",
            vec![(
                "content-disposition".to_string(),
                "attachment; filename=\"teslim.zip\"".to_string(),
            )],
            b"zipbytes",
        );
        let base = portal.serve().await;

        let dir = tempfile::tempdir().unwrap();
        let config = Config::for_tests(dir.path(), base.as_str());
        let session = Session::anonymous(base.clone());
        let store = Arc::new(RecordStore::open(dir.path(), false).unwrap());
        let downloader = Downloader::new(
            session.client().clone(),
            store,
            &config.fetch,
            CancellationToken::new(),
        );
        let handle = downloader.store().handle().unwrap();
        let counters = RunCounters::default();
        let ctx = ScrapeContext {
            session: &session,
            downloader: &downloader,
            handle: &handle,
            counters: &counters,
            debug_dir: &config.debug_dir,
            dump_pages: false,
        };
        let course = Course {
            code: "BLG 223E".to_string(),
            name: "Data Structures".to_string(),
            crn: "21345".to_string(),
            link: "/Sinif/1".to_string(),
        };

        archive_homework(&ctx, &course, dir.path()).await.unwrap();

        let folder = dir.path().join("Ödev 2_ Graphs");
        let details = std::fs::read_to_string(folder.join(DETAILS_FILE_NAME)).unwrap();
        assert!(details.contains("Implement BFS."));
        assert_eq!(std::fs::read(folder.join("graph.txt")).unwrap(), b"1 2\n2 3\n");
        assert_eq!(std::fs::read(folder.join("teslim.zip")).unwrap(), b"zipbytes");

        let forms = portal.posted_forms();
        assert_eq!(forms.len(), 1);
        assert!(forms[0].1.contains("__EVENTTARGET=ctl00%24ContentPlaceHolder1%24lbDownload"));

        let summary = counters.snapshot();
        assert_eq!(summary.written_new, 1);
        assert_eq!(summary.artifacts, 2);
        assert_eq!(summary.pages_failed, 1);

        archive_homework(&ctx, &course, dir.path()).await.unwrap();

        let summary = counters.snapshot();
        assert_eq!(summary.artifacts, 2);
        assert_eq!(summary.skipped_identical, 1);
        assert!(!folder.join("teslim_yeni.zip").exists());
    }
}
