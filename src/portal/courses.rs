//! Course enumeration
//!
//! The campus page carries an access tree with one link per enrolled section
//! (`CRN: 21345`). Code and title live on each section's class information
//! page.

use std::{collections::HashSet, fmt};

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, warn};

use super::{LOGIN_PATH, PortalError, Session};
use crate::sanitize::sanitize_filename;

const CRN_PREFIX: &str = "CRN:";
const CLASS_INFO_SUFFIX: &str = "/SinifBilgileri";

static COURSE_LINKS: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#".menuErisimAgaci a[href*="/Sinif/"]"#).unwrap());
static CLASS_INFO_TABLE: Lazy<Selector> = Lazy::new(|| Selector::parse(".formAbetGoster").unwrap());
static ROW: Lazy<Selector> = Lazy::new(|| Selector::parse("tr").unwrap());
static CELL: Lazy<Selector> = Lazy::new(|| Selector::parse("td").unwrap());

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Course {
    pub code: String,
    pub name: String,
    /// Enrollment id of the section
    pub crn: String,
    /// Portal-relative link of the section, e.g. `/Sinif/12345.67890`
    pub link: String,
}

impl Course {
    /// Local folder of the course; the CRN keeps two sections of one course apart
    pub fn folder_name(&self) -> String {
        sanitize_filename(&format!("{} (CRN {})", self.code, self.crn))
    }

    /// Link of one of the section's pages (`/SinifDosyalari`, `/Odevler`, ...)
    pub fn page_link(&self, suffix: &str) -> String {
        format!("{}{}", self.link, suffix)
    }
}

impl fmt::Display for Course {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (CRN: {}) | {}", self.code, self.crn, self.name)
    }
}

/// List the sections the logged-in user is enrolled in, in portal order.
///
/// Sections whose information page cannot be read are skipped with a warning.
#[instrument(level = "debug", skip(session))]
pub async fn enumerate_courses(session: &Session) -> Result<Vec<Course>, PortalError> {
    let (_, html) = session.get_text(session.resolve(LOGIN_PATH)?).await?;
    let sections = parse_course_links(&html);
    debug!(count = sections.len(), "Found course links in the access tree");

    if sections.is_empty() {
        warn!("No courses found in the access tree");
        return Ok(Vec::new());
    }

    let mut courses = Vec::with_capacity(sections.len());
    for (crn, link) in sections {
        let info_url = session.resolve(&format!("{link}{CLASS_INFO_SUFFIX}"))?;
        let html = match session.get_text(info_url).await {
            Ok((_, html)) => html,
            Err(e) => {
                warn!(crn = %crn, error = %e, "Failed to fetch class information, skipping");
                continue;
            }
        };

        match parse_class_info(&html) {
            Some((code, name)) => {
                let course = Course {
                    code,
                    name,
                    crn,
                    link,
                };
                debug!(course = %course, "Found course");
                courses.push(course);
            }
            None => warn!(crn = %crn, "Class information table not recognised, skipping"),
        }
    }

    info!(count = courses.len(), "Enumerated courses");
    Ok(courses)
}

/// `(crn, link)` of every section link, first occurrence of each CRN only
fn parse_course_links(html: &str) -> Vec<(String, String)> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();

    document
        .select(&COURSE_LINKS)
        .filter_map(|anchor| {
            let text = anchor.text().collect::<String>();
            let Some(crn) = text.trim().strip_prefix(CRN_PREFIX) else {
                debug!(text = %text.trim(), "Skipping non-section link");
                return None;
            };
            let crn = crn.trim().to_string();
            if !seen.insert(crn.clone()) {
                debug!(crn = %crn, "Skipping repeated section");
                return None;
            }
            let link = anchor.value().attr("href")?.trim().trim_end_matches('/');
            Some((crn, link.to_string()))
        })
        .collect()
}

/// Course code (first row, second cell) and title (second row, third cell)
fn parse_class_info(html: &str) -> Option<(String, String)> {
    let document = Html::parse_document(html);
    let table = document.select(&CLASS_INFO_TABLE).next()?;
    let rows: Vec<_> = table.select(&ROW).collect();

    let cell_text = |row: usize, cell: usize| {
        rows.get(row)?
            .select(&CELL)
            .nth(cell)
            .map(|td| td.text().collect::<String>().trim().to_string())
    };

    let code = cell_text(0, 1)?;
    let name = cell_text(1, 2)?;
    (!code.is_empty()).then_some((code, name))
}

/// Pick courses by list index or course code; no selectors means every course.
///
/// A code selects every section of that course. Unknown selectors are
/// reported and ignored.
pub fn select_courses(courses: &[Course], selectors: &[String]) -> Vec<Course> {
    if selectors.is_empty() {
        return courses.to_vec();
    }

    let mut picked: Vec<Course> = Vec::new();
    let mut add = |course: &Course| {
        if !picked.iter().any(|p| p.crn == course.crn) {
            picked.push(course.clone());
        }
    };

    for selector in selectors.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        if let Ok(index) = selector.parse::<usize>() {
            match courses.get(index) {
                Some(course) => add(course),
                None => warn!(selector = %selector, "No course with this number, ignoring"),
            }
            continue;
        }

        let mut matched = false;
        for course in courses.iter().filter(|c| same_code(&c.code, selector)) {
            add(course);
            matched = true;
        }
        if !matched {
            warn!(selector = %selector, "No course with this code, ignoring");
        }
    }

    picked
}

fn same_code(code: &str, selector: &str) -> bool {
    let normalize = |s: &str| -> String {
        s.chars()
            .filter(|c| !c.is_whitespace())
            .flat_map(char::to_uppercase)
            .collect()
    };
    normalize(code) == normalize(selector)
}
