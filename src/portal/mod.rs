//! Portal session
//!
//! Owns the cookie-carrying HTTP client every other component borrows. The
//! portal is an ASP.NET site: logging in means replaying the login form with
//! all of its hidden inputs and the credentials filled in.

pub mod courses;

use once_cell::sync::Lazy;
use reqwest::{
    Client, Response, Url,
    header::{self, HeaderMap, HeaderValue},
};
use scraper::{Html, Selector};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::config::FetchConfig;

pub use courses::{Course, enumerate_courses, select_courses};

const LOGIN_PATH: &str = "Kampus1";
const USERNAME_FIELD: &str = "ctl00$ContentPlaceHolder1$tbUserName";
const PASSWORD_FIELD: &str = "ctl00$ContentPlaceHolder1$tbPassword";
const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64; rv:104.0) Gecko/20100101 Firefox/104.0";

static FORM: Lazy<Selector> = Lazy::new(|| Selector::parse("form").unwrap());
static INPUT: Lazy<Selector> = Lazy::new(|| Selector::parse("input").unwrap());
static LOGOUT_MARKER: Lazy<Selector> =
    Lazy::new(|| Selector::parse("#ctl00_Header1_tdLogout").unwrap());

#[derive(Error, Debug)]
pub enum PortalError {
    #[error("Request error: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("URL error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("HTTP error {status} for {url}")]
    HttpStatus {
        status: reqwest::StatusCode,
        url: String,
    },

    #[error("user name or password is wrong")]
    InvalidCredentials,

    #[error("unexpected page layout: {0}")]
    Layout(String),
}

/// An authenticated (or, before [`Session::login`], anonymous) portal session.
///
/// Cloning is cheap and every clone shares the same cookie store.
#[derive(Debug, Clone)]
pub struct Session {
    client: Client,
    base_url: Url,
}

impl Session {
    pub fn new(base_url: Url, config: &FetchConfig) -> Result<Self, PortalError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            ),
        );
        headers.insert(header::DNT, HeaderValue::from_static("1"));
        headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));

        let client = Client::builder()
            .cookie_store(true)
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .build()?;

        Ok(Self { client, base_url })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Resolve a portal-relative link (`/Sinif/123.456`) against the base URL
    pub fn resolve(&self, link: &str) -> Result<Url, PortalError> {
        Ok(self.base_url.join(link)?)
    }

    async fn get_text(&self, url: Url) -> Result<(Url, String), PortalError> {
        let response = checked(self.client.get(url).send().await?)?;
        let final_url = response.url().clone();
        Ok((final_url, response.text().await?))
    }

    /// POST an urlencoded form and return the raw response
    pub async fn post_form(
        &self,
        url: Url,
        fields: &[(String, String)],
    ) -> Result<Response, PortalError> {
        checked(self.client.post(url).form(fields).send().await?)
    }

    /// Log in with the portal credentials.
    ///
    /// Fails with [`PortalError::InvalidCredentials`] when the portal does not
    /// show the logout control afterwards.
    #[instrument(level = "debug", skip(self, password))]
    pub async fn login(&self, username: &str, password: &str) -> Result<(), PortalError> {
        let (page_url, html) = self.get_text(self.resolve(LOGIN_PATH)?).await?;
        let (action, mut fields) = parse_login_form(&html)?;

        set_field(&mut fields, USERNAME_FIELD, username);
        set_field(&mut fields, PASSWORD_FIELD, password);

        let action_url = page_url.join(&action)?;
        debug!(action = %action_url, fields = fields.len(), "Submitting login form");
        let response = self.post_form(action_url, &fields).await?;
        let landing = response.text().await?;

        if !has_logout_marker(&landing) {
            return Err(PortalError::InvalidCredentials);
        }
        info!(user = %username, "Logged in");
        Ok(())
    }
}

fn checked(response: Response) -> Result<Response, PortalError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(PortalError::HttpStatus {
            status,
            url: response.url().to_string(),
        })
    }
}

fn set_field(fields: &mut Vec<(String, String)>, name: &str, value: &str) {
    match fields.iter_mut().find(|(key, _)| key == name) {
        Some((_, existing)) => *existing = value.to_string(),
        None => fields.push((name.to_string(), value.to_string())),
    }
}

/// Action and every named input of the first form on the page
fn parse_login_form(html: &str) -> Result<(String, Vec<(String, String)>), PortalError> {
    let document = Html::parse_document(html);
    let form = document
        .select(&FORM)
        .next()
        .ok_or_else(|| PortalError::Layout("login page has no form".into()))?;
    let action = form.value().attr("action").unwrap_or("").trim().to_string();

    let fields = document
        .select(&INPUT)
        .filter_map(|input| {
            let name = input.value().attr("name")?;
            let value = input.value().attr("value").unwrap_or("");
            Some((name.to_string(), value.to_string()))
        })
        .collect();

    Ok((action, fields))
}

fn has_logout_marker(html: &str) -> bool {
    Html::parse_document(html).select(&LOGOUT_MARKER).next().is_some()
}

#[cfg(test)]
impl Session {
    /// A session against a mock portal, without logging in
    pub fn anonymous(base_url: Url) -> Self {
        let config = crate::config::Config::for_tests(std::path::Path::new("."), base_url.as_str());
        Self::new(base_url, &config.fetch).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockPortal;

    const LOGIN_PAGE: &str = r#"<html><body>
        <form method="post" action="./Login.aspx?subSessionId=abc">
          <input type="hidden" name="__VIEWSTATE" value="vs123" />
          <input type="hidden" name="__EVENTVALIDATION" value="ev456" />
          <input type="text" name="ctl00$ContentPlaceHolder1$tbUserName" />
          <input type="password" name="ctl00$ContentPlaceHolder1$tbPassword" />
          <input type="submit" name="ctl00$ContentPlaceHolder1$btnLogin" value="Giriş" />
        </form></body></html>"#;

    #[test]
    fn test_parse_login_form_collects_hidden_inputs() {
        let (action, fields) = parse_login_form(LOGIN_PAGE).unwrap();
        assert_eq!(action, "./Login.aspx?subSessionId=abc");
        assert!(fields.contains(&("__VIEWSTATE".to_string(), "vs123".to_string())));
        assert!(fields.contains(&("ctl00$ContentPlaceHolder1$tbUserName".to_string(), String::new())));
        assert_eq!(fields.len(), 5);
    }

    #[tokio::test]
    async fn test_login_posts_credentials_and_detects_success() {
        let portal = MockPortal::default();
        portal.html("/Kampus1", LOGIN_PAGE);
        portal.post_response(
            "/Login.aspx?subSessionId=abc",
            Vec::new(),
            br#"<html><table><tr><td id="ctl00_Header1_tdLogout">Exit</td></tr></table></html>"#,
        );
        let session = Session::anonymous(portal.serve().await);

        session.login("student", "s3cret").await.unwrap();

        let forms = portal.posted_forms();
        assert_eq!(forms.len(), 1);
        let (path, body) = &forms[0];
        assert_eq!(path, "/Login.aspx?subSessionId=abc");
        assert!(body.contains("__VIEWSTATE=vs123"));
        assert!(body.contains("ctl00%24ContentPlaceHolder1%24tbUserName=student"));
        assert!(body.contains("ctl00%24ContentPlaceHolder1%24tbPassword=s3cret"));
    }

    #[tokio::test]
    async fn test_login_without_logout_marker_is_rejected() {
        let portal = MockPortal::default();
        portal.html("/Kampus1", LOGIN_PAGE);
        portal.post_response(
            "/Login.aspx?subSessionId=abc",
            Vec::new(),
            b"<html><span>Hatal\xc4\xb1 giri\xc5\x9f</span></html>",
        );
        let session = Session::anonymous(portal.serve().await);

        let err = session.login("student", "wrong").await.unwrap_err();
        assert!(matches!(err, PortalError::InvalidCredentials));
    }
}
