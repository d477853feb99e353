use actix_web::cookie::{time::Duration as CookieDuration, Cookie, SameSite};
use chrono::{DateTime, Utc};

use crate::models::Session;
use crate::settings::CookieSettings;

/// Options for cookie creation
pub struct CookieOptions {
    pub http_only: bool,
    pub path: String,
    pub max_age: CookieDuration,
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            http_only: true,
            path: "/".to_string(),
            max_age: CookieDuration::hours(1),
        }
    }
}

/// Cookie factory for session token cookies
///
/// The access cookie is sent on every request; the refresh cookie is scoped
/// to the session endpoints so it only travels when a refresh is attempted.
#[derive(Clone)]
pub struct CookieFactory {
    secure: bool,
    same_site: SameSite,
    domain: Option<String>,
    access_cookie_name: String,
    refresh_cookie_name: String,
    refresh_path: String,
}

impl CookieFactory {
    #[must_use]
    pub fn new(settings: &CookieSettings, api_base_path: &str) -> Self {
        Self {
            secure: settings.secure,
            same_site: parse_same_site(&settings.same_site),
            domain: settings.domain.clone().filter(|d| !d.is_empty()),
            access_cookie_name: settings.access_cookie_name.clone(),
            refresh_cookie_name: settings.refresh_cookie_name.clone(),
            refresh_path: format!("{}/session", api_base_path.trim_end_matches('/')),
        }
    }

    #[must_use]
    pub fn access_cookie_name(&self) -> &str {
        &self.access_cookie_name
    }

    #[must_use]
    pub fn refresh_cookie_name(&self) -> &str {
        &self.refresh_cookie_name
    }

    /// Create a cookie with the factory's security attributes
    #[must_use]
    pub fn create_cookie(&self, name: &str, value: String, options: CookieOptions) -> Cookie<'static> {
        let mut builder = Cookie::build(name.to_owned(), value)
            .http_only(options.http_only)
            .secure(self.secure)
            .same_site(self.same_site)
            .path(options.path)
            .max_age(options.max_age);

        if let Some(domain) = &self.domain {
            builder = builder.domain(domain.clone());
        }

        builder.finish()
    }

    /// Access and refresh cookies for a freshly issued or rotated session
    #[must_use]
    pub fn session_cookies(&self, session: &Session) -> Vec<Cookie<'static>> {
        let now = Utc::now();
        vec![
            self.create_cookie(
                &self.access_cookie_name,
                session.access_token.clone(),
                CookieOptions {
                    max_age: max_age_until(session.access_expires_at, now),
                    ..Default::default()
                },
            ),
            self.create_cookie(
                &self.refresh_cookie_name,
                session.refresh_token.clone(),
                CookieOptions {
                    path: self.refresh_path.clone(),
                    max_age: max_age_until(session.refresh_expires_at, now),
                    ..Default::default()
                },
            ),
        ]
    }

    /// Expired cookies that clear both session cookies in the browser
    #[must_use]
    pub fn removal_cookies(&self) -> Vec<Cookie<'static>> {
        vec![
            self.create_cookie(
                &self.access_cookie_name,
                String::new(),
                CookieOptions {
                    max_age: CookieDuration::ZERO,
                    ..Default::default()
                },
            ),
            self.create_cookie(
                &self.refresh_cookie_name,
                String::new(),
                CookieOptions {
                    path: self.refresh_path.clone(),
                    max_age: CookieDuration::ZERO,
                    ..Default::default()
                },
            ),
        ]
    }
}

fn max_age_until(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> CookieDuration {
    CookieDuration::seconds((expires_at - now).num_seconds().max(0))
}

fn parse_same_site(value: &str) -> SameSite {
    match value.to_ascii_lowercase().as_str() {
        "strict" => SameSite::Strict,
        "none" => SameSite::None,
        _ => SameSite::Lax,
    }
}
