//! HTTP response handling
//!
//! A single builder for the broker's JSON errors, redirects and JSON bodies.
//! Error bodies carry only a short code and a generic message; provider
//! responses and token material never reach them.

use actix_web::{cookie::Cookie, http::header, HttpResponse};
use serde_json::json;

// ===============================
// CACHED RESPONSES
// ===============================

static CACHED_RESPONSES: std::sync::LazyLock<CachedResponses> =
    std::sync::LazyLock::new(CachedResponses::new);

/// Pre-serialized bodies for the errors returned without customization
struct CachedResponses {
    invalid_request: String,
    unauthorized: String,
    not_found: String,
    server_error: String,
}

impl CachedResponses {
    fn new() -> Self {
        Self {
            invalid_request: Self::create_json(
                ErrorType::BadRequest.default_code(),
                ErrorType::BadRequest.default_message(),
            ),
            unauthorized: Self::create_json(
                ErrorType::Unauthorized.default_code(),
                ErrorType::Unauthorized.default_message(),
            ),
            not_found: Self::create_json(
                ErrorType::NotFound.default_code(),
                ErrorType::NotFound.default_message(),
            ),
            server_error: Self::create_json(
                ErrorType::InternalServerError.default_code(),
                ErrorType::InternalServerError.default_message(),
            ),
        }
    }

    fn create_json(error: &str, message: &str) -> String {
        json!({ "error": error, "message": message }).to_string()
    }

    fn body(&self, error_type: ErrorType) -> String {
        match error_type {
            ErrorType::BadRequest => self.invalid_request.clone(),
            ErrorType::Unauthorized => self.unauthorized.clone(),
            ErrorType::NotFound => self.not_found.clone(),
            ErrorType::InternalServerError => self.server_error.clone(),
        }
    }
}

/// Unified response builder
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// `400 Bad Request`
    #[must_use]
    pub fn bad_request() -> ErrorResponseBuilder {
        ErrorResponseBuilder::new(ErrorType::BadRequest)
    }

    /// `401 Unauthorized`
    #[must_use]
    pub fn unauthorized() -> ErrorResponseBuilder {
        ErrorResponseBuilder::new(ErrorType::Unauthorized)
    }

    /// `404 Not Found`
    #[must_use]
    pub fn not_found() -> ErrorResponseBuilder {
        ErrorResponseBuilder::new(ErrorType::NotFound)
    }

    /// `500 Internal Server Error`
    #[must_use]
    pub fn internal_server_error() -> ErrorResponseBuilder {
        ErrorResponseBuilder::new(ErrorType::InternalServerError)
    }

    /// `302 Found` redirect
    #[must_use]
    pub fn redirect(location: &str) -> RedirectBuilder {
        RedirectBuilder::new(location)
    }

    /// `200 OK` with a JSON body
    #[must_use]
    pub fn ok() -> JsonResponseBuilder {
        JsonResponseBuilder::new()
    }
}

// ===============================
// BUILDER TYPES
// ===============================

#[derive(Clone, Copy)]
enum ErrorType {
    BadRequest,
    Unauthorized,
    NotFound,
    InternalServerError,
}

impl ErrorType {
    fn default_code(self) -> &'static str {
        match self {
            Self::BadRequest => "invalid_request",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "not_found",
            Self::InternalServerError => "server_error",
        }
    }

    fn default_message(self) -> &'static str {
        match self {
            Self::BadRequest => "The request is malformed or invalid",
            Self::Unauthorized => "Authentication is required to access this resource",
            Self::NotFound => "The requested resource does not exist",
            Self::InternalServerError => "An internal server error occurred",
        }
    }

    fn builder(self) -> actix_web::HttpResponseBuilder {
        match self {
            Self::BadRequest => HttpResponse::BadRequest(),
            Self::Unauthorized => HttpResponse::Unauthorized(),
            Self::NotFound => HttpResponse::NotFound(),
            Self::InternalServerError => HttpResponse::InternalServerError(),
        }
    }
}

/// Builder for JSON error responses
pub struct ErrorResponseBuilder {
    error_type: ErrorType,
    error_code: Option<String>,
    cookies: Vec<Cookie<'static>>,
}

impl ErrorResponseBuilder {
    fn new(error_type: ErrorType) -> Self {
        Self {
            error_type,
            error_code: None,
            cookies: Vec::new(),
        }
    }

    /// Set the short error code (e.g. `try_refresh_token`)
    #[must_use]
    pub fn with_error_code(mut self, code: &str) -> Self {
        self.error_code = Some(code.to_string());
        self
    }

    /// Attach cookies, typically removal cookies after a failed refresh
    #[must_use]
    pub fn with_cookies(mut self, mut cookies: Vec<Cookie<'static>>) -> Self {
        self.cookies.append(&mut cookies);
        self
    }

    #[must_use]
    pub fn build(self) -> HttpResponse {
        let mut builder = self.error_type.builder();
        for cookie in self.cookies {
            builder.cookie(cookie);
        }
        builder.insert_header((header::CONTENT_TYPE, "application/json"));

        match self.error_code {
            Some(code) => builder.body(
                json!({ "error": code, "message": self.error_type.default_message() }).to_string(),
            ),
            None => builder.body(CACHED_RESPONSES.body(self.error_type)),
        }
    }
}

/// Builder for redirect responses
pub struct RedirectBuilder {
    location: String,
    cookies: Vec<Cookie<'static>>,
    headers: Vec<(String, String)>,
}

impl RedirectBuilder {
    fn new(location: &str) -> Self {
        Self {
            location: location.to_string(),
            cookies: Vec::new(),
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_cookies(mut self, mut cookies: Vec<Cookie<'static>>) -> Self {
        self.cookies.append(&mut cookies);
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Append an `error` query parameter to the redirect location
    #[must_use]
    pub fn with_error(mut self, error_code: &str) -> Self {
        let separator = if self.location.contains('?') { '&' } else { '?' };
        self.location = format!(
            "{}{separator}error={}",
            self.location,
            urlencoding::encode(error_code)
        );
        self
    }

    #[must_use]
    pub fn build(self) -> HttpResponse {
        let mut builder = HttpResponse::Found();

        for cookie in self.cookies {
            builder.cookie(cookie);
        }
        for (name, value) in self.headers {
            builder.insert_header((name, value));
        }

        builder
            .insert_header((header::LOCATION, self.location))
            .finish()
    }
}

/// Builder for `200 OK` JSON responses
pub struct JsonResponseBuilder {
    cookies: Vec<Cookie<'static>>,
    headers: Vec<(String, String)>,
}

impl JsonResponseBuilder {
    fn new() -> Self {
        Self {
            cookies: Vec::new(),
            headers: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    #[must_use]
    pub fn with_cookies(mut self, mut cookies: Vec<Cookie<'static>>) -> Self {
        self.cookies.append(&mut cookies);
        self
    }

    #[must_use]
    pub fn json<T: serde::Serialize>(self, data: &T) -> HttpResponse {
        let mut builder = HttpResponse::Ok();

        for cookie in self.cookies {
            builder.cookie(cookie);
        }
        for (name, value) in self.headers {
            builder.insert_header((name, value));
        }

        builder.json(data)
    }
}
