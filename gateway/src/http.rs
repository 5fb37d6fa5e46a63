use core::fmt;
use core::panic::Location;
use std::error::Error as StdError;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub struct HttpErrorBuilder {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub kind: &'static str,
    pub msg: Option<std::borrow::Cow<'static, str>>,
}

impl HttpErrorBuilder {
    #[inline]
    #[track_caller]
    pub fn new(code: StatusCode, kind: &'static str) -> Self {
        Self {
            code,
            loc: Location::caller(),
            kind,
            msg: None,
        }
    }

    #[inline]
    pub fn err<T: Into<Box<dyn StdError + Sync + Send + 'static>>>(self) -> impl FnOnce(T) -> HttpError {
        move |source| HttpError {
            code: self.code,
            loc: self.loc,
            kind: self.kind,
            msg: self.msg,
            source: Some(source.into()),
        }
    }

    #[inline]
    pub fn with_msg(mut self, msg: impl Into<std::borrow::Cow<'static, str>>) -> HttpErrorBuilder {
        self.msg = Some(msg.into());
        self
    }

    #[inline]
    pub fn msg(self, msg: impl Into<std::borrow::Cow<'static, str>>) -> HttpError {
        HttpError {
            code: self.code,
            loc: self.loc,
            kind: self.kind,
            msg: Some(msg.into()),
            source: None,
        }
    }
}

/// The single HTTP-boundary error type. Every component error converts into
/// this (see `error.rs::GatewayError`); nothing downstream of this type
/// leaks a source error message to the client.
pub struct HttpError {
    pub code: StatusCode,
    pub loc: &'static Location<'static>,
    pub kind: &'static str,
    pub msg: Option<std::borrow::Cow<'static, str>>,
    pub source: Option<Box<dyn StdError + Sync + Send + 'static>>,
}

impl HttpError {
    #[inline]
    #[track_caller]
    pub fn forbidden(kind: &'static str) -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::FORBIDDEN, kind)
    }

    #[inline]
    #[track_caller]
    pub fn not_found(kind: &'static str) -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::NOT_FOUND, kind)
    }

    #[inline]
    #[track_caller]
    pub fn unauthorized(kind: &'static str) -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::UNAUTHORIZED, kind)
    }

    #[inline]
    #[track_caller]
    pub fn internal(kind: &'static str) -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::INTERNAL_SERVER_ERROR, kind)
    }

    #[inline]
    #[track_caller]
    pub fn bad_request(kind: &'static str) -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_REQUEST, kind)
    }

    #[inline]
    #[track_caller]
    pub fn bad_gateway(kind: &'static str) -> HttpErrorBuilder {
        HttpErrorBuilder::new(StatusCode::BAD_GATEWAY, kind)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) at {}", self.code, self.kind, self.loc)?;

        if let Some(msg) = self.msg.as_deref() {
            write!(f, ": {msg}")?;
        }

        if let Some(source) = self.source.as_deref() {
            write!(f, " [source: {source}")?;
            for cause in anyhow::Chain::new(source).skip(1) {
                write!(f, ", because {cause}")?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        error!(error = %self);

        let message = self.msg.as_deref().unwrap_or("request failed").to_owned();
        let body = ErrorBody { code: self.kind, message };

        (self.code, Json(body)).into_response()
    }
}
