use easy_error::{Error, ResultExt};
use reqwest::blocking::Client;
use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::Url;
use std::time::Duration;

#[cfg(test)]
use crate::test_support::{Route, StubServer};

const USER_AGENT: &str = concat!("tululu-scraper/", env!("CARGO_PKG_VERSION"));

/// Ways a single GET can fail.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The server answered with a non-2xx, non-3xx status.
    #[error("{url} answered with HTTP status {status}")]
    HttpStatus { url: Url, status: u16 },
    /// The server answered with a redirect. The site sends unknown books to its
    /// home page, so this means the resource does not exist.
    #[error("{url} redirected to {}", .location.as_deref().unwrap_or("an unspecified location"))]
    Redirected { url: Url, location: Option<String> },
    /// DNS, connect, reset, timeout or a broken body.
    #[error("connection to {url} failed: {reason}")]
    Connection { url: Url, reason: String },
    #[error("could not build a request for {url}: {reason}")]
    Request { url: Url, reason: String },
}

impl FetchError {
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, FetchError::Connection { .. })
    }

    fn from_transport(url: &Url, error: reqwest::Error) -> Self {
        if error.is_builder() {
            FetchError::Request {
                url: url.clone(),
                reason: error.to_string(),
            }
        } else {
            FetchError::Connection {
                url: url.clone(),
                reason: error.to_string(),
            }
        }
    }
}

/// Something that can GET a URL and hand back the raw body.
pub trait Fetch {
    fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError>;
}

impl<'a, F: Fetch> Fetch for &'a F {
    fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        (**self).fetch(url)
    }
}

/// Wrapper around a blocking `reqwest::Client` that never follows redirects.
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Option<Duration>) -> Result<Self, Error> {
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .user_agent(USER_AGENT);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build().context("Could not build HTTP client")?,
        })
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|err| FetchError::from_transport(url, err))?;

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            return Err(FetchError::Redirected {
                url: url.clone(),
                location,
            });
        }
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.clone(),
                status: status.as_u16(),
            });
        }

        let contents = response
            .bytes()
            .map_err(|err| FetchError::from_transport(url, err))?;
        Ok(contents.to_vec())
    }
}

#[test]
fn test_fetches_body_on_success() {
    let server = StubServer::start(|path| match path {
        "/b1/" => Route::ok("<h1>hello</h1>"),
        _ => Route::status(404),
    });
    let fetcher = HttpFetcher::new(None).unwrap();

    let body = fetcher.fetch(&server.url("/b1/")).unwrap();
    assert_eq!(b"<h1>hello</h1>".to_vec(), body);
}

#[test]
fn test_error_status_is_reported() {
    let server = StubServer::start(|_| Route::status(503));
    let fetcher = HttpFetcher::new(None).unwrap();

    match fetcher.fetch(&server.url("/b1/")) {
        Err(FetchError::HttpStatus { status, .. }) => assert_eq!(503, status),
        other => panic!("expected status error, got {other:?}"),
    }
}

#[test]
fn test_redirect_is_not_followed() {
    let server = StubServer::start(|path| match path {
        "/" => Route::ok("home page"),
        _ => Route::redirect("/"),
    });
    let fetcher = HttpFetcher::new(None).unwrap();

    match fetcher.fetch(&server.url("/b404/")) {
        Err(FetchError::Redirected { location, .. }) => assert_eq!(Some("/".to_string()), location),
        other => panic!("expected redirect, got {other:?}"),
    }
    assert_eq!(vec!["/b404/".to_string()], server.requests());
}

#[test]
fn test_refused_connection_is_a_connection_fault() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let fetcher = HttpFetcher::new(Some(Duration::from_secs(5))).unwrap();
    let url = Url::parse(&format!("http://{addr}/b1/")).unwrap();
    let err = fetcher.fetch(&url).unwrap_err();
    assert!(err.is_connection_fault(), "unexpected error {err:?}");
}
