//! Doubles shared by the unit tests.

use reqwest::Url;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::crawler::Sleeper;
use crate::fetcher::{Fetch, FetchError};
use crate::report::{Event, Reporter};

/// Scripted answer of `FakeFetcher`.
#[derive(Debug, Clone)]
pub enum Reply {
    Body(Vec<u8>),
    Status(u16),
    Redirect,
    /// The connection broke.
    Drop,
}

impl Reply {
    pub fn body<B: AsRef<[u8]>>(body: B) -> Self {
        Reply::Body(body.as_ref().to_vec())
    }
}

/// Answers from a per-URL script. The last reply of a script repeats;
/// unknown URLs answer 404.
#[derive(Default)]
pub struct FakeFetcher {
    routes: RefCell<HashMap<String, VecDeque<Reply>>>,
    requests: RefCell<Vec<String>>,
}

impl FakeFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, reply: Reply) -> Self {
        self.route_sequence(url, vec![reply])
    }

    pub fn route_sequence(self, url: &str, replies: Vec<Reply>) -> Self {
        self.routes
            .borrow_mut()
            .insert(url.to_string(), replies.into_iter().collect());
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.borrow().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.borrow().iter().filter(|requested| *requested == url).count()
    }
}

impl Fetch for FakeFetcher {
    fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        self.requests.borrow_mut().push(url.to_string());

        let reply = {
            let mut routes = self.routes.borrow_mut();
            match routes.get_mut(url.as_str()) {
                Some(script) if script.len() > 1 => script.pop_front(),
                Some(script) => script.front().cloned(),
                None => None,
            }
        };

        match reply.unwrap_or(Reply::Status(404)) {
            Reply::Body(body) => Ok(body),
            Reply::Status(status) => Err(FetchError::HttpStatus {
                url: url.clone(),
                status,
            }),
            Reply::Redirect => Err(FetchError::Redirected {
                url: url.clone(),
                location: Some("/".to_string()),
            }),
            Reply::Drop => Err(FetchError::Connection {
                url: url.clone(),
                reason: "connection reset by peer".to_string(),
            }),
        }
    }
}

/// Remembers how long it was asked to sleep instead of sleeping.
#[derive(Default)]
pub struct CountingSleeper {
    pub sleeps: Vec<Duration>,
}

impl Sleeper for CountingSleeper {
    fn sleep(&mut self, duration: Duration) {
        self.sleeps.push(duration);
    }
}

/// Keeps the debug rendering of every event.
#[derive(Default)]
pub struct RecordingReporter {
    events: RefCell<Vec<String>>,
}

impl RecordingReporter {
    pub fn count(&self, kind: &str) -> usize {
        self.events
            .borrow()
            .iter()
            .filter(|event| event.starts_with(kind))
            .count()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.count(kind) > 0
    }
}

impl Reporter for RecordingReporter {
    fn report(&self, event: Event) {
        self.events.borrow_mut().push(format!("{event:?}"));
    }
}

/// What `StubServer` answers for a path.
pub struct Route {
    status: u16,
    body: Vec<u8>,
    location: Option<&'static str>,
}

impl Route {
    pub fn ok<B: AsRef<[u8]>>(body: B) -> Self {
        Self {
            status: 200,
            body: body.as_ref().to_vec(),
            location: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            location: None,
        }
    }

    pub fn redirect(location: &'static str) -> Self {
        Self {
            status: 302,
            body: Vec::new(),
            location: Some(location),
        }
    }
}

/// A `tiny_http` server on a random local port, stopped on drop.
pub struct StubServer {
    base: Url,
    requests: Arc<Mutex<Vec<String>>>,
    shutdown: mpsc::Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl StubServer {
    pub fn start<H>(handler: H) -> Self
    where
        H: Fn(&str) -> Route + Send + 'static,
    {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start tiny_http server");
        let base = Url::parse(&format!("http://{}/", server.server_addr())).unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let (shutdown, shutdown_rx) = mpsc::channel::<()>();

        let seen = Arc::clone(&requests);
        let handle = thread::spawn(move || loop {
            if shutdown_rx.try_recv().is_ok() {
                break;
            }

            let request = match server.recv_timeout(Duration::from_millis(50)) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(_) => break,
            };

            let path = request.url().to_string();
            seen.lock().unwrap().push(path.clone());

            let route = handler(&path);
            let mut response = tiny_http::Response::from_data(route.body).with_status_code(route.status);
            if let Some(location) = route.location {
                response = response.with_header(
                    tiny_http::Header::from_bytes(&b"Location"[..], location.as_bytes()).unwrap(),
                );
            }
            let _ = request.respond(response);
        });

        Self {
            base,
            requests,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn url(&self, path: &str) -> Url {
        self.base.join(path).unwrap()
    }

    /// Request paths (with query) in arrival order.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
