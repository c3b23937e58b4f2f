use reqwest::Url;
use std::num::NonZeroU32;
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::book::{site_root, BookRef, DownloadedBook, ScrapeError, Scraper};
use crate::fetcher::Fetch;
use crate::parser::{parse_category_page, ParseError};
use crate::report::Event;

#[cfg(test)]
use crate::book::ScrapeOptions;
#[cfg(test)]
use crate::downloader::FileStore;
#[cfg(test)]
use crate::test_support::{CountingSleeper, FakeFetcher, RecordingReporter, Reply};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(30);

/// How connection faults are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per unit of work, `None` retries forever.
    pub max_attempts: Option<NonZeroU32>,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff: DEFAULT_BACKOFF,
        }
    }
}

impl RetryPolicy {
    fn allows_another(&self, attempts_made: u32) -> bool {
        self.max_attempts
            .map_or(true, |max| attempts_made < max.get())
    }
}

pub trait Sleeper {
    fn sleep(&mut self, duration: Duration);
}

impl<'s, S: Sleeper> Sleeper for &'s mut S {
    fn sleep(&mut self, duration: Duration) {
        (**self).sleep(duration);
    }
}

/// Blocks the current thread.
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Runs books and listing pages one at a time, isolating their failures.
pub struct Crawler<'a, F, S> {
    scraper: Scraper<'a, F>,
    retry: RetryPolicy,
    sleeper: S,
}

impl<'a, F: Fetch, S: Sleeper> Crawler<'a, F, S> {
    pub fn new(scraper: Scraper<'a, F>, retry: RetryPolicy, sleeper: S) -> Self {
        Self {
            scraper,
            retry,
            sleeper,
        }
    }

    /// Runs `op` until it succeeds or fails with anything but a connection fault.
    fn with_retries<T>(
        &mut self,
        unit: &str,
        mut op: impl FnMut(&mut Scraper<'a, F>) -> Result<T, ScrapeError>,
    ) -> Result<T, ScrapeError> {
        let mut attempt = 1;
        loop {
            match op(&mut self.scraper) {
                Err(ref error) if error.is_connection_fault() && self.retry.allows_another(attempt) => {
                    self.scraper.reporter().report(Event::ConnectionFault {
                        unit,
                        attempt,
                        delay: self.retry.backoff,
                        error,
                    });
                    self.sleeper.sleep(self.retry.backoff);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    fn run_book(&mut self, book: &BookRef) -> Option<DownloadedBook> {
        let unit = format!("book {}", book.id);
        match self.with_retries(&unit, |scraper| scraper.download_book(book)) {
            Ok(saved) => saved,
            Err(error) => {
                self.scraper.reporter().report(Event::UnitSkipped { unit: &unit, error: &error });
                None
            }
        }
    }

    pub fn run_books(&mut self, books: &[BookRef]) -> Vec<DownloadedBook> {
        books.iter().filter_map(|book| self.run_book(book)).collect()
    }

    /// Downloads books `{base}/b{id}/` for every id in `ids`.
    pub fn run_ids(&mut self, base: &Url, ids: RangeInclusive<u32>) -> Result<Vec<DownloadedBook>, url::ParseError> {
        let books = ids
            .map(|id| BookRef::from_id(base, id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.run_books(&books))
    }

    pub fn run_urls(&mut self, urls: Vec<Url>) -> Vec<DownloadedBook> {
        let books: Vec<BookRef> = urls.into_iter().map(BookRef::from_url).collect();
        self.run_books(&books)
    }

    fn read_listing_page(&mut self, url: &Url) -> Result<Vec<Url>, ScrapeError> {
        let unit = format!("listing {url}");
        let page: Vec<u8> = self.with_retries(&unit, |scraper| Ok(scraper.fetcher().fetch(url)?))?;

        parse_category_page(&page)
            .iter()
            .map(|href| {
                url.join(href).map_err(|source| ScrapeError::Parse {
                    url: url.clone(),
                    source: ParseError::BadLink {
                        href: href.clone(),
                        source,
                    },
                })
            })
            .collect()
    }

    /// Collects detail-page URLs from the listing pages `{base}/l{category}/{page}/`.
    /// Stops at the first page that fails for a reason other than a connection fault.
    pub fn collect_category_urls(
        &mut self,
        base: &Url,
        category: u32,
        pages: RangeInclusive<u32>,
    ) -> Result<Vec<Url>, url::ParseError> {
        let root = site_root(base);
        let mut books = Vec::new();
        for page in pages {
            let url = root.join(&format!("l{category}/{page}/"))?;
            match self.read_listing_page(&url) {
                Ok(page_books) => {
                    self.scraper.reporter().report(Event::ListingPage {
                        url: &url,
                        books: page_books.len(),
                    });
                    books.extend(page_books);
                }
                Err(error) => {
                    self.scraper.reporter().report(Event::ListingStopped { url: &url, error: &error });
                    break;
                }
            }
        }
        Ok(books)
    }

    pub fn run_category(
        &mut self,
        base: &Url,
        category: u32,
        pages: RangeInclusive<u32>,
    ) -> Result<Vec<DownloadedBook>, url::ParseError> {
        let urls = self.collect_category_urls(base, category, pages)?;
        Ok(self.run_urls(urls))
    }
}

#[cfg(test)]
fn detail_page(title: &str, id: u32) -> String {
    format!(
        r#"<div id="content"><h1>{title} :: Автор</h1>
        <table class="d_book"><tr><td><a href="/txt.php?id={id}">скачать txt</a></td></tr></table></div>"#
    )
}

#[cfg(test)]
fn base() -> Url {
    Url::parse("https://tululu.org/").unwrap()
}

#[test]
fn test_connection_faults_are_retried_after_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new()
        .route_sequence(
            "https://tululu.org/b1/",
            vec![Reply::Drop, Reply::Drop, Reply::body(detail_page("Первая", 1))],
        )
        .route("https://tululu.org/txt.php?id=1", Reply::body("текст"));
    let scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);
    let mut sleeper = CountingSleeper::default();
    let mut crawler = Crawler::new(scraper, RetryPolicy::default(), &mut sleeper);

    let saved = crawler.run_ids(&base(), 1..=1).unwrap();

    assert_eq!(1, saved.len());
    assert_eq!("Первая", saved[0].record.title);
    drop(crawler);
    assert_eq!(vec![DEFAULT_BACKOFF, DEFAULT_BACKOFF], sleeper.sleeps);
    assert_eq!(3, fetcher.request_count("https://tululu.org/b1/"));
}

#[test]
fn test_retry_cap_skips_the_unit() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new()
        .route("https://tululu.org/b1/", Reply::Drop)
        .route("https://tululu.org/b2/", Reply::body(detail_page("Вторая", 2)))
        .route("https://tululu.org/txt.php?id=2", Reply::body("текст"));
    let scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);
    let retry = RetryPolicy {
        max_attempts: NonZeroU32::new(3),
        backoff: Duration::from_secs(1),
    };
    let mut sleeper = CountingSleeper::default();
    let mut crawler = Crawler::new(scraper, retry, &mut sleeper);

    let saved = crawler.run_ids(&base(), 1..=2).unwrap();

    assert_eq!(vec!["2".to_string()], saved.iter().map(|b| b.book.id.clone()).collect::<Vec<_>>());
    drop(crawler);
    assert_eq!(2, sleeper.sleeps.len());
    assert_eq!(3, fetcher.request_count("https://tululu.org/b1/"));
    assert!(reporter.contains("UnitSkipped"));
}

#[test]
fn test_status_errors_skip_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new()
        .route("https://tululu.org/b1/", Reply::Status(500))
        .route("https://tululu.org/b2/", Reply::Redirect)
        .route("https://tululu.org/b3/", Reply::body("<p>not a book page</p>"))
        .route("https://tululu.org/b4/", Reply::body(detail_page("Четвёртая", 4)))
        .route("https://tululu.org/txt.php?id=4", Reply::body("текст"));
    let scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);
    let mut sleeper = CountingSleeper::default();
    let mut crawler = Crawler::new(scraper, RetryPolicy::default(), &mut sleeper);

    let saved = crawler.run_ids(&base(), 1..=4).unwrap();

    assert_eq!(1, saved.len());
    assert_eq!(Some("books/4. Четвёртая.txt".to_string()), saved[0].book_path);
    drop(crawler);
    assert!(sleeper.sleeps.is_empty());
    assert_eq!(1, fetcher.request_count("https://tululu.org/b1/"));
    // 500 and the parse failure are skipped, the redirect is only noted as missing.
    assert_eq!(2, reporter.count("UnitSkipped"));
    assert_eq!(1, reporter.count("BookMissing"));
}

#[test]
fn test_category_pagination_stops_at_first_failing_page() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let listing = |ids: &[u32]| {
        ids.iter()
            .map(|id| format!(r#"<table class="d_book"><tr><td><a href="/b{id}/">book</a></td></tr></table>"#))
            .collect::<String>()
    };
    let fetcher = FakeFetcher::new()
        .route_sequence(
            "https://tululu.org/l55/1/",
            vec![Reply::Drop, Reply::body(listing(&[10, 11]))],
        )
        .route("https://tululu.org/l55/2/", Reply::body(listing(&[12])))
        .route("https://tululu.org/l55/3/", Reply::Status(404))
        .route("https://tululu.org/l55/4/", Reply::body(listing(&[13])));
    let scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);
    let mut sleeper = CountingSleeper::default();
    let mut crawler = Crawler::new(scraper, RetryPolicy::default(), &mut sleeper);

    let urls = crawler.collect_category_urls(&base(), 55, 1..=4).unwrap();

    assert_eq!(
        vec![
            "https://tululu.org/b10/",
            "https://tululu.org/b11/",
            "https://tululu.org/b12/"
        ],
        urls.iter().map(Url::as_str).collect::<Vec<_>>()
    );
    assert_eq!(0, fetcher.request_count("https://tululu.org/l55/4/"));
    assert!(reporter.contains("ListingStopped"));
    drop(crawler);
    assert_eq!(1, sleeper.sleeps.len());
}

#[test]
fn test_listing_pages_stay_below_base_path() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new().route(
        "https://mirror.example/tululu/l55/1/",
        Reply::body(r#"<table class="d_book"><tr><td><a href="/tululu/b5/">Книга</a></td></tr></table>"#),
    );
    let scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);
    let mut crawler = Crawler::new(scraper, RetryPolicy::default(), CountingSleeper::default());

    let mirror = Url::parse("https://mirror.example/tululu").unwrap();
    let urls = crawler.collect_category_urls(&mirror, 55, 1..=1).unwrap();

    assert_eq!(vec!["https://mirror.example/tululu/l55/1/".to_string()], fetcher.requests());
    assert_eq!(
        vec!["https://mirror.example/tululu/b5/"],
        urls.iter().map(Url::as_str).collect::<Vec<_>>()
    );
}

#[test]
fn test_run_category_downloads_listed_books() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new()
        .route(
            "https://tululu.org/l55/1/",
            Reply::body(r#"<table class="d_book"><tr><td><a href="/b239/">Тень</a></td></tr></table>"#),
        )
        .route("https://tululu.org/b239/", Reply::body(detail_page("Тень", 239)))
        .route("https://tululu.org/txt.php?id=239", Reply::body("текст"));
    let scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);
    let mut crawler = Crawler::new(scraper, RetryPolicy::default(), CountingSleeper::default());

    let saved = crawler.run_category(&base(), 55, 1..=1).unwrap();

    assert_eq!(1, saved.len());
    assert_eq!("239", saved[0].book.id);
    assert!(dir.path().join("books").join("239. Тень.txt").exists());
}
