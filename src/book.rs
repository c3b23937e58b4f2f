use reqwest::Url;
use std::collections::HashMap;

use crate::downloader::{download, filename_from_url, DownloadError, FileStore};
use crate::fetcher::{Fetch, FetchError};
use crate::parser::{parse_book_page, BookRecord, ParseError};
use crate::report::{Event, Reporter};

#[cfg(test)]
use crate::test_support::{FakeFetcher, RecordingReporter, Reply};

pub const TEXT_FOLDER: &str = "books";
pub const IMAGE_FOLDER: &str = "images";

/// Everything that can stop a single book or listing page from being processed.
#[derive(Debug, thiserror::Error)]
pub enum ScrapeError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("could not parse {url}: {source}")]
    Parse {
        url: Url,
        #[source]
        source: ParseError,
    },
    #[error("could not store a download: {0}")]
    Storage(#[source] easy_error::Error),
}

impl ScrapeError {
    pub fn is_connection_fault(&self) -> bool {
        matches!(self, ScrapeError::Fetch(err) if err.is_connection_fault())
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, ScrapeError::Storage(_))
    }
}

impl From<DownloadError> for ScrapeError {
    fn from(err: DownloadError) -> Self {
        match err {
            DownloadError::Fetch(err) => ScrapeError::Fetch(err),
            DownloadError::Storage(err) => ScrapeError::Storage(err),
        }
    }
}

/// `base` as a directory URL, so relative joins land below its path.
/// `https://mirror.example/tululu` becomes `https://mirror.example/tululu/`.
pub fn site_root(base: &Url) -> Url {
    let mut root = base.clone();
    if !root.path().ends_with('/') {
        let path = format!("{}/", root.path());
        root.set_path(&path);
    }
    root
}

/// A book detail page and the identifier used in file names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookRef {
    pub id: String,
    pub url: Url,
}

impl BookRef {
    /// Detail page `{base}/b{id}/`.
    pub fn from_id(base: &Url, id: u32) -> Result<Self, url::ParseError> {
        Ok(Self {
            id: id.to_string(),
            url: site_root(base).join(&format!("b{id}/"))?,
        })
    }

    /// Takes the id from a path such as `/b239/`.
    pub fn from_url(url: Url) -> Self {
        let id = url.path().trim_matches('/').trim_matches('b').to_string();
        Self { id, url }
    }
}

/// What `download_book` fetched and where it put it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedBook {
    pub book: BookRef,
    pub record: BookRecord,
    /// `books/...` relative to the destination folder.
    pub book_path: Option<String>,
    /// `images/...` relative to the destination folder.
    pub cover_path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScrapeOptions {
    pub skip_text: bool,
    pub skip_images: bool,
}

/// Downloads single books: detail page, text and cover.
pub struct Scraper<'a, F> {
    fetcher: F,
    store: FileStore,
    options: ScrapeOptions,
    reporter: &'a dyn Reporter,
    /// Cover URLs handled earlier in this run and the path they were saved to.
    covers: HashMap<Url, Option<String>>,
}

impl<'a, F: Fetch> Scraper<'a, F> {
    pub fn new(fetcher: F, store: FileStore, options: ScrapeOptions, reporter: &'a dyn Reporter) -> Self {
        Self {
            fetcher,
            store,
            options,
            reporter,
            covers: HashMap::new(),
        }
    }

    pub fn fetcher(&self) -> &F {
        &self.fetcher
    }

    pub fn reporter(&self) -> &'a dyn Reporter {
        self.reporter
    }

    /// Downloads the text and cover of `book`.
    /// Returns `None` when the book does not exist or has no text to download.
    pub fn download_book(&mut self, book: &BookRef) -> Result<Option<DownloadedBook>, ScrapeError> {
        let page: Vec<u8> = match self.fetcher.fetch(&book.url) {
            Ok(page) => page,
            Err(FetchError::Redirected { .. }) => {
                self.reporter.report(Event::BookMissing { book });
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let record = parse_book_page(&page)
            .and_then(|parsed| parsed.resolve(&book.url))
            .map_err(|source| ScrapeError::Parse {
                url: book.url.clone(),
                source,
            })?;

        let text_url = match record.text_url {
            Some(ref url) => url.clone(),
            None => {
                self.reporter.report(Event::TextMissing {
                    book,
                    title: &record.title,
                });
                return Ok(None);
            }
        };

        let book_path = if self.options.skip_text {
            None
        } else {
            let filename = format!("{}. {}.txt", book.id, record.title);
            download(&self.fetcher, &self.store, &text_url, &filename, TEXT_FOLDER)?
        };

        let cover_path = match record.cover_url {
            Some(ref cover_url) if !self.options.skip_images => self.download_cover(book, cover_url)?,
            _ => None,
        };

        let saved = DownloadedBook {
            book: book.clone(),
            record,
            book_path,
            cover_path,
        };
        self.reporter.report(Event::BookSaved { saved: &saved });
        Ok(Some(saved))
    }

    fn download_cover(&mut self, book: &BookRef, url: &Url) -> Result<Option<String>, ScrapeError> {
        if let Some(path) = self.covers.get(url) {
            self.reporter.report(Event::CoverReused { book, url });
            return Ok(path.clone());
        }

        let path = match filename_from_url(url) {
            Some(filename) => download(&self.fetcher, &self.store, url, &filename, IMAGE_FOLDER)?,
            None => None,
        };
        self.covers.insert(url.clone(), path.clone());
        Ok(path)
    }
}

#[cfg(test)]
const EXAMPLE_PAGE: &str = r#"<html><body><div id="content">
<h1>Title Example :: Author Name</h1>
<div class="bookimage"><img src="/images/7.jpg"></div>
<table class="d_book"><tr><td><a href="/txt.php?id=7">скачать txt</a></td></tr></table>
<span class="d_book">Жанр книги: <a href="/l55/">Научная фантастика</a></span>
<div class="texts"><span class="black">Хорошо</span></div>
</div></body></html>"#;

#[cfg(test)]
fn page_without_text(title: &str, cover: &str) -> String {
    format!(
        r#"<div id="content"><h1>{title} :: Someone</h1>
        <div class="bookimage"><img src="{cover}"></div>
        <table class="d_book"><tr><td><a href="/zip/">скачать zip</a></td></tr></table></div>"#
    )
}

#[cfg(test)]
fn base() -> Url {
    Url::parse("https://tululu.org/").unwrap()
}

#[test]
fn test_book_ref_from_id_and_url() {
    let book = BookRef::from_id(&base(), 7).unwrap();
    assert_eq!("7", book.id);
    assert_eq!("https://tululu.org/b7/", book.url.as_str());

    let book = BookRef::from_url(Url::parse("https://tululu.org/b239/").unwrap());
    assert_eq!("239", book.id);
}

#[test]
fn test_book_ref_keeps_base_path() {
    let mirror = Url::parse("https://mirror.example/tululu").unwrap();
    let book = BookRef::from_id(&mirror, 7).unwrap();
    assert_eq!("https://mirror.example/tululu/b7/", book.url.as_str());

    let mirror = Url::parse("https://mirror.example/tululu/").unwrap();
    let book = BookRef::from_id(&mirror, 7).unwrap();
    assert_eq!("https://mirror.example/tululu/b7/", book.url.as_str());

    let book = BookRef::from_id(&Url::parse("https://tululu.org").unwrap(), 7).unwrap();
    assert_eq!("https://tululu.org/b7/", book.url.as_str());
}

#[test]
fn test_downloads_text_and_cover() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new()
        .route("https://tululu.org/b7/", Reply::body(EXAMPLE_PAGE.as_bytes()))
        .route("https://tululu.org/txt.php?id=7", Reply::body("Once upon a time".as_bytes()))
        .route("https://tululu.org/images/7.jpg", Reply::body(b"JPEG"));
    let mut scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);

    let book = BookRef::from_id(&base(), 7).unwrap();
    let saved = scraper.download_book(&book).unwrap().unwrap();

    assert_eq!("Title Example", saved.record.title);
    assert_eq!(Some("Author Name".to_string()), saved.record.author);
    assert_eq!(
        Some("https://tululu.org/txt.php?id=7"),
        saved.record.text_url.as_ref().map(Url::as_str)
    );
    assert_eq!(
        Some("https://tululu.org/images/7.jpg"),
        saved.record.cover_url.as_ref().map(Url::as_str)
    );
    assert_eq!(Some("books/7. Title Example.txt".to_string()), saved.book_path);
    assert_eq!(Some("images/7.jpg".to_string()), saved.cover_path);
    assert_eq!(
        "Once upon a time",
        std::fs::read_to_string(dir.path().join("books/7. Title Example.txt")).unwrap()
    );
    assert_eq!(b"JPEG".to_vec(), std::fs::read(dir.path().join("images/7.jpg")).unwrap());
    assert!(reporter.contains("BookSaved"));
}

#[test]
fn test_book_without_text_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new().route(
        "https://tululu.org/b3/",
        Reply::body(page_without_text("Без текста", "/images/3.jpg").as_bytes()),
    );
    let mut scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);

    let book = BookRef::from_id(&base(), 3).unwrap();
    assert_eq!(None, scraper.download_book(&book).unwrap());

    assert_eq!(vec!["https://tululu.org/b3/".to_string()], fetcher.requests());
    assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    assert!(reporter.contains("TextMissing"));
}

#[test]
fn test_redirected_book_is_absent() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new().route("https://tululu.org/b404/", Reply::Redirect);
    let mut scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);

    let book = BookRef::from_id(&base(), 404).unwrap();
    assert_eq!(None, scraper.download_book(&book).unwrap());
    assert_eq!(0, std::fs::read_dir(dir.path()).unwrap().count());
    assert!(reporter.contains("BookMissing"));
}

#[test]
fn test_shared_cover_is_downloaded_once() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let page = |id: u32| {
        format!(
            r#"<div id="content"><h1>Book {id} :: Author</h1>
            <div class="bookimage"><img src="/images/nopic.gif"></div>
            <table class="d_book"><tr><td><a href="/txt.php?id={id}">скачать txt</a></td></tr></table></div>"#
        )
    };
    let fetcher = FakeFetcher::new()
        .route("https://tululu.org/b1/", Reply::body(page(1).as_bytes()))
        .route("https://tululu.org/b2/", Reply::body(page(2).as_bytes()))
        .route("https://tululu.org/txt.php?id=1", Reply::body(b"one"))
        .route("https://tululu.org/txt.php?id=2", Reply::body(b"two"))
        .route("https://tululu.org/images/nopic.gif", Reply::body(b"GIF"));
    let mut scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);

    let first = scraper.download_book(&BookRef::from_id(&base(), 1).unwrap()).unwrap().unwrap();
    let second = scraper.download_book(&BookRef::from_id(&base(), 2).unwrap()).unwrap().unwrap();

    assert_eq!(first.cover_path, second.cover_path);
    assert_eq!(1, fetcher.request_count("https://tululu.org/images/nopic.gif"));
    assert!(reporter.contains("CoverReused"));
}

#[test]
fn test_skip_options_suppress_downloads() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new().route("https://tululu.org/b7/", Reply::body(EXAMPLE_PAGE.as_bytes()));
    let options = ScrapeOptions {
        skip_text: true,
        skip_images: true,
    };
    let mut scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), options, &reporter);

    let saved = scraper.download_book(&BookRef::from_id(&base(), 7).unwrap()).unwrap().unwrap();

    assert_eq!(None, saved.book_path);
    assert_eq!(None, saved.cover_path);
    assert!(saved.record.text_url.is_some());
    assert_eq!(vec!["https://tululu.org/b7/".to_string()], fetcher.requests());
}

#[test]
fn test_malformed_page_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new().route("https://tululu.org/b9/", Reply::body(b"<html><body>maintenance</body></html>"));
    let mut scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);

    let result = scraper.download_book(&BookRef::from_id(&base(), 9).unwrap());
    assert!(matches!(result, Err(ScrapeError::Parse { .. })));
}

#[test]
fn test_redirected_text_leaves_no_file() {
    let dir = tempfile::tempdir().unwrap();
    let reporter = RecordingReporter::default();
    let fetcher = FakeFetcher::new()
        .route("https://tululu.org/b7/", Reply::body(EXAMPLE_PAGE.as_bytes()))
        .route("https://tululu.org/txt.php?id=7", Reply::Redirect)
        .route("https://tululu.org/images/7.jpg", Reply::body(b"JPEG"));
    let mut scraper = Scraper::new(&fetcher, FileStore::new(dir.path()), ScrapeOptions::default(), &reporter);

    let saved = scraper.download_book(&BookRef::from_id(&base(), 7).unwrap()).unwrap().unwrap();
    assert_eq!(None, saved.book_path);
    assert!(!dir.path().join("books").exists());
    assert_eq!(Some("images/7.jpg".to_string()), saved.cover_path);
}
