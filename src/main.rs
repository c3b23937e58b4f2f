extern crate easy_error;
#[macro_use]
extern crate lazy_static;
extern crate reqwest;
extern crate scraper;
extern crate structopt;

mod book;
mod crawler;
mod downloader;
mod fetcher;
mod logging;
mod manifest;
mod parser;
mod report;
#[cfg(test)]
mod test_support;

use book::{ScrapeOptions, Scraper};
use crawler::{Crawler, RetryPolicy, ThreadSleeper};
use downloader::FileStore;
use easy_error::{Error, ResultExt};
use fetcher::HttpFetcher;
use report::TracingReporter;
use reqwest::Url;
use std::num::NonZeroU32;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use structopt::StructOpt;

#[cfg(test)]
use test_support::{Route, StubServer};

const MANIFEST_FILE: &str = "books_details.json";

/// Downloads book texts into `books/` and covers into `images/` from tululu.org.
#[derive(StructOpt)]
struct Args {
    /// Root of the site
    #[structopt(long, default_value = "https://tululu.org")]
    base_url: String,
    /// Folder that receives books/, images/ and the manifest
    #[structopt(short, long, default_value = ".", parse(from_os_str))]
    dest_folder: PathBuf,
    /// Do not download book texts
    #[structopt(short = "t", long)]
    skip_txt: bool,
    /// Do not download cover images
    #[structopt(short = "i", long)]
    skip_imgs: bool,
    /// Where to write the JSON summary of downloaded books
    #[structopt(short, long, parse(from_os_str))]
    json_path: Option<PathBuf>,
    /// Give up on a book after this many connection failures. Retries forever when unset
    #[structopt(long)]
    max_attempts: Option<NonZeroU32>,
    /// Seconds to wait after a connection failure
    #[structopt(long, default_value = "30")]
    backoff_secs: u64,
    /// Request timeout in seconds, the HTTP client default when unset
    #[structopt(long)]
    timeout_secs: Option<u64>,
    /// Log to this file instead of stderr
    #[structopt(long, parse(from_os_str))]
    log_file: Option<PathBuf>,
    #[structopt(subcommand)]
    command: Command,
}

#[derive(StructOpt)]
enum Command {
    /// Download books by their numeric id
    Books {
        /// First book id
        #[structopt(short, long, default_value = "1")]
        start_id: u32,
        /// Last book id, only the first one when unset
        #[structopt(short, long)]
        end_id: Option<u32>,
    },
    /// Download every book listed on a range of category pages
    Category {
        /// Category number, 55 is science fiction
        #[structopt(long, default_value = "55")]
        category: u32,
        /// First listing page
        #[structopt(short, long, default_value = "1")]
        start_page: u32,
        /// Last listing page, only the first one when unset
        #[structopt(short, long)]
        end_page: Option<u32>,
    },
    /// Download the books behind the given detail page URLs
    Urls {
        #[structopt(required = true)]
        urls: Vec<String>,
    },
}

fn main() -> Result<(), Error> {
    let args = Args::from_args();
    let base_url = Url::parse(&args.base_url).context(format!("Invalid base URL '{}'", args.base_url))?;
    let urls = match args.command {
        Command::Urls { ref urls } => parse_urls(urls)?,
        _ => Vec::new(),
    };

    logging::init(args.log_file.as_deref())?;

    let retry = RetryPolicy {
        max_attempts: args.max_attempts,
        backoff: Duration::from_secs(args.backoff_secs),
    };
    let options = ScrapeOptions {
        skip_text: args.skip_txt,
        skip_images: args.skip_imgs,
    };
    let fetcher = HttpFetcher::new(args.timeout_secs.map(Duration::from_secs))?;
    let reporter = TracingReporter;
    let scraper = Scraper::new(fetcher, FileStore::new(&args.dest_folder), options, &reporter);
    let mut crawler = Crawler::new(scraper, retry, ThreadSleeper);

    let (books, json_path) = match args.command {
        Command::Books { start_id, end_id } => {
            let books = crawler
                .run_ids(&base_url, normalize_range(start_id, end_id))
                .context("Could not build book URLs")?;
            (books, args.json_path)
        }
        Command::Category {
            category,
            start_page,
            end_page,
        } => {
            let books = crawler
                .run_category(&base_url, category, normalize_range(start_page, end_page))
                .context("Could not build listing URLs")?;
            let json_path = args
                .json_path
                .unwrap_or_else(|| default_manifest_path(&args.dest_folder));
            (books, Some(json_path))
        }
        Command::Urls { .. } => (crawler.run_urls(urls), args.json_path),
    };

    tracing::info!(books = books.len(), "run finished");
    if let Some(path) = json_path {
        manifest::save_manifest(&path, &books)?;
        tracing::info!(path = %path.display(), "manifest written");
    }
    Ok(())
}

fn parse_urls(urls: &[String]) -> Result<Vec<Url>, Error> {
    urls.iter()
        .map(|url| Url::parse(url).context(format!("Invalid book URL '{url}'")))
        .collect()
}

fn default_manifest_path(dest_folder: &Path) -> PathBuf {
    dest_folder.join(MANIFEST_FILE)
}

/// Zero start means 1, missing or zero end means "just the start", reversed bounds are swapped.
fn normalize_range(start: u32, end: Option<u32>) -> RangeInclusive<u32> {
    let start = start.max(1);
    let end = end.filter(|&end| end != 0).unwrap_or(start);
    if start > end {
        end..=start
    } else {
        start..=end
    }
}

#[test]
fn test_normalize_range() {
    assert_eq!(1..=1, normalize_range(0, None));
    assert_eq!(5..=5, normalize_range(5, None));
    assert_eq!(5..=5, normalize_range(5, Some(0)));
    assert_eq!(3..=10, normalize_range(3, Some(10)));
    assert_eq!(3..=10, normalize_range(10, Some(3)));
}

#[test]
fn test_args_parse_books_command() {
    let args = Args::from_iter_safe(&["tululu-scraper", "-d", "library", "-t", "books", "-s", "20", "-e", "30"]).unwrap();
    assert_eq!(PathBuf::from("library"), args.dest_folder);
    assert!(args.skip_txt);
    assert!(!args.skip_imgs);
    assert_eq!(None, args.max_attempts);
    assert_eq!(30, args.backoff_secs);
    match args.command {
        Command::Books { start_id, end_id } => assert_eq!((20, Some(30)), (start_id, end_id)),
        _ => panic!("expected books command"),
    }
}

#[test]
fn test_args_reject_zero_max_attempts() {
    assert!(Args::from_iter_safe(&["tululu-scraper", "--max-attempts", "0", "books"]).is_err());
}

#[test]
fn test_parse_urls_rejects_garbage() {
    assert!(parse_urls(&["https://tululu.org/b1/".to_string()]).is_ok());
    assert!(parse_urls(&["not a url".to_string()]).is_err());
}

#[test]
fn test_downloads_over_http() {
    const PAGE: &str = r#"<html><body><div id="content">
        <h1>Title Example :: Author Name</h1>
        <div class="bookimage"><img src="/images/7.jpg"></div>
        <table class="d_book"><tr><td><a href="/txt.php?id=7">скачать txt</a></td></tr></table>
        </div></body></html>"#;
    let server = StubServer::start(|path| match path {
        "/b7/" => Route::ok(PAGE),
        "/txt.php?id=7" => Route::ok("Once upon a time"),
        "/images/7.jpg" => Route::ok(b"JPEG"),
        "/" => Route::ok("home"),
        _ => Route::redirect("/"),
    });
    let dir = tempfile::tempdir().unwrap();
    let reporter = test_support::RecordingReporter::default();
    let scraper = Scraper::new(
        HttpFetcher::new(Some(Duration::from_secs(10))).unwrap(),
        FileStore::new(dir.path()),
        ScrapeOptions::default(),
        &reporter,
    );
    let mut crawler = Crawler::new(scraper, RetryPolicy::default(), test_support::CountingSleeper::default());

    let books = crawler.run_ids(server.base(), 7..=8).unwrap();

    assert_eq!(1, books.len());
    assert_eq!(Some("Author Name"), books[0].record.author.as_deref());
    assert_eq!(server.url("/txt.php?id=7"), books[0].record.text_url.clone().unwrap());
    assert_eq!(
        "Once upon a time",
        std::fs::read_to_string(dir.path().join("books").join("7. Title Example.txt")).unwrap()
    );
    assert_eq!(b"JPEG".to_vec(), std::fs::read(dir.path().join("images").join("7.jpg")).unwrap());
    assert!(reporter.contains("BookMissing"));

    let manifest_path = default_manifest_path(dir.path());
    manifest::save_manifest(&manifest_path, &books).unwrap();
    let written = std::fs::read_to_string(manifest_path).unwrap();
    assert!(written.contains(r#""book_path": "books/7. Title Example.txt""#));
    assert!(written.contains(r#""img_src": "images/7.jpg""#));
}
