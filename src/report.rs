use reqwest::Url;
use std::time::Duration;

use crate::book::{BookRef, DownloadedBook, ScrapeError};

/// Something worth telling the operator about while a run progresses.
#[derive(Debug)]
pub enum Event<'a> {
    /// The site redirected the detail page, so there is no such book.
    BookMissing { book: &'a BookRef },
    /// The book exists but offers no plain-text download.
    TextMissing { book: &'a BookRef, title: &'a str },
    BookSaved { saved: &'a DownloadedBook },
    CoverReused { book: &'a BookRef, url: &'a Url },
    ConnectionFault {
        unit: &'a str,
        attempt: u32,
        delay: Duration,
        error: &'a ScrapeError,
    },
    UnitSkipped { unit: &'a str, error: &'a ScrapeError },
    ListingPage { url: &'a Url, books: usize },
    ListingStopped { url: &'a Url, error: &'a ScrapeError },
}

/// Receives progress events from the orchestrator and the driver.
pub trait Reporter {
    fn report(&self, event: Event);
}

/// Forwards events to `tracing`.
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, event: Event) {
        match event {
            Event::BookMissing { book } => {
                tracing::info!(book = %book.id, url = %book.url, "book is not on the site");
            }
            Event::TextMissing { book, title } => {
                tracing::warn!(book = %book.id, title, "book skipped, the site has no text for it");
            }
            Event::BookSaved { saved } => {
                tracing::info!(
                    book = %saved.book.id,
                    title = %saved.record.title,
                    text = saved.book_path.as_deref().unwrap_or("-"),
                    cover = saved.cover_path.as_deref().unwrap_or("-"),
                    "book downloaded"
                );
            }
            Event::CoverReused { book, url } => {
                tracing::debug!(book = %book.id, %url, "cover already downloaded in this run");
            }
            Event::ConnectionFault {
                unit,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(unit, attempt, ?delay, %error, "connection failed, retrying");
            }
            Event::UnitSkipped { unit, error } => {
                if error.is_storage() {
                    tracing::error!(unit, %error, "skipped");
                } else {
                    tracing::warn!(unit, %error, "skipped");
                }
            }
            Event::ListingPage { url, books } => {
                tracing::info!(%url, books, "listing page read");
            }
            Event::ListingStopped { url, error } => {
                tracing::info!(%url, %error, "no more listing pages");
            }
        }
    }
}
