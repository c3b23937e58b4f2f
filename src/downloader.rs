use easy_error::{err_msg, Error, ResultExt};
use reqwest::Url;
use std::fs::{create_dir_all, write};
use std::path::{Path, PathBuf};

use crate::fetcher::{Fetch, FetchError};

#[cfg(test)]
use crate::test_support::{FakeFetcher, Reply};

const MAX_FILENAME_BYTES: usize = 255;

const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Strips characters no mainstream filesystem accepts, keeping the rest readable.
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|'))
        .filter(|c| !c.is_control())
        .collect();

    let mut shortened = trim_name(&cleaned).to_string();
    truncate_name(&mut shortened);
    let trimmed = trim_name(&shortened);

    let (stem, rest) = match trimmed.find('.') {
        Some(dot) => trimmed.split_at(dot),
        None => (trimmed, ""),
    };
    if !RESERVED_NAMES.iter().any(|reserved| stem.eq_ignore_ascii_case(reserved)) {
        return trimmed.to_string();
    }

    // The guard suffix can push the name back over the limit.
    let mut guarded = format!("{stem}_{rest}");
    truncate_name(&mut guarded);
    trim_name(&guarded).to_string()
}

fn trim_name(name: &str) -> &str {
    name.trim().trim_end_matches(|c: char| c == '.' || c.is_whitespace())
}

fn truncate_name(name: &mut String) {
    if name.len() <= MAX_FILENAME_BYTES {
        return;
    }
    let mut end = MAX_FILENAME_BYTES;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name.truncate(end);
}

/// Last path segment of `url`, percent-decoded. `None` for URLs ending in a slash.
pub fn filename_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.last()?;
    if segment.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode_binary(segment.as_bytes());
    Some(String::from_utf8_lossy(&decoded).into_owned())
}

/// Writes downloads below a fixed root directory.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Writes `contents` to `folder/filename` and returns that path with forward slashes,
    /// relative to the root.
    pub fn save(&self, folder: &str, filename: &str, contents: &[u8]) -> Result<String, Error> {
        let filename = sanitize_filename(filename);
        if filename.is_empty() {
            return Err(err_msg(format!("Nothing left of file name for folder {folder} after sanitizing")));
        }

        let dir = self.root.join(folder);
        create_dir_all(&dir).context(format!("Could not create directory {dir:?}"))?;

        let path = dir.join(&filename);
        write(&path, contents).context(format!("Could not write {path:?}"))?;

        Ok(format!("{folder}/{filename}"))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error(transparent)]
    Fetch(FetchError),
    #[error(transparent)]
    Storage(Error),
}

/// Fetches `url` and stores it as `folder/filename`.
/// Returns `None` when the site redirected, meaning it has no such file.
pub fn download<F: Fetch>(
    fetcher: &F,
    store: &FileStore,
    url: &Url,
    filename: &str,
    folder: &str,
) -> Result<Option<String>, DownloadError> {
    let contents: Vec<u8> = match fetcher.fetch(url) {
        Ok(contents) => contents,
        Err(FetchError::Redirected { .. }) => return Ok(None),
        Err(err) => return Err(DownloadError::Fetch(err)),
    };

    store
        .save(folder, filename, &contents)
        .map(Some)
        .map_err(DownloadError::Storage)
}

#[test]
fn test_sanitize_removes_illegal_characters() {
    assert_eq!("12. Что делать.txt", sanitize_filename("12. Что делать?.txt"));
    assert_eq!("Война и мир Том 1.txt", sanitize_filename("Война и: мир *Том* 1.txt"));
    assert_eq!("name", sanitize_filename("  name.. \t"));
    assert_eq!("ab", sanitize_filename("a\u{0}\nb"));
}

#[test]
fn test_sanitize_guards_reserved_names() {
    assert_eq!("CON_", sanitize_filename("CON"));
    assert_eq!("nul_.txt", sanitize_filename("nul.txt"));
    assert_eq!("CONSOLE.txt", sanitize_filename("CONSOLE.txt"));
}

#[test]
fn test_sanitize_truncates_on_char_boundary() {
    let long = "ж".repeat(200);
    let sanitized = sanitize_filename(&long);
    assert!(sanitized.len() <= MAX_FILENAME_BYTES);
    assert_eq!(127, sanitized.chars().count());
}

#[test]
fn test_sanitize_is_idempotent() {
    let samples = [
        "7. Title Example.txt",
        "  dots at the end... ",
        "a/b\\c:d*e?f\"g<h>i|j",
        "COM1.tar.gz",
        "lpt9",
        "Заголовок :: с двоеточием?.txt",
        " . ",
    ];
    for sample in samples.iter() {
        let once = sanitize_filename(sample);
        assert_eq!(once, sanitize_filename(&once), "sample {sample:?}");
    }
    let long = format!("{}.txt", "x ".repeat(200));
    let once = sanitize_filename(&long);
    assert_eq!(once, sanitize_filename(&once));
}

#[test]
fn test_reserved_name_at_length_limit() {
    let long = format!("CON.{}", "a".repeat(251));
    let once = sanitize_filename(&long);

    assert!(once.len() <= MAX_FILENAME_BYTES, "{} bytes", once.len());
    assert!(once.starts_with("CON_."));
    assert_eq!(once, sanitize_filename(&once));

    let long = format!("lpt1.{}", "ж".repeat(130));
    let once = sanitize_filename(&long);
    assert!(once.len() <= MAX_FILENAME_BYTES, "{} bytes", once.len());
    assert_eq!(once, sanitize_filename(&once));

    // Truncation alone leaves a bare reserved stem here.
    let long = format!("CON{}x", " ".repeat(300));
    assert_eq!("CON_", sanitize_filename(&long));
}

#[test]
fn test_filename_from_url_decodes_last_segment() {
    let url = Url::parse("https://tululu.org/shots/%D0%BE%D0%B1%D0%BB%D0%BE%D0%B6%D0%BA%D0%B0.jpg?w=1").unwrap();
    assert_eq!(Some("обложка.jpg".to_string()), filename_from_url(&url));

    let url = Url::parse("https://tululu.org/images/nopic.gif").unwrap();
    assert_eq!(Some("nopic.gif".to_string()), filename_from_url(&url));

    let url = Url::parse("https://tululu.org/images/").unwrap();
    assert_eq!(None, filename_from_url(&url));
}

#[test]
fn test_save_creates_folder_and_overwrites() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());

    let saved = store.save("books", "1. Первая?.txt", b"old").unwrap();
    assert_eq!("books/1. Первая.txt", saved);

    store.save("books", "1. Первая?.txt", b"new").unwrap();
    let path = dir.path().join("books").join("1. Первая.txt");
    assert_eq!(b"new".to_vec(), std::fs::read(path).unwrap());
}

#[test]
fn test_download_skips_redirected_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    let fetcher = FakeFetcher::new().route("https://tululu.org/txt.php?id=5", Reply::Redirect);

    let url = Url::parse("https://tululu.org/txt.php?id=5").unwrap();
    let saved = download(&fetcher, &store, &url, "5. Missing.txt", "books").unwrap();

    assert_eq!(None, saved);
    assert!(!dir.path().join("books").exists());
}

#[test]
fn test_download_writes_body() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    let fetcher = FakeFetcher::new().route("https://tululu.org/images/7.jpg", Reply::body(b"JPEG"));

    let url = Url::parse("https://tululu.org/images/7.jpg").unwrap();
    let saved = download(&fetcher, &store, &url, "7.jpg", "images").unwrap().unwrap();

    assert_eq!("images/7.jpg", saved);
    assert_eq!(b"JPEG".to_vec(), std::fs::read(dir.path().join("images").join("7.jpg")).unwrap());
}

#[test]
fn test_download_propagates_status_errors() {
    let dir = tempfile::tempdir().unwrap();
    let store = FileStore::new(dir.path());
    let fetcher = FakeFetcher::new().route("https://tululu.org/images/7.jpg", Reply::Status(500));

    let url = Url::parse("https://tululu.org/images/7.jpg").unwrap();
    let result = download(&fetcher, &store, &url, "7.jpg", "images");
    assert!(matches!(
        result,
        Err(DownloadError::Fetch(FetchError::HttpStatus { status: 500, .. }))
    ));
}
