use easy_error::{Error, ResultExt};
use serde::Serialize;
use serde_json::ser::{PrettyFormatter, Serializer};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::book::DownloadedBook;

#[cfg(test)]
use crate::book::BookRef;
#[cfg(test)]
use crate::parser::BookRecord;
#[cfg(test)]
use reqwest::Url;

/// One book in the JSON summary of a run.
#[derive(Debug, Serialize)]
pub struct ManifestEntry<'a> {
    pub title: &'a str,
    pub author: Option<&'a str>,
    #[serde(rename = "img_src")]
    pub cover_path: Option<&'a str>,
    pub book_path: Option<&'a str>,
    pub comments: &'a [String],
    pub genres: &'a [String],
}

impl<'a> From<&'a DownloadedBook> for ManifestEntry<'a> {
    fn from(saved: &'a DownloadedBook) -> Self {
        Self {
            title: &saved.record.title,
            author: saved.record.author.as_deref(),
            cover_path: saved.cover_path.as_deref(),
            book_path: saved.book_path.as_deref(),
            comments: &saved.record.comments,
            genres: &saved.record.genres,
        }
    }
}

/// Serializes `books` as a pretty JSON array with four-space indentation.
pub fn write_manifest<W: Write>(writer: W, books: &[DownloadedBook]) -> Result<(), Error> {
    let entries: Vec<ManifestEntry> = books.iter().map(ManifestEntry::from).collect();
    let mut serializer = Serializer::with_formatter(writer, PrettyFormatter::with_indent(b"    "));
    entries
        .serialize(&mut serializer)
        .context("Could not serialize manifest")?;
    Ok(())
}

pub fn save_manifest(path: &Path, books: &[DownloadedBook]) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).context(format!("Could not create directory {parent:?}"))?;
    }
    let file = File::create(path).context(format!("Could not create manifest {path:?}"))?;
    let mut writer = BufWriter::new(file);
    write_manifest(&mut writer, books)?;
    writer.flush().context(format!("Could not write manifest {path:?}"))?;
    Ok(())
}

#[cfg(test)]
fn sample_book() -> DownloadedBook {
    DownloadedBook {
        book: BookRef::from_url(Url::parse("https://tululu.org/b239/").unwrap()),
        record: BookRecord {
            title: "Алиса в Зазеркалье".to_string(),
            author: Some("Кэрролл Льюис".to_string()),
            genres: vec!["Научная фантастика".to_string()],
            comments: vec!["Хорошо".to_string()],
            text_url: Some(Url::parse("https://tululu.org/txt.php?id=239").unwrap()),
            cover_url: None,
        },
        book_path: Some("books/239. Алиса в Зазеркалье.txt".to_string()),
        cover_path: None,
    }
}

#[test]
fn test_manifest_layout() {
    let mut out = Vec::new();
    write_manifest(&mut out, &[sample_book()]).unwrap();
    let json = String::from_utf8(out).unwrap();

    let expected = r#"[
    {
        "title": "Алиса в Зазеркалье",
        "author": "Кэрролл Льюис",
        "img_src": null,
        "book_path": "books/239. Алиса в Зазеркалье.txt",
        "comments": [
            "Хорошо"
        ],
        "genres": [
            "Научная фантастика"
        ]
    }
]"#;
    assert_eq!(expected, json);
}

#[test]
fn test_empty_manifest() {
    let mut out = Vec::new();
    write_manifest(&mut out, &[]).unwrap();
    assert_eq!("[]", String::from_utf8(out).unwrap());
}

#[test]
fn test_save_manifest_creates_parent_folder() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("books_details.json");

    save_manifest(&path, &[sample_book()]).unwrap();

    let written: serde_json::Value = serde_json::from_reader(File::open(&path).unwrap()).unwrap();
    assert_eq!("Кэрролл Льюис", written[0]["author"]);
}
