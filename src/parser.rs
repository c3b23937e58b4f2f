use reqwest::Url;
use scraper::{ElementRef, Html, Selector};

/// Label of the plain-text download link in the book details table.
const TEXT_LINK_LABEL: &str = "скачать txt";
const TITLE_AUTHOR_SEPARATOR: &str = "::";

lazy_static! {
    static ref HEADING_SELECTOR: Selector = Selector::parse("#content h1").unwrap();
    static ref DETAILS_TABLE_SELECTOR: Selector = Selector::parse("table.d_book").unwrap();
    static ref LINK_SELECTOR: Selector = Selector::parse("a").unwrap();
    static ref COVER_SELECTOR: Selector = Selector::parse("div.bookimage img").unwrap();
    static ref COMMENT_BLOCK_SELECTOR: Selector = Selector::parse("#content .texts").unwrap();
    static ref COMMENT_TEXT_SELECTOR: Selector = Selector::parse(".black").unwrap();
    static ref GENRE_SELECTOR: Selector = Selector::parse("#content span.d_book a").unwrap();
    static ref LISTING_ENTRY_SELECTOR: Selector = Selector::parse(".d_book").unwrap();
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("no element matching '{selector}' on page")]
    MissingElement { selector: &'static str },
    #[error("heading '{heading}' has no '::' between title and author")]
    MissingSeparator { heading: String },
    #[error("could not resolve link '{href}'")]
    BadLink {
        href: String,
        #[source]
        source: url::ParseError,
    },
}

/// Fields of a book detail page, links still relative to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookPage {
    pub title: String,
    pub author: Option<String>,
    pub genres: Vec<String>,
    pub comments: Vec<String>,
    pub text_href: Option<String>,
    pub cover_src: Option<String>,
}

/// A book detail page with every link made absolute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookRecord {
    pub title: String,
    pub author: Option<String>,
    pub genres: Vec<String>,
    pub comments: Vec<String>,
    pub text_url: Option<Url>,
    pub cover_url: Option<Url>,
}

impl BookPage {
    pub fn resolve(self, page_url: &Url) -> Result<BookRecord, ParseError> {
        Ok(BookRecord {
            text_url: join_link(page_url, self.text_href.as_deref())?,
            cover_url: join_link(page_url, self.cover_src.as_deref())?,
            title: self.title,
            author: self.author,
            genres: self.genres,
            comments: self.comments,
        })
    }
}

fn join_link(page_url: &Url, href: Option<&str>) -> Result<Option<Url>, ParseError> {
    href.map(|href| {
        page_url.join(href).map_err(|source| ParseError::BadLink {
            href: href.to_string(),
            source,
        })
    })
    .transpose()
}

fn element_text(elem: ElementRef) -> String {
    elem.text().collect::<String>()
}

/// Extracts the book fields from the HTML of a detail page.
pub fn parse_book_page(html: &[u8]) -> Result<BookPage, ParseError> {
    let doc = Html::parse_document(&String::from_utf8_lossy(html));

    let heading = doc
        .select(&HEADING_SELECTOR)
        .next()
        .ok_or(ParseError::MissingElement { selector: "#content h1" })?;
    let heading = element_text(heading);
    let (title, author) = heading
        .split_once(TITLE_AUTHOR_SEPARATOR)
        .ok_or_else(|| ParseError::MissingSeparator {
            heading: heading.trim().to_string(),
        })?;
    let author = Some(author.trim().to_string()).filter(|author| !author.is_empty());

    let details = doc
        .select(&DETAILS_TABLE_SELECTOR)
        .next()
        .ok_or(ParseError::MissingElement { selector: "table.d_book" })?;
    let text_href = details
        .select(&LINK_SELECTOR)
        .find(|link| element_text(*link) == TEXT_LINK_LABEL)
        .and_then(|link| link.value().attr("href"))
        .map(str::to_string);

    let cover_src = doc
        .select(&COVER_SELECTOR)
        .next()
        .and_then(|img| img.value().attr("src"))
        .map(str::to_string);

    let comments = doc
        .select(&COMMENT_BLOCK_SELECTOR)
        .filter_map(|block| block.select(&COMMENT_TEXT_SELECTOR).next())
        .map(element_text)
        .collect();

    let genres = doc.select(&GENRE_SELECTOR).map(element_text).collect();

    Ok(BookPage {
        title: title.trim().to_string(),
        author,
        genres,
        comments,
        text_href,
        cover_src,
    })
}

/// Lists the detail-page links of a category listing page, in page order.
pub fn parse_category_page(html: &[u8]) -> Vec<String> {
    let doc = Html::parse_document(&String::from_utf8_lossy(html));

    doc.select(&LISTING_ENTRY_SELECTOR)
        .filter_map(|entry| entry.select(&LINK_SELECTOR).next())
        .filter_map(|link| link.value().attr("href"))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
const DETAIL_PAGE: &str = r#"<html><body><div id="content">
<h1>Алиса в Зазеркалье &nbsp; :: &nbsp; <a href="/a112/">Кэрролл Льюис</a></h1>
<div class="bookimage"><a href="/b7/"><img src="/shots/7.jpg" alt="cover"></a></div>
<table class="d_book"><tr><td>
<a href="/zip/7/">скачать zip</a>
<a href="/txt.php?id=7">скачать txt</a>
</td></tr></table>
<span class="d_book"><b>Жанр книги:</b> <a href="/l55/">Научная фантастика</a>, <a href="/l17/">Детская литература</a></span>
<div class="texts"><b>Гость</b> <span class="black">Отличная книга!</span></div>
<div class="texts"><b>Гость</b></div>
<div class="texts"><b>Читатель</b> <span class="black">Перечитываю каждый год.</span></div>
</div></body></html>"#;

#[test]
fn test_parses_detail_page() {
    let page = parse_book_page(DETAIL_PAGE.as_bytes()).unwrap();

    assert_eq!("Алиса в Зазеркалье", page.title);
    assert_eq!(Some("Кэрролл Льюис".to_string()), page.author);
    assert_eq!(Some("/txt.php?id=7".to_string()), page.text_href);
    assert_eq!(Some("/shots/7.jpg".to_string()), page.cover_src);
    assert_eq!(vec!["Научная фантастика", "Детская литература"], page.genres);
    assert_eq!(vec!["Отличная книга!", "Перечитываю каждый год."], page.comments);
}

#[test]
fn test_text_link_must_match_label_exactly() {
    let html = r#"<div id="content"><h1>Title :: Author</h1>
        <table class="d_book"><tr><td><a href="/txt.php?id=1">Скачать TXT</a></td></tr></table></div>"#;
    let page = parse_book_page(html.as_bytes()).unwrap();

    assert_eq!(None, page.text_href);
    assert_eq!(None, page.cover_src);
    assert!(page.genres.is_empty());
    assert!(page.comments.is_empty());
}

#[test]
fn test_missing_heading_is_an_error() {
    let html = r#"<div id="content"><table class="d_book"></table></div>"#;
    assert!(matches!(
        parse_book_page(html.as_bytes()),
        Err(ParseError::MissingElement { selector: "#content h1" })
    ));
}

#[test]
fn test_heading_without_separator_is_an_error() {
    let html = r#"<div id="content"><h1>Just a title</h1><table class="d_book"></table></div>"#;
    match parse_book_page(html.as_bytes()) {
        Err(ParseError::MissingSeparator { heading }) => assert_eq!("Just a title", heading),
        other => panic!("expected separator error, got {other:?}"),
    }
}

#[test]
fn test_missing_details_table_is_an_error() {
    let html = r#"<div id="content"><h1>Title :: Author</h1></div>"#;
    assert!(matches!(
        parse_book_page(html.as_bytes()),
        Err(ParseError::MissingElement { selector: "table.d_book" })
    ));
}

#[test]
fn test_empty_author_is_absent() {
    let html = r#"<div id="content"><h1>Anonymous tales ::  </h1><table class="d_book"></table></div>"#;
    let page = parse_book_page(html.as_bytes()).unwrap();
    assert_eq!("Anonymous tales", page.title);
    assert_eq!(None, page.author);
}

#[test]
fn test_resolve_makes_links_absolute() {
    let page = parse_book_page(DETAIL_PAGE.as_bytes()).unwrap();
    let record = page.resolve(&Url::parse("https://tululu.org/b7/").unwrap()).unwrap();

    assert_eq!("https://tululu.org/txt.php?id=7", record.text_url.unwrap().as_str());
    assert_eq!("https://tululu.org/shots/7.jpg", record.cover_url.unwrap().as_str());
}

#[test]
fn test_parses_category_page() {
    let html = r#"<div id="content">
        <table class="d_book"><tr><td><a href="/b239/"><img src="/shots/239.jpg"></a></td></tr>
        <tr><td><a href="/b239/">Тень</a></td></tr></table>
        <table class="d_book"><tr><td>no link here</td></tr></table>
        <table class="d_book"><tr><td><a href="/b550/"><img src="/shots/550.jpg"></a></td></tr></table>
        </div>"#;

    assert_eq!(vec!["/b239/", "/b550/"], parse_category_page(html.as_bytes()));
}
