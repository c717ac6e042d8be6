//! Readability-style main-content extraction.
//!
//! The pipeline is: parse → pick the densest non-boilerplate container → serialize a cleaned
//! HTML fragment (navigation, scripts, forms dropped) → `html2text` → hard character cut.
//!
//! This is deterministic and heuristic, not a full readability engine.

use html_scraper::node::Node;
use html_scraper::{ElementRef, Html, Selector};
use std::io::Cursor;

pub const DEFAULT_TEXT_WIDTH: usize = 120;

#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("html to text conversion failed: {0}")]
    Render(String),
}

/// Title plus the cleaned main-content fragment of a document.
#[derive(Debug, Clone, Default)]
pub struct Readable {
    pub title: String,
    pub html: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedPage {
    pub title: String,
    pub content: String,
    pub text_chars: usize,
    pub truncated: bool,
}

// Elements that never carry article text.
const DROP_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "header", "footer", "aside", "form",
    "iframe", "svg", "canvas", "button", "select", "input", "textarea", "dialog",
];

// Below this many text chars a token-matched block is treated as chrome.
const SHORT_BLOCK_CHARS: usize = 200;

const VOID_TAGS: &[&str] = &["br", "hr", "img", "wbr", "source", "track", "area", "col"];

// Structural UI words matched against whole class/id tokens.
const BOILERPLATE_TOKENS: &[&str] = &[
    "nav",
    "navbar",
    "navigation",
    "menu",
    "sidebar",
    "footer",
    "header",
    "masthead",
    "banner",
    "breadcrumb",
    "breadcrumbs",
    "cookie",
    "consent",
    "ads",
    "advert",
    "advertisement",
    "promo",
    "subscribe",
    "newsletter",
    "share",
    "social",
    "related",
    "comments",
];

pub fn norm_ws(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn has_any_text(s: &str) -> bool {
    s.chars().any(|c| !c.is_whitespace())
}

fn class_or_id_tokens(el: &ElementRef) -> Vec<String> {
    let mut raw = String::new();
    if let Some(c) = el.value().attr("class") {
        raw.push_str(c);
        raw.push(' ');
    }
    if let Some(i) = el.value().attr("id") {
        raw.push_str(i);
    }
    raw.to_ascii_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_string())
        .collect()
}

fn element_text_chars(el: &ElementRef) -> usize {
    el.text().map(|t| t.chars().count()).sum()
}

fn element_link_text_chars(el: &ElementRef) -> usize {
    let Ok(links) = Selector::parse("a") else {
        return 0;
    };
    el.select(&links)
        .map(|a| a.text().map(|t| t.chars().count()).sum::<usize>())
        .sum()
}

fn role(el: &ElementRef) -> String {
    el.value()
        .attr("role")
        .map(|r| r.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn is_content_root(el: &ElementRef) -> bool {
    matches!(el.value().name(), "article" | "main") || role(el) == "main"
}

fn contains_content_root(el: &ElementRef) -> bool {
    el.descendants()
        .filter_map(ElementRef::wrap)
        .skip(1)
        .any(|d| is_content_root(&d))
}

fn is_landmark_boilerplate(el: &ElementRef) -> bool {
    matches!(
        role(el).as_str(),
        "navigation" | "banner" | "contentinfo" | "complementary" | "search"
    )
}

/// A container to drop as a unit. Class/id tokens only count for short or link-heavy
/// blocks, so a layout wrapper like `has-sidebar` around the article is kept.
fn is_boilerplate(el: &ElementRef) -> bool {
    if is_content_root(el) || contains_content_root(el) {
        return false;
    }
    if is_landmark_boilerplate(el) {
        return true;
    }
    let tokens = class_or_id_tokens(el);
    if !tokens
        .iter()
        .any(|t| BOILERPLATE_TOKENS.contains(&t.as_str()))
    {
        return false;
    }
    let txt = element_text_chars(el);
    txt < SHORT_BLOCK_CHARS || element_link_text_chars(el) * 2 > txt
}

// Ancestors exclude a candidate only by tag or landmark role, never by class tokens.
fn inside_boilerplate(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .take_while(|a| !is_content_root(a))
        .any(|a| DROP_TAGS.contains(&a.value().name()) || is_landmark_boilerplate(&a))
}

fn pick_main_element<'a>(doc: &'a Html, max_elems: usize) -> Option<ElementRef<'a>> {
    let candidates = Selector::parse("article, main, section, div, td").ok()?;
    let mut best_score: i64 = 0;
    let mut best: Option<ElementRef<'a>> = None;

    for (seen, el) in doc.select(&candidates).enumerate() {
        if seen >= max_elems {
            break;
        }
        if is_boilerplate(&el) || inside_boilerplate(&el) {
            continue;
        }
        let txt = element_text_chars(&el);
        if txt < 20 {
            continue;
        }
        let link_txt = element_link_text_chars(&el);
        // Dense non-link text wins; link text is usually menus and tag clouds.
        let mut score = txt as i64 - 2 * (link_txt as i64);
        match el.value().name() {
            "article" => score += 500,
            "main" => score += 300,
            _ => {}
        }
        if link_txt > txt / 2 {
            score -= 500;
        }
        if score > best_score {
            best_score = score;
            best = Some(el);
        }
    }
    best
}

fn push_escaped(out: &mut String, text: &str) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
}

/// Re-serialize `el`'s children without boilerplate subtrees or attributes.
fn write_clean(el: ElementRef, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(t) => push_escaped(out, t),
            Node::Element(e) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = e.name();
                if DROP_TAGS.contains(&name) || is_boilerplate(&child_el) {
                    continue;
                }
                out.push('<');
                out.push_str(name);
                out.push('>');
                if VOID_TAGS.contains(&name) {
                    continue;
                }
                write_clean(child_el, out);
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            _ => {}
        }
    }
}

fn document_title(doc: &Html) -> String {
    for css in ["title", "h1"] {
        let Ok(sel) = Selector::parse(css) else {
            continue;
        };
        if let Some(el) = doc.select(&sel).next() {
            let t = norm_ws(&el.text().collect::<Vec<_>>().join(" "));
            if !t.is_empty() {
                return t;
            }
        }
    }
    String::new()
}

/// Title and cleaned main-content HTML. Falls back to `<body>` when no container scores.
pub fn readable(html: &str) -> Readable {
    let doc = Html::parse_document(html);
    let title = document_title(&doc);

    let main = pick_main_element(&doc, 20_000).or_else(|| {
        let body = Selector::parse("body").ok()?;
        doc.select(&body).next()
    });

    let mut fragment = String::new();
    if let Some(el) = main {
        fragment.push_str("<div>");
        write_clean(el, &mut fragment);
        fragment.push_str("</div>");
    }
    Readable {
        title,
        html: fragment,
    }
}

/// Convert an HTML fragment to plain text with trailing whitespace and blank-line runs collapsed.
pub fn html_to_text(html: &str, width: usize) -> Result<String, ExtractError> {
    let width = width.max(20);
    let raw = html2text::from_read(Cursor::new(html.as_bytes()), width)
        .map_err(|e| ExtractError::Render(e.to_string()))?;

    let mut out = String::with_capacity(raw.len());
    let mut blank_run = 0usize;
    for line in raw.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    Ok(out.trim().to_string())
}

/// Hard cut at `max_chars` characters (not bytes, not word-aware).
///
/// Returns the kept text, its char count, and whether anything was dropped.
pub fn truncate_to_chars(s: &str, max_chars: usize) -> (String, usize, bool) {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (s[..byte_idx].to_string(), max_chars, true),
        None => (s.to_string(), s.chars().count(), false),
    }
}

/// Full extraction for one HTML document.
pub fn extract_page(
    html: &str,
    max_chars: usize,
    width: usize,
) -> Result<ExtractedPage, ExtractError> {
    if !has_any_text(html) {
        return Ok(ExtractedPage::default());
    }
    let Readable { title, html } = readable(html);
    let text = html_to_text(&html, width)?;
    let (content, text_chars, truncated) = truncate_to_chars(&text, max_chars);
    Ok(ExtractedPage {
        title,
        content,
        text_chars,
        truncated,
    })
}
