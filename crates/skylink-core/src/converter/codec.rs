//! A small markup grammar shared by both directions.
//!
//! The remote network embeds pseudo-tags (`<at>`, `<quote>`, `<e_m/>`,
//! `<legacyquote>`) in otherwise HTML-ish text, and the home protocol uses a
//! restricted HTML subset. Both are tokenized by the same scanner and parsed
//! into a [`Node`] tree that the converter renders for the other side.

/// A lexical token of the markup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Open {
        name: String,
        attrs: Vec<(String, String)>,
        self_closing: bool,
    },
    Close(String),
}

impl Token {
    pub fn attr<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
        attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Bold,
    Italic,
    Strike,
    Code,
}

impl Style {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "b" | "strong" => Some(Style::Bold),
            "i" | "em" => Some(Style::Italic),
            "s" | "del" | "strike" => Some(Style::Strike),
            "pre" | "code" => Some(Style::Code),
            _ => None,
        }
    }
}

/// A quoted earlier message, as embedded by the remote network.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuoteBlock {
    pub author: String,
    pub author_name: String,
    pub timestamp: i64,
    pub conversation: String,
    pub message_id: String,
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Text(String),
    Mention { id: String, name: String },
    Link { href: String, children: Vec<Node> },
    Styled { style: Style, children: Vec<Node> },
    Quote(QuoteBlock),
    LineBreak,
    EditMarker,
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let decoded = rest
            .find(';')
            .filter(|end| *end <= 10)
            .and_then(|end| decode_entity(&rest[1..end]).map(|ch| (ch, end)));
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &rest[end + 1..];
            }
            None => {
                out.push('&');
                rest = &rest[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let number = name.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Split markup into tokens. Malformed tags degrade to text.
pub fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut rest = input;

    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match tag_end(after) {
            Some(end) => {
                let inner = &after[..end];
                rest = &after[end + 1..];
                if inner.starts_with('!') || inner.starts_with('?') {
                    continue;
                }
                match parse_tag(inner) {
                    Some(token) => {
                        if !text.is_empty() {
                            tokens.push(Token::Text(unescape(&text)));
                            text.clear();
                        }
                        tokens.push(token);
                    }
                    None => {
                        text.push('<');
                        text.push_str(inner);
                        text.push('>');
                    }
                }
            }
            None => {
                text.push('<');
                rest = after;
            }
        }
    }
    text.push_str(rest);
    if !text.is_empty() {
        tokens.push(Token::Text(unescape(&text)));
    }
    tokens
}

/// Index of the `>` closing a tag, skipping quoted attribute values.
fn tag_end(input: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    for (idx, ch) in input.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '<') => return None,
            (None, '>') => return Some(idx),
            (None, _) => {}
        }
    }
    None
}

fn parse_tag(inner: &str) -> Option<Token> {
    let inner = inner.trim();
    if let Some(name) = inner.strip_prefix('/') {
        let name = name.trim();
        return valid_name(name).then(|| Token::Close(name.to_ascii_lowercase()));
    }

    let (body, self_closing) = match inner.strip_suffix('/') {
        Some(body) => (body.trim_end(), true),
        None => (inner, false),
    };
    let name_end = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    let name = &body[..name_end];
    if !valid_name(name) {
        return None;
    }

    Some(Token::Open {
        name: name.to_ascii_lowercase(),
        attrs: parse_attrs(&body[name_end..]),
        self_closing,
    })
}

fn valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn parse_attrs(mut rest: &str) -> Vec<(String, String)> {
    let mut attrs = Vec::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace())
            .unwrap_or(rest.len());
        let key = rest[..key_end].to_ascii_lowercase();
        rest = rest[key_end..].trim_start();

        let value = match rest.strip_prefix('=') {
            Some(after) => {
                let after = after.trim_start();
                match after.chars().next() {
                    Some(q @ ('"' | '\'')) => {
                        let body = &after[1..];
                        let end = body.find(q).unwrap_or(body.len());
                        rest = body.get(end + 1..).unwrap_or("");
                        unescape(&body[..end])
                    }
                    _ => {
                        let end = after
                            .find(char::is_whitespace)
                            .unwrap_or(after.len());
                        rest = &after[end..];
                        unescape(&after[..end])
                    }
                }
            }
            None => String::new(),
        };
        if !key.is_empty() {
            attrs.push((key, value));
        }
    }
    attrs
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Tags whose whole content is discarded.
const DROPPED: &[&str] = &["legacyquote", "mx-reply", "script", "style"];

pub fn parse(input: &str) -> Vec<Node> {
    let tokens = tokenize(input);
    let mut pos = 0;
    parse_until(&tokens, &mut pos, None)
}

fn parse_until(tokens: &[Token], pos: &mut usize, until: Option<&str>) -> Vec<Node> {
    let mut nodes = Vec::new();
    while let Some(token) = tokens.get(*pos) {
        *pos += 1;
        match token {
            Token::Text(text) => push_text(&mut nodes, text),
            Token::Close(name) => {
                if Some(name.as_str()) == until {
                    return nodes;
                }
            }
            Token::Open {
                name,
                attrs,
                self_closing,
            } => {
                let name = name.as_str();
                let children = |pos: &mut usize| {
                    if *self_closing {
                        Vec::new()
                    } else {
                        parse_until(tokens, pos, Some(name))
                    }
                };
                match name {
                    "br" => nodes.push(Node::LineBreak),
                    "e_m" => {
                        children(pos);
                        nodes.push(Node::EditMarker);
                    }
                    _ if DROPPED.contains(&name) => {
                        children(pos);
                    }
                    "at" => {
                        let inner = children(pos);
                        nodes.push(Node::Mention {
                            id: Token::attr(attrs, "id").unwrap_or_default().to_string(),
                            name: plain_text(&inner),
                        });
                    }
                    "quote" => {
                        let inner = children(pos);
                        nodes.push(Node::Quote(QuoteBlock {
                            author: Token::attr(attrs, "author").unwrap_or_default().to_string(),
                            author_name: Token::attr(attrs, "authorname")
                                .unwrap_or_default()
                                .to_string(),
                            timestamp: Token::attr(attrs, "timestamp")
                                .and_then(|ts| ts.parse().ok())
                                .unwrap_or_default(),
                            conversation: Token::attr(attrs, "conversation")
                                .unwrap_or_default()
                                .to_string(),
                            message_id: Token::attr(attrs, "messageid")
                                .unwrap_or_default()
                                .to_string(),
                            children: inner,
                        }));
                    }
                    "a" => {
                        let inner = children(pos);
                        nodes.push(Node::Link {
                            href: Token::attr(attrs, "href").unwrap_or_default().to_string(),
                            children: inner,
                        });
                    }
                    "p" | "div" | "li" => {
                        let inner = children(pos);
                        if !nodes.is_empty() {
                            nodes.push(Node::LineBreak);
                        }
                        nodes.extend(inner);
                    }
                    other => {
                        let inner = children(pos);
                        match Style::from_tag(other) {
                            Some(style) => nodes.push(Node::Styled {
                                style,
                                children: inner,
                            }),
                            None => nodes.extend(inner),
                        }
                    }
                }
            }
        }
    }
    nodes
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if let Some(Node::Text(last)) = nodes.last_mut() {
        last.push_str(text);
    } else {
        nodes.push(Node::Text(text.to_string()));
    }
}

/// Concatenated text of a tree, line breaks as `\n`.
pub fn plain_text(nodes: &[Node]) -> String {
    let mut out = String::new();
    collect_text(nodes, &mut out);
    out
}

fn collect_text(nodes: &[Node], out: &mut String) {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Mention { name, .. } => out.push_str(name),
            Node::Link { children, .. } | Node::Styled { children, .. } => {
                collect_text(children, out)
            }
            Node::Quote(quote) => collect_text(&quote.children, out),
            Node::LineBreak => out.push('\n'),
            Node::EditMarker => {}
        }
    }
}
