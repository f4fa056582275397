//! Content conversion between remote markup and home messages.

pub mod codec;

use skylink_shared::{EventId, HomeUserId, PortalKey, RemoteId, RoomId};

use crate::home::{HomeMessage, Relation};
use crate::ids::PuppetIdMapper;
use codec::{escape, Node, QuoteBlock, Style};

const MATRIX_TO: &str = "https://matrix.to/#/";

/// Earlier message quoted by an outbound reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuoteSource {
    pub author: RemoteId,
    pub author_name: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub conversation: String,
    pub message_id: String,
    pub text: String,
}

/// Where a conversion happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomContext {
    pub portal: PortalKey,
    pub room: Option<RoomId>,
    /// Set by the outbound dispatcher when the home message is a reply.
    pub reply: Option<QuoteSource>,
}

impl RoomContext {
    pub fn new(portal: PortalKey, room: Option<RoomId>) -> Self {
        Self {
            portal,
            room,
            reply: None,
        }
    }
}

/// A quote found in inbound remote content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotedMessage {
    pub author: String,
    pub author_name: String,
    pub timestamp: i64,
    pub conversation: String,
    pub message_id: String,
    /// The quoted conversation is the one being converted.
    pub in_conversation: bool,
    pub body: String,
    pub html: String,
}

/// How a quote attaches to the home message built from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuoteTarget {
    /// The quoted message was bridged into this room.
    Reply {
        room: RoomId,
        event: EventId,
        sender: HomeUserId,
    },
    /// Rendered inline without a relation.
    Detached,
}

/// Result of converting remote content for the home side.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HomeMarkup {
    pub body: String,
    /// Set only when the content carries markup a plain body would lose.
    pub formatted_body: Option<String>,
    pub quote: Option<QuotedMessage>,
    /// The remote content carried an edit marker.
    pub edited: bool,
}

impl HomeMarkup {
    /// Build a text message, attaching the quote as a reply or inline block.
    pub fn into_message(self, target: QuoteTarget) -> HomeMessage {
        let html = self
            .formatted_body
            .clone()
            .unwrap_or_else(|| escape(&self.body).replace('\n', "<br>"));

        let Some(quote) = self.quote else {
            let mut message = HomeMessage::text(self.body);
            message.formatted_body = self.formatted_body;
            return message;
        };

        match target {
            QuoteTarget::Reply { room, event, sender } => {
                let mut fallback = String::new();
                for (idx, line) in quote.body.lines().enumerate() {
                    if idx == 0 {
                        fallback.push_str(&format!("> <{sender}> {line}\n"));
                    } else {
                        fallback.push_str(&format!("> {line}\n"));
                    }
                }
                if fallback.is_empty() {
                    fallback.push_str(&format!("> <{sender}>\n"));
                }

                let mut message = HomeMessage::text(format!("{fallback}\n{}", self.body));
                message.formatted_body = Some(format!(
                    "<mx-reply><blockquote><a href=\"{MATRIX_TO}{room}/{event}\">In reply to</a> \
                     <a href=\"{MATRIX_TO}{sender}\">{sender}</a><br>{}</blockquote></mx-reply>{html}",
                    quote.html,
                    sender = escape(sender.as_str()),
                ));
                message.with_relation(Relation::Reply(event))
            }
            QuoteTarget::Detached => {
                let author = if quote.author_name.is_empty() {
                    quote.author.as_str()
                } else {
                    quote.author_name.as_str()
                };
                let quoted: Vec<String> =
                    quote.body.lines().map(|line| format!("> {line}")).collect();
                let mut message = HomeMessage::text(format!(
                    "> {author}:\n{}\n\n{}",
                    quoted.join("\n"),
                    self.body
                ));
                message.formatted_body = Some(format!(
                    "<blockquote><strong>{}</strong><br>{}</blockquote>{html}",
                    escape(author),
                    quote.html
                ));
                message
            }
        }
    }
}

/// Bidirectional content conversion.
pub trait ContentConverter: Send + Sync {
    fn to_home(&self, content: &str, ctx: &RoomContext) -> HomeMarkup;

    fn to_remote(&self, message: &HomeMessage, ctx: &RoomContext) -> String;
}

/// Converter for the remote network's rich text.
#[derive(Debug, Clone)]
pub struct SkypeConverter {
    ids: PuppetIdMapper,
}

impl SkypeConverter {
    pub fn new(ids: PuppetIdMapper) -> Self {
        Self { ids }
    }

    fn render_home(&self, nodes: &[Node], out: &mut HomeRender) {
        for node in nodes {
            match node {
                Node::Text(text) => {
                    out.html.push_str(&escape(text).replace('\n', "<br>"));
                    out.plain.push_str(text);
                }
                Node::LineBreak => {
                    out.html.push_str("<br>");
                    out.plain.push('\n');
                }
                Node::EditMarker => out.edited = true,
                Node::Mention { id, name } => {
                    let label = if name.is_empty() { id.as_str() } else { name.as_str() };
                    match RemoteId::user(id) {
                        Ok(jid) => {
                            let mxid = self.ids.puppet_mxid(&jid);
                            out.html.push_str(&format!(
                                "<a href=\"{MATRIX_TO}{}\">{}</a>",
                                escape(mxid.as_str()),
                                escape(label)
                            ));
                            out.rich = true;
                        }
                        Err(_) => out.html.push_str(&escape(label)),
                    }
                    out.plain.push_str(label);
                }
                Node::Link { href, children } => {
                    out.html.push_str(&format!("<a href=\"{}\">", escape(href)));
                    let before = out.plain.len();
                    self.render_home(children, out);
                    if out.plain.len() == before {
                        out.html.push_str(&escape(href));
                        out.plain.push_str(href);
                    }
                    out.html.push_str("</a>");
                    out.rich = true;
                }
                Node::Styled { style, children } => {
                    let tag = match style {
                        Style::Bold => "strong",
                        Style::Italic => "em",
                        Style::Strike => "del",
                        Style::Code => "code",
                    };
                    out.html.push_str(&format!("<{tag}>"));
                    self.render_home(children, out);
                    out.html.push_str(&format!("</{tag}>"));
                    out.rich = true;
                }
                Node::Quote(quote) if out.quote.is_none() && out.depth == 0 => {
                    out.quote = Some(quote.clone());
                }
                Node::Quote(quote) => {
                    out.depth += 1;
                    self.render_home(&quote.children, out);
                    out.depth -= 1;
                }
            }
        }
    }

    fn render_remote(&self, nodes: &[Node], out: &mut String) {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(&escape(text)),
                Node::LineBreak => out.push('\n'),
                Node::EditMarker => {}
                Node::Mention { id, name } => {
                    out.push_str(&format!("<at id=\"{}\">{}</at>", escape(id), escape(name)));
                }
                Node::Link { href, children } => match href.strip_prefix(MATRIX_TO) {
                    Some(target) => {
                        let label = codec::plain_text(children);
                        let mxid = HomeUserId(decode_matrix_to(target));
                        match self.ids.parse_puppet_mxid(&mxid) {
                            Some(jid) => out.push_str(&format!(
                                "<at id=\"{}\">{}</at>",
                                escape(jid.bare()),
                                escape(&label)
                            )),
                            None => out.push_str(&escape(&label)),
                        }
                    }
                    None => {
                        out.push_str(&format!("<a href=\"{}\">", escape(href)));
                        self.render_remote(children, out);
                        out.push_str("</a>");
                    }
                },
                Node::Styled { style, children } => {
                    let tag = match style {
                        Style::Bold => "b",
                        Style::Italic => "i",
                        Style::Strike => "s",
                        Style::Code => "pre",
                    };
                    out.push_str(&format!("<{tag}>"));
                    self.render_remote(children, out);
                    out.push_str(&format!("</{tag}>"));
                }
                Node::Quote(quote) => self.render_remote(&quote.children, out),
            }
        }
    }
}

#[derive(Default)]
struct HomeRender {
    html: String,
    plain: String,
    rich: bool,
    edited: bool,
    depth: usize,
    quote: Option<QuoteBlock>,
}

impl ContentConverter for SkypeConverter {
    fn to_home(&self, content: &str, ctx: &RoomContext) -> HomeMarkup {
        let nodes = codec::parse(content);
        let mut out = HomeRender::default();
        self.render_home(&nodes, &mut out);

        let quote = out.quote.take().map(|block| {
            let mut inner = HomeRender::default();
            self.render_home(&block.children, &mut inner);
            QuotedMessage {
                in_conversation: block.conversation == ctx.portal.jid.as_str(),
                author: block.author,
                author_name: block.author_name,
                timestamp: block.timestamp,
                conversation: block.conversation,
                message_id: block.message_id,
                body: inner.plain.trim().to_string(),
                html: inner.html.trim().to_string(),
            }
        });

        HomeMarkup {
            body: out.plain.trim().to_string(),
            formatted_body: out.rich.then(|| out.html.trim().to_string()),
            quote,
            edited: out.edited,
        }
    }

    fn to_remote(&self, message: &HomeMessage, ctx: &RoomContext) -> String {
        let mut out = String::new();
        if let Some(reply) = &ctx.reply {
            out.push_str(&quote_block(reply));
        }
        match &message.formatted_body {
            Some(html) => self.render_remote(&codec::parse(html), &mut out),
            None if message.reply_to().is_some() => {
                out.push_str(&escape(strip_reply_fallback(&message.body)))
            }
            None => out.push_str(&escape(&message.body)),
        }
        out
    }
}

/// Plain text of stored remote content, without any quoted message.
pub fn plain_body(content: &str) -> String {
    let nodes: Vec<Node> = codec::parse(content)
        .into_iter()
        .filter(|node| !matches!(node, Node::Quote(_)))
        .collect();
    codec::plain_text(&nodes).trim().to_string()
}

fn quote_block(source: &QuoteSource) -> String {
    let name = escape(&source.author_name);
    format!(
        "<quote author=\"{author}\" authorname=\"{name}\" timestamp=\"{ts}\" \
         conversation=\"{conversation}\" messageid=\"{id}\">\
         <legacyquote>[{ts}] {name}: </legacyquote>{text}\
         <legacyquote>\n\n&lt;&lt;&lt; </legacyquote></quote>",
        author = escape(source.author.bare()),
        ts = source.timestamp,
        conversation = escape(&source.conversation),
        id = escape(&source.message_id),
        text = escape(&source.text),
    )
}

/// Drop the `> ` quoted lines a reply body starts with.
fn strip_reply_fallback(body: &str) -> &str {
    let mut rest = body;
    while rest.starts_with('>') {
        rest = match rest.split_once('\n') {
            Some((_, tail)) => tail,
            None => "",
        };
    }
    rest.strip_prefix('\n').unwrap_or(rest)
}

fn decode_matrix_to(target: &str) -> String {
    target
        .split(['?', '/'])
        .next()
        .unwrap_or_default()
        .replace("%40", "@")
        .replace("%3A", ":")
        .replace("%3a", ":")
}
