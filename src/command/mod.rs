//! Command mail handling: classify an inbound message, apply it to the
//! subscriber registry and build the single reply it earns.

pub mod address;
pub mod urls;

pub use address::{AddressError, SubscriberAddress};
pub use urls::{extract_urls, validate_feed_url, UrlError};

use url::Url;

use crate::storage::{Registry, Subscriptions};
use crate::util::escape_html;

/// First word of every command subject.
pub const COMMAND_KEYWORD: &str = "rss-email";

pub const SUBJECT_SUBSCRIBED: &str = "[rss-email] successfully subscribe";
pub const SUBJECT_SUBSCRIBE_FAILED: &str = "[rss-email] unsuccessfully subscribe";
pub const SUBJECT_LIST: &str = "[rss-email] list command response";
pub const SUBJECT_UNSUBSCRIBED: &str = "[rss-email] successfully unsubscribe";
pub const SUBJECT_NOT_SUBSCRIBED: &str = "[rss-email] you haven't subscribed yet.";
pub const SUBJECT_HELP: &str = "[rss-email] unrecognized command";
pub const SUBJECT_DIGEST: &str = "[rss-email] feed";

const BODY_NO_VALID_URLS: &str = "no valid RSS urls";
const BODY_NOT_SUBSCRIBED: &str = "you haven't subscribed yet.";
const BODY_HELP: &str = "<p>Usage:</p>\n\
<p>Email subject: rss-email [COMMAND]</p>\n\
<p>COMMAND is one of : subscribe, list, unsubscribe</p>\n\
<p>For subscribe, put one feed URL per line in the message body.</p>\n";

/// What an inbound message asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Replace the sender's feeds. Never empty.
    Subscribe(Vec<Url>),
    /// Subscribe verb whose body held no acceptable URL
    SubscribeWithoutUrls,
    List,
    Unsubscribe,
    Unrecognized,
}

/// Classify a message by its subject, reading the body only for subscribe.
///
/// The subject is split on its first space. The first part must be exactly
/// [`COMMAND_KEYWORD`]; the trimmed remainder is the verb.
pub fn classify(subject: &str, body: &str) -> Command {
    let subject = subject.trim();
    let (keyword, verb) = subject.split_once(' ').unwrap_or((subject, ""));

    if keyword != COMMAND_KEYWORD {
        return Command::Unrecognized;
    }

    match verb.trim() {
        "subscribe" => {
            let urls = extract_urls(body);
            if urls.is_empty() {
                Command::SubscribeWithoutUrls
            } else {
                Command::Subscribe(urls)
            }
        }
        "list" => Command::List,
        "unsubscribe" => Command::Unsubscribe,
        _ => Command::Unrecognized,
    }
}

/// Subject and HTML body of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub subject: &'static str,
    pub html_body: String,
}

impl Reply {
    fn new(subject: &'static str, html_body: impl Into<String>) -> Self {
        Self {
            subject,
            html_body: html_body.into(),
        }
    }

    pub fn help() -> Self {
        Self::new(SUBJECT_HELP, BODY_HELP)
    }

    pub fn not_subscribed() -> Self {
        Self::new(SUBJECT_NOT_SUBSCRIBED, BODY_NOT_SUBSCRIBED)
    }
}

/// Result of applying one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub reply: Reply,
    /// Feed URLs a successful subscribe just stored. The feed cache has to
    /// learn about them before the next digest pass.
    pub subscribed: Option<Vec<String>>,
    /// Whether the registry changed and needs flushing
    pub mutated: bool,
}

impl Execution {
    fn reply_only(reply: Reply) -> Self {
        Self {
            reply,
            subscribed: None,
            mutated: false,
        }
    }
}

/// Apply `command` from `sender` to `registry`.
///
/// # Behavior
///
/// - `Subscribe` replaces the sender's whole set, each feed with a fresh
///   watermark, and replies with the new list
/// - `List` and `Unsubscribe` from an unknown sender get the "not
///   subscribed" notice and nothing else
/// - Anything unrecognized gets the help text and leaves the registry alone
pub fn execute(registry: &mut Registry, sender: &SubscriberAddress, command: Command) -> Execution {
    let address = sender.as_str();

    match command {
        Command::Subscribe(urls) => {
            let urls: Vec<String> = urls.into_iter().map(String::from).collect();
            let Some(stored) = registry.upsert(address, urls.iter().cloned()) else {
                return Execution::reply_only(Reply::new(SUBJECT_SUBSCRIBE_FAILED, BODY_NO_VALID_URLS));
            };
            tracing::info!(from = %address, feeds = stored.len(), "Subscription replaced");

            Execution {
                reply: Reply::new(SUBJECT_SUBSCRIBED, render_subscriptions(stored)),
                subscribed: Some(urls),
                mutated: true,
            }
        }
        Command::SubscribeWithoutUrls => {
            tracing::info!(from = %address, "Subscribe command without valid URLs");
            Execution::reply_only(Reply::new(SUBJECT_SUBSCRIBE_FAILED, BODY_NO_VALID_URLS))
        }
        Command::List => match registry.list(address) {
            Some(subscriptions) => {
                Execution::reply_only(Reply::new(SUBJECT_LIST, render_subscriptions(subscriptions)))
            }
            None => Execution::reply_only(Reply::not_subscribed()),
        },
        Command::Unsubscribe => {
            if registry.remove(address) {
                tracing::info!(from = %address, "Unsubscribed");
                Execution {
                    reply: Reply::new(SUBJECT_UNSUBSCRIBED, ""),
                    subscribed: None,
                    mutated: true,
                }
            } else {
                Execution::reply_only(Reply::not_subscribed())
            }
        }
        Command::Unrecognized => Execution::reply_only(Reply::help()),
    }
}

/// The count-and-list body shared by the subscribe and list replies.
pub fn render_subscriptions(subscriptions: &Subscriptions) -> String {
    let mut html = format!(
        "<div>your subscribed RSS count: {}</div><br><div>subscribed RSS url list:</div>",
        subscriptions.len()
    );
    for url in subscriptions.keys() {
        html.push_str("<div>");
        html.push_str(&escape_html(url));
        html.push_str("</div>");
    }
    html
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sender(raw: &str) -> SubscriberAddress {
        SubscriberAddress::parse(raw).unwrap()
    }

    #[test]
    fn test_classify_verbs() {
        assert_eq!(classify("rss-email list", ""), Command::List);
        assert_eq!(classify("rss-email unsubscribe", ""), Command::Unsubscribe);
        assert_eq!(classify("  rss-email   list ", ""), Command::List);
        assert_eq!(classify("rss-email bogus", ""), Command::Unrecognized);
        assert_eq!(classify("rss-email", ""), Command::Unrecognized);
        assert_eq!(classify("RSS-EMAIL list", ""), Command::Unrecognized);
        assert_eq!(classify("hello there", ""), Command::Unrecognized);
        assert_eq!(classify("", ""), Command::Unrecognized);
    }

    #[test]
    fn test_classify_subscribe_reads_body() {
        let body = "https://example.com/feed.xml\nhttps://example.org/atom";
        match classify("rss-email subscribe", body) {
            Command::Subscribe(urls) => assert_eq!(urls.len(), 2),
            other => panic!("expected subscribe, got {other:?}"),
        }
        assert_eq!(
            classify("rss-email subscribe", "no links here"),
            Command::SubscribeWithoutUrls
        );
    }

    #[test]
    fn test_subscribe_scenario() {
        let mut registry = Registry::default();
        let from = sender("a@example.com");
        let command = classify(
            "rss-email subscribe",
            "https://example.com/feed.xml\nhttps://example.org/atom\n",
        );

        let execution = execute(&mut registry, &from, command);

        assert_eq!(execution.reply.subject, SUBJECT_SUBSCRIBED);
        assert_eq!(
            execution.reply.html_body,
            "<div>your subscribed RSS count: 2</div><br><div>subscribed RSS url list:</div>\
             <div>https://example.com/feed.xml</div><div>https://example.org/atom</div>"
        );
        assert_eq!(
            execution.subscribed,
            Some(vec![
                "https://example.com/feed.xml".to_string(),
                "https://example.org/atom".to_string(),
            ])
        );
        assert!(execution.mutated);

        let subs = registry.list("a@example.com").unwrap();
        assert!(subs.values().all(|s| s.last_sent_hash.is_none()));
    }

    #[test]
    fn test_subscribe_replaces_existing_set() {
        let mut registry = Registry::default();
        let from = sender("a@example.com");
        execute(
            &mut registry,
            &from,
            classify("rss-email subscribe", "https://one.example.com/feed"),
        );
        execute(
            &mut registry,
            &from,
            classify("rss-email subscribe", "https://two.example.com/feed"),
        );

        let urls: Vec<&String> = registry.list("a@example.com").unwrap().keys().collect();
        assert_eq!(urls, vec!["https://two.example.com/feed"]);
    }

    #[test]
    fn test_subscribe_without_urls_leaves_registry_alone() {
        let mut registry = Registry::default();
        let execution = execute(
            &mut registry,
            &sender("a@example.com"),
            Command::SubscribeWithoutUrls,
        );
        assert_eq!(execution.reply.subject, SUBJECT_SUBSCRIBE_FAILED);
        assert_eq!(execution.reply.html_body, "no valid RSS urls");
        assert!(!execution.mutated);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unrecognized_gets_help_without_mutation() {
        let mut registry = Registry::default();
        registry.upsert("a@example.com", vec!["https://one.example.com/feed".to_string()]);
        let before = registry.clone();

        let execution = execute(
            &mut registry,
            &sender("a@example.com"),
            classify("rss-email bogus", "https://two.example.com/feed"),
        );

        assert_eq!(execution.reply, Reply::help());
        assert!(execution.reply.html_body.contains("COMMAND is one of : subscribe, list, unsubscribe"));
        assert_eq!(registry, before);
    }

    #[test]
    fn test_unsubscribe_unknown_sender_gets_one_notice() {
        let mut registry = Registry::default();
        let execution = execute(&mut registry, &sender("nobody@example.com"), Command::Unsubscribe);
        assert_eq!(execution.reply, Reply::not_subscribed());
        assert!(!execution.mutated);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unsubscribe_removes_sender() {
        let mut registry = Registry::default();
        registry.upsert("a@example.com", vec!["https://one.example.com/feed".to_string()]);

        let execution = execute(&mut registry, &sender("a@example.com"), Command::Unsubscribe);
        assert_eq!(execution.reply.subject, SUBJECT_UNSUBSCRIBED);
        assert!(execution.mutated);
        assert!(registry.list("a@example.com").is_none());
    }

    #[test]
    fn test_list_known_and_unknown() {
        let mut registry = Registry::default();
        registry.upsert("a@example.com", vec!["https://one.example.com/feed?a=1&b=2".to_string()]);

        let known = execute(&mut registry, &sender("a@example.com"), Command::List);
        assert_eq!(known.reply.subject, SUBJECT_LIST);
        assert!(known
            .reply
            .html_body
            .contains("<div>https://one.example.com/feed?a=1&amp;b=2</div>"));

        let unknown = execute(&mut registry, &sender("b@example.com"), Command::List);
        assert_eq!(unknown.reply, Reply::not_subscribed());
    }
}
