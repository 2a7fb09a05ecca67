//! Operator command parsing.

/// A recognised operator command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    /// Raw argument; validated by the dispatcher before admission.
    Scrape(String),
    Stop,
    Status,
    Help,
    Unknown(String),
}

impl Command {
    /// Parse a chat message. Commands are case-insensitive, may omit the
    /// leading slash, and may carry a `@botname` suffix.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let (head, rest) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };
        let name = head.strip_prefix('/').unwrap_or(head);
        let name = name.split('@').next().unwrap_or(name).to_lowercase();

        match name.as_str() {
            "start" => Command::Start,
            "scrape" | "watch" => Command::Scrape(rest.to_string()),
            "stop" | "cancel" => Command::Stop,
            "status" => Command::Status,
            "help" => Command::Help,
            _ => Command::Unknown(head.to_string()),
        }
    }
}

pub const USAGE: &str = "Commands:\n\
/scrape <url> - watch the page until its button[data-link] element is visible\n\
/stop - cancel the running watch\n\
/status - show the running watch";

pub fn greeting() -> String {
    format!(
        "Hi! I watch a page until its target button appears and send you what it says.\n\n{}",
        USAGE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_commands() {
        assert_eq!(Command::parse("/start"), Command::Start);
        assert_eq!(Command::parse("/stop"), Command::Stop);
        assert_eq!(Command::parse("/status"), Command::Status);
        assert_eq!(Command::parse("/help"), Command::Help);
        assert_eq!(
            Command::parse("/scrape https://example.com/x"),
            Command::Scrape("https://example.com/x".into())
        );
    }

    #[test]
    fn test_parse_variants() {
        assert_eq!(Command::parse("  /STOP  "), Command::Stop);
        assert_eq!(Command::parse("stop"), Command::Stop);
        assert_eq!(
            Command::parse("/scrape@pagewatch_bot   https://example.com "),
            Command::Scrape("https://example.com".into())
        );
        assert_eq!(Command::parse("/start@pagewatch_bot"), Command::Start);
        assert_eq!(Command::parse("/scrape"), Command::Scrape(String::new()));
    }

    #[test]
    fn test_parse_unknown() {
        assert_eq!(Command::parse("hello there"), Command::Unknown("hello".into()));
        assert_eq!(Command::parse(""), Command::Unknown(String::new()));
    }

    #[test]
    fn test_greeting_lists_commands() {
        let text = greeting();
        assert!(text.contains("/scrape"));
        assert!(text.contains("/stop"));
    }
}
