//! Topic naming: `nachos.<domain>.<name>.<direction>`.
//!
//! Patterns use NATS wildcards: `*` matches one segment, a trailing `>`
//! matches one or more remaining segments.

pub const PREFIX: &str = "nachos";

pub const LLM_REQUEST: &str = "nachos.llm.proxy.request";
pub const LLM_RESPONSE: &str = "nachos.llm.proxy.response";

/// Every channel's inbound traffic.
pub const ALL_CHANNELS_INBOUND: &str = "nachos.channel.*.inbound";

pub fn channel_inbound(channel: &str) -> String {
    format!("{PREFIX}.channel.{channel}.inbound")
}

pub fn channel_outbound(channel: &str) -> String {
    format!("{PREFIX}.channel.{channel}.outbound")
}

pub fn tool_request(tool: &str) -> String {
    format!("{PREFIX}.tool.{tool}.request")
}

pub fn tool_response(tool: &str) -> String {
    format!("{PREFIX}.tool.{tool}.response")
}

/// A concrete topic split into its parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topic<'a> {
    pub domain: &'a str,
    pub name: &'a str,
    pub direction: &'a str,
}

/// Split a topic following the naming convention. `None` for anything else.
pub fn parse(topic: &str) -> Option<Topic<'_>> {
    let mut parts = topic.split('.');
    let (Some(PREFIX), Some(domain), Some(name), Some(direction), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };
    if [domain, name, direction].iter().any(|s| s.is_empty()) {
        return None;
    }
    Some(Topic {
        domain,
        name,
        direction,
    })
}

/// Topics that can be published to: non-empty segments and no wildcards.
pub fn is_concrete(topic: &str) -> bool {
    !topic.is_empty()
        && topic
            .split('.')
            .all(|s| !s.is_empty() && s != "*" && s != ">")
}

pub fn matches(pattern: &str, topic: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut topic = topic.split('.');
    loop {
        match (pattern.next(), topic.next()) {
            (Some(">"), Some(_)) => return pattern.next().is_none(),
            (Some("*"), Some(_)) => {},
            (Some(p), Some(t)) if p == t => {},
            (None, None) => return true,
            _ => return false,
        }
    }
}
