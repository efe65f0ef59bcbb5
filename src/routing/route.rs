//! Route grammar and the immutable route table
//!
//! `FROM <source> [WHERE <condition>] INTO <endpoint>[, <endpoint>...]`

use super::condition::Condition;
use super::endpoint::{EndpointId, UPSTREAM};
use crate::error::{HubError, HubResult};
use crate::message::{system_property, Message};
use std::collections::HashSet;
use std::fmt;

/// Application property that marks twin change notifications
pub const MESSAGE_SCHEMA_PROPERTY: &str = "iothub-message-schema";
pub const TWIN_CHANGE_NOTIFICATION: &str = "twinChangeNotification";

/// Which messages a route listens to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSource {
    /// `/*`
    All,
    /// `/messages/*`
    AllMessages,
    /// `/messages/modules/*`
    AllModules,
    /// `/messages/modules/<m>/*`
    Module(String),
    /// `/messages/modules/<m>/outputs/*`
    ModuleOutputs(String),
    /// `/messages/modules/<m>/outputs/<o>`
    ModuleOutput { module_id: String, output: String },
    /// `/twinChangeNotifications`
    TwinChangeNotifications,
}

fn is_twin_change_notification(message: &Message) -> bool {
    message.property(MESSAGE_SCHEMA_PROPERTY) == Some(TWIN_CHANGE_NOTIFICATION)
}

impl RouteSource {
    pub fn parse(source: &str) -> Option<Self> {
        let source = source.trim();
        if source == "/*" {
            return Some(RouteSource::All);
        }
        if source.eq_ignore_ascii_case("/twinChangeNotifications") {
            return Some(RouteSource::TwinChangeNotifications);
        }
        if source == "/messages/*" {
            return Some(RouteSource::AllMessages);
        }

        let rest = source.strip_prefix("/messages/modules/")?;
        let segments: Vec<&str> = rest.split('/').collect();
        let name = |s: &str| !s.is_empty() && s != "*";
        match segments.as_slice() {
            ["*"] => Some(RouteSource::AllModules),
            [module, "*"] if name(module) => Some(RouteSource::Module(module.to_string())),
            [module, "outputs", "*"] if name(module) => {
                Some(RouteSource::ModuleOutputs(module.to_string()))
            }
            [module, "outputs", output] if name(module) && name(output) => {
                Some(RouteSource::ModuleOutput {
                    module_id: module.to_string(),
                    output: output.to_string(),
                })
            }
            _ => None,
        }
    }

    pub fn matches(&self, message: &Message) -> bool {
        let twin_notification = is_twin_change_notification(message);
        let module = message.origin().module_id();
        let output = message.system_property(system_property::OUTPUT_NAME);
        match self {
            RouteSource::All => true,
            RouteSource::TwinChangeNotifications => twin_notification,
            _ if twin_notification => false,
            RouteSource::AllMessages => true,
            RouteSource::AllModules => module.is_some(),
            RouteSource::Module(m) => module == Some(m.as_str()),
            RouteSource::ModuleOutputs(m) => module == Some(m.as_str()) && output.is_some(),
            RouteSource::ModuleOutput { module_id, output: o } => {
                module == Some(module_id.as_str()) && output == Some(o.as_str())
            }
        }
    }
}

impl fmt::Display for RouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteSource::All => f.write_str("/*"),
            RouteSource::AllMessages => f.write_str("/messages/*"),
            RouteSource::AllModules => f.write_str("/messages/modules/*"),
            RouteSource::Module(m) => write!(f, "/messages/modules/{m}/*"),
            RouteSource::ModuleOutputs(m) => write!(f, "/messages/modules/{m}/outputs/*"),
            RouteSource::ModuleOutput { module_id, output } => {
                write!(f, "/messages/modules/{module_id}/outputs/{output}")
            }
            RouteSource::TwinChangeNotifications => f.write_str("/twinChangeNotifications"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub name: String,
    pub source: RouteSource,
    pub condition: Option<Condition>,
    pub endpoints: Vec<EndpointId>,
    text: String,
}

impl Route {
    pub fn parse(name: &str, text: &str) -> HubResult<Self> {
        let invalid = |message: &str| HubError::invalid_route(name, message);

        let trimmed = text.trim();
        let body = strip_keyword(trimmed, "FROM").ok_or_else(|| invalid("route must start with FROM"))?;
        let into = find_keyword(body, "INTO").ok_or_else(|| invalid("missing INTO clause"))?;
        let (head, targets) = (&body[..into], &body[into + "INTO".len()..]);

        let (source_text, condition) = match find_keyword(head, "WHERE") {
            Some(pos) => {
                let condition_text = head[pos + "WHERE".len()..].trim();
                if condition_text.is_empty() {
                    return Err(invalid("empty WHERE condition"));
                }
                let condition = Condition::parse(condition_text)
                    .map_err(|e| invalid(&format!("invalid condition: {e}")))?;
                (&head[..pos], Some(condition))
            }
            None => (head, None),
        };

        let source_text = source_text.trim();
        let source = RouteSource::parse(source_text)
            .ok_or_else(|| invalid(&format!("unknown source '{source_text}'")))?;

        let mut endpoints = Vec::new();
        for target in split_top_level(targets) {
            let endpoint = parse_endpoint(target.trim()).map_err(|e| invalid(&e))?;
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        if endpoints.is_empty() {
            return Err(invalid("INTO names no endpoint"));
        }

        Ok(Self {
            name: name.to_string(),
            source,
            condition,
            endpoints,
            text: trimmed.to_string(),
        })
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.source.matches(message)
            && self
                .condition
                .as_ref()
                .map_or(true, |condition| condition.evaluate(message))
    }

    /// The route as written in configuration
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.text)
    }
}

fn parse_endpoint(target: &str) -> Result<EndpointId, String> {
    if target.is_empty() {
        return Err("empty endpoint".to_string());
    }
    if target.eq_ignore_ascii_case(UPSTREAM) {
        return Ok(EndpointId::Upstream);
    }
    if let Some(name) = target.strip_prefix('$') {
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        return if valid {
            Ok(EndpointId::System(name.to_string()))
        } else {
            Err(format!("invalid system endpoint '{target}'"))
        };
    }

    let open = target
        .find('(')
        .ok_or_else(|| format!("unknown endpoint '{target}'"))?;
    if !target[..open].trim().eq_ignore_ascii_case("BrokeredEndpoint") || !target.ends_with(')') {
        return Err(format!("unknown endpoint '{target}'"));
    }
    let argument = target[open + 1..target.len() - 1].trim();
    let address = unquote(argument).ok_or_else(|| format!("endpoint address must be quoted in '{target}'"))?;
    EndpointId::parse_module_input(address)
        .ok_or_else(|| format!("invalid module input address '{address}'"))
}

fn unquote(value: &str) -> Option<&str> {
    let first = value.chars().next()?;
    if (first == '"' || first == '\'') && value.len() >= 2 && value.ends_with(first) {
        Some(&value[1..value.len() - 1])
    } else {
        None
    }
}

/// Strip a leading keyword followed by whitespace
fn strip_keyword<'a>(text: &'a str, keyword: &str) -> Option<&'a str> {
    let head = text.get(..keyword.len())?;
    let rest = &text[keyword.len()..];
    if head.eq_ignore_ascii_case(keyword) && rest.starts_with(char::is_whitespace) {
        Some(rest)
    } else {
        None
    }
}

/// Byte offset of the first standalone `keyword` outside quotes
fn find_keyword(text: &str, keyword: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(q) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None if b == b'\'' || b == b'"' => quote = Some(b),
            None => {
                let boundary_before = i == 0 || bytes[i - 1].is_ascii_whitespace() || bytes[i - 1] == b')';
                let end = i + keyword.len();
                if boundary_before
                    && end <= bytes.len()
                    && text.is_char_boundary(end)
                    && text[i..end].eq_ignore_ascii_case(keyword)
                    && (end == bytes.len() || bytes[end].is_ascii_whitespace() || bytes[end] == b'(')
                {
                    return Some(i);
                }
            }
        }
        i += 1;
    }
    None
}

/// Split on commas that are outside quotes and parentheses
fn split_top_level(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '(' => depth += 1,
                ')' => depth = depth.saturating_sub(1),
                ',' if depth == 0 => {
                    parts.push(&text[start..i]);
                    start = i + 1;
                }
                _ => {}
            },
        }
    }
    parts.push(&text[start..]);
    parts
}

/// Result of evaluating the table against one message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteMatch {
    /// Names of the matching routes, in table order
    pub routes: Vec<String>,
    /// Destinations without duplicates, in first-match order
    pub endpoints: Vec<EndpointId>,
}

impl RouteMatch {
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// Ordered, immutable set of routes
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse `(name, route)` pairs; names must be unique
    pub fn parse<'a, I>(entries: I) -> HubResult<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut names = HashSet::new();
        let mut routes = Vec::new();
        for (name, text) in entries {
            if name.trim().is_empty() {
                return Err(HubError::invalid_route(text, "route name must not be empty"));
            }
            if !names.insert(name) {
                return Err(HubError::invalid_route(name, "duplicate route name"));
            }
            routes.push(Route::parse(name, text)?);
        }
        Ok(Self { routes })
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }

    pub fn destinations(&self, message: &Message) -> RouteMatch {
        let mut matched = RouteMatch::default();
        for route in self.routes.iter().filter(|route| route.matches(message)) {
            matched.routes.push(route.name.clone());
            for endpoint in &route.endpoints {
                if !matched.endpoints.contains(endpoint) {
                    matched.endpoints.push(endpoint.clone());
                }
            }
        }
        matched
    }
}
