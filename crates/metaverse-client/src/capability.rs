//! Capability registry and typed HTTP capability clients.
//!
//! Capabilities are named HTTP endpoints a simulator grants through its
//! seed URL: the client POSTs the list of capability names it understands
//! and receives a `name -> url` map back. Each granted name becomes a
//! typed client over that URL. Every call POSTs `application/llsd+xml`
//! and parses an LLSD reply.
//!
//! The registry is a static name -> constructor table built before login;
//! new capabilities extend the table, and a simulator only materialises
//! names that are registered.

use std::collections::HashMap;

use metaverse_llsd::Value;
use reqwest::StatusCode;
use tracing::debug;
use uuid::Uuid;

use crate::error::CapabilityError;

/// MIME type for every capability call.
const LLSD_CONTENT_TYPE: &str = "application/llsd+xml";

/// Server-side event-queue polls block up to ~30 s; twice that is more
/// than enough before the client gives up on a poll.
const EVENT_QUEUE_POLL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// Constructor for a typed capability client.
pub type CapabilityCtor = fn(String, reqwest::Client) -> Capability;

/// Name -> constructor table.
///
/// Effectively a process constant: built once before login and shared
/// read-only by every simulator.
#[derive(Clone)]
pub struct CapabilityRegistry {
    entries: HashMap<&'static str, CapabilityCtor>,
}

impl CapabilityRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    /// The standard table: every capability this crate implements.
    #[must_use]
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register("ChatSessionRequest", |url, http| {
            Capability::ChatSession(ChatSessionRequest { url, http })
        });
        registry.register("EventQueueGet", |url, http| {
            Capability::EventQueue(EventQueueGet { url, http })
        });
        registry
    }

    /// Add a capability constructor under its wire name.
    pub fn register(&mut self, name: &'static str, ctor: CapabilityCtor) {
        self.entries.insert(name, ctor);
    }

    /// Whether `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered capability names, for the seed request.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.entries.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Construct the typed client for a granted capability, if its name
    /// is registered.
    #[must_use]
    pub fn instantiate(&self, name: &str, url: &str, http: &reqwest::Client) -> Option<Capability> {
        self.entries.get(name).map(|ctor| ctor(url.to_owned(), http.clone()))
    }
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityRegistry").field("names", &self.names()).finish()
    }
}

/// A granted, typed capability client.
#[derive(Debug, Clone)]
pub enum Capability {
    /// The event-queue long-poll endpoint.
    EventQueue(EventQueueGet),
    /// Group/IM chat session operations.
    ChatSession(ChatSessionRequest),
}

impl Capability {
    /// Borrow as the event-queue client.
    #[must_use]
    pub fn as_event_queue(&self) -> Option<&EventQueueGet> {
        match self {
            Self::EventQueue(cap) => Some(cap),
            Self::ChatSession(_) => None,
        }
    }

    /// Borrow as the chat-session client.
    #[must_use]
    pub fn as_chat_session(&self) -> Option<&ChatSessionRequest> {
        match self {
            Self::ChatSession(cap) => Some(cap),
            Self::EventQueue(_) => None,
        }
    }
}

/// POST an LLSD body and return the raw response.
async fn post_llsd(
    http: &reqwest::Client,
    url: &str,
    body: &Value,
    timeout: Option<std::time::Duration>,
) -> Result<reqwest::Response, reqwest::Error> {
    let mut request = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, LLSD_CONTENT_TYPE)
        .body(metaverse_llsd::to_xml(body));
    if let Some(timeout) = timeout {
        request = request.timeout(timeout);
    }
    request.send().await
}

/// The bootstrap capability: exchanges the wanted-names list for the
/// granted `name -> url` map.
#[derive(Debug, Clone)]
pub struct SeedCapability {
    url: String,
    http: reqwest::Client,
}

impl SeedCapability {
    /// Wrap a seed URL.
    #[must_use]
    pub fn new(url: impl Into<String>, http: reqwest::Client) -> Self {
        Self { url: url.into(), http }
    }

    /// Fetch the grant map and instantiate every registered capability
    /// present in it.
    pub async fn fetch(
        &self,
        registry: &CapabilityRegistry,
    ) -> Result<HashMap<String, Capability>, CapabilityError> {
        let request =
            Value::Array(registry.names().into_iter().map(Value::from).collect());
        let response = post_llsd(&self.http, &self.url, &request, None).await?;
        if response.status() != StatusCode::OK {
            return Err(CapabilityError::Status(response.status().as_u16()));
        }

        let reply = metaverse_llsd::from_xml(&response.text().await?)?;
        let granted = reply.as_map().ok_or(CapabilityError::Shape("seed reply is not a map"))?;

        let mut capabilities = HashMap::new();
        for (name, url) in granted {
            let Some(url) = url.as_str() else { continue };
            if let Some(capability) = registry.instantiate(name, url, &self.http) {
                debug!(name, "capability granted");
                capabilities.insert(name.clone(), capability);
            }
        }
        Ok(capabilities)
    }
}

/// One event-queue poll outcome.
#[derive(Debug, Clone)]
pub enum QueuePoll {
    /// Events arrived; `ack` is the id to present on the next poll.
    Events {
        /// Next acknowledgement id.
        ack: i32,
        /// Events in server order.
        events: Vec<QueueEvent>,
    },
    /// The queue is gone (HTTP 404); polling must stop.
    Terminal,
    /// Transient failure; poll again with the same ack.
    Retry,
}

/// One event delivered by the queue.
#[derive(Debug, Clone)]
pub struct QueueEvent {
    /// Event message name (`TeleportFinish`, `EnableSimulator`, ...).
    pub name: String,
    /// Structured event body.
    pub body: Value,
}

/// Typed client for the `EventQueueGet` long-poll endpoint.
#[derive(Debug, Clone)]
pub struct EventQueueGet {
    url: String,
    http: reqwest::Client,
}

impl EventQueueGet {
    /// One long poll.
    ///
    /// `ack` acknowledges the previous reply's id (0 on the first poll);
    /// `done` tells the server the client is going away. Transport errors
    /// and unexpected statuses map to [`QueuePoll::Retry`] - the caller
    /// keeps its ack and tries again.
    pub async fn poll(&self, ack: i32, done: bool) -> QueuePoll {
        let request: Value =
            [("ack", Value::Integer(ack)), ("done", Value::Boolean(done))].into_iter().collect();

        let response =
            match post_llsd(&self.http, &self.url, &request, Some(EVENT_QUEUE_POLL_TIMEOUT)).await {
                Ok(response) => response,
                Err(err) => {
                    debug!(%err, "event queue poll failed");
                    return QueuePoll::Retry;
                }
            };

        match response.status() {
            StatusCode::NOT_FOUND => QueuePoll::Terminal,
            StatusCode::OK => match Self::parse_events(response.text().await.ok()) {
                Some(poll) => poll,
                None => QueuePoll::Retry,
            },
            _ => QueuePoll::Retry,
        }
    }

    fn parse_events(text: Option<String>) -> Option<QueuePoll> {
        let reply = metaverse_llsd::from_xml(&text?).ok()?;
        let ack = reply.get("id")?.as_integer()?;
        let events = reply
            .get("events")?
            .as_array()?
            .iter()
            .filter_map(|event| {
                Some(QueueEvent {
                    name: event.get("message")?.as_str()?.to_owned(),
                    body: event.get("body").cloned().unwrap_or_default(),
                })
            })
            .collect();
        Some(QueuePoll::Events { ack, events })
    }
}

/// Typed client for the `ChatSessionRequest` capability.
#[derive(Debug, Clone)]
pub struct ChatSessionRequest {
    url: String,
    http: reqwest::Client,
}

impl ChatSessionRequest {
    /// Accept a chat session invitation. `false` on any non-200 reply.
    pub async fn accept_invitation(&self, session_id: Uuid) -> Result<bool, CapabilityError> {
        let request: Value = [
            ("method", Value::from("accept invitation")),
            ("session-id", Value::Uuid(session_id)),
        ]
        .into_iter()
        .collect();
        let response = post_llsd(&self.http, &self.url, &request, None).await?;
        Ok(response.status() == StatusCode::OK)
    }

    /// Fetch session history. Empty on any non-200 reply.
    pub async fn fetch_history(&self, session_id: Uuid) -> Result<Vec<Value>, CapabilityError> {
        let request: Value = [
            ("method", Value::from("fetch history")),
            ("session-id", Value::Uuid(session_id)),
        ]
        .into_iter()
        .collect();
        let response = post_llsd(&self.http, &self.url, &request, None).await?;
        if response.status() != StatusCode::OK {
            return Ok(Vec::new());
        }
        let reply = metaverse_llsd::from_xml(&response.text().await?)?;
        match reply {
            Value::Array(items) => Ok(items),
            _ => Err(CapabilityError::Shape("history reply is not an array")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_names_are_sorted() {
        let registry = CapabilityRegistry::standard();
        assert_eq!(registry.names(), vec!["ChatSessionRequest", "EventQueueGet"]);
    }

    #[test]
    fn instantiate_requires_registration() {
        let registry = CapabilityRegistry::standard();
        let http = reqwest::Client::new();
        assert!(registry.instantiate("EventQueueGet", "http://x/", &http).is_some());
        assert!(registry.instantiate("VoiceSignalingRequest", "http://x/", &http).is_none());
    }

    #[test]
    fn registry_extends_with_new_names() {
        let mut registry = CapabilityRegistry::standard();
        registry.register("FutureCapability", |url, http| {
            Capability::ChatSession(ChatSessionRequest { url, http })
        });
        assert!(registry.contains("FutureCapability"));
        assert_eq!(registry.names().len(), 3);
    }

    #[test]
    fn typed_accessors_discriminate() {
        let http = reqwest::Client::new();
        let registry = CapabilityRegistry::standard();
        let cap = registry.instantiate("EventQueueGet", "http://x/", &http).unwrap();
        assert!(cap.as_event_queue().is_some());
        assert!(cap.as_chat_session().is_none());
    }
}
