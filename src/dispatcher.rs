//! Predicate-based routing of incoming requests to handlers.
//!
//! A dispatcher holds an ordered list of (predicate, handler) rules and an
//! optional parent. Rules are tried in registration order; the first
//! predicate matching the request's properties wins. If no rule matches,
//! the parent chain is consulted; if the chain is exhausted, the
//! connection's default receive handler applies.
//!
//! Predicates are arbitrary boolean functions over the property mapping.
//! The common case, equality on the `Profile` property, has a shorthand.
//!
//! # Example
//!
//! ```
//! use framewire::dispatcher::{Dispatcher, Outcome};
//! use framewire::Response;
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.add_profile_rule("ping", |_request, ctx| async move {
//!     ctx.respond(Response::with_body(b"pong".to_vec())).await?;
//!     Ok(Outcome::Responded)
//! });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::message::{IncomingRequest, ReplyContext};
use crate::properties::{self, Properties};
use crate::Result;

/// Boxed future returned by handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a handler did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A response was sent through the reply context.
    Responded,
    /// The handler kept a clone of the reply context and will respond
    /// later; the framework must not send the implicit default response.
    Deferred,
    /// The handler did not respond; the framework sends an implicit empty
    /// success response.
    Unhandled,
}

/// Result type for handler functions. An `Err` becomes a 501 error
/// response to the peer.
pub type HandlerResult = Result<Outcome>;

/// A boxed, shareable request handler.
pub type Handler =
    Arc<dyn Fn(IncomingRequest, ReplyContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Box a closure returning a future into a [`Handler`].
pub fn into_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(IncomingRequest, ReplyContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |request, ctx| Box::pin(f(request, ctx)))
}

/// A predicate over a request's properties.
pub type Predicate = Box<dyn Fn(&Properties) -> bool + Send + Sync>;

/// Identifier of a registered rule, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuleId(u64);

struct Rule {
    id: RuleId,
    predicate: Predicate,
    handler: Handler,
}

/// Ordered (predicate, handler) rule list with an optional parent chain.
#[derive(Default)]
pub struct Dispatcher {
    rules: RwLock<Vec<Rule>>,
    parent: Option<Arc<Dispatcher>>,
    next_rule_id: AtomicU64,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a dispatcher that falls back to `parent` when none of its own
    /// rules match.
    pub fn with_parent(parent: Arc<Dispatcher>) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            parent: Some(parent),
            next_rule_id: AtomicU64::new(0),
        }
    }

    /// Register a rule. Rules are evaluated in registration order; the
    /// first match wins.
    pub fn add_rule<P, F, Fut>(&self, predicate: P, handler: F) -> RuleId
    where
        P: Fn(&Properties) -> bool + Send + Sync + 'static,
        F: Fn(IncomingRequest, ReplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let id = RuleId(self.next_rule_id.fetch_add(1, Ordering::Relaxed));
        self.rules.write().unwrap().push(Rule {
            id,
            predicate: Box::new(predicate),
            handler: into_handler(handler),
        });
        id
    }

    /// Register a rule matching requests whose `Profile` property equals
    /// `profile`.
    pub fn add_profile_rule<F, Fut>(&self, profile: &str, handler: F) -> RuleId
    where
        F: Fn(IncomingRequest, ReplyContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let profile = profile.to_string();
        self.add_rule(
            move |props| props.get(properties::PROFILE) == Some(profile.as_str()),
            handler,
        )
    }

    /// Remove a rule. Returns `false` if it was already gone.
    pub fn remove_rule(&self, id: RuleId) -> bool {
        let mut rules = self.rules.write().unwrap();
        let before = rules.len();
        rules.retain(|rule| rule.id != id);
        rules.len() != before
    }

    /// Find the handler for a request, walking the parent chain.
    pub fn resolve(&self, props: &Properties) -> Option<Handler> {
        {
            let rules = self.rules.read().unwrap();
            for rule in rules.iter() {
                if (rule.predicate)(props) {
                    return Some(rule.handler.clone());
                }
            }
        }
        self.parent.as_ref().and_then(|parent| parent.resolve(props))
    }
}
