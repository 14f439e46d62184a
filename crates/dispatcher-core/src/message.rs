//! The view of a SIP message the dispatcher works with
//!
//! Parsing and transaction handling live outside this crate. The dispatcher
//! only needs a few header values to build hash keys, a handful of mutators to
//! apply the selected destination, and a per-message slot for its own
//! bookkeeping ([`DispatchState`]).

use std::collections::HashMap;

use crate::error::Result;
use crate::select::failover::{FailoverEntry, FailoverStack};
use crate::types::{SetId, SocketSpec};

/// Per-message dispatcher bookkeeping, created by selection and consumed by
/// failover, marking and load updates of the same message.
#[derive(Debug, Clone, Default)]
pub struct DispatchState {
    /// Group the destination was selected from
    pub group: Option<SetId>,
    /// Number of destinations recorded (current + alternates)
    pub count: usize,
    /// Destination currently applied to the message
    pub current: Option<FailoverEntry>,
    /// Alternates still to try, popped by failover
    pub failover: FailoverStack,
    /// The call is accounted in the call-load tracker
    pub load_tracked: bool,
}

impl DispatchState {
    pub fn clear(&mut self) {
        *self = DispatchState::default();
    }
}

/// Message access needed by the dispatcher
pub trait DispatchMessage {
    /// Request method, or the CSeq method for replies
    fn method(&self) -> &str;

    fn is_request(&self) -> bool;

    /// Status code of a reply
    fn status_code(&self) -> Option<u16>;

    fn call_id(&self) -> Option<&str>;

    fn from_uri(&self) -> Option<&str>;

    fn to_uri(&self) -> Option<&str>;

    /// Current Request-URI, including earlier rewrites
    fn request_uri(&self) -> &str;

    /// Username from Proxy-Authorization credentials
    fn proxy_auth_username(&self) -> Option<&str>;

    /// Username from Authorization credentials
    fn auth_username(&self) -> Option<&str>;

    fn destination_uri(&self) -> Option<&str>;

    /// Evaluate a configured expression against the message
    fn evaluate(&self, expression: &str) -> Option<String>;

    fn set_request_uri(&mut self, uri: &str) -> Result<()>;

    fn set_destination_uri(&mut self, uri: &str) -> Result<()>;

    fn set_force_socket(&mut self, socket: Option<&SocketSpec>);

    fn append_branch(&mut self, uri: &str, socket: Option<&SocketSpec>) -> Result<()>;

    fn dispatch_state(&self) -> &DispatchState;

    fn dispatch_state_mut(&mut self) -> &mut DispatchState;
}

/// Outgoing branch added to a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    pub uri: String,
    pub socket: Option<SocketSpec>,
}

/// Plain in-memory message, used by the CLI and by tests
#[derive(Debug, Clone, Default)]
pub struct BasicMessage {
    pub method: String,
    pub status_code: Option<u16>,
    pub request_uri: String,
    pub call_id: Option<String>,
    pub from_uri: Option<String>,
    pub to_uri: Option<String>,
    pub proxy_auth_username: Option<String>,
    pub auth_username: Option<String>,
    pub destination_uri: Option<String>,
    pub force_socket: Option<SocketSpec>,
    pub branches: Vec<Branch>,
    /// Values returned by [`DispatchMessage::evaluate`], keyed by expression
    pub variables: HashMap<String, String>,
    pub state: DispatchState,
}

impl BasicMessage {
    pub fn request(method: impl Into<String>, request_uri: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            request_uri: request_uri.into(),
            ..Default::default()
        }
    }

    /// Reply to a request with the given CSeq method
    pub fn reply(code: u16, cseq_method: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            method: cseq_method.into(),
            status_code: Some(code),
            call_id: Some(call_id.into()),
            ..Default::default()
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn with_from(mut self, uri: impl Into<String>) -> Self {
        self.from_uri = Some(uri.into());
        self
    }

    pub fn with_to(mut self, uri: impl Into<String>) -> Self {
        self.to_uri = Some(uri.into());
        self
    }

    pub fn with_auth_username(mut self, username: impl Into<String>) -> Self {
        self.auth_username = Some(username.into());
        self
    }

    pub fn with_proxy_auth_username(mut self, username: impl Into<String>) -> Self {
        self.proxy_auth_username = Some(username.into());
        self
    }

    pub fn with_variable(mut self, expression: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(expression.into(), value.into());
        self
    }
}

impl DispatchMessage for BasicMessage {
    fn method(&self) -> &str {
        &self.method
    }

    fn is_request(&self) -> bool {
        self.status_code.is_none()
    }

    fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    fn call_id(&self) -> Option<&str> {
        self.call_id.as_deref()
    }

    fn from_uri(&self) -> Option<&str> {
        self.from_uri.as_deref()
    }

    fn to_uri(&self) -> Option<&str> {
        self.to_uri.as_deref()
    }

    fn request_uri(&self) -> &str {
        &self.request_uri
    }

    fn proxy_auth_username(&self) -> Option<&str> {
        self.proxy_auth_username.as_deref()
    }

    fn auth_username(&self) -> Option<&str> {
        self.auth_username.as_deref()
    }

    fn destination_uri(&self) -> Option<&str> {
        self.destination_uri.as_deref()
    }

    fn evaluate(&self, expression: &str) -> Option<String> {
        self.variables.get(expression).cloned()
    }

    fn set_request_uri(&mut self, uri: &str) -> Result<()> {
        self.request_uri = uri.to_string();
        Ok(())
    }

    fn set_destination_uri(&mut self, uri: &str) -> Result<()> {
        self.destination_uri = Some(uri.to_string());
        Ok(())
    }

    fn set_force_socket(&mut self, socket: Option<&SocketSpec>) {
        self.force_socket = socket.cloned();
    }

    fn append_branch(&mut self, uri: &str, socket: Option<&SocketSpec>) -> Result<()> {
        self.branches.push(Branch {
            uri: uri.to_string(),
            socket: socket.cloned(),
        });
        Ok(())
    }

    fn dispatch_state(&self) -> &DispatchState {
        &self.state
    }

    fn dispatch_state_mut(&mut self) -> &mut DispatchState {
        &mut self.state
    }
}
