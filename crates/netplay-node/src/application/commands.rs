//! The command table: an explicit mapping from command name to argument
//! schema and handler, built at startup.
//!
//! Commands are the unit of remote dispatch. Instead of discovering
//! remote-callable methods dynamically at call time, every command is
//! registered up front with its positional argument schema; the schema is
//! checked before any handler runs, on both the sending and the receiving
//! side.
//!
//! Unhandled-name policy:
//!
//! - A **local** dispatch of an unregistered name is a programmer error and
//!   returns [`CommandError::UnknownCommand`].
//! - An **inbound remote** frame naming an unknown command is logged at
//!   `warn` and dropped ([`CommandRegistry::invoke_remote`]), so a peer
//!   running a slightly newer build cannot crash the session. The same
//!   leniency applies to a remote schema mismatch.

use std::collections::HashMap;
use std::net::SocketAddr;

use thiserror::Error;
use tracing::warn;

use netplay_core::protocol::messages::{
    ArgKind, ArgValue, DispatchScope, DispatchTarget, Durability, PeerId,
};
use netplay_core::ConnectError;

/// Error type for command registration and local dispatch.
#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    /// A command with this name is already in the table.
    #[error("command {0:?} is already registered")]
    DuplicateName(String),

    /// Local dispatch named a command that was never registered.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// The argument list does not match the registered schema.
    #[error("command {name:?} expects {expected:?}, got {got:?}")]
    SchemaMismatch {
        name: String,
        expected: Vec<ArgKind>,
        got: Vec<ArgKind>,
    },
}

/// Where a dispatched command came from, as seen by its handler.
#[derive(Debug, Clone)]
pub struct DispatchOrigin {
    /// Peer the dispatch originated from. The local peer's own id for local
    /// dispatches.
    pub sender: PeerId,
    /// Source address of the originating connection. `None` for local
    /// dispatches.
    pub remote_addr: Option<SocketAddr>,
    /// What the command was addressed to.
    pub target: DispatchTarget,
    /// `true` when the handler is running on the peer that issued the
    /// dispatch (local execution of an `All` broadcast, or a purely local
    /// session).
    pub is_local: bool,
}

/// A dispatch a handler wants to issue in response to the one it is
/// handling. Collected here and flushed by the director after the handler
/// returns, so handlers never need a reference back into the director.
#[derive(Debug, Clone)]
pub struct QueuedDispatch {
    pub target: DispatchTarget,
    pub name: String,
    pub args: Vec<ArgValue>,
    pub durability: Durability,
    pub scope: DispatchScope,
}

/// Side effects a handler may request beyond queued dispatches.
#[derive(Debug, Default)]
pub struct Outbox {
    dispatches: Vec<QueuedDispatch>,
    disconnect: Option<ConnectError>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a follow-up dispatch, routed by the director through the same
    /// path as a caller-issued one.
    pub fn dispatch(
        &mut self,
        target: DispatchTarget,
        name: &str,
        args: Vec<ArgValue>,
        durability: Durability,
        scope: DispatchScope,
    ) {
        self.dispatches.push(QueuedDispatch {
            target,
            name: name.to_string(),
            args,
            durability,
            scope,
        });
    }

    /// Asks the director to tear the session down. Used by a client whose
    /// join was rejected; the reason surfaces as a `JoinRejected` event.
    pub fn request_disconnect(&mut self, reason: ConnectError) {
        self.disconnect = Some(reason);
    }

    pub(crate) fn take_dispatches(&mut self) -> Vec<QueuedDispatch> {
        std::mem::take(&mut self.dispatches)
    }

    pub(crate) fn take_disconnect(&mut self) -> Option<ConnectError> {
        self.disconnect.take()
    }
}

/// Handler signature. Handlers run on the tick thread only; `Send` is
/// required because the registry lives inside the director, which moves
/// across await points in async tests.
pub type HandlerFn = Box<dyn FnMut(&DispatchOrigin, &[ArgValue], &mut Outbox) + Send>;

struct CommandSpec {
    schema: Vec<ArgKind>,
    handler: HandlerFn,
}

/// The explicit command table.
#[derive(Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandSpec>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a command to the table.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::DuplicateName`] when the name is taken –
    /// command names are a session-wide contract, so a collision is always
    /// a wiring mistake.
    pub fn register(
        &mut self,
        name: &str,
        schema: Vec<ArgKind>,
        handler: HandlerFn,
    ) -> Result<(), CommandError> {
        if self.commands.contains_key(name) {
            return Err(CommandError::DuplicateName(name.to_string()));
        }
        self.commands
            .insert(name.to_string(), CommandSpec { schema, handler });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered schema for `name`, if any.
    pub fn schema(&self, name: &str) -> Option<&[ArgKind]> {
        self.commands.get(name).map(|spec| spec.schema.as_slice())
    }

    /// Checks a name and argument list against the table without invoking
    /// anything. Used before putting a dispatch on the wire.
    pub fn validate(&self, name: &str, args: &[ArgValue]) -> Result<(), CommandError> {
        let spec = self
            .commands
            .get(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        check_schema(name, &spec.schema, args)
    }

    /// Strict invocation for local dispatches: unknown names and schema
    /// mismatches are errors.
    pub fn invoke(
        &mut self,
        name: &str,
        origin: &DispatchOrigin,
        args: &[ArgValue],
        outbox: &mut Outbox,
    ) -> Result<(), CommandError> {
        let spec = self
            .commands
            .get_mut(name)
            .ok_or_else(|| CommandError::UnknownCommand(name.to_string()))?;
        check_schema(name, &spec.schema, args)?;
        (spec.handler)(origin, args, outbox);
        Ok(())
    }

    /// Lenient invocation for inbound remote frames: unknown names and
    /// mismatched schemas are logged and dropped.
    pub fn invoke_remote(
        &mut self,
        name: &str,
        origin: &DispatchOrigin,
        args: &[ArgValue],
        outbox: &mut Outbox,
    ) {
        let Some(spec) = self.commands.get_mut(name) else {
            warn!("dropping remote dispatch of unknown command {name:?}");
            return;
        };
        if let Err(e) = check_schema(name, &spec.schema, args) {
            warn!("dropping remote dispatch: {e}");
            return;
        }
        (spec.handler)(origin, args, outbox);
    }
}

fn check_schema(name: &str, schema: &[ArgKind], args: &[ArgValue]) -> Result<(), CommandError> {
    let got: Vec<ArgKind> = args.iter().map(ArgValue::kind).collect();
    if got != schema {
        return Err(CommandError::SchemaMismatch {
            name: name.to_string(),
            expected: schema.to_vec(),
            got,
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn local_origin() -> DispatchOrigin {
        DispatchOrigin {
            sender: 0,
            remote_addr: None,
            target: DispatchTarget::Session,
            is_local: true,
        }
    }

    #[test]
    fn test_register_rejects_duplicate_name() {
        let mut registry = CommandRegistry::new();
        registry
            .register("a", vec![], Box::new(|_, _, _| {}))
            .unwrap();
        let result = registry.register("a", vec![ArgKind::Int], Box::new(|_, _, _| {}));
        assert_eq!(result, Err(CommandError::DuplicateName("a".to_string())));
    }

    #[test]
    fn test_invoke_unknown_command_is_an_error() {
        let mut registry = CommandRegistry::new();
        let mut outbox = Outbox::new();
        let result = registry.invoke("missing", &local_origin(), &[], &mut outbox);
        assert_eq!(
            result,
            Err(CommandError::UnknownCommand("missing".to_string()))
        );
    }

    #[test]
    fn test_invoke_checks_schema_before_running_handler() {
        let ran = Arc::new(Mutex::new(false));
        let ran_clone = Arc::clone(&ran);

        let mut registry = CommandRegistry::new();
        registry
            .register(
                "typed",
                vec![ArgKind::Int, ArgKind::Str],
                Box::new(move |_, _, _| *ran_clone.lock().unwrap() = true),
            )
            .unwrap();

        let mut outbox = Outbox::new();
        let result = registry.invoke(
            "typed",
            &local_origin(),
            &[ArgValue::Str("wrong order".to_string()), ArgValue::Int(1)],
            &mut outbox,
        );

        assert!(matches!(result, Err(CommandError::SchemaMismatch { .. })));
        assert!(!*ran.lock().unwrap(), "handler must not run on mismatch");
    }

    #[test]
    fn test_invoke_passes_args_to_handler() {
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        let mut registry = CommandRegistry::new();
        registry
            .register(
                "echo",
                vec![ArgKind::Int],
                Box::new(move |_, args, _| {
                    if let ArgValue::Int(v) = &args[0] {
                        *seen_clone.lock().unwrap() = Some(*v);
                    }
                }),
            )
            .unwrap();

        let mut outbox = Outbox::new();
        registry
            .invoke("echo", &local_origin(), &[ArgValue::Int(42)], &mut outbox)
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn test_invoke_remote_silently_drops_unknown_command() {
        let mut registry = CommandRegistry::new();
        let mut outbox = Outbox::new();
        // Must not panic or error.
        registry.invoke_remote("missing", &local_origin(), &[], &mut outbox);
    }

    #[test]
    fn test_invoke_remote_drops_schema_mismatch_without_running_handler() {
        let ran = Arc::new(Mutex::new(false));
        let ran_clone = Arc::clone(&ran);

        let mut registry = CommandRegistry::new();
        registry
            .register(
                "typed",
                vec![ArgKind::Bool],
                Box::new(move |_, _, _| *ran_clone.lock().unwrap() = true),
            )
            .unwrap();

        let mut outbox = Outbox::new();
        registry.invoke_remote("typed", &local_origin(), &[ArgValue::Int(1)], &mut outbox);
        assert!(!*ran.lock().unwrap());
    }

    #[test]
    fn test_handler_can_queue_follow_up_dispatches() {
        let mut registry = CommandRegistry::new();
        registry
            .register(
                "ask",
                vec![],
                Box::new(|origin, _, outbox| {
                    outbox.dispatch(
                        DispatchTarget::Session,
                        "answer",
                        vec![ArgValue::Int(7)],
                        Durability::Transient,
                        DispatchScope::Single(origin.sender),
                    );
                }),
            )
            .unwrap();

        let mut outbox = Outbox::new();
        registry
            .invoke("ask", &local_origin(), &[], &mut outbox)
            .unwrap();

        let queued = outbox.take_dispatches();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].name, "answer");
        assert_eq!(queued[0].scope, DispatchScope::Single(0));
    }
}
