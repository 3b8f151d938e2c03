use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use scopewire_socket::PeerInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cancel::CancelToken;
use crate::error::{Fault, RpcError};
use crate::signature::Signature;

/// Reserved operation listing every command.
pub const DESCRIBE: &str = "__describe__";

/// Command implementation.
pub type Handler = Arc<dyn Fn(&Call, &CallContext) -> Result<Output, Fault> + Send + Sync>;

/// Runs when a client connection is lost.
pub type DisconnectHook = Arc<dyn Fn(&PeerInfo) + Send + Sync>;

/// A payload that travels through shared memory for local clients and as
/// packed bytes for remote ones.
pub trait Transferable: Send {
    /// Register a handoff to `peer` and return the buffer name.
    fn hand_off(self: Box<Self>, peer: &PeerInfo) -> Result<String, Fault>;

    /// Serialize the payload for a `binary` reply.
    fn pack(self: Box<Self>) -> Result<Bytes, Fault>;
}

/// What a handler returns.
pub enum Output {
    Value(Value),
    Binary(Bytes),
    Transfer(Box<dyn Transferable>),
}

impl Output {
    /// JSON `null`.
    pub fn none() -> Self {
        Self::Value(Value::Null)
    }

    pub fn value<T: Serialize>(value: &T) -> Result<Self, Fault> {
        Ok(Self::Value(serde_json::to_value(value)?))
    }
}

impl From<Value> for Output {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Binary(bytes) => write!(f, "Binary({} bytes)", bytes.len()),
            Self::Transfer(_) => f.write_str("Transfer(..)"),
        }
    }
}

/// Per-call state handed to every handler.
#[derive(Debug, Clone)]
pub struct CallContext {
    /// Connection the call arrived on.
    pub peer: Arc<PeerInfo>,
    /// Cancelled by the interrupt channel.
    pub cancel: CancelToken,
    pub call_id: Option<String>,
}

impl CallContext {
    pub fn new(peer: Arc<PeerInfo>) -> Self {
        Self {
            peer,
            cancel: CancelToken::new(),
            call_id: None,
        }
    }

    /// Context for invoking commands in-process.
    pub fn in_process() -> Self {
        Self::new(Arc::new(PeerInfo {
            peer_id: "in-process".to_string(),
            node: scopewire_transport::node_name(),
            local: true,
            transport: "in-process",
        }))
    }

    pub fn is_local(&self) -> bool {
        self.peer.local
    }
}

/// Arguments of one call, resolved against the command's signature.
#[derive(Debug, Clone)]
pub struct Call {
    path: String,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    signature: Arc<Signature>,
}

impl Call {
    pub fn new(
        path: impl Into<String>,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        signature: Arc<Signature>,
    ) -> Self {
        Self {
            path: path.into(),
            args,
            kwargs,
            signature,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn kwargs(&self) -> &Map<String, Value> {
        &self.kwargs
    }

    /// Positional arguments beyond the declared parameters.
    pub fn varargs(&self) -> &[Value] {
        self.args.get(self.signature.params.len()..).unwrap_or(&[])
    }

    /// Raw value of parameter `name`: positional, then keyword, then default.
    pub fn raw(&self, name: &str) -> Option<&Value> {
        let index = self.signature.position(name);
        if let Some(value) = index.and_then(|i| self.args.get(i)) {
            return Some(value);
        }
        if let Some(value) = self.kwargs.get(name) {
            return Some(value);
        }
        index.and_then(|i| self.signature.params[i].default.as_ref())
    }

    /// Deserialize parameter `name`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T, Fault> {
        let value = self
            .raw(name)
            .ok_or_else(|| Fault::bad_request(format!("missing argument '{name}'")))?;
        serde_json::from_value(value.clone())
            .map_err(|err| Fault::bad_request(format!("argument '{name}': {err}")))
    }

    /// Like [`arg`](Self::arg) but absent or `null` gives `None`.
    pub fn opt_arg<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, Fault> {
        match self.raw(name) {
            None | Some(Value::Null) => Ok(None),
            Some(_) => self.arg(name).map(Some),
        }
    }
}

/// Public description of a command, as returned by `__describe__`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub path: String,
    #[serde(flatten)]
    pub signature: Signature,
    #[serde(default)]
    pub doc: String,
}

/// A registered command.
#[derive(Clone)]
pub struct Command {
    path: String,
    signature: Arc<Signature>,
    doc: String,
    handler: Handler,
}

impl Command {
    pub fn new<F>(path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Call, &CallContext) -> Result<Output, Fault> + Send + Sync + 'static,
    {
        Self {
            path: path.into(),
            signature: Arc::new(Signature::new()),
            doc: String::new(),
            handler: Arc::new(handler),
        }
    }

    pub fn signature(mut self, signature: Signature) -> Self {
        self.signature = Arc::new(signature);
        self
    }

    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn descriptor(&self) -> CommandDescriptor {
        CommandDescriptor {
            path: self.path.clone(),
            signature: (*self.signature).clone(),
            doc: self.doc.clone(),
        }
    }

    /// Check the arguments against the signature, then run the handler.
    pub fn invoke(
        &self,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
        ctx: &CallContext,
    ) -> Result<Output, Fault> {
        self.signature
            .bind(&args, &kwargs)
            .map_err(|reason| Fault::bad_request(format!("{}: {reason}", self.path)))?;
        let call = Call::new(self.path.clone(), args, kwargs, Arc::clone(&self.signature));
        (self.handler)(&call, ctx)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("path", &self.path)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// An object that mounts a group of commands under a prefix.
pub trait Capability: Send + Sync + 'static {
    fn register(self: Arc<Self>, scope: &mut Scope<'_>);
}

/// Frozen command table.
#[derive(Default)]
pub struct Namespace {
    commands: BTreeMap<String, Command>,
    disconnect_hooks: Vec<DisconnectHook>,
}

impl Namespace {
    pub fn builder() -> NamespaceBuilder {
        NamespaceBuilder::default()
    }

    pub fn get(&self, path: &str) -> Option<&Command> {
        self.commands.get(path)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.commands.keys().map(String::as_str)
    }

    /// Every command, sorted by path.
    pub fn describe(&self) -> Vec<CommandDescriptor> {
        self.commands.values().map(Command::descriptor).collect()
    }

    pub(crate) fn disconnect_hooks(&self) -> &[DisconnectHook] {
        &self.disconnect_hooks
    }
}

/// Collects commands before the namespace is frozen.
#[derive(Default)]
pub struct NamespaceBuilder {
    commands: BTreeMap<String, Command>,
    disconnect_hooks: Vec<DisconnectHook>,
    duplicates: Vec<String>,
}

impl NamespaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command at its own path.
    pub fn add(&mut self, command: Command) -> &mut Self {
        let path = command.path.clone();
        if path == DESCRIBE || self.commands.contains_key(&path) {
            self.duplicates.push(path);
        } else {
            self.commands.insert(path, command);
        }
        self
    }

    /// Let `capability` register its commands under `prefix`.
    pub fn mount<C: Capability>(&mut self, prefix: &str, capability: Arc<C>) -> &mut Self {
        let mut scope = Scope {
            prefix: prefix.trim_matches('.').to_string(),
            builder: self,
        };
        capability.register(&mut scope);
        self
    }

    pub fn on_disconnect<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        self.disconnect_hooks.push(Arc::new(hook));
        self
    }

    /// Freeze the table. Fails if any path was registered twice.
    pub fn build(self) -> Result<Namespace, RpcError> {
        if let Some(path) = self.duplicates.into_iter().next() {
            return Err(RpcError::DuplicateCommand(path));
        }
        Ok(Namespace {
            commands: self.commands,
            disconnect_hooks: self.disconnect_hooks,
        })
    }
}

/// Registration view handed to a [`Capability`]; paths are relative to its prefix.
pub struct Scope<'a> {
    prefix: String,
    builder: &'a mut NamespaceBuilder,
}

impl Scope<'_> {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full path of `name` under this scope.
    pub fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.prefix)
        }
    }

    /// Register a command whose path is relative to this scope.
    pub fn add(&mut self, mut command: Command) -> &mut Self {
        command.path = self.path(&command.path);
        self.builder.add(command);
        self
    }

    /// Mount a nested capability under `name`.
    pub fn mount<C: Capability>(&mut self, name: &str, capability: Arc<C>) -> &mut Self {
        let prefix = self.path(name);
        self.builder.mount(&prefix, capability);
        self
    }

    pub fn on_disconnect<F>(&mut self, hook: F) -> &mut Self
    where
        F: Fn(&PeerInfo) + Send + Sync + 'static,
    {
        self.builder.on_disconnect(hook);
        self
    }
}
