use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::client::RpcClient;
use crate::envelope::Reply;
use crate::error::RpcError;
use crate::namespace::CommandDescriptor;
use crate::signature::Signature;
use crate::Result;

/// Client-side handle for one remote command.
#[derive(Debug, Clone)]
pub struct Stub {
    descriptor: CommandDescriptor,
}

impl Stub {
    pub fn path(&self) -> &str {
        &self.descriptor.path
    }

    pub fn doc(&self) -> &str {
        &self.descriptor.doc
    }

    pub fn signature(&self) -> &Signature {
        &self.descriptor.signature
    }

    /// Last path segment.
    pub fn name(&self) -> &str {
        self.path().rsplit('.').next().unwrap_or_default()
    }

    /// Reject arguments the server would refuse, without a round trip.
    pub fn check(&self, args: &[Value], kwargs: &Map<String, Value>) -> Result<()> {
        self.signature()
            .bind(args, kwargs)
            .map_err(|reason| RpcError::Arguments {
                path: self.path().to_string(),
                reason,
            })
    }
}

/// Typed view of a server built from its `__describe__` listing.
///
/// Commands named `get_x` / `set_x` in the same namespace are also exposed
/// as a property `x`.
pub struct Proxy {
    client: RpcClient,
    stubs: BTreeMap<String, Stub>,
}

impl Proxy {
    /// Query the listing once and build stubs.
    pub fn new(mut client: RpcClient) -> Result<Self> {
        let stubs = client
            .describe()?
            .into_iter()
            .map(|descriptor| (descriptor.path.clone(), Stub { descriptor }))
            .collect();
        Ok(Self { client, stubs })
    }

    pub fn client(&mut self) -> &mut RpcClient {
        &mut self.client
    }

    pub fn stub(&self, path: &str) -> Option<&Stub> {
        self.stubs.get(path)
    }

    pub fn stubs(&self) -> impl Iterator<Item = &Stub> {
        self.stubs.values()
    }

    /// Everything under `prefix` (`""` for the root).
    pub fn namespace(&self, prefix: &str) -> NamespaceView<'_> {
        NamespaceView {
            proxy: self,
            prefix: prefix.trim_matches('.').to_string(),
        }
    }

    /// Check arguments against the stub, then call.
    pub fn call(&mut self, path: &str, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Reply> {
        let stub = self
            .stubs
            .get(path)
            .ok_or_else(|| RpcError::UnknownCommand(path.to_string()))?;
        stub.check(&args, &kwargs)?;
        self.client.call(path, args, kwargs)
    }

    pub fn call_value(
        &mut self,
        path: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> Result<Value> {
        match self.call(path, args, kwargs)? {
            Reply::Value(value) => Ok(value),
            Reply::Error(fault) => Err(RpcError::Remote(fault)),
            Reply::Binary(_) => Err(RpcError::Protocol(format!("'{path}' returned binary"))),
        }
    }

    /// Read property `ns.name` through `ns.get_name`.
    pub fn get_property(&mut self, path: &str) -> Result<Value> {
        let getter = accessor(path, "get_");
        self.call_value(&getter, Vec::new(), Map::new())
    }

    /// Write property `ns.name` through `ns.set_name`.
    pub fn set_property(&mut self, path: &str, value: Value) -> Result<()> {
        let setter = accessor(path, "set_");
        if !self.stubs.contains_key(&setter) {
            return Err(RpcError::UnknownCommand(setter));
        }
        self.call_value(&setter, vec![value], Map::new())?;
        Ok(())
    }
}

fn accessor(path: &str, verb: &str) -> String {
    match path.rsplit_once('.') {
        Some((namespace, name)) => format!("{namespace}.{verb}{name}"),
        None => format!("{verb}{path}"),
    }
}

/// A property found through getter/setter pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyStub {
    pub name: String,
    pub writable: bool,
}

/// One level of the dotted command tree.
pub struct NamespaceView<'a> {
    proxy: &'a Proxy,
    prefix: String,
}

impl<'a> NamespaceView<'a> {
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn relative<'p>(&self, path: &'p str) -> Option<&'p str> {
        if self.prefix.is_empty() {
            Some(path)
        } else {
            path.strip_prefix(self.prefix.as_str())?.strip_prefix('.')
        }
    }

    /// Names of nested namespaces.
    pub fn children(&self) -> Vec<String> {
        let names: BTreeSet<&str> = self
            .proxy
            .stubs
            .keys()
            .filter_map(|path| self.relative(path))
            .filter_map(|rest| rest.split_once('.').map(|(head, _)| head))
            .collect();
        names.into_iter().map(str::to_string).collect()
    }

    /// Commands directly in this namespace.
    pub fn commands(&self) -> Vec<&'a Stub> {
        let proxy = self.proxy;
        proxy
            .stubs
            .values()
            .filter(|stub| self.relative(stub.path()).is_some_and(|rest| !rest.contains('.')))
            .collect()
    }

    /// Properties paired from `get_*` commands, writable when `set_*` exists.
    pub fn properties(&self) -> Vec<PropertyStub> {
        let commands = self.commands();
        let names: BTreeSet<&str> = commands.iter().map(|stub| stub.name()).collect();
        names
            .iter()
            .filter_map(|name| name.strip_prefix("get_"))
            .map(|name| PropertyStub {
                name: name.to_string(),
                writable: names.contains(format!("set_{name}").as_str()),
            })
            .collect()
    }

    pub fn namespace(&self, child: &str) -> NamespaceView<'a> {
        let prefix = if self.prefix.is_empty() {
            child.to_string()
        } else {
            format!("{}.{child}", self.prefix)
        };
        NamespaceView {
            proxy: self.proxy,
            prefix,
        }
    }
}
