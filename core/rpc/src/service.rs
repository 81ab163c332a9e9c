// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Service descriptors and the registry the server dispatches through
//!
//! A [`Service`] groups the callable methods of one receiver value under a
//! name. Methods are registered explicitly through [`ServiceBuilder::method`]
//! with an async handler of shape `Fn(Arc<R>, Args) -> Future<Result<Reply, E>>`.
//! Argument and reply types only need serde bounds, so any shape that cannot
//! be decoded from a request body or encoded into a response body is rejected
//! by the compiler instead of at registration time.

use std::any::{Any, type_name};
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::codec::CodecType;
use crate::error::{Result, RpcError};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Outcome of one invocation: the encoded reply, or the method's error text.
pub type InvokeResult = std::result::Result<Bytes, String>;

type DecodeFn = Box<dyn Fn(CodecType, &[u8]) -> Result<Argument> + Send + Sync>;
type InvokeFn = Box<dyn Fn(Argument, CodecType) -> BoxFuture<InvokeResult> + Send + Sync>;

/// A decoded request argument, ready to be passed to the method it was
/// decoded for.
pub struct Argument(Box<dyn Any + Send>);

/// A callable method of a registered service.
pub struct MethodDescriptor {
    name: String,
    arg_type: &'static str,
    reply_type: &'static str,
    num_calls: AtomicU64,
    decode: DecodeFn,
    invoke: InvokeFn,
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("arg_type", &self.arg_type)
            .field("reply_type", &self.reply_type)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arg_type(&self) -> &'static str {
        self.arg_type
    }

    pub fn reply_type(&self) -> &'static str {
        self.reply_type
    }

    /// Number of invocations so far, failed ones included.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    /// Decode a request body into a fresh argument for this method.
    pub fn new_argv(&self, codec: CodecType, body: &[u8]) -> Result<Argument> {
        (self.decode)(codec, body)
    }

    /// Invoke the method. The returned future owns everything it needs and
    /// can be spawned.
    pub fn call(&self, argv: Argument, codec: CodecType) -> BoxFuture<InvokeResult> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.invoke)(argv, codec)
    }
}

/// A named receiver and its callable methods.
#[derive(Debug)]
pub struct Service {
    name: String,
    receiver_type: &'static str,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    pub fn builder<R>(name: impl Into<String>, receiver: R) -> ServiceBuilder<R>
    where
        R: Send + Sync + 'static,
    {
        ServiceBuilder::new(name, Arc::new(receiver))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn receiver_type(&self) -> &'static str {
        self.receiver_type
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(name)
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

pub struct ServiceBuilder<R> {
    name: String,
    receiver: Arc<R>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl<R> ServiceBuilder<R>
where
    R: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, receiver: Arc<R>) -> Self {
        ServiceBuilder {
            name: name.into(),
            receiver,
            methods: HashMap::new(),
        }
    }

    /// Add a method. Names that cannot be addressed as "Service.Method"
    /// (empty, or containing '.') are skipped.
    pub fn method<A, Rp, E, F, Fut>(mut self, name: &str, method: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        Rp: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(Arc<R>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Rp, E>> + Send + 'static,
    {
        if name.is_empty() || name.contains('.') {
            debug!(service = %self.name, method = %name, "skipping method with unroutable name");
            return self;
        }

        let decode: DecodeFn = Box::new(|codec: CodecType, body: &[u8]| -> Result<Argument> {
            let argv: A = codec.decode(body)?;
            Ok(Argument(Box::new(argv)))
        });

        let receiver = self.receiver.clone();
        let method = Arc::new(method);
        let invoke: InvokeFn = Box::new(move |argv: Argument, codec: CodecType| {
            let receiver = receiver.clone();
            let method = method.clone();
            Box::pin(async move {
                let argv = argv
                    .0
                    .downcast::<A>()
                    .map_err(|_| format!("rpc server: argument is not a {}", type_name::<A>()))?;

                let reply = (*method)(receiver, *argv)
                    .await
                    .map_err(|e| e.to_string())?;
                codec
                    .encode(&reply)
                    .map(Bytes::from)
                    .map_err(|e| e.to_string())
            })
        });

        self.methods.insert(
            name.to_string(),
            Arc::new(MethodDescriptor {
                name: name.to_string(),
                arg_type: type_name::<A>(),
                reply_type: type_name::<Rp>(),
                num_calls: AtomicU64::new(0),
                decode,
                invoke,
            }),
        );

        self
    }

    pub fn build(self) -> Result<Service> {
        if self.name.is_empty() || self.name.chars().any(char::is_whitespace) {
            return Err(RpcError::InvalidServiceName(self.name));
        }

        Ok(Service {
            name: self.name,
            receiver_type: type_name::<R>(),
            methods: self.methods,
        })
    }
}

/// Name to service map shared by every connection of a server.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        ServiceRegistry::default()
    }

    /// Publish a service. Names are unique for the lifetime of the registry.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.services.write();
        if services.contains_key(service.name()) {
            return Err(RpcError::ServiceAlreadyDefined(service.name.clone()));
        }

        for method in service.methods.values() {
            info!(
                "rpc server: register {}.{} ({} -> {})",
                service.name,
                method.name(),
                method.arg_type(),
                method.reply_type()
            );
        }

        services.insert(service.name.clone(), Arc::new(service));
        Ok(())
    }

    /// Resolve "Service.Method". The split happens at the last '.', so
    /// service names may themselves contain dots.
    pub fn lookup(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodDescriptor>)> {
        let Some((service_name, method_name)) = service_method.rsplit_once('.') else {
            return Err(RpcError::IllFormedServiceMethod(service_method.to_string()));
        };

        let service = self
            .services
            .read()
            .get(service_name)
            .cloned()
            .ok_or_else(|| RpcError::ServiceNotFound(service_name.to_string()))?;

        let method = service
            .method(method_name)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method_name.to_string()))?;

        Ok((service, method))
    }

    /// Registered service names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.read().keys().cloned().collect();
        names.sort_unstable();
        names
    }

    pub fn get(&self, name: &str) -> Option<Arc<Service>> {
        self.services.read().get(name).cloned()
    }
}
